// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Demo of live views over a Postgres table.
//!
//! Run `dogs watch` in one terminal and `dogs add --name Fido` in
//! another (or insert/update/delete rows with psql): the watcher prints
//! every change as the database pushes it.

#![deny(missing_debug_implementations)]

use std::process;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;

use mz_live_view::{ColumnSpec, Db, RowData, RowEvent, ViewConfig, ViewEvent};

/// The table watched and written by every subcommand.
const TABLE: &str = "my_dogs";

#[derive(Debug, Parser)]
#[command(name = "dogs", about = "live view demo")]
struct Args {
    /// Postgres connection string.
    #[arg(long, env = "POSTGRES_URL", default_value = "host=localhost user=postgres")]
    url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Watch the table and print every change until interrupted.
    Watch,
    /// Add a dog.
    Add {
        /// The new dog's name.
        #[arg(long)]
        name: String,
        /// The new dog's age, in years.
        #[arg(long, default_value_t = 1)]
        age: i32,
        /// The new dog's weight, in kilograms.
        #[arg(long, default_value_t = 10.0)]
        weight: f64,
    },
    /// Drop the demo table.
    Reset,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run(Args::parse()).await {
        eprintln!("ERROR: {e:#}");
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let db = Db::open(&args.url).context("opening database")?;
    match args.command {
        Command::Watch => watch(&db).await?,
        Command::Add { name, age, weight } => add(&db, name, age, weight).await?,
        Command::Reset => {
            db.pool()
                .batch_execute(&format!("DROP TABLE IF EXISTS {TABLE}"))
                .await
                .context("dropping table")?;
            println!("dropped {TABLE}");
        }
    }
    db.close().await;
    Ok(())
}

fn dogs_config() -> Result<ViewConfig> {
    let columns =
        ColumnSpec::parse([("name", "string"), ("age", "integer"), ("weight", "number")])?;
    Ok(ViewConfig::new(TABLE).create_with_columns(columns))
}

async fn watch(db: &Db) -> Result<()> {
    let view = db.live_view(dogs_config()?)?;
    let mut events = view.events();
    view.connect().await.context("connecting view")?;
    println!("watching {TABLE}; ctrl-c to stop");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ViewEvent::Appeared(row)) => {
                    println!("+ {}", render(&row.fields()));
                    let mut row_events = row.events();
                    tokio::spawn(async move {
                        while let Some(event) = row_events.recv().await {
                            match event {
                                RowEvent::Changed { row, .. } => {
                                    println!("~ {}", render(&row.fields()));
                                }
                                RowEvent::Disappeared(partial) => {
                                    println!("- {}", render(&partial));
                                }
                                RowEvent::IdAssigned(_) => {}
                            }
                        }
                    });
                }
                Some(ViewEvent::Stable) => println!("(stable)"),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

async fn add(db: &Db, name: String, age: i32, weight: f64) -> Result<()> {
    let view = db.live_view(dogs_config()?)?;
    let mut fields = RowData::new();
    fields.insert("name".to_owned(), json!(name));
    fields.insert("age".to_owned(), json!(age));
    fields.insert("weight".to_owned(), json!(weight));
    let row = view.add(fields).await.context("adding row")?;
    println!("added {}", render(&row.fields()));
    Ok(())
}

fn render(fields: &RowData) -> String {
    let id = fields.get("id").cloned().unwrap_or(json!(null));
    let name = fields.get("name").and_then(|v| v.as_str()).unwrap_or("?");
    let age = fields.get("age").cloned().unwrap_or(json!(null));
    format!("id={id} name={name} age={age}")
}
