// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Live, incrementally synchronized in-memory mirrors of Postgres tables.
//!
//! A [`View`] watches one table: connecting installs a trigger-based
//! change feed (LISTEN/NOTIFY), loads a snapshot, and from then on keeps
//! an in-memory row cache converged with the table by applying feed
//! messages in arrival order. Local writes go through the same cycle:
//! they are submitted to the database and only considered confirmed when
//! their own feed message comes back.
//!
//! New-row ids come from an [`IdDispenser`] that pre-fetches blocks from
//! a sequence, so issuing an id is normally a pure in-memory increment.
//! A [`Db`] registry shares one pool and one dispenser across views.
//!
//! ```no_run
//! use mz_live_view::{Db, RowData, ViewConfig, ViewEvent};
//!
//! # async fn example() -> Result<(), mz_live_view::Error> {
//! let db = Db::open("host=localhost user=postgres")?;
//! let dogs = db.live_view(ViewConfig::new("my_dogs"))?;
//! let mut events = dogs.events();
//! dogs.connect().await?;
//!
//! let mut fields = RowData::new();
//! fields.insert("name".into(), "Fido".into());
//! let fido = dogs.add(fields).await?;
//! fido.set("name", "Rex".into())?;
//!
//! while let Some(event) = events.recv().await {
//!     if let ViewEvent::Appeared(row) = event {
//!         println!("row {}: {:?}", row.id(), row.fields());
//!     }
//! }
//! db.close().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs, missing_debug_implementations)]

mod config;
mod db;
mod dispenser;
mod error;
mod feed;
mod pool;
mod row;
mod schema;
mod view;

pub use crate::config::ViewConfig;
pub use crate::db::Db;
pub use crate::dispenser::{
    IdDispenser, IdDispenserConfig, DEFAULT_BLOCK_SIZE, DEFAULT_SEQUENCE,
};
pub use crate::error::Error;
pub use crate::feed::ChangeEvent;
pub use crate::pool::{Pool, Subscription};
pub use crate::row::{Row, RowData, RowEvent};
pub use crate::schema::{ColumnSpec, FieldType};
pub use crate::view::{View, ViewEvent, ViewState};
