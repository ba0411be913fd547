// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The transport layer: a deadpool-backed connection pool plus dedicated
//! subscription connections for LISTEN/NOTIFY.
//!
//! Ordinary statements run on pooled connections. Push notifications
//! cannot, because a pooled connection may be recycled at any time; a
//! [`Subscription`] therefore owns its own `tokio_postgres` connection
//! for as long as the listen is active.

use std::fmt;

use deadpool_postgres::{Manager, ManagerConfig, Object, RecyclingMethod};
use futures::StreamExt;
use postgres_protocol::escape::escape_identifier;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_postgres::types::ToSql;
use tokio_postgres::{AsyncMessage, NoTls, Notification};
use tracing::{debug, warn};

use crate::error::Error;

/// Connections kept by each pool. Views share pools, so this stays small.
const POOL_MAX_SIZE: usize = 16;

/// A handle to a pool of Postgres connections, cheap to clone and share.
#[derive(Clone)]
pub struct Pool {
    inner: deadpool_postgres::Pool,
    config: tokio_postgres::Config,
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool").finish_non_exhaustive()
    }
}

impl Pool {
    /// Opens a pool for the database at `url` (any connection string
    /// accepted by `tokio_postgres`). No connection is established until
    /// the first statement runs.
    pub fn open(url: &str) -> Result<Pool, Error> {
        let config: tokio_postgres::Config = url.parse()?;
        Ok(Pool::from_config(config))
    }

    /// Opens a pool from an already-parsed configuration.
    pub fn from_config(config: tokio_postgres::Config) -> Pool {
        let manager = Manager::from_config(
            config.clone(),
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let inner = deadpool_postgres::Pool::builder(manager)
            .max_size(POOL_MAX_SIZE)
            .build()
            .expect("pool built without a runtime config cannot fail");
        Pool { inner, config }
    }

    /// Checks out a pooled connection, e.g. to run a transaction.
    pub async fn get_connection(&self) -> Result<Object, Error> {
        Ok(self.inner.get().await?)
    }

    /// Executes a statement, returning the resulting rows.
    pub async fn query(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<tokio_postgres::Row>, Error> {
        let client = self.get_connection().await?;
        let statement = client.prepare_cached(sql).await?;
        Ok(client.query(&statement, params).await?)
    }

    /// Executes a statement that must return exactly one row.
    pub async fn query_one(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<tokio_postgres::Row, Error> {
        let client = self.get_connection().await?;
        let statement = client.prepare_cached(sql).await?;
        Ok(client.query_one(&statement, params).await?)
    }

    /// Executes a statement, returning the number of affected rows.
    pub async fn execute(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<u64, Error> {
        let client = self.get_connection().await?;
        let statement = client.prepare_cached(sql).await?;
        Ok(client.execute(&statement, params).await?)
    }

    /// Executes a batch of statements separated by semicolons.
    pub async fn batch_execute(&self, sql: &str) -> Result<(), Error> {
        let client = self.get_connection().await?;
        Ok(client.batch_execute(sql).await?)
    }

    /// Opens a dedicated connection and starts listening on `channel`.
    ///
    /// Messages arrive on [`Subscription::take_messages`] in the order
    /// the server sent them on this connection. Dropping the returned
    /// subscription releases the connection.
    pub async fn subscribe(&self, channel: &str) -> Result<Subscription, Error> {
        let (client, mut connection) = self.config.connect(NoTls).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(async move {
            let mut messages =
                futures::stream::poll_fn(move |cx| connection.poll_message(cx));
            while let Some(message) = messages.next().await {
                match message {
                    Ok(AsyncMessage::Notification(n)) => {
                        if tx.send(n).is_err() {
                            // Receiver gone; the subscription was dropped.
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("subscription connection failed: {e}");
                        break;
                    }
                }
            }
            debug!("subscription connection finished");
        });
        client
            .batch_execute(&format!("LISTEN {}", escape_identifier(channel)))
            .await?;
        debug!(%channel, "listening");
        Ok(Subscription {
            _client: client,
            pump,
            messages: Some(rx),
        })
    }

    /// Releases all pooled connections. Only the owner of the pool may
    /// call this; live checkouts complete before their connections close.
    pub fn close(&self) {
        self.inner.close();
    }
}

/// A live LISTEN on one channel over a dedicated connection.
pub struct Subscription {
    // Held so the server keeps the LISTEN registered; dropping the client
    // terminates the connection and with it the pump task's stream.
    _client: tokio_postgres::Client,
    pump: JoinHandle<()>,
    messages: Option<mpsc::UnboundedReceiver<Notification>>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

impl Subscription {
    /// Takes the notification stream. May be called once; the stream ends
    /// when the subscription is dropped or the connection fails.
    pub fn take_messages(&mut self) -> mpsc::UnboundedReceiver<Notification> {
        self.messages
            .take()
            .expect("subscription messages already taken")
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.pump.abort();
    }
}
