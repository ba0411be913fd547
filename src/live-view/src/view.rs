// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The view: a live, incrementally synchronized in-memory mirror of one
//! table.
//!
//! Connecting provisions the change feed, subscribes to the table's
//! notification channel, and only then loads the initial snapshot, so no
//! write can fall between snapshot and subscription. From then on the
//! mirror converges by applying feed messages in arrival order; the feed
//! is the sole source of confirmation, including for this process's own
//! writes.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::ViewConfig;
use crate::dispenser::{IdDispenser, IdDispenserConfig};
use crate::error::Error;
use crate::feed::{self, ChangeEvent};
use crate::pool::{Pool, Subscription};
use crate::row::{Row, RowCache, RowData, RowEvent};

/// Lifecycle of a [`View`]. States only ever advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ViewState {
    /// Constructed; no I/O yet.
    Initialized,
    /// A connect is in flight: provisioning, subscribing, snapshotting.
    Connecting,
    /// The mirror is live and converging.
    Connected,
    /// Teardown has begun; no further events are delivered.
    Closing,
    /// Fully torn down. Terminal.
    Closed,
}

/// Events observable on a view.
#[derive(Debug)]
pub enum ViewEvent {
    /// A row entered the mirror: snapshot load, a remote insert, a local
    /// `add`, or a `lookup` that had to go to the database. Emitted
    /// exactly once per row lifetime regardless of how many of those
    /// paths race.
    Appeared(Row),
    /// The initial snapshot is fully loaded; the mirror now reflects at
    /// least the table state at connect time.
    Stable,
}

pub(crate) struct ViewCore {
    config: ViewConfig,
    name: String,
    pool: Pool,
    owns_pool: bool,
    dispenser: IdDispenser,
    owns_dispenser: bool,
    state: watch::Sender<ViewState>,
    cache: Mutex<RowCache>,
    events: Mutex<Option<mpsc::UnboundedSender<ViewEvent>>>,
    subscription: Mutex<Option<Subscription>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

/// A live view over one table. Cheap to clone; clones share the mirror.
#[derive(Clone)]
pub struct View {
    core: Arc<ViewCore>,
}

impl fmt::Debug for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("View")
            .field("name", &self.core.name)
            .field("table", &self.core.config.table)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl View {
    /// Creates a view from a validated configuration. No I/O happens
    /// until [`View::connect`] (or the first operation that implies it).
    pub fn new(config: ViewConfig) -> Result<View, Error> {
        config.validate()?;
        let (pool, owns_pool) = match &config.pool {
            Some(pool) => (pool.clone(), false),
            None => {
                let url = config
                    .url
                    .as_deref()
                    .ok_or_else(|| Error::config("a connection source is required"))?;
                (Pool::open(url)?, true)
            }
        };
        let (dispenser, owns_dispenser) = match &config.dispenser {
            Some(dispenser) => (dispenser.clone(), false),
            None => (
                IdDispenser::new(pool.clone(), IdDispenserConfig::default())?,
                true,
            ),
        };
        let name = config.name.clone().unwrap_or_else(|| config.table.clone());
        let change_now = config.change_now;
        let (state, _) = watch::channel(ViewState::Initialized);
        let core = Arc::new_cyclic(|weak| ViewCore {
            config,
            name,
            pool,
            owns_pool,
            dispenser,
            owns_dispenser,
            state,
            cache: Mutex::new(RowCache::new(weak.clone(), change_now)),
            events: Mutex::new(None),
            subscription: Mutex::new(None),
            pump: Mutex::new(None),
        });
        Ok(View { core })
    }

    /// This view's registry name (the table name unless overridden).
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// The watched table.
    pub fn table(&self) -> &str {
        &self.core.config.table
    }

    /// The current lifecycle state.
    pub fn state(&self) -> ViewState {
        *self.core.state.borrow()
    }

    /// Returns this view's event stream, creating the sink. A second
    /// call replaces the first sink; events are only retained from the
    /// moment a sink exists, and none are delivered once teardown begins.
    pub fn events(&self) -> mpsc::UnboundedReceiver<ViewEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut events = self.core.events.lock().expect("poisoned");
        *events = Some(tx);
        rx
    }

    /// Brings the mirror live: provisions the change feed, subscribes,
    /// loads the snapshot, emits `Stable`. Idempotent; concurrent calls
    /// coalesce onto one in-flight connect.
    pub async fn connect(&self) -> Result<(), Error> {
        self.core.ensure_connected().await
    }

    /// Inserts a new row, with its id drawn from the dispenser, and
    /// returns its handle. Connects first if needed.
    ///
    /// The handle is registered in the mirror before the INSERT is
    /// issued, so the row's own feed notification finds it no matter
    /// which arrives first. Exactly one `Appeared` is emitted either way.
    pub async fn add(&self, fields: RowData) -> Result<Row, Error> {
        self.core.add(fields).await
    }

    /// Deletes a row by id. The mirror drops the handle when the delete's
    /// feed notification arrives, like any remote delete.
    pub async fn delete(&self, id: i64) -> Result<(), Error> {
        let core = &self.core;
        core.ensure_connected().await?;
        let sql = format!("DELETE FROM {} WHERE id = $1", core.config.table);
        core.pool.execute(&sql, &[&id]).await?;
        Ok(())
    }

    /// Finds a row by id: from the mirror if present, otherwise by a
    /// point SELECT. A missing row is `Ok(None)`, not an error; more than
    /// one row for an id is [`Error::AmbiguousLookup`].
    pub async fn lookup(&self, id: i64) -> Result<Option<Row>, Error> {
        self.core.lookup(id).await
    }

    /// Runs an arbitrary statement on the view's pool, connecting first
    /// if needed. Once teardown has begun this resolves to `Ok(None)`
    /// instead of erroring, so shutdown-racing readers degrade quietly.
    pub async fn query(
        &self,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> Result<Option<Vec<tokio_postgres::Row>>, Error> {
        let core = &self.core;
        if *core.state.borrow() >= ViewState::Closing {
            return Ok(None);
        }
        core.ensure_connected().await?;
        Ok(Some(core.pool.query(sql, params).await?))
    }

    /// Tears the view down: stops the feed, drops all event sinks, and
    /// releases owned resources (injected pools and dispensers are left
    /// alone). An in-flight connect is drained first. Idempotent;
    /// concurrent calls coalesce.
    pub async fn close(&self) {
        self.core.close().await
    }
}

impl ViewCore {
    async fn ensure_connected(self: &Arc<Self>) -> Result<(), Error> {
        loop {
            let mut rx = self.state.subscribe();
            let mut claimed = false;
            self.state.send_if_modified(|state| match *state {
                ViewState::Initialized => {
                    *state = ViewState::Connecting;
                    claimed = true;
                    true
                }
                _ => false,
            });
            if claimed {
                return match self.do_connect().await {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        // A failed connect is terminal for this view. A
                        // concurrent close may already have advanced the
                        // state; never move it backwards.
                        self.teardown();
                        self.state.send_if_modified(|state| {
                            if *state == ViewState::Closed {
                                false
                            } else {
                                *state = ViewState::Closed;
                                true
                            }
                        });
                        Err(e)
                    }
                };
            }
            let current = *rx.borrow_and_update();
            match current {
                ViewState::Connected => return Ok(()),
                ViewState::Connecting => {
                    let _ = rx.changed().await;
                }
                ViewState::Closing | ViewState::Closed => {
                    return Err(Error::InvalidState {
                        expected: ViewState::Connected,
                        actual: current,
                    });
                }
                // Lost the claim race; try again.
                ViewState::Initialized => {}
            }
        }
    }

    async fn do_connect(self: &Arc<Self>) -> Result<(), Error> {
        let table = &self.config.table;
        feed::provision(&self.pool, &self.config).await?;

        // Subscribe before snapshotting. A write landing in between is
        // delivered twice (once in the snapshot, once on the feed) and
        // absorbed; a write that only the snapshot could have seen is
        // never missed.
        let mut subscription = self.pool.subscribe(&feed::channel(table)).await?;
        let mut messages = subscription.take_messages();
        *self.subscription.lock().expect("poisoned") = Some(subscription);

        // Live from here: the server is recording feed messages for us.
        // The snapshot below may still race a close, which is why this
        // transition (like all others) only ever advances.
        self.state.send_if_modified(|state| match *state {
            ViewState::Connecting => {
                *state = ViewState::Connected;
                true
            }
            _ => false,
        });

        let sql = format!("SELECT row_to_json(t.*) FROM {table} t");
        let rows = self.pool.query(&sql, &[]).await?;
        debug!(%table, rows = rows.len(), "loaded snapshot");
        for row in rows {
            let data = decode_row(row.try_get(0)?)?;
            let (handle, created) = self.cache.lock().expect("poisoned").appear(data)?;
            if created {
                self.emit(ViewEvent::Appeared(handle));
            }
        }
        self.emit(ViewEvent::Stable);

        // The pump starts only after the whole snapshot has been
        // applied. Messages that arrived in the meantime queued in the
        // subscription channel and are applied now, in order; in
        // particular a DELETE for a row the snapshot still contained
        // evicts it instead of racing the appear above.
        let weak = Arc::downgrade(self);
        let pump = tokio::spawn(async move {
            while let Some(notification) = messages.recv().await {
                let Some(core) = weak.upgrade() else { break };
                if *core.state.borrow() >= ViewState::Closing {
                    break;
                }
                if let Err(e) = core.handle_notification(notification.payload()) {
                    warn!("dropping undecodable change-feed message: {e}");
                }
            }
            debug!("change-feed pump finished");
        });
        *self.pump.lock().expect("poisoned") = Some(pump);
        Ok(())
    }

    /// Applies one feed message to the mirror. Runs on the pump task;
    /// messages from one connection arrive in server order, so applying
    /// them synchronously here preserves that order in the mirror.
    fn handle_notification(&self, payload: &str) -> Result<(), Error> {
        match ChangeEvent::decode(payload)? {
            ChangeEvent::Insert(data) => {
                let (row, created) =
                    self.cache.lock().expect("poisoned").appear(data.clone())?;
                if created {
                    self.emit(ViewEvent::Appeared(row));
                } else {
                    // Duplicate delivery, or the notification for a row
                    // this process added (pre-registered before its
                    // INSERT). Either way the payload is the confirmed
                    // state.
                    if let Some(old) = row.apply_confirmed(data) {
                        row.emit(RowEvent::Changed {
                            old,
                            row: row.clone(),
                        });
                    }
                }
            }
            ChangeEvent::Update(data) => {
                let (row, old, created) = self
                    .cache
                    .lock()
                    .expect("poisoned")
                    .apply_remote_update(data)?;
                if created {
                    self.emit(ViewEvent::Appeared(row));
                } else if let Some(old) = old {
                    row.emit(RowEvent::Changed {
                        old,
                        row: row.clone(),
                    });
                }
            }
            ChangeEvent::Delete { id } => {
                let removed = self.cache.lock().expect("poisoned").apply_remote_delete(id);
                if let Some(row) = removed {
                    let mut partial = row.fields();
                    partial
                        .entry("id".to_owned())
                        .or_insert_with(|| Value::from(id));
                    row.emit(RowEvent::Disappeared(partial));
                    row.close_sink();
                }
            }
        }
        Ok(())
    }

    async fn add(self: &Arc<Self>, fields: RowData) -> Result<Row, Error> {
        if fields.contains_key("id") {
            return Err(Error::config(
                "the id of a new row is assigned by the dispenser",
            ));
        }
        self.ensure_connected().await?;
        let id = self.dispenser.next().await?;
        let row = self.cache.lock().expect("poisoned").register_new(id);

        let mut payload = fields;
        payload.insert("id".to_owned(), Value::from(id));
        let table = &self.config.table;
        let sql = format!(
            "INSERT INTO {table}
             SELECT * FROM jsonb_populate_record(NULL::{table}, $1::jsonb)
             RETURNING row_to_json({table}.*)"
        );
        let inserted = match self.pool.query_one(&sql, &[&Value::Object(payload)]).await {
            Ok(inserted) => inserted,
            Err(e) => {
                // Withdraw the pre-registration; the row never existed.
                self.cache.lock().expect("poisoned").apply_remote_delete(id);
                return Err(e);
            }
        };
        let confirmed = decode_row(inserted.try_get(0)?)?;
        row.note_assigned_id(id);
        if let Some(old) = row.apply_confirmed(confirmed) {
            row.emit(RowEvent::Changed {
                old,
                row: row.clone(),
            });
        }
        // The feed's own INSERT notification finds the handle already
        // cached, so this is the one and only Appeared for this row.
        self.emit(ViewEvent::Appeared(row.clone()));
        self.emit(ViewEvent::Stable);
        Ok(row)
    }

    async fn lookup(self: &Arc<Self>, id: i64) -> Result<Option<Row>, Error> {
        self.ensure_connected().await?;
        if let Some(row) = self.cache.lock().expect("poisoned").get(id) {
            return Ok(Some(row));
        }
        let table = &self.config.table;
        let sql = format!("SELECT row_to_json(t.*) FROM {table} t WHERE id = $1");
        let rows = self.pool.query(&sql, &[&id]).await?;
        match rows.len() {
            0 => Ok(None),
            1 => {
                let data = decode_row(rows[0].try_get(0)?)?;
                let (row, created) = self.cache.lock().expect("poisoned").appear(data)?;
                if created {
                    self.emit(ViewEvent::Appeared(row.clone()));
                }
                Ok(Some(row))
            }
            count => Err(Error::AmbiguousLookup { id, count }),
        }
    }

    async fn close(&self) {
        loop {
            let mut rx = self.state.subscribe();
            let mut claimed = false;
            self.state.send_if_modified(|state| match *state {
                ViewState::Initialized | ViewState::Connected => {
                    *state = ViewState::Closing;
                    claimed = true;
                    true
                }
                _ => false,
            });
            if claimed {
                self.teardown();
                self.state.send_replace(ViewState::Closed);
                return;
            }
            let current = *rx.borrow_and_update();
            match current {
                ViewState::Closed => return,
                // Drain the in-flight connect or the other closer.
                ViewState::Connecting | ViewState::Closing => {
                    let _ = rx.changed().await;
                }
                _ => {}
            }
        }
    }

    /// Releases everything this view started or owns. Safe to call in
    /// any state.
    fn teardown(&self) {
        if let Some(pump) = self.pump.lock().expect("poisoned").take() {
            pump.abort();
        }
        drop(self.subscription.lock().expect("poisoned").take());
        *self.events.lock().expect("poisoned") = None;
        self.cache.lock().expect("poisoned").close_all_sinks();
        if self.owns_dispenser {
            self.dispenser.close();
        }
        if self.owns_pool {
            self.pool.close();
        }
    }

    fn emit(&self, event: ViewEvent) {
        if *self.state.borrow() >= ViewState::Closing {
            return;
        }
        let events = self.events.lock().expect("poisoned");
        if let Some(tx) = &*events {
            let _ = tx.send(event);
        }
    }

    /// Queues one coalesced UPDATE for this row's pending writes. Called
    /// by the row on its first buffered write since the last flush.
    pub(crate) fn schedule_row_flush(self: &Arc<Self>, row: Row) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let Some(core) = weak.upgrade() else { return };
            if let Err(e) = core.flush_row(&row).await {
                warn!(id = row.id(), "failed to flush row writes: {e}");
            }
        });
    }

    async fn flush_row(&self, row: &Row) -> Result<(), Error> {
        let Some(pending) = row.take_flush_snapshot() else {
            return Ok(());
        };
        if pending.is_empty() || *self.state.borrow() >= ViewState::Closing {
            return Ok(());
        }
        // Field names were validated as safe identifiers on write.
        let columns = pending.keys().cloned().collect::<Vec<_>>().join(", ");
        let sources = pending
            .keys()
            .map(|k| format!("r.{k}"))
            .collect::<Vec<_>>()
            .join(", ");
        let table = &self.config.table;
        let sql = format!(
            "UPDATE {table} SET ({columns}) =
             (SELECT {sources} FROM jsonb_populate_record(NULL::{table}, $2::jsonb) r)
             WHERE id = $1"
        );
        self.pool
            .execute(&sql, &[&row.id(), &Value::Object(pending)])
            .await?;
        // Confirmation arrives through the change feed, which clears the
        // pending overlay.
        Ok(())
    }
}

fn decode_row(value: Value) -> Result<RowData, Error> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(Error::protocol(format!(
            "row payload is not an object: {other}"
        ))),
    }
}
