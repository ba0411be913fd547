// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The id dispenser: process-wide-unique ids without a round-trip.
//!
//! Ids are drawn from a Postgres sequence in pre-fetched blocks, so the
//! common case of issuing an id is a pure in-memory increment. The price
//! is that a process restart burns the unissued remainder of its current
//! block: ids are globally unique and strictly increasing, but sparse.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use postgres_protocol::escape::escape_literal;
use tokio::sync::oneshot;
use tokio_postgres::error::SqlState;
use tracing::debug;

use crate::error::Error;
use crate::pool::Pool;
use crate::schema::is_safe_identifier;

/// Default name of the backing sequence.
pub const DEFAULT_SEQUENCE: &str = "client_assigned_id_seq";

/// Default number of ids fetched per round-trip.
pub const DEFAULT_BLOCK_SIZE: i64 = 10_000;

/// Tuning for an [`IdDispenser`].
#[derive(Debug, Clone)]
pub struct IdDispenserConfig {
    /// Name of the backing sequence.
    pub sequence: String,
    /// How far the server-side counter advances per fetch.
    pub block_size: i64,
    /// How many ids of each fetched block are actually issued before the
    /// next fetch. Equal to `block_size` in production; tests shrink it
    /// to force refetches deterministically.
    pub inner_block_size: i64,
}

impl Default for IdDispenserConfig {
    fn default() -> IdDispenserConfig {
        IdDispenserConfig {
            sequence: DEFAULT_SEQUENCE.to_owned(),
            block_size: DEFAULT_BLOCK_SIZE,
            inner_block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

/// Where blocks of ids come from.
///
/// The production implementation advances a Postgres sequence; tests
/// substitute an in-memory counter.
#[async_trait]
pub(crate) trait SequenceSource: Send + Sync + 'static {
    /// Returns the first id of a freshly reserved block. Successive
    /// returned bases are strictly increasing.
    async fn next_block(&self) -> Result<i64, Error>;
}

/// A [`SequenceSource`] backed by `SELECT nextval(...)` on a sequence
/// created with `INCREMENT BY block_size START block_size`.
struct PgSequenceSource {
    pool: Pool,
    fetch_sql: String,
    create_sql: String,
    tried_create: AtomicBool,
}

impl PgSequenceSource {
    fn new(pool: Pool, config: &IdDispenserConfig) -> PgSequenceSource {
        PgSequenceSource {
            pool,
            fetch_sql: format!("SELECT nextval({})", escape_literal(&config.sequence)),
            create_sql: format!(
                "CREATE SEQUENCE {} INCREMENT BY {} START {}",
                config.sequence, config.block_size, config.block_size
            ),
            tried_create: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl SequenceSource for PgSequenceSource {
    async fn next_block(&self) -> Result<i64, Error> {
        loop {
            match self.pool.query_one(&self.fetch_sql, &[]).await {
                Ok(row) => return Ok(row.try_get(0)?),
                Err(Error::Postgres(e))
                    if e.code() == Some(&SqlState::UNDEFINED_TABLE)
                        && !self.tried_create.swap(true, Ordering::SeqCst) =>
                {
                    // Self-heal exactly once: create the sequence and
                    // retry. A second 42P01 propagates.
                    debug!("id sequence missing; creating it");
                    self.pool.batch_execute(&self.create_sql).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

struct DispenserState {
    next_id: i64,
    max_id: i64,
    waiters: VecDeque<oneshot::Sender<Result<i64, Error>>>,
    fetching: bool,
}

struct DispenserInner {
    source: Arc<dyn SequenceSource>,
    inner_block_size: i64,
    state: Mutex<DispenserState>,
    /// The pool this dispenser opened itself, if any. Injected pools are
    /// never closed here.
    owned_pool: Option<Pool>,
    closed: AtomicBool,
}

/// Issues process-wide-unique, strictly increasing ids. Cheap to clone;
/// clones share the same block.
#[derive(Clone)]
pub struct IdDispenser {
    inner: Arc<DispenserInner>,
}

impl fmt::Debug for IdDispenser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock().expect("poisoned");
        f.debug_struct("IdDispenser")
            .field("next_id", &state.next_id)
            .field("max_id", &state.max_id)
            .field("waiters", &state.waiters.len())
            .finish_non_exhaustive()
    }
}

impl IdDispenser {
    /// Creates a dispenser over a shared pool.
    pub fn new(pool: Pool, config: IdDispenserConfig) -> Result<IdDispenser, Error> {
        Self::build(pool, None, config)
    }

    /// Creates a dispenser with its own pool for the database at `url`.
    pub fn open(url: &str, config: IdDispenserConfig) -> Result<IdDispenser, Error> {
        let pool = Pool::open(url)?;
        Self::build(pool.clone(), Some(pool), config)
    }

    fn build(
        pool: Pool,
        owned_pool: Option<Pool>,
        config: IdDispenserConfig,
    ) -> Result<IdDispenser, Error> {
        if !is_safe_identifier(&config.sequence) {
            return Err(Error::config(format!(
                "sequence name {:?} is not a safe SQL identifier",
                config.sequence
            )));
        }
        if config.block_size < 1 || config.inner_block_size < 1 {
            return Err(Error::config("block sizes must be positive"));
        }
        if config.inner_block_size > config.block_size {
            return Err(Error::config(
                "inner_block_size cannot exceed block_size",
            ));
        }
        let source = Arc::new(PgSequenceSource::new(pool, &config));
        Ok(Self::with_source(source, config.inner_block_size, owned_pool))
    }

    pub(crate) fn with_source(
        source: Arc<dyn SequenceSource>,
        inner_block_size: i64,
        owned_pool: Option<Pool>,
    ) -> IdDispenser {
        IdDispenser {
            inner: Arc::new(DispenserInner {
                source,
                inner_block_size,
                state: Mutex::new(DispenserState {
                    next_id: 0,
                    max_id: -1,
                    waiters: VecDeque::new(),
                    fetching: false,
                }),
                owned_pool,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Returns an id never issued before from this sequence.
    ///
    /// Resolves without I/O while the current block lasts. On exhaustion
    /// the caller queues behind a single shared block fetch; callers are
    /// served in arrival order.
    pub async fn next(&self) -> Result<i64, Error> {
        let rx = {
            let mut state = self.inner.state.lock().expect("poisoned");
            if state.next_id <= state.max_id {
                let id = state.next_id;
                state.next_id += 1;
                return Ok(id);
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            if !state.fetching {
                state.fetching = true;
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move { fetch_blocks(inner).await });
            }
            rx
        };
        rx.await
            .map_err(|_| Error::Sequence("dispenser dropped while fetching a block".into()))?
    }

    /// Releases any transport resource the dispenser owns. Idempotent;
    /// shared pools handed in by the caller are left alone.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            if let Some(pool) = &self.inner.owned_pool {
                pool.close();
            }
        }
    }
}

/// Fetches blocks until the waiter queue is drained, then parks.
async fn fetch_blocks(inner: Arc<DispenserInner>) {
    loop {
        let fetched = inner.source.next_block().await;
        let mut state = inner.state.lock().expect("poisoned");
        match fetched {
            Ok(base) => {
                debug!(base, "fetched id block");
                state.next_id = base;
                state.max_id = base + inner.inner_block_size - 1;
                while let Some(waiter) = state.waiters.pop_front() {
                    if state.next_id > state.max_id {
                        // Block exhausted with callers still queued;
                        // fetch another.
                        state.waiters.push_front(waiter);
                        break;
                    }
                    let id = state.next_id;
                    state.next_id += 1;
                    // A waiter that gave up just forfeits its id.
                    let _ = waiter.send(Ok(id));
                }
                if state.waiters.is_empty() {
                    state.fetching = false;
                    return;
                }
            }
            Err(e) => {
                let msg = e.to_string();
                for waiter in state.waiters.drain(..) {
                    let _ = waiter.send(Err(Error::Sequence(msg.clone())));
                }
                state.fetching = false;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicI64;
    use std::time::Duration;

    use futures::future;

    use super::*;

    /// Mimics a sequence created `INCREMENT BY 10000 START 10000`.
    struct CountingSource {
        next_base: AtomicI64,
        fetches: AtomicI64,
        delay: Duration,
    }

    impl CountingSource {
        fn new(start: i64) -> CountingSource {
            CountingSource {
                next_base: AtomicI64::new(start),
                fetches: AtomicI64::new(0),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl SequenceSource for CountingSource {
        async fn next_block(&self) -> Result<i64, Error> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(self.next_base.fetch_add(10_000, Ordering::SeqCst))
        }
    }

    struct FailingSource;

    #[async_trait]
    impl SequenceSource for FailingSource {
        async fn next_block(&self) -> Result<i64, Error> {
            Err(Error::Sequence("sequence is gone".into()))
        }
    }

    #[tokio::test]
    async fn block_determinism() {
        let source = Arc::new(CountingSource::new(10_000));
        let dispenser = IdDispenser::with_source(source, 3, None);
        let mut ids = Vec::new();
        for _ in 0..12 {
            ids.push(dispenser.next().await.unwrap());
        }
        assert_eq!(
            ids,
            vec![
                10_000, 10_001, 10_002, 20_000, 20_001, 20_002, 30_000, 30_001, 30_002,
                40_000, 40_001, 40_002
            ]
        );
    }

    #[tokio::test]
    async fn concurrent_exhaustion_shares_one_fetch() {
        let source = Arc::new(CountingSource {
            next_base: AtomicI64::new(10_000),
            fetches: AtomicI64::new(0),
            delay: Duration::from_millis(10),
        });
        let dispenser = IdDispenser::with_source(Arc::clone(&source) as _, 10_000, None);

        let ids = future::join_all((0..50).map(|_| {
            let d = dispenser.clone();
            async move { d.next().await.unwrap() }
        }))
        .await;

        // All distinct and issued in queue order from a single block.
        assert_eq!(ids, (10_000..10_050).collect::<Vec<_>>());
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ids_strictly_increase_across_blocks() {
        let source = Arc::new(CountingSource::new(10_000));
        let dispenser = IdDispenser::with_source(source, 2, None);
        let mut last = -1;
        for _ in 0..20 {
            let id = dispenser.next().await.unwrap();
            assert!(id > last, "{id} should exceed {last}");
            last = id;
        }
    }

    #[tokio::test]
    async fn fetch_failure_propagates_to_all_waiters() {
        let dispenser = IdDispenser::with_source(Arc::new(FailingSource), 10_000, None);
        let results = future::join_all((0..5).map(|_| {
            let d = dispenser.clone();
            async move { d.next().await }
        }))
        .await;
        for result in results {
            assert!(matches!(result, Err(Error::Sequence(_))));
        }
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let source = Arc::new(CountingSource::new(10_000));
        let dispenser = IdDispenser::with_source(source, 3, None);
        dispenser.close();
        dispenser.close();
    }
}
