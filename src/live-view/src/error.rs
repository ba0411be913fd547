// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Errors for live views.

use crate::view::ViewState;

/// An error returned by any live-view operation.
///
/// Configuration problems are reported before any I/O is performed. A
/// `lookup` that finds nothing is *not* an error (it resolves to `None`),
/// and neither is a `query` issued after teardown has begun (it resolves
/// to the no-op sentinel).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The caller supplied an invalid or unsupported configuration.
    #[error("configuration error: {0}")]
    Config(String),
    /// An operation was requested in a lifecycle state that does not
    /// permit it, e.g. `connect` after `close`.
    #[error("invalid view state: expected at most {expected:?}, but view is {actual:?}")]
    InvalidState {
        /// The latest state in which the operation is permitted.
        expected: ViewState,
        /// The state the view was actually in.
        actual: ViewState,
    },
    /// A keyed lookup matched more than one row, which violates the
    /// primary-key invariant on the watched table.
    #[error("lookup for id {id} matched {count} rows")]
    AmbiguousLookup {
        /// The id that was looked up.
        id: i64,
        /// How many rows came back.
        count: usize,
    },
    /// A change-feed payload could not be decoded.
    #[error("change feed protocol error: {0}")]
    Protocol(String),
    /// The id sequence could not be fetched, after self-healing was
    /// already attempted once. Fatal to every queued waiter.
    #[error("id sequence error: {0}")]
    Sequence(String),
    /// An error from the database itself.
    #[error(transparent)]
    Postgres(#[from] tokio_postgres::Error),
    /// An error acquiring a pooled connection.
    #[error("connection pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),
}

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Error {
        Error::Config(msg.into())
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Error {
        Error::Protocol(msg.into())
    }
}
