// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! A registry of views over one database.
//!
//! A [`Db`] owns one pool and one id dispenser and shares them with
//! every view created through it, so a process watching several tables
//! holds one set of connections instead of one per table.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::ViewConfig;
use crate::dispenser::{IdDispenser, IdDispenserConfig};
use crate::error::Error;
use crate::pool::Pool;
use crate::view::View;

struct DbInner {
    pool: Pool,
    dispenser: IdDispenser,
    views: Mutex<BTreeMap<String, View>>,
    closed: AtomicBool,
}

/// A handle to one database and the views registered on it. Cheap to
/// clone; clones share the registry.
#[derive(Clone)]
pub struct Db {
    inner: Arc<DbInner>,
}

impl fmt::Debug for Db {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let views = self.inner.views.lock().expect("poisoned");
        f.debug_struct("Db")
            .field("views", &views.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Db {
    /// Opens a registry for the database at `url`. No connection is
    /// established until a view connects or the dispenser first fetches.
    pub fn open(url: &str) -> Result<Db, Error> {
        let pool = Pool::open(url)?;
        let dispenser = IdDispenser::new(pool.clone(), IdDispenserConfig::default())?;
        Ok(Db {
            inner: Arc::new(DbInner {
                pool,
                dispenser,
                views: Mutex::new(BTreeMap::new()),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// The shared pool.
    pub fn pool(&self) -> &Pool {
        &self.inner.pool
    }

    /// The shared id dispenser.
    pub fn dispenser(&self) -> &IdDispenser {
        &self.inner.dispenser
    }

    /// Creates a view through this registry, injecting the shared pool
    /// and dispenser unless the configuration supplies its own. If a
    /// view is already registered under the resulting name, that view is
    /// returned and the configuration is ignored.
    pub fn live_view(&self, mut config: ViewConfig) -> Result<View, Error> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::config("the registry has been closed"));
        }
        let name = config
            .name
            .clone()
            .unwrap_or_else(|| config.table.clone());
        let mut views = self.inner.views.lock().expect("poisoned");
        if let Some(existing) = views.get(&name) {
            return Ok(existing.clone());
        }
        if config.pool.is_none() && config.url.is_none() {
            config.pool = Some(self.inner.pool.clone());
        }
        if config.dispenser.is_none() {
            config.dispenser = Some(self.inner.dispenser.clone());
        }
        let view = View::new(config)?;
        views.insert(name, view.clone());
        Ok(view)
    }

    /// Looks up a registered view by name.
    pub fn view(&self, name: &str) -> Option<View> {
        self.inner.views.lock().expect("poisoned").get(name).cloned()
    }

    /// Closes every registered view, then the shared dispenser and pool.
    /// Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let views = {
            let mut views = self.inner.views.lock().expect("poisoned");
            std::mem::take(&mut *views)
        };
        for (name, view) in views {
            tracing::debug!(%name, "closing view");
            view.close().await;
        }
        self.inner.dispenser.close();
        self.inner.pool.close();
    }
}

#[cfg(test)]
mod tests {
    use crate::view::ViewState;

    use super::*;

    fn test_db() -> Db {
        Db::open("host=localhost user=postgres").unwrap()
    }

    #[test]
    fn registry_is_idempotent_per_name() {
        let db = test_db();
        let first = db.live_view(ViewConfig::new("my_dogs")).unwrap();
        let second = db.live_view(ViewConfig::new("my_dogs")).unwrap();
        // Both handles share one view.
        assert_eq!(first.name(), second.name());
        assert!(db.view("my_dogs").is_some());
        assert!(db.view("other").is_none());
    }

    #[tokio::test]
    async fn close_closes_registered_views() {
        let db = test_db();
        let view = db.live_view(ViewConfig::new("my_dogs")).unwrap();
        db.close().await;
        assert_eq!(view.state(), ViewState::Closed);
        assert!(db.view("my_dogs").is_none());
        assert!(db.live_view(ViewConfig::new("my_dogs")).is_err());
        // Idempotent.
        db.close().await;
    }
}
