// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! View configuration, validated once at construction.

use crate::dispenser::IdDispenser;
use crate::error::Error;
use crate::pool::Pool;
use crate::schema::{is_safe_identifier, ColumnSpec};

/// Configuration for a [`View`](crate::View).
///
/// Immutable once handed to the view. The recognized options are exactly
/// the fields of this struct; everything else is a compile error rather
/// than a silently ignored key. Dynamic invariants (identifier safety,
/// connection source, table-creation source) are checked by
/// [`ViewConfig::validate`] before any I/O happens.
#[derive(Debug, Clone, Default)]
pub struct ViewConfig {
    /// Registry name for this view; defaults to the table name.
    pub name: Option<String>,
    /// The watched table. Must be a safe, unquoted SQL identifier: it is
    /// interpolated into DDL, and the change-feed trigger derives the
    /// notification channel from it.
    pub table: String,
    /// Connection string, used when no pool is injected.
    pub url: Option<String>,
    /// A shared pool. The view never closes an injected pool.
    pub pool: Option<Pool>,
    /// A shared id dispenser. The view never closes an injected one.
    pub dispenser: Option<IdDispenser>,
    /// Make locally-written field values readable before the database
    /// confirms them. A remote-confirmed update still always wins.
    pub change_now: bool,
    /// Create the table during provisioning if it does not exist,
    /// using `columns` or `create_using_sql`.
    pub create_if_missing: bool,
    /// Declarative column spec for table creation.
    pub columns: Option<ColumnSpec>,
    /// Raw column definitions for table creation, e.g. `"a text"`. The
    /// id column is always added.
    pub create_using_sql: Option<String>,
}

impl ViewConfig {
    /// Creates a configuration for watching `table`.
    pub fn new(table: impl Into<String>) -> ViewConfig {
        ViewConfig {
            table: table.into(),
            ..ViewConfig::default()
        }
    }

    /// Sets the connection string.
    pub fn url(mut self, url: impl Into<String>) -> ViewConfig {
        self.url = Some(url.into());
        self
    }

    /// Sets a shared pool.
    pub fn pool(mut self, pool: Pool) -> ViewConfig {
        self.pool = Some(pool);
        self
    }

    /// Sets a shared id dispenser.
    pub fn dispenser(mut self, dispenser: IdDispenser) -> ViewConfig {
        self.dispenser = Some(dispenser);
        self
    }

    /// Enables immediate visibility of unconfirmed local writes.
    pub fn change_now(mut self) -> ViewConfig {
        self.change_now = true;
        self
    }

    /// Creates the table if missing, with the given columns.
    pub fn create_with_columns(mut self, columns: ColumnSpec) -> ViewConfig {
        self.create_if_missing = true;
        self.columns = Some(columns);
        self
    }

    /// Creates the table if missing, from raw column definitions.
    pub fn create_using_sql(mut self, body: impl Into<String>) -> ViewConfig {
        self.create_if_missing = true;
        self.create_using_sql = Some(body.into());
        self
    }

    /// Fails fast on any configuration the view cannot run with.
    pub fn validate(&self) -> Result<(), Error> {
        if self.table.is_empty() {
            return Err(Error::config("table name is required"));
        }
        if !is_safe_identifier(&self.table) {
            return Err(Error::config(format!(
                "table name {:?} is not a safe SQL identifier",
                self.table
            )));
        }
        if self.pool.is_none() && self.url.is_none() {
            return Err(Error::config(
                "a connection source is required: supply a pool or a url",
            ));
        }
        if self.columns.is_some() && self.create_using_sql.is_some() {
            return Err(Error::config(
                "columns and create_using_sql are mutually exclusive",
            ));
        }
        if self.create_if_missing && self.columns.is_none() && self.create_using_sql.is_none()
        {
            return Err(Error::config(
                "create_if_missing requires columns or create_using_sql",
            ));
        }
        Ok(())
    }

    /// The `CREATE TABLE` body for provisioning, if table creation was
    /// requested. The id column always leads.
    pub(crate) fn create_table_body(&self) -> Result<Option<String>, Error> {
        if !self.create_if_missing {
            return Ok(None);
        }
        let body = if let Some(sql) = &self.create_using_sql {
            format!("id bigint PRIMARY KEY, {sql}")
        } else if let Some(columns) = &self.columns {
            if columns.is_empty() {
                "id bigint PRIMARY KEY".to_owned()
            } else {
                format!("id bigint PRIMARY KEY, {}", columns.to_column_defs())
            }
        } else {
            return Err(Error::config(
                "create_if_missing requires columns or create_using_sql",
            ));
        };
        Ok(Some(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_requires_table() {
        let err = ViewConfig::new("").url("host=localhost").validate().unwrap_err();
        assert!(err.to_string().contains("table name is required"));
    }

    #[test]
    fn validate_rejects_unsafe_table() {
        let err = ViewConfig::new("my_dogs; DROP TABLE my_dogs")
            .url("host=localhost")
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("not a safe SQL identifier"));
    }

    #[test]
    fn validate_requires_connection_source() {
        let err = ViewConfig::new("my_dogs").validate().unwrap_err();
        assert!(err.to_string().contains("connection source"));
    }

    #[test]
    fn validate_rejects_conflicting_creation_sources() {
        let mut config = ViewConfig::new("my_dogs")
            .url("host=localhost")
            .create_using_sql("a text");
        config.columns = Some(ColumnSpec::new());
        assert!(config.validate().is_err());
    }

    #[test]
    fn create_table_body_leads_with_id() {
        let config = ViewConfig::new("my_dogs")
            .url("host=localhost")
            .create_using_sql("a text");
        assert_eq!(
            config.create_table_body().unwrap().as_deref(),
            Some("id bigint PRIMARY KEY, a text")
        );

        let config = ViewConfig::new("my_dogs").url("host=localhost");
        assert_eq!(config.create_table_body().unwrap(), None);
    }
}
