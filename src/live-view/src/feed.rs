// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The change-feed protocol: what the database pushes on every write to a
//! watched table, and the one-time provisioning that makes it do so.
//!
//! Provisioning installs a single plpgsql function shared by all watched
//! tables and one trigger per table. The trigger publishes
//! `[TG_OP, row]` as JSON on the channel `{table}_notify`; DELETE carries
//! the id only, since the rest of the row is gone.

use serde_json::Value;

use crate::config::ViewConfig;
use crate::error::Error;
use crate::pool::Pool;
use crate::row::RowData;

/// Advisory lock key guarding provisioning, in a space distinct from any
/// other consumer of advisory locks on the same database. One fixed key
/// serves every table: provisioning is rare and brief, so cross-table
/// contention on this lock has never been worth per-table keys.
pub(crate) const PROVISION_LOCK_KEY: i64 = 0x6c69_7665_7669_6577; // "liveview"

/// The emission function shared by all watched tables. `CREATE OR
/// REPLACE` keeps its behavior current if the definition ever changes.
const NOTIFY_FUNCTION: &str = "
CREATE OR REPLACE FUNCTION live_view_notify() RETURNS TRIGGER AS $$
DECLARE
    row json;
    msg json;
BEGIN
    IF (TG_OP = 'DELETE') THEN
        row = json_build_object('id', OLD.id);
    ELSE
        row = row_to_json(NEW);
    END IF;
    msg = json_build_array(TG_OP, row);
    PERFORM pg_notify(TG_TABLE_NAME || '_notify', msg::text);
    RETURN NULL;
END;
$$ LANGUAGE plpgsql;
";

/// One row-level change, as pushed by the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// A row came into existence; carries the full new row.
    Insert(RowData),
    /// A row changed; carries the full current row.
    Update(RowData),
    /// A row was deleted; only the id survives.
    Delete {
        /// Id of the deleted row.
        id: i64,
    },
}

impl ChangeEvent {
    /// Decodes one notification payload.
    pub fn decode(payload: &str) -> Result<ChangeEvent, Error> {
        let value: Value = serde_json::from_str(payload)
            .map_err(|e| Error::protocol(format!("payload is not JSON: {e}")))?;
        let (op, row) = match value {
            Value::Array(items) if items.len() == 2 => {
                let mut items = items.into_iter();
                let op = items.next().expect("len checked");
                let row = items.next().expect("len checked");
                (op, row)
            }
            other => {
                return Err(Error::protocol(format!(
                    "expected a two-element [op, row] array, got {other}"
                )))
            }
        };
        let op = op
            .as_str()
            .ok_or_else(|| Error::protocol("operation tag is not a string"))?
            .to_owned();
        let data = match row {
            Value::Object(map) => map,
            other => {
                return Err(Error::protocol(format!(
                    "row payload is not an object: {other}"
                )))
            }
        };
        match op.as_str() {
            "INSERT" => Ok(ChangeEvent::Insert(data)),
            "UPDATE" => Ok(ChangeEvent::Update(data)),
            "DELETE" => Ok(ChangeEvent::Delete {
                id: row_id(&data)?,
            }),
            other => Err(Error::protocol(format!("unknown operation tag {other:?}"))),
        }
    }
}

/// Extracts the mandatory integer id from a row payload.
pub(crate) fn row_id(data: &RowData) -> Result<i64, Error> {
    data.get("id")
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::protocol("row payload has no integer id"))
}

/// The notification channel for `table`.
pub(crate) fn channel(table: &str) -> String {
    format!("{table}_notify")
}

/// Idempotently ensures the database publishes a change-feed message for
/// every insert/update/delete on the configured table.
///
/// Runs in one transaction holding the provisioning advisory lock, so
/// concurrent provisioners (other processes included) serialize: the
/// function (re)definition, optional table creation, and the
/// drop-then-create of the trigger are atomic with respect to each
/// other. Recreating the trigger unconditionally guarantees current
/// behavior if the emission logic has changed.
pub(crate) async fn provision(pool: &Pool, config: &ViewConfig) -> Result<(), Error> {
    let table = &config.table;
    let mut client = pool.get_connection().await?;
    let tx = client.transaction().await?;
    tx.execute("SELECT pg_advisory_xact_lock($1)", &[&PROVISION_LOCK_KEY])
        .await?;
    tx.batch_execute(NOTIFY_FUNCTION).await?;
    if let Some(body) = config.create_table_body()? {
        tx.batch_execute(&format!(
            "CREATE TABLE IF NOT EXISTS {table} ({body})"
        ))
        .await?;
    }
    tx.batch_execute(&format!(
        "DROP TRIGGER IF EXISTS {table}_live_view ON {table} CASCADE"
    ))
    .await?;
    tx.batch_execute(&format!(
        "CREATE TRIGGER {table}_live_view
         AFTER INSERT OR UPDATE OR DELETE ON {table}
         FOR EACH ROW EXECUTE PROCEDURE live_view_notify()"
    ))
    .await?;
    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn decode_insert() {
        let event =
            ChangeEvent::decode(r#"["INSERT", {"id": 7, "a": "Hello"}]"#).unwrap();
        match event {
            ChangeEvent::Insert(data) => {
                assert_eq!(data.get("id"), Some(&json!(7)));
                assert_eq!(data.get("a"), Some(&json!("Hello")));
            }
            other => panic!("expected insert, got {other:?}"),
        }
    }

    #[test]
    fn decode_update() {
        let event = ChangeEvent::decode(r#"["UPDATE", {"id": 7, "a": "Bye"}]"#).unwrap();
        assert!(matches!(event, ChangeEvent::Update(_)));
    }

    #[test]
    fn decode_delete_carries_id_only() {
        let event = ChangeEvent::decode(r#"["DELETE", {"id": 42}]"#).unwrap();
        assert_eq!(event, ChangeEvent::Delete { id: 42 });
    }

    #[test]
    fn decode_rejects_unknown_op() {
        let err = ChangeEvent::decode(r#"["TRUNCATE", {"id": 1}]"#).unwrap_err();
        assert!(err.to_string().contains("unknown operation tag"));
    }

    #[test]
    fn decode_rejects_malformed_payloads() {
        assert!(ChangeEvent::decode("not json").is_err());
        assert!(ChangeEvent::decode(r#"{"op": "INSERT"}"#).is_err());
        assert!(ChangeEvent::decode(r#"["INSERT", "not a row"]"#).is_err());
        assert!(ChangeEvent::decode(r#"["DELETE", {"a": 1}]"#).is_err());
    }

    #[test]
    fn channel_name() {
        assert_eq!(channel("my_dogs"), "my_dogs_notify");
    }
}
