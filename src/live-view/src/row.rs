// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Row handles and the per-view row cache.
//!
//! A [`Row`] is the in-memory representative of one table row. Reads see
//! the last database-confirmed state (optionally shadowed by pending
//! local writes, see `change_now`); writes buffer locally and are
//! flushed as one coalesced UPDATE. Confirmation only ever arrives
//! through the change feed: whenever fresh confirmed state is applied,
//! the visibility overlay is discarded wholesale. Last confirmed write
//! wins, not last local write. Writes not yet submitted sit in a
//! separate buffer that confirmation does not touch, so a confirmation
//! arriving between two flushes cannot swallow the later write.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::Error;
use crate::feed::row_id;
use crate::schema::is_safe_identifier;
use crate::view::ViewCore;

/// A row's fields, as a JSON field map. This is exactly the shape the
/// change feed delivers.
pub type RowData = serde_json::Map<String, Value>;

/// Events observable on a single row handle.
#[derive(Debug)]
pub enum RowEvent {
    /// The dispenser assigned this row its id (add path only). Delivered
    /// as the first event on the first sink attached to the handle.
    IdAssigned(i64),
    /// The database confirmed a new state for this row. Carries the
    /// prior field snapshot and the handle itself.
    Changed {
        /// The fields as they were before this change.
        old: RowData,
        /// The handle, already reflecting the new state.
        row: Row,
    },
    /// The row was deleted. Carries the last known partial data, at
    /// minimum the id.
    Disappeared(RowData),
}

struct RowState {
    /// Last database-confirmed fields.
    fields: RowData,
    /// Locally-written, not-yet-confirmed field values. Cleared whenever
    /// confirmed state is applied.
    overlay: Option<RowData>,
    /// Locally-written, not-yet-submitted field values. Only a flush
    /// drains this; confirmed state leaves it alone.
    unflushed: Option<RowData>,
    /// Whether a coalescing UPDATE flush is already queued.
    flush_queued: bool,
    /// A dispenser-assigned id awaiting a sink to deliver it to.
    assigned_id: Option<i64>,
    /// Lazily-created event sink.
    events: Option<mpsc::UnboundedSender<RowEvent>>,
}

pub(crate) struct RowInner {
    id: i64,
    change_now: bool,
    view: Weak<ViewCore>,
    state: Mutex<RowState>,
}

/// A handle to one logical table row. Cheap to clone; all clones share
/// state. Handles are created by the owning view (snapshot, `add`, or a
/// feed notification) and die when a delete notification arrives.
#[derive(Clone)]
pub struct Row {
    inner: Arc<RowInner>,
}

impl fmt::Debug for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock().expect("poisoned");
        f.debug_struct("Row")
            .field("id", &self.inner.id)
            .field("fields", &state.fields)
            .field("pending", &state.overlay.is_some())
            .finish()
    }
}

impl Row {
    fn new(id: i64, change_now: bool, view: Weak<ViewCore>, fields: RowData) -> Row {
        Row {
            inner: Arc::new(RowInner {
                id,
                change_now,
                view,
                state: Mutex::new(RowState {
                    fields,
                    overlay: None,
                    unflushed: None,
                    flush_queued: false,
                    assigned_id: None,
                    events: None,
                }),
            }),
        }
    }

    /// This row's id.
    pub fn id(&self) -> i64 {
        self.inner.id
    }

    /// Reads one field. With `change_now` enabled, a pending local write
    /// shadows the confirmed value until the database confirms or
    /// supersedes it; otherwise reads reflect confirmed state only.
    pub fn get(&self, field: &str) -> Option<Value> {
        let state = self.inner.state.lock().expect("poisoned");
        if self.inner.change_now {
            if let Some(value) = state.overlay.as_ref().and_then(|o| o.get(field)) {
                return Some(value.clone());
            }
        }
        state.fields.get(field).cloned()
    }

    /// Snapshots all fields, applying the same visibility rule as
    /// [`Row::get`].
    pub fn fields(&self) -> RowData {
        let state = self.inner.state.lock().expect("poisoned");
        let mut fields = state.fields.clone();
        if self.inner.change_now {
            if let Some(overlay) = &state.overlay {
                for (key, value) in overlay {
                    fields.insert(key.clone(), value.clone());
                }
            }
        }
        fields
    }

    /// Writes one field. The write buffers locally and is flushed as one
    /// coalesced UPDATE per scheduling tick; it does not wait for
    /// confirmation, which arrives later through the change feed. No
    /// version check is performed: the last write submitted wins at the
    /// database, and any remote-confirmed update supersedes the pending
    /// value here.
    pub fn set(&self, field: &str, value: Value) -> Result<(), Error> {
        if field == "id" {
            return Err(Error::config("the id column cannot be written"));
        }
        if !is_safe_identifier(field) {
            return Err(Error::config(format!(
                "field name {field:?} is not a safe SQL identifier"
            )));
        }
        let schedule = {
            let mut state = self.inner.state.lock().expect("poisoned");
            state
                .unflushed
                .get_or_insert_with(RowData::new)
                .insert(field.to_owned(), value.clone());
            state
                .overlay
                .get_or_insert_with(RowData::new)
                .insert(field.to_owned(), value);
            !std::mem::replace(&mut state.flush_queued, true)
        };
        if schedule {
            if let Some(view) = self.inner.view.upgrade() {
                view.schedule_row_flush(self.clone());
            }
        }
        Ok(())
    }

    /// Returns this row's event stream, creating the sink. A second call
    /// replaces the first sink; events are only retained from the moment
    /// a sink exists, except a dispenser-assigned id, which is held and
    /// delivered as the first event once a sink attaches.
    pub fn events(&self) -> mpsc::UnboundedReceiver<RowEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.state.lock().expect("poisoned");
        if let Some(id) = state.assigned_id.take() {
            let _ = tx.send(RowEvent::IdAssigned(id));
        }
        state.events = Some(tx);
        rx
    }

    /// Applies database-confirmed state, replacing all fields and
    /// discarding the visibility overlay. Writes still awaiting a flush
    /// are kept; they will be submitted and confirmed in their own turn.
    /// Returns the prior field snapshot if (and only if) an event sink
    /// is active, so callers can emit `Changed` without copying fields
    /// for silent rows.
    pub(crate) fn apply_confirmed(&self, data: RowData) -> Option<RowData> {
        let mut state = self.inner.state.lock().expect("poisoned");
        let old = sink_active(&state).then(|| state.fields.clone());
        state.fields = data;
        state.overlay = None;
        old
    }

    /// Drains the not-yet-submitted writes for a flush. The visibility
    /// overlay stays in place until confirmed state arrives.
    pub(crate) fn take_flush_snapshot(&self) -> Option<RowData> {
        let mut state = self.inner.state.lock().expect("poisoned");
        state.flush_queued = false;
        state.unflushed.take()
    }

    /// Records the dispenser-assigned id for delivery on this row's
    /// sink: immediately if one is attached, otherwise as the first
    /// event of the next sink.
    pub(crate) fn note_assigned_id(&self, id: i64) {
        let mut state = self.inner.state.lock().expect("poisoned");
        match &state.events {
            Some(tx) if !tx.is_closed() => {
                let _ = tx.send(RowEvent::IdAssigned(id));
            }
            _ => state.assigned_id = Some(id),
        }
    }

    /// Sends an event to this row's sink, if one is active.
    pub(crate) fn emit(&self, event: RowEvent) {
        let state = self.inner.state.lock().expect("poisoned");
        if let Some(tx) = &state.events {
            let _ = tx.send(event);
        }
    }

    /// Drops the event sink, ending the receiver's stream.
    pub(crate) fn close_sink(&self) {
        let mut state = self.inner.state.lock().expect("poisoned");
        state.events = None;
    }

    /// Whether two handles are the same underlying row object.
    pub fn same_handle(a: &Row, b: &Row) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}

fn sink_active(state: &RowState) -> bool {
    state.events.as_ref().is_some_and(|tx| !tx.is_closed())
}

/// The per-view cache of live row handles, keyed by id.
pub(crate) struct RowCache {
    view: Weak<ViewCore>,
    change_now: bool,
    rows: BTreeMap<i64, Row>,
}

impl RowCache {
    pub fn new(view: Weak<ViewCore>, change_now: bool) -> RowCache {
        RowCache {
            view,
            change_now,
            rows: BTreeMap::new(),
        }
    }

    pub fn get(&self, id: i64) -> Option<Row> {
        self.rows.get(&id).cloned()
    }

    /// Pre-registers an empty handle for a freshly dispensed id, without
    /// emitting anything. This is the add path: the handle must be in
    /// the cache before the INSERT is issued, so the row's own feed
    /// notification finds it instead of creating a duplicate.
    pub fn register_new(&mut self, id: i64) -> Row {
        debug_assert!(!self.rows.contains_key(&id), "dispensed id already cached");
        let row = Row::new(id, self.change_now, self.view.clone(), RowData::new());
        self.rows.insert(id, row.clone());
        row
    }

    /// Idempotent upsert: creates and returns a handle for `data`, or
    /// returns the existing one unchanged. Duplicate delivery is
    /// expected (a locally-created row's own INSERT notification racing
    /// with the INSERT statement's confirmation) and silently absorbed.
    /// The `bool` reports whether the handle is new.
    pub fn appear(&mut self, data: RowData) -> Result<(Row, bool), Error> {
        let id = row_id(&data)?;
        if let Some(existing) = self.rows.get(&id) {
            return Ok((existing.clone(), false));
        }
        let row = Row::new(id, self.change_now, self.view.clone(), data);
        self.rows.insert(id, row.clone());
        Ok((row, true))
    }

    /// Applies a remote UPDATE. An update for a row this view has never
    /// seen degenerates to an appear. Returns the handle, the prior
    /// snapshot when a sink wants it, and whether the handle is new.
    pub fn apply_remote_update(
        &mut self,
        data: RowData,
    ) -> Result<(Row, Option<RowData>, bool), Error> {
        let id = row_id(&data)?;
        match self.rows.get(&id) {
            Some(row) => {
                let row = row.clone();
                let old = row.apply_confirmed(data);
                Ok((row, old, false))
            }
            None => {
                let (row, _) = self.appear(data)?;
                Ok((row, None, true))
            }
        }
    }

    /// Applies a remote DELETE: drops the handle from the cache. The
    /// caller emits `Disappeared` and the sink is discarded afterwards.
    pub fn apply_remote_delete(&mut self, id: i64) -> Option<Row> {
        self.rows.remove(&id)
    }

    /// Drops every row's event sink. Teardown calls this so per-row
    /// receivers observe end-of-stream rather than hanging.
    pub fn close_all_sinks(&self) {
        for row in self.rows.values() {
            row.close_sink();
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.rows.len()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn data(pairs: &[(&str, Value)]) -> RowData {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect()
    }

    fn cache(change_now: bool) -> RowCache {
        RowCache::new(Weak::new(), change_now)
    }

    #[test]
    fn appear_is_idempotent() {
        let mut cache = cache(false);
        let (first, created) = cache
            .appear(data(&[("id", json!(7)), ("a", json!("Hello"))]))
            .unwrap();
        assert!(created);
        let (second, created) = cache
            .appear(data(&[("id", json!(7)), ("a", json!("ignored"))]))
            .unwrap();
        assert!(!created);
        assert!(Row::same_handle(&first, &second));
        // The duplicate was absorbed without touching the fields.
        assert_eq!(second.get("a"), Some(json!("Hello")));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn appear_requires_an_id() {
        let mut cache = cache(false);
        assert!(cache.appear(data(&[("a", json!("Hello"))])).is_err());
    }

    #[test]
    fn pending_writes_hidden_without_change_now() {
        let mut cache = cache(false);
        let (row, _) = cache
            .appear(data(&[("id", json!(1)), ("a", json!("Hello"))]))
            .unwrap();
        row.set("a", json!("Goodbye!")).unwrap();
        assert_eq!(row.get("a"), Some(json!("Hello")));
    }

    #[test]
    fn pending_writes_visible_with_change_now() {
        let mut cache = cache(true);
        let (row, _) = cache
            .appear(data(&[("id", json!(1)), ("a", json!("Hello"))]))
            .unwrap();
        row.set("a", json!("Goodbye!")).unwrap();
        assert_eq!(row.get("a"), Some(json!("Goodbye!")));
        assert_eq!(row.fields().get("a"), Some(&json!("Goodbye!")));
    }

    #[test]
    fn remote_update_discards_overlay() {
        let mut cache = cache(true);
        let (row, _) = cache
            .appear(data(&[("id", json!(1)), ("a", json!("Hello"))]))
            .unwrap();
        row.set("a", json!("local, unconfirmed")).unwrap();

        // The remote update wins even though it is "older" than the
        // local write; blind overwrite, no version check.
        let (updated, _, created) = cache
            .apply_remote_update(data(&[("id", json!(1)), ("a", json!("remote"))]))
            .unwrap();
        assert!(!created);
        assert!(Row::same_handle(&row, &updated));
        assert_eq!(row.get("a"), Some(json!("remote")));
    }

    #[test]
    fn update_snapshot_taken_only_for_live_sinks() {
        let mut cache = cache(false);
        let (row, _) = cache
            .appear(data(&[("id", json!(1)), ("a", json!("Hello"))]))
            .unwrap();

        let (_, old, _) = cache
            .apply_remote_update(data(&[("id", json!(1)), ("a", json!("Bye"))]))
            .unwrap();
        assert!(old.is_none(), "no sink, no snapshot");

        let _events = row.events();
        let (_, old, _) = cache
            .apply_remote_update(data(&[("id", json!(1)), ("a", json!("Bye again"))]))
            .unwrap();
        assert_eq!(old.unwrap().get("a"), Some(&json!("Bye")));
    }

    #[test]
    fn update_for_unknown_row_degenerates_to_appear() {
        let mut cache = cache(false);
        let (row, _, created) = cache
            .apply_remote_update(data(&[("id", json!(9)), ("a", json!("Hi"))]))
            .unwrap();
        assert!(created);
        assert_eq!(row.id(), 9);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn delete_cleans_up() {
        let mut cache = cache(false);
        cache
            .appear(data(&[("id", json!(1)), ("a", json!("Hello"))]))
            .unwrap();
        let removed = cache.apply_remote_delete(1).unwrap();
        assert_eq!(removed.id(), 1);
        assert!(cache.get(1).is_none());
        assert!(cache.apply_remote_delete(1).is_none());
    }

    #[test]
    fn register_new_is_silent_and_found_by_appear() {
        let mut cache = cache(false);
        let row = cache.register_new(42);
        let (found, created) = cache
            .appear(data(&[("id", json!(42)), ("a", json!("Hello"))]))
            .unwrap();
        assert!(!created, "pre-registered handle absorbed the appear");
        assert!(Row::same_handle(&row, &found));
    }

    #[test]
    fn confirmation_between_flushes_keeps_unsubmitted_writes() {
        let mut cache = cache(true);
        let (row, _) = cache
            .appear(data(&[("id", json!(1)), ("a", json!("start"))]))
            .unwrap();

        row.set("a", json!("v1")).unwrap();
        let first = row.take_flush_snapshot().unwrap();
        assert_eq!(first.get("a"), Some(&json!("v1")));

        // A second write lands while v1 is in flight, then v1's own
        // confirmation comes back before the second flush runs.
        row.set("a", json!("v2")).unwrap();
        row.apply_confirmed(data(&[("id", json!(1)), ("a", json!("v1"))]));

        // The unsubmitted write survives the confirmation and is still
        // due for submission.
        let second = row.take_flush_snapshot().unwrap();
        assert_eq!(second.get("a"), Some(&json!("v2")));
        assert!(row.take_flush_snapshot().is_none());
    }

    #[test]
    fn assigned_id_is_delivered_to_the_first_sink() {
        let mut cache = cache(false);
        let row = cache.register_new(42);
        row.note_assigned_id(42);

        let mut events = row.events();
        match events.try_recv().unwrap() {
            RowEvent::IdAssigned(id) => assert_eq!(id, 42),
            other => panic!("expected IdAssigned, got {other:?}"),
        }
        // Delivered once only; a replacement sink starts empty.
        let mut replacement = row.events();
        assert!(replacement.try_recv().is_err());
    }

    #[test]
    fn set_rejects_bad_field_names() {
        let mut cache = cache(false);
        let (row, _) = cache.appear(data(&[("id", json!(1))])).unwrap();
        assert!(row.set("id", json!(2)).is_err());
        assert!(row.set("a; --", json!(2)).is_err());
    }

    #[test]
    fn confirmed_apply_clears_overlay_and_snapshots() {
        let mut cache = cache(true);
        let (row, _) = cache
            .appear(data(&[("id", json!(1)), ("a", json!("Hello"))]))
            .unwrap();
        row.set("a", json!("pending")).unwrap();
        let _events = row.events();

        let old = row
            .apply_confirmed(data(&[("id", json!(1)), ("a", json!("confirmed"))]))
            .unwrap();
        assert_eq!(old.get("a"), Some(&json!("Hello")), "snapshot is confirmed state");
        assert_eq!(row.get("a"), Some(json!("confirmed")));
    }
}
