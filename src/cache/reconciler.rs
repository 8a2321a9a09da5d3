//! Per-query snapshot reconciliation.

use crate::query::{ExecutionMode, QueryId, SnapshotOrder};
use crate::store::{ChangeKind, DocumentChange, QueryResult};
use crate::types::{DocId, Document, Sequence};
use std::collections::HashMap;
use tracing::debug;

/// One document in a snapshot, stamped with the sequence of the event that
/// last wrote it.
#[derive(Clone, Debug, PartialEq)]
pub struct SnapshotEntry {
    pub doc: Document,
    pub local_seq: Sequence,
}

/// Materialized, ordered result of a live query at a point in time.
#[derive(Clone, Debug, PartialEq)]
pub struct QuerySnapshot {
    pub query_id: QueryId,
    pub mode: ExecutionMode,
    /// Latest applied sequence marker.
    pub local_seq: Sequence,
    /// Ordered documents, limited to the query's window.
    pub documents: Vec<SnapshotEntry>,
    /// Selection/scroll anchor, if it is still in the result.
    pub anchor: Option<DocId>,
}

impl QuerySnapshot {
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.documents.iter().map(|e| e.doc.id.as_str()).collect()
    }

    pub fn get(&self, id: &str) -> Option<&Document> {
        self.documents
            .iter()
            .find(|e| e.doc.id.as_str() == id)
            .map(|e| &e.doc)
    }

    /// Position of the anchor in the window.
    pub fn anchor_index(&self) -> Option<usize> {
        let anchor = self.anchor.as_ref()?;
        self.documents.iter().position(|e| &e.doc.id == anchor)
    }
}

/// What happened to an incoming event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Older than state already applied; discarded.
    Stale,
}

/// Holds the ordered snapshot of one live query and merges push events and
/// refetches into it.
///
/// Events for one query arrive in order on one thread at a time, so the
/// reconciler itself is not synchronized.
#[derive(Debug)]
pub struct Reconciler {
    order: SnapshotOrder,
    limit: Option<usize>,
    /// Every known document in `order`; the window is a prefix.
    entries: Vec<SnapshotEntry>,
    local_seq: Sequence,
    /// Sequence of the last wholesale replace; incremental events at or
    /// below it are already reflected.
    floor: Sequence,
    anchor: Option<DocId>,
    loaded: bool,
}

impl Reconciler {
    pub fn new(order: SnapshotOrder, limit: Option<usize>) -> Self {
        Self {
            order,
            limit,
            entries: Vec::new(),
            local_seq: Sequence::default(),
            floor: Sequence::default(),
            anchor: None,
            loaded: false,
        }
    }

    pub fn local_seq(&self) -> Sequence {
        self.local_seq
    }

    /// Whether a full result has been applied yet.
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn anchor(&self) -> Option<&DocId> {
        self.anchor.as_ref()
    }

    pub fn set_anchor(&mut self, anchor: Option<DocId>) {
        self.anchor = anchor;
    }

    /// Ordered window exposed to consumers.
    pub fn view(&self) -> &[SnapshotEntry] {
        match self.limit {
            Some(limit) if limit < self.entries.len() => &self.entries[..limit],
            _ => &self.entries,
        }
    }

    pub fn snapshot(&self, query_id: &QueryId, mode: ExecutionMode) -> QuerySnapshot {
        QuerySnapshot {
            query_id: query_id.clone(),
            mode,
            local_seq: self.local_seq,
            documents: self.view().to_vec(),
            anchor: self.anchor.clone(),
        }
    }

    /// Switch ordering (e.g. after degrading) and re-sort what is held.
    pub fn reorder(&mut self, order: SnapshotOrder, limit: Option<usize>) {
        self.order = order;
        self.limit = limit;
        let order = &self.order;
        self.entries.sort_by(|a, b| order.compare(&a.doc, &b.doc));
    }

    /// Replace the list wholesale with a complete result as of `seq`.
    ///
    /// Discarded if older than what is already applied. A document already
    /// held with a newer sequence keeps its held version.
    pub fn apply_full(&mut self, documents: Vec<Document>, seq: Sequence) -> ApplyOutcome {
        if self.loaded && seq < self.local_seq {
            debug!(?seq, local_seq = ?self.local_seq, "discarding stale full result");
            return ApplyOutcome::Stale;
        }

        let mut held: HashMap<DocId, SnapshotEntry> = self
            .entries
            .drain(..)
            .map(|e| (e.doc.id.clone(), e))
            .collect();

        let mut merged: HashMap<DocId, SnapshotEntry> = HashMap::with_capacity(documents.len());
        for doc in documents {
            let entry = match held.remove(&doc.id) {
                Some(existing) if existing.local_seq > seq => existing,
                _ => SnapshotEntry { doc, local_seq: seq },
            };
            merged.insert(entry.doc.id.clone(), entry);
        }

        let mut entries: Vec<SnapshotEntry> = merged.into_values().collect();
        let order = &self.order;
        entries.sort_by(|a, b| order.compare(&a.doc, &b.doc));
        self.entries = entries;

        self.local_seq = self.local_seq.max(seq);
        self.floor = seq;
        self.loaded = true;
        self.retain_anchor();
        ApplyOutcome::Applied
    }

    /// Splice a single change into the ordered list by binary search.
    pub fn apply_change(&mut self, change: DocumentChange, seq: Sequence) -> ApplyOutcome {
        if self.loaded && seq <= self.floor {
            return ApplyOutcome::Stale;
        }

        let existing = self
            .entries
            .iter()
            .position(|e| e.doc.id == change.doc.id);

        if let Some(pos) = existing {
            if self.entries[pos].local_seq > seq {
                return ApplyOutcome::Stale;
            }
            self.entries.remove(pos);
        }

        if change.kind != ChangeKind::Removed {
            let order = &self.order;
            let pos = self
                .entries
                .binary_search_by(|e| order.compare(&e.doc, &change.doc))
                .unwrap_or_else(|p| p);
            self.entries.insert(
                pos,
                SnapshotEntry {
                    doc: change.doc,
                    local_seq: seq,
                },
            );
        }

        self.local_seq = self.local_seq.max(seq);
        self.retain_anchor();
        ApplyOutcome::Applied
    }

    /// Merge a refetch. Applied only if its read position is not older than
    /// the latest applied event, so a slow refetch never clobbers a newer
    /// push.
    pub fn apply_refetch(&mut self, result: QueryResult) -> ApplyOutcome {
        if result.read_seq < self.local_seq {
            debug!(
                read_seq = ?result.read_seq,
                local_seq = ?self.local_seq,
                "discarding refetch older than applied events"
            );
            return ApplyOutcome::Stale;
        }
        self.apply_full(result.documents, result.read_seq)
    }

    fn retain_anchor(&mut self) {
        if let Some(anchor) = &self.anchor {
            if !self.entries.iter().any(|e| &e.doc.id == anchor) {
                self.anchor = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::OrderSpec;
    use serde_json::json;

    fn msg(id: &str, ts: i64) -> Document {
        Document::new(id, json!({"timestamp": ts}))
    }

    fn by_timestamp() -> Reconciler {
        Reconciler::new(SnapshotOrder::Declared(Some(OrderSpec::asc("timestamp"))), Some(100))
    }

    fn added(doc: Document) -> DocumentChange {
        DocumentChange {
            kind: ChangeKind::Added,
            doc,
        }
    }

    fn ids(r: &Reconciler) -> Vec<&str> {
        r.view().iter().map(|e| e.doc.id.as_str()).collect()
    }

    #[test]
    fn test_out_of_order_push_is_spliced() {
        let mut r = by_timestamp();
        r.apply_full(vec![], Sequence(0));
        r.apply_change(added(msg("m1", 10)), Sequence(1));
        r.apply_change(added(msg("m3", 30)), Sequence(2));
        r.apply_change(added(msg("m2", 20)), Sequence(3));

        assert_eq!(ids(&r), vec!["m1", "m2", "m3"]);
        assert_eq!(r.local_seq(), Sequence(3));
    }

    #[test]
    fn test_modified_moves_to_new_position() {
        let mut r = by_timestamp();
        r.apply_full(vec![msg("a", 1), msg("b", 2), msg("c", 3)], Sequence(5));
        r.apply_change(
            DocumentChange {
                kind: ChangeKind::Modified,
                doc: msg("a", 4),
            },
            Sequence(6),
        );
        assert_eq!(ids(&r), vec!["b", "c", "a"]);
    }

    #[test]
    fn test_removed_drops_entry() {
        let mut r = by_timestamp();
        r.apply_full(vec![msg("a", 1), msg("b", 2)], Sequence(1));
        r.apply_change(
            DocumentChange {
                kind: ChangeKind::Removed,
                doc: msg("a", 1),
            },
            Sequence(2),
        );
        assert_eq!(ids(&r), vec!["b"]);
    }

    #[test]
    fn test_stale_refetch_is_discarded() {
        let mut r = by_timestamp();
        r.apply_full(vec![msg("a", 1)], Sequence(1));
        r.apply_change(added(msg("b", 2)), Sequence(4));

        let outcome = r.apply_refetch(QueryResult {
            documents: vec![msg("a", 1)],
            read_seq: Sequence(3),
        });
        assert_eq!(outcome, ApplyOutcome::Stale);
        assert_eq!(ids(&r), vec!["a", "b"]);
    }

    #[test]
    fn test_current_refetch_replaces_and_floors_incrementals() {
        let mut r = by_timestamp();
        r.apply_full(vec![msg("a", 1)], Sequence(1));

        let outcome = r.apply_refetch(QueryResult {
            documents: vec![msg("a", 1), msg("b", 2)],
            read_seq: Sequence(5),
        });
        assert_eq!(outcome, ApplyOutcome::Applied);

        // push for a commit the refetch already reflected
        let late = r.apply_change(added(msg("z", 0)), Sequence(4));
        assert_eq!(late, ApplyOutcome::Stale);
        assert_eq!(ids(&r), vec!["a", "b"]);
        assert_eq!(r.local_seq(), Sequence(5));
    }

    #[test]
    fn test_local_seq_never_decreases() {
        let mut r = by_timestamp();
        r.apply_full(vec![msg("a", 1)], Sequence(7));
        r.apply_full(vec![msg("a", 1)], Sequence(3));
        assert_eq!(r.local_seq(), Sequence(7));
    }

    #[test]
    fn test_anchor_survives_full_replace_by_id() {
        let mut r = by_timestamp();
        r.apply_full(vec![msg("a", 1), msg("b", 2)], Sequence(1));
        r.set_anchor(Some(DocId::from("b")));

        r.apply_full(vec![msg("z", 0), msg("a", 1), msg("b", 2)], Sequence(2));
        let snap = r.snapshot(&QueryId("q".into()), ExecutionMode::Primary);
        assert_eq!(snap.anchor_index(), Some(2));

        r.apply_full(vec![msg("a", 1)], Sequence(3));
        assert!(r.anchor().is_none());
    }

    #[test]
    fn test_view_respects_limit_and_backfills() {
        let mut r = Reconciler::new(SnapshotOrder::Declared(Some(OrderSpec::asc("timestamp"))), Some(2));
        r.apply_full(vec![msg("a", 1), msg("b", 2), msg("c", 3)], Sequence(1));
        assert_eq!(ids(&r), vec!["a", "b"]);

        r.apply_change(
            DocumentChange {
                kind: ChangeKind::Removed,
                doc: msg("a", 1),
            },
            Sequence(2),
        );
        assert_eq!(ids(&r), vec!["b", "c"]);
    }

    #[test]
    fn test_reorder_for_degraded_mode() {
        use crate::types::Timestamp;

        let mut r = by_timestamp();
        r.apply_full(
            vec![
                msg("a", 1).with_create_time(Timestamp(100)),
                msg("b", 2).with_create_time(Timestamp(300)),
                msg("c", 3),
            ],
            Sequence(1),
        );
        r.reorder(SnapshotOrder::Degraded, Some(100));
        assert_eq!(ids(&r), vec!["c", "b", "a"]);
    }
}
