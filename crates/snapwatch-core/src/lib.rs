//! Core domain model and snapshot reconciliation for snapwatch.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "snapwatch-core";

/// Case- and whitespace-normalized natural key used for every comparison.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NaturalKey(String);

impl NaturalKey {
    pub fn normalize(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_lowercase()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One scraped entity: named string fields, carried through unchanged.
///
/// Empty values are not stored, so a field is either present with text or absent.
/// This keeps a record identical after a trip through a CSV table.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    fields: BTreeMap<String, String>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            fields: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .filter(|(_, v): &(String, String)| !v.is_empty())
                .collect(),
        }
    }

    pub fn with(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(field, value);
        self
    }

    /// Setting an empty value clears the field.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<String>) {
        let (field, value) = (field.into(), value.into());
        if value.is_empty() {
            self.fields.remove(&field);
        } else {
            self.fields.insert(field, value);
        }
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Compact JSON rendering used as the audit payload.
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.fields).unwrap_or_default()
    }
}

/// Declares how records of one source are keyed and laid out on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySchema {
    pub entity: String,
    pub key_field: String,
    pub columns: Vec<String>,
    pub label_field: Option<String>,
}

impl EntitySchema {
    /// The key column is always part of the payload columns; it is prepended when missing.
    pub fn new(
        entity: impl Into<String>,
        key_field: impl Into<String>,
        columns: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let key_field = key_field.into();
        let mut columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        if !columns.contains(&key_field) {
            columns.insert(0, key_field.clone());
        }
        Self {
            entity: entity.into(),
            key_field,
            columns,
            label_field: None,
        }
    }

    pub fn with_label_field(mut self, field: impl Into<String>) -> Self {
        self.label_field = Some(field.into());
        self
    }

    pub fn raw_key<'r>(&self, record: &'r Record) -> Option<&'r str> {
        record.get(&self.key_field)
    }

    pub fn key_of(&self, record: &Record) -> Option<NaturalKey> {
        self.raw_key(record).and_then(NaturalKey::normalize)
    }

    /// Human label for messages: the label column, else the raw key.
    pub fn label_of<'r>(&self, record: &'r Record) -> &'r str {
        self.label_field
            .as_deref()
            .and_then(|field| record.get(field))
            .filter(|v| !v.trim().is_empty())
            .or_else(|| self.raw_key(record))
            .unwrap_or_default()
    }
}

pub const HISTORY_FIRST_SEEN: &str = "first_seen";
pub const HISTORY_LAST_SEEN: &str = "last_seen";

/// Currently observed entities, keyed by natural key and kept in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LatestView {
    order: Vec<NaturalKey>,
    records: HashMap<NaturalKey, Record>,
}

impl LatestView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a view from raw records. Records without a usable key are dropped and
    /// counted in the second tuple element.
    pub fn from_records(
        schema: &EntitySchema,
        records: impl IntoIterator<Item = Record>,
    ) -> (Self, usize) {
        let mut view = Self::new();
        let mut unkeyed = 0usize;
        for record in records {
            match schema.key_of(&record) {
                Some(key) => {
                    view.insert(key, record);
                }
                None => unkeyed += 1,
            }
        }
        (view, unkeyed)
    }

    /// Last write wins; a replaced key keeps its original position.
    pub fn insert(&mut self, key: NaturalKey, record: Record) -> Option<Record> {
        let previous = self.records.insert(key.clone(), record);
        if previous.is_none() {
            self.order.push(key);
        }
        previous
    }

    pub fn get(&self, key: &NaturalKey) -> Option<&Record> {
        self.records.get(key)
    }

    pub fn contains(&self, key: &NaturalKey) -> bool {
        self.records.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &NaturalKey> {
        self.order.iter()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NaturalKey, &Record)> {
        self.order
            .iter()
            .filter_map(|key| self.records.get(key).map(|record| (key, record)))
    }

    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.iter().map(|(_, record)| record)
    }
}

/// Durable "have we ever seen this" row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub record: Record,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Added,
    Removed,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Added => "added",
            Direction::Removed => "removed",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `Initial` when the Latest view was empty before the reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    Initial,
    Update,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::Initial => "initial",
            AuditAction::Update => "update",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRow {
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    pub key: String,
    pub payload: Option<String>,
    pub change_type: Direction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub direction: Direction,
    pub key: NaturalKey,
    pub record: Record,
    /// First-ever appearance for `Added`, known provenance for `Removed`.
    pub notify: bool,
}

/// Everything one reconciliation wants persisted and announced.
#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub reconciled_at: DateTime<Utc>,
    pub action: AuditAction,
    pub updated_latest: LatestView,
    pub new_history_entries: Vec<HistoryEntry>,
    pub refreshed_keys: Vec<NaturalKey>,
    pub events: Vec<ChangeEvent>,
    pub audit_rows: Vec<AuditRow>,
    pub unkeyed_records: usize,
    pub duplicate_records: usize,
}

impl Reconciliation {
    pub fn notifiable(&self, direction: Direction) -> impl Iterator<Item = &ChangeEvent> {
        self.events
            .iter()
            .filter(move |e| e.notify && e.direction == direction)
    }

    pub fn count(&self, direction: Direction) -> usize {
        self.events.iter().filter(|e| e.direction == direction).count()
    }

    pub fn has_changes(&self) -> bool {
        !self.events.is_empty()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconcileError {
    /// Refusing to treat a snapshot with no keyed records as "everything removed".
    #[error("snapshot has no keyed records ({records} records, {unkeyed} without a {key_field})")]
    EmptySnapshot {
        records: usize,
        unkeyed: usize,
        key_field: String,
    },
}

/// Diffs a fresh snapshot against the Latest view and History keys of one schema.
#[derive(Debug, Clone, Copy)]
pub struct Reconciler<'a> {
    schema: &'a EntitySchema,
}

impl<'a> Reconciler<'a> {
    pub fn new(schema: &'a EntitySchema) -> Self {
        Self { schema }
    }

    pub fn reconcile(
        &self,
        snapshot: &[Record],
        current_latest: &LatestView,
        history_keys: &HashSet<NaturalKey>,
        now: DateTime<Utc>,
    ) -> Result<Reconciliation, ReconcileError> {
        let mut incoming = LatestView::new();
        let mut unkeyed = 0usize;
        let mut duplicates = 0usize;
        for record in snapshot {
            let Some(key) = self.schema.key_of(record) else {
                unkeyed += 1;
                continue;
            };
            if incoming.insert(key.clone(), record.clone()).is_some() {
                duplicates += 1;
                debug!(entity = %self.schema.entity, %key, "duplicate key in snapshot, keeping last record");
            }
        }
        if unkeyed > 0 {
            warn!(
                entity = %self.schema.entity,
                key_field = %self.schema.key_field,
                unkeyed,
                "skipping snapshot records without a natural key"
            );
        }

        if incoming.is_empty() {
            return Err(ReconcileError::EmptySnapshot {
                records: snapshot.len(),
                unkeyed,
                key_field: self.schema.key_field.clone(),
            });
        }

        let action = if current_latest.is_empty() {
            AuditAction::Initial
        } else {
            AuditAction::Update
        };

        let mut events = Vec::new();
        for (key, record) in incoming.iter() {
            if !current_latest.contains(key) {
                events.push(ChangeEvent {
                    direction: Direction::Added,
                    key: key.clone(),
                    record: record.clone(),
                    notify: !history_keys.contains(key),
                });
            }
        }
        for (key, record) in current_latest.iter() {
            if !incoming.contains(key) {
                events.push(ChangeEvent {
                    direction: Direction::Removed,
                    key: key.clone(),
                    record: record.clone(),
                    notify: history_keys.contains(key),
                });
            }
        }

        let mut new_history_entries = Vec::new();
        let mut refreshed_keys = Vec::new();
        for (key, record) in incoming.iter() {
            if history_keys.contains(key) {
                refreshed_keys.push(key.clone());
            } else {
                new_history_entries.push(HistoryEntry {
                    record: record.clone(),
                    first_seen: now,
                    last_seen: now,
                });
            }
        }

        let audit_rows = events
            .iter()
            .filter(|e| e.notify)
            .map(|e| AuditRow {
                timestamp: now,
                action,
                key: self
                    .schema
                    .raw_key(&e.record)
                    .map(|raw| raw.trim().to_string())
                    .unwrap_or_else(|| e.key.to_string()),
                payload: Some(e.record.to_json()),
                change_type: e.direction,
            })
            .collect();

        Ok(Reconciliation {
            reconciled_at: now,
            action,
            updated_latest: incoming,
            new_history_entries,
            refreshed_keys,
            events,
            audit_rows,
            unkeyed_records: unkeyed,
            duplicate_records: duplicates,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn schema() -> EntitySchema {
        EntitySchema::new("coin", "contract_address", ["name", "contract_address", "market_cap"])
            .with_label_field("name")
    }

    fn coin(name: &str, address: &str) -> Record {
        Record::new()
            .with("name", name)
            .with("contract_address", address)
            .with("market_cap", "1.2M")
    }

    fn keys(items: &[&str]) -> HashSet<NaturalKey> {
        items.iter().filter_map(|k| NaturalKey::normalize(k)).collect()
    }

    fn latest(records: &[Record]) -> LatestView {
        LatestView::from_records(&schema(), records.iter().cloned()).0
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap()
    }

    fn key(raw: &str) -> NaturalKey {
        NaturalKey::normalize(raw).unwrap()
    }

    #[test]
    fn natural_keys_ignore_case_and_surrounding_whitespace() {
        assert_eq!(NaturalKey::normalize("  0xAbC \n"), NaturalKey::normalize("0xabc"));
        assert_eq!(NaturalKey::normalize("   "), None);
    }

    #[test]
    fn schema_always_includes_key_column() {
        let schema = EntitySchema::new("reading", "date", ["value"]);
        assert_eq!(schema.columns, vec!["date".to_string(), "value".to_string()]);
    }

    #[test]
    fn fresh_store_marks_everything_added_and_first_seen() {
        let snapshot = vec![coin("Alpha", "0xA"), coin("Beta", "0xB")];
        let out = Reconciler::new(&schema())
            .reconcile(&snapshot, &LatestView::new(), &HashSet::new(), now())
            .unwrap();

        assert_eq!(out.action, AuditAction::Initial);
        assert_eq!(out.updated_latest.len(), 2);
        assert_eq!(out.new_history_entries.len(), 2);
        assert!(out
            .new_history_entries
            .iter()
            .all(|h| h.first_seen == now() && h.last_seen == now()));
        assert_eq!(out.notifiable(Direction::Added).count(), 2);
        assert_eq!(out.count(Direction::Removed), 0);
        assert_eq!(out.audit_rows.len(), 2);
        assert!(out.audit_rows.iter().all(|r| r.action == AuditAction::Initial));
    }

    #[test]
    fn reconciling_the_same_snapshot_twice_is_a_noop() {
        let schema = schema();
        let reconciler = Reconciler::new(&schema);
        let snapshot = vec![coin("Alpha", "0xA"), coin("Beta", "0xB")];
        let first = reconciler
            .reconcile(&snapshot, &LatestView::new(), &HashSet::new(), now())
            .unwrap();
        let history: HashSet<NaturalKey> = first.updated_latest.keys().cloned().collect();

        let second = reconciler
            .reconcile(&snapshot, &first.updated_latest, &history, now())
            .unwrap();
        assert!(!second.has_changes());
        assert!(second.audit_rows.is_empty());
        assert!(second.new_history_entries.is_empty());
        assert_eq!(second.updated_latest, first.updated_latest);
        assert_eq!(second.refreshed_keys.len(), 2);
    }

    #[test]
    fn empty_snapshot_is_refused() {
        let current = latest(&[coin("Alpha", "0xA")]);
        let err = Reconciler::new(&schema())
            .reconcile(&[], &current, &keys(&["0xa"]), now())
            .unwrap_err();
        assert!(matches!(err, ReconcileError::EmptySnapshot { records: 0, .. }));
    }

    #[test]
    fn snapshot_without_any_keys_counts_as_empty() {
        let current = latest(&[coin("Alpha", "0xA")]);
        let snapshot = vec![coin("Ghost", "  ")];
        let err = Reconciler::new(&schema())
            .reconcile(&snapshot, &current, &keys(&["0xa"]), now())
            .unwrap_err();
        assert_eq!(
            err,
            ReconcileError::EmptySnapshot {
                records: 1,
                unkeyed: 1,
                key_field: "contract_address".into()
            }
        );
    }

    #[test]
    fn re_added_known_entity_is_silent() {
        let current = latest(&[coin("Alpha", "0xA")]);
        let snapshot = vec![coin("Alpha", "0xA"), coin("Beta", "0xB")];
        let out = Reconciler::new(&schema())
            .reconcile(&snapshot, &current, &keys(&["0xa", "0xb"]), now())
            .unwrap();

        let added: Vec<_> = out
            .events
            .iter()
            .filter(|e| e.direction == Direction::Added)
            .collect();
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].key, key("0xb"));
        assert!(!added[0].notify);
        assert!(out.new_history_entries.is_empty());
        assert!(out.audit_rows.is_empty());
        assert!(out.updated_latest.contains(&key("0xb")));
    }

    #[test]
    fn removal_of_unrecorded_entity_is_not_notified() {
        let current = latest(&[coin("Alpha", "0xA"), coin("Noise", "0xN")]);
        let snapshot = vec![coin("Alpha", "0xA")];
        let out = Reconciler::new(&schema())
            .reconcile(&snapshot, &current, &keys(&["0xa"]), now())
            .unwrap();

        assert_eq!(out.count(Direction::Removed), 1);
        assert_eq!(out.notifiable(Direction::Removed).count(), 0);
        assert!(out.audit_rows.is_empty());
        assert!(!out.updated_latest.contains(&key("0xn")));
    }

    #[test]
    fn replaces_removed_entity_with_new_one() {
        let current = latest(&[coin("Alpha", "0xA"), coin("Beta", "0xB")]);
        let snapshot = vec![coin("Alpha", "0xA"), coin("Gamma", "0xC")];
        let out = Reconciler::new(&schema())
            .reconcile(&snapshot, &current, &keys(&["0xa", "0xb"]), now())
            .unwrap();

        let latest_keys: Vec<_> = out.updated_latest.keys().map(|k| k.as_str()).collect();
        assert_eq!(latest_keys, vec!["0xa", "0xc"]);

        let added: Vec<_> = out.notifiable(Direction::Added).collect();
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].key, key("0xc"));

        let removed: Vec<_> = out.notifiable(Direction::Removed).collect();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].key, key("0xb"));

        assert_eq!(out.new_history_entries.len(), 1);
        assert_eq!(out.new_history_entries[0].record.get("name"), Some("Gamma"));

        assert_eq!(out.audit_rows.len(), 2);
        assert!(out.audit_rows.iter().all(|r| r.action == AuditAction::Update));
        let removed_row = out
            .audit_rows
            .iter()
            .find(|r| r.change_type == Direction::Removed)
            .unwrap();
        assert_eq!(removed_row.key, "0xB");
    }

    #[test]
    fn duplicate_keys_keep_the_last_record() {
        let snapshot = vec![
            coin("First", "0xA"),
            coin("Other", "0xB"),
            coin("Second", " 0xa "),
        ];
        let out = Reconciler::new(&schema())
            .reconcile(&snapshot, &LatestView::new(), &HashSet::new(), now())
            .unwrap();

        assert_eq!(out.duplicate_records, 1);
        assert_eq!(out.updated_latest.len(), 2);
        let kept = out.updated_latest.get(&key("0xa")).unwrap();
        assert_eq!(kept.get("name"), Some("Second"));
        assert_eq!(out.new_history_entries.len(), 2);
        assert_eq!(out.updated_latest.keys().next(), Some(&key("0xa")));
    }

    #[test]
    fn comparisons_are_case_insensitive_but_storage_keeps_case() {
        let current = latest(&[coin("Alpha", "0xABC")]);
        let snapshot = vec![coin("Alpha", "0xabc")];
        let out = Reconciler::new(&schema())
            .reconcile(&snapshot, &current, &keys(&["0XABC"]), now())
            .unwrap();
        assert!(!out.has_changes());
        let stored = out.updated_latest.get(&key("0xAbC")).unwrap();
        assert_eq!(stored.get("contract_address"), Some("0xabc"));
    }

    #[test]
    fn empty_values_are_absent_fields() {
        let mut record = Record::from_pairs([("name", "Alpha"), ("symbol", "")]);
        assert_eq!(record.get("symbol"), None);
        record.set("name", "");
        assert!(record.is_empty());
    }

    #[test]
    fn label_falls_back_to_raw_key() {
        let schema = schema();
        assert_eq!(schema.label_of(&coin("Alpha", "0xA")), "Alpha");
        assert_eq!(schema.label_of(&coin(" ", "0xA")), "0xA");
    }
}
