//! Change sets: batches of upserts and deletes tagged with the intent the server announced for
//! them.
use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::{Error, Result, Selector};

/// Whether an object is being upserted or deleted.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    /// The object is created or replaced.
    #[display(fmt = "put")]
    Put,
    /// The object is deleted.
    #[display(fmt = "delete")]
    Delete,
}

/// Category of a stored object.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    /// A feature flag.
    #[display(fmt = "flag")]
    Flag,
    /// A user segment.
    #[display(fmt = "segment")]
    Segment,
}

impl ObjectKind {
    /// All known kinds, in the order they are written to a store.
    pub const ALL: [ObjectKind; 2] = [ObjectKind::Segment, ObjectKind::Flag];

    /// Parse a wire kind name. Returns `None` for kinds this SDK does not know about.
    pub fn from_wire(name: &str) -> Option<ObjectKind> {
        match name {
            "flag" => Some(ObjectKind::Flag),
            "segment" => Some(ObjectKind::Segment),
            _ => None,
        }
    }
}

/// A change to a single object.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    /// Upsert or delete.
    pub action: ChangeType,
    /// Category of the object.
    pub kind: ObjectKind,
    /// Key of the object, unique within `kind`.
    pub key: String,
    /// Object version. Stores only apply changes with a greater version than they hold.
    pub version: u64,
    /// Serialized object body. Always `None` for deletes.
    pub object: Option<serde_json::Value>,
}

impl Change {
    /// Upsert `key` at `version`.
    pub fn put(kind: ObjectKind, key: impl Into<String>, version: u64, object: serde_json::Value) -> Change {
        Change {
            action: ChangeType::Put,
            kind,
            key: key.into(),
            version,
            object: Some(object),
        }
    }

    /// Delete `key` at `version`.
    pub fn delete(kind: ObjectKind, key: impl Into<String>, version: u64) -> Change {
        Change {
            action: ChangeType::Delete,
            kind,
            key: key.into(),
            version,
            object: None,
        }
    }
}

/// What the server intends to send for the current exchange.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntentCode {
    /// The SDK is already up to date; no payload follows.
    #[serde(rename = "none")]
    #[display(fmt = "none")]
    None,
    /// A full snapshot follows and replaces everything.
    #[serde(rename = "xfer-full")]
    #[display(fmt = "xfer-full")]
    TransferFull,
    /// Incremental changes follow and are merged.
    #[serde(rename = "xfer-changes")]
    #[display(fmt = "xfer-changes")]
    TransferChanges,
}

/// A list of changes to apply according to an intent.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet {
    intent_code: IntentCode,
    changes: Vec<Change>,
    selector: Selector,
}

impl ChangeSet {
    /// How the changes must be applied.
    pub fn intent_code(&self) -> IntentCode {
        self.intent_code
    }

    /// The individual changes, in arrival order.
    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    /// Snapshot the data is at once the changes are applied.
    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    /// Split into the changes and the selector.
    pub fn into_parts(self) -> (IntentCode, Vec<Change>, Selector) {
        (self.intent_code, self.changes, self.selector)
    }
}

#[derive(Debug, Default)]
enum BuilderState {
    /// No server intent is known. Changes cannot be accepted.
    #[default]
    Idle,
    Accumulating {
        intent: IntentCode,
        changes: Vec<Change>,
    },
}

/// Accumulates changes as protocol messages arrive and seals them into a [`ChangeSet`].
///
/// The builder is owned by a single synchronizer loop and is never shared.
#[derive(Debug, Default)]
pub struct ChangeSetBuilder {
    state: BuilderState,
}

impl ChangeSetBuilder {
    /// Create an idle builder.
    pub fn new() -> ChangeSetBuilder {
        ChangeSetBuilder::default()
    }

    /// A change set saying the current data is already up to date.
    pub fn no_changes() -> ChangeSet {
        ChangeSet {
            intent_code: IntentCode::None,
            changes: Vec::new(),
            selector: Selector::none(),
        }
    }

    /// Begin a new change set with the given intent. Anything accumulated so far is dropped.
    pub fn start(&mut self, intent: IntentCode) {
        self.state = BuilderState::Accumulating {
            intent,
            changes: Vec::new(),
        };
    }

    /// The server confirmed the current data. Pending changes are dropped and any changes that
    /// follow are merged into that data.
    pub fn up_to_date(&mut self) {
        self.start(IntentCode::TransferChanges);
    }

    /// Forget the intent and every pending change.
    pub fn reset(&mut self) {
        self.state = BuilderState::Idle;
    }

    /// Intent of the open accumulation, if any.
    pub fn intent(&self) -> Option<IntentCode> {
        match &self.state {
            BuilderState::Idle => None,
            BuilderState::Accumulating { intent, .. } => Some(*intent),
        }
    }

    /// Number of changes waiting for [`ChangeSetBuilder::finish`].
    pub fn pending(&self) -> usize {
        match &self.state {
            BuilderState::Idle => 0,
            BuilderState::Accumulating { changes, .. } => changes.len(),
        }
    }

    /// Add an upsert to the open change set.
    pub fn add_put(
        &mut self,
        kind: ObjectKind,
        key: impl Into<String>,
        version: u64,
        object: serde_json::Value,
    ) -> Result<()> {
        self.push(Change::put(kind, key, version, object))
    }

    /// Add a deletion to the open change set.
    pub fn add_delete(&mut self, kind: ObjectKind, key: impl Into<String>, version: u64) -> Result<()> {
        self.push(Change::delete(kind, key, version))
    }

    fn push(&mut self, change: Change) -> Result<()> {
        match &mut self.state {
            BuilderState::Idle => Err(Error::NoServerIntent),
            BuilderState::Accumulating { changes, .. } => {
                changes.push(change);
                Ok(())
            }
        }
    }

    /// Seal the accumulated changes with `selector`.
    ///
    /// The builder keeps the intent so it can be reused for the next exchange. The server does not
    /// announce a new intent after a full transfer, so a finished full transfer is followed by
    /// incremental changes.
    pub fn finish(&mut self, selector: Selector) -> Result<ChangeSet> {
        let BuilderState::Accumulating { intent, changes } = &mut self.state else {
            return Err(Error::NoServerIntent);
        };

        let change_set = ChangeSet {
            intent_code: *intent,
            changes: std::mem::take(changes),
            selector,
        };

        if *intent == IntentCode::TransferFull {
            *intent = IntentCode::TransferChanges;
        }

        Ok(change_set)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{Change, ChangeSetBuilder, IntentCode, ObjectKind};
    use crate::{Error, Selector};

    #[test]
    fn finish_without_intent_fails() {
        let mut builder = ChangeSetBuilder::new();

        assert!(matches!(
            builder.finish(Selector::new("s", 1)),
            Err(Error::NoServerIntent)
        ));
    }

    #[test]
    fn changes_before_intent_are_rejected() {
        let mut builder = ChangeSetBuilder::new();

        assert!(builder.add_put(ObjectKind::Flag, "a", 1, json!({})).is_err());
        assert!(builder.add_delete(ObjectKind::Flag, "a", 1).is_err());
        assert_eq!(builder.pending(), 0);
    }

    #[test]
    fn finish_with_no_changes_yields_empty_set() {
        let mut builder = ChangeSetBuilder::new();
        builder.start(IntentCode::TransferChanges);

        let change_set = builder.finish(Selector::new("s1", 7)).unwrap();

        assert!(change_set.changes().is_empty());
        assert_eq!(change_set.selector(), &Selector::new("s1", 7));
        assert_eq!(change_set.intent_code(), IntentCode::TransferChanges);
    }

    #[test]
    fn finish_keeps_arrival_order() {
        let mut builder = ChangeSetBuilder::new();
        builder.start(IntentCode::TransferFull);
        builder.add_put(ObjectKind::Flag, "a", 1, json!({"on": true})).unwrap();
        builder.add_delete(ObjectKind::Segment, "b", 2).unwrap();

        let change_set = builder.finish(Selector::new("s1", 1)).unwrap();

        assert_eq!(
            change_set.changes(),
            &[
                Change::put(ObjectKind::Flag, "a", 1, json!({"on": true})),
                Change::delete(ObjectKind::Segment, "b", 2),
            ]
        );
    }

    #[test]
    fn full_transfer_becomes_incremental_after_finish() {
        let mut builder = ChangeSetBuilder::new();
        builder.start(IntentCode::TransferFull);
        builder.add_put(ObjectKind::Flag, "a", 1, json!({})).unwrap();
        let first = builder.finish(Selector::new("s1", 1)).unwrap();
        assert_eq!(first.intent_code(), IntentCode::TransferFull);

        builder.add_put(ObjectKind::Flag, "a", 2, json!({})).unwrap();
        let second = builder.finish(Selector::new("s2", 2)).unwrap();

        assert_eq!(second.intent_code(), IntentCode::TransferChanges);
        assert_eq!(second.changes().len(), 1);
        assert_eq!(second.changes()[0].version, 2);
    }

    #[test]
    fn up_to_date_accepts_incremental_changes() {
        let mut builder = ChangeSetBuilder::new();
        builder.start(IntentCode::TransferFull);
        builder.add_put(ObjectKind::Flag, "a", 1, json!({})).unwrap();

        builder.up_to_date();
        assert_eq!(builder.pending(), 0);
        builder.add_put(ObjectKind::Flag, "a", 2, json!({})).unwrap();
        let change_set = builder.finish(Selector::new("s2", 2)).unwrap();

        assert_eq!(change_set.intent_code(), IntentCode::TransferChanges);
        assert_eq!(change_set.changes().len(), 1);
    }

    #[test]
    fn reset_discards_pending_changes() {
        let mut builder = ChangeSetBuilder::new();
        builder.start(IntentCode::TransferFull);
        builder.add_put(ObjectKind::Flag, "a", 1, json!({})).unwrap();

        builder.reset();

        assert_eq!(builder.intent(), None);
        assert_eq!(builder.pending(), 0);
        assert!(builder.finish(Selector::none()).is_err());
    }

    #[test]
    fn start_drops_previous_accumulation() {
        let mut builder = ChangeSetBuilder::new();
        builder.start(IntentCode::TransferChanges);
        builder.add_delete(ObjectKind::Flag, "a", 1).unwrap();

        builder.start(IntentCode::TransferFull);

        assert_eq!(builder.pending(), 0);
        assert_eq!(builder.intent(), Some(IntentCode::TransferFull));
    }

    #[test]
    fn intent_codes_use_wire_names() {
        assert_eq!(
            serde_json::from_str::<IntentCode>(r#""xfer-full""#).unwrap(),
            IntentCode::TransferFull
        );
        assert_eq!(
            serde_json::from_str::<IntentCode>(r#""xfer-changes""#).unwrap(),
            IntentCode::TransferChanges
        );
        assert_eq!(
            serde_json::from_str::<IntentCode>(r#""none""#).unwrap(),
            IntentCode::None
        );
    }
}
