//! Executes set-valued mutations against shared entity fields.

use crate::error::{Result, SyncError};
use crate::retry::RetryPolicy;
use crate::store::{DocumentStore, Precondition, SetOp, WriteOp};
use crate::types::{DocId, DocRef, Version};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::keyed_lock::KeyedLocks;
use super::schema::FieldSchema;
use super::set_field::{edit_map, FieldKind, MapEdit, SetField};

/// Guarded writes attempted before a composite mutation gives up.
const MAX_GUARDED_ATTEMPTS: u32 = 2;

/// Requested change to a set field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationOp {
    Add,
    Remove,
    /// Composite fields only.
    Toggle,
}

/// A single mutation of one subject in one set field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutationRequest {
    pub entity: DocRef,
    pub field: String,
    pub op: MutationOp,
    pub subject: String,
    /// Map key for composite fields (e.g. the emoji).
    #[serde(default)]
    pub key: Option<String>,
    /// Only apply if the entity is still at this version.
    #[serde(default)]
    pub expected_version: Option<Version>,
}

impl MutationRequest {
    pub fn new(entity: DocRef, field: impl Into<String>, op: MutationOp, subject: impl Into<String>) -> Self {
        Self {
            entity,
            field: field.into(),
            op,
            subject: subject.into(),
            key: None,
            expected_version: None,
        }
    }

    pub fn add(entity: DocRef, field: impl Into<String>, subject: impl Into<String>) -> Self {
        Self::new(entity, field, MutationOp::Add, subject)
    }

    pub fn remove(entity: DocRef, field: impl Into<String>, subject: impl Into<String>) -> Self {
        Self::new(entity, field, MutationOp::Remove, subject)
    }

    pub fn toggle(
        entity: DocRef,
        field: impl Into<String>,
        key: impl Into<String>,
        subject: impl Into<String>,
    ) -> Self {
        Self::new(entity, field, MutationOp::Toggle, subject).with_key(key)
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn expecting(mut self, version: Version) -> Self {
        self.expected_version = Some(version);
        self
    }
}

/// What a successful mutation did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MutationOutcome {
    pub entity: DocRef,
    pub field: String,
    pub kind: FieldKind,
    /// Writes issued, counting a guarded retry.
    pub attempts: u32,
    /// False when the field already had the requested content and no
    /// write was needed.
    pub written: bool,
}

/// Create a record and bump its parent as one all-or-nothing commit.
#[derive(Clone, Debug, PartialEq)]
pub struct CreateAndIncrement {
    pub collection: String,
    /// Id of the new record; generated when absent.
    pub id: Option<DocId>,
    pub data: Value,
    /// Field of the new record stamped with the commit time.
    pub stamp_field: Option<String>,
    pub parent: DocRef,
    pub counter_field: Option<String>,
    pub delta: i64,
    /// Field of the parent stamped with the commit time.
    pub activity_field: Option<String>,
}

impl CreateAndIncrement {
    pub fn new(collection: impl Into<String>, data: Value, parent: DocRef) -> Self {
        Self {
            collection: collection.into(),
            id: None,
            data,
            stamp_field: None,
            parent,
            counter_field: None,
            delta: 0,
            activity_field: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<DocId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn stamped(mut self, field: impl Into<String>) -> Self {
        self.stamp_field = Some(field.into());
        self
    }

    pub fn counter(mut self, field: impl Into<String>, delta: i64) -> Self {
        self.counter_field = Some(field.into());
        self.delta = delta;
        self
    }

    pub fn activity(mut self, field: impl Into<String>) -> Self {
        self.activity_field = Some(field.into());
        self
    }

    /// A chat message in `room`, stamped with the commit time, that also
    /// touches the room's last activity.
    pub fn chat_message(room: impl Into<DocId>, data: Value) -> Self {
        let room = DocRef::new("chatRooms", room);
        let mut data = data;
        if let Value::Object(map) = &mut data {
            map.insert("roomId".into(), Value::String(room.id.to_string()));
        }
        Self::new("chatMessages", data, room)
            .stamped("timestamp")
            .activity("lastActivity")
    }
}

/// Runs set mutations with the strategy their field declares.
///
/// Atomic fields go straight to the store's union/remove. Composite fields
/// are read, edited and written back under a version guard; a rejected guard
/// is retried once against fresh state before surfacing `Conflict`. Composite
/// mutations of the same (entity, field) are serialized in-process.
pub struct MutationCoordinator {
    store: Arc<dyn DocumentStore>,
    schema: FieldSchema,
    retry: RetryPolicy,
    locks: KeyedLocks<(DocRef, String)>,
}

impl MutationCoordinator {
    pub fn new(store: Arc<dyn DocumentStore>, schema: FieldSchema, retry: RetryPolicy) -> Self {
        Self {
            store,
            schema,
            retry,
            locks: KeyedLocks::new(),
        }
    }

    pub fn schema(&self) -> &FieldSchema {
        &self.schema
    }

    /// Apply `request` with the strategy its field declares.
    pub fn mutate_set(&self, request: &MutationRequest) -> Result<MutationOutcome> {
        let set_field = self
            .schema
            .lookup(&request.entity.collection, &request.field)?
            .clone();
        let subject = Value::String(request.subject.clone());

        match (set_field.kind, request.op) {
            (FieldKind::Atomic, MutationOp::Toggle) => Err(SyncError::InvalidArgument(format!(
                "toggle is not supported on atomic field '{}'",
                request.field
            ))),
            (FieldKind::Atomic, op) => {
                let op = if op == MutationOp::Add { SetOp::Add } else { SetOp::Remove };
                self.atomic(&set_field, &request.entity, op, subject, request.expected_version)
            }
            (FieldKind::Composite, op) => {
                let key = request.key.as_deref().ok_or_else(|| {
                    SyncError::InvalidArgument(format!(
                        "composite field '{}' requires a key",
                        request.field
                    ))
                })?;
                let edit = match op {
                    MutationOp::Add => MapEdit::Add,
                    MutationOp::Remove => MapEdit::Remove,
                    MutationOp::Toggle => MapEdit::Toggle,
                };
                self.guarded_edit(&set_field, &request.entity, key, &subject, edit, request.expected_version)
            }
        }
    }

    /// Native union/remove of `subject` in an atomic field. No read, no
    /// conflict retry.
    pub fn apply_atomic_set_op(
        &self,
        entity: &DocRef,
        field: &str,
        op: SetOp,
        subject: &str,
    ) -> Result<MutationOutcome> {
        let set_field = self.expect_kind(entity, field, FieldKind::Atomic)?;
        self.atomic(&set_field, entity, op, Value::String(subject.to_string()), None)
    }

    /// Toggle `subject` in `field[key]` of a composite field.
    pub fn apply_map_toggle(
        &self,
        entity: &DocRef,
        field: &str,
        key: &str,
        subject: &str,
    ) -> Result<MutationOutcome> {
        let set_field = self.expect_kind(entity, field, FieldKind::Composite)?;
        let subject = Value::String(subject.to_string());
        self.guarded_edit(&set_field, entity, key, &subject, MapEdit::Toggle, None)
    }

    /// Create a record and update its parent in one batch. Returns the new
    /// record's reference.
    pub fn apply_create_and_increment(&self, request: &CreateAndIncrement) -> Result<DocRef> {
        let created = DocRef::new(
            request.collection.clone(),
            request.id.clone().unwrap_or_else(DocId::generate),
        );

        let mut ops = vec![WriteOp::Create {
            doc: created.clone(),
            data: request.data.clone(),
        }];
        if let Some(field) = &request.stamp_field {
            ops.push(WriteOp::ServerTimestamp {
                doc: created.clone(),
                field: field.clone(),
            });
        }
        if let Some(field) = &request.counter_field {
            ops.push(WriteOp::Increment {
                doc: request.parent.clone(),
                field: field.clone(),
                delta: request.delta,
            });
        }
        if let Some(field) = &request.activity_field {
            ops.push(WriteOp::ServerTimestamp {
                doc: request.parent.clone(),
                field: field.clone(),
            });
        }

        let seq = self
            .retry
            .run("create_and_increment", || self.store.batch(ops.clone()))?;
        info!(doc = %created, parent = %request.parent, ?seq, "record created");
        Ok(created)
    }

    fn expect_kind(&self, entity: &DocRef, field: &str, kind: FieldKind) -> Result<SetField> {
        let set_field = self.schema.lookup(&entity.collection, field)?;
        if set_field.kind != kind {
            return Err(SyncError::InvalidArgument(format!(
                "field '{}.{}' is {:?}, not {:?}",
                entity.collection, field, set_field.kind, kind
            )));
        }
        Ok(set_field.clone())
    }

    fn atomic(
        &self,
        set_field: &SetField,
        entity: &DocRef,
        op: SetOp,
        subject: Value,
        expected: Option<Version>,
    ) -> Result<MutationOutcome> {
        if let Some(counter) = &set_field.counter {
            return self.counted(set_field, counter, entity, op, subject, expected);
        }

        let result = if set_field.touch.is_none() && expected.is_none() {
            self.retry.run("atomic_set_op", || {
                self.store
                    .atomic_set_op(entity, &set_field.field, op, subject.clone())
                    .map(|_| ())
            })
        } else {
            let mut ops = Vec::with_capacity(3);
            if let Some(version) = expected {
                // empty guarded update pins the batch to the caller's version
                ops.push(WriteOp::Update {
                    doc: entity.clone(),
                    patch: Map::new(),
                    precondition: Precondition::Version(version),
                });
            }
            ops.push(WriteOp::SetOp {
                doc: entity.clone(),
                field: set_field.field.clone(),
                op,
                value: subject,
            });
            if let Some(touch) = &set_field.touch {
                ops.push(WriteOp::ServerTimestamp {
                    doc: entity.clone(),
                    field: touch.clone(),
                });
            }
            self.retry
                .run("atomic_set_op", || self.store.batch(ops.clone()).map(|_| ()))
        };

        match result {
            Ok(()) => {
                debug!(doc = %entity, field = %set_field.field, ?op, "atomic set op applied");
                Ok(MutationOutcome {
                    entity: entity.clone(),
                    field: set_field.field.clone(),
                    kind: FieldKind::Atomic,
                    attempts: 1,
                    written: true,
                })
            }
            Err(SyncError::VersionMismatch { found, .. }) => Err(SyncError::Conflict {
                doc: entity.clone(),
                field: set_field.field.clone(),
                seen: found,
            }),
            Err(e) => Err(e),
        }
    }

    /// Atomic set op that also moves the field's counter. Membership is read
    /// first so a repeated join or leave neither writes nor counts, and the
    /// batch is pinned to the version that was read.
    fn counted(
        &self,
        set_field: &SetField,
        counter: &str,
        entity: &DocRef,
        op: SetOp,
        subject: Value,
        expected: Option<Version>,
    ) -> Result<MutationOutcome> {
        let _held = self.locks.lock((entity.clone(), set_field.field.clone()));
        let mut expected = expected;
        let mut attempts = 0;

        loop {
            let doc = self
                .retry
                .run("get", || self.store.get(entity))?
                .ok_or_else(|| SyncError::NotFound(entity.clone()))?;

            if let Some(version) = expected.take() {
                if version != doc.version {
                    return Err(SyncError::Conflict {
                        doc: entity.clone(),
                        field: set_field.field.clone(),
                        seen: doc.version,
                    });
                }
            }

            let present = match doc.data.get(&set_field.field) {
                Some(Value::Array(items)) => items.contains(&subject),
                _ => false,
            };
            let delta = match (op, present) {
                (SetOp::Add, false) => 1,
                (SetOp::Remove, true) => -1,
                _ => 0,
            };
            if delta == 0 {
                return Ok(MutationOutcome {
                    entity: entity.clone(),
                    field: set_field.field.clone(),
                    kind: FieldKind::Atomic,
                    attempts,
                    written: false,
                });
            }

            attempts += 1;
            let mut ops = vec![
                WriteOp::Update {
                    doc: entity.clone(),
                    patch: Map::new(),
                    precondition: Precondition::Version(doc.version),
                },
                WriteOp::SetOp {
                    doc: entity.clone(),
                    field: set_field.field.clone(),
                    op,
                    value: subject.clone(),
                },
                WriteOp::Increment {
                    doc: entity.clone(),
                    field: counter.to_string(),
                    delta,
                },
            ];
            if let Some(touch) = &set_field.touch {
                ops.push(WriteOp::ServerTimestamp {
                    doc: entity.clone(),
                    field: touch.clone(),
                });
            }

            match self.retry.run("counted_set_op", || self.store.batch(ops.clone())) {
                Ok(_) => {
                    debug!(doc = %entity, field = %set_field.field, counter, delta, "counted set op applied");
                    return Ok(MutationOutcome {
                        entity: entity.clone(),
                        field: set_field.field.clone(),
                        kind: FieldKind::Atomic,
                        attempts,
                        written: true,
                    });
                }
                Err(SyncError::VersionMismatch { found, .. }) => {
                    if attempts >= MAX_GUARDED_ATTEMPTS {
                        warn!(doc = %entity, field = %set_field.field, ?found, "conflict retry exhausted");
                        return Err(SyncError::Conflict {
                            doc: entity.clone(),
                            field: set_field.field.clone(),
                            seen: found,
                        });
                    }
                    debug!(doc = %entity, field = %set_field.field, ?found, "membership changed underneath, re-reading");
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn guarded_edit(
        &self,
        set_field: &SetField,
        entity: &DocRef,
        key: &str,
        subject: &Value,
        edit: MapEdit,
        expected: Option<Version>,
    ) -> Result<MutationOutcome> {
        let _held = self.locks.lock((entity.clone(), set_field.field.clone()));
        let mut pinned = expected;
        let mut attempts = 0;

        loop {
            let doc = self
                .retry
                .run("get", || self.store.get(entity))?
                .ok_or_else(|| SyncError::NotFound(entity.clone()))?;

            let (value, changed) = edit_map(doc.data.get(&set_field.field), key, subject, edit)?;
            if !changed {
                return Ok(MutationOutcome {
                    entity: entity.clone(),
                    field: set_field.field.clone(),
                    kind: FieldKind::Composite,
                    attempts,
                    written: false,
                });
            }

            attempts += 1;
            let guard = pinned.take().unwrap_or(doc.version);
            match self.write_guarded(set_field, entity, value, guard) {
                Ok(()) => {
                    debug!(doc = %entity, field = %set_field.field, key, attempts, "composite field written");
                    return Ok(MutationOutcome {
                        entity: entity.clone(),
                        field: set_field.field.clone(),
                        kind: FieldKind::Composite,
                        attempts,
                        written: true,
                    });
                }
                Err(SyncError::VersionMismatch {
                    expected: guarded,
                    found,
                    ..
                }) => {
                    if attempts >= MAX_GUARDED_ATTEMPTS {
                        warn!(doc = %entity, field = %set_field.field, ?found, "conflict retry exhausted");
                        return Err(SyncError::Conflict {
                            doc: entity.clone(),
                            field: set_field.field.clone(),
                            seen: found,
                        });
                    }
                    debug!(
                        doc = %entity,
                        field = %set_field.field,
                        ?guarded,
                        ?found,
                        "concurrent modification, re-reading"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Write the whole field back, only if the entity is still at `guard`.
    /// A rejected write leaves the store untouched, so a transient failure
    /// may be retried as is.
    fn write_guarded(&self, set_field: &SetField, entity: &DocRef, value: Value, guard: Version) -> Result<()> {
        let mut patch = Map::new();
        patch.insert(set_field.field.clone(), value);
        let precondition = Precondition::Version(guard);

        match &set_field.touch {
            None => self.retry.run("guarded_update", || {
                self.store
                    .update(entity, patch.clone(), precondition)
                    .map(|_| ())
            }),
            Some(touch) => {
                let ops = vec![
                    WriteOp::Update {
                        doc: entity.clone(),
                        patch,
                        precondition,
                    },
                    WriteOp::ServerTimestamp {
                        doc: entity.clone(),
                        field: touch.clone(),
                    },
                ];
                self.retry
                    .run("guarded_update", || self.store.batch(ops.clone()).map(|_| ()))
            }
        }
    }
}
