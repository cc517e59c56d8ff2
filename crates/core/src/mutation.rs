//! Mutation patches and the events produced after a successful write.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::Uid;
use crate::record::{Fields, Record};

/// A change applied to matching records.
///
/// `Overwrite` replaces the listed fields wholesale. `SetOp` adds and removes
/// individual elements of an array field without touching the rest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MutationPatch {
    Overwrite { fields: Fields },
    SetOp {
        field: String,
        #[serde(default)]
        add: Vec<Value>,
        #[serde(default)]
        remove: Vec<Value>,
    },
}

impl MutationPatch {
    pub fn overwrite(fields: Fields) -> Self {
        Self::Overwrite { fields }
    }

    pub fn set_field(field: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut fields = Fields::new();
        fields.insert(field.into(), value.into());
        Self::Overwrite { fields }
    }

    pub fn add(field: impl Into<String>, values: impl IntoIterator<Item = Value>) -> Self {
        Self::SetOp {
            field: field.into(),
            add: values.into_iter().collect(),
            remove: Vec::new(),
        }
    }

    pub fn remove(field: impl Into<String>, values: impl IntoIterator<Item = Value>) -> Self {
        Self::SetOp {
            field: field.into(),
            add: Vec::new(),
            remove: values.into_iter().collect(),
        }
    }

    /// Names of the fields this patch touches, in patch order.
    pub fn touched_fields(&self) -> Vec<String> {
        match self {
            MutationPatch::Overwrite { fields } => fields.keys().cloned().collect(),
            MutationPatch::SetOp { field, .. } => vec![field.clone()],
        }
    }

    /// Apply the patch to a field map in place.
    ///
    /// Set operations treat a missing or non-array field as empty, keep element
    /// order, skip duplicates on add and remove every occurrence on remove.
    pub fn apply_to(&self, fields: &mut Fields) {
        match self {
            MutationPatch::Overwrite { fields: patch } => {
                for (k, v) in patch {
                    fields.insert(k.clone(), v.clone());
                }
            }
            MutationPatch::SetOp { field, add, remove } => {
                let mut items = match fields.remove(field) {
                    Some(Value::Array(items)) => items,
                    _ => Vec::new(),
                };
                for v in add {
                    if !items.contains(v) {
                        items.push(v.clone());
                    }
                }
                items.retain(|v| !remove.contains(v));
                fields.insert(field.clone(), Value::Array(items));
            }
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl core::fmt::Display for Operation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Produced synchronously after a successful primary write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationEvent {
    pub collection: String,
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Record>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Record>,
    #[serde(default)]
    pub changed_fields: Vec<String>,
}

impl MutationEvent {
    pub fn created(record: Record) -> Self {
        Self {
            collection: record.collection.clone(),
            operation: Operation::Create,
            changed_fields: record.fields.keys().cloned().collect(),
            before: None,
            after: Some(record),
        }
    }

    pub fn updated(before: Option<Record>, after: Record, changed_fields: Vec<String>) -> Self {
        Self {
            collection: after.collection.clone(),
            operation: Operation::Update,
            before,
            after: Some(after),
            changed_fields,
        }
    }

    pub fn deleted(before: Record) -> Self {
        Self {
            collection: before.collection.clone(),
            operation: Operation::Delete,
            changed_fields: Vec::new(),
            before: Some(before),
            after: None,
        }
    }

    /// Identity of the mutated record.
    pub fn uid(&self) -> Option<&Uid> {
        self.after
            .as_ref()
            .or(self.before.as_ref())
            .map(|r| &r.uid)
    }
}
