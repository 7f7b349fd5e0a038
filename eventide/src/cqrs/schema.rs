//! Projection schemas and document representations.

use super::{CqrsError, CqrsResult};
use crate::event::EventPosition;
use crate::types::{IndexName, PartitionKey, Timestamp};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// JSON type of a declared document field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// Text
    String,
    /// Whole number
    Integer,
    /// Floating point number
    Float,
    /// `true` / `false`
    Boolean,
    /// RFC 3339 timestamp
    Timestamp,
    /// List of values
    Array,
    /// Nested object
    Object,
}

/// A field declared by a projection schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Property name in the document body; dots address nested objects.
    pub name: String,
    /// JSON type.
    pub kind: FieldKind,
    /// Included in full-text search by backends that support it.
    pub searchable: bool,
    /// May be used in query filters.
    pub filterable: bool,
}

impl FieldSpec {
    /// A field that is neither searchable nor filterable.
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            searchable: false,
            filterable: false,
        }
    }

    /// Marks the field as searchable.
    #[must_use]
    pub const fn searchable(mut self) -> Self {
        self.searchable = true;
        self
    }

    /// Marks the field as filterable.
    #[must_use]
    pub const fn filterable(mut self) -> Self {
        self.filterable = true;
        self
    }
}

/// The structure of one projection index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    /// Index name.
    pub name: IndexName,
    /// Declared fields.
    pub fields: Vec<FieldSpec>,
}

impl IndexDefinition {
    /// Looks up a declared field.
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// Whether `name` is declared filterable.
    pub fn is_filterable(&self, name: &str) -> bool {
        self.field(name).is_some_and(|field| field.filterable)
    }
}

/// The document shape maintained by a projection.
///
/// ```rust,ignore
/// #[derive(Clone, Serialize, Deserialize)]
/// struct OrderSummary { customer_id: String, status: String, total_cents: i64 }
///
/// impl ProjectionSchema for OrderSummary {
///     fn index_name() -> IndexName { IndexName::of("order-summaries") }
///     fn fields() -> Vec<FieldSpec> {
///         vec![
///             FieldSpec::new("customer_id", FieldKind::String).filterable(),
///             FieldSpec::new("status", FieldKind::String).filterable(),
///             FieldSpec::new("total_cents", FieldKind::Integer).filterable(),
///         ]
///     }
/// }
/// ```
pub trait ProjectionSchema: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Index holding documents of this shape.
    fn index_name() -> IndexName;

    /// Declared fields.
    fn fields() -> Vec<FieldSpec>;

    /// The full index definition.
    fn definition() -> IndexDefinition {
        IndexDefinition {
            name: Self::index_name(),
            fields: Self::fields(),
        }
    }
}

/// A typed projection document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionDocument<T> {
    /// Document id, usually the id of the aggregate it is derived from.
    pub id: String,
    /// Partition key, usually the partition of the source stream.
    pub partition_key: PartitionKey,
    /// Timestamp of the last event that changed the document.
    pub updated_at: Timestamp,
    /// The declared fields.
    pub body: T,
}

impl<T> ProjectionDocument<T> {
    /// Creates a document.
    pub fn new(
        id: impl Into<String>,
        partition_key: PartitionKey,
        updated_at: Timestamp,
        body: T,
    ) -> Self {
        Self {
            id: id.into(),
            partition_key,
            updated_at,
            body,
        }
    }
}

/// A document as persisted by a [`super::DocumentStore`].
///
/// Besides the JSON body it remembers, per source stream, the highest event
/// version applied to it. Writers consult that map to ignore re-delivered
/// events, which makes event application idempotent.
///
/// `revision` is the store's write counter for the document. A store only
/// accepts a write whose `revision` matches the stored one (0 for a document
/// that does not exist yet) and bumps it on success, so concurrent
/// read-modify-write cycles cannot overwrite each other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    /// Document id.
    pub id: String,
    /// Partition key.
    pub partition_key: PartitionKey,
    /// Timestamp of the last event that changed the document.
    pub updated_at: Timestamp,
    /// Highest applied version per source stream (`partition/aggregate`).
    #[serde(default)]
    pub applied_versions: BTreeMap<String, u64>,
    /// Revision this copy was read at; 0 when never stored.
    #[serde(default)]
    pub revision: u64,
    /// JSON body.
    pub body: serde_json::Value,
}

impl StoredDocument {
    /// Serializes a typed document as a new, never-stored revision.
    pub fn from_typed<T: Serialize>(
        document: &ProjectionDocument<T>,
        applied_versions: BTreeMap<String, u64>,
    ) -> CqrsResult<Self> {
        let body = serde_json::to_value(&document.body)
            .map_err(|e| CqrsError::serialization(e.to_string()))?;
        Ok(Self {
            id: document.id.clone(),
            partition_key: document.partition_key.clone(),
            updated_at: document.updated_at,
            applied_versions,
            revision: 0,
            body,
        })
    }

    /// Takes over the bookkeeping of `base`, the copy this write replaces.
    #[must_use]
    pub fn replacing(mut self, base: &Self) -> Self {
        self.applied_versions = base.applied_versions.clone();
        self.revision = base.revision;
        self
    }

    /// Deserializes into a typed document.
    pub fn to_typed<T: DeserializeOwned>(&self) -> CqrsResult<ProjectionDocument<T>> {
        let body = serde_json::from_value(self.body.clone())
            .map_err(|e| CqrsError::serialization(e.to_string()))?;
        Ok(ProjectionDocument {
            id: self.id.clone(),
            partition_key: self.partition_key.clone(),
            updated_at: self.updated_at,
            body,
        })
    }

    /// Whether the event at `position` has already been applied.
    pub fn has_applied(&self, position: &EventPosition) -> bool {
        self.applied_versions
            .get(&position.stream.to_string())
            .is_some_and(|applied| *applied >= position.version.value())
    }

    /// Records the event at `position` as applied.
    pub fn mark_applied(&mut self, position: &EventPosition) {
        let applied = self
            .applied_versions
            .entry(position.stream.to_string())
            .or_insert(0);
        *applied = (*applied).max(position.version.value());
    }
}
