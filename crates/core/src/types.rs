//! Core types for custodian
//!
//! This module defines the vocabulary shared by the engine and the access layer:
//! - RecordId / SchemaVersion: identifiers
//! - ObjectType / Schema: the registered object types at a schema version
//! - Record: a stored object (kind + JSON fields)
//! - Query: a kind plus an optional predicate
//! - ResultSet / ChangeSet / ChangeNotification: live query deliveries

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Identifier of a stored record, unique within one store file
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(u64);

impl RecordId {
    /// Wrap a raw id
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw id value
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Monotonically increasing schema version
///
/// A store is opened with a fixed target version. Files recorded at a lower
/// version are migrated; files at a higher version were written by a newer
/// binary and are refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct SchemaVersion(u64);

impl SchemaVersion {
    /// Wrap a raw version
    pub const fn new(version: u64) -> Self {
        Self(version)
    }

    /// Raw version value
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// The version after this one
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A registered object type
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectType {
    /// Type name, used as [`Record::kind`]
    pub name: String,
}

impl ObjectType {
    /// Create an object type with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Target schema: a version plus the object types it defines
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    /// Target version
    pub version: SchemaVersion,
    /// Object types known at this version
    pub object_types: Vec<ObjectType>,
}

impl Schema {
    /// Create a schema from a version and a list of type names
    pub fn new<I, S>(version: u64, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            version: SchemaVersion::new(version),
            object_types: types.into_iter().map(ObjectType::new).collect(),
        }
    }

    /// True if `kind` names a registered object type
    pub fn contains(&self, kind: &str) -> bool {
        self.object_types.iter().any(|t| t.name == kind)
    }
}

/// A stored object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Identifier assigned by the store on insert
    pub id: RecordId,
    /// Object type name
    pub kind: String,
    /// Field values
    pub fields: serde_json::Value,
}

impl Record {
    /// Look up a top-level field
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.fields.get(name)
    }
}

type Predicate = Arc<dyn Fn(&Record) -> bool + Send + Sync>;

/// A query over one object type
///
/// Cheap to clone; the predicate is shared.
#[derive(Clone)]
pub struct Query {
    kind: String,
    predicate: Option<Predicate>,
}

impl Query {
    /// Every record of `kind`
    pub fn all(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            predicate: None,
        }
    }

    /// Narrow the query with a predicate (combined with any existing one)
    pub fn filter<F>(self, f: F) -> Self
    where
        F: Fn(&Record) -> bool + Send + Sync + 'static,
    {
        let predicate: Predicate = match self.predicate {
            Some(prev) => Arc::new(move |r: &Record| prev(r) && f(r)),
            None => Arc::new(f),
        };
        Self {
            kind: self.kind,
            predicate: Some(predicate),
        }
    }

    /// Narrow the query to records whose `field` equals `value`
    pub fn where_field(self, field: impl Into<String>, value: serde_json::Value) -> Self {
        let field = field.into();
        self.filter(move |r| r.field(&field) == Some(&value))
    }

    /// Object type queried
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// True if `record` belongs to the result set
    pub fn matches(&self, record: &Record) -> bool {
        record.kind == self.kind && self.predicate.as_ref().map_or(true, |p| p(record))
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("kind", &self.kind)
            .field("filtered", &self.predicate.is_some())
            .finish()
    }
}

/// Query results, ordered by record id
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    /// Matching records
    pub records: Vec<Record>,
}

impl ResultSet {
    /// An empty result set (the "reset" view)
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a result set, sorting by id
    pub fn from_records(mut records: Vec<Record>) -> Self {
        records.sort_by_key(|r| r.id);
        Self { records }
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True if there are no records
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterate over records
    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.iter()
    }
}

/// Incremental diff between two deliveries of a live query
///
/// `removed` indexes the previous result set; `inserted` and `modified` index
/// the new one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// Indices of new rows in the new result set
    pub inserted: Vec<usize>,
    /// Indices of dropped rows in the previous result set
    pub removed: Vec<usize>,
    /// Indices of changed rows in the new result set
    pub modified: Vec<usize>,
}

impl ChangeSet {
    /// True if nothing changed
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

/// One delivery of a live query
///
/// `changes` is `None` for the initial population.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeNotification {
    /// Current results
    pub results: ResultSet,
    /// Diff against the previous delivery
    pub changes: Option<ChangeSet>,
}

impl ChangeNotification {
    /// Initial population of a live query
    pub fn initial(results: ResultSet) -> Self {
        Self {
            results,
            changes: None,
        }
    }
}
