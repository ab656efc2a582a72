//! Core record model for the MapleStory DB merge tooling.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use thiserror::Error;

pub const CRATE_NAME: &str = "mdb-core";

/// Field that identifies an entity record.
pub const ID_FIELD: &str = "id";

/// Sort key for an identifier string.
///
/// Identifiers that parse as integers sort numerically and come before every
/// non-numeric identifier. Two numeric identifiers with the same value (`"7"`
/// and `"007"`) fall back to the raw string so the order stays total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdKey<'a> {
    numeric: Option<i128>,
    raw: &'a str,
}

impl<'a> IdKey<'a> {
    pub fn new(raw: &'a str) -> Self {
        Self {
            numeric: raw.trim().parse::<i128>().ok(),
            raw,
        }
    }

    pub fn is_numeric(&self) -> bool {
        self.numeric.is_some()
    }

    pub fn as_str(&self) -> &'a str {
        self.raw
    }
}

impl Ord for IdKey<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.numeric, other.numeric) {
            (Some(a), Some(b)) => a.cmp(&b).then_with(|| self.raw.cmp(other.raw)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.raw.cmp(other.raw),
        }
    }
}

impl PartialOrd for IdKey<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub fn compare_ids(a: &str, b: &str) -> Ordering {
    IdKey::new(a).cmp(&IdKey::new(b))
}

/// Sort identifiers canonically and drop duplicates.
pub fn canonical_id_list<I, S>(ids: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut ids: Vec<String> = ids.into_iter().map(Into::into).collect();
    ids.sort_by(|a, b| compare_ids(a, b));
    ids.dedup();
    ids
}

/// Which input a rejected record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Canonical,
    Incoming,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Canonical => f.write_str("canonical"),
            Origin::Incoming => f.write_str("incoming"),
        }
    }
}

/// A single record that failed validation. Never fatal on its own.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedRecord {
    #[error("record {position} is not a JSON object")]
    NotAnObject { position: usize },
    #[error("record {position} has no `{field}` field")]
    MissingField { position: usize, field: String },
    #[error("record {position} has a non-string `{field}` field")]
    NonStringField { position: usize, field: String },
    #[error("record {position} has an empty `{field}` field")]
    EmptyField { position: usize, field: String },
    #[error("record {position} has a non-numeric `{field}` attribute")]
    NonNumericAttribute { position: usize, field: String },
    #[error("record `{id}` has a `{field}` value that is not a list of identifiers")]
    InvalidDerivedField { id: String, field: String },
}

impl MalformedRecord {
    pub fn position(&self) -> Option<usize> {
        match self {
            Self::NotAnObject { position }
            | Self::MissingField { position, .. }
            | Self::NonStringField { position, .. }
            | Self::EmptyField { position, .. }
            | Self::NonNumericAttribute { position, .. } => Some(*position),
            Self::InvalidDerivedField { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub origin: Origin,
    pub reason: MalformedRecord,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.origin, self.reason)
    }
}

/// Precondition failures that make a merge result ambiguous.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeError {
    #[error("canonical collection contains identifier `{id}` more than once")]
    DuplicateIdentifierInCanonical { id: String },
    #[error("canonical relations contain pair ({source_id}, {target_id}) more than once")]
    DuplicateRelationInCanonical { source_id: String, target_id: String },
}

fn required_id(
    fields: &Map<String, Value>,
    field: &str,
    position: usize,
) -> Result<String, MalformedRecord> {
    match fields.get(field) {
        None | Some(Value::Null) => Err(MalformedRecord::MissingField {
            position,
            field: field.to_string(),
        }),
        Some(Value::String(s)) if s.trim().is_empty() => Err(MalformedRecord::EmptyField {
            position,
            field: field.to_string(),
        }),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(MalformedRecord::NonStringField {
            position,
            field: field.to_string(),
        }),
    }
}

/// Entity record: a JSON object with a non-empty string `id`.
///
/// Field order is kept as loaded so rewritten files stay diff-friendly.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Record {
    fields: Map<String, Value>,
}

impl Record {
    pub fn from_value(value: Value, position: usize) -> Result<Self, MalformedRecord> {
        let Value::Object(fields) = value else {
            return Err(MalformedRecord::NotAnObject { position });
        };
        required_id(&fields, ID_FIELD, position)?;
        Ok(Self { fields })
    }

    pub fn id(&self) -> &str {
        self.fields
            .get(ID_FIELD)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn key(&self) -> IdKey<'_> {
        IdKey::new(self.id())
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    /// Set a field. The identifier is fixed at construction, so writes to
    /// `id` are ignored.
    pub fn insert(&mut self, field: impl Into<String>, value: Value) -> Option<Value> {
        let field = field.into();
        if field == ID_FIELD {
            return None;
        }
        self.fields.insert(field, value)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }
}

/// Edge between two collections keyed by `(source_id, target_id)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Relation {
    pub source_id: String,
    pub target_id: String,
    pub attribute: Option<Number>,
    pub extra: Map<String, Value>,
}

impl Relation {
    pub fn new(source_id: impl Into<String>, target_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            target_id: target_id.into(),
            attribute: None,
            extra: Map::new(),
        }
    }

    pub fn with_attribute(mut self, attribute: impl Into<Number>) -> Self {
        self.attribute = Some(attribute.into());
        self
    }

    pub fn pair(&self) -> (&str, &str) {
        (&self.source_id, &self.target_id)
    }

    pub fn cmp_pair(&self, other: &Relation) -> Ordering {
        compare_ids(&self.source_id, &other.source_id)
            .then_with(|| compare_ids(&self.target_id, &other.target_id))
    }
}

/// Largest-wins: a present attribute beats an absent one, a larger value
/// beats a smaller one. Equal values never win.
pub fn attribute_wins(incoming: Option<&Number>, existing: Option<&Number>) -> bool {
    match (incoming, existing) {
        (None, _) => false,
        (Some(_), None) => true,
        (Some(new), Some(old)) => match (new.as_f64(), old.as_f64()) {
            (Some(new), Some(old)) => new > old,
            _ => false,
        },
    }
}

/// Field names used to read and write relations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationSchema {
    pub source_key: String,
    pub target_key: String,
    pub attribute_key: String,
}

impl Default for RelationSchema {
    fn default() -> Self {
        Self {
            source_key: "sourceId".to_string(),
            target_key: "targetId".to_string(),
            attribute_key: "rate".to_string(),
        }
    }
}

impl RelationSchema {
    /// Monster drop table layout (`monster_item_relations.json`).
    pub fn drop_table() -> Self {
        Self {
            source_key: "monsterId".to_string(),
            target_key: "itemId".to_string(),
            attribute_key: "dropRate".to_string(),
        }
    }

    pub fn decode(&self, value: Value, position: usize) -> Result<Relation, MalformedRecord> {
        let Value::Object(mut fields) = value else {
            return Err(MalformedRecord::NotAnObject { position });
        };
        let source_id = required_id(&fields, &self.source_key, position)?;
        let target_id = required_id(&fields, &self.target_key, position)?;
        let attribute = match fields.get(&self.attribute_key) {
            None | Some(Value::Null) => None,
            Some(Value::Number(n)) => Some(n.clone()),
            Some(_) => {
                return Err(MalformedRecord::NonNumericAttribute {
                    position,
                    field: self.attribute_key.clone(),
                })
            }
        };
        fields.shift_remove(&self.source_key);
        fields.shift_remove(&self.target_key);
        fields.shift_remove(&self.attribute_key);
        Ok(Relation {
            source_id,
            target_id,
            attribute,
            extra: fields,
        })
    }

    pub fn encode(&self, relation: &Relation) -> Value {
        let mut fields = Map::new();
        fields.insert(
            self.source_key.clone(),
            Value::String(relation.source_id.clone()),
        );
        fields.insert(
            self.target_key.clone(),
            Value::String(relation.target_id.clone()),
        );
        if let Some(attribute) = &relation.attribute {
            fields.insert(self.attribute_key.clone(), Value::Number(attribute.clone()));
        }
        for (key, value) in &relation.extra {
            fields.insert(key.clone(), value.clone());
        }
        Value::Object(fields)
    }
}
