//! Identifier-keyed merge engine for canonical collections.
//!
//! Every operation takes its inputs by value and returns a fresh, canonically
//! ordered result together with a [`MergeSummary`]. Nothing here touches the
//! filesystem.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use mdb_core::{
    attribute_wins, canonical_id_list, IdKey, MalformedRecord, MergeError, Origin, Record,
    Rejection, Relation, RelationSchema,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, info_span, warn};

pub const CRATE_NAME: &str = "mdb-merge";

/// Counts reported after every operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub added: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub rejections: Vec<Rejection>,
}

impl MergeSummary {
    pub fn malformed(&self) -> usize {
        self.rejections.len()
    }

    fn reject(&mut self, origin: Origin, reason: MalformedRecord) {
        warn!(%origin, %reason, "skipping malformed record");
        self.rejections.push(Rejection { origin, reason });
    }
}

impl fmt::Display for MergeSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "added={} updated={} unchanged={} malformed={}",
            self.added,
            self.updated,
            self.unchanged,
            self.malformed()
        )
    }
}

/// Entity records in canonical order with unique identifiers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Collection {
    records: Vec<Record>,
}

impl Collection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate raw canonical values. Malformed records are dropped and
    /// returned as rejections; a repeated identifier fails the whole load.
    pub fn from_values(values: Vec<Value>) -> Result<(Self, Vec<Rejection>), MergeError> {
        let mut records = Vec::with_capacity(values.len());
        let mut rejections = Vec::new();
        for (position, value) in values.into_iter().enumerate() {
            match Record::from_value(value, position) {
                Ok(record) => records.push(record),
                Err(reason) => {
                    warn!(%reason, "dropping malformed canonical record");
                    rejections.push(Rejection {
                        origin: Origin::Canonical,
                        reason,
                    });
                }
            }
        }
        Ok((Self::from_records(records)?, rejections))
    }

    pub fn from_records(mut records: Vec<Record>) -> Result<Self, MergeError> {
        records.sort_by(|a, b| a.key().cmp(&b.key()));
        if let Some(pair) = records.windows(2).find(|w| w[0].id() == w[1].id()) {
            return Err(MergeError::DuplicateIdentifierInCanonical {
                id: pair[0].id().to_string(),
            });
        }
        Ok(Self { records })
    }

    pub fn get(&self, id: &str) -> Option<&Record> {
        let key = IdKey::new(id);
        self.records
            .binary_search_by(|r| r.key().cmp(&key))
            .ok()
            .map(|i| &self.records[i])
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.iter()
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }

    pub fn into_values(self) -> Vec<Value> {
        self.records.into_iter().map(Record::into_value).collect()
    }
}

/// How an incoming record combines with the stored record sharing its id.
pub trait ConflictResolver {
    fn resolve(&self, existing: &Record, incoming: &Record) -> Record;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// Incoming record replaces the stored one wholesale.
    Replace,
    /// Only fields missing from the stored record are copied.
    #[serde(alias = "keep-existing")]
    FieldMergeKeepExisting,
    /// Every incoming field is copied over the stored record.
    #[default]
    #[serde(alias = "incoming-wins")]
    FieldMergeIncomingWins,
}

impl ConflictResolver for ConflictPolicy {
    fn resolve(&self, existing: &Record, incoming: &Record) -> Record {
        match self {
            ConflictPolicy::Replace => incoming.clone(),
            ConflictPolicy::FieldMergeKeepExisting => {
                let mut merged = existing.clone();
                for (field, value) in incoming.fields() {
                    if !merged.contains(field) {
                        merged.insert(field.clone(), value.clone());
                    }
                }
                merged
            }
            ConflictPolicy::FieldMergeIncomingWins => {
                let mut merged = existing.clone();
                for (field, value) in incoming.fields() {
                    merged.insert(field.clone(), value.clone());
                }
                merged
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown conflict policy `{0}` (expected replace, keep-existing or incoming-wins)")]
pub struct ParsePolicyError(String);

impl FromStr for ConflictPolicy {
    type Err = ParsePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "replace" => Ok(Self::Replace),
            "keep-existing" | "field-merge-keep-existing" | "fieldMergeKeepExisting" => {
                Ok(Self::FieldMergeKeepExisting)
            }
            "incoming-wins" | "field-merge-incoming-wins" | "fieldMergeIncomingWins" => {
                Ok(Self::FieldMergeIncomingWins)
            }
            other => Err(ParsePolicyError(other.to_string())),
        }
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Replace => "replace",
            Self::FieldMergeKeepExisting => "keep-existing",
            Self::FieldMergeIncomingWins => "incoming-wins",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityMerge {
    pub collection: Collection,
    pub summary: MergeSummary,
}

/// Validate `canonical`, then upsert `incoming` into it.
pub fn merge_entities<R>(
    canonical: Vec<Value>,
    incoming: Vec<Value>,
    resolver: &R,
) -> Result<EntityMerge, MergeError>
where
    R: ConflictResolver + ?Sized,
{
    let (collection, rejections) = Collection::from_values(canonical)?;
    let mut merge = merge_records(collection, incoming, resolver);
    let mut all = rejections;
    all.append(&mut merge.summary.rejections);
    merge.summary.rejections = all;
    Ok(merge)
}

/// Upsert an incoming batch into an already validated collection.
///
/// Records in the batch that share an identifier are folded together in
/// batch order under the same resolver first, so every identifier counts
/// at most once. A merge that leaves a record equal field-for-field keeps
/// the stored record untouched.
pub fn merge_records<R>(canonical: Collection, incoming: Vec<Value>, resolver: &R) -> EntityMerge
where
    R: ConflictResolver + ?Sized,
{
    let span = info_span!("merge_entities", canonical = canonical.len(), incoming = incoming.len());
    let _guard = span.enter();

    let mut summary = MergeSummary::default();
    let mut folded: Vec<Record> = Vec::new();
    let mut folded_index: HashMap<String, usize> = HashMap::new();
    for (position, value) in incoming.into_iter().enumerate() {
        let record = match Record::from_value(value, position) {
            Ok(record) => record,
            Err(reason) => {
                summary.reject(Origin::Incoming, reason);
                continue;
            }
        };
        match folded_index.get(record.id()) {
            Some(&i) => folded[i] = resolver.resolve(&folded[i], &record),
            None => {
                folded_index.insert(record.id().to_string(), folded.len());
                folded.push(record);
            }
        }
    }

    let mut records = canonical.into_records();
    let index: HashMap<String, usize> = records
        .iter()
        .enumerate()
        .map(|(i, r)| (r.id().to_string(), i))
        .collect();

    for record in folded {
        match index.get(record.id()) {
            Some(&i) => {
                let merged = resolver.resolve(&records[i], &record);
                if merged == records[i] {
                    summary.unchanged += 1;
                } else {
                    records[i] = merged;
                    summary.updated += 1;
                }
            }
            None => {
                records.push(record);
                summary.added += 1;
            }
        }
    }

    records.sort_by(|a, b| a.key().cmp(&b.key()));
    info!(%summary, "entity merge finished");
    EntityMerge {
        collection: Collection { records },
        summary,
    }
}

/// Relations in canonical pair order, unique by `(source_id, target_id)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelationSet {
    relations: Vec<Relation>,
}

impl RelationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_values(
        values: Vec<Value>,
        schema: &RelationSchema,
    ) -> Result<(Self, Vec<Rejection>), MergeError> {
        let mut relations = Vec::with_capacity(values.len());
        let mut rejections = Vec::new();
        for (position, value) in values.into_iter().enumerate() {
            match schema.decode(value, position) {
                Ok(relation) => relations.push(relation),
                Err(reason) => {
                    warn!(%reason, "dropping malformed canonical relation");
                    rejections.push(Rejection {
                        origin: Origin::Canonical,
                        reason,
                    });
                }
            }
        }
        Ok((Self::from_relations(relations)?, rejections))
    }

    pub fn from_relations(mut relations: Vec<Relation>) -> Result<Self, MergeError> {
        relations.sort_by(|a, b| a.cmp_pair(b));
        if let Some(pair) = relations.windows(2).find(|w| w[0].pair() == w[1].pair()) {
            return Err(MergeError::DuplicateRelationInCanonical {
                source_id: pair[0].source_id.clone(),
                target_id: pair[0].target_id.clone(),
            });
        }
        Ok(Self { relations })
    }

    /// Build a set from relations that may repeat a pair, keeping the
    /// largest attribute for each pair.
    pub fn collapse(relations: Vec<Relation>) -> Self {
        let mut folded: Vec<Relation> = Vec::with_capacity(relations.len());
        let mut index: HashMap<(String, String), usize> = HashMap::new();
        for relation in relations {
            let key = (relation.source_id.clone(), relation.target_id.clone());
            match index.get(&key) {
                Some(&i) => {
                    if attribute_wins(relation.attribute.as_ref(), folded[i].attribute.as_ref()) {
                        take_attribute(&mut folded[i], relation);
                    }
                }
                None => {
                    index.insert(key, folded.len());
                    folded.push(relation);
                }
            }
        }
        folded.sort_by(|a, b| a.cmp_pair(b));
        Self { relations: folded }
    }

    pub fn len(&self) -> usize {
        self.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Relation> {
        self.relations.iter()
    }

    pub fn get(&self, source_id: &str, target_id: &str) -> Option<&Relation> {
        self.relations
            .iter()
            .find(|r| r.pair() == (source_id, target_id))
    }

    pub fn into_relations(self) -> Vec<Relation> {
        self.relations
    }

    pub fn into_values(self, schema: &RelationSchema) -> Vec<Value> {
        self.relations.iter().map(|r| schema.encode(r)).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelationMerge {
    pub relations: RelationSet,
    pub summary: MergeSummary,
}

/// Decode `incoming` with `schema` and upsert it into `canonical`.
pub fn merge_relations(
    canonical: RelationSet,
    incoming: Vec<Value>,
    schema: &RelationSchema,
) -> RelationMerge {
    let mut rejections = Vec::new();
    let mut decoded = Vec::with_capacity(incoming.len());
    for (position, value) in incoming.into_iter().enumerate() {
        match schema.decode(value, position) {
            Ok(relation) => decoded.push(relation),
            Err(reason) => {
                warn!(%reason, "skipping malformed incoming relation");
                rejections.push(Rejection {
                    origin: Origin::Incoming,
                    reason,
                });
            }
        }
    }
    let mut merge = merge_relation_records(canonical, decoded);
    rejections.append(&mut merge.summary.rejections);
    merge.summary.rejections = rejections;
    merge
}

/// A winning relation overwrites the stored attribute. Stored extra fields
/// survive; incoming extra fields are laid over them.
fn take_attribute(existing: &mut Relation, incoming: Relation) {
    existing.attribute = incoming.attribute;
    existing.extra.extend(incoming.extra);
}

/// Upsert relations. A new pair is added; an existing pair takes the
/// incoming attribute only when it wins under largest-wins.
pub fn merge_relation_records(canonical: RelationSet, incoming: Vec<Relation>) -> RelationMerge {
    let span = info_span!("merge_relations", canonical = canonical.len(), incoming = incoming.len());
    let _guard = span.enter();

    let mut summary = MergeSummary::default();
    let mut accepted = Vec::with_capacity(incoming.len());
    for (position, relation) in incoming.into_iter().enumerate() {
        if relation.source_id.trim().is_empty() {
            summary.reject(
                Origin::Incoming,
                MalformedRecord::EmptyField {
                    position,
                    field: "source_id".to_string(),
                },
            );
        } else if relation.target_id.trim().is_empty() {
            summary.reject(
                Origin::Incoming,
                MalformedRecord::EmptyField {
                    position,
                    field: "target_id".to_string(),
                },
            );
        } else {
            accepted.push(relation);
        }
    }

    let mut relations = canonical.into_relations();
    let index: HashMap<(String, String), usize> = relations
        .iter()
        .enumerate()
        .map(|(i, r)| ((r.source_id.clone(), r.target_id.clone()), i))
        .collect();

    for relation in RelationSet::collapse(accepted).into_relations() {
        let key = (relation.source_id.clone(), relation.target_id.clone());
        match index.get(&key) {
            Some(&i) => {
                if attribute_wins(relation.attribute.as_ref(), relations[i].attribute.as_ref()) {
                    take_attribute(&mut relations[i], relation);
                    summary.updated += 1;
                } else {
                    summary.unchanged += 1;
                }
            }
            None => {
                relations.push(relation);
                summary.added += 1;
            }
        }
    }

    relations.sort_by(|a, b| a.cmp_pair(b));
    info!(%summary, "relation merge finished");
    RelationMerge {
        relations: RelationSet { relations },
        summary,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    pub collection: Collection,
    pub summary: MergeSummary,
}

fn string_list(value: &Value) -> Option<Vec<String>> {
    value
        .as_array()?
        .iter()
        .map(|v| v.as_str().map(str::to_string))
        .collect()
}

/// Store on each primary entity the ids of its related records that satisfy
/// `predicate`, unioned with whatever the field already holds.
///
/// Targets missing from `related` never qualify. Entities with no
/// qualifying target are left alone. An existing field that is not a list of
/// strings is reported and left untouched.
pub fn reconcile_cross_references<F>(
    primary: Collection,
    relations: &RelationSet,
    related: &Collection,
    field: &str,
    predicate: F,
) -> Reconciliation
where
    F: Fn(&Record) -> bool,
{
    let span = info_span!("reconcile_cross_references", field, relations = relations.len());
    let _guard = span.enter();

    let mut verdicts: HashMap<&str, bool> = HashMap::new();
    let mut qualifying: HashMap<&str, Vec<&str>> = HashMap::new();
    for relation in relations.iter() {
        let target = relation.target_id.as_str();
        let passes = *verdicts
            .entry(target)
            .or_insert_with(|| related.get(target).is_some_and(|r| predicate(r)));
        if passes {
            qualifying
                .entry(relation.source_id.as_str())
                .or_default()
                .push(target);
        }
    }

    let mut summary = MergeSummary::default();
    let mut records = primary.into_records();
    for record in &mut records {
        let Some(targets) = qualifying.get(record.id()) else {
            continue;
        };

        let current = match record.get(field) {
            None | Some(Value::Null) => Vec::new(),
            Some(value) => match string_list(value) {
                Some(ids) => ids,
                None => {
                    summary.reject(
                        Origin::Canonical,
                        MalformedRecord::InvalidDerivedField {
                            id: record.id().to_string(),
                            field: field.to_string(),
                        },
                    );
                    continue;
                }
            },
        };

        let merged = canonical_id_list(
            current
                .iter()
                .map(String::as_str)
                .chain(targets.iter().copied()),
        );
        let merged = Value::Array(merged.into_iter().map(Value::String).collect());
        if record.get(field) == Some(&merged) {
            summary.unchanged += 1;
        } else {
            record.insert(field, merged);
            summary.updated += 1;
        }
    }

    info!(%summary, "cross-reference reconciliation finished");
    Reconciliation {
        collection: Collection { records },
        summary,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Remap {
    pub relations: RelationSet,
    pub entities: Collection,
    pub relations_rewritten: usize,
    pub relations_collapsed: usize,
    pub entities_rewritten: usize,
    pub rejections: Vec<Rejection>,
}

/// Replace identifier `from` with `to` everywhere it is referenced: relation
/// endpoints and the named id-list fields of `entities`. Pairs that collide
/// after the rewrite collapse under largest-wins. A named field that is not
/// a list of strings is left untouched and reported as `InvalidDerivedField`.
pub fn remap_identifier(
    relations: RelationSet,
    entities: Collection,
    from: &str,
    to: &str,
    list_fields: &[String],
) -> Remap {
    let span = info_span!("remap_identifier", from, to);
    let _guard = span.enter();

    if from == to {
        info!("identifier maps to itself; nothing to rewrite");
        return Remap {
            relations,
            entities,
            relations_rewritten: 0,
            relations_collapsed: 0,
            entities_rewritten: 0,
            rejections: Vec::new(),
        };
    }

    let mut relations_rewritten = 0;
    let mut rewritten: Vec<Relation> = relations.into_relations();
    let before = rewritten.len();
    for relation in &mut rewritten {
        let mut touched = false;
        if relation.source_id == from {
            relation.source_id = to.to_string();
            touched = true;
        }
        if relation.target_id == from {
            relation.target_id = to.to_string();
            touched = true;
        }
        if touched {
            relations_rewritten += 1;
        }
    }
    let relations = RelationSet::collapse(rewritten);
    let relations_collapsed = before - relations.len();

    let mut entities_rewritten = 0;
    let mut rejections = Vec::new();
    let mut records = entities.into_records();
    for record in &mut records {
        let mut touched = false;
        for field in list_fields {
            let Some(value) = record.get(field) else {
                continue;
            };
            let Some(ids) = string_list(value) else {
                let reason = MalformedRecord::InvalidDerivedField {
                    id: record.id().to_string(),
                    field: field.clone(),
                };
                warn!(%reason, "skipping id list of the wrong shape");
                rejections.push(Rejection {
                    origin: Origin::Canonical,
                    reason,
                });
                continue;
            };
            if !ids.iter().any(|id| id == from) {
                continue;
            }
            let replaced = canonical_id_list(
                ids.into_iter()
                    .map(|id| if id == from { to.to_string() } else { id }),
            );
            record.insert(
                field.clone(),
                Value::Array(replaced.into_iter().map(Value::String).collect()),
            );
            touched = true;
        }
        if touched {
            entities_rewritten += 1;
        }
    }

    info!(
        relations_rewritten,
        relations_collapsed, entities_rewritten, "identifier remap finished"
    );
    Remap {
        relations,
        entities: Collection { records },
        relations_rewritten,
        relations_collapsed,
        entities_rewritten,
        rejections,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prune {
    pub relations: RelationSet,
    pub removed: Vec<Relation>,
}

/// Drop every relation matching `predicate`.
pub fn prune_relations<F>(relations: RelationSet, predicate: F) -> Prune
where
    F: Fn(&Relation) -> bool,
{
    let (removed, kept): (Vec<_>, Vec<_>) = relations
        .into_relations()
        .into_iter()
        .partition(|r| predicate(r));
    info!(removed = removed.len(), kept = kept.len(), "relation prune finished");
    Prune {
        relations: RelationSet { relations: kept },
        removed,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingEndpoint {
    Source,
    Target,
    Both,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DanglingRelation {
    pub source_id: String,
    pub target_id: String,
    pub missing: MissingEndpoint,
}

/// Relations that point at an id absent from its collection.
pub fn dangling_relations(
    relations: &RelationSet,
    sources: &Collection,
    targets: &Collection,
) -> Vec<DanglingRelation> {
    relations
        .iter()
        .filter_map(|r| {
            let missing = match (
                sources.get(&r.source_id).is_some(),
                targets.get(&r.target_id).is_some(),
            ) {
                (true, true) => return None,
                (false, true) => MissingEndpoint::Source,
                (true, false) => MissingEndpoint::Target,
                (false, false) => MissingEndpoint::Both,
            };
            Some(DanglingRelation {
                source_id: r.source_id.clone(),
                target_id: r.target_id.clone(),
                missing,
            })
        })
        .collect()
}

/// Declarative record predicate, loaded from rule files.
///
/// A record matches when any configured clause matches: its id is listed in
/// `ids`, or `field` holds a value equal to one of `equals_any`, or
/// containing one of `contains_any` (case-insensitive).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetFilter {
    #[serde(default)]
    pub ids: Vec<String>,
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub equals_any: Vec<String>,
    #[serde(default)]
    pub contains_any: Vec<String>,
}

fn value_text(value: &Value) -> Option<Cow<'_, str>> {
    match value {
        Value::String(s) => Some(Cow::Borrowed(s)),
        Value::Number(n) => Some(Cow::Owned(n.to_string())),
        Value::Bool(b) => Some(Cow::Owned(b.to_string())),
        _ => None,
    }
}

impl TargetFilter {
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty() && self.equals_any.is_empty() && self.contains_any.is_empty()
    }

    pub fn matches(&self, record: &Record) -> bool {
        if self.ids.iter().any(|id| id == record.id()) {
            return true;
        }
        let Some(text) = self
            .field
            .as_deref()
            .and_then(|f| record.get(f))
            .and_then(value_text)
        else {
            return false;
        };
        if self.equals_any.iter().any(|needle| *needle == *text) {
            return true;
        }
        let haystack = text.to_lowercase();
        self.contains_any
            .iter()
            .any(|needle| haystack.contains(&needle.to_lowercase()))
    }
}
