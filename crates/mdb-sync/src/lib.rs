//! Load → merge → save runs over the data directory.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use mdb_core::{Rejection, RelationSchema};
use mdb_merge::{
    dangling_relations, merge_entities, merge_relations, prune_relations,
    reconcile_cross_references, remap_identifier, Collection, ConflictPolicy, DanglingRelation,
    MergeSummary, RelationSet, TargetFilter,
};
use mdb_storage::{CollectionStore, SaveOutcome, WriterLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mdb-sync";

/// Looked up in the data directory when no `--config` is given.
pub const CONFIG_FILE_NAME: &str = "mdb.yaml";

fn default_data_dir() -> PathBuf {
    PathBuf::from("src/data")
}

/// On-disk shape of `mdb.yaml`. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    data_dir: Option<PathBuf>,
    #[serde(default)]
    relation_schema: Option<RelationSchema>,
    #[serde(default)]
    default_policy: Option<ConflictPolicy>,
}

impl ConfigFile {
    fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let mut file: ConfigFile = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        if let (Some(dir), Some(parent)) = (&file.data_dir, path.parent()) {
            if dir.is_relative() {
                file.data_dir = Some(parent.join(dir));
            }
        }
        Ok(file)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeConfig {
    pub data_dir: PathBuf,
    pub relation_schema: RelationSchema,
    pub default_policy: ConflictPolicy,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            relation_schema: RelationSchema::default(),
            default_policy: ConflictPolicy::default(),
        }
    }
}

impl MergeConfig {
    /// Resolve configuration with precedence defaults < config file <
    /// environment (`MDB_DATA_DIR`, `MDB_DEFAULT_POLICY`) < `data_dir` argument.
    pub fn resolve(config_path: Option<&Path>, data_dir: Option<PathBuf>) -> Result<Self> {
        let env_data_dir = std::env::var("MDB_DATA_DIR").ok().map(PathBuf::from);
        let env_policy = std::env::var("MDB_DEFAULT_POLICY").ok();
        Self::resolve_with(config_path, data_dir, env_data_dir, env_policy)
    }

    pub fn from_env() -> Result<Self> {
        Self::resolve(None, None)
    }

    fn resolve_with(
        config_path: Option<&Path>,
        data_dir: Option<PathBuf>,
        env_data_dir: Option<PathBuf>,
        env_policy: Option<String>,
    ) -> Result<Self> {
        let file = match config_path {
            Some(path) => ConfigFile::read(path)?,
            None => {
                let base = data_dir
                    .clone()
                    .or_else(|| env_data_dir.clone())
                    .unwrap_or_else(default_data_dir);
                let candidate = base.join(CONFIG_FILE_NAME);
                if candidate.exists() {
                    let mut file = ConfigFile::read(&candidate)?;
                    file.data_dir.get_or_insert(base);
                    file
                } else {
                    ConfigFile::default()
                }
            }
        };

        let default_policy = match env_policy {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("parsing MDB_DEFAULT_POLICY={raw}"))?,
            None => file.default_policy.unwrap_or_default(),
        };

        Ok(Self {
            data_dir: data_dir
                .or(env_data_dir)
                .or(file.data_dir)
                .unwrap_or_else(default_data_dir),
            relation_schema: file.relation_schema.unwrap_or_default(),
            default_policy,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
struct FilterRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    filters: Vec<TargetFilter>,
}

/// Any-of set of [`TargetFilter`]s read from a YAML rule file.
#[derive(Debug, Clone, Default)]
pub struct FilterRules {
    filters: Vec<TargetFilter>,
}

impl FilterRules {
    pub fn new(filters: Vec<TargetFilter>) -> Self {
        Self { filters }
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let rules: FilterRulesFile = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        if rules.filters.iter().all(TargetFilter::is_empty) {
            warn!(path = %path.display(), "filter rules match nothing");
        }
        Ok(Self::new(rules.filters))
    }

    pub fn matches(&self, record: &mdb_core::Record) -> bool {
        self.filters.iter().any(|f| f.matches(record))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OutputFile {
    pub path: String,
    pub sha256: String,
    pub bytes: usize,
    pub written: bool,
}

impl From<SaveOutcome> for OutputFile {
    fn from(outcome: SaveOutcome) -> Self {
        Self {
            path: outcome.path.display().to_string(),
            sha256: outcome.sha256,
            bytes: outcome.bytes,
            written: !outcome.unchanged,
        }
    }
}

/// Operator-facing result of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub operation: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub added: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub malformed: usize,
    pub rejections: Vec<String>,
    pub notes: Vec<String>,
    pub outputs: Vec<OutputFile>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dangling: Vec<DanglingRelation>,
}

impl RunReport {
    fn start(operation: &str, dry_run: bool) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            operation: operation.to_string(),
            started_at: now,
            finished_at: now,
            dry_run,
            added: 0,
            updated: 0,
            unchanged: 0,
            malformed: 0,
            rejections: Vec::new(),
            notes: Vec::new(),
            outputs: Vec::new(),
            dangling: Vec::new(),
        }
    }

    fn absorb(&mut self, summary: &MergeSummary) {
        self.added += summary.added;
        self.updated += summary.updated;
        self.unchanged += summary.unchanged;
        self.record_rejections(&summary.rejections);
    }

    fn record_rejections(&mut self, rejections: &[Rejection]) {
        self.malformed += rejections.len();
        self.rejections
            .extend(rejections.iter().map(ToString::to_string));
    }

    fn finish(mut self) -> Self {
        self.finished_at = Utc::now();
        info!(
            run_id = %self.run_id,
            operation = %self.operation,
            added = self.added,
            updated = self.updated,
            malformed = self.malformed,
            "run finished"
        );
        self
    }

    pub fn summary_line(&self) -> String {
        format!(
            "{} complete: added={} updated={} unchanged={} malformed={}{}",
            self.operation,
            self.added,
            self.updated,
            self.unchanged,
            self.malformed,
            if self.dry_run { " (dry run)" } else { "" }
        )
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileRequest {
    pub primary: PathBuf,
    pub relations: PathBuf,
    pub related: PathBuf,
    pub field: String,
    pub filter: FilterRules,
}

#[derive(Debug, Clone)]
pub struct RemapRequest {
    pub relations: PathBuf,
    pub entities: PathBuf,
    pub from: String,
    pub to: String,
    pub list_fields: Vec<String>,
}

pub struct MergePipeline {
    config: MergeConfig,
    store: CollectionStore,
    dry_run: bool,
}

impl MergePipeline {
    pub fn new(config: MergeConfig) -> Self {
        let store = CollectionStore::new(config.data_dir.clone());
        Self {
            config,
            store,
            dry_run: false,
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    pub fn store(&self) -> &CollectionStore {
        &self.store
    }

    fn lock(&self, path: &Path) -> Result<Option<WriterLock>> {
        if self.dry_run {
            return Ok(None);
        }
        Ok(Some(self.store.lock(path)?))
    }

    fn save(&self, report: &mut RunReport, path: &Path, values: Vec<Value>) -> Result<()> {
        if self.dry_run {
            report
                .notes
                .push(format!("dry run: {} not written", self.store.resolve(path).display()));
            return Ok(());
        }
        let outcome = self.store.save_collection(path, &values)?;
        report.outputs.push(outcome.into());
        Ok(())
    }

    fn load_collection(&self, report: &mut RunReport, path: &Path) -> Result<Collection> {
        let values = self.store.load_collection(path)?;
        let (collection, rejections) = Collection::from_values(values)
            .with_context(|| format!("validating {}", self.store.resolve(path).display()))?;
        report.record_rejections(&rejections);
        Ok(collection)
    }

    fn load_relations(&self, report: &mut RunReport, path: &Path) -> Result<RelationSet> {
        let values = self.store.load_collection(path)?;
        let (relations, rejections) =
            RelationSet::from_values(values, &self.config.relation_schema)
                .with_context(|| format!("validating {}", self.store.resolve(path).display()))?;
        report.record_rejections(&rejections);
        Ok(relations)
    }

    pub fn merge_entities(
        &self,
        canonical: &Path,
        incoming: &Path,
        policy: Option<ConflictPolicy>,
    ) -> Result<RunReport> {
        let policy = policy.unwrap_or(self.config.default_policy);
        let span = info_span!("merge_entities_run", canonical = %canonical.display(), %policy);
        let _guard = span.enter();
        let mut report = RunReport::start("merge-entities", self.dry_run);

        let _lock = self.lock(canonical)?;
        let batch = self.store.load_incoming(incoming)?;
        let existing = self.store.load_collection(canonical)?;

        let merge = merge_entities(existing, batch, &policy)
            .with_context(|| format!("merging into {}", self.store.resolve(canonical).display()))?;
        report.absorb(&merge.summary);
        self.save(&mut report, canonical, merge.collection.into_values())?;
        Ok(report.finish())
    }

    pub fn merge_relations(&self, canonical: &Path, incoming: &Path) -> Result<RunReport> {
        let span = info_span!("merge_relations_run", canonical = %canonical.display());
        let _guard = span.enter();
        let mut report = RunReport::start("merge-relations", self.dry_run);

        let _lock = self.lock(canonical)?;
        let batch = self.store.load_incoming(incoming)?;
        let existing = self.load_relations(&mut report, canonical)?;

        let merge = merge_relations(existing, batch, &self.config.relation_schema);
        report.absorb(&merge.summary);
        let values = merge.relations.into_values(&self.config.relation_schema);
        self.save(&mut report, canonical, values)?;
        Ok(report.finish())
    }

    pub fn reconcile(&self, request: &ReconcileRequest) -> Result<RunReport> {
        let span = info_span!("reconcile_run", primary = %request.primary.display(), field = %request.field);
        let _guard = span.enter();
        let mut report = RunReport::start("reconcile", self.dry_run);

        let _lock = self.lock(&request.primary)?;
        let primary = self.load_collection(&mut report, &request.primary)?;
        let relations = self.load_relations(&mut report, &request.relations)?;
        let related = self.load_collection(&mut report, &request.related)?;

        let reconciliation = reconcile_cross_references(
            primary,
            &relations,
            &related,
            &request.field,
            |record| request.filter.matches(record),
        );
        report.absorb(&reconciliation.summary);
        self.save(
            &mut report,
            &request.primary,
            reconciliation.collection.into_values(),
        )?;
        Ok(report.finish())
    }

    pub fn remap_identifier(&self, request: &RemapRequest) -> Result<RunReport> {
        let span = info_span!("remap_run", from = %request.from, to = %request.to);
        let _guard = span.enter();
        let mut report = RunReport::start("remap-id", self.dry_run);

        let relations_path = self.store.resolve(&request.relations);
        if relations_path == self.store.resolve(&request.entities) {
            bail!(
                "relations and entities both resolve to {}",
                relations_path.display()
            );
        }
        let _relations_lock = self.lock(&request.relations)?;
        let _entities_lock = self.lock(&request.entities)?;
        let relations = self.load_relations(&mut report, &request.relations)?;
        let entities = self.load_collection(&mut report, &request.entities)?;

        let remap = remap_identifier(
            relations,
            entities,
            &request.from,
            &request.to,
            &request.list_fields,
        );
        report.updated = remap.relations_rewritten + remap.entities_rewritten;
        report.record_rejections(&remap.rejections);
        report.notes.push(format!(
            "relations rewritten={} collapsed={} entities rewritten={}",
            remap.relations_rewritten, remap.relations_collapsed, remap.entities_rewritten
        ));

        let relation_values = remap.relations.into_values(&self.config.relation_schema);
        self.save(&mut report, &request.relations, relation_values)?;
        self.save(&mut report, &request.entities, remap.entities.into_values())?;
        Ok(report.finish())
    }

    pub fn prune_relations(&self, relations: &Path, target_ids: &[String]) -> Result<RunReport> {
        let span = info_span!("prune_run", relations = %relations.display());
        let _guard = span.enter();
        let mut report = RunReport::start("prune-relations", self.dry_run);

        let _lock = self.lock(relations)?;
        let existing = self.load_relations(&mut report, relations)?;
        let banned: HashSet<&str> = target_ids.iter().map(String::as_str).collect();

        let prune = prune_relations(existing, |r| banned.contains(r.target_id.as_str()));
        report.unchanged = prune.relations.len();
        report.notes.extend(
            prune
                .removed
                .iter()
                .map(|r| format!("removed {} -> {}", r.source_id, r.target_id)),
        );
        let values = prune.relations.into_values(&self.config.relation_schema);
        self.save(&mut report, relations, values)?;
        Ok(report.finish())
    }

    /// Read-only integrity check of a relation file against both endpoints.
    pub fn check(&self, relations: &Path, sources: &Path, targets: &Path) -> Result<RunReport> {
        let mut report = RunReport::start("check", false);
        let relations = self.load_relations(&mut report, relations)?;
        let sources = self.load_collection(&mut report, sources)?;
        let targets = self.load_collection(&mut report, targets)?;

        report.dangling = dangling_relations(&relations, &sources, &targets);
        report.unchanged = relations.len() - report.dangling.len();
        for dangling in &report.dangling {
            warn!(
                source_id = %dangling.source_id,
                target_id = %dangling.target_id,
                missing = ?dangling.missing,
                "dangling relation"
            );
        }
        Ok(report.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn config_precedence_is_file_then_env_then_argument() {
        let dir = tempdir().expect("tempdir");
        fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            "default_policy: replace\nrelation_schema:\n  source_key: monsterId\n  target_key: itemId\n  attribute_key: dropRate\n",
        )
        .expect("write config");

        let from_file =
            MergeConfig::resolve_with(None, Some(dir.path().to_path_buf()), None, None)
                .expect("config");
        assert_eq!(from_file.default_policy, ConflictPolicy::Replace);
        assert_eq!(from_file.relation_schema, RelationSchema::drop_table());
        assert_eq!(from_file.data_dir, dir.path());

        let env_policy = MergeConfig::resolve_with(
            None,
            Some(dir.path().to_path_buf()),
            None,
            Some("keep-existing".to_string()),
        )
        .expect("config");
        assert_eq!(env_policy.default_policy, ConflictPolicy::FieldMergeKeepExisting);

        let argument_dir = MergeConfig::resolve_with(
            None,
            Some(PathBuf::from("elsewhere")),
            Some(PathBuf::from("from-env")),
            None,
        )
        .expect("config");
        assert_eq!(argument_dir.data_dir, PathBuf::from("elsewhere"));
        assert_eq!(argument_dir.default_policy, ConflictPolicy::default());
    }

    #[test]
    fn explicit_config_resolves_relative_data_dir_against_its_location() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("mdb.yaml");
        fs::write(&path, "data_dir: data\n").expect("write config");
        let config = MergeConfig::resolve_with(Some(&path), None, None, None).expect("config");
        assert_eq!(config.data_dir, dir.path().join("data"));
    }

    #[test]
    fn bad_env_policy_is_an_error() {
        let err = MergeConfig::resolve_with(None, None, None, Some("newest".into()))
            .expect_err("bad policy");
        assert!(err.to_string().contains("MDB_DEFAULT_POLICY"));
    }

    #[test]
    fn filter_rules_load_from_yaml() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("featured.yaml");
        fs::write(
            &path,
            "version: 1\nfilters:\n  - field: name\n    contains_any: [\"dex scroll\"]\n  - ids: [\"2070005\"]\n",
        )
        .expect("write rules");
        let rules = FilterRules::from_yaml_file(&path).expect("rules");
        let record = |v: Value| mdb_core::Record::from_value(v, 0).expect("record");
        assert!(rules.matches(&record(serde_json::json!({"id": "1", "name": "Helmet DEX Scroll"}))));
        assert!(rules.matches(&record(serde_json::json!({"id": "2070005"}))));
        assert!(!rules.matches(&record(serde_json::json!({"id": "3", "name": "Potion"}))));
    }

    #[test]
    fn summary_line_marks_dry_runs() {
        let mut report = RunReport::start("merge-entities", true);
        report.added = 2;
        assert_eq!(
            report.summary_line(),
            "merge-entities complete: added=2 updated=0 unchanged=0 malformed=0 (dry run)"
        );
    }
}
