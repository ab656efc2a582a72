use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use mdb_core::RelationSchema;
use mdb_merge::ConflictPolicy;
use mdb_sync::{FilterRules, MergeConfig, MergePipeline, ReconcileRequest, RemapRequest, RunReport};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mdb")]
#[command(about = "Merge scraped MapleStory DB records into canonical JSON collections")]
struct Cli {
    /// YAML config file (defaults to <data-dir>/mdb.yaml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Directory that relative collection paths resolve against
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Relation field layout, overriding the config file
    #[arg(long, global = true, value_enum)]
    schema: Option<SchemaArg>,
    /// Compute and report, but write nothing
    #[arg(long, global = true)]
    dry_run: bool,
    /// Print the run report as JSON
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SchemaArg {
    /// sourceId / targetId / rate
    Default,
    /// monsterId / itemId / dropRate
    DropTable,
}

impl From<SchemaArg> for RelationSchema {
    fn from(arg: SchemaArg) -> Self {
        match arg {
            SchemaArg::Default => RelationSchema::default(),
            SchemaArg::DropTable => RelationSchema::drop_table(),
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Upsert an incoming batch into an entity collection
    MergeEntities {
        #[arg(long)]
        canonical: PathBuf,
        #[arg(long)]
        incoming: PathBuf,
        /// replace | keep-existing | incoming-wins
        #[arg(long)]
        policy: Option<ConflictPolicy>,
    },
    /// Upsert an incoming batch of relations (largest attribute wins)
    MergeRelations {
        #[arg(long)]
        canonical: PathBuf,
        #[arg(long)]
        incoming: PathBuf,
    },
    /// Store related ids passing a filter as a derived list field
    Reconcile {
        #[arg(long)]
        primary: PathBuf,
        #[arg(long)]
        relations: PathBuf,
        #[arg(long)]
        related: PathBuf,
        #[arg(long)]
        field: String,
        /// YAML filter rules, relative to the working directory
        #[arg(long)]
        filter: PathBuf,
    },
    /// Replace one identifier with another in relations and id lists
    RemapId {
        #[arg(long)]
        relations: PathBuf,
        #[arg(long)]
        entities: PathBuf,
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        #[arg(long = "list-field")]
        list_fields: Vec<String>,
    },
    /// Drop relations pointing at the given target ids
    PruneRelations {
        #[arg(long)]
        relations: PathBuf,
        #[arg(long = "target-id", required = true)]
        target_ids: Vec<String>,
    },
    /// Report relations whose endpoints are missing
    Check {
        #[arg(long)]
        relations: PathBuf,
        #[arg(long)]
        sources: PathBuf,
        #[arg(long)]
        targets: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = MergeConfig::resolve(cli.config.as_deref(), cli.data_dir.clone())?;
    if let Some(schema) = cli.schema {
        config.relation_schema = schema.into();
    }
    let pipeline = MergePipeline::new(config).with_dry_run(cli.dry_run);

    let report = match cli.command {
        Commands::MergeEntities {
            canonical,
            incoming,
            policy,
        } => pipeline.merge_entities(&canonical, &incoming, policy)?,
        Commands::MergeRelations {
            canonical,
            incoming,
        } => pipeline.merge_relations(&canonical, &incoming)?,
        Commands::Reconcile {
            primary,
            relations,
            related,
            field,
            filter,
        } => pipeline.reconcile(&ReconcileRequest {
            primary,
            relations,
            related,
            field,
            filter: FilterRules::from_yaml_file(&filter)?,
        })?,
        Commands::RemapId {
            relations,
            entities,
            from,
            to,
            list_fields,
        } => pipeline.remap_identifier(&RemapRequest {
            relations,
            entities,
            from,
            to,
            list_fields,
        })?,
        Commands::PruneRelations {
            relations,
            target_ids,
        } => pipeline.prune_relations(&relations, &target_ids)?,
        Commands::Check {
            relations,
            sources,
            targets,
        } => pipeline.check(&relations, &sources, &targets)?,
    };

    print_report(&report, cli.json)?;
    if !report.dangling.is_empty() {
        bail!("{} dangling relation(s)", report.dangling.len());
    }
    Ok(())
}

fn print_report(report: &RunReport, as_json: bool) -> Result<()> {
    if as_json {
        let text = serde_json::to_string_pretty(report).context("serializing run report")?;
        println!("{text}");
        return Ok(());
    }

    println!("{}", report.summary_line());
    for rejection in &report.rejections {
        println!("  skipped {rejection}");
    }
    for note in &report.notes {
        println!("  {note}");
    }
    for dangling in &report.dangling {
        println!(
            "  dangling {} -> {} (missing {:?})",
            dangling.source_id, dangling.target_id, dangling.missing
        );
    }
    for output in &report.outputs {
        if output.written {
            println!("  wrote {} ({} bytes, sha256 {})", output.path, output.bytes, output.sha256);
        } else {
            println!("  unchanged {}", output.path);
        }
    }
    Ok(())
}
