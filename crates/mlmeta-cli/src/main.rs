mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mlmeta_core::{
    now_millis, parse_version, ExperimentTag, Metric, ModelVersionStage, RegisteredModelTag,
};
use mlmeta_storage::{ErrorCode, MetaStore, NewModelVersion, RequestContext, StoreError};
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mlmeta")]
#[command(about = "Experiment tracking and model registry metadata store", long_about = None)]
struct Cli {
    /// TOML store config
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Database file, overrides the config path
    #[arg(long, global = true, env = "MLMETA_DB")]
    db: Option<PathBuf>,
    /// Abort the command after this many milliseconds
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,
    #[arg(long, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the schema
    Migrate,
    /// Manage experiments
    Experiment {
        #[command(subcommand)]
        action: ExperimentCommands,
    },
    /// Manage runs
    Run {
        #[command(subcommand)]
        action: RunCommands,
    },
    /// Log and read metrics
    Metric {
        #[command(subcommand)]
        action: MetricCommands,
    },
    /// Manage registered models
    Model {
        #[command(subcommand)]
        action: ModelCommands,
    },
    /// Manage model versions
    Version {
        #[command(subcommand)]
        action: VersionCommands,
    },
    /// Manage model aliases
    Alias {
        #[command(subcommand)]
        action: AliasCommands,
    },
}

#[derive(Subcommand)]
enum ExperimentCommands {
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        artifact_location: Option<String>,
        #[arg(long = "tag", value_parser = parse_tag)]
        tags: Vec<(String, String)>,
    },
    Get {
        #[arg(long)]
        id: i64,
    },
}

#[derive(Subcommand)]
enum RunCommands {
    Create {
        #[arg(long)]
        experiment_id: i64,
        #[arg(long, default_value = "")]
        name: String,
        #[arg(long)]
        user: Option<String>,
    },
    Get {
        #[arg(long)]
        run_id: String,
    },
    Delete {
        #[arg(long)]
        run_id: String,
    },
    Restore {
        #[arg(long)]
        run_id: String,
    },
}

#[derive(Subcommand)]
enum MetricCommands {
    Log {
        #[arg(long)]
        run_id: String,
        #[arg(long)]
        key: String,
        #[arg(long, allow_hyphen_values = true)]
        value: f64,
        #[arg(long, default_value_t = 0)]
        step: i64,
        /// Epoch milliseconds, defaults to now
        #[arg(long)]
        timestamp: Option<i64>,
        #[arg(long)]
        model_id: Option<String>,
    },
    /// Log a JSON array of metrics read from a file
    LogBatch {
        #[arg(long)]
        run_id: String,
        #[arg(long)]
        file: PathBuf,
    },
    History {
        #[arg(long)]
        run_id: String,
        #[arg(long)]
        key: String,
    },
    Latest {
        #[arg(long)]
        run_id: String,
    },
    Rebuild {
        #[arg(long)]
        run_id: String,
    },
    ForModel {
        #[arg(long)]
        model_id: String,
    },
}

#[derive(Subcommand)]
enum ModelCommands {
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long = "tag", value_parser = parse_tag)]
        tags: Vec<(String, String)>,
    },
    Get {
        #[arg(long)]
        name: String,
    },
    Update {
        #[arg(long)]
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
    Rename {
        #[arg(long)]
        name: String,
        #[arg(long)]
        new_name: String,
    },
    Delete {
        #[arg(long)]
        name: String,
    },
    SetTag {
        #[arg(long)]
        name: String,
        #[arg(long)]
        key: String,
        #[arg(long)]
        value: String,
    },
    DeleteTag {
        #[arg(long)]
        name: String,
        #[arg(long)]
        key: String,
    },
}

#[derive(Subcommand)]
enum VersionCommands {
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        source: String,
        #[arg(long)]
        run_id: Option<String>,
        #[arg(long)]
        run_link: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    Get {
        #[arg(long)]
        name: String,
        #[arg(long)]
        version: String,
    },
    Latest {
        #[arg(long)]
        name: String,
        #[arg(long = "stage")]
        stages: Vec<String>,
    },
    Update {
        #[arg(long)]
        name: String,
        #[arg(long)]
        version: String,
        #[arg(long)]
        description: Option<String>,
    },
    Transition {
        #[arg(long)]
        name: String,
        #[arg(long)]
        version: String,
        #[arg(long)]
        stage: String,
        #[arg(long)]
        archive_existing: bool,
    },
    Delete {
        #[arg(long)]
        name: String,
        #[arg(long)]
        version: String,
    },
    SetTag {
        #[arg(long)]
        name: String,
        #[arg(long)]
        version: String,
        #[arg(long)]
        key: String,
        #[arg(long)]
        value: String,
    },
    DeleteTag {
        #[arg(long)]
        name: String,
        #[arg(long)]
        version: String,
        #[arg(long)]
        key: String,
    },
}

#[derive(Subcommand)]
enum AliasCommands {
    Set {
        #[arg(long)]
        name: String,
        #[arg(long)]
        alias: String,
        #[arg(long)]
        version: String,
    },
    Get {
        #[arg(long)]
        name: String,
        #[arg(long)]
        alias: String,
    },
    Delete {
        #[arg(long)]
        name: String,
        #[arg(long)]
        alias: String,
    },
}

fn parse_tag(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

fn parse_stage(raw: &str) -> Result<ModelVersionStage, StoreError> {
    Ok(raw.parse::<ModelVersionStage>()?)
}

fn version_arg(raw: &str) -> Result<i64, StoreError> {
    Ok(parse_version(raw)?)
}

fn emit<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_logging(debug: bool) {
    let level = if debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("MLMETA_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.debug);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = err
                .downcast_ref::<StoreError>()
                .map(StoreError::code)
                .unwrap_or(ErrorCode::InternalError);
            error!(event = "command_failed", error_code = %code, error = %format!("{err:#}"));
            eprintln!(
                "{}",
                json!({ "error_code": code.as_str(), "message": format!("{err:#}") })
            );
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = config::load_store_config(cli.config.as_deref(), cli.db.as_deref())?;
    let db_path = config.path.clone();
    let mut store = MetaStore::with_config(config)
        .with_context(|| format!("failed to open store at {}", db_path.display()))?;
    let ctx = match cli.timeout_ms {
        Some(timeout_ms) => RequestContext::with_timeout(Duration::from_millis(timeout_ms)),
        None => RequestContext::background(),
    };

    match cli.command {
        Commands::Migrate => {
            let schema_version = store.schema_version()?;
            info!(event = "store_migrated", path = %db_path.display(), schema_version);
            emit(&json!({
                "path": db_path.display().to_string(),
                "schema_version": schema_version,
            }))?;
        }
        Commands::Experiment { action } => match action {
            ExperimentCommands::Create {
                name,
                artifact_location,
                tags,
            } => {
                let tags = tags
                    .into_iter()
                    .map(|(key, value)| ExperimentTag { key, value })
                    .collect::<Vec<_>>();
                let experiment_id =
                    store.create_experiment(&ctx, &name, artifact_location.as_deref(), &tags)?;
                emit(&store.get_experiment(&ctx, experiment_id)?)?;
            }
            ExperimentCommands::Get { id } => emit(&store.get_experiment(&ctx, id)?)?,
        },
        Commands::Run { action } => match action {
            RunCommands::Create {
                experiment_id,
                name,
                user,
            } => {
                let run = store.create_run(
                    &ctx,
                    experiment_id,
                    &name,
                    user.as_deref(),
                    now_millis(),
                    &[],
                )?;
                emit(&run)?;
            }
            RunCommands::Get { run_id } => emit(&store.get_run_info(&ctx, &run_id)?)?,
            RunCommands::Delete { run_id } => {
                store.delete_run(&ctx, &run_id)?;
                emit(&store.get_run_info(&ctx, &run_id)?)?;
            }
            RunCommands::Restore { run_id } => {
                store.restore_run(&ctx, &run_id)?;
                emit(&store.get_run_info(&ctx, &run_id)?)?;
            }
        },
        Commands::Metric { action } => match action {
            MetricCommands::Log {
                run_id,
                key,
                value,
                step,
                timestamp,
                model_id,
            } => {
                let timestamp = timestamp.unwrap_or_else(now_millis);
                let mut metric = Metric::new(key, value, timestamp, step);
                if let Some(model_id) = model_id {
                    metric = metric.with_model(model_id);
                }
                store.log_metric(&ctx, &run_id, &metric)?;
                emit(&store.get_latest_metrics(&ctx, &run_id)?)?;
            }
            MetricCommands::LogBatch { run_id, file } => {
                let raw = std::fs::read_to_string(&file)
                    .with_context(|| format!("failed to read {}", file.display()))?;
                let metrics: Vec<Metric> = serde_json::from_str(&raw)
                    .with_context(|| format!("failed to parse {}", file.display()))?;
                store.log_metrics(&ctx, &run_id, &metrics)?;
                emit(&store.get_latest_metrics(&ctx, &run_id)?)?;
            }
            MetricCommands::History { run_id, key } => {
                emit(&store.get_metric_history(&ctx, &run_id, &key)?)?
            }
            MetricCommands::Latest { run_id } => emit(&store.get_latest_metrics(&ctx, &run_id)?)?,
            MetricCommands::Rebuild { run_id } => {
                let written = store.rebuild_latest_metrics(&ctx, &run_id)?;
                emit(&json!({ "run_id": run_id, "rows_written": written }))?;
            }
            MetricCommands::ForModel { model_id } => {
                emit(&store.get_logged_model_metrics(&ctx, &model_id)?)?
            }
        },
        Commands::Model { action } => match action {
            ModelCommands::Create {
                name,
                description,
                tags,
            } => {
                let tags = tags
                    .into_iter()
                    .map(|(key, value)| RegisteredModelTag::new(key, value))
                    .collect::<Vec<_>>();
                emit(&store.create_registered_model(&ctx, &name, description.as_deref(), &tags)?)?;
            }
            ModelCommands::Get { name } => emit(&store.get_registered_model(&ctx, &name)?)?,
            ModelCommands::Update { name, description } => {
                emit(&store.update_registered_model(&ctx, &name, description.as_deref())?)?
            }
            ModelCommands::Rename { name, new_name } => {
                emit(&store.rename_registered_model(&ctx, &name, &new_name)?)?
            }
            ModelCommands::Delete { name } => {
                store.delete_registered_model(&ctx, &name)?;
                emit(&json!({ "deleted": name }))?;
            }
            ModelCommands::SetTag { name, key, value } => {
                store.set_registered_model_tag(&ctx, &name, &key, &value)?;
                emit(&store.get_registered_model(&ctx, &name)?)?;
            }
            ModelCommands::DeleteTag { name, key } => {
                store.delete_registered_model_tag(&ctx, &name, &key)?;
                emit(&store.get_registered_model(&ctx, &name)?)?;
            }
        },
        Commands::Version { action } => match action {
            VersionCommands::Create {
                name,
                source,
                run_id,
                run_link,
                description,
            } => {
                let new_version = NewModelVersion {
                    source,
                    run_id,
                    run_link,
                    description,
                    ..NewModelVersion::default()
                };
                emit(&store.create_model_version(&ctx, &name, new_version)?)?;
            }
            VersionCommands::Get { name, version } => {
                emit(&store.get_model_version(&ctx, &name, version_arg(&version)?)?)?
            }
            VersionCommands::Latest { name, stages } => {
                let stages = stages
                    .iter()
                    .map(|stage| parse_stage(stage))
                    .collect::<Result<Vec<_>, _>>()?;
                emit(&store.get_latest_versions(&ctx, &name, &stages)?)?;
            }
            VersionCommands::Update {
                name,
                version,
                description,
            } => emit(&store.update_model_version(
                &ctx,
                &name,
                version_arg(&version)?,
                description.as_deref(),
            )?)?,
            VersionCommands::Transition {
                name,
                version,
                stage,
                archive_existing,
            } => {
                let version = version_arg(&version)?;
                let stage = parse_stage(&stage)?;
                emit(&store.transition_model_version_stage(
                    &ctx,
                    &name,
                    version,
                    stage,
                    archive_existing,
                )?)?;
            }
            VersionCommands::Delete { name, version } => {
                let version = version_arg(&version)?;
                store.delete_model_version(&ctx, &name, version)?;
                emit(&json!({ "name": name, "deleted_version": version }))?;
            }
            VersionCommands::SetTag {
                name,
                version,
                key,
                value,
            } => {
                let version = version_arg(&version)?;
                store.set_model_version_tag(&ctx, &name, version, &key, &value)?;
                emit(&store.get_model_version(&ctx, &name, version)?)?;
            }
            VersionCommands::DeleteTag { name, version, key } => {
                let version = version_arg(&version)?;
                store.delete_model_version_tag(&ctx, &name, version, &key)?;
                emit(&store.get_model_version(&ctx, &name, version)?)?;
            }
        },
        Commands::Alias { action } => match action {
            AliasCommands::Set {
                name,
                alias,
                version,
            } => {
                store.set_registered_model_alias(&ctx, &name, &alias, version_arg(&version)?)?;
                emit(&store.get_model_version_by_alias(&ctx, &name, &alias)?)?;
            }
            AliasCommands::Get { name, alias } => {
                emit(&store.get_model_version_by_alias(&ctx, &name, &alias)?)?
            }
            AliasCommands::Delete { name, alias } => {
                store.delete_registered_model_alias(&ctx, &name, &alias)?;
                emit(&json!({ "name": name, "deleted_alias": alias }))?;
            }
        },
    }

    Ok(())
}
