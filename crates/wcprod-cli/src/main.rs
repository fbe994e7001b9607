//! # wcprod: command-line front end for the production database
//!
//! Operators register and inspect campaigns; worker scripts ask for work and
//! report the files they wrote. Results go to stdout (plain text or JSON),
//! logs go to stderr.
//!
//! ## Global Options
//!
//! - `--db` / `WCPROD_DB_FILE`: path of the SQLite store.
//! - `--log-format` / `WCPROD_LOG_FORMAT`: `text` or `json` log lines.
//!
//! ## Exit codes
//!
//! - 0: success
//! - 1: error
//! - 2: file registration rejected
//! - 3: campaign complete (nothing left to select)

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use wcprod::models::Registration;
use wcprod::naming;
use wcprod::{Project, ProjectSpec, ProductionStore, StoreConfig, WcprodError};

const EXIT_REJECTED: u8 = 2;
const EXIT_CAMPAIGN_COMPLETE: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser)]
#[command(
    name = "wcprod",
    version,
    about = "Track production of sharded simulation campaigns"
)]
struct Cli {
    /// Path of the production database
    #[arg(long, env = "WCPROD_DB_FILE", default_value = "wcprod.db")]
    db: PathBuf,

    /// Log line format on stderr
    #[arg(long, env = "WCPROD_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a project from a YAML file and register it (creates the database)
    Register {
        /// Project YAML file
        config: PathBuf,
        /// Maximum configurations per shard
        #[arg(long)]
        max_entries: Option<usize>,
    },
    /// List registered projects
    List,
    /// Show a project's parameters and shards
    Info { project: String },
    /// Print the next configuration to simulate as JSON
    Select {
        project: String,
        /// Pick shards at random instead of least produced first
        #[arg(long)]
        no_prioritize: bool,
        /// Candidate pool size (0 = whole shard)
        #[arg(long)]
        sample_size: Option<usize>,
        /// Add `storage_path` and `output_file` under this root to the output
        #[arg(long)]
        storage_root: Option<PathBuf>,
        /// Output file extension used with --storage-root
        #[arg(long, default_value = "root")]
        extension: String,
    },
    /// Exclude a shard (or every shard) from selection
    Lock {
        project: String,
        #[arg(long)]
        table: Option<i64>,
    },
    /// Make a shard (or every shard) selectable again
    Unlock {
        project: String,
        #[arg(long)]
        table: Option<i64>,
    },
    /// Record an output file for a configuration
    RegisterFile {
        project: String,
        config_id: i64,
        path: PathBuf,
        /// Units (photons) the file holds
        units: u64,
        /// Wall time spent producing the file, in seconds
        duration: f64,
    },
    /// List registered files as JSON
    Files {
        project: String,
        #[arg(long)]
        config_id: Option<i64>,
        #[arg(long)]
        table_id: Option<i64>,
    },
    /// Print per-shard production progress as JSON
    Status { project: String },
    /// Verify the stored layout of a project
    Check { project: String },
    /// Remove a project and all its tables
    Drop { project: String },
    /// Copy the database with the SQLite online backup API
    Backup { dest: PathBuf },
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init(),
    }
}

fn open_existing(cli: &Cli, config: StoreConfig) -> Result<ProductionStore> {
    ProductionStore::open_existing(&cli.db, config)
        .with_context(|| format!("cannot open production database {}", cli.db.display()))
}

fn run(cli: Cli) -> Result<ExitCode> {
    let config = StoreConfig::from_env();

    match &cli.command {
        Commands::Register {
            config: path,
            max_entries,
        } => {
            let spec = ProjectSpec::from_yaml_file(path)
                .with_context(|| format!("cannot load project file {}", path.display()))?;
            let max_entries = max_entries.unwrap_or(config.max_entries_per_shard);
            let project = Project::generate(spec)?;
            println!("{project}");
            let store = ProductionStore::open_with_config(&cli.db, config)?;
            let record = store.register_project(&project, max_entries)?;
            println!("Shards: {}", record.num_tables);
        }
        Commands::List => {
            let store = open_existing(&cli, config)?;
            for name in store.list_projects()? {
                println!("{name}");
            }
        }
        Commands::Info { project } => {
            let store = open_existing(&cli, config)?;
            let Some(generated) = store.get_project(project)? else {
                return Err(WcprodError::ProjectNotFound(project.clone()).into());
            };
            println!("{generated}");
            for shard in store.list_shards(project)? {
                println!(
                    "Shard {}: configs {} => {}, units {} / {}{}",
                    shard.table_id,
                    shard.config_range_min,
                    shard.config_range_max,
                    shard.unit_ctr,
                    shard.target_ctr,
                    if shard.locked { " (locked)" } else { "" }
                );
            }
        }
        Commands::Select {
            project,
            no_prioritize,
            sample_size,
            storage_root,
            extension,
        } => {
            let store = open_existing(&cli, config)?;
            let selected = if *no_prioritize || sample_size.is_some() {
                let defaults = store.config();
                store.select_work(
                    project,
                    defaults.prioritize && !no_prioritize,
                    sample_size.unwrap_or(defaults.sample_size),
                )
            } else {
                store.select_default_work(project)
            };
            let item = match selected {
                Ok(item) => item,
                Err(WcprodError::CampaignComplete(_)) => {
                    info!(project = project.as_str(), "campaign complete");
                    return Ok(ExitCode::from(EXIT_CAMPAIGN_COMPLETE));
                }
                Err(err) => return Err(err.into()),
            };
            let mut value = serde_json::to_value(item)?;
            if let (Some(root), Some(object)) = (storage_root, value.as_object_mut()) {
                let dir = naming::storage_path(root, item.config_id());
                let file = naming::output_file_name(project, item.config_id(), item.file_ctr(), extension);
                object.insert(
                    "storage_path".to_string(),
                    dir.to_string_lossy().into_owned().into(),
                );
                object.insert("output_file".to_string(), file.into());
            }
            println!("{value}");
        }
        Commands::Lock { project, table } => {
            let store = open_existing(&cli, config)?;
            let touched = store.lock_shard(project, *table)?;
            println!("Locked {touched} shard(s)");
        }
        Commands::Unlock { project, table } => {
            let store = open_existing(&cli, config)?;
            let touched = store.unlock_shard(project, *table)?;
            println!("Unlocked {touched} shard(s)");
        }
        Commands::RegisterFile {
            project,
            config_id,
            path,
            units,
            duration,
        } => {
            let store = open_existing(&cli, config)?;
            let outcome = store.register_file(project, *config_id, path, *units, *duration)?;
            println!("{}", serde_json::to_string(&outcome)?);
            if let Registration::Rejected { reason } = outcome {
                warn!(project = project.as_str(), config_id, %reason, "registration rejected");
                return Ok(ExitCode::from(EXIT_REJECTED));
            }
        }
        Commands::Files {
            project,
            config_id,
            table_id,
        } => {
            let store = open_existing(&cli, config)?;
            let files = store.list_files(project, *config_id, *table_id)?;
            println!("{}", serde_json::to_string_pretty(&files)?);
        }
        Commands::Status { project } => {
            let store = open_existing(&cli, config)?;
            let progress = store.progress(project)?;
            println!("{}", serde_json::to_string_pretty(&progress)?);
        }
        Commands::Check { project } => {
            let store = open_existing(&cli, config)?;
            store.check_integrity(project)?;
            println!("Project {project}: OK");
        }
        Commands::Drop { project } => {
            let store = open_existing(&cli, config)?;
            store.drop_project(project)?;
            println!("Dropped {project}");
        }
        Commands::Backup { dest } => {
            let store = open_existing(&cli, config)?;
            let path = store.backup_to(dest)?;
            println!("{}", path.display());
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
