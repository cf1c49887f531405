//! `pgm` command surface.
//!
//! The wire driver is supplied by the host, so the executable entry
//! point lives there; this module owns the full command grammar and
//! dispatch against a built [`Coordinator`].

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::select;
use tokio::signal::ctrl_c;
use tracing::error;

use crate::coordinator::Coordinator;
use crate::migrate::{CreateOptions, MigrateOptions, RollbackOptions};

pub const EXIT_OK: i32 = 0;
pub const EXIT_ERROR: i32 = 1;
pub const EXIT_SIGINT: i32 = 130;

/// Multi-cluster PostgreSQL router, read/write splitter and coordinator.
#[derive(Parser, Debug)]
#[command(name = "pgm", version)]
pub struct Cli {
    /// Path to the cluster configuration document.
    #[arg(short, long, default_value = "pg-multiverse.json")]
    pub config: PathBuf,

    /// Path to the migrations directory.
    #[arg(short, long, default_value = "migrations")]
    pub migrations_path: PathBuf,

    /// Verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Create a migration file.
    Create {
        /// Migration name.
        name: String,

        /// Target schemas, comma separated.
        #[arg(short, long)]
        schemas: String,

        /// Target clusters, comma separated.
        #[arg(short, long)]
        clusters: Option<String>,

        /// Description recorded in the file header.
        #[arg(short, long)]
        description: Option<String>,
    },

    /// Apply pending migrations.
    Migrate {
        /// Stop at this version (inclusive).
        #[arg(short, long)]
        target: Option<String>,

        /// Only these schemas, comma separated.
        #[arg(short, long)]
        schemas: Option<String>,

        /// Only these clusters, comma separated.
        #[arg(short, long)]
        clusters: Option<String>,

        /// Plan without executing.
        #[arg(short, long)]
        dry_run: bool,

        /// Run independent (schema, cluster) lanes concurrently.
        #[arg(short, long)]
        parallel: bool,
    },

    /// Roll back applied migrations.
    Rollback {
        /// Roll back everything above this version.
        #[arg(short, long)]
        target: Option<String>,

        /// Number of migrations to undo.
        #[arg(short = 'n', long, default_value_t = 1)]
        steps: usize,

        #[arg(short, long)]
        schemas: Option<String>,

        #[arg(short, long)]
        clusters: Option<String>,

        #[arg(short, long)]
        dry_run: bool,
    },

    /// Show applied and pending migrations.
    Status {
        #[arg(short, long)]
        schemas: Option<String>,

        #[arg(short, long)]
        clusters: Option<String>,
    },

    /// List registered migrations.
    List,
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

/// Run one command to completion, or exit 130 on Ctrl-C.
pub async fn run(cli: Cli, coordinator: &Coordinator) -> i32 {
    select! {
        code = execute(cli, coordinator) => code,
        _ = ctrl_c() => EXIT_SIGINT,
    }
}

async fn execute(cli: Cli, coordinator: &Coordinator) -> i32 {
    match dispatch(cli.command, coordinator).await {
        Ok(()) => EXIT_OK,
        Err(err) => {
            error!("{}", err);
            EXIT_ERROR
        }
    }
}

#[allow(clippy::print_stdout)]
async fn dispatch(
    command: Commands,
    coordinator: &Coordinator,
) -> Result<(), crate::coordinator::Error> {
    let migrations = coordinator.migrations();
    migrations.initialize().await?;

    match command {
        Commands::Create {
            name,
            schemas,
            clusters,
            description,
        } => {
            let path = migrations.create_migration(
                &name,
                &CreateOptions {
                    schemas: split_list(&schemas),
                    clusters: clusters.as_deref().map(split_list),
                    description,
                },
            )?;
            println!("Created {}", path.display());
        }

        Commands::Migrate {
            target,
            schemas,
            clusters,
            dry_run,
            parallel,
        } => {
            let status = migrations
                .migrate(&MigrateOptions {
                    target_version: target,
                    schemas: schemas.as_deref().map(split_list),
                    clusters: clusters.as_deref().map(split_list),
                    dry_run,
                    parallel,
                    ..Default::default()
                })
                .await?;

            if dry_run {
                println!("{} pending:", status.pending_migrations());
                for pending in &status.pending {
                    println!(
                        "  {} {} [{}.{}]",
                        pending.version, pending.name, pending.cluster_id, pending.schema
                    );
                }
            } else {
                println!("Applied {} migrations", status.executed.len());
                for failed in &status.failed {
                    println!("  failed: {} ({})", failed.version, failed.error);
                }
            }
        }

        Commands::Rollback {
            target,
            steps,
            schemas,
            clusters,
            dry_run,
        } => {
            let status = migrations
                .rollback(&RollbackOptions {
                    target_version: target,
                    steps,
                    schemas: schemas.as_deref().map(split_list),
                    clusters: clusters.as_deref().map(split_list),
                    dry_run,
                    force: false,
                })
                .await?;

            if dry_run {
                println!("{} to roll back:", status.pending_migrations());
                for pending in &status.pending {
                    println!(
                        "  {} {} [{}.{}]",
                        pending.version, pending.name, pending.cluster_id, pending.schema
                    );
                }
            } else {
                println!("Rolled back {} migrations", status.executed.len());
            }
        }

        Commands::Status { schemas, clusters } => {
            let status = migrations
                .get_status(
                    schemas.as_deref().map(split_list).as_deref(),
                    clusters.as_deref().map(split_list).as_deref(),
                )
                .await?;

            println!("Applied ({}):", status.applied_migrations());
            for record in &status.applied {
                println!(
                    "  {} {} [{}.{}] batch {}",
                    record.version, record.name, record.cluster_id, record.schema, record.batch
                );
            }
            println!("Pending ({}):", status.pending_migrations());
            for pending in &status.pending {
                println!(
                    "  {} {} [{}.{}]",
                    pending.version, pending.name, pending.cluster_id, pending.schema
                );
            }
        }

        Commands::List => {
            for migration in migrations.get_migrations() {
                println!(
                    "{} {} schemas={}",
                    migration.version,
                    migration.name,
                    migration.target_schemas.join(",")
                );
            }
        }
    }

    Ok(())
}
