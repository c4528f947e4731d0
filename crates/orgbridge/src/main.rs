//! orgbridge: migrate records between two CRM orgs.
//!
//! Main binary with subcommands:
//! - `migrate`: run named stages in dependency order (or `--all`)
//! - one subcommand per stage for step-by-step runs
//!
//! Credentials come from `ORGBRIDGE_SOURCE_*` / `ORGBRIDGE_TARGET_*`
//! (a `.env` file is read first); migration policy from a TOML file.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use miette::Result;
use orgbridge_pipeline::MigrationConfig;
use orgbridge_pipeline::stages::activities::Activity;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod connect;
mod migrate;

fn parse_activity(s: &str) -> Result<Activity, String> {
    s.parse().map_err(|e: orgbridge_pipeline::MigrateError| e.to_string())
}

#[derive(Parser)]
#[command(name = "orgbridge")]
#[command(about = "Migrate activities, files, feeds and email between CRM orgs", long_about = None)]
struct Cli {
    /// Migration policy file (defaults apply when it does not exist)
    #[arg(long, global = true, env = "ORGBRIDGE_CONFIG", default_value = "orgbridge.toml")]
    config: PathBuf,

    /// Override the configured output directory
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,

    #[command(flatten)]
    orgs: connect::OrgArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run migration stages in dependency order
    Migrate {
        /// Stage name to run (default: activity-tree)
        #[arg(value_name = "STAGE")]
        stage: Option<String>,

        /// List available stages
        #[arg(long)]
        list: bool,

        /// Plan without writing to the target
        #[arg(long)]
        dry_run: bool,

        /// Run every stage
        #[arg(long)]
        all: bool,
    },

    /// Migrate tasks or events
    Activities {
        /// Activity type: task or event
        #[arg(value_name = "TYPE", value_parser = parse_activity)]
        activity: Activity,

        /// Only these source ids (comma-separated) instead of the configured condition
        #[arg(long, value_delimiter = ',')]
        ids: Vec<String>,

        /// Plan without writing to the target
        #[arg(long)]
        dry_run: bool,
    },

    /// Migrate attachments of migrated activities
    Attachments {
        /// Activity outcome logs to read (default: the task and event logs)
        #[arg(long = "mapping", value_name = "CSV")]
        mappings: Vec<PathBuf>,
    },

    /// Migrate files shared with migrated activities
    Files {
        /// Activity outcome logs to read (default: the task and event logs)
        #[arg(long = "mapping", value_name = "CSV")]
        mappings: Vec<PathBuf>,
    },

    /// Migrate feed items
    Feed {
        /// Use eligible parent records instead of migrated activities
        #[arg(long)]
        eligible_parents: bool,

        /// Activity outcome logs to read (default: the task and event logs)
        #[arg(long = "mapping", value_name = "CSV", conflicts_with = "eligible_parents")]
        mappings: Vec<PathBuf>,
    },

    /// Migrate comments of feed items logged by `feed`
    FeedComments,

    /// Migrate email templates referenced by eligible messages
    EmailTemplates,

    /// Migrate email messages using the template mapping
    EmailMessages,

    /// Export the content document link mapping of eligible parents
    ContentExport,

    /// Upload and link documents from the link mapping
    ContentMigrate,

    /// Recreate public distributions of migrated documents
    ContentDistributions,

    /// Mask personal data on migrated target records
    Mask {
        /// Only this object (default: every configured policy)
        #[arg(long)]
        object: Option<String>,
    },

    /// Audit inactive picklist values on the target org
    Picklists {
        /// Objects to audit (default: eligibility objects, Task and Event)
        #[arg(value_name = "OBJECT")]
        objects: Vec<String>,
    },
}

fn load_config(cli: &Cli) -> Result<MigrationConfig> {
    let mut config = MigrationConfig::load(&cli.config).map_err(commands::fail)?;
    if let Some(dir) = &cli.output_dir {
        config.output_dir = dir.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine; the environment may already be set
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "orgbridge=info,orgbridge_pipeline=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let orgs = &cli.orgs;

    match cli.command {
        Commands::Migrate {
            stage,
            list,
            dry_run,
            all,
        } => {
            migrate::run_migrate_command(orgs, config, stage.as_deref(), list, dry_run, all).await
        }
        Commands::Activities {
            activity,
            ids,
            dry_run,
        } => commands::activities(orgs, config, activity, ids, dry_run).await,
        Commands::Attachments { mappings } => commands::attachments(orgs, config, mappings).await,
        Commands::Files { mappings } => commands::files(orgs, config, mappings).await,
        Commands::Feed {
            eligible_parents,
            mappings,
        } => commands::feed(orgs, config, eligible_parents, mappings).await,
        Commands::FeedComments => commands::feed_comments(orgs, config).await,
        Commands::EmailTemplates => commands::email_templates(orgs, config).await,
        Commands::EmailMessages => commands::email_messages(orgs, config).await,
        Commands::ContentExport => commands::content_export(orgs, config).await,
        Commands::ContentMigrate => commands::content_migrate(orgs, config).await,
        Commands::ContentDistributions => commands::content_distributions(orgs, config).await,
        Commands::Mask { object } => commands::mask(orgs, config, object).await,
        Commands::Picklists { objects } => commands::picklists(orgs, config, objects).await,
    }
}
