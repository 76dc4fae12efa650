/// Entry point for the FocusBook migration tool
///
/// `local` moves the document store into the SQLite database next to it.
/// `remote` imports the legacy JSON files into the PostgreSQL database named
/// by the `DB_*` environment variables.
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use focusbook_storage::{
    DocumentToSqliteMigration, JsonToPostgresMigration, PostgresStore, StorageConfig,
};

/// Command line arguments for the migration tool
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Enable verbose output (implies debug)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Copy the document store into SQLite
    Local {
        /// Directory holding the document store and the SQLite file
        /// If not provided, uses the default data directory
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Migrate even when SQLite already holds app usage
        #[arg(long)]
        force: bool,
    },
    /// Import the legacy JSON files into PostgreSQL
    Remote {
        /// Directory holding data.json and the category files
        #[arg(long)]
        json_dir: Option<PathBuf>,

        /// Migrate even when the database is marked as migrated
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let log_level = if args.verbose {
        "debug"
    } else if args.debug {
        "info"
    } else {
        "warn"
    };

    tracing_subscriber::fmt()
        .with_env_filter(format!("focusbook_storage={}", log_level))
        .with_writer(std::io::stderr) // Send logs to stderr, the report goes to stdout
        .init();

    let report = match args.command {
        Command::Local { data_dir, force } => {
            let data_dir = match data_dir {
                Some(dir) => dir,
                None => StorageConfig::default_data_dir()?,
            };
            info!("Migrating document store in {}", data_dir.display());

            DocumentToSqliteMigration::new(&StorageConfig::new(data_dir))
                .force(force)
                .run()
                .await?
        }
        Command::Remote { json_dir, force } => {
            let json_dir = match json_dir {
                Some(dir) => dir,
                None => StorageConfig::default_data_dir()?.join("Data"),
            };
            info!("Migrating JSON files in {}", json_dir.display());

            JsonToPostgresMigration::new(PostgresStore::from_env()?, json_dir)
                .force(force)
                .run()
                .await?
        }
    };

    print!("{}", report);
    Ok(())
}
