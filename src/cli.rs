use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::{AppConfig, DEFAULT_CONFIG_FILE, IngestionPolicy};

#[derive(Parser)]
#[command(name = "runledger")]
#[command(about = "Ingest instrument CSV runs into SQLite and serve per-element charts", long_about = None)]
#[command(version)]
pub(crate) struct Cli {
    /// JSON config file; missing means defaults.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    pub(crate) config: PathBuf,
    /// Override the SQLite run store path.
    #[arg(long, global = true)]
    pub(crate) db: Option<PathBuf>,
    /// Override how uploads combine with stored rows.
    #[arg(long, global = true, value_enum)]
    pub(crate) policy: Option<IngestionPolicy>,
    /// Debug-level logging unless RUST_LOG is set.
    #[arg(short, long, global = true)]
    pub(crate) verbose: bool,
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the HTTP server.
    Serve {
        #[arg(long)]
        bind: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// Number of request worker threads.
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Ingest a CSV file from disk, as if it had been uploaded.
    Ingest { path: PathBuf },

    /// Print the chart mapping as JSON.
    Graphs,

    /// Print the element titles as JSON.
    Titles,

    /// Print the effective configuration.
    Config {
        /// Also write it back to the config file.
        #[arg(long)]
        save: bool,
    },
}

impl Cli {
    /// Fold command-line overrides into a loaded config.
    pub(crate) fn apply_overrides(&self, config: &mut AppConfig) {
        if let Some(db) = &self.db {
            config.db_path = db.clone();
        }
        if let Some(policy) = self.policy {
            config.ingestion_policy = policy;
        }
        if let Command::Serve {
            bind,
            port,
            workers,
        } = &self.command
        {
            if let Some(bind) = bind {
                config.bind = bind.clone();
            }
            if let Some(port) = port {
                config.port = *port;
            }
            if let Some(workers) = workers {
                config.workers = *workers;
            }
        }
    }
}
