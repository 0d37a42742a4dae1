mod chart;
mod cli;
mod config;
mod error;
mod http;
mod logging;
mod normalize;
mod segment;
mod services;
mod store;
mod types;

use std::fs::File;

use clap::Parser;
use serde::Serialize;

use crate::cli::{Cli, Command};
use crate::config::{load_file_config, save_file_config};
use crate::normalize::{is_extension_allowed, read_capped};
use crate::services::{AppState, NO_DATA_MESSAGE, load_graphs, load_titles, process_upload};
use crate::types::MessageResponse;

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose);

    let mut config = load_file_config(&cli.config)?;
    cli.apply_overrides(&mut config);
    config.validate()?;

    match cli.command {
        Command::Serve { .. } => {
            http::run_server(AppState::new(config))?;
        }
        Command::Ingest { ref path } => {
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if !is_extension_allowed(&file_name, &config.allowed_extensions) {
                return Err(format!("{}: {}", path.display(), http::INVALID_FORMAT_MESSAGE).into());
            }
            let bytes = read_capped(File::open(path)?, config.max_upload_bytes)?;
            let state = AppState::new(config);
            let response = process_upload(&state, &file_name, &bytes)?;
            print_json(&response)?;
        }
        Command::Graphs => {
            let state = AppState::new(config);
            match load_graphs(&state)? {
                Some(set) => print_json(&set)?,
                None => print_json(&MessageResponse::new(NO_DATA_MESSAGE))?,
            }
        }
        Command::Titles => {
            let state = AppState::new(config);
            print_json(&load_titles(&state)?)?;
        }
        Command::Config { save } => {
            if save {
                save_file_config(&cli.config, &config)?;
                tracing::info!(path = %cli.config.display(), "config saved");
            }
            print_json(&config)?;
        }
    }
    Ok(())
}
