//! Bastion server CLI

use bastion_hardening::abh::ConnectionKind;
use clap::{Arg, Command};
use std::path::PathBuf;
use thiserror::Error;
use tracing::error;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
use config::Config;

/// Returns the version of the crate.
pub const fn crate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Errors that can occur when running a subcommand.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("pem error: {0}")]
    Pem(#[from] pem::PemError),
    #[error("metrics error: {0}")]
    Metrics(#[from] std::fmt::Error),
    #[error(transparent)]
    Hardening(#[from] bastion_hardening::Error),
    #[error(transparent)]
    Persistence(#[from] bastion_persistence::Error),
}

fn config_arg() -> Arg {
    Arg::new("config")
        .long("config")
        .required(true)
        .help("Path to YAML config file")
        .value_parser(clap::value_parser!(PathBuf))
}

fn kind_arg() -> Arg {
    Arg::new("kind")
        .long("kind")
        .required(true)
        .help("Connection kind: agent, aggregate, browser, or external")
        .value_parser(|s: &str| s.parse::<ConnectionKind>().map_err(|err| err.to_string()))
}

/// Install the global subscriber. `RUST_LOG` takes precedence over the configured level.
fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Entrypoint for the Bastion server CLI
#[tokio::main]
async fn main() -> std::process::ExitCode {
    // Define application
    let matches = Command::new("bastion")
        .version(crate_version())
        .about("Operate the connection hardening material of a bastion server.")
        .subcommand_required(true)
        .subcommand(
            Command::new(commands::CHECK_CMD)
                .about("Load certificates, binary hashes, and secret blobs and report what was found.")
                .arg(config_arg()),
        )
        .subcommand(
            Command::new(commands::ABH_CMD)
                .about("Print the hashes accepted for a binary.")
                .arg(config_arg())
                .arg(kind_arg())
                .arg(
                    Arg::new("identity")
                        .long("identity")
                        .required(true)
                        .help("Binary identity: version/os/arch for agents, version otherwise")
                        .value_parser(clap::value_parser!(String)),
                ),
        )
        .subcommand(
            Command::new(commands::SIGN_CMD)
                .about("Sign a certificate signing request with the signing authority of a root.")
                .arg(config_arg())
                .arg(
                    Arg::new("root")
                        .long("root")
                        .required(true)
                        .help("Path to the PEM root certificate to issue under")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    Arg::new("csr")
                        .long("csr")
                        .required(true)
                        .help("Path to the PEM certificate signing request")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    Arg::new("out")
                        .long("out")
                        .help("Path to write the PEM certificate to (stdout if omitted)")
                        .value_parser(clap::value_parser!(PathBuf)),
                ),
        )
        .subcommand(
            Command::new(commands::TOKEN_CMD)
                .about("Issue a session token.")
                .arg(config_arg())
                .arg(
                    Arg::new("id")
                        .long("id")
                        .required(true)
                        .help("Hex-encoded agent hash")
                        .value_parser(clap::value_parser!(String)),
                )
                .arg(kind_arg()),
        )
        .get_matches();
    let Some((name, matches)) = matches.subcommand() else {
        return std::process::ExitCode::FAILURE;
    };

    // Load config and create logger
    let config_path = matches.get_one::<PathBuf>("config").unwrap();
    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load config {}: {e}", config_path.display());
            return std::process::ExitCode::FAILURE;
        }
    };
    init_logging(&config);

    // Run subcommand
    let result = match name {
        commands::CHECK_CMD => commands::check(&config).await,
        commands::ABH_CMD => {
            let kind = *matches.get_one::<ConnectionKind>("kind").unwrap();
            let identity = matches.get_one::<String>("identity").unwrap();
            commands::abh(&config, kind, identity).await
        }
        commands::SIGN_CMD => {
            let root = matches.get_one::<PathBuf>("root").unwrap();
            let csr = matches.get_one::<PathBuf>("csr").unwrap();
            let out = matches.get_one::<PathBuf>("out");
            commands::sign(&config, root, csr, out).await
        }
        commands::TOKEN_CMD => {
            let id = matches.get_one::<String>("id").unwrap();
            let kind = *matches.get_one::<ConnectionKind>("kind").unwrap();
            commands::token(&config, id, kind)
        }
        other => Err(Error::InvalidConfig(format!("unknown subcommand: {other}"))),
    };
    match result {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!(error = ?e, command = name, "command failed");
            std::process::ExitCode::FAILURE
        }
    }
}
