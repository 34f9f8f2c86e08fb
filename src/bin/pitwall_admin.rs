//! Schema lifecycle tool for the state/aggregate store
//!
//! Usage:
//!   pitwall_admin ensure [--dir <path>]   create built-in (or directory) schemas
//!   pitwall_admin delete <name>           drop one schema
//!   pitwall_admin status                  report required schemas
//!
//! Targets `PITWALL_ADMIN_URL` when set, otherwise the SQLite store at
//! `PITWALL_DB_PATH`.

use dotenv::dotenv;
use log::{error, info};
use pitwall::admin::schema::load_definitions;
use pitwall::admin::{builtin_definitions, ensure_all, provisioner_from_config, REQUIRED_SCHEMAS};
use pitwall::pipeline::PipelineConfig;
use std::env;

const USAGE: &str = "usage: pitwall_admin ensure [--dir <path>] | delete <name> | status";

#[derive(Debug, PartialEq)]
enum Command {
    Ensure { dir: Option<String> },
    Delete { name: String },
    Status,
}

fn parse_args(args: &[String]) -> Option<Command> {
    match args.first().map(|s| s.as_str()) {
        Some("ensure") => {
            let dir = match args.iter().position(|a| a == "--dir") {
                Some(idx) => Some(args.get(idx + 1)?.clone()),
                None => None,
            };
            Some(Command::Ensure { dir })
        }
        Some("delete") => args.get(1).map(|name| Command::Delete { name: name.clone() }),
        Some("status") => Some(Command::Status),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let args: Vec<String> = env::args().skip(1).collect();
    let command = match parse_args(&args) {
        Some(command) => command,
        None => {
            eprintln!("{}", USAGE);
            std::process::exit(2);
        }
    };

    let config = PipelineConfig::from_env()?;
    let provisioner = provisioner_from_config(config.admin_url.as_deref(), &config.db_path)?;

    match command {
        Command::Ensure { dir } => {
            let definitions = match dir {
                Some(dir) => load_definitions(&dir)?,
                None => builtin_definitions(),
            };
            ensure_all(provisioner.as_ref(), &definitions).await?;
        }
        Command::Delete { name } => {
            provisioner.delete_schema(&name).await?;
            info!("🗑️  Schema '{}' deleted via {}", name, provisioner.describe());
        }
        Command::Status => {
            info!("📦 Schema status ({})", provisioner.describe());
            let mut missing = 0;
            for (i, name) in REQUIRED_SCHEMAS.iter().enumerate() {
                let branch = if i + 1 == REQUIRED_SCHEMAS.len() { "└─" } else { "├─" };
                if provisioner.has_schema(name).await? {
                    info!("   {} ✅ {}", branch, name);
                } else {
                    info!("   {} ❌ {} (missing)", branch, name);
                    missing += 1;
                }
            }
            if missing > 0 {
                error!("❌ {} required schema(s) missing", missing);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
