//! chat-cache - operate on chat cache mirror directories
//!
//! Reports statistics, runs maintenance, inspects mirror documents and keeps
//! a scheduler running against a cache directory.

mod commands;
mod error;

use crate::error::Result;
use chat_cache::{Domain, SearchCriteria};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "chat-cache")]
#[command(version)]
#[command(about = "Inspect and maintain chat cache mirror directories")]
#[command(propagate_version = true)]
struct Cli {
    /// Mirror directory (defaults to CACHE_DIR or ./cache/chat)
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mirror sizes per domain, without touching the directory
    Stats,
    /// Enforce memory and mirror budgets now
    Maintain,
    /// List entries stored in a domain's mirror
    Inspect {
        /// message, event, contact, chat or group_metadata
        domain: Domain,
        /// Show only this key
        #[arg(long)]
        key: Option<String>,
        /// Conversation id or event type
        #[arg(long)]
        scope: Option<String>,
        /// Only entries at or after this RFC 3339 time
        #[arg(long)]
        since: Option<DateTime<Utc>>,
        /// Only entries at or before this RFC 3339 time
        #[arg(long)]
        until: Option<DateTime<Utc>>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Remove everything cached for a domain
    Purge { domain: Domain },
    /// Keep sweeping and maintaining until interrupted
    Run {
        /// Seconds between statistics log lines
        #[arg(long, default_value_t = 300)]
        stats_every: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let env_filter = EnvFilter::from_default_env()
        .add_directive("chat_cache=info".parse()?)
        .add_directive("chat_cache_cli=info".parse()?);

    // Use JSON format for GCP Cloud Logging when LOG_FORMAT=json
    if std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false)
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    };

    match cli.command {
        Commands::Stats => {
            let config = commands::build_config(cli.cache_dir);
            let stats = commands::stats(&config).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                print!("{}", commands::render_stats(&stats));
            }
        }
        Commands::Maintain => {
            let config = commands::build_config(cli.cache_dir);
            let report = commands::maintain(config).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", commands::render_maintenance(&report));
            }
        }
        Commands::Inspect {
            domain,
            key,
            scope,
            since,
            until,
            limit,
        } => {
            let config = commands::build_config(cli.cache_dir);
            let criteria = SearchCriteria {
                scope,
                since,
                until,
                limit: Some(limit),
            };
            let entries = commands::inspect(&config, domain, key.as_deref(), &criteria).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                print!("{}", commands::render_entries(&entries)?);
            }
        }
        Commands::Purge { domain } => {
            let config = commands::build_config(cli.cache_dir);
            commands::purge(config, domain).await?;
            info!(domain = %domain, "Purged");
        }
        Commands::Run { stats_every } => {
            let config = commands::build_config(cli.cache_dir);
            info!(cache_dir = ?config.cache_dir, "Starting chat cache scheduler");
            commands::run(config, Duration::from_secs(stats_every)).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_inspect() {
        let cli = Cli::try_parse_from([
            "chat-cache",
            "--cache-dir",
            "/tmp/c",
            "inspect",
            "messages",
            "--scope",
            "123@g.us",
            "--since",
            "2024-05-01T00:00:00Z",
        ])
        .unwrap();

        assert_eq!(cli.cache_dir, Some(PathBuf::from("/tmp/c")));
        match cli.command {
            Commands::Inspect {
                domain,
                scope,
                since,
                limit,
                ..
            } => {
                assert_eq!(domain, Domain::Message);
                assert_eq!(scope.as_deref(), Some("123@g.us"));
                assert!(since.is_some());
                assert_eq!(limit, 20);
            }
            _ => panic!("expected inspect"),
        }
    }

    #[test]
    fn test_unknown_domain_rejected() {
        assert!(Cli::try_parse_from(["chat-cache", "purge", "stickers"]).is_err());
    }

    #[test]
    fn test_global_json_flag_after_subcommand() {
        let cli = Cli::try_parse_from(["chat-cache", "stats", "--json"]).unwrap();
        assert!(cli.json);
    }
}
