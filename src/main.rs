mod cli;
mod config;
mod engine;
mod error;
mod process;
mod remote;
mod secret;
mod server;

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use dialoguer::Password;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};
use crate::config::EngineConfig;
use crate::engine::{ProgressReporter, SyncEvent};
use crate::remote::SshEndpoint;
use crate::secret::SecretBox;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cfg = EngineConfig::from_env();
    let db_path = match cli.db.clone() {
        Some(path) => path,
        None => config::default_db_path()?,
    };

    match cli.command {
        Commands::Serve(args) => {
            config::ensure_parent_dir(&db_path)?;
            let secrets = SecretBox::load_or_init(&config::default_key_path()?)?;
            server::run_server(args.host, args.port, db_path, cfg, secrets).await
        }
        Commands::Sync(args) => {
            let secrets = SecretBox::load_or_init(&config::default_key_path()?)?;

            let bar = ProgressBar::new(100);
            bar.set_style(
                ProgressStyle::with_template(
                    "{spinner:.green} [{bar:40.cyan/blue}] {pos:>3}% {msg}",
                )?
                .progress_chars("=>-"),
            );
            let bar_for_events = bar.clone();
            let reporter: ProgressReporter = Arc::new(move |event: SyncEvent| {
                let SyncEvent::Progress { percent, speed } = event;
                bar_for_events.set_position(percent as u64);
                bar_for_events.set_message(speed);
            });

            let result =
                server::run_task_once(db_path, cfg, secrets, args.task_id, Some(reporter)).await;
            bar.finish_and_clear();
            let outcome = result?;
            println!("{}", outcome.output);
            if outcome.success {
                println!("sync finished via {}", outcome.mode.as_str());
                Ok(())
            } else {
                Err(anyhow!("sync failed via {}", outcome.mode.as_str()))
            }
        }
        Commands::TestConnection(args) => {
            let mut password = Password::new()
                .with_prompt(format!("Password for {}@{}", args.user, args.host))
                .interact()
                .context("failed to read password")?;
            let endpoint = SshEndpoint {
                host: args.host,
                port: args.port,
                username: args.user,
            };
            let result = remote::test_connection(&cfg, &endpoint, &password).await;
            secret::scrub(&mut password);
            match result {
                Ok(()) => {
                    println!("connection ok");
                    Ok(())
                }
                Err(err) => Err(anyhow!("connection failed: {err}")),
            }
        }
    }
}
