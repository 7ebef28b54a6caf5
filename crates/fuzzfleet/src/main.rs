//! Fuzzfleet CLI - remote fuzzing-fleet orchestration
//!
//! Binary name: `fuzzfleet`

use std::{path::Path, process};

use anyhow::{Context as _, Result};
use clap::ArgMatches;
use fuzzfleet_core::{Config, Session};
use tracing::{error, info};

mod cli;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let matches = cli::build_cli().get_matches();
    if let Err(e) = run(&matches).await {
        error!("{e:#}");
        #[allow(clippy::exit)]
        process::exit(1);
    }
}

async fn run(matches: &ArgMatches) -> Result<()> {
    let config_path = matches
        .get_one::<String>("config")
        .context("config path missing")?;
    let config = Config::load(Path::new(config_path))
        .await
        .with_context(|| format!("loading {config_path}"))?;

    let locations: Vec<String> = match matches.get_many::<String>("location") {
        Some(tags) => tags.cloned().collect(),
        None => config.locations.keys().cloned().collect(),
    };
    anyhow::ensure!(!locations.is_empty(), "no locations configured");

    // Locations are handled one at a time; a fatal error at one stops
    // the run before later locations are touched.
    for location in &locations {
        dispatch(matches, config.clone(), location).await?;
    }
    Ok(())
}

async fn dispatch(matches: &ArgMatches, config: Config, location: &str) -> Result<()> {
    let session = Session::connect(config, location)
        .await
        .with_context(|| format!("connecting to {location}"))?;
    let outcome = execute(matches, &session).await;
    session.close().await;
    outcome.with_context(|| format!("operating on {location}"))
}

async fn execute(matches: &ArgMatches, session: &Session) -> Result<()> {
    match matches.subcommand() {
        Some(("up", _)) => {
            session.bring_up().await?;
        }
        Some(("down", _)) => {
            session.bring_down().await?;
        }
        Some(("deploy", sub)) => {
            session.deploy(!sub.get_flag("keep-build")).await?;
        }
        Some(("all", sub)) => {
            session.refresh(!sub.get_flag("keep-build")).await?;
        }
        Some(("stats", _)) => {
            for job in session.list_jobs().await? {
                let name = job.name.clone();
                let handle = session.handle(job);
                let stats = handle.stats().await?;
                let line = serde_json::to_string(&stats)?;
                #[allow(clippy::print_stdout)]
                {
                    println!("{line}");
                }
                info!(location = session.location(), job = %name, "stats printed");
            }
        }
        Some(("jobs", _)) => {
            for job in session.list_jobs().await? {
                #[allow(clippy::print_stdout)]
                {
                    println!("{}\t{}\t{}", job.id, job.name, job.db_name);
                }
            }
        }
        _ => anyhow::bail!("unknown subcommand"),
    }
    Ok(())
}
