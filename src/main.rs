use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::Parser;
use serde::Serialize;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use tracing::info;

use sportsbook_consensus::config::{Command, Config};
use sportsbook_consensus::db::Database;
use sportsbook_consensus::engine::BlendEngine;

fn main() -> Result<()> {
    // Initialise tracing / logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();
    config.validate()?;

    let db = Database::open(&config.database_path)?;
    info!("Database opened: {}", config.database_path);

    let engine = BlendEngine::new(db, config.forecasters.clone());
    let league = config.league.as_str();

    match &config.command {
        Command::Import(args) => {
            if let Some(path) = &args.quotes {
                let file = File::open(path).with_context(|| format!("cannot open {path}"))?;
                engine.import_quotes(BufReader::new(file), league, args.odds_format)?;
            }
            if let Some(path) = &args.outcomes {
                let file = File::open(path).with_context(|| format!("cannot open {path}"))?;
                engine.import_outcomes(BufReader::new(file))?;
            }
        }
        Command::Estimate(args) => {
            let plan = args.plan()?;
            let summary = engine.estimate_league(league, &plan)?;
            write_json(&summary, None)?;
        }
        Command::Combine(args) => {
            let as_of = args.as_of.unwrap_or_else(Utc::now);
            let slate = engine.score_league(
                league,
                as_of,
                Duration::minutes(args.max_quote_age_mins),
                args.alpha,
                args.min_expected_return,
            )?;
            write_json(&slate, args.output.as_deref())?;
        }
        Command::Weights(args) => {
            let report = engine.weight_report(league, &args.time_grid(), args.alpha)?;
            write_json(&report, args.output.as_deref())?;
        }
    }

    Ok(())
}

/// Pretty JSON to `path`, or stdout when absent.
fn write_json<T: Serialize>(value: &T, path: Option<&str>) -> Result<()> {
    match path {
        Some(path) => {
            let file = File::create(path).with_context(|| format!("cannot create {path}"))?;
            let mut out = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut out, value)?;
            out.flush()?;
            info!("Wrote {}", path);
        }
        None => {
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            serde_json::to_writer_pretty(&mut out, value)?;
            writeln!(out)?;
        }
    }
    Ok(())
}
