//! batch-runner: value every ticker on an exchange for today and cache the results.
//!
//! Usage:
//!   cargo run -p batch-runner -- --exchange NYSE --symbols KO PEP MSFT
//!   cargo run -p batch-runner -- --exchange NASDAQ --file tickers.txt --concurrency 8
//!   cargo run -p batch-runner -- --exchange XNYS --limit 500    # list tickers from Polygon
//!   cargo run -p batch-runner -- --status <JOB_ID>
//!   cargo run -p batch-runner -- --resume <JOB_ID>

use analysis_core::{BatchJob, BatchJobStatus, BatchOptions};
use analysis_orchestrator::{
    build_orchestrator_with, build_rate_limiter, BatchOrchestrator, EngineConfig,
};
use anyhow::Context;
use chrono::Utc;
use polygon_client::PolygonClient;
use std::sync::Arc;

const DEFAULT_LIST_LIMIT: usize = 5000;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let args: Vec<String> = std::env::args().collect();

    let mut config = EngineConfig::from_env().context("Invalid configuration")?;
    if let Some(db) = flag_value(&args, "--db") {
        config.database_url = db.to_string();
    }
    if has_flag(&args, "--retry-failed") {
        config.retry_failed = true;
    }
    let concurrency = positive_flag(&args, "--concurrency")?;
    if let Some(n) = concurrency {
        config.batch_concurrency = n;
    }

    // Ticker listing and the provider chain spend the same Polygon budget
    let limiter = build_rate_limiter(&config);
    let orchestrator = build_orchestrator_with(&config, Arc::clone(&limiter))
        .await
        .with_context(|| format!("Failed to open {}", config.database_url))?;

    if has_flag(&args, "--list") {
        for job in orchestrator.list_jobs(20).await? {
            println!(
                "{}  {:<9} {:<8} {}  {}/{} ({} ok, {} failed)",
                job.id,
                job.status.as_str(),
                job.exchange,
                job.analysis_date,
                job.counts.processed,
                job.counts.total,
                job.counts.succeeded,
                job.counts.failed
            );
        }
        return Ok(());
    }

    if let Some(id) = flag_value(&args, "--status") {
        let job = orchestrator.get_batch_status(id).await?;
        println!("{}", serde_json::to_string_pretty(&job)?);
        return Ok(());
    }

    if has_flag(&args, "--recover") {
        let ids = orchestrator.recover_interrupted().await?;
        if ids.is_empty() {
            println!("No interrupted batches");
        }
        for id in ids {
            let job = wait_or_cancel(&orchestrator, &id).await?;
            print_summary(&job);
        }
        return Ok(());
    }

    if let Some(id) = flag_value(&args, "--resume") {
        orchestrator.resume_batch(id).await?;
        let job = wait_or_cancel(&orchestrator, id).await?;
        print_summary(&job);
        return finish(&job);
    }

    let Some(exchange) = flag_value(&args, "--exchange") else {
        print_usage();
        std::process::exit(1);
    };

    let symbols: Vec<String> = if let Some(idx) = args.iter().position(|a| a == "--symbols") {
        args[idx + 1..]
            .iter()
            .take_while(|a| !a.starts_with("--"))
            .cloned()
            .collect()
    } else if let Some(path) = flag_value(&args, "--file") {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read ticker file {}", path))?;
        parse_ticker_file(&contents)
    } else {
        let limit = positive_flag(&args, "--limit")?.unwrap_or(DEFAULT_LIST_LIMIT);
        let Some(key) = config.polygon_api_key.clone() else {
            anyhow::bail!("No --symbols or --file given and POLYGON_API_KEY is not set");
        };
        tracing::info!(
            "Listing active tickers on {} from Polygon (limit: {})...",
            exchange,
            limit
        );
        let tickers = PolygonClient::new(key)
            .list_tickers(Some(exchange), limit, &*limiter)
            .await?;
        tracing::info!("Fetched {} tickers", tickers.len());
        tickers
    };

    let options = BatchOptions {
        force_refresh: has_flag(&args, "--force"),
        retry_failed: config.retry_failed,
        concurrency,
    };
    tracing::info!(
        "batch-runner: {} symbols on {}, db={}, force={}, retry_failed={}",
        symbols.len(),
        exchange,
        config.database_url,
        options.force_refresh,
        options.retry_failed
    );

    let id = orchestrator
        .start_batch_on(exchange, &symbols, Utc::now().date_naive(), options)
        .await?;
    println!("Batch {} started", id);

    let job = wait_or_cancel(&orchestrator, &id).await?;
    print_summary(&job);
    finish(&job)
}

fn init_tracing() {
    let filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(
                "batch_runner=info,analysis_orchestrator=info,provider_chain=info,\
                 polygon_client=warn",
            )
        })
    };
    let json_logging = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json_logging {
        tracing_subscriber::fmt().json().with_env_filter(filter()).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter()).init();
    }
}

/// Wait for a job; the first Ctrl-C asks it to stop after in-flight tickers.
async fn wait_or_cancel(orchestrator: &BatchOrchestrator, id: &str) -> anyhow::Result<BatchJob> {
    let wait = orchestrator.wait_for(id);
    tokio::pin!(wait);

    tokio::select! {
        job = &mut wait => Ok(job?),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received SIGINT, cancelling batch {}", id);
            orchestrator.cancel_batch(id).await?;
            Ok(wait.await?)
        }
    }
}

fn print_summary(job: &BatchJob) {
    let elapsed = job
        .completed_at
        .map(|end| (end - job.started_at).num_seconds())
        .unwrap_or_default();
    println!(
        "Batch {} {}: {}/{} processed, {} succeeded, {} failed in {}s",
        job.id,
        job.status.as_str(),
        job.counts.processed,
        job.counts.total,
        job.counts.succeeded,
        job.counts.failed,
        elapsed
    );
    if let Some(e) = &job.error_message {
        println!("  error: {}", e);
    }
}

fn finish(job: &BatchJob) -> anyhow::Result<()> {
    if job.status == BatchJobStatus::Failed {
        anyhow::bail!("Batch {} failed", job.id);
    }
    Ok(())
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .filter(|v| !v.starts_with("--"))
        .map(|s| s.as_str())
}

/// Value of a flag that must be a positive integer; `None` when the flag is absent.
fn positive_flag(args: &[String], flag: &str) -> anyhow::Result<Option<usize>> {
    if !has_flag(args, flag) {
        return Ok(None);
    }
    let Some(raw) = flag_value(args, flag) else {
        anyhow::bail!("{} needs a value", flag);
    };
    match raw.parse::<usize>() {
        Ok(n) if n > 0 => Ok(Some(n)),
        _ => anyhow::bail!("Invalid {} value '{}': expected a positive integer", flag, raw),
    }
}

/// One ticker per line; blank lines and `#` comments are ignored.
fn parse_ticker_file(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(|line| line.split('#').next().unwrap_or_default().trim())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  batch-runner --exchange NAME --symbols AAPL MSFT ...  Value specific tickers");
    eprintln!("  batch-runner --exchange NAME --file PATH              Tickers from a file");
    eprintln!(
        "  batch-runner --exchange NAME [--limit N]              Polygon listing (default {})",
        DEFAULT_LIST_LIMIT
    );
    eprintln!("  batch-runner --status JOB_ID                          Show a job");
    eprintln!("  batch-runner --list                                   Recent jobs");
    eprintln!("  batch-runner --resume JOB_ID                          Continue a stopped job");
    eprintln!("  batch-runner --recover                                Resume interrupted jobs");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --force            Ignore today's cached results");
    eprintln!("  --retry-failed     Recompute tickers whose cached result failed");
    eprintln!("  --concurrency N    Worker pool size");
    eprintln!("  --db URL           SQLite URL (default: $DATABASE_URL or sqlite:valuations.db)");
}
