use std::sync::Arc;

use anyhow::Result;
use cadenza_core::redact::{redact_header, redact_url};
use cadenza_core::{init_logging, AppDirs, Config};
use cadenza_http::{
    CancellationToken, HttpError, HttpRequest, InMemoryMetrics, Metrics, MetricsSnapshot,
    ProfileRegistry, ReqwestTransport, ResilienceProfile, ResilientExecutor,
};
use clap::{Parser, Subcommand};
use thiserror::Error;
use tokio::task::JoinHandle;

#[derive(Debug, Parser)]
#[command(name = "cadenza", version, about = "Resilient HTTP engine for streaming plugins")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Fetch a URL through the engine and report what happened
    Fetch(FetchCommand),
    /// Resilience profile commands
    #[command(subcommand)]
    Profiles(ProfilesCommand),
}

#[derive(Debug, Subcommand)]
enum ProfilesCommand {
    /// List built-in and configured profiles
    List,
}

#[derive(Debug, Parser, Clone)]
struct FetchCommand {
    /// Absolute URL to request
    url: String,
    /// Resilience profile to run under
    #[arg(long, default_value = "details")]
    profile: String,
    /// Logical endpoint name used for cache policy
    #[arg(long)]
    endpoint: Option<String>,
    /// Issue this many identical calls at once
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..=256))]
    repeat: u16,
    /// Extra request header as `name: value`; may be repeated
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
    /// Print the response body of the first call
    #[arg(long)]
    show_body: bool,
}

#[derive(Debug, Error)]
enum FetchError {
    #[error("header {0:?} must look like `name: value`")]
    MalformedHeader(String),
    #[error(transparent)]
    Request(#[from] HttpError),
}

impl FetchCommand {
    fn request(&self) -> Result<HttpRequest, FetchError> {
        let mut request = HttpRequest::get(&self.url)?;
        for raw in &self.headers {
            let (name, value) = parse_header(raw)?;
            tracing::debug!(header = name, value = redact_header(name, value), "extra request header");
            request = request.header(name, value)?;
        }
        if let Some(endpoint) = &self.endpoint {
            request = request.endpoint(endpoint.clone());
        }
        Ok(request)
    }
}

fn parse_header(raw: &str) -> Result<(&str, &str), FetchError> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| FetchError::MalformedHeader(raw.to_string()))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(FetchError::MalformedHeader(raw.to_string()));
    }
    Ok((name, value.trim()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let dirs = AppDirs::discover()?;
    let config = Config::load_or_default(&dirs)?;
    let _logging = init_logging(&config.logging, &dirs)?;

    match cli.command {
        Command::Profiles(ProfilesCommand::List) => {
            for profile in ProfileRegistry::from_config(&config.http).iter() {
                println!("{}", describe_profile(profile));
            }
        }
        Command::Fetch(fetch) => run_fetch(&config, fetch).await?,
    }

    Ok(())
}

async fn run_fetch(config: &Config, fetch: FetchCommand) -> Result<()> {
    let request = fetch.request()?;
    let sink = Arc::new(InMemoryMetrics::new());
    let transport = Arc::new(ReqwestTransport::new(&config.http.user_agent)?);
    let executor = Arc::new(
        ResilientExecutor::configured(transport, &config.http)
            .metrics(Metrics::new(sink.clone()))
            .build(),
    );
    let shutdown = CancellationToken::new();
    let sweeper = executor.spawn_sweeper(shutdown.clone());

    tracing::info!(
        url = %redact_url(request.url()),
        profile = %fetch.profile,
        repeat = fetch.repeat,
        "fetch started"
    );
    let calls = (0..fetch.repeat).map(|_| {
        let executor = executor.clone();
        let request = request.clone();
        let profile = fetch.profile.clone();
        let cancel = shutdown.child_token();
        async move { executor.execute(request, &profile, &cancel).await }
    });
    let outcomes = futures::future::join_all(calls).await;
    stop_sweeper(&shutdown, sweeper).await;

    for (index, outcome) in outcomes.iter().enumerate() {
        match outcome {
            Ok(response) => println!(
                "#{index}: {} ({} bytes)",
                response.status(),
                response.body().len()
            ),
            Err(error) => println!("#{index}: error: {error}"),
        }
    }
    if fetch.show_body {
        if let Some(Ok(response)) = outcomes.first() {
            println!("{}", response.text_lossy());
        }
    }
    print_metrics(&sink.snapshot());
    Ok(())
}

/// Returns `false` when the sweeper task panicked or was aborted.
async fn stop_sweeper(shutdown: &CancellationToken, sweeper: JoinHandle<()>) -> bool {
    shutdown.cancel();
    match sweeper.await {
        Ok(()) => true,
        Err(error) => {
            tracing::warn!(error = %error, "dedup sweeper task failed");
            false
        }
    }
}

fn describe_profile(profile: &ResilienceProfile) -> String {
    let budget = profile
        .configured_retry_budget()
        .map(|budget| format!("{}ms", budget.as_millis()))
        .unwrap_or_else(|| "unbounded".to_string());
    let timeout = profile
        .configured_per_request_timeout()
        .map(|timeout| format!("{}ms", timeout.as_millis()))
        .unwrap_or_else(|| "none".to_string());
    let aggregate = profile
        .aggregate_concurrency_per_host()
        .map(|limit| limit.to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{}: retries={} budget={} per-host={} host-total={} timeout={} backoff={}..{}ms",
        profile.name(),
        profile.configured_max_retries(),
        budget,
        profile.configured_max_concurrency_per_host(),
        aggregate,
        timeout,
        profile.configured_base_backoff().as_millis(),
        profile.configured_max_backoff().as_millis(),
    )
}

fn print_metrics(snapshot: &MetricsSnapshot) {
    if snapshot.counters.is_empty() && snapshot.gauge_peaks.is_empty() {
        println!("metrics: (none recorded)");
        return;
    }
    println!("metrics:");
    for (name, value) in &snapshot.counters {
        println!("  {name} = {value}");
    }
    for ((name, host), peak) in &snapshot.gauge_peaks {
        println!("  {name}[{host}] peak = {peak}");
    }
}
