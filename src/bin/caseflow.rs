//! caseflow CLI - dependency-ordered API test execution.

use anyhow::{Context, Result};
use caseflow::{
    remote_cache::HttpRemoteBackend, CacheStore, DefaultSuiteRunner, RunReport, SuiteLoader,
    SuiteRunner, TestSuite,
};
use chrono::Utc;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Runs API test units in dependency order, propagating response data.
#[derive(Parser, Debug)]
#[command(name = "caseflow", version, about)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute every unit and report the results.
    Run(RunArgs),
    /// Print the execution order without sending requests.
    Plan(PlanArgs),
}

#[derive(Args, Debug)]
struct SuiteArgs {
    /// Suite files or directories.
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Base URL override.
    #[arg(short = 'b', long = "base-url")]
    base_url: Option<String>,

    /// Timeout in seconds per request.
    #[arg(short = 't', long = "timeout")]
    timeout: Option<u64>,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    suite: SuiteArgs,

    /// Stop at the first failing unit.
    #[arg(long = "stop-on-failure")]
    stop_on_failure: bool,

    /// Remote cache service URL for `remote:` keys.
    #[arg(long = "remote-cache-url", env = "CASEFLOW_REMOTE_CACHE_URL")]
    remote_cache_url: Option<String>,

    /// Bearer token for the remote cache service.
    #[arg(long = "remote-cache-key", env = "CASEFLOW_REMOTE_CACHE_KEY")]
    remote_cache_key: Option<String>,

    /// Directory to save report files.
    #[arg(short = 'r', long = "report-dir")]
    report_dir: Option<PathBuf>,

    /// Report output format.
    #[arg(long = "report-format", default_value = "json")]
    report_format: ReportFormat,
}

#[derive(Args, Debug)]
struct PlanArgs {
    #[command(flatten)]
    suite: SuiteArgs,

    /// Print the plan as JSON.
    #[arg(long = "json")]
    json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, ValueEnum)]
enum ReportFormat {
    Json,
    Yaml,
    Text,
}

fn init_tracing(verbose: bool) {
    if std::env::var_os("RUST_LOG").is_none() {
        let level = if verbose { "debug" } else { "info" };
        std::env::set_var("RUST_LOG", level);
    }

    if tracing::dispatcher::has_been_set() {
        return;
    }

    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .try_init();
}

fn load_suite(args: &SuiteArgs) -> Result<TestSuite> {
    let mut loader = SuiteLoader::new();
    for path in &args.paths {
        loader.add_path(path);
    }
    let mut suite = loader.load_suite().context("Failed to load suite")?;

    if let Some(timeout) = args.timeout {
        suite.config.timeout = timeout;
    }
    if let Some(base_url) = &args.base_url {
        suite.config.base_url = Some(base_url.clone());
    }
    if suite.units.is_empty() {
        warn!("Suite '{}' declares no units", suite.name);
    }
    Ok(suite)
}

fn build_cache(suite: &TestSuite, args: &RunArgs) -> Result<Arc<CacheStore>> {
    let remote_url = args
        .remote_cache_url
        .clone()
        .or_else(|| suite.config.cache.remote_url.clone());
    let Some(remote_url) = remote_url else {
        debug!("No remote cache configured, remote: keys will fail");
        return Ok(Arc::new(CacheStore::new()));
    };

    let mut backend = HttpRemoteBackend::new(&remote_url)?;
    if let Some(key) = &args.remote_cache_key {
        backend = backend.with_api_key(key.clone());
    }
    info!("Using remote cache at {}", remote_url);
    Ok(Arc::new(CacheStore::with_remote(
        Arc::new(backend),
        suite.config.cache.namespace.clone(),
    )))
}

fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...(truncated)", &text[..end])
}

fn print_report(report: &RunReport, verbose: bool) {
    let status = if report.success {
        "\x1b[32mPASS\x1b[0m"
    } else {
        "\x1b[31mFAIL\x1b[0m"
    };
    info!("{} suite: {} ({} ms)", status, report.name, report.duration_ms);

    for (i, unit) in report.units.iter().enumerate() {
        let unit_status = if unit.success {
            "\x1b[32m✓\x1b[0m"
        } else {
            "\x1b[31m✗\x1b[0m"
        };
        let inline = if unit.inline { " [inline]" } else { "" };
        info!(
            "  {}. {} {}{} ({} ms)",
            i + 1,
            unit_status,
            unit.id,
            inline,
            unit.duration_ms
        );

        if let Some(error) = &unit.error {
            error!("     \x1b[31mError: {}\x1b[0m", error);
        }

        if verbose {
            if let Some(request) = &unit.request {
                debug!("     Request: {} {}", request.method, request.url);
                if let Some(body) = &request.body {
                    debug!("     Request body: {}", truncate(body, 500));
                }
            }
            if let Some(response) = &unit.response {
                debug!("     Response: Status {}", response.status);
                if let Some(body) = &response.body {
                    debug!("     Response body: {}", truncate(body, 500));
                }
            }
            if !unit.cache_keys.is_empty() {
                debug!("     Cached: {}", unit.cache_keys.join(", "));
            }
        }
    }

    info!(
        "Summary:\n  Total: {}\n  \x1b[32mPassed: {}\x1b[0m\n  \x1b[31mFailed: {}\x1b[0m\n  Duration: {} ms",
        report.units.len(),
        report.passed(),
        report.failed(),
        report.duration_ms
    );
}

fn save_report(report: &RunReport, report_dir: &Path, format: ReportFormat) -> Result<PathBuf> {
    if !report_dir.exists() {
        fs::create_dir_all(report_dir)?;
    }

    let timestamp = Utc::now().timestamp();
    let sanitized_name = report.name.replace([' ', '/'], "_");

    let (filename, content) = match format {
        ReportFormat::Json => (
            format!("{sanitized_name}-{timestamp}.json"),
            serde_json::to_string_pretty(report)?,
        ),
        ReportFormat::Yaml => (
            format!("{sanitized_name}-{timestamp}.yaml"),
            serde_yaml::to_string(report)?,
        ),
        ReportFormat::Text => {
            let mut content = String::new();
            content.push_str(&format!("Suite: {}\n", report.name));
            content.push_str(&format!(
                "Status: {}\n",
                if report.success { "PASS" } else { "FAIL" }
            ));
            content.push_str(&format!("Duration: {} ms\n", report.duration_ms));
            content.push_str(&format!("Order: {}\n", report.order.join(" -> ")));
            for warning in &report.warnings {
                content.push_str(&format!("Warning: {warning}\n"));
            }
            content.push_str("\nUnits:\n");
            for (i, unit) in report.units.iter().enumerate() {
                content.push_str(&format!(
                    "  {}. {} ({:?})\n",
                    i + 1,
                    unit.id,
                    unit.state
                ));
                if let Some(error) = &unit.error {
                    content.push_str(&format!("     Error: {error}\n"));
                }
                content.push_str(&format!("     Duration: {} ms\n", unit.duration_ms));
            }
            (format!("{sanitized_name}-{timestamp}.txt"), content)
        }
    };

    let file_path = report_dir.join(filename);
    let mut file = File::create(&file_path)?;
    file.write_all(content.as_bytes())?;

    Ok(file_path)
}

async fn run(args: RunArgs, verbose: bool) -> Result<bool> {
    let mut suite = load_suite(&args.suite)?;
    if args.stop_on_failure {
        suite.config.stop_on_failure = true;
    }

    let cache = build_cache(&suite, &args)?;
    let runner = DefaultSuiteRunner::new(cache);
    let report = runner.run(&suite).await?;
    print_report(&report, verbose);

    if let Some(dir) = &args.report_dir {
        match save_report(&report, dir, args.report_format) {
            Ok(path) => info!("Report saved: {}", path.display()),
            Err(e) => error!("Failed to save report: {}", e),
        }
    }

    Ok(report.success)
}

fn plan(args: PlanArgs) -> Result<()> {
    let suite = load_suite(&args.suite)?;
    let runner = DefaultSuiteRunner::new(Arc::new(CacheStore::new()));
    let plan = runner.plan(&suite);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    for warning in &plan.warnings {
        warn!("{warning}");
    }
    info!("Execution order for '{}':", suite.name);
    for (i, id) in plan.schedule.order.iter().enumerate() {
        let sources = plan.graph.sources_of(id);
        if sources.is_empty() {
            info!("  {}. {}", i + 1, id);
        } else {
            info!("  {}. {} (after {})", i + 1, id, sources.join(", "));
        }
    }
    for (i, wave) in plan.batches.iter().enumerate() {
        info!("  wave {}: {}", i + 1, wave.join(", "));
    }
    if !plan.schedule.is_complete() {
        warn!(
            "Unresolved ordering (cycle): {}",
            plan.schedule.unresolved.join(", ")
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose);

    match cli.command {
        Command::Run(args) => {
            if !run(args, cli.verbose).await? {
                exit(1);
            }
        }
        Command::Plan(args) => plan(args)?,
    }

    Ok(())
}
