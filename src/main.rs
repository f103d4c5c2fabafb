use std::error::Error;
use std::fs;
use std::path::PathBuf;

use clap::Parser;
use log::{error, info, warn};

use serp_harvester_lib::input_loader::{self, GithubSource};
use serp_harvester_lib::{export, logger};
use serp_harvester_lib::{AppConfig, ExtractionMode, Pipeline, Progress, Query};

#[derive(Parser, Debug)]
#[command(
    name = "serp-harvester",
    about = "Run a batch of search queries through SerpApi and export links, featured snippets or \"People also ask\" blocks"
)]
struct Cli {
    /// A query to run (repeatable)
    #[arg(short = 'q', long = "query")]
    queries: Vec<String>,

    /// Local query list (.txt, .csv or .xlsx)
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// GitHub repository holding the query list, as owner/repo
    #[arg(long)]
    github_repo: Option<String>,

    /// Path of the query list inside the GitHub repository
    #[arg(long, default_value = "queries.csv")]
    github_path: String,

    /// Branch, tag or commit to read the GitHub query list from
    #[arg(long)]
    github_ref: Option<String>,

    /// Column holding the queries in CSV / XLSX sources
    #[arg(long)]
    column: Option<String>,

    #[arg(short, long, value_enum, default_value_t = ExtractionMode::Links)]
    mode: ExtractionMode,

    /// Interface language (hl)
    #[arg(long)]
    language: Option<String>,

    /// Country code (gl)
    #[arg(long)]
    country: Option<String>,

    /// Location name, e.g. "France"
    #[arg(long)]
    location: Option<String>,

    #[arg(long)]
    google_domain: Option<String>,

    /// Results requested per query (1-100)
    #[arg(long)]
    num: Option<u8>,

    /// Concurrent lookups (1-16)
    #[arg(short, long)]
    workers: Option<usize>,

    #[arg(long, env = "SERPAPI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// CSV output path (defaults to a timestamped file when no output is given)
    #[arg(long)]
    csv: Option<PathBuf>,

    /// XLSX output path
    #[arg(long)]
    xlsx: Option<PathBuf>,
}

fn collect_queries(cli: &Cli, config: &AppConfig) -> Result<Vec<Query>, Box<dyn Error>> {
    let mut queries = input_loader::queries_from_list(&cli.queries);
    let column = cli.column.as_deref();

    if let Some(path) = &cli.input {
        queries.extend(input_loader::load_queries(path, column)?);
    }
    if let Some(repo) = &cli.github_repo {
        let source = GithubSource::new(config.github_token.as_deref(), cli.github_ref.as_deref())?;
        queries.extend(input_loader::fetch_queries(&source, repo, &cli.github_path, column)?);
    }
    Ok(queries)
}

fn main() -> Result<(), Box<dyn Error>> {
    logger::init();
    let cli = Cli::parse();
    info!("Starting SERP harvester ({} mode)...", cli.mode);

    let mut config = AppConfig::from_env();
    if cli.api_key.is_some() {
        config.api_key = cli.api_key.clone();
    }

    // Credential first: nothing is fetched or sent without it.
    let pipeline = match Pipeline::from_config(&config) {
        Ok(p) => p,
        Err(e) => {
            error!("Cannot start: {}", e);
            return Err(e.into());
        }
    };

    let mut locale = config.default_locale.clone();
    if let Some(language) = &cli.language {
        locale.language = language.clone();
    }
    if let Some(country) = &cli.country {
        locale.country = country.clone();
    }
    if let Some(location) = &cli.location {
        locale.location = Some(location.clone());
    }
    if let Some(domain) = &cli.google_domain {
        locale.google_domain = Some(domain.clone());
    }
    if let Some(num) = cli.num {
        locale.num = num;
    }
    if let Some(workers) = cli.workers {
        locale.workers = workers;
    }

    let queries = collect_queries(&cli, &config)?;
    if queries.is_empty() {
        error!("No queries given. Use --query, --input or --github-repo.");
        return Ok(());
    }

    let report = |p: Progress| {
        info!("Progress {} / {} ({:.0}%)", p.completed, p.total, p.fraction() * 100.0);
    };
    let outcome = pipeline.run(&queries, &locale, cli.mode, &report)?;
    let batch = outcome.result;

    for failure in batch.failures() {
        warn!("'{}' failed: {:?}", failure.query, failure.status);
    }
    if batch.is_empty() {
        info!("No results found for these queries.");
        return Ok(());
    }
    for query in batch.empty_queries() {
        info!("No data for '{}'", query);
    }
    info!(
        "{} rows, {} with data, {} failed queries.",
        batch.rows.len(),
        batch.data_rows(),
        batch.failed_count()
    );

    let csv_path = match (&cli.csv, &cli.xlsx) {
        (None, None) => Some(PathBuf::from(export::file_name(cli.mode, "csv"))),
        (csv, _) => csv.clone(),
    };
    if let Some(path) = csv_path {
        fs::write(&path, export::to_csv(batch.mode, &batch.rows)?)?;
        info!("Wrote {:?}", path);
    }
    if let Some(path) = &cli.xlsx {
        fs::write(path, export::to_spreadsheet(batch.mode, &batch.rows)?)?;
        info!("Wrote {:?}", path);
    }

    Ok(())
}
