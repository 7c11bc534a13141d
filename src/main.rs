use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use acptest::api::run_http_server;
use acptest::core::{
    CancelToken, DEFAULT_RISK_MARGIN, ENGINE_VERSION, GridResult, HceMode, ScenarioConfig,
    ScenarioInput, ScenarioResult, generate_seed, run_grid, run_scenario,
};
use acptest::export::{render_csv, render_pdf};
use acptest::import::parse_census_csv;
use acptest::store::{RunKind, Store};

#[derive(Parser, Debug)]
#[command(name = "acptest")]
#[command(about = "ACP nondiscrimination test engine for after-tax 401(k) adoption modeling")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the HTTP API and landing page
    Serve {
        /// SQLite database path, created on first use
        #[arg(long, default_value = "acptest.db")]
        db: PathBuf,

        #[arg(long, default_value_t = 8080)]
        port: u16,
    },

    /// Import a census CSV into a workspace
    Import {
        #[arg(long, default_value = "acptest.db")]
        db: PathBuf,

        /// Workspace name; created if it does not exist yet
        #[arg(long)]
        workspace: String,

        /// Census name, e.g. "2024 year-end census"
        #[arg(long)]
        name: String,

        #[arg(long)]
        plan_year: i32,

        /// Path to the census CSV file
        #[arg(long)]
        file: PathBuf,
    },

    /// Run a single adoption scenario against a stored census
    Analyze {
        #[arg(long, default_value = "acptest.db")]
        db: PathBuf,

        /// Census id from a previous import
        #[arg(long)]
        census: i64,

        /// Share of after-tax-eligible HCEs who adopt, in percent
        #[arg(long)]
        adoption_rate: f64,

        /// After-tax contribution rate the adopters elect, in percent
        #[arg(long)]
        contribution_rate: f64,

        /// Sampling seed; omitted means the engine picks one and reports it
        #[arg(long)]
        seed: Option<u64>,

        /// How participants are classified as highly compensated
        #[arg(long, value_enum, default_value_t = CliHceMode::Explicit)]
        hce_mode: CliHceMode,

        /// Margin in percentage points under the limit that still flags RISK; 0 disables
        #[arg(long, default_value_t = DEFAULT_RISK_MARGIN)]
        risk_margin: f64,
    },

    /// Sweep an adoption-by-contribution grid against a stored census
    Grid {
        #[arg(long, default_value = "acptest.db")]
        db: PathBuf,

        #[arg(long)]
        census: i64,

        /// Comma-separated adoption rates in percent, e.g. 0,25,50,75,100
        #[arg(long, value_delimiter = ',')]
        adoption_rates: Vec<f64>,

        /// Comma-separated contribution rates in percent, e.g. 4,6,8,10
        #[arg(long, value_delimiter = ',')]
        contribution_rates: Vec<f64>,

        #[arg(long)]
        seed: Option<u64>,

        #[arg(long, value_enum, default_value_t = CliHceMode::Explicit)]
        hce_mode: CliHceMode,

        #[arg(long, default_value_t = DEFAULT_RISK_MARGIN)]
        risk_margin: f64,
    },

    /// Export a stored run as an audit CSV or a PDF report
    Export {
        #[arg(long, default_value = "acptest.db")]
        db: PathBuf,

        /// Run id to export
        #[arg(long)]
        run: i64,

        #[arg(long, value_enum)]
        format: ExportFormat,

        /// Output file path
        #[arg(long)]
        out: PathBuf,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CliHceMode {
    Explicit,
    CompensationThreshold,
}

impl From<CliHceMode> for HceMode {
    fn from(value: CliHceMode) -> Self {
        match value {
            CliHceMode::Explicit => HceMode::Explicit,
            CliHceMode::CompensationThreshold => HceMode::CompensationThreshold,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum ExportFormat {
    Csv,
    Pdf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("acptest=info,warn")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(message) = run(cli).await {
        eprintln!("Error: {message}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), String> {
    match cli.command {
        Commands::Serve { db, port } => run_http_server(&db, port)
            .await
            .map_err(|e| format!("Server error: {e}")),
        Commands::Import {
            db,
            workspace,
            name,
            plan_year,
            file,
        } => cmd_import(&db, &workspace, &name, plan_year, &file),
        Commands::Analyze {
            db,
            census,
            adoption_rate,
            contribution_rate,
            seed,
            hce_mode,
            risk_margin,
        } => cmd_analyze(
            &db,
            census,
            adoption_rate,
            contribution_rate,
            seed,
            hce_mode.into(),
            risk_margin,
        ),
        Commands::Grid {
            db,
            census,
            adoption_rates,
            contribution_rates,
            seed,
            hce_mode,
            risk_margin,
        } => cmd_grid(
            &db,
            census,
            &adoption_rates,
            &contribution_rates,
            seed,
            hce_mode.into(),
            risk_margin,
        ),
        Commands::Export {
            db,
            run,
            format,
            out,
        } => cmd_export(&db, run, format, &out),
    }
}

fn cmd_import(
    db: &Path,
    workspace: &str,
    name: &str,
    plan_year: i32,
    file: &Path,
) -> Result<(), String> {
    if !(1900..=2200).contains(&plan_year) {
        return Err("--plan-year must be between 1900 and 2200".to_string());
    }
    let text = std::fs::read_to_string(file)
        .map_err(|e| format!("Cannot read {}: {e}", file.display()))?;
    let (participants, report) = parse_census_csv(&text).map_err(|e| e.to_string())?;

    let mut store = open_store(db)?;
    let workspace_id = find_or_create_workspace(&store, workspace)?;
    let census_id = store
        .create_census(workspace_id, name, plan_year, &participants)
        .map_err(|e| e.to_string())?;
    tracing::info!(census_id, rows = report.row_count, "census imported");

    println!(
        "Imported census {census_id} ({name}, plan year {plan_year}) into workspace {workspace_id}: {} participants.",
        report.row_count
    );
    for column in &report.mapped_columns {
        println!("  {} <- {}", column.field, column.header);
    }
    if !report.unmapped_headers.is_empty() {
        println!("  ignored: {}", report.unmapped_headers.join(", "));
    }
    Ok(())
}

fn cmd_analyze(
    db: &Path,
    census_id: i64,
    adoption_rate: f64,
    contribution_rate: f64,
    seed: Option<u64>,
    hce_mode: HceMode,
    risk_margin: f64,
) -> Result<(), String> {
    if !adoption_rate.is_finite() || !(0.0..=100.0).contains(&adoption_rate) {
        return Err("--adoption-rate must be between 0 and 100".to_string());
    }
    if !contribution_rate.is_finite() || !(0.0..=15.0).contains(&contribution_rate) {
        return Err("--contribution-rate must be between 0 and 15".to_string());
    }
    let seed = resolve_seed(seed)?;
    let config = build_config(hce_mode, risk_margin)?;

    let mut store = open_store(db)?;
    let census = store.load_census(census_id).map_err(|e| e.to_string())?;

    let params = serde_json::json!({
        "adoptionRate": adoption_rate,
        "contributionRate": contribution_rate,
        "seed": seed,
        "hceMode": config.hce_mode.as_str(),
        "riskMargin": config.risk_margin,
    })
    .to_string();
    let run_id = store
        .create_run(census_id, RunKind::Scenario, &params, seed, ENGINE_VERSION)
        .map_err(|e| e.to_string())?;
    store.mark_run_running(run_id).map_err(|e| e.to_string())?;

    let input = ScenarioInput {
        adoption_rate,
        contribution_rate,
        seed,
    };
    let result = run_scenario(&census, input, &config);
    store
        .complete_run(run_id, std::slice::from_ref(&result))
        .map_err(|e| e.to_string())?;
    tracing::info!(run_id, status = result.status.as_str(), "scenario run completed");

    print_scenario(run_id, &result);
    Ok(())
}

fn cmd_grid(
    db: &Path,
    census_id: i64,
    adoption_rates: &[f64],
    contribution_rates: &[f64],
    seed: Option<u64>,
    hce_mode: HceMode,
    risk_margin: f64,
) -> Result<(), String> {
    validate_rate_list("--adoption-rates", adoption_rates, 100.0)?;
    validate_rate_list("--contribution-rates", contribution_rates, 15.0)?;
    let seed = resolve_seed(seed)?;
    let config = build_config(hce_mode, risk_margin)?;

    let mut store = open_store(db)?;
    let census = store.load_census(census_id).map_err(|e| e.to_string())?;

    let params = serde_json::json!({
        "adoptionRates": adoption_rates,
        "contributionRates": contribution_rates,
        "seed": seed,
        "hceMode": config.hce_mode.as_str(),
        "riskMargin": config.risk_margin,
    })
    .to_string();
    let run_id = store
        .create_run(census_id, RunKind::Grid, &params, seed, ENGINE_VERSION)
        .map_err(|e| e.to_string())?;
    store.mark_run_running(run_id).map_err(|e| e.to_string())?;

    let cancel = CancelToken::new();
    let grid = match run_grid(
        &census,
        adoption_rates,
        contribution_rates,
        seed,
        &config,
        &cancel,
    ) {
        Ok(grid) => grid,
        Err(error) => {
            let message = error.to_string();
            if let Err(error) = store.fail_run(run_id, &message) {
                tracing::warn!(%error, run_id, "failed to mark failed run");
            }
            return Err(message);
        }
    };
    store
        .complete_run(run_id, &grid.cells)
        .map_err(|e| e.to_string())?;
    tracing::info!(run_id, cells = grid.cells.len(), "grid run completed");

    print_grid(run_id, &grid);
    Ok(())
}

fn cmd_export(db: &Path, run_id: i64, format: ExportFormat, out: &Path) -> Result<(), String> {
    let store = open_store(db)?;
    let run = store.run(run_id).map_err(|e| e.to_string())?;
    let census = store.census(run.census_id).map_err(|e| e.to_string())?;
    let results = store.results_for_run(run_id).map_err(|e| e.to_string())?;

    let bytes = match format {
        ExportFormat::Csv => render_csv(&run, &results).map_err(|e| e.to_string())?,
        ExportFormat::Pdf => render_pdf(&run, &census, &results).map_err(|e| e.to_string())?,
    };
    std::fs::write(out, &bytes).map_err(|e| format!("Cannot write {}: {e}", out.display()))?;
    println!("Wrote {} ({} bytes).", out.display(), bytes.len());
    Ok(())
}

fn open_store(db: &Path) -> Result<Store, String> {
    let store = Store::open(db).map_err(|e| e.to_string())?;
    store.migrate().map_err(|e| e.to_string())?;
    Ok(store)
}

fn find_or_create_workspace(store: &Store, name: &str) -> Result<i64, String> {
    let existing = store.list_workspaces().map_err(|e| e.to_string())?;
    if let Some(workspace) = existing.into_iter().find(|w| w.name == name) {
        return Ok(workspace.workspace_id);
    }
    store.create_workspace(name).map_err(|e| e.to_string())
}

fn resolve_seed(seed: Option<u64>) -> Result<u64, String> {
    match seed {
        Some(0) => Err("--seed must be >= 1".to_string()),
        Some(seed) => Ok(seed),
        None => Ok(generate_seed()),
    }
}

fn build_config(hce_mode: HceMode, risk_margin: f64) -> Result<ScenarioConfig, String> {
    if !risk_margin.is_finite() || !(0.0..=5.0).contains(&risk_margin) {
        return Err("--risk-margin must be between 0 and 5".to_string());
    }
    Ok(ScenarioConfig {
        hce_mode,
        risk_margin,
    })
}

fn validate_rate_list(flag: &str, values: &[f64], max: f64) -> Result<(), String> {
    if !(2..=20).contains(&values.len()) {
        return Err(format!("{flag} must list between 2 and 20 values"));
    }
    for &value in values {
        if !value.is_finite() || !(0.0..=max).contains(&value) {
            return Err(format!("{flag} values must be between 0 and {max}"));
        }
    }
    Ok(())
}

fn print_scenario(run_id: i64, result: &ScenarioResult) {
    println!(
        "Run {run_id}: {} at {:.3}% adoption / {:.3}% contribution (seed {})",
        result.status.as_str(),
        result.adoption_rate,
        result.contribution_rate,
        result.seed
    );
    match (&result.metrics, &result.error) {
        (Some(metrics), _) => println!(
            "  NHCE ACP {:.3}%  HCE ACP {:.3}%  limit {:.3}% ({})  margin {:.3} pp",
            metrics.nhce_acp,
            metrics.hce_acp,
            metrics.effective_limit,
            metrics.binding_rule.as_str(),
            metrics.margin
        ),
        (None, Some(error)) => println!("  {error}"),
        (None, None) => {}
    }
}

fn print_grid(run_id: i64, grid: &GridResult) {
    let summary = &grid.summary;
    println!(
        "Run {run_id}: {} cells ({} pass, {} risk, {} fail, {} error), seed {}",
        grid.cells.len(),
        summary.pass_count,
        summary.risk_count,
        summary.fail_count,
        summary.error_count,
        grid.seed
    );
    println!(
        "{:>8} {:>8} {:>8} {:>8} {:>9} {:>8}  {:<6} {:<5}",
        "adopt%", "contrib%", "nhce", "hce", "threshold", "margin", "result", "limit"
    );
    for cell in &grid.cells {
        println!("{}", grid_line(cell));
    }
    if let Some(point) = &summary.first_failure_point {
        println!(
            "First failure at {:.3}% adoption / {:.3}% contribution",
            point.adoption_rate, point.contribution_rate
        );
    }
    if let Some(worst) = summary.worst_margin {
        println!("Worst margin: {worst:.3} pp");
    }
    match summary.max_safe_contribution {
        Some(rate) => println!("Max safe contribution rate: {rate:.3}%"),
        None => println!("No contribution rate is safe across all tested adoption rates."),
    }
}

fn grid_line(cell: &ScenarioResult) -> String {
    let mut line = format!(
        "{:>8.3} {:>8.3} {:>8} {:>8} {:>9} {:>8}  {:<6} {:<5}",
        cell.adoption_rate,
        cell.contribution_rate,
        opt3(cell.metrics.as_ref().map(|m| m.nhce_acp)),
        opt3(cell.metrics.as_ref().map(|m| m.hce_acp)),
        opt3(cell.metrics.as_ref().map(|m| m.effective_limit)),
        opt3(cell.metrics.as_ref().map(|m| m.margin)),
        cell.status.as_str(),
        cell.metrics
            .as_ref()
            .map(|m| m.binding_rule.as_str())
            .unwrap_or("-"),
    );
    if let Some(error) = &cell.error {
        line.push_str("  ");
        line.push_str(error);
    }
    line
}

fn opt3(value: Option<f64>) -> String {
    match value {
        Some(value) => format!("{value:.3}"),
        None => "-".to_string(),
    }
}
