use axum::{
    Router,
    extract::{Json, Path, State},
    http::{StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::net::TcpListener;
use tokio::task;

use crate::core::{
    CancelToken, CoreError, ENGINE_VERSION, GridResult, GridSummary, HceMode, ScenarioConfig,
    ScenarioInput, ScenarioResult, generate_seed, run_grid, run_scenario, summarize_results,
};
use crate::export::{render_csv, render_pdf};
use crate::import::{ImportReport, parse_census_csv};
use crate::store::{CensusRow, RunKind, RunRow, Store, StoreError, WorkspaceRow};

const INDEX_HTML: &str = include_str!("../../web/index.html");

#[derive(Clone)]
struct AppState {
    store: Arc<Mutex<Store>>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ApiHceMode {
    Explicit,
    #[serde(
        alias = "compensationThreshold",
        alias = "compensation_threshold",
        alias = "threshold"
    )]
    CompensationThreshold,
}

impl From<ApiHceMode> for HceMode {
    fn from(value: ApiHceMode) -> Self {
        match value {
            ApiHceMode::Explicit => HceMode::Explicit,
            ApiHceMode::CompensationThreshold => HceMode::CompensationThreshold,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct WorkspacePayload {
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct CensusPayload {
    workspace_id: Option<i64>,
    name: Option<String>,
    plan_year: Option<i32>,
    csv: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct AnalyzePayload {
    census_id: Option<i64>,
    adoption_rate: Option<f64>,
    contribution_rate: Option<f64>,
    seed: Option<u64>,
    hce_mode: Option<ApiHceMode>,
    risk_margin: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct GridPayload {
    census_id: Option<i64>,
    adoption_rates: Option<Vec<f64>>,
    contribution_rates: Option<Vec<f64>>,
    seed: Option<u64>,
    hce_mode: Option<ApiHceMode>,
    risk_margin: Option<f64>,
}

#[derive(Debug)]
struct CensusRequest {
    workspace_id: i64,
    name: String,
    plan_year: i32,
    csv: String,
}

#[derive(Debug)]
struct AnalyzeRequest {
    census_id: i64,
    input: ScenarioInput,
    config: ScenarioConfig,
}

#[derive(Debug)]
struct GridRequest {
    census_id: i64,
    adoption_rates: Vec<f64>,
    contribution_rates: Vec<f64>,
    seed: u64,
    config: ScenarioConfig,
}

/// Request parameters persisted on the run row for auditability.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ScenarioRunParams {
    adoption_rate: f64,
    contribution_rate: f64,
    seed: u64,
    hce_mode: &'static str,
    risk_margin: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GridRunParams {
    adoption_rates: Vec<f64>,
    contribution_rates: Vec<f64>,
    seed: u64,
    hce_mode: &'static str,
    risk_margin: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WorkspaceCreatedResponse {
    workspace_id: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WorkspaceListResponse {
    workspaces: Vec<WorkspaceRow>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CensusCreatedResponse {
    census_id: i64,
    #[serde(flatten)]
    report: ImportReport,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CensusListResponse {
    censuses: Vec<CensusRow>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunListResponse {
    runs: Vec<RunRow>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeResponse {
    run_id: i64,
    census_id: i64,
    engine_version: &'static str,
    result: ScenarioResult,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GridResponse {
    run_id: i64,
    census_id: i64,
    grid: GridResult,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunDetailResponse {
    run: RunRow,
    results: Vec<ScenarioResult>,
    summary: GridSummary,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn build_workspace_name(payload: WorkspacePayload) -> Result<String, String> {
    let name = payload.name.unwrap_or_default();
    let name = name.trim();
    if name.is_empty() {
        return Err("name is required".to_string());
    }
    Ok(name.to_string())
}

fn build_census_request(payload: CensusPayload) -> Result<CensusRequest, String> {
    let workspace_id = payload
        .workspace_id
        .ok_or_else(|| "workspaceId is required".to_string())?;

    let name = payload.name.unwrap_or_default();
    let name = name.trim();
    if name.is_empty() {
        return Err("name is required".to_string());
    }

    let plan_year = payload
        .plan_year
        .ok_or_else(|| "planYear is required".to_string())?;
    if !(1900..=2200).contains(&plan_year) {
        return Err("planYear must be between 1900 and 2200".to_string());
    }

    let csv = payload.csv.unwrap_or_default();
    if csv.trim().is_empty() {
        return Err("csv is required".to_string());
    }

    Ok(CensusRequest {
        workspace_id,
        name: name.to_string(),
        plan_year,
        csv,
    })
}

fn build_analyze_request(payload: AnalyzePayload) -> Result<AnalyzeRequest, String> {
    let census_id = payload
        .census_id
        .ok_or_else(|| "censusId is required".to_string())?;
    let adoption_rate = payload
        .adoption_rate
        .ok_or_else(|| "adoptionRate is required".to_string())?;
    let contribution_rate = payload
        .contribution_rate
        .ok_or_else(|| "contributionRate is required".to_string())?;

    validate_adoption_rate(adoption_rate)?;
    validate_contribution_rate(contribution_rate)?;
    let seed = resolve_seed(payload.seed)?;
    let config = build_config(payload.hce_mode, payload.risk_margin)?;

    Ok(AnalyzeRequest {
        census_id,
        input: ScenarioInput {
            adoption_rate,
            contribution_rate,
            seed,
        },
        config,
    })
}

fn build_grid_request(payload: GridPayload) -> Result<GridRequest, String> {
    let census_id = payload
        .census_id
        .ok_or_else(|| "censusId is required".to_string())?;
    let adoption_rates = payload
        .adoption_rates
        .ok_or_else(|| "adoptionRates is required".to_string())?;
    let contribution_rates = payload
        .contribution_rates
        .ok_or_else(|| "contributionRates is required".to_string())?;

    validate_rate_list("adoptionRates", &adoption_rates, 100.0)?;
    validate_rate_list("contributionRates", &contribution_rates, 15.0)?;
    let seed = resolve_seed(payload.seed)?;
    let config = build_config(payload.hce_mode, payload.risk_margin)?;

    Ok(GridRequest {
        census_id,
        adoption_rates,
        contribution_rates,
        seed,
        config,
    })
}

fn validate_adoption_rate(rate: f64) -> Result<(), String> {
    if !rate.is_finite() || !(0.0..=100.0).contains(&rate) {
        return Err("adoptionRate must be between 0 and 100".to_string());
    }
    Ok(())
}

fn validate_contribution_rate(rate: f64) -> Result<(), String> {
    if !rate.is_finite() || !(0.0..=15.0).contains(&rate) {
        return Err("contributionRate must be between 0 and 15".to_string());
    }
    Ok(())
}

fn validate_rate_list(field: &str, values: &[f64], max: f64) -> Result<(), String> {
    if !(2..=20).contains(&values.len()) {
        return Err(format!("{field} must list between 2 and 20 values"));
    }
    for &value in values {
        if !value.is_finite() || !(0.0..=max).contains(&value) {
            return Err(format!("{field} values must be between 0 and {max}"));
        }
    }
    Ok(())
}

/// A request without a seed gets a generated one; the seed is always echoed
/// back so the run can be replayed.
fn resolve_seed(seed: Option<u64>) -> Result<u64, String> {
    match seed {
        Some(0) => Err("seed must be >= 1".to_string()),
        Some(seed) => Ok(seed),
        None => Ok(generate_seed()),
    }
}

fn build_config(
    hce_mode: Option<ApiHceMode>,
    risk_margin: Option<f64>,
) -> Result<ScenarioConfig, String> {
    let mut config = ScenarioConfig::default();
    if let Some(mode) = hce_mode {
        config.hce_mode = mode.into();
    }
    if let Some(margin) = risk_margin {
        if !margin.is_finite() || !(0.0..=5.0).contains(&margin) {
            return Err("riskMargin must be between 0 and 5".to_string());
        }
        config.risk_margin = margin;
    }
    Ok(config)
}

pub async fn run_http_server(db_path: &std::path::Path, port: u16) -> std::io::Result<()> {
    let store = Store::open(db_path).map_err(store_io_error)?;
    store.migrate().map_err(store_io_error)?;
    let state = AppState {
        store: Arc::new(Mutex::new(store)),
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = Router::new()
        .route("/", get(index_handler))
        .route("/index.html", get(index_handler))
        .route(
            "/api/workspaces",
            get(list_workspaces_handler).post(create_workspace_handler),
        )
        .route("/api/workspaces/:id/censuses", get(workspace_censuses_handler))
        .route("/api/censuses", post(create_census_handler))
        .route("/api/censuses/:id", get(census_handler))
        .route("/api/censuses/:id/runs", get(census_runs_handler))
        .route("/api/analyze", post(analyze_handler))
        .route("/api/grid", post(grid_handler))
        .route("/api/runs/:id", get(run_handler))
        .route("/api/runs/:id/export.csv", get(export_csv_handler))
        .route("/api/runs/:id/export.pdf", get(export_pdf_handler))
        .fallback(not_found_handler)
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;
    println!("ACP test API listening on http://{addr}");
    println!("Local access: http://127.0.0.1:{port}/");

    axum::serve(listener, app).await
}

fn store_io_error(error: StoreError) -> std::io::Error {
    std::io::Error::other(error.to_string())
}

async fn index_handler() -> impl IntoResponse {
    with_cache_control(Html(INDEX_HTML))
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn create_workspace_handler(
    State(state): State<AppState>,
    Json(payload): Json<WorkspacePayload>,
) -> Response {
    let name = match build_workspace_name(payload) {
        Ok(name) => name,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };
    match lock(&state.store).create_workspace(&name) {
        Ok(workspace_id) => {
            tracing::info!(workspace_id, "workspace created");
            json_response(StatusCode::CREATED, WorkspaceCreatedResponse { workspace_id })
        }
        Err(error) => store_error_response(error),
    }
}

async fn list_workspaces_handler(State(state): State<AppState>) -> Response {
    match lock(&state.store).list_workspaces() {
        Ok(workspaces) => json_response(StatusCode::OK, WorkspaceListResponse { workspaces }),
        Err(error) => store_error_response(error),
    }
}

async fn workspace_censuses_handler(
    State(state): State<AppState>,
    Path(workspace_id): Path<i64>,
) -> Response {
    let store = lock(&state.store);
    if let Err(error) = store.workspace(workspace_id) {
        return store_error_response(error);
    }
    match store.censuses_for_workspace(workspace_id) {
        Ok(censuses) => json_response(StatusCode::OK, CensusListResponse { censuses }),
        Err(error) => store_error_response(error),
    }
}

async fn create_census_handler(
    State(state): State<AppState>,
    Json(payload): Json<CensusPayload>,
) -> Response {
    let request = match build_census_request(payload) {
        Ok(request) => request,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };
    let (participants, report) = match parse_census_csv(&request.csv) {
        Ok(parsed) => parsed,
        Err(error) => return error_response(StatusCode::BAD_REQUEST, &error.to_string()),
    };

    let mut store = lock(&state.store);
    if let Err(error) = store.workspace(request.workspace_id) {
        return store_error_response(error);
    }
    match store.create_census(
        request.workspace_id,
        &request.name,
        request.plan_year,
        &participants,
    ) {
        Ok(census_id) => {
            tracing::info!(census_id, rows = report.row_count, "census imported");
            json_response(
                StatusCode::CREATED,
                CensusCreatedResponse { census_id, report },
            )
        }
        Err(error) => store_error_response(error),
    }
}

async fn census_handler(State(state): State<AppState>, Path(census_id): Path<i64>) -> Response {
    match lock(&state.store).census(census_id) {
        Ok(row) => json_response(StatusCode::OK, row),
        Err(error) => store_error_response(error),
    }
}

async fn census_runs_handler(
    State(state): State<AppState>,
    Path(census_id): Path<i64>,
) -> Response {
    let store = lock(&state.store);
    if let Err(error) = store.census(census_id) {
        return store_error_response(error);
    }
    match store.runs_for_census(census_id) {
        Ok(runs) => json_response(StatusCode::OK, RunListResponse { runs }),
        Err(error) => store_error_response(error),
    }
}

async fn analyze_handler(
    State(state): State<AppState>,
    Json(payload): Json<AnalyzePayload>,
) -> Response {
    let request = match build_analyze_request(payload) {
        Ok(request) => request,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };
    let census = match lock(&state.store).load_census(request.census_id) {
        Ok(census) => census,
        Err(error) => return store_error_response(error),
    };

    let params = ScenarioRunParams {
        adoption_rate: request.input.adoption_rate,
        contribution_rate: request.input.contribution_rate,
        seed: request.input.seed,
        hce_mode: request.config.hce_mode.as_str(),
        risk_margin: request.config.risk_margin,
    };
    let params_json = serde_json::to_string(&params).expect("validated params serialize");

    let run_id = match lock(&state.store).create_run(
        request.census_id,
        RunKind::Scenario,
        &params_json,
        request.input.seed,
        ENGINE_VERSION,
    ) {
        Ok(run_id) => run_id,
        Err(error) => return store_error_response(error),
    };
    if let Err(error) = lock(&state.store).mark_run_running(run_id) {
        return store_error_response(error);
    }

    let result = run_scenario(&census, request.input, &request.config);
    if let Err(error) = lock(&state.store).complete_run(run_id, std::slice::from_ref(&result)) {
        return store_error_response(error);
    }
    tracing::info!(run_id, status = result.status.as_str(), "scenario run completed");

    json_response(
        StatusCode::OK,
        AnalyzeResponse {
            run_id,
            census_id: request.census_id,
            engine_version: ENGINE_VERSION,
            result,
        },
    )
}

enum GridRunError {
    Cancelled,
    Store(StoreError),
    Failed(String),
}

/// Cancels the grid's token unless the handler finished and disarmed it, so
/// a dropped request future (client disconnect) stops the run between cells.
struct CancelOnDrop {
    token: CancelToken,
    armed: bool,
}

impl CancelOnDrop {
    fn new(token: CancelToken) -> Self {
        CancelOnDrop { token, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.token.cancel();
        }
    }
}

async fn grid_handler(State(state): State<AppState>, Json(payload): Json<GridPayload>) -> Response {
    let request = match build_grid_request(payload) {
        Ok(request) => request,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };
    let census_id = request.census_id;
    let census = match lock(&state.store).load_census(census_id) {
        Ok(census) => census,
        Err(error) => return store_error_response(error),
    };

    let params = GridRunParams {
        adoption_rates: request.adoption_rates.clone(),
        contribution_rates: request.contribution_rates.clone(),
        seed: request.seed,
        hce_mode: request.config.hce_mode.as_str(),
        risk_margin: request.config.risk_margin,
    };
    let params_json = serde_json::to_string(&params).expect("validated params serialize");

    let run_id = match lock(&state.store).create_run(
        census_id,
        RunKind::Grid,
        &params_json,
        request.seed,
        ENGINE_VERSION,
    ) {
        Ok(run_id) => run_id,
        Err(error) => return store_error_response(error),
    };
    if let Err(error) = lock(&state.store).mark_run_running(run_id) {
        return store_error_response(error);
    }
    tracing::info!(run_id, census_id, "grid run started");

    let cancel = CancelToken::new();
    let guard = CancelOnDrop::new(cancel.clone());
    let store = Arc::clone(&state.store);

    // The blocking task owns its own store handle; it records the run's
    // final state even when the request future has already been dropped.
    let join = task::spawn_blocking(move || {
        let outcome = run_grid(
            &census,
            &request.adoption_rates,
            &request.contribution_rates,
            request.seed,
            &request.config,
            &cancel,
        );
        let mut store = lock(&store);
        match outcome {
            Ok(grid) => match store.complete_run(run_id, &grid.cells) {
                Ok(()) => Ok(grid),
                Err(error) => Err(GridRunError::Store(error)),
            },
            Err(CoreError::Cancelled) => {
                if let Err(error) = store.fail_run(run_id, "cancelled by caller") {
                    tracing::warn!(%error, run_id, "failed to mark cancelled run");
                }
                tracing::info!(run_id, "grid run cancelled");
                Err(GridRunError::Cancelled)
            }
            Err(other) => {
                let message = other.to_string();
                if let Err(error) = store.fail_run(run_id, &message) {
                    tracing::warn!(%error, run_id, "failed to mark failed run");
                }
                Err(GridRunError::Failed(message))
            }
        }
    });

    let outcome = join.await;
    guard.disarm();

    match outcome {
        Ok(Ok(grid)) => {
            tracing::info!(run_id, cells = grid.cells.len(), "grid run completed");
            json_response(
                StatusCode::OK,
                GridResponse {
                    run_id,
                    census_id,
                    grid,
                },
            )
        }
        Ok(Err(GridRunError::Cancelled)) => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "analysis cancelled")
        }
        Ok(Err(GridRunError::Store(error))) => store_error_response(error),
        Ok(Err(GridRunError::Failed(message))) => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &message)
        }
        Err(join_error) => {
            tracing::error!(%join_error, run_id, "grid task failed");
            if let Err(error) = lock(&state.store).fail_run(run_id, "grid task failed") {
                tracing::warn!(%error, run_id, "failed to mark failed run");
            }
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "grid task failed")
        }
    }
}

async fn run_handler(State(state): State<AppState>, Path(run_id): Path<i64>) -> Response {
    let store = lock(&state.store);
    let run = match store.run(run_id) {
        Ok(run) => run,
        Err(error) => return store_error_response(error),
    };
    let results = match store.results_for_run(run_id) {
        Ok(results) => results,
        Err(error) => return store_error_response(error),
    };
    drop(store);

    let summary = summarize_results(&results);
    json_response(
        StatusCode::OK,
        RunDetailResponse {
            run,
            results,
            summary,
        },
    )
}

async fn export_csv_handler(State(state): State<AppState>, Path(run_id): Path<i64>) -> Response {
    let (run, _census, results) = match load_run_bundle(&state, run_id) {
        Ok(bundle) => bundle,
        Err(error) => return store_error_response(error),
    };
    match render_csv(&run, &results) {
        Ok(bytes) => download_response(bytes, "text/csv; charset=utf-8", &format!("run-{run_id}.csv")),
        Err(error) => {
            tracing::error!(%error, run_id, "csv export failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "export failed")
        }
    }
}

async fn export_pdf_handler(State(state): State<AppState>, Path(run_id): Path<i64>) -> Response {
    let (run, census, results) = match load_run_bundle(&state, run_id) {
        Ok(bundle) => bundle,
        Err(error) => return store_error_response(error),
    };
    match render_pdf(&run, &census, &results) {
        Ok(bytes) => download_response(bytes, "application/pdf", &format!("run-{run_id}.pdf")),
        Err(error) => {
            tracing::error!(%error, run_id, "pdf export failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "export failed")
        }
    }
}

fn load_run_bundle(
    state: &AppState,
    run_id: i64,
) -> Result<(RunRow, CensusRow, Vec<ScenarioResult>), StoreError> {
    let store = lock(&state.store);
    let run = store.run(run_id)?;
    let census = store.census(run.census_id)?;
    let results = store.results_for_run(run_id)?;
    Ok((run, census, results))
}

fn lock(store: &Arc<Mutex<Store>>) -> MutexGuard<'_, Store> {
    store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn store_error_response(error: StoreError) -> Response {
    match &error {
        StoreError::NotFound { .. } => error_response(StatusCode::NOT_FOUND, &error.to_string()),
        _ => {
            tracing::error!(%error, "store operation failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal storage error")
        }
    }
}

fn download_response(bytes: Vec<u8>, content_type: &'static str, filename: &str) -> Response {
    with_cache_control((
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        bytes,
    ))
}

fn with_cache_control<R: IntoResponse>(response: R) -> Response {
    let mut response = response.into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        "no-store".parse().expect("valid header"),
    );
    response
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        "no-store".parse().expect("valid header"),
    );
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}

#[cfg(test)]
fn analyze_request_from_json(json: &str) -> Result<AnalyzeRequest, String> {
    let payload = serde_json::from_str::<AnalyzePayload>(json)
        .map_err(|e| format!("Invalid API JSON payload: {e}"))?;
    build_analyze_request(payload)
}

#[cfg(test)]
fn grid_request_from_json(json: &str) -> Result<GridRequest, String> {
    let payload = serde_json::from_str::<GridPayload>(json)
        .map_err(|e| format!("Invalid API JSON payload: {e}"))?;
    build_grid_request(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Census, DEFAULT_RISK_MARGIN, Participant, TestStatus};
    use chrono::NaiveDate;

    const EPS: f64 = 1e-9;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < EPS,
            "expected {expected}, got {actual}"
        );
    }

    fn sample_analyze_payload() -> AnalyzePayload {
        AnalyzePayload {
            census_id: Some(1),
            adoption_rate: Some(50.0),
            contribution_rate: Some(6.0),
            seed: Some(42),
            hce_mode: None,
            risk_margin: None,
        }
    }

    fn sample_grid_payload() -> GridPayload {
        GridPayload {
            census_id: Some(1),
            adoption_rates: Some(vec![0.0, 50.0, 100.0]),
            contribution_rates: Some(vec![4.0, 8.0]),
            seed: Some(7),
            hce_mode: None,
            risk_margin: None,
        }
    }

    #[test]
    fn analyze_request_applies_config_defaults() {
        let request = build_analyze_request(sample_analyze_payload()).expect("valid payload");
        assert_eq!(request.census_id, 1);
        assert_eq!(request.input.seed, 42);
        assert_eq!(request.config.hce_mode, HceMode::Explicit);
        assert_approx(request.config.risk_margin, DEFAULT_RISK_MARGIN);
    }

    #[test]
    fn analyze_request_rejects_out_of_range_rates() {
        let mut payload = sample_analyze_payload();
        payload.adoption_rate = Some(120.0);
        let err = build_analyze_request(payload).expect_err("must reject adoption > 100");
        assert!(err.contains("adoptionRate"));

        let mut payload = sample_analyze_payload();
        payload.contribution_rate = Some(15.5);
        let err = build_analyze_request(payload).expect_err("must reject contribution > 15");
        assert!(err.contains("contributionRate"));
    }

    #[test]
    fn analyze_request_requires_census_and_rates() {
        let mut payload = sample_analyze_payload();
        payload.census_id = None;
        let err = build_analyze_request(payload).expect_err("must require censusId");
        assert_eq!(err, "censusId is required");

        let mut payload = sample_analyze_payload();
        payload.adoption_rate = None;
        let err = build_analyze_request(payload).expect_err("must require adoptionRate");
        assert_eq!(err, "adoptionRate is required");
    }

    #[test]
    fn zero_seed_is_rejected_and_absent_seed_is_generated() {
        let mut payload = sample_analyze_payload();
        payload.seed = Some(0);
        let err = build_analyze_request(payload).expect_err("must reject zero seed");
        assert!(err.contains("seed"));

        let mut payload = sample_analyze_payload();
        payload.seed = None;
        let request = build_analyze_request(payload).expect("valid payload");
        assert!(request.input.seed >= 1);
    }

    #[test]
    fn risk_margin_is_range_checked() {
        let mut payload = sample_analyze_payload();
        payload.risk_margin = Some(-0.1);
        assert!(build_analyze_request(payload).is_err());

        let mut payload = sample_analyze_payload();
        payload.risk_margin = Some(6.0);
        assert!(build_analyze_request(payload).is_err());

        let mut payload = sample_analyze_payload();
        payload.risk_margin = Some(0.0);
        let request = build_analyze_request(payload).expect("zero margin disables the band");
        assert_approx(request.config.risk_margin, 0.0);
    }

    #[test]
    fn grid_request_bounds_the_rate_lists() {
        let mut payload = sample_grid_payload();
        payload.adoption_rates = Some(vec![5.0]);
        let err = build_grid_request(payload).expect_err("must reject one-point list");
        assert_eq!(err, "adoptionRates must list between 2 and 20 values");

        let mut payload = sample_grid_payload();
        payload.adoption_rates = Some((0..21).map(f64::from).collect());
        let err = build_grid_request(payload).expect_err("must reject 21 values");
        assert!(err.contains("between 2 and 20"));

        let mut payload = sample_grid_payload();
        payload.contribution_rates = Some(vec![4.0, 16.0]);
        let err = build_grid_request(payload).expect_err("must reject contribution > 15");
        assert_eq!(err, "contributionRates values must be between 0 and 15");
    }

    #[test]
    fn census_request_is_validated_field_by_field() {
        let payload = CensusPayload {
            workspace_id: None,
            ..CensusPayload::default()
        };
        let err = build_census_request(payload).expect_err("must require workspaceId");
        assert_eq!(err, "workspaceId is required");

        let payload = CensusPayload {
            workspace_id: Some(1),
            name: Some("  ".to_string()),
            plan_year: Some(2024),
            csv: Some("id,dob,hiredate,comp\n".to_string()),
        };
        let err = build_census_request(payload).expect_err("must require a name");
        assert_eq!(err, "name is required");

        let payload = CensusPayload {
            workspace_id: Some(1),
            name: Some("Acme".to_string()),
            plan_year: Some(1500),
            csv: Some("id,dob,hiredate,comp\n".to_string()),
        };
        let err = build_census_request(payload).expect_err("must range check planYear");
        assert!(err.contains("planYear"));

        let payload = CensusPayload {
            workspace_id: Some(1),
            name: Some("Acme".to_string()),
            plan_year: Some(2024),
            csv: None,
        };
        let err = build_census_request(payload).expect_err("must require csv");
        assert_eq!(err, "csv is required");
    }

    #[test]
    fn grid_request_from_json_parses_web_keys() {
        let json = r#"{
          "censusId": 3,
          "adoptionRates": [0, 25, 50],
          "contributionRates": [4, 6],
          "seed": 9,
          "hceMode": "compensation-threshold",
          "riskMargin": 0.5
        }"#;
        let request = grid_request_from_json(json).expect("json should parse");

        assert_eq!(request.census_id, 3);
        assert_eq!(request.adoption_rates, vec![0.0, 25.0, 50.0]);
        assert_eq!(request.contribution_rates, vec![4.0, 6.0]);
        assert_eq!(request.seed, 9);
        assert_eq!(request.config.hce_mode, HceMode::CompensationThreshold);
        assert_approx(request.config.risk_margin, 0.5);
    }

    #[test]
    fn analyze_request_from_json_accepts_hce_mode_aliases() {
        for mode in ["threshold", "compensationThreshold", "compensation_threshold"] {
            let json = format!(
                r#"{{"censusId": 1, "adoptionRate": 10, "contributionRate": 5, "hceMode": "{mode}"}}"#
            );
            let request = analyze_request_from_json(&json).expect("json should parse");
            assert_eq!(request.config.hce_mode, HceMode::CompensationThreshold);
        }

        let json = r#"{"censusId": 1, "adoptionRate": 10, "contributionRate": 5, "hceMode": "explicit"}"#;
        let request = analyze_request_from_json(json).expect("json should parse");
        assert_eq!(request.config.hce_mode, HceMode::Explicit);
    }

    #[test]
    fn analyze_response_serialization_contains_expected_fields() {
        fn participant(external_ref: &str, hce: bool) -> Participant {
            Participant {
                external_ref: external_ref.to_string(),
                dob: NaiveDate::from_ymd_opt(1980, 5, 10).expect("valid date"),
                hire_date: NaiveDate::from_ymd_opt(2015, 3, 1).expect("valid date"),
                termination_date: None,
                compensation_cents: 60_000_00,
                pre_tax_rate: 0.0,
                roth_rate: 0.0,
                after_tax_rate: if hce { 0.0 } else { 2.0 },
                match_rate: 2.0,
                non_elective_rate: 0.0,
                hce_flag: Some(hce),
            }
        }

        // Both HCEs start at 2.0%; 50% adoption lifts one of them to 8.0%,
        // so the HCE average is 5.0% whichever one the shuffle picks.
        let census = Census {
            plan_year: 2024,
            participants: vec![
                participant("N-1", false),
                participant("N-2", false),
                participant("H-1", true),
                participant("H-2", true),
            ],
        };
        let request = build_analyze_request(sample_analyze_payload()).expect("valid payload");
        let result = run_scenario(&census, request.input, &request.config);
        assert_eq!(result.status, TestStatus::Pass);

        let response = AnalyzeResponse {
            run_id: 12,
            census_id: request.census_id,
            engine_version: ENGINE_VERSION,
            result,
        };
        let json = serde_json::to_string(&response).expect("response should serialize");
        assert!(json.contains("\"runId\""));
        assert!(json.contains("\"engineVersion\""));
        assert!(json.contains("\"status\":\"PASS\""));
        assert!(json.contains("\"nhceAcp\""));
        assert!(json.contains("\"hceAcp\""));
        assert!(json.contains("\"bindingRule\""));
        assert!(json.contains("\"margin\""));
    }

    #[test]
    fn run_detail_serialization_includes_summary() {
        let run = RunRow {
            run_id: 5,
            census_id: 2,
            kind: RunKind::Grid,
            status: crate::store::RunStatus::Completed,
            params_json: "{}".to_string(),
            seed: 42,
            engine_version: ENGINE_VERSION.to_string(),
            error: None,
            started_at: "2025-06-01T12:00:00Z".to_string(),
            finished_at: Some("2025-06-01T12:00:02Z".to_string()),
        };
        let results: Vec<ScenarioResult> = Vec::new();
        let summary = summarize_results(&results);
        let response = RunDetailResponse {
            run,
            results,
            summary,
        };

        let json = serde_json::to_string(&response).expect("response should serialize");
        assert!(json.contains("\"engineVersion\""));
        assert!(json.contains("\"startedAt\""));
        assert!(json.contains("\"passCount\""));
        assert!(json.contains("\"maxSafeContribution\""));
        assert!(json.contains("\"firstFailurePoint\""));
    }

    #[test]
    fn armed_cancel_guard_flags_the_token_on_drop() {
        let token = CancelToken::new();
        {
            let _guard = CancelOnDrop::new(token.clone());
        }
        assert!(token.is_cancelled());
    }

    #[test]
    fn disarmed_cancel_guard_leaves_the_token_alone() {
        let token = CancelToken::new();
        let guard = CancelOnDrop::new(token.clone());
        guard.disarm();
        assert!(!token.is_cancelled());
    }
}
