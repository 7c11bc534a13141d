use std::fmt;

use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;

/// Identifies the limit algorithm and sampling stream. Recorded on every
/// persisted run so stored results stay attributable after engine changes.
pub const ENGINE_VERSION: &str = "acp-core/1 xs64s-fy";

/// Margin (in ACP percentage points) under which a passing scenario is
/// reported as RISK instead of PASS. Zero disables the RISK band.
pub const DEFAULT_RISK_MARGIN: f64 = 0.25;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HceMode {
    Explicit,
    CompensationThreshold,
}

impl HceMode {
    pub fn as_str(self) -> &'static str {
        match self {
            HceMode::Explicit => "explicit",
            HceMode::CompensationThreshold => "compensation-threshold",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TestStatus {
    Pass,
    Risk,
    Fail,
    Error,
}

impl TestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TestStatus::Pass => "PASS",
            TestStatus::Risk => "RISK",
            TestStatus::Fail => "FAIL",
            TestStatus::Error => "ERROR",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
pub enum BindingRule {
    #[serde(rename = "1.25x")]
    Multiple125,
    #[serde(rename = "+2.0")]
    PlusTwo,
}

impl BindingRule {
    pub fn as_str(self) -> &'static str {
        match self {
            BindingRule::Multiple125 => "1.25x",
            BindingRule::PlusTwo => "+2.0",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExclusionReason {
    NotEligibleDuringYear,
    TerminatedBeforeEntry,
}

impl ExclusionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ExclusionReason::NotEligibleDuringYear => "NOT_ELIGIBLE_DURING_YEAR",
            ExclusionReason::TerminatedBeforeEntry => "TERMINATED_BEFORE_ENTRY",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum GroupLabel {
    Hce,
    Nhce,
}

impl fmt::Display for GroupLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupLabel::Hce => f.write_str("HCE"),
            GroupLabel::Nhce => f.write_str("NHCE"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Missing {field}")]
    MissingField { field: &'static str },
    #[error("Invalid {field} format")]
    InvalidDateFormat { field: &'static str },
    #[error("{group} group has zero ACP-includable participants")]
    DegenerateGroup { group: GroupLabel },
    #[error("analysis cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct Participant {
    pub external_ref: String,
    pub dob: NaiveDate,
    pub hire_date: NaiveDate,
    pub termination_date: Option<NaiveDate>,
    /// Plan-year compensation in integer cents.
    pub compensation_cents: i64,
    pub pre_tax_rate: f64,
    pub roth_rate: f64,
    pub after_tax_rate: f64,
    pub match_rate: f64,
    pub non_elective_rate: f64,
    /// Explicit HCE designation from the census file; absent means not flagged.
    pub hce_flag: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct Census {
    pub plan_year: i32,
    pub participants: Vec<Participant>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PlanYear {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl PlanYear {
    /// Calendar-year plan year. Plan years are range-checked at the import
    /// and API boundaries, so construction cannot fail here.
    pub fn calendar(year: i32) -> Self {
        Self {
            start: NaiveDate::from_ymd_opt(year, 1, 1).expect("valid plan year start"),
            end: NaiveDate::from_ymd_opt(year, 12, 31).expect("valid plan year end"),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EligibilityResult {
    pub eligibility_date: NaiveDate,
    pub entry_date: NaiveDate,
    pub acp_includable: bool,
    pub exclusion_reason: Option<ExclusionReason>,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ScenarioInput {
    pub adoption_rate: f64,
    pub contribution_rate: f64,
    pub seed: u64,
}

#[derive(Copy, Clone, Debug)]
pub struct ScenarioConfig {
    pub hce_mode: HceMode,
    pub risk_margin: f64,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            hce_mode: HceMode::Explicit,
            risk_margin: DEFAULT_RISK_MARGIN,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AcpMetrics {
    pub nhce_acp: f64,
    pub hce_acp: f64,
    pub limit_125: f64,
    pub limit_2pct_uncapped: f64,
    pub cap_2x: f64,
    pub limit_2pct_capped: f64,
    pub effective_limit: f64,
    pub max_allowed_acp: f64,
    pub margin: f64,
    pub binding_rule: BindingRule,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioResult {
    pub status: TestStatus,
    pub adoption_rate: f64,
    pub contribution_rate: f64,
    pub seed: u64,
    /// Absent on ERROR results; an unevaluable scenario reports no numbers.
    #[serde(flatten)]
    pub metrics: Option<AcpMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GridPoint {
    pub adoption_rate: f64,
    pub contribution_rate: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GridSummary {
    pub pass_count: usize,
    pub risk_count: usize,
    pub fail_count: usize,
    pub error_count: usize,
    pub first_failure_point: Option<GridPoint>,
    pub max_safe_contribution: Option<f64>,
    pub worst_margin: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GridResult {
    /// Row-major over adoption rates (outer) then contribution rates (inner).
    pub cells: Vec<ScenarioResult>,
    pub summary: GridSummary,
    pub seed: u64,
    pub engine_version: &'static str,
}
