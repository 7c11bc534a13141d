mod eligibility;
mod engine;
mod types;

pub use eligibility::{
    determine_inclusion, determine_inclusion_from_strings, hce_threshold_cents, is_hce,
    parse_census_date, parse_optional_date, parse_required_date,
};
pub use engine::{
    CancelToken, CensusSnapshot, evaluate_limits, generate_seed, resolve_census, run_grid,
    run_scenario, select_adopters, summarize_results,
};
pub use types::{
    AcpMetrics, BindingRule, Census, CoreError, DEFAULT_RISK_MARGIN, ENGINE_VERSION,
    EligibilityResult, ExclusionReason, GridPoint, GridResult, GridSummary, GroupLabel, HceMode,
    Participant, PlanYear, ScenarioConfig, ScenarioInput, ScenarioResult, TestStatus,
};
