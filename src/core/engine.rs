use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use super::eligibility::{determine_inclusion, is_hce};
use super::types::{
    AcpMetrics, BindingRule, Census, CoreError, ENGINE_VERSION, GridPoint, GridResult,
    GridSummary, GroupLabel, PlanYear, ScenarioConfig, ScenarioInput, ScenarioResult, TestStatus,
};

const ACP_MULTIPLIER: f64 = 1.25;
const ACP_SPREAD_POINTS: f64 = 2.0;
const ACP_CAP_MULTIPLIER: f64 = 2.0;

#[derive(Debug, Clone)]
struct ResolvedMember {
    hce: bool,
    includable: bool,
    compensation_cents: i64,
    base_contribution_cents: f64,
}

/// Eligibility and HCE classification resolved once per run; every cell of a
/// grid shares the same snapshot.
#[derive(Debug)]
pub struct CensusSnapshot {
    members: Vec<ResolvedMember>,
    eligible_hce_indices: Vec<usize>,
}

/// Signals a running grid to stop between cells.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

pub fn run_scenario(
    census: &Census,
    input: ScenarioInput,
    config: &ScenarioConfig,
) -> ScenarioResult {
    let snapshot = resolve_census(census, config);
    evaluate_cell(
        &snapshot,
        input.adoption_rate,
        input.contribution_rate,
        input.seed,
        config.risk_margin,
    )
}

pub fn run_grid(
    census: &Census,
    adoption_rates: &[f64],
    contribution_rates: &[f64],
    seed: u64,
    config: &ScenarioConfig,
    cancel: &CancelToken,
) -> Result<GridResult, CoreError> {
    let snapshot = resolve_census(census, config);
    let mut cells = Vec::with_capacity(adoption_rates.len() * contribution_rates.len());

    for &adoption_rate in adoption_rates {
        for &contribution_rate in contribution_rates {
            if cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            cells.push(evaluate_cell(
                &snapshot,
                adoption_rate,
                contribution_rate,
                seed,
                config.risk_margin,
            ));
        }
    }

    let summary = summarize_results(&cells);
    Ok(GridResult {
        cells,
        summary,
        seed,
        engine_version: ENGINE_VERSION,
    })
}

pub fn resolve_census(census: &Census, config: &ScenarioConfig) -> CensusSnapshot {
    let plan_year = PlanYear::calendar(census.plan_year);
    let mut members = Vec::with_capacity(census.participants.len());
    let mut eligible_hce_indices = Vec::new();

    for (index, participant) in census.participants.iter().enumerate() {
        let eligibility = determine_inclusion(
            participant.dob,
            participant.hire_date,
            participant.termination_date,
            plan_year,
        );
        let hce = is_hce(participant, census.plan_year, config.hce_mode);
        if eligibility.acp_includable && hce {
            eligible_hce_indices.push(index);
        }
        members.push(ResolvedMember {
            hce,
            includable: eligibility.acp_includable,
            compensation_cents: participant.compensation_cents,
            base_contribution_cents: (participant.after_tax_rate + participant.match_rate)
                / 100.0
                * participant.compensation_cents as f64,
        });
    }

    CensusSnapshot {
        members,
        eligible_hce_indices,
    }
}

/// Selects which eligible HCEs adopt the after-tax strategy: a seeded
/// Fisher-Yates shuffle of the census-ordered pool, truncated to the
/// round-half-up share. The shuffle depends only on the seed and pool, so
/// runs sharing a seed draw nested adopter sets as the rate grows.
pub fn select_adopters(eligible: &[usize], adoption_rate: f64, seed: u64) -> Vec<usize> {
    let target = sample_target_count(eligible.len(), adoption_rate);
    if target == 0 {
        return Vec::new();
    }

    let mut order: Vec<usize> = eligible.to_vec();
    let mut rng = Rng::new(splitmix64(seed));
    for i in (1..order.len()).rev() {
        let j = (rng.next_u64() % (i as u64 + 1)) as usize;
        order.swap(i, j);
    }

    order.truncate(target);
    // Sorted so membership checks can binary search.
    order.sort_unstable();
    order
}

/// Computes the four-step corrective limit from the NHCE average and grades
/// the HCE average against it.
pub fn evaluate_limits(nhce_acp: f64, hce_acp: f64, risk_margin: f64) -> (TestStatus, AcpMetrics) {
    let limit_125 = nhce_acp * ACP_MULTIPLIER;
    let limit_2pct_uncapped = nhce_acp + ACP_SPREAD_POINTS;
    let cap_2x = nhce_acp * ACP_CAP_MULTIPLIER;
    let limit_2pct_capped = limit_2pct_uncapped.min(cap_2x);
    let effective_limit = limit_125.max(limit_2pct_capped);
    // Ties report the multiplier rule.
    let binding_rule = if limit_125 >= limit_2pct_capped {
        BindingRule::Multiple125
    } else {
        BindingRule::PlusTwo
    };

    let margin = effective_limit - hce_acp;
    let status = if margin < 0.0 {
        TestStatus::Fail
    } else if margin < risk_margin {
        TestStatus::Risk
    } else {
        TestStatus::Pass
    };

    let metrics = AcpMetrics {
        nhce_acp,
        hce_acp,
        limit_125,
        limit_2pct_uncapped,
        cap_2x,
        limit_2pct_capped,
        effective_limit,
        max_allowed_acp: effective_limit,
        margin,
        binding_rule,
    };
    (status, metrics)
}

/// Fresh seed for runs that did not pin one. Always nonzero, and always
/// reported back so the run can be replayed.
pub fn generate_seed() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or(0xA5A5_A5A5_A5A5_A5A5);
    splitmix64(nanos).max(1)
}

fn sample_target_count(eligible: usize, adoption_rate: f64) -> usize {
    let raw = adoption_rate / 100.0 * eligible as f64;
    (((raw + 0.5).floor()) as usize).min(eligible)
}

fn contribution_percentage(member: &ResolvedMember, adopts: bool, contribution_rate: f64) -> f64 {
    if member.compensation_cents <= 0 {
        return 0.0;
    }
    let mut contribution_cents = member.base_contribution_cents;
    if adopts {
        contribution_cents += contribution_rate / 100.0 * member.compensation_cents as f64;
    }
    contribution_cents / member.compensation_cents as f64 * 100.0
}

fn aggregate_group_averages(
    snapshot: &CensusSnapshot,
    adopters: &[usize],
    contribution_rate: f64,
) -> Result<(f64, f64), CoreError> {
    let mut nhce_sum = 0.0;
    let mut nhce_count = 0u32;
    let mut hce_sum = 0.0;
    let mut hce_count = 0u32;

    for (index, member) in snapshot.members.iter().enumerate() {
        if !member.includable {
            continue;
        }
        let adopts = member.hce && adopters.binary_search(&index).is_ok();
        let percentage = contribution_percentage(member, adopts, contribution_rate);
        if member.hce {
            hce_sum += percentage;
            hce_count += 1;
        } else {
            nhce_sum += percentage;
            nhce_count += 1;
        }
    }

    if nhce_count == 0 {
        return Err(CoreError::DegenerateGroup {
            group: GroupLabel::Nhce,
        });
    }
    if hce_count == 0 {
        return Err(CoreError::DegenerateGroup {
            group: GroupLabel::Hce,
        });
    }

    Ok((
        nhce_sum / f64::from(nhce_count),
        hce_sum / f64::from(hce_count),
    ))
}

fn evaluate_cell(
    snapshot: &CensusSnapshot,
    adoption_rate: f64,
    contribution_rate: f64,
    seed: u64,
    risk_margin: f64,
) -> ScenarioResult {
    let adopters = select_adopters(&snapshot.eligible_hce_indices, adoption_rate, seed);
    match aggregate_group_averages(snapshot, &adopters, contribution_rate) {
        Ok((nhce_acp, hce_acp)) => {
            let (status, metrics) = evaluate_limits(nhce_acp, hce_acp, risk_margin);
            ScenarioResult {
                status,
                adoption_rate,
                contribution_rate,
                seed,
                metrics: Some(metrics),
                error: None,
            }
        }
        Err(error) => {
            tracing::warn!(adoption_rate, contribution_rate, %error, "scenario not evaluable");
            ScenarioResult {
                status: TestStatus::Error,
                adoption_rate,
                contribution_rate,
                seed,
                metrics: None,
                error: Some(error.to_string()),
            }
        }
    }
}

/// Aggregate status counts and safety markers over an ordered cell list.
///
/// Works on stored cells as well as fresh ones; grid cells arrive in
/// row-major order, so `first_failure_point` reflects evaluation order.
pub fn summarize_results(cells: &[ScenarioResult]) -> GridSummary {
    let mut pass_count = 0;
    let mut risk_count = 0;
    let mut fail_count = 0;
    let mut error_count = 0;
    let mut first_failure_point = None;
    let mut worst_margin: Option<f64> = None;

    for cell in cells {
        match cell.status {
            TestStatus::Pass => pass_count += 1,
            TestStatus::Risk => risk_count += 1,
            TestStatus::Fail => {
                fail_count += 1;
                if first_failure_point.is_none() {
                    first_failure_point = Some(GridPoint {
                        adoption_rate: cell.adoption_rate,
                        contribution_rate: cell.contribution_rate,
                    });
                }
            }
            TestStatus::Error => error_count += 1,
        }
        if let Some(metrics) = &cell.metrics {
            worst_margin = Some(match worst_margin {
                Some(current) => current.min(metrics.margin),
                None => metrics.margin,
            });
        }
    }

    // A contribution rate is safe when every tested adoption rate stays out
    // of FAIL and ERROR at that rate.
    let mut column_safety: Vec<(f64, bool)> = Vec::new();
    for cell in cells {
        let safe = matches!(cell.status, TestStatus::Pass | TestStatus::Risk);
        match column_safety
            .iter_mut()
            .find(|(rate, _)| *rate == cell.contribution_rate)
        {
            Some((_, all_safe)) => *all_safe = *all_safe && safe,
            None => column_safety.push((cell.contribution_rate, safe)),
        }
    }
    let mut max_safe_contribution: Option<f64> = None;
    for (rate, safe) in column_safety {
        if safe {
            max_safe_contribution = Some(match max_safe_contribution {
                Some(current) => rate.max(current),
                None => rate,
            });
        }
    }

    GridSummary {
        pass_count,
        risk_count,
        fail_count,
        error_count,
        first_failure_point,
        max_safe_contribution,
        worst_margin,
    }
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

// xorshift64* stream; the fixed fallback keeps a zero seed off the
// degenerate all-zero state.
struct Rng {
    state: u64,
}

impl Rng {
    fn new(seed: u64) -> Self {
        let state = if seed == 0 {
            0xA5A5_A5A5_A5A5_A5A5
        } else {
            seed
        };
        Self { state }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }
}
