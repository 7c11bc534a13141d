use chrono::{Datelike, Months, NaiveDate};

use super::types::{
    CoreError, EligibilityResult, ExclusionReason, HceMode, Participant, PlanYear,
};

const ELIGIBILITY_AGE_YEARS: u32 = 21;
const SERVICE_REQUIREMENT_YEARS: u32 = 1;

const ISO_DATE_FORMAT: &str = "%Y-%m-%d";
const US_DATE_FORMAT: &str = "%m/%d/%Y";

struct ThresholdEntry {
    plan_year: i32,
    compensation_cents: i64,
}

// IRC 414(q)(1)(B) dollar limits by plan year, in cents. Contiguous and
// ascending; lookups outside the range clamp to the nearest entry.
const HCE_COMPENSATION_THRESHOLDS: &[ThresholdEntry] = &[
    ThresholdEntry {
        plan_year: 2015,
        compensation_cents: 120_000_00,
    },
    ThresholdEntry {
        plan_year: 2016,
        compensation_cents: 120_000_00,
    },
    ThresholdEntry {
        plan_year: 2017,
        compensation_cents: 120_000_00,
    },
    ThresholdEntry {
        plan_year: 2018,
        compensation_cents: 120_000_00,
    },
    ThresholdEntry {
        plan_year: 2019,
        compensation_cents: 125_000_00,
    },
    ThresholdEntry {
        plan_year: 2020,
        compensation_cents: 130_000_00,
    },
    ThresholdEntry {
        plan_year: 2021,
        compensation_cents: 130_000_00,
    },
    ThresholdEntry {
        plan_year: 2022,
        compensation_cents: 135_000_00,
    },
    ThresholdEntry {
        plan_year: 2023,
        compensation_cents: 150_000_00,
    },
    ThresholdEntry {
        plan_year: 2024,
        compensation_cents: 155_000_00,
    },
    ThresholdEntry {
        plan_year: 2025,
        compensation_cents: 160_000_00,
    },
];

pub fn hce_threshold_cents(plan_year: i32) -> i64 {
    let first = &HCE_COMPENSATION_THRESHOLDS[0];
    let last = &HCE_COMPENSATION_THRESHOLDS[HCE_COMPENSATION_THRESHOLDS.len() - 1];

    if plan_year < first.plan_year {
        tracing::warn!(
            plan_year,
            clamped_to = first.plan_year,
            "plan year precedes HCE threshold table; using earliest entry"
        );
        return first.compensation_cents;
    }
    if plan_year > last.plan_year {
        tracing::warn!(
            plan_year,
            clamped_to = last.plan_year,
            "plan year beyond HCE threshold table; using latest entry"
        );
        return last.compensation_cents;
    }

    HCE_COMPENSATION_THRESHOLDS
        .iter()
        .find(|entry| entry.plan_year == plan_year)
        .map(|entry| entry.compensation_cents)
        .unwrap_or(last.compensation_cents)
}

pub fn is_hce(participant: &Participant, plan_year: i32, mode: HceMode) -> bool {
    match mode {
        HceMode::Explicit => participant.hce_flag.unwrap_or(false),
        HceMode::CompensationThreshold => {
            participant.compensation_cents >= hce_threshold_cents(plan_year)
        }
    }
}

pub fn parse_census_date(field: &'static str, raw: &str) -> Result<NaiveDate, CoreError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(CoreError::MissingField { field });
    }
    NaiveDate::parse_from_str(trimmed, ISO_DATE_FORMAT)
        .or_else(|_| NaiveDate::parse_from_str(trimmed, US_DATE_FORMAT))
        .map_err(|_| CoreError::InvalidDateFormat { field })
}

pub fn parse_required_date(
    field: &'static str,
    raw: Option<&str>,
) -> Result<NaiveDate, CoreError> {
    match raw {
        Some(value) => parse_census_date(field, value),
        None => Err(CoreError::MissingField { field }),
    }
}

pub fn parse_optional_date(
    field: &'static str,
    raw: Option<&str>,
) -> Result<Option<NaiveDate>, CoreError> {
    match raw {
        Some(value) if !value.trim().is_empty() => parse_census_date(field, value).map(Some),
        _ => Ok(None),
    }
}

// Month arithmetic clamps to the last day of short months, so a Feb 29
// anniversary lands on Feb 28 in non-leap years. Overflow is only possible
// near chrono's year bounds and degrades to a never-reached entry date.
fn add_years(date: NaiveDate, years: u32) -> NaiveDate {
    date.checked_add_months(Months::new(years * 12))
        .unwrap_or(NaiveDate::MAX)
}

fn first_of(year: i32, month: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(NaiveDate::MAX)
}

/// First semiannual entry date (January 1 or July 1) on or after the given
/// eligibility date.
fn semiannual_entry_date(eligibility_date: NaiveDate) -> NaiveDate {
    let year = eligibility_date.year();
    let january_entry = first_of(year, 1);
    let july_entry = first_of(year, 7);

    if eligibility_date == january_entry {
        january_entry
    } else if eligibility_date <= july_entry {
        july_entry
    } else {
        first_of(year + 1, 1)
    }
}

/// Applies the 401(m) eligibility rules: eligible at the later of the 21st
/// birthday and the one-year service anniversary, entering on the next
/// semiannual entry date. A participant is ACP-includable when the entry
/// date falls inside the plan year and employment lasted to the entry date.
pub fn determine_inclusion(
    dob: NaiveDate,
    hire_date: NaiveDate,
    termination_date: Option<NaiveDate>,
    plan_year: PlanYear,
) -> EligibilityResult {
    let age_date = add_years(dob, ELIGIBILITY_AGE_YEARS);
    let service_date = add_years(hire_date, SERVICE_REQUIREMENT_YEARS);
    let eligibility_date = age_date.max(service_date);
    let entry_date = semiannual_entry_date(eligibility_date);

    if entry_date > plan_year.end {
        return EligibilityResult {
            eligibility_date,
            entry_date,
            acp_includable: false,
            exclusion_reason: Some(ExclusionReason::NotEligibleDuringYear),
        };
    }

    // Termination exactly on the entry date still counts as participating.
    if let Some(termination) = termination_date {
        if termination < entry_date {
            return EligibilityResult {
                eligibility_date,
                entry_date,
                acp_includable: false,
                exclusion_reason: Some(ExclusionReason::TerminatedBeforeEntry),
            };
        }
    }

    EligibilityResult {
        eligibility_date,
        entry_date,
        acp_includable: true,
        exclusion_reason: None,
    }
}

pub fn determine_inclusion_from_strings(
    dob: Option<&str>,
    hire_date: Option<&str>,
    termination_date: Option<&str>,
    plan_year: PlanYear,
) -> Result<EligibilityResult, CoreError> {
    let dob = parse_required_date("DOB", dob)?;
    let hire = parse_required_date("hire date", hire_date)?;
    let termination = parse_optional_date("termination date", termination_date)?;
    Ok(determine_inclusion(dob, hire, termination, plan_year))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::{prop_assert, prop_assert_eq, prop_assume, proptest};

    fn date(year: i32, month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, day).expect("valid test date")
    }

    fn sample_participant() -> Participant {
        Participant {
            external_ref: "E-1001".to_string(),
            dob: date(1985, 4, 12),
            hire_date: date(2015, 6, 1),
            termination_date: None,
            compensation_cents: 90_000_00,
            pre_tax_rate: 6.0,
            roth_rate: 0.0,
            after_tax_rate: 2.0,
            match_rate: 3.0,
            non_elective_rate: 0.0,
            hce_flag: None,
        }
    }

    #[test]
    fn service_requirement_binds_for_mid_career_hire() {
        let result = determine_inclusion(
            date(1990, 1, 10),
            date(2022, 12, 20),
            None,
            PlanYear::calendar(2024),
        );

        assert_eq!(result.eligibility_date, date(2023, 12, 20));
        assert_eq!(result.entry_date, date(2024, 1, 1));
        assert!(result.acp_includable);
        assert_eq!(result.exclusion_reason, None);
    }

    #[test]
    fn young_hire_is_excluded_until_age_21() {
        let result = determine_inclusion(
            date(2006, 8, 1),
            date(2023, 9, 1),
            None,
            PlanYear::calendar(2024),
        );

        assert_eq!(result.eligibility_date, date(2027, 8, 1));
        assert!(!result.acp_includable);
        assert_eq!(
            result.exclusion_reason,
            Some(ExclusionReason::NotEligibleDuringYear)
        );
    }

    #[test]
    fn eligibility_on_january_first_enters_same_day() {
        let result = determine_inclusion(
            date(1980, 1, 1),
            date(2020, 1, 1),
            None,
            PlanYear::calendar(2021),
        );

        assert_eq!(result.eligibility_date, date(2021, 1, 1));
        assert_eq!(result.entry_date, date(2021, 1, 1));
        assert!(result.acp_includable);
    }

    #[test]
    fn eligibility_on_july_first_enters_same_day() {
        let result = determine_inclusion(
            date(1980, 3, 15),
            date(2020, 7, 1),
            None,
            PlanYear::calendar(2021),
        );

        assert_eq!(result.eligibility_date, date(2021, 7, 1));
        assert_eq!(result.entry_date, date(2021, 7, 1));
    }

    #[test]
    fn eligibility_after_july_first_waits_for_january() {
        let result = determine_inclusion(
            date(1980, 3, 15),
            date(2020, 7, 2),
            None,
            PlanYear::calendar(2021),
        );

        assert_eq!(result.eligibility_date, date(2021, 7, 2));
        assert_eq!(result.entry_date, date(2022, 1, 1));
        assert!(!result.acp_includable);
        assert_eq!(
            result.exclusion_reason,
            Some(ExclusionReason::NotEligibleDuringYear)
        );
    }

    #[test]
    fn leap_day_birthday_clamps_to_february_28() {
        let result = determine_inclusion(
            date(2004, 2, 29),
            date(2000, 1, 1),
            None,
            PlanYear::calendar(2025),
        );

        assert_eq!(result.eligibility_date, date(2025, 2, 28));
        assert_eq!(result.entry_date, date(2025, 7, 1));
        assert!(result.acp_includable);
    }

    #[test]
    fn termination_before_entry_is_excluded() {
        let result = determine_inclusion(
            date(1990, 1, 10),
            date(2022, 12, 20),
            Some(date(2023, 12, 31)),
            PlanYear::calendar(2024),
        );

        assert!(!result.acp_includable);
        assert_eq!(
            result.exclusion_reason,
            Some(ExclusionReason::TerminatedBeforeEntry)
        );
    }

    #[test]
    fn termination_on_entry_date_still_counts() {
        let result = determine_inclusion(
            date(1990, 1, 10),
            date(2022, 12, 20),
            Some(date(2024, 1, 1)),
            PlanYear::calendar(2024),
        );

        assert!(result.acp_includable);
        assert_eq!(result.exclusion_reason, None);
    }

    #[test]
    fn never_eligible_reason_wins_over_termination() {
        let result = determine_inclusion(
            date(2006, 8, 1),
            date(2023, 9, 1),
            Some(date(2023, 10, 1)),
            PlanYear::calendar(2024),
        );

        assert!(!result.acp_includable);
        assert_eq!(
            result.exclusion_reason,
            Some(ExclusionReason::NotEligibleDuringYear)
        );
    }

    #[test]
    fn parse_census_date_accepts_iso_and_us_forms() {
        assert_eq!(
            parse_census_date("DOB", "1990-01-10").expect("iso form"),
            date(1990, 1, 10)
        );
        assert_eq!(
            parse_census_date("DOB", "01/10/1990").expect("us form"),
            date(1990, 1, 10)
        );
        assert_eq!(
            parse_census_date("DOB", " 1/5/1990 ").expect("unpadded us form"),
            date(1990, 1, 5)
        );
    }

    #[test]
    fn parse_census_date_reports_field_in_errors() {
        let missing = parse_required_date("DOB", None).expect_err("missing date");
        assert_eq!(missing.to_string(), "Missing DOB");

        let blank = parse_census_date("hire date", "  ").expect_err("blank date");
        assert_eq!(blank.to_string(), "Missing hire date");

        let garbage = parse_census_date("DOB", "Jan 10 1990").expect_err("bad format");
        assert_eq!(garbage.to_string(), "Invalid DOB format");
    }

    #[test]
    fn parse_optional_date_treats_blank_as_absent() {
        assert_eq!(
            parse_optional_date("termination date", None).expect("absent"),
            None
        );
        assert_eq!(
            parse_optional_date("termination date", Some("")).expect("blank"),
            None
        );
        assert_eq!(
            parse_optional_date("termination date", Some("2024-03-31")).expect("present"),
            Some(date(2024, 3, 31))
        );
    }

    #[test]
    fn inclusion_from_strings_matches_typed_path() {
        let plan_year = PlanYear::calendar(2024);
        let from_strings = determine_inclusion_from_strings(
            Some("1990-01-10"),
            Some("12/20/2022"),
            None,
            plan_year,
        )
        .expect("parseable dates");
        let typed =
            determine_inclusion(date(1990, 1, 10), date(2022, 12, 20), None, plan_year);

        assert_eq!(from_strings, typed);
    }

    #[test]
    fn threshold_table_has_exact_years_and_clamps_outside() {
        assert_eq!(hce_threshold_cents(2023), 150_000_00);
        assert_eq!(hce_threshold_cents(2024), 155_000_00);
        assert_eq!(hce_threshold_cents(2025), 160_000_00);
        assert_eq!(hce_threshold_cents(1999), 120_000_00);
        assert_eq!(hce_threshold_cents(2031), 160_000_00);
    }

    #[test]
    fn explicit_mode_uses_stored_flag_verbatim() {
        let mut participant = sample_participant();
        participant.compensation_cents = 500_000_00;

        assert!(!is_hce(&participant, 2024, HceMode::Explicit));
        participant.hce_flag = Some(true);
        assert!(is_hce(&participant, 2024, HceMode::Explicit));
    }

    #[test]
    fn threshold_mode_compares_compensation_inclusively() {
        let mut participant = sample_participant();

        participant.compensation_cents = 155_000_00;
        assert!(is_hce(&participant, 2024, HceMode::CompensationThreshold));
        participant.compensation_cents = 154_999_99;
        assert!(!is_hce(&participant, 2024, HceMode::CompensationThreshold));
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(32))]

        #[test]
        fn prop_entry_date_is_a_semiannual_boundary_after_eligibility(
            dob_year in 1940i32..2010,
            dob_month in 1u32..=12,
            dob_day in 1u32..=31,
            hire_year in 1990i32..2025,
            hire_month in 1u32..=12,
            hire_day in 1u32..=31,
            plan_year in 2015i32..2030
        ) {
            let dob = NaiveDate::from_ymd_opt(dob_year, dob_month, dob_day);
            let hire = NaiveDate::from_ymd_opt(hire_year, hire_month, hire_day);
            prop_assume!(dob.is_some() && hire.is_some());
            let dob = dob.expect("checked above");
            let hire = hire.expect("checked above");

            let result = determine_inclusion(dob, hire, None, PlanYear::calendar(plan_year));

            prop_assert!(result.entry_date >= result.eligibility_date);
            let entry = result.entry_date;
            prop_assert!(
                entry.day() == 1 && (entry.month() == 1 || entry.month() == 7),
                "entry date {entry} is not a semiannual boundary"
            );
            let horizon = result
                .eligibility_date
                .checked_add_months(Months::new(6))
                .expect("bounded test dates");
            prop_assert!(entry <= horizon, "entry {entry} is more than six months out");
        }

        #[test]
        fn prop_inclusion_requires_entry_within_plan_year(
            dob_year in 1940i32..2010,
            hire_year in 1990i32..2025,
            plan_year in 2015i32..2030,
            termination_offset_days in 0i64..4000
        ) {
            let dob = date(dob_year, 6, 15);
            let hire = date(hire_year, 3, 10);
            let termination = hire + chrono::Days::new(termination_offset_days as u64);

            let result = determine_inclusion(
                dob,
                hire,
                Some(termination),
                PlanYear::calendar(plan_year),
            );

            if result.acp_includable {
                prop_assert!(result.entry_date <= PlanYear::calendar(plan_year).end);
                prop_assert!(termination >= result.entry_date);
                prop_assert_eq!(result.exclusion_reason, None);
            } else {
                prop_assert!(result.exclusion_reason.is_some());
            }
        }
    }
}
