//! Census CSV import with fuzzy column mapping.
//!
//! Headers are normalized to lowercase alphanumerics before matching, so
//! "Date of Birth", "DATE_OF_BIRTH" and "DateOfBirth" all map to the same
//! field. Imports are all-or-nothing: the first bad row fails the whole file.

use serde::Serialize;
use thiserror::Error;

use crate::core::{Participant, parse_optional_date, parse_required_date};

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("CSV parse error: {0}")]
    Csv(#[from] csv::Error),
    #[error("no CSV column matches required field '{field}'")]
    MissingColumn { field: &'static str },
    #[error("row {row}: {message}")]
    Row { row: usize, message: String },
    #[error("census file has no data rows")]
    Empty,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnMapping {
    pub field: &'static str,
    pub header: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub mapped_columns: Vec<ColumnMapping>,
    pub unmapped_headers: Vec<String>,
    pub row_count: usize,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Field {
    ExternalRef,
    Dob,
    HireDate,
    TerminationDate,
    Compensation,
    PreTaxRate,
    RothRate,
    AfterTaxRate,
    MatchRate,
    NonElectiveRate,
    HceFlag,
}

impl Field {
    const ALL: [Field; 11] = [
        Field::ExternalRef,
        Field::Dob,
        Field::HireDate,
        Field::TerminationDate,
        Field::Compensation,
        Field::PreTaxRate,
        Field::RothRate,
        Field::AfterTaxRate,
        Field::MatchRate,
        Field::NonElectiveRate,
        Field::HceFlag,
    ];

    fn label(self) -> &'static str {
        match self {
            Field::ExternalRef => "employee id",
            Field::Dob => "DOB",
            Field::HireDate => "hire date",
            Field::TerminationDate => "termination date",
            Field::Compensation => "compensation",
            Field::PreTaxRate => "pre-tax rate",
            Field::RothRate => "Roth rate",
            Field::AfterTaxRate => "after-tax rate",
            Field::MatchRate => "match rate",
            Field::NonElectiveRate => "non-elective rate",
            Field::HceFlag => "HCE flag",
        }
    }

    fn required(self) -> bool {
        matches!(
            self,
            Field::ExternalRef | Field::Dob | Field::HireDate | Field::Compensation
        )
    }

    fn synonyms(self) -> &'static [&'static str] {
        match self {
            Field::ExternalRef => &[
                "employeeid",
                "empid",
                "id",
                "participantid",
                "externalref",
                "ssn",
            ],
            Field::Dob => &["dob", "dateofbirth", "birthdate", "birthday"],
            Field::HireDate => &["hiredate", "dateofhire", "doh", "startdate"],
            Field::TerminationDate => &[
                "terminationdate",
                "termdate",
                "dateoftermination",
                "dot",
                "enddate",
            ],
            Field::Compensation => &[
                "compensation",
                "comp",
                "salary",
                "annualcomp",
                "annualcompensation",
                "plancomp",
                "pay",
            ],
            Field::PreTaxRate => &[
                "pretaxrate",
                "pretax",
                "pretaxpct",
                "pretaxdeferral",
                "deferralrate",
                "401kpct",
            ],
            Field::RothRate => &["rothrate", "roth", "rothpct", "rothdeferral"],
            Field::AfterTaxRate => &[
                "aftertaxrate",
                "aftertax",
                "aftertaxpct",
                "voluntaryaftertax",
            ],
            Field::MatchRate => &["matchrate", "match", "employermatch", "matchpct"],
            Field::NonElectiveRate => &[
                "nonelectiverate",
                "nonelective",
                "nonelectivepct",
                "profitsharing",
                "nec",
            ],
            Field::HceFlag => &["hceflag", "hce", "ishce", "highlycompensated"],
        }
    }
}

struct ColumnMap {
    indices: [Option<usize>; Field::ALL.len()],
}

impl ColumnMap {
    fn index_of(&self, field: Field) -> Option<usize> {
        self.indices[field as usize]
    }
}

/// Parse a census CSV into participants plus a mapping report for the caller.
pub fn parse_census_csv(text: &str) -> Result<(Vec<Participant>, ImportReport), ImportError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());
    let headers = reader.headers()?.clone();
    let (map, mapped_columns, unmapped_headers) = map_columns(&headers)?;

    let mut participants = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record?;
        // File line numbering: the header is row 1.
        let row = index + 2;
        participants.push(parse_row(&map, &record, row)?);
    }
    if participants.is_empty() {
        return Err(ImportError::Empty);
    }

    let report = ImportReport {
        mapped_columns,
        unmapped_headers,
        row_count: participants.len(),
    };
    Ok((participants, report))
}

fn map_columns(
    headers: &csv::StringRecord,
) -> Result<(ColumnMap, Vec<ColumnMapping>, Vec<String>), ImportError> {
    let mut indices = [None; Field::ALL.len()];
    let mut mapped = Vec::new();
    let mut unmapped = Vec::new();

    for (index, header) in headers.iter().enumerate() {
        let normalized = normalize_header(header);
        let matched = Field::ALL
            .into_iter()
            .find(|field| field.synonyms().contains(&normalized.as_str()));
        match matched {
            // First match wins; a duplicate header for the same field is
            // reported as unmapped rather than silently overriding.
            Some(field) if indices[field as usize].is_none() => {
                indices[field as usize] = Some(index);
                mapped.push(ColumnMapping {
                    field: field.label(),
                    header: header.to_string(),
                });
            }
            _ => unmapped.push(header.to_string()),
        }
    }

    for field in Field::ALL {
        if field.required() && indices[field as usize].is_none() {
            return Err(ImportError::MissingColumn {
                field: field.label(),
            });
        }
    }

    Ok((ColumnMap { indices }, mapped, unmapped))
}

fn normalize_header(raw: &str) -> String {
    raw.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn parse_row(
    map: &ColumnMap,
    record: &csv::StringRecord,
    row: usize,
) -> Result<Participant, ImportError> {
    let external_ref = cell(record, map, Field::ExternalRef)
        .ok_or_else(|| row_error(row, "Missing employee id"))?
        .to_string();

    let dob = parse_required_date("DOB", cell(record, map, Field::Dob))
        .map_err(|e| row_error(row, e.to_string()))?;
    let hire_date = parse_required_date("hire date", cell(record, map, Field::HireDate))
        .map_err(|e| row_error(row, e.to_string()))?;
    let termination_date =
        parse_optional_date("termination date", cell(record, map, Field::TerminationDate))
            .map_err(|e| row_error(row, e.to_string()))?;

    if let Some(termination) = termination_date {
        if termination < hire_date {
            return Err(row_error(
                row,
                format!("Termination date {termination} precedes hire date {hire_date}"),
            ));
        }
    }

    let compensation_cents = match cell(record, map, Field::Compensation) {
        Some(raw) => parse_money_cents(raw).map_err(|message| row_error(row, message))?,
        None => return Err(row_error(row, "Missing compensation")),
    };

    let hce_flag = match cell(record, map, Field::HceFlag) {
        Some(raw) => Some(parse_hce_flag(raw).map_err(|message| row_error(row, message))?),
        None => None,
    };

    Ok(Participant {
        external_ref,
        dob,
        hire_date,
        termination_date,
        compensation_cents,
        pre_tax_rate: rate_cell(record, map, Field::PreTaxRate, row)?,
        roth_rate: rate_cell(record, map, Field::RothRate, row)?,
        after_tax_rate: rate_cell(record, map, Field::AfterTaxRate, row)?,
        match_rate: rate_cell(record, map, Field::MatchRate, row)?,
        non_elective_rate: rate_cell(record, map, Field::NonElectiveRate, row)?,
        hce_flag,
    })
}

fn cell<'a>(record: &'a csv::StringRecord, map: &ColumnMap, field: Field) -> Option<&'a str> {
    map.index_of(field)
        .and_then(|index| record.get(index))
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn rate_cell(
    record: &csv::StringRecord,
    map: &ColumnMap,
    field: Field,
    row: usize,
) -> Result<f64, ImportError> {
    match cell(record, map, field) {
        Some(raw) => parse_rate(field.label(), raw).map_err(|message| row_error(row, message)),
        None => Ok(0.0),
    }
}

/// Accepts `85000`, `85,000.50` and `$85,000`; always non-negative.
fn parse_money_cents(raw: &str) -> Result<i64, String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, '$' | ',' | ' '))
        .collect();
    let (whole, frac) = match cleaned.split_once('.') {
        Some((whole, frac)) => (whole, frac),
        None => (cleaned.as_str(), ""),
    };
    let shape_ok = !whole.is_empty()
        && whole.chars().all(|c| c.is_ascii_digit())
        && frac.len() <= 2
        && frac.chars().all(|c| c.is_ascii_digit());
    if !shape_ok {
        return Err(format!("Invalid compensation '{raw}'"));
    }
    let dollars: i64 = whole
        .parse()
        .map_err(|_| format!("Invalid compensation '{raw}'"))?;
    let cents: i64 = match frac.len() {
        0 => 0,
        1 => frac.parse::<i64>().unwrap_or(0) * 10,
        _ => frac.parse().unwrap_or(0),
    };
    dollars
        .checked_mul(100)
        .and_then(|v| v.checked_add(cents))
        .ok_or_else(|| format!("Invalid compensation '{raw}'"))
}

/// Accepts `6`, `6.5` and `6.5%`; always non-negative.
fn parse_rate(field: &str, raw: &str) -> Result<f64, String> {
    let cleaned = raw.trim().trim_end_matches('%').trim();
    let value: f64 = cleaned
        .parse()
        .map_err(|_| format!("Invalid {field} '{raw}'"))?;
    if !value.is_finite() || value < 0.0 {
        return Err(format!("Invalid {field} '{raw}'"));
    }
    Ok(value)
}

fn parse_hce_flag(raw: &str) -> Result<bool, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" | "true" | "t" | "1" | "hce" => Ok(true),
        "n" | "no" | "false" | "f" | "0" | "nhce" => Ok(false),
        _ => Err(format!("Invalid HCE flag '{raw}'")),
    }
}

fn row_error(row: usize, message: impl Into<String>) -> ImportError {
    ImportError::Row {
        row,
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn date(year: i32, month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, day).expect("valid test date")
    }

    const FULL_CSV: &str = "\
Employee ID,Date of Birth,Hire Date,Termination Date,Compensation,Pre-Tax %,Roth %,After-Tax %,Match %,Non-Elective %,HCE,Department
E-100,1985-03-14,2015-06-01,,\"$185,000\",10,0,4.5,3,1,Yes,Engineering
E-101,06/30/1992,2021-02-15,2024-08-31,\"72,500.50\",5,2.5%,0,3,0,no,Sales
E-102,1999-11-02,2023-01-09,,48000,0,0,0,3,0,,Support
";

    #[test]
    fn full_census_parses_with_synonym_headers() {
        let (participants, report) = parse_census_csv(FULL_CSV).expect("import");

        assert_eq!(participants.len(), 3);
        assert_eq!(report.row_count, 3);
        assert_eq!(report.mapped_columns.len(), 11);
        assert_eq!(report.unmapped_headers, vec!["Department".to_string()]);

        let first = &participants[0];
        assert_eq!(first.external_ref, "E-100");
        assert_eq!(first.dob, date(1985, 3, 14));
        assert_eq!(first.hire_date, date(2015, 6, 1));
        assert_eq!(first.termination_date, None);
        assert_eq!(first.compensation_cents, 185_000_00);
        assert_eq!(first.pre_tax_rate, 10.0);
        assert_eq!(first.after_tax_rate, 4.5);
        assert_eq!(first.hce_flag, Some(true));

        let second = &participants[1];
        assert_eq!(second.dob, date(1992, 6, 30));
        assert_eq!(second.termination_date, Some(date(2024, 8, 31)));
        assert_eq!(second.compensation_cents, 72_500_50);
        assert_eq!(second.roth_rate, 2.5);
        assert_eq!(second.hce_flag, Some(false));

        // Blank HCE cell means unflagged, not false.
        assert_eq!(participants[2].hce_flag, None);
    }

    #[test]
    fn minimal_headers_apply_defaults() {
        let csv = "EMP_ID,BirthDate,DOH,Salary\nE-1,1990-01-10,2022-12-20,52000\n";
        let (participants, report) = parse_census_csv(csv).expect("import");

        assert_eq!(report.mapped_columns.len(), 4);
        assert!(report.unmapped_headers.is_empty());

        let p = &participants[0];
        assert_eq!(p.compensation_cents, 52_000_00);
        assert_eq!(p.termination_date, None);
        assert_eq!(p.pre_tax_rate, 0.0);
        assert_eq!(p.roth_rate, 0.0);
        assert_eq!(p.after_tax_rate, 0.0);
        assert_eq!(p.match_rate, 0.0);
        assert_eq!(p.non_elective_rate, 0.0);
        assert_eq!(p.hce_flag, None);
    }

    #[test]
    fn money_accepts_common_shapes() {
        for (raw, cents) in [
            ("85000", 85_000_00),
            ("85000.5", 85_000_50),
            ("85,000.50", 85_000_50),
            ("$85,000", 85_000_00),
            ("$ 1,234,567.89", 1_234_567_89),
            ("0", 0),
        ] {
            assert_eq!(parse_money_cents(raw), Ok(cents), "input {raw:?}");
        }
        for raw in ["", "-85000", "85000.505", "85k", "12.3.4"] {
            assert!(parse_money_cents(raw).is_err(), "input {raw:?}");
        }
    }

    #[test]
    fn rates_accept_percent_suffix() {
        assert_eq!(parse_rate("match rate", "6"), Ok(6.0));
        assert_eq!(parse_rate("match rate", "6.5"), Ok(6.5));
        assert_eq!(parse_rate("match rate", "6.5%"), Ok(6.5));
        assert_eq!(parse_rate("match rate", "6.5 %"), Ok(6.5));
        assert!(parse_rate("match rate", "-1").is_err());
        assert!(parse_rate("match rate", "six").is_err());
    }

    #[test]
    fn hce_flags_accept_common_spellings() {
        for raw in ["y", "Yes", "TRUE", "t", "1", "HCE"] {
            assert_eq!(parse_hce_flag(raw), Ok(true), "input {raw:?}");
        }
        for raw in ["n", "No", "false", "F", "0", "nhce"] {
            assert_eq!(parse_hce_flag(raw), Ok(false), "input {raw:?}");
        }
        assert!(parse_hce_flag("maybe").is_err());
    }

    #[test]
    fn missing_required_column_names_the_field() {
        let csv = "Employee ID,Date of Birth,Hire Date\nE-1,1990-01-10,2022-12-20\n";
        match parse_census_csv(csv) {
            Err(ImportError::MissingColumn { field }) => assert_eq!(field, "compensation"),
            other => panic!("expected MissingColumn, got {other:?}"),
        }
    }

    #[test]
    fn bad_row_reports_file_line_number() {
        let csv = "\
id,dob,hiredate,comp
E-1,1990-01-10,2022-12-20,52000
E-2,not-a-date,2022-12-20,52000
";
        match parse_census_csv(csv) {
            Err(ImportError::Row { row, message }) => {
                assert_eq!(row, 3);
                assert_eq!(message, "Invalid DOB format");
            }
            other => panic!("expected Row error, got {other:?}"),
        }
    }

    #[test]
    fn termination_before_hire_is_rejected() {
        let csv = "\
id,dob,hiredate,termdate,comp
E-1,1990-01-10,2022-12-20,2021-01-01,52000
";
        match parse_census_csv(csv) {
            Err(ImportError::Row { row, message }) => {
                assert_eq!(row, 2);
                assert!(message.contains("precedes hire date"));
            }
            other => panic!("expected Row error, got {other:?}"),
        }
    }

    #[test]
    fn header_only_file_is_empty() {
        let csv = "id,dob,hiredate,comp\n";
        assert!(matches!(parse_census_csv(csv), Err(ImportError::Empty)));
    }

    #[test]
    fn duplicate_field_headers_keep_the_first_mapping() {
        let csv = "\
id,dob,hiredate,comp,salary
E-1,1990-01-10,2022-12-20,52000,99999
";
        let (participants, report) = parse_census_csv(csv).expect("import");
        assert_eq!(participants[0].compensation_cents, 52_000_00);
        assert_eq!(report.unmapped_headers, vec!["salary".to_string()]);
    }
}
