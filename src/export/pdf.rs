//! PDF report rendering with lopdf primitives.
//!
//! The layout is a flowed list of text lines: a summary block in Helvetica,
//! then the result table in Courier so the columns line up. Long grids are
//! truncated after [`MAX_TABLE_ROWS`] rows with an explicit marker.

use lopdf::content::{Content, Operation};
use lopdf::{Document, Object, Stream, dictionary};

use super::ExportError;
use crate::core::{ScenarioResult, summarize_results};
use crate::store::{CensusRow, RunRow};

const PAGE_WIDTH: i64 = 612;
const PAGE_HEIGHT: i64 = 792;
const MARGIN_X: i64 = 54;
const TOP_Y: i64 = 738;
const MIN_Y: i64 = 54;
const TITLE_SIZE: i64 = 16;
const BODY_SIZE: i64 = 10;
const TABLE_SIZE: i64 = 9;

/// Table rows rendered before the report truncates.
const MAX_TABLE_ROWS: usize = 50;

#[derive(Clone, Copy)]
enum Font {
    Body,
    Table,
}

impl Font {
    fn name(self) -> &'static str {
        match self {
            Font::Body => "F1",
            Font::Table => "F2",
        }
    }
}

struct Line {
    text: String,
    size: i64,
    font: Font,
}

impl Line {
    fn title(text: impl Into<String>) -> Self {
        Line {
            text: text.into(),
            size: TITLE_SIZE,
            font: Font::Body,
        }
    }

    fn body(text: impl Into<String>) -> Self {
        Line {
            text: text.into(),
            size: BODY_SIZE,
            font: Font::Body,
        }
    }

    fn table(text: impl Into<String>) -> Self {
        Line {
            text: text.into(),
            size: TABLE_SIZE,
            font: Font::Table,
        }
    }
}

/// Render the report PDF for a run over `census` with its stored results.
pub fn render_pdf(
    run: &RunRow,
    census: &CensusRow,
    results: &[ScenarioResult],
) -> Result<Vec<u8>, ExportError> {
    let lines = report_lines(run, census, results);
    build_document(&lines)
}

fn report_lines(run: &RunRow, census: &CensusRow, results: &[ScenarioResult]) -> Vec<Line> {
    let summary = summarize_results(results);

    let mut lines = vec![
        Line::title("ACP Nondiscrimination Test Report"),
        Line::body(format!(
            "Census: {} (plan year {}, {} participants)",
            census.name, census.plan_year, census.participant_count
        )),
        Line::body(format!(
            "Run {} ({}) started {}",
            run.run_id,
            run.kind.as_str(),
            run.started_at
        )),
        Line::body(format!("Engine {} seed {}", run.engine_version, run.seed)),
        Line::body(format!(
            "Cells: {} pass, {} risk, {} fail, {} error",
            summary.pass_count, summary.risk_count, summary.fail_count, summary.error_count
        )),
    ];

    if let Some(point) = &summary.first_failure_point {
        lines.push(Line::body(format!(
            "First failure at {:.3}% adoption / {:.3}% contribution",
            point.adoption_rate, point.contribution_rate
        )));
    }
    if let Some(margin) = summary.worst_margin {
        lines.push(Line::body(format!("Worst margin: {margin:.3} pp")));
    }
    if let Some(rate) = summary.max_safe_contribution {
        lines.push(Line::body(format!("Max safe contribution rate: {rate:.3}%")));
    }

    lines.push(Line::body(String::new()));
    lines.push(Line::table(format!(
        "{:>8} {:>8} {:>8} {:>8} {:>9} {:>8} {:<6} {:<5}",
        "adopt%", "contrib%", "nhce", "hce", "threshold", "margin", "result", "limit"
    )));
    for result in results.iter().take(MAX_TABLE_ROWS) {
        lines.push(Line::table(table_row(result)));
    }
    if results.len() > MAX_TABLE_ROWS {
        lines.push(Line::table(format!(
            "... {} additional rows truncated",
            results.len() - MAX_TABLE_ROWS
        )));
    }

    lines
}

fn table_row(result: &ScenarioResult) -> String {
    let metrics = result.metrics.as_ref();
    let mut row = format!(
        "{:>8} {:>8} {:>8} {:>8} {:>9} {:>8} {:<6} {:<5}",
        fmt3(result.adoption_rate),
        fmt3(result.contribution_rate),
        opt3(metrics.map(|m| m.nhce_acp)),
        opt3(metrics.map(|m| m.hce_acp)),
        opt3(metrics.map(|m| m.max_allowed_acp)),
        opt3(metrics.map(|m| m.margin)),
        result.status.as_str(),
        metrics.map(|m| m.binding_rule.as_str()).unwrap_or(""),
    );
    if let Some(error) = &result.error {
        row.push(' ');
        row.push_str(error);
    }
    row
}

fn fmt3(value: f64) -> String {
    format!("{value:.3}")
}

fn opt3(value: Option<f64>) -> String {
    value.map(fmt3).unwrap_or_default()
}

fn build_document(lines: &[Line]) -> Result<Vec<u8>, ExportError> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();

    let body_font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });
    let table_font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! {
            "F1" => body_font_id,
            "F2" => table_font_id,
        },
    });

    let mut page_ids: Vec<Object> = Vec::new();
    for operations in paginate(lines) {
        let content = Content { operations };
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode()?));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        page_ids.push(page_id.into());
    }

    let page_count = page_ids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => page_ids,
            "Count" => page_count,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), PAGE_WIDTH.into(), PAGE_HEIGHT.into()],
        }),
    );

    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    doc.compress();

    let mut buffer = Vec::new();
    doc.save_to(&mut buffer)?;
    Ok(buffer)
}

fn paginate(lines: &[Line]) -> Vec<Vec<Operation>> {
    let mut pages = Vec::new();
    let mut operations: Vec<Operation> = Vec::new();
    let mut y = TOP_Y;

    for line in lines {
        if y < MIN_Y {
            pages.push(std::mem::take(&mut operations));
            y = TOP_Y;
        }
        if !line.text.is_empty() {
            operations.push(Operation::new("BT", vec![]));
            operations.push(Operation::new(
                "Tf",
                vec![line.font.name().into(), line.size.into()],
            ));
            operations.push(Operation::new("Td", vec![MARGIN_X.into(), y.into()]));
            operations.push(Operation::new(
                "Tj",
                vec![Object::string_literal(sanitize(&line.text))],
            ));
            operations.push(Operation::new("ET", vec![]));
        }
        y -= line.size + 4;
    }

    if !operations.is_empty() {
        pages.push(operations);
    }
    // A document always carries at least one page.
    if pages.is_empty() {
        pages.push(Vec::new());
    }
    pages
}

/// The standard Type1 fonts only cover ASCII reliably.
fn sanitize(text: &str) -> String {
    text.chars()
        .map(|c| if matches!(c, ' '..='~') { c } else { '?' })
        .collect()
}
