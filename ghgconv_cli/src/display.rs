use comfy_table::{presets::NOTHING, *};
use ghgconv::pipeline::StageSummary;
use ghgconv::report::Report;
use itertools::Itertools;

use crate::cli::JobOutcome;

/// Maximum number of failed checks listed individually.
const MAX_FAILURES_SHOWN: usize = 20;

fn new_table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(NOTHING)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(
            header
                .into_iter()
                .map(|h| Cell::new(h).add_attribute(Attribute::Bold))
                .collect_vec(),
        )
        .set_style(comfy_table::TableComponent::BottomBorder, '─')
        .set_style(comfy_table::TableComponent::MiddleHeaderIntersections, '─')
        .set_style(comfy_table::TableComponent::HeaderLines, '─')
        .set_style(comfy_table::TableComponent::BottomBorderIntersections, '─')
        .set_style(comfy_table::TableComponent::TopBorder, '─')
        .set_style(comfy_table::TableComponent::TopBorderIntersections, '─');
    table
}

pub fn display_stage_summary(summary: &[StageSummary]) {
    let mut table = new_table(vec!["Stage", "Rows in", "Rows out"]);
    for stage in summary {
        table.add_row(vec![
            stage.stage.to_string(),
            stage.rows_in.to_string(),
            stage.rows_out.to_string(),
        ]);
    }
    println!("\n{table}");
}

pub fn display_report(report: &Report) {
    let failures = report.failures().collect_vec();
    let mut table = new_table(vec!["Outcome", "Count"]);
    table
        .add_row(vec![
            "Consistency checks".to_string(),
            report.findings.len().to_string(),
        ])
        .add_row(vec![
            "Failed consistency checks".to_string(),
            failures.len().to_string(),
        ])
        .add_row(vec![
            "Downscale warnings".to_string(),
            report.downscale_warnings.len().to_string(),
        ])
        .add_row(vec![
            "Conflicts".to_string(),
            report.conflicts.len().to_string(),
        ])
        .add_row(vec![
            "Skipped rows".to_string(),
            report.skipped.len().to_string(),
        ]);
    println!("\n{table}");

    if failures.is_empty() {
        return;
    }
    let mut table = new_table(vec![
        "Category",
        "Entity",
        "Time",
        "Reported",
        "Derived",
        "Discrepancy",
    ]);
    for finding in failures.iter().take(MAX_FAILURES_SHOWN) {
        table.add_row(vec![
            finding.key.category.clone(),
            finding.key.entity.clone(),
            finding.key.time.to_string(),
            finding.reported.to_string(),
            finding.derived.to_string(),
            format!("{:+}", finding.discrepancy),
        ]);
    }
    println!("\nFailed consistency checks:\n{table}");
    if failures.len() > MAX_FAILURES_SHOWN {
        println!(
            "... and {} more (see the JSON report)",
            failures.len() - MAX_FAILURES_SHOWN
        );
    }
}

pub fn display_batch(outcomes: &[JobOutcome]) {
    let mut table = new_table(vec![
        "Job",
        "Rows",
        "Failed checks",
        "Downscale warnings",
        "Conflicts",
        "Status",
    ]);
    for outcome in outcomes {
        match &outcome.result {
            Ok(report) => table.add_row(vec![
                outcome.name.clone(),
                outcome.rows.to_string(),
                report.failures().count().to_string(),
                report.downscale_warnings.len().to_string(),
                report.conflicts.len().to_string(),
                "ok".to_string(),
            ]),
            Err(err) => table.add_row(vec![
                outcome.name.clone(),
                String::new(),
                String::new(),
                String::new(),
                String::new(),
                format!("error: {err}"),
            ]),
        };
    }
    println!("\n{table}");
}
