//! Plain text rendering for terminal output.

use chrono::{DateTime, Utc};

use supadesk_core::auth::SessionStatus;
use supadesk_core::models::Report;
use supadesk_core::utils::{format_cell, format_expiry, truncate_string};

/// Lay out a report as an aligned text table. Cells wider than `max_width`
/// characters are truncated.
pub fn render_table(report: &Report, max_width: usize) -> String {
    if report.is_empty() {
        return format!("{}: no rows\n", report.table);
    }

    let cells: Vec<Vec<String>> = report
        .rows
        .iter()
        .map(|row| {
            report
                .columns
                .iter()
                .map(|col| {
                    let text = row.get(col).map(format_cell).unwrap_or_default();
                    truncate_string(&text, max_width)
                })
                .collect()
        })
        .collect();

    let widths: Vec<usize> = report
        .columns
        .iter()
        .enumerate()
        .map(|(i, col)| {
            cells
                .iter()
                .map(|row| row[i].chars().count())
                .chain(std::iter::once(truncate_string(col, max_width).chars().count()))
                .max()
                .unwrap_or(0)
        })
        .collect();

    let header: Vec<String> = report
        .columns
        .iter()
        .map(|col| truncate_string(col, max_width))
        .collect();

    let mut out = String::new();
    push_line(&mut out, &header, &widths);
    let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    push_line(&mut out, &rule, &widths);
    for row in &cells {
        push_line(&mut out, row, &widths);
    }

    let noun = if report.len() == 1 { "row" } else { "rows" };
    out.push_str(&format!("({} {})\n", report.len(), noun));
    out
}

fn push_line(out: &mut String, cells: &[String], widths: &[usize]) {
    let line: Vec<String> = cells
        .iter()
        .zip(widths)
        .map(|(cell, width)| format!("{:<width$}", cell, width = *width))
        .collect();
    out.push_str(line.join("  ").trim_end());
    out.push('\n');
}

pub fn render_status(status: &SessionStatus, now: DateTime<Utc>) -> String {
    let mut out = format!("State: {}\n", status.state);
    if let Some(ref identity) = status.identity {
        out.push_str(&format!("User:  {} ({})\n", identity.display_name(), identity.id));
    }
    if let Some(expires_at) = status.expires_at {
        out.push_str(&format!("Token: {}\n", format_expiry(expires_at, now)));
    }
    out
}
