//! Output formatting utilities for CLI commands

use adeflow::{ArtifactStatus, StageDecision, StageStatus};
use adeflow_store::ArtifactState;
use comfy_table::{presets::UTF8_FULL_CONDENSED, Cell, Color, ContentArrangement, Table};

/// Format a duration in milliseconds
///
/// Examples:
/// - 850 -> "850ms"
/// - 12500 -> "12.5s"
/// - 125000 -> "2m 5s"
pub fn format_duration_ms(ms: u64) -> String {
    if ms < 1_000 {
        format!("{}ms", ms)
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1_000.0)
    } else {
        format!("{}m {}s", ms / 60_000, (ms % 60_000) / 1_000)
    }
}

pub fn status_color(status: StageStatus) -> Color {
    match status {
        StageStatus::Ran => Color::Green,
        StageStatus::Skipped => Color::Grey,
        StageStatus::Failed => Color::Red,
        StageStatus::NotReached => Color::DarkGrey,
    }
}

pub fn decision_label(decision: &StageDecision) -> (String, Color) {
    match decision {
        StageDecision::WouldSkip => ("skip".to_string(), Color::Grey),
        StageDecision::WouldRun => ("run".to_string(), Color::Green),
        StageDecision::BlockedBy { artifact } => (format!("blocked: {}", artifact), Color::Red),
        StageDecision::NotReached => ("not reached".to_string(), Color::DarkGrey),
    }
}

/// `3/4 present` style summary of artifact states.
pub fn artifact_summary(artifacts: &[ArtifactStatus]) -> String {
    if artifacts.is_empty() {
        return "-".to_string();
    }
    let present = artifacts
        .iter()
        .filter(|a| a.state == ArtifactState::Present)
        .count();
    let partial = artifacts
        .iter()
        .filter(|a| a.state == ArtifactState::Partial)
        .count();
    if partial > 0 {
        format!("{}/{} present, {} partial", present, artifacts.len(), partial)
    } else {
        format!("{}/{} present", present, artifacts.len())
    }
}

/// Print a table with custom column colors
pub fn print_table_colored(headers: &[&str], rows: Vec<Vec<(String, Option<Color>)>>) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic);

    let header_cells: Vec<Cell> = headers
        .iter()
        .map(|h| Cell::new(h).fg(Color::Cyan))
        .collect();
    table.set_header(header_cells);

    for row in rows {
        let cells: Vec<Cell> = row
            .into_iter()
            .map(|(text, color)| match color {
                Some(c) => Cell::new(text).fg(c),
                None => Cell::new(text),
            })
            .collect();
        table.add_row(cells);
    }

    println!("{}", table);
}
