//! Output formatting and input parsing for the pagepulse commands

use comfy_table::{Cell, Color, ContentArrangement, Row, Table};
use pagepulse_core::buffer::{BufferStats, FlushOutcome};
use pagepulse_core::models::ViewEvent;
use pagepulse_core::query::{ArticleViews, DailyViews};
use pagepulse_core::settings::SiteConfig;
use serde_json::json;

// ============================================================================
// Ingest
// ============================================================================

/// Counters for one `ingest` run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestSummary {
    pub lines: usize,
    pub enqueued: usize,
    pub skipped: usize,
    pub interrupted: bool,
}

/// Parse one JSON line into an event; blank lines yield `None`
pub fn parse_event_line(line: &str) -> Result<Option<ViewEvent>, serde_json::Error> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(line).map(Some)
}

fn describe_outcome(outcome: FlushOutcome) -> String {
    match outcome {
        FlushOutcome::Empty => "nothing left to flush".to_string(),
        FlushOutcome::AlreadyFlushing => "flush still in progress".to_string(),
        FlushOutcome::Flushed(n) => format!("flushed {} events", n),
        FlushOutcome::Requeued(n) => format!("{} events could not be written", n),
    }
}

pub fn format_ingest_summary(
    summary: &IngestSummary,
    outcome: FlushOutcome,
    stats: &BufferStats,
    json: bool,
) -> String {
    if json {
        let value = json!({
            "lines": summary.lines,
            "enqueued": summary.enqueued,
            "skipped": summary.skipped,
            "interrupted": summary.interrupted,
            "flushes": stats.flushes,
            "flushed_events": stats.flushed_events,
            "failed_flushes": stats.failed_flushes,
            "truncated_fields": stats.truncated_fields,
            "pending": stats.pending,
        });
        return serde_json::to_string_pretty(&value).unwrap_or_else(|_| "{}".to_string());
    }

    let mut lines = vec![];
    lines.push(format!("Lines read:       {}", summary.lines));
    lines.push(format!("Events enqueued:  {}", summary.enqueued));
    lines.push(format!("Lines skipped:    {}", summary.skipped));
    lines.push(format!(
        "Events written:   {} in {} flushes",
        stats.flushed_events, stats.flushes
    ));
    if stats.failed_flushes > 0 {
        lines.push(format!("Failed flushes:   {}", stats.failed_flushes));
    }
    if stats.truncated_fields > 0 {
        lines.push(format!("Fields truncated: {}", stats.truncated_fields));
    }
    lines.push(format!("Final flush:      {}", describe_outcome(outcome)));
    if summary.interrupted {
        lines.push("Stopped early on interrupt.".to_string());
    }
    lines.join("\n")
}

// ============================================================================
// Stats
// ============================================================================

fn header(table: &mut Table, names: &[&str], no_color: bool) {
    if no_color {
        table.set_header(names.to_vec());
    } else {
        table.set_header(
            names
                .iter()
                .map(|name| Cell::new(name).fg(Color::Cyan))
                .collect::<Vec<_>>(),
        );
    }
}

/// Stats report (human table or JSON)
pub fn format_stats(
    total: i64,
    top: &[ArticleViews],
    daily: &[DailyViews],
    json: bool,
    no_color: bool,
) -> String {
    if json {
        let value = json!({
            "total_views": total,
            "top_articles": top,
            "daily_views": daily,
        });
        return serde_json::to_string_pretty(&value).unwrap_or_else(|_| "{}".to_string());
    }

    let mut out = vec![format!("Total views: {}", total)];

    if top.is_empty() {
        out.push("No article views recorded.".to_string());
    } else {
        let mut table = Table::new();
        table.set_content_arrangement(ContentArrangement::Dynamic);
        header(&mut table, &["#", "Article", "Views"], no_color);
        for (rank, row) in top.iter().enumerate() {
            let article = row
                .article_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".to_string());
            table.add_row(Row::from(vec![
                (rank + 1).to_string(),
                article,
                row.views.to_string(),
            ]));
        }
        out.push(table.to_string());
    }

    if !daily.is_empty() {
        let mut table = Table::new();
        table.set_content_arrangement(ContentArrangement::Dynamic);
        header(&mut table, &["Day", "Views"], no_color);
        for row in daily {
            table.add_row(Row::from(vec![row.day.clone(), row.views.to_string()]));
        }
        out.push(table.to_string());
    }

    out.join("\n\n")
}

// ============================================================================
// Settings
// ============================================================================

pub fn format_settings(config: &SiteConfig, json: bool, no_color: bool) -> String {
    if json {
        return serde_json::to_string_pretty(config).unwrap_or_else(|_| "{}".to_string());
    }

    if config.is_empty() {
        return "No settings stored.".to_string();
    }

    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    header(&mut table, &["Name", "Value"], no_color);
    for (name, value) in config {
        table.add_row(Row::from(vec![
            name.clone(),
            value.clone().unwrap_or_else(|| "(null)".to_string()),
        ]));
    }
    table.to_string()
}
