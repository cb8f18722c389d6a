//! Trace summary report
//!
//! Frame counts per (channel, id) with first/last timestamps and the mean
//! period, rendered as an ASCII table or JSON.

use autolens_engine::trace::entry::format_id;
use autolens_engine::{CanFrame, SignalDatabase};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdSummary {
    pub channel: u8,
    pub id: String,
    pub name: String,
    pub count: usize,
    pub first_ms: f64,
    pub last_ms: f64,
    /// Mean gap between consecutive frames, None below two frames
    pub mean_period_ms: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceSummary {
    pub source: String,
    pub total_frames: usize,
    pub error_frames: usize,
    pub fd_frames: usize,
    pub duration_ms: f64,
    pub ids: Vec<IdSummary>,
}

#[derive(Debug, Default)]
struct Tally {
    is_extended: bool,
    count: usize,
    first_ns: u64,
    last_ns: u64,
}

/// Summarise `frames`, naming ids found in `db`
pub fn summarize(source: &str, frames: &[CanFrame], db: &SignalDatabase) -> TraceSummary {
    let mut tallies: BTreeMap<(u8, u32), Tally> = BTreeMap::new();
    let mut error_frames = 0;
    let mut fd_frames = 0;

    for frame in frames {
        if frame.is_error_frame {
            error_frames += 1;
            continue;
        }
        if frame.is_fd {
            fd_frames += 1;
        }
        let tally = tallies.entry((frame.channel, frame.id)).or_insert_with(|| Tally {
            is_extended: frame.is_extended,
            first_ns: frame.timestamp_ns,
            ..Default::default()
        });
        tally.count += 1;
        tally.first_ns = tally.first_ns.min(frame.timestamp_ns);
        tally.last_ns = tally.last_ns.max(frame.timestamp_ns);
    }

    let ids = tallies
        .into_iter()
        .map(|((channel, id), tally)| IdSummary {
            channel,
            id: format_id(id, tally.is_extended),
            name: db
                .message_by_id(id)
                .map(|m| m.name.clone())
                .unwrap_or_default(),
            count: tally.count,
            first_ms: tally.first_ns as f64 / 1e6,
            last_ms: tally.last_ns as f64 / 1e6,
            mean_period_ms: (tally.count > 1)
                .then(|| (tally.last_ns - tally.first_ns) as f64 / 1e6 / (tally.count - 1) as f64),
        })
        .collect();

    let first = frames.iter().map(|f| f.timestamp_ns).min().unwrap_or(0);
    let last = frames.iter().map(|f| f.timestamp_ns).max().unwrap_or(0);

    TraceSummary {
        source: source.to_string(),
        total_frames: frames.len(),
        error_frames,
        fd_frames,
        duration_ms: (last - first) as f64 / 1e6,
        ids,
    }
}

/// Render the summary as an ASCII table
pub fn render_text(summary: &TraceSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "═══════════════════════════════════════════════");
    let _ = writeln!(out, "  Trace summary: {}", summary.source);
    let _ = writeln!(out, "═══════════════════════════════════════════════");
    let _ = writeln!(
        out,
        "  Frames: {}  (FD: {}, error: {})   Duration: {:.3} ms\n",
        summary.total_frames, summary.fd_frames, summary.error_frames, summary.duration_ms
    );
    let _ = writeln!(
        out,
        "  {:>3}  {:<10} {:<24} {:>8} {:>12}",
        "Chn", "ID", "Name", "Count", "Period (ms)"
    );
    let _ = writeln!(out, "  {}", "─".repeat(61));
    for row in &summary.ids {
        let period = row
            .mean_period_ms
            .map(|p| format!("{:.3}", p))
            .unwrap_or_else(|| "-".to_string());
        let _ = writeln!(
            out,
            "  {:>3}  {:<10} {:<24} {:>8} {:>12}",
            row.channel, row.id, row.name, row.count, period
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use autolens_engine::signals::{MessageDefinition, SignalDefinition};

    fn frames() -> Vec<CanFrame> {
        vec![
            CanFrame::classic(0x0C4, &[1]).at(0),
            CanFrame::classic(0x0C4, &[2]).at(10_000_000),
            CanFrame::classic(0x0C4, &[3]).at(20_000_000),
            CanFrame::classic(0x18DB33F1, &[4]).on_channel(2).at(5_000_000),
            CanFrame::error_frame(1, 15_000_000),
        ]
    }

    #[test]
    fn test_counts_per_channel_and_id() {
        let db = SignalDatabase::from_messages(vec![MessageDefinition {
            id: 0x0C4,
            is_extended: false,
            name: "EngineData".to_string(),
            dlc: 8,
            transmitter: String::new(),
            signals: vec![SignalDefinition::new("EngineRPM", 0, 16)],
        }]);
        let summary = summarize("t.asc", &frames(), &db);

        assert_eq!(summary.total_frames, 5);
        assert_eq!(summary.error_frames, 1);
        assert_eq!(summary.duration_ms, 20.0);
        assert_eq!(summary.ids.len(), 2);

        let engine = &summary.ids[0];
        assert_eq!((engine.channel, engine.id.as_str()), (1, "0C4h"));
        assert_eq!(engine.name, "EngineData");
        assert_eq!(engine.count, 3);
        assert_eq!(engine.mean_period_ms, Some(10.0));

        let diag = &summary.ids[1];
        assert_eq!((diag.channel, diag.id.as_str()), (2, "18DB33F1h"));
        assert_eq!(diag.mean_period_ms, None);
    }

    #[test]
    fn test_text_rendering() {
        let summary = summarize("t.asc", &frames(), &SignalDatabase::new());
        let text = render_text(&summary);
        assert!(text.contains("Trace summary: t.asc"));
        assert!(text.contains("18DB33F1h"));
        assert!(text.contains("10.000"));
    }
}
