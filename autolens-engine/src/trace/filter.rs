//! Filtered, sorted view over the trace model
//!
//! The view holds source row indices only. Signal rows are never filtered
//! on their own: they follow their parent frame.

use crate::trace::entry::{Column, TraceEntry};
use crate::trace::model::TraceModel;
use std::cmp::Ordering;

/// Columns searched by the free-text filter
const SEARCH_COLUMNS: [Column; 6] = [
    Column::Name,
    Column::Id,
    Column::Channel,
    Column::EventType,
    Column::Direction,
    Column::Data,
];

/// Filter and sort settings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceFilter {
    text: String,
    sort: Option<(Column, bool)>,
}

impl TraceFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the case-insensitive filter text; empty accepts everything
    pub fn set_filter_text(&mut self, text: impl Into<String>) {
        self.text = text.into();
    }

    pub fn filter_text(&self) -> &str {
        &self.text
    }

    /// Sort by a column
    pub fn sort_by_column(&mut self, column: Column, ascending: bool) {
        self.sort = Some((column, ascending));
    }

    /// Back to source order
    pub fn clear_sort(&mut self) {
        self.sort = None;
    }

    /// True if a frame row passes the filter
    pub fn accepts(&self, entry: &TraceEntry) -> bool {
        if self.text.is_empty() {
            return true;
        }
        let needle = self.text.to_lowercase();
        SEARCH_COLUMNS
            .iter()
            .any(|c| entry.column_text(*c).to_lowercase().contains(&needle))
    }

    /// Source rows that pass the filter, in view order
    pub fn view(&self, model: &TraceModel) -> Vec<usize> {
        let entries = model.entries();
        let mut rows: Vec<usize> = (0..entries.len())
            .filter(|&row| self.accepts(&entries[row]))
            .collect();

        if let Some((column, ascending)) = self.sort {
            rows.sort_by(|&a, &b| {
                let ord = compare_cells(
                    column,
                    entries[a].column_text(column),
                    entries[b].column_text(column),
                );
                if ascending {
                    ord
                } else {
                    ord.reverse()
                }
            });
        }
        rows
    }
}

/// Column-aware comparison of two display strings
///
/// Falls back to case-insensitive text when either side does not parse.
pub fn compare_cells(column: Column, left: &str, right: &str) -> Ordering {
    let numeric = match column {
        Column::Time => left
            .trim()
            .parse::<f64>()
            .ok()
            .zip(right.trim().parse::<f64>().ok())
            .and_then(|(l, r)| l.partial_cmp(&r)),
        Column::Id => parse_hex_id(left)
            .zip(parse_hex_id(right))
            .map(|(l, r)| l.cmp(&r)),
        Column::Channel | Column::Dlc => left
            .trim()
            .parse::<i64>()
            .ok()
            .zip(right.trim().parse::<i64>().ok())
            .map(|(l, r)| l.cmp(&r)),
        _ => None,
    };
    numeric.unwrap_or_else(|| left.to_lowercase().cmp(&right.to_lowercase()))
}

fn parse_hex_id(text: &str) -> Option<u32> {
    let text = text.trim();
    let text = text
        .strip_suffix('h')
        .or_else(|| text.strip_suffix('H'))
        .unwrap_or(text);
    u32::from_str_radix(text, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::SignalDatabase;
    use crate::types::CanFrame;

    fn model() -> TraceModel {
        let db = SignalDatabase::new();
        let mut model = TraceModel::new();
        model.add_entries(vec![
            TraceEntry::new(CanFrame::classic(0x7DF, &[0x02, 0x01]).at(3_000_000), &db),
            TraceEntry::new(CanFrame::classic(0x0C4, &[0xAB]).on_channel(2).at(1_000_000), &db),
            TraceEntry::new(CanFrame::classic(0x1A0, &[0x10]).at(20_000_000), &db),
        ]);
        model
    }

    #[test]
    fn test_filter_is_case_insensitive() {
        let model = model();
        let mut filter = TraceFilter::new();
        assert_eq!(filter.view(&model), vec![0, 1, 2]);

        filter.set_filter_text("ab");
        assert_eq!(filter.view(&model), vec![1]);
        filter.set_filter_text("7df");
        assert_eq!(filter.view(&model), vec![0]);
        filter.set_filter_text("nothing");
        assert!(filter.view(&model).is_empty());
    }

    #[test]
    fn test_column_sorting() {
        let model = model();
        let mut filter = TraceFilter::new();

        filter.sort_by_column(Column::Id, true);
        assert_eq!(filter.view(&model), vec![1, 2, 0]);

        // "20.000000" sorts after "3.000000" numerically
        filter.sort_by_column(Column::Time, false);
        assert_eq!(filter.view(&model), vec![2, 0, 1]);

        filter.sort_by_column(Column::Channel, false);
        assert_eq!(filter.view(&model)[0], 1);

        filter.clear_sort();
        assert_eq!(filter.view(&model), vec![0, 1, 2]);
    }

    #[test]
    fn test_compare_fallback() {
        assert_eq!(compare_cells(Column::Id, "0C4h", "7DFh"), Ordering::Less);
        assert_eq!(compare_cells(Column::Dlc, "x", "Y"), Ordering::Less);
        assert_eq!(compare_cells(Column::Name, "abc", "ABD"), Ordering::Less);
    }
}
