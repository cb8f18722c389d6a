//! Two-level trace model
//!
//! Frame rows sit at the root; each frame owns its decoded signals as child
//! rows. Rows are addressed with [`RowRef`] so the parent of a signal row is
//! known without any lookup.
//!
//! The model is bounded at [`MAX_ROWS`] frames. When a batch would push it
//! past the cap, at least [`PURGE_CHUNK`] of the oldest rows go in one
//! removal. Every structural change is reported as a [`ModelChange`] to
//! subscribers, one range per kind and batch.

use crate::trace::entry::{Column, TraceEntry};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::HashMap;
use std::fmt;

/// Frame-row cap
pub const MAX_ROWS: usize = 100_000;

/// Minimum number of rows evicted at once
pub const PURGE_CHUNK: usize = 5_000;

/// How incoming frames map to rows
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DisplayMode {
    /// Every frame becomes a new row
    #[default]
    Append,
    /// One row per fingerprint, updated in place
    InPlace,
}

/// Address of a row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RowRef {
    Frame(usize),
    Signal { frame: usize, signal: usize },
}

impl RowRef {
    /// Parent frame of a signal row, `None` for frame rows
    pub fn parent(self) -> Option<RowRef> {
        match self {
            RowRef::Frame(_) => None,
            RowRef::Signal { frame, .. } => Some(RowRef::Frame(frame)),
        }
    }
}

/// Structural change notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelChange {
    /// All rows replaced
    Reset,
    /// Frame rows `first..=last` removed
    RowsRemoved { first: usize, last: usize },
    /// Frame rows `first..=last` inserted
    RowsInserted { first: usize, last: usize },
    /// Frame rows `first..=last` changed content
    RowsChanged { first: usize, last: usize },
    /// Signal rows `first..=last` of `parent` removed
    ChildrenRemoved { parent: usize, first: usize, last: usize },
    /// Signal rows `first..=last` of `parent` inserted
    ChildrenInserted { parent: usize, first: usize, last: usize },
}

/// RGB colour value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Color(pub u8, pub u8, pub u8);

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.0, self.1, self.2)
    }
}

pub mod palette {
    use super::Color;

    pub const ERROR_TEXT: Color = Color(0xff, 0x66, 0x66);
    pub const ERROR_BACKGROUND: Color = Color(0x20, 0x0f, 0x10);
    pub const TX_TEXT: Color = Color(0x7a, 0x9a, 0xb8);
    pub const DECODED_NAME: Color = Color(0x56, 0xb4, 0xf5);
    pub const FD_EVENT: Color = Color(0xff, 0xd0, 0x70);
    pub const CHANNEL_2: Color = Color(0xff, 0x8c, 0x4d);
    pub const CHANNEL_OTHER: Color = Color(0x4d, 0xa8, 0xff);
    pub const DEFAULT_TEXT: Color = Color(0xc8, 0xda, 0xf0);
    pub const EVEN_ROW: Color = Color(0x0f, 0x18, 0x25);
    pub const ODD_ROW: Color = Color(0x12, 0x1e, 0x2e);
    pub const SIGNAL_TEXT: Color = Color(0x7d, 0xcf, 0xff);
    pub const SIGNAL_BACKGROUND: Color = Color(0x0c, 0x14, 0x22);
    pub const HEADER_TEXT: Color = Color(0x90, 0xa8, 0xc4);
    pub const HEADER_BACKGROUND: Color = Color(0x0a, 0x10, 0x18);
}

/// Horizontal text alignment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alignment {
    Left,
    Center,
    Right,
}

impl Alignment {
    /// Alignment used for a column
    pub fn for_column(column: Column) -> Self {
        match column {
            Column::Time => Alignment::Right,
            Column::Channel | Column::Direction | Column::Dlc => Alignment::Center,
            _ => Alignment::Left,
        }
    }
}

/// Observable groups of a cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Display,
    Foreground,
    Background,
    Alignment,
    IsFrame,
    IsError,
    IsFd,
    IsDecoded,
    Channel,
    SignalName,
    SignalValue,
    SignalRaw,
}

/// Value of a role
#[derive(Debug, Clone, PartialEq)]
pub enum RoleValue<'a> {
    Text(&'a str),
    Color(Color),
    Alignment(Alignment),
    Bool(bool),
    Int(i64),
}

/// The trace model
#[derive(Debug, Default)]
pub struct TraceModel {
    rows: Vec<TraceEntry>,
    mode: DisplayMode,
    /// Fingerprint -> row, maintained in in-place mode only
    in_place_rows: HashMap<u64, usize>,
    subscribers: Vec<Sender<ModelChange>>,
}

impl TraceModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive structural change notifications
    pub fn subscribe(&mut self) -> Receiver<ModelChange> {
        let (tx, rx) = unbounded();
        self.subscribers.push(tx);
        rx
    }

    fn notify(&mut self, change: ModelChange) {
        self.subscribers.retain(|tx| tx.send(change).is_ok());
    }

    pub fn display_mode(&self) -> DisplayMode {
        self.mode
    }

    /// Switch display mode
    ///
    /// Entering in-place mode collapses existing rows to one per
    /// fingerprint: the first row position is kept with the latest content.
    pub fn set_display_mode(&mut self, mode: DisplayMode) {
        if self.mode == mode {
            return;
        }
        self.mode = mode;
        match mode {
            DisplayMode::Append => self.in_place_rows.clear(),
            DisplayMode::InPlace => {
                let mut collapsed: Vec<TraceEntry> = Vec::with_capacity(self.rows.len());
                let mut index: HashMap<u64, usize> = HashMap::new();
                for entry in self.rows.drain(..) {
                    match index.get(&entry.fingerprint()) {
                        Some(&row) => collapsed[row] = entry,
                        None => {
                            index.insert(entry.fingerprint(), collapsed.len());
                            collapsed.push(entry);
                        }
                    }
                }
                self.rows = collapsed;
                self.in_place_rows = index;
                self.notify(ModelChange::Reset);
            }
        }
        log::debug!("Trace display mode {:?}, {} rows", mode, self.rows.len());
    }

    /// Number of frame rows
    pub fn frame_count(&self) -> usize {
        self.rows.len()
    }

    /// Number of child rows under `parent`
    pub fn row_count(&self, parent: Option<RowRef>) -> usize {
        match parent {
            None => self.rows.len(),
            Some(RowRef::Frame(row)) => self.rows.get(row).map_or(0, |e| e.signals.len()),
            Some(RowRef::Signal { .. }) => 0,
        }
    }

    pub fn column_count(&self) -> usize {
        Column::ALL.len()
    }

    /// Frame row by position
    pub fn entry(&self, row: usize) -> Option<&TraceEntry> {
        self.rows.get(row)
    }

    /// All frame rows in display order
    pub fn entries(&self) -> &[TraceEntry] {
        &self.rows
    }

    /// Address of a child row, if it exists
    pub fn index(&self, row: usize, parent: Option<RowRef>) -> Option<RowRef> {
        match parent {
            None => (row < self.rows.len()).then_some(RowRef::Frame(row)),
            Some(RowRef::Frame(frame)) => {
                let count = self.rows.get(frame)?.signals.len();
                (row < count).then_some(RowRef::Signal { frame, signal: row })
            }
            Some(RowRef::Signal { .. }) => None,
        }
    }

    /// Role value of a cell
    pub fn data(&self, at: RowRef, column: Column, role: Role) -> Option<RoleValue<'_>> {
        match at {
            RowRef::Signal { frame, signal } => {
                let sig = self.rows.get(frame)?.signals.get(signal)?;
                match role {
                    Role::Display => Some(RoleValue::Text(sig.column_text(column))),
                    Role::Foreground => Some(RoleValue::Color(palette::SIGNAL_TEXT)),
                    Role::Background => Some(RoleValue::Color(palette::SIGNAL_BACKGROUND)),
                    Role::Alignment => Some(RoleValue::Alignment(Alignment::for_column(column))),
                    Role::IsFrame => Some(RoleValue::Bool(false)),
                    Role::SignalName => Some(RoleValue::Text(&sig.name)),
                    Role::SignalValue => Some(RoleValue::Text(&sig.value)),
                    Role::SignalRaw => Some(RoleValue::Text(&sig.raw)),
                    _ => None,
                }
            }
            RowRef::Frame(row) => {
                let entry = self.rows.get(row)?;
                let frame = &entry.frame;
                match role {
                    Role::Display => Some(RoleValue::Text(entry.column_text(column))),
                    Role::Foreground => Some(RoleValue::Color(frame_foreground(entry, column))),
                    Role::Background => Some(RoleValue::Color(if frame.is_error_frame {
                        palette::ERROR_BACKGROUND
                    } else if row % 2 == 0 {
                        palette::EVEN_ROW
                    } else {
                        palette::ODD_ROW
                    })),
                    Role::Alignment => Some(RoleValue::Alignment(Alignment::for_column(column))),
                    Role::IsFrame => Some(RoleValue::Bool(true)),
                    Role::IsError => Some(RoleValue::Bool(frame.is_error_frame)),
                    Role::IsFd => Some(RoleValue::Bool(frame.is_fd)),
                    Role::IsDecoded => Some(RoleValue::Bool(entry.is_decoded())),
                    Role::Channel => Some(RoleValue::Int(frame.channel as i64)),
                    _ => None,
                }
            }
        }
    }

    /// Header role value of a column
    pub fn header_data(&self, column: Column, role: Role) -> Option<RoleValue<'static>> {
        match role {
            Role::Display => Some(RoleValue::Text(column.header())),
            Role::Alignment => Some(RoleValue::Alignment(Alignment::for_column(column))),
            Role::Foreground => Some(RoleValue::Color(palette::HEADER_TEXT)),
            Role::Background => Some(RoleValue::Color(palette::HEADER_BACKGROUND)),
            _ => None,
        }
    }

    /// Insert a batch
    ///
    /// Emits at most one removal range (eviction) and one insertion range
    /// for the whole batch. In-place updates add one changed range and
    /// child notifications on the parents whose signal count changed.
    pub fn add_entries(&mut self, entries: Vec<TraceEntry>) {
        if entries.is_empty() {
            return;
        }
        match self.mode {
            DisplayMode::Append => self.append(entries),
            DisplayMode::InPlace => self.add_in_place(entries),
        }
    }

    /// Remove every row
    pub fn clear(&mut self) {
        if self.rows.is_empty() {
            return;
        }
        self.rows.clear();
        self.in_place_rows.clear();
        self.notify(ModelChange::Reset);
    }

    /// Replace all rows in one reset
    pub fn replace_all(&mut self, entries: Vec<TraceEntry>) {
        self.rows.clear();
        self.in_place_rows.clear();
        self.notify(ModelChange::Reset);
        self.add_entries(entries);
    }

    fn append(&mut self, mut entries: Vec<TraceEntry>) {
        self.evict_for(&mut entries);
        if entries.is_empty() {
            return;
        }
        let first = self.rows.len();
        let last = first + entries.len() - 1;
        self.rows.append(&mut entries);
        self.notify(ModelChange::RowsInserted { first, last });
    }

    /// Make room for `incoming`
    ///
    /// Removes `max(overflow, PURGE_CHUNK)` rows: existing rows oldest
    /// first, then the head of the incoming batch.
    fn evict_for(&mut self, incoming: &mut Vec<TraceEntry>) {
        let total = self.rows.len() + incoming.len();
        if total <= MAX_ROWS {
            return;
        }
        let to_remove = (total - MAX_ROWS).max(PURGE_CHUNK).min(total);
        let from_rows = to_remove.min(self.rows.len());
        let from_batch = to_remove - from_rows;

        if from_rows > 0 {
            self.rows.drain(..from_rows);
            self.notify(ModelChange::RowsRemoved {
                first: 0,
                last: from_rows - 1,
            });
        }
        if from_batch > 0 {
            incoming.drain(..from_batch);
        }
        log::debug!(
            "Trace model evicted {} rows ({} existing, {} incoming)",
            to_remove,
            from_rows,
            from_batch
        );

        if self.mode == DisplayMode::InPlace {
            self.rebuild_in_place_index();
        }
    }

    fn rebuild_in_place_index(&mut self) {
        self.in_place_rows = self
            .rows
            .iter()
            .enumerate()
            .map(|(row, entry)| (entry.fingerprint(), row))
            .collect();
    }

    fn add_in_place(&mut self, entries: Vec<TraceEntry>) {
        let mut fresh: Vec<TraceEntry> = Vec::new();
        let mut fresh_index: HashMap<u64, usize> = HashMap::new();
        let mut changed: Option<(usize, usize)> = None;
        let mut child_changes: Vec<ModelChange> = Vec::new();

        for entry in entries {
            let key = entry.fingerprint();
            if let Some(&row) = self.in_place_rows.get(&key) {
                let old_count = self.rows[row].signals.len();
                let new_count = entry.signals.len();
                if new_count < old_count {
                    child_changes.push(ModelChange::ChildrenRemoved {
                        parent: row,
                        first: new_count,
                        last: old_count - 1,
                    });
                } else if new_count > old_count {
                    child_changes.push(ModelChange::ChildrenInserted {
                        parent: row,
                        first: old_count,
                        last: new_count - 1,
                    });
                }
                self.rows[row] = entry;
                changed = Some(match changed {
                    Some((lo, hi)) => (lo.min(row), hi.max(row)),
                    None => (row, row),
                });
            } else if let Some(&pos) = fresh_index.get(&key) {
                fresh[pos] = entry;
            } else {
                fresh_index.insert(key, fresh.len());
                fresh.push(entry);
            }
        }

        for change in child_changes {
            self.notify(change);
        }
        if let Some((first, last)) = changed {
            self.notify(ModelChange::RowsChanged { first, last });
        }
        if fresh.is_empty() {
            return;
        }

        self.evict_for(&mut fresh);
        let first = self.rows.len();
        for entry in fresh {
            self.in_place_rows.insert(entry.fingerprint(), self.rows.len());
            self.rows.push(entry);
        }
        if self.rows.len() > first {
            self.notify(ModelChange::RowsInserted {
                first,
                last: self.rows.len() - 1,
            });
        }
    }
}

fn frame_foreground(entry: &TraceEntry, column: Column) -> Color {
    let frame = &entry.frame;
    if frame.is_error_frame {
        return palette::ERROR_TEXT;
    }
    if frame.is_tx_echo {
        return palette::TX_TEXT;
    }
    match column {
        Column::Name if entry.is_decoded() => palette::DECODED_NAME,
        Column::EventType if frame.is_fd => palette::FD_EVENT,
        Column::Channel if frame.channel == 2 => palette::CHANNEL_2,
        Column::Channel => palette::CHANNEL_OTHER,
        _ => palette::DEFAULT_TEXT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::{MessageDefinition, MuxIndicator, SignalDatabase, SignalDefinition};
    use crate::types::CanFrame;

    fn entries(ids: impl Iterator<Item = u32>) -> Vec<TraceEntry> {
        let db = SignalDatabase::new();
        ids.map(|id| TraceEntry::new(CanFrame::classic(id & 0x7FF, &[0]).at(id as u64), &db))
            .collect()
    }

    #[test]
    fn test_append_order_and_single_insert_notification() {
        let mut model = TraceModel::new();
        let changes = model.subscribe();
        model.add_entries(entries(0..10));
        model.add_entries(entries(10..15));

        assert_eq!(model.frame_count(), 15);
        let stamps: Vec<u64> = model.entries().iter().map(|e| e.frame.timestamp_ns).collect();
        assert_eq!(stamps, (0..15).collect::<Vec<_>>());

        let seen: Vec<_> = changes.try_iter().collect();
        assert_eq!(
            seen,
            vec![
                ModelChange::RowsInserted { first: 0, last: 9 },
                ModelChange::RowsInserted { first: 10, last: 14 },
            ]
        );
    }

    #[test]
    fn test_eviction_in_chunks() {
        let mut model = TraceModel::new();
        model.add_entries(entries(0..MAX_ROWS as u32));
        assert_eq!(model.frame_count(), MAX_ROWS);

        let changes = model.subscribe();
        model.add_entries(entries(MAX_ROWS as u32..MAX_ROWS as u32 + 1));

        assert_eq!(model.frame_count(), MAX_ROWS - PURGE_CHUNK + 1);
        assert_eq!(model.entry(0).unwrap().frame.timestamp_ns, PURGE_CHUNK as u64);
        let seen: Vec<_> = changes.try_iter().collect();
        assert_eq!(
            seen,
            vec![
                ModelChange::RowsRemoved { first: 0, last: PURGE_CHUNK - 1 },
                ModelChange::RowsInserted {
                    first: MAX_ROWS - PURGE_CHUNK,
                    last: MAX_ROWS - PURGE_CHUNK
                },
            ]
        );
    }

    #[test]
    fn test_oversized_batch_is_capped() {
        let mut model = TraceModel::new();
        model.add_entries(entries(0..(MAX_ROWS + 7000) as u32));
        assert!(model.frame_count() <= MAX_ROWS);
        assert_eq!(model.entry(0).unwrap().frame.timestamp_ns, 7000);
    }

    #[test]
    fn test_in_place_identity() {
        let mut model = TraceModel::new();
        model.set_display_mode(DisplayMode::InPlace);
        let changes = model.subscribe();

        let db = SignalDatabase::new();
        let batch: Vec<TraceEntry> = [0x100, 0x200, 0x100, 0x300, 0x200]
            .iter()
            .enumerate()
            .map(|(i, id)| TraceEntry::new(CanFrame::classic(*id, &[i as u8]), &db))
            .collect();
        model.add_entries(batch);

        assert_eq!(model.frame_count(), 3);
        assert_eq!(model.entry(0).unwrap().data, "02");
        assert_eq!(model.entry(1).unwrap().data, "04");

        model.add_entries(vec![TraceEntry::new(CanFrame::classic(0x200, &[9]), &db)]);
        assert_eq!(model.frame_count(), 3);
        assert_eq!(model.entry(1).unwrap().data, "09");

        let seen: Vec<_> = changes.try_iter().collect();
        assert_eq!(
            seen,
            vec![
                ModelChange::RowsInserted { first: 0, last: 2 },
                ModelChange::RowsChanged { first: 1, last: 1 },
            ]
        );
    }

    #[test]
    fn test_in_place_child_count_change() {
        let db = SignalDatabase::from_messages(vec![MessageDefinition {
            id: 0x200,
            is_extended: false,
            name: "Mux".to_string(),
            dlc: 8,
            transmitter: String::new(),
            signals: vec![
                SignalDefinition::new("Sel", 0, 4).with_mux(MuxIndicator::Selector),
                SignalDefinition::new("A", 8, 8).with_mux(MuxIndicator::Multiplexed(1)),
                SignalDefinition::new("B", 16, 8).with_mux(MuxIndicator::Multiplexed(2)),
                SignalDefinition::new("C", 24, 8).with_mux(MuxIndicator::Multiplexed(2)),
            ],
        }]);
        let mut model = TraceModel::new();
        model.set_display_mode(DisplayMode::InPlace);
        model.add_entries(vec![TraceEntry::new(CanFrame::classic(0x200, &[1, 0, 0, 0]), &db)]);
        let changes = model.subscribe();

        model.add_entries(vec![TraceEntry::new(CanFrame::classic(0x200, &[2, 0, 0, 0]), &db)]);
        assert_eq!(model.row_count(Some(RowRef::Frame(0))), 3);
        let seen: Vec<_> = changes.try_iter().collect();
        assert_eq!(
            seen,
            vec![
                ModelChange::ChildrenInserted { parent: 0, first: 2, last: 2 },
                ModelChange::RowsChanged { first: 0, last: 0 },
            ]
        );
    }

    #[test]
    fn test_switch_to_in_place_collapses() {
        let mut model = TraceModel::new();
        let db = SignalDatabase::new();
        model.add_entries(
            [1u8, 2, 3]
                .iter()
                .map(|b| TraceEntry::new(CanFrame::classic(0x100, &[*b]), &db))
                .collect(),
        );
        model.set_display_mode(DisplayMode::InPlace);
        assert_eq!(model.frame_count(), 1);
        assert_eq!(model.entry(0).unwrap().data, "03");
    }

    #[test]
    fn test_roles_and_addressing() {
        let db = SignalDatabase::from_messages(vec![MessageDefinition {
            id: 0x0C4,
            is_extended: false,
            name: "EngineData".to_string(),
            dlc: 8,
            transmitter: String::new(),
            signals: vec![SignalDefinition::new("Rpm", 0, 16)],
        }]);
        let mut model = TraceModel::new();
        model.add_entries(vec![
            TraceEntry::new(CanFrame::classic(0x0C4, &[0; 8]), &db),
            TraceEntry::new(CanFrame::error_frame(2, 0), &db),
        ]);

        let sig = model.index(0, Some(RowRef::Frame(0))).unwrap();
        assert_eq!(sig.parent(), Some(RowRef::Frame(0)));
        assert_eq!(model.index(1, Some(RowRef::Frame(0))), None);
        assert_eq!(model.row_count(Some(sig)), 0);

        assert_eq!(
            model.data(RowRef::Frame(0), Column::Name, Role::Foreground),
            Some(RoleValue::Color(palette::DECODED_NAME))
        );
        assert_eq!(
            model.data(RowRef::Frame(0), Column::Time, Role::Alignment),
            Some(RoleValue::Alignment(Alignment::Right))
        );
        assert_eq!(
            model.data(RowRef::Frame(1), Column::Data, Role::Background),
            Some(RoleValue::Color(palette::ERROR_BACKGROUND))
        );
        assert_eq!(
            model.data(RowRef::Frame(1), Column::Channel, Role::Channel),
            Some(RoleValue::Int(2))
        );
        assert_eq!(
            model.data(sig, Column::Name, Role::Display),
            Some(RoleValue::Text("Rpm"))
        );
        assert_eq!(
            model.header_data(Column::Channel, Role::Display),
            Some(RoleValue::Text("Chn"))
        );
        assert_eq!(palette::ERROR_TEXT.to_string(), "#ff6666");
    }
}
