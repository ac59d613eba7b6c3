//! Token-based undo quanta.
//!
//! The execution engine brackets work in undo quanta identified by a
//! monotonically increasing token. Each mutation appends its inverse action
//! to the current quantum; rolling back to a token replays every quantum at
//! or after it in reverse, and releasing a token discards quanta at or below
//! it. Inverse actions are expressed over primary keys and row values, not
//! tuple addresses, so they stay valid across compaction.

use std::collections::BTreeMap;

use crate::tuple::Datum;

/// Inverse of one mutation.
#[derive(Debug, Clone)]
pub enum UndoAction {
    /// Undo an insert: delete the row with this key.
    InsertRow { key: i64 },
    /// Undo a delete: put the row back.
    DeleteRow { row: Vec<Datum> },
    /// Undo an update: restore the previous row image.
    UpdateRow { key: i64, old_row: Vec<Datum> },
}

#[derive(Debug, Default)]
pub struct UndoLog {
    quanta: BTreeMap<i64, Vec<UndoAction>>,
    current: Option<i64>,
    /// Cleared while undo actions are being replayed so the replay does not
    /// record inverses of itself.
    recording: bool,
}

impl UndoLog {
    pub fn new() -> Self {
        Self {
            quanta: BTreeMap::new(),
            current: None,
            recording: true,
        }
    }

    /// Open (or reopen) the quantum for `token` and make it current.
    pub fn set_token(&mut self, token: i64) {
        self.quanta.entry(token).or_default();
        self.current = Some(token);
    }

    pub fn current_token(&self) -> Option<i64> {
        self.current
    }

    /// Append an inverse action to the current quantum. Dropped when no
    /// quantum is open or replay is in progress.
    pub fn record(&mut self, action: UndoAction) {
        if !self.recording {
            return;
        }
        if let Some(token) = self.current {
            self.quanta.entry(token).or_default().push(action);
        }
    }

    pub fn set_recording(&mut self, on: bool) {
        self.recording = on;
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Detach every quantum at or after `token`, newest first, actions in
    /// reverse application order.
    pub fn take_from(&mut self, token: i64) -> Vec<UndoAction> {
        let detached = self.quanta.split_off(&token);
        if let Some(cur) = self.current {
            if cur >= token {
                self.current = None;
            }
        }
        let mut actions = Vec::new();
        for (_, quantum) in detached.into_iter().rev() {
            actions.extend(quantum.into_iter().rev());
        }
        actions
    }

    /// Discard quanta at or below `token` — their mutations are permanent.
    pub fn release_through(&mut self, token: i64) {
        let keep = self.quanta.split_off(&(token + 1));
        self.quanta = keep;
        if let Some(cur) = self.current {
            if cur <= token {
                self.current = None;
            }
        }
    }

    pub fn quantum_count(&self) -> usize {
        self.quanta.len()
    }

    pub fn pending_action_count(&self) -> usize {
        self.quanta.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_requires_open_quantum() {
        let mut log = UndoLog::new();
        log.record(UndoAction::InsertRow { key: 1 });
        assert_eq!(log.pending_action_count(), 0);
        log.set_token(0);
        log.record(UndoAction::InsertRow { key: 1 });
        assert_eq!(log.pending_action_count(), 1);
    }

    #[test]
    fn test_take_from_returns_reverse_order() {
        let mut log = UndoLog::new();
        log.set_token(0);
        log.record(UndoAction::InsertRow { key: 1 });
        log.record(UndoAction::InsertRow { key: 2 });
        log.set_token(1);
        log.record(UndoAction::InsertRow { key: 3 });

        let actions = log.take_from(0);
        let keys: Vec<i64> = actions
            .iter()
            .map(|a| match a {
                UndoAction::InsertRow { key } => *key,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(keys, vec![3, 2, 1]);
        assert_eq!(log.quantum_count(), 0);
    }

    #[test]
    fn test_take_from_spares_older_quanta() {
        let mut log = UndoLog::new();
        log.set_token(0);
        log.record(UndoAction::InsertRow { key: 1 });
        log.set_token(1);
        log.record(UndoAction::InsertRow { key: 2 });
        let actions = log.take_from(1);
        assert_eq!(actions.len(), 1);
        assert_eq!(log.quantum_count(), 1);
    }

    #[test]
    fn test_release_discards_up_to_token() {
        let mut log = UndoLog::new();
        for t in 0..3 {
            log.set_token(t);
            log.record(UndoAction::InsertRow { key: t });
        }
        log.release_through(1);
        assert_eq!(log.quantum_count(), 1);
        assert_eq!(log.take_from(0).len(), 1);
    }

    #[test]
    fn test_recording_suppression() {
        let mut log = UndoLog::new();
        log.set_token(0);
        log.set_recording(false);
        log.record(UndoAction::InsertRow { key: 1 });
        assert_eq!(log.pending_action_count(), 0);
        log.set_recording(true);
        log.record(UndoAction::InsertRow { key: 1 });
        assert_eq!(log.pending_action_count(), 1);
    }
}
