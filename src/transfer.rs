use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Send,
    Receive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Queued,
    Sending,
    Receiving,
    Completed,
    Error,
}

impl TransferStatus {
    pub fn is_active(self) -> bool {
        matches!(self, TransferStatus::Sending | TransferStatus::Receiving)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Error)
    }
}

/// Progress record for one file in either direction.
///
/// `bytes` only moves forward and never exceeds `size`. Once a transfer is
/// completed or failed its status no longer changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transfer {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub mime: String,
    pub direction: Direction,
    pub status: TransferStatus,
    pub bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Transfer {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        size: u64,
        mime: impl Into<String>,
        direction: Direction,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            size,
            mime: mime.into(),
            direction,
            status: TransferStatus::Queued,
            bytes: 0,
            error: None,
            updated_at: Utc::now(),
        }
    }

    pub fn start(&mut self) -> bool {
        if self.status != TransferStatus::Queued {
            return false;
        }
        self.status = match self.direction {
            Direction::Send => TransferStatus::Sending,
            Direction::Receive => TransferStatus::Receiving,
        };
        self.touch();
        true
    }

    /// Returns true if the visible progress changed.
    pub fn advance(&mut self, bytes: u64) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        let next = bytes.min(self.size);
        if next <= self.bytes {
            return false;
        }
        self.bytes = next;
        self.touch();
        true
    }

    pub fn complete(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.bytes = self.size;
        self.status = TransferStatus::Completed;
        self.touch();
        true
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = TransferStatus::Error;
        self.error = Some(reason.into());
        self.touch();
        true
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// All transfers of a session, in creation order.
#[derive(Debug, Default)]
pub struct TransferTable {
    order: Vec<String>,
    by_id: HashMap<String, Transfer>,
}

impl TransferTable {
    pub fn insert(&mut self, transfer: Transfer) {
        if !self.by_id.contains_key(&transfer.id) {
            self.order.push(transfer.id.clone());
        }
        self.by_id.insert(transfer.id.clone(), transfer);
    }

    pub fn get(&self, id: &str) -> Option<&Transfer> {
        self.by_id.get(id)
    }

    /// Apply `f` and return a copy of the transfer if `f` reported a change.
    pub fn update(&mut self, id: &str, f: impl FnOnce(&mut Transfer) -> bool) -> Option<Transfer> {
        let transfer = self.by_id.get_mut(id)?;
        f(transfer).then(|| transfer.clone())
    }

    /// Mark every sending/receiving transfer as failed.
    pub fn fail_in_flight(&mut self, reason: &str) -> Vec<Transfer> {
        let mut failed = Vec::new();
        for id in &self.order {
            if let Some(t) = self.by_id.get_mut(id) {
                if t.status.is_active() && t.fail(reason) {
                    failed.push(t.clone());
                }
            }
        }
        failed
    }

    pub fn list(&self) -> Vec<Transfer> {
        self.order
            .iter()
            .filter_map(|id| self.by_id.get(id).cloned())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Author {
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub id: String,
    pub author: Author,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(id: impl Into<String>, author: Author, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            author,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sending(size: u64) -> Transfer {
        let mut t = Transfer::new("a", "a.bin", size, "", Direction::Send);
        assert!(t.start());
        t
    }

    #[test]
    fn progress_is_monotonic_and_capped() {
        let mut t = sending(100);
        assert!(t.advance(40));
        assert!(!t.advance(30));
        assert_eq!(t.bytes, 40);
        assert!(t.advance(500));
        assert_eq!(t.bytes, 100);
    }

    #[test]
    fn terminal_states_are_sticky() {
        let mut t = sending(10);
        assert!(t.fail("boom"));
        assert!(!t.complete());
        assert!(!t.advance(5));
        assert_eq!(t.status, TransferStatus::Error);
        assert_eq!(t.error.as_deref(), Some("boom"));
    }

    #[test]
    fn fail_in_flight_skips_queued_and_finished() {
        let mut table = TransferTable::default();
        table.insert(sending(10));
        let mut done = Transfer::new("b", "b", 1, "", Direction::Receive);
        done.start();
        done.complete();
        table.insert(done);
        table.insert(Transfer::new("c", "c", 1, "", Direction::Send));

        let failed = table.fail_in_flight("connection lost");
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, "a");
        assert_eq!(table.get("b").unwrap().status, TransferStatus::Completed);
        assert_eq!(table.get("c").unwrap().status, TransferStatus::Queued);
        assert_eq!(
            table.list().iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );
    }
}
