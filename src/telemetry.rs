use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

/// Data channel counters shared by the pump, the receive path and the control
/// plane.
#[derive(Default)]
pub struct WireStats {
    bytes_sent: AtomicU64,
    bytes_recv: AtomicU64,
    frames_sent: AtomicU64,
    frames_recv: AtomicU64,
    send_retries: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl WireStats {
    pub fn on_send(&self, n: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn on_recv(&self, n: usize) {
        self.frames_recv.fetch_add(1, Ordering::Relaxed);
        self.bytes_recv.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn on_retry(&self) {
        self.send_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_last_error(&self, err: impl ToString) {
        let mut g = self.last_error.lock().unwrap_or_else(|p| p.into_inner());
        *g = Some(err.to_string());
    }

    pub fn snapshot(&self) -> WireStatsSnapshot {
        let last_error = self
            .last_error
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .unwrap_or_default();
        WireStatsSnapshot {
            bytes_sent_total: self.bytes_sent.load(Ordering::Relaxed),
            bytes_recv_total: self.bytes_recv.load(Ordering::Relaxed),
            frames_sent_total: self.frames_sent.load(Ordering::Relaxed),
            frames_recv_total: self.frames_recv.load(Ordering::Relaxed),
            send_retries_total: self.send_retries.load(Ordering::Relaxed),
            last_error,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct WireStatsSnapshot {
    pub bytes_sent_total: u64,
    pub bytes_recv_total: u64,
    pub frames_sent_total: u64,
    pub frames_recv_total: u64,
    pub send_retries_total: u64,
    pub last_error: String,
}
