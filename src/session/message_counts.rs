use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-peer packet counters, shared between the session task and readers
#[derive(Debug, Default)]
pub struct PacketStats {
    received: AtomicU64,
    sent: AtomicU64,
    // Messages that arrived in a state that doesn't accept them
    wrong: AtomicU64,
}

impl PacketStats {
    pub fn new() -> Self {
        PacketStats::default()
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
    pub fn increment_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
    pub fn increment_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn wrong(&self) -> u64 {
        self.wrong.load(Ordering::Relaxed)
    }
    pub fn increment_wrong(&self) {
        self.wrong.fetch_add(1, Ordering::Relaxed);
    }
}

impl fmt::Display for PacketStats {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<PacketStats in={} out={} wrong={}>",
            self.received(),
            self.sent(),
            self.wrong()
        )
    }
}
