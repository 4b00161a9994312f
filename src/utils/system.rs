use std::fmt;
use std::fs;

use chrono::{DateTime, Utc};

use super::format_time_as_elapsed;

/// Process uptime and memory, reported for observability only
#[derive(Clone, Copy, Debug)]
pub struct SystemStats {
    pub start_time: DateTime<Utc>,
}

impl SystemStats {
    pub fn new() -> Self {
        Self {
            start_time: Utc::now(),
        }
    }

    pub fn uptime(&self) -> chrono::Duration {
        Utc::now().signed_duration_since(self.start_time)
    }

    /// Resident set size in kB, where the platform exposes it
    pub fn resident_memory_kb(&self) -> Option<u64> {
        let status = fs::read_to_string("/proc/self/status").ok()?;
        parse_vm_rss(&status)
    }
}

impl Default for SystemStats {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_vm_rss(status: &str) -> Option<u64> {
    status
        .lines()
        .find(|line| line.starts_with("VmRSS:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse().ok())
}

impl fmt::Display for SystemStats {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<System uptime={}", format_time_as_elapsed(self.start_time))?;
        if let Some(rss) = self.resident_memory_kb() {
            write!(f, " rss={}kB", rss)?;
        }
        write!(f, ">")
    }
}
