//! Per-process metadata that is expensive to resolve and rarely changes.
//!
//! Entries are aged in sampling ticks. An entry that was not part of an enumeration for more than
//! `floor(eviction / period)` ticks is dropped. Changing the period does not rescale the age of
//! existing entries.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::errors::*;
use crate::util;

pub type Pid = u32;
pub type Tick = u64;

pub const DEFAULT_EVICTION: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedProcess {
    pub pid: Pid,
    pub name: String,
    pub command: String,
    last_seen: Tick,
}

impl CachedProcess {
    pub fn new(pid: Pid, name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            pid,
            name: name.into(),
            command: command.into(),
            last_seen: 0,
        }
    }

    pub fn ticks_unseen(&self, now: Tick) -> u64 {
        now.saturating_sub(self.last_seen)
    }
}

#[derive(Debug)]
pub struct ProcessCache {
    entries: HashMap<Pid, CachedProcess>,
    eviction: Duration,
    period: Duration,
    tick: Tick,
}

impl ProcessCache {
    pub fn new(period: Duration) -> Self {
        Self::with_eviction(period, DEFAULT_EVICTION)
    }

    pub fn with_eviction(period: Duration, eviction: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            eviction,
            period,
            tick: 0,
        }
    }

    pub fn get_process(&self, pid: Pid) -> Option<&CachedProcess> {
        self.entries.get(&pid)
    }

    /// Insert a freshly resolved entry. It counts as seen in the current tick.
    pub fn set_process(&mut self, mut process: CachedProcess) {
        process.last_seen = self.tick;
        self.entries.insert(process.pid, process);
    }

    /// Mark `seen` pids as present in enumeration `tick` and purge the ones absent for too long.
    ///
    /// Calling this again with the same tick and list changes nothing.
    pub fn update_not_seen(&mut self, tick: Tick, seen: &[Pid]) {
        self.tick = self.tick.max(tick);
        for pid in seen {
            if let Some(entry) = self.entries.get_mut(pid) {
                entry.last_seen = entry.last_seen.max(tick);
            }
        }
        let threshold = self.threshold();
        let now = self.tick;
        self.entries
            .retain(|_, entry| entry.ticks_unseen(now) <= threshold);
    }

    /// Ticks an entry may stay unseen before it is purged.
    pub fn threshold(&self) -> u64 {
        if self.period.is_zero() {
            return u64::MAX;
        }
        (self.eviction.as_secs_f64() / self.period.as_secs_f64()).floor() as u64
    }

    pub fn set_period(&mut self, period: Duration) {
        self.period = period;
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Resolve the display name and command line of `pid` from procfs.
pub async fn resolve(pid: Pid) -> Result<CachedProcess> {
    resolve_in(Path::new("/proc"), pid).await
}

pub(crate) async fn resolve_in(proc_root: &Path, pid: Pid) -> Result<CachedProcess> {
    let dir = proc_root.join(pid.to_string());
    let name = util::read_file(dir.join("comm"))
        .await
        .or_error(|| format!("Failed to read name of process {pid}"))?;
    // Kernel threads have an empty command line
    let command = util::read_file(dir.join("cmdline"))
        .await
        .map(|raw| {
            raw.split('\0')
                .filter(|arg| !arg.is_empty())
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default();
    let command = if command.is_empty() {
        format!("[{name}]")
    } else {
        command
    };
    Ok(CachedProcess::new(pid, name, command))
}
