//! Memory and swap usage
//!
//! # Configuration
//!
//! Key | Values | Default
//! ----|--------|--------
//! `enabled` | Whether to sample at all | `true`
//! `period` | Sampling period in seconds | `5`
//!
//! Topic         | Value
//! --------------|------
//! `memoryUsage` | `{total, used, percent}`, bytes
//! `swapUsage`   | `{total, used, percent}`, bytes
//!
//! Both topics share one read of `/proc/meminfo` per tick. Used memory excludes reclaimable caches,
//! the same way `free` computes it.

use super::prelude::*;
use super::round1;

const PROC_MEMINFO: &str = "/proc/meminfo";

pub const TOPICS: &[&str] = &["memoryUsage", "swapUsage"];

#[derive(Deserialize, Debug, Clone, PartialEq, SmartDefault)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    #[default(true)]
    pub enabled: bool,
    #[default(Seconds::new(5))]
    pub period: Seconds,
}

impl FamilyConfig for Config {
    fn enabled(&self) -> bool {
        self.enabled
    }

    fn period(&self) -> Duration {
        self.period.0
    }
}

#[derive(Default)]
pub struct Memory {
    memory_slot: TaskSlot,
    swap_slot: TaskSlot,
}

impl MetricFamily for Memory {
    type Config = Config;

    const NAME: &'static str = "memory";

    fn new(_config: &Config) -> Self {
        Self::default()
    }

    fn reconfigure(&self, _monitor: &Monitor, _old: &Config, _new: &Config) {}
}

impl Family for Memory {
    fn topics(&self) -> &'static [&'static str] {
        TOPICS
    }

    fn update(&self, monitor: &Monitor) {
        let meminfo = read_meminfo();
        for &topic in TOPICS {
            if monitor.is_listened(topic) {
                self.update_one(monitor, topic, &meminfo);
            }
        }
    }

    fn update_topic(&self, monitor: &Monitor, topic: &str) -> bool {
        let Some(&topic) = TOPICS.iter().find(|t| **t == topic) else {
            return false;
        };
        let meminfo = read_meminfo();
        self.update_one(monitor, topic, &meminfo);
        true
    }

    fn stop(&self) {
        self.memory_slot.cancel();
        self.swap_slot.cancel();
    }
}

impl Memory {
    fn update_one(&self, monitor: &Monitor, topic: &'static str, meminfo: &Memoized<MemInfo>) {
        let (slot, swap) = match topic {
            "swapUsage" => (&self.swap_slot, true),
            _ => (&self.memory_slot, false),
        };
        let fetch = meminfo.get_value();
        let monitor = monitor.clone();
        run_task(
            slot,
            topic,
            async move {
                let info = fetch.await?;
                Ok(if swap { info.swap() } else { info.memory() })
            },
            move |usage| monitor.publish(topic, usage.to_value()),
        );
    }
}

fn read_meminfo() -> Memoized<MemInfo> {
    Memoized::lazy(|| async {
        let raw = util::read_file(PROC_MEMINFO)
            .await
            .error("Failed to read /proc/meminfo")?;
        MemInfo::parse(&raw)
    })
}

#[derive(Debug, Default, PartialEq, Eq)]
struct MemInfo {
    mem_total: u64,
    mem_free: u64,
    mem_available: Option<u64>,
    buffers: u64,
    cached: u64,
    s_reclaimable: u64,
    swap_total: u64,
    swap_free: u64,
}

impl MemInfo {
    fn parse(raw: &str) -> Result<Self> {
        let mut info = Self::default();
        for line in raw.lines() {
            let mut fields = line.split_whitespace();
            let (Some(key), Some(value)) = (fields.next(), fields.next()) else {
                continue;
            };
            let Ok(kib) = value.parse::<u64>() else {
                continue;
            };
            let bytes = kib * 1024;
            match key {
                "MemTotal:" => info.mem_total = bytes,
                "MemFree:" => info.mem_free = bytes,
                "MemAvailable:" => info.mem_available = Some(bytes),
                "Buffers:" => info.buffers = bytes,
                "Cached:" => info.cached = bytes,
                "SReclaimable:" => info.s_reclaimable = bytes,
                "SwapTotal:" => info.swap_total = bytes,
                "SwapFree:" => info.swap_free = bytes,
                _ => (),
            }
        }
        if info.mem_total == 0 {
            return Err(Error::new("MemTotal missing from /proc/meminfo"));
        }
        Ok(info)
    }

    fn memory(&self) -> Usage {
        // Kernels before 3.14 have no MemAvailable
        let available = self.mem_available.unwrap_or(
            self.mem_free + self.buffers + self.cached + self.s_reclaimable,
        );
        Usage::new(self.mem_total, self.mem_total.saturating_sub(available))
    }

    fn swap(&self) -> Usage {
        Usage::new(self.swap_total, self.swap_total.saturating_sub(self.swap_free))
    }
}

#[derive(Debug, PartialEq)]
struct Usage {
    total: u64,
    used: u64,
}

impl Usage {
    fn new(total: u64, used: u64) -> Self {
        Self { total, used }
    }

    fn to_value(&self) -> Value {
        let percent = if self.total == 0 {
            0.0
        } else {
            self.used as f64 / self.total as f64 * 100.0
        };
        map! {
            "total" => self.total,
            "used" => self.used,
            "percent" => round1(percent),
        }
    }
}
