//! Network throughput summed over interfaces
//!
//! # Configuration
//!
//! Key | Values | Default
//! ----|--------|--------
//! `enabled` | Whether to sample at all | `true`
//! `period` | Sampling period in seconds | `2`
//! `interfaces` | Only count interfaces whose name matches this regex | all but `lo`
//!
//! Topic       | Value
//! ------------|------
//! `networkIO` | `{rx, tx}` in bytes per second since the previous sample
//!
//! # Example
//!
//! ```toml
//! [network]
//! interfaces = "^(eth|wl)"
//! ```

use super::prelude::*;

const PROC_NET_DEV: &str = "/proc/net/dev";

pub const TOPICS: &[&str] = &["networkIO"];

#[derive(Deserialize, Debug, Clone, PartialEq, SmartDefault)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    #[default(true)]
    pub enabled: bool,
    #[default(Seconds::new(2))]
    pub period: Seconds,
    pub interfaces: Option<SerdeRegex>,
}

impl FamilyConfig for Config {
    fn enabled(&self) -> bool {
        self.enabled
    }

    fn period(&self) -> Duration {
        self.period.0
    }
}

pub struct Network {
    interfaces: RefCell<Option<SerdeRegex>>,
    slot: TaskSlot,
    previous: Rc<Cell<Option<(Counters, Instant)>>>,
}

impl MetricFamily for Network {
    type Config = Config;

    const NAME: &'static str = "network";

    fn new(config: &Config) -> Self {
        Self {
            interfaces: RefCell::new(config.interfaces.clone()),
            slot: TaskSlot::new(),
            previous: util::default(),
        }
    }

    fn reconfigure(&self, monitor: &Monitor, old: &Config, new: &Config) {
        if old.interfaces != new.interfaces {
            *self.interfaces.borrow_mut() = new.interfaces.clone();
            self.slot.cancel();
            self.previous.set(None);
            monitor.reset_usage_history("networkIO");
        }
    }
}

impl Family for Network {
    fn topics(&self) -> &'static [&'static str] {
        TOPICS
    }

    fn update(&self, monitor: &Monitor) {
        if monitor.is_listened("networkIO") {
            self.update_io(monitor);
        }
    }

    fn update_topic(&self, monitor: &Monitor, topic: &str) -> bool {
        if topic != "networkIO" {
            return false;
        }
        self.update_io(monitor);
        true
    }

    fn topic_unlistened(&self, _monitor: &Monitor, _topic: &str) {
        self.previous.set(None);
    }

    fn stop(&self) {
        self.slot.cancel();
        self.previous.set(None);
    }
}

impl Network {
    fn update_io(&self, monitor: &Monitor) {
        let filter = self.interfaces.borrow().clone();
        let previous = self.previous.clone();
        let monitor = monitor.clone();
        run_task(
            &self.slot,
            "network io",
            async move {
                let raw = util::read_file(PROC_NET_DEV)
                    .await
                    .error("Failed to read /proc/net/dev")?;
                Counters::parse(&raw, filter.as_ref())
            },
            move |counters| {
                let now = Instant::now();
                if let Some((last, at)) = previous.replace(Some((counters, now))) {
                    let elapsed = now.duration_since(at).as_secs_f64();
                    if elapsed > 0.0 {
                        monitor.publish("networkIO", counters.rate_since(&last, elapsed));
                    }
                }
            },
        );
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Counters {
    rx: u64,
    tx: u64,
}

impl Counters {
    fn parse(raw: &str, filter: Option<&SerdeRegex>) -> Result<Self> {
        let mut total = Self::default();
        // Two header lines
        for line in raw.lines().skip(2) {
            let (name, stats) = line
                .split_once(':')
                .error("Malformed line in /proc/net/dev")?;
            let name = name.trim();
            let counted = match filter {
                Some(filter) => filter.0.is_match(name),
                None => name != "lo",
            };
            if !counted {
                continue;
            }
            let fields: Vec<u64> = stats
                .split_whitespace()
                .map(str::parse::<u64>)
                .collect::<Result<_, _>>()
                .error("Malformed counters in /proc/net/dev")?;
            if fields.len() < 9 {
                return Err(Error::new("Too few counters in /proc/net/dev"));
            }
            total.rx += fields[0];
            total.tx += fields[8];
        }
        Ok(total)
    }

    fn rate_since(&self, last: &Self, elapsed: f64) -> Value {
        map! {
            "rx" => (self.rx.saturating_sub(last.rx) as f64 / elapsed).round(),
            "tx" => (self.tx.saturating_sub(last.tx) as f64 / elapsed).round(),
        }
    }
}
