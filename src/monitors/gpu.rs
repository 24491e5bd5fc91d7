//! GPU statistics streamed from a long-lived command
//!
//! Instead of spawning a process every period, one command keeps running and prints a report
//! on its own schedule. The output is grouped into reports according to `stream.flush` and each
//! report is published unparsed.
//!
//! The command only runs while `gpuStats` is listened to. An out-of-band refresh of an unlistened
//! `gpuStats` runs it until the first report. If it exits, the last report stays available and
//! the command is started again on the first tick after `restart_delay`.
//!
//! # Configuration
//!
//! Key | Values | Default
//! ----|--------|--------
//! `enabled` | Whether to sample at all | `false`
//! `period` | Reporting period in seconds, passed to the default command | `2`
//! `command` | Shell command to run instead of `nvidia-smi` | `None`
//! `restart_delay` | Seconds to wait before running an exited command again | `30`
//! `stream` | How output is grouped into reports, see below | `{ flush = { idle = 0.2 } }`
//!
//! `stream.flush` is one of `"always"`, `{ trigger = "text" }`, `{ match = "regex" }` or
//! `{ idle = seconds }`. `stream.interval` additionally flushes on a fixed period.
//!
//! Topic      | Value
//! -----------|------
//! `gpuStats` | `{"raw": "<report>"}`
//!
//! # Example
//!
//! ```toml
//! [gpu]
//! enabled = true
//! command = "intel_gpu_top -J -s 2000"
//! stream.flush.trigger = "},"
//! ```

use super::prelude::*;
use crate::SubjectId;
use crate::monitor::WeakMonitor;
use crate::stream::{FlushMode, StreamEvent, StreamOptions, StreamTask, WeakStreamTask};

make_log_macro!(debug, "gpu");
make_log_macro!(warn, "gpu");

pub const TOPICS: &[&str] = &["gpuStats"];

const NVIDIA_QUERY: &str = "index,name,utilization.gpu,memory.used,memory.total,temperature.gpu";

#[derive(Deserialize, Debug, Clone, PartialEq, SmartDefault)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub enabled: bool,
    #[default(Seconds::new(2))]
    pub period: Seconds,
    pub command: Option<ShellString>,
    #[default(Seconds::new(30))]
    pub restart_delay: Seconds,
    #[default(StreamOptions { flush: FlushMode::Idle(Seconds::from(0.2)), interval: None })]
    pub stream: StreamOptions,
}

impl FamilyConfig for Config {
    fn enabled(&self) -> bool {
        self.enabled
    }

    fn period(&self) -> Duration {
        self.period.0
    }
}

impl Config {
    fn command_line(&self) -> Result<String> {
        match &self.command {
            Some(command) => command.expand().map(Into::into),
            // nvidia-smi only takes whole seconds
            None => Ok(format!(
                "nvidia-smi --query-gpu={NVIDIA_QUERY} --format=csv,noheader,nounits -l {}",
                self.period.0.as_secs_f64().ceil().max(1.0)
            )),
        }
    }
}

pub struct Gpu {
    config: RefCell<Config>,
    stream: StreamTask,
    subject: SubjectId,
    exited_at: Rc<Cell<Option<Instant>>>,
}

impl MetricFamily for Gpu {
    type Config = Config;

    const NAME: &'static str = "gpu";

    fn new(config: &Config) -> Self {
        Self {
            config: RefCell::new(config.clone()),
            stream: StreamTask::new(),
            subject: SubjectId::new(),
            exited_at: util::default(),
        }
    }

    fn reconfigure(&self, monitor: &Monitor, _old: &Config, new: &Config) {
        *self.config.borrow_mut() = new.clone();
        self.exited_at.set(None);
        if self.stream.is_running() {
            self.stream.stop();
            self.start_stream(monitor);
        }
    }
}

impl Family for Gpu {
    fn topics(&self) -> &'static [&'static str] {
        TOPICS
    }

    fn update(&self, monitor: &Monitor) {
        if !monitor.is_listened("gpuStats") || self.stream.is_running() {
            return;
        }
        let delay = self.config.borrow().restart_delay.0;
        if self.exited_at.get().is_some_and(|at| at.elapsed() < delay) {
            return;
        }
        self.start_stream(monitor);
    }

    fn update_topic(&self, monitor: &Monitor, topic: &str) -> bool {
        if topic != "gpuStats" {
            return false;
        }
        // A running command reports on its own schedule
        if !self.stream.is_running() {
            self.start_stream(monitor);
        }
        true
    }

    fn topic_unlistened(&self, _monitor: &Monitor, _topic: &str) {
        self.stream.stop();
        self.exited_at.set(None);
    }

    fn stop(&self) {
        self.stream.stop();
        self.exited_at.set(None);
    }
}

impl Gpu {
    fn start_stream(&self, monitor: &Monitor) {
        let config = self.config.borrow().clone();
        let command = match config.command_line() {
            Ok(command) => command,
            Err(e) => {
                warn!("{e}");
                self.exited_at.set(Some(Instant::now()));
                return;
            }
        };
        let monitor: WeakMonitor = monitor.downgrade();
        let stream: WeakStreamTask = self.stream.downgrade();
        let exited_at = self.exited_at.clone();
        self.stream.listen(self.subject, move |event| {
            let Some(monitor) = monitor.upgrade() else {
                return Ok(());
            };
            on_event(&monitor, &exited_at, event);
            // Started by a refresh only, one report is enough
            if matches!(event, StreamEvent::Data(_)) && !monitor.is_listened("gpuStats") {
                if let Some(stream) = stream.upgrade() {
                    debug!("nobody listens, stopping after one report");
                    stream.stop();
                }
            }
            Ok(())
        });
        debug!("running '{command}'");
        self.stream.start(&command, config.stream);
    }
}

fn on_event(monitor: &Monitor, exited_at: &Cell<Option<Instant>>, event: &StreamEvent) {
    match event {
        StreamEvent::Data(report) => monitor.publish("gpuStats", map! { "raw" => report.as_str() }),
        StreamEvent::Exit => {
            warn!("command exited, keeping the last report");
            exited_at.set(Some(Instant::now()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::task::LocalSet;
    use tokio::time::sleep;

    #[test]
    fn default_command_uses_period() {
        let config = Config {
            period: Seconds::from(0.5),
            ..Config::default()
        };
        let command = config.command_line().unwrap();
        assert!(command.starts_with("nvidia-smi --query-gpu=index,"));
        assert!(command.ends_with(" -l 1"));
        assert!(!config.enabled);
    }

    #[test]
    fn stream_options_from_toml() {
        let config: Config = toml::from_str(
            r#"
            command = "cat"
            stream.flush.trigger = "END"
            stream.interval = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.stream.flush, FlushMode::Trigger("END".into()));
        assert_eq!(config.stream.interval, Some(Seconds::new(5)));
        assert_eq!(config.command_line().unwrap(), "cat");
    }

    #[tokio::test]
    async fn streams_reports_while_listened() {
        LocalSet::new()
            .run_until(async {
                let config: Config = toml::from_str(
                    r#"
                    enabled = true
                    command = "printf '0, 10\n1, 20\nEND\n'; sleep 5"
                    stream.flush.trigger = "END"
                    "#,
                )
                .unwrap();
                let gpu = Rc::new(Gpu::new(&config));
                let monitor = Monitor::new("gpu", config.period.0, 10, gpu.clone());
                let subject = SubjectId::new();
                monitor.listen(subject, "gpuStats", |_| Ok(()));
                assert!(monitor.start());

                for _ in 0..100 {
                    if monitor.get_current_value("gpuStats").is_some() {
                        break;
                    }
                    sleep(Duration::from_millis(20)).await;
                }
                assert_eq!(
                    monitor.get_current_value("gpuStats"),
                    Some(json!({"raw": "0, 10\n1, 20\nEND"}))
                );
                assert!(gpu.stream.is_running());

                monitor.unlisten(subject, None);
                assert!(!gpu.stream.is_running());
                monitor.stop();
            })
            .await;
    }

    #[tokio::test]
    async fn exit_keeps_last_report_and_waits_before_restart() {
        LocalSet::new()
            .run_until(async {
                let config: Config =
                    toml::from_str("enabled = true\ncommand = \"echo once\"\nstream.flush = \"always\"")
                        .unwrap();
                let gpu = Rc::new(Gpu::new(&config));
                let monitor = Monitor::new("gpu", config.period.0, 10, gpu.clone());
                monitor.listen(SubjectId::new(), "gpuStats", |_| Ok(()));
                monitor.start();

                for _ in 0..100 {
                    if gpu.exited_at.get().is_some() {
                        break;
                    }
                    sleep(Duration::from_millis(20)).await;
                }
                assert!(gpu.exited_at.get().is_some());
                assert_eq!(
                    monitor.get_current_value("gpuStats"),
                    Some(json!({"raw": "once"}))
                );
                gpu.update(&monitor);
                assert!(!gpu.stream.is_running());
                monitor.stop();
            })
            .await;
    }

    #[tokio::test]
    async fn refresh_without_listeners_runs_once() {
        LocalSet::new()
            .run_until(async {
                let config: Config = toml::from_str(
                    r#"
                    enabled = true
                    command = "while true; do echo x; sleep 0.1; done"
                    stream.flush = "always"
                    "#,
                )
                .unwrap();
                let gpu = Rc::new(Gpu::new(&config));
                let monitor = Monitor::new("gpu", config.period.0, 10, gpu.clone());
                assert!(monitor.start());

                monitor.request_update("gpuStats");
                for _ in 0..100 {
                    if monitor.get_current_value("gpuStats").is_some() {
                        break;
                    }
                    sleep(Duration::from_millis(20)).await;
                }
                assert_eq!(monitor.get_current_value("gpuStats"), Some(json!({"raw": "x"})));
                assert!(!gpu.stream.is_running());
                sleep(Duration::from_millis(500)).await;
                assert_eq!(monitor.get_usage_history("gpuStats").len(), 1);

                monitor.stop();
                monitor.request_update("gpuStats");
                sleep(Duration::from_millis(300)).await;
                assert!(!gpu.stream.is_running());
                assert!(monitor.get_current_value("gpuStats").is_none());
            })
            .await;
    }
}
