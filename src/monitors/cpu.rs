//! Overall CPU usage, per core usage and the most CPU hungry processes
//!
//! # Configuration
//!
//! Key | Values | Default
//! ----|--------|--------
//! `enabled` | Whether to sample at all | `true`
//! `period` | Sampling period in seconds | `2`
//! `processes_source` | Where processes are enumerated from: `"auto"`, `"proc"` or `"ps"` | `"auto"`
//! `top_processes` | How many processes `topProcesses` reports | `5`
//! `process_eviction` | Seconds a process may go unseen before its cached name is dropped | `300`
//!
//! Topic           | Value                                      | History
//! ----------------|--------------------------------------------|--------
//! `cpuUsage`      | Percent of time not idle since last sample | yes
//! `cpuCoresUsage` | Array of the same, one per core            | yes
//! `topProcesses`  | Array of `{pid, name, command, cpu}`       | latest only
//!
//! `/proc/stat` is read at most once per tick no matter how many of the first two topics are
//! listened to.
//!
//! # Example
//!
//! ```toml
//! [cpu]
//! period = 1.5
//! processes_source = "ps"
//! top_processes = 10
//! ```

use std::path::Path;

use super::prelude::*;
use super::round1;
use crate::process_cache::{self, CachedProcess, Pid, ProcessCache, Tick};
use crate::subprocess;

make_log_macro!(debug, "cpu");

const PROC_STAT: &str = "/proc/stat";

pub const TOPICS: &[&str] = &["cpuUsage", "cpuCoresUsage", "topProcesses"];

#[derive(Deserialize, Debug, Clone, PartialEq, SmartDefault)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    #[default(true)]
    pub enabled: bool,
    #[default(Seconds::new(2))]
    pub period: Seconds,
    pub processes_source: ProcessesSource,
    #[default(5)]
    pub top_processes: usize,
    #[default(Seconds(process_cache::DEFAULT_EVICTION))]
    pub process_eviction: Seconds,
}

impl FamilyConfig for Config {
    fn enabled(&self) -> bool {
        self.enabled
    }

    fn period(&self) -> Duration {
        self.period.0
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, SmartDefault)]
#[serde(rename_all = "lowercase")]
pub enum ProcessesSource {
    #[default]
    Auto,
    Proc,
    Ps,
}

/// [`ProcessesSource`] once `auto` has been decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Proc,
    Ps,
}

impl ProcessesSource {
    pub fn resolve(self) -> Strategy {
        match self {
            Self::Proc => Strategy::Proc,
            Self::Ps => Strategy::Ps,
            Self::Auto if Path::new(PROC_STAT).exists() => Strategy::Proc,
            Self::Auto => Strategy::Ps,
        }
    }
}

pub struct Cpu {
    top_processes: Cell<usize>,
    strategy: Cell<Strategy>,
    usage_slot: TaskSlot,
    cores_slot: TaskSlot,
    top_slot: TaskSlot,
    previous: Rc<RefCell<Previous>>,
    processes: Rc<RefCell<Processes>>,
}

#[derive(Default)]
struct Previous {
    total: Option<CpuTimes>,
    cores: Vec<CpuTimes>,
}

struct Processes {
    cache: ProcessCache,
    ticks: HashMap<Pid, u64>,
    sampled_at: Option<Instant>,
}

impl Processes {
    fn new(config: &Config) -> Self {
        Self {
            cache: ProcessCache::with_eviction(config.period.0, config.process_eviction.0),
            ticks: HashMap::new(),
            sampled_at: None,
        }
    }

    fn reset(&mut self) {
        self.cache.reset();
        self.ticks.clear();
        self.sampled_at = None;
    }

    /// Turn an enumeration into `(pid, percent of one core)` pairs, busiest first.
    fn rank(&mut self, sample: Sample) -> Vec<(Pid, f64)> {
        let mut ranked = match sample {
            Sample::Percent(list) => list,
            Sample::Ticks(list) => {
                let now = Instant::now();
                let elapsed = self
                    .sampled_at
                    .replace(now)
                    .map(|at| now.duration_since(at).as_secs_f64())
                    .unwrap_or_default();
                let hz = clock_ticks();
                let ranked: Vec<(Pid, f64)> = list
                    .iter()
                    .map(|&(pid, ticks)| {
                        let cpu = match self.ticks.get(&pid) {
                            Some(&prev) if elapsed > 0.0 => {
                                ticks.saturating_sub(prev) as f64 / hz / elapsed * 100.0
                            }
                            _ => 0.0,
                        };
                        (pid, cpu)
                    })
                    .collect();
                self.ticks = list.into_iter().collect();
                ranked
            }
        };
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked
    }
}

/// One enumeration of all processes.
enum Sample {
    /// Cumulative CPU time in clock ticks, from procfs.
    Ticks(Vec<(Pid, u64)>),
    /// Ready made percentages, from `ps`.
    Percent(Vec<(Pid, f64)>),
}

impl Sample {
    fn pids(&self) -> Vec<Pid> {
        match self {
            Self::Ticks(list) => list.iter().map(|(pid, _)| *pid).collect(),
            Self::Percent(list) => list.iter().map(|(pid, _)| *pid).collect(),
        }
    }
}

impl MetricFamily for Cpu {
    type Config = Config;

    const NAME: &'static str = "cpu";

    fn new(config: &Config) -> Self {
        Self {
            top_processes: Cell::new(config.top_processes),
            strategy: Cell::new(config.processes_source.resolve()),
            usage_slot: TaskSlot::new(),
            cores_slot: TaskSlot::new(),
            top_slot: TaskSlot::new(),
            previous: util::default(),
            processes: Rc::new(RefCell::new(Processes::new(config))),
        }
    }

    fn reconfigure(&self, monitor: &Monitor, old: &Config, new: &Config) {
        self.top_processes.set(new.top_processes);
        if old.process_eviction != new.process_eviction {
            self.processes.borrow_mut().cache =
                ProcessCache::with_eviction(new.period.0, new.process_eviction.0);
        } else if old.period != new.period {
            let mut processes = self.processes.borrow_mut();
            processes.cache.set_period(new.period.0);
            processes.cache.reset();
        }
        if old.processes_source != new.processes_source {
            let strategy = new.processes_source.resolve();
            debug!("processes source is now {strategy:?}");
            self.strategy.set(strategy);
            self.top_slot.cancel();
            self.processes.borrow_mut().reset();
            monitor.reset_usage_history("topProcesses");
        }
    }
}

impl Family for Cpu {
    fn topics(&self) -> &'static [&'static str] {
        TOPICS
    }

    fn update(&self, monitor: &Monitor) {
        let stat = Memoized::read_file(PROC_STAT);
        if monitor.is_listened("cpuUsage") {
            self.update_usage(monitor, &stat);
        }
        if monitor.is_listened("cpuCoresUsage") {
            self.update_cores(monitor, &stat);
        }
        if monitor.is_listened("topProcesses") {
            self.update_top_processes(monitor);
        }
    }

    fn update_topic(&self, monitor: &Monitor, topic: &str) -> bool {
        match topic {
            "cpuUsage" => self.update_usage(monitor, &Memoized::read_file(PROC_STAT)),
            "cpuCoresUsage" => self.update_cores(monitor, &Memoized::read_file(PROC_STAT)),
            "topProcesses" => self.update_top_processes(monitor),
            _ => return false,
        }
        true
    }

    fn topic_unlistened(&self, _monitor: &Monitor, topic: &str) {
        match topic {
            "cpuUsage" => self.previous.borrow_mut().total = None,
            "cpuCoresUsage" => self.previous.borrow_mut().cores.clear(),
            "topProcesses" => {
                self.top_slot.cancel();
                self.processes.borrow_mut().reset();
            }
            _ => (),
        }
    }

    fn stop(&self) {
        self.usage_slot.cancel();
        self.cores_slot.cancel();
        self.top_slot.cancel();
        *self.previous.borrow_mut() = util::default();
        self.processes.borrow_mut().reset();
    }
}

impl Cpu {
    fn update_usage(&self, monitor: &Monitor, stat: &Memoized<String>) {
        let fetch = stat.get_value();
        let previous = self.previous.clone();
        let monitor = monitor.clone();
        run_task(
            &self.usage_slot,
            "cpu usage",
            async move {
                let raw = fetch.await?;
                parse_stat(&raw).map(|(total, _)| total)
            },
            move |total| {
                let last = previous.borrow_mut().total.replace(total);
                if let Some(last) = last {
                    monitor.publish("cpuUsage", round1(total.usage_since(&last)).into());
                }
            },
        );
    }

    fn update_cores(&self, monitor: &Monitor, stat: &Memoized<String>) {
        let fetch = stat.get_value();
        let previous = self.previous.clone();
        let monitor = monitor.clone();
        run_task(
            &self.cores_slot,
            "cpu cores usage",
            async move {
                let raw = fetch.await?;
                parse_stat(&raw).map(|(_, cores)| cores)
            },
            move |cores| {
                let last = std::mem::replace(&mut previous.borrow_mut().cores, cores.clone());
                // Cores going on or offline change the count; start over in that case
                if last.len() == cores.len() {
                    let usage: Vec<f64> = cores
                        .iter()
                        .zip(&last)
                        .map(|(now, last)| round1(now.usage_since(last)))
                        .collect();
                    monitor.publish("cpuCoresUsage", usage.into());
                }
            },
        );
    }

    fn update_top_processes(&self, monitor: &Monitor) {
        let strategy = self.strategy.get();
        let count = self.top_processes.get();
        let tick = monitor.tick_count();
        let processes = self.processes.clone();
        let monitor = monitor.clone();
        let op_processes = processes.clone();
        run_task(
            &self.top_slot,
            "top processes",
            async move {
                let sample = match strategy {
                    Strategy::Proc => sample_proc(Path::new("/proc")).await?,
                    Strategy::Ps => sample_ps().await?,
                };
                let seen = sample.pids();
                let mut top = op_processes.borrow_mut().rank(sample);
                top.truncate(count);

                let misses: Vec<Pid> = {
                    let processes = op_processes.borrow();
                    top.iter()
                        .map(|(pid, _)| *pid)
                        .filter(|pid| processes.cache.get_process(*pid).is_none())
                        .collect()
                };
                let mut resolved = Vec::with_capacity(misses.len());
                for pid in misses {
                    let process = match strategy {
                        Strategy::Proc => process_cache::resolve(pid).await,
                        Strategy::Ps => resolve_ps(pid).await,
                    };
                    match process {
                        Ok(process) => resolved.push(process),
                        // Most likely exited in the meantime
                        Err(e) => debug!("{e}"),
                    }
                }
                Ok(TopProcesses {
                    top,
                    resolved,
                    seen,
                    tick,
                })
            },
            move |result| {
                let value = result.apply(&mut processes.borrow_mut().cache);
                monitor.publish_single("topProcesses", value);
            },
        );
    }
}

struct TopProcesses {
    top: Vec<(Pid, f64)>,
    resolved: Vec<CachedProcess>,
    seen: Vec<Pid>,
    tick: Tick,
}

impl TopProcesses {
    /// Store what was resolved, age what was not seen and build the published list.
    fn apply(self, cache: &mut ProcessCache) -> Value {
        for process in self.resolved {
            cache.set_process(process);
        }
        cache.update_not_seen(self.tick, &self.seen);
        self.top
            .into_iter()
            .filter_map(|(pid, cpu)| {
                let process = cache.get_process(pid)?;
                Some(map! {
                    "pid" => pid,
                    "name" => process.name.as_str(),
                    "command" => process.command.as_str(),
                    "cpu" => round1(cpu),
                })
            })
            .collect::<Vec<_>>()
            .into()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct CpuTimes {
    total: u64,
    idle: u64,
}

impl CpuTimes {
    /// Parse one `cpu`/`cpuN` line of `/proc/stat`.
    fn parse(line: &str) -> Option<Self> {
        let values = line
            .split_whitespace()
            .skip(1)
            .take(8)
            .map(|f| f.parse::<u64>().ok())
            .collect::<Option<Vec<u64>>>()?;
        if values.len() < 4 {
            return None;
        }
        // idle + iowait
        let idle = values[3] + values.get(4).copied().unwrap_or(0);
        Some(Self {
            total: values.iter().sum(),
            idle,
        })
    }

    fn usage_since(&self, last: &Self) -> f64 {
        let total = self.total.saturating_sub(last.total);
        let idle = self.idle.saturating_sub(last.idle).min(total);
        if total == 0 {
            return 0.0;
        }
        (total - idle) as f64 / total as f64 * 100.0
    }
}

fn parse_stat(raw: &str) -> Result<(CpuTimes, Vec<CpuTimes>)> {
    let mut lines = raw.lines();
    let total = lines
        .next()
        .filter(|line| line.starts_with("cpu "))
        .and_then(CpuTimes::parse)
        .error("Malformed /proc/stat")?;
    let cores = lines
        .take_while(|line| line.starts_with("cpu"))
        .map(|line| CpuTimes::parse(line).error("Malformed core line in /proc/stat"))
        .collect::<Result<_>>()?;
    Ok((total, cores))
}

/// User plus system time of a process, from the contents of `/proc/<pid>/stat`.
fn parse_process_ticks(raw: &str) -> Option<u64> {
    // The name may contain spaces and parentheses, fields are counted from the last ')'
    let rest = &raw[raw.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace().skip(11);
    let utime: u64 = fields.next()?.parse().ok()?;
    let stime: u64 = fields.next()?.parse().ok()?;
    Some(utime + stime)
}

async fn sample_proc(root: &Path) -> Result<Sample> {
    let mut entries = tokio::fs::read_dir(root)
        .await
        .or_error(|| format!("Failed to list {}", root.display()))?;
    let mut list = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .error("Failed to enumerate processes")?
    {
        let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<Pid>().ok()) else {
            continue;
        };
        // Processes vanish between listing and reading
        if let Ok(raw) = util::read_file(entry.path().join("stat")).await {
            if let Some(ticks) = parse_process_ticks(&raw) {
                list.push((pid, ticks));
            }
        }
    }
    Ok(Sample::Ticks(list))
}

async fn sample_ps() -> Result<Sample> {
    let output = subprocess::run_output("ps -eo pid=,pcpu=").await?;
    Ok(Sample::Percent(parse_ps(&output)))
}

fn parse_ps(output: &str) -> Vec<(Pid, f64)> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let pid = fields.next()?.parse().ok()?;
            let cpu = fields.next()?.parse().ok()?;
            Some((pid, cpu))
        })
        .collect()
}

async fn resolve_ps(pid: Pid) -> Result<CachedProcess> {
    let name = subprocess::run_output(&format!("ps -o comm= -p {pid}")).await?;
    let command = subprocess::run_output(&format!("ps -o args= -p {pid}")).await?;
    Ok(CachedProcess::new(pid, name.trim(), command.trim()))
}

fn clock_ticks() -> f64 {
    // SAFETY: sysconf has no preconditions
    match unsafe { libc::sysconf(libc::_SC_CLK_TCK) } {
        hz if hz > 0 => hz as f64,
        _ => 100.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SubjectId;
    use serde_json::json;

    const STAT: &str = "\
cpu  100 0 100 700 100 0 0 0 0 0
cpu0 50 0 50 350 50 0 0 0 0 0
cpu1 50 0 50 350 50 0 0 0 0 0
intr 12345
ctxt 6789
";

    #[test]
    fn parses_stat() {
        let (total, cores) = parse_stat(STAT).unwrap();
        assert_eq!(total, CpuTimes { total: 1000, idle: 800 });
        assert_eq!(cores.len(), 2);
        assert_eq!(cores[0], CpuTimes { total: 500, idle: 400 });
        assert!(parse_stat("intr 1\n").is_err());
    }

    #[test]
    fn usage_between_samples() {
        let last = CpuTimes { total: 1000, idle: 800 };
        let now = CpuTimes { total: 1200, idle: 850 };
        assert_eq!(now.usage_since(&last), 75.0);
        assert_eq!(last.usage_since(&last), 0.0);
        // Counters going backwards (e.g. after hibernation) must not underflow
        assert_eq!(last.usage_since(&now), 0.0);
    }

    #[test]
    fn parses_process_ticks() {
        let raw = "1234 (tmux: server) S 1 1234 1234 0 -1 4194560 1 0 0 0 250 50 0 0 20 0 1 0";
        assert_eq!(parse_process_ticks(raw), Some(300));
        assert_eq!(parse_process_ticks("garbage"), None);
    }

    #[test]
    fn parses_ps_output() {
        let out = "    1  0.0\n  420 12.5\nbogus line\n";
        assert_eq!(parse_ps(out), [(1, 0.0), (420, 12.5)]);
    }

    #[test]
    fn ranks_by_tick_delta() {
        let config = Config::default();
        let mut p = Processes::new(&config);
        let first = p.rank(Sample::Ticks(vec![(1, 100), (2, 100)]));
        assert!(first.iter().all(|(_, cpu)| *cpu == 0.0));
        p.sampled_at = Some(Instant::now() - Duration::from_secs(1));
        let hz = clock_ticks() as u64;
        let second = p.rank(Sample::Ticks(vec![(1, 100), (2, 100 + hz / 2), (3, 5)]));
        assert_eq!(second[0].0, 2);
        assert!((second[0].1 - 50.0).abs() < 5.0);
        assert_eq!(second.len(), 3);
    }

    #[test]
    fn publishes_only_resolved_processes() {
        let mut cache = ProcessCache::new(Duration::from_secs(2));
        cache.set_process(CachedProcess::new(1, "init", "/sbin/init"));
        let result = TopProcesses {
            top: vec![(7, 42.0), (1, 0.5), (9, 0.1)],
            resolved: vec![CachedProcess::new(7, "cargo", "cargo build")],
            seen: vec![1, 7, 9],
            tick: 3,
        };
        assert_eq!(
            result.apply(&mut cache),
            json!([
                {"pid": 7, "name": "cargo", "command": "cargo build", "cpu": 42.0},
                {"pid": 1, "name": "init", "command": "/sbin/init", "cpu": 0.5},
            ])
        );
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn config_defaults_and_sources() {
        let config: Config = toml::from_str("processes_source = \"ps\"\nperiod = 0.5").unwrap();
        assert_eq!(config.processes_source.resolve(), Strategy::Ps);
        assert_eq!(config.period, Seconds::from(0.5));
        assert_eq!(config.top_processes, 5);
        assert!(toml::from_str::<Config>("bogus = 1").is_err());
    }

    #[tokio::test]
    async fn samples_fake_procfs() {
        let root = std::env::temp_dir().join(format!("sysmon-cpu-{}", std::process::id()));
        for (pid, stat) in [("10", "10 (a) S 1 1 1 0 -1 0 0 0 0 0 7 3 0 0"), ("self", "x")] {
            std::fs::create_dir_all(root.join(pid)).unwrap();
            std::fs::write(root.join(pid).join("stat"), stat).unwrap();
        }
        let Sample::Ticks(list) = sample_proc(&root).await.unwrap() else {
            panic!("expected ticks");
        };
        assert_eq!(list, [(10, 10)]);
        std::fs::remove_dir_all(&root).unwrap();
    }

    fn seeded(config: &Config) -> (Rc<Cpu>, Monitor) {
        let cpu = Rc::new(Cpu::new(config));
        {
            let mut processes = cpu.processes.borrow_mut();
            processes.cache.set_process(CachedProcess::new(1, "init", "/sbin/init"));
            processes.ticks.insert(1, 100);
            processes.sampled_at = Some(Instant::now());
        }
        let monitor = Monitor::new("cpu", config.period.0, 10, cpu.clone());
        monitor.set_usage_value("topProcesses", json!([{"pid": 1}]));
        (cpu, monitor)
    }

    fn assert_forgotten(cpu: &Cpu) {
        let processes = cpu.processes.borrow();
        assert!(processes.cache.is_empty());
        assert!(processes.ticks.is_empty());
        assert!(processes.sampled_at.is_none());
    }

    #[test]
    fn last_unlisten_forgets_processes() {
        let (cpu, monitor) = seeded(&Config::default());
        let subject = SubjectId::new();
        monitor.listen(subject, "topProcesses", |_| Ok(()));
        monitor.listen(subject, "cpuUsage", |_| Ok(()));

        monitor.unlisten(subject, Some("cpuUsage"));
        assert_eq!(cpu.processes.borrow().cache.len(), 1);

        monitor.unlisten(subject, Some("topProcesses"));
        assert_forgotten(&cpu);
    }

    #[test]
    fn source_change_resets_processes_and_history() {
        let old = Config::default();
        let (cpu, monitor) = seeded(&old);
        let new = Config {
            processes_source: ProcessesSource::Ps,
            top_processes: 3,
            ..old.clone()
        };
        cpu.reconfigure(&monitor, &old, &new);
        assert_eq!(cpu.strategy.get(), Strategy::Ps);
        assert_eq!(cpu.top_processes.get(), 3);
        assert_forgotten(&cpu);
        assert!(monitor.get_current_value("topProcesses").is_none());
    }

    #[test]
    fn period_change_rescales_eviction() {
        let old = Config::default();
        let (cpu, monitor) = seeded(&old);
        assert_eq!(cpu.processes.borrow().cache.threshold(), 150);

        let new = Config {
            period: Seconds::new(4),
            ..old.clone()
        };
        cpu.reconfigure(&monitor, &old, &new);
        let processes = cpu.processes.borrow();
        assert!(processes.cache.is_empty());
        assert_eq!(processes.cache.threshold(), 75);
        // Only the source decides whether the published list is stale
        assert!(monitor.get_current_value("topProcesses").is_some());
    }
}
