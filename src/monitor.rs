//! The sampling unit shared by every metric family.
//!
//! A [`Monitor`] owns the periodic timer, the per-topic histories and the listener registry of
//! one family. What a tick actually fetches is up to its [`Family`], which typically skips topics
//! nobody listens to and runs each sub-update in its own [`TaskSlot`](crate::task::TaskSlot).

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::Duration;

use indexmap::IndexMap;
use serde_json::Value;
use tokio::select;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::SubjectId;
use crate::errors::*;
use crate::history::History;
use crate::process_cache::Tick;

make_log_macro!(debug, "monitor");
make_log_macro!(warn, "monitor");

/// Periods below this are refused by [`Monitor::start`].
pub const MIN_PERIOD: Duration = Duration::from_millis(100);

/// The metric specific half of a sampling unit.
pub trait Family {
    /// Topics this family produces.
    fn topics(&self) -> &'static [&'static str];

    /// Called on every tick.
    fn update(&self, monitor: &Monitor);

    /// Refresh `topic` right now, outside of the regular ticks. Returns `false` for unknown
    /// topics.
    fn update_topic(&self, monitor: &Monitor, topic: &str) -> bool;

    /// The last listener of `topic` went away.
    fn topic_unlistened(&self, _monitor: &Monitor, _topic: &str) {}

    /// Cancel everything in flight.
    fn stop(&self) {}
}

pub type Callback = Rc<dyn Fn(&Value) -> Result<()>>;

#[derive(Clone)]
pub struct Monitor(Rc<Inner>);

/// A [`Monitor`] handle which does not keep it alive, for callbacks owned by the family itself.
#[derive(Clone)]
pub struct WeakMonitor(Weak<Inner>);

impl WeakMonitor {
    pub fn upgrade(&self) -> Option<Monitor> {
        self.0.upgrade().map(Monitor)
    }
}

struct Inner {
    name: &'static str,
    family: Rc<dyn Family>,
    state: RefCell<State>,
}

struct State {
    period: Duration,
    history_length: usize,
    timer: Option<CancellationToken>,
    tick: Tick,
    histories: HashMap<String, History>,
    listeners: IndexMap<String, Vec<(SubjectId, Callback)>>,
}

impl Monitor {
    pub fn new(
        name: &'static str,
        period: Duration,
        history_length: usize,
        family: Rc<dyn Family>,
    ) -> Self {
        Self(Rc::new(Inner {
            name,
            family,
            state: RefCell::new(State {
                period,
                history_length,
                timer: None,
                tick: 0,
                histories: HashMap::new(),
                listeners: IndexMap::new(),
            }),
        }))
    }

    pub fn name(&self) -> &'static str {
        self.0.name
    }

    pub fn downgrade(&self) -> WeakMonitor {
        WeakMonitor(Rc::downgrade(&self.0))
    }

    pub fn topics(&self) -> &'static [&'static str] {
        self.0.family.topics()
    }

    pub fn period(&self) -> Duration {
        self.0.state.borrow().period
    }

    /// Takes effect on the next [`Monitor::start`], see [`Monitor::restart`].
    pub fn set_period(&self, period: Duration) {
        self.0.state.borrow_mut().period = period;
    }

    /// Applies to histories created after the next [`Monitor::stop`].
    pub fn set_history_length(&self, length: usize) {
        self.0.state.borrow_mut().history_length = length;
    }

    pub fn is_running(&self) -> bool {
        self.0.state.borrow().timer.is_some()
    }

    /// Number of ticks since this monitor was created.
    pub fn tick_count(&self) -> Tick {
        self.0.state.borrow().tick
    }

    /// Start ticking: once right away, then every period. Returns `false` and does nothing if
    /// already running or if the period is too short.
    pub fn start(&self) -> bool {
        let (token, period) = {
            let mut state = self.0.state.borrow_mut();
            if state.timer.is_some() {
                debug!("{}: already running", self.0.name);
                return false;
            }
            if state.period < MIN_PERIOD {
                warn!(
                    "{}: refusing to start with a period of {:?} (minimum is {:?})",
                    self.0.name, state.period, MIN_PERIOD
                );
                return false;
            }
            let token = CancellationToken::new();
            state.timer = Some(token.clone());
            (token, state.period)
        };

        let weak: Weak<Inner> = Rc::downgrade(&self.0);
        tokio::task::spawn_local(async move {
            let mut timer = tokio::time::interval(period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = timer.tick() => (),
                }
                match weak.upgrade() {
                    Some(inner) => Monitor(inner).tick(),
                    None => break,
                }
            }
        });
        debug!("{}: started with period {:?}", self.0.name, period);
        true
    }

    /// Stop ticking, forget all history and cancel in-flight work. Returns `false` if not
    /// running.
    pub fn stop(&self) -> bool {
        let Some(timer) = self.0.state.borrow_mut().timer.take() else {
            return false;
        };
        timer.cancel();
        self.0.state.borrow_mut().histories.clear();
        self.0.family.stop();
        debug!("{}: stopped", self.0.name);
        true
    }

    pub fn restart(&self) {
        self.stop();
        self.start();
    }

    fn tick(&self) {
        self.0.state.borrow_mut().tick += 1;
        self.0.family.update(self);
    }

    /// Refresh `topic` out of band, even if nobody listens to it. The refresh's own value
    /// overwrites the newest sample so that the series keeps one sample per period.
    ///
    /// Does nothing on a stopped monitor or an unknown topic.
    pub fn request_update(&self, topic: &str) {
        if !self.topics().contains(&topic) {
            warn!("{}: unknown topic '{topic}'", self.0.name);
            return;
        }
        if !self.is_running() {
            debug!("{}: not running, ignoring refresh of '{topic}'", self.0.name);
            return;
        }
        {
            let mut state = self.0.state.borrow_mut();
            let length = state.history_length;
            state
                .histories
                .entry(topic.to_string())
                .or_insert_with(|| History::new(length))
                .enqueue();
        }
        self.0.family.update_topic(self, topic);
    }

    /*
     * History
     */

    pub fn push_usage_history(&self, key: &str, value: Value) {
        let mut state = self.0.state.borrow_mut();
        let length = state.history_length;
        state
            .histories
            .entry(key.to_string())
            .or_insert_with(|| History::new(length))
            .push(value);
    }

    pub fn set_usage_value(&self, key: &str, value: Value) {
        let mut state = self.0.state.borrow_mut();
        let length = state.history_length;
        state
            .histories
            .entry(key.to_string())
            .or_insert_with(|| History::new(length))
            .set_single(value);
    }

    /// Most recent first.
    pub fn get_usage_history(&self, key: &str) -> Vec<Value> {
        self.0
            .state
            .borrow()
            .histories
            .get(key)
            .map(|h| h.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get_current_value(&self, key: &str) -> Option<Value> {
        self.0
            .state
            .borrow()
            .histories
            .get(key)
            .and_then(|h| h.current().cloned())
    }

    pub fn reset_usage_history(&self, key: &str) {
        if let Some(history) = self.0.state.borrow_mut().histories.get_mut(key) {
            history.clear();
        }
    }

    /*
     * Listeners
     */

    /// Register `callback` for `subject` on `topic`, replacing a previous registration.
    pub fn listen<F>(&self, subject: SubjectId, topic: &str, callback: F)
    where
        F: Fn(&Value) -> Result<()> + 'static,
    {
        let mut state = self.0.state.borrow_mut();
        let callbacks = state.listeners.entry(topic.to_string()).or_default();
        let callback: Callback = Rc::new(callback);
        match callbacks.iter_mut().find(|(s, _)| *s == subject) {
            Some((_, existing)) => *existing = callback,
            None => callbacks.push((subject, callback)),
        }
    }

    /// Remove the registration of `subject` on `topic`, or on every topic if `None`.
    pub fn unlisten(&self, subject: SubjectId, topic: Option<&str>) {
        let mut abandoned = Vec::new();
        {
            let mut state = self.0.state.borrow_mut();
            state.listeners.retain(|t, callbacks| {
                if topic.is_some_and(|topic| topic != t) {
                    return true;
                }
                let before = callbacks.len();
                callbacks.retain(|(s, _)| *s != subject);
                if callbacks.is_empty() {
                    if before > 0 {
                        abandoned.push(t.clone());
                    }
                    return false;
                }
                true
            });
        }
        for topic in abandoned {
            debug!("{}: nobody listens to '{topic}' anymore", self.0.name);
            self.0.family.topic_unlistened(self, &topic);
        }
    }

    pub fn is_listened(&self, topic: &str) -> bool {
        self.0
            .state
            .borrow()
            .listeners
            .get(topic)
            .is_some_and(|l| !l.is_empty())
    }

    pub fn listened_topics(&self) -> Vec<String> {
        self.0.state.borrow().listeners.keys().cloned().collect()
    }

    /// Call every listener of `topic` in registration order. A failing listener is logged and
    /// does not prevent the others from being called.
    pub fn notify(&self, topic: &str, value: &Value) {
        let callbacks: Vec<(SubjectId, Callback)> = match self.0.state.borrow().listeners.get(topic)
        {
            Some(callbacks) => callbacks.clone(),
            None => return,
        };
        for (subject, callback) in callbacks {
            if let Err(e) = callback(value) {
                warn!("{}: listener {subject:?} of '{topic}' failed: {e}", self.0.name);
            }
        }
    }

    /// Push `value` to the history of `topic` and notify its listeners.
    pub fn publish(&self, topic: &str, value: Value) {
        self.push_usage_history(topic, value.clone());
        self.notify(topic, &value);
    }

    /// Set `value` as the only value of `topic` and notify its listeners.
    pub fn publish_single(&self, topic: &str, value: Value) {
        self.set_usage_value(topic, value.clone());
        self.notify(topic, &value);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(timer) = self.state.get_mut().timer.take() {
            timer.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskSlot, run_task};
    use serde_json::json;
    use std::cell::Cell;
    use tokio::task::LocalSet;
    use tokio::time::sleep;

    /// Produces an increasing number on "usage" (or an error while `failing` is set) and a
    /// constant list on "topProcesses".
    #[derive(Default)]
    struct Fake {
        usage_runs: Cell<u32>,
        top_runs: Cell<u32>,
        unlistened: RefCell<Vec<String>>,
        stopped: Cell<bool>,
        failing: Cell<bool>,
        usage_slot: TaskSlot,
        top_slot: TaskSlot,
    }

    impl Fake {
        fn update_usage(&self, monitor: &Monitor) {
            self.usage_runs.set(self.usage_runs.get() + 1);
            if self.failing.get() {
                let monitor = monitor.clone();
                run_task(
                    &self.usage_slot,
                    "usage",
                    async { Err::<Value, _>(Error::new("counters unavailable")) },
                    move |v| monitor.publish("usage", v),
                );
                return;
            }
            monitor.publish("usage", json!(self.usage_runs.get()));
        }

        fn update_top(&self, monitor: &Monitor) {
            self.top_runs.set(self.top_runs.get() + 1);
            let monitor = monitor.clone();
            run_task(
                &self.top_slot,
                "top",
                async {
                    sleep(Duration::from_millis(5)).await;
                    Ok(json!([1, 2]))
                },
                move |v| monitor.publish_single("topProcesses", v),
            );
        }
    }

    impl Family for Fake {
        fn topics(&self) -> &'static [&'static str] {
            &["usage", "topProcesses"]
        }

        fn update(&self, monitor: &Monitor) {
            if monitor.is_listened("usage") {
                self.update_usage(monitor);
            }
            if monitor.is_listened("topProcesses") {
                self.update_top(monitor);
            }
        }

        fn update_topic(&self, monitor: &Monitor, topic: &str) -> bool {
            match topic {
                "usage" => self.update_usage(monitor),
                "topProcesses" => self.update_top(monitor),
                _ => return false,
            }
            true
        }

        fn topic_unlistened(&self, _monitor: &Monitor, topic: &str) {
            self.unlistened.borrow_mut().push(topic.to_string());
        }

        fn stop(&self) {
            self.stopped.set(true);
            self.top_slot.cancel();
        }
    }

    fn make_fake(period_ms: u64) -> (Rc<Fake>, Monitor) {
        let fake = Rc::new(Fake::default());
        let monitor = Monitor::new(
            "fake",
            Duration::from_millis(period_ms),
            3,
            fake.clone(),
        );
        (fake, monitor)
    }

    fn ok(_: &Value) -> Result<()> {
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn unlistened_topics_are_skipped_but_refreshable() {
        LocalSet::new()
            .run_until(async {
                let (fake, monitor) = make_fake(1000);
                monitor.listen(SubjectId::new(), "usage", ok);
                assert!(monitor.start());
                sleep(Duration::from_millis(2500)).await;
                assert_eq!(monitor.tick_count(), 3);
                assert_eq!(fake.usage_runs.get(), 3);
                assert_eq!(fake.top_runs.get(), 0);

                monitor.request_update("topProcesses");
                sleep(Duration::from_millis(10)).await;
                assert_eq!(fake.top_runs.get(), 1);
                assert_eq!(monitor.get_current_value("topProcesses"), Some(json!([1, 2])));
                assert_eq!(monitor.tick_count(), 3);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn history_is_bounded_and_out_of_band_overwrites() {
        LocalSet::new()
            .run_until(async {
                let (_fake, monitor) = make_fake(1000);
                monitor.listen(SubjectId::new(), "usage", ok);
                monitor.start();
                sleep(Duration::from_millis(4500)).await;
                assert_eq!(
                    monitor.get_usage_history("usage"),
                    [json!(5), json!(4), json!(3)]
                );

                monitor.push_usage_history("usage", json!(6));
                assert_eq!(monitor.get_usage_history("usage").len(), 3);
                monitor.request_update("usage");
                assert_eq!(
                    monitor.get_usage_history("usage"),
                    [json!(6), json!(5), json!(4)]
                );
                sleep(Duration::from_millis(1000)).await;
                assert_eq!(
                    monitor.get_usage_history("usage"),
                    [json!(7), json!(6), json!(5)]
                );
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_rejected_when_running_or_too_fast() {
        LocalSet::new()
            .run_until(async {
                let (_, fast) = make_fake(10);
                assert!(!fast.start());
                assert!(!fast.is_running());

                let (fake, monitor) = make_fake(1000);
                assert!(monitor.start());
                assert!(!monitor.start());
                monitor.set_usage_value("usage", json!(1));
                assert!(monitor.stop());
                assert!(!monitor.is_running());
                assert!(fake.stopped.get());
                assert!(monitor.get_usage_history("usage").is_empty());
                assert!(!monitor.stop());

                let ticks = monitor.tick_count();
                sleep(Duration::from_secs(5)).await;
                assert_eq!(monitor.tick_count(), ticks);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn restart_applies_new_period() {
        LocalSet::new()
            .run_until(async {
                let (_, monitor) = make_fake(1000);
                monitor.start();
                sleep(Duration::from_millis(1500)).await;
                assert_eq!(monitor.tick_count(), 2);
                monitor.set_period(Duration::from_millis(200));
                monitor.restart();
                sleep(Duration::from_millis(500)).await;
                assert_eq!(monitor.tick_count(), 2 + 3);
                assert!(monitor.is_running());
            })
            .await;
    }

    #[test]
    fn listeners_replace_and_run_in_order() {
        let (fake, monitor) = make_fake(1000);
        let calls = Rc::new(RefCell::new(Vec::new()));
        let (a, b) = (SubjectId::new(), SubjectId::new());

        let c = calls.clone();
        monitor.listen(a, "usage", move |_| {
            c.borrow_mut().push("a1");
            Ok(())
        });
        monitor.listen(b, "usage", |_| Err(Error::new("menu closed")));
        let c = calls.clone();
        monitor.listen(a, "usage", move |_| {
            c.borrow_mut().push("a2");
            Ok(())
        });
        let c = calls.clone();
        monitor.listen(SubjectId::new(), "usage", move |_| {
            c.borrow_mut().push("c");
            Ok(())
        });

        monitor.notify("usage", &json!(1));
        assert_eq!(*calls.borrow(), ["a2", "c"]);

        monitor.unlisten(a, Some("usage"));
        monitor.unlisten(b, None);
        assert!(monitor.is_listened("usage"));
        assert!(fake.unlistened.borrow().is_empty());
    }

    #[test]
    fn last_unlisten_invokes_hook() {
        let (fake, monitor) = make_fake(1000);
        let subject = SubjectId::new();
        monitor.listen(subject, "usage", ok);
        monitor.listen(subject, "topProcesses", ok);
        assert_eq!(monitor.listened_topics(), ["usage", "topProcesses"]);
        monitor.unlisten(subject, None);
        assert!(!monitor.is_listened("usage"));
        assert_eq!(*fake.unlistened.borrow(), ["usage", "topProcesses"]);

        monitor.unlisten(subject, None);
        assert_eq!(fake.unlistened.borrow().len(), 2);
    }

    #[test]
    fn reset_usage_history_keeps_other_topics() {
        let (_, monitor) = make_fake(1000);
        monitor.push_usage_history("usage", json!(1));
        monitor.set_usage_value("topProcesses", json!([]));
        monitor.reset_usage_history("usage");
        assert!(monitor.get_current_value("usage").is_none());
        assert_eq!(monitor.get_current_value("topProcesses"), Some(json!([])));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_is_ignored_when_stopped_or_unknown() {
        LocalSet::new()
            .run_until(async {
                let (fake, monitor) = make_fake(1000);
                monitor.request_update("usage");
                assert_eq!(fake.usage_runs.get(), 0);
                assert!(monitor.get_current_value("usage").is_none());

                monitor.start();
                sleep(Duration::from_millis(10)).await;
                monitor.request_update("disk");
                monitor.push_usage_history("usage", json!(1));
                monitor.request_update("usage");
                assert_eq!(fake.usage_runs.get(), 1);
                assert_eq!(monitor.get_usage_history("disk"), Vec::<Value>::new());
                assert_eq!(monitor.get_usage_history("usage"), [json!(1)]);

                monitor.stop();
                monitor.request_update("usage");
                assert_eq!(fake.usage_runs.get(), 1);
                assert!(monitor.get_current_value("usage").is_none());
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_fetch_keeps_history() {
        LocalSet::new()
            .run_until(async {
                let (fake, monitor) = make_fake(1000);
                monitor.listen(SubjectId::new(), "usage", ok);
                monitor.start();
                sleep(Duration::from_millis(1500)).await;
                assert_eq!(monitor.get_usage_history("usage"), [json!(2), json!(1)]);

                fake.failing.set(true);
                sleep(Duration::from_millis(2000)).await;
                assert_eq!(fake.usage_runs.get(), 4);
                assert_eq!(monitor.get_usage_history("usage"), [json!(2), json!(1)]);
                assert!(monitor.is_running());

                fake.failing.set(false);
                sleep(Duration::from_millis(1000)).await;
                assert_eq!(monitor.get_current_value("usage"), Some(json!(5)));
            })
            .await;
    }
}
