//! Metric families
//!
//! Each family pairs a [`Monitor`] with the code that knows how to sample one kind of metric.
//! The list of families is closed: adding one means adding a module here, a field to
//! [`Config`](crate::config::Config) and a slot to [`Context`](crate::context::Context).

pub mod prelude;

pub mod cpu;
pub mod gpu;
pub mod memory;
pub mod network;

use std::rc::Rc;
use std::time::Duration;

use crate::monitor::{Family, Monitor};

/// Settings every family configuration carries.
pub trait FamilyConfig: Clone + PartialEq {
    fn enabled(&self) -> bool;
    fn period(&self) -> Duration;
}

/// A family that can be built and reconfigured from its configuration section.
pub trait MetricFamily: Family + Sized + 'static {
    type Config: FamilyConfig;

    const NAME: &'static str;

    fn new(config: &Self::Config) -> Self;

    /// Called with both the previous and the new section whenever they differ. The monitor has
    /// already been restarted if the period changed.
    fn reconfigure(&self, monitor: &Monitor, old: &Self::Config, new: &Self::Config);
}

/// A family together with the monitor driving it and the configuration it was built from.
pub struct Slot<F: MetricFamily> {
    pub monitor: Monitor,
    pub family: Rc<F>,
    config: F::Config,
}

impl<F: MetricFamily> Slot<F> {
    pub fn new(config: F::Config, history_length: usize) -> Self {
        let family = Rc::new(F::new(&config));
        let monitor = Monitor::new(F::NAME, config.period(), history_length, family.clone());
        Self {
            monitor,
            family,
            config,
        }
    }

    pub fn config(&self) -> &F::Config {
        &self.config
    }

    pub fn start(&self) {
        if self.config.enabled() {
            self.monitor.start();
        }
    }

    /// Apply a new configuration section, restarting or stopping the monitor as needed.
    pub fn apply(&mut self, new: F::Config) {
        if new == self.config {
            return;
        }
        let old = std::mem::replace(&mut self.config, new);
        let new = &self.config;

        if !new.enabled() {
            self.monitor.stop();
        } else if old.period() != new.period() {
            self.monitor.set_period(new.period());
            self.monitor.restart();
        } else if !self.monitor.is_running() {
            self.monitor.start();
        }
        self.family.reconfigure(&self.monitor, &old, new);
    }
}

/// Round to one decimal, enough for percentages.
pub(crate) fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
