use crate::config::Config;
use crate::errors::*;
use crate::monitor::Monitor;
use crate::monitors::Slot;
use crate::monitors::cpu::Cpu;
use crate::monitors::gpu::Gpu;
use crate::monitors::memory::Memory;
use crate::monitors::network::Network;

make_log_macro!(info, "context");

/// Every monitor of the process, built once from the configuration.
pub struct Context {
    history_length: usize,
    cpu: Slot<Cpu>,
    memory: Slot<Memory>,
    network: Slot<Network>,
    gpu: Slot<Gpu>,
}

impl Context {
    pub fn new(config: Config) -> Self {
        let history_length = config.history_length;
        Self {
            history_length,
            cpu: Slot::new(config.cpu, history_length),
            memory: Slot::new(config.memory, history_length),
            network: Slot::new(config.network, history_length),
            gpu: Slot::new(config.gpu, history_length),
        }
    }

    /// In a stable order.
    pub fn monitors(&self) -> [&Monitor; 4] {
        [
            &self.cpu.monitor,
            &self.memory.monitor,
            &self.network.monitor,
            &self.gpu.monitor,
        ]
    }

    pub fn monitor(&self, name: &str) -> Option<&Monitor> {
        self.monitors().into_iter().find(|m| m.name() == name)
    }

    /// Whether `monitor` is enabled in the current configuration.
    pub fn is_enabled(&self, monitor: &str) -> bool {
        match monitor {
            "cpu" => self.cpu.config().enabled,
            "memory" => self.memory.config().enabled,
            "network" => self.network.config().enabled,
            "gpu" => self.gpu.config().enabled,
            _ => false,
        }
    }

    /// Start the enabled monitors.
    pub fn start_all(&self) {
        self.cpu.start();
        self.memory.start();
        self.network.start();
        self.gpu.start();
    }

    pub fn stop_all(&self) {
        for monitor in self.monitors() {
            monitor.stop();
        }
    }

    /// Reconfigure every monitor whose section changed. Listeners are kept.
    pub fn apply_config(&mut self, config: Config) {
        if config.history_length != self.history_length {
            info!("history length is now {}", config.history_length);
            self.history_length = config.history_length;
            for monitor in self.monitors() {
                monitor.set_history_length(config.history_length);
                if monitor.is_running() {
                    monitor.restart();
                }
            }
        }
        self.cpu.apply(config.cpu);
        self.memory.apply(config.memory);
        self.network.apply(config.network);
        self.gpu.apply(config.gpu);
    }

    /// Refresh one topic out of band.
    pub fn request_update(&self, monitor: &str, topic: &str) -> Result<()> {
        let monitor = self
            .monitor(monitor)
            .or_error(|| format!("Unknown monitor '{monitor}'"))?;
        if !monitor.topics().contains(&topic) {
            return Err(Error::new(format!(
                "Monitor '{}' has no topic '{topic}'",
                monitor.name()
            )));
        }
        monitor.request_update(topic);
        Ok(())
    }

    /// Refresh every listened topic of every running monitor.
    pub fn request_all(&self) {
        for monitor in self.monitors() {
            if monitor.is_running() {
                for topic in monitor.listened_topics() {
                    monitor.request_update(&topic);
                }
            }
        }
    }
}
