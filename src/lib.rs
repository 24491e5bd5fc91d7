#![warn(clippy::match_same_arms)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![warn(clippy::unnecessary_wraps)]
#![allow(clippy::single_match)]

#[macro_use]
pub mod util;
pub mod config;
pub mod context;
pub mod errors;
pub mod history;
pub mod memo;
pub mod monitor;
pub mod monitors;
pub mod process_cache;
pub mod protocol;
mod signals;
pub mod stream;
pub mod subprocess;
pub mod task;
pub mod wrappers;

pub use env_logger;
pub use serde_json;
pub use tokio;

use std::cell::RefCell;
use std::collections::HashSet;
use std::pin::Pin;
use std::rc::Rc;

use futures::Stream;
use futures::stream::StreamExt;
use tokio::sync::Notify;

use crate::config::Config;
use crate::context::Context;
use crate::errors::*;
use crate::monitor::Monitor;
use crate::protocol::Command;
use crate::signals::Signal;

make_log_macro!(info, "sysmon");
make_log_macro!(warn, "sysmon");

type BoxedStream<T> = Pin<Box<dyn Stream<Item = T>>>;

/// A live system metrics sampler. Monitors periodically sample CPU, memory, network and GPU
/// statistics and sysmon-rs prints every new value as a line of JSON on standard output.
#[derive(Debug, clap::Parser)]
#[clap(author, about, long_about, version = env!("VERSION"))]
pub struct CliArgs {
    /// Sets a TOML config file
    ///
    /// 1. If full absolute path given, then use it as is: `/home/foo/sysmon.toml`
    ///
    /// 2. If filename given, e.g. "laptop.toml", then first look in `$XDG_CONFIG_HOME/sysmon-rs`
    ///
    /// 3. Then look for it in `$XDG_DATA_HOME/sysmon-rs`
    ///
    /// 4. Otherwise look for it in `/usr/share/sysmon-rs`
    ///
    /// Without this argument `config.toml` is looked up the same way and the defaults are used
    /// if it does not exist.
    pub config: Option<String>,
    /// Only print these topics, e.g. `--topics cpuUsage,memoryUsage`
    #[clap(long, value_delimiter = ',')]
    pub topics: Vec<String>,
    /// Log debug messages (overrides RUST_LOG)
    #[clap(long, short)]
    pub verbose: bool,
    /// Exit once every printed topic produced a value
    #[clap(long = "one-shot")]
    pub one_shot: bool,
}

/// Identity of whoever listens to a monitor or a stream, used to replace or remove its callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubjectId(usize);

impl SubjectId {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(util::pseudo_uuid())
    }
}

/// Prints the notifications of the topics selected on the command line.
struct Printer {
    subject: SubjectId,
    topics: Vec<String>,
    one_shot: bool,
    pending: RefCell<HashSet<(&'static str, &'static str)>>,
    done: Notify,
}

impl Printer {
    fn new(args: &CliArgs) -> Rc<Self> {
        Rc::new(Self {
            subject: SubjectId::new(),
            topics: args.topics.clone(),
            one_shot: args.one_shot,
            pending: RefCell::new(HashSet::new()),
            done: Notify::new(),
        })
    }

    fn wants(&self, topic: &str) -> bool {
        self.topics.is_empty() || self.topics.iter().any(|t| t == topic)
    }

    /// Listen to the selected topics of enabled monitors and stop listening to disabled ones.
    /// Safe to call again after a reload.
    fn subscribe(self: &Rc<Self>, context: &Context) {
        for monitor in context.monitors() {
            if !context.is_enabled(monitor.name()) {
                monitor.unlisten(self.subject, None);
                continue;
            }
            for &topic in monitor.topics() {
                if self.wants(topic) {
                    self.listen(monitor, topic);
                }
            }
        }
        if self.one_shot && self.pending.borrow().is_empty() {
            warn!("nothing to print");
            self.done.notify_one();
        }
    }

    fn listen(self: &Rc<Self>, monitor: &Monitor, topic: &'static str) {
        let name = monitor.name();
        if self.one_shot {
            self.pending.borrow_mut().insert((name, topic));
        }
        let this = Rc::clone(self);
        monitor.listen(self.subject, topic, move |value| {
            protocol::print_notification(name, topic, value)?;
            this.printed(name, topic);
            Ok(())
        });
    }

    fn printed(&self, monitor: &'static str, topic: &'static str) {
        if !self.one_shot {
            return;
        }
        let mut pending = self.pending.borrow_mut();
        if pending.remove(&(monitor, topic)) && pending.is_empty() {
            self.done.notify_one();
        }
    }

    /// Resolves once every topic printed something. Never resolves unless in one-shot mode.
    async fn finished(&self) {
        if self.one_shot {
            self.done.notified().await;
        } else {
            std::future::pending::<()>().await;
        }
    }
}

fn handle_command(context: &Context, printer: &Rc<Printer>, command: Command) -> Result<()> {
    let (Command::Refresh { monitor, topic }
    | Command::Listen { monitor, topic }
    | Command::Unlisten { monitor, topic }) = &command;
    let found = context
        .monitor(monitor)
        .or_error(|| format!("Unknown monitor '{monitor}'"))?;
    let topic = found
        .topics()
        .iter()
        .copied()
        .find(|t| *t == topic.as_str())
        .or_error(|| format!("Monitor '{monitor}' has no topic '{topic}'"))?;
    match &command {
        Command::Refresh { .. } => found.request_update(topic),
        Command::Listen { .. } => printer.listen(found, topic),
        Command::Unlisten { .. } => found.unlisten(printer.subject, Some(topic)),
    }
    Ok(())
}

fn reload(context: &mut Context, printer: &Rc<Printer>, args: &CliArgs) -> Result<()> {
    let path = Config::locate(args.config.as_deref())?;
    let config = Config::load(path.as_deref())?;
    context.apply_config(config);
    context.start_all();
    printer.subscribe(context);
    Ok(())
}

/// Run until terminated, or until every topic printed once with `--one-shot`. Must be called
/// inside a [`tokio::task::LocalSet`].
pub async fn run(args: CliArgs) -> Result<()> {
    let path = Config::locate(args.config.as_deref())?;
    match &path {
        Some(path) => info!("using {}", path.display()),
        None => info!("no configuration file, using defaults"),
    }
    let mut context = Context::new(Config::load(path.as_deref())?);

    let printer = Printer::new(&args);
    printer.subscribe(&context);
    context.start_all();

    let mut signals = signals::signals_stream()?;
    let mut commands = protocol::commands_stream();

    loop {
        tokio::select! {
            _ = printer.finished() => break,
            Some(signal) = signals.next() => match signal {
                Signal::Usr1 => context.request_all(),
                Signal::Usr2 => match reload(&mut context, &printer, &args) {
                    Ok(()) => info!("configuration reloaded"),
                    Err(e) => warn!("keeping the current configuration: {e}"),
                },
                Signal::Terminate => break,
            },
            Some(command) = commands.next() => {
                if let Err(e) = command.and_then(|c| handle_command(&context, &printer, c)) {
                    warn!("{e}");
                }
            }
        }
    }

    context.stop_all();
    Ok(())
}
