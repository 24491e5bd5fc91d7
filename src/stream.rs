//! Long-lived processes whose output is delivered in batches.
//!
//! A [`StreamTask`] owns at most one session: an external process, the lines it printed since
//! the last flush and the flush policy. Listeners receive [`StreamEvent::Data`] whenever the
//! policy decides the buffer is complete and a single [`StreamEvent::Exit`] when the output
//! ends. `stop` bypasses both: buffered lines are dropped and no event is sent.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use futures::{Stream, StreamExt};
use serde::Deserialize;
use smart_default::SmartDefault;
use tokio::process::Child;
use tokio::select;
use tokio::time::{Instant, Interval, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::SubjectId;
use crate::errors::*;
use crate::subprocess::{self, StreamingChild};
use crate::wrappers::{Seconds, SerdeRegex};

make_log_macro!(debug, "stream");
make_log_macro!(warn, "stream");

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Data(String),
    Exit,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq, SmartDefault)]
#[serde(deny_unknown_fields, default)]
pub struct StreamOptions {
    pub flush: FlushMode,
    /// Flush unconditionally on this period, in addition to `flush`.
    pub interval: Option<Seconds>,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq, SmartDefault)]
#[serde(rename_all = "lowercase")]
pub enum FlushMode {
    /// After every line.
    #[default]
    Always,
    /// When a line contains the substring.
    Trigger(String),
    /// When a line matches the pattern.
    Match(SerdeRegex),
    /// Once no line arrived for the given period.
    Idle(Seconds),
}

impl FlushMode {
    fn flushes_on(&self, line: &str) -> bool {
        match self {
            Self::Always => true,
            Self::Trigger(trigger) => line.contains(trigger.as_str()),
            Self::Match(pattern) => pattern.0.is_match(line),
            Self::Idle(_) => false,
        }
    }
}

type Listener = Rc<dyn Fn(&StreamEvent) -> Result<()>>;

#[derive(Clone, Default)]
pub struct StreamTask(Rc<RefCell<Inner>>);

/// A [`StreamTask`] handle that does not keep it alive, for use inside its own listeners.
#[derive(Clone)]
pub struct WeakStreamTask(Weak<RefCell<Inner>>);

impl WeakStreamTask {
    pub fn upgrade(&self) -> Option<StreamTask> {
        self.0.upgrade().map(StreamTask)
    }
}

#[derive(Default)]
struct Inner {
    generation: u64,
    session: Option<Session>,
    listeners: Vec<(SubjectId, Listener)>,
}

struct Session {
    generation: u64,
    token: CancellationToken,
    buffer: Vec<String>,
}

impl StreamTask {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn downgrade(&self) -> WeakStreamTask {
        WeakStreamTask(Rc::downgrade(&self.0))
    }

    /// Spawn `sh -c command` and stream its output. A running session is stopped first.
    pub fn start(&self, command: &str, options: StreamOptions) {
        self.stop();
        match subprocess::spawn_lines(command) {
            Ok(StreamingChild { child, lines }) => self.spawn_session(Some(child), lines, options),
            Err(e) => {
                warn!("{e}");
                self.emit(&StreamEvent::Exit, None);
            }
        }
    }

    /// Same as [`StreamTask::start`], reading from an already existing line source.
    pub fn start_with_lines<S>(&self, lines: S, options: StreamOptions)
    where
        S: Stream<Item = Result<String>> + 'static,
    {
        self.stop();
        self.spawn_session(None, lines, options);
    }

    /// Terminate the process and drop whatever was buffered. No event is emitted.
    pub fn stop(&self) {
        if let Some(session) = self.0.borrow_mut().session.take() {
            session.token.cancel();
            if !session.buffer.is_empty() {
                debug!("discarding {} buffered lines", session.buffer.len());
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.0.borrow().session.is_some()
    }

    /// Register `callback` for `subject`, replacing its previous one.
    pub fn listen<F>(&self, subject: SubjectId, callback: F)
    where
        F: Fn(&StreamEvent) -> Result<()> + 'static,
    {
        let mut inner = self.0.borrow_mut();
        let callback: Listener = Rc::new(callback);
        match inner.listeners.iter_mut().find(|(s, _)| *s == subject) {
            Some((_, existing)) => *existing = callback,
            None => inner.listeners.push((subject, callback)),
        }
    }

    pub fn unlisten(&self, subject: SubjectId) {
        self.0.borrow_mut().listeners.retain(|(s, _)| *s != subject);
    }

    fn spawn_session<S>(&self, child: Option<Child>, lines: S, options: StreamOptions)
    where
        S: Stream<Item = Result<String>> + 'static,
    {
        let token = CancellationToken::new();
        let generation = {
            let mut inner = self.0.borrow_mut();
            inner.generation += 1;
            inner.session = Some(Session {
                generation: inner.generation,
                token: token.clone(),
                buffer: Vec::new(),
            });
            inner.generation
        };
        let this = self.clone();
        tokio::task::spawn_local(async move {
            this.drive(generation, token, child, lines.boxed_local(), options)
                .await;
        });
    }

    async fn drive(
        &self,
        generation: u64,
        token: CancellationToken,
        mut child: Option<Child>,
        mut lines: subprocess::Lines,
        options: StreamOptions,
    ) {
        let idle = match &options.flush {
            FlushMode::Idle(period) => Some(period.0),
            _ => None,
        };
        let mut idle_deadline = None;
        let mut interval = options.interval.map(Seconds::timer);

        loop {
            select! {
                biased;
                _ = token.cancelled() => {
                    if let Some(child) = &mut child {
                        subprocess::terminate(child);
                    }
                    return;
                }
                line = lines.next() => match line {
                    Some(Ok(line)) => {
                        let flush = options.flush.flushes_on(&line);
                        self.buffer_line(generation, line);
                        if let Some(idle) = idle {
                            idle_deadline = Some(Instant::now() + idle);
                        }
                        if flush {
                            self.flush(generation);
                        }
                    }
                    Some(Err(e)) => {
                        warn!("{e}");
                        break;
                    }
                    None => break,
                },
                _ = wait_until(idle_deadline) => {
                    idle_deadline = None;
                    self.flush(generation);
                }
                _ = tick(&mut interval) => self.flush(generation),
            }
        }

        let ended = {
            let mut inner = self.0.borrow_mut();
            match &inner.session {
                Some(session) if session.generation == generation => inner.session.take(),
                _ => None,
            }
        };
        if let Some(session) = ended {
            if !session.buffer.is_empty() {
                debug!("output ended with {} unflushed lines", session.buffer.len());
            }
            self.emit(&StreamEvent::Exit, None);
        }
        if let Some(mut child) = child {
            match child.wait().await {
                Ok(status) => debug!("process exited with {status}"),
                Err(e) => warn!("failed to reap process: {e}"),
            }
        }
    }

    fn buffer_line(&self, generation: u64, line: String) {
        if let Some(session) = self.0.borrow_mut().session.as_mut() {
            if session.generation == generation {
                session.buffer.push(line);
            }
        }
    }

    fn flush(&self, generation: u64) {
        let payload = {
            let mut inner = self.0.borrow_mut();
            match inner.session.as_mut() {
                Some(s) if s.generation == generation && !s.buffer.is_empty() => {
                    std::mem::take(&mut s.buffer).join("\n")
                }
                _ => return,
            }
        };
        self.emit(&StreamEvent::Data(payload), Some(generation));
    }

    /// Deliver `event` to every listener. Data events stop being delivered as soon as a listener
    /// stops or restarts the session.
    fn emit(&self, event: &StreamEvent, generation: Option<u64>) {
        let listeners: Vec<_> = self.0.borrow().listeners.clone();
        for (subject, listener) in listeners {
            if let Some(generation) = generation {
                let current = self.0.borrow().session.as_ref().map(|s| s.generation);
                if current != Some(generation) {
                    break;
                }
            }
            if let Err(e) = listener(event) {
                warn!("listener {subject:?} failed: {e}");
            }
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
