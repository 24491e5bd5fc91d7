//! Single-flight cancellable tasks.
//!
//! A [`TaskSlot`] holds at most one in-flight operation. Starting a new run cancels the previous
//! one before the new one begins; the superseded run settles with [`Error::cancelled`], which
//! callers must treat as "nothing to do", never as a failure.

use std::borrow::Cow;
use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;

use tokio::select;
use tokio_util::sync::CancellationToken;

use crate::errors::*;

make_log_macro!(debug, "task");
make_log_macro!(error, "task");

#[derive(Clone, Default)]
pub struct TaskSlot(Rc<RefCell<SlotState>>);

#[derive(Default)]
struct SlotState {
    generation: u64,
    current: Option<InFlight>,
}

struct InFlight {
    generation: u64,
    token: CancellationToken,
}

impl TaskSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start `operation` in this slot, cancelling the run in flight if there is one.
    ///
    /// The operation is driven by the returned future. Dropping that future also releases the
    /// slot.
    pub fn run<T, F>(&self, operation: F) -> impl Future<Output = Result<T>> + 'static
    where
        F: Future<Output = Result<T>> + 'static,
        T: 'static,
    {
        let token = CancellationToken::new();
        let generation = {
            let mut state = self.0.borrow_mut();
            if let Some(prev) = state.current.take() {
                prev.token.cancel();
            }
            state.generation += 1;
            state.current = Some(InFlight {
                generation: state.generation,
                token: token.clone(),
            });
            state.generation
        };

        let guard = SettleGuard {
            slot: self.clone(),
            generation,
        };
        async move {
            let _guard = guard;
            select! {
                biased;
                _ = token.cancelled() => Err(Error::cancelled()),
                res = operation => res,
            }
        }
    }

    /// Cancel the run in flight without starting a new one.
    pub fn cancel(&self) {
        if let Some(prev) = self.0.borrow_mut().current.take() {
            prev.token.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.0.borrow().current.is_some()
    }
}

/// Clears the slot when its run settles, unless it was already superseded.
struct SettleGuard {
    slot: TaskSlot,
    generation: u64,
}

impl Drop for SettleGuard {
    fn drop(&mut self) {
        let mut state = self.slot.0.borrow_mut();
        if state
            .current
            .as_ref()
            .is_some_and(|c| c.generation == self.generation)
        {
            state.current = None;
        }
    }
}

/// Run `operation` in `slot` on the local task set and hand its value to `on_done`.
///
/// Cancellation is logged at debug level, failures at error level; neither propagates, so a
/// failing sub-update never disturbs sibling slots or the sampling loop.
pub fn run_task<T, F, C>(
    slot: &TaskSlot,
    name: impl Into<Cow<'static, str>>,
    operation: F,
    on_done: C,
) where
    T: 'static,
    F: Future<Output = Result<T>> + 'static,
    C: FnOnce(T) + 'static,
{
    let name = name.into();
    let run = slot.run(operation);
    tokio::task::spawn_local(async move {
        match run.await {
            Ok(value) => on_done(value),
            Err(e) if e.is_cancelled() => debug!("{name}: superseded"),
            Err(e) => error!("{name}: {e}"),
        }
    });
}
