use futures::stream::StreamExt;
use signal_hook::consts::{SIGINT, SIGTERM, SIGUSR1, SIGUSR2};
use signal_hook_tokio::Signals;

use crate::BoxedStream;
use crate::errors::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Refresh every listened topic
    Usr1,
    /// Reload the configuration file
    Usr2,
    Terminate,
}

/// Returns an infinite stream of `Signal`s
pub fn signals_stream() -> Result<BoxedStream<Signal>> {
    let signals = Signals::new([SIGUSR1, SIGUSR2, SIGINT, SIGTERM])
        .error("Failed to register signal handlers")?;
    Ok(signals
        .map(|signal| match signal {
            SIGUSR1 => Signal::Usr1,
            SIGUSR2 => Signal::Usr2,
            _ => Signal::Terminate,
        })
        .boxed_local())
}
