//! What goes over standard input and output.
//!
//! Every notification is printed as one JSON object per line:
//!
//! ```json
//! {"monitor":"cpu","topic":"cpuUsage","value":12.5,"time":"2024-05-01T12:00:00.123+02:00"}
//! ```
//!
//! Standard input accepts one command per line:
//!
//! Command                     | Effect
//! ----------------------------|-------
//! `refresh <monitor> <topic>` | Sample `topic` now, outside of the regular period
//! `listen <monitor> <topic>`  | Start printing `topic`
//! `unlisten <monitor> <topic>`| Stop printing `topic`
//!
//! Empty lines and lines starting with `#` are ignored.

use std::io::Write;
use std::str::FromStr;

use chrono::Local;
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio_util::codec::{FramedRead, LinesCodec};

use crate::BoxedStream;
use crate::errors::*;

#[derive(Serialize, Debug)]
pub struct Notification<'a> {
    pub monitor: &'a str,
    pub topic: &'a str,
    pub value: &'a Value,
    pub time: String,
}

impl<'a> Notification<'a> {
    pub fn now(monitor: &'a str, topic: &'a str, value: &'a Value) -> Self {
        Self {
            monitor,
            topic,
            value,
            time: Local::now().to_rfc3339(),
        }
    }

    pub fn write_to(&self, out: &mut impl Write) -> Result<()> {
        serde_json::to_writer(&mut *out, self).error("Failed to serialize notification")?;
        out.write_all(b"\n")
            .and_then(|()| out.flush())
            .error("Failed to write notification")
    }
}

pub fn print_notification(monitor: &str, topic: &str, value: &Value) -> Result<()> {
    Notification::now(monitor, topic, value).write_to(&mut std::io::stdout().lock())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Refresh { monitor: String, topic: String },
    Listen { monitor: String, topic: String },
    Unlisten { monitor: String, topic: String },
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace();
        let (Some(verb), Some(monitor), Some(topic), None) =
            (words.next(), words.next(), words.next(), words.next())
        else {
            return Err(Error::new(format!(
                "Expected '<command> <monitor> <topic>', got '{line}'"
            )));
        };
        let (monitor, topic) = (monitor.to_string(), topic.to_string());
        match verb {
            "refresh" => Ok(Self::Refresh { monitor, topic }),
            "listen" => Ok(Self::Listen { monitor, topic }),
            "unlisten" => Ok(Self::Unlisten { monitor, topic }),
            other => Err(Error::new(format!("Unknown command '{other}'"))),
        }
    }
}

/// Commands read from standard input. Ends with the input.
pub fn commands_stream() -> BoxedStream<Result<Command>> {
    FramedRead::new(tokio::io::stdin(), LinesCodec::new())
        .filter_map(|line| async move {
            match line {
                Ok(line) if line.trim().is_empty() || line.trim_start().starts_with('#') => None,
                Ok(line) => Some(line.parse()),
                Err(e) => Some(Err(Error::new(format!("Failed to read command: {e}")))),
            }
        })
        .boxed_local()
}
