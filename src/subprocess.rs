use std::process::Stdio;

use futures::StreamExt;
use futures::stream::LocalBoxStream;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio_util::codec::{FramedRead, LinesCodec};

use crate::errors::*;

/// Lines longer than this are reported as a read error instead of growing the buffer forever.
const MAX_LINE_LENGTH: usize = 64 * 1024;

pub type Lines = LocalBoxStream<'static, Result<String>>;

/// A long-lived child process with its standard output split into lines.
pub struct StreamingChild {
    pub child: Child,
    pub lines: Lines,
}

fn shell(cmd: &str) -> Command {
    let mut command = Command::new("sh");
    command
        .args(["-c", cmd])
        .stdin(Stdio::null())
        .stderr(Stdio::null());
    command
}

/// Run a one-shot command and return its standard output. Spawn failures and non-zero exit
/// statuses are errors.
pub async fn run_output(cmd: &str) -> Result<String> {
    let output = shell(cmd)
        .output()
        .await
        .or_error(|| format!("Failed to run '{cmd}'"))?;
    if !output.status.success() {
        return Err(Error::new(format!("'{cmd}' exited with {}", output.status)));
    }
    String::from_utf8(output.stdout).or_error(|| format!("'{cmd}' produced non-UTF8 output"))
}

/// Spawn a long-lived command. The child is killed when dropped.
pub fn spawn_lines(cmd: &str) -> Result<StreamingChild> {
    let mut child = shell(cmd)
        .stdout(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .or_error(|| format!("Failed to spawn '{cmd}'"))?;
    let stdout = child
        .stdout
        .take()
        .or_error(|| format!("Failed to pipe '{cmd}' output"))?;
    let lines = FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_LINE_LENGTH))
        .map(|line| line.error("Failed to read process output"))
        .boxed_local();
    Ok(StreamingChild { child, lines })
}

/// Ask the child to exit. If it ignores SIGTERM it is killed once dropped.
pub fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
}
