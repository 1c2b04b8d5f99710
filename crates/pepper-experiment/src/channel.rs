//! Line-oriented control channels to a device shell.
//!
//! A [`ControlChannel`] moves whole lines: the RIOT shell answers every command
//! with zero or more output lines followed by its prompt. [`LineFramer`] turns
//! the raw terminal byte stream into such lines, and [`ProcessChannel`] drives
//! a terminal program (`make term`) through its stdio.

use std::collections::VecDeque;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, trace};

use crate::error::ChannelError;

/// Line emitted for a shell prompt.
pub const PROMPT: &str = ">";

/// Whether a framed line is the shell prompt.
pub fn is_prompt(line: &str) -> bool {
    line.trim() == PROMPT
}

/// Decode terminal bytes, dropping anything that isn't valid UTF-8.
pub fn decode_lenient(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .chars()
        .filter(|c| *c != char::REPLACEMENT_CHARACTER)
        .collect()
}

/// Bidirectional, line-framed connection to a device shell.
///
/// `next_line` returns `Ok(None)` once the stream has ended. `close` must be
/// safe to call more than once.
#[async_trait]
pub trait ControlChannel: Send {
    async fn send_line(&mut self, line: &str) -> Result<(), ChannelError>;

    async fn next_line(&mut self) -> Result<Option<String>, ChannelError>;

    async fn close(&mut self) -> Result<(), ChannelError>;
}

/// Splits a terminal byte stream into lines.
///
/// The shell prints its prompt as `"> "` without a newline; a pending
/// fragment consisting only of that prompt is emitted as its own line so
/// readers don't have to wait for the next output.
#[derive(Debug, Default)]
pub struct LineFramer {
    partial: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, returning every line they complete.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in bytes {
            if byte == b'\n' {
                self.take_line(&mut lines);
            } else {
                self.partial.push(byte);
            }
        }
        if is_prompt(&decode_lenient(&self.partial)) {
            self.partial.clear();
            lines.push(PROMPT.to_string());
        }
        lines
    }

    /// Flush the unterminated remainder, if any.
    pub fn finish(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        if !self.partial.is_empty() {
            self.take_line(&mut lines);
        }
        lines
    }

    fn take_line(&mut self, lines: &mut Vec<String>) {
        let raw = decode_lenient(&self.partial);
        self.partial.clear();
        let line = raw.trim_end_matches('\r');
        // output printed right after a prompt shares its line
        match line.strip_prefix("> ") {
            Some(rest) if !rest.trim().is_empty() => {
                lines.push(PROMPT.to_string());
                lines.push(rest.to_string());
            }
            _ => lines.push(line.to_string()),
        }
    }
}

/// Control channel over a child process's stdin/stdout.
pub struct ProcessChannel {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    framer: LineFramer,
    pending: VecDeque<String>,
}

impl ProcessChannel {
    /// Spawn `command` with piped stdio. The child is killed when the
    /// channel is dropped or closed.
    pub fn spawn(mut command: Command) -> std::io::Result<Self> {
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        Ok(Self {
            child: Some(child),
            stdin,
            stdout,
            framer: LineFramer::new(),
            pending: VecDeque::new(),
        })
    }
}

#[async_trait]
impl ControlChannel for ProcessChannel {
    async fn send_line(&mut self, line: &str) -> Result<(), ChannelError> {
        let stdin = self.stdin.as_mut().ok_or(ChannelError::Closed)?;
        trace!(line, "send");
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn next_line(&mut self) -> Result<Option<String>, ChannelError> {
        let mut buf = [0u8; 1024];
        loop {
            if let Some(line) = self.pending.pop_front() {
                return Ok(Some(line));
            }
            let Some(stdout) = self.stdout.as_mut() else {
                return Ok(None);
            };
            let n = stdout.read(&mut buf).await?;
            if n == 0 {
                self.stdout = None;
                self.pending.extend(self.framer.finish());
            } else {
                self.pending.extend(self.framer.push(&buf[..n]));
            }
        }
    }

    async fn close(&mut self) -> Result<(), ChannelError> {
        self.stdin = None;
        self.stdout = None;
        if let Some(mut child) = self.child.take() {
            // already exited is fine
            let _ = child.start_kill();
            let status = child.wait().await?;
            debug!(%status, "Terminal process exited");
        }
        Ok(())
    }
}
