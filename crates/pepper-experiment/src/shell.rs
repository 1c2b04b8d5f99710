//! PEPPER shell protocol.
//!
//! [`ShellInteraction`] is the base every capability builds on: dispatch a
//! command line, then capture its output until the prompt returns. The
//! capabilities a PEPPER firmware exposes are separate traits layered on top
//! of it ([`PepperControl`], [`ClockControl`], [`RebootControl`]) and are all
//! implemented by the one [`DeviceSession`] type.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Local, NaiveDateTime};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::channel::{ControlChannel, is_prompt};
use crate::error::ChannelError;

/// A control channel shared between a session and the teardown registry.
pub type SharedChannel = Arc<Mutex<Box<dyn ControlChannel>>>;

static UID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"uid\s+(DW[0-9A-Za-z]+)").expect("valid uid regex"));
static STATUS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"status:\s+([A-Za-z]+)").expect("valid status regex"));
static EPOCH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Epoch:\s+(\d+)$").expect("valid epoch regex"));
static DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Date:\s+(\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2})$").expect("valid date regex")
});

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Parameters of a PEPPER campaign, sent with `pepper start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PepperParams {
    /// Number of epochs; 0 runs until stopped
    pub iterations: u32,
    /// Epoch duration in seconds
    pub duration: u32,
    /// Advertisement interval in milliseconds
    pub adv_itvl: u32,
    /// Advertisements per EBID slice
    pub advs_slice: u32,
    /// Scan interval in milliseconds
    pub scan_itvl: u32,
    /// Scan window in milliseconds
    pub scan_win: u32,
    /// Align epoch start with the wall clock
    pub align_start: bool,
    /// Align epoch end with the wall clock
    pub align_end: bool,
}

impl Default for PepperParams {
    fn default() -> Self {
        Self {
            iterations: 0,
            duration: 900,
            adv_itvl: 1000,
            advs_slice: 20,
            scan_itvl: 4096,
            scan_win: 1024,
            align_start: false,
            align_end: false,
        }
    }
}

impl PepperParams {
    /// Arguments of the `pepper` command starting a campaign.
    pub fn start_args(&self) -> String {
        let mut args = format!(
            "start -d {} -i {} -r {} -c {} -s {},{}",
            self.duration,
            self.adv_itvl,
            self.advs_slice,
            self.iterations,
            self.scan_win,
            self.scan_itvl
        );
        if self.align_end {
            args.push_str(" -e");
        }
        if self.align_start {
            args.push_str(" -a");
        }
        args
    }
}

/// How a capture ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureEnd {
    Prompt,
    Closed,
    Deadline,
}

/// Output lines of one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capture {
    pub lines: Vec<String>,
    pub end: CaptureEnd,
}

impl Capture {
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    /// The prompt came back.
    pub fn completed(&self) -> bool {
        self.end == CaptureEnd::Prompt
    }

    fn find<'a>(&'a self, re: &Regex) -> Option<&'a str> {
        self.lines
            .iter()
            .find_map(|line| re.captures(line).and_then(|c| c.get(1)))
            .map(|m| m.as_str())
    }
}

/// One step of reading a command's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Line(String),
    Prompt,
    Closed,
    Deadline,
}

/// Base request/response interaction with a device shell.
#[async_trait]
pub trait ShellInteraction: Send + Sync {
    fn node_id(&self) -> &str;

    /// Deadline for short commands.
    fn command_timeout(&self) -> Duration;

    async fn send_line(&self, line: &str) -> Result<(), ChannelError>;

    async fn next_line(&self) -> Result<Option<String>, ChannelError>;

    /// Send a command without waiting for its output.
    async fn dispatch(&self, command: &str) -> Result<(), ChannelError> {
        debug!(node = %self.node_id(), command, "Dispatch");
        self.send_line(command).await
    }

    /// Read the next line, classifying prompt, end of stream and deadline.
    async fn next_step(&self, deadline: Option<Instant>) -> Result<Step, ChannelError> {
        let next = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, self.next_line()).await {
                Ok(next) => next?,
                Err(_) => return Ok(Step::Deadline),
            },
            None => self.next_line().await?,
        };
        Ok(match next {
            Some(line) if is_prompt(&line) => Step::Prompt,
            Some(line) => Step::Line(line),
            None => Step::Closed,
        })
    }

    /// Collect output until the prompt, end of stream or `deadline`.
    async fn capture(&self, deadline: Option<Instant>) -> Result<Capture, ChannelError> {
        let mut lines = Vec::new();
        let end = loop {
            match self.next_step(deadline).await? {
                Step::Line(line) => lines.push(line),
                Step::Prompt => break CaptureEnd::Prompt,
                Step::Closed => break CaptureEnd::Closed,
                Step::Deadline => break CaptureEnd::Deadline,
            }
        };
        Ok(Capture { lines, end })
    }

    /// Drop output that is already waiting, e.g. boot messages.
    async fn discard_pending(&self) -> Result<usize, ChannelError> {
        let mut discarded = 0;
        while let Ok(next) = tokio::time::timeout(Duration::ZERO, self.next_line()).await {
            match next? {
                Some(line) => {
                    debug!(node = %self.node_id(), line = %line, "Discarding stale output");
                    discarded += 1;
                }
                None => break,
            }
        }
        Ok(discarded)
    }

    /// Run a short command and capture its reply.
    async fn cmd(&self, command: &str) -> Result<Capture, ChannelError> {
        self.discard_pending().await?;
        self.dispatch(command).await?;
        self.capture(Some(Instant::now() + self.command_timeout()))
            .await
    }
}

/// Campaign control of the PEPPER application.
#[async_trait]
pub trait PepperControl: ShellInteraction {
    /// Device uid (`DW....`); `None` when the reply has none.
    async fn get_uid(&self) -> Result<Option<String>, ChannelError> {
        let capture = self.cmd("pepper get uid").await?;
        Ok(capture.find(&UID).map(str::to_string))
    }

    /// Whether a campaign is running.
    async fn status(&self) -> Result<bool, ChannelError> {
        let capture = self.cmd("pepper status").await?;
        Ok(capture.find(&STATUS) == Some("active"))
    }

    /// Start a campaign; its output is read by the caller.
    async fn start(&self, params: &PepperParams) -> Result<(), ChannelError> {
        self.dispatch(&format!("pepper {}", params.start_args()))
            .await
    }

    /// Ask a running campaign to stop; its output is read by the caller.
    async fn stop(&self) -> Result<(), ChannelError> {
        self.dispatch("pepper stop").await
    }

    async fn set(&self, key: &str, value: &str) -> Result<Capture, ChannelError> {
        self.cmd(&format!("pepper set {key} {value}")).await
    }
}

/// Device clock as reported by `time`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceTime {
    pub epoch: Option<u64>,
    pub date: Option<NaiveDateTime>,
}

/// Query and set the device wall clock.
#[async_trait]
pub trait ClockControl: ShellInteraction {
    async fn time_get(&self) -> Result<DeviceTime, ChannelError> {
        let capture = self.cmd("time").await?;
        Ok(DeviceTime {
            epoch: capture.find(&EPOCH).and_then(|e| e.parse().ok()),
            date: capture
                .find(&DATE)
                .and_then(|d| NaiveDateTime::parse_from_str(d, DATE_FORMAT).ok()),
        })
    }

    async fn time_set(&self, time: NaiveDateTime) -> Result<Capture, ChannelError> {
        self.cmd(&time.format("time %Y %m %d %H %M %S").to_string())
            .await
    }

    /// Set the device clock to the local time of the host.
    async fn current_time_set_now(&self) -> Result<Capture, ChannelError> {
        self.time_set(Local::now().naive_local()).await
    }
}

#[async_trait]
pub trait RebootControl: ShellInteraction {
    async fn reboot(&self) -> Result<Capture, ChannelError> {
        self.cmd("reboot").await
    }
}

/// An open shell session to one provisioned device.
#[derive(Clone)]
pub struct DeviceSession {
    node_id: String,
    channel: SharedChannel,
    command_timeout: Duration,
}

impl DeviceSession {
    pub fn new(node_id: impl Into<String>, channel: Box<dyn ControlChannel>) -> Self {
        Self::shared(node_id, Arc::new(Mutex::new(channel)))
    }

    pub fn shared(node_id: impl Into<String>, channel: SharedChannel) -> Self {
        Self {
            node_id: node_id.into(),
            channel,
            command_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn channel(&self) -> &SharedChannel {
        &self.channel
    }

    pub async fn close(&self) -> Result<(), ChannelError> {
        self.channel.lock().await.close().await
    }
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("node_id", &self.node_id)
            .field("command_timeout", &self.command_timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ShellInteraction for DeviceSession {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    async fn send_line(&self, line: &str) -> Result<(), ChannelError> {
        self.channel.lock().await.send_line(line).await
    }

    async fn next_line(&self) -> Result<Option<String>, ChannelError> {
        self.channel.lock().await.next_line().await
    }
}

impl PepperControl for DeviceSession {}
impl ClockControl for DeviceSession {}
impl RebootControl for DeviceSession {}
