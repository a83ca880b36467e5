// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Supervised execution of external processes.
//!
//! A [`Supervisor`] launches a child process and multiplexes, on a
//! current-thread tokio runtime: awaiting the child, reading its stdout and
//! stderr line streams, periodic resource reporting, and cancellation. Each
//! complete line is passed through an optional output wrangler and then to a
//! [`LineSink`], by default the `log` pipeline at INFO (stdout) or WARNING
//! (stderr). Lines longer than [`LINE_BUFFER`] are split at the buffer
//! boundary and tagged as continuations.
//!
//! On cancellation (or timeout expiry, which behaves the same way) the
//! supervisor invokes the kill callback if one was provided; otherwise it
//! sends SIGINT and walks a retry ladder: SIGTERM after 5 one-second
//! retries, SIGKILL after 10.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use itertools::Itertools;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use sysinfo::System;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Line reads are capped at this size; longer lines are split.
pub const LINE_BUFFER: usize = 16 * 1024;

const RETRY_PERIOD: Duration = Duration::from_secs(1);
const TERM_RETRY: u32 = 5;
const KILL_RETRIES: u32 = 10;
const REPORT_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    pub fn default_level(&self) -> log::Level {
        match self {
            Stream::Stdout => log::Level::Info,
            Stream::Stderr => log::Level::Warn,
        }
    }
}

/// One dispatched line of child output.
#[derive(Debug, Clone, Copy)]
pub struct Line<'a> {
    pub text: &'a str,
    pub stream: Stream,
    /// True when this is the tail of a line split at [`LINE_BUFFER`].
    pub continuation: bool,
}

/// Receives classified lines of child output.
pub trait LineSink: Send {
    fn dispatch(&mut self, line: Line<'_>, level: log::Level);
}

/// Default sink: the `log` facade, with a fixed target.
pub struct LogSink {
    target: String,
}

impl LogSink {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }
}

impl LineSink for LogSink {
    fn dispatch(&mut self, line: Line<'_>, level: log::Level) {
        if line.continuation {
            log::log!(target: &self.target, level, "[cont] {}", line.text);
        } else {
            log::log!(target: &self.target, level, "{}", line.text);
        }
    }
}

/// Filters and reclassifies lines before they reach the sink. Returning
/// `None` suppresses the line.
pub type Wrangler = Box<dyn FnMut(&str, Stream) -> Option<(String, log::Level)> + Send>;

pub type KillCallback = Box<dyn FnOnce() + Send>;

pub struct Supervisor {
    command: String,
    options: Vec<String>,
    env: Option<HashMap<String, String>>,
    shell: bool,
    timeout: Option<Duration>,
    return_errcode: bool,
    command_name: Option<String>,
    report_resources: bool,
    cancel: CancellationToken,
    kill_callback: Option<KillCallback>,
    wrangler: Option<Wrangler>,
}

impl Supervisor {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            options: vec![],
            env: None,
            shell: false,
            timeout: None,
            return_errcode: false,
            command_name: None,
            report_resources: false,
            cancel: CancellationToken::new(),
            kill_callback: None,
            wrangler: None,
        }
    }

    pub fn options(mut self, options: impl IntoIterator<Item = impl ToString>) -> Self {
        self.options = options.into_iter().map(|opt| opt.to_string()).collect();
        self
    }

    pub fn env(mut self, env: HashMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    pub fn shell(mut self, shell: bool) -> Self {
        self.shell = shell;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn return_errcode(mut self, return_errcode: bool) -> Self {
        self.return_errcode = return_errcode;
        self
    }

    pub fn command_name(mut self, name: impl Into<String>) -> Self {
        self.command_name = Some(name.into());
        self
    }

    pub fn report_resources(mut self, report: bool) -> Self {
        self.report_resources = report;
        self
    }

    pub fn kill_callback(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.kill_callback = Some(Box::new(callback));
        self
    }

    pub fn wrangler(
        mut self,
        wrangler: impl FnMut(&str, Stream) -> Option<(String, log::Level)> + Send + 'static,
    ) -> Self {
        self.wrangler = Some(Box::new(wrangler));
        self
    }

    /// Token that interrupts the supervised process when cancelled.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the child to completion, dispatching its output to `sink`.
    pub fn run(self, sink: &mut dyn LineSink) -> Result<i32, Error> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(Error::Runtime)?;
        runtime.block_on(self.supervise(sink))
    }

    /// Fallback used when no log pipeline is available: the child inherits
    /// stdio and no line capture, cancellation or timeout applies.
    pub fn run_inherited(self) -> Result<i32, Error> {
        let name = self.name();

        let mut command = if self.shell {
            let mut command = std::process::Command::new("/bin/sh");
            command.arg("-c").arg(self.command_line());
            command
        } else {
            let mut command = std::process::Command::new(&self.command);
            command.args(&self.options);
            command
        };
        if let Some(env) = &self.env {
            command.env_clear().envs(env);
        }

        let status = command
            .status()
            .map_err(|source| Error::Spawn { name: name.clone(), source })?;

        finish(status, &name, self.return_errcode)
    }

    fn name(&self) -> String {
        self.command_name.clone().unwrap_or_else(|| self.command.clone())
    }

    fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.options.iter().map(String::as_str))
            .join(" ")
    }

    async fn supervise(mut self, sink: &mut dyn LineSink) -> Result<i32, Error> {
        let name = self.name();
        let command_line = self.command_line();

        log::info!(target: &name, "running {command_line}");

        let mut command = if self.shell {
            let mut command = Command::new("/bin/sh");
            command.arg("-c").arg(&command_line);
            command
        } else {
            let mut command = Command::new(&self.command);
            command.args(&self.options);
            command
        };
        if let Some(env) = &self.env {
            command.env_clear().envs(env);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|source| Error::Spawn { name: name.clone(), source })?;

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");
        let mut out = LineReader::new(stdout);
        let mut err = LineReader::new(stderr);

        let mut wrangler = self.wrangler.take();
        let kill_callback = self.kill_callback.take();

        let mut dispatch = |text: String, continuation: bool, stream: Stream| {
            let line = match wrangler.as_mut() {
                Some(wrangle) => wrangle(&text, stream),
                None => Some((text, stream.default_level())),
            };
            if let Some((text, level)) = line {
                sink.dispatch(
                    Line {
                        text: &text,
                        stream,
                        continuation,
                    },
                    level,
                );
            }
        };

        let mut report = tokio::time::interval(REPORT_PERIOD);
        report.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut system = self.report_resources.then(System::new);

        let deadline = self.timeout.map(|t| tokio::time::Instant::now() + t);
        let sleep_until = deadline.unwrap_or_else(tokio::time::Instant::now);
        let cancel = self.cancel.clone();

        let status = loop {
            tokio::select! {
                status = child.wait() => break status.map_err(Error::Wait)?,
                line = out.next_line(), if !out.done() => {
                    if let Some((text, continuation)) = line {
                        dispatch(text, continuation, Stream::Stdout);
                    }
                }
                line = err.next_line(), if !err.done() => {
                    if let Some((text, continuation)) = line {
                        dispatch(text, continuation, Stream::Stderr);
                    }
                }
                _ = report.tick() => {
                    if let Some(system) = system.as_mut() {
                        report_usage(&name, system);
                    }
                }
                _ = cancel.cancelled() => {
                    return Err(shutdown(&name, &mut child, kill_callback, Cause::Interrupt).await);
                }
                _ = tokio::time::sleep_until(sleep_until), if deadline.is_some() => {
                    let timeout = self.timeout.unwrap_or_default();
                    return Err(shutdown(&name, &mut child, kill_callback, Cause::Timeout(timeout)).await);
                }
            }
        };

        // drain whatever is still buffered in the pipes
        while let Some((text, continuation)) = out.next_line().await {
            dispatch(text, continuation, Stream::Stdout);
        }
        while let Some((text, continuation)) = err.next_line().await {
            dispatch(text, continuation, Stream::Stderr);
        }

        finish(status, &name, self.return_errcode)
    }
}

fn finish(status: ExitStatus, name: &str, return_errcode: bool) -> Result<i32, Error> {
    if status.success() {
        return Ok(0);
    }

    let code = status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1);

    if return_errcode {
        Ok(code)
    } else {
        Err(Error::Failed {
            name: name.to_owned(),
            code,
        })
    }
}

enum Cause {
    Interrupt,
    Timeout(Duration),
}

async fn shutdown(
    name: &str,
    child: &mut Child,
    kill_callback: Option<KillCallback>,
    cause: Cause,
) -> Error {
    match &cause {
        Cause::Interrupt => {
            log::warn!(target: name, "Ctrl+C caught: shutting down the {name} process, please give it a few moments");
        }
        Cause::Timeout(timeout) => {
            log::warn!(target: name, "{name} exceeded its timeout of {}s, shutting it down", timeout.as_secs());
        }
    }

    if let Some(callback) = kill_callback {
        callback();
        let _ = child.wait().await;
        log::info!(target: name, "the {name} process was shut down");
    } else if let Some(pid) = child.id() {
        let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGINT);

        let mut exited = false;
        for retry in 1..=KILL_RETRIES {
            tokio::time::sleep(RETRY_PERIOD).await;
            if let Ok(Some(status)) = child.try_wait() {
                log::info!(target: name, "process {pid} has exited with {status}");
                exited = true;
                break;
            }
            if retry == TERM_RETRY {
                log::warn!(target: name, "process {pid} not exited after {retry} retries, terminating it");
                let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            } else {
                log::info!(target: name, "process {pid} not exited after {retry} retries, waiting a bit longer");
            }
        }
        if !exited {
            log::warn!(target: name, "killing process {pid}");
            let _ = child.kill().await;
        }
    }

    match cause {
        Cause::Interrupt => Error::Interrupted {
            name: name.to_owned(),
        },
        Cause::Timeout(timeout) => Error::Timeout {
            name: name.to_owned(),
            secs: timeout.as_secs(),
        },
    }
}

fn report_usage(name: &str, system: &mut System) {
    const GIB: u64 = 1024 * 1024 * 1024;

    system.refresh_cpu();
    system.refresh_memory();

    let cpu = system.global_cpu_info().cpu_usage();
    let used = system.used_memory() / GIB;
    let total = system.total_memory() / GIB;

    log::debug!(target: name, "CPU {cpu:.0}% RAM {used}/{total}G");
}

/// Incremental line reader with a hard cap on line length.
struct LineReader<R> {
    reader: R,
    buf: Vec<u8>,
    pending: VecDeque<(String, bool)>,
    continuation: bool,
    eof: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            buf: vec![],
            pending: VecDeque::new(),
            continuation: false,
            eof: false,
        }
    }

    fn done(&self) -> bool {
        self.eof && self.pending.is_empty() && self.buf.is_empty()
    }

    async fn next_line(&mut self) -> Option<(String, bool)> {
        loop {
            if let Some(line) = self.pending.pop_front() {
                return Some(line);
            }
            if self.eof {
                if self.buf.is_empty() {
                    return None;
                }
                let text = String::from_utf8_lossy(&self.buf).into_owned();
                self.buf.clear();
                let continuation = std::mem::take(&mut self.continuation);
                return Some((text, continuation));
            }

            let mut chunk = [0u8; 4096];
            match self.reader.read(&mut chunk).await {
                Ok(0) | Err(_) => self.eof = true,
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    self.split();
                }
            }
        }
    }

    fn split(&mut self) {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                let continuation = std::mem::replace(&mut self.continuation, false);
                self.pending
                    .push_back((String::from_utf8_lossy(&line).into_owned(), continuation));
            } else if self.buf.len() >= LINE_BUFFER {
                let segment: Vec<u8> = self.buf.drain(..LINE_BUFFER).collect();
                let continuation = std::mem::replace(&mut self.continuation, true);
                self.pending
                    .push_back((String::from_utf8_lossy(&segment).into_owned(), continuation));
            } else {
                break;
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to spawn {name}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("build supervisor runtime")]
    Runtime(#[source] io::Error),
    #[error("wait on child")]
    Wait(#[source] io::Error),
    #[error("{name} returns error code {code}")]
    Failed { name: String, code: i32 },
    #[error("{name} interrupted with Ctrl+C")]
    Interrupted { name: String },
    #[error("{name} timed out after {secs}s")]
    Timeout { name: String, secs: u64 },
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    use super::*;

    #[derive(Default, Clone)]
    struct Collect {
        lines: Arc<Mutex<Vec<(String, Stream, bool, log::Level)>>>,
    }

    impl Collect {
        fn lines(&self) -> Vec<(String, Stream, bool, log::Level)> {
            self.lines.lock().unwrap().clone()
        }
    }

    impl LineSink for Collect {
        fn dispatch(&mut self, line: Line<'_>, level: log::Level) {
            self.lines.lock().unwrap().push((
                line.text.to_owned(),
                line.stream,
                line.continuation,
                level,
            ));
        }
    }

    #[test]
    fn captures_stdout() {
        let mut sink = Collect::default();
        let status = Supervisor::new("echo")
            .options(["hello"])
            .run(&mut sink)
            .unwrap();
        assert_eq!(status, 0);

        let lines = sink.lines();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].0, "hello");
        assert_eq!(lines[0].1, Stream::Stdout);
        assert_eq!(lines[0].3, log::Level::Info);
    }

    #[test]
    fn stderr_is_warning() {
        let mut sink = Collect::default();
        Supervisor::new("echo oops 1>&2")
            .shell(true)
            .run(&mut sink)
            .unwrap();

        let lines = sink.lines();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].1, Stream::Stderr);
        assert_eq!(lines[0].3, log::Level::Warn);
    }

    #[test]
    fn nonzero_exit_fails() {
        let mut sink = Collect::default();
        let result = Supervisor::new("false").run(&mut sink);
        assert!(matches!(result, Err(Error::Failed { code: 1, .. })));
    }

    #[test]
    fn nonzero_exit_returned_when_requested() {
        let mut sink = Collect::default();
        let status = Supervisor::new("false")
            .return_errcode(true)
            .run(&mut sink)
            .unwrap();
        assert_eq!(status, 1);
    }

    #[test]
    fn spawn_failure() {
        let mut sink = Collect::default();
        let result = Supervisor::new("/no/such/binary-exists").run(&mut sink);
        assert!(matches!(result, Err(Error::Spawn { .. })));
    }

    #[test]
    fn wrangler_filters_and_reclassifies() {
        let mut sink = Collect::default();
        Supervisor::new("printf 'keep\\ndrop\\n'")
            .shell(true)
            .wrangler(|line, _| {
                (line != "drop").then(|| (format!(">{line}"), log::Level::Debug))
            })
            .run(&mut sink)
            .unwrap();

        let lines = sink.lines();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].0, ">keep");
        assert_eq!(lines[0].3, log::Level::Debug);
    }

    #[test]
    fn long_lines_are_split_with_continuations() {
        let total = LINE_BUFFER * 2 + 100;
        let mut sink = Collect::default();
        Supervisor::new(format!(
            "head -c {total} /dev/zero | tr '\\0' 'x'; echo"
        ))
        .shell(true)
        .run(&mut sink)
        .unwrap();

        let lines = sink.lines();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].0.len(), LINE_BUFFER);
        assert!(!lines[0].2);
        assert!(lines[1].2);
        assert!(lines[2].2);
        assert_eq!(lines[2].0.len(), 100);
    }

    #[test]
    fn inherited_mode_reports_status_only() {
        assert_eq!(Supervisor::new("true").run_inherited().unwrap(), 0);
        assert!(matches!(
            Supervisor::new("false").run_inherited(),
            Err(Error::Failed { code: 1, .. })
        ));
    }

    #[test]
    fn cancellation_interrupts_within_bounds() {
        let mut sink = Collect::default();
        let supervisor = Supervisor::new("sleep").options(["30"]);
        let token = supervisor.cancellation();

        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            token.cancel();
        });

        let start = Instant::now();
        let error = supervisor.run(&mut sink).unwrap_err();
        assert!(matches!(&error, Error::Interrupted { .. }));
        assert!(error.to_string().contains("Ctrl+C"));
        assert!(start.elapsed() < Duration::from_secs(15));
    }

    #[test]
    fn kill_callback_is_preferred() {
        let called = Arc::new(Mutex::new(false));
        let flag = called.clone();

        let mut sink = Collect::default();
        let supervisor = Supervisor::new("sh")
            .options(["-c", "sleep 31"])
            .kill_callback(move || {
                *flag.lock().unwrap() = true;
                // emulate an external teardown
                let _ = std::process::Command::new("pkill")
                    .args(["-f", "sleep 31"])
                    .status();
            });
        let token = supervisor.cancellation();

        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            token.cancel();
        });

        let result = supervisor.run(&mut sink);
        assert!(matches!(result, Err(Error::Interrupted { .. })));
        assert!(*called.lock().unwrap());
    }

    #[test]
    fn timeout_behaves_like_interrupt() {
        let mut sink = Collect::default();
        let start = Instant::now();
        let result = Supervisor::new("sleep")
            .options(["30"])
            .timeout(Duration::from_millis(300))
            .run(&mut sink);
        assert!(matches!(result, Err(Error::Timeout { .. })));
        assert!(start.elapsed() < Duration::from_secs(15));
    }
}
