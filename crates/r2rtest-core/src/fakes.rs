//! In-memory fakes for the process and trace seams (testing only)
//!
//! Provides `ScriptedProcessRunner`, which answers invocations from a list of
//! needle rules instead of spawning anything, `FailingTraceCapture`, and
//! helpers that write minimal managed PE images for discovery tests.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::cancel::CancelToken;
use crate::execution::{TraceCapture, TraceError, TraceSession, TraceSummary};
use crate::process::{CommandSpec, ProcessOutcome, ProcessOutput, ProcessRunner};

// ---------------------------------------------------------------------------
// ScriptedProcessRunner
// ---------------------------------------------------------------------------

/// What a scripted invocation does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedResponse {
    Exit {
        code: i32,
        stdout: String,
        stderr: String,
        delay: Duration,
    },

    /// Killed by a signal.
    Signal(i32),

    /// Never exits on its own.
    Hang,

    /// Spawn fails with `ErrorKind::NotFound`.
    NotFound,
}

impl ScriptedResponse {
    pub fn exit(code: i32) -> Self {
        ScriptedResponse::Exit {
            code,
            stdout: String::new(),
            stderr: String::new(),
            delay: Duration::ZERO,
        }
    }

    pub fn exit_after(code: i32, delay: Duration) -> Self {
        ScriptedResponse::Exit {
            code,
            stdout: String::new(),
            stderr: String::new(),
            delay,
        }
    }

    pub fn fail_with(code: i32, stderr: impl Into<String>) -> Self {
        ScriptedResponse::Exit {
            code,
            stdout: String::new(),
            stderr: stderr.into(),
            delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
struct Rule {
    needles: Vec<String>,
    response: ScriptedResponse,
}

/// [`ProcessRunner`] that matches each command against needle rules.
///
/// A command's searchable text is its rendered command line plus the
/// contents of any `@file` response file argument. The first rule whose
/// needles all occur in that text decides the response; unmatched commands
/// exit 0 immediately.
#[derive(Debug)]
pub struct ScriptedProcessRunner {
    rules: Vec<Rule>,
    fallback: ScriptedResponse,
    invocations: Mutex<Vec<CommandSpec>>,
    active: AtomicUsize,
    peak: AtomicUsize,
    terminated: AtomicUsize,
}

impl Default for ScriptedProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedProcessRunner {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            fallback: ScriptedResponse::exit(0),
            invocations: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            terminated: AtomicUsize::new(0),
        }
    }

    pub fn on(self, needle: impl Into<String>, response: ScriptedResponse) -> Self {
        self.on_all([needle.into()], response)
    }

    /// Rule that fires only when every needle occurs.
    pub fn on_all<I, S>(mut self, needles: I, response: ScriptedResponse) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rules.push(Rule {
            needles: needles.into_iter().map(Into::into).collect(),
            response,
        });
        self
    }

    pub fn otherwise(mut self, response: ScriptedResponse) -> Self {
        self.fallback = response;
        self
    }

    /// Every command received, in arrival order.
    pub fn invocations(&self) -> Vec<CommandSpec> {
        self.invocations.lock().unwrap().clone()
    }

    /// Number of invocations whose text contains `needle`.
    pub fn count_matching(&self, needle: &str) -> usize {
        self.invocations()
            .iter()
            .filter(|c| searchable_text(c).contains(needle))
            .count()
    }

    /// Highest number of invocations in flight at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Invocations still in flight.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Invocations ended by timeout or cancellation.
    pub fn terminated(&self) -> usize {
        self.terminated.load(Ordering::SeqCst)
    }

    fn response_for(&self, text: &str) -> ScriptedResponse {
        self.rules
            .iter()
            .find(|r| r.needles.iter().all(|n| text.contains(n.as_str())))
            .map(|r| r.response.clone())
            .unwrap_or_else(|| self.fallback.clone())
    }
}

fn searchable_text(command: &CommandSpec) -> String {
    let mut text = command.display();
    for arg in &command.args {
        if let Some(path) = arg.strip_prefix('@') {
            text.push('\n');
            text.push_str(&std::fs::read_to_string(path).unwrap_or_default());
        }
    }
    text
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProcessRunner for ScriptedProcessRunner {
    async fn invoke(
        &self,
        command: &CommandSpec,
        timeout: Option<Duration>,
        cancel: &CancelToken,
    ) -> std::io::Result<ProcessOutcome> {
        let text = searchable_text(command);
        self.invocations.lock().unwrap().push(command.clone());
        let response = self.response_for(&text);

        if response == ScriptedResponse::NotFound {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} not found", command.program.display()),
            ));
        }

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = ActiveGuard(&self.active);
        let start = Instant::now();

        let work = async {
            match &response {
                ScriptedResponse::Exit {
                    code,
                    stdout,
                    stderr,
                    delay,
                } => {
                    tokio::time::sleep(*delay).await;
                    (Some(*code), None, stdout.clone(), stderr.clone())
                }
                ScriptedResponse::Signal(signal) => (None, Some(*signal), String::new(), String::new()),
                ScriptedResponse::Hang | ScriptedResponse::NotFound => {
                    std::future::pending::<(Option<i32>, Option<i32>, String, String)>().await
                }
            }
        };
        let deadline = async {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            (exit_code, signal, stdout, stderr) = work => Ok(ProcessOutcome::Exited(ProcessOutput {
                exit_code,
                signal,
                stdout,
                stderr,
                elapsed: start.elapsed(),
            })),
            _ = deadline => {
                self.terminated.fetch_add(1, Ordering::SeqCst);
                Ok(ProcessOutcome::TimedOut {
                    elapsed: start.elapsed(),
                    stdout: String::new(),
                    stderr: String::new(),
                })
            }
            _ = cancel.cancelled() => {
                self.terminated.fetch_add(1, Ordering::SeqCst);
                Ok(ProcessOutcome::Cancelled { elapsed: start.elapsed() })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// FailingTraceCapture
// ---------------------------------------------------------------------------

/// Trace producer whose every attach fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingTraceCapture;

#[async_trait]
impl TraceCapture for FailingTraceCapture {
    async fn attach(&self, _artifact: &Path, _command: &mut CommandSpec) -> Result<TraceSession, TraceError> {
        Err(TraceError::Unavailable("no trace session available".to_string()))
    }

    async fn detach(&self, _session: TraceSession) -> Result<TraceSummary, TraceError> {
        Err(TraceError::Unavailable("no trace session available".to_string()))
    }
}

// ---------------------------------------------------------------------------
// Managed PE images
// ---------------------------------------------------------------------------

const IMAGE_SIZE: usize = 0x400;
const PE_OFFSET: usize = 0x80;
const CLI_HEADER_OFFSET: usize = 0x200;

fn put_u16(buf: &mut [u8], at: usize, value: u16) {
    buf[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

/// Smallest PE32 image with a CLI header: one `.text` section mapping RVA
/// 0x2000 to file offset 0x200. `executable` sets the entry point token.
pub fn managed_image(executable: bool) -> Vec<u8> {
    let mut image = vec![0u8; IMAGE_SIZE];
    image[0..2].copy_from_slice(b"MZ");
    put_u32(&mut image, 0x3c, PE_OFFSET as u32);
    image[PE_OFFSET..PE_OFFSET + 4].copy_from_slice(b"PE\0\0");

    let coff = PE_OFFSET + 4;
    put_u16(&mut image, coff, 0x14c);
    put_u16(&mut image, coff + 2, 1);
    put_u16(&mut image, coff + 16, 224);

    let optional = coff + 20;
    put_u16(&mut image, optional, 0x10b);
    put_u32(&mut image, optional + 92, 16);
    let cli_dir = optional + 96 + 14 * 8;
    put_u32(&mut image, cli_dir, 0x2000);
    put_u32(&mut image, cli_dir + 4, 72);

    let section = optional + 224;
    image[section..section + 5].copy_from_slice(b".text");
    put_u32(&mut image, section + 8, 0x200);
    put_u32(&mut image, section + 12, 0x2000);
    put_u32(&mut image, section + 16, 0x200);
    put_u32(&mut image, section + 20, CLI_HEADER_OFFSET as u32);

    put_u32(&mut image, CLI_HEADER_OFFSET, 72);
    if executable {
        put_u32(&mut image, CLI_HEADER_OFFSET + 20, 0x0600_0001);
    }
    image
}

/// Write [`managed_image`] to `path`, creating parent directories.
pub fn write_managed_assembly(path: &Path, executable: bool) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, managed_image(executable))
}
