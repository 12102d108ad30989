// Worker child-process supervision: launch, IPC send, exit observation and
// crash-path stdio capture.

use agent_common::constants::{self, WellKnownDirectory};
use agent_common::errors::ChannelError;
use agent_common::host_context::HostContext;
use agent_common::process_channel::{MessageType, ProcessChannel};
use agent_common::tracing::Tracing;
use agent_sdk::{ProcessInvoker, TraceWriter};
use anyhow::{Context as _, Result};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Captured stdout/stderr lines kept for the crash report. Oldest lines are
/// dropped beyond this many so a worker flooding stderr cannot exhaust
/// memory before it dies.
const STDIO_CAPTURE_LIMIT: usize = 1024;

/// Exit code recorded when the worker task itself failed before producing one.
const WORKER_TASK_FAILED: i32 = -1;

/// Bounded, thread-safe accumulator for the worker's stdio.
#[derive(Debug)]
pub struct StdioBuffer {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl StdioBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Take everything captured so far.
    pub fn drain(&self) -> Vec<String> {
        self.lines.lock().unwrap().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lines.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().unwrap().is_empty()
    }
}

impl Default for StdioBuffer {
    fn default() -> Self {
        Self::new(STDIO_CAPTURE_LIMIT)
    }
}

/// Launches the worker given the two pipe handles. The production
/// implementation spawns the `Agent.Worker` child; tests connect an
/// in-process impostor to the channel instead.
pub trait WorkerLauncher: Send + Sync {
    fn launch(
        &self,
        pipe_handle_out: String,
        pipe_handle_in: String,
        stdio: Arc<StdioBuffer>,
        cancel: CancellationToken,
    ) -> JoinHandle<Result<i32>>;
}

/// Spawns the real worker binary at elevated priority and kills its whole
/// process group when `cancel` fires. The worker self-terminates if no job
/// message arrives within 30 s of spawn, so an orphaned child cannot linger.
pub struct ProcessWorkerLauncher {
    context: Arc<HostContext>,
}

impl ProcessWorkerLauncher {
    pub fn new(context: Arc<HostContext>) -> Self {
        Self { context }
    }

    fn worker_binary(bin_dir: &std::path::Path) -> Result<PathBuf> {
        let name = if cfg!(windows) {
            format!("{}.exe", constants::agent::WORKER_PROGRAM)
        } else {
            constants::agent::WORKER_PROGRAM.to_string()
        };
        let path = bin_dir.join(&name);
        if path.exists() {
            Ok(path)
        } else {
            anyhow::bail!("Worker binary not found at {:?}", path)
        }
    }
}

impl WorkerLauncher for ProcessWorkerLauncher {
    fn launch(
        &self,
        pipe_handle_out: String,
        pipe_handle_in: String,
        stdio: Arc<StdioBuffer>,
        cancel: CancellationToken,
    ) -> JoinHandle<Result<i32>> {
        let context = self.context.clone();
        tokio::spawn(async move {
            let trace = context.get_trace("WorkerProcess");
            let bin_dir = context.get_directory(WellKnownDirectory::Bin);
            let worker_binary = Self::worker_binary(&bin_dir)?;

            trace.info(&format!(
                "Starting worker: {:?} {} {} {}",
                worker_binary,
                constants::agent::WORKER_SPAWN_ARG,
                pipe_handle_out,
                pipe_handle_in
            ));

            let mut invoker = ProcessInvoker::new(Arc::new(trace.clone()));

            let mut stdout_rx = invoker
                .take_stdout_receiver()
                .context("stdout receiver already taken")?;
            let stdout_buffer = stdio.clone();
            tokio::spawn(async move {
                while let Some(evt) = stdout_rx.recv().await {
                    stdout_buffer.push(evt.data);
                }
            });

            let mut stderr_rx = invoker
                .take_stderr_receiver()
                .context("stderr receiver already taken")?;
            let stderr_buffer = stdio.clone();
            tokio::spawn(async move {
                while let Some(evt) = stderr_rx.recv().await {
                    stderr_buffer.push(evt.data);
                }
            });

            let arguments = vec![
                constants::agent::WORKER_SPAWN_ARG.to_string(),
                pipe_handle_out,
                pipe_handle_in,
            ];

            invoker
                .execute(
                    bin_dir.to_str().unwrap_or(""),
                    worker_binary.to_str().unwrap_or(""),
                    &arguments,
                    None,
                    true, // elevated priority
                    true, // kill the process tree immediately on cancel
                    cancel,
                )
                .await
        })
    }
}

/// A running worker child: the IPC channel plus the exit observation.
///
/// `wait_exit` may be called from any number of tasks; all of them observe
/// the same exit code. The captured stdio is consumed only when the exit
/// code falls outside the defined set.
pub struct WorkerProcess {
    trace: Tracing,
    channel: ProcessChannel,
    exit_rx: watch::Receiver<Option<i32>>,
    stdio: Arc<StdioBuffer>,
}

impl WorkerProcess {
    /// Create the channel, launch the worker with its pipe handles, and
    /// start supervising its exit.
    pub async fn start(
        context: &Arc<HostContext>,
        launcher: &dyn WorkerLauncher,
        worker_cancel: CancellationToken,
    ) -> Result<Self> {
        let trace = context.get_trace("WorkerProcess");

        let mut channel = ProcessChannel::new();
        // Bind under the system temp dir; deep work directories overflow
        // the Unix socket path limit.
        let handle = channel
            .start_server(&std::env::temp_dir())
            .context("Failed to create IPC channel for worker")?;

        let stdio = Arc::new(StdioBuffer::default());
        let child = launcher.launch(
            handle.clone(),
            handle.clone(),
            stdio.clone(),
            worker_cancel,
        );

        let (exit_tx, exit_rx) = watch::channel(None);
        let exit_trace = trace.clone();
        tokio::spawn(async move {
            let exit_code = match child.await {
                Ok(Ok(code)) => code,
                Ok(Err(e)) => {
                    exit_trace.error(&format!("Worker task failed: {e:#}"));
                    WORKER_TASK_FAILED
                }
                Err(e) => {
                    exit_trace.error(&format!("Worker task panicked: {e}"));
                    WORKER_TASK_FAILED
                }
            };
            let _ = exit_tx.send(Some(exit_code));
        });

        Ok(Self {
            trace,
            channel,
            exit_rx,
            stdio,
        })
    }

    /// Send one control message, bounded by `timeout` end to end. The first
    /// send also waits for the worker to connect to the channel.
    pub async fn send(
        &mut self,
        message_type: MessageType,
        body: &str,
        timeout: Duration,
    ) -> Result<(), ChannelError> {
        if !self.channel.is_connected() {
            if self.has_exited() {
                return Err(ChannelError::Closed);
            }
            self.trace.verbose("Waiting for worker to connect to the IPC channel...");
            match tokio::time::timeout(timeout, self.channel.accept()).await {
                Err(_elapsed) => return Err(ChannelError::Timeout(message_type.to_string())),
                Ok(result) => result?,
            }
        }

        if self.has_exited() {
            return Err(ChannelError::Closed);
        }

        self.trace
            .verbose(&format!("Sending {message_type} to worker."));
        self.channel.send(message_type, body, timeout).await
    }

    /// True once the child has been reaped.
    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// Wait for the worker's exit code. Concurrent callers see the same
    /// result.
    pub async fn wait_exit(&self) -> i32 {
        let mut rx = self.exit_rx.clone();
        let result = match rx.wait_for(|code| code.is_some()).await {
            Ok(code) => (*code).unwrap_or(WORKER_TASK_FAILED),
            // Supervisor dropped without reporting; treat as failed.
            Err(_) => WORKER_TASK_FAILED,
        };
        result
    }

    /// Take the stdio captured so far (crash path only).
    pub fn drain_captured_output(&self) -> Vec<String> {
        self.stdio.drain()
    }
}
