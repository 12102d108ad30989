use crate::trace::TraceWriter;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How long to wait after SIGINT before escalating to SIGTERM.
const SIGINT_TIMEOUT: Duration = Duration::from_millis(7500);
/// How long to wait after SIGTERM before escalating to SIGKILL.
const SIGTERM_TIMEOUT: Duration = Duration::from_millis(2500);

/// Exit code reported when the child was killed and no real status is available.
const KILLED_EXIT_CODE: i32 = -1;

/// Error type for a child process that exited non-zero when the caller
/// demanded success.
#[derive(Debug, thiserror::Error)]
#[error("Exit code {exit_code} returned from process: file name '{file_name}', arguments {arguments:?}.")]
pub struct ProcessExitCodeError {
    pub exit_code: i32,
    pub file_name: String,
    pub arguments: Vec<String>,
}

/// One line received from the child's stdout or stderr.
#[derive(Debug, Clone)]
pub struct ProcessDataReceivedEventArgs {
    pub data: String,
}

/// Child-process lifecycle manager.
///
/// Spawns the child in its own process group, streams stdout/stderr line
/// events over channels, and honors cancellation either gracefully
/// (SIGINT, then SIGTERM, then SIGKILL of the whole group) or with an
/// immediate group kill. The exit code is always returned, including on the
/// kill path, so supervisors can reap and classify uniformly.
pub struct ProcessInvoker {
    trace: Arc<dyn TraceWriter>,
    stdout_tx: mpsc::UnboundedSender<ProcessDataReceivedEventArgs>,
    stdout_rx: Option<mpsc::UnboundedReceiver<ProcessDataReceivedEventArgs>>,
    stderr_tx: mpsc::UnboundedSender<ProcessDataReceivedEventArgs>,
    stderr_rx: Option<mpsc::UnboundedReceiver<ProcessDataReceivedEventArgs>>,
}

impl ProcessInvoker {
    pub fn new(trace: Arc<dyn TraceWriter>) -> Self {
        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
        Self {
            trace,
            stdout_tx,
            stdout_rx: Some(stdout_rx),
            stderr_tx,
            stderr_rx: Some(stderr_rx),
        }
    }

    /// Take the stdout line receiver. First caller wins; later calls get `None`.
    pub fn take_stdout_receiver(
        &mut self,
    ) -> Option<mpsc::UnboundedReceiver<ProcessDataReceivedEventArgs>> {
        self.stdout_rx.take()
    }

    /// Take the stderr line receiver. First caller wins; later calls get `None`.
    pub fn take_stderr_receiver(
        &mut self,
    ) -> Option<mpsc::UnboundedReceiver<ProcessDataReceivedEventArgs>> {
        self.stderr_rx.take()
    }

    /// Run a child process to completion.
    ///
    /// * `high_priority`: ask the OS to schedule the child above normal
    ///   priority; failure to renice is traced and ignored.
    /// * `kill_process_on_cancel`: skip the signal escalation and kill the
    ///   process group as soon as `cancellation_token` fires.
    ///
    /// Returns the exit code. A child terminated by signal `N` reports
    /// `128 + N`; a child killed by cancellation before any status could be
    /// collected reports `-1`.
    pub async fn execute(
        &self,
        working_directory: &str,
        file_name: &str,
        arguments: &[String],
        environment: Option<&HashMap<String, String>>,
        high_priority: bool,
        kill_process_on_cancel: bool,
        cancellation_token: CancellationToken,
    ) -> Result<i32> {
        assert!(!file_name.is_empty(), "file_name must not be empty");

        self.trace.info("Starting process:");
        self.trace.info(&format!("  File name: '{file_name}'"));
        self.trace.info(&format!("  Arguments: {arguments:?}"));
        self.trace
            .info(&format!("  Working directory: '{working_directory}'"));
        self.trace
            .info(&format!("  High priority: '{high_priority}'"));
        self.trace.info(&format!(
            "  Force kill process on cancellation: '{kill_process_on_cancel}'"
        ));

        let mut std_cmd = std::process::Command::new(file_name);
        std_cmd.args(arguments);

        if !working_directory.is_empty() && Path::new(working_directory).is_dir() {
            std_cmd.current_dir(working_directory);
        }

        if let Some(env) = environment {
            for (key, value) in env {
                std_cmd.env(key, value);
            }
        }

        // The child leads its own process group so that cancellation can
        // reach the whole tree, not just the direct child.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            std_cmd.process_group(0);
        }

        std_cmd.stdin(std::process::Stdio::null());
        std_cmd.stdout(std::process::Stdio::piped());
        std_cmd.stderr(std::process::Stdio::piped());

        let mut cmd = tokio::process::Command::from(std_cmd);
        cmd.kill_on_drop(true);

        let start = std::time::Instant::now();
        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to start process '{file_name}'"))?;

        let pid = child.id().unwrap_or(0);
        self.trace.info(&format!(
            "Process started with process id {pid}, waiting for process exit."
        ));

        if high_priority {
            self.raise_priority(pid);
        }

        // Stream stdout lines.
        let stdout = child.stdout.take();
        let stdout_tx = self.stdout_tx.clone();
        let stdout_trace = self.trace.clone();
        let stdout_task = tokio::spawn(async move {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let _ = stdout_tx.send(ProcessDataReceivedEventArgs { data: line });
                }
            }
            stdout_trace.verbose("STDOUT stream read finished.");
        });

        // Stream stderr lines.
        let stderr = child.stderr.take();
        let stderr_tx = self.stderr_tx.clone();
        let stderr_trace = self.trace.clone();
        let stderr_task = tokio::spawn(async move {
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let _ = stderr_tx.send(ProcessDataReceivedEventArgs { data: line });
                }
            }
            stderr_trace.verbose("STDERR stream read finished.");
        });

        let exit_code = tokio::select! {
            status = child.wait() => {
                let status = status.context("Failed to wait for process")?;
                Self::exit_code_of(&status)
            }
            _ = cancellation_token.cancelled() => {
                self.trace.info("Cancellation requested.");
                self.cancel_and_kill_process(&mut child, kill_process_on_cancel).await
            }
        };

        let _ = stdout_task.await;
        let _ = stderr_task.await;

        let elapsed = start.elapsed();
        self.trace.info(&format!(
            "Finished process {pid} with exit code {exit_code}, and elapsed time {elapsed:.2?}."
        ));

        Ok(exit_code)
    }

    fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            status
                .code()
                .or_else(|| status.signal().map(|s| 128 + s))
                .unwrap_or(KILLED_EXIT_CODE)
        }
        #[cfg(not(unix))]
        {
            status.code().unwrap_or(KILLED_EXIT_CODE)
        }
    }

    /// Escalate SIGINT → SIGTERM → SIGKILL against the child's process group,
    /// or go straight to SIGKILL when `kill_immediately` is set.
    async fn cancel_and_kill_process(
        &self,
        child: &mut tokio::process::Child,
        kill_immediately: bool,
    ) -> i32 {
        if !kill_immediately {
            if self
                .signal_group_and_wait(child, GroupSignal::Int, SIGINT_TIMEOUT)
                .await
            {
                self.trace
                    .info("Process cancelled successfully through SIGINT.");
                return Self::reap(child).await;
            }

            if self
                .signal_group_and_wait(child, GroupSignal::Term, SIGTERM_TIMEOUT)
                .await
            {
                self.trace
                    .info("Process terminated successfully through SIGTERM.");
                return Self::reap(child).await;
            }
        }

        self.trace
            .info("Killing the entire process group of the child process.");
        self.kill_group(child);
        let _ = child.kill().await;
        Self::reap(child).await
    }

    async fn reap(child: &mut tokio::process::Child) -> i32 {
        child
            .wait()
            .await
            .map(|s| Self::exit_code_of(&s))
            .unwrap_or(KILLED_EXIT_CODE)
    }

    #[cfg(unix)]
    async fn signal_group_and_wait(
        &self,
        child: &mut tokio::process::Child,
        signal: GroupSignal,
        timeout: Duration,
    ) -> bool {
        let pid = match child.id() {
            Some(id) => id,
            // Already exited.
            None => return true,
        };

        let sig = match signal {
            GroupSignal::Int => nix::sys::signal::Signal::SIGINT,
            GroupSignal::Term => nix::sys::signal::Signal::SIGTERM,
        };

        self.trace
            .info(&format!("Sending {sig:?} to process group {pid}."));

        if nix::sys::signal::killpg(nix::unistd::Pid::from_raw(pid as i32), sig).is_err() {
            self.trace
                .info(&format!("{sig:?} signal failed to send to process group {pid}."));
            return false;
        }

        tokio::select! {
            result = child.wait() => result.is_ok(),
            _ = tokio::time::sleep(timeout) => {
                self.trace.info(&format!(
                    "Process did not honor {sig:?} within {:.1}s.",
                    timeout.as_secs_f64()
                ));
                false
            }
        }
    }

    #[cfg(not(unix))]
    async fn signal_group_and_wait(
        &self,
        child: &mut tokio::process::Child,
        _signal: GroupSignal,
        timeout: Duration,
    ) -> bool {
        tokio::select! {
            result = child.wait() => result.is_ok(),
            _ = tokio::time::sleep(timeout) => false,
        }
    }

    #[cfg(unix)]
    fn kill_group(&self, child: &tokio::process::Child) {
        if let Some(pid) = child.id() {
            let _ = nix::sys::signal::killpg(
                nix::unistd::Pid::from_raw(pid as i32),
                nix::sys::signal::Signal::SIGKILL,
            );
        }
    }

    #[cfg(not(unix))]
    fn kill_group(&self, _child: &tokio::process::Child) {}

    #[cfg(unix)]
    fn raise_priority(&self, pid: u32) {
        // Above-normal scheduling for the worker. Needs privileges on most
        // systems; a refusal is not worth failing the job over.
        let rc = unsafe { nix::libc::setpriority(nix::libc::PRIO_PROCESS, pid, -4) };
        if rc != 0 {
            self.trace.verbose(&format!(
                "Unable to raise scheduling priority of process {pid}; continuing at normal priority."
            ));
        }
    }

    #[cfg(not(unix))]
    fn raise_priority(&self, _pid: u32) {}
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Int,
    Term,
}
