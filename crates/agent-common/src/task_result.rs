// Terminal job classification and the worker exit-code contract.

use serde::{Deserialize, Serialize};

/// Offset separating well-defined worker exit codes from arbitrary ones.
const RETURN_CODE_OFFSET: i32 = 100;

/// Terminal classification of a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TaskResult {
    Succeeded = 0,
    SucceededWithIssues = 1,
    Failed = 2,
    Canceled = 3,
    Skipped = 4,
    Abandoned = 5,
}

impl TaskResult {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(TaskResult::Succeeded),
            1 => Some(TaskResult::SucceededWithIssues),
            2 => Some(TaskResult::Failed),
            3 => Some(TaskResult::Canceled),
            4 => Some(TaskResult::Skipped),
            5 => Some(TaskResult::Abandoned),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TaskResult::Succeeded => "Succeeded",
            TaskResult::SucceededWithIssues => "SucceededWithIssues",
            TaskResult::Failed => "Failed",
            TaskResult::Canceled => "Canceled",
            TaskResult::Skipped => "Skipped",
            TaskResult::Abandoned => "Abandoned",
        };
        write!(f, "{label}")
    }
}

/// What the worker's exit code means to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// A defined code; the worker finished its protocol normally.
    Defined(TaskResult),
    /// Anything else: the worker died without completing its protocol.
    Crashed(i32),
}

/// The worker reports its result as `100 + TaskResult`. A plain `0` also
/// counts as clean success (a worker that exits before installing its own
/// result translation still succeeded if the OS saw a zero).
pub fn translate_worker_exit_code(exit_code: i32) -> WorkerExit {
    if exit_code == 0 {
        return WorkerExit::Defined(TaskResult::Succeeded);
    }
    match TaskResult::from_i32(exit_code - RETURN_CODE_OFFSET) {
        Some(result) => WorkerExit::Defined(result),
        None => WorkerExit::Crashed(exit_code),
    }
}

/// The exit code a well-behaved worker uses for `result`.
pub fn return_code_for(result: TaskResult) -> i32 {
    RETURN_CODE_OFFSET + result as i32
}
