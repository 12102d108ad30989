// agent-sdk: freestanding utilities for the runner.
// No agent state lives here; everything takes its dependencies as arguments.

pub mod process_invoker;
pub mod trace;

pub use process_invoker::{ProcessDataReceivedEventArgs, ProcessExitCodeError, ProcessInvoker};
pub use trace::{CollectingTraceWriter, NullTraceWriter, TraceLevel, TraceWriter};
