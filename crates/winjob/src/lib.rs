//! Windows process creation and resource-governed process groups.
//!
//! `Process` wraps a single created process: command-line construction,
//! standard-stream redirection, alternate credentials, suspension, and an
//! awaitable exit. `JobObject` groups processes under enforced CPU, memory,
//! time, and UI limits and raises typed events when the kernel reports limit
//! violations or population changes. All job events in a process flow
//! through one shared, reference-counted completion-port listener.
//!
//! The platform-independent data model (limits, notifications, settings,
//! escaping, stream decoding) lives in `winjob-core` and is re-exported
//! here.

#[cfg(windows)]
mod job;
#[cfg(windows)]
mod listener;
#[cfg(windows)]
mod process;
#[cfg(windows)]
mod sys;
#[cfg(windows)]
mod wait;

#[cfg(windows)]
pub use job::{IoLimitKind, JobCapabilities, JobEvent, JobObject};
#[cfg(windows)]
pub use process::{PipeReader, PipeWriter, Process, ReadOutcome, StreamReadHandle, spawn_lock};

pub use winjob_core::*;
