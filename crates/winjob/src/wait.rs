//! Bridges a process handle's kernel signal to an awaitable, one-shot,
//! multi-waiter completion.
//!
//! The registration owns a private duplicate of the process handle and a
//! cancel event, and parks a worker on the runtime's blocking pool waiting
//! on the pair. Because the worker waits on its own duplicate, a recycled
//! handle value can never be mistaken for the process it watched.

use std::sync::Arc;

use tokio::sync::watch;
use windows::Win32::Foundation::HANDLE;

use winjob_core::Result;

use crate::sys::{self, OwnedHandle};

/// How the exit completion resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExitOutcome {
    /// The process handle signaled.
    Signaled,
    /// The owning `Process` was dropped first.
    Cancelled,
}

pub(crate) type ExitSender = Arc<watch::Sender<Option<ExitOutcome>>>;
pub(crate) type ExitReceiver = watch::Receiver<Option<ExitOutcome>>;

/// Resolves the completion exactly once.
pub(crate) fn complete(sender: &ExitSender, outcome: ExitOutcome) {
    sender.send_if_modified(|current| {
        if current.is_none() {
            *current = Some(outcome);
            true
        } else {
            false
        }
    });
}

/// A live wait against a process handle.
pub(crate) struct ExitWaitRegistration {
    cancel_event: Arc<OwnedHandle>,
    sender: ExitSender,
}

impl ExitWaitRegistration {
    /// Duplicates `process` and parks a blocking-pool worker on it. The
    /// worker resolves the completion when either the process signals or
    /// the registration is cancelled.
    pub fn register(process: HANDLE, sender: ExitSender) -> Result<ExitWaitRegistration> {
        let duplicate = sys::duplicate_handle(process, 0, false, sys::DUPLICATE_SAME_ACCESS)?;
        let cancel_event = Arc::new(sys::create_event()?);

        let worker_event = Arc::clone(&cancel_event);
        let worker_sender = Arc::clone(&sender);
        tokio::task::spawn_blocking(move || {
            let outcome = match sys::wait_either(duplicate.raw(), worker_event.raw()) {
                Ok(0) => ExitOutcome::Signaled,
                // cancel event, or a wait failure after the registration
                // was torn down
                _ => ExitOutcome::Cancelled,
            };
            complete(&worker_sender, outcome);
            // `duplicate` closes here, on the thread that waited on it
        });

        Ok(ExitWaitRegistration { cancel_event, sender })
    }

    /// Cancels the wait: the completion resolves as cancelled immediately
    /// (unless it already signaled) and the parked worker is released.
    pub fn cancel(&self) {
        complete(&self.sender, ExitOutcome::Cancelled);
        let _ = sys::set_event(self.cancel_event.raw());
    }
}

impl Drop for ExitWaitRegistration {
    fn drop(&mut self) {
        self.cancel();
    }
}
