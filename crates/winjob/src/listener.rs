//! The shared job-notification listener.
//!
//! One completion port and one background reader thread serve every live
//! `JobObject` in the process. The pair is created on the first `acquire`
//! and torn down when the last handle drops: the releasing thread posts a
//! poison-pill packet (zero key, zero data, zero length, distinguishable
//! from any real notification) and joins the reader before the port handle
//! is released.
//!
//! Two locks with different jobs: a process-wide registry lock that only
//! guards the acquire/release refcount, and a registration lock on the key
//! table, which is touched far more often and must not queue behind
//! teardown.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::ptr::null_mut;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, error, trace};
use windows::Win32::Foundation::HANDLE;
use windows::Win32::System::IO::{
    CreateIoCompletionPort, GetQueuedCompletionStatus, OVERLAPPED, PostQueuedCompletionStatus,
};

use winjob_core::os_code;
use winjob_core::raw::JobMessage;
use winjob_core::{Error, Result};

use crate::sys::{self, OwnedHandle};

const INFINITE: u32 = u32::MAX;

/// Callback invoked on the reader thread for each dequeued notification.
/// Implementations must hand real work to the runtime instead of doing it
/// here.
pub(crate) type DispatchFn = Arc<dyn Fn(JobMessage, usize) + Send + Sync>;

struct Registry {
    shared: Option<Arc<PortShared>>,
    refs: usize,
}

static REGISTRY: Mutex<Registry> = Mutex::new(Registry { shared: None, refs: 0 });

struct PortShared {
    port: OwnedHandle,
    keys: Mutex<HashMap<usize, DispatchFn>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

/// An owning reference to the process-wide listener. Dropping the last one
/// shuts the reader thread down and closes the port.
pub(crate) struct ListenerHandle {
    shared: Arc<PortShared>,
}

/// Acquires the shared listener, creating the port and reader thread on the
/// 0 to 1 refcount transition.
pub(crate) fn acquire() -> Result<ListenerHandle> {
    let mut registry = REGISTRY.lock().unwrap();

    if registry.refs == 0 {
        let port = unsafe { CreateIoCompletionPort(sys::INVALID_HANDLE_VALUE, None, 0, 0) }
            .map_err(sys::map_err)?;
        let shared = Arc::new(PortShared {
            port: OwnedHandle::from_raw(port),
            keys: Mutex::new(HashMap::new()),
            reader: Mutex::new(None),
        });

        let thread = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("winjob-notify".into())
                .spawn(move || reader_loop(shared))?
        };
        *shared.reader.lock().unwrap() = Some(thread);

        debug!("created shared job notification port");
        registry.shared = Some(shared);
    }

    registry.refs += 1;
    Ok(ListenerHandle {
        shared: Arc::clone(registry.shared.as_ref().unwrap()),
    })
}

impl ListenerHandle {
    /// The raw port handle, for associating a job with the port.
    pub fn port(&self) -> HANDLE {
        self.shared.port.raw()
    }

    /// Registers `callback` under `key`. The key must be nonzero and not
    /// the all-bits-set sentinel, and must not already be registered.
    pub fn register(&self, key: usize, callback: DispatchFn) -> Result<()> {
        if key == 0 || key == usize::MAX {
            return Err(Error::InvalidCompletionKey);
        }

        let mut keys = self.shared.keys.lock().unwrap();
        if keys.contains_key(&key) {
            return Err(Error::DuplicateCompletionKey);
        }
        keys.insert(key, callback);
        debug!(key, "registered job notification callback");
        Ok(())
    }

    /// Removes the callback for `key`. Idempotent: unknown keys are a no-op.
    /// No new invocation for the key starts after this returns; one already
    /// in flight is not interrupted.
    pub fn unregister(&self, key: usize) {
        let removed = self.shared.keys.lock().unwrap().remove(&key).is_some();
        if removed {
            debug!(key, "unregistered job notification callback");
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        let mut registry = REGISTRY.lock().unwrap();
        registry.refs -= 1;
        if registry.refs > 0 {
            return;
        }

        let shared = registry.shared.take().expect("listener registry out of sync");

        // the poison pill is posted exactly once, at the 1 -> 0 transition;
        // packets queued ahead of it drain first in FIFO order
        let posted = unsafe { PostQueuedCompletionStatus(shared.port.raw(), 0, 0, None) };
        match posted {
            Ok(()) => {
                if let Some(thread) = shared.reader.lock().unwrap().take() {
                    let _ = thread.join();
                }
                debug!("shared job notification port shut down");
            }
            Err(error) => {
                // nothing more we can do from a destructor; the reader will
                // observe the abandoned port once the handle closes
                error!(%error, "failed to post listener shutdown packet");
            }
        }
    }
}

fn reader_loop(shared: Arc<PortShared>) {
    loop {
        let mut bytes = 0u32;
        let mut key = 0usize;
        let mut overlapped: *mut OVERLAPPED = null_mut();

        let dequeued = unsafe {
            GetQueuedCompletionStatus(shared.port.raw(), &mut bytes, &mut key, &mut overlapped, INFINITE)
        };

        match dequeued {
            Ok(()) => {
                if key == 0 && overlapped.is_null() && bytes == 0 {
                    // shutdown sentinel
                    break;
                }

                // the job may have unregistered between kernel enqueue and
                // our dequeue; silently drop the packet
                let Some(callback) = shared.keys.lock().unwrap().get(&key).cloned() else {
                    trace!(key, "dropped packet for unregistered key");
                    continue;
                };
                let Some(message) = JobMessage::from_raw(bytes) else {
                    trace!(key, bytes, "dropped packet with unknown message id");
                    continue;
                };

                let data = overlapped as usize;
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(message, data))) {
                    // one job's faulty handler must not kill the listener;
                    // rethrow on a worker thread instead
                    error!(key, "job notification callback panicked");
                    std::thread::spawn(move || resume_unwind(payload));
                }
            }
            Err(dequeue_error) => {
                if !overlapped.is_null() {
                    // a failed packet was dequeued; job notifications are
                    // not overlapped I/O, so there is nothing to deliver
                    continue;
                }

                let code = (dequeue_error.code().0 & 0xFFFF) as u32;
                if code == os_code::ABANDONED_WAIT_0 {
                    // port handle was closed; normal termination
                    break;
                }

                error!(code, "job notification port dequeue failed");
                panic!("job notification port dequeue failed with os error {code}");
            }
        }
    }
}

#[cfg(test)]
pub(crate) fn state_for_tests() -> (usize, bool) {
    let registry = REGISTRY.lock().unwrap();
    (registry.refs, registry.shared.is_some())
}

#[cfg(test)]
pub(crate) fn post_for_tests(handle: &ListenerHandle, bytes: u32, key: usize, data: usize) -> Result<()> {
    unsafe {
        PostQueuedCompletionStatus(
            handle.shared.port.raw(),
            bytes,
            key,
            Some(data as *const OVERLAPPED),
        )
    }
    .map_err(sys::map_err)
}
