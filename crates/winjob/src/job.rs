//! Resource-governed process groups backed by kernel job objects.

use std::ffi::c_void;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use windows::Win32::Foundation::HANDLE;
use windows::Win32::System::JobObjects::AssignProcessToJobObject;
use windows::Win32::UI::WindowsAndMessaging::UserHandleGrantAccess;

use winjob_core::raw::{
    self, JOB_OBJECT_LIMIT_CPU_RATE_CONTROL, JOB_OBJECT_LIMIT_JOB_MEMORY,
    JOB_OBJECT_LIMIT_JOB_READ_BYTES, JOB_OBJECT_LIMIT_JOB_TIME, JOB_OBJECT_LIMIT_JOB_WRITE_BYTES,
    JobInformationClass, JobMessage,
};
use winjob_core::{
    CreateProcessInfo, Error, JobAccounting, JobLimits, JobNotifications, ProcessOptions,
    RateControlTolerance, RawJobLimits, Result, os_code,
};

use crate::listener::{self, DispatchFn, ListenerHandle};
use crate::process::Process;
use crate::sys::{self, OwnedHandle};

// process access rights needed to place an externally opened process in a job
const PROCESS_TERMINATE: u32 = 0x0001;
const PROCESS_SET_QUOTA: u32 = 0x0100;

/// Which dimension an I/O limit violation concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoLimitKind {
    Read,
    Write,
}

/// Typed events raised by a job. One kernel notification can fan out into
/// several events when multiple limits were violated at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    /// A process was assigned to the job.
    ProcessAdded { pid: u32 },
    /// A process in the job terminated.
    ProcessExited { pid: u32, abnormal: bool },
    /// The active-process limit was hit by an attempted assignment.
    ProcessLimitExceeded,
    /// Every process in the job has exited.
    Idle,
    /// A per-process (`pid` set) or job-wide time limit was exceeded.
    /// `elapsed` carries the job's user time when the kernel reported it.
    TimeLimitExceeded { pid: Option<u32>, elapsed: Option<Duration> },
    /// A per-process (`pid` set) or job-wide memory limit was exceeded.
    MemoryLimitExceeded { pid: Option<u32>, job_memory: Option<u64> },
    /// An I/O byte-count notification threshold was crossed.
    IoLimitExceeded { kind: IoLimitKind, bytes: u64 },
    /// The job ran past its CPU-rate tolerance.
    CpuRateLimitExceeded { tolerance: RateControlTolerance },
}

/// Optional job-object features the running OS supports, probed once per
/// process with a throwaway job.
#[derive(Debug, Clone, Copy, Default)]
pub struct JobCapabilities {
    pub group_information: bool,
    pub group_information_ex: bool,
    pub limit_violation: bool,
    pub limit_violation2: bool,
}

static CAPABILITIES: OnceLock<JobCapabilities> = OnceLock::new();

fn capabilities() -> &'static JobCapabilities {
    CAPABILITIES.get_or_init(probe_capabilities)
}

fn probe_capabilities() -> JobCapabilities {
    let Ok(job) = sys::create_job_object() else {
        return JobCapabilities::default();
    };

    let probe = |class: JobInformationClass| {
        let mut buffer = [0u8; 1024];
        match sys::query_job_info_raw(job.raw(), class, buffer.as_mut_ptr() as *mut c_void, 1024) {
            Ok(()) => true,
            Err(error) => matches!(
                error.os_code(),
                // a short-buffer result still proves the class is understood
                Some(os_code::MORE_DATA) | Some(os_code::BAD_LENGTH)
            ),
        }
    };

    let caps = JobCapabilities {
        group_information: probe(JobInformationClass::Group),
        group_information_ex: probe(JobInformationClass::GroupEx),
        limit_violation: probe(JobInformationClass::LimitViolation),
        limit_violation2: probe(JobInformationClass::LimitViolation2),
    };
    debug!(?caps, "probed job object capabilities");
    caps
}

/// A kernel job object: creates processes into the group, enforces limits,
/// and raises typed events delivered through the process-wide shared
/// listener.
///
/// Must be created from within a tokio runtime; event translation runs on
/// the runtime's workers, never on the listener thread.
pub struct JobObject {
    handle: Arc<OwnedHandle>,
    port: Option<ListenerHandle>,
    events: broadcast::Sender<JobEvent>,
}

impl JobObject {
    /// Creates an empty job and registers it with the shared listener.
    pub fn create() -> Result<JobObject> {
        JobObject::with_config(None, None)
    }

    /// Creates a job and applies initial limits and notifications. Any
    /// failure tears the partial state down: the dispatch key and listener
    /// reference are released before the job handle closes.
    pub fn with_config(
        limits: Option<&JobLimits>,
        notifications: Option<&JobNotifications>,
    ) -> Result<JobObject> {
        let port = listener::acquire()?;
        let handle = Arc::new(sys::create_job_object()?);

        let (events, _) = broadcast::channel(256);
        let job = JobObject { handle, port: Some(port), events };

        // drop tears down whatever was wired so far if any step fails
        job.associate_with_port()?;
        if let Some(limits) = limits {
            job.set_limits(limits)?;
        }
        if let Some(notifications) = notifications {
            job.set_notifications(notifications)?;
        }

        info!(key = job.handle.key(), "created job object");
        Ok(job)
    }

    /// Whether the OS supports CPU-rate limits.
    pub fn supports_cpu_rates() -> bool {
        capabilities().limit_violation
    }

    /// Whether the OS supports notification limits and violation events.
    pub fn supports_notifications() -> bool {
        capabilities().limit_violation
    }

    /// The probed feature set of the running OS.
    pub fn os_capabilities() -> JobCapabilities {
        *capabilities()
    }

    /// Whether the calling process itself runs inside a job.
    pub fn current_process_in_job() -> Result<bool> {
        sys::current_process_in_job()
    }

    /// Subscribes to this job's typed events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Launches a process suspended, assigns it to this job, then resumes
    /// it unless the caller asked for a suspended process. When the job's
    /// active-process limit blocks the assignment the partially created
    /// process is killed and `ProcessLimitReached` is returned.
    pub fn create_process(
        &self,
        info: &CreateProcessInfo,
        options: ProcessOptions,
    ) -> Result<Process> {
        let suspended_options = ProcessOptions { suspended: true, ..options };
        let process = Process::spawn(info, suspended_options)?;

        let assigned =
            unsafe { AssignProcessToJobObject(self.handle.raw(), process.raw()) }.map_err(sys::map_err);
        if let Err(error) = assigned {
            warn!(pid = process.id(), %error, "failed to assign process to job, killing it");
            let _ = process.kill(u32::MAX);
            return Err(match error.os_code() {
                Some(os_code::NOT_ENOUGH_QUOTA) => Error::ProcessLimitReached,
                _ => error,
            });
        }

        if !options.suspended {
            process.resume()?;
        }
        Ok(process)
    }

    /// Assigns an already-running process (opened elsewhere) to this job.
    /// The handle is duplicated with just the quota-set and terminate
    /// rights; ownership stays with the caller.
    pub fn assign_process(&self, process: std::os::windows::io::RawHandle) -> Result<()> {
        let source = HANDLE(process);
        if source.is_invalid() || source.0.is_null() {
            return Err(Error::InvalidConfig("process handle is null or invalid".into()));
        }

        let duplicated = sys::duplicate_handle(
            source,
            PROCESS_SET_QUOTA | PROCESS_TERMINATE,
            false,
            windows::Win32::Foundation::DUPLICATE_HANDLE_OPTIONS(0),
        )?;

        let result = unsafe { AssignProcessToJobObject(self.handle.raw(), duplicated.raw()) }
            .map_err(sys::map_err);
        match result {
            Err(error) if error.os_code() == Some(os_code::NOT_ENOUGH_QUOTA) => {
                Err(Error::ProcessLimitReached)
            }
            other => other,
        }
    }

    /// Terminates every process in the job, and in nested jobs if the job
    /// is hierarchical.
    pub fn kill(&self, exit_code: u32) -> Result<()> {
        sys::terminate_job(self.handle.raw(), exit_code)
    }

    /// Applies limits. The CPU-rate class is skipped on an OS that does not
    /// support it.
    pub fn set_limits(&self, limits: &JobLimits) -> Result<()> {
        let raw_limits = limits.to_raw()?;

        sys::set_job_info(
            self.handle.raw(),
            JobInformationClass::ExtendedLimit,
            &raw_limits.extended as *const _ as *const c_void,
            std::mem::size_of_val(&raw_limits.extended) as u32,
        )?;
        sys::set_job_info(
            self.handle.raw(),
            JobInformationClass::EndOfJobTime,
            &raw_limits.end_of_job as *const _ as *const c_void,
            std::mem::size_of_val(&raw_limits.end_of_job) as u32,
        )?;
        sys::set_job_info(
            self.handle.raw(),
            JobInformationClass::BasicUiRestrictions,
            &raw_limits.ui as *const _ as *const c_void,
            std::mem::size_of_val(&raw_limits.ui) as u32,
        )?;

        if Self::supports_cpu_rates() {
            sys::set_job_info(
                self.handle.raw(),
                JobInformationClass::CpuRateControl,
                &raw_limits.cpu as *const _ as *const c_void,
                std::mem::size_of_val(&raw_limits.cpu) as u32,
            )?;
        }

        Ok(())
    }

    /// Reads the currently effective limits.
    pub fn get_limits(&self) -> Result<JobLimits> {
        let mut raw_limits = RawJobLimits {
            extended: sys::query_job_info(self.handle.raw(), JobInformationClass::ExtendedLimit)?,
            end_of_job: sys::query_job_info(self.handle.raw(), JobInformationClass::EndOfJobTime)?,
            ui: sys::query_job_info(self.handle.raw(), JobInformationClass::BasicUiRestrictions)?,
            cpu: Default::default(),
        };
        if Self::supports_cpu_rates() {
            raw_limits.cpu =
                sys::query_job_info(self.handle.raw(), JobInformationClass::CpuRateControl)?;
        }
        Ok(JobLimits::from_raw(&raw_limits))
    }

    /// Applies notification thresholds. A no-op on an OS without
    /// notification support.
    pub fn set_notifications(&self, notifications: &JobNotifications) -> Result<()> {
        if !Self::supports_notifications() {
            debug!("notification limits not supported on this OS, skipping");
            return Ok(());
        }
        let info = notifications.to_raw();
        sys::set_job_info(
            self.handle.raw(),
            JobInformationClass::NotificationLimit,
            &info as *const _ as *const c_void,
            std::mem::size_of_val(&info) as u32,
        )
    }

    /// Reads the configured notification thresholds.
    pub fn get_notifications(&self) -> Result<JobNotifications> {
        if !Self::supports_notifications() {
            return Ok(JobNotifications::default());
        }
        let info: raw::JOBOBJECT_NOTIFICATION_LIMIT_INFORMATION =
            sys::query_job_info(self.handle.raw(), JobInformationClass::NotificationLimit)?;
        Ok(JobNotifications::from_raw(&info))
    }

    /// Reads the job's accounting counters.
    pub fn get_accounting(&self) -> Result<JobAccounting> {
        let accounting: raw::JOBOBJECT_BASIC_AND_IO_ACCOUNTING_INFORMATION =
            sys::query_job_info(self.handle.raw(), JobInformationClass::BasicAndIoAccounting)?;
        let limits: raw::JOBOBJECT_EXTENDED_LIMIT_INFORMATION =
            sys::query_job_info(self.handle.raw(), JobInformationClass::ExtendedLimit)?;
        Ok(JobAccounting::from_raw(&accounting, &limits))
    }

    /// The identifiers of every process currently in the job. The process
    /// count is not known in advance, so the buffer grows and the query
    /// retries until the kernel stops reporting a short buffer.
    pub fn get_process_ids(&self) -> Result<Vec<u32>> {
        const HEADER: usize = std::mem::size_of::<raw::JOBOBJECT_BASIC_PROCESS_ID_LIST_HEADER>();
        let mut capacity = 16usize;

        loop {
            let size = HEADER + capacity * std::mem::size_of::<usize>();
            let mut buffer = vec![0u8; size];

            match sys::query_job_info_raw(
                self.handle.raw(),
                JobInformationClass::BasicProcessIdList,
                buffer.as_mut_ptr() as *mut c_void,
                size as u32,
            ) {
                Ok(()) => {
                    let listed =
                        u32::from_ne_bytes(buffer[4..8].try_into().unwrap()) as usize;
                    let mut ids = Vec::with_capacity(listed);
                    for index in 0..listed {
                        let offset = HEADER + index * std::mem::size_of::<usize>();
                        let entry = usize::from_ne_bytes(
                            buffer[offset..offset + std::mem::size_of::<usize>()]
                                .try_into()
                                .unwrap(),
                        );
                        ids.push(entry as u32);
                    }
                    return Ok(ids);
                }
                Err(error) if error.os_code() == Some(os_code::MORE_DATA) => {
                    capacity += 16;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Grants or denies the job's processes access to a User handle, for
    /// jobs running with UI restrictions.
    pub fn grant_user_handle_access(
        &self,
        user_handle: std::os::windows::io::RawHandle,
        allow: bool,
    ) -> Result<()> {
        unsafe { UserHandleGrantAccess(HANDLE(user_handle), self.handle.raw(), allow.into()) }
            .map_err(sys::map_err)
    }

    fn associate_with_port(&self) -> Result<()> {
        let port = self.port.as_ref().expect("listener reference missing during construction");

        let association = raw::JOBOBJECT_ASSOCIATE_COMPLETION_PORT {
            CompletionKey: self.handle.key(),
            CompletionPort: port.port().0 as usize,
        };
        sys::set_job_info(
            self.handle.raw(),
            JobInformationClass::AssociateCompletionPort,
            &association as *const _ as *const c_void,
            std::mem::size_of_val(&association) as u32,
        )?;

        port.register(self.handle.key(), self.dispatch_fn())
    }

    /// The callback the listener thread invokes for this job's packets. It
    /// pins the job handle, grabs any payload the kernel will not repeat,
    /// and hands translation to the runtime; job logic never runs on the
    /// listener thread.
    fn dispatch_fn(&self) -> DispatchFn {
        let handle = Arc::downgrade(&self.handle);
        let events = self.events.clone();
        let runtime = tokio::runtime::Handle::current();

        Arc::new(move |message, data| {
            // a callback in flight pins the handle open; once the job is
            // dropped the upgrade fails and the packet is stale
            let Some(pinned) = handle.upgrade() else {
                return;
            };

            if message == JobMessage::NotificationLimit {
                // the packet itself carries no payload; the violation
                // details must be re-queried while the handle is pinned
                let violation: raw::JOBOBJECT_LIMIT_VIOLATION_INFORMATION =
                    match sys::query_job_info(pinned.raw(), JobInformationClass::LimitViolation) {
                        Ok(violation) => violation,
                        Err(error) => {
                            warn!(%error, "failed to query limit violation details");
                            return;
                        }
                    };
                let events = events.clone();
                runtime.spawn(async move {
                    raise_violation_events(&events, &violation);
                });
            } else {
                let events = events.clone();
                runtime.spawn(async move {
                    raise_general_event(&events, message, data);
                });
            }
        })
    }
}

impl Drop for JobObject {
    fn drop(&mut self) {
        // remove the dispatch key before the job handle can close so a
        // recycled handle value cannot reach a stale callback; the handle
        // itself stays open until the last in-flight callback unpins it
        if let Some(port) = self.port.take() {
            port.unregister(self.handle.key());
        }
    }
}

fn raise_general_event(events: &broadcast::Sender<JobEvent>, message: JobMessage, data: usize) {
    let event = match message {
        JobMessage::NewProcess => JobEvent::ProcessAdded { pid: data as u32 },
        JobMessage::ExitProcess => JobEvent::ProcessExited { pid: data as u32, abnormal: false },
        JobMessage::AbnormalExitProcess => {
            JobEvent::ProcessExited { pid: data as u32, abnormal: true }
        }
        JobMessage::ActiveProcessLimit => JobEvent::ProcessLimitExceeded,
        JobMessage::ActiveProcessZero => JobEvent::Idle,
        JobMessage::EndOfProcessTime => {
            JobEvent::TimeLimitExceeded { pid: Some(data as u32), elapsed: None }
        }
        JobMessage::EndOfJobTime => JobEvent::TimeLimitExceeded { pid: None, elapsed: None },
        JobMessage::ProcessMemoryLimit => {
            JobEvent::MemoryLimitExceeded { pid: Some(data as u32), job_memory: None }
        }
        JobMessage::JobMemoryLimit => {
            JobEvent::MemoryLimitExceeded { pid: None, job_memory: None }
        }
        JobMessage::NotificationLimit | JobMessage::JobCycleTimeLimit | JobMessage::SiloTerminated => {
            return;
        }
    };
    let _ = events.send(event);
}

/// One violation packet may report several exceeded dimensions; each raises
/// its own event.
fn raise_violation_events(
    events: &broadcast::Sender<JobEvent>,
    violation: &raw::JOBOBJECT_LIMIT_VIOLATION_INFORMATION,
) {
    let flags = violation.ViolationLimitFlags;

    if flags & JOB_OBJECT_LIMIT_JOB_READ_BYTES != 0 {
        let _ = events.send(JobEvent::IoLimitExceeded {
            kind: IoLimitKind::Read,
            bytes: violation.IoReadBytes,
        });
    }
    if flags & JOB_OBJECT_LIMIT_JOB_WRITE_BYTES != 0 {
        let _ = events.send(JobEvent::IoLimitExceeded {
            kind: IoLimitKind::Write,
            bytes: violation.IoWriteBytes,
        });
    }
    if flags & JOB_OBJECT_LIMIT_JOB_TIME != 0 {
        let elapsed = Duration::from_nanos(
            (violation.PerJobUserTime.max(0) as u64).saturating_mul(100),
        );
        let _ = events.send(JobEvent::TimeLimitExceeded { pid: None, elapsed: Some(elapsed) });
    }
    if flags & JOB_OBJECT_LIMIT_JOB_MEMORY != 0 {
        let _ = events.send(JobEvent::MemoryLimitExceeded {
            pid: None,
            job_memory: Some(violation.JobMemory),
        });
    }
    if flags & JOB_OBJECT_LIMIT_CPU_RATE_CONTROL != 0 {
        let tolerance = RateControlTolerance::from_raw(violation.RateControlTolerance)
            .unwrap_or_default();
        let _ = events.send(JobEvent::CpuRateLimitExceeded { tolerance });
    }
}
