//! Owned handle wrapper and thin safe wrappers over the kernel calls shared
//! by the rest of the crate.

use std::ffi::c_void;

use windows::Win32::Foundation::{CloseHandle, DUPLICATE_HANDLE_OPTIONS, DuplicateHandle, HANDLE};

pub(crate) use windows::Win32::Foundation::{DUPLICATE_SAME_ACCESS, INVALID_HANDLE_VALUE};
use windows::Win32::Security::SECURITY_ATTRIBUTES;
use windows::Win32::System::JobObjects::{
    CreateJobObjectW, IsProcessInJob, JOBOBJECTINFOCLASS, QueryInformationJobObject,
    SetInformationJobObject, TerminateJobObject,
};
use windows::Win32::System::Pipes::CreatePipe;
use windows::Win32::System::Threading::{
    CreateEventW, GetCurrentProcess, GetExitCodeProcess, INFINITE, ResumeThread, SetEvent,
    TerminateProcess, WaitForMultipleObjects, WaitForSingleObject,
};
use windows::core::PCWSTR;

use winjob_core::raw::JobInformationClass;
use winjob_core::{Error, Result};

const WAIT_OBJECT_0: u32 = 0;
const WAIT_TIMEOUT: u32 = 258;

/// Maps a failed kernel call onto the library's error taxonomy, preserving
/// the original Win32 code.
pub(crate) fn map_err(error: windows::core::Error) -> Error {
    Error::from_os_code((error.code().0 & 0xFFFF) as u32)
}

/// Exclusive owner of a kernel handle. Closed on drop.
#[derive(Debug)]
pub(crate) struct OwnedHandle(HANDLE);

// raw handles are just kernel object references; ownership is what this
// wrapper enforces
unsafe impl Send for OwnedHandle {}
unsafe impl Sync for OwnedHandle {}

impl OwnedHandle {
    pub fn from_raw(handle: HANDLE) -> OwnedHandle {
        OwnedHandle(handle)
    }

    pub fn raw(&self) -> HANDLE {
        self.0
    }

    /// The raw handle value, used as a completion-port dispatch key.
    pub fn key(&self) -> usize {
        self.0.0 as usize
    }

    /// Releases ownership without closing.
    pub fn into_raw(self) -> HANDLE {
        let handle = self.0;
        std::mem::forget(self);
        handle
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        if !self.0.is_invalid() && !self.0.0.is_null() {
            unsafe {
                let _ = CloseHandle(self.0);
            }
        }
    }
}

pub(crate) fn wide(text: &str) -> Vec<u16> {
    text.encode_utf16().chain(std::iter::once(0)).collect()
}

pub(crate) fn create_job_object() -> Result<OwnedHandle> {
    let handle = unsafe { CreateJobObjectW(None, PCWSTR::null()) }.map_err(map_err)?;
    Ok(OwnedHandle::from_raw(handle))
}

pub(crate) fn set_job_info(
    job: HANDLE,
    class: JobInformationClass,
    info: *const c_void,
    length: u32,
) -> Result<()> {
    unsafe { SetInformationJobObject(job, JOBOBJECTINFOCLASS(class as i32), info, length) }
        .map_err(map_err)
}

pub(crate) fn query_job_info_raw(
    job: HANDLE,
    class: JobInformationClass,
    info: *mut c_void,
    length: u32,
) -> Result<()> {
    unsafe {
        QueryInformationJobObject(Some(job), JOBOBJECTINFOCLASS(class as i32), info, length, None)
    }
    .map_err(map_err)
}

pub(crate) fn query_job_info<T: Default>(job: HANDLE, class: JobInformationClass) -> Result<T> {
    let mut value = T::default();
    query_job_info_raw(
        job,
        class,
        &mut value as *mut T as *mut c_void,
        std::mem::size_of::<T>() as u32,
    )?;
    Ok(value)
}

pub(crate) fn terminate_job(job: HANDLE, exit_code: u32) -> Result<()> {
    unsafe { TerminateJobObject(job, exit_code) }.map_err(map_err)
}

/// Whether the calling process already runs inside a job.
pub(crate) fn current_process_in_job() -> Result<bool> {
    let mut result = Default::default();
    unsafe { IsProcessInJob(GetCurrentProcess(), None, &mut result) }.map_err(map_err)?;
    Ok(result.as_bool())
}

/// Duplicates a handle within the current process.
pub(crate) fn duplicate_handle(
    source: HANDLE,
    desired_access: u32,
    inherit: bool,
    options: DUPLICATE_HANDLE_OPTIONS,
) -> Result<OwnedHandle> {
    let current = unsafe { GetCurrentProcess() };
    let mut duplicated = HANDLE::default();
    unsafe {
        DuplicateHandle(
            current,
            source,
            current,
            &mut duplicated,
            desired_access,
            inherit.into(),
            options,
        )
    }
    .map_err(map_err)?;
    Ok(OwnedHandle::from_raw(duplicated))
}

/// Creates a pipe whose both ends are inheritable; callers re-duplicate the
/// parent end as non-inheritable.
pub(crate) fn create_inheritable_pipe() -> Result<(OwnedHandle, OwnedHandle)> {
    let attributes = SECURITY_ATTRIBUTES {
        nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
        lpSecurityDescriptor: std::ptr::null_mut(),
        bInheritHandle: true.into(),
    };
    let mut read = HANDLE::default();
    let mut write = HANDLE::default();
    unsafe { CreatePipe(&mut read, &mut write, Some(&attributes), 0) }.map_err(map_err)?;
    Ok((OwnedHandle::from_raw(read), OwnedHandle::from_raw(write)))
}

/// Auto-reset event, initially unsignaled.
pub(crate) fn create_event() -> Result<OwnedHandle> {
    let handle = unsafe { CreateEventW(None, false.into(), false.into(), PCWSTR::null()) }
        .map_err(map_err)?;
    Ok(OwnedHandle::from_raw(handle))
}

pub(crate) fn set_event(event: HANDLE) -> Result<()> {
    unsafe { SetEvent(event) }.map_err(map_err)
}

/// Waits on one handle; `Ok(true)` when it is signaled within the timeout.
pub(crate) fn wait_signaled(handle: HANDLE, timeout_ms: u32) -> Result<bool> {
    let result = unsafe { WaitForSingleObject(handle, timeout_ms) };
    match result.0 {
        WAIT_OBJECT_0 => Ok(true),
        WAIT_TIMEOUT => Ok(false),
        _ => Err(Error::from_os_code(last_error_code())),
    }
}

/// Blocks until one of the two handles signals; returns its index.
pub(crate) fn wait_either(first: HANDLE, second: HANDLE) -> Result<usize> {
    let handles = [first, second];
    let result = unsafe { WaitForMultipleObjects(&handles, false.into(), INFINITE) };
    match result.0 {
        index @ WAIT_OBJECT_0..=1 => Ok(index as usize),
        _ => Err(Error::from_os_code(last_error_code())),
    }
}

pub(crate) fn resume_thread(thread: HANDLE) -> Result<u32> {
    let previous = unsafe { ResumeThread(thread) };
    if previous == u32::MAX {
        return Err(Error::from_os_code(last_error_code()));
    }
    Ok(previous)
}

pub(crate) fn terminate_process(process: HANDLE, exit_code: u32) -> Result<()> {
    unsafe { TerminateProcess(process, exit_code) }.map_err(map_err)
}

pub(crate) fn process_exit_code(process: HANDLE) -> Result<u32> {
    let mut code = 0u32;
    unsafe { GetExitCodeProcess(process, &mut code) }.map_err(map_err)?;
    Ok(code)
}

pub(crate) fn last_error_code() -> u32 {
    unsafe { windows::Win32::Foundation::GetLastError().0 }
}
