//! A created Windows process: command line, redirected streams, alternate
//! credentials, suspension, and an awaitable exit.

use std::collections::HashMap;
use std::fs::File;
use std::future::Future;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use windows::Win32::Foundation::HANDLE;
use windows::Win32::System::Console::{
    GetStdHandle, STD_ERROR_HANDLE, STD_HANDLE, STD_INPUT_HANDLE, STD_OUTPUT_HANDLE,
};
use windows::Win32::System::Threading::{
    CREATE_PROCESS_LOGON_FLAGS, CREATE_UNICODE_ENVIRONMENT, CreateProcessW,
    CreateProcessWithLogonW, LOGON_WITH_PROFILE, PROCESS_CREATION_FLAGS, PROCESS_INFORMATION,
    STARTF_USEPOSITION, STARTF_USESHOWWINDOW, STARTF_USESIZE, STARTF_USESTDHANDLES, STARTUPINFOW,
};
use windows::core::{PCWSTR, PWSTR};

use winjob_core::{
    CreateProcessInfo, Error, LineSplitter, ProcessOptions, ReadMode, Result, StreamDecoder,
    StreamEncoding, build_command_line, os_code,
};

use crate::sys::{self, OwnedHandle};
use crate::wait::{self, ExitOutcome, ExitReceiver, ExitSender, ExitWaitRegistration};

static SPAWN_LOCK: Mutex<()> = Mutex::new(());

/// The process-wide lock serializing pipe creation with process launch.
///
/// Inheritable handles created while another launch is in flight would leak
/// into the unrelated child and keep pipes open past their intended
/// lifetime. `Process::spawn` holds this lock around that window; any other
/// code path in this process that creates inheritable handles and then
/// launches a child must hold it too.
pub fn spawn_lock() -> &'static Mutex<()> {
    &SPAWN_LOCK
}

/// Owned write end of a redirected stdin pipe.
#[derive(Debug)]
pub struct PipeWriter {
    file: File,
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

/// Owned read end of a redirected stdout/stderr pipe, for synchronous
/// reads.
#[derive(Debug)]
pub struct PipeReader {
    file: File,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }
}

/// How an asynchronous stream read finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The stream reached end of file; the callback saw the final `None`.
    Eof,
    /// The read was stopped before end of file; no `None` was delivered.
    Cancelled,
}

/// Control over one running asynchronous stream read.
#[derive(Debug)]
pub struct StreamReadHandle {
    token: CancellationToken,
    join: tokio::task::JoinHandle<ReadOutcome>,
}

impl StreamReadHandle {
    /// Requests cancellation; takes effect at the next read boundary.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Waits for the pump to finish and reports how it ended.
    pub async fn finished(self) -> ReadOutcome {
        self.join.await.unwrap_or(ReadOutcome::Cancelled)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum StreamMode {
    #[default]
    Undefined,
    Sync,
    Async,
}

#[derive(Debug, Default)]
struct OutputSlot {
    file: Option<File>,
    encoding: StreamEncoding,
    mode: StreamMode,
    redirected: bool,
}

impl OutputSlot {
    fn take_sync(&mut self, name: &'static str) -> Result<File> {
        match self.mode {
            StreamMode::Async => return Err(Error::StreamModeConflict(name, "asynchronous")),
            StreamMode::Sync => return Err(Error::StreamTaken(name)),
            StreamMode::Undefined => {}
        }
        if !self.redirected {
            return Err(Error::StreamNotRedirected(name));
        }
        self.mode = StreamMode::Sync;
        Ok(self.file.take().expect("redirected stream missing its pipe"))
    }

    fn take_async(&mut self, name: &'static str) -> Result<File> {
        match self.mode {
            StreamMode::Sync => return Err(Error::StreamModeConflict(name, "synchronous")),
            StreamMode::Async => return Err(Error::StreamModeConflict(name, "asynchronous")),
            StreamMode::Undefined => {}
        }
        if !self.redirected {
            return Err(Error::StreamNotRedirected(name));
        }
        self.mode = StreamMode::Async;
        Ok(self.file.take().expect("redirected stream missing its pipe"))
    }
}

#[derive(Debug, Default)]
struct StdinSlot {
    file: Option<File>,
    redirected: bool,
}

#[derive(Default)]
struct ExitState {
    initialized: bool,
    registration: Option<ExitWaitRegistration>,
}

/// A process created by this library. Owns the process and primary-thread
/// handles; dropping it cancels a pending exit wait before the handles
/// close.
pub struct Process {
    handle: OwnedHandle,
    thread: OwnedHandle,
    id: u32,
    stdin: Mutex<StdinSlot>,
    stdout: Mutex<OutputSlot>,
    stderr: Mutex<OutputSlot>,
    exit_sender: ExitSender,
    exit_receiver: ExitReceiver,
    exit_state: Mutex<ExitState>,
    exit_code: Mutex<Option<u32>>,
}

enum ChildEnd {
    Owned(OwnedHandle),
    Inherited(HANDLE),
}

impl ChildEnd {
    fn raw(&self) -> HANDLE {
        match self {
            ChildEnd::Owned(handle) => handle.raw(),
            ChildEnd::Inherited(handle) => *handle,
        }
    }
}

impl Process {
    /// Validates the settings, builds the escaped command line, wires up
    /// any requested redirections, and launches the process.
    ///
    /// Validation failures are detected before any OS call; nothing is ever
    /// partially applied. On an OS failure every handle created so far is
    /// released before the error propagates.
    pub fn spawn(info: &CreateProcessInfo, options: ProcessOptions) -> Result<Process> {
        info.validate()?;
        options.validate()?;

        let command_line =
            build_command_line(&info.file_name, info.arguments.as_deref(), &info.argument_list);
        let mut command_wide = sys::wide(&command_line);

        let environment_block = info.environment.as_ref().map(environment_block);
        let cwd_wide = info
            .working_directory
            .as_ref()
            .map(|path| sys::wide(&path.to_string_lossy()));
        let mut desktop_wide = info.desktop.as_deref().map(sys::wide);
        let mut title_wide = info.title.as_deref().map(sys::wide);

        let mut startup = STARTUPINFOW::default();
        startup.cb = std::mem::size_of::<STARTUPINFOW>() as u32;
        if let Some(buffer) = desktop_wide.as_mut() {
            startup.lpDesktop = PWSTR::from_raw(buffer.as_mut_ptr());
        }
        if let Some(buffer) = title_wide.as_mut() {
            startup.lpTitle = PWSTR::from_raw(buffer.as_mut_ptr());
        }
        if let Some(show) = info.window_show {
            startup.wShowWindow = show as u16;
            startup.dwFlags |= STARTF_USESHOWWINDOW;
        }
        if let Some((x, y)) = info.window_position {
            startup.dwX = x as u32;
            startup.dwY = y as u32;
            startup.dwFlags |= STARTF_USEPOSITION;
        }
        if let Some((width, height)) = info.window_size {
            startup.dwXSize = width;
            startup.dwYSize = height;
            startup.dwFlags |= STARTF_USESIZE;
        }

        let creation_flags =
            PROCESS_CREATION_FLAGS(options.creation_flags()) | CREATE_UNICODE_ENVIRONMENT;

        let mut process_info = PROCESS_INFORMATION::default();

        let (parent_stdin, parent_stdout, parent_stderr) = {
            // inheritable pipe ends must be created, handed to the child,
            // and closed while no other launch is in flight
            let _guard = SPAWN_LOCK.lock().unwrap();

            let (stdin_parent, stdin_child) =
                pipe_for(STD_INPUT_HANDLE, true, info.redirect_stdin)?;
            let (stdout_parent, stdout_child) =
                pipe_for(STD_OUTPUT_HANDLE, false, info.redirect_stdout)?;
            let (stderr_parent, stderr_child) =
                pipe_for(STD_ERROR_HANDLE, false, info.redirect_stderr)?;

            if info.has_redirection() {
                startup.hStdInput = stdin_child.raw();
                startup.hStdOutput = stdout_child.raw();
                startup.hStdError = stderr_child.raw();
                startup.dwFlags |= STARTF_USESTDHANDLES;
            }

            let environment_ptr = environment_block
                .as_ref()
                .map(|block| block.as_ptr() as *const std::ffi::c_void);
            let cwd_ptr = cwd_wide
                .as_ref()
                .map(|buffer| PCWSTR::from_raw(buffer.as_ptr()))
                .unwrap_or(PCWSTR::null());

            let launched = if let Some(user_name) = info.user_name.as_deref() {
                let user_wide = sys::wide(user_name);
                let domain_wide = info.domain.as_deref().map(sys::wide);
                let password_wide = sys::wide(info.password.as_deref().unwrap_or(""));
                let mut logon_flags = CREATE_PROCESS_LOGON_FLAGS(0);
                if info.load_user_profile {
                    logon_flags |= LOGON_WITH_PROFILE;
                }

                unsafe {
                    CreateProcessWithLogonW(
                        PCWSTR::from_raw(user_wide.as_ptr()),
                        domain_wide
                            .as_ref()
                            .map(|buffer| PCWSTR::from_raw(buffer.as_ptr()))
                            .unwrap_or(PCWSTR::null()),
                        PCWSTR::from_raw(password_wide.as_ptr()),
                        logon_flags,
                        PCWSTR::null(),
                        Some(PWSTR::from_raw(command_wide.as_mut_ptr())),
                        creation_flags,
                        environment_ptr,
                        cwd_ptr,
                        &startup,
                        &mut process_info,
                    )
                }
            } else {
                unsafe {
                    CreateProcessW(
                        PCWSTR::null(),
                        Some(PWSTR::from_raw(command_wide.as_mut_ptr())),
                        None,
                        None,
                        true.into(),
                        creation_flags,
                        environment_ptr,
                        cwd_ptr,
                        &startup,
                        &mut process_info,
                    )
                }
            };

            launched.map_err(sys::map_err)?;

            // child ends close at the end of this block, still under the lock
            (stdin_parent, stdout_parent, stderr_parent)
        };

        let handle = OwnedHandle::from_raw(process_info.hProcess);
        let thread = OwnedHandle::from_raw(process_info.hThread);
        let id = process_info.dwProcessId;

        info!(pid = id, command = %info.file_name, "spawned process");

        let (sender, receiver) = tokio::sync::watch::channel(None);

        Ok(Process {
            handle,
            thread,
            id,
            stdin: Mutex::new(StdinSlot {
                file: parent_stdin.map(into_file),
                redirected: info.redirect_stdin,
            }),
            stdout: Mutex::new(OutputSlot {
                file: parent_stdout.map(into_file),
                encoding: info.stdout_encoding.unwrap_or_default(),
                mode: StreamMode::Undefined,
                redirected: info.redirect_stdout,
            }),
            stderr: Mutex::new(OutputSlot {
                file: parent_stderr.map(into_file),
                encoding: info.stderr_encoding.unwrap_or_default(),
                mode: StreamMode::Undefined,
                redirected: info.redirect_stderr,
            }),
            exit_sender: Arc::new(sender),
            exit_receiver: receiver,
            exit_state: Mutex::new(ExitState::default()),
            exit_code: Mutex::new(None),
        })
    }

    /// The process identifier.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn raw(&self) -> HANDLE {
        self.handle.raw()
    }

    /// Decrements the primary thread's suspend count. Returns whether the
    /// thread is now running.
    pub fn resume(&self) -> Result<bool> {
        let previous = sys::resume_thread(self.thread.raw())?;
        Ok(previous <= 1)
    }

    /// Forcefully terminates the process. Access denied means the process
    /// is already exiting and is treated as success.
    pub fn kill(&self, exit_code: u32) -> Result<()> {
        match sys::terminate_process(self.handle.raw(), exit_code) {
            Ok(()) => Ok(()),
            Err(error) if error.os_code() == Some(os_code::ACCESS_DENIED) => {
                debug!(pid = self.id, "kill on an already-exiting process");
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    /// Returns a future that resolves when the process exits. Every caller
    /// shares one underlying completion; it resolves exactly once, as
    /// `Err(Cancelled)` if the `Process` is dropped before the kernel
    /// signals the handle. The returned future does not borrow the
    /// `Process`, so a pending wait can outlive it and observe the
    /// cancellation. Must be called from within a tokio runtime: the wait
    /// is parked on the runtime's blocking pool.
    pub fn exited(&self) -> Result<impl Future<Output = Result<()>> + Send + 'static> {
        self.ensure_exit_wait()?;

        let mut receiver = self.exit_receiver.clone();
        Ok(async move {
            let outcome = loop {
                if let Some(outcome) = *receiver.borrow_and_update() {
                    break outcome;
                }
                if receiver.changed().await.is_err() {
                    return Err(Error::Cancelled);
                }
            };

            match outcome {
                ExitOutcome::Signaled => Ok(()),
                ExitOutcome::Cancelled => Err(Error::Cancelled),
            }
        })
    }

    /// The exit code, or `None` while the process is still running. Queried
    /// from the kernel once and cached; later calls cost no syscall.
    pub fn exit_code(&self) -> Result<Option<u32>> {
        let mut cached = self.exit_code.lock().unwrap();
        if let Some(code) = *cached {
            return Ok(Some(code));
        }
        if !sys::wait_signaled(self.handle.raw(), 0)? {
            return Ok(None);
        }
        let code = sys::process_exit_code(self.handle.raw())?;
        *cached = Some(code);
        Ok(Some(code))
    }

    /// Takes the write end of the redirected stdin pipe. May be taken once.
    pub fn stdin(&self) -> Result<PipeWriter> {
        let mut slot = self.stdin.lock().unwrap();
        if !slot.redirected {
            return Err(Error::StreamNotRedirected("input"));
        }
        match slot.file.take() {
            Some(file) => Ok(PipeWriter { file }),
            None => Err(Error::StreamTaken("input")),
        }
    }

    /// Takes the redirected stdout pipe for synchronous reads. Puts the
    /// stream into synchronous mode; asynchronous reads are rejected from
    /// then on.
    pub fn stdout_reader(&self) -> Result<PipeReader> {
        let file = self.stdout.lock().unwrap().take_sync("output")?;
        Ok(PipeReader { file })
    }

    /// Takes the redirected stderr pipe for synchronous reads.
    pub fn stderr_reader(&self) -> Result<PipeReader> {
        let file = self.stderr.lock().unwrap().take_sync("error")?;
        Ok(PipeReader { file })
    }

    /// Starts the asynchronous pump on redirected stdout. The callback gets
    /// `Some(text)` per chunk or complete line and exactly one final `None`
    /// at end of stream. Puts the stream into asynchronous mode.
    pub fn begin_read_stdout<F>(&self, mode: ReadMode, callback: F) -> Result<StreamReadHandle>
    where
        F: FnMut(Option<&str>) + Send + 'static,
    {
        let (file, encoding) = {
            let mut slot = self.stdout.lock().unwrap();
            let file = slot.take_async("output")?;
            (file, slot.encoding)
        };
        Ok(start_pump(file, encoding, mode, Box::new(callback)))
    }

    /// Starts the asynchronous pump on redirected stderr.
    pub fn begin_read_stderr<F>(&self, mode: ReadMode, callback: F) -> Result<StreamReadHandle>
    where
        F: FnMut(Option<&str>) + Send + 'static,
    {
        let (file, encoding) = {
            let mut slot = self.stderr.lock().unwrap();
            let file = slot.take_async("error")?;
            (file, slot.encoding)
        };
        Ok(start_pump(file, encoding, mode, Box::new(callback)))
    }

    fn ensure_exit_wait(&self) -> Result<()> {
        let mut state = self.exit_state.lock().unwrap();
        if state.initialized {
            return Ok(());
        }

        if sys::wait_signaled(self.handle.raw(), 0)? {
            wait::complete(&self.exit_sender, ExitOutcome::Signaled);
        } else {
            state.registration = Some(ExitWaitRegistration::register(
                self.handle.raw(),
                Arc::clone(&self.exit_sender),
            )?);
        }

        state.initialized = true;
        Ok(())
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        // cancel a pending exit wait before the process handle closes; a
        // recycled handle value must never complete a stale wait
        if let Some(registration) = self.exit_state.lock().unwrap().registration.take() {
            registration.cancel();
        }
    }
}

impl std::os::windows::io::AsRawHandle for Process {
    fn as_raw_handle(&self) -> std::os::windows::io::RawHandle {
        self.handle.raw().0
    }
}

fn into_file(handle: OwnedHandle) -> File {
    use std::os::windows::io::FromRawHandle;
    unsafe { File::from_raw_handle(handle.into_raw().0) }
}

/// Creates the (parent, child) handle pair for one standard stream. The
/// parent end is re-duplicated as non-inheritable; the child end stays
/// inheritable. Non-redirected streams hand the child our own standard
/// handle.
fn pipe_for(
    std_handle: STD_HANDLE,
    is_input: bool,
    redirected: bool,
) -> Result<(Option<OwnedHandle>, ChildEnd)> {
    if !redirected {
        let inherited = unsafe { GetStdHandle(std_handle) }.unwrap_or_default();
        return Ok((None, ChildEnd::Inherited(inherited)));
    }

    let (read, write) = sys::create_inheritable_pipe()?;
    let (inheritable_parent, child) = if is_input { (write, read) } else { (read, write) };

    let parent = sys::duplicate_handle(
        inheritable_parent.raw(),
        0,
        false,
        sys::DUPLICATE_SAME_ACCESS,
    )?;
    drop(inheritable_parent);

    Ok((Some(parent), ChildEnd::Owned(child)))
}

fn start_pump(
    file: File,
    encoding: StreamEncoding,
    mode: ReadMode,
    callback: Box<dyn FnMut(Option<&str>) + Send>,
) -> StreamReadHandle {
    let token = CancellationToken::new();
    let pump_token = token.clone();
    let join = tokio::task::spawn_blocking(move || pump(file, encoding, mode, pump_token, callback));
    StreamReadHandle { token, join }
}

fn pump(
    mut file: File,
    encoding: StreamEncoding,
    mode: ReadMode,
    token: CancellationToken,
    mut callback: Box<dyn FnMut(Option<&str>) + Send>,
) -> ReadOutcome {
    let mut decoder = StreamDecoder::new(encoding);
    let mut splitter = LineSplitter::default();
    let mut buffer = [0u8; 1024];
    let mut text = String::new();

    loop {
        if token.is_cancelled() {
            return ReadOutcome::Cancelled;
        }

        let read = match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(count) => count,
            // a broken pipe when the child exits is the normal end of stream
            Err(_) => break,
        };

        if token.is_cancelled() {
            return ReadOutcome::Cancelled;
        }

        text.clear();
        decoder.decode(&buffer[..read], &mut text);
        if text.is_empty() {
            continue;
        }

        match mode {
            ReadMode::Chunks => callback(Some(&text)),
            ReadMode::Lines => splitter.push(&text, &mut |line| callback(Some(line))),
        }
    }

    text.clear();
    decoder.finish(&mut text);
    match mode {
        ReadMode::Chunks => {
            if !text.is_empty() {
                callback(Some(&text));
            }
        }
        ReadMode::Lines => {
            if !text.is_empty() {
                splitter.push(&text, &mut |line| callback(Some(line)));
            }
            splitter.flush(&mut |line| callback(Some(line)));
        }
    }

    // exactly one end-of-stream signal
    callback(None);
    ReadOutcome::Eof
}

fn environment_block(variables: &HashMap<String, String>) -> Vec<u16> {
    let mut pairs: Vec<(&String, &String)> = variables.iter().collect();
    pairs.sort_by(|a, b| a.0.to_uppercase().cmp(&b.0.to_uppercase()));

    let mut block = Vec::new();
    for (key, value) in pairs {
        block.extend(key.encode_utf16());
        block.push(u16::from(b'='));
        block.extend(value.encode_utf16());
        block.push(0);
    }
    // the block ends with an empty string
    block.push(0);
    if variables.is_empty() {
        block.push(0);
    }
    block
}
