//! Settings used when creating a new process.

use std::collections::HashMap;
use std::path::PathBuf;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// process creation flags, as passed to the kernel
const CREATE_BREAKAWAY_FROM_JOB: u32 = 0x0100_0000;
const CREATE_DEFAULT_ERROR_MODE: u32 = 0x0400_0000;
const CREATE_NEW_CONSOLE: u32 = 0x0000_0010;
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
const CREATE_NO_WINDOW: u32 = 0x0800_0000;
const CREATE_SUSPENDED: u32 = 0x0000_0004;
const DETACHED_PROCESS: u32 = 0x0000_0008;
const INHERIT_PARENT_AFFINITY: u32 = 0x0001_0000;
const DEBUG_PROCESS: u32 = 0x0000_0001;
const DEBUG_ONLY_THIS_PROCESS: u32 = 0x0000_0002;

/// Text encoding used for a redirected standard stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamEncoding {
    #[default]
    Utf8,
    Utf16Le,
}

/// Initial window state for the new process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum WindowShow {
    Hide = 0,
    Normal = 1,
    Minimized = 2,
    Maximized = 3,
    Default = 10,
}

/// Options that control how a new process is created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessOptions {
    /// Child processes of a job-assigned process are not placed in the job.
    pub breakaway_from_job: bool,
    /// The process gets the default error mode instead of inheriting.
    pub default_error_mode: bool,
    /// The process gets a new console instead of inheriting its parent's.
    /// Cannot be combined with `detached`.
    pub new_console: bool,
    /// The process becomes the root of a new process group.
    pub new_process_group: bool,
    /// Console process without a console window.
    pub no_window: bool,
    /// The primary thread starts suspended until explicitly resumed.
    pub suspended: bool,
    /// Console process that does not inherit its parent's console.
    pub detached: bool,
    pub inherit_parent_affinity: bool,
    pub debug: bool,
    pub debug_only_this_process: bool,
}

impl ProcessOptions {
    pub fn validate(&self) -> Result<()> {
        if self.new_console && self.detached {
            return Err(Error::InvalidConfig(
                "new_console and detached cannot be combined".into(),
            ));
        }
        Ok(())
    }

    /// The raw creation-flags word for these options.
    pub fn creation_flags(&self) -> u32 {
        let mut flags = 0;
        if self.breakaway_from_job {
            flags |= CREATE_BREAKAWAY_FROM_JOB;
        }
        if self.default_error_mode {
            flags |= CREATE_DEFAULT_ERROR_MODE;
        }
        if self.new_console {
            flags |= CREATE_NEW_CONSOLE;
        }
        if self.new_process_group {
            flags |= CREATE_NEW_PROCESS_GROUP;
        }
        if self.no_window {
            flags |= CREATE_NO_WINDOW;
        }
        if self.suspended {
            flags |= CREATE_SUSPENDED;
        }
        if self.detached {
            flags |= DETACHED_PROCESS;
        }
        if self.inherit_parent_affinity {
            flags |= INHERIT_PARENT_AFFINITY;
        }
        if self.debug {
            flags |= DEBUG_PROCESS;
        }
        if self.debug_only_this_process {
            flags |= DEBUG_ONLY_THIS_PROCESS;
        }
        flags
    }
}

/// Everything needed to launch a process: the executable, its arguments,
/// environment, credentials, startup attributes, and stream redirections.
///
/// `arguments` is a raw command-line tail used verbatim; `argument_list` is
/// escaped element by element. Setting both is a validation error.
#[derive(Debug, Clone, Default, PartialEq, Builder)]
#[builder(setter(into, strip_option))]
pub struct CreateProcessInfo {
    pub file_name: String,
    #[builder(default)]
    #[builder(setter(custom))]
    pub arguments: Option<String>,
    #[builder(default)]
    #[builder(setter(custom))]
    pub argument_list: Vec<String>,
    #[builder(default)]
    pub working_directory: Option<PathBuf>,
    #[builder(default)]
    #[builder(setter(custom))]
    pub environment: Option<HashMap<String, String>>,

    /// Run the process under these credentials instead of the caller's.
    #[builder(default)]
    pub user_name: Option<String>,
    #[builder(default)]
    pub domain: Option<String>,
    #[builder(default)]
    pub password: Option<String>,
    #[builder(default)]
    pub load_user_profile: bool,

    /// Desktop (or "desktop\windowstation") name for the new process.
    #[builder(default)]
    pub desktop: Option<String>,
    /// Console title, when a new console window is created.
    #[builder(default)]
    pub title: Option<String>,
    #[builder(default)]
    pub window_show: Option<WindowShow>,
    #[builder(default)]
    pub window_position: Option<(i32, i32)>,
    #[builder(default)]
    pub window_size: Option<(u32, u32)>,

    #[builder(default)]
    pub redirect_stdin: bool,
    #[builder(default)]
    pub redirect_stdout: bool,
    #[builder(default)]
    pub redirect_stderr: bool,
    #[builder(default)]
    pub stdout_encoding: Option<StreamEncoding>,
    #[builder(default)]
    pub stderr_encoding: Option<StreamEncoding>,
}

impl CreateProcessInfo {
    pub fn builder() -> CreateProcessInfoBuilder {
        CreateProcessInfoBuilder::default()
    }

    /// True when any standard stream is redirected.
    pub fn has_redirection(&self) -> bool {
        self.redirect_stdin || self.redirect_stdout || self.redirect_stderr
    }

    /// Checks the settings for contradictions. Runs before any OS call;
    /// nothing is ever partially applied.
    pub fn validate(&self) -> Result<()> {
        if self.file_name.trim().is_empty() {
            return Err(Error::InvalidConfig("file_name is empty".into()));
        }

        if self.arguments.as_deref().is_some_and(|a| !a.is_empty()) && !self.argument_list.is_empty() {
            return Err(Error::InvalidConfig(
                "arguments and argument_list cannot both be set".into(),
            ));
        }

        if self.stdout_encoding.is_some() && !self.redirect_stdout {
            return Err(Error::InvalidConfig(
                "stdout_encoding requires redirect_stdout".into(),
            ));
        }

        if self.stderr_encoding.is_some() && !self.redirect_stderr {
            return Err(Error::InvalidConfig(
                "stderr_encoding requires redirect_stderr".into(),
            ));
        }

        if self.password.is_some() && self.user_name.is_none() {
            return Err(Error::InvalidConfig("password requires user_name".into()));
        }

        if self.domain.is_some() && self.user_name.is_none() {
            return Err(Error::InvalidConfig("domain requires user_name".into()));
        }

        Ok(())
    }
}

impl CreateProcessInfoBuilder {
    /// Raw command-line tail, used verbatim.
    pub fn arguments<S: Into<String>>(&mut self, arguments: S) -> &mut Self {
        self.arguments = Some(Some(arguments.into()));
        self
    }

    /// Appends one argument to the escaped argument list.
    pub fn arg<S: ToString>(&mut self, argument: S) -> &mut Self {
        self.argument_list
            .get_or_insert_with(Vec::new)
            .push(argument.to_string());
        self
    }

    /// Replaces the escaped argument list.
    pub fn args<S: ToString, I: IntoIterator<Item = S>>(&mut self, iter: I) -> &mut Self {
        let arguments: Vec<String> = iter.into_iter().map(|s| s.to_string()).collect();
        self.argument_list = Some(arguments);
        self
    }

    pub fn env<T: ToString>(&mut self, key: T, value: T) -> &mut Self {
        let map = self
            .environment
            .get_or_insert_with(|| Some(HashMap::new()))
            .get_or_insert_with(HashMap::new);
        map.insert(key.to_string(), value.to_string());
        self
    }

    pub fn env_multi<T: ToString, I: IntoIterator<Item = (T, T)>>(&mut self, iter: I) -> &mut Self {
        for (key, value) in iter {
            self.env(key, value);
        }
        self
    }
}
