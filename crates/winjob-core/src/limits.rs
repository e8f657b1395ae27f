//! Typed job limits and their translation to the kernel's flag-and-struct
//! encoding.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::raw;

fn duration_to_ticks(duration: Duration) -> i64 {
    (duration.as_nanos() / 100).min(i64::MAX as u128) as i64
}

fn ticks_to_duration(ticks: i64) -> Duration {
    Duration::from_nanos((ticks.max(0) as u64).saturating_mul(100))
}

/// What a `set_limits` call does to the job's user-time limit.
///
/// Replacing versus preserving is an explicit choice here, never a side
/// effect of field assignment order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobTimePolicy {
    /// Keep whatever time limit is currently in effect.
    #[default]
    Preserve,
    /// Remove any time limit currently in effect.
    Clear,
    /// Replace the time limit with this per-job user-mode execution budget.
    Limit(Duration),
}

/// CPU-rate control for a job. A closed set: the kernel accepts exactly one
/// of these shapes at a time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum CpuLimit {
    /// A fixed percentage (0, 100] of total system CPU time.
    Rate { percent: f64, hard_cap: bool },
    /// A scheduling weight from 1 to 9 relative to other jobs.
    WeightedRate { weight: u32, hard_cap: bool },
    /// A guaranteed minimum and enforced maximum percentage.
    MinMaxRate { min_percent: f64, max_percent: f64 },
}

impl CpuLimit {
    fn to_raw(self) -> Result<raw::JOBOBJECT_CPU_RATE_CONTROL_INFORMATION> {
        let mut info = raw::JOBOBJECT_CPU_RATE_CONTROL_INFORMATION {
            ControlFlags: raw::JOB_OBJECT_CPU_RATE_CONTROL_ENABLE,
            Rate: 0,
        };

        match self {
            CpuLimit::Rate { percent, hard_cap } => {
                let scaled = scale_percent(percent)?;
                if scaled == 0 {
                    return Err(Error::OutOfRange { field: "percent" });
                }
                if hard_cap {
                    info.ControlFlags |= raw::JOB_OBJECT_CPU_RATE_CONTROL_HARD_CAP;
                }
                info.Rate = scaled;
            }
            CpuLimit::WeightedRate { weight, hard_cap } => {
                if !(1..=9).contains(&weight) {
                    return Err(Error::OutOfRange { field: "weight" });
                }
                info.ControlFlags |= raw::JOB_OBJECT_CPU_RATE_CONTROL_WEIGHT_BASED;
                if hard_cap {
                    info.ControlFlags |= raw::JOB_OBJECT_CPU_RATE_CONTROL_HARD_CAP;
                }
                info.Rate = weight;
            }
            CpuLimit::MinMaxRate { min_percent, max_percent } => {
                let min = scale_percent(min_percent)?;
                let max = scale_percent(max_percent)?;
                info.ControlFlags |= raw::JOB_OBJECT_CPU_RATE_CONTROL_MIN_MAX_RATE;
                info.set_min_max(min as u16, max as u16);
            }
        }

        Ok(info)
    }

    fn from_raw(info: &raw::JOBOBJECT_CPU_RATE_CONTROL_INFORMATION) -> Option<CpuLimit> {
        if info.ControlFlags & raw::JOB_OBJECT_CPU_RATE_CONTROL_ENABLE == 0 {
            return None;
        }

        let hard_cap = info.ControlFlags & raw::JOB_OBJECT_CPU_RATE_CONTROL_HARD_CAP != 0;
        let shape = info.ControlFlags
            & (raw::JOB_OBJECT_CPU_RATE_CONTROL_WEIGHT_BASED | raw::JOB_OBJECT_CPU_RATE_CONTROL_MIN_MAX_RATE);

        match shape {
            0 => Some(CpuLimit::Rate { percent: info.Rate as f64 / 100.0, hard_cap }),
            raw::JOB_OBJECT_CPU_RATE_CONTROL_WEIGHT_BASED => {
                Some(CpuLimit::WeightedRate { weight: info.Rate, hard_cap })
            }
            raw::JOB_OBJECT_CPU_RATE_CONTROL_MIN_MAX_RATE => Some(CpuLimit::MinMaxRate {
                min_percent: info.min_rate() as f64 / 100.0,
                max_percent: info.max_rate() as f64 / 100.0,
            }),
            // both shape bits set is not a state the kernel produces
            _ => None,
        }
    }
}

/// Hundredths of a percent, as the kernel expects.
fn scale_percent(percent: f64) -> Result<u32> {
    if !percent.is_finite() || percent < 0.0 {
        return Err(Error::OutOfRange { field: "percent" });
    }
    let scaled = (percent * 100.0).trunc();
    if scaled > 10_000.0 {
        return Err(Error::OutOfRange { field: "percent" });
    }
    Ok(scaled as u32)
}

/// Behavioral options for a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Allow processes to breakaway from the job when requested at creation.
    pub allow_breakaway: bool,
    /// New child processes are not automatically associated with the job.
    pub allow_silent_breakaway: bool,
    /// Suppress Windows Error Reporting for unhandled exceptions in the job.
    pub prevent_windows_error_reporting: bool,
    /// Terminate every process in the job when the last job handle closes.
    pub terminate_processes_when_job_closed: bool,
    /// Terminate at the job time limit instead of posting a notification
    /// and clearing the limit.
    pub terminate_at_time_limit: bool,
}

/// User-interface restrictions applied to every process in a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UiRestrictions {
    pub handles: bool,
    pub read_clipboard: bool,
    pub write_clipboard: bool,
    pub system_parameters: bool,
    pub display_settings: bool,
    pub global_atoms: bool,
    pub desktop: bool,
    pub exit_windows: bool,
}

impl UiRestrictions {
    fn to_raw(self) -> u32 {
        let mut flags = 0;
        if self.handles {
            flags |= raw::JOB_OBJECT_UILIMIT_HANDLES;
        }
        if self.read_clipboard {
            flags |= raw::JOB_OBJECT_UILIMIT_READCLIPBOARD;
        }
        if self.write_clipboard {
            flags |= raw::JOB_OBJECT_UILIMIT_WRITECLIPBOARD;
        }
        if self.system_parameters {
            flags |= raw::JOB_OBJECT_UILIMIT_SYSTEMPARAMETERS;
        }
        if self.display_settings {
            flags |= raw::JOB_OBJECT_UILIMIT_DISPLAYSETTINGS;
        }
        if self.global_atoms {
            flags |= raw::JOB_OBJECT_UILIMIT_GLOBALATOMS;
        }
        if self.desktop {
            flags |= raw::JOB_OBJECT_UILIMIT_DESKTOP;
        }
        if self.exit_windows {
            flags |= raw::JOB_OBJECT_UILIMIT_EXITWINDOWS;
        }
        flags
    }

    fn from_raw(flags: u32) -> UiRestrictions {
        UiRestrictions {
            handles: flags & raw::JOB_OBJECT_UILIMIT_HANDLES != 0,
            read_clipboard: flags & raw::JOB_OBJECT_UILIMIT_READCLIPBOARD != 0,
            write_clipboard: flags & raw::JOB_OBJECT_UILIMIT_WRITECLIPBOARD != 0,
            system_parameters: flags & raw::JOB_OBJECT_UILIMIT_SYSTEMPARAMETERS != 0,
            display_settings: flags & raw::JOB_OBJECT_UILIMIT_DISPLAYSETTINGS != 0,
            global_atoms: flags & raw::JOB_OBJECT_UILIMIT_GLOBALATOMS != 0,
            desktop: flags & raw::JOB_OBJECT_UILIMIT_DESKTOP != 0,
            exit_windows: flags & raw::JOB_OBJECT_UILIMIT_EXITWINDOWS != 0,
        }
    }
}

/// Limits associated with a job object. Every field is optional; unset
/// fields leave the corresponding kernel limit unset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobLimits {
    pub job_time: JobTimePolicy,
    /// Per-process user-mode execution time limit.
    pub process_time_limit: Option<Duration>,
    /// Maximum number of simultaneously active processes.
    pub active_processes: Option<u32>,
    /// Processor affinity mask for every process in the job.
    pub affinity: Option<u64>,
    /// Minimum and maximum working-set size, in bytes.
    pub working_set: Option<(u64, u64)>,
    /// Maximum virtual memory committed by any single process.
    pub maximum_process_memory: Option<u64>,
    /// Maximum virtual memory committed by all processes together.
    pub maximum_memory: Option<u64>,
    pub cpu: Option<CpuLimit>,
    pub options: JobOptions,
    pub ui_restrictions: UiRestrictions,
}

/// The four kernel structures one `JobLimits` value expands into.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawJobLimits {
    pub extended: raw::JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
    pub end_of_job: raw::JOBOBJECT_END_OF_JOB_TIME_INFORMATION,
    pub ui: raw::JOBOBJECT_BASIC_UI_RESTRICTIONS,
    pub cpu: raw::JOBOBJECT_CPU_RATE_CONTROL_INFORMATION,
}

impl JobLimits {
    /// Expands into the kernel encoding. Range validation happens here,
    /// before any handle is touched.
    pub fn to_raw(&self) -> Result<RawJobLimits> {
        let mut out = RawJobLimits::default();
        let basic = &mut out.extended.BasicLimitInformation;

        match self.job_time {
            JobTimePolicy::Preserve => {
                basic.LimitFlags |= raw::JOB_OBJECT_LIMIT_PRESERVE_JOB_TIME;
            }
            JobTimePolicy::Clear => {}
            JobTimePolicy::Limit(duration) => {
                basic.PerJobUserTimeLimit = duration_to_ticks(duration);
                basic.LimitFlags |= raw::JOB_OBJECT_LIMIT_JOB_TIME;
            }
        }

        if let Some(limit) = self.process_time_limit {
            basic.PerProcessUserTimeLimit = duration_to_ticks(limit);
            basic.LimitFlags |= raw::JOB_OBJECT_LIMIT_PROCESS_TIME;
        }

        if let Some(count) = self.active_processes {
            basic.ActiveProcessLimit = count;
            basic.LimitFlags |= raw::JOB_OBJECT_LIMIT_ACTIVE_PROCESS;
        }

        if let Some(mask) = self.affinity {
            basic.Affinity = mask as usize;
            basic.LimitFlags |= raw::JOB_OBJECT_LIMIT_AFFINITY;
        }

        if let Some((minimum, maximum)) = self.working_set {
            if minimum > maximum {
                return Err(Error::OutOfRange { field: "working_set" });
            }
            basic.MinimumWorkingSetSize = minimum as usize;
            basic.MaximumWorkingSetSize = maximum as usize;
            basic.LimitFlags |= raw::JOB_OBJECT_LIMIT_WORKINGSET;
        }

        if let Some(limit) = self.maximum_process_memory {
            out.extended.ProcessMemoryLimit = limit as usize;
            out.extended.BasicLimitInformation.LimitFlags |= raw::JOB_OBJECT_LIMIT_PROCESS_MEMORY;
        }

        if let Some(limit) = self.maximum_memory {
            out.extended.JobMemoryLimit = limit as usize;
            out.extended.BasicLimitInformation.LimitFlags |= raw::JOB_OBJECT_LIMIT_JOB_MEMORY;
        }

        let flags = &mut out.extended.BasicLimitInformation.LimitFlags;
        if self.options.allow_breakaway {
            *flags |= raw::JOB_OBJECT_LIMIT_BREAKAWAY_OK;
        }
        if self.options.allow_silent_breakaway {
            *flags |= raw::JOB_OBJECT_LIMIT_SILENT_BREAKAWAY_OK;
        }
        if self.options.prevent_windows_error_reporting {
            *flags |= raw::JOB_OBJECT_LIMIT_DIE_ON_UNHANDLED_EXCEPTION;
        }
        if self.options.terminate_processes_when_job_closed {
            *flags |= raw::JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;
        }

        out.end_of_job.EndOfJobTimeAction = if self.options.terminate_at_time_limit {
            raw::JOB_OBJECT_TERMINATE_AT_END_OF_JOB
        } else {
            raw::JOB_OBJECT_POST_AT_END_OF_JOB
        };

        if let Some(cpu) = self.cpu {
            out.cpu = cpu.to_raw()?;
        }

        out.ui.UIRestrictionsClass = self.ui_restrictions.to_raw();
        Ok(out)
    }

    /// Rebuilds the typed view from a kernel query. When the query shows no
    /// time limit, `job_time` is `Preserve` so that round-tripping a queried
    /// value through `set_limits` never clears a limit it did not name.
    pub fn from_raw(raw_limits: &RawJobLimits) -> JobLimits {
        let basic = &raw_limits.extended.BasicLimitInformation;
        let flags = basic.LimitFlags;

        let job_time = if flags & raw::JOB_OBJECT_LIMIT_JOB_TIME != 0 {
            JobTimePolicy::Limit(ticks_to_duration(basic.PerJobUserTimeLimit))
        } else {
            JobTimePolicy::Preserve
        };

        JobLimits {
            job_time,
            process_time_limit: (flags & raw::JOB_OBJECT_LIMIT_PROCESS_TIME != 0)
                .then(|| ticks_to_duration(basic.PerProcessUserTimeLimit)),
            active_processes: (flags & raw::JOB_OBJECT_LIMIT_ACTIVE_PROCESS != 0)
                .then_some(basic.ActiveProcessLimit),
            affinity: (flags & raw::JOB_OBJECT_LIMIT_AFFINITY != 0).then_some(basic.Affinity as u64),
            working_set: (flags & raw::JOB_OBJECT_LIMIT_WORKINGSET != 0)
                .then_some((basic.MinimumWorkingSetSize as u64, basic.MaximumWorkingSetSize as u64)),
            maximum_process_memory: (flags & raw::JOB_OBJECT_LIMIT_PROCESS_MEMORY != 0)
                .then_some(raw_limits.extended.ProcessMemoryLimit as u64),
            maximum_memory: (flags & raw::JOB_OBJECT_LIMIT_JOB_MEMORY != 0)
                .then_some(raw_limits.extended.JobMemoryLimit as u64),
            cpu: CpuLimit::from_raw(&raw_limits.cpu),
            options: JobOptions {
                allow_breakaway: flags & raw::JOB_OBJECT_LIMIT_BREAKAWAY_OK != 0,
                allow_silent_breakaway: flags & raw::JOB_OBJECT_LIMIT_SILENT_BREAKAWAY_OK != 0,
                prevent_windows_error_reporting: flags & raw::JOB_OBJECT_LIMIT_DIE_ON_UNHANDLED_EXCEPTION != 0,
                terminate_processes_when_job_closed: flags & raw::JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE != 0,
                terminate_at_time_limit: raw_limits.end_of_job.EndOfJobTimeAction
                    == raw::JOB_OBJECT_TERMINATE_AT_END_OF_JOB,
            },
            ui_restrictions: UiRestrictions::from_raw(raw_limits.ui.UIRestrictionsClass),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_limits_preserve_job_time() {
        let raw_limits = JobLimits::default().to_raw().unwrap();
        let flags = raw_limits.extended.BasicLimitInformation.LimitFlags;
        assert_ne!(flags & raw::JOB_OBJECT_LIMIT_PRESERVE_JOB_TIME, 0);
        assert_eq!(flags & raw::JOB_OBJECT_LIMIT_JOB_TIME, 0);
    }

    #[test]
    fn explicit_time_limit_replaces() {
        let limits = JobLimits {
            job_time: JobTimePolicy::Limit(Duration::from_secs(60)),
            ..Default::default()
        };
        let raw_limits = limits.to_raw().unwrap();
        let basic = raw_limits.extended.BasicLimitInformation;
        assert_ne!(basic.LimitFlags & raw::JOB_OBJECT_LIMIT_JOB_TIME, 0);
        assert_eq!(basic.LimitFlags & raw::JOB_OBJECT_LIMIT_PRESERVE_JOB_TIME, 0);
        assert_eq!(basic.PerJobUserTimeLimit, 60 * 10_000_000);
    }

    #[test]
    fn clear_sets_neither_time_flag() {
        let limits = JobLimits { job_time: JobTimePolicy::Clear, ..Default::default() };
        let flags = limits.to_raw().unwrap().extended.BasicLimitInformation.LimitFlags;
        assert_eq!(flags & raw::JOB_OBJECT_LIMIT_JOB_TIME, 0);
        assert_eq!(flags & raw::JOB_OBJECT_LIMIT_PRESERVE_JOB_TIME, 0);
    }

    #[test]
    fn active_process_and_memory_limits_set_flags_and_values() {
        let limits = JobLimits {
            active_processes: Some(3),
            maximum_process_memory: Some(64 * 1024 * 1024),
            maximum_memory: Some(256 * 1024 * 1024),
            working_set: Some((1024 * 1024, 8 * 1024 * 1024)),
            ..Default::default()
        };
        let raw_limits = limits.to_raw().unwrap();
        let basic = raw_limits.extended.BasicLimitInformation;
        assert_eq!(basic.ActiveProcessLimit, 3);
        assert_ne!(basic.LimitFlags & raw::JOB_OBJECT_LIMIT_ACTIVE_PROCESS, 0);
        assert_ne!(basic.LimitFlags & raw::JOB_OBJECT_LIMIT_PROCESS_MEMORY, 0);
        assert_ne!(basic.LimitFlags & raw::JOB_OBJECT_LIMIT_JOB_MEMORY, 0);
        assert_ne!(basic.LimitFlags & raw::JOB_OBJECT_LIMIT_WORKINGSET, 0);
        assert_eq!(raw_limits.extended.ProcessMemoryLimit, 64 * 1024 * 1024);
        assert_eq!(raw_limits.extended.JobMemoryLimit, 256 * 1024 * 1024);
    }

    #[test]
    fn inverted_working_set_is_rejected_before_any_syscall() {
        let limits = JobLimits { working_set: Some((2, 1)), ..Default::default() };
        assert!(matches!(limits.to_raw(), Err(Error::OutOfRange { field: "working_set" })));
    }

    #[test]
    fn cpu_rate_limit_scales_to_hundredths() {
        let info = CpuLimit::Rate { percent: 10.0, hard_cap: true }.to_raw().unwrap();
        assert_eq!(info.Rate, 1000);
        assert_ne!(info.ControlFlags & raw::JOB_OBJECT_CPU_RATE_CONTROL_ENABLE, 0);
        assert_ne!(info.ControlFlags & raw::JOB_OBJECT_CPU_RATE_CONTROL_HARD_CAP, 0);
        assert_eq!(info.ControlFlags & raw::JOB_OBJECT_CPU_RATE_CONTROL_WEIGHT_BASED, 0);
    }

    #[test]
    fn cpu_rate_bounds() {
        assert!(CpuLimit::Rate { percent: 0.0, hard_cap: false }.to_raw().is_err());
        assert!(CpuLimit::Rate { percent: 100.01, hard_cap: false }.to_raw().is_err());
        assert!(CpuLimit::Rate { percent: 100.0, hard_cap: false }.to_raw().is_ok());
        assert!(CpuLimit::Rate { percent: 0.01, hard_cap: false }.to_raw().is_ok());
        assert!(CpuLimit::WeightedRate { weight: 0, hard_cap: false }.to_raw().is_err());
        assert!(CpuLimit::WeightedRate { weight: 10, hard_cap: false }.to_raw().is_err());
        assert!(CpuLimit::WeightedRate { weight: 9, hard_cap: true }.to_raw().is_ok());
    }

    #[test]
    fn cpu_variants_round_trip() {
        let variants = [
            CpuLimit::Rate { percent: 12.5, hard_cap: false },
            CpuLimit::Rate { percent: 10.0, hard_cap: true },
            CpuLimit::WeightedRate { weight: 5, hard_cap: false },
            CpuLimit::MinMaxRate { min_percent: 5.0, max_percent: 75.0 },
        ];
        for variant in variants {
            let info = variant.to_raw().unwrap();
            assert_eq!(CpuLimit::from_raw(&info), Some(variant));
        }
    }

    #[test]
    fn disabled_or_malformed_cpu_info_reads_as_none() {
        let info = raw::JOBOBJECT_CPU_RATE_CONTROL_INFORMATION::default();
        assert_eq!(CpuLimit::from_raw(&info), None);

        let info = raw::JOBOBJECT_CPU_RATE_CONTROL_INFORMATION {
            ControlFlags: raw::JOB_OBJECT_CPU_RATE_CONTROL_ENABLE
                | raw::JOB_OBJECT_CPU_RATE_CONTROL_WEIGHT_BASED
                | raw::JOB_OBJECT_CPU_RATE_CONTROL_MIN_MAX_RATE,
            Rate: 1,
        };
        assert_eq!(CpuLimit::from_raw(&info), None);
    }

    #[test]
    fn options_and_ui_restrictions_round_trip() {
        let limits = JobLimits {
            options: JobOptions {
                allow_breakaway: true,
                terminate_processes_when_job_closed: true,
                terminate_at_time_limit: true,
                ..Default::default()
            },
            ui_restrictions: UiRestrictions {
                handles: true,
                desktop: true,
                exit_windows: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let raw_limits = limits.to_raw().unwrap();
        assert_eq!(raw_limits.end_of_job.EndOfJobTimeAction, raw::JOB_OBJECT_TERMINATE_AT_END_OF_JOB);

        let back = JobLimits::from_raw(&raw_limits);
        assert_eq!(back.options, limits.options);
        assert_eq!(back.ui_restrictions, limits.ui_restrictions);
    }

    #[test]
    fn queried_limits_round_trip() {
        let limits = JobLimits {
            job_time: JobTimePolicy::Limit(Duration::from_secs(30)),
            process_time_limit: Some(Duration::from_secs(5)),
            active_processes: Some(8),
            affinity: Some(0b1010),
            maximum_memory: Some(1 << 30),
            cpu: Some(CpuLimit::Rate { percent: 50.0, hard_cap: false }),
            ..Default::default()
        };
        let back = JobLimits::from_raw(&limits.to_raw().unwrap());
        assert_eq!(back, limits);
    }

    #[test]
    fn serde_round_trip() {
        let limits = JobLimits {
            job_time: JobTimePolicy::Limit(Duration::from_secs(1)),
            cpu: Some(CpuLimit::MinMaxRate { min_percent: 1.0, max_percent: 50.0 }),
            ..Default::default()
        };
        let json = serde_json::to_string(&limits).unwrap();
        let back: JobLimits = serde_json::from_str(&json).unwrap();
        assert_eq!(back, limits);
    }
}
