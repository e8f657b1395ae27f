//! Raw job-object information-class layouts and flags.
//!
//! These mirror the kernel's control blocks byte-for-byte so the typed
//! translators can be exercised on any platform; the Windows crate passes
//! them to `SetInformationJobObject`/`QueryInformationJobObject` by pointer.

#![allow(non_snake_case)]

/// Information classes accepted by the job-object query/set calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum JobInformationClass {
    BasicAccounting = 1,
    BasicLimit = 2,
    BasicProcessIdList = 3,
    BasicUiRestrictions = 4,
    EndOfJobTime = 6,
    AssociateCompletionPort = 7,
    BasicAndIoAccounting = 8,
    ExtendedLimit = 9,
    Group = 11,
    NotificationLimit = 12,
    LimitViolation = 13,
    GroupEx = 14,
    CpuRateControl = 15,
    NotificationLimit2 = 33,
    LimitViolation2 = 34,
}

/// Messages delivered through a job's completion port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum JobMessage {
    EndOfJobTime = 1,
    EndOfProcessTime = 2,
    ActiveProcessLimit = 3,
    ActiveProcessZero = 4,
    NewProcess = 6,
    ExitProcess = 7,
    AbnormalExitProcess = 8,
    ProcessMemoryLimit = 9,
    JobMemoryLimit = 10,
    NotificationLimit = 11,
    JobCycleTimeLimit = 12,
    SiloTerminated = 13,
}

impl JobMessage {
    pub fn from_raw(value: u32) -> Option<JobMessage> {
        Some(match value {
            1 => JobMessage::EndOfJobTime,
            2 => JobMessage::EndOfProcessTime,
            3 => JobMessage::ActiveProcessLimit,
            4 => JobMessage::ActiveProcessZero,
            6 => JobMessage::NewProcess,
            7 => JobMessage::ExitProcess,
            8 => JobMessage::AbnormalExitProcess,
            9 => JobMessage::ProcessMemoryLimit,
            10 => JobMessage::JobMemoryLimit,
            11 => JobMessage::NotificationLimit,
            12 => JobMessage::JobCycleTimeLimit,
            13 => JobMessage::SiloTerminated,
            _ => return None,
        })
    }
}

// basic limit flags
pub const JOB_OBJECT_LIMIT_WORKINGSET: u32 = 0x0000_0001;
pub const JOB_OBJECT_LIMIT_PROCESS_TIME: u32 = 0x0000_0002;
pub const JOB_OBJECT_LIMIT_JOB_TIME: u32 = 0x0000_0004;
pub const JOB_OBJECT_LIMIT_ACTIVE_PROCESS: u32 = 0x0000_0008;
pub const JOB_OBJECT_LIMIT_AFFINITY: u32 = 0x0000_0010;
pub const JOB_OBJECT_LIMIT_PRESERVE_JOB_TIME: u32 = 0x0000_0040;

// extended limit flags
pub const JOB_OBJECT_LIMIT_PROCESS_MEMORY: u32 = 0x0000_0100;
pub const JOB_OBJECT_LIMIT_JOB_MEMORY: u32 = 0x0000_0200;
pub const JOB_OBJECT_LIMIT_DIE_ON_UNHANDLED_EXCEPTION: u32 = 0x0000_0400;
pub const JOB_OBJECT_LIMIT_BREAKAWAY_OK: u32 = 0x0000_0800;
pub const JOB_OBJECT_LIMIT_SILENT_BREAKAWAY_OK: u32 = 0x0000_1000;
pub const JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE: u32 = 0x0000_2000;

// notification limit flags
pub const JOB_OBJECT_LIMIT_JOB_READ_BYTES: u32 = 0x0001_0000;
pub const JOB_OBJECT_LIMIT_JOB_WRITE_BYTES: u32 = 0x0002_0000;
pub const JOB_OBJECT_LIMIT_CPU_RATE_CONTROL: u32 = 0x0004_0000;

// cpu rate control flags
pub const JOB_OBJECT_CPU_RATE_CONTROL_ENABLE: u32 = 0x0000_0001;
pub const JOB_OBJECT_CPU_RATE_CONTROL_WEIGHT_BASED: u32 = 0x0000_0002;
pub const JOB_OBJECT_CPU_RATE_CONTROL_HARD_CAP: u32 = 0x0000_0004;
pub const JOB_OBJECT_CPU_RATE_CONTROL_MIN_MAX_RATE: u32 = 0x0000_0010;

// ui restriction flags
pub const JOB_OBJECT_UILIMIT_HANDLES: u32 = 0x0000_0001;
pub const JOB_OBJECT_UILIMIT_READCLIPBOARD: u32 = 0x0000_0002;
pub const JOB_OBJECT_UILIMIT_WRITECLIPBOARD: u32 = 0x0000_0004;
pub const JOB_OBJECT_UILIMIT_SYSTEMPARAMETERS: u32 = 0x0000_0008;
pub const JOB_OBJECT_UILIMIT_DISPLAYSETTINGS: u32 = 0x0000_0010;
pub const JOB_OBJECT_UILIMIT_GLOBALATOMS: u32 = 0x0000_0020;
pub const JOB_OBJECT_UILIMIT_DESKTOP: u32 = 0x0000_0040;
pub const JOB_OBJECT_UILIMIT_EXITWINDOWS: u32 = 0x0000_0080;

// end-of-job-time actions
pub const JOB_OBJECT_TERMINATE_AT_END_OF_JOB: u32 = 0;
pub const JOB_OBJECT_POST_AT_END_OF_JOB: u32 = 1;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IO_COUNTERS {
    pub ReadOperationCount: u64,
    pub WriteOperationCount: u64,
    pub OtherOperationCount: u64,
    pub ReadTransferCount: u64,
    pub WriteTransferCount: u64,
    pub OtherTransferCount: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct JOBOBJECT_BASIC_LIMIT_INFORMATION {
    /// 100-nanosecond units.
    pub PerProcessUserTimeLimit: i64,
    /// 100-nanosecond units.
    pub PerJobUserTimeLimit: i64,
    pub LimitFlags: u32,
    pub MinimumWorkingSetSize: usize,
    pub MaximumWorkingSetSize: usize,
    pub ActiveProcessLimit: u32,
    pub Affinity: usize,
    pub PriorityClass: u32,
    pub SchedulingClass: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct JOBOBJECT_EXTENDED_LIMIT_INFORMATION {
    pub BasicLimitInformation: JOBOBJECT_BASIC_LIMIT_INFORMATION,
    pub IoInfo: IO_COUNTERS,
    pub ProcessMemoryLimit: usize,
    pub JobMemoryLimit: usize,
    pub PeakProcessMemoryUsed: usize,
    pub PeakJobMemoryUsed: usize,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct JOBOBJECT_BASIC_ACCOUNTING_INFORMATION {
    pub TotalUserTime: i64,
    pub TotalKernelTime: i64,
    pub ThisPeriodTotalUserTime: i64,
    pub ThisPeriodTotalKernelTime: i64,
    pub TotalPageFaultCount: u32,
    pub TotalProcesses: u32,
    pub ActiveProcesses: u32,
    pub TotalTerminatedProcesses: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct JOBOBJECT_BASIC_AND_IO_ACCOUNTING_INFORMATION {
    pub BasicInfo: JOBOBJECT_BASIC_ACCOUNTING_INFORMATION,
    pub IoInfo: IO_COUNTERS,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct JOBOBJECT_END_OF_JOB_TIME_INFORMATION {
    pub EndOfJobTimeAction: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct JOBOBJECT_BASIC_UI_RESTRICTIONS {
    pub UIRestrictionsClass: u32,
}

/// The rate field is a union in the kernel layout: a flat rate, a weight, or
/// a packed (min, max) pair depending on `ControlFlags`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct JOBOBJECT_CPU_RATE_CONTROL_INFORMATION {
    pub ControlFlags: u32,
    pub Rate: u32,
}

impl JOBOBJECT_CPU_RATE_CONTROL_INFORMATION {
    pub fn set_min_max(&mut self, min: u16, max: u16) {
        self.Rate = (min as u32) | ((max as u32) << 16);
    }

    pub fn min_rate(&self) -> u16 {
        (self.Rate & 0xFFFF) as u16
    }

    pub fn max_rate(&self) -> u16 {
        (self.Rate >> 16) as u16
    }
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct JOBOBJECT_NOTIFICATION_LIMIT_INFORMATION {
    pub IoReadBytesLimit: u64,
    pub IoWriteBytesLimit: u64,
    /// 100-nanosecond units.
    pub PerJobUserTimeLimit: i64,
    pub JobMemoryLimit: u64,
    pub RateControlTolerance: i32,
    pub RateControlToleranceInterval: i32,
    pub LimitFlags: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct JOBOBJECT_LIMIT_VIOLATION_INFORMATION {
    pub LimitFlags: u32,
    pub ViolationLimitFlags: u32,
    pub IoReadBytes: u64,
    pub IoReadBytesLimit: u64,
    pub IoWriteBytes: u64,
    pub IoWriteBytesLimit: u64,
    /// 100-nanosecond units.
    pub PerJobUserTime: i64,
    /// 100-nanosecond units.
    pub PerJobUserTimeLimit: i64,
    pub JobMemory: u64,
    pub JobMemoryLimit: u64,
    pub RateControlTolerance: i32,
    pub RateControlToleranceLimit: i32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct JOBOBJECT_ASSOCIATE_COMPLETION_PORT {
    /// The job handle's raw value, used as the dispatch key.
    pub CompletionKey: usize,
    pub CompletionPort: usize,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct JOBOBJECT_BASIC_PROCESS_ID_LIST_HEADER {
    pub NumberOfAssignedProcesses: u32,
    pub NumberOfProcessIdsInList: u32,
    // followed in memory by NumberOfProcessIdsInList pointer-sized entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn layouts_match_kernel_sizes() {
        // sizes on a 64-bit target, straight from the platform headers
        assert_eq!(size_of::<IO_COUNTERS>(), 48);
        assert_eq!(size_of::<JOBOBJECT_BASIC_LIMIT_INFORMATION>(), 64);
        assert_eq!(size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>(), 144);
        assert_eq!(size_of::<JOBOBJECT_BASIC_AND_IO_ACCOUNTING_INFORMATION>(), 96);
        assert_eq!(size_of::<JOBOBJECT_NOTIFICATION_LIMIT_INFORMATION>(), 48);
        assert_eq!(size_of::<JOBOBJECT_LIMIT_VIOLATION_INFORMATION>(), 80);
        assert_eq!(size_of::<JOBOBJECT_CPU_RATE_CONTROL_INFORMATION>(), 8);
    }

    #[test]
    fn min_max_rate_packs_into_low_and_high_words() {
        let mut info = JOBOBJECT_CPU_RATE_CONTROL_INFORMATION::default();
        info.set_min_max(500, 7500);
        assert_eq!(info.min_rate(), 500);
        assert_eq!(info.max_rate(), 7500);
        assert_eq!(info.Rate, 500 | (7500 << 16));
    }

    #[test]
    fn message_round_trip() {
        for value in 1..=13u32 {
            match JobMessage::from_raw(value) {
                Some(message) => assert_eq!(message as u32, value),
                None => assert_eq!(value, 5), // 5 is unassigned in the kernel
            }
        }
        assert_eq!(JobMessage::from_raw(0), None);
        assert_eq!(JobMessage::from_raw(99), None);
    }
}
