//! Accounting information reported by a job object.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::raw;

fn ticks_to_duration(ticks: i64) -> Duration {
    Duration::from_nanos((ticks.max(0) as u64).saturating_mul(100))
}

/// A point-in-time snapshot of a job's resource usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobAccounting {
    /// Total user-mode time for all processes ever associated with the job.
    pub total_user_time: Duration,
    /// Total kernel-mode time for all processes ever associated with the job.
    pub total_kernel_time: Duration,
    /// User-mode time since the last call that set a per-job time limit.
    pub this_period_user_time: Duration,
    /// Kernel-mode time since the last call that set a per-job time limit.
    pub this_period_kernel_time: Duration,
    pub total_page_faults: u32,
    /// Processes ever associated with the job.
    pub total_processes: u32,
    /// Processes currently associated with the job.
    pub active_processes: u32,
    /// Processes terminated because of a limit violation.
    pub terminated_processes: u32,
    pub read_operations: u64,
    pub write_operations: u64,
    pub other_operations: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub other_bytes: u64,
    /// Peak memory usage across all processes currently in the job.
    pub peak_memory_used: u64,
    /// Peak memory used by any single process ever in the job.
    pub peak_process_memory_used: u64,
}

impl JobAccounting {
    pub fn from_raw(
        accounting: &raw::JOBOBJECT_BASIC_AND_IO_ACCOUNTING_INFORMATION,
        limits: &raw::JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
    ) -> JobAccounting {
        JobAccounting {
            total_user_time: ticks_to_duration(accounting.BasicInfo.TotalUserTime),
            total_kernel_time: ticks_to_duration(accounting.BasicInfo.TotalKernelTime),
            this_period_user_time: ticks_to_duration(accounting.BasicInfo.ThisPeriodTotalUserTime),
            this_period_kernel_time: ticks_to_duration(accounting.BasicInfo.ThisPeriodTotalKernelTime),
            total_page_faults: accounting.BasicInfo.TotalPageFaultCount,
            total_processes: accounting.BasicInfo.TotalProcesses,
            active_processes: accounting.BasicInfo.ActiveProcesses,
            terminated_processes: accounting.BasicInfo.TotalTerminatedProcesses,
            read_operations: accounting.IoInfo.ReadOperationCount,
            write_operations: accounting.IoInfo.WriteOperationCount,
            other_operations: accounting.IoInfo.OtherOperationCount,
            read_bytes: accounting.IoInfo.ReadTransferCount,
            write_bytes: accounting.IoInfo.WriteTransferCount,
            other_bytes: accounting.IoInfo.OtherTransferCount,
            peak_memory_used: limits.PeakJobMemoryUsed as u64,
            peak_process_memory_used: limits.PeakProcessMemoryUsed as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_translates_times_and_counters() {
        let accounting = raw::JOBOBJECT_BASIC_AND_IO_ACCOUNTING_INFORMATION {
            BasicInfo: raw::JOBOBJECT_BASIC_ACCOUNTING_INFORMATION {
                TotalUserTime: 10_000_000,
                TotalKernelTime: 20_000_000,
                ThisPeriodTotalUserTime: 5_000_000,
                ThisPeriodTotalKernelTime: 0,
                TotalPageFaultCount: 42,
                TotalProcesses: 7,
                ActiveProcesses: 3,
                TotalTerminatedProcesses: 1,
            },
            IoInfo: raw::IO_COUNTERS {
                ReadOperationCount: 11,
                WriteOperationCount: 12,
                OtherOperationCount: 13,
                ReadTransferCount: 1024,
                WriteTransferCount: 2048,
                OtherTransferCount: 4096,
            },
        };
        let limits = raw::JOBOBJECT_EXTENDED_LIMIT_INFORMATION {
            PeakJobMemoryUsed: 1 << 24,
            PeakProcessMemoryUsed: 1 << 20,
            ..Default::default()
        };

        let snapshot = JobAccounting::from_raw(&accounting, &limits);
        assert_eq!(snapshot.total_user_time, Duration::from_secs(1));
        assert_eq!(snapshot.total_kernel_time, Duration::from_secs(2));
        assert_eq!(snapshot.this_period_user_time, Duration::from_millis(500));
        assert_eq!(snapshot.active_processes, 3);
        assert_eq!(snapshot.read_bytes, 1024);
        assert_eq!(snapshot.peak_memory_used, 1 << 24);
        assert_eq!(snapshot.peak_process_memory_used, 1 << 20);
    }

    #[test]
    fn negative_times_clamp_to_zero() {
        let accounting = raw::JOBOBJECT_BASIC_AND_IO_ACCOUNTING_INFORMATION {
            BasicInfo: raw::JOBOBJECT_BASIC_ACCOUNTING_INFORMATION {
                TotalUserTime: -1,
                ..Default::default()
            },
            ..Default::default()
        };
        let snapshot = JobAccounting::from_raw(&accounting, &Default::default());
        assert_eq!(snapshot.total_user_time, Duration::ZERO);
    }
}
