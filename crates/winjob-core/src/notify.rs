//! Typed notification thresholds and their kernel encoding.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::raw;

/// Measurement window for CPU-rate violation reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum RateControlInterval {
    /// 10 seconds.
    #[default]
    Short = 1,
    /// 1 minute.
    Medium = 2,
    /// 10 minutes.
    Long = 3,
}

/// How far past the configured rate a job may run, as a fraction of the
/// measurement interval, before a violation is reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum RateControlTolerance {
    /// 20% of the interval.
    Low = 1,
    /// 40% of the interval.
    Medium = 2,
    /// 60% of the interval.
    #[default]
    High = 3,
}

impl RateControlTolerance {
    pub fn from_raw(value: i32) -> Option<RateControlTolerance> {
        match value {
            1 => Some(RateControlTolerance::Low),
            2 => Some(RateControlTolerance::Medium),
            3 => Some(RateControlTolerance::High),
            _ => None,
        }
    }
}

impl RateControlInterval {
    pub fn from_raw(value: i32) -> Option<RateControlInterval> {
        match value {
            1 => Some(RateControlInterval::Short),
            2 => Some(RateControlInterval::Medium),
            3 => Some(RateControlInterval::Long),
            _ => None,
        }
    }
}

/// Interval and tolerance for CPU-rate violation notifications.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateControl {
    pub interval: RateControlInterval,
    pub tolerance: RateControlTolerance,
}

/// Thresholds that raise notifications without enforcing anything. Every
/// field is optional; unset fields report nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobNotifications {
    /// Total I/O bytes read by all processes in the job.
    pub io_read_bytes: Option<u64>,
    /// Total I/O bytes written by all processes in the job.
    pub io_write_bytes: Option<u64>,
    /// Total user-mode time for all processes in the job.
    pub time_limit: Option<Duration>,
    /// Total committed virtual memory for all processes in the job.
    pub maximum_memory: Option<u64>,
    /// CPU-rate violation reporting window and tolerance.
    pub cpu_rate: Option<RateControl>,
}

impl JobNotifications {
    pub fn to_raw(&self) -> raw::JOBOBJECT_NOTIFICATION_LIMIT_INFORMATION {
        let mut info = raw::JOBOBJECT_NOTIFICATION_LIMIT_INFORMATION::default();

        if let Some(bytes) = self.io_read_bytes {
            info.IoReadBytesLimit = bytes;
            info.LimitFlags |= raw::JOB_OBJECT_LIMIT_JOB_READ_BYTES;
        }

        if let Some(bytes) = self.io_write_bytes {
            info.IoWriteBytesLimit = bytes;
            info.LimitFlags |= raw::JOB_OBJECT_LIMIT_JOB_WRITE_BYTES;
        }

        if let Some(limit) = self.time_limit {
            info.PerJobUserTimeLimit = (limit.as_nanos() / 100).min(i64::MAX as u128) as i64;
            info.LimitFlags |= raw::JOB_OBJECT_LIMIT_JOB_TIME;
        }

        if let Some(bytes) = self.maximum_memory {
            info.JobMemoryLimit = bytes;
            info.LimitFlags |= raw::JOB_OBJECT_LIMIT_JOB_MEMORY;
        }

        if let Some(rate) = self.cpu_rate {
            info.RateControlToleranceInterval = rate.interval as i32;
            info.RateControlTolerance = rate.tolerance as i32;
            info.LimitFlags |= raw::JOB_OBJECT_LIMIT_CPU_RATE_CONTROL;
        }

        info
    }

    pub fn from_raw(info: &raw::JOBOBJECT_NOTIFICATION_LIMIT_INFORMATION) -> JobNotifications {
        let flags = info.LimitFlags;
        JobNotifications {
            io_read_bytes: (flags & raw::JOB_OBJECT_LIMIT_JOB_READ_BYTES != 0)
                .then_some(info.IoReadBytesLimit),
            io_write_bytes: (flags & raw::JOB_OBJECT_LIMIT_JOB_WRITE_BYTES != 0)
                .then_some(info.IoWriteBytesLimit),
            time_limit: (flags & raw::JOB_OBJECT_LIMIT_JOB_TIME != 0)
                .then(|| Duration::from_nanos((info.PerJobUserTimeLimit.max(0) as u64).saturating_mul(100))),
            maximum_memory: (flags & raw::JOB_OBJECT_LIMIT_JOB_MEMORY != 0)
                .then_some(info.JobMemoryLimit),
            cpu_rate: (flags & raw::JOB_OBJECT_LIMIT_CPU_RATE_CONTROL != 0).then(|| RateControl {
                interval: RateControlInterval::from_raw(info.RateControlToleranceInterval)
                    .unwrap_or_default(),
                tolerance: RateControlTolerance::from_raw(info.RateControlTolerance)
                    .unwrap_or_default(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_notifications_set_no_flags() {
        let info = JobNotifications::default().to_raw();
        assert_eq!(info.LimitFlags, 0);
    }

    #[test]
    fn each_threshold_sets_its_flag() {
        let notifications = JobNotifications {
            io_read_bytes: Some(1024),
            io_write_bytes: Some(2048),
            time_limit: Some(Duration::from_secs(3)),
            maximum_memory: Some(1 << 20),
            cpu_rate: Some(RateControl {
                interval: RateControlInterval::Medium,
                tolerance: RateControlTolerance::Low,
            }),
        };
        let info = notifications.to_raw();
        assert_ne!(info.LimitFlags & raw::JOB_OBJECT_LIMIT_JOB_READ_BYTES, 0);
        assert_ne!(info.LimitFlags & raw::JOB_OBJECT_LIMIT_JOB_WRITE_BYTES, 0);
        assert_ne!(info.LimitFlags & raw::JOB_OBJECT_LIMIT_JOB_TIME, 0);
        assert_ne!(info.LimitFlags & raw::JOB_OBJECT_LIMIT_JOB_MEMORY, 0);
        assert_ne!(info.LimitFlags & raw::JOB_OBJECT_LIMIT_CPU_RATE_CONTROL, 0);
        assert_eq!(info.IoReadBytesLimit, 1024);
        assert_eq!(info.IoWriteBytesLimit, 2048);
        assert_eq!(info.PerJobUserTimeLimit, 3 * 10_000_000);
        assert_eq!(info.RateControlToleranceInterval, 2);
        assert_eq!(info.RateControlTolerance, 1);
    }

    #[test]
    fn queried_notifications_round_trip() {
        let notifications = JobNotifications {
            io_write_bytes: Some(4096),
            cpu_rate: Some(RateControl::default()),
            ..Default::default()
        };
        let back = JobNotifications::from_raw(&notifications.to_raw());
        assert_eq!(back, notifications);
    }

    #[test]
    fn unknown_tolerance_values_fall_back_to_defaults() {
        let info = raw::JOBOBJECT_NOTIFICATION_LIMIT_INFORMATION {
            LimitFlags: raw::JOB_OBJECT_LIMIT_CPU_RATE_CONTROL,
            RateControlTolerance: 0,
            RateControlToleranceInterval: 0,
            ..Default::default()
        };
        let back = JobNotifications::from_raw(&info);
        assert_eq!(
            back.cpu_rate,
            Some(RateControl {
                interval: RateControlInterval::Short,
                tolerance: RateControlTolerance::High,
            })
        );
    }
}
