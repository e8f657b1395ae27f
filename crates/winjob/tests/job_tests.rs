#![cfg(windows)]

use std::os::windows::io::AsRawHandle;
use std::time::Duration;

use winjob::{
    CpuLimit, CreateProcessInfo, Error, JobEvent, JobLimits, JobNotifications, JobObject,
    JobOptions, Process, ProcessOptions, RateControl, RateControlInterval, RateControlTolerance,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .try_init();
}

fn quick_exit() -> CreateProcessInfo {
    CreateProcessInfo::builder()
        .file_name("cmd.exe")
        .args(["/C", "echo done"])
        .build()
        .unwrap()
}

fn long_running() -> CreateProcessInfo {
    CreateProcessInfo::builder()
        .file_name("ping.exe")
        .args(["-n", "60", "127.0.0.1"])
        .build()
        .unwrap()
}

fn no_window() -> ProcessOptions {
    ProcessOptions { no_window: true, ..Default::default() }
}

fn kill_on_close_limits() -> JobLimits {
    JobLimits {
        options: JobOptions { terminate_processes_when_job_closed: true, ..Default::default() },
        ..Default::default()
    }
}

async fn collect_until_idle(
    receiver: &mut tokio::sync::broadcast::Receiver<JobEvent>,
    deadline: Duration,
) -> Vec<JobEvent> {
    let mut events = Vec::new();
    let _ = tokio::time::timeout(deadline, async {
        while let Ok(event) = receiver.recv().await {
            let is_idle = event == JobEvent::Idle;
            events.push(event);
            if is_idle {
                break;
            }
        }
    })
    .await;
    events
}

#[tokio::test(flavor = "multi_thread")]
async fn job_raises_process_lifecycle_events() {
    init_tracing();

    let job = JobObject::with_config(Some(&kill_on_close_limits()), None).unwrap();
    let mut receiver = job.subscribe();

    let process = job.create_process(&quick_exit(), no_window()).unwrap();
    let pid = process.id();

    tokio::time::timeout(Duration::from_secs(30), process.exited().unwrap())
        .await
        .expect("process did not exit")
        .unwrap();

    let events = collect_until_idle(&mut receiver, Duration::from_secs(15)).await;
    assert!(
        events.contains(&JobEvent::ProcessAdded { pid }),
        "missing ProcessAdded, got {events:?}"
    );
    assert!(
        events.contains(&JobEvent::ProcessExited { pid, abnormal: false }),
        "missing ProcessExited, got {events:?}"
    );
    assert_eq!(events.last(), Some(&JobEvent::Idle), "job never went idle: {events:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn active_process_limit_rejects_exactly_the_overflow() {
    init_tracing();

    let limits = JobLimits {
        active_processes: Some(3),
        options: JobOptions { terminate_processes_when_job_closed: true, ..Default::default() },
        ..Default::default()
    };
    let job = JobObject::with_config(Some(&limits), None).unwrap();

    let mut running = Vec::new();
    let mut limit_failures = 0;
    for _ in 0..5 {
        match job.create_process(&long_running(), no_window()) {
            Ok(process) => running.push(process),
            Err(Error::ProcessLimitReached) => limit_failures += 1,
            Err(other) => panic!("expected ProcessLimitReached, got {other}"),
        }
    }

    assert_eq!(limit_failures, 2, "exactly two launches must hit the limit");
    assert_eq!(running.len(), 3);

    let ids = job.get_process_ids().unwrap();
    assert_eq!(ids.len(), 3, "job must report exactly the three live processes");
    for process in &running {
        assert!(ids.contains(&process.id()));
    }

    job.kill(1).unwrap();
    for process in running {
        let _ = tokio::time::timeout(Duration::from_secs(10), process.exited().unwrap())
            .await
            .expect("killed job member did not exit");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn job_kill_terminates_every_member_with_the_exit_code() {
    init_tracing();

    let job = JobObject::with_config(Some(&kill_on_close_limits()), None).unwrap();
    let first = job.create_process(&long_running(), no_window()).unwrap();
    let second = job.create_process(&long_running(), no_window()).unwrap();

    job.kill(7).unwrap();

    for process in [first, second] {
        tokio::time::timeout(Duration::from_secs(10), process.exited().unwrap())
            .await
            .expect("job member did not exit after kill")
            .unwrap();
        assert_eq!(process.exit_code().unwrap(), Some(7));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn accounting_tracks_the_job_population() {
    init_tracing();

    let job = JobObject::with_config(Some(&kill_on_close_limits()), None).unwrap();
    let first = job.create_process(&long_running(), no_window()).unwrap();
    let second = job.create_process(&long_running(), no_window()).unwrap();

    let accounting = job.get_accounting().unwrap();
    assert_eq!(accounting.active_processes, 2);
    assert!(accounting.total_processes >= 2);

    job.kill(1).unwrap();
    for process in [first, second] {
        let _ = tokio::time::timeout(Duration::from_secs(10), process.exited().unwrap())
            .await
            .expect("job member did not exit");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn limits_round_trip_through_the_kernel() {
    init_tracing();

    let limits = JobLimits {
        active_processes: Some(4),
        maximum_process_memory: Some(256 * 1024 * 1024),
        options: JobOptions { terminate_processes_when_job_closed: true, ..Default::default() },
        ..Default::default()
    };
    let job = JobObject::with_config(Some(&limits), None).unwrap();

    let effective = job.get_limits().unwrap();
    assert_eq!(effective.active_processes, Some(4));
    assert_eq!(effective.maximum_process_memory, Some(256 * 1024 * 1024));
    assert!(effective.options.terminate_processes_when_job_closed);

    if JobObject::supports_notifications() {
        let notifications = JobNotifications {
            maximum_memory: Some(512 * 1024 * 1024),
            cpu_rate: Some(RateControl {
                interval: RateControlInterval::Short,
                tolerance: RateControlTolerance::Low,
            }),
            ..Default::default()
        };
        job.set_notifications(&notifications).unwrap();
        let effective = job.get_notifications().unwrap();
        assert_eq!(effective.maximum_memory, Some(512 * 1024 * 1024));
        assert_eq!(
            effective.cpu_rate,
            Some(RateControl {
                interval: RateControlInterval::Short,
                tolerance: RateControlTolerance::Low,
            })
        );
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn externally_opened_process_can_be_assigned() {
    init_tracing();

    let job = JobObject::with_config(Some(&kill_on_close_limits()), None).unwrap();

    // a process created directly, not through the job, then adopted
    let process = Process::spawn(&long_running(), no_window()).unwrap();

    job.assign_process(process.as_raw_handle()).unwrap();
    let ids = job.get_process_ids().unwrap();
    assert!(ids.contains(&process.id()));

    job.kill(1).unwrap();
    tokio::time::timeout(Duration::from_secs(10), process.exited().unwrap())
        .await
        .expect("adopted process did not exit after job kill")
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn hard_capped_cpu_rate_throttles_the_job() {
    init_tracing();

    if !JobObject::supports_cpu_rates() {
        return;
    }

    let limits = JobLimits {
        cpu: Some(CpuLimit::Rate { percent: 10.0, hard_cap: true }),
        options: JobOptions { terminate_processes_when_job_closed: true, ..Default::default() },
        ..Default::default()
    };
    let job = JobObject::with_config(Some(&limits), None).unwrap();

    let busy = CreateProcessInfo::builder()
        .file_name("cmd.exe")
        .args(["/C", "for /L %i in (1,1,2000000000) do @rem"])
        .build()
        .unwrap();
    let process = job.create_process(&busy, no_window()).unwrap();

    let wall = Duration::from_secs(6);
    tokio::time::sleep(wall).await;
    let accounting = job.get_accounting().unwrap();
    job.kill(1).unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(10), process.exited().unwrap()).await;

    // a 10% hard cap keeps a spinning child well under half the wall clock
    assert!(
        accounting.total_user_time < wall / 2,
        "hard cap did not throttle: user time {:?} over {:?} wall",
        accounting.total_user_time,
        wall
    );
}

// Exercises the full CPU-rate violation path: a 10%-capped job with rate
// notifications configured must report at least one violation while a busy
// child spins. The kernel's measurement interval makes this take tens of
// seconds and it needs an otherwise quiet machine.
#[tokio::test(flavor = "multi_thread")]
#[ignore = "timing-dependent; run manually on a quiet machine"]
async fn cpu_rate_violation_raises_an_event() {
    init_tracing();

    if !JobObject::supports_notifications() {
        return;
    }

    let limits = JobLimits {
        cpu: Some(CpuLimit::Rate { percent: 10.0, hard_cap: true }),
        options: JobOptions { terminate_processes_when_job_closed: true, ..Default::default() },
        ..Default::default()
    };
    let notifications = JobNotifications {
        cpu_rate: Some(RateControl {
            interval: RateControlInterval::Short,
            tolerance: RateControlTolerance::Low,
        }),
        ..Default::default()
    };
    let job = JobObject::with_config(Some(&limits), Some(&notifications)).unwrap();
    let mut receiver = job.subscribe();

    let busy = CreateProcessInfo::builder()
        .file_name("cmd.exe")
        .args(["/C", "for /L %i in (1,1,2000000000) do @rem"])
        .build()
        .unwrap();
    let process = job.create_process(&busy, no_window()).unwrap();

    let saw_violation = tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            match receiver.recv().await {
                Ok(JobEvent::CpuRateLimitExceeded { .. }) => break true,
                Ok(_) => continue,
                Err(_) => break false,
            }
        }
    })
    .await
    .unwrap_or(false);

    job.kill(1).unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(10), process.exited().unwrap()).await;

    assert!(saw_violation, "no CPU rate violation event observed");
}

#[tokio::test(flavor = "multi_thread")]
async fn capability_probe_is_stable() {
    init_tracing();

    let first = JobObject::os_capabilities();
    let second = JobObject::os_capabilities();
    assert_eq!(first.limit_violation, second.limit_violation);
    assert_eq!(JobObject::supports_cpu_rates(), JobObject::supports_notifications());

    // merely exercises the query; the answer depends on how tests are hosted
    let _ = JobObject::current_process_in_job().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn many_jobs_share_one_listener_and_tear_down_cleanly() {
    init_tracing();

    let jobs: Vec<JobObject> = (0..8)
        .map(|_| JobObject::with_config(Some(&kill_on_close_limits()), None).unwrap())
        .collect();

    // every job gets its own dispatch key on the one shared port
    let mut receivers: Vec<_> = jobs.iter().map(JobObject::subscribe).collect();

    let mut processes = Vec::new();
    for job in &jobs {
        processes.push(job.create_process(&quick_exit(), no_window()).unwrap());
    }
    for process in &processes {
        tokio::time::timeout(Duration::from_secs(30), process.exited().unwrap())
            .await
            .expect("job member did not exit")
            .unwrap();
    }

    for receiver in &mut receivers {
        let events = collect_until_idle(receiver, Duration::from_secs(15)).await;
        assert!(
            events.iter().any(|e| matches!(e, JobEvent::ProcessAdded { .. })),
            "a job missed its own ProcessAdded: {events:?}"
        );
    }

    drop(jobs); // the last drop shuts the shared listener down
}
