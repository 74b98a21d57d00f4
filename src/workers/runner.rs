//! Worker-side job runner.
//!
//! Runs inside the spawned `fleetmon worker` process: announces itself with
//! a registration frame, reads job frames from stdin, executes each command
//! under `/bin/sh -c` in its own process group with a deadline, and writes a
//! reply frame per job. Stdout is the protocol channel; diagnostics go to
//! stderr.

use std::io::{self, Read};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use parking_lot::Mutex;

use crate::core::errors::{FmError, Result};
use crate::workers::protocol::{JobReply, JobSpec, KvFrame, Registration};

/// How often the deadline loop polls a running job.
const WAIT_POLL: Duration = Duration::from_millis(25);

type SharedOut = Arc<Mutex<io::Stdout>>;

fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn send_reply(out: &SharedOut, reply: &JobReply) {
    let mut guard = out.lock();
    if let Err(e) = reply.to_frame().write_to(&mut *guard) {
        // Parent is gone; nothing useful left to do with this job.
        eprintln!("fleetmon worker: reply write failed: {e}");
    }
}

/// Run the worker loop until stdin closes.
pub fn run(max_jobs: usize) -> Result<()> {
    let out: SharedOut = Arc::new(Mutex::new(io::stdout()));
    let running = Arc::new(AtomicUsize::new(0));

    let registration = Registration {
        name: format!("core-worker-{}", std::process::id()),
        pid: std::process::id(),
        max_jobs,
    };
    registration
        .to_frame()
        .write_to(&mut *out.lock())
        .map_err(|e| FmError::Runtime {
            details: format!("registration write failed: {e}"),
        })?;

    let mut stdin = io::stdin().lock();
    loop {
        let frame = match KvFrame::read_from(&mut stdin) {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                return Err(FmError::Runtime {
                    details: format!("job frame read failed: {e}"),
                });
            }
        };
        let spec = match JobSpec::from_frame(&frame) {
            Ok(spec) => spec,
            Err(e) => {
                eprintln!("fleetmon worker: dropping malformed job frame: {e}");
                continue;
            }
        };
        if max_jobs != 0 && running.load(Ordering::SeqCst) >= max_jobs {
            send_reply(&out, &overload_reply(&spec));
            continue;
        }
        running.fetch_add(1, Ordering::SeqCst);
        let out = Arc::clone(&out);
        let running_in_job = Arc::clone(&running);
        let spawned = std::thread::Builder::new()
            .name(format!("job-{}", spec.job_id))
            .spawn(move || {
                let reply = run_job(&spec);
                send_reply(&out, &reply);
                running_in_job.fetch_sub(1, Ordering::SeqCst);
            });
        if let Err(e) = spawned {
            running.fetch_sub(1, Ordering::SeqCst);
            return Err(FmError::Runtime {
                details: format!("job thread spawn failed: {e}"),
            });
        }
    }
    Ok(())
}

fn overload_reply(spec: &JobSpec) -> JobReply {
    let now = epoch_now();
    JobReply {
        job_id: spec.job_id,
        start: now,
        stop: now,
        exited_ok: false,
        early_timeout: false,
        exit_code: -1,
        signal: None,
        outstd: String::new(),
        outerr: String::new(),
        error_msg: Some("worker at capacity".to_string()),
    }
}

fn failure_reply(spec: &JobSpec, start: f64, msg: String) -> JobReply {
    JobReply {
        job_id: spec.job_id,
        start,
        stop: epoch_now(),
        exited_ok: false,
        early_timeout: false,
        exit_code: -1,
        signal: None,
        outstd: String::new(),
        outerr: String::new(),
        error_msg: Some(msg),
    }
}

fn run_job(spec: &JobSpec) -> JobReply {
    let start = epoch_now();
    let started = Instant::now();

    let mut child = match Command::new("/bin/sh")
        .arg("-c")
        .arg(&spec.command)
        .process_group(0)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => return failure_reply(spec, start, format!("spawn failed: {e}")),
    };

    // Drain pipes on their own threads so a chatty plugin can't deadlock
    // against a full pipe buffer.
    let stdout_rx = child.stdout.take().map(drain_thread);
    let stderr_rx = child.stderr.take().map(drain_thread);

    let deadline = if spec.timeout_s == 0 {
        None
    } else {
        Some(started + Duration::from_secs(spec.timeout_s))
    };
    let mut early_timeout = false;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {}
            Err(e) => {
                return failure_reply(spec, start, format!("wait failed: {e}"));
            }
        }
        if let Some(d) = deadline {
            if Instant::now() >= d && !early_timeout {
                early_timeout = true;
                // The whole process group dies, shell and grandchildren both.
                #[allow(clippy::cast_possible_wrap)]
                let pgid = Pid::from_raw(child.id() as i32);
                let _ = killpg(pgid, Signal::SIGKILL);
            }
        }
        std::thread::sleep(WAIT_POLL);
    };

    let outstd = stdout_rx.map(collect_drained).unwrap_or_default();
    let outerr = stderr_rx.map(collect_drained).unwrap_or_default();

    let (exited_ok, exit_code, signal) = status.map_or((false, -1, None), |s| {
        match (s.code(), s.signal()) {
            (Some(code), _) => (true, code, None),
            (None, sig) => (false, -1, sig),
        }
    });

    JobReply {
        job_id: spec.job_id,
        start,
        stop: epoch_now(),
        exited_ok,
        early_timeout,
        exit_code,
        signal,
        outstd,
        outerr,
        error_msg: None,
    }
}

fn drain_thread<R: Read + Send + 'static>(mut r: R) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = String::new();
        let mut raw = Vec::new();
        if r.read_to_end(&mut raw).is_ok() {
            buf = String::from_utf8_lossy(&raw).into_owned();
        }
        buf
    })
}

fn collect_drained(handle: std::thread::JoinHandle<String>) -> String {
    handle.join().unwrap_or_default()
}
