//! Worker pool behavior with scripted in-memory workers: routing,
//! round-robin, saturation, registration, disconnect recovery, and a full
//! dispatch round trip through the engine.

use std::sync::Arc;

use crossbeam_channel::{Sender, unbounded};
use parking_lot::Mutex;

use fleetmon::checks::{CheckOptions, CheckResult, CheckType};
use fleetmon::config::EngineConfig;
use fleetmon::core::errors::Result;
use fleetmon::engine::Engine;
use fleetmon::objects::{HostState, ObjectArena, load_fleet_str};
use fleetmon::workers::protocol::{JobReply, JobSpec, KvFrame, Registration, key, kind};
use fleetmon::workers::{
    JobCallback, SpawnedWorker, WorkerEvent, WorkerPools, WorkerSpawner, WorkerTransport,
};

/// Frames sent to workers, tagged with the sending worker's key.
type SentFrames = Arc<Mutex<Vec<(u32, KvFrame)>>>;

struct ScriptedTransport {
    key: u32,
    sent: SentFrames,
}

impl WorkerTransport for ScriptedTransport {
    fn send(&mut self, frame: &KvFrame) -> std::io::Result<()> {
        self.sent.lock().push((self.key, frame.clone()));
        Ok(())
    }
}

/// Spawner that hands out in-memory workers and records every frame.
struct ScriptedSpawner {
    sent: SentFrames,
    max_jobs: usize,
    spawned: Arc<Mutex<u32>>,
}

impl ScriptedSpawner {
    fn new(max_jobs: usize) -> (Self, SentFrames, Arc<Mutex<u32>>) {
        let sent: SentFrames = Arc::default();
        let spawned = Arc::new(Mutex::new(0));
        (
            Self {
                sent: Arc::clone(&sent),
                max_jobs,
                spawned: Arc::clone(&spawned),
            },
            sent,
            spawned,
        )
    }
}

impl WorkerSpawner for ScriptedSpawner {
    fn spawn(&mut self, key: u32, _events: &Sender<WorkerEvent>) -> Result<SpawnedWorker> {
        *self.spawned.lock() += 1;
        Ok(SpawnedWorker {
            name: format!("scripted-{key}"),
            pid: 9000 + key,
            max_jobs: self.max_jobs,
            transport: Box::new(ScriptedTransport {
                key,
                sent: Arc::clone(&self.sent),
            }),
        })
    }
}

fn tiny_arena() -> ObjectArena {
    load_fleet_str(
        r#"
[[commands]]
name = "check_ping"
line = "/usr/lib/monitoring/check_ping -H $HOSTADDRESS$"

[[hosts]]
name = "web01"
address = "10.0.0.1"
check_command = "check_ping"
"#,
    )
    .expect("fleet parses")
}

fn host_callback(arena: &ObjectArena) -> JobCallback {
    let host = arena.host_by_name("web01").expect("host exists");
    JobCallback::Host {
        host,
        result: CheckResult::new(CheckType::Active, CheckOptions::NONE),
    }
}

fn pools_with(max_jobs: usize) -> (WorkerPools, SentFrames, Arc<Mutex<u32>>) {
    let (spawner, sent, spawned) = ScriptedSpawner::new(max_jobs);
    let (tx, _rx) = unbounded();
    (WorkerPools::new(Box::new(spawner), tx), sent, spawned)
}

#[test]
fn jobs_spread_across_the_default_pool() {
    let arena = tiny_arena();
    let (mut pools, sent, _) = pools_with(0);
    pools.spawn_default(2).unwrap();

    for _ in 0..4 {
        pools
            .run_job("check_ping -H 10.0.0.1", 30, host_callback(&arena))
            .unwrap();
    }

    let sent = sent.lock();
    let to_first = sent.iter().filter(|(k, _)| *k == 0).count();
    let to_second = sent.iter().filter(|(k, _)| *k == 1).count();
    assert_eq!(to_first, 2);
    assert_eq!(to_second, 2);
    for (_, frame) in sent.iter() {
        assert_eq!(frame.get(key::KIND), Some(kind::JOB));
    }
}

#[test]
fn specialized_pool_claims_its_command_by_basename() {
    let arena = tiny_arena();
    let (mut pools, sent, _) = pools_with(0);
    pools.spawn_default(1).unwrap(); // key 0
    pools.add_specialized("check_snmp", 1).unwrap(); // key 1

    pools
        .run_job("/usr/lib/monitoring/check_snmp -H sw1 -C public", 30, host_callback(&arena))
        .unwrap();
    pools
        .run_job("check_ping -H 10.0.0.1", 30, host_callback(&arena))
        .unwrap();

    let sent = sent.lock();
    assert_eq!(sent.len(), 2);
    // The snmp job lands on the specialized worker despite the path prefix.
    assert_eq!(sent[0].0, 1);
    assert_eq!(sent[1].0, 0);
}

#[test]
fn saturated_pool_rejects_with_a_retryable_error() {
    let arena = tiny_arena();
    let (mut pools, _, _) = pools_with(1);
    pools.spawn_default(1).unwrap();

    pools
        .run_job("check_ping -H a", 30, host_callback(&arena))
        .unwrap();
    let err = pools
        .run_job("check_ping -H b", 30, host_callback(&arena))
        .unwrap_err();
    assert_eq!(err.code(), "FM-3001");
    assert!(err.is_retryable());
}

#[test]
fn registration_overrides_spawn_time_capacity() {
    let arena = tiny_arena();
    let (mut pools, _, _) = pools_with(0);
    pools.spawn_default(1).unwrap();

    // The worker announces it can only take one job at a time.
    pools.apply_registration(
        0,
        &Registration {
            name: "core-worker-4242".to_string(),
            pid: 4242,
            max_jobs: 1,
        },
    );

    pools
        .run_job("check_ping -H a", 30, host_callback(&arena))
        .unwrap();
    let err = pools
        .run_job("check_ping -H b", 30, host_callback(&arena))
        .unwrap_err();
    assert_eq!(err.code(), "FM-3001");
}

#[test]
fn take_job_consumes_the_entry() {
    let arena = tiny_arena();
    let (mut pools, _, _) = pools_with(0);
    pools.spawn_default(1).unwrap();

    let (worker, job_id) = pools
        .run_job("check_ping -H 10.0.0.1", 30, host_callback(&arena))
        .unwrap();
    let job = pools.take_job(worker, job_id).expect("job is outstanding");
    assert_eq!(job.command, "check_ping -H 10.0.0.1");
    assert_eq!(job.timeout_s, 30);
    assert!(pools.take_job(worker, job_id).is_none());
}

#[test]
fn disconnect_returns_orphans_and_respawns() {
    let arena = tiny_arena();
    let (mut pools, _, spawned) = pools_with(0);
    pools.spawn_default(1).unwrap();
    assert_eq!(*spawned.lock(), 1);

    let (worker, _) = pools
        .run_job("check_ping -H 10.0.0.1", 30, host_callback(&arena))
        .unwrap();

    let orphans = pools.handle_disconnect(worker);
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].command, "check_ping -H 10.0.0.1");
    // The pool is back at strength with a fresh worker.
    assert_eq!(pools.total_workers(), 1);
    assert_eq!(*spawned.lock(), 2);

    // The replacement accepts the resubmission.
    pools
        .run_job("check_ping -H 10.0.0.1", 30, host_callback(&arena))
        .unwrap();
}

#[test]
fn unknown_worker_disconnect_is_a_no_op() {
    let (mut pools, _, spawned) = pools_with(0);
    pools.spawn_default(1).unwrap();
    assert!(pools.handle_disconnect(77).is_empty());
    assert_eq!(pools.total_workers(), 1);
    assert_eq!(*spawned.lock(), 1);
}

// ── Engine round trip ──────────────────────────────────────────────────────

#[test]
fn host_check_round_trips_through_a_worker_reply() {
    let arena = tiny_arena();
    let host_id = arena.host_by_name("web01").unwrap();

    let (spawner, sent, _) = ScriptedSpawner::new(0);
    let (tx, _rx) = unbounded();
    let mut pools = WorkerPools::new(Box::new(spawner), tx);
    pools.spawn_default(1).unwrap();

    let mut engine = Engine::new(EngineConfig::default(), arena, pools).unwrap();
    engine.set_fixed_time(1_767_614_400);

    engine
        .run_async_host_check(host_id, CheckOptions::NONE, 0.25)
        .unwrap();
    assert!(engine.objects.host(host_id).rt.is_executing);

    // The job frame carries the expanded command line.
    let spec = {
        let sent = sent.lock();
        assert_eq!(sent.len(), 1);
        JobSpec::from_frame(&sent[0].1).unwrap()
    };
    assert_eq!(spec.command, "/usr/lib/monitoring/check_ping -H 10.0.0.1");
    assert_eq!(spec.timeout_s, 30);

    let reply = JobReply {
        job_id: spec.job_id,
        start: 1_767_614_400.0,
        stop: 1_767_614_402.5,
        exited_ok: true,
        early_timeout: false,
        exit_code: 0,
        signal: None,
        outstd: "PING OK - rta 0.42ms|rta=0.42ms".to_string(),
        outerr: String::new(),
        error_msg: None,
    };
    engine.handle_worker_event(WorkerEvent::Frame {
        worker: 0,
        frame: reply.to_frame(),
    });

    let host = engine.objects.host(host_id);
    assert_eq!(host.current_state, HostState::Up);
    assert!(host.rt.has_been_checked);
    assert!(!host.rt.is_executing);
    assert_eq!(host.rt.plugin_output, "PING OK - rta 0.42ms");
    assert_eq!(host.rt.perf_data, "rta=0.42ms");
}

#[test]
fn registration_frame_routes_through_the_engine() {
    let arena = tiny_arena();
    let host_id = arena.host_by_name("web01").unwrap();

    let (spawner, _, _) = ScriptedSpawner::new(0);
    let (tx, _rx) = unbounded();
    let mut pools = WorkerPools::new(Box::new(spawner), tx);
    pools.spawn_default(1).unwrap();

    let mut engine = Engine::new(EngineConfig::default(), arena, pools).unwrap();
    engine.set_fixed_time(1_767_614_400);

    let frame = Registration {
        name: "core-worker-1".to_string(),
        pid: 1,
        max_jobs: 1,
    }
    .to_frame();
    engine.handle_worker_event(WorkerEvent::Frame { worker: 0, frame });

    // Capacity one: the first dispatch fills the worker, the second fails
    // over to the retry path inside the engine (here, surfaced directly).
    engine
        .run_async_host_check(host_id, CheckOptions::FORCE_EXECUTION, 0.0)
        .unwrap();
    let err = engine
        .run_async_host_check(host_id, CheckOptions::FORCE_EXECUTION, 0.0)
        .unwrap_err();
    assert_eq!(err.code(), "FM-3001");
}
