//! State-machine scenario matrix: soft/hard transition arcs, reachability,
//! scheduling policy, freshness races, and the host/service interaction
//! rules that are easy to get subtly wrong.
//!
//! Scenario families:
//! 1. Host soft/hard confirmation arcs and recovery resets
//! 2. Passive host semantics (direct-hard vs soft, state code mapping)
//! 3. Reachability (DOWN vs UNREACHABLE) and propagation
//! 4. Scheduling policy (earlier-wins merge, forced, postponable)
//! 5. Service confirmation arcs and the host-route interaction
//! 6. Freshness and orphan recovery
//! 7. Dependency gating
//!
//! All scenarios run on a pinned clock and inject results directly, so no
//! worker processes are involved.

use std::sync::Arc;

use crossbeam_channel::Receiver;
use parking_lot::Mutex;

use crate::broker::{EngineHooks, NotificationReason};
use crate::checks::{CheckOptions, CheckResult, CheckType};
use crate::config::EngineConfig;
use crate::core::UnixTs;
use crate::core::errors::{FmError, Result};
use crate::engine::Engine;
use crate::objects::{
    Acknowledgement, DependencyKind, Host, HostId, HostState, ObjectArena, Service,
    ServiceDependency, ServiceId, ServiceState, StateMask, StateType,
};
use crate::scheduler::Disposition;
use crate::workers::{SpawnedWorker, WorkerEvent, WorkerPools, WorkerSpawner};

/// Monday 2026-01-05 12:00:00 UTC. Large enough that horizon arithmetic
/// never goes negative.
const NOON: UnixTs = 1_767_614_400;

// ──────────────────── harness ────────────────────

struct NullSpawner;

impl WorkerSpawner for NullSpawner {
    fn spawn(
        &mut self,
        _key: u32,
        _events: &crossbeam_channel::Sender<WorkerEvent>,
    ) -> Result<SpawnedWorker> {
        Err(FmError::WorkerSpawn {
            details: "no workers in the scenario matrix".to_string(),
        })
    }
}

/// Hooks implementation that records every notification as a string.
struct RecordingHooks {
    log: Arc<Mutex<Vec<String>>>,
}

impl EngineHooks for RecordingHooks {
    fn notify_host(&mut self, host: &Host, reason: NotificationReason) {
        self.log
            .lock()
            .push(format!("host:{}:{reason:?}", host.name));
    }

    fn notify_service(&mut self, service: &Service, host: &Host, reason: NotificationReason) {
        self.log
            .lock()
            .push(format!("svc:{}/{}:{reason:?}", host.name, service.description));
    }
}

fn engine_with(cfg: EngineConfig, arena: ObjectArena) -> (Engine, Receiver<WorkerEvent>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    let pools = WorkerPools::new(Box::new(NullSpawner), tx);
    let mut engine = Engine::new(cfg, arena, pools).unwrap();
    engine.set_fixed_time(NOON);
    engine.program_start = NOON - 86_400;
    (engine, rx)
}

fn recording(engine: &mut Engine) -> Arc<Mutex<Vec<String>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    engine.hooks = Box::new(RecordingHooks {
        log: Arc::clone(&log),
    });
    log
}

// ──────────────────── fixture builders ────────────────────

fn one_host(max_attempts: u32) -> (ObjectArena, HostId) {
    let mut arena = ObjectArena::new();
    let mut h = Host::new("web01");
    h.address = "10.0.0.1".to_string();
    h.max_attempts = max_attempts;
    let id = arena.add_host(h).unwrap();
    (arena, id)
}

fn host_and_service(max_attempts: u32) -> (ObjectArena, HostId, ServiceId) {
    let (mut arena, hid) = one_host(3);
    let mut s = Service::new(hid, "http");
    s.max_attempts = max_attempts;
    let sid = arena.add_service(s).unwrap();
    (arena, hid, sid)
}

fn active_result(rc: i32, output: &str, ts: UnixTs) -> CheckResult {
    let mut cr = CheckResult::new(CheckType::Active, CheckOptions::NONE);
    cr.scheduled = true;
    cr.return_code = rc;
    cr.output = output.to_string();
    cr.start_time = ts;
    cr.finish_time = ts;
    cr
}

// ════════════════════════════════════════════════════════════
// FAMILY 1: host soft/hard confirmation arcs
// ════════════════════════════════════════════════════════════

#[test]
fn host_problem_walks_soft_attempts_then_goes_hard() {
    let (arena, hid) = one_host(3);
    let mut cfg = EngineConfig::default();
    cfg.passive_host_checks_are_soft = true;
    let (mut eng, _rx) = engine_with(cfg, arena);
    let notifications = recording(&mut eng);

    // Passive-soft results walk the same attempt arc as active checks.
    eng.process_passive_host_result("web01", 1, "no route", NOON)
        .unwrap();
    {
        let h = eng.objects.host(hid);
        assert_eq!(h.current_state, HostState::Down);
        assert_eq!(h.rt.state_type, StateType::Soft);
        assert_eq!(h.rt.current_attempt, 1);
    }
    assert!(
        notifications.lock().is_empty(),
        "no notifications while soft"
    );

    eng.process_passive_host_result("web01", 1, "no route", NOON + 60)
        .unwrap();
    {
        let h = eng.objects.host(hid);
        assert_eq!(h.rt.state_type, StateType::Soft);
        assert_eq!(h.rt.current_attempt, 2);
    }

    eng.process_passive_host_result("web01", 1, "no route", NOON + 120)
        .unwrap();
    {
        let h = eng.objects.host(hid);
        assert_eq!(h.current_state, HostState::Down);
        assert_eq!(h.rt.state_type, StateType::Hard);
        assert_eq!(h.rt.current_attempt, 3);
    }
    assert_eq!(
        notifications.lock().as_slice(),
        ["host:web01:Normal"],
        "exactly one notification, on the hard transition"
    );
}

#[test]
fn host_recovery_resets_attempt_and_notification_counters() {
    let (arena, hid) = one_host(3);
    let mut cfg = EngineConfig::default();
    cfg.passive_host_checks_are_soft = true;
    let (mut eng, _rx) = engine_with(cfg, arena);

    for i in 0..3 {
        eng.process_passive_host_result("web01", 1, "down", NOON + i * 60)
            .unwrap();
    }
    assert_eq!(eng.objects.host(hid).rt.state_type, StateType::Hard);

    let notifications = recording(&mut eng);
    eng.process_passive_host_result("web01", 0, "back", NOON + 300)
        .unwrap();
    let h = eng.objects.host(hid);
    assert_eq!(h.current_state, HostState::Up);
    assert_eq!(h.rt.state_type, StateType::Hard);
    assert_eq!(h.rt.current_attempt, 1);
    assert_eq!(h.rt.current_notification_number, 0);
    assert_eq!(
        notifications.lock().as_slice(),
        ["host:web01:Normal"],
        "hard recovery notifies once"
    );
}

#[test]
fn host_event_and_problem_ids_track_the_problem_lifecycle() {
    let (arena, hid) = one_host(1);
    let (mut eng, _rx) = engine_with(EngineConfig::default(), arena);

    eng.process_passive_host_result("web01", 1, "down", NOON)
        .unwrap();
    let problem_id = eng.objects.host(hid).rt.current_problem_id;
    assert_ne!(problem_id, 0, "a fresh problem opens a problem id");

    eng.process_passive_host_result("web01", 0, "up", NOON + 60)
        .unwrap();
    let h = eng.objects.host(hid);
    assert_eq!(h.rt.current_problem_id, 0, "recovery closes the problem");
    assert_eq!(h.rt.last_problem_id, problem_id);
    assert_ne!(h.rt.current_event_id, 0);
}

#[test]
fn sticky_acknowledgement_survives_state_change_but_not_recovery() {
    let (arena, hid) = one_host(1);
    let (mut eng, _rx) = engine_with(EngineConfig::default(), arena);

    eng.process_passive_host_result("web01", 1, "down", NOON)
        .unwrap();
    eng.objects.host_mut(hid).rt.acknowledgement = Acknowledgement::Sticky;

    // DOWN -> UNREACHABLE is a state change; sticky survives it.
    eng.process_passive_host_result("web01", 2, "still dark", NOON + 60)
        .unwrap();
    assert_eq!(
        eng.objects.host(hid).rt.acknowledgement,
        Acknowledgement::Sticky
    );

    eng.process_passive_host_result("web01", 0, "up", NOON + 120)
        .unwrap();
    assert_eq!(
        eng.objects.host(hid).rt.acknowledgement,
        Acknowledgement::None
    );
}

// ════════════════════════════════════════════════════════════
// FAMILY 2: passive host semantics
// ════════════════════════════════════════════════════════════

#[test]
fn passive_host_results_are_hard_by_default() {
    let (arena, hid) = one_host(3);
    let (mut eng, _rx) = engine_with(EngineConfig::default(), arena);

    eng.process_passive_host_result("web01", 1, "down", NOON)
        .unwrap();
    let h = eng.objects.host(hid);
    assert_eq!(h.current_state, HostState::Down);
    assert_eq!(h.rt.state_type, StateType::Hard);
    assert_eq!(h.rt.current_attempt, 1);
}

#[test]
fn passive_host_codes_map_directly_to_states() {
    let (arena, hid) = one_host(1);
    let (mut eng, _rx) = engine_with(EngineConfig::default(), arena);

    eng.process_passive_host_result("web01", 2, "dark", NOON)
        .unwrap();
    assert_eq!(eng.objects.host(hid).current_state, HostState::Unreachable);

    eng.process_passive_host_result("web01", 0, "up", NOON + 60)
        .unwrap();
    assert_eq!(eng.objects.host(hid).current_state, HostState::Up);

    eng.process_passive_host_result("web01", 7, "weird", NOON + 120)
        .unwrap();
    assert_eq!(eng.objects.host(hid).current_state, HostState::Down);
}

#[test]
fn passive_results_rejected_when_disabled() {
    let (arena, _hid) = one_host(1);
    let mut cfg = EngineConfig::default();
    cfg.accept_passive_host_checks = false;
    let (mut eng, _rx) = engine_with(cfg, arena);

    let err = eng
        .process_passive_host_result("web01", 1, "down", NOON)
        .unwrap_err();
    assert_eq!(err.code(), "FM-2001");
}

#[test]
fn active_warning_counts_as_up_unless_aggressive() {
    let (arena, hid) = one_host(1);
    let (mut eng, _rx) = engine_with(EngineConfig::default(), arena);
    eng.handle_async_host_check_result(hid, active_result(1, "sluggish", NOON))
        .unwrap();
    assert_eq!(eng.objects.host(hid).current_state, HostState::Up);

    let (arena, hid) = one_host(1);
    let mut cfg = EngineConfig::default();
    cfg.use_aggressive_host_checking = true;
    let (mut eng, _rx) = engine_with(cfg, arena);
    eng.handle_async_host_check_result(hid, active_result(1, "sluggish", NOON))
        .unwrap();
    assert_eq!(eng.objects.host(hid).current_state, HostState::Down);
}

#[test]
fn broken_results_normalize_to_down_with_synthetic_output() {
    let (arena, hid) = one_host(1);
    let (mut eng, _rx) = engine_with(EngineConfig::default(), arena);

    let mut cr = active_result(0, "ignored", NOON);
    cr.exited_ok = false;
    eng.handle_async_host_check_result(hid, cr).unwrap();
    let h = eng.objects.host(hid);
    assert_eq!(h.current_state, HostState::Down);
    assert_eq!(h.rt.plugin_output, "(Host check did not exit properly)");

    let cr = active_result(42, "ignored", NOON + 60);
    eng.handle_async_host_check_result(hid, cr).unwrap();
    let h = eng.objects.host(hid);
    assert_eq!(h.current_state, HostState::Down);
    assert_eq!(h.rt.plugin_output, "(Return code of 42 is out of bounds)");
}

// ════════════════════════════════════════════════════════════
// FAMILY 3: reachability and propagation
// ════════════════════════════════════════════════════════════

fn gateway_and_children() -> (ObjectArena, HostId, HostId, HostId) {
    let mut arena = ObjectArena::new();
    let gw = arena.add_host(Host::new("gw")).unwrap();
    let a = arena.add_host(Host::new("web-a")).unwrap();
    let b = arena.add_host(Host::new("web-b")).unwrap();
    arena.link_host_parents(a, vec![gw]);
    arena.link_host_parents(b, vec![gw]);
    (arena, gw, a, b)
}

#[test]
fn reachability_distinguishes_down_from_unreachable() {
    let (arena, gw, a, _b) = gateway_and_children();
    let (mut eng, _rx) = engine_with(EngineConfig::default(), arena);

    // Parent up: a failed child is DOWN.
    eng.objects.host_mut(a).current_state = HostState::Down;
    assert_eq!(eng.determine_host_reachability(a), HostState::Down);

    // Parent down: the child is UNREACHABLE.
    eng.objects.host_mut(gw).current_state = HostState::Down;
    assert_eq!(eng.determine_host_reachability(a), HostState::Unreachable);

    // A root host can never be UNREACHABLE.
    assert_eq!(eng.determine_host_reachability(gw), HostState::Down);

    // An UP host is UP regardless of parents.
    eng.objects.host_mut(a).current_state = HostState::Up;
    assert_eq!(eng.determine_host_reachability(a), HostState::Up);
}

#[test]
fn child_failing_behind_dead_gateway_lands_unreachable() {
    let (arena, _gw, a, _b) = gateway_and_children();
    let (mut eng, _rx) = engine_with(EngineConfig::default(), arena);

    eng.process_passive_host_result("gw", 1, "gone", NOON).unwrap();
    eng.handle_async_host_check_result(a, active_result(2, "no answer", NOON + 5))
        .unwrap();
    assert_eq!(eng.objects.host(a).current_state, HostState::Unreachable);
}

#[test]
fn fresh_host_problem_propagates_checks_to_neighbors() {
    let (arena, gw, a, b) = gateway_and_children();
    let (mut eng, _rx) = engine_with(EngineConfig::default(), arena);

    eng.handle_async_host_check_result(gw, active_result(2, "gone", NOON))
        .unwrap();

    // Both children (not yet UNREACHABLE) get an immediate check queued so
    // the DOWN/UNREACHABLE verdicts settle.
    assert!(eng.objects.host(a).rt.next_check_event.is_some());
    assert!(eng.objects.host(b).rt.next_check_event.is_some());
    assert_eq!(eng.objects.host(a).rt.next_check, NOON);
}

// ════════════════════════════════════════════════════════════
// FAMILY 4: scheduling policy
// ════════════════════════════════════════════════════════════

#[test]
fn earlier_check_wins_the_schedule_merge() {
    let (arena, hid) = one_host(3);
    let (mut eng, _rx) = engine_with(EngineConfig::default(), arena);

    eng.schedule_next_host_check(hid, 100, CheckOptions::NONE);
    assert_eq!(eng.objects.host(hid).rt.next_check, NOON + 100);

    // Earlier replaces.
    eng.schedule_next_host_check(hid, 50, CheckOptions::NONE);
    assert_eq!(eng.objects.host(hid).rt.next_check, NOON + 50);
    assert_eq!(eng.queue.len(), 1, "the old event was destroyed");

    // Later is ignored.
    eng.schedule_next_host_check(hid, 200, CheckOptions::NONE);
    assert_eq!(eng.objects.host(hid).rt.next_check, NOON + 50);

    // Forced always wins.
    eng.schedule_next_host_check(hid, 200, CheckOptions::FORCE_EXECUTION);
    assert_eq!(eng.objects.host(hid).rt.next_check, NOON + 200);
    assert_eq!(eng.queue.len(), 1);
}

#[test]
fn postponable_service_reschedule_moves_the_check_later() {
    let (arena, _hid, sid) = host_and_service(3);
    let (mut eng, _rx) = engine_with(EngineConfig::default(), arena);

    eng.schedule_next_service_check(sid, 30, CheckOptions::NONE);
    assert_eq!(eng.objects.service(sid).rt.next_check, NOON + 30);

    // A plain later request is ignored...
    eng.schedule_next_service_check(sid, 300, CheckOptions::NONE);
    assert_eq!(eng.objects.service(sid).rt.next_check, NOON + 30);

    // ...but the retry cadence may postpone.
    eng.schedule_next_service_check(sid, 300, CheckOptions::ALLOW_POSTPONE);
    assert_eq!(eng.objects.service(sid).rt.next_check, NOON + 300);
}

#[test]
fn aborted_check_event_only_clears_the_handle() {
    let (arena, hid) = one_host(3);
    let (mut eng, _rx) = engine_with(EngineConfig::default(), arena);

    eng.schedule_next_host_check(hid, 60, CheckOptions::NONE);
    let handle = eng.objects.host(hid).rt.next_check_event.unwrap();
    eng.abort_event(handle);
    assert!(eng.objects.host(hid).rt.next_check_event.is_none());
    assert_eq!(eng.queue.len(), 0);
    assert!(!eng.objects.host(hid).rt.has_been_checked);
}

#[test]
fn parallel_cap_defers_service_to_the_retry_cadence() {
    let (arena, _hid, sid) = host_and_service(3);
    let mut cfg = EngineConfig::default();
    cfg.max_parallel_service_checks = 1;
    let (mut eng, _rx) = engine_with(cfg, arena);
    eng.running_service_checks = 1;

    eng.handle_service_check_event(sid, Disposition::Timed { latency_s: 0.0 });

    let s = eng.objects.service(sid);
    assert!(!s.rt.is_executing, "the check never started");
    // retry_interval_s (60) beats the pre-queued check_interval_s (300).
    assert_eq!(s.rt.next_check, NOON + 60);
}

// ════════════════════════════════════════════════════════════
// FAMILY 5: service arcs and the host route
// ════════════════════════════════════════════════════════════

/// Mark the host recently verified UP so service problem handling takes the
/// cached-host path instead of queueing on-demand host checks.
fn settle_host_up(eng: &mut Engine, hid: HostId) {
    let h = eng.objects.host_mut(hid);
    h.rt.has_been_checked = true;
    h.rt.last_check = NOON - 1;
}

#[test]
fn service_problem_walks_soft_attempts_then_goes_hard() {
    let (arena, hid, sid) = host_and_service(3);
    let (mut eng, _rx) = engine_with(EngineConfig::default(), arena);
    settle_host_up(&mut eng, hid);
    let notifications = recording(&mut eng);

    eng.handle_async_service_check_result(sid, active_result(1, "slow", NOON))
        .unwrap();
    {
        let s = eng.objects.service(sid);
        assert_eq!(s.current_state, ServiceState::Warning);
        assert_eq!(s.rt.state_type, StateType::Soft);
        assert_eq!(s.rt.current_attempt, 1);
    }
    assert!(notifications.lock().is_empty());

    eng.handle_async_service_check_result(sid, active_result(1, "slow", NOON + 60))
        .unwrap();
    {
        let s = eng.objects.service(sid);
        assert_eq!(s.rt.state_type, StateType::Soft);
        assert_eq!(s.rt.current_attempt, 2);
    }

    eng.handle_async_service_check_result(sid, active_result(1, "slow", NOON + 120))
        .unwrap();
    {
        let s = eng.objects.service(sid);
        assert_eq!(s.rt.state_type, StateType::Hard);
        assert_eq!(s.rt.current_attempt, 3);
        assert_eq!(s.last_hard_state, ServiceState::Warning);
    }
    assert_eq!(notifications.lock().as_slice(), ["svc:web01/http:Normal"]);
}

#[test]
fn service_hard_recovery_resets_everything() {
    let (arena, hid, sid) = host_and_service(3);
    let (mut eng, _rx) = engine_with(EngineConfig::default(), arena);
    settle_host_up(&mut eng, hid);

    for i in 0..3 {
        eng.handle_async_service_check_result(sid, active_result(2, "bad", NOON + i * 60))
            .unwrap();
    }
    assert_eq!(eng.objects.service(sid).rt.state_type, StateType::Hard);

    let notifications = recording(&mut eng);
    settle_host_up(&mut eng, hid);
    eng.handle_async_service_check_result(sid, active_result(0, "good", NOON + 300))
        .unwrap();
    let s = eng.objects.service(sid);
    assert_eq!(s.current_state, ServiceState::Ok);
    assert_eq!(s.rt.state_type, StateType::Hard);
    assert_eq!(s.rt.current_attempt, 1);
    assert_eq!(s.last_hard_state, ServiceState::Ok);
    assert_eq!(s.rt.current_notification_number, 0);
    assert_eq!(notifications.lock().as_slice(), ["svc:web01/http:Normal"]);
}

#[test]
fn soft_recovery_does_not_notify() {
    let (arena, hid, sid) = host_and_service(3);
    let (mut eng, _rx) = engine_with(EngineConfig::default(), arena);
    settle_host_up(&mut eng, hid);
    let notifications = recording(&mut eng);

    eng.handle_async_service_check_result(sid, active_result(2, "bad", NOON))
        .unwrap();
    eng.handle_async_service_check_result(sid, active_result(0, "good", NOON + 60))
        .unwrap();

    let s = eng.objects.service(sid);
    assert_eq!(s.current_state, ServiceState::Ok);
    assert_eq!(s.rt.current_attempt, 1);
    assert!(
        notifications.lock().is_empty(),
        "a soft problem that recovers never notifies"
    );
}

#[test]
fn service_on_down_host_goes_hard_immediately_without_notifying() {
    let (arena, hid, sid) = host_and_service(3);
    let (mut eng, _rx) = engine_with(EngineConfig::default(), arena);
    let notifications = recording(&mut eng);

    // Host already confirmed down.
    {
        let h = eng.objects.host_mut(hid);
        h.current_state = HostState::Down;
        h.last_hard_state = HostState::Down;
        h.rt.has_been_checked = true;
        h.rt.last_check = NOON - 1;
    }

    eng.handle_async_service_check_result(sid, active_result(2, "no conn", NOON))
        .unwrap();
    let s = eng.objects.service(sid);
    assert_eq!(s.current_state, ServiceState::Critical);
    assert_eq!(s.rt.state_type, StateType::Hard, "no retries on a dead route");
    assert_eq!(s.last_hard_state, ServiceState::Critical);
    assert!(s.host_problem_at_last_check);
    assert_eq!(s.rt.current_attempt, 1);
    assert!(
        !notifications
            .lock()
            .iter()
            .any(|n| n.starts_with("svc:")),
        "the host is the problem; the service stays quiet"
    );
}

#[test]
fn service_recovery_after_host_problem_is_a_hard_recovery() {
    let (arena, hid, sid) = host_and_service(3);
    let (mut eng, _rx) = engine_with(EngineConfig::default(), arena);
    {
        let h = eng.objects.host_mut(hid);
        h.current_state = HostState::Down;
        h.last_hard_state = HostState::Down;
        h.rt.has_been_checked = true;
        h.rt.last_check = NOON - 1;
    }
    eng.handle_async_service_check_result(sid, active_result(2, "no conn", NOON))
        .unwrap();
    assert!(eng.objects.service(sid).host_problem_at_last_check);

    // Host comes back; the next OK is a hard recovery even though the
    // attempt counter never reached max_attempts.
    {
        let h = eng.objects.host_mut(hid);
        h.current_state = HostState::Up;
        h.last_hard_state = HostState::Up;
        h.rt.last_check = NOON + 59;
    }
    let notifications = recording(&mut eng);
    eng.handle_async_service_check_result(sid, active_result(0, "good", NOON + 60))
        .unwrap();
    let s = eng.objects.service(sid);
    assert_eq!(s.current_state, ServiceState::Ok);
    assert_eq!(s.rt.state_type, StateType::Hard);
    assert!(!s.host_problem_at_last_check);
    assert_eq!(notifications.lock().as_slice(), ["svc:web01/http:Normal"]);
}

#[test]
fn first_ok_service_result_initiates_a_host_check() {
    let (arena, hid, sid) = host_and_service(3);
    let (mut eng, _rx) = engine_with(EngineConfig::default(), arena);

    assert!(!eng.objects.host(hid).rt.has_been_checked);
    eng.handle_async_service_check_result(sid, active_result(0, "good", NOON))
        .unwrap();

    let h = eng.objects.host(hid);
    assert!(h.rt.next_check_event.is_some());
    assert_eq!(h.rt.next_check, NOON);
    assert!(h.rt.check_options.contains(CheckOptions::DEPENDENCY_CHECK));
}

#[test]
fn service_timeout_maps_to_the_configured_state() {
    let (arena, hid, sid) = host_and_service(1);
    let mut cfg = EngineConfig::default();
    cfg.service_check_timeout_state = ServiceState::Unknown;
    let (mut eng, _rx) = engine_with(cfg, arena);
    settle_host_up(&mut eng, hid);

    let mut cr = active_result(0, "ignored", NOON);
    cr.early_timeout = true;
    cr.finish_time = NOON + 60;
    eng.handle_async_service_check_result(sid, cr).unwrap();

    let s = eng.objects.service(sid);
    assert_eq!(s.current_state, ServiceState::Unknown);
    assert!(
        s.rt.plugin_output.starts_with("(Service check timed out after"),
        "got: {}",
        s.rt.plugin_output
    );
}

#[test]
fn empty_service_output_gets_the_placeholder() {
    let (arena, hid, sid) = host_and_service(1);
    let (mut eng, _rx) = engine_with(EngineConfig::default(), arena);
    settle_host_up(&mut eng, hid);

    eng.handle_async_service_check_result(sid, active_result(0, "", NOON))
        .unwrap();
    assert_eq!(
        eng.objects.service(sid).rt.plugin_output,
        "(No output returned from plugin)"
    );
}

#[test]
fn a_processed_service_always_has_a_next_check() {
    let (arena, hid, sid) = host_and_service(1);
    let (mut eng, _rx) = engine_with(EngineConfig::default(), arena);
    settle_host_up(&mut eng, hid);

    assert!(eng.objects.service(sid).rt.next_check_event.is_none());
    eng.handle_async_service_check_result(sid, active_result(0, "good", NOON))
        .unwrap();

    let s = eng.objects.service(sid);
    assert!(s.rt.next_check_event.is_some());
    assert_eq!(s.rt.next_check, NOON + 300);
}

#[test]
fn last_time_stamps_follow_the_previous_state() {
    let (arena, hid, sid) = host_and_service(1);
    let (mut eng, _rx) = engine_with(EngineConfig::default(), arena);
    settle_host_up(&mut eng, hid);

    eng.handle_async_service_check_result(sid, active_result(2, "bad", NOON))
        .unwrap();
    // The service entered this result OK, so the OK stamp moves.
    assert_eq!(eng.objects.service(sid).last_time_ok, NOON);

    settle_host_up(&mut eng, hid);
    eng.handle_async_service_check_result(sid, active_result(0, "good", NOON + 60))
        .unwrap();
    assert_eq!(eng.objects.service(sid).last_time_critical, NOON + 60);
}

// ════════════════════════════════════════════════════════════
// FAMILY 6: freshness and orphan recovery
// ════════════════════════════════════════════════════════════

#[test]
fn freshness_race_discards_the_late_forced_result() {
    let (arena, hid) = one_host(3);
    let (mut eng, _rx) = engine_with(EngineConfig::default(), arena);
    {
        let h = eng.objects.host_mut(hid);
        h.check_freshness = true;
        h.freshness_threshold_s = 3600;
        h.rt.has_been_checked = true;
        h.rt.last_check = NOON - 10; // fresh again: a passive result landed
        h.rt.is_being_freshened = true;
        h.rt.is_executing = true;
    }

    let mut cr = active_result(2, "stale probe", NOON);
    cr.options = CheckOptions::FORCE_EXECUTION | CheckOptions::FRESHNESS_CHECK;
    eng.handle_async_host_check_result(hid, cr).unwrap();

    let h = eng.objects.host(hid);
    assert_eq!(h.current_state, HostState::Up, "late result discarded");
    assert!(!h.rt.is_being_freshened);
    assert!(!h.rt.is_executing);
    assert_eq!(h.rt.plugin_output, "", "no bookkeeping from the discard");
}

#[test]
fn stale_host_gets_a_forced_freshness_check() {
    let (arena, hid) = one_host(3);
    let (mut eng, _rx) = engine_with(EngineConfig::default(), arena);
    {
        let h = eng.objects.host_mut(hid);
        h.check_freshness = true;
        h.freshness_threshold_s = 60;
        h.rt.has_been_checked = true;
        h.rt.last_check = NOON - 120;
    }

    eng.check_host_freshness();

    let h = eng.objects.host(hid);
    assert!(h.rt.is_being_freshened);
    assert!(h.rt.next_check_event.is_some());
    assert!(h.rt.check_options.contains(CheckOptions::FORCE_EXECUTION));
    assert!(h.rt.check_options.contains(CheckOptions::FRESHNESS_CHECK));
}

#[test]
fn never_checked_object_measures_freshness_from_engine_start() {
    let (arena, hid) = one_host(3);
    let (mut eng, _rx) = engine_with(EngineConfig::default(), arena);
    eng.objects.host_mut(hid).check_freshness = true;
    eng.objects.host_mut(hid).freshness_threshold_s = 3600;

    // Engine started a day ago; a never-checked host with a one-hour
    // threshold is stale.
    assert!(!eng.is_host_result_fresh(hid, NOON, false));

    // With a recent start it is still within its window.
    eng.program_start = NOON - 60;
    assert!(eng.is_host_result_fresh(hid, NOON, false));
}

#[test]
fn orphaned_host_check_is_recovered_and_requeued() {
    let (arena, hid) = one_host(3);
    let (mut eng, _rx) = engine_with(EngineConfig::default(), arena);
    {
        let h = eng.objects.host_mut(hid);
        h.rt.is_executing = true;
        h.rt.next_check = NOON - 2000;
    }
    eng.running_host_checks = 1;

    eng.check_orphaned_hosts();

    let h = eng.objects.host(hid);
    assert!(!h.rt.is_executing);
    assert_eq!(eng.running_host_checks, 0);
    assert!(h.rt.next_check_event.is_some());
    assert!(h.rt.check_options.contains(CheckOptions::ORPHAN_CHECK));
}

#[test]
fn recent_in_flight_check_is_not_an_orphan() {
    let (arena, hid) = one_host(3);
    let (mut eng, _rx) = engine_with(EngineConfig::default(), arena);
    {
        let h = eng.objects.host_mut(hid);
        h.rt.is_executing = true;
        h.rt.next_check = NOON - 30; // still inside timeout + slack
    }
    eng.running_host_checks = 1;

    eng.check_orphaned_hosts();

    assert!(eng.objects.host(hid).rt.is_executing);
    assert_eq!(eng.running_host_checks, 1);
}

#[test]
fn freshness_sweep_skips_services_with_no_derivable_window() {
    let (arena, _hid, sid) = host_and_service(3);
    let (mut eng, _rx) = engine_with(EngineConfig::default(), arena);
    {
        let s = eng.objects.service_mut(sid);
        s.check_freshness = true;
        s.check_interval_s = 0;
        s.retry_interval_s = 0;
        s.freshness_threshold_s = 0;
    }

    eng.check_service_freshness();
    assert!(!eng.objects.service(sid).rt.is_being_freshened);
}

#[test]
fn stale_service_gets_a_forced_freshness_check() {
    let (arena, _hid, sid) = host_and_service(3);
    let (mut eng, _rx) = engine_with(EngineConfig::default(), arena);
    {
        let s = eng.objects.service_mut(sid);
        s.check_freshness = true;
        s.freshness_threshold_s = 60;
        s.rt.has_been_checked = true;
        s.rt.last_check = NOON - 120;
    }

    eng.check_service_freshness();

    let s = eng.objects.service(sid);
    assert!(s.rt.is_being_freshened);
    assert!(s.rt.check_options.contains(CheckOptions::FORCE_EXECUTION));
    assert!(s.rt.check_options.contains(CheckOptions::FRESHNESS_CHECK));
}

// ════════════════════════════════════════════════════════════
// FAMILY 7: dependency gating
// ════════════════════════════════════════════════════════════

fn service_pair_with_dependency(
    failure_states: &[&str],
) -> (ObjectArena, ServiceId, ServiceId) {
    let mut arena = ObjectArena::new();
    let hid = arena.add_host(Host::new("db01")).unwrap();
    let master = arena.add_service(Service::new(hid, "postgres")).unwrap();
    let dependent = arena.add_service(Service::new(hid, "app")).unwrap();
    let tokens: Vec<String> = failure_states.iter().map(ToString::to_string).collect();
    arena.add_service_dependency(ServiceDependency {
        dependent,
        master,
        kind: DependencyKind::Execution,
        failure_mask: StateMask::parse(&tokens).unwrap(),
        inherits_parent: false,
        period: None,
    });
    (arena, master, dependent)
}

#[test]
fn failed_master_blocks_the_dependent() {
    let (arena, master, dependent) = service_pair_with_dependency(&["critical"]);
    let (mut eng, _rx) = engine_with(EngineConfig::default(), arena);

    assert!(eng.service_dependencies_ok(dependent, DependencyKind::Execution));

    {
        let m = eng.objects.service_mut(master);
        m.current_state = ServiceState::Critical;
        m.last_hard_state = ServiceState::Critical;
        m.rt.has_been_checked = true;
    }
    assert!(!eng.service_dependencies_ok(dependent, DependencyKind::Execution));
}

#[test]
fn soft_master_state_is_invisible_unless_configured() {
    let (arena, master, dependent) = service_pair_with_dependency(&["critical"]);
    let (mut eng, _rx) = engine_with(EngineConfig::default(), arena);
    {
        let m = eng.objects.service_mut(master);
        m.current_state = ServiceState::Critical;
        m.rt.state_type = StateType::Soft;
        m.last_hard_state = ServiceState::Ok; // hard history still clean
        m.rt.has_been_checked = true;
    }
    // Default: dependencies judge the last hard state.
    assert!(eng.service_dependencies_ok(dependent, DependencyKind::Execution));

    eng.config.soft_state_dependencies = true;
    assert!(!eng.service_dependencies_ok(dependent, DependencyKind::Execution));
}

#[test]
fn pending_master_blocks_only_when_masked() {
    let (arena, _master, dependent) = service_pair_with_dependency(&["pending"]);
    let (eng, _rx) = engine_with(EngineConfig::default(), arena);
    // Master never checked and the mask names pending.
    assert!(!eng.service_dependencies_ok(dependent, DependencyKind::Execution));

    let (arena, _master, dependent) = service_pair_with_dependency(&["critical"]);
    let (eng, _rx) = engine_with(EngineConfig::default(), arena);
    assert!(eng.service_dependencies_ok(dependent, DependencyKind::Execution));
}
