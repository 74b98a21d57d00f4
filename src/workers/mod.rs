//! Worker dispatch: pools of out-of-process check runners, job tables, and
//! reply correlation.
//!
//! A default pool takes everything; specialized pools claim commands by name
//! (the first whitespace-delimited token of the command line, matched with
//! and without its directory prefix). Submission round-robins one full lap
//! from the last-used worker; a pool with no spare capacity rejects the job
//! and the caller reschedules. Worker death is an explicit `Disconnected`
//! message from the reader thread — outstanding jobs are resubmitted as new
//! jobs and a replacement is spawned while the pool is below its desired
//! size.

pub mod protocol;
#[cfg(unix)]
pub mod runner;

use std::collections::HashMap;
use std::io::{BufReader, Read};
use std::process::{Child, ChildStdin, Command, Stdio};

use crossbeam_channel::Sender;

use crate::checks::CheckResult;
use crate::core::errors::{FmError, Result};
use crate::objects::{HostId, ServiceId};
use protocol::{JobSpec, KvFrame, Registration};

/// Engine-side identity of a worker process.
pub type WorkerKey = u32;

/// What the reader threads feed into the event loop.
#[derive(Debug)]
pub enum WorkerEvent {
    /// A complete frame arrived from a worker.
    Frame {
        /// Originating worker.
        worker: WorkerKey,
        /// The decoded frame.
        frame: KvFrame,
    },
    /// The worker's pipe closed (clean EOF or read error).
    Disconnected {
        /// The worker that went away.
        worker: WorkerKey,
    },
}

/// Where a finished job's result must be delivered.
#[derive(Debug)]
pub enum JobCallback {
    /// Complete `result` and run it through the host state machine.
    Host {
        /// Target host.
        host: HostId,
        /// Partially filled result (options, latency, scheduled flag).
        result: CheckResult,
    },
    /// Complete `result` and run it through the service state machine.
    Service {
        /// Target service.
        service: ServiceId,
        /// Partially filled result (options, latency, scheduled flag).
        result: CheckResult,
    },
}

/// An outstanding job on one worker.
#[derive(Debug)]
pub struct Job {
    /// Worker-scoped id.
    pub id: u32,
    /// Command line the worker is running.
    pub command: String,
    /// Deadline handed to the worker.
    pub timeout_s: u64,
    /// Result destination.
    pub callback: JobCallback,
}

/// Engine-to-worker byte channel.
pub trait WorkerTransport: Send {
    /// Send one frame.
    fn send(&mut self, frame: &KvFrame) -> std::io::Result<()>;

    /// Tear the worker down (used on engine shutdown).
    fn shutdown(&mut self) {}
}

/// Everything `spawn` must hand back for a usable worker.
pub struct SpawnedWorker {
    /// Worker name for logs.
    pub name: String,
    /// Worker pid (0 when not a real process).
    pub pid: u32,
    /// Concurrent job capacity.
    pub max_jobs: usize,
    /// Channel for job frames.
    pub transport: Box<dyn WorkerTransport>,
}

/// Creates worker processes (or test doubles) on demand.
pub trait WorkerSpawner: Send {
    /// Spawn one worker; its frames must arrive on `events` tagged with
    /// `key`.
    fn spawn(&mut self, key: WorkerKey, events: &Sender<WorkerEvent>) -> Result<SpawnedWorker>;
}

/// One live worker and its job table.
pub struct Worker {
    key: WorkerKey,
    name: String,
    pid: u32,
    max_jobs: usize,
    next_job_id: u32,
    jobs: HashMap<u32, Job>,
    jobs_started: u64,
    transport: Box<dyn WorkerTransport>,
}

impl Worker {
    fn new(key: WorkerKey, spawned: SpawnedWorker) -> Self {
        Self {
            key,
            name: spawned.name,
            pid: spawned.pid,
            max_jobs: spawned.max_jobs,
            next_job_id: 0,
            jobs: HashMap::new(),
            jobs_started: 0,
            transport: spawned.transport,
        }
    }

    /// Worker name for logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Jobs currently outstanding.
    #[must_use]
    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    fn has_capacity(&self) -> bool {
        self.max_jobs == 0 || self.jobs.len() < self.max_jobs
    }

    fn submit(&mut self, command: &str, timeout_s: u64, callback: JobCallback) -> Result<u32> {
        self.next_job_id = self.next_job_id.wrapping_add(1);
        let id = self.next_job_id;
        let spec = JobSpec {
            job_id: id,
            command: command.to_string(),
            timeout_s,
        };
        self.transport
            .send(&spec.to_frame())
            .map_err(|e| FmError::WorkerDispatch {
                worker: self.name.clone(),
                details: e.to_string(),
            })?;
        self.jobs.insert(
            id,
            Job {
                id,
                command: command.to_string(),
                timeout_s,
                callback,
            },
        );
        self.jobs_started += 1;
        Ok(id)
    }
}

/// A set of interchangeable workers serving one command class.
pub struct WorkerPool {
    name: String,
    desired: usize,
    workers: Vec<Worker>,
    last_used: usize,
}

impl WorkerPool {
    fn new(name: String, desired: usize) -> Self {
        Self {
            name,
            desired,
            workers: Vec::new(),
            last_used: 0,
        }
    }

    /// Live worker count.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// One-lap round-robin scan from the slot after the last-used worker.
    fn pick(&mut self) -> Option<usize> {
        let n = self.workers.len();
        if n == 0 {
            return None;
        }
        for lap in 1..=n {
            let idx = (self.last_used + lap) % n;
            if self.workers[idx].has_capacity() {
                self.last_used = idx;
                return Some(idx);
            }
        }
        None
    }

    fn submit(
        &mut self,
        command: &str,
        timeout_s: u64,
        callback: JobCallback,
    ) -> Result<(WorkerKey, u32)> {
        let Some(idx) = self.pick() else {
            return Err(FmError::WorkerPoolSaturated {
                pool: self.name.clone(),
            });
        };
        let worker = &mut self.workers[idx];
        let key = worker.key;
        let id = worker.submit(command, timeout_s, callback)?;
        Ok((key, id))
    }
}

/// All pools plus the spawner that refills them.
pub struct WorkerPools {
    default_pool: WorkerPool,
    specialized: Vec<(String, WorkerPool)>,
    spawner: Box<dyn WorkerSpawner>,
    events_tx: Sender<WorkerEvent>,
    next_key: WorkerKey,
}

impl WorkerPools {
    /// Pool set with no workers yet; call [`Self::spawn_default`] and
    /// [`Self::add_specialized`] to populate it.
    #[must_use]
    pub fn new(spawner: Box<dyn WorkerSpawner>, events_tx: Sender<WorkerEvent>) -> Self {
        Self {
            default_pool: WorkerPool::new("default".to_string(), 0),
            specialized: Vec::new(),
            spawner,
            events_tx,
            next_key: 0,
        }
    }

    /// Total live workers across all pools.
    #[must_use]
    pub fn total_workers(&self) -> usize {
        self.default_pool.worker_count()
            + self
                .specialized
                .iter()
                .map(|(_, p)| p.worker_count())
                .sum::<usize>()
    }

    /// Workers in the default pool.
    #[must_use]
    pub fn default_pool_size(&self) -> usize {
        self.default_pool.worker_count()
    }

    fn spawn_into(
        spawner: &mut dyn WorkerSpawner,
        events_tx: &Sender<WorkerEvent>,
        next_key: &mut WorkerKey,
        pool: &mut WorkerPool,
    ) -> Result<()> {
        let key = *next_key;
        *next_key = next_key.wrapping_add(1);
        let spawned = spawner.spawn(key, events_tx)?;
        tracing::debug!(pool = %pool.name, worker = %spawned.name, "worker spawned");
        pool.workers.push(Worker::new(key, spawned));
        Ok(())
    }

    /// Bring the default pool up to `count` workers.
    pub fn spawn_default(&mut self, count: usize) -> Result<()> {
        self.default_pool.desired = count;
        while self.default_pool.worker_count() < count {
            Self::spawn_into(
                self.spawner.as_mut(),
                &self.events_tx,
                &mut self.next_key,
                &mut self.default_pool,
            )?;
        }
        Ok(())
    }

    /// Create a specialized pool claiming `command_name`.
    pub fn add_specialized(&mut self, command_name: &str, count: usize) -> Result<()> {
        let mut pool = WorkerPool::new(format!("cmd:{command_name}"), count);
        while pool.worker_count() < count {
            Self::spawn_into(
                self.spawner.as_mut(),
                &self.events_tx,
                &mut self.next_key,
                &mut pool,
            )?;
        }
        self.specialized.push((command_name.to_string(), pool));
        Ok(())
    }

    /// The pool responsible for `command`: a specialized pool whose name
    /// matches the command's first token (with or without its directory
    /// prefix), else the default pool.
    fn pool_for_command(&mut self, command: &str) -> &mut WorkerPool {
        let token = command.split_whitespace().next().unwrap_or_default();
        let basename = token.rsplit('/').next().unwrap_or(token);
        let idx = self
            .specialized
            .iter()
            .position(|(name, _)| name == token || name == basename);
        match idx {
            Some(i) => &mut self.specialized[i].1,
            None => &mut self.default_pool,
        }
    }

    /// Submit a job to the responsible pool.
    pub fn run_job(
        &mut self,
        command: &str,
        timeout_s: u64,
        callback: JobCallback,
    ) -> Result<(WorkerKey, u32)> {
        self.pool_for_command(command)
            .submit(command, timeout_s, callback)
    }

    fn find_worker_mut(&mut self, key: WorkerKey) -> Option<&mut Worker> {
        if let Some(w) = self.default_pool.workers.iter_mut().find(|w| w.key == key) {
            return Some(w);
        }
        self.specialized
            .iter_mut()
            .flat_map(|(_, p)| p.workers.iter_mut())
            .find(|w| w.key == key)
    }

    /// Remove and return the job `(worker, job_id)` addresses, if it exists.
    pub fn take_job(&mut self, worker: WorkerKey, job_id: u32) -> Option<Job> {
        self.find_worker_mut(worker)?.jobs.remove(&job_id)
    }

    /// Apply a worker's registration frame (authoritative capacity/name).
    pub fn apply_registration(&mut self, worker: WorkerKey, reg: &Registration) {
        if let Some(w) = self.find_worker_mut(worker) {
            tracing::debug!(worker = %reg.name, pid = reg.pid, max_jobs = reg.max_jobs, "worker registered");
            w.name = reg.name.clone();
            w.pid = reg.pid;
            w.max_jobs = reg.max_jobs;
        }
    }

    /// Handle a worker disconnect: drop the worker, respawn while the pool
    /// is under strength, and return its orphaned jobs for resubmission.
    pub fn handle_disconnect(&mut self, worker: WorkerKey) -> Vec<Job> {
        let Some((pool, pos)) = self.locate(worker) else {
            return Vec::new();
        };
        let dead = {
            let pool_ref = self.pool_mut(pool);
            let dead = pool_ref.workers.remove(pos);
            if pool_ref.last_used >= pool_ref.workers.len() {
                pool_ref.last_used = 0;
            }
            dead
        };
        tracing::warn!(
            worker = %dead.name,
            pid = dead.pid,
            orphaned_jobs = dead.jobs.len(),
            jobs_started = dead.jobs_started,
            "worker disconnected"
        );

        loop {
            let (current, desired) = {
                let p = self.pool_mut(pool);
                (p.workers.len(), p.desired)
            };
            if current >= desired {
                break;
            }
            let outcome = {
                let Self {
                    spawner,
                    events_tx,
                    next_key,
                    default_pool,
                    specialized,
                    ..
                } = self;
                let p = match pool {
                    PoolRef::Default => default_pool,
                    PoolRef::Specialized(i) => &mut specialized[i].1,
                };
                Self::spawn_into(spawner.as_mut(), events_tx, next_key, p)
            };
            if let Err(e) = outcome {
                tracing::error!(error = %e, "failed to respawn worker");
                break;
            }
        }
        if self.pool_mut(pool).workers.is_empty() {
            tracing::error!(pool = %self.pool_mut(pool).name, "worker pool exhausted");
        }

        dead.jobs.into_values().collect()
    }

    fn locate(&self, worker: WorkerKey) -> Option<(PoolRef, usize)> {
        if let Some(pos) = self
            .default_pool
            .workers
            .iter()
            .position(|w| w.key == worker)
        {
            return Some((PoolRef::Default, pos));
        }
        for (i, (_, p)) in self.specialized.iter().enumerate() {
            if let Some(pos) = p.workers.iter().position(|w| w.key == worker) {
                return Some((PoolRef::Specialized(i), pos));
            }
        }
        None
    }

    fn pool_mut(&mut self, r: PoolRef) -> &mut WorkerPool {
        match r {
            PoolRef::Default => &mut self.default_pool,
            PoolRef::Specialized(i) => &mut self.specialized[i].1,
        }
    }

    /// Tear all workers down.
    pub fn shutdown(&mut self) {
        for w in self
            .default_pool
            .workers
            .iter_mut()
            .chain(self.specialized.iter_mut().flat_map(|(_, p)| p.workers.iter_mut()))
        {
            w.transport.shutdown();
        }
    }
}

#[derive(Clone, Copy)]
enum PoolRef {
    Default,
    Specialized(usize),
}

// ---------------------------------------------------------------------------
// Process-backed spawner
// ---------------------------------------------------------------------------

/// Spawns real worker processes by re-executing the current binary in
/// `worker` mode.
pub struct ProcessSpawner {
    /// Concurrent job capacity passed to each worker.
    pub max_jobs: usize,
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&mut self, key: WorkerKey, events: &Sender<WorkerEvent>) -> Result<SpawnedWorker> {
        let exe = std::env::current_exe().map_err(|e| FmError::WorkerSpawn {
            details: format!("cannot locate own binary: {e}"),
        })?;
        let mut child = Command::new(exe)
            .arg("worker")
            .arg("--max-jobs")
            .arg(self.max_jobs.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| FmError::WorkerSpawn {
                details: e.to_string(),
            })?;
        let stdin = child.stdin.take().ok_or_else(|| FmError::WorkerSpawn {
            details: "worker stdin not captured".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| FmError::WorkerSpawn {
            details: "worker stdout not captured".to_string(),
        })?;
        let pid = child.id();

        spawn_reader(key, stdout, events.clone())?;

        Ok(SpawnedWorker {
            name: format!("core-worker-{pid}"),
            pid,
            max_jobs: self.max_jobs,
            transport: Box::new(ChildTransport {
                stdin: Some(stdin),
                child,
            }),
        })
    }
}

fn spawn_reader<R: Read + Send + 'static>(
    key: WorkerKey,
    reader: R,
    tx: Sender<WorkerEvent>,
) -> Result<()> {
    std::thread::Builder::new()
        .name(format!("worker-io-{key}"))
        .spawn(move || {
            let mut r = BufReader::new(reader);
            loop {
                match KvFrame::read_from(&mut r) {
                    Ok(Some(frame)) => {
                        if tx.send(WorkerEvent::Frame { worker: key, frame }).is_err() {
                            return;
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
            let _ = tx.send(WorkerEvent::Disconnected { worker: key });
        })
        .map_err(|e| FmError::WorkerSpawn {
            details: format!("reader thread: {e}"),
        })?;
    Ok(())
}

struct ChildTransport {
    stdin: Option<ChildStdin>,
    child: Child,
}

impl WorkerTransport for ChildTransport {
    fn send(&mut self, frame: &KvFrame) -> std::io::Result<()> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "worker stdin closed",
            ));
        };
        frame.write_to(stdin)
    }

    fn shutdown(&mut self) {
        // Closing stdin lets the worker drain and exit; kill as a backstop.
        self.stdin = None;
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
