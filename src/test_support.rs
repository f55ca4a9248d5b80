//! In-memory stand-ins for the external collaborators, shared by unit tests.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

use crate::controller::execution::{ExecutionBackend, SyncOutcome};
use crate::controller::providers::{
    AssignedMachine, MachineActionResult, MachineState, MachineStatus, ProviderError,
    SandboxProvider,
};
use crate::events::{EventPublisher, FleetEvent};
use crate::queue::{QueueBackend, QueueJob, QueueStats};
use crate::shared::clock::Clock;
use crate::shared::models::{
    DatabaseError, ExecutionResult, HealthStatus, MachineType, NewSandbox, Sandbox, SandboxStatus,
    SandboxUpdate, Task, TaskStatus,
};
use crate::shared::repository::{SandboxRepository, StuckCursor, TaskRepository};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// An active, idle sandbox with no addresses or backing instance.
pub fn sandbox(machine_type: MachineType) -> Sandbox {
    let now = Utc::now();
    Sandbox {
        id: Uuid::new_v4(),
        name: "sbx-test".to_string(),
        environment: "dev".to_string(),
        machine_type: Some(machine_type),
        instance_id: None,
        public_ip: None,
        private_ip: None,
        session_handle: None,
        status: SandboxStatus::Active,
        health_status: HealthStatus::Healthy,
        last_health_check: None,
        capacity: 1,
        current_load: 0,
        auto_stop_enabled: true,
        idle_minutes_before_stop: 30,
        backing_state: None,
        created_at: now,
        updated_at: now,
    }
}

pub fn task(status: TaskStatus) -> Task {
    let id = Uuid::new_v4();
    Task {
        id,
        user_id: format!("user-{}", &id.simple().to_string()[..6]),
        status,
        execution_ref: None,
        updated_at: Utc::now(),
    }
}

#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<(String, FleetEvent)>>,
    fail: bool,
}

impl RecordingPublisher {
    pub fn failing() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn events(&self) -> Vec<(String, FleetEvent)> {
        lock(&self.events).clone()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, user_id: &str, event: FleetEvent) -> Result<()> {
        if self.fail {
            return Err(anyhow!("event bus unreachable"));
        }
        lock(&self.events).push((user_id.to_string(), event));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeQueueBackend {
    jobs: Mutex<Vec<(String, String, String)>>,
    down: bool,
    delay: Option<Duration>,
}

impl FakeQueueBackend {
    pub fn down() -> Self {
        Self {
            down: true,
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn pushed_queues(&self) -> Vec<String> {
        lock(&self.jobs).iter().map(|(_, q, _)| q.clone()).collect()
    }

    async fn ready(&self) -> Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.down {
            return Err(anyhow!("connection refused"));
        }
        Ok(())
    }
}

#[async_trait]
impl QueueBackend for FakeQueueBackend {
    async fn push(&self, queue_name: &str, _job: &QueueJob) -> Result<String> {
        self.ready().await?;
        let id = Uuid::new_v4().to_string();
        lock(&self.jobs).push((id.clone(), queue_name.to_string(), "queued".to_string()));
        Ok(id)
    }

    async fn cancel(&self, job_id: &str) -> Result<bool> {
        self.ready().await?;
        let mut jobs = lock(&self.jobs);
        match jobs
            .iter_mut()
            .find(|(id, _, status)| id == job_id && status == "queued")
        {
            Some(job) => {
                job.2 = "cancelled".to_string();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn stats(&self) -> Result<QueueStats> {
        self.ready().await?;
        let jobs = lock(&self.jobs);
        let queued = jobs.iter().filter(|(_, _, s)| s == "queued").count() as u64;
        Ok(QueueStats {
            queued,
            total: jobs.len() as u64,
            ..Default::default()
        })
    }
}

pub struct FakeSandboxRepository {
    sandboxes: Mutex<Vec<Sandbox>>,
}

impl FakeSandboxRepository {
    pub fn new(sandboxes: Vec<Sandbox>) -> Self {
        Self {
            sandboxes: Mutex::new(sandboxes),
        }
    }

    pub fn get(&self, id: Uuid) -> Option<Sandbox> {
        lock(&self.sandboxes).iter().find(|s| s.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.sandboxes).len()
    }
}

#[async_trait]
impl SandboxRepository for FakeSandboxRepository {
    async fn find_by_machine_type(
        &self,
        machine_type: MachineType,
    ) -> Result<Vec<Sandbox>, DatabaseError> {
        Ok(lock(&self.sandboxes)
            .iter()
            .filter(|s| s.machine_type.unwrap_or(MachineType::CloudVm) == machine_type)
            .filter(|s| !s.is_terminated())
            .cloned()
            .collect())
    }

    async fn find_auto_stop_candidates(&self) -> Result<Vec<Sandbox>, DatabaseError> {
        Ok(lock(&self.sandboxes)
            .iter()
            .filter(|s| s.auto_stop_enabled && s.status == SandboxStatus::Active)
            .cloned()
            .collect())
    }

    async fn find_live(&self) -> Result<Vec<Sandbox>, DatabaseError> {
        Ok(lock(&self.sandboxes)
            .iter()
            .filter(|s| !s.is_terminated())
            .cloned()
            .collect())
    }

    async fn create(&self, new: NewSandbox) -> Result<Sandbox, DatabaseError> {
        let mut record = sandbox(new.machine_type);
        record.name = new.name;
        record.environment = new.environment;
        record.capacity = new.capacity;
        record.auto_stop_enabled = new.auto_stop_enabled;
        record.idle_minutes_before_stop = new.idle_minutes_before_stop;
        record.status = SandboxStatus::Provisioning;
        lock(&self.sandboxes).push(record.clone());
        Ok(record)
    }

    async fn update(&self, id: Uuid, fields: SandboxUpdate) -> Result<(), DatabaseError> {
        let mut sandboxes = lock(&self.sandboxes);
        let record = sandboxes
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| DatabaseError::NotFound(format!("sandbox {}", id)))?;

        if let Some(status) = fields.status {
            record.status = status;
            record.updated_at = Utc::now();
        }
        if let Some(health) = fields.health_status {
            record.health_status = health;
        }
        if fields.last_health_check.is_some() {
            record.last_health_check = fields.last_health_check;
        }
        if fields.instance_id.is_some() {
            record.instance_id = fields.instance_id;
        }
        if fields.public_ip.is_some() {
            record.public_ip = fields.public_ip;
        }
        if fields.private_ip.is_some() {
            record.private_ip = fields.private_ip;
        }
        if fields.session_handle.is_some() {
            record.session_handle = fields.session_handle;
        }
        if fields.backing_state.is_some() {
            record.backing_state = fields.backing_state;
        }
        Ok(())
    }
}

pub struct FakeTaskRepository {
    tasks: Mutex<Vec<Task>>,
    results: Mutex<Vec<(Uuid, ExecutionResult)>>,
    queued: i64,
    fail_writes: AtomicBool,
    clock: Arc<dyn Clock>,
}

impl FakeTaskRepository {
    pub fn new(tasks: Vec<Task>, clock: Arc<dyn Clock>) -> Self {
        Self {
            tasks: Mutex::new(tasks),
            results: Mutex::new(Vec::new()),
            queued: 0,
            fail_writes: AtomicBool::new(false),
            clock,
        }
    }

    pub fn with_queued(mut self, queued: i64) -> Self {
        self.queued = queued;
        self
    }

    pub fn get(&self, id: Uuid) -> Option<Task> {
        lock(&self.tasks).iter().find(|t| t.id == id).cloned()
    }

    pub fn results(&self) -> Vec<(Uuid, ExecutionResult)> {
        lock(&self.results).clone()
    }

    /// Make every status write fail until switched back.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl TaskRepository for FakeTaskRepository {
    async fn count_queued(&self) -> Result<i64, DatabaseError> {
        Ok(self.queued)
    }

    async fn find_stuck_jobs(
        &self,
        minutes_threshold: i64,
        after: Option<StuckCursor>,
        limit: usize,
    ) -> Result<Vec<Task>, DatabaseError> {
        let now = self.clock.now();
        let threshold = chrono::Duration::minutes(minutes_threshold);
        let mut stuck: Vec<Task> = lock(&self.tasks)
            .iter()
            .filter(|t| !t.status.is_terminal() && now - t.updated_at >= threshold)
            .filter(|t| match after {
                Some(c) => (t.updated_at, t.id) > (c.updated_at, c.id),
                None => true,
            })
            .cloned()
            .collect();
        stuck.sort_by(|a, b| (a.updated_at, a.id).cmp(&(b.updated_at, b.id)));
        stuck.truncate(limit);
        Ok(stuck)
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: TaskStatus,
        result: Option<ExecutionResult>,
    ) -> Result<bool, DatabaseError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DatabaseError::Internal("lost connection".to_string()));
        }
        let mut tasks = lock(&self.tasks);
        let task = tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| DatabaseError::NotFound(format!("task {}", id)))?;
        if task.status.is_terminal() {
            return Ok(false);
        }
        task.status = status;
        task.updated_at = self.clock.now();
        if let Some(result) = result {
            if let Some(reference) = result.reference.clone() {
                task.execution_ref = Some(reference);
            }
            lock(&self.results).push((id, result));
        }
        Ok(true)
    }
}

/// Provider that succeeds by default and records every lifecycle call.
pub struct FakeProvider {
    machine_type: MachineType,
    starts: Mutex<Vec<Uuid>>,
    stops: Mutex<Vec<Uuid>>,
    fail_start: AtomicBool,
    failing_stops: Mutex<HashSet<Uuid>>,
    ping: AtomicBool,
    state: Mutex<MachineState>,
}

impl FakeProvider {
    pub fn new(machine_type: MachineType) -> Self {
        Self {
            machine_type,
            starts: Mutex::new(Vec::new()),
            stops: Mutex::new(Vec::new()),
            fail_start: AtomicBool::new(false),
            failing_stops: Mutex::new(HashSet::new()),
            ping: AtomicBool::new(true),
            state: Mutex::new(MachineState::Running),
        }
    }

    pub fn fail_starts(&self) {
        self.fail_start.store(true, Ordering::SeqCst);
    }

    pub fn fail_stop_for(&self, id: Uuid) {
        lock(&self.failing_stops).insert(id);
    }

    pub fn set_ping(&self, healthy: bool) {
        self.ping.store(healthy, Ordering::SeqCst);
    }

    pub fn set_state(&self, state: MachineState) {
        *lock(&self.state) = state;
    }

    pub fn start_calls(&self) -> Vec<Uuid> {
        lock(&self.starts).clone()
    }

    pub fn stop_calls(&self) -> Vec<Uuid> {
        lock(&self.stops).clone()
    }
}

#[async_trait]
impl SandboxProvider for FakeProvider {
    fn machine_type(&self) -> MachineType {
        self.machine_type
    }

    async fn start_machine(&self, sandbox: &Sandbox) -> Result<MachineActionResult> {
        lock(&self.starts).push(sandbox.id);
        if self.fail_start.load(Ordering::SeqCst) {
            return Ok(MachineActionResult::failed("capacity exhausted"));
        }
        Ok(
            MachineActionResult::ok("started", Some(SandboxStatus::Active))
                .with_backing_state(MachineState::Running)
                .with_assigned(AssignedMachine {
                    instance_id: Some(format!("i-{}", &sandbox.id.simple().to_string()[..8])),
                    private_ip: Some("10.0.0.10".to_string()),
                    ..Default::default()
                }),
        )
    }

    async fn stop_machine(&self, sandbox: &Sandbox) -> Result<MachineActionResult> {
        lock(&self.stops).push(sandbox.id);
        if lock(&self.failing_stops).contains(&sandbox.id) {
            return Err(anyhow!("backend timed out"));
        }
        Ok(MachineActionResult::ok("stopped", Some(SandboxStatus::Stopped))
            .with_backing_state(MachineState::Stopped))
    }

    async fn get_machine_status(&self, _sandbox: &Sandbox) -> Result<MachineStatus> {
        Ok(MachineStatus::of(*lock(&self.state)))
    }

    fn get_agent_url(&self, sandbox: &Sandbox) -> Result<String, ProviderError> {
        sandbox
            .private_ip
            .as_ref()
            .map(|ip| format!("http://{}:8080", ip))
            .ok_or(ProviderError::NoAgentAddress {
                sandbox_id: sandbox.id,
            })
    }

    async fn ping_agent(&self, _sandbox: &Sandbox) -> bool {
        self.ping.load(Ordering::SeqCst)
    }
}

/// Execution backend answering from a per-task script; unscripted tasks fail
/// as if the backend were unreachable.
#[derive(Default)]
pub struct FakeExecutionBackend {
    responses: Mutex<HashMap<Uuid, SyncOutcome>>,
    calls: Mutex<Vec<Uuid>>,
    delay: Mutex<Option<Duration>>,
}

impl FakeExecutionBackend {
    pub fn respond(&self, task_id: Uuid, outcome: SyncOutcome) {
        lock(&self.responses).insert(task_id, outcome);
    }

    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = Some(delay);
    }

    pub fn calls(&self) -> Vec<Uuid> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl ExecutionBackend for FakeExecutionBackend {
    async fn sync_status(&self, task_id: Uuid) -> Result<SyncOutcome> {
        lock(&self.calls).push(task_id);
        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        lock(&self.responses)
            .get(&task_id)
            .cloned()
            .ok_or_else(|| anyhow!("execution backend unreachable"))
    }
}
