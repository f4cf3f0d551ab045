// Scheduler engine - the daemon loop that turns catalog entries into fires
//
// Lifecycle: Starting -> Running -> Stopping -> Stopped. The engine owns the
// fire registry for the duration of one `run()` and is the only dispatcher.

use crate::errors::{SchedulerError, StoreError};
use crate::models::TaskEntry;
use crate::schedule::{resolve_next_fire, MissedFirePolicy, ScheduleTrigger};
use crate::scheduler::lease::DaemonLease;
use crate::scheduler::registry::FireRegistry;
use crate::storage::TaskStore;
use crate::telemetry;
use crate::worker::{ExecutionRunner, RunResult};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

/// Configuration for the scheduler engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How often the registry is rebuilt from the catalog
    pub reconcile_interval: Duration,
    /// How long Stopping waits for in-flight executions
    pub shutdown_grace: Duration,
    pub missed_fire_policy: MissedFirePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(30),
            missed_fire_policy: MissedFirePolicy::Skip,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaemonState::Starting => write!(f, "starting"),
            DaemonState::Running => write!(f, "running"),
            DaemonState::Stopping => write!(f, "stopping"),
            DaemonState::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Reload,
    Shutdown,
}

/// Handle for steering a running engine from signal handlers and tests
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    control: mpsc::UnboundedSender<Control>,
    state: watch::Receiver<DaemonState>,
}

impl SchedulerHandle {
    /// Re-read the catalog now instead of waiting for the next reconcile tick
    pub fn reload(&self) {
        if self.control.send(Control::Reload).is_err() {
            debug!("Reload requested but the engine has already stopped");
        }
    }

    pub fn shutdown(&self) {
        if self.control.send(Control::Shutdown).is_err() {
            debug!("Shutdown requested but the engine has already stopped");
        }
    }

    pub fn state(&self) -> DaemonState {
        *self.state.borrow()
    }

    /// Wait until the engine reaches `target`
    pub async fn wait_for_state(&self, target: DaemonState) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|current| *current == target).await;
    }
}

type Completion = (String, RunResult);

/// Main scheduler engine implementation
pub struct SchedulerEngine {
    config: EngineConfig,
    store: Arc<dyn TaskStore>,
    runner: Arc<ExecutionRunner>,
    lease: Option<DaemonLease>,
    control_tx: mpsc::UnboundedSender<Control>,
    control_rx: mpsc::UnboundedReceiver<Control>,
    state_tx: watch::Sender<DaemonState>,
}

impl SchedulerEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn TaskStore>,
        runner: Arc<ExecutionRunner>,
    ) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(DaemonState::Starting);
        Self {
            config,
            store,
            runner,
            lease: None,
            control_tx,
            control_rx,
            state_tx,
        }
    }

    /// Refuse to run while another daemon holds this lease
    pub fn with_lease(mut self, lease: DaemonLease) -> Self {
        self.lease = Some(lease);
        self
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            control: self.control_tx.clone(),
            state: self.state_tx.subscribe(),
        }
    }

    fn set_state(&self, state: DaemonState) {
        self.state_tx.send_replace(state);
        info!(state = %state, "Scheduler state changed");
    }

    /// Drive the daemon until shutdown.
    ///
    /// Returns `Err` when startup fails (lease held, unreadable catalog) or
    /// when another instance took over the lease while running.
    #[instrument(skip(self), fields(
        reconcile_interval_seconds = self.config.reconcile_interval.as_secs(),
        missed_fire_policy = ?self.config.missed_fire_policy
    ))]
    pub async fn run(mut self) -> Result<(), SchedulerError> {
        self.set_state(DaemonState::Starting);

        if let Some(lease) = &self.lease {
            if let Err(e) = lease.heartbeat().await {
                error!(error = %e, "Could not acquire scheduler lease");
                self.set_state(DaemonState::Stopped);
                return Err(e);
            }
        }

        let mut registry = FireRegistry::new();
        let mut dispatched: HashSet<String> = HashSet::new();
        let mut in_flight: JoinSet<Completion> = JoinSet::new();

        let entries = match self.store.load_all().await {
            Ok(entries) => entries,
            Err(e) => {
                error!(error = %e, "Failed to load task catalog");
                self.release_lease().await;
                self.set_state(DaemonState::Stopped);
                return Err(e.into());
            }
        };
        self.rebuild(&mut registry, &dispatched, entries, Utc::now()).await;
        info!(registered = registry.len(), "Task catalog loaded");

        self.set_state(DaemonState::Running);

        let every = self.config.reconcile_interval;
        let mut reconcile = interval_at(Instant::now() + every, every);
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut fatal: Option<SchedulerError> = None;

        loop {
            let until_next_fire = registry
                .peek()
                .map(|(fire_at, _)| (fire_at - Utc::now()).to_std().unwrap_or(Duration::ZERO));

            tokio::select! {
                _ = sleep_until_fire(until_next_fire) => {
                    self.dispatch_due(&mut registry, &mut dispatched, &mut in_flight).await;
                }
                Some(control) = self.control_rx.recv() => match control {
                    Control::Reload => {
                        info!("Reload requested");
                        self.reconcile(&mut registry, &dispatched).await;
                    }
                    Control::Shutdown => {
                        info!("Shutdown signal received, stopping scheduler");
                        break;
                    }
                },
                _ = reconcile.tick() => {
                    if let Some(lease) = &self.lease {
                        match lease.heartbeat().await {
                            Ok(_) => {}
                            Err(e @ SchedulerError::LeaseHeld { .. }) => {
                                error!(error = %e, "Scheduler lease lost to another instance");
                                fatal = Some(e);
                                break;
                            }
                            Err(e) => warn!(error = %e, "Failed to renew scheduler lease"),
                        }
                    }
                    self.reconcile(&mut registry, &dispatched).await;
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    self.complete(&mut registry, &mut dispatched, joined).await;
                }
            }
        }

        self.set_state(DaemonState::Stopping);
        registry.clear();
        telemetry::update_registered_tasks(0);
        self.drain(&mut in_flight).await;
        if fatal.is_none() {
            self.release_lease().await;
        }
        drop(registry);
        self.set_state(DaemonState::Stopped);

        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Pop every due fire and dispatch the ones still valid in the catalog
    async fn dispatch_due(
        &self,
        registry: &mut FireRegistry,
        dispatched: &mut HashSet<String>,
        in_flight: &mut JoinSet<Completion>,
    ) {
        for (fire_at, task_id) in registry.pop_due(Utc::now()) {
            let entry = match self.store.get(&task_id).await {
                Ok(entry) => entry,
                Err(StoreError::NotFound(_)) => {
                    info!(task_id = %task_id, "Task deleted before its fire, dropping");
                    continue;
                }
                Err(e) => {
                    // Picked up again by the next reconcile
                    error!(task_id = %task_id, error = %e, "Failed to read task for dispatch");
                    continue;
                }
            };

            if !entry.is_active {
                info!(task_id = %task_id, "Task disabled before its fire, dropping");
                continue;
            }

            if dispatched.contains(&task_id) {
                warn!(task_id = %task_id, fired_at = %fire_at, "Task still running, skipping fire");
                telemetry::record_skipped_fire(&task_id);
                continue;
            }

            let expected = entry
                .schedule()
                .and_then(|schedule| schedule.next_fire_after(entry.reference_time()));
            match expected {
                Ok(Some(expected)) if expected <= fire_at => {}
                Ok(Some(expected)) => {
                    debug!(task_id = %task_id, registered = %fire_at, expected = %expected, "Schedule moved, re-registering");
                    self.register_next(registry, &entry, Utc::now()).await;
                    continue;
                }
                Ok(None) => {
                    info!(task_id = %task_id, "Schedule exhausted, dropping fire");
                    continue;
                }
                Err(e) => {
                    error!(task_id = %task_id, error = %e, "Stored schedule is invalid, dropping fire");
                    continue;
                }
            }

            debug!(task_id = %task_id, fired_at = %fire_at, "Dispatching task");
            dispatched.insert(task_id.clone());
            let runner = Arc::clone(&self.runner);
            in_flight.spawn(async move {
                let result = runner.run(&entry, fire_at).await;
                (entry.id, result)
            });
        }
        telemetry::update_registered_tasks(registry.len());
    }

    /// Re-register a task after its execution finished
    async fn complete(
        &self,
        registry: &mut FireRegistry,
        dispatched: &mut HashSet<String>,
        joined: Result<Completion, JoinError>,
    ) {
        let task_id = match joined {
            Ok((task_id, result)) => {
                debug!(task_id = %task_id, result = ?result, "Execution finished");
                dispatched.remove(&task_id);
                task_id
            }
            Err(e) => {
                error!(error = %e, "Execution task aborted");
                dispatched.retain(|id| self.runner.is_in_flight(id));
                return;
            }
        };

        match self.store.get(&task_id).await {
            Ok(entry) if entry.is_active => {
                self.register_next(registry, &entry, Utc::now()).await;
            }
            Ok(_) | Err(StoreError::NotFound(_)) => {
                registry.remove(&task_id);
            }
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Failed to re-read task after execution");
            }
        }
        telemetry::update_registered_tasks(registry.len());
    }

    /// Rebuild the registry from the catalog, leaving running tasks alone
    async fn reconcile(&self, registry: &mut FireRegistry, dispatched: &HashSet<String>) {
        // Taken before the read so a slow catalog lock cannot push live fires into the past
        let now = Utc::now();
        match self.store.list().await {
            Ok(entries) => {
                self.rebuild(registry, dispatched, entries, now).await;
                debug!(registered = registry.len(), "Registry reconciled");
            }
            Err(e) => error!(error = %e, "Reconcile failed, keeping current registry"),
        }
    }

    /// Replace the registry with the catalog's view.
    ///
    /// A task that was already registered keeps its slot unless its schedule
    /// now points later, so a fire that fell due while the daemon was running
    /// is still dispatched. The missed-fire policy only applies to tasks that
    /// had no registration (startup, newly added, re-enabled).
    async fn rebuild(
        &self,
        registry: &mut FireRegistry,
        dispatched: &HashSet<String>,
        entries: Vec<TaskEntry>,
        now: DateTime<Utc>,
    ) {
        let previous = registry.take_all();
        for entry in entries.iter().filter(|entry| entry.is_active) {
            if dispatched.contains(&entry.id) {
                continue;
            }
            let carried = previous.get(&entry.id).and_then(|registered| {
                let expected = entry
                    .schedule()
                    .and_then(|schedule| schedule.next_fire_after(entry.reference_time()))
                    .ok()
                    .flatten();
                carried_fire(expected, *registered, now)
            });
            match carried {
                Some(fire_at) => self.register_at(registry, entry, Some(fire_at)).await,
                None => self.register_next(registry, entry, now).await,
            }
        }
        telemetry::update_registered_tasks(registry.len());
    }

    /// Register the policy-resolved next fire and persist it if the catalog disagrees
    async fn register_next(
        &self,
        registry: &mut FireRegistry,
        entry: &TaskEntry,
        now: DateTime<Utc>,
    ) {
        let resolved = entry.schedule().and_then(|schedule| {
            resolve_next_fire(
                &schedule,
                entry.reference_time(),
                now,
                self.config.missed_fire_policy,
            )
        });

        match resolved {
            Ok(next) => self.register_at(registry, entry, next).await,
            Err(e) => {
                warn!(task_id = %entry.id, error = %e, "Cannot compute next fire");
                registry.remove(&entry.id);
            }
        }
    }

    async fn register_at(
        &self,
        registry: &mut FireRegistry,
        entry: &TaskEntry,
        next: Option<DateTime<Utc>>,
    ) {
        match next {
            Some(fire_at) => registry.register(&entry.id, fire_at),
            None => {
                registry.remove(&entry.id);
            }
        }

        if entry.next_run_at != next {
            let result = self
                .store
                .modify(&entry.id, Box::new(move |stored| stored.next_run_at = next))
                .await;
            if let Err(e) = result {
                warn!(task_id = %entry.id, error = %e, "Failed to persist next run time");
            }
        }
    }

    /// Wait for running executions within the grace period, then detach the rest
    async fn drain(&self, in_flight: &mut JoinSet<Completion>) {
        if in_flight.is_empty() {
            return;
        }

        self.runner.request_cancel();
        info!(
            in_flight = in_flight.len(),
            grace_seconds = self.config.shutdown_grace.as_secs(),
            "Waiting for in-flight executions"
        );

        let waited = tokio::time::timeout(self.config.shutdown_grace, async {
            while let Some(joined) = in_flight.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "Execution task aborted during shutdown");
                }
            }
        })
        .await;

        if waited.is_err() {
            warn!(
                abandoned = in_flight.len(),
                "Grace period elapsed, detaching remaining executions"
            );
            in_flight.detach_all();
        }
    }

    async fn release_lease(&self) {
        if let Some(lease) = &self.lease {
            if let Err(e) = lease.surrender().await {
                warn!(error = %e, "Failed to release scheduler lease");
            }
        }
    }
}

/// Slot to keep for a task that was registered before a rebuild.
///
/// `expected` is the schedule's next fire after the task's reference time.
/// `None` means the registration is stale (schedule moved later, exhausted or
/// invalid) and the task has to be resolved afresh.
fn carried_fire(
    expected: Option<DateTime<Utc>>,
    registered: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let expected = expected?;
    if expected > registered {
        None
    } else if expected > now {
        // Moved earlier but still ahead
        Some(expected)
    } else {
        Some(registered)
    }
}

async fn sleep_until_fire(delay: Option<Duration>) {
    match delay {
        Some(delay) => sleep(delay).await,
        None => std::future::pending::<()>().await,
    }
}
