//! Capture task supervision
//!
//! The supervisor keeps exactly one capture task per discovered interface.
//! On every poll it runs discovery and reconciles:
//!
//! - new interface: spawn a task (`Starting`, then `Running` once attached)
//! - failed task whose interface is still present: restart it
//! - interface absent from `removal_threshold` consecutive polls: cancel its
//!   task (`Stopped`) and forget it
//!
//! Stopped tasks stay in the published status until the next poll.
//!
//! A poll whose discovery fails, or which finds no interfaces at all, never
//! changes any task. The supervisor waits `discovery_backoff` and tries again.

use crate::capture::PacketSource;
use crate::interfaces::InterfaceDiscovery;
use crate::pipeline::TrafficPipeline;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_REMOVAL_THRESHOLD: u32 = 2;

/// How long a cancelled capture task may take to wind down before it is aborted
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Starting,
    Running,
    Failed,
    Stopped,
}

impl TaskState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            TaskState::Starting => "starting",
            TaskState::Running => "running",
            TaskState::Failed => "failed",
            TaskState::Stopped => "stopped",
        }
    }

    /// Whether a task in this state should still be executing
    pub const fn is_live(&self) -> bool {
        matches!(self, TaskState::Starting | TaskState::Running)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Externally visible state of one capture task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStatus {
    pub interface_name: String,
    pub state: TaskState,
    pub last_error: Option<String>,
}

pub struct CaptureTaskHandle {
    interface_name: String,
    state: TaskState,
    last_error: Option<String>,
    generation: u64,
    missed_polls: u32,
    cancel: CancellationToken,
    join: Option<JoinHandle<()>>,
}

impl CaptureTaskHandle {
    pub fn interface_name(&self) -> &str {
        &self.interface_name
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn status(&self) -> TaskStatus {
        TaskStatus {
            interface_name: self.interface_name.clone(),
            state: self.state,
            last_error: self.last_error.clone(),
        }
    }
}

/// Reported by capture tasks; tagged with the generation of the task that
/// sent it so reports from a replaced task are ignored
#[derive(Debug)]
enum TaskEvent {
    Attached { interface: String, generation: u64 },
    Failed { interface: String, generation: u64, error: String },
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub poll_interval: Duration,
    pub discovery_backoff: Duration,
    pub removal_threshold: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            discovery_backoff: DEFAULT_POLL_INTERVAL,
            removal_threshold: DEFAULT_REMOVAL_THRESHOLD,
        }
    }
}

/// Changes decided by one reconciliation poll
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// Discovered interfaces without a task
    pub start: Vec<String>,
    /// Failed tasks whose interface is still discovered
    pub restart: Vec<String>,
    /// Tasks whose interface has now been missing for the full threshold
    pub stop: Vec<String>,
    /// Tasks whose interface is missing, but not for long enough yet
    pub missing: Vec<String>,
}

/// Decide what a successful, non-empty discovery means for the tracked tasks
///
/// `tracked` yields `(interface, state, consecutive missed polls)`.
pub fn plan_reconciliation<'a, I>(
    tracked: I,
    discovered: &BTreeSet<String>,
    removal_threshold: u32,
) -> ReconcilePlan
where
    I: IntoIterator<Item = (&'a str, TaskState, u32)>,
{
    let mut plan = ReconcilePlan::default();
    let mut known = BTreeSet::new();

    for (name, state, missed) in tracked {
        known.insert(name);

        if discovered.contains(name) {
            if state == TaskState::Failed {
                plan.restart.push(name.to_string());
            }
        } else if missed + 1 >= removal_threshold.max(1) {
            plan.stop.push(name.to_string());
        } else {
            plan.missing.push(name.to_string());
        }
    }

    plan.start = discovered
        .iter()
        .filter(|name| !known.contains(name.as_str()))
        .cloned()
        .collect();

    plan
}

/// Result of one reconciliation poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Reconciled {
        started: usize,
        restarted: usize,
        stopped: usize,
    },
    /// Discovery succeeded but matched nothing; tasks held
    Empty,
    /// Discovery failed; tasks held
    DiscoveryFailed,
}

pub struct InterfaceSupervisor {
    discovery: Arc<dyn InterfaceDiscovery>,
    source: Arc<dyn PacketSource>,
    pipeline: TrafficPipeline,
    config: SupervisorConfig,
    tasks: BTreeMap<String, CaptureTaskHandle>,
    stopped: Vec<TaskStatus>,
    events_tx: mpsc::UnboundedSender<TaskEvent>,
    events_rx: mpsc::UnboundedReceiver<TaskEvent>,
    status_tx: watch::Sender<Vec<TaskStatus>>,
    shutdown: CancellationToken,
    next_generation: u64,
    discovery_failures: u32,
}

impl InterfaceSupervisor {
    pub fn new(
        discovery: Arc<dyn InterfaceDiscovery>,
        source: Arc<dyn PacketSource>,
        pipeline: TrafficPipeline,
        config: SupervisorConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(Vec::new());

        Self {
            discovery,
            source,
            pipeline,
            config,
            tasks: BTreeMap::new(),
            stopped: Vec::new(),
            events_tx,
            events_rx,
            status_tx,
            shutdown,
            next_generation: 0,
            discovery_failures: 0,
        }
    }

    /// Follow task status changes
    pub fn subscribe(&self) -> watch::Receiver<Vec<TaskStatus>> {
        self.status_tx.subscribe()
    }

    pub fn task(&self, interface: &str) -> Option<&CaptureTaskHandle> {
        self.tasks.get(interface)
    }

    /// Tracked tasks, followed by tasks stopped since the last poll began
    pub fn statuses(&self) -> Vec<TaskStatus> {
        self.tasks
            .values()
            .map(CaptureTaskHandle::status)
            .chain(self.stopped.iter().cloned())
            .collect()
    }

    /// Run until the shutdown token is cancelled, then stop every task
    pub async fn run(mut self) {
        info!(
            "Interface supervisor started (poll every {:?}, retry after {:?})",
            self.config.poll_interval, self.config.discovery_backoff
        );

        loop {
            let delay = match self.reconcile().await {
                PollOutcome::Reconciled { .. } => self.config.poll_interval,
                PollOutcome::Empty | PollOutcome::DiscoveryFailed => self.config.discovery_backoff,
            };

            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);

            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => {
                        self.shutdown_all().await;
                        return;
                    }
                    Some(event) = self.events_rx.recv() => self.apply_event(event),
                    _ = &mut sleep => break,
                }
            }
        }
    }

    /// One reconciliation poll
    pub async fn reconcile(&mut self) -> PollOutcome {
        if !self.stopped.is_empty() {
            self.stopped.clear();
            self.publish();
        }
        self.reap_finished().await;

        let discovered = match self.discovery.discover().await {
            Ok(names) => {
                if self.discovery_failures > 0 {
                    info!(
                        "Interface discovery recovered after {} failed attempts",
                        self.discovery_failures
                    );
                    self.discovery_failures = 0;
                }
                names
            }
            Err(e) => {
                self.discovery_failures += 1;
                warn!(
                    "Interface discovery failed ({} in a row): {}. Keeping {} capture tasks, retrying in {:?}",
                    self.discovery_failures,
                    e,
                    self.tasks.len(),
                    self.config.discovery_backoff
                );
                return PollOutcome::DiscoveryFailed;
            }
        };

        if discovered.is_empty() {
            warn!(
                "No matching network interfaces found. Retrying in {:?}",
                self.config.discovery_backoff
            );
            return PollOutcome::Empty;
        }

        let discovered: BTreeSet<String> = discovered.into_iter().collect();
        let plan = plan_reconciliation(
            self.tasks
                .values()
                .map(|t| (t.interface_name.as_str(), t.state, t.missed_polls)),
            &discovered,
            self.config.removal_threshold,
        );

        for handle in self.tasks.values_mut() {
            if discovered.contains(&handle.interface_name) {
                handle.missed_polls = 0;
            }
        }

        for name in &plan.missing {
            if let Some(handle) = self.tasks.get_mut(name) {
                handle.missed_polls += 1;
                info!(
                    "Interface {} missing from discovery ({} of {} polls before stopping)",
                    name, handle.missed_polls, self.config.removal_threshold
                );
            }
        }

        for name in &plan.stop {
            info!("Interface {} disappeared, stopping capture", name);
            self.stop_task(name).await;
        }

        for name in &plan.restart {
            if let Some(handle) = self.tasks.get(name) {
                info!(
                    "Restarting capture on {} (last error: {})",
                    name,
                    handle.last_error.as_deref().unwrap_or("none")
                );
            }
            self.spawn_capture(name);
        }

        for name in &plan.start {
            info!("Discovered interface {}", name);
            self.spawn_capture(name);
        }

        self.publish();

        PollOutcome::Reconciled {
            started: plan.start.len(),
            restarted: plan.restart.len(),
            stopped: plan.stop.len(),
        }
    }

    /// Wait for the next report from a capture task and apply it
    ///
    /// Returns false if shutdown was requested first.
    pub async fn process_next_event(&mut self) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            Some(event) = self.events_rx.recv() => {
                self.apply_event(event);
                true
            }
        }
    }

    /// Stop every task and forget it
    pub async fn shutdown_all(&mut self) {
        let names: Vec<String> = self.tasks.keys().cloned().collect();
        info!("Stopping {} capture tasks", names.len());

        for name in names {
            self.stop_task(&name).await;
        }

        self.publish();
    }

    fn apply_event(&mut self, event: TaskEvent) {
        let (interface, generation) = match &event {
            TaskEvent::Attached {
                interface,
                generation,
            }
            | TaskEvent::Failed {
                interface,
                generation,
                ..
            } => (interface.clone(), *generation),
        };

        let Some(handle) = self.tasks.get_mut(&interface) else {
            debug!("Ignoring report from untracked interface {}", interface);
            return;
        };

        if handle.generation != generation {
            debug!("Ignoring stale report from a previous {} task", interface);
            return;
        }

        match event {
            TaskEvent::Attached { .. } => {
                if handle.state == TaskState::Starting {
                    handle.state = TaskState::Running;
                    info!("Capture running on {}", interface);
                }
            }
            TaskEvent::Failed { error, .. } => {
                if handle.state.is_live() {
                    error!("Capture on {} failed: {}", interface, error);
                    handle.state = TaskState::Failed;
                    handle.last_error = Some(error);
                }
            }
        }

        self.publish();
    }

    /// Mark tasks that ended without reporting (panics) as failed
    async fn reap_finished(&mut self) {
        let finished: Vec<String> = self
            .tasks
            .values()
            .filter(|t| t.state.is_live())
            .filter(|t| t.join.as_ref().is_some_and(|j| j.is_finished()))
            .map(|t| t.interface_name.clone())
            .collect();

        // Anything a finished task reported is already queued
        while let Ok(event) = self.events_rx.try_recv() {
            self.apply_event(event);
        }

        for name in finished {
            let Some(handle) = self.tasks.get_mut(&name) else {
                continue;
            };
            if !handle.state.is_live() {
                continue;
            }

            let reason = match handle.join.take() {
                Some(join) => match join.await {
                    Err(e) if e.is_panic() => "capture task panicked".to_string(),
                    _ => "capture task exited unexpectedly".to_string(),
                },
                None => continue,
            };

            error!("Capture on {} failed: {}", name, reason);
            handle.state = TaskState::Failed;
            handle.last_error = Some(reason);
        }
    }

    fn spawn_capture(&mut self, interface: &str) {
        self.next_generation += 1;
        let generation = self.next_generation;
        let cancel = self.shutdown.child_token();

        let join = tokio::spawn(capture_loop(
            interface.to_string(),
            generation,
            Arc::clone(&self.source),
            self.pipeline.clone(),
            self.events_tx.clone(),
            cancel.clone(),
        ));

        let handle = self
            .tasks
            .entry(interface.to_string())
            .or_insert_with(|| CaptureTaskHandle {
                interface_name: interface.to_string(),
                state: TaskState::Starting,
                last_error: None,
                generation,
                missed_polls: 0,
                cancel: cancel.clone(),
                join: None,
            });

        handle.state = TaskState::Starting;
        handle.generation = generation;
        handle.cancel = cancel;
        handle.join = Some(join);
    }

    async fn stop_task(&mut self, interface: &str) {
        let Some(mut handle) = self.tasks.remove(interface) else {
            return;
        };

        handle.cancel.cancel();

        if let Some(join) = handle.join.take() {
            let abort = join.abort_handle();
            if tokio::time::timeout(STOP_TIMEOUT, join).await.is_err() {
                warn!("Capture task for {} did not stop in time, aborting", interface);
                abort.abort();
            }
        }

        handle.state = TaskState::Stopped;
        self.stopped.push(handle.status());
        info!("Capture stopped on {}", interface);
    }

    fn publish(&self) {
        self.status_tx.send_replace(self.statuses());
    }
}

async fn capture_loop(
    interface: String,
    generation: u64,
    source: Arc<dyn PacketSource>,
    pipeline: TrafficPipeline,
    events: mpsc::UnboundedSender<TaskEvent>,
    cancel: CancellationToken,
) {
    let opened = tokio::select! {
        _ = cancel.cancelled() => return,
        opened = source.open(&interface) => opened,
    };

    let mut stream = match opened {
        Ok(stream) => stream,
        Err(e) => {
            let _ = events.send(TaskEvent::Failed {
                interface,
                generation,
                error: e.to_string(),
            });
            return;
        }
    };

    info!("Starting capture on interface: {}", interface);
    let _ = events.send(TaskEvent::Attached {
        interface: interface.clone(),
        generation,
    });

    let mut admitted: u64 = 0;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Capture on {} cancelled after {} admitted packets", interface, admitted);
                return;
            }
            next = stream.next_packet() => match next {
                Ok(record) => {
                    if pipeline.process(record) {
                        admitted += 1;
                    }
                }
                Err(e) => {
                    let _ = events.send(TaskEvent::Failed {
                        interface,
                        generation,
                        error: e.to_string(),
                    });
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_plan_starts_new_interfaces() {
        let plan = plan_reconciliation(
            [("eth0", TaskState::Running, 0)],
            &set(&["eth0", "docker0"]),
            DEFAULT_REMOVAL_THRESHOLD,
        );

        assert_eq!(plan.start, vec!["docker0"]);
        assert!(plan.restart.is_empty());
        assert!(plan.stop.is_empty());
    }

    #[test]
    fn test_plan_restarts_failed_interfaces_still_present() {
        let plan = plan_reconciliation(
            [("eth0", TaskState::Failed, 0), ("eth1", TaskState::Running, 0)],
            &set(&["eth0", "eth1"]),
            DEFAULT_REMOVAL_THRESHOLD,
        );

        assert_eq!(plan.restart, vec!["eth0"]);
        assert!(plan.start.is_empty());
    }

    #[test]
    fn test_plan_requires_consecutive_misses_before_stopping() {
        let first = plan_reconciliation(
            [("eth0", TaskState::Running, 0)],
            &set(&["eth1"]),
            DEFAULT_REMOVAL_THRESHOLD,
        );
        assert_eq!(first.missing, vec!["eth0"]);
        assert!(first.stop.is_empty());

        let second = plan_reconciliation(
            [("eth0", TaskState::Running, 1)],
            &set(&["eth1"]),
            DEFAULT_REMOVAL_THRESHOLD,
        );
        assert_eq!(second.stop, vec!["eth0"]);
        assert!(second.missing.is_empty());
    }

    #[test]
    fn test_plan_stops_failed_tasks_for_missing_interfaces() {
        let plan = plan_reconciliation([("br-1", TaskState::Failed, 1)], &set(&["eth0"]), 2);
        assert_eq!(plan.stop, vec!["br-1"]);
        assert!(plan.restart.is_empty());
    }

    #[test]
    fn test_plan_threshold_of_one_stops_immediately() {
        let plan = plan_reconciliation([("eth0", TaskState::Running, 0)], &set(&["eth1"]), 1);
        assert_eq!(plan.stop, vec!["eth0"]);
    }

    #[test]
    fn test_task_state_display() {
        assert_eq!(TaskState::Failed.to_string(), "failed");
        assert!(TaskState::Starting.is_live());
        assert!(!TaskState::Stopped.is_live());
    }

    use crate::capture::{ChannelSource, PacketStream};
    use crate::engine::AggregationEngine;
    use crate::filter::TrafficFilter;
    use crate::sink::MemorySink;
    use crate::{NetlogError, Result};
    use async_trait::async_trait;
    use netlog_common::PacketRecord;
    use std::sync::Mutex;

    const WAIT: Duration = Duration::from_secs(5);

    /// `None` makes discovery fail
    type Discovered = Arc<Mutex<Option<Vec<String>>>>;

    fn discovered(names: &[&str]) -> Discovered {
        Arc::new(Mutex::new(Some(names.iter().map(|n| n.to_string()).collect())))
    }

    fn supervisor(
        names: &Discovered,
        source: Arc<dyn PacketSource>,
        engine: &AggregationEngine,
    ) -> InterfaceSupervisor {
        let names = Arc::clone(names);
        let discovery: Arc<dyn InterfaceDiscovery> =
            Arc::new(move || -> Result<Vec<String>> {
                names
                    .lock()
                    .unwrap()
                    .clone()
                    .ok_or_else(|| NetlogError::Discovery("ip exited with 1".to_string()))
            });
        let pipeline = TrafficPipeline::new(
            TrafficFilter::allow_all(),
            engine.clone(),
            Arc::new(MemorySink::new()),
        );

        InterfaceSupervisor::new(
            discovery,
            source,
            pipeline,
            SupervisorConfig::default(),
            CancellationToken::new(),
        )
    }

    async fn next_event(supervisor: &mut InterfaceSupervisor) {
        let processed = tokio::time::timeout(WAIT, supervisor.process_next_event())
            .await
            .expect("task event within timeout");
        assert!(processed);
    }

    fn state(supervisor: &InterfaceSupervisor, name: &str) -> TaskState {
        supervisor.task(name).expect("task tracked").state()
    }

    #[tokio::test]
    async fn test_failed_capture_is_restarted_on_next_poll() {
        let source = ChannelSource::new();
        let first = source.push_stream("eth0");
        let second = source.push_stream("eth0");
        let engine = AggregationEngine::new();
        let names = discovered(&["eth0"]);
        let mut sup = supervisor(&names, Arc::new(source.clone()), &engine);

        assert_eq!(
            sup.reconcile().await,
            PollOutcome::Reconciled {
                started: 1,
                restarted: 0,
                stopped: 0
            }
        );
        assert_eq!(state(&sup, "eth0"), TaskState::Starting);
        next_event(&mut sup).await;
        assert_eq!(state(&sup, "eth0"), TaskState::Running);

        first
            .send(Err(NetlogError::capture("eth0", "link down")))
            .unwrap();
        next_event(&mut sup).await;
        assert_eq!(state(&sup, "eth0"), TaskState::Failed);
        assert!(sup.task("eth0").unwrap().last_error().unwrap().contains("link down"));

        assert_eq!(
            sup.reconcile().await,
            PollOutcome::Reconciled {
                started: 0,
                restarted: 1,
                stopped: 0
            }
        );
        next_event(&mut sup).await;
        assert_eq!(state(&sup, "eth0"), TaskState::Running);
        assert_eq!(source.open_count("eth0"), 2);

        second
            .send(Ok(PacketRecord::new("10.0.0.1", "10.0.0.2", "TCP", 64)))
            .unwrap();
        tokio::time::timeout(WAIT, async {
            while engine.packets_recorded() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("packet aggregated");

        sup.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_open_failure_marks_task_failed() {
        let source = ChannelSource::new();
        source.push_open_failure("eth0", "permission denied");
        let names = discovered(&["eth0"]);
        let mut sup = supervisor(&names, Arc::new(source), &AggregationEngine::new());

        sup.reconcile().await;
        next_event(&mut sup).await;

        assert_eq!(state(&sup, "eth0"), TaskState::Failed);
        assert!(sup
            .task("eth0")
            .unwrap()
            .last_error()
            .unwrap()
            .contains("permission denied"));
    }

    #[tokio::test]
    async fn test_discovery_failure_and_empty_result_hold_tasks() {
        let source = ChannelSource::new();
        let _feed = source.push_stream("eth0");
        let names = discovered(&["eth0"]);
        let mut sup = supervisor(&names, Arc::new(source), &AggregationEngine::new());

        sup.reconcile().await;
        next_event(&mut sup).await;

        *names.lock().unwrap() = None;
        assert_eq!(sup.reconcile().await, PollOutcome::DiscoveryFailed);
        assert_eq!(sup.reconcile().await, PollOutcome::DiscoveryFailed);
        assert_eq!(state(&sup, "eth0"), TaskState::Running);

        *names.lock().unwrap() = Some(Vec::new());
        assert_eq!(sup.reconcile().await, PollOutcome::Empty);
        assert_eq!(sup.reconcile().await, PollOutcome::Empty);
        assert_eq!(state(&sup, "eth0"), TaskState::Running);

        sup.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_interface_removed_after_consecutive_absences() {
        let source = ChannelSource::new();
        let _eth0 = source.push_stream("eth0");
        let _eth1 = source.push_stream("eth1");
        let names = discovered(&["eth0", "eth1"]);
        let mut sup = supervisor(&names, Arc::new(source), &AggregationEngine::new());
        let status = sup.subscribe();

        sup.reconcile().await;
        next_event(&mut sup).await;
        next_event(&mut sup).await;

        *names.lock().unwrap() = Some(vec!["eth1".to_string()]);
        assert_eq!(
            sup.reconcile().await,
            PollOutcome::Reconciled {
                started: 0,
                restarted: 0,
                stopped: 0
            }
        );
        assert_eq!(state(&sup, "eth0"), TaskState::Running);

        assert_eq!(
            sup.reconcile().await,
            PollOutcome::Reconciled {
                started: 0,
                restarted: 0,
                stopped: 1
            }
        );
        assert!(sup.task("eth0").is_none());
        assert_eq!(state(&sup, "eth1"), TaskState::Running);

        let published = status.borrow().clone();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].interface_name, "eth1");
        assert_eq!(published[1].interface_name, "eth0");
        assert_eq!(published[1].state, TaskState::Stopped);

        // Forgotten once the next poll starts
        sup.reconcile().await;
        let published = status.borrow().clone();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].interface_name, "eth1");

        sup.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_reappearing_interface_resets_absence_count() {
        let source = ChannelSource::new();
        let _feed = source.push_stream("eth0");
        let names = discovered(&["eth0"]);
        let mut sup = supervisor(&names, Arc::new(source), &AggregationEngine::new());

        sup.reconcile().await;
        next_event(&mut sup).await;

        *names.lock().unwrap() = Some(vec!["docker0".to_string()]);
        sup.reconcile().await;
        *names.lock().unwrap() = Some(vec!["eth0".to_string()]);
        sup.reconcile().await;
        *names.lock().unwrap() = Some(vec!["docker0".to_string()]);
        sup.reconcile().await;

        assert_eq!(state(&sup, "eth0"), TaskState::Running);
        sup.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_stale_reports_are_ignored() {
        let source = ChannelSource::new();
        let _feed = source.push_stream("eth0");
        let names = discovered(&["eth0"]);
        let mut sup = supervisor(&names, Arc::new(source), &AggregationEngine::new());

        sup.reconcile().await;
        next_event(&mut sup).await;

        let current = sup.task("eth0").unwrap().generation;
        sup.apply_event(TaskEvent::Failed {
            interface: "eth0".to_string(),
            generation: current - 1,
            error: "old failure".to_string(),
        });

        assert_eq!(state(&sup, "eth0"), TaskState::Running);
        assert!(sup.task("eth0").unwrap().last_error().is_none());
        sup.shutdown_all().await;
    }

    struct PanickingSource;

    #[async_trait]
    impl PacketSource for PanickingSource {
        async fn open(&self, _interface: &str) -> Result<Box<dyn PacketStream>> {
            panic!("driver bug");
        }
    }

    #[tokio::test]
    async fn test_panicking_task_is_isolated_and_restarted() {
        let names = discovered(&["eth0"]);
        let mut sup = supervisor(&names, Arc::new(PanickingSource), &AggregationEngine::new());

        sup.reconcile().await;
        tokio::time::timeout(WAIT, async {
            while !sup.tasks["eth0"].join.as_ref().is_some_and(|j| j.is_finished()) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("task finished");

        let outcome = sup.reconcile().await;
        assert_eq!(
            outcome,
            PollOutcome::Reconciled {
                started: 0,
                restarted: 1,
                stopped: 0
            }
        );
        assert_eq!(
            sup.task("eth0").unwrap().last_error(),
            Some("capture task panicked")
        );
        sup.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let source = ChannelSource::new();
        let _a = source.push_stream("eth0");
        let _b = source.push_stream("br-1");
        let names = discovered(&["eth0", "br-1"]);
        let mut sup = supervisor(&names, Arc::new(source), &AggregationEngine::new());

        sup.reconcile().await;
        sup.shutdown_all().await;

        let statuses = sup.statuses();
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(|s| s.state == TaskState::Stopped));
        assert_eq!(*sup.subscribe().borrow(), statuses);
        assert!(sup.task("eth0").is_none());
    }
}
