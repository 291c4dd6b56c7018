//! Phase/step scheduler.
//!
//! The workflow is a sequence of phases, each a sequence of steps, each
//! observed through the tasks a collaborator attaches to it. A tick reads a
//! [`Snapshot`], picks the single transition the current rows imply, applies
//! it with a CAS keyed on the row's prior value, and repeats until nothing is
//! left to do. Because every transition is a CAS from its source state, any
//! number of redundant ticks (in one process or many) fire each activation
//! and completion exactly once.
//!
//! Step completion is driven by task counts: a step completes when the
//! number of its non-terminal tasks drops to zero. The drop is detected by
//! comparing the new snapshot against the one the previous tick ended on;
//! with no previous snapshot (fresh process), an Active step whose tasks are
//! all terminal counts as having just reached zero so a resumed run picks up
//! where the crashed one stopped.

mod shape;
mod snapshot;

pub use shape::{PhaseShape, WorkflowShape};
pub use snapshot::{Snapshot, Summary, TaskCount};

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::errors::{SchedulerError, StoreError};
use crate::queue::OperationQueue;
use crate::store::{
    CasOutcome, PhaseRow, PhaseStatus, Query, Record, StepRow, StepStatus, Store, Table,
    WorkflowRow, WorkflowStatus,
};

/// Decides whether an Active phase should be skipped before its first step
/// starts.
pub type SkipPredicate = Arc<dyn Fn(&Snapshot) -> bool + Send + Sync>;

/// Transitions applied by this process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerEvent {
    PhaseActivated { phase: u32 },
    PhaseSkipped { phase: u32 },
    PhaseCompleted { phase: u32 },
    StepActivated { phase: u32, step: u32 },
    StepCompleted { phase: u32, step: u32 },
    WorkflowCompleted,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub events: Vec<SchedulerEvent>,
    /// CAS writes lost to another writer and retried.
    pub conflicts: u32,
    /// The workflow row is Completed.
    pub finished: bool,
}

impl TickReport {
    fn merge(&mut self, other: TickReport) {
        self.events.extend(other.events);
        self.conflicts += other.conflicts;
        self.finished = other.finished;
    }
}

enum Applied {
    Event(SchedulerEvent),
    /// Progress that produces no event (a "don't skip" outcome).
    Silent,
    /// The CAS lost a race.
    Lost,
}

enum Transition {
    ActivatePhase(PhaseRow),
    EvaluateSkip(PhaseRow),
    CompletePhase(PhaseRow),
    ActivateStep(StepRow),
    CompleteStep(StepRow),
    CompleteWorkflow(Option<WorkflowRow>),
}

pub struct Scheduler {
    store: Store,
    shape: WorkflowShape,
    config: SchedulerConfig,
    skips: HashMap<u32, SkipPredicate>,
    events: Option<mpsc::UnboundedSender<SchedulerEvent>>,
    events_closed: AtomicBool,
    queue: Option<OperationQueue>,
    /// Snapshot the last successful tick ended on.
    previous: Option<Snapshot>,
}

impl Scheduler {
    pub fn new(store: Store, shape: WorkflowShape, config: SchedulerConfig) -> Self {
        Self {
            store,
            shape,
            config,
            skips: HashMap::new(),
            events: None,
            events_closed: AtomicBool::new(false),
            queue: None,
            previous: None,
        }
    }

    /// Register the skip predicate for a phase. It is evaluated once, when
    /// the phase is Active and before its first step activates; the outcome
    /// is persisted in `skip_result`.
    pub fn with_skip<F>(mut self, phase_index: u32, predicate: F) -> Self
    where
        F: Fn(&Snapshot) -> bool + Send + Sync + 'static,
    {
        self.skips.insert(phase_index, Arc::new(predicate));
        self
    }

    pub fn with_events(mut self, tx: mpsc::UnboundedSender<SchedulerEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Attach a queue whose batch boundary advances after every tick.
    pub fn with_queue(mut self, queue: OperationQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn shape(&self) -> &WorkflowShape {
        &self.shape
    }

    pub fn snapshot(&self) -> Result<Snapshot, SchedulerError> {
        Ok(Snapshot::read(&self.store)?)
    }

    /// Create phase, step and workflow rows that do not exist yet. Existing
    /// rows are never overwritten, so this is safe to run on every start.
    /// Returns the number of rows created.
    pub fn initialize(&self) -> Result<usize, SchedulerError> {
        let mut created = 0;
        let mut insert = |record: Record| -> Result<(), StoreError> {
            if self.store.insert_if_absent(&record)?.is_applied() {
                created += 1;
            }
            Ok(())
        };
        for (phase_index, phase) in self.shape.phases.iter().enumerate() {
            let phase_index = phase_index as u32;
            insert(Record::Phase(PhaseRow::pending(phase_index)))?;
            for step_index in 0..phase.steps {
                insert(Record::Step(StepRow::pending(phase_index, step_index)))?;
            }
        }
        insert(Record::Workflow(WorkflowRow {
            status: WorkflowStatus::Running,
        }))?;

        let stored = WorkflowShape::from_store(&self.store)?;
        if stored.phase_count() > self.shape.phase_count() {
            warn!(
                declared = self.shape.phase_count(),
                stored = stored.phase_count(),
                "store holds more phases than the declared shape"
            );
        }
        info!(created, phases = self.shape.phase_count(), "workflow initialized");
        Ok(created)
    }

    /// One re-evaluation pass: apply every transition the current rows
    /// imply, in order, until none is left.
    pub fn tick(&mut self) -> Result<TickReport, SchedulerError> {
        let mut report = TickReport::default();
        loop {
            let snap = Snapshot::read(&self.store)?;
            let transition = match self.plan(&snap) {
                Ok(transition) => transition,
                Err(e) => {
                    error!(error = %e, "tick aborted");
                    return Err(e);
                }
            };
            let Some(transition) = transition else {
                report.finished = snap.is_finished();
                self.previous = Some(snap);
                debug!(events = report.events.len(), conflicts = report.conflicts, "tick settled");
                return Ok(report);
            };
            match self.apply(&snap, transition)? {
                Applied::Event(event) => self.emit(event, &mut report),
                Applied::Silent => {}
                Applied::Lost => self.note_conflict(&mut report)?,
            }
        }
    }

    /// Evaluate a skip predicate for `phase_index`.
    ///
    /// Only the Active phase is evaluated; on any other phase this is a
    /// no-op returning `None`. A phase whose skip outcome is already
    /// recorded returns that outcome without re-evaluating. Evaluating a
    /// phase after one of its steps started is an invariant violation.
    ///
    /// A plain [`tick`](Self::tick) activates step 0 of a newly Active phase
    /// in the same pass, leaving no window to call this; register the
    /// predicate with [`with_skip`](Self::with_skip) so the tick evaluates it
    /// before any step starts.
    pub fn evaluate_skip<F>(
        &mut self,
        phase_index: u32,
        predicate: F,
    ) -> Result<Option<bool>, SchedulerError>
    where
        F: Fn(&Snapshot) -> bool,
    {
        if self.shape.steps_in(phase_index).is_none() {
            return Err(SchedulerError::UnknownPhase { index: phase_index });
        }
        let mut report = TickReport::default();
        let skipped = loop {
            let snap = Snapshot::read(&self.store)?;
            let phase = snap
                .phase(phase_index)
                .ok_or(SchedulerError::UnknownPhase { index: phase_index })?
                .clone();
            if phase.status != PhaseStatus::Active {
                debug!(phase = phase_index, status = %phase.status, "skip evaluation ignored; phase not active");
                return Ok(None);
            }
            if let Some(previous) = phase.skip_result {
                return Ok(Some(previous));
            }
            check_unstarted(&snap, &phase)?;
            let skip = predicate(&snap);
            if self.record_skip(&phase, skip)? {
                if skip {
                    self.emit(SchedulerEvent::PhaseSkipped { phase: phase_index }, &mut report);
                }
                break skip;
            }
            self.note_conflict(&mut report)?;
        };
        if skipped {
            self.tick()?;
        }
        Ok(Some(skipped))
    }

    /// `Active → Completed` for a step whose tasks are all terminal. When it
    /// is the phase's last step the phase completes too.
    pub fn complete_step(
        &mut self,
        phase_index: u32,
        step_index: u32,
    ) -> Result<TickReport, SchedulerError> {
        let mut report = TickReport::default();
        loop {
            let snap = Snapshot::read(&self.store)?;
            let step = snap
                .step(phase_index, step_index)
                .ok_or(SchedulerError::UnknownStep {
                    phase: phase_index,
                    step: step_index,
                })?
                .clone();
            if step.status != StepStatus::Active {
                return Err(reject(
                    format!("step {}", step.id()),
                    "active",
                    step.status.to_string(),
                ));
            }
            let count = snap.task_count(phase_index, step_index);
            if count.outstanding > 0 {
                return Err(reject(
                    format!("step {}", step.id()),
                    "0 outstanding tasks",
                    format!("{} outstanding", count.outstanding),
                ));
            }
            match self.cas_step(&step, StepStatus::Completed)? {
                true => {
                    self.emit(
                        SchedulerEvent::StepCompleted {
                            phase: phase_index,
                            step: step_index,
                        },
                        &mut report,
                    );
                    break;
                }
                false => self.note_conflict(&mut report)?,
            }
        }
        if self.shape.is_last_step(phase_index, step_index) {
            report.merge(self.complete_phase(phase_index)?);
        } else {
            report.merge(self.tick()?);
        }
        Ok(report)
    }

    /// `Active → Completed` for a phase whose steps are all Completed, then
    /// activate the next phase or finish the workflow.
    pub fn complete_phase(&mut self, phase_index: u32) -> Result<TickReport, SchedulerError> {
        let mut report = TickReport::default();
        loop {
            let snap = Snapshot::read(&self.store)?;
            let phase = snap
                .phase(phase_index)
                .ok_or(SchedulerError::UnknownPhase { index: phase_index })?
                .clone();
            if phase.status != PhaseStatus::Active {
                return Err(reject(
                    format!("phase {}", phase_index),
                    "active",
                    phase.status.to_string(),
                ));
            }
            if let Some(open) = snap
                .steps_of(phase_index)
                .iter()
                .find(|s| s.status != StepStatus::Completed)
            {
                return Err(reject(
                    format!("phase {}", phase_index),
                    "all steps completed",
                    format!("step {} {}", open.id(), open.status),
                ));
            }
            match self.cas_phase(&phase, phase.with_status(PhaseStatus::Completed))? {
                true => {
                    self.emit(SchedulerEvent::PhaseCompleted { phase: phase_index }, &mut report);
                    break;
                }
                false => self.note_conflict(&mut report)?,
            }
        }
        // Successor activation (or workflow completion) is exactly what the
        // next pass would do.
        report.merge(self.tick()?);
        Ok(report)
    }

    /// Tick on every change to phases, steps or tasks (local or, via
    /// `sync`, from other processes) and on the poll interval, until the
    /// workflow completes or `shutdown` flips to `true`.
    ///
    /// Invariant violations and conflict-limit hits end only the current
    /// tick; store failures end the loop.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), SchedulerError> {
        let store = self.store.clone();
        let wake = Arc::new(Notify::new());
        let mut subscriptions = Vec::new();
        for table in [Table::Phases, Table::Steps, Table::Tasks] {
            let wake = wake.clone();
            let id = store
                .call(move |store| -> Result<_, SchedulerError> {
                    Ok(store.subscribe(Query::Table(table), move |_| wake.notify_one())?)
                })
                .await?;
            subscriptions.push(id);
        }
        info!(phases = self.shape.phase_count(), "scheduler running");

        let poll = self.config.poll_interval();
        let mut scheduler = self;
        let result = loop {
            if *shutdown.borrow() {
                break Ok(());
            }
            let (returned, outcome) = tokio::task::spawn_blocking(move || {
                let outcome = scheduler.sync_and_tick();
                (scheduler, outcome)
            })
            .await
            .map_err(|e| StoreError::TaskPanicked(e.to_string()))?;
            scheduler = returned;

            match outcome {
                Ok(report) if report.finished => {
                    info!("workflow completed");
                    break Ok(());
                }
                Ok(_) => {}
                Err(e) if e.is_invariant_violation() => {}
                Err(e @ SchedulerError::ConflictLimit { .. }) => {
                    warn!(error = %e, "tick gave up; retrying on next wake");
                }
                Err(e) => break Err(e),
            }

            tokio::select! {
                _ = wake.notified() => {}
                _ = tokio::time::sleep(poll) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break Ok(());
                    }
                }
            }
        };

        for id in subscriptions {
            if let Err(e) = store.unsubscribe(id) {
                warn!(error = %e, "failed to drop scheduler subscription");
            }
        }
        result
    }

    fn sync_and_tick(&mut self) -> Result<TickReport, SchedulerError> {
        self.store.sync()?;
        let report = self.tick()?;
        if let Some(queue) = &self.queue
            && let Err(e) = queue.tick_boundary()
        {
            warn!(error = %e, "failed to advance batch boundary");
        }
        Ok(report)
    }

    // ── Planning ──────────────────────────────────────────────────────

    fn plan(&self, snap: &Snapshot) -> Result<Option<Transition>, SchedulerError> {
        if snap.is_finished() {
            return Ok(None);
        }
        let problems = snap.check_invariants();
        if !problems.is_empty() {
            return Err(SchedulerError::violation(
                "workflow",
                "one active phase and one active step",
                problems.join("; "),
            ));
        }
        match snap.active_phase() {
            Some(phase) => self.plan_phase(snap, phase),
            None => Ok(match snap.first_open_phase() {
                Some(next) => Some(Transition::ActivatePhase(next.clone())),
                None if snap.phases.is_empty() && snap.workflow.is_none() => None,
                None => Some(Transition::CompleteWorkflow(snap.workflow.clone())),
            }),
        }
    }

    fn plan_phase(
        &self,
        snap: &Snapshot,
        phase: &PhaseRow,
    ) -> Result<Option<Transition>, SchedulerError> {
        let steps = snap.steps_of(phase.index);
        let unstarted = steps.iter().all(|s| s.status == StepStatus::Pending);
        if unstarted && phase.skip_result.is_none() && self.skips.contains_key(&phase.index) {
            return Ok(Some(Transition::EvaluateSkip(phase.clone())));
        }

        if let Some(active) = steps.iter().find(|s| s.status == StepStatus::Active) {
            return Ok(self
                .reached_zero(snap, active)
                .then(|| Transition::CompleteStep(active.clone())));
        }

        let next = steps
            .iter()
            .filter(|s| s.status == StepStatus::Pending)
            .min_by_key(|s| s.index);
        match next {
            None => Ok(Some(Transition::CompletePhase(phase.clone()))),
            Some(step) if step.index == 0 => Ok(Some(Transition::ActivateStep(step.clone()))),
            Some(step) => {
                let predecessor = snap.step(phase.index, step.index - 1);
                if predecessor.is_some_and(|p| p.status == StepStatus::Completed) {
                    Ok(Some(Transition::ActivateStep(step.clone())))
                } else {
                    Err(SchedulerError::violation(
                        format!("step {}", step.id()),
                        "predecessor completed",
                        predecessor
                            .map(|p| format!("step {} {}", p.id(), p.status))
                            .unwrap_or_else(|| "no predecessor row".to_string()),
                    ))
                }
            }
        }
    }

    /// Whether an Active step's outstanding task count just dropped to zero.
    fn reached_zero(&self, snap: &Snapshot, step: &StepRow) -> bool {
        let now = snap.task_count(step.phase_index, step.index);
        if !now.drained() {
            return false;
        }
        match &self.previous {
            None => true,
            Some(prev) => {
                let was_active = prev
                    .step(step.phase_index, step.index)
                    .is_some_and(|s| s.status == StepStatus::Active);
                !(was_active && prev.task_count(step.phase_index, step.index) == now)
            }
        }
    }

    // ── Applying ──────────────────────────────────────────────────────

    fn apply(&self, snap: &Snapshot, transition: Transition) -> Result<Applied, SchedulerError> {
        let (applied, event) = match transition {
            Transition::ActivatePhase(phase) => (
                self.cas_phase(&phase, phase.with_status(PhaseStatus::Active))?,
                Some(SchedulerEvent::PhaseActivated { phase: phase.index }),
            ),
            Transition::EvaluateSkip(phase) => {
                let skip = self
                    .skips
                    .get(&phase.index)
                    .is_some_and(|predicate| (predicate.as_ref())(snap));
                (
                    self.record_skip(&phase, skip)?,
                    skip.then_some(SchedulerEvent::PhaseSkipped { phase: phase.index }),
                )
            }
            Transition::CompletePhase(phase) => (
                self.cas_phase(&phase, phase.with_status(PhaseStatus::Completed))?,
                Some(SchedulerEvent::PhaseCompleted { phase: phase.index }),
            ),
            Transition::ActivateStep(step) => (
                self.cas_step(&step, StepStatus::Active)?,
                Some(SchedulerEvent::StepActivated {
                    phase: step.phase_index,
                    step: step.index,
                }),
            ),
            Transition::CompleteStep(step) => (
                self.cas_step(&step, StepStatus::Completed)?,
                Some(SchedulerEvent::StepCompleted {
                    phase: step.phase_index,
                    step: step.index,
                }),
            ),
            Transition::CompleteWorkflow(current) => {
                let next = Record::Workflow(WorkflowRow {
                    status: WorkflowStatus::Completed,
                });
                let expected = current.map(Record::Workflow);
                (
                    self.store
                        .compare_and_swap(&next, expected.as_ref())?
                        .is_applied(),
                    Some(SchedulerEvent::WorkflowCompleted),
                )
            }
        };
        Ok(match (applied, event) {
            (false, _) => Applied::Lost,
            (true, Some(event)) => Applied::Event(event),
            (true, None) => Applied::Silent,
        })
    }

    /// Persist a skip outcome in `skip_result`, moving the phase to Skipped
    /// when `skip` is true. Returns whether the write applied.
    fn record_skip(&self, phase: &PhaseRow, skip: bool) -> Result<bool, SchedulerError> {
        let next = PhaseRow {
            status: if skip {
                PhaseStatus::Skipped
            } else {
                PhaseStatus::Active
            },
            skip_result: Some(skip),
            ..phase.clone()
        };
        let applied = self.cas_phase(phase, next)?;
        debug!(phase = phase.index, skip, applied, "skip predicate evaluated");
        Ok(applied)
    }

    fn cas_phase(&self, current: &PhaseRow, next: PhaseRow) -> Result<bool, StoreError> {
        let outcome = self.store.compare_and_swap(
            &Record::Phase(next),
            Some(&Record::Phase(current.clone())),
        )?;
        Ok(matches!(outcome, CasOutcome::Applied))
    }

    fn cas_step(&self, current: &StepRow, status: StepStatus) -> Result<bool, StoreError> {
        let outcome = self.store.compare_and_swap(
            &Record::Step(current.with_status(status)),
            Some(&Record::Step(current.clone())),
        )?;
        Ok(matches!(outcome, CasOutcome::Applied))
    }

    fn note_conflict(&self, report: &mut TickReport) -> Result<(), SchedulerError> {
        report.conflicts += 1;
        debug!(conflicts = report.conflicts, "transition lost a race; re-reading");
        if report.conflicts > self.config.max_conflict_retries {
            warn!(attempts = report.conflicts, "conflict limit reached");
            return Err(SchedulerError::ConflictLimit {
                attempts: report.conflicts,
            });
        }
        Ok(())
    }

    fn emit(&self, event: SchedulerEvent, report: &mut TickReport) {
        match &event {
            SchedulerEvent::PhaseActivated { phase } => {
                info!(phase, name = %self.shape.name_of(*phase), "phase activated")
            }
            SchedulerEvent::PhaseSkipped { phase } => info!(phase, "phase skipped"),
            SchedulerEvent::PhaseCompleted { phase } => info!(phase, "phase completed"),
            SchedulerEvent::StepActivated { phase, step } => info!(phase, step, "step activated"),
            SchedulerEvent::StepCompleted { phase, step } => info!(phase, step, "step completed"),
            SchedulerEvent::WorkflowCompleted => info!("workflow completed"),
        }
        if let Some(tx) = &self.events
            && tx.send(event.clone()).is_err()
            && !self.events_closed.swap(true, Ordering::Relaxed)
        {
            debug!("event receiver dropped; events no longer forwarded");
        }
        report.events.push(event);
    }
}

fn check_unstarted(snap: &Snapshot, phase: &PhaseRow) -> Result<(), SchedulerError> {
    match snap
        .steps_of(phase.index)
        .iter()
        .find(|s| s.status != StepStatus::Pending)
    {
        Some(step) => Err(reject(
            format!("phase {}", phase.index),
            "no step started before skip evaluation",
            format!("step {} {}", step.id(), step.status),
        )),
        None => Ok(()),
    }
}

fn reject(
    entity: impl Into<String>,
    expected: impl Into<String>,
    found: impl Into<String>,
) -> SchedulerError {
    let e = SchedulerError::violation(entity, expected, found);
    error!(error = %e, "invariant violation");
    e
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DispatchPolicy, QueueConfig};
    use crate::store::{TaskRow, TaskStatus, step_id};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    fn scheduler(store: &Store, shape: WorkflowShape) -> Scheduler {
        let s = Scheduler::new(store.clone(), shape, SchedulerConfig::default());
        s.initialize().unwrap();
        s
    }

    fn add_task(store: &Store, id: &str, phase: u32, step: u32) {
        let task = TaskRow::new(id, Some(step_id(phase, step))).with_status(TaskStatus::Running);
        assert!(store.insert_if_absent(&Record::Task(task)).unwrap().is_applied());
    }

    fn finish_task(store: &Store, id: &str) {
        let current = store.get(&crate::store::RowKey::task(id)).unwrap().unwrap();
        let task = current.as_task().unwrap().with_status(TaskStatus::Completed);
        let outcome = store
            .compare_and_swap(&Record::Task(task), Some(&current))
            .unwrap();
        assert!(outcome.is_applied());
    }

    fn phase_status(s: &Scheduler, index: u32) -> PhaseStatus {
        s.snapshot().unwrap().phase(index).unwrap().status
    }

    fn step_status(s: &Scheduler, phase: u32, step: u32) -> StepStatus {
        s.snapshot().unwrap().step(phase, step).unwrap().status
    }

    fn activate_phase_only(store: &Store, index: u32) {
        let pending = Record::Phase(PhaseRow::pending(index));
        let active = Record::Phase(PhaseRow::pending(index).with_status(PhaseStatus::Active));
        assert!(store.compare_and_swap(&active, Some(&pending)).unwrap().is_applied());
    }

    #[test]
    fn test_three_phases_run_to_completion() {
        let store = Store::open_in_memory().unwrap();
        let mut s = scheduler(&store, WorkflowShape::uniform(3, 1));

        let report = s.tick().unwrap();
        assert_eq!(
            report.events,
            vec![
                SchedulerEvent::PhaseActivated { phase: 0 },
                SchedulerEvent::StepActivated { phase: 0, step: 0 },
            ]
        );
        assert!(!report.finished);

        for phase in 0..3 {
            assert_eq!(phase_status(&s, phase), PhaseStatus::Active);
            assert_eq!(step_status(&s, phase, 0), StepStatus::Active);
            let task = format!("task-{}", phase);
            add_task(&store, &task, phase, 0);
            assert!(s.tick().unwrap().events.is_empty());

            finish_task(&store, &task);
            let report = s.tick().unwrap();
            assert_eq!(report.events[0], SchedulerEvent::StepCompleted { phase, step: 0 });
            assert_eq!(report.events[1], SchedulerEvent::PhaseCompleted { phase });
            if phase < 2 {
                assert_eq!(report.events[2], SchedulerEvent::PhaseActivated { phase: phase + 1 });
                assert_eq!(
                    report.events[3],
                    SchedulerEvent::StepActivated { phase: phase + 1, step: 0 }
                );
            } else {
                assert_eq!(report.events[2], SchedulerEvent::WorkflowCompleted);
                assert!(report.finished);
            }
            assert!(s.snapshot().unwrap().check_invariants().is_empty());
        }

        let snap = s.snapshot().unwrap();
        assert!(snap.phases.iter().all(|p| p.status == PhaseStatus::Completed));
        assert!(snap.active_phase().is_none());
        assert!(snap.active_step().is_none());
        assert!(snap.is_finished());
        assert!(s.tick().unwrap().events.is_empty());
    }

    #[test]
    fn test_tick_continues_after_event_receiver_dropped() {
        let store = Store::open_in_memory().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let shape = WorkflowShape::uniform(2, 1);
        let mut s =
            Scheduler::new(store.clone(), shape, SchedulerConfig::default()).with_events(tx);
        s.initialize().unwrap();
        drop(rx);

        let report = s.tick().unwrap();
        assert_eq!(report.events.len(), 2);
        add_task(&store, "t-1", 0, 0);
        s.tick().unwrap();
        finish_task(&store, "t-1");
        let report = s.tick().unwrap();
        assert!(report.events.contains(&SchedulerEvent::PhaseActivated { phase: 1 }));
        assert_eq!(phase_status(&s, 0), PhaseStatus::Completed);
    }

    #[test]
    fn test_steps_within_phase_run_in_order() {
        let store = Store::open_in_memory().unwrap();
        let mut s = scheduler(&store, WorkflowShape::from_steps(&[3]));
        s.tick().unwrap();
        for step in 0..3 {
            assert_eq!(step_status(&s, 0, step), StepStatus::Active);
            for later in step + 1..3 {
                assert_eq!(step_status(&s, 0, later), StepStatus::Pending);
            }
            let task = format!("t{}", step);
            add_task(&store, &task, 0, step);
            finish_task(&store, &task);
            s.tick().unwrap();
            assert_eq!(step_status(&s, 0, step), StepStatus::Completed);
        }
        assert!(s.snapshot().unwrap().is_finished());
    }

    #[test]
    fn test_reinitialize_never_resets_progress() {
        let store = Store::open_in_memory().unwrap();
        let shape = WorkflowShape::uniform(2, 2);
        let mut s = scheduler(&store, shape.clone());
        s.tick().unwrap();
        add_task(&store, "a", 0, 0);
        finish_task(&store, "a");
        s.tick().unwrap();
        let before = s.snapshot().unwrap();

        let again = Scheduler::new(store.clone(), shape, SchedulerConfig::default());
        assert_eq!(again.initialize().unwrap(), 0);
        let after = again.snapshot().unwrap();
        assert_eq!(before.phases, after.phases);
        assert_eq!(before.steps, after.steps);
        assert_eq!(step_status(&again, 0, 0), StepStatus::Completed);
        assert_eq!(step_status(&again, 0, 1), StepStatus::Active);
    }

    #[test]
    fn test_resume_completes_step_whose_tasks_finished_while_down() {
        let store = Store::open_in_memory().unwrap();
        let shape = WorkflowShape::uniform(2, 1);
        let mut first = scheduler(&store, shape.clone());
        first.tick().unwrap();
        add_task(&store, "a", 0, 0);
        drop(first);
        // The task finishes while no scheduler is running.
        finish_task(&store, "a");

        let mut resumed = scheduler(&store, shape);
        let report = resumed.tick().unwrap();
        assert_eq!(report.events[0], SchedulerEvent::StepCompleted { phase: 0, step: 0 });
        assert_eq!(phase_status(&resumed, 1), PhaseStatus::Active);
        assert_eq!(step_status(&resumed, 1, 0), StepStatus::Active);
    }

    #[test]
    fn test_redundant_ticks_fire_each_activation_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.db");
        let shape = WorkflowShape::uniform(2, 2);
        let (tx, mut rx) = mpsc::unbounded_channel();
        // Two handles on one file stand in for two processes.
        let mut a = scheduler(&Store::open(&path).unwrap(), shape.clone()).with_events(tx.clone());
        let mut b = scheduler(&Store::open(&path).unwrap(), shape).with_events(tx);
        let store = Store::open(&path).unwrap();

        let mut tasks = 0;
        for _ in 0..50 {
            a.tick().unwrap();
            b.tick().unwrap();
            a.tick().unwrap();
            let snap = a.snapshot().unwrap();
            assert!(snap.check_invariants().is_empty());
            if snap.is_finished() {
                break;
            }
            if let Some(step) = snap.active_step() {
                let id = format!("t{}", tasks);
                tasks += 1;
                add_task(&store, &id, step.phase_index, step.index);
                b.tick().unwrap();
                finish_task(&store, &id);
            }
        }

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        for phase in 0..2 {
            for step in 0..2 {
                let activations = events
                    .iter()
                    .filter(|e| **e == SchedulerEvent::StepActivated { phase, step })
                    .count();
                assert_eq!(activations, 1, "step {}:{} activated {} times", phase, step, activations);
            }
        }
        let completions = events
            .iter()
            .filter(|e| **e == SchedulerEvent::WorkflowCompleted)
            .count();
        assert_eq!(completions, 1);
    }

    #[test]
    fn test_evaluate_skip_on_inactive_phase_is_noop() {
        let store = Store::open_in_memory().unwrap();
        let mut s = scheduler(&store, WorkflowShape::uniform(3, 1));
        s.tick().unwrap();

        assert_eq!(s.evaluate_skip(1, |_| true).unwrap(), None);
        assert_eq!(phase_status(&s, 1), PhaseStatus::Pending);
        assert_eq!(s.snapshot().unwrap().phase(1).unwrap().skip_result, None);
        assert!(matches!(
            s.evaluate_skip(9, |_| true),
            Err(SchedulerError::UnknownPhase { index: 9 })
        ));
    }

    #[test]
    fn test_evaluate_skip_skips_active_phase_and_activates_next() {
        let store = Store::open_in_memory().unwrap();
        let mut s = scheduler(&store, WorkflowShape::uniform(2, 1));
        activate_phase_only(&store, 0);

        assert_eq!(s.evaluate_skip(0, |_| true).unwrap(), Some(true));
        assert_eq!(phase_status(&s, 0), PhaseStatus::Skipped);
        assert_eq!(step_status(&s, 0, 0), StepStatus::Pending);
        assert_eq!(phase_status(&s, 1), PhaseStatus::Active);
        assert_eq!(step_status(&s, 1, 0), StepStatus::Active);
        assert_eq!(s.snapshot().unwrap().phase(0).unwrap().skip_result, Some(true));
    }

    #[test]
    fn test_evaluate_skip_after_step_started_is_violation() {
        let store = Store::open_in_memory().unwrap();
        let mut s = scheduler(&store, WorkflowShape::uniform(2, 1));
        s.tick().unwrap();
        let err = s.evaluate_skip(0, |_| true).unwrap_err();
        assert!(err.is_invariant_violation());
        assert_eq!(phase_status(&s, 0), PhaseStatus::Active);
    }

    #[test]
    fn test_registered_skip_predicate_is_evaluated_once() {
        let store = Store::open_in_memory().unwrap();
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = calls.clone();
        let mut s = scheduler(&store, WorkflowShape::uniform(3, 1)).with_skip(1, move |_| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            true
        });
        s.tick().unwrap();
        add_task(&store, "a", 0, 0);
        finish_task(&store, "a");
        let report = s.tick().unwrap();
        assert!(report.events.contains(&SchedulerEvent::PhaseSkipped { phase: 1 }));
        assert_eq!(phase_status(&s, 1), PhaseStatus::Skipped);
        assert_eq!(step_status(&s, 1, 0), StepStatus::Pending);
        assert_eq!(phase_status(&s, 2), PhaseStatus::Active);
        s.tick().unwrap();
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_registered_skip_false_lets_phase_run() {
        let store = Store::open_in_memory().unwrap();
        let mut s = scheduler(&store, WorkflowShape::uniform(1, 1)).with_skip(0, |_| false);
        let report = s.tick().unwrap();
        assert_eq!(
            report.events,
            vec![
                SchedulerEvent::PhaseActivated { phase: 0 },
                SchedulerEvent::StepActivated { phase: 0, step: 0 },
            ]
        );
        assert_eq!(s.snapshot().unwrap().phase(0).unwrap().skip_result, Some(false));
    }

    #[test]
    fn test_complete_step_with_outstanding_tasks_is_rejected() {
        let store = Store::open_in_memory().unwrap();
        let mut s = scheduler(&store, WorkflowShape::uniform(1, 1));
        s.tick().unwrap();
        add_task(&store, "a", 0, 0);
        add_task(&store, "b", 0, 0);
        finish_task(&store, "a");

        let before = store.changes_since(0, 1000).unwrap().len();
        match s.complete_step(0, 0) {
            Err(SchedulerError::InvariantViolation { found, .. }) => {
                assert_eq!(found, "1 outstanding")
            }
            other => panic!("expected InvariantViolation, got {:?}", other),
        }
        assert_eq!(store.changes_since(0, 1000).unwrap().len(), before);
        assert_eq!(step_status(&s, 0, 0), StepStatus::Active);
    }

    #[test]
    fn test_complete_step_requires_active_step() {
        let store = Store::open_in_memory().unwrap();
        let mut s = scheduler(&store, WorkflowShape::uniform(1, 2));
        s.tick().unwrap();
        assert!(s.complete_step(0, 1).unwrap_err().is_invariant_violation());
        assert!(matches!(
            s.complete_step(0, 7),
            Err(SchedulerError::UnknownStep { phase: 0, step: 7 })
        ));
    }

    #[test]
    fn test_step_without_tasks_completes_only_explicitly() {
        let store = Store::open_in_memory().unwrap();
        let mut s = scheduler(&store, WorkflowShape::uniform(2, 1));
        s.tick().unwrap();
        for _ in 0..3 {
            assert!(s.tick().unwrap().events.is_empty());
        }
        let report = s.complete_step(0, 0).unwrap();
        assert_eq!(
            report.events,
            vec![
                SchedulerEvent::StepCompleted { phase: 0, step: 0 },
                SchedulerEvent::PhaseCompleted { phase: 0 },
                SchedulerEvent::PhaseActivated { phase: 1 },
                SchedulerEvent::StepActivated { phase: 1, step: 0 },
            ]
        );
    }

    #[test]
    fn test_complete_phase_requires_completed_steps() {
        let store = Store::open_in_memory().unwrap();
        let mut s = scheduler(&store, WorkflowShape::uniform(2, 1));
        s.tick().unwrap();
        assert!(s.complete_phase(0).unwrap_err().is_invariant_violation());
        assert!(s.complete_phase(1).unwrap_err().is_invariant_violation());
        assert_eq!(phase_status(&s, 0), PhaseStatus::Active);
        assert_eq!(phase_status(&s, 1), PhaseStatus::Pending);
    }

    #[test]
    fn test_two_active_phases_abort_tick_without_writes() {
        let store = Store::open_in_memory().unwrap();
        let mut s = scheduler(&store, WorkflowShape::uniform(2, 1));
        activate_phase_only(&store, 0);
        activate_phase_only(&store, 1);
        let before = store.changes_since(0, 1000).unwrap().len();
        assert!(s.tick().unwrap_err().is_invariant_violation());
        assert_eq!(store.changes_since(0, 1000).unwrap().len(), before);
    }

    #[test]
    fn test_empty_phase_completes_on_activation() {
        let store = Store::open_in_memory().unwrap();
        let mut s = scheduler(&store, WorkflowShape::from_steps(&[0, 1]));
        let report = s.tick().unwrap();
        assert_eq!(
            report.events,
            vec![
                SchedulerEvent::PhaseActivated { phase: 0 },
                SchedulerEvent::PhaseCompleted { phase: 0 },
                SchedulerEvent::PhaseActivated { phase: 1 },
                SchedulerEvent::StepActivated { phase: 1, step: 0 },
            ]
        );
    }

    #[tokio::test]
    async fn test_run_drives_workflow_to_completion() {
        let store = Store::open_in_memory().unwrap();
        let config = SchedulerConfig {
            poll_interval_ms: 20,
            ..SchedulerConfig::default()
        };
        let queue = OperationQueue::new(
            store.clone(),
            QueueConfig::default().with_policy("vcs", DispatchPolicy::Batched),
        );
        let op = queue.enqueue("vcs", json!({ "commit": "wip" })).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let s = Scheduler::new(store.clone(), WorkflowShape::uniform(2, 1), config)
            .with_events(tx)
            .with_queue(queue.clone());
        s.initialize().unwrap();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(s.run(stop_rx));

        // Play the task-producing collaborator.
        let mut finished = 0;
        while let Some(event) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
        {
            match event {
                SchedulerEvent::StepActivated { phase, step } => {
                    let id = format!("t{}", phase);
                    let store = store.clone();
                    tokio::task::spawn_blocking(move || {
                        add_task(&store, &id, phase, step);
                        finish_task(&store, &id);
                    })
                    .await
                    .unwrap();
                    finished += 1;
                }
                SchedulerEvent::WorkflowCompleted => break,
                _ => {}
            }
        }

        handle.await.unwrap().unwrap();
        assert_eq!(finished, 2);
        assert!(queue.boundary() >= op);
        assert!(Snapshot::read(&store).unwrap().is_finished());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let store = Store::open_in_memory().unwrap();
        let s = Scheduler::new(store, WorkflowShape::uniform(1, 1), SchedulerConfig::default());
        s.initialize().unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(s.run(stop_rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
