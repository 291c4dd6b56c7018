use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tables backing the engine. Names match the SQL table names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Phases,
    Steps,
    Tasks,
    Operations,
    SingletonLock,
    Workflow,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Phases => "phases",
            Self::Steps => "steps",
            Self::Tasks => "tasks",
            Self::Operations => "operations",
            Self::SingletonLock => "singleton_lock",
            Self::Workflow => "workflow",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Table {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "phases" => Ok(Self::Phases),
            "steps" => Ok(Self::Steps),
            "tasks" => Ok(Self::Tasks),
            "operations" => Ok(Self::Operations),
            "singleton_lock" => Ok(Self::SingletonLock),
            "workflow" => Ok(Self::Workflow),
            _ => Err(format!("Invalid table: {}", s)),
        }
    }
}

/// Identity of a single row: its table plus the primary key rendered as text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowKey {
    pub table: Table,
    pub key: String,
}

impl RowKey {
    pub fn new(table: Table, key: impl Into<String>) -> Self {
        Self {
            table,
            key: key.into(),
        }
    }

    pub fn phase(index: u32) -> Self {
        Self::new(Table::Phases, index.to_string())
    }

    pub fn step(phase_index: u32, index: u32) -> Self {
        Self::new(Table::Steps, step_id(phase_index, index))
    }

    pub fn task(id: &str) -> Self {
        Self::new(Table::Tasks, id)
    }

    pub fn operation(id: i64) -> Self {
        Self::new(Table::Operations, id.to_string())
    }

    pub fn lock(resource_id: &str) -> Self {
        Self::new(Table::SingletonLock, resource_id)
    }

    pub fn workflow() -> Self {
        Self::new(Table::Workflow, WORKFLOW_KEY)
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table, self.key)
    }
}

pub(crate) const WORKFLOW_KEY: &str = "0";

/// Canonical step identifier used by `tasks.step_id`.
pub fn step_id(phase_index: u32, index: u32) -> String {
    format!("{}:{}", phase_index, index)
}

/// Inverse of [`step_id`].
pub fn parse_step_id(id: &str) -> Option<(u32, u32)> {
    let (phase, step) = id.split_once(':')?;
    Some((phase.parse().ok()?, step.parse().ok()?))
}

macro_rules! status_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    _ => Err(format!("Invalid {}: {}", stringify!($name), s)),
                }
            }
        }
    };
}

status_enum!(
    /// Phase lifecycle. Skipped and Completed are terminal.
    PhaseStatus {
        Pending => "pending",
        Active => "active",
        Skipped => "skipped",
        Completed => "completed",
    }
);

status_enum!(
    /// Step lifecycle. Completed is terminal.
    StepStatus {
        Pending => "pending",
        Active => "active",
        Completed => "completed",
    }
);

status_enum!(TaskStatus {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
});

status_enum!(OperationStatus {
    Pending => "pending",
    Running => "running",
    Done => "done",
    Failed => "failed",
});

status_enum!(LockStatus {
    Idle => "idle",
    Claimed => "claimed",
    Stale => "stale",
});

status_enum!(WorkflowStatus {
    Running => "running",
    Completed => "completed",
});

impl PhaseStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Skipped | Self::Completed)
    }
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseRow {
    pub index: u32,
    pub status: PhaseStatus,
    /// Outcome of the skip predicate; `None` until it has been evaluated.
    pub skip_result: Option<bool>,
}

impl PhaseRow {
    pub fn pending(index: u32) -> Self {
        Self {
            index,
            status: PhaseStatus::Pending,
            skip_result: None,
        }
    }

    pub fn with_status(&self, status: PhaseStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRow {
    pub phase_index: u32,
    pub index: u32,
    pub status: StepStatus,
}

impl StepRow {
    pub fn pending(phase_index: u32, index: u32) -> Self {
        Self {
            phase_index,
            index,
            status: StepStatus::Pending,
        }
    }

    pub fn id(&self) -> String {
        step_id(self.phase_index, self.index)
    }

    pub fn with_status(&self, status: StepStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRow {
    pub id: String,
    pub step_id: Option<String>,
    pub status: TaskStatus,
}

impl TaskRow {
    pub fn new(id: impl Into<String>, step_id: Option<String>) -> Self {
        Self {
            id: id.into(),
            step_id,
            status: TaskStatus::Pending,
        }
    }

    pub fn with_status(&self, status: TaskStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRow {
    pub id: i64,
    pub kind: String,
    pub payload: serde_json::Value,
    pub status: OperationStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRow {
    pub resource_id: String,
    pub status: LockStatus,
    pub holder_id: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl LockRow {
    pub fn idle(resource_id: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            status: LockStatus::Idle,
            holder_id: None,
            claimed_at: None,
            last_heartbeat: None,
        }
    }

    pub fn claimed(resource_id: impl Into<String>, holder: &str, at: DateTime<Utc>) -> Self {
        Self {
            resource_id: resource_id.into(),
            status: LockStatus::Claimed,
            holder_id: Some(holder.to_string()),
            claimed_at: Some(at),
            last_heartbeat: Some(at),
        }
    }

    pub fn is_held_by(&self, holder: &str) -> bool {
        self.status == LockStatus::Claimed && self.holder_id.as_deref() == Some(holder)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRow {
    pub status: WorkflowStatus,
}

/// A row of any table. This is the unit of reads, CAS writes and change
/// notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "table", content = "row", rename_all = "snake_case")]
pub enum Record {
    Phase(PhaseRow),
    Step(StepRow),
    Task(TaskRow),
    Operation(OperationRow),
    Lock(LockRow),
    Workflow(WorkflowRow),
}

impl Record {
    pub fn table(&self) -> Table {
        match self {
            Self::Phase(_) => Table::Phases,
            Self::Step(_) => Table::Steps,
            Self::Task(_) => Table::Tasks,
            Self::Operation(_) => Table::Operations,
            Self::Lock(_) => Table::SingletonLock,
            Self::Workflow(_) => Table::Workflow,
        }
    }

    pub fn key(&self) -> RowKey {
        match self {
            Self::Phase(p) => RowKey::phase(p.index),
            Self::Step(s) => RowKey::step(s.phase_index, s.index),
            Self::Task(t) => RowKey::task(&t.id),
            Self::Operation(o) => RowKey::operation(o.id),
            Self::Lock(l) => RowKey::lock(&l.resource_id),
            Self::Workflow(_) => RowKey::workflow(),
        }
    }

    /// Secondary grouping used by partition queries: steps by phase, tasks
    /// by step, operations by kind.
    pub fn partition(&self) -> Option<String> {
        match self {
            Self::Step(s) => Some(s.phase_index.to_string()),
            Self::Task(t) => t.step_id.clone(),
            Self::Operation(o) => Some(o.kind.clone()),
            _ => None,
        }
    }

    pub fn as_phase(&self) -> Option<&PhaseRow> {
        match self {
            Self::Phase(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_step(&self) -> Option<&StepRow> {
        match self {
            Self::Step(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_task(&self) -> Option<&TaskRow> {
        match self {
            Self::Task(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_operation(&self) -> Option<&OperationRow> {
        match self {
            Self::Operation(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_lock(&self) -> Option<&LockRow> {
        match self {
            Self::Lock(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_workflow(&self) -> Option<&WorkflowRow> {
        match self {
            Self::Workflow(w) => Some(w),
            _ => None,
        }
    }
}
