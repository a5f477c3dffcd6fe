// Run lifecycle tracking.
//
// A run is bound to its owning user when it is begun; that binding is the
// only routing truth the emitter ever consults. Stage transitions follow
// `STARTED → THINKING → (EXECUTING_TOOL → TOOL_RESULT)* → COMPLETED` and
// violations are typed errors, never silently delivered.

pub mod emitter;
pub mod sequencer;

pub use self::emitter::{DeliveryOutcome, EmittedEvent, EventEmitter};
pub use self::sequencer::RunSequencer;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use parley_common::types::RunStage;
use uuid::Uuid;

/// Kind-specific content for a lifecycle event.
///
/// Deliberately carries no user id: the destination is resolved from the run
/// registry's own binding, so a crafted payload cannot re-route an event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Thinking { text: String },
    ExecutingTool { invocation_id: Uuid, tool_name: String, arguments: serde_json::Value },
    ToolResult { invocation_id: Uuid, output: serde_json::Value },
    Completed,
}

impl EventPayload {
    pub fn stage(&self) -> RunStage {
        match self {
            Self::Thinking { .. } => RunStage::Thinking,
            Self::ExecutingTool { .. } => RunStage::ExecutingTool,
            Self::ToolResult { .. } => RunStage::ToolResult,
            Self::Completed => RunStage::Completed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EmitError {
    #[error("run {0} is not known to this gateway")]
    UnknownRun(Uuid),
    #[error("run {0} already exists")]
    DuplicateRun(Uuid),
    #[error("run {0} has already completed; no further events are valid")]
    RunCompleted(Uuid),
    #[error("tool result on run {run_id} has no matching executing_tool for invocation {invocation_id}")]
    UnmatchedToolResult { run_id: Uuid, invocation_id: Uuid },
}

/// One tracked run.
#[derive(Debug)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub thread_id: Uuid,
    pub user_id: Uuid,
    pub stage: RunStage,
    open_invocations: HashSet<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl RunRecord {
    /// Validates and records a stage transition.
    pub fn apply(&mut self, payload: &EventPayload) -> Result<(), EmitError> {
        if self.stage.is_terminal() {
            return Err(EmitError::RunCompleted(self.run_id));
        }

        match payload {
            EventPayload::Thinking { .. } => {
                self.stage = RunStage::Thinking;
            }
            EventPayload::ExecutingTool { invocation_id, .. } => {
                self.open_invocations.insert(*invocation_id);
                self.stage = RunStage::ExecutingTool;
            }
            EventPayload::ToolResult { invocation_id, .. } => {
                if !self.open_invocations.remove(invocation_id) {
                    return Err(EmitError::UnmatchedToolResult {
                        run_id: self.run_id,
                        invocation_id: *invocation_id,
                    });
                }
                self.stage = RunStage::ToolResult;
            }
            EventPayload::Completed => {
                self.stage = RunStage::Completed;
            }
        }

        Ok(())
    }
}

/// Tracks every run and its owning user.
///
/// Records are handed out behind per-run mutexes so the emitter can
/// validate, sequence and dispatch one event in a single critical section
/// without serializing unrelated runs.
#[derive(Debug, Default)]
pub struct RunRegistry {
    runs: RwLock<HashMap<Uuid, Arc<Mutex<RunRecord>>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begins tracking a run owned by `user_id`.
    pub fn begin(&self, run_id: Uuid, thread_id: Uuid, user_id: Uuid) -> Result<(), EmitError> {
        let mut runs = self.runs.write().expect("run registry lock poisoned");
        if runs.contains_key(&run_id) {
            return Err(EmitError::DuplicateRun(run_id));
        }
        runs.insert(
            run_id,
            Arc::new(Mutex::new(RunRecord {
                run_id,
                thread_id,
                user_id,
                stage: RunStage::Started,
                open_invocations: HashSet::new(),
                created_at: Utc::now(),
            })),
        );
        Ok(())
    }

    pub fn record(&self, run_id: Uuid) -> Option<Arc<Mutex<RunRecord>>> {
        self.runs.read().expect("run registry lock poisoned").get(&run_id).cloned()
    }

    /// The authoritative owner binding for a run.
    pub fn owner_of(&self, run_id: Uuid) -> Option<Uuid> {
        self.record(run_id)
            .map(|record| record.lock().expect("run record lock poisoned").user_id)
    }

    pub fn stage_of(&self, run_id: Uuid) -> Option<RunStage> {
        self.record(run_id)
            .map(|record| record.lock().expect("run record lock poisoned").stage)
    }

    pub fn run_count(&self) -> usize {
        self.runs.read().expect("run registry lock poisoned").len()
    }
}
