// The event sequencer/emitter. There is exactly one emitter implementation;
// every lifecycle frame the gateway ever sends goes through it.
//
// Ordering: validation, sequence assignment and channel dispatch happen in
// one synchronous critical section under the run's lock, so the per-run
// stream observed by a connection is monotonic and gapless. The durable
// outbox mirror is written after the lock is released.

use std::sync::Arc;

use chrono::Utc;
use parley_common::protocol::ws::WsMessage;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

use crate::metrics;
use crate::outbox::OutboxManager;
use crate::registry::ConnectionRegistry;
use crate::run::{EmitError, EventPayload, RunRegistry, RunSequencer};

/// Where an emitted event went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Sent to this many live connections.
    Delivered(usize),
    /// No live connection could take it; queued in the outbox.
    Queued,
}

/// An accepted lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmittedEvent {
    pub seq: i64,
    pub outcome: DeliveryOutcome,
}

pub struct EventEmitter {
    runs: Arc<RunRegistry>,
    sequencer: Arc<RunSequencer>,
    registry: Arc<ConnectionRegistry>,
    outbox: Arc<OutboxManager>,
}

impl EventEmitter {
    pub fn new(
        runs: Arc<RunRegistry>,
        sequencer: Arc<RunSequencer>,
        registry: Arc<ConnectionRegistry>,
        outbox: Arc<OutboxManager>,
    ) -> Self {
        Self { runs, sequencer, registry, outbox }
    }

    pub fn runs(&self) -> &Arc<RunRegistry> {
        &self.runs
    }

    /// Accepts a new run for `user_id` and emits `started`.
    pub async fn begin_run(
        &self,
        run_id: Uuid,
        thread_id: Uuid,
        user_id: Uuid,
    ) -> Result<EmittedEvent, EmitError> {
        let span = info_span!("gateway.emitter.begin_run", run_id = %run_id);
        async move {
            self.runs.begin(run_id, thread_id, user_id)?;
            let record = self.runs.record(run_id).ok_or(EmitError::UnknownRun(run_id))?;

            let (seq, outcome, queued) = {
                let _run = record.lock().expect("run record lock poisoned");
                let seq = self.sequencer.next_seq(run_id);
                let message = WsMessage::Started {
                    run_id,
                    user_id,
                    seq,
                    ts: Utc::now().to_rfc3339(),
                    thread_id,
                };
                let (outcome, queued) = self.dispatch(user_id, message);
                (seq, outcome, queued)
            };

            if let Some((entry_id, message)) = queued {
                self.outbox.persist(user_id, entry_id, &message).await;
            }

            Ok(EmittedEvent { seq, outcome })
        }
        .instrument(span)
        .await
    }

    /// Emits a lifecycle event for a run.
    ///
    /// The destination is resolved purely from the run registry's owner
    /// binding; nothing in `payload` can influence routing.
    pub async fn emit(
        &self,
        run_id: Uuid,
        payload: EventPayload,
    ) -> Result<EmittedEvent, EmitError> {
        let span = info_span!(
            "gateway.emitter.emit",
            run_id = %run_id,
            stage = payload.stage().as_str()
        );
        async move {
            let record = self.runs.record(run_id).ok_or(EmitError::UnknownRun(run_id))?;

            let (user_id, seq, outcome, queued, completed) = {
                let mut run = record.lock().expect("run record lock poisoned");
                run.apply(&payload)?;
                let user_id = run.user_id;
                let seq = self.sequencer.next_seq(run_id);
                let message = build_message(run_id, user_id, seq, payload);
                let (outcome, queued) = self.dispatch(user_id, message);
                (user_id, seq, outcome, queued, run.stage.is_terminal())
            };

            if completed {
                self.sequencer.release(run_id);
            }
            if let Some((entry_id, message)) = queued {
                self.outbox.persist(user_id, entry_id, &message).await;
            }

            Ok(EmittedEvent { seq, outcome })
        }
        .instrument(span)
        .await
    }

    /// Delivers to the user's live connections, or hands the event to the
    /// outbox. Best-effort with persistence, never fire-and-forget.
    ///
    /// While the user has a backlog, new events also go through the outbox
    /// so replay order survives the reconnect handoff.
    fn dispatch(
        &self,
        user_id: Uuid,
        message: WsMessage,
    ) -> (DeliveryOutcome, Option<(i64, WsMessage)>) {
        let message_type = message.message_type();

        if self.outbox.has_pending(user_id) {
            let entry_id = self.outbox.enqueue(user_id, message.clone());
            debug!(user_id = %user_id, message_type, "queued behind existing backlog");
            return (DeliveryOutcome::Queued, Some((entry_id, message)));
        }

        let handles = self.registry.lookup(user_id);
        let mut delivered = 0;
        for handle in &handles {
            if handle.send(message.clone()).is_ok() {
                delivered += 1;
            }
        }

        if delivered == 0 {
            let entry_id = self.outbox.enqueue(user_id, message.clone());
            debug!(user_id = %user_id, message_type, "no live connection; queued to outbox");
            (DeliveryOutcome::Queued, Some((entry_id, message)))
        } else {
            metrics::record_ws_message(message_type, false);
            (DeliveryOutcome::Delivered(delivered), None)
        }
    }
}

fn build_message(run_id: Uuid, user_id: Uuid, seq: i64, payload: EventPayload) -> WsMessage {
    let ts = Utc::now().to_rfc3339();
    match payload {
        EventPayload::Thinking { text } => WsMessage::Thinking { run_id, user_id, seq, ts, text },
        EventPayload::ExecutingTool { invocation_id, tool_name, arguments } => {
            WsMessage::ExecutingTool { run_id, user_id, seq, ts, invocation_id, tool_name, arguments }
        }
        EventPayload::ToolResult { invocation_id, output } => {
            WsMessage::ToolResult { run_id, user_id, seq, ts, invocation_id, output }
        }
        EventPayload::Completed => WsMessage::Completed { run_id, user_id, seq, ts },
    }
}
