//! Component F: the effect runtime.
//!
//! A uniform execution surface for effects that send a request to a
//! collaborator (always the architect) and block the state handler until a
//! correlated response arrives. Shaped like the request/response lease
//! pattern in `lease.rs` elsewhere in this codebase
//! (`LeaseAcquisitionRequest`/`LeaseAcquisitionResponse` pairing) and
//! `ipc.rs`'s correlation-by-id message bus, narrowed to a single
//! "send-then-await-one-reply" shape — not full duplex IPC.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::error::{EffectError, EffectResult};
use crate::message::{ApprovalStatus, ApprovalType, Message, MessageType, Payload};

#[derive(Debug, Clone)]
pub enum Effect {
    Approval {
        content: String,
        reason: String,
        approval_type: ApprovalType,
        story_id: String,
    },
    Question {
        content: String,
        origin_state: String,
        story_id: String,
    },
    BudgetReview {
        content: String,
        origin_state: String,
        story_id: String,
        timeout: Duration,
    },
    /// Synchronous local signal only; no external wait.
    Completion {
        target_state: String,
        message: String,
    },
}

#[derive(Debug, Clone)]
pub enum EffectOutcome {
    Approval {
        status: ApprovalStatus,
        feedback: Option<String>,
    },
    Answer {
        text: String,
    },
    BudgetReview {
        feedback: Option<String>,
    },
    Completed,
}

/// Tracks in-flight correlation ids and lets the reply-receiving task
/// resolve them. Mirrors the "acquire returns a typed response" shape of
/// `lease.rs` elsewhere in this codebase, generalized to arbitrary reply
/// message types via a oneshot channel per correlation id.
pub struct EffectRuntime {
    agent_id: String,
    outbound: mpsc::Sender<Message>,
    pending: Mutex<HashMap<Uuid, oneshot::Sender<Message>>>,
    /// Enforces the critical invariant: at most one effect per agent in
    /// flight at any time.
    in_flight: Mutex<Option<Uuid>>,
}

impl EffectRuntime {
    pub fn new(agent_id: impl Into<String>, outbound: mpsc::Sender<Message>) -> Self {
        Self {
            agent_id: agent_id.into(),
            outbound,
            pending: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(None),
        }
    }

    /// Called by the inbound reply-pump task for every message read off the
    /// dispatcher's reply channel; routes it to the waiting `execute` call
    /// by correlation id (the `id` the request message carried).
    pub fn deliver_reply(&self, correlation_id: Uuid, reply: Message) -> bool {
        let sender = self.pending.lock().unwrap().remove(&correlation_id);
        match sender {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    pub fn has_pending(&self) -> bool {
        self.in_flight.lock().unwrap().is_some()
    }

    /// Executes an effect: serialises the request, sends it, and blocks
    /// awaiting the correlated reply (or times out, or observes
    /// cancellation). `CompletionEffect` is synchronous and never touches
    /// the channel.
    pub async fn execute(
        &self,
        effect: Effect,
        cancel: &tokio_util_cancel::CancelToken,
    ) -> EffectResult<EffectOutcome> {
        if let Effect::Completion { target_state, message } = effect {
            let _ = (target_state, message);
            return Ok(EffectOutcome::Completed);
        }

        if self.in_flight.lock().unwrap().is_some() {
            panic!("EffectRuntime invariant violated: an effect was already in flight");
        }

        let (message, story_id, timeout) = self.build_request(effect);
        let correlation_id = message.correlation_id();

        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(correlation_id, tx);
        *self.in_flight.lock().unwrap() = Some(correlation_id);
        let _ = story_id;

        let send_result = self.outbound.send(message).await;
        if send_result.is_err() {
            self.pending.lock().unwrap().remove(&correlation_id);
            *self.in_flight.lock().unwrap() = None;
            return Err(EffectError::ChannelClosed);
        }

        let wait = async {
            match timeout {
                Some(d) => tokio::time::timeout(d, rx)
                    .await
                    .map_err(|_| EffectError::Timeout(d))?
                    .map_err(|_| EffectError::ChannelClosed),
                None => rx.await.map_err(|_| EffectError::ChannelClosed),
            }
        };

        let result = tokio::select! {
            r = wait => r,
            _ = cancel.cancelled() => Err(EffectError::Cancelled),
        };

        self.pending.lock().unwrap().remove(&correlation_id);
        *self.in_flight.lock().unwrap() = None;

        let reply = result?;
        Self::decode_reply(reply)
    }

    fn build_request(&self, effect: Effect) -> (Message, String, Option<Duration>) {
        match effect {
            Effect::Approval {
                content,
                reason,
                approval_type,
                story_id,
            } => (
                Message::new(
                    MessageType::ApprovalRequest,
                    self.agent_id.clone(),
                    "architect",
                    Some(story_id.clone()),
                    Payload::ApprovalRequest {
                        content,
                        reason,
                        approval_type,
                        story_id: story_id.clone(),
                        extra: Default::default(),
                    },
                ),
                story_id,
                None,
            ),
            Effect::Question {
                content,
                origin_state,
                story_id,
            } => (
                Message::new(
                    MessageType::Question,
                    self.agent_id.clone(),
                    "architect",
                    Some(story_id.clone()),
                    Payload::Question {
                        content,
                        origin_state,
                        extra: Default::default(),
                    },
                ),
                story_id,
                None,
            ),
            Effect::BudgetReview {
                content,
                origin_state,
                story_id,
                timeout,
            } => (
                Message::new(
                    MessageType::BudgetReviewRequest,
                    self.agent_id.clone(),
                    "architect",
                    Some(story_id.clone()),
                    Payload::BudgetReviewRequest {
                        content,
                        origin_state,
                        story_id: story_id.clone(),
                        extra: Default::default(),
                    },
                ),
                story_id,
                Some(timeout),
            ),
            Effect::Completion { .. } => unreachable!("handled before build_request"),
        }
    }

    fn decode_reply(reply: Message) -> EffectResult<EffectOutcome> {
        match reply.payload {
            Payload::ApprovalResult {
                approval_status,
                feedback,
                ..
            } => Ok(EffectOutcome::Approval {
                status: approval_status,
                feedback,
            }),
            Payload::Answer { text, .. } => Ok(EffectOutcome::Answer { text }),
            Payload::BudgetReviewResult { auto_action, .. } => Ok(EffectOutcome::BudgetReview {
                feedback: Some(auto_action),
            }),
            other => Err(EffectError::UnparseableFeedback(format!(
                "unexpected reply payload: {other:?}"
            ))),
        }
    }
}

/// Minimal cooperative cancellation token, so the effect runtime does not
/// need a full cancellation-token crate dependency just for this one use.
pub mod tokio_util_cancel {
    use tokio::sync::Notify;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    pub struct CancelToken {
        notify: Arc<Notify>,
        cancelled: Arc<std::sync::atomic::AtomicBool>,
    }

    impl CancelToken {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn cancel(&self) {
            self.cancelled.store(true, std::sync::atomic::Ordering::SeqCst);
            self.notify.notify_waiters();
        }

        pub fn is_cancelled(&self) -> bool {
            self.cancelled.load(std::sync::atomic::Ordering::SeqCst)
        }

        pub async fn cancelled(&self) {
            if self.is_cancelled() {
                return;
            }
            self.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ApprovalStatus;

    #[tokio::test]
    async fn approval_effect_round_trips_to_outcome() {
        let (outbound_tx, mut outbound_rx) = mpsc::channel(4);
        let runtime = EffectRuntime::new("agent-1", outbound_tx);

        let cancel = tokio_util_cancel::CancelToken::new();
        let runtime_ref = &runtime;
        let exec = async {
            runtime_ref
                .execute(
                    Effect::Approval {
                        content: "plan".into(),
                        reason: "review".into(),
                        approval_type: ApprovalType::Plan,
                        story_id: "s-1".into(),
                    },
                    &cancel,
                )
                .await
        };

        let reply_pump = async {
            let request = outbound_rx.recv().await.unwrap();
            let reply = Message::new(
                MessageType::ApprovalResult,
                "architect",
                "agent-1",
                Some("s-1".into()),
                Payload::ApprovalResult {
                    approval_status: ApprovalStatus::Approved,
                    feedback: None,
                    extra: Default::default(),
                },
            );
            runtime_ref.deliver_reply(request.correlation_id(), reply);
        };

        let (outcome, _) = tokio::join!(exec, reply_pump);
        match outcome.unwrap() {
            EffectOutcome::Approval { status, .. } => assert_eq!(status, ApprovalStatus::Approved),
            _ => panic!("expected Approval outcome"),
        }
    }

    #[tokio::test]
    async fn completion_effect_is_synchronous_and_never_touches_the_channel() {
        let (outbound_tx, mut outbound_rx) = mpsc::channel(4);
        let runtime = EffectRuntime::new("agent-1", outbound_tx);
        let cancel = tokio_util_cancel::CancelToken::new();

        let outcome = runtime
            .execute(
                Effect::Completion {
                    target_state: "DONE".into(),
                    message: "done".into(),
                },
                &cancel,
            )
            .await
            .unwrap();

        assert!(matches!(outcome, EffectOutcome::Completed));
        assert!(outbound_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancellation_surfaces_as_cancelled_error() {
        let (outbound_tx, mut outbound_rx) = mpsc::channel(4);
        let runtime = EffectRuntime::new("agent-1", outbound_tx);
        let cancel = tokio_util_cancel::CancelToken::new();
        cancel.cancel();

        let result = runtime
            .execute(
                Effect::Question {
                    content: "which lib?".into(),
                    origin_state: "CODING".into(),
                    story_id: "s-1".into(),
                },
                &cancel,
            )
            .await;

        assert!(matches!(result, Err(EffectError::Cancelled)));
        let _ = outbound_rx.try_recv();
    }

    #[tokio::test]
    async fn budget_review_times_out_when_no_reply_arrives() {
        let (outbound_tx, mut outbound_rx) = mpsc::channel(4);
        let runtime = EffectRuntime::new("agent-1", outbound_tx);
        let cancel = tokio_util_cancel::CancelToken::new();

        let result = runtime
            .execute(
                Effect::BudgetReview {
                    content: "stuck".into(),
                    origin_state: "CODING".into(),
                    story_id: "s-1".into(),
                    timeout: Duration::from_millis(20),
                },
                &cancel,
            )
            .await;

        assert!(matches!(result, Err(EffectError::Timeout(_))));
        let _ = outbound_rx.try_recv();
    }
}
