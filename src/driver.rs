//! Component I: the driver loop.
//!
//! Dispatches to the handler for the current state, validates the
//! transition it returns against the transition table, persists it, and
//! repeats until a handler reports the story finished. Shaped like
//! `iterative_loop.rs`'s outer `run()` loop elsewhere in this codebase
//! (global timeout wrap around one phase call, persist, check for terminal
//! condition, repeat), adapted to this crate's own 13-state table instead
//! of an open-ended iteration count.

use std::time::Duration;

use tracing::Instrument;

use crate::error::{DriverError, DriverResult};
use crate::handlers::{self, AgentContext, HandlerOutcome, ERROR_STATE_KEY};
use crate::message::{Message, MessageType, Payload};
use crate::state::{AgentState, TransitionTable};
use crate::state_store::StateValue;

/// Wall-clock ceiling applied to every single handler invocation,
/// independent of any phase-specific timeout the handler itself applies to
/// an LLM turn. Guards against a handler hanging on an external call the
/// tool loop's own timeouts don't cover (e.g. a wedged container).
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(3600);

/// Runs the driver loop to completion for one agent, starting from
/// whatever state the state store currently reports (so restarting a
/// crashed agent resumes exactly where it left off).
///
/// A handler error never aborts the loop: it's caught here, stored under
/// `ERROR_STATE_KEY` so it's readable from state data, and the agent is
/// forced into `AgentState::Error` (bypassing `TransitionTable::validate`,
/// since ERROR isn't a listed successor of every state) so `handle_error`
/// still runs and the dispatcher still hears about the outcome.
pub async fn run(ctx: &mut AgentContext<'_>, handler_timeout: Duration) -> DriverResult<AgentState> {
    loop {
        if ctx.cancel.is_cancelled() {
            return Err(DriverError::Cancelled);
        }

        let current = ctx.state_store.current_state().await?;
        let agent_id = ctx.agent_id.clone();
        let span = tracing::info_span!("driver_tick", agent_id = %agent_id, state = %current);

        let tick: DriverResult<HandlerOutcome> = async {
            let outcome = timeout_wrap(handler_timeout, dispatch(current, ctx)).await?;
            if let HandlerOutcome::Next(next) = outcome {
                if !TransitionTable::validate(current, next) {
                    return Err(DriverError::InvalidTransition {
                        from: current.to_string(),
                        to: next.to_string(),
                    });
                }
            }
            Ok(outcome)
        }
        .instrument(span)
        .await;

        match tick {
            Ok(HandlerOutcome::Finished) => {
                return Ok(ctx.state_store.current_state().await?);
            }
            Ok(HandlerOutcome::Suspend { retry_after }) => {
                tracing::info!(state = %current, retry_after_secs = retry_after.as_secs(), "suspending state for retry");
                tokio::time::sleep(retry_after).await;
            }
            Ok(HandlerOutcome::Next(next)) => {
                ctx.state_store.transition(next).await?;
                emit_state_change(ctx, current, next).await;
            }
            Err(err) => {
                let message = err.to_string();
                tracing::info!(from = %current, error = %message, "handler error, forcing transition to Error");
                ctx.state_store
                    .set(ERROR_STATE_KEY, StateValue::Str(message))
                    .await?;
                ctx.state_store.transition(AgentState::Error).await?;
                emit_state_change(ctx, current, AgentState::Error).await;
            }
        }
    }
}

async fn emit_state_change(ctx: &AgentContext<'_>, from: AgentState, to: AgentState) {
    tracing::info!(from = %from, to = %to, "STATE_CHANGE");
    let notification = Message::new(
        MessageType::StateChange,
        ctx.agent_id.clone(),
        "architect",
        Some(ctx.story_id.clone()),
        Payload::StateChange {
            from_state: from.to_string(),
            to_state: to.to_string(),
            extra: Default::default(),
        },
    );
    if let Err(err) = ctx.dispatcher.notify_state_change(notification).await {
        tracing::warn!(error = %err, "failed to publish STATE_CHANGE notification");
    }
}

async fn timeout_wrap<F, T>(duration: Duration, fut: F) -> DriverResult<T>
where
    F: std::future::Future<Output = DriverResult<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(DriverError::InvalidTransition {
            from: "handler".into(),
            to: "timed out".into(),
        }),
    }
}

async fn dispatch(state: AgentState, ctx: &mut AgentContext<'_>) -> DriverResult<HandlerOutcome> {
    match state {
        AgentState::Waiting => handlers::handle_waiting(ctx).await,
        AgentState::Setup => handlers::handle_setup(ctx).await,
        AgentState::Planning => handlers::handle_planning(ctx).await,
        AgentState::PlanReview => handlers::handle_plan_review(ctx).await,
        AgentState::Coding => handlers::handle_coding(ctx).await,
        AgentState::Testing => handlers::handle_testing(ctx).await,
        AgentState::Fixing => handlers::handle_fixing(ctx).await,
        AgentState::CodeReview => handlers::handle_code_review(ctx).await,
        AgentState::BudgetReview => handlers::handle_budget_review(ctx).await,
        AgentState::AwaitMerge => handlers::handle_await_merge(ctx).await,
        AgentState::Question => handlers::handle_question(ctx).await,
        AgentState::Done => handlers::handle_done(ctx).await,
        AgentState::Error => handlers::handle_error(ctx).await,
    }
}
