//! Message injection into running sessions.
//!
//! The router is the one entry point for "deliver this text to that
//! session". It dispatches on the session's fixed [`DeliveryMode`] and never
//! falls back from one mode to the other.

use crate::health::{ProcessHealth, RetryPolicy};
use crate::inbox::{InboxMessage, InboxQueue, MessageId};
use crate::session::{DeliveryMode, Session};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Sender recorded on messages the router enqueues.
pub const SENDER: &str = "corral";

/// What happened to an injected message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    /// Persisted to the session's inbox; the agent will see it on its next poll.
    Queued { message_id: MessageId },
    /// Written to the terminal input buffer. Not acknowledged by the agent.
    Typed,
    /// Nothing was delivered.
    Failed { reason: String },
}

/// Uniform result of [`InjectionRouter::inject`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub session: String,
    pub mode: DeliveryMode,
    #[serde(flatten)]
    pub outcome: DeliveryOutcome,
}

impl DeliveryReceipt {
    fn new(session: &Session, outcome: DeliveryOutcome) -> Self {
        Self {
            session: session.name.clone(),
            mode: session.mode,
            outcome,
        }
    }

    fn failed(session: &Session, reason: impl Into<String>) -> Self {
        Self::new(
            session,
            DeliveryOutcome::Failed {
                reason: reason.into(),
            },
        )
    }

    /// Whether the message left the router.
    #[must_use]
    pub const fn is_delivered(&self) -> bool {
        !matches!(self.outcome, DeliveryOutcome::Failed { .. })
    }
}

/// Routes messages to sessions by their delivery mode.
#[derive(Debug, Clone)]
pub struct InjectionRouter {
    inbox: InboxQueue,
    health_gate: Option<RetryPolicy>,
}

impl InjectionRouter {
    #[must_use]
    pub const fn new(inbox: InboxQueue) -> Self {
        Self {
            inbox,
            health_gate: None,
        }
    }

    /// Check a terminal session's health before typing into it and refuse
    /// to deliver to a crashed one. Inbox delivery is not gated: the message
    /// waits in the store for a restarted agent.
    #[must_use]
    pub const fn with_health_gate(mut self, policy: RetryPolicy) -> Self {
        self.health_gate = Some(policy);
        self
    }

    #[must_use]
    pub const fn inbox(&self) -> &InboxQueue {
        &self.inbox
    }

    /// Deliver `message` to `session`.
    pub async fn inject(&self, session: &Session, message: &str) -> DeliveryReceipt {
        self.inject_with_id(session, message, None).await
    }

    /// Deliver with a caller-chosen message ID, so a retried call is not
    /// delivered twice in inbox mode.
    pub async fn inject_with_id(
        &self,
        session: &Session,
        message: &str,
        id: Option<MessageId>,
    ) -> DeliveryReceipt {
        let backend = session.backend();

        if session.mode == DeliveryMode::Pty
            && let Some(policy) = self.health_gate
        {
            match session.check_health(policy).await {
                Ok(report) => match report.health {
                    ProcessHealth::Crashed => {
                        warn!(session = %session.name, agent = backend.name, "Not delivering to crashed session");
                        return DeliveryReceipt::failed(session, "session process has crashed");
                    }
                    ProcessHealth::Unknown => {
                        warn!(session = %session.name, attempts = report.attempts, "Session health unknown, delivering anyway");
                    }
                    ProcessHealth::Alive { .. } => {}
                },
                Err(e) => {
                    warn!(session = %session.name, %e, "Health check failed");
                    return DeliveryReceipt::failed(session, format!("health check failed: {e}"));
                }
            }
        }

        let receipt = match session.mode {
            DeliveryMode::Inbox => {
                let mut envelope =
                    InboxMessage::new(session.inbox.clone(), message).with_sender(SENDER);
                if let Some(id) = id {
                    envelope.id = id;
                }
                // Lock contention backs off with a blocking sleep
                let inbox = self.inbox.clone();
                match tokio::task::spawn_blocking(move || inbox.enqueue_message(envelope)).await {
                    Ok(Ok(message_id)) => {
                        DeliveryReceipt::new(session, DeliveryOutcome::Queued { message_id })
                    }
                    Ok(Err(e)) => DeliveryReceipt::failed(session, e.to_string()),
                    Err(e) => DeliveryReceipt::failed(session, format!("enqueue task failed: {e}")),
                }
            }
            DeliveryMode::Pty => match session.injector() {
                Some(injector) => match injector.inject(message).await {
                    Ok(()) => DeliveryReceipt::new(session, DeliveryOutcome::Typed),
                    Err(e) => DeliveryReceipt::failed(session, e.to_string()),
                },
                None => DeliveryReceipt::failed(session, "session has no terminal attached"),
            },
        };

        if receipt.is_delivered() {
            info!(session = %session.name, agent = backend.name, mode = %session.mode, "Delivered message");
        } else {
            warn!(session = %session.name, agent = backend.name, mode = %session.mode, outcome = ?receipt.outcome, "Delivery failed");
        }
        receipt
    }
}
