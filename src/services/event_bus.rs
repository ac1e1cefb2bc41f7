//! Process-local pub/sub bus for task and invocation lifecycle events (§4.7).
//!
//! Grounded in the teacher's `EventBus` (`broadcast::channel` + `subscribe`),
//! collapsed from its ~20-variant `UnifiedEvent`/12-category taxonomy to the
//! four topics Orca actually needs. Delivery is best-effort, fan-out, and
//! never blocks a publisher: a subscriber that falls behind the channel
//! capacity is disconnected (`RecvError::Lagged`) rather than allowed to
//! apply backpressure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::domain::models::{Task, TaskPhase};

/// Default broadcast channel capacity. Generous enough that a normally-paced
/// SSE subscriber never lags under ordinary task/invocation churn.
const CHANNEL_CAPACITY: usize = 1024;

/// The four topics the bus carries, tagged for SSE `event:` framing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "topic", rename_all = "snake_case")]
pub enum OrcaEvent {
    TaskUpdated {
        issue_id: String,
        phase: TaskPhase,
        at: DateTime<Utc>,
    },
    InvocationStarted {
        issue_id: String,
        invocation_id: i64,
        at: DateTime<Utc>,
    },
    InvocationCompleted {
        issue_id: String,
        invocation_id: i64,
        status: String,
        at: DateTime<Utc>,
    },
    StatusUpdated {
        active_invocations: u32,
        cost_in_window_usd: f64,
        at: DateTime<Utc>,
    },
}

impl OrcaEvent {
    pub fn task_updated(task: &Task) -> Self {
        Self::TaskUpdated {
            issue_id: task.issue_id.clone(),
            phase: task.phase,
            at: Utc::now(),
        }
    }

    /// The topic name used for SSE `event:` framing and logging.
    pub fn topic(&self) -> &'static str {
        match self {
            Self::TaskUpdated { .. } => "task:updated",
            Self::InvocationStarted { .. } => "invocation:started",
            Self::InvocationCompleted { .. } => "invocation:completed",
            Self::StatusUpdated { .. } => "status:updated",
        }
    }
}

/// Process-local, in-memory event bus. No persistence: a restart drops
/// history, which is acceptable per §4.7 — the Store, not the bus, is the
/// durable source of truth.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<OrcaEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Publish an event to all current subscribers. Best-effort: if there
    /// are no subscribers, the event is simply dropped.
    pub fn publish(&self, event: OrcaEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("published event with no active subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrcaEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(OrcaEvent::StatusUpdated {
            active_invocations: 2,
            cost_in_window_usd: 1.5,
            at: Utc::now(),
        });
        let received = rx.recv().await.unwrap();
        assert_eq!(received.topic(), "status:updated");
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(OrcaEvent::TaskUpdated {
            issue_id: "A-1".to_string(),
            phase: TaskPhase::Ready,
            at: Utc::now(),
        });
    }

    #[test]
    fn subscriber_count_reflects_active_receivers() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        let rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        tokio_test::block_on(async {
            bus.publish(OrcaEvent::StatusUpdated {
                active_invocations: 1,
                cost_in_window_usd: 0.0,
                at: Utc::now(),
            });
        });
        drop(rx);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn lagging_subscriber_gets_disconnected_not_backpressured() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        for _ in 0..(CHANNEL_CAPACITY + 10) {
            bus.publish(OrcaEvent::StatusUpdated {
                active_invocations: 0,
                cost_in_window_usd: 0.0,
                at: Utc::now(),
            });
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            other => panic!("expected Lagged, got {other:?}"),
        }
    }
}
