//! Queue mode state machine.
//!
//! All mode changes of a [`MessageQueue`](super::MessageQueue) go through
//! [`QueueState::on`]; anything it rejects leaves the state untouched.

use serde::Serialize;

use crate::error::QueueError;

/// Delivery mode of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueState {
    /// Accept messages, attempt no delivery
    #[default]
    Buffering,
    /// A drain is working through the backlog
    Flushing,
    /// Backlog empty on a ready connection; enqueues deliver immediately
    PassThrough,
    /// Failed messages wait in the retry pool for the retry loop
    Retrying,
    /// Terminal
    Closed,
}

impl QueueState {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueState::Buffering => "BUFFERING",
            QueueState::Flushing => "FLUSHING",
            QueueState::PassThrough => "PASS_THROUGH",
            QueueState::Retrying => "RETRYING",
            QueueState::Closed => "CLOSED",
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, QueueState::Closed)
    }

    /// Compute the state after `event`.
    pub fn on(self, event: QueueEvent) -> Result<QueueState, QueueError> {
        use QueueEvent as E;
        use QueueState as S;

        let next = match (self, event) {
            (S::Closed, _) => return Err(QueueError::invalid_transition(self, event)),
            (_, E::Close) => S::Closed,

            (S::Flushing, E::DrainStarted) => {
                return Err(QueueError::invalid_transition(self, event))
            }
            (S::Buffering | S::PassThrough | S::Retrying, E::DrainStarted) => S::Flushing,

            (S::Flushing, E::DrainFinished { readiness: Readiness::NotReady, .. }) => S::Buffering,
            (S::Flushing, E::DrainFinished { retries_pending: true, .. }) => S::Retrying,
            (S::Flushing, E::DrainFinished { readiness: Readiness::Ready, .. }) => S::PassThrough,
            (S::Flushing, E::DrainFinished { readiness: Readiness::Unknown, .. }) => S::Buffering,
            (_, E::DrainFinished { .. }) => {
                return Err(QueueError::invalid_transition(self, event))
            }

            (_, E::ConnectionNotReady) => S::Buffering,

            // A drain in progress settles its own outcome; a connection that
            // reported not ready keeps buffering.
            (S::Flushing, E::RetryScheduled { .. }) => S::Flushing,
            (S::Buffering, E::RetryScheduled { readiness: Readiness::NotReady }) => S::Buffering,
            (S::Buffering | S::PassThrough | S::Retrying, E::RetryScheduled { .. }) => S::Retrying,

            (S::Retrying, E::RetriesSettled { readiness: Readiness::Ready }) => S::PassThrough,
            (S::Retrying, E::RetriesSettled { .. }) => S::Buffering,
            (S::Buffering | S::Flushing | S::PassThrough, E::RetriesSettled { .. }) => self,
        };

        Ok(next)
    }
}

impl std::fmt::Display for QueueState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the connection last reported about its readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Readiness {
    /// No lifecycle signal yet; explicit drains and retries still run
    #[default]
    Unknown,
    Ready,
    /// Negotiating or degraded; nothing is delivered
    NotReady,
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }
}

/// Inputs to the queue state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueEvent {
    /// A drain acquired the drain slot
    DrainStarted,
    /// The running drain has finished its pass
    DrainFinished {
        readiness: Readiness,
        retries_pending: bool,
    },
    /// The connection reported negotiating or degraded
    ConnectionNotReady,
    /// A failed message was parked in the retry pool
    RetryScheduled { readiness: Readiness },
    /// The retry pool became empty
    RetriesSettled { readiness: Readiness },
    Close,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_is_buffering() {
        assert_eq!(QueueState::default(), QueueState::Buffering);
    }

    #[test]
    fn test_drain_cycle_to_pass_through() {
        let state = QueueState::Buffering.on(QueueEvent::DrainStarted).unwrap();
        assert_eq!(state, QueueState::Flushing);

        let state = state
            .on(QueueEvent::DrainFinished {
                readiness: Readiness::Ready,
                retries_pending: false,
            })
            .unwrap();
        assert_eq!(state, QueueState::PassThrough);
    }

    #[test]
    fn test_drain_finished_not_ready_buffers() {
        let state = QueueState::Flushing
            .on(QueueEvent::DrainFinished {
                readiness: Readiness::NotReady,
                retries_pending: true,
            })
            .unwrap();
        assert_eq!(state, QueueState::Buffering);
    }

    #[test]
    fn test_drain_finished_without_signal() {
        let idle = QueueState::Flushing
            .on(QueueEvent::DrainFinished {
                readiness: Readiness::Unknown,
                retries_pending: false,
            })
            .unwrap();
        assert_eq!(idle, QueueState::Buffering);

        let failed = QueueState::Flushing
            .on(QueueEvent::DrainFinished {
                readiness: Readiness::Unknown,
                retries_pending: true,
            })
            .unwrap();
        assert_eq!(failed, QueueState::Retrying);
    }

    #[test]
    fn test_drain_finished_with_retries_goes_retrying() {
        let state = QueueState::Flushing
            .on(QueueEvent::DrainFinished {
                readiness: Readiness::Ready,
                retries_pending: true,
            })
            .unwrap();
        assert_eq!(state, QueueState::Retrying);
    }

    #[test]
    fn test_second_drain_start_rejected() {
        let result = QueueState::Flushing.on(QueueEvent::DrainStarted);
        assert!(matches!(result, Err(QueueError::InvalidTransition { .. })));
    }

    #[test]
    fn test_drain_finished_outside_flushing_rejected() {
        let result =
            QueueState::Buffering.on(QueueEvent::DrainFinished {
                readiness: Readiness::Ready,
                retries_pending: false,
            });
        assert!(result.is_err());
    }

    #[test]
    fn test_not_ready_forces_buffering() {
        for state in [
            QueueState::Buffering,
            QueueState::Flushing,
            QueueState::PassThrough,
            QueueState::Retrying,
        ] {
            assert_eq!(
                state.on(QueueEvent::ConnectionNotReady).unwrap(),
                QueueState::Buffering
            );
        }
    }

    #[test]
    fn test_retry_scheduled() {
        let unknown = QueueEvent::RetryScheduled { readiness: Readiness::Unknown };
        let ready = QueueEvent::RetryScheduled { readiness: Readiness::Ready };
        let not_ready = QueueEvent::RetryScheduled { readiness: Readiness::NotReady };

        assert_eq!(QueueState::PassThrough.on(ready).unwrap(), QueueState::Retrying);
        assert_eq!(QueueState::Flushing.on(ready).unwrap(), QueueState::Flushing);
        assert_eq!(QueueState::Buffering.on(unknown).unwrap(), QueueState::Retrying);
        assert_eq!(QueueState::Buffering.on(not_ready).unwrap(), QueueState::Buffering);
    }

    #[test]
    fn test_retries_settled() {
        assert_eq!(
            QueueState::Retrying
                .on(QueueEvent::RetriesSettled { readiness: Readiness::Ready })
                .unwrap(),
            QueueState::PassThrough
        );
        for readiness in [Readiness::Unknown, Readiness::NotReady] {
            assert_eq!(
                QueueState::Retrying
                    .on(QueueEvent::RetriesSettled { readiness })
                    .unwrap(),
                QueueState::Buffering
            );
        }
    }

    #[test]
    fn test_closed_is_terminal() {
        for state in [
            QueueState::Buffering,
            QueueState::Flushing,
            QueueState::PassThrough,
            QueueState::Retrying,
        ] {
            assert_eq!(state.on(QueueEvent::Close).unwrap(), QueueState::Closed);
        }

        assert!(QueueState::Closed.on(QueueEvent::Close).is_err());
        assert!(QueueState::Closed.on(QueueEvent::DrainStarted).is_err());
        assert!(QueueState::Closed.on(QueueEvent::ConnectionNotReady).is_err());
    }

    #[test]
    fn test_state_serializes_screaming_snake() {
        let json = serde_json::to_string(&QueueState::PassThrough).unwrap();
        assert_eq!(json, "\"PASS_THROUGH\"");
    }
}
