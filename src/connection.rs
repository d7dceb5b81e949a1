use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::compatibility::CompatibilityResult;
use crate::depth::InteractionDepth;
use crate::errors::{Result, VibeError};
use crate::id::{ConnectionId, NodeSignature};
use crate::transport::TransportKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Discovered,
    Handshaking,
    Active,
    Exchanging,
    Completed,
    Aborted,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Completed | ConnectionState::Aborted)
    }

    /// Whether `self -> next` is a legal step of the lifecycle.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Discovered, Handshaking)
                | (Handshaking, Active)
                | (Active, Exchanging)
                | (Exchanging, Completed)
                | (Handshaking, Aborted)
                | (Active, Aborted)
                | (Exchanging, Aborted)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Discovered => "discovered",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Active => "active",
            ConnectionState::Exchanging => "exchanging",
            ConnectionState::Completed => "completed",
            ConnectionState::Aborted => "aborted",
        }
    }
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Initiator,
    Responder,
}

/// Why a connection attempt was refused before it started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rejection {
    TooManyConnections,
    InCooldown { until: DateTime<Utc> },
    AlreadyConnecting,
}

impl Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::TooManyConnections => write!(f, "too many connections"),
            Rejection::InCooldown { until } => {
                write!(f, "in cooldown until {}", until)
            }
            Rejection::AlreadyConnecting => write!(f, "already connecting"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TerminationReason {
    Complete,
    BelowFloor,
    MalformedFingerprint,
    Rejected { rejection: Rejection },
    Timeout,
    DurationExceeded,
    MessageLimit,
    ProtocolViolation,
    LinkClosed,
    Shutdown,
}

/// Snapshot of one entry of the active-connection table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub id: ConnectionId,
    pub role: Role,
    pub local: NodeSignature,
    pub remote: NodeSignature,
    pub transport: TransportKind,
    pub state: ConnectionState,
    pub local_result: Option<CompatibilityResult>,
    pub remote_result: Option<CompatibilityResult>,
    pub desired_depth: Option<InteractionDepth>,
    pub remote_desired_depth: Option<InteractionDepth>,
    pub effective_depth: Option<InteractionDepth>,
    pub insights_sent: usize,
    pub insights_received: usize,
    pub messages_exchanged: usize,
    pub created_at: DateTime<Utc>,
    pub established_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub termination: Option<TerminationReason>,
}

impl Connection {
    pub fn new(
        role: Role,
        local: NodeSignature,
        remote: NodeSignature,
        transport: TransportKind,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ConnectionId::generate(),
            role,
            local,
            remote,
            transport,
            state: ConnectionState::Discovered,
            local_result: None,
            remote_result: None,
            desired_depth: None,
            remote_desired_depth: None,
            effective_depth: None,
            insights_sent: 0,
            insights_received: 0,
            messages_exchanged: 0,
            created_at: now,
            established_at: None,
            completed_at: None,
            termination: None,
        }
    }

    /// Move to `next`, refusing anything that is not a forward lifecycle step.
    pub fn transition(
        &mut self,
        next: ConnectionState,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(VibeError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        log::debug!("Connection {}: {} -> {}", self.id, self.state, next);
        self.state = next;
        match next {
            ConnectionState::Active => self.established_at = Some(now),
            ConnectionState::Completed | ConnectionState::Aborted => {
                self.completed_at = Some(now)
            }
            _ => {}
        }
        Ok(())
    }

    pub fn duration_ms(&self) -> i64 {
        self.completed_at
            .map(|end| (end - self.created_at).num_milliseconds())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use ConnectionState::*;

    fn connection() -> Connection {
        Connection::new(
            Role::Initiator,
            "00000000000000aa".parse().unwrap(),
            "00000000000000bb".parse().unwrap(),
            TransportKind::Memory,
            Utc::now(),
        )
    }

    #[test]
    fn happy_path_is_allowed() {
        let mut c = connection();
        for next in [Handshaking, Active, Exchanging, Completed] {
            c.transition(next, Utc::now()).unwrap();
        }
        assert!(c.state.is_terminal());
        assert!(c.established_at.is_some());
        assert!(c.completed_at.is_some());
    }

    #[rstest]
    #[case(Discovered, Active)]
    #[case(Discovered, Aborted)]
    #[case(Discovered, Completed)]
    #[case(Handshaking, Completed)]
    #[case(Active, Completed)]
    #[case(Active, Handshaking)]
    #[case(Exchanging, Active)]
    #[case(Completed, Aborted)]
    #[case(Aborted, Handshaking)]
    fn illegal_steps_are_refused(
        #[case] from: ConnectionState,
        #[case] to: ConnectionState,
    ) {
        assert!(!from.can_transition_to(to));
    }

    #[test]
    fn refused_transition_leaves_state_untouched() {
        let mut c = connection();
        let err = c.transition(Exchanging, Utc::now()).unwrap_err();
        assert!(matches!(err, VibeError::InvalidTransition { .. }));
        assert_eq!(c.state, Discovered);
    }

    #[test]
    fn termination_reasons_are_tagged() {
        let json = serde_json::to_string(&TerminationReason::Rejected {
            rejection: Rejection::AlreadyConnecting,
        })
        .unwrap();
        assert!(json.contains("\"kind\":\"rejected\""));
    }
}
