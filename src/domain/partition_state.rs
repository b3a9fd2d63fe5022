//! `PartitionState` — the per-partition lifecycle and sequence-tracking
//! record owned by the Partition State Store (C4). One row exists per
//! `partitionKey`; all mutation goes through `update(key, expectedVersion,
//! mutator)`'s optimistic-concurrency contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PstppError;

/// Position lifecycle states. IDs are chosen for `SMALLINT` storage in
/// `partition_state.state_id`, mirroring how the FSM coordinator stores its
/// own state as a numeric column rather than a text enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
#[repr(i16)]
pub enum PositionState {
    Executed = 0,
    Formed = 10,
    Settled = 20,
    Cancelled = 30,
    Closed = 40,
}

impl PositionState {
    /// The state-transition table enforced by [`PartitionState::transition_to`],
    /// per spec.md §4.4: EXECUTED -> FORMED, FORMED -> SETTLED, any -> CANCELLED,
    /// SETTLED -> CLOSED. CANCELLED and CLOSED are terminal.
    pub fn can_transition_to(self, next: PositionState) -> bool {
        if next == PositionState::Cancelled {
            return !matches!(self, PositionState::Cancelled | PositionState::Closed);
        }
        matches!(
            (self, next),
            (PositionState::Executed, PositionState::Formed)
                | (PositionState::Formed, PositionState::Settled)
                | (PositionState::Settled, PositionState::Closed)
        )
    }

    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(PositionState::Executed),
            10 => Some(PositionState::Formed),
            20 => Some(PositionState::Settled),
            30 => Some(PositionState::Cancelled),
            40 => Some(PositionState::Closed),
            _ => None,
        }
    }
}

impl std::fmt::Display for PositionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PositionState::Executed => "EXECUTED",
            PositionState::Formed => "FORMED",
            PositionState::Settled => "SETTLED",
            PositionState::Cancelled => "CANCELLED",
            PositionState::Closed => "CLOSED",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionState {
    pub partition_key: String,
    pub state: PositionState,
    pub last_sequence_number: Option<u64>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PartitionState {
    /// `getOrInit` seed value: a freshly observed partition key starts
    /// EXECUTED with no sequence number yet admitted and version 0.
    pub fn new(partition_key: String) -> Self {
        let now = Utc::now();
        Self {
            partition_key,
            state: PositionState::Executed,
            last_sequence_number: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Enforce the state-transition table, returning
    /// [`PstppError::InvalidStateTransition`] on a disallowed move.
    pub fn transition_to(&mut self, next: PositionState) -> Result<(), PstppError> {
        if !self.state.can_transition_to(next) {
            return Err(PstppError::InvalidStateTransition {
                partition_key: self.partition_key.clone(),
                from: format!("{:?}", self.state),
                to: format!("{next:?}"),
            });
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Advance the admitted sequence number. Callers (the Sequence Buffer)
    /// must only call this with a strictly increasing value; the store does
    /// not re-check ordering, it only records the high-water mark.
    pub fn advance_sequence(&mut self, seq: u64) {
        self.last_sequence_number = Some(seq);
        self.updated_at = Utc::now();
    }

    /// The optimistic-concurrency guard used by `update(key, expectedVersion,
    /// mutator)`: the caller's observed version must match before any
    /// mutator runs, and every successful mutation bumps the version by one.
    pub fn check_version(&self, expected_version: i64) -> Result<(), PstppError> {
        if self.version != expected_version {
            return Err(PstppError::ProcessingError(format!(
                "version mismatch on {}: expected {}, found {}",
                self.partition_key, expected_version, self.version
            )));
        }
        Ok(())
    }

    pub fn bump_version(&mut self) {
        self.version += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_partition_starts_executed_at_version_zero() {
        let state = PartitionState::new("A_B_C".into());
        assert_eq!(state.state, PositionState::Executed);
        assert_eq!(state.version, 0);
    }

    #[test]
    fn executed_to_settled_directly_is_rejected() {
        let mut state = PartitionState::new("A_B_C".into());
        let err = state.transition_to(PositionState::Settled).unwrap_err();
        assert!(matches!(err, PstppError::InvalidStateTransition { .. }));
    }

    #[test]
    fn full_lifecycle_succeeds_in_order() {
        let mut state = PartitionState::new("A_B_C".into());
        state.transition_to(PositionState::Formed).unwrap();
        state.transition_to(PositionState::Settled).unwrap();
        state.transition_to(PositionState::Closed).unwrap();
        assert_eq!(state.state, PositionState::Closed);
    }

    #[test]
    fn any_non_terminal_state_can_cancel() {
        let mut state = PartitionState::new("A_B_C".into());
        state.transition_to(PositionState::Formed).unwrap();
        state.transition_to(PositionState::Cancelled).unwrap();
        assert_eq!(state.state, PositionState::Cancelled);
    }

    #[test]
    fn cancelled_is_terminal() {
        let mut state = PartitionState::new("A_B_C".into());
        state.transition_to(PositionState::Cancelled).unwrap();
        let err = state.transition_to(PositionState::Formed).unwrap_err();
        assert!(matches!(err, PstppError::InvalidStateTransition { .. }));
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let state = PartitionState::new("A_B_C".into());
        assert!(state.check_version(1).is_err());
        assert!(state.check_version(0).is_ok());
    }

    #[test]
    fn state_id_roundtrips() {
        for s in [
            PositionState::Executed,
            PositionState::Formed,
            PositionState::Settled,
            PositionState::Cancelled,
            PositionState::Closed,
        ] {
            assert_eq!(PositionState::from_id(s.id()), Some(s));
        }
        assert_eq!(PositionState::from_id(999), None);
    }
}
