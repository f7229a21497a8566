use serde::Serialize;
use thiserror::Error;

use crate::types::{GroupId, MatchId, MatchState, RegistrationId, SlotId};

/// The bracket layout cannot be turned into an acyclic, fully referenced
/// dependency graph. Fatal for the layout; regenerate the bracket.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyError {
  #[error("tournament has no stages")]
  NoStages,
  #[error("stage {stage} is out of order (expected index {expected})")]
  StageOrder { stage: u32, expected: u32 },
  #[error("stage {stage}: {reason}")]
  StageShape { stage: u32, reason: &'static str },
  #[error("match id {0} is declared more than once")]
  DuplicateMatch(MatchId),
  #[error("stage {stage} declares group {code} more than once")]
  DuplicateGroup { stage: u32, code: String },
  #[error("stage {stage} declares round {round} order {order} more than once")]
  DuplicateAddress { stage: u32, round: u32, order: u32 },
  #[error("slot {slot} seed {seed} asks for rank 0")]
  InvalidRank { slot: SlotId, seed: String },
  #[error("slot {slot} seed {seed} references {missing}, which does not exist")]
  Dangling { slot: SlotId, seed: String, missing: String },
  #[error("slot {slot} seed {seed} closes a dependency cycle")]
  Cycle { slot: SlotId, seed: String },
}

impl TopologyError {
  /// The slot whose seed caused the failure, when one is to blame.
  pub fn slot(&self) -> Option<SlotId> {
    match self {
      TopologyError::InvalidRank { slot, .. }
      | TopologyError::Dangling { slot, .. }
      | TopologyError::Cycle { slot, .. } => Some(*slot),
      _ => None,
    }
  }
}

/// Why a slot could not be bound yet. Recoverable: the slot is re-evaluated
/// the next time its upstream entity changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum BlockedReason {
  GroupOpen,
  RankUnavailable { rank: u32, group_size: usize },
  Tied { tied: Vec<Vec<RegistrationId>> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[serde(rename_all = "camelCase")]
#[error("seeding blocked for slot {slot} (group {group}): {reason:?}")]
pub struct SeedingBlocked {
  pub slot: SlotId,
  pub group: GroupId,
  pub reason: BlockedReason,
}

/// An event was rejected. Nothing was committed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
  #[error("invalid bracket topology: {0}")]
  InvalidBracketTopology(#[from] TopologyError),
  #[error("match {0} does not exist")]
  UnknownMatch(MatchId),
  #[error("slot {0} does not exist")]
  UnknownSlot(SlotId),
  #[error("group {0} does not exist")]
  UnknownGroup(GroupId),
  #[error("match {match_id} is not ready to be decided (state {state:?})")]
  MatchNotReady { match_id: MatchId, state: MatchState },
  #[error("registration {registration} is not an occupant of match {match_id}")]
  NotAParticipant { match_id: MatchId, registration: RegistrationId },
  #[error("match {match_id} needs two distinct participants")]
  SameParticipant { match_id: MatchId },
  #[error("match {match_id} already has a different result; submit a correction instead")]
  AlreadyDecided { match_id: MatchId },
  #[error("match {match_id} has no played result to correct")]
  NotCorrectable { match_id: MatchId },
  #[error("slot {slot} is pinned to registration {registration}, which the cascade also places in the opposite slot")]
  CorrectionConflict { slot: SlotId, registration: RegistrationId },
  #[error("registration {registration} would occupy both slots of match {match_id}")]
  DuplicateOccupant { match_id: MatchId, registration: RegistrationId },
  #[error("standings override for group {group} is invalid: {reason}")]
  InvalidStandings { group: GroupId, reason: String },
}
