use serde::{Deserialize, Serialize};
use std::{
  collections::{BTreeMap, BTreeSet, VecDeque},
  sync::Arc,
};
use tracing::{debug, info, warn};

use crate::bindings::{BindingRecord, Cause, SlotBindingStore};
use crate::error::{BlockedReason, EngineError, SeedingBlocked};
use crate::ranking::{PlayedMatch, Ranking, RankingEvaluator, Standing};
use crate::seed::{HardPin, Placement, SeedSource};
use crate::topology::{DependencyIndex, Upstream};
use crate::types::{
  Binding, DecidedBy, EntityId, GameScore, GroupId, MatchId, MatchState, RegistrationId, Side,
  SlotId, TournamentConfig,
};

// ── Events ─────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ResolutionEvent {
  MatchDecided {
    #[serde(rename = "matchId")]
    match_id: MatchId,
    winner: RegistrationId,
    loser: RegistrationId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    scores: Vec<GameScore>,
  },
  GroupFinalized {
    #[serde(rename = "groupId")]
    group_id: GroupId,
  },
  SeedOverrideApplied {
    slot: SlotId,
    #[serde(default)]
    pin: Option<HardPin>,
  },
  ResultCorrected {
    #[serde(rename = "matchId")]
    match_id: MatchId,
    winner: RegistrationId,
    loser: RegistrationId,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    scores: Vec<GameScore>,
  },
  /// Operator-supplied final order for a group, used to settle ties.
  StandingsOverridden {
    #[serde(rename = "groupId")]
    group_id: GroupId,
    order: Vec<RegistrationId>,
  },
}

impl ResolutionEvent {
  pub fn decided(match_id: MatchId, winner: RegistrationId, loser: RegistrationId) -> Self {
    ResolutionEvent::MatchDecided { match_id, winner, loser, scores: Vec::new() }
  }

  pub fn corrected(match_id: MatchId, winner: RegistrationId, loser: RegistrationId) -> Self {
    ResolutionEvent::ResultCorrected { match_id, winner, loser, scores: Vec::new() }
  }

  pub fn kind(&self) -> &'static str {
    match self {
      ResolutionEvent::MatchDecided { .. } => "matchDecided",
      ResolutionEvent::GroupFinalized { .. } => "groupFinalized",
      ResolutionEvent::SeedOverrideApplied { .. } => "seedOverrideApplied",
      ResolutionEvent::ResultCorrected { .. } => "resultCorrected",
      ResolutionEvent::StandingsOverridden { .. } => "standingsOverridden",
    }
  }
}

// ── Match and group state ──────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Outcome {
  pub occupants: [Binding; 2],
  pub winner: Option<RegistrationId>,
  pub loser: Option<RegistrationId>,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub scores: Vec<GameScore>,
  pub decided_by: DecidedBy,
}

impl Outcome {
  /// What a slot fed by this match receives. A missing winner or loser
  /// (bye decisions) propagates as a bye.
  pub fn placed(&self, placement: Placement) -> Binding {
    match placement {
      Placement::Winner => self.winner.into(),
      Placement::Loser => self.loser.into(),
    }
  }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct PlayedResult {
  occupants: [RegistrationId; 2],
  winner: RegistrationId,
  loser: RegistrationId,
  scores: Vec<GameScore>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct MatchRecord {
  state: MatchState,
  outcome: Option<Outcome>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum GroupStatus {
  Open,
  Finalized {
    standings: Vec<Standing>,
  },
  Tied {
    standings: Vec<Standing>,
    tied: Vec<Vec<RegistrationId>>,
  },
}

impl GroupStatus {
  pub fn is_open(&self) -> bool {
    matches!(self, GroupStatus::Open)
  }
}

#[derive(Clone, Debug, Default)]
struct BracketState {
  bindings: SlotBindingStore,
  matches: BTreeMap<MatchId, MatchRecord>,
  groups: BTreeMap<GroupId, GroupStatus>,
  results: BTreeMap<MatchId, PlayedResult>,
  standings_overrides: BTreeMap<GroupId, Vec<RegistrationId>>,
  events_applied: u64,
}

// ── Change sets & snapshots ────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotChange {
  pub slot: SlotId,
  pub binding: Binding,
  pub cause: Option<Cause>,
  pub version: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchChange {
  pub match_id: MatchId,
  pub state: MatchState,
  pub winner: Option<RegistrationId>,
  pub loser: Option<RegistrationId>,
}

/// Everything one committed event changed, for the caller to persist and
/// fan out to schedulers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSet {
  pub slots: Vec<SlotChange>,
  pub matches: Vec<MatchChange>,
  /// Matches that became fully seeded and now wait for play.
  pub ready: Vec<MatchId>,
  pub finalized_groups: Vec<GroupId>,
  pub blocked: Vec<SeedingBlocked>,
  /// Recorded results dropped because their match no longer has the same
  /// occupants.
  pub invalidated_results: Vec<MatchId>,
}

impl ChangeSet {
  pub fn is_empty(&self) -> bool {
    self.slots.is_empty()
      && self.matches.is_empty()
      && self.ready.is_empty()
      && self.finalized_groups.is_empty()
      && self.blocked.is_empty()
      && self.invalidated_results.is_empty()
  }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotView {
  pub slot: SlotId,
  pub seed: String,
  pub binding: Binding,
  pub cause: Option<Cause>,
  pub version: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchView {
  pub match_id: MatchId,
  pub stage: u32,
  pub round: u32,
  pub order: u32,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub group: Option<GroupId>,
  pub state: MatchState,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub outcome: Option<Outcome>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupView {
  pub group_id: GroupId,
  pub stage: u32,
  pub code: String,
  pub status: GroupStatus,
}

/// Read-only copy of the last quiescent bracket state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BracketSnapshot {
  pub tournament_id: String,
  pub generation: u64,
  pub events_applied: u64,
  pub slots: Vec<SlotView>,
  pub matches: Vec<MatchView>,
  pub groups: Vec<GroupView>,
}

impl BracketSnapshot {
  pub fn slot(&self, slot: SlotId) -> Option<&SlotView> {
    self
      .slots
      .binary_search_by_key(&slot, |view| view.slot)
      .ok()
      .map(|pos| &self.slots[pos])
  }

  pub fn binding(&self, slot: SlotId) -> Option<Binding> {
    self.slot(slot).map(|view| view.binding)
  }

  pub fn match_view(&self, id: MatchId) -> Option<&MatchView> {
    self
      .matches
      .binary_search_by_key(&id, |view| view.match_id)
      .ok()
      .map(|pos| &self.matches[pos])
  }

  pub fn state(&self, id: MatchId) -> Option<MatchState> {
    self.match_view(id).map(|view| view.state)
  }

  pub fn bindings(&self) -> BTreeMap<SlotId, Binding> {
    self.slots.iter().map(|view| (view.slot, view.binding)).collect()
  }
}

// ── Engine ─────────────────────────────────────────────────────────────

/// Resolves slot occupants for one tournament. Every event runs as a single
/// pass over a working copy of the state; the copy replaces the committed
/// state only when the whole cascade succeeds.
#[derive(Clone, Debug)]
pub struct ResolutionEngine {
  index: Arc<DependencyIndex>,
  evaluator: RankingEvaluator,
  state: BracketState,
}

impl ResolutionEngine {
  pub fn new(layout: &TournamentConfig, evaluator: RankingEvaluator) -> Result<Self, EngineError> {
    let index = DependencyIndex::build(layout)?;
    ResolutionEngine::from_index(Arc::new(index), evaluator)
  }

  /// Binds every immediately resolvable slot and settles the byes they
  /// decide.
  pub fn from_index(index: Arc<DependencyIndex>, evaluator: RankingEvaluator) -> Result<Self, EngineError> {
    let mut state = BracketState::default();
    for node in index.nodes() {
      state.matches.insert(
        node.id,
        MatchRecord {
          state: MatchState::Unseeded,
          outcome: None,
        },
      );
    }
    for group in index.groups() {
      state.groups.insert(group.id, GroupStatus::Open);
    }

    // Upstream entities first, so each slot is usually evaluated once.
    let mut pass = Pass::new(index.clone(), &evaluator, state.clone());
    for entity in index.topo_order() {
      match *entity {
        EntityId::Match(id) => {
          for side in Side::BOTH {
            pass.queue.push_back(Work::Slot(SlotId::new(id, side)));
          }
        }
        EntityId::Group(id) => pass.queue.push_back(Work::Group(id)),
      }
    }
    pass.drain()?;
    let changes = pass.finish(&state);
    let (index, state) = pass.into_parts();
    info!(
      tournament = %index.tournament_id(),
      matches = state.matches.len(),
      groups = state.groups.len(),
      ready = changes.ready.len(),
      "bracket primed"
    );
    Ok(ResolutionEngine { index, evaluator, state })
  }

  pub fn resolve(&mut self, event: ResolutionEvent) -> Result<ChangeSet, EngineError> {
    let mut pass = Pass::new(self.index.clone(), &self.evaluator, self.state.clone());
    if !pass.apply(&event)? {
      debug!(event = event.kind(), "event repeats recorded state");
      return Ok(ChangeSet::default());
    }
    pass.drain()?;
    let changes = pass.finish(&self.state);
    let (index, mut state) = pass.into_parts();
    state.events_applied += 1;
    self.index = index;
    self.state = state;

    info!(
      event = event.kind(),
      slots = changes.slots.len(),
      matches = changes.matches.len(),
      ready = changes.ready.len(),
      "event applied"
    );
    for blocked in &changes.blocked {
      warn!(slot = %blocked.slot, group = %blocked.group, reason = ?blocked.reason, "seeding blocked");
    }
    if !changes.invalidated_results.is_empty() {
      warn!(matches = ?changes.invalidated_results, "recorded results invalidated by cascade");
    }
    Ok(changes)
  }

  pub fn index(&self) -> &DependencyIndex {
    &self.index
  }

  pub fn evaluator(&self) -> &RankingEvaluator {
    &self.evaluator
  }

  pub fn current_binding(&self, slot: SlotId) -> Result<BindingRecord, EngineError> {
    if !self.index.contains_slot(slot) {
      return Err(EngineError::UnknownSlot(slot));
    }
    Ok(self.state.bindings.get(slot))
  }

  pub fn current_state(&self, id: MatchId) -> Result<MatchState, EngineError> {
    self
      .state
      .matches
      .get(&id)
      .map(|record| record.state)
      .ok_or(EngineError::UnknownMatch(id))
  }

  pub fn outcome(&self, id: MatchId) -> Option<&Outcome> {
    self.state.matches.get(&id).and_then(|record| record.outcome.as_ref())
  }

  pub fn group_status(&self, id: GroupId) -> Option<&GroupStatus> {
    self.state.groups.get(&id)
  }

  pub fn snapshot(&self) -> BracketSnapshot {
    let slots = self
      .index
      .slots()
      .map(|slot| {
        let record = self.state.bindings.get(slot);
        SlotView {
          slot,
          seed: self.index.seed(slot).map(|seed| seed.to_string()).unwrap_or_default(),
          binding: record.binding,
          cause: record.cause,
          version: record.version,
        }
      })
      .collect();
    let matches = self
      .index
      .nodes()
      .map(|node| {
        let record = self.state.matches.get(&node.id);
        MatchView {
          match_id: node.id,
          stage: node.stage,
          round: node.round,
          order: node.order,
          group: node.group,
          state: record.map(|record| record.state).unwrap_or(MatchState::Unseeded),
          outcome: record.and_then(|record| record.outcome.clone()),
        }
      })
      .collect();
    let groups = self
      .index
      .groups()
      .iter()
      .map(|group| GroupView {
        group_id: group.id,
        stage: group.stage,
        code: group.code.clone(),
        status: self.state.groups.get(&group.id).cloned().unwrap_or(GroupStatus::Open),
      })
      .collect();
    BracketSnapshot {
      tournament_id: self.index.tournament_id().to_string(),
      generation: self.state.bindings.generation(),
      events_applied: self.state.events_applied,
      slots,
      matches,
      groups,
    }
  }
}

// ── Propagation pass ───────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Work {
  Slot(SlotId),
  Match(MatchId),
  Decided(MatchId),
  Group(GroupId),
}

#[derive(Clone, Copy, Debug)]
enum Retract {
  Slot(SlotId),
  Match(MatchId),
  Group(GroupId),
}

struct Pass<'a> {
  index: Arc<DependencyIndex>,
  evaluator: &'a RankingEvaluator,
  state: BracketState,
  queue: VecDeque<Work>,
  touched_slots: BTreeSet<SlotId>,
  touched_matches: BTreeSet<MatchId>,
  touched_groups: BTreeSet<GroupId>,
  reported_groups: BTreeSet<GroupId>,
  retracted: BTreeSet<MatchId>,
}

impl<'a> Pass<'a> {
  fn new(index: Arc<DependencyIndex>, evaluator: &'a RankingEvaluator, state: BracketState) -> Self {
    Pass {
      index,
      evaluator,
      state,
      queue: VecDeque::new(),
      touched_slots: BTreeSet::new(),
      touched_matches: BTreeSet::new(),
      touched_groups: BTreeSet::new(),
      reported_groups: BTreeSet::new(),
      retracted: BTreeSet::new(),
    }
  }

  fn into_parts(self) -> (Arc<DependencyIndex>, BracketState) {
    (self.index, self.state)
  }

  /// Validates the event and seeds the worklist. `Ok(false)` means the event
  /// restates what is already recorded.
  fn apply(&mut self, event: &ResolutionEvent) -> Result<bool, EngineError> {
    match event {
      ResolutionEvent::MatchDecided { match_id, winner, loser, scores } => {
        let result = self.checked_result(*match_id, *winner, *loser, scores)?;
        let record = self.record(*match_id)?;
        match &record.outcome {
          Some(outcome) if outcome.decided_by == DecidedBy::ByPlay => {
            if self.state.results.get(match_id) == Some(&result) {
              return Ok(false);
            }
            return Err(EngineError::AlreadyDecided { match_id: *match_id });
          }
          Some(_) => {
            return Err(EngineError::MatchNotReady { match_id: *match_id, state: record.state });
          }
          None => {}
        }
        self.record_result(*match_id, result);
        Ok(true)
      }
      ResolutionEvent::ResultCorrected { match_id, winner, loser, scores } => {
        let record = self.record(*match_id)?;
        if !matches!(&record.outcome, Some(outcome) if outcome.decided_by == DecidedBy::ByPlay) {
          return Err(EngineError::NotCorrectable { match_id: *match_id });
        }
        let result = self.checked_result(*match_id, *winner, *loser, scores)?;
        if self.state.results.get(match_id) == Some(&result) {
          return Ok(false);
        }
        info!(match_id = %match_id, winner = %winner, loser = %loser, "retracting result for correction");
        self.retract(Retract::Match(*match_id));
        self.record_result(*match_id, result);
        Ok(true)
      }
      ResolutionEvent::GroupFinalized { group_id } => {
        if self.index.group(*group_id).is_none() {
          return Err(EngineError::UnknownGroup(*group_id));
        }
        self.reported_groups.insert(*group_id);
        self.queue.push_back(Work::Group(*group_id));
        Ok(true)
      }
      ResolutionEvent::SeedOverrideApplied { slot, pin } => {
        let Some(seed) = self.index.seed(*slot) else {
          return Err(EngineError::UnknownSlot(*slot));
        };
        if seed.pin == *pin {
          return Ok(false);
        }
        let index = self.index.with_pin(*slot, *pin)?;
        info!(slot = %slot, pin = ?pin, "hard pin edited");
        self.retract(Retract::Slot(*slot));
        self.index = Arc::new(index);
        self.queue.push_back(Work::Slot(*slot));
        self.queue.push_back(Work::Match(slot.match_id));
        Ok(true)
      }
      ResolutionEvent::StandingsOverridden { group_id, order } => {
        if self.index.group(*group_id).is_none() {
          return Err(EngineError::UnknownGroup(*group_id));
        }
        let members = self.effective_members(*group_id);
        let mut proposed = order.clone();
        proposed.sort();
        if proposed.windows(2).any(|pair| pair[0] == pair[1]) {
          return Err(EngineError::InvalidStandings {
            group: *group_id,
            reason: "order lists a registration more than once".to_string(),
          });
        }
        if proposed != members {
          return Err(EngineError::InvalidStandings {
            group: *group_id,
            reason: format!("order must rank exactly the {} group members", members.len()),
          });
        }
        if self.state.standings_overrides.get(group_id) == Some(order) {
          return Ok(false);
        }
        self.state.standings_overrides.insert(*group_id, order.clone());
        self.retract(Retract::Group(*group_id));
        self.reported_groups.insert(*group_id);
        self.queue.push_back(Work::Group(*group_id));
        Ok(true)
      }
    }
  }

  fn record(&self, id: MatchId) -> Result<&MatchRecord, EngineError> {
    self.state.matches.get(&id).ok_or(EngineError::UnknownMatch(id))
  }

  /// Checks a reported result against the match's current occupants.
  fn checked_result(
    &self,
    match_id: MatchId,
    winner: RegistrationId,
    loser: RegistrationId,
    scores: &[GameScore],
  ) -> Result<PlayedResult, EngineError> {
    let record = self.record(match_id)?;
    if winner == loser {
      return Err(EngineError::SameParticipant { match_id });
    }
    if record.outcome.is_none() && record.state != MatchState::FullySeeded {
      return Err(EngineError::MatchNotReady { match_id, state: record.state });
    }
    let occupants = match (
      self.binding(SlotId::new(match_id, Side::A)).registration(),
      self.binding(SlotId::new(match_id, Side::B)).registration(),
    ) {
      (Some(a), Some(b)) => [a, b],
      _ => return Err(EngineError::MatchNotReady { match_id, state: record.state }),
    };
    for registration in [winner, loser] {
      if !occupants.contains(&registration) {
        return Err(EngineError::NotAParticipant { match_id, registration });
      }
    }
    Ok(PlayedResult {
      occupants,
      winner,
      loser,
      scores: scores.to_vec(),
    })
  }

  fn record_result(&mut self, match_id: MatchId, result: PlayedResult) {
    let outcome = Outcome {
      occupants: result.occupants.map(Binding::Registration),
      winner: Some(result.winner),
      loser: Some(result.loser),
      scores: result.scores.clone(),
      decided_by: DecidedBy::ByPlay,
    };
    self.state.results.insert(match_id, result);
    self.decide(match_id, outcome);
  }

  fn binding(&self, slot: SlotId) -> Binding {
    self.state.bindings.binding(slot)
  }

  fn drain(&mut self) -> Result<(), EngineError> {
    while let Some(work) = self.queue.pop_front() {
      match work {
        Work::Slot(slot) => self.evaluate_slot(slot),
        Work::Match(id) => self.evaluate_match(id)?,
        Work::Decided(id) => self.propagate_decision(id),
        Work::Group(id) => self.evaluate_group(id)?,
      }
    }
    Ok(())
  }

  fn evaluate_slot(&mut self, slot: SlotId) {
    if self.binding(slot).is_bound() {
      return;
    }
    let Some((binding, cause)) = self.derive(slot) else {
      return;
    };
    let version = self.state.bindings.set(slot, binding, cause);
    debug!(slot = %slot, binding = ?binding, cause = ?cause, version, "slot bound");
    self.touched_slots.insert(slot);
    self.queue.push_back(Work::Match(slot.match_id));
  }

  /// The binding a slot would take from the current state, if its upstream
  /// has produced one.
  fn derive(&self, slot: SlotId) -> Option<(Binding, Cause)> {
    let seed = self.index.seed(slot)?;
    if let Some(HardPin::Registration { registration }) = seed.pin {
      return Some((Binding::Registration(registration), Cause::Pin));
    }
    match self.index.upstream(slot) {
      None => match &seed.source {
        SeedSource::Registration { registration } => Some((Binding::Registration(*registration), Cause::Seed)),
        SeedSource::Bye => Some((Binding::Bye, Cause::Seed)),
        _ => None,
      },
      Some(Upstream::Match { match_id, placement }) => {
        let outcome = self.state.matches.get(&match_id)?.outcome.as_ref()?;
        Some((outcome.placed(placement), Cause::MatchOutcome(match_id)))
      }
      Some(Upstream::Group { group, rank }) => match self.state.groups.get(&group)? {
        GroupStatus::Finalized { standings } => standings
          .iter()
          .find(|standing| standing.rank == rank)
          .map(|standing| (Binding::Registration(standing.registration), Cause::GroupStanding(group))),
        _ => None,
      },
    }
  }

  fn evaluate_match(&mut self, id: MatchId) -> Result<(), EngineError> {
    let record = self.record(id)?;
    if record.outcome.is_some() {
      return Ok(());
    }
    let a = self.binding(SlotId::new(id, Side::A));
    let b = self.binding(SlotId::new(id, Side::B));
    match (a, b) {
      (Binding::Unresolved, Binding::Unresolved) => self.set_state(id, MatchState::Unseeded),
      (Binding::Unresolved, _) | (_, Binding::Unresolved) => self.set_state(id, MatchState::PartiallySeeded),
      (Binding::Registration(x), Binding::Registration(y)) if x == y => {
        return Err(self.occupant_conflict(id, x));
      }
      (Binding::Registration(x), Binding::Registration(y)) => {
        let restored = self
          .state
          .results
          .get(&id)
          .filter(|result| result.occupants == [x, y])
          .cloned();
        match restored {
          Some(result) => {
            debug!(match_id = %id, "restoring recorded result");
            self.record_result(id, result);
          }
          None => self.set_state(id, MatchState::FullySeeded),
        }
      }
      (a, b) => {
        let winner = a.registration().or(b.registration());
        debug!(match_id = %id, winner = ?winner, "decided by bye");
        self.decide(
          id,
          Outcome {
            occupants: [a, b],
            winner,
            loser: None,
            scores: Vec::new(),
            decided_by: DecidedBy::ByBye,
          },
        );
      }
    }
    Ok(())
  }

  fn occupant_conflict(&self, id: MatchId, registration: RegistrationId) -> EngineError {
    for side in Side::BOTH {
      let slot = SlotId::new(id, side);
      if self.index.seed(slot).and_then(|seed| seed.pin).is_some() {
        return EngineError::CorrectionConflict { slot, registration };
      }
    }
    EngineError::DuplicateOccupant { match_id: id, registration }
  }

  fn decide(&mut self, id: MatchId, outcome: Outcome) {
    if let Some(record) = self.state.matches.get_mut(&id) {
      record.state = MatchState::Decided(outcome.decided_by);
      record.outcome = Some(outcome);
      self.touched_matches.insert(id);
      self.queue.push_back(Work::Decided(id));
    }
  }

  fn propagate_decision(&mut self, id: MatchId) {
    self.set_state(id, MatchState::Terminal);
    for slot in self.index.dependents(EntityId::Match(id)) {
      self.queue.push_back(Work::Slot(*slot));
    }
    if let Some(group) = self.index.group_of(id) {
      self.queue.push_back(Work::Group(group));
    }
  }

  fn set_state(&mut self, id: MatchId, state: MatchState) {
    if let Some(record) = self.state.matches.get_mut(&id) {
      if record.state != state {
        record.state = state;
        self.touched_matches.insert(id);
      }
    }
  }

  fn evaluate_group(&mut self, id: GroupId) -> Result<(), EngineError> {
    let Some(group) = self.index.group(id) else {
      return Err(EngineError::UnknownGroup(id));
    };
    if !self.state.groups.get(&id).map(GroupStatus::is_open).unwrap_or(true) {
      return Ok(());
    }
    let complete = group.matches.iter().all(|m| {
      self
        .state
        .matches
        .get(m)
        .map(|record| record.state.is_terminal())
        .unwrap_or(false)
    });
    if !complete {
      return Ok(());
    }

    let members = self.effective_members(id);
    let played = self.played_in(id);
    let ranking = match self.state.standings_overrides.get(&id) {
      Some(order) => {
        let mut listed = order.clone();
        listed.sort();
        if listed == members {
          self.evaluator.ranked_from_order(order, &played)
        } else {
          warn!(group = %id, "standings override no longer matches group members; dropping it");
          self.state.standings_overrides.remove(&id);
          self.evaluator.rank(&members, &played)
        }
      }
      None => self.evaluator.rank(&members, &played),
    };
    let status = match ranking {
      Ranking::Ranked { standings } => {
        info!(group = %id, members = standings.len(), "group finalized");
        GroupStatus::Finalized { standings }
      }
      Ranking::Unresolved { standings, tied } => GroupStatus::Tied { standings, tied },
    };
    self.state.groups.insert(id, status);
    self.touched_groups.insert(id);
    self.reported_groups.insert(id);
    for slot in self.index.dependents(EntityId::Group(id)) {
      self.queue.push_back(Work::Slot(*slot));
    }
    Ok(())
  }

  /// Declared members plus whoever currently occupies the group's matches.
  fn effective_members(&self, id: GroupId) -> Vec<RegistrationId> {
    let Some(group) = self.index.group(id) else {
      return Vec::new();
    };
    let mut members: BTreeSet<RegistrationId> = group.members.iter().copied().collect();
    for m in &group.matches {
      for side in Side::BOTH {
        if let Some(registration) = self.binding(SlotId::new(*m, side)).registration() {
          members.insert(registration);
        }
      }
    }
    members.into_iter().collect()
  }

  fn played_in(&self, id: GroupId) -> Vec<PlayedMatch> {
    let Some(group) = self.index.group(id) else {
      return Vec::new();
    };
    group
      .matches
      .iter()
      .filter_map(|m| {
        let outcome = self.state.matches.get(m)?.outcome.as_ref()?;
        if outcome.decided_by != DecidedBy::ByPlay {
          return None;
        }
        Some(PlayedMatch {
          a: outcome.occupants[0].registration()?,
          b: outcome.occupants[1].registration()?,
          winner: outcome.winner?,
          scores: outcome.scores.clone(),
        })
      })
      .collect()
  }

  /// Unwinds everything causally downstream of `start`. Recorded play
  /// results stay in `results` so they can be restored on replay.
  fn retract(&mut self, start: Retract) {
    let mut stack = vec![start];
    while let Some(item) = stack.pop() {
      match item {
        Retract::Slot(slot) => {
          if self.state.bindings.unbind(slot).is_none() {
            continue;
          }
          debug!(slot = %slot, "slot unbound");
          self.touched_slots.insert(slot);
          let decided = self
            .state
            .matches
            .get(&slot.match_id)
            .map(|record| record.outcome.is_some())
            .unwrap_or(false);
          if decided {
            stack.push(Retract::Match(slot.match_id));
          } else {
            self.refresh_seeding(slot.match_id);
          }
        }
        Retract::Match(id) => {
          let Some(record) = self.state.matches.get_mut(&id) else {
            continue;
          };
          if record.outcome.take().is_none() {
            continue;
          }
          self.retracted.insert(id);
          self.touched_matches.insert(id);
          self.refresh_seeding(id);
          stack.extend(
            self
              .state
              .bindings
              .caused_by(Cause::MatchOutcome(id))
              .into_iter()
              .map(Retract::Slot),
          );
          if let Some(group) = self.index.group_of(id) {
            stack.push(Retract::Group(group));
          }
        }
        Retract::Group(id) => {
          let open = self.state.groups.get(&id).map(GroupStatus::is_open).unwrap_or(true);
          if open {
            continue;
          }
          self.state.groups.insert(id, GroupStatus::Open);
          self.touched_groups.insert(id);
          stack.extend(
            self
              .state
              .bindings
              .caused_by(Cause::GroupStanding(id))
              .into_iter()
              .map(Retract::Slot),
          );
        }
      }
    }
  }

  /// Seeding state of an undecided match, from its slot bindings.
  fn refresh_seeding(&mut self, id: MatchId) {
    let bound = Side::BOTH
      .iter()
      .filter(|side| self.binding(SlotId::new(id, **side)).is_bound())
      .count();
    let state = match bound {
      0 => MatchState::Unseeded,
      1 => MatchState::PartiallySeeded,
      _ => MatchState::FullySeeded,
    };
    self.set_state(id, state);
  }

  /// Drops stale results and diffs the working state against `before`.
  fn finish(&mut self, before: &BracketState) -> ChangeSet {
    let mut changes = ChangeSet::default();

    for id in &self.retracted {
      let decided = self
        .state
        .matches
        .get(id)
        .map(|record| record.outcome.is_some())
        .unwrap_or(false);
      if !decided && self.state.results.remove(id).is_some() {
        changes.invalidated_results.push(*id);
      }
    }

    let mut reseated = BTreeSet::new();
    for slot in &self.touched_slots {
      let after = self.state.bindings.get(*slot);
      let prior = before.bindings.get(*slot);
      if after.binding != prior.binding {
        reseated.insert(slot.match_id);
      }
      if after != prior {
        changes.slots.push(SlotChange {
          slot: *slot,
          binding: after.binding,
          cause: after.cause,
          version: after.version,
        });
      }
    }

    for id in &self.touched_matches {
      let Some(after) = self.state.matches.get(id) else {
        continue;
      };
      if before.matches.get(id) == Some(after) {
        continue;
      }
      let outcome = after.outcome.as_ref();
      changes.matches.push(MatchChange {
        match_id: *id,
        state: after.state,
        winner: outcome.and_then(|o| o.winner),
        loser: outcome.and_then(|o| o.loser),
      });
      if after.state == MatchState::FullySeeded {
        changes.ready.push(*id);
      }
    }
    // Still fully seeded, but with a different pairing than before.
    for id in reseated {
      let seeded = self.state.matches.get(&id).map(|record| record.state == MatchState::FullySeeded);
      if seeded == Some(true) && !changes.ready.contains(&id) {
        changes.ready.push(id);
      }
    }
    changes.ready.sort();

    for id in &self.touched_groups {
      let after = self.state.groups.get(id);
      if after != before.groups.get(id) && matches!(after, Some(GroupStatus::Finalized { .. })) {
        changes.finalized_groups.push(*id);
      }
    }

    for id in &self.reported_groups {
      for slot in self.index.dependents(EntityId::Group(*id)) {
        if self.binding(*slot).is_bound() {
          continue;
        }
        if let Some(blocked) = self.blocked_reason(*slot) {
          changes.blocked.push(blocked);
        }
      }
    }

    changes
  }

  fn blocked_reason(&self, slot: SlotId) -> Option<SeedingBlocked> {
    let Some(Upstream::Group { group, rank }) = self.index.upstream(slot) else {
      return None;
    };
    let reason = match self.state.groups.get(&group)? {
      GroupStatus::Open => BlockedReason::GroupOpen,
      GroupStatus::Tied { tied, .. } => BlockedReason::Tied { tied: tied.clone() },
      GroupStatus::Finalized { standings } => BlockedReason::RankUnavailable {
        rank,
        group_size: standings.len(),
      },
    };
    Some(SeedingBlocked { slot, group, reason })
  }
}
