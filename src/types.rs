use serde::{Deserialize, Serialize};
use std::{
    fmt,
    sync::Arc,
};

use crate::handle::TournamentHandle;
use crate::seed::Seed;

// ── Constants ──────────────────────────────────────────────────────────

pub const FIRST_STAGE_INDEX: u32 = 1;
pub const DEFAULT_BRACKET_FILE: &str = "group_to_knockout.json";

// ── Shared state type aliases ──────────────────────────────────────────

pub type SharedTournament = Arc<TournamentHandle>;

// ── Identifiers ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegistrationId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MatchId(pub u64);

/// Dense handle assigned to each group, in layout order, when the
/// dependency index is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub u32);

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for MatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Side {
    A,
    B,
}

impl Side {
    pub const BOTH: [Side; 2] = [Side::A, Side::B];

    pub fn index(self) -> usize {
        match self {
            Side::A => 0,
            Side::B => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotId {
    pub match_id: MatchId,
    pub side: Side,
}

impl SlotId {
    pub fn new(match_id: MatchId, side: Side) -> Self {
        SlotId { match_id, side }
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:?}", self.match_id, self.side)
    }
}

/// A node of the dependency graph: something a slot can wait on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "id")]
pub enum EntityId {
    Group(GroupId),
    Match(MatchId),
}

// ── Bracket layout (supplied by the bracket generator) ─────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StageKind {
    Group,
    Knockout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TournamentConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub stages: Vec<StageConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageConfig {
    pub index: u32,
    pub kind: StageKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<GroupConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matches: Vec<MatchConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupConfig {
    pub code: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<RegistrationId>,
    #[serde(default)]
    pub matches: Vec<MatchConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchConfig {
    pub id: MatchId,
    #[serde(default = "default_round")]
    pub round: u32,
    #[serde(default)]
    pub order: u32,
    pub seed_a: Seed,
    pub seed_b: Seed,
}

fn default_round() -> u32 {
    1
}

impl MatchConfig {
    pub fn seed_mut(&mut self, side: Side) -> &mut Seed {
        match side {
            Side::A => &mut self.seed_a,
            Side::B => &mut self.seed_b,
        }
    }
}

impl TournamentConfig {
    pub fn match_mut(&mut self, id: MatchId) -> Option<&mut MatchConfig> {
        self.stages.iter_mut().find_map(|stage| {
            let StageConfig { matches, groups, .. } = stage;
            matches
                .iter_mut()
                .chain(groups.iter_mut().flat_map(|group| group.matches.iter_mut()))
                .find(|m| m.id == id)
        })
    }
}

// ── Results & runtime state ────────────────────────────────────────────

/// Points of one game, oriented by slot side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GameScore {
    pub a: u32,
    pub b: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DecidedBy {
    ByBye,
    ByPlay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MatchState {
    Unseeded,
    PartiallySeeded,
    FullySeeded,
    Decided(DecidedBy),
    Terminal,
}

impl MatchState {
    pub fn is_terminal(self) -> bool {
        matches!(self, MatchState::Decided(_) | MatchState::Terminal)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "registration")]
pub enum Binding {
    #[default]
    Unresolved,
    Registration(RegistrationId),
    Bye,
}

impl Binding {
    pub fn is_bound(self) -> bool {
        !matches!(self, Binding::Unresolved)
    }

    pub fn registration(self) -> Option<RegistrationId> {
        match self {
            Binding::Registration(id) => Some(id),
            _ => None,
        }
    }
}

impl From<Option<RegistrationId>> for Binding {
    fn from(value: Option<RegistrationId>) -> Self {
        value.map(Binding::Registration).unwrap_or(Binding::Bye)
    }
}
