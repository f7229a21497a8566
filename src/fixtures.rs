//! Bracket layouts shared by the unit tests.

use crate::seed::SeedSource;
use crate::types::{
  GroupConfig, MatchConfig, MatchId, RegistrationId, StageConfig, StageKind, TournamentConfig,
};

pub fn reg(id: u32) -> RegistrationId {
  RegistrationId(id)
}

pub fn knockout_match(id: u64, round: u32, order: u32, a: SeedSource, b: SeedSource) -> MatchConfig {
  MatchConfig {
    id: MatchId(id),
    round,
    order,
    seed_a: a.into(),
    seed_b: b.into(),
  }
}

/// Single round robin among `members`; match ids count up from `first_id`.
pub fn round_robin(code: &str, first_id: u64, members: &[u32]) -> GroupConfig {
  let mut matches = Vec::new();
  let mut next_id = first_id;
  for (i, a) in members.iter().enumerate() {
    for b in &members[i + 1..] {
      let order = matches.len() as u32 + 1;
      matches.push(knockout_match(
        next_id,
        1,
        order,
        SeedSource::registration(*a),
        SeedSource::registration(*b),
      ));
      next_id += 1;
    }
  }
  GroupConfig {
    code: code.to_string(),
    members: members.iter().copied().map(RegistrationId).collect(),
    matches,
  }
}

pub fn group_stage(index: u32, groups: Vec<GroupConfig>) -> StageConfig {
  StageConfig {
    index,
    kind: StageKind::Group,
    groups,
    matches: Vec::new(),
  }
}

pub fn knockout_stage(index: u32, matches: Vec<MatchConfig>) -> StageConfig {
  StageConfig {
    index,
    kind: StageKind::Knockout,
    groups: Vec::new(),
    matches,
  }
}

pub fn tournament(stages: Vec<StageConfig>) -> TournamentConfig {
  TournamentConfig {
    id: "t-test".to_string(),
    name: None,
    stages,
  }
}

/// Group A of registrations 1..=4 (matches 101..=106) whose top two meet
/// in stage 2 match 201.
pub fn group_into_final() -> TournamentConfig {
  tournament(vec![
    group_stage(1, vec![round_robin("A", 101, &[1, 2, 3, 4])]),
    knockout_stage(
      2,
      vec![knockout_match(
        201,
        1,
        1,
        SeedSource::group_rank(1, "A", 1),
        SeedSource::group_rank(1, "A", 2),
      )],
    ),
  ])
}

/// Stage 1 matches 101 (1 v 2) and 102 (3 v 4); stage 2 match 201 pairs a
/// bye with the winner of stage 1 round 1 order 2.
pub fn bye_into_stage_two() -> TournamentConfig {
  tournament(vec![
    knockout_stage(
      1,
      vec![
        knockout_match(101, 1, 1, SeedSource::registration(1), SeedSource::registration(2)),
        knockout_match(102, 1, 2, SeedSource::registration(3), SeedSource::registration(4)),
      ],
    ),
    knockout_stage(
      2,
      vec![knockout_match(201, 1, 1, SeedSource::Bye, SeedSource::winner_of(1, 1, 2))],
    ),
  ])
}

/// Semis 101 (1 v 2) and 102 (3 v 4), final 103, third-place match 104.
pub fn four_player_knockout() -> TournamentConfig {
  tournament(vec![knockout_stage(
    1,
    vec![
      knockout_match(101, 1, 1, SeedSource::registration(1), SeedSource::registration(2)),
      knockout_match(102, 1, 2, SeedSource::registration(3), SeedSource::registration(4)),
      knockout_match(103, 2, 1, SeedSource::winner_of(1, 1, 1), SeedSource::winner_of(1, 1, 2)),
      knockout_match(104, 2, 2, SeedSource::loser_of(1, 1, 1), SeedSource::loser_of(1, 1, 2)),
    ],
  )])
}

/// Four player knockout feeding a stage 2 decider between the stage 1
/// champion and a fixed registration 9.
pub fn knockout_into_decider() -> TournamentConfig {
  let mut layout = four_player_knockout();
  layout.stages.push(knockout_stage(
    2,
    vec![knockout_match(201, 1, 1, SeedSource::winner_of(1, 2, 1), SeedSource::registration(9))],
  ));
  layout
}
