use serde::{Deserialize, Serialize};
use std::{
  collections::{BTreeMap, BTreeSet},
  fmt,
  str::FromStr,
};

use crate::types::{GameScore, RegistrationId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TieBreak {
  Wins,
  HeadToHead,
  PointDifferential,
  PointsScored,
}

pub const DEFAULT_TIE_BREAKS: [TieBreak; 4] = [
  TieBreak::Wins,
  TieBreak::HeadToHead,
  TieBreak::PointDifferential,
  TieBreak::PointsScored,
];

impl FromStr for TieBreak {
  type Err = String;

  fn from_str(raw: &str) -> Result<Self, Self::Err> {
    let key = raw.trim().to_ascii_lowercase().replace(['-', '_', ' '], "");
    match key.as_str() {
      "wins" => Ok(TieBreak::Wins),
      "headtohead" | "h2h" => Ok(TieBreak::HeadToHead),
      "pointdifferential" | "pointdiff" | "diff" => Ok(TieBreak::PointDifferential),
      "pointsscored" | "pointsfor" | "pf" => Ok(TieBreak::PointsScored),
      _ => Err(format!("unknown tie-break rule \"{}\"", raw.trim())),
    }
  }
}

impl fmt::Display for TieBreak {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let label = match self {
      TieBreak::Wins => "wins",
      TieBreak::HeadToHead => "headToHead",
      TieBreak::PointDifferential => "pointDifferential",
      TieBreak::PointsScored => "pointsScored",
    };
    f.write_str(label)
  }
}

/// A played (not bye-decided) match between two group members.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlayedMatch {
  pub a: RegistrationId,
  pub b: RegistrationId,
  pub winner: RegistrationId,
  pub scores: Vec<GameScore>,
}

impl PlayedMatch {
  fn points(&self) -> (u64, u64) {
    self.scores.iter().fold((0, 0), |(a, b), game| (a + game.a as u64, b + game.b as u64))
  }

  fn involves(&self, x: RegistrationId, y: RegistrationId) -> bool {
    (self.a == x && self.b == y) || (self.a == y && self.b == x)
  }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Standing {
  pub registration: RegistrationId,
  pub rank: u32,
  pub played: u32,
  pub wins: u32,
  pub losses: u32,
  pub points_for: u64,
  pub points_against: u64,
}

impl Standing {
  fn empty(registration: RegistrationId) -> Self {
    Standing {
      registration,
      rank: 0,
      played: 0,
      wins: 0,
      losses: 0,
      points_for: 0,
      points_against: 0,
    }
  }

  pub fn point_differential(&self) -> i64 {
    self.points_for as i64 - self.points_against as i64
  }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum Ranking {
  Ranked {
    standings: Vec<Standing>,
  },
  /// Tied registrations share the rank of the first place their set covers.
  Unresolved {
    standings: Vec<Standing>,
    tied: Vec<Vec<RegistrationId>>,
  },
}

impl Ranking {
  pub fn standings(&self) -> &[Standing] {
    match self {
      Ranking::Ranked { standings } | Ranking::Unresolved { standings, .. } => standings,
    }
  }

  pub fn is_resolved(&self) -> bool {
    matches!(self, Ranking::Ranked { .. })
  }

  /// The registration at a 1-based rank, only for a fully ordered ranking.
  pub fn at_rank(&self, rank: u32) -> Option<RegistrationId> {
    match self {
      Ranking::Ranked { standings } => standings
        .get((rank as usize).checked_sub(1)?)
        .map(|standing| standing.registration),
      Ranking::Unresolved { .. } => None,
    }
  }
}

/// Computes group standings. Applies the tie-break rules in order until
/// every member holds a distinct place; never guesses past the last rule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RankingEvaluator {
  policy: Vec<TieBreak>,
}

impl Default for RankingEvaluator {
  fn default() -> Self {
    RankingEvaluator { policy: DEFAULT_TIE_BREAKS.to_vec() }
  }
}

impl RankingEvaluator {
  pub fn new(policy: Vec<TieBreak>) -> Self {
    RankingEvaluator { policy }
  }

  pub fn policy(&self) -> &[TieBreak] {
    &self.policy
  }

  pub fn rank(&self, members: &[RegistrationId], played: &[PlayedMatch]) -> Ranking {
    let stats = tally(members, played);
    let mut classes: Vec<Vec<RegistrationId>> = Vec::new();
    if !stats.is_empty() {
      classes.push(stats.keys().copied().collect());
    }

    for rule in &self.policy {
      classes = classes
        .into_iter()
        .flat_map(|class| split_class(*rule, class, &stats, played))
        .collect();
    }

    let mut standings = Vec::with_capacity(stats.len());
    let mut tied = Vec::new();
    let mut place = 1u32;
    for class in classes {
      for registration in &class {
        if let Some(stat) = stats.get(registration) {
          standings.push(Standing { rank: place, ..stat.clone() });
        }
      }
      place += class.len() as u32;
      if class.len() > 1 {
        tied.push(class);
      }
    }

    if tied.is_empty() {
      Ranking::Ranked { standings }
    } else {
      Ranking::Unresolved { standings, tied }
    }
  }

  /// Standings for an operator-supplied final order.
  pub fn ranked_from_order(&self, order: &[RegistrationId], played: &[PlayedMatch]) -> Ranking {
    let stats = tally(order, played);
    let standings = order
      .iter()
      .enumerate()
      .filter_map(|(pos, registration)| {
        stats
          .get(registration)
          .map(|stat| Standing { rank: pos as u32 + 1, ..stat.clone() })
      })
      .collect();
    Ranking::Ranked { standings }
  }
}

fn tally(members: &[RegistrationId], played: &[PlayedMatch]) -> BTreeMap<RegistrationId, Standing> {
  let mut stats: BTreeMap<RegistrationId, Standing> = members
    .iter()
    .map(|id| (*id, Standing::empty(*id)))
    .collect();

  for game in played {
    if game.a == game.b || !stats.contains_key(&game.a) || !stats.contains_key(&game.b) {
      continue;
    }
    if game.winner != game.a && game.winner != game.b {
      continue;
    }
    let (points_a, points_b) = game.points();
    for (me, scored, conceded) in [(game.a, points_a, points_b), (game.b, points_b, points_a)] {
      if let Some(stat) = stats.get_mut(&me) {
        stat.played += 1;
        stat.points_for += scored;
        stat.points_against += conceded;
        if game.winner == me {
          stat.wins += 1;
        } else {
          stat.losses += 1;
        }
      }
    }
  }
  stats
}

fn split_class(
  rule: TieBreak,
  class: Vec<RegistrationId>,
  stats: &BTreeMap<RegistrationId, Standing>,
  played: &[PlayedMatch],
) -> Vec<Vec<RegistrationId>> {
  if class.len() < 2 {
    return vec![class];
  }
  match rule {
    TieBreak::Wins => split_by_key(class, |id| stats.get(id).map(|s| s.wins as i64).unwrap_or(0)),
    TieBreak::PointDifferential => {
      split_by_key(class, |id| stats.get(id).map(Standing::point_differential).unwrap_or(0))
    }
    TieBreak::PointsScored => {
      split_by_key(class, |id| stats.get(id).map(|s| s.points_for as i64).unwrap_or(0))
    }
    TieBreak::HeadToHead => {
      if class.len() != 2 {
        return vec![class];
      }
      let (x, y) = (class[0], class[1]);
      let between = played.iter().filter(|game| game.involves(x, y));
      let (x_wins, y_wins) = between.fold((0u32, 0u32), |(xw, yw), game| {
        if game.winner == x {
          (xw + 1, yw)
        } else if game.winner == y {
          (xw, yw + 1)
        } else {
          (xw, yw)
        }
      });
      if x_wins > y_wins {
        vec![vec![x], vec![y]]
      } else if y_wins > x_wins {
        vec![vec![y], vec![x]]
      } else {
        vec![class]
      }
    }
  }
}

/// Splits a class into runs of equal key, highest key first. Members keep
/// ascending id order inside a run.
fn split_by_key<F>(class: Vec<RegistrationId>, key: F) -> Vec<Vec<RegistrationId>>
where
  F: Fn(&RegistrationId) -> i64,
{
  let keys: BTreeSet<i64> = class.iter().map(&key).collect();
  keys
    .into_iter()
    .rev()
    .map(|value| class.iter().copied().filter(|id| key(id) == value).collect())
    .collect()
}
