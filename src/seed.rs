use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{MatchId, RegistrationId};

/// How one slot's occupant is derived. Inert data; the dependency index
/// turns the positional references into handles.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SeedSource {
  Registration {
    registration: RegistrationId,
  },
  Bye,
  GroupRank {
    #[serde(alias = "stageIndex")]
    stage: u32,
    #[serde(rename = "groupCode")]
    group_code: String,
    rank: u32,
  },
  StageMatchWinner {
    #[serde(alias = "stageIndex")]
    stage: u32,
    round: u32,
    order: u32,
  },
  StageMatchLoser {
    #[serde(alias = "stageIndex")]
    stage: u32,
    round: u32,
    order: u32,
  },
}

/// Explicit override that short-circuits derived resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HardPin {
  Registration {
    registration: RegistrationId,
  },
  Match {
    #[serde(rename = "matchId")]
    match_id: MatchId,
  },
}

/// Which outcome of an upstream match a slot takes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Placement {
  Winner,
  Loser,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "SeedRepr")]
pub struct Seed {
  pub source: SeedSource,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub pin: Option<HardPin>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SeedRepr {
  Pinned {
    source: SeedSource,
    #[serde(default)]
    pin: Option<HardPin>,
  },
  Plain(SeedSource),
}

impl From<SeedRepr> for Seed {
  fn from(repr: SeedRepr) -> Self {
    match repr {
      SeedRepr::Pinned { source, pin } => Seed { source, pin },
      SeedRepr::Plain(source) => Seed { source, pin: None },
    }
  }
}

impl From<SeedSource> for Seed {
  fn from(source: SeedSource) -> Self {
    Seed { source, pin: None }
  }
}

impl SeedSource {
  pub fn registration(id: u32) -> Self {
    SeedSource::Registration { registration: RegistrationId(id) }
  }

  pub fn group_rank(stage: u32, group_code: &str, rank: u32) -> Self {
    SeedSource::GroupRank { stage, group_code: group_code.to_string(), rank }
  }

  pub fn winner_of(stage: u32, round: u32, order: u32) -> Self {
    SeedSource::StageMatchWinner { stage, round, order }
  }

  pub fn loser_of(stage: u32, round: u32, order: u32) -> Self {
    SeedSource::StageMatchLoser { stage, round, order }
  }

  /// Sources that need no upstream entity to resolve.
  pub fn is_static(&self) -> bool {
    matches!(self, SeedSource::Registration { .. } | SeedSource::Bye)
  }

  pub fn placement(&self) -> Placement {
    match self {
      SeedSource::StageMatchLoser { .. } => Placement::Loser,
      _ => Placement::Winner,
    }
  }
}

impl Seed {
  pub fn pinned(source: SeedSource, pin: HardPin) -> Self {
    Seed { source, pin: Some(pin) }
  }

  /// True when the slot can be bound without waiting on anything.
  pub fn is_immediate(&self) -> bool {
    match self.pin {
      Some(HardPin::Registration { .. }) => true,
      Some(HardPin::Match { .. }) => false,
      None => self.source.is_static(),
    }
  }
}

impl fmt::Display for SeedSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      SeedSource::Registration { registration } => write!(f, "REG#{registration}"),
      SeedSource::Bye => write!(f, "BYE"),
      SeedSource::GroupRank { stage, group_code, rank } => {
        write!(f, "V{stage}-{}#{rank}", normalize_group_code(group_code))
      }
      SeedSource::StageMatchWinner { stage, round, order } => {
        write!(f, "W V{stage}-R{round}#{order}")
      }
      SeedSource::StageMatchLoser { stage, round, order } => {
        write!(f, "L V{stage}-R{round}#{order}")
      }
    }
  }
}

impl fmt::Display for Seed {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.pin {
      Some(HardPin::Registration { registration }) => write!(f, "{} [pin REG#{registration}]", self.source),
      Some(HardPin::Match { match_id }) => write!(f, "{} [pin M{match_id}]", self.source),
      None => write!(f, "{}", self.source),
    }
  }
}

pub fn normalize_group_code(raw: &str) -> String {
  raw.trim().to_uppercase()
}

/// `"2"`, `"B2"` and `"G2"` all name the second group of a stage.
pub fn group_order_alias(raw: &str) -> Option<u32> {
  let code = normalize_group_code(raw);
  let digits = code
    .strip_prefix('B')
    .or_else(|| code.strip_prefix('G'))
    .unwrap_or(&code);
  digits.parse().ok().filter(|order| *order > 0)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_plain_seed_parses_without_pin() {
    let seed: Seed = serde_json::from_str(r#"{"type":"groupRank","stage":1,"groupCode":"a","rank":2}"#).unwrap();
    assert_eq!(seed.source, SeedSource::group_rank(1, "a", 2));
    assert!(seed.pin.is_none());
    assert!(!seed.is_immediate());
  }

  #[test]
  fn test_pinned_seed_parses() {
    let raw = r#"{"source":{"type":"stageMatchWinner","stageIndex":2,"round":1,"order":3},"pin":{"type":"registration","registration":9}}"#;
    let seed: Seed = serde_json::from_str(raw).unwrap();
    assert_eq!(seed.source, SeedSource::winner_of(2, 1, 3));
    assert_eq!(seed.pin, Some(HardPin::Registration { registration: RegistrationId(9) }));
    assert!(seed.is_immediate());
  }

  #[test]
  fn test_bye_and_registration_are_static() {
    let bye: Seed = serde_json::from_str(r#"{"type":"bye"}"#).unwrap();
    assert!(bye.is_immediate());
    assert!(SeedSource::registration(4).is_static());
    assert!(!SeedSource::loser_of(1, 1, 1).is_static());
  }

  #[test]
  fn test_match_pin_is_not_immediate() {
    let seed = Seed::pinned(SeedSource::Bye, HardPin::Match { match_id: MatchId(7) });
    assert!(!seed.is_immediate());
  }

  #[test]
  fn test_labels() {
    assert_eq!(SeedSource::group_rank(1, " a ", 1).to_string(), "V1-A#1");
    assert_eq!(SeedSource::winner_of(2, 1, 3).to_string(), "W V2-R1#3");
    assert_eq!(SeedSource::loser_of(2, 1, 3).to_string(), "L V2-R1#3");
    assert_eq!(SeedSource::registration(12).to_string(), "REG#12");
    let pinned = Seed::pinned(SeedSource::Bye, HardPin::Registration { registration: RegistrationId(3) });
    assert_eq!(pinned.to_string(), "BYE [pin REG#3]");
  }

  #[test]
  fn test_group_order_alias() {
    assert_eq!(group_order_alias("2"), Some(2));
    assert_eq!(group_order_alias(" b3 "), Some(3));
    assert_eq!(group_order_alias("G1"), Some(1));
    assert_eq!(group_order_alias("A"), None);
    assert_eq!(group_order_alias("B"), None);
    assert_eq!(group_order_alias("0"), None);
  }

  #[test]
  fn test_seed_serializes_as_source_object() {
    let seed = Seed::from(SeedSource::Bye);
    let value = serde_json::to_value(&seed).unwrap();
    assert_eq!(value, serde_json::json!({ "source": { "type": "bye" } }));
    let back: Seed = serde_json::from_value(value).unwrap();
    assert_eq!(back, seed);
  }
}
