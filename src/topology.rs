use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::TopologyError;
use crate::seed::{group_order_alias, normalize_group_code, HardPin, Placement, Seed, SeedSource};
use crate::types::{
  EntityId, GroupId, MatchId, RegistrationId, Side, SlotId, StageKind, TournamentConfig,
};

static NO_DEPENDENTS: BTreeSet<SlotId> = BTreeSet::new();

/// A seed reference resolved to a concrete graph node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Upstream {
  Group { group: GroupId, rank: u32 },
  Match { match_id: MatchId, placement: Placement },
}

impl Upstream {
  pub fn entity(self) -> EntityId {
    match self {
      Upstream::Group { group, .. } => EntityId::Group(group),
      Upstream::Match { match_id, .. } => EntityId::Match(match_id),
    }
  }
}

#[derive(Clone, Debug)]
pub struct MatchNode {
  pub id: MatchId,
  pub stage: u32,
  pub round: u32,
  pub order: u32,
  pub group: Option<GroupId>,
  pub seeds: [Seed; 2],
  pub upstream: [Option<Upstream>; 2],
}

impl MatchNode {
  pub fn seed(&self, side: Side) -> &Seed {
    &self.seeds[side.index()]
  }
}

#[derive(Clone, Debug)]
pub struct GroupNode {
  pub id: GroupId,
  pub stage: u32,
  pub code: String,
  pub members: Vec<RegistrationId>,
  pub matches: Vec<MatchId>,
}

/// Groups by stage and code, falling back to their 1-based position in the
/// stage when the code does not match.
#[derive(Clone, Debug, Default)]
struct GroupLookup {
  by_code: HashMap<(u32, String), GroupId>,
  by_order: HashMap<(u32, u32), GroupId>,
}

impl GroupLookup {
  fn contains(&self, stage: u32, code: &str) -> bool {
    self.by_code.contains_key(&(stage, code.to_string()))
  }

  fn insert(&mut self, stage: u32, code: String, id: GroupId) {
    let order = self.by_order.keys().filter(|(s, _)| *s == stage).count() as u32 + 1;
    self.by_order.insert((stage, order), id);
    self.by_code.insert((stage, code), id);
  }

  fn find(&self, stage: u32, raw: &str) -> Option<GroupId> {
    if let Some(id) = self.by_code.get(&(stage, normalize_group_code(raw))) {
      return Some(*id);
    }
    let order = group_order_alias(raw)?;
    self.by_order.get(&(stage, order)).copied()
  }
}

/// Reverse adjacency from upstream entities to the slots waiting on them,
/// plus a deterministic topological order of groups and matches.
#[derive(Clone, Debug)]
pub struct DependencyIndex {
  layout: TournamentConfig,
  matches: BTreeMap<MatchId, MatchNode>,
  groups: Vec<GroupNode>,
  group_lookup: GroupLookup,
  addresses: HashMap<(u32, u32, u32), MatchId>,
  dependents: HashMap<EntityId, BTreeSet<SlotId>>,
  topo_order: Vec<EntityId>,
}

impl DependencyIndex {
  pub fn build(layout: &TournamentConfig) -> Result<Self, TopologyError> {
    if layout.stages.is_empty() {
      return Err(TopologyError::NoStages);
    }

    let mut stage_kinds: HashMap<u32, StageKind> = HashMap::new();
    let mut matches: BTreeMap<MatchId, MatchNode> = BTreeMap::new();
    let mut groups: Vec<GroupNode> = Vec::new();
    let mut group_lookup = GroupLookup::default();
    let mut addresses = HashMap::new();
    let mut previous: Option<u32> = None;

    for stage in &layout.stages {
      let expected = previous.map(|index| index + 1).unwrap_or(crate::types::FIRST_STAGE_INDEX);
      if stage.index < expected {
        return Err(TopologyError::StageOrder { stage: stage.index, expected });
      }
      previous = Some(stage.index);
      stage_kinds.insert(stage.index, stage.kind);

      match stage.kind {
        StageKind::Group => {
          if !stage.matches.is_empty() {
            return Err(TopologyError::StageShape {
              stage: stage.index,
              reason: "group stage lists matches outside of any group",
            });
          }
          for group in &stage.groups {
            let code = normalize_group_code(&group.code);
            if group_lookup.contains(stage.index, &code) {
              return Err(TopologyError::DuplicateGroup { stage: stage.index, code });
            }
            let id = GroupId(groups.len() as u32);
            group_lookup.insert(stage.index, code.clone(), id);

            let mut members = group.members.clone();
            members.sort();
            members.dedup();
            let mut match_ids = Vec::with_capacity(group.matches.len());
            for config in &group.matches {
              if matches.contains_key(&config.id) {
                return Err(TopologyError::DuplicateMatch(config.id));
              }
              matches.insert(
                config.id,
                MatchNode {
                  id: config.id,
                  stage: stage.index,
                  round: config.round,
                  order: config.order,
                  group: Some(id),
                  seeds: [config.seed_a.clone(), config.seed_b.clone()],
                  upstream: [None, None],
                },
              );
              match_ids.push(config.id);
            }
            groups.push(GroupNode {
              id,
              stage: stage.index,
              code,
              members,
              matches: match_ids,
            });
          }
        }
        StageKind::Knockout => {
          if !stage.groups.is_empty() {
            return Err(TopologyError::StageShape {
              stage: stage.index,
              reason: "knockout stage lists groups",
            });
          }
          for config in &stage.matches {
            if matches.contains_key(&config.id) {
              return Err(TopologyError::DuplicateMatch(config.id));
            }
            let address = (stage.index, config.round, config.order);
            if addresses.insert(address, config.id).is_some() {
              return Err(TopologyError::DuplicateAddress {
                stage: stage.index,
                round: config.round,
                order: config.order,
              });
            }
            matches.insert(
              config.id,
              MatchNode {
                id: config.id,
                stage: stage.index,
                round: config.round,
                order: config.order,
                group: None,
                seeds: [config.seed_a.clone(), config.seed_b.clone()],
                upstream: [None, None],
              },
            );
          }
        }
      }
    }

    let mut resolved = Vec::new();
    for node in matches.values() {
      for side in Side::BOTH {
        let slot = SlotId::new(node.id, side);
        let seed = node.seed(side);
        let upstream = resolve_upstream(slot, seed, &stage_kinds, &group_lookup, &addresses, &matches)?;
        resolved.push((slot, upstream));
      }
    }

    let mut dependents: HashMap<EntityId, BTreeSet<SlotId>> = HashMap::new();
    for (slot, upstream) in resolved {
      if let Some(node) = matches.get_mut(&slot.match_id) {
        node.upstream[slot.side.index()] = upstream;
      }
      if let Some(upstream) = upstream {
        dependents.entry(upstream.entity()).or_default().insert(slot);
      }
    }

    let mut index = DependencyIndex {
      layout: layout.clone(),
      matches,
      groups,
      group_lookup,
      addresses,
      dependents,
      topo_order: Vec::new(),
    };
    index.sort_topologically()?;
    Ok(index)
  }

  /// Rebuilds the index with a hard pin set (or cleared) on one slot.
  pub fn with_pin(&self, slot: SlotId, pin: Option<HardPin>) -> Result<Self, TopologyError> {
    let mut layout = self.layout.clone();
    if let Some(config) = layout.match_mut(slot.match_id) {
      config.seed_mut(slot.side).pin = pin;
    }
    DependencyIndex::build(&layout)
  }

  fn sort_topologically(&mut self) -> Result<(), TopologyError> {
    let mut successors: HashMap<EntityId, Vec<EntityId>> = HashMap::new();
    let mut in_degree: BTreeMap<EntityId, usize> = BTreeMap::new();
    for group in &self.groups {
      in_degree.insert(EntityId::Group(group.id), 0);
    }
    for id in self.matches.keys() {
      in_degree.insert(EntityId::Match(*id), 0);
    }
    for node in self.matches.values() {
      for upstream in node.upstream.iter().flatten() {
        successors.entry(upstream.entity()).or_default().push(EntityId::Match(node.id));
        *in_degree.entry(EntityId::Match(node.id)).or_default() += 1;
      }
      if let Some(group) = node.group {
        successors.entry(EntityId::Match(node.id)).or_default().push(EntityId::Group(group));
        *in_degree.entry(EntityId::Group(group)).or_default() += 1;
      }
    }

    let mut ready: BTreeSet<EntityId> = in_degree
      .iter()
      .filter(|(_, degree)| **degree == 0)
      .map(|(entity, _)| *entity)
      .collect();
    let mut order = Vec::with_capacity(in_degree.len());
    while let Some(entity) = ready.pop_first() {
      order.push(entity);
      for next in successors.get(&entity).into_iter().flatten() {
        if let Some(degree) = in_degree.get_mut(next) {
          *degree -= 1;
          if *degree == 0 {
            ready.insert(*next);
          }
        }
      }
    }

    if order.len() < in_degree.len() {
      let placed: BTreeSet<EntityId> = order.iter().copied().collect();
      let remaining: BTreeSet<EntityId> = in_degree
        .keys()
        .filter(|entity| !placed.contains(entity))
        .copied()
        .collect();
      let slot = self
        .locate_cycle(&remaining)
        .or_else(|| self.first_remaining_slot(&remaining));
      let Some(slot) = slot else {
        return Err(TopologyError::StageShape { stage: 0, reason: "unresolvable dependency cycle" });
      };
      let seed = self.seed(slot).map(|seed| seed.to_string()).unwrap_or_default();
      return Err(TopologyError::Cycle { slot, seed });
    }

    self.topo_order = order;
    Ok(())
  }

  fn predecessors(&self, entity: EntityId) -> Vec<(EntityId, Option<SlotId>)> {
    match entity {
      EntityId::Match(id) => {
        let Some(node) = self.matches.get(&id) else {
          return Vec::new();
        };
        Side::BOTH
          .iter()
          .filter_map(|side| {
            node.upstream[side.index()].map(|upstream| (upstream.entity(), Some(SlotId::new(id, *side))))
          })
          .collect()
      }
      EntityId::Group(id) => self
        .group(id)
        .map(|group| group.matches.iter().map(|m| (EntityId::Match(*m), None)).collect())
        .unwrap_or_default(),
    }
  }

  /// Walks predecessors inside the unsorted remainder until a node repeats,
  /// then names the smallest slot on that loop.
  fn locate_cycle(&self, remaining: &BTreeSet<EntityId>) -> Option<SlotId> {
    let mut path: Vec<Option<SlotId>> = Vec::new();
    let mut seen: HashMap<EntityId, usize> = HashMap::new();
    let mut current = *remaining.iter().next()?;
    loop {
      if let Some(&pos) = seen.get(&current) {
        return path[pos..].iter().flatten().min().copied();
      }
      seen.insert(current, path.len());
      let (pred, slot) = self
        .predecessors(current)
        .into_iter()
        .filter(|(pred, _)| remaining.contains(pred))
        .min()?;
      path.push(slot);
      current = pred;
    }
  }

  fn first_remaining_slot(&self, remaining: &BTreeSet<EntityId>) -> Option<SlotId> {
    remaining.iter().find_map(|entity| match entity {
      EntityId::Match(id) => self.matches.get(id).and_then(|node| {
        Side::BOTH
          .iter()
          .find(|side| node.upstream[side.index()].is_some())
          .map(|side| SlotId::new(*id, *side))
      }),
      EntityId::Group(_) => None,
    })
  }

  pub fn dependents(&self, entity: EntityId) -> &BTreeSet<SlotId> {
    self.dependents.get(&entity).unwrap_or(&NO_DEPENDENTS)
  }

  pub fn tournament_id(&self) -> &str {
    &self.layout.id
  }

  pub fn layout(&self) -> &TournamentConfig {
    &self.layout
  }

  pub fn node(&self, id: MatchId) -> Option<&MatchNode> {
    self.matches.get(&id)
  }

  pub fn nodes(&self) -> impl Iterator<Item = &MatchNode> {
    self.matches.values()
  }

  pub fn slots(&self) -> impl Iterator<Item = SlotId> + '_ {
    self
      .matches
      .keys()
      .flat_map(|id| Side::BOTH.map(|side| SlotId::new(*id, side)))
  }

  pub fn contains_slot(&self, slot: SlotId) -> bool {
    self.matches.contains_key(&slot.match_id)
  }

  pub fn seed(&self, slot: SlotId) -> Option<&Seed> {
    self.matches.get(&slot.match_id).map(|node| node.seed(slot.side))
  }

  pub fn upstream(&self, slot: SlotId) -> Option<Upstream> {
    self.matches.get(&slot.match_id).and_then(|node| node.upstream[slot.side.index()])
  }

  pub fn group(&self, id: GroupId) -> Option<&GroupNode> {
    self.groups.get(id.0 as usize)
  }

  pub fn groups(&self) -> &[GroupNode] {
    &self.groups
  }

  pub fn group_of(&self, id: MatchId) -> Option<GroupId> {
    self.matches.get(&id).and_then(|node| node.group)
  }

  pub fn group_id(&self, stage: u32, code: &str) -> Option<GroupId> {
    self.group_lookup.find(stage, code)
  }

  pub fn match_at(&self, stage: u32, round: u32, order: u32) -> Option<MatchId> {
    self.addresses.get(&(stage, round, order)).copied()
  }

  pub fn topo_order(&self) -> &[EntityId] {
    &self.topo_order
  }
}

fn resolve_upstream(
  slot: SlotId,
  seed: &Seed,
  stage_kinds: &HashMap<u32, StageKind>,
  group_lookup: &GroupLookup,
  addresses: &HashMap<(u32, u32, u32), MatchId>,
  matches: &BTreeMap<MatchId, MatchNode>,
) -> Result<Option<Upstream>, TopologyError> {
  let dangling = |missing: String| TopologyError::Dangling {
    slot,
    seed: seed.to_string(),
    missing,
  };

  // The source must resolve even while a pin shadows it; clearing the pin
  // falls back to it.
  let positional = match &seed.source {
    SeedSource::Registration { .. } | SeedSource::Bye => None,
    SeedSource::GroupRank { stage, group_code, rank } => {
      if *rank == 0 {
        return Err(TopologyError::InvalidRank { slot, seed: seed.to_string() });
      }
      if stage_kinds.get(stage) != Some(&StageKind::Group) {
        return Err(dangling(format!("group stage {stage}")));
      }
      let group = group_lookup.find(*stage, group_code).ok_or_else(|| {
        dangling(format!("group {} in stage {stage}", normalize_group_code(group_code)))
      })?;
      Some(Upstream::Group { group, rank: *rank })
    }
    SeedSource::StageMatchWinner { stage, round, order } | SeedSource::StageMatchLoser { stage, round, order } => {
      if stage_kinds.get(stage) != Some(&StageKind::Knockout) {
        return Err(dangling(format!("knockout stage {stage}")));
      }
      let match_id = addresses
        .get(&(*stage, *round, *order))
        .copied()
        .ok_or_else(|| dangling(format!("round {round} order {order} in stage {stage}")))?;
      Some(Upstream::Match { match_id, placement: seed.source.placement() })
    }
  };

  match seed.pin {
    None => Ok(positional),
    Some(HardPin::Registration { .. }) => Ok(None),
    Some(HardPin::Match { match_id }) => {
      if !matches.contains_key(&match_id) {
        return Err(dangling(format!("pinned match {match_id}")));
      }
      Ok(Some(Upstream::Match { match_id, placement: seed.source.placement() }))
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::fixtures::*;

  #[test]
  fn test_build_resolves_group_rank_and_match_references() {
    let layout = group_into_final();
    let index = DependencyIndex::build(&layout).unwrap();
    let group = index.group_id(1, "a").unwrap();
    let slot_a = SlotId::new(MatchId(201), Side::A);
    assert_eq!(index.upstream(slot_a), Some(Upstream::Group { group, rank: 1 }));
    assert!(index.dependents(EntityId::Group(group)).contains(&slot_a));
    assert_eq!(index.dependents(EntityId::Group(group)).len(), 2);
    assert_eq!(index.group_of(MatchId(101)), Some(group));
    assert_eq!(index.group(group).unwrap().matches.len(), 6);
  }

  #[test]
  fn test_topological_order_puts_upstream_first() {
    let index = DependencyIndex::build(&four_player_knockout()).unwrap();
    let position = |entity| index.topo_order().iter().position(|e| *e == entity).unwrap();
    assert!(position(EntityId::Match(MatchId(101))) < position(EntityId::Match(MatchId(103))));
    assert!(position(EntityId::Match(MatchId(102))) < position(EntityId::Match(MatchId(104))));
    assert_eq!(index.topo_order().len(), 4);
    assert_eq!(index.match_at(1, 2, 1), Some(MatchId(103)));
    let deps = index.dependents(EntityId::Match(MatchId(101)));
    assert!(deps.contains(&SlotId::new(MatchId(103), Side::A)));
    assert!(deps.contains(&SlotId::new(MatchId(104), Side::A)));
  }

  #[test]
  fn test_dangling_group_code_is_rejected() {
    let mut layout = group_into_final();
    layout.stages[1].matches[0].seed_b = SeedSource::group_rank(1, "Z", 1).into();
    let err = DependencyIndex::build(&layout).unwrap_err();
    assert!(matches!(err, TopologyError::Dangling { .. }));
    assert_eq!(err.slot(), Some(SlotId::new(MatchId(201), Side::B)));
  }

  #[test]
  fn test_pinned_seed_still_needs_a_valid_source() {
    let mut layout = group_into_final();
    layout.stages[1].matches[0].seed_b = Seed::pinned(
      SeedSource::group_rank(1, "Z", 1),
      HardPin::Registration { registration: RegistrationId(4) },
    );
    let err = DependencyIndex::build(&layout).unwrap_err();
    assert!(matches!(err, TopologyError::Dangling { .. }));
    assert_eq!(err.slot(), Some(SlotId::new(MatchId(201), Side::B)));
  }

  #[test]
  fn test_group_reachable_by_position() {
    let mut layout = group_into_final();
    layout.stages[0].groups.push(round_robin("B", 111, &[5, 6]));
    layout.stages[1].matches[0].seed_b = SeedSource::group_rank(1, "G2", 1).into();
    let index = DependencyIndex::build(&layout).unwrap();
    let b = index.group_id(1, "B").unwrap();
    assert_eq!(index.group_id(1, "2"), Some(b));
    assert_eq!(index.group_id(1, "b1"), index.group_id(1, "A"));
    assert_eq!(index.group_id(1, "3"), None);
    assert_eq!(
      index.upstream(SlotId::new(MatchId(201), Side::B)),
      Some(Upstream::Group { group: b, rank: 1 })
    );
  }

  #[test]
  fn test_dangling_match_address_is_rejected() {
    let mut layout = four_player_knockout();
    layout.stages[0].matches[2].seed_b = SeedSource::winner_of(1, 1, 9).into();
    let err = DependencyIndex::build(&layout).unwrap_err();
    assert_eq!(err.slot(), Some(SlotId::new(MatchId(103), Side::B)));
  }

  #[test]
  fn test_match_reference_into_group_stage_is_dangling() {
    let mut layout = group_into_final();
    layout.stages[1].matches[0].seed_a = SeedSource::winner_of(1, 1, 1).into();
    assert!(matches!(
      DependencyIndex::build(&layout),
      Err(TopologyError::Dangling { .. })
    ));
  }

  #[test]
  fn test_rank_zero_is_rejected() {
    let mut layout = group_into_final();
    layout.stages[1].matches[0].seed_a = SeedSource::group_rank(1, "A", 0).into();
    assert!(matches!(
      DependencyIndex::build(&layout),
      Err(TopologyError::InvalidRank { .. })
    ));
  }

  #[test]
  fn test_cycle_is_rejected_and_names_a_slot_on_it() {
    let layout = tournament(vec![knockout_stage(
      1,
      vec![
        knockout_match(1, 1, 1, SeedSource::registration(1), SeedSource::winner_of(1, 1, 2)),
        knockout_match(2, 1, 2, SeedSource::registration(2), SeedSource::loser_of(1, 1, 1)),
        knockout_match(3, 2, 1, SeedSource::winner_of(1, 1, 1), SeedSource::registration(3)),
      ],
    )]);
    let err = DependencyIndex::build(&layout).unwrap_err();
    match err {
      TopologyError::Cycle { slot, .. } => {
        assert!(slot == SlotId::new(MatchId(1), Side::B) || slot == SlotId::new(MatchId(2), Side::B));
      }
      other => panic!("expected cycle, got {other:?}"),
    }
  }

  #[test]
  fn test_self_reference_is_a_cycle() {
    let layout = tournament(vec![knockout_stage(
      1,
      vec![knockout_match(1, 1, 1, SeedSource::registration(1), SeedSource::winner_of(1, 1, 1))],
    )]);
    assert_eq!(
      DependencyIndex::build(&layout).unwrap_err().slot(),
      Some(SlotId::new(MatchId(1), Side::B))
    );
  }

  #[test]
  fn test_group_fed_by_its_own_rank_is_a_cycle() {
    let mut layout = group_into_final();
    layout.stages[0].groups[0].matches[0].seed_b = SeedSource::group_rank(1, "A", 4).into();
    assert!(matches!(
      DependencyIndex::build(&layout),
      Err(TopologyError::Cycle { .. })
    ));
  }

  #[test]
  fn test_duplicate_ids_and_addresses() {
    let layout = tournament(vec![knockout_stage(
      1,
      vec![
        knockout_match(1, 1, 1, SeedSource::registration(1), SeedSource::registration(2)),
        knockout_match(1, 1, 2, SeedSource::registration(3), SeedSource::registration(4)),
      ],
    )]);
    assert_eq!(DependencyIndex::build(&layout).unwrap_err(), TopologyError::DuplicateMatch(MatchId(1)));

    let layout = tournament(vec![knockout_stage(
      1,
      vec![
        knockout_match(1, 1, 1, SeedSource::registration(1), SeedSource::registration(2)),
        knockout_match(2, 1, 1, SeedSource::registration(3), SeedSource::registration(4)),
      ],
    )]);
    assert!(matches!(
      DependencyIndex::build(&layout),
      Err(TopologyError::DuplicateAddress { stage: 1, round: 1, order: 1 })
    ));
  }

  #[test]
  fn test_stage_order_must_increase() {
    let mut layout = group_into_final();
    layout.stages[1].index = 1;
    assert!(matches!(
      DependencyIndex::build(&layout),
      Err(TopologyError::StageOrder { stage: 1, expected: 2 })
    ));
  }

  #[test]
  fn test_registration_pin_drops_the_edge() {
    let index = DependencyIndex::build(&group_into_final()).unwrap();
    let slot = SlotId::new(MatchId(201), Side::B);
    let pinned = index
      .with_pin(slot, Some(HardPin::Registration { registration: RegistrationId(4) }))
      .unwrap();
    assert_eq!(pinned.upstream(slot), None);
    let group = pinned.group_id(1, "A").unwrap();
    assert!(!pinned.dependents(EntityId::Group(group)).contains(&slot));
  }

  #[test]
  fn test_match_pin_creating_a_cycle_is_rejected() {
    let index = DependencyIndex::build(&four_player_knockout()).unwrap();
    let slot = SlotId::new(MatchId(101), Side::A);
    let err = index
      .with_pin(slot, Some(HardPin::Match { match_id: MatchId(103) }))
      .unwrap_err();
    assert!(matches!(err, TopologyError::Cycle { .. }));
  }
}
