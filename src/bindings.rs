use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::types::{Binding, GroupId, MatchId, SlotId};

/// The single upstream fact a binding was derived from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "id")]
pub enum Cause {
  Seed,
  Pin,
  MatchOutcome(MatchId),
  GroupStanding(GroupId),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingRecord {
  pub binding: Binding,
  pub cause: Option<Cause>,
  pub version: u64,
}

/// Current occupant of every slot. Each slot carries its own version, bumped
/// on every change, so a reader holding an older record can tell it is stale.
#[derive(Clone, Debug, Default)]
pub struct SlotBindingStore {
  records: BTreeMap<SlotId, BindingRecord>,
  caused: BTreeMap<Cause, BTreeSet<SlotId>>,
  generation: u64,
}

impl SlotBindingStore {
  pub fn new() -> Self {
    SlotBindingStore::default()
  }

  pub fn get(&self, slot: SlotId) -> BindingRecord {
    self.records.get(&slot).copied().unwrap_or_default()
  }

  pub fn binding(&self, slot: SlotId) -> Binding {
    self.get(slot).binding
  }

  pub fn version(&self, slot: SlotId) -> u64 {
    self.get(slot).version
  }

  /// Bumped on every mutation of any slot.
  pub fn generation(&self) -> u64 {
    self.generation
  }

  pub fn is_stale(&self, slot: SlotId, seen_version: u64) -> bool {
    self.version(slot) != seen_version
  }

  /// Binds a slot. Rebinding to the same value from the same cause keeps the
  /// current version.
  pub fn set(&mut self, slot: SlotId, binding: Binding, cause: Cause) -> u64 {
    if !binding.is_bound() {
      return self.unbind(slot).unwrap_or_else(|| self.version(slot));
    }
    let current = self.get(slot);
    if current.binding == binding && current.cause == Some(cause) {
      return current.version;
    }
    if let Some(previous) = current.cause {
      self.forget_cause(previous, slot);
    }
    let version = current.version + 1;
    self.records.insert(
      slot,
      BindingRecord {
        binding,
        cause: Some(cause),
        version,
      },
    );
    self.caused.entry(cause).or_default().insert(slot);
    self.generation += 1;
    version
  }

  /// Clears a bound slot, returning its new version. Unbound slots are left
  /// untouched.
  pub fn unbind(&mut self, slot: SlotId) -> Option<u64> {
    let current = self.get(slot);
    if !current.binding.is_bound() {
      return None;
    }
    if let Some(previous) = current.cause {
      self.forget_cause(previous, slot);
    }
    let version = current.version + 1;
    self.records.insert(
      slot,
      BindingRecord {
        binding: Binding::Unresolved,
        cause: None,
        version,
      },
    );
    self.generation += 1;
    Some(version)
  }

  pub fn caused_by(&self, cause: Cause) -> Vec<SlotId> {
    self
      .caused
      .get(&cause)
      .map(|slots| slots.iter().copied().collect())
      .unwrap_or_default()
  }

  fn forget_cause(&mut self, cause: Cause, slot: SlotId) {
    if let Some(slots) = self.caused.get_mut(&cause) {
      slots.remove(&slot);
      if slots.is_empty() {
        self.caused.remove(&cause);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::fixtures::reg;
  use crate::types::Side;

  fn slot(id: u64, side: Side) -> SlotId {
    SlotId::new(MatchId(id), side)
  }

  #[test]
  fn test_unknown_slot_is_unresolved() {
    let store = SlotBindingStore::new();
    let record = store.get(slot(1, Side::A));
    assert_eq!(record.binding, Binding::Unresolved);
    assert_eq!(record.version, 0);
    assert_eq!(record.cause, None);
  }

  #[test]
  fn test_set_bumps_version_and_records_cause() {
    let mut store = SlotBindingStore::new();
    let a = slot(2, Side::A);
    let cause = Cause::MatchOutcome(MatchId(1));
    assert_eq!(store.set(a, Binding::Registration(reg(7)), cause), 1);
    assert_eq!(store.caused_by(cause), vec![a]);
    assert_eq!(store.set(a, Binding::Registration(reg(7)), cause), 1);
    assert_eq!(store.generation(), 1);
    assert_eq!(store.set(a, Binding::Registration(reg(8)), cause), 2);
    assert!(store.is_stale(a, 1));
    assert!(!store.is_stale(a, 2));
  }

  #[test]
  fn test_rebinding_moves_back_reference() {
    let mut store = SlotBindingStore::new();
    let a = slot(2, Side::A);
    store.set(a, Binding::Registration(reg(1)), Cause::MatchOutcome(MatchId(1)));
    store.set(a, Binding::Registration(reg(3)), Cause::Pin);
    assert!(store.caused_by(Cause::MatchOutcome(MatchId(1))).is_empty());
    assert_eq!(store.caused_by(Cause::Pin), vec![a]);
  }

  #[test]
  fn test_unbind() {
    let mut store = SlotBindingStore::new();
    let b = slot(3, Side::B);
    assert_eq!(store.unbind(b), None);
    store.set(b, Binding::Bye, Cause::Seed);
    assert_eq!(store.unbind(b), Some(2));
    assert_eq!(store.binding(b), Binding::Unresolved);
    assert!(store.caused_by(Cause::Seed).is_empty());
    assert_eq!(store.generation(), 2);
  }

  #[test]
  fn test_setting_unresolved_unbinds() {
    let mut store = SlotBindingStore::new();
    let a = slot(4, Side::A);
    store.set(a, Binding::Registration(reg(2)), Cause::Seed);
    assert_eq!(store.set(a, Binding::Unresolved, Cause::Seed), 2);
    assert!(!store.binding(a).is_bound());
  }
}
