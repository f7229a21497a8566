use arc_swap::ArcSwap;
use std::sync::{Arc, Mutex};

use crate::engine::{BracketSnapshot, ChangeSet, ResolutionEngine, ResolutionEvent};
use crate::error::EngineError;
use crate::ranking::RankingEvaluator;
use crate::types::{Binding, MatchId, MatchState, SharedTournament, SlotId, TournamentConfig};

/// One tournament's engine behind a single writer lock. Every committed event
/// republishes a snapshot, so readers never wait on a running cascade.
pub struct TournamentHandle {
    engine: Mutex<ResolutionEngine>,
    published: ArcSwap<BracketSnapshot>,
}

impl TournamentHandle {
    pub fn new(engine: ResolutionEngine) -> Self {
        let published = ArcSwap::from_pointee(engine.snapshot());
        TournamentHandle {
            engine: Mutex::new(engine),
            published,
        }
    }

    pub fn from_layout(
        layout: &TournamentConfig,
        evaluator: RankingEvaluator,
    ) -> Result<SharedTournament, EngineError> {
        let engine = ResolutionEngine::new(layout, evaluator)?;
        Ok(Arc::new(TournamentHandle::new(engine)))
    }

    pub fn resolve(&self, event: ResolutionEvent) -> Result<ChangeSet, EngineError> {
        // A pass commits only at its very end, so a poisoned lock still guards
        // a consistent engine.
        let mut engine = self.engine.lock().unwrap_or_else(|e| e.into_inner());
        let changes = engine.resolve(event)?;
        self.published.store(Arc::new(engine.snapshot()));
        Ok(changes)
    }

    pub fn snapshot(&self) -> Arc<BracketSnapshot> {
        self.published.load_full()
    }

    pub fn current_binding(&self, slot: SlotId) -> Option<Binding> {
        self.published.load().binding(slot)
    }

    pub fn current_state(&self, id: MatchId) -> Option<MatchState> {
        self.published.load().state(id)
    }
}
