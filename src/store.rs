use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::models::{
    GridState, GridStrategy, OcoGroup, OcoState, StrategySnapshot, TwapPlan, TwapState,
};

/// In-memory ledger of every strategy instance and its child orders.
///
/// Owned by the supervisor and passed by reference; there is no global
/// registry. One map per strategy kind, keyed by instance id. The whole
/// store serializes, so a persisted copy preserves every record invariant.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StrategyStore {
    oco_groups: HashMap<Uuid, OcoGroup>,
    twap_plans: HashMap<Uuid, TwapPlan>,
    grid_strategies: HashMap<Uuid, GridStrategy>,
}

impl StrategyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_oco(&mut self, group: OcoGroup) -> Uuid {
        let id = group.id;
        self.oco_groups.insert(id, group);
        id
    }

    pub fn insert_twap(&mut self, plan: TwapPlan) -> Uuid {
        let id = plan.id;
        self.twap_plans.insert(id, plan);
        id
    }

    pub fn insert_grid(&mut self, strategy: GridStrategy) -> Uuid {
        let id = strategy.id;
        self.grid_strategies.insert(id, strategy);
        id
    }

    pub fn oco_mut(&mut self, id: Uuid) -> Option<&mut OcoGroup> {
        self.oco_groups.get_mut(&id)
    }

    pub fn twap_mut(&mut self, id: Uuid) -> Option<&mut TwapPlan> {
        self.twap_plans.get_mut(&id)
    }

    pub fn grid_mut(&mut self, id: Uuid) -> Option<&mut GridStrategy> {
        self.grid_strategies.get_mut(&id)
    }

    /// Snapshot of a single strategy, whatever its kind.
    pub fn snapshot(&self, id: Uuid) -> Option<StrategySnapshot> {
        if let Some(group) = self.oco_groups.get(&id) {
            return Some(StrategySnapshot::Oco(group.clone()));
        }
        if let Some(plan) = self.twap_plans.get(&id) {
            return Some(StrategySnapshot::Twap(plan.clone()));
        }
        self.grid_strategies
            .get(&id)
            .map(|g| StrategySnapshot::Grid(g.clone()))
    }

    /// Ids of all instances that still need ticking.
    pub fn active_ids(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = Vec::new();
        ids.extend(
            self.oco_groups
                .values()
                .filter(|g| g.state == OcoState::Active)
                .map(|g| g.id),
        );
        ids.extend(
            self.twap_plans
                .values()
                .filter(|p| p.state == TwapState::Running)
                .map(|p| p.id),
        );
        ids.extend(
            self.grid_strategies
                .values()
                .filter(|g| g.state == GridState::Active)
                .map(|g| g.id),
        );
        ids
    }

    pub fn active_count(&self) -> usize {
        self.active_ids().len()
    }

    pub fn snapshots(&self) -> Vec<StrategySnapshot> {
        let mut all: Vec<StrategySnapshot> = Vec::new();
        all.extend(self.oco_groups.values().cloned().map(StrategySnapshot::Oco));
        all.extend(self.twap_plans.values().cloned().map(StrategySnapshot::Twap));
        all.extend(
            self.grid_strategies
                .values()
                .cloned()
                .map(StrategySnapshot::Grid),
        );
        all
    }
}
