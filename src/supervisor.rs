use chrono::Utc;
use tokio::time::{interval_at, Duration, Instant};
use uuid::Uuid;

use crate::error::StrategyError;
use crate::exchange::SharedGateway;
use crate::models::StrategySnapshot;
use crate::store::StrategyStore;
use crate::strategy::{
    GridManager, GridParams, OcoManager, OcoParams, TwapManager, TwapParams,
};

/// Drives every active strategy instance from one cooperative loop.
///
/// The supervisor owns the store; all mutation of a strategy record goes
/// through `&mut self` here, so each instance's tick/cancel calls are
/// serialized without any per-record locking. Instance failures are
/// logged against the instance id and never take the loop down.
pub struct Supervisor {
    store: StrategyStore,
    oco: OcoManager,
    twap: TwapManager,
    grid: GridManager,
    tick_interval: Duration,
}

impl Supervisor {
    pub fn new(gateway: SharedGateway, tick_interval_secs: u64) -> Self {
        Self {
            store: StrategyStore::new(),
            oco: OcoManager::new(gateway.clone()),
            twap: TwapManager::new(gateway.clone()),
            grid: GridManager::new(gateway),
            tick_interval: Duration::from_secs(tick_interval_secs),
        }
    }

    pub async fn create_oco(&mut self, params: OcoParams) -> Result<Uuid, StrategyError> {
        let group = self.oco.create(params).await?;
        Ok(self.store.insert_oco(group))
    }

    pub async fn create_twap(&mut self, params: TwapParams) -> Result<Uuid, StrategyError> {
        let plan = self.twap.create(params).await?;
        Ok(self.store.insert_twap(plan))
    }

    pub async fn create_grid(&mut self, params: GridParams) -> Result<Uuid, StrategyError> {
        let strategy = self.grid.create(params).await?;
        Ok(self.store.insert_grid(strategy))
    }

    /// Drive every active instance once, strictly one at a time.
    pub async fn tick_all(&mut self) {
        let now = Utc::now();
        for id in self.store.active_ids() {
            let result = if let Some(group) = self.store.oco_mut(id) {
                self.oco.tick(group).await
            } else if let Some(plan) = self.store.twap_mut(id) {
                self.twap.tick(plan, now).await
            } else if let Some(strategy) = self.store.grid_mut(id) {
                self.grid.tick(strategy).await
            } else {
                continue;
            };

            // One instance's failure never reaches its neighbors: invariant
            // violations already marked the record Failed, transient
            // exchange errors leave it Active for the next round
            if let Err(e) = result {
                tracing::error!("strategy {} tick failed: {}", id, e);
            }
        }
    }

    /// Cancel a single strategy, whatever its kind.
    pub async fn cancel_strategy(&mut self, id: Uuid) -> Result<(), StrategyError> {
        if let Some(group) = self.store.oco_mut(id) {
            return self.oco.cancel(group).await;
        }
        if let Some(plan) = self.store.twap_mut(id) {
            return self.twap.cancel(plan).await;
        }
        if let Some(strategy) = self.store.grid_mut(id) {
            return self.grid.cancel(strategy).await;
        }
        Err(StrategyError::NotFound(id))
    }

    /// Best-effort cancel of everything still active (shutdown path).
    pub async fn cancel_all(&mut self) {
        for id in self.store.active_ids() {
            if let Err(e) = self.cancel_strategy(id).await {
                tracing::warn!("cancel of strategy {} failed: {}", id, e);
            }
        }
    }

    pub fn status(&self, id: Uuid) -> Option<StrategySnapshot> {
        self.store.snapshot(id)
    }

    pub fn snapshots(&self) -> Vec<StrategySnapshot> {
        self.store.snapshots()
    }

    pub fn active_count(&self) -> usize {
        self.store.active_count()
    }

    /// Tick until every instance is terminal (or Ctrl+C, whichever first).
    /// Ctrl+C cancels whatever is still running before returning.
    pub async fn run_until_idle(&mut self) -> crate::Result<()> {
        let mut ticker = interval_at(Instant::now(), self.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::info!(
            "supervisor running: {} active strategies, tick every {:?}",
            self.active_count(),
            self.tick_interval
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick_all().await;
                    if self.active_count() == 0 {
                        tracing::info!("all strategies terminal, supervisor stopping");
                        break;
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("received Ctrl+C, canceling {} active strategies", self.active_count());
                    self.cancel_all().await;
                    break;
                }
            }
        }

        Ok(())
    }
}
