use uuid::Uuid;

use crate::error::StrategyError;
use crate::exchange::{retry_read, SharedGateway};
use crate::models::{
    GridLevel, GridSpacing, GridState, GridStrategy, LevelStatus, OrderRequest, OrderStatus, Side,
};
use crate::strategy::cancel_resolved;

#[derive(Debug, Clone)]
pub struct GridParams {
    pub symbol: String,
    pub upper_bound: f64,
    pub lower_bound: f64,
    pub level_count: usize,
    pub investment: f64,
    pub spacing: GridSpacing,
}

/// Maintains a ladder of resting limit orders between two price bounds.
///
/// Buys rest below the mark, sells above. A fill re-arms the adjacent
/// level with the opposite side; the spread between the two is the
/// strategy's profit per round trip.
pub struct GridManager {
    gateway: SharedGateway,
}

impl GridManager {
    pub fn new(gateway: SharedGateway) -> Self {
        Self { gateway }
    }

    pub async fn create(&self, params: GridParams) -> Result<GridStrategy, StrategyError> {
        if params.lower_bound <= 0.0 || params.upper_bound <= params.lower_bound {
            return Err(StrategyError::InvalidGridBounds(format!(
                "bounds must satisfy upper > lower > 0, got [{}, {}]",
                params.lower_bound, params.upper_bound
            )));
        }
        if params.level_count < 2 {
            return Err(StrategyError::InvalidGridBounds(format!(
                "need at least 2 levels, got {}",
                params.level_count
            )));
        }
        if params.investment <= 0.0 {
            return Err(StrategyError::InvalidGridBounds(
                "investment must be positive".to_string(),
            ));
        }

        let gateway = &self.gateway;
        let mark = retry_read(|| gateway.current_price(&params.symbol)).await?;

        let prices = level_prices(&params);
        let mut levels: Vec<GridLevel> = prices
            .iter()
            .map(|&price| {
                let quantity = params.investment / params.level_count as f64 / price;
                let side = if price < mark { Side::Buy } else { Side::Sell };
                GridLevel {
                    price,
                    side,
                    quantity,
                    order: None,
                    status: LevelStatus::Pending,
                }
            })
            .collect();

        // Place the initial ladder; roll the whole thing back on any failure.
        // A level closer to the mark than to its nearest neighbor starts
        // empty, so no order ever rests at the touch.
        for i in 0..levels.len() {
            let level = &levels[i];
            let half_gap = nearest_gap(&prices, i) / 2.0;
            if (level.price - mark).abs() < half_gap {
                continue;
            }

            let request =
                OrderRequest::limit(&params.symbol, level.side, level.quantity, level.price);
            match self.gateway.place_order(&request).await {
                Ok(order_ref) => {
                    let level = &mut levels[i];
                    level.order = Some(order_ref);
                    level.status = LevelStatus::Resting;
                }
                Err(e) => {
                    tracing::error!(
                        "grid setup failed placing level {} @ {}: {}; rolling back",
                        i,
                        level.price,
                        e
                    );
                    self.rollback(&params.symbol, &levels).await;
                    return Err(StrategyError::Exchange(e));
                }
            }
        }

        let strategy = GridStrategy {
            id: Uuid::new_v4(),
            symbol: params.symbol,
            upper_bound: params.upper_bound,
            lower_bound: params.lower_bound,
            level_count: params.level_count,
            investment: params.investment,
            spacing: params.spacing,
            levels,
            state: GridState::Active,
            fill_events: 0,
            realized_pnl: 0.0,
            created_at: chrono::Utc::now(),
        };

        tracing::info!(
            "grid {} created: {} levels on {} over [{}, {}] ({:?}), mark {}",
            strategy.id,
            strategy.level_count,
            strategy.symbol,
            strategy.lower_bound,
            strategy.upper_bound,
            strategy.spacing,
            mark
        );

        Ok(strategy)
    }

    async fn rollback(&self, symbol: &str, levels: &[GridLevel]) {
        for level in levels {
            if level.status != LevelStatus::Resting {
                continue;
            }
            if let Some(order_ref) = &level.order {
                if let Err(e) =
                    cancel_resolved(self.gateway.cancel_order(symbol, order_ref.order_id).await)
                {
                    tracing::warn!(
                        "grid rollback: cancel of order {} failed: {}",
                        order_ref.order_id,
                        e
                    );
                }
            }
        }
    }

    /// One reconciliation round: refresh resting levels, then re-arm the
    /// ladder around any fills.
    pub async fn tick(&self, strategy: &mut GridStrategy) -> Result<(), StrategyError> {
        if strategy.state != GridState::Active {
            return Ok(());
        }

        self.refresh_resting(strategy).await?;
        self.rearm_filled(strategy).await?;
        Ok(())
    }

    async fn refresh_resting(&self, strategy: &mut GridStrategy) -> Result<(), StrategyError> {
        let symbol = strategy.symbol.clone();
        let gateway = &self.gateway;

        for i in 0..strategy.levels.len() {
            if strategy.levels[i].status != LevelStatus::Resting {
                continue;
            }
            let order_id = match &strategy.levels[i].order {
                Some(order_ref) => order_ref.order_id,
                None => continue,
            };

            let order = retry_read(|| gateway.order_status(&symbol, order_id)).await?;
            if let Some(order_ref) = strategy.levels[i].order.as_mut() {
                order_ref.update_from(&order);
            }

            match order.status {
                OrderStatus::Filled => {
                    let side = strategy.levels[i].side;
                    strategy.levels[i].status = LevelStatus::Filled;
                    strategy.fill_events += 1;

                    // A sell completes a buy-low/sell-high round trip; book
                    // the spread to the level below as realized profit
                    if side == Side::Sell && i > 0 {
                        let spread = strategy.levels[i].price - strategy.levels[i - 1].price;
                        strategy.realized_pnl += spread * order.executed_qty;
                    }

                    tracing::info!(
                        "grid {}: level {} ({:?} @ {}) filled, qty {}",
                        strategy.id,
                        i,
                        side,
                        strategy.levels[i].price,
                        order.executed_qty
                    );
                }
                OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired => {
                    // Order died without us asking; put the level back
                    tracing::warn!(
                        "grid {}: level {} order {} went {:?} externally, re-placing",
                        strategy.id,
                        i,
                        order_id,
                        order.status
                    );
                    self.place_level(&symbol, &mut strategy.levels[i]).await;
                }
                OrderStatus::New | OrderStatus::PartiallyFilled => {}
            }
        }

        Ok(())
    }

    /// Re-arm the level adjacent to each fill with the opposite side.
    /// A filled level stays Filled until its re-arm lands, so a placement
    /// failure is naturally retried next tick.
    async fn rearm_filled(&self, strategy: &mut GridStrategy) -> Result<(), StrategyError> {
        let symbol = strategy.symbol.clone();
        let count = strategy.levels.len();

        for i in 0..count {
            if strategy.levels[i].status != LevelStatus::Filled {
                continue;
            }

            let filled_side = strategy.levels[i].side;
            let filled_qty = strategy.levels[i]
                .order
                .as_ref()
                .map(|r| r.last_filled_qty)
                .unwrap_or(strategy.levels[i].quantity);

            let target = match filled_side {
                Side::Buy => i + 1,
                Side::Sell => i.wrapping_sub(1),
            };
            if target >= count {
                // Boundary level with no neighbor on the re-arm side
                strategy.levels[i].status = LevelStatus::Pending;
                strategy.levels[i].order = None;
                continue;
            }
            if matches!(
                strategy.levels[target].status,
                LevelStatus::Resting | LevelStatus::Filled
            ) {
                // Target holds a resting order, or its own fill that has
                // not re-armed yet; the source stays Filled and retries
                // once the target vacates
                continue;
            }

            let counter_side = filled_side.opposite();
            let price = strategy.levels[target].price;
            let request = OrderRequest::limit(&symbol, counter_side, filled_qty, price);
            match self.gateway.place_order(&request).await {
                Ok(order_ref) => {
                    let target_level = &mut strategy.levels[target];
                    target_level.side = counter_side;
                    target_level.quantity = filled_qty;
                    target_level.order = Some(order_ref);
                    target_level.status = LevelStatus::Resting;

                    let source = &mut strategy.levels[i];
                    source.status = LevelStatus::Pending;
                    source.order = None;

                    tracing::info!(
                        "grid {}: re-armed level {} as {:?} @ {} (qty {})",
                        strategy.id,
                        target,
                        counter_side,
                        price,
                        filled_qty
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        "grid {}: re-arm of level {} failed: {}; will retry",
                        strategy.id,
                        target,
                        e
                    );
                }
            }
        }

        Ok(())
    }

    /// Replace a level whose order died without a fill. On failure the
    /// level keeps its dead order ref, so the next refresh retries.
    async fn place_level(&self, symbol: &str, level: &mut GridLevel) {
        let request = OrderRequest::limit(symbol, level.side, level.quantity, level.price);
        match self.gateway.place_order(&request).await {
            Ok(order_ref) => {
                level.order = Some(order_ref);
                level.status = LevelStatus::Resting;
            }
            Err(e) => {
                tracing::warn!("re-place of level @ {} failed: {}; will retry", level.price, e);
            }
        }
    }

    /// Pull every resting order and retire the ladder.
    pub async fn cancel(&self, strategy: &mut GridStrategy) -> Result<(), StrategyError> {
        if strategy.state != GridState::Active {
            return Ok(());
        }

        let symbol = strategy.symbol.clone();
        let gateway = &self.gateway;

        for i in 0..strategy.levels.len() {
            if strategy.levels[i].status != LevelStatus::Resting {
                if strategy.levels[i].status == LevelStatus::Pending {
                    strategy.levels[i].status = LevelStatus::Canceled;
                }
                continue;
            }
            let order_id = match &strategy.levels[i].order {
                Some(order_ref) => order_ref.order_id,
                None => continue,
            };

            cancel_resolved(self.gateway.cancel_order(&symbol, order_id).await)?;

            // Fill may have beaten the cancel; count it but do not re-arm
            let order = retry_read(|| gateway.order_status(&symbol, order_id)).await?;
            if let Some(order_ref) = strategy.levels[i].order.as_mut() {
                order_ref.update_from(&order);
            }
            if order.status == OrderStatus::Filled {
                strategy.levels[i].status = LevelStatus::Filled;
                strategy.fill_events += 1;
            } else {
                strategy.levels[i].status = LevelStatus::Canceled;
            }
        }

        strategy.state = GridState::Canceled;
        tracing::info!(
            "grid {} canceled after {} fills, realized pnl {}",
            strategy.id,
            strategy.fill_events,
            strategy.realized_pnl
        );
        Ok(())
    }
}

fn level_prices(params: &GridParams) -> Vec<f64> {
    let n = params.level_count;
    match params.spacing {
        GridSpacing::Arithmetic => {
            let step = (params.upper_bound - params.lower_bound) / (n as f64 - 1.0);
            (0..n).map(|i| params.lower_bound + step * i as f64).collect()
        }
        GridSpacing::Geometric => {
            let ratio = (params.upper_bound / params.lower_bound).powf(1.0 / (n as f64 - 1.0));
            (0..n)
                .map(|i| params.lower_bound * ratio.powi(i as i32))
                .collect()
        }
    }
}

/// Distance to the closest neighboring level (handles uneven geometric gaps).
fn nearest_gap(prices: &[f64], i: usize) -> f64 {
    let below = if i > 0 {
        prices[i] - prices[i - 1]
    } else {
        f64::MAX
    };
    let above = if i + 1 < prices.len() {
        prices[i + 1] - prices[i]
    } else {
        f64::MAX
    };
    below.min(above)
}
