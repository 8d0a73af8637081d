use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use uuid::Uuid;

use crate::error::StrategyError;
use crate::exchange::{retry_read, SharedGateway};
use crate::models::{
    OrderRequest, OrderStatus, Side, SliceRecord, SliceStatus, TwapPlan, TwapState,
};
use crate::strategy::cancel_resolved;

#[derive(Debug, Clone)]
pub struct TwapParams {
    pub symbol: String,
    pub side: Side,
    pub total_quantity: f64,
    pub horizon_secs: u64,
    pub slice_count: usize,
    pub limit_mode: bool,
    pub limit_offset: f64,
    pub slippage_tolerance: f64,
    pub jitter: bool,
}

impl TwapParams {
    /// Market-order plan with the default guards.
    pub fn market(symbol: &str, side: Side, total_quantity: f64, horizon_secs: u64, slice_count: usize) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            total_quantity,
            horizon_secs,
            slice_count,
            limit_mode: false,
            limit_offset: 0.001,
            slippage_tolerance: 0.01,
            jitter: false,
        }
    }
}

/// Splits a parent quantity into timed child-order emissions.
///
/// One slice per interval boundary, strictly in index order. A failed
/// slice is recorded and skipped; the plan keeps going. Only an explicit
/// cancel aborts it.
pub struct TwapManager {
    gateway: SharedGateway,
}

impl TwapManager {
    pub fn new(gateway: SharedGateway) -> Self {
        Self { gateway }
    }

    pub async fn create(&self, params: TwapParams) -> Result<TwapPlan, StrategyError> {
        if params.slice_count < 1 {
            return Err(StrategyError::InvalidScheduleGranularity(
                "slice count must be at least 1".to_string(),
            ));
        }
        if params.total_quantity <= 0.0 {
            return Err(StrategyError::InvalidScheduleGranularity(
                "total quantity must be positive".to_string(),
            ));
        }
        if params.horizon_secs < params.slice_count as u64 {
            return Err(StrategyError::InvalidScheduleGranularity(format!(
                "horizon {}s cannot fit {} slices at >=1s spacing",
                params.horizon_secs, params.slice_count
            )));
        }

        let gateway = &self.gateway;
        let reference_price = retry_read(|| gateway.current_price(&params.symbol)).await?;

        let interval = params.horizon_secs as f64 / params.slice_count as f64;
        let slice_quantity = params.total_quantity / params.slice_count as f64;
        let created_at = Utc::now();

        let mut slices = Vec::with_capacity(params.slice_count);
        let mut offset_secs = 0.0;
        for index in 0..params.slice_count {
            // Final slice absorbs the division remainder so the sum is exact
            let quantity = if index + 1 == params.slice_count {
                params.total_quantity - slice_quantity * (params.slice_count as f64 - 1.0)
            } else {
                slice_quantity
            };

            slices.push(SliceRecord {
                index,
                quantity,
                scheduled_at: created_at + Duration::milliseconds((offset_secs * 1000.0) as i64),
                order: None,
                filled_quantity: 0.0,
                fill_price: 0.0,
                status: SliceStatus::Pending,
                failure: None,
            });

            offset_secs += if params.jitter {
                // +/-20% per-interval variation, ordering preserved
                interval * rand::thread_rng().gen_range(0.8..1.2)
            } else {
                interval
            };
        }

        let plan = TwapPlan {
            id: Uuid::new_v4(),
            symbol: params.symbol,
            side: params.side,
            total_quantity: params.total_quantity,
            slice_count: params.slice_count,
            horizon_secs: params.horizon_secs,
            interval_secs: interval,
            limit_mode: params.limit_mode,
            limit_offset: params.limit_offset,
            slippage_tolerance: params.slippage_tolerance,
            reference_price,
            executed_quantity: 0.0,
            total_cost: 0.0,
            slices,
            state: TwapState::Running,
            created_at,
        };

        tracing::info!(
            "TWAP {} created: {} {:?} {} over {}s in {} slices of ~{} (interval {}s)",
            plan.id,
            plan.symbol,
            plan.side,
            plan.total_quantity,
            plan.horizon_secs,
            plan.slice_count,
            slice_quantity,
            interval
        );

        Ok(plan)
    }

    /// One scheduler round: settle the in-flight slice if any, then emit
    /// the next slice when its boundary has passed. No-ops otherwise.
    pub async fn tick(&self, plan: &mut TwapPlan, now: DateTime<Utc>) -> Result<(), StrategyError> {
        if plan.state != TwapState::Running {
            return Ok(());
        }

        self.reconcile_in_flight(plan, now).await?;
        self.emit_due_slice(plan, now).await?;
        self.check_completion(plan);
        Ok(())
    }

    /// Settle the currently Placed slice from authoritative exchange state.
    async fn reconcile_in_flight(
        &self,
        plan: &mut TwapPlan,
        now: DateTime<Utc>,
    ) -> Result<(), StrategyError> {
        let placed = match plan.slices.iter().position(|s| s.status == SliceStatus::Placed) {
            Some(i) => i,
            None => return Ok(()),
        };

        let symbol = plan.symbol.clone();
        let limit_mode = plan.limit_mode;
        let order_id = match &plan.slices[placed].order {
            Some(order_ref) => order_ref.order_id,
            None => return Ok(()),
        };

        let gateway = &self.gateway;
        let mut order = retry_read(|| gateway.order_status(&symbol, order_id)).await?;

        if !order.status.is_terminal() {
            // Unfilled limit slices get one interval of grace, then are
            // pulled rather than left to chase a moved market
            let grace_deadline = plan.slices[placed].scheduled_at
                + Duration::milliseconds((plan.interval_secs * 1000.0) as i64);
            if !(limit_mode && now >= grace_deadline) {
                if let Some(order_ref) = plan.slices[placed].order.as_mut() {
                    order_ref.update_from(&order);
                }
                return Ok(());
            }

            cancel_resolved(self.gateway.cancel_order(&symbol, order_id).await)?;
            // Cancel/fill race: the exchange-reported fill wins
            order = retry_read(|| gateway.order_status(&symbol, order_id)).await?;
        }

        let status = if order.status == OrderStatus::Filled {
            SliceStatus::Filled
        } else {
            // Terminal without a full fill; keep whatever partially filled
            SliceStatus::Canceled
        };

        let slice = &mut plan.slices[placed];
        if let Some(order_ref) = slice.order.as_mut() {
            order_ref.update_from(&order);
        }
        settle_slice(slice, status, order.executed_qty, order.avg_price);

        if order.executed_qty > 0.0 {
            plan.executed_quantity += order.executed_qty;
            plan.total_cost += order.executed_qty * order.avg_price;
        }
        tracing::info!(
            "TWAP {} slice {}/{}: {:?}, filled {} @ {}",
            plan.id,
            placed + 1,
            plan.slice_count,
            status,
            order.executed_qty,
            order.avg_price
        );

        Ok(())
    }

    async fn emit_due_slice(
        &self,
        plan: &mut TwapPlan,
        now: DateTime<Utc>,
    ) -> Result<(), StrategyError> {
        // Strictly one in-flight slice at a time, consumed in index order
        if plan.slices.iter().any(|s| s.status == SliceStatus::Placed) {
            return Ok(());
        }

        let next = match plan
            .slices
            .iter()
            .position(|s| s.status == SliceStatus::Pending)
        {
            Some(i) => i,
            None => return Ok(()),
        };

        if plan.slices[next].scheduled_at > now {
            return Ok(());
        }

        let gateway = &self.gateway;
        let symbol = plan.symbol.clone();
        let price = retry_read(|| gateway.current_price(&symbol)).await?;

        // Slippage guard: skip the slice instead of chasing a moved market
        let drift = (price - plan.reference_price).abs() / plan.reference_price;
        if plan.limit_mode && drift > plan.slippage_tolerance {
            let reason = format!(
                "price {} drifted {:.2}% from reference {} (tolerance {:.2}%)",
                price,
                drift * 100.0,
                plan.reference_price,
                plan.slippage_tolerance * 100.0
            );
            tracing::warn!("TWAP {} slice {} skipped: {}", plan.id, next + 1, reason);
            let slice = &mut plan.slices[next];
            slice.status = SliceStatus::Failed;
            slice.failure = Some(reason);
            return Ok(());
        }

        let quantity = plan.slices[next].quantity;
        let request = if plan.limit_mode {
            // Passive peg: rest just inside the spread and wait for a fill
            let limit_price = match plan.side {
                Side::Buy => price * (1.0 - plan.limit_offset),
                Side::Sell => price * (1.0 + plan.limit_offset),
            };
            OrderRequest::limit(&symbol, plan.side, quantity, limit_price)
        } else {
            OrderRequest::market(&symbol, plan.side, quantity)
        };

        match self.gateway.place_order(&request).await {
            Ok(order_ref) => {
                let slice = &mut plan.slices[next];
                slice.order = Some(order_ref);
                slice.status = SliceStatus::Placed;
                // Market emissions fill immediately; settle them within
                // their own tick. Limit slices get their grace window first.
                if !plan.limit_mode {
                    self.reconcile_in_flight(plan, now).await?;
                }
            }
            Err(e) => {
                // One bad slice never aborts the plan
                let slice = &mut plan.slices[next];
                slice.status = SliceStatus::Failed;
                slice.failure = Some(e.to_string());
                tracing::warn!(
                    "TWAP {} slice {}/{} placement failed: {}",
                    plan.id,
                    next + 1,
                    plan.slice_count,
                    e
                );
            }
        }

        Ok(())
    }

    fn check_completion(&self, plan: &mut TwapPlan) {
        if plan.slices.iter().all(|s| s.status.is_terminal()) {
            plan.state = TwapState::Completed;
            let failed = plan
                .slices
                .iter()
                .filter(|s| s.status == SliceStatus::Failed)
                .count();
            tracing::info!(
                "TWAP {} completed: executed {}/{} at avg price {} ({} slices failed)",
                plan.id,
                plan.executed_quantity,
                plan.total_quantity,
                plan.average_price(),
                failed
            );
        }
    }

    /// Explicit abort: pull any open child order, retire pending slices.
    pub async fn cancel(&self, plan: &mut TwapPlan) -> Result<(), StrategyError> {
        if plan.state != TwapState::Running {
            return Ok(());
        }

        let symbol = plan.symbol.clone();
        let gateway = &self.gateway;

        for i in 0..plan.slices.len() {
            match plan.slices[i].status {
                SliceStatus::Pending => {
                    plan.slices[i].status = SliceStatus::Canceled;
                }
                SliceStatus::Placed => {
                    let order_id = match &plan.slices[i].order {
                        Some(order_ref) => order_ref.order_id,
                        None => continue,
                    };
                    cancel_resolved(self.gateway.cancel_order(&symbol, order_id).await)?;

                    let order = retry_read(|| gateway.order_status(&symbol, order_id)).await?;
                    let status = if order.status == OrderStatus::Filled {
                        SliceStatus::Filled
                    } else {
                        SliceStatus::Canceled
                    };
                    let slice = &mut plan.slices[i];
                    if let Some(order_ref) = slice.order.as_mut() {
                        order_ref.update_from(&order);
                    }
                    settle_slice(slice, status, order.executed_qty, order.avg_price);
                    if order.executed_qty > 0.0 {
                        plan.executed_quantity += order.executed_qty;
                        plan.total_cost += order.executed_qty * order.avg_price;
                    }
                }
                _ => {}
            }
        }

        plan.state = TwapState::Aborted;
        tracing::info!(
            "TWAP {} aborted: executed {}/{}",
            plan.id,
            plan.executed_quantity,
            plan.total_quantity
        );
        Ok(())
    }
}

fn settle_slice(slice: &mut SliceRecord, status: SliceStatus, filled: f64, price: f64) {
    slice.status = status;
    slice.filled_quantity = filled;
    if filled > 0.0 {
        slice.fill_price = price;
    }
}
