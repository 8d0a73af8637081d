use chrono::Utc;
use uuid::Uuid;

use crate::error::StrategyError;
use crate::exchange::{retry_read, SharedGateway};
use crate::models::{OcoGroup, OcoLeg, OcoState, OrderRef, OrderRequest, OrderStatus, Side};
use crate::strategy::cancel_resolved;

// Stop-limit execution price sits just past the trigger so the stop
// still fills after gapping through it
const STOP_LIMIT_OFFSET: f64 = 0.01;

#[derive(Debug, Clone)]
pub struct OcoParams {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub take_profit_price: f64,
    pub stop_loss_price: f64,
}

/// Links a take-profit limit order and a stop-loss stop-limit order:
/// whichever fills first causes the other to be canceled.
pub struct OcoManager {
    gateway: SharedGateway,
}

impl OcoManager {
    pub fn new(gateway: SharedGateway) -> Self {
        Self { gateway }
    }

    /// Place both legs. If the second leg fails, the first is rolled back
    /// and the group comes back `Failed`, never one live leg with no
    /// cancellation attempted.
    pub async fn create(&self, params: OcoParams) -> Result<OcoGroup, StrategyError> {
        let gateway = &self.gateway;
        let mark = retry_read(|| gateway.current_price(&params.symbol)).await?;

        self.check_price_relationship(&params, mark)?;

        let take_profit_req = OrderRequest::limit(
            &params.symbol,
            params.side,
            params.quantity,
            params.take_profit_price,
        );

        let stop_limit_price = match params.side {
            Side::Sell => params.stop_loss_price * (1.0 - STOP_LIMIT_OFFSET),
            Side::Buy => params.stop_loss_price * (1.0 + STOP_LIMIT_OFFSET),
        };
        let stop_loss_req = OrderRequest::stop_limit(
            &params.symbol,
            params.side,
            params.quantity,
            stop_limit_price,
            params.stop_loss_price,
        );

        let take_profit = self.gateway.place_order(&take_profit_req).await?;

        let stop_loss = match self.gateway.place_order(&stop_loss_req).await {
            Ok(order_ref) => order_ref,
            Err(e) => {
                // Rollback the leg that did go through
                tracing::warn!(
                    "stop-loss leg failed for {} ({}), rolling back take-profit order {}",
                    params.symbol,
                    e,
                    take_profit.order_id
                );
                cancel_resolved(
                    self.gateway
                        .cancel_order(&params.symbol, take_profit.order_id)
                        .await,
                )?;

                return Ok(OcoGroup {
                    id: Uuid::new_v4(),
                    symbol: params.symbol,
                    side: params.side,
                    quantity: params.quantity,
                    take_profit_price: params.take_profit_price,
                    stop_loss_price: params.stop_loss_price,
                    take_profit: rolled_back(take_profit),
                    stop_loss: OrderRef::unplaced(&stop_loss_req.symbol),
                    state: OcoState::Failed,
                    filled_leg: None,
                    created_at: Utc::now(),
                    failure: Some(format!("stop-loss placement failed: {}", e)),
                });
            }
        };

        let group = OcoGroup {
            id: Uuid::new_v4(),
            symbol: params.symbol,
            side: params.side,
            quantity: params.quantity,
            take_profit_price: params.take_profit_price,
            stop_loss_price: params.stop_loss_price,
            take_profit,
            stop_loss,
            state: OcoState::Active,
            filled_leg: None,
            created_at: Utc::now(),
            failure: None,
        };

        tracing::info!(
            "OCO {} created on {}: TP {} @ {}, SL {} @ {}",
            group.id,
            group.symbol,
            group.take_profit.order_id,
            group.take_profit_price,
            group.stop_loss.order_id,
            group.stop_loss_price
        );

        Ok(group)
    }

    /// Exit prices must straddle the mark consistent with the exit side:
    /// a SELL exit takes profit above the market and stops out below it,
    /// a BUY exit the inverse.
    fn check_price_relationship(&self, params: &OcoParams, mark: f64) -> Result<(), StrategyError> {
        let valid = match params.side {
            Side::Sell => params.take_profit_price > mark && params.stop_loss_price < mark,
            Side::Buy => params.take_profit_price < mark && params.stop_loss_price > mark,
        };

        if valid {
            Ok(())
        } else {
            Err(StrategyError::InvalidPriceRelationship(format!(
                "{:?} exit on {} needs TP/SL straddling mark {}: got TP {} / SL {}",
                params.side, params.symbol, mark, params.take_profit_price, params.stop_loss_price
            )))
        }
    }

    /// One monitoring round: refresh both legs, cancel the loser once a
    /// leg fills, resolve once both are terminal.
    pub async fn tick(&self, group: &mut OcoGroup) -> Result<(), StrategyError> {
        if group.state != OcoState::Active {
            return Ok(());
        }

        let symbol = group.symbol.clone();
        self.refresh_leg(&symbol, &mut group.take_profit).await?;
        self.refresh_leg(&symbol, &mut group.stop_loss).await?;

        let tp_filled = group.take_profit.last_status == OrderStatus::Filled;
        let sl_filled = group.stop_loss.last_status == OrderStatus::Filled;

        if tp_filled && sl_filled {
            return self.fail_both_legs_filled(group);
        }

        if tp_filled {
            self.resolve_winner(group, OcoLeg::TakeProfit).await?;
        } else if sl_filled {
            self.resolve_winner(group, OcoLeg::StopLoss).await?;
        } else {
            self.reconcile_drift(group).await?;
        }

        Ok(())
    }

    /// Cancel the sibling of the filled leg and resolve the group.
    /// A cancel rejected because the sibling is already terminal counts
    /// as success; a sibling that turns out to have filled anyway means
    /// the exchange-reported fill wins and the group is invariant-broken.
    async fn resolve_winner(
        &self,
        group: &mut OcoGroup,
        winner: OcoLeg,
    ) -> Result<(), StrategyError> {
        let loser_id = match winner {
            OcoLeg::TakeProfit => group.stop_loss.order_id,
            OcoLeg::StopLoss => group.take_profit.order_id,
        };

        cancel_resolved(self.gateway.cancel_order(&group.symbol, loser_id).await)?;

        // Fill-vs-cancel race: the fill is authoritative
        let symbol = group.symbol.clone();
        let loser = match winner {
            OcoLeg::TakeProfit => &mut group.stop_loss,
            OcoLeg::StopLoss => &mut group.take_profit,
        };
        self.refresh_leg(&symbol, loser).await?;

        if loser.last_status == OrderStatus::Filled {
            return self.fail_both_legs_filled(group);
        }

        group.filled_leg = Some(winner);
        group.state = OcoState::Resolved;
        tracing::info!("OCO {} resolved: {:?} leg filled", group.id, winner);
        Ok(())
    }

    fn fail_both_legs_filled(&self, group: &mut OcoGroup) -> Result<(), StrategyError> {
        group.state = OcoState::Failed;
        group.failure = Some("both legs reported FILLED".to_string());
        Err(StrategyError::InvariantViolation(format!(
            "OCO {}: both legs filled (TP order {}, SL order {})",
            group.id, group.take_profit.order_id, group.stop_loss.order_id
        )))
    }

    /// Exchange-side drift: a leg went terminal without filling (expired,
    /// canceled out-of-band, rejected). Never leave the sibling live.
    async fn reconcile_drift(&self, group: &mut OcoGroup) -> Result<(), StrategyError> {
        let tp_dead = group.take_profit.is_terminal();
        let sl_dead = group.stop_loss.is_terminal();

        if !tp_dead && !sl_dead {
            return Ok(());
        }

        let live_id = if tp_dead {
            group.stop_loss.order_id
        } else {
            group.take_profit.order_id
        };

        if !(tp_dead && sl_dead) {
            tracing::warn!(
                "OCO {}: leg went terminal without fill, canceling sibling {}",
                group.id,
                live_id
            );
            cancel_resolved(self.gateway.cancel_order(&group.symbol, live_id).await)?;
        }

        group.state = OcoState::Failed;
        group.failure = Some("leg terminated on exchange without fill".to_string());
        Ok(())
    }

    /// Explicit user cancellation: best-effort cancel of both legs.
    /// If a fill sneaks in ahead of the cancel, the fill wins.
    pub async fn cancel(&self, group: &mut OcoGroup) -> Result<(), StrategyError> {
        if group.state != OcoState::Active {
            return Ok(());
        }

        cancel_resolved(
            self.gateway
                .cancel_order(&group.symbol, group.take_profit.order_id)
                .await,
        )?;
        cancel_resolved(
            self.gateway
                .cancel_order(&group.symbol, group.stop_loss.order_id)
                .await,
        )?;

        let symbol = group.symbol.clone();
        self.refresh_leg(&symbol, &mut group.take_profit).await?;
        self.refresh_leg(&symbol, &mut group.stop_loss).await?;

        let tp_filled = group.take_profit.last_status == OrderStatus::Filled;
        let sl_filled = group.stop_loss.last_status == OrderStatus::Filled;

        match (tp_filled, sl_filled) {
            (true, true) => self.fail_both_legs_filled(group),
            (true, false) | (false, true) => {
                group.filled_leg = Some(if tp_filled {
                    OcoLeg::TakeProfit
                } else {
                    OcoLeg::StopLoss
                });
                group.state = OcoState::Resolved;
                tracing::info!("OCO {}: fill beat the cancel, resolving", group.id);
                Ok(())
            }
            (false, false) => {
                group.state = OcoState::Failed;
                group.failure = Some("canceled by user".to_string());
                tracing::info!("OCO {} canceled", group.id);
                Ok(())
            }
        }
    }

    async fn refresh_leg(&self, symbol: &str, leg: &mut OrderRef) -> Result<(), StrategyError> {
        if !leg.is_placed() {
            return Ok(());
        }
        let gateway = &self.gateway;
        let order_id = leg.order_id;
        let order = retry_read(|| gateway.order_status(symbol, order_id)).await?;
        leg.update_from(&order);
        Ok(())
    }
}

fn rolled_back(mut leg: OrderRef) -> OrderRef {
    leg.last_status = OrderStatus::Canceled;
    leg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExchangeError;
    use crate::exchange::{ExchangeGateway, PaperExchange};
    use std::sync::Arc;

    fn sell_exit_params() -> OcoParams {
        OcoParams {
            symbol: "BTCUSDT".to_string(),
            side: Side::Sell,
            quantity: 0.01,
            take_profit_price: 55000.0,
            stop_loss_price: 45000.0,
        }
    }

    fn setup() -> (Arc<PaperExchange>, OcoManager) {
        let exchange = Arc::new(PaperExchange::new());
        exchange.set_price("BTCUSDT", 50000.0);
        let manager = OcoManager::new(exchange.clone());
        (exchange, manager)
    }

    #[tokio::test]
    async fn test_create_places_both_legs() {
        let (exchange, manager) = setup();

        let group = manager.create(sell_exit_params()).await.unwrap();

        assert_eq!(group.state, OcoState::Active);
        assert_eq!(exchange.open_order_count("BTCUSDT"), 2);
    }

    #[tokio::test]
    async fn test_inverted_prices_rejected() {
        let (exchange, manager) = setup();

        // SELL exit with TP below market and SL above: inverted
        let result = manager
            .create(OcoParams {
                take_profit_price: 45000.0,
                stop_loss_price: 56000.0,
                ..sell_exit_params()
            })
            .await;

        assert!(matches!(
            result,
            Err(StrategyError::InvalidPriceRelationship(_))
        ));
        // Nothing was placed
        assert_eq!(exchange.open_order_count("BTCUSDT"), 0);
    }

    #[tokio::test]
    async fn test_take_profit_fill_cancels_stop_loss() {
        let (exchange, manager) = setup();
        let mut group = manager.create(sell_exit_params()).await.unwrap();

        // Price rallies through the take-profit
        exchange.set_price("BTCUSDT", 55500.0);
        manager.tick(&mut group).await.unwrap();

        assert_eq!(group.state, OcoState::Resolved);
        assert_eq!(group.filled_leg, Some(OcoLeg::TakeProfit));
        assert_eq!(
            exchange.order(group.stop_loss.order_id).unwrap().status,
            OrderStatus::Canceled
        );
        assert_eq!(exchange.open_order_count("BTCUSDT"), 0);
    }

    #[tokio::test]
    async fn test_stop_loss_fill_cancels_take_profit() {
        let (exchange, manager) = setup();
        let mut group = manager.create(sell_exit_params()).await.unwrap();

        // Price drops through the stop
        exchange.set_price("BTCUSDT", 44500.0);
        manager.tick(&mut group).await.unwrap();

        assert_eq!(group.state, OcoState::Resolved);
        assert_eq!(group.filled_leg, Some(OcoLeg::StopLoss));
        assert_eq!(
            exchange.order(group.take_profit.order_id).unwrap().status,
            OrderStatus::Canceled
        );
    }

    #[tokio::test]
    async fn test_resolved_group_has_one_fill_one_cancel() {
        let (exchange, manager) = setup();
        let mut group = manager.create(sell_exit_params()).await.unwrap();

        exchange.set_price("BTCUSDT", 55500.0);
        manager.tick(&mut group).await.unwrap();

        let tp = exchange.order(group.take_profit.order_id).unwrap();
        let sl = exchange.order(group.stop_loss.order_id).unwrap();
        let statuses = [tp.status, sl.status];
        assert!(statuses.contains(&OrderStatus::Filled));
        assert!(statuses.contains(&OrderStatus::Canceled));
    }

    #[tokio::test]
    async fn test_second_leg_failure_rolls_back_first() {
        let (exchange, manager) = setup();
        exchange.pass_next_place();
        exchange.fail_next_place(ExchangeError::InsufficientMargin);

        let group = manager.create(sell_exit_params()).await.unwrap();

        assert_eq!(group.state, OcoState::Failed);
        assert!(group.failure.as_deref().unwrap().contains("stop-loss"));
        // The stop leg never reached the exchange
        assert!(!group.stop_loss.is_placed());
        assert_eq!(group.stop_loss.last_status, OrderStatus::Rejected);
        // Rolled-back take-profit leg is canceled, nothing left live
        assert_eq!(exchange.open_order_count("BTCUSDT"), 0);
        assert_eq!(
            exchange.order(group.take_profit.order_id).unwrap().status,
            OrderStatus::Canceled
        );
    }

    #[tokio::test]
    async fn test_first_leg_failure_places_nothing() {
        let (exchange, manager) = setup();
        exchange.fail_next_place(ExchangeError::Rejected("bad qty".to_string()));

        let result = manager.create(sell_exit_params()).await;

        assert!(matches!(result, Err(StrategyError::Exchange(_))));
        assert_eq!(exchange.open_order_count("BTCUSDT"), 0);
    }

    #[tokio::test]
    async fn test_rollback_tolerates_already_canceled_leg() {
        let (exchange, manager) = setup();
        let mut group = manager.create(sell_exit_params()).await.unwrap();

        // Take-profit leg canceled out-of-band; the group cancel must
        // still succeed even though that cancel now reports terminal
        exchange
            .cancel_order("BTCUSDT", group.take_profit.order_id)
            .await
            .unwrap();

        manager.cancel(&mut group).await.unwrap();
        assert_eq!(group.state, OcoState::Failed);
        assert_eq!(exchange.open_order_count("BTCUSDT"), 0);
    }

    #[tokio::test]
    async fn test_user_cancel_with_no_fills() {
        let (exchange, manager) = setup();
        let mut group = manager.create(sell_exit_params()).await.unwrap();

        manager.cancel(&mut group).await.unwrap();

        assert_eq!(group.state, OcoState::Failed);
        assert_eq!(group.filled_leg, None);
        assert_eq!(exchange.open_order_count("BTCUSDT"), 0);
    }

    #[tokio::test]
    async fn test_drift_leg_canceled_externally() {
        let (exchange, manager) = setup();
        let mut group = manager.create(sell_exit_params()).await.unwrap();

        // Stop leg vanishes on the exchange side without a fill
        exchange
            .cancel_order("BTCUSDT", group.stop_loss.order_id)
            .await
            .unwrap();

        manager.tick(&mut group).await.unwrap();

        // The manager never leaves one live leg behind
        assert_eq!(group.state, OcoState::Failed);
        assert_eq!(exchange.open_order_count("BTCUSDT"), 0);
    }

    #[tokio::test]
    async fn test_tick_is_noop_when_terminal() {
        let (exchange, manager) = setup();
        let mut group = manager.create(sell_exit_params()).await.unwrap();

        exchange.set_price("BTCUSDT", 55500.0);
        manager.tick(&mut group).await.unwrap();
        assert_eq!(group.state, OcoState::Resolved);

        // Further ticks leave the resolved group untouched
        manager.tick(&mut group).await.unwrap();
        assert_eq!(group.state, OcoState::Resolved);
        assert_eq!(group.filled_leg, Some(OcoLeg::TakeProfit));
    }
}
