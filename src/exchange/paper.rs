use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::error::ExchangeError;
use crate::exchange::ExchangeGateway;
use crate::models::{Order, OrderRef, OrderRequest, OrderStatus, OrderType, Side};

/// Simulated in-memory exchange.
///
/// Market orders fill immediately at the mark price. Limit orders rest
/// until the mark crosses their price (or a test fills them explicitly).
/// Stop-limit orders trigger and fill once the mark crosses the stop.
/// Deterministic by construction, so strategy tests never need a network.
pub struct PaperExchange {
    inner: Mutex<Inner>,
}

struct Inner {
    prices: HashMap<String, f64>,
    orders: HashMap<u64, Order>,
    next_id: u64,
    // Scripted outcomes consumed by upcoming place_order calls;
    // None lets the call through, Some fails it
    place_failures: VecDeque<Option<ExchangeError>>,
}

impl PaperExchange {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                prices: HashMap::new(),
                orders: HashMap::new(),
                next_id: 1,
                place_failures: VecDeque::new(),
            }),
        }
    }

    /// Set the mark price and fill any resting orders it crosses.
    pub fn set_price(&self, symbol: &str, price: f64) {
        let mut inner = self.inner.lock().unwrap();
        inner.prices.insert(symbol.to_string(), price);

        let crossed: Vec<u64> = inner
            .orders
            .values()
            .filter(|o| o.symbol == symbol && !o.status.is_terminal() && Self::is_crossed(o, price))
            .map(|o| o.order_id)
            .collect();

        for order_id in crossed {
            Inner::fill(&mut inner, order_id, None);
        }
    }

    fn is_crossed(order: &Order, mark: f64) -> bool {
        match order.order_type {
            OrderType::Market => true,
            OrderType::Limit => match order.side {
                Side::Buy => mark <= order.price.unwrap_or(f64::MIN),
                Side::Sell => mark >= order.price.unwrap_or(f64::MAX),
            },
            // Stop triggers when the mark moves through it against the position
            OrderType::StopLimit => match order.side {
                Side::Sell => mark <= order.stop_price.unwrap_or(f64::MIN),
                Side::Buy => mark >= order.stop_price.unwrap_or(f64::MAX),
            },
        }
    }

    /// Script the next `place_order` call to fail with the given error.
    pub fn fail_next_place(&self, error: ExchangeError) {
        self.inner
            .lock()
            .unwrap()
            .place_failures
            .push_back(Some(error));
    }

    /// Script the next `place_order` call to succeed (used to target a
    /// failure at the second call of a sequence).
    pub fn pass_next_place(&self) {
        self.inner.lock().unwrap().place_failures.push_back(None);
    }

    /// Fill a resting order completely (test hook).
    pub fn fill_order(&self, order_id: u64) {
        let mut inner = self.inner.lock().unwrap();
        Inner::fill(&mut inner, order_id, None);
    }

    /// Fill a resting order partially (test hook).
    pub fn fill_order_partially(&self, order_id: u64, quantity: f64) {
        let mut inner = self.inner.lock().unwrap();
        Inner::fill(&mut inner, order_id, Some(quantity));
    }

    /// Number of orders currently resting (non-terminal).
    pub fn open_order_count(&self, symbol: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .orders
            .values()
            .filter(|o| o.symbol == symbol && !o.status.is_terminal())
            .count()
    }

    pub fn order(&self, order_id: u64) -> Option<Order> {
        self.inner.lock().unwrap().orders.get(&order_id).cloned()
    }
}

impl Inner {
    fn fill(inner: &mut Inner, order_id: u64, quantity: Option<f64>) {
        let mark = inner
            .orders
            .get(&order_id)
            .and_then(|o| inner.prices.get(&o.symbol))
            .copied();

        if let Some(order) = inner.orders.get_mut(&order_id) {
            if order.status.is_terminal() {
                return;
            }

            let fill_price = match order.order_type {
                OrderType::Market => mark.unwrap_or(order.price.unwrap_or(0.0)),
                _ => order.price.unwrap_or_else(|| mark.unwrap_or(0.0)),
            };

            match quantity {
                Some(qty) if qty < order.quantity - order.executed_qty => {
                    order.executed_qty += qty;
                    order.avg_price = fill_price;
                    order.status = OrderStatus::PartiallyFilled;
                }
                _ => {
                    order.executed_qty = order.quantity;
                    order.avg_price = fill_price;
                    order.status = OrderStatus::Filled;
                }
            }
        }
    }
}

impl Default for PaperExchange {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExchangeGateway for PaperExchange {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderRef, ExchangeError> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(Some(error)) = inner.place_failures.pop_front() {
            return Err(error);
        }

        let mark = match inner.prices.get(&request.symbol) {
            Some(&p) => p,
            None => return Err(ExchangeError::InvalidSymbol(request.symbol.clone())),
        };

        let order_id = inner.next_id;
        inner.next_id += 1;

        let order = Order {
            order_id,
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            quantity: request.quantity,
            price: request.price,
            stop_price: request.stop_price,
            status: OrderStatus::New,
            executed_qty: 0.0,
            avg_price: 0.0,
        };

        let immediate = Self::is_crossed(&order, mark);
        inner.orders.insert(order_id, order);
        if immediate {
            Inner::fill(&mut inner, order_id, None);
        }

        let order = &inner.orders[&order_id];
        Ok(OrderRef::from_order(order))
    }

    async fn cancel_order(&self, _symbol: &str, order_id: u64) -> Result<(), ExchangeError> {
        let mut inner = self.inner.lock().unwrap();

        match inner.orders.get_mut(&order_id) {
            None => Err(ExchangeError::OrderNotFound(order_id)),
            Some(order) if order.status.is_terminal() => {
                Err(ExchangeError::AlreadyTerminal(order_id))
            }
            Some(order) => {
                order.status = OrderStatus::Canceled;
                Ok(())
            }
        }
    }

    async fn order_status(&self, _symbol: &str, order_id: u64) -> Result<Order, ExchangeError> {
        self.inner
            .lock()
            .unwrap()
            .orders
            .get(&order_id)
            .cloned()
            .ok_or(ExchangeError::OrderNotFound(order_id))
    }

    async fn open_orders(&self, symbol: &str) -> Result<Vec<Order>, ExchangeError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .orders
            .values()
            .filter(|o| o.symbol == symbol && !o.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn current_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        self.inner
            .lock()
            .unwrap()
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::InvalidSymbol(symbol.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_market_order_fills_at_mark() {
        let exchange = PaperExchange::new();
        exchange.set_price("BTCUSDT", 50000.0);

        let order_ref = exchange
            .place_order(&OrderRequest::market("BTCUSDT", Side::Buy, 0.5))
            .await
            .unwrap();

        assert_eq!(order_ref.last_status, OrderStatus::Filled);
        let order = exchange.order(order_ref.order_id).unwrap();
        assert_eq!(order.avg_price, 50000.0);
        assert_eq!(order.executed_qty, 0.5);
    }

    #[tokio::test]
    async fn test_limit_order_rests_until_crossed() {
        let exchange = PaperExchange::new();
        exchange.set_price("BTCUSDT", 50000.0);

        let order_ref = exchange
            .place_order(&OrderRequest::limit("BTCUSDT", Side::Buy, 1.0, 48000.0))
            .await
            .unwrap();
        assert_eq!(order_ref.last_status, OrderStatus::New);

        // Price falls through the limit
        exchange.set_price("BTCUSDT", 47500.0);

        let order = exchange
            .order_status("BTCUSDT", order_ref.order_id)
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.avg_price, 48000.0);
    }

    #[tokio::test]
    async fn test_stop_limit_triggers_on_stop() {
        let exchange = PaperExchange::new();
        exchange.set_price("BTCUSDT", 50000.0);

        let order_ref = exchange
            .place_order(&OrderRequest::stop_limit(
                "BTCUSDT",
                Side::Sell,
                1.0,
                44900.0,
                45000.0,
            ))
            .await
            .unwrap();
        assert_eq!(order_ref.last_status, OrderStatus::New);

        exchange.set_price("BTCUSDT", 44800.0);
        let order = exchange
            .order_status("BTCUSDT", order_ref.order_id)
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn test_cancel_semantics() {
        let exchange = PaperExchange::new();
        exchange.set_price("BTCUSDT", 50000.0);

        let order_ref = exchange
            .place_order(&OrderRequest::limit("BTCUSDT", Side::Sell, 1.0, 55000.0))
            .await
            .unwrap();

        // First cancel succeeds
        exchange
            .cancel_order("BTCUSDT", order_ref.order_id)
            .await
            .unwrap();

        // Second cancel reports AlreadyTerminal
        let result = exchange.cancel_order("BTCUSDT", order_ref.order_id).await;
        assert!(matches!(result, Err(ExchangeError::AlreadyTerminal(_))));

        // Unknown id reports OrderNotFound
        let result = exchange.cancel_order("BTCUSDT", 9999).await;
        assert!(matches!(result, Err(ExchangeError::OrderNotFound(_))));
    }

    #[tokio::test]
    async fn test_scripted_place_failure() {
        let exchange = PaperExchange::new();
        exchange.set_price("BTCUSDT", 50000.0);
        exchange.fail_next_place(ExchangeError::InsufficientMargin);

        let result = exchange
            .place_order(&OrderRequest::market("BTCUSDT", Side::Buy, 0.1))
            .await;
        assert!(matches!(result, Err(ExchangeError::InsufficientMargin)));

        // Next call succeeds
        let result = exchange
            .place_order(&OrderRequest::market("BTCUSDT", Side::Buy, 0.1))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_partial_fill() {
        let exchange = PaperExchange::new();
        exchange.set_price("BTCUSDT", 50000.0);

        let order_ref = exchange
            .place_order(&OrderRequest::limit("BTCUSDT", Side::Buy, 1.0, 48000.0))
            .await
            .unwrap();

        exchange.fill_order_partially(order_ref.order_id, 0.4);
        let order = exchange.order(order_ref.order_id).unwrap();
        assert_eq!(order.status, OrderStatus::PartiallyFilled);
        assert_eq!(order.executed_qty, 0.4);
    }

    #[tokio::test]
    async fn test_open_orders_excludes_terminal() {
        let exchange = PaperExchange::new();
        exchange.set_price("BTCUSDT", 50000.0);

        let resting = exchange
            .place_order(&OrderRequest::limit("BTCUSDT", Side::Buy, 1.0, 48000.0))
            .await
            .unwrap();
        exchange
            .place_order(&OrderRequest::market("BTCUSDT", Side::Buy, 0.1))
            .await
            .unwrap();

        let open = exchange.open_orders("BTCUSDT").await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].order_id, resting.order_id);
    }

    #[tokio::test]
    async fn test_unknown_symbol() {
        let exchange = PaperExchange::new();
        let result = exchange.current_price("NOPE").await;
        assert!(matches!(result, Err(ExchangeError::InvalidSymbol(_))));
    }
}
