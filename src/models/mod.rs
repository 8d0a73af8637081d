use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Order side
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderType {
    Market,
    Limit,
    StopLimit,
}

/// Exchange-side order status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }
}

/// Parameters for a single exchange order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: f64,
    pub price: Option<f64>,      // Limit price
    pub stop_price: Option<f64>, // Trigger price for stop-limit
}

impl OrderRequest {
    pub fn market(symbol: &str, side: Side, quantity: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            stop_price: None,
        }
    }

    pub fn limit(symbol: &str, side: Side, quantity: f64, price: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Limit,
            quantity,
            price: Some(price),
            stop_price: None,
        }
    }

    pub fn stop_limit(symbol: &str, side: Side, quantity: f64, price: f64, stop_price: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::StopLimit,
            quantity,
            price: Some(price),
            stop_price: Some(stop_price),
        }
    }
}

/// Authoritative order state as reported by the exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: u64,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: f64,
    pub price: Option<f64>,
    pub stop_price: Option<f64>,
    pub status: OrderStatus,
    pub executed_qty: f64,
    pub avg_price: f64,
}

/// Local reference to an exchange-side order.
///
/// The engine only ever holds the id plus the last status it saw;
/// authoritative state is always re-fetched from the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRef {
    pub order_id: u64,
    pub symbol: String,
    pub last_status: OrderStatus,
    pub last_filled_qty: f64,
}

impl OrderRef {
    pub fn from_order(order: &Order) -> Self {
        Self {
            order_id: order.order_id,
            symbol: order.symbol.clone(),
            last_status: order.status,
            last_filled_qty: order.executed_qty,
        }
    }

    /// Ref for a leg that never reached the exchange (placement rejected
    /// or rolled back before it was sent).
    pub fn unplaced(symbol: &str) -> Self {
        Self {
            order_id: 0,
            symbol: symbol.to_string(),
            last_status: OrderStatus::Rejected,
            last_filled_qty: 0.0,
        }
    }

    /// Whether this ref points at a real exchange-side order.
    pub fn is_placed(&self) -> bool {
        self.order_id != 0
    }

    pub fn update_from(&mut self, order: &Order) {
        self.last_status = order.status;
        self.last_filled_qty = order.executed_qty;
    }

    pub fn is_terminal(&self) -> bool {
        self.last_status.is_terminal()
    }
}

// ============================================================================
// OCO
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OcoState {
    Active,
    Resolved,
    Failed,
}

/// Which leg of an OCO pair won the race (set once the group resolves)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OcoLeg {
    TakeProfit,
    StopLoss,
}

/// A linked take-profit / stop-loss pair. Filling one leg cancels the other.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcoGroup {
    pub id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub take_profit_price: f64,
    pub stop_loss_price: f64,
    pub take_profit: OrderRef,
    pub stop_loss: OrderRef,
    pub state: OcoState,
    pub filled_leg: Option<OcoLeg>,
    pub created_at: DateTime<Utc>,
    pub failure: Option<String>,
}

// ============================================================================
// TWAP
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TwapState {
    Running,
    Completed,
    Aborted,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SliceStatus {
    Pending,
    Placed,
    Filled,
    Failed,
    Canceled,
}

impl SliceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SliceStatus::Filled | SliceStatus::Failed | SliceStatus::Canceled)
    }
}

/// One scheduled child order within a TWAP plan.
/// Immutable once its status is terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SliceRecord {
    pub index: usize,
    pub quantity: f64,
    pub scheduled_at: DateTime<Utc>,
    pub order: Option<OrderRef>,
    pub filled_quantity: f64,
    pub fill_price: f64,
    pub status: SliceStatus,
    pub failure: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwapPlan {
    pub id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub total_quantity: f64,
    pub slice_count: usize,
    pub horizon_secs: u64,
    pub interval_secs: f64,
    pub limit_mode: bool,
    pub limit_offset: f64,
    pub slippage_tolerance: f64,
    pub reference_price: f64,
    pub executed_quantity: f64,
    pub total_cost: f64,
    pub slices: Vec<SliceRecord>,
    pub state: TwapState,
    pub created_at: DateTime<Utc>,
}

impl TwapPlan {
    /// Volume-weighted average fill price across all slices
    pub fn average_price(&self) -> f64 {
        if self.executed_quantity > 0.0 {
            self.total_cost / self.executed_quantity
        } else {
            0.0
        }
    }
}

// ============================================================================
// Grid
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum GridSpacing {
    Arithmetic,
    Geometric,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum GridState {
    Active,
    Canceled,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LevelStatus {
    Pending,
    Resting,
    Filled,
    Canceled,
}

/// One price point in a grid ladder, holding at most one resting order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridLevel {
    pub price: f64,
    pub side: Side,
    pub quantity: f64,
    pub order: Option<OrderRef>,
    pub status: LevelStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridStrategy {
    pub id: Uuid,
    pub symbol: String,
    pub upper_bound: f64,
    pub lower_bound: f64,
    pub level_count: usize,
    pub investment: f64,
    pub spacing: GridSpacing,
    pub levels: Vec<GridLevel>,
    pub state: GridState,
    pub fill_events: u32,
    pub realized_pnl: f64,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Supervisor-facing views
// ============================================================================

/// Tagged variant over the three strategy kinds; the supervisor
/// dispatches on the tag rather than through trait objects.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StrategyKind {
    Oco,
    Twap,
    Grid,
}

/// Point-in-time copy of a strategy record, as returned by status queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StrategySnapshot {
    Oco(OcoGroup),
    Twap(TwapPlan),
    Grid(GridStrategy),
}

impl StrategySnapshot {
    pub fn id(&self) -> Uuid {
        match self {
            StrategySnapshot::Oco(g) => g.id,
            StrategySnapshot::Twap(p) => p.id,
            StrategySnapshot::Grid(g) => g.id,
        }
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            StrategySnapshot::Oco(_) => StrategyKind::Oco,
            StrategySnapshot::Twap(_) => StrategyKind::Twap,
            StrategySnapshot::Grid(_) => StrategyKind::Grid,
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            StrategySnapshot::Oco(g) => g.state != OcoState::Active,
            StrategySnapshot::Twap(p) => p.state != TwapState::Running,
            StrategySnapshot::Grid(g) => g.state != GridState::Active,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_opposite() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.opposite(), Side::Buy);
    }

    #[test]
    fn test_order_status_terminal() {
        assert!(!OrderStatus::New.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Canceled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(OrderStatus::Expired.is_terminal());
    }

    #[test]
    fn test_order_ref_tracks_exchange_state() {
        let order = Order {
            order_id: 42,
            symbol: "BTCUSDT".to_string(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            quantity: 1.0,
            price: Some(50000.0),
            stop_price: None,
            status: OrderStatus::New,
            executed_qty: 0.0,
            avg_price: 0.0,
        };

        let mut order_ref = OrderRef::from_order(&order);
        assert_eq!(order_ref.order_id, 42);
        assert!(!order_ref.is_terminal());

        let filled = Order {
            status: OrderStatus::Filled,
            executed_qty: 1.0,
            avg_price: 50000.0,
            ..order
        };
        order_ref.update_from(&filled);
        assert!(order_ref.is_terminal());
        assert_eq!(order_ref.last_filled_qty, 1.0);
    }

    #[test]
    fn test_twap_average_price() {
        let plan = TwapPlan {
            id: Uuid::new_v4(),
            symbol: "BTCUSDT".to_string(),
            side: Side::Buy,
            total_quantity: 0.2,
            slice_count: 2,
            horizon_secs: 120,
            interval_secs: 60.0,
            limit_mode: false,
            limit_offset: 0.001,
            slippage_tolerance: 0.01,
            reference_price: 50000.0,
            executed_quantity: 0.2,
            total_cost: 0.1 * 50000.0 + 0.1 * 51000.0,
            slices: Vec::new(),
            state: TwapState::Completed,
            created_at: Utc::now(),
        };

        assert!((plan.average_price() - 50500.0).abs() < 1e-9);
    }
}
