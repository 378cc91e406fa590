use crate::logging::log_order_state;
use crate::types::{Fill, OrderType, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    New,
    Partial,
    Filled,
    Rejected,
    Cancelled,
}

impl OrderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderState::New => "new",
            OrderState::Partial => "partial",
            OrderState::Filled => "filled",
            OrderState::Rejected => "rejected",
            OrderState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderState::Filled | OrderState::Rejected | OrderState::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmitOrder {
    pub asset: String,
    pub side: Side,
    pub qty: f64,
    pub order_type: OrderType,
    pub limit_price: Option<f64>,
    pub start_ms: Option<u64>,
    pub end_ms: Option<u64>,
}

impl SubmitOrder {
    /// Missing bounds are open; no window means always eligible.
    pub fn in_window(&self, now_ms: u64) -> bool {
        self.start_ms.map_or(true, |start| now_ms >= start) && self.end_ms.map_or(true, |end| now_ms <= end)
    }

    pub fn window_elapsed(&self, now_ms: u64) -> bool {
        self.end_ms.map(|end| now_ms > end).unwrap_or(false)
    }

    /// Whether `price` satisfies the limit; non-limit orders always do.
    pub fn accepts_price(&self, price: f64) -> bool {
        match (self.order_type, self.limit_price) {
            (OrderType::Limit, Some(limit)) => match self.side {
                Side::Buy => price <= limit,
                Side::Sell => price >= limit,
            },
            _ => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Order {
    pub id: String,
    pub request: SubmitOrder,
    pub submitted_at: u64,
    pub state: OrderState,
    pub fills: Vec<Fill>,
}

impl Order {
    pub fn new(id: String, request: SubmitOrder, submitted_at: u64) -> Self {
        Self { id, request, submitted_at, state: OrderState::New, fills: Vec::new() }
    }

    pub fn filled_qty(&self) -> f64 {
        self.fills.iter().map(|f| f.qty).sum()
    }

    pub fn remaining(&self) -> f64 {
        (self.request.qty - self.filled_qty()).max(0.0)
    }

    pub fn done(&self) -> bool {
        self.state.is_terminal()
    }
}

#[derive(Debug, Clone)]
pub enum Event {
    Fill(Fill),
    /// Time window closed; unfilled remainder is abandoned.
    Expire,
    Cancel,
}

#[derive(Debug, Clone)]
pub struct TransitionError {
    pub msg: String,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for TransitionError {}

pub fn apply_event(order: &mut Order, event: Event) -> Result<(), TransitionError> {
    let prev = order.state;
    match (order.state, event) {
        (OrderState::New, Event::Fill(fill)) | (OrderState::Partial, Event::Fill(fill)) => {
            if !(fill.qty > 0.0) {
                return Err(TransitionError { msg: format!("non-positive fill qty {}", fill.qty) });
            }
            if let Some(last) = order.fills.last() {
                if fill.timestamp < last.timestamp {
                    return Err(TransitionError { msg: "fill out of order".to_string() });
                }
            }
            order.fills.push(fill);
            order.state = if order.filled_qty() + 1e-9 >= order.request.qty {
                OrderState::Filled
            } else {
                OrderState::Partial
            };
        }
        (state, Event::Fill(_)) => {
            return Err(TransitionError { msg: format!("fill on {} order {}", state.as_str(), order.id) });
        }
        (OrderState::New, Event::Expire) => order.state = OrderState::Rejected,
        (OrderState::Partial, Event::Expire) => order.state = OrderState::Filled,
        (OrderState::New, Event::Cancel) | (OrderState::Partial, Event::Cancel) => {
            order.state = OrderState::Cancelled
        }
        // terminal orders ignore expiry and repeated cancels
        (_, Event::Expire) | (_, Event::Cancel) => {}
    }
    if order.state != prev {
        log_order_state(&order.id, prev.as_str(), order.state.as_str(), order.filled_qty(), order.request.qty);
    }
    Ok(())
}
