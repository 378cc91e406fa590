pub mod broker;
pub mod engine;
pub mod order;
pub mod quality;
pub mod sim;

pub use broker::{Broker, BrokerError, ExecReport};
pub use engine::{choose_order, ExecutionEngine};
pub use order::{apply_event, Event, Order, OrderState, SubmitOrder, TransitionError};
pub use quality::execution_quality;
pub use sim::SimMarket;
