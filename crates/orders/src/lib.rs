//! Orders domain module (event-sourced).
//!
//! Business rules for the order lifecycle, implemented purely as deterministic
//! domain logic (no IO, no storage).

pub mod order;

pub use order::{
    CreateOrder, Order, OrderCommand, OrderCreated, OrderEvent, OrderId, OrderPaid, OrderStatus,
    PayOrder, order_registry,
};
