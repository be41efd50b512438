//! Order read-model worker: consumes the event topic, keeps `order_views`
//! current, and sweeps the retry ledger.

pub mod app;
pub mod cli;
