//! Infrastructure: ledger, replay, publish path, projections, retry, workers, config.

pub mod command_dispatcher;
pub mod config;
pub mod db;
pub mod event_bus;
pub mod event_store;
pub mod projections;
pub mod read_model;
pub mod replay;
pub mod retry;
pub mod workers;
