use chronicle_core::AggregateId;

/// A command targets a specific aggregate.
///
/// Commands are **intent** and are never persisted; accepted commands become
/// events. Each command operates on exactly one aggregate, which is the
/// consistency and concurrency boundary.
pub trait Command: Clone + core::fmt::Debug + Send + Sync + 'static {
    fn target_aggregate_id(&self) -> &AggregateId;
}
