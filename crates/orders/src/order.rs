use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use chronicle_core::{Aggregate, AggregateId, AggregateRoot, DomainError};
use chronicle_events::{Command, Event, EventRegistry, RegistryError};

pub const ORDER_CREATED: &str = "orders.order.created";
pub const ORDER_PAID: &str = "orders.order.paid";

/// Order identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub AggregateId);

impl OrderId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }

    pub fn as_aggregate_id(&self) -> &AggregateId {
        &self.0
    }
}

impl core::fmt::Display for OrderId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Lifecycle status shared by the aggregate and the read model.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Created,
    Paid,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Created => "CREATED",
            OrderStatus::Paid => "PAID",
        }
    }
}

impl core::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for OrderStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(OrderStatus::Created),
            "PAID" => Ok(OrderStatus::Paid),
            other => Err(DomainError::validation(format!("unknown order status: {other}"))),
        }
    }
}

/// Aggregate root: Order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    id: OrderId,
    status: Option<OrderStatus>,
    version: u64,
}

impl Order {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: OrderId) -> Self {
        Self {
            id,
            status: None,
            version: 0,
        }
    }

    /// `None` until `OrderCreated` has been applied.
    pub fn status(&self) -> Option<OrderStatus> {
        self.status
    }
}

impl AggregateRoot for Order {
    type Id = OrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOrder {
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: PayOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayOrder {
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderCommand {
    Create(CreateOrder),
    Pay(PayOrder),
}

impl Command for OrderCommand {
    fn target_aggregate_id(&self) -> &AggregateId {
        match self {
            OrderCommand::Create(c) => c.order_id.as_aggregate_id(),
            OrderCommand::Pay(c) => c.order_id.as_aggregate_id(),
        }
    }
}

/// Event: OrderCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCreated {
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderPaid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPaid {
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderEvent {
    Created(OrderCreated),
    Paid(OrderPaid),
}

impl OrderEvent {
    pub fn order_id(&self) -> &OrderId {
        match self {
            OrderEvent::Created(e) => &e.order_id,
            OrderEvent::Paid(e) => &e.order_id,
        }
    }
}

impl Event for OrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            OrderEvent::Created(_) => ORDER_CREATED,
            OrderEvent::Paid(_) => ORDER_PAID,
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            OrderEvent::Created(e) => e.occurred_at,
            OrderEvent::Paid(e) => e.occurred_at,
        }
    }

    fn encode_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            OrderEvent::Created(e) => serde_json::to_vec(e),
            OrderEvent::Paid(e) => serde_json::to_vec(e),
        }
    }
}

/// Decoders for every order event type.
pub fn order_registry() -> Result<EventRegistry<OrderEvent>, RegistryError> {
    EventRegistry::new()
        .with(ORDER_CREATED, |bytes| {
            serde_json::from_slice(bytes).map(OrderEvent::Created)
        })?
        .with(ORDER_PAID, |bytes| serde_json::from_slice(bytes).map(OrderEvent::Paid))
}

impl Aggregate for Order {
    type Command = OrderCommand;
    type Event = OrderEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            OrderEvent::Created(e) => {
                self.id = e.order_id.clone();
                self.status = Some(OrderStatus::Created);
            }
            OrderEvent::Paid(_) => {
                self.status = Some(OrderStatus::Paid);
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            OrderCommand::Create(cmd) => self.handle_create(cmd),
            OrderCommand::Pay(cmd) => self.handle_pay(cmd),
        }
    }
}

impl Order {
    fn ensure_order_id(&self, order_id: &OrderId) -> Result<(), DomainError> {
        if &self.id != order_id {
            return Err(DomainError::invariant("order_id mismatch"));
        }
        Ok(())
    }

    fn handle_create(&self, cmd: &CreateOrder) -> Result<Vec<OrderEvent>, DomainError> {
        if self.status.is_some() {
            return Err(DomainError::conflict("order already exists"));
        }
        self.ensure_order_id(&cmd.order_id)?;

        Ok(vec![OrderEvent::Created(OrderCreated {
            order_id: cmd.order_id.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_pay(&self, cmd: &PayOrder) -> Result<Vec<OrderEvent>, DomainError> {
        self.ensure_order_id(&cmd.order_id)?;

        match self.status {
            None => Err(DomainError::not_found()),
            Some(OrderStatus::Paid) => Err(DomainError::invariant(
                "invalid transition: order already paid",
            )),
            Some(OrderStatus::Created) => Ok(vec![OrderEvent::Paid(OrderPaid {
                order_id: cmd.order_id.clone(),
                occurred_at: cmd.occurred_at,
            })]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn order_id(raw: &str) -> OrderId {
        OrderId::new(AggregateId::new(raw).unwrap())
    }

    fn create(id: &OrderId) -> OrderCommand {
        OrderCommand::Create(CreateOrder {
            order_id: id.clone(),
            occurred_at: Utc::now(),
        })
    }

    fn pay(id: &OrderId) -> OrderCommand {
        OrderCommand::Pay(PayOrder {
            order_id: id.clone(),
            occurred_at: Utc::now(),
        })
    }

    fn run(order: &mut Order, cmd: &OrderCommand) -> Result<Vec<OrderEvent>, DomainError> {
        let events = order.handle(cmd)?;
        for e in &events {
            order.apply(e);
        }
        Ok(events)
    }

    #[test]
    fn create_then_pay() {
        let id = order_id("A1");
        let mut order = Order::empty(id.clone());

        let created = run(&mut order, &create(&id)).unwrap();
        assert_eq!(created[0].event_type(), ORDER_CREATED);
        assert_eq!(order.status(), Some(OrderStatus::Created));
        assert_eq!(order.version(), 1);

        run(&mut order, &pay(&id)).unwrap();
        assert_eq!(order.status(), Some(OrderStatus::Paid));
        assert_eq!(order.version(), 2);
    }

    #[test]
    fn pay_requires_existing_order() {
        let id = order_id("A1");
        let order = Order::empty(id.clone());
        assert_eq!(order.handle(&pay(&id)), Err(DomainError::NotFound));
    }

    #[test]
    fn paying_twice_is_an_invalid_transition() {
        let id = order_id("A1");
        let mut order = Order::empty(id.clone());
        run(&mut order, &create(&id)).unwrap();
        run(&mut order, &pay(&id)).unwrap();

        assert!(matches!(
            order.handle(&pay(&id)),
            Err(DomainError::InvariantViolation(_))
        ));
    }

    #[test]
    fn creating_twice_conflicts() {
        let id = order_id("A1");
        let mut order = Order::empty(id.clone());
        run(&mut order, &create(&id)).unwrap();
        assert!(matches!(order.handle(&create(&id)), Err(DomainError::Conflict(_))));
    }

    #[test]
    fn command_for_other_order_is_rejected() {
        let mut order = Order::empty(order_id("A1"));
        run(&mut order, &create(&order_id("A1"))).unwrap();
        assert!(matches!(
            order.handle(&pay(&order_id("B2"))),
            Err(DomainError::InvariantViolation(_))
        ));
    }

    #[test]
    fn payloads_decode_through_registry() {
        let registry = order_registry().unwrap();
        let event = OrderEvent::Paid(OrderPaid {
            order_id: order_id("A1"),
            occurred_at: Utc::now(),
        });

        let bytes = event.encode_payload().unwrap();
        let decoded = registry.decode(event.event_type(), &bytes).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn payload_is_the_variant_fields_only() {
        let event = OrderEvent::Created(OrderCreated {
            order_id: order_id("A1"),
            occurred_at: Utc::now(),
        });
        let value: serde_json::Value =
            serde_json::from_slice(&event.encode_payload().unwrap()).unwrap();
        assert_eq!(value["order_id"], "A1");
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: whatever commands are attempted, the version equals the number
        /// of accepted events and replaying them on a fresh instance reproduces state.
        #[test]
        fn version_tracks_accepted_events(pays in prop::collection::vec(any::<bool>(), 0..8)) {
            let id = order_id("A1");
            let mut order = Order::empty(id.clone());
            let mut history = Vec::new();

            for is_pay in pays {
                let cmd = if is_pay { pay(&id) } else { create(&id) };
                if let Ok(events) = run(&mut order, &cmd) {
                    history.extend(events);
                }
            }

            prop_assert_eq!(order.version(), history.len() as u64);

            let mut replayed = Order::empty(id.clone());
            for e in &history {
                replayed.apply(e);
            }
            prop_assert_eq!(replayed, order);
        }
    }
}
