pub mod in_memory_queue;
pub mod memory_store;
pub mod message_queue;
pub mod message_queue_factory;
pub mod observability;
pub mod policy;
pub mod publishers;
pub mod subscriber_registry;

pub use in_memory_queue::{AckOutcome, AckRecord, InMemoryBroker};
pub use memory_store::*;
pub use message_queue::RabbitMQBroker;
pub use message_queue_factory::MessageQueueFactory;
pub use observability::{init_logging, init_metrics, init_observability};
pub use policy::StaticPolicyGate;
pub use publishers::{BrokerEventPublisher, BrokerNotifier, CompositeEventPublisher, LocalPublisher};
pub use subscriber_registry::{SubscriberRegistry, Subscription};
