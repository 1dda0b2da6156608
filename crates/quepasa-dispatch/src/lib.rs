//! # quepasa-dispatch
//!
//! The event-dispatch fabric: per-tenant subscriber lists (webhook URLs or
//! AMQP URIs), tri-state filter resolution, pre-filters, per-subscriber
//! ordered delivery with retry/backoff, and dispatch-error reporting back
//! to the message cache.

mod carrier;
mod dispatcher;
mod subscription;

pub use carrier::{Carrier, QueueCarrier, WebhookCarrier};
pub use dispatcher::{DispatchOutcome, Dispatcher, DispatcherConfig, ErrorSink};
pub use subscription::{DispatchSubscription, SubscriberKind};
