//! The Lease Manager reconciliation loop and the per-shard Polling Consumer
//! it spawns and retires.

pub mod lease;
pub mod poll;

pub use lease::{DownstreamSink, LeaseManager};
pub use poll::{Delivery, DeliveryOutcome, PollingConsumer, RecordSink, StopCallback};
