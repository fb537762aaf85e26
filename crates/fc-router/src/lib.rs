//! Message router.
//!
//! Consumes dispatch envelopes from the broker, multiplexes them into
//! per-pool worker sets with per-group FIFO, invokes the HTTP mediator,
//! and decides acknowledgement, retry delay, and visibility.
//!
//! The [`manager::QueueManager`] is the single owner of all pipeline-wide
//! state; consumers, pools, and timers talk to it exclusively through its
//! typed command channel.

pub mod consumer;
pub mod error;
pub mod lifecycle;
pub mod manager;
pub mod mediator;
pub mod pool;
pub mod processor;
pub mod visibility;
pub mod warning;

pub use consumer::{ConsumerLoop, HeartbeatRegistry};
pub use error::RouterError;
pub use lifecycle::{LifecycleConfig, LifecycleManager, StaticTopologySource, TopologySource};
pub use manager::{ConsumedMessage, ManagerSnapshot, QueueManager, QueueManagerHandle};
pub use mediator::{DeliveryRequest, HttpMediator, Mediator};
pub use pool::{PoolTask, ProcessPool};
pub use processor::JobProcessor;
pub use warning::WarningService;

pub type Result<T> = std::result::Result<T, RouterError>;
