//! Farm-wide distribution of refresher instructions.
//!
//! - `queue`: outbound FIFO with monotonic epochs
//! - `planner`: merges queued instructions before a sync
//! - `envelope`: the unit sent between nodes
//! - `transport`: the seam to the network
//! - `server`: `ServerMessenger`, local apply plus queue, sync and receive
//! - `distributed`: `DistributedCache`, the origin-side API

mod distributed;
mod envelope;
mod planner;
mod queue;
mod server;
mod transport;

pub use distributed::{CacheInstance, DistributedCache};
pub use envelope::MessageEnvelope;
pub use planner::SyncPlan;
pub use queue::{Epoch, InstructionQueue, QueuedMessage};
pub use server::{ReceiveOutcome, ServerMessenger, SyncReport};
pub use transport::{FarmTransport, NoopTransport};
