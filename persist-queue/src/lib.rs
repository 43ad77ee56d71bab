pub mod queue;

pub use queue::{PersistQueue, QueueItem};
