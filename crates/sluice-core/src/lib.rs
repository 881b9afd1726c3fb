pub mod lock;
pub mod node;
pub mod transaction;
pub mod util;
pub mod versioned;

pub use lock::{DualGenLock, ReadGuard, Slot};
pub use node::NodeProcessor;
pub use transaction::{batch, Commit, Transaction};
pub use versioned::{ObjectId, Publish, Snapshot, Versioned};

/// The default number of frames in one buffer of the arena.
///
/// A tick can never process more frames than this, so it also acts as
/// the maximum block size of the engine.
pub const DEFAULT_BUFFER_LEN: usize = 256;

/// The maximum number of input ports, and separately of output ports,
/// that a single node may have.
pub const MAX_PORTS: usize = 64;
