//! Bridges between the render thread and a slower worker thread.
//!
//! Both bridges keep two halves of `half_len` frames per channel. The render
//! side reads (or writes) one half while a worker thread refills (or drains)
//! the other through a user callback. When the render side crosses a half
//! boundary, the finished half is handed to the worker.
//!
//! The render side never waits for the worker. It only ever try-locks a
//! half or the handoff queue. If the worker is still busy with the half the
//! render side needs, that stretch of audio is dropped (silence on
//! playback, lost frames on record). A finished half that cannot be queued
//! right away is retried on the next tick.

mod handoff;
mod play;
mod rec;

pub use play::{PlayNode, Player};
pub use rec::{RecordNode, Recorder};

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Failed to spawn the bridge worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}
