use std::sync::atomic::Ordering;
use std::sync::Arc;

use sluice_core::{util::mix_into, NodeProcessor};

use crate::handoff::{DoubleBuffer, Worker};
use crate::BridgeError;

/// Feeds audio produced on a worker thread into the graph.
///
/// The `fill` callback receives one slice per channel and the number of
/// frames to produce. It runs on the worker thread, so it may block on I/O.
pub struct Player {
    worker: Worker,
}

impl Player {
    pub fn new<F>(channels: usize, half_len: usize, fill: F) -> Result<Self, BridgeError>
    where
        F: FnMut(&mut [&mut [f32]], usize) + Send + 'static,
    {
        Ok(Self {
            worker: Worker::spawn("sluice-play", channels, half_len, fill)?,
        })
    }

    /// Fills both halves and rewinds playback to the start of the first one.
    ///
    /// Call this before the graph starts pulling from [`PlayNode`]s.
    pub fn prepare(&self) {
        let shared = self.worker.shared();
        shared.submit(0, shared.half_len());
        shared.submit(1, shared.half_len());
        shared.wait_idle();
        shared.cursor.store(0, Ordering::Release);
    }

    /// Blocks until every requested refill has completed.
    pub fn wait_idle(&self) {
        self.worker.shared().wait_idle();
    }

    /// A node callback that mixes the playback into its buffers.
    ///
    /// Give the node `channels` inputs and `channels` outputs. Unconnected
    /// inputs are silent, so the outputs then carry the playback alone.
    pub fn node(&self) -> PlayNode {
        PlayNode {
            shared: Arc::clone(self.worker.shared()),
        }
    }
}

impl std::fmt::Debug for Player {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.worker.shared();
        f.debug_struct("Player")
            .field("channels", &shared.channels())
            .field("half_len", &shared.half_len())
            .finish()
    }
}

pub struct PlayNode {
    shared: Arc<DoubleBuffer>,
}

impl NodeProcessor for PlayNode {
    fn process(&mut self, buffers: &mut [&mut [f32]], frames: usize) {
        self.shared.retry_deferred();

        let half_len = self.shared.half_len();
        let mut cursor = self.shared.cursor.load(Ordering::Acquire);
        let mut done = 0;

        while done < frames {
            let half = cursor / half_len;
            let offset = cursor % half_len;
            let n = (half_len - offset).min(frames - done);

            // A half still being refilled plays as silence.
            if let Some(data) = self.shared.try_half(half) {
                for (buf, ch) in buffers.iter_mut().zip(data.chunks(half_len)) {
                    mix_into(&mut buf[done..done + n], &ch[offset..offset + n]);
                }
            }

            done += n;
            cursor += n;

            if cursor % half_len == 0 {
                self.shared.submit_full(half);
                cursor %= 2 * half_len;
            }
        }

        self.shared.cursor.store(cursor, Ordering::Release);
    }

    fn debug_name(&self) -> &'static str {
        "play"
    }
}
