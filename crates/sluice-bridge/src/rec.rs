use std::sync::atomic::Ordering;
use std::sync::Arc;

use sluice_core::NodeProcessor;

use crate::handoff::{DoubleBuffer, Worker};
use crate::BridgeError;

/// Captures audio from the graph and hands it to a worker thread.
///
/// The `consume` callback receives one slice per channel and the number of
/// valid frames in them. It runs on the worker thread.
pub struct Recorder {
    worker: Worker,
}

impl Recorder {
    pub fn new<F>(channels: usize, half_len: usize, consume: F) -> Result<Self, BridgeError>
    where
        F: FnMut(&mut [&mut [f32]], usize) + Send + 'static,
    {
        Ok(Self {
            worker: Worker::spawn("sluice-rec", channels, half_len, consume)?,
        })
    }

    /// Delivers the partially filled half, if any, and waits for the worker
    /// to finish with everything handed to it so far.
    ///
    /// Recording restarts at the beginning of the first half. Only call this
    /// while no processor is running a [`RecordNode`] of this recorder.
    pub fn flush(&self) {
        let shared = self.worker.shared();
        let cursor = shared.cursor.load(Ordering::Acquire);
        let len = cursor % shared.half_len();

        if len > 0 {
            shared.submit(cursor / shared.half_len(), len);
        }

        shared.wait_idle();
        shared.cursor.store(0, Ordering::Release);
    }

    /// Blocks until every handed-off half has been consumed.
    pub fn wait_idle(&self) {
        self.worker.shared().wait_idle();
    }

    /// A node callback that records its buffers and leaves them untouched.
    ///
    /// Give the node `channels` inputs. Outputs, if any, pass the input
    /// through.
    pub fn node(&self) -> RecordNode {
        RecordNode {
            shared: Arc::clone(self.worker.shared()),
        }
    }
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.worker.shared();
        f.debug_struct("Recorder")
            .field("channels", &shared.channels())
            .field("half_len", &shared.half_len())
            .finish()
    }
}

pub struct RecordNode {
    shared: Arc<DoubleBuffer>,
}

impl NodeProcessor for RecordNode {
    fn process(&mut self, buffers: &mut [&mut [f32]], frames: usize) {
        self.shared.retry_deferred();

        let half_len = self.shared.half_len();
        let mut cursor = self.shared.cursor.load(Ordering::Acquire);
        let mut done = 0;

        while done < frames {
            let half = cursor / half_len;
            let offset = cursor % half_len;
            let n = (half_len - offset).min(frames - done);

            // Frames are lost while the worker still holds this half.
            if let Some(mut data) = self.shared.try_half(half) {
                for (ch, buf) in data.chunks_mut(half_len).zip(buffers.iter()) {
                    ch[offset..offset + n].copy_from_slice(&buf[done..done + n]);
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
        "record"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn collecting_recorder(channels: usize, half_len: usize) -> (Recorder, Arc<Mutex<Vec<Vec<f32>>>>) {
        let out = Arc::new(Mutex::new(vec![Vec::new(); channels]));
        let out_in_worker = Arc::clone(&out);

        let recorder = Recorder::new(channels, half_len, move |chans, frames| {
            let mut out = out_in_worker.lock();
            for (dst, ch) in out.iter_mut().zip(chans.iter()) {
                dst.extend_from_slice(&ch[..frames]);
            }
        })
        .unwrap();

        (recorder, out)
    }

    #[test]
    fn full_halves_reach_the_worker_in_order() {
        let (recorder, out) = collecting_recorder(2, 3);
        let mut node = recorder.node();

        for tick in 0..4 {
            let mut l: Vec<f32> = (0..3).map(|i| (tick * 3 + i) as f32).collect();
            let mut r: Vec<f32> = l.iter().map(|s| -s).collect();
            let mut bufs: [&mut [f32]; 2] = [&mut l, &mut r];
            node.process(&mut bufs, 3);
            recorder.wait_idle();
        }

        let out = out.lock();
        let expected: Vec<f32> = (0..12).map(|i| i as f32).collect();
        assert_eq!(out[0], expected);
        assert_eq!(out[1], expected.iter().map(|s| -s).collect::<Vec<_>>());
    }

    #[test]
    fn flush_delivers_a_partial_half() {
        let (recorder, out) = collecting_recorder(1, 4);
        let mut node = recorder.node();

        let mut a = vec![1.0f32; 6];
        {
            let mut bufs: [&mut [f32]; 1] = [&mut a];
            node.process(&mut bufs, 6);
        }
        // The input is left as it was.
        assert_eq!(a, vec![1.0; 6]);

        recorder.wait_idle();
        assert_eq!(out.lock()[0].len(), 4);

        recorder.flush();
        assert_eq!(out.lock()[0], vec![1.0; 6]);

        // Nothing is pending, so a second flush delivers nothing.
        recorder.flush();
        assert_eq!(out.lock()[0].len(), 6);
        assert_eq!(node.debug_name(), "record");
    }
}
