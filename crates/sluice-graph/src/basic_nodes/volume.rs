use std::sync::{atomic::Ordering, Arc};

use atomic_float::AtomicF32;
use sluice_core::{
    util::{db_to_amp_clamped_neg_100_db, percent_volume_to_raw_gain},
    NodeProcessor,
};

/// Scales every buffer by a gain that can be changed while the graph runs.
///
/// Create the node with as many inputs as outputs; each output is the
/// matching input times the gain.
pub struct VolumeNode {
    raw_gain: Arc<AtomicF32>,
}

impl VolumeNode {
    pub fn new(percent_volume: f32) -> Self {
        Self {
            raw_gain: Arc::new(AtomicF32::new(percent_volume_to_raw_gain(percent_volume))),
        }
    }

    /// A handle for changing the gain from the control thread.
    pub fn gain(&self) -> VolumeGain {
        VolumeGain(Arc::clone(&self.raw_gain))
    }
}

impl NodeProcessor for VolumeNode {
    fn process(&mut self, buffers: &mut [&mut [f32]], frames: usize) {
        let raw_gain = self.raw_gain.load(Ordering::Relaxed);

        if raw_gain < 0.00001 {
            // Muted, so there is no need to process.
            for b in buffers.iter_mut() {
                b[..frames].fill(0.0);
            }
            return;
        }

        if raw_gain == 1.0 {
            return;
        }

        for b in buffers.iter_mut() {
            for s in b[..frames].iter_mut() {
                *s *= raw_gain;
            }
        }
    }

    fn debug_name(&self) -> &'static str {
        "volume"
    }
}

/// Control-side handle to the gain of a [`VolumeNode`].
#[derive(Clone)]
pub struct VolumeGain(Arc<AtomicF32>);

impl VolumeGain {
    pub fn raw_gain(&self) -> f32 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set_percent_volume(&self, percent_volume: f32) {
        self.0
            .store(percent_volume_to_raw_gain(percent_volume), Ordering::Relaxed);
    }

    pub fn set_db(&self, db: f32) {
        self.0
            .store(db_to_amp_clamped_neg_100_db(db), Ordering::Relaxed);
    }
}
