use sluice_core::{util::mix_into, NodeProcessor};

/// Mixes groups of inputs down to a set of outputs.
///
/// A node with `num_outputs` outputs must have a multiple of `num_outputs`
/// inputs. Input `i` is added to output `i % num_outputs`, so a stereo sum
/// of three stereo signals has 6 inputs laid out `L R L R L R`.
pub struct SumNode {
    num_outputs: usize,
}

impl SumNode {
    pub fn new(num_outputs: usize) -> Self {
        assert!(num_outputs > 0);
        Self { num_outputs }
    }
}

impl NodeProcessor for SumNode {
    fn process(&mut self, buffers: &mut [&mut [f32]], frames: usize) {
        let num_outputs = self.num_outputs.min(buffers.len());
        let (outputs, inputs) = buffers.split_at_mut(num_outputs);

        for (i, input) in inputs.iter().enumerate() {
            mix_into(&mut outputs[i % num_outputs][..frames], &input[..frames]);
        }
    }

    fn debug_name(&self) -> &'static str {
        "sum"
    }
}
