use sluice_core::NodeProcessor;

/// A node processor that does nothing.
///
/// Its outputs carry whatever its inputs carried, and any extra outputs
/// carry garbage.
pub struct DummyNode;

impl NodeProcessor for DummyNode {
    fn process(&mut self, _buffers: &mut [&mut [f32]], _frames: usize) {}

    fn debug_name(&self) -> &'static str {
        "dummy"
    }
}
