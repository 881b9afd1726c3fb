/// The realtime half of a node.
///
/// A node with `n` inputs and `m` outputs gets `max(n, m)` working
/// buffers, each exactly `frames` samples long. On entry, buffers
/// `0..n` hold the summed signal arriving at each input and any extra
/// buffers contain garbage. On return, buffers `0..m` must hold the
/// signal of each output. Processing is therefore always in place:
/// output `i` shares storage with input `i`.
///
/// This is called on the realtime thread. It must not block, allocate,
/// or deallocate.
pub trait NodeProcessor: Send + 'static {
    fn process(&mut self, buffers: &mut [&mut [f32]], frames: usize);

    fn debug_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

impl<F> NodeProcessor for F
where
    F: FnMut(&mut [&mut [f32]], usize) + Send + 'static,
{
    fn process(&mut self, buffers: &mut [&mut [f32]], frames: usize) {
        (self)(buffers, frames)
    }

    fn debug_name(&self) -> &'static str {
        "closure"
    }
}
