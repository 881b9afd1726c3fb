mod dummy;
mod sum;
mod volume;

pub use dummy::DummyNode;
pub use sum::SumNode;
pub use volume::VolumeNode;
