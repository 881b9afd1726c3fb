pub use sluice_core::*;
pub use sluice_graph::*;

#[cfg(feature = "bridge")]
pub use sluice_bridge::*;
