pub mod arena;
pub mod basic_nodes;
pub mod graph;
pub mod processor;

pub use arena::{ArenaStats, BufferArena, BufferIdx};
pub use graph::{
    attach, detach, DependencyError, Graph, GraphConfig, GraphError, Node, ResourceFault, Sink,
    Source, StateError,
};
pub use processor::Processor;
