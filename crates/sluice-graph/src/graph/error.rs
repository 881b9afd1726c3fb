/// An operation was attempted on a node or graph in the wrong state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    /// The node is already a member of a graph.
    #[error("Node {0} is already a member of a graph")]
    AlreadyJoined(String),
    /// The node is not a member of any graph.
    #[error("Node {0} is not a member of any graph")]
    NotJoined(String),
    /// The node already joined or left a graph in this transaction.
    #[error("Node {0} already joined or left a graph in this transaction")]
    MembershipChangedInBatch(String),
    /// The given port index is out of range.
    #[error("Port index {index} is out of range on node {node} with {num_ports} ports")]
    PortOutOfRange {
        node: String,
        index: u32,
        num_ports: u32,
    },
    /// More ports were requested than a node can have.
    #[error("Requested {requested} ports, but a node can have at most {max}")]
    TooManyPorts { requested: usize, max: usize },
    /// A processor for this graph already exists.
    #[error("A processor for this graph is already active")]
    ProcessorActive,
    /// A graph configuration value is out of range.
    #[error("Invalid graph configuration: {0}")]
    InvalidConfig(&'static str),
}

/// An operation conflicts with the edges that exist in the graph.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DependencyError {
    /// The node still has edges on its ports.
    #[error("Node {node} still has {edges} edges attached")]
    LiveEdges { node: String, edges: usize },
    /// The edge to remove does not exist.
    #[error("Could not detach edge: edge {0} does not exist")]
    EdgeNotFound(String),
    /// The edge to add already exists.
    #[error("Could not attach edge: edge {0} already exists")]
    EdgeAlreadyExists(String),
}

/// Any error returned by a control-path operation on the graph.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Dependency(#[from] DependencyError),
    /// The message channel to the processor is full.
    #[error("Message channel to the processor is full")]
    MessageChannelFull,
}

/// The buffer arena ran out of buffers in the middle of a tick.
///
/// This means the graph is configured with fewer buffers than its
/// topology needs at once. It is a configuration defect, so the
/// processor treats it as fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Buffer arena exhausted: all {capacity} buffers are in use (increase the number of buffers in the graph config)")]
pub struct ResourceFault {
    pub capacity: usize,
}
