use std::cell::UnsafeCell;
use std::collections::BTreeSet;
use std::convert::Infallible;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, Weak};

use sluice_core::transaction::batch;
use sluice_core::{NodeProcessor, ObjectId, Publish, Slot, Transaction, Versioned, MAX_PORTS};

use super::error::{DependencyError, GraphError, StateError};
use super::GraphShared;

/// Marks a node that is not in the snapshot of the slot.
pub(crate) const NO_POSITION: u32 = u32::MAX;

/// An input port.
pub(crate) struct SinkPort {
    pub(crate) sources: Arc<Versioned<BTreeSet<Source>>>,

    // Render-side state, only touched by the processor of the graph the
    // owning node belongs to.
    pub(crate) fan_in: AtomicU32,
    pub(crate) expected: AtomicU32,
    pub(crate) accum: AtomicU32,
}

impl SinkPort {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sources: Versioned::new(BTreeSet::new()),
            fan_in: AtomicU32::new(0),
            expected: AtomicU32::new(0),
            accum: AtomicU32::new(0),
        })
    }
}

/// An output port.
pub(crate) struct SourcePort {
    pub(crate) sinks: Arc<Versioned<BTreeSet<Sink>>>,
    pub(crate) buf: AtomicU32,
}

impl SourcePort {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sinks: Versioned::new(BTreeSet::new()),
            buf: AtomicU32::new(0),
        })
    }
}

#[derive(Clone, Default)]
pub(crate) struct NodeState {
    pub(crate) graph: Option<Weak<GraphShared>>,
    pub(crate) sinks: Vec<Arc<SinkPort>>,
    pub(crate) sources: Vec<Arc<SourcePort>>,
}

impl NodeState {
    pub(crate) fn graph(&self) -> Option<Arc<GraphShared>> {
        self.graph.as_ref().and_then(Weak::upgrade)
    }
}

impl Publish for NodeState {
    type Snapshot = NodeState;

    fn publish(&self, _slot: Slot, snapshot: &mut NodeState) {
        snapshot.clone_from(self);
    }

    fn restore(&mut self, snapshot: &NodeState) {
        self.clone_from(snapshot);
    }
}

pub(crate) struct NodeInner {
    pub(crate) state: Arc<Versioned<NodeState>>,
    processor: UnsafeCell<Box<dyn NodeProcessor>>,
    debug_name: &'static str,

    pub(crate) arrivals: AtomicU32,
    pub(crate) queue_next: AtomicU32,
    pub(crate) position: [AtomicU32; 2],
}

// SAFETY: The processor is only ever called through `NodeInner::process`,
// whose callers guarantee exclusive access.
unsafe impl Sync for NodeInner {}

impl NodeInner {
    /// Run the node's processor.
    ///
    /// # Safety
    ///
    /// Only the processor of the graph this node is a member of may call
    /// this, and only while it holds a read guard of that graph in which
    /// the node is present.
    #[inline]
    pub(crate) unsafe fn process(&self, buffers: &mut [&mut [f32]], frames: usize) {
        (*self.processor.get()).process(buffers, frames)
    }
}

/// A handle to a processing node.
///
/// Nodes are created outside of any graph and become part of one with
/// [`Graph::sync`](crate::Graph::sync). Cloning the handle is cheap and
/// refers to the same node.
///
/// Edges hold strong references to the nodes on both ends, so a node that
/// still has edges stays alive until they are detached (for example with
/// [`Node::reset`]).
#[derive(Clone)]
pub struct Node(pub(crate) Arc<NodeInner>);

impl Node {
    /// Create a node with the given number of input and output ports.
    ///
    /// # Panics
    ///
    /// Panics if either number is greater than [`MAX_PORTS`].
    pub fn new(num_inputs: usize, num_outputs: usize, processor: impl NodeProcessor) -> Self {
        assert!(num_inputs <= MAX_PORTS);
        assert!(num_outputs <= MAX_PORTS);

        let debug_name = processor.debug_name();

        let state = NodeState {
            graph: None,
            sinks: (0..num_inputs).map(|_| SinkPort::new()).collect(),
            sources: (0..num_outputs).map(|_| SourcePort::new()).collect(),
        };

        Self(Arc::new(NodeInner {
            state: Versioned::new(state),
            processor: UnsafeCell::new(Box::new(processor)),
            debug_name,
            arrivals: AtomicU32::new(0),
            queue_next: AtomicU32::new(NO_POSITION),
            position: [AtomicU32::new(NO_POSITION), AtomicU32::new(NO_POSITION)],
        }))
    }

    pub fn id(&self) -> ObjectId {
        self.0.state.id()
    }

    pub fn debug_name(&self) -> &'static str {
        self.0.debug_name
    }

    /// The number of input ports as of the last commit.
    pub fn num_inputs(&self) -> usize {
        self.0.state.read().sinks.len()
    }

    /// The number of output ports as of the last commit.
    pub fn num_outputs(&self) -> usize {
        self.0.state.read().sources.len()
    }

    /// Returns `true` if this node was a member of a graph as of the last
    /// commit.
    pub fn is_synced(&self) -> bool {
        self.0.state.read().graph().is_some()
    }

    /// A handle to the input port with the given index.
    pub fn sink(&self, index: usize) -> Result<Sink, StateError> {
        let num_ports = self.num_inputs();
        if index >= num_ports {
            return Err(self.port_out_of_range(index, num_ports));
        }
        Ok(Sink {
            node: self.clone(),
            index: index as u32,
        })
    }

    /// A handle to the output port with the given index.
    pub fn source(&self, index: usize) -> Result<Source, StateError> {
        let num_ports = self.num_outputs();
        if index >= num_ports {
            return Err(self.port_out_of_range(index, num_ports));
        }
        Ok(Source {
            node: self.clone(),
            index: index as u32,
        })
    }

    /// Change the number of input and output ports.
    ///
    /// Ports with an index beyond the new counts are removed together
    /// with all of their edges. Existing ports below the new counts keep
    /// their edges.
    pub fn resize(
        &self,
        num_inputs: usize,
        num_outputs: usize,
        txn: Option<&mut Transaction>,
    ) -> Result<(), GraphError> {
        let requested = num_inputs.max(num_outputs);
        if requested > MAX_PORTS {
            return Err(StateError::TooManyPorts {
                requested,
                max: MAX_PORTS,
            }
            .into());
        }

        batch(txn, |txn| {
            let (sinks, sources) = self.ports_auth(txn);
            for (i, port) in sinks.iter().enumerate().skip(num_inputs) {
                sever_sink(&self.sink_handle(i), port, txn);
            }
            for (i, port) in sources.iter().enumerate().skip(num_outputs) {
                sever_source(&self.source_handle(i), port, txn);
            }

            self.state_mut(txn, |s| {
                s.sinks.truncate(num_inputs);
                while s.sinks.len() < num_inputs {
                    s.sinks.push(SinkPort::new());
                }
                s.sources.truncate(num_outputs);
                while s.sources.len() < num_outputs {
                    s.sources.push(SourcePort::new());
                }
            });

            Ok(())
        })
    }

    /// Detach every edge on every port of this node.
    pub fn reset(&self, txn: Option<&mut Transaction>) {
        batch(txn, |txn| -> Result<(), Infallible> {
            let (sinks, sources) = self.ports_auth(txn);
            for (i, port) in sinks.iter().enumerate() {
                sever_sink(&self.sink_handle(i), port, txn);
            }
            for (i, port) in sources.iter().enumerate() {
                sever_source(&self.source_handle(i), port, txn);
            }

            Ok(())
        })
        .unwrap_or_else(|e| match e {})
    }

    /// Returns `true` if both handles refer to the same node.
    pub fn ptr_eq(&self, other: &Node) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// The graph this node belongs to in the authoritative state.
    ///
    /// The graph, if any, is added to `txn` along with the node. The
    /// processor reads node and port snapshots under the read guard of the
    /// graph alone, so a batch that locks a node or one of its ports must
    /// also hold that graph, even if the batch fails later on.
    pub(crate) fn graph_auth(&self, txn: &mut Transaction) -> Option<Arc<GraphShared>> {
        let graph = self.0.state.with_mut(txn, |s| s.graph());
        if let Some(graph) = &graph {
            graph.registry.enlist(txn);
        }
        graph
    }

    /// Access the authoritative state of this node, holding its graph too.
    pub(crate) fn state_mut<R>(
        &self,
        txn: &mut Transaction,
        f: impl FnOnce(&mut NodeState) -> R,
    ) -> R {
        self.graph_auth(txn);
        self.0.state.with_mut(txn, f)
    }

    pub(crate) fn ports_auth(
        &self,
        txn: &mut Transaction,
    ) -> (Vec<Arc<SinkPort>>, Vec<Arc<SourcePort>>) {
        self.state_mut(txn, |s| (s.sinks.clone(), s.sources.clone()))
    }

    /// The number of edges on all ports in the authoritative state.
    pub(crate) fn live_edges(&self, txn: &mut Transaction) -> usize {
        let (sinks, sources) = self.ports_auth(txn);
        let mut edges = 0;
        for port in sinks.iter() {
            edges += port.sources.with_mut(txn, |s| s.len());
        }
        for port in sources.iter() {
            edges += port.sinks.with_mut(txn, |s| s.len());
        }
        edges
    }

    fn sink_handle(&self, index: usize) -> Sink {
        Sink {
            node: self.clone(),
            index: index as u32,
        }
    }

    fn source_handle(&self, index: usize) -> Source {
        Source {
            node: self.clone(),
            index: index as u32,
        }
    }

    fn port_out_of_range(&self, index: usize, num_ports: usize) -> StateError {
        StateError::PortOutOfRange {
            node: self.to_string(),
            index: index as u32,
            num_ports: num_ports as u32,
        }
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Node {}

impl Ord for Node {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.id().cmp(&other.id())
    }
}

impl PartialOrd for Node {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Hash for Node {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.0.debug_name, self.id().raw())
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// A handle to an input port of a node.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Sink {
    node: Node,
    index: u32,
}

impl Sink {
    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn index(&self) -> usize {
        self.index as usize
    }

    /// The sources feeding this port as of the last commit.
    pub fn sources(&self) -> Vec<Source> {
        let state = self.node.0.state.read();
        state
            .sinks
            .get(self.index())
            .map(|port| port.sources.read().to_vec())
            .unwrap_or_default()
    }

    pub(crate) fn port_auth(&self, txn: &mut Transaction) -> Result<Arc<SinkPort>, StateError> {
        let port = self
            .node
            .state_mut(txn, |s| (s.sinks.get(self.index()).cloned(), s.sinks.len()));
        match port {
            (Some(port), _) => Ok(port),
            (None, num_ports) => Err(self.node.port_out_of_range(self.index(), num_ports)),
        }
    }
}

impl fmt::Debug for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:in{}", self.node, self.index)
    }
}

/// A handle to an output port of a node.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Source {
    node: Node,
    index: u32,
}

impl Source {
    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn index(&self) -> usize {
        self.index as usize
    }

    /// The sinks this port feeds as of the last commit.
    pub fn sinks(&self) -> Vec<Sink> {
        let state = self.node.0.state.read();
        state
            .sources
            .get(self.index())
            .map(|port| port.sinks.read().to_vec())
            .unwrap_or_default()
    }

    pub(crate) fn port_auth(&self, txn: &mut Transaction) -> Result<Arc<SourcePort>, StateError> {
        let port = self
            .node
            .state_mut(txn, |s| (s.sources.get(self.index()).cloned(), s.sources.len()));
        match port {
            (Some(port), _) => Ok(port),
            (None, num_ports) => Err(self.node.port_out_of_range(self.index(), num_ports)),
        }
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:out{}", self.node, self.index)
    }
}

fn edge_name(source: &Source, sink: &Sink) -> String {
    format!("{:?} -> {:?}", source, sink)
}

pub(crate) fn link(source: &Source, sink: &Sink, txn: &mut Transaction) -> Result<(), GraphError> {
    let source_port = source.port_auth(txn)?;
    let sink_port = sink.port_auth(txn)?;

    if source_port.sinks.with_mut(txn, |s| s.contains(sink)) {
        return Err(DependencyError::EdgeAlreadyExists(edge_name(source, sink)).into());
    }

    source_port.sinks.with_mut(txn, |s| s.insert(sink.clone()));
    sink_port.sources.with_mut(txn, |s| s.insert(source.clone()));

    Ok(())
}

pub(crate) fn unlink(source: &Source, sink: &Sink, txn: &mut Transaction) -> Result<(), GraphError> {
    let source_port = source.port_auth(txn)?;
    let sink_port = sink.port_auth(txn)?;

    if !source_port.sinks.with_mut(txn, |s| s.contains(sink)) {
        return Err(DependencyError::EdgeNotFound(edge_name(source, sink)).into());
    }

    source_port.sinks.with_mut(txn, |s| s.remove(sink));
    sink_port.sources.with_mut(txn, |s| s.remove(source));

    Ok(())
}

/// Remove every edge arriving at `port`. The port must have been taken
/// through its node's authoritative state.
fn sever_sink(sink: &Sink, port: &SinkPort, txn: &mut Transaction) {
    let sources = port.sources.with_mut(txn, std::mem::take);
    for source in sources.iter() {
        if let Ok(source_port) = source.port_auth(txn) {
            source_port.sinks.with_mut(txn, |s| s.remove(sink));
        }
    }
}

/// Remove every edge leaving `port`. The port must have been taken
/// through its node's authoritative state.
fn sever_source(source: &Source, port: &SourcePort, txn: &mut Transaction) {
    let sinks = port.sinks.with_mut(txn, std::mem::take);
    for sink in sinks.iter() {
        if let Ok(sink_port) = sink.port_auth(txn) {
            sink_port.sources.with_mut(txn, |s| s.remove(source));
        }
    }
}
