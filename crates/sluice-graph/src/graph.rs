mod error;
mod node;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::Mutex;
use rtrb::PushError;

use sluice_core::transaction::batch;
use sluice_core::{ObjectId, Publish, Slot, Transaction, Versioned, DEFAULT_BUFFER_LEN};

use crate::arena::BufferArena;
use crate::processor::{ContextToProcessorMsg, Processor, ProcessorToContextMsg};

pub use self::error::{DependencyError, GraphError, ResourceFault, StateError};
pub use self::node::{Node, Sink, Source};

pub(crate) use self::node::{NodeInner, SourcePort, NO_POSITION};

const CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphConfig {
    /// The number of buffers in the arena.
    ///
    /// This must be at least the largest number of buffers that are alive
    /// at the same time during one tick, otherwise the processor faults.
    /// See [`Processor::arena_stats`].
    pub num_buffers: usize,
    /// The length of each buffer in frames. This is also the maximum number
    /// of frames a single tick can process.
    pub buffer_len: usize,
    pub initial_node_capacity: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            num_buffers: 16,
            buffer_len: DEFAULT_BUFFER_LEN,
            initial_node_capacity: 64,
        }
    }
}

impl GraphConfig {
    fn validate(&self) -> Result<(), StateError> {
        if self.num_buffers == 0 {
            return Err(StateError::InvalidConfig("the arena needs at least one buffer"));
        }
        if self.buffer_len == 0 {
            return Err(StateError::InvalidConfig("buffers must hold at least one frame"));
        }
        Ok(())
    }
}

/// The nodes of a graph, in processing order.
pub(crate) struct NodeRegistry {
    nodes: Vec<Node>,
    index: AHashMap<ObjectId, usize>,
}

impl NodeRegistry {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(capacity),
            index: AHashMap::with_capacity(capacity),
        }
    }

    fn contains(&self, node: &Node) -> bool {
        self.index.contains_key(&node.id())
    }

    fn insert(&mut self, node: Node) {
        debug_assert!(!self.contains(&node));
        self.index.insert(node.id(), self.nodes.len());
        self.nodes.push(node);
    }

    fn remove(&mut self, node: &Node) -> bool {
        let Some(i) = self.index.remove(&node.id()) else {
            return false;
        };

        self.nodes.remove(i);
        for (j, n) in self.nodes.iter().enumerate().skip(i) {
            self.index.insert(n.id(), j);
        }
        true
    }
}

impl Publish for NodeRegistry {
    type Snapshot = Vec<Node>;

    fn publish(&self, slot: Slot, snapshot: &mut Vec<Node>) {
        for node in snapshot.iter() {
            node.0.position[slot.index()].store(NO_POSITION, Ordering::Relaxed);
        }

        snapshot.clear();
        snapshot.extend(self.nodes.iter().cloned());

        for (i, node) in snapshot.iter().enumerate() {
            node.0.position[slot.index()].store(i as u32, Ordering::Relaxed);
        }
    }

    fn restore(&mut self, snapshot: &Vec<Node>) {
        self.nodes.clear();
        self.index.clear();
        for node in snapshot.iter() {
            self.insert(node.clone());
        }
    }
}

struct ControlState {
    config: GraphConfig,
    to_processor_tx: Option<rtrb::Producer<ContextToProcessorMsg>>,
    from_processor_rx: Option<rtrb::Consumer<ProcessorToContextMsg>>,
}

impl ControlState {
    fn processor_active(&self) -> bool {
        self.to_processor_tx
            .as_ref()
            .is_some_and(|tx| !tx.is_abandoned())
    }
}

pub(crate) struct GraphShared {
    pub(crate) registry: Arc<Versioned<NodeRegistry>>,
    control: Mutex<ControlState>,
}

/// A handle to an audio graph.
///
/// Cloning the handle is cheap and refers to the same graph.
#[derive(Clone)]
pub struct Graph(pub(crate) Arc<GraphShared>);

impl Graph {
    pub fn new(config: GraphConfig) -> Result<Self, GraphError> {
        config.validate()?;

        Ok(Self(Arc::new(GraphShared {
            registry: Versioned::new(NodeRegistry::with_capacity(
                config.initial_node_capacity,
            )),
            control: Mutex::new(ControlState {
                config,
                to_processor_tx: None,
                from_processor_rx: None,
            }),
        })))
    }

    pub fn id(&self) -> ObjectId {
        self.0.registry.id()
    }

    pub fn config(&self) -> GraphConfig {
        self.0.control.lock().config
    }

    /// Add a node to this graph.
    ///
    /// The node is processed from the first tick after the transaction
    /// commits.
    pub fn sync(&self, node: &Node, txn: Option<&mut Transaction>) -> Result<(), GraphError> {
        batch(txn, |txn| {
            if node.graph_auth(txn).is_some() {
                return Err(StateError::AlreadyJoined(node.to_string()).into());
            }
            if !txn.mark_moved(node.id()) {
                return Err(StateError::MembershipChangedInBatch(node.to_string()).into());
            }

            self.0.registry.with_mut(txn, |r| r.insert(node.clone()));
            node.0
                .state
                .with_mut(txn, |s| s.graph = Some(Arc::downgrade(&self.0)));

            Ok(())
        })
    }

    /// Returns `true` if the node was a member of this graph as of the last
    /// commit.
    pub fn contains(&self, node: &Node) -> bool {
        self.0.registry.read().iter().any(|n| n.ptr_eq(node))
    }

    /// The nodes of this graph as of the last commit, in processing order.
    pub fn nodes(&self) -> Vec<Node> {
        self.0.registry.read().to_vec()
    }

    pub fn num_nodes(&self) -> usize {
        self.0.registry.read().len()
    }

    /// Create the render-side handle of this graph.
    ///
    /// Only one processor can exist per graph at a time. A new one can be
    /// created once the previous one has been dropped.
    pub fn processor(&self) -> Result<Processor, GraphError> {
        let mut control = self.0.control.lock();

        if control.processor_active() {
            return Err(StateError::ProcessorActive.into());
        }

        let (to_processor_tx, from_graph_rx) =
            rtrb::RingBuffer::<ContextToProcessorMsg>::new(CHANNEL_CAPACITY);
        let (to_graph_tx, from_processor_rx) =
            rtrb::RingBuffer::<ProcessorToContextMsg>::new(CHANNEL_CAPACITY);

        control.to_processor_tx = Some(to_processor_tx);
        control.from_processor_rx = Some(from_processor_rx);

        let arena = BufferArena::new(control.config.num_buffers, control.config.buffer_len);

        log::debug!(
            "created processor with {} buffers of {} frames",
            control.config.num_buffers,
            control.config.buffer_len
        );

        Ok(Processor::new(
            Arc::clone(&self.0),
            Box::new(arena),
            from_graph_rx,
            to_graph_tx,
        ))
    }

    /// Change the number of buffers in the arena.
    ///
    /// An active processor picks up the new arena at the start of its next
    /// tick.
    pub fn set_num_buffers(&self, num_buffers: usize) -> Result<(), GraphError> {
        let mut control = self.0.control.lock();
        let config = GraphConfig {
            num_buffers,
            ..control.config
        };
        Self::reconfigure(&mut control, config)
    }

    /// Change the length of each buffer in the arena.
    ///
    /// An active processor picks up the new arena at the start of its next
    /// tick.
    pub fn set_buffer_len(&self, buffer_len: usize) -> Result<(), GraphError> {
        let mut control = self.0.control.lock();
        let config = GraphConfig {
            buffer_len,
            ..control.config
        };
        Self::reconfigure(&mut control, config)
    }

    fn reconfigure(control: &mut ControlState, config: GraphConfig) -> Result<(), GraphError> {
        config.validate()?;

        if control.processor_active() {
            let arena = Box::new(BufferArena::new(config.num_buffers, config.buffer_len));

            if let Some(tx) = control.to_processor_tx.as_mut() {
                if let Err(PushError::Full(_)) = tx.push(ContextToProcessorMsg::NewArena(arena)) {
                    log::error!("Failed to send new buffer arena: message channel is full");
                    return Err(GraphError::MessageChannelFull);
                }
            }
        }

        log::debug!(
            "buffer arena reconfigured to {} buffers of {} frames",
            config.num_buffers,
            config.buffer_len
        );

        control.config = config;
        Ok(())
    }

    /// Free resources handed back by the processor.
    ///
    /// This should be called regularly on the control thread.
    pub fn update(&self) {
        let mut control = self.0.control.lock();

        let Some(rx) = control.from_processor_rx.as_mut() else {
            return;
        };

        let mut dropped = false;
        while let Ok(msg) = rx.pop() {
            match msg {
                ProcessorToContextMsg::ReturnArena(_arena) => {}
                ProcessorToContextMsg::Dropped(_arena) => {
                    dropped = true;
                }
            }
        }

        if dropped {
            log::debug!("processor dropped");
            control.to_processor_tx = None;
            control.from_processor_rx = None;
        }
    }
}

impl Node {
    /// Remove this node from the graph it is a member of.
    ///
    /// This fails if any of the node's ports still have edges.
    pub fn desync(&self, txn: Option<&mut Transaction>) -> Result<(), GraphError> {
        batch(txn, |txn| {
            let Some(graph) = self.graph_auth(txn) else {
                return Err(StateError::NotJoined(self.to_string()).into());
            };

            let edges = self.live_edges(txn);
            if edges > 0 {
                return Err(DependencyError::LiveEdges {
                    node: self.to_string(),
                    edges,
                }
                .into());
            }
            if !txn.mark_moved(self.id()) {
                return Err(StateError::MembershipChangedInBatch(self.to_string()).into());
            }

            graph.registry.with_mut(txn, |r| r.remove(self));
            self.0.state.with_mut(txn, |s| s.graph = None);

            Ok(())
        })
    }
}

/// Add an edge from `source` to `sink`.
///
/// The graphs of both nodes (if any) see the edge from the first tick after
/// the transaction commits.
pub fn attach(source: &Source, sink: &Sink, txn: Option<&mut Transaction>) -> Result<(), GraphError> {
    batch(txn, |txn| node::link(source, sink, txn))
}

/// Remove the edge from `source` to `sink`.
pub fn detach(source: &Source, sink: &Sink, txn: Option<&mut Transaction>) -> Result<(), GraphError> {
    batch(txn, |txn| node::unlink(source, sink, txn))
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("id", &self.id())
            .field("nodes", &self.nodes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn silent(inputs: usize, outputs: usize) -> Node {
        Node::new(inputs, outputs, |_: &mut [&mut [f32]], _: usize| {})
    }

    #[test]
    fn sync_and_desync() {
        let graph = Graph::new(GraphConfig::default()).unwrap();
        let node = silent(1, 1);

        graph.sync(&node, None).unwrap();
        assert!(node.is_synced());
        assert!(graph.contains(&node));
        assert_eq!(graph.num_nodes(), 1);

        assert!(matches!(
            graph.sync(&node, None),
            Err(GraphError::State(StateError::AlreadyJoined(_)))
        ));

        node.desync(None).unwrap();
        assert!(!node.is_synced());
        assert_eq!(graph.num_nodes(), 0);

        assert!(matches!(
            node.desync(None),
            Err(GraphError::State(StateError::NotJoined(_)))
        ));
    }

    #[test]
    fn a_node_joins_at_most_one_graph() {
        let a = Graph::new(GraphConfig::default()).unwrap();
        let b = Graph::new(GraphConfig::default()).unwrap();
        let node = silent(0, 1);

        a.sync(&node, None).unwrap();
        assert!(b.sync(&node, None).is_err());
        assert!(!b.contains(&node));
    }

    #[test]
    fn desync_with_live_edges_is_a_dependency_error() {
        let graph = Graph::new(GraphConfig::default()).unwrap();
        let a = silent(0, 1);
        let b = silent(1, 0);
        graph.sync(&a, None).unwrap();
        graph.sync(&b, None).unwrap();

        let src = a.source(0).unwrap();
        let snk = b.sink(0).unwrap();
        attach(&src, &snk, None).unwrap();

        assert!(matches!(
            b.desync(None),
            Err(GraphError::Dependency(DependencyError::LiveEdges { edges: 1, .. }))
        ));
        assert!(graph.contains(&b));

        detach(&src, &snk, None).unwrap();
        b.desync(None).unwrap();
        assert!(!graph.contains(&b));
        assert!(graph.contains(&a));
    }

    #[test]
    fn membership_changes_once_per_batch() {
        let graph = Graph::new(GraphConfig::default()).unwrap();
        let node = silent(0, 0);

        let mut txn = Transaction::begin();
        graph.sync(&node, Some(&mut txn)).unwrap();
        assert!(matches!(
            node.desync(Some(&mut txn)),
            Err(GraphError::State(StateError::MembershipChangedInBatch(_)))
        ));
        txn.commit();

        assert!(graph.contains(&node));
    }

    #[test]
    fn batched_changes_become_visible_together() {
        let graph = Graph::new(GraphConfig::default()).unwrap();
        let a = silent(0, 1);
        let b = silent(1, 0);

        let mut txn = Transaction::begin();
        graph.sync(&a, Some(&mut txn)).unwrap();
        graph.sync(&b, Some(&mut txn)).unwrap();
        attach(&a.source(0).unwrap(), &b.sink(0).unwrap(), Some(&mut txn)).unwrap();

        assert_eq!(graph.num_nodes(), 0);
        assert!(a.source(0).unwrap().sinks().is_empty());

        txn.commit();

        assert_eq!(graph.nodes(), vec![a.clone(), b.clone()]);
        assert_eq!(a.source(0).unwrap().sinks(), vec![b.sink(0).unwrap()]);
    }

    #[test]
    fn failed_implicit_operations_leave_no_trace() {
        let graph = Graph::new(GraphConfig::default()).unwrap();
        let a = silent(0, 1);
        let b = silent(1, 0);
        graph.sync(&a, None).unwrap();

        attach(&a.source(0).unwrap(), &b.sink(0).unwrap(), None).unwrap();
        assert!(attach(&a.source(0).unwrap(), &b.sink(0).unwrap(), None).is_err());

        assert_eq!(a.source(0).unwrap().sinks().len(), 1);
        assert_eq!(b.sink(0).unwrap().sources().len(), 1);
    }

    #[test]
    fn discarded_transactions_roll_back_membership() {
        let graph = Graph::new(GraphConfig::default()).unwrap();
        let node = silent(0, 0);

        let mut txn = Transaction::begin();
        graph.sync(&node, Some(&mut txn)).unwrap();
        txn.discard();

        assert!(!graph.contains(&node));
        assert!(!node.is_synced());
        graph.sync(&node, None).unwrap();
        assert!(graph.contains(&node));
    }

    #[test]
    fn registry_keeps_processing_order_on_removal() {
        let graph = Graph::new(GraphConfig::default()).unwrap();
        let nodes: Vec<Node> = (0..4).map(|_| silent(0, 0)).collect();
        for n in nodes.iter() {
            graph.sync(n, None).unwrap();
        }

        nodes[1].desync(None).unwrap();

        assert_eq!(
            graph.nodes(),
            vec![nodes[0].clone(), nodes[2].clone(), nodes[3].clone()]
        );

        let registry = graph.0.registry.read();
        for (i, n) in registry.iter().enumerate() {
            assert_eq!(
                n.0.position[registry.slot().index()].load(Ordering::Relaxed),
                i as u32
            );
        }
        assert_eq!(
            nodes[1].0.position[registry.slot().index()].load(Ordering::Relaxed),
            NO_POSITION
        );
    }

    #[test]
    fn only_one_processor_at_a_time() {
        let graph = Graph::new(GraphConfig::default()).unwrap();

        let processor = graph.processor().unwrap();
        assert!(matches!(
            graph.processor(),
            Err(GraphError::State(StateError::ProcessorActive))
        ));

        drop(processor);
        graph.update();
        assert!(graph.processor().is_ok());
    }

    #[test]
    fn reconfiguring_updates_the_config() {
        let graph = Graph::new(GraphConfig::default()).unwrap();

        graph.set_num_buffers(32).unwrap();
        graph.set_buffer_len(128).unwrap();

        let config = graph.config();
        assert_eq!(config.num_buffers, 32);
        assert_eq!(config.buffer_len, 128);
    }

    #[test]
    fn failed_operations_in_a_committed_batch_leave_no_trace() {
        let graph = Graph::new(GraphConfig::default()).unwrap();
        let a = silent(0, 1);
        let b = silent(1, 0);
        let c = silent(0, 1);
        for n in [&a, &b, &c] {
            graph.sync(n, None).unwrap();
        }
        attach(&a.source(0).unwrap(), &b.sink(0).unwrap(), None).unwrap();

        let mut txn = Transaction::begin();
        assert!(matches!(
            b.desync(Some(&mut txn)),
            Err(GraphError::Dependency(DependencyError::LiveEdges { .. }))
        ));
        assert!(matches!(
            attach(&a.source(0).unwrap(), &b.sink(0).unwrap(), Some(&mut txn)),
            Err(GraphError::Dependency(DependencyError::EdgeAlreadyExists(_)))
        ));
        assert!(matches!(
            detach(&c.source(0).unwrap(), &b.sink(0).unwrap(), Some(&mut txn)),
            Err(GraphError::Dependency(DependencyError::EdgeNotFound(_)))
        ));
        assert!(matches!(
            graph.sync(&a, Some(&mut txn)),
            Err(GraphError::State(StateError::AlreadyJoined(_)))
        ));

        // Every node locked while validating brings its graph along.
        assert!(txn.contains(graph.id()));
        txn.commit();

        assert_eq!(graph.nodes(), vec![a.clone(), b.clone(), c.clone()]);
        assert_eq!(a.source(0).unwrap().sinks(), vec![b.sink(0).unwrap()]);
        assert_eq!(b.sink(0).unwrap().sources(), vec![a.source(0).unwrap()]);
        assert!(c.source(0).unwrap().sinks().is_empty());
        assert!(b.is_synced());
    }

    #[test]
    fn locking_a_port_holds_its_graph() {
        let graph = Graph::new(GraphConfig::default()).unwrap();
        let node = silent(1, 1);
        graph.sync(&node, None).unwrap();

        let mut txn = Transaction::begin();
        node.sink(0).unwrap().port_auth(&mut txn).unwrap();
        assert!(txn.contains(graph.id()));
        txn.commit();

        let loose = silent(1, 0);
        let mut txn = Transaction::begin();
        loose.sink(0).unwrap().port_auth(&mut txn).unwrap();
        assert!(!txn.contains(graph.id()));
        assert_eq!(txn.len(), 1);
        txn.commit();
    }

    #[test]
    fn invalid_configs_are_rejected() {
        assert!(matches!(
            Graph::new(GraphConfig {
                num_buffers: 0,
                ..Default::default()
            }),
            Err(GraphError::State(StateError::InvalidConfig(_)))
        ));

        let graph = Graph::new(GraphConfig::default()).unwrap();
        assert!(matches!(
            graph.set_buffer_len(0),
            Err(GraphError::State(StateError::InvalidConfig(_)))
        ));
        assert!(graph.set_num_buffers(0).is_err());
        assert_eq!(graph.config(), GraphConfig::default());
    }
}
