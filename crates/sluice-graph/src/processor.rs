use std::sync::atomic::Ordering;
use std::sync::Arc;

use arrayvec::ArrayVec;
use sluice_core::{Slot, MAX_PORTS};

use crate::arena::{ArenaStats, BufferArena, BufferIdx};
use crate::graph::{GraphShared, Node, NodeInner, SourcePort, NO_POSITION};

/// The render-side handle of a graph.
///
/// Call [`Processor::process`] once per block on the realtime thread. It
/// never blocks on the control thread, and it does not allocate.
pub struct Processor {
    shared: Arc<GraphShared>,
    arena: Option<Box<BufferArena>>,

    from_graph_rx: rtrb::Consumer<ContextToProcessorMsg>,
    to_graph_tx: rtrb::Producer<ProcessorToContextMsg>,
}

impl Processor {
    pub(crate) fn new(
        shared: Arc<GraphShared>,
        arena: Box<BufferArena>,
        from_graph_rx: rtrb::Consumer<ContextToProcessorMsg>,
        to_graph_tx: rtrb::Producer<ProcessorToContextMsg>,
    ) -> Self {
        Self {
            shared,
            arena: Some(arena),
            from_graph_rx,
            to_graph_tx,
        }
    }

    /// Run one tick of the graph over `frames` frames.
    ///
    /// # Panics
    ///
    /// Panics if `frames` is greater than the configured buffer length, or
    /// if the graph needs more buffers at once than the arena holds (see
    /// [`ResourceFault`](crate::ResourceFault)).
    pub fn process(&mut self, frames: usize) {
        self.poll_messages();

        let Some(arena) = self.arena.as_deref_mut() else {
            return;
        };

        assert!(
            frames <= arena.buffer_len(),
            "cannot process {} frames with buffers of {} frames",
            frames,
            arena.buffer_len()
        );

        arena.reset();

        let nodes = self.shared.registry.read();

        let mut tick = Tick {
            nodes: &nodes,
            slot: nodes.slot(),
            arena,
            frames,
            queue_head: NO_POSITION,
            queue_tail: NO_POSITION,
        };
        tick.run();
    }

    /// Statistics about the arena as of the end of the last tick.
    pub fn arena_stats(&self) -> Option<ArenaStats> {
        self.arena.as_ref().map(|a| a.stats())
    }

    fn poll_messages(&mut self) {
        while let Ok(msg) = self.from_graph_rx.pop() {
            match msg {
                ContextToProcessorMsg::NewArena(new_arena) => {
                    if let Some(old_arena) = self.arena.replace(new_arena) {
                        // Make sure the old arena is not deallocated in the
                        // audio thread.
                        if let Err(e) = self
                            .to_graph_tx
                            .push(ProcessorToContextMsg::ReturnArena(old_arena))
                        {
                            let rtrb::PushError::Full(msg) = e;
                            std::mem::forget(msg);
                        }
                    }
                }
            }
        }
    }
}

impl Drop for Processor {
    fn drop(&mut self) {
        let _ = self
            .to_graph_tx
            .push(ProcessorToContextMsg::Dropped(self.arena.take()));
    }
}

pub(crate) enum ContextToProcessorMsg {
    NewArena(Box<BufferArena>),
}

pub(crate) enum ProcessorToContextMsg {
    ReturnArena(Box<BufferArena>),
    Dropped(Option<Box<BufferArena>>),
}

/// The state of one tick.
///
/// Nodes are fired by counting arrivals: a node fires once every one of its
/// inputs has received all of its edges for this tick. Nodes that become
/// ready while another node fires are put on an intrusive FIFO queue linked
/// through `NodeInner::queue_next`, addressed by position in `nodes`.
struct Tick<'a> {
    nodes: &'a [Node],
    slot: Slot,
    arena: &'a mut BufferArena,
    frames: usize,
    queue_head: u32,
    queue_tail: u32,
}

impl<'a> Tick<'a> {
    fn run(&mut self) {
        self.reset_counters();

        let nodes = self.nodes;
        for node in nodes.iter() {
            let node = &*node.0;
            // SAFETY: The node is in the snapshot of `slot`, which the
            // caller holds for the whole tick.
            let state = unsafe { node.state.get_unchecked(self.slot) };

            let mut arrivals = node.arrivals.load(Ordering::Relaxed);
            for port in state.sinks.iter() {
                if port.expected.load(Ordering::Relaxed) == 0 {
                    let buf = self.acquire();
                    self.arena.zero(buf, self.frames);
                    port.accum.store(buf.0, Ordering::Relaxed);
                    arrivals += 1;
                }
            }
            node.arrivals.store(arrivals, Ordering::Relaxed);

            if arrivals as usize == state.sinks.len() {
                self.fire(node);
            }

            while let Some(next) = self.pop() {
                self.fire(next);
            }
        }
    }

    /// Clear the arrival and fan-in counters of every node, and count the
    /// edges each input can expect from nodes that are processed in this
    /// tick.
    fn reset_counters(&mut self) {
        for node in self.nodes.iter() {
            let node = &*node.0;
            node.arrivals.store(0, Ordering::Relaxed);
            node.queue_next.store(NO_POSITION, Ordering::Relaxed);

            // SAFETY: See `run`.
            let state = unsafe { node.state.get_unchecked(self.slot) };
            for port in state.sinks.iter() {
                // SAFETY: Every batch that changes this port also holds the
                // graph, so the graph's read guard covers it.
                let sources = unsafe { port.sources.get_unchecked(self.slot) };
                let expected = sources
                    .iter()
                    .filter(|source| self.position_of(source.node()).is_some())
                    .count();

                port.fan_in.store(0, Ordering::Relaxed);
                port.expected.store(expected as u32, Ordering::Relaxed);
            }
        }
    }

    fn fire(&mut self, node: &'a NodeInner) {
        // SAFETY: See `run`.
        let state = unsafe { node.state.get_unchecked(self.slot) };
        let num_inputs = state.sinks.len();
        let num_outputs = state.sources.len();

        let mut working: ArrayVec<BufferIdx, MAX_PORTS> = ArrayVec::new();
        for i in 0..num_inputs.max(num_outputs) {
            let buf = if i < num_inputs {
                BufferIdx(state.sinks[i].accum.load(Ordering::Relaxed))
            } else {
                self.acquire()
            };
            if i < num_outputs {
                state.sources[i].buf.store(buf.0, Ordering::Relaxed);
            }
            working.push(buf);
        }

        {
            let mut buffers = self.arena.buffers_mut(&working, self.frames);
            // SAFETY: This is the only processor of the graph the node is a
            // member of, and the node is in the snapshot being processed.
            unsafe { node.process(&mut buffers, self.frames) };
        }

        node.arrivals.store(0, Ordering::Relaxed);

        for buf in working.iter().skip(num_outputs) {
            self.arena.release(*buf);
        }

        for (i, port) in state.sources.iter().enumerate() {
            self.propagate(port, working[i]);
        }
    }

    /// Hand the output in `buf` to every input connected to `port`.
    ///
    /// The first input that has not received anything yet this tick takes
    /// `buf` itself. Later ones that have not received anything get a copy,
    /// and inputs that already have a signal get `buf` added into it.
    fn propagate(&mut self, port: &'a SourcePort, buf: BufferIdx) {
        // SAFETY: See `reset_counters`.
        let sinks = unsafe { port.sinks.get_unchecked(self.slot) };

        let mut donated = false;
        for sink in sinks.iter() {
            let Some(position) = self.position_of(sink.node()) else {
                continue;
            };
            let target = &*sink.node().0;
            // SAFETY: See `run`.
            let target_state = unsafe { target.state.get_unchecked(self.slot) };
            let Some(sink_port) = target_state.sinks.get(sink.index()) else {
                continue;
            };

            let fan_in = sink_port.fan_in.load(Ordering::Relaxed);
            if fan_in == 0 {
                if donated {
                    let copy = self.acquire();
                    self.arena.copy(buf, copy, self.frames);
                    sink_port.accum.store(copy.0, Ordering::Relaxed);
                } else {
                    sink_port.accum.store(buf.0, Ordering::Relaxed);
                    donated = true;
                }
            } else {
                let accum = BufferIdx(sink_port.accum.load(Ordering::Relaxed));
                self.arena.accumulate(buf, accum, self.frames);
            }

            let fan_in = fan_in + 1;
            if fan_in < sink_port.expected.load(Ordering::Relaxed) {
                sink_port.fan_in.store(fan_in, Ordering::Relaxed);
                continue;
            }

            sink_port.fan_in.store(0, Ordering::Relaxed);
            let arrivals = target.arrivals.load(Ordering::Relaxed) + 1;
            target.arrivals.store(arrivals, Ordering::Relaxed);
            if arrivals as usize == target_state.sinks.len() {
                self.push(target, position);
            }
        }

        if !donated {
            self.arena.release(buf);
        }
    }

    /// The position of `node` in the snapshot, if it is a member of the
    /// graph being processed.
    fn position_of(&self, node: &Node) -> Option<u32> {
        let position = node.0.position[self.slot.index()].load(Ordering::Relaxed);
        match self.nodes.get(position as usize) {
            Some(n) if n.ptr_eq(node) => Some(position),
            _ => None,
        }
    }

    fn push(&mut self, node: &NodeInner, position: u32) {
        node.queue_next.store(NO_POSITION, Ordering::Relaxed);

        if self.queue_tail == NO_POSITION {
            self.queue_head = position;
        } else {
            self.nodes[self.queue_tail as usize]
                .0
                .queue_next
                .store(position, Ordering::Relaxed);
        }
        self.queue_tail = position;
    }

    fn pop(&mut self) -> Option<&'a NodeInner> {
        if self.queue_head == NO_POSITION {
            return None;
        }

        let node = &*self.nodes[self.queue_head as usize].0;
        self.queue_head = node.queue_next.load(Ordering::Relaxed);
        if self.queue_head == NO_POSITION {
            self.queue_tail = NO_POSITION;
        }
        Some(node)
    }

    fn acquire(&mut self) -> BufferIdx {
        match self.arena.acquire() {
            Ok(buf) => buf,
            Err(fault) => panic!("{}", fault),
        }
    }
}
