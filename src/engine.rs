//! Engine - top-level coordinator: load a model, lay out the arena,
//! bind node runtimes, and drive passes.
//!
//! One pass dispatches every node once, dependencies first. A node step
//! stages `prev` into `prop`, runs the opcode's kernel in place on
//! `prop`, then swaps the two so the fresh bytes become `prev`. The
//! non-streaming path runs nodes by ascending level on the calling
//! thread and is the ground-truth oracle for the level-parallel path.

use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;

use crate::align::{align_up, align_up_cache, CACHE_LINE};
use crate::arena::{Arena, ArenaShared, ArenaSizes};
use crate::error::{EngineError, Result};
use crate::kernel::KernelRegistry;
use crate::model::Graph;
use crate::scheduler::{compute_levels, Scheduler};
use crate::stats::{StatsInner, StatsSnapshot};

/// Scratch region size when the caller does not pick one.
pub const DEFAULT_SCRATCH_SIZE: usize = 64 * 1024;

/// StreamingInput window size when streaming is on and no size is given.
pub const DEFAULT_STREAMING_WINDOW: usize = 4096;

/// Engine construction options.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Scheduler worker threads. Must be at least 1.
    pub worker_count: usize,
    /// Total arena size in bytes; 0 selects the computed minimum.
    pub arena_size: usize,
    /// NodePayloads region size; 0 derives it from the graph (two
    /// cache-line-rounded buffers per node).
    pub node_payloads_size: usize,
    /// Scratch region size.
    pub scratch_size: usize,
    /// StreamingInput window size; 0 with `streaming` set picks
    /// [`DEFAULT_STREAMING_WINDOW`].
    pub streaming_input_size: usize,
    /// Maintain dispatch/latency counters.
    pub enable_stats: bool,
    /// Build the scheduler and run passes level-parallel.
    pub streaming: bool,
    /// Pin scheduler workers to cores.
    pub pin_workers: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            arena_size: 0,
            node_payloads_size: 0,
            scratch_size: DEFAULT_SCRATCH_SIZE,
            streaming_input_size: 0,
            enable_stats: true,
            streaming: false,
            pin_workers: false,
        }
    }
}

/// The dataflow execution engine.
pub struct Engine {
    graph: Graph,
    arena: Arena,
    registry: KernelRegistry,
    scheduler: Option<Scheduler>,
    /// Node indices sorted by (level, file order) - the sequential order.
    sequential: Vec<usize>,
    config: EngineConfig,
    stats: Mutex<StatsInner>,
}

impl Engine {
    /// Load a model file with default configuration and the reference
    /// kernel set.
    pub fn load(path: &Path) -> Result<Self> {
        Self::load_with(path, EngineConfig::default(), KernelRegistry::default())
    }

    /// Load a model file with explicit configuration and registry.
    pub fn load_with(path: &Path, config: EngineConfig, registry: KernelRegistry) -> Result<Self> {
        let graph = Graph::from_file(path)?;
        Self::from_graph(graph, config, registry)
    }

    /// Build an engine around an already-validated graph.
    ///
    /// Lays out the arena, binds every node's dual buffers, stages
    /// initial payload bytes into `prev`, and builds the scheduler when
    /// streaming is configured.
    ///
    /// # Panics
    /// Panics if `config.worker_count` is 0 (programmer error).
    pub fn from_graph(graph: Graph, config: EngineConfig, registry: KernelRegistry) -> Result<Self> {
        assert!(config.worker_count >= 1, "worker_count must be at least 1");

        // Per-node payload sizes: declared by offsets, else the registry
        // fallback for the opcode. Buffer lengths stay lane-safe
        // (multiple of 4); reservations are cache-line rounded.
        let payload_sizes: Vec<usize> = graph
            .nodes()
            .iter()
            .map(|node| {
                node.declared_size()
                    .unwrap_or_else(|| registry.default_size(node.opcode) as usize)
            })
            .collect();

        let node_payloads_size = if config.node_payloads_size > 0 {
            config.node_payloads_size
        } else {
            payload_sizes.iter().map(|&s| 2 * align_up_cache(s)).sum()
        };
        let streaming_input_size = match (config.streaming, config.streaming_input_size) {
            (true, 0) => DEFAULT_STREAMING_WINDOW,
            (_, size) => size,
        };

        let mut arena = Arena::new(
            graph.payload(),
            graph.node_count(),
            &ArenaSizes {
                total: config.arena_size,
                node_payloads: node_payloads_size,
                scratch: config.scratch_size,
                streaming_input: streaming_input_size,
            },
        )?;

        for (index, node) in graph.nodes().iter().enumerate() {
            let size = payload_sizes[index];
            let reserve = align_up_cache(size);
            let prev_off = arena.allocate_node_payload(reserve, CACHE_LINE)?;
            let prop_off = arena.allocate_node_payload(reserve, CACHE_LINE)?;
            let buffer_len = align_up(size, 4);

            arena.node_slot_mut(index).bind(
                node,
                prev_off as u32,
                prop_off as u32,
                buffer_len as u32,
            );

            // Stage the node's model bytes into the head of `prev`;
            // `prop` stays zero from the arena allocation.
            if let Some((lo, hi)) = node.payload_span() {
                if !graph.payload().is_empty() {
                    let n = (hi - lo).min(buffer_len);
                    let src = &graph.payload()[lo..lo + n];
                    arena.slice_mut(prev_off, n).copy_from_slice(src);
                }
            }
        }

        let levels = compute_levels(&graph)?;
        let mut sequential: Vec<usize> = (0..graph.node_count()).collect();
        sequential.sort_by_key(|&i| (levels[&graph.nodes()[i].id], i));

        let scheduler = if config.streaming {
            Some(Scheduler::new(
                &graph,
                config.worker_count,
                config.pin_workers,
            )?)
        } else {
            None
        };

        log::info!(
            "engine ready: {} nodes, arena {} bytes, streaming={}",
            graph.node_count(),
            arena.len(),
            config.streaming
        );

        Ok(Self {
            graph,
            arena,
            registry,
            scheduler,
            sequential,
            config,
            stats: Mutex::new(StatsInner::default()),
        })
    }

    /// Run one pass over the whole graph.
    ///
    /// Streaming engines run level-parallel through the scheduler;
    /// otherwise nodes run sequentially by ascending level on the
    /// calling thread.
    pub fn execute(&mut self) -> Result<()> {
        self.arena.reset_scratch();
        let started = Instant::now();
        let stats = self.config.enable_stats.then_some(&self.stats);

        if self.config.streaming {
            let scheduler = self
                .scheduler
                .as_ref()
                .ok_or(EngineError::SchedulerNotInitialized)?;
            let shared = self.arena.shared();
            let graph = &self.graph;
            let registry = &self.registry;
            scheduler.run_pass(|id| {
                let index = graph.index_of(id).expect("scheduled an unknown node id");
                // SAFETY: the scheduler hands each node to exactly one
                // subtask per pass, and only after its dependencies
                // completed; spans touched here are disjoint per node.
                unsafe { dispatch_node(&shared, index, registry, stats) };
            })?;
        } else {
            let shared = self.arena.shared();
            for &index in &self.sequential {
                // SAFETY: sequential path; one node at a time on this
                // thread, no other arena access alive.
                unsafe { dispatch_node(&shared, index, &self.registry, stats) };
            }
        }

        if let Some(stats) = stats {
            stats
                .lock()
                .expect("stats lock poisoned")
                .record_pass(started.elapsed());
        }
        Ok(())
    }

    /// Stamp `input` into the streaming window, run one pass, and copy
    /// up to `output.len()` bytes of node 0's `prop` buffer out.
    ///
    /// # Returns
    /// The number of bytes copied into `output`.
    ///
    /// # Errors
    /// `StreamingNotConfigured` on a non-streaming engine;
    /// `StreamingOverflow` (before any node state changes) when `input`
    /// exceeds the window.
    pub fn execute_streaming(&mut self, input: &[u8], output: &mut [u8]) -> Result<usize> {
        if !self.config.streaming {
            return Err(EngineError::StreamingNotConfigured);
        }
        self.arena.write_streaming_input(input)?;
        self.execute()?;

        if self.graph.node_count() == 0 {
            return Ok(0);
        }
        let index = self.graph.index_of(0).unwrap_or(0);
        let (off, len) = self.arena.node_slot(index).prop_span();
        let n = len.min(output.len());
        output[..n].copy_from_slice(self.arena.slice(off, n));
        Ok(n)
    }

    /// Counter snapshot as of the last pass.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats
            .lock()
            .expect("stats lock poisoned")
            .snapshot(self.arena.utilization())
    }

    /// Zero all counters.
    pub fn reset_stats(&self) {
        self.stats.lock().expect("stats lock poisoned").reset();
    }

    /// Read-only view of the loaded graph.
    #[inline]
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// The engine's configuration.
    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The kernel registry (read-only during execution).
    #[inline]
    pub fn registry(&self) -> &KernelRegistry {
        &self.registry
    }

    /// Mutable registry access for setup between passes.
    #[inline]
    pub fn registry_mut(&mut self) -> &mut KernelRegistry {
        &mut self.registry
    }

    /// The scheduler, when streaming is configured.
    #[inline]
    pub fn scheduler(&self) -> Option<&Scheduler> {
        self.scheduler.as_ref()
    }

    /// Arena introspection.
    #[inline]
    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    /// The `prev` buffer of the node at file position `index` (the last
    /// completed output).
    pub fn node_prev(&self, index: usize) -> &[u8] {
        let (off, len) = self.arena.node_slot(index).prev_span();
        self.arena.slice(off, len)
    }

    /// The `prop` buffer of the node at file position `index`.
    pub fn node_prop(&self, index: usize) -> &[u8] {
        let (off, len) = self.arena.node_slot(index).prop_span();
        self.arena.slice(off, len)
    }

    /// Pre-fault the arena before the first pass.
    pub fn warm_up(&mut self) {
        self.arena.warm_up();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("nodes", &self.graph.node_count())
            .field("arena_len", &self.arena.len())
            .field("streaming", &self.config.streaming)
            .finish()
    }
}

/// One node step: stage `prev` into `prop`, run the kernel in place,
/// swap. Read-only nodes skip the kernel but still stage and swap.
///
/// # Safety
/// The caller must guarantee exclusive access to this node's slot and
/// both of its buffers for the duration of the call (one subtask per
/// node, dependencies completed - the scheduler's ordering contract).
unsafe fn dispatch_node(
    arena: &ArenaShared,
    index: usize,
    registry: &KernelRegistry,
    stats: Option<&Mutex<StatsInner>>,
) {
    let slot = arena.slot_mut(index);
    let kernel = registry.lookup(slot.opcode);

    let (prev_off, len) = slot.prev_span();
    let (prop_off, _) = slot.prop_span();
    if len > 0 {
        // Disjoint spans: the two buffers come from separate
        // reservations in NodePayloads.
        let prop = arena.slice_mut(prop_off, len);
        let prev = arena.slice_mut(prev_off, len);
        prop.copy_from_slice(prev);
        if !slot.is_read_only() {
            if let Some(kernel) = kernel {
                kernel(prop);
            }
        }
    }
    slot.swap_buffers();

    if let Some(stats) = stats {
        stats
            .lock()
            .expect("stats lock poisoned")
            .record_dispatch(slot.opcode, kernel.is_some());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::opcode;
    use crate::model::Node;

    fn f32_lane(buf: &[u8], lane: usize) -> f32 {
        let i = lane * 4;
        f32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]])
    }

    fn engine_with(nodes: Vec<Node>, payload: Vec<u8>, config: EngineConfig) -> Engine {
        let graph = Graph::new(nodes, payload).unwrap();
        Engine::from_graph(graph, config, KernelRegistry::default()).unwrap()
    }

    #[test]
    fn test_init_stages_payload_into_prev() {
        let engine = engine_with(
            vec![Node::new(0, opcode::NOP, 0, 16, 0)],
            vec![0xAA; 16],
            EngineConfig::default(),
        );
        assert_eq!(engine.node_prev(0), &[0xAA; 16][..]);
        assert!(engine.node_prop(0).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_fallback_size_comes_from_registry() {
        let mut registry = KernelRegistry::default();
        registry.set_default_size(opcode::NOP, 64);
        let graph = Graph::new(
            vec![Node::new(0, opcode::NOP, 0, 0, 0)],
            Vec::new(),
        )
        .unwrap();
        let engine = Engine::from_graph(graph, EngineConfig::default(), registry).unwrap();
        assert_eq!(engine.node_prev(0).len(), 64);
    }

    #[test]
    fn test_execute_swaps_kernel_output_into_prev() {
        let mut payload = Vec::new();
        for x in [-2.0f32, 3.0, -1.0, 4.0] {
            payload.extend_from_slice(&x.to_le_bytes());
        }
        let mut engine = engine_with(
            vec![Node::new(0, opcode::RELU, 0, 16, 0)],
            payload,
            EngineConfig::default(),
        );
        engine.execute().unwrap();

        let prev = engine.node_prev(0);
        assert_eq!(f32_lane(prev, 0), 0.0);
        assert_eq!(f32_lane(prev, 1), 3.0);
        assert_eq!(f32_lane(prev, 2), 0.0);
        assert_eq!(f32_lane(prev, 3), 4.0);
        // Post-swap, prop holds the pass input image.
        assert_eq!(f32_lane(engine.node_prop(0), 0), -2.0);
    }

    #[test]
    fn test_read_only_node_keeps_bytes() {
        let mut engine = engine_with(
            vec![Node::new(
                0,
                opcode::RELU,
                0,
                8,
                crate::model::node_flags::READ_ONLY,
            )],
            (-1.0f32)
                .to_le_bytes()
                .iter()
                .chain((-2.0f32).to_le_bytes().iter())
                .copied()
                .collect(),
            EngineConfig::default(),
        );
        engine.execute().unwrap();
        let prev = engine.node_prev(0);
        assert_eq!(f32_lane(prev, 0), -1.0);
        assert_eq!(f32_lane(prev, 1), -2.0);
    }

    #[test]
    fn test_unknown_opcode_noops_and_counts() {
        let mut engine = engine_with(
            vec![Node::new(0, 0xEE, 0, 8, 0)],
            vec![0x11; 8],
            EngineConfig::default(),
        );
        engine.execute().unwrap();
        assert_eq!(engine.node_prev(0), &[0x11; 8][..]);

        let stats = engine.stats();
        assert_eq!(stats.unknown_opcodes, 1);
        assert_eq!(stats.per_opcode_count[&0xEE], 1);
    }

    #[test]
    fn test_stats_accumulate_across_passes() {
        let mut engine = engine_with(
            vec![Node::new(0, opcode::NOP, 0, 8, 0)],
            vec![0; 8],
            EngineConfig::default(),
        );
        engine.execute().unwrap();
        engine.execute().unwrap();
        engine.execute().unwrap();

        let stats = engine.stats();
        assert_eq!(stats.total_passes, 3);
        assert_eq!(stats.per_opcode_count[&opcode::NOP], 3);
        assert!(stats.arena_utilization > 0.0);

        engine.reset_stats();
        assert_eq!(engine.stats().total_passes, 0);
    }

    #[test]
    fn test_stats_disabled() {
        let mut engine = engine_with(
            vec![Node::new(0, opcode::NOP, 0, 8, 0)],
            vec![0; 8],
            EngineConfig {
                enable_stats: false,
                ..Default::default()
            },
        );
        engine.execute().unwrap();
        assert_eq!(engine.stats().total_passes, 0);
        assert!(engine.stats().per_opcode_count.is_empty());
    }

    #[test]
    fn test_streaming_not_configured() {
        let mut engine = engine_with(
            vec![Node::new(0, opcode::NOP, 0, 8, 0)],
            vec![0; 8],
            EngineConfig::default(),
        );
        let err = engine.execute_streaming(&[0; 4], &mut [0; 4]).unwrap_err();
        assert!(matches!(err, EngineError::StreamingNotConfigured));
    }

    #[test]
    fn test_streaming_pass_returns_node0_prop() {
        let mut engine = engine_with(
            vec![Node::new(0, opcode::NOP, 0, 8, 0)],
            vec![0xCD; 8],
            EngineConfig {
                streaming: true,
                worker_count: 2,
                streaming_input_size: 32,
                ..Default::default()
            },
        );
        let mut out = [0u8; 8];
        let copied = engine.execute_streaming(&[1, 2, 3], &mut out).unwrap();
        assert_eq!(copied, 8);
        // Post-swap prop carries the pass input image: the staged payload.
        assert_eq!(out, [0xCD; 8]);
    }

    #[test]
    fn test_payloads_exhausted_at_init() {
        let nodes: Vec<Node> = (0..10u16)
            .map(|id| Node::new(id, opcode::NOP, 0, 128, 0))
            .collect();
        let graph = Graph::new(nodes, vec![0; 128]).unwrap();
        let err = Engine::from_graph(
            graph,
            EngineConfig {
                node_payloads_size: 256,
                ..Default::default()
            },
            KernelRegistry::default(),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::NodePayloadsExhausted { .. }));
    }

    #[test]
    fn test_sequential_order_is_levelized() {
        // File order deliberately lists the dependent first.
        let nodes = vec![
            Node::with_deps(5, opcode::NOP, 0, 8, 0, &[9]),
            Node::new(9, opcode::NOP, 8, 16, 0),
        ];
        let engine = engine_with(nodes, vec![0; 16], EngineConfig::default());
        assert_eq!(engine.sequential, vec![1, 0]);
    }
}
