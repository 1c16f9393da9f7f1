//! Determinism tests - golden master verification.
//!
//! The sequential path must be byte-reproducible across runs, and the
//! level-parallel scheduler must match it exactly for any worker count,
//! since every reference kernel is a pure function of its own buffers.

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use strata_flow::kernel::opcode;
use strata_flow::{Engine, EngineConfig, Graph, KernelRegistry, Node};

/// Opcodes that only touch their own buffer (safe under any interleaving
/// within a task group).
const PURE_OPCODES: [u8; 11] = [
    opcode::NOP,
    opcode::SQUARE_PLUS,
    opcode::RELU,
    opcode::SIGMOID,
    opcode::TANH,
    opcode::ADD,
    opcode::MUL,
    opcode::SUM_REDUCE,
    opcode::MAX_REDUCE,
    opcode::SOFTMAX,
    opcode::BATCH_NORM,
];

/// Generate a random layered DAG with well-formed f32 payloads.
fn generate_graph(seed: u64, node_count: u16) -> Graph {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let stride = 32u16; // 8 lanes per node

    let mut payload = Vec::with_capacity(node_count as usize * stride as usize);
    for _ in 0..node_count as usize * (stride as usize / 4) {
        let x: f32 = rng.gen_range(-10.0..10.0);
        payload.extend_from_slice(&x.to_le_bytes());
    }

    let mut nodes = Vec::with_capacity(node_count as usize);
    for id in 0..node_count {
        let mut deps: Vec<u16> = Vec::new();
        if id > 0 {
            for _ in 0..rng.gen_range(0..=3usize) {
                let candidate = rng.gen_range(0..id);
                if !deps.contains(&candidate) {
                    deps.push(candidate);
                }
            }
        }
        nodes.push(Node::with_deps(
            id,
            PURE_OPCODES[rng.gen_range(0..PURE_OPCODES.len())],
            id * stride,
            (id + 1) * stride,
            0,
            &deps,
        ));
    }
    Graph::new(nodes, payload).unwrap()
}

/// Hash every node's `prev` buffer after `passes` executions.
fn run_and_hash(graph: &Graph, config: EngineConfig, passes: usize) -> u64 {
    let mut engine = Engine::from_graph(
        graph.clone(),
        config,
        KernelRegistry::with_reference_kernels(),
    )
    .unwrap();
    for _ in 0..passes {
        engine.execute().unwrap();
    }

    let mut hasher = DefaultHasher::new();
    for index in 0..graph.node_count() {
        engine.node_prev(index).hash(&mut hasher);
    }
    hasher.finish()
}

fn sequential() -> EngineConfig {
    EngineConfig::default()
}

fn parallel(workers: usize) -> EngineConfig {
    EngineConfig {
        streaming: true,
        worker_count: workers,
        ..Default::default()
    }
}

#[test]
fn test_sequential_determinism() {
    const SEED: u64 = 0xDEADBEEF;
    const RUNS: usize = 5;

    let graph = generate_graph(SEED, 40);
    let first = run_and_hash(&graph, sequential(), 3);
    for run in 1..RUNS {
        let hash = run_and_hash(&graph, sequential(), 3);
        assert_eq!(hash, first, "state hash mismatch on run {run}");
    }
}

#[test]
fn test_parallel_matches_sequential() {
    for seed in [1u64, 0xCAFEBABE, 42] {
        let graph = generate_graph(seed, 40);
        let oracle = run_and_hash(&graph, sequential(), 3);
        for workers in [1, 2, 4] {
            let hash = run_and_hash(&graph, parallel(workers), 3);
            assert_eq!(
                hash, oracle,
                "seed {seed:#x}: {workers}-worker pass diverged from sequential"
            );
        }
    }
}

#[test]
fn test_parallel_matches_sequential_large() {
    let graph = generate_graph(0x5EED, 200);
    let oracle = run_and_hash(&graph, sequential(), 5);
    let hash = run_and_hash(&graph, parallel(4), 5);
    assert_eq!(hash, oracle);
}

#[test]
fn test_parallel_determinism_across_runs() {
    let graph = generate_graph(7, 60);
    let first = run_and_hash(&graph, parallel(4), 3);
    for run in 1..5 {
        let hash = run_and_hash(&graph, parallel(4), 3);
        assert_eq!(hash, first, "parallel hash mismatch on run {run}");
    }
}

#[test]
fn test_different_seeds_produce_different_results() {
    let a = run_and_hash(&generate_graph(1, 40), sequential(), 2);
    let b = run_and_hash(&generate_graph(2, 40), sequential(), 2);
    assert_ne!(a, b, "different seeds should produce different buffers");
}

#[test]
fn test_passes_advance_state() {
    // square_plus diverges lane values pass over pass.
    let nodes = vec![Node::new(0, opcode::SQUARE_PLUS, 0, 8, 0)];
    let mut payload = Vec::new();
    for x in [0.5f32, 1.5] {
        payload.extend_from_slice(&x.to_le_bytes());
    }
    let graph = Graph::new(nodes, payload).unwrap();

    let one = run_and_hash(&graph, sequential(), 1);
    let two = run_and_hash(&graph, sequential(), 2);
    assert_ne!(one, two);
}
