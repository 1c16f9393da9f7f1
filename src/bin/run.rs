//! strata-run - load a model file and drive execution passes.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use strata_flow::{Engine, EngineConfig, KernelRegistry};

#[derive(Parser, Debug)]
#[command(name = "strata-run", about = "Run passes over a strata-flow model")]
struct Args {
    /// Model file (simple or optimized variant, auto-detected)
    model: PathBuf,

    /// Number of passes to execute
    #[arg(short, long, default_value_t = 1)]
    passes: u64,

    /// Scheduler worker threads (defaults to host concurrency)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Run level-parallel in streaming mode
    #[arg(short, long)]
    streaming: bool,

    /// Total arena size in bytes (0 = auto)
    #[arg(long, default_value_t = 0)]
    arena_size: usize,

    /// Pin workers to CPU cores
    #[arg(long)]
    pin: bool,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let mut config = EngineConfig {
        arena_size: args.arena_size,
        streaming: args.streaming,
        pin_workers: args.pin,
        ..Default::default()
    };
    if let Some(workers) = args.workers {
        config.worker_count = workers.max(1);
    }

    let mut engine =
        match Engine::load_with(&args.model, config, KernelRegistry::with_reference_kernels()) {
            Ok(engine) => engine,
            Err(err) => {
                eprintln!("failed to load {}: {err}", args.model.display());
                return ExitCode::FAILURE;
            }
        };

    engine.warm_up();
    println!(
        "Loaded {} ({} nodes, arena {} bytes)",
        args.model.display(),
        engine.graph().node_count(),
        engine.arena().len()
    );

    for pass in 0..args.passes {
        if let Err(err) = engine.execute() {
            eprintln!("pass {pass} failed: {err}");
            return ExitCode::FAILURE;
        }
    }

    let stats = engine.stats();
    println!("\n=== Execution Report ===");
    println!("Passes:      {}", stats.total_passes);
    println!("Avg latency: {:?}", stats.average_latency);
    println!("Arena usage: {:.1}%", stats.arena_utilization * 100.0);
    if stats.unknown_opcodes > 0 {
        println!("Unknown-opcode dispatches: {}", stats.unknown_opcodes);
    }
    println!("------------------------");
    let mut opcodes: Vec<_> = stats.per_opcode_count.iter().collect();
    opcodes.sort();
    for (op, count) in opcodes {
        println!("  opcode {op:#04x}: {count:8} dispatches");
    }

    ExitCode::SUCCESS
}
