//! # Strata-Flow
//!
//! A static-graph, in-place dataflow execution engine.
//!
//! ## Design Principles
//!
//! - **Load Once**: models are immutable binaries; no graph mutation after load
//! - **Arena Allocation**: every runtime buffer comes from one pre-sized,
//!   cache-line-aligned arena; no heap allocation in the dispatch path
//! - **Dual Buffers**: each node ping-pongs a `prev`/`prop` pair, swapped
//!   after every kernel call
//! - **Levelized Scheduling**: nodes partition into per-depth task groups;
//!   completion events release the next group to a fixed worker pool
//!
//! ## Architecture
//!
//! ```text
//! [Model File] --> [Graph] --> [Engine.init]
//!                                  |
//!                    [Arena: payload | slots | buffers | scratch | window]
//!                                  |
//!            [Scheduler] --ready--> [Workers] --completed--> [Scheduler]
//! ```

pub mod align;
pub mod arena;
pub mod engine;
pub mod error;
pub mod kernel;
pub mod model;
pub mod node;
pub mod scheduler;
pub mod stats;

// Re-exports for convenience
pub use arena::{Arena, ArenaSizes, Region};
pub use engine::{Engine, EngineConfig};
pub use error::{EngineError, Result};
pub use kernel::{Kernel, KernelRegistry};
pub use model::{Graph, ModelVariant, Node};
pub use node::NodeRuntime;
pub use scheduler::{Scheduler, TaskGroup};
pub use stats::StatsSnapshot;
