//! Scheduler - levelized task groups with completion-driven readiness.
//!
//! Topology entries are read as incoming dependencies: `B ∈ A.topology`
//! means A runs after B. Nodes are assigned a dependency depth
//! (`level(n) = 1 + max level of deps`, 0 for roots) and partitioned into
//! one task group per level; all members of a group are independent and
//! may execute concurrently.
//!
//! A pass runs a fixed pool of workers over two bounded queues:
//!
//! ```text
//! [Controller] --ready: group--> [Worker × W] --completed: node id--+
//!      ^                                                            |
//!      +------------------------------------------------------------+
//! ```
//!
//! Workers pull a group, run one subtask per member, then post each
//! member's completion. The controller drains completions and releases a
//! waiting group once every dependency of every member has completed,
//! at most one group per completion event. When nothing is left waiting
//! the ready queue closes and workers drain out.

use crossbeam_channel::bounded;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::{EngineError, Result};
use crate::model::Graph;

/// One dependency depth's worth of mutually-independent nodes, released
/// and executed as a unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskGroup {
    /// Dependency depth shared by every member.
    pub level: u32,
    /// Member node ids, in graph file order.
    pub members: Vec<u16>,
}

/// Pass lifecycle. Advances strictly forward:
/// Built → Running → Drained → Stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PassState {
    Built,
    Running,
    Drained,
    Stopped,
}

/// Dependency levels for every node id.
///
/// Iterative depth-first walk with an in-progress marker; revisiting an
/// in-progress node is a cycle.
///
/// # Errors
/// `GraphCyclic` naming a node on the cycle.
pub fn compute_levels(graph: &Graph) -> Result<FxHashMap<u16, u32>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    let mut marks: FxHashMap<u16, Mark> = graph
        .nodes()
        .iter()
        .map(|n| (n.id, Mark::Unvisited))
        .collect();
    let mut levels: FxHashMap<u16, u32> = FxHashMap::default();

    for root in graph.nodes() {
        if marks[&root.id] == Mark::Done {
            continue;
        }
        // (node id, next dependency index to visit)
        let mut stack: Vec<(u16, usize)> = vec![(root.id, 0)];
        marks.insert(root.id, Mark::InProgress);

        while let Some(&(id, next_dep)) = stack.last() {
            let deps = &graph
                .node_by_id(id)
                .expect("validated graph lost a node")
                .topology;

            if next_dep < deps.len() {
                let dep = deps[next_dep];
                if let Some(frame) = stack.last_mut() {
                    frame.1 += 1;
                }
                match marks[&dep] {
                    Mark::Done => {}
                    Mark::Unvisited => {
                        marks.insert(dep, Mark::InProgress);
                        stack.push((dep, 0));
                    }
                    Mark::InProgress => return Err(EngineError::GraphCyclic(dep)),
                }
            } else {
                let level = deps
                    .iter()
                    .map(|d| levels[d] + 1)
                    .max()
                    .unwrap_or(0);
                levels.insert(id, level);
                marks.insert(id, Mark::Done);
                stack.pop();
            }
        }
    }

    Ok(levels)
}

/// The execution planner and worker-pool driver.
pub struct Scheduler {
    /// id → incoming dependencies (sentinels already filtered by the graph).
    deps: FxHashMap<u16, Vec<u16>>,
    /// id → nodes that depend on it (reverse index for completion events).
    succs: FxHashMap<u16, Vec<u16>>,
    /// id → dependency depth.
    levels: FxHashMap<u16, u32>,
    /// Task groups in ascending level order.
    groups: Vec<TaskGroup>,
    /// id → index into `groups`.
    group_of: FxHashMap<u16, usize>,
    worker_count: usize,
    pin_workers: bool,
}

impl Scheduler {
    /// Build the dependency structure and level partition for a graph.
    ///
    /// # Errors
    /// `GraphCyclic` if the topology edges contain a cycle.
    pub fn new(graph: &Graph, worker_count: usize, pin_workers: bool) -> Result<Self> {
        assert!(worker_count >= 1, "worker_count must be at least 1");

        let levels = compute_levels(graph)?;

        let mut deps: FxHashMap<u16, Vec<u16>> = FxHashMap::default();
        let mut succs: FxHashMap<u16, Vec<u16>> = FxHashMap::default();
        for node in graph.nodes() {
            deps.insert(node.id, node.topology.clone());
            succs.entry(node.id).or_default();
            for &dep in &node.topology {
                succs.entry(dep).or_default().push(node.id);
            }
        }

        // Partition by level; file order keeps members deterministic.
        let max_level = levels.values().copied().max().unwrap_or(0);
        let mut groups: Vec<TaskGroup> = (0..=max_level)
            .map(|level| TaskGroup {
                level,
                members: Vec::new(),
            })
            .collect();
        for node in graph.nodes() {
            groups[levels[&node.id] as usize].members.push(node.id);
        }
        if graph.node_count() == 0 {
            groups.clear();
        }

        let mut group_of = FxHashMap::default();
        for (gi, group) in groups.iter().enumerate() {
            debug_assert!(!group.members.is_empty(), "level {} has no members", group.level);
            for &id in &group.members {
                group_of.insert(id, gi);
            }
        }

        log::debug!(
            "scheduler built: {} nodes in {} task groups, {} workers",
            graph.node_count(),
            groups.len(),
            worker_count
        );

        Ok(Self {
            deps,
            succs,
            levels,
            groups,
            group_of,
            worker_count,
            pin_workers,
        })
    }

    /// Configured worker count.
    #[inline]
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// A node's dependency depth.
    #[inline]
    pub fn level_of(&self, id: u16) -> Option<u32> {
        self.levels.get(&id).copied()
    }

    /// A node's incoming dependencies.
    #[inline]
    pub fn deps_of(&self, id: u16) -> &[u16] {
        self.deps.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// A node's dependents (reverse index).
    #[inline]
    pub fn succs_of(&self, id: u16) -> &[u16] {
        self.succs.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Task groups in ascending level order.
    #[inline]
    pub fn groups(&self) -> &[TaskGroup] {
        &self.groups
    }

    /// Node ids ordered by (level, file order) — the sequential oracle order.
    pub fn sequential_order(&self) -> Vec<u16> {
        let mut order = Vec::with_capacity(self.levels.len());
        for group in &self.groups {
            order.extend_from_slice(&group.members);
        }
        order
    }

    /// Run one pass: every node is handed to `exec` exactly once, after
    /// all of its dependencies' `exec` calls have returned.
    ///
    /// `exec` runs on worker threads; members of one group may run
    /// concurrently with no ordering between them.
    pub fn run_pass<F>(&self, exec: F) -> Result<()>
    where
        F: Fn(u16) + Sync,
    {
        let total: usize = self.groups.iter().map(|g| g.members.len()).sum();
        if total == 0 {
            return Ok(());
        }

        let mut state = PassState::Built;
        let mut waiting: FxHashSet<usize> = (0..self.groups.len()).collect();
        let mut done: FxHashSet<u16> = FxHashSet::default();

        let (ready_tx, ready_rx) = bounded::<usize>(self.groups.len());
        let (done_tx, done_rx) = bounded::<u16>(total);
        let mut ready_tx = Some(ready_tx);

        // Release every group whose members carry no dependencies. With
        // level-keyed groups that is exactly the level-0 group.
        let roots: Vec<usize> = waiting
            .iter()
            .copied()
            .filter(|&gi| {
                self.groups[gi]
                    .members
                    .iter()
                    .all(|id| self.deps_of(*id).is_empty())
            })
            .collect();
        for gi in roots {
            waiting.remove(&gi);
            if let Some(tx) = &ready_tx {
                tx.send(gi).expect("ready queue rejected initial group");
            }
        }
        state = PassState::Running;
        log::trace!("pass {:?}: released root groups", state);
        if waiting.is_empty() {
            // Single-level graph: nothing further to release.
            let _ = ready_tx.take();
            state = PassState::Drained;
            log::trace!("pass {:?}: no waiting groups after init", state);
        }

        std::thread::scope(|scope| {
            let groups = &self.groups;
            for w in 0..self.worker_count {
                let ready_rx = ready_rx.clone();
                let done_tx = done_tx.clone();
                let exec = &exec;
                let pin = self.pin_workers;
                scope.spawn(move || {
                    if pin {
                        if let Some(cores) = core_affinity::get_core_ids() {
                            if !cores.is_empty() {
                                core_affinity::set_for_current(cores[w % cores.len()]);
                            }
                        }
                    }
                    while let Ok(gi) = ready_rx.recv() {
                        let members = &groups[gi].members;
                        if let Some((&last, rest)) = members.split_last() {
                            // One subtask per member; the worker itself
                            // takes the final one.
                            std::thread::scope(|subtasks| {
                                for &id in rest {
                                    subtasks.spawn(move || exec(id));
                                }
                                exec(last);
                            });
                        }
                        for &id in members {
                            done_tx
                                .send(id)
                                .expect("completion queue closed mid-pass");
                        }
                    }
                });
            }
            drop(done_tx);
            drop(ready_rx);

            // Completion handler: one release per event keeps the waiting
            // scan free of concurrent-modification hazards.
            let mut completed = 0usize;
            while completed < total {
                let id = done_rx
                    .recv()
                    .expect("completion queue drained before all nodes finished");
                completed += 1;
                done.insert(id);

                if waiting.is_empty() {
                    continue;
                }

                // Only groups holding a dependent of `id` can have become
                // ready on this event.
                let mut candidates: Vec<usize> = self
                    .succs_of(id)
                    .iter()
                    .filter_map(|succ| self.group_of.get(succ).copied())
                    .filter(|gi| waiting.contains(gi))
                    .collect();
                candidates.sort_unstable();
                candidates.dedup();

                let released = candidates.into_iter().find(|&gi| {
                    self.groups[gi]
                        .members
                        .iter()
                        .all(|m| self.deps_of(*m).iter().all(|d| done.contains(d)))
                });
                if let Some(gi) = released {
                    waiting.remove(&gi);
                    if let Some(tx) = &ready_tx {
                        tx.send(gi).expect("ready queue rejected group");
                    }
                    if waiting.is_empty() {
                        let _ = ready_tx.take();
                        state = PassState::Drained;
                        log::trace!("pass {:?}: waiting drained, ready closed", state);
                    }
                }
            }

            // All completions observed; close ready if a degenerate plan
            // left it open (cannot happen for a validated DAG).
            let _ = ready_tx.take();
        });

        state = PassState::Stopped;
        log::trace!("pass {:?}: all workers joined", state);
        debug_assert_eq!(done.len(), total);
        Ok(())
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("nodes", &self.levels.len())
            .field("groups", &self.groups.len())
            .field("worker_count", &self.worker_count)
            .finish()
    }
}
