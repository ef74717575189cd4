//! Dependency graph over tasks and post-build triggering.
//!
//! The graph is rebuilt wholesale from declared relations and swapped
//! in atomically; readers always see a complete snapshot. Cycles are
//! tolerated: the topological order breaks them deterministically so
//! a stable total order exists even for cyclic graphs.

use crate::queue::Queue;
use crucible_core::actions::{Action, Cause};
use crucible_core::build::CompletedBuild;
use crucible_core::ids::TaskId;
use crucible_core::task::Task;
use crucible_core::Result;
use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info};

/// A directed, evaluator-guarded edge between two tasks.
#[derive(Clone)]
pub struct Dependency {
    pub upstream: TaskId,
    pub downstream: TaskId,
    pub evaluator: Arc<dyn DependencyEvaluator>,
}

impl Dependency {
    /// Edge with the default evaluator: trigger when the upstream
    /// build succeeded.
    pub fn new(upstream: TaskId, downstream: TaskId) -> Self {
        Self {
            upstream,
            downstream,
            evaluator: Arc::new(TriggerOnSuccess),
        }
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn DependencyEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }
}

impl std::fmt::Debug for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.upstream, self.downstream)
    }
}

/// Consulted once per completed upstream build. May append actions to
/// the downstream schedule request.
pub trait DependencyEvaluator: Send + Sync {
    fn should_trigger(&self, build: &CompletedBuild, actions: &mut Vec<Action>) -> Result<bool>;
}

/// Default evaluator: trigger iff the upstream build succeeded.
pub struct TriggerOnSuccess;

impl DependencyEvaluator for TriggerOnSuccess {
    fn should_trigger(&self, build: &CompletedBuild, _actions: &mut Vec<Action>) -> Result<bool> {
        Ok(build.outcome.is_success())
    }
}

/// Declares dependency edges for a task. Implementations are iterated
/// in registration order during a rebuild.
pub trait DependencyDeclarer: Send + Sync {
    fn declare(&self, task: &Arc<dyn Task>, all: &[Arc<dyn Task>]) -> Vec<Dependency>;
}

/// Immutable dependency-graph snapshot.
pub struct DependencyGraph {
    tasks: HashMap<TaskId, Arc<dyn Task>>,
    graph: DiGraph<TaskId, ()>,
    index: HashMap<TaskId, NodeIndex>,
    by_upstream: HashMap<TaskId, Vec<Dependency>>,
    by_downstream: HashMap<TaskId, Vec<Dependency>>,
    topo: Vec<TaskId>,
    topo_index: HashMap<TaskId, usize>,
}

impl DependencyGraph {
    /// Graph with no tasks; the initial snapshot of a fresh queue.
    pub fn empty() -> Arc<Self> {
        Self::build(&[], &[])
    }

    /// Build a fresh snapshot from all tasks' declared relations.
    /// Edges naming unknown tasks are dropped.
    pub fn build(
        tasks: &[Arc<dyn Task>],
        declarers: &[Arc<dyn DependencyDeclarer>],
    ) -> Arc<Self> {
        let mut task_map = HashMap::new();
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();

        for task in tasks {
            let id = task.id();
            if task_map.insert(id.clone(), task.clone()).is_none() {
                let idx = graph.add_node(id.clone());
                index.insert(id, idx);
            }
        }

        let mut by_upstream: HashMap<TaskId, Vec<Dependency>> = HashMap::new();
        let mut by_downstream: HashMap<TaskId, Vec<Dependency>> = HashMap::new();

        for declarer in declarers {
            for task in tasks {
                for dep in declarer.declare(task, tasks) {
                    let (Some(&up), Some(&down)) =
                        (index.get(&dep.upstream), index.get(&dep.downstream))
                    else {
                        debug!(dependency = ?dep, "dropping edge naming unknown task");
                        continue;
                    };
                    graph.update_edge(up, down, ());
                    by_upstream
                        .entry(dep.upstream.clone())
                        .or_default()
                        .push(dep.clone());
                    by_downstream
                        .entry(dep.downstream.clone())
                        .or_default()
                        .push(dep);
                }
            }
        }

        let topo = cycle_tolerant_topo_sort(&graph, &index);
        let topo_index = topo
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();

        info!(
            tasks = tasks.len(),
            edges = graph.edge_count(),
            "dependency graph rebuilt"
        );

        Arc::new(Self {
            tasks: task_map,
            graph,
            index,
            by_upstream,
            by_downstream,
            topo,
            topo_index,
        })
    }

    pub fn task(&self, id: &TaskId) -> Option<Arc<dyn Task>> {
        self.tasks.get(id).cloned()
    }

    /// Direct downstream neighbors.
    pub fn downstream(&self, task: &TaskId) -> Vec<TaskId> {
        self.neighbors(task, Direction::Outgoing)
    }

    /// Direct upstream neighbors.
    pub fn upstream(&self, task: &TaskId) -> Vec<TaskId> {
        self.neighbors(task, Direction::Incoming)
    }

    fn neighbors(&self, task: &TaskId, direction: Direction) -> Vec<TaskId> {
        self.index
            .get(task)
            .map(|&idx| {
                self.graph
                    .neighbors_directed(idx, direction)
                    .map(|n| self.graph[n].clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every task reachable by walking upstream edges, excluding
    /// `task` itself. Sorted for deterministic iteration.
    pub fn transitive_upstream(&self, task: &TaskId) -> BTreeSet<TaskId> {
        self.transitive(task, Direction::Incoming)
    }

    /// Every task reachable by walking downstream edges, excluding
    /// `task` itself.
    pub fn transitive_downstream(&self, task: &TaskId) -> BTreeSet<TaskId> {
        self.transitive(task, Direction::Outgoing)
    }

    fn transitive(&self, task: &TaskId, direction: Direction) -> BTreeSet<TaskId> {
        let mut out = BTreeSet::new();
        let Some(&start) = self.index.get(task) else {
            return out;
        };
        let mut stack = vec![start];
        let mut seen = vec![start];
        while let Some(idx) = stack.pop() {
            for next in self.graph.neighbors_directed(idx, direction) {
                if !seen.contains(&next) {
                    seen.push(next);
                    stack.push(next);
                    out.insert(self.graph[next].clone());
                }
            }
        }
        out.remove(task);
        out
    }

    /// All tasks, upstream-before-downstream for every acyclic pair.
    pub fn topological_order(&self) -> &[TaskId] {
        &self.topo
    }

    /// Total order consistent with reachability: `Less` when `a` can
    /// reach `b` and `b` cannot reach `a`; topological position
    /// otherwise (including mutually-reachable cycle members).
    pub fn compare(&self, a: &TaskId, b: &TaskId) -> Ordering {
        if a == b {
            return Ordering::Equal;
        }
        let (Some(&ia), Some(&ib)) = (self.index.get(a), self.index.get(b)) else {
            return a.cmp(b);
        };
        let a_reaches_b = has_path_connecting(&self.graph, ia, ib, None);
        let b_reaches_a = has_path_connecting(&self.graph, ib, ia, None);
        match (a_reaches_b, b_reaches_a) {
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            _ => self.topo_index[a].cmp(&self.topo_index[b]),
        }
    }

    /// React to a completed build: consult every dependency whose
    /// upstream is the finished task and schedule the downstream ones
    /// that should trigger. Each edge is evaluated independently; an
    /// evaluator failure never prevents evaluating the others.
    pub async fn on_build_completed(&self, build: &CompletedBuild, queue: &Queue) {
        let Some(deps) = self.by_upstream.get(&build.task) else {
            return;
        };

        for dep in deps {
            let Some(downstream) = self.task(&dep.downstream) else {
                continue;
            };
            let mut actions = Vec::new();
            match dep.evaluator.should_trigger(build, &mut actions) {
                Ok(true) => {
                    info!(
                        upstream = %build.task,
                        downstream = %dep.downstream,
                        "triggering downstream build"
                    );
                    queue
                        .schedule(
                            downstream,
                            None,
                            actions,
                            vec![Cause::Upstream {
                                task: build.task.clone(),
                                build: build.id,
                            }],
                        )
                        .await;
                }
                Ok(false) => {}
                Err(e) => {
                    error!(
                        upstream = %build.task,
                        downstream = %dep.downstream,
                        error = %e,
                        "dependency evaluator failed"
                    );
                }
            }
        }
    }

    /// Dependencies pointing at the given downstream task.
    pub fn dependencies_of(&self, downstream: &TaskId) -> &[Dependency] {
        self.by_downstream
            .get(downstream)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Kahn-style peel that tolerates cycles: zero-in-degree nodes are
/// emitted smallest-id-first; when none remains but nodes do, the
/// remaining node with the smallest id is emitted anyway, breaking
/// the cycle.
fn cycle_tolerant_topo_sort(
    graph: &DiGraph<TaskId, ()>,
    index: &HashMap<TaskId, NodeIndex>,
) -> Vec<TaskId> {
    let mut in_degree: BTreeMap<TaskId, usize> = BTreeMap::new();
    for (id, &idx) in index {
        in_degree.insert(
            id.clone(),
            graph.neighbors_directed(idx, Direction::Incoming).count(),
        );
    }

    let mut order = Vec::with_capacity(in_degree.len());
    while !in_degree.is_empty() {
        let next = in_degree
            .iter()
            .find(|&(_, &deg)| deg == 0)
            .or_else(|| in_degree.iter().next())
            .map(|(id, _)| id.clone())
            .expect("non-empty map");

        in_degree.remove(&next);
        order.push(next.clone());

        let idx = index[&next];
        for succ in graph.neighbors_directed(idx, Direction::Outgoing) {
            if let Some(deg) = in_degree.get_mut(&graph[succ]) {
                *deg = deg.saturating_sub(1);
            }
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crucible_core::build::Outcome;
    use crucible_core::task::{Executable, ExecutionContext};

    struct StubTask(&'static str);

    struct Noop;

    #[async_trait::async_trait]
    impl Executable for Noop {
        async fn run(&self, _ctx: &ExecutionContext) -> Outcome {
            Outcome::Success
        }
    }

    impl Task for StubTask {
        fn id(&self) -> TaskId {
            TaskId::new(self.0)
        }

        fn create_executable(&self) -> Result<Box<dyn Executable>> {
            Ok(Box::new(Noop))
        }
    }

    struct StaticEdges(Vec<(&'static str, &'static str)>);

    impl DependencyDeclarer for StaticEdges {
        fn declare(&self, task: &Arc<dyn Task>, _all: &[Arc<dyn Task>]) -> Vec<Dependency> {
            self.0
                .iter()
                .filter(|(up, _)| TaskId::new(*up) == task.id())
                .map(|(up, down)| Dependency::new(TaskId::new(*up), TaskId::new(*down)))
                .collect()
        }
    }

    fn tasks(names: &[&'static str]) -> Vec<Arc<dyn Task>> {
        names
            .iter()
            .map(|n| Arc::new(StubTask(n)) as Arc<dyn Task>)
            .collect()
    }

    fn build_graph(
        names: &[&'static str],
        edges: Vec<(&'static str, &'static str)>,
    ) -> Arc<DependencyGraph> {
        DependencyGraph::build(
            &tasks(names),
            &[Arc::new(StaticEdges(edges)) as Arc<dyn DependencyDeclarer>],
        )
    }

    #[test]
    fn test_neighbors() {
        let graph = build_graph(&["a", "b", "c"], vec![("a", "b"), ("b", "c")]);
        assert_eq!(graph.downstream(&TaskId::new("a")), vec![TaskId::new("b")]);
        assert_eq!(graph.upstream(&TaskId::new("c")), vec![TaskId::new("b")]);
        assert!(graph.upstream(&TaskId::new("a")).is_empty());
    }

    #[test]
    fn test_acyclic_topological_order() {
        let graph = build_graph(
            &["build", "test", "deploy"],
            vec![("build", "test"), ("test", "deploy")],
        );
        assert_eq!(
            graph.topological_order(),
            &[
                TaskId::new("build"),
                TaskId::new("test"),
                TaskId::new("deploy")
            ]
        );
    }

    #[test]
    fn test_cyclic_topological_order() {
        // a -> b -> c -> d -> b (cycle on b-c-d), c -> e
        let graph = build_graph(
            &["a", "b", "c", "d", "e"],
            vec![("a", "b"), ("b", "c"), ("c", "d"), ("d", "b"), ("c", "e")],
        );

        let order = graph.topological_order();
        assert_eq!(order.len(), 5);
        assert_eq!(order[0], TaskId::new("a"));
        assert_eq!(order[4], TaskId::new("e"));

        let a = TaskId::new("a");
        let b = TaskId::new("b");
        let c = TaskId::new("c");
        let e = TaskId::new("e");
        assert_eq!(graph.compare(&a, &b), Ordering::Less);
        assert_eq!(graph.compare(&a, &e), Ordering::Less);
        assert_eq!(graph.compare(&b, &e), Ordering::Less);
        assert_eq!(graph.compare(&c, &e), Ordering::Less);
        assert_eq!(graph.compare(&e, &a), Ordering::Greater);
    }

    #[test]
    fn test_compare_unrelated_uses_topo_position() {
        let graph = build_graph(&["x", "y"], vec![]);
        // Neither reaches the other; order still total and consistent.
        let x = TaskId::new("x");
        let y = TaskId::new("y");
        assert_ne!(graph.compare(&x, &y), Ordering::Equal);
        assert_eq!(graph.compare(&x, &x), Ordering::Equal);
    }

    #[test]
    fn test_transitive_closure() {
        let graph = build_graph(
            &["a", "b", "c", "e"],
            vec![("a", "b"), ("b", "c"), ("c", "e")],
        );
        let down = graph.transitive_downstream(&TaskId::new("a"));
        assert_eq!(down.len(), 3);
        assert!(down.contains(&TaskId::new("e")));

        let up = graph.transitive_upstream(&TaskId::new("e"));
        assert_eq!(up.len(), 3);
        assert!(up.contains(&TaskId::new("a")));
    }

    #[test]
    fn test_unknown_edges_dropped() {
        let graph = build_graph(&["a"], vec![("a", "ghost")]);
        assert!(graph.downstream(&TaskId::new("a")).is_empty());
        assert_eq!(graph.topological_order().len(), 1);
    }
}
