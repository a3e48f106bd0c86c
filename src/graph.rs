//! The task-dependency scheduler.
//!
//! A [`TaskGraph`] is a DAG of file-producing units of work. Each task
//! declares the target paths it produces; registration enforces that every
//! target has exactly one producer and that dependency edges never close a
//! cycle, so write races and deadlocks are ruled out before anything runs.
//!
//! Execution performs a parallel topological traversal: tasks whose
//! dependencies are all settled are dispatched to a bounded worker pool,
//! and results flow back over a channel to the scheduling loop, which is
//! the single place that mutates shared state. A task whose recorded
//! signature and target files are already up to date is skipped without
//! invoking its callable.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::time::{Duration, SystemTime};

use camino::{Utf8Path, Utf8PathBuf};
use crossbeam_channel::unbounded;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::debug;

use crate::config::GraphConfig;
use crate::error::{ExecuteError, GraphError, TaskFailure};
use crate::hash::Hash32;

/// Result from a single executed task.
pub type TaskResult<T> = anyhow::Result<T>;

type TaskFnPtr = std::sync::Arc<dyn Fn() -> TaskResult<()> + Send + Sync>;

/// Lifecycle of a task within its graph. `Done` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Ready,
    Running,
    Done,
    Failed,
}

/// A unit of work producing one or more target files.
///
/// The `name` and `args` take part in the task's signature, together with
/// the target paths; the signature is a stable content hash, so cache
/// decisions survive process restarts.
pub struct Task {
    name: String,
    args: Vec<String>,
    targets: Vec<Utf8PathBuf>,
    func: TaskFnPtr,
}

impl Task {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn() -> TaskResult<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            args: vec![],
            targets: vec![],
            func: std::sync::Arc::new(func),
        }
    }

    /// Record an input argument in the task signature. Changing an
    /// argument between runs invalidates the cache for this task.
    pub fn arg(mut self, value: impl ToString) -> Self {
        self.args.push(value.to_string());
        self
    }

    /// Declare a target output path produced by this task.
    pub fn target(mut self, path: impl AsRef<Utf8Path>) -> Self {
        self.targets.push(path.as_ref().to_owned());
        self
    }

    fn signature(&self) -> Hash32 {
        let parts = std::iter::once("task".as_bytes())
            .chain(std::iter::once(self.name.as_bytes()))
            .chain(std::iter::once("args".as_bytes()))
            .chain(self.args.iter().map(|a| a.as_bytes()))
            .chain(std::iter::once("targets".as_bytes()))
            .chain(self.targets.iter().map(|t| t.as_str().as_bytes()));
        Hash32::hash_parts(parts)
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Task({})", self.name)
    }
}

/// A lightweight, copyable token referring to a registered task. Used to
/// wire dependencies between tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: NodeIndex,
}

struct TaskNode {
    task: Task,
    signature: Hash32,
}

/// Statistics of one settled graph run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Tasks whose callable was invoked.
    pub executed: usize,
    /// Tasks skipped because their outputs were already up to date.
    pub cached: usize,
}

/// A dependency-aware, caching, parallel execution engine for a DAG of
/// file-producing tasks. Exclusively owns its nodes; executing the graph
/// consumes it, so a re-run is always a fresh registration pass (which
/// cache-skips everything still up to date).
pub struct TaskGraph {
    config: GraphConfig,
    graph: DiGraph<TaskNode, ()>,
    states: Vec<TaskState>,
    producers: HashMap<Utf8PathBuf, NodeIndex>,
}

impl TaskGraph {
    pub fn new(config: GraphConfig) -> std::io::Result<Self> {
        fs::create_dir_all(&config.cache_dir)?;
        Ok(Self {
            config,
            graph: DiGraph::new(),
            states: vec![],
            producers: HashMap::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn state(&self, handle: Handle) -> Option<TaskState> {
        self.states.get(handle.index.index()).copied()
    }

    /// Register a task with its dependencies. Fails when one of its
    /// targets is already claimed by a live node; on failure the graph is
    /// left unchanged.
    pub fn add_task(&mut self, task: Task, dependencies: &[Handle]) -> Result<Handle, GraphError> {
        for target in &task.targets {
            if let Some(&producer) = self.producers.get(target) {
                return Err(GraphError::DuplicateTarget {
                    path: target.clone(),
                    producer: self.graph[producer].task.name.clone(),
                });
            }
        }

        for dep in dependencies {
            if dep.index.index() >= self.graph.node_count() {
                return Err(GraphError::ForeignHandle(task.name.clone()));
            }
        }

        let signature = task.signature();
        let targets = task.targets.clone();

        let index = self.graph.add_node(TaskNode { task, signature });
        self.states.push(TaskState::Pending);

        for target in targets {
            self.producers.insert(target, index);
        }
        for dep in dependencies {
            self.graph.add_edge(dep.index, index, ());
        }

        Ok(Handle { index })
    }

    /// Add a dependency edge after registration: `task` will not start
    /// before `depends_on` is done. Fails when the edge would close a
    /// cycle; the rejected edge is rolled back and no state changes.
    pub fn add_dependency(&mut self, task: Handle, depends_on: Handle) -> Result<(), GraphError> {
        let edge = self.graph.add_edge(depends_on.index, task.index, ());

        if petgraph::algo::is_cyclic_directed(&self.graph) {
            self.graph.remove_edge(edge);
            return Err(GraphError::Cycle(self.graph[task.index].task.name.clone()));
        }

        Ok(())
    }

    /// Run every node to a terminal state and block until the graph has
    /// settled. Independent branches keep running after a failure; once
    /// everything is terminal, all failures are reported together.
    pub fn execute(mut self) -> Result<RunReport, ExecuteError> {
        let total = self.graph.node_count();
        if total == 0 {
            return Ok(RunReport::default());
        }

        // Map from a dependency to the nodes that depend on it.
        let mut dependents: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();
        for edge in self.graph.raw_edges() {
            dependents
                .entry(edge.source())
                .or_default()
                .push(edge.target());
        }

        let mut dependency_counts: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|i| {
                (
                    i,
                    self.graph.neighbors_directed(i, Direction::Incoming).count(),
                )
            })
            .collect();

        let mp = MultiProgress::new();
        let main_pb = mp.add(ProgressBar::new(total as u64));
        main_pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .expect("Error setting progress bar template")
                .progress_chars("#>-"),
        );
        main_pb.set_message("Running tasks...");

        let spinner_style = ProgressStyle::default_spinner()
            .template("{spinner:.blue} {msg}")
            .expect("Error setting progress bar template");

        let (result_sender, result_receiver) = unbounded::<(NodeIndex, TaskResult<()>)>();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.workers)
            .build()
            .expect("Error building the worker pool");

        let mut report = RunReport::default();
        let mut failures: Vec<TaskFailure> = vec![];
        let mut remaining = total;

        let mut ready: VecDeque<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|i| dependency_counts[i] == 0)
            .collect();

        // The scheduling loop stays on the calling thread; every pool
        // thread is free to run callables. Blocking on the channel inside
        // one of the pool's own threads would starve a one-worker pool.
        pool.in_place_scope(|s| {
            loop {
                // Dispatch everything currently ready. Cache hits settle
                // here without touching the pool.
                while let Some(index) = ready.pop_front() {
                    self.states[index.index()] = TaskState::Ready;

                    if self.is_cache_hit(index) {
                        debug!(task = %self.graph[index].task.name, "cache hit");
                        self.states[index.index()] = TaskState::Done;
                        report.cached += 1;
                        remaining -= 1;
                        main_pb.inc(1);
                        unlock_dependents(
                            index,
                            &dependents,
                            &mut dependency_counts,
                            &self.states,
                            &mut ready,
                        );
                        continue;
                    }

                    self.states[index.index()] = TaskState::Running;

                    let node = &self.graph[index];
                    let func = node.task.func.clone();
                    let name = node.task.name.clone();
                    let targets = node.task.targets.clone();
                    let token = self.token_path(node.signature);
                    let sig_hex = node.signature.to_hex();
                    let sender = result_sender.clone();
                    let mp = mp.clone();
                    let style = spinner_style.clone();

                    s.spawn(move |_| {
                        let task_pb = mp.add(ProgressBar::new_spinner());
                        task_pb.set_style(style);
                        task_pb.set_message(name);
                        task_pb.enable_steady_tick(Duration::from_millis(100));

                        let result = (func)().and_then(|()| {
                            fs::write(&token, &sig_hex)
                                .map_err(|e| anyhow::anyhow!("couldn't record signature: {e}"))
                        });

                        if result.is_err() {
                            // Partial outputs must never satisfy a later
                            // cache check.
                            for target in &targets {
                                let _ = fs::remove_file(target);
                            }
                            let _ = fs::remove_file(&token);
                        }

                        task_pb.finish_and_clear();
                        sender.send((index, result)).unwrap();
                    });
                }

                if remaining == 0 {
                    break;
                }

                // Wait for any task to finish. This loop is the only
                // writer of graph state; callables never hold it.
                let (index, result) = result_receiver.recv().unwrap();
                remaining -= 1;
                main_pb.inc(1);

                match result {
                    Ok(()) => {
                        self.states[index.index()] = TaskState::Done;
                        report.executed += 1;
                        unlock_dependents(
                            index,
                            &dependents,
                            &mut dependency_counts,
                            &self.states,
                            &mut ready,
                        );
                    }
                    Err(cause) => {
                        self.states[index.index()] = TaskState::Failed;
                        failures.push(TaskFailure {
                            name: self.graph[index].task.name.clone(),
                            signature: self.graph[index].signature,
                            cause,
                        });

                        // Fail-fast propagation: prune every transitive
                        // dependent instead of dispatching it.
                        let mut stack = vec![index];
                        while let Some(current) = stack.pop() {
                            for &dependent in
                                dependents.get(&current).map(Vec::as_slice).unwrap_or(&[])
                            {
                                let state = &mut self.states[dependent.index()];
                                if matches!(*state, TaskState::Done | TaskState::Failed) {
                                    continue;
                                }
                                *state = TaskState::Failed;
                                remaining -= 1;
                                main_pb.inc(1);
                                failures.push(TaskFailure {
                                    name: self.graph[dependent].task.name.clone(),
                                    signature: self.graph[dependent].signature,
                                    cause: anyhow::anyhow!(
                                        "not run: dependency '{}' failed",
                                        self.graph[current].task.name,
                                    ),
                                });
                                stack.push(dependent);
                            }
                        }
                    }
                }
            }
        });

        if failures.is_empty() {
            main_pb.finish_with_message("All tasks settled");
            Ok(report)
        } else {
            main_pb.finish_with_message("Settled with failures");
            Err(ExecuteError { failures })
        }
    }

    fn token_path(&self, signature: Hash32) -> Utf8PathBuf {
        self.config.cache_dir.join(format!("{}.sig", signature.to_hex()))
    }

    /// A node is a cache hit when all of its targets exist, its recorded
    /// signature matches, and no dependency output is newer than any of
    /// its own outputs. Nodes without targets always run.
    fn is_cache_hit(&self, index: NodeIndex) -> bool {
        let node = &self.graph[index];
        if node.task.targets.is_empty() {
            return false;
        }

        match fs::read_to_string(self.token_path(node.signature)) {
            Ok(recorded) if recorded == node.signature.to_hex() => {}
            _ => return false,
        }

        let Some(oldest_own) = oldest_mtime(&node.task.targets) else {
            return false;
        };

        for dep in self.graph.neighbors_directed(index, Direction::Incoming) {
            let dep_targets = &self.graph[dep].task.targets;
            match newest_mtime(dep_targets) {
                Some(newest_dep) if newest_dep <= oldest_own => {}
                Some(_) => return false,
                None => {}
            }
        }

        true
    }
}

fn unlock_dependents(
    completed: NodeIndex,
    dependents: &HashMap<NodeIndex, Vec<NodeIndex>>,
    dependency_counts: &mut HashMap<NodeIndex, usize>,
    states: &[TaskState],
    ready: &mut VecDeque<NodeIndex>,
) {
    let Some(dependents_of_completed) = dependents.get(&completed) else {
        return;
    };

    for &index in dependents_of_completed {
        if states[index.index()] != TaskState::Pending {
            continue;
        }
        if let Some(count) = dependency_counts.get_mut(&index) {
            *count -= 1;
            if *count == 0 {
                ready.push_back(index);
            }
        }
    }
}

fn mtimes(targets: &[Utf8PathBuf]) -> impl Iterator<Item = SystemTime> + '_ {
    targets
        .iter()
        .filter_map(|t| fs::metadata(t).and_then(|m| m.modified()).ok())
}

fn oldest_mtime(targets: &[Utf8PathBuf]) -> Option<SystemTime> {
    let times: Vec<_> = mtimes(targets).collect();
    // Every target must exist for the node to be up to date.
    (times.len() == targets.len()).then(|| times.into_iter().min().unwrap())
}

fn newest_mtime(targets: &[Utf8PathBuf]) -> Option<SystemTime> {
    mtimes(targets).max()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn graph_in(dir: &tempfile::TempDir, workers: usize) -> TaskGraph {
        let cache = Utf8PathBuf::from_path_buf(dir.path().join(".cache")).unwrap();
        TaskGraph::new(GraphConfig::new(cache, workers)).unwrap()
    }

    fn file_in(dir: &tempfile::TempDir, name: &str) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().join(name)).unwrap()
    }

    fn touch_task(name: &str, path: &Utf8Path, counter: &Arc<AtomicUsize>) -> Task {
        let path_owned = path.to_owned();
        let counter = counter.clone();
        Task::new(name, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            fs::write(&path_owned, name_bytes(&path_owned))?;
            Ok(())
        })
        .target(path)
    }

    fn name_bytes(path: &Utf8Path) -> Vec<u8> {
        path.as_str().into()
    }

    #[test]
    fn duplicate_target_leaves_graph_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let mut graph = graph_in(&dir, 1);
        let out = file_in(&dir, "a.out");
        let calls = Arc::new(AtomicUsize::new(0));

        graph.add_task(touch_task("first", &out, &calls), &[]).unwrap();
        let err = graph
            .add_task(touch_task("second", &out, &calls), &[])
            .unwrap_err();

        assert!(matches!(err, GraphError::DuplicateTarget { .. }));
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn cycle_is_rejected_and_nothing_leaves_pending() {
        let dir = tempfile::tempdir().unwrap();
        let mut graph = graph_in(&dir, 1);
        let calls = Arc::new(AtomicUsize::new(0));

        let a = graph
            .add_task(touch_task("a", &file_in(&dir, "a.out"), &calls), &[])
            .unwrap();
        let b = graph
            .add_task(touch_task("b", &file_in(&dir, "b.out"), &calls), &[a])
            .unwrap();

        let err = graph.add_dependency(a, b).unwrap_err();
        assert!(matches!(err, GraphError::Cycle(_)));
        assert_eq!(graph.state(a), Some(TaskState::Pending));
        assert_eq!(graph.state(b), Some(TaskState::Pending));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dependencies_run_before_dependents() {
        let dir = tempfile::tempdir().unwrap();
        let mut graph = graph_in(&dir, 4);

        let a_out = file_in(&dir, "a.out");
        let b_out = file_in(&dir, "b.out");
        let a_out_inner = a_out.clone();
        let b_out_inner = b_out.clone();

        let a = graph
            .add_task(
                Task::new("a", move || {
                    fs::write(&a_out_inner, b"a")?;
                    Ok(())
                })
                .target(&a_out),
                &[],
            )
            .unwrap();

        let check = a_out.clone();
        graph
            .add_task(
                Task::new("b", move || {
                    anyhow::ensure!(check.exists(), "dependency output missing");
                    fs::write(&b_out_inner, b"b")?;
                    Ok(())
                })
                .target(&b_out),
                &[a],
            )
            .unwrap();

        let report = graph.execute().unwrap();
        assert_eq!(report.executed, 2);
        assert!(b_out.exists());
    }

    #[test]
    fn second_run_is_fully_cached() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let build = |calls: &Arc<AtomicUsize>| {
            let mut graph = graph_in(&dir, 2);
            let a = graph
                .add_task(touch_task("a", &file_in(&dir, "a.out"), calls), &[])
                .unwrap();
            graph
                .add_task(touch_task("b", &file_in(&dir, "b.out"), calls), &[a])
                .unwrap();
            graph
        };

        let first = build(&calls).execute().unwrap();
        assert_eq!(first, RunReport { executed: 2, cached: 0 });
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let second = build(&calls).execute().unwrap();
        assert_eq!(second, RunReport { executed: 0, cached: 2 });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn changed_argument_invalidates_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let out = file_in(&dir, "a.out");
        let calls = Arc::new(AtomicUsize::new(0));

        let build = |arg: i32, calls: &Arc<AtomicUsize>| {
            let mut graph = graph_in(&dir, 1);
            graph
                .add_task(touch_task("a", &out, calls).arg(arg), &[])
                .unwrap();
            graph
        };

        build(1, &calls).execute().unwrap();
        build(1, &calls).execute().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        build(2, &calls).execute().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failure_propagates_and_independent_branches_finish() {
        let dir = tempfile::tempdir().unwrap();
        let mut graph = graph_in(&dir, 2);
        let calls = Arc::new(AtomicUsize::new(0));

        let bad = graph
            .add_task(
                Task::new("bad", || anyhow::bail!("boom")).target(file_in(&dir, "bad.out")),
                &[],
            )
            .unwrap();

        let pruned_calls = calls.clone();
        graph
            .add_task(
                Task::new("dependent", move || {
                    pruned_calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .target(file_in(&dir, "dependent.out")),
                &[bad],
            )
            .unwrap();

        let independent_out = file_in(&dir, "independent.out");
        graph
            .add_task(touch_task("independent", &independent_out, &calls), &[])
            .unwrap();

        let err = graph.execute().unwrap_err();
        let mut failed: Vec<_> = err.failures.iter().map(|f| f.name.as_str()).collect();
        failed.sort();

        assert_eq!(failed, vec!["bad", "dependent"]);
        assert!(independent_out.exists());
        // The pruned dependent never ran; only the independent task did.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_task_cleans_partial_targets() {
        let dir = tempfile::tempdir().unwrap();
        let out = file_in(&dir, "partial.out");

        let mut graph = graph_in(&dir, 1);
        let partial = out.clone();
        graph
            .add_task(
                Task::new("partial", move || {
                    fs::write(&partial, b"half-written")?;
                    anyhow::bail!("interrupted")
                })
                .target(&out),
                &[],
            )
            .unwrap();

        assert!(graph.execute().is_err());
        assert!(!out.exists());

        // A fresh run must execute again rather than cache-skip.
        let calls = Arc::new(AtomicUsize::new(0));
        let mut graph = graph_in(&dir, 1);
        graph
            .add_task(touch_task("partial", &out, &calls), &[])
            .unwrap();
        graph.execute().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sequential_pool_still_settles_wide_graphs() {
        let dir = tempfile::tempdir().unwrap();
        let mut graph = graph_in(&dir, 1);
        let calls = Arc::new(AtomicUsize::new(0));

        let roots: Vec<Handle> = (0..4)
            .map(|i| {
                graph
                    .add_task(
                        touch_task(&format!("root{i}"), &file_in(&dir, &format!("r{i}.out")), &calls),
                        &[],
                    )
                    .unwrap()
            })
            .collect();

        let join_out = file_in(&dir, "join.out");
        graph
            .add_task(touch_task("join", &join_out, &calls), &roots)
            .unwrap();

        let report = graph.execute().unwrap();
        assert_eq!(report.executed, 5);
        assert!(join_out.exists());
    }
}
