//! Lock-order deadlock detection for debug builds.
//!
//! Every lock acquisition pushes onto a per-thread stack and records a
//! "held-then-acquired" edge from the previously held lock to the new one
//! in a global directed graph. A cycle in that graph means two threads can
//! acquire the same locks in opposite orders - a latent deadlock - and is
//! asserted on the first time the edge completing it is recorded, whether
//! or not the deadlock actually strikes this run.

use ahash::AHashMap;

/// Global graph of lock-acquisition order.
///
/// Lock names are interned to dense ids; edges are `held -> acquired`
/// pairs. [`DeadlockGraph::add_edge`] runs a depth-first cycle check over
/// the whole graph whenever a new edge appears.
#[derive(Debug, Default)]
pub struct DeadlockGraph {
    name_to_id: AHashMap<&'static str, usize>,
    id_to_name: Vec<&'static str>,
    edges: AHashMap<usize, Vec<usize>>,
}

impl DeadlockGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns `name`, returning its dense id.
    pub fn id_of(&mut self, name: &'static str) -> usize {
        if let Some(&id) = self.name_to_id.get(name) {
            return id;
        }
        let id = self.id_to_name.len();
        self.name_to_id.insert(name, id);
        self.id_to_name.push(name);
        id
    }

    /// Name of the lock with the given id.
    #[must_use]
    pub fn name_of(&self, id: usize) -> &'static str {
        self.id_to_name[id]
    }

    /// Records that a thread acquired `to` while holding `from`. If this
    /// edge is new, re-checks the graph and returns the cycle path
    /// (`[a, b, .., a]` as lock ids) if one now exists.
    pub fn add_edge(&mut self, from: usize, to: usize) -> Option<Vec<usize>> {
        let adjacent = self.edges.entry(from).or_default();
        if adjacent.contains(&to) {
            return None;
        }
        adjacent.push(to);
        self.find_cycle()
    }

    /// Depth-first search over every node with visit colouring and parent
    /// tracking; returns the first back edge found, expanded to the full
    /// cycle path.
    fn find_cycle(&self) -> Option<Vec<usize>> {
        let count = self.id_to_name.len();
        let mut dfs = Dfs {
            graph: self,
            discovered: vec![None; count],
            finished: vec![false; count],
            parent: vec![None; count],
            next_order: 0,
        };
        for id in 0..count {
            if let Some(cycle) = dfs.visit(id) {
                return Some(cycle);
            }
        }
        None
    }
}

struct Dfs<'a> {
    graph: &'a DeadlockGraph,
    discovered: Vec<Option<usize>>,
    finished: Vec<bool>,
    parent: Vec<Option<usize>>,
    next_order: usize,
}

impl Dfs<'_> {
    fn visit(&mut self, here: usize) -> Option<Vec<usize>> {
        if self.discovered[here].is_some() {
            return None;
        }
        self.discovered[here] = Some(self.next_order);
        self.next_order += 1;

        if let Some(adjacent) = self.graph.edges.get(&here) {
            for &there in adjacent {
                if self.discovered[there].is_none() {
                    self.parent[there] = Some(here);
                    if let Some(cycle) = self.visit(there) {
                        return Some(cycle);
                    }
                    continue;
                }
                // discovered earlier and not finished: `there` is an
                // ancestor of `here`, so this edge closes a cycle
                if self.discovered[here] > self.discovered[there] && !self.finished[there] {
                    let mut path = vec![there, here];
                    let mut now = here;
                    while let Some(parent) = self.parent[now] {
                        path.push(parent);
                        now = parent;
                        if now == there {
                            break;
                        }
                    }
                    path.reverse();
                    return Some(path);
                }
            }
        }

        self.finished[here] = true;
        None
    }
}

#[cfg(debug_assertions)]
mod global {
    use std::{
        cell::RefCell,
        sync::{Mutex, OnceLock},
    };

    use super::*;

    static GRAPH: OnceLock<Mutex<DeadlockGraph>> = OnceLock::new();

    thread_local! {
        static LOCK_STACK: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
    }

    fn graph() -> &'static Mutex<DeadlockGraph> {
        GRAPH.get_or_init(|| Mutex::new(DeadlockGraph::new()))
    }

    /// Records an acquisition of the named lock by this thread.
    ///
    /// # Panics
    ///
    /// Panics if the acquisition makes a lock-order cycle possible.
    pub(crate) fn profiler_push(name: &'static str) {
        let cycle = {
            let mut graph = graph().lock().unwrap();
            let lock_id = graph.id_of(name);
            let cycle = LOCK_STACK.with(|stack| {
                let stack = stack.borrow();
                match stack.last() {
                    Some(&prev_id) if prev_id != lock_id => graph.add_edge(prev_id, lock_id),
                    _ => None,
                }
            });
            LOCK_STACK.with(|stack| stack.borrow_mut().push(lock_id));
            cycle.map(|path| {
                path.iter()
                    .map(|&id| graph.name_of(id))
                    .collect::<Vec<_>>()
            })
        };

        if let Some(path) = cycle {
            for pair in path.windows(2) {
                tracing::error!("lock order cycle: {} -> {}", pair[0], pair[1]);
            }
            panic!("deadlock detected: {}", path.join(" -> "));
        }
    }

    /// Records a release of the named lock by this thread.
    pub(crate) fn profiler_pop(name: &'static str) {
        let lock_id = {
            let mut graph = graph().lock().unwrap();
            graph.id_of(name)
        };
        LOCK_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            let top = stack.pop();
            debug_assert_eq!(top, Some(lock_id), "locks released out of order");
        });
    }
}

#[cfg(debug_assertions)]
pub(crate) use global::{profiler_pop, profiler_push};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_cycle_in_a_chain() {
        let mut graph = DeadlockGraph::new();
        let a = graph.id_of("a");
        let b = graph.id_of("b");
        let c = graph.id_of("c");
        assert_eq!(graph.add_edge(a, b), None);
        assert_eq!(graph.add_edge(b, c), None);
        assert_eq!(graph.add_edge(a, c), None);
    }

    #[test]
    fn two_lock_cycle() {
        let mut graph = DeadlockGraph::new();
        let a = graph.id_of("a");
        let b = graph.id_of("b");
        assert_eq!(graph.add_edge(a, b), None);
        let cycle = graph.add_edge(b, a).expect("cycle");
        assert_eq!(cycle.first(), cycle.last());
        assert!(cycle.contains(&a) && cycle.contains(&b));
    }

    #[test]
    fn three_lock_cycle() {
        let mut graph = DeadlockGraph::new();
        let a = graph.id_of("a");
        let b = graph.id_of("b");
        let c = graph.id_of("c");
        assert_eq!(graph.add_edge(a, b), None);
        assert_eq!(graph.add_edge(b, c), None);
        let cycle = graph.add_edge(c, a).expect("cycle");
        assert_eq!(cycle.first(), cycle.last());
        assert_eq!(cycle.len(), 4);
    }

    #[test]
    fn duplicate_edges_are_ignored() {
        let mut graph = DeadlockGraph::new();
        let a = graph.id_of("a");
        let b = graph.id_of("b");
        assert_eq!(graph.add_edge(a, b), None);
        assert_eq!(graph.add_edge(a, b), None);
    }
}
