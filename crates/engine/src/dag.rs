//! DAG validation and wave scheduling. Run this before persisting or
//! executing a workflow.
//!
//! Rules enforced:
//! 1. Node IDs must be unique within the workflow.
//! 2. Every dependency must reference a node of the same workflow, and no
//!    node may depend on itself.
//! 3. The directed graph must be acyclic.
//!
//! On success the graph is compiled into *waves*: wave 0 holds every node
//! without dependencies, wave k every not-yet-scheduled node whose
//! dependencies all sit in waves < k.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::{EngineError, models::Workflow};

/// Node dependency graph stored as an index arena keyed by node ID.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    ids: Vec<String>,
    index: HashMap<String, usize>,
    /// `dependencies[i]`: nodes `i` depends on.
    dependencies: Vec<Vec<usize>>,
    /// `dependents[i]`: nodes depending on `i`.
    dependents: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Build the arena, rejecting duplicate IDs and dangling or
    /// self-referencing dependencies. Cycles are detected by [`Self::waves`].
    pub fn build(workflow: &Workflow) -> Result<Self, EngineError> {
        let mut index: HashMap<String, usize> = HashMap::with_capacity(workflow.nodes.len());
        for (i, node) in workflow.nodes.iter().enumerate() {
            if index.insert(node.id.clone(), i).is_some() {
                return Err(EngineError::DuplicateNodeId(node.id.clone()));
            }
        }

        let n = workflow.nodes.len();
        let mut dependencies: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];

        for (i, node) in workflow.nodes.iter().enumerate() {
            for dep in &node.depends_on {
                let &d = index.get(dep).ok_or_else(|| EngineError::UnknownDependency {
                    node_id: node.id.clone(),
                    dependency: dep.clone(),
                })?;
                if d == i {
                    return Err(EngineError::GraphCycle { remaining: vec![node.id.clone()] });
                }
                // A dependency listed twice must only count once in the in-degree.
                if !dependencies[i].contains(&d) {
                    dependencies[i].push(d);
                    dependents[d].push(i);
                }
            }
        }

        Ok(Self {
            ids: workflow.nodes.iter().map(|n| n.id.clone()).collect(),
            index,
            dependencies,
            dependents,
        })
    }

    /// Greedy topological layering (Kahn's algorithm, one layer at a time).
    ///
    /// Nodes inside a wave are listed in declaration order.
    ///
    /// # Errors
    /// [`EngineError::GraphCycle`] if some nodes can never be scheduled.
    pub fn waves(&self) -> Result<Vec<Vec<String>>, EngineError> {
        let mut in_degree: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();

        let mut current: Vec<usize> = (0..self.ids.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut waves: Vec<Vec<String>> = Vec::new();
        let mut scheduled = 0usize;

        while !current.is_empty() {
            scheduled += current.len();

            let mut next: Vec<usize> = Vec::new();
            for &i in &current {
                for &j in &self.dependents[i] {
                    in_degree[j] -= 1;
                    if in_degree[j] == 0 {
                        next.push(j);
                    }
                }
            }
            next.sort_unstable();

            waves.push(current.iter().map(|&i| self.ids[i].clone()).collect());
            current = next;
        }

        // If we didn't place every node the graph contains a cycle.
        if scheduled != self.ids.len() {
            let remaining = (0..self.ids.len())
                .filter(|&i| in_degree[i] > 0)
                .map(|i| self.ids[i].clone())
                .collect();
            return Err(EngineError::GraphCycle { remaining });
        }

        Ok(waves)
    }

    /// Node IDs in declaration order.
    pub fn node_ids(&self) -> &[String] {
        &self.ids
    }

    /// Direct dependencies of `node_id`.
    pub fn dependencies(&self, node_id: &str) -> Vec<&str> {
        self.index
            .get(node_id)
            .map(|&i| self.dependencies[i].iter().map(|&d| self.ids[d].as_str()).collect())
            .unwrap_or_default()
    }

    /// Every node `node_id` transitively depends on, in declaration order.
    pub fn ancestors(&self, node_id: &str) -> Vec<&str> {
        self.walk([node_id], &self.dependencies)
    }

    /// Every node transitively depending on any of `seeds` (seeds excluded
    /// unless reachable from another seed), in declaration order.
    pub fn descendants<'a, I>(&self, seeds: I) -> Vec<&str>
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.walk(seeds, &self.dependents)
    }

    fn walk<'a, I>(&self, seeds: I, edges: &[Vec<usize>]) -> Vec<&str>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut visited: HashSet<usize> = HashSet::new();
        let mut queue: VecDeque<usize> = seeds
            .into_iter()
            .filter_map(|id| self.index.get(id).copied())
            .collect();

        while let Some(i) = queue.pop_front() {
            for &next in &edges[i] {
                if visited.insert(next) {
                    queue.push_back(next);
                }
            }
        }

        let mut found: Vec<usize> = visited.into_iter().collect();
        found.sort_unstable();
        found.into_iter().map(|i| self.ids[i].as_str()).collect()
    }
}

/// Validate the workflow's DAG and return its wave plan.
///
/// # Errors
/// - [`EngineError::DuplicateNodeId`] if two nodes share an ID.
/// - [`EngineError::UnknownDependency`] if a dependency references a missing node.
/// - [`EngineError::GraphCycle`] if the graph is not acyclic.
pub fn validate_dag(workflow: &Workflow) -> Result<Vec<Vec<String>>, EngineError> {
    DependencyGraph::build(workflow)?.waves()
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NodeDefinition;

    fn make_node(id: &str, deps: &[&str]) -> NodeDefinition {
        NodeDefinition::new(id, "mock", serde_json::Value::Null).depends_on(deps.iter().copied())
    }

    fn make_workflow(nodes: Vec<NodeDefinition>) -> Workflow {
        Workflow::new("test", nodes, vec![])
    }

    #[test]
    fn linear_dag_yields_one_node_per_wave() {
        // A → B → C
        let workflow = make_workflow(vec![
            make_node("a", &[]),
            make_node("b", &["a"]),
            make_node("c", &["b"]),
        ]);

        let waves = validate_dag(&workflow).expect("should be valid");
        assert_eq!(waves, vec![vec!["a"], vec!["b"], vec!["c"]]);
    }

    #[test]
    fn fan_out_groups_siblings_into_one_wave() {
        // 1 → {2, 3}
        let workflow = make_workflow(vec![
            make_node("1", &[]),
            make_node("2", &["1"]),
            make_node("3", &["1"]),
        ]);

        let waves = validate_dag(&workflow).unwrap();
        assert_eq!(waves, vec![vec!["1"], vec!["2", "3"]]);
    }

    #[test]
    fn diamond_dag() {
        //   A
        //  / \
        // B   C
        //  \ /
        //   D
        let workflow = make_workflow(vec![
            make_node("d", &["b", "c"]),
            make_node("c", &["a"]),
            make_node("b", &["a"]),
            make_node("a", &[]),
        ]);

        let waves = validate_dag(&workflow).expect("should be valid");
        assert_eq!(waves, vec![vec!["a"], vec!["c", "b"], vec!["d"]]);
    }

    #[test]
    fn waves_are_maximal() {
        // x has no deps and lands in wave 0 even though it is declared last;
        // y only waits for x, so it joins wave 1 alongside b.
        let workflow = make_workflow(vec![
            make_node("a", &[]),
            make_node("b", &["a"]),
            make_node("c", &["b"]),
            make_node("x", &[]),
            make_node("y", &["x"]),
        ]);

        let waves = validate_dag(&workflow).unwrap();
        assert_eq!(waves, vec![vec!["a", "x"], vec!["b", "y"], vec!["c"]]);
    }

    #[test]
    fn duplicate_node_id_is_rejected() {
        let workflow = make_workflow(vec![make_node("a", &[]), make_node("a", &[])]);
        assert!(matches!(
            validate_dag(&workflow),
            Err(EngineError::DuplicateNodeId(id)) if id == "a"
        ));
    }

    #[test]
    fn dependency_on_missing_node_is_rejected() {
        let workflow = make_workflow(vec![make_node("a", &["ghost"])]);
        assert!(matches!(
            validate_dag(&workflow),
            Err(EngineError::UnknownDependency { dependency, .. }) if dependency == "ghost"
        ));
    }

    #[test]
    fn cycle_is_detected() {
        // A → B → C → A, with an innocent D alongside.
        let workflow = make_workflow(vec![
            make_node("a", &["c"]),
            make_node("b", &["a"]),
            make_node("c", &["b"]),
            make_node("d", &[]),
        ]);
        match validate_dag(&workflow) {
            Err(EngineError::GraphCycle { remaining }) => {
                assert_eq!(remaining, vec!["a", "b", "c"]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let workflow = make_workflow(vec![make_node("loop", &["loop"])]);
        assert!(matches!(validate_dag(&workflow), Err(EngineError::GraphCycle { .. })));
    }

    #[test]
    fn repeated_dependency_counts_once() {
        let workflow = make_workflow(vec![make_node("a", &[]), make_node("b", &["a", "a"])]);
        assert_eq!(validate_dag(&workflow).unwrap(), vec![vec!["a"], vec!["b"]]);
    }

    #[test]
    fn ancestors_and_descendants_are_transitive() {
        let workflow = make_workflow(vec![
            make_node("1", &[]),
            make_node("2", &["1"]),
            make_node("3", &["1"]),
            make_node("4", &["2"]),
            make_node("5", &["4", "3"]),
        ]);
        let graph = DependencyGraph::build(&workflow).unwrap();

        assert_eq!(graph.ancestors("4"), vec!["1", "2"]);
        assert_eq!(graph.ancestors("1"), Vec::<&str>::new());
        assert_eq!(graph.descendants(["2"]), vec!["4", "5"]);
        assert_eq!(graph.dependencies("5"), vec!["4", "3"]);
    }

    /// Small deterministic generator so the layering properties are checked
    /// over many random DAGs without extra dependencies.
    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self) -> u64 {
            self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            self.0 >> 33
        }
    }

    #[test]
    fn random_dags_satisfy_layering_properties() {
        let mut rng = Lcg(42);

        for _ in 0..200 {
            let n = 1 + (rng.next() % 12) as usize;
            // Only depend on lower indices so the graph is acyclic; declare
            // nodes in shuffled order.
            let mut nodes: Vec<NodeDefinition> = (0..n)
                .map(|i| {
                    let deps: Vec<String> = (0..i)
                        .filter(|_| rng.next() % 3 == 0)
                        .map(|d| format!("n{d}"))
                        .collect();
                    NodeDefinition::new(format!("n{i}"), "mock", serde_json::Value::Null)
                        .depends_on(deps)
                })
                .collect();
            for i in (1..nodes.len()).rev() {
                let j = (rng.next() as usize) % (i + 1);
                nodes.swap(i, j);
            }
            let workflow = make_workflow(nodes);

            let waves = validate_dag(&workflow).expect("generated graph is acyclic");

            let mut wave_of: HashMap<&str, usize> = HashMap::new();
            for (k, wave) in waves.iter().enumerate() {
                for id in wave {
                    assert!(wave_of.insert(id.as_str(), k).is_none(), "{id} scheduled twice");
                }
            }
            assert_eq!(wave_of.len(), n, "every node is scheduled");

            for node in &workflow.nodes {
                let k = wave_of[node.id.as_str()];
                for dep in &node.depends_on {
                    assert!(wave_of[dep.as_str()] < k, "{dep} must precede {}", node.id);
                }
                // Maximality: a node sits exactly one wave after its latest dependency.
                let expected = node
                    .depends_on
                    .iter()
                    .map(|d| wave_of[d.as_str()] + 1)
                    .max()
                    .unwrap_or(0);
                assert_eq!(k, expected);
            }
        }
    }

    #[test]
    fn random_cycles_are_always_rejected() {
        let mut rng = Lcg(7);

        for _ in 0..100 {
            let n = 2 + (rng.next() % 8) as usize;
            let mut nodes: Vec<NodeDefinition> = (0..n)
                .map(|i| {
                    let deps: Vec<String> = (0..i)
                        .filter(|_| rng.next() % 2 == 0)
                        .map(|d| format!("n{d}"))
                        .collect();
                    NodeDefinition::new(format!("n{i}"), "mock", serde_json::Value::Null)
                        .depends_on(deps)
                })
                .collect();
            // Close a loop: n0 depends on n(n-1), which reaches n0 through the chain below.
            for i in 1..n {
                let prev = format!("n{}", i - 1);
                if !nodes[i].depends_on.contains(&prev) {
                    nodes[i].depends_on.push(prev);
                }
            }
            nodes[0].depends_on.push(format!("n{}", n - 1));

            let workflow = make_workflow(nodes);
            assert!(matches!(validate_dag(&workflow), Err(EngineError::GraphCycle { .. })));
        }
    }
}
