//! Dependency graph and evaluation ordering
//!
//! Nodes live in a petgraph arena; an edge `a -> b` means "a depends on b".
//! Declared subjects are added before any edge so node indices follow
//! declaration order, which keeps ordering and cycle reports deterministic.

use crate::analyzer::is_entity_id;
use crate::circular::CircularReferenceDetector;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use tracing::debug;

/// Directed dependency graph over names
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    graph: DiGraph<String, ()>,
    indices: HashMap<String, NodeIndex>,
    declared: Vec<NodeIndex>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from `(name, dependencies)` entries. Every entry name is
    /// declared; dependencies that are not entries become plain nodes.
    pub fn from_entries<I, N, D, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (N, D)>,
        N: Into<String>,
        D: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entries: Vec<(String, Vec<String>)> = entries
            .into_iter()
            .map(|(name, deps)| (name.into(), deps.into_iter().map(Into::into).collect()))
            .collect();

        let mut graph = Self::new();
        for (name, _) in &entries {
            graph.declare(name);
        }
        for (name, deps) in &entries {
            for dep in deps {
                graph.add_dependency(name, dep);
            }
        }
        graph
    }

    fn node(&mut self, name: &str) -> NodeIndex {
        if let Some(&index) = self.indices.get(name) {
            return index;
        }
        let index = self.graph.add_node(name.to_string());
        self.indices.insert(name.to_string(), index);
        index
    }

    /// Add a name that takes part in evaluation ordering
    pub fn declare(&mut self, name: &str) -> NodeIndex {
        let index = self.node(name);
        if !self.declared.contains(&index) {
            self.declared.push(index);
        }
        index
    }

    /// Record that `from` depends on `to`
    pub fn add_dependency(&mut self, from: &str, to: &str) {
        let from = self.node(from);
        let to = self.node(to);
        if self.graph.find_edge(from, to).is_none() {
            self.graph.add_edge(from, to, ());
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.indices.contains_key(name)
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_declared(&self, name: &str) -> bool {
        self.indices
            .get(name)
            .map(|index| self.declared.contains(index))
            .unwrap_or(false)
    }

    /// Declared names in declaration order
    pub fn declared_names(&self) -> Vec<&str> {
        self.declared.iter().map(|&i| self.graph[i].as_str()).collect()
    }

    /// Direct dependencies of `name`, sorted by node order
    pub fn dependencies_of(&self, name: &str) -> Vec<&str> {
        match self.indices.get(name) {
            Some(&index) => self
                .sorted_neighbors(index)
                .into_iter()
                .map(|i| self.graph[i].as_str())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Adjacency view: each node mapped to the names it depends on
    pub fn adjacency(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.graph
            .node_indices()
            .map(|index| {
                let deps = self
                    .graph
                    .neighbors_directed(index, Direction::Outgoing)
                    .map(|n| self.graph[n].clone())
                    .collect();
                (self.graph[index].clone(), deps)
            })
            .collect()
    }

    pub(crate) fn index_of(&self, name: &str) -> Option<NodeIndex> {
        self.indices.get(name).copied()
    }

    pub(crate) fn name_of(&self, index: NodeIndex) -> &str {
        &self.graph[index]
    }

    pub(crate) fn declared_indices(&self) -> &[NodeIndex] {
        &self.declared
    }

    pub(crate) fn sorted_neighbors(&self, index: NodeIndex) -> Vec<NodeIndex> {
        let mut neighbors: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(index, Direction::Outgoing)
            .collect();
        neighbors.sort();
        neighbors
    }

    fn sorted_dependents(&self, index: NodeIndex) -> Vec<NodeIndex> {
        let mut dependents: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(index, Direction::Incoming)
            .collect();
        dependents.sort();
        dependents
    }

    /// Order declared names so every name follows its declared dependencies
    /// (Kahn's algorithm, FIFO by declaration order). Names that cannot be
    /// ordered because they sit on or behind a cycle are reported in `cyclic`.
    /// Undeclared dependency nodes are inputs and are not ordered.
    pub fn evaluation_order(&self) -> EvaluationOrder {
        let declared: HashSet<NodeIndex> = self.declared.iter().copied().collect();

        let mut in_degree: HashMap<NodeIndex, usize> = self
            .declared
            .iter()
            .map(|&index| {
                let degree = self
                    .sorted_neighbors(index)
                    .into_iter()
                    .filter(|n| declared.contains(n))
                    .count();
                (index, degree)
            })
            .collect();

        let mut queue: VecDeque<NodeIndex> = self
            .declared
            .iter()
            .copied()
            .filter(|index| in_degree.get(index) == Some(&0))
            .collect();

        let mut order = Vec::with_capacity(self.declared.len());
        let mut emitted = HashSet::new();

        while let Some(index) = queue.pop_front() {
            order.push(self.graph[index].clone());
            emitted.insert(index);

            for dependent in self.sorted_dependents(index) {
                if let Some(degree) = in_degree.get_mut(&dependent) {
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        queue.push_back(dependent);
                    }
                }
            }
        }

        let cyclic: Vec<String> = self
            .declared
            .iter()
            .filter(|index| !emitted.contains(index))
            .map(|&index| self.graph[index].clone())
            .collect();

        debug!(
            ordered = order.len(),
            cyclic = cyclic.len(),
            "computed evaluation order"
        );
        EvaluationOrder { order, cyclic }
    }
}

/// Result of ordering a dependency graph
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EvaluationOrder {
    /// Acyclic names, dependencies first
    pub order: Vec<String>,
    /// Names left out of `order`, in declaration order
    pub cyclic: Vec<String>,
}

impl EvaluationOrder {
    pub fn is_acyclic(&self) -> bool {
        self.cyclic.is_empty()
    }

    /// Full sequence with the cyclic remainder appended at the end
    pub fn into_sequence(self) -> Vec<String> {
        let mut sequence = self.order;
        sequence.extend(self.cyclic);
        sequence
    }
}

/// One subject's contribution to the cross-entity graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectDependencies {
    pub id: String,
    /// Optional entity id under which other formulas refer to this subject
    pub alias: Option<String>,
    pub dependencies: BTreeSet<String>,
}

/// Outcome of [`CrossEntityDependencyManager::validate`]
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CrossEntityValidation {
    pub cycles: Vec<Vec<String>>,
    pub unregistered: BTreeSet<String>,
    pub is_valid: bool,
}

/// Builds and checks the dependency graph across all registered subjects
#[derive(Debug, Clone, Default)]
pub struct CrossEntityDependencyManager {
    subjects: Vec<SubjectDependencies>,
    domains: BTreeSet<String>,
}

impl CrossEntityDependencyManager {
    pub fn new(domains: BTreeSet<String>) -> Self {
        Self {
            subjects: Vec::new(),
            domains,
        }
    }

    /// Register a subject; re-registering an id replaces its entry in place
    pub fn register(&mut self, subject: SubjectDependencies) {
        match self.subjects.iter_mut().find(|s| s.id == subject.id) {
            Some(existing) => *existing = subject,
            None => self.subjects.push(subject),
        }
    }

    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }

    fn aliases(&self) -> HashMap<&str, &str> {
        let mut aliases = HashMap::new();
        for subject in &self.subjects {
            aliases.insert(subject.id.as_str(), subject.id.as_str());
            if let Some(alias) = &subject.alias {
                aliases.insert(alias.as_str(), subject.id.as_str());
            }
        }
        aliases
    }

    /// Build the graph: subjects are declared, references to another subject
    /// (by id or alias) become edges to that subject's id, anything else stays
    /// an input node.
    pub fn build_dependency_graph(&self) -> DependencyGraph {
        let aliases = self.aliases();
        let mut graph = DependencyGraph::new();

        for subject in &self.subjects {
            graph.declare(&subject.id);
        }
        for subject in &self.subjects {
            for dep in &subject.dependencies {
                let target = aliases.get(dep.as_str()).copied().unwrap_or(dep.as_str());
                graph.add_dependency(&subject.id, target);
            }
        }
        graph
    }

    pub fn evaluation_order(&self) -> EvaluationOrder {
        self.build_dependency_graph().evaluation_order()
    }

    /// Every distinct cycle among registered subjects
    pub fn detect_cross_entity_cycles(&self) -> Vec<Vec<String>> {
        let graph = self.build_dependency_graph();
        let order = graph.evaluation_order();

        let mut seen: HashSet<BTreeSet<String>> = HashSet::new();
        let mut cycles = Vec::new();
        for name in &order.cyclic {
            if let Some(path) = CircularReferenceDetector::find_cycle(&graph, Some(name)) {
                let members: BTreeSet<String> = path.iter().cloned().collect();
                if seen.insert(members) {
                    cycles.push(path);
                }
            }
        }
        cycles
    }

    /// Valid only with zero cycles and zero references to entity-shaped
    /// names that are neither subjects nor known externally.
    pub fn validate(&self, known_external: &HashSet<String>) -> CrossEntityValidation {
        let aliases = self.aliases();
        let unregistered: BTreeSet<String> = self
            .subjects
            .iter()
            .flat_map(|s| s.dependencies.iter())
            .filter(|dep| {
                !aliases.contains_key(dep.as_str())
                    && !known_external.contains(dep.as_str())
                    && is_entity_id(dep, &self.domains)
            })
            .cloned()
            .collect();

        let cycles = self.detect_cross_entity_cycles();
        let is_valid = cycles.is_empty() && unregistered.is_empty();
        CrossEntityValidation {
            cycles,
            unregistered,
            is_valid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn subject(id: &str, alias: Option<&str>, deps: &[&str]) -> SubjectDependencies {
        SubjectDependencies {
            id: id.to_string(),
            alias: alias.map(str::to_string),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
        }
    }

    fn position(order: &[String], name: &str) -> usize {
        order.iter().position(|n| n == name).unwrap()
    }

    #[test]
    fn test_topological_order() {
        let graph = DependencyGraph::from_entries([
            ("C", vec!["A", "B"]),
            ("B", vec!["A"]),
            ("A", vec![]),
        ]);
        let result = graph.evaluation_order();

        assert!(result.is_acyclic());
        assert_eq!(result.order, vec!["A", "B", "C"]);
    }

    #[test]
    fn test_three_cycle_is_reported_separately() {
        let graph =
            DependencyGraph::from_entries([("A", vec!["B"]), ("B", vec!["C"]), ("C", vec!["A"])]);
        let result = graph.evaluation_order();

        assert!(result.order.is_empty());
        assert_eq!(result.cyclic, vec!["A", "B", "C"]);
        assert_eq!(result.into_sequence(), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_cycle_does_not_hide_independent_names() {
        let graph = DependencyGraph::from_entries([
            ("A", vec!["B"]),
            ("B", vec!["A"]),
            ("C", vec!["sensor.input"]),
            ("D", vec!["A"]),
        ]);
        let result = graph.evaluation_order();

        assert_eq!(result.order, vec!["C"]);
        assert_eq!(result.cyclic, vec!["A", "B", "D"]);
    }

    #[test]
    fn test_external_inputs_are_not_ordered() {
        let graph = DependencyGraph::from_entries([("total", vec!["sensor.a", "sensor.b"])]);
        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.evaluation_order().order, vec!["total"]);
        assert!(graph.is_declared("total"));
        assert!(!graph.is_declared("sensor.a"));
        assert_eq!(graph.dependencies_of("total"), vec!["sensor.a", "sensor.b"]);
    }

    #[test]
    fn test_adjacency_view() {
        let graph = DependencyGraph::from_entries([("b", vec!["a"]), ("a", vec![])]);
        let adjacency = graph.adjacency();
        assert_eq!(adjacency["b"], BTreeSet::from(["a".to_string()]));
        assert!(adjacency["a"].is_empty());
    }

    #[test]
    fn test_manager_resolves_aliases() {
        let mut manager = CrossEntityDependencyManager::new(EngineConfig::default().entity_domains);
        manager.register(subject("total", Some("sensor.total"), &["sensor.a", "sensor.b"]));
        manager.register(subject("share", None, &["sensor.total", "sensor.a"]));

        let graph = manager.build_dependency_graph();
        assert_eq!(graph.dependencies_of("share"), vec!["total", "sensor.a"]);
        assert_eq!(manager.evaluation_order().order, vec!["total", "share"]);
    }

    #[test]
    fn test_manager_validate() {
        let mut manager = CrossEntityDependencyManager::new(EngineConfig::default().entity_domains);
        manager.register(subject("a", None, &["b", "sensor.known"]));
        manager.register(subject("b", None, &["a"]));
        manager.register(subject("c", None, &["sensor.ghost", "bare_name"]));

        let known = HashSet::from(["sensor.known".to_string()]);
        let validation = manager.validate(&known);

        assert!(!validation.is_valid);
        assert_eq!(validation.cycles, vec![vec!["a", "b", "a"]]);
        assert_eq!(
            validation.unregistered,
            BTreeSet::from(["sensor.ghost".to_string()])
        );
    }

    #[test]
    fn test_manager_register_replaces() {
        let mut manager = CrossEntityDependencyManager::default();
        manager.register(subject("a", None, &["b"]));
        manager.register(subject("a", None, &[]));
        assert_eq!(manager.len(), 1);
        assert!(manager.detect_cross_entity_cycles().is_empty());
    }

    proptest! {
        #[test]
        fn prop_order_respects_dependencies_for_any_declaration_order(
            entries in Just(vec![
                ("A", vec![]),
                ("B", vec!["A"]),
                ("C", vec!["A", "B"]),
            ]).prop_shuffle()
        ) {
            let result = DependencyGraph::from_entries(entries).evaluation_order();
            prop_assert!(result.is_acyclic());
            prop_assert_eq!(result.order.len(), 3);
            prop_assert!(position(&result.order, "A") < position(&result.order, "B"));
            prop_assert!(position(&result.order, "B") < position(&result.order, "C"));
        }
    }
}
