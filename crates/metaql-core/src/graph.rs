//! Object dependency graph.
//!
//! An edge `from -> to` means rows of `from` reference rows of `to` through
//! `via_field`. `master_detail` edges imply cascade delete and must not form
//! cycles; `lookup` edges may.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::Serialize;
use tracing::debug;

use crate::catalog::{ObjectDefinition, ReferenceKind};
use crate::error::GraphError;

/// A reference between two objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyEdge {
    /// Referencing (child) object.
    pub from: String,
    /// Referenced (parent) object.
    pub to: String,
    pub kind: ReferenceKind,
    pub via_field: String,
}

impl DependencyEdge {
    pub fn is_cascade(&self) -> bool {
        self.kind == ReferenceKind::MasterDetail
    }
}

/// Dependency graph over object names.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: BTreeSet<String>,
    edges: Vec<DependencyEdge>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the graph from object definitions. References to objects that
    /// are not in `objects` are ignored.
    pub fn from_objects<'a, I>(objects: I) -> Self
    where
        I: IntoIterator<Item = &'a ObjectDefinition>,
    {
        let objects: Vec<&ObjectDefinition> = objects.into_iter().collect();
        let mut graph = Self::new();
        for object in &objects {
            graph.add_object(&object.name);
        }
        for object in &objects {
            for reference in object.references() {
                if !graph.contains(reference.target) {
                    debug!(
                        object = %object.name,
                        field = reference.field,
                        target = reference.target,
                        "reference to unregistered object ignored"
                    );
                    continue;
                }
                graph.add_dependency(&object.name, reference.target, reference.kind, reference.field);
            }
        }
        graph
    }

    pub fn add_object(&mut self, name: &str) {
        if !self.nodes.contains(name) {
            self.nodes.insert(name.to_string());
        }
    }

    /// Record that `from` depends on `to` through `via_field`.
    pub fn add_dependency(&mut self, from: &str, to: &str, kind: ReferenceKind, via_field: &str) {
        self.add_object(from);
        self.add_object(to);
        let edge = DependencyEdge {
            from: from.to_string(),
            to: to.to_string(),
            kind,
            via_field: via_field.to_string(),
        };
        if !self.edges.contains(&edge) {
            self.edges.push(edge);
        }
    }

    pub fn contains(&self, object: &str) -> bool {
        self.nodes.contains(object)
    }

    pub fn objects(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(String::as_str)
    }

    pub fn edges(&self) -> &[DependencyEdge] {
        &self.edges
    }

    /// Edges from objects that reference `object`.
    pub fn get_dependents(&self, object: &str) -> Vec<&DependencyEdge> {
        self.edges.iter().filter(|e| e.to == object).collect()
    }

    /// Edges from `object` to the objects it references.
    pub fn get_dependencies(&self, object: &str) -> Vec<&DependencyEdge> {
        self.edges.iter().filter(|e| e.from == object).collect()
    }

    /// Order objects so that every referenced object precedes the objects
    /// referencing it. `None` sorts the whole graph.
    ///
    /// Lookup edges are dropped when they are all that blocks progress; a
    /// master_detail cycle is an error. Ties resolve alphabetically.
    pub fn topological_sort(&self, subset: Option<&[&str]>) -> Result<Vec<String>, GraphError> {
        let members: BTreeSet<&str> = match subset {
            Some(names) => {
                for name in names {
                    if !self.contains(name) {
                        return Err(GraphError::UnknownObject(name.to_string()));
                    }
                }
                names.iter().copied().collect()
            }
            None => self.objects().collect(),
        };

        if let Some(cycle) = self.find_cascade_cycle(&members) {
            return Err(GraphError::CircularDependency { cycle });
        }

        let inner: Vec<&DependencyEdge> = self
            .edges
            .iter()
            .filter(|e| e.from != e.to && members.contains(e.from.as_str()) && members.contains(e.to.as_str()))
            .collect();

        let mut order = Vec::with_capacity(members.len());
        let mut remaining = members;
        while !remaining.is_empty() {
            let blocked = |node: &str, cascade_only: bool| -> bool {
                inner
                    .iter()
                    .any(|e| e.from == node && remaining.contains(e.to.as_str()) && (!cascade_only || e.is_cascade()))
            };
            let next = remaining
                .iter()
                .copied()
                .find(|node| !blocked(*node, false))
                .or_else(|| remaining.iter().copied().find(|node| !blocked(*node, true)));
            // The cascade subgraph is acyclic, so some node is always free of it.
            let Some(next) = next else {
                break;
            };
            remaining.remove(next);
            order.push(next.to_string());
        }
        Ok(order)
    }

    /// Whether master_detail edges form a cycle. Lookup cycles are allowed.
    pub fn has_circular_dependency(&self) -> bool {
        let all: BTreeSet<&str> = self.objects().collect();
        self.find_cascade_cycle(&all).is_some()
    }

    /// `object` and every object reachable through master_detail children,
    /// children first.
    pub fn get_cascade_delete_order(&self, object: &str) -> Result<Vec<String>, GraphError> {
        if !self.contains(object) {
            return Err(GraphError::UnknownObject(object.to_string()));
        }

        let mut seen: BTreeSet<&str> = BTreeSet::from([object]);
        let mut queue = VecDeque::from([object]);
        while let Some(current) = queue.pop_front() {
            for edge in self.edges.iter().filter(|e| e.to == current && e.is_cascade()) {
                if seen.insert(edge.from.as_str()) {
                    queue.push_back(edge.from.as_str());
                }
            }
        }

        let subset: Vec<&str> = seen.into_iter().collect();
        let mut order = self.topological_sort(Some(subset.as_slice()))?;
        order.reverse();
        Ok(order)
    }

    /// First master_detail cycle among `members`, closed with its start.
    fn find_cascade_cycle(&self, members: &BTreeSet<&str>) -> Option<Vec<String>> {
        let mut adjacency: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for edge in self.edges.iter().filter(|e| e.is_cascade()) {
            if members.contains(edge.from.as_str()) && members.contains(edge.to.as_str()) {
                adjacency.entry(edge.from.as_str()).or_default().push(edge.to.as_str());
            }
        }

        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit<'a>(
            node: &'a str,
            adjacency: &BTreeMap<&'a str, Vec<&'a str>>,
            marks: &mut BTreeMap<&'a str, Mark>,
            path: &mut Vec<&'a str>,
        ) -> Option<Vec<String>> {
            marks.insert(node, Mark::Visiting);
            path.push(node);
            for &next in adjacency.get(node).into_iter().flatten() {
                match marks.get(next) {
                    Some(Mark::Visiting) => {
                        let start = path.iter().position(|n| *n == next).unwrap_or(0);
                        let mut cycle: Vec<String> = path[start..].iter().map(|n| n.to_string()).collect();
                        cycle.push(next.to_string());
                        return Some(cycle);
                    }
                    Some(Mark::Done) => {}
                    None => {
                        if let Some(cycle) = visit(next, adjacency, marks, path) {
                            return Some(cycle);
                        }
                    }
                }
            }
            path.pop();
            marks.insert(node, Mark::Done);
            None
        }

        let mut marks = BTreeMap::new();
        for &node in members {
            if marks.contains_key(node) {
                continue;
            }
            let mut path = Vec::new();
            if let Some(cycle) = visit(node, &adjacency, &mut marks, &mut path) {
                return Some(cycle);
            }
        }
        None
    }
}
