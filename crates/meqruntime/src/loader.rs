//! Forest definition files
//!
//! Definitions are JSON documents holding the forest settings and one init
//! record per node. They can be checked against a registry before any node
//! is created.

use meqcore::{ChildRef, ForestDefinition, MeqError, NodeIndex};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::registry::NodeRegistry;

pub fn load_definition(path: impl AsRef<Path>) -> meqcore::Result<ForestDefinition> {
    let path = path.as_ref();
    let reader = BufReader::new(File::open(path)?);
    let def: ForestDefinition = serde_json::from_reader(reader)?;
    tracing::debug!(path = %path.display(), nodes = def.nodes.len(), "loaded definition");
    Ok(def)
}

pub fn save_definition(def: &ForestDefinition, path: impl AsRef<Path>) -> meqcore::Result<()> {
    let writer = BufWriter::new(File::create(path.as_ref())?);
    serde_json::to_writer_pretty(writer, def)?;
    Ok(())
}

/// Checks a definition without building it: unique names and indices,
/// known classes, resolvable child references and an acyclic graph.
pub fn validate_definition(def: &ForestDefinition, registry: &NodeRegistry) -> meqcore::Result<()> {
    let mut names = HashMap::new();
    let mut indices: HashMap<NodeIndex, usize> = HashMap::new();
    for (pos, spec) in def.nodes.iter().enumerate() {
        if names.insert(spec.name.as_str(), pos).is_some() {
            return Err(MeqError::DuplicateName(spec.name.clone()));
        }
        if let Some(index) = spec.node_index {
            if !index.is_valid() {
                return Err(MeqError::InvalidNodeIndex(index));
            }
            if indices.insert(index, pos).is_some() {
                return Err(MeqError::IndexInUse(index));
            }
        }
        if !registry.contains(&spec.class) {
            return Err(MeqError::UnknownNodeClass(spec.class.clone()));
        }
    }

    let resolve = |child: &ChildRef| -> meqcore::Result<usize> {
        match child {
            ChildRef::Name(name) => names
                .get(name.as_str())
                .copied()
                .ok_or_else(|| MeqError::NodeNotFound(name.clone())),
            ChildRef::Index(index) => indices
                .get(index)
                .copied()
                .ok_or(MeqError::InvalidNodeIndex(*index)),
        }
    };

    let mut graph = DiGraph::<usize, ()>::new();
    let vertices: Vec<_> = (0..def.nodes.len()).map(|i| graph.add_node(i)).collect();
    for (pos, spec) in def.nodes.iter().enumerate() {
        let mut seen = HashSet::new();
        for child in spec.children.iter().chain(&spec.stepchildren) {
            let target = resolve(child)?;
            if seen.insert(target) {
                graph.add_edge(vertices[pos], vertices[target], ());
            }
        }
        for label in &spec.poll_order {
            let known = (0..spec.children.len()).any(|i| &spec.child_label(i) == label);
            if !known {
                return Err(MeqError::NodeNotFound(format!("{}: child '{}'", spec.name, label)));
            }
        }
    }
    toposort(&graph, None)
        .map(|_| ())
        .map_err(|cycle| MeqError::CyclicDependency(def.nodes[graph[cycle.node_id()]].name.clone()))
}
