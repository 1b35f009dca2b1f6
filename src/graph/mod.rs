//! Schema Reference Graph
//!
//! Schemas may reference other registered subject versions by name. Before a
//! schema can be parsed, its references are resolved into a closure ordered
//! dependencies first, which is what the format parsers expect.
//!
//! The closure is built on a petgraph `DiGraph` with an edge from each
//! schema to the versions it references. Nodes are interned by
//! `(subject, version)` so diamond-shaped reference sets resolve each version
//! once, and a topological sort rejects cycles.

use std::collections::HashMap;
use std::sync::Arc;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use thiserror::Error;

use crate::schema::{Schema, SchemaId, SchemaReference, Version};

/// A reference resolved to its stored schema
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedReference {
    /// Name the referencing schema uses for it
    pub name: String,
    pub subject: String,
    pub version: Version,
    pub id: SchemaId,
    pub schema: Arc<Schema>,
    pub deleted: bool,
}

/// Lookup of registered subject versions, implemented by the replayed state
pub trait ReferenceLookup {
    /// The schema stored at `subject`/`version`, with its soft-deleted flag.
    fn lookup_version(&self, subject: &str, version: Version) -> Option<(SchemaId, Arc<Schema>, bool)>;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("reference '{name}' points to unknown subject '{subject}' version {version}")]
    Missing {
        name: String,
        subject: String,
        version: Version,
    },

    #[error("reference '{name}' points to deleted subject '{subject}' version {version}")]
    Deleted {
        name: String,
        subject: String,
        version: Version,
    },

    #[error("reference cycle through {0}")]
    Cycle(String),
}

/// Node key: one registered subject version
type NodeKey = (String, Version);

/// Reference graph for one resolution
pub struct ReferenceGraph {
    graph: DiGraph<Option<ResolvedReference>, ()>,
    node_indices: HashMap<NodeKey, NodeIndex>,
    root: NodeIndex,
}

impl ReferenceGraph {
    /// Walk `references` and everything they reference in turn.
    ///
    /// Direct references must be live; transitive ones only need to exist,
    /// since a stored schema keeps resolving after its dependencies are soft
    /// deleted.
    pub fn build(references: &[SchemaReference], lookup: &impl ReferenceLookup) -> Result<Self, GraphError> {
        let mut graph = DiGraph::new();
        let root = graph.add_node(None);
        let mut this = Self {
            graph,
            node_indices: HashMap::new(),
            root,
        };

        let mut worklist: Vec<(NodeIndex, SchemaReference, bool)> =
            references.iter().cloned().map(|r| (root, r, true)).collect();

        while let Some((from, reference, direct)) = worklist.pop() {
            let key = (reference.subject.clone(), reference.version);
            if let Some(&existing) = this.node_indices.get(&key) {
                this.graph.update_edge(from, existing, ());
                continue;
            }

            let (id, schema, deleted) = lookup
                .lookup_version(&reference.subject, reference.version)
                .ok_or_else(|| GraphError::Missing {
                    name: reference.name.clone(),
                    subject: reference.subject.clone(),
                    version: reference.version,
                })?;
            if direct && deleted {
                return Err(GraphError::Deleted {
                    name: reference.name,
                    subject: reference.subject,
                    version: reference.version,
                });
            }

            let nested = schema.references.clone();
            let node = this.graph.add_node(Some(ResolvedReference {
                name: reference.name,
                subject: reference.subject,
                version: reference.version,
                id,
                schema,
                deleted,
            }));
            this.node_indices.insert(key, node);
            this.graph.add_edge(from, node, ());
            worklist.extend(nested.into_iter().map(|r| (node, r, false)));
        }
        Ok(this)
    }

    /// Resolved references, dependencies before their dependents.
    pub fn closure(&self) -> Result<Vec<ResolvedReference>, GraphError> {
        let order = toposort(&self.graph, None).map_err(|cycle| {
            let name = match &self.graph[cycle.node_id()] {
                Some(r) => format!("'{}' version {}", r.subject, r.version),
                None => "the submitted schema".to_string(),
            };
            GraphError::Cycle(name)
        })?;
        Ok(order
            .into_iter()
            .rev()
            .filter(|&idx| idx != self.root)
            .filter_map(|idx| self.graph[idx].clone())
            .collect())
    }
}

/// Resolve `references` into their dependency-ordered closure.
pub fn resolve(references: &[SchemaReference], lookup: &impl ReferenceLookup) -> Result<Vec<ResolvedReference>, GraphError> {
    if references.is_empty() {
        return Ok(Vec::new());
    }
    ReferenceGraph::build(references, lookup)?.closure()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaFormat;

    #[derive(Default)]
    struct Fixture {
        versions: HashMap<NodeKey, (SchemaId, Arc<Schema>, bool)>,
    }

    impl Fixture {
        fn add(&mut self, subject: &str, version: u32, id: u32, references: Vec<SchemaReference>) {
            let schema = Schema::new(SchemaFormat::Avro, format!("\"{}\"", subject), references);
            self.versions.insert(
                (subject.to_string(), Version::new(version)),
                (SchemaId::new(id), Arc::new(schema), false),
            );
        }
    }

    impl ReferenceLookup for Fixture {
        fn lookup_version(&self, subject: &str, version: Version) -> Option<(SchemaId, Arc<Schema>, bool)> {
            self.versions.get(&(subject.to_string(), version)).cloned()
        }
    }

    fn reference(subject: &str) -> SchemaReference {
        SchemaReference::new(subject, subject, Version::FIRST)
    }

    #[test]
    fn test_closure_orders_dependencies_first() {
        let mut fixture = Fixture::default();
        fixture.add("money", 1, 1, vec![]);
        fixture.add("address", 1, 2, vec![]);
        fixture.add("customer", 1, 3, vec![reference("address"), reference("money")]);

        let closure = resolve(&[reference("customer"), reference("money")], &fixture).unwrap();
        let subjects: Vec<&str> = closure.iter().map(|r| r.subject.as_str()).collect();
        assert_eq!(subjects.len(), 3);
        let position = |s: &str| subjects.iter().position(|x| *x == s).unwrap();
        assert!(position("money") < position("customer"));
        assert!(position("address") < position("customer"));
    }

    #[test]
    fn test_missing_reference() {
        let fixture = Fixture::default();
        let err = resolve(&[reference("nowhere")], &fixture).unwrap_err();
        assert!(matches!(err, GraphError::Missing { .. }));
    }

    #[test]
    fn test_cycle_detected() {
        let mut fixture = Fixture::default();
        fixture.add("a", 1, 1, vec![reference("b")]);
        fixture.add("b", 1, 2, vec![reference("a")]);
        let err = resolve(&[reference("a")], &fixture).unwrap_err();
        assert!(matches!(err, GraphError::Cycle(_)));
    }

    #[test]
    fn test_direct_reference_must_be_live() {
        let mut fixture = Fixture::default();
        fixture.add("money", 1, 1, vec![]);
        if let Some(entry) = fixture.versions.get_mut(&("money".to_string(), Version::FIRST)) {
            entry.2 = true;
        }
        let err = resolve(&[reference("money")], &fixture).unwrap_err();
        assert!(matches!(err, GraphError::Deleted { .. }));
    }
}
