//! Dependency graph building and deterministic topological ordering

use crate::diagnostic::{Diagnostic, DiagnosticKind};
use crate::error::{CoreError, CoreResult};
use crate::node::{
    FunctionSpec, Node, NodeDetail, NodeKind, ParsedFunction, ParsedTable, ParsedTest,
    SchemaDefaults, TableSpec, TestCheck, TestSpec,
};
use crate::node_id::NodeId;
use crate::resolver::{Resolution, Resolver};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};

/// References captured at add time, resolved once every node is known
#[derive(Debug)]
enum PendingRefs {
    Table {
        tables: Vec<String>,
        functions: Vec<String>,
        defaults: SchemaDefaults,
    },
    Function {
        tables: Vec<String>,
        functions: Vec<String>,
        defaults: SchemaDefaults,
    },
    Test,
}

/// Collects parsed records and produces a [`DependencyGraph`].
///
/// Nodes keep the order they were added in (their *discovery rank*), which
/// breaks ties in [`DependencyGraph::topological_order`].
#[derive(Debug)]
pub struct GraphBuilder {
    resolver: Resolver,
    nodes: Vec<Node>,
    refs: Vec<PendingRefs>,
    index: HashMap<NodeId, usize>,
    diagnostics: Vec<Diagnostic>,
}

impl GraphBuilder {
    /// Create an empty builder
    pub fn new(resolver: Resolver) -> Self {
        Self {
            resolver,
            nodes: Vec::new(),
            refs: Vec::new(),
            index: HashMap::new(),
            diagnostics: Vec::new(),
        }
    }

    /// Build a graph from the three discovered collections.
    ///
    /// Functions are added first, then tables, then tests, so independent
    /// nodes run in that order.
    pub fn from_records(
        resolver: Resolver,
        tables: &[ParsedTable],
        functions: &[ParsedFunction],
        tests: &[ParsedTest],
    ) -> CoreResult<DependencyGraph> {
        let mut builder = Self::new(resolver);
        for function in functions {
            builder.add_function_node(function)?;
        }
        for table in tables {
            builder.add_table_node(table)?;
        }
        for test in tests {
            builder.add_test_node(test)?;
        }
        builder.build()
    }

    /// Add a model. Its source tables and functions become dependencies.
    pub fn add_table_node(&mut self, model: &ParsedTable) -> CoreResult<()> {
        let id = self.qualify_id(&model.id, &model.schema_defaults, "table id")?;
        let node = Node {
            id,
            depends_on: BTreeSet::new(),
            detail: NodeDetail::Table(TableSpec {
                sql: model.sql.clone(),
                materialization: model.materialization_config.clone(),
            }),
        };
        self.push(
            node,
            PendingRefs::Table {
                tables: model.source_tables.clone(),
                functions: model.source_functions.clone(),
                defaults: model.schema_defaults.clone(),
            },
        )
    }

    /// Add a user-defined function. It may depend on tables and functions.
    pub fn add_function_node(&mut self, function: &ParsedFunction) -> CoreResult<()> {
        let id = self.qualify_id(&function.id, &function.schema_defaults, "function id")?;
        self.resolver.register_function(id.clone());
        let node = Node {
            id,
            depends_on: BTreeSet::new(),
            detail: NodeDetail::Function(FunctionSpec {
                definition: function.definition.clone(),
            }),
        };
        self.push(
            node,
            PendingRefs::Function {
                tables: function.depends_on_tables.clone(),
                functions: function.depends_on_functions.clone(),
                defaults: function.schema_defaults.clone(),
            },
        )
    }

    /// Add a test. It depends on exactly the table it validates.
    pub fn add_test_node(&mut self, test: &ParsedTest) -> CoreResult<()> {
        let id = NodeId::normalized(&test.id).ok_or_else(|| CoreError::EmptyName {
            context: "test id".into(),
        })?;
        let target_table =
            self.qualify_id(&test.target_table, &test.schema_defaults, "test target table")?;
        // The referenced table is qualified but not tracked as an edge
        let check = match &test.check {
            TestCheck::Relationships { to, field } => TestCheck::Relationships {
                to: self
                    .qualify_id(to, &test.schema_defaults, "relationships target")?
                    .into_inner(),
                field: field.clone(),
            },
            other => other.clone(),
        };
        let node = Node {
            id,
            depends_on: BTreeSet::new(),
            detail: NodeDetail::Test(TestSpec {
                target_table,
                target_column: test.target_column.clone(),
                severity: test.severity,
                check,
            }),
        };
        self.push(node, PendingRefs::Test)
    }

    /// Resolve every captured reference and produce the graph.
    ///
    /// References that match no node are untracked external leaves: they
    /// produce a diagnostic but no edge.
    pub fn build(mut self) -> CoreResult<DependencyGraph> {
        let refs = std::mem::take(&mut self.refs);
        for (rank, pending) in refs.into_iter().enumerate() {
            let deps = self.resolve_pending(rank, pending);
            self.nodes[rank].depends_on = deps;
        }

        let mut graph = DiGraph::with_capacity(self.nodes.len(), 0);
        let mut node_map = HashMap::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let idx = graph.add_node(node.id.clone());
            node_map.insert(node.id.clone(), idx);
        }
        for node in &self.nodes {
            let consumer = node_map[&node.id];
            for dep in &node.depends_on {
                // Edge goes producer -> consumer so successors are dependents
                graph.add_edge(node_map[dep], consumer, ());
            }
        }

        log::debug!(
            "Built dependency graph: {} nodes, {} edges, {} diagnostics",
            graph.node_count(),
            graph.edge_count(),
            self.diagnostics.len()
        );

        Ok(DependencyGraph {
            graph,
            nodes: self.nodes,
            node_map,
            diagnostics: self.diagnostics,
        })
    }

    fn qualify_id(
        &self,
        raw: &str,
        defaults: &SchemaDefaults,
        context: &str,
    ) -> CoreResult<NodeId> {
        match self.resolver.resolve_table(raw, defaults) {
            Resolution::Resolved(id) => Ok(id),
            Resolution::NotFound { .. } => Err(CoreError::EmptyName {
                context: context.to_string(),
            }),
        }
    }

    fn push(&mut self, node: Node, refs: PendingRefs) -> CoreResult<()> {
        if self.index.contains_key(&node.id) {
            return Err(CoreError::DuplicateNode {
                id: node.id.into_inner(),
            });
        }
        self.index.insert(node.id.clone(), self.nodes.len());
        self.nodes.push(node);
        self.refs.push(refs);
        Ok(())
    }

    fn resolve_pending(&mut self, rank: usize, pending: PendingRefs) -> BTreeSet<NodeId> {
        let own_id = self.nodes[rank].id.clone();
        let mut deps = BTreeSet::new();

        match pending {
            PendingRefs::Table {
                tables,
                functions,
                defaults,
            }
            | PendingRefs::Function {
                tables,
                functions,
                defaults,
            } => {
                for reference in &tables {
                    let resolution = self.resolver.resolve_table(reference, &defaults);
                    self.track(&own_id, reference, resolution, NodeKind::Table, &mut deps);
                }
                for reference in &functions {
                    let resolution = self.resolver.resolve_function(reference, &defaults);
                    self.track(&own_id, reference, resolution, NodeKind::Function, &mut deps);
                }
            }
            PendingRefs::Test => {
                if let Some(spec) = self.nodes[rank].as_test() {
                    let target = spec.target_table.clone();
                    if self.kind_of(&target) == Some(NodeKind::Table) {
                        deps.insert(target);
                    } else {
                        log::warn!("Test '{}' targets untracked table '{}'", own_id, target);
                        self.diagnostics.push(Diagnostic::new(
                            DiagnosticKind::ExternalTestTarget,
                            own_id.as_str(),
                            format!("target '{}' is not produced by any model", target),
                        ));
                    }
                }
            }
        }

        deps
    }

    /// Record an edge for `resolution` when it names a node of `expected` kind
    fn track(
        &mut self,
        own_id: &NodeId,
        reference: &str,
        resolution: Resolution,
        expected: NodeKind,
        deps: &mut BTreeSet<NodeId>,
    ) {
        let Resolution::Resolved(id) = resolution else {
            self.unresolved(own_id, reference);
            return;
        };
        if &id == own_id {
            log::debug!("Ignoring self-reference of '{}'", own_id);
            self.diagnostics.push(Diagnostic::new(
                DiagnosticKind::SelfReference,
                own_id.as_str(),
                format!("reference '{}' points at the node itself", reference),
            ));
            return;
        }
        if self.kind_of(&id) == Some(expected) {
            deps.insert(id);
        } else {
            self.unresolved(own_id, reference);
        }
    }

    fn unresolved(&mut self, own_id: &NodeId, reference: &str) {
        log::warn!(
            "'{}' references '{}' which no node produces; treating it as external",
            own_id,
            reference
        );
        self.diagnostics.push(Diagnostic::new(
            DiagnosticKind::UnresolvedReference,
            own_id.as_str(),
            format!("'{}' is not a known node, treated as external", reference),
        ));
    }

    fn kind_of(&self, id: &NodeId) -> Option<NodeKind> {
        self.index.get(id).map(|&i| self.nodes[i].kind())
    }
}

/// A linear, dependency-respecting sequence of node ids
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOrder {
    ids: Vec<NodeId>,
    ranks: Vec<usize>,
}

impl ExecutionOrder {
    /// Ordered ids
    pub fn ids(&self) -> &[NodeId] {
        &self.ids
    }

    /// Discovery ranks of the ordered nodes (indices into the graph)
    pub fn ranks(&self) -> &[usize] {
        &self.ranks
    }

    /// Position of `id` within the order
    pub fn position(&self, id: &str) -> Option<usize> {
        self.ids.iter().position(|n| n == id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeId> {
        self.ids.iter()
    }
}

/// Directed acyclic graph of nodes, edges pointing producer -> consumer.
///
/// Built once per invocation and discarded afterwards.
#[derive(Debug)]
pub struct DependencyGraph {
    graph: DiGraph<NodeId, ()>,
    nodes: Vec<Node>,
    node_map: HashMap<NodeId, NodeIndex>,
    diagnostics: Vec<Diagnostic>,
}

impl DependencyGraph {
    /// Number of nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in discovery order
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Look up a node by id
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.rank_of(id).map(|r| &self.nodes[r])
    }

    /// Discovery rank of a node
    pub fn rank_of(&self, id: &str) -> Option<usize> {
        self.node_map.get(id).map(|idx| idx.index())
    }

    /// Check if a node exists
    pub fn contains(&self, id: &str) -> bool {
        self.node_map.contains_key(id)
    }

    /// Soft warnings gathered while building
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Nodes of one kind, in discovery order
    pub fn nodes_of_kind(&self, kind: NodeKind) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(move |n| n.kind() == kind)
    }

    /// Ranks of the direct dependencies of the node at `rank`
    pub fn dependency_ranks(&self, rank: usize) -> Vec<usize> {
        self.neighbor_ranks(rank, Direction::Incoming)
    }

    /// Ranks of the direct dependents of the node at `rank`
    pub fn dependent_ranks(&self, rank: usize) -> Vec<usize> {
        self.neighbor_ranks(rank, Direction::Outgoing)
    }

    /// Ranks of every node transitively depending on the node at `rank`
    pub fn descendant_ranks(&self, rank: usize) -> Vec<usize> {
        self.reachable(rank, Direction::Outgoing)
    }

    /// Direct dependencies of a node
    pub fn dependencies(&self, id: &str) -> Vec<NodeId> {
        self.map_ranks(id, |r| self.dependency_ranks(r))
    }

    /// Direct dependents of a node
    pub fn dependents(&self, id: &str) -> Vec<NodeId> {
        self.map_ranks(id, |r| self.dependent_ranks(r))
    }

    /// All transitive dependents of a node
    pub fn descendants(&self, id: &str) -> Vec<NodeId> {
        self.map_ranks(id, |r| self.reachable(r, Direction::Outgoing))
    }

    /// All transitive dependencies of a node
    pub fn ancestors(&self, id: &str) -> Vec<NodeId> {
        self.map_ranks(id, |r| self.reachable(r, Direction::Incoming))
    }

    /// Order the nodes so every producer precedes its consumers.
    ///
    /// Kahn's algorithm; among ready nodes the one with the smallest
    /// discovery rank goes first, so identical inputs always yield the same
    /// sequence. A cycle is reported with every node on it.
    pub fn topological_order(&self) -> CoreResult<ExecutionOrder> {
        let n = self.nodes.len();
        let mut in_degree: Vec<usize> = (0..n)
            .map(|r| {
                self.graph
                    .neighbors_directed(NodeIndex::new(r), Direction::Incoming)
                    .count()
            })
            .collect();

        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &d)| d == 0)
            .map(|(r, _)| Reverse(r))
            .collect();

        let mut ranks = Vec::with_capacity(n);
        while let Some(Reverse(rank)) = ready.pop() {
            ranks.push(rank);
            for succ in self
                .graph
                .neighbors_directed(NodeIndex::new(rank), Direction::Outgoing)
            {
                let d = &mut in_degree[succ.index()];
                *d -= 1;
                if *d == 0 {
                    ready.push(Reverse(succ.index()));
                }
            }
        }

        if ranks.len() < n {
            let stalled: Vec<bool> = in_degree.iter().map(|&d| d > 0).collect();
            let cycle = self
                .find_cycle(&stalled)
                .into_iter()
                .map(|r| self.nodes[r].id.to_string())
                .collect();
            return Err(CoreError::CircularDependency { cycle });
        }

        let ids = ranks.iter().map(|&r| self.nodes[r].id.clone()).collect();
        Ok(ExecutionOrder { ids, ranks })
    }

    /// Select nodes with `+name` (ancestors) / `name+` (descendants) syntax,
    /// returned in execution order
    pub fn select(&self, selector: &str) -> CoreResult<Vec<NodeId>> {
        let with_ancestors = selector.starts_with('+');
        let with_descendants = selector.ends_with('+');
        let name = selector.trim_start_matches('+').trim_end_matches('+');

        let rank = self
            .lookup(name)
            .ok_or_else(|| CoreError::EmptyName {
                context: format!("selector '{}' (no such node)", selector),
            })?;

        let mut selected: HashSet<usize> = HashSet::from([rank]);
        if with_ancestors {
            selected.extend(self.reachable(rank, Direction::Incoming));
        }
        if with_descendants {
            selected.extend(self.reachable(rank, Direction::Outgoing));
        }

        let order = self.topological_order()?;
        Ok(order
            .ranks
            .iter()
            .zip(order.ids)
            .filter(|(r, _)| selected.contains(r))
            .map(|(_, id)| id)
            .collect())
    }

    /// Find a node by exact id, falling back to a unique short name
    fn lookup(&self, name: &str) -> Option<usize> {
        let id = NodeId::normalized(name)?;
        if let Some(r) = self.rank_of(&id) {
            return Some(r);
        }
        let mut matches = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.id.short_name() == id.as_str());
        match (matches.next(), matches.next()) {
            (Some((r, _)), None) => Some(r),
            _ => None,
        }
    }

    fn neighbor_ranks(&self, rank: usize, direction: Direction) -> Vec<usize> {
        let mut out: Vec<usize> = self
            .graph
            .neighbors_directed(NodeIndex::new(rank), direction)
            .map(|idx| idx.index())
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    /// DFS from `start` following `direction`; result sorted by rank
    fn reachable(&self, start: usize, direction: Direction) -> Vec<usize> {
        let mut visited = HashSet::new();
        let mut stack = vec![start];
        while let Some(current) = stack.pop() {
            for next in self
                .graph
                .neighbors_directed(NodeIndex::new(current), direction)
            {
                if visited.insert(next.index()) {
                    stack.push(next.index());
                }
            }
        }
        let mut out: Vec<usize> = visited.into_iter().collect();
        out.sort_unstable();
        out
    }

    fn map_ranks(&self, id: &str, f: impl Fn(usize) -> Vec<usize>) -> Vec<NodeId> {
        match self.rank_of(id) {
            Some(rank) => f(rank)
                .into_iter()
                .map(|r| self.nodes[r].id.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Locate one cycle among the nodes Kahn's algorithm could not schedule.
    ///
    /// Iterative DFS restricted to stalled nodes; the first back edge closes
    /// the cycle, which is returned in producer -> consumer order.
    fn find_cycle(&self, stalled: &[bool]) -> Vec<usize> {
        const WHITE: u8 = 0;
        const GREY: u8 = 1;
        const BLACK: u8 = 2;

        let successors = |r: usize| -> Vec<usize> {
            let mut s: Vec<usize> = self
                .graph
                .neighbors_directed(NodeIndex::new(r), Direction::Outgoing)
                .map(|i| i.index())
                .filter(|&i| stalled[i])
                .collect();
            s.sort_unstable();
            s
        };

        let mut color = vec![WHITE; stalled.len()];
        for start in (0..stalled.len()).filter(|&r| stalled[r]) {
            if color[start] != WHITE {
                continue;
            }
            let mut path = vec![start];
            let mut frames = vec![(successors(start), 0usize)];
            color[start] = GREY;

            while let Some((succs, cursor)) = frames.last_mut() {
                let next = succs.get(*cursor).copied();
                *cursor += 1;
                match next {
                    Some(next) if color[next] == GREY => {
                        if let Some(pos) = path.iter().position(|&p| p == next) {
                            return path[pos..].to_vec();
                        }
                    }
                    Some(next) if color[next] == WHITE => {
                        color[next] = GREY;
                        path.push(next);
                        frames.push((successors(next), 0));
                    }
                    Some(_) => {}
                    None => {
                        if let Some(done) = path.pop() {
                            color[done] = BLACK;
                        }
                        frames.pop();
                    }
                }
            }
        }

        // Unreachable for a stalled set, which always contains a cycle
        (0..stalled.len()).filter(|&r| stalled[r]).collect()
    }
}

#[cfg(test)]
#[path = "dag_test.rs"]
mod tests;
