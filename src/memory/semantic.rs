use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

// ---------------------------------------------------------------------------
// Semantic code graph
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Function,
    Class,
    Interface,
    Type,
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    Imports,
    Exports,
    Extends,
    Implements,
    Calls,
    Instantiates,
    References,
    Contains,
    Related,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticNode {
    pub id: String,
    pub name: String,
    pub kind: NodeKind,
    pub file: String,
    #[serde(default)]
    pub line: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticEdge {
    pub source: String,
    pub target: String,
    pub kind: EdgeKind,
    /// Clamped to [0, 1].
    pub weight: f64,
}

/// ID→node map with inline adjacency and reverse adjacency, so neighbor
/// lookups are O(1) and nodes never reference each other directly.
#[derive(Debug, Default)]
pub struct SemanticGraph {
    nodes: HashMap<String, SemanticNode>,
    edges: Vec<SemanticEdge>,
    outgoing: HashMap<String, Vec<usize>>,
    incoming: HashMap<String, Vec<usize>>,
}

impl SemanticGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: SemanticNode) {
        self.nodes.insert(node.id.clone(), node);
    }

    pub fn add_edge(&mut self, source: &str, target: &str, kind: EdgeKind, weight: f64) -> bool {
        if !self.nodes.contains_key(source) || !self.nodes.contains_key(target) {
            return false;
        }
        let idx = self.edges.len();
        self.edges.push(SemanticEdge {
            source: source.to_string(),
            target: target.to_string(),
            kind,
            weight: weight.clamp(0.0, 1.0),
        });
        self.outgoing.entry(source.to_string()).or_default().push(idx);
        self.incoming.entry(target.to_string()).or_default().push(idx);
        true
    }

    pub fn node(&self, id: &str) -> Option<&SemanticNode> {
        self.nodes.get(id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn neighbors(&self, id: &str) -> Vec<&SemanticNode> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for idx in self.outgoing.get(id).into_iter().flatten() {
            let target = &self.edges[*idx].target;
            if seen.insert(target.as_str()) {
                if let Some(node) = self.nodes.get(target) {
                    out.push(node);
                }
            }
        }
        for idx in self.incoming.get(id).into_iter().flatten() {
            let source = &self.edges[*idx].source;
            if seen.insert(source.as_str()) {
                if let Some(node) = self.nodes.get(source) {
                    out.push(node);
                }
            }
        }
        out
    }

    /// BFS in both edge directions up to `max_depth`; results carry their
    /// distance from the start node, nearest first.
    pub fn find_related_nodes(&self, id: &str, max_depth: usize) -> Vec<(&SemanticNode, usize)> {
        let mut results = Vec::new();
        if !self.nodes.contains_key(id) {
            return results;
        }
        let mut visited: HashSet<&str> = HashSet::from([id]);
        let mut queue: VecDeque<(&str, usize)> = VecDeque::from([(id, 0)]);
        while let Some((current, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            for neighbor in self.neighbor_ids(current) {
                if visited.insert(neighbor) {
                    if let Some(node) = self.nodes.get(neighbor) {
                        results.push((node, depth + 1));
                    }
                    queue.push_back((neighbor, depth + 1));
                }
            }
        }
        results
    }

    /// Shortest directed path by BFS; `None` when unreachable.
    pub fn find_shortest_path(&self, from: &str, to: &str) -> Option<Vec<String>> {
        if !self.nodes.contains_key(from) || !self.nodes.contains_key(to) {
            return None;
        }
        if from == to {
            return Some(vec![from.to_string()]);
        }
        let mut prev: HashMap<&str, &str> = HashMap::new();
        let mut queue: VecDeque<&str> = VecDeque::from([from]);
        let mut visited: HashSet<&str> = HashSet::from([from]);
        while let Some(current) = queue.pop_front() {
            for idx in self.outgoing.get(current).into_iter().flatten() {
                let target = self.edges[*idx].target.as_str();
                if visited.insert(target) {
                    prev.insert(target, current);
                    if target == to {
                        let mut path = vec![to.to_string()];
                        let mut cursor = to;
                        while let Some(p) = prev.get(cursor) {
                            path.push(p.to_string());
                            cursor = p;
                        }
                        path.reverse();
                        return Some(path);
                    }
                    queue.push_back(target);
                }
            }
        }
        None
    }

    /// Directed cycles found by DFS, each reported once from its entry node.
    pub fn find_cycles(&self) -> Vec<Vec<String>> {
        let mut cycles = Vec::new();
        let mut visited: HashSet<&str> = HashSet::new();
        let mut ids: Vec<&str> = self.nodes.keys().map(String::as_str).collect();
        ids.sort();
        for start in ids {
            if visited.contains(start) {
                continue;
            }
            let mut stack: Vec<&str> = Vec::new();
            let mut on_stack: HashSet<&str> = HashSet::new();
            self.dfs_cycles(start, &mut visited, &mut stack, &mut on_stack, &mut cycles);
        }
        cycles
    }

    fn dfs_cycles<'a>(
        &'a self,
        current: &'a str,
        visited: &mut HashSet<&'a str>,
        stack: &mut Vec<&'a str>,
        on_stack: &mut HashSet<&'a str>,
        cycles: &mut Vec<Vec<String>>,
    ) {
        visited.insert(current);
        stack.push(current);
        on_stack.insert(current);
        for idx in self.outgoing.get(current).into_iter().flatten() {
            let target = self.edges[*idx].target.as_str();
            if on_stack.contains(target) {
                let pos = stack.iter().position(|n| *n == target).unwrap_or(0);
                cycles.push(stack[pos..].iter().map(|s| s.to_string()).collect());
            } else if !visited.contains(target) {
                self.dfs_cycles(target, visited, stack, on_stack, cycles);
            }
        }
        stack.pop();
        on_stack.remove(current);
    }

    fn neighbor_ids(&self, id: &str) -> Vec<&str> {
        let mut out = Vec::new();
        for idx in self.outgoing.get(id).into_iter().flatten() {
            out.push(self.edges[*idx].target.as_str());
        }
        for idx in self.incoming.get(id).into_iter().flatten() {
            out.push(self.edges[*idx].source.as_str());
        }
        out
    }

    /// Nodes declared in a file, for relevance ranking.
    pub fn nodes_in_file(&self, file: &str) -> Vec<&SemanticNode> {
        let mut nodes: Vec<&SemanticNode> =
            self.nodes.values().filter(|n| n.file == file).collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }
}
