use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

// ---------------------------------------------------------------------------
// Call graph over callable symbols
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallableKind {
    Function,
    Method,
    Constructor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallableSymbol {
    pub id: String,
    pub name: String,
    pub kind: CallableKind,
    pub file: String,
    pub line: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSite {
    pub caller: String,
    pub callee: String,
    pub file: String,
    pub line: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainDirection {
    Callers,
    Callees,
}

/// Where outgoing calls come from. The language-server integration lives
/// behind this trait; tests use an in-memory table.
pub trait SymbolSource {
    fn outgoing_calls(&self, symbol: &CallableSymbol) -> Vec<(CallableSymbol, CallSite)>;
}

pub const DEFAULT_MAX_FUNCTIONS: usize = 500;

#[derive(Debug, Default)]
pub struct CallGraph {
    symbols: HashMap<String, CallableSymbol>,
    calls: Vec<CallSite>,
    outgoing: HashMap<String, Vec<usize>>,
    incoming: HashMap<String, Vec<usize>>,
}

impl CallGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build by walking outgoing calls breadth-first from the roots,
    /// capped at `max_functions` symbols.
    pub fn build(
        source: &dyn SymbolSource,
        roots: Vec<CallableSymbol>,
        max_functions: usize,
    ) -> Self {
        let mut graph = Self::new();
        let mut queue: VecDeque<CallableSymbol> = VecDeque::new();
        for root in roots {
            if graph.symbols.len() >= max_functions {
                break;
            }
            if !graph.symbols.contains_key(&root.id) {
                graph.symbols.insert(root.id.clone(), root.clone());
                queue.push_back(root);
            }
        }
        while let Some(symbol) = queue.pop_front() {
            for (callee, site) in source.outgoing_calls(&symbol) {
                if !graph.symbols.contains_key(&callee.id) {
                    if graph.symbols.len() >= max_functions {
                        continue;
                    }
                    graph.symbols.insert(callee.id.clone(), callee.clone());
                    queue.push_back(callee);
                }
                graph.add_call(site);
            }
        }
        graph
    }

    pub fn add_symbol(&mut self, symbol: CallableSymbol) {
        self.symbols.insert(symbol.id.clone(), symbol);
    }

    pub fn add_call(&mut self, site: CallSite) {
        let idx = self.calls.len();
        self.outgoing
            .entry(site.caller.clone())
            .or_default()
            .push(idx);
        self.incoming
            .entry(site.callee.clone())
            .or_default()
            .push(idx);
        self.calls.push(site);
    }

    pub fn symbol_count(&self) -> usize {
        self.symbols.len()
    }

    pub fn get_callers(&self, id: &str) -> Vec<&CallableSymbol> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for idx in self.incoming.get(id).into_iter().flatten() {
            let caller = self.calls[*idx].caller.as_str();
            if seen.insert(caller) {
                if let Some(symbol) = self.symbols.get(caller) {
                    out.push(symbol);
                }
            }
        }
        out
    }

    pub fn get_callees(&self, id: &str) -> Vec<&CallableSymbol> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for idx in self.outgoing.get(id).into_iter().flatten() {
            let callee = self.calls[*idx].callee.as_str();
            if seen.insert(callee) {
                if let Some(symbol) = self.symbols.get(callee) {
                    out.push(symbol);
                }
            }
        }
        out
    }

    /// All call chains from `start` up to `depth` hops, walking callers or
    /// callees. Each chain starts with `start`.
    pub fn analyze_call_chain(
        &self,
        start: &str,
        depth: usize,
        direction: ChainDirection,
    ) -> Vec<Vec<String>> {
        let mut chains = Vec::new();
        if !self.symbols.contains_key(start) {
            return chains;
        }
        let mut path = vec![start.to_string()];
        self.walk_chain(start, depth, direction, &mut path, &mut chains);
        chains
    }

    fn walk_chain(
        &self,
        current: &str,
        remaining: usize,
        direction: ChainDirection,
        path: &mut Vec<String>,
        chains: &mut Vec<Vec<String>>,
    ) {
        let next: Vec<&CallableSymbol> = match direction {
            ChainDirection::Callers => self.get_callers(current),
            ChainDirection::Callees => self.get_callees(current),
        };
        let extendable: Vec<&CallableSymbol> = next
            .into_iter()
            .filter(|s| !path.contains(&s.id))
            .collect();
        if remaining == 0 || extendable.is_empty() {
            if path.len() > 1 {
                chains.push(path.clone());
            }
            return;
        }
        for symbol in extendable {
            path.push(symbol.id.clone());
            self.walk_chain(&symbol.id, remaining - 1, direction, path, chains);
            path.pop();
        }
    }

    /// Most-connected symbols (callers + callees), busiest first.
    pub fn find_hotspots(&self, limit: usize) -> Vec<(&CallableSymbol, usize)> {
        let mut scored: Vec<(&CallableSymbol, usize)> = self
            .symbols
            .values()
            .map(|s| {
                let degree = self.incoming.get(&s.id).map(Vec::len).unwrap_or(0)
                    + self.outgoing.get(&s.id).map(Vec::len).unwrap_or(0);
                (s, degree)
            })
            .collect();
        scored.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.id.cmp(&b.0.id)));
        scored.truncate(limit);
        scored
    }

    /// Direct and mutual recursion cycles in the call relation.
    pub fn detect_recursion(&self) -> Vec<Vec<String>> {
        let mut cycles = Vec::new();
        let mut visited: HashSet<&str> = HashSet::new();
        let mut ids: Vec<&str> = self.symbols.keys().map(String::as_str).collect();
        ids.sort();
        for start in ids {
            if visited.contains(start) {
                continue;
            }
            let mut stack = Vec::new();
            let mut on_stack = HashSet::new();
            self.dfs_recursion(start, &mut visited, &mut stack, &mut on_stack, &mut cycles);
        }
        cycles
    }

    fn dfs_recursion<'a>(
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
            let callee = self.calls[*idx].callee.as_str();
            if on_stack.contains(callee) {
                let pos = stack.iter().position(|n| *n == callee).unwrap_or(0);
                cycles.push(stack[pos..].iter().map(|s| s.to_string()).collect());
            } else if !visited.contains(callee) && self.symbols.contains_key(callee) {
                self.dfs_recursion(callee, visited, stack, on_stack, cycles);
            }
        }
        stack.pop();
        on_stack.remove(current);
    }
}
