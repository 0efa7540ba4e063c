//! Startup-order resolution for configuration objects.
//!
//! Services name their targets, monitors name their servers; those
//! references form a graph that has to be constructed dependencies-first
//! and must not contain cycles. Tarjan's strongly-connected-components
//! algorithm gives both answers in one pass: components are identified
//! before the nodes that depend on them, so the component order doubles
//! as the construction order, and any component with more than one
//! member is a cycle.

use std::collections::HashMap;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DependencyError {
    #[error("'{from}' references unknown object '{to}'")]
    UnknownReference { from: String, to: String },

    #[error("a circular dependency chain was found in the configuration: {chain}")]
    Cycle { chain: String },
}

/// One named object and the names it depends on
#[derive(Debug, Clone)]
pub struct DependencyNode {
    pub name: String,
    pub depends_on: Vec<String>,
}

const NOT_VISITED: usize = usize::MAX;

struct TarjanState<'a> {
    nodes: &'a [DependencyNode],
    edges: Vec<Vec<usize>>,
    index: Vec<usize>,
    lowlink: Vec<usize>,
    on_stack: Vec<bool>,
    stack: Vec<usize>,
    next_index: usize,
    groups: Vec<Vec<usize>>,
}

impl<'a> TarjanState<'a> {
    fn visit(&mut self, n: usize) {
        self.index[n] = self.next_index;
        self.lowlink[n] = self.next_index;
        self.next_index += 1;
        self.stack.push(n);
        self.on_stack[n] = true;

        for i in 0..self.edges[n].len() {
            let s = self.edges[n][i];
            if self.index[s] == NOT_VISITED {
                self.visit(s);
                self.lowlink[n] = self.lowlink[n].min(self.lowlink[s]);
            } else if s == n {
                // A self-reference never forms a component of more than one
                // node; record it as an explicit two-entry group so it is
                // reported as a cycle.
                self.groups.push(vec![n, s]);
            } else if self.on_stack[s] {
                self.lowlink[n] = self.lowlink[n].min(self.index[s]);
            }
        }

        if self.index[n] == self.lowlink[n] {
            let mut group = Vec::new();
            loop {
                let c = self.stack.pop().unwrap();
                self.on_stack[c] = false;
                group.push(c);
                if c == n {
                    break;
                }
            }
            self.groups.push(group);
        }
    }
}

/// Sort objects so that every object comes after everything it depends
/// on. A cycle aborts with an error naming its members in dependency
/// order.
pub fn resolve_order(nodes: &[DependencyNode]) -> Result<Vec<String>, DependencyError> {
    let positions: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.name.as_str(), i))
        .collect();

    let mut edges = vec![Vec::new(); nodes.len()];
    for (i, node) in nodes.iter().enumerate() {
        for dep in &node.depends_on {
            let j = positions.get(dep.as_str()).ok_or_else(|| {
                DependencyError::UnknownReference {
                    from: node.name.clone(),
                    to: dep.clone(),
                }
            })?;
            edges[i].push(*j);
        }
    }

    let mut state = TarjanState {
        nodes,
        edges,
        index: vec![NOT_VISITED; nodes.len()],
        lowlink: vec![NOT_VISITED; nodes.len()],
        on_stack: vec![false; nodes.len()],
        stack: Vec::new(),
        next_index: 1,
        groups: Vec::new(),
    };

    for n in 0..nodes.len() {
        if state.index[n] == NOT_VISITED {
            state.visit(n);
        }
    }

    let mut order = Vec::with_capacity(nodes.len());
    for group in &state.groups {
        if group.len() > 1 {
            let mut chain: Vec<&str> =
                group.iter().map(|&i| state.nodes[i].name.as_str()).collect();
            chain.push(chain[0]);
            return Err(DependencyError::Cycle {
                chain: chain.join(" -> "),
            });
        }
        order.push(state.nodes[group[0]].name.clone());
    }

    Ok(order)
}
