//! Dependency graph resolution for module init ordering.
//!
//! Init order is topological by `dependsOn` with alphabetical tie-break, so
//! the order is total and reproducible across runs.

use std::collections::{BinaryHeap, HashMap};

use crate::config::ModuleConfig;
use crate::error::EngineError;

/// Compute the init order as indices into `modules`.
///
/// Fails on duplicate names, references to undeclared modules, and cycles
/// (reporting the cycle path).
pub fn init_order(modules: &[ModuleConfig]) -> Result<Vec<usize>, EngineError> {
    let mut idx: HashMap<&str, usize> = HashMap::with_capacity(modules.len());
    for (i, m) in modules.iter().enumerate() {
        if idx.insert(m.name.as_str(), i).is_some() {
            return Err(EngineError::DuplicateModule(m.name.clone()));
        }
    }

    // adj[v] lists modules that depend on v (edge dep -> dependent).
    let mut adj = vec![Vec::<usize>::new(); modules.len()];
    let mut indeg = vec![0usize; modules.len()];
    for (u, m) in modules.iter().enumerate() {
        for dep in &m.depends_on {
            let v = *idx
                .get(dep.as_str())
                .ok_or_else(|| EngineError::UnknownDependency {
                    module: m.name.clone(),
                    depends_on: dep.clone(),
                })?;
            adj[v].push(u);
            indeg[u] += 1;
        }
    }

    if let Some(path) = detect_cycle_with_path(modules, &adj) {
        return Err(EngineError::CycleDetected { path });
    }

    // Kahn's algorithm with a min-heap on module name: among modules whose
    // dependencies are all satisfied, the alphabetically smallest inits
    // first.
    let mut ready: BinaryHeap<std::cmp::Reverse<(&str, usize)>> = indeg
        .iter()
        .enumerate()
        .filter(|(_, &d)| d == 0)
        .map(|(i, _)| std::cmp::Reverse((modules[i].name.as_str(), i)))
        .collect();

    let mut order = Vec::with_capacity(modules.len());
    while let Some(std::cmp::Reverse((_, u))) = ready.pop() {
        order.push(u);
        for &w in &adj[u] {
            indeg[w] -= 1;
            if indeg[w] == 0 {
                ready.push(std::cmp::Reverse((modules[w].name.as_str(), w)));
            }
        }
    }

    tracing::info!(
        modules = ?order.iter().map(|&i| modules[i].name.as_str()).collect::<Vec<_>>(),
        "Module init order resolved (topo, alphabetical tie-break)"
    );

    Ok(order)
}

/// DFS with path tracking; returns the cycle path if one exists.
fn detect_cycle_with_path(modules: &[ModuleConfig], adj: &[Vec<usize>]) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White, // unvisited
        Gray,  // visiting (on current path)
        Black, // visited (finished)
    }

    fn dfs(
        node: usize,
        modules: &[ModuleConfig],
        adj: &[Vec<usize>],
        colors: &mut [Color],
        path: &mut Vec<usize>,
    ) -> Option<Vec<String>> {
        colors[node] = Color::Gray;
        path.push(node);

        for &neighbor in &adj[node] {
            match colors[neighbor] {
                Color::Gray => {
                    // Back edge: close the cycle starting at the neighbor.
                    if let Some(start) = path.iter().position(|&n| n == neighbor) {
                        let mut cycle: Vec<String> = path[start..]
                            .iter()
                            .map(|&i| modules[i].name.clone())
                            .collect();
                        cycle.push(modules[neighbor].name.clone());
                        return Some(cycle);
                    }
                }
                Color::White => {
                    if let Some(cycle) = dfs(neighbor, modules, adj, colors, path) {
                        return Some(cycle);
                    }
                }
                Color::Black => {}
            }
        }

        path.pop();
        colors[node] = Color::Black;
        None
    }

    let mut colors = vec![Color::White; modules.len()];
    let mut path = Vec::new();
    for i in 0..modules.len() {
        if colors[i] == Color::White {
            if let Some(cycle) = dfs(i, modules, adj, &mut colors, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}
