//! Jump dependency graphs.
//!
//! `dep_graph[k]` is the set of jumps whose rate reads at least one
//! species written by jump `k`; firing `k` requires recomputing exactly
//! those rates. Self-dependencies are always present.

use crate::rates::JumpSystem;
use crate::SimError;

/// Species-to-dependent-jumps map: `out[s]` lists every jump whose rate
/// reads species `s`.
pub fn build_var_to_jumps(n_species: usize, sys: &JumpSystem) -> Vec<Vec<usize>> {
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n_species];
    for k in 0..sys.num_mass_action() {
        for &(species, _) in sys.mass_action.reactants(k) {
            if !dependents[species].contains(&k) {
                dependents[species].push(k);
            }
        }
    }
    let offset = sys.num_mass_action();
    for (j, reads) in sys.rate_reads.iter().enumerate() {
        for &species in reads {
            if !dependents[species].contains(&(offset + j)) {
                dependents[species].push(offset + j);
            }
        }
    }
    dependents
}

/// Build the jump-to-jump dependency graph, or validate and return the
/// explicit one carried by the system.
pub fn build_dep_graph(n_species: usize, sys: &JumpSystem) -> Result<Vec<Vec<usize>>, SimError> {
    let n_jumps = sys.num_jumps();
    if let Some(graph) = &sys.dep_graph {
        validate_dep_graph(graph, n_jumps)?;
        let mut graph = graph.clone();
        for (k, deps) in graph.iter_mut().enumerate() {
            if !deps.contains(&k) {
                deps.push(k);
            }
        }
        return Ok(graph);
    }

    let species_dependents = build_var_to_jumps(n_species, sys);
    let m = sys.num_mass_action();
    let mut dependencies = vec![Vec::new(); n_jumps];
    let mut visit_markers = vec![0usize; n_jumps];
    let mut stamp = 1usize;
    for (k, deps) in dependencies.iter_mut().enumerate() {
        if stamp == usize::MAX {
            visit_markers.fill(0);
            stamp = 1;
        }
        let mark = stamp;
        stamp += 1;

        visit_markers[k] = mark;
        deps.push(k);
        let writes: &[_] = if k < m {
            sys.mass_action.net_stoch(k)
        } else {
            &[]
        };
        let mut visit = |species: usize, deps: &mut Vec<usize>| {
            for &dep in &species_dependents[species] {
                if visit_markers[dep] != mark {
                    visit_markers[dep] = mark;
                    deps.push(dep);
                }
            }
        };
        for &(species, _) in writes {
            visit(species, deps);
        }
        if k >= m {
            for &species in &sys.rate_writes[k - m] {
                visit(species, deps);
            }
        }
    }
    Ok(dependencies)
}

/// Node-count and edge-range validation of an explicit dependency graph.
pub fn validate_dep_graph(graph: &[Vec<usize>], n_jumps: usize) -> Result<(), SimError> {
    if graph.len() != n_jumps {
        return Err(SimError::Configuration(format!(
            "dependency graph has {} nodes but the system has {} jumps",
            graph.len(),
            n_jumps
        )));
    }
    for (k, deps) in graph.iter().enumerate() {
        if deps.iter().any(|&j| j >= n_jumps) {
            return Err(SimError::Configuration(format!(
                "dependency graph node {} references a jump >= {}",
                k, n_jumps
            )));
        }
    }
    Ok(())
}
