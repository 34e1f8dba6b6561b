//! Dependency scheduler.
//!
//! Turns the registry's dependency graph into an ordered list of
//! [`BootBatch`]es.  Kernels inside one batch have no edges between them and
//! are started concurrently; batches run strictly in sequence.
//!
//! # Algorithm
//!
//! 1. Validate that every edge references a registered kernel.
//! 2. Depth-first search with an explicit recursion stack.  Reaching a kernel
//!    that is still on the stack is a cycle; the offending path is returned
//!    in [`KernosError::CyclicDependency`] and nothing is scheduled.
//! 3. `level(k) = 0` for dependency-free kernels, otherwise
//!    `1 + max(level(d))` over its dependencies.
//! 4. Group by level; order each batch by `(tier, id)` so logs are stable.

use std::collections::{BTreeMap, HashMap};

use kernos_types::KernosError;
use serde::Serialize;

use crate::registry::KernelRegistry;

/// One group of kernels that may be started concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootBatch {
    pub index: usize,
    pub kernels: Vec<String>,
}

/// Compute the boot batches for `registry`.
///
/// # Errors
///
/// - [`KernosError::UnknownDependency`] – an edge names an unregistered kernel.
/// - [`KernosError::CyclicDependency`] – the graph contains a cycle.
pub fn schedule(registry: &KernelRegistry) -> Result<Vec<BootBatch>, KernosError> {
    registry.validate()?;
    if let Some(cycle) = find_cycle(registry) {
        return Err(KernosError::CyclicDependency { cycle });
    }

    let mut levels: HashMap<&str, usize> = HashMap::new();
    for id in registry.ids() {
        level_of(registry, id, &mut levels);
    }

    let mut grouped: BTreeMap<usize, Vec<(u32, &str)>> = BTreeMap::new();
    for kernel in registry.iter() {
        let level = levels.get(kernel.id.as_str()).copied().unwrap_or(0);
        grouped
            .entry(level)
            .or_default()
            .push((kernel.tier, kernel.id.as_str()));
    }

    Ok(grouped
        .into_iter()
        .map(|(index, mut members)| {
            members.sort();
            BootBatch {
                index,
                kernels: members.into_iter().map(|(_, id)| id.to_string()).collect(),
            }
        })
        .collect())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Visit {
    OnStack,
    Done,
}

fn find_cycle(registry: &KernelRegistry) -> Option<Vec<String>> {
    let mut marks: HashMap<&str, Visit> = HashMap::new();
    let mut stack: Vec<&str> = Vec::new();
    for id in registry.ids() {
        if !marks.contains_key(id)
            && let Some(cycle) = visit(registry, id, &mut marks, &mut stack)
        {
            return Some(cycle);
        }
    }
    None
}

fn visit<'a>(
    registry: &'a KernelRegistry,
    id: &'a str,
    marks: &mut HashMap<&'a str, Visit>,
    stack: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    marks.insert(id, Visit::OnStack);
    stack.push(id);

    if let Some(kernel) = registry.get(id) {
        for dep in &kernel.dependencies {
            match marks.get(dep.as_str()) {
                Some(Visit::OnStack) => {
                    let start = stack.iter().position(|k| *k == dep.as_str()).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        stack[start..].iter().map(|k| k.to_string()).collect();
                    cycle.push(dep.clone());
                    return Some(cycle);
                }
                Some(Visit::Done) => {}
                None => {
                    if let Some(cycle) = visit(registry, dep.as_str(), marks, stack) {
                        return Some(cycle);
                    }
                }
            }
        }
    }

    stack.pop();
    marks.insert(id, Visit::Done);
    None
}

fn level_of<'a>(
    registry: &'a KernelRegistry,
    id: &'a str,
    levels: &mut HashMap<&'a str, usize>,
) -> usize {
    if let Some(level) = levels.get(id) {
        return *level;
    }
    let level = match registry.get(id) {
        Some(kernel) if !kernel.dependencies.is_empty() => {
            1 + kernel
                .dependencies
                .iter()
                .map(|d| level_of(registry, d.as_str(), levels))
                .max()
                .unwrap_or(0)
        }
        _ => 0,
    };
    levels.insert(id, level);
    level
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{KernelContext, KernelHandle};
    use crate::registry::KernelDescriptor;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    struct Inert;

    #[async_trait]
    impl KernelHandle for Inert {
        async fn start(&self, ctx: KernelContext) -> Result<(), KernosError> {
            ctx.report_ready();
            Ok(())
        }
        async fn stop(&self, _grace: Duration) -> Result<(), KernosError> {
            Ok(())
        }
    }

    fn registry(spec: &[(&str, u32, &[&str])]) -> KernelRegistry {
        let mut reg = KernelRegistry::new();
        for (id, tier, deps) in spec {
            let mut k = KernelDescriptor::new(*id, Arc::new(Inert)).tier(*tier);
            for d in *deps {
                k = k.depends_on(*d);
            }
            reg.register(k).unwrap();
        }
        reg
    }

    fn batch_index(batches: &[BootBatch]) -> HashMap<&str, usize> {
        batches
            .iter()
            .flat_map(|b| b.kernels.iter().map(move |k| (k.as_str(), b.index)))
            .collect()
    }

    fn assert_edges_respected(reg: &KernelRegistry, batches: &[BootBatch]) {
        let index = batch_index(batches);
        for k in reg.iter() {
            for d in &k.dependencies {
                assert!(
                    index[d.as_str()] < index[k.id.as_str()],
                    "{d} must be scheduled before {}",
                    k.id
                );
            }
        }
    }

    #[test]
    fn two_roots_and_a_dependent() {
        let reg = registry(&[("a", 0, &[]), ("b", 0, &[]), ("c", 1, &["a", "b"])]);
        let batches = schedule(&reg).unwrap();
        assert_eq!(
            batches,
            vec![
                BootBatch { index: 0, kernels: vec!["a".into(), "b".into()] },
                BootBatch { index: 1, kernels: vec!["c".into()] },
            ]
        );
    }

    #[test]
    fn diamond_and_chain() {
        let reg = registry(&[
            ("memory", 0, &[]),
            ("governance", 0, &["memory"]),
            ("ingest", 2, &["memory"]),
            ("chat", 1, &["governance", "ingest"]),
            ("dash", 3, &["chat"]),
        ]);
        let batches = schedule(&reg).unwrap();
        assert_eq!(batches.len(), 4);
        assert_eq!(batches[1].kernels, vec!["governance".to_string(), "ingest".to_string()]);
        assert_edges_respected(&reg, &batches);
    }

    #[test]
    fn tier_orders_within_batch() {
        let reg = registry(&[("z", 0, &[]), ("a", 5, &[]), ("m", 1, &[])]);
        let batches = schedule(&reg).unwrap();
        assert_eq!(batches[0].kernels, vec!["z".to_string(), "m".into(), "a".into()]);
    }

    #[test]
    fn cycle_is_reported_with_its_path() {
        let reg = registry(&[("a", 0, &["c"]), ("b", 0, &["a"]), ("c", 0, &["b"]), ("d", 0, &[])]);
        match schedule(&reg) {
            Err(KernosError::CyclicDependency { cycle }) => {
                assert_eq!(cycle.first(), cycle.last());
                assert_eq!(cycle.len(), 4);
                for id in ["a", "b", "c"] {
                    assert!(cycle.iter().any(|k| k == id));
                }
            }
            other => panic!("expected a cycle, got {other:?}"),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let reg = registry(&[("loner", 0, &["loner"])]);
        assert!(matches!(
            schedule(&reg),
            Err(KernosError::CyclicDependency { cycle }) if cycle == vec!["loner".to_string(), "loner".into()]
        ));
    }

    #[test]
    fn unknown_dependency_is_rejected_before_cycle_search() {
        let reg = registry(&[("chat", 0, &["memory"])]);
        assert!(matches!(schedule(&reg), Err(KernosError::UnknownDependency { .. })));
    }

    #[test]
    fn empty_registry_yields_no_batches() {
        assert!(schedule(&KernelRegistry::new()).unwrap().is_empty());
    }

    #[test]
    fn generated_layered_graphs_respect_edges() {
        // Deterministic pseudo-random DAGs: edges only point to lower indices.
        let mut seed: u64 = 0x9E37_79B9_7F4A_7C15;
        for _ in 0..25 {
            let mut reg = KernelRegistry::new();
            for i in 0..12usize {
                let mut k = KernelDescriptor::new(format!("k{i:02}"), Arc::new(Inert)).tier((i % 3) as u32);
                for j in 0..i {
                    seed ^= seed << 13;
                    seed ^= seed >> 7;
                    seed ^= seed << 17;
                    if seed % 4 == 0 {
                        k = k.depends_on(format!("k{j:02}"));
                    }
                }
                reg.register(k).unwrap();
            }
            let batches = schedule(&reg).unwrap();
            assert_edges_respected(&reg, &batches);
            assert_eq!(batches.iter().map(|b| b.kernels.len()).sum::<usize>(), 12);
        }
    }
}
