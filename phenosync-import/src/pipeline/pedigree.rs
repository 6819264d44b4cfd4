//! Germplasm pedigree ordering
//!
//! The remote store requires parents to exist before a child is created, and
//! a batch may reference parents defined in the same batch. Creation is
//! therefore layered: each round schedules every unscheduled NEW germplasm
//! whose parents are already satisfied, and the round becomes one POST
//! batch. A round that schedules nothing while germplasm remain means the
//! batch carries a parent-reference cycle; that is a distinct fatal error
//! and zero creates are issued for germplasm.

use crate::types::Germplasm;
use std::collections::HashSet;

/// Outcome of pedigree layering
#[derive(Debug)]
pub enum PedigreeOrder {
    /// Natural keys to create, one POST batch per layer, parents first
    Layers(Vec<Vec<String>>),
    /// Keys left unschedulable by a cycle among their parent references
    Cycle(Vec<String>),
}

/// Order NEW germplasm into creation layers
///
/// # Arguments
/// * `new_germplasm` - (natural key, germplasm) pairs staged as NEW
/// * `pre_existing` - names already satisfied: EXISTING pendings plus the
///   cached program germplasm
pub fn order_germplasm(
    new_germplasm: &[(String, Germplasm)],
    pre_existing: &HashSet<String>,
) -> PedigreeOrder {
    let mut created: HashSet<String> = pre_existing.clone();
    let mut remaining: Vec<&(String, Germplasm)> = new_germplasm.iter().collect();
    let mut layers: Vec<Vec<String>> = Vec::new();

    while !remaining.is_empty() {
        let (ready, blocked): (Vec<_>, Vec<_>) = remaining
            .into_iter()
            .partition(|(_, germplasm)| parents_satisfied(germplasm, &created));

        if ready.is_empty() {
            let mut names: Vec<String> =
                blocked.into_iter().map(|(key, _)| key.clone()).collect();
            names.sort_unstable();
            return PedigreeOrder::Cycle(names);
        }

        let layer: Vec<String> = ready.iter().map(|(key, _)| key.clone()).collect();
        created.extend(layer.iter().cloned());
        layers.push(layer);
        remaining = blocked;
    }

    PedigreeOrder::Layers(layers)
}

fn parents_satisfied(germplasm: &Germplasm, created: &HashSet<String>) -> bool {
    germplasm.parent_names().all(|parent| created.contains(parent))
}
