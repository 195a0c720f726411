use std::sync::Arc;

use riq_common::{global_metrics, Result};
use riq_planner::{
    combine_conjuncts, evaluate, is_statically_evaluable, split_conjuncts, Expr, Truth,
};
use tracing::debug;

use crate::catalog::TableDescriptor;
use crate::metastore::{MetadataStore, PartitionEntry};

/// Partitions that survive pruning plus the filter still to be applied to rows.
#[derive(Debug, Clone)]
pub struct ResolvedScan {
    pub descriptor: Arc<TableDescriptor>,
    /// Manifest order.
    pub partitions: Vec<PartitionEntry>,
    /// Conjunction of clauses the reader must evaluate; literal `true` if none.
    pub residual: Expr,
    /// Manifest size at resolution time.
    pub total_partitions: usize,
}

impl ResolvedScan {
    pub fn pruned(&self) -> usize {
        self.total_partitions - self.partitions.len()
    }
}

/// Selects the partitions of `table` that may contain rows matching every filter.
///
/// Clauses over partition keys only, built from comparisons, boolean logic,
/// `IN` and null checks, are decided per partition from the manifest. Every
/// other clause (including arithmetic on keys) becomes residual. A clause
/// that is undecided for some kept partition (null keys) is also kept as
/// residual so row-level semantics stay exact.
pub fn resolve(store: &MetadataStore, table: &str, filters: &[Expr]) -> Result<ResolvedScan> {
    let snapshot = store.snapshot(table)?;
    let descriptor = snapshot.descriptor;

    let conjuncts = filters
        .iter()
        .cloned()
        .flat_map(split_conjuncts)
        .filter(|c| !c.is_always_true())
        .collect::<Vec<_>>();
    for c in &conjuncts {
        for column in c.columns() {
            descriptor.require_column(&column)?;
        }
    }

    let (prunable, mut residual): (Vec<Expr>, Vec<Expr>) = conjuncts.into_iter().partition(|c| {
        is_statically_evaluable(c) && c.columns().iter().all(|k| descriptor.is_partition_key(k))
    });

    let mut undecided = vec![false; prunable.len()];
    let partitions = snapshot
        .entries
        .iter()
        .filter(|entry| {
            let truths = prunable
                .iter()
                .map(|c| evaluate(c, &entry.key_values))
                .collect::<Vec<_>>();
            if truths.contains(&Truth::False) {
                return false;
            }
            for (i, t) in truths.iter().enumerate() {
                if *t == Truth::Unknown {
                    undecided[i] = true;
                }
            }
            true
        })
        .cloned()
        .collect::<Vec<_>>();
    residual.extend(
        prunable
            .into_iter()
            .zip(undecided)
            .filter_map(|(c, u)| u.then_some(c)),
    );

    let total_partitions = snapshot.entries.len();
    global_metrics().record_pruning(table, total_partitions as u64, partitions.len() as u64);
    debug!(
        table = %table,
        operator = "PartitionPruning",
        total = total_partitions,
        kept = partitions.len(),
        residual_clauses = residual.len(),
        "partitions resolved"
    );

    Ok(ResolvedScan {
        descriptor,
        partitions,
        residual: combine_conjuncts(residual),
        total_partitions,
    })
}
