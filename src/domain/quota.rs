//! Quota ledger gate
//!
//! Pre-commit check over capability-pool capacity. Every pool a pass would
//! draw from is checked together: groups share pools, so a per-group check
//! would let several groups overdraw one pool between them.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use tracing::{info, warn};

use crate::domain::entities::PoolId;
use crate::domain::repositories::QuotaLedger;
use crate::error::{SyncError, SyncResult};

/// Grants a pass is about to issue, summed per pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingDemand {
    per_pool: BTreeMap<PoolId, i64>,
}

impl PendingDemand {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero and negative amounts do not touch the pool.
    pub fn add(&mut self, pool_id: PoolId, amount: i64) {
        if amount > 0 {
            *self.per_pool.entry(pool_id).or_insert(0) += amount;
        }
    }

    pub fn merge(&mut self, other: &Self) {
        for (&pool_id, &amount) in &other.per_pool {
            self.add(pool_id, amount);
        }
    }

    pub fn get(&self, pool_id: PoolId) -> i64 {
        self.per_pool.get(&pool_id).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.per_pool.is_empty()
    }

    pub fn touched_pools(&self) -> impl Iterator<Item = (PoolId, i64)> + '_ {
        self.per_pool.iter().map(|(&pool, &amount)| (pool, amount))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaViolation {
    pub pool_id: PoolId,
    pub capacity: i64,
    pub issued: i64,
    pub pending: i64,
}

pub struct QuotaGate;

impl QuotaGate {
    /// Pure decision. A pool missing from `capacities` has capacity 0.
    pub fn evaluate(
        capacities: &HashMap<PoolId, i64>,
        issued: &HashMap<PoolId, i64>,
        pending: &PendingDemand,
    ) -> Result<(), Vec<QuotaViolation>> {
        let violations: Vec<QuotaViolation> = pending
            .touched_pools()
            .filter_map(|(pool_id, pending)| {
                let capacity = capacities.get(&pool_id).copied().unwrap_or(0);
                let issued = issued.get(&pool_id).copied().unwrap_or(0);
                (issued.saturating_add(pending) >= capacity).then_some(QuotaViolation {
                    pool_id,
                    capacity,
                    issued,
                    pending,
                })
            })
            .collect();

        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }

    /// Read committed ledger state and decide. Must run right before the write phase.
    pub async fn enforce(ledger: &dyn QuotaLedger, pending: &PendingDemand) -> SyncResult<()> {
        if pending.is_empty() {
            info!("🎫 Quota gate: nothing to provision, skipping ledger read");
            return Ok(());
        }

        let capacities = ledger.pool_capacities().await?;
        let issued = ledger.issued_totals().await?;

        match Self::evaluate(&capacities, &issued, pending) {
            Ok(()) => {
                for (pool_id, amount) in pending.touched_pools() {
                    info!(
                        "🎫 Quota gate passed for pool {}: issued {} + pending {} < capacity {}",
                        pool_id,
                        issued.get(&pool_id).copied().unwrap_or(0),
                        amount,
                        capacities.get(&pool_id).copied().unwrap_or(0)
                    );
                }
                Ok(())
            }
            Err(violations) => {
                for v in &violations {
                    warn!(
                        "🚫 Quota gate violation on pool {}: issued {} + pending {} >= capacity {}",
                        v.pool_id, v.issued, v.pending, v.capacity
                    );
                }
                Err(SyncError::QuotaExceeded { violations })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn map(pairs: &[(PoolId, i64)]) -> HashMap<PoolId, i64> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn overdraw_is_rejected() {
        // C=1000, I=950, 2 new users x 30
        let mut pending = PendingDemand::new();
        pending.add(1, 30);
        pending.add(1, 30);
        let err = QuotaGate::evaluate(&map(&[(1, 1000)]), &map(&[(1, 950)]), &pending).unwrap_err();
        assert_eq!(
            err,
            vec![QuotaViolation { pool_id: 1, capacity: 1000, issued: 950, pending: 60 }]
        );
    }

    #[rstest]
    #[case(900, 60, true)]
    #[case(940, 60, false)] // equal to capacity is already a violation
    #[case(0, 999, true)]
    fn boundary_is_exclusive(#[case] issued: i64, #[case] pending_amount: i64, #[case] ok: bool) {
        let mut pending = PendingDemand::new();
        pending.add(7, pending_amount);
        let result = QuotaGate::evaluate(&map(&[(7, 1000)]), &map(&[(7, issued)]), &pending);
        assert_eq!(result.is_ok(), ok);
    }

    #[test]
    fn zero_capacity_with_demand_is_always_a_violation() {
        let mut pending = PendingDemand::new();
        pending.add(3, 1);
        assert!(QuotaGate::evaluate(&map(&[(3, 0)]), &HashMap::new(), &pending).is_err());
        // unknown pool behaves like zero capacity
        assert!(QuotaGate::evaluate(&HashMap::new(), &HashMap::new(), &pending).is_err());
    }

    #[test]
    fn untouched_pools_are_ignored() {
        let mut pending = PendingDemand::new();
        pending.add(1, 10);
        pending.add(2, 0);
        let capacities = map(&[(1, 100), (2, 0)]);
        let issued = map(&[(2, 500)]);
        assert!(QuotaGate::evaluate(&capacities, &issued, &pending).is_ok());
    }

    #[test]
    fn every_violating_pool_is_reported() {
        let mut pending = PendingDemand::new();
        pending.add(1, 50);
        pending.add(2, 50);
        pending.add(3, 1);
        let capacities = map(&[(1, 100), (2, 100), (3, 100)]);
        let issued = map(&[(1, 60), (2, 60), (3, 0)]);
        let violations = QuotaGate::evaluate(&capacities, &issued, &pending).unwrap_err();
        let pools: Vec<PoolId> = violations.iter().map(|v| v.pool_id).collect();
        assert_eq!(pools, vec![1, 2]);
    }

    #[test]
    fn merge_sums_demand_across_groups() {
        let mut a = PendingDemand::new();
        a.add(1, 30);
        let mut b = PendingDemand::new();
        b.add(1, 40);
        b.add(2, 5);
        a.merge(&b);
        assert_eq!(a.get(1), 70);
        assert_eq!(a.get(2), 5);
    }
}
