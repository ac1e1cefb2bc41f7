//! BudgetEvent domain model — an append-only ledger of cost.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One cost entry, written atomically alongside the terminal Invocation
/// write that produced it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BudgetEvent {
    pub id: Option<i64>,
    pub invocation_id: i64,
    pub cost_usd: f64,
    pub recorded_at: DateTime<Utc>,
}

impl BudgetEvent {
    pub fn new(invocation_id: i64, cost_usd: f64, recorded_at: DateTime<Utc>) -> Self {
        Self {
            id: None,
            invocation_id,
            cost_usd,
            recorded_at,
        }
    }
}
