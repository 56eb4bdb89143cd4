//! Budget classification model.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BudgetLevel {
    Normal,
    Warning,
    Emergency,
}

/// Monthly spend of a tenant measured against its budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub level: BudgetLevel,
    pub spend: f64,
    pub budget: Option<f64>,
    pub percentage: f64,
    /// Callers must refuse new non-essential billable operations.
    pub block_non_essential: bool,
    pub message: String,
}
