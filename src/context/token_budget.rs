//! Token budget arithmetic shared by the optimizer, compressor and structurer

use crate::error::{ContextError, Result};
use serde::{Deserialize, Serialize};

/// Token budget for a single build
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenBudget {
    limit: usize,
    /// Extra fraction of `limit` the optimizer may select ahead of compression
    headroom: f32,
}

impl TokenBudget {
    /// Create a budget; a zero limit is rejected
    pub fn new(limit: usize) -> Result<Self> {
        if limit == 0 {
            return Err(ContextError::InvalidRequest(
                "token budget must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            limit,
            headroom: 0.0,
        })
    }

    pub fn with_headroom(mut self, headroom: f32) -> Self {
        self.headroom = headroom.max(0.0);
        self
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Token count the optimizer may fill before compression takes over
    pub fn selection_limit(&self) -> usize {
        let extra = (self.limit as f64 * self.headroom as f64).floor() as usize;
        self.limit.saturating_add(extra)
    }

    /// Whether `additional` tokens fit on top of `used` under `ceiling`
    pub fn fits_within(used: usize, additional: usize, ceiling: usize) -> bool {
        used.saturating_add(additional) <= ceiling
    }

    pub fn remaining(&self, used: usize) -> usize {
        self.limit.saturating_sub(used)
    }

    /// Tokens that must be removed to get back under the limit
    pub fn excess(&self, used: usize) -> usize {
        used.saturating_sub(self.limit)
    }

    /// `used / limit`, unclamped
    pub fn utilization(&self, used: usize) -> f32 {
        used as f32 / self.limit as f32
    }

    pub fn is_within(&self, used: usize) -> bool {
        used <= self.limit
    }

    /// Error describing an overflow that compression could not resolve
    pub fn infeasible(&self, used: usize) -> ContextError {
        ContextError::BudgetInfeasible {
            required: used,
            budget: self.limit,
        }
    }
}
