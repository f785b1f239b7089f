//! Routing observations and auxiliary-loss collection.
//!
//! Both are plain values owned by the training loop and passed into the layer explicitly.

use super::error::Result;
use crate::autograd::Variable;
use crate::tensor::{Cpu, FloatElem, Tensor, scalar};
use serde::{Deserialize, Serialize};

/// What one routed forward pass looked like.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingRecord {
    pub layer: String,
    pub step: u64,
    pub n_tokens: usize,
    pub capacity: usize,
    /// Requests per expert before capacity was applied.
    pub tokens_per_expert: Vec<f64>,
    pub dropped_ratio: f64,
    pub load_balancing_loss: f64,
    pub z_loss: f64,
    /// Mean entropy (nats) of the gate distribution, averaged over rows of the score matrix.
    pub gate_entropy: f64,
}

/// Collects [`RoutingRecord`]s for the current step.
///
/// ```rust
/// use moe_rs::moe::RoutingLog;
///
/// let mut log = RoutingLog::new();
/// log.begin_step(3);
/// assert!(log.is_empty());
/// assert_eq!(log.step(), 3);
/// ```
#[derive(Debug, Default, Clone)]
pub struct RoutingLog {
    step: u64,
    records: Vec<RoutingRecord>,
}

impl RoutingLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops the previous step's records and stamps new ones with `step`.
    pub fn begin_step(&mut self, step: u64) {
        self.step = step;
        self.records.clear();
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn record(&mut self, mut record: RoutingRecord) {
        record.step = self.step;
        self.records.push(record);
    }

    pub fn records(&self) -> &[RoutingRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Average dropped ratio over the recorded layers, `None` if nothing was recorded.
    pub fn mean_dropped_ratio(&self) -> Option<f64> {
        if self.records.is_empty() {
            return None;
        }
        let total: f64 = self.records.iter().map(|r| r.dropped_ratio).sum();
        Some(total / self.records.len() as f64)
    }

    /// The current records as a JSON array.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.records)?)
    }
}

/// Mean over rows of `-sum(p * ln p)`; zero probabilities contribute nothing.
pub(crate) fn mean_row_entropy<T: FloatElem>(probs: &Tensor<T, 2, Cpu>) -> f64 {
    let [rows, cols] = *probs.shape();
    if rows == 0 || cols == 0 {
        return 0.0;
    }
    let total: f64 = probs
        .data()
        .iter()
        .filter_map(|p| p.to_f64())
        .filter(|&p| p > 0.0)
        .map(|p| -p * p.ln())
        .sum();
    total / rows as f64
}

/// How [`AuxLossCollector::reduce`] combines the collected losses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reduction {
    #[default]
    Mean,
    Sum,
}

/// Gathers auxiliary losses from every MoE layer of a forward pass.
#[derive(Debug, Default)]
pub struct AuxLossCollector<T: FloatElem> {
    losses: Vec<Variable<T, 0>>,
}

impl<T: FloatElem + 'static> AuxLossCollector<T> {
    pub fn new() -> Self {
        Self { losses: Vec::new() }
    }

    pub fn push(&mut self, loss: Variable<T, 0>) {
        self.losses.push(loss);
    }

    pub fn len(&self) -> usize {
        self.losses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.losses.is_empty()
    }

    pub fn clear(&mut self) {
        self.losses.clear();
    }

    /// Combines the collected losses into one differentiable scalar; zero when empty.
    pub fn reduce(&self, reduction: Reduction) -> Result<Variable<T, 0>> {
        let Some((first, rest)) = self.losses.split_first() else {
            return Ok(Variable::new(Tensor::zeros([])));
        };
        let mut total = first.clone();
        for loss in rest {
            total = (&total + loss)?;
        }
        Ok(match reduction {
            Reduction::Sum => total,
            Reduction::Mean => total.scale(scalar(1.0 / self.losses.len() as f64)),
        })
    }
}
