//! Layer configuration.
//!
//! A flat set of named options, loadable from JSON. Every loader validates before returning, so
//! a `MoeConfig` obtained from a file is ready to build a layer.
//!
//! ```rust
//! use moe_rs::moe::{MoeConfig, RoutingMode};
//!
//! let cfg = MoeConfig::from_json_str(
//!     r#"{ "dmodel": 16, "n_experts": 4, "total_experts_width": 64, "top_k": 2 }"#,
//! )
//! .unwrap();
//! assert_eq!(cfg.expert_size().unwrap(), 16);
//! assert_eq!(cfg.routing, RoutingMode::TokenChoice);
//! ```

use super::error::{MoeError, Result};
use crate::nn::{Activation, InitType};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Axis the gate softmax normalizes over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SoftmaxOver {
    /// Each token's scores sum to 1 across experts.
    #[default]
    Experts,
    /// Each expert's scores sum to 1 across tokens.
    Tokens,
}

impl SoftmaxOver {
    /// Axis of the `[tokens, experts]` score matrix to normalize.
    pub fn axis(self) -> usize {
        match self {
            SoftmaxOver::Experts => 1,
            SoftmaxOver::Tokens => 0,
        }
    }
}

/// Direction of choice between tokens and experts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    /// Tokens pick their top-k experts; overflow beyond capacity is dropped.
    #[default]
    TokenChoice,
    /// Experts pick their top-capacity tokens; unpicked tokens are dropped.
    ExpertChoice,
}

fn default_capacity_factor() -> f64 {
    1.25
}

fn default_top_k() -> usize {
    1
}

fn default_load_balancing_loss_weight() -> f64 {
    0.01
}

fn default_init_scale() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MoeConfig {
    /// Width of the incoming token representations.
    pub dmodel: usize,
    /// Width of the layer output. Defaults to `dmodel`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doutput: Option<usize>,
    pub n_experts: usize,
    /// Hidden width of a single expert.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expert_size: Option<usize>,
    /// Hidden width summed over all experts; split evenly when `expert_size` is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_experts_width: Option<usize>,
    #[serde(default = "default_capacity_factor")]
    pub capacity_factor: f64,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_load_balancing_loss_weight")]
    pub load_balancing_loss_weight: f64,
    /// Router z-loss weight; 0 disables the term.
    #[serde(default)]
    pub z_loss_weight: f64,
    #[serde(default)]
    pub softmax_over: SoftmaxOver,
    #[serde(default)]
    pub routing: RoutingMode,
    #[serde(default)]
    pub activation: Activation,
    #[serde(default)]
    pub init_type: InitType,
    #[serde(default = "default_init_scale")]
    pub init_scale: f64,
    /// Seed for parameter initialization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl MoeConfig {
    /// A token-choice configuration with every optional field at its default.
    pub fn new(dmodel: usize, n_experts: usize, expert_size: usize) -> Self {
        Self {
            dmodel,
            doutput: None,
            n_experts,
            expert_size: Some(expert_size),
            total_experts_width: None,
            capacity_factor: default_capacity_factor(),
            top_k: default_top_k(),
            load_balancing_loss_weight: default_load_balancing_loss_weight(),
            z_loss_weight: 0.0,
            softmax_over: SoftmaxOver::default(),
            routing: RoutingMode::default(),
            activation: Activation::default(),
            init_type: InitType::default(),
            init_scale: default_init_scale(),
            seed: None,
        }
    }

    /// Parses and validates a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Output width of the layer.
    pub fn output_dim(&self) -> usize {
        self.doutput.unwrap_or(self.dmodel)
    }

    /// Hidden width of one expert, resolved from `expert_size` or `total_experts_width`.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if neither is set, if the total does not split evenly, or if both are set
    /// and disagree.
    pub fn expert_size(&self) -> Result<usize> {
        match (self.expert_size, self.total_experts_width) {
            (Some(size), None) => Ok(size),
            (None, Some(total)) => {
                if self.n_experts == 0 || !total.is_multiple_of(self.n_experts) {
                    return Err(MoeError::InvalidConfig(format!(
                        "total_experts_width {total} is not divisible by n_experts {}",
                        self.n_experts
                    )));
                }
                Ok(total / self.n_experts)
            }
            (Some(size), Some(total)) => {
                if size.checked_mul(self.n_experts) != Some(total) {
                    return Err(MoeError::InvalidConfig(format!(
                        "expert_size {size} x n_experts {} does not equal total_experts_width {total}",
                        self.n_experts
                    )));
                }
                Ok(size)
            }
            (None, None) => Err(MoeError::InvalidConfig(
                "one of expert_size or total_experts_width must be set".to_string(),
            )),
        }
    }

    /// Checks every option; call before building a layer.
    pub fn validate(&self) -> Result<()> {
        if self.dmodel == 0 {
            return Err(invalid("dmodel must be positive"));
        }
        if self.output_dim() == 0 {
            return Err(invalid("doutput must be positive"));
        }
        if self.n_experts == 0 {
            return Err(invalid("n_experts must be positive"));
        }
        if self.expert_size()? == 0 {
            return Err(invalid("expert_size must be positive"));
        }
        if self.top_k == 0 {
            return Err(invalid("top_k must be at least 1"));
        }
        if self.top_k > self.n_experts {
            return Err(MoeError::InvalidConfig(format!(
                "top_k {} exceeds n_experts {}",
                self.top_k, self.n_experts
            )));
        }
        check_capacity_factor(self.capacity_factor)?;
        if !self.load_balancing_loss_weight.is_finite() || self.load_balancing_loss_weight < 0.0 {
            return Err(invalid("load_balancing_loss_weight must be finite and non-negative"));
        }
        if !self.z_loss_weight.is_finite() || self.z_loss_weight < 0.0 {
            return Err(invalid("z_loss_weight must be finite and non-negative"));
        }
        if !self.init_scale.is_finite() || self.init_scale <= 0.0 {
            return Err(invalid("init_scale must be finite and positive"));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> MoeError {
    MoeError::InvalidConfig(msg.to_string())
}

pub(crate) fn check_capacity_factor(capacity_factor: f64) -> Result<()> {
    if !capacity_factor.is_finite() || capacity_factor <= 0.0 {
        return Err(MoeError::InvalidConfig(format!(
            "capacity_factor must be finite and positive, got {capacity_factor}"
        )));
    }
    Ok(())
}
