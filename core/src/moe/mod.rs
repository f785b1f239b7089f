//! Mixture-of-Experts routing and dispatch.
//!
//! # Pipeline
//!
//! 1. **Gate** ([`Gate`]): one score per `(token, expert)`, softmaxed over experts or tokens.
//! 2. **Router** ([`TokenChoiceRouter`], [`ExpertChoiceRouter`]): a capacity-limited
//!    [`RoutingDecision`] of which token fills which expert slot.
//! 3. **Dispatcher** ([`Dispatcher`]): gathers routed tokens into `[experts, capacity, hidden]`
//!    batches, and scatter-adds the weighted expert outputs back to token order.
//! 4. **Auxiliary losses** ([`load_balancing_loss`], [`z_loss`]): differentiable scalars the
//!    training loop adds to its task loss.
//!
//! [`MoeLayer`] wires these together behind a single `forward`.
//!
//! # Dropping
//!
//! Tokens that do not get a slot are not an error. In token-choice mode an expert keeps at most
//! `capacity` of the tokens that picked it. In expert-choice mode a token may be picked by no
//! expert at all. Either way the token's output row receives nothing from that expert, and no
//! gradient flows back through the dropped path. [`RoutingDecision::dropped_ratio`] reports how
//! much was lost.
//!
//! # Example
//!
//! ```rust
//! use moe_rs::autograd::Variable;
//! use moe_rs::loss::{mse_loss, with_aux};
//! use moe_rs::moe::{AuxLossCollector, MoeConfig, MoeLayer, Reduction};
//! use moe_rs::tensor::Tensor;
//!
//! let mut config = MoeConfig::new(4, 4, 8);
//! config.top_k = 2;
//! let layer = MoeLayer::<f64>::new(config).unwrap();
//!
//! let x = Variable::new(Tensor::from_fn([2, 5, 4], |i| (i as f64).sin()));
//! let out = layer.forward(&x).unwrap();
//!
//! let mut aux = AuxLossCollector::new();
//! aux.push(out.aux_loss.clone());
//! let task = mse_loss(&out.output, &x).unwrap();
//! let total = with_aux(&task, &aux.reduce(Reduction::Mean).unwrap()).unwrap();
//! total.backward().unwrap();
//!
//! assert!(layer.gate().weight().grad().is_some());
//! ```

pub mod balancing;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod expert;
pub mod gate;
pub mod layer;
pub mod router;
pub mod stats;

pub use balancing::{load_balancing_loss, z_loss};
pub use config::{MoeConfig, RoutingMode, SoftmaxOver};
pub use dispatch::Dispatcher;
pub use error::{MoeError, Result};
pub use expert::{Expert, ExpertFF};
pub use gate::{Gate, GateOutput};
pub use layer::{DEFAULT_SEED, MoeLayer, MoeOutput, RouterKind};
pub use router::{
    ExpertChoiceRouter, Router, RoutingDecision, TokenChoiceRouter, compute_capacity,
};
pub use stats::{AuxLossCollector, Reduction, RoutingLog, RoutingRecord};
