use super::balancing::{load_balancing_loss, z_loss};
use super::config::{MoeConfig, RoutingMode};
use super::dispatch::Dispatcher;
use super::error::{MoeError, Result, check_dim};
use super::expert::{Expert, ExpertFF};
use super::gate::Gate;
use super::router::{ExpertChoiceRouter, Router, RoutingDecision, TokenChoiceRouter};
use super::stats::{RoutingLog, RoutingRecord, mean_row_entropy};
use crate::autograd::Variable;
use crate::nn::{Module, Parameter};
use crate::tensor::FloatElem;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::debug;

/// Seed used when the configuration does not name one.
pub const DEFAULT_SEED: u64 = 0x5eed;

/// The router variant a layer was built with.
#[derive(Debug, Clone)]
pub enum RouterKind {
    TokenChoice(TokenChoiceRouter),
    ExpertChoice(ExpertChoiceRouter),
}

impl RouterKind {
    /// Builds the router selected by `config.routing`.
    pub fn from_config(config: &MoeConfig) -> Result<Self> {
        Ok(match config.routing {
            RoutingMode::TokenChoice => RouterKind::TokenChoice(TokenChoiceRouter::new(
                config.n_experts,
                config.top_k,
                config.capacity_factor,
            )?),
            RoutingMode::ExpertChoice => RouterKind::ExpertChoice(ExpertChoiceRouter::new(
                config.n_experts,
                config.top_k,
                config.capacity_factor,
            )?),
        })
    }

    pub fn mode(&self) -> RoutingMode {
        match self {
            RouterKind::TokenChoice(_) => RoutingMode::TokenChoice,
            RouterKind::ExpertChoice(_) => RoutingMode::ExpertChoice,
        }
    }
}

impl Router for RouterKind {
    fn n_experts(&self) -> usize {
        match self {
            RouterKind::TokenChoice(r) => r.n_experts(),
            RouterKind::ExpertChoice(r) => r.n_experts(),
        }
    }

    fn capacity(&self, n_tokens: usize) -> usize {
        match self {
            RouterKind::TokenChoice(r) => r.capacity(n_tokens),
            RouterKind::ExpertChoice(r) => r.capacity(n_tokens),
        }
    }

    fn route<T: FloatElem + 'static>(&self, scores: &Variable<T, 2>) -> Result<RoutingDecision<T>> {
        match self {
            RouterKind::TokenChoice(r) => r.route(scores),
            RouterKind::ExpertChoice(r) => r.route(scores),
        }
    }
}

/// Result of one MoE forward pass.
#[derive(Debug)]
pub struct MoeOutput<T: FloatElem> {
    /// `[batch, seq, output_dim]`
    pub output: Variable<T, 3>,
    /// Weighted load-balancing loss plus the z-loss, if enabled.
    pub aux_loss: Variable<T, 0>,
    pub decision: RoutingDecision<T>,
}

/// Mixture-of-Experts feed-forward layer.
///
/// Gate, router, dispatcher and experts composed into one forward pass:
///
/// ```text
/// x [B, S, H] -> flatten [N, H] -> gate -> probs [N, E] -> router -> decision
///            -> extract [E, C, H] -> experts -> [E, C, O] -> merge [N, O] -> [B, S, O]
/// ```
///
/// # Examples
///
/// ```rust
/// use moe_rs::autograd::Variable;
/// use moe_rs::moe::{MoeConfig, MoeLayer};
/// use moe_rs::tensor::Tensor;
///
/// let layer = MoeLayer::<f32>::new(MoeConfig::new(4, 2, 8)).unwrap();
/// let x = Variable::new(Tensor::ones([2, 3, 4]));
/// let out = layer.forward(&x).unwrap();
/// assert_eq!(out.output.shape(), &[2, 3, 4]);
/// ```
#[derive(Debug)]
pub struct MoeLayer<T: FloatElem + 'static, E: Expert<T> = ExpertFF<T>> {
    name: String,
    config: MoeConfig,
    gate: Gate<T>,
    router: RouterKind,
    dispatcher: Dispatcher,
    expert: E,
}

impl<T: FloatElem + 'static> MoeLayer<T, ExpertFF<T>> {
    /// Builds a layer with freshly initialized parameters, seeded from `config.seed`.
    pub fn new(config: MoeConfig) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(config.seed.unwrap_or(DEFAULT_SEED));
        Self::with_rng(config, &mut rng)
    }

    /// Builds a layer drawing its parameters from `rng`; the gate is drawn first.
    pub fn with_rng<R: rand::Rng + ?Sized>(config: MoeConfig, rng: &mut R) -> Result<Self> {
        config.validate()?;
        let gate = Gate::init(
            config.dmodel,
            config.n_experts,
            config.softmax_over,
            config.init_type,
            config.init_scale,
            rng,
        )?;
        let expert = ExpertFF::init(
            config.n_experts,
            config.dmodel,
            config.expert_size()?,
            config.output_dim(),
            config.activation,
            config.init_type,
            config.init_scale,
            rng,
        )?;
        Self::from_parts(config, gate, expert)
    }
}

impl<T: FloatElem + 'static, E: Expert<T>> MoeLayer<T, E> {
    /// Assembles a layer from existing parts after checking they agree with `config`.
    pub fn from_parts(config: MoeConfig, gate: Gate<T>, expert: E) -> Result<Self> {
        config.validate()?;
        check_dim("gate input width", config.dmodel, gate.dmodel())?;
        check_dim("gate expert count", config.n_experts, gate.n_experts())?;
        check_dim("expert count", config.n_experts, expert.n_experts())?;
        check_dim("expert input width", config.dmodel, expert.input_dim())?;
        check_dim("expert output width", config.output_dim(), expert.output_dim())?;
        if gate.softmax_over() != config.softmax_over {
            return Err(MoeError::InvalidConfig(
                "gate softmax axis differs from the configuration".to_string(),
            ));
        }

        Ok(Self {
            name: "moe".to_string(),
            router: RouterKind::from_config(&config)?,
            dispatcher: Dispatcher::new(config.n_experts),
            config,
            gate,
            expert,
        })
    }

    /// Names the layer in routing records.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &MoeConfig {
        &self.config
    }

    pub fn gate(&self) -> &Gate<T> {
        &self.gate
    }

    pub fn router(&self) -> &RouterKind {
        &self.router
    }

    pub fn expert(&self) -> &E {
        &self.expert
    }

    pub fn forward(&self, x: &Variable<T, 3>) -> Result<MoeOutput<T>> {
        self.forward_observed(x, None)
    }

    /// Runs the layer, appending a [`RoutingRecord`] to `log` when one is given.
    pub fn forward_observed(
        &self,
        x: &Variable<T, 3>,
        log: Option<&mut RoutingLog>,
    ) -> Result<MoeOutput<T>> {
        let [batch, seq, width] = *x.shape();
        check_dim("layer input width", self.config.dmodel, width)?;
        let n_tokens = batch * seq;

        let flat = x.reshape([n_tokens, width])?;
        let gate_out = self.gate.forward_flat(&flat)?;
        let decision = self.router.route(&gate_out.probs)?;

        let experts_in = self.dispatcher.extract(&flat, &decision)?;
        let experts_out = self.expert.forward(&experts_in)?;
        let merged = self.dispatcher.merge(&experts_out, &decision, n_tokens)?;
        let output = merged.reshape([batch, seq, self.expert.output_dim()])?;

        let balancing = load_balancing_loss(
            &gate_out.probs,
            &decision.tokens_per_expert,
            self.config.load_balancing_loss_weight,
        )?;
        let (aux_loss, z) = if self.config.z_loss_weight > 0.0 {
            let z = z_loss(&gate_out.logits, self.config.z_loss_weight)?;
            ((&balancing + &z)?, Some(z))
        } else {
            (balancing.clone(), None)
        };

        debug!(
            layer = %self.name,
            n_tokens,
            capacity = decision.capacity,
            dropped_ratio = decision.dropped_ratio,
            "moe forward"
        );

        if let Some(log) = log {
            log.record(RoutingRecord {
                layer: self.name.clone(),
                step: 0,
                n_tokens,
                capacity: decision.capacity,
                tokens_per_expert: decision
                    .tokens_per_expert
                    .data()
                    .iter()
                    .map(|c| c.to_f64().unwrap_or(0.0))
                    .collect(),
                dropped_ratio: decision.dropped_ratio,
                load_balancing_loss: scalar_value(&balancing),
                z_loss: z.as_ref().map(scalar_value).unwrap_or(0.0),
                gate_entropy: mean_row_entropy(&gate_out.probs.data),
            });
        }

        Ok(MoeOutput {
            output,
            aux_loss,
            decision,
        })
    }
}

fn scalar_value<T: FloatElem>(v: &Variable<T, 0>) -> f64 {
    v.data.data().first().and_then(|x| x.to_f64()).unwrap_or(0.0)
}

impl<T: FloatElem + 'static, E: Expert<T>> Module<T> for MoeLayer<T, E> {
    fn parameters_mut(&mut self) -> Vec<Parameter<'_, T>> {
        let mut params = self.gate.parameters_mut();
        params.extend(self.expert.parameters_mut());
        params
    }
}
