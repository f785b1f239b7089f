//! Trains a two-block MoE stack on a synthetic regression task with SGD.
//!
//! ```text
//! moe-train [config.json]
//! ```
//!
//! Without a config file the layer uses 16-wide tokens, 8 experts of width 32 and top-2
//! token-choice routing. Set `RUST_LOG=moe_rs=debug` to see every routing decision.

use moe_rs::autograd::Variable;
use moe_rs::loss::{mse_loss, with_aux};
use moe_rs::moe::{AuxLossCollector, MoeConfig, MoeError, MoeLayer, Reduction, RoutingLog};
use moe_rs::nn::Module;
use moe_rs::optim::Sgd;
use moe_rs::tensor::Tensor;
use moe_rs_demos::logging;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

const BATCH: usize = 4;
const SEQ: usize = 16;
const STEPS: u64 = 200;
const LOG_EVERY: u64 = 20;
const LEARNING_RATE: f64 = 0.05;

fn default_config() -> MoeConfig {
    let mut config = MoeConfig::new(16, 8, 32);
    config.top_k = 2;
    config.z_loss_weight = 1e-3;
    config.seed = Some(7);
    config
}

fn load_config() -> Result<MoeConfig, MoeError> {
    match std::env::args().nth(1) {
        Some(path) => {
            info!(%path, "loading config");
            MoeConfig::from_json_file(path)
        }
        None => {
            let config = default_config();
            config.validate()?;
            Ok(config)
        }
    }
}

/// Inputs in `[-1, 1]`; the target is `|x|` on the first `doutput` features.
fn synthetic_batch(
    rng: &mut StdRng,
    dmodel: usize,
    doutput: usize,
) -> (Variable<f64, 3>, Variable<f64, 3>) {
    let x = Tensor::from_fn([BATCH, SEQ, dmodel], |_| rng.random_range(-1.0f64..=1.0));
    let y = Tensor::from_fn([BATCH, SEQ, doutput], |i| {
        let (token, feature) = (i / doutput, i % doutput);
        x.data()[token * dmodel + feature % dmodel].abs()
    });
    (Variable::new(x), Variable::new(y))
}

fn main() -> Result<(), MoeError> {
    logging::init("info");

    let config = load_config()?;
    info!(config = %config.to_json_string()?, "configuration");

    // The second block maps doutput -> doutput.
    let mut second_config = config.clone();
    second_config.dmodel = config.output_dim();
    second_config.seed = config.seed.map(|s| s + 1);

    let mut first = MoeLayer::<f64>::new(config.clone())?.with_name("block0");
    let mut second = MoeLayer::<f64>::new(second_config)?.with_name("block1");
    info!(
        parameters = first.num_parameters() + second.num_parameters(),
        "model ready"
    );

    let mut rng = StdRng::seed_from_u64(config.seed.unwrap_or(0));
    let (x, target) = synthetic_batch(&mut rng, config.dmodel, config.output_dim());
    let sgd = Sgd::new(LEARNING_RATE);
    let mut routing = RoutingLog::new();
    let mut aux = AuxLossCollector::new();

    for step in 0..STEPS {
        routing.begin_step(step);
        aux.clear();
        first.zero_grad();
        second.zero_grad();

        let h = first.forward_observed(&x, Some(&mut routing))?;
        aux.push(h.aux_loss);
        let out = second.forward_observed(&h.output, Some(&mut routing))?;
        aux.push(out.aux_loss);

        let task = mse_loss(&out.output, &target)?;
        let aux_total = aux.reduce(Reduction::Sum)?;
        let total = with_aux(&task, &aux_total)?;
        total.backward()?;

        first.apply_gradients(&sgd)?;
        second.apply_gradients(&sgd)?;

        if step % LOG_EVERY == 0 || step + 1 == STEPS {
            let dropped = routing.mean_dropped_ratio().unwrap_or(0.0);
            info!(
                step,
                task_loss = task.data.data()[0],
                aux_loss = aux_total.data.data()[0],
                dropped_ratio = dropped,
                "train"
            );
            if dropped > 0.5 {
                warn!(dropped, "more than half of the routed assignments were dropped");
            }
        }
    }

    let summary = serde_json::to_string_pretty(routing.records())?;
    println!("{summary}");
    Ok(())
}
