use moe_rs::autograd::Variable;
use moe_rs::moe::{MoeConfig, MoeError, MoeLayer, RoutingLog, RoutingMode};
use moe_rs::tensor::Tensor;
use std::io::Write;
use tempfile::NamedTempFile;

fn write_config(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(json.as_bytes()).unwrap();
    file
}

#[test]
fn test_layer_from_config_file() {
    let file = write_config(
        r#"{
            "dmodel": 4,
            "n_experts": 4,
            "total_experts_width": 32,
            "top_k": 2,
            "capacity_factor": 2.0,
            "routing": "expert_choice",
            "seed": 17
        }"#,
    );
    let config = MoeConfig::from_json_file(file.path()).unwrap();
    assert_eq!(config.routing, RoutingMode::ExpertChoice);
    assert_eq!(config.expert_size().unwrap(), 8);

    let layer = MoeLayer::<f32>::new(config).unwrap().with_name("block0");
    let mut log = RoutingLog::new();
    log.begin_step(1);
    let x = Variable::new(Tensor::from_fn([1, 10, 4], |i| (i % 5) as f32 - 2.0));
    let out = layer.forward_observed(&x, Some(&mut log)).unwrap();

    // floor(2.0 * 10 * 2 / 4) = 10: every expert takes every token.
    assert_eq!(out.decision.capacity, 10);
    assert_eq!(out.decision.dropped_ratio, 0.0);
    assert_eq!(log.records()[0].layer, "block0");
}

#[test]
fn test_config_errors_surface_from_file() {
    let bad = write_config(r#"{ "dmodel": 4, "n_experts": 2, "expert_size": 8, "top_k": 3 }"#);
    assert!(matches!(
        MoeConfig::from_json_file(bad.path()),
        Err(MoeError::InvalidConfig(_))
    ));

    let malformed = write_config("dmodel = 4");
    assert!(matches!(
        MoeConfig::from_json_file(malformed.path()),
        Err(MoeError::Json(_))
    ));

    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        MoeConfig::from_json_file(dir.path().join("missing.json")),
        Err(MoeError::Io(_))
    ));
}

#[test]
fn test_saved_config_reloads_identically() {
    let mut config = MoeConfig::new(6, 3, 12);
    config.z_loss_weight = 0.001;
    config.seed = Some(5);

    let file = write_config(&config.to_json_string().unwrap());
    let reloaded = MoeConfig::from_json_file(file.path()).unwrap();
    assert_eq!(reloaded, config);

    // Same seed, same parameters.
    let x = Variable::new(Tensor::from_fn([2, 3, 6], |i| i as f64 / 36.0));
    let a = MoeLayer::<f64>::new(config).unwrap().forward(&x).unwrap();
    let b = MoeLayer::<f64>::new(reloaded).unwrap().forward(&x).unwrap();
    assert_eq!(a.output.data.data(), b.output.data.data());
}
