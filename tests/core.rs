use handgrad::error::ModelError;
use handgrad::modelio::{self, Model};
use handgrad::prelude::*;
use handgrad::seeded;

fn temp_path(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("handgrad-{}-{name}.json", std::process::id()))
}

fn every_layer() -> Network {
    let mut rng = seeded(21);
    Network::new(
        vec![
            Layer::conv2d(1, 2, 3, 1, 1, Activation::LeakyRelu { alpha: 0.2 }, &mut rng),
            Layer::max_pooling(2, 2),
            Layer::average_pooling(1, 1),
            Layer::flatten(vec![1, 2, 2, 2]),
            Layer::dropout(0.25, &mut rng),
            Layer::fully_connected(8, 4, Activation::Softmax, &mut rng),
            Layer::reshape(vec![1, 4], vec![4]),
            Layer::embedding(6, 3, &mut rng),
            Layer::gru(3, 2, &mut rng),
            Layer::lstm(2, 2, &mut rng),
        ],
        Optimiser::adam(0.001, 0.9, 0.999, 1e-8),
        Loss::CategoricalCrossEntropy,
        Some(Regulariser::ElasticNet { lambda1: 0.01, lambda2: 0.02 }),
    )
}

#[test]
fn test_network_save_and_load() {
    let net = every_layer();
    let path = temp_path("all-layers");
    net.save(&path, "everything", "synthetic", 1.25).unwrap();

    let loaded = Network::load(&path).unwrap();
    std::fs::remove_file(&path).ok();

    let names: Vec<_> = net.layers().iter().map(Layer::name).collect();
    let loaded_names: Vec<_> = loaded.layers().iter().map(Layer::name).collect();
    assert_eq!(names, loaded_names);
    for (a, b) in net.layers().iter().zip(loaded.layers()) {
        assert_eq!(a.weights(), b.weights(), "{} weights", a.name());
        assert_eq!(a.biases(), b.biases(), "{} biases", a.name());
    }
    assert_eq!(loaded.optimiser().save(), net.optimiser().save());
    assert_eq!(loaded.loss(), net.loss());
    assert_eq!(loaded.regulariser(), net.regulariser());
}

#[test]
fn test_metadata_is_written() {
    let model = every_layer().to_model("meta", "set", 0.5);
    let json = model.to_json().unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["metadata"]["name"], "meta");
    assert_eq!(value["metadata"]["dataset_name"], "set");
    assert_eq!(value["metadata"]["total_loss"], 0.5);
    assert!(value["metadata"]["id"].as_str().is_some_and(|id| id.len() == 36));
    assert!(value["metadata"]["creation_date"].is_string());
    assert_eq!(value["layers"][0]["layerName"], "Conv2D");
    assert_eq!(value["lossFunction"]["type"], "CategoricalCrossEntropy");
    assert_eq!(value["regularisation"]["type"], "ElasticNet");
}

#[test]
fn test_json_round_trip_preserves_bits() {
    let mut rng = seeded(3);
    let net = Network::new(
        vec![Layer::fully_connected(3, 3, Activation::Tanh, &mut rng)],
        Optimiser::rms_prop(0.01, 0.9, 1e-8),
        Loss::CosineProximity,
        None,
    );
    let json = net.to_json("bits", "none", 0.0).unwrap();
    let loaded = Network::from_json(&json).unwrap();
    let a = net.layers()[0].weights().unwrap();
    let b = loaded.layers()[0].weights().unwrap();
    for (x, y) in a.data().iter().zip(b.data()) {
        assert_eq!(x.to_bits(), y.to_bits());
    }
    assert!(loaded.regulariser().is_none());
}

fn model_json() -> serde_json::Value {
    let json = every_layer().to_json("m", "d", 0.0).unwrap();
    serde_json::from_str(&json).unwrap()
}

fn load_value(value: &serde_json::Value) -> handgrad::error::Result<Network> {
    Network::from_json(&value.to_string())
}

#[test]
fn test_unknown_layer_is_fatal() {
    let mut value = model_json();
    value["layers"][1]["layerName"] = "Attention".into();
    assert!(matches!(
        load_value(&value),
        Err(ModelError::UnknownVariant { kind: "layer", .. })
    ));
}

#[test]
fn test_unknown_optimiser_is_fatal() {
    let mut value = model_json();
    value["optimiser"]["type"] = "Lion".into();
    assert!(matches!(
        load_value(&value),
        Err(ModelError::UnknownVariant { kind: "optimiser", .. })
    ));
}

#[test]
fn test_missing_config_field_is_reported() {
    let mut value = model_json();
    value["layers"][0]["config"]
        .as_object_mut()
        .unwrap()
        .remove("kernel_size");
    assert!(matches!(load_value(&value), Err(ModelError::Config { .. })));
}

#[test]
fn test_tensor_name_mismatch_is_reported() {
    let mut value = model_json();
    value["layers"][5]["tensors"][0]["name"] = "Kernel".into();
    assert!(load_value(&value).is_err());
}

#[test]
fn test_corrupt_tensor_is_reported() {
    let mut value = model_json();
    value["layers"][5]["tensors"][1]["data"] = serde_json::json!([1.0]);
    assert!(matches!(
        load_value(&value),
        Err(ModelError::CorruptTensor { .. })
    ));
}

#[test]
fn test_missing_regularisation_section_is_optional() {
    let mut value = model_json();
    value.as_object_mut().unwrap().remove("regularisation");
    assert!(load_value(&value).unwrap().regulariser().is_none());
}

#[test]
fn test_missing_optimiser_section_is_fatal() {
    let mut value = model_json();
    value.as_object_mut().unwrap().remove("optimiser");
    assert!(matches!(
        load_value(&value),
        Err(ModelError::MissingSection("optimiser"))
    ));
}

#[test]
fn test_reseeded_dropout_is_reproducible_after_load() {
    let mut rng = seeded(31);
    let net = Network::new(
        vec![
            Layer::dropout(0.5, &mut rng),
            Layer::fully_connected(16, 2, Activation::Tanh, &mut rng),
            Layer::dropout(0.5, &mut rng),
        ],
        Optimiser::sgd(0.1),
        Loss::MeanSquaredError,
        None,
    );
    let json = net.to_json("dropout", "none", 0.0).unwrap();
    let mut a = Network::from_json(&json).unwrap();
    let mut b = Network::from_json(&json).unwrap();
    a.reseed(99);
    b.reseed(99);

    let x = Tensor::ones(vec![4, 16]);
    for _ in 0..3 {
        assert_eq!(a.forward(&x), b.forward(&x));
    }
}

#[test]
fn test_missing_file_is_io_error() {
    let result = modelio::load_model(temp_path("does-not-exist"));
    assert!(matches!(result, Err(ModelError::Io(_))));
}

#[test]
fn test_malformed_json_is_json_error() {
    assert!(matches!(Model::from_json("{ not json"), Err(ModelError::Json(_))));
}
