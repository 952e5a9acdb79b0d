use handgrad::layers::{Gru, Lstm};
use handgrad::prelude::*;
use handgrad::seeded;

const STEP: f64 = 1e-6;
const TOLERANCE: f64 = 1e-5;

/// Scalar test loss `Σ_t Σ y_t ⊙ r_t` over a fresh copy of `layer`.
fn scalar_loss(layer: &Layer, xs: &[Tensor], rs: &[Tensor]) -> f64 {
    let mut layer = layer.clone();
    xs.iter()
        .zip(rs)
        .map(|(x, r)| layer.forward(x).multiply(r).sum())
        .sum()
}

/// Analytic input gradients plus the layer after its backward pass.
fn analytic(layer: &Layer, xs: &[Tensor], rs: &[Tensor]) -> (Vec<Tensor>, Layer) {
    let mut layer = layer.clone();
    for x in xs {
        layer.forward(x);
    }
    let mut dx: Vec<Tensor> = rs.iter().rev().map(|r| layer.backward(r)).collect();
    dx.reverse();
    (dx, layer)
}

fn assert_near(analytic: f64, numeric: f64, what: &str) {
    let scale = 1.0_f64.max(analytic.abs()).max(numeric.abs());
    assert!(
        (analytic - numeric).abs() / scale < TOLERANCE,
        "{what}: analytic {analytic} vs numeric {numeric}"
    );
}

fn check_gradients(layer: &Layer, xs: &[Tensor], rs: &[Tensor], check_input: bool) {
    let (dx, trained) = analytic(layer, xs, rs);

    if check_input {
        for (t, x) in xs.iter().enumerate() {
            for i in 0..x.size() {
                let mut plus = xs.to_vec();
                plus[t].data_mut()[i] += STEP;
                let mut minus = xs.to_vec();
                minus[t].data_mut()[i] -= STEP;
                let numeric = (scalar_loss(layer, &plus, rs) - scalar_loss(layer, &minus, rs)) / (2.0 * STEP);
                assert_near(dx[t].data()[i], numeric, &format!("{} dx[{t}][{i}]", layer.name()));
            }
        }
    }

    let weights = layer.weights().unwrap();
    let grads = trained.gradients().unwrap();
    for i in 0..weights.size() {
        let numeric = perturbed(layer, xs, rs, &weights, i, Layer::set_weights);
        assert_near(grads.data()[i], numeric, &format!("{} dW[{i}]", layer.name()));
    }

    if let Some(biases) = layer.biases() {
        let grads = trained.bias_gradients().unwrap();
        for i in 0..biases.size() {
            let numeric = perturbed(layer, xs, rs, &biases, i, Layer::set_biases);
            assert_near(grads.data()[i], numeric, &format!("{} db[{i}]", layer.name()));
        }
    }
}

fn perturbed(
    layer: &Layer,
    xs: &[Tensor],
    rs: &[Tensor],
    flat: &Tensor,
    i: usize,
    set: fn(&mut Layer, &Tensor),
) -> f64 {
    let shifted = |delta: f64| {
        let mut values = flat.clone();
        values.data_mut()[i] += delta;
        let mut copy = layer.clone();
        set(&mut copy, &values);
        scalar_loss(&copy, xs, rs)
    };
    (shifted(STEP) - shifted(-STEP)) / (2.0 * STEP)
}

fn smooth(shape: Vec<usize>, phase: f64) -> Tensor {
    Tensor::from_fn(shape, |i| (i as f64 * 0.37 + phase).sin() * 0.8)
}

#[test]
fn test_fully_connected_gradients() {
    let mut rng = seeded(1);
    let layer = Layer::fully_connected(3, 4, Activation::Tanh, &mut rng);
    let xs = [smooth(vec![2, 3], 0.1)];
    let rs = [smooth(vec![2, 4], 1.3)];
    check_gradients(&layer, &xs, &rs, true);
}

#[test]
fn test_fully_connected_sigmoid_gradients() {
    let mut rng = seeded(2);
    let layer = Layer::fully_connected(2, 2, Activation::Sigmoid, &mut rng);
    check_gradients(&layer, &[smooth(vec![1, 2], 0.4)], &[smooth(vec![1, 2], 2.0)], true);
}

#[test]
fn test_conv2d_gradients() {
    let mut rng = seeded(3);
    let layer = Layer::conv2d(2, 2, 3, 1, 1, Activation::Tanh, &mut rng);
    let xs = [smooth(vec![1, 2, 4, 4], 0.2).multiply_scalar(0.3)];
    let rs = [smooth(vec![1, 2, 4, 4], 0.9)];
    check_gradients(&layer, &xs, &rs, true);
}

#[test]
fn test_strided_conv2d_gradients() {
    let mut rng = seeded(4);
    let layer = Layer::conv2d(1, 2, 2, 2, 0, Activation::Tanh, &mut rng);
    let xs = [smooth(vec![2, 1, 4, 4], 0.5).multiply_scalar(0.3)];
    let rs = [smooth(vec![2, 2, 2, 2], 0.1)];
    check_gradients(&layer, &xs, &rs, true);
}

#[test]
fn test_gru_single_step_gradients() {
    let mut rng = seeded(5);
    let layer = Layer::gru(3, 2, &mut rng);
    check_gradients(&layer, &[smooth(vec![2, 3], 0.3)], &[smooth(vec![2, 2], 1.1)], true);
}

#[test]
fn test_gru_sequence_gradients() {
    let mut rng = seeded(6);
    let layer = Layer::gru(2, 3, &mut rng);
    let xs: Vec<Tensor> = (0..3).map(|t| smooth(vec![1, 2], t as f64)).collect();
    let rs: Vec<Tensor> = (0..3).map(|t| smooth(vec![1, 3], 2.0 + t as f64)).collect();
    check_gradients(&layer, &xs, &rs, true);
}

#[test]
fn test_lstm_single_step_gradients() {
    let mut rng = seeded(7);
    let layer = Layer::lstm(3, 2, &mut rng);
    check_gradients(&layer, &[smooth(vec![2, 3], 0.6)], &[smooth(vec![2, 2], 0.2)], true);
}

#[test]
fn test_lstm_sequence_gradients() {
    let mut rng = seeded(8);
    let layer = Layer::lstm(2, 2, &mut rng);
    let xs: Vec<Tensor> = (0..4).map(|t| smooth(vec![1, 2], 0.5 * t as f64)).collect();
    let rs: Vec<Tensor> = (0..4).map(|t| smooth(vec![1, 2], 1.0 + t as f64)).collect();
    check_gradients(&layer, &xs, &rs, true);
}

#[test]
fn test_embedding_scatter_adds_repeated_indices() {
    let mut rng = seeded(9);
    let mut layer = Layer::embedding(5, 3, &mut rng);
    let table = layer.weights().unwrap();

    let out = layer.forward(&Tensor::new(vec![3], vec![4.0, 1.0, 4.0]));
    assert_eq!(out.shape(), &[3, 3]);
    assert_eq!(out.row(0), table.reshape(vec![5, 3]).row(4));

    let dx = layer.backward(&Tensor::ones(vec![3, 3]));
    assert_eq!(dx.size(), 0);
    let grads = layer.gradients().unwrap().reshape(vec![5, 3]);
    assert_eq!(grads.row(4), Some(&[2.0, 2.0, 2.0][..]));
    assert_eq!(grads.row(1), Some(&[1.0, 1.0, 1.0][..]));
    assert_eq!(grads.row(0), Some(&[0.0, 0.0, 0.0][..]));
}

#[test]
fn test_embedding_out_of_range_panics() {
    let mut rng = seeded(9);
    let mut layer = Layer::embedding(5, 3, &mut rng);
    let result = std::panic::catch_unwind(move || layer.forward(&Tensor::new(vec![1], vec![5.0])));
    assert!(result.is_err());
}

#[test]
fn test_backward_before_forward_panics() {
    let mut rng = seeded(10);
    let mut layer = Layer::fully_connected(2, 2, Activation::Relu, &mut rng);
    let result = std::panic::catch_unwind(move || layer.backward(&Tensor::zeros(vec![1, 2])));
    assert!(result.is_err());
}

#[test]
fn test_flatten_restores_input_shape() {
    let mut layer = Layer::flatten(vec![2, 3, 4, 4]);
    let x = smooth(vec![2, 3, 4, 4], 0.0);
    let y = layer.forward(&x);
    assert_eq!(y.shape(), &[2, 48]);
    assert_eq!(layer.backward(&y), x);
}

#[test]
fn test_reshape_layer() {
    let mut layer = Layer::reshape(vec![1, 6], vec![1, 2, 3]);
    let x = smooth(vec![1, 6], 0.0);
    let y = layer.forward(&x);
    assert_eq!(y.shape(), &[1, 2, 3]);
    assert_eq!(layer.backward(&y).shape(), &[1, 6]);
}

#[test]
fn test_max_pooling_routes_to_winner() {
    let mut layer = Layer::max_pooling(2, 2);
    let x = Tensor::new(vec![1, 1, 2, 4], vec![1.0, 9.0, 3.0, 2.0, 4.0, 0.0, 7.0, 8.0]);
    assert_eq!(layer.forward(&x).data(), &[9.0, 8.0]);
    let dx = layer.backward(&Tensor::new(vec![1, 1, 1, 2], vec![1.0, -1.0]));
    assert_eq!(dx.data(), &[0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, -1.0]);
}

#[test]
fn test_dropout_is_identity_when_not_training() {
    let mut rng = seeded(11);
    let mut layer = Layer::dropout(0.9, &mut rng);
    layer.set_training(false);
    let x = smooth(vec![3, 3], 0.0);
    assert_eq!(layer.forward(&x), x);
}

#[test]
fn test_conv2d_save_load_round_trip() {
    let mut rng = seeded(12);
    let layer = Layer::conv2d(1, 32, 5, 1, 2, Activation::Relu, &mut rng);
    let (config, tensors) = layer.save();
    let loaded = Layer::load(layer.name(), &config, tensors).unwrap();

    let (Layer::Conv2D(a), Layer::Conv2D(b)) = (&layer, &loaded) else {
        panic!("expected two Conv2D layers");
    };
    assert_eq!(a.input_dim(), b.input_dim());
    assert_eq!(a.output_dim(), b.output_dim());
    assert_eq!(a.kernel_size(), b.kernel_size());
    assert_eq!(a.stride(), b.stride());
    assert_eq!(a.padding(), b.padding());
    assert_eq!(a.activation().name(), b.activation().name());
    assert_eq!(layer.weights(), loaded.weights());
    assert_eq!(layer.biases(), loaded.biases());
}

#[test]
fn test_gru_state_persists_until_reset() {
    let mut rng = seeded(13);
    let mut gru = Gru::new(2, 3, &mut rng);
    let x = smooth(vec![1, 2], 0.0);
    let first = gru.forward(&x);
    let second = gru.forward(&x);
    assert_ne!(first, second);

    gru.reset_state();
    assert!(gru.hidden().is_none());
    assert_eq!(gru.forward(&x), first);
}

#[test]
fn test_lstm_hidden_state_survives_save_load() {
    let mut rng = seeded(14);
    let mut lstm = Lstm::new(2, 2, &mut rng);
    let x = smooth(vec![1, 2], 0.7);
    lstm.forward(&x);

    let mut restored = Layer::from(lstm.clone());
    let (config, tensors) = restored.save();
    restored = Layer::load("LSTM", &config, tensors).unwrap();

    let expected = lstm.forward(&x);
    assert_eq!(restored.forward(&x), expected);
}

#[test]
fn test_recurrent_cache_tracks_pending_steps() {
    let mut rng = seeded(16);
    let mut layer = Layer::lstm(2, 3, &mut rng);
    let x = smooth(vec![1, 2], 0.4);
    for _ in 0..3 {
        layer.forward(&x);
    }
    assert_eq!(layer.cached_steps(), 3);

    layer.backward(&Tensor::ones(vec![1, 3]));
    assert_eq!(layer.cached_steps(), 2);

    layer.reset_state();
    assert_eq!(layer.cached_steps(), 0);
}

#[test]
fn test_streaming_predictions_do_not_grow_the_cache() {
    let mut rng = seeded(17);
    let mut net = Network::new(
        vec![Layer::gru(2, 3, &mut rng)],
        Optimiser::sgd(0.1),
        Loss::MeanSquaredError,
        None,
    );
    for t in 0..20 {
        net.predict(&smooth(vec![1, 2], f64::from(t)));
    }
    assert_eq!(net.layers()[0].cached_steps(), 0);
    assert!(net.layers()[0].is_training());
}

#[test]
fn test_recurrent_eval_mode_caches_nothing() {
    let mut rng = seeded(15);
    let mut layer = Layer::gru(2, 2, &mut rng);
    layer.set_training(false);
    layer.forward(&smooth(vec![1, 2], 0.0));
    let result = std::panic::catch_unwind(move || layer.backward(&Tensor::zeros(vec![1, 2])));
    assert!(result.is_err());
}
