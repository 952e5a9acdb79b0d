//! Teaches a GRU to echo the previous element of a binary sequence,
//! driving the recurrent layer one timestep at a time.

use handgrad::prelude::*;
use tracing::info;

const SEQ: usize = 8;
const HIDDEN: usize = 6;

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let mut rng = handgrad::seeded(7);
    let mut gru = Layer::gru(1, HIDDEN, &mut rng);
    let mut head = Layer::fully_connected(HIDDEN, 1, Activation::Sigmoid, &mut rng);
    let mut optimiser = Optimiser::adam(0.02, 0.9, 0.999, 1e-8);
    let loss = Loss::BinaryCrossEntropy;

    let bits: Vec<f64> = (0..SEQ).map(|i| f64::from(u8::from(i % 3 == 0))).collect();
    let inputs: Vec<Tensor> = bits.iter().map(|&b| Tensor::new(vec![1, 1], vec![b])).collect();
    let targets: Vec<Tensor> = std::iter::once(0.0)
        .chain(bits.iter().copied())
        .take(SEQ)
        .map(|b| Tensor::new(vec![1, 1], vec![b]))
        .collect();

    for epoch in 0..300 {
        gru.reset_state();
        let hidden: Vec<Tensor> = inputs.iter().map(|x| gru.forward(x)).collect();

        let mut epoch_loss = 0.0;
        let mut d_hidden = Vec::with_capacity(SEQ);
        for (h, target) in hidden.iter().zip(&targets) {
            let out = head.forward(h);
            let (l, grad) = loss.compute(&out, target);
            epoch_loss += l.sum();
            d_hidden.push(head.backward(&grad));
        }
        // newest step first; the layer carries dh between calls
        for dh in d_hidden.iter().rev() {
            gru.backward(dh);
        }

        for layer_params in [head.parameters_mut(), gru.parameters_mut()] {
            let (weights, biases) = layer_params;
            for p in weights.into_iter().chain(biases) {
                optimiser.update(&mut p.value, &p.grad);
                optimiser.zero_gradients(&mut p.grad);
            }
        }

        if epoch % 50 == 0 {
            info!(epoch, loss = epoch_loss / SEQ as f64, "sequence epoch");
        }
    }

    gru.reset_state();
    gru.set_training(false);
    let predicted: Vec<f64> = inputs
        .iter()
        .map(|x| {
            let h = gru.forward(x);
            head.forward(&h).data()[0]
        })
        .collect();
    info!(?bits, ?predicted, "echo of previous bit");
}

