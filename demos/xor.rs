use handgrad::prelude::*;
use tracing::{info, warn};

const PATH_TO_MODEL: &str = "checkpoints/xor/model.json";

fn main() -> handgrad::error::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let inputs = [[0.0, 0.0], [0.0, 1.0], [1.0, 0.0], [1.0, 1.0]];
    let targets = [0.0, 1.0, 1.0, 0.0];

    let data: Vec<Tensor> = inputs.iter().map(|x| Tensor::new(vec![1, 2], x.to_vec())).collect();
    let labels: Vec<Tensor> = targets.iter().map(|&y| Tensor::new(vec![1, 1], vec![y])).collect();

    let mut model = match Network::load(PATH_TO_MODEL) {
        Ok(model) => {
            info!(path = PATH_TO_MODEL, "resuming from checkpoint");
            model
        }
        Err(err) => {
            warn!(%err, "no usable checkpoint, starting fresh");
            let mut rng = handgrad::seeded(0);
            Network::new(
                vec![
                    Layer::fully_connected(2, 4, Activation::Tanh, &mut rng),
                    Layer::fully_connected(4, 1, Activation::Sigmoid, &mut rng),
                ],
                Optimiser::sgd_momentum(0.4, 0.5),
                Loss::BinaryCrossEntropy,
                None,
            )
        }
    };

    let mut total = 0.0;
    for round in 0..20 {
        total += model.train(&data, &labels, 100);

        let correct = data
            .iter()
            .zip(&targets)
            .filter(|(x, y)| (model.predict(x).data()[0] > 0.5) == (**y > 0.5))
            .count();
        info!(round, total, correct, "evaluation");
        if correct == data.len() {
            break;
        }
    }

    if let Some(dir) = std::path::Path::new(PATH_TO_MODEL).parent() {
        std::fs::create_dir_all(dir)?;
    }
    model.save(PATH_TO_MODEL, "xor", "xor-truth-table", total)?;
    Ok(())
}
