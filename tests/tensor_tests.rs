use handgrad::backend::{self, Execution};
use handgrad::prelude::*;
use handgrad::tensor;

fn assert_close(actual: &[f64], expected: &[f64], tol: f64) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!((a - e).abs() <= tol, "element {i}: {a} vs {e}");
    }
}

#[test]
fn test_tensor_creation() {
    let t = Tensor::new(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]);
    assert_eq!(t.shape(), &[2, 2]);
    assert_eq!(t.data(), &[1.0, 2.0, 3.0, 4.0]);
    assert_eq!(t.size(), 4);
}

#[test]
fn test_tensor_macro() {
    let t = tensor!([[1.0, 2.0], [3.0, 4.0]]);
    assert_eq!(t.shape(), &[2, 2]);
    assert_eq!(t.data(), &[1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn test_tensor_shape_mismatch_panics() {
    let result = std::panic::catch_unwind(|| {
        Tensor::new(vec![2, 2], vec![1.0, 2.0, 3.0]);
    });
    assert!(result.is_err());
}

#[test]
fn test_reshape_round_trip() {
    let t = Tensor::from_fn(vec![2, 3, 4], |i| i as f64 * 0.5);
    let back = t.reshape(vec![6, 4]).reshape(vec![4, 6]).reshape(t.shape().to_vec());
    assert_eq!(back, t);
}

#[test]
fn test_reshape_element_count_panics() {
    let result = std::panic::catch_unwind(|| Tensor::zeros(vec![2, 3]).reshape(vec![4, 2]));
    assert!(result.is_err());
}

#[test]
fn test_transpose_of_product() {
    let a = Tensor::new(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let b = Tensor::new(vec![3, 2], vec![7.0, 8.0, 9.0, 10.0, 11.0, 12.0]);
    let lhs = a.dot(&b).transpose();
    let rhs = b.transpose().dot(&a.transpose());
    assert_eq!(lhs, rhs);
    assert_eq!(a.dot(&b).data(), &[58.0, 64.0, 139.0, 154.0]);
}

#[test]
fn test_dot_inner_dimension_panics() {
    let result = std::panic::catch_unwind(|| Tensor::zeros(vec![2, 3]).dot(&Tensor::zeros(vec![2, 3])));
    assert!(result.is_err());
}

#[test]
fn test_split_concatenate_round_trip() {
    let t = Tensor::from_fn(vec![3, 4], |i| i as f64);
    let parts = t.split(&[5, 0, 4, 3]);
    assert_eq!(parts.len(), 4);
    assert_eq!(parts[1].size(), 0);
    let refs: Vec<&Tensor> = parts.iter().collect();
    assert_eq!(Tensor::concatenate(&refs).data(), t.data());
}

#[test]
fn test_sum_along_batch() {
    let t = Tensor::new(vec![3, 2], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let s = t.sum_along_batch();
    assert_eq!(s.shape(), &[1, 2]);
    assert_eq!(s.data(), &[9.0, 12.0]);
}

#[test]
fn test_parallel_execution_matches_sequential() {
    let a = Tensor::from_fn(vec![7, 5], |i| (i as f64).sin());
    let b = Tensor::from_fn(vec![5, 3], |i| (i as f64).cos());
    let x = Tensor::from_fn(vec![2, 2, 6, 6], |i| (i as f64 * 0.3).sin());
    let k = Tensor::from_fn(vec![3, 2, 3, 3], |i| (i as f64 * 0.7).cos());

    backend::set_execution(Execution::Sequential);
    let (seq_dot, seq_conv) = (a.dot(&b), x.conv2d(&k, 1, 1));
    backend::set_execution(Execution::Parallel);
    let (par_dot, par_conv) = (a.dot(&b), x.conv2d(&k, 1, 1));
    backend::set_execution(Execution::Sequential);

    assert_eq!(seq_dot, par_dot);
    assert_eq!(seq_conv, par_conv);
}

#[test]
fn test_sigmoid_backward_at_forward_image() {
    let x = Tensor::new(vec![3], vec![0.0, 2.0, -2.0]);
    let y = Activation::Sigmoid.forward(&x);
    let d = Activation::Sigmoid.backward(&y);
    assert_close(d.data(), &[0.25, 0.104_993_585_403_506_52, 0.104_993_585_403_506_52], 1e-9);
}

#[test]
fn test_activation_derivative_table() {
    let x = Tensor::new(vec![4], vec![-1.5, -0.2, 0.3, 2.0]);

    let tanh = Activation::Tanh.forward(&x);
    let expected: Vec<f64> = x.data().iter().map(|v| 1.0 - v.tanh().powi(2)).collect();
    assert_close(Activation::Tanh.backward(&tanh).data(), &expected, 1e-9);

    let relu = Activation::Relu.forward(&x);
    assert_eq!(relu.data(), &[0.0, 0.0, 0.3, 2.0]);
    assert_eq!(Activation::Relu.backward(&relu).data(), &[0.0, 0.0, 1.0, 1.0]);

    let leaky = Activation::LeakyRelu { alpha: 0.1 };
    let y = leaky.forward(&x);
    assert_close(y.data(), &[-0.15, -0.02, 0.3, 2.0], 1e-12);
    assert_eq!(leaky.backward(&y).data(), &[0.1, 0.1, 1.0, 1.0]);
}

#[test]
fn test_mse_example() {
    let predicted = Tensor::new(vec![4], vec![3.0, -0.5, 2.0, 7.0]);
    let actual = Tensor::new(vec![4], vec![2.5, 0.0, 2.0, 8.0]);
    let (loss, grad) = Loss::MeanSquaredError.compute(&predicted, &actual);
    assert_close(&[loss.sum()], &[0.75], 1e-12);
    assert_close(grad.data(), &[0.5, -0.5, 0.0, -1.0], 1e-12);
}

#[test]
fn test_bce_survives_saturated_predictions() {
    let predicted = Tensor::new(vec![2], vec![0.0, 1.0]);
    let actual = Tensor::new(vec![2], vec![0.0, 1.0]);
    let (loss, grad) = Loss::BinaryCrossEntropy.compute(&predicted, &actual);
    assert!(loss.data().iter().all(|v| v.is_finite()));
    assert!(grad.data().iter().all(|v| v.is_finite()));
}

#[test]
fn test_cosine_gradient_matches_finite_difference() {
    let p = Tensor::new(vec![3], vec![0.3, -1.2, 0.8]);
    let a = Tensor::new(vec![3], vec![1.0, 0.5, -0.4]);
    let (_, grad) = Loss::CosineProximity.compute(&p, &a);
    let h = 1e-6;
    for i in 0..3 {
        let mut plus = p.clone();
        plus.data_mut()[i] += h;
        let mut minus = p.clone();
        minus.data_mut()[i] -= h;
        let numeric = (Loss::CosineProximity.compute(&plus, &a).0.sum()
            - Loss::CosineProximity.compute(&minus, &a).0.sum())
            / (2.0 * h);
        assert!((numeric - grad.data()[i]).abs() < 1e-6, "component {i}");
    }
}

#[test]
fn test_cosine_zero_vector_is_finite() {
    let p = Tensor::zeros(vec![3]);
    let a = Tensor::new(vec![3], vec![1.0, 2.0, 3.0]);
    let (loss, grad) = Loss::CosineProximity.compute(&p, &a);
    assert!(loss.sum().is_finite());
    assert!(grad.data().iter().all(|v| v.is_finite()));
}
