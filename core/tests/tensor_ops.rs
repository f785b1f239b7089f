use moe_rs::autograd::Variable;
use moe_rs::tensor;
use moe_rs::tensor::{Tensor, TensorOps};

#[test]
fn test_tensor_basics() {
    let t = tensor!([1.0, 2.0, 3.0, 4.0, 5.0, 6.0], [2, 3]);
    assert_eq!(t.shape(), &[2, 3]);
    assert_eq!(t.strides(), &[3, 1]);

    let tt = t.transpose().unwrap();
    assert_eq!(tt.shape(), &[3, 2]);
    assert_eq!(tt.data(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
}

#[test]
fn test_batched_matmul_per_expert() {
    // Two experts: identity and all-ones, one token each.
    let x = Tensor::<f32, 3>::new(vec![1.0, 2.0, 3.0, 4.0], [2, 1, 2]).unwrap();
    let w = Tensor::<f32, 3>::new(vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0, 1.0], [2, 2, 2]).unwrap();
    let y = x.matmul(&w).unwrap();
    assert_eq!(y.shape(), &[2, 1, 2]);
    assert_eq!(y.data(), &[1.0, 2.0, 7.0, 7.0]);
}

#[test]
fn test_gather_scatter_round_trip() {
    // Gather rows in expert-major order, then scatter them back: rows used twice double up.
    let x = Tensor::<f64, 2>::new(vec![1.0, 1.0, 2.0, 2.0, 3.0, 3.0], [3, 2]).unwrap();
    let order = [2, 0, 0];
    let gathered = x.index_select(&order).unwrap();
    assert_eq!(gathered.data(), &[3.0, 3.0, 1.0, 1.0, 1.0, 1.0]);

    let mut back = Tensor::zeros([3, 2]);
    back.index_add(&order, &gathered).unwrap();
    assert_eq!(back.data(), &[2.0, 2.0, 0.0, 0.0, 3.0, 3.0]);
}

#[test]
fn test_topk_rows_lowest_index_wins() {
    let scores = tensor!([0.2, 0.5, 0.5, 0.1, 0.9, 0.9, 0.9, 0.0], [2, 4]);
    let (values, indices) = scores.topk(2).unwrap();
    assert_eq!(values.data(), &[0.5, 0.5, 0.9, 0.9]);
    assert_eq!(indices.data(), &[1, 2, 0, 1]);
    assert!(scores.topk(5).is_err());
}

#[test]
fn test_variable_pipeline_gradient() {
    // L = sum(softmax(x W, axis=1) * c): gradient reaches W through the softmax.
    let x = Variable::new(tensor!([1.0, 0.0, 0.0, 1.0], [2, 2]));
    let w = Variable::new(tensor!([0.5, -0.5, 0.25, 0.75], [2, 2]));
    let c = Variable::new(tensor!([1.0, 0.0, 0.0, 1.0], [2, 2]));

    let probs = x.matmul(&w).unwrap().softmax(1).unwrap();
    let loss = (&probs * &c).unwrap().sum();
    loss.backward().unwrap();

    let g = w.grad().unwrap();
    // Each row of the softmax sums to 1, so pushing one column up pushes the other down.
    let d: &[f64] = g.data();
    assert!((d[0] + d[1]).abs() < 1e-12);
    assert!((d[2] + d[3]).abs() < 1e-12);
    assert!(d[0] > 0.0);
}
