use super::*;
use crate::descent::TrainingMode;
use approx::assert_relative_eq;

fn unit3() -> Shape<3> {
    Shape::new([1, 1, 1])
}

fn node_layer(shape: [usize; 5], data: Vec<f64>) -> NodeLayer<f64> {
    NodeLayer::from_vec(Shape::new(shape), data).unwrap()
}

#[test]
fn rejects_zero_extents() {
    assert!(PoolingLayer::new(
        PoolingKind::Max,
        Shape::new([2, 0, 1]),
        unit3(),
        unit3()
    )
    .is_err());
}

#[test]
fn output_shape_matches_formula() {
    let layer = PoolingLayer::new(
        PoolingKind::Max,
        Shape::new([2, 2, 1]),
        Shape::new([2, 2, 1]),
        unit3(),
    )
    .unwrap();
    let out = layer.output_shape(&Shape::new([4, 4, 1, 3, 2]));
    assert_eq!(out.dims(), &[2, 2, 1, 3, 2]);

    // dilated window: 3 taps spread over 5 positions
    let dilated = PoolingLayer::new(
        PoolingKind::Average,
        Shape::new([3, 1, 1]),
        unit3(),
        Shape::new([2, 1, 1]),
    )
    .unwrap();
    let out = dilated.output_shape(&Shape::new([5, 1, 1, 1, 1]));
    assert_eq!(out.dims(), &[1, 1, 1, 1, 1]);
}

#[test]
fn forward_rejects_mismatched_output_shape() {
    let layer = PoolingLayer::new(
        PoolingKind::Max,
        Shape::new([2, 2, 1]),
        Shape::new([2, 2, 1]),
        unit3(),
    )
    .unwrap();
    let input = node_layer([4, 4, 1, 1, 1], (1..=16).map(f64::from).collect());
    let mut output = NodeLayer::<f64>::new(Shape::new([3, 3, 1, 1, 1]));
    assert!(matches!(
        layer.forward(&input, &mut output),
        Err(CorticalError::MismatchedShapes { .. })
    ));
}

#[test]
fn max_pooling_two_by_two_window() {
    let layer = PoolingLayer::new(
        PoolingKind::Max,
        Shape::new([2, 2, 1]),
        Shape::new([2, 2, 1]),
        unit3(),
    )
    .unwrap();

    let input = node_layer([2, 2, 1, 1, 1], vec![1.0, 2.0, 3.0, 4.0]);
    let mut output = NodeLayer::<f64>::new(Shape::new([1, 1, 1, 1, 1]));
    layer.forward(&input, &mut output).unwrap();
    assert_eq!(output.node(0), 4.0);
}

#[test]
fn max_pooling_backward_routes_delta_to_argmax() {
    let layer = PoolingLayer::new(
        PoolingKind::Max,
        Shape::new([2, 2, 1]),
        Shape::new([2, 2, 1]),
        unit3(),
    )
    .unwrap();

    let mut input = node_layer([2, 2, 1, 1, 1], vec![1.0, 2.0, 3.0, 4.0]);
    input.set_training_mode(TrainingMode::Normal);
    // stale values the backward pass must clear
    for index in 0..4 {
        *input.delta_mut(index) = -1.0;
    }

    let mut output = NodeLayer::<f64>::new(Shape::new([1, 1, 1, 1, 1]));
    output.set_training_mode(TrainingMode::Normal);
    *output.delta_mut(0) = 5.0;

    layer.backward(&mut input, &output).unwrap();

    assert_eq!(input.delta(0), 0.0);
    assert_eq!(input.delta(1), 0.0);
    assert_eq!(input.delta(2), 0.0);
    assert_eq!(input.delta(3), 5.0);
}

#[test]
fn max_backward_ties_go_to_first_seen() {
    let layer = PoolingLayer::new(
        PoolingKind::Max,
        Shape::new([2, 1, 1]),
        Shape::new([2, 1, 1]),
        unit3(),
    )
    .unwrap();

    let mut input = node_layer([2, 1, 1, 1, 1], vec![7.0, 7.0]);
    input.set_training_mode(TrainingMode::Normal);
    let mut output = NodeLayer::<f64>::new(Shape::new([1, 1, 1, 1, 1]));
    output.set_training_mode(TrainingMode::Normal);
    *output.delta_mut(0) = 3.0;

    layer.backward(&mut input, &output).unwrap();
    assert_eq!(input.delta(0), 3.0);
    assert_eq!(input.delta(1), 0.0);
}

#[test]
fn average_pooling_two_by_two_window() {
    let layer = PoolingLayer::new(
        PoolingKind::Average,
        Shape::new([2, 2, 1]),
        Shape::new([2, 2, 1]),
        unit3(),
    )
    .unwrap();

    let input = node_layer([2, 2, 1, 1, 1], vec![1.0, 2.0, 3.0, 4.0]);
    let mut output = NodeLayer::<f64>::new(Shape::new([1, 1, 1, 1, 1]));
    layer.forward(&input, &mut output).unwrap();
    assert_relative_eq!(output.node(0), 2.5);
}

#[test]
fn average_pooling_backward_spreads_delta_uniformly() {
    let layer = PoolingLayer::new(
        PoolingKind::Average,
        Shape::new([2, 2, 1]),
        Shape::new([2, 2, 1]),
        unit3(),
    )
    .unwrap();

    let mut input = node_layer([2, 2, 1, 1, 1], vec![1.0, 2.0, 3.0, 4.0]);
    input.set_training_mode(TrainingMode::Normal);
    let mut output = NodeLayer::<f64>::new(Shape::new([1, 1, 1, 1, 1]));
    output.set_training_mode(TrainingMode::Normal);
    *output.delta_mut(0) = 4.0;

    layer.backward(&mut input, &output).unwrap();
    for index in 0..4 {
        assert_relative_eq!(input.delta(index), 1.0);
    }
}

#[test]
fn overlapping_windows_overwrite_earlier_deltas() {
    // stride 1 with a 2-wide window: the second window's write wins on the
    // shared position
    let layer = PoolingLayer::new(
        PoolingKind::Average,
        Shape::new([2, 1, 1]),
        unit3(),
        unit3(),
    )
    .unwrap();

    let mut input = node_layer([3, 1, 1, 1, 1], vec![1.0, 2.0, 3.0]);
    input.set_training_mode(TrainingMode::Normal);
    let mut output = NodeLayer::<f64>::new(Shape::new([2, 1, 1, 1, 1]));
    output.set_training_mode(TrainingMode::Normal);
    *output.delta_mut(0) = 2.0;
    *output.delta_mut(1) = 6.0;

    layer.backward(&mut input, &output).unwrap();
    assert_relative_eq!(input.delta(0), 1.0);
    // shared position: overwritten by the second window, not accumulated
    assert_relative_eq!(input.delta(1), 3.0);
    assert_relative_eq!(input.delta(2), 3.0);
}

#[test]
fn channel_and_batch_windows_stay_separate() {
    let layer = PoolingLayer::new(
        PoolingKind::Max,
        Shape::new([2, 1, 1]),
        Shape::new([2, 1, 1]),
        unit3(),
    )
    .unwrap();

    // two channels, two batches, two values each
    let input = node_layer(
        [2, 1, 1, 2, 2],
        vec![1.0, 2.0, 30.0, 4.0, 5.0, 60.0, 7.0, 80.0],
    );
    let mut output = NodeLayer::<f64>::new(Shape::new([1, 1, 1, 2, 2]));
    layer.forward(&input, &mut output).unwrap();
    assert_eq!(output.nodes().as_slice(), &[2.0, 30.0, 60.0, 80.0]);
}

#[test]
fn save_load_round_trip() {
    let layer = PoolingLayer::new(
        PoolingKind::Average,
        Shape::new([3, 2, 1]),
        Shape::new([2, 2, 1]),
        Shape::new([1, 2, 1]),
    )
    .unwrap();

    let mut buffer = Vec::new();
    layer.save(&mut buffer).unwrap();
    let loaded = PoolingLayer::load(&mut buffer.as_slice()).unwrap();
    assert_eq!(loaded, layer);
}
