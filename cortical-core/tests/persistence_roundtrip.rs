//! Model/state round-trips must be bit-identical for every layer kind.

use rand::rngs::StdRng;
use rand::SeedableRng;

use cortical_core::descent::TrainingMode;
use cortical_core::layer::{
    Activation, ActivationLayer, BiasLayer, Boundary, ConvolutionLayer, CostKind, CostLayer,
    DenseLayer, DropoutLayer, NodeLayer, NormalizationLayer, PaddingRule, PoolingKind,
    PoolingLayer, SoftmaxLayer,
};
use cortical_core::{CorticalError, Shape};

fn unit3() -> Shape<3> {
    Shape::new([1, 1, 1])
}

#[test]
fn convolution_state_round_trip_is_bit_identical() {
    let mut rng = StdRng::seed_from_u64(404);

    let mut layer = ConvolutionLayer::<f64>::up_sample(
        Shape::new([2, 2, 1, 2]),
        PaddingRule::Same,
        Boundary::Circular,
        Shape::new([2, 2, 1]),
        unit3(),
        unit3(),
    )
    .unwrap();
    layer.randomize_filter(&mut rng, -1.0, 1.0);
    layer.set_training_mode(TrainingMode::Adam);

    // accumulate a gradient so the buffers carry real values
    let mut input = NodeLayer::<f64>::new(Shape::new([2, 2, 1, 1, 1]));
    input.randomize_nodes(&mut rng, -1.0, 1.0);
    input.set_training_mode(TrainingMode::Normal);
    input.zero_delta();
    let out_shape = layer.output_shape(input.shape());
    let mut output = NodeLayer::<f64>::new(out_shape);
    output.set_training_mode(TrainingMode::Normal);
    for index in 0..output.volume() {
        *output.delta_mut(index) = (index as f64) * 0.25 - 1.0;
    }
    layer.backward(&mut input, &output).unwrap();
    layer.descend_adam(1, 0.001, 0.9, 0.99, 1e-8).unwrap();
    layer.backward(&mut input, &output).unwrap();

    let mut buffer = Vec::new();
    layer.save_state(&mut buffer).unwrap();
    let loaded = ConvolutionLayer::<f64>::load_state(&mut buffer.as_slice()).unwrap();

    assert_eq!(loaded.filter(), layer.filter());
    assert_eq!(loaded.jacobian(), layer.jacobian());
    assert_eq!(loaded.momentum_buffer(), layer.momentum_buffer());
    assert_eq!(loaded.velocity_buffer(), layer.velocity_buffer());
    assert_eq!(loaded.training_mode(), TrainingMode::Adam);
    assert_eq!(loaded.step_count(), layer.step_count());
    assert_eq!(loaded.padding(), layer.padding());
    assert_eq!(loaded.inverse_padding(), layer.inverse_padding());
    assert_eq!(loaded.input_dilation(), layer.input_dilation());

    // saving the loaded layer reproduces the byte stream
    let mut again = Vec::new();
    loaded.save_state(&mut again).unwrap();
    assert_eq!(again, buffer);
}

#[test]
fn model_files_omit_training_buffers() {
    let mut rng = StdRng::seed_from_u64(7);
    let mut layer = ConvolutionLayer::<f32>::down_sample(
        Shape::new([3, 3, 1, 1]),
        PaddingRule::Valid,
        Boundary::Zero,
        unit3(),
        unit3(),
    )
    .unwrap();
    layer.randomize_filter(&mut rng, -1.0, 1.0);
    layer.set_training_mode(TrainingMode::Adam);

    let mut model = Vec::new();
    layer.save_model(&mut model).unwrap();
    let mut state = Vec::new();
    layer.save_state(&mut state).unwrap();
    assert!(state.len() > model.len());

    let loaded = ConvolutionLayer::<f32>::load_model(&mut model.as_slice()).unwrap();
    assert_eq!(loaded.training_mode(), TrainingMode::Off);
    assert!(loaded.jacobian().is_empty());
    assert_eq!(loaded.filter(), layer.filter());
}

#[test]
fn dense_and_bias_round_trips() {
    let mut rng = StdRng::seed_from_u64(11);

    let input_shape = Shape::new([4, 1, 1, 1, 1]);
    let output_shape = Shape::new([3, 1, 1, 1, 1]);
    let mut dense = DenseLayer::<f32>::new(&input_shape, &output_shape).unwrap();
    dense.randomize_weights(&mut rng, -1.0, 1.0);
    dense.set_training_mode(TrainingMode::Momentum);

    let mut buffer = Vec::new();
    dense.save_state(&mut buffer).unwrap();
    let loaded = DenseLayer::<f32>::load_state(&mut buffer.as_slice()).unwrap();
    assert_eq!(loaded.weights(), dense.weights());
    assert_eq!(loaded.training_mode(), TrainingMode::Momentum);

    let mut bias = BiasLayer::<f32>::new(Shape::new([4, 1, 1, 1])).unwrap();
    bias.randomize_bias(&mut rng, -0.5, 0.5);
    let mut buffer = Vec::new();
    bias.save_model(&mut buffer).unwrap();
    let loaded = BiasLayer::<f32>::load_model(&mut buffer.as_slice()).unwrap();
    assert_eq!(loaded.bias(), bias.bias());
}

#[test]
fn stateless_layer_round_trips() {
    let pooling = PoolingLayer::new(
        PoolingKind::Max,
        Shape::new([2, 2, 1]),
        Shape::new([2, 2, 1]),
        unit3(),
    )
    .unwrap();
    let mut buffer = Vec::new();
    pooling.save(&mut buffer).unwrap();
    assert_eq!(PoolingLayer::load(&mut buffer.as_slice()).unwrap(), pooling);

    let activation = ActivationLayer::<f32>::with_coefficient(Activation::Elu, 0.5);
    let mut buffer = Vec::new();
    activation.save(&mut buffer).unwrap();
    let loaded = ActivationLayer::<f32>::load(&mut buffer.as_slice()).unwrap();
    assert_eq!(loaded.activation(), Activation::Elu);

    let dropout = DropoutLayer::new(Shape::new([4, 4, 1, 1]), 0.5).unwrap();
    let mut buffer = Vec::new();
    dropout.save(&mut buffer).unwrap();
    assert_eq!(
        DropoutLayer::load(&mut buffer.as_slice()).unwrap().rate(),
        0.5
    );

    let softmax = SoftmaxLayer::new();
    let mut buffer = Vec::new();
    softmax.save(&mut buffer).unwrap();
    assert_eq!(SoftmaxLayer::load(&mut buffer.as_slice()).unwrap(), softmax);

    let cost = CostLayer::new(CostKind::KullbackLeibler);
    let mut buffer = Vec::new();
    cost.save(&mut buffer).unwrap();
    assert_eq!(CostLayer::load(&mut buffer.as_slice()).unwrap(), cost);
}

#[test]
fn normalization_state_round_trip() {
    let mut rng = StdRng::seed_from_u64(13);
    let mut norm = NormalizationLayer::<f64>::new(3).unwrap();
    norm.set_training_mode(TrainingMode::Adam);

    let mut layer = NodeLayer::<f64>::new(Shape::new([2, 2, 1, 3, 2]));
    layer.randomize_nodes(&mut rng, -1.0, 1.0);
    layer.set_training_mode(TrainingMode::Normal);
    norm.compute_statistics(&layer).unwrap();
    for index in 0..layer.volume() {
        *layer.delta_mut(index) = 0.125 * index as f64;
    }
    norm.backward(&mut layer).unwrap();

    let mut buffer = Vec::new();
    norm.save_state(&mut buffer).unwrap();
    let loaded = NormalizationLayer::<f64>::load_state(&mut buffer.as_slice()).unwrap();

    assert_eq!(loaded.mean(), norm.mean());
    assert_eq!(loaded.variance(), norm.variance());
    assert_eq!(loaded.beta_jacobian(), norm.beta_jacobian());
    assert_eq!(loaded.gamma_jacobian(), norm.gamma_jacobian());
}

#[test]
fn wrong_layer_tag_is_rejected() {
    let pooling = PoolingLayer::new(
        PoolingKind::Average,
        Shape::new([2, 2, 1]),
        Shape::new([2, 2, 1]),
        unit3(),
    )
    .unwrap();
    let mut buffer = Vec::new();
    pooling.save(&mut buffer).unwrap();

    let result = ConvolutionLayer::<f32>::load_model(&mut buffer.as_slice());
    assert!(matches!(
        result,
        Err(CorticalError::InvalidConfiguration(_))
    ));
}

#[test]
fn truncated_file_surfaces_io_error() {
    let mut rng = StdRng::seed_from_u64(3);
    let mut layer = ConvolutionLayer::<f32>::down_sample(
        Shape::new([3, 3, 1, 1]),
        PaddingRule::Valid,
        Boundary::Zero,
        unit3(),
        unit3(),
    )
    .unwrap();
    layer.randomize_filter(&mut rng, -1.0, 1.0);

    let mut buffer = Vec::new();
    layer.save_model(&mut buffer).unwrap();
    buffer.truncate(buffer.len() / 2);

    assert!(matches!(
        ConvolutionLayer::<f32>::load_model(&mut buffer.as_slice()),
        Err(CorticalError::Io(_))
    ));
}
