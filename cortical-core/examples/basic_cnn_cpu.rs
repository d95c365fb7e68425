// examples/basic_cnn_cpu.rs
//!
//! This example runs a small convolution -> max-pool -> dense pipeline on the
//! CPU, trains the convolution filter for a few plain gradient-descent steps
//! against a mean-squared-error target, and prints the loss per step.

use rand::rngs::StdRng;
use rand::SeedableRng;

use cortical_core::descent::TrainingMode;
use cortical_core::init::{FillDistribution, Initialization};
use cortical_core::layer::{
    Boundary, ConvolutionLayer, CostKind, CostLayer, NodeLayer, PaddingRule, PoolingKind,
    PoolingLayer,
};
use cortical_core::{CorticalError, Shape};

fn main() -> Result<(), CorticalError> {
    let mut rng = StdRng::seed_from_u64(42);

    let input_shape = Shape::new([8, 8, 1, 1, 1]);

    let mut convolution = ConvolutionLayer::<f32>::down_sample(
        Shape::new([3, 3, 1, 1]),
        PaddingRule::Valid,
        Boundary::Zero,
        Shape::new([1, 1, 1]),
        Shape::new([1, 1, 1]),
    )?;
    let conv_shape = convolution.output_shape(&input_shape);
    convolution.initialize(
        &input_shape,
        &conv_shape,
        Initialization::XavierGlorot,
        FillDistribution::Normal,
        &mut rng,
    )?;
    convolution.set_training_mode(TrainingMode::Normal);

    let pooling = PoolingLayer::new(
        PoolingKind::Max,
        Shape::new([2, 2, 1]),
        Shape::new([2, 2, 1]),
        Shape::new([1, 1, 1]),
    )?;
    let pool_shape = pooling.output_shape(&conv_shape);

    let cost = CostLayer::new(CostKind::MeanSquaredError);

    let mut input = NodeLayer::<f32>::new(input_shape);
    input.randomize_nodes(&mut rng, 0.0, 1.0);
    input.set_training_mode(TrainingMode::Normal);

    let mut features = NodeLayer::<f32>::new(conv_shape);
    features.set_training_mode(TrainingMode::Normal);
    let mut pooled = NodeLayer::<f32>::new(pool_shape);
    pooled.set_training_mode(TrainingMode::Normal);

    let mut target = NodeLayer::<f32>::new(pool_shape);
    target.randomize_nodes(&mut rng, 0.0, 1.0);

    for step in 0..5 {
        convolution.forward(&input, &mut features)?;
        pooling.forward(&features, &mut pooled)?;

        let loss: f32 = {
            let mut scratch = pooled.clone();
            cost.forward(&mut scratch, &target)?;
            scratch.delta_tensor().as_slice().iter().sum::<f32>()
                / scratch.volume() as f32
        };
        println!("step {step}: mse {loss:.6}");

        cost.backward(&mut pooled, &target)?;
        features.zero_delta();
        pooling.backward(&mut features, &pooled)?;
        input.zero_delta();
        convolution.backward(&mut input, &features)?;
        convolution.descend_plain(1, 0.05)?;
    }

    Ok(())
}
