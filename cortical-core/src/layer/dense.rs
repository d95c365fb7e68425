use std::io::{Read, Write};

use rand::Rng;

use crate::descent::{
    allocate_training_buffers, check_finite, descend_adam, descend_momentum, descend_plain,
    validate_adam_hyper, StepCounter, TrainingMode,
};
use crate::element::Element;
use crate::error::CorticalError;
use crate::init::{initialize, FillDistribution, Initialization};
use crate::layer::node::NodeLayer;
use crate::layer::{Layer, LayerKind};
use crate::persist::{expect_tag, read_u64, read_u8, write_u64, write_u8};
use crate::shape::Shape;
use crate::tensor::Tensor;

/// Fully-connected layer over flattened per-batch volumes.
///
/// Weights are 2-dimensional: `[input_volume, output_volume]`, laid out so
/// `weights[o * input_volume + i]` connects input node `i` to output node `o`.
#[derive(Debug, Clone)]
pub struct DenseLayer<T: Element> {
    weights: Tensor<T, 2>,
    jacobian: Tensor<T, 2>,
    momentum: Tensor<T, 2>,
    velocity: Tensor<T, 2>,
    mode: TrainingMode,
    steps: StepCounter,
    debug_checks: bool,
}

impl<T: Element> DenseLayer<T> {
    /// Layer connecting the spatial volume of `input_shape` to that of
    /// `output_shape`, weights zeroed.
    pub fn new(input_shape: &Shape<5>, output_shape: &Shape<5>) -> Result<Self, CorticalError> {
        let input_volume = input_shape.spatial_volume();
        let output_volume = output_shape.spatial_volume();
        if input_volume == 0 || output_volume == 0 {
            return Err(CorticalError::InvalidConfiguration(
                "dense layer requires non-empty input and output shapes".to_string(),
            ));
        }
        Ok(Self {
            weights: Tensor::new(Shape::new([input_volume, output_volume])),
            jacobian: Tensor::unallocated(),
            momentum: Tensor::unallocated(),
            velocity: Tensor::unallocated(),
            mode: TrainingMode::Off,
            steps: StepCounter::new(),
            debug_checks: false,
        })
    }

    pub fn weights(&self) -> &Tensor<T, 2> {
        &self.weights
    }

    pub fn weights_mut(&mut self) -> &mut Tensor<T, 2> {
        &mut self.weights
    }

    pub fn jacobian(&self) -> &Tensor<T, 2> {
        &self.jacobian
    }

    pub fn training_mode(&self) -> TrainingMode {
        self.mode
    }

    pub fn step_count(&self) -> u64 {
        self.steps.count()
    }

    pub fn set_debug_checks(&mut self, enabled: bool) {
        self.debug_checks = enabled;
    }

    pub fn set_training_mode(&mut self, mode: TrainingMode) {
        self.mode = mode;
        allocate_training_buffers(
            mode,
            *self.weights.shape(),
            &mut self.jacobian,
            &mut self.momentum,
            &mut self.velocity,
        );
    }

    pub fn fill_weights(&mut self, value: T) {
        self.weights.fill(value);
    }

    pub fn randomize_weights<R: Rng + ?Sized>(&mut self, rng: &mut R, min: T, max: T) {
        self.weights.randomize(rng, min, max);
    }

    pub fn initialize<R: Rng + ?Sized>(
        &mut self,
        initialization: Initialization,
        distribution: FillDistribution,
        rng: &mut R,
    ) -> Result<(), CorticalError> {
        let fan_in = self.weights.shape().width();
        let fan_out = self.weights.shape().height();
        initialize(
            &mut self.weights,
            fan_in,
            fan_out,
            initialization,
            distribution,
            rng,
        )
    }

    fn check_shapes(
        &self,
        input_shape: &Shape<5>,
        output_shape: &Shape<5>,
        operation: &str,
    ) -> Result<(), CorticalError> {
        let expected = [
            self.weights.shape().width(),
            self.weights.shape().height(),
        ];
        let actual = [
            input_shape.spatial_volume(),
            output_shape.spatial_volume(),
        ];
        if expected != actual || input_shape.batches() != output_shape.batches() {
            return Err(CorticalError::mismatched_shapes(
                &expected,
                &actual,
                operation,
            ));
        }
        Ok(())
    }

    /// Forward pass: `out[o] = sum_i w[o, i] * in[i]` per batch.
    pub fn forward(
        &self,
        input: &NodeLayer<T>,
        output: &mut NodeLayer<T>,
    ) -> Result<(), CorticalError> {
        let input_shape = *input.shape();
        let output_shape = *output.shape();
        self.check_shapes(&input_shape, &output_shape, "dense forward")?;

        let input_volume = input_shape.spatial_volume();
        let output_volume = output_shape.spatial_volume();

        for batch in 0..input_shape.batches() {
            let input_base = batch * input_volume;
            let output_base = batch * output_volume;

            for o in 0..output_volume {
                let weight_base = o * input_volume;
                let mut sum = T::zero();
                for i in 0..input_volume {
                    sum += self.weights[weight_base + i] * input.node(input_base + i);
                }
                *output.node_mut(output_base + o) = sum;
            }
        }

        Ok(())
    }

    /// Backward pass: accumulates the weight jacobian and overwrites the
    /// input delta with `sum_o w[o, i] * delta[o]`.
    pub fn backward(
        &mut self,
        input: &mut NodeLayer<T>,
        output: &NodeLayer<T>,
    ) -> Result<(), CorticalError> {
        let input_shape = *input.shape();
        let output_shape = *output.shape();
        self.check_shapes(&input_shape, &output_shape, "dense backward")?;

        if self.mode == TrainingMode::Off {
            return Err(CorticalError::IncorrectTrainingMode {
                required: TrainingMode::Normal,
                actual: self.mode,
            });
        }
        if input.training_mode() == TrainingMode::Off {
            return Err(CorticalError::IncorrectTrainingMode {
                required: TrainingMode::Normal,
                actual: input.training_mode(),
            });
        }

        let input_volume = input_shape.spatial_volume();
        let output_volume = output_shape.spatial_volume();

        for batch in 0..input_shape.batches() {
            let input_base = batch * input_volume;
            let output_base = batch * output_volume;

            for i in 0..input_volume {
                let node = input.node(input_base + i);
                let mut delta = T::zero();

                for o in 0..output_volume {
                    let weight_index = o * input_volume + i;
                    let out_delta = output.delta(output_base + o);

                    self.jacobian[weight_index] += node * out_delta;
                    delta += self.weights[weight_index] * out_delta;
                }

                *input.delta_mut(input_base + i) = delta;
            }
        }

        Ok(())
    }

    pub fn descend_plain(&mut self, batch_size: usize, step_size: T) -> Result<(), CorticalError> {
        if self.mode != TrainingMode::Normal {
            return Err(CorticalError::IncorrectTrainingMode {
                required: TrainingMode::Normal,
                actual: self.mode,
            });
        }
        descend_plain(&mut self.weights, &mut self.jacobian, batch_size, step_size);
        self.steps.tick();
        if self.debug_checks {
            check_finite(&self.weights, "dense plain descent")?;
        }
        Ok(())
    }

    pub fn descend_momentum(
        &mut self,
        batch_size: usize,
        step_size: T,
        momentum_step: T,
    ) -> Result<(), CorticalError> {
        if self.mode != TrainingMode::Momentum {
            return Err(CorticalError::IncorrectTrainingMode {
                required: TrainingMode::Momentum,
                actual: self.mode,
            });
        }
        descend_momentum(
            &mut self.weights,
            &mut self.jacobian,
            &mut self.momentum,
            batch_size,
            step_size,
            momentum_step,
        );
        self.steps.tick();
        if self.debug_checks {
            check_finite(&self.weights, "dense momentum descent")?;
        }
        Ok(())
    }

    pub fn descend_adam(
        &mut self,
        batch_size: usize,
        step_size: T,
        beta1: T,
        beta2: T,
        epsilon: T,
    ) -> Result<(), CorticalError> {
        if self.mode != TrainingMode::Adam {
            return Err(CorticalError::IncorrectTrainingMode {
                required: TrainingMode::Adam,
                actual: self.mode,
            });
        }
        validate_adam_hyper(beta1, beta2, epsilon)?;
        descend_adam(
            &mut self.weights,
            &mut self.jacobian,
            &mut self.momentum,
            &mut self.velocity,
            batch_size,
            step_size,
            beta1,
            beta2,
            epsilon,
            self.steps.count(),
        );
        self.steps.tick();
        if self.debug_checks {
            check_finite(&self.weights, "dense adam descent")?;
        }
        Ok(())
    }

    pub fn save_model<W: Write + ?Sized>(&self, writer: &mut W) -> Result<(), CorticalError> {
        write_u8(writer, LayerKind::Dense.tag())?;
        self.weights.save(writer)?;
        Ok(())
    }

    pub fn save_state<W: Write + ?Sized>(&self, writer: &mut W) -> Result<(), CorticalError> {
        write_u8(writer, LayerKind::Dense.tag())?;
        self.weights.save(writer)?;
        write_u8(writer, self.mode.tag())?;
        self.jacobian.save(writer)?;
        self.momentum.save(writer)?;
        self.velocity.save(writer)?;
        write_u64(writer, self.steps.count())?;
        Ok(())
    }

    pub fn load_model<R: Read + ?Sized>(reader: &mut R) -> Result<Self, CorticalError> {
        expect_tag(reader, LayerKind::Dense.tag(), "layer")?;
        let weights = Tensor::<T, 2>::load(reader)?;
        Ok(Self {
            weights,
            jacobian: Tensor::unallocated(),
            momentum: Tensor::unallocated(),
            velocity: Tensor::unallocated(),
            mode: TrainingMode::Off,
            steps: StepCounter::new(),
            debug_checks: false,
        })
    }

    pub fn load_state<R: Read + ?Sized>(reader: &mut R) -> Result<Self, CorticalError> {
        let mut layer = Self::load_model(reader)?;
        layer.mode = TrainingMode::from_tag(read_u8(reader)?)?;
        layer.jacobian = Tensor::load(reader)?;
        layer.momentum = Tensor::load(reader)?;
        layer.velocity = Tensor::load(reader)?;
        layer.steps.set_count(read_u64(reader)?);
        Ok(layer)
    }
}

impl<T: Element> Layer for DenseLayer<T> {
    fn kind(&self) -> LayerKind {
        LayerKind::Dense
    }

    fn save_model(&self, writer: &mut dyn Write) -> Result<(), CorticalError> {
        DenseLayer::save_model(self, writer)
    }

    fn save_state(&self, writer: &mut dyn Write) -> Result<(), CorticalError> {
        DenseLayer::save_state(self, writer)
    }
}
