use std::io::{Read, Write};

use rand::Rng;

use crate::descent::{
    allocate_training_buffers, check_finite, descend_adam, descend_momentum, descend_plain,
    validate_adam_hyper, StepCounter, TrainingMode,
};
use crate::element::Element;
use crate::error::CorticalError;
use crate::layer::node::NodeLayer;
use crate::layer::{Layer, LayerKind};
use crate::persist::{expect_tag, read_u64, read_u8, write_u64, write_u8};
use crate::shape::Shape;
use crate::tensor::Tensor;

/// Additive per-position bias, broadcast across batches. Applied in place on
/// a node layer.
#[derive(Debug, Clone)]
pub struct BiasLayer<T: Element> {
    bias: Tensor<T, 4>,
    jacobian: Tensor<T, 4>,
    momentum: Tensor<T, 4>,
    velocity: Tensor<T, 4>,
    mode: TrainingMode,
    steps: StepCounter,
    debug_checks: bool,
}

impl<T: Element> BiasLayer<T> {
    pub fn new(shape: Shape<4>) -> Result<Self, CorticalError> {
        if shape.volume() == 0 {
            return Err(CorticalError::InvalidConfiguration(
                "bias shape must have non-zero volume".to_string(),
            ));
        }
        Ok(Self {
            bias: Tensor::new(shape),
            jacobian: Tensor::unallocated(),
            momentum: Tensor::unallocated(),
            velocity: Tensor::unallocated(),
            mode: TrainingMode::Off,
            steps: StepCounter::new(),
            debug_checks: false,
        })
    }

    pub fn bias(&self) -> &Tensor<T, 4> {
        &self.bias
    }

    pub fn bias_mut(&mut self) -> &mut Tensor<T, 4> {
        &mut self.bias
    }

    pub fn jacobian(&self) -> &Tensor<T, 4> {
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
            *self.bias.shape(),
            &mut self.jacobian,
            &mut self.momentum,
            &mut self.velocity,
        );
    }

    pub fn fill_bias(&mut self, value: T) {
        self.bias.fill(value);
    }

    pub fn randomize_bias<R: Rng + ?Sized>(&mut self, rng: &mut R, min: T, max: T) {
        self.bias.randomize(rng, min, max);
    }

    fn check_shapes(&self, layer_shape: &Shape<5>, operation: &str) -> Result<(), CorticalError> {
        if layer_shape.spatial_volume() != self.bias.volume() {
            return Err(CorticalError::mismatched_shapes(
                self.bias.shape().dims(),
                layer_shape.dims(),
                operation,
            ));
        }
        Ok(())
    }

    /// Adds the bias to every batch of the layer in place.
    pub fn forward(&self, layer: &mut NodeLayer<T>) -> Result<(), CorticalError> {
        let shape = *layer.shape();
        self.check_shapes(&shape, "bias forward")?;

        let spatial = shape.spatial_volume();
        for batch in 0..shape.batches() {
            let base = batch * spatial;
            for position in 0..spatial {
                *layer.node_mut(base + position) += self.bias[position];
            }
        }
        Ok(())
    }

    /// Accumulates the per-position delta sum into the jacobian. The layer's
    /// delta is left untouched (the bias is an additive pass-through).
    pub fn backward(&mut self, layer: &NodeLayer<T>) -> Result<(), CorticalError> {
        let shape = *layer.shape();
        self.check_shapes(&shape, "bias backward")?;

        if self.mode == TrainingMode::Off {
            return Err(CorticalError::IncorrectTrainingMode {
                required: TrainingMode::Normal,
                actual: self.mode,
            });
        }

        let spatial = shape.spatial_volume();
        for batch in 0..shape.batches() {
            let base = batch * spatial;
            for position in 0..spatial {
                self.jacobian[position] += layer.delta(base + position);
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
        descend_plain(&mut self.bias, &mut self.jacobian, batch_size, step_size);
        self.steps.tick();
        if self.debug_checks {
            check_finite(&self.bias, "bias plain descent")?;
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
            &mut self.bias,
            &mut self.jacobian,
            &mut self.momentum,
            batch_size,
            step_size,
            momentum_step,
        );
        self.steps.tick();
        if self.debug_checks {
            check_finite(&self.bias, "bias momentum descent")?;
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
            &mut self.bias,
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
            check_finite(&self.bias, "bias adam descent")?;
        }
        Ok(())
    }

    pub fn save_model<W: Write + ?Sized>(&self, writer: &mut W) -> Result<(), CorticalError> {
        write_u8(writer, LayerKind::Bias.tag())?;
        self.bias.save(writer)?;
        Ok(())
    }

    pub fn save_state<W: Write + ?Sized>(&self, writer: &mut W) -> Result<(), CorticalError> {
        write_u8(writer, LayerKind::Bias.tag())?;
        self.bias.save(writer)?;
        write_u8(writer, self.mode.tag())?;
        self.jacobian.save(writer)?;
        self.momentum.save(writer)?;
        self.velocity.save(writer)?;
        write_u64(writer, self.steps.count())?;
        Ok(())
    }

    pub fn load_model<R: Read + ?Sized>(reader: &mut R) -> Result<Self, CorticalError> {
        expect_tag(reader, LayerKind::Bias.tag(), "layer")?;
        let bias = Tensor::<T, 4>::load(reader)?;
        Ok(Self {
            bias,
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

impl<T: Element> Layer for BiasLayer<T> {
    fn kind(&self) -> LayerKind {
        LayerKind::Bias
    }

    fn save_model(&self, writer: &mut dyn Write) -> Result<(), CorticalError> {
        BiasLayer::save_model(self, writer)
    }

    fn save_state(&self, writer: &mut dyn Write) -> Result<(), CorticalError> {
        BiasLayer::save_state(self, writer)
    }
}
