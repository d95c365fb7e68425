use std::io::{Read, Write};

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

/// Batch-wise normalization: per-channel statistics over every batch and
/// spatial position, followed by a learnable gamma/beta affine.
///
/// Statistics are computed by [`NormalizationLayer::compute_statistics`] and
/// then reused by forward and backward; the two parameter groups share the
/// layer's single step counter, which ticks once per descent call.
#[derive(Debug, Clone)]
pub struct NormalizationLayer<T: Element> {
    mean: Tensor<T, 1>,
    variance: Tensor<T, 1>,
    beta: Tensor<T, 1>,
    gamma: Tensor<T, 1>,
    beta_jacobian: Tensor<T, 1>,
    beta_momentum: Tensor<T, 1>,
    beta_velocity: Tensor<T, 1>,
    gamma_jacobian: Tensor<T, 1>,
    gamma_momentum: Tensor<T, 1>,
    gamma_velocity: Tensor<T, 1>,
    mode: TrainingMode,
    steps: StepCounter,
    debug_checks: bool,
}

impl<T: Element> NormalizationLayer<T> {
    pub fn new(channels: usize) -> Result<Self, CorticalError> {
        if channels == 0 {
            return Err(CorticalError::InvalidConfiguration(
                "normalization requires at least one channel".to_string(),
            ));
        }
        let shape = Shape::new([channels]);
        Ok(Self {
            mean: Tensor::new(shape),
            variance: Tensor::filled(shape, T::one()),
            beta: Tensor::new(shape),
            gamma: Tensor::filled(shape, T::one()),
            beta_jacobian: Tensor::unallocated(),
            beta_momentum: Tensor::unallocated(),
            beta_velocity: Tensor::unallocated(),
            gamma_jacobian: Tensor::unallocated(),
            gamma_momentum: Tensor::unallocated(),
            gamma_velocity: Tensor::unallocated(),
            mode: TrainingMode::Off,
            steps: StepCounter::new(),
            debug_checks: false,
        })
    }

    pub fn channels(&self) -> usize {
        self.mean.volume()
    }

    pub fn mean(&self) -> &Tensor<T, 1> {
        &self.mean
    }

    pub fn variance(&self) -> &Tensor<T, 1> {
        &self.variance
    }

    pub fn beta(&self) -> &Tensor<T, 1> {
        &self.beta
    }

    pub fn gamma(&self) -> &Tensor<T, 1> {
        &self.gamma
    }

    pub fn beta_jacobian(&self) -> &Tensor<T, 1> {
        &self.beta_jacobian
    }

    pub fn gamma_jacobian(&self) -> &Tensor<T, 1> {
        &self.gamma_jacobian
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
        let shape = *self.beta.shape();
        allocate_training_buffers(
            mode,
            shape,
            &mut self.beta_jacobian,
            &mut self.beta_momentum,
            &mut self.beta_velocity,
        );
        allocate_training_buffers(
            mode,
            shape,
            &mut self.gamma_jacobian,
            &mut self.gamma_momentum,
            &mut self.gamma_velocity,
        );
    }

    fn check_shapes(&self, layer_shape: &Shape<5>, operation: &str) -> Result<(), CorticalError> {
        if layer_shape.channels() != self.channels() {
            return Err(CorticalError::mismatched_shapes(
                self.mean.shape().dims(),
                layer_shape.dims(),
                operation,
            ));
        }
        Ok(())
    }

    /// Per-channel spatial volume of one batch/channel slab.
    fn slab_volume(layer_shape: &Shape<5>) -> usize {
        layer_shape.width() * layer_shape.height() * layer_shape.depth()
    }

    /// Recomputes per-channel mean and population variance from the layer.
    pub fn compute_statistics(&mut self, layer: &NodeLayer<T>) -> Result<(), CorticalError> {
        let shape = *layer.shape();
        self.check_shapes(&shape, "normalization statistics")?;

        let slab = Self::slab_volume(&shape);
        let channels = shape.channels();
        let count = T::from_count(slab * shape.batches());

        for channel in 0..channels {
            let mut sum = T::zero();
            for batch in 0..shape.batches() {
                let base = (batch * channels + channel) * slab;
                for position in 0..slab {
                    sum += layer.node(base + position);
                }
            }
            let mean = sum / count;

            let mut spread = T::zero();
            for batch in 0..shape.batches() {
                let base = (batch * channels + channel) * slab;
                for position in 0..slab {
                    let diff = layer.node(base + position) - mean;
                    spread += diff * diff;
                }
            }

            self.mean[channel] = mean;
            self.variance[channel] = spread / count;
        }
        Ok(())
    }

    /// Normalizes the layer in place through the stored statistics and the
    /// gamma/beta affine.
    pub fn forward(&self, layer: &mut NodeLayer<T>) -> Result<(), CorticalError> {
        let shape = *layer.shape();
        self.check_shapes(&shape, "normalization forward")?;

        let slab = Self::slab_volume(&shape);
        let channels = shape.channels();

        for channel in 0..channels {
            let mean = self.mean[channel];
            let inv_std = T::one() / (self.variance[channel] + T::epsilon()).sqrt();
            let beta = self.beta[channel];
            let gamma = self.gamma[channel];

            for batch in 0..shape.batches() {
                let base = (batch * channels + channel) * slab;
                for position in 0..slab {
                    let index = base + position;
                    let normalized = (layer.node(index) - mean) * inv_std;
                    *layer.node_mut(index) = normalized * gamma + beta;
                }
            }
        }
        Ok(())
    }

    /// Backward through the normalization: accumulates beta/gamma jacobians
    /// and rewrites the node deltas channel by channel.
    ///
    /// Precondition: the node values are the *pre-normalization* inputs the
    /// statistics were computed from.
    pub fn backward(&mut self, layer: &mut NodeLayer<T>) -> Result<(), CorticalError> {
        let shape = *layer.shape();
        self.check_shapes(&shape, "normalization backward")?;

        if self.mode == TrainingMode::Off {
            return Err(CorticalError::IncorrectTrainingMode {
                required: TrainingMode::Normal,
                actual: self.mode,
            });
        }
        if layer.training_mode() == TrainingMode::Off {
            return Err(CorticalError::IncorrectTrainingMode {
                required: TrainingMode::Normal,
                actual: layer.training_mode(),
            });
        }

        let slab = Self::slab_volume(&shape);
        let channels = shape.channels();
        let norm_size = T::from_count(slab * shape.batches());
        let two = T::from_config(2.0);
        let half = T::from_config(0.5);

        for channel in 0..channels {
            let mean = self.mean[channel];
            let variance = self.variance[channel] + T::epsilon();
            let inv_std = T::one() / variance.sqrt();
            let inv_std_cubed = variance.powf(T::from_config(-1.5));
            let gamma = self.gamma[channel];

            let mut beta_gradient = T::zero();
            let mut gamma_gradient = T::zero();

            for batch in 0..shape.batches() {
                let base = (batch * channels + channel) * slab;
                for position in 0..slab {
                    let index = base + position;
                    let delta = layer.delta(index);

                    let centered = layer.node(index) - mean;
                    let normalized = centered * inv_std;
                    let d_normalized = delta * gamma;
                    let d_variance = -half * d_normalized * normalized * inv_std_cubed;
                    let d_mean =
                        -d_normalized * inv_std - two * d_variance * centered / norm_size;

                    beta_gradient += delta;
                    gamma_gradient += delta * normalized;

                    let rewritten = d_normalized * inv_std
                        + d_variance * two * centered / norm_size
                        + d_mean / norm_size;
                    *layer.delta_mut(index) = rewritten;
                }
            }

            self.beta_jacobian[channel] += beta_gradient / norm_size;
            self.gamma_jacobian[channel] += gamma_gradient / norm_size;
        }
        Ok(())
    }

    /// Plain descent on beta and gamma; one shared counter tick.
    pub fn descend_plain(&mut self, batch_size: usize, step_size: T) -> Result<(), CorticalError> {
        if self.mode != TrainingMode::Normal {
            return Err(CorticalError::IncorrectTrainingMode {
                required: TrainingMode::Normal,
                actual: self.mode,
            });
        }
        descend_plain(&mut self.beta, &mut self.beta_jacobian, batch_size, step_size);
        descend_plain(
            &mut self.gamma,
            &mut self.gamma_jacobian,
            batch_size,
            step_size,
        );
        self.steps.tick();
        if self.debug_checks {
            check_finite(&self.beta, "normalization plain descent")?;
            check_finite(&self.gamma, "normalization plain descent")?;
        }
        Ok(())
    }

    /// Momentum descent on beta and gamma; one shared counter tick.
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
            &mut self.beta,
            &mut self.beta_jacobian,
            &mut self.beta_momentum,
            batch_size,
            step_size,
            momentum_step,
        );
        descend_momentum(
            &mut self.gamma,
            &mut self.gamma_jacobian,
            &mut self.gamma_momentum,
            batch_size,
            step_size,
            momentum_step,
        );
        self.steps.tick();
        if self.debug_checks {
            check_finite(&self.beta, "normalization momentum descent")?;
            check_finite(&self.gamma, "normalization momentum descent")?;
        }
        Ok(())
    }

    /// Adam descent on beta and gamma. Both groups bias-correct with the same
    /// step value; the counter ticks once.
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
        let step = self.steps.count();
        descend_adam(
            &mut self.beta,
            &mut self.beta_jacobian,
            &mut self.beta_momentum,
            &mut self.beta_velocity,
            batch_size,
            step_size,
            beta1,
            beta2,
            epsilon,
            step,
        );
        descend_adam(
            &mut self.gamma,
            &mut self.gamma_jacobian,
            &mut self.gamma_momentum,
            &mut self.gamma_velocity,
            batch_size,
            step_size,
            beta1,
            beta2,
            epsilon,
            step,
        );
        self.steps.tick();
        if self.debug_checks {
            check_finite(&self.beta, "normalization adam descent")?;
            check_finite(&self.gamma, "normalization adam descent")?;
        }
        Ok(())
    }

    pub fn save_model<W: Write + ?Sized>(&self, writer: &mut W) -> Result<(), CorticalError> {
        write_u8(writer, LayerKind::Normalization.tag())?;
        self.mean.save(writer)?;
        self.variance.save(writer)?;
        self.beta.save(writer)?;
        self.gamma.save(writer)?;
        Ok(())
    }

    pub fn save_state<W: Write + ?Sized>(&self, writer: &mut W) -> Result<(), CorticalError> {
        self.save_model(writer)?;
        write_u8(writer, self.mode.tag())?;
        self.beta_jacobian.save(writer)?;
        self.beta_momentum.save(writer)?;
        self.beta_velocity.save(writer)?;
        self.gamma_jacobian.save(writer)?;
        self.gamma_momentum.save(writer)?;
        self.gamma_velocity.save(writer)?;
        write_u64(writer, self.steps.count())?;
        Ok(())
    }

    pub fn load_model<R: Read + ?Sized>(reader: &mut R) -> Result<Self, CorticalError> {
        expect_tag(reader, LayerKind::Normalization.tag(), "layer")?;
        let mean = Tensor::<T, 1>::load(reader)?;
        let mut layer = Self::new(mean.volume())?;
        layer.mean = mean;
        layer.variance = Tensor::load(reader)?;
        layer.beta = Tensor::load(reader)?;
        layer.gamma = Tensor::load(reader)?;
        Ok(layer)
    }

    pub fn load_state<R: Read + ?Sized>(reader: &mut R) -> Result<Self, CorticalError> {
        let mut layer = Self::load_model(reader)?;
        layer.mode = TrainingMode::from_tag(read_u8(reader)?)?;
        layer.beta_jacobian = Tensor::load(reader)?;
        layer.beta_momentum = Tensor::load(reader)?;
        layer.beta_velocity = Tensor::load(reader)?;
        layer.gamma_jacobian = Tensor::load(reader)?;
        layer.gamma_momentum = Tensor::load(reader)?;
        layer.gamma_velocity = Tensor::load(reader)?;
        layer.steps.set_count(read_u64(reader)?);
        Ok(layer)
    }
}

impl<T: Element> Layer for NormalizationLayer<T> {
    fn kind(&self) -> LayerKind {
        LayerKind::Normalization
    }

    fn save_model(&self, writer: &mut dyn Write) -> Result<(), CorticalError> {
        NormalizationLayer::save_model(self, writer)
    }

    fn save_state(&self, writer: &mut dyn Write) -> Result<(), CorticalError> {
        NormalizationLayer::save_state(self, writer)
    }
}
