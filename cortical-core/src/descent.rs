//! Training-buffer lifecycle and the shared gradient-descent update rules.
//!
//! Every trainable layer owns a parameter tensor plus jacobian / momentum /
//! velocity buffers of the same shape. Which buffers exist is decided once by
//! the layer's [`TrainingMode`]; the update rules below are shared verbatim by
//! convolution filters, dense weights, bias nodes and normalization
//! beta/gamma. Two postconditions hold after *every* descent call regardless
//! of rule: the jacobian is zeroed and the layer's step counter has ticked.

use log::debug;

use crate::element::Element;
use crate::error::CorticalError;
use crate::shape::Shape;
use crate::tensor::Tensor;

/// Which training buffers a layer allocates and which update rule it accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingMode {
    Off,
    Normal,
    Momentum,
    Adam,
}

impl TrainingMode {
    pub fn tag(self) -> u8 {
        match self {
            TrainingMode::Off => 0,
            TrainingMode::Normal => 1,
            TrainingMode::Momentum => 2,
            TrainingMode::Adam => 3,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, CorticalError> {
        match tag {
            0 => Ok(TrainingMode::Off),
            1 => Ok(TrainingMode::Normal),
            2 => Ok(TrainingMode::Momentum),
            3 => Ok(TrainingMode::Adam),
            other => Err(CorticalError::InvalidConfiguration(format!(
                "unknown training mode tag {other}"
            ))),
        }
    }
}

/// Monotonic per-layer step counter.
///
/// Starts at 1 so the first Adam update bias-corrects with `t = 1`; ticks
/// exactly once per gradient-descent call and is never reset except at
/// construction or by a state-file load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepCounter {
    count: u64,
}

impl StepCounter {
    pub fn new() -> Self {
        Self { count: 1 }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn tick(&mut self) {
        self.count += 1;
    }

    pub fn set_count(&mut self, count: u64) {
        self.count = count;
    }
}

impl Default for StepCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Resizes the training buffers to match `mode`: `Off` drops all three,
/// `Normal` keeps the jacobian, `Momentum` adds momentum, `Adam` adds
/// velocity.
pub fn allocate_training_buffers<T: Element, const N: usize>(
    mode: TrainingMode,
    parameter_shape: Shape<N>,
    jacobian: &mut Tensor<T, N>,
    momentum: &mut Tensor<T, N>,
    velocity: &mut Tensor<T, N>,
) {
    match mode {
        TrainingMode::Off => {
            jacobian.resize(Shape::empty());
            momentum.resize(Shape::empty());
            velocity.resize(Shape::empty());
        }
        TrainingMode::Normal => {
            jacobian.resize(parameter_shape);
            momentum.resize(Shape::empty());
            velocity.resize(Shape::empty());
        }
        TrainingMode::Momentum => {
            jacobian.resize(parameter_shape);
            momentum.resize(parameter_shape);
            velocity.resize(Shape::empty());
        }
        TrainingMode::Adam => {
            jacobian.resize(parameter_shape);
            momentum.resize(parameter_shape);
            velocity.resize(parameter_shape);
        }
    }
}

/// Plain gradient step: `param += step_size * jacobian / batch_size`.
pub fn descend_plain<T: Element, const N: usize>(
    parameters: &mut Tensor<T, N>,
    jacobian: &mut Tensor<T, N>,
    batch_size: usize,
    step_size: T,
) {
    let scale = T::one() / T::from_count(batch_size);
    for index in 0..parameters.volume() {
        let gradient = jacobian[index] * scale;
        parameters[index] += step_size * gradient;
    }
    jacobian.zero();
    debug!("plain descent over {} parameters", parameters.volume());
}

/// Momentum step. The momentum slot stores the *raw current gradient* after
/// the update, not an exponentially-decayed accumulator:
/// `param += step_size * (momentum_step * m_old + g)`, then `m = g`.
pub fn descend_momentum<T: Element, const N: usize>(
    parameters: &mut Tensor<T, N>,
    jacobian: &mut Tensor<T, N>,
    momentum: &mut Tensor<T, N>,
    batch_size: usize,
    step_size: T,
    momentum_step: T,
) {
    let scale = T::one() / T::from_count(batch_size);
    for index in 0..parameters.volume() {
        let gradient = jacobian[index] * scale;
        parameters[index] += step_size * (momentum_step * momentum[index] + gradient);
        momentum[index] = gradient;
    }
    jacobian.zero();
    debug!("momentum descent over {} parameters", parameters.volume());
}

/// Adam step with bias correction taken at `step` (the layer counter value at
/// call time):
/// `m = b1*m + (1-b1)*g`, `v = b2*v + (1-b2)*g^2`,
/// `param += step_size * (m / (1 - b1^t)) / (sqrt(v / (1 - b2^t)) + epsilon)`.
#[allow(clippy::too_many_arguments)]
pub fn descend_adam<T: Element, const N: usize>(
    parameters: &mut Tensor<T, N>,
    jacobian: &mut Tensor<T, N>,
    momentum: &mut Tensor<T, N>,
    velocity: &mut Tensor<T, N>,
    batch_size: usize,
    step_size: T,
    beta1: T,
    beta2: T,
    epsilon: T,
    step: u64,
) {
    let scale = T::one() / T::from_count(batch_size);
    let beta1_correction = T::one() - beta1.powi(step as i32);
    let beta2_correction = T::one() - beta2.powi(step as i32);
    let beta1_rem = T::one() - beta1;
    let beta2_rem = T::one() - beta2;

    for index in 0..parameters.volume() {
        let gradient = jacobian[index] * scale;

        momentum[index] = beta1 * momentum[index] + beta1_rem * gradient;
        velocity[index] = beta2 * velocity[index] + beta2_rem * gradient * gradient;

        let momentum_hat = momentum[index] / beta1_correction;
        let velocity_hat = velocity[index] / beta2_correction;

        parameters[index] += step_size * (momentum_hat / (velocity_hat.sqrt() + epsilon));
    }
    jacobian.zero();
    debug!(
        "adam descent over {} parameters at step {}",
        parameters.volume(),
        step
    );
}

/// Rejects Adam hyperparameters outside their defined ranges.
pub fn validate_adam_hyper<T: Element>(
    beta1: T,
    beta2: T,
    epsilon: T,
) -> Result<(), CorticalError> {
    if beta1 < T::zero() || beta1 >= T::one() {
        return Err(CorticalError::InvalidConfiguration(
            "beta1 must be in [0, 1)".to_string(),
        ));
    }
    if beta2 < T::zero() || beta2 >= T::one() {
        return Err(CorticalError::InvalidConfiguration(
            "beta2 must be in [0, 1)".to_string(),
        ));
    }
    if epsilon <= T::zero() {
        return Err(CorticalError::InvalidConfiguration(
            "epsilon must be positive".to_string(),
        ));
    }
    Ok(())
}

/// NaN/inf sweep used by layers with debug checks enabled.
pub fn check_finite<T: Element, const N: usize>(
    parameters: &Tensor<T, N>,
    operation: &str,
) -> Result<(), CorticalError> {
    if let Some(index) = parameters.first_non_finite() {
        return Err(CorticalError::NumericInstability {
            operation: operation.to_string(),
            index,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn tensor1(values: &[f64]) -> Tensor<f64, 1> {
        Tensor::from_vec(Shape::new([values.len()]), values.to_vec()).unwrap()
    }

    #[test]
    fn allocation_follows_mode() {
        let shape = Shape::new([2, 2]);
        let mut jacobian = Tensor::<f32, 2>::unallocated();
        let mut momentum = Tensor::<f32, 2>::unallocated();
        let mut velocity = Tensor::<f32, 2>::unallocated();

        allocate_training_buffers(TrainingMode::Adam, shape, &mut jacobian, &mut momentum, &mut velocity);
        assert_eq!(jacobian.volume(), 4);
        assert_eq!(momentum.volume(), 4);
        assert_eq!(velocity.volume(), 4);

        allocate_training_buffers(TrainingMode::Normal, shape, &mut jacobian, &mut momentum, &mut velocity);
        assert_eq!(jacobian.volume(), 4);
        assert!(momentum.is_empty());
        assert!(velocity.is_empty());

        allocate_training_buffers(TrainingMode::Off, shape, &mut jacobian, &mut momentum, &mut velocity);
        assert!(jacobian.is_empty());
    }

    #[test]
    fn plain_step_divides_by_batch_and_zeroes_jacobian() {
        let mut parameters = tensor1(&[1.0, -1.0]);
        let mut jacobian = tensor1(&[4.0, 8.0]);

        descend_plain(&mut parameters, &mut jacobian, 4, 0.5);

        assert_relative_eq!(parameters[0], 1.0 + 0.5 * 1.0);
        assert_relative_eq!(parameters[1], -1.0 + 0.5 * 2.0);
        assert!(jacobian.as_slice().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn momentum_slot_keeps_raw_gradient() {
        let mut parameters = tensor1(&[0.0]);
        let mut jacobian = tensor1(&[2.0]);
        let mut momentum = tensor1(&[10.0]);

        descend_momentum(&mut parameters, &mut jacobian, &mut momentum, 2, 0.1, 0.9);

        // param += 0.1 * (0.9 * 10 + 1)
        assert_relative_eq!(parameters[0], 0.1 * (9.0 + 1.0));
        // slot now holds the raw gradient, not a decayed blend
        assert_relative_eq!(momentum[0], 1.0);
        assert_eq!(jacobian[0], 0.0);
    }

    #[test]
    fn adam_two_steps_match_direct_formula_evaluation() {
        let (beta1, beta2, epsilon, eta) = (0.9f64, 0.99, 1e-8, 0.001);
        let mut parameters = tensor1(&[0.0]);
        let mut jacobian = tensor1(&[1.0]);
        let mut momentum = tensor1(&[0.0]);
        let mut velocity = tensor1(&[0.0]);

        // reference evaluation of the published formulas, g = J/n = 1
        let mut m = 0.0f64;
        let mut v = 0.0f64;
        let mut reference = 0.0f64;
        for t in 1..=2u64 {
            let g = 1.0;
            m = beta1 * m + (1.0 - beta1) * g;
            v = beta2 * v + (1.0 - beta2) * g * g;
            let m_hat = m / (1.0 - beta1.powi(t as i32));
            let v_hat = v / (1.0 - beta2.powi(t as i32));
            reference += eta * (m_hat / (v_hat.sqrt() + epsilon));
        }

        descend_adam(
            &mut parameters, &mut jacobian, &mut momentum, &mut velocity,
            1, eta, beta1, beta2, epsilon, 1,
        );
        jacobian[0] = 1.0;
        descend_adam(
            &mut parameters, &mut jacobian, &mut momentum, &mut velocity,
            1, eta, beta1, beta2, epsilon, 2,
        );

        assert_relative_eq!(parameters[0], reference, max_relative = 1e-12);
    }

    #[test]
    fn finite_check_reports_first_bad_index() {
        let mut parameters = tensor1(&[1.0, 2.0]);
        assert!(check_finite(&parameters, "test").is_ok());
        parameters[1] = f64::INFINITY;
        let err = check_finite(&parameters, "test").unwrap_err();
        assert!(matches!(
            err,
            CorticalError::NumericInstability { index: 1, .. }
        ));
    }
}
