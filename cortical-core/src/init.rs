//! Variance-scaled parameter initialization.

use rand::Rng;

use crate::element::Element;
use crate::error::CorticalError;
use crate::tensor::Tensor;

/// Variance-scaling rule applied to a parameter tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initialization {
    /// `variance = 2 / (fan_in + fan_out)`
    XavierGlorot,
    /// `variance = 2 / fan_in`
    He,
    /// `variance = 1 / fan_in`
    Lecun,
}

/// Sampling distribution for the fill. Only `Normal` is implemented; every
/// other variant is accepted by the type but fails fast when used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillDistribution {
    Normal,
    Poisson,
    Binomial,
    Exponential,
    Uniform,
    Bernoulli,
    Beta,
    Weibull,
    Gamma,
    ChiSquared,
    LogNormal,
    FisherF,
    DiscreteUniform,
}

/// Fills `parameters` from the chosen distribution with the standard
/// deviation implied by the initialization rule and the fan sizes.
pub fn initialize<T: Element, const N: usize, R: Rng + ?Sized>(
    parameters: &mut Tensor<T, N>,
    fan_in: usize,
    fan_out: usize,
    initialization: Initialization,
    distribution: FillDistribution,
    rng: &mut R,
) -> Result<(), CorticalError> {
    if fan_in == 0 {
        return Err(CorticalError::InvalidConfiguration(
            "initialization requires a non-empty input layer".to_string(),
        ));
    }

    let variance = match initialization {
        Initialization::XavierGlorot => 2.0 / (fan_in + fan_out) as f64,
        Initialization::He => 2.0 / fan_in as f64,
        Initialization::Lecun => 1.0 / fan_in as f64,
    };
    let std_dev = T::from_config(variance.sqrt());

    match distribution {
        FillDistribution::Normal => parameters.fill_normal(rng, T::zero(), std_dev),
        other => Err(CorticalError::InvalidConfiguration(format!(
            "{other:?} distribution is not implemented"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::Shape;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn xavier_fill_has_expected_spread() {
        let mut rng = StdRng::seed_from_u64(99);
        let mut parameters = Tensor::<f64, 2>::new(Shape::new([64, 64]));
        initialize(
            &mut parameters,
            256,
            256,
            Initialization::XavierGlorot,
            FillDistribution::Normal,
            &mut rng,
        )
        .unwrap();

        let n = parameters.volume() as f64;
        let mean = parameters.as_slice().iter().sum::<f64>() / n;
        let variance = parameters
            .as_slice()
            .iter()
            .map(|v| (v - mean) * (v - mean))
            .sum::<f64>()
            / n;

        // target variance 2/(256+256) ~= 0.0039; loose sample tolerance
        let target = 2.0 / 512.0;
        assert!((variance - target).abs() < target * 0.2);
        assert!(mean.abs() < 0.01);
    }

    #[test]
    fn unimplemented_distributions_fail_fast() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut parameters = Tensor::<f32, 1>::new(Shape::new([8]));
        for distribution in [
            FillDistribution::Poisson,
            FillDistribution::Uniform,
            FillDistribution::LogNormal,
        ] {
            let result = initialize(
                &mut parameters,
                4,
                4,
                Initialization::He,
                distribution,
                &mut rng,
            );
            assert!(matches!(
                result,
                Err(CorticalError::InvalidConfiguration(_))
            ));
        }
        // nothing was written by the failed attempts
        assert!(parameters.as_slice().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn zero_fan_in_is_rejected() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut parameters = Tensor::<f32, 1>::new(Shape::new([8]));
        assert!(initialize(
            &mut parameters,
            0,
            4,
            Initialization::Lecun,
            FillDistribution::Normal,
            &mut rng,
        )
        .is_err());
    }
}
