use std::fmt::Debug;

use num_traits::{Float, NumAssign};
use rand::distributions::uniform::SampleUniform;
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::error::CorticalError;

/// Scalar type every kernel in this crate is generic over.
///
/// The trait closes over the float types the layer kernels are defined for and
/// adds the two capabilities `num_traits` does not cover: little-endian byte
/// (de)serialization for the persistence format, and normal-distribution
/// sampling for parameter initialization.
pub trait Element:
    Float + NumAssign + SampleUniform + Default + Debug + Send + Sync + 'static
{
    /// Serialized width of one element in bytes.
    const BYTES: usize;

    /// Writes `self` into `buf[..Self::BYTES]` in little-endian order.
    fn write_le(self, buf: &mut [u8]);

    /// Reads an element from `buf[..Self::BYTES]` in little-endian order.
    fn read_le(buf: &[u8]) -> Self;

    /// Lossy conversion from a count (batch sizes, window volumes).
    fn from_count(count: usize) -> Self;

    /// Lossy conversion from f64 (hyperparameters, epsilon constants).
    fn from_config(value: f64) -> Self;

    /// Fills `values` with samples from N(mean, std_dev^2).
    fn fill_normal<R: Rng + ?Sized>(
        values: &mut [Self],
        rng: &mut R,
        mean: Self,
        std_dev: Self,
    ) -> Result<(), CorticalError>;
}

impl Element for f32 {
    const BYTES: usize = 4;

    fn write_le(self, buf: &mut [u8]) {
        buf[..4].copy_from_slice(&self.to_le_bytes());
    }

    fn read_le(buf: &[u8]) -> Self {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&buf[..4]);
        f32::from_le_bytes(bytes)
    }

    fn from_count(count: usize) -> Self {
        count as f32
    }

    fn from_config(value: f64) -> Self {
        value as f32
    }

    fn fill_normal<R: Rng + ?Sized>(
        values: &mut [Self],
        rng: &mut R,
        mean: Self,
        std_dev: Self,
    ) -> Result<(), CorticalError> {
        let normal = Normal::new(mean, std_dev).map_err(|e| {
            CorticalError::InvalidConfiguration(format!("normal distribution: {e}"))
        })?;
        for value in values.iter_mut() {
            *value = normal.sample(rng);
        }
        Ok(())
    }
}

impl Element for f64 {
    const BYTES: usize = 8;

    fn write_le(self, buf: &mut [u8]) {
        buf[..8].copy_from_slice(&self.to_le_bytes());
    }

    fn read_le(buf: &[u8]) -> Self {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&buf[..8]);
        f64::from_le_bytes(bytes)
    }

    fn from_count(count: usize) -> Self {
        count as f64
    }

    fn from_config(value: f64) -> Self {
        value
    }

    fn fill_normal<R: Rng + ?Sized>(
        values: &mut [Self],
        rng: &mut R,
        mean: Self,
        std_dev: Self,
    ) -> Result<(), CorticalError> {
        let normal = Normal::new(mean, std_dev).map_err(|e| {
            CorticalError::InvalidConfiguration(format!("normal distribution: {e}"))
        })?;
        for value in values.iter_mut() {
            *value = normal.sample(rng);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_f32_bytes() {
        let mut buf = [0u8; 4];
        1.5f32.write_le(&mut buf);
        assert_eq!(f32::read_le(&buf), 1.5);
    }

    #[test]
    fn round_trips_f64_bytes() {
        let mut buf = [0u8; 8];
        (-0.25f64).write_le(&mut buf);
        assert_eq!(f64::read_le(&buf), -0.25);
    }

    #[test]
    fn rejects_negative_std_dev() {
        use rand::SeedableRng;
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let mut values = [0.0f32; 4];
        let result = f32::fill_normal(&mut values, &mut rng, 0.0, -1.0);
        assert!(matches!(
            result,
            Err(CorticalError::InvalidConfiguration(_))
        ));
    }
}
