use std::io::{Read, Write};
use std::ops::{Index, IndexMut};

use rand::Rng;

use crate::element::Element;
use crate::error::CorticalError;
use crate::shape::Shape;

/// Dense N-dimensional buffer backing every parameter and activation in the
/// crate.
///
/// Invariant: `data.len() == shape.volume()`. Each layer owns its tensors;
/// nothing is aliased across layers.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor<T: Element, const N: usize> {
    shape: Shape<N>,
    data: Vec<T>,
}

impl<T: Element, const N: usize> Tensor<T, N> {
    /// Zero-filled tensor of the given shape.
    pub fn new(shape: Shape<N>) -> Self {
        Self {
            shape,
            data: vec![T::zero(); shape.volume()],
        }
    }

    /// Tensor filled with a scalar.
    pub fn filled(shape: Shape<N>, value: T) -> Self {
        Self {
            shape,
            data: vec![value; shape.volume()],
        }
    }

    /// Tensor over explicit data; the length must match the shape volume.
    pub fn from_vec(shape: Shape<N>, data: Vec<T>) -> Result<Self, CorticalError> {
        if data.len() != shape.volume() {
            return Err(CorticalError::InvalidConfiguration(format!(
                "data length {} does not match shape {:?} (volume {})",
                data.len(),
                shape.dims(),
                shape.volume()
            )));
        }
        Ok(Self { shape, data })
    }

    /// Unallocated tensor; the state of a training buffer the current mode
    /// does not use.
    pub fn unallocated() -> Self {
        Self {
            shape: Shape::empty(),
            data: Vec::new(),
        }
    }

    pub fn shape(&self) -> &Shape<N> {
        &self.shape
    }

    pub fn volume(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Reallocates to `shape`, zero-filled. Previous contents are dropped.
    pub fn resize(&mut self, shape: Shape<N>) {
        self.shape = shape;
        self.data.clear();
        self.data.resize(shape.volume(), T::zero());
    }

    pub fn fill(&mut self, value: T) {
        self.data.fill(value);
    }

    pub fn zero(&mut self) {
        self.data.fill(T::zero());
    }

    /// Uniform fill over `[min, max]`.
    pub fn randomize<R: Rng + ?Sized>(&mut self, rng: &mut R, min: T, max: T) {
        for value in self.data.iter_mut() {
            *value = rng.gen_range(min..=max);
        }
    }

    /// Normal-distribution fill, N(mean, std_dev^2).
    pub fn fill_normal<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        mean: T,
        std_dev: T,
    ) -> Result<(), CorticalError> {
        T::fill_normal(&mut self.data, rng, mean, std_dev)
    }

    /// Index of the first non-finite element, if any.
    pub fn first_non_finite(&self) -> Option<usize> {
        self.data.iter().position(|value| !value.is_finite())
    }

    /// Writes shape dims (u64 LE) followed by raw little-endian elements.
    pub fn save<W: Write + ?Sized>(&self, writer: &mut W) -> Result<(), CorticalError> {
        self.shape.save(writer)?;
        let mut buf = [0u8; 8];
        for value in &self.data {
            value.write_le(&mut buf);
            writer.write_all(&buf[..T::BYTES])?;
        }
        Ok(())
    }

    /// Reads a tensor written by [`Tensor::save`].
    pub fn load<R: Read + ?Sized>(reader: &mut R) -> Result<Self, CorticalError> {
        let shape = Shape::<N>::load(reader)?;
        let volume = shape.volume();
        let mut data = Vec::with_capacity(volume);
        let mut buf = [0u8; 8];
        for _ in 0..volume {
            reader.read_exact(&mut buf[..T::BYTES])?;
            data.push(T::read_le(&buf));
        }
        Ok(Self { shape, data })
    }
}

impl<T: Element, const N: usize> Index<usize> for Tensor<T, N> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        &self.data[index]
    }
}

impl<T: Element, const N: usize> IndexMut<usize> for Tensor<T, N> {
    fn index_mut(&mut self, index: usize) -> &mut T {
        &mut self.data[index]
    }
}
