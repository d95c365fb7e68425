//! Little-endian primitives for the binary model/state format.
//!
//! Every enum that reaches disk goes through an explicit tag table on its own
//! type (`tag`/`from_tag`); nothing is written from in-memory representation.

use std::io::{Read, Write};

use crate::error::CorticalError;

pub fn write_u8<W: Write + ?Sized>(writer: &mut W, value: u8) -> Result<(), CorticalError> {
    writer.write_all(&[value])?;
    Ok(())
}

pub fn read_u8<R: Read + ?Sized>(reader: &mut R) -> Result<u8, CorticalError> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

pub fn write_u64<W: Write + ?Sized>(writer: &mut W, value: u64) -> Result<(), CorticalError> {
    writer.write_all(&value.to_le_bytes())?;
    Ok(())
}

pub fn read_u64<R: Read + ?Sized>(reader: &mut R) -> Result<u64, CorticalError> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

pub fn write_f64<W: Write + ?Sized>(writer: &mut W, value: f64) -> Result<(), CorticalError> {
    writer.write_all(&value.to_le_bytes())?;
    Ok(())
}

pub fn read_f64<R: Read + ?Sized>(reader: &mut R) -> Result<f64, CorticalError> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(f64::from_le_bytes(buf))
}

/// Reads a tag byte and checks it against the expected layer tag.
pub fn expect_tag<R: Read + ?Sized>(
    reader: &mut R,
    expected: u8,
    what: &str,
) -> Result<(), CorticalError> {
    let tag = read_u8(reader)?;
    if tag != expected {
        return Err(CorticalError::InvalidConfiguration(format!(
            "unexpected {what} tag {tag}, expected {expected}"
        )));
    }
    Ok(())
}
