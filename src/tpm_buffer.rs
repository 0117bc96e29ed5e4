/*
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the MIT License. See the LICENSE file in the project root for full license information.
 */

//! Big-endian marshalling buffer

use crate::error::{DecodeError, TpmError};

/// Trait for values that have a TPM wire representation
pub trait TpmMarshaller {
    /// Append the wire form of this value to `buf`
    fn toTpm(&self, buf: &mut TpmBuffer) -> Result<(), TpmError>;

    /// Replace this value with the one read from `buf`
    fn initFromTpm(&mut self, buf: &mut TpmBuffer) -> Result<(), TpmError>;
}

/// Growable byte buffer with a read cursor.
///
/// Writes always append; reads consume from the current position.
#[derive(Debug, Clone, Default)]
pub struct TpmBuffer {
    buffer: Vec<u8>,
    position: usize,
}

impl TpmBuffer {
    pub fn new(capacity: Option<usize>) -> Self {
        TpmBuffer {
            buffer: Vec::with_capacity(capacity.unwrap_or(256)),
            position: 0,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        TpmBuffer {
            buffer: bytes.to_vec(),
            position: 0,
        }
    }

    /// Bytes written so far
    pub fn trim(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn cur_pos(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.position)
    }

    /// Fails with `TrailingData` unless every byte has been read
    pub fn check_consumed(&self) -> Result<(), TpmError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(DecodeError::TrailingData(n).into()),
        }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_be_bytes());
    }

    /// Write the low `len` bytes of `value`, most significant first
    pub fn write_num(&mut self, value: u64, len: usize) {
        let bytes = value.to_be_bytes();
        self.buffer.extend_from_slice(&bytes[8 - len.min(8)..]);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// TPM2B form: u16 byte count followed by the bytes
    pub fn write_sized_bytes(&mut self, bytes: &[u8]) -> Result<(), TpmError> {
        let size = u16::try_from(bytes.len()).map_err(|_| {
            TpmError::InvalidParameter(format!("sized buffer of {} bytes", bytes.len()))
        })?;
        self.write_u16(size);
        self.write_bytes(bytes);
        Ok(())
    }

    /// Write a structure preceded by its u16 marshalled size
    pub fn write_sized<F>(&mut self, write: F) -> Result<(), TpmError>
    where
        F: FnOnce(&mut TpmBuffer) -> Result<(), TpmError>,
    {
        let size_pos = self.buffer.len();
        self.write_u16(0);
        write(self)?;
        let size = self.buffer.len() - size_pos - 2;
        let size = u16::try_from(size)
            .map_err(|_| TpmError::InvalidParameter(format!("sized structure of {} bytes", size)))?;
        self.buffer[size_pos..size_pos + 2].copy_from_slice(&size.to_be_bytes());
        Ok(())
    }

    /// Overwrite a previously written u32 (used for size fields)
    pub fn patch_u32(&mut self, pos: usize, value: u32) {
        self.buffer[pos..pos + 4].copy_from_slice(&value.to_be_bytes());
    }

    fn ensure(&self, needed: usize) -> Result<(), TpmError> {
        if needed > self.remaining() {
            return Err(DecodeError::BufferUnderflow {
                needed,
                remaining: self.remaining(),
            }
            .into());
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8, TpmError> {
        self.ensure(1)?;
        let value = self.buffer[self.position];
        self.position += 1;
        Ok(value)
    }

    pub fn read_u16(&mut self) -> Result<u16, TpmError> {
        self.ensure(2)?;
        let value = u16::from_be_bytes([self.buffer[self.position], self.buffer[self.position + 1]]);
        self.position += 2;
        Ok(value)
    }

    pub fn read_u32(&mut self) -> Result<u32, TpmError> {
        self.ensure(4)?;
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.buffer[self.position..self.position + 4]);
        self.position += 4;
        Ok(u32::from_be_bytes(bytes))
    }

    pub fn read_u64(&mut self) -> Result<u64, TpmError> {
        self.ensure(8)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.buffer[self.position..self.position + 8]);
        self.position += 8;
        Ok(u64::from_be_bytes(bytes))
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, TpmError> {
        self.ensure(len)?;
        let value = self.buffer[self.position..self.position + len].to_vec();
        self.position += len;
        Ok(value)
    }

    pub fn read_sized_bytes(&mut self) -> Result<Vec<u8>, TpmError> {
        let size = self.read_u16()? as usize;
        self.read_bytes(size)
    }

    /// Read a structure preceded by its u16 size; the structure must consume exactly that size
    pub fn read_sized<T, F>(&mut self, read: F) -> Result<T, TpmError>
    where
        F: FnOnce(&mut TpmBuffer) -> Result<T, TpmError>,
    {
        let size = self.read_u16()? as usize;
        self.ensure(size)?;
        let start = self.position;
        let value = read(self)?;
        let consumed = self.position - start;
        if consumed != size {
            return Err(DecodeError::SizeMismatch {
                declared: size,
                actual: consumed,
            }
            .into());
        }
        Ok(value)
    }

    /// Read a u32 list count, rejecting counts that cannot fit in the remaining bytes
    pub fn read_count(&mut self, min_elem_size: usize, max: usize) -> Result<usize, TpmError> {
        let count = self.read_u32()? as usize;
        if count > max || count.saturating_mul(min_elem_size) > self.remaining() {
            return Err(DecodeError::InvalidArraySize(count).into());
        }
        Ok(count)
    }

    pub fn reset(&mut self) {
        self.position = 0;
    }
}

impl TpmMarshaller for u8 {
    fn toTpm(&self, buf: &mut TpmBuffer) -> Result<(), TpmError> {
        buf.write_u8(*self);
        Ok(())
    }

    fn initFromTpm(&mut self, buf: &mut TpmBuffer) -> Result<(), TpmError> {
        *self = buf.read_u8()?;
        Ok(())
    }
}

impl TpmMarshaller for u16 {
    fn toTpm(&self, buf: &mut TpmBuffer) -> Result<(), TpmError> {
        buf.write_u16(*self);
        Ok(())
    }

    fn initFromTpm(&mut self, buf: &mut TpmBuffer) -> Result<(), TpmError> {
        *self = buf.read_u16()?;
        Ok(())
    }
}

impl TpmMarshaller for u32 {
    fn toTpm(&self, buf: &mut TpmBuffer) -> Result<(), TpmError> {
        buf.write_u32(*self);
        Ok(())
    }

    fn initFromTpm(&mut self, buf: &mut TpmBuffer) -> Result<(), TpmError> {
        *self = buf.read_u32()?;
        Ok(())
    }
}

impl TpmMarshaller for u64 {
    fn toTpm(&self, buf: &mut TpmBuffer) -> Result<(), TpmError> {
        buf.write_u64(*self);
        Ok(())
    }

    fn initFromTpm(&mut self, buf: &mut TpmBuffer) -> Result<(), TpmError> {
        *self = buf.read_u64()?;
        Ok(())
    }
}
