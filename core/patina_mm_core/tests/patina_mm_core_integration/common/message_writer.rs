//! Management Mode (MM) Message Writer
//!
//! Writes and reads communication buffers the way a normal-world caller does. The writer does not validate what it
//! writes, so tests can also produce inconsistent headers on purpose.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent

use patina_mm_core::comm_buffer::CommunicateHeader;
use r_efi::efi;
use zerocopy::IntoBytes;

/// Error types for MM message operations
#[derive(Debug, PartialEq)]
pub enum MmMessageError {
    /// Buffer is too small to contain a valid MM header
    BufferTooSmall,
    /// Message length extends beyond buffer bounds
    MessageTooLarge,
}

impl core::fmt::Display for MmMessageError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MmMessageError::BufferTooSmall => write!(f, "Buffer is too small for MM header"),
            MmMessageError::MessageTooLarge => write!(f, "Message length exceeds buffer size"),
        }
    }
}

/// A MM message writer over a caller-owned buffer
pub struct MmMessageWriter<'a> {
    buffer: &'a mut [u8],
}

impl<'a> MmMessageWriter<'a> {
    pub fn new(buffer: &'a mut [u8]) -> Self {
        Self { buffer }
    }

    /// Size of a buffer holding a header and `message_length` payload bytes
    pub const fn required_buffer_size(message_length: usize) -> usize {
        CommunicateHeader::SIZE + message_length
    }

    /// Writes a header declaring `declared_length`, without any payload
    pub fn write_header(&mut self, guid: &efi::Guid, declared_length: u64) -> Result<(), MmMessageError> {
        let header = CommunicateHeader::new(*guid, declared_length);
        self.buffer
            .get_mut(..CommunicateHeader::SIZE)
            .ok_or(MmMessageError::BufferTooSmall)?
            .copy_from_slice(header.as_bytes());
        Ok(())
    }

    /// Writes a header and payload, returning the total size
    pub fn write_message(&mut self, guid: &efi::Guid, payload: &[u8]) -> Result<usize, MmMessageError> {
        let total = Self::required_buffer_size(payload.len());
        if self.buffer.len() < CommunicateHeader::SIZE {
            return Err(MmMessageError::BufferTooSmall);
        }
        if self.buffer.len() < total {
            return Err(MmMessageError::MessageTooLarge);
        }

        self.write_header(guid, payload.len() as u64)?;
        self.buffer[CommunicateHeader::SIZE..total].copy_from_slice(payload);
        Ok(total)
    }

    /// Reads the header GUID and the payload it declares
    pub fn read_message(&self) -> Result<(efi::Guid, &[u8]), MmMessageError> {
        let header = CommunicateHeader::from_bytes(self.buffer).ok_or(MmMessageError::BufferTooSmall)?;
        let end = header.total_size().ok_or(MmMessageError::MessageTooLarge)?;
        let payload = self.buffer.get(CommunicateHeader::SIZE..end).ok_or(MmMessageError::MessageTooLarge)?;
        Ok((header.guid(), payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patina_mm_core_integration::common::constants::test_guids;

    #[test]
    fn test_write_then_read() {
        let mut buffer = [0u8; 64];
        let mut writer = MmMessageWriter::new(&mut buffer);
        assert_eq!(writer.write_message(&test_guids::DOUBLER_HANDLER, &[1, 2, 3]), Ok(27));

        let (guid, payload) = writer.read_message().unwrap();
        assert_eq!(guid, test_guids::DOUBLER_HANDLER);
        assert_eq!(payload, &[1, 2, 3]);
    }

    #[test]
    fn test_message_too_large() {
        let mut buffer = [0u8; 30];
        let mut writer = MmMessageWriter::new(&mut buffer);
        assert_eq!(writer.write_message(&test_guids::DOUBLER_HANDLER, &[0; 8]), Err(MmMessageError::MessageTooLarge));

        let mut tiny = [0u8; 8];
        assert_eq!(
            MmMessageWriter::new(&mut tiny).write_header(&test_guids::UNHANDLED, 0),
            Err(MmMessageError::BufferTooSmall)
        );
    }
}
