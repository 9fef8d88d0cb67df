// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Command framing and response parsing

use anyhow::{anyhow, bail, Result};

use super::constants::*;
use super::marshal::*;

/// TPM command builder
pub struct TpmCommand {
    code: TpmCc,
    buf: CommandBuffer,
}

impl TpmCommand {
    fn with_tag(command_code: TpmCc, tag: TpmSt) -> Self {
        let mut buf = CommandBuffer::with_capacity(256);

        // Header: tag (2) + size (4) + command code (4)
        buf.put_u16(tag.to_u16());
        buf.put_u32(0); // Size placeholder
        buf.put_u32(command_code.to_u32());

        Self {
            code: command_code,
            buf,
        }
    }

    /// Create a new command without sessions
    pub fn new(command_code: TpmCc) -> Self {
        Self::with_tag(command_code, TpmSt::NoSessions)
    }

    /// Create a new command with sessions
    pub fn with_sessions(command_code: TpmCc) -> Self {
        Self::with_tag(command_code, TpmSt::Sessions)
    }

    pub fn code(&self) -> TpmCc {
        self.code
    }

    /// Add a handle to the command
    pub fn add_handle(&mut self, handle: u32) {
        self.buf.put_u32(handle);
    }

    /// Add raw bytes to the command
    pub fn add_bytes(&mut self, data: &[u8]) {
        self.buf.put_bytes(data);
    }

    pub fn add_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn add_u16(&mut self, v: u16) {
        self.buf.put_u16(v);
    }

    pub fn add_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    /// Add a TPM2B structure
    #[track_caller]
    pub fn add_tpm2b(&mut self, data: &[u8]) {
        self.buf.put_tpm2b(data);
    }

    /// Add an empty TPM2B structure
    pub fn add_tpm2b_empty(&mut self) {
        self.buf.put_tpm2b_empty();
    }

    /// Add a marshallable structure
    pub fn add<T: Marshal + ?Sized>(&mut self, value: &T) {
        value.marshal(&mut self.buf);
    }

    /// Finalize the command and return the bytes
    pub fn finalize(mut self) -> Vec<u8> {
        let size = self.buf.len() as u32;
        self.buf.update_u32(2, size);
        self.buf.into_vec()
    }

    /// Get current buffer for inspection
    pub fn buffer(&self) -> &CommandBuffer {
        &self.buf
    }
}

/// TPM response parser
#[derive(Debug)]
pub struct TpmResponse {
    pub tag: TpmSt,
    pub response_code: u32,
    pub data: Vec<u8>,
}

impl TpmResponse {
    /// Parse a TPM response
    pub fn parse(response: &[u8]) -> Result<Self> {
        if response.len() < HEADER_SIZE {
            bail!("TPM response too short: {} bytes", response.len());
        }

        let mut buf = ResponseBuffer::new(response);

        let tag_raw = buf.get_u16()?;
        let tag = TpmSt::from_u16(tag_raw)
            .filter(|t| matches!(t, TpmSt::NoSessions | TpmSt::Sessions | TpmSt::RspCommand))
            .ok_or_else(|| anyhow!("invalid response tag: 0x{:04x}", tag_raw))?;

        let size = buf.get_u32()? as usize;
        if size < HEADER_SIZE || response.len() < size {
            bail!(
                "TPM response size mismatch: header says {}, got {}",
                size,
                response.len()
            );
        }

        let response_code = buf.get_u32()?;
        let data = response[HEADER_SIZE..size].to_vec();

        Ok(Self {
            tag,
            response_code,
            data,
        })
    }

    /// Check if the response indicates success
    pub fn is_success(&self) -> bool {
        self.response_code == 0
    }

    /// Get a response buffer for parsing the data
    pub fn data_buffer(&self) -> ResponseBuffer<'_> {
        ResponseBuffer::new(&self.data)
    }

    /// Response parameters, without the trailing authorization area when
    /// the response carries sessions.
    pub fn parameters(&self) -> Result<ResponseBuffer<'_>> {
        let mut buf = self.data_buffer();
        self.split_parameters(&mut buf)
    }

    /// Response handle followed by the parameters, for commands that
    /// create a handle (the handle precedes parameterSize).
    pub fn handle_and_parameters(&self) -> Result<(u32, ResponseBuffer<'_>)> {
        let mut buf = self.data_buffer();
        let handle = buf.get_u32()?;
        let params = self.split_parameters(&mut buf)?;
        Ok((handle, params))
    }

    fn split_parameters<'a>(&self, buf: &mut ResponseBuffer<'a>) -> Result<ResponseBuffer<'a>> {
        if self.tag == TpmSt::Sessions {
            let param_size = buf.get_u32()? as usize;
            buf.sub_buffer(param_size)
        } else {
            let remaining = buf.remaining();
            buf.sub_buffer(remaining)
        }
    }
}
