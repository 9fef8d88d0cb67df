// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Kernel TPM character device engine

use anyhow::{bail, Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use tracing::debug;

use super::constants::{HEADER_SIZE, TPM_MAX_COMMAND_SIZE};
use super::tcti::Engine;

/// Resource-managed node first, then the raw device
const DEVICE_CANDIDATES: [&str; 2] = ["/dev/tpmrm0", "/dev/tpm0"];

/// An [`Engine`] backed by `/dev/tpm*`
pub struct TpmDevice {
    file: File,
    path: String,
}

impl std::fmt::Debug for TpmDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TpmDevice").field("path", &self.path).finish()
    }
}

impl TpmDevice {
    /// Open a TPM device. A `device:` prefix is accepted and ignored.
    pub fn open(path: &str) -> Result<Self> {
        let device_path = path.strip_prefix("device:").unwrap_or(path);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(device_path)
            .with_context(|| format!("failed to open TPM device: {device_path}"))?;

        debug!("opened TPM device {device_path}");
        Ok(Self {
            file,
            path: device_path.to_string(),
        })
    }

    /// Open the first TPM device node present on this machine
    pub fn detect() -> Result<Self> {
        match DEVICE_CANDIDATES.iter().find(|p| Path::new(p).exists()) {
            Some(path) => Self::open(path),
            None => bail!("TPM device not found"),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Engine for TpmDevice {
    fn execute_command(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        self.file
            .write_all(command)
            .with_context(|| format!("failed to write TPM command to {}", self.path))?;

        // the driver hands back a whole response per read
        let mut response = vec![0u8; TPM_MAX_COMMAND_SIZE];
        let n = self
            .file
            .read(&mut response)
            .with_context(|| format!("failed to read TPM response from {}", self.path))?;
        response.truncate(n);

        if n < HEADER_SIZE {
            bail!("short TPM response: {n} bytes");
        }
        let size = u32::from_be_bytes([response[2], response[3], response[4], response[5]]) as usize;
        if size != n {
            bail!("TPM response size mismatch: header says {size}, read {n}");
        }
        Ok(response)
    }
}
