// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Transport between command bytes and whatever executes them
//!
//! [`Engine`] is the single seam to the TPM itself: a simulator, the kernel
//! device or a remote service. [`TctiAdapter`] puts the split
//! transmit/receive interface of a TCTI in front of it: `transmit` only
//! records the command, `receive` dispatches it and hands back the response.

use std::fmt::Write as _;

use anyhow::Result;
use tracing::{debug, error, trace};

use super::constants::command_name;
use super::error::{ResponseCode, TpmResult};

/// Executes one complete TPM command and returns the complete response.
pub trait Engine {
    fn execute_command(&mut self, command: &[u8]) -> Result<Vec<u8>>;
}

impl<E: Engine + ?Sized> Engine for Box<E> {
    fn execute_command(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        (**self).execute_command(command)
    }
}

impl<E: Engine + ?Sized> Engine for &mut E {
    fn execute_command(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        (**self).execute_command(command)
    }
}

/// Adapts an infallible closure into an [`Engine`].
pub struct CommandFn<F>(pub F);

impl<F> Engine for CommandFn<F>
where
    F: FnMut(&[u8]) -> Vec<u8>,
{
    fn execute_command(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        Ok((self.0)(command))
    }
}

/// Split send/receive transport used by the orchestrator.
pub trait Tcti {
    fn transmit(&mut self, command: &[u8]) -> TpmResult<()>;

    /// Write the response into `response` and return its length.
    fn receive(&mut self, response: &mut [u8]) -> TpmResult<usize>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TctiState {
    Idle,
    CommandPending,
}

/// [`Tcti`] over an [`Engine`] that holds at most one command in flight.
pub struct TctiAdapter<E> {
    engine: E,
    pending: Option<Vec<u8>>,
}

impl<E: Engine> TctiAdapter<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            pending: None,
        }
    }

    pub fn state(&self) -> TctiState {
        match self.pending {
            Some(_) => TctiState::CommandPending,
            None => TctiState::Idle,
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn into_engine(self) -> E {
        self.engine
    }
}

impl<E: Engine> Tcti for TctiAdapter<E> {
    fn transmit(&mut self, command: &[u8]) -> TpmResult<()> {
        if self.pending.is_some() {
            error!("transmit called with a command already pending");
            return Err(ResponseCode::TCTI_BAD_SEQUENCE);
        }
        self.pending = Some(command.to_vec());
        Ok(())
    }

    fn receive(&mut self, response: &mut [u8]) -> TpmResult<usize> {
        let Some(command) = self.pending.take() else {
            error!("receive called with no command pending");
            return Err(ResponseCode::TCTI_BAD_SEQUENCE);
        };

        debug!("about to execute {}", command_name(command_code(&command)));
        trace!("command buffer:\n{}", hex_dump(&command));

        let reply = match self.engine.execute_command(&command) {
            Ok(reply) => reply,
            Err(err) => {
                error!("engine failed to execute command: {err:#}");
                return Err(ResponseCode::TCTI_IO_ERROR);
            }
        };

        trace!("response buffer:\n{}", hex_dump(&reply));
        assert!(
            reply.len() <= response.len(),
            "response of {} bytes does not fit the {}-byte receive buffer",
            reply.len(),
            response.len()
        );
        response[..reply.len()].copy_from_slice(&reply);
        Ok(reply.len())
    }
}

fn command_code(command: &[u8]) -> u32 {
    command
        .get(6..10)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .unwrap_or(0)
}

/// Render `data` as 16-byte rows of offset, hex and printable ASCII.
pub fn hex_dump(data: &[u8]) -> String {
    let mut out = String::new();
    for (row, chunk) in data.chunks(16).enumerate() {
        let _ = write!(out, "{:04x}: ", row * 16);
        for i in 0..16 {
            match chunk.get(i) {
                Some(b) => {
                    let _ = write!(out, "{b:02x} ");
                }
                None => out.push_str("   "),
            }
        }
        out.push(' ');
        out.extend(chunk.iter().map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        }));
        out.push('\n');
    }
    out
}
