// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 command orchestration and authorization sessions
//!
//! [`App`] builds TPM 2.0 commands, sends them through a [`Tcti`] and
//! decodes the responses into typed results. Anything that can execute a
//! complete command buffer can sit behind it as an [`Engine`]: a software
//! simulator, a closure ([`CommandFn`]) or the kernel device ([`TpmDevice`]).
//!
//! ## Error model
//!
//! - A non-success TPM response code is returned as `Err(ResponseCode)`,
//!   untouched.
//! - Oversized arguments, invalid enum values and malformed responses are
//!   programming or engine bugs and panic.
//!
//! ## Sessions
//!
//! Commands that take authorization use the area held by the `App`.
//! [`App::set_auth_password`] and [`App::set_session_handle`] change it for
//! every following command.
//!
//! ## Example
//!
//! ```no_run
//! use tpm2_app::{App, Hierarchy, ObjectParams, ObjectType, TpmDevice};
//!
//! let mut app = App::with_engine(TpmDevice::detect()?);
//! let srk = app.create_primary(
//!     Hierarchy::Owner,
//!     ObjectType::Rsa,
//!     Some(b"srk".as_slice()),
//!     &ObjectParams {
//!         restricted: true,
//!         decrypt: true,
//!         ..Default::default()
//!     },
//! )?;
//! println!("primary key 0x{:08x}", srk.handle);
//! # Ok::<(), anyhow::Error>(())
//! ```

mod app;
mod attest;
mod command;
mod config;
mod constants;
mod device;
mod error;
mod kdf;
mod keyed_hash;
mod marshal;
mod session;
mod tcti;
mod template;
mod types;

pub use app::*;
pub use attest::{unmarshal_attest, AttestInfo};
pub use command::{TpmCommand, TpmResponse};
pub use config::{AppConfig, PcrSelection};
pub use constants::*;
pub use device::TpmDevice;
pub use error::{ResponseCode, TpmResult};
pub use kdf::kdfa;
pub use keyed_hash::ExternalKeyedHash;
pub use marshal::{check_size, CommandBuffer, Marshal, ResponseBuffer, Unmarshal};
pub use session::{AuthArea, AuthCommand, PolicySecretOutput, StartAuthSessionOutput};
pub use tcti::{hex_dump, CommandFn, Engine, Tcti, TctiAdapter, TctiState};
pub use template::{endorsement_key_template, ObjectParams, ObjectType, TemplateBuilder, EK_AUTH_POLICY};
pub use types::*;
