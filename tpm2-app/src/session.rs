// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Authorization area and policy sessions
//!
//! Every command that takes an authorization area is sent with the area
//! held by [`App`]. It starts as a single password slot with an empty
//! password; `set_auth_password` and `set_session_handle` change what the
//! next commands present.

use serde::{Deserialize, Serialize};
use serde_human_bytes as hex_bytes;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::app::{decode, App};
use super::command::TpmCommand;
use super::constants::*;
use super::error::TpmResult;
use super::marshal::*;
use super::tcti::Tcti;
use super::types::*;

/// Number of authorization slots an [`AuthArea`] can carry
pub const MAX_AUTH_SLOTS: usize = 2;

/// TPMS_AUTH_COMMAND
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthCommand {
    pub session_handle: u32,
    pub nonce: Vec<u8>,
    pub attributes: TpmaSa,
    pub hmac: Vec<u8>,
}

impl AuthCommand {
    /// Password authorization with `password` in the HMAC field
    #[track_caller]
    pub fn password(password: &[u8]) -> Self {
        check_size("password", password.len(), MAX_DIGEST_SIZE);
        Self {
            session_handle: tpm_rh::PW,
            nonce: Vec::new(),
            attributes: TpmaSa::new(),
            hmac: password.to_vec(),
        }
    }

    /// Authorization through an already started session, kept open
    pub fn session(handle: u32) -> Self {
        Self {
            session_handle: handle,
            nonce: Vec::new(),
            attributes: TpmaSa::new().with_continue_session(),
            hmac: Vec::new(),
        }
    }

    pub fn is_password(&self) -> bool {
        self.session_handle == tpm_rh::PW
    }
}

impl Default for AuthCommand {
    fn default() -> Self {
        Self::password(&[])
    }
}

impl Marshal for AuthCommand {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.session_handle);
        buf.put_tpm2b(&self.nonce);
        buf.put_u8(self.attributes.0);
        buf.put_tpm2b(&self.hmac);
    }
}

/// The authorization area sent after the handles of a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthArea {
    slots: [AuthCommand; MAX_AUTH_SLOTS],
    count: usize,
}

impl AuthArea {
    pub fn new() -> Self {
        Self {
            slots: Default::default(),
            count: 1,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// # Panics
    ///
    /// Panics if `count` is not 1 or 2.
    #[track_caller]
    pub fn set_count(&mut self, count: usize) {
        assert!(
            (1..=MAX_AUTH_SLOTS).contains(&count),
            "auth slot count {count} out of range"
        );
        self.count = count;
    }

    pub fn slot(&self, index: usize) -> &AuthCommand {
        &self.slots[index]
    }

    pub fn slot_mut(&mut self, index: usize) -> &mut AuthCommand {
        &mut self.slots[index]
    }

    /// Put `password` in slot 0 and switch it back to password auth.
    #[track_caller]
    pub fn set_password(&mut self, password: &[u8]) {
        self.slots[0] = AuthCommand::password(password);
    }

    /// Bind slot 0 to `handle`. The sentinel `TPM_RS_PW` clears
    /// continue-session, any other handle sets it. The HMAC field is kept.
    pub fn set_session_handle(&mut self, handle: u32) {
        let slot = &mut self.slots[0];
        slot.session_handle = handle;
        slot.attributes = if handle == tpm_rh::PW {
            TpmaSa::new()
        } else {
            TpmaSa::new().with_continue_session()
        };
    }
}

impl Default for AuthArea {
    fn default() -> Self {
        Self::new()
    }
}

impl Marshal for AuthArea {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_sized32(|inner| {
            for slot in &self.slots[..self.count] {
                slot.marshal(inner);
            }
        });
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartAuthSessionOutput {
    pub handle: u32,
    #[serde(with = "hex_bytes")]
    pub nonce_tpm: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySecretOutput {
    #[serde(with = "hex_bytes")]
    pub timeout: Vec<u8>,
    pub ticket: TpmtTkAuth,
}

impl<T: Tcti> App<T> {
    pub fn auth_area(&self) -> &AuthArea {
        &self.auths
    }

    /// Authorize subsequent commands with `password`
    #[track_caller]
    pub fn set_auth_password(&mut self, password: &[u8]) {
        debug!("set password auth ({} bytes)", password.len());
        self.auths.set_password(password);
    }

    /// Authorize subsequent commands through session `handle`
    pub fn set_session_handle(&mut self, handle: u32) {
        debug!("bind session 0x{handle:08x}");
        self.auths.set_session_handle(handle);
    }

    /// Start an unbound, unsalted SHA-256 policy session, or a trial session
    /// that only computes a digest.
    pub fn start_auth_session(&mut self, is_trial: bool) -> TpmResult<StartAuthSessionOutput> {
        debug!("start auth session trial={is_trial}");
        let session_type = if is_trial { TpmSe::Trial } else { TpmSe::Policy };

        let mut cmd = TpmCommand::new(TpmCc::StartAuthSession);
        cmd.add_handle(tpm_rh::NULL); // tpmKey
        cmd.add_handle(tpm_rh::NULL); // bind
        cmd.add_tpm2b(&[0u8; SHA256_DIGEST_SIZE]); // nonceCaller
        cmd.add_tpm2b_empty(); // encryptedSalt
        cmd.add_u8(session_type as u8);
        cmd.add(&TpmtSymDef::null());
        cmd.add_u16(TpmAlgId::Sha256.to_u16());

        let response = self.execute(cmd)?;
        let out = decode(TpmCc::StartAuthSession, || {
            let mut buf = response.data_buffer();
            let handle = buf.get_u32()?;
            let nonce_tpm = buf.get_tpm2b_bounded(MAX_DIGEST_SIZE)?;
            buf.finish()?;
            Ok(StartAuthSessionOutput { handle, nonce_tpm })
        });

        debug!("started session 0x{:08x}", out.handle);
        Ok(out)
    }

    /// Require the object's auth value as a password when the session is used
    pub fn policy_password(&mut self, session: u32) -> TpmResult<()> {
        debug!("policy password on 0x{session:08x}");
        let mut cmd = TpmCommand::new(TpmCc::PolicyPassword);
        cmd.add_handle(session);
        self.execute(cmd).map(drop)
    }

    /// Assert that the configured policy PCRs hash to `pcr_digest`.
    /// An empty digest asserts whatever the PCRs hold now.
    pub fn policy_pcr(&mut self, session: u32, pcr_digest: &[u8]) -> TpmResult<()> {
        debug!(
            "policy PCR on 0x{session:08x} digest {}",
            hex::encode(pcr_digest)
        );
        check_size("PCR digest", pcr_digest.len(), MAX_DIGEST_SIZE);
        let pcrs = self.config().policy_pcrs.to_tpml();

        let mut cmd = TpmCommand::new(TpmCc::PolicyPCR);
        cmd.add_handle(session);
        cmd.add_tpm2b(pcr_digest);
        cmd.add(&pcrs);
        self.execute(cmd).map(drop)
    }

    /// Bind the policy to the authorization of `auth_handle`, which is
    /// satisfied with the current authorization area.
    pub fn policy_secret(&mut self, auth_handle: u32, session: u32) -> TpmResult<PolicySecretOutput> {
        debug!("policy secret 0x{auth_handle:08x} on 0x{session:08x}");
        let mut cmd = TpmCommand::with_sessions(TpmCc::PolicySecret);
        cmd.add_handle(auth_handle);
        cmd.add_handle(session);
        cmd.add(&self.auths);
        cmd.add_tpm2b_empty(); // nonceTPM
        cmd.add_tpm2b_empty(); // cpHashA
        cmd.add_tpm2b_empty(); // policyRef
        cmd.add_u32(0); // expiration

        let response = self.execute(cmd)?;
        Ok(decode(TpmCc::PolicySecret, || {
            let mut buf = response.parameters()?;
            Ok(PolicySecretOutput {
                timeout: buf.get_tpm2b()?,
                ticket: TpmtTkAuth::unmarshal(&mut buf)?,
            })
        }))
    }

    pub fn policy_get_digest(&mut self, session: u32) -> TpmResult<Vec<u8>> {
        let mut cmd = TpmCommand::new(TpmCc::PolicyGetDigest);
        cmd.add_handle(session);

        let response = self.execute(cmd)?;
        let digest = decode(TpmCc::PolicyGetDigest, || {
            response.parameters()?.get_tpm2b_bounded(MAX_DIGEST_SIZE)
        });
        debug!("policy digest of 0x{session:08x}: {}", hex::encode(&digest));
        Ok(digest)
    }

    /// SHA-256 over the current values of the configured policy PCRs, the
    /// digest `policy_pcr` expects for the present state.
    pub fn policy_pcr_digest(&mut self) -> TpmResult<Vec<u8>> {
        let selection = self.config().policy_pcrs.to_tpml();
        let values = self.pcr_read(&selection)?;

        let mut hasher = Sha256::new();
        for (_, value) in &values {
            hasher.update(value);
        }
        Ok(hasher.finalize().to_vec())
    }
}
