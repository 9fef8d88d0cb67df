// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Orchestrator configuration

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use super::constants::{TpmAlgId, HEADER_SIZE, TPM_MAX_COMMAND_SIZE};
use super::types::TpmlPcrSelection;

/// PCR selection specifying which PCRs to include
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcrSelection {
    /// Hash bank (e.g., "sha256")
    pub bank: String,

    /// List of PCR indices
    pub pcrs: Vec<u32>,
}

impl PcrSelection {
    pub fn new(bank: &str, pcrs: &[u32]) -> Self {
        Self {
            bank: bank.to_string(),
            pcrs: pcrs.to_vec(),
        }
    }

    pub fn sha256(pcrs: &[u32]) -> Self {
        Self::new("sha256", pcrs)
    }

    pub fn hash_alg(&self) -> Result<TpmAlgId> {
        TpmAlgId::from_bank_name(&self.bank)
            .with_context(|| format!("unknown PCR bank: {}", self.bank))
    }

    pub fn validate(&self) -> Result<()> {
        self.hash_alg()?;
        if let Some(pcr) = self.pcrs.iter().find(|&&p| p >= 24) {
            bail!("PCR index {pcr} out of range");
        }
        Ok(())
    }

    /// Wire form of the selection.
    ///
    /// # Panics
    ///
    /// Panics on an unknown bank; call [`AppConfig::validate`] first.
    pub fn to_tpml(&self) -> TpmlPcrSelection {
        match self.hash_alg() {
            Ok(hash) => TpmlPcrSelection::single(hash, &self.pcrs),
            Err(err) => panic!("{err:#}"),
        }
    }
}

impl Default for PcrSelection {
    /// The first four PCRs of the SHA-256 bank
    fn default() -> Self {
        Self::sha256(&[0, 1, 2, 3])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// PCRs asserted by `policy_pcr`
    pub policy_pcrs: PcrSelection,
    /// PCRs covered by `quote`
    pub quote_pcrs: PcrSelection,
    /// Capacity of the receive buffer handed to the transport
    pub max_response_size: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            policy_pcrs: PcrSelection::default(),
            quote_pcrs: PcrSelection::default(),
            max_response_size: TPM_MAX_COMMAND_SIZE,
        }
    }
}

impl AppConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("failed to parse app config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.policy_pcrs
            .validate()
            .context("invalid policy_pcrs")?;
        self.quote_pcrs.validate().context("invalid quote_pcrs")?;
        if self.max_response_size < HEADER_SIZE {
            bail!(
                "max_response_size {} is smaller than a response header",
                self.max_response_size
            );
        }
        Ok(())
    }
}
