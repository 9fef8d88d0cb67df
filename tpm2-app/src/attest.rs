// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPMS_ATTEST decoding for quote results

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_human_bytes as hex_bytes;

use super::constants::*;
use super::marshal::*;
use super::types::TpmlPcrSelection;

/// The fields of a TPMS_ATTEST a verifier checks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestInfo {
    pub magic: u32,
    pub attest_type: u16,
    #[serde(with = "hex_bytes")]
    pub signer_qualified_name: Vec<u8>,
    /// The qualifying data passed to the attesting command
    #[serde(with = "hex_bytes")]
    pub nonce: Vec<u8>,
    pub clock: u64,
    pub firmware_version: u64,
    /// PCRs covered by a quote; empty for other attestation types
    #[serde(skip)]
    pub selected_pcrs: TpmlPcrSelection,
    /// Digest of the quoted PCR values; empty for other attestation types
    #[serde(with = "hex_bytes")]
    pub selected_pcr_digest: Vec<u8>,
}

impl AttestInfo {
    pub fn is_quote(&self) -> bool {
        self.attest_type == TpmSt::AttestQuote.to_u16()
    }
}

/// Decode a marshalled TPMS_ATTEST, as returned in `QuoteOutput::attest`.
pub fn unmarshal_attest(data: &[u8]) -> Result<AttestInfo> {
    let mut buf = ResponseBuffer::new(data);

    let magic = buf.get_u32()?;
    if magic != TPM_GENERATED_VALUE {
        bail!("attestation was not generated by a TPM: magic 0x{magic:08x}");
    }
    let attest_type = buf.get_u16()?;
    let signer_qualified_name = buf.get_tpm2b()?;
    let nonce = buf.get_tpm2b_bounded(MAX_DATA_SIZE)?;

    // TPMS_CLOCK_INFO
    let clock = buf.get_u64()?;
    let _reset_count = buf.get_u32()?;
    let _restart_count = buf.get_u32()?;
    let _safe = buf.get_u8()?;

    let firmware_version = buf.get_u64()?;

    let mut info = AttestInfo {
        magic,
        attest_type,
        signer_qualified_name,
        nonce,
        clock,
        firmware_version,
        selected_pcrs: TpmlPcrSelection::default(),
        selected_pcr_digest: Vec::new(),
    };

    if info.is_quote() {
        info.selected_pcrs = TpmlPcrSelection::unmarshal(&mut buf)?;
        info.selected_pcr_digest = buf.get_tpm2b_bounded(MAX_DIGEST_SIZE)?;
        buf.finish()?;
    }
    Ok(info)
}
