// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 data types
//!
//! Only the structures this crate builds or consumes are modelled. Unions
//! are Rust enums tagged by the selector that precedes them on the wire.

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use serde_human_bytes as hex_bytes;

use super::constants::*;
use super::marshal::*;

fn alg(raw: u16) -> Result<TpmAlgId> {
    TpmAlgId::from_u16(raw).ok_or_else(|| anyhow!("unknown algorithm: 0x{:04x}", raw))
}

fn get_alg(buf: &mut ResponseBuffer) -> Result<TpmAlgId> {
    alg(buf.get_u16()?)
}

/// TPM2B_DIGEST - Variable length digest
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tpm2bDigest {
    pub buffer: Vec<u8>,
}

impl Tpm2bDigest {
    pub fn new(data: Vec<u8>) -> Self {
        Self { buffer: data }
    }

    pub fn empty() -> Self {
        Self { buffer: Vec::new() }
    }
}

impl Marshal for Tpm2bDigest {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_tpm2b(&self.buffer);
    }
}

impl Unmarshal for Tpm2bDigest {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            buffer: buf.get_tpm2b_bounded(MAX_DIGEST_SIZE)?,
        })
    }
}

/// TPM2B_NONCE - Nonce value
pub type Tpm2bNonce = Tpm2bDigest;

/// TPMS_PCR_SELECTION - PCR selection for a single hash algorithm
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsPcrSelection {
    pub hash: TpmAlgId,
    pub pcr_select: Vec<u8>, // Bitmap of selected PCRs
}

impl TpmsPcrSelection {
    pub fn new(hash: TpmAlgId, pcrs: &[u32]) -> Self {
        // At least 3 bytes, enough for PCR 0-23
        let max_pcr = pcrs.iter().max().copied().unwrap_or(0);
        let size = ((max_pcr / 8) + 1).max(3) as usize;
        let mut pcr_select = vec![0u8; size];

        for &pcr in pcrs {
            pcr_select[(pcr / 8) as usize] |= 1 << (pcr % 8);
        }

        Self { hash, pcr_select }
    }

    pub fn sha256(pcrs: &[u32]) -> Self {
        Self::new(TpmAlgId::Sha256, pcrs)
    }

    /// Selected PCR indices in ascending order
    pub fn pcrs(&self) -> impl Iterator<Item = u32> + '_ {
        self.pcr_select
            .iter()
            .enumerate()
            .flat_map(|(byte_idx, &byte)| {
                (0..8u32)
                    .filter(move |bit| byte & (1 << bit) != 0)
                    .map(move |bit| byte_idx as u32 * 8 + bit)
            })
    }
}

impl Marshal for TpmsPcrSelection {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.hash.to_u16());
        buf.put_u8(self.pcr_select.len() as u8);
        buf.put_bytes(&self.pcr_select);
    }
}

impl Unmarshal for TpmsPcrSelection {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let hash = get_alg(buf)?;
        let size = buf.get_u8()? as usize;
        let pcr_select = buf.get_bytes(size)?;
        Ok(Self { hash, pcr_select })
    }
}

/// TPML_PCR_SELECTION - List of PCR selections
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TpmlPcrSelection {
    pub pcr_selections: Vec<TpmsPcrSelection>,
}

impl TpmlPcrSelection {
    pub fn new(selections: Vec<TpmsPcrSelection>) -> Self {
        Self {
            pcr_selections: selections,
        }
    }

    pub fn single(hash: TpmAlgId, pcrs: &[u32]) -> Self {
        Self {
            pcr_selections: vec![TpmsPcrSelection::new(hash, pcrs)],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pcr_selections.iter().all(|s| s.pcrs().next().is_none())
    }

    /// Number of selected PCRs across all banks
    pub fn count(&self) -> usize {
        self.pcr_selections.iter().map(|s| s.pcrs().count()).sum()
    }

    /// Deselect every PCR that `other` selects in the same bank.
    pub fn remove(&mut self, other: &TpmlPcrSelection) {
        for taken in &other.pcr_selections {
            for sel in self.pcr_selections.iter_mut().filter(|s| s.hash == taken.hash) {
                for (bits, mask) in sel.pcr_select.iter_mut().zip(&taken.pcr_select) {
                    *bits &= !mask;
                }
            }
        }
    }
}

impl Marshal for TpmlPcrSelection {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.pcr_selections.len() as u32);
        for sel in &self.pcr_selections {
            sel.marshal(buf);
        }
    }
}

impl Unmarshal for TpmlPcrSelection {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let count = buf.get_u32()? as usize;
        if count > 16 {
            bail!("too many PCR selections: {count}");
        }
        let mut pcr_selections = Vec::with_capacity(count);
        for _ in 0..count {
            pcr_selections.push(TpmsPcrSelection::unmarshal(buf)?);
        }
        Ok(Self { pcr_selections })
    }
}

/// TPML_DIGEST - List of digests
#[derive(Debug, Clone, Default)]
pub struct TpmlDigest {
    pub digests: Vec<Tpm2bDigest>,
}

impl Unmarshal for TpmlDigest {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let count = buf.get_u32()? as usize;
        if count > 8 {
            bail!("too many digests: {count}");
        }
        let mut digests = Vec::with_capacity(count);
        for _ in 0..count {
            digests.push(Tpm2bDigest::unmarshal(buf)?);
        }
        Ok(Self { digests })
    }
}

/// TPMS_NV_PUBLIC - NV index public area
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsNvPublic {
    pub nv_index: u32,
    pub name_alg: TpmAlgId,
    pub attributes: TpmaNv,
    pub auth_policy: Tpm2bDigest,
    pub data_size: u16,
}

impl TpmsNvPublic {
    pub fn new(nv_index: u32, data_size: u16, attributes: TpmaNv) -> Self {
        Self {
            nv_index,
            name_alg: TpmAlgId::Sha256,
            attributes,
            auth_policy: Tpm2bDigest::empty(),
            data_size,
        }
    }
}

impl Marshal for TpmsNvPublic {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.nv_index);
        buf.put_u16(self.name_alg.to_u16());
        buf.put_u32(self.attributes.0);
        self.auth_policy.marshal(buf);
        buf.put_u16(self.data_size);
    }
}

impl Unmarshal for TpmsNvPublic {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            nv_index: buf.get_u32()?,
            name_alg: get_alg(buf)?,
            attributes: TpmaNv(buf.get_u32()?),
            auth_policy: Tpm2bDigest::unmarshal(buf)?,
            data_size: buf.get_u16()?,
        })
    }
}

/// TPM2B_NV_PUBLIC - NV public with size prefix
#[derive(Debug, Clone)]
pub struct Tpm2bNvPublic {
    pub nv_public: TpmsNvPublic,
}

impl Marshal for Tpm2bNvPublic {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_sized(|inner| self.nv_public.marshal(inner));
    }
}

impl Unmarshal for Tpm2bNvPublic {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let mut inner = buf.get_sized()?;
        if inner.remaining() == 0 {
            bail!("empty NV public");
        }
        let nv_public = TpmsNvPublic::unmarshal(&mut inner)?;
        inner.finish()?;
        Ok(Self { nv_public })
    }
}

/// TPMT_SYM_DEF(_OBJECT) - Symmetric algorithm definition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpmtSymDef {
    pub algorithm: TpmAlgId,
    pub key_bits: u16,
    pub mode: TpmAlgId,
}

impl TpmtSymDef {
    pub fn null() -> Self {
        Self {
            algorithm: TpmAlgId::Null,
            key_bits: 0,
            mode: TpmAlgId::Null,
        }
    }

    pub fn aes_128_cfb() -> Self {
        Self {
            algorithm: TpmAlgId::Aes,
            key_bits: 128,
            mode: TpmAlgId::Cfb,
        }
    }
}

impl Marshal for TpmtSymDef {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.algorithm.to_u16());
        if self.algorithm != TpmAlgId::Null {
            buf.put_u16(self.key_bits);
            buf.put_u16(self.mode.to_u16());
        }
    }
}

impl Unmarshal for TpmtSymDef {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let algorithm = get_alg(buf)?;
        if algorithm == TpmAlgId::Null {
            return Ok(Self::null());
        }
        Ok(Self {
            algorithm,
            key_bits: buf.get_u16()?,
            mode: get_alg(buf)?,
        })
    }
}

/// TPMT_SYM_DEF_OBJECT - Symmetric definition for objects
pub type TpmtSymDefObject = TpmtSymDef;

/// A scheme selector optionally followed by a hash algorithm.
///
/// Covers TPMT_RSA_SCHEME, TPMT_RSA_DECRYPT, TPMT_ECC_SCHEME, TPMT_SIG_SCHEME
/// and TPMT_KDF_SCHEME, which share this layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpmtScheme {
    pub scheme: TpmAlgId,
    pub hash_alg: Option<TpmAlgId>,
}

impl TpmtScheme {
    pub fn null() -> Self {
        Self {
            scheme: TpmAlgId::Null,
            hash_alg: None,
        }
    }

    pub fn with_hash(scheme: TpmAlgId, hash: TpmAlgId) -> Self {
        Self {
            scheme,
            hash_alg: Some(hash),
        }
    }

    pub fn rsassa(hash: TpmAlgId) -> Self {
        Self::with_hash(TpmAlgId::RsaSsa, hash)
    }

    pub fn ecdsa(hash: TpmAlgId) -> Self {
        Self::with_hash(TpmAlgId::EcDsa, hash)
    }

    /// RSAES-PKCS1-v1_5 carries no hash
    pub fn rsaes() -> Self {
        Self {
            scheme: TpmAlgId::RsaEs,
            hash_alg: None,
        }
    }
}

impl Marshal for TpmtScheme {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.scheme.to_u16());
        if let Some(hash) = self.hash_alg {
            buf.put_u16(hash.to_u16());
        }
    }
}

impl Unmarshal for TpmtScheme {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let scheme = get_alg(buf)?;
        let hash_alg = match scheme {
            TpmAlgId::Null | TpmAlgId::RsaEs => None,
            _ => Some(get_alg(buf)?),
        };
        Ok(Self { scheme, hash_alg })
    }
}

pub type TpmtRsaScheme = TpmtScheme;
pub type TpmtEccScheme = TpmtScheme;
pub type TpmtSigScheme = TpmtScheme;
pub type TpmtKdfScheme = TpmtScheme;
pub type TpmtRsaDecrypt = TpmtScheme;

/// TPMS_RSA_PARMS - RSA key parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsRsaParms {
    pub symmetric: TpmtSymDefObject,
    pub scheme: TpmtRsaScheme,
    pub key_bits: u16,
    pub exponent: u32,
}

impl Marshal for TpmsRsaParms {
    fn marshal(&self, buf: &mut CommandBuffer) {
        self.symmetric.marshal(buf);
        self.scheme.marshal(buf);
        buf.put_u16(self.key_bits);
        buf.put_u32(self.exponent);
    }
}

impl Unmarshal for TpmsRsaParms {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            symmetric: TpmtSymDef::unmarshal(buf)?,
            scheme: TpmtScheme::unmarshal(buf)?,
            key_bits: buf.get_u16()?,
            exponent: buf.get_u32()?,
        })
    }
}

/// TPMS_ECC_PARMS - ECC key parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsEccParms {
    pub symmetric: TpmtSymDefObject,
    pub scheme: TpmtEccScheme,
    pub curve_id: TpmEccCurve,
    pub kdf: TpmtKdfScheme,
}

impl Marshal for TpmsEccParms {
    fn marshal(&self, buf: &mut CommandBuffer) {
        self.symmetric.marshal(buf);
        self.scheme.marshal(buf);
        buf.put_u16(self.curve_id.to_u16());
        self.kdf.marshal(buf);
    }
}

impl Unmarshal for TpmsEccParms {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let symmetric = TpmtSymDef::unmarshal(buf)?;
        let scheme = TpmtScheme::unmarshal(buf)?;
        let curve = buf.get_u16()?;
        let curve_id =
            TpmEccCurve::from_u16(curve).ok_or_else(|| anyhow!("unknown curve: 0x{curve:04x}"))?;
        let kdf = TpmtScheme::unmarshal(buf)?;
        Ok(Self {
            symmetric,
            scheme,
            curve_id,
            kdf,
        })
    }
}

/// TPMS_SYMCIPHER_PARMS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpmsSymCipherParms {
    pub sym: TpmtSymDefObject,
}

/// TPMT_KEYEDHASH_SCHEME
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyedHashScheme {
    Null,
    Hmac { hash_alg: TpmAlgId },
    Xor { hash_alg: TpmAlgId, kdf: TpmAlgId },
}

impl Marshal for KeyedHashScheme {
    fn marshal(&self, buf: &mut CommandBuffer) {
        match *self {
            KeyedHashScheme::Null => buf.put_u16(TpmAlgId::Null.to_u16()),
            KeyedHashScheme::Hmac { hash_alg } => {
                buf.put_u16(TpmAlgId::Hmac.to_u16());
                buf.put_u16(hash_alg.to_u16());
            }
            KeyedHashScheme::Xor { hash_alg, kdf } => {
                buf.put_u16(TpmAlgId::Xor.to_u16());
                buf.put_u16(hash_alg.to_u16());
                buf.put_u16(kdf.to_u16());
            }
        }
    }
}

impl Unmarshal for KeyedHashScheme {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        match get_alg(buf)? {
            TpmAlgId::Null => Ok(KeyedHashScheme::Null),
            TpmAlgId::Hmac => Ok(KeyedHashScheme::Hmac {
                hash_alg: get_alg(buf)?,
            }),
            TpmAlgId::Xor => Ok(KeyedHashScheme::Xor {
                hash_alg: get_alg(buf)?,
                kdf: get_alg(buf)?,
            }),
            other => bail!("invalid keyed-hash scheme: {other:?}"),
        }
    }
}

/// TPMS_KEYEDHASH_PARMS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpmsKeyedHashParms {
    pub scheme: KeyedHashScheme,
}

/// TPMU_PUBLIC_PARMS - Public parameters union
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TpmtPublicParms {
    Rsa(TpmsRsaParms),
    Ecc(TpmsEccParms),
    SymCipher(TpmsSymCipherParms),
    KeyedHash(TpmsKeyedHashParms),
}

impl TpmtPublicParms {
    pub fn type_alg(&self) -> TpmAlgId {
        match self {
            TpmtPublicParms::Rsa(_) => TpmAlgId::Rsa,
            TpmtPublicParms::Ecc(_) => TpmAlgId::Ecc,
            TpmtPublicParms::SymCipher(_) => TpmAlgId::SymCipher,
            TpmtPublicParms::KeyedHash(_) => TpmAlgId::KeyedHash,
        }
    }

    fn unmarshal_for(type_alg: TpmAlgId, buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(match type_alg {
            TpmAlgId::Rsa => TpmtPublicParms::Rsa(TpmsRsaParms::unmarshal(buf)?),
            TpmAlgId::Ecc => TpmtPublicParms::Ecc(TpmsEccParms::unmarshal(buf)?),
            TpmAlgId::SymCipher => TpmtPublicParms::SymCipher(TpmsSymCipherParms {
                sym: TpmtSymDef::unmarshal(buf)?,
            }),
            TpmAlgId::KeyedHash => TpmtPublicParms::KeyedHash(TpmsKeyedHashParms {
                scheme: KeyedHashScheme::unmarshal(buf)?,
            }),
            other => bail!("unsupported object type: {other:?}"),
        })
    }
}

impl Marshal for TpmtPublicParms {
    fn marshal(&self, buf: &mut CommandBuffer) {
        match self {
            TpmtPublicParms::Rsa(p) => p.marshal(buf),
            TpmtPublicParms::Ecc(p) => p.marshal(buf),
            TpmtPublicParms::SymCipher(p) => p.sym.marshal(buf),
            TpmtPublicParms::KeyedHash(p) => p.scheme.marshal(buf),
        }
    }
}

/// TPMT_PUBLIC_PARMS: the parameters prefixed by their object type, as
/// taken by TPM2_TestParms.
#[derive(Debug, Clone)]
pub struct TpmtPublicParmsTagged(pub TpmtPublicParms);

impl Marshal for TpmtPublicParmsTagged {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.0.type_alg().to_u16());
        self.0.marshal(buf);
    }
}

/// TPMU_PUBLIC_ID - Unique identifier union
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TpmtPublicUnique {
    Rsa(Vec<u8>),          // TPM2B_PUBLIC_KEY_RSA
    Ecc(Vec<u8>, Vec<u8>), // TPMS_ECC_POINT (x, y)
    SymCipher(Vec<u8>),    // TPM2B_DIGEST
    KeyedHash(Vec<u8>),    // TPM2B_DIGEST
}

impl TpmtPublicUnique {
    fn unmarshal_for(type_alg: TpmAlgId, buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(match type_alg {
            TpmAlgId::Rsa => TpmtPublicUnique::Rsa(buf.get_tpm2b_bounded(MAX_RSA_KEY_BYTES)?),
            TpmAlgId::Ecc => TpmtPublicUnique::Ecc(
                buf.get_tpm2b_bounded(MAX_ECC_KEY_BYTES)?,
                buf.get_tpm2b_bounded(MAX_ECC_KEY_BYTES)?,
            ),
            TpmAlgId::SymCipher => TpmtPublicUnique::SymCipher(buf.get_tpm2b_bounded(MAX_DIGEST_SIZE)?),
            TpmAlgId::KeyedHash => TpmtPublicUnique::KeyedHash(buf.get_tpm2b_bounded(MAX_DIGEST_SIZE)?),
            other => bail!("unsupported object type: {other:?}"),
        })
    }
}

impl Marshal for TpmtPublicUnique {
    fn marshal(&self, buf: &mut CommandBuffer) {
        match self {
            TpmtPublicUnique::Rsa(n) => buf.put_tpm2b(n),
            TpmtPublicUnique::Ecc(x, y) => {
                buf.put_tpm2b(x);
                buf.put_tpm2b(y);
            }
            TpmtPublicUnique::SymCipher(d) | TpmtPublicUnique::KeyedHash(d) => buf.put_tpm2b(d),
        }
    }
}

/// TPMT_PUBLIC - Public area template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmtPublic {
    pub type_alg: TpmAlgId,
    pub name_alg: TpmAlgId,
    pub object_attributes: TpmaObject,
    pub auth_policy: Tpm2bDigest,
    pub parameters: TpmtPublicParms,
    pub unique: TpmtPublicUnique,
}

impl Marshal for TpmtPublic {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.type_alg.to_u16());
        buf.put_u16(self.name_alg.to_u16());
        buf.put_u32(self.object_attributes.0);
        self.auth_policy.marshal(buf);
        self.parameters.marshal(buf);
        self.unique.marshal(buf);
    }
}

impl Unmarshal for TpmtPublic {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let type_alg = get_alg(buf)?;
        let name_alg = get_alg(buf)?;
        let object_attributes = TpmaObject(buf.get_u32()?);
        let auth_policy = Tpm2bDigest::unmarshal(buf)?;
        let parameters = TpmtPublicParms::unmarshal_for(type_alg, buf)?;
        let unique = TpmtPublicUnique::unmarshal_for(type_alg, buf)?;
        Ok(Self {
            type_alg,
            name_alg,
            object_attributes,
            auth_policy,
            parameters,
            unique,
        })
    }
}

/// TPM2B_PUBLIC - Public area with size prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tpm2bPublic {
    pub public_area: Vec<u8>, // Raw marshalled TPMT_PUBLIC
}

impl Tpm2bPublic {
    pub fn from_template(template: &TpmtPublic) -> Self {
        Self {
            public_area: template.to_bytes(),
        }
    }

    /// Decode the wrapped TPMT_PUBLIC
    pub fn decode(&self) -> Result<TpmtPublic> {
        let mut buf = ResponseBuffer::new(&self.public_area);
        let public = TpmtPublic::unmarshal(&mut buf)?;
        buf.finish()?;
        Ok(public)
    }
}

impl Marshal for Tpm2bPublic {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_tpm2b(&self.public_area);
    }
}

impl Unmarshal for Tpm2bPublic {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let public_area = buf.get_tpm2b()?;
        Ok(Self { public_area })
    }
}

/// TPM2B_SENSITIVE_CREATE - Sensitive data for object creation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tpm2bSensitiveCreate {
    pub user_auth: Vec<u8>,
    pub data: Vec<u8>,
}

impl Tpm2bSensitiveCreate {
    /// # Panics
    ///
    /// Panics if `user_auth` exceeds a SHA-256 digest or `data` exceeds
    /// TPM2B_SENSITIVE_DATA.
    #[track_caller]
    pub fn new(user_auth: &[u8], data: &[u8]) -> Self {
        check_size("user auth", user_auth.len(), SHA256_DIGEST_SIZE);
        check_size("sensitive data", data.len(), MAX_SYM_DATA);
        Self {
            user_auth: user_auth.to_vec(),
            data: data.to_vec(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

impl Marshal for Tpm2bSensitiveCreate {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_sized(|inner| {
            inner.put_tpm2b(&self.user_auth);
            inner.put_tpm2b(&self.data);
        });
    }
}

/// TPMT_HA - Hash value with algorithm
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmtHa {
    pub hash_alg: TpmAlgId,
    pub digest: Vec<u8>,
}

impl TpmtHa {
    pub fn sha256(digest: Vec<u8>) -> Self {
        Self {
            hash_alg: TpmAlgId::Sha256,
            digest,
        }
    }
}

impl Marshal for TpmtHa {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.hash_alg.to_u16());
        buf.put_bytes(&self.digest);
    }
}

impl Unmarshal for TpmtHa {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let hash_alg = get_alg(buf)?;
        let size = hash_alg.digest_size();
        if size == 0 {
            bail!("not a hash algorithm: {hash_alg:?}");
        }
        Ok(Self {
            hash_alg,
            digest: buf.get_bytes(size)?,
        })
    }
}

/// TPML_DIGEST_VALUES - List of digest values for PCR extend
#[derive(Debug, Clone)]
pub struct TpmlDigestValues {
    pub digests: Vec<TpmtHa>,
}

impl TpmlDigestValues {
    pub fn single(digest: TpmtHa) -> Self {
        Self {
            digests: vec![digest],
        }
    }
}

impl Marshal for TpmlDigestValues {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.digests.len() as u32);
        for d in &self.digests {
            d.marshal(buf);
        }
    }
}

/// TPMT_TK_* - Creation, verification, hash-check and auth tickets share
/// one layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TpmtTicket {
    pub tag: u16,
    pub hierarchy: u32,
    #[serde(with = "hex_bytes")]
    pub digest: Vec<u8>,
}

impl TpmtTicket {
    /// The empty ticket the TPM accepts for "digest was not produced by the TPM".
    pub fn null(tag: TpmSt) -> Self {
        Self {
            tag: tag.to_u16(),
            hierarchy: tpm_rh::NULL,
            digest: Vec::new(),
        }
    }
}

impl Marshal for TpmtTicket {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.tag);
        buf.put_u32(self.hierarchy);
        buf.put_tpm2b(&self.digest);
    }
}

impl Unmarshal for TpmtTicket {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            tag: buf.get_u16()?,
            hierarchy: buf.get_u32()?,
            digest: buf.get_tpm2b_bounded(MAX_DIGEST_SIZE)?,
        })
    }
}

pub type TpmtTkCreation = TpmtTicket;
pub type TpmtTkVerified = TpmtTicket;
pub type TpmtTkHashcheck = TpmtTicket;
pub type TpmtTkAuth = TpmtTicket;

/// TPMS_CREATION_DATA
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreationData {
    #[serde(with = "hex_bytes")]
    pub pcr_digest: Vec<u8>,
    pub locality: u8,
    pub parent_name_alg: u16,
    #[serde(with = "hex_bytes")]
    pub parent_name: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub parent_qualified_name: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub outside_info: Vec<u8>,
}

impl Unmarshal for CreationData {
    /// Reads a TPM2B_CREATION_DATA, size prefix included
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let mut inner = buf.get_sized()?;
        if inner.remaining() == 0 {
            return Ok(Self::default());
        }
        let _pcr_select = TpmlPcrSelection::unmarshal(&mut inner)?;
        let data = Self {
            pcr_digest: inner.get_tpm2b_bounded(MAX_DIGEST_SIZE)?,
            locality: inner.get_u8()?,
            parent_name_alg: inner.get_u16()?,
            parent_name: inner.get_tpm2b()?,
            parent_qualified_name: inner.get_tpm2b()?,
            outside_info: inner.get_tpm2b_bounded(MAX_DATA_SIZE)?,
        };
        inner.finish()?;
        Ok(data)
    }
}

/// TPMT_SIGNATURE
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "sig_alg", rename_all = "lowercase")]
pub enum TpmtSignature {
    /// RSASSA or RSAPSS
    Rsa {
        scheme: TpmAlgId,
        hash_alg: TpmAlgId,
        #[serde(with = "hex_bytes")]
        sig: Vec<u8>,
    },
    /// ECDSA, ECDAA, SM2 or EC-Schnorr
    Ecc {
        scheme: TpmAlgId,
        hash_alg: TpmAlgId,
        #[serde(with = "hex_bytes")]
        r: Vec<u8>,
        #[serde(with = "hex_bytes")]
        s: Vec<u8>,
    },
    Hmac {
        hash_alg: TpmAlgId,
        #[serde(with = "hex_bytes")]
        digest: Vec<u8>,
    },
    Null,
}

impl TpmtSignature {
    pub fn sig_alg(&self) -> TpmAlgId {
        match self {
            TpmtSignature::Rsa { scheme, .. } | TpmtSignature::Ecc { scheme, .. } => *scheme,
            TpmtSignature::Hmac { .. } => TpmAlgId::Hmac,
            TpmtSignature::Null => TpmAlgId::Null,
        }
    }
}

impl Marshal for TpmtSignature {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.sig_alg().to_u16());
        match self {
            TpmtSignature::Rsa { hash_alg, sig, .. } => {
                buf.put_u16(hash_alg.to_u16());
                buf.put_tpm2b(sig);
            }
            TpmtSignature::Ecc { hash_alg, r, s, .. } => {
                buf.put_u16(hash_alg.to_u16());
                buf.put_tpm2b(r);
                buf.put_tpm2b(s);
            }
            TpmtSignature::Hmac { hash_alg, digest } => {
                buf.put_u16(hash_alg.to_u16());
                buf.put_bytes(digest);
            }
            TpmtSignature::Null => {}
        }
    }
}

impl Unmarshal for TpmtSignature {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let scheme = get_alg(buf)?;
        Ok(match scheme {
            TpmAlgId::RsaSsa | TpmAlgId::RsaPss => TpmtSignature::Rsa {
                scheme,
                hash_alg: get_alg(buf)?,
                sig: buf.get_tpm2b_bounded(MAX_RSA_KEY_BYTES)?,
            },
            TpmAlgId::EcDsa | TpmAlgId::EcDaa | TpmAlgId::Sm2 | TpmAlgId::EcSchnorr => {
                TpmtSignature::Ecc {
                    scheme,
                    hash_alg: get_alg(buf)?,
                    r: buf.get_tpm2b_bounded(MAX_DIGEST_SIZE)?,
                    s: buf.get_tpm2b_bounded(MAX_DIGEST_SIZE)?,
                }
            }
            TpmAlgId::Hmac => {
                let ha = TpmtHa::unmarshal(buf)?;
                TpmtSignature::Hmac {
                    hash_alg: ha.hash_alg,
                    digest: ha.digest,
                }
            }
            TpmAlgId::Null => TpmtSignature::Null,
            other => bail!("unsupported signature algorithm: {other:?}"),
        })
    }
}

/// TPMS_TAGGED_PROPERTY
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaggedProperty {
    pub property: u32,
    pub value: u32,
}

/// TPMS_CAPABILITY_DATA
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityData {
    TpmProperties(Vec<TaggedProperty>),
    /// Any other capability, with its union body left undecoded
    Other { capability: u32, raw: Vec<u8> },
}

impl Unmarshal for CapabilityData {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let capability = buf.get_u32()?;
        if capability != TpmCap::TpmProperties as u32 {
            return Ok(CapabilityData::Other {
                capability,
                raw: buf.get_remaining(),
            });
        }
        let count = buf.get_u32()? as usize;
        if count > 127 {
            bail!("too many tagged properties: {count}");
        }
        let mut props = Vec::with_capacity(count);
        for _ in 0..count {
            props.push(TaggedProperty {
                property: buf.get_u32()?,
                value: buf.get_u32()?,
            });
        }
        Ok(CapabilityData::TpmProperties(props))
    }
}
