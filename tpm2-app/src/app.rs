// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! High-level TPM operations
//!
//! [`App`] turns each operation into one TPM command, attaches the current
//! authorization area where the command takes one, and decodes the response
//! into a typed result. A non-success response code is returned verbatim;
//! a response that does not decode is a broken engine and panics.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_human_bytes as hex_bytes;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::command::*;
use super::config::AppConfig;
use super::constants::*;
use super::error::{ResponseCode, TpmResult};
use super::marshal::*;
use super::session::AuthArea;
use super::tcti::{Engine, Tcti, TctiAdapter};
use super::template::*;
use super::types::*;

/// Largest request per TPM2_GetRandom
const MAX_RANDOM_CHUNK: usize = 48;

/// A TPM2B_PRIVATE or TPM2B_PUBLIC exactly as the TPM returned it, size
/// prefix included. Handed back to `load` unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectBlob(#[serde(with = "hex_bytes")] Vec<u8>);

impl ObjectBlob {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    fn wrap(payload: &[u8]) -> Self {
        let mut buf = CommandBuffer::new();
        buf.put_tpm2b(payload);
        Self(buf.into_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

/// Public key material of an asymmetric object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PublicKey {
    Rsa {
        #[serde(with = "hex_bytes")]
        n: Vec<u8>,
    },
    Ecc {
        curve_id: u16,
        #[serde(with = "hex_bytes")]
        x: Vec<u8>,
        #[serde(with = "hex_bytes")]
        y: Vec<u8>,
    },
    None,
}

impl PublicKey {
    pub fn from_public(public: &TpmtPublic) -> Self {
        match (&public.parameters, &public.unique) {
            (TpmtPublicParms::Rsa(_), TpmtPublicUnique::Rsa(n)) => PublicKey::Rsa { n: n.clone() },
            (TpmtPublicParms::Ecc(ecc), TpmtPublicUnique::Ecc(x, y)) => PublicKey::Ecc {
                curve_id: ecc.curve_id.to_u16(),
                x: x.clone(),
                y: y.clone(),
            },
            _ => PublicKey::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatePrimaryOutput {
    pub handle: u32,
    pub public_key: PublicKey,
    #[serde(with = "hex_bytes")]
    pub name: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub parent_name: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub parent_qualified_name: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOutput {
    pub private: ObjectBlob,
    pub public: ObjectBlob,
    pub public_key: PublicKey,
    #[serde(with = "hex_bytes")]
    pub parent_name: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub parent_qualified_name: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadOutput {
    pub handle: u32,
    #[serde(with = "hex_bytes")]
    pub name: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadPublicOutput {
    pub public: TpmtPublic,
    pub name: Vec<u8>,
    pub qualified_name: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NvReadPublicOutput {
    pub index: u32,
    pub attributes: u32,
    pub data_size: u16,
    #[serde(with = "hex_bytes")]
    pub name: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteOutput {
    /// Marshalled TPMS_ATTEST that the signature covers
    #[serde(with = "hex_bytes")]
    pub attest: Vec<u8>,
    pub signature: TpmtSignature,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportOutput {
    pub private: ObjectBlob,
    pub public: ObjectBlob,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityOutput {
    pub more_data: bool,
    pub data: CapabilityData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TpmProperties {
    pub spec_version: u32,
    pub manufacturer_id: String,
}

/// Decode a successful response; a decode failure panics.
pub(crate) fn decode<R>(cc: TpmCc, parse: impl FnOnce() -> Result<R>) -> R {
    match parse() {
        Ok(r) => r,
        Err(err) => panic!("malformed {} response: {err:#}", cc.name()),
    }
}

/// Command orchestrator bound to one transport
pub struct App<T> {
    tcti: T,
    config: AppConfig,
    pub(crate) auths: AuthArea,
}

impl<E: Engine> App<TctiAdapter<E>> {
    /// Orchestrator over `engine` with the default configuration
    pub fn with_engine(engine: E) -> Self {
        Self::new(TctiAdapter::new(engine))
    }
}

impl<T: Tcti> App<T> {
    pub fn new(tcti: T) -> Self {
        Self {
            tcti,
            config: AppConfig::default(),
            auths: AuthArea::new(),
        }
    }

    pub fn with_config(tcti: T, config: AppConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            tcti,
            config,
            auths: AuthArea::new(),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn tcti(&self) -> &T {
        &self.tcti
    }

    pub fn tcti_mut(&mut self) -> &mut T {
        &mut self.tcti
    }

    pub fn into_tcti(self) -> T {
        self.tcti
    }

    /// Send one command and return the response if it succeeded.
    pub(crate) fn execute(&mut self, cmd: TpmCommand) -> TpmResult<TpmResponse> {
        let cc = cmd.code();
        self.tcti.transmit(&cmd.finalize())?;

        let mut buf = vec![0u8; self.config.max_response_size];
        let n = self.tcti.receive(&mut buf)?;
        let response = decode(cc, || TpmResponse::parse(&buf[..n]));

        if !response.is_success() {
            debug!("{} failed: 0x{:08x}", cc.name(), response.response_code);
            return Err(ResponseCode(response.response_code));
        }
        Ok(response)
    }

    /// Start a command whose first handles are followed by the current
    /// authorization area.
    fn authorized(&self, cc: TpmCc, handles: &[u32]) -> TpmCommand {
        let mut cmd = TpmCommand::with_sessions(cc);
        for &h in handles {
            cmd.add_handle(h);
        }
        cmd.add(&self.auths);
        cmd
    }

    // ==================== Startup / Housekeeping ====================

    pub fn startup(&mut self) -> TpmResult<()> {
        debug!("startup");
        let mut cmd = TpmCommand::new(TpmCc::Startup);
        cmd.add_u16(TpmSu::Clear as u16);
        self.execute(cmd).map(drop)
    }

    pub fn shutdown(&mut self) -> TpmResult<()> {
        debug!("shutdown");
        let mut cmd = TpmCommand::new(TpmCc::Shutdown);
        cmd.add_u16(TpmSu::Clear as u16);
        self.execute(cmd).map(drop)
    }

    /// TPM2_Clear under platform authorization
    pub fn clear(&mut self) -> TpmResult<()> {
        debug!("clear");
        let cmd = self.authorized(TpmCc::Clear, &[tpm_rh::PLATFORM]);
        self.execute(cmd).map(drop)
    }

    pub fn self_test(&mut self) -> TpmResult<()> {
        debug!("self test");
        let mut cmd = TpmCommand::new(TpmCc::SelfTest);
        cmd.add_u8(TPM_YES);
        self.execute(cmd).map(drop)
    }

    pub fn dictionary_attack_lock_reset(&mut self) -> TpmResult<()> {
        debug!("dictionary attack lock reset");
        let cmd = self.authorized(TpmCc::DictionaryAttackLockReset, &[tpm_rh::LOCKOUT]);
        self.execute(cmd).map(drop)
    }

    pub fn hierarchy_change_auth(&mut self, hierarchy: Hierarchy, new_auth: &[u8]) -> TpmResult<()> {
        debug!("hierarchy change auth {:?}", hierarchy);
        check_size("hierarchy auth", new_auth.len(), MAX_DIGEST_SIZE);
        let mut cmd = self.authorized(TpmCc::HierarchyChangeAuth, &[hierarchy.handle()]);
        cmd.add_tpm2b(new_auth);
        self.execute(cmd).map(drop)
    }

    // ==================== PCR Operations ====================

    /// Extend `pcr` in the SHA-256 bank with SHA-256(message)
    pub fn pcr_extend(&mut self, pcr: u32, message: &[u8]) -> TpmResult<()> {
        debug!("extend PCR {pcr}");
        let digest = TpmlDigestValues::single(TpmtHa::sha256(Sha256::digest(message).to_vec()));
        let mut cmd = self.authorized(TpmCc::PCR_Extend, &[pcr]);
        cmd.add(&digest);
        self.execute(cmd).map(drop)
    }

    /// Read PCR values for the given selection
    ///
    /// A TPML_DIGEST carries at most eight values, so larger selections are
    /// read in several rounds. PCRs the TPM does not return (unsupported
    /// bank or index) are left out of the result.
    pub fn pcr_read(&mut self, selection: &TpmlPcrSelection) -> TpmResult<Vec<(u32, Vec<u8>)>> {
        let mut remaining = selection.clone();
        let mut values = Vec::with_capacity(selection.count());

        while !remaining.is_empty() {
            debug!("read {} PCRs", remaining.count());
            let mut cmd = TpmCommand::new(TpmCc::PCR_Read);
            cmd.add(&remaining);

            let response = self.execute(cmd)?;
            let (rest, read) = decode(TpmCc::PCR_Read, || {
                let mut buf = response.parameters()?;
                let _update_counter = buf.get_u32()?;
                let selection_out = TpmlPcrSelection::unmarshal(&mut buf)?;
                let digests = TpmlDigest::unmarshal(&mut buf)?.digests;
                anyhow::ensure!(
                    selection_out.count() == digests.len(),
                    "{} PCRs selected but {} digests returned",
                    selection_out.count(),
                    digests.len()
                );

                let mut rest = remaining.clone();
                rest.remove(&selection_out);
                anyhow::ensure!(
                    rest.count() + digests.len() == remaining.count(),
                    "returned PCRs that were not requested"
                );

                let indices = selection_out.pcr_selections.iter().flat_map(|s| s.pcrs());
                let read: Vec<_> = indices.zip(digests).map(|(i, d)| (i, d.buffer)).collect();
                Ok((rest, read))
            });

            if read.is_empty() {
                break;
            }
            values.extend(read);
            remaining = rest;
        }
        Ok(values)
    }

    // ==================== Random / Capabilities ====================

    /// Generate random bytes using the TPM's RNG
    pub fn get_random(&mut self, num_bytes: usize) -> TpmResult<Vec<u8>> {
        let mut result = Vec::with_capacity(num_bytes);

        // The TPM may return fewer bytes than requested
        while result.len() < num_bytes {
            let request = (num_bytes - result.len()).min(MAX_RANDOM_CHUNK) as u16;
            let mut cmd = TpmCommand::new(TpmCc::GetRandom);
            cmd.add_u16(request);

            let response = self.execute(cmd)?;
            let bytes = decode(TpmCc::GetRandom, || {
                let bytes = response.parameters()?.get_tpm2b()?;
                anyhow::ensure!(!bytes.is_empty(), "no random bytes returned");
                Ok(bytes)
            });
            result.extend_from_slice(&bytes);
        }

        result.truncate(num_bytes);
        Ok(result)
    }

    pub fn get_capability(
        &mut self,
        capability: TpmCap,
        property: u32,
        count: u32,
    ) -> TpmResult<CapabilityOutput> {
        let mut cmd = TpmCommand::new(TpmCc::GetCapability);
        cmd.add_u32(capability as u32);
        cmd.add_u32(property);
        cmd.add_u32(count);

        let response = self.execute(cmd)?;
        Ok(decode(TpmCc::GetCapability, || {
            let mut buf = response.parameters()?;
            let more_data = buf.get_u8()? != 0;
            let data = CapabilityData::unmarshal(&mut buf)?;
            Ok(CapabilityOutput { more_data, data })
        }))
    }

    fn tpm_property(&mut self, property: u32) -> TpmResult<u32> {
        let out = self.get_capability(TpmCap::TpmProperties, property, 1)?;
        Ok(decode(TpmCc::GetCapability, || match out.data {
            CapabilityData::TpmProperties(props) => match props.as_slice() {
                [p] if p.property == property => Ok(p.value),
                _ => anyhow::bail!("expected property 0x{property:x}, got {props:?}"),
            },
            other => anyhow::bail!("unexpected capability data: {other:?}"),
        }))
    }

    /// Library revision and four-character manufacturer ID
    pub fn get_tpm_properties(&mut self) -> TpmResult<TpmProperties> {
        debug!("get TPM properties");
        let spec_version = self.tpm_property(tpm_pt::REVISION)?;
        let manufacturer = self.tpm_property(tpm_pt::MANUFACTURER)?;
        Ok(TpmProperties {
            spec_version,
            manufacturer_id: String::from_utf8_lossy(&manufacturer.to_be_bytes()).into_owned(),
        })
    }

    pub fn test_parms(&mut self, parms: &TpmtPublicParms) -> TpmResult<()> {
        let mut cmd = TpmCommand::new(TpmCc::TestParms);
        cmd.add(&TpmtPublicParmsTagged(parms.clone()));
        self.execute(cmd).map(drop)
    }

    /// Ask whether an HMAC keyed-hash object over `hash_alg` is supported
    pub fn test_hash_param(&mut self, hash_alg: u16) -> TpmResult<()> {
        debug!("test hash param 0x{hash_alg:04x}");
        // Unknown IDs go to the TPM as-is so that it reports them
        let mut cmd = TpmCommand::new(TpmCc::TestParms);
        cmd.add_u16(TpmAlgId::KeyedHash.to_u16());
        cmd.add_u16(TpmAlgId::Hmac.to_u16());
        cmd.add_u16(hash_alg);
        self.execute(cmd).map(drop)
    }

    // ==================== Object Operations ====================

    /// Create a primary object. With `unique_seed`, SHA-256 of the seed goes
    /// into the unique field; without it the field is left empty.
    pub fn create_primary(
        &mut self,
        hierarchy: Hierarchy,
        object_type: ObjectType,
        unique_seed: Option<&[u8]>,
        params: &ObjectParams,
    ) -> TpmResult<CreatePrimaryOutput> {
        debug!(
            "create primary {:?} {:?} restricted={} decrypt={} sign={}",
            hierarchy, object_type, params.restricted, params.decrypt, params.sign
        );
        let mut builder = TemplateBuilder::new(object_type, params);
        if let Some(seed) = unique_seed {
            builder = builder.with_unique_seed(seed);
        }
        let public = builder.build();
        self.create_primary_from_template(hierarchy, &params.sensitive(), &public)
    }

    /// Create the default RSA endorsement key in the endorsement hierarchy
    pub fn create_primary_endorsement_key(&mut self) -> TpmResult<CreatePrimaryOutput> {
        debug!("create primary endorsement key");
        self.create_primary_from_template(
            Hierarchy::Endorsement,
            &Tpm2bSensitiveCreate::empty(),
            &endorsement_key_template(),
        )
    }

    pub fn create_primary_from_template(
        &mut self,
        hierarchy: Hierarchy,
        sensitive: &Tpm2bSensitiveCreate,
        public: &TpmtPublic,
    ) -> TpmResult<CreatePrimaryOutput> {
        let mut cmd = self.authorized(TpmCc::CreatePrimary, &[hierarchy.handle()]);
        cmd.add(sensitive);
        cmd.add(&Tpm2bPublic::from_template(public));
        cmd.add_tpm2b_empty(); // outsideInfo
        cmd.add(&TpmlPcrSelection::default()); // creationPCR

        let response = self.execute(cmd)?;
        let out = decode(TpmCc::CreatePrimary, || {
            let (handle, mut buf) = response.handle_and_parameters()?;
            let out_public = Tpm2bPublic::unmarshal(&mut buf)?.decode()?;
            let creation = CreationData::unmarshal(&mut buf)?;
            let _creation_hash = Tpm2bDigest::unmarshal(&mut buf)?;
            let _ticket = TpmtTkCreation::unmarshal(&mut buf)?;
            let name = buf.get_tpm2b()?;
            Ok(CreatePrimaryOutput {
                handle,
                public_key: PublicKey::from_public(&out_public),
                name,
                parent_name: creation.parent_name,
                parent_qualified_name: creation.parent_qualified_name,
            })
        });

        debug!("created primary object 0x{:08x}", out.handle);
        Ok(out)
    }

    /// Create an ordinary object under `parent`
    pub fn create(
        &mut self,
        parent: u32,
        object_type: ObjectType,
        params: &ObjectParams,
    ) -> TpmResult<CreateOutput> {
        debug!(
            "create under 0x{parent:08x} {:?} restricted={} decrypt={} sign={}",
            object_type, params.restricted, params.decrypt, params.sign
        );
        let public = TemplateBuilder::new(object_type, params).build();

        let mut cmd = self.authorized(TpmCc::Create, &[parent]);
        cmd.add(&params.sensitive());
        cmd.add(&Tpm2bPublic::from_template(&public));
        cmd.add_tpm2b_empty(); // outsideInfo
        cmd.add(&TpmlPcrSelection::default()); // creationPCR

        let response = self.execute(cmd)?;
        Ok(decode(TpmCc::Create, || {
            let mut buf = response.parameters()?;
            let private = buf.get_tpm2b()?;
            let out_public = Tpm2bPublic::unmarshal(&mut buf)?;
            let creation = CreationData::unmarshal(&mut buf)?;
            Ok(CreateOutput {
                private: ObjectBlob::wrap(&private),
                public: ObjectBlob::wrap(&out_public.public_area),
                public_key: PublicKey::from_public(&out_public.decode()?),
                parent_name: creation.parent_name,
                parent_qualified_name: creation.parent_qualified_name,
            })
        }))
    }

    /// Load blobs returned by `create` or `import`
    pub fn load(
        &mut self,
        parent: u32,
        private: &ObjectBlob,
        public: &ObjectBlob,
    ) -> TpmResult<LoadOutput> {
        debug!("load under 0x{parent:08x}");
        let mut cmd = self.authorized(TpmCc::Load, &[parent]);
        cmd.add_bytes(private.as_bytes());
        cmd.add_bytes(public.as_bytes());

        let response = self.execute(cmd)?;
        let out = decode(TpmCc::Load, || {
            let (handle, mut buf) = response.handle_and_parameters()?;
            Ok(LoadOutput {
                handle,
                name: buf.get_tpm2b()?,
            })
        });

        debug!("loaded object 0x{:08x}", out.handle);
        Ok(out)
    }

    pub fn read_public(&mut self, handle: u32) -> TpmResult<ReadPublicOutput> {
        let mut cmd = TpmCommand::new(TpmCc::ReadPublic);
        cmd.add_handle(handle);

        let response = self.execute(cmd)?;
        Ok(decode(TpmCc::ReadPublic, || {
            let mut buf = response.parameters()?;
            Ok(ReadPublicOutput {
                public: Tpm2bPublic::unmarshal(&mut buf)?.decode()?,
                name: buf.get_tpm2b()?,
                qualified_name: buf.get_tpm2b()?,
            })
        }))
    }

    /// Flush a transient object or session
    pub fn flush_context(&mut self, handle: u32) -> TpmResult<()> {
        debug!("flush 0x{handle:08x}");
        let mut cmd = TpmCommand::new(TpmCc::FlushContext);
        cmd.add_handle(handle);
        self.execute(cmd).map(drop)
    }

    /// Make a transient object persistent at `persistent`, or evict a
    /// persistent object when `object == persistent`.
    pub fn evict_control(&mut self, auth: u32, object: u32, persistent: u32) -> TpmResult<()> {
        debug!("evict control 0x{object:08x} -> 0x{persistent:08x}");
        let mut cmd = self.authorized(TpmCc::EvictControl, &[auth, object]);
        cmd.add_handle(persistent);
        self.execute(cmd).map(drop)
    }

    /// Import a duplicated object under `parent`. The duplicate sent to the
    /// TPM is `TPM2B(integrity_hmac) || encrypted_private`.
    pub fn import(
        &mut self,
        parent: u32,
        public_area: &[u8],
        integrity_hmac: &[u8],
        encrypted_private: &[u8],
        encrypted_seed: &[u8],
    ) -> TpmResult<ImportOutput> {
        debug!("import under 0x{parent:08x}");
        let public = decode(TpmCc::Import, || {
            let mut buf = ResponseBuffer::new(public_area);
            let public = TpmtPublic::unmarshal(&mut buf)?;
            buf.finish()?;
            Ok(public)
        });
        check_size("integrity HMAC", integrity_hmac.len(), MAX_DIGEST_SIZE);
        check_size("encrypted seed", encrypted_seed.len(), MAX_RSA_KEY_BYTES);

        let mut duplicate = CommandBuffer::new();
        duplicate.put_tpm2b(integrity_hmac);
        duplicate.put_bytes(encrypted_private);
        let public = Tpm2bPublic::from_template(&public);

        let mut cmd = self.authorized(TpmCc::Import, &[parent]);
        cmd.add_tpm2b_empty(); // encryptionKey
        cmd.add(&public);
        cmd.add_tpm2b(duplicate.as_bytes());
        cmd.add_tpm2b(encrypted_seed);
        cmd.add(&TpmtSymDef::null());

        let response = self.execute(cmd)?;
        let private = decode(TpmCc::Import, || response.parameters()?.get_tpm2b());
        Ok(ImportOutput {
            private: ObjectBlob::wrap(&private),
            public: ObjectBlob::wrap(&public.public_area),
        })
    }

    // ==================== Signing / Encryption ====================

    /// Sign SHA-256(message) with the key's scheme for its family
    pub fn sign(
        &mut self,
        key: u32,
        object_type: ObjectType,
        message: &[u8],
    ) -> TpmResult<TpmtSignature> {
        debug!("sign with 0x{key:08x}");
        let scheme = match object_type {
            ObjectType::Rsa => TpmtScheme::rsassa(TpmAlgId::Sha256),
            ObjectType::Ecc => TpmtScheme::ecdsa(TpmAlgId::Sha256),
            other => panic!("cannot sign with a {other:?} object"),
        };

        let mut cmd = self.authorized(TpmCc::Sign, &[key]);
        cmd.add_tpm2b(&Sha256::digest(message));
        cmd.add(&scheme);
        cmd.add(&TpmtTicket::null(TpmSt::HashCheck));

        let response = self.execute(cmd)?;
        Ok(decode(TpmCc::Sign, || {
            TpmtSignature::unmarshal(&mut response.parameters()?)
        }))
    }

    /// Check `signature` over SHA-256(message)
    pub fn verify_signature(
        &mut self,
        key: u32,
        message: &[u8],
        signature: &TpmtSignature,
    ) -> TpmResult<TpmtTkVerified> {
        debug!("verify signature with 0x{key:08x}");
        let mut cmd = TpmCommand::new(TpmCc::VerifySignature);
        cmd.add_handle(key);
        cmd.add_tpm2b(&Sha256::digest(message));
        cmd.add(signature);

        let response = self.execute(cmd)?;
        Ok(decode(TpmCc::VerifySignature, || {
            TpmtTkVerified::unmarshal(&mut response.parameters()?)
        }))
    }

    pub fn encrypt(&mut self, key: u32, message: &[u8]) -> TpmResult<Vec<u8>> {
        self.encrypt_decrypt(key, false, message)
    }

    pub fn decrypt(&mut self, key: u32, message: &[u8]) -> TpmResult<Vec<u8>> {
        self.encrypt_decrypt(key, true, message)
    }

    /// Symmetric encryption with the key's own mode and a zero IV
    fn encrypt_decrypt(&mut self, key: u32, decrypt: bool, data: &[u8]) -> TpmResult<Vec<u8>> {
        debug!("encrypt/decrypt with 0x{key:08x} decrypt={decrypt}");
        check_size("symmetric input", data.len(), MAX_DIGEST_BUFFER);

        let mut cmd = self.authorized(TpmCc::EncryptDecrypt, &[key]);
        cmd.add_u8(if decrypt { TPM_YES } else { TPM_NO });
        cmd.add_u16(TpmAlgId::Null.to_u16()); // mode from the key
        cmd.add_tpm2b(&[0u8; 16]); // ivIn
        cmd.add_tpm2b(data);

        let response = self.execute(cmd)?;
        Ok(decode(TpmCc::EncryptDecrypt, || {
            let mut buf = response.parameters()?;
            let out = buf.get_tpm2b()?;
            let _iv_out = buf.get_tpm2b()?;
            Ok(out)
        }))
    }

    /// RSAES-PKCS1-v1_5 encryption with the public part of `key`
    pub fn rsa_encrypt(&mut self, key: u32, message: &[u8]) -> TpmResult<Vec<u8>> {
        debug!("RSA encrypt with 0x{key:08x}");
        check_size("RSA plaintext", message.len(), MAX_RSA_KEY_BYTES);
        let mut cmd = TpmCommand::new(TpmCc::RSA_Encrypt);
        cmd.add_handle(key);
        cmd.add_tpm2b(message);
        cmd.add(&TpmtScheme::rsaes());
        cmd.add_tpm2b_empty(); // label

        let response = self.execute(cmd)?;
        Ok(decode(TpmCc::RSA_Encrypt, || response.parameters()?.get_tpm2b()))
    }

    pub fn rsa_decrypt(&mut self, key: u32, ciphertext: &[u8]) -> TpmResult<Vec<u8>> {
        debug!("RSA decrypt with 0x{key:08x}");
        check_size("RSA ciphertext", ciphertext.len(), MAX_RSA_KEY_BYTES);
        let mut cmd = self.authorized(TpmCc::RSA_Decrypt, &[key]);
        cmd.add_tpm2b(ciphertext);
        cmd.add(&TpmtScheme::rsaes());
        cmd.add_tpm2b_empty(); // label

        let response = self.execute(cmd)?;
        Ok(decode(TpmCc::RSA_Decrypt, || response.parameters()?.get_tpm2b()))
    }

    pub fn unseal(&mut self, handle: u32) -> TpmResult<Vec<u8>> {
        debug!("unseal 0x{handle:08x}");
        let cmd = self.authorized(TpmCc::Unseal, &[handle]);
        let response = self.execute(cmd)?;
        Ok(decode(TpmCc::Unseal, || response.parameters()?.get_tpm2b()))
    }

    // ==================== Attestation ====================

    /// Quote the configured PCRs with `key`, binding `nonce`
    pub fn quote(&mut self, key: u32, nonce: &[u8]) -> TpmResult<QuoteOutput> {
        debug!("quote with 0x{key:08x}");
        check_size("qualifying data", nonce.len(), MAX_DATA_SIZE);
        let pcrs = self.config.quote_pcrs.to_tpml();

        let mut cmd = self.authorized(TpmCc::Quote, &[key]);
        cmd.add_tpm2b(nonce);
        cmd.add(&TpmtScheme::null()); // key's own scheme
        cmd.add(&pcrs);

        let response = self.execute(cmd)?;
        Ok(decode(TpmCc::Quote, || {
            let mut buf = response.parameters()?;
            Ok(QuoteOutput {
                attest: buf.get_tpm2b()?,
                signature: TpmtSignature::unmarshal(&mut buf)?,
            })
        }))
    }

    // ==================== NV Operations ====================

    /// Define a platform-owned index readable by owner and platform
    pub fn nv_define_space(&mut self, index: u32, size: u16) -> TpmResult<()> {
        debug!("define NV index 0x{index:08x} size {size}");
        let nv_public = TpmsNvPublic::new(index, size, TpmaNv::platform_certificate());

        let mut cmd = self.authorized(TpmCc::NV_DefineSpace, &[tpm_rh::PLATFORM]);
        cmd.add_tpm2b_empty(); // auth
        cmd.add(&Tpm2bNvPublic { nv_public });
        self.execute(cmd).map(drop)
    }

    /// Write `data` at offset 0
    pub fn nv_write(&mut self, index: u32, data: &[u8]) -> TpmResult<()> {
        debug!("write {} bytes to NV index 0x{index:08x}", data.len());
        check_size("NV data", data.len(), MAX_NV_BUFFER_SIZE);

        let mut cmd = self.authorized(TpmCc::NV_Write, &[tpm_rh::PLATFORM, index]);
        cmd.add_tpm2b(data);
        cmd.add_u16(0); // offset
        self.execute(cmd).map(drop)
    }

    pub fn nv_read_public(&mut self, index: u32) -> TpmResult<NvReadPublicOutput> {
        let mut cmd = TpmCommand::new(TpmCc::NV_ReadPublic);
        cmd.add_handle(index);

        let response = self.execute(cmd)?;
        Ok(decode(TpmCc::NV_ReadPublic, || {
            let mut buf = response.parameters()?;
            let nv_public = Tpm2bNvPublic::unmarshal(&mut buf)?.nv_public;
            Ok(NvReadPublicOutput {
                index: nv_public.nv_index,
                attributes: nv_public.attributes.0,
                data_size: nv_public.data_size,
                name: buf.get_tpm2b()?,
            })
        }))
    }

    pub fn nv_read(&mut self, index: u32, size: u16, offset: u16) -> TpmResult<Vec<u8>> {
        debug!("read {size} bytes at {offset} from NV index 0x{index:08x}");
        let mut cmd = self.authorized(TpmCc::NV_Read, &[tpm_rh::PLATFORM, index]);
        cmd.add_u16(size);
        cmd.add_u16(offset);

        let response = self.execute(cmd)?;
        Ok(decode(TpmCc::NV_Read, || response.parameters()?.get_tpm2b()))
    }
}
