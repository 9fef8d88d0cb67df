// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Keyed-hash objects built outside the TPM
//!
//! The encoded private and public parts are what a duplication flow wraps
//! before handing them to [`App::import`](crate::App::import).

use rand::RngCore;
use sha2::{Digest, Sha256};

use super::constants::*;
use super::marshal::*;
use super::types::*;

/// A sealed-data keyed-hash object with a random seed
#[derive(Debug, Clone)]
pub struct ExternalKeyedHash {
    seed: [u8; SHA256_DIGEST_SIZE],
    sensitive_data: Vec<u8>,
    public: TpmtPublic,
}

impl ExternalKeyedHash {
    /// # Panics
    ///
    /// Panics if `sensitive_data` exceeds TPM2B_SENSITIVE_DATA.
    #[track_caller]
    pub fn new(sensitive_data: &[u8]) -> Self {
        let mut seed = [0u8; SHA256_DIGEST_SIZE];
        rand::thread_rng().fill_bytes(&mut seed);
        Self::with_seed(seed, sensitive_data)
    }

    #[track_caller]
    pub fn with_seed(seed: [u8; SHA256_DIGEST_SIZE], sensitive_data: &[u8]) -> Self {
        check_size("sensitive data", sensitive_data.len(), MAX_SYM_DATA);

        // unique binds the public part to the seed and the sealed bits
        let unique = Sha256::new()
            .chain_update(seed)
            .chain_update(sensitive_data)
            .finalize()
            .to_vec();

        let public = TpmtPublic {
            type_alg: TpmAlgId::KeyedHash,
            name_alg: TpmAlgId::Sha256,
            object_attributes: TpmaObject::new().with_user_with_auth(),
            auth_policy: Tpm2bDigest::empty(),
            parameters: TpmtPublicParms::KeyedHash(TpmsKeyedHashParms {
                scheme: KeyedHashScheme::Null,
            }),
            unique: TpmtPublicUnique::KeyedHash(unique),
        };

        Self {
            seed,
            sensitive_data: sensitive_data.to_vec(),
            public,
        }
    }

    pub fn public(&self) -> &TpmtPublic {
        &self.public
    }

    /// TPM2B_SENSITIVE
    pub fn encoded_private(&self) -> Vec<u8> {
        let mut buf = CommandBuffer::new();
        buf.put_sized(|inner| {
            inner.put_u16(TpmAlgId::KeyedHash.to_u16());
            inner.put_tpm2b_empty(); // authValue
            inner.put_tpm2b(&self.seed);
            inner.put_tpm2b(&self.sensitive_data);
        });
        buf.into_vec()
    }

    /// TPMT_PUBLIC
    pub fn encoded_public(&self) -> Vec<u8> {
        self.public.to_bytes()
    }

    /// The object name as a TPMT_HA: SHA-256 over the public area
    pub fn encoded_name(&self) -> Vec<u8> {
        TpmtHa::sha256(Sha256::digest(self.encoded_public()).to_vec()).to_bytes()
    }
}
