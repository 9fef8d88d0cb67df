// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Public-area templates for created objects
//!
//! A template is decided by the object family and three capability flags
//! (`restricted`, `decrypt`, `sign`). The rules below are applied in one
//! place so that `create_primary` and `create` build identical areas for
//! identical inputs.

use serde::{Deserialize, Serialize};
use serde_human_bytes as hex_bytes;
use sha2::{Digest, Sha256};

use super::constants::*;
use super::marshal::check_size;
use super::types::*;

/// Algorithm family of a created object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    Rsa,
    Ecc,
    SymCipher,
    KeyedHash,
}

impl ObjectType {
    pub fn alg_id(self) -> TpmAlgId {
        match self {
            ObjectType::Rsa => TpmAlgId::Rsa,
            ObjectType::Ecc => TpmAlgId::Ecc,
            ObjectType::SymCipher => TpmAlgId::SymCipher,
            ObjectType::KeyedHash => TpmAlgId::KeyedHash,
        }
    }

    pub fn from_alg_id(alg: u16) -> Option<Self> {
        match TpmAlgId::from_u16(alg)? {
            TpmAlgId::Rsa => Some(ObjectType::Rsa),
            TpmAlgId::Ecc => Some(ObjectType::Ecc),
            TpmAlgId::SymCipher => Some(ObjectType::SymCipher),
            TpmAlgId::KeyedHash => Some(ObjectType::KeyedHash),
            _ => None,
        }
    }

    /// Convert a raw TPM_ALG_ID supplied by a binding layer.
    ///
    /// # Panics
    ///
    /// Panics if `alg` is not one of the four object families.
    #[track_caller]
    pub fn from_raw(alg: u16) -> Self {
        match Self::from_alg_id(alg) {
            Some(t) => t,
            None => panic!("invalid object type 0x{alg:04x}"),
        }
    }
}

/// Caller-chosen properties of a new object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectParams {
    pub restricted: bool,
    pub decrypt: bool,
    pub sign: bool,
    /// Authorization value for the new object
    #[serde(with = "hex_bytes")]
    pub user_auth: Vec<u8>,
    /// Data to seal; only meaningful for keyed-hash objects
    #[serde(with = "hex_bytes")]
    pub sensitive_data: Vec<u8>,
    /// Policy digest; when set the object no longer accepts its auth value
    /// directly
    #[serde(with = "hex_bytes")]
    pub auth_policy: Vec<u8>,
}

impl ObjectParams {
    /// TPM2B_SENSITIVE_CREATE for these parameters
    #[track_caller]
    pub fn sensitive(&self) -> Tpm2bSensitiveCreate {
        Tpm2bSensitiveCreate::new(&self.user_auth, &self.sensitive_data)
    }
}

pub struct TemplateBuilder<'a> {
    object_type: ObjectType,
    params: &'a ObjectParams,
    unique: Vec<u8>,
}

impl<'a> TemplateBuilder<'a> {
    pub fn new(object_type: ObjectType, params: &'a ObjectParams) -> Self {
        Self {
            object_type,
            params,
            unique: Vec::new(),
        }
    }

    /// Place SHA-256(seed) in the unique field, so that different seeds
    /// derive different primary objects from the same hierarchy seed.
    pub fn with_unique_seed(mut self, seed: &[u8]) -> Self {
        self.unique = Sha256::digest(seed).to_vec();
        self
    }

    /// # Panics
    ///
    /// Panics if the policy digest is longer than a SHA-256 digest.
    #[track_caller]
    pub fn build(&self) -> TpmtPublic {
        let p = self.params;
        check_size("auth policy", p.auth_policy.len(), SHA256_DIGEST_SIZE);

        let sealing =
            self.object_type == ObjectType::KeyedHash && !p.sensitive_data.is_empty();
        let (restricted, decrypt, sign) = if sealing {
            (false, false, false)
        } else {
            (p.restricted, p.decrypt, p.sign)
        };

        let object_attributes = TpmaObject::new()
            .with_fixed_tpm()
            .with_fixed_parent()
            .with(TpmaObject::SENSITIVE_DATA_ORIGIN, !sealing)
            .with(TpmaObject::USER_WITH_AUTH, p.auth_policy.is_empty())
            .with(TpmaObject::RESTRICTED, restricted)
            .with(TpmaObject::DECRYPT, decrypt)
            .with(TpmaObject::SIGN_ENCRYPT, sign);

        let (parameters, unique) = match self.object_type {
            ObjectType::Rsa => (
                TpmtPublicParms::Rsa(TpmsRsaParms {
                    symmetric: object_symmetric(sign),
                    scheme: if sign && !decrypt {
                        TpmtScheme::rsassa(TpmAlgId::Sha256)
                    } else {
                        TpmtScheme::null()
                    },
                    key_bits: RsaKeyBits::Rsa2048.to_u16(),
                    exponent: 0,
                }),
                TpmtPublicUnique::Rsa(self.unique.clone()),
            ),
            ObjectType::Ecc => (
                TpmtPublicParms::Ecc(TpmsEccParms {
                    symmetric: object_symmetric(sign),
                    scheme: if sign {
                        TpmtScheme::ecdsa(TpmAlgId::Sha256)
                    } else {
                        TpmtScheme::null()
                    },
                    curve_id: TpmEccCurve::NistP256,
                    kdf: TpmtScheme::null(),
                }),
                TpmtPublicUnique::Ecc(self.unique.clone(), Vec::new()),
            ),
            ObjectType::SymCipher => (
                TpmtPublicParms::SymCipher(TpmsSymCipherParms {
                    sym: TpmtSymDef::aes_128_cfb(),
                }),
                TpmtPublicUnique::SymCipher(self.unique.clone()),
            ),
            ObjectType::KeyedHash => (
                TpmtPublicParms::KeyedHash(TpmsKeyedHashParms {
                    scheme: if sign {
                        KeyedHashScheme::Xor {
                            hash_alg: TpmAlgId::Sha256,
                            kdf: TpmAlgId::Kdf1Sp800_108,
                        }
                    } else {
                        KeyedHashScheme::Null
                    },
                }),
                TpmtPublicUnique::KeyedHash(self.unique.clone()),
            ),
        };

        TpmtPublic {
            type_alg: self.object_type.alg_id(),
            name_alg: TpmAlgId::Sha256,
            object_attributes,
            auth_policy: Tpm2bDigest::new(p.auth_policy.clone()),
            parameters,
            unique,
        }
    }
}

/// Asymmetric keys used for signing carry no symmetric protection
fn object_symmetric(sign: bool) -> TpmtSymDefObject {
    if sign {
        TpmtSymDef::null()
    } else {
        TpmtSymDef::aes_128_cfb()
    }
}

/// PolicySecret(TPM_RH_ENDORSEMENT) from the TCG EK Credential Profile
pub const EK_AUTH_POLICY: [u8; 32] = [
    0x83, 0x71, 0x97, 0x67, 0x44, 0x84, 0xB3, 0xF8, 0x1A, 0x90, 0xCC, 0x8D, 0x46, 0xA5, 0xD7, 0x24,
    0xFD, 0x52, 0xD7, 0x6E, 0x06, 0x52, 0x0B, 0x64, 0xF2, 0xA1, 0xDA, 0x1B, 0x33, 0x14, 0x69, 0xAA,
];

/// Default RSA 2048 endorsement key template (TCG EK Credential Profile,
/// template L-1).
pub fn endorsement_key_template() -> TpmtPublic {
    TpmtPublic {
        type_alg: TpmAlgId::Rsa,
        name_alg: TpmAlgId::Sha256,
        object_attributes: TpmaObject::new()
            .with_fixed_tpm()
            .with_fixed_parent()
            .with_sensitive_data_origin()
            .with_admin_with_policy()
            .with_restricted()
            .with_decrypt(),
        auth_policy: Tpm2bDigest::new(EK_AUTH_POLICY.to_vec()),
        parameters: TpmtPublicParms::Rsa(TpmsRsaParms {
            symmetric: TpmtSymDef::aes_128_cfb(),
            scheme: TpmtScheme::null(),
            key_bits: RsaKeyBits::Rsa2048.to_u16(),
            exponent: 0,
        }),
        unique: TpmtPublicUnique::Rsa(vec![0; MAX_RSA_KEY_BYTES]),
    }
}
