// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! KDFa (SP800-108 counter mode with HMAC), as used by TPM 2.0 for
//! session keys and object protection keys.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::constants::TpmAlgId;

type HmacSha256 = Hmac<Sha256>;

/// Derive `ceil(bits / 8)` bytes from `key`.
///
/// Each block is `HMAC(key, BE32(i) || label || 0x00 || context_u ||
/// context_v || BE32(L))` for `i = 1, 2, ...`, where `L` is the output size
/// in bits rounded up to whole bytes.
///
/// # Panics
///
/// Panics unless `hash_alg` is SHA-256 and both `key` and `label` are
/// non-empty, or if `bits` rounded up to whole bytes does not fit in a `u32`.
pub fn kdfa(
    hash_alg: TpmAlgId,
    key: &[u8],
    label: &str,
    context_u: &[u8],
    context_v: &[u8],
    bits: u32,
) -> Vec<u8> {
    assert_eq!(hash_alg, TpmAlgId::Sha256, "KDFa supports SHA-256 only");
    assert!(!key.is_empty(), "KDFa key must not be empty");
    assert!(!label.is_empty(), "KDFa label must not be empty");

    let out_bits = bits
        .checked_next_multiple_of(8)
        .unwrap_or_else(|| panic!("KDFa output of {bits} bits overflows the 32-bit length field"));
    let out_len = (out_bits / 8) as usize;
    let mut out = Vec::with_capacity(out_len + 32);

    let mut counter: u32 = 1;
    while out.len() < out_len {
        let mut mac = HmacSha256::new_from_slice(key)
            .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
        mac.update(&counter.to_be_bytes());
        mac.update(label.as_bytes());
        mac.update(&[0]);
        mac.update(context_u);
        mac.update(context_v);
        mac.update(&out_bits.to_be_bytes());
        out.extend_from_slice(&mac.finalize().into_bytes());
        counter += 1;
    }

    out.truncate(out_len);
    out
}
