// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Response codes surfaced to callers
//!
//! A non-zero `TPM_RC` is passed through verbatim as [`ResponseCode`]. The
//! transport adapter reports its own failures with TCTI-layer codes in the
//! same type.

use serde::{Deserialize, Serialize};

/// A TPM or TCTI response code other than success.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, thiserror::Error,
)]
#[error("TPM error: 0x{0:08x}")]
pub struct ResponseCode(pub u32);

/// Result of a TPM operation
pub type TpmResult<T> = std::result::Result<T, ResponseCode>;

const RC_FMT1: u32 = 0x080;
const RC_VER1: u32 = 0x100;
const TCTI_LAYER: u32 = 10 << 16;

impl ResponseCode {
    pub const SUCCESS: Self = Self(0);

    // Format-zero codes
    pub const INITIALIZE: Self = Self(RC_VER1);
    pub const FAILURE: Self = Self(RC_VER1 + 0x001);
    pub const AUTH_MISSING: Self = Self(RC_VER1 + 0x025);
    pub const AUTH_UNAVAILABLE: Self = Self(RC_VER1 + 0x02F);
    pub const NV_RANGE: Self = Self(RC_VER1 + 0x046);
    pub const NV_LOCKED: Self = Self(RC_VER1 + 0x048);
    pub const NV_UNINITIALIZED: Self = Self(RC_VER1 + 0x04A);
    pub const NV_SPACE: Self = Self(RC_VER1 + 0x04B);
    pub const NV_DEFINED: Self = Self(RC_VER1 + 0x04C);
    pub const OBJECT_MEMORY: Self = Self(RC_VER1 + 0x002);
    pub const COMMAND_CODE: Self = Self(RC_VER1 + 0x043);

    // Format-one codes, without parameter/handle/session numbers
    pub const ATTRIBUTES: Self = Self(RC_FMT1 + 0x002);
    pub const HASH: Self = Self(RC_FMT1 + 0x003);
    pub const VALUE: Self = Self(RC_FMT1 + 0x004);
    pub const HIERARCHY: Self = Self(RC_FMT1 + 0x005);
    pub const KEY_SIZE: Self = Self(RC_FMT1 + 0x007);
    pub const TYPE: Self = Self(RC_FMT1 + 0x00A);
    pub const HANDLE: Self = Self(RC_FMT1 + 0x00B);
    pub const AUTH_FAIL: Self = Self(RC_FMT1 + 0x00E);
    pub const SCHEME: Self = Self(RC_FMT1 + 0x012);
    pub const SIZE: Self = Self(RC_FMT1 + 0x015);
    pub const SIGNATURE: Self = Self(RC_FMT1 + 0x01B);
    pub const KEY: Self = Self(RC_FMT1 + 0x01C);
    pub const POLICY_FAIL: Self = Self(RC_FMT1 + 0x01D);
    pub const INTEGRITY: Self = Self(RC_FMT1 + 0x01F);
    pub const TICKET: Self = Self(RC_FMT1 + 0x020);
    pub const BAD_AUTH: Self = Self(RC_FMT1 + 0x022);
    pub const BINDING: Self = Self(RC_FMT1 + 0x025);

    // Format-one number fields
    pub const PARAMETER: u32 = 0x040;
    pub const SESSION: u32 = 0x800;
    pub const N_1: u32 = 0x100;
    pub const N_2: u32 = 0x200;

    // TCTI layer
    pub const TCTI_INSUFFICIENT_BUFFER: Self = Self(TCTI_LAYER | 6);
    pub const TCTI_BAD_SEQUENCE: Self = Self(TCTI_LAYER | 7);
    pub const TCTI_IO_ERROR: Self = Self(TCTI_LAYER | 10);

    pub fn is_success(self) -> bool {
        self.0 == 0
    }

    pub fn is_format_one(self) -> bool {
        self.0 & RC_FMT1 != 0
    }

    /// Strip the handle, parameter or session number from a format-one code.
    pub fn base(self) -> Self {
        if self.is_format_one() {
            Self(self.0 & 0xBF)
        } else {
            self
        }
    }

    /// Combine a format-one base code with a parameter number.
    pub fn with_parameter(self, n: u32) -> Self {
        Self(self.0 | Self::PARAMETER | (n << 8))
    }

    /// Combine a format-one base code with a session number.
    pub fn with_session(self, n: u32) -> Self {
        Self(self.0 | Self::SESSION | (n << 8))
    }

    /// Combine a format-one base code with a handle number.
    pub fn with_handle(self, n: u32) -> Self {
        Self(self.0 | (n << 8))
    }

    pub fn is_tcti(self) -> bool {
        self.0 & 0xFF_0000 == TCTI_LAYER
    }
}

impl From<ResponseCode> for u32 {
    fn from(rc: ResponseCode) -> Self {
        rc.0
    }
}
