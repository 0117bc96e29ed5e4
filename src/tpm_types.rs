/*
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the MIT License. See the LICENSE file in the project root for full license information.
 */

//! TPM 2.0 constants and structures used by the command layer

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

use derivative::Derivative;

use crate::crypto::Crypto;
use crate::error::{DecodeError, TpmError};
use crate::tpm2_helpers::enum_to_str;
use crate::tpm_buffer::{TpmBuffer, TpmMarshaller};
use crate::tpm_structure::{TpmEnum, TpmStructure};

/// Upper bound accepted for the element count of any TPML list
pub const MAX_LIST_ITEMS: usize = 1024;

macro_rules! tpm_enum {
    (
        $(#[$meta:meta])*
        $name:ident : $repr:ty {
            $( $(#[$vmeta:meta])* $variant:ident = $value:literal ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub $repr);

        impl $name {
            $( $(#[$vmeta])* pub const $variant: $name = $name($value); )*
        }

        impl TpmEnum<$repr> for $name {
            fn get_value(&self) -> $repr {
                self.0
            }

            fn value_names() -> &'static [(u64, &'static str)] {
                &[ $( ($value as u64, stringify!($variant)) ),* ]
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(&enum_to_str(self.0 as u64, Self::value_names(), false))
            }
        }

        impl From<$repr> for $name {
            fn from(value: $repr) -> Self {
                $name(value)
            }
        }

        impl TpmMarshaller for $name {
            fn toTpm(&self, buf: &mut TpmBuffer) -> Result<(), TpmError> {
                self.0.toTpm(buf)
            }

            fn initFromTpm(&mut self, buf: &mut TpmBuffer) -> Result<(), TpmError> {
                self.0.initFromTpm(buf)
            }
        }
    };
}

macro_rules! tpm_flags {
    (
        $(#[$meta:meta])*
        $name:ident : $repr:ty {
            $( $(#[$vmeta:meta])* $variant:ident = $value:literal ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name(pub $repr);

        impl $name {
            $( $(#[$vmeta])* pub const $variant: $name = $name($value); )*

            pub fn contains(&self, other: $name) -> bool {
                (self.0 & other.0) == other.0
            }

            pub fn remove(&mut self, other: $name) {
                self.0 &= !other.0;
            }
        }

        impl TpmEnum<$repr> for $name {
            fn get_value(&self) -> $repr {
                self.0
            }

            fn value_names() -> &'static [(u64, &'static str)] {
                &[ $( ($value as u64, stringify!($variant)) ),* ]
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(&enum_to_str(self.0 as u64, Self::value_names(), true))
            }
        }

        impl BitOr for $name {
            type Output = $name;

            fn bitor(self, rhs: $name) -> $name {
                $name(self.0 | rhs.0)
            }
        }

        impl BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: $name) {
                self.0 |= rhs.0;
            }
        }

        impl BitAnd for $name {
            type Output = $name;

            fn bitand(self, rhs: $name) -> $name {
                $name(self.0 & rhs.0)
            }
        }

        impl TpmMarshaller for $name {
            fn toTpm(&self, buf: &mut TpmBuffer) -> Result<(), TpmError> {
                self.0.toTpm(buf)
            }

            fn initFromTpm(&mut self, buf: &mut TpmBuffer) -> Result<(), TpmError> {
                self.0.initFromTpm(buf)
            }
        }
    };
}

tpm_enum! {
    /// Algorithm identifiers
    TPM_ALG_ID: u16 {
        ERROR = 0x0000,
        RSA = 0x0001,
        TDES = 0x0003,
        SHA1 = 0x0004,
        HMAC = 0x0005,
        AES = 0x0006,
        MGF1 = 0x0007,
        KEYEDHASH = 0x0008,
        XOR = 0x000A,
        SHA256 = 0x000B,
        SHA384 = 0x000C,
        SHA512 = 0x000D,
        NULL = 0x0010,
        SM3_256 = 0x0012,
        SM4 = 0x0013,
        RSASSA = 0x0014,
        RSAES = 0x0015,
        RSAPSS = 0x0016,
        OAEP = 0x0017,
        ECDSA = 0x0018,
        ECDH = 0x0019,
        ECDAA = 0x001A,
        SM2 = 0x001B,
        ECSCHNORR = 0x001C,
        ECMQV = 0x001D,
        KDF1_SP800_56A = 0x0020,
        KDF2 = 0x0021,
        KDF1_SP800_108 = 0x0022,
        ECC = 0x0023,
        SYMCIPHER = 0x0025,
        CAMELLIA = 0x0026,
        CTR = 0x0040,
        OFB = 0x0041,
        CBC = 0x0042,
        CFB = 0x0043,
        ECB = 0x0044,
    }
}

tpm_enum! {
    /// Structure tags
    TPM_ST: u16 {
        RSP_COMMAND = 0x00C4,
        NULL = 0x8000,
        NO_SESSIONS = 0x8001,
        SESSIONS = 0x8002,
        ATTEST_NV = 0x8014,
        ATTEST_QUOTE = 0x8018,
        ATTEST_CREATION = 0x801A,
        CREATION = 0x8021,
        VERIFIED = 0x8022,
        AUTH_SECRET = 0x8023,
        HASHCHECK = 0x8024,
        AUTH_SIGNED = 0x8025,
    }
}

tpm_enum! {
    /// Command codes
    TPM_CC: u32 {
        NV_UndefineSpace = 0x0122,
        NV_DefineSpace = 0x012A,
        CreatePrimary = 0x0131,
        NV_Increment = 0x0134,
        NV_Write = 0x0137,
        PCR_Reset = 0x013D,
        SequenceComplete = 0x013E,
        Startup = 0x0144,
        Shutdown = 0x0145,
        StirRandom = 0x0146,
        NV_Read = 0x014E,
        SequenceUpdate = 0x015C,
        ContextLoad = 0x0161,
        ContextSave = 0x0162,
        FlushContext = 0x0165,
        NV_ReadPublic = 0x0169,
        PolicyAuthValue = 0x016B,
        PolicyCommandCode = 0x016C,
        PolicyLocality = 0x016F,
        ReadPublic = 0x0173,
        StartAuthSession = 0x0176,
        GetCapability = 0x017A,
        GetRandom = 0x017B,
        Hash = 0x017D,
        PCR_Read = 0x017E,
        PolicyRestart = 0x0180,
        PCR_Extend = 0x0182,
        HashSequenceStart = 0x0186,
        PolicyGetDigest = 0x0189,
        PolicyPassword = 0x018C,
    }
}

impl fmt::Display for TPM_CC {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TPM2_{:?}", self)
    }
}

tpm_enum! {
    /// Response codes. Format-one codes are listed without their parameter, handle or session number.
    TPM_RC: u32 {
        SUCCESS = 0x000,
        BAD_TAG = 0x01E,
        INITIALIZE = 0x100,
        FAILURE = 0x101,
        SEQUENCE = 0x103,
        DISABLED = 0x120,
        EXCLUSIVE = 0x121,
        AUTH_TYPE = 0x124,
        AUTH_MISSING = 0x125,
        POLICY = 0x126,
        PCR = 0x127,
        PCR_CHANGED = 0x128,
        UPGRADE = 0x12D,
        TOO_MANY_CONTEXTS = 0x12E,
        AUTH_UNAVAILABLE = 0x12F,
        REBOOT = 0x130,
        UNBALANCED = 0x131,
        COMMAND_SIZE = 0x142,
        COMMAND_CODE = 0x143,
        AUTHSIZE = 0x144,
        AUTH_CONTEXT = 0x145,
        NV_RANGE = 0x146,
        NV_SIZE = 0x147,
        NV_LOCKED = 0x148,
        NV_AUTHORIZATION = 0x149,
        NV_UNINITIALIZED = 0x14A,
        NV_SPACE = 0x14B,
        NV_DEFINED = 0x14C,
        BAD_CONTEXT = 0x150,
        CPHASH = 0x151,
        PARENT = 0x152,
        NEEDS_TEST = 0x153,
        NO_RESULT = 0x154,
        SENSITIVE = 0x155,
        ASYMMETRIC = 0x081,
        ATTRIBUTES = 0x082,
        HASH = 0x083,
        VALUE = 0x084,
        HIERARCHY = 0x085,
        KEY_SIZE = 0x087,
        MGF = 0x088,
        MODE = 0x089,
        TYPE = 0x08A,
        HANDLE = 0x08B,
        KDF = 0x08C,
        RANGE = 0x08D,
        AUTH_FAIL = 0x08E,
        NONCE = 0x08F,
        PP = 0x090,
        SCHEME = 0x092,
        SIZE = 0x095,
        SYMMETRIC = 0x096,
        TAG = 0x097,
        SELECTOR = 0x098,
        INSUFFICIENT = 0x09A,
        SIGNATURE = 0x09B,
        KEY = 0x09C,
        POLICY_FAIL = 0x09D,
        INTEGRITY = 0x09F,
        TICKET = 0x0A0,
        RESERVED_BITS = 0x0A1,
        BAD_AUTH = 0x0A2,
        EXPIRED = 0x0A3,
        POLICY_CC = 0x0A4,
        BINDING = 0x0A5,
        CURVE = 0x0A6,
        ECC_POINT = 0x0A7,
        CONTEXT_GAP = 0x901,
        OBJECT_MEMORY = 0x902,
        SESSION_MEMORY = 0x903,
        MEMORY = 0x904,
        SESSION_HANDLES = 0x905,
        OBJECT_HANDLES = 0x906,
        LOCALITY = 0x907,
        YIELDED = 0x908,
        CANCELED = 0x909,
        TESTING = 0x90A,
        NV_RATE = 0x920,
        LOCKOUT = 0x921,
        RETRY = 0x922,
        NV_UNAVAILABLE = 0x923,
    }
}

impl TPM_RC {
    const RC_FMT1: u32 = 0x080;
    const RC_WARN: u32 = 0x900;
    const RC_P: u32 = 0x040;
    const RC_S: u32 = 0x800;

    pub fn is_success(&self) -> bool {
        self.0 == 0
    }

    /// Format-one codes carry a parameter, handle or session number
    pub fn is_format_one(&self) -> bool {
        self.0 & Self::RC_FMT1 != 0
    }

    pub fn is_warning(&self) -> bool {
        !self.is_format_one() && (self.0 & 0xF00) == Self::RC_WARN
    }

    /// The response code with its parameter/handle/session number stripped
    pub fn base(&self) -> TPM_RC {
        if self.is_format_one() {
            TPM_RC(self.0 & 0xBF)
        } else {
            TPM_RC(self.0)
        }
    }

    fn number(&self) -> u32 {
        (self.0 >> 8) & 0xF
    }

    /// 1-based index of the offending parameter
    pub fn parameter(&self) -> Option<u32> {
        (self.is_format_one() && self.0 & Self::RC_P != 0).then(|| self.number())
    }

    /// 1-based index of the offending handle
    pub fn handle(&self) -> Option<u32> {
        (self.is_format_one() && self.0 & (Self::RC_P | Self::RC_S) == 0 && self.number() != 0)
            .then(|| self.number())
    }

    /// 1-based index of the offending session
    pub fn session(&self) -> Option<u32> {
        (self.is_format_one() && self.0 & Self::RC_P == 0 && self.0 & Self::RC_S != 0)
            .then(|| self.number() & 0x7)
    }

    /// Build a format-one code that names a parameter
    pub fn with_parameter(self, index: u32) -> TPM_RC {
        TPM_RC(self.0 | Self::RC_P | ((index & 0xF) << 8))
    }

    /// Build a format-one code that names a handle
    pub fn with_handle(self, index: u32) -> TPM_RC {
        TPM_RC(self.0 | ((index & 0x7) << 8))
    }

    /// Build a format-one code that names a session
    pub fn with_session(self, index: u32) -> TPM_RC {
        TPM_RC(self.0 | Self::RC_S | ((index & 0x7) << 8))
    }
}

impl fmt::Display for TPM_RC {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TPM_RC_{:?}", self.base())?;
        if let Some(index) = self.parameter() {
            write!(f, " (parameter {})", index)?;
        } else if let Some(index) = self.handle() {
            write!(f, " (handle {})", index)?;
        } else if let Some(index) = self.session() {
            write!(f, " (session {})", index)?;
        }
        Ok(())
    }
}

tpm_enum! {
    /// Permanent handles
    TPM_RH: u32 {
        OWNER = 0x40000001,
        NULL = 0x40000007,
        UNASSIGNED = 0x40000008,
        PW = 0x40000009,
        LOCKOUT = 0x4000000A,
        ENDORSEMENT = 0x4000000B,
        PLATFORM = 0x4000000C,
        PLATFORM_NV = 0x4000000D,
    }
}

tpm_enum! {
    /// Handle types (most significant octet of a handle)
    TPM_HT: u8 {
        PCR = 0x00,
        NV_INDEX = 0x01,
        HMAC_SESSION = 0x02,
        POLICY_SESSION = 0x03,
        PERMANENT = 0x40,
        TRANSIENT = 0x80,
        PERSISTENT = 0x81,
    }
}

tpm_enum! {
    /// Session types
    TPM_SE: u8 {
        HMAC = 0x00,
        POLICY = 0x01,
        TRIAL = 0x03,
    }
}

tpm_enum! {
    /// Startup and shutdown types
    TPM_SU: u16 {
        CLEAR = 0x0000,
        STATE = 0x0001,
    }
}

tpm_enum! {
    /// Capability categories
    TPM_CAP: u32 {
        ALGS = 0x00,
        HANDLES = 0x01,
        COMMANDS = 0x02,
        PP_COMMANDS = 0x03,
        AUDIT_COMMANDS = 0x04,
        PCRS = 0x05,
        TPM_PROPERTIES = 0x06,
        PCR_PROPERTIES = 0x07,
        ECC_CURVES = 0x08,
    }
}

tpm_enum! {
    /// TPM property tags
    TPM_PT: u32 {
        NONE = 0x000,
        FAMILY_INDICATOR = 0x100,
        LEVEL = 0x101,
        REVISION = 0x102,
        DAY_OF_YEAR = 0x103,
        YEAR = 0x104,
        MANUFACTURER = 0x105,
        VENDOR_STRING_1 = 0x106,
        INPUT_BUFFER = 0x10D,
        HR_TRANSIENT_MIN = 0x10E,
        HR_PERSISTENT_MIN = 0x10F,
        HR_LOADED_MIN = 0x110,
        ACTIVE_SESSIONS_MAX = 0x111,
        PCR_COUNT = 0x112,
        PCR_SELECT_MIN = 0x113,
        CONTEXT_GAP_MAX = 0x114,
        NV_COUNTERS_MAX = 0x116,
        NV_INDEX_MAX = 0x117,
        MEMORY = 0x118,
        CONTEXT_HASH = 0x11A,
        MAX_COMMAND_SIZE = 0x11E,
        MAX_RESPONSE_SIZE = 0x11F,
        MAX_DIGEST = 0x120,
        PERMANENT = 0x200,
        STARTUP_CLEAR = 0x201,
        HR_NV_INDEX = 0x202,
        HR_LOADED = 0x203,
        HR_LOADED_AVAIL = 0x204,
        HR_ACTIVE = 0x205,
        HR_ACTIVE_AVAIL = 0x206,
        HR_TRANSIENT_AVAIL = 0x207,
    }
}

tpm_enum! {
    /// PCR property tags
    TPM_PT_PCR: u32 {
        SAVE = 0x00,
        EXTEND_L0 = 0x01,
        RESET_L0 = 0x02,
        NO_INCREMENT = 0x11,
        DRTM_RESET = 0x12,
        POLICY = 0x13,
        AUTH = 0x14,
    }
}

tpm_enum! {
    /// ECC curve identifiers
    TPM_ECC_CURVE: u16 {
        NONE = 0x0000,
        NIST_P192 = 0x0001,
        NIST_P224 = 0x0002,
        NIST_P256 = 0x0003,
        NIST_P384 = 0x0004,
        NIST_P521 = 0x0005,
        BN_P256 = 0x0010,
        BN_P638 = 0x0011,
        SM2_P256 = 0x0020,
    }
}

tpm_flags! {
    /// Session attributes
    TPMA_SESSION: u8 {
        continueSession = 0x01,
        auditExclusive = 0x02,
        auditReset = 0x04,
        decrypt = 0x20,
        encrypt = 0x40,
        audit = 0x80,
    }
}

tpm_flags! {
    /// Locality selection for policy assertions
    TPMA_LOCALITY: u8 {
        LOC_ZERO = 0x01,
        LOC_ONE = 0x02,
        LOC_TWO = 0x04,
        LOC_THREE = 0x08,
        LOC_FOUR = 0x10,
    }
}

tpm_flags! {
    /// NV index attributes. `TPM_NT_*` values occupy bits 4..7.
    TPMA_NV: u32 {
        PPWRITE = 0x00000001,
        OWNERWRITE = 0x00000002,
        AUTHWRITE = 0x00000004,
        POLICYWRITE = 0x00000008,
        TPM_NT_COUNTER = 0x00000010,
        TPM_NT_BITS = 0x00000020,
        TPM_NT_EXTEND = 0x00000040,
        POLICY_DELETE = 0x00000400,
        WRITELOCKED = 0x00000800,
        WRITEALL = 0x00001000,
        WRITEDEFINE = 0x00002000,
        WRITE_STCLEAR = 0x00004000,
        GLOBALLOCK = 0x00008000,
        PPREAD = 0x00010000,
        OWNERREAD = 0x00020000,
        AUTHREAD = 0x00040000,
        POLICYREAD = 0x00080000,
        NO_DA = 0x02000000,
        ORDERLY = 0x04000000,
        CLEAR_STCLEAR = 0x08000000,
        READLOCKED = 0x10000000,
        WRITTEN = 0x20000000,
        PLATFORMCREATE = 0x40000000,
        READ_STCLEAR = 0x80000000,
    }
}

impl TPMA_NV {
    /// The `TPM_NT` index type field
    pub fn nv_type(&self) -> u32 {
        (self.0 >> 4) & 0xF
    }
}

tpm_flags! {
    /// Object attributes
    TPMA_OBJECT: u32 {
        fixedTPM = 0x00000002,
        stClear = 0x00000004,
        fixedParent = 0x00000010,
        sensitiveDataOrigin = 0x00000020,
        userWithAuth = 0x00000040,
        adminWithPolicy = 0x00000080,
        noDA = 0x00000400,
        encryptedDuplication = 0x00000800,
        restricted = 0x00010000,
        decrypt = 0x00020000,
        sign = 0x00040000,
    }
}

tpm_flags! {
    /// Algorithm attributes reported by TPM_CAP_ALGS
    TPMA_ALGORITHM: u32 {
        asymmetric = 0x00000001,
        symmetric = 0x00000002,
        hash = 0x00000004,
        object = 0x00000008,
        signing = 0x00000100,
        encrypting = 0x00000200,
        method = 0x00000400,
    }
}

tpm_flags! {
    /// Command attributes reported by TPM_CAP_COMMANDS; the low 16 bits hold the command index
    TPMA_CC: u32 {
        nv = 0x00400000,
        extensive = 0x00800000,
        flushed = 0x01000000,
        rHandle = 0x10000000,
        V = 0x20000000,
    }
}

impl TPMA_CC {
    pub fn command_index(&self) -> u32 {
        self.0 & 0xFFFF
    }

    /// Number of handles in the command's handle area
    pub fn c_handles(&self) -> u32 {
        (self.0 >> 25) & 0x7
    }
}

// ---------------------------------------------------------------------------
// Structures
// ---------------------------------------------------------------------------

fn write_list<T: TpmMarshaller>(buf: &mut TpmBuffer, items: &[T]) -> Result<(), TpmError> {
    buf.write_u32(items.len() as u32);
    for item in items {
        item.toTpm(buf)?;
    }
    Ok(())
}

fn read_list<T: TpmStructure>(
    buf: &mut TpmBuffer,
    min_elem_size: usize,
    max: usize,
) -> Result<Vec<T>, TpmError> {
    let count = buf.read_count(min_elem_size, max)?;
    (0..count).map(|_| T::fromTpm(buf)).collect()
}

macro_rules! tpm_list {
    ($(#[$meta:meta])* $name:ident { $field:ident: $elem:ty, $min:expr, $max:expr }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq)]
        pub struct $name {
            pub $field: Vec<$elem>,
        }

        impl $name {
            pub fn new(items: Vec<$elem>) -> Self {
                $name { $field: items }
            }
        }

        impl TpmMarshaller for $name {
            fn toTpm(&self, buf: &mut TpmBuffer) -> Result<(), TpmError> {
                if self.$field.len() > $max {
                    return Err(TpmError::InvalidParameter(format!(
                        "{} holds at most {} elements",
                        stringify!($name),
                        $max
                    )));
                }
                write_list(buf, &self.$field)
            }

            fn initFromTpm(&mut self, buf: &mut TpmBuffer) -> Result<(), TpmError> {
                self.$field = read_list(buf, $min, $max)?;
                Ok(())
            }
        }
    };
}

/// Handle with the client-side metadata needed to authorize its use.
///
/// Only `handle` goes on the wire; `auth_value` and `name` feed session HMACs.
#[derive(Clone, Default, PartialEq, Eq, Derivative)]
#[derivative(Debug)]
pub struct TPM_HANDLE {
    pub handle: u32,
    #[derivative(Debug = "ignore")]
    pub auth_value: Vec<u8>,
    pub name: Vec<u8>,
}

impl TpmMarshaller for TPM_HANDLE {
    fn toTpm(&self, buf: &mut TpmBuffer) -> Result<(), TpmError> {
        buf.write_u32(self.handle);
        Ok(())
    }

    fn initFromTpm(&mut self, buf: &mut TpmBuffer) -> Result<(), TpmError> {
        self.handle = buf.read_u32()?;
        Ok(())
    }
}

/// Authorization area entry of a command
#[derive(Clone, Default, PartialEq, Eq, Derivative)]
#[derivative(Debug)]
pub struct TPMS_AUTH_COMMAND {
    pub sessionHandle: TPM_HANDLE,
    pub nonce: Vec<u8>,
    pub sessionAttributes: TPMA_SESSION,
    #[derivative(Debug = "ignore")]
    pub hmac: Vec<u8>,
}

impl TPMS_AUTH_COMMAND {
    pub fn new(
        session_handle: &TPM_HANDLE,
        nonce: &[u8],
        session_attributes: TPMA_SESSION,
        hmac: &[u8],
    ) -> Self {
        TPMS_AUTH_COMMAND {
            sessionHandle: session_handle.clone(),
            nonce: nonce.to_vec(),
            sessionAttributes: session_attributes,
            hmac: hmac.to_vec(),
        }
    }
}

impl TpmMarshaller for TPMS_AUTH_COMMAND {
    fn toTpm(&self, buf: &mut TpmBuffer) -> Result<(), TpmError> {
        self.sessionHandle.toTpm(buf)?;
        buf.write_sized_bytes(&self.nonce)?;
        self.sessionAttributes.toTpm(buf)?;
        buf.write_sized_bytes(&self.hmac)
    }

    fn initFromTpm(&mut self, buf: &mut TpmBuffer) -> Result<(), TpmError> {
        self.sessionHandle.initFromTpm(buf)?;
        self.nonce = buf.read_sized_bytes()?;
        self.sessionAttributes.initFromTpm(buf)?;
        self.hmac = buf.read_sized_bytes()?;
        Ok(())
    }
}

/// Authorization area entry of a response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TPMS_AUTH_RESPONSE {
    pub nonce: Vec<u8>,
    pub sessionAttributes: TPMA_SESSION,
    pub hmac: Vec<u8>,
}

impl TPMS_AUTH_RESPONSE {
    pub fn new(nonce: &[u8], session_attributes: TPMA_SESSION, hmac: &[u8]) -> Self {
        TPMS_AUTH_RESPONSE {
            nonce: nonce.to_vec(),
            sessionAttributes: session_attributes,
            hmac: hmac.to_vec(),
        }
    }
}

impl TpmMarshaller for TPMS_AUTH_RESPONSE {
    fn toTpm(&self, buf: &mut TpmBuffer) -> Result<(), TpmError> {
        buf.write_sized_bytes(&self.nonce)?;
        self.sessionAttributes.toTpm(buf)?;
        buf.write_sized_bytes(&self.hmac)
    }

    fn initFromTpm(&mut self, buf: &mut TpmBuffer) -> Result<(), TpmError> {
        self.nonce = buf.read_sized_bytes()?;
        self.sessionAttributes.initFromTpm(buf)?;
        self.hmac = buf.read_sized_bytes()?;
        Ok(())
    }
}

fn write_select(buf: &mut TpmBuffer, select: &[u8]) -> Result<(), TpmError> {
    let size = u8::try_from(select.len())
        .map_err(|_| TpmError::InvalidParameter(format!("PCR select of {} bytes", select.len())))?;
    buf.write_u8(size);
    buf.write_bytes(select);
    Ok(())
}

fn read_select(buf: &mut TpmBuffer) -> Result<Vec<u8>, TpmError> {
    let size = buf.read_u8()? as usize;
    buf.read_bytes(size)
}

/// PCR bank selection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TPMS_PCR_SELECTION {
    pub hash: TPM_ALG_ID,
    pub pcrSelect: Vec<u8>,
}

impl TpmMarshaller for TPMS_PCR_SELECTION {
    fn toTpm(&self, buf: &mut TpmBuffer) -> Result<(), TpmError> {
        self.hash.toTpm(buf)?;
        write_select(buf, &self.pcrSelect)
    }

    fn initFromTpm(&mut self, buf: &mut TpmBuffer) -> Result<(), TpmError> {
        self.hash.initFromTpm(buf)?;
        self.pcrSelect = read_select(buf)?;
        Ok(())
    }
}

tpm_list! {
    /// List of PCR bank selections
    TPML_PCR_SELECTION { pcrSelections: TPMS_PCR_SELECTION, 3, 16 }
}

/// List of sized digests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TPML_DIGEST {
    pub digests: Vec<Vec<u8>>,
}

impl TPML_DIGEST {
    /// Largest list the TPM accepts or returns
    pub const MAX_DIGESTS: usize = 8;
}

impl TpmMarshaller for TPML_DIGEST {
    fn toTpm(&self, buf: &mut TpmBuffer) -> Result<(), TpmError> {
        if self.digests.len() > Self::MAX_DIGESTS {
            return Err(TpmError::InvalidParameter(format!(
                "TPML_DIGEST holds at most {} digests",
                Self::MAX_DIGESTS
            )));
        }
        buf.write_u32(self.digests.len() as u32);
        for digest in &self.digests {
            buf.write_sized_bytes(digest)?;
        }
        Ok(())
    }

    fn initFromTpm(&mut self, buf: &mut TpmBuffer) -> Result<(), TpmError> {
        let count = buf.read_count(2, Self::MAX_DIGESTS)?;
        self.digests = (0..count)
            .map(|_| buf.read_sized_bytes())
            .collect::<Result<_, _>>()?;
        Ok(())
    }
}

/// Digest tagged with its algorithm; the digest size is implied by the algorithm
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TPMT_HA {
    pub hashAlg: TPM_ALG_ID,
    pub digest: Vec<u8>,
}

impl TpmMarshaller for TPMT_HA {
    fn toTpm(&self, buf: &mut TpmBuffer) -> Result<(), TpmError> {
        let size = Crypto::digest_size(self.hashAlg);
        if size == 0 || size != self.digest.len() {
            return Err(TpmError::InvalidParameter(format!(
                "{} byte digest for {:?}",
                self.digest.len(),
                self.hashAlg
            )));
        }
        self.hashAlg.toTpm(buf)?;
        buf.write_bytes(&self.digest);
        Ok(())
    }

    fn initFromTpm(&mut self, buf: &mut TpmBuffer) -> Result<(), TpmError> {
        self.hashAlg.initFromTpm(buf)?;
        let size = Crypto::digest_size(self.hashAlg);
        if size == 0 {
            return Err(DecodeError::UnsupportedAlgorithm(self.hashAlg.0).into());
        }
        self.digest = buf.read_bytes(size)?;
        Ok(())
    }
}

tpm_list! {
    /// Digests of one event in several banks
    TPML_DIGEST_VALUES { digests: TPMT_HA, 2, 16 }
}

/// Algorithm and its attributes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TPMS_ALG_PROPERTY {
    pub alg: TPM_ALG_ID,
    pub algProperties: TPMA_ALGORITHM,
}

impl TpmMarshaller for TPMS_ALG_PROPERTY {
    fn toTpm(&self, buf: &mut TpmBuffer) -> Result<(), TpmError> {
        self.alg.toTpm(buf)?;
        self.algProperties.toTpm(buf)
    }

    fn initFromTpm(&mut self, buf: &mut TpmBuffer) -> Result<(), TpmError> {
        self.alg.initFromTpm(buf)?;
        self.algProperties.initFromTpm(buf)
    }
}

/// Property tag and value
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TPMS_TAGGED_PROPERTY {
    pub property: TPM_PT,
    pub value: u32,
}

impl TpmMarshaller for TPMS_TAGGED_PROPERTY {
    fn toTpm(&self, buf: &mut TpmBuffer) -> Result<(), TpmError> {
        self.property.toTpm(buf)?;
        buf.write_u32(self.value);
        Ok(())
    }

    fn initFromTpm(&mut self, buf: &mut TpmBuffer) -> Result<(), TpmError> {
        self.property.initFromTpm(buf)?;
        self.value = buf.read_u32()?;
        Ok(())
    }
}

/// PCR property and the PCRs that have it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TPMS_TAGGED_PCR_SELECT {
    pub tag: TPM_PT_PCR,
    pub pcrSelect: Vec<u8>,
}

impl TpmMarshaller for TPMS_TAGGED_PCR_SELECT {
    fn toTpm(&self, buf: &mut TpmBuffer) -> Result<(), TpmError> {
        self.tag.toTpm(buf)?;
        write_select(buf, &self.pcrSelect)
    }

    fn initFromTpm(&mut self, buf: &mut TpmBuffer) -> Result<(), TpmError> {
        self.tag.initFromTpm(buf)?;
        self.pcrSelect = read_select(buf)?;
        Ok(())
    }
}

tpm_list! {
    TPML_ALG_PROPERTY { algProperties: TPMS_ALG_PROPERTY, 6, MAX_LIST_ITEMS }
}

tpm_list! {
    TPML_HANDLE { handle: TPM_HANDLE, 4, MAX_LIST_ITEMS }
}

tpm_list! {
    TPML_CCA { commandAttributes: TPMA_CC, 4, MAX_LIST_ITEMS }
}

tpm_list! {
    TPML_CC { commandCodes: TPM_CC, 4, MAX_LIST_ITEMS }
}

tpm_list! {
    TPML_TAGGED_TPM_PROPERTY { tpmProperty: TPMS_TAGGED_PROPERTY, 8, MAX_LIST_ITEMS }
}

tpm_list! {
    TPML_TAGGED_PCR_PROPERTY { pcrProperty: TPMS_TAGGED_PCR_SELECT, 5, MAX_LIST_ITEMS }
}

tpm_list! {
    TPML_ECC_CURVE { eccCurves: TPM_ECC_CURVE, 2, MAX_LIST_ITEMS }
}

/// Capability payload, keyed by capability category
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TPMU_CAPABILITIES {
    algorithms(TPML_ALG_PROPERTY),
    handles(TPML_HANDLE),
    command(TPML_CCA),
    ppCommands(TPML_CC),
    auditCommands(TPML_CC),
    assignedPCR(TPML_PCR_SELECTION),
    tpmProperties(TPML_TAGGED_TPM_PROPERTY),
    pcrProperties(TPML_TAGGED_PCR_PROPERTY),
    eccCurves(TPML_ECC_CURVE),
}

impl Default for TPMU_CAPABILITIES {
    fn default() -> Self {
        TPMU_CAPABILITIES::algorithms(TPML_ALG_PROPERTY::default())
    }
}

impl TPMU_CAPABILITIES {
    /// Selector of this variant
    pub fn capability(&self) -> TPM_CAP {
        match self {
            Self::algorithms(_) => TPM_CAP::ALGS,
            Self::handles(_) => TPM_CAP::HANDLES,
            Self::command(_) => TPM_CAP::COMMANDS,
            Self::ppCommands(_) => TPM_CAP::PP_COMMANDS,
            Self::auditCommands(_) => TPM_CAP::AUDIT_COMMANDS,
            Self::assignedPCR(_) => TPM_CAP::PCRS,
            Self::tpmProperties(_) => TPM_CAP::TPM_PROPERTIES,
            Self::pcrProperties(_) => TPM_CAP::PCR_PROPERTIES,
            Self::eccCurves(_) => TPM_CAP::ECC_CURVES,
        }
    }

    /// Empty payload for `capability`
    pub fn empty(capability: TPM_CAP) -> Result<Self, TpmError> {
        Ok(match capability {
            TPM_CAP::ALGS => Self::algorithms(Default::default()),
            TPM_CAP::HANDLES => Self::handles(Default::default()),
            TPM_CAP::COMMANDS => Self::command(Default::default()),
            TPM_CAP::PP_COMMANDS => Self::ppCommands(Default::default()),
            TPM_CAP::AUDIT_COMMANDS => Self::auditCommands(Default::default()),
            TPM_CAP::PCRS => Self::assignedPCR(Default::default()),
            TPM_CAP::TPM_PROPERTIES => Self::tpmProperties(Default::default()),
            TPM_CAP::PCR_PROPERTIES => Self::pcrProperties(Default::default()),
            TPM_CAP::ECC_CURVES => Self::eccCurves(Default::default()),
            other => return Err(DecodeError::InvalidUnion(other.0).into()),
        })
    }

    pub fn len(&self) -> usize {
        match self {
            Self::algorithms(l) => l.algProperties.len(),
            Self::handles(l) => l.handle.len(),
            Self::command(l) => l.commandAttributes.len(),
            Self::ppCommands(l) | Self::auditCommands(l) => l.commandCodes.len(),
            Self::assignedPCR(l) => l.pcrSelections.len(),
            Self::tpmProperties(l) => l.tpmProperty.len(),
            Self::pcrProperties(l) => l.pcrProperty.len(),
            Self::eccCurves(l) => l.eccCurves.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Property value from which a follow-up query continues after the last returned element
    pub fn next_property(&self) -> Option<u32> {
        let last = match self {
            Self::algorithms(l) => l.algProperties.last().map(|p| p.alg.0 as u32),
            Self::handles(l) => l.handle.last().map(|h| h.handle),
            Self::command(l) => l.commandAttributes.last().map(|c| c.command_index()),
            Self::ppCommands(l) | Self::auditCommands(l) => {
                l.commandCodes.last().map(|c| c.0)
            }
            Self::assignedPCR(_) => None,
            Self::tpmProperties(l) => l.tpmProperty.last().map(|p| p.property.0),
            Self::pcrProperties(l) => l.pcrProperty.last().map(|p| p.tag.0),
            Self::eccCurves(l) => l.eccCurves.last().map(|c| c.0 as u32),
        };
        last.and_then(|value| value.checked_add(1))
    }

    /// Append the elements of `other`, which must be of the same category
    pub fn append(&mut self, other: TPMU_CAPABILITIES) -> Result<(), TpmError> {
        match (self, other) {
            (Self::algorithms(a), Self::algorithms(b)) => a.algProperties.extend(b.algProperties),
            (Self::handles(a), Self::handles(b)) => a.handle.extend(b.handle),
            (Self::command(a), Self::command(b)) => a.commandAttributes.extend(b.commandAttributes),
            (Self::ppCommands(a), Self::ppCommands(b))
            | (Self::auditCommands(a), Self::auditCommands(b)) => a.commandCodes.extend(b.commandCodes),
            (Self::assignedPCR(a), Self::assignedPCR(b)) => a.pcrSelections.extend(b.pcrSelections),
            (Self::tpmProperties(a), Self::tpmProperties(b)) => a.tpmProperty.extend(b.tpmProperty),
            (Self::pcrProperties(a), Self::pcrProperties(b)) => a.pcrProperty.extend(b.pcrProperty),
            (Self::eccCurves(a), Self::eccCurves(b)) => a.eccCurves.extend(b.eccCurves),
            (mine, theirs) => {
                return Err(TpmError::InvalidParameter(format!(
                    "cannot merge {:?} data into {:?} data",
                    theirs.capability(),
                    mine.capability()
                )))
            }
        }
        Ok(())
    }
}

/// Result of TPM2_GetCapability
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TPMS_CAPABILITY_DATA {
    pub data: TPMU_CAPABILITIES,
}

impl TPMS_CAPABILITY_DATA {
    pub fn capability(&self) -> TPM_CAP {
        self.data.capability()
    }
}

impl TpmMarshaller for TPMS_CAPABILITY_DATA {
    fn toTpm(&self, buf: &mut TpmBuffer) -> Result<(), TpmError> {
        self.data.capability().toTpm(buf)?;
        match &self.data {
            TPMU_CAPABILITIES::algorithms(l) => l.toTpm(buf),
            TPMU_CAPABILITIES::handles(l) => l.toTpm(buf),
            TPMU_CAPABILITIES::command(l) => l.toTpm(buf),
            TPMU_CAPABILITIES::ppCommands(l) | TPMU_CAPABILITIES::auditCommands(l) => l.toTpm(buf),
            TPMU_CAPABILITIES::assignedPCR(l) => l.toTpm(buf),
            TPMU_CAPABILITIES::tpmProperties(l) => l.toTpm(buf),
            TPMU_CAPABILITIES::pcrProperties(l) => l.toTpm(buf),
            TPMU_CAPABILITIES::eccCurves(l) => l.toTpm(buf),
        }
    }

    fn initFromTpm(&mut self, buf: &mut TpmBuffer) -> Result<(), TpmError> {
        let capability = TPM_CAP::fromTpm(buf)?;
        self.data = match capability {
            TPM_CAP::ALGS => TPMU_CAPABILITIES::algorithms(TpmStructure::fromTpm(buf)?),
            TPM_CAP::HANDLES => TPMU_CAPABILITIES::handles(TpmStructure::fromTpm(buf)?),
            TPM_CAP::COMMANDS => TPMU_CAPABILITIES::command(TpmStructure::fromTpm(buf)?),
            TPM_CAP::PP_COMMANDS => TPMU_CAPABILITIES::ppCommands(TpmStructure::fromTpm(buf)?),
            TPM_CAP::AUDIT_COMMANDS => TPMU_CAPABILITIES::auditCommands(TpmStructure::fromTpm(buf)?),
            TPM_CAP::PCRS => TPMU_CAPABILITIES::assignedPCR(TpmStructure::fromTpm(buf)?),
            TPM_CAP::TPM_PROPERTIES => TPMU_CAPABILITIES::tpmProperties(TpmStructure::fromTpm(buf)?),
            TPM_CAP::PCR_PROPERTIES => TPMU_CAPABILITIES::pcrProperties(TpmStructure::fromTpm(buf)?),
            TPM_CAP::ECC_CURVES => TPMU_CAPABILITIES::eccCurves(TpmStructure::fromTpm(buf)?),
            other => return Err(DecodeError::InvalidUnion(other.0).into()),
        };
        Ok(())
    }
}

/// Saved context of an object or session, integrity protected by the TPM
#[derive(Clone, Default, PartialEq, Eq, Derivative)]
#[derivative(Debug)]
pub struct TPMS_CONTEXT {
    pub sequence: u64,
    pub savedHandle: TPM_HANDLE,
    pub hierarchy: TPM_HANDLE,
    #[derivative(Debug = "ignore")]
    pub contextBlob: Vec<u8>,
}

impl TpmMarshaller for TPMS_CONTEXT {
    fn toTpm(&self, buf: &mut TpmBuffer) -> Result<(), TpmError> {
        buf.write_u64(self.sequence);
        self.savedHandle.toTpm(buf)?;
        self.hierarchy.toTpm(buf)?;
        buf.write_sized_bytes(&self.contextBlob)
    }

    fn initFromTpm(&mut self, buf: &mut TpmBuffer) -> Result<(), TpmError> {
        self.sequence = buf.read_u64()?;
        self.savedHandle.initFromTpm(buf)?;
        self.hierarchy.initFromTpm(buf)?;
        self.contextBlob = buf.read_sized_bytes()?;
        Ok(())
    }
}

/// Symmetric algorithm definition; `keyBits` and `mode` are absent for TPM_ALG_NULL,
/// and `mode` is absent for TPM_ALG_XOR (where `keyBits` carries the hash algorithm)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TPMT_SYM_DEF {
    pub algorithm: TPM_ALG_ID,
    pub keyBits: u16,
    pub mode: TPM_ALG_ID,
}

pub type TPMT_SYM_DEF_OBJECT = TPMT_SYM_DEF;

impl Default for TPMT_SYM_DEF {
    fn default() -> Self {
        TPMT_SYM_DEF::null()
    }
}

impl TPMT_SYM_DEF {
    pub fn new(algorithm: TPM_ALG_ID, key_bits: u16, mode: TPM_ALG_ID) -> Self {
        TPMT_SYM_DEF {
            algorithm,
            keyBits: key_bits,
            mode,
        }
    }

    pub fn null() -> Self {
        TPMT_SYM_DEF::new(TPM_ALG_ID::NULL, 0, TPM_ALG_ID::NULL)
    }

    pub fn aes_128_cfb() -> Self {
        TPMT_SYM_DEF::new(TPM_ALG_ID::AES, 128, TPM_ALG_ID::CFB)
    }
}

impl TpmMarshaller for TPMT_SYM_DEF {
    fn toTpm(&self, buf: &mut TpmBuffer) -> Result<(), TpmError> {
        self.algorithm.toTpm(buf)?;
        if self.algorithm != TPM_ALG_ID::NULL {
            buf.write_u16(self.keyBits);
            if self.algorithm != TPM_ALG_ID::XOR {
                self.mode.toTpm(buf)?;
            }
        }
        Ok(())
    }

    fn initFromTpm(&mut self, buf: &mut TpmBuffer) -> Result<(), TpmError> {
        *self = TPMT_SYM_DEF::null();
        self.algorithm.initFromTpm(buf)?;
        if self.algorithm != TPM_ALG_ID::NULL {
            self.keyBits = buf.read_u16()?;
            if self.algorithm != TPM_ALG_ID::XOR {
                self.mode.initFromTpm(buf)?;
            }
        }
        Ok(())
    }
}

/// Public area of an NV index
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TPMS_NV_PUBLIC {
    pub nvIndex: TPM_HANDLE,
    pub nameAlg: TPM_ALG_ID,
    pub attributes: TPMA_NV,
    pub authPolicy: Vec<u8>,
    pub dataSize: u16,
}

impl TpmMarshaller for TPMS_NV_PUBLIC {
    fn toTpm(&self, buf: &mut TpmBuffer) -> Result<(), TpmError> {
        self.nvIndex.toTpm(buf)?;
        self.nameAlg.toTpm(buf)?;
        self.attributes.toTpm(buf)?;
        buf.write_sized_bytes(&self.authPolicy)?;
        buf.write_u16(self.dataSize);
        Ok(())
    }

    fn initFromTpm(&mut self, buf: &mut TpmBuffer) -> Result<(), TpmError> {
        self.nvIndex.initFromTpm(buf)?;
        self.nameAlg.initFromTpm(buf)?;
        self.attributes.initFromTpm(buf)?;
        self.authPolicy = buf.read_sized_bytes()?;
        self.dataSize = buf.read_u16()?;
        Ok(())
    }
}

/// Sensitive data supplied at object creation
#[derive(Clone, Default, PartialEq, Eq, Derivative)]
#[derivative(Debug)]
pub struct TPMS_SENSITIVE_CREATE {
    #[derivative(Debug = "ignore")]
    pub userAuth: Vec<u8>,
    #[derivative(Debug = "ignore")]
    pub data: Vec<u8>,
}

impl TpmMarshaller for TPMS_SENSITIVE_CREATE {
    fn toTpm(&self, buf: &mut TpmBuffer) -> Result<(), TpmError> {
        buf.write_sized_bytes(&self.userAuth)?;
        buf.write_sized_bytes(&self.data)
    }

    fn initFromTpm(&mut self, buf: &mut TpmBuffer) -> Result<(), TpmError> {
        self.userAuth = buf.read_sized_bytes()?;
        self.data = buf.read_sized_bytes()?;
        Ok(())
    }
}

/// Keyed-hash scheme: HMAC carries a hash algorithm, XOR a hash algorithm and a KDF
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TPMT_KEYEDHASH_SCHEME {
    pub scheme: TPM_ALG_ID,
    pub hashAlg: TPM_ALG_ID,
    pub kdf: TPM_ALG_ID,
}

impl Default for TPMT_KEYEDHASH_SCHEME {
    fn default() -> Self {
        TPMT_KEYEDHASH_SCHEME {
            scheme: TPM_ALG_ID::NULL,
            hashAlg: TPM_ALG_ID::NULL,
            kdf: TPM_ALG_ID::NULL,
        }
    }
}

impl TpmMarshaller for TPMT_KEYEDHASH_SCHEME {
    fn toTpm(&self, buf: &mut TpmBuffer) -> Result<(), TpmError> {
        self.scheme.toTpm(buf)?;
        match self.scheme {
            TPM_ALG_ID::NULL => Ok(()),
            TPM_ALG_ID::HMAC => self.hashAlg.toTpm(buf),
            TPM_ALG_ID::XOR => {
                self.hashAlg.toTpm(buf)?;
                self.kdf.toTpm(buf)
            }
            other => Err(TpmError::InvalidParameter(format!("keyed-hash scheme {:?}", other))),
        }
    }

    fn initFromTpm(&mut self, buf: &mut TpmBuffer) -> Result<(), TpmError> {
        *self = TPMT_KEYEDHASH_SCHEME::default();
        self.scheme.initFromTpm(buf)?;
        match self.scheme {
            TPM_ALG_ID::NULL => {}
            TPM_ALG_ID::HMAC => self.hashAlg.initFromTpm(buf)?,
            TPM_ALG_ID::XOR => {
                self.hashAlg.initFromTpm(buf)?;
                self.kdf.initFromTpm(buf)?;
            }
            other => return Err(DecodeError::InvalidUnion(other.0 as u32).into()),
        }
        Ok(())
    }
}

/// Asymmetric scheme. RSAES and NULL carry no details, ECDAA adds a commit count,
/// every other scheme carries a hash algorithm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TPMT_ASYM_SCHEME {
    pub scheme: TPM_ALG_ID,
    pub hashAlg: TPM_ALG_ID,
    pub count: u16,
}

pub type TPMT_RSA_SCHEME = TPMT_ASYM_SCHEME;
pub type TPMT_ECC_SCHEME = TPMT_ASYM_SCHEME;

impl Default for TPMT_ASYM_SCHEME {
    fn default() -> Self {
        TPMT_ASYM_SCHEME {
            scheme: TPM_ALG_ID::NULL,
            hashAlg: TPM_ALG_ID::NULL,
            count: 0,
        }
    }
}

impl TpmMarshaller for TPMT_ASYM_SCHEME {
    fn toTpm(&self, buf: &mut TpmBuffer) -> Result<(), TpmError> {
        self.scheme.toTpm(buf)?;
        match self.scheme {
            TPM_ALG_ID::NULL | TPM_ALG_ID::RSAES => {}
            TPM_ALG_ID::ECDAA => {
                self.hashAlg.toTpm(buf)?;
                buf.write_u16(self.count);
            }
            _ => self.hashAlg.toTpm(buf)?,
        }
        Ok(())
    }

    fn initFromTpm(&mut self, buf: &mut TpmBuffer) -> Result<(), TpmError> {
        *self = TPMT_ASYM_SCHEME::default();
        self.scheme.initFromTpm(buf)?;
        match self.scheme {
            TPM_ALG_ID::NULL | TPM_ALG_ID::RSAES => {}
            TPM_ALG_ID::ECDAA => {
                self.hashAlg.initFromTpm(buf)?;
                self.count = buf.read_u16()?;
            }
            _ => self.hashAlg.initFromTpm(buf)?,
        }
        Ok(())
    }
}

/// Key derivation scheme
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TPMT_KDF_SCHEME {
    pub scheme: TPM_ALG_ID,
    pub hashAlg: TPM_ALG_ID,
}

impl Default for TPMT_KDF_SCHEME {
    fn default() -> Self {
        TPMT_KDF_SCHEME {
            scheme: TPM_ALG_ID::NULL,
            hashAlg: TPM_ALG_ID::NULL,
        }
    }
}

impl TpmMarshaller for TPMT_KDF_SCHEME {
    fn toTpm(&self, buf: &mut TpmBuffer) -> Result<(), TpmError> {
        self.scheme.toTpm(buf)?;
        if self.scheme != TPM_ALG_ID::NULL {
            self.hashAlg.toTpm(buf)?;
        }
        Ok(())
    }

    fn initFromTpm(&mut self, buf: &mut TpmBuffer) -> Result<(), TpmError> {
        *self = TPMT_KDF_SCHEME::default();
        self.scheme.initFromTpm(buf)?;
        if self.scheme != TPM_ALG_ID::NULL {
            self.hashAlg.initFromTpm(buf)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TPMS_KEYEDHASH_PARMS {
    pub scheme: TPMT_KEYEDHASH_SCHEME,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TPMS_SYMCIPHER_PARMS {
    pub sym: TPMT_SYM_DEF_OBJECT,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TPMS_RSA_PARMS {
    pub symmetric: TPMT_SYM_DEF_OBJECT,
    pub scheme: TPMT_RSA_SCHEME,
    pub keyBits: u16,
    pub exponent: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TPMS_ECC_PARMS {
    pub symmetric: TPMT_SYM_DEF_OBJECT,
    pub scheme: TPMT_ECC_SCHEME,
    pub curveID: TPM_ECC_CURVE,
    pub kdf: TPMT_KDF_SCHEME,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TPMS_ECC_POINT {
    pub x: Vec<u8>,
    pub y: Vec<u8>,
}

/// Algorithm specific public parameters, keyed by the object type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TPMU_PUBLIC_PARMS {
    keyedHashDetail(TPMS_KEYEDHASH_PARMS),
    symDetail(TPMS_SYMCIPHER_PARMS),
    rsaDetail(TPMS_RSA_PARMS),
    eccDetail(TPMS_ECC_PARMS),
}

impl TPMU_PUBLIC_PARMS {
    /// Object type selecting this variant
    pub fn object_type(&self) -> TPM_ALG_ID {
        match self {
            Self::keyedHashDetail(_) => TPM_ALG_ID::KEYEDHASH,
            Self::symDetail(_) => TPM_ALG_ID::SYMCIPHER,
            Self::rsaDetail(_) => TPM_ALG_ID::RSA,
            Self::eccDetail(_) => TPM_ALG_ID::ECC,
        }
    }
}

/// Unique identifier of an object, keyed by the object type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TPMU_PUBLIC_ID {
    keyedHash(Vec<u8>),
    sym(Vec<u8>),
    rsa(Vec<u8>),
    ecc(TPMS_ECC_POINT),
}

impl TPMU_PUBLIC_ID {
    pub fn object_type(&self) -> TPM_ALG_ID {
        match self {
            Self::keyedHash(_) => TPM_ALG_ID::KEYEDHASH,
            Self::sym(_) => TPM_ALG_ID::SYMCIPHER,
            Self::rsa(_) => TPM_ALG_ID::RSA,
            Self::ecc(_) => TPM_ALG_ID::ECC,
        }
    }
}

/// Public area (template) of a TPM object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TPMT_PUBLIC {
    pub nameAlg: TPM_ALG_ID,
    pub objectAttributes: TPMA_OBJECT,
    pub authPolicy: Vec<u8>,
    pub parameters: TPMU_PUBLIC_PARMS,
    pub unique: TPMU_PUBLIC_ID,
}

impl Default for TPMT_PUBLIC {
    fn default() -> Self {
        TPMT_PUBLIC {
            nameAlg: TPM_ALG_ID::SHA256,
            objectAttributes: TPMA_OBJECT::default(),
            authPolicy: Vec::new(),
            parameters: TPMU_PUBLIC_PARMS::keyedHashDetail(TPMS_KEYEDHASH_PARMS::default()),
            unique: TPMU_PUBLIC_ID::keyedHash(Vec::new()),
        }
    }
}

impl TPMT_PUBLIC {
    pub fn object_type(&self) -> TPM_ALG_ID {
        self.parameters.object_type()
    }
}

impl TpmMarshaller for TPMT_PUBLIC {
    fn toTpm(&self, buf: &mut TpmBuffer) -> Result<(), TpmError> {
        let object_type = self.parameters.object_type();
        if self.unique.object_type() != object_type {
            return Err(TpmError::InvalidParameter(format!(
                "unique identifier of type {:?} in a {:?} template",
                self.unique.object_type(),
                object_type
            )));
        }

        object_type.toTpm(buf)?;
        self.nameAlg.toTpm(buf)?;
        self.objectAttributes.toTpm(buf)?;
        buf.write_sized_bytes(&self.authPolicy)?;

        match &self.parameters {
            TPMU_PUBLIC_PARMS::keyedHashDetail(p) => p.scheme.toTpm(buf)?,
            TPMU_PUBLIC_PARMS::symDetail(p) => p.sym.toTpm(buf)?,
            TPMU_PUBLIC_PARMS::rsaDetail(p) => {
                p.symmetric.toTpm(buf)?;
                p.scheme.toTpm(buf)?;
                buf.write_u16(p.keyBits);
                buf.write_u32(p.exponent);
            }
            TPMU_PUBLIC_PARMS::eccDetail(p) => {
                p.symmetric.toTpm(buf)?;
                p.scheme.toTpm(buf)?;
                p.curveID.toTpm(buf)?;
                p.kdf.toTpm(buf)?;
            }
        }

        match &self.unique {
            TPMU_PUBLIC_ID::keyedHash(id) | TPMU_PUBLIC_ID::sym(id) | TPMU_PUBLIC_ID::rsa(id) => {
                buf.write_sized_bytes(id)
            }
            TPMU_PUBLIC_ID::ecc(point) => {
                buf.write_sized_bytes(&point.x)?;
                buf.write_sized_bytes(&point.y)
            }
        }
    }

    fn initFromTpm(&mut self, buf: &mut TpmBuffer) -> Result<(), TpmError> {
        let object_type = TPM_ALG_ID::fromTpm(buf)?;
        self.nameAlg.initFromTpm(buf)?;
        self.objectAttributes.initFromTpm(buf)?;
        self.authPolicy = buf.read_sized_bytes()?;

        match object_type {
            TPM_ALG_ID::KEYEDHASH => {
                self.parameters = TPMU_PUBLIC_PARMS::keyedHashDetail(TPMS_KEYEDHASH_PARMS {
                    scheme: TpmStructure::fromTpm(buf)?,
                });
                self.unique = TPMU_PUBLIC_ID::keyedHash(buf.read_sized_bytes()?);
            }
            TPM_ALG_ID::SYMCIPHER => {
                self.parameters = TPMU_PUBLIC_PARMS::symDetail(TPMS_SYMCIPHER_PARMS {
                    sym: TpmStructure::fromTpm(buf)?,
                });
                self.unique = TPMU_PUBLIC_ID::sym(buf.read_sized_bytes()?);
            }
            TPM_ALG_ID::RSA => {
                self.parameters = TPMU_PUBLIC_PARMS::rsaDetail(TPMS_RSA_PARMS {
                    symmetric: TpmStructure::fromTpm(buf)?,
                    scheme: TpmStructure::fromTpm(buf)?,
                    keyBits: buf.read_u16()?,
                    exponent: buf.read_u32()?,
                });
                self.unique = TPMU_PUBLIC_ID::rsa(buf.read_sized_bytes()?);
            }
            TPM_ALG_ID::ECC => {
                self.parameters = TPMU_PUBLIC_PARMS::eccDetail(TPMS_ECC_PARMS {
                    symmetric: TpmStructure::fromTpm(buf)?,
                    scheme: TpmStructure::fromTpm(buf)?,
                    curveID: TpmStructure::fromTpm(buf)?,
                    kdf: TpmStructure::fromTpm(buf)?,
                });
                self.unique = TPMU_PUBLIC_ID::ecc(TPMS_ECC_POINT {
                    x: buf.read_sized_bytes()?,
                    y: buf.read_sized_bytes()?,
                });
            }
            other => return Err(DecodeError::InvalidUnion(other.0 as u32).into()),
        }
        Ok(())
    }
}

macro_rules! tpm_ticket {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq)]
        pub struct $name {
            pub tag: TPM_ST,
            pub hierarchy: TPM_HANDLE,
            pub digest: Vec<u8>,
        }

        impl TpmMarshaller for $name {
            fn toTpm(&self, buf: &mut TpmBuffer) -> Result<(), TpmError> {
                self.tag.toTpm(buf)?;
                self.hierarchy.toTpm(buf)?;
                buf.write_sized_bytes(&self.digest)
            }

            fn initFromTpm(&mut self, buf: &mut TpmBuffer) -> Result<(), TpmError> {
                self.tag.initFromTpm(buf)?;
                self.hierarchy.initFromTpm(buf)?;
                self.digest = buf.read_sized_bytes()?;
                Ok(())
            }
        }
    };
}

tpm_ticket! {
    /// Ticket proving a digest was computed by the TPM over data it did not find restricted
    TPMT_TK_HASHCHECK
}

tpm_ticket! {
    /// Ticket binding an object to its creation data
    TPMT_TK_CREATION
}
