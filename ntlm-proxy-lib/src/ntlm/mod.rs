//! NTLM message codec: Type1 negotiate, Type2 challenge parsing and Type3
//! authenticate construction.

pub mod flags;
mod hash;
mod message;
mod type2;

use std::fmt;

use thiserror::Error;

pub use message::{create_type1_message, create_type3_message, default_workstation, NtlmMessage, Type3Input};
pub use type2::{decode_type2_message, Encoding, Type2Message};

pub const NTLM_SIGNATURE: &[u8; 8] = b"NTLMSSP\0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NtlmVersion {
    V1,
    V2,
}

impl TryFrom<u64> for NtlmVersion {
    type Error = NtlmError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(NtlmVersion::V1),
            2 => Ok(NtlmVersion::V2),
            other => Err(NtlmError::UnsupportedVersion(other)),
        }
    }
}

impl fmt::Display for NtlmVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NtlmVersion::V1 => f.write_str("1"),
            NtlmVersion::V2 => f.write_str("2"),
        }
    }
}

#[derive(Debug, Error)]
pub enum NtlmError {
    #[error("NTLM message is truncated")]
    Truncated,

    #[error("NTLM message has an invalid signature")]
    InvalidSignature,

    #[error("Unexpected NTLM message type {0}")]
    UnexpectedMessageType(u32),

    #[error("Malformed NTLM Type2 message")]
    BadType2,

    #[error("Unsupported NTLM version {0}")]
    UnsupportedVersion(u64),

    #[error("Invalid base64 in NTLM header: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
}
