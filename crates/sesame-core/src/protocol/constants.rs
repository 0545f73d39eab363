//! Protocol code tables
//!
//! Byte values are fixed by the device firmware.

use serde::{Deserialize, Serialize};

use crate::errors::PacketError;

// ----------------------------------------------------------------------------
// Code Table Macro
// ----------------------------------------------------------------------------

macro_rules! code_table {
    ($(#[$meta:meta])* $name:ident, $err:ident, $field:ident { $($variant:ident = $value:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[repr(u8)]
        pub enum $name {
            $($variant = $value),+
        }

        impl $name {
            /// Wire byte for this code
            pub fn as_u8(self) -> u8 {
                self as u8
            }
        }

        impl TryFrom<u8> for $name {
            type Error = PacketError;

            fn try_from(value: u8) -> Result<Self, Self::Error> {
                match value {
                    $($value => Ok($name::$variant),)+
                    other => Err(PacketError::$err { $field: other }),
                }
            }
        }

        impl From<$name> for u8 {
            fn from(code: $name) -> u8 {
                code as u8
            }
        }
    };
}

// ----------------------------------------------------------------------------
// Op Codes
// ----------------------------------------------------------------------------

code_table! {
    /// Operation requested or reported by a message
    OpCode, UnknownOpCode, op_code {
        Create = 1,
        Read = 2,
        Update = 3,
        Delete = 4,
        Sync = 5,
        Async = 6,
        Response = 7,
        Publish = 8,
        Undefine = 16,
    }
}

// ----------------------------------------------------------------------------
// Item Codes
// ----------------------------------------------------------------------------

code_table! {
    /// Object a message operates on
    ItemCode, UnknownItemCode, item_code {
        None = 0,
        Registration = 1,
        Login = 2,
        User = 3,
        History = 4,
        VersionTag = 5,
        DisconnectRebootNow = 6,
        EnableDfu = 7,
        Time = 8,
        BleConnectionParam = 9,
        BleAdvParam = 10,
        Autolock = 11,
        ServerAdvKick = 12,
        SsmToken = 13,
        Initial = 14,
        Irer = 15,
        TimePhone = 16,
        MechSetting = 80,
        MechStatus = 81,
        Lock = 82,
        Unlock = 83,
        MoveTo = 84,
        DriveDirection = 85,
        Stop = 86,
        DetectDir = 87,
        Toggle = 88,
        Click = 89,
    }
}

// ----------------------------------------------------------------------------
// Result Codes
// ----------------------------------------------------------------------------

code_table! {
    /// Outcome reported in a response
    ResultCode, UnknownResultCode, result_code {
        Success = 0,
        InvalidFormat = 1,
        NotSupported = 2,
        StorageFail = 3,
        InvalidSig = 4,
        NotFound = 5,
        Unknown = 6,
        Busy = 7,
        InvalidParam = 8,
    }
}

impl ResultCode {
    pub fn is_success(self) -> bool {
        self == ResultCode::Success
    }
}

// ----------------------------------------------------------------------------
// Segment Types
// ----------------------------------------------------------------------------

/// Encryption state of a complete message, carried by its final segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SegmentType {
    Plaintext,
    Ciphertext,
}

impl SegmentType {
    /// Value stored in header bits 1..7 of the final segment
    pub fn header_bits(self) -> u8 {
        match self {
            SegmentType::Plaintext => 1,
            SegmentType::Ciphertext => 2,
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_values() {
        assert_eq!(OpCode::Undefine.as_u8(), 16);
        assert_eq!(ItemCode::Click.as_u8(), 89);
        assert_eq!(ItemCode::Initial.as_u8(), 14);
        assert_eq!(ResultCode::InvalidParam.as_u8(), 8);
    }

    #[test]
    fn test_unknown_codes_rejected() {
        assert_eq!(
            OpCode::try_from(9),
            Err(PacketError::UnknownOpCode { op_code: 9 })
        );
        assert_eq!(
            ItemCode::try_from(17),
            Err(PacketError::UnknownItemCode { item_code: 17 })
        );
        assert!(ResultCode::try_from(9).is_err());
        assert_eq!(ItemCode::try_from(81), Ok(ItemCode::MechStatus));
    }
}
