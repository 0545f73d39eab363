//! Application messages carried inside reassembled segments
//!
//! Outbound payload: `[op][item][data..]`.
//! Inbound notification: `[op][body..]` where a publish body is `[item][data..]`
//! and a response body is `[item][op][result][data..]`.

use crate::protocol::constants::{ItemCode, OpCode, ResultCode};
use crate::{PacketError, Result};

// ----------------------------------------------------------------------------
// Outbound Payload
// ----------------------------------------------------------------------------

/// Request sent from the host to the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    op_code: OpCode,
    item_code: ItemCode,
    data: Vec<u8>,
}

impl Payload {
    pub fn new(op_code: OpCode, item_code: ItemCode, data: impl Into<Vec<u8>>) -> Self {
        Self {
            op_code,
            item_code,
            data: data.into(),
        }
    }

    pub fn op_code(&self) -> OpCode {
        self.op_code
    }

    pub fn item_code(&self) -> ItemCode {
        self.item_code
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Encode with the two-byte header
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.data.len() + 2);
        bytes.push(self.op_code.as_u8());
        bytes.push(self.item_code.as_u8());
        bytes.extend_from_slice(&self.data);
        bytes
    }

    /// Decode a request, as the device sees it
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 2 {
            return Err(PacketError::PayloadTooSmall {
                expected: 2,
                actual: bytes.len(),
            }
            .into());
        }
        Ok(Self {
            op_code: OpCode::try_from(bytes[0])?,
            item_code: ItemCode::try_from(bytes[1])?,
            data: bytes[2..].to_vec(),
        })
    }
}

// ----------------------------------------------------------------------------
// Inbound Notifications
// ----------------------------------------------------------------------------

/// Unsolicited state report from the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub item_code: ItemCode,
    pub data: Vec<u8>,
}

/// Answer to a host request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub item_code: ItemCode,
    pub op_code: OpCode,
    pub result: ResultCode,
    pub data: Vec<u8>,
}

/// Message sent from the device to the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Publish(Publish),
    Response(Response),
}

impl Notification {
    pub fn publish(item_code: ItemCode, data: impl Into<Vec<u8>>) -> Self {
        Notification::Publish(Publish {
            item_code,
            data: data.into(),
        })
    }

    pub fn response(
        item_code: ItemCode,
        op_code: OpCode,
        result: ResultCode,
        data: impl Into<Vec<u8>>,
    ) -> Self {
        Notification::Response(Response {
            item_code,
            op_code,
            result,
            data: data.into(),
        })
    }

    pub fn item_code(&self) -> ItemCode {
        match self {
            Notification::Publish(p) => p.item_code,
            Notification::Response(r) => r.item_code,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (&op, body) = bytes.split_first().ok_or(PacketError::PayloadTooSmall {
            expected: 1,
            actual: 0,
        })?;

        match OpCode::try_from(op)? {
            OpCode::Publish => {
                let (&item, data) = body.split_first().ok_or(PacketError::PayloadTooSmall {
                    expected: 2,
                    actual: bytes.len(),
                })?;
                Ok(Notification::publish(ItemCode::try_from(item)?, data))
            }
            OpCode::Response => {
                if body.len() < 3 {
                    return Err(PacketError::PayloadTooSmall {
                        expected: 4,
                        actual: bytes.len(),
                    }
                    .into());
                }
                Ok(Notification::response(
                    ItemCode::try_from(body[0])?,
                    OpCode::try_from(body[1])?,
                    ResultCode::try_from(body[2])?,
                    &body[3..],
                ))
            }
            other => Err(PacketError::Generic {
                message: format!("op code {:?} is not a notification", other),
            }
            .into()),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Notification::Publish(p) => {
                let mut bytes = Vec::with_capacity(p.data.len() + 2);
                bytes.push(OpCode::Publish.as_u8());
                bytes.push(p.item_code.as_u8());
                bytes.extend_from_slice(&p.data);
                bytes
            }
            Notification::Response(r) => {
                let mut bytes = Vec::with_capacity(r.data.len() + 4);
                bytes.push(OpCode::Response.as_u8());
                bytes.push(r.item_code.as_u8());
                bytes.push(r.op_code.as_u8());
                bytes.push(r.result.as_u8());
                bytes.extend_from_slice(&r.data);
                bytes
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SesameError;

    #[test]
    fn test_payload_vendor_vector() {
        let payload = Payload::new(OpCode::Read, ItemCode::History, vec![1]);
        assert_eq!(hex::encode(payload.to_bytes()), "020401");
        assert_eq!(Payload::from_bytes(&hex::decode("020401").unwrap()).unwrap(), payload);
    }

    #[test]
    fn test_response_vendor_vector() {
        let notification = Notification::from_bytes(&hex::decode("07040205").unwrap()).unwrap();
        assert_eq!(
            notification,
            Notification::response(ItemCode::History, OpCode::Read, ResultCode::NotFound, vec![])
        );
        assert_eq!(hex::encode(notification.to_bytes()), "07040205");
    }

    #[test]
    fn test_publish_mech_status() {
        let bytes = hex::decode("08515d030080e6010002").unwrap();
        match Notification::from_bytes(&bytes).unwrap() {
            Notification::Publish(p) => {
                assert_eq!(p.item_code, ItemCode::MechStatus);
                assert_eq!(hex::encode(&p.data), "5d030080e6010002");
            }
            other => panic!("unexpected notification: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_notifications() {
        assert!(Notification::from_bytes(&[]).is_err());
        assert!(Notification::from_bytes(&[0x08]).is_err());
        assert!(Notification::from_bytes(&[0x07, 0x04, 0x02]).is_err());
        assert!(matches!(
            Notification::from_bytes(&[0x02, 0x04]),
            Err(SesameError::InvalidPacket(PacketError::Generic { .. }))
        ));
        assert!(Payload::from_bytes(&[0x02]).is_err());
    }
}
