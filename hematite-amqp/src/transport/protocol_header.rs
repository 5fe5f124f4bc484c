//! Implements the protocol header exchanged ahead of any frame

use std::convert::{TryFrom, TryInto};

use bytes::Bytes;

const PROTOCOL_HEADER_PREFIX: &[u8; 4] = b"AMQP";

/// Protocol header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolHeader {
    /// Protocol ID
    pub id: ProtocolId,

    /// Major number
    pub major: u8,

    /// Minor number
    pub minor: u8,

    /// Revision number
    pub revision: u8,
}

impl Default for ProtocolHeader {
    fn default() -> Self {
        Self {
            id: ProtocolId::Amqp,
            major: fe2o3_amqp_types::definitions::MAJOR,
            minor: fe2o3_amqp_types::definitions::MINOR,
            revision: fe2o3_amqp_types::definitions::REVISION,
        }
    }
}

impl ProtocolHeader {
    /// Creates a new protocol header
    pub fn new(id: ProtocolId, major: u8, minor: u8, revision: u8) -> Self {
        Self {
            id,
            major,
            minor,
            revision,
        }
    }

    /// Creates an AMQP protocol header
    pub fn amqp() -> Self {
        Self {
            id: ProtocolId::Amqp,
            ..Default::default()
        }
    }

    /// Creates a TLS protocol header
    pub fn tls() -> Self {
        Self {
            id: ProtocolId::Tls,
            ..Default::default()
        }
    }

    /// Creates a SASL protocol header
    pub fn sasl() -> Self {
        Self {
            id: ProtocolId::Sasl,
            ..Default::default()
        }
    }

    /// Whether the protocol id is AMQP
    pub fn is_amqp(&self) -> bool {
        matches!(self.id, ProtocolId::Amqp)
    }

    /// Whether the protocol id is TLS
    pub fn is_tls(&self) -> bool {
        matches!(self.id, ProtocolId::Tls)
    }

    /// Whether the protocol id is SASL
    pub fn is_sasl(&self) -> bool {
        matches!(self.id, ProtocolId::Sasl)
    }
}

impl From<ProtocolHeader> for [u8; 8] {
    fn from(value: ProtocolHeader) -> Self {
        [
            PROTOCOL_HEADER_PREFIX[0],
            PROTOCOL_HEADER_PREFIX[1],
            PROTOCOL_HEADER_PREFIX[2],
            PROTOCOL_HEADER_PREFIX[3],
            value.id as u8,
            value.major,
            value.minor,
            value.revision,
        ]
    }
}

impl From<ProtocolHeader> for Bytes {
    fn from(header: ProtocolHeader) -> Self {
        let bytes: [u8; 8] = header.into();
        Bytes::copy_from_slice(&bytes[..])
    }
}

impl TryFrom<[u8; 8]> for ProtocolHeader {
    type Error = [u8; 8];

    fn try_from(v: [u8; 8]) -> Result<Self, Self::Error> {
        if &v[..4] != PROTOCOL_HEADER_PREFIX {
            return Err(v);
        }
        let id = match v[4].try_into() {
            Ok(id) => id,
            Err(_) => return Err(v),
        };

        Ok(Self::new(id, v[5], v[6], v[7]))
    }
}

/// Protocol ID
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolId {
    /// AMQP
    Amqp = 0x0,

    /// TLS
    Tls = 0x2,

    /// SASL
    Sasl = 0x3,
}

impl TryFrom<u8> for ProtocolId {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let val = match value {
            0x0 => Self::Amqp,
            0x2 => Self::Tls,
            0x3 => Self::Sasl,
            _ => return Err(value),
        };
        Ok(val)
    }
}

#[cfg(test)]
mod tests {
    use super::{ProtocolHeader, ProtocolId};

    #[test]
    fn amqp_header_bytes() {
        let buf: [u8; 8] = ProtocolHeader::amqp().into();
        assert_eq!(buf, [b'A', b'M', b'Q', b'P', 0, 1, 0, 0]);
    }

    #[test]
    fn sasl_header_round_trip() {
        let buf: [u8; 8] = ProtocolHeader::sasl().into();
        let header = ProtocolHeader::try_from(buf).unwrap();
        assert_eq!(header.id, ProtocolId::Sasl);
    }

    #[test]
    fn garbage_header_is_rejected() {
        let buf = *b"HTTP/1.1";
        assert!(ProtocolHeader::try_from(buf).is_err());
    }
}
