//! The 1-byte datagram header and the small enums carried in a handful of
//! protocol-internal frame bodies (reject/disconnect reasons).
//!
//! Every datagram on the wire starts with one header byte whose low 4 bits
//! encode the `MessageHeader` kind; the high 4 bits are reserved and must
//! be zero on the wire (callers masking on decode, writing zero on encode).

use surge_binary::BinaryError;

/// The kind of a single datagram, carried in the low 4 bits of its header
/// byte. Headers 0 (`Unreliable`) and 10 (`Reliable`) deliver user
/// payloads; every other kind is protocol-internal and never surfaces to
/// the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageHeader {
    Unreliable = 0,
    Ack = 1,
    AckExtra = 2,
    Connect = 3,
    Reject = 4,
    Heartbeat = 5,
    Disconnect = 6,
    Welcome = 7,
    ClientConnected = 8,
    ClientDisconnected = 9,
    Reliable = 10,
}

impl MessageHeader {
    const KIND_MASK: u8 = 0x0F;

    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    #[inline]
    pub fn from_byte(byte: u8) -> Result<Self, BinaryError> {
        match byte & Self::KIND_MASK {
            0 => Ok(Self::Unreliable),
            1 => Ok(Self::Ack),
            2 => Ok(Self::AckExtra),
            3 => Ok(Self::Connect),
            4 => Ok(Self::Reject),
            5 => Ok(Self::Heartbeat),
            6 => Ok(Self::Disconnect),
            7 => Ok(Self::Welcome),
            8 => Ok(Self::ClientConnected),
            9 => Ok(Self::ClientDisconnected),
            10 => Ok(Self::Reliable),
            other => Err(BinaryError::InvalidData(format!(
                "unknown message header kind {other:#x}"
            ))),
        }
    }
}

/// Why a server rejected a pending connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RejectReason {
    /// The endpoint already has a connection; never sent on the wire
    /// (information-leak hardening — see `Server::reject`).
    AlreadyConnected = 0,
    ServerFull = 1,
    Rejected = 2,
    Custom = 3,
}

impl RejectReason {
    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    #[inline]
    pub fn from_byte(byte: u8) -> Result<Self, BinaryError> {
        match byte {
            0 => Ok(Self::AlreadyConnected),
            1 => Ok(Self::ServerFull),
            2 => Ok(Self::Rejected),
            3 => Ok(Self::Custom),
            other => Err(BinaryError::InvalidData(format!(
                "unknown reject reason {other}"
            ))),
        }
    }
}

/// Why a connection was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DisconnectReason {
    NeverConnected = 0,
    TransportError = 1,
    TimedOut = 2,
    Kicked = 3,
    ServerStopped = 4,
    Disconnected = 5,
}

impl DisconnectReason {
    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    #[inline]
    pub fn from_byte(byte: u8) -> Result<Self, BinaryError> {
        match byte {
            0 => Ok(Self::NeverConnected),
            1 => Ok(Self::TransportError),
            2 => Ok(Self::TimedOut),
            3 => Ok(Self::Kicked),
            4 => Ok(Self::ServerStopped),
            5 => Ok(Self::Disconnected),
            other => Err(BinaryError::InvalidData(format!(
                "unknown disconnect reason {other}"
            ))),
        }
    }

    /// Only `Kicked` carries an optional payload per the wire format.
    #[inline]
    pub fn carries_payload(self) -> bool {
        matches!(self, Self::Kicked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_through_low_nibble() {
        for kind in [
            MessageHeader::Unreliable,
            MessageHeader::Ack,
            MessageHeader::AckExtra,
            MessageHeader::Connect,
            MessageHeader::Reject,
            MessageHeader::Heartbeat,
            MessageHeader::Disconnect,
            MessageHeader::Welcome,
            MessageHeader::ClientConnected,
            MessageHeader::ClientDisconnected,
            MessageHeader::Reliable,
        ] {
            assert_eq!(MessageHeader::from_byte(kind.to_byte()).unwrap(), kind);
        }
    }

    #[test]
    fn header_ignores_reserved_high_nibble() {
        assert_eq!(
            MessageHeader::from_byte(0xF0 | MessageHeader::Reliable.to_byte()).unwrap(),
            MessageHeader::Reliable
        );
    }

    #[test]
    fn unknown_header_kind_is_rejected() {
        assert!(MessageHeader::from_byte(11).is_err());
    }

    #[test]
    fn only_kicked_carries_a_disconnect_payload() {
        assert!(DisconnectReason::Kicked.carries_payload());
        assert!(!DisconnectReason::TimedOut.carries_payload());
    }
}
