//! TCP-specific address extension carried in the extension payload of a
//! BEGIN frame: the source and destination addresses of the socket that
//! triggered the stream.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AddressExtensionError {
    #[error("extension too short")]
    Truncated,
    #[error("unsupported address family {0}")]
    UnsupportedFamily(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpAddressExtension {
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

impl TcpAddressExtension {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 * (1 + 16 + 2));
        encode_addr(&mut out, self.local);
        encode_addr(&mut out, self.remote);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, AddressExtensionError> {
        let mut cursor = bytes;
        let local = decode_addr(&mut cursor)?;
        let remote = decode_addr(&mut cursor)?;
        Ok(Self { local, remote })
    }
}

fn encode_addr(out: &mut Vec<u8>, addr: SocketAddr) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            out.push(4);
            out.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            out.push(6);
            out.extend_from_slice(&ip.octets());
        }
    }
    out.extend_from_slice(&addr.port().to_le_bytes());
}

fn decode_addr(cursor: &mut &[u8]) -> Result<SocketAddr, AddressExtensionError> {
    let (&family, rest) = cursor.split_first().ok_or(AddressExtensionError::Truncated)?;
    match family {
        4 => {
            if rest.len() < 4 + 2 {
                return Err(AddressExtensionError::Truncated);
            }
            let ip = Ipv4Addr::new(rest[0], rest[1], rest[2], rest[3]);
            let port = u16::from_le_bytes([rest[4], rest[5]]);
            *cursor = &rest[6..];
            Ok(SocketAddr::new(IpAddr::V4(ip), port))
        }
        6 => {
            if rest.len() < 16 + 2 {
                return Err(AddressExtensionError::Truncated);
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&rest[..16]);
            let port = u16::from_le_bytes([rest[16], rest[17]]);
            *cursor = &rest[18..];
            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        other => Err(AddressExtensionError::UnsupportedFamily(other)),
    }
}
