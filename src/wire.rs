//! Low-level wire primitives shared by all packet codecs: 24-bit integers, the offline
//!  magic cookie, and RakNet's peer-address encoding.
//!
//! All reads are underrun-checked and fail with an error rather than panicking - a
//!  truncated datagram must never take down the engine (it is discarded by the caller).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use anyhow::bail;
use bytes::{Buf, BufMut};

/// The 16-byte cookie that marks a datagram as belonging to the offline (handshake) part
///  of the protocol.
pub const OFFLINE_MAGIC: [u8; 16] = [
    0x00, 0xff, 0xff, 0x00, 0xfe, 0xfe, 0xfe, 0xfe,
    0xfd, 0xfd, 0xfd, 0xfd, 0x12, 0x34, 0x56, 0x78,
];

/// All transport sequence numbers and per-mode frame indices are 24-bit counters.
pub const U24_MAX: u32 = 0x00ff_ffff;

/// Increment with wrap-around at 2^24, the counter width the wire format allows.
pub fn u24_next(value: u32) -> u32 {
    value.wrapping_add(1) & U24_MAX
}

pub trait RaknetBufExt: Buf {
    fn try_get_u24_le(&mut self) -> anyhow::Result<u32>;
    fn try_get_u24_be(&mut self) -> anyhow::Result<u32>;

    /// Consume and verify the 16-byte offline magic cookie.
    fn try_get_magic(&mut self) -> anyhow::Result<()>;

    fn try_get_address(&mut self) -> anyhow::Result<SocketAddr>;

    /// A string is length-prefixed with a u16 BE byte count, UTF-8 encoded.
    fn try_get_string(&mut self) -> anyhow::Result<String>;
}

impl<T: Buf> RaknetBufExt for T {
    fn try_get_u24_le(&mut self) -> anyhow::Result<u32> {
        let a = self.try_get_u8()? as u32;
        let b = self.try_get_u8()? as u32;
        let c = self.try_get_u8()? as u32;
        Ok(c << 16 | b << 8 | a)
    }

    fn try_get_u24_be(&mut self) -> anyhow::Result<u32> {
        let a = self.try_get_u8()? as u32;
        let b = self.try_get_u8()? as u32;
        let c = self.try_get_u8()? as u32;
        Ok(a << 16 | b << 8 | c)
    }

    fn try_get_magic(&mut self) -> anyhow::Result<()> {
        if self.remaining() < OFFLINE_MAGIC.len() {
            bail!("buffer too short for magic cookie");
        }
        let mut actual = [0u8; 16];
        self.copy_to_slice(&mut actual);
        if actual != OFFLINE_MAGIC {
            bail!("invalid magic cookie");
        }
        Ok(())
    }

    fn try_get_address(&mut self) -> anyhow::Result<SocketAddr> {
        let version = self.try_get_u8()?;
        if version != 4 {
            // The protocol family this engine interoperates with only ever puts IPv4
            //  addresses on the wire - see DESIGN.md.
            bail!("unsupported address version {} on the wire", version);
        }

        // The octets are stored bit-inverted - a protocol quirk that must be reproduced
        //  exactly for wire compatibility
        let a = 0xff - self.try_get_u8()?;
        let b = 0xff - self.try_get_u8()?;
        let c = 0xff - self.try_get_u8()?;
        let d = 0xff - self.try_get_u8()?;
        let port = self.try_get_u16()?;

        Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(a, b, c, d)), port))
    }

    fn try_get_string(&mut self) -> anyhow::Result<String> {
        let len = self.try_get_u16()? as usize;
        if self.remaining() < len {
            bail!("buffer too short for string of declared length {}", len);
        }
        let mut raw = vec![0u8; len];
        self.copy_to_slice(&mut raw);
        Ok(String::from_utf8(raw)?)
    }
}

pub trait RaknetBufMutExt: BufMut {
    fn put_u24_le(&mut self, value: u32);
    fn put_u24_be(&mut self, value: u32);
    fn put_magic(&mut self);
    fn put_address(&mut self, addr: SocketAddr) -> anyhow::Result<()>;
    fn put_string(&mut self, value: &str);
}

impl<T: BufMut> RaknetBufMutExt for T {
    fn put_u24_le(&mut self, value: u32) {
        self.put_u8((value & 0xff) as u8);
        self.put_u8(((value >> 8) & 0xff) as u8);
        self.put_u8(((value >> 16) & 0xff) as u8);
    }

    fn put_u24_be(&mut self, value: u32) {
        self.put_u8(((value >> 16) & 0xff) as u8);
        self.put_u8(((value >> 8) & 0xff) as u8);
        self.put_u8((value & 0xff) as u8);
    }

    fn put_magic(&mut self) {
        self.put_slice(&OFFLINE_MAGIC);
    }

    fn put_address(&mut self, addr: SocketAddr) -> anyhow::Result<()> {
        match addr.ip() {
            IpAddr::V4(ip) => {
                self.put_u8(4);
                for octet in ip.octets() {
                    self.put_u8(0xff - octet);
                }
                self.put_u16(addr.port());
                Ok(())
            }
            IpAddr::V6(_) => {
                bail!("IPv6 addresses cannot be encoded on the wire");
            }
        }
    }

    fn put_string(&mut self, value: &str) {
        self.put_u16(value.len() as u16);
        self.put_slice(value.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use rstest::rstest;

    #[rstest]
    #[case::zero(0, vec![0, 0, 0])]
    #[case::one(1, vec![1, 0, 0])]
    #[case::mid(0x123456, vec![0x56, 0x34, 0x12])]
    #[case::max(U24_MAX, vec![0xff, 0xff, 0xff])]
    fn test_u24_le(#[case] value: u32, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        buf.put_u24_le(value);
        assert_eq!(buf.as_ref(), expected.as_slice());

        let mut read: &[u8] = &buf;
        assert_eq!(read.try_get_u24_le().unwrap(), value);
    }

    #[rstest]
    #[case::zero(0, vec![0, 0, 0])]
    #[case::mid(0x123456, vec![0x12, 0x34, 0x56])]
    #[case::max(U24_MAX, vec![0xff, 0xff, 0xff])]
    fn test_u24_be(#[case] value: u32, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        buf.put_u24_be(value);
        assert_eq!(buf.as_ref(), expected.as_slice());

        let mut read: &[u8] = &buf;
        assert_eq!(read.try_get_u24_be().unwrap(), value);
    }

    #[test]
    fn test_u24_underrun() {
        let mut buf: &[u8] = &[1, 2];
        assert!(buf.try_get_u24_le().is_err());
    }

    #[rstest]
    #[case::zero(0, 1)]
    #[case::mid(17, 18)]
    #[case::wraparound(U24_MAX, 0)]
    fn test_u24_next(#[case] value: u32, #[case] expected: u32) {
        assert_eq!(u24_next(value), expected);
    }

    #[test]
    fn test_magic_roundtrip() {
        let mut buf = BytesMut::new();
        buf.put_magic();
        assert_eq!(buf.len(), 16);

        let mut read: &[u8] = &buf;
        read.try_get_magic().unwrap();
        assert!(read.is_empty());
    }

    #[test]
    fn test_magic_mismatch() {
        let mut tampered = OFFLINE_MAGIC;
        tampered[3] = 0x42;
        let mut read: &[u8] = &tampered;
        assert!(read.try_get_magic().is_err());
    }

    #[rstest]
    #[case::loopback(SocketAddr::from(([127, 0, 0, 1], 19132)),
        vec![4, 0xff - 127, 0xff, 0xff, 0xff - 1, 0x4a, 0xbc])]
    #[case::broadcast(SocketAddr::from(([255, 255, 255, 255], 19132)),
        vec![4, 0, 0, 0, 0, 0x4a, 0xbc])]
    #[case::zero(SocketAddr::from(([0, 0, 0, 0], 0)),
        vec![4, 0xff, 0xff, 0xff, 0xff, 0, 0])]
    fn test_address_encoding(#[case] addr: SocketAddr, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        buf.put_address(addr).unwrap();
        assert_eq!(buf.as_ref(), expected.as_slice());

        let mut read: &[u8] = &buf;
        assert_eq!(read.try_get_address().unwrap(), addr);
    }

    #[test]
    fn test_address_rejects_ipv6() {
        let mut buf = BytesMut::new();
        let addr = SocketAddr::from(([0, 0, 0, 0, 0, 0, 0, 1], 4));
        assert!(buf.put_address(addr).is_err());
    }

    #[test]
    fn test_address_rejects_unknown_version() {
        let mut read: &[u8] = &[6, 0, 0, 0, 0, 0, 0];
        assert!(read.try_get_address().is_err());
    }

    #[rstest]
    #[case::empty("")]
    #[case::ascii("A RakNet server")]
    #[case::utf8("höhenmeter")]
    fn test_string_roundtrip(#[case] value: &str) {
        let mut buf = BytesMut::new();
        buf.put_string(value);

        let mut read: &[u8] = &buf;
        assert_eq!(read.try_get_string().unwrap(), value);
        assert!(read.is_empty());
    }

    #[test]
    fn test_string_underrun() {
        let mut read: &[u8] = &[0, 5, b'a', b'b'];
        assert!(read.try_get_string().is_err());
    }
}
