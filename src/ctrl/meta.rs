use std::fmt;

use thiserror::Error;

use crate::rdma::gid::Gid;
use crate::rdma::mr::MrRemote;
use crate::rdma::qp::QpPeer;
use crate::rdma::type_alias::*;

/// Peer metadata that cannot be used to connect to.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetadataError {
    #[error("peer reported QP number 0")]
    ZeroQpn,

    #[error("peer reported an all-zero GID while GID routing is enabled")]
    ZeroGid,

    #[error("peer reported LID 0 while LID routing is enabled")]
    ZeroLid,
}

/// Everything one side tells the other to set up an RC connection and grant
/// it RDMA access to its buffer.
///
/// On the wire this is a fixed 34-byte record, multi-byte fields in network
/// byte order:
///
/// | offset | size | field  |
/// |--------|------|--------|
/// | 0      | 8    | addr   |
/// | 8      | 4    | rkey   |
/// | 12     | 4    | qp_num |
/// | 16     | 2    | lid    |
/// | 18     | 16   | gid    |
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ConnMeta {
    /// Start address of the buffer.
    pub addr: u64,

    /// Remote key of the buffer.
    pub rkey: RKey,

    /// Queue pair number.
    pub qp_num: Qpn,

    /// Port LID.
    pub lid: Lid,

    /// Port GID, all-zero if GID routing is off.
    pub gid: Gid,
}

impl fmt::Debug for ConnMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnMeta")
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("rkey", &format_args!("{:#x}", self.rkey))
            .field("qp_num", &format_args!("{:#x}", self.qp_num))
            .field("lid", &format_args!("{:#x}", self.lid))
            .field("gid", &self.gid)
            .finish()
    }
}

impl ConnMeta {
    /// Size of the encoded record.
    pub const WIRE_SIZE: usize = 34;

    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..8].copy_from_slice(&self.addr.to_be_bytes());
        buf[8..12].copy_from_slice(&self.rkey.to_be_bytes());
        buf[12..16].copy_from_slice(&self.qp_num.to_be_bytes());
        buf[16..18].copy_from_slice(&self.lid.to_be_bytes());
        buf[18..34].copy_from_slice(self.gid.as_bytes());
        buf
    }

    pub fn decode(buf: &[u8; Self::WIRE_SIZE]) -> Self {
        let mut addr = [0u8; 8];
        let mut rkey = [0u8; 4];
        let mut qp_num = [0u8; 4];
        let mut lid = [0u8; 2];
        let mut gid = [0u8; 16];
        addr.copy_from_slice(&buf[0..8]);
        rkey.copy_from_slice(&buf[8..12]);
        qp_num.copy_from_slice(&buf[12..16]);
        lid.copy_from_slice(&buf[16..18]);
        gid.copy_from_slice(&buf[18..34]);
        Self {
            addr: u64::from_be_bytes(addr),
            rkey: u32::from_be_bytes(rkey),
            qp_num: u32::from_be_bytes(qp_num),
            lid: u16::from_be_bytes(lid),
            gid: Gid(gid),
        }
    }

    /// Check that a connection can be attempted with this metadata, routing
    /// by GID if `gid_routing` is set and by LID otherwise.
    pub fn validate(&self, gid_routing: bool) -> Result<(), MetadataError> {
        if self.qp_num == 0 {
            return Err(MetadataError::ZeroQpn);
        }
        if gid_routing && self.gid.is_zero() {
            return Err(MetadataError::ZeroGid);
        }
        if !gid_routing && self.lid == 0 {
            return Err(MetadataError::ZeroLid);
        }
        Ok(())
    }

    /// Get the queue pair addressing part.
    pub fn peer(&self) -> QpPeer {
        QpPeer {
            qp_num: self.qp_num,
            lid: self.lid,
            gid: self.gid,
        }
    }

    /// Get the buffer part, with the given length.
    pub fn remote_mem(&self, len: usize) -> MrRemote {
        MrRemote::new(self.addr, len, self.rkey)
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv6Addr;

    use super::*;

    fn sample() -> ConnMeta {
        ConnMeta {
            addr: 0x0102_0304_0506_0708,
            rkey: 0x1122_3344,
            qp_num: 0x0000_0abc,
            lid: 0x0007,
            gid: Gid::from("fe80::7".parse::<Ipv6Addr>().unwrap()),
        }
    }

    #[test]
    fn layout_is_big_endian() {
        let buf = sample().encode();
        assert_eq!(&buf[0..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&buf[8..12], &[0x11, 0x22, 0x33, 0x44]);
        assert_eq!(&buf[12..16], &[0, 0, 0x0a, 0xbc]);
        assert_eq!(&buf[16..18], &[0, 7]);
        assert_eq!(&buf[18..20], &[0xfe, 0x80]);
        assert_eq!(buf[33], 7);
        assert_eq!(ConnMeta::decode(&buf), sample());
    }

    #[test]
    fn zero_gid_survives_the_wire() {
        let meta = ConnMeta {
            gid: Gid::ZERO,
            ..sample()
        };
        let buf = meta.encode();
        assert!(buf[18..].iter().all(|&b| b == 0));
        assert!(ConnMeta::decode(&buf).gid.is_zero());
    }

    #[test]
    fn validation() {
        let meta = sample();
        assert_eq!(meta.validate(false), Ok(()));
        assert_eq!(meta.validate(true), Ok(()));

        let no_qp = ConnMeta { qp_num: 0, ..meta };
        assert_eq!(no_qp.validate(false), Err(MetadataError::ZeroQpn));

        let no_gid = ConnMeta { gid: Gid::ZERO, ..meta };
        assert_eq!(no_gid.validate(true), Err(MetadataError::ZeroGid));
        assert_eq!(no_gid.validate(false), Ok(()));

        let no_lid = ConnMeta { lid: 0, ..meta };
        assert_eq!(no_lid.validate(false), Err(MetadataError::ZeroLid));
        assert_eq!(no_lid.validate(true), Ok(()));
    }
}
