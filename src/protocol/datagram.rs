use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::protocol::protocol_data::ProtocolData;

pub const PROTOCOL_VERSION_1: u8 = 1;

/// Byte offset of the type field in an encoded frame. The dispatcher classifies frames
///  by peeking at this offset without a full decode.
pub const TYPE_INDEX: usize = 1;

pub const TYPE_HEARTBEAT: u8 = 0;
pub const TYPE_ACK: u8 = 2;

const FLAG_ACK_REQUIRED: u8 = 0x01;
const HEADER_LEN: usize = 8;

/// Decoded view over a framed message - all numbers in network byte order (BE):
///
/// ```ascii
/// 0:           version (u8)
/// 1:           type (u8): 0 heartbeat, 2 ACK, anything else business
/// 2:           flags (u8): bit 0 = the peer must acknowledge this datagram
/// 3:           id length (u8)
/// 4:           body length (u32)
/// 8:           id bytes (opaque; the retry queue is keyed by them verbatim)
/// 8 + idlen:   body
/// ```
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Datagram {
    pub version: u8,
    pub typ: u8,
    pub ack: bool,
    pub id: Bytes,
    pub body: Bytes,
}

impl Datagram {
    pub fn decode(mut buf: &[u8]) -> anyhow::Result<Datagram> {
        let version = buf.try_get_u8()?;
        if version != PROTOCOL_VERSION_1 {
            bail!("unsupported datagram version {}", version);
        }
        let typ = buf.try_get_u8()?;
        let flags = buf.try_get_u8()?;
        let id_len = buf.try_get_u8()? as usize;
        let body_len = buf.try_get_u32()? as usize;

        if buf.remaining() < id_len + body_len {
            bail!("truncated datagram: header announces {} id and {} body bytes, {} remain", id_len, body_len, buf.remaining());
        }

        let id = buf.copy_to_bytes(id_len);
        let body = buf.copy_to_bytes(body_len);

        Ok(Datagram {
            version,
            typ,
            ack: flags & FLAG_ACK_REQUIRED != 0,
            id,
            body,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        if self.id.len() > u8::MAX as usize {
            bail!("datagram id of {} bytes exceeds the id length field", self.id.len());
        }
        if self.body.len() > u32::MAX as usize {
            bail!("datagram body of {} bytes exceeds the body length field", self.body.len());
        }

        buf.put_u8(self.version);
        buf.put_u8(self.typ);
        buf.put_u8(if self.ack { FLAG_ACK_REQUIRED } else { 0 });
        buf.put_u8(self.id.len() as u8);
        buf.put_u32(self.body.len() as u32);
        buf.put_slice(&self.id);
        buf.put_slice(&self.body);
        Ok(())
    }
}

/// Heartbeat reply addressed to the channel a peer heartbeat arrived on. Heartbeats
///  carry no id and no body and are never acknowledged.
pub fn build_heartbeat(port: u16, remote_host: &str, channel_id: &str) -> ProtocolData {
    let mut buf = BytesMut::with_capacity(HEADER_LEN);
    buf.put_u8(PROTOCOL_VERSION_1);
    buf.put_u8(TYPE_HEARTBEAT);
    buf.put_u8(0);
    buf.put_u8(0);
    buf.put_u32(0);

    ProtocolData::new(buf.freeze(), port, remote_host, channel_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[rstest]
    #[case::heartbeat(b"\x01\x00\x00\x00\x00\x00\x00\x00", Some(Datagram {
        version: 1, typ: 0, ack: false, id: Bytes::new(), body: Bytes::new(),
    }))]
    #[case::ack_frame(b"\x01\x02\x00\x02\x00\x00\x00\x00m1", Some(Datagram {
        version: 1, typ: 2, ack: false, id: Bytes::from_static(b"m1"), body: Bytes::new(),
    }))]
    #[case::business_with_ack(b"\x01\x09\x01\x02\x00\x00\x00\x03m2abc", Some(Datagram {
        version: 1, typ: 9, ack: true, id: Bytes::from_static(b"m2"), body: Bytes::from_static(b"abc"),
    }))]
    #[case::ignores_other_flag_bits(b"\x01\x09\xfe\x00\x00\x00\x00\x00", Some(Datagram {
        version: 1, typ: 9, ack: false, id: Bytes::new(), body: Bytes::new(),
    }))]
    #[case::wrong_version(b"\x02\x00\x00\x00\x00\x00\x00\x00", None)]
    #[case::truncated_header(b"\x01\x09\x01", None)]
    #[case::truncated_id(b"\x01\x09\x01\x04\x00\x00\x00\x00m2", None)]
    #[case::truncated_body(b"\x01\x09\x01\x02\x00\x00\x00\x09m2abc", None)]
    #[case::empty(b"", None)]
    fn test_decode(#[case] buf: &[u8], #[case] expected: Option<Datagram>) {
        match Datagram::decode(buf) {
            Ok(actual) => assert_eq!(actual, expected.unwrap()),
            Err(e) => {
                println!("{}", e);
                assert!(expected.is_none());
            }
        }
    }

    #[rstest]
    #[case::no_trailing_bytes(b"\x01\x09\x01\x02\x00\x00\x00\x03m2abc")]
    #[case::trailing_bytes_ignored(b"\x01\x09\x01\x02\x00\x00\x00\x03m2abcXYZ")]
    fn test_decode_reads_announced_lengths(#[case] buf: &[u8]) {
        let datagram = Datagram::decode(buf).unwrap();
        assert_eq!(datagram.id, Bytes::from_static(b"m2"));
        assert_eq!(datagram.body, Bytes::from_static(b"abc"));
    }

    #[rstest]
    #[case::business(Datagram {
        version: 1, typ: 9, ack: true, id: Bytes::from_static(b"m1"), body: Bytes::from_static(b"payload"),
    }, b"\x01\x09\x01\x02\x00\x00\x00\x07m1payload".to_vec())]
    #[case::unacknowledged(Datagram {
        version: 1, typ: 5, ack: false, id: Bytes::from_static(b"x"), body: Bytes::new(),
    }, b"\x01\x05\x00\x01\x00\x00\x00\x00x".to_vec())]
    fn test_encode(#[case] datagram: Datagram, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        datagram.encode(&mut buf).unwrap();
        assert_eq!(buf.as_ref(), expected.as_slice());
    }

    #[test]
    fn test_encode_rejects_oversized_id() {
        let datagram = Datagram {
            version: 1,
            typ: 9,
            ack: true,
            id: Bytes::from(vec![0u8; 256]),
            body: Bytes::new(),
        };
        let mut buf = BytesMut::new();
        assert!(datagram.encode(&mut buf).is_err());
    }

    #[test]
    fn test_build_heartbeat() {
        let data = build_heartbeat(8080, "10.1.2.3", "c1");
        assert_eq!(data.port(), 8080);
        assert_eq!(data.remote_host(), "10.1.2.3");
        assert_eq!(data.channel(), "c1");
        assert_eq!(data.data()[TYPE_INDEX], TYPE_HEARTBEAT);

        let datagram = Datagram::decode(data.data()).unwrap();
        assert_eq!(datagram.typ, TYPE_HEARTBEAT);
        assert!(!datagram.ack);
        assert!(datagram.id.is_empty());
        assert!(datagram.body.is_empty());
    }
}
