use anyhow::{bail, ensure};
use bytes::{Buf, BufMut, BytesMut};
use std::io::{Error, ErrorKind};
use tokio_util::codec::Decoder;

/// Every message starts with this fixed header. The layout below is the
/// compatibility contract, all fields little-endian with the padding made
/// explicit:
///
/// ```text
/// offset 0   u16  type
/// offset 2   [2]  zero padding
/// offset 4   u32  payload_size   bytes of payload following the header
/// offset 8   u32  piece_index    meaningful only in PieceRes
/// ```
pub const HEADER_LEN: usize = 12;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MessageType {
    MetaReq = 1,
    MetaRes = 2,
    PieceReq = 3,
    PieceRes = 4,
    // interface already serving another transfer, try another neighbor
    BusyRes = 5,
    // peer has zero pieces, retry later
    NotAvailRes = 6,
}

impl TryFrom<u16> for MessageType {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        use MessageType::*;
        match value {
            1 => Ok(MetaReq),
            2 => Ok(MetaRes),
            3 => Ok(PieceReq),
            4 => Ok(PieceRes),
            5 => Ok(BusyRes),
            6 => Ok(NotAvailRes),
            _ => Err(Error::new(ErrorKind::InvalidData, "invalid message type")),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Header {
    pub typ: MessageType,
    pub payload_size: u32,
    pub piece_index: u32,
}

impl Header {
    pub fn new(typ: MessageType, payload_size: u32, piece_index: u32) -> Self {
        Self {
            typ,
            payload_size,
            piece_index,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0..2].copy_from_slice(&(self.typ as u16).to_le_bytes());
        // bytes 2..4 stay zero
        bytes[4..8].copy_from_slice(&self.payload_size.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.piece_index.to_le_bytes());
        bytes
    }

    pub fn decode(bytes: [u8; HEADER_LEN]) -> anyhow::Result<Self> {
        let typ = u16::from_le_bytes([bytes[0], bytes[1]]).try_into()?;
        let payload_size = u32::from_le_bytes(bytes[4..8].try_into().expect("4 bytes"));
        let piece_index = u32::from_le_bytes(bytes[8..12].try_into().expect("4 bytes"));
        Ok(Self {
            typ,
            payload_size,
            piece_index,
        })
    }
}

const SINGLE_PIECE: u32 = 1 << 0;
const PIECE_RANGE: u32 = 1 << 1;
const PIECE_LIST: u32 = 1 << 2;

/// Body of a `PieceReq` message: any combination of one index, inclusive
/// `(start, end)` ranges and an explicit index list. The server walks the
/// pieces in exactly this declared order. Encoded as a `u32` flag word
/// followed by `u64` fields, everything little-endian.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct PieceRequest {
    pub single: Option<u64>,
    pub ranges: Vec<(u64, u64)>,
    pub pieces: Vec<u64>,
}

impl PieceRequest {
    /// Request covering every piece of an `n`-piece file in one range.
    pub fn full_range(n: u64) -> Self {
        Self {
            ranges: vec![(0, n - 1)],
            ..Self::default()
        }
    }

    /// Piece indices in declared order: single, then each range left to
    /// right inclusive, then the list.
    pub fn indices(&self) -> impl Iterator<Item = u64> + '_ {
        self.single
            .into_iter()
            .chain(self.ranges.iter().flat_map(|&(start, end)| start..=end))
            .chain(self.pieces.iter().copied())
    }

    /// How many piece responses this request asks for.
    pub fn count(&self) -> u64 {
        let in_ranges: u64 = self
            .ranges
            .iter()
            .map(|&(start, end)| end - start + 1)
            .sum();
        self.single.is_some() as u64 + in_ranges + self.pieces.len() as u64
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut types = 0u32;
        if self.single.is_some() {
            types |= SINGLE_PIECE;
        }
        if !self.ranges.is_empty() {
            types |= PIECE_RANGE;
        }
        if !self.pieces.is_empty() {
            types |= PIECE_LIST;
        }

        let mut buf = BytesMut::with_capacity(4 + 8 + self.ranges.len() * 16 + self.pieces.len() * 8);
        buf.put_u32_le(types);
        if let Some(index) = self.single {
            buf.put_u64_le(index);
        }
        if !self.ranges.is_empty() {
            buf.put_u64_le(self.ranges.len() as u64);
            for &(start, end) in &self.ranges {
                buf.put_u64_le(start);
                buf.put_u64_le(end);
            }
        }
        if !self.pieces.is_empty() {
            buf.put_u64_le(self.pieces.len() as u64);
            for &piece in &self.pieces {
                buf.put_u64_le(piece);
            }
        }
        buf.to_vec()
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<Self> {
        let mut buf = data;
        ensure!(buf.remaining() >= 4, "piece request too short for flag word");
        let types = buf.get_u32_le();
        ensure!(
            types & !(SINGLE_PIECE | PIECE_RANGE | PIECE_LIST) == 0,
            "unknown piece request flags: {types:#x}"
        );

        let mut request = Self::default();
        if types & SINGLE_PIECE != 0 {
            ensure!(buf.remaining() >= 8, "piece request truncated at single index");
            request.single = Some(buf.get_u64_le());
        }
        if types & PIECE_RANGE != 0 {
            ensure!(buf.remaining() >= 8, "piece request truncated at range count");
            let count = buf.get_u64_le();
            ensure!(
                buf.remaining() as u64 >= count.saturating_mul(16),
                "piece request truncated inside ranges"
            );
            for _ in 0..count {
                let start = buf.get_u64_le();
                let end = buf.get_u64_le();
                request.ranges.push((start, end));
            }
        }
        if types & PIECE_LIST != 0 {
            ensure!(buf.remaining() >= 8, "piece request truncated at list count");
            let count = buf.get_u64_le();
            ensure!(
                buf.remaining() as u64 >= count.saturating_mul(8),
                "piece request truncated inside list"
            );
            for _ in 0..count {
                request.pieces.push(buf.get_u64_le());
            }
        }
        if buf.has_remaining() {
            bail!("{} trailing bytes after piece request", buf.remaining());
        }
        Ok(request)
    }
}

/// One framed inbound request: the header plus its declared payload. Piece
/// payloads never pass through here; responses are written raw so piece
/// bytes go out straight from the storage mapping.
#[derive(Debug)]
pub struct RequestFrame {
    pub header: Header,
    pub payload: Vec<u8>,
}

/// Frames inbound requests on a serving connection.
#[derive(Debug, Default)]
pub struct RequestFramer;

// Request payloads are tiny (metadata requests are empty, piece requests a
// few hundred bytes); anything above this is a corrupt or hostile stream.
const MAX_REQUEST_PAYLOAD: usize = 1 << 16;

impl Decoder for RequestFramer {
    type Item = RequestFrame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            // Not enough data to read the header.
            return Ok(None);
        }

        let mut header_bytes = [0u8; HEADER_LEN];
        header_bytes.copy_from_slice(&src[..HEADER_LEN]);
        let header = Header::decode(header_bytes)
            .map_err(|e| Error::new(ErrorKind::InvalidData, e.to_string()))?;

        let payload_size = header.payload_size as usize;
        if payload_size > MAX_REQUEST_PAYLOAD {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("request payload of {payload_size} bytes is too large"),
            ));
        }

        if src.len() < HEADER_LEN + payload_size {
            // The full payload has not yet arrived; reserving is not strictly
            // necessary but saves reallocation.
            src.reserve(HEADER_LEN + payload_size - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src[..payload_size].to_vec();
        src.advance(payload_size);
        Ok(Some(RequestFrame { header, payload }))
    }
}

#[test]
fn header_round_trip() {
    let header = Header::new(MessageType::PieceRes, 16384, 7);
    let bytes = header.encode();
    assert_eq!(bytes.len(), HEADER_LEN);
    assert_eq!(Header::decode(bytes).unwrap(), header);
}

#[test]
fn header_layout_is_fixed() {
    let bytes = Header::new(MessageType::MetaRes, 0x01020304, 0x0a0b0c0d).encode();
    assert_eq!(&bytes[..4], &[2, 0, 0, 0]);
    assert_eq!(&bytes[4..8], &[0x04, 0x03, 0x02, 0x01]);
    assert_eq!(&bytes[8..], &[0x0d, 0x0c, 0x0b, 0x0a]);
}

#[test]
fn header_rejects_unknown_type() {
    let mut bytes = Header::new(MessageType::MetaReq, 0, 0).encode();
    bytes[0] = 99;
    assert!(Header::decode(bytes).is_err());
}

#[test]
fn piece_request_round_trips_every_combination() {
    let single = Some(3u64);
    let ranges = vec![(0u64, 4u64), (9, 9)];
    let pieces = vec![17u64, 2, 5];
    for mask in 1..8u8 {
        let request = PieceRequest {
            single: (mask & 1 != 0).then_some(single.unwrap()),
            ranges: if mask & 2 != 0 { ranges.clone() } else { Vec::new() },
            pieces: if mask & 4 != 0 { pieces.clone() } else { Vec::new() },
        };
        let decoded = PieceRequest::decode(&request.encode()).unwrap();
        assert_eq!(decoded, request);
    }
}

#[test]
fn piece_request_walk_is_declared_order() {
    let request = PieceRequest {
        single: Some(9),
        ranges: vec![(0, 2), (5, 6)],
        pieces: vec![12, 4],
    };
    let walk: Vec<u64> = request.indices().collect();
    assert_eq!(walk, vec![9, 0, 1, 2, 5, 6, 12, 4]);
    assert_eq!(request.count(), walk.len() as u64);
}

#[test]
fn piece_request_rejects_truncated_input() {
    let encoded = PieceRequest::full_range(10).encode();
    assert!(PieceRequest::decode(&encoded[..encoded.len() - 3]).is_err());
    assert!(PieceRequest::decode(&[]).is_err());
}

#[test]
fn framer_waits_for_full_frame() {
    let mut framer = RequestFramer;
    let request = PieceRequest::full_range(3).encode();
    let header = Header::new(MessageType::PieceReq, request.len() as u32, 0);

    let mut buf = BytesMut::new();
    buf.extend_from_slice(&header.encode()[..6]);
    assert!(framer.decode(&mut buf).unwrap().is_none());

    buf.extend_from_slice(&header.encode()[6..]);
    buf.extend_from_slice(&request[..2]);
    assert!(framer.decode(&mut buf).unwrap().is_none());

    buf.extend_from_slice(&request[2..]);
    let frame = framer.decode(&mut buf).unwrap().unwrap();
    assert_eq!(frame.header, header);
    assert_eq!(PieceRequest::decode(&frame.payload).unwrap(), PieceRequest::full_range(3));
    assert!(buf.is_empty());
}

#[test]
fn framer_rejects_oversized_payload() {
    let mut framer = RequestFramer;
    let header = Header::new(MessageType::PieceReq, (MAX_REQUEST_PAYLOAD + 1) as u32, 0);
    let mut buf = BytesMut::from(&header.encode()[..]);
    assert!(framer.decode(&mut buf).is_err());
}
