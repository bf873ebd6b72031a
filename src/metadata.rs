use anyhow::{Context, bail, ensure};
use bytes::{Buf, BufMut, BytesMut};
use std::net::Ipv4Addr;

/// Fixed width of one source address on the wire: a dotted-quad IPv4
/// string, NUL-padded to the longest possible form ("255.255.255.255").
pub const SOURCE_ADDR_LEN: usize = 15;

/// Per-piece entry of the file metadata: the addresses known to have the
/// piece, and an optional hex checksum (receivers carry it but do not
/// verify it).
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct PieceInfo {
    pub sources: Vec<[u8; SOURCE_ADDR_LEN]>,
    pub checksum: String,
}

/// Immutable descriptor of the file being distributed, produced once on the
/// source and replicated to every destination on its first metadata request.
///
/// Serialized as length-prefixed binary: `u64` little-endian lengths before
/// `file_id` and `filename`, then `file_size` and `num_pieces`, then one
/// length-prefixed inner payload per piece holding `u64 src_count`,
/// `src_count × 15` address bytes and a length-prefixed checksum.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FileMetadata {
    pub file_id: String,
    pub filename: String,
    pub file_size: u64,
    pub num_pieces: u64,
    pub pieces: Vec<PieceInfo>,
}

pub fn source_addr(ip: Ipv4Addr) -> [u8; SOURCE_ADDR_LEN] {
    let text = ip.to_string();
    let mut field = [0u8; SOURCE_ADDR_LEN];
    field[..text.len()].copy_from_slice(text.as_bytes());
    field
}

pub fn parse_source_addr(field: &[u8; SOURCE_ADDR_LEN]) -> anyhow::Result<Ipv4Addr> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(SOURCE_ADDR_LEN);
    std::str::from_utf8(&field[..end])
        .context("source address is not ASCII")?
        .parse()
        .context("source address is not a dotted-quad IPv4 address")
}

fn put_prefixed(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u64_le(data.len() as u64);
    buf.put_slice(data);
}

fn get_prefixed(buf: &mut &[u8]) -> anyhow::Result<Vec<u8>> {
    ensure!(buf.remaining() >= 8, "metadata truncated at length prefix");
    let len = buf.get_u64_le() as usize;
    ensure!(buf.remaining() >= len, "metadata truncated inside field");
    let data = buf[..len].to_vec();
    buf.advance(len);
    Ok(data)
}

fn get_string(buf: &mut &[u8]) -> anyhow::Result<String> {
    String::from_utf8(get_prefixed(buf)?).context("metadata string is not UTF-8")
}

impl FileMetadata {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        put_prefixed(&mut buf, self.file_id.as_bytes());
        put_prefixed(&mut buf, self.filename.as_bytes());
        buf.put_u64_le(self.file_size);
        buf.put_u64_le(self.num_pieces);
        for piece in &self.pieces {
            let mut inner = BytesMut::new();
            inner.put_u64_le(piece.sources.len() as u64);
            for source in &piece.sources {
                inner.put_slice(source);
            }
            put_prefixed(&mut inner, piece.checksum.as_bytes());
            put_prefixed(&mut buf, &inner);
        }
        buf.to_vec()
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<Self> {
        let mut buf = data;
        let file_id = get_string(&mut buf)?;
        let filename = get_string(&mut buf)?;
        ensure!(buf.remaining() >= 16, "metadata truncated at sizes");
        let file_size = buf.get_u64_le();
        let num_pieces = buf.get_u64_le();

        // Every piece needs at least its three length words, so this bounds
        // the allocation against a corrupt count.
        ensure!(
            num_pieces <= data.len() as u64 / 8,
            "metadata declares {num_pieces} pieces in {} bytes",
            data.len()
        );

        let mut pieces = Vec::with_capacity(num_pieces as usize);
        for _ in 0..num_pieces {
            let inner = get_prefixed(&mut buf)?;
            let mut inner = inner.as_slice();

            ensure!(inner.remaining() >= 8, "piece entry truncated at source count");
            let src_count = inner.get_u64_le() as usize;
            ensure!(
                inner.remaining() >= src_count.saturating_mul(SOURCE_ADDR_LEN),
                "piece entry truncated inside sources"
            );
            let mut sources = Vec::with_capacity(src_count);
            for _ in 0..src_count {
                let mut field = [0u8; SOURCE_ADDR_LEN];
                field.copy_from_slice(&inner[..SOURCE_ADDR_LEN]);
                inner.advance(SOURCE_ADDR_LEN);
                sources.push(field);
            }
            let checksum = get_string(&mut inner)?;
            if inner.has_remaining() {
                bail!("{} trailing bytes in piece entry", inner.remaining());
            }
            pieces.push(PieceInfo { sources, checksum });
        }
        if buf.has_remaining() {
            bail!("{} trailing bytes after metadata", buf.remaining());
        }
        ensure!(
            pieces.len() as u64 == num_pieces,
            "metadata piece entries disagree with num_pieces"
        );
        Ok(Self {
            file_id,
            filename,
            file_size,
            num_pieces,
            pieces,
        })
    }
}

#[test]
fn source_addr_round_trip() {
    for ip in ["10.0.0.1", "255.255.255.255", "1.2.3.4"] {
        let ip: Ipv4Addr = ip.parse().unwrap();
        assert_eq!(parse_source_addr(&source_addr(ip)).unwrap(), ip);
    }
}

#[test]
fn metadata_round_trip() {
    let src = source_addr("10.0.0.2".parse().unwrap());
    let relay = source_addr("10.0.1.7".parse().unwrap());
    let metadata = FileMetadata {
        file_id: "ab12".to_string(),
        filename: "payload.bin".to_string(),
        file_size: 40_000,
        num_pieces: 3,
        pieces: vec![
            PieceInfo { sources: vec![src], checksum: "d4c1".to_string() },
            PieceInfo { sources: vec![src, relay], checksum: String::new() },
            PieceInfo { sources: Vec::new(), checksum: "77".to_string() },
        ],
    };
    let decoded = FileMetadata::decode(&metadata.encode()).unwrap();
    assert_eq!(decoded, metadata);
}

#[test]
fn metadata_rejects_truncation() {
    let metadata = FileMetadata {
        file_id: "id".to_string(),
        filename: "f".to_string(),
        file_size: 10,
        num_pieces: 1,
        pieces: vec![PieceInfo::default()],
    };
    let encoded = metadata.encode();
    for cut in [1, 8, encoded.len() - 1] {
        assert!(FileMetadata::decode(&encoded[..cut]).is_err());
    }
}
