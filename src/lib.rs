pub mod barrier;
pub mod connection;
pub mod floodclone;
pub mod metadata;
pub mod pool;
pub mod storage;
pub mod topology;
pub mod wire;

/// Default piece size, 16384 (16kb). Configurable per run but must agree
/// fleet-wide: the metadata does not carry it.
pub const PIECE_SIZE: usize = 1 << 14;

/// Default TCP port for metadata and piece traffic.
pub const DATA_PORT: u16 = 9089;

/// Default TCP port for the completion barrier side channel.
pub const COMPLETION_PORT: u16 = 9090;
