use crate::metadata::{self, FileMetadata, PieceInfo};
use crate::pool::WorkerPool;
use anyhow::{Context, bail, ensure};
use memmap2::{Mmap, MmapMut};
use sha1::{Digest, Sha1};
use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::net::Ipv4Addr;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::Notify;
use tracing::{debug, warn};

struct ArenaCell(UnsafeCell<MmapMut>);

// Safety: the arena only ever hands out one writable slot per piece region
// (enforced by the claim flags), regions are disjoint, and readers touch a
// region only after its status flip.
unsafe impl Sync for ArenaCell {}

/// Pre-sized shared-writable mapping a destination reconstructs the file
/// into. Writable access is index-based: `claim` yields at most one
/// `PieceSlot` per piece over the arena's lifetime.
struct PieceArena {
    map: ArenaCell,
    piece_size: usize,
    claims: Vec<AtomicBool>,
}

impl PieceArena {
    fn new(map: MmapMut, piece_size: usize, num_pieces: usize) -> Self {
        Self {
            map: ArenaCell(UnsafeCell::new(map)),
            piece_size,
            claims: (0..num_pieces).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    fn region_ptr(&self, index: usize) -> *mut u8 {
        let map = self.map.0.get();
        // Safety: the mapping is piece-aligned and `index` is bounds-checked
        // by `claims` indexing before any caller gets here.
        unsafe { (*map).as_mut_ptr().add(index * self.piece_size) }
    }

    fn claim(&self, index: usize) -> Option<PieceSlot<'_>> {
        self.claims[index]
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
            .then(|| PieceSlot {
                arena: self,
                index,
                committed: false,
            })
    }

    fn piece(&self, index: usize) -> &[u8] {
        assert!(index < self.claims.len());
        // Safety: disjoint-region discipline, see ArenaCell.
        unsafe { std::slice::from_raw_parts(self.region_ptr(index), self.piece_size) }
    }

    fn flush(&self) -> std::io::Result<()> {
        // Safety: flush only reads the mapping's bookkeeping.
        unsafe { (*self.map.0.get()).flush() }
    }
}

/// Writable view of one piece's region, received into directly by the wire
/// layer. Dropping a slot without committing releases the claim so the
/// piece can be fetched again.
pub struct PieceSlot<'a> {
    arena: &'a PieceArena,
    index: usize,
    committed: bool,
}

impl PieceSlot<'_> {
    pub fn index(&self) -> usize {
        self.index
    }
}

impl Deref for PieceSlot<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // Safety: this slot is the region's only writer.
        unsafe { std::slice::from_raw_parts(self.arena.region_ptr(self.index), self.arena.piece_size) }
    }
}

impl DerefMut for PieceSlot<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        // Safety: this slot is the region's only writer.
        unsafe {
            std::slice::from_raw_parts_mut(self.arena.region_ptr(self.index), self.arena.piece_size)
        }
    }
}

impl Drop for PieceSlot<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.arena.claims[self.index].store(false, Ordering::Release);
        }
    }
}

enum Backing {
    Source {
        map: Mmap,
        // last piece zero-padded to full width so sends stay zero-copy
        tail: Vec<u8>,
    },
    Receiver {
        arena: PieceArena,
        file: File,
        // filled by reconstruct() so the tail keeps serving after truncation
        tail: OnceLock<Vec<u8>>,
    },
}

/// Piece-oriented storage for one file: the source serves from a read-only
/// mapping of the original, destinations receive into a pre-sized
/// shared-writable mapping. Tracks per-piece availability and wakes
/// subscribers when pieces arrive.
pub struct FileManager {
    path: PathBuf,
    piece_size: usize,
    metadata: FileMetadata,
    num_pieces: usize,
    backing: Backing,
    status: Vec<AtomicBool>,
    available: AtomicUsize,
    waiters: Mutex<HashMap<usize, Vec<Arc<Notify>>>>,
}

impl FileManager {
    /// Source mode: map the input read-only and describe it. All pieces
    /// start present.
    pub fn source(
        path: impl AsRef<Path>,
        piece_size: usize,
        node_ip: Ipv4Addr,
    ) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)
            .with_context(|| format!("open source file {}", path.display()))?;
        let map = unsafe { Mmap::map(&file).context("map source file")? };
        let file_size = map.len() as u64;
        ensure!(file_size > 0, "source file {} is empty", path.display());
        let num_pieces = file_size.div_ceil(piece_size as u64) as usize;

        let filename = path
            .file_name()
            .and_then(|s| s.to_str())
            .context("source path has no file name")?
            .to_string();
        let mut hasher = Sha1::new();
        hasher.update(path.to_string_lossy().as_bytes());
        let hash: [u8; 20] = hasher.finalize().into();
        let file_id = hex::encode(hash);

        let addr = metadata::source_addr(node_ip);
        let mut pieces = Vec::with_capacity(num_pieces);
        for i in 0..num_pieces {
            let start = i * piece_size;
            let end = (start + piece_size).min(map.len());
            let mut hasher = Sha1::new();
            hasher.update(&map[start..end]);
            let hash: [u8; 20] = hasher.finalize().into();
            pieces.push(PieceInfo {
                sources: vec![addr],
                checksum: hex::encode(hash),
            });
        }

        let tail_start = (num_pieces - 1) * piece_size;
        let mut tail = vec![0u8; piece_size];
        tail[..map.len() - tail_start].copy_from_slice(&map[tail_start..]);

        Ok(Self {
            path,
            piece_size,
            metadata: FileMetadata {
                file_id,
                filename,
                file_size,
                num_pieces: num_pieces as u64,
                pieces,
            },
            num_pieces,
            backing: Backing::Source { map, tail },
            status: (0..num_pieces).map(|_| AtomicBool::new(true)).collect(),
            available: AtomicUsize::new(num_pieces),
            waiters: Mutex::new(HashMap::new()),
        })
    }

    /// Receiver mode: create the output file, size it to a whole number of
    /// pieces and map it shared-writable. All pieces start absent.
    pub fn receiver(
        metadata: FileMetadata,
        output_path: impl AsRef<Path>,
        piece_size: usize,
    ) -> anyhow::Result<Self> {
        let path = output_path.as_ref().to_path_buf();
        ensure!(metadata.num_pieces > 0, "metadata describes an empty file");
        let num_pieces = metadata.num_pieces as usize;
        ensure!(
            metadata.file_size <= (num_pieces * piece_size) as u64
                && metadata.file_size > ((num_pieces - 1) * piece_size) as u64,
            "file size {} does not fit {} pieces of {}",
            metadata.file_size,
            num_pieces,
            piece_size
        );

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("create output file {}", path.display()))?;
        file.set_len((num_pieces * piece_size) as u64)
            .context("size reconstruction file")?;
        let map = unsafe { MmapMut::map_mut(&file).context("map reconstruction file")? };

        Ok(Self {
            path,
            piece_size,
            num_pieces,
            metadata,
            backing: Backing::Receiver {
                arena: PieceArena::new(map, piece_size, num_pieces),
                file,
                tail: OnceLock::new(),
            },
            status: (0..num_pieces).map(|_| AtomicBool::new(false)).collect(),
            available: AtomicUsize::new(0),
            waiters: Mutex::new(HashMap::new()),
        })
    }

    pub fn metadata(&self) -> &FileMetadata {
        &self.metadata
    }

    pub fn piece_size(&self) -> usize {
        self.piece_size
    }

    pub fn num_pieces(&self) -> usize {
        self.num_pieces
    }

    pub fn is_source(&self) -> bool {
        matches!(self.backing, Backing::Source { .. })
    }

    pub fn has_piece(&self, index: usize) -> bool {
        index < self.num_pieces && self.status[index].load(Ordering::Acquire)
    }

    pub fn available_pieces(&self) -> usize {
        self.available.load(Ordering::Acquire)
    }

    /// Full-width read-only view of piece `index` for transmission. The
    /// last piece is served from the padded tail buffer.
    pub fn piece(&self, index: usize) -> anyhow::Result<&[u8]> {
        ensure!(index < self.num_pieces, "piece {index} out of range");
        ensure!(self.has_piece(index), "piece {index} is not present yet");
        let view = match &self.backing {
            Backing::Source { map, tail } => {
                if index == self.num_pieces - 1 {
                    tail.as_slice()
                } else {
                    &map[index * self.piece_size..(index + 1) * self.piece_size]
                }
            }
            Backing::Receiver { arena, tail, .. } => {
                if index == self.num_pieces - 1 {
                    // Every tail read goes through the owned snapshot, never
                    // the raw arena region: a caller may hold this slice
                    // across awaits, and reconstruct() truncates the mapped
                    // file. The OnceLock serializes the copy against
                    // reconstruct(), which snapshots before it truncates.
                    tail.get_or_init(|| arena.piece(index).to_vec()).as_slice()
                } else {
                    arena.piece(index)
                }
            }
        };
        Ok(view)
    }

    /// The piece's logical bytes, without wire padding. Source only.
    fn logical_piece(&self, index: usize) -> &[u8] {
        let Backing::Source { map, .. } = &self.backing else {
            unreachable!("logical_piece is only called on the source");
        };
        let start = index * self.piece_size;
        let end = (start + self.piece_size).min(map.len());
        &map[start..end]
    }

    /// Claim the writable slot for piece `index` so the wire layer can
    /// receive straight into the mapping. `None` once the piece is present
    /// (or being received), and always on the source.
    pub fn begin_piece_write(&self, index: usize) -> Option<PieceSlot<'_>> {
        let Backing::Receiver { arena, .. } = &self.backing else {
            return None;
        };
        if index >= self.num_pieces || self.has_piece(index) {
            return None;
        }
        arena.claim(index)
    }

    /// Finalize a filled slot and flip the piece's status.
    pub fn commit_piece(&self, mut slot: PieceSlot<'_>) {
        slot.committed = true;
        let index = slot.index;
        drop(slot);
        self.update_piece_status(index);
    }

    /// Monotone false→true flip plus subscriber wakeup. Idempotent.
    pub fn update_piece_status(&self, index: usize) {
        assert!(index < self.num_pieces, "piece {index} out of range");
        if self.status[index].swap(true, Ordering::AcqRel) {
            return;
        }
        self.available.fetch_add(1, Ordering::AcqRel);
        let woken = self
            .waiters
            .lock()
            .expect("piece waiter lock poisoned")
            .remove(&index);
        if let Some(woken) = woken {
            for notify in woken {
                notify.notify_one();
            }
        }
    }

    /// Resolves once piece `index` is present. Presence is re-checked under
    /// the registry lock after subscribing, so a flip between the caller's
    /// check and the subscription cannot be lost.
    pub async fn wait_for_piece(&self, index: usize) {
        let notify = {
            let mut waiters = self.waiters.lock().expect("piece waiter lock poisoned");
            if self.has_piece(index) {
                return;
            }
            let notify = Arc::new(Notify::new());
            waiters.entry(index).or_default().push(Arc::clone(&notify));
            notify
        };
        notify.notified().await;
    }

    /// Flush the mapping and truncate the output to the real file size,
    /// dropping the tail padding. The mapping stays alive (the node keeps
    /// seeding until the fleet barrier releases). The last piece is
    /// snapshotted before the truncation; `piece()` reads the tail through
    /// the same `OnceLock`, so a serve that started first finishes its copy
    /// before the pages under it can go away, and every later one gets the
    /// snapshot.
    pub fn reconstruct(&self) -> anyhow::Result<()> {
        let Backing::Receiver { arena, file, tail } = &self.backing else {
            bail!("reconstruct called on the source");
        };
        ensure!(
            self.available_pieces() == self.num_pieces,
            "reconstruct with {}/{} pieces",
            self.available_pieces(),
            self.num_pieces
        );
        arena.flush().context("flush reconstruction mapping")?;
        tail.get_or_init(|| arena.piece(self.num_pieces - 1).to_vec());
        file.set_len(self.metadata.file_size)
            .with_context(|| format!("truncate {} to {}", self.path.display(), self.metadata.file_size))?;
        debug!(
            path = %self.path.display(),
            size = self.metadata.file_size,
            "reconstructed file"
        );
        Ok(())
    }

    /// Write one side file per piece under `pieces_dir/dir_<file_id>/`, on
    /// the worker pool. Best-effort: the transfer does not depend on them.
    pub async fn spawn_piece_files(
        self: &Arc<Self>,
        pool: &WorkerPool,
        pieces_dir: impl AsRef<Path>,
    ) -> anyhow::Result<()> {
        ensure!(self.is_source(), "piece files are only split on the source");
        let dir = pieces_dir.as_ref().join(format!("dir_{}", self.metadata.file_id));
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create pieces directory {}", dir.display()))?;
        for index in 0..self.num_pieces {
            let manager = Arc::clone(self);
            let path = dir.join(format!("piece_{index}"));
            pool.submit(async move {
                let bytes = manager.logical_piece(index).to_vec();
                if let Err(e) = tokio::fs::write(&path, bytes).await {
                    warn!("failed to write piece file {}: {e}", path.display());
                }
            })
            .await;
        }
        Ok(())
    }
}

#[cfg(test)]
fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[cfg(test)]
fn source_fixture(len: usize, piece_size: usize) -> (tempfile::TempDir, Arc<FileManager>) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("payload.bin");
    std::fs::write(&path, patterned(len)).unwrap();
    let manager = FileManager::source(&path, piece_size, "10.0.0.2".parse().unwrap()).unwrap();
    (dir, Arc::new(manager))
}

#[test]
fn source_mode_splits_and_pads() {
    let (_dir, source) = source_fixture(40_000, 16_384);
    assert_eq!(source.num_pieces(), 3);
    assert_eq!(source.available_pieces(), 3);
    assert!((0..3).all(|i| source.has_piece(i)));

    let meta = source.metadata();
    assert_eq!(meta.file_size, 40_000);
    assert_eq!(meta.num_pieces, 3);
    assert_eq!(
        metadata::parse_source_addr(&meta.pieces[0].sources[0]).unwrap(),
        "10.0.0.2".parse::<std::net::Ipv4Addr>().unwrap()
    );
    assert!(!meta.pieces[0].checksum.is_empty());

    let last = source.piece(2).unwrap();
    assert_eq!(last.len(), 16_384);
    let logical = 40_000 - 2 * 16_384;
    assert_eq!(&last[..logical], &patterned(40_000)[2 * 16_384..]);
    assert!(last[logical..].iter().all(|&b| b == 0));
}

#[test]
fn receiver_rebuilds_identical_file() {
    let (_dir, source) = source_fixture(40_000, 16_384);
    let out_dir = tempfile::tempdir().unwrap();
    let out_path = out_dir.path().join("rebuilt.bin");
    let receiver =
        FileManager::receiver(source.metadata().clone(), &out_path, 16_384).unwrap();

    assert_eq!(receiver.available_pieces(), 0);
    for i in 0..source.num_pieces() {
        assert!(!receiver.has_piece(i));
        let mut slot = receiver.begin_piece_write(i).unwrap();
        slot.copy_from_slice(source.piece(i).unwrap());
        receiver.commit_piece(slot);
        assert!(receiver.has_piece(i));
        assert!(receiver.begin_piece_write(i).is_none());
    }

    receiver.reconstruct().unwrap();
    let rebuilt = std::fs::read(&out_path).unwrap();
    assert_eq!(rebuilt.len(), 40_000);
    assert_eq!(rebuilt, patterned(40_000));
    // the tail keeps serving at full width after truncation
    assert_eq!(receiver.piece(2).unwrap().len(), 16_384);
}

#[test]
fn single_byte_overhang_truncates_exactly() {
    let size = 16_384 + 1;
    let (_dir, source) = source_fixture(size, 16_384);
    assert_eq!(source.num_pieces(), 2);

    let out_dir = tempfile::tempdir().unwrap();
    let out_path = out_dir.path().join("rebuilt.bin");
    let receiver = FileManager::receiver(source.metadata().clone(), &out_path, 16_384).unwrap();
    for i in 0..2 {
        let mut slot = receiver.begin_piece_write(i).unwrap();
        slot.copy_from_slice(source.piece(i).unwrap());
        receiver.commit_piece(slot);
    }
    receiver.reconstruct().unwrap();
    assert_eq!(std::fs::metadata(&out_path).unwrap().len(), size as u64);
    assert_eq!(std::fs::read(&out_path).unwrap(), patterned(size));
}

#[test]
fn last_piece_view_survives_reconstruct() {
    let (_dir, source) = source_fixture(40_000, 16_384);
    let out_dir = tempfile::tempdir().unwrap();
    let out_path = out_dir.path().join("rebuilt.bin");
    let receiver = FileManager::receiver(source.metadata().clone(), &out_path, 16_384).unwrap();
    for i in 0..3 {
        let mut slot = receiver.begin_piece_write(i).unwrap();
        slot.copy_from_slice(source.piece(i).unwrap());
        receiver.commit_piece(slot);
    }

    // a serve may take this view and still be copying it out after the
    // truncation drops the mapped tail pages
    let view = receiver.piece(2).unwrap();
    receiver.reconstruct().unwrap();

    assert_eq!(view.len(), 16_384);
    let logical = 40_000 - 2 * 16_384;
    assert_eq!(&view[..logical], &patterned(40_000)[2 * 16_384..]);
    assert!(view[logical..].iter().all(|&b| b == 0));
    assert_eq!(std::fs::metadata(&out_path).unwrap().len(), 40_000);
}

#[test]
fn dropped_slot_releases_claim() {
    let (_dir, source) = source_fixture(16_384 * 2, 16_384);
    let out_dir = tempfile::tempdir().unwrap();
    let receiver = FileManager::receiver(
        source.metadata().clone(),
        out_dir.path().join("rebuilt.bin"),
        16_384,
    )
    .unwrap();

    let slot = receiver.begin_piece_write(0).unwrap();
    assert!(receiver.begin_piece_write(0).is_none());
    drop(slot);
    assert!(!receiver.has_piece(0));
    assert!(receiver.begin_piece_write(0).is_some());
}

#[test]
fn status_updates_are_idempotent() {
    let (_dir, source) = source_fixture(16_384 * 2, 16_384);
    let out_dir = tempfile::tempdir().unwrap();
    let receiver = FileManager::receiver(
        source.metadata().clone(),
        out_dir.path().join("rebuilt.bin"),
        16_384,
    )
    .unwrap();

    receiver.update_piece_status(1);
    receiver.update_piece_status(1);
    assert_eq!(receiver.available_pieces(), 1);
    assert!(receiver.has_piece(1));
}

#[tokio::test]
async fn piece_subscriptions_fire_exactly_once() {
    let (_dir, source) = source_fixture(16_384 * 3, 16_384);
    let out_dir = tempfile::tempdir().unwrap();
    let receiver = Arc::new(
        FileManager::receiver(
            source.metadata().clone(),
            out_dir.path().join("rebuilt.bin"),
            16_384,
        )
        .unwrap(),
    );

    let fired = Arc::new(AtomicUsize::new(0));
    let mut tasks = Vec::new();
    for _ in 0..4 {
        let receiver = Arc::clone(&receiver);
        let fired = Arc::clone(&fired);
        tasks.push(tokio::spawn(async move {
            receiver.wait_for_piece(1).await;
            fired.fetch_add(1, Ordering::AcqRel);
        }));
    }
    tokio::task::yield_now().await;
    receiver.update_piece_status(1);
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(fired.load(Ordering::Acquire), 4);

    // already-present pieces resolve immediately
    receiver.wait_for_piece(1).await;
}

#[tokio::test]
async fn source_writes_piece_side_files() {
    let (_dir, source) = source_fixture(40_000, 16_384);
    let pieces_dir = tempfile::tempdir().unwrap();
    let pool = WorkerPool::new(2);
    source.spawn_piece_files(&pool, pieces_dir.path()).await.unwrap();
    pool.quiesce().await;

    let dir = pieces_dir
        .path()
        .join(format!("dir_{}", source.metadata().file_id));
    for i in 0..3 {
        let bytes = std::fs::read(dir.join(format!("piece_{i}"))).unwrap();
        assert_eq!(bytes, source.logical_piece(i));
    }
    assert_eq!(std::fs::read(dir.join("piece_2")).unwrap().len(), 40_000 - 2 * 16_384);
}
