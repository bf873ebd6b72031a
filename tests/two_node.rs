use floodclone::PIECE_SIZE;
use floodclone::connection::ConnectionManager;
use floodclone::pool::WorkerPool;
use floodclone::storage::FileManager;
use floodclone::wire::PieceRequest;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const LOCALHOST: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn source_storage(dir: &Path, len: usize) -> Arc<FileManager> {
    let path = dir.join("payload.bin");
    std::fs::write(&path, patterned(len)).unwrap();
    Arc::new(FileManager::source(&path, PIECE_SIZE, LOCALHOST).unwrap())
}

async fn start_source(dir: &Path, len: usize) -> (Arc<ConnectionManager>, u16) {
    let storage = source_storage(dir, len);
    let pool = Arc::new(WorkerPool::new(2));
    let server = ConnectionManager::new(0, pool);
    server.set_file_manager(storage);
    let port = server.start_listening().await.unwrap();
    (server, port)
}

async fn download(dir: &Path, port: u16, name: &str) -> (Arc<FileManager>, std::path::PathBuf) {
    let pool = Arc::new(WorkerPool::new(2));
    let client = ConnectionManager::new(0, pool);
    let metadata = client.request_metadata(LOCALHOST, port).await.unwrap();

    let out = dir.join(name);
    let receiver = Arc::new(FileManager::receiver(metadata.clone(), &out, PIECE_SIZE).unwrap());
    client.set_file_manager(Arc::clone(&receiver));
    client
        .request_pieces(LOCALHOST, port, &PieceRequest::full_range(metadata.num_pieces))
        .await
        .unwrap();

    for i in 0..receiver.num_pieces() {
        assert!(receiver.has_piece(i), "piece {i} missing after transfer");
    }
    receiver.reconstruct().unwrap();
    (receiver, out)
}

#[tokio::test]
async fn two_node_transfer_rebuilds_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let (server, port) = start_source(dir.path(), 40_000).await;

    let (receiver, out) = download(dir.path(), port, "rebuilt.bin").await;
    assert_eq!(receiver.num_pieces(), 3);
    assert_eq!(std::fs::metadata(&out).unwrap().len(), 40_000);
    assert_eq!(std::fs::read(&out).unwrap(), patterned(40_000));

    server.stop_listening().await;
}

#[tokio::test]
async fn one_byte_overhang_truncates_to_source_length() {
    // every wire piece is padded to full width; the rebuilt file must not be
    let size = PIECE_SIZE + 1;
    let dir = tempfile::tempdir().unwrap();
    let (server, port) = start_source(dir.path(), size).await;

    let (_receiver, out) = download(dir.path(), port, "rebuilt.bin").await;
    assert_eq!(std::fs::metadata(&out).unwrap().len(), size as u64);
    assert_eq!(std::fs::read(&out).unwrap(), patterned(size));

    server.stop_listening().await;
}

#[tokio::test]
async fn dialing_before_the_source_listens_is_retried() {
    let dir = tempfile::tempdir().unwrap();

    // reserve a port, then bring the source up on it only after a delay
    let port = {
        let probe = std::net::TcpListener::bind((LOCALHOST, 0)).unwrap();
        probe.local_addr().unwrap().port()
    };
    let server_dir = dir.path().to_path_buf();
    let server = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let storage = source_storage(&server_dir, 40_000);
        let pool = Arc::new(WorkerPool::new(2));
        let server = ConnectionManager::new(port, pool);
        server.set_file_manager(storage);
        server.start_listening().await.unwrap();
        server
    });

    let pool = Arc::new(WorkerPool::new(2));
    let client = ConnectionManager::new(0, pool);
    let metadata = client.request_metadata(LOCALHOST, port).await.unwrap();
    assert_eq!(metadata.file_size, 40_000);

    server.await.unwrap().stop_listening().await;
}
