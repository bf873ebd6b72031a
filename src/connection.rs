use crate::metadata::FileMetadata;
use crate::pool::WorkerPool;
use crate::storage::FileManager;
use crate::wire::{HEADER_LEN, Header, MessageType, PieceRequest, RequestFrame, RequestFramer};
use anyhow::{Context, bail, ensure};
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const MAX_CONNECT_ATTEMPTS: u32 = 5;
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Control signals a serving peer can answer a piece request with. The
/// coordinator downcasts these out of `anyhow::Error` to drive neighbor
/// failover; everything else it treats as fatal.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Error)]
pub enum TransferError {
    #[error("peer interface is busy")]
    Busy,
    #[error("peer has no pieces available")]
    NotAvailable,
}

/// A cached outbound connection. The halves are independently lockable so
/// a request writer never contends with the response reader.
struct PeerConnection {
    read: Mutex<OwnedReadHalf>,
    write: Mutex<OwnedWriteHalf>,
}

/// Serving state of one local interface (one local IP). At most one
/// inbound connection may hold it at any instant; everyone else is told
/// BUSY and fails over to another neighbor.
struct InterfaceState {
    name: String,
    busy: AtomicBool,
    // connection id currently serving out of this interface, 0 = none
    owner: AtomicU64,
    connections: StdMutex<HashSet<u64>>,
}

impl InterfaceState {
    fn new(name: String) -> Self {
        Self {
            name,
            busy: AtomicBool::new(false),
            owner: AtomicU64::new(0),
            connections: StdMutex::new(HashSet::new()),
        }
    }

    fn acquire(self: &Arc<Self>, connection_id: u64) -> Option<InterfaceGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        self.owner.store(connection_id, Ordering::Release);
        Some(InterfaceGuard {
            state: Arc::clone(self),
        })
    }
}

/// Releases the interface when the serving session ends, however it ends.
struct InterfaceGuard {
    state: Arc<InterfaceState>,
}

impl Drop for InterfaceGuard {
    fn drop(&mut self) {
        self.state.owner.store(0, Ordering::Release);
        self.state.busy.store(false, Ordering::Release);
    }
}

/// The peer-to-peer engine: serves metadata and piece requests on every
/// local interface, and fetches both from other nodes, receiving piece
/// bytes straight into the storage mapping.
pub struct ConnectionManager {
    port: u16,
    pool: Arc<WorkerPool>,
    // attached late on destinations: only once metadata is known
    storage: RwLock<Option<Arc<FileManager>>>,
    connections: Mutex<HashMap<(Ipv4Addr, u16), Arc<PeerConnection>>>,
    interfaces: RwLock<HashMap<Ipv4Addr, Arc<InterfaceState>>>,
    next_connection_id: AtomicU64,
    shutdown: CancellationToken,
    listener_task: StdMutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(port: u16, pool: Arc<WorkerPool>) -> Arc<Self> {
        Arc::new(Self {
            port,
            pool,
            storage: RwLock::new(None),
            connections: Mutex::new(HashMap::new()),
            interfaces: RwLock::new(HashMap::new()),
            next_connection_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
            listener_task: StdMutex::new(None),
        })
    }

    pub fn set_file_manager(&self, storage: Arc<FileManager>) {
        *self.storage.write().expect("storage lock poisoned") = Some(storage);
    }

    fn storage(&self) -> anyhow::Result<Arc<FileManager>> {
        self.storage
            .read()
            .expect("storage lock poisoned")
            .clone()
            .context("no file manager attached yet")
    }

    /// Bind the wildcard data port and start accepting. Returns the bound
    /// port (useful when asked for port 0).
    pub async fn start_listening(self: &Arc<Self>) -> anyhow::Result<u16> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.port))
            .await
            .with_context(|| format!("bind data port {}", self.port))?;
        let port = listener.local_addr().context("query data port")?.port();
        info!("listening on all interfaces, port {port}");
        let manager = Arc::clone(self);
        let task = tokio::spawn(manager.accept_loop(listener));
        *self
            .listener_task
            .lock()
            .expect("listener task lock poisoned") = Some(task);
        Ok(port)
    }

    /// Break the accept loop and join it. Connections already being served
    /// finish their in-flight request.
    pub async fn stop_listening(&self) {
        self.shutdown.cancel();
        let task = self
            .listener_task
            .lock()
            .expect("listener task lock poisoned")
            .take();
        if let Some(task) = task {
            task.await.expect("listener task panicked");
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = self.accept_connection(stream, peer) {
                            warn!("dropping connection from {peer}: {e}");
                        }
                    }
                    Err(e) => warn!("accept failed: {e}"),
                },
            }
        }
        debug!("stopped listening");
    }

    fn accept_connection(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) -> anyhow::Result<()> {
        let local = stream.local_addr().context("query accepted socket address")?;
        let IpAddr::V4(local_ip) = local.ip() else {
            bail!("non-IPv4 local address {local}");
        };
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::AcqRel);
        let interface = self.register_interface(local_ip, connection_id);
        debug!("connection {connection_id} accepted from {peer} on interface {local_ip}");
        let manager = Arc::clone(self);
        tokio::spawn(manager.serve_connection(stream, connection_id, interface));
        Ok(())
    }

    /// The accepted socket's local IP identifies the interface it came in
    /// through; track the association.
    fn register_interface(&self, local_ip: Ipv4Addr, connection_id: u64) -> Arc<InterfaceState> {
        let mut interfaces = self.interfaces.write().expect("interface map poisoned");
        let state = interfaces
            .entry(local_ip)
            .or_insert_with(|| Arc::new(InterfaceState::new(local_ip.to_string())))
            .clone();
        drop(interfaces);
        state
            .connections
            .lock()
            .expect("interface state poisoned")
            .insert(connection_id);
        state
    }

    /// Per-connection pump: one framed request at a time, each handled on
    /// the worker pool and awaited before the next frame is decoded, so at
    /// most one handler ever runs per socket.
    async fn serve_connection(
        self: Arc<Self>,
        stream: TcpStream,
        connection_id: u64,
        interface: Arc<InterfaceState>,
    ) {
        let (read, write) = stream.into_split();
        let mut requests = FramedRead::new(read, RequestFramer);
        let writer = Arc::new(Mutex::new(write));
        loop {
            let frame = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                frame = requests.next() => frame,
            };
            let frame = match frame {
                None => {
                    debug!("connection {connection_id} closed by peer");
                    break;
                }
                Some(Err(e)) => {
                    warn!("connection {connection_id}: bad request frame: {e}");
                    break;
                }
                Some(Ok(frame)) => frame,
            };

            let (done_tx, done_rx) = oneshot::channel();
            let manager = Arc::clone(&self);
            let writer = Arc::clone(&writer);
            let interface = Arc::clone(&interface);
            self.pool
                .submit(async move {
                    let result = manager
                        .handle_request(connection_id, interface, writer, frame)
                        .await;
                    let _ = done_tx.send(result);
                })
                .await;
            match done_rx.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("connection {connection_id}: request failed: {e:#}");
                    break;
                }
                Err(_) => break,
            }
        }
        interface
            .connections
            .lock()
            .expect("interface state poisoned")
            .remove(&connection_id);
    }

    async fn handle_request(
        &self,
        connection_id: u64,
        interface: Arc<InterfaceState>,
        writer: Arc<Mutex<OwnedWriteHalf>>,
        frame: RequestFrame,
    ) -> anyhow::Result<()> {
        match frame.header.typ {
            MessageType::MetaReq => self.handle_meta_request(&writer).await,
            MessageType::PieceReq => {
                self.handle_piece_request(connection_id, interface, &writer, &frame.payload)
                    .await
            }
            other => bail!("unexpected request type {other:?}"),
        }
    }

    async fn handle_meta_request(&self, writer: &Mutex<OwnedWriteHalf>) -> anyhow::Result<()> {
        let storage = self.storage()?;
        let payload = storage.metadata().encode();
        let header = Header::new(MessageType::MetaRes, payload.len() as u32, 0);
        let mut writer = writer.lock().await;
        writer
            .write_all(&header.encode())
            .await
            .context("send metadata header")?;
        writer
            .write_all(&payload)
            .await
            .context("send metadata payload")?;
        debug!("served metadata ({} bytes)", payload.len());
        Ok(())
    }

    async fn handle_piece_request(
        &self,
        connection_id: u64,
        interface: Arc<InterfaceState>,
        writer: &Mutex<OwnedWriteHalf>,
        payload: &[u8],
    ) -> anyhow::Result<()> {
        let request = PieceRequest::decode(payload)?;
        let storage = self.storage()?;
        for index in request.indices() {
            ensure!(
                (index as usize) < storage.num_pieces(),
                "requested piece {index} out of range"
            );
        }

        // The NIC is the bottleneck: admit one serving session per
        // interface, everyone else fails over on BUSY.
        let Some(_guard) = interface.acquire(connection_id) else {
            debug!(
                "interface {} busy, refusing connection {connection_id}",
                interface.name
            );
            return send_control(writer, MessageType::BusyRes).await;
        };

        if storage.available_pieces() == 0 {
            return send_control(writer, MessageType::NotAvailRes).await;
        }

        let mut missing = Vec::new();
        for index in request.indices() {
            let index = index as usize;
            if storage.has_piece(index) {
                send_piece(writer, &storage, index).await?;
            } else {
                missing.push(index);
            }
        }

        // Serve-while-downloading: park on the absent pieces' subscriptions
        // and ship each one in the order it arrives locally.
        let mut arrivals: FuturesUnordered<_> = missing
            .into_iter()
            .map(|index| {
                let storage = Arc::clone(&storage);
                async move {
                    storage.wait_for_piece(index).await;
                    index
                }
            })
            .collect();
        while let Some(index) = arrivals.next().await {
            send_piece(writer, &storage, index).await?;
        }
        debug!(
            "served {} piece(s) to connection {connection_id}",
            request.count()
        );
        Ok(())
    }

    async fn connect_to(&self, addr: Ipv4Addr, port: u16) -> anyhow::Result<Arc<PeerConnection>> {
        let key = (addr, port);
        {
            let connections = self.connections.lock().await;
            if let Some(connection) = connections.get(&key) {
                return Ok(Arc::clone(connection));
            }
        }

        let mut last_error = None;
        for attempt in 1..=MAX_CONNECT_ATTEMPTS {
            match TcpStream::connect((addr, port)).await {
                Ok(stream) => {
                    debug!("connected to {addr}:{port} after {attempt} attempt(s)");
                    let (read, write) = stream.into_split();
                    let connection = Arc::new(PeerConnection {
                        read: Mutex::new(read),
                        write: Mutex::new(write),
                    });
                    let mut connections = self.connections.lock().await;
                    // keep the first if another task won the race
                    let connection = connections.entry(key).or_insert(connection);
                    return Ok(Arc::clone(connection));
                }
                Err(e) => {
                    warn!("connection attempt {attempt} to {addr}:{port} failed: {e}");
                    last_error = Some(e);
                    if attempt < MAX_CONNECT_ATTEMPTS {
                        sleep(CONNECT_RETRY_DELAY).await;
                    }
                }
            }
        }
        Err(last_error.expect("at least one attempt was made")).with_context(|| {
            format!("failed to connect to {addr}:{port} after {MAX_CONNECT_ATTEMPTS} attempts")
        })
    }

    /// Drop the cached connection to a peer, closing it.
    pub async fn close_connection(&self, addr: Ipv4Addr, port: u16) {
        self.connections.lock().await.remove(&(addr, port));
    }

    /// Fetch the file metadata from a peer; the first thing a destination
    /// does.
    pub async fn request_metadata(&self, addr: Ipv4Addr, port: u16) -> anyhow::Result<FileMetadata> {
        let connection = self.connect_to(addr, port).await?;
        {
            let mut writer = connection.write.lock().await;
            writer
                .write_all(&Header::new(MessageType::MetaReq, 0, 0).encode())
                .await
                .context("send metadata request")?;
        }
        let mut reader = connection.read.lock().await;
        let header = read_header(&mut reader).await?;
        ensure!(
            header.typ == MessageType::MetaRes,
            "unexpected response type {:?} to metadata request",
            header.typ
        );
        let mut payload = vec![0u8; header.payload_size as usize];
        reader
            .read_exact(&mut payload)
            .await
            .context("receive metadata payload")?;
        FileMetadata::decode(&payload)
    }

    /// Issue one combined piece request and receive every response,
    /// placing bytes by the `piece_index` each response header declares.
    /// BUSY and NOT_AVAIL surface as `TransferError` for the caller's
    /// failover policy.
    pub async fn request_pieces(
        &self,
        addr: Ipv4Addr,
        port: u16,
        request: &PieceRequest,
    ) -> anyhow::Result<()> {
        let storage = self.storage()?;
        let connection = self.connect_to(addr, port).await?;
        let payload = request.encode();
        {
            let mut writer = connection.write.lock().await;
            writer
                .write_all(&Header::new(MessageType::PieceReq, payload.len() as u32, 0).encode())
                .await
                .context("send piece request header")?;
            writer
                .write_all(&payload)
                .await
                .context("send piece request")?;
        }

        let total = request.count();
        let mut reader = connection.read.lock().await;
        let mut discard = vec![0u8; storage.piece_size()];
        for received in 0..total {
            let header = read_header(&mut reader).await?;
            match header.typ {
                MessageType::BusyRes => return Err(TransferError::Busy.into()),
                MessageType::NotAvailRes => return Err(TransferError::NotAvailable.into()),
                MessageType::PieceRes => {}
                other => bail!("unexpected response type {other:?} to piece request"),
            }
            ensure!(
                header.payload_size as usize == storage.piece_size(),
                "piece {} payload is {} bytes, expected {}",
                header.piece_index,
                header.payload_size,
                storage.piece_size()
            );
            let index = header.piece_index as usize;
            ensure!(index < storage.num_pieces(), "received piece {index} out of range");
            match storage.begin_piece_write(index) {
                Some(mut slot) => {
                    reader
                        .read_exact(&mut slot)
                        .await
                        .with_context(|| format!("receive piece {index}"))?;
                    storage.commit_piece(slot);
                    debug!("received piece {index} ({}/{total})", received + 1);
                }
                None => {
                    // already present (or mid-receive elsewhere): drain it
                    reader
                        .read_exact(&mut discard)
                        .await
                        .with_context(|| format!("drain duplicate piece {index}"))?;
                }
            }
        }
        Ok(())
    }
}

async fn read_header(reader: &mut OwnedReadHalf) -> anyhow::Result<Header> {
    let mut bytes = [0u8; HEADER_LEN];
    reader
        .read_exact(&mut bytes)
        .await
        .context("connection closed while receiving header")?;
    Header::decode(bytes)
}

async fn send_control(writer: &Mutex<OwnedWriteHalf>, typ: MessageType) -> anyhow::Result<()> {
    writer
        .lock()
        .await
        .write_all(&Header::new(typ, 0, 0).encode())
        .await
        .with_context(|| format!("send {typ:?}"))
}

async fn send_piece(
    writer: &Mutex<OwnedWriteHalf>,
    storage: &FileManager,
    index: usize,
) -> anyhow::Result<()> {
    let data = storage.piece(index)?;
    let header = Header::new(MessageType::PieceRes, data.len() as u32, index as u32);
    let mut writer = writer.lock().await;
    writer
        .write_all(&header.encode())
        .await
        .with_context(|| format!("send piece {index} header"))?;
    writer
        .write_all(data)
        .await
        .with_context(|| format!("send piece {index}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn source_manager(dir: &tempfile::TempDir, len: usize) -> Arc<FileManager> {
        let path = dir.path().join("payload.bin");
        std::fs::write(&path, patterned(len)).unwrap();
        Arc::new(FileManager::source(&path, 16_384, "127.0.0.1".parse().unwrap()).unwrap())
    }

    #[test]
    fn interface_admits_exactly_one_session() {
        let interface = Arc::new(InterfaceState::new("10.0.0.1".to_string()));
        let guard = interface.acquire(1).unwrap();
        assert!(interface.acquire(2).is_none());
        assert_eq!(interface.owner.load(Ordering::Acquire), 1);

        drop(guard);
        assert!(!interface.busy.load(Ordering::Acquire));
        assert!(interface.acquire(2).is_some());
    }

    #[test]
    fn concurrent_acquires_have_one_winner() {
        let interface = Arc::new(InterfaceState::new("10.0.0.1".to_string()));
        let winners = Arc::new(AtomicUsize::new(0));
        let threads: Vec<_> = (1..=8u64)
            .map(|id| {
                let interface = Arc::clone(&interface);
                let winners = Arc::clone(&winners);
                std::thread::spawn(move || {
                    if let Some(guard) = interface.acquire(id) {
                        winners.fetch_add(1, Ordering::AcqRel);
                        std::mem::forget(guard);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(winners.load(Ordering::Acquire), 1);
    }

    #[tokio::test]
    async fn metadata_and_full_range_over_loopback() {
        let dir = tempfile::tempdir().unwrap();
        let source_storage = source_manager(&dir, 40_000);

        let pool = Arc::new(WorkerPool::new(2));
        let server = ConnectionManager::new(0, Arc::clone(&pool));
        server.set_file_manager(Arc::clone(&source_storage));
        let port = server.start_listening().await.unwrap();

        let client_pool = Arc::new(WorkerPool::new(2));
        let client = ConnectionManager::new(0, client_pool);
        let metadata = client
            .request_metadata("127.0.0.1".parse().unwrap(), port)
            .await
            .unwrap();
        assert_eq!(metadata, *source_storage.metadata());

        let out = dir.path().join("rebuilt.bin");
        let receiver = Arc::new(FileManager::receiver(metadata.clone(), &out, 16_384).unwrap());
        client.set_file_manager(Arc::clone(&receiver));
        client
            .request_pieces(
                "127.0.0.1".parse().unwrap(),
                port,
                &PieceRequest::full_range(metadata.num_pieces),
            )
            .await
            .unwrap();

        assert_eq!(receiver.available_pieces(), 3);
        receiver.reconstruct().unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), patterned(40_000));
        server.stop_listening().await;
    }

    #[tokio::test]
    async fn busy_interface_answers_busy() {
        let dir = tempfile::tempdir().unwrap();
        let source_storage = source_manager(&dir, 40_000);

        let pool = Arc::new(WorkerPool::new(2));
        let server = ConnectionManager::new(0, Arc::clone(&pool));
        server.set_file_manager(source_storage);
        let port = server.start_listening().await.unwrap();

        let client_pool = Arc::new(WorkerPool::new(2));
        let client = ConnectionManager::new(0, client_pool);
        let metadata = client
            .request_metadata("127.0.0.1".parse().unwrap(), port)
            .await
            .unwrap();
        let receiver = Arc::new(
            FileManager::receiver(metadata.clone(), dir.path().join("rebuilt.bin"), 16_384)
                .unwrap(),
        );
        client.set_file_manager(receiver);

        // loopback connections all land on the 127.0.0.1 interface; hold it
        let interface = server
            .interfaces
            .read()
            .unwrap()
            .get(&"127.0.0.1".parse::<Ipv4Addr>().unwrap())
            .cloned()
            .unwrap();
        let guard = interface.acquire(999).unwrap();

        let err = client
            .request_pieces(
                "127.0.0.1".parse().unwrap(),
                port,
                &PieceRequest::full_range(metadata.num_pieces),
            )
            .await
            .unwrap_err();
        assert_eq!(err.downcast_ref::<TransferError>(), Some(&TransferError::Busy));

        // released interface serves the retry
        drop(guard);
        client
            .request_pieces(
                "127.0.0.1".parse().unwrap(),
                port,
                &PieceRequest::full_range(metadata.num_pieces),
            )
            .await
            .unwrap();
        server.stop_listening().await;
    }

    #[tokio::test]
    async fn request_parks_until_pieces_arrive() {
        // B downloads from A before A has anything; A's handler must hold
        // the request open and ship pieces as they land.
        let dir = tempfile::tempdir().unwrap();
        let source_storage = source_manager(&dir, 40_000);
        let metadata = source_storage.metadata().clone();

        let a_storage = Arc::new(
            FileManager::receiver(metadata.clone(), dir.path().join("a.bin"), 16_384).unwrap(),
        );
        let a_pool = Arc::new(WorkerPool::new(2));
        let a = ConnectionManager::new(0, a_pool);
        a.set_file_manager(Arc::clone(&a_storage));
        let a_port = a.start_listening().await.unwrap();

        let b_storage = Arc::new(
            FileManager::receiver(metadata.clone(), dir.path().join("b.bin"), 16_384).unwrap(),
        );
        let b_pool = Arc::new(WorkerPool::new(2));
        let b = ConnectionManager::new(0, b_pool);
        b.set_file_manager(Arc::clone(&b_storage));

        // A has piece 0 so the request is admitted, then waits for the rest
        let mut slot = a_storage.begin_piece_write(0).unwrap();
        slot.copy_from_slice(source_storage.piece(0).unwrap());
        a_storage.commit_piece(slot);

        let download = {
            let b = Arc::clone(&b);
            tokio::spawn(async move {
                b.request_pieces(
                    "127.0.0.1".parse().unwrap(),
                    a_port,
                    &PieceRequest::full_range(3),
                )
                .await
            })
        };

        // trickle the remaining pieces into A
        for index in [2usize, 1] {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let mut slot = a_storage.begin_piece_write(index).unwrap();
            slot.copy_from_slice(source_storage.piece(index).unwrap());
            a_storage.commit_piece(slot);
        }

        download.await.unwrap().unwrap();
        assert_eq!(b_storage.available_pieces(), 3);
        b_storage.reconstruct().unwrap();
        assert_eq!(std::fs::read(dir.path().join("b.bin")).unwrap(), patterned(40_000));
        a.stop_listening().await;
    }

    #[tokio::test]
    async fn reconstruct_races_an_inflight_tail_send() {
        // A finishes and truncates its own copy while it is still serving
        // the last piece to B; the send must read the tail snapshot, not
        // the truncated mapping.
        let dir = tempfile::tempdir().unwrap();
        let source_storage = source_manager(&dir, 40_000);
        let metadata = source_storage.metadata().clone();

        let a_storage = Arc::new(
            FileManager::receiver(metadata.clone(), dir.path().join("a.bin"), 16_384).unwrap(),
        );
        let a_pool = Arc::new(WorkerPool::new(2));
        let a = ConnectionManager::new(0, a_pool);
        a.set_file_manager(Arc::clone(&a_storage));
        let a_port = a.start_listening().await.unwrap();

        // A has everything but the tail, so B's request parks on it
        for index in [0usize, 1] {
            let mut slot = a_storage.begin_piece_write(index).unwrap();
            slot.copy_from_slice(source_storage.piece(index).unwrap());
            a_storage.commit_piece(slot);
        }

        let b_storage = Arc::new(
            FileManager::receiver(metadata.clone(), dir.path().join("b.bin"), 16_384).unwrap(),
        );
        let b_pool = Arc::new(WorkerPool::new(2));
        let b = ConnectionManager::new(0, b_pool);
        b.set_file_manager(Arc::clone(&b_storage));

        let download = {
            let b = Arc::clone(&b);
            tokio::spawn(async move {
                b.request_pieces(
                    "127.0.0.1".parse().unwrap(),
                    a_port,
                    &PieceRequest::full_range(3),
                )
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // the tail lands and A immediately truncates, racing the woken
        // handler's send of piece 2
        let mut slot = a_storage.begin_piece_write(2).unwrap();
        slot.copy_from_slice(source_storage.piece(2).unwrap());
        a_storage.commit_piece(slot);
        a_storage.reconstruct().unwrap();

        download.await.unwrap().unwrap();
        assert_eq!(b_storage.available_pieces(), 3);
        b_storage.reconstruct().unwrap();
        assert_eq!(std::fs::read(dir.path().join("b.bin")).unwrap(), patterned(40_000));
        assert_eq!(std::fs::metadata(dir.path().join("a.bin")).unwrap().len(), 40_000);
        a.stop_listening().await;
    }
}
