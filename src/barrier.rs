use anyhow::Context;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Fleet-wide completion side channel. Every node listens on the
/// completion port and counts inbound TCP handshakes; a finished
/// destination dials every other node once. No payload ever crosses the
/// wire, and the barrier has no timeout.
pub struct CompletionBarrier {
    port: u16,
    completions: watch::Sender<usize>,
    shutdown: CancellationToken,
    listener_task: Mutex<Option<JoinHandle<()>>>,
}

impl CompletionBarrier {
    pub async fn start(port: u16) -> anyhow::Result<Arc<Self>> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .with_context(|| format!("bind completion port {port}"))?;
        let port = listener.local_addr().context("query completion port")?.port();
        let (completions, _) = watch::channel(0usize);
        let barrier = Arc::new(Self {
            port,
            completions,
            shutdown: CancellationToken::new(),
            listener_task: Mutex::new(None),
        });
        let task = tokio::spawn(Arc::clone(&barrier).listen(listener));
        *barrier
            .listener_task
            .lock()
            .expect("completion task lock poisoned") = Some(task);
        Ok(barrier)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    async fn listen(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((_stream, peer)) => {
                        // the handshake is the whole signal; dropping the
                        // stream closes it
                        self.completions.send_modify(|n| *n += 1);
                        debug!(
                            "completion signal from {peer}, {} so far",
                            *self.completions.borrow()
                        );
                    }
                    Err(e) => warn!("completion accept failed: {e}"),
                },
            }
        }
    }

    /// Releases once `expected` handshakes have been counted. Zero
    /// releases immediately.
    pub async fn wait_for(&self, expected: usize) {
        let mut completions = self.completions.subscribe();
        completions
            .wait_for(|&count| count >= expected)
            .await
            .expect("completion counter closed");
    }

    pub async fn stop(&self) {
        self.shutdown.cancel();
        let task = self
            .listener_task
            .lock()
            .expect("completion task lock poisoned")
            .take();
        if let Some(task) = task {
            task.await.expect("completion listener panicked");
        }
    }
}

/// Dial each peer's completion port once. Failures are logged and skipped:
/// a peer that is already gone cannot be waiting on us.
pub async fn notify_peers(peers: &[(String, Ipv4Addr)], port: u16) {
    for (node, ip) in peers {
        match TcpStream::connect((*ip, port)).await {
            Ok(_stream) => info!("notified completion to {node} ({ip})"),
            Err(e) => warn!("could not notify {node} ({ip}:{port}): {e}"),
        }
    }
}

#[tokio::test]
async fn barrier_releases_at_expected_count() {
    let barrier = CompletionBarrier::start(0).await.unwrap();
    let port = barrier.port();

    let waiter = {
        let barrier = Arc::clone(&barrier);
        tokio::spawn(async move { barrier.wait_for(3).await })
    };
    for _ in 0..3 {
        TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    }
    waiter.await.unwrap();
    barrier.stop().await;
}

#[tokio::test]
async fn barrier_with_zero_expected_releases_immediately() {
    let barrier = CompletionBarrier::start(0).await.unwrap();
    barrier.wait_for(0).await;
    barrier.stop().await;
}

#[tokio::test]
async fn notify_skips_unreachable_peers() {
    // port 1 is never listening; this must come back rather than error out
    notify_peers(&[("ghost".to_string(), "127.0.0.1".parse().unwrap())], 1).await;
}
