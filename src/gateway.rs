//! Host-side exposure of the service port.
//!
//! A connection holds one of `limit` permits only while an exchange is open:
//! from the first client bytes until upstream has answered and both
//! directions have then been quiet for the quiet period. A pending request
//! keeps its permit however long the answer takes; an idle keep-alive
//! socket does not. Exchanges beyond the limit queue. The same accounting
//! feeds the idle watchdog.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep_until, Instant};

/// Silence after an answer that ends an exchange.
pub const DEFAULT_QUIET_PERIOD: Duration = Duration::from_secs(2);
const BUF_SIZE: usize = 16 * 1024;

/// In-flight count and time of the last change, shared with the watchdog.
#[derive(Debug)]
pub struct Activity {
    in_flight: AtomicUsize,
    last: Mutex<Instant>,
}

impl Activity {
    pub fn new() -> Self {
        Self {
            in_flight: AtomicUsize::new(0),
            last: Mutex::new(Instant::now()),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn idle_for(&self) -> Duration {
        let last = *self.last.lock().unwrap_or_else(|e| e.into_inner());
        Instant::now().saturating_duration_since(last)
    }

    pub fn begin(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.touch();
    }

    pub fn end(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.touch();
    }

    fn touch(&self) {
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Gateway {
    listener: TcpListener,
    upstream: SocketAddr,
    permits: Arc<Semaphore>,
    activity: Arc<Activity>,
    quiet: Duration,
}

impl Gateway {
    pub async fn bind(listen: SocketAddr, upstream: SocketAddr, limit: u32) -> io::Result<Self> {
        let listener = TcpListener::bind(listen).await?;
        Ok(Self {
            listener,
            upstream,
            permits: Arc::new(Semaphore::new(limit.max(1) as usize)),
            activity: Arc::new(Activity::new()),
            quiet: DEFAULT_QUIET_PERIOD,
        })
    }

    #[cfg(test)]
    pub fn with_quiet_period(mut self, quiet: Duration) -> Self {
        self.quiet = quiet;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn activity(&self) -> Arc<Activity> {
        Arc::clone(&self.activity)
    }

    /// Accepts and forwards connections until `shutdown` resolves.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> io::Result<()> {
        tracing::info!(listen = ?self.listener.local_addr().ok(), upstream = %self.upstream, "gateway accepting");
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("gateway shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (inbound, peer) = match accepted {
                        Ok(a) => a,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let permits = Arc::clone(&self.permits);
                    let activity = Arc::clone(&self.activity);
                    let upstream = self.upstream;
                    let quiet = self.quiet;
                    tokio::spawn(async move {
                        if let Err(e) = forward(inbound, upstream, permits, activity, quiet).await {
                            tracing::debug!(%peer, error = %e, "connection closed with error");
                        }
                    });
                }
            }
        }
    }
}

/// The permit and in-flight mark of one open exchange.
struct Exchange {
    _permit: OwnedSemaphorePermit,
    activity: Arc<Activity>,
}

impl Exchange {
    async fn open(permits: &Arc<Semaphore>, activity: &Arc<Activity>) -> io::Result<Self> {
        let permit = Arc::clone(permits)
            .acquire_owned()
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        activity.begin();
        Ok(Self {
            _permit: permit,
            activity: Arc::clone(activity),
        })
    }
}

impl Drop for Exchange {
    fn drop(&mut self) {
        self.activity.end();
    }
}

async fn forward(
    inbound: TcpStream,
    upstream: SocketAddr,
    permits: Arc<Semaphore>,
    activity: Arc<Activity>,
    quiet: Duration,
) -> io::Result<()> {
    let outbound = TcpStream::connect(upstream).await?;
    let (mut client_r, mut client_w) = inbound.into_split();
    let (mut up_r, mut up_w) = outbound.into_split();

    let mut client_buf = vec![0u8; BUF_SIZE];
    let mut up_buf = vec![0u8; BUF_SIZE];
    let mut exchange: Option<Exchange> = None;
    // Upstream has sent something since the client last did.
    let mut answered = false;
    let mut client_open = true;
    let mut last_io = Instant::now();

    loop {
        tokio::select! {
            read = client_r.read(&mut client_buf), if client_open => {
                let n = read?;
                if n == 0 {
                    client_open = false;
                    up_w.shutdown().await?;
                    continue;
                }
                if exchange.is_none() {
                    exchange = Some(Exchange::open(&permits, &activity).await?);
                }
                up_w.write_all(&client_buf[..n]).await?;
                answered = false;
                last_io = Instant::now();
            }
            read = up_r.read(&mut up_buf) => {
                let n = read?;
                if n == 0 {
                    client_w.shutdown().await?;
                    return Ok(());
                }
                client_w.write_all(&up_buf[..n]).await?;
                answered = true;
                last_io = Instant::now();
            }
            _ = sleep_until(last_io + quiet), if answered && exchange.is_some() => {
                exchange = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::{mpsc, oneshot};
    use tokio::time::timeout;

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = sock.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    /// Reports what it receives and never answers.
    async fn silent_server() -> (SocketAddr, mpsc::UnboundedReceiver<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 64];
                    while let Ok(n) = sock.read(&mut buf).await {
                        if n == 0 || tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        (addr, rx)
    }

    async fn start_gateway(upstream: SocketAddr, limit: u32, quiet: Duration) -> (SocketAddr, Arc<Activity>, oneshot::Sender<()>) {
        let gw = Gateway::bind("127.0.0.1:0".parse().unwrap(), upstream, limit)
            .await
            .unwrap()
            .with_quiet_period(quiet);
        let addr = gw.local_addr().unwrap();
        let activity = gw.activity();
        let (tx, rx) = oneshot::channel::<()>();
        tokio::spawn(gw.run(async move {
            let _ = rx.await;
        }));
        (addr, activity, tx)
    }

    async fn roundtrip(sock: &mut TcpStream, msg: &[u8]) -> Vec<u8> {
        sock.write_all(msg).await.unwrap();
        let mut buf = vec![0u8; msg.len()];
        sock.read_exact(&mut buf).await.unwrap();
        buf
    }

    async fn wait_for_in_flight(activity: &Activity, n: usize) {
        timeout(Duration::from_secs(5), async {
            while activity.in_flight() != n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("in-flight count never settled");
    }

    #[tokio::test]
    async fn test_forwards_bytes() {
        let (addr, activity, _tx) = start_gateway(echo_server().await, 2, DEFAULT_QUIET_PERIOD).await;
        let mut sock = TcpStream::connect(addr).await.unwrap();
        assert_eq!(roundtrip(&mut sock, b"ping").await, b"ping");
        assert_eq!(activity.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_pending_request_holds_the_only_permit() {
        let (upstream, mut received) = silent_server().await;
        let (addr, activity, _tx) = start_gateway(upstream, 1, Duration::from_millis(100)).await;

        let mut first = TcpStream::connect(addr).await.unwrap();
        first.write_all(b"one").await.unwrap();
        assert_eq!(received.recv().await.unwrap(), b"one");

        let mut second = TcpStream::connect(addr).await.unwrap();
        second.write_all(b"two").await.unwrap();
        let forwarded = timeout(Duration::from_millis(500), received.recv()).await;
        assert!(forwarded.is_err(), "second request passed while the first was unanswered");
        assert_eq!(activity.in_flight(), 1);

        drop(first);
        let got = timeout(Duration::from_secs(5), received.recv())
            .await
            .expect("second request never forwarded")
            .unwrap();
        assert_eq!(got, b"two");
    }

    #[tokio::test]
    async fn test_idle_keepalive_releases_its_permit() {
        let (addr, activity, _tx) = start_gateway(echo_server().await, 1, Duration::from_millis(200)).await;

        let mut first = TcpStream::connect(addr).await.unwrap();
        assert_eq!(roundtrip(&mut first, b"one").await, b"one");
        wait_for_in_flight(&activity, 0).await;

        // `first` stays open and idle; a new request still gets through.
        let mut second = TcpStream::connect(addr).await.unwrap();
        let echoed = timeout(Duration::from_secs(5), roundtrip(&mut second, b"two"))
            .await
            .expect("request queued behind an idle connection");
        assert_eq!(echoed, b"two");

        wait_for_in_flight(&activity, 0).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(activity.idle_for() >= Duration::from_millis(250));

        // The idle socket is still usable.
        assert_eq!(roundtrip(&mut first, b"three").await, b"three");
    }

    #[tokio::test]
    async fn test_activity_returns_to_zero_on_close() {
        let (addr, activity, _tx) = start_gateway(echo_server().await, 4, DEFAULT_QUIET_PERIOD).await;
        {
            let mut sock = TcpStream::connect(addr).await.unwrap();
            roundtrip(&mut sock, b"x").await;
        }
        wait_for_in_flight(&activity, 0).await;
        assert!(activity.idle_for() < Duration::from_secs(5));
    }

    #[test]
    fn test_activity_counts() {
        let a = Activity::new();
        a.begin();
        a.begin();
        a.end();
        assert_eq!(a.in_flight(), 1);
    }
}
