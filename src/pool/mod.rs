//! Server-side data channel pool
//!
//! After the control handshake consumes the first tunnel connection, every
//! further connection the remote client opens to the tunnel listener is a
//! data channel. The pool accepts them, optionally completes a TLS
//! handshake, and registers them idle under freshly generated ids.
//!
//! Channels are held in arrival order. The client keeps its side of the
//! pool in the same order it opened the connections, so a launch frame
//! carrying an id pairs up without any in-band id exchange.

use rand::Rng;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Unified duplex byte stream for data channels (plain TCP or TLS).
pub trait ChannelStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ChannelStream for T {}

/// A pooled data channel, boxed over its transport.
pub type DataChannel = Box<dyn ChannelStream>;

/// Upper bound on the TLS handshake for one inbound data channel.
const TLS_ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Pool of idle data channels accepted from the remote client.
pub struct ChannelPool {
    listener: Mutex<Option<TcpListener>>,
    tls: Option<TlsAcceptor>,
    idle: Mutex<VecDeque<(String, DataChannel)>>,
    cancel: CancellationToken,
}

impl ChannelPool {
    /// Take ownership of the tunnel listener; the control connection must
    /// already have been accepted off it.
    pub fn new(
        listener: TcpListener,
        tls: Option<TlsAcceptor>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            listener: Mutex::new(Some(listener)),
            tls,
            idle: Mutex::new(VecDeque::new()),
            cancel,
        }
    }

    /// Accept inbound tunnel connections and register them idle until
    /// cancelled. TLS handshakes run inline so registration order matches
    /// the client's connect order. The manager owns the listener for its
    /// lifetime; the tunnel port closes when it drains.
    pub async fn manager(&self) {
        let listener = match self.listener.lock().unwrap().take() {
            Some(listener) => listener,
            None => return,
        };
        loop {
            let (stream, peer) = tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("Tunnel listener closed: {:?}", listener.local_addr().ok());
                    return;
                }
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        debug!("Tunnel accept failed: {}", e);
                        continue;
                    }
                },
            };

            stream.set_nodelay(true).ok();

            let channel: DataChannel = match &self.tls {
                Some(acceptor) => {
                    match tokio::time::timeout(TLS_ACCEPT_TIMEOUT, acceptor.accept(stream)).await {
                        Ok(Ok(tls_stream)) => Box::new(tls_stream),
                        Ok(Err(e)) => {
                            debug!("Data channel TLS accept failed: {}", e);
                            continue;
                        }
                        Err(_) => {
                            debug!("Data channel TLS accept timed out: {}", peer);
                            continue;
                        }
                    }
                }
                None => Box::new(stream),
            };

            let mut idle = self.idle.lock().unwrap();
            let id = new_channel_id(&idle);
            debug!("Data channel registered: {} <- {}", id, peer);
            idle.push_back((id, channel));
        }
    }

    /// True once at least one idle channel exists.
    pub fn ready(&self) -> bool {
        !self.idle.lock().unwrap().is_empty()
    }

    /// Atomically remove and return the oldest idle channel, or `None`
    /// when the pool is empty (transient; the caller skips the exchange).
    pub fn get(&self) -> Option<(String, DataChannel)> {
        self.idle.lock().unwrap().pop_front()
    }

    /// Close every currently idle channel. Checked-out channels are
    /// unaffected; previously handed-out ids cannot collide with the new
    /// set because ids are generated fresh on registration.
    pub fn flush(&self) {
        let drained: Vec<_> = self.idle.lock().unwrap().drain(..).collect();
        debug!("Pool flushed: {} idle channels closed", drained.len());
    }

    /// Number of currently idle channels.
    pub fn active(&self) -> usize {
        self.idle.lock().unwrap().len()
    }

    /// Stop the manager and close every idle channel. The pool tracks idle
    /// channels only; a checked-out channel is owned by its relay worker,
    /// which observes the same cancellation token and aborts with it.
    pub fn close(&self) {
        self.cancel.cancel();
        self.idle.lock().unwrap().clear();
    }
}

/// Fresh 8-hex-char id, unique among the currently idle channels.
/// Checked-out ids are excluded on purpose: uniqueness only matters while
/// a channel is idle, and an id leaves both sides' pools at launch.
fn new_channel_id(idle: &VecDeque<(String, DataChannel)>) -> String {
    loop {
        let id = format!("{:08x}", rand::thread_rng().gen::<u32>());
        if !idle.iter().any(|(existing, _)| *existing == id) {
            return id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn pool_with_manager() -> (Arc<ChannelPool>, std::net::SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let pool = Arc::new(ChannelPool::new(listener, None, CancellationToken::new()));

        let manager = pool.clone();
        tokio::spawn(async move { manager.manager().await });

        (pool, addr)
    }

    async fn wait_for_active(pool: &ChannelPool, n: usize) {
        for _ in 0..200 {
            if pool.active() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("pool never reached {} idle channels", n);
    }

    #[tokio::test]
    async fn test_manager_registers_idle_channels() {
        let (pool, addr) = pool_with_manager().await;
        assert!(!pool.ready());

        let _c1 = TcpStream::connect(addr).await.unwrap();
        let _c2 = TcpStream::connect(addr).await.unwrap();
        wait_for_active(&pool, 2).await;

        assert!(pool.ready());
        assert_eq!(pool.active(), 2);
    }

    #[tokio::test]
    async fn test_get_returns_oldest_first() {
        let (pool, addr) = pool_with_manager().await;

        let mut first = TcpStream::connect(addr).await.unwrap();
        first.write_all(b"first").await.unwrap();
        wait_for_active(&pool, 1).await;

        let mut second = TcpStream::connect(addr).await.unwrap();
        second.write_all(b"second").await.unwrap();
        wait_for_active(&pool, 2).await;

        let (id_a, mut chan_a) = pool.get().unwrap();
        let (id_b, mut chan_b) = pool.get().unwrap();
        assert_ne!(id_a, id_b);
        assert_eq!(pool.active(), 0);

        let mut buf = [0u8; 5];
        chan_a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"first");

        let mut buf = [0u8; 6];
        chan_b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"second");
    }

    #[tokio::test]
    async fn test_get_on_empty_pool() {
        let (pool, _addr) = pool_with_manager().await;
        assert!(pool.get().is_none());
    }

    #[tokio::test]
    async fn test_flush_closes_idle_only() {
        let (pool, addr) = pool_with_manager().await;

        let mut kept = TcpStream::connect(addr).await.unwrap();
        wait_for_active(&pool, 1).await;
        let (_id, mut checked_out) = pool.get().unwrap();

        let mut flushed = TcpStream::connect(addr).await.unwrap();
        wait_for_active(&pool, 1).await;

        pool.flush();
        assert_eq!(pool.active(), 0);

        // The flushed channel's client end sees EOF
        let mut buf = [0u8; 1];
        assert_eq!(flushed.read(&mut buf).await.unwrap(), 0);

        // The checked-out channel still works
        kept.write_all(b"x").await.unwrap();
        checked_out.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"x");
    }

    #[tokio::test]
    async fn test_close_stops_manager() {
        let (pool, addr) = pool_with_manager().await;

        let mut conn = TcpStream::connect(addr).await.unwrap();
        wait_for_active(&pool, 1).await;

        pool.close();
        pool.close();
        assert_eq!(pool.active(), 0);

        let mut buf = [0u8; 1];
        assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
    }
}
