//! Tunnel server lifecycle
//!
//! One `Server` owns the tunnel listener, the control connection, the data
//! channel pool and the target dispatchers for a single remote client.
//! `manage` supervises it: `start` runs until the control channel dies,
//! then the cycle is torn down with `stop` and retried after a cooldown.
//! An interrupt or termination signal ends supervision with a bounded
//! graceful shutdown.

mod dispatch;

use crate::config::{ServerConfig, Tunables};
use crate::pool::ChannelPool;
use crate::protocol::ControlFrame;
use crate::stats::TrafficStats;
use crate::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Write side of the control channel. Every frame goes through the mutex,
/// so no two writes interleave at the byte level and the client observes
/// launch and flush frames in a well-defined order.
pub(crate) struct ControlChannel {
    writer: Mutex<OwnedWriteHalf>,
    peer: SocketAddr,
}

impl ControlChannel {
    pub(crate) async fn send(&self, frame: &ControlFrame) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame.encode()).await
    }

    async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    pub(crate) fn peer(&self) -> SocketAddr {
        self.peer
    }
}

/// Addresses bound by the current start cycle.
#[derive(Debug, Clone, Copy)]
pub struct BoundAddrs {
    pub tunnel: SocketAddr,
    pub target_tcp: SocketAddr,
    pub target_udp: SocketAddr,
}

/// Resources owned by one start cycle, torn down by `stop`.
#[derive(Default)]
struct RunState {
    cancel: Option<CancellationToken>,
    pool: Option<Arc<ChannelPool>>,
    control: Option<Arc<ControlChannel>>,
    bound: Option<BoundAddrs>,
    tasks: Vec<JoinHandle<()>>,
}

/// Reverse tunnel relay server for a single remote client.
pub struct Server {
    config: ServerConfig,
    tls: Option<TlsAcceptor>,
    tunables: Tunables,
    stats: Arc<TrafficStats>,
    semaphore: Arc<Semaphore>,
    state: Mutex<RunState>,
}

impl Server {
    pub fn new(config: ServerConfig, tls: Option<TlsAcceptor>, tunables: Tunables) -> Arc<Self> {
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(tunables.semaphore_limit)),
            stats: Arc::new(TrafficStats::new()),
            state: Mutex::new(RunState::default()),
            config,
            tls,
            tunables,
        })
    }

    /// Shared traffic counters.
    pub fn stats(&self) -> Arc<TrafficStats> {
        self.stats.clone()
    }

    /// Addresses bound by the current start cycle, once listeners are up.
    pub async fn bound_addrs(&self) -> Option<BoundAddrs> {
        self.state.lock().await.bound
    }

    /// Number of idle data channels in the current pool.
    pub async fn pool_active(&self) -> usize {
        let state = self.state.lock().await;
        state.pool.as_ref().map(|pool| pool.active()).unwrap_or(0)
    }

    /// Run the server until an interrupt or termination signal arrives,
    /// restarting `start` after the service cooldown whenever it fails.
    pub async fn manage(&self) {
        let shutdown = CancellationToken::new();

        let interrupt = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                interrupt.cancel();
            }
        });

        #[cfg(unix)]
        {
            let terminate = shutdown.clone();
            tokio::spawn(async move {
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(mut term) => {
                        term.recv().await;
                        terminate.cancel();
                    }
                    Err(e) => warn!("Failed to install SIGTERM handler: {}", e),
                }
            });
        }

        self.supervise(shutdown).await;
    }

    /// Supervision loop behind `manage`: restart `start` after the service
    /// cooldown whenever it fails, until `shutdown` fires, then tear down
    /// within the shutdown timeout.
    pub async fn supervise(&self, shutdown: CancellationToken) {
        info!(
            "Server started: {} -> {}/{}",
            self.config.tunnel_addr, self.config.target_tcp_addr, self.config.target_udp_addr
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.start() => {
                    if let Err(e) = result {
                        error!("Server error: {}", e);
                    }
                    self.stop().await;
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.tunables.service_cooldown()) => {}
                    }
                    info!("Server restarted");
                }
            }
        }

        match tokio::time::timeout(self.tunables.shutdown_timeout(), self.stop()).await {
            Ok(()) => info!("Server shutdown complete"),
            Err(_) => warn!("Server shutdown timed out; abandoning in-flight tasks"),
        }
    }

    /// One server cycle: bind the listeners, handshake the control channel,
    /// build the pool, spawn the dispatchers and run the health loop on the
    /// calling task. Returns when the control channel dies or the cycle is
    /// cancelled.
    pub async fn start(&self) -> Result<()> {
        let cancel = CancellationToken::new();

        let tunnel_listener = TcpListener::bind(self.config.tunnel_addr).await?;
        let target_listener = TcpListener::bind(self.config.target_tcp_addr).await?;
        let target_udp = UdpSocket::bind(self.config.target_udp_addr).await?;

        let bound = BoundAddrs {
            tunnel: tunnel_listener.local_addr()?,
            target_tcp: target_listener.local_addr()?,
            target_udp: target_udp.local_addr()?,
        };

        {
            let mut state = self.state.lock().await;
            state.cancel = Some(cancel.clone());
            state.bound = Some(bound);
        }

        let control = Arc::new(self.handshake(&tunnel_listener, &cancel).await?);

        let pool = Arc::new(ChannelPool::new(
            tunnel_listener,
            self.tls.clone(),
            cancel.child_token(),
        ));

        let mut tasks = Vec::new();

        {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move { pool.manager().await }));
        }

        let ctx = dispatch::DispatchContext {
            cancel: cancel.clone(),
            pool: pool.clone(),
            control: control.clone(),
            semaphore: self.semaphore.clone(),
            stats: self.stats.clone(),
            tunables: self.tunables.clone(),
        };
        tasks.push(tokio::spawn(dispatch::run(ctx, target_listener, target_udp)));

        tasks.push(tokio::spawn(stats_reporter(
            self.stats.clone(),
            self.tunables.report_interval(),
            cancel.child_token(),
            pool.clone(),
        )));

        {
            let mut state = self.state.lock().await;
            state.pool = Some(pool.clone());
            state.control = Some(control.clone());
            state.tasks = tasks;
        }

        self.health_check(&cancel, &control, &pool).await
    }

    /// Idempotent teardown of the current start cycle. Safe to call again
    /// from the restart loop or after a completed shutdown.
    pub async fn stop(&self) {
        let state = {
            let mut guard = self.state.lock().await;
            std::mem::take(&mut *guard)
        };

        if let Some(cancel) = &state.cancel {
            cancel.cancel();
        }

        if let Some(pool) = &state.pool {
            let active = pool.active();
            pool.close();
            debug!("Tunnel pool closed: {} idle channels", active);
        }

        if let Some(control) = &state.control {
            control.close().await;
            debug!("Control connection closed: {}", control.peer());
        }

        // The dispatcher task owns the target listener and UDP socket; both
        // close when it drains here. Per-exchange workers are detached but
        // observe the cancelled token and abort their exchanges.
        for task in state.tasks {
            let _ = task.await;
        }
    }

    /// Accept the first tunnel connection as the control channel and send
    /// the handshake frame carrying the TLS mode code. No reply is read.
    async fn handshake(
        &self,
        tunnel_listener: &TcpListener,
        cancel: &CancellationToken,
    ) -> Result<ControlChannel> {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            accepted = tunnel_listener.accept() => accepted?,
        };
        stream.set_nodelay(true)?;
        let local = stream.local_addr()?;

        // The server never reads from the control channel; liveness is
        // detected through keepalive write failures.
        let (_read_half, write_half) = stream.into_split();

        let control = ControlChannel {
            writer: Mutex::new(write_half),
            peer,
        };
        control
            .send(&ControlFrame::Handshake {
                tls_code: self.config.tls_code.clone(),
            })
            .await?;

        debug!("Tunnel handshaked: {} <-> {}", local, peer);
        Ok(control)
    }

    /// Keepalive and pool-reload loop; the liveness detector for the
    /// control channel. Any write failure ends the start cycle.
    async fn health_check(
        &self,
        cancel: &CancellationToken,
        control: &ControlChannel,
        pool: &ChannelPool,
    ) -> Result<()> {
        let mut last_flushed = Instant::now();
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            {
                let mut writer = control.writer.lock().await;
                if last_flushed.elapsed() >= self.tunables.reload_interval() {
                    writer.write_all(&ControlFrame::Flush.encode()).await?;
                    pool.flush();
                    // Hold the writer through one report interval so no
                    // launch frame races the client's pool rebuild.
                    tokio::time::sleep(self.tunables.report_interval()).await;
                    last_flushed = Instant::now();
                    debug!("Tunnel pool reset: {} active connections", pool.active());
                } else {
                    writer.write_all(&ControlFrame::Keepalive.encode()).await?;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(self.tunables.report_interval()) => {}
            }
        }
    }

}

/// Periodic checkpoint of the traffic counters and pool occupancy.
async fn stats_reporter(
    stats: Arc<TrafficStats>,
    period: std::time::Duration,
    cancel: CancellationToken,
    pool: Arc<ChannelPool>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {
                let (tcp_in, tcp_out) = stats.tcp();
                let (udp_in, udp_out) = stats.udp();
                debug!(
                    "Traffic checkpoint: tcp {}/{} udp {}/{} pool {}",
                    tcp_in, tcp_out, udp_in, udp_out, pool.active()
                );
            }
        }
    }
}
