//! Target dispatch loops
//!
//! TCP: accept a local target connection, check a data channel out of the
//! pool, announce the pairing on the control channel, then splice the two
//! until either side closes. UDP: each datagram is an independent one-shot
//! exchange through a fresh data channel, one request then one response.
//! There is no UDP session table, so concurrent datagrams from the same
//! peer travel over independent channels with independent responses.
//!
//! Both loops are gated on the pool holding its first idle channel, and
//! both acquire a semaphore slot before spawning a worker, which stalls
//! further accepts and reads while the relay is saturated.

use super::ControlChannel;
use crate::config::Tunables;
use crate::pool::{ChannelPool, DataChannel};
use crate::protocol::ControlFrame;
use crate::stats::TrafficStats;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Poll step while waiting for the pool's first idle channel.
const READY_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Everything a dispatcher or relay worker needs, cloned per worker.
#[derive(Clone)]
pub(crate) struct DispatchContext {
    pub cancel: CancellationToken,
    pub pool: Arc<ChannelPool>,
    pub control: Arc<ControlChannel>,
    pub semaphore: Arc<Semaphore>,
    pub stats: Arc<TrafficStats>,
    pub tunables: Tunables,
}

/// Wait for the pool to come up, then run both dispatch loops until
/// cancelled. Owns the target listener and UDP socket for the cycle.
pub(crate) async fn run(ctx: DispatchContext, target_listener: TcpListener, target_udp: UdpSocket) {
    loop {
        if ctx.cancel.is_cancelled() {
            return;
        }
        if ctx.pool.ready() {
            break;
        }
        tokio::time::sleep(READY_POLL_INTERVAL).await;
    }

    let target_udp = Arc::new(target_udp);
    tokio::join!(tcp_loop(&ctx, target_listener), udp_loop(&ctx, target_udp));
    debug!("Target listeners closed");
}

async fn tcp_loop(ctx: &DispatchContext, listener: TcpListener) {
    loop {
        let target = tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Target connection accepted: {}", peer);
                    stream.set_nodelay(true).ok();
                    stream
                }
                Err(e) => {
                    debug!("Target accept failed: {}", e);
                    continue;
                }
            },
        };

        // Backpressure: block further accepts while the relay is full.
        let permit = tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            permit = ctx.semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        let ctx = ctx.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = relay_tcp(&ctx, target).await {
                debug!("TCP exchange ended: {}", e);
            }
        });
    }
}

/// One TCP relay: pool checkout, launch signal, bidirectional splice.
/// The data channel and the target connection close when this returns.
async fn relay_tcp(ctx: &DispatchContext, mut target: TcpStream) -> std::io::Result<()> {
    let Some((id, mut channel)) = ctx.pool.get() else {
        warn!("Data channel pool exhausted; dropping target connection");
        return Ok(());
    };

    ctx.control.send(&ControlFrame::launch_tcp(&*id)).await?;
    debug!("TCP launch signal: {} -> {}", id, ctx.control.peer());

    // Abort mid-splice on shutdown; both sockets close on return.
    let (sent, received) = tokio::select! {
        _ = ctx.cancel.cancelled() => {
            debug!("Exchange aborted by shutdown: {}", id);
            return Ok(());
        }
        spliced = tokio::io::copy_bidirectional(&mut channel, &mut target) => spliced?,
    };
    ctx.stats.add_tcp(received, sent);
    debug!("Exchange complete: {} bytes exchanged", received + sent);
    Ok(())
}

async fn udp_loop(ctx: &DispatchContext, socket: Arc<UdpSocket>) {
    loop {
        let mut buf = vec![0u8; ctx.tunables.udp_buf_size];
        let (len, peer) = tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            received = socket.recv_from(&mut buf) => match received {
                Ok(datagram) => datagram,
                Err(e) => {
                    debug!("Target datagram read failed: {}", e);
                    continue;
                }
            },
        };

        ctx.stats.add_udp_received(len as u64);

        let Some((id, channel)) = ctx.pool.get() else {
            debug!("Data channel pool exhausted; dropping datagram from {}", peer);
            continue;
        };

        let permit = tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            permit = ctx.semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        let ctx = ctx.clone();
        let socket = socket.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = relay_udp(&ctx, socket, buf, len, peer, id, channel).await {
                debug!("UDP exchange ended: {}", e);
            }
        });
    }
}

/// One UDP exchange: launch signal, request write, single response read,
/// reply to the originating peer address. The response is truncated if it
/// exceeds the buffer; that is a protocol property, not an accident.
async fn relay_udp(
    ctx: &DispatchContext,
    socket: Arc<UdpSocket>,
    mut buf: Vec<u8>,
    len: usize,
    peer: SocketAddr,
    id: String,
    mut channel: DataChannel,
) -> std::io::Result<()> {
    ctx.control.send(&ControlFrame::launch_udp(&*id)).await?;
    debug!("UDP launch signal: {} -> {}", id, ctx.control.peer());

    let exchange = async {
        channel.write_all(&buf[..len]).await?;

        // Exactly one read: the exchange is request/response, not a stream.
        let n = channel.read(&mut buf).await?;
        socket.send_to(&buf[..n], peer).await?;
        ctx.stats.add_udp_sent(n as u64);

        channel.shutdown().await.ok();
        debug!("Transfer complete: {} bytes transferred", len + n);
        Ok(())
    };

    // Abort on shutdown; the data channel closes on return.
    tokio::select! {
        _ = ctx.cancel.cancelled() => {
            debug!("Exchange aborted by shutdown: {}", id);
            Ok(())
        }
        result = exchange => result,
    }
}
