//! Raw byte relays: CONNECT tunnels to hosts that need no authentication, and
//! upgraded WebSocket connections.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::proxy::dispatcher::{ProxyDispatcher, WebSocketCloseAction};
use crate::target::TargetDescriptor;

/// Open the TCP connection behind a CONNECT tunnel.
pub async fn connect_target(target: &TargetDescriptor) -> io::Result<TcpStream> {
    let stream = TcpStream::connect((target.hostname(), target.port())).await?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// Relay bytes until either side closes or `close` fires.
pub async fn run_tunnel<C>(mut client: C, mut server: TcpStream, target: &TargetDescriptor, close: CancellationToken)
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    tokio::select! {
        res = tokio::io::copy_bidirectional(&mut client, &mut server) => match res {
            Ok((up, down)) => debug!(target = %target, up, down, "tunnel closed"),
            Err(e) => log_tunnel_error(target, &e),
        },
        _ = close.cancelled() => debug!(target = %target, "tunnel closed by proxy"),
    }
    let _ = client.shutdown().await;
    let _ = server.shutdown().await;
}

/// Copy one direction of a spliced connection, then shut the writer down.
async fn relay<R, W>(mut reader: R, mut writer: W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let res = tokio::io::copy(&mut reader, &mut writer).await;
    let _ = writer.shutdown().await;
    res
}

pub(crate) fn log_tunnel_error(target: &TargetDescriptor, e: &io::Error) {
    if e.kind() == io::ErrorKind::ConnectionReset {
        debug!(target = %target, "tunnel connection reset");
    } else {
        warn!(target = %target, error = %e, "unexpected tunnel error");
    }
}

/// Splice an upgraded WebSocket connection. A leg that fails takes the other
/// one down with it; a leg that closes cleanly is forwarded as a shutdown.
pub async fn splice_websocket<C, S>(client: C, server: S, target: &TargetDescriptor)
where
    C: AsyncRead + AsyncWrite + Unpin,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (server_read, server_write) = tokio::io::split(server);
    let mut upstream = Box::pin(relay(client_read, server_write));
    let mut downstream = Box::pin(relay(server_read, client_write));

    let (first, closed_by_server) = tokio::select! {
        res = &mut upstream => (res, false),
        res = &mut downstream => (res, true),
    };
    let code = match &first {
        Ok(_) => 1000,
        Err(e) => {
            debug!(target = %target, error = %e, closed_by_server, "websocket leg failed");
            1006
        }
    };

    // A finished leg has released its halves, so dropping the other leg
    // releases the last half of each stream and closes both.
    match ProxyDispatcher::on_websocket_close(code, closed_by_server) {
        WebSocketCloseAction::Propagate => {
            let rest = if closed_by_server { upstream.await } else { downstream.await };
            if let Err(e) = rest {
                debug!(target = %target, error = %e, "websocket closed with error");
            }
        }
        WebSocketCloseAction::TerminateClient => {
            drop(upstream);
            debug!(target = %target, "server leg lost, terminated client websocket");
        }
        WebSocketCloseAction::TerminateServer => {
            drop(downstream);
            debug!(target = %target, "client leg lost, terminated server websocket");
        }
    }
    debug!(target = %target, "websocket closed");
}
