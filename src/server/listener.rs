//! Accept Loop and Session Read Loop
//!
//! One task per connection. The read loop accumulates bytes, parses
//! complete frames, executes them through the dispatcher, and writes the
//! reply frames through the session's shared write handle. Commands are
//! strictly sequential per session: a reply is fully written before the
//! next command is read, so pipelined commands interleave only at frame
//! boundaries with any pub/sub deliveries.
//!
//! A protocol framing error is not reported to the client; the
//! connection is closed (there is no way to resynchronize a RESP
//! stream). On shutdown the loop stops accepting, signals every session,
//! and waits up to 30 seconds before aborting what is left.

use crate::commands::CommandHandler;
use crate::protocol::parser::MAX_BULK_SIZE;
use crate::protocol::RespParser;
use crate::server::session::{Session, SessionHandle};
use bytes::{Buf, BytesMut};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Initial read buffer capacity.
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Hard cap on buffered input: one maximal bulk string plus framing.
const MAX_BUFFER_SIZE: usize = MAX_BULK_SIZE + 64 * 1024;

/// Shutdown drain budget.
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(30);

/// Runs the accept loop until shutdown. Returns `true` when every
/// session drained within the budget.
pub async fn serve(
    listener: TcpListener,
    handler: CommandHandler,
    mut shutdown_rx: watch::Receiver<bool>,
    outbound_capacity: usize,
) -> bool {
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        let handler = handler.clone();
                        let shutdown_rx = shutdown_rx.clone();
                        sessions.spawn(run_session(
                            stream,
                            addr,
                            handler,
                            shutdown_rx,
                            outbound_capacity,
                        ));
                    }
                    Err(e) => {
                        error!(error = %e, "failed to accept connection");
                    }
                }
            }
        }
    }

    info!(active = sessions.len(), "shutting down, draining sessions");
    let drained = tokio::time::timeout(SHUTDOWN_BUDGET, async {
        while sessions.join_next().await.is_some() {}
    })
    .await
    .is_ok();

    if !drained {
        warn!("shutdown budget exceeded, aborting remaining sessions");
        sessions.abort_all();
    }
    drained
}

/// One connection's lifecycle: read, parse, execute, reply, repeat.
async fn run_session(
    stream: TcpStream,
    addr: SocketAddr,
    handler: CommandHandler,
    mut shutdown_rx: watch::Receiver<bool>,
    outbound_capacity: usize,
) {
    let ctx = handler.context().clone();
    ctx.stats.connection_opened();
    info!(client = %addr, "client connected");

    let (mut read_half, write_half) = stream.into_split();
    let handle = SessionHandle::new(addr, write_half, outbound_capacity);
    let mut session = Session::new(handle.clone(), ctx.auth_password.is_some());
    let mut parser = RespParser::new();
    let mut buffer = BytesMut::with_capacity(INITIAL_BUFFER_SIZE);

    'connection: loop {
        // Drain every complete frame before reading again
        loop {
            if buffer.is_empty() {
                break;
            }
            match parser.parse(&buffer) {
                Ok(Some((frame, consumed))) => {
                    buffer.advance(consumed);
                    let outcome = handler.execute(&mut session, frame).await;
                    if !outcome.replies.is_empty()
                        && handle.send_all(&outcome.replies).await.is_err()
                    {
                        debug!(client = %addr, "write failed, closing");
                        break 'connection;
                    }
                    if outcome.close {
                        break 'connection;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    // Framing errors are unrecoverable mid-stream
                    warn!(client = %addr, error = %e, "protocol error, closing connection");
                    break 'connection;
                }
            }
        }

        if buffer.len() >= MAX_BUFFER_SIZE {
            error!(client = %addr, size = buffer.len(), "input buffer limit exceeded");
            break;
        }
        if buffer.capacity() - buffer.len() < 1024 {
            buffer.reserve(INITIAL_BUFFER_SIZE);
        }

        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    debug!(client = %addr, "closing session on shutdown");
                    break;
                }
            }
            read = read_half.read_buf(&mut buffer) => {
                match read {
                    Ok(0) => {
                        debug!(client = %addr, "client disconnected");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => {
                        debug!(client = %addr, "connection reset by client");
                        break;
                    }
                    Err(e) => {
                        warn!(client = %addr, error = %e, "read error");
                        break;
                    }
                }
            }
        }
    }

    // Teardown: the session tells the hub to forget its handle
    ctx.hub.session_closed(handle.id);
    handle.shutdown().await;
    ctx.stats.connection_closed();
    info!(client = %addr, "client disconnected");
}
