//! Per-connection protocol driver.
//!
//! A connection moves through three phases:
//!
//! - **awaiting hello**: the first complete line names the session. A line
//!   that is not a well-formed hello still admits the peer under a name derived
//!   from its remote port.
//! - **active**: every following line is relayed to the other sessions under
//!   the registered name, whatever name the peer puts in the line.
//! - **closed**: the session is unregistered, its connection closed, and the
//!   remaining sessions are told it left.

use std::{net::SocketAddr, sync::Arc};

use futures::StreamExt;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    select,
};
use tokio_util::codec::FramedRead;
use tracing::{debug, info};

use crate::{
    codec::{CodecError, LineCodec, decode_frame, encode_line},
    dispatch::broadcast,
    envelope::{Chat, Envelope},
    registry::{Registry, Session},
};

/// What one line received from an active session asks the server to do.
#[derive(Debug)]
pub enum Inbound {
    /// Blank line.
    Empty,
    /// Not a JSON object; skipped.
    Malformed(CodecError),
    /// The `/quit` sentinel.
    Quit,
    /// Text to relay. May be empty when the line carried no string `message`.
    Message(String),
}

pub fn classify_line(line: &[u8]) -> Inbound {
    if line.trim_ascii().is_empty() {
        return Inbound::Empty;
    }

    match decode_frame(line) {
        Ok(frame) if frame.is_quit() => Inbound::Quit,
        // Only string messages are relayed. Numbers, booleans, arrays and
        // objects collapse to the empty message, which is never broadcast.
        Ok(frame) => Inbound::Message(frame.message().unwrap_or_default().to_string()),
        Err(error) => Inbound::Malformed(error),
    }
}

/// Picks the display name for a connection from its first line.
pub fn resolve_name(first_line: &[u8], peer: SocketAddr) -> String {
    decode_frame(first_line)
        .ok()
        .and_then(|frame| {
            frame
                .hello_name()
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
        })
        .unwrap_or_else(|| fallback_name(peer))
}

pub fn fallback_name(peer: SocketAddr) -> String {
    format!("user@{}", peer.port())
}

/// Why a session reached its terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Quit,
    PeerClosed,
    ReadError,
    Shutdown,
}

enum Phase<W> {
    AwaitingHello(W),
    Active(Arc<Session>),
    Closed(Option<Arc<Session>>, CloseReason),
}

/// Drives one connection from its first byte to teardown.
pub async fn handle_connection<R, W>(
    reader: R,
    writer: W,
    peer: SocketAddr,
    registry: Arc<Registry>,
) -> CloseReason
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let mut lines = FramedRead::new(reader, LineCodec::default());
    let mut phase = Phase::AwaitingHello(writer);

    loop {
        phase = match phase {
            Phase::AwaitingHello(writer) => handshake(&mut lines, writer, peer, &registry).await,
            Phase::Active(session) => {
                let reason = relay(&mut lines, &registry, &session).await;
                Phase::Closed(Some(session), reason)
            }
            Phase::Closed(session, reason) => {
                teardown(&registry, session, reason).await;
                return reason;
            }
        };
    }
}

async fn handshake<R, W>(
    lines: &mut FramedRead<R, LineCodec>,
    mut writer: W,
    peer: SocketAddr,
    registry: &Registry,
) -> Phase<W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let first_line = match lines.next().await {
        Some(Ok(line)) => line,
        other => {
            let reason = match other {
                Some(Err(error)) => {
                    debug!(%peer, ?error, "read failed before handshake");
                    CloseReason::ReadError
                }
                _ => {
                    debug!(%peer, "connection closed before handshake");
                    CloseReason::PeerClosed
                }
            };
            if let Err(error) = writer.shutdown().await {
                debug!(%peer, ?error, "failed to close unregistered connection");
            }
            return Phase::Closed(None, reason);
        }
    };

    let name = resolve_name(&first_line, peer);
    let session = Arc::new(Session::new(registry.next_id(), name, peer, writer));
    enter(registry, &session).await;
    Phase::Active(session)
}

async fn enter(registry: &Registry, session: &Arc<Session>) {
    let name = session.name();
    let welcome = Chat::system(format!("Welcome, {name}! Type /quit to leave"));

    match encode_line(&Envelope::from(welcome)) {
        Ok(line) => {
            if let Err(error) = registry.register_with_greeting(Arc::clone(session), &line).await {
                debug!(conn = session.id(), ?error, "failed to deliver welcome");
            }
        }
        Err(error) => {
            debug!(conn = session.id(), ?error, "failed to encode welcome");
            registry.register(Arc::clone(session)).await;
        }
    }

    info!(peer = %session.addr(), conn = session.id(), name, "session joined");
    broadcast(
        registry,
        &Envelope::from(Chat::system(format!("{name} joined"))),
        Some(session.id()),
    )
    .await;
}

async fn relay<R>(
    lines: &mut FramedRead<R, LineCodec>,
    registry: &Registry,
    session: &Session,
) -> CloseReason
where
    R: AsyncRead + Unpin,
{
    loop {
        let next = select! {
            _ = session.closed() => return CloseReason::Shutdown,
            next = lines.next() => next,
        };

        let line = match next {
            Some(Ok(line)) => line,
            Some(Err(error)) => {
                debug!(conn = session.id(), ?error, "read failed");
                return CloseReason::ReadError;
            }
            None => return CloseReason::PeerClosed,
        };

        match classify_line(&line) {
            Inbound::Empty => {}
            Inbound::Malformed(error) => {
                debug!(conn = session.id(), %error, "ignoring malformed line");
            }
            Inbound::Quit => return CloseReason::Quit,
            Inbound::Message(message) => {
                if message.is_empty() {
                    continue;
                }
                let chat = Chat::new(session.name(), message);
                broadcast(registry, &Envelope::from(chat), Some(session.id())).await;
            }
        }
    }
}

async fn teardown(registry: &Registry, session: Option<Arc<Session>>, reason: CloseReason) {
    let Some(session) = session else {
        return;
    };

    let removed = registry.unregister(session.id()).await;
    if let Err(error) = session.close().await {
        debug!(conn = session.id(), ?error, "failed to close connection");
    }

    if let Some(removed) = removed {
        info!(
            peer = %removed.addr(),
            conn = removed.id(),
            name = removed.name(),
            ?reason,
            "session left"
        );
        broadcast(
            registry,
            &Envelope::from(Chat::system(format!("{} left", removed.name()))),
            None,
        )
        .await;
    }
}
