//! Framed TCP transport.
//!
//! 4-byte big-endian length prefix, one envelope per frame, no TLS — put
//! a terminating proxy in front or use the websocket transport instead.
//! Writes are bounded by a 30 s deadline; connections idle for 300 s are
//! closed.

use crate::transport::{
    ChannelResponder, IDLE_TIMEOUT_SECS, TransportMessage, WRITE_DEADLINE_SECS,
};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

/// Read half of a dialed connection.
pub type FrameReader = FramedRead<OwnedReadHalf, LengthDelimitedCodec>;
/// Write half of a dialed connection.
pub type FrameWriter = FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>;

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::new()
}

/// Bind and serve framed connections into `intake` until `shutdown`
/// fires. Returns the bound address (useful with port 0).
pub async fn listen(
    addr: &str,
    intake: mpsc::Sender<TransportMessage>,
    shutdown: CancellationToken,
) -> std::io::Result<SocketAddr> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, "framed TCP listening");

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(serve_connection(
                            stream,
                            peer,
                            intake.clone(),
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                    }
                }
            }
        }
        tracing::debug!(%local_addr, "framed TCP listener stopped");
    });

    Ok(local_addr)
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    intake: mpsc::Sender<TransportMessage>,
    shutdown: CancellationToken,
) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, codec());
    let mut writer = FramedWrite::new(write_half, codec());
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);

    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let write = writer.send(bytes::Bytes::from(frame));
            match tokio::time::timeout(Duration::from_secs(WRITE_DEADLINE_SECS), write).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!(%peer, error = %e, "write failed, closing");
                    break;
                }
                Err(_) => {
                    tracing::warn!(%peer, "write deadline exceeded, closing");
                    break;
                }
            }
        }
    });

    let responder = ChannelResponder::new(tx);
    let idle = Duration::from_secs(IDLE_TIMEOUT_SECS);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            next = tokio::time::timeout(idle, reader.next()) => match next {
                Err(_) => {
                    tracing::debug!(%peer, "idle connection closed");
                    break;
                }
                Ok(None) => break,
                Ok(Some(Ok(frame))) => {
                    let message = TransportMessage::new(frame.to_vec(), responder.clone())
                        .with_source(peer.to_string());
                    if intake.send(message).await.is_err() {
                        break;
                    }
                }
                Ok(Some(Err(e))) => {
                    tracing::warn!(%peer, error = %e, "frame decode failed, closing");
                    break;
                }
            }
        }
    }
}

/// Dial a remote endpoint, returning the framed halves. Callers keep one
/// connection per remote endpoint and multiplex their calls over it.
pub async fn dial(addr: &str) -> std::io::Result<(FrameWriter, FrameReader)> {
    let stream = TcpStream::connect(addr).await?;
    let (read_half, write_half) = stream.into_split();
    Ok((
        FramedWrite::new(write_half, codec()),
        FramedRead::new(read_half, codec()),
    ))
}
