//! RTU-over-TCP listener for the inbound responder
//!
//! Each connection carries raw RTU frames (address, PDU, CRC) with no MBAP
//! header. Requests on one connection are answered strictly in order, as on
//! a serial line.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use errors::{HubError, HubResult};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Decoder, Encoder, Framed};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::protocols::modbus::constants::MAX_ADU_SIZE;
use crate::protocols::modbus::frame::expected_request_length;
use crate::responder::Responder;

// ============================================================================
// Codec
// ============================================================================

/// Splits a byte stream into RTU request frames by function-code length
#[derive(Debug, Default, Clone, Copy)]
pub struct RtuRequestCodec;

impl Decoder for RtuRequestCodec {
    type Item = Vec<u8>;
    type Error = HubError;

    fn decode(&mut self, src: &mut BytesMut) -> HubResult<Option<Vec<u8>>> {
        let Some(len) = expected_request_length(src) else {
            return Ok(None);
        };
        if !(4..=MAX_ADU_SIZE).contains(&len) {
            warn!("Discarding {} unframeable byte(s)", src.len());
            src.clear();
            return Ok(None);
        }
        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }
        Ok(Some(src.split_to(len).to_vec()))
    }
}

impl Encoder<Vec<u8>> for RtuRequestCodec {
    type Error = HubError;

    fn encode(&mut self, frame: Vec<u8>, dst: &mut BytesMut) -> HubResult<()> {
        dst.extend_from_slice(&frame);
        Ok(())
    }
}

// ============================================================================
// Listener
// ============================================================================

pub async fn bind(addr: SocketAddr) -> HubResult<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    info!("Modbus responder listening on {}", listener.local_addr()?);
    Ok(listener)
}

/// Accept connections until `shutdown` is cancelled
pub async fn serve(
    listener: TcpListener,
    responder: Responder,
    shutdown: CancellationToken,
) -> HubResult<()> {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Modbus responder stopping");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Responder connection from {}", peer);
                    let responder = responder.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, responder, shutdown).await {
                            debug!("Responder connection {} closed: {}", peer, e);
                        }
                    });
                },
                Err(e) => {
                    let backoff = accept_backoff(&e);
                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(backoff) => {},
                    }
                },
            },
        }
    }
}

/// Log a failed accept and pick the pause before the next one.
///
/// Running out of descriptors clears up as connections close, so the
/// listener keeps going instead of taking the responder down.
fn accept_backoff(e: &io::Error) -> Duration {
    match e.kind() {
        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset => {
            debug!("Accept aborted by peer: {}", e);
            Duration::ZERO
        },
        _ => {
            error!("Accept error, retrying: {}", e);
            Duration::from_millis(100)
        },
    }
}

async fn handle_connection(
    stream: TcpStream,
    responder: Responder,
    shutdown: CancellationToken,
) -> HubResult<()> {
    let mut framed = Framed::new(stream, RtuRequestCodec);
    loop {
        let request = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            next = framed.next() => match next {
                Some(request) => request?,
                None => return Ok(()),
            },
        };
        if let Some(reply) = responder.handle_frame(&request).await {
            framed.send(reply).await?;
        }
    }
}
