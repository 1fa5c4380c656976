//! Adapters from concrete connections to the text-frame stream/sink pair the
//! registry drives, and the raw TCP line listener.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use octamaze::{ErrorMessage, IdValidator, JoinError, JoinRequest, OctapodRegistry, Rejected};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{info, warn};

const MAX_LINE: usize = 4 * 1024;

pub fn error_frame(err: &JoinError) -> String {
    let message = ErrorMessage {
        error: err.to_string(),
    };
    serde_json::to_string(&message).unwrap_or_else(|_| String::from(r#"{"error":"join failed"}"#))
}

/// Run the id through the validator chain. Does not touch the registry.
pub fn check_id(validator: &dyn IdValidator, id: Option<&str>) -> Result<String, JoinError> {
    let id = id.map(str::trim).filter(|id| !id.is_empty()).ok_or(JoinError::MissingId)?;
    validator.validate(id).map_err(JoinError::InvalidId)?;
    Ok(id.to_string())
}

/// Tell the peer why it was turned away, then close.
async fn refuse<K>(mut sink: K, err: &JoinError)
where
    K: Sink<String> + Unpin,
{
    let _ = sink.send(error_frame(err)).await;
    let _ = sink.close().await;
}

/// Text payloads only; a close frame ends the stream, binary and control
/// frames are skipped.
fn ws_frames<S>(receiver: S) -> impl Stream<Item = Result<String, axum::Error>> + Send + Unpin
where
    S: Stream<Item = Result<Message, axum::Error>> + Send + Unpin + 'static,
{
    Box::pin(
        receiver
            .take_while(|m| future::ready(!matches!(m, Ok(Message::Close(_)))))
            .filter_map(|m| {
                future::ready(match m {
                    Ok(Message::Text(text)) => Some(Ok(text.to_string())),
                    Ok(_) => None,
                    Err(e) => Some(Err(e)),
                })
            }),
    )
}

/// Hand an upgraded socket to the registry. A lost registration race gets the
/// error frame and a close.
pub async fn attach_websocket(socket: WebSocket, registry: Arc<OctapodRegistry>, id: String) {
    let (sender, receiver) = socket.split();
    let sink = Box::pin(sender.with(|text: String| {
        future::ready(Ok::<Message, axum::Error>(Message::Text(text.into())))
    }));
    match registry.join(&id, ws_frames(receiver), sink) {
        Ok(_) => info!(id = %id, "websocket agent joined"),
        Err(Rejected { error, sink }) => {
            warn!(id = %id, "websocket join lost race: {}", error);
            refuse(sink, &error).await;
        }
    }
}

/// Accept raw TCP agents until the listener fails.
pub async fn serve_lines(
    listener: TcpListener,
    registry: Arc<OctapodRegistry>,
    validator: Arc<dyn IdValidator>,
) -> std::io::Result<()> {
    loop {
        let (stream, addr) = listener.accept().await?;
        info!("line client connected: {}", addr);
        let registry = registry.clone();
        let validator = validator.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_line_client(stream, registry, validator).await {
                warn!("line client {} rejected: {}", addr, e);
            }
        });
    }
}

async fn handle_line_client(
    stream: TcpStream,
    registry: Arc<OctapodRegistry>,
    validator: Arc<dyn IdValidator>,
) -> Result<(), JoinError> {
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE));

    let first = match framed.next().await {
        Some(Ok(line)) => line,
        // Gone before saying hello.
        _ => return Ok(()),
    };
    let requested = serde_json::from_str::<JoinRequest>(&first).ok().map(|r| r.id);
    let id = match check_id(validator.as_ref(), requested.as_deref()) {
        Ok(id) => id,
        Err(e) => {
            refuse(&mut framed, &e).await;
            return Err(e);
        }
    };

    let (sink, frames) = framed.split();
    match registry.join(&id, frames, sink) {
        Ok(_) => {
            info!(id = %id, "line agent joined");
            Ok(())
        }
        Err(Rejected { error, sink }) => {
            refuse(sink, &error).await;
            Err(error)
        }
    }
}
