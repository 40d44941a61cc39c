use crate::config::FeedConfig;
use crate::error::{FeedError, HubError, RecvError};
use crate::events::HostInfo;
use crate::feed::protocol::{parse_client_message, ClientMessage, FeedMessage};
use crate::hub::{CloseReason, Hub, Subscription};
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};

/// Close code sent to a subscriber disconnected for falling behind
pub const CLOSE_OVERWHELMED: u16 = 4008;

type FeedSink = futures::stream::SplitSink<WebSocketStream<TcpStream>, Message>;

/// Extract the session credential from a handshake request
///
/// An `Authorization: Bearer <token>` header wins over a `token` query
/// parameter.
pub fn request_token(request: &Request) -> Option<String> {
    let from_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string());
    if from_header.is_some() {
        return from_header;
    }

    request.uri().query().and_then(|query| {
        query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == "token")
            .map(|(_, token)| token.to_string())
    })
}

fn reject(status: StatusCode, message: String) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(message));
    *response.status_mut() = status;
    response
}

fn close_frame(reason: CloseReason) -> CloseFrame<'static> {
    let code = match reason {
        CloseReason::Overwhelmed => CloseCode::Library(CLOSE_OVERWHELMED),
        CloseReason::Shutdown => CloseCode::Away,
        CloseReason::Unsubscribed => CloseCode::Normal,
    };
    CloseFrame {
        code,
        reason: Cow::Owned(reason.to_string()),
    }
}

/// WebSocket server streaming health records to authorized viewers
pub struct FeedServer {
    hub: Arc<Hub>,
    host: HostInfo,
    client_timeout: Duration,
}

impl FeedServer {
    pub fn new(hub: Arc<Hub>, host: HostInfo, config: &FeedConfig) -> Self {
        Self {
            hub,
            host,
            client_timeout: config.client_timeout(),
        }
    }

    /// Accept connections until `shutdown` flips to `true`
    ///
    /// Connections already open keep streaming until the hub closes their
    /// subscription.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), FeedError> {
        info!("Live feed listening on {}", listener.local_addr()?);
        let server = Arc::new(self);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let server = Arc::clone(&server);
                            tokio::spawn(async move {
                                if let Err(e) = server.serve(stream, peer).await {
                                    warn!("Feed connection {} ended with error: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => error!("Failed to accept feed connection: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Live feed stopped accepting connections");
        Ok(())
    }

    async fn serve(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), FeedError> {
        let mut admitted: Option<Subscription> = None;
        let hub = &self.hub;
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let token = request_token(request).unwrap_or_default();
            match hub.subscribe(&token) {
                Ok(subscription) => {
                    admitted = Some(subscription);
                    Ok(response)
                }
                Err(HubError::ShuttingDown) => Err(reject(
                    StatusCode::SERVICE_UNAVAILABLE,
                    HubError::ShuttingDown.to_string(),
                )),
                Err(e) => Err(reject(StatusCode::UNAUTHORIZED, e.to_string())),
            }
        };

        let websocket = match tokio::time::timeout(
            self.client_timeout,
            accept_hdr_async(stream, callback),
        )
        .await
        {
            Ok(Ok(websocket)) => websocket,
            Ok(Err(e)) => {
                debug!("Feed handshake with {} refused: {}", peer, e);
                return Ok(());
            }
            Err(_) => {
                debug!("Feed handshake with {} timed out", peer);
                return Ok(());
            }
        };
        let Some(mut subscription) = admitted else {
            return Ok(());
        };
        info!(
            "Feed client {} connected as {} (subscriber {})",
            peer,
            subscription.user(),
            subscription.id()
        );

        let (mut sink, mut incoming) = websocket.split();
        let hello = FeedMessage::Hello {
            user: subscription.user().to_string(),
            host: self.host.clone(),
        };
        send(&mut sink, &hello).await?;

        // The hub queues the current record first
        let backlog = subscription.take_backlog();
        let current = match subscription.try_recv() {
            Ok(Some(record)) => record,
            Ok(None) => self.hub.current(),
            Err(RecvError::Closed(reason)) => {
                return close(&mut sink, reason).await;
            }
        };
        let snapshot = FeedMessage::Snapshot {
            current: (*current).clone(),
            backlog: backlog.iter().map(|record| (**record).clone()).collect(),
        };
        send(&mut sink, &snapshot).await?;

        let mut deadline = Instant::now() + self.client_timeout;
        loop {
            tokio::select! {
                update = subscription.recv() => {
                    match update {
                        Ok(record) => {
                            let message = FeedMessage::Update { record: (*record).clone() };
                            send(&mut sink, &message).await?;
                        }
                        Err(RecvError::Closed(reason)) => {
                            info!("Closing feed client {}: {}", peer, reason);
                            return close(&mut sink, reason).await;
                        }
                    }
                }
                message = incoming.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => match parse_client_message(&text) {
                            Some(ClientMessage::Keepalive) => {
                                deadline = Instant::now() + self.client_timeout;
                                send(&mut sink, &FeedMessage::Pong).await?;
                            }
                            None => {
                                warn!("Feed client {} sent an unsupported message", peer);
                                let frame = CloseFrame {
                                    code: CloseCode::Policy,
                                    reason: Cow::Borrowed("only keepalives are accepted"),
                                };
                                sink.send(Message::Close(Some(frame))).await?;
                                break;
                            }
                        },
                        Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                            // Answered by tungstenite; still counts as activity
                            deadline = Instant::now() + self.client_timeout;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!("Feed client {} disconnected", peer);
                            break;
                        }
                        Some(Ok(_)) => {
                            warn!("Feed client {} sent a binary frame", peer);
                            let frame = CloseFrame {
                                code: CloseCode::Unsupported,
                                reason: Cow::Borrowed("binary frames are not supported"),
                            };
                            sink.send(Message::Close(Some(frame))).await?;
                            break;
                        }
                        Some(Err(e)) => {
                            debug!("Feed client {} receive error: {}", peer, e);
                            break;
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    info!("Feed client {} timed out", peer);
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: Cow::Borrowed("keepalive timeout"),
                    };
                    sink.send(Message::Close(Some(frame))).await?;
                    break;
                }
            }
        }

        // Dropping the subscription leaves the hub
        subscription.unsubscribe();
        Ok(())
    }
}

async fn send(sink: &mut FeedSink, message: &FeedMessage) -> Result<(), FeedError> {
    let json = message.to_json().map_err(|e| {
        FeedError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    })?;
    sink.send(Message::Text(json)).await?;
    Ok(())
}

async fn close(sink: &mut FeedSink, reason: CloseReason) -> Result<(), FeedError> {
    let closing = FeedMessage::Closing {
        reason: reason.to_string(),
    };
    send(sink, &closing).await?;
    sink.send(Message::Close(Some(close_frame(reason)))).await?;
    Ok(())
}
