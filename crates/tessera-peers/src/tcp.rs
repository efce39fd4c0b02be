//! TCP transport: length-prefixed JSON frames over tokio streams.
//!
//! Each socket is driven by one task. Outbound sockets first run the
//! connect + handshake exchange, queueing frames sent in the meantime;
//! inbound sockets are handed over after [`TcpTransport::accept`] has
//! validated the dialer's headers.

use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use tessera_core::headers::HandshakeError;
use tessera_core::wire::{
    self, Frame, WireError, CLOSE_ABNORMAL, CLOSE_HANDSHAKE_FAILED, CLOSE_NORMAL,
    CLOSE_SOCKET_ERROR, LEN_PREFIX,
};
use tessera_core::SystemHeaders;

use crate::rpc::{self, Endpoints};
use crate::socket::{Direction, Link, OpenState, Socket, SocketEvent};
use crate::transport::{ConnectOptions, Transport, TransportError};

enum LinkCommand {
    Send(Frame),
    Disconnect { code: u16, reason: String },
    Destroy { code: u16, reason: String },
}

/// [`Link`] backed by the socket's driver task.
struct TcpLink {
    commands: mpsc::UnboundedSender<LinkCommand>,
}

impl Link for TcpLink {
    fn send(&self, frame: Frame) -> Result<(), TransportError> {
        self.commands
            .send(LinkCommand::Send(frame))
            .map_err(|_| TransportError::Closed)
    }

    fn disconnect(&self, code: u16, reason: &str) {
        let _ = self.commands.send(LinkCommand::Disconnect {
            code,
            reason: reason.to_string(),
        });
    }

    fn destroy(&self, code: u16, reason: &str) -> bool {
        let _ = self.commands.send(LinkCommand::Destroy {
            code,
            reason: reason.to_string(),
        });
        true
    }
}

pub struct TcpTransport {
    headers: SystemHeaders,
    endpoints: Arc<Endpoints>,
    handshake_timeout: Duration,
}

impl TcpTransport {
    pub fn new(headers: SystemHeaders, endpoints: Arc<Endpoints>, handshake_timeout: Duration) -> Self {
        Self {
            headers,
            endpoints,
            handshake_timeout,
        }
    }

    /// Run the acceptor side of the handshake on a freshly accepted stream.
    ///
    /// On success returns the dialer's headers and an open inbound socket.
    /// Invalid headers are answered with a close frame carrying the
    /// handshake-failure code.
    pub async fn accept(
        &self,
        mut stream: TcpStream,
    ) -> Result<(SystemHeaders, Socket), TransportError> {
        let _ = stream.set_nodelay(true);
        let first = tokio::time::timeout(self.handshake_timeout, read_frame(&mut stream))
            .await
            .map_err(|_| TransportError::HandshakeTimeout)??;
        let remote = match first {
            Frame::Handshake { headers } => headers,
            other => {
                return Err(TransportError::Protocol(format!(
                    "expected handshake, got {}",
                    other.kind()
                )))
            }
        };

        if let Err(e) = self.headers.validate_remote(&remote) {
            tracing::debug!(nonce = %remote.nonce, error = %e, "rejecting inbound handshake");
            let close = Frame::Close {
                code: CLOSE_HANDSHAKE_FAILED,
                reason: e.to_string(),
            };
            let _ = write_frame(&mut stream, &close).await;
            return Err(e.into());
        }

        let ack = Frame::HandshakeAck {
            headers: self.headers.clone(),
        };
        write_frame(&mut stream, &ack).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let socket = Socket::new(
            Direction::Inbound,
            OpenState::Open,
            Arc::new(TcpLink { commands: tx }),
        );
        tracing::debug!(nonce = %remote.nonce, socket_id = %socket.id(), "inbound handshake complete");
        tokio::spawn(run_io(stream, socket.clone(), rx, self.endpoints.clone()));
        Ok((remote, socket))
    }
}

impl Transport for TcpTransport {
    fn connect(&self, options: ConnectOptions) -> Socket {
        let (tx, rx) = mpsc::unbounded_channel();
        let socket = Socket::new(
            Direction::Outbound,
            OpenState::Connecting,
            Arc::new(TcpLink { commands: tx }),
        );
        tokio::spawn(drive_outbound(
            options,
            socket.clone(),
            rx,
            self.endpoints.clone(),
        ));
        socket
    }
}

async fn drive_outbound(
    options: ConnectOptions,
    socket: Socket,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
    endpoints: Arc<Endpoints>,
) {
    let mut queued = Vec::new();
    let handshake = dial(&options);
    tokio::pin!(handshake);

    let mut stream = loop {
        tokio::select! {
            result = &mut handshake => match result {
                Ok(stream) => break stream,
                Err(e) => {
                    report_failure(&socket, &e);
                    return;
                }
            },
            command = commands.recv() => match command {
                Some(LinkCommand::Send(frame)) => queued.push(frame),
                Some(LinkCommand::Disconnect { code, reason })
                | Some(LinkCommand::Destroy { code, reason }) => {
                    socket.notify(SocketEvent::Closed { code, reason });
                    return;
                }
                None => return,
            },
        }
    };

    socket.notify(SocketEvent::Connected);
    for frame in queued {
        if let Err(e) = write_frame(&mut stream, &frame).await {
            socket.notify(SocketEvent::Errored(e.to_string()));
            socket.notify(SocketEvent::Closed {
                code: CLOSE_SOCKET_ERROR,
                reason: e.to_string(),
            });
            return;
        }
    }
    run_io(stream, socket, commands, endpoints).await;
}

/// Connect, send our headers, and wait for the matching ack.
async fn dial(options: &ConnectOptions) -> Result<TcpStream, TransportError> {
    let addr = (options.hostname.as_str(), options.port);
    let mut stream = tokio::time::timeout(options.connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::ConnectTimeout)??;
    let _ = stream.set_nodelay(true);

    let hello = Frame::Handshake {
        headers: options.query.clone(),
    };
    write_frame(&mut stream, &hello).await?;

    let reply = tokio::time::timeout(options.ack_timeout, read_frame(&mut stream))
        .await
        .map_err(|_| TransportError::HandshakeTimeout)??;
    match reply {
        Frame::HandshakeAck { headers } => {
            if headers.nonce != options.expected_nonce {
                return Err(HandshakeError::UnexpectedNonce {
                    expected: options.expected_nonce.clone(),
                    actual: headers.nonce,
                }
                .into());
            }
            options.query.validate_remote(&headers)?;
            Ok(stream)
        }
        Frame::Close { code, reason } => Err(TransportError::Rejected { code, reason }),
        other => Err(TransportError::Protocol(format!(
            "expected handshake ack, got {}",
            other.kind()
        ))),
    }
}

fn report_failure(socket: &Socket, error: &TransportError) {
    let code = error.close_code();
    let reason = error.to_string();
    if error.is_handshake_failure() {
        socket.notify(SocketEvent::Disconnected {
            code,
            reason: reason.clone(),
        });
    } else {
        socket.notify(SocketEvent::Errored(reason.clone()));
    }
    socket.notify(SocketEvent::Closed { code, reason });
}

/// Pump frames in both directions until either side closes.
async fn run_io(
    stream: TcpStream,
    socket: Socket,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
    endpoints: Arc<Endpoints>,
) {
    let (mut reader, mut writer) = stream.into_split();

    // `read_exact` is not cancel-safe, so reads live in their own task.
    let (inbound_tx, mut inbound) = mpsc::unbounded_channel();
    let reader_task = tokio::spawn(async move {
        loop {
            let result = read_frame(&mut reader).await;
            let stop = result.is_err();
            if inbound_tx.send(result).is_err() || stop {
                break;
            }
        }
    });

    let (code, reason) = loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(LinkCommand::Send(frame)) => {
                    if let Err(e) = write_frame(&mut writer, &frame).await {
                        socket.notify(SocketEvent::Errored(e.to_string()));
                        break (CLOSE_SOCKET_ERROR, e.to_string());
                    }
                }
                Some(LinkCommand::Disconnect { code, reason }) => {
                    let close = Frame::Close { code, reason: reason.clone() };
                    let _ = write_frame(&mut writer, &close).await;
                    let _ = writer.shutdown().await;
                    break (code, reason);
                }
                Some(LinkCommand::Destroy { code, reason }) => break (code, reason),
                None => break (CLOSE_NORMAL, String::new()),
            },
            incoming = inbound.recv() => match incoming {
                Some(Ok(Frame::Close { code, reason })) => {
                    socket.notify(SocketEvent::Disconnected { code, reason: reason.clone() });
                    break (code, reason);
                }
                Some(Ok(frame)) => {
                    socket.notify(SocketEvent::Message { kind: frame.kind() });
                    rpc::serve_frame(&socket, &endpoints, frame);
                }
                Some(Err(WireError::Io(e))) if e.kind() == ErrorKind::UnexpectedEof => {
                    break (CLOSE_ABNORMAL, "connection closed by peer".to_string());
                }
                Some(Err(e)) => {
                    socket.notify(SocketEvent::Errored(e.to_string()));
                    break (CLOSE_SOCKET_ERROR, e.to_string());
                }
                None => break (CLOSE_ABNORMAL, "reader stopped".to_string()),
            },
        }
    };

    reader_task.abort();
    socket.notify(SocketEvent::Closed { code, reason });
}

pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, WireError> {
    let mut prefix = [0u8; LEN_PREFIX];
    reader.read_exact(&mut prefix).await?;
    let len = wire::body_len(prefix)?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    wire::decode(&body)
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<(), WireError> {
    let bytes = wire::encode(frame)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}
