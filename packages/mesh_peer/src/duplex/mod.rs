//! Pull-based framed streams over a [`Socket`].
//!
//! Each side of a socket gets a reader and a writer. The reader grants the
//! remote writer exactly one frame per `NEXT`, so a writer can never run
//! ahead of what the reader asked for. One receive task per socket decodes
//! inbound frames and routes control frames to the local writer and payload
//! frames to the local reader. `END`, `ERROR`, a decode failure or the
//! socket ending stops the task and closes the socket.

mod codec;

pub use codec::{Frame, FrameCodec, FrameError};

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::Stream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

use crate::config::DuplexConfig;
use crate::error::{Error, Result};
use crate::socket::Socket;

impl From<FrameError> for Error {
    fn from(e: FrameError) -> Self {
        Error::MalformedFrame(e.to_string())
    }
}

/// What the receive task tells the local writer.
#[derive(Debug)]
enum WriterSignal {
    Next,
    Cancel,
    Closed(Option<Error>),
}

/// What the receive task tells the local reader.
#[derive(Debug)]
enum ReaderSignal {
    Data(Bytes),
    Error(String),
    End,
    Closed(Option<Error>),
}

/// Split `socket` into a framed reader and writer and start its receive task.
pub fn duplex(socket: Arc<Socket>, config: DuplexConfig) -> (DuplexReader, DuplexWriter) {
    let (writer_tx, writer_rx) = mpsc::unbounded_channel();
    let (reader_tx, reader_rx) = mpsc::unbounded_channel();
    tokio::spawn(receive_loop(
        socket.clone(),
        FrameCodec::new(config.max_frame_len),
        writer_tx,
        reader_tx,
    ));
    (
        DuplexReader {
            socket: socket.clone(),
            signals: reader_rx,
            codec: FrameCodec::new(config.max_frame_len),
            timeout: config.read_timeout,
            done: false,
        },
        DuplexWriter {
            socket,
            signals: writer_rx,
            codec: FrameCodec::new(config.max_frame_len),
            timeout: config.write_timeout,
            state: WriterState::Open,
        },
    )
}

async fn send_frame(socket: &Socket, codec: &mut FrameCodec, frame: Frame) -> Result<()> {
    let mut buf = BytesMut::new();
    codec.encode(frame, &mut buf)?;
    socket.write(buf.freeze()).await
}

async fn receive_loop(
    socket: Arc<Socket>,
    mut codec: FrameCodec,
    writer: mpsc::UnboundedSender<WriterSignal>,
    reader: mpsc::UnboundedSender<ReaderSignal>,
) {
    let mut buf = BytesMut::new();
    let mut writer = Some(writer);
    let outcome: Option<Error> = 'receive: loop {
        loop {
            match codec.decode(&mut buf) {
                Ok(Some(Frame::Next)) => {
                    if let Some(writer) = &writer {
                        let _ = writer.send(WriterSignal::Next);
                    }
                }
                Ok(Some(Frame::Cancel)) => {
                    // Only the writer stops; the local reader keeps draining.
                    if let Some(writer) = writer.take() {
                        let _ = writer.send(WriterSignal::Cancel);
                    }
                }
                Ok(Some(Frame::Data(data))) => {
                    let _ = reader.send(ReaderSignal::Data(data));
                }
                Ok(Some(Frame::Error(reason))) => {
                    let _ = reader.send(ReaderSignal::Error(reason));
                    break 'receive None;
                }
                Ok(Some(Frame::End)) => {
                    let _ = reader.send(ReaderSignal::End);
                    break 'receive None;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(remote = %socket.remote_address(), port = %socket.port(), error = %e, "malformed duplex frame");
                    break 'receive Some(e.into());
                }
            }
        }
        match socket.read().await {
            Ok(Some(chunk)) => buf.extend_from_slice(&chunk),
            Ok(None) => break None,
            Err(e) => break Some(e),
        }
    };

    if let Some(writer) = writer {
        let _ = writer.send(WriterSignal::Closed(outcome.clone()));
    }
    let _ = reader.send(ReaderSignal::Closed(outcome));
    if let Err(e) = socket.close().await {
        debug!(error = %e, "duplex socket close failed");
    }
    debug!(remote = %socket.remote_address(), port = %socket.port(), "duplex receive loop stopped");
}

/// Consumer half: pulls frames from the remote writer.
pub struct DuplexReader {
    socket: Arc<Socket>,
    signals: mpsc::UnboundedReceiver<ReaderSignal>,
    codec: FrameCodec,
    timeout: std::time::Duration,
    done: bool,
}

impl DuplexReader {
    /// Ask for the next frame and wait for it. `None` means the remote
    /// finished or the socket ended.
    pub async fn read(&mut self) -> Result<Option<Bytes>> {
        if self.done {
            return Ok(None);
        }
        if let Err(e) = send_frame(&self.socket, &mut self.codec, Frame::Next).await {
            // The receive task may already know why the socket went away.
            if let Ok(signal) = self.signals.try_recv() {
                return self.finish_read(Some(signal));
            }
            self.done = true;
            return Err(e);
        }

        let signal = match timeout(self.timeout, self.signals.recv()).await {
            Ok(signal) => signal,
            Err(_) => {
                self.done = true;
                warn!(remote = %self.socket.remote_address(), port = %self.socket.port(), "duplex read timed out");
                let _ = self.socket.close().await;
                return Err(Error::ConnectionTimedOut {
                    remote: self.socket.remote_address().to_string(),
                });
            }
        };
        self.finish_read(signal)
    }

    fn finish_read(&mut self, signal: Option<ReaderSignal>) -> Result<Option<Bytes>> {
        match signal {
            Some(ReaderSignal::Data(data)) => Ok(Some(data)),
            Some(ReaderSignal::End) | Some(ReaderSignal::Closed(None)) | None => {
                self.done = true;
                Ok(None)
            }
            Some(ReaderSignal::Error(reason)) => {
                self.done = true;
                Err(Error::Remote(reason))
            }
            Some(ReaderSignal::Closed(Some(e))) => {
                self.done = true;
                Err(e)
            }
        }
    }

    /// Tell the remote writer to stop. Frames already in flight are dropped.
    pub async fn cancel(&mut self) -> Result<()> {
        if self.done {
            return Ok(());
        }
        self.done = true;
        send_frame(&self.socket, &mut self.codec, Frame::Cancel).await
    }

    pub fn socket(&self) -> &Arc<Socket> {
        &self.socket
    }

    /// Frames as a stream; an error is yielded as the final item.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes>> {
        futures::stream::unfold(Some(self), |reader| async move {
            let mut reader = reader?;
            match reader.read().await {
                Ok(Some(data)) => Some((Ok(data), Some(reader))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Open,
    Cancelled,
    Finished,
}

/// Producer half: each write waits for the remote reader's `NEXT`.
pub struct DuplexWriter {
    socket: Arc<Socket>,
    signals: mpsc::UnboundedReceiver<WriterSignal>,
    codec: FrameCodec,
    timeout: std::time::Duration,
    state: WriterState,
}

impl DuplexWriter {
    /// Send one frame of data once the remote reader asks for it.
    ///
    /// An oversized payload fails before any `NEXT` is consumed, leaving the
    /// stream usable.
    pub async fn write(&mut self, data: impl Into<Bytes>) -> Result<()> {
        let data = data.into();
        self.codec.check_len(data.len())?;
        self.await_next().await?;
        send_frame(&self.socket, &mut self.codec, Frame::Data(data)).await
    }

    /// Finish the stream with `END`.
    pub async fn close(&mut self) -> Result<()> {
        self.await_next().await?;
        self.state = WriterState::Finished;
        send_frame(&self.socket, &mut self.codec, Frame::End).await
    }

    /// Fail the stream with `ERROR(reason)`.
    pub async fn abort(&mut self, reason: &str) -> Result<()> {
        self.codec.check_len(reason.len())?;
        self.await_next().await?;
        self.state = WriterState::Finished;
        send_frame(&self.socket, &mut self.codec, Frame::Error(reason.to_string())).await
    }

    pub fn is_cancelled(&self) -> bool {
        self.state == WriterState::Cancelled
    }

    pub fn socket(&self) -> &Arc<Socket> {
        &self.socket
    }

    async fn await_next(&mut self) -> Result<()> {
        match self.state {
            WriterState::Open => {}
            WriterState::Cancelled => return Err(Error::Cancelled),
            WriterState::Finished => return Err(Error::SocketClosed),
        }

        let signal = match timeout(self.timeout, self.signals.recv()).await {
            Ok(signal) => signal,
            Err(_) => {
                self.state = WriterState::Finished;
                warn!(remote = %self.socket.remote_address(), port = %self.socket.port(), "duplex write timed out");
                let _ = self.socket.close().await;
                return Err(Error::ConnectionTimedOut {
                    remote: self.socket.remote_address().to_string(),
                });
            }
        };
        match signal {
            Some(WriterSignal::Next) => Ok(()),
            Some(WriterSignal::Cancel) => {
                self.state = WriterState::Cancelled;
                debug!(remote = %self.socket.remote_address(), "duplex writer cancelled");
                Err(Error::Cancelled)
            }
            Some(WriterSignal::Closed(e)) => {
                self.state = WriterState::Finished;
                Err(e.unwrap_or(Error::SocketClosed))
            }
            None => {
                self.state = WriterState::Finished;
                Err(Error::SocketClosed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SocketConfig;
    use crate::engine::{ConnectOptions, Engine};
    use crate::platform::memory::MemoryNetwork;
    use crate::testing::{start_hub, start_node};
    use futures::StreamExt;
    use mesh_protocol::LOCALHOST;
    use std::time::Duration;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    async fn socket_pair() -> (Engine, Arc<Socket>, Arc<Socket>) {
        let hub = start_hub().await;
        let engine = start_node(&hub, &MemoryNetwork::new()).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine
            .listen("stream", move |peer, channel| {
                let socket = Socket::new(peer, channel, SocketConfig::default()).unwrap();
                let _ = tx.send(Arc::new(socket));
            })
            .unwrap();
        let (peer, channel) = engine
            .connect(LOCALHOST, "stream", ConnectOptions::default())
            .await
            .unwrap();
        let client = Arc::new(Socket::new(peer, channel, SocketConfig::default()).unwrap());
        let server = timeout(TEST_TIMEOUT, rx.recv()).await.unwrap().unwrap();
        (engine, client, server)
    }

    fn short_timeouts() -> DuplexConfig {
        DuplexConfig {
            read_timeout: Duration::from_millis(150),
            write_timeout: Duration::from_millis(150),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn writes_flow_one_frame_per_read() {
        let (_engine, client, server) = socket_pair().await;
        let (_client_reader, mut writer) = duplex(client, DuplexConfig::default());
        let (mut reader, _server_writer) = duplex(server, DuplexConfig::default());

        let producer = tokio::spawn(async move {
            for chunk in ["alpha", "beta", "gamma"] {
                writer.write(chunk.as_bytes().to_vec()).await.unwrap();
            }
            writer.close().await.unwrap();
        });

        let frames: Vec<Bytes> = reader
            .into_stream()
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(
            frames,
            vec![
                Bytes::from_static(b"alpha"),
                Bytes::from_static(b"beta"),
                Bytes::from_static(b"gamma")
            ]
        );
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn writer_waits_for_next() {
        let (_engine, client, server) = socket_pair().await;
        let (_client_reader, mut writer) = duplex(client, DuplexConfig::default());
        let (mut reader, _server_writer) = duplex(server, DuplexConfig::default());

        let pending = tokio::spawn(async move {
            writer.write(&b"payload"[..]).await.unwrap();
            writer
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        assert_eq!(
            reader.read().await.unwrap(),
            Some(Bytes::from_static(b"payload"))
        );
        timeout(TEST_TIMEOUT, pending).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cancel_rejects_pending_write() {
        let (_engine, client, server) = socket_pair().await;
        let (_client_reader, mut writer) = duplex(client, DuplexConfig::default());
        let (mut reader, _server_writer) = duplex(server, DuplexConfig::default());

        let pending = tokio::spawn(async move { writer.write(&b"unwanted"[..]).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        reader.cancel().await.unwrap();

        let err = timeout(TEST_TIMEOUT, pending)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert_eq!(err.error_code(), "cancelled");
        assert_eq!(reader.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn abort_reaches_reader_as_error() {
        let (_engine, client, server) = socket_pair().await;
        let (_client_reader, mut writer) = duplex(client, DuplexConfig::default());
        let (mut reader, _server_writer) = duplex(server, DuplexConfig::default());

        let producer = tokio::spawn(async move { writer.abort("out of disk").await });
        let err = reader.read().await.unwrap_err();
        assert!(matches!(&err, Error::Remote(reason) if reason == "out of disk"));
        producer.await.unwrap().unwrap();
        assert_eq!(reader.read().await.unwrap(), None);
    }

    #[tokio::test]
    async fn unanswered_write_times_out_and_closes_socket() {
        let (_engine, client, _server) = socket_pair().await;
        let (_client_reader, mut writer) = duplex(client.clone(), short_timeouts());

        let err = writer.write(&b"nobody asked"[..]).await.unwrap_err();
        assert_eq!(err.error_code(), "connection_timed_out");
        assert!(!client.is_open());
        assert_eq!(
            writer.write(&b"again"[..]).await.unwrap_err().error_code(),
            "socket_closed"
        );
    }

    #[tokio::test]
    async fn silent_writer_times_out_read() {
        let (_engine, client, server) = socket_pair().await;
        let (_client_reader, _writer) = duplex(client, DuplexConfig::default());
        let (mut reader, _server_writer) = duplex(server.clone(), short_timeouts());

        let err = reader.read().await.unwrap_err();
        assert_eq!(err.error_code(), "connection_timed_out");
        assert!(!server.is_open());
    }

    #[tokio::test]
    async fn socket_close_ends_read_early() {
        let (_engine, client, server) = socket_pair().await;
        let (mut reader, _server_writer) = duplex(server, DuplexConfig::default());

        let read = tokio::spawn(async move { reader.read().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.close().await.unwrap();
        assert_eq!(timeout(TEST_TIMEOUT, read).await.unwrap().unwrap().unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_write_leaves_stream_usable() {
        let (_engine, client, server) = socket_pair().await;
        let small_frames = DuplexConfig {
            max_frame_len: 16,
            ..Default::default()
        };
        let (_client_reader, mut writer) = duplex(client, small_frames.clone());
        let (mut reader, _server_writer) = duplex(server, small_frames);

        let err = writer.write(vec![7u8; 32]).await.unwrap_err();
        assert_eq!(err.error_code(), "malformed_frame");

        let producer = tokio::spawn(async move {
            writer.write(&b"small"[..]).await.unwrap();
            writer
        });
        assert_eq!(
            reader.read().await.unwrap(),
            Some(Bytes::from_static(b"small"))
        );
        let writer = timeout(TEST_TIMEOUT, producer).await.unwrap().unwrap();
        assert!(writer.socket().is_open());
    }

    #[tokio::test]
    async fn garbage_on_the_socket_fails_both_halves() {
        let (_engine, client, server) = socket_pair().await;
        let (mut reader, mut writer) = duplex(server, DuplexConfig::default());

        client.write(&[42u8, 0, 0, 0, 0][..]).await.unwrap();
        let err = reader.read().await.unwrap_err();
        assert_eq!(err.error_code(), "malformed_frame");
        let err = writer.write(&b"x"[..]).await.unwrap_err();
        assert_eq!(err.error_code(), "malformed_frame");
    }
}
