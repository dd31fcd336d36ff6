//! Byte-stream view of one open data channel.
//!
//! Writes are sliced so that channels sharing a connection split the
//! per-write budget, and each slice waits until the connection's buffered
//! amount drops below the high-water mark. Reads drain the channel's inbound
//! queue in order.

use std::sync::Arc;

use bytes::Bytes;
use futures::Stream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::SocketConfig;
use crate::engine::PeerRecord;
use crate::error::{Error, Result};
use crate::platform::{ChannelMessage, ChannelState, DataChannel};

enum ReadState {
    Streaming(tokio::sync::mpsc::UnboundedReceiver<ChannelMessage>),
    /// An error was returned; the next read reports end-of-stream.
    Errored,
    /// End-of-stream was returned; later reads fail.
    Finished,
}

pub struct Socket {
    peer: Arc<PeerRecord>,
    channel: Arc<dyn DataChannel>,
    config: SocketConfig,
    write_lock: Mutex<()>,
    reader: Mutex<ReadState>,
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("local", &self.local_address())
            .field("remote", &self.remote_address())
            .field("port", &self.port())
            .finish()
    }
}

impl Socket {
    /// Wrap `channel`, taking ownership of its inbound queue.
    pub fn new(
        peer: Arc<PeerRecord>,
        channel: Arc<dyn DataChannel>,
        config: SocketConfig,
    ) -> Result<Self> {
        let incoming = channel
            .take_incoming()
            .ok_or_else(|| Error::Channel("inbound queue already taken".into()))?;
        Ok(Self {
            peer,
            channel,
            config,
            write_lock: Mutex::new(()),
            reader: Mutex::new(ReadState::Streaming(incoming)),
        })
    }

    /// Our address, `localhost` on loopback.
    pub fn local_address(&self) -> &str {
        self.peer.display_local()
    }

    /// The remote's address, `localhost` on loopback.
    pub fn remote_address(&self) -> &str {
        self.peer.display_remote()
    }

    /// The channel label.
    pub fn port(&self) -> &str {
        self.channel.label()
    }

    pub fn peer(&self) -> &Arc<PeerRecord> {
        &self.peer
    }

    pub fn is_open(&self) -> bool {
        self.channel.ready_state() == ChannelState::Open
    }

    /// Send `data`, pacing against the connection's send buffer.
    ///
    /// Concurrent writes on one socket are serialized; each completes before
    /// the next starts.
    pub async fn write(&self, data: impl Into<Bytes>) -> Result<()> {
        let data = data.into();
        let _guard = self.write_lock.lock().await;
        if !self.is_open() {
            return Err(Error::SocketClosed);
        }

        let slice = (self.config.chunk_budget / self.peer.open_channel_count().max(1)).max(1);
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + slice).min(data.len());
            self.wait_writable().await?;
            self.channel
                .send(data.slice(offset..end))
                .map_err(|e| {
                    debug!(port = %self.port(), error = %e, "send failed");
                    Error::SocketClosed
                })?;
            offset = end;
        }
        Ok(())
    }

    async fn wait_writable(&self) -> Result<()> {
        loop {
            if !self.is_open() {
                return Err(Error::SocketClosed);
            }
            if self.peer.buffered_amount() < self.config.high_water_mark {
                return Ok(());
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Next inbound chunk, or `None` at end-of-stream.
    ///
    /// A channel error is returned once and then the stream ends. Reading
    /// after end-of-stream fails with [`Error::SocketClosed`].
    pub async fn read(&self) -> Result<Option<Bytes>> {
        let mut state = self.reader.lock().await;
        let message = match &mut *state {
            ReadState::Streaming(incoming) => incoming.recv().await,
            ReadState::Errored => {
                *state = ReadState::Finished;
                return Ok(None);
            }
            ReadState::Finished => return Err(Error::SocketClosed),
        };
        match message {
            Some(ChannelMessage::Data(data)) => Ok(Some(data)),
            Some(ChannelMessage::Error(reason)) => {
                warn!(port = %self.port(), remote = %self.remote_address(), error = %reason, "channel error");
                *state = ReadState::Errored;
                Err(Error::Channel(reason))
            }
            None => {
                *state = ReadState::Finished;
                Ok(None)
            }
        }
    }

    /// Close after the send buffer drains, giving up after the configured
    /// number of retries.
    pub async fn close(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut retries = 0;
        while self.is_open()
            && self.channel.buffered_amount() > 0
            && retries < self.config.close_max_retries
        {
            tokio::time::sleep(self.config.close_retry_interval).await;
            retries += 1;
        }
        if self.channel.buffered_amount() > 0 {
            debug!(port = %self.port(), retries = retries, "closing with data still buffered");
        }
        self.channel.close();
        Ok(())
    }

    /// Inbound chunks as a stream; a channel error is yielded as the final item.
    pub fn into_stream(self: Arc<Self>) -> impl Stream<Item = Result<Bytes>> {
        futures::stream::unfold(Some(self), |socket| async move {
            let socket = socket?;
            match socket.read().await {
                Ok(Some(data)) => Some((Ok(data), Some(socket))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}
