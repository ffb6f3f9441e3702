//! Sender pump: META, fixed-size binary chunks, DONE.
//!
//! After every write the pump checks the channel's buffered amount and, above
//! the low-water mark, suspends until the channel reports it has drained.
//! Failed writes are retried with exponential backoff; a closed channel fails
//! the transfer immediately.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

use crate::error::{ChannelError, TransferError};
use crate::frame::{DoneMarker, FileMeta, Frame, WireFrame};
use crate::negotiation::DataChannel;
use crate::telemetry::WireStats;

pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;
pub const DEFAULT_LOW_WATER_MARK: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub chunk_size: usize,
    pub low_water_mark: usize,
    pub max_retries: u32,
    pub retry_base: Duration,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            low_water_mark: DEFAULT_LOW_WATER_MARK,
            max_retries: 3,
            retry_base: Duration::from_millis(100),
        }
    }
}

impl SenderConfig {
    fn retry_delay(&self, attempt: u32) -> Duration {
        self.retry_base
            .checked_mul(1u32 << attempt.min(16))
            .unwrap_or(Duration::from_secs(60))
    }
}

/// Pull-based reader yielding `chunk_size` pieces of a byte stream. Only the
/// last chunk may be shorter.
pub struct ChunkReader<R> {
    inner: R,
    chunk_size: usize,
    done: bool,
}

impl<R: AsyncRead + Unpin> ChunkReader<R> {
    pub fn new(inner: R, chunk_size: usize) -> Self {
        Self {
            inner,
            chunk_size: chunk_size.max(1),
            done: false,
        }
    }

    pub async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        if self.done {
            return Ok(None);
        }
        let mut buf = BytesMut::zeroed(self.chunk_size);
        let mut filled = 0;
        while filled < self.chunk_size {
            let n = self.inner.read(&mut buf[filled..]).await?;
            if n == 0 {
                self.done = true;
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Ok(None);
        }
        buf.truncate(filled);
        Ok(Some(buf.freeze()))
    }
}

/// Writes frames to one data channel with retry and backpressure.
pub struct FramePump<C: DataChannel + ?Sized> {
    channel: Arc<C>,
    config: SenderConfig,
    stats: Arc<WireStats>,
}

impl<C: DataChannel + ?Sized> Clone for FramePump<C> {
    fn clone(&self) -> Self {
        Self {
            channel: Arc::clone(&self.channel),
            config: self.config.clone(),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<C: DataChannel + ?Sized> FramePump<C> {
    pub fn new(channel: Arc<C>, config: SenderConfig, stats: Arc<WireStats>) -> Self {
        Self {
            channel,
            config,
            stats,
        }
    }

    pub async fn send_frame(&self, frame: &Frame) -> Result<(), TransferError> {
        let wire = frame.encode()?;
        let len = wire.len();
        let mut attempt = 0u32;
        loop {
            let result = match &wire {
                WireFrame::Text(text) => self.channel.send_text(text).await,
                WireFrame::Binary(data) => self.channel.send_binary(data.clone()).await,
            };
            match result {
                Ok(()) => {
                    self.stats.on_send(len);
                    return Ok(());
                }
                Err(ChannelError::Closed) => return Err(TransferError::ChannelClosed),
                Err(err) if attempt >= self.config.max_retries => {
                    self.stats.set_last_error(&err);
                    return Err(TransferError::RetriesExhausted {
                        attempts: attempt + 1,
                        source: err,
                    });
                }
                Err(err) => {
                    let delay = self.config.retry_delay(attempt);
                    warn!(error = %err, attempt, delay_ms = delay.as_millis() as u64, "frame send failed, retrying");
                    self.stats.on_retry();
                    tokio::time::sleep(delay).await;
                    if !self.channel.is_open() {
                        return Err(TransferError::ChannelClosed);
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Suspend while the channel holds more than the low-water mark.
    pub async fn wait_for_drain(&self) -> Result<(), TransferError> {
        let buffered = self.channel.buffered_amount().await;
        if buffered <= self.config.low_water_mark {
            return Ok(());
        }
        debug!(buffered, low_water = self.config.low_water_mark, "waiting for channel to drain");
        self.channel.drained(self.config.low_water_mark).await;
        if self.channel.is_open() {
            Ok(())
        } else {
            Err(TransferError::ChannelClosed)
        }
    }

    /// Stream one file. `progress` receives the running byte count after every
    /// chunk. Returns the number of payload bytes sent.
    pub async fn send_file<R, F>(
        &self,
        meta: &FileMeta,
        source: R,
        mut progress: F,
    ) -> Result<u64, TransferError>
    where
        R: AsyncRead + Unpin,
        F: FnMut(u64),
    {
        self.send_frame(&Frame::Meta(meta.clone())).await?;
        let mut reader = ChunkReader::new(source, self.config.chunk_size);
        let mut sent = 0u64;
        while let Some(chunk) = reader.next_chunk().await? {
            let n = chunk.len() as u64;
            if sent + n > meta.size {
                warn!(transfer = %meta.id, declared = meta.size, "source grew while sending");
                return Err(TransferError::SizeMismatch {
                    declared: meta.size,
                    sent: sent + n,
                });
            }
            self.send_frame(&Frame::Chunk(chunk)).await?;
            sent += n;
            progress(sent);
            self.wait_for_drain().await?;
        }
        drop(reader);
        if sent != meta.size {
            warn!(transfer = %meta.id, sent, declared = meta.size, "source shrank while sending");
            return Err(TransferError::SizeMismatch {
                declared: meta.size,
                sent,
            });
        }
        self.send_frame(&Frame::Done(DoneMarker {
            id: meta.id.clone(),
        }))
        .await?;
        Ok(sent)
    }
}
