//! Transfer engine: pushes a validated image to the board
//!
//! Every transfer runs the same request sequence on the channel:
//!
//! 1. `Sync`, which also clears any half-finished earlier attempt
//! 2. `Erase` with the image length
//! 3. `Write` for each block in order
//! 4. `Verify`, answered with the SHA-256 of what the board wrote
//!
//! Each request waits for its response before the next is sent, so a
//! cancellation request only takes effect between requests. A cancelled
//! transfer sends `Abort` and leaves the board waiting for a fresh `Sync`.

use std::fmt;
use std::time::Duration;

use galileo_transfer_protocol::{Frame, FrameDecoder, ProtocolError, Request, RequestKind, Response};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::capsule::ValidatedCapsule;
use crate::config::TransferConfig;
use crate::error::{ChannelFault, TransferError, TransferStage, VerifyFault};

const READ_BUF_LEN: usize = 512;

/// Status reported while a transfer runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Board is erasing the image region
    Erasing,
    /// Writing a block
    WritingBlock {
        /// One-based block number
        block: u32,
        /// Total blocks in the image
        total: u32,
    },
    /// Board is hashing the written image
    Verifying,
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferStatus::Erasing => write!(f, "Erasing"),
            TransferStatus::WritingBlock { block, total } => {
                write!(f, "Writing block {block} of {total}")
            }
            TransferStatus::Verifying => write!(f, "Verifying"),
        }
    }
}

/// Receives status and progress from the transfer engine
pub trait TransferListener {
    /// A new stage started.
    fn on_status(&mut self, status: TransferStatus);

    /// Completion advanced to `percent`.
    fn on_progress(&mut self, percent: u8);
}

/// Read side of a cancellation request
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

/// Create a linked cancellation trigger and signal.
pub fn cancel_channel() -> (CancelTrigger, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelTrigger { tx }, CancelSignal { rx })
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        cancel_channel().1
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Write side of a cancellation request
#[derive(Debug)]
pub struct CancelTrigger {
    tx: watch::Sender<bool>,
}

impl CancelTrigger {
    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Request/response link over a byte channel
struct Link<'a, C> {
    channel: &'a mut C,
    decoder: FrameDecoder,
    seq: u16,
}

impl<'a, C> Link<'a, C>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    fn new(channel: &'a mut C) -> Self {
        Self {
            channel,
            decoder: FrameDecoder::new(),
            seq: 0,
        }
    }

    async fn request(
        &mut self,
        request: Request<'_>,
        timeout: Duration,
    ) -> Result<Response, ChannelFault> {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        let bytes = request.encode(seq).map_err(ChannelFault::Protocol)?;
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);

        self.decoder.clear();
        trace!(kind = request.kind().name(), seq, "sending request");

        let exchange = async {
            self.channel.write_all(&bytes).await.map_err(ChannelFault::Io)?;
            self.channel.flush().await.map_err(ChannelFault::Io)?;
            self.read_frame().await
        };
        let frame = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| ChannelFault::Timeout { timeout_ms })??;

        if frame.seq != seq {
            return Err(ChannelFault::Protocol(ProtocolError::SequenceMismatch {
                sent: seq,
                received: frame.seq,
            }));
        }
        Response::decode(&frame).map_err(ChannelFault::Protocol)
    }

    async fn read_frame(&mut self) -> Result<Frame, ChannelFault> {
        let mut buf = [0u8; READ_BUF_LEN];
        loop {
            match self.decoder.next_frame() {
                Ok(Some(frame)) => return Ok(frame),
                Ok(None) => {}
                Err(e) => {
                    debug!(error = %e, "discarding corrupt response bytes");
                    continue;
                }
            }
            let n = self.channel.read(&mut buf).await.map_err(ChannelFault::Io)?;
            if n == 0 {
                return Err(ChannelFault::Closed);
            }
            self.decoder.push(buf.get(..n).unwrap_or_default());
        }
    }

    async fn expect_ack(&mut self, request: Request<'_>, timeout: Duration) -> Result<(), ChannelFault> {
        let kind = request.kind();
        match self.request(request, timeout).await? {
            Response::Ack => Ok(()),
            Response::Nack(code) => Err(ChannelFault::Nack(code)),
            other => Err(unexpected(kind, &other)),
        }
    }
}

fn unexpected(kind: RequestKind, response: &Response) -> ChannelFault {
    ChannelFault::Protocol(ProtocolError::UnexpectedResponse {
        request: kind.name(),
        response: response.name(),
    })
}

fn percent_of(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = done.saturating_mul(100) / total;
    u8::try_from(pct.min(100)).unwrap_or(100)
}

/// Drives the request sequence for one image
#[derive(Debug, Clone)]
pub struct TransferEngine {
    config: TransferConfig,
}

impl TransferEngine {
    /// Engine using `config`.
    pub fn new(config: TransferConfig) -> Self {
        Self { config }
    }

    /// Configuration in use.
    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    fn announces_block(&self, block: u32, total: u32) -> bool {
        let interval = self.config.status_interval_blocks;
        block == 0 || block + 1 == total || (interval > 0 && block % interval == 0)
    }

    /// Transfer `capsule` over `channel`.
    ///
    /// Progress rises from 0 after the erase and stays below 100 until the
    /// board's digest matches; 100 is reported only on success.
    pub async fn transfer<C, L>(
        &self,
        capsule: &ValidatedCapsule,
        channel: &mut C,
        listener: &mut L,
        cancel: &CancelSignal,
    ) -> Result<(), TransferError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
        L: TransferListener + ?Sized,
    {
        let mut link = Link::new(channel);
        let payload = capsule.payload();
        let image_len = capsule.image_len();
        let chunk_size = self.config.chunk_size.max(1);
        let total_blocks = u32::try_from(payload.len().div_ceil(chunk_size)).unwrap_or(u32::MAX);

        info!(
            version = %capsule.version(),
            len = payload.len(),
            blocks = total_blocks,
            "starting firmware transfer"
        );

        self.checkpoint(&mut link, cancel).await?;
        link.expect_ack(Request::Sync, self.config.ack_timeout)
            .await
            .map_err(|source| TransferError::WriteFailed {
                stage: TransferStage::Sync,
                source,
            })?;

        listener.on_status(TransferStatus::Erasing);
        link.expect_ack(Request::Erase { image_len }, self.config.erase_timeout)
            .await
            .map_err(|source| TransferError::WriteFailed {
                stage: TransferStage::Erase,
                source,
            })?;
        listener.on_progress(0);

        let mut sent = 0usize;
        let mut last_percent = 0u8;
        for (index, data) in payload.chunks(chunk_size).enumerate() {
            self.checkpoint(&mut link, cancel).await?;

            let block = u32::try_from(index).unwrap_or(u32::MAX);
            let offset = u32::try_from(sent).unwrap_or(u32::MAX);
            if self.announces_block(block, total_blocks) {
                listener.on_status(TransferStatus::WritingBlock {
                    block: block + 1,
                    total: total_blocks,
                });
            }

            link.expect_ack(Request::Write { block, offset, data }, self.config.ack_timeout)
                .await
                .map_err(|source| {
                    warn!(block, error = %source, "block write failed");
                    TransferError::WriteFailed {
                        stage: TransferStage::Block(block),
                        source,
                    }
                })?;

            sent += data.len();
            let percent = percent_of(sent, payload.len()).min(99);
            if percent > last_percent {
                last_percent = percent;
                listener.on_progress(percent);
            }
        }

        self.checkpoint(&mut link, cancel).await?;
        listener.on_status(TransferStatus::Verifying);
        let response = link
            .request(Request::Verify { image_len }, self.config.verify_timeout)
            .await
            .map_err(|e| TransferError::VerificationFailed(VerifyFault::Readback(e)))?;

        match response {
            Response::Digest(digest) if &digest == capsule.digest() => {}
            Response::Digest(digest) => {
                return Err(TransferError::VerificationFailed(VerifyFault::DigestMismatch {
                    expected: capsule.digest_hex(),
                    actual: hex::encode(digest),
                }));
            }
            Response::Nack(code) => {
                return Err(TransferError::VerificationFailed(VerifyFault::Readback(
                    ChannelFault::Nack(code),
                )));
            }
            other => {
                return Err(TransferError::VerificationFailed(VerifyFault::Readback(
                    unexpected(RequestKind::Verify, &other),
                )));
            }
        }

        listener.on_progress(100);
        info!(digest = %capsule.digest_hex(), "firmware transfer verified");
        Ok(())
    }

    async fn checkpoint<C>(&self, link: &mut Link<'_, C>, cancel: &CancelSignal) -> Result<(), TransferError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        if !cancel.is_cancelled() {
            return Ok(());
        }
        info!("cancellation requested, aborting transfer");
        match link.expect_ack(Request::Abort, self.config.ack_timeout).await {
            Ok(()) => {
                debug!("board acknowledged abort");
                Err(TransferError::Cancelled)
            }
            Err(e) => {
                warn!(error = %e, "board did not acknowledge abort");
                Err(TransferError::CancelUnconfirmed(e))
            }
        }
    }
}
