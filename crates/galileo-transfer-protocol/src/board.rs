//! Pure simulation of the board side of the protocol.
//!
//! The simulated board keeps the flash image in memory, enforces the same
//! ordering rules as the bootloader, and can be told to misbehave so that
//! host-side failure handling can be exercised without hardware.

use sha2::{Digest, Sha256};
use tracing::trace;

use crate::DIGEST_LEN;
use crate::commands::{NackCode, Request, RequestKind, Response};
use crate::error::ProtocolResult;
use crate::frame::Frame;

/// Faults the simulated board injects on request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoardFaults {
    /// Reject this block with [`NackCode::FlashWrite`]
    pub nack_on_block: Option<u32>,
    /// Report a digest that does not match the written image
    pub corrupt_readback: bool,
}

#[derive(Debug, Default)]
enum FlashState {
    #[default]
    Idle,
    Erased {
        image: Vec<u8>,
        image_len: usize,
        next_block: u32,
    },
}

/// In-memory board that answers protocol requests.
#[derive(Debug, Default)]
pub struct SimulatedBoard {
    state: FlashState,
    faults: BoardFaults,
    history: Vec<RequestKind>,
    committed: Option<Vec<u8>>,
}

impl SimulatedBoard {
    /// Create a well-behaved board.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a board that injects the given faults.
    pub fn with_faults(faults: BoardFaults) -> Self {
        Self {
            faults,
            ..Self::default()
        }
    }

    /// Every request handled so far, in arrival order.
    pub fn history(&self) -> &[RequestKind] {
        &self.history
    }

    /// Image that passed its last verification, if any.
    pub fn committed_image(&self) -> Option<&[u8]> {
        self.committed.as_deref()
    }

    /// Whether the board is idle (no erase in progress).
    pub fn is_idle(&self) -> bool {
        matches!(self.state, FlashState::Idle)
    }

    /// Handle one decoded request.
    pub fn handle(&mut self, request: &Request<'_>) -> Response {
        self.history.push(request.kind());
        trace!(request = request.kind().name(), "simulated board request");

        match *request {
            Request::Sync | Request::Abort => {
                self.state = FlashState::Idle;
                Response::Ack
            }
            Request::Erase { image_len } => {
                self.state = FlashState::Erased {
                    image: Vec::new(),
                    image_len: usize::try_from(image_len).unwrap_or(usize::MAX),
                    next_block: 0,
                };
                Response::Ack
            }
            Request::Write {
                block,
                offset,
                data,
            } => self.write_block(block, offset, data),
            Request::Verify { image_len } => self.verify(image_len),
        }
    }

    /// Decode a request frame, handle it, and encode the response with the
    /// same sequence number.
    pub fn handle_frame(&mut self, frame: &Frame) -> ProtocolResult<Vec<u8>> {
        let response = match Request::decode(frame) {
            Ok(request) => self.handle(&request),
            Err(_) => Response::Nack(NackCode::Malformed),
        };
        response.encode(frame.seq)
    }

    fn write_block(&mut self, block: u32, offset: u32, data: &[u8]) -> Response {
        let FlashState::Erased {
            image,
            image_len,
            next_block,
        } = &mut self.state
        else {
            return Response::Nack(NackCode::EraseRequired);
        };

        if block != *next_block || usize::try_from(offset).ok() != Some(image.len()) {
            return Response::Nack(NackCode::OutOfOrder);
        }
        if image.len().saturating_add(data.len()) > *image_len {
            return Response::Nack(NackCode::OutOfRange);
        }
        if self.faults.nack_on_block == Some(block) {
            return Response::Nack(NackCode::FlashWrite);
        }

        image.extend_from_slice(data);
        *next_block = next_block.saturating_add(1);
        Response::Ack
    }

    fn verify(&mut self, image_len: u32) -> Response {
        let FlashState::Erased { image, .. } = &self.state else {
            return Response::Nack(NackCode::EraseRequired);
        };
        if usize::try_from(image_len).ok() != Some(image.len()) {
            return Response::Nack(NackCode::OutOfRange);
        }

        let mut digest: [u8; DIGEST_LEN] = Sha256::digest(image).into();
        if self.faults.corrupt_readback {
            for byte in &mut digest {
                *byte = !*byte;
            }
        } else {
            self.committed = Some(image.clone());
        }
        Response::Digest(digest)
    }
}
