//! Shared test fixtures: a simulated Galileo board on the far end of an
//! in-memory duplex stream.

use galileo_firmware_update::prelude::*;
use galileo_transfer_protocol::{BoardFaults, FrameDecoder, Request, SimulatedBoard};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Link-level misbehaviour layered on top of the simulated board
#[derive(Debug, Default)]
pub struct LinkScript {
    /// Swallow the write for this block without answering
    pub stall_at_block: Option<u32>,
    /// Close the link when this block arrives
    pub close_at_block: Option<u32>,
    /// Hold the answer to this block until released
    pub hold_at_block: Option<u32>,
}

/// Control for a held block
pub struct Hold {
    /// Fires when the held block has arrived
    pub reached: oneshot::Receiver<()>,
    /// Send to let the board answer
    pub release: oneshot::Sender<()>,
}

/// Running simulated board
pub struct BoardTask {
    pub task: JoinHandle<SimulatedBoard>,
    pub hold: Option<Hold>,
}

impl BoardTask {
    /// Wait for the board loop to exit and hand back the board.
    pub async fn finish(self) -> anyhow::Result<SimulatedBoard> {
        Ok(self.task.await?)
    }
}

fn block_of(request: &Request<'_>) -> Option<u32> {
    match request {
        Request::Write { block, .. } => Some(*block),
        _ => None,
    }
}

/// Spawn `board` behind a duplex stream and return the host end.
pub fn spawn_board(board: SimulatedBoard, script: LinkScript) -> (DuplexStream, BoardTask) {
    let (host, mut device) = tokio::io::duplex(64 * 1024);
    let (reached_tx, reached_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel();
    let hold = script.hold_at_block.map(|_| Hold {
        reached: reached_rx,
        release: release_tx,
    });
    let mut reached_tx = Some(reached_tx);
    let mut release_rx = Some(release_rx);

    let task = tokio::spawn(async move {
        let mut board = board;
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 2048];
        loop {
            let n = match device.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            decoder.push(buf.get(..n).unwrap_or_default());
            while let Ok(Some(frame)) = decoder.next_frame() {
                let block = Request::decode(&frame).ok().as_ref().and_then(block_of);
                if block.is_some() && block == script.close_at_block {
                    return board;
                }
                if block.is_some() && block == script.stall_at_block {
                    continue;
                }
                if block.is_some() && block == script.hold_at_block {
                    if let Some(tx) = reached_tx.take() {
                        tx.send(()).unwrap_or_default();
                    }
                    if let Some(rx) = release_rx.take() {
                        rx.await.unwrap_or_default();
                    }
                }
                let Ok(reply) = board.handle_frame(&frame) else {
                    continue;
                };
                if device.write_all(&reply).await.is_err() {
                    return board;
                }
            }
        }
        board
    });

    (host, BoardTask { task, hold })
}

/// Healthy board with no link faults.
pub fn healthy_board() -> (DuplexStream, BoardTask) {
    spawn_board(SimulatedBoard::new(), LinkScript::default())
}

/// Board with injected flash faults.
pub fn faulty_board(faults: BoardFaults) -> (DuplexStream, BoardTask) {
    spawn_board(SimulatedBoard::with_faults(faults), LinkScript::default())
}

/// Deterministic payload of `len` bytes.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// Bundled capsule carrying `payload` as `version`.
pub fn capsule(version: &str, payload: &[u8]) -> anyhow::Result<FirmwareCapsule> {
    let version: FirmwareVersion = version.parse()?;
    let bytes = CapsuleBuilder::new(version).build(payload)?;
    Ok(FirmwareCapsule::from_bundled("test-image", bytes)?)
}

/// Config with small blocks and short timeouts.
pub fn fast_config(chunk_size: usize) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.transfer.chunk_size = chunk_size;
    config.transfer.ack_timeout = std::time::Duration::from_millis(500);
    config.transfer.erase_timeout = std::time::Duration::from_millis(500);
    config.transfer.verify_timeout = std::time::Duration::from_millis(500);
    config.transfer.status_interval_blocks = 4;
    config
}

/// Drain every event from `handle` up to and including `Finished`.
pub async fn collect_events(handle: &mut UpdateHandle) -> Vec<UpdateEvent> {
    let mut events = Vec::new();
    while let Some(event) = handle.next_event().await {
        let done = matches!(event, UpdateEvent::Finished(_));
        events.push(event);
        if done {
            break;
        }
    }
    events
}

/// Progress values in the order they were reported.
pub fn progress_of(events: &[UpdateEvent]) -> Vec<u8> {
    events
        .iter()
        .filter_map(|e| match e {
            UpdateEvent::Progress(p) => Some(*p),
            _ => None,
        })
        .collect()
}

/// Status messages in the order they were reported.
pub fn messages_of(events: &[UpdateEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            UpdateEvent::Message(m) => Some(m.clone()),
            _ => None,
        })
        .collect()
}
