//! Firmware update engine
//!
//! Drives the chunked transfer protocol over a device handle it holds
//! exclusively: normal HID traffic is not interleaved during an upgrade.
//! Files are streamed proactively with a fixed inter-packet pace while
//! device-issued retransmission requests are serviced with priority; a
//! bounded grace window after the last send catches late requests.

use crate::error::{Error, Result};
use crate::hid::report::{HidCommand, UPDATE_CHANNEL};
use crate::hid::transfer::{DeviceFrame, LogLevel, TransferFile, UpdatePacket, PACKET_SIZE};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Settle time after state-changing commands (prepare, commit, reset).
const STATE_CHANGE_SETTLE: Duration = Duration::from_millis(500);

/// Pace between packet writes, respecting device-side buffering.
const DATA_TRANSFER_PACE: Duration = Duration::from_millis(20);

/// How long to keep servicing retransmission requests after the last send.
const REQUEST_GRACE: Duration = Duration::from_secs(5);

/// Bounded poll for an inbound device frame.
const DEVICE_POLL_TIMEOUT_MS: i32 = 100;

/// Device frames are short; 24 bytes covers every variant's fixed part.
const DEVICE_FRAME_READ: usize = 24;

/// Minimal device I/O needed by the engine, so tests can run against a
/// scripted fake instead of hardware.
pub trait UpdateIo {
    fn write(&self, data: &[u8]) -> Result<usize>;
    fn read_timeout(&self, buf: &mut [u8], timeout_ms: i32) -> Result<usize>;
}

impl UpdateIo for hidapi::HidDevice {
    fn write(&self, data: &[u8]) -> Result<usize> {
        hidapi::HidDevice::write(self, data).map_err(Error::from)
    }

    fn read_timeout(&self, buf: &mut [u8], timeout_ms: i32) -> Result<usize> {
        hidapi::HidDevice::read_timeout(self, buf, timeout_ms).map_err(Error::from)
    }
}

/// Push the given files to the device and reset it.
///
/// Progress accounting: a file's progress is its count of packets sent at
/// least once; device acks are logged and tallied per file but do not
/// drive completion.
pub async fn perform_upgrade<D: UpdateIo>(device: &D, mut files: Vec<TransferFile>) -> Result<()> {
    info!("starting upgrade with {} file(s)", files.len());
    device.write(&HidCommand::PrepareUpdate.wire_bytes())?;
    tokio::time::sleep(STATE_CHANGE_SETTLE).await;

    let mut requests: VecDeque<(u16, u16)> = VecDeque::new();
    let mut last_send = Instant::now();
    let mut announced_grace = false;

    loop {
        if let Some(frame) = poll_device_frame(device)? {
            match frame {
                DeviceFrame::ChunkRequest { file_id, segment } => {
                    // Validate before queueing: a request for an unknown
                    // file or segment means host and device disagree about
                    // the transfer, and continuing risks flashing corrupt
                    // data.
                    let known = files
                        .iter()
                        .find(|f| f.id() == file_id)
                        .map(|f| (segment as usize) < f.packet_count());
                    match known {
                        Some(true) => requests.push_back((file_id, segment)),
                        Some(false) => {
                            return Err(Error::Protocol(format!(
                                "chunk request out of range: file {} segment {}",
                                file_id, segment
                            )))
                        }
                        None => {
                            return Err(Error::Protocol(format!(
                                "chunk request for unknown file {}",
                                file_id
                            )))
                        }
                    }
                }
                DeviceFrame::ChunkAck { file_id, segment } => {
                    match files.iter_mut().find(|f| f.id() == file_id) {
                        Some(file) => {
                            file.record_ack();
                            debug!(
                                "ack for {} segment {} ({} acked)",
                                file.filename(),
                                segment,
                                file.acked()
                            );
                        }
                        None => {
                            return Err(Error::Protocol(format!(
                                "ack for unknown file {}",
                                file_id
                            )))
                        }
                    }
                }
                DeviceFrame::UpdateError { info } => {
                    return Err(Error::Protocol(format!("device aborted update: {}", info)));
                }
                DeviceFrame::Log { level, text } => match level {
                    LogLevel::Debug => debug!("device: {}", text),
                    LogLevel::Error => error!("device: {}", text),
                },
            }
        }

        // Requested resends always take priority over proactive streaming.
        if let Some((file_id, segment)) = requests.pop_front() {
            let file = files
                .iter_mut()
                .find(|f| f.id() == file_id)
                .ok_or_else(|| Error::Protocol(format!("chunk request for unknown file {}", file_id)))?;
            let packet = file
                .packet(segment as usize)
                .ok_or_else(|| {
                    Error::Protocol(format!(
                        "chunk request out of range: file {} segment {}",
                        file_id, segment
                    ))
                })?;
            debug!("resending {} segment {}", file_id, segment);
            send_packet(device, packet).await?;
            file.mark_sent(segment as usize);
            last_send = Instant::now();
        }

        // Proactive streaming: first incomplete file in stable order.
        if let Some(file) = files.iter_mut().find(|f| !f.is_complete()) {
            if let Some(index) = file.next_unsent() {
                let packet = file
                    .packet(index)
                    .ok_or_else(|| Error::Protocol("packet index out of range".into()))?;
                send_packet(device, packet).await?;
                file.mark_sent(index);
                last_send = Instant::now();
                announced_grace = false;
                if file.is_complete() {
                    info!(
                        "{}: {}/{} packets sent",
                        file.filename(),
                        file.sent_count(),
                        file.packet_count()
                    );
                }
            }
        } else {
            if !announced_grace {
                info!("all files transferred, waiting for late chunk requests");
                announced_grace = true;
            }
            if requests.is_empty() && last_send.elapsed() >= REQUEST_GRACE {
                break;
            }
            tokio::time::sleep(Duration::from_millis(DEVICE_POLL_TIMEOUT_MS as u64)).await;
        }
    }

    tokio::time::sleep(STATE_CHANGE_SETTLE).await;
    device.write(&filesystem_commit())?;
    tokio::time::sleep(STATE_CHANGE_SETTLE).await;
    info!("committing and resetting device");
    device.write(&HidCommand::Reset.wire_bytes())?;
    Ok(())
}

fn poll_device_frame<D: UpdateIo>(device: &D) -> Result<Option<DeviceFrame>> {
    let mut buf = [0u8; DEVICE_FRAME_READ];
    let n = device.read_timeout(&mut buf, DEVICE_POLL_TIMEOUT_MS)?;
    if n == 0 {
        return Ok(None);
    }
    match DeviceFrame::parse(&buf[..n]) {
        Some(frame) => Ok(Some(frame)),
        None => {
            warn!("skipping unrecognized device frame ({} bytes)", n);
            Ok(None)
        }
    }
}

async fn send_packet<D: UpdateIo>(device: &D, packet: &UpdatePacket) -> Result<()> {
    device.write(&packet.wire_bytes())?;
    tokio::time::sleep(DATA_TRANSFER_PACE).await;
    Ok(())
}

/// Commit the transferred files to the device filesystem.
fn filesystem_commit() -> [u8; PACKET_SIZE + 1] {
    let mut frame = [0u8; PACKET_SIZE + 1];
    frame[0] = UPDATE_CHANNEL;
    frame[1] = 4;
    frame
}
