//! Wire codec for the chunked update-transfer protocol
//!
//! Packets are 60 bytes inside a channel-2 write, with little-endian u16
//! fields. The device drives retransmission with short ASCII-tagged frames
//! ("RQ"/"AK"), reports fatal conditions with "ER" and forwards firmware
//! log lines with "LD"/"LE".

use crate::error::{Error, Result};
use std::path::Path;

/// Full update packet size as written inside the channel-2 envelope.
pub const PACKET_SIZE: usize = 60;

/// Packet header: type, file id, total packages, package index (u16 each).
const HEADER_SIZE: usize = 8;

/// Maximum file content carried per chunk.
pub const MAX_CHUNK_SIZE: usize = PACKET_SIZE - HEADER_SIZE;

/// Filename suffix marking a file for deletion on the device.
pub const DELETE_MARKER: &str = ".delete";

mod packet_type {
    pub const FILE_START: u16 = 1;
    pub const FILE_CHUNK: u16 = 2;
    pub const FILE_END: u16 = 3;
    pub const FILE_DELETE: u16 = 5;
}

/// One host-to-device packet of the transfer protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdatePacket {
    FileStart {
        file_id: u16,
        total_packages: u16,
        filename: String,
        file_size: u16,
    },
    FileChunk {
        file_id: u16,
        total_packages: u16,
        package: u16,
        content: Vec<u8>,
    },
    FileEnd {
        file_id: u16,
    },
    FileDelete {
        file_id: u16,
        filename: String,
    },
}

impl UpdatePacket {
    /// Encode into the fixed 60-byte layout.
    pub fn encode(&self) -> [u8; PACKET_SIZE] {
        let mut buf = [0u8; PACKET_SIZE];
        match self {
            UpdatePacket::FileStart { file_id, total_packages, filename, file_size } => {
                put_header(&mut buf, packet_type::FILE_START, *file_id, *total_packages, 0);
                let name = filename.as_bytes();
                let mut pos = HEADER_SIZE;
                buf[pos] = name.len() as u8;
                pos += 1;
                buf[pos..pos + name.len()].copy_from_slice(name);
                pos += name.len();
                buf[pos] = 2; // size-field marker
                pos += 1;
                buf[pos..pos + 2].copy_from_slice(&file_size.to_le_bytes());
            }
            UpdatePacket::FileChunk { file_id, total_packages, package, content } => {
                put_header(&mut buf, packet_type::FILE_CHUNK, *file_id, *total_packages, *package);
                buf[HEADER_SIZE..HEADER_SIZE + content.len()].copy_from_slice(content);
            }
            UpdatePacket::FileEnd { file_id } => {
                buf[0..2].copy_from_slice(&packet_type::FILE_END.to_le_bytes());
                buf[2..4].copy_from_slice(&file_id.to_le_bytes());
            }
            UpdatePacket::FileDelete { file_id, filename } => {
                buf[0..2].copy_from_slice(&packet_type::FILE_DELETE.to_le_bytes());
                buf[2..4].copy_from_slice(&file_id.to_le_bytes());
                let name = filename.as_bytes();
                buf[4] = name.len() as u8;
                buf[5..5 + name.len()].copy_from_slice(name);
            }
        }
        buf
    }

    /// Encode the on-wire bytes: channel byte followed by the packet.
    pub fn wire_bytes(&self) -> [u8; PACKET_SIZE + 1] {
        let mut bytes = [0u8; PACKET_SIZE + 1];
        bytes[0] = super::report::UPDATE_CHANNEL;
        bytes[1..].copy_from_slice(&self.encode());
        bytes
    }
}

/// Longest transmittable filename: length byte, name, size-field marker
/// and the u16 size must all fit the 52-byte content area.
const MAX_FILENAME: usize = MAX_CHUNK_SIZE - 4;

fn check_filename(filename: &str) -> Result<()> {
    if filename.len() > MAX_FILENAME {
        return Err(Error::Protocol(format!(
            "filename longer than {} bytes: {}",
            MAX_FILENAME, filename
        )));
    }
    Ok(())
}

fn put_header(buf: &mut [u8], ptype: u16, file_id: u16, total: u16, package: u16) {
    buf[0..2].copy_from_slice(&ptype.to_le_bytes());
    buf[2..4].copy_from_slice(&file_id.to_le_bytes());
    buf[4..6].copy_from_slice(&total.to_le_bytes());
    buf[6..8].copy_from_slice(&package.to_le_bytes());
}

/// Severity of a firmware log frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Error,
}

/// Device-to-host frame, tagged by the two leading ASCII bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceFrame {
    /// "RQ" — retransmission request for one segment of one file.
    ChunkRequest { file_id: u16, segment: u16 },
    /// "AK" — acknowledgment of one received segment.
    ChunkAck { file_id: u16, segment: u16 },
    /// "ER" — the device aborted the transfer.
    UpdateError { info: String },
    /// "LD"/"LE" — firmware log line.
    Log { level: LogLevel, text: String },
}

impl DeviceFrame {
    /// Parse a raw inbound frame. Unknown or truncated frames yield `None`;
    /// the update loop skips them rather than aborting.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 2 {
            return None;
        }
        match &data[..2] {
            b"RQ" | b"AK" => {
                if data.len() < 6 {
                    return None;
                }
                let file_id = u16::from_le_bytes([data[2], data[3]]);
                let segment = u16::from_le_bytes([data[4], data[5]]);
                if &data[..2] == b"RQ" {
                    Some(DeviceFrame::ChunkRequest { file_id, segment })
                } else {
                    Some(DeviceFrame::ChunkAck { file_id, segment })
                }
            }
            b"ER" => {
                // The firmware's length byte under-reports on old revisions;
                // clamp to at least 33 bytes of info text.
                let length = data.get(2).copied().unwrap_or(0).max(33) as usize;
                let end = (3 + length).min(data.len());
                let info = String::from_utf8_lossy(&data[3..end])
                    .trim_end_matches('\0')
                    .to_string();
                Some(DeviceFrame::UpdateError { info })
            }
            b"LD" | b"LE" => {
                let level = if &data[..2] == b"LD" { LogLevel::Debug } else { LogLevel::Error };
                let body = &data[2..];
                let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
                let text = String::from_utf8_lossy(&body[..end]).to_string();
                Some(DeviceFrame::Log { level, text })
            }
            _ => None,
        }
    }
}

/// One file being pushed to the device: its full packet sequence plus the
/// set of packet indices already sent.
///
/// Packet 0 is always `FileStart` (or the sole `FileDelete` for deletion
/// markers); the transfer is complete once every index has been sent at
/// least once.
#[derive(Debug)]
pub struct TransferFile {
    id: u16,
    filename: String,
    packets: Vec<UpdatePacket>,
    sent: Vec<bool>,
    acked: u32,
}

impl TransferFile {
    /// Build from in-memory content. A filename carrying the `.delete`
    /// marker produces a single deletion packet for the stripped name.
    pub fn from_bytes(id: u16, filename: &str, content: &[u8]) -> Result<Self> {
        if let Some(stripped) = filename.strip_suffix(DELETE_MARKER) {
            check_filename(stripped)?;
            let packets = vec![UpdatePacket::FileDelete { file_id: id, filename: stripped.to_string() }];
            return Ok(Self {
                id,
                filename: stripped.to_string(),
                sent: vec![false; packets.len()],
                packets,
                acked: 0,
            });
        }
        check_filename(filename)?;

        if content.len() > u16::MAX as usize {
            return Err(Error::Protocol(format!(
                "file {} exceeds the {} byte transfer limit",
                filename,
                u16::MAX
            )));
        }

        // Integer division, matching the firmware's bookkeeping: a file of
        // exactly N*52 bytes reports N, one of N*52+r bytes also reports N.
        let total_packages = (content.len() / MAX_CHUNK_SIZE) as u16;

        let mut packets = vec![UpdatePacket::FileStart {
            file_id: id,
            total_packages,
            filename: filename.to_string(),
            file_size: content.len() as u16,
        }];
        for (index, chunk) in content.chunks(MAX_CHUNK_SIZE).enumerate() {
            packets.push(UpdatePacket::FileChunk {
                file_id: id,
                total_packages,
                package: index as u16,
                content: chunk.to_vec(),
            });
        }
        packets.push(UpdatePacket::FileEnd { file_id: id });

        Ok(Self {
            id,
            filename: filename.to_string(),
            sent: vec![false; packets.len()],
            packets,
            acked: 0,
        })
    }

    /// Build from a file on disk, using its final path component as the
    /// transmitted name.
    pub fn from_path(id: u16, path: &Path) -> Result<Self> {
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Protocol(format!("unusable filename: {}", path.display())))?
            .to_string();
        if filename.ends_with(DELETE_MARKER) {
            return Self::from_bytes(id, &filename, &[]);
        }
        let content = std::fs::read(path)?;
        Self::from_bytes(id, &filename, &content)
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Total number of packets in the sequence (start + chunks + end).
    pub fn packet_count(&self) -> usize {
        self.packets.len()
    }

    /// Packet at a device-addressed segment index.
    pub fn packet(&self, segment: usize) -> Option<&UpdatePacket> {
        self.packets.get(segment)
    }

    /// Lowest packet index not yet sent.
    pub fn next_unsent(&self) -> Option<usize> {
        self.sent.iter().position(|&sent| !sent)
    }

    /// Record a send. Idempotent: re-sending an index never un-completes
    /// the file. Returns true the first time the index is marked.
    pub fn mark_sent(&mut self, segment: usize) -> bool {
        match self.sent.get_mut(segment) {
            Some(slot) if !*slot => {
                *slot = true;
                true
            }
            _ => false,
        }
    }

    /// Record a device acknowledgment (diagnostics only; completion is
    /// driven by the sent set).
    pub fn record_ack(&mut self) {
        self.acked += 1;
    }

    pub fn acked(&self) -> u32 {
        self.acked
    }

    pub fn sent_count(&self) -> usize {
        self.sent.iter().filter(|&&sent| sent).count()
    }

    pub fn is_complete(&self) -> bool {
        self.sent.iter().all(|&sent| sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_of_130_bytes_yields_start_three_chunks_end() {
        let file = TransferFile::from_bytes(0, "main.py", &[0xAB; 130]).unwrap();
        assert_eq!(file.packet_count(), 5);

        match file.packet(0).unwrap() {
            UpdatePacket::FileStart { total_packages, file_size, .. } => {
                assert_eq!(*total_packages, 2);
                assert_eq!(*file_size, 130);
            }
            other => panic!("expected FileStart, got {:?}", other),
        }
        let sizes: Vec<usize> = (1..4)
            .map(|i| match file.packet(i).unwrap() {
                UpdatePacket::FileChunk { content, package, .. } => {
                    assert_eq!(*package as usize, i - 1);
                    content.len()
                }
                other => panic!("expected FileChunk, got {:?}", other),
            })
            .collect();
        assert_eq!(sizes, vec![52, 52, 26]);
        assert!(matches!(file.packet(4).unwrap(), UpdatePacket::FileEnd { .. }));
    }

    #[test]
    fn chunk_count_at_exact_multiple_of_chunk_size() {
        let file = TransferFile::from_bytes(1, "lib.py", &[0u8; 104]).unwrap();
        // 104 / 52 = 2 chunks, and totalPackages records the same division
        assert_eq!(file.packet_count(), 4);
        match file.packet(0).unwrap() {
            UpdatePacket::FileStart { total_packages, .. } => assert_eq!(*total_packages, 2),
            other => panic!("expected FileStart, got {:?}", other),
        }
    }

    #[test]
    fn delete_marker_produces_single_delete_packet() {
        let file = TransferFile::from_bytes(2, "old_module.py.delete", &[]).unwrap();
        assert_eq!(file.packet_count(), 1);
        assert_eq!(file.filename(), "old_module.py");
        match file.packet(0).unwrap() {
            UpdatePacket::FileDelete { file_id, filename } => {
                assert_eq!(*file_id, 2);
                assert_eq!(filename, "old_module.py");
            }
            other => panic!("expected FileDelete, got {:?}", other),
        }
    }

    #[test]
    fn file_start_encoding_layout() {
        let packet = UpdatePacket::FileStart {
            file_id: 7,
            total_packages: 3,
            filename: "a.py".into(),
            file_size: 200,
        };
        let buf = packet.encode();
        assert_eq!(u16::from_le_bytes([buf[0], buf[1]]), 1);
        assert_eq!(u16::from_le_bytes([buf[2], buf[3]]), 7);
        assert_eq!(u16::from_le_bytes([buf[4], buf[5]]), 3);
        assert_eq!(u16::from_le_bytes([buf[6], buf[7]]), 0); // package 0
        assert_eq!(buf[8], 4); // name length
        assert_eq!(&buf[9..13], b"a.py");
        assert_eq!(buf[13], 2); // size-field marker
        assert_eq!(u16::from_le_bytes([buf[14], buf[15]]), 200);
        assert!(buf[16..].iter().all(|&b| b == 0));
    }

    #[test]
    fn file_chunk_encoding_layout() {
        let packet = UpdatePacket::FileChunk {
            file_id: 1,
            total_packages: 2,
            package: 1,
            content: vec![0xCC; 26],
        };
        let buf = packet.encode();
        assert_eq!(u16::from_le_bytes([buf[0], buf[1]]), 2);
        assert_eq!(u16::from_le_bytes([buf[6], buf[7]]), 1);
        assert_eq!(&buf[8..34], &[0xCC; 26][..]);
        assert!(buf[34..].iter().all(|&b| b == 0));
        // Channel byte prepended on the wire
        assert_eq!(packet.wire_bytes()[0], 2);
    }

    #[test]
    fn file_end_and_delete_encoding_layout() {
        let end = UpdatePacket::FileEnd { file_id: 9 }.encode();
        assert_eq!(u16::from_le_bytes([end[0], end[1]]), 3);
        assert_eq!(u16::from_le_bytes([end[2], end[3]]), 9);
        assert!(end[4..].iter().all(|&b| b == 0));

        let del = UpdatePacket::FileDelete { file_id: 4, filename: "x.py".into() }.encode();
        assert_eq!(u16::from_le_bytes([del[0], del[1]]), 5);
        assert_eq!(u16::from_le_bytes([del[2], del[3]]), 4);
        assert_eq!(del[4], 4);
        assert_eq!(&del[5..9], b"x.py");
    }

    #[test]
    fn device_frame_request_and_ack_parse() {
        let frame = DeviceFrame::parse(b"RQ\x03\x00\x02\x00").unwrap();
        assert_eq!(frame, DeviceFrame::ChunkRequest { file_id: 3, segment: 2 });

        let frame = DeviceFrame::parse(b"AK\x01\x00\x05\x00").unwrap();
        assert_eq!(frame, DeviceFrame::ChunkAck { file_id: 1, segment: 5 });
    }

    #[test]
    fn device_frame_error_clamps_length() {
        // Length byte says 4 but the clamp reads at least 33 bytes
        let mut data = b"ER\x04".to_vec();
        data.extend_from_slice(b"filesystem full");
        let frame = DeviceFrame::parse(&data).unwrap();
        match frame {
            DeviceFrame::UpdateError { info } => assert_eq!(info, "filesystem full"),
            other => panic!("expected UpdateError, got {:?}", other),
        }
    }

    #[test]
    fn device_frame_log_stops_at_nul() {
        let frame = DeviceFrame::parse(b"LDhello\x00junk").unwrap();
        assert_eq!(frame, DeviceFrame::Log { level: LogLevel::Debug, text: "hello".into() });

        let frame = DeviceFrame::parse(b"LEboom").unwrap();
        assert_eq!(frame, DeviceFrame::Log { level: LogLevel::Error, text: "boom".into() });
    }

    #[test]
    fn device_frame_rejects_garbage() {
        assert!(DeviceFrame::parse(b"").is_none());
        assert!(DeviceFrame::parse(b"X").is_none());
        assert!(DeviceFrame::parse(b"ZZ\x00\x00\x00\x00").is_none());
        assert!(DeviceFrame::parse(b"RQ\x00").is_none()); // truncated
    }

    #[test]
    fn completion_requires_every_packet_and_is_idempotent() {
        let mut file = TransferFile::from_bytes(0, "m.py", &[1u8; 60]).unwrap();
        assert_eq!(file.packet_count(), 4);
        assert!(!file.is_complete());

        while let Some(index) = file.next_unsent() {
            assert!(file.mark_sent(index));
        }
        assert!(file.is_complete());
        assert_eq!(file.sent_count(), 4);

        // Re-sending a segment never un-completes the file
        assert!(!file.mark_sent(2));
        assert!(file.is_complete());
        assert_eq!(file.sent_count(), 4);
    }

    #[test]
    fn next_unsent_walks_in_order() {
        let mut file = TransferFile::from_bytes(0, "m.py", &[1u8; 10]).unwrap();
        assert_eq!(file.next_unsent(), Some(0));
        file.mark_sent(0);
        assert_eq!(file.next_unsent(), Some(1));
        file.mark_sent(1);
        assert_eq!(file.next_unsent(), Some(2));
    }

    #[test]
    fn oversized_file_is_rejected() {
        let content = vec![0u8; u16::MAX as usize + 1];
        assert!(TransferFile::from_bytes(0, "big.py", &content).is_err());
    }

    #[test]
    fn from_path_uses_the_final_path_component() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("boot.py");
        std::fs::write(&path, [0x11u8; 60]).unwrap();

        let file = TransferFile::from_path(4, &path).unwrap();
        assert_eq!(file.filename(), "boot.py");
        assert_eq!(file.id(), 4);
        // 60 bytes of content split into 2 chunks
        assert_eq!(file.packet_count(), 4);
    }

    #[test]
    fn overlong_filename_is_rejected() {
        let name = "x".repeat(MAX_FILENAME + 1);
        assert!(TransferFile::from_bytes(0, &name, &[1, 2, 3]).is_err());
        let marker = format!("{}.delete", name);
        assert!(TransferFile::from_bytes(0, &marker, &[]).is_err());
    }
}
