//! Bootloader probe: classify whether a device is running firmware or
//! sitting in its ROM bootloader.
//!
//! The probe opens the device's serial port and transmits one framed
//! synchronization packet. A bootloader answers the sync command within a
//! few milliseconds; running firmware ignores it and the read times out.
//! The caller probes at most once per appearance to avoid contending with
//! user processes on the same port.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPort, SerialPortBuilderExt};

use crate::tracing::prelude::*;

const BAUD: u32 = 115_200;
const READ_TIMEOUT: Duration = Duration::from_millis(150);

/// Frame delimiter and escape bytes.
const DELIM: u8 = 0x7e;
const ESC: u8 = 0x7d;
const ESC_XOR: u8 = 0x20;

/// Sync command byte, echoed in the bootloader's response.
const CMD_SYNC: u8 = 0x08;

/// Probe verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// No sync response: the device is running its firmware.
    Running,
    /// Sync response received: the device sits in the ROM bootloader.
    Bootloader,
    /// The port could not be opened or I/O failed mid-probe.
    Unknown,
}

/// Build the framed sync packet.
///
/// Packet layout: direction `0x00`, command `0x08`, payload length (LE u16),
/// checksum placeholder (4 zero bytes), then the sync payload
/// `07 07 12 20` followed by 32 × `0x55`.
fn sync_frame() -> Vec<u8> {
    let mut payload = Vec::with_capacity(44);
    let sync_data: Vec<u8> = [0x07, 0x07, 0x12, 0x20]
        .into_iter()
        .chain(std::iter::repeat(0x55).take(32))
        .collect();
    payload.push(0x00);
    payload.push(CMD_SYNC);
    payload.extend_from_slice(&(sync_data.len() as u16).to_le_bytes());
    payload.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
    payload.extend_from_slice(&sync_data);
    encode_frame(&payload)
}

/// Escape and delimit one packet.
fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 2);
    frame.push(DELIM);
    for &b in payload {
        if b == DELIM || b == ESC {
            frame.push(ESC);
            frame.push(b ^ ESC_XOR);
        } else {
            frame.push(b);
        }
    }
    frame.push(DELIM);
    frame
}

/// Extract unescaped frame payloads from a raw read buffer.
fn decode_frames(buf: &[u8]) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    let mut current: Option<Vec<u8>> = None;
    let mut escaped = false;

    for &b in buf {
        match &mut current {
            None => {
                if b == DELIM {
                    current = Some(Vec::new());
                }
            }
            Some(payload) => {
                if escaped {
                    payload.push(b ^ ESC_XOR);
                    escaped = false;
                } else if b == ESC {
                    escaped = true;
                } else if b == DELIM {
                    if payload.is_empty() {
                        // Back-to-back delimiters; stay in-frame.
                        continue;
                    }
                    frames.push(current.take().unwrap_or_default());
                } else {
                    payload.push(b);
                }
            }
        }
    }
    frames
}

/// Does the buffer contain a sync response frame?
fn is_sync_response(buf: &[u8]) -> bool {
    decode_frames(buf)
        .iter()
        .any(|f| f.len() >= 2 && f[1] == CMD_SYNC)
}

/// Synchronously handshake with the device at `path`.
pub async fn probe(path: &str) -> ProbeResult {
    match probe_inner(path).await {
        Ok(true) => ProbeResult::Bootloader,
        Ok(false) => ProbeResult::Running,
        Err(e) => {
            debug!(path, error = %e, "Probe failed");
            ProbeResult::Unknown
        }
    }
}

async fn probe_inner(path: &str) -> std::io::Result<bool> {
    let mut port = tokio_serial::new(path, BAUD)
        .timeout(READ_TIMEOUT)
        .open_native_async()?;
    port.write_data_terminal_ready(true)?;

    port.write_all(&sync_frame()).await?;
    port.flush().await?;

    // Accumulate whatever arrives inside the read window; a bootloader
    // answers within ~10 ms, firmware not at all.
    let mut collected = Vec::new();
    let deadline = tokio::time::Instant::now() + READ_TIMEOUT;
    let mut buf = [0u8; 256];
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Ok(false);
        }
        match tokio::time::timeout(remaining, port.read(&mut buf)).await {
            Err(_) => return Ok(false),
            Ok(Ok(0)) => return Ok(false),
            Ok(Ok(n)) => {
                collected.extend_from_slice(&buf[..n]);
                if is_sync_response(&collected) {
                    return Ok(true);
                }
            }
            Ok(Err(e)) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_frame_layout() {
        let frame = sync_frame();
        assert_eq!(frame[0], DELIM);
        assert_eq!(*frame.last().unwrap(), DELIM);

        // Unescaped interior: dir, cmd, len (36 LE), 4-byte checksum, data.
        let frames = decode_frames(&frame);
        assert_eq!(frames.len(), 1);
        let p = &frames[0];
        assert_eq!(p[0], 0x00);
        assert_eq!(p[1], CMD_SYNC);
        assert_eq!(u16::from_le_bytes([p[2], p[3]]), 36);
        assert_eq!(&p[4..8], &[0, 0, 0, 0]);
        assert_eq!(&p[8..12], &[0x07, 0x07, 0x12, 0x20]);
        assert_eq!(&p[12..], &[0x55; 32]);
    }

    #[test]
    fn delimiter_and_escape_bytes_are_escaped() {
        let frame = encode_frame(&[0x01, DELIM, ESC, 0x02]);
        assert_eq!(
            frame,
            vec![
                DELIM,
                0x01,
                ESC,
                DELIM ^ ESC_XOR,
                ESC,
                ESC ^ ESC_XOR,
                0x02,
                DELIM
            ]
        );
    }

    #[test]
    fn decode_inverts_encode() {
        let payload = vec![0x00, CMD_SYNC, DELIM, ESC, 0xff, 0x00];
        let frames = decode_frames(&encode_frame(&payload));
        assert_eq!(frames, vec![payload]);
    }

    #[test]
    fn sync_response_detected_by_command_byte() {
        let response = encode_frame(&[0x01, CMD_SYNC, 0x02, 0x00, 0x12, 0x20, 0x55, 0x55]);
        assert!(is_sync_response(&response));

        let other = encode_frame(&[0x01, 0x0a, 0x00, 0x00]);
        assert!(!is_sync_response(&other));
        assert!(!is_sync_response(&[0x00, 0x01, 0x02]));
    }

    #[test]
    fn partial_garbage_before_frame_tolerated() {
        let mut buf = vec![0x12, 0x34];
        buf.extend(encode_frame(&[0x01, CMD_SYNC, 0x00]));
        assert!(is_sync_response(&buf));
    }
}
