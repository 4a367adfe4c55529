//! Display-hub wire protocol.
//!
//! The hub speaks newline-delimited JSON over USB CDC serial at 115200 8N1
//! with DTR asserted. Each push is one `{"action":"set","params":{...}}`
//! object; the hub acknowledges with `{"status":"ok"}`. Text fields render
//! on a small panel and are truncated to 14 characters.

use std::collections::BTreeMap;
use std::io;

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use crate::registry::truncate_display;
use crate::tracing::prelude::*;

/// Number of display channels on the current hub generation.
pub const CHANNEL_COUNT: usize = 3;

/// Panel colors understood by the hub firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Color {
    Green,
    Orange,
    Red,
    Cyan,
    DarkGrey,
    White,
}

/// Runtime state shown for a device on its channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum RuntimeState {
    Connected,
    Bootloader,
    Disconnected,
    Unknown,
}

impl RuntimeState {
    pub fn color(self) -> Color {
        match self {
            RuntimeState::Connected => Color::Green,
            RuntimeState::Bootloader => Color::Orange,
            RuntimeState::Disconnected => Color::Red,
            RuntimeState::Unknown => Color::DarkGrey,
        }
    }
}

/// One text line of a channel display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextLine {
    pub txt: String,
    pub color: Color,
}

impl TextLine {
    pub fn new(text: &str, color: Color) -> TextLine {
        TextLine {
            txt: truncate_display(text),
            color,
        }
    }
}

/// The three text slots of one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lines {
    #[serde(rename = "T1")]
    pub t1: TextLine,
    #[serde(rename = "T2", skip_serializing_if = "Option::is_none")]
    pub t2: Option<TextLine>,
    #[serde(rename = "T3", skip_serializing_if = "Option::is_none")]
    pub t3: Option<TextLine>,
}

/// Full display payload for one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDisplay {
    #[serde(rename = "Dev1_name")]
    pub lines: Lines,
    #[serde(rename = "numDev")]
    pub num_dev: String,
    #[serde(rename = "usbType")]
    pub usb_type: String,
}

impl ChannelDisplay {
    fn with_lines(lines: Lines) -> ChannelDisplay {
        ChannelDisplay {
            lines,
            num_dev: "10".to_string(),
            usb_type: "2".to_string(),
        }
    }

    /// Display for a present device: name colored by state, the state (or
    /// type, when running normally) on line two, topology detail on three.
    pub fn device(name: &str, state: RuntimeState, type_tag: &str, detail: Option<&str>) -> Self {
        let t2_text = match state {
            RuntimeState::Connected => type_tag.to_string(),
            other => other.to_string(),
        };
        let t2_color = match state {
            RuntimeState::Connected => Color::White,
            other => other.color(),
        };
        ChannelDisplay::with_lines(Lines {
            t1: TextLine::new(name, state.color()),
            t2: Some(TextLine { txt: truncate_display(&t2_text), color: t2_color }),
            t3: detail.map(|d| TextLine::new(d, Color::DarkGrey)),
        })
    }

    /// Display for an empty channel.
    pub fn empty() -> Self {
        ChannelDisplay::with_lines(Lines {
            t1: TextLine::new("---", Color::DarkGrey),
            t2: None,
            t3: None,
        })
    }
}

/// One push to the hub.
#[derive(Debug, Clone, Serialize)]
pub struct SetCommand {
    action: &'static str,
    pub params: BTreeMap<String, ChannelDisplay>,
}

impl SetCommand {
    /// Set a single channel (1-based index).
    pub fn channel(index: usize, display: ChannelDisplay) -> SetCommand {
        let mut params = BTreeMap::new();
        params.insert(format!("CH{index}"), display);
        SetCommand {
            action: "set",
            params,
        }
    }
}

/// Acknowledgement from the hub.
#[derive(Debug, Clone, Deserialize)]
pub struct HubResponse {
    #[serde(default)]
    pub status: Option<String>,
}

impl HubResponse {
    pub fn is_ok(&self) -> bool {
        self.status.as_deref() == Some("ok")
    }
}

/// Codec for line-delimited JSON to and from the hub.
///
/// Unparseable lines (boot chatter, partial writes after reconnect) are
/// logged and skipped rather than failing the stream.
#[derive(Default)]
pub struct HubCodec;

impl Encoder<SetCommand> for HubCodec {
    type Error = io::Error;

    fn encode(&mut self, item: SetCommand, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = serde_json::to_vec(&item)?;
        trace!(frame = %String::from_utf8_lossy(&payload), "TX hub");
        dst.reserve(payload.len() + 1);
        dst.put_slice(&payload);
        dst.put_u8(b'\n');
        Ok(())
    }
}

impl Decoder for HubCodec {
    type Item = HubResponse;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while let Some(pos) = src.iter().position(|&b| b == b'\n') {
            let line = src.split_to(pos + 1);
            let text = String::from_utf8_lossy(&line[..pos]);
            let text = text.trim();
            if text.is_empty() {
                continue;
            }
            match serde_json::from_str::<HubResponse>(text) {
                Ok(resp) => {
                    trace!(frame = %text, "RX hub");
                    return Ok(Some(resp));
                }
                Err(e) => {
                    debug!(line = %text, error = %e, "Unparseable hub line, skipping");
                }
            }
        }
        Ok(None)
    }
}

/// Map a device location onto a hub display channel.
///
/// A device at location `L` is on channel `c` iff `L` starts with
/// `<hub_location>.c` for `c` in `1..=CHANNEL_COUNT`.
pub fn channel_for(location: &str, hub_location: &str) -> Option<usize> {
    let remainder = location.strip_prefix(hub_location)?.strip_prefix('.')?;
    let port: usize = remainder.split('.').next()?.parse().ok()?;
    (1..=CHANNEL_COUNT).contains(&port).then_some(port)
}
