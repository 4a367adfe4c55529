//! Non-interactive serial monitor.
//!
//! Streams device output to stdout and keeps all status chatter on stderr,
//! so `usb-device NAME monitor --timeout 30 > capture.log` composes with
//! pipelines. Data can be queued for transmission after connect, each item
//! with its own settle delay.

use std::time::Duration;

use time::OffsetDateTime;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::signal::unix::{self, SignalKind};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use crate::error::{Error, Result};

/// Retries while waiting for a port to (re)appear.
const OPEN_RETRIES: u32 = 20;
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct MonitorOptions {
    pub baud: u32,
    pub timestamps: bool,
    /// Exit after this long; `None` runs until a signal arrives.
    pub timeout: Option<Duration>,
    /// Data to transmit after connecting: `(delay, bytes)` pairs, sent in
    /// order with the delay applied before each send.
    pub sends: Vec<(Duration, Vec<u8>)>,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        MonitorOptions {
            baud: 115_200,
            timestamps: false,
            timeout: None,
            sends: Vec::new(),
        }
    }
}

/// Parse a `--send` argument: an optional `@SECSx` prefix sets the delay,
/// `\n`/`\r` escapes are expanded.
pub fn parse_send(arg: &str) -> (Duration, Vec<u8>) {
    let mut delay = Duration::from_millis(500);
    let mut data = arg;
    if let Some(rest) = arg.strip_prefix('@') {
        if let Some((secs, payload)) = rest.split_once('x') {
            if let Ok(s) = secs.parse::<f64>() {
                delay = Duration::from_secs_f64(s);
                data = payload;
            }
        }
    }
    let expanded = data.replace("\\n", "\n").replace("\\r", "\r");
    (delay, expanded.into_bytes())
}

async fn open_with_retry(path: &str, baud: u32) -> Result<SerialStream> {
    let mut attempt = 0;
    loop {
        match tokio_serial::new(path, baud).open_native_async() {
            Ok(stream) => return Ok(stream),
            Err(e) if attempt + 1 >= OPEN_RETRIES => {
                return Err(Error::Environment(format!(
                    "could not open {path} after {}s: {e}",
                    OPEN_RETRIES as u64 * OPEN_RETRY_DELAY.as_millis() as u64 / 1000
                )));
            }
            Err(_) => {
                if attempt == 0 {
                    eprintln!("[monitor] Waiting for {path}...");
                }
                attempt += 1;
                tokio::time::sleep(OPEN_RETRY_DELAY).await;
            }
        }
    }
}

fn timestamp() -> String {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    now.format(time::macros::format_description!(
        "[hour]:[minute]:[second].[subsecond digits:3]"
    ))
    .unwrap_or_default()
}

/// Run the monitor until timeout, signal, or unrecoverable port loss.
pub async fn run(path: &str, opts: MonitorOptions) -> Result<()> {
    let port = open_with_retry(path, opts.baud).await?;
    // Split so the read loop and the send schedule can hold the port at
    // the same time.
    let (mut reader, mut writer) = tokio::io::split(port);

    match opts.timeout {
        Some(t) => eprintln!(
            "[monitor] {path} @ {} baud (timeout {}s)",
            opts.baud,
            t.as_secs_f64()
        ),
        None => eprintln!("[monitor] {path} @ {} baud (kill to stop)", opts.baud),
    }

    let mut sigint = unix::signal(SignalKind::interrupt())?;
    let mut sigterm = unix::signal(SignalKind::terminate())?;

    let deadline = opts.timeout.map(|t| tokio::time::Instant::now() + t);
    let mut sends = opts.sends.into_iter();
    let mut next_send = sends.next();
    let mut send_at = next_send
        .as_ref()
        .map(|(delay, _)| tokio::time::Instant::now() + *delay);

    let mut stdout = tokio::io::stdout();
    let mut buf = [0u8; 1024];
    let mut line_start = true;

    loop {
        let sleep_target = match (deadline, send_at) {
            (Some(d), Some(s)) => Some(d.min(s)),
            (Some(d), None) => Some(d),
            (None, s) => s,
        };

        tokio::select! {
            _ = sigint.recv() => break,
            _ = sigterm.recv() => break,

            _ = async {
                match sleep_target {
                    Some(t) => tokio::time::sleep_until(t).await,
                    None => std::future::pending::<()>().await,
                }
            } => {
                let now = tokio::time::Instant::now();
                if send_at.is_some_and(|s| now >= s) {
                    if let Some((_, data)) = next_send.take() {
                        writer.write_all(&data).await?;
                        writer.flush().await?;
                        eprintln!("[monitor] Sent: {:?}", String::from_utf8_lossy(&data));
                    }
                    next_send = sends.next();
                    send_at = next_send.as_ref().map(|(delay, _)| now + *delay);
                }
                if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
                    break;
                }
            }

            read = reader.read(&mut buf) => {
                match read {
                    Ok(0) | Err(_) => {
                        eprintln!("[monitor] Connection lost. Reconnecting...");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        let port = open_with_retry(path, opts.baud).await?;
                        (reader, writer) = tokio::io::split(port);
                    }
                    Ok(n) => {
                        write_chunk(&mut stdout, &buf[..n], opts.timestamps, &mut line_start)
                            .await?;
                    }
                }
            }
        }
    }

    eprintln!();
    eprintln!("[monitor] Disconnected.");
    Ok(())
}

async fn write_chunk(
    stdout: &mut tokio::io::Stdout,
    chunk: &[u8],
    timestamps: bool,
    line_start: &mut bool,
) -> Result<()> {
    if !timestamps {
        stdout.write_all(chunk).await?;
        stdout.flush().await?;
        return Ok(());
    }

    let mut out = Vec::with_capacity(chunk.len() + 16);
    for &b in chunk {
        if *line_start {
            out.extend_from_slice(format!("[{}] ", timestamp()).as_bytes());
            *line_start = false;
        }
        out.push(b);
        if b == b'\n' {
            *line_start = true;
        }
    }
    stdout.write_all(&out).await?;
    stdout.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_send_default_delay() {
        let (delay, data) = parse_send("T");
        assert_eq!(delay, Duration::from_millis(500));
        assert_eq!(data, b"T");
    }

    #[test]
    fn parse_send_with_delay_prefix() {
        let (delay, data) = parse_send("@2xT");
        assert_eq!(delay, Duration::from_secs(2));
        assert_eq!(data, b"T");

        let (delay, data) = parse_send("@0.5xhello");
        assert_eq!(delay, Duration::from_millis(500));
        assert_eq!(data, b"hello");
    }

    #[test]
    fn parse_send_expands_escapes() {
        let (_, data) = parse_send("cmd\\n");
        assert_eq!(data, b"cmd\n");
    }

    #[test]
    fn malformed_delay_prefix_sent_verbatim() {
        let (delay, data) = parse_send("@notasecx");
        assert_eq!(delay, Duration::from_millis(500));
        assert_eq!(data, b"@notasecx");
    }
}
