// ABOUTME: Log collection for activations: demultiplexes the sandbox output stream
// ABOUTME: Handles the end-of-activation sentinel, timestamp filtering, and byte-budget truncation

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::substrate::{Result, Substrate};

/// Written by every runtime to both stdout and stderr at the end of each
/// `/init` and `/run` response.
pub const ACTIVATION_SENTINEL: &str = "XXX_THE_END_OF_A_WHISK_ACTIVATION_XXX";

/// Applied when the caller passes a non-positive byte budget.
pub const DEFAULT_MAX_LOG_BYTES: i64 = 10 * 1024 * 1024;

const TRUNCATION_MARKER: &str = "... (log truncated)";

/// One demultiplexed line of sandbox output.
#[derive(Debug, Clone, PartialEq)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogStream::Stdout => f.write_str("stdout"),
            LogStream::Stderr => f.write_str("stderr"),
        }
    }
}

/// Extracts the per-invocation slice of a sandbox's output.
pub struct LogCollector {
    substrate: Arc<dyn Substrate>,
}

impl LogCollector {
    pub fn new(substrate: Arc<dyn Substrate>) -> Self {
        Self { substrate }
    }

    /// Collect and format the sandbox's output since `since`, stopping at
    /// the first sentinel and truncating to `max_bytes`.
    pub async fn collect(
        &self,
        sandbox_id: &str,
        since: DateTime<Utc>,
        max_bytes: i64,
    ) -> Result<Vec<String>> {
        let raw = self.substrate.raw_logs(sandbox_id, since).await?;
        let lines = demux(&raw, since);
        Ok(truncate(format_lines(&lines), max_bytes))
    }
}

/// Append one frame in the daemon's multiplexed format: an 8-byte header
/// (byte 0 = stream kind, bytes 4-7 = big-endian payload length) followed
/// by the payload.
pub fn encode_frame(stream: u8, payload: &[u8], buf: &mut Vec<u8>) {
    buf.push(stream);
    buf.extend_from_slice(&[0, 0, 0]);
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
}

/// Parse the multiplexed stream into lines, dropping anything stamped
/// before `since` and stopping at the first sentinel. The sentinel itself
/// is never emitted. Malformed frames are skipped.
fn demux(raw: &[u8], since: DateTime<Utc>) -> Vec<LogLine> {
    let mut lines = Vec::new();
    let mut off = 0;

    while raw.len().saturating_sub(off) >= 8 {
        let kind = raw[off];
        let len = u32::from_be_bytes([raw[off + 4], raw[off + 5], raw[off + 6], raw[off + 7]])
            as usize;
        off += 8;

        if raw.len().saturating_sub(off) < len {
            // Truncated tail frame.
            break;
        }
        let payload = &raw[off..off + len];
        off += len;

        let Some(line) = parse_line(kind, payload) else {
            continue;
        };
        // A frame left over from a previous activation (including its
        // sentinel) is filtered before sentinel detection.
        if line.timestamp < since {
            continue;
        }
        if line.message.contains(ACTIVATION_SENTINEL) {
            break;
        }
        lines.push(line);
    }

    lines
}

fn parse_line(kind: u8, payload: &[u8]) -> Option<LogLine> {
    let stream = match kind {
        1 => LogStream::Stdout,
        2 => LogStream::Stderr,
        _ => return None,
    };

    let text = std::str::from_utf8(payload).ok()?;
    let (ts, message) = text.trim_end_matches(['\r', '\n']).split_once(' ')?;
    let timestamp = DateTime::parse_from_rfc3339(ts).ok()?.with_timezone(&Utc);

    Some(LogLine {
        timestamp,
        stream,
        message: message.to_string(),
    })
}

fn format_lines(lines: &[LogLine]) -> Vec<String> {
    lines
        .iter()
        .map(|line| {
            format!(
                "{} {}: {}",
                line.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
                line.stream,
                line.message
            )
        })
        .collect()
}

fn truncate(lines: Vec<String>, max_bytes: i64) -> Vec<String> {
    let budget = if max_bytes > 0 {
        max_bytes as usize
    } else {
        DEFAULT_MAX_LOG_BYTES as usize
    };

    let mut total = 0usize;
    let mut out = Vec::with_capacity(lines.len());
    for line in lines {
        let size = line.len() + 1;
        if total + size > budget {
            out.push(TRUNCATION_MARKER.to_string());
            break;
        }
        total += size;
        out.push(line);
    }
    out
}
