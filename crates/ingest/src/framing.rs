//! `Content-Length` framing for JSON-RPC over stdio.

use anyhow::{bail, Context, Result};
use serde_json::Value as JsonValue;
use std::io::{BufRead, Write};

pub const MAX_MESSAGE_BYTES: usize = 1_048_576; // 1 MiB

/// Read header lines up to the blank separator and return the declared
/// body length. `Ok(None)` means the stream ended before a new frame.
fn read_content_length<R: BufRead>(reader: &mut R) -> Result<Option<usize>> {
    let mut content_length = None;
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        let header = line.trim_end_matches(['\r', '\n']);
        if header.is_empty() {
            break;
        }
        let Some((name, value)) = header.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("Content-Length") {
            let len = value
                .trim()
                .parse::<usize>()
                .with_context(|| format!("invalid Content-Length {:?}", value.trim()))?;
            content_length = Some(len);
        }
    }
    content_length
        .context("missing Content-Length header")
        .map(Some)
}

/// Read one framed message. The body is consumed even when it is not valid
/// JSON, so the next frame starts cleanly.
pub fn read_message<R: BufRead>(reader: &mut R) -> Result<Option<JsonValue>> {
    let Some(len) = read_content_length(reader)? else {
        return Ok(None);
    };
    if len > MAX_MESSAGE_BYTES {
        bail!("Content-Length {len} exceeds max allowed {MAX_MESSAGE_BYTES} bytes");
    }
    let mut body = vec![0_u8; len];
    reader.read_exact(&mut body)?;
    let value = serde_json::from_slice(&body).context("invalid JSON payload")?;
    Ok(Some(value))
}

pub fn write_message<W: Write>(writer: &mut W, value: &JsonValue) -> Result<()> {
    let body = serde_json::to_vec(value)?;
    write!(writer, "Content-Length: {}\r\n\r\n", body.len())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}
