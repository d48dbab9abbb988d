//! CRLF line framing for the IRC socket.
//!
//! Unlike `LinesCodec`, a line that is too long or not valid UTF-8 does not
//! end the stream: oversized lines are skipped and bad bytes are replaced.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

/// Longest inbound line accepted, terminator excluded.
pub const MAX_LINE_BYTES: usize = 8 * 1024;

#[derive(Debug, Default)]
pub struct IrcLineCodec {
    /// Inside an oversized line; drop bytes until the next newline
    discarding: bool,
    /// How far the buffer has already been scanned for a newline
    next_index: usize,
}

impl IrcLineCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for IrcLineCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        loop {
            let start = self.next_index.min(buf.len());
            let newline = buf[start..]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| start + offset);

            match (self.discarding, newline) {
                (true, Some(end)) => {
                    let _ = buf.split_to(end + 1);
                    self.discarding = false;
                    self.next_index = 0;
                }
                (true, None) => {
                    buf.clear();
                    self.next_index = 0;
                    return Ok(None);
                }
                (false, Some(end)) => {
                    let line = buf.split_to(end + 1);
                    self.next_index = 0;
                    if end > MAX_LINE_BYTES {
                        warn!("dropping inbound line of {} bytes", end);
                        continue;
                    }
                    let text = String::from_utf8_lossy(&line[..end]);
                    return Ok(Some(text.trim_end_matches('\r').to_string()));
                }
                (false, None) => {
                    if buf.len() > MAX_LINE_BYTES {
                        warn!("dropping inbound line over {} bytes", MAX_LINE_BYTES);
                        buf.clear();
                        self.discarding = true;
                        self.next_index = 0;
                    } else {
                        self.next_index = buf.len();
                    }
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        if buf.is_empty() || self.discarding {
            buf.clear();
            return Ok(None);
        }
        let line = buf.split_to(buf.len());
        self.next_index = 0;
        let text = String::from_utf8_lossy(&line);
        Ok(Some(text.trim_end_matches('\r').to_string()))
    }
}

impl Encoder<String> for IrcLineCodec {
    type Error = std::io::Error;

    fn encode(&mut self, line: String, buf: &mut BytesMut) -> Result<(), Self::Error> {
        buf.reserve(line.len() + 2);
        buf.put_slice(line.as_bytes());
        buf.put_slice(b"\r\n");
        Ok(())
    }
}
