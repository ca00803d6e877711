//! Socket framing: newline-delimited JSON or 4-byte big-endian length prefix.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::config::Framing;

const READ_CHUNK: usize = 8 * 1024;
const LEN_PREFIX: usize = 4;

/// One unit read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    Frame(Vec<u8>),
    /// A frame over the size limit. Its bytes were skipped, the stream stays in sync.
    Oversized(usize),
}

/// Incremental frame reader over any byte stream.
///
/// Buffers at most one frame (bounded by `max_frame`) plus one read chunk.
pub struct FrameReader<R> {
    inner: R,
    framing: Framing,
    max_frame: usize,
    buf: Vec<u8>,
    /// Bytes of an oversized frame seen so far, while skipping it.
    skipping: Option<usize>,
    /// Length-prefixed mode: body bytes still to discard.
    skip_remaining: usize,
    eof: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, framing: Framing, max_frame: usize) -> Self {
        Self {
            inner,
            framing,
            max_frame,
            buf: Vec::with_capacity(READ_CHUNK),
            skipping: None,
            skip_remaining: 0,
            eof: false,
        }
    }

    /// Next frame, or `None` on a clean end of stream.
    ///
    /// A length-prefixed stream that ends mid-frame is an `UnexpectedEof` error.
    pub async fn next(&mut self) -> io::Result<Option<FrameEvent>> {
        loop {
            let event = match self.framing {
                Framing::Newline => self.take_line(),
                Framing::LengthPrefixed => self.take_prefixed(),
            };
            if event.is_some() {
                return Ok(event);
            }
            if self.eof {
                return self.finish();
            }
            self.fill().await?;
        }
    }

    /// Bytes buffered but not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    async fn fill(&mut self) -> io::Result<()> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.inner.read(&mut chunk).await?;
        if n == 0 {
            self.eof = true;
        } else {
            self.buf.extend_from_slice(&chunk[..n]);
        }
        Ok(())
    }

    fn take_line(&mut self) -> Option<FrameEvent> {
        loop {
            match self.buf.iter().position(|b| *b == b'\n') {
                Some(pos) => {
                    let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
                    line.pop();
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    let seen = self.skipping.take();
                    if seen.is_some() || line.len() > self.max_frame {
                        return Some(FrameEvent::Oversized(seen.unwrap_or(0) + line.len()));
                    }
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    return Some(FrameEvent::Frame(line));
                }
                None => {
                    if self.buf.len() > self.max_frame || self.skipping.is_some() {
                        *self.skipping.get_or_insert(0) += self.buf.len();
                        self.buf.clear();
                    }
                    return None;
                }
            }
        }
    }

    fn take_prefixed(&mut self) -> Option<FrameEvent> {
        if self.skip_remaining > 0 {
            let n = self.skip_remaining.min(self.buf.len());
            self.buf.drain(..n);
            self.skip_remaining -= n;
            if self.skip_remaining > 0 {
                return None;
            }
            let size = self.skipping.take().unwrap_or_default();
            return Some(FrameEvent::Oversized(size));
        }

        let header: [u8; LEN_PREFIX] = self.buf.get(..LEN_PREFIX)?.try_into().ok()?;
        let len = u32::from_be_bytes(header) as usize;
        if len > self.max_frame {
            self.buf.drain(..LEN_PREFIX);
            self.skipping = Some(len);
            self.skip_remaining = len;
            return self.take_prefixed();
        }
        if self.buf.len() < LEN_PREFIX + len {
            return None;
        }
        let frame = self.buf[LEN_PREFIX..LEN_PREFIX + len].to_vec();
        self.buf.drain(..LEN_PREFIX + len);
        Some(FrameEvent::Frame(frame))
    }

    fn finish(&mut self) -> io::Result<Option<FrameEvent>> {
        match self.framing {
            Framing::Newline => {
                if let Some(seen) = self.skipping.take() {
                    self.buf.clear();
                    return Ok(Some(FrameEvent::Oversized(seen)));
                }
                let rest = std::mem::take(&mut self.buf);
                if rest.iter().all(u8::is_ascii_whitespace) {
                    return Ok(None);
                }
                Ok(Some(FrameEvent::Frame(rest)))
            }
            Framing::LengthPrefixed => {
                if self.buf.is_empty() && self.skip_remaining == 0 {
                    return Ok(None);
                }
                Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("stream ended inside a frame ({} bytes buffered)", self.buf.len()),
                ))
            }
        }
    }
}

/// Length-prefix a frame body.
pub fn encode_prefixed(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(LEN_PREFIX + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(body);
    out
}
