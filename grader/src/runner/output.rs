//! Byte ceilings on captured process output.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Convert a limit in kilobytes to bytes. Zero or negative means unbounded.
pub fn limit_bytes(limit_kb: i64) -> Option<usize> {
    if limit_kb <= 0 {
        None
    } else {
        Some((limit_kb as usize).saturating_mul(1024))
    }
}

/// Text captured from one stream, cut at a byte limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundedOutput {
    pub text: String,
    /// More data was produced than the limit allowed.
    pub truncated: bool,
    pub limit: Option<usize>,
}

impl BoundedOutput {
    /// The text, followed by a marker line if it was truncated.
    pub fn with_marker(&self) -> String {
        match (self.truncated, self.limit) {
            (true, Some(limit)) => append_marker(&self.text, limit),
            _ => self.text.clone(),
        }
    }
}

pub fn append_marker(text: &str, limit: usize) -> String {
    let mut s = String::with_capacity(text.len() + 48);
    s.push_str(text);
    if !s.is_empty() && !s.ends_with('\n') {
        s.push('\n');
    }
    s.push_str(&format!("--- output truncated at {} bytes ---\n", limit));
    s
}

/// An output buffer that keeps at most `limit` bytes and remembers whether
/// anything was dropped.
#[derive(Debug)]
pub struct BoundedBuffer {
    limit: Option<usize>,
    bytes: BytesMut,
    truncated: bool,
}

impl BoundedBuffer {
    pub fn new(limit_kb: i64) -> Self {
        BoundedBuffer {
            limit: limit_bytes(limit_kb),
            bytes: BytesMut::new(),
            truncated: false,
        }
    }

    /// Append a chunk, dropping whatever does not fit.
    pub fn append(&mut self, chunk: &[u8]) {
        let limit = match self.limit {
            Some(limit) => limit,
            None => {
                self.bytes.extend_from_slice(chunk);
                return;
            }
        };

        let room = limit - self.bytes.len();
        if chunk.len() > room {
            self.bytes.extend_from_slice(&chunk[..room]);
            self.truncated = true;
        } else {
            self.bytes.extend_from_slice(chunk);
        }
    }

    /// No more data will be kept.
    pub fn is_full(&self) -> bool {
        match self.limit {
            Some(limit) => self.bytes.len() >= limit,
            None => false,
        }
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Read `reader` into the buffer until it ends or the buffer overflows.
    /// Returns `true` if the reader still had data left.
    pub async fn read_from<R>(&mut self, reader: &mut R) -> std::io::Result<bool>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut chunk = [0u8; 8192];
        loop {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                return Ok(false);
            }
            self.append(&chunk[..n]);
            if self.truncated {
                return Ok(true);
            }
        }
    }

    pub fn finish(self) -> BoundedOutput {
        let BoundedBuffer {
            limit,
            bytes,
            truncated,
        } = self;
        let text = if truncated {
            // the cut may land inside a multi-byte character
            match std::str::from_utf8(&bytes) {
                Ok(s) => s.to_owned(),
                Err(e) if e.error_len().is_none() => {
                    String::from_utf8_lossy(&bytes[..e.valid_up_to()]).into_owned()
                }
                Err(_) => String::from_utf8_lossy(&bytes).into_owned(),
            }
        } else {
            String::from_utf8_lossy(&bytes).into_owned()
        };
        BoundedOutput {
            text,
            truncated,
            limit,
        }
    }
}

/// Read at most `limit_kb` kilobytes from `reader`. Once the limit is
/// exceeded reading stops and the rest of the stream is left unread.
pub async fn bound<R>(reader: &mut R, limit_kb: i64) -> std::io::Result<BoundedOutput>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = BoundedBuffer::new(limit_kb);
    buf.read_from(reader).await?;
    Ok(buf.finish())
}
