//! Newline framing for the chat protocol.

use bytes::{Bytes, BytesMut};
use memchr::memchr;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Initial read buffer capacity
const BUFFER_SIZE: usize = 4 * 1024;

/// Framing errors
#[derive(Debug)]
pub enum FrameError {
    /// The underlying read failed
    Io(std::io::Error),
    /// More than `limit` bytes arrived without a `\n`
    LineTooLong { limit: usize },
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Io(e) => write!(f, "{}", e),
            FrameError::LineTooLong { limit } => {
                write!(f, "line exceeds {} bytes without a newline", limit)
            }
        }
    }
}

impl std::error::Error for FrameError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FrameError::Io(e) => Some(e),
            FrameError::LineTooLong { .. } => None,
        }
    }
}

impl From<std::io::Error> for FrameError {
    fn from(e: std::io::Error) -> Self {
        FrameError::Io(e)
    }
}

/// Splits a byte stream into `\n`-terminated lines.
///
/// The in-flight buffer is bounded by `max_line_bytes`: a peer that keeps
/// sending without a delimiter gets `FrameError::LineTooLong` instead of
/// growing the buffer indefinitely.
#[derive(Debug)]
pub struct LineFramer<R> {
    inner: R,
    buf: BytesMut,
    max_line_bytes: usize,
}

impl<R> LineFramer<R> {
    pub fn new(inner: R, max_line_bytes: usize) -> Self {
        let max_line_bytes = max_line_bytes.max(1);
        Self {
            inner,
            buf: BytesMut::with_capacity(BUFFER_SIZE.min(max_line_bytes + 1)),
            max_line_bytes,
        }
    }

    /// Bytes received but not yet returned as a line.
    #[cfg(test)]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

impl<R: AsyncRead + Unpin> LineFramer<R> {
    /// Read the next line, including its `\n` and any other trailing
    /// whitespace. Trimming is left to the caller.
    ///
    /// Returns `Ok(None)` at end of stream. Bytes left over from an
    /// unterminated final line are discarded.
    pub async fn next_line(&mut self) -> Result<Option<Bytes>, FrameError> {
        let mut scanned = 0;

        loop {
            if let Some(i) = memchr(b'\n', &self.buf[scanned..]) {
                let line = self.buf.split_to(scanned + i + 1).freeze();
                return Ok(Some(line));
            }
            scanned = self.buf.len();

            if self.buf.len() > self.max_line_bytes {
                return Err(FrameError::LineTooLong {
                    limit: self.max_line_bytes,
                });
            }

            // Never read past the bound, so an oversized line is caught
            // after at most one extra byte.
            let room = self.max_line_bytes + 1 - self.buf.len();
            self.buf.reserve(room.min(BUFFER_SIZE));
            let n = (&mut self.inner)
                .take(room as u64)
                .read_buf(&mut self.buf)
                .await?;
            if n == 0 {
                if !self.buf.is_empty() {
                    tracing::trace!(bytes = self.buf.len(), "Discarding unterminated line at EOF");
                    self.buf.clear();
                }
                return Ok(None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_lines_keep_trailing_whitespace() {
        let mock = Builder::new().read(b"hello\r\nworld  \n").build();
        let mut framer = LineFramer::new(mock, 1024);

        let l1 = framer.next_line().await.unwrap().unwrap();
        let l2 = framer.next_line().await.unwrap().unwrap();
        assert_eq!(&l1[..], b"hello\r\n");
        assert_eq!(&l2[..], b"world  \n");
        assert!(framer.next_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_line_split_across_reads() {
        let mock = Builder::new()
            .read(b"/ec")
            .read(b"ho hi")
            .read(b"\nnext\n")
            .build();
        let mut framer = LineFramer::new(mock, 1024);

        assert_eq!(&framer.next_line().await.unwrap().unwrap()[..], b"/echo hi\n");
        assert_eq!(&framer.next_line().await.unwrap().unwrap()[..], b"next\n");
        assert_eq!(framer.buffered(), 0);
    }

    #[tokio::test]
    async fn test_empty_line() {
        let mock = Builder::new().read(b"\n").build();
        let mut framer = LineFramer::new(mock, 16);

        assert_eq!(&framer.next_line().await.unwrap().unwrap()[..], b"\n");
    }

    #[tokio::test]
    async fn test_unterminated_tail_is_dropped_at_eof() {
        let mock = Builder::new().read(b"partial").build();
        let mut framer = LineFramer::new(mock, 1024);

        assert!(framer.next_line().await.unwrap().is_none());
        assert_eq!(framer.buffered(), 0);
    }

    #[tokio::test]
    async fn test_line_at_limit_is_accepted() {
        let mut input = vec![b'a'; 16];
        input.push(b'\n');
        let mock = Builder::new().read(&input).build();
        let mut framer = LineFramer::new(mock, 16);

        let line = framer.next_line().await.unwrap().unwrap();
        assert_eq!(line.len(), 17);
    }

    #[tokio::test]
    async fn test_oversized_line_is_rejected() {
        let mock = Builder::new().read(&[b'x'; 17]).build();
        let mut framer = LineFramer::new(mock, 16);

        match framer.next_line().await {
            Err(FrameError::LineTooLong { limit }) => assert_eq!(limit, 16),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_error_is_surfaced() {
        let mock = Builder::new()
            .read_error(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "reset",
            ))
            .build();
        let mut framer = LineFramer::new(mock, 16);

        match framer.next_line().await {
            Err(FrameError::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::ConnectionReset),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
