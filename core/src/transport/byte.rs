//! Newline-framed byte-stream transport (plain TCP and friends).

use super::{MessageReader, MessageWriter, TransportError, WriteMode};

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const READ_CHUNK: usize = 4096;

/// Reads `\n`-terminated messages from any byte stream, keeping a read-ahead
/// buffer. Binary reads consume leftover buffered bytes before touching the
/// socket again, so a payload that immediately follows its command line on
/// the wire is never lost.
pub struct ByteReader<R> {
    inner: R,
    buf: BytesMut,
    limit: usize,
}

impl<R: AsyncRead + Unpin> ByteReader<R> {
    pub fn new(inner: R) -> Self {
        ByteReader {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK),
            limit: 0,
        }
    }
}

#[async_trait(?Send)]
impl<R: AsyncRead + Unpin> MessageReader for ByteReader<R> {
    async fn read_message(&mut self) -> Result<String, TransportError> {
        loop {
            if let Some(pos) = memchr::memchr(b'\n', &self.buf) {
                if self.limit != 0 && pos + 1 > self.limit {
                    return Err(TransportError::MessageTooLong);
                }
                let line = self.buf.split_to(pos + 1);
                let mut line = &line[..pos];
                if line.last() == Some(&b'\r') {
                    line = &line[..line.len() - 1];
                }
                return Ok(String::from_utf8_lossy(line).into_owned());
            }
            if self.limit != 0 && self.buf.len() >= self.limit {
                return Err(TransportError::MessageTooLong);
            }
            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(TransportError::Closed);
            }
        }
    }

    async fn read_binary(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        // leftover read-ahead bytes first
        let take = buf.len().min(self.buf.len());
        buf[..take].copy_from_slice(&self.buf[..take]);
        self.buf.advance(take);
        if take < buf.len() {
            self.inner.read_exact(&mut buf[take..]).await?;
        } else {
            // a fully buffered request still completes through the executor,
            // never on the caller's own poll
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    fn set_max_message_size(&mut self, limit: usize) {
        self.limit = limit;
    }
}

/// Writes raw bytes; the text/binary tag is meaningless on a byte stream.
pub struct ByteWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> ByteWriter<W> {
    pub fn new(inner: W) -> Self {
        ByteWriter { inner }
    }
}

#[async_trait(?Send)]
impl<W: AsyncWrite + Unpin> MessageWriter for ByteWriter<W> {
    async fn write(&mut self, data: Bytes, _mode: WriteMode) -> Result<(), TransportError> {
        self.inner.write_all(&data).await?;
        Ok(())
    }

    async fn shutdown(&mut self) {
        let _ = self.inner.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run<F: std::future::Future>(fut: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(fut)
    }

    #[test]
    fn byte_reader_splits_lines() {
        run(async {
            let mut reader = ByteReader::new(&b"first\nsecond\r\n"[..]);
            assert_eq!(reader.read_message().await.unwrap(), "first");
            assert_eq!(reader.read_message().await.unwrap(), "second");
            assert!(matches!(
                reader.read_message().await,
                Err(TransportError::Closed)
            ));
        });
    }

    #[test]
    fn byte_reader_enforces_message_limit() {
        run(async {
            let mut reader = ByteReader::new(&b"0123456789ABCDEF\n"[..]);
            reader.set_max_message_size(8);
            assert!(matches!(
                reader.read_message().await,
                Err(TransportError::MessageTooLong)
            ));
        });
    }

    #[test]
    fn byte_reader_limit_counts_terminator() {
        run(async {
            let mut reader = ByteReader::new(&b"12345678\n12345678\n"[..]);
            reader.set_max_message_size(9);
            assert_eq!(reader.read_message().await.unwrap(), "12345678");
            // lifting the limit lets anything through
            reader.set_max_message_size(0);
            assert_eq!(reader.read_message().await.unwrap(), "12345678");
        });
    }

    #[test]
    fn byte_reader_binary_consumes_leftovers() {
        run(async {
            let mut reader = ByteReader::new(&b"tb 4 EVT\nABCDrest\n"[..]);
            assert_eq!(reader.read_message().await.unwrap(), "tb 4 EVT");
            let mut payload = [0u8; 4];
            reader.read_binary(&mut payload).await.unwrap();
            assert_eq!(&payload, b"ABCD");
            assert_eq!(reader.read_message().await.unwrap(), "rest");
        });
    }
}
