//! WebSocket frame-stream transport: one frame per logical message, no
//! trailing newlines, binary payloads tagged at the transport.

use super::{MessageReader, MessageWriter, TransportError, WriteMode};

use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

fn ws_error(err: tokio_tungstenite::tungstenite::Error) -> TransportError {
    match err {
        tokio_tungstenite::tungstenite::Error::ConnectionClosed
        | tokio_tungstenite::tungstenite::Error::AlreadyClosed => TransportError::Closed,
        other => TransportError::Io(io::Error::new(io::ErrorKind::Other, other)),
    }
}

/// Splits an accepted WebSocket stream into the broker's reader/writer pair.
pub fn split<S>(ws: WebSocketStream<S>) -> (FrameReader<S>, FrameWriter<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (sink, stream) = ws.split();
    (
        FrameReader {
            inner: stream,
            limit: 0,
        },
        FrameWriter { inner: sink },
    )
}

pub struct FrameReader<S> {
    inner: SplitStream<WebSocketStream<S>>,
    limit: usize,
}

impl<S: AsyncRead + AsyncWrite + Unpin> FrameReader<S> {
    // Control frames are handled by the underlying stream; data frames are
    // the broker's messages.
    async fn next_data_frame(&mut self) -> Result<Vec<u8>, TransportError> {
        loop {
            match self.inner.next().await {
                None => return Err(TransportError::Closed),
                Some(Err(err)) => return Err(ws_error(err)),
                Some(Ok(Message::Text(text))) => return Ok(text.into_bytes()),
                Some(Ok(Message::Binary(data))) => return Ok(data),
                Some(Ok(Message::Close(_))) => return Err(TransportError::Closed),
                Some(Ok(_)) => continue,
            }
        }
    }
}

#[async_trait(?Send)]
impl<S: AsyncRead + AsyncWrite + Unpin> MessageReader for FrameReader<S> {
    async fn read_message(&mut self) -> Result<String, TransportError> {
        let data = self.next_data_frame().await?;
        if self.limit != 0 && data.len() > self.limit {
            return Err(TransportError::MessageTooLong);
        }
        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    async fn read_binary(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        let data = self.next_data_frame().await?;
        // a short frame leaves the tail of the caller's buffer zeroed; excess
        // bytes are dropped
        let take = buf.len().min(data.len());
        buf[..take].copy_from_slice(&data[..take]);
        Ok(())
    }

    fn set_max_message_size(&mut self, limit: usize) {
        self.limit = limit;
    }
}

pub struct FrameWriter<S> {
    inner: SplitSink<WebSocketStream<S>, Message>,
}

#[async_trait(?Send)]
impl<S: AsyncRead + AsyncWrite + Unpin> MessageWriter for FrameWriter<S> {
    async fn write(&mut self, data: Bytes, mode: WriteMode) -> Result<(), TransportError> {
        let message = match mode {
            WriteMode::Text => Message::Text(String::from_utf8_lossy(&data).into_owned()),
            WriteMode::Binary => Message::Binary(data.to_vec()),
        };
        self.inner.send(message).await.map_err(ws_error)
    }

    async fn shutdown(&mut self) {
        let _ = self.inner.close().await;
    }
}
