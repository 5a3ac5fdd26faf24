//! The per-connection write serializer.
//!
//! Each connection owns a FIFO queue of pending writes drained by a single
//! writer task, so at most one transport write is in flight and completions
//! observe items in enqueue order. Enqueueing is synchronous; a dispatch
//! pass's enqueues form one uninterruptible sequence. Payloads are `Bytes`,
//! retained by the queued item until the transport write completes. A failed
//! write aborts the chain.

use crate::transport::{MessageWriter, WriteMode};

use bytes::Bytes;
use tokio::sync::mpsc;

pub(crate) enum WriteItem {
    Data(Bytes, WriteMode),
    Block,
    Shutdown,
}

#[derive(Clone)]
pub(crate) struct WriteHandle {
    tx: mpsc::UnboundedSender<WriteItem>,
}

impl WriteHandle {
    pub(crate) fn enqueue(&self, data: Bytes, mode: WriteMode) {
        // a dead writer task means the connection is going away; nothing to do
        let _ = self.tx.send(WriteItem::Data(data, mode));
    }

    pub(crate) fn block_endpoint(&self) {
        let _ = self.tx.send(WriteItem::Block);
    }

    /// Flushes everything enqueued so far, then closes the write side.
    pub(crate) fn shutdown(&self) {
        let _ = self.tx.send(WriteItem::Shutdown);
    }

    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        let (tx, _) = mpsc::unbounded_channel();
        WriteHandle { tx }
    }
}

/// Spawns the writer task for one connection and returns its queue handle.
pub(crate) fn spawn(mut writer: Box<dyn MessageWriter>) -> WriteHandle {
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::task::spawn_local(async move {
        while let Some(item) = rx.recv().await {
            match item {
                WriteItem::Data(data, mode) => {
                    if let Err(err) = writer.write(data, mode).await {
                        log::debug!("write chain aborted: {}", err);
                        break;
                    }
                }
                WriteItem::Block => writer.block_endpoint(),
                WriteItem::Shutdown => break,
            }
        }
        writer.shutdown().await;
    });
    WriteHandle { tx }
}
