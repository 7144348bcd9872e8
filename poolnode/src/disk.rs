use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt, TryStreamExt};
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;

use crate::error::DiskError;
use crate::pool::{ClientStream, DiskReadFrame, DiskWriteFrame, PoolConnector, ServerStream};

/// Handle to a remote storage volume opened through the pool.
///
/// Every operation is proxied over the shared connector. Once closed, the
/// handle refuses further work locally and never calls the pool again.
pub struct Disk {
    id: String,
    url: String,
    client: Arc<dyn PoolConnector>,
    closed: AtomicBool,
}

impl fmt::Debug for Disk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disk")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Disk {
    pub fn new(
        id: impl Into<String>,
        url: impl Into<String>,
        client: Arc<dyn PoolConnector>,
    ) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            client,
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), DiskError> {
        if self.is_closed() {
            return Err(DiskError::Closed {
                disk_id: self.id.clone(),
            });
        }
        Ok(())
    }

    /// Lists file paths under `prefix`.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>, DiskError> {
        self.ensure_open()?;
        Ok(self.client.disk_list_files(&self.id, prefix).await?)
    }

    /// Deletes `path`; returns whether the pool removed anything.
    pub async fn delete(&self, path: &str) -> Result<bool, DiskError> {
        self.ensure_open()?;
        Ok(self.client.disk_delete_file(&self.id, path).await?)
    }

    /// Opens `path` for streaming reads.
    pub async fn open_read_stream(&self, path: &str) -> Result<DiskReadStream, DiskError> {
        self.ensure_open()?;
        let frames = self.client.disk_read_file(&self.id, path).await?;
        Ok(DiskReadStream::new(path, frames))
    }

    /// Opens `path` for streaming writes in frames of exactly `chunk_size`
    /// bytes (the last frame may be shorter).
    pub async fn open_write_stream(
        &self,
        path: &str,
        chunk_size: usize,
    ) -> Result<DiskWriter, DiskError> {
        self.ensure_open()?;
        if chunk_size == 0 {
            return Err(DiskError::InvalidChunkSize);
        }
        let call = self
            .client
            .disk_write_file(&self.id, path, chunk_size)
            .await?;
        Ok(DiskWriter::new(&self.id, path, chunk_size, call))
    }

    /// Releases the remote session. Only the first call reaches the pool.
    pub async fn close(&self) -> Result<(), DiskError> {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }
        self.client.close_disk(&self.id).await?;
        Ok(())
    }
}

/// Byte stream of one remote file.
///
/// Frames are pulled from the pool only as the consumer polls. A frame
/// reporting a missing file yields [`DiskError::NotFound`] and ends the
/// stream, as does a transport error.
pub struct DiskReadStream {
    path: String,
    frames: ServerStream<DiskReadFrame>,
    done: bool,
}

impl fmt::Debug for DiskReadStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskReadStream")
            .field("path", &self.path)
            .field("done", &self.done)
            .finish()
    }
}

impl DiskReadStream {
    pub fn new(path: impl Into<String>, frames: ServerStream<DiskReadFrame>) -> Self {
        Self {
            path: path.into(),
            frames,
            done: false,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Adapts the stream to [`tokio::io::AsyncRead`].
    pub fn into_async_read(self) -> impl AsyncRead + Send + Unpin {
        StreamReader::new(self.map_err(io::Error::other))
    }

    /// Reads the whole file into memory.
    pub async fn read_to_end(mut self) -> Result<Bytes, DiskError> {
        let mut content = BytesMut::new();
        while let Some(chunk) = self.next().await {
            content.extend_from_slice(&chunk?);
        }
        Ok(content.freeze())
    }
}

impl Stream for DiskReadStream {
    type Item = Result<Bytes, DiskError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.frames.poll_next_unpin(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Ready(Some(Ok(frame))) if !frame.exists => {
                self.done = true;
                Poll::Ready(Some(Err(DiskError::NotFound {
                    path: self.path.clone(),
                })))
            }
            Poll::Ready(Some(Ok(frame))) => Poll::Ready(Some(Ok(frame.data))),
            Poll::Ready(Some(Err(err))) => {
                self.done = true;
                Poll::Ready(Some(Err(err.into())))
            }
        }
    }
}

/// Buffered writer for one remote file.
///
/// Bytes are sent as `chunk_size` frames as soon as enough has accumulated;
/// [`finish`](Self::finish) must be called to flush the tail and learn
/// whether the pool stored the file.
pub struct DiskWriter {
    disk_id: String,
    path: String,
    chunk_size: usize,
    buffer: BytesMut,
    call: ClientStream<DiskWriteFrame, bool>,
}

impl fmt::Debug for DiskWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskWriter")
            .field("disk_id", &self.disk_id)
            .field("path", &self.path)
            .field("chunk_size", &self.chunk_size)
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

impl DiskWriter {
    pub fn new(
        disk_id: impl Into<String>,
        path: impl Into<String>,
        chunk_size: usize,
        call: ClientStream<DiskWriteFrame, bool>,
    ) -> Self {
        Self {
            disk_id: disk_id.into(),
            path: path.into(),
            chunk_size,
            buffer: BytesMut::with_capacity(chunk_size),
            call,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub async fn write(&mut self, data: impl AsRef<[u8]>) -> Result<(), DiskError> {
        self.buffer.extend_from_slice(data.as_ref());
        while self.buffer.len() >= self.chunk_size {
            let chunk = self.buffer.split_to(self.chunk_size).freeze();
            self.send(chunk).await?;
        }
        Ok(())
    }

    /// Flushes the remainder as one final frame and closes the call.
    pub async fn finish(mut self) -> Result<bool, DiskError> {
        if !self.buffer.is_empty() {
            let tail = self.buffer.split().freeze();
            self.send(tail).await?;
        }
        Ok(self.call.finish().await?)
    }

    async fn send(&mut self, data: Bytes) -> Result<(), DiskError> {
        let frame = DiskWriteFrame {
            disk_id: self.disk_id.clone(),
            path: self.path.clone(),
            data,
        };
        self.call.send(frame).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{RpcCode, RpcError};
    use futures::FutureExt;
    use tokio::io::AsyncReadExt;
    use tokio::sync::mpsc;

    fn frames(items: Vec<Result<DiskReadFrame, RpcError>>) -> ServerStream<DiskReadFrame> {
        futures::stream::iter(items).boxed()
    }

    fn data(bytes: &'static [u8]) -> Result<DiskReadFrame, RpcError> {
        Ok(DiskReadFrame {
            exists: true,
            data: Bytes::from_static(bytes),
        })
    }

    #[tokio::test]
    async fn test_read_stream_concatenates_frames() {
        let stream = DiskReadStream::new("a.txt", frames(vec![data(b"ab"), data(b"cd"), data(b"e")]));
        assert_eq!(stream.read_to_end().await.unwrap(), Bytes::from_static(b"abcde"));
    }

    #[tokio::test]
    async fn test_missing_file_frame_ends_stream() {
        let missing = Ok(DiskReadFrame {
            exists: false,
            data: Bytes::new(),
        });
        let mut stream = DiskReadStream::new("gone.txt", frames(vec![missing, data(b"late")]));

        match stream.next().await {
            Some(Err(DiskError::NotFound { path })) => assert_eq!(path, "gone.txt"),
            other => panic!("expected not found, got {other:?}"),
        }
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_transport_error_surfaces_once() {
        let failure = Err(RpcError::new(RpcCode::Unavailable, "reset"));
        let mut stream = DiskReadStream::new("a.txt", frames(vec![data(b"ab"), failure]));

        assert_eq!(stream.next().await.unwrap().unwrap(), Bytes::from_static(b"ab"));
        assert!(matches!(stream.next().await, Some(Err(DiskError::Rpc(_)))));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_async_read_adapter() {
        let stream = DiskReadStream::new("a.txt", frames(vec![data(b"hello "), data(b"world")]));
        let mut reader = stream.into_async_read();
        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn test_writer_sends_exact_chunks() {
        let (tx, mut rx) = mpsc::channel::<DiskWriteFrame>(8);
        let collector = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(frame) = rx.recv().await {
                seen.push(frame.data);
            }
            seen
        });
        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();
        let response = async move {
            let _ = done_rx.await;
            Ok(true)
        }
        .boxed();

        let mut writer = DiskWriter::new("disk-1", "out.txt", 4, ClientStream::new(tx, response));
        writer.write("ab").await.unwrap();
        assert_eq!(writer.buffered(), 2);
        writer.write("cde").await.unwrap();
        assert_eq!(writer.buffered(), 1);

        done_tx.send(()).unwrap();
        assert!(writer.finish().await.unwrap());

        let seen = collector.await.unwrap();
        assert_eq!(seen, vec![Bytes::from_static(b"abcd"), Bytes::from_static(b"e")]);
    }
}
