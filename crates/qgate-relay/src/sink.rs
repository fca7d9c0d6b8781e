use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use tokio::sync::{mpsc, oneshot};

/// Response head: committed exactly once, and only after the upstream status
/// is known, so error statuses can still be forwarded.
#[derive(Debug)]
pub struct StreamHead {
    pub status: u16,
    pub headers: HeaderMap,
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("client disconnected")]
    Disconnected,
    #[error("response head already committed")]
    HeadCommitted,
}

/// Where the relay writes the client-facing response.
///
/// Exactly one of two shapes per request: `write_document` for a buffered
/// JSON body, or `begin_stream` followed by any number of `write_frame`
/// calls. A failed write means the client went away; the relay treats that
/// as cancellation.
#[async_trait]
pub trait ClientSink: Send {
    async fn write_document(
        &mut self,
        status: u16,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<(), SinkError>;

    async fn begin_stream(&mut self, head: StreamHead) -> Result<(), SinkError>;

    async fn write_frame(&mut self, frame: Bytes) -> Result<(), SinkError>;
}

/// Buffering sink used by tests and by callers that want the whole response
/// in memory.
#[derive(Debug, Default)]
pub struct BufferSink {
    pub head: Option<StreamHead>,
    pub body: Vec<u8>,
    pub frames: Vec<Bytes>,
    /// When set, writes fail after this many frames; simulates a client that
    /// disconnects mid-stream.
    pub disconnect_after: Option<usize>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[async_trait]
impl ClientSink for BufferSink {
    async fn write_document(
        &mut self,
        status: u16,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<(), SinkError> {
        if self.head.is_some() {
            return Err(SinkError::HeadCommitted);
        }
        self.head = Some(StreamHead { status, headers });
        self.body.extend_from_slice(&body);
        Ok(())
    }

    async fn begin_stream(&mut self, head: StreamHead) -> Result<(), SinkError> {
        if self.head.is_some() {
            return Err(SinkError::HeadCommitted);
        }
        self.head = Some(head);
        Ok(())
    }

    async fn write_frame(&mut self, frame: Bytes) -> Result<(), SinkError> {
        if let Some(limit) = self.disconnect_after {
            if self.frames.len() >= limit {
                return Err(SinkError::Disconnected);
            }
        }
        self.body.extend_from_slice(&frame);
        self.frames.push(frame);
        Ok(())
    }
}

/// Bridges the relay task to an HTTP response: the head goes over a oneshot
/// (the handler is waiting on it to build the response), frames flow through
/// an mpsc channel that backs the response body stream.
pub struct HttpSink {
    head: Option<oneshot::Sender<(StreamHead, Option<Bytes>)>>,
    frames: mpsc::Sender<Bytes>,
}

impl HttpSink {
    pub fn new() -> (
        Self,
        oneshot::Receiver<(StreamHead, Option<Bytes>)>,
        mpsc::Receiver<Bytes>,
    ) {
        let (head_tx, head_rx) = oneshot::channel();
        let (frame_tx, frame_rx) = mpsc::channel(64);
        (
            Self {
                head: Some(head_tx),
                frames: frame_tx,
            },
            head_rx,
            frame_rx,
        )
    }
}

#[async_trait]
impl ClientSink for HttpSink {
    async fn write_document(
        &mut self,
        status: u16,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<(), SinkError> {
        let head = self.head.take().ok_or(SinkError::HeadCommitted)?;
        head.send((StreamHead { status, headers }, Some(body)))
            .map_err(|_| SinkError::Disconnected)
    }

    async fn begin_stream(&mut self, head: StreamHead) -> Result<(), SinkError> {
        let sender = self.head.take().ok_or(SinkError::HeadCommitted)?;
        sender.send((head, None)).map_err(|_| SinkError::Disconnected)
    }

    async fn write_frame(&mut self, frame: Bytes) -> Result<(), SinkError> {
        self.frames
            .send(frame)
            .await
            .map_err(|_| SinkError::Disconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn buffer_sink_rejects_double_head() {
        let mut sink = BufferSink::new();
        sink.write_document(200, HeaderMap::new(), Bytes::from_static(b"{}"))
            .await
            .unwrap();
        let err = sink
            .write_document(200, HeaderMap::new(), Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::HeadCommitted));
    }

    #[tokio::test]
    async fn buffer_sink_simulates_disconnect() {
        let mut sink = BufferSink::new();
        sink.disconnect_after = Some(2);
        sink.begin_stream(StreamHead { status: 200, headers: HeaderMap::new() })
            .await
            .unwrap();
        sink.write_frame(Bytes::from_static(b"1")).await.unwrap();
        sink.write_frame(Bytes::from_static(b"2")).await.unwrap();
        let err = sink.write_frame(Bytes::from_static(b"3")).await.unwrap_err();
        assert!(matches!(err, SinkError::Disconnected));
    }

    #[tokio::test]
    async fn http_sink_hands_head_to_receiver() {
        let (mut sink, head_rx, mut frame_rx) = HttpSink::new();
        sink.begin_stream(StreamHead { status: 200, headers: HeaderMap::new() })
            .await
            .unwrap();
        sink.write_frame(Bytes::from_static(b"data: {}\n\n"))
            .await
            .unwrap();
        drop(sink);
        let (head, body) = head_rx.await.unwrap();
        assert_eq!(head.status, 200);
        assert!(body.is_none());
        assert_eq!(frame_rx.recv().await.unwrap(), Bytes::from_static(b"data: {}\n\n"));
        assert!(frame_rx.recv().await.is_none());
    }
}
