use futures_util::Stream;
use serde_json::Value;

use crate::abort::{is_aborted, AbortSignal};
use crate::error::DifyError;
use crate::event::decode_event;
use crate::projector::StreamProjector;
use crate::sse::SseFrameReader;
use crate::transport::BoxChunkSource;
use crate::types::StreamPart;

enum ChunkRead {
    Chunk(Vec<u8>),
    Eof,
    Aborted,
    Failed(DifyError),
}

/// Pull-based sequence of [`StreamPart`]s for one streaming call.
///
/// Nothing is read from the network until [`ChatStream::next`] is awaited,
/// and every buffered frame is handed out before the next chunk is read. The
/// sequence ends after its terminal part, after an abort, or when dropped; it
/// cannot be restarted.
pub struct ChatStream {
    source: Option<BoxChunkSource>,
    frames: SseFrameReader,
    projector: StreamProjector,
    signal: Option<AbortSignal>,
    request_body: Value,
    done: bool,
}

impl ChatStream {
    pub(crate) fn new(
        source: BoxChunkSource,
        projector: StreamProjector,
        signal: Option<AbortSignal>,
        request_body: Value,
    ) -> Self {
        Self {
            source: Some(source),
            frames: SseFrameReader::new(),
            projector,
            signal,
            request_body,
            done: false,
        }
    }

    /// The JSON body that was posted to `chat-messages`.
    pub fn request_body(&self) -> &Value {
        &self.request_body
    }

    pub async fn next(&mut self) -> Option<StreamPart> {
        loop {
            if self.done {
                return None;
            }
            if is_aborted(self.signal.as_ref()) {
                self.close();
                return None;
            }

            if let Some(frame) = self.frames.next_frame() {
                let part = self.projector.project(decode_event(&frame));
                if self.projector.is_finished() {
                    self.close();
                }
                match part {
                    Some(part) => return Some(part),
                    None => continue,
                }
            }

            let signal = self.signal.clone();
            let read = match self.source.as_mut() {
                Some(source) => read_chunk(source, signal.as_ref()).await,
                None => {
                    self.close();
                    return self.projector.end_of_stream();
                }
            };

            match read {
                ChunkRead::Chunk(bytes) => self.frames.push_chunk(&bytes),
                ChunkRead::Eof => {
                    self.frames.finish();
                    self.source = None;
                }
                ChunkRead::Aborted => {
                    tracing::debug!("Dify stream aborted by caller");
                    self.close();
                    return None;
                }
                ChunkRead::Failed(error) => {
                    tracing::warn!(error = %error, "Dify stream interrupted");
                    self.close();
                    return Some(StreamPart::Error { error });
                }
            }
        }
    }

    /// Drains the sequence, collecting every part.
    pub async fn collect_parts(mut self) -> Vec<StreamPart> {
        let mut parts = Vec::new();
        while let Some(part) = self.next().await {
            parts.push(part);
        }
        parts
    }

    pub fn into_stream(self) -> impl Stream<Item = StreamPart> + Send {
        futures_util::stream::unfold(self, |mut stream| async move {
            let part = stream.next().await?;
            Some((part, stream))
        })
    }

    fn close(&mut self) {
        // Dropping the body cancels the underlying HTTP request.
        self.source = None;
        self.done = true;
    }
}

async fn read_chunk(source: &mut BoxChunkSource, signal: Option<&AbortSignal>) -> ChunkRead {
    let next = async {
        match source.next_chunk().await {
            Ok(Some(bytes)) => ChunkRead::Chunk(bytes),
            Ok(None) => ChunkRead::Eof,
            Err(error) => ChunkRead::Failed(error),
        }
    };
    match signal {
        Some(signal) => tokio::select! {
            _ = signal.cancelled() => ChunkRead::Aborted,
            read = next => read,
        },
        None => next.await,
    }
}
