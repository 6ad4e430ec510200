//! Streaming generation handle.
//!
//! Fragments are pushed by the correlator into an unbounded channel as they
//! arrive; the final text comes from the request's completion. Fragments
//! are always yielded before the completion they precede.

use futures::future::BoxFuture;
use futures::Stream;
use tokio::sync::mpsc;

use crate::error::{Result, SessionError};

use super::envelope::RequestId;

/// One item of a streamed generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationEvent {
    /// Newly generated text.
    Fragment(String),
    /// Final text, equal to the concatenation of all fragments.
    Complete(String),
}

/// Handle for receiving a streamed generation.
pub struct GenerationStream {
    request_id: RequestId,
    fragments: mpsc::UnboundedReceiver<String>,
    completion: Option<BoxFuture<'static, Result<String>>>,
}

impl GenerationStream {
    pub(crate) fn new(
        request_id: RequestId,
        fragments: mpsc::UnboundedReceiver<String>,
        completion: BoxFuture<'static, Result<String>>,
    ) -> Self {
        Self {
            request_id,
            fragments,
            completion: Some(completion),
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Next event; `None` once the completion (or its error) was yielded.
    pub async fn next(&mut self) -> Option<Result<GenerationEvent>> {
        let completion = self.completion.as_mut()?;
        let outcome = tokio::select! {
            biased;
            Some(fragment) = self.fragments.recv() => {
                return Some(Ok(GenerationEvent::Fragment(fragment)));
            }
            outcome = completion => outcome,
        };
        self.completion = None;
        Some(outcome.map(GenerationEvent::Complete))
    }

    /// Drain the stream and return the final text.
    pub async fn text(mut self) -> Result<String> {
        loop {
            match self.next().await {
                Some(Ok(GenerationEvent::Complete(text))) => return Ok(text),
                Some(Ok(GenerationEvent::Fragment(_))) => continue,
                Some(Err(e)) => return Err(e),
                None => return Err(SessionError::channel("stream already finished")),
            }
        }
    }

    /// Convert to an async Stream.
    pub fn into_stream(self) -> impl Stream<Item = Result<GenerationEvent>> {
        let mut handle = self;
        async_stream::stream! {
            while let Some(event) = handle.next().await {
                yield event;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use tokio::sync::oneshot;
    use tokio_stream::StreamExt;

    fn handle() -> (
        mpsc::UnboundedSender<String>,
        oneshot::Sender<Result<String>>,
        GenerationStream,
    ) {
        let (fragment_tx, fragment_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();
        let completion = async move { done_rx.await.unwrap_or(Err(SessionError::ServiceStopped)) }.boxed();
        (fragment_tx, done_tx, GenerationStream::new(RequestId(1), fragment_rx, completion))
    }

    #[tokio::test]
    async fn test_fragments_precede_completion() {
        let (fragments, done, mut stream) = handle();
        fragments.send("Hello".to_owned()).expect("test: send fragment");
        fragments.send(" World".to_owned()).expect("test: send fragment");
        done.send(Ok("Hello World".to_owned())).expect("test: complete");

        assert_eq!(stream.next().await, Some(Ok(GenerationEvent::Fragment("Hello".into()))));
        assert_eq!(stream.next().await, Some(Ok(GenerationEvent::Fragment(" World".into()))));
        assert_eq!(stream.next().await, Some(Ok(GenerationEvent::Complete("Hello World".into()))));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_error_ends_stream() {
        let (_fragments, done, stream) = handle();
        done.send(Err(SessionError::GenerationTimeout)).expect("test: complete");

        let events: Vec<_> = stream.into_stream().collect().await;
        assert_eq!(events, vec![Err(SessionError::GenerationTimeout)]);
    }

    #[tokio::test]
    async fn test_text_drains_fragments() {
        let (fragments, done, stream) = handle();
        fragments.send("a".to_owned()).expect("test: send fragment");
        drop(fragments);
        done.send(Ok("a".to_owned())).expect("test: complete");
        assert_eq!(stream.text().await, Ok("a".to_owned()));
    }
}
