//! Stream controller: owns the single active stream
//!
//! [`StreamController::start`] opens the transport and spawns a reader task
//! that drives body chunks through the frame lexer and payload decoder into
//! the active [`StreamAssembler`]. Starting a new stream, or calling
//! [`StreamController::abort`], settles the previous one first.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use trickle_wire::{
    ByteStream, CompletionRequest, CompletionTransport, Delta, Frame, decode_payload,
    frame::frames,
};

use crate::assembler::{Finalized, FinishReason, LiveBuffer, StreamAssembler};
use crate::error::{Error, Result};
use crate::events::ChatEvent;
use crate::ledger::{ConversationId, ConversationLedger};
use crate::state::{StreamState, StreamStatus};

/// How a stream ended, as seen by its task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// The reply was committed
    Completed {
        conversation_id: ConversationId,
        message: trickle_wire::Message,
    },
    /// The stream was aborted or superseded; see [`ChatEvent::Aborted`]
    Aborted,
}

/// Handle to a running stream
#[derive(Debug)]
pub struct StreamTask {
    stream_id: u64,
    handle: JoinHandle<Result<StreamOutcome>>,
}

impl StreamTask {
    pub fn id(&self) -> u64 {
        self.stream_id
    }

    /// Wait for the reader task to settle
    pub async fn join(self) -> Result<StreamOutcome> {
        self.handle
            .await
            .map_err(|e| Error::Other(format!("stream task failed: {}", e)))?
    }
}

/// Drives at most one completion stream at a time.
///
/// Cloning is cheap and every clone controls the same active stream.
#[derive(Clone)]
pub struct StreamController {
    transport: Arc<dyn CompletionTransport>,
    ledger: Arc<dyn ConversationLedger>,
    live: LiveBuffer,
    events: broadcast::Sender<ChatEvent>,
    active: Arc<Mutex<Option<StreamState>>>,
    next_id: Arc<AtomicU64>,
}

impl StreamController {
    pub fn new(transport: Arc<dyn CompletionTransport>, ledger: Arc<dyn ConversationLedger>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            transport,
            ledger,
            live: LiveBuffer::new(),
            events,
            active: Arc::new(Mutex::new(None)),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    /// Watch the ongoing result
    pub fn live(&self) -> watch::Receiver<String> {
        self.live.subscribe()
    }

    /// Status of the active stream, `None` when idle
    pub fn status(&self) -> Option<StreamStatus> {
        self.active.lock().as_ref().map(|s| s.status)
    }

    pub fn ledger(&self) -> &Arc<dyn ConversationLedger> {
        &self.ledger
    }

    /// Start streaming a reply.
    ///
    /// Returns once the response status is known. A client error (4xx other
    /// than 429) is returned here and nothing streams. Everything after that
    /// is reported through the returned task.
    pub async fn start(
        &self,
        conversation_id: Option<ConversationId>,
        request: CompletionRequest,
    ) -> Result<StreamTask> {
        self.abort()?;

        let stream_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let conversation_id = conversation_id.filter(|id| !id.is_empty());
        let assembler = StreamAssembler::new(
            conversation_id.clone(),
            request.prompt(),
            Arc::clone(&self.ledger),
            self.live.clone(),
        );
        let mut state = StreamState::new(stream_id, assembler);
        state.set_status(StreamStatus::Opening);
        let cancel = state.cancel.clone();
        *self.active.lock() = Some(state);
        self.emit(ChatEvent::StreamStart {
            stream_id,
            conversation_id: conversation_id.clone(),
        });

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(trickle_wire::Error::Aborted.into()),
            opened = self.transport.open(conversation_id.as_ref().map(ConversationId::as_str), &request) => opened,
        };
        let response = match opened {
            Ok(response) => response,
            Err(e) => {
                self.fail(stream_id, &e);
                return Err(e.into());
            }
        };
        if cancel.is_cancelled() {
            return Err(trickle_wire::Error::Aborted.into());
        }

        let status = response.status;
        if trickle_wire::error::is_client_status(status) {
            let body = response.text().await.unwrap_or_default();
            let error = trickle_wire::Error::from_status(status, &body);
            self.fail(stream_id, &error);
            return Err(error.into());
        }
        if !response.is_success() {
            tracing::warn!(stream_id, status, "Completion endpoint returned an error status, reading body anyway");
        }

        self.transition(stream_id, StreamStatus::Streaming);
        let controller = self.clone();
        let handle = tokio::spawn(async move {
            controller.pump(stream_id, status, response.body, cancel).await
        });

        Ok(StreamTask { stream_id, handle })
    }

    /// Cancel the active stream and commit whatever text it produced.
    ///
    /// Returns `Ok(None)` when nothing was streaming.
    pub fn abort(&self) -> Result<Option<Finalized>> {
        let Some(mut state) = self.active.lock().take() else {
            return Ok(None);
        };
        state.cancel.cancel();
        state.set_status(StreamStatus::Aborted);

        let finalized = state.assembler.finalize(FinishReason::Aborted);
        let conversation_id = match &finalized {
            Ok(Some(Finalized::Committed { conversation_id, .. })) => Some(conversation_id.clone()),
            _ => None,
        };
        self.emit(ChatEvent::Aborted {
            stream_id: state.id,
            conversation_id,
        });
        finalized
    }

    async fn pump(
        self,
        stream_id: u64,
        status: u16,
        body: ByteStream,
        cancel: CancellationToken,
    ) -> Result<StreamOutcome> {
        let mut frames = Box::pin(frames(body));

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(StreamOutcome::Aborted),
                next = frames.next() => next,
            };

            let data = match next {
                None | Some(Ok(Frame::Done)) => break,
                Some(Ok(Frame::Data { data, .. })) => data,
                Some(Err(e)) => {
                    self.fail(stream_id, &e);
                    return Err(e.into());
                }
            };

            let mut done = false;
            let mut texts = Vec::new();
            for delta in decode_payload(&data) {
                match delta {
                    Delta::Text(text) => texts.push(text),
                    Delta::Done => {
                        done = true;
                        break;
                    }
                }
            }

            if !texts.is_empty() {
                let mut active = self.active.lock();
                match active.as_mut() {
                    // Emitted under the lock so no delta can follow this stream's Aborted event
                    Some(state) if state.id == stream_id => {
                        for text in texts {
                            state.assembler.append(&text);
                            self.emit(ChatEvent::Delta { stream_id, text });
                        }
                    }
                    // Superseded by abort or a newer stream
                    _ => return Ok(StreamOutcome::Aborted),
                }
            }

            if done {
                break;
            }
        }

        if !(200..300).contains(&status) {
            let error = trickle_wire::Error::Transport {
                status: Some(status),
                message: format!("completion endpoint responded with HTTP {}", status),
            };
            self.fail(stream_id, &error);
            return Err(error.into());
        }

        self.complete(stream_id)
    }

    fn complete(&self, stream_id: u64) -> Result<StreamOutcome> {
        let Some(mut state) = self.take_active(stream_id) else {
            return Ok(StreamOutcome::Aborted);
        };
        state.set_status(StreamStatus::Closing);

        match state.assembler.finalize(FinishReason::Completed) {
            Ok(Some(Finalized::Committed {
                conversation_id,
                message,
            })) => {
                state.set_status(StreamStatus::Completed);
                self.emit(ChatEvent::Committed {
                    stream_id,
                    conversation_id: conversation_id.clone(),
                    message: message.clone(),
                });
                Ok(StreamOutcome::Completed {
                    conversation_id,
                    message,
                })
            }
            Ok(_) => Ok(StreamOutcome::Aborted),
            Err(e) => {
                state.set_status(StreamStatus::Failed);
                tracing::warn!(stream_id, "Failed to commit reply: {}", e);
                self.emit(ChatEvent::Failed {
                    stream_id,
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn fail(&self, stream_id: u64, error: &impl std::fmt::Display) {
        let Some(mut state) = self.take_active(stream_id) else {
            return;
        };
        state.cancel.cancel();
        state.set_status(StreamStatus::Failed);
        if let Err(e) = state.assembler.finalize(FinishReason::Failed) {
            tracing::warn!(stream_id, "Failed to finalize stream: {}", e);
        }

        tracing::warn!(stream_id, "Stream failed: {}", error);
        self.emit(ChatEvent::Failed {
            stream_id,
            message: error.to_string(),
        });
    }

    fn transition(&self, stream_id: u64, status: StreamStatus) {
        if let Some(state) = self.active.lock().as_mut().filter(|s| s.id == stream_id) {
            state.set_status(status);
        }
    }

    fn take_active(&self, stream_id: u64) -> Option<StreamState> {
        let mut active = self.active.lock();
        if active.as_ref().is_some_and(|s| s.id == stream_id) {
            active.take()
        } else {
            None
        }
    }

    fn emit(&self, event: ChatEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::VecDeque;
    use tokio::sync::{Notify, mpsc};
    use tokio_stream::wrappers::UnboundedReceiverStream;
    use trickle_wire::{Message, Role, TransportResponse};

    type Chunk = trickle_wire::Result<Bytes>;

    #[derive(Default)]
    struct ScriptedTransport {
        responses: Mutex<VecDeque<TransportResponse>>,
        calls: Mutex<Vec<(Option<String>, CompletionRequest)>>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<TransportResponse>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CompletionTransport for ScriptedTransport {
        async fn open(
            &self,
            conversation_id: Option<&str>,
            request: &CompletionRequest,
        ) -> trickle_wire::Result<TransportResponse> {
            self.calls
                .lock()
                .push((conversation_id.map(str::to_string), request.clone()));
            self.responses
                .lock()
                .pop_front()
                .ok_or_else(|| trickle_wire::Error::transport("connection refused"))
        }
    }

    /// Never answers; signals once a request is waiting
    #[derive(Default)]
    struct StallingTransport {
        entered: Notify,
    }

    #[async_trait]
    impl CompletionTransport for StallingTransport {
        async fn open(
            &self,
            _conversation_id: Option<&str>,
            _request: &CompletionRequest,
        ) -> trickle_wire::Result<TransportResponse> {
            self.entered.notify_one();
            std::future::pending().await
        }
    }

    fn body(status: u16, chunks: &[&str]) -> TransportResponse {
        let chunks: Vec<Chunk> = chunks
            .iter()
            .map(|c| Ok(Bytes::from(c.to_string())))
            .collect();
        TransportResponse::new(status, Box::pin(futures::stream::iter(chunks)))
    }

    fn channel(status: u16) -> (mpsc::UnboundedSender<Chunk>, TransportResponse) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            tx,
            TransportResponse::new(status, Box::pin(UnboundedReceiverStream::new(rx))),
        )
    }

    fn data(text: &str) -> Chunk {
        Ok(Bytes::from(format!("data: {{\"text\":\"{}\"}}\n\n", text)))
    }

    fn setup(responses: Vec<TransportResponse>) -> (StreamController, Arc<ScriptedTransport>, Arc<MemoryLedger>) {
        let transport = ScriptedTransport::new(responses);
        let ledger = Arc::new(MemoryLedger::new());
        let controller = StreamController::new(transport.clone(), ledger.clone());
        (controller, transport, ledger)
    }

    fn ask(prompt: &str) -> CompletionRequest {
        CompletionRequest::new(&[Message::user(prompt)])
    }

    fn drain(rx: &mut broadcast::Receiver<ChatEvent>) -> Vec<ChatEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_mixed_grammars_stream_to_completion() {
        let (controller, _, ledger) = setup(vec![body(
            200,
            &[
                "data: {\"text\":\"Hel\"}\n\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n",
                "\ndata: b'\\x2c w'\n\n",
                "data: {\"ops\":[{\"op\":\"add\",\"path\":\"/logs/llm/streamed_output/-\",\"value\":\"orld\"},",
                "{\"op\":\"add\",\"path\":\"/streamed_output/-\",\"value\":\"</s>\"}]}\n\n",
                ": keep-alive\n\n",
                "data: [DONE]\n\n",
                "data: {\"text\":\"after done\"}\n\n",
            ],
        )]);
        let mut events = controller.subscribe();

        let task = controller.start(None, ask("hi")).await.unwrap();
        let outcome = task.join().await.unwrap();

        let StreamOutcome::Completed {
            conversation_id,
            message,
        } = outcome
        else {
            panic!("expected completion, got {:?}", outcome);
        };
        assert_eq!(message.content, "Hello, world");
        assert_eq!(message.role, Role::Assistant);

        let history = ledger.get_history(&conversation_id).unwrap();
        let contents: Vec<_> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["hi", "Hello, world"]);

        assert_eq!(*controller.live().borrow(), "");
        assert_eq!(controller.status(), None);

        let events = drain(&mut events);
        assert!(matches!(events.first(), Some(ChatEvent::StreamStart { conversation_id: None, .. })));
        assert!(matches!(events.last(), Some(ChatEvent::Committed { .. })));
        let deltas: String = events
            .iter()
            .filter_map(|e| match e {
                ChatEvent::Delta { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(deltas, "Hello, world");
    }

    #[tokio::test]
    async fn test_existing_conversation_is_passed_and_reused() {
        let (controller, transport, ledger) =
            setup(vec![body(200, &["data: {\"text\":\"again\"}\n\n"])]);
        let id = ledger.append_message(None, Message::user("earlier")).unwrap();

        let outcome = controller
            .start(Some(id.clone()), ask("more"))
            .await
            .unwrap()
            .join()
            .await
            .unwrap();

        assert!(matches!(outcome, StreamOutcome::Completed { ref conversation_id, .. } if *conversation_id == id));
        assert_eq!(transport.calls.lock()[0].0.as_deref(), Some(id.as_str()));

        let conversation = ledger.get_conversation(&id).unwrap();
        assert_eq!(conversation.first_query, "earlier");
        assert_eq!(conversation.messages.len(), 3);
    }

    #[tokio::test]
    async fn test_partial_chunks_yield_one_delta() {
        let (controller, _, _) = setup(vec![body(200, &["data: {\"te", "xt\":\"ok\"}\n\n"])]);
        let mut events = controller.subscribe();

        let outcome = controller.start(None, ask("q")).await.unwrap().join().await.unwrap();
        assert!(matches!(outcome, StreamOutcome::Completed { ref message, .. } if message.content == "ok"));

        let deltas = drain(&mut events)
            .into_iter()
            .filter(|e| matches!(e, ChatEvent::Delta { .. }))
            .count();
        assert_eq!(deltas, 1);
    }

    #[tokio::test]
    async fn test_client_error_is_returned_before_streaming() {
        let (controller, _, ledger) = setup(vec![body(400, &[r#"{"error":{"message":"unknown model"}}"#])]);
        let mut events = controller.subscribe();

        let err = match controller.start(None, ask("q")).await {
            Err(e) => e,
            Ok(_) => panic!("expected a client error"),
        };
        assert!(err.is_client_error());
        assert_eq!(err.status(), Some(400));
        assert_eq!(err.to_string(), "Request rejected (400): unknown model");

        assert!(ledger.is_empty());
        assert_eq!(controller.status(), None);
        let events = drain(&mut events);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], ChatEvent::Failed { .. }));
    }

    #[tokio::test]
    async fn test_server_error_fails_after_reading_body() {
        let (controller, _, ledger) = setup(vec![
            body(503, &["data: {\"text\":\"overloaded\"}\n\n"]),
            body(429, &["slow down"]),
        ]);

        for expected in [503, 429] {
            let task = controller.start(None, ask("q")).await.unwrap();
            let err = task.join().await.unwrap_err();
            assert_eq!(err.status(), Some(expected));
            assert!(err.is_retryable());
            assert!(!err.is_client_error());
        }

        assert!(ledger.is_empty());
        assert_eq!(*controller.live().borrow(), "");
    }

    #[tokio::test]
    async fn test_open_failure_is_surfaced() {
        let (controller, _, ledger) = setup(vec![]);

        let err = match controller.start(None, ask("q")).await {
            Err(e) => e,
            Ok(_) => panic!("expected an open failure"),
        };
        assert!(err.is_retryable());
        assert_eq!(controller.status(), None);
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn test_mid_stream_error_commits_nothing() {
        let (tx, response) = channel(200);
        let (controller, _, ledger) = setup(vec![response]);
        let mut live = controller.live();
        let mut events = controller.subscribe();

        tx.send(data("par")).unwrap();
        let task = controller.start(None, ask("q")).await.unwrap();
        live.wait_for(|text| text.as_str() == "par").await.unwrap();

        tx.send(Err(trickle_wire::Error::transport("connection reset"))).unwrap();
        let err = task.join().await.unwrap_err();
        assert!(err.to_string().contains("connection reset"));

        assert!(ledger.is_empty());
        assert_eq!(*controller.live().borrow(), "");
        assert!(matches!(drain(&mut events).last(), Some(ChatEvent::Failed { .. })));
    }

    #[tokio::test]
    async fn test_abort_commits_partial_text() {
        let (tx, response) = channel(200);
        let (controller, _, ledger) = setup(vec![response]);
        let mut live = controller.live();

        tx.send(data("Hel")).unwrap();
        tx.send(data("lo")).unwrap();
        let task = controller.start(None, ask("greet me")).await.unwrap();
        live.wait_for(|text| text.as_str() == "Hello").await.unwrap();
        assert_eq!(controller.status(), Some(StreamStatus::Streaming));

        let conversation_id = match controller.abort().unwrap() {
            Some(Finalized::Committed {
                conversation_id,
                message,
            }) => {
                assert_eq!(message.content, "Hello");
                conversation_id
            }
            other => panic!("unexpected: {:?}", other),
        };
        assert_eq!(task.join().await.unwrap(), StreamOutcome::Aborted);

        let contents: Vec<_> = ledger
            .get_history(&conversation_id)
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["greet me", "Hello"]);
        assert_eq!(controller.status(), None);
        assert_eq!(*live.borrow(), "");

        // Nothing left to abort
        assert!(controller.abort().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_new_stream_aborts_previous() {
        let (tx, first_response) = channel(200);
        let (controller, _, ledger) = setup(vec![
            first_response,
            body(200, &["data: {\"text\":\"second\"}\n\n", "data: [DONE]\n\n"]),
        ]);
        let mut live = controller.live();
        let mut events = controller.subscribe();

        tx.send(data("first")).unwrap();
        let first = controller.start(None, ask("one")).await.unwrap();
        live.wait_for(|text| text.as_str() == "first").await.unwrap();

        let second = controller.start(None, ask("two")).await.unwrap();
        let (first_id, second_id) = (first.id(), second.id());
        assert_ne!(first_id, second_id);

        assert_eq!(first.join().await.unwrap(), StreamOutcome::Aborted);
        let outcome = second.join().await.unwrap();
        assert!(matches!(outcome, StreamOutcome::Completed { ref message, .. } if message.content == "second"));

        // The late chunk of the first stream is never applied
        let _ = tx.send(data("late"));
        let listed = ledger.list_conversations().unwrap();
        assert_eq!(listed.len(), 2);
        let queries: Vec<_> = listed.iter().map(|s| s.first_query.as_str()).collect();
        assert_eq!(queries, vec!["two", "one"]);

        let events = drain(&mut events);
        let aborted = events
            .iter()
            .position(|e| matches!(e, ChatEvent::Aborted { stream_id, .. } if *stream_id == first_id));
        let second_start = events
            .iter()
            .position(|e| matches!(e, ChatEvent::StreamStart { stream_id, .. } if *stream_id == second_id));
        assert!(aborted.unwrap() < second_start.unwrap());
    }

    #[tokio::test]
    async fn test_abort_while_opening_keeps_prompt() {
        let transport = Arc::new(StallingTransport::default());
        let ledger = Arc::new(MemoryLedger::new());
        let controller = StreamController::new(transport.clone(), ledger.clone());
        let mut events = controller.subscribe();

        let starter = controller.clone();
        let start = tokio::spawn(async move { starter.start(None, ask("wait")).await });
        transport.entered.notified().await;
        assert_eq!(controller.status(), Some(StreamStatus::Opening));

        let conversation_id = match controller.abort().unwrap() {
            Some(Finalized::Committed {
                conversation_id,
                message,
            }) => {
                assert_eq!(message.content, "");
                conversation_id
            }
            other => panic!("unexpected: {:?}", other),
        };
        assert!(matches!(
            start.await.unwrap(),
            Err(Error::Wire(trickle_wire::Error::Aborted))
        ));
        assert_eq!(controller.status(), None);

        let contents: Vec<_> = ledger
            .get_history(&conversation_id)
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["wait", ""]);

        let events = drain(&mut events);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], ChatEvent::StreamStart { .. }));
        assert!(matches!(events[1], ChatEvent::Aborted { conversation_id: Some(_), .. }));
    }

    #[tokio::test]
    async fn test_no_delta_follows_abort() {
        let (tx, response) = channel(200);
        let (controller, _, _) = setup(vec![response]);
        let mut live = controller.live();
        let mut events = controller.subscribe();

        tx.send(data("a")).unwrap();
        let task = controller.start(None, ask("q")).await.unwrap();
        live.wait_for(|text| !text.is_empty()).await.unwrap();

        let feeder = tokio::spawn(async move {
            for _ in 0..200 {
                if tx.send(data("b")).is_err() {
                    break;
                }
                tokio::task::yield_now().await;
            }
        });
        tokio::task::yield_now().await;

        let committed = match controller.abort().unwrap() {
            Some(Finalized::Committed { message, .. }) => message.content,
            other => panic!("unexpected: {:?}", other),
        };
        assert_eq!(task.join().await.unwrap(), StreamOutcome::Aborted);
        feeder.await.unwrap();

        let events = drain(&mut events);
        let aborted = events
            .iter()
            .position(|e| matches!(e, ChatEvent::Aborted { .. }))
            .unwrap();
        assert!(
            events[aborted + 1..]
                .iter()
                .all(|e| !matches!(e, ChatEvent::Delta { .. }))
        );
        let streamed: String = events[..aborted]
            .iter()
            .filter_map(|e| match e {
                ChatEvent::Delta { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(streamed, committed);
    }
}
