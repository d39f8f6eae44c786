//! Send/receive lifecycle of the chat widget.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures::StreamExt;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chat::errors::{ChatError, ChatResult};
use crate::chat::message::{ChatMessage, ChatState, ChatbotError};
use crate::chat::session::ChatSession;
use crate::chat::transport::{ChatRequest, ChatTransport};
use crate::sse::consume_sse_stream;

/// Reply appended after a failed exchange.
pub const APOLOGY: &str = "Sorry, I encountered an error. Please try sending your message again.";

/// Filler message used to wake a cold upstream.
pub const WARMUP_MESSAGE: &str = "hi";

/// Drives one conversation: appends messages, relays them through the
/// transport, and streams the reply into the transcript.
///
/// Observers follow [`Chatbot::subscribe`]. Only one send cycle runs at a time;
/// a second `send_message` while one is in flight is ignored.
pub struct Chatbot {
    transport: Arc<dyn ChatTransport>,
    session: ChatSession,
    state: watch::Sender<ChatState>,
    next_id: AtomicU64,
    in_flight: Mutex<Option<CancellationToken>>,
    warmed_up: AtomicBool,
}

impl Chatbot {
    /// Create a chatbot over `transport`, persisting the session id through `session`.
    #[must_use]
    pub fn new(transport: Arc<dyn ChatTransport>, session: ChatSession) -> Self {
        let initial = ChatState {
            session_id: session.subscribe().borrow().clone(),
            ..ChatState::default()
        };
        let (state, _) = watch::channel(initial);
        Self {
            transport,
            session,
            state,
            next_id: AtomicU64::new(1),
            in_flight: Mutex::new(None),
            warmed_up: AtomicBool::new(false),
        }
    }

    /// Observe state snapshots.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ChatState> {
        self.state.subscribe()
    }

    /// Current state snapshot.
    #[must_use]
    pub fn snapshot(&self) -> ChatState {
        self.state.borrow().clone()
    }

    /// Session view backing this chatbot.
    #[must_use]
    pub const fn session(&self) -> &ChatSession {
        &self.session
    }

    /// Send `text` and stream the reply into the transcript.
    ///
    /// Blank text, or a call while another send is in flight, does nothing.
    /// Failures are recorded in the state rather than returned.
    pub async fn send_message(&self, text: &str) {
        if text.trim().is_empty() {
            return;
        }

        let token = CancellationToken::new();
        {
            let mut in_flight = self.in_flight.lock().await;
            let started = self.state.send_if_modified(|state| {
                if state.is_loading {
                    false
                } else {
                    state.is_loading = true;
                    state.error = None;
                    true
                }
            });
            if !started {
                debug!("Send ignored, a request is already in flight");
                return;
            }
            *in_flight = Some(token.clone());
        }

        let user = ChatMessage::user(self.allocate_id(), text);
        self.state.send_modify(|state| state.messages.push(user));

        let outcome = self.exchange(text, &token).await;
        *self.in_flight.lock().await = None;

        match outcome {
            Ok(()) => {
                if let Err(err) = self.session.refresh().await {
                    warn!(%err, "Failed to extend session");
                }
                self.finish(None, None).await;
            }
            Err(err) if err.is_cancelled() => {
                info!("Request cancelled");
                self.finish(None, None).await;
            }
            Err(err) => {
                warn!(%err, "Chat exchange failed, clearing session");
                if let Err(clear_err) = self.session.clear_id().await {
                    warn!(err = %clear_err, "Failed to clear session");
                }
                let error = ChatbotError {
                    message: err.user_message(),
                    can_retry: true,
                };
                let apology = ChatMessage::ai_error(self.allocate_id(), APOLOGY);
                self.finish(Some(error), Some(apology)).await;
            }
        }
    }

    /// Resend the most recent user message, dropping earlier apology replies.
    pub async fn retry_last_message(&self) {
        let text = {
            let state = self.state.borrow();
            if state.is_loading {
                return;
            }
            match state.last_user_text() {
                Some(text) => text.to_string(),
                None => return,
            }
        };

        self.state.send_modify(|state| {
            state.messages.retain(|m| !m.is_error);
            state.error = None;
        });
        self.send_message(&text).await;
    }

    /// Abort the in-flight request, if any.
    pub async fn cancel_request(&self) {
        if let Some(token) = self.in_flight.lock().await.as_ref() {
            token.cancel();
        }
    }

    /// Wake the upstream with a throwaway message, once per chatbot.
    ///
    /// The reply is drained and discarded; every failure is swallowed.
    pub async fn warmup_server(&self) {
        if self.warmed_up.swap(true, Ordering::SeqCst) {
            return;
        }

        let request = ChatRequest {
            message: WARMUP_MESSAGE.to_string(),
            session_id: String::new(),
        };
        match self.transport.send(&request).await {
            Ok(mut reply) => {
                while let Some(chunk) = reply.body.next().await {
                    if chunk.is_err() {
                        break;
                    }
                }
                debug!("Server warm-up complete");
            }
            Err(err) => debug!(%err, "Server warm-up failed"),
        }
    }

    /// Empty the transcript and clear the last error.
    ///
    /// Message ids restart from 1 unless a reply is still streaming.
    pub fn clear_messages(&self) {
        self.state.send_modify(|state| {
            state.messages.clear();
            state.error = None;
            if !state.is_loading {
                self.next_id.store(1, Ordering::SeqCst);
            }
        });
    }

    /// Replace the current session with a fresh one from the proxy.
    ///
    /// # Errors
    /// Returns an error if the proxy cannot mint a session; the old one is gone either way.
    pub async fn start_new_session(&self) -> ChatResult<String> {
        self.session.clear_id().await?;
        self.publish_session().await;

        let transport = Arc::clone(&self.transport);
        let created = self
            .session
            .touch_on_success(|| async move { transport.create_session().await })
            .await?;

        self.session.set_id(created.session_id.clone()).await?;
        self.publish_session().await;
        info!(session_id = %created.session_id, "Started new session");
        Ok(created.session_id)
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn exchange(&self, text: &str, token: &CancellationToken) -> ChatResult<()> {
        let request = ChatRequest {
            message: text.to_string(),
            session_id: self.session.current_id().await.unwrap_or_default(),
        };

        let reply = tokio::select! {
            biased;
            () = token.cancelled() => return Err(ChatError::Cancelled),
            reply = self.transport.send(&request) => reply?,
        };

        if let Some(id) = reply.session_id.as_deref().filter(|id| !id.is_empty()) {
            if self.session.current_id().await.as_deref() != Some(id) {
                debug!(session_id = %id, "Adopting session id from proxy");
                if let Err(err) = self.session.set_id(id).await {
                    warn!(%err, "Failed to persist session id");
                }
                self.publish_session().await;
            }
        }

        let ai_id = self.allocate_id();
        let mut accumulated = String::new();
        let state = &self.state;
        let decode = consume_sse_stream(reply.body, |delta| {
            accumulated.push_str(&delta);
            let text = accumulated.clone();
            state.send_modify(|state| {
                match state.messages.iter_mut().find(|m| m.id == ai_id) {
                    Some(message) => message.text = text,
                    None => state.messages.push(ChatMessage::ai_streaming(ai_id, text)),
                }
                state.is_streaming = true;
            });
        });

        let result = tokio::select! {
            biased;
            () = token.cancelled() => Err(ChatError::Cancelled),
            decoded = decode => decoded.map_err(ChatError::from),
        };

        self.state.send_if_modified(|state| {
            match state.messages.iter_mut().find(|m| m.id == ai_id) {
                Some(message) if message.streaming => {
                    message.streaming = false;
                    true
                }
                _ => false,
            }
        });
        result
    }

    async fn finish(&self, error: Option<ChatbotError>, apology: Option<ChatMessage>) {
        let session_id = self.session.current_id().await;
        self.state.send_modify(|state| {
            state.is_loading = false;
            state.is_streaming = false;
            state.error = error;
            state.session_id = session_id;
            if let Some(apology) = apology {
                state.messages.push(apology);
            }
        });
    }

    async fn publish_session(&self) {
        let session_id = self.session.current_id().await;
        self.state.send_if_modified(|state| {
            if state.session_id == session_id {
                false
            } else {
                state.session_id = session_id;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::message::Sender;
    use crate::chat::session::SESSION_TTL;
    use crate::clock::ManualClock;
    use crate::chat::transport::{ProxyReply, SessionCreated};
    use crate::session::{ChangeBus, MemoryBackend, TtlStore};
    use async_trait::async_trait;
    use axum::body::Bytes;
    use std::io;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    enum Script {
        Reply {
            session_id: Option<&'static str>,
            chunks: Vec<&'static str>,
        },
        Hang,
        Fail(u16, &'static str),
    }

    #[derive(Default)]
    struct FakeTransport {
        scripts: StdMutex<Vec<Script>>,
        requests: StdMutex<Vec<ChatRequest>>,
        sessions_created: AtomicU64,
    }

    impl FakeTransport {
        fn with(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                scripts: StdMutex::new(scripts),
                ..Self::default()
            })
        }

        fn requests(&self) -> Vec<ChatRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatTransport for FakeTransport {
        async fn send(&self, request: &ChatRequest) -> ChatResult<ProxyReply> {
            self.requests.lock().unwrap().push(request.clone());
            let script = {
                let mut scripts = self.scripts.lock().unwrap();
                if scripts.is_empty() { Script::Hang } else { scripts.remove(0) }
            };
            match script {
                Script::Reply { session_id, chunks } => Ok(ProxyReply {
                    status: 200,
                    session_id: session_id.map(str::to_string),
                    body: futures::stream::iter(
                        chunks
                            .into_iter()
                            .map(|c| Ok::<_, io::Error>(Bytes::from_static(c.as_bytes()))),
                    )
                    .boxed(),
                }),
                Script::Hang => Ok(ProxyReply {
                    status: 200,
                    session_id: None,
                    body: futures::stream::iter(vec![Ok::<_, io::Error>(Bytes::from_static(b"data: {\"text\":\"par\"}\n\n"))])
                        .chain(futures::stream::pending())
                        .boxed(),
                }),
                Script::Fail(status, message) => Err(ChatError::Api {
                    status,
                    message: message.to_string(),
                }),
            }
        }

        async fn create_session(&self) -> ChatResult<SessionCreated> {
            let n = self.sessions_created.fetch_add(1, Ordering::SeqCst);
            Ok(SessionCreated {
                session_id: format!("minted-{n}"),
            })
        }
    }

    async fn chatbot(transport: Arc<FakeTransport>) -> Chatbot {
        let store = TtlStore::new(Arc::new(MemoryBackend::new()), ChangeBus::default());
        Chatbot::new(transport, ChatSession::open(store).await)
    }

    fn reply(session_id: Option<&'static str>, chunks: Vec<&'static str>) -> Script {
        Script::Reply { session_id, chunks }
    }

    #[tokio::test]
    async fn test_deltas_accumulate_into_one_message() {
        let transport = FakeTransport::with(vec![reply(
            Some("s-1"),
            vec!["data: {\"text\":\"Hel\"}\n", "\ndata: {\"text\":\"lo\"}\n\n"],
        )]);
        let bot = chatbot(Arc::clone(&transport)).await;

        bot.send_message("hi there").await;

        let state = bot.snapshot();
        assert_eq!(state.messages.len(), 2);
        assert_eq!(state.messages[0].sender, Sender::User);
        assert_eq!(state.messages[0].text, "hi there");
        assert_eq!(state.messages[1].sender, Sender::Ai);
        assert_eq!(state.messages[1].text, "Hello");
        assert!(state.messages[0].id < state.messages[1].id);
        assert!(!state.messages[1].streaming);
        assert!(!state.is_loading && !state.is_streaming);
        assert_eq!(state.error, None);
        assert_eq!(state.session_id.as_deref(), Some("s-1"));
        assert_eq!(bot.session().current_id().await.as_deref(), Some("s-1"));
        assert_eq!(transport.requests()[0].session_id, "");
    }

    #[tokio::test]
    async fn test_second_message_reuses_session() {
        let transport = FakeTransport::with(vec![
            reply(Some("s-1"), vec!["data: {\"text\":\"a\"}\n\n"]),
            reply(Some("s-1"), vec!["data: {\"text\":\"b\"}\n\n"]),
        ]);
        let bot = chatbot(Arc::clone(&transport)).await;

        bot.send_message("one").await;
        bot.send_message("two").await;

        let requests = transport.requests();
        assert_eq!(requests[1].session_id, "s-1");
        assert_eq!(bot.snapshot().messages.len(), 4);
    }

    #[tokio::test]
    async fn test_idle_session_is_not_resent_after_expiry() {
        let transport = FakeTransport::with(vec![
            reply(Some("s-1"), vec!["data: {\"text\":\"a\"}\n\n"]),
            reply(Some("s-2"), vec!["data: {\"text\":\"b\"}\n\n"]),
        ]);
        let clock = Arc::new(ManualClock::new(0));
        let store = TtlStore::with_clock(Arc::new(MemoryBackend::new()), ChangeBus::default(), clock.clone());
        let bot = Chatbot::new(Arc::clone(&transport) as Arc<dyn ChatTransport>, ChatSession::open(store).await);

        bot.send_message("one").await;
        assert_eq!(bot.snapshot().session_id.as_deref(), Some("s-1"));

        clock.advance(SESSION_TTL + Duration::from_secs(5 * 60));
        bot.send_message("two").await;

        let requests = transport.requests();
        assert_eq!(requests[1].session_id, "");
        assert_eq!(bot.snapshot().session_id.as_deref(), Some("s-2"));
        assert_eq!(bot.snapshot().error, None);
    }

    #[tokio::test]
    async fn test_message_is_sent_as_typed() {
        let transport = FakeTransport::with(vec![reply(None, vec!["data: {\"text\":\"ok\"}\n\n"])]);
        let bot = chatbot(Arc::clone(&transport)).await;

        bot.send_message("  padded question \n").await;

        assert_eq!(transport.requests()[0].message, "  padded question \n");
        assert_eq!(bot.snapshot().messages[0].text, "  padded question \n");
    }

    #[tokio::test]
    async fn test_cancel_right_after_send_starts_is_not_lost() {
        let transport = FakeTransport::with(vec![Script::Hang]);
        let bot = Arc::new(chatbot(transport).await);
        let mut updates = bot.subscribe();

        let sending = tokio::spawn({
            let bot = Arc::clone(&bot);
            async move { bot.send_message("hello").await }
        });

        tokio::time::timeout(Duration::from_secs(5), updates.wait_for(|s| s.is_loading))
            .await
            .unwrap()
            .unwrap();
        bot.cancel_request().await;

        tokio::time::timeout(Duration::from_secs(5), sending).await.unwrap().unwrap();
        let state = bot.snapshot();
        assert!(!state.is_loading);
        assert_eq!(state.error, None);
    }

    #[tokio::test]
    async fn test_blank_message_is_ignored() {
        let transport = FakeTransport::with(vec![]);
        let bot = chatbot(Arc::clone(&transport)).await;
        bot.send_message("   ").await;
        assert!(transport.requests().is_empty());
        assert!(bot.snapshot().messages.is_empty());
    }

    #[tokio::test]
    async fn test_failure_clears_session_and_appends_apology() {
        let transport = FakeTransport::with(vec![
            reply(Some("s-1"), vec!["data: {\"text\":\"a\"}\n\n"]),
            Script::Fail(404, "Your session has expired. Please try again."),
        ]);
        let bot = chatbot(Arc::clone(&transport)).await;

        bot.send_message("one").await;
        bot.send_message("two").await;

        let state = bot.snapshot();
        let error = state.error.clone().unwrap();
        assert_eq!(error.message, "Your session has expired. Please try again.");
        assert!(error.can_retry);
        assert_eq!(state.session_id, None);
        assert_eq!(bot.session().current_id().await, None);
        let last = state.messages.last().unwrap();
        assert!(last.is_error);
        assert_eq!(last.text, APOLOGY);
        assert!(!state.is_loading);
    }

    #[tokio::test]
    async fn test_in_band_error_keeps_partial_text() {
        let transport = FakeTransport::with(vec![reply(
            None,
            vec!["data: {\"text\":\"par\"}\n\ndata: {\"error\":{\"code\":429}}\n\n"],
        )]);
        let bot = chatbot(transport).await;

        bot.send_message("hi").await;

        let state = bot.snapshot();
        assert!(state.error.unwrap().message.starts_with("Rate limit exceeded"));
        assert_eq!(state.messages[1].text, "par");
        assert!(!state.messages[1].streaming);
        assert!(state.messages[2].is_error);
    }

    #[tokio::test]
    async fn test_retry_resends_last_user_message() {
        let transport = FakeTransport::with(vec![
            Script::Fail(500, "boom"),
            reply(None, vec!["data: {\"text\":\"ok\"}\n\n"]),
        ]);
        let bot = chatbot(Arc::clone(&transport)).await;

        bot.send_message("question").await;
        assert!(bot.snapshot().error.is_some());

        bot.retry_last_message().await;

        let state = bot.snapshot();
        assert_eq!(state.error, None);
        assert!(state.messages.iter().all(|m| !m.is_error));
        let texts: Vec<&str> = state.messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["question", "question", "ok"]);
        assert_eq!(transport.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_cancel_mid_stream() {
        let transport = FakeTransport::with(vec![Script::Hang]);
        let bot = Arc::new(chatbot(transport).await);
        let mut updates = bot.subscribe();

        let sending = tokio::spawn({
            let bot = Arc::clone(&bot);
            async move { bot.send_message("hello").await }
        });

        tokio::time::timeout(Duration::from_secs(5), updates.wait_for(|s| s.is_streaming))
            .await
            .unwrap()
            .unwrap();

        // A second send while streaming is ignored.
        bot.send_message("again").await;

        bot.cancel_request().await;
        sending.await.unwrap();

        let state = bot.snapshot();
        assert!(!state.is_loading);
        assert!(!state.is_streaming);
        assert_eq!(state.error, None);
        assert_eq!(state.messages.len(), 2);
        assert_eq!(state.messages[1].text, "par");
    }

    #[tokio::test]
    async fn test_warmup_runs_once_and_swallows_errors() {
        let transport = FakeTransport::with(vec![Script::Fail(503, "cold")]);
        let bot = chatbot(Arc::clone(&transport)).await;

        bot.warmup_server().await;
        bot.warmup_server().await;

        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].message, WARMUP_MESSAGE);
        assert!(bot.snapshot().messages.is_empty());
        assert_eq!(bot.snapshot().error, None);
    }

    #[tokio::test]
    async fn test_clear_messages_and_new_session() {
        let transport = FakeTransport::with(vec![reply(Some("s-1"), vec!["data: {\"text\":\"a\"}\n\n"])]);
        let bot = chatbot(Arc::clone(&transport)).await;
        bot.send_message("one").await;

        bot.clear_messages();
        assert!(bot.snapshot().messages.is_empty());

        let id = bot.start_new_session().await.unwrap();
        assert_eq!(id, "minted-0");
        assert_eq!(bot.session().current_id().await.as_deref(), Some("minted-0"));
        assert_eq!(bot.snapshot().session_id.as_deref(), Some("minted-0"));
    }
}
