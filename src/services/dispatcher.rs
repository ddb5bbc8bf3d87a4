use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Local, Utc};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};

use super::conversation::{clean_title, naming_prompt, truncate_title};
use super::markdown::answer_text;
use super::settings::{ChatSettings, SearchMode};
use super::store::{lock_store, SharedStore, StoreError};
use crate::models::Message;
use crate::providers::{
    ChatRequest, CompletionProvider, ProviderError, SearchProvider, SearchResult, StreamEvent,
};

pub const FALLBACK_REPLY: &str = "Sorry, I encountered an error. Please try again.";

const SEARCH_DECISION_PROMPT: &str = "Decide if a search is necessary based on the message given, especially when it requires the latest information, respond only with a 'yes' if its necessary and a 'no' if not, no extras like other words or symbols";
const SEARCH_TERM_PROMPT: &str = "Determine the most appropriate search term for searching relevant information based on my message, only say that search term and nothing else, no other words or sentences, don't use double quotations always, only on ones that need complete accuracy";

/// Where a single conversation turn currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Idle,
    UserMessageAppended,
    AwaitingReply { attempt: u32 },
    ReplyAppended,
    FailedPermanently,
    FallbackAppended,
}

#[derive(Debug, Clone)]
pub enum DispatchEvent {
    Phase {
        conversation_id: String,
        phase: TurnPhase,
    },
    Token {
        conversation_id: String,
        accumulated: String,
    },
    Renamed {
        conversation_id: String,
        name: String,
    },
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("No reply after {attempts} attempt(s): {last_error}")]
    Exhausted {
        attempts: u32,
        last_error: ProviderError,
    },

    #[error("Conversation {0} was deleted before its reply arrived")]
    Discarded(String),

    #[error("Dispatcher is no longer running")]
    Closed,
}

/// Resolves once the reply for one send (or edit) has been appended.
#[derive(Debug)]
pub struct ReplyHandle {
    rx: oneshot::Receiver<Result<String, DispatchError>>,
}

impl ReplyHandle {
    pub async fn wait(self) -> Result<String, DispatchError> {
        self.rx.await.unwrap_or(Err(DispatchError::Closed))
    }
}

struct Job {
    conversation_id: String,
    history: Vec<Message>,
    /// First user message, when the conversation still needs a name.
    title_from: Option<String>,
    reply_tx: oneshot::Sender<Result<String, DispatchError>>,
}

/// Front-end handle: mutates the store synchronously and queues completion
/// requests for the worker task.
pub struct Dispatcher {
    store: SharedStore,
    jobs: mpsc::UnboundedSender<Job>,
    pending: Arc<AtomicUsize>,
    events: broadcast::Sender<DispatchEvent>,
}

impl Dispatcher {
    /// Start the worker on the current tokio runtime.
    pub fn spawn(
        store: SharedStore,
        provider: Arc<dyn CompletionProvider>,
        search: Option<Arc<dyn SearchProvider>>,
        settings: ChatSettings,
    ) -> Self {
        let (jobs, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);
        let pending = Arc::new(AtomicUsize::new(0));

        let worker = Worker {
            store: store.clone(),
            provider,
            search,
            settings,
            events: events.clone(),
            pending: pending.clone(),
        };
        tokio::spawn(worker.run(rx));

        Self {
            store,
            jobs,
            pending,
            events,
        }
    }

    pub fn store(&self) -> SharedStore {
        self.store.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.events.subscribe()
    }

    pub fn is_loading(&self) -> bool {
        self.pending.load(Ordering::SeqCst) > 0
    }

    /// Append `text` as a user message to the active conversation and queue
    /// the request for its reply. Blank input is ignored.
    pub fn send(&self, text: &str) -> Option<ReplyHandle> {
        if text.trim().is_empty() {
            tracing::debug!("Ignoring empty message");
            return None;
        }

        let (conversation_id, history, title_from) = {
            let mut store = lock_store(&self.store);
            let active = store.active();
            let needs_name = active.name.is_none() && !active.has_user_messages();

            log_storage_failure(store.push_user_message(text));

            let active = store.active();
            (
                active.id.clone(),
                active.messages.clone(),
                needs_name.then(|| text.to_string()),
            )
        };

        Some(self.enqueue(conversation_id, history, title_from))
    }

    /// Replace user message `index`, drop the stale replies after it and
    /// request a fresh reply. Blank text is ignored.
    pub fn edit(&self, index: usize, text: &str) -> Result<Option<ReplyHandle>, StoreError> {
        if text.trim().is_empty() {
            return Ok(None);
        }

        let (conversation_id, history) = {
            let mut store = lock_store(&self.store);
            match store.edit_and_truncate(index, text) {
                Ok(_) => {}
                Err(StoreError::Storage(e)) => {
                    tracing::error!("Failed to save conversation: {:#}", e);
                }
                Err(e) => return Err(e),
            }
            let active = store.active();
            (active.id.clone(), active.messages.clone())
        };

        Ok(Some(self.enqueue(conversation_id, history, None)))
    }

    /// Drop user message `index` and everything after it.
    pub fn delete(&self, index: usize) -> Result<(), StoreError> {
        let mut store = lock_store(&self.store);
        match store.delete(index) {
            Err(StoreError::Storage(e)) => {
                tracing::error!("Failed to save conversation: {:#}", e);
                Ok(())
            }
            other => other,
        }
    }

    fn enqueue(
        &self,
        conversation_id: String,
        history: Vec<Message>,
        title_from: Option<String>,
    ) -> ReplyHandle {
        let (reply_tx, rx) = oneshot::channel();
        self.pending.fetch_add(1, Ordering::SeqCst);
        let _ = self.events.send(DispatchEvent::Phase {
            conversation_id: conversation_id.clone(),
            phase: TurnPhase::UserMessageAppended,
        });

        tracing::debug!(
            conversation_id = %conversation_id,
            queued = self.pending.load(Ordering::SeqCst),
            "Queued completion request"
        );

        let job = Job {
            conversation_id,
            history,
            title_from,
            reply_tx,
        };
        if let Err(mpsc::error::SendError(job)) = self.jobs.send(job) {
            tracing::error!("Dispatcher worker has stopped; dropping request");
            self.pending.fetch_sub(1, Ordering::SeqCst);
            let _ = job.reply_tx.send(Err(DispatchError::Closed));
        }

        ReplyHandle { rx }
    }
}

fn log_storage_failure<T>(result: Result<T, StoreError>) {
    if let Err(e) = result {
        tracing::error!("Failed to save conversation: {}", e);
    }
}

/// Persona prompt carrying the current time, regenerated for every request.
pub fn persona_prompt(now: DateTime<Utc>) -> String {
    let local: DateTime<Local> = now.into();
    format!(
        "You are a helpful AI assistant named Arda. Current UTC time is {}, and local time is {}.",
        now.to_rfc2822(),
        local.format("%Y-%m-%d %H:%M:%S %Z")
    )
}

fn format_search_results(results: &[SearchResult]) -> Option<String> {
    if results.is_empty() {
        return None;
    }
    let json = serde_json::to_string(results).ok()?;
    Some(format!(
        "Provide links used in relevant searched information, \nLatest relevant searched information from the internet: {}",
        json
    ))
}

struct Worker {
    store: SharedStore,
    provider: Arc<dyn CompletionProvider>,
    search: Option<Arc<dyn SearchProvider>>,
    settings: ChatSettings,
    events: broadcast::Sender<DispatchEvent>,
    pending: Arc<AtomicUsize>,
}

impl Worker {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<Job>) {
        while let Some(job) = rx.recv().await {
            self.process(job).await;
        }
        tracing::debug!("Dispatcher queue closed");
    }

    fn emit_phase(&self, conversation_id: &str, phase: TurnPhase) {
        let _ = self.events.send(DispatchEvent::Phase {
            conversation_id: conversation_id.to_string(),
            phase,
        });
    }

    async fn process(&self, job: Job) {
        let Job {
            conversation_id,
            history,
            title_from,
            reply_tx,
        } = job;

        if let Some(text) = title_from {
            self.name_conversation(&conversation_id, &history, &text).await;
        }

        let search_context = self.search_context(&history).await;
        let request = self.build_request(&history, search_context);
        let outcome = self.request_with_retry(&conversation_id, request).await;

        let (content, phase, result) = match outcome {
            Ok(reply) => (reply.clone(), TurnPhase::ReplyAppended, Ok(reply)),
            Err(e) => {
                tracing::error!(conversation_id = %conversation_id, "Error sending message: {}", e);
                self.emit_phase(&conversation_id, TurnPhase::FailedPermanently);
                (FALLBACK_REPLY.to_string(), TurnPhase::FallbackAppended, Err(e))
            }
        };

        let appended = {
            let mut store = lock_store(&self.store);
            match store.append_message(&conversation_id, Message::assistant(content)) {
                Ok(appended) => appended,
                Err(e) => {
                    // The reply is in memory even though the write failed.
                    tracing::error!("Failed to save reply: {}", e);
                    true
                }
            }
        };

        let result = if appended {
            self.emit_phase(&conversation_id, phase);
            result
        } else {
            tracing::warn!(
                conversation_id = %conversation_id,
                "Conversation was deleted while awaiting its reply; discarding it"
            );
            Err(DispatchError::Discarded(conversation_id.clone()))
        };

        self.pending.fetch_sub(1, Ordering::SeqCst);
        self.emit_phase(&conversation_id, TurnPhase::Idle);
        let _ = reply_tx.send(result);
    }

    fn system_prompt(&self) -> String {
        match &self.settings.system_prompt {
            Some(prompt) if !prompt.trim().is_empty() => prompt.clone(),
            _ => persona_prompt(Utc::now()),
        }
    }

    fn build_request(&self, history: &[Message], search_context: Option<String>) -> ChatRequest {
        let mut messages = vec![Message::system(self.system_prompt())];
        if let Some(context) = search_context {
            messages.push(Message::system(context));
        }
        messages.extend(self.settings.context.apply(history));

        ChatRequest::new(&self.settings.model, messages).with_sampling(
            self.settings.temperature,
            self.settings.max_tokens,
            self.settings.top_p,
        )
    }

    async fn request_with_retry(
        &self,
        conversation_id: &str,
        request: ChatRequest,
    ) -> Result<String, DispatchError> {
        let max_attempts = self.settings.max_retries + 1;
        let mut delay = self.settings.retry_base_delay();
        let mut attempt = 1;

        loop {
            self.emit_phase(conversation_id, TurnPhase::AwaitingReply { attempt });

            match self.attempt(conversation_id, &request).await {
                Ok(reply) => return Ok(reply),
                Err(e) if attempt < max_attempts => {
                    tracing::warn!(
                        attempt,
                        "Completion failed: {}. Retrying in {}ms...",
                        e,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(DispatchError::Exhausted {
                        attempts: attempt,
                        last_error: e,
                    })
                }
            }
        }
    }

    /// One attempt walks the model chain; it fails only when every model
    /// fails.
    async fn attempt(
        &self,
        conversation_id: &str,
        request: &ChatRequest,
    ) -> Result<String, ProviderError> {
        let mut last_error = None;

        for model in self.settings.model_chain() {
            let mut request = request.clone();
            request.model = model.to_string();

            match self.call_model(conversation_id, request).await {
                Ok(reply) => return Ok(reply),
                Err(e) => {
                    tracing::warn!(model, "Error with model: {}", e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| ProviderError::RequestFailed("No model configured".to_string())))
    }

    async fn call_model(
        &self,
        conversation_id: &str,
        request: ChatRequest,
    ) -> Result<String, ProviderError> {
        let timeout = self.settings.request_timeout();
        let call = async {
            if self.settings.stream_responses {
                self.stream_reply(conversation_id, request).await
            } else {
                self.provider.complete(request).await.map(|r| r.content)
            }
        };

        tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| ProviderError::Timeout(timeout.as_secs()))?
    }

    async fn stream_reply(
        &self,
        conversation_id: &str,
        request: ChatRequest,
    ) -> Result<String, ProviderError> {
        let (tx, mut rx) = mpsc::channel::<StreamEvent>(64);

        let producer = self.provider.stream(request, tx);
        // Owns `rx` so an early return unblocks the producer.
        let consumer = async move {
            let mut accumulated = String::new();
            while let Some(event) = rx.recv().await {
                match event {
                    StreamEvent::Token(token) => {
                        accumulated.push_str(&token);
                        let _ = self.events.send(DispatchEvent::Token {
                            conversation_id: conversation_id.to_string(),
                            accumulated: accumulated.clone(),
                        });
                    }
                    StreamEvent::Done { .. } => return Ok(accumulated),
                    StreamEvent::Error(e) => return Err(ProviderError::NetworkError(e)),
                }
            }
            Err(ProviderError::InvalidResponse(
                "Stream ended unexpectedly".to_string(),
            ))
        };

        let (sent, received) = tokio::join!(producer, consumer);
        sent?;
        received
    }

    /// One-shot helper request (naming, search decisions); no retries.
    async fn ask(
        &self,
        history: &[Message],
        instruction: Message,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, ProviderError> {
        let mut messages = self.settings.context.apply(history);
        messages.push(instruction);
        let request = ChatRequest::new(&self.settings.model, messages).with_sampling(
            temperature,
            max_tokens,
            1.0,
        );

        let timeout = self.settings.request_timeout();
        let response = tokio::time::timeout(timeout, self.provider.complete(request))
            .await
            .map_err(|_| ProviderError::Timeout(timeout.as_secs()))??;
        Ok(answer_text(&response.content))
    }

    async fn name_conversation(&self, conversation_id: &str, history: &[Message], text: &str) {
        let prompt = naming_prompt(&self.settings.context.apply(history), text);
        let request = ChatRequest::new(&self.settings.model, prompt).with_sampling(0.5, 256, 1.0);
        let timeout = self.settings.request_timeout();

        let name = match tokio::time::timeout(timeout, self.provider.complete(request)).await {
            Ok(Ok(response)) => clean_title(&response.content),
            Ok(Err(e)) => {
                tracing::warn!("Failed to generate conversation title: {}", e);
                None
            }
            Err(_) => {
                tracing::warn!("Timed out generating conversation title");
                None
            }
        }
        .unwrap_or_else(|| truncate_title(text));

        let renamed = {
            let mut store = lock_store(&self.store);
            match store.set_name_if_unnamed(conversation_id, &name) {
                Ok(renamed) => renamed,
                Err(e) => {
                    tracing::error!("Failed to save conversation name: {}", e);
                    true
                }
            }
        };

        if renamed {
            tracing::debug!(conversation_id = %conversation_id, %name, "Named conversation");
            let _ = self.events.send(DispatchEvent::Renamed {
                conversation_id: conversation_id.to_string(),
                name,
            });
        }
    }

    /// Search results for the latest message, or `None` when searching is
    /// disabled, unnecessary, or failed.
    async fn search_context(&self, history: &[Message]) -> Option<String> {
        let search = self.search.as_ref()?;

        match self.settings.search_mode {
            SearchMode::Off => return None,
            SearchMode::Always => {}
            SearchMode::Auto => {
                let decision = self
                    .ask(history, Message::system(SEARCH_DECISION_PROMPT), 0.5, 3)
                    .await;
                match decision {
                    Ok(answer) if answer.trim().to_lowercase().starts_with("yes") => {}
                    Ok(_) => return None,
                    Err(e) => {
                        tracing::warn!("Search decision failed: {}", e);
                        return None;
                    }
                }
            }
        }

        let query = match self
            .ask(history, Message::user(SEARCH_TERM_PROMPT), 0.7, 100)
            .await
        {
            Ok(term) => term.trim().trim_matches('"').trim().to_string(),
            Err(e) => {
                tracing::warn!("Failed to pick a search term: {}", e);
                return None;
            }
        };
        if query.is_empty() {
            return None;
        }

        match search.search(&query).await {
            Ok(results) => format_search_results(&results),
            Err(e) => {
                tracing::warn!("Search failed, continuing without it: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::time::Instant;

    use super::*;
    use crate::models::Role;
    use crate::providers::{ChatResponse, ModelInfo};
    use crate::services::storage::MemoryStorage;
    use crate::services::store::ConversationStore;

    type Scripted = (Duration, Result<String, String>);

    /// Answers helper prompts (titles, search terms) directly and serves
    /// scripted replies for everything else.
    struct MockProvider {
        replies: Mutex<VecDeque<Scripted>>,
        requests: Mutex<Vec<ChatRequest>>,
        title: Option<String>,
        broken_model: Option<String>,
    }

    impl MockProvider {
        fn new(replies: Vec<Scripted>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                requests: Mutex::new(Vec::new()),
                title: Some("Test Title".to_string()),
                broken_model: None,
            })
        }

        /// Every request for `model` fails without consuming a scripted reply.
        fn with_broken_model(model: &str, replies: Vec<Scripted>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                requests: Mutex::new(Vec::new()),
                title: Some("Test Title".to_string()),
                broken_model: Some(model.to_string()),
            })
        }

        fn without_title(replies: Vec<Scripted>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                requests: Mutex::new(Vec::new()),
                title: None,
                broken_model: None,
            })
        }

        fn requests(&self) -> Vec<ChatRequest> {
            self.requests.lock().unwrap().clone()
        }

        fn helper_reply(&self, request: &ChatRequest) -> Option<Result<String, ProviderError>> {
            let last = request.messages.last()?.content.as_str();
            if last.starts_with("Make 1 short title") {
                Some(
                    self.title
                        .clone()
                        .ok_or_else(|| ProviderError::RequestFailed("no title".to_string())),
                )
            } else if last.starts_with("Determine the most appropriate search term") {
                Some(Ok("\"rust news\"".to_string()))
            } else if last.starts_with("Decide if a search is necessary") {
                Some(Ok("yes".to_string()))
            } else {
                None
            }
        }

        async fn next_reply(&self, request: ChatRequest) -> Result<String, ProviderError> {
            let broken = self.broken_model.as_deref() == Some(request.model.as_str());
            self.requests.lock().unwrap().push(request);
            if broken {
                return Err(ProviderError::RequestFailed("model unavailable".to_string()));
            }
            let (delay, reply) = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or((Duration::ZERO, Err("no scripted reply".to_string())));
            tokio::time::sleep(delay).await;
            reply.map_err(ProviderError::RequestFailed)
        }
    }

    #[async_trait]
    impl CompletionProvider for MockProvider {
        async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
            let content = match self.helper_reply(&request) {
                Some(reply) => reply?,
                None => self.next_reply(request).await?,
            };
            Ok(ChatResponse {
                content,
                model: "mock".to_string(),
                tokens_in: None,
                tokens_out: None,
            })
        }

        async fn stream(
            &self,
            request: ChatRequest,
            tx: mpsc::Sender<StreamEvent>,
        ) -> Result<(), ProviderError> {
            let reply = self.next_reply(request).await?;
            for token in reply.split_inclusive(' ') {
                let _ = tx.send(StreamEvent::Token(token.to_string())).await;
            }
            let _ = tx
                .send(StreamEvent::Done {
                    tokens_in: None,
                    tokens_out: None,
                })
                .await;
            Ok(())
        }

        async fn list_models(&self) -> Result<Vec<ModelInfo>, ProviderError> {
            Ok(Vec::new())
        }
    }

    struct MockSearch {
        results: Result<Vec<SearchResult>, String>,
        queries: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SearchProvider for MockSearch {
        async fn search(&self, query: &str) -> Result<Vec<SearchResult>, ProviderError> {
            self.queries.lock().unwrap().push(query.to_string());
            self.results
                .clone()
                .map_err(ProviderError::NetworkError)
        }
    }

    fn ok(text: &str) -> Scripted {
        (Duration::ZERO, Ok(text.to_string()))
    }

    fn fail(text: &str) -> Scripted {
        (Duration::ZERO, Err(text.to_string()))
    }

    fn new_store() -> SharedStore {
        ConversationStore::open(Arc::new(MemoryStorage::new()))
            .unwrap()
            .into_shared()
    }

    fn dispatcher(provider: Arc<MockProvider>, settings: ChatSettings) -> Dispatcher {
        Dispatcher::spawn(new_store(), provider, None, settings)
    }

    fn active_messages(dispatcher: &Dispatcher) -> Vec<Message> {
        lock_store(&dispatcher.store()).active().messages.clone()
    }

    fn phases(rx: &mut broadcast::Receiver<DispatchEvent>) -> Vec<TurnPhase> {
        let mut phases = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let DispatchEvent::Phase { phase, .. } = event {
                phases.push(phase);
            }
        }
        phases
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_appends_reply() {
        let provider = MockProvider::new(vec![ok("Hi there")]);
        let dispatcher = dispatcher(provider.clone(), ChatSettings::default());

        let handle = dispatcher.send("Hello").unwrap();
        assert!(dispatcher.is_loading());
        assert_eq!(active_messages(&dispatcher), vec![Message::user("Hello")]);

        assert_eq!(handle.wait().await.unwrap(), "Hi there");
        assert!(!dispatcher.is_loading());
        assert_eq!(
            active_messages(&dispatcher),
            vec![Message::user("Hello"), Message::assistant("Hi there")]
        );

        let requests = provider.requests();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert_eq!(request.model, "deepseek-r1-distill-llama-70b");
        assert_eq!(request.temperature, Some(0.5));
        assert_eq!(request.max_tokens, Some(1024));
        assert_eq!(request.messages[0].role, Role::System);
        assert!(request.messages[0].content.contains("Arda"));
        assert_eq!(request.messages[1], Message::user("Hello"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_blank_send_is_ignored() {
        let provider = MockProvider::new(vec![ok("unused")]);
        let dispatcher = dispatcher(provider.clone(), ChatSettings::default());

        assert!(dispatcher.send("   \n").is_none());
        assert!(!dispatcher.is_loading());
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(provider.requests().is_empty());
        assert!(active_messages(&dispatcher).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replies_follow_request_order() {
        let provider = MockProvider::new(vec![
            (Duration::from_secs(3), Ok("reply A".to_string())),
            ok("reply B"),
        ]);
        let dispatcher = dispatcher(provider.clone(), ChatSettings::default());

        let first = dispatcher.send("A").unwrap();
        let second = dispatcher.send("B").unwrap();

        assert_eq!(second.wait().await.unwrap(), "reply B");
        assert_eq!(first.wait().await.unwrap(), "reply A");

        let contents: Vec<String> = active_messages(&dispatcher)
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["A", "B", "reply A", "reply B"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_append_fallback() {
        let provider = MockProvider::new(vec![fail("boom"); 4]);
        let dispatcher = dispatcher(provider.clone(), ChatSettings::default());
        let start = Instant::now();

        let handle = dispatcher.send("Hello").unwrap();
        let err = handle.wait().await.unwrap_err();

        assert!(matches!(err, DispatchError::Exhausted { attempts: 4, .. }));
        assert_eq!(provider.requests().len(), 4);
        assert!(start.elapsed() >= Duration::from_secs(7));
        assert!(!dispatcher.is_loading());

        let messages = active_messages(&dispatcher);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1], Message::assistant(FALLBACK_REPLY));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers() {
        let provider = MockProvider::new(vec![fail("busy"), ok("finally")]);
        let dispatcher = dispatcher(provider.clone(), ChatSettings::default());

        let reply = dispatcher.send("Hello").unwrap().wait().await.unwrap();

        assert_eq!(reply, "finally");
        assert_eq!(provider.requests().len(), 2);
        assert_eq!(active_messages(&dispatcher)[1], Message::assistant("finally"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fourth_attempt_succeeds_after_full_backoff() {
        let provider = MockProvider::new(vec![fail("a"), fail("b"), fail("c"), ok("fourth")]);
        let dispatcher = dispatcher(provider.clone(), ChatSettings::default());
        let start = Instant::now();

        let reply = dispatcher.send("Hello").unwrap().wait().await.unwrap();

        assert_eq!(reply, "fourth");
        assert_eq!(provider.requests().len(), 4);
        assert!(start.elapsed() >= Duration::from_secs(7));
        assert!(start.elapsed() < Duration::from_secs(8));
        assert_eq!(active_messages(&dispatcher)[1], Message::assistant("fourth"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_reply_is_appended_as_is() {
        let provider = MockProvider::new(vec![ok(""), ok("unused")]);
        let dispatcher = dispatcher(provider.clone(), ChatSettings::default());

        let reply = dispatcher.send("Hello").unwrap().wait().await.unwrap();

        assert_eq!(reply, "");
        assert_eq!(provider.requests().len(), 1);
        assert_eq!(active_messages(&dispatcher)[1], Message::assistant(""));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_model_falls_back_to_next() {
        let provider = MockProvider::with_broken_model("model-a", vec![ok("from b")]);
        let settings = ChatSettings {
            model: "model-a".to_string(),
            fallback_models: vec!["model-b".to_string()],
            ..ChatSettings::default()
        };
        let dispatcher = dispatcher(provider.clone(), settings);
        let mut rx = dispatcher.subscribe();

        let reply = dispatcher.send("Hello").unwrap().wait().await.unwrap();

        assert_eq!(reply, "from b");
        let models: Vec<String> = provider.requests().into_iter().map(|r| r.model).collect();
        assert_eq!(models, vec!["model-a", "model-b"]);
        // Both models were tried within the first attempt.
        assert!(!phases(&mut rx).contains(&TurnPhase::AwaitingReply { attempt: 2 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_is_loading_until_every_queued_reply_lands() {
        let provider = MockProvider::new(vec![
            (Duration::from_secs(3), Ok("reply A".to_string())),
            (Duration::from_secs(2), Ok("reply B".to_string())),
        ]);
        let dispatcher = dispatcher(provider, ChatSettings::default());

        let first = dispatcher.send("A").unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        let second = dispatcher.send("B").unwrap();
        assert_eq!(dispatcher.pending.load(Ordering::SeqCst), 2);

        assert_eq!(first.wait().await.unwrap(), "reply A");
        assert!(dispatcher.is_loading());
        assert_eq!(dispatcher.pending.load(Ordering::SeqCst), 1);

        assert_eq!(second.wait().await.unwrap(), "reply B");
        assert!(!dispatcher.is_loading());
        assert_eq!(dispatcher.pending.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_attempt_times_out() {
        let provider = MockProvider::new(vec![
            (Duration::from_secs(31), Ok("late".to_string())),
            ok("on time"),
        ]);
        let dispatcher = dispatcher(provider.clone(), ChatSettings::default());
        let start = Instant::now();

        let reply = dispatcher.send("Hello").unwrap().wait().await.unwrap();

        assert_eq!(reply, "on time");
        assert!(start.elapsed() >= Duration::from_secs(31));
        assert!(start.elapsed() < Duration::from_secs(32));
    }

    #[tokio::test(start_paused = true)]
    async fn test_edit_resends_truncated_history() {
        let provider = MockProvider::new(vec![ok("one"), ok("two"), ok("edited reply")]);
        let dispatcher = dispatcher(provider.clone(), ChatSettings::default());

        dispatcher.send("first").unwrap().wait().await.unwrap();
        dispatcher.send("second").unwrap().wait().await.unwrap();
        assert_eq!(active_messages(&dispatcher).len(), 4);

        let handle = dispatcher.edit(0, "changed").unwrap().unwrap();
        assert_eq!(active_messages(&dispatcher), vec![Message::user("changed")]);

        assert_eq!(handle.wait().await.unwrap(), "edited reply");
        assert_eq!(
            active_messages(&dispatcher),
            vec![Message::user("changed"), Message::assistant("edited reply")]
        );

        let last = provider.requests().pop().unwrap();
        assert_eq!(last.messages.len(), 2);
        assert_eq!(last.messages[1], Message::user("changed"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_edit_and_delete_reject_assistant_messages() {
        let provider = MockProvider::new(vec![ok("reply")]);
        let dispatcher = dispatcher(provider.clone(), ChatSettings::default());
        dispatcher.send("question").unwrap().wait().await.unwrap();

        assert!(matches!(
            dispatcher.edit(1, "nope"),
            Err(StoreError::NotUserMessage { index: 1, .. })
        ));
        assert!(matches!(
            dispatcher.delete(5),
            Err(StoreError::IndexOutOfRange { index: 5, len: 2 })
        ));
        assert!(dispatcher.edit(0, "  ").unwrap().is_none());
        assert_eq!(active_messages(&dispatcher).len(), 2);

        dispatcher.delete(0).unwrap();
        assert!(active_messages(&dispatcher).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_failure_degrades() {
        let provider = MockProvider::new(vec![ok("answer without search")]);
        let search = Arc::new(MockSearch {
            results: Err("quota exceeded".to_string()),
            queries: Mutex::new(Vec::new()),
        });
        let settings = ChatSettings {
            search_mode: SearchMode::Always,
            ..ChatSettings::default()
        };
        let dispatcher = Dispatcher::spawn(new_store(), provider.clone(), Some(search.clone()), settings);

        let reply = dispatcher.send("latest news?").unwrap().wait().await.unwrap();

        assert_eq!(reply, "answer without search");
        assert_eq!(*search.queries.lock().unwrap(), vec!["rust news".to_string()]);
        let request = &provider.requests()[0];
        let system_count = request
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .count();
        assert_eq!(system_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_results_are_injected() {
        let provider = MockProvider::new(vec![ok("see the link")]);
        let search = Arc::new(MockSearch {
            results: Ok(vec![SearchResult {
                title: "Rust 2.0".to_string(),
                link: "https://example.com/rust".to_string(),
                snippet: "News".to_string(),
            }]),
            queries: Mutex::new(Vec::new()),
        });
        let settings = ChatSettings {
            search_mode: SearchMode::Auto,
            ..ChatSettings::default()
        };
        let dispatcher = Dispatcher::spawn(new_store(), provider.clone(), Some(search), settings);

        dispatcher.send("what's new in rust?").unwrap().wait().await.unwrap();

        let request = &provider.requests()[0];
        assert_eq!(request.messages[1].role, Role::System);
        assert!(request.messages[1]
            .content
            .starts_with("Provide links used in relevant searched information"));
        assert!(request.messages[1].content.contains("https://example.com/rust"));
        assert_eq!(request.messages[2], Message::user("what's new in rust?"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_for_deleted_conversation_is_discarded() {
        let provider = MockProvider::new(vec![(Duration::from_secs(5), Ok("late".to_string()))]);
        let dispatcher = dispatcher(provider.clone(), ChatSettings::default());

        let handle = dispatcher.send("Hello").unwrap();
        let store = dispatcher.store();
        let deleted_id = lock_store(&store).active_id().to_string();
        lock_store(&store).delete_conversation(&deleted_id).unwrap();

        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err, DispatchError::Discarded(id) if id == deleted_id));
        assert!(!dispatcher.is_loading());

        let store = lock_store(&store);
        assert!(store.get(&deleted_id).is_none());
        assert!(store.active().messages.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_lands_in_original_conversation() {
        let provider = MockProvider::new(vec![(Duration::from_secs(2), Ok("reply".to_string()))]);
        let dispatcher = dispatcher(provider.clone(), ChatSettings::default());
        let store = dispatcher.store();

        let handle = dispatcher.send("Hello").unwrap();
        let original_id = lock_store(&store).active_id().to_string();
        lock_store(&store).new_conversation().unwrap();

        handle.wait().await.unwrap();

        let store = lock_store(&store);
        assert_ne!(store.active_id(), original_id);
        assert!(store.active().messages.is_empty());
        let original = store.get(&original_id).unwrap();
        assert_eq!(original.messages.last(), Some(&Message::assistant("reply")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_phase_sequence_on_success() {
        let provider = MockProvider::new(vec![ok("Hi")]);
        let dispatcher = dispatcher(provider, ChatSettings::default());
        let mut rx = dispatcher.subscribe();

        dispatcher.send("Hello").unwrap().wait().await.unwrap();

        assert_eq!(
            phases(&mut rx),
            vec![
                TurnPhase::UserMessageAppended,
                TurnPhase::AwaitingReply { attempt: 1 },
                TurnPhase::ReplyAppended,
                TurnPhase::Idle,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_phase_sequence_on_failure() {
        let provider = MockProvider::new(vec![fail("a"), fail("b"), fail("c"), fail("d")]);
        let dispatcher = dispatcher(provider, ChatSettings::default());
        let mut rx = dispatcher.subscribe();

        let _ = dispatcher.send("Hello").unwrap().wait().await;

        assert_eq!(
            phases(&mut rx),
            vec![
                TurnPhase::UserMessageAppended,
                TurnPhase::AwaitingReply { attempt: 1 },
                TurnPhase::AwaitingReply { attempt: 2 },
                TurnPhase::AwaitingReply { attempt: 3 },
                TurnPhase::AwaitingReply { attempt: 4 },
                TurnPhase::FailedPermanently,
                TurnPhase::FallbackAppended,
                TurnPhase::Idle,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_streaming_emits_accumulated_tokens() {
        let provider = MockProvider::new(vec![ok("Hello from Arda")]);
        let settings = ChatSettings {
            stream_responses: true,
            ..ChatSettings::default()
        };
        let dispatcher = dispatcher(provider, settings);
        let mut rx = dispatcher.subscribe();

        let reply = dispatcher.send("Hi").unwrap().wait().await.unwrap();
        assert_eq!(reply, "Hello from Arda");

        let mut tokens = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let DispatchEvent::Token { accumulated, .. } = event {
                tokens.push(accumulated);
            }
        }
        assert_eq!(tokens, vec!["Hello ", "Hello from ", "Hello from Arda"]);
        assert_eq!(
            active_messages(&dispatcher).last(),
            Some(&Message::assistant("Hello from Arda"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_message_names_conversation() {
        let provider = MockProvider::new(vec![ok("one"), ok("two")]);
        let dispatcher = dispatcher(provider, ChatSettings::default());
        let mut rx = dispatcher.subscribe();

        dispatcher.send("Plan my week").unwrap().wait().await.unwrap();
        dispatcher.send("And the weekend").unwrap().wait().await.unwrap();

        let renames: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|event| match event {
                DispatchEvent::Renamed { name, .. } => Some(name),
                _ => None,
            })
            .collect();
        assert_eq!(renames, vec!["Test Title".to_string()]);
        assert_eq!(
            lock_store(&dispatcher.store()).active().name.as_deref(),
            Some("Test Title")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_naming_falls_back_to_message_text() {
        let provider = MockProvider::without_title(vec![ok("sure")]);
        let dispatcher = dispatcher(provider, ChatSettings::default());

        dispatcher
            .send("Help me plan a trip\nto the mountains")
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(
            lock_store(&dispatcher.store()).active().name.as_deref(),
            Some("Help me plan a trip")
        );
    }

    #[test]
    fn test_persona_prompt_mentions_time() {
        let now = DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let prompt = persona_prompt(now);
        assert!(prompt.contains("Arda"));
        assert!(prompt.contains("Wed, 1 May 2024 12:00:00 +0000"));
    }
}
