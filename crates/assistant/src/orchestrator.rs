//! Drives one "user message → assistant reply" cycle.
//!
//! `Idle → ConversationEnsured → UserTurnAppended → Streaming → Settled`. The
//! conversation id is captured when the conversation is ensured and everything
//! afterwards (mirroring, the final write) targets that id, so switching
//! conversations mid-reply cannot redirect the episode.
//!
//! Turns in one conversation run one at a time. A second send waits for the
//! first reply to settle and builds on its final transcript.

use parking_lot::Mutex;
use providers::{StreamingTransport, TransportEvent};
use shared::{AssistantError, ConversationId, Message, MessageId, StreamStatus, UiEvent};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as TurnLock, OwnedMutexGuard};
use store::{derive_title, DEFAULT_TITLE};
use tracing::{debug, error, info, warn};

use crate::commands::{HostCommand, PreparedRequest};
use crate::prompts;
use crate::synchronizer::{CommitGate, PersistenceSynchronizer};

const INTERRUPTED: &str = "The reply was interrupted before it finished.";

pub struct Orchestrator {
    transport: Arc<StreamingTransport>,
    sync: Arc<PersistenceSynchronizer>,
    history_window: usize,
    title_max_chars: usize,
    turns: Mutex<HashMap<ConversationId, Arc<TurnLock<()>>>>,
}

impl Orchestrator {
    pub fn new(
        transport: Arc<StreamingTransport>,
        sync: Arc<PersistenceSynchronizer>,
        history_window: usize,
        title_max_chars: usize,
    ) -> Self {
        Self {
            transport,
            sync,
            history_window,
            title_max_chars,
            turns: Mutex::new(HashMap::new()),
        }
    }

    /// Send a chat message typed by the user
    pub async fn send(&self, text: &str) -> Result<ConversationId, AssistantError> {
        self.execute(PreparedRequest::chat(text)).await
    }

    /// Run a command from an external surface as a pre-formed request
    pub async fn run(&self, command: &HostCommand) -> Result<ConversationId, AssistantError> {
        self.execute(command.prepare()).await
    }

    /// Run one episode. Every failure is also published to the UI.
    pub async fn execute(&self, request: PreparedRequest) -> Result<ConversationId, AssistantError> {
        if request.display.trim().is_empty() || request.prompt.trim().is_empty() {
            return Err(self.fail(AssistantError::EmptyPrompt));
        }

        let id = match self.ensure_conversation(&request).await {
            Ok(id) => id,
            Err(e) => return Err(self.fail(e)),
        };
        let turn = self.turn(&id).await;
        let history = match self.sync.history(&id).await {
            Ok(history) => history,
            Err(e) => return Err(self.fail(e)),
        };
        if history.is_empty() {
            let title_source = request.title.as_deref().unwrap_or(&request.display);
            self.retitle_if_default(&id, title_source).await;
        }
        let prompt = prompts::build_prompt(&history, self.history_window, &request.prompt);

        let episode = Episode::begin(self.sync.clone(), id.clone(), history, turn);
        episode.push(Message::user(request.display.trim()));
        episode.start_reply();
        info!(conversation = %id, "reply started");

        let result = self
            .transport
            .submit_observed(&prompt, |event| match event {
                TransportEvent::Status(status) => {
                    episode.observe(status);
                    self.sync.outbox().publish(UiEvent::Status { status });
                }
                TransportEvent::Progress(progress) => {
                    self.sync.outbox().publish(UiEvent::DownloadProgress { progress });
                }
                TransportEvent::Token(text) => episode.append(&text),
            })
            .await;

        match result {
            Ok(()) => {
                episode.settle(None).await;
                Ok(id)
            }
            Err(e) => {
                error!(conversation = %id, "reply failed: {}", e);
                episode.settle(Some(&e)).await;
                Err(self.fail(e))
            }
        }
    }

    fn fail(&self, error: AssistantError) -> AssistantError {
        self.sync.outbox().publish(UiEvent::from_error(&error));
        error
    }

    /// Wait until no other turn is running in `id`
    async fn turn(&self, id: &ConversationId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut turns = self.turns.lock();
            turns.retain(|_, lock| Arc::strong_count(lock) > 1);
            turns.entry(id.clone()).or_default().clone()
        };
        if lock.try_lock().is_err() {
            debug!(conversation = %id, "waiting for the previous reply to settle");
        }
        lock.lock_owned().await
    }

    /// Reuse the selected conversation, or create and select one
    async fn ensure_conversation(&self, request: &PreparedRequest) -> Result<ConversationId, AssistantError> {
        if let Some(id) = self.sync.selected() {
            return Ok(id);
        }

        let title_source = request.title.as_deref().unwrap_or(&request.display);
        let title = derive_title(title_source, self.title_max_chars);
        let conversation = self
            .sync
            .store()
            .create(&title)
            .await
            .map_err(|e| AssistantError::PersistenceWriteFailed {
                id: ConversationId::from("new"),
                reason: e.to_string(),
            })?;
        info!(conversation = %conversation.id, %title, "conversation created");

        if let Err(e) = self.sync.select(Some(conversation.id.clone())).await {
            warn!(conversation = %conversation.id, "selecting new conversation: {}", e);
        }
        self.sync.outbox().publish(UiEvent::ConversationsChanged);
        Ok(conversation.id)
    }

    /// A conversation created empty takes its title from its first message
    async fn retitle_if_default(&self, id: &ConversationId, title_source: &str) {
        let store = self.sync.store();
        let Ok(Some(conversation)) = store.get(id).await else {
            return;
        };
        if conversation.title != DEFAULT_TITLE || !conversation.messages.is_empty() {
            return;
        }
        let title = derive_title(title_source, self.title_max_chars);
        match store.update_title(id, &title).await {
            Ok(()) => self.sync.outbox().publish(UiEvent::ConversationsChanged),
            Err(e) => debug!(conversation = %id, "keeping default title: {}", e),
        }
    }
}

struct EpisodeState {
    buffer: Vec<Message>,
    reply: Option<MessageId>,
    gate: CommitGate,
}

impl EpisodeState {
    fn mark_failed(&mut self, reason: String) {
        let reply = self.reply.clone();
        if let Some(message) = self.buffer.iter_mut().rev().find(|m| Some(&m.id) == reply.as_ref()) {
            message.error = Some(reason);
        }
    }
}

/// Working state of one in-flight reply. Dropping it before it settles (the
/// caller abandoned the future) settles it on the error path in the background.
/// The conversation's turn is held until the episode's write is done.
struct Episode {
    id: ConversationId,
    sync: Arc<PersistenceSynchronizer>,
    state: Mutex<EpisodeState>,
    turn: Option<OwnedMutexGuard<()>>,
    settled: bool,
}

impl Episode {
    fn begin(
        sync: Arc<PersistenceSynchronizer>,
        id: ConversationId,
        buffer: Vec<Message>,
        turn: OwnedMutexGuard<()>,
    ) -> Self {
        sync.begin_episode(&id, &buffer);
        Self {
            id,
            sync,
            turn: Some(turn),
            state: Mutex::new(EpisodeState {
                buffer,
                reply: None,
                gate: CommitGate::new(),
            }),
            settled: false,
        }
    }

    fn push(&self, message: Message) {
        let snapshot = {
            let mut state = self.state.lock();
            state.buffer.push(message);
            state.buffer.clone()
        };
        self.sync.mirror(&self.id, snapshot);
    }

    /// Append the empty assistant turn that tokens accumulate into
    fn start_reply(&self) {
        let placeholder = Message::placeholder();
        self.state.lock().reply = Some(placeholder.id.clone());
        self.push(placeholder);
    }

    fn append(&self, text: &str) {
        let snapshot = {
            let mut state = self.state.lock();
            let reply = state.reply.clone();
            match state.buffer.iter_mut().rev().find(|m| Some(&m.id) == reply.as_ref()) {
                Some(message) => message.content.push_str(text),
                None => return,
            }
            state.buffer.clone()
        };
        self.sync.mirror(&self.id, snapshot);
    }

    fn observe(&self, status: StreamStatus) {
        self.state.lock().gate.observe(status);
    }

    /// Final mirror and the episode's one write. Success writes on the streaming
    /// edge; errors write whatever accumulated, with the reply marked failed.
    async fn settle(mut self, error: Option<&AssistantError>) {
        let (due, messages) = {
            let mut state = self.state.lock();
            if let Some(e) = error {
                state.mark_failed(e.user_message());
            }
            let due = state.gate.take(error.is_some());
            (due, state.buffer.clone())
        };
        self.settled = true;
        self.sync.mirror(&self.id, messages.clone());

        if due {
            if let Err(e) = self.sync.commit(&self.id, &messages).await {
                warn!(conversation = %self.id, "reply kept in memory only: {}", e);
            }
        }
    }
}

impl Drop for Episode {
    fn drop(&mut self) {
        if self.settled {
            self.sync.end_episode(&self.id);
            return;
        }

        let (due, messages) = {
            let mut state = self.state.lock();
            state.mark_failed(INTERRUPTED.to_string());
            (state.gate.take(true), state.buffer.clone())
        };
        warn!(conversation = %self.id, "reply abandoned before it settled");
        self.sync.mirror(&self.id, messages.clone());
        if !due {
            self.sync.end_episode(&self.id);
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let sync = self.sync.clone();
                let id = self.id.clone();
                let turn = self.turn.take();
                handle.spawn(async move {
                    if let Err(e) = sync.commit(&id, &messages).await {
                        warn!(conversation = %id, "partial reply not saved: {}", e);
                    }
                    sync.end_episode(&id);
                    drop(turn);
                });
            }
            Err(_) => {
                warn!(conversation = %self.id, "no runtime left, partial reply not saved");
                self.sync.end_episode(&self.id);
            }
        }
    }
}
