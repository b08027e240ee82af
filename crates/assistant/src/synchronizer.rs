//! Decides when the working buffer is written to the store and when it is
//! replaced from it.
//!
//! Writes happen once per streaming episode, on the edge out of `Streaming`.
//! Loads happen on selection changes and never erase an optimistic buffer for a
//! conversation the store has nothing for yet. Both are idempotent: an unchanged
//! commit does not touch the store and an unchanged load publishes nothing.

use parking_lot::Mutex;
use shared::{AssistantError, ConversationId, Message, StreamStatus, UiEvent};
use std::collections::HashMap;
use std::sync::Arc;
use store::ConversationStore;
use tracing::{debug, info, warn};

use crate::outbox::Outbox;
use crate::session::SessionState;

/// Edge detector for one streaming episode
#[derive(Debug, Default)]
pub struct CommitGate {
    was_streaming: bool,
    pending: bool,
    committed: bool,
}

impl CommitGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a status transition. Leaving `Streaming` arms the commit; staying in
    /// or re-entering it does not.
    pub fn observe(&mut self, status: StreamStatus) {
        if status.is_streaming() {
            self.was_streaming = true;
        } else if self.was_streaming {
            self.was_streaming = false;
            self.pending = !self.committed;
        }
    }

    /// Claim the episode's single commit. `force` claims it even without a
    /// streaming edge (error paths persist what they have).
    pub fn take(&mut self, force: bool) -> bool {
        if self.committed || !(self.pending || force) {
            return false;
        }
        self.committed = true;
        self.pending = false;
        true
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Written,
    /// Identical to the last write or load, nothing sent to the store
    Unchanged,
    /// Nothing to save
    Empty,
}

/// What to do when the store has no messages for a newly selected conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EmptyStore {
    KeepBuffer,
    ClearBuffer,
}

pub struct PersistenceSynchronizer {
    store: Arc<dyn ConversationStore>,
    outbox: Arc<Outbox>,
    session: Mutex<SessionState>,
    /// Last message list known to match the store, per conversation
    last_committed: Mutex<HashMap<ConversationId, Vec<Message>>>,
    /// Latest buffer of each streaming episode, whether or not it is on screen
    in_flight: Mutex<HashMap<ConversationId, Vec<Message>>>,
    /// Buffers whose write failed, retried on the next reconcile
    unsaved: Mutex<HashMap<ConversationId, Vec<Message>>>,
}

impl PersistenceSynchronizer {
    pub fn new(store: Arc<dyn ConversationStore>, outbox: Arc<Outbox>) -> Self {
        Self {
            store,
            outbox,
            session: Mutex::new(SessionState::default()),
            last_committed: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            unsaved: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    pub fn selected(&self) -> Option<ConversationId> {
        self.session.lock().selected.clone()
    }

    pub fn buffer(&self) -> Vec<Message> {
        self.session.lock().buffer.clone()
    }

    /// Selected conversation with its buffer, read atomically. `None` while the
    /// buffer still belongs to the previous selection.
    pub fn current(&self) -> Option<(ConversationId, Vec<Message>)> {
        let session = self.session.lock();
        session
            .settled()
            .map(|(id, buffer)| (id.clone(), buffer.to_vec()))
    }

    /// Messages a new episode in `id` builds on: the working buffer when it
    /// belongs to `id`, else a buffer whose write failed, else the store
    pub(crate) async fn history(&self, id: &ConversationId) -> Result<Vec<Message>, AssistantError> {
        if let Some((selected, buffer)) = self.current() {
            if selected == *id {
                return Ok(buffer);
            }
        }
        let unsaved = self.unsaved.lock().get(id).cloned();
        if let Some(messages) = unsaved {
            return Ok(messages);
        }
        match self.store.get(id).await {
            Ok(Some(conversation)) => Ok(conversation.messages),
            Ok(None) => Err(AssistantError::ConversationNotFound(id.clone())),
            Err(e) => Err(AssistantError::PersistenceLoadFailed {
                id: id.clone(),
                reason: e.to_string(),
            }),
        }
    }

    /// Write `messages` as the conversation's full list unless that is already
    /// what the store holds
    pub async fn commit(
        &self,
        id: &ConversationId,
        messages: &[Message],
    ) -> Result<CommitOutcome, AssistantError> {
        if messages.is_empty() {
            debug!(conversation = %id, "nothing to commit");
            return Ok(CommitOutcome::Empty);
        }
        if self.last_committed.lock().get(id).map(Vec::as_slice) == Some(messages) {
            debug!(conversation = %id, "commit skipped, store already current");
            return Ok(CommitOutcome::Unchanged);
        }

        match self.store.update_messages(id, messages).await {
            Ok(()) => {
                info!(conversation = %id, count = messages.len(), "conversation saved");
                self.last_committed.lock().insert(id.clone(), messages.to_vec());
                self.unsaved.lock().remove(id);
                Ok(CommitOutcome::Written)
            }
            Err(e) => {
                warn!(conversation = %id, "save failed: {}", e);
                self.unsaved.lock().insert(id.clone(), messages.to_vec());
                let err = AssistantError::PersistenceWriteFailed {
                    id: id.clone(),
                    reason: e.to_string(),
                };
                self.outbox.publish(UiEvent::from_error(&err));
                Err(err)
            }
        }
    }

    /// Select `id`, replacing the buffer with stored messages when there are any.
    /// An empty or missing record leaves the buffer as it is.
    pub async fn select(&self, id: Option<ConversationId>) -> Result<(), AssistantError> {
        self.load(id, EmptyStore::KeepBuffer).await
    }

    /// Select `id` on the user's behalf: like [`select`](Self::select) but an
    /// empty conversation shows an empty buffer rather than the previous one
    pub async fn open(&self, id: Option<ConversationId>) -> Result<(), AssistantError> {
        self.load(id, EmptyStore::ClearBuffer).await
    }

    /// Save anything the store is behind on: failed writes, and the selected
    /// buffer when no episode owns it. Returns the first failure.
    pub async fn reconcile(&self) -> Result<(), AssistantError> {
        let mut work: Vec<(ConversationId, Vec<Message>)> = self.unsaved.lock().drain().collect();

        if let Some((id, buffer)) = self.current() {
            let owned_by_episode = self.in_flight.lock().contains_key(&id);
            let behind = self.last_committed.lock().get(&id) != Some(&buffer);
            if !buffer.is_empty() && !owned_by_episode && behind && !work.iter().any(|(w, _)| *w == id) {
                work.push((id, buffer));
            }
        }

        let mut first_error = None;
        for (id, messages) in work {
            if self.in_flight.lock().contains_key(&id) {
                // the episode will write a newer version when it settles
                continue;
            }
            if let Err(e) = self.commit(&id, &messages).await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// A conversation was deleted: drop what is known about it and deselect it
    pub fn forget(&self, id: &ConversationId) {
        self.last_committed.lock().remove(id);
        self.unsaved.lock().remove(id);
        let mut session = self.session.lock();
        if session.is_selected(id) {
            session.selected = None;
            session.owner = None;
            session.generation += 1;
            session.buffer.clear();
            self.outbox.publish(UiEvent::Selected {
                conversation_id: None,
            });
            self.outbox.publish(UiEvent::messages(None, Vec::new()));
        }
    }

    pub(crate) fn begin_episode(&self, id: &ConversationId, buffer: &[Message]) {
        self.in_flight.lock().insert(id.clone(), buffer.to_vec());
    }

    pub(crate) fn end_episode(&self, id: &ConversationId) {
        self.in_flight.lock().remove(id);
    }

    /// Record an episode's latest buffer and show it if its conversation is
    /// still the selected one
    pub(crate) fn mirror(&self, id: &ConversationId, messages: Vec<Message>) {
        if let Some(snapshot) = self.in_flight.lock().get_mut(id) {
            snapshot.clone_from(&messages);
        }
        let mut session = self.session.lock();
        if session.is_selected(id) {
            session.buffer.clone_from(&messages);
            session.owner = Some(id.clone());
            self.outbox.publish(UiEvent::messages(Some(id.clone()), messages));
        }
    }

    async fn load(&self, id: Option<ConversationId>, on_empty: EmptyStore) -> Result<(), AssistantError> {
        let previous = self.selected();
        if previous.is_some() && previous != id {
            if let Err(e) = self.reconcile().await {
                warn!("switching conversations with unsaved changes: {}", e);
            }
        }

        let generation = {
            let mut session = self.session.lock();
            session.generation += 1;
            if session.selected != id {
                session.selected = id.clone();
                self.outbox.publish(UiEvent::Selected {
                    conversation_id: id.clone(),
                });
            }
            session.generation
        };

        let Some(id) = id else {
            let mut session = self.session.lock();
            if session.generation == generation {
                session.owner = None;
                if !session.buffer.is_empty() {
                    session.buffer.clear();
                    self.outbox.publish(UiEvent::messages(None, Vec::new()));
                }
            }
            return Ok(());
        };

        // An episode or a failed write knows more than the store does
        let local = self
            .in_flight
            .lock()
            .get(&id)
            .cloned()
            .or_else(|| self.unsaved.lock().get(&id).cloned());
        let loaded = match local {
            Some(messages) => Ok(Some(messages)),
            None => self
                .store
                .get(&id)
                .await
                .map(|found| found.map(|c| c.messages)),
        };

        let mut session = self.session.lock();
        if session.generation != generation {
            debug!(conversation = %id, "load superseded by a newer selection");
            return Ok(());
        }
        session.owner = Some(id.clone());

        // An episode that began while the store was being read is newer
        let episode = self.in_flight.lock().get(&id).cloned();
        let loaded = match episode {
            Some(messages) => Ok(Some(messages)),
            None => loaded,
        };

        match loaded {
            Ok(Some(messages)) if !messages.is_empty() => {
                if !self.unsaved.lock().contains_key(&id) && !self.in_flight.lock().contains_key(&id) {
                    self.last_committed.lock().insert(id.clone(), messages.clone());
                }
                if session.buffer == messages {
                    debug!(conversation = %id, "buffer already matches, nothing to publish");
                    return Ok(());
                }
                session.buffer.clone_from(&messages);
                self.outbox.publish(UiEvent::messages(Some(id), messages));
                Ok(())
            }
            Ok(found) => {
                if found.is_none() {
                    warn!(conversation = %id, "selected conversation is not in the store");
                }
                if on_empty == EmptyStore::ClearBuffer && !session.buffer.is_empty() {
                    session.buffer.clear();
                    self.outbox.publish(UiEvent::messages(Some(id), Vec::new()));
                } else {
                    debug!(conversation = %id, "store empty, keeping working buffer");
                }
                Ok(())
            }
            Err(e) => {
                warn!(conversation = %id, "load failed, showing an empty conversation: {}", e);
                let err = AssistantError::PersistenceLoadFailed {
                    id: id.clone(),
                    reason: e.to_string(),
                };
                session.buffer.clear();
                self.outbox.publish(UiEvent::messages(Some(id), Vec::new()));
                self.outbox.publish(UiEvent::from_error(&err));
                Err(err)
            }
        }
    }
}
