//! Conversation engine.
//!
//! The `ConversationEngine` owns every conversation's context and generation
//! status, drives one generation per conversation at a time against a
//! [`CompletionBackend`], and broadcasts each status change to subscribers.

use crate::context::ConversationContext;
use crate::history::HistoryConfig;
use crate::status::{GenerationStatus, StatusBus, StatusEvent, StatusStream, SubscriptionToken};
use chrono::{DateTime, Utc};
use colloquy_core::{ChatMessage, CompletionBackend, GenerationProgress, TransportError};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Error text recorded when a generation is cancelled.
pub const CANCELLED_MESSAGE: &str = "generation cancelled";

/// Configuration for the conversation engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Message bound applied after every append
    pub history: HistoryConfig,
    /// Idle time after which a context is eligible for eviction
    pub context_expiry: Duration,
    /// How often the background sweeper runs
    pub sweep_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history: HistoryConfig::default(),
            context_expiry: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(30 * 60),
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub const fn with_history(mut self, history: HistoryConfig) -> Self {
        self.history = history;
        self
    }

    #[must_use]
    pub const fn with_context_expiry(mut self, expiry: Duration) -> Self {
        self.context_expiry = expiry;
        self
    }

    #[must_use]
    pub const fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("conversation {0} is already generating a response")]
    Conflict(String),

    #[error("conversation {0} not found")]
    NotFound(String),

    #[error("generation cancelled")]
    Cancelled,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// How a generation ended.
///
/// Streaming generations report failures here instead of as an `Err`; the
/// same text is recorded in the conversation's status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    Completed(String),
    Failed(String),
}

impl GenerationOutcome {
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    /// The assistant reply, if the generation completed.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Completed(text) => Some(text),
            Self::Failed(_) => None,
        }
    }
}

/// Result of [`ConversationEngine::send_message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    pub outcome: GenerationOutcome,
    pub status: GenerationStatus,
}

/// A conversation's history together with its current status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSnapshot {
    pub conversation_id: String,
    pub messages: Vec<ChatMessage>,
    pub last_updated: DateTime<Utc>,
    pub status: GenerationStatus,
}

#[derive(Debug)]
struct ActiveGeneration {
    id: u64,
    cancel: CancellationToken,
}

/// Everything the engine tracks for one conversation id, guarded by a
/// single map entry lock.
#[derive(Debug)]
struct ConversationSlot {
    context: ConversationContext,
    status: GenerationStatus,
    active: Option<ActiveGeneration>,
}

impl ConversationSlot {
    fn new(context: ConversationContext) -> Self {
        Self {
            context,
            status: GenerationStatus::default(),
            active: None,
        }
    }

    fn owns(&self, generation: u64) -> bool {
        self.active.as_ref().is_some_and(|a| a.id == generation)
    }
}

struct Generation {
    id: u64,
    cancel: CancellationToken,
    messages: Vec<ChatMessage>,
}

/// Multi-conversation engine.
///
/// All state lives in memory. Each conversation has at most one generation
/// in flight; a second request while one runs is rejected with
/// [`EngineError::Conflict`].
pub struct ConversationEngine<B = Arc<dyn CompletionBackend>>
where
    B: Send + Sync,
{
    backend: B,
    config: EngineConfig,
    slots: DashMap<String, ConversationSlot>,
    bus: Arc<StatusBus>,
    next_generation: AtomicU64,
    /// Stamped on every status change while its slot is locked.
    next_sequence: AtomicU64,
}

impl<B> ConversationEngine<B>
where
    B: CompletionBackend + Send + Sync,
{
    pub fn new(backend: B, config: EngineConfig) -> Self {
        info!(
            "Creating conversation engine (history limit {}, expiry {:?})",
            config.history.max_messages, config.context_expiry
        );
        Self {
            backend,
            config,
            slots: DashMap::new(),
            bus: Arc::new(StatusBus::new()),
            next_generation: AtomicU64::new(0),
            next_sequence: AtomicU64::new(0),
        }
    }

    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Create (or replace) the context for `conversation_id`.
    ///
    /// Replacing keeps the conversation's status, so a generation already in
    /// flight still owns it and appends its reply to the new context.
    pub fn create_context(
        &self,
        conversation_id: &str,
        system_prompt: Option<&str>,
    ) -> ConversationContext {
        let context = ConversationContext::new(conversation_id, system_prompt);
        match self.slots.entry(conversation_id.to_string()) {
            Entry::Occupied(mut slot) => {
                warn!("Replacing existing context for conversation {conversation_id}");
                slot.get_mut().context = context.clone();
            }
            Entry::Vacant(slot) => {
                debug!("Created context for conversation {conversation_id}");
                slot.insert(ConversationSlot::new(context.clone()));
            }
        }
        context
    }

    pub fn get_context(&self, conversation_id: &str) -> Option<ConversationContext> {
        self.slots
            .get(conversation_id)
            .map(|slot| slot.context.clone())
    }

    /// Current status; conversations never seen report idle.
    pub fn status(&self, conversation_id: &str) -> GenerationStatus {
        self.slots
            .get(conversation_id)
            .map(|slot| slot.status.clone())
            .unwrap_or_default()
    }

    pub fn snapshot(&self, conversation_id: &str) -> Result<ConversationSnapshot, EngineError> {
        self.slots
            .get(conversation_id)
            .map(|slot| ConversationSnapshot {
                conversation_id: conversation_id.to_string(),
                messages: slot.context.messages.clone(),
                last_updated: slot.context.last_updated,
                status: slot.status.clone(),
            })
            .ok_or_else(|| EngineError::NotFound(conversation_id.to_string()))
    }

    /// Ids of every conversation currently held.
    pub fn active_conversations(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.slots.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Remove a conversation's context and status, cancelling any generation
    /// in flight. Returns false if there was nothing to remove.
    ///
    /// Cancelling a generation this way publishes a final idle status with
    /// the cancellation error, since the generation itself no longer has a
    /// slot to report into.
    pub fn clear_context(&self, conversation_id: &str) -> bool {
        let removed = match self.slots.entry(conversation_id.to_string()) {
            Entry::Occupied(entry) => Some((self.stamp(), entry.remove())),
            Entry::Vacant(_) => None,
        };
        let Some((sequence, slot)) = removed else {
            return false;
        };

        if let Some(active) = slot.active {
            active.cancel.cancel();
            let status = GenerationStatus {
                is_generating: false,
                current_progress: slot.status.current_progress,
                error: Some(CANCELLED_MESSAGE.to_string()),
            };
            self.bus.publish(conversation_id, sequence, &status);
        }
        info!("Cleared conversation {conversation_id}");
        true
    }

    /// Cancel the generation in flight for `conversation_id`, if any.
    pub fn cancel_generation(&self, conversation_id: &str) -> bool {
        let token = self
            .slots
            .get(conversation_id)
            .and_then(|slot| slot.active.as_ref().map(|a| a.cancel.clone()));
        token.is_some_and(|token| {
            info!("Cancelling generation for conversation {conversation_id}");
            token.cancel();
            true
        })
    }

    pub fn subscribe<F>(&self, conversation_id: &str, handler: F) -> SubscriptionToken
    where
        F: Fn(&StatusEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.bus.subscribe(conversation_id, handler)
    }

    pub fn unsubscribe(&self, token: &SubscriptionToken) -> bool {
        self.bus.unsubscribe(token)
    }

    /// Status changes for `conversation_id` as a stream.
    pub fn watch(&self, conversation_id: &str) -> StatusStream {
        self.bus.watch(conversation_id)
    }

    pub async fn count_context_tokens(&self, conversation_id: &str) -> Result<u64, EngineError> {
        let messages = self
            .get_context(conversation_id)
            .map(|ctx| ctx.messages)
            .ok_or_else(|| EngineError::NotFound(conversation_id.to_string()))?;
        Ok(self.backend.count_tokens(&messages).await?)
    }

    /// Host-facing send: the conversation must already exist.
    pub async fn send_message(
        &self,
        conversation_id: &str,
        text: &str,
        use_stream: bool,
    ) -> Result<SendOutcome, EngineError> {
        let outcome = self
            .generate(conversation_id, text, use_stream, false)
            .await?;
        Ok(SendOutcome {
            outcome,
            status: self.status(conversation_id),
        })
    }

    /// Append `user_text` and generate the assistant's reply.
    ///
    /// A missing context is created without a system prompt. Streaming
    /// failures come back as [`GenerationOutcome::Failed`]; non-streaming
    /// failures are returned as errors. Either way the failure is recorded
    /// in the status and the user message stays in the history.
    pub async fn generate_response(
        &self,
        conversation_id: &str,
        user_text: &str,
        use_stream: bool,
    ) -> Result<GenerationOutcome, EngineError> {
        self.generate(conversation_id, user_text, use_stream, true)
            .await
    }

    async fn generate(
        &self,
        conversation_id: &str,
        user_text: &str,
        use_stream: bool,
        create_if_missing: bool,
    ) -> Result<GenerationOutcome, EngineError> {
        let generation = self.begin(conversation_id, user_text, create_if_missing)?;
        info!(
            "Generating response for conversation {conversation_id} ({} messages, stream: {use_stream})",
            generation.messages.len()
        );

        let result = tokio::select! {
            result = self.run_backend(conversation_id, &generation, use_stream) => {
                result.map_err(EngineError::from)
            }
            () = generation.cancel.cancelled() => Err(EngineError::Cancelled),
        };

        match result {
            Ok(text) => {
                self.finish_ok(conversation_id, generation.id, &text);
                Ok(GenerationOutcome::Completed(text))
            }
            Err(e) => {
                let message = e.to_string();
                warn!("Generation failed for conversation {conversation_id}: {message}");
                self.finish_err(conversation_id, generation.id, &message);
                if use_stream {
                    Ok(GenerationOutcome::Failed(message))
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Evict every idle context whose conversation is not generating.
    ///
    /// Returns the number of conversations evicted.
    pub fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Utc::now())
    }

    fn sweep_expired_at(&self, now: DateTime<Utc>) -> usize {
        let max_idle =
            chrono::Duration::from_std(self.config.context_expiry).unwrap_or(chrono::Duration::MAX);
        let before = self.slots.len();
        self.slots.retain(|_, slot| {
            slot.status.is_generating || !slot.context.is_idle_since(now, max_idle)
        });
        let evicted = before.saturating_sub(self.slots.len());
        if evicted > 0 {
            info!("Evicted {evicted} expired conversation(s)");
        }
        evicted
    }

    /// Run [`Self::sweep_expired`] every `sweep_interval` until the engine
    /// is dropped.
    pub fn spawn_expiry_sweeper(self: &Arc<Self>) -> JoinHandle<()>
    where
        B: 'static,
    {
        let engine = Arc::downgrade(self);
        let period = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(engine) = engine.upgrade() else {
                    debug!("Engine dropped, stopping expiry sweeper");
                    break;
                };
                engine.sweep_expired();
            }
        })
    }

    /// Sequence number for a status change; call with the slot locked.
    fn stamp(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::SeqCst)
    }

    fn begin(
        &self,
        conversation_id: &str,
        user_text: &str,
        create_if_missing: bool,
    ) -> Result<Generation, EngineError> {
        let id = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();

        let (messages, sequence, status) = {
            let mut slot = match self.slots.entry(conversation_id.to_string()) {
                Entry::Occupied(entry) => entry.into_ref(),
                Entry::Vacant(entry) if create_if_missing => {
                    debug!("Creating context for conversation {conversation_id} on first message");
                    entry.insert(ConversationSlot::new(ConversationContext::new(
                        conversation_id,
                        None,
                    )))
                }
                Entry::Vacant(_) => {
                    return Err(EngineError::NotFound(conversation_id.to_string()));
                }
            };
            if slot.status.is_generating {
                warn!("Rejected message for {conversation_id}: generation already running");
                return Err(EngineError::Conflict(conversation_id.to_string()));
            }

            let slot = &mut *slot;
            slot.status = GenerationStatus {
                is_generating: true,
                current_progress: None,
                error: None,
            };
            slot.active = Some(ActiveGeneration {
                id,
                cancel: cancel.clone(),
            });
            let pruned = slot
                .context
                .push(ChatMessage::user(user_text), &self.config.history);
            if pruned > 0 {
                debug!("Pruned {pruned} message(s) from conversation {conversation_id}");
            }
            (
                slot.context.messages.clone(),
                self.stamp(),
                slot.status.clone(),
            )
        };

        self.bus.publish(conversation_id, sequence, &status);
        Ok(Generation {
            id,
            cancel,
            messages,
        })
    }

    async fn run_backend(
        &self,
        conversation_id: &str,
        generation: &Generation,
        use_stream: bool,
    ) -> Result<String, TransportError> {
        if use_stream {
            let mut on_progress = |progress: GenerationProgress| {
                self.record_progress(conversation_id, generation.id, progress);
            };
            self.backend
                .complete_streaming(&generation.messages, &mut on_progress)
                .await
        } else {
            let completion = self.backend.complete_once(&generation.messages).await?;
            self.record_progress(
                conversation_id,
                generation.id,
                GenerationProgress::complete(completion.id, completion.text.clone()),
            );
            Ok(completion.text)
        }
    }

    fn record_progress(&self, conversation_id: &str, generation: u64, progress: GenerationProgress) {
        let (sequence, status) = {
            let Some(mut slot) = self.slots.get_mut(conversation_id) else {
                return;
            };
            if !slot.owns(generation) {
                return;
            }
            slot.status.current_progress = Some(progress);
            (self.stamp(), slot.status.clone())
        };
        self.bus.publish(conversation_id, sequence, &status);
    }

    fn finish_ok(&self, conversation_id: &str, generation: u64, text: &str) {
        let (sequence, status) = {
            let Some(mut slot) = self.slots.get_mut(conversation_id) else {
                debug!("Conversation {conversation_id} was cleared during generation");
                return;
            };
            if !slot.owns(generation) {
                return;
            }
            let slot = &mut *slot;
            slot.context
                .push(ChatMessage::assistant(text), &self.config.history);
            slot.status = GenerationStatus::default();
            slot.active = None;
            (self.stamp(), slot.status.clone())
        };
        debug!("Generation completed for conversation {conversation_id}");
        self.bus.publish(conversation_id, sequence, &status);
    }

    fn finish_err(&self, conversation_id: &str, generation: u64, message: &str) {
        let (sequence, status) = {
            let Some(mut slot) = self.slots.get_mut(conversation_id) else {
                return;
            };
            if !slot.owns(generation) {
                return;
            }
            let slot = &mut *slot;
            slot.status.is_generating = false;
            slot.status.error = Some(message.to_string());
            slot.active = None;
            (self.stamp(), slot.status.clone())
        };
        self.bus.publish(conversation_id, sequence, &status);
    }
}
