//! Turn lifecycle and stream consumption
//!
//! A chat turn moves through an explicit per-session state machine:
//! `Idle → Sending → Streaming → Done`. The guard lives here rather than in
//! any UI layer, so the one-in-flight-turn-per-session invariant holds no
//! matter who initiates the send. Turns in different sessions are
//! independent.
//!
//! The consumer reads the router's unified stream and pushes the growing
//! accumulator into the assistant placeholder on every fragment, so
//! observers can re-render live. Failures are written in-band: the
//! placeholder content gets a failure-marker prefix instead of a reply.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::{mpsc, Mutex};

use crate::api::ChatMessage;
use crate::collab::{SpeechSynthesizer, TitleGenerator};
use crate::core::chat_stream::StreamMessage;
use crate::core::library::InstructionLibrary;
use crate::core::message::Role;
use crate::core::prompt::compose;
use crate::core::store::{derived_title, MemoryKind, Session, SessionStore, StoreError};

/// Prefix written into the assistant message when a turn fails, so the UI
/// can detect and highlight failed bubbles.
pub const FAILURE_MARKER: &str = "⚠ ";

/// Number of trailing messages sent upstream when session memory is
/// trimmed.
const TRIMMED_MEMORY_MESSAGES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Idle,
    Sending,
    Streaming,
    Done,
}

impl TurnPhase {
    /// Whether a new send may be accepted in this phase.
    pub fn accepts_send(self) -> bool {
        matches!(self, TurnPhase::Idle | TurnPhase::Done)
    }
}

#[derive(Debug)]
pub enum TurnError {
    /// A turn is already in flight for this session.
    TurnInFlight,
    Store(StoreError),
}

impl fmt::Display for TurnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnError::TurnInFlight => {
                write!(f, "A response is already streaming for this session")
            }
            TurnError::Store(source) => write!(f, "{source}"),
        }
    }
}

impl StdError for TurnError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            TurnError::Store(source) => Some(source),
            _ => None,
        }
    }
}

impl From<StoreError> for TurnError {
    fn from(source: StoreError) -> Self {
        TurnError::Store(source)
    }
}

/// Everything the consumer needs to finish a turn it has begun.
#[derive(Debug, Clone)]
pub struct TurnHandle {
    pub session_id: String,
    pub placeholder_id: String,
    pub user_content: String,
    /// Set when this was the first user message of the session, which
    /// triggers title derivation.
    pub first_turn: bool,
}

pub struct TurnCoordinator {
    store: Arc<Mutex<SessionStore>>,
    phases: StdMutex<HashMap<String, TurnPhase>>,
    speech: Arc<dyn SpeechSynthesizer>,
    titler: Arc<dyn TitleGenerator>,
}

/// Build the upstream message list for a session: the composed system
/// prompt (when a persona is applied), then as much history as the
/// session's memory setting allows. The trailing assistant placeholder is
/// excluded.
pub fn build_api_messages(session: &Session, library: &InstructionLibrary) -> Vec<ChatMessage> {
    let mut api_messages = Vec::new();

    if let Some(persona_id) = &session.persona_id {
        if let Some(persona) = library.find_persona(persona_id) {
            let framework = session
                .framework_id
                .as_deref()
                .and_then(|id| library.find_framework(id));
            let linguistic = session
                .linguistic_id
                .as_deref()
                .and_then(|id| library.find_linguistic(id));
            api_messages.push(ChatMessage::new(
                "system",
                compose(persona, framework, linguistic),
            ));
        }
    }

    let history: Vec<&crate::core::message::Message> = session
        .messages
        .iter()
        .filter(|m| (m.role.is_user() || m.role.is_assistant()) && !m.content.is_empty())
        .collect();

    let kept: Vec<&crate::core::message::Message> = match session.settings.memory {
        MemoryKind::Full => history,
        MemoryKind::Trimmed => {
            let skip = history.len().saturating_sub(TRIMMED_MEMORY_MESSAGES);
            history.into_iter().skip(skip).collect()
        }
        MemoryKind::Off => history
            .into_iter()
            .rev()
            .take(1)
            .collect(),
    };

    for message in kept {
        api_messages.push(ChatMessage::new(message.role.as_str(), message.content.clone()));
    }

    api_messages
}

impl TurnCoordinator {
    pub fn new(
        store: Arc<Mutex<SessionStore>>,
        speech: Arc<dyn SpeechSynthesizer>,
        titler: Arc<dyn TitleGenerator>,
    ) -> Self {
        Self {
            store,
            phases: StdMutex::new(HashMap::new()),
            speech,
            titler,
        }
    }

    pub fn phase(&self, session_id: &str) -> TurnPhase {
        self.phases
            .lock()
            .expect("phase map lock poisoned")
            .get(session_id)
            .copied()
            .unwrap_or(TurnPhase::Idle)
    }

    fn set_phase(&self, session_id: &str, phase: TurnPhase) {
        self.phases
            .lock()
            .expect("phase map lock poisoned")
            .insert(session_id.to_string(), phase);
    }

    /// Start a turn: reject if one is in flight, otherwise append the user
    /// message and the assistant placeholder and return the upstream
    /// message list for dispatch.
    pub async fn begin_turn(
        &self,
        session_id: &str,
        user_content: &str,
        library: &InstructionLibrary,
    ) -> Result<(TurnHandle, Vec<ChatMessage>), TurnError> {
        {
            let mut phases = self.phases.lock().expect("phase map lock poisoned");
            let phase = phases.get(session_id).copied().unwrap_or(TurnPhase::Idle);
            if !phase.accepts_send() {
                return Err(TurnError::TurnInFlight);
            }
            phases.insert(session_id.to_string(), TurnPhase::Sending);
        }

        let mut store = self.store.lock().await;
        let first_turn = store
            .session(session_id)
            .map(|s| !s.messages.iter().any(|m| m.role.is_user()))
            .unwrap_or(false);

        let append = (|| -> Result<(TurnHandle, Vec<ChatMessage>), TurnError> {
            store.append_message(session_id, Role::User, user_content)?;
            let session = store
                .session(session_id)
                .ok_or_else(|| StoreError::UnknownSession(session_id.to_string()))?;
            let library_messages = build_api_messages(&session, library);
            let placeholder = store.append_message(session_id, Role::Assistant, "")?;
            Ok((
                TurnHandle {
                    session_id: session_id.to_string(),
                    placeholder_id: placeholder.id,
                    user_content: user_content.to_string(),
                    first_turn,
                },
                library_messages,
            ))
        })();

        if append.is_err() {
            self.set_phase(session_id, TurnPhase::Idle);
        }
        append
    }

    /// Consume the router's stream for one turn, patching the placeholder
    /// on every fragment. Returns the final accumulated content.
    pub async fn consume(
        &self,
        handle: &TurnHandle,
        mut rx: mpsc::UnboundedReceiver<(StreamMessage, u64)>,
        stream_id: u64,
    ) -> String {
        self.set_phase(&handle.session_id, TurnPhase::Streaming);

        if handle.first_turn {
            self.apply_title(handle).await;
        }

        let mut accumulator = String::new();
        let mut failed = false;

        while let Some((message, received_id)) = rx.recv().await {
            if received_id != stream_id {
                continue;
            }
            match message {
                StreamMessage::Chunk(content) => {
                    accumulator.push_str(&content);
                    self.patch_placeholder(handle, accumulator.clone()).await;
                }
                StreamMessage::Error(text) => {
                    accumulator = format!("{FAILURE_MARKER}{text}");
                    self.patch_placeholder(handle, accumulator.clone()).await;
                    failed = true;
                    break;
                }
                StreamMessage::End => break,
            }
        }

        self.set_phase(&handle.session_id, TurnPhase::Done);
        self.finish_turn(handle, &accumulator, failed).await;
        accumulator
    }

    async fn patch_placeholder(&self, handle: &TurnHandle, content: String) {
        let mut store = self.store.lock().await;
        if let Err(e) =
            store.patch_message_content(&handle.session_id, &handle.placeholder_id, content)
        {
            tracing::warn!(error = %e, "failed to patch streaming message");
        }
    }

    async fn apply_title(&self, handle: &TurnHandle) {
        let title = match self.titler.derive_title(&handle.user_content).await {
            Ok(title) => title,
            Err(e) => {
                tracing::warn!(error = %e, "title generation failed, deriving locally");
                derived_title(&handle.user_content)
            }
        };
        let mut store = self.store.lock().await;
        if let Err(e) = store.set_session_title(&handle.session_id, title) {
            tracing::warn!(error = %e, "failed to set derived session title");
        }
    }

    async fn finish_turn(&self, handle: &TurnHandle, final_content: &str, failed: bool) {
        let store = self.store.lock().await;
        let voice_enabled = store
            .session(&handle.session_id)
            .map(|s| s.settings.tools.voice_response)
            .unwrap_or(false);
        if let Err(e) = store.persist() {
            tracing::warn!(error = %e, "failed to persist store after turn");
        }
        drop(store);

        if voice_enabled && !failed && !final_content.is_empty() {
            if let Err(e) = self.speech.speak(final_content).await {
                tracing::warn!(error = %e, "speech synthesis failed, reply stays text-only");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{CollabError, Disabled, TruncatingTitler};
    use crate::core::config::Config;
    use crate::core::store::{SettingsPatch, StoreEvent, Tool};
    use async_trait::async_trait;

    async fn coordinator() -> (Arc<TurnCoordinator>, Arc<Mutex<SessionStore>>, String) {
        let mut store = SessionStore::new();
        let workspace = store.create_workspace("Test");
        let session = store.select_workspace(&workspace.id).unwrap();
        let session_id = session.id;
        let store = Arc::new(Mutex::new(store));
        let coordinator = Arc::new(TurnCoordinator::new(
            Arc::clone(&store),
            Arc::new(Disabled),
            Arc::new(TruncatingTitler),
        ));
        (coordinator, store, session_id)
    }

    fn library() -> InstructionLibrary {
        InstructionLibrary::load(&Config::default())
    }

    async fn wait_for_patch(events: &mut mpsc::UnboundedReceiver<StoreEvent>) {
        loop {
            match events.recv().await.expect("store event stream closed") {
                StoreEvent::MessagePatched { .. } => return,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn second_send_is_rejected_while_streaming() {
        let (coordinator, store, session_id) = coordinator().await;
        let library = library();

        let (_handle, _messages) = coordinator
            .begin_turn(&session_id, "first", &library)
            .await
            .unwrap();
        let messages_after_first = store.lock().await.session(&session_id).unwrap().messages.len();

        let second = coordinator.begin_turn(&session_id, "second", &library).await;
        assert!(matches!(second, Err(TurnError::TurnInFlight)));

        // No second placeholder was appended
        let messages_now = store.lock().await.session(&session_id).unwrap().messages.len();
        assert_eq!(messages_now, messages_after_first);
    }

    #[tokio::test]
    async fn turns_in_different_sessions_are_independent() {
        let (coordinator, store, session_id) = coordinator().await;
        let other_session = {
            let mut store = store.lock().await;
            let workspace_id = store.snapshot().workspaces[0].id.clone();
            store.create_session(&workspace_id).unwrap().id
        };
        let library = library();

        coordinator
            .begin_turn(&session_id, "first", &library)
            .await
            .unwrap();
        assert!(coordinator
            .begin_turn(&other_session, "parallel", &library)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn fragments_accumulate_with_observable_intermediate_states() {
        let (coordinator, store, session_id) = coordinator().await;
        let library = library();

        let (handle, _messages) = coordinator
            .begin_turn(&session_id, "Explain TCP", &library)
            .await
            .unwrap();

        let mut events = store.lock().await.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        let consumer = {
            let coordinator = Arc::clone(&coordinator);
            let handle = handle.clone();
            tokio::spawn(async move { coordinator.consume(&handle, rx, 1).await })
        };

        tx.send((StreamMessage::Chunk("Hi".into()), 1)).unwrap();
        wait_for_patch(&mut events).await;
        assert_eq!(
            placeholder_content(&store, &handle).await,
            "Hi".to_string()
        );

        tx.send((StreamMessage::Chunk(" there".into()), 1)).unwrap();
        wait_for_patch(&mut events).await;
        assert_eq!(
            placeholder_content(&store, &handle).await,
            "Hi there".to_string()
        );

        tx.send((StreamMessage::End, 1)).unwrap();
        let final_content = consumer.await.unwrap();
        assert_eq!(final_content, "Hi there");
        assert_eq!(coordinator.phase(&session_id), TurnPhase::Done);

        // The guard is released: a new send is accepted
        assert!(coordinator
            .begin_turn(&session_id, "again", &library)
            .await
            .is_ok());
    }

    async fn placeholder_content(
        store: &Arc<Mutex<SessionStore>>,
        handle: &TurnHandle,
    ) -> String {
        store
            .lock()
            .await
            .session(&handle.session_id)
            .unwrap()
            .messages
            .iter()
            .find(|m| m.id == handle.placeholder_id)
            .unwrap()
            .content
            .clone()
    }

    #[tokio::test]
    async fn fragments_for_other_streams_are_ignored() {
        let (coordinator, store, session_id) = coordinator().await;
        let library = library();
        let (handle, _messages) = coordinator
            .begin_turn(&session_id, "hello", &library)
            .await
            .unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send((StreamMessage::Chunk("stale".into()), 99)).unwrap();
        tx.send((StreamMessage::Chunk("Hi".into()), 1)).unwrap();
        tx.send((StreamMessage::End, 1)).unwrap();

        let final_content = coordinator.consume(&handle, rx, 1).await;
        assert_eq!(final_content, "Hi");
        assert_eq!(placeholder_content(&store, &handle).await, "Hi");
    }

    #[tokio::test]
    async fn stream_errors_are_written_in_band_with_the_marker() {
        let (coordinator, store, session_id) = coordinator().await;
        let library = library();
        let (handle, _messages) = coordinator
            .begin_turn(&session_id, "hello", &library)
            .await
            .unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send((StreamMessage::Error("API Error: boom".into()), 1))
            .unwrap();

        let final_content = coordinator.consume(&handle, rx, 1).await;
        assert!(final_content.starts_with(FAILURE_MARKER));
        assert!(final_content.contains("API Error: boom"));
        assert_eq!(coordinator.phase(&session_id), TurnPhase::Done);
        assert_eq!(
            placeholder_content(&store, &handle).await,
            format!("{FAILURE_MARKER}API Error: boom")
        );
    }

    #[tokio::test]
    async fn first_turn_derives_the_session_title() {
        let (coordinator, store, session_id) = coordinator().await;
        let library = library();
        let (handle, _messages) = coordinator
            .begin_turn(&session_id, "Explain TCP", &library)
            .await
            .unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send((StreamMessage::Chunk("TCP is...".into()), 1)).unwrap();
        tx.send((StreamMessage::End, 1)).unwrap();
        coordinator.consume(&handle, rx, 1).await;

        assert_eq!(
            store.lock().await.session(&session_id).unwrap().title,
            "Explain TCP"
        );
    }

    struct CountingSpeech(StdMutex<Vec<String>>);

    #[async_trait]
    impl SpeechSynthesizer for CountingSpeech {
        async fn speak(&self, text: &str) -> Result<(), CollabError> {
            self.0.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn voice_enabled_sessions_speak_the_final_text_once() {
        let mut store = SessionStore::new();
        let workspace = store.create_workspace("Test");
        let session_id = store.select_workspace(&workspace.id).unwrap().id;
        store.toggle_tool(&session_id, Tool::VoiceResponse).unwrap();
        let store = Arc::new(Mutex::new(store));

        let speech = Arc::new(CountingSpeech(StdMutex::new(Vec::new())));
        let coordinator = TurnCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&speech) as Arc<dyn SpeechSynthesizer>,
            Arc::new(TruncatingTitler),
        );

        let library = library();
        let (handle, _messages) = coordinator
            .begin_turn(&session_id, "hello", &library)
            .await
            .unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send((StreamMessage::Chunk("Hi".into()), 1)).unwrap();
        tx.send((StreamMessage::Chunk(" there".into()), 1)).unwrap();
        tx.send((StreamMessage::End, 1)).unwrap();
        coordinator.consume(&handle, rx, 1).await;

        assert_eq!(*speech.0.lock().unwrap(), vec!["Hi there".to_string()]);
    }

    #[tokio::test]
    async fn end_to_end_turn_with_persona() {
        let (coordinator, store, session_id) = coordinator().await;
        let library = library();
        store
            .lock()
            .await
            .apply_persona(&session_id, Some("grand-scholar".into()))
            .unwrap();
        // Out-of-range settings from a caller are clamped, not stored
        let settings = store
            .lock()
            .await
            .patch_settings(
                &session_id,
                SettingsPatch {
                    temperature: Some(5.0),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(settings.temperature, 2.0);

        let (handle, api_messages) = coordinator
            .begin_turn(&session_id, "Explain TCP", &library)
            .await
            .unwrap();

        assert_eq!(api_messages[0].role, "system");
        assert!(api_messages[0].content.starts_with("You are acting as Grand Scholar"));
        assert_eq!(api_messages.last().unwrap().content, "Explain TCP");

        let session = store.lock().await.session(&session_id).unwrap();
        let roles: Vec<&str> = session.messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["user", "assistant"]);

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send((StreamMessage::Chunk("A handshake...".into()), 1)).unwrap();
        tx.send((StreamMessage::End, 1)).unwrap();
        coordinator.consume(&handle, rx, 1).await;

        let session = store.lock().await.session(&session_id).unwrap();
        assert_eq!(session.title, "Explain TCP");
        assert_eq!(session.messages[1].content, "A handshake...");
        assert_eq!(handle.placeholder_id, session.messages[1].id);
    }

    #[tokio::test]
    async fn memory_settings_bound_the_history() {
        let (coordinator, store, session_id) = coordinator().await;
        let library = library();

        {
            let mut store = store.lock().await;
            for i in 0..6 {
                store
                    .append_message(&session_id, Role::User, format!("q{i}"))
                    .unwrap();
                store
                    .append_message(&session_id, Role::Assistant, format!("a{i}"))
                    .unwrap();
            }
            store
                .patch_settings(
                    &session_id,
                    SettingsPatch {
                        memory: Some(MemoryKind::Trimmed),
                        ..Default::default()
                    },
                )
                .unwrap();
        }

        let (_handle, api_messages) = coordinator
            .begin_turn(&session_id, "latest", &library)
            .await
            .unwrap();
        // No persona applied, so every message is history
        assert_eq!(api_messages.len(), TRIMMED_MEMORY_MESSAGES);
        assert_eq!(api_messages.last().unwrap().content, "latest");
    }
}
