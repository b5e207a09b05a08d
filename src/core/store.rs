//! Session store
//!
//! Central state container for workspaces, sessions, messages, connections,
//! and per-session settings. Mutations are reducer-style: each one rebuilds
//! the affected value and replaces it wholesale, so observers that rely on
//! snapshot equality for change detection stay correct. Every mutation
//! bumps a revision counter and notifies subscribers over a channel.
//!
//! The whole store persists as a single JSON snapshot across restarts;
//! nothing is stored server-side.

use std::error::Error as StdError;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::message::{Message, Role};

pub const TEMPERATURE_RANGE: (f64, f64) = (0.0, 2.0);
pub const TOP_P_RANGE: (f64, f64) = (0.0, 1.0);
pub const MAX_TOKENS_RANGE: (u32, u32) = (128, 4096);

/// Characters of the first user message kept when deriving a session title.
const TITLE_MAX_CHARS: usize = 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Ollama,
    LmStudio,
    Cloud,
    Custom,
}

impl ProviderKind {
    pub fn is_cloud(self) -> bool {
        self == ProviderKind::Cloud
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Online,
    Offline,
    Checking,
}

/// A configured pointer to a running inference backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Connection {
    pub id: String,
    pub name: String,
    pub provider: ProviderKind,
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub model: String,
    pub context_window: u32,
    pub status: ConnectionStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    #[default]
    Full,
    Trimmed,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResponseFormat {
    #[default]
    Markdown,
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ToolFlags {
    #[serde(default)]
    pub web_search: bool,
    #[serde(default)]
    pub voice_response: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    WebSearch,
    VoiceResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SessionSettings {
    pub temperature: f64,
    pub top_p: f64,
    pub max_tokens: u32,
    #[serde(default)]
    pub memory: MemoryKind,
    #[serde(default)]
    pub tools: ToolFlags,
    #[serde(default)]
    pub format: ResponseFormat,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            max_tokens: 2048,
            memory: MemoryKind::Full,
            tools: ToolFlags::default(),
            format: ResponseFormat::Markdown,
        }
    }
}

impl SessionSettings {
    /// Clamp all numeric fields into their declared ranges. Applied at the
    /// mutation boundary so out-of-range values are never stored.
    pub fn clamped(mut self) -> Self {
        self.temperature = self.temperature.clamp(TEMPERATURE_RANGE.0, TEMPERATURE_RANGE.1);
        self.top_p = self.top_p.clamp(TOP_P_RANGE.0, TOP_P_RANGE.1);
        self.max_tokens = self.max_tokens.clamp(MAX_TOKENS_RANGE.0, MAX_TOKENS_RANGE.1);
        self
    }
}

/// Partial settings update; unset fields keep their current values.
#[derive(Debug, Clone, Copy, Default)]
pub struct SettingsPatch {
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<u32>,
    pub memory: Option<MemoryKind>,
    pub format: Option<ResponseFormat>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workspace {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: String,
    pub workspace_id: String,
    pub title: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub persona_id: Option<String>,
    #[serde(default)]
    pub framework_id: Option<String>,
    #[serde(default)]
    pub linguistic_id: Option<String>,
    pub settings: SessionSettings,
}

/// The single persisted record: everything the store holds.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoreSnapshot {
    pub workspaces: Vec<Workspace>,
    pub sessions: Vec<Session>,
    pub connections: Vec<Connection>,
    pub active_workspace_id: Option<String>,
    pub active_session_id: Option<String>,
    pub active_connection_id: Option<String>,
    pub role: Option<String>,
    #[serde(default)]
    pub configured: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    WorkspaceCreated { workspace_id: String },
    SessionCreated { session_id: String },
    SessionSelected { session_id: String },
    MessageAppended { session_id: String, message_id: String },
    MessagePatched { session_id: String, message_id: String },
    SessionUpdated { session_id: String },
    ConnectionUpdated { connection_id: String },
}

#[derive(Debug)]
pub enum StoreError {
    UnknownWorkspace(String),
    UnknownSession(String),
    UnknownMessage(String),
    UnknownConnection(String),
    Snapshot(std::io::Error),
    Encode(serde_json::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::UnknownWorkspace(id) => write!(f, "Unknown workspace: {id}"),
            StoreError::UnknownSession(id) => write!(f, "Unknown session: {id}"),
            StoreError::UnknownMessage(id) => write!(f, "Unknown message: {id}"),
            StoreError::UnknownConnection(id) => write!(f, "Unknown connection: {id}"),
            StoreError::Snapshot(source) => write!(f, "Failed to persist store snapshot: {source}"),
            StoreError::Encode(source) => write!(f, "Failed to encode store snapshot: {source}"),
        }
    }
}

impl StdError for StoreError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            StoreError::Snapshot(source) => Some(source),
            StoreError::Encode(source) => Some(source),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(source: std::io::Error) -> Self {
        StoreError::Snapshot(source)
    }
}

pub struct SessionStore {
    state: StoreSnapshot,
    revision: u64,
    subscribers: Vec<mpsc::UnboundedSender<StoreEvent>>,
    snapshot_path: Option<PathBuf>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            state: StoreSnapshot::default(),
            revision: 0,
            subscribers: Vec::new(),
            snapshot_path: None,
        }
    }

    /// Load the store from a snapshot file, falling back to an empty store
    /// when the file is missing or unreadable. Subsequent [`persist`] calls
    /// write back to the same path.
    ///
    /// [`persist`]: SessionStore::persist
    pub fn load_or_default(snapshot_path: PathBuf) -> Self {
        let state = match fs::read_to_string(&snapshot_path) {
            Ok(contents) => match serde_json::from_str::<StoreSnapshot>(&contents) {
                Ok(mut snapshot) => {
                    // A hand-edited snapshot can carry out-of-range values;
                    // the bounds hold for loaded state too.
                    for session in &mut snapshot.sessions {
                        session.settings = session.settings.clamped();
                    }
                    snapshot
                }
                Err(e) => {
                    tracing::warn!(
                        path = %snapshot_path.display(),
                        error = %e,
                        "store snapshot unreadable, starting empty"
                    );
                    StoreSnapshot::default()
                }
            },
            Err(_) => StoreSnapshot::default(),
        };
        Self {
            state,
            revision: 0,
            subscribers: Vec::new(),
            snapshot_path: Some(snapshot_path),
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// A structural copy of the whole store state.
    pub fn snapshot(&self) -> StoreSnapshot {
        self.state.clone()
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<StoreEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    fn notify(&mut self, event: StoreEvent) {
        self.revision += 1;
        self.subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    // ---- workspaces ----

    pub fn create_workspace(&mut self, name: impl Into<String>) -> Workspace {
        let workspace = Workspace {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
        };
        self.state.workspaces.push(workspace.clone());
        if self.state.active_workspace_id.is_none() {
            self.state.active_workspace_id = Some(workspace.id.clone());
        }
        self.notify(StoreEvent::WorkspaceCreated {
            workspace_id: workspace.id.clone(),
        });
        workspace
    }

    pub fn workspaces(&self) -> Vec<Workspace> {
        self.state.workspaces.clone()
    }

    /// Select a workspace, guaranteeing it has at least one session.
    pub fn select_workspace(&mut self, workspace_id: &str) -> Result<Session, StoreError> {
        if !self.state.workspaces.iter().any(|w| w.id == workspace_id) {
            return Err(StoreError::UnknownWorkspace(workspace_id.to_string()));
        }
        self.state.active_workspace_id = Some(workspace_id.to_string());
        let session = self.ensure_session(workspace_id);
        self.state.active_session_id = Some(session.id.clone());
        self.notify(StoreEvent::SessionSelected {
            session_id: session.id.clone(),
        });
        Ok(session)
    }

    /// The most recent session in the workspace, created on demand so every
    /// configured workspace always has one.
    fn ensure_session(&mut self, workspace_id: &str) -> Session {
        if let Some(session) = self
            .state
            .sessions
            .iter()
            .rev()
            .find(|s| s.workspace_id == workspace_id)
        {
            return session.clone();
        }
        self.create_session(workspace_id)
            .expect("workspace existence checked by caller")
    }

    // ---- sessions ----

    pub fn create_session(&mut self, workspace_id: &str) -> Result<Session, StoreError> {
        if !self.state.workspaces.iter().any(|w| w.id == workspace_id) {
            return Err(StoreError::UnknownWorkspace(workspace_id.to_string()));
        }
        let session = Session {
            id: Uuid::new_v4().to_string(),
            workspace_id: workspace_id.to_string(),
            title: "New chat".to_string(),
            messages: Vec::new(),
            persona_id: None,
            framework_id: None,
            linguistic_id: None,
            settings: SessionSettings::default(),
        };
        self.state.sessions.push(session.clone());
        if self.state.active_session_id.is_none() {
            self.state.active_session_id = Some(session.id.clone());
        }
        self.notify(StoreEvent::SessionCreated {
            session_id: session.id.clone(),
        });
        Ok(session)
    }

    pub fn select_session(&mut self, session_id: &str) -> Result<(), StoreError> {
        if !self.state.sessions.iter().any(|s| s.id == session_id) {
            return Err(StoreError::UnknownSession(session_id.to_string()));
        }
        self.state.active_session_id = Some(session_id.to_string());
        self.notify(StoreEvent::SessionSelected {
            session_id: session_id.to_string(),
        });
        Ok(())
    }

    /// A structural copy of one session.
    pub fn session(&self, session_id: &str) -> Option<Session> {
        self.state.sessions.iter().find(|s| s.id == session_id).cloned()
    }

    pub fn active_session(&self) -> Option<Session> {
        self.state
            .active_session_id
            .as_deref()
            .and_then(|id| self.session(id))
    }

    /// Rebuild-and-replace for session mutations; this is what keeps
    /// structural-copy semantics: the stored value is swapped wholesale,
    /// never mutated through a shared reference.
    fn replace_session(
        &mut self,
        session_id: &str,
        mutate: impl FnOnce(&mut Session),
    ) -> Result<Session, StoreError> {
        let index = self
            .state
            .sessions
            .iter()
            .position(|s| s.id == session_id)
            .ok_or_else(|| StoreError::UnknownSession(session_id.to_string()))?;
        let mut rebuilt = self.state.sessions[index].clone();
        mutate(&mut rebuilt);
        self.state.sessions[index] = rebuilt.clone();
        Ok(rebuilt)
    }

    // ---- messages ----

    pub fn append_message(
        &mut self,
        session_id: &str,
        role: Role,
        content: impl Into<String>,
    ) -> Result<Message, StoreError> {
        let message = Message::new(role, content);
        let appended = message.clone();
        self.replace_session(session_id, |session| {
            session.messages.push(message);
        })?;
        self.notify(StoreEvent::MessageAppended {
            session_id: session_id.to_string(),
            message_id: appended.id.clone(),
        });
        Ok(appended)
    }

    /// Replace a message's content. Used exclusively by the stream consumer
    /// to push the growing accumulator into the assistant placeholder.
    pub fn patch_message_content(
        &mut self,
        session_id: &str,
        message_id: &str,
        content: impl Into<String>,
    ) -> Result<(), StoreError> {
        let content = content.into();
        let mut found = false;
        self.replace_session(session_id, |session| {
            if let Some(message) = session.messages.iter_mut().find(|m| m.id == message_id) {
                message.content = content;
                found = true;
            }
        })?;
        if !found {
            return Err(StoreError::UnknownMessage(message_id.to_string()));
        }
        self.notify(StoreEvent::MessagePatched {
            session_id: session_id.to_string(),
            message_id: message_id.to_string(),
        });
        Ok(())
    }

    // ---- session settings and references ----

    pub fn patch_settings(
        &mut self,
        session_id: &str,
        patch: SettingsPatch,
    ) -> Result<SessionSettings, StoreError> {
        let updated = self.replace_session(session_id, |session| {
            let mut settings = session.settings;
            if let Some(temperature) = patch.temperature {
                settings.temperature = temperature;
            }
            if let Some(top_p) = patch.top_p {
                settings.top_p = top_p;
            }
            if let Some(max_tokens) = patch.max_tokens {
                settings.max_tokens = max_tokens;
            }
            if let Some(memory) = patch.memory {
                settings.memory = memory;
            }
            if let Some(format) = patch.format {
                settings.format = format;
            }
            session.settings = settings.clamped();
        })?;
        self.notify(StoreEvent::SessionUpdated {
            session_id: session_id.to_string(),
        });
        Ok(updated.settings)
    }

    pub fn apply_persona(
        &mut self,
        session_id: &str,
        persona_id: Option<String>,
    ) -> Result<(), StoreError> {
        self.replace_session(session_id, |session| session.persona_id = persona_id)?;
        self.notify(StoreEvent::SessionUpdated {
            session_id: session_id.to_string(),
        });
        Ok(())
    }

    pub fn apply_framework(
        &mut self,
        session_id: &str,
        framework_id: Option<String>,
    ) -> Result<(), StoreError> {
        self.replace_session(session_id, |session| session.framework_id = framework_id)?;
        self.notify(StoreEvent::SessionUpdated {
            session_id: session_id.to_string(),
        });
        Ok(())
    }

    pub fn apply_linguistic(
        &mut self,
        session_id: &str,
        linguistic_id: Option<String>,
    ) -> Result<(), StoreError> {
        self.replace_session(session_id, |session| session.linguistic_id = linguistic_id)?;
        self.notify(StoreEvent::SessionUpdated {
            session_id: session_id.to_string(),
        });
        Ok(())
    }

    pub fn toggle_tool(&mut self, session_id: &str, tool: Tool) -> Result<ToolFlags, StoreError> {
        let updated = self.replace_session(session_id, |session| match tool {
            Tool::WebSearch => session.settings.tools.web_search = !session.settings.tools.web_search,
            Tool::VoiceResponse => {
                session.settings.tools.voice_response = !session.settings.tools.voice_response
            }
        })?;
        self.notify(StoreEvent::SessionUpdated {
            session_id: session_id.to_string(),
        });
        Ok(updated.settings.tools)
    }

    pub fn set_session_title(
        &mut self,
        session_id: &str,
        title: impl Into<String>,
    ) -> Result<(), StoreError> {
        let title = title.into();
        self.replace_session(session_id, |session| session.title = title)?;
        self.notify(StoreEvent::SessionUpdated {
            session_id: session_id.to_string(),
        });
        Ok(())
    }

    // ---- connections ----

    pub fn upsert_connection(&mut self, connection: Connection) {
        let id = connection.id.clone();
        match self.state.connections.iter().position(|c| c.id == id) {
            Some(index) => self.state.connections[index] = connection,
            None => self.state.connections.push(connection),
        }
        if self.state.active_connection_id.is_none() {
            self.state.active_connection_id = Some(id.clone());
        }
        self.notify(StoreEvent::ConnectionUpdated { connection_id: id });
    }

    pub fn set_connection_status(
        &mut self,
        connection_id: &str,
        status: ConnectionStatus,
    ) -> Result<(), StoreError> {
        let index = self
            .state
            .connections
            .iter()
            .position(|c| c.id == connection_id)
            .ok_or_else(|| StoreError::UnknownConnection(connection_id.to_string()))?;
        let mut rebuilt = self.state.connections[index].clone();
        rebuilt.status = status;
        self.state.connections[index] = rebuilt;
        self.notify(StoreEvent::ConnectionUpdated {
            connection_id: connection_id.to_string(),
        });
        Ok(())
    }

    pub fn set_active_connection(&mut self, connection_id: &str) -> Result<(), StoreError> {
        if !self.state.connections.iter().any(|c| c.id == connection_id) {
            return Err(StoreError::UnknownConnection(connection_id.to_string()));
        }
        self.state.active_connection_id = Some(connection_id.to_string());
        self.notify(StoreEvent::ConnectionUpdated {
            connection_id: connection_id.to_string(),
        });
        Ok(())
    }

    pub fn active_connection(&self) -> Option<Connection> {
        self.state
            .active_connection_id
            .as_deref()
            .and_then(|id| self.state.connections.iter().find(|c| c.id == id))
            .cloned()
    }

    // ---- profile flags ----

    pub fn set_role(&mut self, role: Option<String>) {
        self.state.role = role;
        self.revision += 1;
    }

    pub fn set_configured(&mut self, configured: bool) {
        self.state.configured = configured;
        self.revision += 1;
    }

    // ---- persistence ----

    pub fn persist(&self) -> Result<(), StoreError> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        self.persist_to(path)
    }

    pub fn persist_to(&self, path: &Path) -> Result<(), StoreError> {
        let parent = path.parent().ok_or_else(|| {
            StoreError::Snapshot(std::io::Error::other("snapshot path has no parent"))
        })?;
        fs::create_dir_all(parent)?;
        let serialized = serde_json::to_string_pretty(&self.state).map_err(StoreError::Encode)?;

        let mut temp = NamedTempFile::new_in(parent)?;
        temp.write_all(serialized.as_bytes())?;
        temp.flush()?;
        temp.persist(path)
            .map_err(|e| StoreError::Snapshot(e.error))?;
        Ok(())
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Derive a session title from the first user message: first line,
/// truncated at a word boundary.
pub fn derived_title(first_user_message: &str) -> String {
    let first_line = first_user_message.trim().lines().next().unwrap_or("").trim();
    if first_line.is_empty() {
        return "New chat".to_string();
    }
    if first_line.chars().count() <= TITLE_MAX_CHARS {
        return first_line.to_string();
    }
    let truncated: String = first_line.chars().take(TITLE_MAX_CHARS).collect();
    let cut = truncated.rfind(' ').unwrap_or(truncated.len());
    format!("{}…", truncated[..cut].trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_session() -> (SessionStore, String) {
        let mut store = SessionStore::new();
        let workspace = store.create_workspace("Research");
        let session = store.select_workspace(&workspace.id).unwrap();
        (store, session.id)
    }

    #[test]
    fn selecting_a_workspace_guarantees_a_session() {
        let mut store = SessionStore::new();
        let workspace = store.create_workspace("Research");
        assert!(store.snapshot().sessions.is_empty());

        let session = store.select_workspace(&workspace.id).unwrap();
        assert_eq!(session.workspace_id, workspace.id);
        assert_eq!(store.active_session().unwrap().id, session.id);

        // Re-selecting reuses the existing session rather than stacking new ones
        let again = store.select_workspace(&workspace.id).unwrap();
        assert_eq!(again.id, session.id);
        assert_eq!(store.snapshot().sessions.len(), 1);
    }

    #[test]
    fn settings_are_clamped_at_the_mutation_boundary() {
        let (mut store, session_id) = store_with_session();
        let settings = store
            .patch_settings(
                &session_id,
                SettingsPatch {
                    temperature: Some(5.0),
                    top_p: Some(-0.2),
                    max_tokens: Some(10),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(settings.temperature, 2.0);
        assert_eq!(settings.top_p, 0.0);
        assert_eq!(settings.max_tokens, 128);

        let stored = store.session(&session_id).unwrap();
        assert_eq!(stored.settings.temperature, 2.0);
    }

    #[test]
    fn partial_patches_keep_unset_fields() {
        let (mut store, session_id) = store_with_session();
        let before = store.session(&session_id).unwrap().settings;
        let after = store
            .patch_settings(
                &session_id,
                SettingsPatch {
                    temperature: Some(1.2),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(after.temperature, 1.2);
        assert_eq!(after.top_p, before.top_p);
        assert_eq!(after.max_tokens, before.max_tokens);
    }

    #[test]
    fn mutations_are_structural_copies() {
        let (mut store, session_id) = store_with_session();
        let before = store.session(&session_id).unwrap();

        store
            .append_message(&session_id, Role::User, "hello")
            .unwrap();

        // The earlier snapshot is untouched by the mutation
        assert!(before.messages.is_empty());
        assert_eq!(store.session(&session_id).unwrap().messages.len(), 1);
    }

    #[test]
    fn patching_a_message_rewrites_only_its_content() {
        let (mut store, session_id) = store_with_session();
        let message = store
            .append_message(&session_id, Role::Assistant, "")
            .unwrap();
        store
            .patch_message_content(&session_id, &message.id, "Hi there")
            .unwrap();

        let stored = store.session(&session_id).unwrap();
        assert_eq!(stored.messages[0].content, "Hi there");
        assert_eq!(stored.messages[0].id, message.id);

        let missing = store.patch_message_content(&session_id, "nope", "x");
        assert!(matches!(missing, Err(StoreError::UnknownMessage(_))));
    }

    #[test]
    fn subscribers_see_every_mutation() {
        let (mut store, session_id) = store_with_session();
        let mut events = store.subscribe();

        store.append_message(&session_id, Role::User, "hi").unwrap();
        store.toggle_tool(&session_id, Tool::WebSearch).unwrap();

        assert!(matches!(
            events.try_recv().unwrap(),
            StoreEvent::MessageAppended { .. }
        ));
        assert!(matches!(
            events.try_recv().unwrap(),
            StoreEvent::SessionUpdated { .. }
        ));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn revision_advances_with_each_mutation() {
        let (mut store, session_id) = store_with_session();
        let before = store.revision();
        store.append_message(&session_id, Role::User, "hi").unwrap();
        assert!(store.revision() > before);
    }

    #[test]
    fn toggling_tools_flips_one_flag() {
        let (mut store, session_id) = store_with_session();
        let flags = store.toggle_tool(&session_id, Tool::VoiceResponse).unwrap();
        assert!(flags.voice_response);
        assert!(!flags.web_search);
        let flags = store.toggle_tool(&session_id, Tool::VoiceResponse).unwrap();
        assert!(!flags.voice_response);
    }

    #[test]
    fn connections_upsert_and_activate() {
        let mut store = SessionStore::new();
        let connection = Connection {
            id: "local".into(),
            name: "Local Ollama".into(),
            provider: ProviderKind::Ollama,
            base_url: "http://localhost:11434".into(),
            api_key: None,
            model: "llama3.1:8b".into(),
            context_window: 8192,
            status: ConnectionStatus::Checking,
        };
        store.upsert_connection(connection.clone());
        assert_eq!(store.active_connection().unwrap().id, "local");

        store
            .set_connection_status("local", ConnectionStatus::Online)
            .unwrap();
        assert_eq!(
            store.active_connection().unwrap().status,
            ConnectionStatus::Online
        );

        let mut updated = connection;
        updated.model = "mistral".into();
        store.upsert_connection(updated);
        assert_eq!(store.snapshot().connections.len(), 1);
        assert_eq!(store.active_connection().unwrap().model, "mistral");
    }

    #[test]
    fn snapshot_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        let (mut store, session_id) = store_with_session();
        store.append_message(&session_id, Role::User, "persist me").unwrap();
        store.set_configured(true);
        store.persist_to(&path).unwrap();

        let restored = SessionStore::load_or_default(path);
        let snapshot = restored.snapshot();
        assert!(snapshot.configured);
        assert_eq!(snapshot.sessions.len(), 1);
        assert_eq!(snapshot.sessions[0].messages[0].content, "persist me");
        assert_eq!(snapshot.active_session_id.as_deref(), Some(session_id.as_str()));
    }

    #[test]
    fn loaded_snapshots_are_clamped_into_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        // A hand-edited snapshot with out-of-range settings
        let snapshot = StoreSnapshot {
            sessions: vec![Session {
                id: "s1".into(),
                workspace_id: "w1".into(),
                title: "Edited".into(),
                messages: Vec::new(),
                persona_id: None,
                framework_id: None,
                linguistic_id: None,
                settings: SessionSettings {
                    temperature: 5.0,
                    top_p: 7.0,
                    max_tokens: 1,
                    ..Default::default()
                },
            }],
            ..Default::default()
        };
        fs::write(&path, serde_json::to_string(&snapshot).unwrap()).unwrap();

        let store = SessionStore::load_or_default(path);
        let settings = store.snapshot().sessions[0].settings;
        assert_eq!(settings.temperature, 2.0);
        assert_eq!(settings.top_p, 1.0);
        assert_eq!(settings.max_tokens, 128);
    }

    #[test]
    fn corrupt_snapshot_falls_back_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        fs::write(&path, "{not json").unwrap();

        let store = SessionStore::load_or_default(path);
        assert!(store.snapshot().sessions.is_empty());
    }

    #[test]
    fn titles_derive_from_the_first_line() {
        assert_eq!(derived_title("Explain TCP"), "Explain TCP");
        assert_eq!(derived_title("  Explain TCP\nand more"), "Explain TCP");
        assert_eq!(derived_title("   "), "New chat");

        let long = "Explain the transmission control protocol handshake in exhaustive detail";
        let title = derived_title(long);
        assert!(title.ends_with('…'));
        assert!(title.chars().count() <= TITLE_MAX_CHARS + 1);
    }
}
