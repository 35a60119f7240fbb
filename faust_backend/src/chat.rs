//! Conversation workspaces and the turn driver.
//!
//! Each user (logged in or anonymous) owns a workspace of conversations. A
//! turn snapshots the history, appends the user turn, runs the supervision
//! controller outside the workspace lock and appends whatever it produced.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use base64::Engine;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::attachments::{ingest_upload, Upload};
use crate::blob_store::BlobStore;
use crate::config::{AppConfig, APOLOGY_MESSAGE};
use crate::conversation::{ConversationSession, ConversationTurn, Part, Speaker};
use crate::database::{ChatDatabase, StoredConversation, UserDocument};
use crate::llm_client::GenerationService;
use crate::supervision::{Outcome, SupervisionController, SupervisionEvent, TurnInput};
use crate::title::{summarize_title, unique_title};

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("conversation {0} not found")]
    NotFound(String),
    #[error("a turn is already running in conversation {0}")]
    Busy(String),
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UserIdentity {
    /// Persisted under the normalized email.
    LoggedIn { email: String },
    /// Lives in memory only.
    Anonymous { session_id: String },
}

impl UserIdentity {
    pub fn logged_in(email: &str) -> Self {
        UserIdentity::LoggedIn {
            email: email.trim().to_lowercase(),
        }
    }

    pub fn anonymous(session_id: &str) -> Self {
        UserIdentity::Anonymous {
            session_id: session_id.trim().to_string(),
        }
    }

    pub fn is_logged_in(&self) -> bool {
        matches!(self, UserIdentity::LoggedIn { .. })
    }

    pub fn storage_key(&self) -> Option<&str> {
        match self {
            UserIdentity::LoggedIn { email } => Some(email),
            UserIdentity::Anonymous { .. } => None,
        }
    }

    fn workspace_key(&self) -> String {
        match self {
            UserIdentity::LoggedIn { email } => format!("user:{}", email),
            UserIdentity::Anonymous { session_id } => format!("anon:{}", session_id),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    pub turn_count: usize,
    pub updated_at: DateTime<Utc>,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttachmentView {
    pub mime_type: String,
    /// Remote blob URL, or a data URL of the local display copy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnView {
    pub speaker: Speaker,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment: Option<AttachmentView>,
}

impl TurnView {
    fn from_turn(turn: &ConversationTurn) -> Self {
        let attachment = turn.attachment.as_ref().map(|attachment| {
            let url = match (&attachment.remote_ref, &attachment.display_form) {
                (Some(remote), _) => Some(remote.url.clone()),
                (None, Some(display)) => Some(format!(
                    "data:{};base64,{}",
                    attachment.mime_type,
                    base64::engine::general_purpose::STANDARD.encode(display)
                )),
                (None, None) => None,
            };
            AttachmentView {
                mime_type: attachment.mime_type.clone(),
                url,
            }
        });
        Self {
            speaker: turn.speaker,
            text: turn.text.clone(),
            attachment,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationDetail {
    #[serde(flatten)]
    pub summary: ConversationSummary,
    pub system_instruction: String,
    pub turns: Vec<TurnView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnReport {
    pub conversation_id: String,
    pub reply: String,
    pub score: Option<f64>,
    pub outcome: Outcome,
    pub attempts: u32,
    pub cancelled: bool,
    pub title: String,
}

/// One user's conversations plus which one is open.
#[derive(Debug, Clone)]
pub struct UserWorkspace {
    pub identity: UserIdentity,
    pub conversations: HashMap<String, ConversationSession>,
    pub active: String,
}

impl UserWorkspace {
    pub fn new(identity: UserIdentity, system_instruction: &str) -> Self {
        let session = ConversationSession::new(system_instruction);
        let active = session.id.clone();
        Self {
            identity,
            conversations: HashMap::from([(active.clone(), session)]),
            active,
        }
    }

    pub fn from_document(
        identity: UserIdentity,
        document: UserDocument,
        system_instruction: &str,
    ) -> Self {
        let conversations: HashMap<String, ConversationSession> = document
            .conversations
            .into_iter()
            .map(|(id, stored)| (id.clone(), stored.into_session(id)))
            .collect();
        let mut workspace = Self {
            identity,
            conversations,
            active: document.last_active_conversation.unwrap_or_default(),
        };
        workspace.ensure_active(system_instruction);
        workspace
    }

    pub fn to_document(&self) -> UserDocument {
        UserDocument {
            conversations: self
                .conversations
                .iter()
                .map(|(id, session)| (id.clone(), StoredConversation::from_session(session)))
                .collect(),
            last_active_conversation: Some(self.active.clone()),
        }
    }

    /// Points `active` at an existing conversation: the most recently updated
    /// one, or a fresh one when the workspace is empty.
    fn ensure_active(&mut self, system_instruction: &str) {
        if self.conversations.contains_key(&self.active) {
            return;
        }
        match self
            .conversations
            .values()
            .max_by_key(|session| session.updated_at)
        {
            Some(latest) => self.active = latest.id.clone(),
            None => {
                let session = ConversationSession::new(system_instruction);
                self.active = session.id.clone();
                self.conversations.insert(session.id.clone(), session);
            }
        }
    }

    fn get(&self, id: &str) -> Result<&ConversationSession, ChatError> {
        self.conversations
            .get(id)
            .ok_or_else(|| ChatError::NotFound(id.to_string()))
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut ConversationSession, ChatError> {
        self.conversations
            .get_mut(id)
            .ok_or_else(|| ChatError::NotFound(id.to_string()))
    }

    fn summary(&self, session: &ConversationSession) -> ConversationSummary {
        ConversationSummary {
            id: session.id.clone(),
            title: session.title.clone(),
            turn_count: session.turns.len(),
            updated_at: session.updated_at,
            active: session.id == self.active,
        }
    }

    /// Newest first.
    pub fn summaries(&self) -> Vec<ConversationSummary> {
        let mut summaries: Vec<ConversationSummary> = self
            .conversations
            .values()
            .map(|session| self.summary(session))
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        summaries
    }

    fn titles_except(&self, id: &str) -> Vec<String> {
        self.conversations
            .values()
            .filter(|session| session.id != id)
            .map(|session| session.title.clone())
            .collect()
    }
}

/// Removes its conversation from the in-flight table when dropped.
struct TurnGuard<'a> {
    in_flight: &'a std::sync::Mutex<HashMap<String, CancellationToken>>,
    conversation_id: String,
    token: CancellationToken,
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        in_flight.remove(&self.conversation_id);
    }
}

/// What a turn runs against, captured while the workspace is locked.
struct PreparedTurn {
    history: Vec<ConversationTurn>,
    parts: Vec<Part>,
    system_instruction: String,
}

pub struct ChatService {
    config: RwLock<AppConfig>,
    service: Arc<dyn GenerationService>,
    controller: SupervisionController,
    database: Option<Arc<ChatDatabase>>,
    blob_store: Option<Arc<dyn BlobStore>>,
    workspaces: Mutex<HashMap<String, Arc<Mutex<UserWorkspace>>>>,
    in_flight: std::sync::Mutex<HashMap<String, CancellationToken>>,
    rng_seed: Option<u64>,
    turn_counter: AtomicU64,
}

impl ChatService {
    pub fn new(config: AppConfig, service: Arc<dyn GenerationService>) -> Self {
        Self {
            config: RwLock::new(config),
            controller: SupervisionController::new(service.clone()),
            service,
            database: None,
            blob_store: None,
            workspaces: Mutex::new(HashMap::new()),
            in_flight: std::sync::Mutex::new(HashMap::new()),
            rng_seed: None,
            turn_counter: AtomicU64::new(0),
        }
    }

    pub fn with_database(mut self, database: Arc<ChatDatabase>) -> Self {
        self.database = Some(database);
        self
    }

    pub fn with_blob_store(mut self, blob_store: Arc<dyn BlobStore>) -> Self {
        self.blob_store = Some(blob_store);
        self
    }

    pub fn with_events(mut self, events: flume::Sender<SupervisionEvent>) -> Self {
        self.controller = self.controller.with_events(events);
        self
    }

    /// Makes reviewer persona draws reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    pub async fn config(&self) -> AppConfig {
        self.config.read().await.clone()
    }

    pub async fn update_config(&self, config: AppConfig) -> Result<AppConfig, ChatError> {
        config
            .validate()
            .map_err(|e| ChatError::Invalid(e.to_string()))?;
        let mut current = self.config.write().await;
        *current = config.clone();
        tracing::info!(
            "Config updated: model={}, supervision={:?}",
            config.model,
            config.supervision
        );
        Ok(config)
    }

    fn turn_rng(&self) -> StdRng {
        let turn = self.turn_counter.fetch_add(1, Ordering::Relaxed);
        match self.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(turn)),
            None => StdRng::from_entropy(),
        }
    }

    async fn workspace(&self, identity: &UserIdentity) -> Arc<Mutex<UserWorkspace>> {
        let key = identity.workspace_key();
        let mut workspaces = self.workspaces.lock().await;
        if let Some(workspace) = workspaces.get(&key) {
            return workspace.clone();
        }

        let instruction = self.config.read().await.default_system_instruction.clone();
        let workspace = Arc::new(Mutex::new(self.load_workspace(identity, &instruction)));
        workspaces.insert(key, workspace.clone());
        workspace
    }

    fn load_workspace(&self, identity: &UserIdentity, instruction: &str) -> UserWorkspace {
        let (Some(key), Some(db)) = (identity.storage_key(), self.database.as_ref()) else {
            return UserWorkspace::new(identity.clone(), instruction);
        };
        match db.load_user_document(key) {
            Ok(Some(document)) => {
                tracing::info!(
                    "Loaded {} conversation(s) for {}",
                    document.conversations.len(),
                    key
                );
                UserWorkspace::from_document(identity.clone(), document, instruction)
            }
            Ok(None) => UserWorkspace::new(identity.clone(), instruction),
            Err(e) => {
                tracing::warn!("Failed to load conversations for {}: {:#}", key, e);
                UserWorkspace::new(identity.clone(), instruction)
            }
        }
    }

    fn persist(&self, workspace: &UserWorkspace) -> anyhow::Result<()> {
        if let (Some(key), Some(db)) = (workspace.identity.storage_key(), self.database.as_ref()) {
            db.save_user_document(key, &workspace.to_document())?;
        }
        Ok(())
    }

    fn persist_quietly(&self, workspace: &UserWorkspace) {
        if let Err(e) = self.persist(workspace) {
            tracing::warn!("Failed to persist conversations: {:#}", e);
        }
    }

    fn begin_turn(&self, conversation_id: &str) -> Result<TurnGuard<'_>, ChatError> {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if in_flight.contains_key(conversation_id) {
            return Err(ChatError::Busy(conversation_id.to_string()));
        }
        let token = CancellationToken::new();
        in_flight.insert(conversation_id.to_string(), token.clone());
        Ok(TurnGuard {
            in_flight: &self.in_flight,
            conversation_id: conversation_id.to_string(),
            token,
        })
    }

    pub async fn send(
        &self,
        identity: &UserIdentity,
        conversation_id: &str,
        text: &str,
        upload: Option<Upload>,
    ) -> Result<TurnReport, ChatError> {
        let config = self.config().await;
        let workspace = self.workspace(identity).await;
        workspace.lock().await.get(conversation_id)?;
        let guard = self.begin_turn(conversation_id)?;

        let blob_store = if identity.is_logged_in() {
            self.blob_store.as_deref()
        } else {
            None
        };
        let attachment = match upload {
            Some(upload) => ingest_upload(upload, blob_store, config.display_width).await,
            None => None,
        };
        let text = text.trim();
        if text.is_empty() && attachment.is_none() {
            return Err(ChatError::Invalid("message is empty".to_string()));
        }

        let prepared = {
            let mut ws = workspace.lock().await;
            let session = ws.get_mut(conversation_id)?;
            let history = session.history().to_vec();
            let mut turn = ConversationTurn::user(text);
            if let Some(attachment) = attachment {
                turn = turn.with_attachment(attachment);
            }
            let parts = turn.to_parts();
            session.push_user_turn(turn);
            let system_instruction = session.system_instruction.clone();
            ws.active = conversation_id.to_string();
            self.persist_quietly(&ws);
            PreparedTurn {
                history,
                parts,
                system_instruction,
            }
        };

        self.complete_turn(&config, &workspace, conversation_id, prepared, &guard.token)
            .await
    }

    /// Replaces the trailing assistant turn with a fresh answer to the same
    /// user input.
    pub async fn regenerate(
        &self,
        identity: &UserIdentity,
        conversation_id: &str,
    ) -> Result<TurnReport, ChatError> {
        let config = self.config().await;
        let workspace = self.workspace(identity).await;
        workspace.lock().await.get(conversation_id)?;
        let guard = self.begin_turn(conversation_id)?;

        let prepared = {
            let mut ws = workspace.lock().await;
            let session = ws.get_mut(conversation_id)?;
            match session.turns.last() {
                Some(turn) if turn.speaker == Speaker::Assistant => {}
                _ => {
                    return Err(ChatError::Invalid(
                        "the last turn is not an assistant reply".to_string(),
                    ))
                }
            }
            let removed = session.strip_trailing_assistant_turn();
            let Some(parts) = session.last_user_input_parts() else {
                if let Some(removed) = removed {
                    session.turns.push(removed);
                }
                return Err(ChatError::Invalid(
                    "there is no user input to answer again".to_string(),
                ));
            };
            let history = session.history_before_pending().to_vec();
            let system_instruction = session.system_instruction.clone();
            self.persist_quietly(&ws);
            PreparedTurn {
                history,
                parts,
                system_instruction,
            }
        };

        self.complete_turn(&config, &workspace, conversation_id, prepared, &guard.token)
            .await
    }

    async fn complete_turn(
        &self,
        config: &AppConfig,
        workspace: &Mutex<UserWorkspace>,
        conversation_id: &str,
        prepared: PreparedTurn,
        cancel: &CancellationToken,
    ) -> Result<TurnReport, ChatError> {
        let turn = TurnInput {
            conversation_id,
            model: &config.model,
            history: &prepared.history,
            new_input: &prepared.parts,
            system_instruction: &prepared.system_instruction,
        };
        let mut rng = self.turn_rng();
        let result = self
            .controller
            .run(&config.supervision, &turn, &mut rng, cancel)
            .await;

        let reply = result
            .final_text
            .clone()
            .unwrap_or_else(|| APOLOGY_MESSAGE.to_string());

        let (needs_title, user_text, title) = {
            let mut ws = workspace.lock().await;
            let session = ws.get_mut(conversation_id).inspect_err(|_| {
                tracing::warn!("Conversation {} vanished mid-turn", conversation_id);
            })?;
            session.push_assistant_turn(reply.clone());
            let needs_title = session.has_default_title() && ends_with_exchange(&session.turns);
            let user_text = session
                .turns
                .iter()
                .rev()
                .find(|turn| turn.speaker == Speaker::User)
                .map(|turn| turn.text.clone())
                .unwrap_or_default();
            let title = session.title.clone();
            self.persist_quietly(&ws);
            (needs_title, user_text, title)
        };

        let title = if needs_title && !user_text.trim().is_empty() {
            self.auto_title(config, workspace, conversation_id, &user_text)
                .await
                .unwrap_or(title)
        } else {
            title
        };

        Ok(TurnReport {
            conversation_id: conversation_id.to_string(),
            reply,
            score: result.final_score,
            outcome: result.outcome,
            attempts: result.attempts,
            cancelled: result.cancelled,
            title,
        })
    }

    async fn auto_title(
        &self,
        config: &AppConfig,
        workspace: &Mutex<UserWorkspace>,
        conversation_id: &str,
        user_text: &str,
    ) -> Option<String> {
        let suggested = summarize_title(
            self.service.as_ref(),
            &config.model,
            user_text,
            config.title_max_chars,
        )
        .await;

        let mut ws = workspace.lock().await;
        let others = ws.titles_except(conversation_id);
        let session = ws.conversations.get_mut(conversation_id)?;
        if !session.has_default_title() {
            return Some(session.title.clone());
        }
        let title = unique_title(&suggested, others.iter().map(String::as_str));
        tracing::debug!("Titled conversation {} as {:?}", conversation_id, title);
        session.title = title.clone();
        self.persist_quietly(&ws);
        Some(title)
    }

    pub async fn cancel(
        &self,
        identity: &UserIdentity,
        conversation_id: &str,
    ) -> Result<bool, ChatError> {
        let workspace = self.workspace(identity).await;
        workspace.lock().await.get(conversation_id)?;
        let in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match in_flight.get(conversation_id) {
            Some(token) => {
                tracing::info!("Cancelling turn in {}", conversation_id);
                token.cancel();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn new_conversation(
        &self,
        identity: &UserIdentity,
    ) -> Result<ConversationSummary, ChatError> {
        let instruction = self.config.read().await.default_system_instruction.clone();
        let workspace = self.workspace(identity).await;
        let mut ws = workspace.lock().await;
        let session = ConversationSession::new(instruction);
        let id = session.id.clone();
        ws.conversations.insert(id.clone(), session);
        ws.active = id.clone();
        self.persist(&ws)?;
        let summary = ws.summary(ws.get(&id)?);
        Ok(summary)
    }

    /// Whether the conversation belongs to an already loaded workspace of
    /// this user. Never loads or creates a workspace.
    pub async fn owns(&self, identity: &UserIdentity, conversation_id: &str) -> bool {
        let workspace = {
            let workspaces = self.workspaces.lock().await;
            match workspaces.get(&identity.workspace_key()) {
                Some(workspace) => workspace.clone(),
                None => return false,
            }
        };
        let ws = workspace.lock().await;
        ws.conversations.contains_key(conversation_id)
    }

    pub async fn list(&self, identity: &UserIdentity) -> Vec<ConversationSummary> {
        let workspace = self.workspace(identity).await;
        let ws = workspace.lock().await;
        ws.summaries()
    }

    pub async fn activate(
        &self,
        identity: &UserIdentity,
        conversation_id: &str,
    ) -> Result<ConversationSummary, ChatError> {
        let workspace = self.workspace(identity).await;
        let mut ws = workspace.lock().await;
        ws.get(conversation_id)?;
        ws.active = conversation_id.to_string();
        self.persist(&ws)?;
        Ok(ws.summary(ws.get(conversation_id)?))
    }

    pub async fn get(
        &self,
        identity: &UserIdentity,
        conversation_id: &str,
    ) -> Result<ConversationDetail, ChatError> {
        let workspace = self.workspace(identity).await;
        let ws = workspace.lock().await;
        let session = ws.get(conversation_id)?;
        Ok(ConversationDetail {
            summary: ws.summary(session),
            system_instruction: session.system_instruction.clone(),
            turns: session.turns.iter().map(TurnView::from_turn).collect(),
        })
    }

    pub async fn turns(
        &self,
        identity: &UserIdentity,
        conversation_id: &str,
    ) -> Result<Vec<TurnView>, ChatError> {
        Ok(self.get(identity, conversation_id).await?.turns)
    }

    pub async fn rename(
        &self,
        identity: &UserIdentity,
        conversation_id: &str,
        title: &str,
    ) -> Result<ConversationSummary, ChatError> {
        let max_chars = self.config.read().await.title_max_chars;
        let title = title.trim();
        if title.is_empty() {
            return Err(ChatError::Invalid("title must not be empty".to_string()));
        }
        if title.chars().count() > max_chars {
            return Err(ChatError::Invalid(format!(
                "title must be at most {} characters",
                max_chars
            )));
        }

        let workspace = self.workspace(identity).await;
        let mut ws = workspace.lock().await;
        ws.get(conversation_id)?;
        if ws.titles_except(conversation_id).iter().any(|t| t == title) {
            return Err(ChatError::Invalid(format!(
                "a conversation titled {:?} already exists",
                title
            )));
        }
        ws.get_mut(conversation_id)?.title = title.to_string();
        self.persist(&ws)?;
        Ok(ws.summary(ws.get(conversation_id)?))
    }

    pub async fn set_system_instruction(
        &self,
        identity: &UserIdentity,
        conversation_id: &str,
        instruction: &str,
    ) -> Result<(), ChatError> {
        let workspace = self.workspace(identity).await;
        let mut ws = workspace.lock().await;
        ws.get_mut(conversation_id)?.system_instruction = instruction.trim().to_string();
        self.persist(&ws)?;
        Ok(())
    }

    /// Deletes a conversation and its remote blobs. Returns the id of the
    /// conversation that is active afterwards.
    pub async fn delete(
        &self,
        identity: &UserIdentity,
        conversation_id: &str,
    ) -> Result<String, ChatError> {
        let instruction = self.config.read().await.default_system_instruction.clone();
        let workspace = self.workspace(identity).await;
        let mut ws = workspace.lock().await;
        let session = ws
            .conversations
            .remove(conversation_id)
            .ok_or_else(|| ChatError::NotFound(conversation_id.to_string()))?;

        if let Some(token) = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(conversation_id)
        {
            token.cancel();
        }

        if let Some(store) = self.blob_store.as_ref() {
            for blob_id in session.remote_blob_ids() {
                if let Err(e) = store.delete(&blob_id).await {
                    tracing::warn!("Failed to delete blob {}: {:#}", blob_id, e);
                }
            }
        }

        if ws.active == conversation_id {
            ws.active.clear();
        }
        ws.ensure_active(&instruction);
        self.persist(&ws)?;
        tracing::info!("Deleted conversation {}", conversation_id);
        Ok(ws.active.clone())
    }
}

/// True when the transcript ends with a user turn answered by the assistant.
fn ends_with_exchange(turns: &[ConversationTurn]) -> bool {
    matches!(
        turns,
        [.., user, assistant] if user.speaker == Speaker::User && assistant.speaker == Speaker::Assistant
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::LocalBlobStore;
    use crate::llm_client::{GenerationSession, SingleShotOptions, TextStream};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    /// Streams scripted replies; single-shot calls answer titles and scores.
    struct FakeModel {
        replies: std::sync::Mutex<VecDeque<Result<String, String>>>,
        title: String,
        history_lens: std::sync::Mutex<Vec<usize>>,
    }

    impl FakeModel {
        fn new(replies: Vec<Result<&str, &str>>, title: &str) -> Arc<Self> {
            Arc::new(Self {
                replies: std::sync::Mutex::new(
                    replies
                        .into_iter()
                        .map(|r| r.map(String::from).map_err(String::from))
                        .collect(),
                ),
                title: title.to_string(),
                history_lens: std::sync::Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl GenerationService for FakeModel {
        async fn send_streaming(
            &self,
            session: &GenerationSession,
            _parts: Vec<Part>,
        ) -> anyhow::Result<TextStream> {
            self.history_lens.lock().unwrap().push(session.history.len());
            let reply = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok("default reply".to_string()));
            match reply {
                Ok(text) => Ok(Box::pin(futures_util::stream::iter(vec![Ok(text)]))),
                Err(e) => Err(anyhow!(e)),
            }
        }

        async fn single_shot(
            &self,
            _model: &str,
            _parts: Vec<Part>,
            options: &SingleShotOptions,
        ) -> anyhow::Result<String> {
            match options.system_instruction {
                Some(_) => Ok("90".to_string()),
                None => Ok(self.title.clone()),
            }
        }
    }

    fn service(model: Arc<FakeModel>) -> ChatService {
        ChatService::new(AppConfig::default(), model).with_seed(11)
    }

    async fn active_id(chat: &ChatService, identity: &UserIdentity) -> String {
        chat.list(identity)
            .await
            .into_iter()
            .find(|summary| summary.active)
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn send_appends_exchange_and_titles_conversation() {
        let model = FakeModel::new(vec![Ok("Hello!")], "Greeting chat");
        let chat = service(model.clone());
        let me = UserIdentity::anonymous("s1");
        let id = active_id(&chat, &me).await;

        let report = chat.send(&me, &id, "  hi there ", None).await.unwrap();
        assert_eq!(report.reply, "Hello!");
        assert_eq!(report.outcome, Outcome::Accepted);
        assert_eq!(report.score, None);
        assert_eq!(report.title, "Greeting chat");

        let turns = chat.turns(&me, &id).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].text, "hi there");
        assert_eq!(turns[1].speaker, Speaker::Assistant);
        assert_eq!(*model.history_lens.lock().unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn failed_generation_appends_apology() {
        let chat = service(FakeModel::new(vec![Err("down")], "t"));
        let me = UserIdentity::anonymous("s2");
        let id = active_id(&chat, &me).await;

        let report = chat.send(&me, &id, "hi", None).await.unwrap();
        assert_eq!(report.outcome, Outcome::Failed);
        assert_eq!(report.reply, APOLOGY_MESSAGE);
        let turns = chat.turns(&me, &id).await.unwrap();
        assert_eq!(turns.last().unwrap().text, APOLOGY_MESSAGE);
    }

    #[tokio::test]
    async fn supervised_turn_reports_mean_score() {
        let model = FakeModel::new(vec![Ok("checked answer")], "t");
        let chat = service(model);
        let mut config = chat.config().await;
        config.supervision.enabled = true;
        chat.update_config(config).await.unwrap();
        let me = UserIdentity::anonymous("s3");
        let id = active_id(&chat, &me).await;

        let report = chat.send(&me, &id, "hi", None).await.unwrap();
        assert_eq!(report.score, Some(90.0));
        assert_eq!(report.attempts, 1);
    }

    #[tokio::test]
    async fn empty_message_is_rejected() {
        let chat = service(FakeModel::new(vec![], "t"));
        let me = UserIdentity::anonymous("s4");
        let id = active_id(&chat, &me).await;
        assert!(matches!(
            chat.send(&me, &id, "   ", None).await,
            Err(ChatError::Invalid(_))
        ));
        assert!(chat.turns(&me, &id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn regenerate_replaces_last_reply() {
        let model = FakeModel::new(vec![Ok("first"), Ok("second")], "t");
        let chat = service(model.clone());
        let me = UserIdentity::anonymous("s5");
        let id = active_id(&chat, &me).await;

        assert!(matches!(
            chat.regenerate(&me, &id).await,
            Err(ChatError::Invalid(_))
        ));
        chat.send(&me, &id, "question", None).await.unwrap();
        let report = chat.regenerate(&me, &id).await.unwrap();

        assert_eq!(report.reply, "second");
        let turns = chat.turns(&me, &id).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].text, "second");
        assert_eq!(*model.history_lens.lock().unwrap(), vec![0, 0]);
    }

    #[tokio::test]
    async fn titles_are_deduplicated_and_renames_checked() {
        let chat = service(FakeModel::new(vec![], "Same topic"));
        let me = UserIdentity::anonymous("s6");
        let first = active_id(&chat, &me).await;
        chat.send(&me, &first, "a", None).await.unwrap();
        let second = chat.new_conversation(&me).await.unwrap().id;
        let report = chat.send(&me, &second, "b", None).await.unwrap();
        assert_eq!(report.title, "Same topic (1)");

        assert!(matches!(
            chat.rename(&me, &second, "Same topic").await,
            Err(ChatError::Invalid(_))
        ));
        assert!(matches!(
            chat.rename(&me, &second, "  ").await,
            Err(ChatError::Invalid(_))
        ));
        assert_eq!(
            chat.rename(&me, &second, "Other").await.unwrap().title,
            "Other"
        );
    }

    #[tokio::test]
    async fn second_turn_in_same_conversation_is_busy() {
        let chat = service(FakeModel::new(vec![], "t"));
        let guard = chat.begin_turn("conv").unwrap();
        assert!(matches!(chat.begin_turn("conv"), Err(ChatError::Busy(_))));
        drop(guard);
        assert!(chat.begin_turn("conv").is_ok());
    }

    #[tokio::test]
    async fn deleting_active_conversation_cleans_blobs_and_opens_fresh_one() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalBlobStore::new(dir.path(), "http://localhost:8787").unwrap());
        let chat = service(FakeModel::new(vec![], "Picture"))
            .with_blob_store(store.clone());
        let me = UserIdentity::logged_in("Reader@Example.com");
        let id = active_id(&chat, &me).await;

        let upload = Upload {
            file_name: Some("a.png".to_string()),
            mime_type: "image/png".to_string(),
            bytes: vec![1, 2, 3],
        };
        chat.send(&me, &id, "what is this?", Some(upload)).await.unwrap();
        let turns = chat.turns(&me, &id).await.unwrap();
        let url = turns[0].attachment.as_ref().unwrap().url.clone().unwrap();
        let blob_id = url.rsplit('/').next().unwrap().to_string();
        assert!(store.read(&blob_id).await.unwrap().is_some());

        let next = chat.delete(&me, &id).await.unwrap();
        assert_ne!(next, id);
        assert!(store.read(&blob_id).await.unwrap().is_none());
        assert!(matches!(
            chat.get(&me, &id).await,
            Err(ChatError::NotFound(_))
        ));
        assert_eq!(chat.list(&me).await.len(), 1);
    }

    #[tokio::test]
    async fn logged_in_conversations_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(ChatDatabase::new(dir.path().join("faust.db")).unwrap());
        let me = UserIdentity::logged_in("a@example.com");

        let id = {
            let chat = service(FakeModel::new(vec![Ok("stored reply")], "Kept"))
                .with_database(db.clone());
            let id = active_id(&chat, &me).await;
            chat.send(&me, &id, "remember me", None).await.unwrap();
            chat.set_system_instruction(&me, &id, "be formal").await.unwrap();
            id
        };

        let chat = service(FakeModel::new(vec![], "t")).with_database(db);
        let detail = chat.get(&me, &id).await.unwrap();
        assert_eq!(detail.summary.title, "Kept");
        assert!(detail.summary.active);
        assert_eq!(detail.system_instruction, "be formal");
        assert_eq!(detail.turns[1].text, "stored reply");
    }

    #[tokio::test]
    async fn anonymous_users_are_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(ChatDatabase::new(dir.path().join("faust.db")).unwrap());
        let chat = service(FakeModel::new(vec![], "t")).with_database(db.clone());
        let me = UserIdentity::anonymous("visitor");
        let id = active_id(&chat, &me).await;
        chat.send(&me, &id, "hello", None).await.unwrap();

        assert!(db.load_user_document("visitor").unwrap().is_none());
    }

    #[tokio::test]
    async fn ownership_is_scoped_to_the_workspace() {
        let chat = service(FakeModel::new(vec![], "t"));
        let me = UserIdentity::anonymous("owner");
        let other = UserIdentity::anonymous("stranger");
        assert!(!chat.owns(&me, "missing").await);

        let id = active_id(&chat, &me).await;
        assert!(chat.owns(&me, &id).await);
        assert!(!chat.owns(&other, &id).await);
    }

    #[test]
    fn exchange_detection_needs_user_then_assistant() {
        assert!(ends_with_exchange(&[
            ConversationTurn::user("q"),
            ConversationTurn::assistant("a")
        ]));
        assert!(!ends_with_exchange(&[ConversationTurn::assistant("a")]));
        assert!(!ends_with_exchange(&[
            ConversationTurn::assistant("a"),
            ConversationTurn::user("q")
        ]));
    }
}
