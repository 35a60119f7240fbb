use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use crate::conversation::{Attachment, ConversationSession, ConversationTurn, RemoteRef, Speaker};

/// A persisted turn. Attachment bytes never reach the database; only the
/// remote reference survives a reload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTurn {
    pub speaker: Speaker,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_ref: Option<RemoteRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredConversation {
    pub title: String,
    #[serde(default)]
    pub system_instruction: String,
    #[serde(default)]
    pub turns: Vec<StoredTurn>,
    pub updated_at: DateTime<Utc>,
}

impl StoredConversation {
    pub fn from_session(session: &ConversationSession) -> Self {
        Self {
            title: session.title.clone(),
            system_instruction: session.system_instruction.clone(),
            turns: session
                .turns
                .iter()
                .map(|turn| StoredTurn {
                    speaker: turn.speaker,
                    text: turn.text.clone(),
                    remote_ref: turn
                        .attachment
                        .as_ref()
                        .and_then(|attachment| attachment.remote_ref.clone()),
                    mime_type: turn
                        .attachment
                        .as_ref()
                        .filter(|attachment| attachment.remote_ref.is_some())
                        .map(|attachment| attachment.mime_type.clone()),
                })
                .collect(),
            updated_at: session.updated_at,
        }
    }

    pub fn into_session(self, id: String) -> ConversationSession {
        let turns = self
            .turns
            .into_iter()
            .map(|stored| {
                let turn = ConversationTurn {
                    speaker: stored.speaker,
                    text: stored.text,
                    attachment: None,
                };
                match stored.remote_ref {
                    Some(remote) => {
                        let mut attachment = Attachment::new(
                            Vec::new(),
                            stored
                                .mime_type
                                .unwrap_or_else(|| "application/octet-stream".to_string()),
                        );
                        attachment.remote_ref = Some(remote);
                        turn.with_attachment(attachment)
                    }
                    None => turn,
                }
            })
            .collect();

        ConversationSession {
            id,
            title: self.title,
            system_instruction: self.system_instruction,
            turns,
            updated_at: self.updated_at,
        }
    }
}

/// Everything persisted for one logged-in user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserDocument {
    #[serde(default)]
    pub conversations: BTreeMap<String, StoredConversation>,
    #[serde(default)]
    pub last_active_conversation: Option<String>,
}

pub struct ChatDatabase {
    conn: Mutex<Connection>,
}

impl ChatDatabase {
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {}", path.display()))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute_batch(
            r#"CREATE TABLE IF NOT EXISTS user_documents (
                user_id TEXT PRIMARY KEY,
                document TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );"#,
        )
        .context("Failed to create user_documents table")?;
        Ok(())
    }

    pub fn load_user_document(&self, user_id: &str) -> Result<Option<UserDocument>> {
        let conn = self.lock_conn()?;
        let result = conn.query_row(
            "SELECT document FROM user_documents WHERE user_id = ?1",
            [user_id],
            |row| row.get::<_, String>(0),
        );

        match result {
            Ok(raw) => {
                let document = serde_json::from_str(&raw)
                    .with_context(|| format!("Corrupt document for user {}", user_id))?;
                Ok(Some(document))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save_user_document(&self, user_id: &str, document: &UserDocument) -> Result<()> {
        let raw = serde_json::to_string(document).context("Failed to serialize user document")?;
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO user_documents (user_id, document, updated_at) VALUES (?1, ?2, ?3)",
            params![user_id, raw, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn delete_user_document(&self, user_id: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute("DELETE FROM user_documents WHERE user_id = ?1", [user_id])?;
        Ok(())
    }
}
