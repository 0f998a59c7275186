//! At-most-one persisted final response per request id, plus its attempt
//! log.

use parking_lot::RwLock;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::db::Database;
use crate::health::now_ms;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    EvalFail,
    RateLimit,
    Transient,
    Quota,
    Permanent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub model_id: String,
    pub outcome: AttemptOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Complete,
}

#[derive(Debug, Clone)]
pub struct RequestSession {
    pub request_id: String,
    pub status: SessionStatus,
    pub task_type: Option<String>,
    pub model_id: Option<String>,
    pub response_text: Option<String>,
    pub attempts: Vec<AttemptRecord>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Cache-through SQLite-backed per-request-id session and attempt log.
/// Status transitions are strictly pending -> complete; no rollback.
pub struct SessionStore {
    db: Arc<Database>,
    cache: RwLock<HashMap<String, RequestSession>>,
}

impl SessionStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, request_id: &str) -> Option<RequestSession> {
        if let Some(s) = self.cache.read().get(request_id) {
            return Some(s.clone());
        }

        let conn = self.db.lock();
        let row: Option<(String, Option<String>, Option<String>, Option<String>, String, i64, i64)> = conn
            .query_row(
                "SELECT status, task_type, model_id, response_text, attempts_json, created_at, updated_at \
                 FROM request_sessions WHERE request_id = ?1",
                params![request_id],
                |r| {
                    Ok((
                        r.get(0)?,
                        r.get(1)?,
                        r.get(2)?,
                        r.get(3)?,
                        r.get(4)?,
                        r.get(5)?,
                        r.get(6)?,
                    ))
                },
            )
            .optional()
            .unwrap_or(None);

        let (status, task_type, model_id, response_text, attempts_json, created_at, updated_at) = row?;
        let status = if status == "complete" {
            SessionStatus::Complete
        } else {
            SessionStatus::Pending
        };
        let attempts: Vec<AttemptRecord> = serde_json::from_str(&attempts_json).unwrap_or_default();
        let session = RequestSession {
            request_id: request_id.to_string(),
            status,
            task_type,
            model_id,
            response_text,
            attempts,
            created_at,
            updated_at,
        };
        drop(conn);
        self.cache
            .write()
            .insert(request_id.to_string(), session.clone());
        Some(session)
    }

    fn persist(&self, session: &RequestSession) {
        let status = match session.status {
            SessionStatus::Pending => "pending",
            SessionStatus::Complete => "complete",
        };
        let attempts_json = serde_json::to_string(&session.attempts).unwrap_or_else(|_| "[]".to_string());
        let conn = self.db.lock();
        let _ = conn.execute(
            "INSERT INTO request_sessions \
               (request_id, status, task_type, model_id, response_text, attempts_json, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
             ON CONFLICT(request_id) DO UPDATE SET \
               status = excluded.status, \
               task_type = excluded.task_type, \
               model_id = excluded.model_id, \
               response_text = excluded.response_text, \
               attempts_json = excluded.attempts_json, \
               updated_at = excluded.updated_at",
            params![
                session.request_id,
                status,
                session.task_type,
                session.model_id,
                session.response_text,
                attempts_json,
                session.created_at,
                session.updated_at,
            ],
        );
        drop(conn);
        self.cache
            .write()
            .insert(session.request_id.clone(), session.clone());
    }

    /// Appends an attempt, creating a pending session if absent.
    pub fn record_attempt(&self, request_id: &str, task_type: &str, attempt: AttemptRecord) {
        let now = now_ms();
        let mut session = self.get(request_id).unwrap_or_else(|| RequestSession {
            request_id: request_id.to_string(),
            status: SessionStatus::Pending,
            task_type: Some(task_type.to_string()),
            model_id: None,
            response_text: None,
            attempts: Vec::new(),
            created_at: now,
            updated_at: now,
        });
        session.attempts.push(attempt);
        session.updated_at = now;
        self.persist(&session);
    }

    /// Transitions to complete and stores the final text. No-op if the
    /// session is already complete, enforcing at-most-one completion.
    pub fn record_result(&self, request_id: &str, task_type: &str, model_id: &str, text: &str) {
        let now = now_ms();
        let mut session = self.get(request_id).unwrap_or_else(|| RequestSession {
            request_id: request_id.to_string(),
            status: SessionStatus::Pending,
            task_type: Some(task_type.to_string()),
            model_id: None,
            response_text: None,
            attempts: Vec::new(),
            created_at: now,
            updated_at: now,
        });
        if session.status == SessionStatus::Complete {
            return;
        }
        session.status = SessionStatus::Complete;
        session.model_id = Some(model_id.to_string());
        session.response_text = Some(text.to_string());
        session.updated_at = now;
        self.persist(&session);
    }
}
