//! File-backed, TTL-keyed store for OAuth artifacts
//!
//! Every record is one flat JSON file `<prefix><id>.json` under the session
//! storage directory, shaped `{ ...payload, expires, createdAt }` with
//! epoch-millisecond timestamps. Writes go through a temp file plus atomic
//! rename so readers never observe a partial record. A background sweep task
//! removes expired and unparseable files every five minutes; reads do not
//! check expiry themselves.

use crate::error::{GatewayError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Sweep cadence for the background task
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Maximum accepted record id length
pub const MAX_ID_LEN: usize = 128;

static ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new("^[A-Za-z0-9_.-]+$").unwrap());

/// Record categories and their on-disk filename prefixes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// Inbound AS authorization codes (60s)
    AuthCode,
    /// Inbound AS authorization requests (10m)
    AuthRequest,
    /// Inbound tokens and client registrations (24h / 30d)
    Session,
    /// Outbound registered client info (30d)
    Client,
    /// Outbound access/refresh tokens
    Tokens,
    /// Outbound PKCE verifiers (10m)
    Verifier,
    /// Outbound CSRF state (10m)
    State,
}

impl Category {
    /// Filename prefix for the category
    pub fn prefix(&self) -> &'static str {
        match self {
            Category::AuthCode => "auth_code_",
            Category::AuthRequest => "auth_req_",
            Category::Session => "session_",
            Category::Client => "client_",
            Category::Tokens => "tokens_",
            Category::Verifier => "verifier_",
            Category::State => "state_",
        }
    }
}

/// Timestamps carried on every stored record
#[derive(Debug, Clone, Copy)]
pub struct RecordMeta {
    pub expires: i64,
    pub created_at: i64,
}

impl RecordMeta {
    /// True when the record's own expiry has passed
    pub fn is_expired(&self) -> bool {
        self.expires < now_ms()
    }
}

/// File-backed TTL store for OAuth artifacts
pub struct SessionStore {
    dir: PathBuf,
    sweeper: Mutex<Option<tokio::task::JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl SessionStore {
    /// Open (and create if needed) a store rooted at `dir`
    pub fn new(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir).map_err(|e| {
            GatewayError::config(format!(
                "Failed to create session storage directory '{}': {}",
                dir.display(),
                e
            ))
        })?;
        Ok(Self {
            dir,
            sweeper: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Start the periodic sweep task; call once after construction
    pub fn spawn_sweeper(self: &Arc<Self>) {
        let store = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so startup stays quick
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = store.sweep();
                if removed > 0 {
                    info!("Session store sweep removed {} record(s)", removed);
                }
            }
        });
        *self.sweeper.lock().unwrap() = Some(handle);
    }

    /// Write `payload` (a JSON object) with the given TTL
    pub fn write(&self, category: Category, id: &str, payload: &Value, ttl_ms: i64) -> Result<()> {
        let path = self.record_path(category, id)?;
        let object = payload.as_object().ok_or_else(|| {
            GatewayError::validation("Session store payloads must be JSON objects")
        })?;

        let now = now_ms();
        let mut record = object.clone();
        record.insert("expires".to_string(), Value::from(now + ttl_ms));
        record.insert("createdAt".to_string(), Value::from(now));

        let temp = path.with_extension(format!("json.tmp{}", std::process::id()));
        std::fs::write(&temp, serde_json::to_vec(&record)?)?;
        std::fs::rename(&temp, &path)?;
        debug!("Stored {}{}", category.prefix(), id);
        Ok(())
    }

    /// Read a record; absent, unreadable, or malformed files all yield `None`
    pub fn read(&self, category: Category, id: &str) -> Option<(Value, RecordMeta)> {
        let path = self.record_path(category, id).ok()?;
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    debug!("Unreadable session record '{}': {}", path.display(), e);
                }
                return None;
            }
        };
        let mut record: serde_json::Map<String, Value> = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(e) => {
                debug!("Malformed session record '{}': {}", path.display(), e);
                return None;
            }
        };
        let expires = record.remove("expires").and_then(|v| v.as_i64())?;
        let created_at = record.remove("createdAt").and_then(|v| v.as_i64()).unwrap_or(0);
        Some((
            Value::Object(record),
            RecordMeta {
                expires,
                created_at,
            },
        ))
    }

    /// Delete a record; returns whether a file was removed
    pub fn delete(&self, category: Category, id: &str) -> Result<bool> {
        let path = self.record_path(category, id)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Serialize `value` and store it under the category/id
    pub fn put<T: Serialize>(&self, category: Category, id: &str, value: &T, ttl_ms: i64) -> Result<()> {
        self.write(category, id, &serde_json::to_value(value)?, ttl_ms)
    }

    /// Read and deserialize a record
    pub fn get<T: DeserializeOwned>(&self, category: Category, id: &str) -> Option<(T, RecordMeta)> {
        let (payload, meta) = self.read(category, id)?;
        match serde_json::from_value(payload) {
            Ok(value) => Some((value, meta)),
            Err(e) => {
                debug!("Session record {}{} failed to decode: {}", category.prefix(), id, e);
                None
            }
        }
    }

    /// Remove expired and unparseable records; returns the count removed.
    /// Records without an `expires` field are kept.
    pub fn sweep(&self) -> usize {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Session store sweep failed to list '{}': {}", self.dir.display(), e);
                return 0;
            }
        };

        let now = now_ms();
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let drop = match std::fs::read_to_string(&path)
                .ok()
                .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
            {
                None => true,
                Some(record) => match record.get("expires").and_then(Value::as_i64) {
                    Some(expires) => expires < now,
                    None => false,
                },
            };
            if drop && std::fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        removed
    }

    /// Stop the periodic sweeper; idempotent
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            handle.abort();
        }
        debug!("Session store sweeper stopped");
    }

    fn record_path(&self, category: Category, id: &str) -> Result<PathBuf> {
        if id.is_empty() || id.len() > MAX_ID_LEN || !ID_RE.is_match(id) {
            return Err(GatewayError::validation(format!(
                "Invalid session store id '{}'",
                id
            )));
        }
        Ok(self.dir.join(format!("{}{}.json", category.prefix(), id)))
    }
}

impl Drop for SessionStore {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            handle.abort();
        }
    }
}

/// Current time as epoch milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
