//! Signed-in user state shared by the whole process.
//!
//! The current session is only reachable through [`current`], [`set`] and
//! [`clear`]. [`init`] restores a persisted credential at startup and keeps the
//! [`CredentialStore`] so later changes are written back to disk.

use crate::error::ChatResult;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSession {
    pub email: String,
    pub token: String,
}

#[derive(Default)]
struct AuthState {
    session: Option<AuthSession>,
    store: Option<CredentialStore>,
}

static AUTH_STATE: Lazy<RwLock<AuthState>> = Lazy::new(|| RwLock::new(AuthState::default()));

/// Restores the persisted session, if any, and remembers `store` for later writes.
pub fn init(store: CredentialStore) -> Option<AuthSession> {
    let restored = store.load();
    match &restored {
        Some(session) => tracing::info!(email = %session.email, "restored saved session"),
        None => tracing::debug!(path = %store.path().display(), "no saved session"),
    }
    let mut state = AUTH_STATE.write().unwrap_or_else(PoisonError::into_inner);
    state.session = restored.clone();
    state.store = Some(store);
    restored
}

pub fn current() -> Option<AuthSession> {
    AUTH_STATE
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .session
        .clone()
}

pub fn token() -> Option<String> {
    current().map(|session| session.token)
}

pub fn set(session: AuthSession) {
    let mut state = AUTH_STATE.write().unwrap_or_else(PoisonError::into_inner);
    if let Some(store) = &state.store
        && let Err(err) = store.save(&session)
    {
        tracing::warn!("failed to persist session: {err}");
    }
    state.session = Some(session);
}

/// Forgets the current user and removes the persisted credential.
pub fn clear() {
    let mut state = AUTH_STATE.write().unwrap_or_else(PoisonError::into_inner);
    if let Some(store) = &state.store
        && let Err(err) = store.remove()
    {
        tracing::warn!("failed to remove saved session: {err}");
    }
    state.session = None;
}

/// JSON file holding the last signed-in session.
#[derive(Clone, Debug)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<data_local_dir>/docchat/session.json`, or `cache/session.json` when
    /// the platform has no data directory.
    pub fn default_location() -> Self {
        if let Some(data_dir) = dirs::data_local_dir() {
            return Self::new(data_dir.join("docchat").join("session.json"));
        }
        Self::new(PathBuf::from("cache").join("session.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Option<AuthSession> {
        let raw = fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(session) => Some(session),
            Err(err) => {
                tracing::warn!(path = %self.path.display(), "ignoring unreadable session file: {err}");
                None
            }
        }
    }

    pub fn save(&self, session: &AuthSession) -> ChatResult<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string(session)?)?;
        Ok(())
    }

    pub fn remove(&self) -> ChatResult<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}
