//! Process-wide credential storage shared by every outgoing request.

use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};

use crate::credential::{Credential, validate_credential};

/// Read-mostly holder of the current bearer credential.
///
/// A request observing a 401 calls [`CredentialStore::invalidate_if_current`]
/// with the token it sent; the write is visible to every later
/// [`CredentialStore::bearer_token`] call.
#[derive(Debug, Default)]
pub struct CredentialStore {
    current: RwLock<Option<Credential>>,
    invalidated: AtomicBool,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credential(credential: Credential) -> Self {
        let store = Self::new();
        store.set(credential);
        store
    }

    /// Replace the stored credential (login / token refresh).
    pub fn set(&self, credential: Credential) {
        match self.current.write() {
            Ok(mut guard) => *guard = Some(credential),
            Err(e) => tracing::error!("RwLock poisoned writing credential: {e}"),
        }
        self.invalidated.store(false, Ordering::SeqCst);
    }

    /// Forget the credential without flagging a re-authentication (logout).
    pub fn clear(&self) {
        self.take();
        self.invalidated.store(false, Ordering::SeqCst);
    }

    /// Drop the credential because the backend rejected it.
    ///
    /// Returns `true` when a credential was actually removed.
    pub fn invalidate(&self) -> bool {
        let removed = self.take().is_some();
        if removed {
            tracing::warn!("stored credential rejected by backend; invalidated");
            self.invalidated.store(true, Ordering::SeqCst);
        }
        removed
    }

    /// Drop the credential only if it still carries `token`.
    ///
    /// A 401 answering a request sent with an older token must not wipe a
    /// credential set since (re-login while the request was in flight).
    pub fn invalidate_if_current(&self, token: &str) -> bool {
        let removed = match self.current.write() {
            Ok(mut guard) => {
                if guard.as_ref().is_some_and(|c| c.token() == token) {
                    guard.take().is_some()
                } else {
                    false
                }
            }
            Err(e) => {
                tracing::error!("RwLock poisoned invalidating credential: {e}");
                false
            }
        };
        if removed {
            tracing::warn!("stored credential rejected by backend; invalidated");
            self.invalidated.store(true, Ordering::SeqCst);
        } else {
            tracing::debug!("401 for a credential that was already replaced; keeping current one");
        }
        removed
    }

    /// Returns `true` once per invalidation, for one-shot re-auth notices.
    pub fn take_invalidation_notice(&self) -> bool {
        self.invalidated.swap(false, Ordering::SeqCst)
    }

    /// Token to attach to a request, if a valid credential is stored.
    ///
    /// An expired credential is discarded here and never handed out.
    pub fn bearer_token(&self, now: DateTime<Utc>) -> Option<String> {
        let expired = {
            let guard = match self.current.read() {
                Ok(g) => g,
                Err(e) => {
                    tracing::error!("RwLock poisoned reading credential: {e}");
                    return None;
                }
            };
            match guard.as_ref() {
                None => return None,
                Some(c) if validate_credential(c, now).is_ok() => return Some(c.token().to_string()),
                Some(_) => true,
            }
        };

        if expired {
            // Re-check under the write lock: a fresh credential may have landed.
            if let Ok(mut guard) = self.current.write() {
                let still_invalid = guard
                    .as_ref()
                    .is_some_and(|c| validate_credential(c, now).is_err());
                if still_invalid {
                    tracing::info!("discarding expired credential before request");
                    *guard = None;
                } else if let Some(c) = guard.as_ref() {
                    return Some(c.token().to_string());
                }
            }
        }
        None
    }

    pub fn is_authenticated(&self, now: DateTime<Utc>) -> bool {
        self.bearer_token(now).is_some()
    }

    fn take(&self) -> Option<Credential> {
        match self.current.write() {
            Ok(mut guard) => guard.take(),
            Err(e) => {
                tracing::error!("RwLock poisoned clearing credential: {e}");
                None
            }
        }
    }
}
