//! Per-slot session ownership and the session state machine.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::{
    TkError, TkResult,
    attributes::{self, AttributeValue},
    provider::{
        AttributeTag, KeyPairHandles, ObjectHandle, SearchTemplate, SessionHandle, Slot,
        TokenInfo, TokenProvider,
    },
};

/// Session state of one slot. At most one session exists per slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Open(SessionHandle),
    LoggedIn(SessionHandle),
}

/// Owns the open/authenticated state of one slot and mediates every call
/// into the capability provider for that slot.
///
/// Transitions that do not match the current state are rejected: a second
/// `open` or a `close` with nothing open is a warning no-op, while
/// `login`/`logout` without the required state is a hard
/// [`TkError::InvalidState`]. Token absence fails every transition with
/// [`TkError::NoTokenPresent`].
pub struct SlotManager {
    provider: Arc<dyn TokenProvider>,
    slot: Slot,
    state: SessionState,
}

impl SlotManager {
    #[must_use]
    pub fn new(provider: Arc<dyn TokenProvider>, slot: Slot) -> Self {
        SlotManager {
            provider,
            slot,
            state: SessionState::Closed,
        }
    }

    #[must_use]
    pub fn slot(&self) -> &Slot {
        &self.slot
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn token_info(&self) -> TkResult<TokenInfo> {
        self.ensure_token_present()?;
        self.provider.token_info(self.slot.id)
    }

    pub fn open_session(&mut self, read_write: bool) -> TkResult<()> {
        self.ensure_token_present()?;
        if self.state != SessionState::Closed {
            warn!("slot {}: session is already open, ignoring", self.slot.id);
            return Ok(());
        }
        let handle = self.provider.open_session(self.slot.id, read_write)?;
        debug!("slot {}: session {handle} opened", self.slot.id);
        self.state = SessionState::Open(handle);
        Ok(())
    }

    pub fn close_session(&mut self) -> TkResult<()> {
        self.ensure_token_present()?;
        let handle = match self.state {
            SessionState::Closed => {
                warn!("slot {}: no session open, ignoring close", self.slot.id);
                return Ok(());
            }
            SessionState::Open(handle) | SessionState::LoggedIn(handle) => handle,
        };
        // The handle is forgotten before the provider call; a failed close
        // must not be retried from Drop.
        self.state = SessionState::Closed;
        self.provider.close_session(handle)?;
        debug!("slot {}: session {handle} closed", self.slot.id);
        Ok(())
    }

    pub fn login(&mut self, pin: &str) -> TkResult<()> {
        self.ensure_token_present()?;
        match self.state {
            SessionState::Open(handle) => {
                self.provider.login(handle, pin)?;
                self.state = SessionState::LoggedIn(handle);
                Ok(())
            }
            SessionState::Closed => Err(TkError::InvalidState("login requires an open session")),
            SessionState::LoggedIn(_) => {
                Err(TkError::InvalidState("session is already logged in"))
            }
        }
    }

    pub fn logout(&mut self) -> TkResult<()> {
        self.ensure_token_present()?;
        match self.state {
            SessionState::LoggedIn(handle) => {
                self.provider.logout(handle)?;
                self.state = SessionState::Open(handle);
                Ok(())
            }
            SessionState::Closed => Err(TkError::InvalidState("logout requires an open session")),
            SessionState::Open(_) => Err(TkError::InvalidState("session is not logged in")),
        }
    }

    /// Search the token, draining the provider-side iteration fully into an
    /// ordered sequence.
    pub fn find_objects(&self, template: &SearchTemplate) -> TkResult<Vec<ObjectHandle>> {
        let session = self.open_handle()?;
        self.provider.find_objects(session, template)
    }

    /// Two-phase attribute retrieval (see [`crate::attributes`]).
    pub fn read_attributes(
        &self,
        object: ObjectHandle,
        tags: &[AttributeTag],
    ) -> TkResult<Vec<AttributeValue>> {
        let session = self.open_handle()?;
        attributes::query(self.provider.as_ref(), session, object, tags)
    }

    pub fn read_attribute(
        &self,
        object: ObjectHandle,
        tag: AttributeTag,
    ) -> TkResult<AttributeValue> {
        let session = self.open_handle()?;
        attributes::query_one(self.provider.as_ref(), session, object, tag)
    }

    pub fn digest(&self, data: &[u8]) -> TkResult<Vec<u8>> {
        let session = self.open_handle()?;
        self.provider.digest(session, data)
    }

    pub fn encrypt(&self, key: ObjectHandle, plaintext: &[u8]) -> TkResult<Vec<u8>> {
        let session = self.open_handle()?;
        self.provider.encrypt(session, key, plaintext)
    }

    pub fn decrypt(&self, key: ObjectHandle, ciphertext: &[u8]) -> TkResult<Vec<u8>> {
        let session = self.open_handle()?;
        self.provider.decrypt(session, key, ciphertext)
    }

    pub fn sign(&self, key: ObjectHandle, data: &[u8]) -> TkResult<Vec<u8>> {
        let session = self.open_handle()?;
        self.provider.sign(session, key, data)
    }

    /// Signature verification; a mismatch is `Ok(false)`, never an error.
    pub fn verify(&self, key: ObjectHandle, data: &[u8], signature: &[u8]) -> TkResult<bool> {
        let session = self.open_handle()?;
        self.provider.verify(session, key, data, signature)
    }

    pub fn generate_random(&self, len: usize) -> TkResult<Vec<u8>> {
        let session = self.open_handle()?;
        self.provider.generate_random(session, len)
    }

    pub fn generate_key_pair(&self) -> TkResult<KeyPairHandles> {
        let session = self.open_handle()?;
        self.provider.generate_key_pair(session)
    }

    fn ensure_token_present(&self) -> TkResult<()> {
        if self.slot.token_present {
            Ok(())
        } else {
            Err(TkError::NoTokenPresent(self.slot.id))
        }
    }

    fn open_handle(&self) -> TkResult<SessionHandle> {
        match self.state {
            SessionState::Closed => Err(TkError::InvalidState("no session open")),
            SessionState::Open(handle) | SessionState::LoggedIn(handle) => Ok(handle),
        }
    }
}

impl Drop for SlotManager {
    fn drop(&mut self) {
        if let SessionState::Open(handle) | SessionState::LoggedIn(handle) = self.state {
            warn!("slot {}: forcing closure of open session", self.slot.id);
            if let Err(e) = self.provider.close_session(handle) {
                warn!("slot {}: forced session close failed: {e}", self.slot.id);
            }
        }
    }
}
