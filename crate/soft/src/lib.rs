//! In-memory software token.
//!
//! Implements the full capability interface against process-local state so
//! the session, taxonomy and pipeline layers can be exercised without
//! hardware. RSA and SHA-1 primitives are real (OpenSSL); PINs, sessions
//! and attribute storage behave like a well-mannered Cryptoki module,
//! including the status codes a hardware token would return.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use openssl::{
    error::ErrorStack,
    hash::{MessageDigest, hash},
    pkey::Private,
    rsa::{Padding, Rsa},
};
use tracing::{debug, warn};

use tokendrill_pkcs11_sys::{
    CKK_RSA, CKO_CERTIFICATE, CKO_DATA, CKO_PRIVATE_KEY, CKO_PUBLIC_KEY,
    CKR_ATTRIBUTE_TYPE_INVALID, CKR_BUFFER_TOO_SMALL, CKR_FUNCTION_FAILED,
    CKR_KEY_FUNCTION_NOT_PERMITTED, CKR_KEY_HANDLE_INVALID, CKR_OBJECT_HANDLE_INVALID,
    CKR_PIN_INCORRECT, CKR_SESSION_HANDLE_INVALID, CKR_SLOT_ID_INVALID, CKR_TOKEN_NOT_PRESENT,
    CKR_USER_NOT_LOGGED_IN,
};
use tokendrill_token::{
    AttributeLength, AttributeRequest, AttributeTag, KeyPairHandles, ObjectHandle,
    SearchTemplate, SessionHandle, Slot, SlotId, TkError, TkResult, TokenInfo, TokenProvider,
    provider::{ulong_from_bytes, ulong_to_bytes},
};

#[cfg(test)]
mod tests;

const RSA_BITS: u32 = 2048;

#[derive(Clone, Copy, PartialEq, Eq)]
enum KeyRole {
    Public,
    Private,
}

#[derive(Clone)]
struct KeyRef {
    rsa: Arc<Rsa<Private>>,
    role: KeyRole,
}

struct SoftObject {
    handle: ObjectHandle,
    attributes: Vec<(AttributeTag, Vec<u8>)>,
    key: Option<KeyRef>,
}

impl SoftObject {
    fn attribute(&self, tag: AttributeTag) -> Option<&[u8]> {
        self.attributes
            .iter()
            .find(|(candidate, _)| *candidate == tag)
            .map(|(_, bytes)| bytes.as_slice())
    }

    fn matches(&self, template: &SearchTemplate) -> bool {
        if let Some(class) = template.class {
            match self.attribute(AttributeTag::Class).and_then(ulong_from_bytes) {
                Some(raw) if raw == class.raw() => {}
                _ => return false,
            }
        }
        if let Some(id) = &template.id {
            match self.attribute(AttributeTag::Id) {
                Some(bytes) if bytes == id.as_slice() => {}
                _ => return false,
            }
        }
        true
    }
}

struct TokenState {
    info: TokenInfo,
    pin: String,
    objects: Vec<SoftObject>,
}

struct SoftSlot {
    slot: Slot,
    token: Option<TokenState>,
}

struct SessionRecord {
    slot_index: usize,
    logged_in: bool,
}

struct Inner {
    slots: Vec<SoftSlot>,
    sessions: HashMap<SessionHandle, SessionRecord>,
    next_object: ObjectHandle,
    next_session: SessionHandle,
}

/// The in-memory token. All setup methods take `&self`; the value is meant
/// to be shared as an `Arc<dyn TokenProvider>` once populated.
pub struct SoftToken {
    inner: Mutex<Inner>,
}

impl Default for SoftToken {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftToken {
    #[must_use]
    pub fn new() -> Self {
        SoftToken {
            inner: Mutex::new(Inner {
                slots: Vec::new(),
                sessions: HashMap::new(),
                next_object: 1,
                next_session: 1,
            }),
        }
    }

    /// Add a slot holding a token with the given label and USER PIN.
    pub fn add_slot(&self, description: &str, label: &str, pin: &str) -> SlotId {
        let mut inner = self.lock();
        let id = inner.slots.len() as SlotId;
        inner.slots.push(SoftSlot {
            slot: slot_description(id, description, true),
            token: Some(TokenState {
                info: TokenInfo {
                    label: label.to_string(),
                    manufacturer: "SoftToken".to_string(),
                    model: "soft".to_string(),
                    serial: format!("SOFT{id:04}"),
                    login_required: true,
                    has_rng: true,
                },
                pin: pin.to_string(),
                objects: Vec::new(),
            }),
        });
        id
    }

    /// Add a slot with no token in it.
    pub fn add_empty_slot(&self, description: &str) -> SlotId {
        let mut inner = self.lock();
        let id = inner.slots.len() as SlotId;
        inner.slots.push(SoftSlot {
            slot: slot_description(id, description, false),
            token: None,
        });
        id
    }

    /// Add an X.509-style certificate object carrying a serial number and,
    /// optionally, a key identifier.
    pub fn add_certificate(
        &self,
        slot: SlotId,
        id: Option<&[u8]>,
        serial: &[u8],
        label: &str,
    ) -> ObjectHandle {
        let mut attributes = storage_attributes(u64::from(CKO_CERTIFICATE), label, false);
        attributes.push((AttributeTag::SerialNumber, serial.to_vec()));
        if let Some(id) = id {
            attributes.push((AttributeTag::Id, id.to_vec()));
        }
        self.push_object(slot, attributes, None)
    }

    /// Generate an RSA key pair and add its public and private objects.
    pub fn add_rsa_keypair(
        &self,
        slot: SlotId,
        id: &[u8],
        label: &str,
    ) -> Result<(ObjectHandle, ObjectHandle), ErrorStack> {
        let rsa = Arc::new(Rsa::generate(RSA_BITS)?);
        Ok(self.push_keypair(slot, id, label, rsa))
    }

    /// Add a data object.
    pub fn add_data_object(
        &self,
        slot: SlotId,
        label: &str,
        application: &str,
        object_id: &[u8],
        value: &[u8],
    ) -> ObjectHandle {
        let mut attributes = storage_attributes(u64::from(CKO_DATA), label, false);
        attributes.push((AttributeTag::Application, application.as_bytes().to_vec()));
        attributes.push((AttributeTag::ObjectId, object_id.to_vec()));
        attributes.push((AttributeTag::Value, value.to_vec()));
        self.push_object(slot, attributes, None)
    }

    /// Add an object whose class attribute carries an arbitrary raw value.
    pub fn add_raw_class_object(&self, slot: SlotId, class_raw: u64) -> ObjectHandle {
        self.push_object(
            slot,
            vec![(AttributeTag::Class, ulong_to_bytes(class_raw))],
            None,
        )
    }

    /// Replace an attribute value on an existing object.
    pub fn set_attribute(&self, slot: SlotId, handle: ObjectHandle, tag: AttributeTag, bytes: &[u8]) {
        let mut inner = self.lock();
        let object = inner.slots[slot as usize]
            .token
            .as_mut()
            .expect("soft token: no token in slot")
            .objects
            .iter_mut()
            .find(|object| object.handle == handle)
            .expect("soft token: unknown object handle");
        if let Some(entry) = object
            .attributes
            .iter_mut()
            .find(|(candidate, _)| *candidate == tag)
        {
            entry.1 = bytes.to_vec();
        } else {
            object.attributes.push((tag, bytes.to_vec()));
        }
    }

    /// Remove an attribute from an existing object so queries report it
    /// absent.
    pub fn remove_attribute(&self, slot: SlotId, handle: ObjectHandle, tag: AttributeTag) {
        let mut inner = self.lock();
        let object = inner.slots[slot as usize]
            .token
            .as_mut()
            .expect("soft token: no token in slot")
            .objects
            .iter_mut()
            .find(|object| object.handle == handle)
            .expect("soft token: unknown object handle");
        object.attributes.retain(|(candidate, _)| *candidate != tag);
    }

    /// Number of sessions currently open across all slots.
    #[must_use]
    pub fn open_session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .expect("soft token: failed to lock state")
    }

    fn push_object(
        &self,
        slot: SlotId,
        attributes: Vec<(AttributeTag, Vec<u8>)>,
        key: Option<KeyRef>,
    ) -> ObjectHandle {
        let mut inner = self.lock();
        let handle = inner.next_object;
        inner.next_object += 1;
        inner.slots[slot as usize]
            .token
            .as_mut()
            .expect("soft token: no token in slot")
            .objects
            .push(SoftObject {
                handle,
                attributes,
                key,
            });
        handle
    }

    fn push_keypair(
        &self,
        slot: SlotId,
        id: &[u8],
        label: &str,
        rsa: Arc<Rsa<Private>>,
    ) -> (ObjectHandle, ObjectHandle) {
        let mut public_attributes = storage_attributes(u64::from(CKO_PUBLIC_KEY), label, false);
        public_attributes.push((AttributeTag::KeyType, ulong_to_bytes(u64::from(CKK_RSA))));
        public_attributes.push((AttributeTag::Id, id.to_vec()));
        let public = self.push_object(
            slot,
            public_attributes,
            Some(KeyRef {
                rsa: rsa.clone(),
                role: KeyRole::Public,
            }),
        );

        let mut private_attributes = storage_attributes(u64::from(CKO_PRIVATE_KEY), label, true);
        private_attributes.push((AttributeTag::KeyType, ulong_to_bytes(u64::from(CKK_RSA))));
        private_attributes.push((AttributeTag::Id, id.to_vec()));
        let private = self.push_object(
            slot,
            private_attributes,
            Some(KeyRef {
                rsa,
                role: KeyRole::Private,
            }),
        );
        (public, private)
    }
}

impl TokenProvider for SoftToken {
    fn slots(&self, token_present_only: bool) -> TkResult<Vec<Slot>> {
        Ok(self
            .lock()
            .slots
            .iter()
            .filter(|entry| !token_present_only || entry.slot.token_present)
            .map(|entry| entry.slot.clone())
            .collect())
    }

    fn token_info(&self, slot_id: SlotId) -> TkResult<TokenInfo> {
        let inner = self.lock();
        let entry = inner
            .slots
            .get(slot_id as usize)
            .ok_or_else(|| fail("C_GetTokenInfo", CKR_SLOT_ID_INVALID))?;
        entry
            .token
            .as_ref()
            .map(|token| token.info.clone())
            .ok_or_else(|| fail("C_GetTokenInfo", CKR_TOKEN_NOT_PRESENT))
    }

    fn open_session(&self, slot_id: SlotId, _read_write: bool) -> TkResult<SessionHandle> {
        let mut inner = self.lock();
        let entry = inner
            .slots
            .get(slot_id as usize)
            .ok_or_else(|| fail("C_OpenSession", CKR_SLOT_ID_INVALID))?;
        if entry.token.is_none() {
            return Err(fail("C_OpenSession", CKR_TOKEN_NOT_PRESENT));
        }
        let handle = inner.next_session;
        inner.next_session += 1;
        inner.sessions.insert(
            handle,
            SessionRecord {
                slot_index: slot_id as usize,
                logged_in: false,
            },
        );
        Ok(handle)
    }

    fn close_session(&self, session: SessionHandle) -> TkResult<()> {
        self.lock()
            .sessions
            .remove(&session)
            .map(|_| ())
            .ok_or_else(|| fail("C_CloseSession", CKR_SESSION_HANDLE_INVALID))
    }

    fn login(&self, session: SessionHandle, pin: &str) -> TkResult<()> {
        let mut inner = self.lock();
        let slot_index = inner
            .sessions
            .get(&session)
            .map(|record| record.slot_index)
            .ok_or_else(|| fail("C_Login", CKR_SESSION_HANDLE_INVALID))?;
        let token = inner.slots[slot_index]
            .token
            .as_ref()
            .ok_or_else(|| fail("C_Login", CKR_TOKEN_NOT_PRESENT))?;
        if token.pin != pin {
            return Err(fail("C_Login", CKR_PIN_INCORRECT));
        }
        let record = inner
            .sessions
            .get_mut(&session)
            .ok_or_else(|| fail("C_Login", CKR_SESSION_HANDLE_INVALID))?;
        if record.logged_in {
            warn!("user already logged in, ignoring login");
            return Ok(());
        }
        record.logged_in = true;
        Ok(())
    }

    fn logout(&self, session: SessionHandle) -> TkResult<()> {
        let mut inner = self.lock();
        let record = inner
            .sessions
            .get_mut(&session)
            .ok_or_else(|| fail("C_Logout", CKR_SESSION_HANDLE_INVALID))?;
        if !record.logged_in {
            return Err(fail("C_Logout", CKR_USER_NOT_LOGGED_IN));
        }
        record.logged_in = false;
        Ok(())
    }

    fn find_objects(
        &self,
        session: SessionHandle,
        template: &SearchTemplate,
    ) -> TkResult<Vec<ObjectHandle>> {
        let inner = self.lock();
        let token = session_token(&inner, session, "C_FindObjects")?;
        Ok(token
            .objects
            .iter()
            .filter(|object| object.matches(template))
            .map(|object| object.handle)
            .collect())
    }

    fn attribute_lengths(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
        tags: &[AttributeTag],
    ) -> TkResult<Vec<AttributeLength>> {
        let inner = self.lock();
        let token = session_token(&inner, session, "C_GetAttributeValue")?;
        let object = find_object(token, object, "C_GetAttributeValue")?;
        Ok(tags
            .iter()
            .map(|tag| match object.attribute(*tag) {
                Some(bytes) => AttributeLength::Present(bytes.len()),
                None => AttributeLength::Absent,
            })
            .collect())
    }

    fn read_attributes(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
        requests: &mut [AttributeRequest],
    ) -> TkResult<()> {
        let inner = self.lock();
        let token = session_token(&inner, session, "C_GetAttributeValue")?;
        let object = find_object(token, object, "C_GetAttributeValue")?;
        for request in requests.iter_mut() {
            let bytes = object
                .attribute(request.tag)
                .ok_or_else(|| fail("C_GetAttributeValue", CKR_ATTRIBUTE_TYPE_INVALID))?;
            if request.buffer.len() != bytes.len() {
                return Err(fail("C_GetAttributeValue", CKR_BUFFER_TOO_SMALL));
            }
            request.buffer.copy_from_slice(bytes);
        }
        Ok(())
    }

    fn digest(&self, session: SessionHandle, data: &[u8]) -> TkResult<Vec<u8>> {
        let inner = self.lock();
        session_token(&inner, session, "C_Digest")?;
        hash(MessageDigest::sha1(), data)
            .map(|digest| digest.to_vec())
            .map_err(|e| crypto_failure("C_Digest", &e))
    }

    fn encrypt(
        &self,
        session: SessionHandle,
        key: ObjectHandle,
        plaintext: &[u8],
    ) -> TkResult<Vec<u8>> {
        let inner = self.lock();
        let token = session_token(&inner, session, "C_Encrypt")?;
        let key = object_key(token, key, KeyRole::Public, "C_Encrypt")?;
        let mut ciphertext = vec![0_u8; key.rsa.size() as usize];
        let written = key
            .rsa
            .public_encrypt(plaintext, &mut ciphertext, Padding::PKCS1)
            .map_err(|e| crypto_failure("C_Encrypt", &e))?;
        ciphertext.truncate(written);
        Ok(ciphertext)
    }

    fn decrypt(
        &self,
        session: SessionHandle,
        key: ObjectHandle,
        ciphertext: &[u8],
    ) -> TkResult<Vec<u8>> {
        let inner = self.lock();
        let token = session_token_logged_in(&inner, session, "C_Decrypt")?;
        let key = object_key(token, key, KeyRole::Private, "C_Decrypt")?;
        let mut plaintext = vec![0_u8; key.rsa.size() as usize];
        let written = key
            .rsa
            .private_decrypt(ciphertext, &mut plaintext, Padding::PKCS1)
            .map_err(|e| crypto_failure("C_Decrypt", &e))?;
        plaintext.truncate(written);
        Ok(plaintext)
    }

    fn sign(&self, session: SessionHandle, key: ObjectHandle, data: &[u8]) -> TkResult<Vec<u8>> {
        let inner = self.lock();
        let token = session_token_logged_in(&inner, session, "C_Sign")?;
        let key = object_key(token, key, KeyRole::Private, "C_Sign")?;
        let mut signature = vec![0_u8; key.rsa.size() as usize];
        let written = key
            .rsa
            .private_encrypt(data, &mut signature, Padding::PKCS1)
            .map_err(|e| crypto_failure("C_Sign", &e))?;
        signature.truncate(written);
        Ok(signature)
    }

    fn verify(
        &self,
        session: SessionHandle,
        key: ObjectHandle,
        data: &[u8],
        signature: &[u8],
    ) -> TkResult<bool> {
        let inner = self.lock();
        let token = session_token(&inner, session, "C_Verify")?;
        let key = object_key(token, key, KeyRole::Public, "C_Verify")?;
        let mut recovered = vec![0_u8; key.rsa.size() as usize];
        // A signature the key cannot open is a mismatch, not a failure.
        match key
            .rsa
            .public_decrypt(signature, &mut recovered, Padding::PKCS1)
        {
            Ok(written) => Ok(&recovered[..written] == data),
            Err(_) => Ok(false),
        }
    }

    fn generate_random(&self, session: SessionHandle, len: usize) -> TkResult<Vec<u8>> {
        let inner = self.lock();
        session_token(&inner, session, "C_GenerateRandom")?;
        let mut bytes = vec![0_u8; len];
        openssl::rand::rand_bytes(&mut bytes)
            .map_err(|e| crypto_failure("C_GenerateRandom", &e))?;
        Ok(bytes)
    }

    fn generate_key_pair(&self, session: SessionHandle) -> TkResult<KeyPairHandles> {
        let slot_index = {
            let inner = self.lock();
            session_token(&inner, session, "C_GenerateKeyPair")?;
            inner.sessions[&session].slot_index
        };
        let rsa = Arc::new(
            Rsa::generate(RSA_BITS).map_err(|e| crypto_failure("C_GenerateKeyPair", &e))?,
        );
        let (public, private) = self.push_keypair(slot_index as SlotId, &[0x01], "TestKey", rsa);
        Ok(KeyPairHandles { public, private })
    }
}

fn slot_description(id: SlotId, description: &str, token_present: bool) -> Slot {
    Slot {
        id,
        description: description.to_string(),
        manufacturer: "SoftToken".to_string(),
        token_present,
        removable: true,
        hardware: false,
        hardware_version: (1, 0),
        firmware_version: (1, 0),
    }
}

fn storage_attributes(class_raw: u64, label: &str, private: bool) -> Vec<(AttributeTag, Vec<u8>)> {
    vec![
        (AttributeTag::Class, ulong_to_bytes(class_raw)),
        (AttributeTag::Token, vec![1]),
        (AttributeTag::Private, vec![u8::from(private)]),
        (AttributeTag::Modifiable, vec![0]),
        (AttributeTag::Label, label.as_bytes().to_vec()),
    ]
}

fn session_token<'a>(
    inner: &'a Inner,
    session: SessionHandle,
    call: &'static str,
) -> TkResult<&'a TokenState> {
    let record = inner
        .sessions
        .get(&session)
        .ok_or_else(|| fail(call, CKR_SESSION_HANDLE_INVALID))?;
    inner.slots[record.slot_index]
        .token
        .as_ref()
        .ok_or_else(|| fail(call, CKR_TOKEN_NOT_PRESENT))
}

fn session_token_logged_in<'a>(
    inner: &'a Inner,
    session: SessionHandle,
    call: &'static str,
) -> TkResult<&'a TokenState> {
    let record = inner
        .sessions
        .get(&session)
        .ok_or_else(|| fail(call, CKR_SESSION_HANDLE_INVALID))?;
    if !record.logged_in {
        return Err(fail(call, CKR_USER_NOT_LOGGED_IN));
    }
    inner.slots[record.slot_index]
        .token
        .as_ref()
        .ok_or_else(|| fail(call, CKR_TOKEN_NOT_PRESENT))
}

fn find_object<'a>(
    token: &'a TokenState,
    handle: ObjectHandle,
    call: &'static str,
) -> TkResult<&'a SoftObject> {
    token
        .objects
        .iter()
        .find(|object| object.handle == handle)
        .ok_or_else(|| fail(call, CKR_OBJECT_HANDLE_INVALID))
}

fn object_key<'a>(
    token: &'a TokenState,
    handle: ObjectHandle,
    role: KeyRole,
    call: &'static str,
) -> TkResult<&'a KeyRef> {
    let key = find_object(token, handle, call)?
        .key
        .as_ref()
        .ok_or_else(|| fail(call, CKR_KEY_HANDLE_INVALID))?;
    if key.role != role {
        return Err(fail(call, CKR_KEY_FUNCTION_NOT_PERMITTED));
    }
    Ok(key)
}

fn fail(call: &'static str, rv: tokendrill_pkcs11_sys::CK_RV) -> TkError {
    TkError::Provider {
        call,
        rv: u64::from(rv),
    }
}

fn crypto_failure(call: &'static str, error: &ErrorStack) -> TkError {
    debug!("{call}: {error}");
    fail(call, CKR_FUNCTION_FAILED)
}
