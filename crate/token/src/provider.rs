//! The capability interface the core consumes.
//!
//! A [`TokenProvider`] is the only way the rest of the crate talks to a
//! token: slot enumeration, sessions, logins, object search, the two phases
//! of attribute retrieval and the crypto primitives. The production
//! implementation loads a vendor PKCS#11 module (see [`crate::pkcs11`]);
//! the test suites substitute an in-memory software token.

use crate::{TkResult, object::ObjectClass};

pub type SlotId = u64;
pub type SessionHandle = u64;
pub type ObjectHandle = u64;

/// A physical or logical token reader, as reported at discovery.
///
/// Immutable after discovery; the session that may be attached to the slot
/// lives in [`crate::slots::SlotManager`], not here.
#[derive(Debug, Clone)]
pub struct Slot {
    pub id: SlotId,
    pub description: String,
    pub manufacturer: String,
    pub token_present: bool,
    pub removable: bool,
    pub hardware: bool,
    pub hardware_version: (u8, u8),
    pub firmware_version: (u8, u8),
}

/// Basic information about the token currently present in a slot.
#[derive(Debug, Clone)]
pub struct TokenInfo {
    pub label: String,
    pub manufacturer: String,
    pub model: String,
    pub serial: String,
    pub login_required: bool,
    pub has_rng: bool,
}

/// The attributes the core ever asks a token for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeTag {
    Class,
    Token,
    Private,
    Modifiable,
    Label,
    Application,
    ObjectId,
    Value,
    SerialNumber,
    KeyType,
    Id,
}

/// Phase-1 answer for one requested attribute.
///
/// `Present(0)` is a real, empty value. `Absent` means the token does not
/// carry the attribute for this object at all; the two are never conflated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeLength {
    Absent,
    Present(usize),
}

/// Phase-2 request: a tag together with a buffer of exactly the length the
/// provider reported in phase 1. The provider fills the buffer in place.
#[derive(Debug)]
pub struct AttributeRequest {
    pub tag: AttributeTag,
    pub buffer: Vec<u8>,
}

/// Search template for `find_objects`. Empty template matches every object.
#[derive(Debug, Clone, Default)]
pub struct SearchTemplate {
    pub class: Option<ObjectClass>,
    pub id: Option<Vec<u8>>,
}

impl SearchTemplate {
    #[must_use]
    pub const fn with_class(class: ObjectClass) -> Self {
        SearchTemplate {
            class: Some(class),
            id: None,
        }
    }

    #[must_use]
    pub fn and_id(mut self, id: &[u8]) -> Self {
        self.id = Some(id.to_vec());
        self
    }
}

/// Handles returned by key-pair generation.
#[derive(Debug, Clone, Copy)]
pub struct KeyPairHandles {
    pub public: ObjectHandle,
    pub private: ObjectHandle,
}

/// Capability interface over one loaded token driver.
///
/// Every call blocks until the token answers; there is no concurrency in
/// this design. Failures carry the provider's status code and the failing
/// call name, except signature verification where a mismatch is a normal
/// `false` result.
pub trait TokenProvider: Send + Sync {
    /// Enumerate slots, optionally restricted to those with a token present.
    fn slots(&self, token_present_only: bool) -> TkResult<Vec<Slot>>;

    fn token_info(&self, slot_id: SlotId) -> TkResult<TokenInfo>;

    fn open_session(&self, slot_id: SlotId, read_write: bool) -> TkResult<SessionHandle>;

    fn close_session(&self, session: SessionHandle) -> TkResult<()>;

    fn login(&self, session: SessionHandle, pin: &str) -> TkResult<()>;

    fn logout(&self, session: SessionHandle) -> TkResult<()>;

    /// Search init/iterate/final against the token, drained into an ordered
    /// sequence. The returned order is the provider-reported order.
    fn find_objects(
        &self,
        session: SessionHandle,
        template: &SearchTemplate,
    ) -> TkResult<Vec<ObjectHandle>>;

    /// Phase 1 of attribute retrieval: report the exact byte length of each
    /// requested attribute, or mark it absent. No buffers are touched.
    fn attribute_lengths(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
        tags: &[AttributeTag],
    ) -> TkResult<Vec<AttributeLength>>;

    /// Phase 2 of attribute retrieval: fill the attached buffers in place.
    fn read_attributes(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
        requests: &mut [AttributeRequest],
    ) -> TkResult<()>;

    /// SHA-1 digest of `data`.
    fn digest(&self, session: SessionHandle, data: &[u8]) -> TkResult<Vec<u8>>;

    /// RSA PKCS#1 v1.5 encryption under the given public key.
    fn encrypt(
        &self,
        session: SessionHandle,
        key: ObjectHandle,
        plaintext: &[u8],
    ) -> TkResult<Vec<u8>>;

    /// RSA PKCS#1 v1.5 decryption under the given private key.
    fn decrypt(
        &self,
        session: SessionHandle,
        key: ObjectHandle,
        ciphertext: &[u8],
    ) -> TkResult<Vec<u8>>;

    /// RSA PKCS#1 v1.5 signature over `data` under the given private key.
    fn sign(&self, session: SessionHandle, key: ObjectHandle, data: &[u8]) -> TkResult<Vec<u8>>;

    /// Signature verification. A mismatch is `Ok(false)`, never an error.
    fn verify(
        &self,
        session: SessionHandle,
        key: ObjectHandle,
        data: &[u8],
        signature: &[u8],
    ) -> TkResult<bool>;

    fn generate_random(&self, session: SessionHandle, len: usize) -> TkResult<Vec<u8>>;

    /// RSA PKCS#1 2048-bit key-pair generation with the fixed test
    /// templates. Present in the capability, not invoked by the pipeline.
    fn generate_key_pair(&self, session: SessionHandle) -> TkResult<KeyPairHandles>;
}

/// CK_ULONG-valued attributes (class, key type) travel as native-endian
/// bytes, 4 or 8 wide depending on the platform the module was built for.
#[must_use]
pub fn ulong_from_bytes(bytes: &[u8]) -> Option<u64> {
    match bytes.len() {
        4 => Some(u64::from(u32::from_ne_bytes(bytes.try_into().ok()?))),
        8 => Some(u64::from_ne_bytes(bytes.try_into().ok()?)),
        _ => None,
    }
}

/// Encode a CK_ULONG attribute value the way [`ulong_from_bytes`] reads it.
#[must_use]
pub fn ulong_to_bytes(value: u64) -> Vec<u8> {
    value.to_ne_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::{ulong_from_bytes, ulong_to_bytes};

    #[test]
    fn ulong_round_trips_through_bytes() {
        for value in [0_u64, 1, 3, 0x8000_0000, u64::from(u32::MAX)] {
            assert_eq!(ulong_from_bytes(&ulong_to_bytes(value)), Some(value));
        }
    }

    #[test]
    fn ulong_accepts_narrow_encodings() {
        let narrow = 7_u32.to_ne_bytes();
        assert_eq!(ulong_from_bytes(&narrow), Some(7));
    }

    #[test]
    fn ulong_rejects_odd_widths() {
        assert_eq!(ulong_from_bytes(&[1, 2, 3]), None);
        assert_eq!(ulong_from_bytes(&[]), None);
    }
}
