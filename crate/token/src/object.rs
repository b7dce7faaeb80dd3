//! Typed views over opaque token object handles.
//!
//! An object handle is classified by reading its class attribute alone,
//! then the matching variant fetches its own attribute set. The taxonomy is
//! a closed tagged variant; an unrecognized class value fails only the
//! resolution at hand, never the session.

use hex::encode_upper;
use tracing::debug;

use tokendrill_pkcs11_sys::{
    CKK_ACTI, CKK_AES, CKK_ARIA, CKK_BATON, CKK_BLOWFISH, CKK_CAMELLIA, CKK_CAST, CKK_CAST3,
    CKK_CAST128, CKK_CDMF, CKK_DES, CKK_DES2, CKK_DES3, CKK_DH, CKK_DSA, CKK_EC,
    CKK_GENERIC_SECRET, CKK_HOTP, CKK_IDEA, CKK_JUNIPER, CKK_KEA, CKK_RC2, CKK_RC4, CKK_RC5,
    CKK_RSA, CKK_SECURID, CKK_SKIPJACK, CKK_TWOFISH, CKK_VENDOR_DEFINED, CKK_X9_42_DH,
    CKO_CERTIFICATE, CKO_DATA, CKO_DOMAIN_PARAMETERS, CKO_HW_FEATURE, CKO_MECHANISM,
    CKO_PRIVATE_KEY, CKO_PUBLIC_KEY, CKO_SECRET_KEY,
};

use crate::{
    TkError, TkResult,
    attributes::AttributeValue,
    provider::{AttributeTag, ObjectHandle, ulong_from_bytes},
    slots::SlotManager,
};

/// The object classes the taxonomy recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectClass {
    Data,
    Certificate,
    PublicKey,
    PrivateKey,
    SecretKey,
    HwFeature,
    DomainParameters,
    Mechanism,
}

impl ObjectClass {
    #[must_use]
    pub fn from_raw(raw: u64) -> Option<Self> {
        Some(match raw {
            x if x == u64::from(CKO_DATA) => ObjectClass::Data,
            x if x == u64::from(CKO_CERTIFICATE) => ObjectClass::Certificate,
            x if x == u64::from(CKO_PUBLIC_KEY) => ObjectClass::PublicKey,
            x if x == u64::from(CKO_PRIVATE_KEY) => ObjectClass::PrivateKey,
            x if x == u64::from(CKO_SECRET_KEY) => ObjectClass::SecretKey,
            x if x == u64::from(CKO_HW_FEATURE) => ObjectClass::HwFeature,
            x if x == u64::from(CKO_DOMAIN_PARAMETERS) => ObjectClass::DomainParameters,
            x if x == u64::from(CKO_MECHANISM) => ObjectClass::Mechanism,
            _ => return None,
        })
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        match self {
            ObjectClass::Data => CKO_DATA as u64,
            ObjectClass::Certificate => CKO_CERTIFICATE as u64,
            ObjectClass::PublicKey => CKO_PUBLIC_KEY as u64,
            ObjectClass::PrivateKey => CKO_PRIVATE_KEY as u64,
            ObjectClass::SecretKey => CKO_SECRET_KEY as u64,
            ObjectClass::HwFeature => CKO_HW_FEATURE as u64,
            ObjectClass::DomainParameters => CKO_DOMAIN_PARAMETERS as u64,
            ObjectClass::Mechanism => CKO_MECHANISM as u64,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            ObjectClass::Data => "Data",
            ObjectClass::Certificate => "Certificate",
            ObjectClass::PublicKey => "PublicKey",
            ObjectClass::PrivateKey => "PrivateKey",
            ObjectClass::SecretKey => "Secret",
            ObjectClass::HwFeature => "HWFeature",
            ObjectClass::DomainParameters => "DomainParameters",
            ObjectClass::Mechanism => "Mechanism",
        }
    }
}

impl std::fmt::Display for ObjectClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Key-type display mapping with an explicit fallback for unmapped codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Rsa,
    Dsa,
    Dh,
    Ec,
    X9_42Dh,
    Kea,
    GenericSecret,
    Rc2,
    Rc4,
    Des,
    Des2,
    Des3,
    Cast,
    Cast3,
    Cast128,
    Rc5,
    Idea,
    Skipjack,
    Baton,
    Juniper,
    Cdmf,
    Aes,
    Blowfish,
    Twofish,
    SecurId,
    Hotp,
    Acti,
    Camellia,
    Aria,
    Vendor,
    Undefined,
}

impl KeyKind {
    #[must_use]
    pub fn from_raw(raw: u64) -> Self {
        match raw {
            x if x == u64::from(CKK_RSA) => KeyKind::Rsa,
            x if x == u64::from(CKK_DSA) => KeyKind::Dsa,
            x if x == u64::from(CKK_DH) => KeyKind::Dh,
            x if x == u64::from(CKK_EC) => KeyKind::Ec,
            x if x == u64::from(CKK_X9_42_DH) => KeyKind::X9_42Dh,
            x if x == u64::from(CKK_KEA) => KeyKind::Kea,
            x if x == u64::from(CKK_GENERIC_SECRET) => KeyKind::GenericSecret,
            x if x == u64::from(CKK_RC2) => KeyKind::Rc2,
            x if x == u64::from(CKK_RC4) => KeyKind::Rc4,
            x if x == u64::from(CKK_DES) => KeyKind::Des,
            x if x == u64::from(CKK_DES2) => KeyKind::Des2,
            x if x == u64::from(CKK_DES3) => KeyKind::Des3,
            x if x == u64::from(CKK_CAST) => KeyKind::Cast,
            x if x == u64::from(CKK_CAST3) => KeyKind::Cast3,
            x if x == u64::from(CKK_CAST128) => KeyKind::Cast128,
            x if x == u64::from(CKK_RC5) => KeyKind::Rc5,
            x if x == u64::from(CKK_IDEA) => KeyKind::Idea,
            x if x == u64::from(CKK_SKIPJACK) => KeyKind::Skipjack,
            x if x == u64::from(CKK_BATON) => KeyKind::Baton,
            x if x == u64::from(CKK_JUNIPER) => KeyKind::Juniper,
            x if x == u64::from(CKK_CDMF) => KeyKind::Cdmf,
            x if x == u64::from(CKK_AES) => KeyKind::Aes,
            x if x == u64::from(CKK_BLOWFISH) => KeyKind::Blowfish,
            x if x == u64::from(CKK_TWOFISH) => KeyKind::Twofish,
            x if x == u64::from(CKK_SECURID) => KeyKind::SecurId,
            x if x == u64::from(CKK_HOTP) => KeyKind::Hotp,
            x if x == u64::from(CKK_ACTI) => KeyKind::Acti,
            x if x == u64::from(CKK_CAMELLIA) => KeyKind::Camellia,
            x if x == u64::from(CKK_ARIA) => KeyKind::Aria,
            x if x == u64::from(CKK_VENDOR_DEFINED) => KeyKind::Vendor,
            _ => KeyKind::Undefined,
        }
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            KeyKind::Rsa => "RSA",
            KeyKind::Dsa => "DSA",
            KeyKind::Dh => "DH",
            KeyKind::Ec => "EC",
            KeyKind::X9_42Dh => "X9_42_DH",
            KeyKind::Kea => "KEA",
            KeyKind::GenericSecret => "GENERIC",
            KeyKind::Rc2 => "RC2",
            KeyKind::Rc4 => "RC4",
            KeyKind::Des => "DES",
            KeyKind::Des2 => "DES2",
            KeyKind::Des3 => "DES3",
            KeyKind::Cast => "CAST",
            KeyKind::Cast3 => "CAST3",
            KeyKind::Cast128 => "CAST128",
            KeyKind::Rc5 => "RC5",
            KeyKind::Idea => "IDEA",
            KeyKind::Skipjack => "SKIPJACK",
            KeyKind::Baton => "BATON",
            KeyKind::Juniper => "JUNIPER",
            KeyKind::Cdmf => "CDMF",
            KeyKind::Aes => "AES",
            KeyKind::Blowfish => "BLOWFISH",
            KeyKind::Twofish => "TWOFISH",
            KeyKind::SecurId => "SECURID",
            KeyKind::Hotp => "HOTP",
            KeyKind::Acti => "ACTI",
            KeyKind::Camellia => "CAMELLIA",
            KeyKind::Aria => "ARIA",
            KeyKind::Vendor => "VENDOR",
            KeyKind::Undefined => "UNDEFINED",
        }
    }
}

impl std::fmt::Display for KeyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Attributes common to every storage object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageAttributes {
    pub token_resident: bool,
    pub private: bool,
    pub modifiable: bool,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateObject {
    pub storage: StorageAttributes,
    /// Raw serial number bytes; empty when the token carries none.
    pub serial: Vec<u8>,
}

impl CertificateObject {
    #[must_use]
    pub fn serial_hex(&self) -> String {
        encode_upper(&self.serial)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyObject {
    pub storage: StorageAttributes,
    pub kind: KeyKind,
    pub id: Option<Vec<u8>>,
}

impl KeyObject {
    #[must_use]
    pub fn id_hex(&self) -> Option<String> {
        self.id.as_deref().map(encode_upper)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataObject {
    pub storage: StorageAttributes,
    pub application: Option<String>,
    pub object_id: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
}

/// The typed views, dispatched on the discovered class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectView {
    Data(DataObject),
    Certificate(CertificateObject),
    Key(KeyObject),
    /// Hardware-feature, mechanism and domain-parameter classes carry no
    /// further typed attributes at this taxonomy depth.
    Generic,
}

/// A resolved token object: the handle, its class and the typed view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenObject {
    pub handle: ObjectHandle,
    pub class: ObjectClass,
    pub view: ObjectView,
}

impl TokenObject {
    /// Dump every fetched attribute to the debug log.
    pub fn log_attributes(&self) {
        debug!("CKA_CLASS        {}", self.class);
        let storage = match &self.view {
            ObjectView::Data(data) => Some(&data.storage),
            ObjectView::Certificate(certificate) => Some(&certificate.storage),
            ObjectView::Key(key) => Some(&key.storage),
            ObjectView::Generic => None,
        };
        if let Some(storage) = storage {
            debug!("CKA_TOKEN        {}", storage.token_resident);
            debug!("CKA_PRIVATE      {}", storage.private);
            debug!("CKA_MODIFIABLE   {}", storage.modifiable);
            debug!("CKA_LABEL        \"{}\"", storage.label);
        }
        match &self.view {
            ObjectView::Certificate(certificate) => {
                debug!("CKA_SERIAL       \"{}\"", certificate.serial_hex());
            }
            ObjectView::Key(key) => {
                debug!("CKA_KEY_TYPE     \"{}\"", key.kind);
                if let Some(id) = key.id_hex() {
                    debug!("CKA_ID           \"{id}\"");
                }
            }
            ObjectView::Data(data) => {
                if let Some(application) = &data.application {
                    debug!("CKA_APPLICATION  \"{application}\"");
                }
                if let Some(object_id) = &data.object_id {
                    debug!("CKA_OBJECT_ID    \"{}\"", encode_upper(object_id));
                }
                if let Some(value) = &data.value {
                    debug!("CKA_VALUE        \"{}\"", encode_upper(value));
                }
            }
            ObjectView::Generic => {}
        }
    }
}

/// Interrogate the token for `handle` and build the matching typed view.
///
/// Issues read queries only; the session is never mutated.
pub fn resolve(session: &SlotManager, handle: ObjectHandle) -> TkResult<TokenObject> {
    let class_value = session.read_attribute(handle, AttributeTag::Class)?;
    let raw = class_value
        .as_bytes()
        .and_then(ulong_from_bytes)
        .ok_or_else(|| {
            TkError::Default(format!("object {handle} carries no usable class attribute"))
        })?;
    let class = ObjectClass::from_raw(raw).ok_or(TkError::Taxonomy(raw))?;

    let view = match class {
        ObjectClass::Data => ObjectView::Data(query_data(session, handle)?),
        ObjectClass::Certificate => ObjectView::Certificate(query_certificate(session, handle)?),
        ObjectClass::PublicKey | ObjectClass::PrivateKey | ObjectClass::SecretKey => {
            ObjectView::Key(query_key(session, handle)?)
        }
        ObjectClass::HwFeature | ObjectClass::DomainParameters | ObjectClass::Mechanism => {
            ObjectView::Generic
        }
    };

    Ok(TokenObject {
        handle,
        class,
        view,
    })
}

fn query_storage(session: &SlotManager, handle: ObjectHandle) -> TkResult<StorageAttributes> {
    let values = session.read_attributes(
        handle,
        &[
            AttributeTag::Label,
            AttributeTag::Token,
            AttributeTag::Private,
            AttributeTag::Modifiable,
        ],
    )?;
    Ok(StorageAttributes {
        label: values[0]
            .as_bytes()
            .map(text_from_bytes)
            .unwrap_or_default(),
        token_resident: bool_attribute(&values[1]),
        private: bool_attribute(&values[2]),
        modifiable: bool_attribute(&values[3]),
    })
}

fn query_certificate(session: &SlotManager, handle: ObjectHandle) -> TkResult<CertificateObject> {
    let storage = query_storage(session, handle)?;
    let serial = session
        .read_attribute(handle, AttributeTag::SerialNumber)?
        .into_bytes()
        .unwrap_or_default();
    Ok(CertificateObject { storage, serial })
}

fn query_key(session: &SlotManager, handle: ObjectHandle) -> TkResult<KeyObject> {
    let storage = query_storage(session, handle)?;
    let values = session.read_attributes(handle, &[AttributeTag::KeyType, AttributeTag::Id])?;
    let kind = values[0]
        .as_bytes()
        .and_then(ulong_from_bytes)
        .map_or(KeyKind::Undefined, KeyKind::from_raw);
    let id = values[1].clone().into_bytes();
    Ok(KeyObject { storage, kind, id })
}

fn query_data(session: &SlotManager, handle: ObjectHandle) -> TkResult<DataObject> {
    let storage = query_storage(session, handle)?;
    let values = session.read_attributes(
        handle,
        &[
            AttributeTag::Application,
            AttributeTag::ObjectId,
            AttributeTag::Value,
        ],
    )?;
    Ok(DataObject {
        storage,
        application: values[0].as_bytes().map(text_from_bytes),
        object_id: values[1].clone().into_bytes(),
        value: values[2].clone().into_bytes(),
    })
}

fn bool_attribute(value: &AttributeValue) -> bool {
    matches!(value.as_bytes(), Some(bytes) if bytes.first() == Some(&1))
}

/// Token text fields are fixed-width, space padded and not NUL terminated.
pub(crate) fn text_from_bytes(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches([' ', '\0'])
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::{KeyKind, ObjectClass, text_from_bytes};

    #[test]
    fn class_mapping_is_closed() {
        assert_eq!(ObjectClass::from_raw(0), Some(ObjectClass::Data));
        assert_eq!(ObjectClass::from_raw(1), Some(ObjectClass::Certificate));
        assert_eq!(ObjectClass::from_raw(4), Some(ObjectClass::SecretKey));
        assert_eq!(ObjectClass::from_raw(0x1234), None);
        assert_eq!(ObjectClass::from_raw(0x8000_0000), None);
    }

    #[test]
    fn class_round_trips_through_raw() {
        for class in [
            ObjectClass::Data,
            ObjectClass::Certificate,
            ObjectClass::PublicKey,
            ObjectClass::PrivateKey,
            ObjectClass::SecretKey,
            ObjectClass::HwFeature,
            ObjectClass::DomainParameters,
            ObjectClass::Mechanism,
        ] {
            assert_eq!(ObjectClass::from_raw(class.raw()), Some(class));
        }
    }

    #[test]
    fn key_kind_labels() {
        assert_eq!(KeyKind::from_raw(0).label(), "RSA");
        assert_eq!(KeyKind::from_raw(0x1F).label(), "AES");
        assert_eq!(KeyKind::from_raw(0x10).label(), "GENERIC");
        assert_eq!(KeyKind::from_raw(0x8000_0000).label(), "VENDOR");
    }

    #[test]
    fn unmapped_key_kind_falls_back_to_undefined() {
        assert_eq!(KeyKind::from_raw(0x4242), KeyKind::Undefined);
        assert_eq!(KeyKind::Undefined.label(), "UNDEFINED");
    }

    #[test]
    fn text_fields_are_trimmed() {
        assert_eq!(text_from_bytes(b"My token        "), "My token");
        assert_eq!(text_from_bytes(b"label\0\0"), "label");
        assert_eq!(text_from_bytes(b""), "");
    }
}
