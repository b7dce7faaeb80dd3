//! Core of the tokendrill load tester: the capability interface to a
//! PKCS#11 token, the two-phase attribute query protocol, the typed object
//! taxonomy and the per-slot session state machine.

pub mod attributes;
mod error;
pub mod object;
pub mod pkcs11;
pub mod provider;
pub mod slots;

pub use attributes::AttributeValue;
pub use error::{TkError, TkResult};
pub use object::{
    CertificateObject, DataObject, KeyKind, KeyObject, ObjectClass, ObjectView,
    StorageAttributes, TokenObject, resolve,
};
pub use provider::{
    AttributeLength, AttributeRequest, AttributeTag, KeyPairHandles, ObjectHandle,
    SearchTemplate, SessionHandle, Slot, SlotId, TokenInfo, TokenProvider,
};
pub use slots::{SessionState, SlotManager};
