//! Dynamic loading of a vendor Cryptoki module.

use std::ptr;

use libloading::Library;
use tokendrill_pkcs11_sys::{
    CK_C_CloseSession, CK_C_Decrypt, CK_C_DecryptInit, CK_C_Digest, CK_C_DigestInit,
    CK_C_Encrypt, CK_C_EncryptInit, CK_C_Finalize, CK_C_FindObjects, CK_C_FindObjectsFinal,
    CK_C_FindObjectsInit, CK_C_GenerateKeyPair, CK_C_GenerateRandom, CK_C_GetAttributeValue,
    CK_C_GetInfo, CK_C_GetSlotInfo, CK_C_GetSlotList, CK_C_GetTokenInfo, CK_C_INITIALIZE_ARGS,
    CK_C_Initialize, CK_C_Login, CK_C_Logout, CK_C_OpenSession, CK_C_Sign, CK_C_SignInit,
    CK_C_Verify, CK_C_VerifyInit, CK_VOID_PTR, CKF_OS_LOCKING_OK, CKR_OK,
};

use crate::{TkError, TkResult};

/// Resolved entry points of one loaded PKCS#11 module.
///
/// The module is initialized with OS locking on load and finalized when the
/// value is dropped. The `Library` is kept alive for as long as any of the
/// resolved pointers may be called.
#[allow(non_snake_case)]
pub struct Pkcs11Library {
    _library: Library,
    pub(crate) C_Initialize: CK_C_Initialize,
    pub(crate) C_Finalize: CK_C_Finalize,
    pub(crate) C_GetInfo: CK_C_GetInfo,

    pub(crate) C_GetSlotList: CK_C_GetSlotList,
    pub(crate) C_GetSlotInfo: CK_C_GetSlotInfo,
    pub(crate) C_GetTokenInfo: CK_C_GetTokenInfo,

    pub(crate) C_OpenSession: CK_C_OpenSession,
    pub(crate) C_CloseSession: CK_C_CloseSession,
    pub(crate) C_Login: CK_C_Login,
    pub(crate) C_Logout: CK_C_Logout,

    pub(crate) C_GetAttributeValue: CK_C_GetAttributeValue,

    pub(crate) C_FindObjectsInit: CK_C_FindObjectsInit,
    pub(crate) C_FindObjects: CK_C_FindObjects,
    pub(crate) C_FindObjectsFinal: CK_C_FindObjectsFinal,

    pub(crate) C_DigestInit: CK_C_DigestInit,
    pub(crate) C_Digest: CK_C_Digest,

    pub(crate) C_EncryptInit: CK_C_EncryptInit,
    pub(crate) C_Encrypt: CK_C_Encrypt,
    pub(crate) C_DecryptInit: CK_C_DecryptInit,
    pub(crate) C_Decrypt: CK_C_Decrypt,

    pub(crate) C_SignInit: CK_C_SignInit,
    pub(crate) C_Sign: CK_C_Sign,
    pub(crate) C_VerifyInit: CK_C_VerifyInit,
    pub(crate) C_Verify: CK_C_Verify,

    pub(crate) C_GenerateRandom: CK_C_GenerateRandom,
    pub(crate) C_GenerateKeyPair: CK_C_GenerateKeyPair,
}

impl Pkcs11Library {
    pub(crate) fn instantiate<P>(path: P) -> TkResult<Self>
    where
        P: AsRef<std::ffi::OsStr>,
    {
        unsafe {
            let library = Library::new(path)?;
            let pkcs11 = Pkcs11Library {
                C_Initialize: Some(*library.get(b"C_Initialize")?),
                C_Finalize: Some(*library.get(b"C_Finalize")?),
                C_GetInfo: Some(*library.get(b"C_GetInfo")?),
                C_GetSlotList: Some(*library.get(b"C_GetSlotList")?),
                C_GetSlotInfo: Some(*library.get(b"C_GetSlotInfo")?),
                C_GetTokenInfo: Some(*library.get(b"C_GetTokenInfo")?),
                C_OpenSession: Some(*library.get(b"C_OpenSession")?),
                C_CloseSession: Some(*library.get(b"C_CloseSession")?),
                C_Login: Some(*library.get(b"C_Login")?),
                C_Logout: Some(*library.get(b"C_Logout")?),
                C_GetAttributeValue: Some(*library.get(b"C_GetAttributeValue")?),
                C_FindObjectsInit: Some(*library.get(b"C_FindObjectsInit")?),
                C_FindObjects: Some(*library.get(b"C_FindObjects")?),
                C_FindObjectsFinal: Some(*library.get(b"C_FindObjectsFinal")?),
                C_DigestInit: Some(*library.get(b"C_DigestInit")?),
                C_Digest: Some(*library.get(b"C_Digest")?),
                C_EncryptInit: Some(*library.get(b"C_EncryptInit")?),
                C_Encrypt: Some(*library.get(b"C_Encrypt")?),
                C_DecryptInit: Some(*library.get(b"C_DecryptInit")?),
                C_Decrypt: Some(*library.get(b"C_Decrypt")?),
                C_SignInit: Some(*library.get(b"C_SignInit")?),
                C_Sign: Some(*library.get(b"C_Sign")?),
                C_VerifyInit: Some(*library.get(b"C_VerifyInit")?),
                C_Verify: Some(*library.get(b"C_Verify")?),
                C_GenerateRandom: Some(*library.get(b"C_GenerateRandom")?),
                C_GenerateKeyPair: Some(*library.get(b"C_GenerateKeyPair")?),
                // we need to keep the library alive
                _library: library,
            };
            Self::initialize(&pkcs11)?;
            Ok(pkcs11)
        }
    }

    fn initialize(pkcs11: &Pkcs11Library) -> TkResult<()> {
        let init_args = CK_C_INITIALIZE_ARGS {
            CreateMutex: None,
            DestroyMutex: None,
            LockMutex: None,
            UnlockMutex: None,
            flags: CKF_OS_LOCKING_OK,
            pReserved: ptr::null_mut(),
        };
        unsafe {
            let rv = pkcs11.C_Initialize.ok_or_else(|| {
                TkError::Default("C_Initialize not available on library".to_string())
            })?(&init_args as *const CK_C_INITIALIZE_ARGS as CK_VOID_PTR);
            if rv != CKR_OK {
                return Err(TkError::Provider {
                    call: "C_Initialize",
                    rv: u64::from(rv),
                });
            }
            Ok(())
        }
    }

    fn finalize(&self) -> TkResult<()> {
        unsafe {
            let rv = self.C_Finalize.ok_or_else(|| {
                TkError::Default("C_Finalize not available on library".to_string())
            })?(ptr::null_mut());
            if rv != CKR_OK {
                return Err(TkError::Provider {
                    call: "C_Finalize",
                    rv: u64::from(rv),
                });
            }
            Ok(())
        }
    }
}

impl Drop for Pkcs11Library {
    fn drop(&mut self) {
        let _ = self.finalize();
    }
}
