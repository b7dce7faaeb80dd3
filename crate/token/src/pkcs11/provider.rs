//! `TokenProvider` implementation over a loaded Cryptoki module.
//!
//! Every crypto primitive is a provider-side init+execute pair under a
//! fixed mechanism: SHA-1 for digests, RSA PKCS#1 v1.5 for encrypt,
//! decrypt, sign and verify. Output buffers follow the PKCS#11 length-probe
//! convention: one call with a null output pointer to learn the length,
//! one call to fill the buffer.

use std::{
    ffi::c_void,
    fmt,
    fmt::{Display, Formatter},
    ptr,
    sync::Arc,
};

use tracing::{trace, warn};

use tokendrill_pkcs11_sys::{
    CK_ATTRIBUTE, CK_ATTRIBUTE_TYPE, CK_BBOOL, CK_FLAGS, CK_INFO, CK_MECHANISM, CK_OBJECT_CLASS,
    CK_OBJECT_HANDLE, CK_SESSION_HANDLE, CK_SLOT_ID, CK_SLOT_INFO, CK_TOKEN_INFO, CK_ULONG,
    CK_UNAVAILABLE_INFORMATION, CK_UTF8CHAR_PTR, CK_VERSION, CKA_APPLICATION, CKA_CLASS,
    CKA_DECRYPT, CKA_ENCRYPT, CKA_ID, CKA_KEY_TYPE, CKA_LABEL, CKA_MODIFIABLE, CKA_MODULUS_BITS,
    CKA_OBJECT_ID, CKA_PRIVATE, CKA_PUBLIC_EXPONENT, CKA_SENSITIVE, CKA_SERIAL_NUMBER, CKA_SIGN,
    CKA_TOKEN, CKA_VALUE, CKA_VERIFY, CKF_HW_SLOT, CKF_LOGIN_REQUIRED, CKF_REMOVABLE_DEVICE,
    CKF_RNG, CKF_RW_SESSION, CKF_SERIAL_SESSION, CKF_TOKEN_PRESENT, CKM_RSA_PKCS,
    CKM_RSA_PKCS_KEY_PAIR_GEN, CKM_SHA_1, CKR_ATTRIBUTE_SENSITIVE, CKR_ATTRIBUTE_TYPE_INVALID,
    CKR_OK, CKR_SIGNATURE_INVALID, CKR_USER_ALREADY_LOGGED_IN, CK_TRUE, CK_FALSE, CKU_USER,
};

use crate::{
    TkError, TkResult,
    object::text_from_bytes,
    pkcs11::{Pkcs11Library, ck_call},
    provider::{
        AttributeLength, AttributeRequest, AttributeTag, KeyPairHandles, ObjectHandle,
        SearchTemplate, SessionHandle, Slot, SlotId, TokenInfo, TokenProvider,
    },
};

/// How many handles one `C_FindObjects` round may return.
const FIND_BATCH: usize = 16;

/// Information about the loaded Cryptoki module.
pub struct ModuleInfo {
    pub cryptoki_version: (u8, u8),
    pub manufacturer: String,
    pub description: String,
    pub library_version: (u8, u8),
}

impl Display for ModuleInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Cryptoki Version: {}.{}, Manufacturer ID: {}, Library Description: {}, Library \
             Version: {}.{}",
            self.cryptoki_version.0,
            self.cryptoki_version.1,
            self.manufacturer,
            self.description,
            self.library_version.0,
            self.library_version.1
        )
    }
}

/// Capability provider backed by a dynamically loaded PKCS#11 module.
pub struct Pkcs11Provider {
    lib: Arc<Pkcs11Library>,
}

impl Pkcs11Provider {
    /// Load the module at `path`, resolve its entry points and initialize it.
    pub fn load<P>(path: P) -> TkResult<Self>
    where
        P: AsRef<std::ffi::OsStr>,
    {
        Ok(Pkcs11Provider {
            lib: Arc::new(Pkcs11Library::instantiate(path)?),
        })
    }

    pub fn info(&self) -> TkResult<ModuleInfo> {
        let mut info = CK_INFO::default();
        ck_call!(self.lib, C_GetInfo, &raw mut info);
        Ok(ModuleInfo {
            cryptoki_version: version_pair(info.cryptokiVersion),
            manufacturer: text_from_bytes(&info.manufacturerID),
            description: text_from_bytes(&info.libraryDescription),
            library_version: version_pair(info.libraryVersion),
        })
    }
}

impl TokenProvider for Pkcs11Provider {
    fn slots(&self, token_present_only: bool) -> TkResult<Vec<Slot>> {
        let present: CK_BBOOL = if token_present_only { CK_TRUE } else { CK_FALSE };
        let mut count: CK_ULONG = 0;
        ck_call!(self.lib, C_GetSlotList, present, ptr::null_mut(), &raw mut count);
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut ids = vec![CK_SLOT_ID::default(); usize::try_from(count)?];
        ck_call!(
            self.lib,
            C_GetSlotList,
            present,
            ids.as_mut_ptr(),
            &raw mut count
        );
        ids.truncate(usize::try_from(count)?);

        let mut slots = Vec::with_capacity(ids.len());
        for id in ids {
            let mut info = CK_SLOT_INFO::default();
            ck_call!(self.lib, C_GetSlotInfo, id, &raw mut info);
            trace!("slot {id}: {}", text_from_bytes(&info.slotDescription));
            slots.push(Slot {
                id: u64::from(id),
                description: text_from_bytes(&info.slotDescription),
                manufacturer: text_from_bytes(&info.manufacturerID),
                token_present: info.flags & CKF_TOKEN_PRESENT != 0,
                removable: info.flags & CKF_REMOVABLE_DEVICE != 0,
                hardware: info.flags & CKF_HW_SLOT != 0,
                hardware_version: version_pair(info.hardwareVersion),
                firmware_version: version_pair(info.firmwareVersion),
            });
        }
        Ok(slots)
    }

    fn token_info(&self, slot_id: SlotId) -> TkResult<TokenInfo> {
        let mut info = CK_TOKEN_INFO::default();
        ck_call!(
            self.lib,
            C_GetTokenInfo,
            CK_SLOT_ID::try_from(slot_id)?,
            &raw mut info
        );
        Ok(TokenInfo {
            label: text_from_bytes(&info.label),
            manufacturer: text_from_bytes(&info.manufacturerID),
            model: text_from_bytes(&info.model),
            serial: text_from_bytes(&info.serialNumber),
            login_required: info.flags & CKF_LOGIN_REQUIRED != 0,
            has_rng: info.flags & CKF_RNG != 0,
        })
    }

    fn open_session(&self, slot_id: SlotId, read_write: bool) -> TkResult<SessionHandle> {
        let mut flags: CK_FLAGS = CKF_SERIAL_SESSION;
        if read_write {
            flags |= CKF_RW_SESSION;
        }
        let mut handle: CK_SESSION_HANDLE = 0;
        ck_call!(
            self.lib,
            C_OpenSession,
            CK_SLOT_ID::try_from(slot_id)?,
            flags,
            ptr::null_mut(),
            None,
            &raw mut handle
        );
        Ok(u64::from(handle))
    }

    fn close_session(&self, session: SessionHandle) -> TkResult<()> {
        ck_call!(self.lib, C_CloseSession, CK_SESSION_HANDLE::try_from(session)?);
        Ok(())
    }

    fn login(&self, session: SessionHandle, pin: &str) -> TkResult<()> {
        let mut pin_bytes = pin.as_bytes().to_vec();
        let f = self.lib.C_Login.ok_or_else(|| {
            TkError::Default("C_Login not available on library".to_string())
        })?;
        let rv = unsafe {
            f(
                CK_SESSION_HANDLE::try_from(session)?,
                CKU_USER,
                pin_bytes.as_mut_ptr() as CK_UTF8CHAR_PTR,
                CK_ULONG::try_from(pin_bytes.len())?,
            )
        };
        if rv == CKR_USER_ALREADY_LOGGED_IN {
            warn!("user already logged in, ignoring login");
            return Ok(());
        }
        if rv != CKR_OK {
            return Err(TkError::Provider {
                call: "C_Login",
                rv: u64::from(rv),
            });
        }
        Ok(())
    }

    fn logout(&self, session: SessionHandle) -> TkResult<()> {
        ck_call!(self.lib, C_Logout, CK_SESSION_HANDLE::try_from(session)?);
        Ok(())
    }

    fn find_objects(
        &self,
        session: SessionHandle,
        template: &SearchTemplate,
    ) -> TkResult<Vec<ObjectHandle>> {
        let session = CK_SESSION_HANDLE::try_from(session)?;

        // The attribute values must stay alive for the whole init call.
        let mut class_value: CK_OBJECT_CLASS = 0;
        let mut id_bytes = template.id.clone().unwrap_or_default();
        let mut attributes: Vec<CK_ATTRIBUTE> = Vec::with_capacity(2);
        if let Some(class) = template.class {
            class_value = CK_OBJECT_CLASS::try_from(class.raw())?;
            attributes.push(CK_ATTRIBUTE {
                type_: CKA_CLASS,
                pValue: (&raw mut class_value).cast::<c_void>(),
                ulValueLen: CK_ULONG::try_from(size_of::<CK_OBJECT_CLASS>())?,
            });
        }
        if template.id.is_some() {
            attributes.push(CK_ATTRIBUTE {
                type_: CKA_ID,
                pValue: id_bytes.as_mut_ptr().cast::<c_void>(),
                ulValueLen: CK_ULONG::try_from(id_bytes.len())?,
            });
        }

        ck_call!(
            self.lib,
            C_FindObjectsInit,
            session,
            attributes.as_mut_ptr(),
            CK_ULONG::try_from(attributes.len())?
        );

        let mut handles: Vec<ObjectHandle> = Vec::new();
        let mut batch = vec![CK_OBJECT_HANDLE::default(); FIND_BATCH];
        let mut found: CK_ULONG = 0;
        loop {
            ck_call!(
                self.lib,
                C_FindObjects,
                session,
                batch.as_mut_ptr(),
                CK_ULONG::try_from(FIND_BATCH)?,
                &raw mut found
            );
            if found == 0 {
                break;
            }
            trace!("found {found} objects");
            for handle in batch.iter().take(usize::try_from(found)?) {
                handles.push(u64::from(*handle));
            }
        }
        ck_call!(self.lib, C_FindObjectsFinal, session);
        Ok(handles)
    }

    fn attribute_lengths(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
        tags: &[AttributeTag],
    ) -> TkResult<Vec<AttributeLength>> {
        let mut attributes: Vec<CK_ATTRIBUTE> = tags
            .iter()
            .map(|tag| CK_ATTRIBUTE {
                type_: tag_to_ck(*tag),
                pValue: ptr::null_mut(),
                ulValueLen: 0,
            })
            .collect();

        let f = self.lib.C_GetAttributeValue.ok_or_else(|| {
            TkError::Default("C_GetAttributeValue not available on library".to_string())
        })?;
        let rv = unsafe {
            f(
                CK_SESSION_HANDLE::try_from(session)?,
                CK_OBJECT_HANDLE::try_from(object)?,
                attributes.as_mut_ptr(),
                CK_ULONG::try_from(attributes.len())?,
            )
        };
        // Cryptoki reports unsupported and sensitive attributes through the
        // per-attribute length sentinel while still filling the others.
        if rv != CKR_OK && rv != CKR_ATTRIBUTE_TYPE_INVALID && rv != CKR_ATTRIBUTE_SENSITIVE {
            return Err(TkError::Provider {
                call: "C_GetAttributeValue",
                rv: u64::from(rv),
            });
        }

        attributes
            .iter()
            .map(|attribute| {
                if attribute.ulValueLen == CK_UNAVAILABLE_INFORMATION {
                    Ok(AttributeLength::Absent)
                } else {
                    Ok(AttributeLength::Present(usize::try_from(
                        attribute.ulValueLen,
                    )?))
                }
            })
            .collect()
    }

    fn read_attributes(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
        requests: &mut [AttributeRequest],
    ) -> TkResult<()> {
        let mut attributes: Vec<CK_ATTRIBUTE> = Vec::with_capacity(requests.len());
        for request in requests.iter_mut() {
            attributes.push(CK_ATTRIBUTE {
                type_: tag_to_ck(request.tag),
                pValue: request.buffer.as_mut_ptr().cast::<c_void>(),
                ulValueLen: CK_ULONG::try_from(request.buffer.len())?,
            });
        }
        ck_call!(
            self.lib,
            C_GetAttributeValue,
            CK_SESSION_HANDLE::try_from(session)?,
            CK_OBJECT_HANDLE::try_from(object)?,
            attributes.as_mut_ptr(),
            CK_ULONG::try_from(attributes.len())?
        );
        Ok(())
    }

    fn digest(&self, session: SessionHandle, data: &[u8]) -> TkResult<Vec<u8>> {
        let session = CK_SESSION_HANDLE::try_from(session)?;
        let mut mechanism = CK_MECHANISM {
            mechanism: CKM_SHA_1,
            pParameter: ptr::null_mut(),
            ulParameterLen: 0,
        };
        ck_call!(self.lib, C_DigestInit, session, &raw mut mechanism);

        let mut data = data.to_vec();
        let mut digest_len: CK_ULONG = 0;
        ck_call!(
            self.lib,
            C_Digest,
            session,
            data.as_mut_ptr(),
            CK_ULONG::try_from(data.len())?,
            ptr::null_mut(),
            &raw mut digest_len
        );
        let mut digest = vec![0_u8; usize::try_from(digest_len)?];
        ck_call!(
            self.lib,
            C_Digest,
            session,
            data.as_mut_ptr(),
            CK_ULONG::try_from(data.len())?,
            digest.as_mut_ptr(),
            &raw mut digest_len
        );
        digest.truncate(usize::try_from(digest_len)?);
        Ok(digest)
    }

    fn encrypt(
        &self,
        session: SessionHandle,
        key: ObjectHandle,
        plaintext: &[u8],
    ) -> TkResult<Vec<u8>> {
        let session = CK_SESSION_HANDLE::try_from(session)?;
        let mut mechanism = rsa_pkcs_mechanism();
        ck_call!(
            self.lib,
            C_EncryptInit,
            session,
            &raw mut mechanism,
            CK_OBJECT_HANDLE::try_from(key)?
        );

        let mut plaintext = plaintext.to_vec();
        let mut ciphertext_len: CK_ULONG = 0;
        ck_call!(
            self.lib,
            C_Encrypt,
            session,
            plaintext.as_mut_ptr(),
            CK_ULONG::try_from(plaintext.len())?,
            ptr::null_mut(),
            &raw mut ciphertext_len
        );
        let mut ciphertext = vec![0_u8; usize::try_from(ciphertext_len)?];
        ck_call!(
            self.lib,
            C_Encrypt,
            session,
            plaintext.as_mut_ptr(),
            CK_ULONG::try_from(plaintext.len())?,
            ciphertext.as_mut_ptr(),
            &raw mut ciphertext_len
        );
        ciphertext.truncate(usize::try_from(ciphertext_len)?);
        Ok(ciphertext)
    }

    fn decrypt(
        &self,
        session: SessionHandle,
        key: ObjectHandle,
        ciphertext: &[u8],
    ) -> TkResult<Vec<u8>> {
        let session = CK_SESSION_HANDLE::try_from(session)?;
        let mut mechanism = rsa_pkcs_mechanism();
        ck_call!(
            self.lib,
            C_DecryptInit,
            session,
            &raw mut mechanism,
            CK_OBJECT_HANDLE::try_from(key)?
        );

        let mut ciphertext = ciphertext.to_vec();
        let mut plaintext_len: CK_ULONG = 0;
        ck_call!(
            self.lib,
            C_Decrypt,
            session,
            ciphertext.as_mut_ptr(),
            CK_ULONG::try_from(ciphertext.len())?,
            ptr::null_mut(),
            &raw mut plaintext_len
        );
        let mut plaintext = vec![0_u8; usize::try_from(plaintext_len)?];
        ck_call!(
            self.lib,
            C_Decrypt,
            session,
            ciphertext.as_mut_ptr(),
            CK_ULONG::try_from(ciphertext.len())?,
            plaintext.as_mut_ptr(),
            &raw mut plaintext_len
        );
        plaintext.truncate(usize::try_from(plaintext_len)?);
        Ok(plaintext)
    }

    fn sign(&self, session: SessionHandle, key: ObjectHandle, data: &[u8]) -> TkResult<Vec<u8>> {
        let session = CK_SESSION_HANDLE::try_from(session)?;
        let mut mechanism = rsa_pkcs_mechanism();
        ck_call!(
            self.lib,
            C_SignInit,
            session,
            &raw mut mechanism,
            CK_OBJECT_HANDLE::try_from(key)?
        );

        let mut data = data.to_vec();
        let mut signature_len: CK_ULONG = 0;
        ck_call!(
            self.lib,
            C_Sign,
            session,
            data.as_mut_ptr(),
            CK_ULONG::try_from(data.len())?,
            ptr::null_mut(),
            &raw mut signature_len
        );
        let mut signature = vec![0_u8; usize::try_from(signature_len)?];
        ck_call!(
            self.lib,
            C_Sign,
            session,
            data.as_mut_ptr(),
            CK_ULONG::try_from(data.len())?,
            signature.as_mut_ptr(),
            &raw mut signature_len
        );
        signature.truncate(usize::try_from(signature_len)?);
        Ok(signature)
    }

    fn verify(
        &self,
        session: SessionHandle,
        key: ObjectHandle,
        data: &[u8],
        signature: &[u8],
    ) -> TkResult<bool> {
        let session = CK_SESSION_HANDLE::try_from(session)?;
        let mut mechanism = rsa_pkcs_mechanism();
        ck_call!(
            self.lib,
            C_VerifyInit,
            session,
            &raw mut mechanism,
            CK_OBJECT_HANDLE::try_from(key)?
        );

        let mut data = data.to_vec();
        let mut signature = signature.to_vec();
        let f = self.lib.C_Verify.ok_or_else(|| {
            TkError::Default("C_Verify not available on library".to_string())
        })?;
        let rv = unsafe {
            f(
                session,
                data.as_mut_ptr(),
                CK_ULONG::try_from(data.len())?,
                signature.as_mut_ptr(),
                CK_ULONG::try_from(signature.len())?,
            )
        };
        match rv {
            CKR_OK => Ok(true),
            // A mismatch is a normal outcome, not a provider failure.
            CKR_SIGNATURE_INVALID => Ok(false),
            _ => Err(TkError::Provider {
                call: "C_Verify",
                rv: u64::from(rv),
            }),
        }
    }

    fn generate_random(&self, session: SessionHandle, len: usize) -> TkResult<Vec<u8>> {
        let mut values = vec![0_u8; len];
        ck_call!(
            self.lib,
            C_GenerateRandom,
            CK_SESSION_HANDLE::try_from(session)?,
            values.as_mut_ptr(),
            CK_ULONG::try_from(len)?
        );
        Ok(values)
    }

    fn generate_key_pair(&self, session: SessionHandle) -> TkResult<KeyPairHandles> {
        let session = CK_SESSION_HANDLE::try_from(session)?;
        let mut mechanism = CK_MECHANISM {
            mechanism: CKM_RSA_PKCS_KEY_PAIR_GEN,
            pParameter: ptr::null_mut(),
            ulParameterLen: 0,
        };

        let mut modulus_bits: CK_ULONG = 2048;
        let mut public_exponent: [u8; 3] = [1, 0, 1];
        let mut label = *b"TestKey";
        let mut id: [u8; 1] = [0x01];
        let mut true_value: CK_BBOOL = CK_TRUE;

        let bbool_len = CK_ULONG::try_from(size_of::<CK_BBOOL>())?;
        let true_ptr = (&raw mut true_value).cast::<c_void>();

        let mut public_template = [
            CK_ATTRIBUTE {
                type_: CKA_ID,
                pValue: id.as_mut_ptr().cast::<c_void>(),
                ulValueLen: CK_ULONG::try_from(id.len())?,
            },
            CK_ATTRIBUTE {
                type_: CKA_LABEL,
                pValue: label.as_mut_ptr().cast::<c_void>(),
                ulValueLen: CK_ULONG::try_from(label.len())?,
            },
            CK_ATTRIBUTE {
                type_: CKA_TOKEN,
                pValue: true_ptr,
                ulValueLen: bbool_len,
            },
            CK_ATTRIBUTE {
                type_: CKA_ENCRYPT,
                pValue: true_ptr,
                ulValueLen: bbool_len,
            },
            CK_ATTRIBUTE {
                type_: CKA_VERIFY,
                pValue: true_ptr,
                ulValueLen: bbool_len,
            },
            CK_ATTRIBUTE {
                type_: CKA_MODULUS_BITS,
                pValue: (&raw mut modulus_bits).cast::<c_void>(),
                ulValueLen: CK_ULONG::try_from(size_of::<CK_ULONG>())?,
            },
            CK_ATTRIBUTE {
                type_: CKA_PUBLIC_EXPONENT,
                pValue: public_exponent.as_mut_ptr().cast::<c_void>(),
                ulValueLen: CK_ULONG::try_from(public_exponent.len())?,
            },
        ];
        let mut private_template = [
            CK_ATTRIBUTE {
                type_: CKA_ID,
                pValue: id.as_mut_ptr().cast::<c_void>(),
                ulValueLen: CK_ULONG::try_from(id.len())?,
            },
            CK_ATTRIBUTE {
                type_: CKA_LABEL,
                pValue: label.as_mut_ptr().cast::<c_void>(),
                ulValueLen: CK_ULONG::try_from(label.len())?,
            },
            CK_ATTRIBUTE {
                type_: CKA_TOKEN,
                pValue: true_ptr,
                ulValueLen: bbool_len,
            },
            CK_ATTRIBUTE {
                type_: CKA_PRIVATE,
                pValue: true_ptr,
                ulValueLen: bbool_len,
            },
            CK_ATTRIBUTE {
                type_: CKA_SENSITIVE,
                pValue: true_ptr,
                ulValueLen: bbool_len,
            },
            CK_ATTRIBUTE {
                type_: CKA_DECRYPT,
                pValue: true_ptr,
                ulValueLen: bbool_len,
            },
            CK_ATTRIBUTE {
                type_: CKA_SIGN,
                pValue: true_ptr,
                ulValueLen: bbool_len,
            },
        ];

        let mut public_key: CK_OBJECT_HANDLE = 0;
        let mut private_key: CK_OBJECT_HANDLE = 0;
        ck_call!(
            self.lib,
            C_GenerateKeyPair,
            session,
            &raw mut mechanism,
            public_template.as_mut_ptr(),
            CK_ULONG::try_from(public_template.len())?,
            private_template.as_mut_ptr(),
            CK_ULONG::try_from(private_template.len())?,
            &raw mut public_key,
            &raw mut private_key
        );
        Ok(KeyPairHandles {
            public: u64::from(public_key),
            private: u64::from(private_key),
        })
    }
}

const fn rsa_pkcs_mechanism() -> CK_MECHANISM {
    CK_MECHANISM {
        mechanism: CKM_RSA_PKCS,
        pParameter: ptr::null_mut(),
        ulParameterLen: 0,
    }
}

const fn tag_to_ck(tag: AttributeTag) -> CK_ATTRIBUTE_TYPE {
    match tag {
        AttributeTag::Class => CKA_CLASS,
        AttributeTag::Token => CKA_TOKEN,
        AttributeTag::Private => CKA_PRIVATE,
        AttributeTag::Modifiable => CKA_MODIFIABLE,
        AttributeTag::Label => CKA_LABEL,
        AttributeTag::Application => CKA_APPLICATION,
        AttributeTag::ObjectId => CKA_OBJECT_ID,
        AttributeTag::Value => CKA_VALUE,
        AttributeTag::SerialNumber => CKA_SERIAL_NUMBER,
        AttributeTag::KeyType => CKA_KEY_TYPE,
        AttributeTag::Id => CKA_ID,
    }
}

const fn version_pair(version: CK_VERSION) -> (u8, u8) {
    (version.major, version.minor)
}
