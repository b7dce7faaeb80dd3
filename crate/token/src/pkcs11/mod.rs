//! Capability provider over a dynamically loaded PKCS#11 module.

mod library;
mod provider;

pub use library::Pkcs11Library;
pub use provider::{ModuleInfo, Pkcs11Provider};

/// Invoke a resolved Cryptoki function and turn any non-OK status into a
/// provider error carrying the call name. A macro is used to keep the
/// mutable pointer arguments expanded inline.
macro_rules! ck_call {
    ($lib:expr, $func:ident $(, $arg:expr)* $(,)?) => {{
        let f = $lib.$func.ok_or_else(|| {
            $crate::TkError::Default(
                concat!(stringify!($func), " not available on library").to_string(),
            )
        })?;
        let rv = unsafe { f($($arg),*) };
        if rv != tokendrill_pkcs11_sys::CKR_OK {
            return Err($crate::TkError::Provider {
                call: stringify!($func),
                rv: u64::from(rv),
            });
        }
    }};
}

pub(crate) use ck_call;
