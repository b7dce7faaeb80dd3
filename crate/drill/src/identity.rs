//! Durable token identity resolution.
//!
//! The identity keys the journal across runs. The preferred source is the
//! GlobalPlatform CPLC IC serial read over PC/SC; when that is unavailable
//! the serial number of the slot's identity certificate is used instead.

use thiserror::Error;
use tracing::{info, warn};

use tokendrill_token::{
    ObjectClass, ObjectView, SearchTemplate, SlotManager, TkError, TkResult, object,
};

/// Alternate identity source consulted before falling back to the
/// certificate serial. The PC/SC transport lives outside this crate; an
/// implementation hands back the raw CPLC GET DATA response bytes.
pub trait CplcSource {
    fn query_cplc(&self, slot_description: &str) -> Option<Vec<u8>>;
}

/// Default source with no PC/SC stack attached.
pub struct NoCplc;

impl CplcSource for NoCplc {
    fn query_cplc(&self, _slot_description: &str) -> Option<Vec<u8>> {
        None
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid CPLC length {0:#04x}")]
pub struct InvalidCplcLength(pub usize);

/// Derive the IC serial from a CPLC GET DATA response.
///
/// Only two response shapes are accepted: 0x2F bytes total when the
/// payload arrives wrapped in its BER-TLV header, 0x2C bytes when it
/// arrives bare. The serial is the 4-byte IC serial number field at
/// payload offset 12.
pub fn parse_cplc_serial(response: &[u8]) -> Result<String, InvalidCplcLength> {
    let offset = match response.len() {
        0x2C => 0x0C,
        0x2F => 0x0F,
        other => return Err(InvalidCplcLength(other)),
    };
    Ok(hex::encode_upper(&response[offset..offset + 4]))
}

/// Resolve the identity of the token in the given (open) session.
///
/// The certificate matching the configured key id wins; when none matches,
/// the first certificate found is used with a warning. The CPLC source is
/// consulted afterwards and its serial takes precedence when present.
pub fn resolve_identity(
    session: &SlotManager,
    key_id: &[u8],
    cplc: &dyn CplcSource,
) -> TkResult<String> {
    let template = SearchTemplate::with_class(ObjectClass::Certificate).and_id(key_id);
    let mut handles = session.find_objects(&template)?;
    if handles.is_empty() {
        handles = session.find_objects(&SearchTemplate::with_class(ObjectClass::Certificate))?;
        if handles.is_empty() {
            return Err(TkError::NotFound("certificate"));
        }
        warn!(
            "certificate with key identifier {} not found, defaulting to first available",
            hex::encode_upper(key_id)
        );
    }

    let object = object::resolve(session, handles[0])?;
    let ObjectView::Certificate(certificate) = &object.view else {
        return Err(TkError::Default(format!(
            "object {} is not a certificate",
            object.handle
        )));
    };
    let serial = certificate.serial_hex();

    match cplc.query_cplc(&session.slot().description) {
        Some(response) => match parse_cplc_serial(&response) {
            Ok(csn) => {
                info!("matched serial {serial} to CPLC IC serial {csn}, using the IC serial");
                Ok(csn)
            }
            Err(e) => {
                warn!("unusable CPLC response ({e}), using certificate serial {serial}");
                Ok(serial)
            }
        },
        None => {
            warn!("unable to retrieve CPLC, using certificate serial number {serial}");
            Ok(serial)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{InvalidCplcLength, parse_cplc_serial};

    fn payload() -> [u8; 42] {
        let mut payload = [0_u8; 42];
        // IC serial number field at payload offset 12.
        payload[12..16].copy_from_slice(&[0xCA, 0xFE, 0x00, 0x42]);
        payload
    }

    #[test]
    fn bare_response_yields_the_ic_serial() {
        let mut response = payload().to_vec();
        response.extend_from_slice(&[0x90, 0x00]);
        assert_eq!(response.len(), 0x2C);
        assert_eq!(parse_cplc_serial(&response).as_deref(), Ok("CAFE0042"));
    }

    #[test]
    fn wrapped_response_yields_the_same_serial() {
        let mut response = vec![0x9F, 0x7F, 0x2A];
        response.extend_from_slice(&payload());
        response.extend_from_slice(&[0x90, 0x00]);
        assert_eq!(response.len(), 0x2F);
        assert_eq!(parse_cplc_serial(&response).as_deref(), Ok("CAFE0042"));
    }

    #[test]
    fn any_other_length_is_rejected() {
        assert_eq!(parse_cplc_serial(&[]), Err(InvalidCplcLength(0)));
        assert_eq!(
            parse_cplc_serial(&[0_u8; 0x2D]),
            Err(InvalidCplcLength(0x2D))
        );
        assert_eq!(
            parse_cplc_serial(&[0_u8; 0x30]),
            Err(InvalidCplcLength(0x30))
        );
    }
}
