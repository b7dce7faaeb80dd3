//! Two-phase variable-length attribute retrieval.
//!
//! The token does not pre-declare value sizes, so every variable-length
//! attribute costs two round-trips: one with no buffer attached to learn
//! the length, one with a buffer of exactly that length to fetch the bytes.
//! A reported length of zero short-circuits to an empty value without a
//! second round-trip for that attribute.

use crate::{
    TkError, TkResult,
    provider::{
        AttributeLength, AttributeRequest, AttributeTag, ObjectHandle, SessionHandle,
        TokenProvider,
    },
};

/// Outcome for one requested attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    /// The token does not carry this attribute for the object.
    Absent,
    /// The value, exactly as many bytes as the token reported (possibly 0).
    Bytes(Vec<u8>),
}

impl AttributeValue {
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            AttributeValue::Absent => None,
            AttributeValue::Bytes(bytes) => Some(bytes),
        }
    }

    #[must_use]
    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            AttributeValue::Absent => None,
            AttributeValue::Bytes(bytes) => Some(bytes),
        }
    }
}

/// Fetch the given attributes of `object`, one owned buffer per tag.
///
/// A provider failure at either phase aborts the whole request; nothing is
/// partially committed. The failure is surfaced as [`TkError::QueryFailed`]
/// carrying the provider's status code.
pub fn query(
    provider: &dyn TokenProvider,
    session: SessionHandle,
    object: ObjectHandle,
    tags: &[AttributeTag],
) -> TkResult<Vec<AttributeValue>> {
    let lengths = provider
        .attribute_lengths(session, object, tags)
        .map_err(as_query_failure)?;
    if lengths.len() != tags.len() {
        return Err(TkError::Default(format!(
            "provider answered {} lengths for {} requested attributes",
            lengths.len(),
            tags.len()
        )));
    }

    let mut requests: Vec<AttributeRequest> = Vec::new();
    for (tag, length) in tags.iter().zip(&lengths) {
        if let AttributeLength::Present(len) = length {
            if *len > 0 {
                requests.push(AttributeRequest {
                    tag: *tag,
                    buffer: vec![0; *len],
                });
            }
        }
    }
    if !requests.is_empty() {
        provider
            .read_attributes(session, object, &mut requests)
            .map_err(as_query_failure)?;
    }

    let mut filled = requests.into_iter();
    let mut values = Vec::with_capacity(tags.len());
    for length in &lengths {
        values.push(match length {
            AttributeLength::Absent => AttributeValue::Absent,
            AttributeLength::Present(0) => AttributeValue::Bytes(Vec::new()),
            AttributeLength::Present(_) => {
                let request = filled.next().ok_or_else(|| {
                    TkError::Default("attribute buffers out of step with lengths".to_string())
                })?;
                AttributeValue::Bytes(request.buffer)
            }
        });
    }
    Ok(values)
}

/// Single-attribute convenience over [`query`].
pub fn query_one(
    provider: &dyn TokenProvider,
    session: SessionHandle,
    object: ObjectHandle,
    tag: AttributeTag,
) -> TkResult<AttributeValue> {
    let mut values = query(provider, session, object, &[tag])?;
    values
        .pop()
        .ok_or_else(|| TkError::Default("empty attribute query answer".to_string()))
}

fn as_query_failure(error: TkError) -> TkError {
    match error {
        TkError::Provider { call, rv } => TkError::QueryFailed { call, rv },
        other => other,
    }
}
