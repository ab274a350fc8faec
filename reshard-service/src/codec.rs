//! Binary codec for persisted state documents.
//!
//! Documents are encoded deterministically so that equal documents are
//! byte-identical; the store's compare-and-swap relies on that.
//!
//! # Format
//!
//! All integers are little-endian.
//!
//! - 1 byte: format version
//! - 1 byte: role tag (1 = donor, 2 = recipient)
//! - common metadata: operation id (u64), source namespace (str), source
//!   collection id (u64), temporary namespace (str), shard key (u32 count + str)
//! - 1 byte: state ordinal
//! - optional timestamp (u8 flag + u64)
//! - shard set (u32 count + str, sorted)
//! - recipient only: minimum operation duration in millis (u64)
//! - optional abort reason (u8 flag + str)
//!
//! A string is a u32 byte length followed by UTF-8 bytes.

use std::collections::BTreeSet;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use reshard_core::{
    CollectionId, Limits, Namespace, OperationId, ShardId, ShardKeyPattern, Timestamp,
};
use thiserror::Error;

use crate::document::{
    CommonMetadata, DonorDocument, DonorState, ParticipantDocument, RecipientDocument,
    RecipientState, ServiceKind,
};

/// Current format version.
pub const FORMAT_VERSION: u8 = 1;

/// Role tags.
const TAG_DONOR: u8 = 1;
const TAG_RECIPIENT: u8 = 2;

/// Codec errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Unknown format version.
    #[error("unsupported document format version: {version}")]
    UnsupportedVersion {
        /// The version byte found.
        version: u8,
    },

    /// Unknown role tag.
    #[error("unknown document role tag: {tag}")]
    UnknownRole {
        /// The tag found.
        tag: u8,
    },

    /// The document belongs to the other role.
    #[error("expected a {expected} document, found a {actual} document")]
    RoleMismatch {
        /// Role the caller asked for.
        expected: ServiceKind,
        /// Role found in the bytes.
        actual: ServiceKind,
    },

    /// Insufficient data to decode.
    #[error("insufficient data: need {need} bytes, have {have}")]
    InsufficientData {
        /// Bytes needed.
        need: usize,
        /// Bytes available.
        have: usize,
    },

    /// State ordinal out of range.
    #[error("invalid {role} state ordinal: {ordinal}")]
    InvalidState {
        /// Role being decoded.
        role: ServiceKind,
        /// The ordinal found.
        ordinal: u8,
    },

    /// A field failed to parse.
    #[error("invalid field {field}: {reason}")]
    InvalidField {
        /// Field name.
        field: &'static str,
        /// What was wrong.
        reason: String,
    },

    /// The decoded document violates a field invariant.
    #[error("document invariant violated: {reason}")]
    Invariant {
        /// The violated invariant.
        reason: &'static str,
    },

    /// Bytes left over after the document.
    #[error("{count} trailing bytes after document")]
    TrailingBytes {
        /// Number of extra bytes.
        count: usize,
    },

    /// Encoded document exceeds the size limit.
    #[error("document too large: {size} bytes (max {max})")]
    DocumentTooLarge {
        /// Encoded size.
        size: usize,
        /// Maximum allowed.
        max: u32,
    },
}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

// -----------------------------------------------------------------------------
// Encoding
// -----------------------------------------------------------------------------

/// Encodes a document of either kind.
///
/// # Errors
/// Returns an error if the document violates an invariant or is too large.
pub fn encode_document(document: &ParticipantDocument) -> CodecResult<Bytes> {
    match document {
        ParticipantDocument::Donor(doc) => encode_donor(doc),
        ParticipantDocument::Recipient(doc) => encode_recipient(doc),
    }
}

/// Encodes a donor document.
///
/// # Errors
/// Returns an error if the document violates an invariant or is too large.
pub fn encode_donor(doc: &DonorDocument) -> CodecResult<Bytes> {
    if let Some(reason) = doc.invariant_violation() {
        return Err(CodecError::Invariant { reason });
    }

    let mut buf = BytesMut::with_capacity(256);
    buf.put_u8(FORMAT_VERSION);
    buf.put_u8(TAG_DONOR);
    put_metadata(&mut buf, &doc.metadata);
    buf.put_u8(doc.state.ordinal());
    put_timestamp(&mut buf, doc.min_fetch_timestamp);
    put_shards(&mut buf, &doc.recipient_shards);
    put_optional_str(&mut buf, doc.abort_reason.as_deref());
    finish(buf)
}

/// Encodes a recipient document.
///
/// # Errors
/// Returns an error if the document violates an invariant or is too large.
pub fn encode_recipient(doc: &RecipientDocument) -> CodecResult<Bytes> {
    if let Some(reason) = doc.invariant_violation() {
        return Err(CodecError::Invariant { reason });
    }

    let mut buf = BytesMut::with_capacity(256);
    buf.put_u8(FORMAT_VERSION);
    buf.put_u8(TAG_RECIPIENT);
    put_metadata(&mut buf, &doc.metadata);
    buf.put_u8(doc.state.ordinal());
    put_timestamp(&mut buf, doc.fetch_timestamp);
    put_shards(&mut buf, &doc.donor_shards);
    // Safe cast: durations beyond u64 millis are not representable anyway.
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u64_le(doc.minimum_operation_duration.as_millis() as u64);
    put_optional_str(&mut buf, doc.abort_reason.as_deref());
    finish(buf)
}

fn finish(buf: BytesMut) -> CodecResult<Bytes> {
    let max = Limits::new().max_document_bytes;
    if buf.len() > max as usize {
        return Err(CodecError::DocumentTooLarge {
            size: buf.len(),
            max,
        });
    }
    Ok(buf.freeze())
}

fn put_metadata(buf: &mut BytesMut, metadata: &CommonMetadata) {
    buf.put_u64_le(metadata.operation_id.get());
    put_str(buf, &metadata.source_namespace.to_string());
    buf.put_u64_le(metadata.source_collection_id.get());
    put_str(buf, &metadata.temporary_namespace.to_string());

    let fields = metadata.new_shard_key.fields();
    // Safe cast: shard keys have a handful of fields.
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u32_le(fields.len() as u32);
    for field in fields {
        put_str(buf, field);
    }
}

fn put_str(buf: &mut BytesMut, value: &str) {
    // Safe cast: bounded by the document size check.
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u32_le(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

fn put_optional_str(buf: &mut BytesMut, value: Option<&str>) {
    match value {
        Some(value) => {
            buf.put_u8(1);
            put_str(buf, value);
        }
        None => buf.put_u8(0),
    }
}

fn put_timestamp(buf: &mut BytesMut, value: Option<Timestamp>) {
    match value {
        Some(ts) => {
            buf.put_u8(1);
            buf.put_u64_le(ts.as_u64());
        }
        None => buf.put_u8(0),
    }
}

fn put_shards(buf: &mut BytesMut, shards: &BTreeSet<ShardId>) {
    // Safe cast: bounded by participant limits.
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u32_le(shards.len() as u32);
    for shard in shards {
        put_str(buf, shard.as_str());
    }
}

// -----------------------------------------------------------------------------
// Decoding
// -----------------------------------------------------------------------------

/// Decodes a document of either kind.
///
/// # Errors
/// Returns an error if the bytes are not a valid document.
pub fn decode_document(data: &[u8]) -> CodecResult<ParticipantDocument> {
    let mut buf = data;
    match read_header(&mut buf)? {
        ServiceKind::Donor => decode_donor_body(&mut buf).map(ParticipantDocument::Donor),
        ServiceKind::Recipient => {
            decode_recipient_body(&mut buf).map(ParticipantDocument::Recipient)
        }
    }
}

/// Decodes a donor document.
///
/// # Errors
/// Returns an error if the bytes are not a valid donor document.
pub fn decode_donor(data: &[u8]) -> CodecResult<DonorDocument> {
    let mut buf = data;
    let kind = read_header(&mut buf)?;
    if kind != ServiceKind::Donor {
        return Err(CodecError::RoleMismatch {
            expected: ServiceKind::Donor,
            actual: kind,
        });
    }
    decode_donor_body(&mut buf)
}

/// Decodes a recipient document.
///
/// # Errors
/// Returns an error if the bytes are not a valid recipient document.
pub fn decode_recipient(data: &[u8]) -> CodecResult<RecipientDocument> {
    let mut buf = data;
    let kind = read_header(&mut buf)?;
    if kind != ServiceKind::Recipient {
        return Err(CodecError::RoleMismatch {
            expected: ServiceKind::Recipient,
            actual: kind,
        });
    }
    decode_recipient_body(&mut buf)
}

/// Decodes only the header and common metadata of a document that may be
/// invalid past them. Used to keep an unreadable document's metadata when it
/// is replaced with an Error document.
///
/// # Errors
/// Returns an error if the header or metadata cannot be decoded.
pub fn salvage_metadata(data: &[u8]) -> CodecResult<CommonMetadata> {
    let mut buf = data;
    read_header(&mut buf)?;
    get_metadata(&mut buf)
}

fn read_header(buf: &mut &[u8]) -> CodecResult<ServiceKind> {
    ensure_remaining(buf, 2)?;
    let version = buf.get_u8();
    if version != FORMAT_VERSION {
        return Err(CodecError::UnsupportedVersion { version });
    }
    match buf.get_u8() {
        TAG_DONOR => Ok(ServiceKind::Donor),
        TAG_RECIPIENT => Ok(ServiceKind::Recipient),
        tag => Err(CodecError::UnknownRole { tag }),
    }
}

fn decode_donor_body(buf: &mut &[u8]) -> CodecResult<DonorDocument> {
    let metadata = get_metadata(buf)?;

    ensure_remaining(buf, 1)?;
    let ordinal = buf.get_u8();
    let state = DonorState::from_ordinal(ordinal).ok_or(CodecError::InvalidState {
        role: ServiceKind::Donor,
        ordinal,
    })?;
    let min_fetch_timestamp = get_timestamp(buf)?;
    let recipient_shards = get_shards(buf, "recipient_shards")?;
    let abort_reason = get_optional_str(buf, "abort_reason")?;
    ensure_consumed(buf)?;

    let doc = DonorDocument {
        metadata,
        state,
        min_fetch_timestamp,
        recipient_shards,
        abort_reason,
    };
    if let Some(reason) = doc.invariant_violation() {
        return Err(CodecError::Invariant { reason });
    }
    Ok(doc)
}

fn decode_recipient_body(buf: &mut &[u8]) -> CodecResult<RecipientDocument> {
    let metadata = get_metadata(buf)?;

    ensure_remaining(buf, 1)?;
    let ordinal = buf.get_u8();
    let state = RecipientState::from_ordinal(ordinal).ok_or(CodecError::InvalidState {
        role: ServiceKind::Recipient,
        ordinal,
    })?;
    let fetch_timestamp = get_timestamp(buf)?;
    let donor_shards = get_shards(buf, "donor_shards")?;
    ensure_remaining(buf, 8)?;
    let minimum_operation_duration = Duration::from_millis(buf.get_u64_le());
    let abort_reason = get_optional_str(buf, "abort_reason")?;
    ensure_consumed(buf)?;

    let doc = RecipientDocument {
        metadata,
        state,
        fetch_timestamp,
        donor_shards,
        minimum_operation_duration,
        abort_reason,
    };
    if let Some(reason) = doc.invariant_violation() {
        return Err(CodecError::Invariant { reason });
    }
    Ok(doc)
}

fn get_metadata(buf: &mut &[u8]) -> CodecResult<CommonMetadata> {
    ensure_remaining(buf, 8)?;
    let operation_id = OperationId::new(buf.get_u64_le());
    let source_namespace = get_namespace(buf, "source_namespace")?;
    ensure_remaining(buf, 8)?;
    let source_collection_id = CollectionId::new(buf.get_u64_le());
    let temporary_namespace = get_namespace(buf, "temporary_namespace")?;

    ensure_remaining(buf, 4)?;
    let count = buf.get_u32_le() as usize;
    let mut fields = Vec::with_capacity(count.min(16));
    for _ in 0..count {
        fields.push(get_str(buf, "new_shard_key")?);
    }
    let new_shard_key =
        ShardKeyPattern::new(fields).map_err(|err| CodecError::InvalidField {
            field: "new_shard_key",
            reason: err.to_string(),
        })?;

    Ok(CommonMetadata {
        operation_id,
        source_namespace,
        source_collection_id,
        temporary_namespace,
        new_shard_key,
    })
}

fn get_namespace(buf: &mut &[u8], field: &'static str) -> CodecResult<Namespace> {
    get_str(buf, field)?
        .parse()
        .map_err(|err: reshard_core::Error| CodecError::InvalidField {
            field,
            reason: err.to_string(),
        })
}

fn get_str(buf: &mut &[u8], field: &'static str) -> CodecResult<String> {
    ensure_remaining(buf, 4)?;
    let len = buf.get_u32_le() as usize;
    ensure_remaining(buf, len)?;
    let value = String::from_utf8(buf[..len].to_vec()).map_err(|_| CodecError::InvalidField {
        field,
        reason: "invalid UTF-8".to_string(),
    })?;
    buf.advance(len);
    Ok(value)
}

fn get_optional_str(buf: &mut &[u8], field: &'static str) -> CodecResult<Option<String>> {
    if get_flag(buf, field)? {
        get_str(buf, field).map(Some)
    } else {
        Ok(None)
    }
}

fn get_timestamp(buf: &mut &[u8]) -> CodecResult<Option<Timestamp>> {
    if !get_flag(buf, "timestamp")? {
        return Ok(None);
    }
    ensure_remaining(buf, 8)?;
    Ok(Some(Timestamp::from_u64(buf.get_u64_le())))
}

fn get_flag(buf: &mut &[u8], field: &'static str) -> CodecResult<bool> {
    ensure_remaining(buf, 1)?;
    match buf.get_u8() {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(CodecError::InvalidField {
            field,
            reason: format!("invalid presence flag {other}"),
        }),
    }
}

fn get_shards(buf: &mut &[u8], field: &'static str) -> CodecResult<BTreeSet<ShardId>> {
    ensure_remaining(buf, 4)?;
    let count = buf.get_u32_le() as usize;
    let mut shards = BTreeSet::new();
    for _ in 0..count {
        let name = get_str(buf, field)?;
        if name.is_empty() {
            return Err(CodecError::InvalidField {
                field,
                reason: "empty shard name".to_string(),
            });
        }
        if !shards.insert(ShardId::new(name)) {
            return Err(CodecError::InvalidField {
                field,
                reason: "duplicate shard".to_string(),
            });
        }
    }
    Ok(shards)
}

const fn ensure_remaining(buf: &[u8], need: usize) -> CodecResult<()> {
    if buf.len() < need {
        return Err(CodecError::InsufficientData {
            need,
            have: buf.len(),
        });
    }
    Ok(())
}

const fn ensure_consumed(buf: &[u8]) -> CodecResult<()> {
    if !buf.is_empty() {
        return Err(CodecError::TrailingBytes { count: buf.len() });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::PersistedDocument;

    fn metadata() -> CommonMetadata {
        CommonMetadata::new(
            OperationId::new(42),
            "db.foo".parse().unwrap(),
            CollectionId::new(3),
            ShardKeyPattern::new(["newKey", "other"]).unwrap(),
        )
    }

    fn shards(names: &[&str]) -> BTreeSet<ShardId> {
        names.iter().map(|name| ShardId::new(*name)).collect()
    }

    fn donor() -> DonorDocument {
        DonorDocument::new(metadata(), shards(&["shard1", "shard0"]))
            .with_min_fetch_timestamp(Timestamp::new(100, 2))
    }

    fn recipient() -> RecipientDocument {
        RecipientDocument::new(
            metadata(),
            shards(&["shard0"]),
            Duration::from_millis(5000),
        )
    }

    #[test]
    fn test_donor_roundtrip() {
        let doc = donor();
        let bytes = encode_donor(&doc).unwrap();
        assert_eq!(bytes[0], FORMAT_VERSION);
        assert_eq!(bytes[1], TAG_DONOR);
        assert_eq!(decode_donor(&bytes).unwrap(), doc);

        let errored = doc.errored("aborted by coordinator".into());
        let bytes = encode_donor(&errored).unwrap();
        assert_eq!(decode_donor(&bytes).unwrap(), errored);
    }

    #[test]
    fn test_recipient_roundtrip_through_generic_decode() {
        let doc = recipient().with_fetch_timestamp(Timestamp::new(7, 0));
        let bytes = encode_recipient(&doc).unwrap();
        assert_eq!(
            decode_document(&bytes).unwrap(),
            ParticipantDocument::Recipient(doc)
        );
    }

    #[test]
    fn test_encoding_is_deterministic() {
        // Same shard set, different insertion order.
        let a = DonorDocument::new(metadata(), shards(&["b", "a", "c"]));
        let b = DonorDocument::new(metadata(), shards(&["c", "b", "a"]));
        assert_eq!(encode_donor(&a).unwrap(), encode_donor(&b).unwrap());
    }

    #[test]
    fn test_role_mismatch() {
        let bytes = encode_donor(&donor()).unwrap();
        assert_eq!(
            decode_recipient(&bytes).unwrap_err(),
            CodecError::RoleMismatch {
                expected: ServiceKind::Recipient,
                actual: ServiceKind::Donor,
            }
        );
    }

    #[test]
    fn test_truncated_input_rejected() {
        let bytes = encode_recipient(&recipient()).unwrap();
        for len in 0..bytes.len() {
            let err = decode_recipient(&bytes[..len]).unwrap_err();
            assert!(
                matches!(
                    err,
                    CodecError::InsufficientData { .. } | CodecError::InvalidField { .. }
                ),
                "len {len}: {err}"
            );
        }
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = BytesMut::from(&encode_donor(&donor()).unwrap()[..]);
        bytes.put_u8(0);
        assert_eq!(
            decode_donor(&bytes).unwrap_err(),
            CodecError::TrailingBytes { count: 1 }
        );
    }

    #[test]
    fn test_bad_header_rejected() {
        let mut bytes = BytesMut::from(&encode_donor(&donor()).unwrap()[..]);
        bytes[0] = 9;
        assert_eq!(
            decode_document(&bytes).unwrap_err(),
            CodecError::UnsupportedVersion { version: 9 }
        );

        bytes[0] = FORMAT_VERSION;
        bytes[1] = 7;
        assert_eq!(
            decode_document(&bytes).unwrap_err(),
            CodecError::UnknownRole { tag: 7 }
        );
    }

    #[test]
    fn test_invalid_state_ordinal_rejected() {
        let doc = recipient();
        let bytes = encode_recipient(&doc).unwrap();
        // The state byte follows the header and metadata.
        let state_offset = bytes.len() - (1 + 4 + 4 + "shard0".len() + 8 + 1 + 1);
        let mut corrupt = BytesMut::from(&bytes[..]);
        corrupt[state_offset] = 42;
        assert_eq!(
            decode_recipient(&corrupt).unwrap_err(),
            CodecError::InvalidState {
                role: ServiceKind::Recipient,
                ordinal: 42,
            }
        );
    }

    #[test]
    fn test_salvage_metadata_past_invalid_state() {
        let bytes = encode_recipient(&recipient()).unwrap();
        let state_offset = bytes.len() - (1 + 4 + 4 + "shard0".len() + 8 + 1 + 1);
        let mut corrupt = BytesMut::from(&bytes[..]);
        corrupt[state_offset] = RecipientState::Cloning.ordinal();

        assert!(matches!(
            decode_recipient(&corrupt).unwrap_err(),
            CodecError::Invariant { .. }
        ));
        assert_eq!(salvage_metadata(&corrupt).unwrap(), metadata());
        assert!(salvage_metadata(&bytes[..10]).is_err());
        assert!(salvage_metadata(b"garbage").is_err());
    }

    #[test]
    fn test_invariant_violation_rejected() {
        let mut doc = recipient();
        doc.state = RecipientState::Cloning;
        assert!(matches!(
            encode_recipient(&doc).unwrap_err(),
            CodecError::Invariant { .. }
        ));
    }
}
