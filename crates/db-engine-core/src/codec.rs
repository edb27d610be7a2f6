//! The wire Codec: serializes `Ir` and result envelopes for the Bridge
//! boundary, and round-trips them back.
//!
//! Grounded in `data-bridge::postgres::{extracted_to_json, py_dict_to_extracted_values}`'s
//! serialize-at-the-boundary pattern, generalised into a dialect-agnostic,
//! versioned byte envelope instead of ad hoc per-call Python conversion, so
//! the wire format is testable independent of the PyO3 boundary.

use serde::{Deserialize, Serialize};

use crate::error::{DbError, Result};
use crate::ir::Ir;
use crate::value::Value;

/// Bumped whenever the on-wire shape of `Ir`/`ResultEnvelope` changes in a
/// way that isn't forward compatible. A payload carrying any other byte is
/// rejected outright rather than guessed at.
pub const CODEC_VERSION: u8 = 1;

/// Upper bound on an encoded payload's size, guarding the Bridge boundary
/// against a malformed or adversarial caller allocating unbounded memory.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub rows_affected: u64,
    pub last_insert_id: Option<Value>,
}

/// Encodes an `Ir` as `[CODEC_VERSION] || json-bytes`.
pub fn encode_ir(ir: &Ir) -> Result<Vec<u8>> {
    encode(ir)
}

/// Decodes an `Ir` previously produced by [`encode_ir`], rejecting a payload
/// over `max_payload_bytes` before attempting to deserialise it.
pub fn decode_ir(bytes: &[u8], max_payload_bytes: usize) -> Result<Ir> {
    decode(bytes, max_payload_bytes)
}

pub fn encode_result(envelope: &ResultEnvelope) -> Result<Vec<u8>> {
    encode(envelope)
}

pub fn decode_result(bytes: &[u8], max_payload_bytes: usize) -> Result<ResultEnvelope> {
    decode(bytes, max_payload_bytes)
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(value)
        .map_err(|e| DbError::Protocol(format!("failed to encode payload: {e}")))?;
    let mut out = Vec::with_capacity(body.len() + 1);
    out.push(CODEC_VERSION);
    out.extend_from_slice(&body);
    Ok(out)
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8], max_payload_bytes: usize) -> Result<T> {
    if bytes.len() > max_payload_bytes {
        return Err(DbError::Protocol(format!(
            "payload of {} bytes exceeds the {max_payload_bytes}-byte ceiling",
            bytes.len()
        )));
    }

    let (version, body) = bytes
        .split_first()
        .ok_or_else(|| DbError::Protocol("empty payload".to_string()))?;

    if *version != CODEC_VERSION {
        return Err(DbError::Protocol(format!(
            "unsupported codec version {version}, expected {CODEC_VERSION}"
        )));
    }

    serde_json::from_slice(body).map_err(|e| DbError::Protocol(format!("malformed payload: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Ir;

    #[test]
    fn ir_round_trips_through_the_wire() {
        let mut ir = Ir::select("users");
        ir.columns = Some(vec!["id".into(), "name".into()]);
        ir.limit = Some(5);

        let bytes = encode_ir(&ir).unwrap();
        let decoded = decode_ir(&bytes, DEFAULT_MAX_PAYLOAD_BYTES).unwrap();
        assert_eq!(decoded.table, "users");
        assert_eq!(decoded.columns, Some(vec!["id".to_string(), "name".to_string()]));
        assert_eq!(decoded.limit, Some(5));
    }

    #[test]
    fn rejects_unknown_version_byte() {
        let mut bytes = encode_ir(&Ir::select("users")).unwrap();
        bytes[0] = 99;
        let err = decode_ir(&bytes, DEFAULT_MAX_PAYLOAD_BYTES).unwrap_err();
        assert_eq!(err.kind(), "PROTOCOL");
    }

    #[test]
    fn rejects_empty_payload() {
        let err = decode_ir(&[], DEFAULT_MAX_PAYLOAD_BYTES).unwrap_err();
        assert_eq!(err.kind(), "PROTOCOL");
    }

    #[test]
    fn rejects_payload_over_the_size_ceiling() {
        let bytes = encode_ir(&Ir::select("users")).unwrap();
        let err = decode_ir(&bytes, 1).unwrap_err();
        assert_eq!(err.kind(), "PROTOCOL");
    }

    #[test]
    fn result_envelope_round_trips() {
        let envelope = ResultEnvelope {
            columns: vec!["id".into()],
            rows: vec![vec![Value::I64(1)], vec![Value::I64(2)]],
            rows_affected: 2,
            last_insert_id: Some(Value::I64(2)),
        };
        let bytes = encode_result(&envelope).unwrap();
        let decoded = decode_result(&bytes, DEFAULT_MAX_PAYLOAD_BYTES).unwrap();
        assert_eq!(decoded.rows.len(), 2);
        assert_eq!(decoded.last_insert_id, Some(Value::I64(2)));
    }
}
