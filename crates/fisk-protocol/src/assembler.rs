//! Binary payload reassembly.
//!
//! A JSON frame with a positive numeric `bytes` field announces that exactly
//! that many bytes follow as binary frames. Until they have all arrived no
//! other JSON frame is allowed.

use bytes::Bytes;
use serde_json::Value;

use crate::error::ProtocolError;

/// A logical event produced from one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A complete JSON message.
    Message(Value),
    /// A fragment of the currently declared payload.
    Data {
        data: Bytes,
        /// Set on the fragment that completes the payload.
        last: bool,
    },
}

/// Tracks the outstanding byte count of a declared payload.
#[derive(Debug, Default)]
pub struct PayloadAssembler {
    outstanding: u64,
}

impl PayloadAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes still expected for the current payload.
    pub fn outstanding(&self) -> u64 {
        self.outstanding
    }

    /// Handle a JSON frame.
    pub fn on_text(&mut self, text: &str) -> Result<Inbound, ProtocolError> {
        if self.outstanding > 0 {
            return Err(ProtocolError::violation(format!(
                "JSON frame received while {} payload bytes are outstanding",
                self.outstanding
            )));
        }

        let value: Value = serde_json::from_str(text)
            .map_err(|e| ProtocolError::invalid_request(format!("invalid JSON: {}", e)))?;

        if let Some(bytes) = value.get("bytes") {
            match bytes.as_u64() {
                Some(n) => self.outstanding = n,
                None if bytes.is_null() => {}
                None => {
                    return Err(ProtocolError::invalid_request(
                        "'bytes' must be a non-negative integer",
                    ))
                }
            }
        }

        Ok(Inbound::Message(value))
    }

    /// Handle a binary frame.
    pub fn on_binary(&mut self, data: Bytes) -> Result<Inbound, ProtocolError> {
        if self.outstanding == 0 {
            return Err(ProtocolError::violation(
                "binary frame received without a declared payload",
            ));
        }
        let len = data.len() as u64;
        if len > self.outstanding {
            return Err(ProtocolError::violation(format!(
                "binary frame of {} bytes exceeds the {} bytes outstanding",
                len, self.outstanding
            )));
        }

        self.outstanding -= len;
        Ok(Inbound::Data {
            data,
            last: self.outstanding == 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn reassemble(payload: &[u8], cuts: &[usize]) -> (Vec<u8>, usize) {
        let mut assembler = PayloadAssembler::new();
        let header = format!("{{\"type\":\"environment\",\"bytes\":{}}}", payload.len());
        assembler.on_text(&header).unwrap();

        let mut out = Vec::new();
        let mut lasts = 0;
        let mut start = 0;
        let mut points: Vec<usize> = cuts.iter().map(|c| c % (payload.len() + 1)).collect();
        points.push(payload.len());
        points.sort_unstable();
        for end in points {
            if end <= start {
                continue;
            }
            match assembler
                .on_binary(Bytes::copy_from_slice(&payload[start..end]))
                .unwrap()
            {
                Inbound::Data { data, last } => {
                    out.extend_from_slice(&data);
                    if last {
                        lasts += 1;
                    }
                }
                Inbound::Message(_) => unreachable!(),
            }
            start = end;
        }
        (out, lasts)
    }

    #[test]
    fn test_message_without_payload() {
        let mut assembler = PayloadAssembler::new();
        let inbound = assembler.on_text(r#"{"type":"heartbeat"}"#).unwrap();
        assert!(matches!(inbound, Inbound::Message(_)));
        assert_eq!(assembler.outstanding(), 0);
    }

    #[test]
    fn test_single_and_bytewise_split_agree() {
        let payload: Vec<u8> = (0..=255u8).collect();
        let (whole, _) = reassemble(&payload, &[]);
        let cuts: Vec<usize> = (1..payload.len()).collect();
        let (bytewise, lasts) = reassemble(&payload, &cuts);
        assert_eq!(whole, payload);
        assert_eq!(bytewise, payload);
        assert_eq!(lasts, 1);
    }

    #[test]
    fn test_binary_without_declaration() {
        let mut assembler = PayloadAssembler::new();
        let err = assembler
            .on_binary(Bytes::from_static(b"x"))
            .unwrap_err();
        assert_eq!(err.code, crate::ErrorCode::ProtocolViolation);
    }

    #[test]
    fn test_binary_exceeding_declaration() {
        let mut assembler = PayloadAssembler::new();
        assembler.on_text(r#"{"bytes":2}"#).unwrap();
        let err = assembler
            .on_binary(Bytes::from_static(b"xyz"))
            .unwrap_err();
        assert_eq!(err.code, crate::ErrorCode::ProtocolViolation);
    }

    #[test]
    fn test_json_while_outstanding() {
        let mut assembler = PayloadAssembler::new();
        assembler.on_text(r#"{"bytes":4}"#).unwrap();
        assembler.on_binary(Bytes::from_static(b"ab")).unwrap();
        let err = assembler.on_text(r#"{"type":"heartbeat"}"#).unwrap_err();
        assert_eq!(err.code, crate::ErrorCode::ProtocolViolation);
    }

    #[test]
    fn test_rejects_negative_bytes() {
        let mut assembler = PayloadAssembler::new();
        let err = assembler.on_text(r#"{"bytes":-1}"#).unwrap_err();
        assert_eq!(err.code, crate::ErrorCode::InvalidRequest);
    }

    proptest! {
        #[test]
        fn prop_any_split_reassembles(
            payload in proptest::collection::vec(any::<u8>(), 1..2048),
            cuts in proptest::collection::vec(any::<usize>(), 0..64),
        ) {
            let (out, lasts) = reassemble(&payload, &cuts);
            prop_assert_eq!(out, payload);
            prop_assert_eq!(lasts, 1);
        }
    }
}
