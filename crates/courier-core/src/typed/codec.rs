//! EnvelopeCodec - TaskEnvelope と broker 上の bytes の相互変換
//!
//! decode に失敗した envelope は二度と正しくならないので、呼び出し側は
//! リトライせずに dead-letter へ送る。

use crate::domain::{CourierError, TaskEnvelope};

#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeCodec;

impl EnvelopeCodec {
    pub fn encode(envelope: &TaskEnvelope) -> Result<Vec<u8>, CourierError> {
        serde_json::to_vec(envelope)
            .map_err(|e| CourierError::MalformedEnvelope(format!("encode: {e}")))
    }

    /// Decodes and re-checks the envelope invariants.
    pub fn decode(bytes: &[u8]) -> Result<TaskEnvelope, CourierError> {
        let envelope: TaskEnvelope = serde_json::from_slice(bytes)
            .map_err(|e| CourierError::MalformedEnvelope(format!("json decode: {e}")))?;
        envelope
            .validate()
            .map_err(CourierError::MalformedEnvelope)?;
        Ok(envelope)
    }
}
