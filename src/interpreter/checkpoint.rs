//! Byte layout of interpreter continuations.
//!
//! ```text
//! "RLMC" | version: u16 BE | blake3(body): 32 bytes | body: JSON continuation
//! ```

use super::EngineError;
use crate::progress::{Checkpoint, Limits, ResumeInstruction};
use serde::{Deserialize, Serialize};

/// Leading bytes of every checkpoint.
pub const CHECKPOINT_MAGIC: &[u8; 4] = b"RLMC";
/// Current continuation format version.
pub const CHECKPOINT_VERSION: u16 = 1;

const DIGEST_LEN: usize = 32;
const HEADER_LEN: usize = CHECKPOINT_MAGIC.len() + 2 + DIGEST_LEN;

/// An external call that has already been answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Function the script called.
    pub function_name: String,
    /// Answer fed back to the script.
    pub instruction: ResumeInstruction,
}

/// Everything needed to rebuild a suspended run by replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Continuation {
    /// Script source.
    pub source: String,
    /// Names the script may call out to.
    pub external_functions: Vec<String>,
    /// Budget applied to every step.
    pub limits: Limits,
    /// Answered calls, in call order.
    pub journal: Vec<JournalEntry>,
    /// Call the run is suspended on, if any.
    pub pending: Option<String>,
    /// Print emissions already handed to the host.
    pub prints_delivered: usize,
}

impl Continuation {
    /// A continuation for a run that has not executed yet.
    pub fn fresh(source: &str, external_functions: &[String], limits: Limits) -> Self {
        Self {
            source: source.to_string(),
            external_functions: external_functions.to_vec(),
            limits,
            journal: Vec::new(),
            pending: None,
            prints_delivered: 0,
        }
    }

    /// Record the answer to the pending call so the next replay can pass it.
    pub fn answer(&mut self, instruction: ResumeInstruction) -> Result<(), EngineError> {
        let function_name = self.pending.take().ok_or_else(|| {
            EngineError::Checkpoint("checkpoint is not suspended on a call".to_string())
        })?;
        self.journal.push(JournalEntry {
            function_name,
            instruction,
        });
        Ok(())
    }
}

/// Serialize a continuation into checkpoint bytes.
pub fn dump(continuation: &Continuation) -> Result<Checkpoint, EngineError> {
    let body = serde_json::to_vec(continuation)
        .map_err(|err| EngineError::Internal(format!("failed to encode continuation: {err}")))?;
    let digest = blake3::hash(&body);

    let mut bytes = Vec::with_capacity(HEADER_LEN + body.len());
    bytes.extend_from_slice(CHECKPOINT_MAGIC);
    bytes.extend_from_slice(&CHECKPOINT_VERSION.to_be_bytes());
    bytes.extend_from_slice(digest.as_bytes());
    bytes.extend_from_slice(&body);
    Ok(Checkpoint::from_bytes(bytes))
}

/// Parse checkpoint bytes back into a continuation.
pub fn load(checkpoint: &Checkpoint) -> Result<Continuation, EngineError> {
    let bytes = checkpoint.as_bytes();
    if bytes.len() < HEADER_LEN {
        return Err(EngineError::Checkpoint(format!(
            "checkpoint truncated: {} bytes",
            bytes.len()
        )));
    }
    let (magic, rest) = bytes.split_at(CHECKPOINT_MAGIC.len());
    if magic != CHECKPOINT_MAGIC {
        return Err(EngineError::Checkpoint("bad checkpoint magic".to_string()));
    }
    let (version, rest) = rest.split_at(2);
    let version = u16::from_be_bytes([version[0], version[1]]);
    if version != CHECKPOINT_VERSION {
        return Err(EngineError::Checkpoint(format!(
            "unsupported checkpoint version {version}"
        )));
    }
    let (digest, body) = rest.split_at(DIGEST_LEN);
    if blake3::hash(body).as_bytes() != digest {
        return Err(EngineError::Checkpoint(
            "checkpoint digest mismatch".to_string(),
        ));
    }
    serde_json::from_slice(body)
        .map_err(|err| EngineError::Checkpoint(format!("invalid continuation: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Continuation {
        let mut continuation =
            Continuation::fresh("(echo 1)", &["echo".to_string()], Limits::default());
        continuation.pending = Some("echo".to_string());
        continuation.prints_delivered = 2;
        continuation
    }

    #[test]
    fn dump_then_load_restores_the_continuation() {
        let continuation = sample();
        let checkpoint = dump(&continuation).unwrap();
        assert_eq!(&checkpoint.as_bytes()[..4], b"RLMC");
        assert_eq!(load(&checkpoint).unwrap(), continuation);
    }

    #[test]
    fn rejects_tampered_bytes() {
        let mut bytes = dump(&sample()).unwrap().into_bytes();
        let last = bytes.len() - 2;
        bytes[last] ^= 0x01;
        let err = load(&Checkpoint::from_bytes(bytes)).unwrap_err();
        assert!(err.to_string().contains("digest mismatch"), "{err}");
    }

    #[test]
    fn rejects_foreign_headers() {
        let mut bytes = dump(&sample()).unwrap().into_bytes();
        bytes[4] = 0xff;
        assert!(matches!(
            load(&Checkpoint::from_bytes(bytes.clone())),
            Err(EngineError::Checkpoint(_))
        ));
        bytes[0] = b'X';
        assert!(matches!(
            load(&Checkpoint::from_bytes(bytes)),
            Err(EngineError::Checkpoint(_))
        ));
        assert!(matches!(
            load(&Checkpoint::from_bytes(vec![1, 2, 3])),
            Err(EngineError::Checkpoint(_))
        ));
    }

    #[test]
    fn answering_moves_pending_into_the_journal() {
        let mut continuation = sample();
        continuation
            .answer(ResumeInstruction::ReturnValue(json!(5)))
            .unwrap();
        assert!(continuation.pending.is_none());
        assert_eq!(continuation.journal.len(), 1);
        assert_eq!(continuation.journal[0].function_name, "echo");
        assert!(
            continuation
                .answer(ResumeInstruction::ReturnValue(json!(6)))
                .is_err()
        );
    }
}
