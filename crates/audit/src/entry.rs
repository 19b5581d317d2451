//! Audit entries and the hash chain linking them.
//!
//! # Invariants
//! - Entries are immutable once sealed. There is no update or delete path;
//!   corrections are new entries whose `corrects` points at the original.
//! - `sequence` starts at 1 and is contiguous.
//! - `hash = sha256(previous_hash || canonical(entry fields))`, hex encoded.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use taxguard_core::AuditEntryId;

/// Who performed the audited action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditActor {
    EndUser { id: Uuid },
    Staff { id: Uuid, super_staff: bool },
    System,
    /// No authenticated principal (failed logins, rejected tokens).
    Anonymous {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        identity: Option<String>,
    },
}

/// What the action was aimed at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditTarget {
    pub kind: String,
    pub id: String,
}

impl AuditTarget {
    pub fn new(kind: impl Into<String>, id: impl ToString) -> Self {
        Self {
            kind: kind.into(),
            id: id.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuditOutcome {
    Succeeded,
    /// Refused by the guard, the rate limiter or a transition table.
    Denied { reason: String },
    Failed { reason: String },
}

impl AuditOutcome {
    pub fn denied(reason: impl Into<String>) -> Self {
        AuditOutcome::Denied {
            reason: reason.into(),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        AuditOutcome::Failed {
            reason: reason.into(),
        }
    }
}

/// Review class of an entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditTag {
    #[default]
    Standard,
    PrivilegeEscalation,
    AuthenticationFailure,
    Override,
    Correction,
}

impl AuditTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditTag::Standard => "standard",
            AuditTag::PrivilegeEscalation => "privilege_escalation",
            AuditTag::AuthenticationFailure => "authentication_failure",
            AuditTag::Override => "override",
            AuditTag::Correction => "correction",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [
            AuditTag::Standard,
            AuditTag::PrivilegeEscalation,
            AuditTag::AuthenticationFailure,
            AuditTag::Override,
            AuditTag::Correction,
        ]
        .into_iter()
        .find(|t| t.as_str() == s)
    }
}

/// A request to record something. The payload is redacted by the recorder.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEvent {
    pub actor: AuditActor,
    pub action: String,
    pub target: Option<AuditTarget>,
    pub outcome: AuditOutcome,
    pub tag: AuditTag,
    pub payload: Value,
    pub corrects: Option<AuditEntryId>,
}

impl AuditEvent {
    pub fn new(actor: AuditActor, action: impl Into<String>, outcome: AuditOutcome) -> Self {
        Self {
            actor,
            action: action.into(),
            target: None,
            outcome,
            tag: AuditTag::Standard,
            payload: Value::Null,
            corrects: None,
        }
    }

    pub fn with_target(mut self, target: AuditTarget) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_tag(mut self, tag: AuditTag) -> Self {
        self.tag = tag;
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// A redacted entry waiting for its place in the chain.
///
/// Sinks assign `sequence` and `previous_hash` atomically and call [`PendingEntry::seal`].
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntry {
    pub id: AuditEntryId,
    pub recorded_at: DateTime<Utc>,
    pub actor: AuditActor,
    pub action: String,
    pub target: Option<AuditTarget>,
    pub outcome: AuditOutcome,
    pub tag: AuditTag,
    pub payload: Value,
    pub corrects: Option<AuditEntryId>,
}

impl PendingEntry {
    /// `payload` must already be redacted.
    pub fn new(event: AuditEvent, payload: Value, now: DateTime<Utc>) -> Self {
        Self {
            id: AuditEntryId::new(),
            // microsecond precision survives a round trip through the datastore
            recorded_at: now.trunc_subsecs(6),
            actor: event.actor,
            action: event.action,
            target: event.target,
            outcome: event.outcome,
            tag: event.tag,
            payload,
            corrects: event.corrects,
        }
    }

    pub fn seal(self, sequence: u64, previous_hash: Option<String>) -> AuditEntry {
        let mut entry = AuditEntry {
            id: self.id,
            sequence,
            recorded_at: self.recorded_at,
            actor: self.actor,
            action: self.action,
            target: self.target,
            outcome: self.outcome,
            tag: self.tag,
            payload: self.payload,
            corrects: self.corrects,
            previous_hash,
            hash: String::new(),
        };
        entry.hash = entry.compute_hash();
        entry
    }
}

/// An immutable, sealed audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: AuditEntryId,
    pub sequence: u64,
    pub recorded_at: DateTime<Utc>,
    pub actor: AuditActor,
    pub action: String,
    pub target: Option<AuditTarget>,
    pub outcome: AuditOutcome,
    pub tag: AuditTag,
    pub payload: Value,
    pub corrects: Option<AuditEntryId>,
    pub previous_hash: Option<String>,
    pub hash: String,
}

#[derive(Serialize)]
struct HashInput<'a> {
    id: &'a AuditEntryId,
    sequence: u64,
    recorded_at: String,
    actor: &'a AuditActor,
    action: &'a str,
    target: &'a Option<AuditTarget>,
    outcome: &'a AuditOutcome,
    tag: AuditTag,
    payload: &'a Value,
    corrects: &'a Option<AuditEntryId>,
}

impl AuditEntry {
    /// Recompute this entry's hash from its fields and `previous_hash`.
    pub fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();

        if let Some(prev) = &self.previous_hash {
            hasher.update(prev.as_bytes());
        }

        let input = HashInput {
            id: &self.id,
            sequence: self.sequence,
            recorded_at: self.recorded_at.to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
            actor: &self.actor,
            action: &self.action,
            target: &self.target,
            outcome: &self.outcome,
            tag: self.tag,
            payload: &self.payload,
            corrects: &self.corrects,
        };
        // object keys in `Value` are sorted, so the encoding is canonical
        let bytes = serde_json::to_vec(&input).unwrap_or_default();
        hasher.update(&bytes);

        hex::encode(hasher.finalize())
    }
}

/// First broken link found by [`verify_chain`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("audit chain broken at sequence {sequence}: {reason}")]
pub struct ChainBreak {
    pub sequence: u64,
    pub reason: String,
}

/// Verify a complete chain, starting from the genesis entry.
pub fn verify_chain(entries: &[AuditEntry]) -> Result<(), ChainBreak> {
    let mut previous: Option<&AuditEntry> = None;

    for entry in entries {
        let expected_sequence = previous.map(|p| p.sequence + 1).unwrap_or(1);
        if entry.sequence != expected_sequence {
            return Err(ChainBreak {
                sequence: entry.sequence,
                reason: format!("expected sequence {expected_sequence}"),
            });
        }

        let expected_previous = previous.map(|p| p.hash.clone());
        if entry.previous_hash != expected_previous {
            return Err(ChainBreak {
                sequence: entry.sequence,
                reason: "previous_hash does not match the preceding entry".to_string(),
            });
        }

        if entry.compute_hash() != entry.hash {
            return Err(ChainBreak {
                sequence: entry.sequence,
                reason: "hash does not match entry contents".to_string(),
            });
        }

        previous = Some(entry);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chain(n: usize) -> Vec<AuditEntry> {
        let mut out: Vec<AuditEntry> = Vec::new();
        for i in 0..n {
            let event = AuditEvent::new(AuditActor::System, format!("step.{i}"), AuditOutcome::Succeeded)
                .with_payload(json!({ "i": i }));
            let pending = PendingEntry::new(event.clone(), event.payload.clone(), Utc::now());
            let prev = out.last().map(|e| e.hash.clone());
            out.push(pending.seal(i as u64 + 1, prev));
        }
        out
    }

    #[test]
    fn sealed_chain_verifies() {
        assert_eq!(verify_chain(&chain(5)), Ok(()));
    }

    #[test]
    fn tampered_payload_is_detected() {
        let mut entries = chain(4);
        entries[2].payload = json!({ "i": 99 });
        let err = verify_chain(&entries).unwrap_err();
        assert_eq!(err.sequence, 3);
    }

    #[test]
    fn removed_entry_is_detected() {
        let mut entries = chain(4);
        entries.remove(1);
        let err = verify_chain(&entries).unwrap_err();
        assert_eq!(err.sequence, 3);
    }

    #[test]
    fn hash_survives_serde_round_trip() {
        let entries = chain(2);
        let json = serde_json::to_string(&entries).unwrap();
        let back: Vec<AuditEntry> = serde_json::from_str(&json).unwrap();
        assert_eq!(verify_chain(&back), Ok(()));
    }
}
