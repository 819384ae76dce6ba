//! Traceability Index: append-only, hash-chained event log per subject.
//!
//! Every event is encoded to CBOR and hashed with sha256; each entry
//! carries the hash of its predecessor so any later mutation of the log
//! breaks the chain and is caught by [`TraceIndex::verify_integrity`].
//! Appends never perform business validation, that happens upstream in
//! the component that triggered the event.

use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use sled::Transactional;
use sled::transaction::TransactionError;

use crate::error::EngineError;
use crate::registry::UnitState;
use crate::requests::RequestStatus;
use crate::types::{BloodType, Component, TimeStamp};
use crate::utils::{self, from_cbor, lock_recover, to_cbor};

const TRACE_TREE: &str = "trace";
const TRACE_IDS_TREE: &str = "trace_ids";
const APPEND_ATTEMPTS: u32 = 3;
const APPEND_BACKOFF: Duration = Duration::from_millis(25);

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracePriority {
    #[n(0)]
    Routine,
    #[n(1)]
    Critical,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub enum TraceKind {
    #[n(0)]
    DonorRegistered {
        #[n(0)]
        name: String,
    },
    #[n(1)]
    DonorDeferred {
        #[n(0)]
        reason: String,
        #[n(1)]
        permanent: bool,
        #[n(2)]
        until: Option<TimeStamp<Utc>>,
    },
    #[n(2)]
    SerologyRecorded {
        #[n(0)]
        blood_type: Option<BloodType>,
        #[n(1)]
        passed: bool,
    },
    #[n(3)]
    UnitCollected {
        #[n(0)]
        donor_id: String,
        #[n(1)]
        component: Component,
        #[n(2)]
        volume_ml: u32,
    },
    #[n(4)]
    UnitStateChanged {
        #[n(0)]
        before: UnitState,
        #[n(1)]
        after: UnitState,
        #[n(2)]
        evidence: Option<String>,
    },
    #[n(5)]
    RequestStatusChanged {
        #[n(0)]
        before: RequestStatus,
        #[n(1)]
        after: RequestStatus,
        #[n(2)]
        evidence: Option<String>,
    },
    #[n(6)]
    CriticalOverride {
        #[n(0)]
        detail: String,
    },
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct TraceEvent {
    #[n(0)]
    pub seq: u64,
    #[n(1)]
    pub event_id: String,
    #[n(2)]
    pub subject_id: String,
    #[n(3)]
    pub actor: String,
    #[n(4)]
    pub recorded_at: TimeStamp<Utc>,
    #[n(5)]
    pub kind: TraceKind,
    #[n(6)]
    pub priority: TracePriority,
    #[n(7)]
    pub prev_hash: String,
    #[n(8)]
    pub hash: String,
}

/// Everything a caller supplies; seq and chain links are assigned on append.
#[derive(Debug, Clone)]
pub struct TraceDraft {
    pub event_id: String,
    pub subject_id: String,
    pub actor: String,
    pub kind: TraceKind,
    pub priority: TracePriority,
}

impl TraceDraft {
    pub fn new(subject_id: &str, actor: &str, kind: TraceKind) -> Self {
        Self {
            event_id: utils::new_event_id(),
            subject_id: subject_id.to_string(),
            actor: actor.to_string(),
            kind,
            priority: TracePriority::Routine,
        }
    }
    pub fn critical(mut self) -> Self {
        self.priority = TracePriority::Critical;
        self
    }
    pub fn with_event_id(mut self, event_id: &str) -> Self {
        self.event_id = event_id.to_string();
        self
    }
}

impl TraceEvent {
    // hash over the CBOR of the event with its own hash field blanked
    fn compute_hash(&self) -> Result<String, EngineError> {
        let mut unsealed = self.clone();
        unsealed.hash = String::new();
        let cbor = to_cbor(&unsealed)?;
        Ok(sha256::digest(cbor.as_slice()))
    }

    /// Short hex form of the chain link, for log lines and audit output.
    pub fn short_link(&self) -> String {
        self.hash.chars().take(12).collect()
    }
}

pub struct TraceIndex {
    tree: sled::Tree,
    ids: sled::Tree,
    // appends to one subject must be serialized so seq assignment is safe
    append_lock: Mutex<()>,
}

fn subject_prefix(subject_id: &str) -> Vec<u8> {
    let mut prefix = subject_id.as_bytes().to_vec();
    prefix.push(0);
    prefix
}

fn event_key(subject_id: &str, seq: u64) -> Vec<u8> {
    let mut key = subject_prefix(subject_id);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn genesis_link(subject_id: &str) -> String {
    sha256::digest(subject_id)
}

impl TraceIndex {
    pub fn open(db: &sled::Db) -> Result<Self, EngineError> {
        Ok(Self {
            tree: db.open_tree(TRACE_TREE)?,
            ids: db.open_tree(TRACE_IDS_TREE)?,
            append_lock: Mutex::new(()),
        })
    }

    /// Append one event to its subject's chain. Fails only on storage or
    /// codec problems, never on business rules. Idempotent per event id:
    /// redelivering the same event returns the already-recorded entry.
    pub fn append(&self, draft: TraceDraft) -> Result<TraceEvent, EngineError> {
        let _guard = lock_recover(&self.append_lock);

        if let Some(existing_key) = self.ids.get(draft.event_id.as_bytes())? {
            if let Some(bytes) = self.tree.get(existing_key)? {
                return from_cbor(&bytes);
            }
        }

        let last = self
            .tree
            .scan_prefix(subject_prefix(&draft.subject_id))
            .last()
            .transpose()?;
        let (seq, prev_hash) = match last {
            Some((_, bytes)) => {
                let prev: TraceEvent = from_cbor(&bytes)?;
                (prev.seq + 1, prev.hash)
            }
            None => (0, genesis_link(&draft.subject_id)),
        };

        let mut event = TraceEvent {
            seq,
            event_id: draft.event_id,
            subject_id: draft.subject_id,
            actor: draft.actor,
            recorded_at: TimeStamp::new(),
            kind: draft.kind,
            priority: draft.priority,
            prev_hash,
            hash: String::new(),
        };
        event.hash = event.compute_hash()?;

        let key = event_key(&event.subject_id, event.seq);
        let value = to_cbor(&event)?;
        // the record and its idempotency index commit together, so a
        // crash between the two can never let a redelivered event
        // append a second copy
        (&self.tree, &self.ids)
            .transaction(|(tree, ids)| {
                tree.insert(key.as_slice(), value.as_slice())?;
                ids.insert(event.event_id.as_bytes(), key.as_slice())?;
                Ok(())
            })
            .map_err(|err: TransactionError<()>| match err {
                TransactionError::Storage(e) => EngineError::Storage(e),
                TransactionError::Abort(()) => {
                    EngineError::Codec("trace append transaction aborted".into())
                }
            })?;

        Ok(event)
    }

    /// Append with bounded backoff. Storage failures are retried and
    /// logged; they are never silently dropped.
    pub fn append_with_retry(&self, draft: TraceDraft) -> Result<TraceEvent, EngineError> {
        let mut attempt = 0;
        loop {
            match self.append(draft.clone()) {
                Ok(event) => return Ok(event),
                Err(err @ (EngineError::Storage(_) | EngineError::Codec(_)))
                    if attempt + 1 < APPEND_ATTEMPTS =>
                {
                    attempt += 1;
                    tracing::warn!(
                        subject = %draft.subject_id,
                        attempt,
                        error = %err,
                        "trace append failed, retrying"
                    );
                    std::thread::sleep(APPEND_BACKOFF * attempt);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Lazy forward-chronological walk of one subject's chain.
    pub fn chain_for(&self, subject_id: &str) -> TraceChain {
        self.chain_from(subject_id, 0)
    }

    /// Restart a walk from a known sequence number.
    pub fn chain_from(&self, subject_id: &str, from_seq: u64) -> TraceChain {
        let start = event_key(subject_id, from_seq);
        let mut end = subject_prefix(subject_id);
        end.extend_from_slice(&u64::MAX.to_be_bytes());
        TraceChain {
            iter: self.tree.range(start..=end),
        }
    }

    /// Recompute the hash chain for one subject. Returns the chain length,
    /// or [`EngineError::IntegrityViolation`] at the first broken link.
    /// The chain is never auto-repaired.
    pub fn verify_integrity(&self, subject_id: &str) -> Result<u64, EngineError> {
        let mut expected_seq = 0u64;
        let mut expected_link = genesis_link(subject_id);

        for event in self.chain_for(subject_id) {
            let event = event?;
            if event.seq != expected_seq
                || event.prev_hash != expected_link
                || event.compute_hash()? != event.hash
            {
                return Err(EngineError::IntegrityViolation {
                    subject: subject_id.to_string(),
                    seq: event.seq,
                });
            }
            expected_seq += 1;
            expected_link = event.hash;
        }

        Ok(expected_seq)
    }
}

pub struct TraceChain {
    iter: sled::Iter,
}

impl Iterator for TraceChain {
    type Item = Result<TraceEvent, EngineError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.iter.next()? {
            Ok((_, bytes)) => Some(from_cbor(&bytes)),
            Err(e) => Some(Err(EngineError::Storage(e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_index() -> (tempfile::TempDir, TraceIndex) {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path().join("trace.db")).unwrap();
        (dir, TraceIndex::open(&db).unwrap())
    }

    #[test]
    fn chain_links_and_sequences() {
        let (_dir, index) = open_index();

        for i in 0..4 {
            index
                .append(TraceDraft::new(
                    "unit_abc",
                    "actor_x",
                    TraceKind::UnitStateChanged {
                        before: UnitState::Collected,
                        after: UnitState::Processing,
                        evidence: Some(format!("step {i}")),
                    },
                ))
                .unwrap();
        }

        let events: Vec<_> = index
            .chain_for("unit_abc")
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(events.len(), 4);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.seq, i as u64);
        }
        for pair in events.windows(2) {
            assert_eq!(pair[1].prev_hash, pair[0].hash);
        }

        assert_eq!(index.verify_integrity("unit_abc").unwrap(), 4);
    }

    #[test]
    fn duplicate_event_id_is_recorded_once() {
        let (_dir, index) = open_index();

        let draft = TraceDraft::new(
            "donor_abc",
            "actor_x",
            TraceKind::DonorRegistered {
                name: "Ada".into(),
            },
        );
        let first = index.append(draft.clone()).unwrap();
        let second = index.append(draft).unwrap();

        assert_eq!(first, second);
        assert_eq!(index.verify_integrity("donor_abc").unwrap(), 1);
    }

    #[test]
    fn restartable_from_seq() {
        let (_dir, index) = open_index();

        for name in ["a", "b", "c"] {
            index
                .append(TraceDraft::new(
                    "donor_xyz",
                    "actor_x",
                    TraceKind::DonorRegistered { name: name.into() },
                ))
                .unwrap();
        }

        let tail: Vec<_> = index
            .chain_from("donor_xyz", 1)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].seq, 1);
    }
}
