// Optimistic annotation reconciliation (client side).
//
// When a user draws, the client renders a pending annotation immediately
// under a locally generated id and sends the create command. The engine
// broadcasts the confirmed copy to every participant, the author included;
// on arrival the author replaces the structurally matching pending entry
// with the authoritative one.
//
// Matching is by exact structural equality of (page_number, kind, color,
// payload). Two genuinely identical rapid strokes therefore produce two
// pending entries and consume two confirmations, never collapsing to one.
// A client-assigned idempotency token echoed by the server would make this
// matching exact per-stroke; the structural match is kept for wire
// compatibility, and this module is the single place such a token would
// slot into.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{Annotation, AnnotationKind};

/// A locally rendered annotation awaiting server confirmation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingAnnotation {
    /// Client-generated id, never sent to the server.
    pub local_id: Uuid,
    pub page_number: i32,
    pub kind: AnnotationKind,
    pub color: String,
    pub payload: serde_json::Value,
}

impl PendingAnnotation {
    pub fn new(
        page_number: i32,
        kind: AnnotationKind,
        color: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self { local_id: Uuid::new_v4(), page_number, kind, color: color.into(), payload }
    }

    fn matches(&self, confirmed: &Annotation) -> bool {
        self.page_number == confirmed.page_number
            && self.kind == confirmed.kind
            && self.color == confirmed.color
            && self.payload == confirmed.payload
    }
}

/// Outcome of applying a confirmed annotation to the pending set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    /// A pending entry structurally matched and was removed; the caller
    /// should swap it for the confirmed copy.
    Replaced { local_id: Uuid },
    /// No pending twin: the annotation came from another participant (or a
    /// retry the client no longer tracks) and should simply be inserted.
    Foreign,
}

/// The author's set of not-yet-confirmed annotations.
#[derive(Debug, Clone, Default)]
pub struct PendingAnnotations {
    entries: Vec<PendingAnnotation>,
}

impl PendingAnnotations {
    pub fn add(&mut self, pending: PendingAnnotation) {
        self.entries.push(pending);
    }

    /// Apply one confirmed `annotation_created` broadcast.
    ///
    /// Removes at most one structural twin, oldest first, so that N
    /// identical strokes reconcile against exactly N confirmations.
    pub fn confirm(&mut self, confirmed: &Annotation) -> Reconciliation {
        match self.entries.iter().position(|pending| pending.matches(confirmed)) {
            Some(index) => {
                let pending = self.entries.remove(index);
                Reconciliation::Replaced { local_id: pending.local_id }
            }
            None => Reconciliation::Foreign,
        }
    }

    /// Drop a pending entry whose create request failed outright.
    pub fn discard(&mut self, local_id: Uuid) -> bool {
        let before = self.entries.len();
        self.entries.retain(|pending| pending.local_id != local_id);
        self.entries.len() != before
    }

    pub fn entries(&self) -> &[PendingAnnotation] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
