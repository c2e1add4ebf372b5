//! Part reconciliation
//!
//! Merges one incoming part into a message's ordered part list:
//! - tool parts are matched by `id` and replaced at the same index,
//!   or appended when unseen
//! - every other part kind has no identity and is appended
//!
//! Array position always reflects first-seen order. Parts are never
//! removed or reordered.

use crate::types::{Message, Part};

/// What the merge did with the incoming part
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartMerge {
    /// Part appended at this index
    Appended(usize),
    /// Existing tool part at this index replaced
    Replaced(usize),
}

/// Merge `incoming` into a copy of `message`
///
/// The input message is left untouched; the returned message owns a new
/// part vector.
pub fn reconcile(message: &Message, incoming: Part) -> Message {
    let mut next = message.clone();
    merge_part(&mut next, incoming);
    next
}

/// In-place variant of [`reconcile`], reporting where the part landed
pub fn merge_part(message: &mut Message, incoming: Part) -> PartMerge {
    let existing = incoming.tool_id().and_then(|id| {
        message
            .parts
            .iter()
            .position(|p| p.tool_id() == Some(id))
    });

    match existing {
        Some(index) => {
            warn_on_regression(message, &message.parts[index], &incoming);
            message.parts[index] = incoming;
            PartMerge::Replaced(index)
        }
        None => {
            message.parts.push(incoming);
            PartMerge::Appended(message.parts.len() - 1)
        }
    }
}

/// Log (but accept) tool state transitions outside the expected order
fn warn_on_regression(message: &Message, previous: &Part, incoming: &Part) {
    if let (Part::Tool(prev), Part::Tool(next)) = (previous, incoming) {
        if !prev.state.can_advance_to(next.state) {
            tracing::warn!(
                session = %message.session_id,
                message = %message.id,
                tool_call = %next.id,
                from = %prev.state,
                to = %next.state,
                "Tool state moved backwards; accepting as given"
            );
        }
    }
}
