//! Plain-text rendering of the active set and the live temporal state.

use crate::allocator::ActiveSlot;
use crate::constants::CHARS_PER_TOKEN;
use crate::node::NodeStore;
use crate::temporal::TemporalMemory;

pub const FACTS_OPEN: &str = "[FACTS]";
pub const FACTS_CLOSE: &str = "[/FACTS]";
pub const STATE_OPEN: &str = "[STATE]";
pub const STATE_CLOSE: &str = "[/STATE]";

/// Render active slots as a `[FACTS]` block, one `- label: value` line per
/// slot in admission order. Ids missing from the store are skipped, so an
/// empty active set still yields an (empty) block.
pub fn render_facts(slots: &[ActiveSlot], store: &dyn NodeStore) -> String {
    let mut out = String::from(FACTS_OPEN);
    out.push('\n');
    for slot in slots {
        let Some(node) = store.get(slot.node_id) else {
            tracing::debug!(node_id = slot.node_id, "skipping unknown node while rendering");
            continue;
        };
        out.push_str("- ");
        out.push_str(&node.label);
        out.push_str(": ");
        out.push_str(&node.value);
        out.push('\n');
    }
    out.push_str(FACTS_CLOSE);
    out
}

/// Wrap the live temporal context in a `[STATE]` block.
pub fn render_temporal(memory: &TemporalMemory) -> String {
    let context = memory.retrieve_context();
    if context.is_empty() {
        format!("{STATE_OPEN}\n{STATE_CLOSE}")
    } else {
        format!("{STATE_OPEN}\n{context}\n{STATE_CLOSE}")
    }
}

/// Longest prefix of `text` within `max_tokens` at four bytes per token,
/// cut on a char boundary.
pub fn truncate_to_tokens(text: &str, max_tokens: i32) -> &str {
    if max_tokens <= 0 {
        return "";
    }
    let max_bytes = (max_tokens as usize).saturating_mul(CHARS_PER_TOKEN);
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
