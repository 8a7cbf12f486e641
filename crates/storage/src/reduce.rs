use serde::{Deserialize, Serialize};

use super::types::{ContentPart, ConversationRecord, MessageContent, Payload};

pub const DEFAULT_INLINE_PART_THRESHOLD_BYTES: u64 = 16 * 1024;
pub const DEFAULT_TEXT_BUDGET_CHARS: usize = 8_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReductionPolicy {
    pub inline_part_threshold_bytes: u64,
    pub text_budget_chars: usize,
}

impl Default for ReductionPolicy {
    fn default() -> Self {
        Self {
            inline_part_threshold_bytes: DEFAULT_INLINE_PART_THRESHOLD_BYTES,
            text_budget_chars: DEFAULT_TEXT_BUDGET_CHARS,
        }
    }
}

/// Builds the degraded copy written when the full record does not fit.
///
/// Inline payloads above the threshold become [`Payload::Stripped`], keeping the
/// part's type and size metadata. Text bodies longer than the budget are cut at
/// a character boundary and the message is marked `truncated`. The record is
/// flagged `reduced` only when at least one payload or body was cut.
pub fn reduce_record(record: &ConversationRecord, policy: &ReductionPolicy) -> ConversationRecord {
    let mut reduced = record.clone();
    let mut changed = false;

    for message in &mut reduced.messages {
        match &mut message.content {
            MessageContent::Text(text) => {
                if truncate_text(text, policy.text_budget_chars) {
                    message.truncated = true;
                    changed = true;
                }
            }
            MessageContent::Parts(parts) => {
                for part in parts.iter_mut() {
                    match part {
                        ContentPart::Text { text } => {
                            if truncate_text(text, policy.text_budget_chars) {
                                message.truncated = true;
                                changed = true;
                            }
                        }
                        ContentPart::Image(media)
                        | ContentPart::Audio(media)
                        | ContentPart::File(media) => {
                            if let Some(length) = media.payload.inline_len()
                                && length > policy.inline_part_threshold_bytes
                            {
                                media.payload = Payload::Stripped {
                                    original_bytes: length,
                                };
                                changed = true;
                            }
                        }
                    }
                }
            }
        }
    }

    // Only a copy that actually lost content is flagged.
    reduced.reduced = record.reduced || changed;
    reduced
}

fn truncate_text(text: &mut String, budget_chars: usize) -> bool {
    match text.char_indices().nth(budget_chars) {
        Some((byte_index, _)) => {
            text.truncate(byte_index);
            true
        }
        None => false,
    }
}
