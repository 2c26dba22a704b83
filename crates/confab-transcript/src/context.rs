use tracing::warn;

use confab_core::{Error, Message, Result};

use crate::model::Transcript;

/// Governs which exchanges are sent in full and which are compacted.
#[derive(Debug, Clone)]
pub struct MemoryPolicy {
    pub enabled: bool,
    pub max_full_exchanges: usize,
    pub placeholder: String,
}

impl Default for MemoryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_full_exchanges: 2,
            placeholder: "(earlier question omitted)".to_string(),
        }
    }
}

impl MemoryPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }
}

/// Build the ordered message list for dispatching `target`.
///
/// An exchange is sent in full when it is the target, lies within the
/// last `max_full_exchanges` before it, or its question carries file
/// references. Compacted exchanges send a placeholder question and the
/// stored summary for the answer. The per-document header override
/// beats the policy default; disabling memory preserves everything.
///
/// The first message is always an empty system slot for the caller to
/// fill with the resolved system prompt. The target's answer is never
/// emitted.
pub fn build_context(
    transcript: &Transcript,
    target: usize,
    policy: &MemoryPolicy,
) -> Result<Vec<Message>> {
    let total = transcript.exchanges.len();
    if target >= total {
        return Err(Error::Unknown(format!(
            "target exchange {target} out of range ({total} exchanges)"
        )));
    }

    let max_full = if policy.enabled {
        transcript
            .max_full_exchanges_override()
            .unwrap_or(policy.max_full_exchanges)
    } else {
        usize::MAX
    };

    let mut messages = vec![Message::system("")];

    for (index, exchange) in transcript.exchanges.iter().enumerate().take(target + 1) {
        let is_target = index == target;
        let within_window = target - index <= max_full;

        if is_target || within_window || exchange.has_file_references() {
            if exchange.has_file_references() {
                let resolved: Vec<String> = exchange
                    .question
                    .file_references
                    .iter()
                    .filter_map(|r| {
                        r.resolved_content
                            .as_ref()
                            .map(|content| format!("<{}>\n{}", r.path, content.trim_end()))
                    })
                    .collect();
                if !resolved.is_empty() {
                    messages.push(Message::system(resolved.join("\n\n")).with_cache_hint());
                }
            }
            let question = exchange.question.text.trim();
            if is_target || !question.is_empty() {
                messages.push(Message::user(question));
            }
        } else {
            messages.push(Message::user(policy.placeholder.clone()));
        }

        if is_target {
            continue;
        }

        if within_window {
            if let Some(answer) = &exchange.answer {
                let text = answer.text.trim();
                if !text.is_empty() {
                    messages.push(Message::assistant(text));
                }
            }
            continue;
        }

        match &exchange.summary {
            Some(summary) if !summary.text.trim().is_empty() => {
                messages.push(Message::assistant(summary.text.trim()));
            }
            _ => {
                if let Some(answer) = &exchange.answer {
                    let text = answer.text.trim();
                    if !text.is_empty() {
                        warn!(
                            exchange = index,
                            "exchange has no summary line; sending the full answer"
                        );
                        messages.push(Message::assistant(text));
                    }
                }
            }
        }
    }

    Ok(messages)
}
