//! Transcript compaction — collapses old conversation history into a summary
//! so the context window stays healthy after many turns.
//!
//! Compaction appends a summary marker to the transcript (never rewrites).
//! When loading history, only lines after the last marker are used.

use sa_domain::config::{CompactionConfig, TurnConfig};
use sa_providers::traits::ChatRequest;
use sa_providers::LlmProvider;
use sa_sessions::transcript::{TranscriptLine, TranscriptWriter};

/// Find the index of the start of the most recent compaction marker block.
/// A block is one or more consecutive marker-tagged lines (the summary line,
/// optionally followed by the pinned original-request line) — the whole
/// block is kept as system messages, never split. Returns 0 if no compaction
/// marker exists.
pub fn compaction_boundary(lines: &[TranscriptLine]) -> usize {
    let Some(end) = (0..lines.len()).rev().find(|&i| is_compaction_marker(&lines[i])) else {
        return 0;
    };
    let mut start = end;
    while start > 0 && is_compaction_marker(&lines[start - 1]) {
        start -= 1;
    }
    start
}

/// Count active turns (user messages) since the last compaction.
pub fn active_turn_count(lines: &[TranscriptLine]) -> usize {
    let start = compaction_boundary(lines);
    lines[start..]
        .iter()
        .filter(|l| l.role == "user")
        .count()
}

/// Check if auto-compaction should run.
pub fn should_compact(lines: &[TranscriptLine], config: &CompactionConfig) -> bool {
    if !config.auto {
        return false;
    }
    active_turn_count(lines) > config.max_turns
}

/// Same as [`should_compact`], but takes an already-computed
/// [`compaction_boundary`] to avoid a second reverse scan over `lines`.
pub fn should_compact_with_boundary(
    lines: &[TranscriptLine],
    config: &CompactionConfig,
    boundary: usize,
) -> bool {
    if !config.auto {
        return false;
    }
    let active_turns = lines[boundary..].iter().filter(|l| l.role == "user").count();
    active_turns > config.max_turns
}

/// Whether the session's tracked token usage alone crosses the compaction
/// trigger (§4.5.3: "Check token usage; if ≥ 160,000 tokens, run
/// compaction"), independent of the turn-count heuristic above.
///
/// Two independent thresholds, either one is sufficient:
/// - `compaction_token_threshold`: a raw token count (the literal 160_000
///   from the spec).
/// - `compaction_pct_threshold`: a fraction of the active provider's
///   advertised context window, when known.
pub fn should_compact_for_tokens(
    context_tokens: u64,
    context_window_tokens: Option<u32>,
    config: &TurnConfig,
) -> bool {
    if context_tokens as usize >= config.compaction_token_threshold {
        return true;
    }
    if let Some(window) = context_window_tokens {
        if window > 0 {
            let used_pct = context_tokens as f32 / window as f32;
            if used_pct >= config.compaction_pct_threshold {
                return true;
            }
        }
    }
    false
}

/// Split active lines into (lines_to_compact, lines_to_keep).
///
/// `lines_to_keep` are the last `keep_last_turns` worth of turns (measured
/// by user-message count) plus any trailing tool/assistant messages.
pub fn split_for_compaction(
    lines: &[TranscriptLine],
    keep_last_turns: usize,
) -> (&[TranscriptLine], &[TranscriptLine]) {
    let start = compaction_boundary(lines);
    let active_start = skip_marker_block(lines, start);
    let active = &lines[active_start..];

    // Count user messages backwards to find the keep boundary.
    let mut user_count = 0;
    let mut keep_from = 0; // relative to active
    for (i, line) in active.iter().enumerate().rev() {
        if line.role == "user" {
            user_count += 1;
            if user_count >= keep_last_turns {
                keep_from = i;
                break;
            }
        }
    }

    let to_compact = &active[..keep_from];
    let to_keep = &active[keep_from..];
    (to_compact, to_keep)
}

/// Advance past a contiguous run of marker-tagged lines starting at `from`,
/// so callers never treat a marker block as part of the "active" history.
fn skip_marker_block(lines: &[TranscriptLine], from: usize) -> usize {
    let mut i = from;
    while i < lines.len() && is_compaction_marker(&lines[i]) {
        i += 1;
    }
    i
}

/// Generate a compaction summary using the LLM (non-streaming).
pub async fn generate_summary(
    provider: &dyn LlmProvider,
    lines_to_compact: &[TranscriptLine],
) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
    let conversation = build_conversation_text(lines_to_compact);

    let prompt = format!(
        "You are a conversation summarizer. Summarize the following conversation \
         history into a concise summary that preserves:\n\
         1. The current goal or plan being worked on\n\
         2. Key decisions made\n\
         3. Open questions or threads\n\
         4. Important facts learned about the user or context\n\
         5. Tool state (running processes, active sessions, pending work)\n\n\
         Be concise but preserve all actionable context. Write in present tense.\n\
         Omit greetings and pleasantries. Focus on substance.\n\n\
         CONVERSATION:\n{conversation}"
    );

    let messages = vec![sa_domain::tool::Message::user(&prompt)];

    let req = ChatRequest {
        messages,
        tools: vec![],
        temperature: Some(0.1),
        max_tokens: Some(2000),
        json_mode: false,
        model: None,
    };

    let resp = provider.chat(&req).await?;
    Ok(resp.content)
}

/// Create a transcript line that serves as the compaction marker.
pub fn compaction_line(summary: &str, turns_compacted: usize) -> TranscriptLine {
    let mut line = TranscriptWriter::line("system", summary);
    line.metadata = Some(serde_json::json!({
        "compaction": true,
        "turns_compacted": turns_compacted,
    }));
    line
}

/// Build the pinned original-request block (§4.5.3 step: "freeze the
/// original user request text"), kept verbatim across compaction so the
/// agent never loses sight of what it was originally asked to do.
pub fn pinned_original_request_line(original_request: &str) -> TranscriptLine {
    let mut line = TranscriptWriter::line(
        "system",
        &format!("[ORIGINAL REQUEST — pinned]\n{original_request}"),
    );
    line.metadata = Some(serde_json::json!({
        "compaction": true,
        "pinned_original_request": true,
    }));
    line
}

/// Run the full compaction flow: split → summarize → persist marker block.
///
/// `original_request`, when known, is pinned in a second marker line
/// immediately after the summary so it survives every future compaction
/// pass (S6: summary block, then pinned original request, then kept tail).
pub async fn run_compaction(
    provider: &dyn LlmProvider,
    transcripts: &TranscriptWriter,
    session_id: &str,
    lines: &[TranscriptLine],
    config: &CompactionConfig,
    original_request: Option<&str>,
) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
    let (to_compact, _to_keep) = split_for_compaction(lines, config.keep_last_turns);

    if to_compact.is_empty() {
        return Ok(String::new());
    }

    let turns_compacted = to_compact.iter().filter(|l| l.role == "user").count();
    let summary = generate_summary(provider, to_compact).await?;

    let mut marker = vec![compaction_line(&summary, turns_compacted)];
    if let Some(request) = original_request {
        if !request.is_empty() {
            marker.push(pinned_original_request_line(request));
        }
    }
    transcripts.append(session_id, &marker)?;

    tracing::info!(
        session_id = session_id,
        turns_compacted = turns_compacted,
        summary_len = summary.len(),
        pinned_request = original_request.is_some(),
        "transcript compacted"
    );

    Ok(summary)
}

/// Resolve an LLM provider suitable for compaction (summarizer > executor > any).
pub fn resolve_compaction_provider(
    state: &crate::state::AppState,
) -> Option<std::sync::Arc<dyn LlmProvider>> {
    state
        .llm
        .for_role("summarizer")
        .or_else(|| state.llm.for_role("executor"))
        .or_else(|| state.llm.iter().next().map(|(_, p)| p.clone()))
}

fn is_compaction_marker(line: &TranscriptLine) -> bool {
    line.metadata
        .as_ref()
        .and_then(|m| m.get("compaction"))
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

fn build_conversation_text(lines: &[TranscriptLine]) -> String {
    let mut buf = String::new();
    for line in lines {
        let role_label = match line.role.as_str() {
            "user" => "User",
            "assistant" => "Assistant",
            "tool" => "Tool",
            "system" => "System",
            other => other,
        };
        buf.push_str(role_label);
        buf.push_str(": ");
        // Truncate very long lines (tool results) to keep the summary prompt manageable.
        if line.content.len() > 2000 {
            buf.push_str(&line.content[..1000]);
            buf.push_str(" [...] ");
            buf.push_str(&line.content[line.content.len() - 500..]);
        } else {
            buf.push_str(&line.content);
        }
        buf.push('\n');
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(role: &str, content: &str) -> TranscriptLine {
        TranscriptWriter::line(role, content)
    }

    fn compaction(summary: &str) -> TranscriptLine {
        compaction_line(summary, 5)
    }

    #[test]
    fn no_compaction_marker() {
        let lines = vec![line("user", "hello"), line("assistant", "hi")];
        assert_eq!(compaction_boundary(&lines), 0);
        assert_eq!(active_turn_count(&lines), 1);
    }

    #[test]
    fn compaction_boundary_after_marker() {
        let lines = vec![
            line("user", "old"),
            line("assistant", "old reply"),
            compaction("summary of old conversation"),
            line("user", "new"),
            line("assistant", "new reply"),
        ];
        assert_eq!(compaction_boundary(&lines), 2);
        // Active turns = only "new" (after marker)
        assert_eq!(active_turn_count(&lines), 1);
    }

    #[test]
    fn compaction_boundary_spans_marker_block() {
        let lines = vec![
            line("user", "old"),
            line("assistant", "old reply"),
            compaction("summary of old conversation"),
            pinned_original_request_line("build feature X"),
            line("user", "new"),
            line("assistant", "new reply"),
        ];
        // Boundary is the start of the whole marker block (summary + pinned),
        // not just the last marker line.
        assert_eq!(compaction_boundary(&lines), 2);
        assert_eq!(active_turn_count(&lines), 1);

        let (to_compact, to_keep) = split_for_compaction(&lines, 1);
        assert!(to_compact.is_empty());
        assert_eq!(to_keep.len(), 2);
        assert_eq!(to_keep[0].content, "new");
    }

    #[test]
    fn should_compact_for_tokens_respects_raw_threshold() {
        let config = TurnConfig::default();
        assert!(should_compact_for_tokens(200_000, None, &config));
        assert!(!should_compact_for_tokens(1_000, None, &config));
    }

    #[test]
    fn should_compact_for_tokens_respects_pct_of_context_window() {
        let config = TurnConfig::default();
        // 90% of a 100k window crosses the 85% default threshold even
        // though it's well under the raw 160k token floor.
        assert!(should_compact_for_tokens(90_000, Some(100_000), &config));
        assert!(!should_compact_for_tokens(50_000, Some(100_000), &config));
    }

    #[test]
    fn should_compact_respects_threshold() {
        let config = CompactionConfig {
            auto: true,
            max_turns: 3,
            keep_last_turns: 1,
        };
        let lines: Vec<_> = (0..4)
            .flat_map(|i| {
                vec![
                    line("user", &format!("msg {i}")),
                    line("assistant", &format!("reply {i}")),
                ]
            })
            .collect();
        assert!(should_compact(&lines, &config)); // 4 turns > 3
    }

    #[test]
    fn split_keeps_last_turns() {
        let lines: Vec<_> = (0..5)
            .flat_map(|i| {
                vec![
                    line("user", &format!("msg {i}")),
                    line("assistant", &format!("reply {i}")),
                ]
            })
            .collect();

        let (to_compact, to_keep) = split_for_compaction(&lines, 2);
        // 5 turns total, keep last 2 → compact first 3
        let compact_users: Vec<_> = to_compact
            .iter()
            .filter(|l| l.role == "user")
            .map(|l| l.content.as_str())
            .collect();
        assert_eq!(compact_users, vec!["msg 0", "msg 1", "msg 2"]);

        let keep_users: Vec<_> = to_keep
            .iter()
            .filter(|l| l.role == "user")
            .map(|l| l.content.as_str())
            .collect();
        assert_eq!(keep_users, vec!["msg 3", "msg 4"]);
    }
}
