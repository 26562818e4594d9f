//! ContentInterceptor: scans the text-chunk stream from the detokenizer and
//! splits it into three disjoint lanes — visible content, `<think>` reasoning,
//! and tool calls — plus a terminal stop-truncation signal. §4.4.

use crate::core::tool_parsers::{repair_json_like, ParsedToolCall, ToolCallParserKind};

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Before any visible content has been decided: still trying to confirm
    /// or refute a leading `<think>` tag.
    ScanningThinkOpen,
    /// Inside a `<think>...</think>` span; text goes to the reasoning lane.
    InsideThink,
    /// Normal operation: text goes to the visible lane unless/until a
    /// tool-call open sentinel is confirmed.
    Scanning,
    /// Capturing raw text between a tool-call's open and close sentinel.
    InsideTool,
}

/// One call's worth of newly available output. Any combination of fields may
/// be non-empty/non-None; callers should check all of them.
#[derive(Debug, Default)]
pub struct InterceptorOutput {
    pub visible: String,
    pub reasoning: String,
    pub tool_calls: Vec<ParsedToolCall>,
    pub stopped: bool,
}

impl InterceptorOutput {
    fn merge(&mut self, other: InterceptorOutput) {
        self.visible.push_str(&other.visible);
        self.reasoning.push_str(&other.reasoning);
        self.tool_calls.extend(other.tool_calls);
        self.stopped |= other.stopped;
    }
}

pub struct ContentInterceptor {
    tool_parser: ToolCallParserKind,
    stop_strings: Vec<String>,
    raw_mode: bool,
    fix_tool_args: bool,

    state: State,
    pending: String,
    tool_buffer: String,
    stopped: bool,
}

impl ContentInterceptor {
    pub fn new(
        tool_parser: ToolCallParserKind,
        stop_strings: Vec<String>,
        raw_mode: bool,
        fix_tool_args: bool,
    ) -> Self {
        let state = if raw_mode {
            State::Scanning
        } else {
            State::ScanningThinkOpen
        };
        Self {
            tool_parser,
            stop_strings,
            raw_mode,
            fix_tool_args,
            state,
            pending: String::new(),
            tool_buffer: String::new(),
            stopped: false,
        }
    }

    pub fn has_stopped(&self) -> bool {
        self.stopped
    }

    /// Feeds one more text chunk (as produced by `StreamingDetokenizer`) and
    /// returns whatever output lanes became resolvable as a result.
    pub fn append(&mut self, chunk: &str) -> InterceptorOutput {
        let mut out = InterceptorOutput::default();
        if self.stopped || chunk.is_empty() {
            if !chunk.is_empty() {
                // Already stopped: swallow everything silently.
            }
            return out;
        }
        self.pending.push_str(chunk);
        loop {
            let progressed = self.step(&mut out, false);
            if !progressed || self.stopped {
                break;
            }
        }
        out
    }

    /// Call once generation has ended (EOS, max_tokens, or cancellation) to
    /// flush anything still held back. Partial tags/sentinels that never got
    /// confirmed are emitted as-is, since nothing more is coming that could
    /// have completed them.
    pub fn finish(&mut self) -> InterceptorOutput {
        let mut out = InterceptorOutput::default();
        if self.stopped {
            return out;
        }
        loop {
            let progressed = self.step(&mut out, true);
            if !progressed || self.stopped {
                break;
            }
        }
        if !self.pending.is_empty() {
            match self.state {
                State::InsideThink => out.reasoning.push_str(&self.pending),
                State::InsideTool => {
                    self.tool_buffer.push_str(&self.pending);
                    out.visible.push_str(&self.tool_buffer);
                    self.tool_buffer.clear();
                }
                State::ScanningThinkOpen | State::Scanning => out.visible.push_str(&self.pending),
            }
            self.pending.clear();
        }
        out
    }

    /// Runs one state-machine step. Returns `true` if it consumed input or
    /// otherwise made progress (so the caller should loop again), `false` if
    /// it is blocked waiting for more data (and `flush` is false).
    fn step(&mut self, out: &mut InterceptorOutput, flush: bool) -> bool {
        match self.state {
            State::ScanningThinkOpen => self.step_think_open(flush),
            State::InsideThink => self.step_inside_think(out, flush),
            State::Scanning => self.step_scanning(out, flush),
            State::InsideTool => self.step_inside_tool(out, flush),
        }
    }

    fn step_think_open(&mut self, flush: bool) -> bool {
        let leading_ws = self.pending.len() - self.pending.trim_start().len();
        let trimmed = &self.pending[leading_ws..];
        if trimmed.len() >= THINK_OPEN.len() {
            if let Some(rest) = trimmed.strip_prefix(THINK_OPEN) {
                let rest = rest.to_string();
                self.pending = rest;
                self.state = State::InsideThink;
                return true;
            }
            // Definitely not a `<think>` tag — fall through to normal scanning.
            self.state = State::Scanning;
            return true;
        }
        if !flush && THINK_OPEN.starts_with(trimmed) {
            // Could still become `<think>` with more data.
            return false;
        }
        self.state = State::Scanning;
        true
    }

    fn step_inside_think(&mut self, out: &mut InterceptorOutput, flush: bool) -> bool {
        if let Some(idx) = self.pending.find(THINK_CLOSE) {
            out.reasoning.push_str(&self.pending[..idx]);
            self.pending = self.pending[idx + THINK_CLOSE.len()..].to_string();
            self.state = State::Scanning;
            return true;
        }
        let holdback = if flush {
            0
        } else {
            trailing_partial_match(&self.pending, &[THINK_CLOSE])
        };
        let emit_len = self.pending.len() - holdback;
        if emit_len > 0 {
            out.reasoning.push_str(&self.pending[..emit_len]);
            self.pending = self.pending[emit_len..].to_string();
            return true;
        }
        false
    }

    fn step_scanning(&mut self, out: &mut InterceptorOutput, flush: bool) -> bool {
        let open = self.tool_parser.open_sentinel();
        if let Some(idx) = self.pending.find(open) {
            let visible_part = self.pending[..idx].to_string();
            let (kept, consumed, stop_hit) = self.scan_stop(&visible_part, true);
            out.visible.push_str(&kept);
            debug_assert_eq!(consumed, visible_part.len());
            if stop_hit {
                self.stopped = true;
                out.stopped = true;
                self.pending.clear();
                return true;
            }
            self.tool_buffer.clear();
            self.tool_buffer.push_str(open);
            self.pending = self.pending[idx + open.len()..].to_string();
            self.state = State::InsideTool;
            return true;
        }

        let tool_holdback = if flush {
            0
        } else {
            trailing_partial_match(&self.pending, &[open])
        };
        let candidate_len = self.pending.len() - tool_holdback;
        let candidate = self.pending[..candidate_len].to_string();
        let (kept, consumed, stop_hit) = self.scan_stop(&candidate, flush);
        if !kept.is_empty() {
            out.visible.push_str(&kept);
        }
        if stop_hit {
            self.stopped = true;
            out.stopped = true;
            self.pending.clear();
            return true;
        }
        if consumed == 0 {
            return false;
        }
        self.pending = self.pending[consumed..].to_string();
        true
    }

    fn step_inside_tool(&mut self, out: &mut InterceptorOutput, flush: bool) -> bool {
        if !self.pending.is_empty() {
            self.tool_buffer.push_str(&self.pending);
            self.pending.clear();
        }
        let Some(close) = self.tool_parser.close_sentinel() else {
            // No fixed closing sentinel (json / llama3_json): close on a
            // balanced-brace boundary, or — failing that — at end of stream.
            return self.try_close_unterminated(out, flush);
        };
        if let Some(idx) = self.tool_buffer.find(close) {
            let captured = self.tool_buffer[..idx + close.len()].to_string();
            let remainder = self.tool_buffer[idx + close.len()..].to_string();
            self.tool_buffer.clear();
            self.resolve_tool_call(out, &captured);
            self.pending = remainder;
            self.state = State::Scanning;
            return true;
        }
        if flush {
            out.visible.push_str(&self.tool_buffer);
            self.tool_buffer.clear();
            self.state = State::Scanning;
            return true;
        }
        false
    }

    fn try_close_unterminated(&mut self, out: &mut InterceptorOutput, flush: bool) -> bool {
        if matches!(self.tool_parser, ToolCallParserKind::Json) {
            if let Some(end) = balanced_brace_end(&self.tool_buffer) {
                let captured = self.tool_buffer[..end].to_string();
                let remainder = self.tool_buffer[end..].to_string();
                self.tool_buffer.clear();
                self.resolve_tool_call(out, &captured);
                self.pending = remainder;
                self.state = State::Scanning;
                return true;
            }
        }
        if flush {
            let captured = std::mem::take(&mut self.tool_buffer);
            self.resolve_tool_call(out, &captured);
            self.state = State::Scanning;
            return true;
        }
        false
    }

    fn resolve_tool_call(&mut self, out: &mut InterceptorOutput, captured: &str) {
        match self.tool_parser.parse(captured) {
            Ok(call) => out.tool_calls.push(call),
            Err(first_err) => {
                let recovered = if self.fix_tool_args {
                    let repaired = repair_json_like(captured);
                    self.tool_parser.parse(&repaired).ok()
                } else {
                    None
                };
                match recovered {
                    Some(call) => out.tool_calls.push(call),
                    None => {
                        let _ = first_err;
                        // Policy (a): emit the raw buffered text back to the
                        // visible lane rather than surfacing a parse error.
                        out.visible.push_str(captured);
                    }
                }
            }
        }
    }

    /// Scans `text` for the earliest stop-string occurrence. Returns
    /// `(visible_kept, consumed_len, stop_hit)`: `visible_kept` is the prefix
    /// safe to emit (with the stop string itself, if any, never included);
    /// `consumed_len` is how much of `text` has been fully decided (either
    /// emitted or discarded as the stop string) and should be dropped from
    /// the caller's buffer. When `force` is false, a trailing partial match
    /// of a stop string is held back rather than emitted or consumed.
    fn scan_stop(&self, text: &str, force: bool) -> (String, usize, bool) {
        if self.stop_strings.is_empty() {
            return (text.to_string(), text.len(), false);
        }
        if let Some((start, len)) = find_earliest_stop(text, &self.stop_strings) {
            return (text[..start].to_string(), start + len, true);
        }
        let holdback = if force {
            0
        } else {
            let refs: Vec<&str> = self.stop_strings.iter().map(String::as_str).collect();
            trailing_partial_match(text, &refs)
        };
        let emit_len = text.len() - holdback;
        (text[..emit_len].to_string(), emit_len, false)
    }
}

/// Index and length of the earliest occurrence of any marker in `text`.
fn find_earliest_stop(text: &str, markers: &[String]) -> Option<(usize, usize)> {
    let mut best: Option<(usize, usize)> = None;
    for m in markers {
        if m.is_empty() {
            continue;
        }
        if let Some(idx) = text.find(m.as_str()) {
            match best {
                Some((best_idx, _)) if idx >= best_idx => {}
                _ => best = Some((idx, m.len())),
            }
        }
    }
    best
}

/// Length of the longest suffix of `text` that is a proper (non-full) prefix
/// of some marker — i.e. bytes that must be held back because they might
/// still grow into a full match.
fn trailing_partial_match(text: &str, markers: &[&str]) -> usize {
    let max_len = markers.iter().map(|m| m.len()).max().unwrap_or(0);
    if max_len == 0 {
        return 0;
    }
    let cap = max_len.saturating_sub(1).min(text.len());
    for take in (1..=cap).rev() {
        let start = text.len() - take;
        if !text.is_char_boundary(start) {
            continue;
        }
        let suffix = &text[start..];
        if markers.iter().any(|m| m.len() > suffix.len() && m.starts_with(suffix)) {
            return take;
        }
    }
    0
}

/// Finds the end offset (exclusive) of the first balanced `{...}` span in
/// `text`, respecting JSON string literals so braces inside strings don't
/// confuse the depth count.
fn balanced_brace_end(text: &str) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    let mut started = false;
    for (i, c) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => {
                depth += 1;
                started = true;
            }
            '}' => {
                depth -= 1;
                if started && depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interceptor(stops: &[&str]) -> ContentInterceptor {
        ContentInterceptor::new(
            ToolCallParserKind::Json,
            stops.iter().map(|s| s.to_string()).collect(),
            false,
            false,
        )
    }

    #[test]
    fn plain_text_passes_through_to_visible() {
        let mut it = interceptor(&[]);
        let out = it.append("Hello, world!");
        assert_eq!(out.visible, "Hello, world!");
        assert!(out.reasoning.is_empty());
    }

    #[test]
    fn think_block_is_isolated_from_visible() {
        let mut it = interceptor(&[]);
        let mut out = InterceptorOutput::default();
        out.merge(it.append("<think>secret "));
        out.merge(it.append("plan</think>answer"));
        assert_eq!(out.reasoning, "secret plan");
        assert_eq!(out.visible, "answer");
    }

    #[test]
    fn partial_think_tag_across_chunks_is_held_back() {
        let mut it = interceptor(&[]);
        let out1 = it.append("<thi");
        assert!(out1.visible.is_empty());
        let mut out = InterceptorOutput::default();
        out.merge(out1);
        out.merge(it.append("nk>reasoning</think>visible"));
        assert_eq!(out.reasoning, "reasoning");
        assert_eq!(out.visible, "visible");
    }

    #[test]
    fn text_not_starting_with_think_flows_to_visible() {
        let mut it = interceptor(&[]);
        let out = it.append("no tag here");
        assert_eq!(out.visible, "no tag here");
        assert!(out.reasoning.is_empty());
    }

    #[test]
    fn stop_string_truncates_and_hides_itself() {
        let mut it = interceptor(&["cherry"]);
        let mut out = InterceptorOutput::default();
        out.merge(it.append("apple, banana, "));
        out.merge(it.append("cherry, date"));
        assert_eq!(out.visible, "apple, banana, ");
        assert!(out.stopped);
        assert!(!out.visible.contains("cherry"));
    }

    #[test]
    fn partial_stop_suffix_is_withheld_until_confirmed() {
        let mut it = interceptor(&["STOP"]);
        let out1 = it.append("hello ST");
        assert_eq!(out1.visible, "hello ");
        let out2 = it.append("OP more");
        assert!(out2.stopped);
        assert!(!out2.visible.contains("STOP"));
    }

    #[test]
    fn json_tool_call_is_extracted_and_not_visible() {
        let mut it = interceptor(&[]);
        let mut out = InterceptorOutput::default();
        out.merge(it.append(r#"{"name": "get_weather", "arguments": {"city": "Paris"}}"#));
        out.merge(it.finish());
        assert_eq!(out.tool_calls.len(), 1);
        assert_eq!(out.tool_calls[0].name, "get_weather");
        assert!(out.visible.is_empty());
    }

    #[test]
    fn finish_flushes_unterminated_think_block_as_reasoning() {
        let mut it = interceptor(&[]);
        let mut out = InterceptorOutput::default();
        out.merge(it.append("<think>never closed"));
        out.merge(it.finish());
        assert_eq!(out.reasoning, "never closed");
    }
}
