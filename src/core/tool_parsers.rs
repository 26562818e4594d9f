//! Per-syntax tool-call state machines. Each `ToolCallParserKind` owns an
//! opening/closing sentinel pair that `ContentInterceptor` scans the rolling
//! text buffer for, plus a `parse` function that turns the captured span into
//! a `{name, arguments}` record. Keeping every syntax in one module means a
//! new parser is a new match arm, not a change to the interceptor itself.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[clap(rename_all = "snake_case")]
pub enum ToolCallParserKind {
    /// A bare top-level JSON object: `{"name": "...", "arguments": {...}}`.
    Json,
    /// JSON wrapped in `<tool_call>...</tool_call>` (Hermes / NousResearch style).
    Hermes,
    /// JSON preceded by Llama 3's `<|python_tag|>` marker.
    Llama3Json,
    /// Qwen3's XML-flavored `<tool_call><function=...><parameter=...>`.
    Qwen3Xml,
    /// Mistral's `[TOOL_CALLS]` marker followed by a JSON array.
    Mistral,
    /// Gemma's fenced ```tool_call``` code block.
    Gemma,
}

#[derive(Debug, Clone)]
pub struct ParsedToolCall {
    pub name: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, thiserror::Error)]
pub enum ToolParseError {
    #[error("malformed tool-call payload: {0}")]
    Malformed(String),
    #[error("tool-call payload missing a name")]
    MissingName,
}

impl ToolCallParserKind {
    /// The literal text that begins tool-call capture once seen in the
    /// rolling visible-text buffer.
    pub fn open_sentinel(&self) -> &'static str {
        match self {
            ToolCallParserKind::Json => "{",
            ToolCallParserKind::Hermes => "<tool_call>",
            ToolCallParserKind::Llama3Json => "<|python_tag|>",
            ToolCallParserKind::Qwen3Xml => "<tool_call>",
            ToolCallParserKind::Mistral => "[TOOL_CALLS]",
            ToolCallParserKind::Gemma => "```tool_call",
        }
    }

    /// The literal text that ends capture. `Json` and `Llama3Json` have no
    /// fixed closing sentinel — they close implicitly (balanced braces, or
    /// end of stream); `close_sentinel` returns `None` for those and the
    /// interceptor uses a different termination rule instead.
    pub fn close_sentinel(&self) -> Option<&'static str> {
        match self {
            ToolCallParserKind::Json => None,
            ToolCallParserKind::Hermes => Some("</tool_call>"),
            ToolCallParserKind::Llama3Json => None,
            ToolCallParserKind::Qwen3Xml => Some("</tool_call>"),
            ToolCallParserKind::Mistral => None,
            ToolCallParserKind::Gemma => Some("```"),
        }
    }

    /// Parses a captured span (including sentinels, where the syntax has
    /// fixed ones) into a tool call record.
    pub fn parse(&self, captured: &str) -> Result<ParsedToolCall, ToolParseError> {
        match self {
            ToolCallParserKind::Json => parse_name_arguments_object(captured.trim()),
            ToolCallParserKind::Hermes => {
                let inner = strip_wrap(captured, "<tool_call>", "</tool_call>");
                parse_name_arguments_object(inner.trim())
            }
            ToolCallParserKind::Llama3Json => {
                let inner = captured
                    .trim_start_matches("<|python_tag|>")
                    .trim();
                parse_llama3_json(inner)
            }
            ToolCallParserKind::Qwen3Xml => {
                let inner = strip_wrap(captured, "<tool_call>", "</tool_call>");
                parse_qwen3_xml(inner.trim())
            }
            ToolCallParserKind::Mistral => {
                let inner = captured.trim_start_matches("[TOOL_CALLS]").trim();
                parse_mistral_array(inner)
            }
            ToolCallParserKind::Gemma => {
                let inner = strip_fence(captured);
                parse_name_arguments_object(inner.trim())
            }
        }
    }
}

fn strip_wrap<'a>(s: &'a str, open: &str, close: &str) -> &'a str {
    let s = s.strip_prefix(open).unwrap_or(s);
    s.strip_suffix(close).unwrap_or(s)
}

fn strip_fence(s: &str) -> &str {
    let s = s.trim_start_matches("```tool_call").trim_start_matches('\n');
    s.trim_end_matches("```").trim_end_matches('\n')
}

/// `{"name": "...", "arguments": {...}}`, with an optional repair pass.
fn parse_name_arguments_object(text: &str) -> Result<ParsedToolCall, ToolParseError> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| ToolParseError::Malformed(e.to_string()))?;
    object_to_call(value, "arguments")
}

fn parse_llama3_json(text: &str) -> Result<ParsedToolCall, ToolParseError> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| ToolParseError::Malformed(e.to_string()))?;
    object_to_call(value, "parameters")
}

fn parse_mistral_array(text: &str) -> Result<ParsedToolCall, ToolParseError> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| ToolParseError::Malformed(e.to_string()))?;
    let first = match value {
        serde_json::Value::Array(mut items) if !items.is_empty() => items.remove(0),
        serde_json::Value::Object(_) => value.clone(),
        _ => return Err(ToolParseError::Malformed("expected a JSON array of calls".into())),
    };
    object_to_call(first, "arguments")
}

fn object_to_call(value: serde_json::Value, args_key: &str) -> Result<ParsedToolCall, ToolParseError> {
    let obj = value
        .as_object()
        .ok_or_else(|| ToolParseError::Malformed("expected a JSON object".into()))?;
    let name = obj
        .get("name")
        .and_then(|v| v.as_str())
        .ok_or(ToolParseError::MissingName)?
        .to_string();
    let arguments = obj
        .get(args_key)
        .cloned()
        .unwrap_or_else(|| serde_json::Value::Object(Default::default()));
    Ok(ParsedToolCall { name, arguments })
}

/// Qwen3's `<function=name>\n<parameter=key>\nvalue\n</parameter>\n...</function>`.
fn parse_qwen3_xml(text: &str) -> Result<ParsedToolCall, ToolParseError> {
    let after_fn = text
        .find("<function=")
        .map(|i| &text[i + "<function=".len()..])
        .ok_or_else(|| ToolParseError::Malformed("missing <function=...> tag".into()))?;
    let name_end = after_fn
        .find('>')
        .ok_or_else(|| ToolParseError::Malformed("unterminated <function=...> tag".into()))?;
    let name = after_fn[..name_end].trim().to_string();
    if name.is_empty() {
        return Err(ToolParseError::MissingName);
    }
    let body = &after_fn[name_end + 1..];

    let mut arguments = serde_json::Map::new();
    let mut rest = body;
    while let Some(p_start) = rest.find("<parameter=") {
        let after_p = &rest[p_start + "<parameter=".len()..];
        let Some(key_end) = after_p.find('>') else {
            break;
        };
        let key = after_p[..key_end].trim().to_string();
        let value_region = &after_p[key_end + 1..];
        let Some(close_idx) = value_region.find("</parameter>") else {
            break;
        };
        let value = value_region[..close_idx].trim().to_string();
        arguments.insert(key, serde_json::Value::String(value));
        rest = &value_region[close_idx + "</parameter>".len()..];
    }

    Ok(ParsedToolCall {
        name,
        arguments: serde_json::Value::Object(arguments),
    })
}

/// The opt-in "fix tool args" repair pass (§4.4): quotes bareword object keys
/// and normalizes single quotes to double quotes, for a second parse attempt
/// after the first one fails. Deliberately simple — a best-effort repair,
/// not a JSON5 parser.
pub fn repair_json_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 8);
    let mut chars = s.chars().peekable();
    let mut in_string = false;
    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                out.push('"');
            }
            '"' => {
                in_string = !in_string;
                out.push(c);
            }
            c if !in_string && (c == '{' || c == ',') => {
                out.push(c);
                // Skip whitespace, then check for a bareword key.
                let mut lookahead = String::new();
                while let Some(&next) = chars.peek() {
                    if next.is_whitespace() {
                        lookahead.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(&lookahead);
                let mut word = String::new();
                while let Some(&next) = chars.peek() {
                    if next.is_alphanumeric() || next == '_' {
                        word.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if !word.is_empty() && chars.peek() == Some(&':') {
                    out.push('"');
                    out.push_str(&word);
                    out.push('"');
                } else {
                    out.push_str(&word);
                }
            }
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_parser_extracts_name_and_arguments() {
        let call = ToolCallParserKind::Json
            .parse(r#"{"name": "get_weather", "arguments": {"city": "Paris"}}"#)
            .unwrap();
        assert_eq!(call.name, "get_weather");
        assert_eq!(call.arguments["city"], "Paris");
    }

    #[test]
    fn hermes_parser_strips_wrapper_tags() {
        let call = ToolCallParserKind::Hermes
            .parse(r#"<tool_call>{"name": "lookup", "arguments": {}}</tool_call>"#)
            .unwrap();
        assert_eq!(call.name, "lookup");
    }

    #[test]
    fn qwen3_xml_parser_reads_named_parameters() {
        let payload = "<tool_call>\n<function=get_weather>\n<parameter=city>\nParis\n</parameter>\n</function>\n</tool_call>";
        let call = ToolCallParserKind::Qwen3Xml.parse(payload).unwrap();
        assert_eq!(call.name, "get_weather");
        assert_eq!(call.arguments["city"], "Paris");
    }

    #[test]
    fn mistral_parser_reads_first_array_element() {
        let call = ToolCallParserKind::Mistral
            .parse(r#"[TOOL_CALLS] [{"name": "a", "arguments": {"x": 1}}]"#)
            .unwrap();
        assert_eq!(call.name, "a");
        assert_eq!(call.arguments["x"], 1);
    }

    #[test]
    fn repair_json_like_quotes_barewords_and_single_quotes() {
        let fixed = repair_json_like("{name: 'get_weather', arguments: {city: 'Paris'}}");
        let value: serde_json::Value = serde_json::from_str(&fixed).unwrap();
        assert_eq!(value["name"], "get_weather");
        assert_eq!(value["arguments"]["city"], "Paris");
    }

    #[test]
    fn malformed_json_surfaces_as_parse_error() {
        let err = ToolCallParserKind::Json.parse("{not json at all").unwrap_err();
        assert!(matches!(err, ToolParseError::Malformed(_)));
    }
}
