//! Assembles `GenerationCoordinator::StreamEvent`s into OpenAI-shaped SSE
//! frames (§4.7, §6): `data: <json>\n\n` per chunk, terminated by
//! `data: [DONE]\n\n`.

use std::convert::Infallible;

use axum::response::sse::Event;
use futures::Stream;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::core::coordinator::StreamEvent;
use crate::openai::models::{
    ChatCompletionChunkChoice, ChatCompletionChunkDelta, ChoiceLogprobs, CompletionChunkChoice,
    CreateChatCompletionChunk, CreateCompletionChunk, PromptTokensDetails, TokenLogprob,
    ToolCallFunction, ToolCallResponse, UsageResponse,
};

/// Parameters shared by every chunk of one response, so the per-event
/// assembly function doesn't need to thread them through by hand.
pub struct ChunkContext {
    pub id: String,
    pub created: i64,
    pub model: String,
    pub include_logprobs: bool,
    pub include_usage: bool,
}

fn token_logprob_entry(
    record: &crate::core::sampling::LogprobRecord,
    tokenizer: &tokenizers::Tokenizer,
) -> TokenLogprob {
    let token = tokenizer
        .decode(&[record.token_id], false)
        .unwrap_or_default();
    let top_logprobs = record
        .top
        .iter()
        .map(|t| crate::openai::models::TopLogprobEntry {
            token: tokenizer.decode(&[t.token_id], false).unwrap_or_default(),
            logprob: t.logprob,
            bytes: None,
        })
        .collect();
    TokenLogprob {
        token,
        logprob: record.logprob,
        bytes: None,
        top_logprobs,
    }
}

pub(crate) fn logprob_chunk(record: &crate::core::sampling::LogprobRecord, tokenizer: &tokenizers::Tokenizer) -> ChoiceLogprobs {
    ChoiceLogprobs {
        content: vec![token_logprob_entry(record, tokenizer)],
    }
}

/// Folds a full per-token logprob trace into one `ChoiceLogprobs` for a
/// non-streaming response, where the streaming path instead emits one
/// `logprob_chunk` per `StreamEvent::Delta`.
pub(crate) fn full_logprobs(
    records: &[crate::core::sampling::LogprobRecord],
    tokenizer: &tokenizers::Tokenizer,
) -> ChoiceLogprobs {
    ChoiceLogprobs {
        content: records.iter().map(|r| token_logprob_entry(r, tokenizer)).collect(),
    }
}

pub(crate) fn tool_calls_to_wire(calls: Vec<crate::core::tool_parsers::ParsedToolCall>) -> Option<Vec<ToolCallResponse>> {
    if calls.is_empty() {
        return None;
    }
    Some(
        calls
            .into_iter()
            .map(|c| ToolCallResponse {
                id: format!("call_{}", uuid::Uuid::new_v4()),
                kind: "function",
                function: ToolCallFunction {
                    name: c.name,
                    arguments: serde_json::to_string(&c.arguments).unwrap_or_else(|_| "{}".to_string()),
                },
            })
            .collect(),
    )
}

/// Turns the coordinator's stream-event channel into a byte-level SSE
/// stream axum can serve directly via `Sse::new(...)`.
pub fn chat_completion_sse_stream(
    rx: tokio::sync::mpsc::Receiver<StreamEvent>,
    ctx: ChunkContext,
    tokenizer: std::sync::Arc<tokenizers::Tokenizer>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let mut first = true;
    ReceiverStream::new(rx).map(move |event| {
        let chunk = match event {
            StreamEvent::Delta {
                content,
                reasoning_content,
                tool_calls,
                logprob,
            } => {
                let role = if first {
                    first = false;
                    Some("assistant")
                } else {
                    None
                };
                CreateChatCompletionChunk {
                    id: ctx.id.clone(),
                    object: "chat.completion.chunk",
                    created: ctx.created,
                    model: ctx.model.clone(),
                    choices: vec![ChatCompletionChunkChoice {
                        index: 0,
                        delta: ChatCompletionChunkDelta {
                            role,
                            content,
                            reasoning_content,
                            tool_calls: tool_calls_to_wire(tool_calls),
                        },
                        logprobs: if ctx.include_logprobs {
                            logprob.map(|r| logprob_chunk(&r, &tokenizer))
                        } else {
                            None
                        },
                        finish_reason: None,
                    }],
                    usage: None,
                }
            }
            StreamEvent::Done { finish_reason, usage } => CreateChatCompletionChunk {
                id: ctx.id.clone(),
                object: "chat.completion.chunk",
                created: ctx.created,
                model: ctx.model.clone(),
                choices: vec![ChatCompletionChunkChoice {
                    index: 0,
                    delta: ChatCompletionChunkDelta::default(),
                    logprobs: None,
                    finish_reason: Some(finish_reason.as_str()),
                }],
                usage: if ctx.include_usage {
                    Some(UsageResponse {
                        prompt_tokens: usage.prompt_tokens,
                        completion_tokens: usage.completion_tokens,
                        total_tokens: usage.prompt_tokens + usage.completion_tokens,
                        prompt_tokens_details: Some(PromptTokensDetails {
                            cached_tokens: usage.cached_tokens,
                        }),
                    })
                } else {
                    None
                },
            },
            StreamEvent::Error(err) => {
                tracing::warn!(error = %err, "streaming generation ended with an error");
                CreateChatCompletionChunk {
                    id: ctx.id.clone(),
                    object: "chat.completion.chunk",
                    created: ctx.created,
                    model: ctx.model.clone(),
                    choices: vec![ChatCompletionChunkChoice {
                        index: 0,
                        delta: ChatCompletionChunkDelta::default(),
                        logprobs: None,
                        finish_reason: Some("error"),
                    }],
                    usage: None,
                }
            }
        };
        let body = serde_json::to_string(&chunk).unwrap_or_else(|_| "{}".to_string());
        Ok(Event::default().data(body))
    })
}

/// Same shape as `chat_completion_sse_stream` but for the legacy
/// `/v1/completions` surface, which reuses the `text_completion` object tag
/// for every chunk rather than switching to a `.chunk`-suffixed one.
pub fn completion_sse_stream(
    rx: tokio::sync::mpsc::Receiver<StreamEvent>,
    ctx: ChunkContext,
    tokenizer: std::sync::Arc<tokenizers::Tokenizer>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    ReceiverStream::new(rx).map(move |event| {
        let chunk = match event {
            StreamEvent::Delta {
                content,
                reasoning_content: _,
                tool_calls: _,
                logprob,
            } => CreateCompletionChunk {
                id: ctx.id.clone(),
                object: "text_completion",
                created: ctx.created,
                model: ctx.model.clone(),
                choices: vec![CompletionChunkChoice {
                    text: content.unwrap_or_default(),
                    index: 0,
                    logprobs: if ctx.include_logprobs {
                        logprob.map(|r| logprob_chunk(&r, &tokenizer))
                    } else {
                        None
                    },
                    finish_reason: None,
                }],
                usage: None,
            },
            StreamEvent::Done { finish_reason, usage } => CreateCompletionChunk {
                id: ctx.id.clone(),
                object: "text_completion",
                created: ctx.created,
                model: ctx.model.clone(),
                choices: vec![CompletionChunkChoice {
                    text: String::new(),
                    index: 0,
                    logprobs: None,
                    finish_reason: Some(finish_reason.as_str()),
                }],
                usage: if ctx.include_usage {
                    Some(UsageResponse {
                        prompt_tokens: usage.prompt_tokens,
                        completion_tokens: usage.completion_tokens,
                        total_tokens: usage.prompt_tokens + usage.completion_tokens,
                        prompt_tokens_details: Some(PromptTokensDetails {
                            cached_tokens: usage.cached_tokens,
                        }),
                    })
                } else {
                    None
                },
            },
            StreamEvent::Error(err) => {
                tracing::warn!(error = %err, "streaming generation ended with an error");
                CreateCompletionChunk {
                    id: ctx.id.clone(),
                    object: "text_completion",
                    created: ctx.created,
                    model: ctx.model.clone(),
                    choices: vec![CompletionChunkChoice {
                        text: String::new(),
                        index: 0,
                        logprobs: None,
                        finish_reason: Some("error"),
                    }],
                    usage: None,
                }
            }
        };
        let body = serde_json::to_string(&chunk).unwrap_or_else(|_| "{}".to_string());
        Ok(Event::default().data(body))
    })
}

/// The literal terminal SSE frame OpenAI's streaming protocol expects.
pub fn done_event() -> Event {
    Event::default().data("[DONE]")
}
