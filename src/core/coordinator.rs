//! GenerationCoordinator: glues LogitPipeline/TokenIterator/StreamingDetokenizer/
//! ContentInterceptor/CacheManager into the per-request pipeline described in
//! §4.6. Owns neither the model nor the cache table; both are handed in as
//! shared, process-wide state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use candle_transformers::models::llama::Cache;
use tokio::sync::mpsc;

use crate::config::{GenerationParams, ServerConfig};
use crate::core::cache_manager::{fingerprint, CacheManager, FingerprintInput, PrefixSnapshot};
use crate::core::detokenizer::StreamingDetokenizer;
use crate::core::interceptor::ContentInterceptor;
use crate::core::load_model::ModelHandle;
use crate::core::sampling::LogprobRecord;
use crate::core::token_iterator::TokenIterator;
use crate::core::tool_parsers::{ParsedToolCall, ToolCallParserKind};
use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Normalizes `developer` to `system` (§4.7) and rejects any other unknown
/// role up front.
pub fn normalize_role(role: &str) -> Result<&'static str, AppError> {
    match role {
        "system" | "developer" => Ok("system"),
        "user" => Ok("user"),
        "assistant" => Ok("assistant"),
        "tool" => Ok("tool"),
        other => Err(AppError::InvalidRequest(format!("unknown message role '{other}'"))),
    }
}

pub struct GenerationRequest {
    pub messages: Vec<ChatMessage>,
    pub tool_schema: Option<String>,
    pub response_format: Option<String>,
    pub params: GenerationParams,
    pub tool_parser: ToolCallParserKind,
    pub raw_mode: bool,
    pub fix_tool_args: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ToolCalls => "tool_calls",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub cached_tokens: usize,
    pub prompt_time_s: f64,
    pub generate_time_s: f64,
}

pub struct GenerationResult {
    pub visible: String,
    pub reasoning: String,
    pub tool_calls: Vec<ParsedToolCall>,
    pub finish_reason: FinishReason,
    pub usage: Usage,
    pub logprobs: Vec<LogprobRecord>,
}

/// One unit of streamed output, already split into the delta lanes §4.7's
/// `chat.completion.chunk` wants; `openai::sse` turns these into wire events.
pub enum StreamEvent {
    Delta {
        content: Option<String>,
        reasoning_content: Option<String>,
        tool_calls: Vec<ParsedToolCall>,
        logprob: Option<LogprobRecord>,
    },
    Done {
        finish_reason: FinishReason,
        usage: Usage,
    },
    Error(AppError),
}

pub struct GenerationCoordinator {
    model: Arc<ModelHandle>,
    cache_manager: Arc<CacheManager>,
    cfg: ServerConfig,
}

impl GenerationCoordinator {
    pub fn new(model: Arc<ModelHandle>, cache_manager: Arc<CacheManager>, cfg: ServerConfig) -> Self {
        Self {
            model,
            cache_manager,
            cfg,
        }
    }

    /// Llama 3's instruct chat template, the minimal subset this server
    /// needs: a `<|begin_of_text|>` preamble followed by one
    /// `<|start_header_id|>role<|end_header_id|>\n\ncontent<|eot_id|>` block
    /// per message, plus a trailing assistant header to prompt generation.
    fn render_prompt(&self, req: &GenerationRequest) -> Result<String, AppError> {
        let mut prompt = String::from("<|begin_of_text|>");
        let mut wrote_system = false;
        for msg in &req.messages {
            let role = normalize_role(&msg.role)?;
            if role == "system" {
                wrote_system = true;
            }
            prompt.push_str("<|start_header_id|>");
            prompt.push_str(role);
            prompt.push_str("<|end_header_id|>\n\n");
            prompt.push_str(&msg.content);
            if let Some(schema) = &req.tool_schema {
                if role == "system" {
                    prompt.push_str("\n\nAvailable tools:\n");
                    prompt.push_str(schema);
                }
            }
            prompt.push_str("<|eot_id|>");
        }
        if !wrote_system {
            if let Some(sys) = &self.cfg.system_prompt {
                let mut preamble = String::from("<|begin_of_text|><|start_header_id|>system<|end_header_id|>\n\n");
                preamble.push_str(sys);
                preamble.push_str("<|eot_id|>");
                prompt = preamble + &prompt["<|begin_of_text|>".len()..];
            }
        }
        prompt.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
        Ok(prompt)
    }

    fn fingerprint_of(&self, req: &GenerationRequest) -> blake3::Hash {
        let pairs: Vec<(String, String)> = req
            .messages
            .iter()
            .map(|m| (m.role.clone(), m.content.clone()))
            .collect();
        fingerprint(&FingerprintInput {
            model_id: &self.model.model_id,
            system_prompt: self.cfg.system_prompt.as_deref(),
            messages: &pairs,
            tool_schema: req.tool_schema.as_deref(),
            response_format: req.response_format.as_deref(),
        })
    }

    /// Tokenizes the prompt, consults the prefix-cache table, and returns the
    /// token sequence together with the offset/cache to resume from (if any).
    fn resolve_prefix(
        &self,
        fp: &blake3::Hash,
        prompt: &str,
    ) -> Result<(Vec<u32>, usize, Option<Cache>, usize), AppError> {
        let encoding = self
            .model
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| AppError::ModelError(e.to_string()))?;
        let prompt_tokens = encoding.get_ids().to_vec();

        if !self.cfg.enable_prefix_caching {
            return Ok((prompt_tokens, 0, None, 0));
        }
        match self.cache_manager.lookup(fp) {
            Some(snapshot) => {
                let reused = snapshot.token_count.min(prompt_tokens.len());
                Ok((prompt_tokens, reused, Some(snapshot.cache.clone()), reused))
            }
            None => Ok((prompt_tokens, 0, None, 0)),
        }
    }

    fn store_snapshot(&self, fp: blake3::Hash, iter: &TokenIterator) {
        if !self.cfg.enable_prefix_caching {
            return;
        }
        let (cache, token_count) = iter.snapshot_cache();
        self.cache_manager
            .insert(fp, Arc::new(PrefixSnapshot { cache, token_count }));
    }

    /// Runs one request to completion without streaming, returning the fully
    /// assembled result.
    pub async fn generate(
        &self,
        req: GenerationRequest,
        cancel: Arc<AtomicBool>,
    ) -> Result<GenerationResult, AppError> {
        let fp = self.fingerprint_of(&req);
        let prompt = self.render_prompt(&req)?;
        let (prompt_tokens, prefix_offset, prefix_cache, cached_tokens) =
            self.resolve_prefix(&fp, &prompt)?;

        let _permit = self.cache_manager.acquire_slot().await?;

        let model = Arc::clone(&self.model);
        let params = req.params.clone();
        let tool_parser = req.tool_parser;
        let raw_mode = req.raw_mode;
        let fix_tool_args = req.fix_tool_args;

        let outcome = tokio::task::spawn_blocking(move || -> Result<_, AppError> {
            run_generation(
                &model,
                &prompt_tokens,
                prefix_offset,
                prefix_cache,
                &params,
                tool_parser,
                raw_mode,
                fix_tool_args,
                cancel,
            )
        })
        .await
        .map_err(|e| AppError::Internal(format!("generation task panicked: {e}")))??;

        self.store_snapshot(fp, &outcome.iterator);

        Ok(GenerationResult {
            visible: outcome.visible,
            reasoning: outcome.reasoning,
            tool_calls: outcome.tool_calls,
            finish_reason: outcome.finish_reason,
            usage: Usage {
                prompt_tokens: outcome.prompt_token_count,
                completion_tokens: outcome.completion_tokens,
                cached_tokens,
                prompt_time_s: outcome.prompt_time_s,
                generate_time_s: outcome.generate_time_s,
            },
            logprobs: outcome.logprobs,
        })
    }

    /// Runs one request, emitting `StreamEvent`s over the returned channel as
    /// they become available. The generation itself still runs on a blocking
    /// task; events are forwarded as soon as each chunk is produced.
    pub fn generate_stream(
        self: Arc<Self>,
        req: GenerationRequest,
        cancel: Arc<AtomicBool>,
    ) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            if let Err(err) = self.drive_stream(req, cancel, &tx).await {
                let _ = tx.send(StreamEvent::Error(err)).await;
            }
        });
        rx
    }

    async fn drive_stream(
        &self,
        req: GenerationRequest,
        cancel: Arc<AtomicBool>,
        tx: &mpsc::Sender<StreamEvent>,
    ) -> Result<(), AppError> {
        let fp = self.fingerprint_of(&req);
        let prompt = self.render_prompt(&req)?;
        let (prompt_tokens, prefix_offset, prefix_cache, cached_tokens) =
            self.resolve_prefix(&fp, &prompt)?;

        let _permit = self.cache_manager.acquire_slot().await?;

        let model = Arc::clone(&self.model);
        let params = req.params.clone();
        let tool_parser = req.tool_parser;
        let raw_mode = req.raw_mode;
        let fix_tool_args = req.fix_tool_args;
        let prompt_token_count = prompt_tokens.len();
        let cancel_outer = Arc::clone(&cancel);

        let (chunk_tx, mut chunk_rx) = std::sync::mpsc::channel::<ChunkEvent>();

        let join = tokio::task::spawn_blocking(move || -> Result<_, AppError> {
            run_generation_streamed(
                &model,
                &prompt_tokens,
                prefix_offset,
                prefix_cache,
                &params,
                tool_parser,
                raw_mode,
                fix_tool_args,
                cancel,
                chunk_tx,
            )
        });

        while let Ok(event) = chunk_rx.recv() {
            match event {
                ChunkEvent::Delta {
                    content,
                    reasoning_content,
                    tool_calls,
                    logprob,
                } => {
                    if tx
                        .send(StreamEvent::Delta {
                            content,
                            reasoning_content,
                            tool_calls,
                            logprob,
                        })
                        .await
                        .is_err()
                    {
                        // Receiver dropped (client disconnected): flip the
                        // shared cancel flag so the step loop observes it on
                        // its next iteration instead of running to completion.
                        cancel_outer.store(true, Ordering::Relaxed);
                        break;
                    }
                }
            }
        }

        let outcome = join
            .await
            .map_err(|e| AppError::Internal(format!("generation task panicked: {e}")))??;

        self.store_snapshot(fp, &outcome.iterator);

        let usage = Usage {
            prompt_tokens: prompt_token_count,
            completion_tokens: outcome.completion_tokens,
            cached_tokens,
            prompt_time_s: outcome.prompt_time_s,
            generate_time_s: outcome.generate_time_s,
        };
        let _ = tx
            .send(StreamEvent::Done {
                finish_reason: outcome.finish_reason,
                usage,
            })
            .await;
        Ok(())
    }
}

struct RunOutcome {
    visible: String,
    reasoning: String,
    tool_calls: Vec<ParsedToolCall>,
    finish_reason: FinishReason,
    completion_tokens: usize,
    prompt_token_count: usize,
    prompt_time_s: f64,
    generate_time_s: f64,
    logprobs: Vec<LogprobRecord>,
    iterator: TokenIterator,
}

enum ChunkEvent {
    Delta {
        content: Option<String>,
        reasoning_content: Option<String>,
        tool_calls: Vec<ParsedToolCall>,
        logprob: Option<LogprobRecord>,
    },
}

#[allow(clippy::too_many_arguments)]
fn run_generation(
    model: &ModelHandle,
    prompt_tokens: &[u32],
    prefix_offset: usize,
    prefix_cache: Option<Cache>,
    params: &GenerationParams,
    tool_parser: ToolCallParserKind,
    raw_mode: bool,
    fix_tool_args: bool,
    cancel: Arc<AtomicBool>,
) -> Result<RunOutcome, AppError> {
    let mut iterator = TokenIterator::start(model, prompt_tokens, params, prefix_offset, prefix_cache)?;
    iterator.set_cancel_flag(Arc::clone(&cancel));

    let mut detok = StreamingDetokenizer::new(Arc::clone(&model.tokenizer));
    let mut interceptor = ContentInterceptor::new(tool_parser, params.stop.clone(), raw_mode, fix_tool_args);

    let mut visible = String::new();
    let mut reasoning = String::new();
    let mut tool_calls = Vec::new();
    let mut logprobs = Vec::new();
    let mut completion_tokens = 0usize;
    let mut finish_reason = FinishReason::Length;
    let mut stopped_by_interceptor = false;
    let generate_start = Instant::now();

    while let Some(token) = iterator.next()? {
        if model.eos_token_ids.contains(&token) {
            finish_reason = FinishReason::Stop;
            break;
        }
        let record = iterator.last_logprob().cloned();
        detok.append(token);
        let mut token_stopped = false;
        while let Some(chunk) = detok.next().map_err(|e| AppError::ModelError(e.to_string()))? {
            let out = interceptor.append(&chunk);
            visible.push_str(&out.visible);
            reasoning.push_str(&out.reasoning);
            tool_calls.extend(out.tool_calls);
            if out.stopped {
                token_stopped = true;
                break;
            }
        }
        if token_stopped {
            stopped_by_interceptor = true;
            finish_reason = FinishReason::Stop;
            break;
        }
        // §4.6 step 9: `completion_tokens` excludes tokens discarded by a
        // stop-string hit, so only count/record a token once its text has
        // cleared the interceptor without triggering truncation.
        completion_tokens += 1;
        if let Some(record) = record {
            logprobs.push(record);
        }
    }

    if !stopped_by_interceptor && !interceptor.has_stopped() {
        if let Some(rest) = detok.decode_rest().map_err(|e| AppError::ModelError(e.to_string()))? {
            let out = interceptor.append(&rest);
            visible.push_str(&out.visible);
            reasoning.push_str(&out.reasoning);
            tool_calls.extend(out.tool_calls);
            if out.stopped {
                finish_reason = FinishReason::Stop;
            }
        }
        let out = interceptor.finish();
        visible.push_str(&out.visible);
        reasoning.push_str(&out.reasoning);
        tool_calls.extend(out.tool_calls);
        if out.stopped {
            finish_reason = FinishReason::Stop;
        }
    }

    if !tool_calls.is_empty() {
        finish_reason = FinishReason::ToolCalls;
    }

    Ok(RunOutcome {
        visible,
        reasoning,
        tool_calls,
        finish_reason,
        completion_tokens,
        prompt_token_count: prompt_tokens.len(),
        prompt_time_s: iterator.prompt_prefill_time().as_secs_f64(),
        generate_time_s: generate_start.elapsed().as_secs_f64(),
        logprobs,
        iterator,
    })
}

#[allow(clippy::too_many_arguments)]
fn run_generation_streamed(
    model: &ModelHandle,
    prompt_tokens: &[u32],
    prefix_offset: usize,
    prefix_cache: Option<Cache>,
    params: &GenerationParams,
    tool_parser: ToolCallParserKind,
    raw_mode: bool,
    fix_tool_args: bool,
    cancel: Arc<AtomicBool>,
    chunk_tx: std::sync::mpsc::Sender<ChunkEvent>,
) -> Result<RunOutcome, AppError> {
    let mut iterator = TokenIterator::start(model, prompt_tokens, params, prefix_offset, prefix_cache)?;
    iterator.set_cancel_flag(Arc::clone(&cancel));

    let mut detok = StreamingDetokenizer::new(Arc::clone(&model.tokenizer));
    let mut interceptor = ContentInterceptor::new(tool_parser, params.stop.clone(), raw_mode, fix_tool_args);

    let mut visible = String::new();
    let mut reasoning = String::new();
    let mut tool_calls = Vec::new();
    let mut logprobs = Vec::new();
    let mut completion_tokens = 0usize;
    let mut finish_reason = FinishReason::Length;
    let mut stopped_by_interceptor = false;
    let generate_start = Instant::now();

    'outer: while let Some(token) = iterator.next()? {
        if cancel.load(Ordering::Relaxed) {
            break;
        }
        if model.eos_token_ids.contains(&token) {
            finish_reason = FinishReason::Stop;
            break;
        }
        let logprob = iterator.last_logprob().cloned();
        detok.append(token);
        let mut token_stopped = false;
        while let Some(chunk) = detok.next().map_err(|e| AppError::ModelError(e.to_string()))? {
            let out = interceptor.append(&chunk);
            visible.push_str(&out.visible);
            reasoning.push_str(&out.reasoning);
            tool_calls.extend(out.tool_calls.iter().cloned());
            if !out.visible.is_empty() || !out.reasoning.is_empty() || !out.tool_calls.is_empty() {
                let sent = chunk_tx.send(ChunkEvent::Delta {
                    content: (!out.visible.is_empty()).then(|| out.visible.clone()),
                    reasoning_content: (!out.reasoning.is_empty()).then(|| out.reasoning.clone()),
                    tool_calls: out.tool_calls,
                    logprob: logprob.clone(),
                });
                if sent.is_err() {
                    break 'outer;
                }
            }
            if out.stopped {
                token_stopped = true;
                break;
            }
        }
        if token_stopped {
            stopped_by_interceptor = true;
            finish_reason = FinishReason::Stop;
            break;
        }
        // §4.6 step 9: exclude the stop-truncated token from the reported count.
        completion_tokens += 1;
        if let Some(r) = logprob {
            logprobs.push(r);
        }
    }

    if !stopped_by_interceptor && !interceptor.has_stopped() {
        if let Some(rest) = detok.decode_rest().map_err(|e| AppError::ModelError(e.to_string()))? {
            let out = interceptor.append(&rest);
            flush_tail(&chunk_tx, &out, &mut visible, &mut reasoning, &mut tool_calls);
            if out.stopped {
                finish_reason = FinishReason::Stop;
            }
        }
        let out = interceptor.finish();
        flush_tail(&chunk_tx, &out, &mut visible, &mut reasoning, &mut tool_calls);
        if out.stopped {
            finish_reason = FinishReason::Stop;
        }
    }

    if !tool_calls.is_empty() {
        finish_reason = FinishReason::ToolCalls;
    }

    Ok(RunOutcome {
        visible,
        reasoning,
        tool_calls,
        finish_reason,
        completion_tokens,
        prompt_token_count: prompt_tokens.len(),
        prompt_time_s: iterator.prompt_prefill_time().as_secs_f64(),
        generate_time_s: generate_start.elapsed().as_secs_f64(),
        logprobs,
        iterator,
    })
}

fn flush_tail(
    chunk_tx: &std::sync::mpsc::Sender<ChunkEvent>,
    out: &crate::core::interceptor::InterceptorOutput,
    visible: &mut String,
    reasoning: &mut String,
    tool_calls: &mut Vec<ParsedToolCall>,
) {
    visible.push_str(&out.visible);
    reasoning.push_str(&out.reasoning);
    tool_calls.extend(out.tool_calls.iter().cloned());
    if !out.visible.is_empty() || !out.reasoning.is_empty() || !out.tool_calls.is_empty() {
        let _ = chunk_tx.send(ChunkEvent::Delta {
            content: (!out.visible.is_empty()).then(|| out.visible.clone()),
            reasoning_content: (!out.reasoning.is_empty()).then(|| out.reasoning.clone()),
            tool_calls: out.tool_calls.clone(),
            logprob: None,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_role_maps_developer_to_system() {
        assert_eq!(normalize_role("developer").unwrap(), "system");
        assert_eq!(normalize_role("system").unwrap(), "system");
    }

    #[test]
    fn normalize_role_rejects_unknown_roles() {
        let err = normalize_role("narrator").unwrap_err();
        assert_eq!(err.kind(), "invalid_request_error");
    }

    #[test]
    fn finish_reason_strings_match_the_taxonomy() {
        assert_eq!(FinishReason::Stop.as_str(), "stop");
        assert_eq!(FinishReason::Length.as_str(), "length");
        assert_eq!(FinishReason::ToolCalls.as_str(), "tool_calls");
    }
}
