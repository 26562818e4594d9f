//! axum handlers for the HTTPSurface (§4.7): chat completions, legacy
//! completions, model listing, and health. Streaming responses are built
//! from `openai::sse`; everything else funnels through
//! `core::coordinator::GenerationCoordinator`.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::{Stream, StreamExt};

use crate::config::{GenerationParams, ServerConfig};
use crate::core::coordinator::{ChatMessage, GenerationCoordinator, GenerationRequest};
use crate::core::load_model::ModelHandle;
use crate::core::rate_limiter::RateLimiter;
use crate::error::AppError;
use crate::openai::models::{
    ChatCompletionResponseChoice, ChatCompletionResponseMessage, CompletionChoice,
    CreateChatCompletionRequest, CreateChatCompletionResponse, CreateCompletionRequest,
    CreateCompletionResponse, HealthResponse, ListModelsResponse, ModelObject, PromptTokensDetails,
    ResponseFormat, ToolDefinition, UsageResponse,
};
use crate::openai::sse::{self, ChunkContext};

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<GenerationCoordinator>,
    pub model: Arc<ModelHandle>,
    pub cfg: Arc<ServerConfig>,
    pub rate_limiter: Option<Arc<RateLimiter>>,
}

pub async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

pub async fn list_models(State(state): State<AppState>) -> impl IntoResponse {
    Json(ListModelsResponse {
        object: "list",
        data: vec![ModelObject {
            id: state.cfg.model_id.clone(),
            object: "model",
            created: chrono::Utc::now().timestamp(),
            owned_by: "synap-forge",
        }],
    })
}

fn check_rate_limit(state: &AppState) -> Result<(), AppError> {
    match &state.rate_limiter {
        Some(limiter) => limiter.check(),
        None => Ok(()),
    }
}

fn tool_schema_string(tools: &[ToolDefinition]) -> String {
    let entries: Vec<serde_json::Value> = tools
        .iter()
        .map(|t| {
            serde_json::json!({
                "name": t.function.name,
                "description": t.function.description,
                "parameters": t.function.parameters,
            })
        })
        .collect();
    serde_json::Value::Array(entries).to_string()
}

fn response_format_string(rf: &ResponseFormat) -> String {
    match rf {
        ResponseFormat::Text => "text".to_string(),
        ResponseFormat::JsonObject => "json_object".to_string(),
        ResponseFormat::JsonSchema { json_schema } => format!("json_schema:{json_schema}"),
    }
}

fn chat_messages_from_request(
    messages: Vec<crate::openai::models::ChatCompletionRequestMessage>,
) -> Result<Vec<ChatMessage>, AppError> {
    if messages.is_empty() {
        return Err(AppError::InvalidRequest("messages must not be empty".to_string()));
    }
    messages
        .into_iter()
        .map(|m| {
            crate::core::coordinator::normalize_role(&m.role).map(|role| ChatMessage {
                role: role.to_string(),
                content: m.content,
            })
        })
        .collect()
}

fn response_message(result: &crate::core::coordinator::GenerationResult) -> ChatCompletionResponseMessage {
    let tool_calls = sse::tool_calls_to_wire(result.tool_calls.clone());
    let content = if result.visible.is_empty() && tool_calls.is_some() {
        None
    } else {
        Some(result.visible.clone())
    };
    ChatCompletionResponseMessage {
        role: "assistant",
        content,
        reasoning_content: (!result.reasoning.is_empty()).then(|| result.reasoning.clone()),
        tool_calls,
    }
}

fn usage_response(usage: &crate::core::coordinator::Usage) -> UsageResponse {
    UsageResponse {
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage.prompt_tokens + usage.completion_tokens,
        prompt_tokens_details: Some(PromptTokensDetails {
            cached_tokens: usage.cached_tokens,
        }),
    }
}

type SseBody = Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>;

pub async fn create_chat_completion(
    State(state): State<AppState>,
    Json(req): Json<CreateChatCompletionRequest>,
) -> Result<Response, AppError> {
    check_rate_limit(&state)?;
    if req.model != state.cfg.model_id {
        return Err(AppError::NotFound(req.model));
    }

    let tool_schema = req.tools.as_deref().map(tool_schema_string);
    let response_format = req.response_format.as_ref().map(response_format_string);
    let stop = req.stop.map(|s| s.into_vec()).unwrap_or_default();
    let include_logprobs = req.logprobs.unwrap_or(false);
    let params = GenerationParams::merge(
        &state.cfg,
        req.max_tokens,
        req.temperature,
        req.top_p,
        req.top_k,
        req.min_p,
        req.repetition_penalty,
        req.presence_penalty,
        req.frequency_penalty,
        req.seed,
        stop,
        include_logprobs,
        req.top_logprobs,
    )?;
    let messages = chat_messages_from_request(req.messages)?;
    let stream = req.stream.unwrap_or(false);

    let gen_req = GenerationRequest {
        messages,
        tool_schema,
        response_format,
        params,
        tool_parser: state.cfg.tool_call_parser,
        raw_mode: state.cfg.raw_mode,
        fix_tool_args: state.cfg.fix_tool_args,
    };

    let id = format!("chatcmpl-{}", uuid::Uuid::new_v4());
    let created = chrono::Utc::now().timestamp();
    let model = state.cfg.model_id.clone();

    if stream {
        let cancel = Arc::new(AtomicBool::new(false));
        let rx = Arc::clone(&state.coordinator).generate_stream(gen_req, cancel);
        let ctx = ChunkContext {
            id,
            created,
            model,
            include_logprobs,
            include_usage: true,
        };
        let body: SseBody = Box::pin(
            sse::chat_completion_sse_stream(rx, ctx, Arc::clone(&state.model.tokenizer))
                .chain(futures::stream::once(async { Ok::<Event, Infallible>(sse::done_event()) })),
        );
        Ok(Sse::new(body).into_response())
    } else {
        let cancel = Arc::new(AtomicBool::new(false));
        let result = state.coordinator.generate(gen_req, cancel).await?;
        let logprobs = if result.logprobs.is_empty() {
            None
        } else {
            Some(sse::full_logprobs(&result.logprobs, &state.model.tokenizer))
        };
        let finish_reason = result.finish_reason.as_str();
        let response = CreateChatCompletionResponse {
            id,
            object: "chat.completion",
            created,
            model,
            choices: vec![ChatCompletionResponseChoice {
                index: 0,
                message: response_message(&result),
                logprobs,
                finish_reason,
            }],
            usage: Some(usage_response(&result.usage)),
        };
        Ok(Json(response).into_response())
    }
}

pub async fn create_completion(
    State(state): State<AppState>,
    Json(req): Json<CreateCompletionRequest>,
) -> Result<Response, AppError> {
    check_rate_limit(&state)?;
    if req.model != state.cfg.model_id {
        return Err(AppError::NotFound(req.model));
    }

    let stop = req.stop.map(|s| s.into_vec()).unwrap_or_default();
    let include_logprobs = req.logprobs.unwrap_or(false);
    let params = GenerationParams::merge(
        &state.cfg,
        req.max_tokens,
        req.temperature,
        req.top_p,
        req.top_k,
        req.min_p,
        req.repetition_penalty,
        req.presence_penalty,
        req.frequency_penalty,
        req.seed,
        stop,
        include_logprobs,
        None,
    )?;
    let messages = vec![ChatMessage {
        role: "user".to_string(),
        content: req.prompt,
    }];
    let stream = req.stream.unwrap_or(false);

    let gen_req = GenerationRequest {
        messages,
        tool_schema: None,
        response_format: None,
        params,
        tool_parser: state.cfg.tool_call_parser,
        raw_mode: state.cfg.raw_mode,
        fix_tool_args: state.cfg.fix_tool_args,
    };

    let id = format!("cmpl-{}", uuid::Uuid::new_v4());
    let created = chrono::Utc::now().timestamp();
    let model = state.cfg.model_id.clone();

    if stream {
        let cancel = Arc::new(AtomicBool::new(false));
        let rx = Arc::clone(&state.coordinator).generate_stream(gen_req, cancel);
        let ctx = ChunkContext {
            id,
            created,
            model,
            include_logprobs,
            include_usage: true,
        };
        let body: SseBody = Box::pin(
            sse::completion_sse_stream(rx, ctx, Arc::clone(&state.model.tokenizer))
                .chain(futures::stream::once(async { Ok::<Event, Infallible>(sse::done_event()) })),
        );
        Ok(Sse::new(body).into_response())
    } else {
        let cancel = Arc::new(AtomicBool::new(false));
        let result = state.coordinator.generate(gen_req, cancel).await?;
        let logprobs = if result.logprobs.is_empty() {
            None
        } else {
            Some(sse::full_logprobs(&result.logprobs, &state.model.tokenizer))
        };
        let response = CreateCompletionResponse {
            id,
            object: "text_completion",
            created,
            model,
            choices: vec![CompletionChoice {
                text: result.visible,
                index: 0,
                logprobs,
                finish_reason: result.finish_reason.as_str(),
            }],
            usage: Some(usage_response(&result.usage)),
        };
        Ok(Json(response).into_response())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openai::models::FunctionDefinition;

    #[test]
    fn tool_schema_string_embeds_name_and_parameters() {
        let tools = vec![ToolDefinition {
            kind: "function".to_string(),
            function: FunctionDefinition {
                name: "get_weather".to_string(),
                description: Some("look up the weather".to_string()),
                parameters: serde_json::json!({"type": "object"}),
            },
        }];
        let s = tool_schema_string(&tools);
        assert!(s.contains("get_weather"));
        assert!(s.contains("look up the weather"));
    }

    #[test]
    fn rejects_empty_message_list() {
        let err = chat_messages_from_request(vec![]).unwrap_err();
        assert_eq!(err.kind(), "invalid_request_error");
    }

    #[test]
    fn response_format_string_tags_each_variant() {
        assert_eq!(response_format_string(&ResponseFormat::Text), "text");
        assert_eq!(response_format_string(&ResponseFormat::JsonObject), "json_object");
    }
}
