use std::time::Duration;

use crate::core::tool_parsers::ToolCallParserKind;
use crate::error::AppError;

/// Process-wide defaults, derived from CLI flags, that seed every request's
/// generation parameters. Per-request fields in the wire types override
/// these; anything left unset falls back to what's here.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub model_id: String,
    pub model_revision: String,
    pub system_prompt: Option<String>,
    pub default_stop: Vec<String>,
    pub tool_call_parser: ToolCallParserKind,
    pub raw_mode: bool,
    pub enable_prefix_caching: bool,
    pub max_queue_depth: usize,
    pub request_timeout: Duration,
    pub cors_allow_origins: Vec<String>,
    pub fix_tool_args: bool,
    pub rate_limit_per_minute: Option<u32>,
    pub generation_slots: usize,
    pub max_retained_cache_tokens: usize,
    pub max_cache_entries: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            model_id: "meta-llama/Llama-3.2-3B-Instruct".to_string(),
            model_revision: "main".to_string(),
            system_prompt: None,
            default_stop: Vec::new(),
            tool_call_parser: ToolCallParserKind::Json,
            raw_mode: false,
            enable_prefix_caching: true,
            max_queue_depth: 64,
            request_timeout: Duration::from_secs(300),
            cors_allow_origins: vec!["*".to_string()],
            fix_tool_args: false,
            rate_limit_per_minute: None,
            generation_slots: 1,
            max_retained_cache_tokens: 131_072,
            max_cache_entries: 32,
        }
    }
}

/// Resolved, validated sampling/generation parameters for a single request,
/// produced by merging `ServerConfig` defaults with the wire request and
/// clamping to legal ranges. §4.6 "Parameter merge and validation".
#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub max_tokens: usize,
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: usize,
    pub min_p: f64,
    pub repetition_penalty: f32,
    pub repetition_context_size: usize,
    pub presence_penalty: f64,
    pub frequency_penalty: f64,
    pub seed: Option<u64>,
    pub stop: Vec<String>,
    pub logprobs: bool,
    pub top_logprobs: usize,
}

pub const MAX_TOP_LOGPROBS: usize = 20;
pub const MAX_STOP_SEQUENCES: usize = 4;

impl GenerationParams {
    /// Merges server defaults with request-supplied overrides, applying the
    /// clamps and rejections spec'd in §4.6. Returns `InvalidRequest` on the
    /// first violation encountered rather than silently clamping, since a
    /// client that asked for an out-of-range value almost certainly has a
    /// bug worth surfacing.
    #[allow(clippy::too_many_arguments)]
    pub fn merge(
        cfg: &ServerConfig,
        max_tokens: Option<usize>,
        temperature: Option<f64>,
        top_p: Option<f64>,
        top_k: Option<usize>,
        min_p: Option<f64>,
        repetition_penalty: Option<f32>,
        presence_penalty: Option<f64>,
        frequency_penalty: Option<f64>,
        seed: Option<u64>,
        stop: Vec<String>,
        logprobs: bool,
        top_logprobs: Option<usize>,
    ) -> Result<Self, AppError> {
        let temperature = temperature.unwrap_or(1.0);
        if !(0.0..=2.0).contains(&temperature) {
            return Err(AppError::InvalidRequest(format!(
                "temperature must be in [0.0, 2.0], got {temperature}"
            )));
        }
        let top_p = top_p.unwrap_or(1.0);
        if top_p <= 0.0 || top_p > 1.0 {
            return Err(AppError::InvalidRequest(format!(
                "top_p must be in (0.0, 1.0], got {top_p}"
            )));
        }
        let min_p = min_p.unwrap_or(0.0);
        if !(0.0..1.0).contains(&min_p) {
            return Err(AppError::InvalidRequest(format!(
                "min_p must be in [0.0, 1.0), got {min_p}"
            )));
        }
        let presence_penalty = presence_penalty.unwrap_or(0.0);
        if !(-2.0..=2.0).contains(&presence_penalty) {
            return Err(AppError::InvalidRequest(
                "presence_penalty must be in [-2.0, 2.0]".to_string(),
            ));
        }
        let frequency_penalty = frequency_penalty.unwrap_or(0.0);
        if !(-2.0..=2.0).contains(&frequency_penalty) {
            return Err(AppError::InvalidRequest(
                "frequency_penalty must be in [-2.0, 2.0]".to_string(),
            ));
        }
        let repetition_penalty = repetition_penalty.unwrap_or(1.1);
        if repetition_penalty <= 0.0 {
            return Err(AppError::InvalidRequest(
                "repetition_penalty must be > 0".to_string(),
            ));
        }
        let top_logprobs = top_logprobs.unwrap_or(0);
        if top_logprobs > MAX_TOP_LOGPROBS {
            return Err(AppError::InvalidRequest(format!(
                "top_logprobs must be <= {MAX_TOP_LOGPROBS}, got {top_logprobs}"
            )));
        }
        if stop.len() > MAX_STOP_SEQUENCES {
            return Err(AppError::InvalidRequest(format!(
                "at most {MAX_STOP_SEQUENCES} stop sequences are supported"
            )));
        }

        let mut merged_stop = cfg.default_stop.clone();
        for s in stop {
            if !merged_stop.contains(&s) {
                merged_stop.push(s);
            }
        }

        Ok(Self {
            max_tokens: max_tokens.unwrap_or(256),
            temperature,
            top_p,
            top_k: top_k.unwrap_or(0),
            min_p,
            repetition_penalty,
            repetition_context_size: 64,
            presence_penalty,
            frequency_penalty,
            seed,
            stop: merged_stop,
            logprobs,
            top_logprobs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_temperature() {
        let cfg = ServerConfig::default();
        let err = GenerationParams::merge(
            &cfg, None, Some(3.0), None, None, None, None, None, None, None, vec![], false, None,
        )
        .unwrap_err();
        assert_eq!(err.kind(), "invalid_request_error");
    }

    #[test]
    fn rejects_min_p_at_exactly_one() {
        let cfg = ServerConfig::default();
        let err = GenerationParams::merge(
            &cfg, None, None, None, None, Some(1.0), None, None, None, None, vec![], false, None,
        )
        .unwrap_err();
        assert_eq!(err.kind(), "invalid_request_error");
    }

    #[test]
    fn rejects_top_p_of_zero() {
        let cfg = ServerConfig::default();
        let err = GenerationParams::merge(
            &cfg, None, None, Some(0.0), None, None, None, None, None, None, vec![], false, None,
        )
        .unwrap_err();
        assert_eq!(err.kind(), "invalid_request_error");
    }

    #[test]
    fn merges_default_and_request_stop_sequences() {
        let mut cfg = ServerConfig::default();
        cfg.default_stop = vec!["\n\n".to_string()];
        let params = GenerationParams::merge(
            &cfg,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            vec!["STOP".to_string()],
            false,
            None,
        )
        .unwrap();
        assert_eq!(params.stop, vec!["\n\n".to_string(), "STOP".to_string()]);
    }

    #[test]
    fn rejects_too_many_top_logprobs() {
        let cfg = ServerConfig::default();
        let err = GenerationParams::merge(
            &cfg,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            vec![],
            true,
            Some(50),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "invalid_request_error");
    }
}
