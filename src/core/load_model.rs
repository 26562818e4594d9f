//! Device selection, weight loading, and tokenizer loading. Kept close to
//! the teacher's hub-download plumbing; generalized to take the model id and
//! revision from `ServerConfig` instead of a hardcoded constant, and to
//! compute the EOS token-id set once at load time instead of per-request.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Error as E;
use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use candle_transformers::models::llama::{Config, Llama as Llama3, LlamaConfig, LlamaEosToks};
use hf_hub::api::sync::{ApiBuilder, ApiRepo};
use hf_hub::{Repo, RepoType};
use serde::{Deserialize, Deserializer};
use tokenizers::Tokenizer;

use crate::config::ServerConfig;

/// Markers commonly used as end-of-turn sentinels across chat-tuned model
/// families. A tokenizer that defines one of these as a real vocabulary
/// entry contributes it to the EOS set (§4.6 step 6: "any `<|…|>` tokens that
/// resolve to a known id").
const KNOWN_EOT_MARKERS: &[&str] = &[
    "<|eot_id|>",
    "<|end_of_text|>",
    "<|im_end|>",
    "<|endoftext|>",
    "<end_of_turn>",
];

/// Immutable, process-wide handle to the loaded model, tokenizer, and device.
/// Passed to every request as `Arc<ModelHandle>`; never mutated after
/// `initialise_model` returns (§9 "Global model state").
pub struct ModelHandle {
    pub model: Arc<Llama3>,
    pub device: Device,
    pub dtype: DType,
    pub config: Config,
    pub tokenizer: Arc<Tokenizer>,
    pub model_id: String,
    pub eos_token_ids: HashSet<u32>,
}

pub fn hub_load_safe_tensors(
    repo: &ApiRepo,
    json_file: &str,
) -> anyhow::Result<Vec<std::path::PathBuf>> {
    let json_file = repo.get(json_file).map_err(candle_core::Error::wrap)?;
    let json_file = std::fs::File::open(json_file)?;
    let json: WeightMaps = serde_json::from_reader(&json_file).map_err(candle_core::Error::wrap)?;

    let pathbufs: Vec<std::path::PathBuf> = json
        .weight_map
        .iter()
        .map(|f| repo.get(f))
        .collect::<Result<_, _>>()
        .map_err(candle_core::Error::wrap)?;

    Ok(pathbufs)
}

fn deserialize_weight_map<'de, D>(deserializer: D) -> Result<HashSet<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let map = serde_json::Value::deserialize(deserializer)?;
    match map {
        serde_json::Value::Object(obj) => Ok(obj
            .values()
            .filter_map(|v| v.as_str().map(ToString::to_string))
            .collect::<HashSet<String>>()),
        _ => Err(serde::de::Error::custom(
            "expected an object for weight_map",
        )),
    }
}

#[derive(Debug, Deserialize)]
struct WeightMaps {
    #[serde(deserialize_with = "deserialize_weight_map")]
    weight_map: HashSet<String>,
}

fn get_tokenizer(repo: &ApiRepo) -> anyhow::Result<Tokenizer> {
    let tokenizer_filename = repo.get("tokenizer.json")?;
    Tokenizer::from_file(tokenizer_filename).map_err(E::msg)
}

fn get_config(repo: &ApiRepo) -> anyhow::Result<Config> {
    let config_filename = repo.get("config.json")?;
    let config: LlamaConfig = serde_json::from_slice(&std::fs::read(config_filename)?)?;
    Ok(config.into_config(false))
}

fn get_device() -> Device {
    let device_cuda = Device::new_cuda(0);
    let device_metal = Device::new_metal(0);
    device_metal.or(device_cuda).unwrap_or(Device::Cpu)
}

fn get_repo(
    token: Option<String>,
    cache_dir: Option<std::path::PathBuf>,
    model_id: &str,
    revision: &str,
) -> anyhow::Result<ApiRepo> {
    let mut builder = ApiBuilder::new().with_token(token);
    if let Some(dir) = cache_dir {
        builder = builder.with_cache_dir(dir);
    }
    let api = builder.build()?;
    Ok(api.repo(Repo::with_revision(
        model_id.to_string(),
        RepoType::Model,
        revision.to_string(),
    )))
}

/// Resolves the base EOS set: the tokenizer's native EOS/`</s>` token, the
/// model config's own EOS id(s), and any recognized `<|...|>` end-of-turn
/// marker that happens to be a real vocabulary entry for this tokenizer.
fn resolve_eos_token_ids(tokenizer: &Tokenizer, config: &Config) -> HashSet<u32> {
    let mut ids = HashSet::new();
    match &config.eos_token_id {
        Some(LlamaEosToks::Single(id)) => {
            ids.insert(*id);
        }
        Some(LlamaEosToks::Multiple(list)) => {
            ids.extend(list.iter().copied());
        }
        None => {}
    }
    if let Some(id) = tokenizer.token_to_id("</s>") {
        ids.insert(id);
    }
    for marker in KNOWN_EOT_MARKERS {
        if let Some(id) = tokenizer.token_to_id(marker) {
            ids.insert(id);
        }
    }
    ids
}

pub fn initialise_model(token: Option<String>, cfg: &ServerConfig) -> anyhow::Result<ModelHandle> {
    let cache_dir = std::env::var_os("SYNAP_FORGE_CACHE_DIR").map(std::path::PathBuf::from);
    let repo = get_repo(token, cache_dir, &cfg.model_id, &cfg.model_revision)?;
    let tokenizer = get_tokenizer(&repo)?;
    let device = get_device();
    let filenames = hub_load_safe_tensors(&repo, "model.safetensors.index.json")?;
    let config = get_config(&repo)?;

    let dtype = DType::F16;
    let model = {
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&filenames, dtype, &device)? };
        Llama3::load(vb, &config)?
    };

    let eos_token_ids = resolve_eos_token_ids(&tokenizer, &config);

    Ok(ModelHandle {
        model: Arc::new(model),
        device,
        dtype,
        config,
        tokenizer: Arc::new(tokenizer),
        model_id: cfg.model_id.clone(),
        eos_token_ids,
    })
}
