//! JSON payloads exchanged across the entry-point contract

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Parameters handed to `kiln_backend_init`.
///
/// The descriptor fields (`size_class`, `file_type`, `num_layers`) are passed
/// through exactly as the model decoder reported them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    pub model_path: PathBuf,
    pub size_class: String,
    pub file_type: String,
    pub num_layers: u32,
    #[serde(default)]
    pub adapters: Vec<PathBuf>,
    #[serde(default)]
    pub projectors: Vec<PathBuf>,
    /// Context window in tokens.
    pub num_ctx: u32,
    /// CPU threads; `None` lets the engine decide.
    #[serde(default)]
    pub num_threads: Option<usize>,
    /// Layers to offload to the accelerator; `None` offloads as many as fit.
    #[serde(default)]
    pub num_gpu_layers: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictRequest {
    pub prompt: String,
    /// Maximum tokens to generate; `None` runs until a stop condition.
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default)]
    pub stop: Vec<String>,
}

fn default_temperature() -> f32 {
    0.8
}

fn default_top_p() -> f32 {
    0.9
}

impl PredictRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            max_tokens: None,
            temperature: default_temperature(),
            top_p: default_top_p(),
            stop: Vec::new(),
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// One streamed piece of a completion. The final chunk has `done == true`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictChunk {
    pub content: String,
    pub done: bool,
    #[serde(default)]
    pub eval_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    pub embedding: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenizeRequest {
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenizeResponse {
    pub tokens: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetokenizeRequest {
    pub tokens: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetokenizeResponse {
    pub content: String,
}

/// Compiled capability profile of a variant, reported by `kiln_backend_info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendInfo {
    pub name: String,
    pub version: String,
    /// Compiled-in CPU extensions, e.g. `["avx", "avx2"]`.
    #[serde(default)]
    pub cpu_features: Vec<String>,
    /// Accelerator toolkit the variant was built against, if any.
    #[serde(default)]
    pub accelerator: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predict_request_defaults_when_fields_missing() {
        let req: PredictRequest = serde_json::from_str(r#"{"prompt":"hi"}"#).unwrap();
        assert_eq!(req.prompt, "hi");
        assert_eq!(req.max_tokens, None);
        assert_eq!(req.temperature, 0.8);
        assert_eq!(req.top_p, 0.9);
        assert!(req.stop.is_empty());
    }

    #[test]
    fn test_model_params_optional_fields_default() {
        let json = r#"{
            "model_path": "/models/m.gguf",
            "size_class": "7B",
            "file_type": "Q4_0",
            "num_layers": 32,
            "num_ctx": 2048
        }"#;
        let params: ModelParams = serde_json::from_str(json).unwrap();
        assert!(params.adapters.is_empty());
        assert_eq!(params.num_threads, None);
        assert_eq!(params.num_gpu_layers, None);
    }
}
