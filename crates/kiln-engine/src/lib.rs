//! # kiln-engine
//!
//! The single engine codebase behind every Kiln backend variant.
//!
//! The variant matrix (`variants.toml`, driven by `kiln-variants build`)
//! compiles this crate several times, each with a different set of Cargo
//! features and `-C target-feature` flags, and ships every resulting shared
//! library side by side. All of them export the same contract through
//! [`kiln_abi::declare_backend!`].
//!
//! Numerical kernels live outside this workspace. What is compiled here is the
//! reference engine: byte-level tokenization, a hashed bag-of-bigrams
//! embedding and echo decoding. It is deterministic, needs no weights, and is
//! enough to verify that a packaged artifact loads and answers every entry
//! point on the target host.
//!
//! | Feature | Profile                               |
//! |---------|---------------------------------------|
//! | `avx`   | CPU with AVX                          |
//! | `avx2`  | CPU with AVX2 (implies `avx`)         |
//! | `cuda`  | NVIDIA GPUs through the CUDA toolkit  |
//! | `rocm`  | AMD GPUs through ROCm                 |

use kiln_abi::{
    BackendEngine, BackendInfo, DetokenizeRequest, DetokenizeResponse, EmbeddingRequest,
    EmbeddingResponse, ModelParams, PredictChunk, PredictRequest, TokenizeRequest,
    TokenizeResponse,
};

/// Beginning-of-sequence token.
pub const BOS_TOKEN: i32 = 1;
/// End-of-sequence token.
pub const EOS_TOKEN: i32 = 2;
/// First id used for byte tokens; ids below are reserved.
const BYTE_OFFSET: i32 = 3;
/// Dimensionality of the reference embedding.
pub const EMBEDDING_DIM: usize = 64;

/// Compiled-in CPU extensions of this build.
pub fn compiled_cpu_features() -> Vec<String> {
    let mut features = Vec::new();
    if cfg!(any(feature = "avx", target_feature = "avx")) {
        features.push("avx".to_string());
    }
    if cfg!(any(feature = "avx2", target_feature = "avx2")) {
        features.push("avx2".to_string());
    }
    if cfg!(target_feature = "avx512f") {
        features.push("avx512f".to_string());
    }
    if cfg!(target_feature = "fma") {
        features.push("fma".to_string());
    }
    if cfg!(target_feature = "f16c") {
        features.push("f16c".to_string());
    }
    features
}

/// Accelerator toolkit of this build, if any.
pub fn compiled_accelerator() -> Option<&'static str> {
    if cfg!(feature = "cuda") {
        Some("cuda")
    } else if cfg!(feature = "rocm") {
        Some("rocm")
    } else {
        None
    }
}

/// Reference engine instance; one per `kiln_backend_init` call.
#[derive(Debug)]
pub struct ReferenceEngine {
    params: ModelParams,
    offloaded_layers: u32,
}

impl ReferenceEngine {
    pub fn params(&self) -> &ModelParams {
        &self.params
    }

    /// Layers placed on the accelerator (always 0 for CPU builds).
    pub fn offloaded_layers(&self) -> u32 {
        self.offloaded_layers
    }

    fn encode(content: &str) -> Vec<i32> {
        content.bytes().map(|b| b as i32 + BYTE_OFFSET).collect()
    }

    fn decode(tokens: &[i32]) -> Result<String, String> {
        let mut bytes = Vec::with_capacity(tokens.len());
        for &token in tokens {
            match token {
                BOS_TOKEN | EOS_TOKEN => continue,
                t if (BYTE_OFFSET..BYTE_OFFSET + 256).contains(&t) => {
                    bytes.push((t - BYTE_OFFSET) as u8)
                }
                t => return Err(format!("token {t} is outside the vocabulary")),
            }
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl BackendEngine for ReferenceEngine {
    fn info() -> BackendInfo {
        BackendInfo {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            cpu_features: compiled_cpu_features(),
            accelerator: compiled_accelerator().map(str::to_string),
        }
    }

    fn init(params: ModelParams) -> Result<Self, String> {
        if !params.model_path.exists() {
            return Err(format!(
                "model file not found: {}",
                params.model_path.display()
            ));
        }
        if params.num_layers == 0 {
            return Err("model reports zero layers".to_string());
        }
        for adapter in &params.adapters {
            if !adapter.exists() {
                return Err(format!("adapter not found: {}", adapter.display()));
            }
        }

        let offloaded_layers = match compiled_accelerator() {
            Some(_) => params
                .num_gpu_layers
                .map_or(params.num_layers, |n| n.min(params.num_layers)),
            None => 0,
        };

        tracing::debug!(
            model = %params.model_path.display(),
            layers = params.num_layers,
            offloaded_layers,
            "reference engine initialized"
        );

        Ok(Self {
            params,
            offloaded_layers,
        })
    }

    fn predict(
        &self,
        request: PredictRequest,
        emit: &mut dyn FnMut(PredictChunk),
    ) -> Result<(), String> {
        let limit = request.max_tokens.unwrap_or(u32::MAX) as usize;
        let mut generated = String::new();
        let mut eval_count = 0u32;

        for piece in request.prompt.split_inclusive(char::is_whitespace) {
            if eval_count as usize >= limit {
                break;
            }
            let piece_start = generated.len();
            generated.push_str(piece);
            let stop_at = request
                .stop
                .iter()
                .filter(|s| !s.is_empty())
                .filter_map(|s| generated.find(s.as_str()))
                .min();
            if let Some(idx) = stop_at {
                let head = if idx > piece_start {
                    &generated[piece_start..idx]
                } else {
                    ""
                };
                if !head.is_empty() {
                    eval_count += 1;
                    emit(PredictChunk {
                        content: head.to_string(),
                        done: false,
                        eval_count,
                    });
                }
                break;
            }
            eval_count += 1;
            emit(PredictChunk {
                content: piece.to_string(),
                done: false,
                eval_count,
            });
        }

        emit(PredictChunk {
            content: String::new(),
            done: true,
            eval_count,
        });
        Ok(())
    }

    fn embedding(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse, String> {
        let mut embedding = vec![0f64; EMBEDDING_DIM];
        let bytes = request.content.as_bytes();
        for window in bytes.windows(2) {
            let bucket = (window[0] as usize * 31 + window[1] as usize) % EMBEDDING_DIM;
            embedding[bucket] += 1.0;
        }
        if let [single] = bytes {
            embedding[*single as usize % EMBEDDING_DIM] += 1.0;
        }

        let norm = embedding.iter().map(|v| v * v).sum::<f64>().sqrt();
        if norm > 0.0 {
            embedding.iter_mut().for_each(|v| *v /= norm);
        }
        Ok(EmbeddingResponse { embedding })
    }

    fn tokenize(&self, request: TokenizeRequest) -> Result<TokenizeResponse, String> {
        Ok(TokenizeResponse {
            tokens: Self::encode(&request.content),
        })
    }

    fn detokenize(&self, request: DetokenizeRequest) -> Result<DetokenizeResponse, String> {
        Ok(DetokenizeResponse {
            content: Self::decode(&request.tokens)?,
        })
    }
}

kiln_abi::declare_backend!(ReferenceEngine);

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn params(path: PathBuf) -> ModelParams {
        ModelParams {
            model_path: path,
            size_class: "7B".into(),
            file_type: "Q4_0".into(),
            num_layers: 32,
            adapters: vec![],
            projectors: vec![],
            num_ctx: 2048,
            num_threads: None,
            num_gpu_layers: Some(8),
        }
    }

    fn engine() -> (tempfile::NamedTempFile, ReferenceEngine) {
        let model = tempfile::NamedTempFile::new().unwrap();
        let engine = ReferenceEngine::init(params(model.path().to_path_buf())).unwrap();
        (model, engine)
    }

    #[test]
    fn test_init_missing_model_fails() {
        let err = ReferenceEngine::init(params("/nonexistent/model.gguf".into())).unwrap_err();
        assert!(err.contains("model file not found"));
    }

    #[test]
    fn test_init_zero_layers_fails() {
        let model = tempfile::NamedTempFile::new().unwrap();
        let mut p = params(model.path().to_path_buf());
        p.num_layers = 0;
        assert!(ReferenceEngine::init(p).is_err());
    }

    #[test]
    fn test_cpu_build_offloads_nothing() {
        let (_model, engine) = engine();
        if compiled_accelerator().is_none() {
            assert_eq!(engine.offloaded_layers(), 0);
        } else {
            assert_eq!(engine.offloaded_layers(), 8);
        }
    }

    #[test]
    fn test_tokenize_detokenize_utf8() {
        let (_model, engine) = engine();
        let tokens = engine
            .tokenize(TokenizeRequest {
                content: "héllo".into(),
            })
            .unwrap()
            .tokens;
        assert_eq!(tokens.len(), "héllo".len());
        let mut with_specials = vec![BOS_TOKEN];
        with_specials.extend(tokens);
        with_specials.push(EOS_TOKEN);
        let text = engine
            .detokenize(DetokenizeRequest {
                tokens: with_specials,
            })
            .unwrap()
            .content;
        assert_eq!(text, "héllo");
    }

    #[test]
    fn test_detokenize_rejects_unknown_token() {
        let (_model, engine) = engine();
        let err = engine
            .detokenize(DetokenizeRequest { tokens: vec![9999] })
            .unwrap_err();
        assert!(err.contains("9999"));
    }

    #[test]
    fn test_embedding_is_normalized_and_deterministic() {
        let (_model, engine) = engine();
        let a = engine
            .embedding(EmbeddingRequest {
                content: "the quick brown fox".into(),
            })
            .unwrap()
            .embedding;
        let b = engine
            .embedding(EmbeddingRequest {
                content: "the quick brown fox".into(),
            })
            .unwrap()
            .embedding;
        assert_eq!(a, b);
        assert_eq!(a.len(), EMBEDDING_DIM);
        let norm: f64 = a.iter().map(|v| v * v).sum::<f64>().sqrt();
        assert!((norm - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_embedding_of_empty_text_is_zero() {
        let (_model, engine) = engine();
        let e = engine
            .embedding(EmbeddingRequest {
                content: String::new(),
            })
            .unwrap()
            .embedding;
        assert!(e.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_predict_respects_max_tokens_and_ends_with_done() {
        let (_model, engine) = engine();
        let mut chunks = Vec::new();
        engine
            .predict(
                PredictRequest::new("one two three four").with_max_tokens(2),
                &mut |c| chunks.push(c),
            )
            .unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].content, "one ");
        assert_eq!(chunks[1].content, "two ");
        assert!(chunks[2].done);
        assert_eq!(chunks[2].eval_count, 2);
    }

    #[test]
    fn test_predict_stops_at_stop_sequence() {
        let (_model, engine) = engine();
        let mut request = PredictRequest::new("alpha beta STOP gamma");
        request.stop = vec!["STOP".into()];
        let mut text = String::new();
        engine
            .predict(request, &mut |c| text.push_str(&c.content))
            .unwrap();
        assert_eq!(text, "alpha beta ");
    }

    #[test]
    fn test_info_reports_profile() {
        let info = ReferenceEngine::info();
        assert_eq!(info.name, "kiln-engine");
        assert_eq!(info.accelerator.as_deref(), compiled_accelerator());
    }
}
