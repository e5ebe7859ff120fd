//! Loaded backend handle
//!
//! [`LoadedBackend`] owns one initialized variant: the native library, the
//! engine context returned by its init entry point and the lease that keeps
//! any other handle from wrapping the same artifact. Entry points are reached
//! through the [`InferenceBackend`] trait so serving code does not care which
//! variant won dispatch.

use crate::dispatch::DispatchReport;
use crate::loader::{ArtifactLease, LoadError, LoadedArtifact, take_string};
use crate::variant::BackendVariant;
use chrono::{DateTime, Utc};
use kiln_abi::{
    BackendInfo, DetokenizeRequest, DetokenizeResponse, EmbeddingRequest, EmbeddingResponse,
    EntryPoints, KilnResponse, ModelParams, PredictChunk, PredictRequest, TokenizeRequest,
    TokenizeResponse,
};
use libloading::Library;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::any::Any;
use std::ffi::{CStr, CString, c_char, c_void};
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Backend call errors
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum BackendError {
    #[error("Backend {0} has been shut down")]
    InvalidState(String),

    #[error("{entry_point} failed with status {status}: {message}")]
    Call {
        entry_point: &'static str,
        status: i32,
        message: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Uniform entry points of a loaded backend, whichever variant it is
pub trait InferenceBackend: Send + Sync {
    /// Identifier of the variant serving calls.
    fn variant_id(&self) -> &str;

    /// Generate a completion, calling `on_chunk` for every streamed piece.
    fn predict(
        &self,
        request: &PredictRequest,
        on_chunk: &mut dyn FnMut(PredictChunk),
    ) -> Result<(), BackendError>;

    fn embedding(&self, content: &str) -> Result<Vec<f64>, BackendError>;

    fn encode(&self, content: &str) -> Result<Vec<i32>, BackendError>;

    fn decode(&self, tokens: &[i32]) -> Result<String, BackendError>;

    /// Release the engine and unload the library. Idempotent.
    fn shutdown(&self) -> Result<(), BackendError>;
}

/// Live engine context and the entry points that serve it
struct Session {
    entry: EntryPoints,
    ctx: *mut c_void,
}

// The context is only dereferenced by the engine, which the contract
// requires to accept calls from any thread.
unsafe impl Send for Session {}
unsafe impl Sync for Session {}

/// An initialized backend variant
pub struct LoadedBackend {
    variant: BackendVariant,
    location: PathBuf,
    info: BackendInfo,
    digest: String,
    loaded_at: DateTime<Utc>,
    report: DispatchReport,
    session: RwLock<Option<Session>>,
    // Declared after `session`; the library must outlive the context.
    library: Mutex<Option<Library>>,
    lease: Mutex<Option<ArtifactLease>>,
}

impl LoadedBackend {
    /// Call the artifact's init entry point with `params`.
    ///
    /// On failure the artifact is dropped, unloading its library, and the
    /// lease is released.
    pub fn initialize(
        variant: &BackendVariant,
        location: &Path,
        artifact: LoadedArtifact,
        lease: ArtifactLease,
        params: &ModelParams,
    ) -> Result<Self, LoadError> {
        let (entry, library, digest, info) = artifact.into_parts();

        let json = serde_json::to_string(params)
            .map_err(|e| LoadError::InitFailed(format!("encode model params: {e}")))?;
        let json = CString::new(json)
            .map_err(|e| LoadError::InitFailed(format!("encode model params: {e}")))?;

        let mut resp = KilnResponse::empty();
        let ctx = unsafe { (entry.init)(json.as_ptr(), &mut resp) };
        let message = unsafe { take_string(&entry, resp.body) };

        if ctx.is_null() || !resp.is_ok() {
            if !ctx.is_null() {
                unsafe { (entry.shutdown)(ctx) };
            }
            return Err(LoadError::InitFailed(message.unwrap_or_else(|| {
                format!("init returned status {} without a context", resp.status)
            })));
        }

        info!(
            variant = %variant.id,
            artifact = %location.display(),
            model = %params.model_path.display(),
            "backend initialized"
        );

        Ok(Self {
            variant: variant.clone(),
            location: location.to_path_buf(),
            info,
            digest,
            loaded_at: Utc::now(),
            report: DispatchReport::default(),
            session: RwLock::new(Some(Session { entry, ctx })),
            library: Mutex::new(library),
            lease: Mutex::new(Some(lease)),
        })
    }

    pub(crate) fn set_report(&mut self, report: DispatchReport) {
        self.report = report;
    }

    pub fn variant(&self) -> &BackendVariant {
        &self.variant
    }

    /// Path of the artifact this backend was loaded from
    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn info(&self) -> &BackendInfo {
        &self.info
    }

    /// SHA-256 of the artifact, empty for in-process engines
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    /// Attempts made while selecting this backend, in dispatch order
    pub fn report(&self) -> &DispatchReport {
        &self.report
    }

    pub fn is_active(&self) -> bool {
        self.session.read().is_some()
    }

    fn invoke<Req, Resp>(
        &self,
        entry_point: &'static str,
        select: impl FnOnce(&EntryPoints) -> kiln_abi::EmbeddingFn,
        request: &Req,
    ) -> Result<Resp, BackendError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let guard = self.session.read();
        let session = guard
            .as_ref()
            .ok_or_else(|| BackendError::InvalidState(self.variant.id.clone()))?;
        let request = encode_request(request)?;

        let mut resp = KilnResponse::empty();
        let f = select(&session.entry);
        unsafe { f(session.ctx, request.as_ptr(), &mut resp) };

        let body = unsafe { take_string(&session.entry, resp.body) };
        check_status(entry_point, &resp, body.as_deref())?;
        let body = body.ok_or_else(|| {
            BackendError::Serialization(format!("{entry_point} returned an empty body"))
        })?;
        serde_json::from_str(&body).map_err(|e| BackendError::Serialization(e.to_string()))
    }
}

impl InferenceBackend for LoadedBackend {
    fn variant_id(&self) -> &str {
        &self.variant.id
    }

    fn predict(
        &self,
        request: &PredictRequest,
        on_chunk: &mut dyn FnMut(PredictChunk),
    ) -> Result<(), BackendError> {
        if request.prompt.is_empty() {
            return Err(BackendError::InvalidRequest("prompt is empty".to_string()));
        }

        let guard = self.session.read();
        let session = guard
            .as_ref()
            .ok_or_else(|| BackendError::InvalidState(self.variant.id.clone()))?;
        let encoded = encode_request(request)?;

        let mut sink = StreamSink {
            emit: on_chunk,
            error: None,
            panic: None,
        };
        let mut resp = KilnResponse::empty();
        unsafe {
            (session.entry.predict)(
                session.ctx,
                encoded.as_ptr(),
                stream_trampoline,
                &mut sink as *mut StreamSink<'_> as *mut c_void,
                &mut resp,
            )
        };
        let body = unsafe { take_string(&session.entry, resp.body) };
        drop(guard);

        if let Some(payload) = sink.panic {
            resume_unwind(payload);
        }
        check_status("predict", &resp, body.as_deref())?;
        match sink.error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn embedding(&self, content: &str) -> Result<Vec<f64>, BackendError> {
        let request = EmbeddingRequest {
            content: content.to_string(),
        };
        let response: EmbeddingResponse = self.invoke("embedding", |e| e.embedding, &request)?;
        Ok(response.embedding)
    }

    fn encode(&self, content: &str) -> Result<Vec<i32>, BackendError> {
        let request = TokenizeRequest {
            content: content.to_string(),
        };
        let response: TokenizeResponse = self.invoke("tokenize", |e| e.tokenize, &request)?;
        Ok(response.tokens)
    }

    fn decode(&self, tokens: &[i32]) -> Result<String, BackendError> {
        let request = DetokenizeRequest {
            tokens: tokens.to_vec(),
        };
        let response: DetokenizeResponse = self.invoke("detokenize", |e| e.detokenize, &request)?;
        Ok(response.content)
    }

    fn shutdown(&self) -> Result<(), BackendError> {
        let Some(session) = self.session.write().take() else {
            return Ok(());
        };
        unsafe { (session.entry.shutdown)(session.ctx) };

        if let Some(library) = self.library.lock().take() {
            drop(library);
            debug!(artifact = %self.location.display(), "backend library unloaded");
        }
        self.lease.lock().take();

        info!(variant = %self.variant.id, "backend shut down");
        Ok(())
    }
}

impl Drop for LoadedBackend {
    fn drop(&mut self) {
        let _ = InferenceBackend::shutdown(self);
    }
}

impl std::fmt::Debug for LoadedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedBackend")
            .field("variant", &self.variant.id)
            .field("location", &self.location)
            .field("info", &self.info)
            .field("loaded_at", &self.loaded_at)
            .field("active", &self.is_active())
            .finish()
    }
}

fn encode_request<T: Serialize>(request: &T) -> Result<CString, BackendError> {
    let json =
        serde_json::to_string(request).map_err(|e| BackendError::Serialization(e.to_string()))?;
    CString::new(json).map_err(|e| BackendError::Serialization(e.to_string()))
}

fn check_status(
    entry_point: &'static str,
    resp: &KilnResponse,
    body: Option<&str>,
) -> Result<(), BackendError> {
    if resp.is_ok() {
        return Ok(());
    }
    Err(BackendError::Call {
        entry_point,
        status: resp.status,
        message: body.unwrap_or("no message").to_string(),
    })
}

/// Caller state threaded through the predict callback
struct StreamSink<'a> {
    emit: &'a mut dyn FnMut(PredictChunk),
    error: Option<BackendError>,
    panic: Option<Box<dyn Any + Send>>,
}

/// Decode one streamed chunk and hand it to the caller.
///
/// A panic in the caller's callback is held until the engine returns, then
/// resumed on the caller's side of the boundary.
unsafe extern "C" fn stream_trampoline(chunk: *const c_char, user_data: *mut c_void) {
    if chunk.is_null() || user_data.is_null() {
        return;
    }
    let sink = unsafe { &mut *(user_data as *mut StreamSink<'_>) };
    if sink.panic.is_some() || sink.error.is_some() {
        return;
    }

    let text = unsafe { CStr::from_ptr(chunk) }.to_string_lossy();
    match serde_json::from_str::<PredictChunk>(&text) {
        Ok(chunk) => {
            let delivered = catch_unwind(AssertUnwindSafe(|| (sink.emit)(chunk)));
            if let Err(payload) = delivered {
                sink.panic = Some(payload);
            }
        }
        Err(e) => sink.error = Some(BackendError::Serialization(format!("stream chunk: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::AcceleratorKind;

    fn variant() -> BackendVariant {
        BackendVariant {
            id: "cpu".to_string(),
            requires: AcceleratorKind::None,
            rank: 0,
            baseline: true,
            cpu_features: Vec::new(),
            features: Vec::new(),
            rustflags: Vec::new(),
            artifact: None,
        }
    }

    fn params(model_path: &Path) -> ModelParams {
        ModelParams {
            model_path: model_path.to_path_buf(),
            size_class: "7B".into(),
            file_type: "Q4_0".into(),
            num_layers: 32,
            adapters: Vec::new(),
            projectors: Vec::new(),
            num_ctx: 2048,
            num_threads: None,
            num_gpu_layers: None,
        }
    }

    fn backend(dir: &Path) -> LoadedBackend {
        let model = dir.join("model.gguf");
        std::fs::write(&model, b"weights").unwrap();
        let location = dir.join("cpu").join("libkiln_engine.so");
        let artifact = LoadedArtifact::from_entry_points(kiln_engine::kiln_entry_points()).unwrap();
        let lease = ArtifactLease::acquire(&location).unwrap();
        LoadedBackend::initialize(&variant(), &location, artifact, lease, &params(&model)).unwrap()
    }

    #[test]
    fn test_entry_points_roundtrip_through_contract() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        assert_eq!(backend.variant_id(), "cpu");
        assert_eq!(backend.info().name, "kiln-engine");
        assert!(backend.digest().is_empty());

        let tokens = backend.encode("hello").unwrap();
        assert_eq!(tokens.len(), 5);
        assert_eq!(backend.decode(&tokens).unwrap(), "hello");
        assert_eq!(backend.embedding("hello world").unwrap().len(), kiln_engine::EMBEDDING_DIM);
    }

    #[test]
    fn test_predict_streams_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());

        let mut chunks = Vec::new();
        backend
            .predict(&PredictRequest::new("one two three"), &mut |c| chunks.push(c))
            .unwrap();
        assert!(chunks.last().unwrap().done);
        let text: String = chunks.iter().map(|c| c.content.as_str()).collect();
        assert!(text.contains("three"));
    }

    #[test]
    fn test_empty_prompt_rejected_before_call() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        let err = backend
            .predict(&PredictRequest::new(""), &mut |_| {})
            .unwrap_err();
        assert!(matches!(err, BackendError::InvalidRequest(_)));
    }

    #[test]
    fn test_engine_errors_carry_status() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        let err = backend.decode(&[100_000]).unwrap_err();
        match err {
            BackendError::Call {
                entry_point,
                status,
                message,
            } => {
                assert_eq!(entry_point, "detokenize");
                assert_eq!(status, kiln_abi::STATUS_ENGINE_ERROR);
                assert!(message.contains("outside the vocabulary"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_calls_after_shutdown_are_invalid_state() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        backend.shutdown().unwrap();
        assert!(!backend.is_active());
        assert!(matches!(backend.encode("x"), Err(BackendError::InvalidState(_))));
        assert!(matches!(backend.embedding("x"), Err(BackendError::InvalidState(_))));
        assert!(matches!(
            backend.predict(&PredictRequest::new("x"), &mut |_| {}),
            Err(BackendError::InvalidState(_))
        ));
        // Second shutdown is a no-op.
        backend.shutdown().unwrap();
    }

    #[test]
    fn test_shutdown_releases_lease() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        let location = backend.location().to_path_buf();
        assert!(ArtifactLease::is_held(&location));
        backend.shutdown().unwrap();
        assert!(!ArtifactLease::is_held(&location));
    }

    #[test]
    fn test_drop_releases_lease() {
        let dir = tempfile::tempdir().unwrap();
        let location = {
            let backend = backend(dir.path());
            backend.location().to_path_buf()
        };
        assert!(!ArtifactLease::is_held(&location));
    }

    #[test]
    fn test_init_failure_releases_lease() {
        let dir = tempfile::tempdir().unwrap();
        let location = dir.path().join("cpu").join("libkiln_engine.so");
        let artifact = LoadedArtifact::from_entry_points(kiln_engine::kiln_entry_points()).unwrap();
        let lease = ArtifactLease::acquire(&location).unwrap();
        let err = LoadedBackend::initialize(
            &variant(),
            &location,
            artifact,
            lease,
            &params(&dir.path().join("missing.gguf")),
        )
        .unwrap_err();
        assert!(matches!(err, LoadError::InitFailed(ref m) if m.contains("model file not found")));
        assert!(!ArtifactLease::is_held(&location));
    }

    #[test]
    #[should_panic(expected = "consumer failed")]
    fn test_callback_panic_resumes_after_call() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        let _ = backend.predict(&PredictRequest::new("a b"), &mut |_| panic!("consumer failed"));
    }
}
