//! # kiln-abi
//!
//! The entry-point contract every Kiln backend variant exports.
//!
//! One engine codebase is compiled into several shared libraries, each with a
//! different capability profile. The runtime never links against any of them;
//! it opens whichever artifact it selects with `dlopen`-style loading and
//! resolves the symbols named in [`symbols`]. Every variant therefore has to
//! export exactly the same functions with exactly the same signatures, which
//! is what [`declare_backend!`] guarantees.
//!
//! Requests and responses cross the boundary as JSON documents (see
//! [`payload`]). Strings allocated by the library are handed back through
//! [`KilnResponse::body`] and must be released with the library's own
//! `kiln_backend_free_string`.

use std::ffi::c_char;
use std::ffi::c_void;

pub mod export;
pub mod payload;

pub use payload::{
    BackendInfo, DetokenizeRequest, DetokenizeResponse, EmbeddingRequest, EmbeddingResponse,
    ModelParams, PredictChunk, PredictRequest, TokenizeRequest, TokenizeResponse,
};

/// Version of the contract described by this crate.
///
/// Bumped whenever a signature or payload changes incompatibly. The runtime
/// refuses to use an artifact reporting a different value.
pub const ABI_VERSION: u32 = 1;

/// Status reported by an entry point that completed successfully.
pub const STATUS_OK: i32 = 0;

/// Status reported when the request could not be decoded.
pub const STATUS_BAD_REQUEST: i32 = 1;

/// Status reported when the engine itself failed.
pub const STATUS_ENGINE_ERROR: i32 = 2;

/// Status reported when the engine panicked; the panic never crosses the boundary.
pub const STATUS_PANIC: i32 = 3;

/// Exported symbol names, NUL-terminated for direct use with symbol lookup.
pub mod symbols {
    pub const ABI_VERSION: &[u8] = b"kiln_backend_abi_version\0";
    pub const INFO: &[u8] = b"kiln_backend_info\0";
    pub const INIT: &[u8] = b"kiln_backend_init\0";
    pub const PREDICT: &[u8] = b"kiln_backend_predict\0";
    pub const EMBEDDING: &[u8] = b"kiln_backend_embedding\0";
    pub const TOKENIZE: &[u8] = b"kiln_backend_tokenize\0";
    pub const DETOKENIZE: &[u8] = b"kiln_backend_detokenize\0";
    pub const SHUTDOWN: &[u8] = b"kiln_backend_shutdown\0";
    pub const FREE_STRING: &[u8] = b"kiln_backend_free_string\0";

    /// Every entry point the runtime resolves, in resolution order.
    pub const ALL: [&[u8]; 9] = [
        ABI_VERSION,
        INFO,
        INIT,
        PREDICT,
        EMBEDDING,
        TOKENIZE,
        DETOKENIZE,
        SHUTDOWN,
        FREE_STRING,
    ];

    /// Printable form of a symbol name (without the trailing NUL).
    pub fn display(symbol: &[u8]) -> &str {
        let trimmed = symbol.strip_suffix(b"\0").unwrap_or(symbol);
        std::str::from_utf8(trimmed).unwrap_or("<non-utf8 symbol>")
    }
}

/// Result slot filled in by every fallible entry point.
///
/// On success `body` holds the JSON payload (or is null when the call has no
/// payload); on failure it holds a human-readable error message. A non-null
/// `body` is owned by the library and must be released with
/// `kiln_backend_free_string`.
#[repr(C)]
#[derive(Debug)]
pub struct KilnResponse {
    pub status: i32,
    pub body: *mut c_char,
}

impl KilnResponse {
    /// An empty response, ready to be passed to an entry point.
    pub fn empty() -> Self {
        Self {
            status: STATUS_OK,
            body: std::ptr::null_mut(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }
}

impl Default for KilnResponse {
    fn default() -> Self {
        Self::empty()
    }
}

/// Streaming callback invoked once per predicted chunk (a JSON [`PredictChunk`]).
pub type StreamCallbackFn = unsafe extern "C" fn(chunk: *const c_char, user_data: *mut c_void);

pub type AbiVersionFn = unsafe extern "C" fn() -> u32;
pub type InfoFn = unsafe extern "C" fn() -> *mut c_char;
pub type InitFn = unsafe extern "C" fn(params: *const c_char, resp: *mut KilnResponse) -> *mut c_void;
pub type PredictFn = unsafe extern "C" fn(
    ctx: *mut c_void,
    request: *const c_char,
    callback: StreamCallbackFn,
    user_data: *mut c_void,
    resp: *mut KilnResponse,
);
pub type EmbeddingFn =
    unsafe extern "C" fn(ctx: *mut c_void, request: *const c_char, resp: *mut KilnResponse);
pub type TokenizeFn =
    unsafe extern "C" fn(ctx: *mut c_void, request: *const c_char, resp: *mut KilnResponse);
pub type DetokenizeFn =
    unsafe extern "C" fn(ctx: *mut c_void, request: *const c_char, resp: *mut KilnResponse);
pub type ShutdownFn = unsafe extern "C" fn(ctx: *mut c_void);
pub type FreeStringFn = unsafe extern "C" fn(s: *mut c_char);

/// The complete set of resolved entry points of one variant.
///
/// Plain function pointers; whoever builds this value must keep the library
/// they came from loaded for as long as the table is used.
#[derive(Debug, Clone, Copy)]
pub struct EntryPoints {
    pub abi_version: AbiVersionFn,
    pub info: InfoFn,
    pub init: InitFn,
    pub predict: PredictFn,
    pub embedding: EmbeddingFn,
    pub tokenize: TokenizeFn,
    pub detokenize: DetokenizeFn,
    pub shutdown: ShutdownFn,
    pub free_string: FreeStringFn,
}

/// Rust-side engine behind a variant's exported functions.
///
/// Implemented once by the engine crate; [`declare_backend!`] generates the
/// `extern "C"` surface that adapts it to the contract.
pub trait BackendEngine: Send + Sync + Sized + 'static {
    /// Static description of the compiled capability profile.
    fn info() -> BackendInfo;

    /// Load a model. Called once per context.
    fn init(params: ModelParams) -> Result<Self, String>;

    /// Generate a completion, emitting chunks as they are produced.
    fn predict(
        &self,
        request: PredictRequest,
        emit: &mut dyn FnMut(PredictChunk),
    ) -> Result<(), String>;

    fn embedding(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse, String>;

    fn tokenize(&self, request: TokenizeRequest) -> Result<TokenizeResponse, String>;

    fn detokenize(&self, request: DetokenizeRequest) -> Result<DetokenizeResponse, String>;
}
