//! Library side of the contract
//!
//! Generic adapters between the `extern "C"` surface and a [`BackendEngine`].
//! Variants do not call these directly; [`declare_backend!`](crate::declare_backend)
//! expands to thin exported wrappers around them.
//!
//! Panics are caught here and reported as [`STATUS_PANIC`]; unwinding across
//! the boundary would abort the host process.

use crate::payload::ModelParams;
use crate::{
    BackendEngine, KilnResponse, STATUS_BAD_REQUEST, STATUS_ENGINE_ERROR, STATUS_OK, STATUS_PANIC,
    StreamCallbackFn,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::any::Any;
use std::ffi::{CStr, CString, c_char, c_void};
use std::panic::{AssertUnwindSafe, catch_unwind};

type Failure = (i32, String);

/// Move a Rust string onto the heap as a C string owned by the caller.
///
/// Interior NUL bytes cannot be represented and are replaced with spaces.
pub fn into_c_string(s: String) -> *mut c_char {
    let sanitized = if s.contains('\0') { s.replace('\0', " ") } else { s };
    CString::new(sanitized).unwrap_or_default().into_raw()
}

fn decode<T: DeserializeOwned>(ptr: *const c_char) -> Result<T, Failure> {
    if ptr.is_null() {
        return Err((STATUS_BAD_REQUEST, "null request".to_string()));
    }
    let raw = unsafe { CStr::from_ptr(ptr) };
    let text = raw
        .to_str()
        .map_err(|e| (STATUS_BAD_REQUEST, format!("request is not UTF-8: {e}")))?;
    serde_json::from_str(text).map_err(|e| (STATUS_BAD_REQUEST, format!("malformed request: {e}")))
}

fn encode<T: Serialize>(value: &T) -> Result<String, Failure> {
    serde_json::to_string(value).map_err(|e| (STATUS_ENGINE_ERROR, format!("encode response: {e}")))
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("engine panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("engine panicked: {s}")
    } else {
        "engine panicked".to_string()
    }
}

fn guarded<T>(f: impl FnOnce() -> Result<T, Failure>) -> Result<T, Failure> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err((STATUS_PANIC, panic_message(payload))),
    }
}

fn write_response(resp: *mut KilnResponse, result: Result<Option<String>, Failure>) {
    if resp.is_null() {
        return;
    }
    let (status, body) = match result {
        Ok(body) => (STATUS_OK, body),
        Err((status, message)) => (status, Some(message)),
    };
    unsafe {
        (*resp).status = status;
        (*resp).body = body.map(into_c_string).unwrap_or(std::ptr::null_mut());
    }
}

fn engine_ref<'a, E: BackendEngine>(ctx: *mut c_void) -> Result<&'a E, Failure> {
    if ctx.is_null() {
        return Err((STATUS_BAD_REQUEST, "backend context is not initialized".to_string()));
    }
    Ok(unsafe { &*(ctx as *const E) })
}

/// # Safety
/// Returns a string that must be released with [`free_string`].
pub unsafe fn info<E: BackendEngine>() -> *mut c_char {
    match guarded(|| encode(&E::info())) {
        Ok(json) => into_c_string(json),
        Err(_) => std::ptr::null_mut(),
    }
}

/// # Safety
/// `params` must be null or a valid NUL-terminated string; `resp` must be
/// null or point to a writable [`KilnResponse`].
pub unsafe fn init<E: BackendEngine>(params: *const c_char, resp: *mut KilnResponse) -> *mut c_void {
    let outcome = guarded(|| {
        let params: ModelParams = decode(params)?;
        E::init(params).map_err(|e| (STATUS_ENGINE_ERROR, e))
    });
    match outcome {
        Ok(engine) => {
            write_response(resp, Ok(None));
            Box::into_raw(Box::new(engine)) as *mut c_void
        }
        Err(failure) => {
            write_response(resp, Err(failure));
            std::ptr::null_mut()
        }
    }
}

/// # Safety
/// `ctx` must come from [`init`] for the same engine type and not yet be shut down.
pub unsafe fn predict<E: BackendEngine>(
    ctx: *mut c_void,
    request: *const c_char,
    callback: StreamCallbackFn,
    user_data: *mut c_void,
    resp: *mut KilnResponse,
) {
    let result = guarded(|| {
        let engine = engine_ref::<E>(ctx)?;
        let request = decode(request)?;
        let mut emit = |chunk: crate::PredictChunk| {
            if let Ok(json) = serde_json::to_string(&chunk) {
                let line = CString::new(json).unwrap_or_default();
                unsafe { callback(line.as_ptr(), user_data) };
            }
        };
        engine
            .predict(request, &mut emit)
            .map_err(|e| (STATUS_ENGINE_ERROR, e))?;
        Ok(None)
    });
    write_response(resp, result);
}

/// Shared shape of the request/response entry points.
///
/// # Safety
/// Same requirements as [`predict`].
pub unsafe fn call<E, Req, Resp>(
    ctx: *mut c_void,
    request: *const c_char,
    resp: *mut KilnResponse,
    f: impl FnOnce(&E, Req) -> Result<Resp, String>,
) where
    E: BackendEngine,
    Req: DeserializeOwned,
    Resp: Serialize,
{
    let result = guarded(|| {
        let engine = engine_ref::<E>(ctx)?;
        let request = decode(request)?;
        let response = f(engine, request).map_err(|e| (STATUS_ENGINE_ERROR, e))?;
        encode(&response).map(Some)
    });
    write_response(resp, result);
}

/// # Safety
/// `ctx` must come from [`init`] and must not be used again afterwards.
pub unsafe fn shutdown<E: BackendEngine>(ctx: *mut c_void) {
    if ctx.is_null() {
        return;
    }
    let engine = unsafe { Box::from_raw(ctx as *mut E) };
    let _ = catch_unwind(AssertUnwindSafe(move || drop(engine)));
}

/// # Safety
/// `s` must be null or a string previously returned by this library.
pub unsafe fn free_string(s: *mut c_char) {
    if !s.is_null() {
        drop(unsafe { CString::from_raw(s) });
    }
}

/// Export the full entry-point contract for an engine type.
///
/// Expands to the `#[unsafe(no_mangle)]` functions listed in
/// [`symbols`](crate::symbols), plus a Rust-visible `kiln_entry_points()`
/// that builds an [`EntryPoints`](crate::EntryPoints) table from them for
/// in-process use.
#[macro_export]
macro_rules! declare_backend {
    ($engine:ty) => {
        #[unsafe(no_mangle)]
        pub extern "C" fn kiln_backend_abi_version() -> u32 {
            $crate::ABI_VERSION
        }

        #[unsafe(no_mangle)]
        pub extern "C" fn kiln_backend_info() -> *mut ::std::ffi::c_char {
            unsafe { $crate::export::info::<$engine>() }
        }

        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn kiln_backend_init(
            params: *const ::std::ffi::c_char,
            resp: *mut $crate::KilnResponse,
        ) -> *mut ::std::ffi::c_void {
            unsafe { $crate::export::init::<$engine>(params, resp) }
        }

        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn kiln_backend_predict(
            ctx: *mut ::std::ffi::c_void,
            request: *const ::std::ffi::c_char,
            callback: $crate::StreamCallbackFn,
            user_data: *mut ::std::ffi::c_void,
            resp: *mut $crate::KilnResponse,
        ) {
            unsafe { $crate::export::predict::<$engine>(ctx, request, callback, user_data, resp) }
        }

        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn kiln_backend_embedding(
            ctx: *mut ::std::ffi::c_void,
            request: *const ::std::ffi::c_char,
            resp: *mut $crate::KilnResponse,
        ) {
            unsafe {
                $crate::export::call::<$engine, _, _>(ctx, request, resp, |e, r| {
                    <$engine as $crate::BackendEngine>::embedding(e, r)
                })
            }
        }

        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn kiln_backend_tokenize(
            ctx: *mut ::std::ffi::c_void,
            request: *const ::std::ffi::c_char,
            resp: *mut $crate::KilnResponse,
        ) {
            unsafe {
                $crate::export::call::<$engine, _, _>(ctx, request, resp, |e, r| {
                    <$engine as $crate::BackendEngine>::tokenize(e, r)
                })
            }
        }

        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn kiln_backend_detokenize(
            ctx: *mut ::std::ffi::c_void,
            request: *const ::std::ffi::c_char,
            resp: *mut $crate::KilnResponse,
        ) {
            unsafe {
                $crate::export::call::<$engine, _, _>(ctx, request, resp, |e, r| {
                    <$engine as $crate::BackendEngine>::detokenize(e, r)
                })
            }
        }

        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn kiln_backend_shutdown(ctx: *mut ::std::ffi::c_void) {
            unsafe { $crate::export::shutdown::<$engine>(ctx) }
        }

        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn kiln_backend_free_string(s: *mut ::std::ffi::c_char) {
            unsafe { $crate::export::free_string(s) }
        }

        /// Entry points of this crate as an in-process table.
        pub fn kiln_entry_points() -> $crate::EntryPoints {
            $crate::EntryPoints {
                abi_version: kiln_backend_abi_version,
                info: kiln_backend_info,
                init: kiln_backend_init,
                predict: kiln_backend_predict,
                embedding: kiln_backend_embedding,
                tokenize: kiln_backend_tokenize,
                detokenize: kiln_backend_detokenize,
                shutdown: kiln_backend_shutdown,
                free_string: kiln_backend_free_string,
            }
        }
    };
}
