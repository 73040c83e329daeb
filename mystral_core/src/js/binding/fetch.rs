//! Fetch natives.
//!
//! `fetchStart` dispatches by scheme: http/https go to the async HTTP
//! client, `file://` to the file reader, `asset://` to the embedded
//! bundle (read synchronously, completed through the same queue so
//! callbacks always fire asynchronously on a later frame).

use crate::io::queue::{next_task_id, FileCompletion, HttpResponseData};
use crate::js::binding::{arg_function, runtime_state};
use crate::js::engine::{CallArgs, Scope, Value};
use crate::js::{FetchPending, FetchTarget};
use crate::io::http::HttpRequest;
use crate::prelude::*;

use std::io::ErrorKind;
use std::time::Duration;

/// `fetchStart(options, callback)`; `options` is the normalized object the
/// JS glue builds: {url, method, headers: [[k,v]…], body, timeoutMs,
/// verifyTls}.
pub fn fetch_start(scope: &mut Scope, args: &CallArgs) -> Result<Value, String> {
  let options = args.get(0).cloned().ok_or("missing fetch options")?;
  let callback = arg_function(scope, args, 1)?;

  let url = scope
    .get(&options, "url")
    .map(|v| scope.to_string_lossy(&v))
    .ok_or("fetch: url is required")?;

  let task = next_task_id();
  let protected = scope.protect(&callback);
  let state = runtime_state(scope);

  if url.starts_with("http://") || url.starts_with("https://") {
    let mut request = HttpRequest {
      url: url.clone(),
      ..Default::default()
    };

    if let Some(method) = scope.get(&options, "method") {
      if scope.is_string(&method) {
        request.method = scope.to_string_lossy(&method).to_uppercase();
      }
    }
    if let Some(headers) = scope.get(&options, "headers") {
      if let Some(len) = scope.array_length(&headers) {
        for i in 0..len {
          if let Some(pair) = scope.get_index(&headers, i) {
            let key = scope.get_index(&pair, 0).map(|v| scope.to_string_lossy(&v));
            let value = scope.get_index(&pair, 1).map(|v| scope.to_string_lossy(&v));
            if let (Some(key), Some(value)) = (key, value) {
              request.headers.push((key, value));
            }
          }
        }
      }
    }
    if let Some(body) = scope.get(&options, "body") {
      if scope.is_string(&body) {
        request.body = Some(scope.to_string_lossy(&body).into_bytes());
      } else if let Some(bytes) = scope.typed_array_bytes(&body) {
        request.body = Some(bytes);
      }
    }
    if let Some(timeout) = scope.get(&options, "timeoutMs") {
      if let Some(ms) = scope.to_number(&timeout) {
        if ms > 0.0 {
          request.timeout = Some(Duration::from_millis(ms as u64));
        }
      }
    }
    if let Some(verify) = scope.get(&options, "verifyTls") {
      if scope.is_boolean(&verify) {
        request.verify_tls = scope.to_bool(&verify);
      }
    }

    let mut state = state.borrow_mut();
    state.pending_fetch.insert(
      task,
      FetchPending {
        callback: protected,
        target: FetchTarget::Http,
      },
    );
    state.io.borrow().http.start(task, request);
    return Ok(scope.undefined());
  }

  // File-shaped targets complete through the file queue.
  let mut state_mut = state.borrow_mut();
  state_mut.pending_fetch.insert(
    task,
    FetchPending {
      callback: protected,
      target: FetchTarget::File { url: url.clone() },
    },
  );

  if url.starts_with("file://") {
    match url::Url::parse(&url).ok().and_then(|u| u.to_file_path().ok()) {
      Some(path) => {
        state_mut.io.borrow().files.read(task, path);
      }
      None => {
        state_mut.io.borrow().files.completions().push(FileCompletion {
          task,
          result: Err((ErrorKind::InvalidInput, format!("invalid file url {url:?}"))),
        });
      }
    }
  } else if let Some(rest) = url.strip_prefix("asset://") {
    let bundle = state_mut.resolver.bundle().cloned();
    let result = match bundle {
      Some(bundle) => bundle
        .read_file(rest)
        .map_err(|e| (ErrorKind::NotFound, e.to_string())),
      None => Err((ErrorKind::NotFound, "no embedded bundle present".to_string())),
    };
    state_mut
      .io
      .borrow()
      .files
      .completions()
      .push(FileCompletion { task, result });
  } else {
    state_mut.io.borrow().files.completions().push(FileCompletion {
      task,
      result: Err((
        ErrorKind::Unsupported,
        format!("unsupported scheme in {url:?}"),
      )),
    });
  }

  Ok(scope.undefined())
}

/// Builds the plain data object the JS glue wraps into a `Response`.
pub fn build_response_object(scope: &mut Scope, response: &HttpResponseData) -> Value {
  let object = scope.create_object();

  let ok = scope.boolean(response.ok);
  scope.set(&object, "ok", &ok);
  let status = scope.number(response.status as f64);
  scope.set(&object, "status", &status);
  let url = scope.string(&response.url);
  scope.set(&object, "url", &url);

  let headers: Vec<Value> = response
    .headers
    .iter()
    .map(|(key, value)| {
      let pair = [scope.string(key), scope.string(value)];
      scope.create_array(&pair)
    })
    .collect();
  let headers = scope.create_array(&headers);
  scope.set(&object, "headers", &headers);

  // External-backing view; the response bytes move into the engine heap
  // and live exactly as long as the array buffer.
  let bytes = scope.create_uint8_array_external(response.bytes.clone());
  scope.set(&object, "bytes", &bytes);

  if let Some(error) = &response.error {
    let error = scope.string(error);
    scope.set(&object, "error", &error);
  }

  object
}

/// Response mapping for file-backed fetches: bytes → 200, missing → 404,
/// anything else → 500 with `error` set. Unsupported schemes surface as
/// status 0 so the glue rejects instead of resolving.
pub fn build_file_response_object(
  scope: &mut Scope,
  url: &str,
  result: &Result<Vec<u8>, (ErrorKind, String)>,
) -> Value {
  let data = match result {
    Ok(bytes) => HttpResponseData {
      ok: true,
      status: 200,
      url: url.to_string(),
      headers: Vec::new(),
      bytes: bytes.clone(),
      error: None,
    },
    Err((ErrorKind::NotFound, message)) => HttpResponseData {
      ok: false,
      status: 404,
      url: url.to_string(),
      headers: Vec::new(),
      bytes: Vec::new(),
      error: Some(message.clone()),
    },
    Err((ErrorKind::Unsupported, message)) => HttpResponseData::from_error(url, message.clone()),
    Err((_, message)) => HttpResponseData {
      ok: false,
      status: 500,
      url: url.to_string(),
      headers: Vec::new(),
      bytes: Vec::new(),
      error: Some(message.clone()),
    },
  };
  build_response_object(scope, &data)
}
