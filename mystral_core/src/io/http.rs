//! Async HTTP client.
//!
//! Requests run on the I/O worker runtime; completions land in the
//! [`CompletionQueue`] and the main thread fires the callbacks. Redirects
//! are followed within http/https only (the client never dispatches other
//! schemes; `file://` and `asset://` are handled by the fetch binding).

use crate::io::queue::{CompletionQueue, HttpCompletion, HttpResponseData, TaskId};
use crate::prelude::*;

use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::task::TaskTracker;

/// One outgoing request, as assembled by the fetch binding.
#[derive(Debug, Clone)]
pub struct HttpRequest {
  pub method: String,
  pub url: String,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
  pub timeout: Option<Duration>,
  pub verify_tls: bool,
}

impl Default for HttpRequest {
  fn default() -> Self {
    HttpRequest {
      method: "GET".to_string(),
      url: String::new(),
      headers: Vec::new(),
      body: None,
      timeout: None,
      verify_tls: true,
    }
  }
}

/// Folds a response header map into lowercased keys, last value winning on
/// duplicates, preserving first-seen order.
pub fn fold_headers(headers: &reqwest::header::HeaderMap) -> Vec<(String, String)> {
  let mut folded: Vec<(String, String)> = Vec::new();
  for (name, value) in headers.iter() {
    let key = name.as_str().to_ascii_lowercase();
    let value = String::from_utf8_lossy(value.as_bytes()).to_string();
    match folded.iter_mut().find(|(k, _)| *k == key) {
      Some((_, existing)) => *existing = value,
      None => folded.push((key, value)),
    }
  }
  folded
}

async fn perform(client: reqwest::Client, request: HttpRequest) -> HttpResponseData {
  let method = reqwest::Method::from_bytes(request.method.as_bytes())
    .unwrap_or(reqwest::Method::GET);

  let mut builder = client.request(method, &request.url);
  for (key, value) in request.headers.iter() {
    builder = builder.header(key, value);
  }
  if let Some(timeout) = request.timeout {
    builder = builder.timeout(timeout);
  }
  if let Some(body) = request.body.clone() {
    builder = builder.body(body);
  }

  match builder.send().await {
    Ok(response) => {
      let status = response.status().as_u16();
      let url = response.url().to_string();
      let headers = fold_headers(response.headers());
      match response.bytes().await {
        Ok(bytes) => HttpResponseData {
          ok: (200..300).contains(&status),
          status,
          url,
          headers,
          bytes: bytes.to_vec(),
          error: None,
        },
        Err(e) => HttpResponseData::from_error(&request.url, e.to_string()),
      }
    }
    Err(e) => HttpResponseData::from_error(&request.url, e.to_string()),
  }
}

/// The async HTTP client driven by the I/O runtime.
pub struct HttpClient {
  handle: Option<Handle>,
  tracker: TaskTracker,
  queue: CompletionQueue<HttpCompletion>,
  client: reqwest::Client,
  insecure_client: once_cell::sync::OnceCell<reqwest::Client>,
}

impl HttpClient {
  pub fn new(handle: Option<Handle>, tracker: TaskTracker) -> Self {
    HttpClient {
      handle,
      tracker,
      queue: CompletionQueue::new(),
      client: reqwest::Client::new(),
      insecure_client: once_cell::sync::OnceCell::new(),
    }
  }

  pub fn completions(&self) -> CompletionQueue<HttpCompletion> {
    self.queue.clone()
  }

  fn client_for(&self, verify_tls: bool) -> reqwest::Client {
    if verify_tls {
      self.client.clone()
    } else {
      self
        .insecure_client
        .get_or_init(|| {
          reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new())
        })
        .clone()
    }
  }

  /// Starts `request`; its completion will be queued under `task`.
  pub fn start(&self, task: TaskId, request: HttpRequest) {
    let client = self.client_for(request.verify_tls);
    let queue = self.queue.clone();

    match &self.handle {
      Some(handle) => {
        let fut = async move {
          let response = perform(client, request).await;
          queue.push(HttpCompletion { task, response });
        };
        handle.spawn(self.tracker.track_future(fut));
      }
      None => {
        // Worker runtime unavailable: synchronous fallback on the main
        // thread.
        trace!("HTTP worker unavailable, blocking request {:?}", request.url);
        let response = perform_blocking(request);
        queue.push(HttpCompletion { task, response });
      }
    }
  }
}

fn perform_blocking(request: HttpRequest) -> HttpResponseData {
  let mut builder = reqwest::blocking::Client::builder();
  if !request.verify_tls {
    builder = builder.danger_accept_invalid_certs(true);
  }
  let client = match builder.build() {
    Ok(client) => client,
    Err(e) => return HttpResponseData::from_error(&request.url, e.to_string()),
  };

  let method = reqwest::Method::from_bytes(request.method.as_bytes())
    .unwrap_or(reqwest::Method::GET);
  let mut req = client.request(method, &request.url);
  for (key, value) in request.headers.iter() {
    req = req.header(key, value);
  }
  if let Some(timeout) = request.timeout {
    req = req.timeout(timeout);
  }
  if let Some(body) = request.body.clone() {
    req = req.body(body);
  }

  match req.send() {
    Ok(response) => {
      let status = response.status().as_u16();
      let url = response.url().to_string();
      let headers = fold_headers(response.headers());
      match response.bytes() {
        Ok(bytes) => HttpResponseData {
          ok: (200..300).contains(&status),
          status,
          url,
          headers,
          bytes: bytes.to_vec(),
          error: None,
        },
        Err(e) => HttpResponseData::from_error(&request.url, e.to_string()),
      }
    }
    Err(e) => HttpResponseData::from_error(&request.url, e.to_string()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn fold_headers_lowercases_and_last_wins() {
    let mut headers = reqwest::header::HeaderMap::new();
    headers.append("Content-Type", "text/plain".parse().unwrap());
    headers.append("X-Tag", "one".parse().unwrap());
    headers.append("x-tag", "two".parse().unwrap());

    let folded = fold_headers(&headers);
    assert_eq!(
      folded
        .iter()
        .find(|(k, _)| k == "content-type")
        .map(|(_, v)| v.as_str()),
      Some("text/plain")
    );
    assert_eq!(
      folded
        .iter()
        .find(|(k, _)| k == "x-tag")
        .map(|(_, v)| v.as_str()),
      Some("two")
    );
  }
}
