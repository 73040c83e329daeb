//! Debug channel.
//!
//! A JSON-over-WebSocket control server for test harnesses. Socket threads
//! only parse and enqueue; every command executes on the main thread
//! between frames (the frame loop polls [`DbgServer::poll_requests`]).
//!
//! Requests: `{id, method, params?}` with methods `screenshot`,
//! `keyboard.press`, `waitForFrame`, `evaluate`, `getFrameCount`.
//! Replies: `{id, result}` or `{id, error}`. Events: `frameRendered`,
//! `console`, `exit`.

use crate::prelude::*;

use parking_lot::Mutex;
use serde_json::{json, Value as Json};
use std::net::TcpListener;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;

/// Events pushed to every attached client.
#[derive(Debug, Clone)]
pub enum DbgEvent {
  FrameRendered { frame: u64 },
  Console { level: String, text: String },
  Exit { code: i32 },
}

impl DbgEvent {
  fn to_json(&self) -> Json {
    match self {
      DbgEvent::FrameRendered { frame } => json!({ "event": "frameRendered", "frame": frame }),
      DbgEvent::Console { level, text } => {
        json!({ "event": "console", "level": level, "text": text })
      }
      DbgEvent::Exit { code } => json!({ "event": "exit", "code": code }),
    }
  }
}

/// The fixed command set.
#[derive(Debug, Clone)]
pub enum DbgCommand {
  Screenshot { path: Option<String> },
  KeyboardPress { key: String },
  WaitForFrame { count: u64 },
  Evaluate { expression: String },
  GetFrameCount,
}

/// A parsed request waiting for main-thread execution.
#[derive(Debug)]
pub struct DbgRequest {
  pub connection: u64,
  pub id: Json,
  pub command: DbgCommand,
}

struct Connection {
  id: u64,
  outbound: Sender<String>,
}

/// Parses one request frame into a command.
fn parse_request(connection: u64, text: &str) -> Result<DbgRequest, (Json, String)> {
  let value: Json =
    serde_json::from_str(text).map_err(|e| (Json::Null, format!("invalid JSON: {e}")))?;
  let id = value.get("id").cloned().unwrap_or(Json::Null);
  let method = value
    .get("method")
    .and_then(Json::as_str)
    .ok_or_else(|| (id.clone(), "missing method".to_string()))?;
  let params = value.get("params").cloned().unwrap_or(Json::Null);

  let command = match method {
    "screenshot" => DbgCommand::Screenshot {
      path: params
        .get("path")
        .and_then(Json::as_str)
        .map(|s| s.to_string()),
    },
    "keyboard.press" => DbgCommand::KeyboardPress {
      key: params
        .get("key")
        .and_then(Json::as_str)
        .unwrap_or_default()
        .to_string(),
    },
    "waitForFrame" => DbgCommand::WaitForFrame {
      count: params
        .get("count")
        .and_then(Json::as_u64)
        .or_else(|| params.as_u64())
        .unwrap_or(1),
    },
    "evaluate" => DbgCommand::Evaluate {
      expression: params
        .get("expression")
        .and_then(Json::as_str)
        .or_else(|| params.as_str())
        .unwrap_or_default()
        .to_string(),
    },
    "getFrameCount" => DbgCommand::GetFrameCount,
    other => return Err((id, format!("unknown method {other:?}"))),
  };

  Ok(DbgRequest {
    connection,
    id,
    command,
  })
}

/// The WebSocket control server. Lives on worker threads; the main thread
/// polls requests and pushes replies/events through per-connection queues.
pub struct DbgServer {
  requests: Receiver<DbgRequest>,
  events: Receiver<DbgEvent>,
  events_tx: Sender<DbgEvent>,
  connections: Arc<Mutex<Vec<Connection>>>,
}

impl DbgServer {
  /// Binds `127.0.0.1:port` and starts accepting harness connections.
  pub fn start(port: u16) -> AnyResult<DbgServer> {
    let listener = TcpListener::bind(("127.0.0.1", port))
      .map_err(|e| TheErr::Io(format!("debug channel bind failed: {e}")))?;

    let (requests_tx, requests_rx) = channel::<DbgRequest>();
    let (events_tx, events_rx) = channel::<DbgEvent>();
    let connections: Arc<Mutex<Vec<Connection>>> = Arc::new(Mutex::new(Vec::new()));

    let accept_connections = connections.clone();
    std::thread::Builder::new()
      .name("mystral-dbg-accept".into())
      .spawn(move || {
        static NEXT_CONN: AtomicU64 = AtomicU64::new(1);
        for stream in listener.incoming() {
          let Ok(stream) = stream else { continue };
          let id = NEXT_CONN.fetch_add(1, Ordering::Relaxed);
          let (outbound_tx, outbound_rx) = channel::<String>();
          accept_connections.lock().push(Connection {
            id,
            outbound: outbound_tx,
          });

          let requests_tx = requests_tx.clone();
          let drop_list = accept_connections.clone();
          std::thread::Builder::new()
            .name(format!("mystral-dbg-{id}"))
            .spawn(move || {
              serve_connection(id, stream, requests_tx, outbound_rx);
              drop_list.lock().retain(|c| c.id != id);
            })
            .ok();
        }
      })
      .map_err(|e| TheErr::Io(e.to_string()))?;

    debug!("Debug channel listening on 127.0.0.1:{port}");

    Ok(DbgServer {
      requests: requests_rx,
      events: events_rx,
      events_tx,
      connections,
    })
  }

  /// Sender handed to the runtime so console output reaches clients.
  pub fn event_sender(&self) -> Sender<DbgEvent> {
    self.events_tx.clone()
  }

  /// Commands queued since the last frame.
  pub fn poll_requests(&self) -> Vec<DbgRequest> {
    let mut requests = Vec::new();
    while let Ok(request) = self.requests.try_recv() {
      requests.push(request);
    }
    requests
  }

  pub fn reply(&self, connection: u64, id: Json, result: Result<Json, String>) {
    let payload = match result {
      Ok(result) => json!({ "id": id, "result": result }),
      Err(error) => json!({ "id": id, "error": error }),
    };
    let connections = self.connections.lock();
    if let Some(conn) = connections.iter().find(|c| c.id == connection) {
      let _ = conn.outbound.send(payload.to_string());
    }
  }

  /// Forwards runtime events and broadcasts them to every client.
  pub fn pump_events(&self) {
    while let Ok(event) = self.events.try_recv() {
      self.broadcast(&event);
    }
  }

  pub fn broadcast(&self, event: &DbgEvent) {
    let payload = event.to_json().to_string();
    let connections = self.connections.lock();
    for conn in connections.iter() {
      let _ = conn.outbound.send(payload.clone());
    }
  }

  pub fn has_clients(&self) -> bool {
    !self.connections.lock().is_empty()
  }
}

// One thread per connection: a short read timeout interleaves inbound
// frames with outbound replies/events.
fn serve_connection(
  id: u64,
  stream: std::net::TcpStream,
  requests: Sender<DbgRequest>,
  outbound: Receiver<String>,
) {
  stream
    .set_read_timeout(Some(Duration::from_millis(20)))
    .ok();
  let mut ws = match tungstenite::accept(stream) {
    Ok(ws) => ws,
    Err(e) => {
      warn!("Debug client handshake failed: {e}");
      return;
    }
  };

  loop {
    match ws.read() {
      Ok(tungstenite::Message::Text(text)) => match parse_request(id, text.as_str()) {
        Ok(request) => {
          if requests.send(request).is_err() {
            break;
          }
        }
        Err((request_id, error)) => {
          let payload = json!({ "id": request_id, "error": error }).to_string();
          if ws.send(tungstenite::Message::Text(payload.into())).is_err() {
            break;
          }
        }
      },
      Ok(tungstenite::Message::Close(_)) => break,
      Ok(_) => {}
      Err(tungstenite::Error::Io(e))
        if e.kind() == std::io::ErrorKind::WouldBlock
          || e.kind() == std::io::ErrorKind::TimedOut =>
      {
        // Idle: flush queued replies and events.
        while let Ok(payload) = outbound.try_recv() {
          if ws.send(tungstenite::Message::Text(payload.into())).is_err() {
            return;
          }
        }
      }
      Err(_) => break,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_the_fixed_command_set() {
    let req = parse_request(1, r#"{"id":1,"method":"waitForFrame","params":{"count":3}}"#).unwrap();
    assert!(matches!(req.command, DbgCommand::WaitForFrame { count: 3 }));

    let req = parse_request(1, r#"{"id":2,"method":"evaluate","params":{"expression":"1+1"}}"#)
      .unwrap();
    let DbgCommand::Evaluate { expression } = req.command else {
      panic!("expected evaluate");
    };
    assert_eq!(expression, "1+1");

    let req = parse_request(1, r#"{"id":3,"method":"getFrameCount"}"#).unwrap();
    assert!(matches!(req.command, DbgCommand::GetFrameCount));

    let req =
      parse_request(1, r#"{"id":4,"method":"keyboard.press","params":{"key":"Space"}}"#).unwrap();
    let DbgCommand::KeyboardPress { key } = req.command else {
      panic!("expected keyboard.press");
    };
    assert_eq!(key, "Space");

    let req = parse_request(1, r#"{"id":5,"method":"screenshot"}"#).unwrap();
    assert!(matches!(req.command, DbgCommand::Screenshot { path: None }));
  }

  #[test]
  fn reject_unknown_methods() {
    let err = parse_request(1, r#"{"id":9,"method":"selfDestruct"}"#).unwrap_err();
    assert_eq!(err.0, serde_json::json!(9));
    assert!(err.1.contains("selfDestruct"));
  }

  #[test]
  fn event_payload_shapes() {
    let frame = DbgEvent::FrameRendered { frame: 7 }.to_json();
    assert_eq!(frame["event"], "frameRendered");
    assert_eq!(frame["frame"], 7);

    let exit = DbgEvent::Exit { code: 1 }.to_json();
    assert_eq!(exit["event"], "exit");
    assert_eq!(exit["code"], 1);
  }
}
