//! Proxy events and the host bridge.
//!
//! The host application talks to the proxy over stdio: one JSON object per
//! line in, one per line out. Inbound lines become typed [`Event`]s on an
//! unbounded channel; fetch events carry a oneshot channel whose answer is
//! forwarded back to the host as a `response` line. Logs never touch stdout,
//! it belongs to the protocol.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::commands::{self, ControlCommand};
use crate::net::{HttpRequest, HttpResponse};
use crate::notify::{Notification, NotificationPayload};

/// Proxy events
#[derive(Debug)]
pub enum Event {
  /// An intercepted request, with a channel for its response
  Fetch {
    request: HttpRequest,
    reply: oneshot::Sender<HttpResponse>,
  },
  /// A control-channel command from the host
  Control(ControlCommand),
  /// An opaque push payload to display
  Push(NotificationPayload),
  /// The host's connectivity watcher reports the network is back
  ConnectivityRestored,
  /// Stop the event loop
  Shutdown,
}

/// Inbound message on the host bridge.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HostMessage {
  Fetch {
    id: u64,
    request: HttpRequest,
  },
  Command {
    command: String,
    #[serde(default)]
    urls: Vec<String>,
  },
  Push {
    payload: NotificationPayload,
  },
  Online,
  Shutdown,
}

/// Outbound message to the host.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HostReply {
  Response { id: u64, response: HttpResponse },
  Notification { notification: Notification },
  Replayed { replayed: usize, remaining: usize },
  Error { message: String },
}

/// Event handler that produces proxy events from host messages on stdin and
/// writes replies to stdout.
pub struct HostBridge {
  events: mpsc::UnboundedReceiver<Event>,
  replies: mpsc::UnboundedSender<HostReply>,
}

impl HostBridge {
  /// Spawn the stdin reader and stdout writer tasks.
  pub fn new() -> Self {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<HostReply>();

    // Writer: serializes replies onto stdout, one line each.
    tokio::spawn(async move {
      let mut stdout = tokio::io::stdout();
      while let Some(reply) = reply_rx.recv().await {
        let Ok(mut line) = serde_json::to_string(&reply) else {
          continue;
        };
        line.push('\n');
        if stdout.write_all(line.as_bytes()).await.is_err() {
          break;
        }
        let _ = stdout.flush().await;
      }
    });

    // Reader: parses host messages and dispatches them as events.
    let replies = reply_tx.clone();
    tokio::spawn(async move {
      let mut lines = BufReader::new(tokio::io::stdin()).lines();
      loop {
        match lines.next_line().await {
          Ok(Some(line)) => {
            let line = line.trim();
            if line.is_empty() {
              continue;
            }
            match serde_json::from_str::<HostMessage>(line) {
              Ok(message) => {
                if dispatch(message, &event_tx, &replies).is_err() {
                  break;
                }
              }
              Err(error) => {
                debug!(%error, "unparseable host message");
                let _ = replies.send(HostReply::Error {
                  message: format!("bad message: {}", error),
                });
              }
            }
          }
          // EOF or a broken pipe: the host is gone.
          Ok(None) | Err(_) => {
            let _ = event_tx.send(Event::Shutdown);
            break;
          }
        }
      }
    });

    Self {
      events: event_rx,
      replies: reply_tx,
    }
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.events.recv().await
  }

  pub fn replies(&self) -> mpsc::UnboundedSender<HostReply> {
    self.replies.clone()
  }
}

impl Default for HostBridge {
  fn default() -> Self {
    Self::new()
  }
}

/// Turn one host message into an event. Fetch replies are forwarded to the
/// writer by a small relay task holding the oneshot receiver.
fn dispatch(
  message: HostMessage,
  events: &mpsc::UnboundedSender<Event>,
  replies: &mpsc::UnboundedSender<HostReply>,
) -> Result<(), mpsc::error::SendError<Event>> {
  match message {
    HostMessage::Fetch { id, request } => {
      let (tx, rx) = oneshot::channel();
      let replies = replies.clone();
      tokio::spawn(async move {
        if let Ok(response) = rx.await {
          let _ = replies.send(HostReply::Response { id, response });
        }
      });
      events.send(Event::Fetch { request, reply: tx })
    }
    HostMessage::Command { command, urls } => match commands::parse(&command, &urls) {
      Some(parsed) => events.send(Event::Control(parsed)),
      None => {
        let _ = replies.send(HostReply::Error {
          message: format!(
            "unknown command: {}; available: {}",
            command,
            commands::available()
          ),
        });
        Ok(())
      }
    },
    HostMessage::Push { payload } => events.send(Event::Push(payload)),
    HostMessage::Online => events.send(Event::ConnectivityRestored),
    HostMessage::Shutdown => events.send(Event::Shutdown),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::BTreeMap;

  #[test]
  fn test_host_message_wire_shapes() {
    let fetch: HostMessage = serde_json::from_str(
      r#"{"type":"fetch","id":7,"request":{"method":"GET","url":"/api/listings"}}"#,
    )
    .unwrap();
    match fetch {
      HostMessage::Fetch { id, request } => {
        assert_eq!(id, 7);
        assert_eq!(request.method, "GET");
        assert_eq!(request.url, "/api/listings");
        assert!(request.body.is_none());
      }
      other => panic!("parsed as {:?}", other),
    }

    let command: HostMessage = serde_json::from_str(
      r#"{"type":"command","command":"pre-cache","urls":["/","/assets/app.js"]}"#,
    )
    .unwrap();
    match command {
      HostMessage::Command { command, urls } => {
        assert_eq!(command, "pre-cache");
        assert_eq!(urls.len(), 2);
      }
      other => panic!("parsed as {:?}", other),
    }

    assert!(matches!(
      serde_json::from_str::<HostMessage>(r#"{"type":"online"}"#).unwrap(),
      HostMessage::Online
    ));
  }

  #[test]
  fn test_host_reply_is_tagged() {
    let reply = HostReply::Replayed {
      replayed: 2,
      remaining: 1,
    };
    let line = serde_json::to_string(&reply).unwrap();
    let value: serde_json::Value = serde_json::from_str(&line).unwrap();
    assert_eq!(value["type"], "replayed");
    assert_eq!(value["replayed"], 2);
  }

  #[tokio::test]
  async fn test_dispatch_fetch_relays_the_response() {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();

    let message = HostMessage::Fetch {
      id: 3,
      request: HttpRequest::get("/api/x"),
    };
    dispatch(message, &event_tx, &reply_tx).unwrap();

    let Some(Event::Fetch { request, reply }) = event_rx.recv().await else {
      panic!("expected a fetch event");
    };
    assert_eq!(request.url, "/api/x");

    reply
      .send(HttpResponse {
        status: 200,
        headers: BTreeMap::new(),
        body: b"ok".to_vec(),
      })
      .unwrap();

    match reply_rx.recv().await {
      Some(HostReply::Response { id, response }) => {
        assert_eq!(id, 3);
        assert_eq!(response.body, b"ok");
      }
      other => panic!("got {:?}", other),
    }
  }

  #[test]
  fn test_unknown_command_becomes_an_error_reply() {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();

    dispatch(
      HostMessage::Command {
        command: "reboot".to_string(),
        urls: Vec::new(),
      },
      &event_tx,
      &reply_tx,
    )
    .unwrap();

    assert!(event_rx.try_recv().is_err());
    assert!(matches!(reply_rx.try_recv(), Ok(HostReply::Error { .. })));
  }
}
