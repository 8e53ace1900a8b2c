//! Push notification payloads and click routing.
//!
//! The payload is opaque to the proxy: it is rendered and routed, never
//! interpreted. The view→path table belongs to the business layer and
//! arrives as configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Opaque payload delivered by the push transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPayload {
  pub title: String,
  pub body: String,
  #[serde(default)]
  pub icon: Option<String>,
  #[serde(default)]
  pub tag: Option<String>,
  #[serde(default)]
  pub data: Option<NotificationData>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationData {
  #[serde(default)]
  pub url: Option<String>,
  #[serde(default)]
  pub view: Option<String>,
}

/// A notification ready for the host to display, click target resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub tag: String,
  pub target: String,
}

/// Renders payloads and resolves where a click should navigate.
pub struct NotificationBridge {
  view_routes: BTreeMap<String, String>,
  default_icon: String,
  root: String,
}

impl NotificationBridge {
  pub fn new(view_routes: BTreeMap<String, String>, default_icon: String, root: String) -> Self {
    Self {
      view_routes,
      default_icon,
      root,
    }
  }

  /// Click destination: explicit url first, then the view table, then the
  /// application root.
  pub fn resolve_click(&self, payload: &NotificationPayload) -> String {
    if let Some(data) = &payload.data {
      if let Some(url) = &data.url {
        return url.clone();
      }
      if let Some(view) = &data.view {
        if let Some(path) = self.view_routes.get(view) {
          return path.clone();
        }
      }
    }
    self.root.clone()
  }

  pub fn notification(&self, payload: &NotificationPayload) -> Notification {
    Notification {
      title: payload.title.clone(),
      body: payload.body.clone(),
      icon: payload
        .icon
        .clone()
        .unwrap_or_else(|| self.default_icon.clone()),
      tag: payload.tag.clone().unwrap_or_else(|| "holdfast".to_string()),
      target: self.resolve_click(payload),
    }
  }
}
