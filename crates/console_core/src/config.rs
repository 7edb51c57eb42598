use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub endpoints: EndpointSettings,
    pub selectors: SelectorSettings,
    pub csrf: CsrfSettings,
    pub messages: MessageSettings,
    pub poll_interval_secs: u64,
    pub request_timeout_secs: Option<u64>,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            endpoints: EndpointSettings::default(),
            selectors: SelectorSettings::default(),
            csrf: CsrfSettings::default(),
            messages: MessageSettings::default(),
            poll_interval_secs: 60,
            request_timeout_secs: None,
        }
    }
}

impl ConsoleConfig {
    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        toml::from_str(raw).context("failed to parse console config")
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}

/// Loads the config from a TOML file. Keys absent from the file keep their
/// defaults.
pub fn load_config(path: impl AsRef<Path>) -> anyhow::Result<ConsoleConfig> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read console config {}", path.display()))?;
    ConsoleConfig::from_toml_str(&raw)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EndpointSettings {
    /// Relative URLs are resolved against this base.
    pub base_url: String,
    pub notifications_fetch: String,
    pub notifications_mark_read: String,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000/".into(),
            notifications_fetch: "/api/notifications/fetch/".into(),
            notifications_mark_read: "/api/notifications/mark_read/".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SelectorSettings {
    pub modal: String,
    pub modal_body: String,
    pub modal_title: String,
    pub form: String,
    pub field_group: String,
    pub add_control: String,
    pub remove_control: String,
    pub group_fields: String,
    pub form_error: String,
    pub token_field: String,
    pub notification_badge: String,
    pub notification_view: String,
    pub notification_container: String,
    pub notification_row: String,
    /// Surfaces for status messages, in priority order.
    pub message_surfaces: Vec<String>,
}

impl Default for SelectorSettings {
    fn default() -> Self {
        Self {
            modal: "#transactionModal".into(),
            modal_body: ".modal-body".into(),
            modal_title: ".modal-title".into(),
            form: "form".into(),
            field_group: ".product-item".into(),
            add_control: "#add-product".into(),
            remove_control: ".remove-product".into(),
            group_fields: "select, input".into(),
            form_error: ".alert-danger".into(),
            token_field: "[name=csrfmiddlewaretoken]".into(),
            notification_badge: "#notification-badge".into(),
            notification_view: "#notificationModal".into(),
            notification_container: "#notifications-container".into(),
            notification_row: ".notification-item".into(),
            message_surfaces: vec![
                ".messages-container".into(),
                ".container-fluid, .container".into(),
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CsrfSettings {
    /// Header carrying the token. Empty means the token travels as a field.
    pub header_name: String,
    pub field_name: String,
}

impl Default for CsrfSettings {
    fn default() -> Self {
        Self {
            header_name: "X-CSRFToken".into(),
            field_name: "csrfmiddlewaretoken".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MessageSettings {
    pub loading_markup: String,
    pub load_failed: String,
    pub generic_retry: String,
    pub delete_confirmation: String,
    pub mark_read_failed: String,
    pub notifications_empty: String,
    pub notifications_fetch_failed: String,
    /// Value given to copied non-select fields of a new group.
    pub new_group_default_value: String,
}

impl Default for MessageSettings {
    fn default() -> Self {
        Self {
            loading_markup: r#"<div class="text-center"><div class="spinner-border" role="status"><span class="visually-hidden">Loading...</span></div></div>"#.into(),
            load_failed: "Failed to load the form.".into(),
            generic_retry: "An error occurred. Please try again.".into(),
            delete_confirmation: "Are you sure you want to delete this item?".into(),
            mark_read_failed: "Error marking notification as read".into(),
            notifications_empty: "No new notifications".into(),
            notifications_fetch_failed: "Could not refresh notifications.".into(),
            new_group_default_value: "1".into(),
        }
    }
}
