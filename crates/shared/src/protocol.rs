use serde::{Deserialize, Serialize};

use crate::{
    domain::Notification,
    error::{EnvelopeError, ErrorKind},
};

/// Placeholder target the server emits for "no link".
pub const PLACEHOLDER_TARGET: &str = "#";

/// Returns the target when it is a real link: non-empty and not the placeholder.
pub fn usable_target(target: Option<&str>) -> Option<&str> {
    target
        .map(str::trim)
        .filter(|t| !t.is_empty() && *t != PLACEHOLDER_TARGET)
}

/// Body of the content-fetch endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentEnvelope {
    pub html_content: String,
}

/// Envelope returned by form-submit, delete and mark-read endpoints.
///
/// Two dialects exist on the server: `{"success": bool}` and
/// `{"status": "success" | "error"}`. Both are accepted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_url: Option<String>,
}

impl ActionEnvelope {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: Some(true),
            message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: Some(false),
            message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn with_target_url(mut self, target: impl Into<String>) -> Self {
        self.target_url = Some(target.into());
        self
    }

    pub fn success_flag(&self) -> Option<bool> {
        if let Some(flag) = self.success {
            return Some(flag);
        }
        self.status
            .as_deref()
            .map(|status| status.eq_ignore_ascii_case("success"))
    }

    /// First usable redirect target, in `redirect_url`, `redirect`,
    /// `target_url` order.
    pub fn redirect_target(&self) -> Option<&str> {
        [&self.redirect_url, &self.redirect, &self.target_url]
            .into_iter()
            .find_map(|candidate| usable_target(candidate.as_deref()))
    }

    pub fn interpret(self) -> Result<ActionReply, EnvelopeError> {
        let success = self
            .success_flag()
            .ok_or_else(|| EnvelopeError::validation_gap("envelope has no success indicator"))?;
        let redirect_target = self.redirect_target().map(str::to_string);
        Ok(ActionReply {
            success,
            message: self.message,
            redirect_target,
        })
    }
}

/// An action envelope reduced to what the client acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionReply {
    pub success: bool,
    pub message: Option<String>,
    pub redirect_target: Option<String>,
}

/// Body of the notification list endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationListEnvelope {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(default)]
    pub notifications: Vec<Notification>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A notification list that passed structural checks.
#[derive(Debug, Clone, PartialEq)]
pub struct UnreadSnapshot {
    pub count: u64,
    pub notifications: Vec<Notification>,
}

impl NotificationListEnvelope {
    pub fn into_snapshot(self) -> Result<UnreadSnapshot, EnvelopeError> {
        if !self.success {
            return Err(EnvelopeError::new(
                ErrorKind::ApplicationFailure,
                self.message.unwrap_or_default(),
            ));
        }
        let count = self
            .count
            .ok_or_else(|| EnvelopeError::validation_gap("notification envelope has no count"))?;
        Ok(UnreadSnapshot {
            count,
            notifications: self.notifications,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionOutcome {
    Success,
    Failure,
    TransportError,
}

/// The interpreted result of one submission attempt. Exactly one is produced
/// per attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionResult {
    pub outcome: SubmissionOutcome,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_target: Option<String>,
}

impl SubmissionResult {
    pub fn transport_error(message: impl Into<String>) -> Self {
        Self {
            outcome: SubmissionOutcome::TransportError,
            message: message.into(),
            redirect_target: None,
        }
    }

    /// Builds the result from a response body. Anything that is not a
    /// well-formed envelope is a transport error carrying `retry_message`.
    pub fn from_body(body: &[u8], retry_message: &str) -> Self {
        let reply = serde_json::from_slice::<ActionEnvelope>(body)
            .map_err(|err| EnvelopeError::validation_gap(err.to_string()))
            .and_then(ActionEnvelope::interpret);
        match reply {
            Ok(ActionReply {
                success: true,
                message,
                redirect_target,
            }) => Self {
                outcome: SubmissionOutcome::Success,
                message: message.unwrap_or_default(),
                redirect_target,
            },
            Ok(ActionReply {
                success: false,
                message,
                ..
            }) => Self {
                outcome: SubmissionOutcome::Failure,
                message: message.unwrap_or_default(),
                redirect_target: None,
            },
            Err(_) => Self::transport_error(retry_message),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == SubmissionOutcome::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RETRY: &str = "retry";

    #[test]
    fn status_dialect_is_accepted() {
        let result = SubmissionResult::from_body(br#"{"status":"success","message":"ok"}"#, RETRY);
        assert_eq!(result.outcome, SubmissionOutcome::Success);
        assert_eq!(result.message, "ok");

        let result = SubmissionResult::from_body(br#"{"status":"error","message":"stock"}"#, RETRY);
        assert_eq!(result.outcome, SubmissionOutcome::Failure);
        assert_eq!(result.message, "stock");
    }

    #[test]
    fn missing_indicator_is_a_transport_error() {
        let result = SubmissionResult::from_body(br#"{"message":"?"}"#, RETRY);
        assert_eq!(result, SubmissionResult::transport_error(RETRY));

        let result = SubmissionResult::from_body(b"<html>502</html>", RETRY);
        assert_eq!(result.outcome, SubmissionOutcome::TransportError);
    }

    #[test]
    fn placeholder_redirects_are_ignored() {
        let envelope = ActionEnvelope {
            redirect_url: Some("#".into()),
            target_url: Some("/orders/7".into()),
            ..ActionEnvelope::success("done")
        };
        assert_eq!(envelope.redirect_target(), Some("/orders/7"));
        assert_eq!(usable_target(Some("  ")), None);
    }

    #[test]
    fn notification_envelope_requires_count() {
        let raw = r#"{"success":true,"notifications":[]}"#;
        let envelope: NotificationListEnvelope = serde_json::from_str(raw).unwrap();
        let err = envelope.into_snapshot().unwrap_err();
        assert_eq!(err.kind, ErrorKind::ValidationGap);
    }

    #[test]
    fn notification_accepts_server_field_names() {
        let raw = r#"{
            "success": true,
            "count": 1,
            "notifications": [{
                "id": 7,
                "tipe_pesan": "Pesanan",
                "isi_pesan": "Order shipped",
                "created_at": "2024-03-01T09:30:00+08:00",
                "target_url": "/orders/7"
            }]
        }"#;
        let envelope: NotificationListEnvelope = serde_json::from_str(raw).unwrap();
        let snapshot = envelope.into_snapshot().unwrap();
        assert_eq!(snapshot.count, 1);
        let first = &snapshot.notifications[0];
        assert_eq!(first.category, "Pesanan");
        assert_eq!(first.body, "Order shipped");
        assert!(!first.read);
    }
}
