use shared::{
    domain::HttpMethod,
    protocol::{SubmissionOutcome, SubmissionResult},
};
use tracing::{debug, warn};
use url::Url;

use crate::{
    config::{CsrfSettings, MessageSettings, SelectorSettings},
    dom::{Document, NodeId, Selector},
    error::{ConsoleError, ConsoleResult, TransportError},
    transport::{FormPart, HttpRequest, HttpResponse, RequestBody},
};

const SKIPPED_INPUT_TYPES: &[&str] = &["submit", "button", "reset", "image"];

/// Resolves `raw` against `base`; absolute URLs pass through.
pub fn resolve_url(base: &Url, raw: &str) -> ConsoleResult<String> {
    base.join(raw.trim())
        .map(String::from)
        .map_err(|source| ConsoleError::InvalidUrl {
            url: raw.to_string(),
            source,
        })
}

pub struct AjaxFormSubmitter {
    token_field: Selector,
    form_error: Selector,
    csrf: CsrfSettings,
    retry_message: String,
}

impl AjaxFormSubmitter {
    pub fn new(
        selectors: &SelectorSettings,
        csrf: &CsrfSettings,
        messages: &MessageSettings,
    ) -> ConsoleResult<Self> {
        Ok(Self {
            token_field: Selector::parse(&selectors.token_field)?,
            form_error: Selector::parse(&selectors.form_error)?,
            csrf: csrf.clone(),
            retry_message: messages.generic_retry.clone(),
        })
    }

    pub fn retry_message(&self) -> &str {
        &self.retry_message
    }

    /// Token from the form's own hidden field, else from anywhere on the page.
    pub fn find_token(&self, doc: &Document, scope: NodeId) -> Option<String> {
        doc.select_first(scope, &self.token_field)
            .or_else(|| doc.select_first(doc.root(), &self.token_field))
            .and_then(|field| doc.value(field))
            .filter(|token| !token.is_empty())
    }

    /// Attaches the token as a header when one is configured, otherwise as a
    /// body field (unless the body already carries it).
    pub fn attach_token(&self, request: &mut HttpRequest, token: Option<String>) {
        let Some(token) = token else {
            warn!("submit: no anti-forgery token on page url={}", request.url);
            return;
        };
        if !self.csrf.header_name.is_empty() {
            request.headers.push((self.csrf.header_name.clone(), token));
        } else if request.body.field(&self.csrf.field_name).is_none() {
            request.body.push_text(&self.csrf.field_name, &token);
        }
    }

    /// Serializes the form's successful controls. Any file input switches
    /// the encoding to multipart.
    pub fn serialize(&self, doc: &Document, form: NodeId) -> RequestBody {
        let mut parts = Vec::new();
        let mut has_file_input = false;

        for control in doc.descendants(form) {
            let Some(tag) = doc.tag(control) else {
                continue;
            };
            if !matches!(tag, "input" | "select" | "textarea") {
                continue;
            }
            let Some(name) = doc.attr(control, "name").filter(|n| !n.is_empty()) else {
                continue;
            };
            if doc.attr(control, "disabled").is_some() {
                continue;
            }
            let name = name.to_string();

            if tag == "input" {
                let input_type = doc.input_type(control);
                if SKIPPED_INPUT_TYPES.contains(&input_type.as_str()) {
                    continue;
                }
                if input_type == "file" {
                    has_file_input = true;
                    for file in doc.files(control) {
                        parts.push(FormPart::File {
                            name: name.clone(),
                            filename: file.filename.clone(),
                            mime_type: file.mime_type.clone(),
                            bytes: file.bytes.clone(),
                        });
                    }
                    continue;
                }
                if matches!(input_type.as_str(), "checkbox" | "radio") && !doc.is_checked(control) {
                    continue;
                }
            }
            if let Some(value) = doc.value(control) {
                parts.push(FormPart::Text { name, value });
            }
        }

        if has_file_input {
            return RequestBody::Multipart(parts);
        }
        let pairs: Vec<(String, String)> = parts
            .into_iter()
            .filter_map(|part| match part {
                FormPart::Text { name, value } => Some((name, value)),
                FormPart::File { .. } => None,
            })
            .collect();
        if pairs.is_empty() {
            RequestBody::Empty
        } else {
            RequestBody::Form(pairs)
        }
    }

    /// Builds the request for `form`. The action falls back to
    /// `fallback_action` when the form has none; GET forms are sent as POST
    /// since submissions always change state.
    pub fn build_request(
        &self,
        doc: &Document,
        form: NodeId,
        base: &Url,
        fallback_action: Option<&str>,
    ) -> ConsoleResult<HttpRequest> {
        let action = doc
            .attr(form, "action")
            .filter(|action| !action.trim().is_empty())
            .or(fallback_action)
            .ok_or_else(|| ConsoleError::MissingElement("form[action]".to_string()))?;
        let method = doc
            .attr(form, "method")
            .and_then(HttpMethod::from_attr)
            .filter(|method| *method != HttpMethod::Get)
            .unwrap_or(HttpMethod::Post);

        let mut request = HttpRequest {
            method,
            url: resolve_url(base, action)?,
            headers: Vec::new(),
            body: self.serialize(doc, form),
        };
        self.attach_token(&mut request, self.find_token(doc, form));
        debug!(
            "submit: prepared method={} url={}",
            request.method.as_str(),
            request.url
        );
        Ok(request)
    }

    /// POST request for a standalone delete action.
    pub fn build_delete_request(&self, doc: &Document, base: &Url, url: &str) -> ConsoleResult<HttpRequest> {
        let mut request = HttpRequest::post(resolve_url(base, url)?, RequestBody::Empty);
        self.attach_token(&mut request, self.find_token(doc, doc.root()));
        Ok(request)
    }

    /// Turns a response (or transport failure) into exactly one result.
    pub fn interpret(&self, response: Result<HttpResponse, TransportError>) -> SubmissionResult {
        match response {
            Ok(response) => {
                let result = SubmissionResult::from_body(&response.body, &self.retry_message);
                if result.outcome == SubmissionOutcome::TransportError {
                    warn!(
                        "submit: response is not a usable envelope status={}",
                        response.status
                    );
                }
                result
            }
            Err(err) => {
                warn!("submit: transport failure: {err}");
                SubmissionResult::transport_error(&self.retry_message)
            }
        }
    }

    /// Replaces any previous inline error in `form` with `message`.
    pub fn show_form_error(&self, doc: &mut Document, form: NodeId, message: &str) -> NodeId {
        self.clear_form_errors(doc, form);
        let alert = doc.create_element("div");
        doc.set_attr(alert, "class", "alert alert-danger");
        let text = doc.create_text(message);
        doc.append_child(alert, text);
        doc.prepend_child(form, alert);
        alert
    }

    pub fn clear_form_errors(&self, doc: &mut Document, form: NodeId) {
        for existing in doc.select_all(form, &self.form_error) {
            doc.remove(existing);
        }
    }
}
