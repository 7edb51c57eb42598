use shared::{domain::SessionToken, protocol::ContentEnvelope};
use tracing::{debug, info, warn};

use crate::{
    config::SelectorSettings,
    dom::{Document, NodeId, Selector},
    error::{ConsoleError, ConsoleResult},
};

/// `Closed → Loading → Loaded → Submitting → (Closed | LoadedWithError)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModalState {
    Closed,
    Loading,
    Loaded,
    Submitting,
    LoadedWithError,
}

/// State of one open modal. Replaced wholesale on every open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModalSession {
    token: SessionToken,
    state: ModalState,
    source_url: String,
    form_action: Option<String>,
    field_group_counter: u32,
}

impl ModalSession {
    fn new(token: SessionToken, source_url: String) -> Self {
        Self {
            token,
            state: ModalState::Loading,
            source_url,
            form_action: None,
            field_group_counter: 1,
        }
    }

    pub fn token(&self) -> SessionToken {
        self.token
    }

    pub fn state(&self) -> ModalState {
        self.state
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub fn form_action(&self) -> Option<&str> {
        self.form_action.as_deref()
    }

    /// Index the next added field group will receive.
    pub fn field_group_counter(&self) -> u32 {
        self.field_group_counter
    }

    /// Hands out the current group index and advances the counter. Indices
    /// are never reused within one session.
    pub fn issue_group_index(&mut self) -> u32 {
        let index = self.field_group_counter;
        self.field_group_counter += 1;
        index
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadTicket {
    pub token: SessionToken,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitTicket {
    pub token: SessionToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Applied,
    /// The fetch failed and the open was abandoned.
    Abandoned,
    /// A newer open replaced the session this load belonged to.
    Superseded,
}

pub struct ModalController {
    modal: Selector,
    body: Selector,
    title: Selector,
    form: Selector,
    last_token: u64,
    session: Option<ModalSession>,
}

impl ModalController {
    pub fn new(selectors: &SelectorSettings) -> ConsoleResult<Self> {
        Ok(Self {
            modal: Selector::parse(&selectors.modal)?,
            body: Selector::parse(&selectors.modal_body)?,
            title: Selector::parse(&selectors.modal_title)?,
            form: Selector::parse(&selectors.form)?,
            last_token: 0,
            session: None,
        })
    }

    pub fn state(&self) -> ModalState {
        self.session
            .as_ref()
            .map_or(ModalState::Closed, ModalSession::state)
    }

    pub fn session(&self) -> Option<&ModalSession> {
        self.session.as_ref()
    }

    pub fn session_mut(&mut self) -> Option<&mut ModalSession> {
        self.session.as_mut()
    }

    pub fn is_current(&self, token: SessionToken) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| session.token == token)
    }

    pub fn modal_element(&self, doc: &Document) -> Option<NodeId> {
        doc.select_first(doc.root(), &self.modal)
    }

    /// The modal body, or the modal itself when it has no body element.
    pub fn body_element(&self, doc: &Document) -> Option<NodeId> {
        let modal = self.modal_element(doc)?;
        Some(doc.select_first(modal, &self.body).unwrap_or(modal))
    }

    pub fn form_element(&self, doc: &Document) -> Option<NodeId> {
        let body = self.body_element(doc)?;
        doc.select_first(body, &self.form)
    }

    pub fn contains(&self, doc: &Document, node: NodeId) -> bool {
        self.modal_element(doc)
            .is_some_and(|modal| doc.contains(modal, node))
    }

    pub fn is_shown(&self, doc: &Document) -> bool {
        self.modal_element(doc)
            .is_some_and(|modal| doc.has_class(modal, "show") && !doc.is_hidden(modal))
    }

    /// Starts a fresh session: shows the loading indicator and resets the
    /// group counter. Any previous session is superseded.
    pub fn begin_open(
        &mut self,
        doc: &mut Document,
        url: &str,
        title: Option<&str>,
        loading_markup: &str,
    ) -> ConsoleResult<LoadTicket> {
        let modal = self
            .modal_element(doc)
            .ok_or_else(|| ConsoleError::MissingElement(self.modal.to_string()))?;
        if let Some(title) = title {
            if let Some(title_element) = doc.select_first(modal, &self.title) {
                doc.set_text(title_element, title);
            }
        }
        let body = doc.select_first(modal, &self.body).unwrap_or(modal);
        doc.set_inner_html(body, loading_markup);
        doc.add_class(modal, "show");
        doc.show(modal);

        if let Some(previous) = &self.session {
            debug!(
                "modal: superseding session token={} state={:?}",
                previous.token.0, previous.state
            );
        }
        self.last_token += 1;
        let token = SessionToken(self.last_token);
        self.session = Some(ModalSession::new(token, url.to_string()));
        info!("modal: loading token={} url={url}", token.0);
        Ok(LoadTicket {
            token,
            url: url.to_string(),
        })
    }

    /// Applies the content fetch for `ticket`. Stale tickets are discarded
    /// without touching the document.
    pub fn complete_open(
        &mut self,
        doc: &mut Document,
        ticket: &LoadTicket,
        content: Option<ContentEnvelope>,
    ) -> LoadOutcome {
        let is_loading = self
            .session
            .as_ref()
            .is_some_and(|s| s.token == ticket.token && s.state == ModalState::Loading);
        if !is_loading {
            warn!(
                "modal: discarding stale content token={} url={}",
                ticket.token.0, ticket.url
            );
            return LoadOutcome::Superseded;
        }

        let Some(content) = content else {
            warn!("modal: content load failed token={} url={}", ticket.token.0, ticket.url);
            if let Some(body) = self.body_element(doc) {
                doc.clear_children(body);
            }
            self.close(doc);
            return LoadOutcome::Abandoned;
        };

        // Server markup goes in untouched; the server is trusted.
        if let Some(body) = self.body_element(doc) {
            doc.set_inner_html(body, &content.html_content);
        }
        let form_action = self
            .form_element(doc)
            .and_then(|form| doc.attr(form, "action"))
            .map(str::to_string);
        if let Some(session) = self.session.as_mut() {
            session.state = ModalState::Loaded;
            session.form_action = form_action;
        }
        debug!("modal: loaded token={}", ticket.token.0);
        LoadOutcome::Applied
    }

    /// `Loaded | LoadedWithError → Submitting`. A second submit while one is
    /// in flight is rejected.
    pub fn begin_submit(&mut self) -> ConsoleResult<SubmitTicket> {
        let session = self.session.as_mut().ok_or(ConsoleError::NoActiveSession)?;
        match session.state {
            ModalState::Loaded | ModalState::LoadedWithError => {
                session.state = ModalState::Submitting;
                Ok(SubmitTicket {
                    token: session.token,
                })
            }
            ModalState::Submitting => {
                warn!("modal: submit rejected, already submitting token={}", session.token.0);
                Err(ConsoleError::SubmitInFlight)
            }
            state => Err(ConsoleError::InvalidTransition {
                action: "submit",
                state,
            }),
        }
    }

    /// Settles a submission. Returns false when the ticket is stale.
    pub fn complete_submit(&mut self, doc: &mut Document, ticket: SubmitTicket, success: bool) -> bool {
        let submitting = self
            .session
            .as_ref()
            .is_some_and(|s| s.token == ticket.token && s.state == ModalState::Submitting);
        if !submitting {
            warn!("modal: discarding stale submission token={}", ticket.token.0);
            return false;
        }
        if success {
            self.close(doc);
        } else if let Some(session) = self.session.as_mut() {
            session.state = ModalState::LoadedWithError;
        }
        true
    }

    /// Hides the modal and destroys the session, from any state.
    pub fn close(&mut self, doc: &mut Document) {
        if let Some(modal) = self.modal_element(doc) {
            doc.remove_class(modal, "show");
            doc.hide(modal);
        }
        if let Some(session) = self.session.take() {
            debug!("modal: closed token={}", session.token.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<div class="modal" id="transactionModal" style="display: none"><h5 class="modal-title"></h5><div class="modal-body"></div></div>"#;

    fn setup() -> (ModalController, Document) {
        (
            ModalController::new(&SelectorSettings::default()).unwrap(),
            Document::parse(PAGE),
        )
    }

    fn content(html: &str) -> Option<ContentEnvelope> {
        Some(ContentEnvelope {
            html_content: html.to_string(),
        })
    }

    #[test]
    fn open_then_load_reaches_loaded() {
        let (mut modal, mut doc) = setup();
        let ticket = modal
            .begin_open(&mut doc, "/tx/new/", Some("New transaction"), "<p>Loading</p>")
            .unwrap();
        assert_eq!(modal.state(), ModalState::Loading);
        assert!(modal.is_shown(&doc));
        let body = modal.body_element(&doc).unwrap();
        assert_eq!(doc.inner_html(body), "<p>Loading</p>");
        assert_eq!(modal.session().unwrap().field_group_counter(), 1);

        let outcome = modal.complete_open(
            &mut doc,
            &ticket,
            content(r#"<form action="/tx/create/"><input name="qty_0"></form>"#),
        );
        assert_eq!(outcome, LoadOutcome::Applied);
        assert_eq!(modal.state(), ModalState::Loaded);
        assert_eq!(modal.session().unwrap().form_action(), Some("/tx/create/"));
        let title = doc
            .select_first(doc.root(), &Selector::parse(".modal-title").unwrap())
            .unwrap();
        assert_eq!(doc.text_content(title), "New transaction");
    }

    #[test]
    fn failed_load_abandons_open() {
        let (mut modal, mut doc) = setup();
        let ticket = modal.begin_open(&mut doc, "/tx/new/", None, "...").unwrap();
        assert_eq!(modal.complete_open(&mut doc, &ticket, None), LoadOutcome::Abandoned);
        assert_eq!(modal.state(), ModalState::Closed);
        assert!(!modal.is_shown(&doc));
        assert!(doc.children(modal.body_element(&doc).unwrap()).is_empty());
    }

    #[test]
    fn stale_load_is_discarded() {
        let (mut modal, mut doc) = setup();
        let first = modal.begin_open(&mut doc, "/a/", None, "...").unwrap();
        let second = modal.begin_open(&mut doc, "/b/", None, "...").unwrap();
        assert!(second.token > first.token);

        assert_eq!(
            modal.complete_open(&mut doc, &first, content("<p>old</p>")),
            LoadOutcome::Superseded
        );
        let body = modal.body_element(&doc).unwrap();
        assert_eq!(doc.inner_html(body), "...");

        assert_eq!(
            modal.complete_open(&mut doc, &second, content("<p>new</p>")),
            LoadOutcome::Applied
        );
        assert_eq!(doc.inner_html(body), "<p>new</p>");
    }

    #[test]
    fn submit_is_not_reentrant() {
        let (mut modal, mut doc) = setup();
        assert!(matches!(modal.begin_submit(), Err(ConsoleError::NoActiveSession)));

        let ticket = modal.begin_open(&mut doc, "/a/", None, "...").unwrap();
        assert!(matches!(
            modal.begin_submit(),
            Err(ConsoleError::InvalidTransition {
                state: ModalState::Loading,
                ..
            })
        ));
        modal.complete_open(&mut doc, &ticket, content("<form></form>"));

        let submit = modal.begin_submit().unwrap();
        assert!(matches!(modal.begin_submit(), Err(ConsoleError::SubmitInFlight)));

        assert!(modal.complete_submit(&mut doc, submit, false));
        assert_eq!(modal.state(), ModalState::LoadedWithError);

        let retry = modal.begin_submit().unwrap();
        assert!(modal.complete_submit(&mut doc, retry, true));
        assert_eq!(modal.state(), ModalState::Closed);
        assert!(!modal.complete_submit(&mut doc, retry, true));
    }

    #[test]
    fn group_indices_restart_per_session() {
        let (mut modal, mut doc) = setup();
        modal.begin_open(&mut doc, "/a/", None, "...").unwrap();
        let session = modal.session_mut().unwrap();
        assert_eq!(session.issue_group_index(), 1);
        assert_eq!(session.issue_group_index(), 2);

        modal.begin_open(&mut doc, "/a/", None, "...").unwrap();
        assert_eq!(modal.session().unwrap().field_group_counter(), 1);
    }
}
