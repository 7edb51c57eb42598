use std::{collections::HashSet, future::Future, sync::Arc};

use shared::{
    domain::{HandlerId, NotificationId, PostSuccessAction, SessionToken, Severity},
    error::{EnvelopeError, ErrorKind},
    protocol::{
        ActionEnvelope, ContentEnvelope, NotificationListEnvelope, SubmissionOutcome,
        SubmissionResult,
    },
};
use tokio::{
    sync::broadcast,
    time::{Interval, MissedTickBehavior},
};
use tracing::{debug, info, warn};
use url::Url;

pub mod actions;
pub mod config;
pub mod dom;
pub mod error;
pub mod field_groups;
pub mod host;
pub mod message_bus;
pub mod modal;
pub mod notifications;
pub mod submitter;
pub mod transport;

pub use actions::{ActionRegistry, SuccessHandler};
pub use config::{load_config, ConsoleConfig};
pub use dom::{Document, FileBlob, NodeId, Selector};
pub use error::{ConsoleError, ConsoleResult, TransportError};
pub use field_groups::{FieldGroup, FieldGroupManager};
pub use host::{HeadlessHost, PageEffect, PageHost};
pub use message_bus::{MessageBus, MessageHandle};
pub use modal::{LoadOutcome, LoadTicket, ModalController, ModalSession, ModalState};
pub use notifications::NotificationPoller;
pub use submitter::AjaxFormSubmitter;
pub use transport::{
    FormPart, HttpRequest, HttpResponse, HttpTransport, MissingTransport, RequestBody,
    ReqwestTransport,
};

#[derive(Debug, Clone)]
pub enum ConsoleEvent {
    ModalStateChanged(ModalState),
    ContentDiscarded { token: SessionToken },
    SubmissionCompleted(SubmissionResult),
    NotificationsUpdated { unread: u64 },
}

/// A submission whose request has been prepared but not yet answered.
#[derive(Debug, Clone)]
pub struct PendingSubmit {
    form: NodeId,
    ticket: Option<modal::SubmitTicket>,
    request: HttpRequest,
}

impl PendingSubmit {
    pub fn request(&self) -> &HttpRequest {
        &self.request
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    Cancelled,
    Completed(SubmissionResult),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Updated { unread: u64 },
    Failed(ErrorKind),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkReadOutcome {
    Read { navigated_to: Option<String> },
    Failed(ErrorKind),
}

/// What a delegated click resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickOutcome {
    GroupAdded(NodeId),
    GroupRemoved(bool),
    Notification(MarkReadOutcome),
    Ignored,
}

/// Owns the page document and drives every console interaction against it.
///
/// All operations take `&mut self`; nothing here runs in parallel and the
/// only suspension points are HTTP round trips.
pub struct Console {
    config: ConsoleConfig,
    base_url: Url,
    document: Document,
    transport: Arc<dyn HttpTransport>,
    host: Arc<dyn PageHost>,
    modal: ModalController,
    groups: FieldGroupManager,
    submitter: AjaxFormSubmitter,
    notifications: NotificationPoller,
    messages: MessageBus,
    actions: ActionRegistry,
    in_flight_forms: HashSet<NodeId>,
    events: broadcast::Sender<ConsoleEvent>,
}

impl Console {
    pub fn new(
        config: ConsoleConfig,
        document: Document,
        transport: Arc<dyn HttpTransport>,
        host: Arc<dyn PageHost>,
    ) -> ConsoleResult<Self> {
        let base_url =
            Url::parse(&config.endpoints.base_url).map_err(|source| ConsoleError::InvalidUrl {
                url: config.endpoints.base_url.clone(),
                source,
            })?;
        let selectors = &config.selectors;
        let surfaces = selectors
            .message_surfaces
            .iter()
            .map(|raw| Selector::parse(raw))
            .collect::<Result<Vec<_>, _>>()?;
        let mut messages = MessageBus::new(surfaces);
        messages.attach(&document);

        let (events, _) = broadcast::channel(256);
        Ok(Self {
            modal: ModalController::new(selectors)?,
            groups: FieldGroupManager::new(selectors, &config.messages)?,
            submitter: AjaxFormSubmitter::new(selectors, &config.csrf, &config.messages)?,
            notifications: NotificationPoller::new(
                selectors,
                &config.endpoints,
                &config.messages,
            )?,
            messages,
            actions: ActionRegistry::new(),
            in_flight_forms: HashSet::new(),
            events,
            base_url,
            document,
            transport,
            host,
            config,
        })
    }

    /// Console over the reqwest transport, honouring the configured timeout.
    pub fn with_reqwest(
        config: ConsoleConfig,
        document: Document,
        host: Arc<dyn PageHost>,
    ) -> anyhow::Result<Self> {
        let transport = ReqwestTransport::with_timeout(config.request_timeout())?;
        Ok(Self::new(config, document, Arc::new(transport), host)?)
    }

    pub fn config(&self) -> &ConsoleConfig {
        &self.config
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn document_mut(&mut self) -> &mut Document {
        &mut self.document
    }

    pub fn modal(&self) -> &ModalController {
        &self.modal
    }

    pub fn modal_state(&self) -> ModalState {
        self.modal.state()
    }

    pub fn notifications(&self) -> &NotificationPoller {
        &self.notifications
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConsoleEvent> {
        self.events.subscribe()
    }

    pub fn register_handler(&mut self, id: HandlerId, handler: Arc<dyn SuccessHandler>) {
        self.actions.register(id, handler);
    }

    fn emit(&self, event: ConsoleEvent) {
        let _ = self.events.send(event);
    }

    // ---- messages ----

    pub fn show_message(&mut self, message: &str, severity: Severity) -> MessageHandle {
        self.messages.show(&mut self.document, message, severity)
    }

    pub fn dismiss_message(&mut self, handle: MessageHandle) -> bool {
        self.messages.dismiss(&mut self.document, handle)
    }

    pub fn visible_messages(&mut self) -> Vec<String> {
        self.messages.visible(&self.document)
    }

    // ---- modal ----

    pub fn begin_open_modal(&mut self, url: &str, title: Option<&str>) -> ConsoleResult<LoadTicket> {
        let resolved = submitter::resolve_url(&self.base_url, url)?;
        let ticket = self.modal.begin_open(
            &mut self.document,
            &resolved,
            title,
            &self.config.messages.loading_markup,
        )?;
        self.emit(ConsoleEvent::ModalStateChanged(ModalState::Loading));
        Ok(ticket)
    }

    /// Applies the content-fetch response for `ticket`, unless a newer open
    /// has superseded it.
    pub fn complete_open_modal(
        &mut self,
        ticket: &LoadTicket,
        response: Result<HttpResponse, TransportError>,
    ) -> LoadOutcome {
        if !self.modal.is_current(ticket.token) {
            warn!("console: dropping content for superseded token={}", ticket.token.0);
            self.emit(ConsoleEvent::ContentDiscarded {
                token: ticket.token,
            });
            return LoadOutcome::Superseded;
        }

        let content = match response {
            Ok(response) => serde_json::from_slice::<ContentEnvelope>(&response.body)
                .map_err(|err| {
                    warn!(
                        "console: content envelope unusable status={} err={err}",
                        response.status
                    );
                })
                .ok(),
            Err(err) => {
                warn!("console: content fetch failed url={} err={err}", ticket.url);
                None
            }
        };

        let outcome = self.modal.complete_open(&mut self.document, ticket, content);
        match outcome {
            LoadOutcome::Applied => {
                self.emit(ConsoleEvent::ModalStateChanged(ModalState::Loaded));
            }
            LoadOutcome::Abandoned => {
                self.host.alert(&self.config.messages.load_failed);
                self.emit(ConsoleEvent::ModalStateChanged(ModalState::Closed));
            }
            LoadOutcome::Superseded => self.emit(ConsoleEvent::ContentDiscarded {
                token: ticket.token,
            }),
        }
        outcome
    }

    pub async fn open_modal(&mut self, url: &str, title: Option<&str>) -> ConsoleResult<LoadOutcome> {
        let ticket = self.begin_open_modal(url, title)?;
        let response = self.transport.send(HttpRequest::get(ticket.url.clone())).await;
        Ok(self.complete_open_modal(&ticket, response))
    }

    pub fn close_modal(&mut self) {
        self.modal.close(&mut self.document);
        self.emit(ConsoleEvent::ModalStateChanged(ModalState::Closed));
    }

    // ---- field groups ----

    fn modal_scope(&self) -> ConsoleResult<NodeId> {
        if self.modal.session().is_none() {
            return Err(ConsoleError::NoActiveSession);
        }
        self.modal
            .body_element(&self.document)
            .ok_or_else(|| ConsoleError::MissingElement(self.config.selectors.modal.clone()))
    }

    pub fn add_group(&mut self) -> ConsoleResult<NodeId> {
        let scope = self.modal_scope()?;
        let session = self
            .modal
            .session_mut()
            .ok_or(ConsoleError::NoActiveSession)?;
        self.groups.add_group(&mut self.document, session, scope)
    }

    /// Removes the group holding `target` (typically its remove control).
    pub fn remove_group(&mut self, target: NodeId) -> ConsoleResult<bool> {
        let scope = self.modal_scope()?;
        Ok(self.groups.remove_group(&mut self.document, scope, target))
    }

    pub fn field_groups(&self) -> ConsoleResult<Vec<FieldGroup>> {
        let scope = self.modal_scope()?;
        Ok(self.groups.groups(&self.document, scope))
    }

    // ---- submission ----

    /// Prepares a submission of `form`. Rejects a form that already has a
    /// submission in flight.
    pub fn begin_submit(&mut self, form: NodeId) -> ConsoleResult<PendingSubmit> {
        let in_modal = self.modal.contains(&self.document, form) && self.modal.session().is_some();
        if !in_modal && self.in_flight_forms.contains(&form) {
            warn!("console: submit rejected, form already in flight form={form}");
            return Err(ConsoleError::SubmitInFlight);
        }
        let fallback = if in_modal {
            self.modal.session().map(|s| s.source_url().to_string())
        } else {
            None
        };
        let request =
            self.submitter
                .build_request(&self.document, form, &self.base_url, fallback.as_deref())?;

        let ticket = if in_modal {
            let ticket = self.modal.begin_submit()?;
            self.emit(ConsoleEvent::ModalStateChanged(ModalState::Submitting));
            Some(ticket)
        } else {
            None
        };
        self.in_flight_forms.insert(form);
        Ok(PendingSubmit {
            form,
            ticket,
            request,
        })
    }

    pub fn complete_submit(
        &mut self,
        pending: PendingSubmit,
        response: Result<HttpResponse, TransportError>,
        action: &PostSuccessAction,
    ) -> SubmissionResult {
        let result = self.submitter.interpret(response);
        self.in_flight_forms.remove(&pending.form);

        if let Some(ticket) = pending.ticket {
            if !self
                .modal
                .complete_submit(&mut self.document, ticket, result.is_success())
            {
                self.emit(ConsoleEvent::SubmissionCompleted(result.clone()));
                return result;
            }
            self.emit(ConsoleEvent::ModalStateChanged(self.modal.state()));
        }

        match result.outcome {
            SubmissionOutcome::Success => {
                info!("console: submission succeeded url={}", pending.request.url);
                self.submitter
                    .clear_form_errors(&mut self.document, pending.form);
                if !result.message.is_empty() {
                    self.show_message(&result.message, Severity::Success);
                }
                self.run_post_success(action, &result);
            }
            SubmissionOutcome::Failure | SubmissionOutcome::TransportError => {
                debug!(
                    "console: submission failed outcome={:?} url={}",
                    result.outcome, pending.request.url
                );
                self.submitter
                    .show_form_error(&mut self.document, pending.form, &result.message);
            }
        }
        self.emit(ConsoleEvent::SubmissionCompleted(result.clone()));
        result
    }

    pub async fn submit_form(
        &mut self,
        form: NodeId,
        action: PostSuccessAction,
    ) -> ConsoleResult<SubmissionResult> {
        let pending = self.begin_submit(form)?;
        let response = self.transport.send(pending.request.clone()).await;
        Ok(self.complete_submit(pending, response, &action))
    }

    /// Submits the form inside the open modal.
    pub async fn submit_modal_form(
        &mut self,
        action: PostSuccessAction,
    ) -> ConsoleResult<SubmissionResult> {
        if self.modal.session().is_none() {
            return Err(ConsoleError::NoActiveSession);
        }
        let form = self
            .modal
            .form_element(&self.document)
            .ok_or_else(|| ConsoleError::MissingElement(self.config.selectors.form.clone()))?;
        self.submit_form(form, action).await
    }

    fn run_post_success(&self, action: &PostSuccessAction, result: &SubmissionResult) {
        if let Err(err) = self.actions.run(action, result, self.host.as_ref()) {
            warn!("console: post-success action failed, reloading: {err}");
            self.host.reload();
        }
    }

    /// Confirms with the user, then posts to a delete endpoint. Outcomes are
    /// reported through the message bus.
    pub async fn delete(
        &mut self,
        url: &str,
        action: PostSuccessAction,
    ) -> ConsoleResult<DeleteOutcome> {
        if !self.host.confirm(&self.config.messages.delete_confirmation) {
            debug!("console: delete cancelled url={url}");
            return Ok(DeleteOutcome::Cancelled);
        }
        let request = self
            .submitter
            .build_delete_request(&self.document, &self.base_url, url)?;
        let response = self.transport.send(request).await;
        let result = self.submitter.interpret(response);
        match result.outcome {
            SubmissionOutcome::Success => {
                if !result.message.is_empty() {
                    self.show_message(&result.message, Severity::Success);
                }
                self.run_post_success(&action, &result);
            }
            SubmissionOutcome::Failure | SubmissionOutcome::TransportError => {
                self.show_message(&result.message, Severity::Danger);
            }
        }
        self.emit(ConsoleEvent::SubmissionCompleted(result.clone()));
        Ok(DeleteOutcome::Completed(result))
    }

    // ---- notifications ----

    pub async fn fetch_unread(&mut self) -> ConsoleResult<FetchOutcome> {
        let request = self.notifications.fetch_request(&self.base_url)?;
        let snapshot = match self.transport.send(request).await {
            Ok(response) => serde_json::from_slice::<NotificationListEnvelope>(&response.body)
                .map_err(|err| EnvelopeError::validation_gap(err.to_string()))
                .and_then(NotificationListEnvelope::into_snapshot),
            Err(err) => Err(EnvelopeError::new(ErrorKind::Transport, err.to_string())),
        };

        match snapshot {
            Ok(snapshot) => {
                self.notifications
                    .apply_snapshot(&mut self.document, snapshot);
                let unread = self.notifications.unread_count();
                self.emit(ConsoleEvent::NotificationsUpdated { unread });
                Ok(FetchOutcome::Updated { unread })
            }
            Err(err) => {
                let kind = err.kind.user_facing();
                warn!("console: notification fetch failed kind={:?} detail={}", err.kind, err.message);
                let message = match kind {
                    ErrorKind::ApplicationFailure if !err.message.is_empty() => err.message,
                    _ => self.config.messages.notifications_fetch_failed.clone(),
                };
                self.show_message(&message, Severity::Warning);
                Ok(FetchOutcome::Failed(kind))
            }
        }
    }

    /// Shows the list view and refreshes it.
    pub async fn open_notifications(&mut self) -> ConsoleResult<FetchOutcome> {
        self.notifications.open_view(&mut self.document);
        self.fetch_unread().await
    }

    pub fn close_notifications(&mut self) {
        self.notifications.close_view(&mut self.document);
    }

    pub async fn mark_read(
        &mut self,
        id: NotificationId,
        target_url: &str,
    ) -> ConsoleResult<MarkReadOutcome> {
        let mut request = self.notifications.mark_read_request(&self.base_url, id)?;
        let token = self.submitter.find_token(&self.document, self.document.root());
        self.submitter.attach_token(&mut request, token);

        let reply = match self.transport.send(request).await {
            Ok(response) => serde_json::from_slice::<ActionEnvelope>(&response.body)
                .map_err(|err| EnvelopeError::validation_gap(err.to_string()))
                .and_then(ActionEnvelope::interpret),
            Err(err) => Err(EnvelopeError::new(ErrorKind::Transport, err.to_string())),
        };

        match reply {
            Ok(reply) if reply.success => {
                self.notifications.confirm_read(id);
                self.notifications.close_view(&mut self.document);
                let navigated_to =
                    notifications::navigation_target(target_url, reply.redirect_target.as_deref());
                if let Some(target) = &navigated_to {
                    self.host.navigate(target);
                }
                info!("console: notification read id={id}");
                self.fetch_unread().await?;
                Ok(MarkReadOutcome::Read { navigated_to })
            }
            Ok(reply) => {
                let message = reply
                    .message
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| self.config.messages.mark_read_failed.clone());
                self.show_message(&message, Severity::Danger);
                Ok(MarkReadOutcome::Failed(ErrorKind::ApplicationFailure))
            }
            Err(err) => {
                warn!("console: mark read failed id={id} detail={}", err.message);
                let message = self.config.messages.generic_retry.clone();
                self.show_message(&message, Severity::Danger);
                Ok(MarkReadOutcome::Failed(err.kind.user_facing()))
            }
        }
    }

    /// Dispatches a click on a rendered notification row.
    pub async fn click_notification(&mut self, node: NodeId) -> ConsoleResult<MarkReadOutcome> {
        let (id, target) = self
            .notifications
            .row_target(&self.document, node)
            .ok_or_else(|| {
                ConsoleError::MissingElement(self.config.selectors.notification_row.clone())
            })?;
        self.mark_read(id, &target).await
    }

    /// Routes a click on `node` the way the page's delegated handlers do:
    /// add and remove controls inside the modal, then notification rows.
    pub async fn click(&mut self, node: NodeId) -> ConsoleResult<ClickOutcome> {
        if self.modal.contains(&self.document, node) && self.modal.session().is_some() {
            if self.groups.is_add_control(&self.document, node) {
                return Ok(ClickOutcome::GroupAdded(self.add_group()?));
            }
            if self.groups.is_remove_control(&self.document, node) {
                return Ok(ClickOutcome::GroupRemoved(self.remove_group(node)?));
            }
        }
        if self
            .notifications
            .row_target(&self.document, node)
            .is_some()
        {
            return Ok(ClickOutcome::Notification(self.click_notification(node).await?));
        }
        Ok(ClickOutcome::Ignored)
    }

    /// Ticker on the configured poll interval. The first tick completes
    /// immediately and missed ticks are skipped.
    ///
    /// Hosts that keep handling user operations while polling select on
    /// `tick()` next to their own events and call [`Console::fetch_unread`]
    /// when it fires.
    pub fn poll_ticker(&self) -> Interval {
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker
    }

    /// Refreshes notifications on [`Console::poll_ticker`] until `shutdown`
    /// resolves. Holds the console for the whole run, so nothing else can
    /// operate on it meanwhile.
    pub async fn poll_notifications<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut ticker = self.poll_ticker();
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.fetch_unread().await {
                        warn!("console: notification poll failed: {err}");
                    }
                }
            }
        }
        debug!("console: notification polling stopped");
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

#[cfg(test)]
#[path = "tests/field_group_properties.rs"]
mod field_group_properties;
