use shared::{
    domain::{Notification, NotificationId},
    protocol::{usable_target, UnreadSnapshot, PLACEHOLDER_TARGET},
};
use tracing::debug;
use url::Url;

use crate::{
    config::{EndpointSettings, MessageSettings, SelectorSettings},
    dom::{Document, NodeId, Selector},
    error::ConsoleResult,
    submitter::resolve_url,
    transport::{HttpRequest, RequestBody},
};

const TIME_FORMAT: &str = "%d %b %Y %H:%M";

/// Where to go after a notification was marked read: the clicked target if
/// it is a real link, otherwise the server's.
pub fn navigation_target(clicked: &str, server: Option<&str>) -> Option<String> {
    usable_target(Some(clicked))
        .or_else(|| usable_target(server))
        .map(str::to_string)
}

pub struct NotificationPoller {
    badge: Selector,
    view: Selector,
    container: Selector,
    row: Selector,
    fetch_path: String,
    mark_read_path: String,
    empty_message: String,
    cache: Vec<Notification>,
    unread_count: u64,
}

impl NotificationPoller {
    pub fn new(
        selectors: &SelectorSettings,
        endpoints: &EndpointSettings,
        messages: &MessageSettings,
    ) -> ConsoleResult<Self> {
        Ok(Self {
            badge: Selector::parse(&selectors.notification_badge)?,
            view: Selector::parse(&selectors.notification_view)?,
            container: Selector::parse(&selectors.notification_container)?,
            row: Selector::parse(&selectors.notification_row)?,
            fetch_path: endpoints.notifications_fetch.clone(),
            mark_read_path: endpoints.notifications_mark_read.clone(),
            empty_message: messages.notifications_empty.clone(),
            cache: Vec::new(),
            unread_count: 0,
        })
    }

    pub fn cached(&self) -> &[Notification] {
        &self.cache
    }

    pub fn unread_count(&self) -> u64 {
        self.unread_count
    }

    pub fn fetch_request(&self, base: &Url) -> ConsoleResult<HttpRequest> {
        Ok(HttpRequest::get(resolve_url(base, &self.fetch_path)?))
    }

    /// Mark-read request; the anti-forgery token is attached by the caller.
    pub fn mark_read_request(&self, base: &Url, id: NotificationId) -> ConsoleResult<HttpRequest> {
        Ok(HttpRequest::post(
            resolve_url(base, &self.mark_read_path)?,
            RequestBody::Form(vec![("id".to_string(), id.to_string())]),
        ))
    }

    pub fn view_element(&self, doc: &Document) -> Option<NodeId> {
        doc.select_first(doc.root(), &self.view)
    }

    pub fn is_view_visible(&self, doc: &Document) -> bool {
        self.view_element(doc)
            .is_some_and(|view| doc.has_class(view, "show") && !doc.is_hidden(view))
    }

    pub fn open_view(&self, doc: &mut Document) {
        if let Some(view) = self.view_element(doc) {
            doc.add_class(view, "show");
            doc.show(view);
        }
    }

    pub fn close_view(&self, doc: &mut Document) {
        if let Some(view) = self.view_element(doc) {
            doc.remove_class(view, "show");
            doc.hide(view);
        }
    }

    /// Applies a fresh snapshot: the cache is replaced, the badge updated,
    /// and the list re-rendered only while the view is visible.
    pub fn apply_snapshot(&mut self, doc: &mut Document, snapshot: UnreadSnapshot) {
        self.unread_count = snapshot.count;
        self.cache = snapshot.notifications;
        self.update_badge(doc);
        if self.is_view_visible(doc) {
            self.render(doc);
        }
        debug!(
            "notifications: refreshed unread={} cached={}",
            self.unread_count,
            self.cache.len()
        );
    }

    fn update_badge(&self, doc: &mut Document) {
        let Some(badge) = doc.select_first(doc.root(), &self.badge) else {
            return;
        };
        if self.unread_count == 0 {
            doc.hide(badge);
        } else {
            doc.set_text(badge, &self.unread_count.to_string());
            doc.show(badge);
        }
    }

    /// Marks a cached entry read once the server has confirmed it.
    pub fn confirm_read(&mut self, id: NotificationId) {
        if let Some(notification) = self.cache.iter_mut().find(|n| n.id == id) {
            notification.read = true;
        }
    }

    pub fn render(&self, doc: &mut Document) {
        let Some(container) = doc.select_first(doc.root(), &self.container) else {
            return;
        };
        doc.clear_children(container);

        if self.cache.is_empty() {
            let empty = element(doc, "p", "text-center text-muted");
            doc.set_text(empty, &self.empty_message);
            doc.append_child(container, empty);
            return;
        }

        for notification in &self.cache {
            let row = element(doc, "div", "notification-item");
            doc.set_attr(row, "data-notification-id", &notification.id.to_string());
            doc.set_attr(
                row,
                "data-target-url",
                notification
                    .target_url
                    .as_deref()
                    .unwrap_or(PLACEHOLDER_TARGET),
            );

            let header = element(doc, "div", "d-flex justify-content-between");
            let title = element(doc, "span", "notification-title");
            doc.set_text(title, &notification.category);
            let time = element(doc, "span", "notification-time");
            doc.set_text(time, &notification.created_at.format(TIME_FORMAT).to_string());
            doc.append_child(header, title);
            doc.append_child(header, time);

            let content = element(doc, "div", "notification-content");
            doc.set_text(content, &notification.body);

            doc.append_child(row, header);
            doc.append_child(row, content);
            doc.append_child(container, row);
        }
    }

    /// Rendered rows in display order.
    pub fn rows(&self, doc: &Document) -> Vec<NodeId> {
        match doc.select_first(doc.root(), &self.container) {
            Some(container) => doc.select_all(container, &self.row),
            None => Vec::new(),
        }
    }

    /// The id and target a click on `node` (or anything inside a row)
    /// dispatches.
    pub fn row_target(&self, doc: &Document, node: NodeId) -> Option<(NotificationId, String)> {
        let row = doc.closest(node, &self.row)?;
        let id = doc.attr(row, "data-notification-id")?.parse().ok()?;
        let target = doc
            .attr(row, "data-target-url")
            .unwrap_or(PLACEHOLDER_TARGET)
            .to_string();
        Some((NotificationId(id), target))
    }
}

fn element(doc: &mut Document, tag: &str, class: &str) -> NodeId {
    let node = doc.create_element(tag);
    doc.set_attr(node, "class", class);
    node
}
