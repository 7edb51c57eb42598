use shared::domain::Severity;
use tracing::debug;

use crate::dom::{Document, NodeId, Selector};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHandle(NodeId);

impl MessageHandle {
    pub fn node(self) -> NodeId {
        self.0
    }
}

/// Renders messages into one surface, held explicitly instead of being
/// looked up on every call.
#[derive(Debug, Clone)]
pub struct MessageBus {
    surfaces: Vec<Selector>,
    surface: Option<NodeId>,
}

impl MessageBus {
    /// `surfaces` are tried in priority order; within one selector the first
    /// match in document order wins.
    pub fn new(surfaces: Vec<Selector>) -> Self {
        Self {
            surfaces,
            surface: None,
        }
    }

    /// Resolves the surface against `doc`, falling back to the document root.
    pub fn attach(&mut self, doc: &Document) -> NodeId {
        let surface = self
            .surfaces
            .iter()
            .find_map(|selector| doc.select_first(doc.root(), selector))
            .unwrap_or_else(|| doc.root());
        debug!("messages: surface attached node={surface}");
        self.surface = Some(surface);
        surface
    }

    pub fn surface(&mut self, doc: &Document) -> NodeId {
        match self.surface {
            Some(surface) if doc.is_attached(surface) => surface,
            _ => self.attach(doc),
        }
    }

    pub fn show(&mut self, doc: &mut Document, message: &str, severity: Severity) -> MessageHandle {
        let surface = self.surface(doc);

        let alert = doc.create_element("div");
        doc.set_attr(
            alert,
            "class",
            &format!(
                "alert alert-{} alert-dismissible fade show",
                severity.as_str()
            ),
        );
        doc.set_attr(alert, "role", "alert");
        let text = doc.create_text(message);
        doc.append_child(alert, text);

        let close = doc.create_element("button");
        doc.set_attr(close, "type", "button");
        doc.set_attr(close, "class", "btn-close");
        doc.set_attr(close, "data-bs-dismiss", "alert");
        doc.set_attr(close, "aria-label", "Close");
        doc.append_child(alert, close);

        doc.prepend_child(surface, alert);
        MessageHandle(alert)
    }

    /// Removes a message. Returns false when it was already gone.
    pub fn dismiss(&self, doc: &mut Document, handle: MessageHandle) -> bool {
        if !doc.is_attached(handle.0) {
            return false;
        }
        doc.remove(handle.0);
        true
    }

    /// Texts of the messages currently shown, most recent first.
    pub fn visible(&mut self, doc: &Document) -> Vec<String> {
        let surface = self.surface(doc);
        doc.element_children(surface)
            .into_iter()
            .filter(|child| doc.attr(*child, "role") == Some("alert"))
            .map(|child| doc.text_content(child))
            .collect()
    }
}
