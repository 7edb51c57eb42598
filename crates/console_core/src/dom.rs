use std::{borrow::Cow, fmt};

use thiserror::Error;

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track",
    "wbr",
];
const RAW_TEXT_ELEMENTS: &[&str] = &["script", "style", "textarea"];
/// Raw-text elements whose content is not entity-decoded.
const OPAQUE_TEXT_ELEMENTS: &[&str] = &["script", "style"];
/// Elements closed implicitly when a sibling of the same tag opens.
const SELF_SIBLING_CLOSING: &[&str] = &["option", "li", "tr", "td", "th"];

/// Slot index plus the slot's generation, so an id held past its node's
/// removal never resolves to whatever reuses the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    index: usize,
    generation: u32,
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBlob {
    pub filename: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LiveValue {
    Initial,
    Set(String),
    /// A select with no option selected.
    Cleared,
}

#[derive(Debug, Clone)]
struct ElementData {
    tag: String,
    attrs: Vec<(String, String)>,
    value: LiveValue,
    checked: Option<bool>,
    files: Vec<FileBlob>,
}

#[derive(Debug, Clone)]
enum NodeKind {
    Element(ElementData),
    /// Decoded text. Children of `script`/`style` hold the raw source.
    Text(String),
    Comment(String),
}

#[derive(Debug, Clone)]
struct Node {
    kind: NodeKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

/// What a stale id resolves to: no tag, no parent, no children.
static VACANT: Node = Node {
    kind: NodeKind::Comment(String::new()),
    parent: None,
    children: Vec::new(),
};

#[derive(Debug, Clone)]
struct Slot {
    generation: u32,
    node: Option<Node>,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid selector `{selector}`: {reason}")]
pub struct SelectorError {
    pub selector: String,
    pub reason: &'static str,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Compound {
    tag: Option<String>,
    id: Option<String>,
    classes: Vec<String>,
    attrs: Vec<(String, Option<String>)>,
}

/// Compiled selector: comma-separated groups of descendant chains of compound
/// selectors (`tag`, `#id`, `.class`, `[attr]`, `[attr=value]`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    source: String,
    groups: Vec<Vec<Compound>>,
}

impl Selector {
    pub fn parse(source: &str) -> Result<Self, SelectorError> {
        let fail = |reason| SelectorError {
            selector: source.to_string(),
            reason,
        };
        let mut groups = Vec::new();
        for group in split_top_level(source, |c| c == ',') {
            let chain = split_top_level(group, char::is_whitespace)
                .into_iter()
                .filter(|part| !part.is_empty())
                .map(|part| parse_compound(part).ok_or_else(|| fail("malformed compound")))
                .collect::<Result<Vec<_>, _>>()?;
            if chain.is_empty() {
                return Err(fail("empty selector group"));
            }
            groups.push(chain);
        }
        Ok(Self {
            source: source.to_string(),
            groups,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Splits on `is_separator` everywhere except inside `[...]` and quotes.
fn split_top_level(source: &str, is_separator: impl Fn(char) -> bool) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_brackets = false;
    let mut quote: Option<char> = None;
    for (i, c) in source.char_indices() {
        match (quote, c) {
            (Some(q), _) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') if in_brackets => quote = Some(c),
            (None, '[') => in_brackets = true,
            (None, ']') => in_brackets = false,
            (None, _) if !in_brackets && is_separator(c) => {
                parts.push(&source[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&source[start..]);
    parts
}

/// Byte offset of the `]` closing the bracket that opens `input`.
fn bracket_end(input: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (i, c) in input.char_indices().skip(1) {
        match (quote, c) {
            (Some(q), _) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, ']') => return Some(i),
            _ => {}
        }
    }
    None
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

fn take_ident(input: &str) -> (&str, &str) {
    let end = input
        .char_indices()
        .find(|(_, c)| !is_ident_char(*c))
        .map_or(input.len(), |(i, _)| i);
    input.split_at(end)
}

fn parse_compound(part: &str) -> Option<Compound> {
    let mut compound = Compound::default();
    let mut rest = part;
    if let Some(after) = rest.strip_prefix('*') {
        rest = after;
    } else {
        let (tag, after) = take_ident(rest);
        if !tag.is_empty() {
            compound.tag = Some(tag.to_ascii_lowercase());
            rest = after;
        }
    }
    while let Some(c) = rest.chars().next() {
        match c {
            '#' | '.' => {
                let (ident, after) = take_ident(&rest[1..]);
                if ident.is_empty() {
                    return None;
                }
                if c == '#' {
                    compound.id = Some(ident.to_string());
                } else {
                    compound.classes.push(ident.to_string());
                }
                rest = after;
            }
            '[' => {
                let close = bracket_end(rest)?;
                let inner = &rest[1..close];
                let (name, value) = match inner.split_once('=') {
                    Some((name, value)) => {
                        let value = value.trim();
                        let value = value
                            .strip_prefix('"')
                            .and_then(|v| v.strip_suffix('"'))
                            .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
                            .unwrap_or(value);
                        (name.trim(), Some(value.to_string()))
                    }
                    None => (inner.trim(), None),
                };
                if name.is_empty() {
                    return None;
                }
                compound.attrs.push((name.to_ascii_lowercase(), value));
                rest = &rest[close + 1..];
            }
            _ => return None,
        }
    }
    Some(compound)
}

fn decode(markup: &str) -> Cow<'_, str> {
    html_escape::decode_html_entities(markup)
}

fn style_hides(style: &str) -> bool {
    style.split(';').any(|decl| {
        let compact: String = decl.chars().filter(|c| !c.is_whitespace()).collect();
        compact.eq_ignore_ascii_case("display:none")
    })
}

fn strip_display(style: &str) -> String {
    style
        .split(';')
        .map(str::trim)
        .filter(|decl| {
            !decl.is_empty()
                && !decl
                    .split(':')
                    .next()
                    .is_some_and(|prop| prop.trim().eq_ignore_ascii_case("display"))
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Arena-backed document. Removed subtrees give their slots back for reuse.
#[derive(Debug, Clone)]
pub struct Document {
    slots: Vec<Slot>,
    free: Vec<usize>,
    root: NodeId,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    pub fn new() -> Self {
        let mut doc = Self {
            slots: Vec::new(),
            free: Vec::new(),
            root: NodeId {
                index: 0,
                generation: 0,
            },
        };
        doc.root = doc.create_element("body");
        doc
    }

    /// Builds a document whose root `body` holds the parsed markup.
    pub fn parse(html: &str) -> Self {
        let mut doc = Self::new();
        let root = doc.root;
        doc.parse_into(root, html);
        doc
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    fn slot(&self, id: NodeId) -> Option<&Node> {
        self.slots
            .get(id.index)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_ref())
    }

    fn node(&self, id: NodeId) -> &Node {
        self.slot(id).unwrap_or(&VACANT)
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.slots
            .get_mut(id.index)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_mut())
    }

    /// Whether `id` still names a node (attached or not).
    pub fn is_live(&self, id: NodeId) -> bool {
        self.slot(id).is_some()
    }

    /// Number of nodes currently held, attached or detached.
    pub fn node_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    fn element(&self, id: NodeId) -> Option<&ElementData> {
        match &self.node(id).kind {
            NodeKind::Element(data) => Some(data),
            _ => None,
        }
    }

    fn element_mut(&mut self, id: NodeId) -> Option<&mut ElementData> {
        match self.node_mut(id).map(|node| &mut node.kind) {
            Some(NodeKind::Element(data)) => Some(data),
            _ => None,
        }
    }

    fn push(&mut self, kind: NodeKind) -> NodeId {
        let node = Node {
            kind,
            parent: None,
            children: Vec::new(),
        };
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index];
            slot.node = Some(node);
            return NodeId {
                index,
                generation: slot.generation,
            };
        }
        self.slots.push(Slot {
            generation: 0,
            node: Some(node),
        });
        NodeId {
            index: self.slots.len() - 1,
            generation: 0,
        }
    }

    /// Frees `id` and its subtree. The root is never freed.
    fn release(&mut self, id: NodeId) {
        let mut pending = vec![id];
        while let Some(current) = pending.pop() {
            if current == self.root {
                continue;
            }
            let Some(slot) = self
                .slots
                .get_mut(current.index)
                .filter(|slot| slot.generation == current.generation)
            else {
                continue;
            };
            let Some(node) = slot.node.take() else {
                continue;
            };
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(current.index);
            pending.extend(node.children);
        }
    }

    pub fn create_element(&mut self, tag: &str) -> NodeId {
        self.push(NodeKind::Element(ElementData {
            tag: tag.to_ascii_lowercase(),
            attrs: Vec::new(),
            value: LiveValue::Initial,
            checked: None,
            files: Vec::new(),
        }))
    }

    /// Creates a text node holding `text` as plain text.
    pub fn create_text(&mut self, text: &str) -> NodeId {
        self.push(NodeKind::Text(text.to_string()))
    }

    // ---- tree navigation ----

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.node(id).children
    }

    pub fn element_children(&self, id: NodeId) -> Vec<NodeId> {
        self.children(id)
            .iter()
            .copied()
            .filter(|child| self.is_element(*child))
            .collect()
    }

    pub fn is_element(&self, id: NodeId) -> bool {
        self.element(id).is_some()
    }

    pub fn tag(&self, id: NodeId) -> Option<&str> {
        self.element(id).map(|data| data.tag.as_str())
    }

    /// Whether the node is still reachable from the document root.
    pub fn is_attached(&self, id: NodeId) -> bool {
        let mut current = Some(id);
        while let Some(node) = current {
            if node == self.root {
                return true;
            }
            current = self.parent(node);
        }
        false
    }

    pub fn contains(&self, ancestor: NodeId, id: NodeId) -> bool {
        let mut current = Some(id);
        while let Some(node) = current {
            if node == ancestor {
                return true;
            }
            current = self.parent(node);
        }
        false
    }

    /// Descendants of `scope` (excluding it) in document order.
    pub fn descendants(&self, scope: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.children(scope).iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            out.push(id);
            stack.extend(self.children(id).iter().rev().copied());
        }
        out
    }

    // ---- selectors ----

    fn matches_compound(&self, id: NodeId, compound: &Compound) -> bool {
        let Some(data) = self.element(id) else {
            return false;
        };
        if compound.tag.as_deref().is_some_and(|tag| tag != data.tag) {
            return false;
        }
        if let Some(want) = &compound.id {
            if self.attr(id, "id") != Some(want.as_str()) {
                return false;
            }
        }
        if !compound.classes.iter().all(|class| self.has_class(id, class)) {
            return false;
        }
        compound.attrs.iter().all(|(name, value)| match value {
            Some(value) => self.attr(id, name) == Some(value.as_str()),
            None => self.attr(id, name).is_some(),
        })
    }

    pub fn matches(&self, id: NodeId, selector: &Selector) -> bool {
        selector.groups.iter().any(|chain| {
            let Some((last, ancestors)) = chain.split_last() else {
                return false;
            };
            if !self.matches_compound(id, last) {
                return false;
            }
            let mut cursor = self.parent(id);
            for compound in ancestors.iter().rev() {
                loop {
                    match cursor {
                        Some(node) if self.matches_compound(node, compound) => {
                            cursor = self.parent(node);
                            break;
                        }
                        Some(node) => cursor = self.parent(node),
                        None => return false,
                    }
                }
            }
            true
        })
    }

    pub fn select_all(&self, scope: NodeId, selector: &Selector) -> Vec<NodeId> {
        self.descendants(scope)
            .into_iter()
            .filter(|id| self.matches(*id, selector))
            .collect()
    }

    pub fn select_first(&self, scope: NodeId, selector: &Selector) -> Option<NodeId> {
        self.descendants(scope)
            .into_iter()
            .find(|id| self.matches(*id, selector))
    }

    /// Nearest inclusive ancestor matching `selector`.
    pub fn closest(&self, id: NodeId, selector: &Selector) -> Option<NodeId> {
        let mut current = Some(id);
        while let Some(node) = current {
            if self.matches(node, selector) {
                return Some(node);
            }
            current = self.parent(node);
        }
        None
    }

    // ---- attributes and classes ----

    pub fn attr(&self, id: NodeId, name: &str) -> Option<&str> {
        self.element(id)?
            .attrs
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn set_attr(&mut self, id: NodeId, name: &str, value: &str) {
        let Some(data) = self.element_mut(id) else {
            return;
        };
        match data
            .attrs
            .iter_mut()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
        {
            Some((_, existing)) => *existing = value.to_string(),
            None => data
                .attrs
                .push((name.to_ascii_lowercase(), value.to_string())),
        }
    }

    pub fn remove_attr(&mut self, id: NodeId, name: &str) {
        if let Some(data) = self.element_mut(id) {
            data.attrs.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
        }
    }

    pub fn has_class(&self, id: NodeId, class: &str) -> bool {
        self.attr(id, "class")
            .is_some_and(|classes| classes.split_whitespace().any(|c| c == class))
    }

    pub fn add_class(&mut self, id: NodeId, class: &str) {
        if self.has_class(id, class) {
            return;
        }
        let classes = match self.attr(id, "class") {
            Some(existing) if !existing.trim().is_empty() => format!("{} {class}", existing.trim()),
            _ => class.to_string(),
        };
        self.set_attr(id, "class", &classes);
    }

    pub fn remove_class(&mut self, id: NodeId, class: &str) {
        let Some(existing) = self.attr(id, "class") else {
            return;
        };
        let kept = existing
            .split_whitespace()
            .filter(|c| *c != class)
            .collect::<Vec<_>>()
            .join(" ");
        self.set_attr(id, "class", &kept);
    }

    // ---- visibility ----

    pub fn is_hidden(&self, id: NodeId) -> bool {
        self.attr(id, "hidden").is_some() || self.attr(id, "style").is_some_and(style_hides)
    }

    /// The node and every ancestor are displayed.
    pub fn is_rendered(&self, id: NodeId) -> bool {
        let mut current = Some(id);
        while let Some(node) = current {
            if self.is_hidden(node) {
                return false;
            }
            current = self.parent(node);
        }
        true
    }

    pub fn hide(&mut self, id: NodeId) {
        let style = self.attr(id, "style").map(strip_display).unwrap_or_default();
        let style = if style.is_empty() {
            "display: none".to_string()
        } else {
            format!("{style}; display: none")
        };
        self.set_attr(id, "style", &style);
    }

    pub fn show(&mut self, id: NodeId) {
        self.remove_attr(id, "hidden");
        if let Some(style) = self.attr(id, "style").map(strip_display) {
            if style.is_empty() {
                self.remove_attr(id, "style");
            } else {
                self.set_attr(id, "style", &style);
            }
        }
    }

    // ---- form controls ----

    fn options(&self, select: NodeId) -> Vec<NodeId> {
        self.descendants(select)
            .into_iter()
            .filter(|id| self.tag(*id) == Some("option"))
            .collect()
    }

    fn option_value(&self, option: NodeId) -> String {
        self.attr(option, "value")
            .map(str::to_string)
            .unwrap_or_else(|| self.text_content(option).trim().to_string())
    }

    /// Current value of a form control. `None` for a select with nothing
    /// selected and for non-control elements.
    pub fn value(&self, id: NodeId) -> Option<String> {
        let data = self.element(id)?;
        match &data.value {
            LiveValue::Set(value) => return Some(value.clone()),
            LiveValue::Cleared => return None,
            LiveValue::Initial => {}
        }
        match data.tag.as_str() {
            "input" => Some(match self.attr(id, "value") {
                Some(value) => value.to_string(),
                None if matches!(self.input_type(id).as_str(), "checkbox" | "radio") => {
                    "on".to_string()
                }
                None => String::new(),
            }),
            "textarea" => Some(self.text_content(id)),
            "select" => {
                let options = self.options(id);
                options
                    .iter()
                    .find(|option| self.attr(**option, "selected").is_some())
                    .or_else(|| options.first())
                    .map(|option| self.option_value(*option))
            }
            "option" => Some(self.option_value(id)),
            _ => None,
        }
    }

    /// Sets a control's value. For a select, a value with no matching option
    /// leaves nothing selected.
    pub fn set_value(&mut self, id: NodeId, value: &str) {
        let live = if self.tag(id) == Some("select")
            && !self
                .options(id)
                .iter()
                .any(|option| self.option_value(*option) == value)
        {
            LiveValue::Cleared
        } else {
            LiveValue::Set(value.to_string())
        };
        if let Some(data) = self.element_mut(id) {
            data.value = live;
        }
    }

    pub fn input_type(&self, id: NodeId) -> String {
        self.attr(id, "type")
            .map(|t| t.trim().to_ascii_lowercase())
            .unwrap_or_else(|| "text".to_string())
    }

    pub fn is_checked(&self, id: NodeId) -> bool {
        match self.element(id) {
            Some(data) => data
                .checked
                .unwrap_or_else(|| self.attr(id, "checked").is_some()),
            None => false,
        }
    }

    pub fn set_checked(&mut self, id: NodeId, checked: bool) {
        if let Some(data) = self.element_mut(id) {
            data.checked = Some(checked);
        }
    }

    pub fn files(&self, id: NodeId) -> &[FileBlob] {
        self.element(id).map_or(&[][..], |data| data.files.as_slice())
    }

    pub fn attach_file(&mut self, id: NodeId, file: FileBlob) {
        if let Some(data) = self.element_mut(id) {
            data.files.push(file);
        }
    }

    // ---- mutation ----

    fn detach(&mut self, id: NodeId) {
        let Some(parent) = self.node(id).parent else {
            return;
        };
        if let Some(parent) = self.node_mut(parent) {
            parent.children.retain(|child| *child != id);
        }
        if let Some(node) = self.node_mut(id) {
            node.parent = None;
        }
    }

    fn adopt(&mut self, parent: NodeId, child: NodeId, position: impl FnOnce(&[NodeId]) -> usize) {
        if !self.is_live(parent) || !self.is_live(child) || self.contains(child, parent) {
            return;
        }
        self.detach(child);
        if let Some(node) = self.node_mut(parent) {
            let at = position(&node.children).min(node.children.len());
            node.children.insert(at, child);
        }
        if let Some(node) = self.node_mut(child) {
            node.parent = Some(parent);
        }
    }

    pub fn append_child(&mut self, parent: NodeId, child: NodeId) {
        self.adopt(parent, child, |children| children.len());
    }

    pub fn prepend_child(&mut self, parent: NodeId, child: NodeId) {
        self.adopt(parent, child, |_| 0);
    }

    /// Inserts `node` as the next sibling of `reference`. A detached
    /// reference leaves `node` untouched.
    pub fn insert_after(&mut self, reference: NodeId, node: NodeId) {
        let Some(parent) = self.parent(reference) else {
            return;
        };
        if node == reference {
            return;
        }
        self.detach(node);
        self.adopt(parent, node, |siblings| {
            siblings
                .iter()
                .position(|sibling| *sibling == reference)
                .map_or(siblings.len(), |p| p + 1)
        });
    }

    /// Detaches `id` and frees its subtree; ids into it go stale.
    pub fn remove(&mut self, id: NodeId) {
        self.detach(id);
        self.release(id);
    }

    /// Removes and frees every child of `id`.
    pub fn clear_children(&mut self, id: NodeId) {
        for child in self.take_children(id) {
            self.release(child);
        }
    }

    fn take_children(&mut self, id: NodeId) -> Vec<NodeId> {
        let Some(node) = self.node_mut(id) else {
            return Vec::new();
        };
        let children = std::mem::take(&mut node.children);
        for child in &children {
            if let Some(child) = self.node_mut(*child) {
                child.parent = None;
            }
        }
        children
    }

    /// Copies `id` and its subtree, including live control state. The copy
    /// is detached.
    pub fn deep_clone(&mut self, id: NodeId) -> NodeId {
        let kind = self.node(id).kind.clone();
        let copy = self.push(kind);
        let children = self.children(id).to_vec();
        for child in children {
            let child_copy = self.deep_clone(child);
            self.append_child(copy, child_copy);
        }
        copy
    }

    /// Replaces the children of `id` with parsed `html`. Markup is taken as
    /// is: the server is trusted and nothing is sanitized.
    pub fn set_inner_html(&mut self, id: NodeId, html: &str) {
        self.clear_children(id);
        self.parse_into(id, html);
    }

    /// Replaces the children of `id` with one text node, reusing an only
    /// child that is already text.
    pub fn set_text(&mut self, id: NodeId, text: &str) {
        let only = match self.children(id) {
            [only] => Some(*only),
            _ => None,
        };
        if let Some(Node {
            kind: NodeKind::Text(existing),
            ..
        }) = only.and_then(|only| self.node_mut(only))
        {
            if existing.as_str() != text {
                *existing = text.to_string();
            }
            return;
        }
        self.clear_children(id);
        let text = self.create_text(text);
        self.append_child(id, text);
    }

    /// Parses `html` and inserts the resulting nodes before the first child.
    pub fn prepend_html(&mut self, id: NodeId, html: &str) -> Vec<NodeId> {
        let nodes = self.parse_fragment(html);
        for node in nodes.iter().rev() {
            self.prepend_child(id, *node);
        }
        nodes
    }

    /// Parses `html` into detached top-level nodes.
    pub fn parse_fragment(&mut self, html: &str) -> Vec<NodeId> {
        let holder = self.create_element("template");
        self.parse_into(holder, html);
        let nodes = self.take_children(holder);
        self.release(holder);
        nodes
    }

    // ---- serialization ----

    pub fn text_content(&self, id: NodeId) -> String {
        match &self.node(id).kind {
            NodeKind::Text(text) => text.clone(),
            NodeKind::Comment(_) => String::new(),
            NodeKind::Element(_) => self
                .children(id)
                .iter()
                .map(|child| self.text_content(*child))
                .collect(),
        }
    }

    pub fn inner_html(&self, id: NodeId) -> String {
        let mut out = String::new();
        for child in self.children(id) {
            self.write_node(*child, &mut out);
        }
        out
    }

    pub fn outer_html(&self, id: NodeId) -> String {
        let mut out = String::new();
        self.write_node(id, &mut out);
        out
    }

    fn write_node(&self, id: NodeId, out: &mut String) {
        match &self.node(id).kind {
            NodeKind::Text(text) => {
                let opaque = self
                    .parent(id)
                    .and_then(|parent| self.tag(parent))
                    .is_some_and(|tag| OPAQUE_TEXT_ELEMENTS.contains(&tag));
                if opaque {
                    out.push_str(text);
                } else {
                    out.push_str(&html_escape::encode_text(text));
                }
            }
            NodeKind::Comment(body) => {
                out.push_str("<!--");
                out.push_str(body);
                out.push_str("-->");
            }
            NodeKind::Element(data) => {
                out.push('<');
                out.push_str(&data.tag);
                for (name, value) in &data.attrs {
                    out.push(' ');
                    out.push_str(name);
                    out.push_str("=\"");
                    out.push_str(&html_escape::encode_double_quoted_attribute(value));
                    out.push('"');
                }
                out.push('>');
                if VOID_ELEMENTS.contains(&data.tag.as_str()) {
                    return;
                }
                for child in self.children(id) {
                    self.write_node(*child, out);
                }
                out.push_str("</");
                out.push_str(&data.tag);
                out.push('>');
            }
        }
    }

    // ---- parsing ----

    fn append_text(&mut self, parent: NodeId, text: Cow<'_, str>) {
        if text.is_empty() {
            return;
        }
        let text = self.push(NodeKind::Text(text.into_owned()));
        self.append_child(parent, text);
    }

    fn parse_into(&mut self, base: NodeId, html: &str) {
        let mut stack = vec![base];
        let mut rest = html;
        while !rest.is_empty() {
            let top = *stack.last().unwrap_or(&base);
            let Some(lt) = rest.find('<') else {
                self.append_text(top, decode(rest));
                break;
            };
            self.append_text(top, decode(&rest[..lt]));
            rest = &rest[lt..];

            if let Some(after) = rest.strip_prefix("<!--") {
                let (body, tail) = match after.find("-->") {
                    Some(end) => (&after[..end], &after[end + 3..]),
                    None => (after, ""),
                };
                let comment = self.push(NodeKind::Comment(body.to_string()));
                self.append_child(top, comment);
                rest = tail;
            } else if rest.starts_with("<!") || rest.starts_with("<?") {
                rest = rest.find('>').map_or("", |end| &rest[end + 1..]);
            } else if let Some(after) = rest.strip_prefix("</") {
                let (name, _) = take_ident(after);
                let name = name.to_ascii_lowercase();
                rest = after.find('>').map_or("", |end| &after[end + 1..]);
                if let Some(position) = stack
                    .iter()
                    .skip(1)
                    .rposition(|open| self.tag(*open) == Some(name.as_str()))
                {
                    stack.truncate(position + 1);
                }
            } else if rest[1..].starts_with(|c: char| c.is_ascii_alphabetic()) {
                rest = self.parse_start_tag(&mut stack, rest);
            } else {
                self.append_text(top, Cow::Borrowed("<"));
                rest = &rest[1..];
            }
        }
    }

    /// Parses one start tag at the head of `input`, returning the remainder.
    fn parse_start_tag<'a>(&mut self, stack: &mut Vec<NodeId>, input: &'a str) -> &'a str {
        let (name, mut rest) = take_ident(&input[1..]);
        let tag = name.to_ascii_lowercase();

        if SELF_SIBLING_CLOSING.contains(&tag.as_str())
            && stack.len() > 1
            && stack.last().and_then(|open| self.tag(*open)) == Some(tag.as_str())
        {
            stack.pop();
        }

        let element = self.create_element(&tag);
        let mut self_closing = false;
        loop {
            rest = rest.trim_start();
            if rest.is_empty() {
                break;
            }
            if let Some(after) = rest.strip_prefix("/>") {
                self_closing = true;
                rest = after;
                break;
            }
            if let Some(after) = rest.strip_prefix('>') {
                rest = after;
                break;
            }
            if let Some(after) = rest.strip_prefix('/') {
                rest = after;
                continue;
            }
            let name_end = rest
                .find(|c: char| c.is_whitespace() || c == '=' || c == '>' || c == '/')
                .unwrap_or(rest.len());
            let attr_name = rest[..name_end].to_ascii_lowercase();
            rest = rest[name_end..].trim_start();
            let mut attr_value = String::new();
            if let Some(after) = rest.strip_prefix('=') {
                let after = after.trim_start();
                match after.chars().next() {
                    Some(quote @ ('"' | '\'')) => {
                        let body = &after[1..];
                        let end = body.find(quote).unwrap_or(body.len());
                        attr_value = decode(&body[..end]).into_owned();
                        rest = body.get(end + 1..).unwrap_or("");
                    }
                    _ => {
                        let end = after
                            .find(|c: char| c.is_whitespace() || c == '>')
                            .unwrap_or(after.len());
                        attr_value = decode(&after[..end]).into_owned();
                        rest = &after[end..];
                    }
                }
            }
            if !attr_name.is_empty() && self.attr(element, &attr_name).is_none() {
                self.set_attr(element, &attr_name, &attr_value);
            }
        }

        let parent = *stack.last().unwrap_or(&self.root);
        self.append_child(parent, element);

        if self_closing || VOID_ELEMENTS.contains(&tag.as_str()) {
            return rest;
        }
        if RAW_TEXT_ELEMENTS.contains(&tag.as_str()) {
            let closing = format!("</{tag}");
            let end = rest.to_ascii_lowercase().find(&closing).unwrap_or(rest.len());
            let content = &rest[..end];
            if OPAQUE_TEXT_ELEMENTS.contains(&tag.as_str()) {
                self.append_text(element, Cow::Borrowed(content));
            } else {
                self.append_text(element, decode(content));
            }
            let tail = &rest[end..];
            return tail.find('>').map_or("", |gt| &tail[gt + 1..]);
        }
        stack.push(element);
        rest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sel(source: &str) -> Selector {
        Selector::parse(source).unwrap()
    }

    #[test]
    fn parses_and_serializes_fragment() {
        let html = r#"<form action="/tx/new/" method="post"><input type="hidden" name="csrfmiddlewaretoken" value="abc"><select name="product_0"><option value="">--</option><option value="4" selected>Tea</option></select></form>"#;
        let doc = Document::parse(html);
        assert_eq!(doc.inner_html(doc.root()), html.replace(" selected>", " selected=\"\">"));
    }

    #[test]
    fn single_quoted_attributes_are_normalized() {
        let doc = Document::parse("<div class='product-item' data-x='a\"b'>x</div>");
        let item = doc.select_first(doc.root(), &sel(".product-item")).unwrap();
        assert_eq!(doc.attr(item, "data-x"), Some("a\"b"));
        assert_eq!(
            doc.outer_html(item),
            r#"<div class="product-item" data-x="a&quot;b">x</div>"#
        );
    }

    #[test]
    fn script_content_is_kept_raw() {
        let doc = Document::parse("<div><script>if (a < b) { go(); }</script></div>");
        let script = doc.select_first(doc.root(), &sel("script")).unwrap();
        assert_eq!(doc.text_content(script), "if (a < b) { go(); }");
        assert!(doc.inner_html(doc.root()).contains("<script>if (a < b)"));
    }

    #[test]
    fn selector_groups_and_descendants() {
        let doc = Document::parse(
            r#"<div id="m" class="modal"><div class="modal-body"><input name="a"><select name="b"></select></div></div><input name="c">"#,
        );
        let fields = doc.select_all(doc.root(), &sel("#m select, #m input"));
        let names: Vec<_> = fields.iter().map(|f| doc.attr(*f, "name").unwrap()).collect();
        assert_eq!(names, vec!["a", "b"]);

        let body = doc.select_first(doc.root(), &sel(".modal .modal-body")).unwrap();
        assert_eq!(doc.closest(body, &sel("div.modal")).and_then(|m| doc.attr(m, "id")), Some("m"));
        assert!(doc.select_first(doc.root(), &sel("[name=c]")).is_some());
    }

    #[test]
    fn malformed_selectors_are_rejected() {
        assert!(Selector::parse("").is_err());
        assert!(Selector::parse(".").is_err());
        assert!(Selector::parse("a, ").is_err());
        assert!(Selector::parse("[=x]").is_err());
    }

    #[test]
    fn select_value_follows_options() {
        let mut doc = Document::parse(
            r#"<select name="p"><option value="1">A</option><option value="2">B</option></select>"#,
        );
        let select = doc.select_first(doc.root(), &sel("select")).unwrap();
        assert_eq!(doc.value(select).as_deref(), Some("1"));
        doc.set_value(select, "2");
        assert_eq!(doc.value(select).as_deref(), Some("2"));
        doc.set_value(select, "");
        assert_eq!(doc.value(select), None);
    }

    #[test]
    fn hide_and_show_toggle_display() {
        let mut doc = Document::parse(r#"<button class="x" style="color: red">x</button>"#);
        let button = doc.select_first(doc.root(), &sel(".x")).unwrap();
        assert!(!doc.is_hidden(button));
        doc.hide(button);
        assert!(doc.is_hidden(button));
        assert_eq!(doc.attr(button, "style"), Some("color: red; display: none"));
        doc.show(button);
        assert!(!doc.is_hidden(button));
        assert_eq!(doc.attr(button, "style"), Some("color: red"));
    }

    #[test]
    fn deep_clone_is_detached_and_independent() {
        let mut doc = Document::parse(r#"<ul id="l"><li><input name="q_0" value="3"></li></ul>"#);
        let item = doc.select_first(doc.root(), &sel("li")).unwrap();
        let copy = doc.deep_clone(item);
        assert!(!doc.is_attached(copy));
        let input = doc.select_first(copy, &sel("input")).unwrap();
        doc.set_attr(input, "name", "q_1");
        doc.insert_after(item, copy);

        let names: Vec<_> = doc
            .select_all(doc.root(), &sel("input"))
            .into_iter()
            .map(|i| doc.attr(i, "name").unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["q_0", "q_1"]);
    }

    #[test]
    fn implicit_option_close() {
        let doc = Document::parse("<select><option value=a>A<option value=b>B</select>");
        let select = doc.select_first(doc.root(), &sel("select")).unwrap();
        assert_eq!(doc.element_children(select).len(), 2);
    }

    #[test]
    fn create_text_escapes_markup() {
        let mut doc = Document::new();
        let div = doc.create_element("div");
        let root = doc.root();
        doc.append_child(root, div);
        doc.set_text(div, "<b>bold</b> & co");
        assert_eq!(doc.inner_html(div), "&lt;b&gt;bold&lt;/b&gt; &amp; co");
        assert_eq!(doc.text_content(div), "<b>bold</b> & co");
    }

    #[test]
    fn entities_decode_on_parse_and_encode_on_write() {
        let doc = Document::parse(
            r#"<input name="a" value="Kopi &amp; Teh"><input name="b" value='O&#x27;Brien'><textarea name="c">O&#x27;Brien&nbsp;x</textarea><p>1 &lt; 2</p>"#,
        );
        let a = doc.select_first(doc.root(), &sel("[name=a]")).unwrap();
        let b = doc.select_first(doc.root(), &sel("[name=b]")).unwrap();
        let c = doc.select_first(doc.root(), &sel("textarea")).unwrap();
        let p = doc.select_first(doc.root(), &sel("p")).unwrap();
        assert_eq!(doc.attr(a, "value"), Some("Kopi & Teh"));
        assert_eq!(doc.attr(b, "value"), Some("O'Brien"));
        assert_eq!(doc.text_content(c), "O'Brien\u{a0}x");
        assert_eq!(doc.text_content(p), "1 < 2");

        assert_eq!(doc.outer_html(a), r#"<input name="a" value="Kopi &amp; Teh">"#);
        assert_eq!(doc.outer_html(p), "<p>1 &lt; 2</p>");
        let reparsed = Document::parse(&doc.inner_html(doc.root()));
        let a = reparsed.select_first(reparsed.root(), &sel("[name=a]")).unwrap();
        assert_eq!(reparsed.attr(a, "value"), Some("Kopi & Teh"));
    }

    #[test]
    fn replaced_content_frees_its_slots() {
        let mut doc = Document::parse(r#"<span class="badge">0</span><ul id="list"></ul>"#);
        let badge = doc.select_first(doc.root(), &sel(".badge")).unwrap();
        let list = doc.select_first(doc.root(), &sel("#list")).unwrap();
        let row = r#"<li class="row"><a href="/n/1">Order</a><small>now</small></li>"#;
        doc.set_inner_html(list, row);
        let settled = doc.node_count();
        for i in 0..1000 {
            doc.set_text(badge, &i.to_string());
            doc.set_inner_html(list, row);
        }
        assert_eq!(doc.node_count(), settled);
        assert_eq!(doc.text_content(badge), "999");
    }

    #[test]
    fn removed_ids_go_stale() {
        let mut doc = Document::parse(r#"<div id="a"><b>x</b></div>"#);
        let div = doc.select_first(doc.root(), &sel("#a")).unwrap();
        let bold = doc.select_first(div, &sel("b")).unwrap();
        doc.remove(div);
        assert!(!doc.is_live(div));
        assert!(!doc.is_live(bold));
        assert!(!doc.is_attached(div));

        let fresh: Vec<_> = (0..3).map(|_| doc.create_element("p")).collect();
        assert!(!fresh.contains(&div));
        assert_eq!(doc.tag(div), None);
        doc.remove(div);
        doc.set_attr(div, "id", "ghost");
        assert!(fresh.iter().all(|p| doc.attr(*p, "id").is_none()));
    }

    #[test]
    fn quoted_attribute_values_may_hold_separators() {
        let doc = Document::parse(
            r#"<input value="a,b"><div data-x="a b"><i></i></div><span data-y="[z]"></span>"#,
        );
        assert!(doc.select_first(doc.root(), &sel(r#"[value="a,b"]"#)).is_some());
        assert!(doc.select_first(doc.root(), &sel(r#"[data-x="a b"] i"#)).is_some());
        assert!(doc.select_first(doc.root(), &sel("[data-y='[z]']")).is_some());
        assert_eq!(doc.select_all(doc.root(), &sel(r#"[value="a,b"], [data-x='a b']"#)).len(), 2);
        assert!(Selector::parse(r#"[value="a,b""#).is_err());
    }
}
