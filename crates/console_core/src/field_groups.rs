use std::{collections::BTreeMap, sync::LazyLock};

use regex::Regex;
use tracing::debug;

use crate::{
    config::{MessageSettings, SelectorSettings},
    dom::{Document, NodeId, Selector},
    error::{ConsoleError, ConsoleResult},
    modal::ModalSession,
};

static INDEX_SUFFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_(\d+)$").expect("valid regex"));

/// Replaces the trailing numeric suffix of `name` with `index`. Names
/// without one are returned unchanged; earlier numeric segments
/// (`item_2_qty_0`) are left alone.
pub fn reindex_name(name: &str, index: u32) -> String {
    INDEX_SUFFIX_RE
        .replace(name, format!("_{index}").as_str())
        .into_owned()
}

/// Splits `product_3` into (`product`, 3).
pub fn split_index(name: &str) -> Option<(&str, u32)> {
    let captures = INDEX_SUFFIX_RE.captures(name)?;
    let whole = captures.get(0)?;
    let index = captures.get(1)?.as_str().parse().ok()?;
    Some((&name[..whole.start()], index))
}

/// One repeatable record as currently shown in the form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldGroup {
    pub node: NodeId,
    pub ordinal_index: Option<u32>,
    /// Logical field name (suffix stripped) to current value; `None` for an
    /// unselected select.
    pub fields: BTreeMap<String, Option<String>>,
}

pub struct FieldGroupManager {
    group: Selector,
    add_control: Selector,
    remove_control: Selector,
    fields: Selector,
    default_value: String,
}

impl FieldGroupManager {
    pub fn new(selectors: &SelectorSettings, messages: &MessageSettings) -> ConsoleResult<Self> {
        Ok(Self {
            group: Selector::parse(&selectors.field_group)?,
            add_control: Selector::parse(&selectors.add_control)?,
            remove_control: Selector::parse(&selectors.remove_control)?,
            fields: Selector::parse(&selectors.group_fields)?,
            default_value: messages.new_group_default_value.clone(),
        })
    }

    /// Whether a click on `node` lands on an add control.
    pub fn is_add_control(&self, doc: &Document, node: NodeId) -> bool {
        doc.closest(node, &self.add_control).is_some()
    }

    pub fn is_remove_control(&self, doc: &Document, node: NodeId) -> bool {
        doc.closest(node, &self.remove_control).is_some()
    }

    pub fn group_nodes(&self, doc: &Document, scope: NodeId) -> Vec<NodeId> {
        doc.select_all(scope, &self.group)
    }

    /// Copies the first group within `scope` as a new group with the
    /// session's next index, and appends it after the last group.
    pub fn add_group(
        &self,
        doc: &mut Document,
        session: &mut ModalSession,
        scope: NodeId,
    ) -> ConsoleResult<NodeId> {
        let groups = self.group_nodes(doc, scope);
        let (Some(template), Some(last)) = (groups.first().copied(), groups.last().copied()) else {
            return Err(ConsoleError::MissingElement(self.group.to_string()));
        };

        let index = session.issue_group_index();
        let copy = doc.deep_clone(template);
        for field in doc.select_all(copy, &self.fields) {
            let Some(name) = doc.attr(field, "name").map(str::to_string) else {
                continue;
            };
            doc.set_attr(field, "name", &reindex_name(&name, index));
            if doc.tag(field) == Some("select") {
                doc.set_value(field, "");
            } else {
                doc.set_value(field, &self.default_value);
            }
        }
        for control in doc.select_all(copy, &self.remove_control) {
            doc.show(control);
        }
        doc.insert_after(last, copy);
        debug!("groups: added index={index} total={}", groups.len() + 1);
        Ok(copy)
    }

    /// Removes the group containing `target` unless it is the only group
    /// left. Returns whether a group was removed.
    pub fn remove_group(&self, doc: &mut Document, scope: NodeId, target: NodeId) -> bool {
        let Some(group) = doc.closest(target, &self.group) else {
            return false;
        };
        if !doc.contains(scope, group) {
            return false;
        }
        let remaining = self.group_nodes(doc, scope).len();
        if remaining <= 1 {
            debug!("groups: keeping last remaining group");
            return false;
        }
        doc.remove(group);
        debug!("groups: removed total={}", remaining - 1);
        true
    }

    pub fn groups(&self, doc: &Document, scope: NodeId) -> Vec<FieldGroup> {
        self.group_nodes(doc, scope)
            .into_iter()
            .map(|node| {
                let mut ordinal_index = None;
                let mut fields = BTreeMap::new();
                for field in doc.select_all(node, &self.fields) {
                    let Some(name) = doc.attr(field, "name") else {
                        continue;
                    };
                    let logical = match split_index(name) {
                        Some((stem, index)) => {
                            ordinal_index.get_or_insert(index);
                            stem
                        }
                        None => name,
                    };
                    fields.insert(logical.to_string(), doc.value(field));
                }
                FieldGroup {
                    node,
                    ordinal_index,
                    fields,
                }
            })
            .collect()
    }
}
