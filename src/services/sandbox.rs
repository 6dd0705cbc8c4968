//! Script sandbox — runs generator scripts against one node.
//!
//! DESIGN
//! ======
//! `ScriptRuntime` is the only seam through which scripts are parsed or run.
//! The validator uses `check_syntax`; the iteration driver and the commit
//! pass use `execute`. Swapping the interpreter means implementing this
//! trait, nothing in orchestration changes.
//!
//! `RhaiRuntime` embeds the `rhai` interpreter with no module loading and no
//! host I/O. Scripts see a single variable, `node`, of type `Node`
//! (`NodeHandle`). Every method that changes the tree is decomposed into the
//! primitive `Mutation`s of `crate::doc` and funnelled through the pass's
//! `Recorder`, so whatever a script does, the pass can be undone.
//!
//! Compound operations (replace, move, set_text) are sequences of primitive
//! mutations. If one step fails, the earlier steps stay recorded and are
//! undone with the rest of the pass.

use rhai::{Array, Dynamic, Engine, EvalAltResult, Map, Scope};
use tracing::debug;

use super::recorder::Recorder;
use crate::doc::{DocError, Document, Mutation, NodeId};

/// Result text for scripts that evaluate to `()`.
pub const NO_RETURN_VALUE: &str = "no return value";

const DATA_PREFIX: &str = "data-";

// =============================================================================
// RUNTIME TRAIT
// =============================================================================

/// Capability boundary for parsing and running scripts.
pub trait ScriptRuntime: Send + Sync {
    /// Parse `script` without running it.
    ///
    /// # Errors
    ///
    /// Returns the parser's message if the script does not parse.
    fn check_syntax(&self, script: &str) -> Result<(), String>;

    /// Run `script` with `node` bound, recording every mutation in `recorder`.
    /// Returns the stringified result value.
    ///
    /// # Errors
    ///
    /// Returns the parse or runtime error message.
    fn execute(&self, recorder: &Recorder, node: NodeId, script: &str) -> Result<String, String>;
}

// =============================================================================
// NODE HANDLE
// =============================================================================

/// A script's reference to one node. Handles created during a pass share
/// that pass's recorder.
#[derive(Debug, Clone)]
pub struct NodeHandle {
    recorder: Recorder,
    id: NodeId,
}

impl NodeHandle {
    #[must_use]
    pub fn new(recorder: Recorder, id: NodeId) -> Self {
        Self { recorder, id }
    }

    #[must_use]
    pub fn id(&self) -> NodeId {
        self.id
    }

    fn handle(&self, id: NodeId) -> Self {
        Self { recorder: self.recorder.clone(), id }
    }

    /// Run `f` against the document. The lock is released before returning,
    /// so callers may record afterwards.
    fn read<T>(&self, f: impl FnOnce(&Document) -> Result<T, DocError>) -> Result<T, DocError> {
        let doc = self.recorder.document().lock();
        f(&doc)
    }

    fn record(&self, mutation: Mutation) -> Result<(), DocError> {
        self.recorder.record(mutation)
    }

    // -------------------------------------------------------------------------
    // reads
    // -------------------------------------------------------------------------

    /// Lowercase tag name, or `#text` for text nodes.
    pub fn tag(&self) -> Result<String, DocError> {
        self.read(|d| Ok(d.node(self.id)?.tag().unwrap_or("#text").to_owned()))
    }

    pub fn attr(&self, name: &str) -> Result<Option<String>, DocError> {
        self.read(|d| Ok(d.attribute(self.id, name)?.map(str::to_owned)))
    }

    pub fn attrs(&self) -> Result<Vec<(String, String)>, DocError> {
        self.read(|d| Ok(d.element(self.id)?.attributes.clone()))
    }

    pub fn style(&self, property: &str) -> Result<Option<String>, DocError> {
        let property = property.trim().to_ascii_lowercase();
        self.read(|d| Ok(d.style_value(self.id, &property)?.map(str::to_owned)))
    }

    pub fn text(&self) -> Result<String, DocError> {
        self.read(|d| d.text_content(self.id))
    }

    pub fn markup(&self) -> Result<String, DocError> {
        self.read(|d| d.outer_markup(self.id))
    }

    pub fn parent(&self) -> Result<Option<Self>, DocError> {
        Ok(self.read(|d| d.parent(self.id))?.map(|id| self.handle(id)))
    }

    pub fn children(&self) -> Result<Vec<Self>, DocError> {
        let ids = self.read(|d| Ok(d.children(self.id)?.to_vec()))?;
        Ok(ids.into_iter().map(|id| self.handle(id)).collect())
    }

    pub fn child_count(&self) -> Result<usize, DocError> {
        self.read(|d| Ok(d.children(self.id)?.len()))
    }

    /// Descendant elements with tag `tag` (`*` matches every element), in
    /// document order.
    pub fn find_all(&self, tag: &str) -> Result<Vec<Self>, DocError> {
        let ids = self.read(|d| {
            Ok(d.descendants(self.id)?
                .into_iter()
                .filter(|id| {
                    d.get(*id)
                        .and_then(crate::doc::Node::tag)
                        .is_some_and(|t| tag == "*" || t.eq_ignore_ascii_case(tag))
                })
                .collect::<Vec<_>>())
        })?;
        Ok(ids.into_iter().map(|id| self.handle(id)).collect())
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.recorder.document().lock().is_connected(self.id)
    }

    // -------------------------------------------------------------------------
    // attributes + presentation
    // -------------------------------------------------------------------------

    pub fn set_attr(&self, name: &str, value: &str) -> Result<(), DocError> {
        self.record(Mutation::SetAttribute {
            node: self.id,
            name: name.to_owned(),
            value: Some(value.to_owned()),
            index: None,
        })
    }

    pub fn remove_attr(&self, name: &str) -> Result<(), DocError> {
        self.record(Mutation::SetAttribute { node: self.id, name: name.to_owned(), value: None, index: None })
    }

    pub fn add_class(&self, class: &str) -> Result<(), DocError> {
        let current = self.attr("class")?.unwrap_or_default();
        if current.split_whitespace().any(|c| c == class) {
            return Ok(());
        }
        let mut classes: Vec<&str> = current.split_whitespace().collect();
        classes.push(class);
        self.set_attr("class", &classes.join(" "))
    }

    pub fn remove_class(&self, class: &str) -> Result<(), DocError> {
        let Some(current) = self.attr("class")? else {
            return Ok(());
        };
        let kept: Vec<&str> = current.split_whitespace().filter(|c| *c != class).collect();
        if kept.len() == current.split_whitespace().count() {
            return Ok(());
        }
        if kept.is_empty() {
            self.remove_attr("class")
        } else {
            self.set_attr("class", &kept.join(" "))
        }
    }

    /// Returns whether the class is present afterwards.
    pub fn toggle_class(&self, class: &str) -> Result<bool, DocError> {
        let present = self
            .attr("class")?
            .is_some_and(|c| c.split_whitespace().any(|c| c == class));
        if present {
            self.remove_class(class)?;
        } else {
            self.add_class(class)?;
        }
        Ok(!present)
    }

    /// Set a presentation property; an empty value removes it.
    pub fn set_style(&self, property: &str, value: &str) -> Result<(), DocError> {
        let value = value.trim();
        self.record(Mutation::SetStyle {
            node: self.id,
            property: property.trim().to_ascii_lowercase(),
            value: (!value.is_empty()).then(|| value.to_owned()),
            index: None,
        })
    }

    pub fn remove_style(&self, property: &str) -> Result<(), DocError> {
        self.set_style(property, "")
    }

    pub fn set_data(&self, key: &str, value: &str) -> Result<(), DocError> {
        self.set_attr(&data_attribute(key), value)
    }

    pub fn remove_data(&self, key: &str) -> Result<(), DocError> {
        self.remove_attr(&data_attribute(key))
    }

    // -------------------------------------------------------------------------
    // structure
    // -------------------------------------------------------------------------

    /// New detached element; it joins the tree once attached.
    pub fn create_element(&self, tag: &str) -> Result<Self, DocError> {
        let id = self.recorder.create_element(tag)?;
        Ok(self.handle(id))
    }

    #[must_use]
    pub fn create_text(&self, text: &str) -> Self {
        let id = self.recorder.create_text(text);
        self.handle(id)
    }

    pub fn append_child(&self, child: &Self) -> Result<(), DocError> {
        let len = self.len_without(child.id)?;
        self.insert_child(len, child)
    }

    pub fn prepend_child(&self, child: &Self) -> Result<(), DocError> {
        self.insert_child(0, child)
    }

    /// Insert `child` at `index`, moving it if it is already attached.
    /// `index` counts children after `child` has been taken out.
    pub fn insert_child(&self, index: usize, child: &Self) -> Result<(), DocError> {
        self.check_not_ancestor(child.id)?;
        let len = self.len_without(child.id)?;
        if index > len {
            return Err(DocError::IndexOutOfBounds { index, len });
        }
        self.detach_if_attached(child.id)?;
        self.record(Mutation::Attach { node: child.id, parent: self.id, index })
    }

    pub fn insert_before(&self, new_child: &Self, reference: &Self) -> Result<(), DocError> {
        self.child_index(reference.id)?;
        self.check_not_ancestor(new_child.id)?;
        if new_child.id == reference.id {
            return Ok(());
        }
        self.detach_if_attached(new_child.id)?;
        let index = self.child_index(reference.id)?;
        self.record(Mutation::Attach { node: new_child.id, parent: self.id, index })
    }

    pub fn remove_child(&self, child: &Self) -> Result<(), DocError> {
        self.child_index(child.id)?;
        self.record(Mutation::Detach { node: child.id })
    }

    pub fn replace_child(&self, new_child: &Self, old_child: &Self) -> Result<(), DocError> {
        self.child_index(old_child.id)?;
        if new_child.id == old_child.id {
            return Ok(());
        }
        self.check_not_ancestor(new_child.id)?;
        self.detach_if_attached(new_child.id)?;
        let index = self.child_index(old_child.id)?;
        self.record(Mutation::Detach { node: old_child.id })?;
        self.record(Mutation::Attach { node: new_child.id, parent: self.id, index })
    }

    /// Move an existing child to `index` among its siblings.
    pub fn move_child(&self, child: &Self, index: usize) -> Result<(), DocError> {
        self.child_index(child.id)?;
        let len = self.len_without(child.id)?;
        if index > len {
            return Err(DocError::IndexOutOfBounds { index, len });
        }
        self.record(Mutation::Detach { node: child.id })?;
        self.record(Mutation::Attach { node: child.id, parent: self.id, index })
    }

    /// Detach this node from its parent.
    pub fn remove(&self) -> Result<(), DocError> {
        self.record(Mutation::Detach { node: self.id })
    }

    /// Put `other` where this node is and detach this node.
    pub fn replace_with(&self, other: &Self) -> Result<(), DocError> {
        if other.id == self.id {
            return Ok(());
        }
        let parent = self
            .read(|d| d.parent(self.id))?
            .ok_or(DocError::NotAttached(self.id))?;
        self.handle(parent).replace_child(other, self)
    }

    /// Replace all content with `text`. On a text node, sets its text.
    pub fn set_text(&self, text: &str) -> Result<(), DocError> {
        let is_text = self.read(|d| Ok(d.node(self.id)?.element().is_none()))?;
        if is_text {
            return self.record(Mutation::SetText { node: self.id, text: text.to_owned() });
        }
        self.clear()?;
        if !text.is_empty() {
            let text_node = self.create_text(text);
            self.record(Mutation::Attach { node: text_node.id, parent: self.id, index: 0 })?;
        }
        Ok(())
    }

    /// Detach every child.
    pub fn clear(&self) -> Result<(), DocError> {
        let children = self.read(|d| Ok(d.children(self.id)?.to_vec()))?;
        for child in children.into_iter().rev() {
            self.record(Mutation::Detach { node: child })?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // helpers
    // -------------------------------------------------------------------------

    fn child_index(&self, child: NodeId) -> Result<usize, DocError> {
        self.read(|d| {
            d.children(self.id)?
                .iter()
                .position(|c| *c == child)
                .ok_or(DocError::NotAChild { child, parent: self.id })
        })
    }

    /// Child count once `child` is taken out of this node (if it is here).
    fn len_without(&self, child: NodeId) -> Result<usize, DocError> {
        self.read(|d| {
            let children = d.children(self.id)?;
            Ok(children.len() - usize::from(children.contains(&child)))
        })
    }

    fn check_not_ancestor(&self, candidate: NodeId) -> Result<(), DocError> {
        self.read(|d| {
            let mut current = Some(self.id);
            while let Some(cur) = current {
                if cur == candidate {
                    return Err(DocError::Cycle { node: candidate, parent: self.id });
                }
                current = d.parent(cur)?;
            }
            Ok(())
        })
    }

    fn detach_if_attached(&self, node: NodeId) -> Result<(), DocError> {
        if self.read(|d| d.parent(node))?.is_some() {
            self.record(Mutation::Detach { node })?;
        }
        Ok(())
    }
}

fn data_attribute(key: &str) -> String {
    if key.starts_with(DATA_PREFIX) {
        key.to_owned()
    } else {
        format!("{DATA_PREFIX}{key}")
    }
}

// =============================================================================
// RHAI RUNTIME
// =============================================================================

/// Call depth and expression nesting limits for scripts.
const MAX_CALL_LEVELS: usize = 32;
const MAX_EXPR_DEPTH: usize = 64;
const MAX_FN_EXPR_DEPTH: usize = 32;
const MAX_STRING_SIZE: usize = 1 << 20;
const MAX_COLLECTION_SIZE: usize = 10_000;

pub struct RhaiRuntime {
    engine: Engine,
}

impl RhaiRuntime {
    #[must_use]
    pub fn new(max_operations: u64) -> Self {
        let mut engine = Engine::new();
        engine.set_module_resolver(rhai::module_resolvers::DummyModuleResolver::new());
        engine.set_max_operations(max_operations);
        engine.set_max_call_levels(MAX_CALL_LEVELS);
        engine.set_max_expr_depths(MAX_EXPR_DEPTH, MAX_FN_EXPR_DEPTH);
        engine.set_max_string_size(MAX_STRING_SIZE);
        engine.set_max_array_size(MAX_COLLECTION_SIZE);
        engine.set_max_map_size(MAX_COLLECTION_SIZE);
        engine.disable_symbol("eval");
        engine.on_print(|text| debug!(text, "script: print"));
        engine.on_debug(|text, _source, pos| debug!(text, %pos, "script: debug"));
        register_node_api(&mut engine);
        Self { engine }
    }
}

impl Default for RhaiRuntime {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_SCRIPT_MAX_OPERATIONS)
    }
}

impl ScriptRuntime for RhaiRuntime {
    fn check_syntax(&self, script: &str) -> Result<(), String> {
        self.engine.compile(script).map(|_| ()).map_err(|e| e.to_string())
    }

    fn execute(&self, recorder: &Recorder, node: NodeId, script: &str) -> Result<String, String> {
        let ast = self
            .engine
            .compile(script)
            .map_err(|e| format!("syntax error: {e}"))?;
        let mut scope = Scope::new();
        scope.push("node", NodeHandle::new(recorder.clone(), node));
        let value = self
            .engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, &ast)
            .map_err(|e| e.to_string())?;
        Ok(describe_value(value))
    }
}

fn describe_value(value: Dynamic) -> String {
    if value.is_unit() {
        return NO_RETURN_VALUE.to_owned();
    }
    match value.clone().try_cast::<NodeHandle>() {
        Some(handle) => handle.markup().unwrap_or_else(|e| e.to_string()),
        None => value.to_string(),
    }
}

// =============================================================================
// NODE API REGISTRATION
// =============================================================================

type ScriptResult<T> = Result<T, Box<EvalAltResult>>;

fn fail(e: DocError) -> Box<EvalAltResult> {
    e.to_string().into()
}

fn index_arg(index: i64) -> ScriptResult<usize> {
    usize::try_from(index).map_err(|_| format!("invalid child index {index}").into())
}

fn optional(value: Option<String>) -> Dynamic {
    value.map_or(Dynamic::UNIT, Dynamic::from)
}

fn handles(list: Vec<NodeHandle>) -> Array {
    list.into_iter().map(Dynamic::from).collect()
}

fn register_node_api(engine: &mut Engine) {
    engine.register_type_with_name::<NodeHandle>("Node");

    // reads
    engine
        .register_fn("tag", |n: &mut NodeHandle| n.tag().map_err(fail))
        .register_fn("id", |n: &mut NodeHandle| n.id().to_string())
        .register_fn("attr", |n: &mut NodeHandle, name: &str| n.attr(name).map(optional).map_err(fail))
        .register_fn("has_attr", |n: &mut NodeHandle, name: &str| {
            n.attr(name).map(|v| v.is_some()).map_err(fail)
        })
        .register_fn("attrs", |n: &mut NodeHandle| -> ScriptResult<Map> {
            let pairs = n.attrs().map_err(fail)?;
            Ok(pairs
                .into_iter()
                .map(|(name, value)| (name.into(), Dynamic::from(value)))
                .collect())
        })
        .register_fn("style", |n: &mut NodeHandle, property: &str| {
            n.style(property).map(optional).map_err(fail)
        })
        .register_fn("text", |n: &mut NodeHandle| n.text().map_err(fail))
        .register_fn("markup", |n: &mut NodeHandle| n.markup().map_err(fail))
        .register_fn("parent", |n: &mut NodeHandle| {
            n.parent()
                .map(|p| p.map_or(Dynamic::UNIT, Dynamic::from))
                .map_err(fail)
        })
        .register_fn("children", |n: &mut NodeHandle| n.children().map(handles).map_err(fail))
        .register_fn("child_count", |n: &mut NodeHandle| -> ScriptResult<i64> {
            let count = n.child_count().map_err(fail)?;
            Ok(i64::try_from(count).unwrap_or(i64::MAX))
        })
        .register_fn("find_all", |n: &mut NodeHandle, tag: &str| n.find_all(tag).map(handles).map_err(fail))
        .register_fn("is_connected", |n: &mut NodeHandle| n.is_connected())
        .register_fn("==", |a: &mut NodeHandle, b: NodeHandle| a.id == b.id)
        .register_fn("!=", |a: &mut NodeHandle, b: NodeHandle| a.id != b.id)
        .register_fn("to_string", |n: &mut NodeHandle| n.markup().unwrap_or_else(|e| e.to_string()))
        .register_fn("to_debug", |n: &mut NodeHandle| format!("Node({})", n.id));

    // attributes + presentation
    engine
        .register_fn("set_attr", |n: &mut NodeHandle, name: &str, value: &str| {
            n.set_attr(name, value).map_err(fail)
        })
        .register_fn("remove_attr", |n: &mut NodeHandle, name: &str| n.remove_attr(name).map_err(fail))
        .register_fn("add_class", |n: &mut NodeHandle, class: &str| n.add_class(class).map_err(fail))
        .register_fn("remove_class", |n: &mut NodeHandle, class: &str| n.remove_class(class).map_err(fail))
        .register_fn("toggle_class", |n: &mut NodeHandle, class: &str| n.toggle_class(class).map_err(fail))
        .register_fn("set_style", |n: &mut NodeHandle, property: &str, value: &str| {
            n.set_style(property, value).map_err(fail)
        })
        .register_fn("remove_style", |n: &mut NodeHandle, property: &str| {
            n.remove_style(property).map_err(fail)
        })
        .register_fn("set_data", |n: &mut NodeHandle, key: &str, value: &str| {
            n.set_data(key, value).map_err(fail)
        })
        .register_fn("remove_data", |n: &mut NodeHandle, key: &str| n.remove_data(key).map_err(fail));

    // structure
    engine
        .register_fn("create_element", |n: &mut NodeHandle, tag: &str| n.create_element(tag).map_err(fail))
        .register_fn("create_text", |n: &mut NodeHandle, text: &str| n.create_text(text))
        .register_fn("append_child", |n: &mut NodeHandle, child: NodeHandle| {
            n.append_child(&child).map_err(fail)
        })
        .register_fn("prepend_child", |n: &mut NodeHandle, child: NodeHandle| {
            n.prepend_child(&child).map_err(fail)
        })
        .register_fn("insert_child", |n: &mut NodeHandle, index: i64, child: NodeHandle| -> ScriptResult<()> {
            n.insert_child(index_arg(index)?, &child).map_err(fail)
        })
        .register_fn("insert_before", |n: &mut NodeHandle, new_child: NodeHandle, reference: NodeHandle| {
            n.insert_before(&new_child, &reference).map_err(fail)
        })
        .register_fn("remove_child", |n: &mut NodeHandle, child: NodeHandle| {
            n.remove_child(&child).map_err(fail)
        })
        .register_fn("replace_child", |n: &mut NodeHandle, new_child: NodeHandle, old_child: NodeHandle| {
            n.replace_child(&new_child, &old_child).map_err(fail)
        })
        .register_fn("move_child", |n: &mut NodeHandle, child: NodeHandle, index: i64| -> ScriptResult<()> {
            n.move_child(&child, index_arg(index)?).map_err(fail)
        })
        .register_fn("remove", |n: &mut NodeHandle| n.remove().map_err(fail))
        .register_fn("replace_with", |n: &mut NodeHandle, other: NodeHandle| {
            n.replace_with(&other).map_err(fail)
        })
        .register_fn("set_text", |n: &mut NodeHandle, text: &str| n.set_text(text).map_err(fail))
        .register_fn("clear", |n: &mut NodeHandle| n.clear().map_err(fail));
}

#[cfg(test)]
#[path = "sandbox_test.rs"]
mod tests;
