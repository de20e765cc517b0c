//! Host platform contract and the in-memory reference host.
//!
//! The engine never touches a real surface; everything it needs from the
//! platform goes through [`HostAdapter`]: primitive lifecycle, prop diffing,
//! a clock, the yield predicate, and deferred task scheduling.
//! [`MemoryHost`] implements the contract against plain vectors with a
//! scripted clock and a manually drained task queue, which is what the test
//! suites and demos drive.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use crate::collections::map::HashSet;
use crate::element::{PropValue, Props};

/// Opaque identity of one primitive node owned by the host.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct HostHandle(pub u64);

/// Identity of a scheduled host callback.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct TaskId(pub u64);

/// Urgency the engine attaches to a scheduled callback.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum TaskPriority {
    Immediate,
    UserBlocking,
    Normal,
    Low,
    Idle,
}

pub type HostTask = Box<dyn FnOnce()>;

/// Prop diff computed during completion and applied during commit.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct PropPatch {
    pub set: Vec<(Rc<str>, PropValue)>,
    pub unset: Vec<Rc<str>>,
}

impl PropPatch {
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.unset.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum HostError {
    CreateFailed { tag: Rc<str> },
    UnknownHandle(HostHandle),
    NotAChild { parent: HostHandle, child: HostHandle },
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostError::CreateFailed { tag } => write!(f, "host refused to create \"{tag}\""),
            HostError::UnknownHandle(handle) => write!(f, "unknown host handle {:?}", handle),
            HostError::NotAChild { parent, child } => {
                write!(f, "{:?} is not a child of {:?}", child, parent)
            }
        }
    }
}

impl std::error::Error for HostError {}

/// Everything the engine needs from the platform.
pub trait HostAdapter {
    fn create_instance(&self, tag: &str, props: &Props) -> Result<HostHandle, HostError>;
    fn create_text_instance(&self, text: &str) -> Result<HostHandle, HostError>;
    fn set_text(&self, handle: HostHandle, text: &str) -> Result<(), HostError>;
    fn append_child(&self, parent: HostHandle, child: HostHandle) -> Result<(), HostError>;
    fn insert_before(
        &self,
        parent: HostHandle,
        child: HostHandle,
        anchor: Option<HostHandle>,
    ) -> Result<(), HostError>;
    fn remove_child(&self, parent: HostHandle, child: HostHandle) -> Result<(), HostError>;
    /// `None` means the props are equivalent and no update flag is needed.
    fn compute_update_payload(
        &self,
        handle: HostHandle,
        tag: &str,
        old: &Props,
        new: &Props,
    ) -> Option<PropPatch>;
    fn apply_update_payload(&self, handle: HostHandle, patch: &PropPatch) -> Result<(), HostError>;
    /// When true, a lone text child is absorbed as content of the element
    /// itself and no separate text primitive is created.
    fn supports_text_only_children(&self, tag: &str, props: &Props) -> bool;
    /// Monotonic milliseconds.
    fn now(&self) -> u64;
    /// Checked between units of work in the time-sliced strategy.
    fn should_yield(&self) -> bool;
    fn schedule_callback(&self, priority: TaskPriority, task: HostTask) -> TaskId;
    fn cancel_callback(&self, id: TaskId);
}

/// One recorded mutation, for assertions on ordering and shape.
#[derive(Clone, Debug, PartialEq)]
pub enum HostOp {
    Create { handle: HostHandle, tag: Rc<str> },
    CreateText { handle: HostHandle, text: Rc<str> },
    SetText { handle: HostHandle, text: Rc<str> },
    Append { parent: HostHandle, child: HostHandle },
    InsertBefore {
        parent: HostHandle,
        child: HostHandle,
        anchor: HostHandle,
    },
    Remove { parent: HostHandle, child: HostHandle },
    Update { handle: HostHandle },
}

struct MemoryNode {
    tag: Rc<str>,
    props: Props,
    text: Option<Rc<str>>,
    children: Vec<HostHandle>,
}

struct ScheduledTask {
    id: TaskId,
    priority: TaskPriority,
    task: HostTask,
}

/// In-memory host: a tree of plain records plus an op log.
#[derive(Default)]
pub struct MemoryHost {
    nodes: RefCell<Vec<MemoryNode>>,
    ops: RefCell<Vec<HostOp>>,
    clock: Cell<u64>,
    yield_now: Cell<bool>,
    /// Armed one-shot: yield checks left before the next one fires.
    yield_budget: Cell<Option<u32>>,
    /// Tags whose creation fails, for host-failure tests.
    poisoned_tags: RefCell<HashSet<Rc<str>>>,
    /// Tags that absorb a lone text child as content.
    text_content_tags: RefCell<HashSet<Rc<str>>>,
    tasks: RefCell<Vec<ScheduledTask>>,
    next_task: Cell<u64>,
}

impl MemoryHost {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    fn push_op(&self, op: HostOp) {
        self.ops.borrow_mut().push(op);
    }

    fn alloc_node(&self, node: MemoryNode) -> HostHandle {
        let mut nodes = self.nodes.borrow_mut();
        nodes.push(node);
        HostHandle((nodes.len() - 1) as u64)
    }

    pub fn take_ops(&self) -> Vec<HostOp> {
        std::mem::take(&mut *self.ops.borrow_mut())
    }

    pub fn ops(&self) -> Vec<HostOp> {
        self.ops.borrow().clone()
    }

    pub fn advance_clock(&self, millis: u64) {
        self.clock.set(self.clock.get() + millis);
    }

    pub fn set_should_yield(&self, value: bool) {
        self.yield_now.set(value);
    }

    /// Arms a one-shot yield: the next `checks` yield checks pass, the one
    /// after fires, then the scripted flag applies again. Lets a test stop a
    /// pass partway through a tree rather than before its first unit.
    pub fn yield_after(&self, checks: u32) {
        self.yield_budget.set(Some(checks));
    }

    pub fn poison_tag(&self, tag: impl Into<Rc<str>>) {
        self.poisoned_tags.borrow_mut().insert(tag.into());
    }

    pub fn register_text_content_tag(&self, tag: impl Into<Rc<str>>) {
        self.text_content_tags.borrow_mut().insert(tag.into());
    }

    /// Creates a detached container node to render into.
    pub fn create_container(&self) -> HostHandle {
        self.alloc_node(MemoryNode {
            tag: Rc::from("#container"),
            props: Props::new(),
            text: None,
            children: Vec::new(),
        })
    }

    pub fn pending_task_count(&self) -> usize {
        self.tasks.borrow().len()
    }

    /// Runs the highest-priority scheduled callback, earliest first among
    /// equals. Returns false when the queue was empty.
    pub fn run_next_task(&self) -> bool {
        let next = {
            let mut tasks = self.tasks.borrow_mut();
            if tasks.is_empty() {
                return false;
            }
            let best = tasks
                .iter()
                .enumerate()
                .min_by_key(|(_, entry)| (entry.priority, entry.id.0))
                .map(|(index, _)| index);
            best.map(|index| tasks.remove(index))
        };
        if let Some(entry) = next {
            (entry.task)();
            true
        } else {
            false
        }
    }

    /// Drains scheduled callbacks until the queue stays empty.
    pub fn run_until_idle(&self) {
        while self.run_next_task() {}
    }

    /// Child tags (or text content) of a node, in host order.
    pub fn child_summaries(&self, parent: HostHandle) -> Vec<String> {
        let nodes = self.nodes.borrow();
        let parent = &nodes[parent.0 as usize];
        parent
            .children
            .iter()
            .map(|child| {
                let node = &nodes[child.0 as usize];
                match &node.text {
                    Some(text) if node.tag.as_ref() == "#text" => format!("\"{text}\""),
                    Some(text) => format!("{}[{text}]", node.tag),
                    None => node.tag.to_string(),
                }
            })
            .collect()
    }

    pub fn node_text(&self, handle: HostHandle) -> Option<Rc<str>> {
        self.nodes
            .borrow()
            .get(handle.0 as usize)
            .and_then(|node| node.text.clone())
    }

    pub fn node_prop(&self, handle: HostHandle, name: &str) -> Option<PropValue> {
        self.nodes
            .borrow()
            .get(handle.0 as usize)
            .and_then(|node| node.props.get(name).cloned())
    }

    fn check_handle(&self, handle: HostHandle) -> Result<(), HostError> {
        if (handle.0 as usize) < self.nodes.borrow().len() {
            Ok(())
        } else {
            Err(HostError::UnknownHandle(handle))
        }
    }
}

impl HostAdapter for MemoryHost {
    fn create_instance(&self, tag: &str, props: &Props) -> Result<HostHandle, HostError> {
        if self.poisoned_tags.borrow().contains(tag) {
            return Err(HostError::CreateFailed { tag: Rc::from(tag) });
        }
        let tag: Rc<str> = Rc::from(tag);
        let handle = self.alloc_node(MemoryNode {
            tag: Rc::clone(&tag),
            props: props.clone(),
            text: None,
            children: Vec::new(),
        });
        self.push_op(HostOp::Create { handle, tag });
        Ok(handle)
    }

    fn create_text_instance(&self, text: &str) -> Result<HostHandle, HostError> {
        let text: Rc<str> = Rc::from(text);
        let handle = self.alloc_node(MemoryNode {
            tag: Rc::from("#text"),
            props: Props::new(),
            text: Some(Rc::clone(&text)),
            children: Vec::new(),
        });
        self.push_op(HostOp::CreateText { handle, text });
        Ok(handle)
    }

    fn set_text(&self, handle: HostHandle, text: &str) -> Result<(), HostError> {
        self.check_handle(handle)?;
        let text: Rc<str> = Rc::from(text);
        self.nodes.borrow_mut()[handle.0 as usize].text = Some(Rc::clone(&text));
        self.push_op(HostOp::SetText { handle, text });
        Ok(())
    }

    fn append_child(&self, parent: HostHandle, child: HostHandle) -> Result<(), HostError> {
        self.check_handle(parent)?;
        self.check_handle(child)?;
        let mut nodes = self.nodes.borrow_mut();
        let children = &mut nodes[parent.0 as usize].children;
        children.retain(|c| *c != child);
        children.push(child);
        drop(nodes);
        self.push_op(HostOp::Append { parent, child });
        Ok(())
    }

    fn insert_before(
        &self,
        parent: HostHandle,
        child: HostHandle,
        anchor: Option<HostHandle>,
    ) -> Result<(), HostError> {
        let Some(anchor) = anchor else {
            return self.append_child(parent, child);
        };
        self.check_handle(parent)?;
        self.check_handle(child)?;
        let mut nodes = self.nodes.borrow_mut();
        let children = &mut nodes[parent.0 as usize].children;
        children.retain(|c| *c != child);
        let position = children
            .iter()
            .position(|c| *c == anchor)
            .ok_or(HostError::NotAChild { parent, child: anchor })?;
        children.insert(position, child);
        drop(nodes);
        self.push_op(HostOp::InsertBefore {
            parent,
            child,
            anchor,
        });
        Ok(())
    }

    fn remove_child(&self, parent: HostHandle, child: HostHandle) -> Result<(), HostError> {
        self.check_handle(parent)?;
        let mut nodes = self.nodes.borrow_mut();
        let children = &mut nodes[parent.0 as usize].children;
        let position = children
            .iter()
            .position(|c| *c == child)
            .ok_or(HostError::NotAChild { parent, child })?;
        children.remove(position);
        drop(nodes);
        self.push_op(HostOp::Remove { parent, child });
        Ok(())
    }

    fn compute_update_payload(
        &self,
        _handle: HostHandle,
        _tag: &str,
        old: &Props,
        new: &Props,
    ) -> Option<PropPatch> {
        let mut patch = PropPatch::default();
        for (name, value) in new.iter() {
            if old.get(name) != Some(value) {
                patch.set.push((Rc::clone(name), value.clone()));
            }
        }
        for (name, _) in old.iter() {
            if new.get(name).is_none() {
                patch.unset.push(Rc::clone(name));
            }
        }
        if patch.is_empty() {
            None
        } else {
            Some(patch)
        }
    }

    fn apply_update_payload(&self, handle: HostHandle, patch: &PropPatch) -> Result<(), HostError> {
        self.check_handle(handle)?;
        let mut nodes = self.nodes.borrow_mut();
        let node = &mut nodes[handle.0 as usize];
        let mut props = Props::new();
        for (name, value) in node.props.iter() {
            if patch.unset.iter().any(|unset| unset == name) {
                continue;
            }
            props = props.set(Rc::clone(name), value.clone());
        }
        for (name, value) in &patch.set {
            props = props.set(Rc::clone(name), value.clone());
        }
        node.props = props;
        drop(nodes);
        self.push_op(HostOp::Update { handle });
        Ok(())
    }

    fn supports_text_only_children(&self, tag: &str, _props: &Props) -> bool {
        self.text_content_tags.borrow().contains(tag)
    }

    fn now(&self) -> u64 {
        self.clock.get()
    }

    fn should_yield(&self) -> bool {
        if let Some(remaining) = self.yield_budget.get() {
            if remaining == 0 {
                self.yield_budget.set(None);
                return true;
            }
            self.yield_budget.set(Some(remaining - 1));
            return false;
        }
        self.yield_now.get()
    }

    fn schedule_callback(&self, priority: TaskPriority, task: HostTask) -> TaskId {
        let id = TaskId(self.next_task.get());
        self.next_task.set(id.0 + 1);
        self.tasks.borrow_mut().push(ScheduledTask {
            id,
            priority,
            task,
        });
        id
    }

    fn cancel_callback(&self, id: TaskId) {
        self.tasks.borrow_mut().retain(|entry| entry.id != id);
    }
}
