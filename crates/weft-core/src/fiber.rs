//! The dual-buffered unit of work.
//!
//! Exactly two [`Fiber`]s ever represent one logical tree position: the
//! committed "current" node and its "work-in-progress" counterpart, cross
//! linked through `alternate`. Fibers live in a [`FiberArena`] and refer to
//! each other by index, so `parent` and `alternate` back-references cannot
//! form ownership cycles.

use std::rc::Rc;

use crate::element::{Component, Element, Key, Props};
use crate::hooks::{EffectRecord, Hook};
use crate::host::{HostHandle, PropPatch};
use crate::lanes::Lanes;

/// Index of a fiber inside its arena. Stable for the fiber's lifetime.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct FiberId(pub(crate) u32);

/// Pending host operations for one fiber, plus the aggregate for its subtree.
#[derive(Copy, Clone, PartialEq, Eq, Default)]
pub struct Flags(pub(crate) u16);

impl Flags {
    pub const NONE: Flags = Flags(0);
    /// Node must be (re-)inserted into its host parent.
    pub const PLACEMENT: Flags = Flags(1 << 0);
    /// Host node has a computed prop patch to apply.
    pub const UPDATE: Flags = Flags(1 << 1);
    /// One or more children recorded in `deletions` must be detached.
    pub const CHILD_DELETION: Flags = Flags(1 << 2);
    /// Text-only content of a host node changed.
    pub const CONTENT_RESET: Flags = Flags(1 << 3);
    /// Passive effects on this node need teardown/setup after commit.
    pub const PASSIVE: Flags = Flags(1 << 4);
    /// Layout-synchronous effects need teardown/setup during commit.
    pub const LAYOUT: Flags = Flags(1 << 5);

    pub const MUTATION_MASK: Flags = Flags(
        Self::PLACEMENT.0
            | Self::UPDATE.0
            | Self::CHILD_DELETION.0
            | Self::CONTENT_RESET.0,
    );

    pub fn merge(self, other: Flags) -> Flags {
        Flags(self.0 | other.0)
    }

    pub fn remove(self, other: Flags) -> Flags {
        Flags(self.0 & !other.0)
    }

    pub fn intersects(self, other: Flags) -> bool {
        (self.0 & other.0) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Debug for Flags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Flags({:#08b})", self.0)
    }
}

/// Resolved behavior of a fiber. Components mount as `Indeterminate` and
/// settle into `StatefulFn` or `StatelessFn` after their first body run.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum FiberKind {
    Root,
    Host,
    Text,
    StatefulFn,
    StatelessFn,
    Fragment,
    Indeterminate,
}

/// Opaque identity used for type-compatibility checks during diffing.
#[derive(Clone, Debug)]
pub enum ElementType {
    Root,
    Host(Rc<str>),
    Text,
    Component(Component),
    Fragment,
}

impl ElementType {
    pub fn compatible(&self, other: &ElementType) -> bool {
        match (self, other) {
            (ElementType::Root, ElementType::Root) => true,
            (ElementType::Host(a), ElementType::Host(b)) => a == b,
            (ElementType::Text, ElementType::Text) => true,
            (ElementType::Component(a), ElementType::Component(b)) => a.same_type(b),
            (ElementType::Fragment, ElementType::Fragment) => true,
            _ => false,
        }
    }
}

/// Per-kind input to a fiber: the "props" side of the double buffer.
#[derive(Clone, Debug, Default)]
pub enum NodeInput {
    #[default]
    None,
    Root(Option<Element>),
    Host {
        props: Props,
        children: Vec<Element>,
    },
    Text(Rc<str>),
    Component(Props),
    Fragment(Vec<Element>),
}

impl NodeInput {
    pub fn host_props(&self) -> Option<&Props> {
        match self {
            NodeInput::Host { props, .. } => Some(props),
            _ => None,
        }
    }

    pub fn text(&self) -> Option<&Rc<str>> {
        match self {
            NodeInput::Text(text) => Some(text),
            _ => None,
        }
    }
}

pub struct Fiber {
    pub kind: FiberKind,
    pub key: Option<Key>,
    pub element_type: ElementType,
    pub pending_props: NodeInput,
    pub memoized_props: NodeInput,

    // Tree links. `parent` and `alternate` are non-owning back references.
    pub child: Option<FiberId>,
    pub sibling: Option<FiberId>,
    pub parent: Option<FiberId>,
    pub alternate: Option<FiberId>,
    /// Position among siblings, for move detection.
    pub index: u32,

    pub flags: Flags,
    pub subtree_flags: Flags,
    /// Current-tree children scheduled for detachment during commit.
    pub deletions: Vec<FiberId>,

    pub lanes: Lanes,

    /// Positional state chain for stateful function fibers.
    pub hooks: Vec<Hook>,
    /// Registered effects in creation order, separate from the state chain
    /// so commit walks only effects.
    pub effects: Vec<Rc<EffectRecord>>,

    /// Host instance backing host/text fibers once created.
    pub host: Option<HostHandle>,
    /// Prop patch computed during completion, applied during commit.
    pub update_payload: Option<PropPatch>,
    /// Committed text content for text fibers and text-absorbing hosts.
    pub memoized_text: Option<Rc<str>>,
}

impl Fiber {
    pub fn new(kind: FiberKind, element_type: ElementType, pending_props: NodeInput) -> Self {
        Self {
            kind,
            key: None,
            element_type,
            pending_props,
            memoized_props: NodeInput::None,
            child: None,
            sibling: None,
            parent: None,
            alternate: None,
            index: 0,
            flags: Flags::NONE,
            subtree_flags: Flags::NONE,
            deletions: Vec::new(),
            lanes: Lanes::NONE,
            hooks: Vec::new(),
            effects: Vec::new(),
            host: None,
            update_payload: None,
            memoized_text: None,
        }
    }

    pub fn is_host_kind(&self) -> bool {
        matches!(self.kind, FiberKind::Host | FiberKind::Text)
    }
}

/// Arena of fibers with slot reuse.
///
/// Freed slots go on a free list and are handed out again; a `FiberId` must
/// not be used after its fiber is released.
#[derive(Default)]
pub struct FiberArena {
    slots: Vec<Option<Fiber>>,
    free: Vec<u32>,
}

impl FiberArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, fiber: Fiber) -> FiberId {
        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(fiber);
                FiberId(index)
            }
            None => {
                self.slots.push(Some(fiber));
                FiberId((self.slots.len() - 1) as u32)
            }
        }
    }

    pub fn release(&mut self, id: FiberId) {
        let slot = &mut self.slots[id.0 as usize];
        debug_assert!(slot.is_some(), "double release of fiber {:?}", id);
        if slot.take().is_some() {
            self.free.push(id.0);
        }
    }

    /// Releases a fiber, its alternate, and every descendant of both.
    pub fn release_subtree(&mut self, id: FiberId) {
        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            let (child, alternate) = {
                let fiber = &self[id];
                (fiber.child, fiber.alternate)
            };
            let mut next = child;
            while let Some(child_id) = next {
                next = self[child_id].sibling;
                stack.push(child_id);
            }
            if let Some(alt) = alternate {
                self[alt].alternate = None;
                self.release(alt);
            }
            self.release(id);
        }
    }

    pub fn get(&self, id: FiberId) -> Option<&Fiber> {
        self.slots.get(id.0 as usize).and_then(|slot| slot.as_ref())
    }

    pub fn get_mut(&mut self, id: FiberId) -> Option<&mut Fiber> {
        self.slots
            .get_mut(id.0 as usize)
            .and_then(|slot| slot.as_mut())
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Creates or refreshes the work-in-progress counterpart of `current`,
    /// reusing the alternate slot when one exists from a previous cycle.
    pub fn create_work_in_progress(
        &mut self,
        current: FiberId,
        pending_props: NodeInput,
    ) -> FiberId {
        if let Some(wip) = self[current].alternate {
            let (kind, key, element_type, memoized_props, child, sibling, index) = {
                let cur = &self[current];
                (
                    cur.kind,
                    cur.key.clone(),
                    cur.element_type.clone(),
                    cur.memoized_props.clone(),
                    cur.child,
                    cur.sibling,
                    cur.index,
                )
            };
            let (lanes, hooks, effects, host, memoized_text) = {
                let cur = &self[current];
                (
                    cur.lanes,
                    cur.hooks.clone(),
                    cur.effects.clone(),
                    cur.host,
                    cur.memoized_text.clone(),
                )
            };
            let wip_fiber = &mut self[wip];
            wip_fiber.kind = kind;
            wip_fiber.key = key;
            wip_fiber.element_type = element_type;
            wip_fiber.pending_props = pending_props;
            wip_fiber.memoized_props = memoized_props;
            wip_fiber.child = child;
            wip_fiber.sibling = sibling;
            wip_fiber.index = index;
            wip_fiber.flags = Flags::NONE;
            wip_fiber.subtree_flags = Flags::NONE;
            wip_fiber.deletions.clear();
            wip_fiber.lanes = lanes;
            wip_fiber.hooks = hooks;
            wip_fiber.effects = effects;
            wip_fiber.host = host;
            wip_fiber.update_payload = None;
            wip_fiber.memoized_text = memoized_text;
            wip
        } else {
            let cur = &self[current];
            let mut wip_fiber = Fiber::new(cur.kind, cur.element_type.clone(), pending_props);
            wip_fiber.key = cur.key.clone();
            wip_fiber.memoized_props = cur.memoized_props.clone();
            wip_fiber.child = cur.child;
            wip_fiber.sibling = cur.sibling;
            wip_fiber.index = cur.index;
            wip_fiber.lanes = cur.lanes;
            wip_fiber.hooks = cur.hooks.clone();
            wip_fiber.effects = cur.effects.clone();
            wip_fiber.host = cur.host;
            wip_fiber.memoized_text = cur.memoized_text.clone();
            wip_fiber.alternate = Some(current);
            let wip = self.alloc(wip_fiber);
            self[current].alternate = Some(wip);
            wip
        }
    }
}

impl std::ops::Index<FiberId> for FiberArena {
    type Output = Fiber;

    fn index(&self, id: FiberId) -> &Fiber {
        self.slots[id.0 as usize]
            .as_ref()
            .unwrap_or_else(|| panic!("stale fiber id {:?}", id))
    }
}

impl std::ops::IndexMut<FiberId> for FiberArena {
    fn index_mut(&mut self, id: FiberId) -> &mut Fiber {
        self.slots[id.0 as usize]
            .as_mut()
            .unwrap_or_else(|| panic!("stale fiber id {:?}", id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_fiber(tag: &str) -> Fiber {
        Fiber::new(
            FiberKind::Host,
            ElementType::Host(Rc::from(tag)),
            NodeInput::Host {
                props: Props::new(),
                children: vec![],
            },
        )
    }

    #[test]
    fn alloc_reuses_freed_slots() {
        let mut arena = FiberArena::new();
        let a = arena.alloc(host_fiber("a"));
        let b = arena.alloc(host_fiber("b"));
        arena.release(a);
        let c = arena.alloc(host_fiber("c"));
        assert_eq!(a, c);
        assert_ne!(b, c);
        assert_eq!(arena.live_count(), 2);
    }

    #[test]
    fn work_in_progress_pairs_stay_cross_linked() {
        let mut arena = FiberArena::new();
        let current = arena.alloc(host_fiber("box"));
        let wip = arena.create_work_in_progress(current, NodeInput::None);
        assert_eq!(arena[current].alternate, Some(wip));
        assert_eq!(arena[wip].alternate, Some(current));
        // A second cycle reuses the same pair rather than allocating.
        let again = arena.create_work_in_progress(current, NodeInput::None);
        assert_eq!(again, wip);
        assert_eq!(arena.live_count(), 2);
    }

    #[test]
    fn work_in_progress_resets_effects_bookkeeping() {
        let mut arena = FiberArena::new();
        let current = arena.alloc(host_fiber("box"));
        let wip = arena.create_work_in_progress(current, NodeInput::None);
        arena[wip].flags = Flags::PLACEMENT;
        arena[wip].subtree_flags = Flags::UPDATE;
        arena[wip].deletions.push(current);
        let again = arena.create_work_in_progress(current, NodeInput::None);
        assert_eq!(again, wip);
        assert!(arena[again].flags.is_empty());
        assert!(arena[again].subtree_flags.is_empty());
        assert!(arena[again].deletions.is_empty());
    }

    #[test]
    fn release_subtree_frees_both_buffers() {
        let mut arena = FiberArena::new();
        let parent = arena.alloc(host_fiber("parent"));
        let child = arena.alloc(host_fiber("child"));
        arena[parent].child = Some(child);
        arena[child].parent = Some(parent);
        let _wip = arena.create_work_in_progress(child, NodeInput::None);
        assert_eq!(arena.live_count(), 3);
        arena.release_subtree(parent);
        assert_eq!(arena.live_count(), 0);
    }
}
