//! Per-level child diffing.
//!
//! Given a parent's committed first child and the next-children description,
//! produces a new sibling chain on the work-in-progress side and marks
//! structural flags. Two modes: when `track` is false (initial construction)
//! no deletion or placement flags are emitted, since there is nothing to
//! diff against.
//!
//! Move detection is the single-direction `last_placed_index` heuristic: a
//! reused child is flagged for placement exactly when its old index has
//! fallen behind the highest old index already kept in place. Pathological
//! reversals therefore produce more moves than a longest-increasing-
//! subsequence diff would; that trade-off is deliberate and downstream
//! behavior depends on it, so it must not be "improved".

use std::rc::Rc;

use crate::collections::map::HashMap;
use crate::collections::map::HashSet;
use crate::element::{Element, ElementKind, Key};
use crate::fiber::{ElementType, Fiber, FiberArena, FiberId, FiberKind, Flags, NodeInput};
use crate::lanes::Lanes;
use crate::RenderError;

fn element_type_of(element: &Element) -> ElementType {
    match &element.kind {
        ElementKind::Host { tag, .. } => ElementType::Host(Rc::clone(tag)),
        ElementKind::Text(_) => ElementType::Text,
        ElementKind::Component { component, .. } => ElementType::Component(component.clone()),
        ElementKind::Fragment { .. } => ElementType::Fragment,
    }
}

fn node_input_of(element: &Element) -> NodeInput {
    match &element.kind {
        ElementKind::Host { props, children, .. } => NodeInput::Host {
            props: props.clone(),
            children: children.clone(),
        },
        ElementKind::Text(text) => NodeInput::Text(Rc::clone(text)),
        ElementKind::Component { props, .. } => NodeInput::Component(props.clone()),
        ElementKind::Fragment { children } => NodeInput::Fragment(children.clone()),
    }
}

fn validate(element: &Element) -> Result<(), RenderError> {
    if let ElementKind::Host { tag, .. } = &element.kind {
        if tag.is_empty() {
            return Err(RenderError::InvalidElement {
                reason: "host element with empty tag".into(),
            });
        }
    }
    Ok(())
}

pub(crate) fn create_fiber_from_element(
    arena: &mut FiberArena,
    element: &Element,
    lanes: Lanes,
) -> Result<FiberId, RenderError> {
    validate(element)?;
    let kind = match &element.kind {
        ElementKind::Host { .. } => FiberKind::Host,
        ElementKind::Text(_) => FiberKind::Text,
        ElementKind::Component { .. } => FiberKind::Indeterminate,
        ElementKind::Fragment { .. } => FiberKind::Fragment,
    };
    let mut fiber = Fiber::new(kind, element_type_of(element), node_input_of(element));
    fiber.key = element.key.clone();
    fiber.lanes = lanes;
    Ok(arena.alloc(fiber))
}

/// Reuses `old` for the next pass: refreshes its work-in-progress buffer
/// with the new input and detaches it from its previous sibling chain.
fn use_fiber(arena: &mut FiberArena, old: FiberId, pending: NodeInput) -> FiberId {
    let wip = arena.create_work_in_progress(old, pending);
    let fiber = &mut arena[wip];
    fiber.sibling = None;
    fiber.index = 0;
    wip
}

struct Reconcile<'a> {
    arena: &'a mut FiberArena,
    parent: FiberId,
    track: bool,
    lanes: Lanes,
}

impl<'a> Reconcile<'a> {
    /// Records `child` (a current-tree fiber) for detachment during commit.
    fn delete_child(&mut self, child: FiberId) {
        if !self.track {
            return;
        }
        let parent = &mut self.arena[self.parent];
        parent.deletions.push(child);
        parent.flags = parent.flags.merge(Flags::CHILD_DELETION);
    }

    fn delete_remaining(&mut self, mut child: Option<FiberId>) {
        while let Some(id) = child {
            child = self.arena[id].sibling;
            self.delete_child(id);
        }
    }

    /// Can `old` be reused for `element`? Keys must agree (both absent
    /// counts as agreement) and the element types must be compatible.
    fn key_matches(&self, old: FiberId, element: &Element) -> bool {
        self.arena[old].key.as_deref() == element.key.as_deref()
    }

    fn type_matches(&self, old: FiberId, element: &Element) -> bool {
        self.arena[old]
            .element_type
            .compatible(&element_type_of(element))
    }

    /// Reuse-or-create for a key-matched slot. Returns the wip fiber and
    /// whether `old` was actually reused.
    fn update_matched(
        &mut self,
        old: FiberId,
        element: &Element,
    ) -> Result<(FiberId, bool), RenderError> {
        validate(element)?;
        if self.type_matches(old, element) {
            Ok((use_fiber(self.arena, old, node_input_of(element)), true))
        } else {
            Ok((create_fiber_from_element(self.arena, element, self.lanes)?, false))
        }
    }

    /// Lock-step slot update for the forward scan. `None` means the keys
    /// stopped matching and the caller must fall back to the map pass.
    fn update_slot(
        &mut self,
        old: Option<FiberId>,
        element: &Element,
    ) -> Result<Option<FiberId>, RenderError> {
        let old_key = old.and_then(|id| self.arena[id].key.clone());
        match &element.kind {
            ElementKind::Text(_) => {
                // Text never carries a key; a keyed old child is a mismatch,
                // a non-keyed one in the same slot is a valid reuse candidate.
                if old_key.is_some() {
                    return Ok(None);
                }
                match old {
                    Some(id) => {
                        let (fiber, reused) = self.update_matched(id, element)?;
                        if !reused {
                            self.delete_child(id);
                        }
                        Ok(Some(fiber))
                    }
                    None => Ok(Some(create_fiber_from_element(
                        self.arena, element, self.lanes,
                    )?)),
                }
            }
            _ => {
                if old_key.as_deref() != element.key.as_deref() {
                    return Ok(None);
                }
                match old {
                    Some(id) => {
                        let (fiber, reused) = self.update_matched(id, element)?;
                        if !reused {
                            self.delete_child(id);
                        }
                        Ok(Some(fiber))
                    }
                    None => Ok(Some(create_fiber_from_element(
                        self.arena, element, self.lanes,
                    )?)),
                }
            }
        }
    }

    /// Assigns the child's position and decides whether it moved. Returns
    /// the updated `last_placed_index`: the highest old index kept in place
    /// so far. A reused child whose old index fell behind it is flagged for
    /// placement; a child with no alternate is a fresh insertion.
    fn place_child(&mut self, child: FiberId, last_placed_index: u32, new_index: u32) -> u32 {
        self.arena[child].index = new_index;
        if !self.track {
            return last_placed_index;
        }
        let old_index = self.arena[child]
            .alternate
            .map(|alt| self.arena[alt].index);
        match old_index {
            Some(old_index) if old_index >= last_placed_index => old_index,
            _ => {
                let fiber = &mut self.arena[child];
                fiber.flags = fiber.flags.merge(Flags::PLACEMENT);
                last_placed_index
            }
        }
    }

    fn link(&mut self, previous: &mut Option<FiberId>, first: &mut Option<FiberId>, next: FiberId) {
        self.arena[next].parent = Some(self.parent);
        match previous {
            Some(prev) => self.arena[*prev].sibling = Some(next),
            None => *first = Some(next),
        }
        *previous = Some(next);
    }

    fn check_duplicate_key(
        &self,
        seen: &mut HashSet<Key>,
        element: &Element,
    ) -> Result<(), RenderError> {
        if let Some(key) = &element.key {
            if !seen.insert(Rc::clone(key)) {
                return Err(RenderError::InvalidElement {
                    reason: format!("duplicate key \"{key}\" among siblings"),
                });
            }
        }
        Ok(())
    }

    fn reconcile_array(
        &mut self,
        current_first: Option<FiberId>,
        next: &[Element],
    ) -> Result<Option<FiberId>, RenderError> {
        let mut seen_keys: HashSet<Key> = HashSet::default();
        let mut first: Option<FiberId> = None;
        let mut previous: Option<FiberId> = None;
        let mut old_fiber = current_first;
        let mut last_placed_index = 0u32;
        let mut new_index = 0usize;

        // Forward scan while keys keep matching slot for slot.
        while let Some(old) = old_fiber {
            if new_index >= next.len() {
                break;
            }
            let element = &next[new_index];
            // An old child that sat past this position stays available for
            // the map pass instead of being consumed out of order.
            let (old_for_slot, next_old) = if self.arena[old].index > new_index as u32 {
                (None, Some(old))
            } else {
                (Some(old), self.arena[old].sibling)
            };
            let Some(new_fiber) = self.update_slot(old_for_slot, element)? else {
                break;
            };
            self.check_duplicate_key(&mut seen_keys, element)?;
            last_placed_index = self.place_child(new_fiber, last_placed_index, new_index as u32);
            self.link(&mut previous, &mut first, new_fiber);
            old_fiber = next_old;
            new_index += 1;
        }

        if new_index == next.len() {
            // Next list exhausted: every remaining old child is deleted.
            self.delete_remaining(old_fiber);
            return Ok(first);
        }

        if old_fiber.is_none() {
            // Old list exhausted: the rest are pure insertions.
            for element in &next[new_index..] {
                self.check_duplicate_key(&mut seen_keys, element)?;
                let new_fiber = create_fiber_from_element(self.arena, element, self.lanes)?;
                last_placed_index =
                    self.place_child(new_fiber, last_placed_index, new_index as u32);
                self.link(&mut previous, &mut first, new_fiber);
                new_index += 1;
            }
            return Ok(first);
        }

        // Map-assisted pass over the remainders: key if present, else the
        // old positional index.
        let mut existing: HashMap<MapKey, FiberId> = HashMap::default();
        let mut cursor = old_fiber;
        while let Some(id) = cursor {
            let fiber = &self.arena[id];
            let map_key = match &fiber.key {
                Some(key) => MapKey::Keyed(Rc::clone(key)),
                None => MapKey::Index(fiber.index),
            };
            existing.insert(map_key, id);
            cursor = fiber.sibling;
        }

        for element in &next[new_index..] {
            self.check_duplicate_key(&mut seen_keys, element)?;
            let map_key = match &element.key {
                Some(key) => MapKey::Keyed(Rc::clone(key)),
                None => MapKey::Index(new_index as u32),
            };
            // A non-keyed description looks up by position and can only meet
            // a non-keyed old child, since keyed olds are indexed by key.
            let candidate = existing.get(&map_key).copied();
            let new_fiber = match candidate {
                Some(old) => {
                    let (fiber, reused) = self.update_matched(old, element)?;
                    if reused {
                        existing.remove(&map_key);
                    }
                    fiber
                }
                None => create_fiber_from_element(self.arena, element, self.lanes)?,
            };
            last_placed_index = self.place_child(new_fiber, last_placed_index, new_index as u32);
            self.link(&mut previous, &mut first, new_fiber);
            new_index += 1;
        }

        // Anything unconsumed in the map has no next-tree counterpart.
        if self.track {
            let leftovers: Vec<FiberId> = existing.values().copied().collect();
            for old in leftovers {
                self.delete_child(old);
            }
        }
        Ok(first)
    }

    /// Single-description reconciliation: walk the old chain once looking
    /// for a key match, reusing it when the type also matches.
    fn reconcile_single(
        &mut self,
        current_first: Option<FiberId>,
        element: &Element,
    ) -> Result<Option<FiberId>, RenderError> {
        if let ElementKind::Text(_) = element.kind {
            return self.reconcile_single_text(current_first, element);
        }
        let mut child = current_first;
        while let Some(id) = child {
            if self.key_matches(id, element) {
                if self.type_matches(id, element) {
                    self.delete_remaining(self.arena[id].sibling);
                    let fiber = use_fiber(self.arena, id, node_input_of(element));
                    self.arena[fiber].parent = Some(self.parent);
                    return Ok(Some(fiber));
                }
                // Matched key, wrong type: nothing after it can match either.
                self.delete_remaining(Some(id));
                break;
            }
            let sibling = self.arena[id].sibling;
            self.delete_child(id);
            child = sibling;
        }
        let fiber = create_fiber_from_element(self.arena, element, self.lanes)?;
        self.arena[fiber].parent = Some(self.parent);
        if self.track {
            let f = &mut self.arena[fiber];
            f.flags = f.flags.merge(Flags::PLACEMENT);
        }
        Ok(Some(fiber))
    }

    fn reconcile_single_text(
        &mut self,
        current_first: Option<FiberId>,
        element: &Element,
    ) -> Result<Option<FiberId>, RenderError> {
        if let Some(id) = current_first {
            if self.arena[id].kind == FiberKind::Text {
                self.delete_remaining(self.arena[id].sibling);
                let fiber = use_fiber(self.arena, id, node_input_of(element));
                self.arena[fiber].parent = Some(self.parent);
                return Ok(Some(fiber));
            }
            self.delete_remaining(Some(id));
        }
        let fiber = create_fiber_from_element(self.arena, element, self.lanes)?;
        self.arena[fiber].parent = Some(self.parent);
        if self.track {
            let f = &mut self.arena[fiber];
            f.flags = f.flags.merge(Flags::PLACEMENT);
        }
        Ok(Some(fiber))
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
enum MapKey {
    Keyed(Key),
    Index(u32),
}

/// Reconciles a parent's children against an array description.
pub(crate) fn reconcile_children(
    arena: &mut FiberArena,
    parent: FiberId,
    current_first: Option<FiberId>,
    next: &[Element],
    track: bool,
    lanes: Lanes,
) -> Result<Option<FiberId>, RenderError> {
    let mut ctx = Reconcile {
        arena,
        parent,
        track,
        lanes,
    };
    ctx.reconcile_array(current_first, next)
}

/// Reconciles a parent's children against a single-node description.
pub(crate) fn reconcile_single(
    arena: &mut FiberArena,
    parent: FiberId,
    current_first: Option<FiberId>,
    element: &Element,
    track: bool,
    lanes: Lanes,
) -> Result<Option<FiberId>, RenderError> {
    let mut ctx = Reconcile {
        arena,
        parent,
        track,
        lanes,
    };
    ctx.reconcile_single(current_first, element)
}

/// Validates a whole description eagerly, so a malformed tree is reported
/// synchronously to the caller before any work is scheduled. Component
/// bodies are opaque here; their output is validated when it is produced.
pub(crate) fn validate_element_tree(element: &Element) -> Result<(), RenderError> {
    validate(element)?;
    let children: &[Element] = match &element.kind {
        ElementKind::Host { children, .. } => children,
        ElementKind::Fragment { children } => children,
        _ => return Ok(()),
    };
    let mut seen: HashSet<Key> = HashSet::default();
    for child in children {
        if let Some(key) = &child.key {
            if !seen.insert(Rc::clone(key)) {
                return Err(RenderError::InvalidElement {
                    reason: format!("duplicate key \"{key}\" among siblings"),
                });
            }
        }
        validate_element_tree(child)?;
    }
    Ok(())
}

/// Deletes every current child; used when the next description is empty.
pub(crate) fn delete_all_children(
    arena: &mut FiberArena,
    parent: FiberId,
    current_first: Option<FiberId>,
    track: bool,
    lanes: Lanes,
) {
    let mut ctx = Reconcile {
        arena,
        parent,
        track,
        lanes,
    };
    ctx.delete_remaining(current_first);
}
