//! The commit phase.
//!
//! Once a work-in-progress tree completes, its accumulated flags are applied
//! to the host in one synchronous mutation pass: deletions detach subtrees
//! (running their effect teardowns), placements insert or move host nodes,
//! updates apply prop patches and text changes. The finished tree then
//! becomes current, layout effects run before control returns to the host,
//! and passive effects are deferred to a scheduled callback.
//!
//! Placement anchors follow the finished tree: a placed node is inserted
//! before the nearest following host node that is not itself being placed in
//! this commit, or appended when none exists. Children are processed left to
//! right so siblings placed before one shared anchor keep their order.

use std::rc::Rc;

use crate::fiber::{FiberArena, FiberId, FiberKind, Flags};
use crate::hooks::{self, EffectKind, EffectRecord};
use crate::host::{HostHandle, TaskPriority};
use crate::lanes::Lanes;
use crate::scheduler::{EngineInner, RootInner, WorkStatus};
use crate::RenderError;

pub(crate) fn commit_root(
    engine: &Rc<EngineInner>,
    root: &Rc<RootInner>,
    finished: FiberId,
    lanes: Lanes,
) -> Result<(), RenderError> {
    root.status.set(WorkStatus::Committing);
    log::debug!("committing {:?} for {:?}", lanes, root.container);

    commit_mutations(engine, finished)?;

    // The finished tree becomes current; the old current survives as the
    // alternate buffer for the next pass.
    root.current.set(finished);
    root.wip.set(None);
    root.wip_lanes.set(Lanes::NONE);
    root.next_unit.set(None);

    root.lane_state.borrow_mut().mark_committed(lanes);
    if let Some(fold) = root.pending_fold.borrow_mut().take() {
        *root.base_element.borrow_mut() = fold.base_element;
        *root.queue.borrow_mut() = fold.base_queue;
    }

    let layout = {
        let arena = engine.arena.borrow();
        let mut effects = Vec::new();
        collect_effects(&arena, finished, EffectKind::Layout, Flags::LAYOUT, &mut effects);
        effects
    };
    if !layout.is_empty() {
        log::trace!("running {} layout effects", layout.len());
        for effect in &layout {
            effect.run_teardown();
        }
        for effect in &layout {
            effect.run_setup();
        }
    }

    let has_passive = {
        let arena = engine.arena.borrow();
        let fiber = &arena[finished];
        fiber.flags.intersects(Flags::PASSIVE) || fiber.subtree_flags.intersects(Flags::PASSIVE)
    };
    if has_passive && !root.pending_passive.replace(true) {
        let engine_weak = Rc::downgrade(engine);
        let root_weak = Rc::downgrade(root);
        let task = engine.host.schedule_callback(
            TaskPriority::Normal,
            Box::new(move || {
                if let (Some(engine), Some(root)) = (engine_weak.upgrade(), root_weak.upgrade()) {
                    root.passive_task.set(None);
                    engine.flush_passive(&root);
                }
            }),
        );
        root.passive_task.set(Some(task));
    }

    root.status.set(WorkStatus::Idle);
    Ok(())
}

/// Applies the mutation flags of `fiber` and its flagged subtree to the
/// host, deletions first at every level.
fn commit_mutations(engine: &Rc<EngineInner>, fiber: FiberId) -> Result<(), RenderError> {
    let deletions = std::mem::take(&mut engine.arena.borrow_mut()[fiber].deletions);
    if !deletions.is_empty() {
        let parent_handle = host_parent_handle(&engine.arena.borrow(), fiber);
        for deleted in deletions {
            commit_deletion(engine, parent_handle, deleted)?;
        }
    }

    let flags = engine.arena.borrow()[fiber].flags;
    if flags.intersects(Flags::PLACEMENT) {
        commit_placement(engine, fiber)?;
        clear_flag(engine, fiber, Flags::PLACEMENT);
    }
    if flags.intersects(Flags::UPDATE) {
        commit_update(engine, fiber)?;
        clear_flag(engine, fiber, Flags::UPDATE);
    }
    if flags.intersects(Flags::CONTENT_RESET) {
        commit_content_reset(engine, fiber)?;
        clear_flag(engine, fiber, Flags::CONTENT_RESET);
    }

    let descend = engine.arena.borrow()[fiber]
        .subtree_flags
        .intersects(Flags::MUTATION_MASK);
    if descend {
        let mut child = engine.arena.borrow()[fiber].child;
        while let Some(id) = child {
            commit_mutations(engine, id)?;
            child = engine.arena.borrow()[id].sibling;
        }
    }
    Ok(())
}

fn clear_flag(engine: &Rc<EngineInner>, fiber: FiberId, flag: Flags) {
    let mut arena = engine.arena.borrow_mut();
    let f = &mut arena[fiber];
    f.flags = f.flags.remove(flag);
}

/// Detaches a current-tree subtree: effect teardowns outside-in, host
/// removal of its topmost host nodes, then arena release of both buffers.
fn commit_deletion(
    engine: &Rc<EngineInner>,
    parent_handle: HostHandle,
    deleted: FiberId,
) -> Result<(), RenderError> {
    let (effects, hosts) = {
        let arena = engine.arena.borrow();
        let mut effects: Vec<Vec<Rc<EffectRecord>>> = Vec::new();
        let mut hosts: Vec<HostHandle> = Vec::new();
        collect_unmount(&arena, deleted, true, &mut effects, &mut hosts);
        (effects, hosts)
    };
    log::trace!("deleting subtree at {:?}", deleted);
    for fiber_effects in &effects {
        hooks::teardown_all(fiber_effects);
    }
    for host in hosts {
        engine
            .host
            .remove_child(parent_handle, host)
            .map_err(RenderError::Host)?;
    }
    engine.arena.borrow_mut().release_subtree(deleted);
    Ok(())
}

/// Gathers, outside-in, the effect lists of every fiber in a doomed subtree
/// and the topmost host handles to detach.
fn collect_unmount(
    arena: &FiberArena,
    fiber: FiberId,
    topmost: bool,
    effects: &mut Vec<Vec<Rc<EffectRecord>>>,
    hosts: &mut Vec<HostHandle>,
) {
    let f = &arena[fiber];
    if !f.effects.is_empty() {
        effects.push(f.effects.clone());
    }
    let still_topmost = if f.is_host_kind() {
        if topmost {
            if let Some(handle) = f.host {
                hosts.push(handle);
            }
        }
        false
    } else {
        topmost
    };
    let mut child = f.child;
    while let Some(id) = child {
        collect_unmount(arena, id, still_topmost, effects, hosts);
        child = arena[id].sibling;
    }
}

/// Inserts (or moves) the topmost host nodes of a placed fiber before the
/// anchor dictated by the finished tree. The insertion parent is resolved
/// from the placed fiber's parent: starting at the fiber itself would hand a
/// placed host node its own handle.
fn commit_placement(engine: &Rc<EngineInner>, fiber: FiberId) -> Result<(), RenderError> {
    let (parent_handle, anchor, hosts) = {
        let arena = engine.arena.borrow();
        let parent = arena[fiber]
            .parent
            .unwrap_or_else(|| panic!("placed fiber {:?} without a parent", fiber));
        let parent_handle = host_parent_handle(&arena, parent);
        let anchor = host_sibling(&arena, fiber);
        let mut hosts = Vec::new();
        collect_topmost_hosts(&arena, fiber, &mut hosts);
        (parent_handle, anchor, hosts)
    };
    for host in hosts {
        engine
            .host
            .insert_before(parent_handle, host, anchor)
            .map_err(RenderError::Host)?;
    }
    Ok(())
}

fn commit_update(engine: &Rc<EngineInner>, fiber: FiberId) -> Result<(), RenderError> {
    let (kind, handle, payload, text) = {
        let mut arena = engine.arena.borrow_mut();
        let f = &mut arena[fiber];
        (f.kind, f.host, f.update_payload.take(), f.memoized_text.clone())
    };
    let Some(handle) = handle else {
        return Ok(());
    };
    match kind {
        FiberKind::Text => {
            let text = text.unwrap_or_else(|| Rc::from(""));
            engine.host.set_text(handle, &text).map_err(RenderError::Host)?;
        }
        _ => {
            if let Some(payload) = payload {
                engine
                    .host
                    .apply_update_payload(handle, &payload)
                    .map_err(RenderError::Host)?;
            }
        }
    }
    Ok(())
}

/// Re-applies absorbed text content of a host node whose lone text child
/// changed (or disappeared).
fn commit_content_reset(engine: &Rc<EngineInner>, fiber: FiberId) -> Result<(), RenderError> {
    let (handle, text) = {
        let arena = engine.arena.borrow();
        let f = &arena[fiber];
        (f.host, f.memoized_text.clone())
    };
    if let Some(handle) = handle {
        let text = text.unwrap_or_else(|| Rc::from(""));
        engine.host.set_text(handle, &text).map_err(RenderError::Host)?;
    }
    Ok(())
}

/// The host handle children of `fiber` attach to: the fiber's own instance
/// for host kinds, else the nearest host (or root container) above it.
fn host_parent_handle(arena: &FiberArena, fiber: FiberId) -> HostHandle {
    let mut node = fiber;
    loop {
        let f = &arena[node];
        if f.is_host_kind() || f.kind == FiberKind::Root {
            return f.host.unwrap_or_else(|| panic!("host fiber {:?} without instance", node));
        }
        node = f
            .parent
            .unwrap_or_else(|| panic!("detached fiber {:?} in commit", node));
    }
}

/// The host node a placed fiber must be inserted before: the first host
/// descendant of a following sibling that is not itself being placed.
/// `None` means append at the end of the host parent.
fn host_sibling(arena: &FiberArena, fiber: FiberId) -> Option<HostHandle> {
    let mut node = fiber;
    'siblings: loop {
        while arena[node].sibling.is_none() {
            let parent = arena[node].parent?;
            let pf = &arena[parent];
            if pf.is_host_kind() || pf.kind == FiberKind::Root {
                return None;
            }
            node = parent;
        }
        node = arena[node].sibling.expect("checked above");
        while !arena[node].is_host_kind() {
            if arena[node].flags.intersects(Flags::PLACEMENT) {
                continue 'siblings;
            }
            match arena[node].child {
                Some(child) => node = child,
                None => continue 'siblings,
            }
        }
        if !arena[node].flags.intersects(Flags::PLACEMENT) {
            return arena[node].host;
        }
    }
}

/// Topmost host descendants of `fiber`, including itself when it is one.
fn collect_topmost_hosts(arena: &FiberArena, fiber: FiberId, hosts: &mut Vec<HostHandle>) {
    let f = &arena[fiber];
    if f.is_host_kind() {
        if let Some(handle) = f.host {
            hosts.push(handle);
        }
        return;
    }
    let mut child = f.child;
    while let Some(id) = child {
        collect_topmost_hosts(arena, id, hosts);
        child = arena[id].sibling;
    }
}

/// Effects of `kind` with pending work in the flagged subtree, in tree
/// order. Used for the two global teardown-then-setup sweeps.
fn collect_effects(
    arena: &FiberArena,
    fiber: FiberId,
    kind: EffectKind,
    flag: Flags,
    out: &mut Vec<Rc<EffectRecord>>,
) {
    let f = &arena[fiber];
    if f.flags.intersects(flag) {
        for effect in &f.effects {
            if effect.kind == kind && effect.has_pending_work() {
                out.push(Rc::clone(effect));
            }
        }
    }
    if f.subtree_flags.intersects(flag) {
        let mut child = f.child;
        while let Some(id) = child {
            collect_effects(arena, id, kind, flag, out);
            child = arena[id].sibling;
        }
    }
}

/// All pending passive effects of the committed tree, for the deferred
/// flush: every teardown across the tree runs before any setup.
pub(crate) fn collect_passive_effects(arena: &FiberArena, root: FiberId) -> Vec<Rc<EffectRecord>> {
    let mut effects = Vec::new();
    collect_effects(arena, root, EffectKind::Passive, Flags::PASSIVE, &mut effects);
    effects
}
