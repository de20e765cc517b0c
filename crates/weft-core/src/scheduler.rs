//! The cooperative work loop.
//!
//! One [`Reconciler`] owns the fiber arena and all per-root scheduling
//! state; handles hold `Weak` references so tests can instantiate
//! independent engines. Work proceeds unit by unit: descend into a fiber
//! (run its body, reconcile its children), or when a subtree bottoms out,
//! complete fibers upward until a sibling continues the walk. The
//! time-sliced strategy checks the host's yield predicate between units and
//! never mid-node; the synchronous strategy ignores it.
//!
//! Per root the state machine is
//! `Idle → Building → (Yielded ⇄ Building) → Completed → Committing → Idle`.
//! A higher-priority update arriving mid-build discards the whole
//! work-in-progress tree; partial progress never carries across a
//! priority-driven restart.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::commit;
use crate::element::{Element, ElementKind, Props};
use crate::fiber::{ElementType, Fiber, FiberArena, FiberId, FiberKind, Flags, NodeInput};
use crate::hooks::{self, HookSession};
use crate::host::{HostAdapter, HostHandle, TaskId, TaskPriority};
use crate::lanes::{LaneState, Lanes};
use crate::reconcile;
use crate::RenderError;

/// Urgency bands exposed to callers; each maps onto a lane.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum UpdatePriority {
    /// Flushed before control returns to the caller.
    Sync,
    /// Continuous user input; preempts default work.
    UserInput,
    Default,
    /// Claims a rotating transition lane so unrelated transitions
    /// don't starve each other.
    Transition,
    Idle,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum WorkStatus {
    Idle,
    Building,
    Yielded,
    Completed,
    Committing,
}

pub(crate) struct RootInner {
    pub(crate) container: HostHandle,
    /// Root fiber of the committed tree.
    pub(crate) current: Cell<FiberId>,
    pub(crate) status: Cell<WorkStatus>,
    pub(crate) wip: Cell<Option<FiberId>>,
    pub(crate) wip_lanes: Cell<Lanes>,
    pub(crate) next_unit: Cell<Option<FiberId>>,
    pub(crate) lane_state: RefCell<LaneState>,
    /// Description as of the oldest retained queue entry; the fold base.
    pub(crate) base_element: RefCell<Option<Element>>,
    /// Root description updates not yet folded into the base, in enqueue
    /// order. Entries survive until a commit consumes them so a discarded
    /// pass loses nothing.
    pub(crate) queue: RefCell<Vec<(Lanes, Element)>>,
    /// Fold result of the pass being built, applied at commit.
    pub(crate) pending_fold: RefCell<Option<RootFold>>,
    /// A wip tree discarded while its work loop was still on the stack;
    /// released once the loop unwinds.
    abandoned: Cell<Option<FiberId>>,
    scheduled_task: Cell<Option<(TaskId, TaskPriority)>>,
    pub(crate) pending_passive: Cell<bool>,
    pub(crate) passive_task: Cell<Option<TaskId>>,
    last_error: RefCell<Option<RenderError>>,
}

pub(crate) struct EngineInner {
    pub(crate) host: Rc<dyn HostAdapter>,
    pub(crate) arena: RefCell<FiberArena>,
    roots: RefCell<Vec<Rc<RootInner>>>,
    current_priority: Cell<UpdatePriority>,
    batch_depth: Cell<u32>,
    /// Set while the work loop or commit runs, so re-entrant dispatches
    /// only enqueue instead of starting a nested pass.
    executing: Cell<bool>,
}

/// The reconciliation engine: owns the double-buffered tree and drives all
/// scheduling against one host adapter.
pub struct Reconciler {
    inner: Rc<EngineInner>,
}

impl Reconciler {
    pub fn new(host: Rc<dyn HostAdapter>) -> Self {
        Self {
            inner: Rc::new(EngineInner {
                host,
                arena: RefCell::new(FiberArena::new()),
                roots: RefCell::new(Vec::new()),
                current_priority: Cell::new(UpdatePriority::Default),
                batch_depth: Cell::new(0),
                executing: Cell::new(false),
            }),
        }
    }

    /// Registers a new root rendering into `container`.
    pub fn create_root(&self, container: HostHandle) -> RootHandle {
        let mut arena = self.inner.arena.borrow_mut();
        let mut fiber = Fiber::new(FiberKind::Root, ElementType::Root, NodeInput::Root(None));
        fiber.memoized_props = NodeInput::Root(None);
        fiber.host = Some(container);
        let current = arena.alloc(fiber);
        drop(arena);
        let root = Rc::new(RootInner {
            container,
            current: Cell::new(current),
            status: Cell::new(WorkStatus::Idle),
            wip: Cell::new(None),
            wip_lanes: Cell::new(Lanes::NONE),
            next_unit: Cell::new(None),
            lane_state: RefCell::new(LaneState::new()),
            base_element: RefCell::new(None),
            queue: RefCell::new(Vec::new()),
            pending_fold: RefCell::new(None),
            abandoned: Cell::new(None),
            scheduled_task: Cell::new(None),
            pending_passive: Cell::new(false),
            passive_task: Cell::new(None),
            last_error: RefCell::new(None),
        });
        self.inner.roots.borrow_mut().push(Rc::clone(&root));
        RootHandle {
            engine: Rc::clone(&self.inner),
            root,
        }
    }

    /// Runs `f` with dispatches coalesced: no synchronous flush happens
    /// until the outermost batch exits.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        self.inner.batch_depth.set(self.inner.batch_depth.get() + 1);
        let result = f();
        self.inner.batch_depth.set(self.inner.batch_depth.get() - 1);
        if self.inner.batch_depth.get() == 0 {
            let roots: Vec<Rc<RootInner>> = self.inner.roots.borrow().clone();
            for root in roots {
                self.inner.ensure_scheduled(&root);
            }
        }
        result
    }

    /// Runs `f` with updates attributed to `priority`.
    pub fn with_priority<R>(&self, priority: UpdatePriority, f: impl FnOnce() -> R) -> R {
        let previous = self.inner.current_priority.replace(priority);
        let result = f();
        self.inner.current_priority.set(previous);
        result
    }
}

/// Public handle to one root.
pub struct RootHandle {
    engine: Rc<EngineInner>,
    root: Rc<RootInner>,
}

impl RootHandle {
    pub fn container(&self) -> HostHandle {
        self.root.container
    }

    /// Enqueues a new root description at the priority in effect and
    /// schedules a pass. Sync-priority renders flush before returning, so
    /// their errors surface here; scheduled passes stash errors for
    /// [`RootHandle::take_last_error`].
    pub fn render(&self, element: Element) -> Result<(), RenderError> {
        reconcile::validate_element_tree(&element)?;
        let lane = self.engine.lane_for_priority(&self.root);
        // An error stashed by an earlier scheduled pass is not this call's
        // failure; set it aside and leave it claimable afterwards.
        let earlier = self.root.last_error.borrow_mut().take();
        self.root.queue.borrow_mut().push((lane, element));
        self.root.lane_state.borrow_mut().mark_pending(lane);
        self.engine.maybe_restart_for(&self.root, lane);
        self.engine.ensure_scheduled(&self.root);
        let fresh = self.root.last_error.borrow_mut().take();
        if let Some(err) = earlier {
            *self.root.last_error.borrow_mut() = Some(err);
        }
        match fresh {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Synchronously drives this root until no lanes are pending and all
    /// passive effects have run. Yield checks are ignored. Intended for
    /// tests and hosts that drive the engine manually.
    pub fn flush_until_idle(&self) -> Result<(), RenderError> {
        loop {
            self.engine.flush_passive(&self.root);
            let next = self.root.lane_state.borrow().next_lanes();
            if next.is_none() {
                break;
            }
            self.engine.perform_work(&self.root, false)?;
            if let Some(err) = self.root.last_error.borrow_mut().take() {
                return Err(err);
            }
        }
        self.engine.flush_passive(&self.root);
        match self.root.last_error.borrow_mut().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Last error stashed by a host-scheduled pass, if any.
    pub fn take_last_error(&self) -> Option<RenderError> {
        self.root.last_error.borrow_mut().take()
    }

    pub fn pending_lanes(&self) -> Lanes {
        self.root.lane_state.borrow().pending
    }

    pub fn is_idle(&self) -> bool {
        self.root.status.get() == WorkStatus::Idle
            && self.root.lane_state.borrow().next_lanes().is_none()
            && !self.root.pending_passive.get()
    }

    /// Fiber count across both buffers, for leak assertions in tests.
    pub fn live_fiber_count(&self) -> usize {
        self.engine.arena.borrow().live_count()
    }
}

/// Weak engine handle captured by dispatch closures.
#[derive(Clone)]
pub(crate) struct EngineRef {
    inner: Weak<EngineInner>,
}

impl EngineRef {
    /// The lane derived from the priority in effect at the call site.
    pub(crate) fn current_lane(&self, fiber: FiberId) -> Lanes {
        let Some(engine) = self.inner.upgrade() else {
            return Lanes::DEFAULT;
        };
        match engine.current_priority.get() {
            UpdatePriority::Sync => Lanes::SYNC,
            UpdatePriority::UserInput => Lanes::INPUT_CONTINUOUS,
            UpdatePriority::Default => Lanes::DEFAULT,
            UpdatePriority::Idle => Lanes::IDLE,
            UpdatePriority::Transition => match engine.root_of_fiber(fiber) {
                Some(root) => root.lane_state.borrow_mut().claim_transition_lane(),
                None => Lanes::DEFAULT,
            },
        }
    }

    pub(crate) fn fiber_has_pending_work(&self, fiber: FiberId) -> bool {
        let Some(engine) = self.inner.upgrade() else {
            return false;
        };
        let arena = engine.arena.borrow();
        let Some(f) = arena.get(fiber) else {
            return false;
        };
        if !f.lanes.is_none() {
            return true;
        }
        f.alternate
            .and_then(|alt| arena.get(alt))
            .map(|alt| !alt.lanes.is_none())
            .unwrap_or(false)
    }

    pub(crate) fn schedule_update(&self, fiber: FiberId, lane: Lanes) {
        if let Some(engine) = self.inner.upgrade() {
            engine.schedule_update(fiber, lane);
        }
    }
}

/// Outcome of folding the root description queue for one pass. The queue
/// itself is untouched until commit, so a discarded pass leaves every entry
/// in place.
pub(crate) struct RootFold {
    /// Description this pass renders.
    pub(crate) element: Option<Element>,
    /// New fold base: the description as of the first skipped entry.
    pub(crate) base_element: Option<Element>,
    /// Entries to retain. Entries applied this pass but sitting behind a
    /// skipped one are kept with the empty lane set so every future pass
    /// re-applies them and enqueue order is preserved across lanes.
    pub(crate) base_queue: Vec<(Lanes, Element)>,
}

fn fold_root_queue(
    base: &Option<Element>,
    queue: &[(Lanes, Element)],
    lanes: Lanes,
) -> RootFold {
    let mut element = base.clone();
    let mut base_element: Option<Option<Element>> = None;
    let mut base_queue: Vec<(Lanes, Element)> = Vec::new();
    for (lane, entry) in queue {
        if lanes.contains(*lane) {
            element = Some(entry.clone());
            if !base_queue.is_empty() {
                base_queue.push((Lanes::NONE, entry.clone()));
            }
        } else {
            if base_queue.is_empty() {
                base_element = Some(element.clone());
            }
            base_queue.push((*lane, entry.clone()));
        }
    }
    RootFold {
        base_element: base_element.unwrap_or_else(|| element.clone()),
        element,
        base_queue,
    }
}

fn task_priority_for(lane: Lanes) -> TaskPriority {
    if lane.includes_sync() {
        TaskPriority::Immediate
    } else if Lanes::INPUT_CONTINUOUS.contains(lane) {
        TaskPriority::UserBlocking
    } else if Lanes::RETRY.contains(lane) {
        TaskPriority::Low
    } else if Lanes::IDLE.contains(lane) {
        TaskPriority::Idle
    } else {
        TaskPriority::Normal
    }
}

impl EngineInner {
    pub(crate) fn engine_ref(self: &Rc<Self>) -> EngineRef {
        EngineRef {
            inner: Rc::downgrade(self),
        }
    }

    fn lane_for_priority(self: &Rc<Self>, root: &Rc<RootInner>) -> Lanes {
        match self.current_priority.get() {
            UpdatePriority::Sync => Lanes::SYNC,
            UpdatePriority::UserInput => Lanes::INPUT_CONTINUOUS,
            UpdatePriority::Default => Lanes::DEFAULT,
            UpdatePriority::Idle => Lanes::IDLE,
            UpdatePriority::Transition => root.lane_state.borrow_mut().claim_transition_lane(),
        }
    }

    /// Finds which root a fiber belongs to by walking parent links across
    /// both buffers.
    pub(crate) fn root_of_fiber(&self, fiber: FiberId) -> Option<Rc<RootInner>> {
        let arena = self.arena.borrow();
        let mut node = fiber;
        loop {
            let f = arena.get(node)?;
            if f.kind == FiberKind::Root {
                break;
            }
            match f.parent {
                Some(parent) => node = parent,
                None => {
                    // A detached wip fiber may only have a parent on its
                    // alternate.
                    let alt_parent = f.alternate.and_then(|alt| arena.get(alt)).and_then(|alt| alt.parent);
                    node = alt_parent?;
                }
            }
        }
        let root_fiber = node;
        drop(arena);
        self.roots.borrow().iter().find(|root| {
            let current = root.current.get();
            if current == root_fiber {
                return true;
            }
            self.arena
                .borrow()
                .get(current)
                .and_then(|f| f.alternate)
                .map(|alt| alt == root_fiber)
                .unwrap_or(false)
        }).cloned()
    }

    /// Marks `lane` pending on the fiber (both buffers) and schedules a pass
    /// on the owning root. Entry point for every state dispatch.
    pub(crate) fn schedule_update(self: &Rc<Self>, fiber: FiberId, lane: Lanes) {
        {
            let mut arena = self.arena.borrow_mut();
            if arena.get(fiber).is_none() {
                log::warn!("state dispatched to an unmounted fiber {:?}", fiber);
                return;
            }
            let f = &mut arena[fiber];
            f.lanes = f.lanes.merge(lane);
            let alternate = f.alternate;
            if let Some(alt) = alternate {
                if let Some(alt_fiber) = arena.get_mut(alt) {
                    alt_fiber.lanes = alt_fiber.lanes.merge(lane);
                }
            }
        }
        let Some(root) = self.root_of_fiber(fiber) else {
            log::warn!("dispatch from a fiber with no registered root");
            return;
        };
        root.lane_state.borrow_mut().mark_pending(lane);
        self.maybe_restart_for(&root, lane);
        self.ensure_scheduled(&root);
    }

    /// Discards the in-progress tree when a strictly higher-priority lane
    /// arrives mid-build. Reused wip fibers stay allocated as alternates and
    /// are re-cloned from current by the next `prepare_fresh_stack`; fibers
    /// the discarded pass freshly created are released.
    fn maybe_restart_for(self: &Rc<Self>, root: &Rc<RootInner>, lane: Lanes) {
        let status = root.status.get();
        if !matches!(status, WorkStatus::Building | WorkStatus::Yielded) {
            return;
        }
        let wip_lanes = root.wip_lanes.get();
        if wip_lanes.contains(lane) {
            return;
        }
        let incoming = lane.bits();
        let building = wip_lanes.highest_priority().bits();
        if incoming < building {
            log::debug!(
                "discarding in-progress tree for {:?}: {:?} preempts {:?}",
                root.container,
                lane,
                wip_lanes
            );
            self.discard_wip(root);
        }
    }

    pub(crate) fn discard_wip(&self, root: &Rc<RootInner>) {
        let abandoned = root.wip.take();
        root.status.set(WorkStatus::Idle);
        root.next_unit.set(None);
        root.wip_lanes.set(Lanes::NONE);
        *root.pending_fold.borrow_mut() = None;
        if let Some(wip) = abandoned {
            if self.executing.get() {
                // A dispatch from inside a component body discarded the very
                // build that is still on the stack; the work loop releases
                // the partial tree once it unwinds.
                root.abandoned.set(Some(wip));
            } else {
                self.release_discarded(wip);
            }
        }
    }

    /// Releases the fibers an abandoned pass freshly allocated: everything
    /// reachable through child links that pass built, with no committed
    /// alternate. Child pointers copied wholesale from the current buffer
    /// still name their current-side parent and are not followed.
    fn release_discarded(&self, wip_root: FiberId) {
        let mut arena = self.arena.borrow_mut();
        let mut stack = vec![wip_root];
        let mut doomed: Vec<FiberId> = Vec::new();
        while let Some(id) = stack.pop() {
            let mut child = arena[id].child;
            while let Some(c) = child {
                if arena[c].parent != Some(id) {
                    break;
                }
                stack.push(c);
                child = arena[c].sibling;
            }
            if arena[id].alternate.is_none() && id != wip_root {
                doomed.push(id);
            }
        }
        if !doomed.is_empty() {
            log::trace!("releasing {} fibers from a discarded pass", doomed.len());
        }
        for id in doomed {
            arena.release(id);
        }
    }

    /// Makes sure the right callback is scheduled (or a sync flush runs)
    /// for the root's next batch of lanes. Cancels and replaces a stale
    /// callback wholesale when the priority changed.
    pub(crate) fn ensure_scheduled(self: &Rc<Self>, root: &Rc<RootInner>) {
        root.lane_state.borrow_mut().mark_starved(self.host.now());
        let next = root.lane_state.borrow().next_lanes();
        if next.is_none() {
            if let Some((task, _)) = root.scheduled_task.take() {
                self.host.cancel_callback(task);
            }
            return;
        }
        if next.includes_sync() {
            if let Some((task, _)) = root.scheduled_task.take() {
                self.host.cancel_callback(task);
            }
            if self.batch_depth.get() == 0 && !self.executing.get() {
                if let Err(err) = self.perform_work(root, false) {
                    log::error!("sync pass failed: {err}");
                    *root.last_error.borrow_mut() = Some(err);
                }
            }
            return;
        }
        let priority = task_priority_for(next.highest_priority());
        if let Some((task, existing)) = root.scheduled_task.get() {
            if existing == priority {
                return;
            }
            self.host.cancel_callback(task);
            root.scheduled_task.set(None);
        }
        let engine = Rc::downgrade(self);
        let root_weak = Rc::downgrade(root);
        let task = self.host.schedule_callback(
            priority,
            Box::new(move || {
                let (Some(engine), Some(root)) = (engine.upgrade(), root_weak.upgrade()) else {
                    return;
                };
                root.scheduled_task.set(None);
                if let Err(err) = engine.perform_work(&root, true) {
                    log::error!("scheduled pass failed: {err}");
                    *root.last_error.borrow_mut() = Some(err);
                }
            }),
        );
        root.scheduled_task.set(Some((task, priority)));
    }

    /// Builds (or resumes building) the work-in-progress tree for the next
    /// batch of lanes, then commits when the tree completes. `allow_yield`
    /// selects the time-sliced strategy; expired or sync lanes always run
    /// to completion.
    pub(crate) fn perform_work(
        self: &Rc<Self>,
        root: &Rc<RootInner>,
        allow_yield: bool,
    ) -> Result<(), RenderError> {
        root.lane_state.borrow_mut().mark_starved(self.host.now());
        let lanes = root.lane_state.borrow().next_lanes();
        if lanes.is_none() {
            return Ok(());
        }
        let time_sliced = allow_yield
            && !lanes.includes_sync()
            && !root.lane_state.borrow().has_expired_work();

        match root.status.get() {
            WorkStatus::Yielded if root.wip_lanes.get() == lanes => {
                root.status.set(WorkStatus::Building);
            }
            WorkStatus::Building | WorkStatus::Completed | WorkStatus::Committing => {
                // Re-entered while already running; the outer loop owns it.
                return Ok(());
            }
            _ => self.prepare_fresh_stack(root, lanes),
        }

        self.executing.set(true);
        let result = self.work_loop(root, time_sliced);
        self.executing.set(false);

        // A mid-build discard triggered from inside the loop deferred its
        // cleanup to here.
        if let Some(wip) = root.abandoned.take() {
            self.release_discarded(wip);
        }

        match result {
            Ok(()) => {
                match root.status.get() {
                    WorkStatus::Building => {
                        // Tree exhausted: commit.
                        root.status.set(WorkStatus::Completed);
                        let finished = root
                            .wip
                            .get()
                            .expect("completed build with no work-in-progress root");
                        let commit_result =
                            commit::commit_root(self, root, finished, root.wip_lanes.get());
                        if let Err(err) = commit_result {
                            self.discard_wip(root);
                            root.lane_state.borrow_mut().mark_committed(lanes);
                            return Err(err);
                        }
                        self.ensure_scheduled(root);
                        Ok(())
                    }
                    WorkStatus::Yielded => {
                        // Hand control back; another callback resumes us.
                        self.ensure_scheduled(root);
                        Ok(())
                    }
                    // Discarded mid-loop by a higher-priority update.
                    _ => {
                        self.ensure_scheduled(root);
                        Ok(())
                    }
                }
            }
            Err(err) => {
                // Never leave a half-built tree visible to the next pass.
                self.discard_wip(root);
                root.lane_state.borrow_mut().mark_committed(lanes);
                Err(err)
            }
        }
    }

    fn work_loop(self: &Rc<Self>, root: &Rc<RootInner>, time_sliced: bool) -> Result<(), RenderError> {
        while root.status.get() == WorkStatus::Building {
            let Some(unit) = root.next_unit.get() else {
                break;
            };
            if time_sliced && self.host.should_yield() {
                root.status.set(WorkStatus::Yielded);
                log::trace!("yielding to host at {:?}", unit);
                return Ok(());
            }
            self.perform_unit(root, unit)?;
        }
        Ok(())
    }

    /// Clones the root fiber into a fresh work-in-progress buffer and
    /// points the unit-of-work cursor at it.
    fn prepare_fresh_stack(&self, root: &Rc<RootInner>, lanes: Lanes) {
        let current = root.current.get();
        let mut arena = self.arena.borrow_mut();
        let pending = arena[current].memoized_props.clone();
        let wip = arena.create_work_in_progress(current, pending);
        arena[wip].parent = None;
        arena[wip].sibling = None;
        drop(arena);
        root.wip.set(Some(wip));
        root.wip_lanes.set(lanes);
        root.next_unit.set(Some(wip));
        root.status.set(WorkStatus::Building);
        log::trace!("fresh build for {:?} at {:?}", root.container, lanes);
    }

    /// One unit of work: descend into `unit`, or complete upward when it
    /// produced no child.
    fn perform_unit(self: &Rc<Self>, root: &Rc<RootInner>, unit: FiberId) -> Result<(), RenderError> {
        let next = self.begin_work(root, unit)?;
        match next {
            Some(child) => root.next_unit.set(Some(child)),
            None => self.complete_unit(root, unit)?,
        }
        Ok(())
    }

    /// Descend phase: resolve the fiber's kind, run function bodies, and
    /// reconcile children. Returns the first child to process next.
    fn begin_work(
        self: &Rc<Self>,
        root: &Rc<RootInner>,
        wip: FiberId,
    ) -> Result<Option<FiberId>, RenderError> {
        let lanes = root.wip_lanes.get();
        let (kind, current) = {
            let arena = self.arena.borrow();
            (arena[wip].kind, arena[wip].alternate)
        };
        // Side-effect tracking is active only when this position rendered
        // before; during initial construction there is nothing to diff.
        let track = current.is_some();
        let current_first = {
            let arena = self.arena.borrow();
            current.and_then(|id| arena[id].child)
        };

        match kind {
            FiberKind::Root => {
                let fold =
                    fold_root_queue(&root.base_element.borrow(), &root.queue.borrow(), lanes);
                let element = fold.element.clone();
                self.arena.borrow_mut()[wip].pending_props = NodeInput::Root(element.clone());
                *root.pending_fold.borrow_mut() = Some(fold);
                let mut arena = self.arena.borrow_mut();
                let first = match &element {
                    Some(element) => reconcile::reconcile_single(
                        &mut arena, wip, current_first, element, track, lanes,
                    )?,
                    None => {
                        reconcile::delete_all_children(&mut arena, wip, current_first, track, lanes);
                        None
                    }
                };
                arena[wip].child = first;
                Ok(first)
            }
            FiberKind::Host => {
                let (tag, props, children) = {
                    let arena = self.arena.borrow();
                    match (&arena[wip].element_type, &arena[wip].pending_props) {
                        (ElementType::Host(tag), NodeInput::Host { props, children }) => {
                            (Rc::clone(tag), props.clone(), children.clone())
                        }
                        _ => {
                            return Err(RenderError::InvalidElement {
                                reason: "host fiber without host input".into(),
                            })
                        }
                    }
                };
                if absorbs_text(self.host.as_ref(), &tag, &props, &children) {
                    // The lone text child becomes element content; no child
                    // fibers exist below this node.
                    let mut arena = self.arena.borrow_mut();
                    reconcile::delete_all_children(&mut arena, wip, current_first, track, lanes);
                    arena[wip].child = None;
                    return Ok(None);
                }
                let mut arena = self.arena.borrow_mut();
                let first =
                    reconcile::reconcile_children(&mut arena, wip, current_first, &children, track, lanes)?;
                arena[wip].child = first;
                Ok(first)
            }
            FiberKind::Text => Ok(None),
            FiberKind::Fragment => {
                let children = {
                    let arena = self.arena.borrow();
                    match &arena[wip].pending_props {
                        NodeInput::Fragment(children) => children.clone(),
                        _ => Vec::new(),
                    }
                };
                let mut arena = self.arena.borrow_mut();
                let first =
                    reconcile::reconcile_children(&mut arena, wip, current_first, &children, track, lanes)?;
                arena[wip].child = first;
                Ok(first)
            }
            FiberKind::Indeterminate | FiberKind::StatefulFn | FiberKind::StatelessFn => {
                let element = self.render_with_hooks(root, wip, current)?;
                let mut arena = self.arena.borrow_mut();
                let first = reconcile::reconcile_single(
                    &mut arena, wip, current_first, &element, track, lanes,
                )?;
                arena[wip].child = first;
                Ok(first)
            }
        }
    }

    /// Executes a component body with a hook session installed, walking the
    /// committed chain in lock step.
    fn render_with_hooks(
        self: &Rc<Self>,
        root: &Rc<RootInner>,
        wip: FiberId,
        current: Option<FiberId>,
    ) -> Result<Element, RenderError> {
        let (component, props, prev_hooks, replaying) = {
            let mut arena = self.arena.borrow_mut();
            // Persist newly dispatched updates onto the committed chain so a
            // discarded pass never loses them.
            if let Some(current) = current {
                let mut hooks = std::mem::take(&mut arena[current].hooks);
                hooks::absorb_pending_updates(&mut hooks);
                arena[current].hooks = hooks;
            }
            let fiber = &arena[wip];
            let component = match &fiber.element_type {
                ElementType::Component(component) => component.clone(),
                _ => {
                    return Err(RenderError::InvalidElement {
                        reason: "function fiber without component identity".into(),
                    })
                }
            };
            let props = match &fiber.pending_props {
                NodeInput::Component(props) => props.clone(),
                _ => Props::new(),
            };
            let prev_hooks = current.map(|id| arena[id].hooks.clone()).unwrap_or_default();
            (component, props, prev_hooks, current.is_some())
        };

        hooks::install_session(HookSession::new(
            wip,
            self.engine_ref(),
            root.wip_lanes.get(),
            prev_hooks,
            replaying,
        ));
        let element = component.render(&props);
        let mut session = hooks::take_session();
        session.finish();
        if let Some(err) = session.error.take() {
            return Err(err);
        }

        let mut arena = self.arena.borrow_mut();
        let fiber = &mut arena[wip];
        let stateful = !session.next_hooks.is_empty();
        fiber.hooks = session.next_hooks;
        fiber.effects = session.effects;
        fiber.flags = fiber.flags.merge(session.fiber_flags);
        fiber.lanes = session.skipped_lanes;
        fiber.kind = if stateful {
            FiberKind::StatefulFn
        } else if fiber.kind == FiberKind::Indeterminate {
            FiberKind::StatelessFn
        } else {
            fiber.kind
        };
        Ok(element)
    }

    /// Ascend phase: finalize `unit`, then its completed ancestors, until a
    /// sibling takes over or the root completes.
    fn complete_unit(self: &Rc<Self>, root: &Rc<RootInner>, unit: FiberId) -> Result<(), RenderError> {
        let mut node = unit;
        loop {
            self.complete_work(node)?;
            let (sibling, parent) = {
                let arena = self.arena.borrow();
                (arena[node].sibling, arena[node].parent)
            };
            if let Some(sibling) = sibling {
                root.next_unit.set(Some(sibling));
                return Ok(());
            }
            match parent {
                Some(parent) => node = parent,
                None => {
                    root.next_unit.set(None);
                    return Ok(());
                }
            }
        }
    }

    /// Finalizes one fiber bottom-up: creates host instances on mount,
    /// computes update payloads, and re-establishes the subtree-flags
    /// invariant from its children.
    fn complete_work(self: &Rc<Self>, wip: FiberId) -> Result<(), RenderError> {
        let kind = self.arena.borrow()[wip].kind;
        match kind {
            FiberKind::Host => self.complete_host(wip)?,
            FiberKind::Text => self.complete_text(wip)?,
            _ => {}
        }
        let mut arena = self.arena.borrow_mut();
        let fiber = &mut arena[wip];
        fiber.memoized_props = fiber.pending_props.clone();
        drop(arena);
        self.bubble_properties(wip);
        Ok(())
    }

    fn complete_host(self: &Rc<Self>, wip: FiberId) -> Result<(), RenderError> {
        let (tag, new_props, children, handle, old_props, old_text) = {
            let arena = self.arena.borrow();
            let fiber = &arena[wip];
            let (tag, props, children) = match (&fiber.element_type, &fiber.pending_props) {
                (ElementType::Host(tag), NodeInput::Host { props, children }) => {
                    (Rc::clone(tag), props.clone(), children.clone())
                }
                _ => {
                    return Err(RenderError::InvalidElement {
                        reason: "host fiber without host input".into(),
                    })
                }
            };
            let old_props = fiber.memoized_props.host_props().cloned();
            (tag, props, children, fiber.host, old_props, fiber.memoized_text.clone())
        };
        let absorbed = absorbed_text(self.host.as_ref(), &tag, &new_props, &children);

        match handle {
            None => {
                // Mount: create the instance and attach already-completed
                // child host nodes, so commit-time insertion sees a fully
                // realized subtree.
                let instance = self.host.create_instance(&tag, &new_props).map_err(RenderError::Host)?;
                if let Some(text) = &absorbed {
                    self.host.set_text(instance, text).map_err(RenderError::Host)?;
                }
                self.append_all_children(instance, wip)?;
                let mut arena = self.arena.borrow_mut();
                let fiber = &mut arena[wip];
                fiber.host = Some(instance);
                fiber.memoized_text = absorbed;
            }
            Some(instance) => {
                let old_props = old_props.unwrap_or_default();
                let payload =
                    self.host
                        .compute_update_payload(instance, &tag, &old_props, &new_props);
                let mut arena = self.arena.borrow_mut();
                let fiber = &mut arena[wip];
                if let Some(payload) = payload {
                    fiber.update_payload = Some(payload);
                    fiber.flags = fiber.flags.merge(Flags::UPDATE);
                }
                if absorbed != old_text {
                    fiber.memoized_text = absorbed;
                    fiber.flags = fiber.flags.merge(Flags::CONTENT_RESET);
                }
            }
        }
        Ok(())
    }

    fn complete_text(self: &Rc<Self>, wip: FiberId) -> Result<(), RenderError> {
        let (text, handle, old_text) = {
            let arena = self.arena.borrow();
            let fiber = &arena[wip];
            let text = fiber
                .pending_props
                .text()
                .cloned()
                .unwrap_or_else(|| Rc::from(""));
            (text, fiber.host, fiber.memoized_text.clone())
        };
        match handle {
            None => {
                let instance = self.host.create_text_instance(&text).map_err(RenderError::Host)?;
                let mut arena = self.arena.borrow_mut();
                let fiber = &mut arena[wip];
                fiber.host = Some(instance);
                fiber.memoized_text = Some(text);
            }
            Some(_) => {
                if old_text.as_deref() != Some(text.as_ref()) {
                    let mut arena = self.arena.borrow_mut();
                    let fiber = &mut arena[wip];
                    fiber.memoized_text = Some(text);
                    fiber.flags = fiber.flags.merge(Flags::UPDATE);
                }
            }
        }
        Ok(())
    }

    /// Appends the nearest host descendants of a freshly created instance.
    fn append_all_children(self: &Rc<Self>, parent: HostHandle, wip: FiberId) -> Result<(), RenderError> {
        let mut handles = Vec::new();
        {
            let arena = self.arena.borrow();
            let mut node = arena[wip].child;
            while let Some(id) = node {
                let fiber = &arena[id];
                if fiber.is_host_kind() {
                    if let Some(handle) = fiber.host {
                        handles.push(handle);
                    }
                } else if let Some(child) = fiber.child {
                    node = Some(child);
                    continue;
                }
                // Advance to the next sibling, climbing back up as needed
                // but never past the subtree root.
                let mut cursor = id;
                node = loop {
                    if let Some(sibling) = arena[cursor].sibling {
                        break Some(sibling);
                    }
                    match arena[cursor].parent {
                        Some(parent_id) if parent_id != wip => cursor = parent_id,
                        _ => break None,
                    }
                };
            }
        }
        for handle in handles {
            self.host.append_child(parent, handle).map_err(RenderError::Host)?;
        }
        Ok(())
    }

    /// Re-establishes the invariant that a parent's `subtree_flags` is the
    /// union of every child's `flags | subtree_flags`.
    fn bubble_properties(&self, wip: FiberId) {
        let mut arena = self.arena.borrow_mut();
        let mut subtree = Flags::NONE;
        let mut child = arena[wip].child;
        while let Some(id) = child {
            let fiber = &arena[id];
            subtree = subtree.merge(fiber.flags).merge(fiber.subtree_flags);
            child = fiber.sibling;
        }
        arena[wip].subtree_flags = subtree;
    }

    /// Runs deferred passive effects for the root's committed tree:
    /// teardown for every flagged effect across the whole tree strictly
    /// before any setup.
    pub(crate) fn flush_passive(self: &Rc<Self>, root: &Rc<RootInner>) {
        if !root.pending_passive.replace(false) {
            return;
        }
        if let Some(task) = root.passive_task.take() {
            self.host.cancel_callback(task);
        }
        let effects = commit::collect_passive_effects(&self.arena.borrow(), root.current.get());
        log::debug!("flushing {} passive effects", effects.len());
        for effect in &effects {
            effect.run_teardown();
        }
        for effect in &effects {
            effect.run_setup();
        }
    }
}

fn absorbs_text(
    host: &dyn HostAdapter,
    tag: &str,
    props: &Props,
    children: &[Element],
) -> bool {
    absorbed_text(host, tag, props, children).is_some()
}

/// The text content this host element absorbs instead of creating a child
/// text primitive, when the adapter supports it and the description is a
/// lone text child.
fn absorbed_text(
    host: &dyn HostAdapter,
    tag: &str,
    props: &Props,
    children: &[Element],
) -> Option<Rc<str>> {
    if children.len() != 1 {
        return None;
    }
    let ElementKind::Text(text) = &children[0].kind else {
        return None;
    };
    if host.supports_text_only_children(tag, props) {
        Some(Rc::clone(text))
    } else {
        None
    }
}
