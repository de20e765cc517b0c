//! Positional state chain for stateful function fibers.
//!
//! Every execution of a component body walks two cursors in lock step: the
//! chain being built for the work-in-progress fiber and the chain committed
//! on its alternate. Each primitive call (`use_state`, `use_reducer`,
//! `use_memo`, `use_effect`, `use_layout_effect`) claims the next ordinal
//! slot, so calls must be unconditional and in the same order on every pass.
//! Skipping a call across passes desynchronizes the chain and fails the
//! render attempt with [`RenderError::HookMismatch`]; committed state is
//! never corrupted because the work-in-progress tree is discarded.
//!
//! A session is installed in thread-local storage while a body runs; hook
//! functions called outside a body panic.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::rc::Rc;

use crate::fiber::{FiberId, Flags};
use crate::lanes::Lanes;
use crate::scheduler::EngineRef;
use crate::RenderError;

pub type DynValue = Rc<dyn Any>;
pub type Teardown = Box<dyn FnOnce()>;
pub type SetupFn = Box<dyn FnOnce() -> Option<Teardown>>;

/// One pending state transition.
#[derive(Clone)]
pub struct Update {
    pub lane: Lanes,
    pub action: Action,
}

#[derive(Clone)]
pub enum Action {
    Replace(DynValue),
    Apply(Rc<dyn Fn(&dyn Any) -> DynValue>),
}

impl Action {
    fn apply(&self, prev: &dyn Any) -> DynValue {
        match self {
            Action::Replace(value) => value.clone(),
            Action::Apply(f) => f(prev),
        }
    }
}

/// Shared between the two buffers of one logical hook: dispatches enqueue
/// here, replay drains from here. FIFO by enqueue order.
pub struct UpdateQueue {
    pub pending: Vec<Update>,
    /// Committed value as of the last replay, for the eager dispatch bailout.
    pub last_rendered: Option<DynValue>,
    /// Typed equality, erased. Compares two values of the cell's type.
    pub eq: Rc<dyn Fn(&dyn Any, &dyn Any) -> bool>,
}

/// A reducer/state cell slot in the chain.
///
/// `base_state` and `base_updates` carry transitions that were skipped
/// because their lane was outside the processed set; they replay before any
/// newly pending work so per-lane FIFO order survives partial processing.
#[derive(Clone)]
pub struct ReducerHook {
    pub memoized: DynValue,
    pub base_state: DynValue,
    pub base_updates: Vec<Update>,
    pub queue: Rc<RefCell<UpdateQueue>>,
}

#[derive(Clone)]
pub struct MemoHook {
    pub value: DynValue,
    pub deps: DynValue,
}

/// When an effect re-runs relative to the mutation phase.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum EffectKind {
    /// Synchronous with commit, before control returns to the host.
    Layout,
    /// Deferred to a later scheduler turn.
    Passive,
}

/// One registered effect. A record is immutable once created apart from the
/// work bit and the teardown slot; changed deps produce a successor record,
/// so a discarded pass leaves the committed chain exactly as it was.
pub struct EffectRecord {
    pub kind: EffectKind,
    has_work: Cell<bool>,
    setup: RefCell<Option<SetupFn>>,
    /// Shared with the record this one replaced, so the teardown produced by
    /// the last committed setup survives across re-renders.
    teardown: Rc<RefCell<Option<Teardown>>>,
    deps: DynValue,
}

impl EffectRecord {
    fn new(kind: EffectKind, setup: SetupFn, deps: DynValue) -> Self {
        Self {
            kind,
            has_work: Cell::new(true),
            setup: RefCell::new(Some(setup)),
            teardown: Rc::new(RefCell::new(None)),
            deps,
        }
    }

    /// Successor for changed deps. Only the teardown slot is shared; the
    /// committed record stays untouched until this one is committed in its
    /// place.
    fn replacing(prev: &EffectRecord, setup: SetupFn, deps: DynValue) -> Self {
        Self {
            kind: prev.kind,
            has_work: Cell::new(true),
            setup: RefCell::new(Some(setup)),
            teardown: Rc::clone(&prev.teardown),
            deps,
        }
    }

    pub fn has_pending_work(&self) -> bool {
        self.has_work.get()
    }

    /// Runs the teardown from the previous setup, if any.
    pub fn run_teardown(&self) {
        if let Some(teardown) = self.teardown.borrow_mut().take() {
            teardown();
        }
    }

    /// Runs the latest setup and stores its teardown. Clears the work bit.
    pub fn run_setup(&self) {
        self.has_work.set(false);
        let setup = self.setup.borrow_mut().take();
        if let Some(setup) = setup {
            *self.teardown.borrow_mut() = setup();
        }
    }
}

#[derive(Clone)]
pub enum Hook {
    Reducer(ReducerHook),
    Memo(MemoHook),
    Effect(Rc<EffectRecord>),
}

impl Hook {
    fn kind_name(&self) -> &'static str {
        match self {
            Hook::Reducer(_) => "state",
            Hook::Memo(_) => "memo",
            Hook::Effect(_) => "effect",
        }
    }
}

/// Live state while one component body executes.
pub(crate) struct HookSession {
    pub fiber: FiberId,
    pub engine: EngineRef,
    pub render_lanes: Lanes,
    /// Committed chain from the alternate, replayed positionally.
    pub prev_hooks: Vec<Hook>,
    /// True when this fiber rendered before, so chain length must match.
    pub replaying: bool,
    pub next_hooks: Vec<Hook>,
    pub effects: Vec<Rc<EffectRecord>>,
    pub cursor: usize,
    pub fiber_flags: Flags,
    /// Lanes of updates seen but not applied this pass.
    pub skipped_lanes: Lanes,
    pub error: Option<RenderError>,
}

impl HookSession {
    pub(crate) fn new(
        fiber: FiberId,
        engine: EngineRef,
        render_lanes: Lanes,
        prev_hooks: Vec<Hook>,
        replaying: bool,
    ) -> Self {
        Self {
            fiber,
            engine,
            render_lanes,
            prev_hooks,
            replaying,
            next_hooks: Vec::new(),
            effects: Vec::new(),
            cursor: 0,
            fiber_flags: Flags::NONE,
            skipped_lanes: Lanes::NONE,
            error: None,
        }
    }

    fn record_mismatch(&mut self, expected: &'static str, found: &'static str) {
        if self.error.is_none() {
            log::error!(
                "hook chain desynchronized at slot {}: expected {expected}, found {found}",
                self.cursor
            );
            self.error = Some(RenderError::HookMismatch {
                index: self.cursor,
                expected,
                found,
            });
        }
    }

    /// Claims the replay counterpart for the slot about to be created, or
    /// records a mismatch when the previous chain disagrees.
    fn replay_slot(&mut self, creating: &'static str) -> Option<Hook> {
        if self.cursor < self.prev_hooks.len() {
            let prev = self.prev_hooks[self.cursor].clone();
            if prev.kind_name() != creating {
                self.record_mismatch(prev.kind_name(), creating);
                return None;
            }
            Some(prev)
        } else {
            if self.replaying {
                self.record_mismatch("end of chain", creating);
            }
            None
        }
    }

    /// Called after the body returns: a shorter chain than the previous pass
    /// is a desynchronization too.
    pub(crate) fn finish(&mut self) {
        if self.replaying && self.error.is_none() && self.next_hooks.len() < self.prev_hooks.len()
        {
            self.cursor = self.next_hooks.len();
            let missing = self.prev_hooks[self.cursor].kind_name();
            self.record_mismatch(missing, "end of chain");
        }
    }
}

thread_local! {
    static SESSION: RefCell<Option<HookSession>> = const { RefCell::new(None) };
}

pub(crate) fn install_session(session: HookSession) {
    SESSION.with(|slot| {
        let mut slot = slot.borrow_mut();
        debug_assert!(slot.is_none(), "nested hook sessions");
        *slot = Some(session);
    });
}

pub(crate) fn take_session() -> HookSession {
    SESSION.with(|slot| {
        slot.borrow_mut()
            .take()
            .expect("no hook session installed")
    })
}

fn with_session<R>(f: impl FnOnce(&mut HookSession) -> R) -> R {
    SESSION.with(|slot| {
        let mut slot = slot.borrow_mut();
        let session = slot
            .as_mut()
            .expect("hook called outside of a component body");
        f(session)
    })
}

fn erased_eq<T: PartialEq + 'static>() -> Rc<dyn Fn(&dyn Any, &dyn Any) -> bool> {
    Rc::new(|a: &dyn Any, b: &dyn Any| {
        match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    })
}

fn downcast<T: 'static>(value: &DynValue) -> Rc<T> {
    value
        .clone()
        .downcast::<T>()
        .unwrap_or_else(|_| panic!("state cell holds a different type"))
}

/// Folds a cell's carried-over and newly pending updates for the lanes being
/// rendered. An entry outside the render lanes is preserved: the fold result
/// so far becomes the new base state and the entry opens the new base list.
/// Every later entry joins the base list too, even ones that apply this
/// pass, so a future lower-priority replay rebases from the skip point and
/// still sees enqueue order within each lane.
fn replay_reducer(prev: &ReducerHook, session_lanes: Lanes) -> (ReducerHook, Lanes) {
    let mut queue = prev.queue.borrow_mut();
    let mut updates = prev.base_updates.clone();
    updates.extend(queue.pending.drain(..));

    let mut value = prev.base_state.clone();
    let mut new_base_state: Option<DynValue> = None;
    let mut new_base: Vec<Update> = Vec::new();
    let mut skipped = Lanes::NONE;

    for update in &updates {
        if session_lanes.contains(update.lane) {
            value = update.action.apply(value.as_ref());
            if !new_base.is_empty() {
                // Applied but retained for replay behind a skipped entry.
                // The empty lane set is a subset of every render pass, so
                // the entry re-applies unconditionally and is never marked
                // as remaining work.
                new_base.push(Update {
                    lane: Lanes::NONE,
                    action: update.action.clone(),
                });
            }
        } else {
            if new_base.is_empty() {
                new_base_state = Some(value.clone());
            }
            skipped = skipped.merge(update.lane);
            new_base.push(update.clone());
        }
    }

    queue.last_rendered = Some(value.clone());
    let base_state = new_base_state.unwrap_or_else(|| value.clone());
    (
        ReducerHook {
            memoized: value,
            base_state,
            base_updates: new_base,
            queue: Rc::clone(&prev.queue),
        },
        skipped,
    )
}

/// Persists newly pending queue entries onto the committed chain before a
/// body re-executes, so discarding the work-in-progress tree never loses
/// dispatched updates. Runs with the arena borrowed; replay itself does not
/// touch the arena.
pub(crate) fn absorb_pending_updates(hooks: &mut [Hook]) {
    for hook in hooks {
        if let Hook::Reducer(reducer) = hook {
            let mut queue = reducer.queue.borrow_mut();
            if !queue.pending.is_empty() {
                let drained: Vec<Update> = queue.pending.drain(..).collect();
                reducer.base_updates.extend(drained);
            }
        }
    }
}

/// Enqueues one transition at the priority in effect at the call site and
/// asks the scheduler for a pass. Skipped entirely when the eagerly computed
/// next state equals the current one and nothing else is pending on the
/// cell or its fiber.
fn dispatch_update(
    queue: &Rc<RefCell<UpdateQueue>>,
    engine: &EngineRef,
    fiber: FiberId,
    action: Action,
) {
    let lane = engine.current_lane(fiber);
    {
        let mut queue = queue.borrow_mut();
        if queue.pending.is_empty() && !engine.fiber_has_pending_work(fiber) {
            if let Some(last) = queue.last_rendered.clone() {
                let eager = action.apply(last.as_ref());
                if (queue.eq)(eager.as_ref(), last.as_ref()) {
                    log::trace!("eager state check: dispatch is a no-op, not scheduling");
                    return;
                }
            }
        }
        queue.pending.push(Update { lane, action });
    }
    engine.schedule_update(fiber, lane);
}

/// A clonable handle that enqueues state transitions for one cell.
pub struct StateSetter<T> {
    queue: Rc<RefCell<UpdateQueue>>,
    engine: EngineRef,
    fiber: FiberId,
    _marker: PhantomData<fn(T)>,
}

impl<T> Clone for StateSetter<T> {
    fn clone(&self) -> Self {
        Self {
            queue: Rc::clone(&self.queue),
            engine: self.engine.clone(),
            fiber: self.fiber,
            _marker: PhantomData,
        }
    }
}

impl<T: 'static> StateSetter<T> {
    pub fn set(&self, value: T) {
        dispatch_update(&self.queue, &self.engine, self.fiber, Action::Replace(Rc::new(value)));
    }

    pub fn update(&self, f: impl Fn(&T) -> T + 'static) {
        let action = Action::Apply(Rc::new(move |prev: &dyn Any| {
            let prev = prev
                .downcast_ref::<T>()
                .expect("state cell holds a different type");
            Rc::new(f(prev)) as DynValue
        }));
        dispatch_update(&self.queue, &self.engine, self.fiber, action);
    }
}

/// A persistent state cell. Returns the committed value for this pass and a
/// setter that enqueues transitions.
pub fn use_state<T: PartialEq + 'static>(init: impl FnOnce() -> T) -> (Rc<T>, StateSetter<T>) {
    let (hook, engine, fiber) = with_session(|session| {
        let replayed = session.replay_slot("state");
        let hook = match replayed {
            Some(Hook::Reducer(prev)) => {
                let (next, skipped) = replay_reducer(&prev, session.render_lanes);
                session.skipped_lanes = session.skipped_lanes.merge(skipped);
                next
            }
            _ => {
                let initial: DynValue = Rc::new(init());
                ReducerHook {
                    memoized: initial.clone(),
                    base_state: initial.clone(),
                    base_updates: Vec::new(),
                    queue: Rc::new(RefCell::new(UpdateQueue {
                        pending: Vec::new(),
                        last_rendered: Some(initial),
                        eq: erased_eq::<T>(),
                    })),
                }
            }
        };
        session.cursor += 1;
        session.next_hooks.push(Hook::Reducer(hook.clone()));
        (hook, session.engine.clone(), session.fiber)
    });
    let value = downcast::<T>(&hook.memoized);
    let setter = StateSetter {
        queue: hook.queue,
        engine,
        fiber,
        _marker: PhantomData,
    };
    (value, setter)
}

/// A reducer cell: transitions are domain actions folded through `reducer`.
///
/// The dispatcher captures the reducer from this pass, so eager evaluation
/// at enqueue time always uses the last-known reducer.
pub fn use_reducer<T, A>(
    init: impl FnOnce() -> T,
    reducer: impl Fn(&T, &A) -> T + 'static,
) -> (Rc<T>, Dispatcher<A>)
where
    T: PartialEq + 'static,
    A: 'static,
{
    let (value, setter) = use_state(init);
    let apply: Rc<dyn Fn(&dyn Any, &A) -> DynValue> = Rc::new(move |prev: &dyn Any, action: &A| {
        let prev = prev
            .downcast_ref::<T>()
            .expect("state cell holds a different type");
        Rc::new(reducer(prev, action)) as DynValue
    });
    (
        value,
        Dispatcher {
            queue: setter.queue,
            engine: setter.engine,
            fiber: setter.fiber,
            apply,
        },
    )
}

/// Clonable dispatch handle for a reducer cell.
pub struct Dispatcher<A> {
    queue: Rc<RefCell<UpdateQueue>>,
    engine: EngineRef,
    fiber: FiberId,
    apply: Rc<dyn Fn(&dyn Any, &A) -> DynValue>,
}

impl<A> Clone for Dispatcher<A> {
    fn clone(&self) -> Self {
        Self {
            queue: Rc::clone(&self.queue),
            engine: self.engine.clone(),
            fiber: self.fiber,
            apply: Rc::clone(&self.apply),
        }
    }
}

impl<A: 'static> Dispatcher<A> {
    pub fn dispatch(&self, action: A) {
        let apply = Rc::clone(&self.apply);
        let action = Rc::new(action);
        let update = Action::Apply(Rc::new(move |prev: &dyn Any| apply(prev, &action)));
        dispatch_update(&self.queue, &self.engine, self.fiber, update);
    }
}

/// A memoized value cell: `compute` re-runs only when `deps` change.
pub fn use_memo<T, D>(deps: D, compute: impl FnOnce() -> T) -> Rc<T>
where
    T: 'static,
    D: PartialEq + 'static,
{
    let value = with_session(|session| {
        let replayed = session.replay_slot("memo");
        let hook = match replayed {
            Some(Hook::Memo(prev)) if prev.deps.downcast_ref::<D>() == Some(&deps) => prev,
            _ => MemoHook {
                value: Rc::new(compute()),
                deps: Rc::new(deps),
            },
        };
        session.cursor += 1;
        let value = hook.value.clone();
        session.next_hooks.push(Hook::Memo(hook));
        value
    });
    downcast::<T>(&value)
}

fn use_effect_impl<D>(kind: EffectKind, deps: D, setup: SetupFn)
where
    D: PartialEq + 'static,
{
    with_session(|session| {
        let replayed = session.replay_slot("effect");
        let record = match replayed {
            Some(Hook::Effect(prev)) => {
                if prev.deps.downcast_ref::<D>() != Some(&deps) {
                    Rc::new(EffectRecord::replacing(&prev, setup, Rc::new(deps)))
                } else {
                    prev
                }
            }
            _ => Rc::new(EffectRecord::new(kind, setup, Rc::new(deps))),
        };
        if record.has_pending_work() {
            session.fiber_flags = session.fiber_flags.merge(match kind {
                EffectKind::Layout => Flags::LAYOUT,
                EffectKind::Passive => Flags::PASSIVE,
            });
        }
        session.cursor += 1;
        session.effects.push(Rc::clone(&record));
        session.next_hooks.push(Hook::Effect(record));
    });
}

/// Registers a deferred side effect. `setup` runs after commit on a later
/// scheduler turn whenever `deps` differ from the previous pass; its
/// returned teardown runs before the next setup and on unmount. Pass `()`
/// as deps to run the setup once.
pub fn use_effect<D: PartialEq + 'static>(
    deps: D,
    setup: impl FnOnce() -> Option<Teardown> + 'static,
) {
    use_effect_impl(EffectKind::Passive, deps, Box::new(setup));
}

/// Like [`use_effect`] but runs synchronously inside the commit, before the
/// host regains control. For work that must observe pre-paint state.
pub fn use_layout_effect<D: PartialEq + 'static>(
    deps: D,
    setup: impl FnOnce() -> Option<Teardown> + 'static,
) {
    use_effect_impl(EffectKind::Layout, deps, Box::new(setup));
}

/// Runs teardown for every effect on a fiber being removed from the tree.
pub(crate) fn teardown_all(effects: &[Rc<EffectRecord>]) {
    for effect in effects {
        effect.run_teardown();
    }
}
