use super::*;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

fn setup() -> (Reconciler, Rc<MemoryHost>, RootHandle) {
    let host = MemoryHost::new();
    let reconciler = Reconciler::new(host.clone());
    let container = host.create_container();
    let root = reconciler.create_root(container);
    (reconciler, host, root)
}

fn count_handle(host: &MemoryHost) -> HostHandle {
    host.ops()
        .iter()
        .find_map(|op| match op {
            HostOp::Create { handle, tag } if tag.as_ref() == "count" => Some(*handle),
            _ => None,
        })
        .expect("counter host node created")
}

type SetterSlot = Rc<RefCell<Option<StateSetter<i32>>>>;

/// A counter component exposing its setter and a body-run tally.
fn counter() -> (Component, SetterSlot, Rc<Cell<usize>>) {
    let setter_slot: SetterSlot = Rc::new(RefCell::new(None));
    let renders = Rc::new(Cell::new(0usize));
    let slot = Rc::clone(&setter_slot);
    let tally = Rc::clone(&renders);
    let component = Component::new("Counter", move |_props| {
        tally.set(tally.get() + 1);
        let (value, setter) = use_state(|| 0i32);
        *slot.borrow_mut() = Some(setter);
        Element::host(
            "count",
            Props::new().set("value", PropValue::Int(*value as i64)),
            vec![],
        )
    });
    (component, setter_slot, renders)
}

fn mounted_counter() -> (Reconciler, Rc<MemoryHost>, RootHandle, SetterSlot, Rc<Cell<usize>>) {
    let (reconciler, host, root) = setup();
    let (component, setter, renders) = counter();
    root.render(Element::component(component, Props::new())).unwrap();
    root.flush_until_idle().unwrap();
    (reconciler, host, root, setter, renders)
}

fn value_of(host: &MemoryHost, handle: HostHandle) -> i64 {
    match host.node_prop(handle, "value") {
        Some(PropValue::Int(value)) => value,
        other => panic!("missing counter value: {other:?}"),
    }
}

#[test]
fn two_dispatches_coalesce_into_one_render() {
    let (_reconciler, host, root, setter, renders) = mounted_counter();
    assert_eq!(renders.get(), 1);
    let setter = setter.borrow().clone().expect("setter captured");

    setter.update(|n| n + 1);
    setter.update(|n| n + 1);
    root.flush_until_idle().unwrap();

    assert_eq!(renders.get(), 2);
    assert_eq!(value_of(&host, count_handle(&host)), 2);
}

#[test]
fn noop_dispatch_schedules_nothing() {
    let (_reconciler, host, root, setter, renders) = mounted_counter();
    let setter = setter.borrow().clone().expect("setter captured");

    // The eager equality check sees 0 == 0 with nothing pending.
    setter.set(0);
    assert_eq!(host.pending_task_count(), 0);
    assert!(root.is_idle());
    assert_eq!(renders.get(), 1);
}

#[test]
fn changed_dispatch_after_noop_still_renders() {
    let (_reconciler, host, root, setter, renders) = mounted_counter();
    let setter = setter.borrow().clone().expect("setter captured");

    setter.set(0);
    setter.set(7);
    root.flush_until_idle().unwrap();
    assert_eq!(renders.get(), 2);
    assert_eq!(value_of(&host, count_handle(&host)), 7);
}

#[test]
fn reducer_folds_actions_in_dispatch_order() {
    enum Op {
        Add(i32),
        Reset,
    }

    let (_reconciler, host, root) = setup();
    let dispatch_slot: Rc<RefCell<Option<Dispatcher<Op>>>> = Rc::new(RefCell::new(None));
    let slot = Rc::clone(&dispatch_slot);
    let component = Component::new("Tally", move |_props| {
        let (value, dispatch) = use_reducer(
            || 0i32,
            |state, action| match action {
                Op::Add(n) => *state + n,
                Op::Reset => 0,
            },
        );
        *slot.borrow_mut() = Some(dispatch);
        Element::host(
            "count",
            Props::new().set("value", PropValue::Int(*value as i64)),
            vec![],
        )
    });
    root.render(Element::component(component, Props::new())).unwrap();
    root.flush_until_idle().unwrap();

    let dispatch = dispatch_slot.borrow().clone().expect("dispatcher captured");
    dispatch.dispatch(Op::Add(5));
    dispatch.dispatch(Op::Reset);
    dispatch.dispatch(Op::Add(2));
    root.flush_until_idle().unwrap();
    assert_eq!(value_of(&host, count_handle(&host)), 2);
}

#[test]
fn memo_recomputes_only_when_deps_change() {
    let (_reconciler, _host, root) = setup();
    let computes = Rc::new(Cell::new(0usize));
    let dep_setter: SetterSlot = Rc::new(RefCell::new(None));
    let other_setter: SetterSlot = Rc::new(RefCell::new(None));
    let component = {
        let computes = Rc::clone(&computes);
        let dep_slot = Rc::clone(&dep_setter);
        let other_slot = Rc::clone(&other_setter);
        Component::new("Memoized", move |_props| {
            let (dep, set_dep) = use_state(|| 0i32);
            let (_other, set_other) = use_state(|| 0i32);
            *dep_slot.borrow_mut() = Some(set_dep);
            *other_slot.borrow_mut() = Some(set_other);
            let computes = Rc::clone(&computes);
            let doubled = use_memo(*dep, move || {
                computes.set(computes.get() + 1);
                *dep * 2
            });
            Element::host(
                "out",
                Props::new().set("value", PropValue::Int(*doubled as i64)),
                vec![],
            )
        })
    };
    root.render(Element::component(component, Props::new())).unwrap();
    root.flush_until_idle().unwrap();
    assert_eq!(computes.get(), 1);

    let set_other = other_setter.borrow().clone().unwrap();
    set_other.set(5);
    root.flush_until_idle().unwrap();
    assert_eq!(computes.get(), 1, "unrelated state must not recompute");

    let set_dep = dep_setter.borrow().clone().unwrap();
    set_dep.set(3);
    root.flush_until_idle().unwrap();
    assert_eq!(computes.get(), 2);
}

#[test]
fn dropping_a_hook_between_passes_fails_the_render() {
    let (_reconciler, host, root) = setup();
    let second_hook = Rc::new(Cell::new(true));
    let setter_slot: SetterSlot = Rc::new(RefCell::new(None));
    let component = {
        let second_hook = Rc::clone(&second_hook);
        let slot = Rc::clone(&setter_slot);
        Component::new("Unstable", move |_props| {
            let (value, setter) = use_state(|| 0i32);
            *slot.borrow_mut() = Some(setter);
            if second_hook.get() {
                use_memo((), || 1i32);
            }
            Element::host(
                "count",
                Props::new().set("value", PropValue::Int(*value as i64)),
                vec![],
            )
        })
    };
    root.render(Element::component(component, Props::new())).unwrap();
    root.flush_until_idle().unwrap();

    second_hook.set(false);
    let setter = setter_slot.borrow().clone().unwrap();
    setter.set(1);
    let err = root.flush_until_idle().unwrap_err();
    assert_eq!(
        err,
        RenderError::HookMismatch {
            index: 1,
            expected: "memo",
            found: "end of chain",
        }
    );
    // The committed tree is untouched by the failed pass.
    assert_eq!(value_of(&host, count_handle(&host)), 0);
}

#[test]
fn swapping_hook_kinds_reports_both_sides() {
    let (_reconciler, _host, root) = setup();
    let use_memo_slot = Rc::new(Cell::new(true));
    let setter_slot: SetterSlot = Rc::new(RefCell::new(None));
    let component = {
        let use_memo_slot = Rc::clone(&use_memo_slot);
        let slot = Rc::clone(&setter_slot);
        Component::new("Shapeshifter", move |_props| {
            let (_value, setter) = use_state(|| 0i32);
            *slot.borrow_mut() = Some(setter);
            if use_memo_slot.get() {
                use_memo((), || 1i32);
            } else {
                let (_x, _s) = use_state(|| 1i32);
            }
            Element::host("count", Props::new(), vec![])
        })
    };
    root.render(Element::component(component, Props::new())).unwrap();
    root.flush_until_idle().unwrap();

    use_memo_slot.set(false);
    let setter = setter_slot.borrow().clone().unwrap();
    setter.set(1);
    let err = root.flush_until_idle().unwrap_err();
    assert_eq!(
        err,
        RenderError::HookMismatch {
            index: 1,
            expected: "memo",
            found: "state",
        }
    );
}
