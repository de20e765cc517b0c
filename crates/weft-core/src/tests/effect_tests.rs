use super::*;
use std::cell::RefCell;
use std::rc::Rc;

fn setup() -> (Reconciler, Rc<MemoryHost>, RootHandle) {
    let host = MemoryHost::new();
    let reconciler = Reconciler::new(host.clone());
    let container = host.create_container();
    let root = reconciler.create_root(container);
    (reconciler, host, root)
}

type Log = Rc<RefCell<Vec<String>>>;

fn log_entry(log: &Log, entry: impl Into<String>) {
    log.borrow_mut().push(entry.into());
}

/// A component whose passive effect re-runs when its "n" prop changes.
fn effectful(name: &'static str, log: &Log) -> Component {
    let log = Rc::clone(log);
    Component::new(name, move |props| {
        let n = match props.get("n") {
            Some(PropValue::Int(n)) => *n,
            _ => 0,
        };
        let log = Rc::clone(&log);
        use_effect(n, move || {
            log_entry(&log, format!("setup {name} {n}"));
            let log = Rc::clone(&log);
            Some(Box::new(move || {
                log_entry(&log, format!("teardown {name}"));
            }) as Teardown)
        });
        Element::host("leaf", Props::new(), vec![])
    })
}

fn pair(a: &Component, b: &Component, n: i64) -> Element {
    Element::fragment(vec![
        Element::component(a.clone(), Props::new().set("n", PropValue::Int(n))),
        Element::component(b.clone(), Props::new().set("n", PropValue::Int(n))),
    ])
}

#[test]
fn passive_effects_are_deferred_past_the_commit() {
    let (_reconciler, host, root) = setup();
    let log: Log = Rc::new(RefCell::new(Vec::new()));
    let component = effectful("A", &log);
    root.render(Element::component(
        component,
        Props::new().set("n", PropValue::Int(0)),
    ))
    .unwrap();

    assert!(host.run_next_task());
    // Committed, but the passive setup has not run yet.
    assert_eq!(host.child_summaries(root.container()), vec!["leaf"]);
    assert!(log.borrow().is_empty());
    assert_eq!(host.pending_task_count(), 1);

    assert!(host.run_next_task());
    assert_eq!(*log.borrow(), vec!["setup A 0"]);
}

#[test]
fn layout_effects_run_inside_a_sync_flush() {
    let (reconciler, _host, root) = setup();
    let log: Log = Rc::new(RefCell::new(Vec::new()));
    let component = {
        let log = Rc::clone(&log);
        Component::new("Measured", move |_props| {
            let layout_log = Rc::clone(&log);
            use_layout_effect((), move || {
                log_entry(&layout_log, "layout");
                None
            });
            let passive_log = Rc::clone(&log);
            use_effect((), move || {
                log_entry(&passive_log, "passive");
                None
            });
            Element::host("leaf", Props::new(), vec![])
        })
    };
    reconciler.with_priority(UpdatePriority::Sync, || {
        root.render(Element::component(component, Props::new())).unwrap();
    });
    // Layout ran before control came back; passive is still queued.
    assert_eq!(*log.borrow(), vec!["layout"]);
    root.flush_until_idle().unwrap();
    assert_eq!(*log.borrow(), vec!["layout", "passive"]);
}

#[test]
fn all_teardowns_run_before_any_setup() {
    let (_reconciler, _host, root) = setup();
    let log: Log = Rc::new(RefCell::new(Vec::new()));
    let a = effectful("A", &log);
    let b = effectful("B", &log);

    root.render(pair(&a, &b, 0)).unwrap();
    root.flush_until_idle().unwrap();
    assert_eq!(*log.borrow(), vec!["setup A 0", "setup B 0"]);

    root.render(pair(&a, &b, 1)).unwrap();
    root.flush_until_idle().unwrap();
    assert_eq!(
        *log.borrow(),
        vec![
            "setup A 0",
            "setup B 0",
            "teardown A",
            "teardown B",
            "setup A 1",
            "setup B 1",
        ]
    );
}

#[test]
fn unchanged_deps_skip_the_effect() {
    let (_reconciler, _host, root) = setup();
    let log: Log = Rc::new(RefCell::new(Vec::new()));
    let a = effectful("A", &log);
    let b = effectful("B", &log);

    root.render(pair(&a, &b, 0)).unwrap();
    root.flush_until_idle().unwrap();
    root.render(pair(&a, &b, 0)).unwrap();
    root.flush_until_idle().unwrap();
    assert_eq!(*log.borrow(), vec!["setup A 0", "setup B 0"]);
}

#[test]
fn discarded_pass_does_not_disturb_committed_effects() {
    let (reconciler, host, root) = setup();
    let log: Log = Rc::new(RefCell::new(Vec::new()));
    let m_slot: Rc<RefCell<Option<StateSetter<i64>>>> = Rc::new(RefCell::new(None));
    let u_slot: Rc<RefCell<Option<StateSetter<i64>>>> = Rc::new(RefCell::new(None));
    let component = {
        let log = Rc::clone(&log);
        let m_slot = Rc::clone(&m_slot);
        let u_slot = Rc::clone(&u_slot);
        Component::new("Tracked", move |_props| {
            let (m, set_m) = use_state(|| 0i64);
            let (_u, set_u) = use_state(|| 0i64);
            *m_slot.borrow_mut() = Some(set_m);
            *u_slot.borrow_mut() = Some(set_u);
            let n = *m;
            let log = Rc::clone(&log);
            use_effect(n, move || {
                log_entry(&log, format!("setup {n}"));
                let log = Rc::clone(&log);
                Some(Box::new(move || log_entry(&log, format!("teardown {n}"))) as Teardown)
            });
            Element::host(
                "panel",
                Props::new().set("m", PropValue::Int(n)),
                vec![
                    Element::host("leaf", Props::new(), vec![]),
                    Element::host("leaf", Props::new(), vec![]),
                    Element::host("leaf", Props::new(), vec![]),
                ],
            )
        })
    };
    root.render(Element::component(component, Props::new())).unwrap();
    root.flush_until_idle().unwrap();
    assert_eq!(*log.borrow(), vec!["setup 0"]);
    let set_m = m_slot.borrow().clone().unwrap();
    let set_u = u_slot.borrow().clone().unwrap();

    set_m.set(1);
    host.yield_after(4);
    // The pass renders the body with m = 1, then yields inside the tree.
    assert!(host.run_next_task());

    reconciler.with_priority(UpdatePriority::Sync, || set_u.set(1));
    // The sync flush discarded that pass and re-rendered with m still 0, so
    // the committed effect has no new work: no passive task, only the
    // default-lane continuation is queued, and the log is untouched.
    assert_eq!(host.pending_task_count(), 1);
    assert_eq!(*log.borrow(), vec!["setup 0"]);

    host.run_until_idle();
    assert_eq!(*log.borrow(), vec!["setup 0", "teardown 0", "setup 1"]);
}

#[test]
fn unmounting_runs_teardowns() {
    let (_reconciler, _host, root) = setup();
    let log: Log = Rc::new(RefCell::new(Vec::new()));
    let a = effectful("A", &log);

    let full = Element::host(
        "wrap",
        Props::new(),
        vec![Element::component(
            a.clone(),
            Props::new().set("n", PropValue::Int(0)),
        )],
    );
    root.render(full).unwrap();
    root.flush_until_idle().unwrap();
    assert_eq!(*log.borrow(), vec!["setup A 0"]);

    root.render(Element::host("wrap", Props::new(), vec![])).unwrap();
    root.flush_until_idle().unwrap();
    assert_eq!(*log.borrow(), vec!["setup A 0", "teardown A"]);
}
