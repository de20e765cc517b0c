use super::*;
use std::cell::Cell;
use std::rc::Rc;

fn setup() -> (Reconciler, Rc<MemoryHost>, RootHandle) {
    let host = MemoryHost::new();
    let reconciler = Reconciler::new(host.clone());
    let container = host.create_container();
    let root = reconciler.create_root(container);
    (reconciler, host, root)
}

fn created_handle(ops: &[HostOp], tag: &str) -> HostHandle {
    ops.iter()
        .find_map(|op| match op {
            HostOp::Create { handle, tag: t } if t.as_ref() == tag => Some(*handle),
            _ => None,
        })
        .unwrap_or_else(|| panic!("no Create op for tag {tag:?}"))
}

fn keyed_row(key: &str) -> Element {
    Element::host(key, Props::new(), vec![]).keyed(key)
}

fn row_list(keys: &[&str]) -> Element {
    Element::host("list", Props::new(), keys.iter().map(|k| keyed_row(k)).collect())
}

#[test]
fn keyed_reorder_moves_the_fallen_behind_children() {
    let (_reconciler, host, root) = setup();
    root.render(row_list(&["a", "b", "c", "d", "e"])).unwrap();
    root.flush_until_idle().unwrap();
    let ops = host.take_ops();
    let list = created_handle(&ops, "list");
    let handles: Vec<HostHandle> = ["a", "b", "c", "d", "e"]
        .iter()
        .map(|tag| created_handle(&ops, tag))
        .collect();
    let (a, b, _c, d, e) = (handles[0], handles[1], handles[2], handles[3], handles[4]);

    root.render(row_list(&["c", "b", "e", "f", "a"])).unwrap();
    root.flush_until_idle().unwrap();
    let ops = host.take_ops();

    assert_eq!(
        host.child_summaries(list),
        vec!["c", "b", "e", "f", "a"]
    );
    assert!(ops.contains(&HostOp::Remove { parent: list, child: d }));
    // The heuristic keeps "c" and "e" in place (their old indices ascend)
    // and moves "b" and "a" instead.
    for stable in [handles[2], e] {
        assert!(
            !ops.iter().any(|op| matches!(
                op,
                HostOp::InsertBefore { child, .. } | HostOp::Append { child, .. }
                    if *child == stable
            )),
            "stable child was moved: {ops:?}"
        );
    }
    assert!(ops.contains(&HostOp::InsertBefore {
        parent: list,
        child: b,
        anchor: e,
    }));
    assert!(ops.contains(&HostOp::Append { parent: list, child: a }));
}

#[test]
fn appending_at_the_tail_leaves_existing_children_alone() {
    let (_reconciler, host, root) = setup();
    root.render(row_list(&["a", "b"])).unwrap();
    root.flush_until_idle().unwrap();
    let list = created_handle(&host.take_ops(), "list");

    root.render(row_list(&["a", "b", "c"])).unwrap();
    root.flush_until_idle().unwrap();
    let ops = host.take_ops();
    let c = created_handle(&ops, "c");
    assert_eq!(
        ops,
        vec![
            HostOp::Create { handle: c, tag: Rc::from("c") },
            HostOp::Append { parent: list, child: c },
        ]
    );
}

#[test]
fn removing_the_head_emits_a_single_remove() {
    let (_reconciler, host, root) = setup();
    root.render(row_list(&["a", "b", "c"])).unwrap();
    root.flush_until_idle().unwrap();
    let ops = host.take_ops();
    let list = created_handle(&ops, "list");
    let a = created_handle(&ops, "a");

    root.render(row_list(&["b", "c"])).unwrap();
    root.flush_until_idle().unwrap();
    assert_eq!(
        host.take_ops(),
        vec![HostOp::Remove { parent: list, child: a }]
    );
    assert_eq!(host.child_summaries(list), vec!["b", "c"]);
}

#[test]
fn type_change_at_a_position_remounts() {
    let (_reconciler, host, root) = setup();
    root.render(Element::host("alpha", Props::new(), vec![])).unwrap();
    root.flush_until_idle().unwrap();
    let alpha = created_handle(&host.take_ops(), "alpha");

    root.render(Element::host("beta", Props::new(), vec![])).unwrap();
    root.flush_until_idle().unwrap();
    let ops = host.take_ops();
    let beta = created_handle(&ops, "beta");
    assert!(ops.contains(&HostOp::Remove {
        parent: root.container(),
        child: alpha,
    }));
    assert!(ops.contains(&HostOp::Append {
        parent: root.container(),
        child: beta,
    }));
    assert_eq!(host.child_summaries(root.container()), vec!["beta"]);
}

#[test]
fn keyed_move_preserves_component_state() {
    let (_reconciler, host, root) = setup();
    let inits = Rc::new(Cell::new(0usize));
    let counted = {
        let inits = Rc::clone(&inits);
        Component::new("Counted", move |props| {
            let inits = Rc::clone(&inits);
            let (value, _setter) = use_state(move || {
                inits.set(inits.get() + 1);
                0i32
            });
            let tag = match props.get("tag") {
                Some(PropValue::Str(tag)) => Rc::clone(tag),
                _ => Rc::from("anon"),
            };
            Element::host(
                tag,
                Props::new().set("value", PropValue::Int(*value as i64)),
                vec![],
            )
        })
    };
    let make = |keys: &[&str]| {
        Element::host(
            "list",
            Props::new(),
            keys.iter()
                .map(|k| {
                    Element::component(
                        counted.clone(),
                        Props::new().set("tag", PropValue::Str(Rc::from(*k))),
                    )
                    .keyed(*k)
                })
                .collect(),
        )
    };

    root.render(make(&["x", "y"])).unwrap();
    root.flush_until_idle().unwrap();
    assert_eq!(inits.get(), 2);

    root.render(make(&["y", "x"])).unwrap();
    root.flush_until_idle().unwrap();
    // Both positions were moves of existing fibers; no state cell was
    // re-initialized.
    assert_eq!(inits.get(), 2);
    let list = created_handle(&host.ops(), "list");
    assert_eq!(host.child_summaries(list), vec!["y", "x"]);
}

#[test]
fn duplicate_keys_inside_a_component_body_fail_the_pass() {
    let (_reconciler, _host, root) = setup();
    let broken = Component::new("Broken", |_| {
        Element::fragment(vec![
            Element::host("item", Props::new(), vec![]).keyed("dup"),
            Element::host("item", Props::new(), vec![]).keyed("dup"),
        ])
    });
    root.render(Element::component(broken, Props::new())).unwrap();
    let err = root.flush_until_idle().unwrap_err();
    assert!(matches!(err, RenderError::InvalidElement { .. }));
}

#[test]
fn emptying_children_deletes_them_all() {
    let (_reconciler, host, root) = setup();
    root.render(row_list(&["a", "b"])).unwrap();
    root.flush_until_idle().unwrap();
    let list = created_handle(&host.take_ops(), "list");

    root.render(Element::host("list", Props::new(), vec![])).unwrap();
    root.flush_until_idle().unwrap();
    assert!(host.child_summaries(list).is_empty());
    assert_eq!(
        host.take_ops()
            .iter()
            .filter(|op| matches!(op, HostOp::Remove { .. }))
            .count(),
        2
    );
}
