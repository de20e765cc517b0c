use super::*;
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

#[test]
fn mounts_a_host_tree_into_the_container() {
    let (_reconciler, host, root) = setup();
    let tree = Element::host(
        "list",
        Props::new(),
        vec![
            Element::host("item", Props::new(), vec![Element::text("one")]),
            Element::text("two"),
        ],
    );
    root.render(tree).unwrap();
    root.flush_until_idle().unwrap();

    assert_eq!(host.child_summaries(root.container()), vec!["list"]);
    let ops = host.take_ops();
    let list = created_handle(&ops, "list");
    let item = created_handle(&ops, "item");
    assert_eq!(host.child_summaries(list), vec!["item", "\"two\""]);
    assert_eq!(host.child_summaries(item), vec!["\"one\""]);
    // The subtree is assembled off-screen; attaching it to the container is
    // the last mutation.
    assert_eq!(
        ops.last(),
        Some(&HostOp::Append {
            parent: root.container(),
            child: list,
        })
    );
}

#[test]
fn identical_rerender_touches_nothing() {
    let (_reconciler, host, root) = setup();
    let tree = Element::host(
        "list",
        Props::new().set("size", PropValue::Int(3)),
        vec![Element::text("same"), Element::host("item", Props::new(), vec![])],
    );
    root.render(tree.clone()).unwrap();
    root.flush_until_idle().unwrap();
    host.take_ops();

    root.render(tree).unwrap();
    root.flush_until_idle().unwrap();
    assert_eq!(host.take_ops(), vec![]);
    assert!(root.is_idle());
}

#[test]
fn prop_change_applies_one_update() {
    let (_reconciler, host, root) = setup();
    let make = |width: i64| {
        Element::host("box", Props::new().set("width", PropValue::Int(width)), vec![])
    };
    root.render(make(10)).unwrap();
    root.flush_until_idle().unwrap();
    let the_box = created_handle(&host.take_ops(), "box");

    root.render(make(20)).unwrap();
    root.flush_until_idle().unwrap();
    assert_eq!(host.take_ops(), vec![HostOp::Update { handle: the_box }]);
    assert_eq!(host.node_prop(the_box, "width"), Some(PropValue::Int(20)));
}

#[test]
fn empty_host_tag_is_rejected_before_scheduling() {
    let (_reconciler, host, root) = setup();
    let err = root
        .render(Element::host("", Props::new(), vec![]))
        .unwrap_err();
    assert!(matches!(err, RenderError::InvalidElement { .. }));
    assert_eq!(host.pending_task_count(), 0);
    assert!(root.is_idle());
}

#[test]
fn duplicate_sibling_keys_are_rejected_before_scheduling() {
    let (_reconciler, host, root) = setup();
    let tree = Element::host(
        "list",
        Props::new(),
        vec![
            Element::host("item", Props::new(), vec![]).keyed("k"),
            Element::host("item", Props::new(), vec![]).keyed("k"),
        ],
    );
    let err = root.render(tree).unwrap_err();
    assert!(matches!(err, RenderError::InvalidElement { .. }));
    assert_eq!(host.pending_task_count(), 0);
}

#[test]
fn host_create_failure_surfaces_from_flush() {
    let (_reconciler, host, root) = setup();
    host.poison_tag("cursed");
    root.render(Element::host("cursed", Props::new(), vec![]))
        .unwrap();
    let err = root.flush_until_idle().unwrap_err();
    assert_eq!(
        err,
        RenderError::Host(HostError::CreateFailed {
            tag: Rc::from("cursed")
        })
    );
    // Nothing was attached to the container.
    assert!(host.child_summaries(root.container()).is_empty());
}

#[test]
fn stale_scheduled_error_does_not_fail_a_later_render() {
    let (reconciler, host, root) = setup();
    host.poison_tag("cursed");
    root.render(Element::host("cursed", Props::new(), vec![]))
        .unwrap();
    // The scheduled pass fails and stashes its error on the root.
    assert!(host.run_next_task());

    // A later render that flushes cleanly must report its own outcome, not
    // the leftover failure.
    let outcome = reconciler.with_priority(UpdatePriority::Sync, || {
        root.render(Element::host("fine", Props::new(), vec![]))
    });
    assert_eq!(outcome, Ok(()));
    assert_eq!(host.child_summaries(root.container()), vec!["fine"]);

    // The earlier failure is still claimable.
    assert_eq!(
        root.take_last_error(),
        Some(RenderError::Host(HostError::CreateFailed {
            tag: Rc::from("cursed")
        }))
    );
    assert_eq!(root.take_last_error(), None);
}

#[test]
fn lone_text_child_is_absorbed_as_content() {
    let (_reconciler, host, root) = setup();
    host.register_text_content_tag("label");
    let make = |text: &str| {
        Element::host("label", Props::new(), vec![Element::text(text)])
    };
    root.render(make("hello")).unwrap();
    root.flush_until_idle().unwrap();

    let ops = host.take_ops();
    let label = created_handle(&ops, "label");
    assert!(
        !ops.iter().any(|op| matches!(op, HostOp::CreateText { .. })),
        "no text primitive should exist: {ops:?}"
    );
    assert_eq!(host.node_text(label), Some(Rc::from("hello")));

    root.render(make("goodbye")).unwrap();
    root.flush_until_idle().unwrap();
    assert_eq!(
        host.take_ops(),
        vec![HostOp::SetText {
            handle: label,
            text: Rc::from("goodbye"),
        }]
    );
}

#[test]
fn text_change_rewrites_the_text_node() {
    let (_reconciler, host, root) = setup();
    let make = |text: &str| Element::host("p", Props::new(), vec![Element::text(text)]);
    root.render(make("before")).unwrap();
    root.flush_until_idle().unwrap();
    let text_handle = host
        .take_ops()
        .iter()
        .find_map(|op| match op {
            HostOp::CreateText { handle, .. } => Some(*handle),
            _ => None,
        })
        .expect("text node created");

    root.render(make("after")).unwrap();
    root.flush_until_idle().unwrap();
    assert_eq!(
        host.take_ops(),
        vec![HostOp::SetText {
            handle: text_handle,
            text: Rc::from("after"),
        }]
    );
}

#[test]
fn sync_render_commits_before_returning() {
    let (reconciler, host, root) = setup();
    reconciler.with_priority(UpdatePriority::Sync, || {
        root.render(Element::host("now", Props::new(), vec![])).unwrap();
    });
    assert_eq!(host.child_summaries(root.container()), vec!["now"]);
}
