//! A small scripted session against the in-memory host: mounts a task list,
//! dispatches updates at different priorities, and prints the host tree
//! after each step. Run with `RUST_LOG=weft_core=debug` to watch the
//! scheduler's decisions.

use std::cell::RefCell;
use std::error::Error;
use std::rc::Rc;

use weft_core::{
    use_effect, use_state, Component, Element, MemoryHost, PropValue, Props, Reconciler,
    StateSetter, UpdatePriority,
};

fn item(label: &str, done: bool) -> Element {
    Element::host(
        "item",
        Props::new()
            .set("label", PropValue::Str(Rc::from(label)))
            .set("done", PropValue::Bool(done)),
        vec![Element::text(label)],
    )
    .keyed(label)
}

fn task_list() -> (Component, Rc<RefCell<Option<StateSetter<usize>>>>) {
    let setter_slot: Rc<RefCell<Option<StateSetter<usize>>>> = Rc::new(RefCell::new(None));
    let slot = Rc::clone(&setter_slot);
    let component = Component::new("TaskList", move |_props| {
        let (done_count, set_done) = use_state(|| 0usize);
        *slot.borrow_mut() = Some(set_done);
        let done = *done_count;
        use_effect(done, move || {
            log::info!("{done} task(s) done");
            None
        });
        let labels = ["water plants", "file taxes", "walk dog"];
        Element::host(
            "list",
            Props::new().set("done", PropValue::Int(done as i64)),
            labels
                .iter()
                .copied()
                .enumerate()
                .map(|(index, label)| item(label, index < done))
                .collect(),
        )
    });
    (component, setter_slot)
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let host = MemoryHost::new();
    let reconciler = Reconciler::new(host.clone());
    let container = host.create_container();
    let root = reconciler.create_root(container);

    let (list, setter) = task_list();
    root.render(Element::component(list, Props::new()))?;
    host.run_until_idle();
    println!("mounted: {:?}", host.child_summaries(container));

    let set_done = setter.borrow().clone().expect("setter captured on mount");

    // A background update, then an urgent one arriving before it flushes.
    set_done.update(|n| n + 1);
    reconciler.with_priority(UpdatePriority::Sync, || {
        set_done.update(|n| n + 1);
    });
    host.run_until_idle();
    println!("after updates: {} host ops so far", host.ops().len());

    root.flush_until_idle()?;
    println!("settled: {:?}", host.child_summaries(container));
    Ok(())
}
