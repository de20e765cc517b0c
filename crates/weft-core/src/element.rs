//! Next-tree descriptions.
//!
//! An [`Element`] is one node of the declarative description the engine
//! reconciles against the committed tree. Descriptions are cheap to clone:
//! tags, keys and text are `Rc<str>`, component bodies are `Rc` closures,
//! and props use inline small-vec storage.

use std::fmt;
use std::rc::Rc;

use smallvec::SmallVec;

/// Sibling identity. Unique among siblings when present; text never carries
/// a key.
pub type Key = Rc<str>;

/// One attribute value on a host element.
#[derive(Clone, Debug, PartialEq)]
pub enum PropValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    /// Opaque handler registration understood by the event delivery layer.
    Handler(u64),
}

/// Ordered attribute list for host elements and component inputs.
#[derive(Clone, Default, PartialEq)]
pub struct Props {
    entries: SmallVec<[(Rc<str>, PropValue); 4]>,
}

impl Props {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: impl Into<Rc<str>>, value: PropValue) -> Self {
        let name = name.into();
        if let Some(slot) = self.entries.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value;
        } else {
            self.entries.push((name, value));
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&PropValue> {
        self.entries
            .iter()
            .find(|(n, _)| n.as_ref() == name)
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Rc<str>, &PropValue)> {
        self.entries.iter().map(|(n, v)| (n, v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for Props {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (name, value) in self.iter() {
            map.entry(&name.as_ref(), value);
        }
        map.finish()
    }
}

type ComponentBody = dyn Fn(&Props) -> Element;

/// A function component: a render body plus a debug name.
///
/// Identity for type-compatibility checks is the `Rc` pointer of the body,
/// so two components are "the same type" only when they share one closure
/// allocation. Clone handles freely; do not re-wrap the body.
#[derive(Clone)]
pub struct Component {
    name: &'static str,
    body: Rc<ComponentBody>,
}

impl Component {
    pub fn new(name: &'static str, body: impl Fn(&Props) -> Element + 'static) -> Self {
        Self {
            name,
            body: Rc::new(body),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn render(&self, props: &Props) -> Element {
        (self.body)(props)
    }

    pub fn same_type(&self, other: &Component) -> bool {
        Rc::ptr_eq(&self.body, &other.body)
    }
}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Component({})", self.name)
    }
}

#[derive(Clone, Debug)]
pub enum ElementKind {
    Host {
        tag: Rc<str>,
        props: Props,
        children: Vec<Element>,
    },
    Text(Rc<str>),
    Component {
        component: Component,
        props: Props,
    },
    Fragment {
        children: Vec<Element>,
    },
}

/// One node of the next-tree description.
#[derive(Clone, Debug)]
pub struct Element {
    pub key: Option<Key>,
    pub kind: ElementKind,
}

impl Element {
    pub fn host(tag: impl Into<Rc<str>>, props: Props, children: Vec<Element>) -> Self {
        Self {
            key: None,
            kind: ElementKind::Host {
                tag: tag.into(),
                props,
                children,
            },
        }
    }

    pub fn text(text: impl Into<Rc<str>>) -> Self {
        Self {
            key: None,
            kind: ElementKind::Text(text.into()),
        }
    }

    pub fn component(component: Component, props: Props) -> Self {
        Self {
            key: None,
            kind: ElementKind::Component { component, props },
        }
    }

    pub fn fragment(children: Vec<Element>) -> Self {
        Self {
            key: None,
            kind: ElementKind::Fragment { children },
        }
    }

    /// Attaches a sibling identity key. Text elements never carry keys; the
    /// request is ignored for them.
    pub fn keyed(mut self, key: impl Into<Key>) -> Self {
        if !matches!(self.kind, ElementKind::Text(_)) {
            self.key = Some(key.into());
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn props_set_replaces_existing_entry() {
        let props = Props::new()
            .set("width", PropValue::Int(10))
            .set("width", PropValue::Int(20));
        assert_eq!(props.len(), 1);
        assert_eq!(props.get("width"), Some(&PropValue::Int(20)));
    }

    #[test]
    fn component_identity_follows_the_body_allocation() {
        let a = Component::new("A", |_| Element::text("a"));
        let b = Component::new("A", |_| Element::text("a"));
        assert!(a.same_type(&a.clone()));
        assert!(!a.same_type(&b));
    }

    #[test]
    fn text_elements_refuse_keys() {
        let text = Element::text("hi").keyed("k");
        assert!(text.key.is_none());
        let host = Element::host("box", Props::new(), vec![]).keyed("k");
        assert_eq!(host.key.as_deref(), Some("k"));
    }
}
