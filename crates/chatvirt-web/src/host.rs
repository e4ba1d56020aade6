#![forbid(unsafe_code)]

//! [`DocumentHost`] over the live browser DOM.
//!
//! Observer callbacks never touch the page runtime directly. They append to a
//! shared [`EventInbox`] and call the wake hook; the runtime drains the inbox
//! on its next turn.

use std::cell::RefCell;
use std::rc::Rc;

use chatvirt_core::dom::{
    DocumentHost, DomError, HostEvent, Observer, Overflow, Rect, Subscription, SubscriptionKind,
};
use chatvirt_core::inbox::EventInbox;
use chatvirt_core::selector::SelectorError;
use js_sys::{Array, Reflect};
use wasm_bindgen::JsCast;
use wasm_bindgen::prelude::*;
use web_sys::{
    Document, Element, Event, EventTarget, HtmlElement, MutationObserver, MutationObserverInit,
    MutationRecord, Node, NodeList, ResizeObserver, ScrollIntoViewOptions, ScrollLogicalPosition,
    Window,
};

/// Called whenever an observer queues a notification.
pub type Wake = Rc<dyn Fn()>;

type Listener = Closure<dyn FnMut(Event)>;
type ObserverCallback = Closure<dyn FnMut(Array, JsValue)>;

enum Binding {
    Listener {
        target: EventTarget,
        event: &'static str,
        callback: Listener,
    },
    Mutations {
        observer: MutationObserver,
        _callback: ObserverCallback,
    },
    Resize {
        observer: ResizeObserver,
        _callback: ObserverCallback,
    },
}

impl Binding {
    fn release(self) {
        match self {
            Self::Listener {
                target,
                event,
                callback,
            } => {
                let _ = target
                    .remove_event_listener_with_callback(event, callback.as_ref().unchecked_ref());
            }
            Self::Mutations { observer, .. } => observer.disconnect(),
            Self::Resize { observer, .. } => observer.disconnect(),
        }
    }
}

/// The page's document plus the observers installed on it.
pub struct WebDocument {
    window: Window,
    document: Document,
    inbox: Rc<RefCell<EventInbox<Node>>>,
    wake: Wake,
    bindings: Vec<(Subscription<Node>, Binding)>,
}

impl WebDocument {
    pub fn new(window: Window, document: Document, wake: Wake) -> Self {
        Self {
            window,
            document,
            inbox: Rc::new(RefCell::new(EventInbox::new())),
            wake,
            bindings: Vec::new(),
        }
    }

    /// Drain queued notifications in delivery order.
    pub fn take_events(&mut self) -> Vec<(Observer, HostEvent<Node>)> {
        self.inbox.borrow_mut().drain()
    }

    /// Disconnect every observer and listener.
    pub fn release_all(&mut self) {
        for (_, binding) in self.bindings.drain(..) {
            binding.release();
        }
        self.inbox.borrow_mut().drain();
    }

    fn listen(
        &self,
        target: EventTarget,
        event: &'static str,
        owner: Observer,
        make: impl Fn() -> HostEvent<Node> + 'static,
    ) -> Result<Binding, DomError> {
        let inbox = Rc::clone(&self.inbox);
        let wake = Rc::clone(&self.wake);
        let callback = Listener::new(move |_event: Event| {
            inbox.borrow_mut().push(owner, make());
            wake();
        });
        target
            .add_event_listener_with_callback(event, callback.as_ref().unchecked_ref())
            .map_err(|err| DomError::Markup(js_message(&err)))?;
        Ok(Binding::Listener {
            target,
            event,
            callback,
        })
    }

    fn observe_mutations(&self, owner: Observer) -> Result<Binding, DomError> {
        let root = self
            .document
            .document_element()
            .ok_or(DomError::Detached)?;
        let inbox = Rc::clone(&self.inbox);
        let wake = Rc::clone(&self.wake);
        let callback = ObserverCallback::new(move |records: Array, _observer: JsValue| {
            let mut added = Vec::new();
            let mut removed = false;
            for record in records.iter() {
                if let Ok(record) = record.dyn_into::<MutationRecord>() {
                    added.extend(nodes_of(&record.added_nodes()));
                    removed |= record.removed_nodes().length() > 0;
                }
            }
            if added.is_empty() && !removed {
                return;
            }
            let mut inbox = inbox.borrow_mut();
            if !added.is_empty() {
                inbox.nodes_added(owner, added);
            }
            if removed {
                inbox.push(owner, HostEvent::NodesRemoved);
            }
            drop(inbox);
            wake();
        });
        let observer = MutationObserver::new(callback.as_ref().unchecked_ref())
            .map_err(|_| DomError::Unsupported("MutationObserver"))?;
        let init = MutationObserverInit::new();
        init.set_child_list(true);
        init.set_subtree(true);
        observer
            .observe_with_options(&root, &init)
            .map_err(|err| DomError::Markup(js_message(&err)))?;
        Ok(Binding::Mutations {
            observer,
            _callback: callback,
        })
    }

    fn observe_resize(&self, owner: Observer, node: &Node) -> Result<Binding, DomError> {
        let supported = Reflect::has(&js_sys::global(), &JsValue::from_str("ResizeObserver"))
            .unwrap_or(false);
        if !supported {
            return Err(DomError::Unsupported("ResizeObserver"));
        }
        let element = node.dyn_ref::<Element>().ok_or(DomError::Detached)?;
        let inbox = Rc::clone(&self.inbox);
        let wake = Rc::clone(&self.wake);
        let callback = ObserverCallback::new(move |_entries: Array, _observer: JsValue| {
            inbox.borrow_mut().push(owner, HostEvent::Resize);
            wake();
        });
        let observer = ResizeObserver::new(callback.as_ref().unchecked_ref())
            .map_err(|_| DomError::Unsupported("ResizeObserver"))?;
        observer.observe(element);
        Ok(Binding::Resize {
            observer,
            _callback: callback,
        })
    }
}

impl Drop for WebDocument {
    fn drop(&mut self) {
        self.release_all();
    }
}

fn js_message(err: &JsValue) -> String {
    err.dyn_ref::<js_sys::Error>()
        .map(|e| String::from(e.message()))
        .or_else(|| err.as_string())
        .unwrap_or_else(|| format!("{err:?}"))
}

fn nodes_of(list: &NodeList) -> Vec<Node> {
    (0..list.length()).filter_map(|i| list.item(i)).collect()
}

fn rejected(err: &JsValue) -> DomError {
    DomError::InvalidSelector(SelectorError::Rejected(js_message(err)))
}

fn px(value: i32) -> f64 {
    f64::from(value)
}

impl DocumentHost for WebDocument {
    type Node = Node;

    fn document_element(&self) -> Node {
        self.document
            .document_element()
            .map_or_else(|| self.document.clone().into(), Node::from)
    }

    fn body(&self) -> Option<Node> {
        self.document.body().map(Node::from)
    }

    fn scrolling_element(&self) -> Node {
        self.document
            .scrolling_element()
            .map_or_else(|| self.document_element(), Node::from)
    }

    fn query_all(&self, selector: &str) -> Result<Vec<Node>, DomError> {
        let list = self
            .document
            .query_selector_all(selector)
            .map_err(|err| rejected(&err))?;
        Ok(nodes_of(&list))
    }

    fn query_within(&self, root: &Node, selector: &str) -> Result<Vec<Node>, DomError> {
        let Some(element) = root.dyn_ref::<Element>() else {
            return Ok(Vec::new());
        };
        let list = element
            .query_selector_all(selector)
            .map_err(|err| rejected(&err))?;
        Ok(nodes_of(&list))
    }

    fn matches(&self, node: &Node, selector: &str) -> Result<bool, DomError> {
        match node.dyn_ref::<Element>() {
            Some(element) => element.matches(selector).map_err(|err| rejected(&err)),
            None => Ok(false),
        }
    }

    fn is_element(&self, node: &Node) -> bool {
        node.node_type() == Node::ELEMENT_NODE
    }

    fn is_connected(&self, node: &Node) -> bool {
        node.is_connected()
    }

    fn parent_element(&self, node: &Node) -> Option<Node> {
        node.parent_element().map(Node::from)
    }

    fn next_sibling(&self, node: &Node) -> Option<Node> {
        node.next_sibling()
    }

    fn element_children(&self, node: &Node) -> Vec<Node> {
        let Some(element) = node.dyn_ref::<Element>() else {
            return Vec::new();
        };
        let children = element.children();
        (0..children.length())
            .filter_map(|i| children.item(i))
            .map(Node::from)
            .collect()
    }

    fn tag_name(&self, node: &Node) -> String {
        node.dyn_ref::<Element>()
            .map(|e| e.tag_name().to_ascii_lowercase())
            .unwrap_or_default()
    }

    fn attribute(&self, node: &Node, name: &str) -> Option<String> {
        node.dyn_ref::<Element>()?.get_attribute(name)
    }

    fn create_element(&mut self, tag: &str) -> Result<Node, DomError> {
        self.document
            .create_element(tag)
            .map(Node::from)
            .map_err(|err| DomError::Markup(js_message(&err)))
    }

    fn set_attribute(&mut self, node: &Node, name: &str, value: &str) {
        if let Some(element) = node.dyn_ref::<Element>()
            && let Err(err) = element.set_attribute(name, value)
        {
            tracing::debug!(name, error = %js_message(&err), "setAttribute failed");
        }
    }

    fn set_style(&mut self, node: &Node, property: &str, value: &str) {
        if let Some(element) = node.dyn_ref::<HtmlElement>() {
            let _ = element.style().set_property(property, value);
        }
    }

    fn insert_before(
        &mut self,
        parent: &Node,
        node: &Node,
        reference: Option<&Node>,
    ) -> Result<(), DomError> {
        if reference.is_some_and(|r| r.parent_node().as_ref() != Some(parent)) {
            return Err(DomError::Detached);
        }
        parent
            .insert_before(node, reference)
            .map(|_| ())
            .map_err(|err| DomError::Markup(js_message(&err)))
    }

    fn remove(&mut self, node: &Node) {
        if let Some(parent) = node.parent_node() {
            let _ = parent.remove_child(node);
        }
    }

    fn inner_markup(&self, node: &Node) -> String {
        node.dyn_ref::<Element>()
            .map(Element::inner_html)
            .unwrap_or_default()
    }

    fn set_inner_markup(&mut self, node: &Node, markup: &str) -> Result<(), DomError> {
        let element = node.dyn_ref::<Element>().ok_or(DomError::Detached)?;
        element.set_inner_html(markup);
        Ok(())
    }

    fn bounding_rect(&self, node: &Node) -> Rect {
        match node.dyn_ref::<Element>() {
            Some(element) if node.is_connected() => {
                let rect = element.get_bounding_client_rect();
                Rect::new(rect.top(), rect.height())
            }
            _ => Rect::default(),
        }
    }

    fn overflow_y(&self, node: &Node) -> Overflow {
        let Some(element) = node.dyn_ref::<Element>() else {
            return Overflow::Visible;
        };
        match self.window.get_computed_style(element) {
            Ok(Some(style)) => style
                .get_property_value("overflow-y")
                .map_or(Overflow::Visible, |v| Overflow::from_css(&v)),
            _ => Overflow::Visible,
        }
    }

    fn scroll_top(&self, node: &Node) -> f64 {
        node.dyn_ref::<Element>()
            .map_or(0.0, |e| px(e.scroll_top()))
    }

    fn set_scroll_top(&mut self, node: &Node, value: f64) {
        if let Some(element) = node.dyn_ref::<Element>()
            && value.is_finite()
        {
            #[allow(clippy::cast_possible_truncation)]
            element.set_scroll_top(value.round().clamp(0.0, f64::from(i32::MAX)) as i32);
        }
    }

    fn client_height(&self, node: &Node) -> f64 {
        node.dyn_ref::<Element>()
            .map_or(0.0, |e| px(e.client_height()))
    }

    fn scroll_height(&self, node: &Node) -> f64 {
        node.dyn_ref::<Element>()
            .map_or(0.0, |e| px(e.scroll_height()))
    }

    fn scroll_into_view_end(&mut self, node: &Node) {
        if let Some(element) = node.dyn_ref::<Element>() {
            let options = ScrollIntoViewOptions::new();
            options.set_block(ScrollLogicalPosition::End);
            element.scroll_into_view_with_scroll_into_view_options(&options);
        }
    }

    fn subscribe(&mut self, subscription: Subscription<Node>) -> Result<(), DomError> {
        if self.bindings.iter().any(|(s, _)| *s == subscription) {
            return Ok(());
        }
        let owner = subscription.owner;
        let binding = match &subscription.kind {
            SubscriptionKind::Scroll(node) => {
                // The root scroller reports scrolls on the document.
                let target: EventTarget = if *node == self.scrolling_element() {
                    self.document.clone().into()
                } else {
                    node.clone().into()
                };
                let scrolled = node.clone();
                self.listen(target, "scroll", owner, move || {
                    HostEvent::Scroll(scrolled.clone())
                })?
            }
            SubscriptionKind::ElementResize(node) => self.observe_resize(owner, node)?,
            SubscriptionKind::WindowResize => {
                self.listen(self.window.clone().into(), "resize", owner, || {
                    HostEvent::Resize
                })?
            }
            SubscriptionKind::Mutations => self.observe_mutations(owner)?,
        };
        self.bindings.push((subscription, binding));
        Ok(())
    }

    fn unsubscribe(&mut self, subscription: &Subscription<Node>) {
        let Some(at) = self.bindings.iter().position(|(s, _)| s == subscription) else {
            return;
        };
        let (_, binding) = self.bindings.remove(at);
        binding.release();
        let remaining: Vec<Subscription<Node>> =
            self.bindings.iter().map(|(s, _)| s.clone()).collect();
        self.inbox.borrow_mut().forget(subscription, &remaining);
    }
}
