#![forbid(unsafe_code)]

//! `wasm-bindgen` exports and the browser event loop.
//!
//! The [`Page`] is host-driven: this module feeds it observer notifications,
//! fires its timers through `setTimeout`, and runs its frame work under
//! `requestAnimationFrame`. History, unload and `fetch` hooks drive the
//! loading overlay. Only compiled on `wasm32` targets.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use chatvirt_core::controller::InstallOutcome;
use chatvirt_core::page::Page;
use chatvirt_core::shared::{SelectorSubscription, SharedSelector};
use js_sys::{Array, Function, Object, Reflect};
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use wasm_bindgen::JsCast;
use wasm_bindgen::prelude::*;
use web_sys::{Document, Event, Node, Window};
use web_time::Instant;

use crate::console::ConsoleLayer;
use crate::host::{Wake, WebDocument};
use crate::options::HostOptions;

fn console_error(msg: &str) {
    web_sys::console::error_1(&JsValue::from_str(msg));
}

fn install_panic_hook() {
    use std::sync::Once;

    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        std::panic::set_hook(Box::new(|info| {
            let msg = if let Some(loc) = info.location() {
                format!(
                    "panic at {}:{}:{}: {info}",
                    loc.file(),
                    loc.line(),
                    loc.column()
                )
            } else {
                format!("panic: {info}")
            };
            console_error(&msg);
        }));
    });
}

fn write_console(level: Level, line: &str) {
    let line = JsValue::from_str(line);
    if level == Level::ERROR {
        web_sys::console::error_1(&line);
    } else {
        web_sys::console::warn_1(&line);
    }
}

/// Forward warnings and errors to the console unless the embedder already
/// installed a global subscriber.
fn install_console_tracing() {
    let subscriber =
        tracing_subscriber::registry().with(ConsoleLayer::new(Level::WARN, write_console));
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::debug!("global subscriber already set; console layer skipped");
    }
}

#[wasm_bindgen(start)]
pub fn wasm_start() {
    install_panic_hook();
    install_console_tracing();
}

type Shared = Rc<RefCell<Runtime>>;

struct Runtime {
    me: Weak<RefCell<Runtime>>,
    window: Window,
    doc: WebDocument,
    page: Page<Node>,
    epoch: Instant,
    run_id: String,
    /// Earliest armed `setTimeout`, in page milliseconds.
    timer_due: Option<u64>,
    frame_armed: bool,
    _selector_mirror: Option<SelectorSubscription>,
}

impl Runtime {
    fn create(window: Window, document: Document, options: HostOptions) -> Shared {
        let selector = seed_selector(&window, &options.selector_global);
        let mirror = (!options.selector_global.is_empty()).then(|| {
            let target = window.clone();
            let key = JsValue::from_str(&options.selector_global);
            selector.subscribe(move |value| {
                let value = value.map_or(JsValue::UNDEFINED, JsValue::from_str);
                let _ = Reflect::set(&target, &key, &value);
            })
        });
        Rc::new_cyclic(|me: &Weak<RefCell<Runtime>>| {
            let wake = waker(window.clone(), me.clone());
            RefCell::new(Self {
                me: me.clone(),
                doc: WebDocument::new(window.clone(), document, wake),
                page: Page::with_selector(options.config, selector),
                window,
                epoch: Instant::now(),
                run_id: options.run_id,
                timer_due: None,
                frame_armed: false,
                _selector_mirror: mirror,
            })
        })
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn start(&mut self) {
        let now = self.now_ms();
        let outcome = self.page.start(&mut self.doc, now);
        tracing::debug!(outcome = ?outcome.map(InstallOutcome::as_str), "loader started");
        self.turn();
    }

    /// Deliver notifications, run due timers, and re-arm.
    fn turn(&mut self) {
        let now = self.now_ms();
        loop {
            let events = self.doc.take_events();
            if events.is_empty() {
                break;
            }
            for (owner, event) in events {
                self.page.dispatch(&mut self.doc, owner, event, now);
            }
        }
        self.page.run_due_timers(&mut self.doc, now);
        self.arm(now);
    }

    fn arm(&mut self, now: u64) {
        if self.page.wants_frame() && !self.frame_armed {
            let me = self.me.clone();
            let callback = Closure::once_into_js(move |_ts: f64| on_frame(&me));
            match self
                .window
                .request_animation_frame(callback.unchecked_ref())
            {
                Ok(_) => self.frame_armed = true,
                Err(_) => console_error("[virtualizer] requestAnimationFrame failed"),
            }
        }
        let Some(due) = self.page.next_deadline() else {
            return;
        };
        if self.timer_due.is_some_and(|armed| armed <= due) {
            return;
        }
        let delay = i32::try_from(due.saturating_sub(now)).unwrap_or(i32::MAX);
        let me = self.me.clone();
        let callback = Closure::once_into_js(move || on_timer(&me, due));
        match self
            .window
            .set_timeout_with_callback_and_timeout_and_arguments_0(callback.unchecked_ref(), delay)
        {
            Ok(_) => self.timer_due = Some(due),
            Err(_) => console_error("[virtualizer] setTimeout failed"),
        }
    }
}

/// Initial selector: the window property when another script set one.
fn seed_selector(window: &Window, key: &str) -> SharedSelector {
    if key.is_empty() {
        return SharedSelector::default();
    }
    let seeded = Reflect::get(window, &JsValue::from_str(key))
        .ok()
        .and_then(|v| v.as_string())
        .filter(|s| !s.trim().is_empty());
    SharedSelector::new(seeded)
}

/// Coalesced "run a turn soon" hook handed to observers.
fn waker(window: Window, me: Weak<RefCell<Runtime>>) -> Wake {
    let pending = Rc::new(Cell::new(false));
    Rc::new(move || {
        if pending.replace(true) {
            return;
        }
        let me = me.clone();
        let pending = Rc::clone(&pending);
        let callback = Closure::once_into_js(move || {
            pending.set(false);
            with_runtime(&me, Runtime::turn);
        });
        if window
            .set_timeout_with_callback_and_timeout_and_arguments_0(callback.unchecked_ref(), 0)
            .is_err()
        {
            console_error("[virtualizer] setTimeout failed");
        }
    })
}

fn with_runtime(me: &Weak<RefCell<Runtime>>, f: impl FnOnce(&mut Runtime)) -> bool {
    let Some(shared) = me.upgrade() else {
        return false;
    };
    let Ok(mut runtime) = shared.try_borrow_mut() else {
        tracing::trace!("runtime busy; callback dropped");
        return false;
    };
    f(&mut runtime);
    true
}

fn on_timer(me: &Weak<RefCell<Runtime>>, due: u64) {
    with_runtime(me, |rt| {
        if rt.timer_due == Some(due) {
            rt.timer_due = None;
        }
        rt.turn();
    });
}

fn on_frame(me: &Weak<RefCell<Runtime>>) {
    with_runtime(me, |rt| {
        rt.frame_armed = false;
        let now = rt.now_ms();
        rt.page.run_frame(&mut rt.doc, now);
        rt.turn();
    });
}

fn on_navigation(me: &Weak<RefCell<Runtime>>) {
    let ran = with_runtime(me, |rt| {
        let now = rt.now_ms();
        rt.page.on_navigation(&mut rt.doc, now);
        rt.turn();
    });
    if !ran {
        tracing::debug!("navigation during a runtime turn; discovery not re-run");
    }
}

/// Wrap `history.pushState`/`replaceState` and listen for `popstate`.
fn hook_navigation(window: &Window, me: &Weak<RefCell<Runtime>>) -> Result<(), JsValue> {
    let history = window.history()?;
    for name in ["pushState", "replaceState"] {
        let original: Function = Reflect::get(&history, &JsValue::from_str(name))?.dyn_into()?;
        let target = history.clone();
        let me = me.clone();
        let wrapper = Closure::<dyn FnMut(JsValue, JsValue, JsValue) -> Result<JsValue, JsValue>>::new(
            move |state: JsValue, title: JsValue, url: JsValue| {
                let result = original.call3(&target, &state, &title, &url);
                on_navigation(&me);
                result
            },
        );
        Reflect::set(&history, &JsValue::from_str(name), wrapper.as_ref())?;
        wrapper.forget();
    }
    let me = me.clone();
    let popstate = Closure::<dyn FnMut(Event)>::new(move |_event: Event| on_navigation(&me));
    window.add_event_listener_with_callback("popstate", popstate.as_ref().unchecked_ref())?;
    popstate.forget();
    let me = me.clone();
    let unload = Closure::<dyn FnMut(Event)>::new(move |_event: Event| {
        with_runtime(&me, |rt| rt.page.show_loading(&mut rt.doc));
    });
    window.add_event_listener_with_callback("beforeunload", unload.as_ref().unchecked_ref())?;
    unload.forget();
    Ok(())
}

fn request_started(me: &Weak<RefCell<Runtime>>) {
    with_runtime(me, |rt| {
        let now = rt.now_ms();
        rt.page.request_started(now);
        rt.arm(now);
    });
}

fn request_finished(me: &Weak<RefCell<Runtime>>) {
    with_runtime(me, |rt| {
        rt.page.request_finished(&mut rt.doc);
        let now = rt.now_ms();
        rt.arm(now);
    });
}

/// Wrap `window.fetch` so the overlay sees requests start and settle.
fn hook_requests(window: &Window, me: &Weak<RefCell<Runtime>>) -> Result<(), JsValue> {
    let key = JsValue::from_str("fetch");
    let original: Function = Reflect::get(window, &key)?.dyn_into()?;
    let target = window.clone();
    let me = me.clone();
    let wrapper = Closure::<dyn FnMut(JsValue, JsValue) -> Result<JsValue, JsValue>>::new(
        move |input: JsValue, init: JsValue| {
            request_started(&me);
            let promise = match original.call2(&target, &input, &init) {
                Ok(promise) => promise,
                Err(err) => {
                    request_finished(&me);
                    return Err(err);
                }
            };
            let finally = Reflect::get(&promise, &JsValue::from_str("finally"))
                .ok()
                .and_then(|f| f.dyn_into::<Function>().ok());
            let Some(finally) = finally else {
                request_finished(&me);
                return Ok(promise);
            };
            let done = {
                let me = me.clone();
                Closure::once_into_js(move || request_finished(&me))
            };
            finally.call1(&promise, &done)
        },
    );
    Reflect::set(window, &key, wrapper.as_ref())?;
    wrapper.forget();
    Ok(())
}

fn error_value(err: impl std::fmt::Display) -> JsValue {
    JsValue::from_str(&err.to_string())
}

fn busy() -> JsValue {
    JsValue::from_str("virtualizer is busy")
}

fn outcome_value(outcome: InstallOutcome) -> JsValue {
    let obj = Object::new();
    let _ = Reflect::set(&obj, &"status".into(), &outcome.as_str().into());
    if let InstallOutcome::Installed { tracked } = outcome {
        let _ = Reflect::set(&obj, &"tracked".into(), &JsValue::from_f64(tracked as f64));
    }
    obj.into()
}

/// Control API stored on `window` (by default `window.virtualizer`).
#[wasm_bindgen]
#[derive(Clone)]
pub struct VirtualizerHandle {
    shared: Shared,
}

#[wasm_bindgen]
impl VirtualizerHandle {
    /// Track current turns; `{ status, tracked? }`.
    pub fn install(&self) -> Result<JsValue, JsValue> {
        let mut rt = self.shared.try_borrow_mut().map_err(|_| busy())?;
        let now = rt.now_ms();
        let rt = &mut *rt;
        let outcome = rt.page.install(&mut rt.doc, now).map_err(error_value)?;
        rt.arm(now);
        Ok(outcome_value(outcome))
    }

    /// Re-install after `disable()`; a no-op while installed.
    pub fn enable(&self) -> Result<JsValue, JsValue> {
        let mut rt = self.shared.try_borrow_mut().map_err(|_| busy())?;
        let now = rt.now_ms();
        let rt = &mut *rt;
        let outcome = rt.page.enable(&mut rt.doc, now).map_err(error_value)?;
        rt.arm(now);
        Ok(outcome_value(outcome))
    }

    /// Restore every turn and stop observing. Returns whether anything was
    /// installed.
    pub fn disable(&self) -> bool {
        let Ok(mut rt) = self.shared.try_borrow_mut() else {
            return false;
        };
        let rt = &mut *rt;
        rt.page.disable(&mut rt.doc)
    }

    /// Force a windowing pass.
    pub fn refresh(&self) -> bool {
        let Ok(mut rt) = self.shared.try_borrow_mut() else {
            return false;
        };
        let now = rt.now_ms();
        let rt = &mut *rt;
        let started = rt.page.refresh(&mut rt.doc, now);
        rt.arm(now);
        started
    }

    /// `{ total, mounted, totalHeight }`.
    pub fn stats(&self) -> Result<JsValue, JsValue> {
        let rt = self.shared.try_borrow().map_err(|_| busy())?;
        let json = serde_json::to_string(&rt.page.stats()).map_err(error_value)?;
        js_sys::JSON::parse(&json)
    }

    /// The selector the loader resolved, if any.
    pub fn selector(&self) -> Option<String> {
        self.shared.try_borrow().ok()?.page.selector().get()
    }

    /// Drain recent pass records as JSONL strings.
    #[wasm_bindgen(js_name = drainPassLog)]
    pub fn drain_pass_log(&self) -> Array {
        let Ok(mut rt) = self.shared.try_borrow_mut() else {
            return Array::new();
        };
        let run_id = rt.run_id.clone();
        rt.page
            .drain_pass_jsonl(&run_id)
            .into_iter()
            .map(|line| JsValue::from_str(&line))
            .collect()
    }

    /// Show `text` in the notice toast for a few seconds.
    pub fn notice(&self, text: &str) {
        let Ok(mut rt) = self.shared.try_borrow_mut() else {
            return;
        };
        let now = rt.now_ms();
        let rt = &mut *rt;
        rt.page.notice(&mut rt.doc, text, now);
        rt.arm(now);
    }

    /// Stop the loader and controller for good.
    pub fn shutdown(&self) {
        if let Ok(mut rt) = self.shared.try_borrow_mut() {
            let rt = &mut *rt;
            rt.page.shutdown(&mut rt.doc);
            rt.doc.release_all();
        }
    }
}

/// Create the runtime, start the loader once the DOM is ready, and expose
/// the control handle. `options` is an optional JSON object.
#[wasm_bindgen]
pub fn boot(options: Option<String>) -> Result<VirtualizerHandle, JsValue> {
    install_panic_hook();
    let options = HostOptions::parse(options.as_deref()).map_err(error_value)?;
    let window = web_sys::window().ok_or_else(|| JsValue::from_str("no window"))?;
    let document = window
        .document()
        .ok_or_else(|| JsValue::from_str("no document"))?;

    let global_name = options.global_name.clone();
    let watch_navigation = options.watch_navigation;
    let watch_requests = options.watch_requests;
    let shared = Runtime::create(window.clone(), document.clone(), options);
    let me = Rc::downgrade(&shared);
    if watch_navigation {
        hook_navigation(&window, &me)?;
    }
    if watch_requests && let Err(err) = hook_requests(&window, &me) {
        tracing::warn!(err = ?err, "fetch not wrapped; request spinner disabled");
    }

    let ready_state = Reflect::get(&document, &JsValue::from_str("readyState"))
        .ok()
        .and_then(|state| state.as_string())
        .unwrap_or_default();
    if ready_state != "complete" {
        with_runtime(&me, |rt| rt.page.show_loading(&mut rt.doc));
        let me = me.clone();
        let loaded = Closure::once_into_js(move |_event: Event| {
            with_runtime(&me, |rt| rt.page.hide_loading(&mut rt.doc));
        });
        window.add_event_listener_with_callback("load", loaded.unchecked_ref())?;
    }
    if ready_state == "loading" {
        let me = me.clone();
        let ready = Closure::once_into_js(move |_event: Event| {
            with_runtime(&me, Runtime::start);
        });
        document.add_event_listener_with_callback("DOMContentLoaded", ready.unchecked_ref())?;
    } else {
        with_runtime(&me, Runtime::start);
    }

    let handle = VirtualizerHandle { shared };
    if !global_name.is_empty() {
        Reflect::set(
            &window,
            &JsValue::from_str(&global_name),
            &JsValue::from(handle.clone()),
        )?;
    }
    Ok(handle)
}
