#![forbid(unsafe_code)]

//! Browser frontend for chatvirt.
//!
//! This crate binds [`chatvirt_core::page::Page`] to the live DOM:
//! `WebDocument` implements the core `DocumentHost` trait over `web_sys`
//! nodes, and `boot()` wires observers, timers, animation frames, and history
//! hooks, then publishes the control handle on `window.virtualizer`.
//!
//! ```js
//! import init, { boot } from "./chatvirt_web.js";
//! await init();
//! const v = boot(JSON.stringify({ runId: "tab-1" }));
//! v.stats(); // { total, mounted, totalHeight }
//! ```
//!
//! Option parsing and the console tracing layer are target-independent and
//! tested natively.

pub mod console;
pub mod options;

#[cfg(target_arch = "wasm32")]
mod host;
#[cfg(target_arch = "wasm32")]
mod wasm;

#[cfg(target_arch = "wasm32")]
pub use host::WebDocument;
#[cfg(target_arch = "wasm32")]
pub use wasm::{VirtualizerHandle, boot};

pub use options::HostOptions;
