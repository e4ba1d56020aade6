#![forbid(unsafe_code)]

//! Core: turn discovery and DOM virtualization for hosted chat pages.
//!
//! # Role in chatvirt
//! `chatvirt-core` owns every decision the injected script makes. It knows
//! nothing about `web-sys`; the browser side (`chatvirt-web`) implements
//! [`dom::DocumentHost`] over real nodes and forwards observer callbacks,
//! timers, and animation frames into a [`page::Page`].
//!
//! # Primary responsibilities
//! - **Selector discovery**: find a CSS selector that matches conversation
//!   turns, wait for them to appear, re-run on navigation.
//! - **Virtualizer**: swap off-screen turns for fixed-height placeholders and
//!   mount them back as they approach the viewport, in time-sliced batches.
//! - **Loading overlay**: a spinner during navigation and slow requests,
//!   and a short-lived notice toast.
//! - **Headless document**: an in-memory tree with deterministic layout so
//!   every pass can be exercised without a browser.
//!
//! # How it fits in the system
//! The host drives one [`page::Page`] per document. All time is supplied by
//! the host as monotonic milliseconds, so the same code runs under
//! `requestAnimationFrame` in the browser and under
//! [`harness::HeadlessSession`] in tests.

pub mod config;
pub mod controller;
pub mod diagnostics;
pub mod discovery;
pub mod dom;
pub mod harness;
pub mod headless;
pub mod inbox;
pub mod item;
pub mod overlay;
pub mod page;
pub mod scheduler;
pub mod selector;
pub mod shared;

pub use config::{ChatvirtConfig, ConfigError, DiscoveryConfig, OverlayConfig, VirtualizerConfig};
pub use controller::{InstallOutcome, Virtualizer, VirtualizerStats};
pub use page::Page;
pub use shared::SharedSelector;
