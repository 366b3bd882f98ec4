#![doc = include_str!("../docs/rustdoc.md")]

/// Grid/view request-response operations.
pub mod api;
/// Start/end bracketing of streamed cell deltas.
pub mod batch;
/// Publish/subscribe message bus.
pub mod bus;
/// Command-line argument definitions.
pub mod cli;
/// Copy-to-clipboard over a bypass Data instance.
pub mod clipboard;
/// Runtime configuration model.
pub mod config;
/// Consumer-side grid state and visible-window viewports.
pub mod consumer;
/// Data instances: the actor that drives one session.
pub mod data;
/// Error types used across the crate.
pub mod error;
/// Named-event fan-out used by every stateful component.
pub mod events;
/// Clipboard and terminal output formatters.
pub mod formatter;
/// Metrics counters and the Prometheus exporter.
pub mod monitoring;
/// Reference-counted sharing of upstream subscriptions.
pub mod pool;
/// Bus topics and payloads.
pub mod protocol;
/// Pixel-to-cell selection and drag auto-scroll.
pub mod selection;
/// Negotiation state machine.
pub mod session;
/// In-process simulated analytics server.
pub mod sim;
/// Tracing/logging initialization.
pub mod tracing_setup;
/// Shared data model.
pub mod types;
/// UI controller and presentation loop.
pub mod ui;
/// Viewport subscription bookkeeping.
pub mod viewport;

/// Primary crate error type.
pub use error::SyncError;
