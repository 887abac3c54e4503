//! nblog daemon - watches live Jupyter kernels and logs their activity.
//!
//! - `discovery` - runtime-directory scanning and the reconcile loop
//! - `session` - per-kernel monitor owning three channel pollers
//! - `poller` - per-channel receive loop feeding the sink
//! - `registry` - actor mapping session ids to running monitors
//! - `sink` - single-writer JSONL execution log
//! - `config` - TOML / environment configuration
//! - `launcher` - optional `jupyter notebook` child process
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          nblogd                              │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌───────────────┐  register/prune  ┌────────────────────┐   │
//! │  │ DiscoveryLoop │─────────────────▶│   RegistryActor    │   │
//! │  └───────┬───────┘                  └────────────────────┘   │
//! │          │ spawns                                            │
//! │          ▼                                                   │
//! │  ┌───────────────┐  iopub / shell / stdin                    │
//! │  │SessionMonitor │──────────┬──────────┬──────────┐          │
//! │  └───────────────┘          ▼          ▼          ▼          │
//! │                       ChannelPoller ×3 per kernel            │
//! │                             │ LogRecord (mpsc)               │
//! │                             ▼                                │
//! │                  ┌─────────────────────┐                     │
//! │                  │ LogSink (one writer)│──▶ execution log    │
//! │                  └─────────────────────┘                     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! One root `CancellationToken` is cancelled on shutdown; every monitor
//! holds a child of it and every poller a child of its monitor's.
//!
//! # Panic-Free Guarantees
//!
//! Production code in this crate does not `.unwrap()`, `.expect()` or
//! `panic!()`. Fallible operations return `Result` or `Option` and
//! channel closure is handled as a normal exit.

pub mod config;
pub mod discovery;
pub mod launcher;
pub mod poller;
pub mod registry;
pub mod session;
pub mod sink;
