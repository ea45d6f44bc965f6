//! Resbroker control core
//!
//! This crate provides the broker's control plane:
//! - Manager: the top-level tick loop and ticket-to-resource matching
//! - PoolController: per-pool allocation, release, removal, and cleanup
//! - Workers: single-shot tasks driving one resource transition each
//! - HookRunner: shell hooks under the RESALLOC_* environment contract
//! - Watcher: periodic liveness checks feeding the failure counters
//! - Synchronizer: the coalescing wake-up event and waiter notification

pub mod hooks;
pub mod manager;
pub mod pool;
pub mod sync;
pub mod watcher;
pub mod workers;

pub use hooks::{Capture, HookEnv, HookOutput, HookRunner, LogKind};
pub use manager::{submit_ticket, Manager};
pub use pool::PoolController;
pub use sync::Synchronizer;
pub use watcher::Watcher;
pub use workers::{AllocWorker, CleanUnknownWorker, ReleaseWorker, TerminateWorker, WorkerContext};

pub use rb_common::Result;
