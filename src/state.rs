//! Shared-state helpers for the kernel.
//!
//! The device registry, scheduler config and aggregator are mutated from the
//! scheduling loop, from completing poll tasks and from HTTP handlers, so
//! they live behind `parking_lot` mutexes shared via `Arc`.

use parking_lot::Mutex;
use std::sync::Arc;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}
