#![allow(dead_code)]
//! Small, self-contained data structures used across the project.

pub mod arena;
pub mod ready_queue;

pub use arena::{Handle, SlotArena};
pub use ready_queue::{ReadyQueue, ReadySlot, UNQUEUED};
