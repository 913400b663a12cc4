//! Distributed locking backed by a Redis-compatible store.
//!
//! Provides the lease protocol ([`locks`]), the per-task record of held
//! tokens ([`ownership`]), the store abstraction it runs on ([`store`]) with
//! a pooled Redis implementation ([`redis`]) and an in-process one
//! ([`memory`]).

pub mod locks;
pub mod memory;
pub mod ownership;
pub mod redis;
pub mod store;
