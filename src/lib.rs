//! Vigil Core Library
//!
//! Crash-containment core for a test harness: each test can run in a
//! separate OS process so a segfault, abort or hard exit in the body
//! fails that one test instead of the whole run. The binary entry
//! point in main.rs drives the built-in crash scenarios.

pub mod codec;
pub mod collector;
pub mod config;
pub mod factory;
pub mod relay;
pub mod runner;

#[cfg(unix)]
pub mod capture;
#[cfg(unix)]
pub mod channel;
#[cfg(unix)]
pub mod forkexec;
#[cfg(unix)]
pub mod spawn;

#[cfg(windows)]
pub mod spawn_windows;

#[cfg(target_os = "nto")]
pub mod directspawn;
