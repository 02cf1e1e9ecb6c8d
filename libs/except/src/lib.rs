// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A deterministic, heap-free implementation of the C++ exception runtime.
//!
//! Exceptions live in a fixed number of statically allocated slots (see [`config`]), raising one
//! walks the stack with the [`unwind`] crate and every failure ends in a single abort hook with a
//! [`TerminationCause`].
//!
//! # Usage
//!
//! Link the program with `-Wl,--wrap=<symbol>` for every entry of [`WRAPPED_SYMBOLS`] and install
//! an abort hook early during startup:
//!
//! ```rust,no_run
//! extern "C" fn on_abort(cause: except::TerminationCause) {
//!     log::error!("C++ runtime gave up: {cause}");
//! }
//!
//! except::set_abort_hook(Some(on_abort));
//! ```
//!
//! Hosted targets additionally have to register their `.eh_frame` section with
//! `unwind::register_eh_frame`, bare metal targets provide the `__eh_frame_start` and
//! `__eh_frame_end` (or `__exidx_start` and `__exidx_end` on ARM) linker symbols.

#![cfg_attr(not(test), no_std)]

#[cfg(not(loom))]
mod abi;
pub mod config;
mod header;
mod loom;
mod registry;
mod rtti;
mod runtime;
mod search;
mod termination;
#[cfg(test)]
mod testing;

#[cfg(not(loom))]
pub use abi::{
    WRAPPED_SYMBOLS, exceptions_in_flight, set_abort_hook, set_terminate_handler,
    set_unexpected_handler,
};
pub use registry::RegistryError;
pub use termination::{AbortHook, Handler, PolicyState, TerminationCause};
