//! Shared primitives for the pull-through cache coordination engine.
//!
//! This crate holds the parts that are pure data/algorithm and carry no
//! server-process state: hashing, streaming/chunking helpers, signing, and
//! the error type they share.

#![deny(
    asm_sub_register,
    deprecated,
    missing_abi,
    unsafe_code,
    unused_macros,
    unused_must_use,
    unused_unsafe
)]
#![deny(clippy::from_over_into, clippy::needless_question_mark)]
#![cfg_attr(
    not(debug_assertions),
    deny(unused_imports, unused_mut, unused_variables,)
)]

#[cfg(feature = "chunking")]
pub mod chunking;
pub mod error;
pub mod hash;
#[cfg(feature = "tokio")]
pub mod io;
pub mod mime;
pub mod signing;
pub mod testing;
#[cfg(feature = "tokio")]
pub mod util;

pub use error::{CoreError, CoreResult};
