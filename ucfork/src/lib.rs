/*!
Welcome to `ucfork`

A guest execution session for userspace emulated foreign binaries, built to be fuzzed:

- [`loader`] turns an executable image into a memory layout,
- [`personality`] translates syscall structures between guest and host ABIs,
- [`context`] snapshots and restores a whole guest,
- [`forkserver`] speaks the AFL forkserver protocol on top of those snapshots, with
  [`coverage`] recording edges into the fuzzer's shared map.

The CPU itself is emulated elsewhere, behind the [`emu::Emulator`] trait.
*/
#![deny(rustdoc::broken_intra_doc_links)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(
    clippy::unreadable_literal,
    clippy::missing_errors_doc,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::similar_names
)]
#![cfg_attr(not(test), warn(
    missing_debug_implementations,
    missing_docs,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
))]

pub mod config;
pub mod context;
pub mod coverage;
pub mod emu;
pub mod forkserver;
pub mod loader;
pub mod personality;

pub use ucfork_bolts::Error;
