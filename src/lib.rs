/*
 * SPDX-FileCopyrightText: 2025 Inria
 * SPDX-FileCopyrightText: 2025 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

#![doc = include_str!("../README.md")]
#![deny(unstable_features)]
#![deny(trivial_casts)]
#![deny(unconditional_recursion)]
#![deny(clippy::empty_loop)]
#![deny(unreachable_code)]
#![deny(unreachable_patterns)]
#![deny(unused_macro_rules)]
#![deny(unused_doc_comments)]
#![allow(clippy::type_complexity)]

pub mod chunk_map;
pub mod engine;
pub mod job;
pub mod params;
pub mod partition;
pub mod phase_zero;
pub mod record;
pub mod runtime;
pub mod workers;
pub mod writer;

/// Prelude module to import everything from this crate
pub mod prelude {
    pub use crate::chunk_map::*;
    pub use crate::engine::*;
    pub use crate::job::*;
    pub use crate::params::*;
    pub use crate::partition::*;
    pub use crate::phase_zero::*;
    pub use crate::record::*;
    pub use crate::runtime::*;
    pub use crate::workers::*;
    pub use crate::writer::*;
}
