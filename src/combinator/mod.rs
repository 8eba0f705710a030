// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Fan-in (`any_of`) and fan-out (`all_of`) combinators: composite awaiters
//! that manage a fixed-arity set of child tasks and look, from the parent's
//! perspective, like any other `TaskHandle`.
//!
//! Concrete arities 0, 2 and 3 are provided rather than a generic
//! variadic system; a combinator over `N` children is rare enough in
//! practice that hand-written structs stay simpler than the macro
//! machinery a fully generic version would need. Both combinators forward
//! `request_cancel` to every child exactly like a plain task forwards it.

mod all_of;
mod any_of;

pub use all_of::{all_of0, all_of2, all_of3, AllOf2, AllOf3};
pub use any_of::{any_of2, any_of3, AnyOf2, AnyOf3};

/// Tagged union over two child result types, used as `any_of`'s output when
/// it has two children. A unit variant (`Left(())`/`Right(())`) represents
/// a void child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Either2<A, B> {
    Left(A),
    Right(B),
}

/// Tagged union over three child result types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Either3<A, B, C> {
    First(A),
    Second(B),
    Third(C),
}
