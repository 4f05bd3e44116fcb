// Copyright (c) Surge Language Project
// SPDX-License-Identifier: Apache-2.0

//! Reference tree-walking interpreter for the Surge mid-level IR.
//!
//! A host embeds this crate by building a [`module::Module`], an
//! implementation of [`runtime::Runtime`], and a [`vm::VmConfig`], then
//! calling [`vm::Vm::run`]. See `DESIGN.md` for how each module here
//! maps onto the reference semantics, and `tests/` for end-to-end
//! scenarios exercising the startup contract, panics, and determinism.

pub mod arith;
pub mod async_exec;
pub mod bignum;
pub mod collections;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod heap;
pub mod layout;
pub mod metrics;
pub mod module;
pub mod place;
pub mod replay;
pub mod runtime;
pub mod tagunion;
pub mod value;
pub mod vm;
