// Copyright (c) Surge Language Project
// SPDX-License-Identifier: Apache-2.0

//! A `monitored_scope`-style span helper for the hot dispatch and
//! executor poll loops. The teacher wraps these in
//! `mysten_metrics::monitored_scope`, which records span duration into
//! a Prometheus histogram; we don't carry a metrics crate as a
//! dependency (see DESIGN.md), so `scope` is just `tracing::span!`
//! wearing the same call shape, giving the same entry/exit visibility
//! in a trace subscriber without the extra dependency.

use tracing::span::EnteredSpan;

/// Enter a debug-level span named `name` for the lifetime of the
/// returned guard, the way `let _scope = monitored_scope("...")` reads
/// at each call site in the teacher.
pub fn scope(name: &'static str) -> EnteredSpan {
    tracing::debug_span!("scope", name).entered()
}
