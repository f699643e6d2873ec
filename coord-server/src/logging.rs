// SPDX-License-Identifier: Apache-2.0

use tracing_subscriber::EnvFilter;

/// Installs a `tracing-subscriber` `fmt` layer with an `EnvFilter`
/// (`RUST_LOG`, defaulting to `info`), matching the teacher workspace's
/// logging init (SPEC_FULL.md §2 "Observability").
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
