//! Consolidated integration tests for appguard-core.
//!
//! One test binary keeps the proptest suites from running in parallel
//! with each other. See:
//! https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html

mod lifecycle;
mod properties;
mod scenarios;
mod support;
