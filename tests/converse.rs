//! End-to-end conversation scenarios against a stubbed Soul.

#[path = "support/mod.rs"]
mod support;

#[path = "converse/scenarios_test.rs"]
mod scenarios_test;
#[path = "converse/eviction_test.rs"]
mod eviction_test;
