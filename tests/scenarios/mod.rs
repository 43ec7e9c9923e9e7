//! Scenario-based tests for ovfbuild

mod builder_run;
mod config_resolution;
mod runner_semantics;
