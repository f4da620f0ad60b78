//! Integration test suite for foreman.
//!
//! These tests exercise the engine end to end with fake collaborators:
//! scheduling correctness, supervision and recovery, snapshot durability,
//! and full sprint-loop runs. No external processes are spawned, so the
//! suite is safe for CI.
//!
//! # Test Categories
//!
//! - `scheduling`: dependency order, capacity, continuous dispatch
//! - `recovery`: reaper kills, resurrection context, thrashing
//! - `persistence`: snapshot round-trips and resume
//! - `sprint_e2e`: full plan-execute-evaluate-iterate runs

mod fixtures;

mod persistence;
mod recovery;
mod scheduling;
