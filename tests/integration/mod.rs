//! Integration test suite for autopilot.
//!
//! These tests drive whole workflows through the public API: graph
//! construction, routing, supervised dispatch, retries and the failsafe
//! paths that halt a workflow.
//!
//! # Test Categories
//!
//! - `workflow_e2e`: Full workflow execution tests
//! - `parallel_agents`: Wave sizing and worker assignment
//! - `recovery`: Retries, breakers, failsafe escalation and stalls
//! - `failsafe_defaults`: Whole workflows at the shipped failsafe thresholds
//!
//! Worker calls are scripted closures; nothing leaves the process.

mod fixtures;

mod failsafe_defaults;
mod parallel_agents;
mod recovery;
mod workflow_e2e;
