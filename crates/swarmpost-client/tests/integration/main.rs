//! Integration test entry point for swarmpost-client.
//!
//! Run with: cargo test -p swarmpost-client --test integration

mod harness;
mod dispatcher;
mod poller;
mod swarm_directory;
