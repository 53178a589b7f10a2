//! Core query-path engine of the DNS load balancer: wire codec, packet
//! cache, rate limiter, rule set, upstream registry, selection policies,
//! session tracker and the pipeline that drives a query through all of
//! them (spec.md §2).
//!
//! The control-plane console, its command REPL, and the secondary
//! diagnostic utilities the original ships alongside the balancer are out
//! of scope (spec.md §1); this crate exposes the configuration snapshot it
//! consumes and the counters/registry it exposes for that collaborator to
//! read, but does not implement the collaborator itself.
pub mod cache;
pub mod config;
pub mod error;
pub mod macros;
pub mod pipeline;
pub mod policy;
pub mod ratelimit;
pub mod rules;
pub mod session;
pub mod stats;
pub mod upstream;
pub mod util;
pub mod wire;
