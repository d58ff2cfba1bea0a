//! proxywrap: run a command-line tool behind a local intercepting proxy
//!
//! This crate launches an unmodified tool as a child process whose HTTP(S)
//! traffic is forced through a loopback MITM proxy. The proxy terminates TLS
//! with per-host certificates signed by a persisted interception root, and
//! can reach the network through an authenticated corporate proxy.
//!
//! # Architecture
//!
//! - **CA**: persisted root plus single-flight leaf issuance
//! - **Proxy**: hyper-based CONNECT interception and plain HTTP forwarding
//! - **Auth**: `407` challenge handling for the upstream proxy (Negotiate, Basic)
//! - **Child**: environment construction, signal forwarding, exit translation
//! - **Orchestrator**: ties a run together and guarantees proxy cleanup
//! - **Config**: hierarchical TOML configuration
//! - **Telemetry**: structured syslog audit events

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod auth;
pub mod ca;
pub mod child;
pub mod cli;
pub mod config;
pub mod orchestrator;
pub mod proxy;
pub mod telemetry;
