//! Container daemon client.
//!
//! Speaks the daemon's HTTP protocol directly over its unix socket with
//! hand-framed requests and first-class parsers for the two streaming
//! formats: NDJSON build progress and the 8-byte-header multiplexed exec
//! frames.
//!
//! | Module   | Responsibility                                          |
//! |----------|---------------------------------------------------------|
//! | `socket` | Socket discovery (env override, context, runtime, system) |
//! | `http`   | Request framing, response heads, chunked bodies         |
//! | `tar`    | Single-entry build context archive                      |
//! | `ndjson` | Build progress stream parsing                           |
//! | `mux`    | Multiplexed stdout/stderr frame decoding                |
//! | `client` | The five daemon operations                              |

pub mod client;
pub mod http;
pub mod mux;
pub mod ndjson;
pub mod socket;
pub mod tar;
#[cfg(test)]
pub(crate) mod testutil;

pub use client::{ContainerSpec, ContainerState, DaemonClient, ExecSpec, HostConfig};
