//! Bootstrap, authenticate, and keep alive agent connections.
//!
//! This crate implements both ends of the connection hardening protocol spoken between an
//! endpoint agent and its server. It is transport agnostic: handshakes run over any
//! [transport::Transport] that carries one message per call.
//!
//! # Overview
//!
//! - [validator::Validator::on_init_connect] and [agent::Agent::on_init_connect]: an agent
//!   without credentials proves it runs an approved binary, waits for an operator to approve
//!   it, and receives a long-term certificate signed by the [pki::CertificateAuthority].
//! - [validator::Validator::on_connect] and [agent::Agent::on_connect]: every live connection
//!   authenticates with a session [token], answers a [challenge] keyed by the binary hash
//!   listed in the [abh] directory, and switches to fresh tunnel key material.
//! - [ping]: once connected, the server pings and the agent answers. Either side closes the
//!   connection when traffic stops.
//!
//! Binary hashes ([abh]) and secret blobs ([sbh]) are served from memory by caches refreshed
//! in the background, so no handshake step performs storage I/O on the hot path.
//!
//! # Errors
//!
//! Every failure is an [Error]. Errors leaving a handshake are annotated with the [Phase] that
//! produced them, and [Error::requires_init_connection] tells an agent whether it must
//! bootstrap again before reconnecting.

pub mod abh;
pub mod agent;
pub mod approver;
pub mod challenge;
mod error;
pub use error::{Error, Phase, PhaseExt};
pub mod mocks;
pub mod ping;
pub mod pki;
pub mod sbh;
pub mod token;
pub mod transport;
pub mod validator;
pub mod wire;
