//! Tollgate — an authenticating reverse proxy.
//!
//! Requests are dispatched to configured backends by host/path matching.
//! Backends that require payment are gated behind L402 capability tokens:
//! unauthenticated clients receive a 402 challenge carrying an invoice and
//! an unpaid token, and redeem both once the invoice settles. Token
//! mechanics live in the [`l402`] crate; this crate provides the server:
//!
//! - [`config`] — YAML configuration and validation
//! - [`challenger`] — invoice issuance and the settlement subscription
//! - [`node`] — REST client for the backing payment node
//! - [`services`] — backend services, snapshots, the hot-swap registry
//! - [`auth`] — the request authenticator and 402 challenges
//! - [`proxy`] — dispatch, reverse-proxy forwarding, local services
//! - [`metrics`] / [`cors`] — operational trimmings

pub mod auth;
pub mod challenger;
pub mod config;
pub mod cors;
pub mod error;
pub mod metrics;
pub mod node;
pub mod proxy;
pub mod services;
pub mod state;
