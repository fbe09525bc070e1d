//! ezoidc exchanges OIDC identity tokens for policy-controlled variables.
//!
//! A workload presents a signed identity token; the server validates it
//! against the configured issuers, evaluates the policy to decide which
//! variables the caller may read, resolves their values through pluggable
//! providers, and returns the shaped variable set.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

pub mod config;
pub mod engine;
pub mod errors;
pub mod models;
pub mod providers;
pub mod server;

pub use config::{Configuration, Issuer};
pub use engine::{Engine, ReadRequest, ReadResponse};
pub use server::{app, serve};
