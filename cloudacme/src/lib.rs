//! cloudacme
//!
//! Issues ACME certificates for Application Load Balancer listeners using
//! HTTP-01 challenges answered by temporary listener rules, and rotates them
//! in place in the certificate store.

pub mod account;
pub mod acme;
pub mod alb;
pub mod certs;
pub mod cli;
pub mod config;
pub mod context;
pub mod defaults;
pub mod poll;
pub mod probe;
pub mod rotation;
pub mod router;
pub mod solver;

#[cfg(test)]
mod testing;
