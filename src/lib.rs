//! Sandboxed execution of untrusted script snippets submitted through a
//! chat front end. See [`sandbox::Sandbox`].

pub mod config;
pub mod sandbox;
