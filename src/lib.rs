//! Authenticated HTTP client core for the Joyful music-streaming API.
//!
//! Every request goes through the [`client::Client`] pipeline, which adds the
//! bearer token, device identity headers and an HMAC request signature. The
//! client refreshes expired tokens with a single exchange shared between
//! concurrent requests, and logs the session out when the server rejects it
//! beyond repair.
//!
//! # Modules
//!
//! * [`client`] - the request pipeline
//! * [`auth`] - login, registration and logout endpoints
//! * [`credentials`] and [`storage`] - persisted session state
//! * [`signer`] - request signatures
//! * [`refresh`] - single-flight token refresh
//! * [`session`] - forced logout on unrecoverable codes
//! * [`device`], [`notify`] and [`events`] - collaborators of the shell
//! * [`config`], [`error`] and [`http`] - plumbing
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]

#[macro_use]
extern crate log;

pub mod auth;
pub mod client;
pub mod config;
pub mod credentials;
pub mod device;
pub mod error;
pub mod events;
pub mod http;
pub mod notify;
pub mod protocol;
pub mod refresh;
pub mod request;
pub mod session;
pub mod signer;
pub mod storage;
pub mod util;
