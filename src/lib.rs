//! A pure TLS 1.2 / 1.3 protocol engine.
//!
//! The engine drives the record layer and handshake state machines over any
//! async byte stream. Cryptographic primitives, X.509 parsing and chain
//! validation, and session cache storage are injected through the interfaces
//! in [provider] and [session]; the engine itself owns no crypto.

#[macro_use]
extern crate arrayref;

#[macro_use]
mod macros;

pub mod alert;
pub mod application_stream;
mod cipher;
pub mod cipher_suite;
mod cipher_tls12;
pub mod client;
mod defragment;
pub mod error;
pub mod extensions;
mod extensions_util;
pub mod handshake;
mod handshake_executor;
pub mod hkdf;
pub mod hmac;
pub mod key_exchange;
pub mod key_schedule;
pub mod key_schedule_tls12;
pub mod options;
mod parsing;
pub mod provider;
pub mod psk;
pub mod record;
pub mod record_stream;
pub mod server;
pub mod session;
pub mod transcript;
mod utils;

#[cfg(test)]
pub mod testing;

pub use application_stream::{ApplicationStream, HandshakeSummary};
pub use client::Client;
pub use error::{ErrorKind, Result, TlsError};
pub use options::{ClientOptions, ServerOptions, Settings};
pub use server::Server;
