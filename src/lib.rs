//! An async client for `mtr-packet`, the privileged probe helper shipped with mtr.
//!
//! A single [`Client`] owns one `mtr-packet` subprocess and multiplexes any
//! number of concurrent probes over its stdin/stdout: every command carries a
//! token, replies are matched back to the waiting caller by that token, and
//! all waiters fail with [`Error::Process`] if the subprocess goes away.
//!
//! ## Example
//! Tracing a route by sending one probe per TTL, all of them in flight at once.
//! ```no_run
//! use async_mtr::{Client, ClientConfigBuilder, ProbeInputBuilder};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::new(ClientConfigBuilder::new().build())?;
//!     let inputs = (1..=16)
//!         .map(|ttl| {
//!             ProbeInputBuilder::new()
//!                 .with_target("example.com")
//!                 .with_ttl(ttl)
//!                 .build()
//!         })
//!         .collect::<Result<Vec<_>, _>>()?;
//!     for (ttl, outcome) in (1..).zip(client.probe_batch(&inputs).await) {
//!         let outcome = outcome?;
//!         println!("{:>2}. {} {:?} {:?}", ttl, outcome.result, outcome.responder, outcome.time_ms);
//!         if outcome.success {
//!             break;
//!         }
//!     }
//!     client.close().await;
//!     Ok(())
//! }
//! ```
//! Lower-level access is available through [`Client::submit`] and
//! [`Client::issue`], which take a raw [`CommandRecord`].

pub mod client;
pub mod command;
pub mod error;
pub mod probe;
pub mod resolve;
pub mod response;

pub(crate) mod caching;
pub(crate) mod multiplexer;
pub(crate) mod pending;
pub(crate) mod process;
pub(crate) mod task;

pub use client::{Client, ClientConfig, ClientConfigBuilder};
pub use command::{CommandRecord, Token};
pub use error::{Error, InputBuildError, ProtocolError, Result};
pub use pending::{ConnectionState, PendingReply};
pub use probe::{ProbeInput, ProbeInputBuilder, ProbeOutcome, Protocol};
pub use resolve::{IpVersion, ResolveStrategy, ResolvedHost};
pub use response::{MplsLabel, ProbeReply, ReplyBody, ReplyRecord};
