//! geerpc multiplexes many concurrent RPC calls over a single connection.
//!
//! A connection starts with one JSON option preamble negotiating the codec
//! and timeouts, followed by codec-encoded `(Header, Body)` pairs. The
//! client assigns every call a monotonic sequence number and demultiplexes
//! responses in a dedicated reader task; the server dispatches each request
//! to a registered service method in its own task, serializing response
//! writes so they never interleave on the wire.
//!
//! ```no_run
//! use geerpc::{Client, Options, Server, Service};
//!
//! #[derive(serde::Serialize, serde::Deserialize)]
//! struct Args { num1: i32, num2: i32 }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), geerpc::Error> {
//!     let server = Server::new();
//!     server.register(
//!         Service::builder("Foo")
//!             .method("Sum", |args: Args| async move { Ok(args.num1 + args.num2) })
//!             .build(),
//!     )?;
//!
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
//!     let addr = listener.local_addr()?;
//!     tokio::spawn(async move { server.accept(listener).await });
//!
//!     let client = Client::dial("tcp", &addr.to_string(), Options::default()).await?;
//!     let reply: i32 = client.call("Foo.Sum", Args { num1: 1, num2: 2 }).await?;
//!     assert_eq!(reply, 3);
//!     Ok(())
//! }
//! ```
//!
//! Beyond the point-to-point pieces, [`xclient::XClient`] load-balances
//! calls across a server fleet fed by a [`xclient::Discovery`], and
//! [`registry::Registry`] is the matching HTTP registry that servers keep
//! alive with heartbeats.

pub mod client;
pub mod codec;
pub mod error;
pub mod message;
pub mod registry;
pub mod server;
pub mod service;
pub mod transport;
pub mod xclient;

pub use client::{Call, Client};
pub use error::Error;
pub use message::{Header, Options};
pub use registry::Registry;
pub use server::Server;
pub use service::Service;
pub use xclient::{Discovery, MultiServersDiscovery, RegistryDiscovery, SelectMode, XClient};
