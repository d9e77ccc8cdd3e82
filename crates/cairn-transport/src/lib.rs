//! # Cairn Transport
//!
//! Messaging between the containers of a Cairn cluster.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐
//! │  cairn-runtime       │  (cluster, containers, launchers)
//! ├──────────────────────┤
//! │  cairn-transport     │  <- This crate (frames, links, RPC)
//! ├──────────────────────┤
//! │  TCP / child stdio   │
//! └──────────────────────┘
//! ```
//!
//! - [`frame`]: the JSON wire types, one per line
//! - [`Link`]: frame channels, in memory or over any byte stream
//! - [`Broadcaster`]: fan-out of [`BroadcastMessage`]s to attached containers
//! - [`rpc`]: [`RpcServer`], [`RemoteConnector`] and [`RemoteStub`] for calls
//!   to services owned by another container
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use cairn_transport::{RemoteConnector, RemoteStub, RpcServer};
//!
//! let server = RpcServer::bind("127.0.0.1:0", Arc::new(move |name: &str| app.get_service(name).ok())).await?;
//!
//! let connector = Arc::new(RemoteConnector::new());
//! let calc = RemoteStub::new(&announcement, connector).unwrap().into_service();
//! let sum = calc.call("add", vec![json!(1), json!(2)]).await?;
//! ```

pub mod broadcast;
pub mod error;
pub mod frame;
pub mod link;
pub mod rpc;

pub use broadcast::Broadcaster;
pub use error::{TransportError, TransportResult};
pub use frame::{
    BroadcastMessage, ContainerDescriptor, Frame, RpcRequest, RpcResponse, ServiceAnnouncement,
};
pub use link::{Link, MAX_LINE_LEN, decode, encode, line_codec};
pub use rpc::{RemoteConnector, RemoteStub, RpcServer, ServiceProvider};
