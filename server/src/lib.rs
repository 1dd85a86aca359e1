//! # Session Server Library
//!
//! Authoritative hub for the multiplayer session layer. The server owns the
//! one canonical [`shared::Registry`]; clients only ever hold mirrors of it.
//!
//! ## Message Flow
//!
//! A client change arrives as a framed [`shared::Message`], is checked
//! against the sender's bound identity and the server-side
//! [`shared::UpdateThrottle`], applied to the registry, and then re-broadcast
//! to every other connection. Turn hand-offs and departures are announced to
//! everyone.
//!
//! ## Tasks
//!
//! - **Accept loop**: registers each stream with the hub
//! - **Reader** (one per connection): decodes frames and hands them to the hub
//! - **Writer** (one per connection): drains a bounded outbound queue
//! - **Sweeper**: evicts stale players and pushes periodic full state
//!
//! Because the hub only ever queues outbound messages, a slow peer cannot
//! stall the handling of anyone else's message. A peer whose queue fills up
//! is disconnected and treated as having left.
//!
//! ## Module Organization
//!
//! ### Client Manager Module (`client_manager`)
//! Live connection table: ids, bound players, outbound queues.
//!
//! ### Network Module (`network`)
//! The [`network::Hub`] routing logic and the [`network::Server`] runtime.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::network::{Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig {
//!         bind_addr: "127.0.0.1:5555".to_string(),
//!         ..ServerConfig::default()
//!     };
//!     let server = Server::bind(config).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod client_manager;
pub mod network;

pub use network::{Hub, Server, ServerConfig, ServerError};
