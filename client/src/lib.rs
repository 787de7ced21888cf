//! # Dungeon Client Library
//!
//! A headless client for the dungeon server. It connects over UDP, rebuilds
//! the dungeon from the server's turn-tagged notifications and acknowledges
//! each turn as it arrives.
//!
//! ## Module Organization
//!
//! ### Mirror Module (`mirror`)
//! The client's copy of the dungeon. Records are applied in sequence order
//! and anything already seen is ignored.
//!
//! ### Network Module (`network`)
//! Manages client-server communication:
//! - Connection handshake and protocol version
//! - Receiving notifications and feeding the mirror
//! - Acknowledging the latest turn
//! - Sending player actions
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::Client;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = Client::new("127.0.0.1:8080", "keeper").await?;
//!     client.connect().await?;
//!     client.run().await?;
//!     println!("Ended at turn {}", client.mirror().current_turn());
//!     Ok(())
//! }
//! ```

pub mod mirror;
pub mod network;
