//! # Dungeon Server Library
//!
//! This library provides the authoritative server for the networked dungeon
//! game. The simulation advances in discrete turns, and every change it makes
//! is published as a turn-tagged notification that reaches every connected
//! client in the order it was produced.
//!
//! ## Core Responsibilities
//!
//! ### Turn Synchronization
//! A turn only closes once every producer registered for it has finished
//! enqueueing. The turn clock cannot advance underneath a producer that is
//! still working, so no notification is ever tagged with a turn that has
//! already been announced as over.
//!
//! ### Ordered Delivery
//! Producers push into a single FIFO queue with one consumer. The dispatcher
//! encodes each record once and sends it to every active session before
//! touching the next one.
//!
//! ### Session Tracking
//! Clients move through `Connecting`, `Active`, `Lagging` and
//! `Disconnected`. A client that keeps failing is dropped without affecting
//! delivery to anyone else.
//!
//! ## Module Organization
//!
//! ### Pipeline
//! - `turn_clock`: the monotonic turn counter
//! - `turn_gate`: producer registration and turn completion
//! - `notification_queue`: the single-consumer FIFO of tagged records
//! - `dispatcher`: drains the queue and broadcasts each record
//! - `driver`: closes and opens turns on a fixed period
//! - `config`: every tunable bound the pipeline enforces
//!
//! ### Clients
//! - `session_registry`: connected clients and their delivery state
//! - `transport`: the send-side abstraction over UDP or in-memory channels
//! - `network`: the UDP receive loop
//!
//! ### Game
//! - `game`: the dungeon map and its mutations
//! - `producer`: the per-turn producer loop
//! - `ai`: creature behaviour
//! - `commands`: player actions
//! - `game_session`: wires everything together and owns the tasks
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::PipelineConfig;
//! use server::game::GameMap;
//! use server::game_session::{GameSession, SessionOptions};
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PipelineConfig::default().with_turns_per_second(2.0);
//!     let map = GameMap::with_starting_dungeon(32, 32, 1);
//!     let session = GameSession::start(config, map, SessionOptions::default())?;
//!
//!     let server = Server::bind("127.0.0.1:8080", &session).await?;
//!     let network = tokio::spawn(server.run(session.shutdown_signal()));
//!
//!     tokio::signal::ctrl_c().await?;
//!     session.shutdown("server shutting down").await?;
//!     network.await?;
//!     Ok(())
//! }
//! ```

pub mod ai;
pub mod commands;
pub mod config;
pub mod dispatcher;
pub mod driver;
pub mod game;
pub mod game_session;
pub mod network;
pub mod notification_queue;
pub mod producer;
pub mod session_registry;
pub mod transport;
pub mod turn_clock;
pub mod turn_gate;
