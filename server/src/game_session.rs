//! One running game: the pipeline plus its long-lived tasks
//!
//! [`GameSession::start`] builds the clock, gate, queue and session registry
//! and spawns the named tasks that use them:
//!
//! - `dispatcher`: sole consumer of the notification queue
//! - `turn-driver`: closes and opens turns on a fixed period
//! - `player-commands`: applies client actions once per turn
//! - `creature-ai`: moves and digs with every creature once per turn
//!
//! The UDP front end is started separately (see [`crate::network::Server`])
//! and reads its handles from the session. [`GameSession::shutdown`] announces
//! the exit, stops the gate and joins every task, letting the dispatcher drain
//! the queue last.

use crate::ai::CreatureAi;
use crate::commands::{CommandProducer, QueuedCommand};
use crate::config::{ConfigError, PipelineConfig};
use crate::dispatcher::{DispatchStats, Dispatcher};
use crate::driver::TurnDriver;
use crate::game::GameMap;
use crate::notification_queue::NotificationQueue;
use crate::producer::run_producer;
use crate::session_registry::SessionRegistry;
use crate::turn_clock::TurnClock;
use crate::turn_gate::TurnGate;
use log::{error, info, warn};
use shared::Payload;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid pipeline configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("turn state corrupted: {reason}")]
    Corrupted { reason: String, state: String },
    #[error("task '{0}' failed: {1}")]
    TaskFailed(&'static str, String),
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub max_sessions: usize,
    pub creature_ai: bool,
    /// Seed for the creature AI. Random when unset.
    pub ai_seed: Option<u64>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_sessions: 16,
            creature_ai: true,
            ai_seed: None,
        }
    }
}

pub struct GameSession {
    config: PipelineConfig,
    gate: Arc<TurnGate>,
    queue: NotificationQueue,
    sessions: Arc<RwLock<SessionRegistry>>,
    map: Arc<RwLock<GameMap>>,
    commands: mpsc::UnboundedSender<QueuedCommand>,
    shutdown: watch::Sender<bool>,
    producers: Vec<(&'static str, JoinHandle<()>)>,
    driver: Option<JoinHandle<Result<(), SessionError>>>,
    dispatcher: JoinHandle<DispatchStats>,
}

impl GameSession {
    /// Validates the configuration and spawns the session's tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        config: PipelineConfig,
        map: GameMap,
        options: SessionOptions,
    ) -> Result<Self, SessionError> {
        config.validate()?;

        let clock = Arc::new(TurnClock::new());
        let gate = Arc::new(TurnGate::new(clock, &config));
        let (queue, receiver) = NotificationQueue::new(Arc::clone(&gate), config.queue_warn_depth);
        let sessions = Arc::new(RwLock::new(SessionRegistry::new(
            options.max_sessions,
            &config,
        )));
        let map = Arc::new(RwLock::new(map));
        let (shutdown, _) = watch::channel(false);

        // Spawn dispatcher
        let dispatcher = Dispatcher::new(
            receiver,
            Arc::clone(&sessions),
            Arc::clone(&gate),
            &config,
        );
        let dispatcher = tokio::spawn(dispatcher.run(shutdown.subscribe()));

        // Spawn turn driver
        let driver = TurnDriver::new(queue.clone(), Arc::clone(&sessions), &config);
        let driver = tokio::spawn(driver.run(shutdown.subscribe()));

        // Spawn producers
        let mut producers = Vec::new();
        let (command_producer, commands) = CommandProducer::new(Arc::clone(&map));
        producers.push((
            "player-commands",
            tokio::spawn(run_producer(
                command_producer,
                queue.clone(),
                shutdown.subscribe(),
            )),
        ));

        if options.creature_ai {
            let seed = options.ai_seed.unwrap_or_else(rand::random::<u64>);
            let ai = CreatureAi::new(Arc::clone(&map), seed);
            producers.push((
                "creature-ai",
                tokio::spawn(run_producer(ai, queue.clone(), shutdown.subscribe())),
            ));
        }

        info!(
            "Game session started: {:.2} turns per second, {} max sessions, stall timeout {:?}",
            config.turns_per_second, options.max_sessions, config.stall_timeout
        );

        Ok(Self {
            config,
            gate,
            queue,
            sessions,
            map,
            commands,
            shutdown,
            producers,
            driver: Some(driver),
            dispatcher,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn gate(&self) -> &Arc<TurnGate> {
        &self.gate
    }

    pub fn queue(&self) -> NotificationQueue {
        self.queue.clone()
    }

    pub fn sessions(&self) -> Arc<RwLock<SessionRegistry>> {
        Arc::clone(&self.sessions)
    }

    pub fn map(&self) -> Arc<RwLock<GameMap>> {
        Arc::clone(&self.map)
    }

    pub fn command_sender(&self) -> mpsc::UnboundedSender<QueuedCommand> {
        self.commands.clone()
    }

    /// Flips to `true` when the session starts shutting down.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Resolves when the turn driver stops on its own, which only happens on a
    /// fatal error.
    pub async fn driver_stopped(&mut self) -> Result<(), SessionError> {
        let Some(handle) = self.driver.as_mut() else {
            return std::future::pending().await;
        };
        let result = Self::join_driver(handle).await;
        self.driver = None;
        result
    }

    async fn join_driver(
        handle: &mut JoinHandle<Result<(), SessionError>>,
    ) -> Result<(), SessionError> {
        match handle.await {
            Ok(result) => result,
            Err(e) => Err(SessionError::TaskFailed("turn-driver", e.to_string())),
        }
    }

    /// Queues `Exit` as the final record, stops every task and waits for the
    /// dispatcher to drain.
    pub async fn shutdown(mut self, reason: &str) -> Result<DispatchStats, SessionError> {
        info!("Shutting down game session: {}", reason);

        let exit = Payload::Exit {
            reason: reason.to_string(),
        };
        if !self.queue.close_with(exit) {
            warn!("Turn gate was already shut down; no exit record sent");
        }
        self.shutdown.send_replace(true);

        for (name, handle) in self.producers.drain(..) {
            if let Err(e) = handle.await {
                error!("Task '{}' panicked: {}", name, e);
            }
        }

        let driver_result = match self.driver.as_mut() {
            Some(handle) => Self::join_driver(handle).await,
            None => Ok(()),
        };

        let stats = self
            .dispatcher
            .await
            .map_err(|e| SessionError::TaskFailed("dispatcher", e.to_string()))?;

        info!("Game session stopped");
        driver_result.map(|()| stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelTransport;
    use shared::{Packet, PlayerCommand};
    use std::time::Duration;

    fn fast_config() -> PipelineConfig {
        PipelineConfig::default()
            .with_turns_per_second(50.0)
            .with_stall_timeout(Duration::from_millis(500))
    }

    #[tokio::test]
    async fn test_start_rejects_bad_config() {
        let config = PipelineConfig::default().with_turns_per_second(0.0);
        let result = GameSession::start(config, GameMap::new(5, 5), SessionOptions::default());
        assert!(matches!(
            result,
            Err(SessionError::Config(ConfigError::InvalidTurnRate(_)))
        ));
    }

    #[tokio::test]
    async fn test_session_runs_turns_and_shuts_down() {
        let options = SessionOptions {
            ai_seed: Some(5),
            ..SessionOptions::default()
        };
        let session =
            GameSession::start(fast_config(), GameMap::with_starting_dungeon(15, 15, 1), options)
                .unwrap();

        let (transport, mut rx) = ChannelTransport::new("watcher", 4_096);
        session
            .sessions()
            .write()
            .await
            .add_session("watcher", Arc::new(transport))
            .unwrap();

        session
            .command_sender()
            .send(QueuedCommand {
                session_id: 1,
                nick: "watcher".to_string(),
                seat: 1,
                command: PlayerCommand::Chat {
                    message: "hello".to_string(),
                },
            })
            .unwrap();

        let clock = Arc::clone(session.gate().clock());
        tokio::time::timeout(Duration::from_secs(5), clock.wait_for_turn_after(4))
            .await
            .unwrap();

        let stats = tokio::time::timeout(Duration::from_secs(5), session.shutdown("test over"))
            .await
            .unwrap()
            .unwrap();
        assert!(stats.records > 0);

        let mut turns = Vec::new();
        let mut saw_chat = false;
        let mut last = None;
        while let Ok(bytes) = rx.try_recv() {
            let Packet::Notification(notification) = Packet::decode(&bytes).unwrap() else {
                panic!("unexpected packet");
            };
            turns.push(notification.turn);
            if let Payload::Chat { message, .. } = &notification.payload {
                saw_chat |= message == "hello";
            }
            last = Some(notification.payload);
        }

        assert!(saw_chat);
        assert!(turns.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(
            last,
            Some(Payload::Exit {
                reason: "test over".to_string()
            })
        );
    }
}
