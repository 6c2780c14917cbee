// Groupcast Engine
// Everything with side effects: HTTP, SQLite, timers, spawned tasks.
//
// Leaves first:
//   http, identifier  — backoff curves, log hygiene, id/phone formats
//   config            — EngineConfig (TOML + env)
//   gateway           — GatewayApi trait + reqwest GatewayClient
//   store             — GroupcastStore (rusqlite), single source of truth
//   progress          — SyncProgressTracker, projection for pollers
//   lifecycle         — ChannelController, the channel state machine
//   sync              — SyncEngine, collection + classification runs
//   reaper            — periodic consistency sweep
//   plan              — PlanOracle, live-mode gate, trial expiry
//   broadcast         — paced sends to administered groups
//   service           — GroupcastService facade

pub mod broadcast;
pub mod config;
pub mod gateway;
pub mod http;
pub mod identifier;
pub mod lifecycle;
pub mod plan;
pub mod progress;
pub mod reaper;
pub mod service;
pub mod store;
pub mod sync;
