//! Sprinkler hub: soil-moisture driven zone scheduling with cycle/soak
//! watering, absorption learning and a moisture deficit ledger.
//!
//! The zone engine ([`coordinator`], [`queue`], [`processor`]) is plain
//! synchronous code owned by the [`controller`] actor.  Everything that
//! touches the outside world (MQTT, GPIO, SQLite, HTTP) sits around it.

pub mod absorption;
pub mod config;
pub mod controller;
pub mod coordinator;
pub mod db;
pub mod deficit;
pub mod duration;
pub mod mqtt;
pub mod processor;
pub mod queue;
pub mod scheduler;
pub mod sensors;
pub mod state;
pub mod timers;
pub mod valve;
pub mod weather;
pub mod web;
pub mod zone;
