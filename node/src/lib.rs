//! Scopenode — node-side fleet controller for behavioural-tracking
//! acquisition devices.
//!
//! The node discovers devices over mDNS, polls each one on its own clock,
//! tracks a per-device status state machine, relays control instructions,
//! estimates backup progress, fans device video out to many viewers over a
//! single upstream connection, and keeps a persistent registry of devices,
//! runs, users and alerts.

pub mod backup;
pub mod cache;
pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod mdns;
pub mod notify;
pub mod retention;
pub mod scanner;
pub mod status;
pub mod stream;
