//! Lifecycle core of the rdpd remote desktop daemon.
//!
//! One owner thread runs the listener's main loop and ticks the [`Daemon`]
//! on every iteration. Other threads hand work to the owner through a
//! single-slot call rendezvous, and termination signals are turned into an
//! idempotent teardown that runs on the owner thread.
//!
//! [`Daemon`]: daemon::Daemon

pub mod call_slot;
pub mod config;
pub mod daemon;
pub mod listener;
pub mod pidfile;
pub mod platform;
pub mod shutdown;
pub mod signals;
pub mod status;
pub mod termination;
