//! Knock event ingestion.
//!
//! Two interchangeable front ends deliver [`KnockEvent`]s to a single
//! handler: [`KnockListener`] binds one UDP socket per knock port, and
//! [`CaptureObserver`] consumes datagram metadata from a capture stream.
//! Both serialize delivery through one worker task and stop on a
//! [`Shutdown`] signal.

mod event;
mod observe;
mod server;
mod shutdown;
mod worker;

pub use event::{CapturedDatagram, KnockEvent};
pub use observe::CaptureObserver;
pub use server::{KnockListener, ListenerConfig};
pub use shutdown::{shutdown_channel, Shutdown, ShutdownTrigger};
pub use worker::ListenerMetrics;
