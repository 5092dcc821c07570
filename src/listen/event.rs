//! Observed knock events.

use std::net::{AddrParseError, IpAddr};
use std::time::SystemTime;

/// A single datagram's routing metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnockEvent {
    /// Originating address; IPv4-mapped IPv6 addresses are stored as IPv4.
    pub source: IpAddr,
    /// Destination port the datagram was sent to.
    pub port: u16,
    /// Arrival time.
    pub timestamp: SystemTime,
}

impl KnockEvent {
    pub fn new(source: IpAddr, port: u16, timestamp: SystemTime) -> Self {
        Self {
            source: source.to_canonical(),
            port,
            timestamp,
        }
    }

    /// Event stamped with the current time.
    pub fn now(source: IpAddr, port: u16) -> Self {
        Self::new(source, port, SystemTime::now())
    }
}

/// UDP datagram metadata as handed over by a packet capture collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedDatagram {
    /// Textual source address.
    pub source: String,
    pub destination_port: u16,
    pub timestamp: SystemTime,
}

impl TryFrom<CapturedDatagram> for KnockEvent {
    type Error = AddrParseError;

    fn try_from(datagram: CapturedDatagram) -> Result<Self, Self::Error> {
        let source: IpAddr = datagram.source.trim().parse()?;
        Ok(KnockEvent::new(
            source,
            datagram.destination_port,
            datagram.timestamp,
        ))
    }
}
