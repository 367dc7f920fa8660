//! # `eswifi-hal`
//! This is a driver for the Inventek eS-WiFi (ISM43xxx) family of Wi-Fi modules, attached over
//! SPI with a single data-ready (DRDY) signal line. It turns the module's line-oriented
//! command/response protocol into a non-blocking network interface with TCP/UDP connect, send
//! and receive, plus station and access-point control.
//!
//! ## Hardware overview
//! This chapter gives a short overview of how the module is driven.
//!
//! ### Command phase
//! The module is half duplex: either the host is sending a command, or it is reading a response,
//! never both. The module raises DRDY when it is ready to accept a command and again when
//! response data is available. Commands are short text lines (`"C1=MySSID"`), terminated with a
//! carriage return. The bus is clocked in 16-bit words with the bytes of each word swapped
//! relative to the host, so every chunk is padded to an even length and swapped pairwise before
//! transmission. Raw data payloads (for socket sends) are length-prefixed by an `S3=<len>`
//! command and follow it inside the same chip-select assertion.
//!
//! ### Response phase
//! Responses are read in two-byte words for as long as DRDY stays asserted, unswapped, and
//! trimmed of the module's `0x15` padding bytes. A response is a CRLF-separated list of lines
//! ending with the module's `"> "` prompt; the line right before the prompt is the status line
//! (`"OK"` on success). The module may prepend an asynchronous notification delimited by
//! `[SOMA]`/`[EOMA]` markers, which the driver strips and logs.
//!
//! ### Sequences
//! All work is expressed as *sequences*: short, ordered lists of commands submitted to a
//! fixed-depth queue. Only the head sequence is ever on the wire; each of its commands is
//! transmitted, its response parsed and dispatched, and only then does the next command go out.
//! A sequence can be aborted from anywhere in the queue; its terminal handler always fires
//! exactly once, with `ok = false` if it never completed. Protocol desynchronization (a garbled
//! or missing response) is not recoverable in place and forces the module through a reset.
//!
//! ### Sockets
//! The module tracks at most [`SOCKET_COUNT`] sockets. Because it cannot push received data to
//! the host, the driver polls every idle socket with an `R0` read command, backing off
//! exponentially while nothing arrives and collapsing back to immediate polling as soon as any
//! socket returns data.
//!
//! ## Integration
//! The driver is hardware agnostic: it talks to the bus through [`embedded_hal::spi::SpiBus`]
//! and to the control pins through the `embedded_hal` digital traits. It never blocks; call
//! [`EsWifi::poll`] from your scheduler at least once per tick and additionally whenever the
//! DRDY interrupt has fired. The DRDY ISR itself must only call [`DrdySignal::signal`] on a
//! shared [`DrdySignal`] and return; all protocol work happens inside `poll`.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

mod cmd;
mod driver;
mod netif;
mod proto;
mod sync;
mod wifi;

use core::convert::Infallible;

use embedded_hal::digital::{ErrorType, OutputPin};

pub use driver::{EsWifi, Mode, Phase};
pub use netif::{NetInterface, Proto, SocketHandle, MAX_TCP_IO_SIZE, MAX_UDP_IO_SIZE};
pub use sync::DrdySignal;
pub use wifi::{ApConfig, ClientInfo, IpInfo, StaConfig};

/// Number of sockets in the module's internal socket table.
pub const SOCKET_COUNT: usize = 4;
/// Maximum number of clients the module tracks in access-point mode.
pub const AP_MAX_CLIENTS: usize = 4;
/// Depth of the pending command-sequence queue.
pub const SEQ_QUEUE_DEPTH: usize = 8;

/// Error type of the driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// A bus transaction failed. Never retried by the driver; the affected sequence fails.
    Bus,
    /// A control pin could not be driven.
    Pin,
    /// The sequence queue is full. The submitted work will never run.
    QueueFull,
    /// All socket slots are in use.
    NoFreeSockets,
    /// Another UDP socket is already bound to this destination port. The module firmware
    /// mirrors the destination port as the source port, so two such sockets would cross-talk.
    /// See [`Config::udp_port_collision_check`].
    UdpPortInUse,
    /// Wi-Fi is neither connected as a station nor running as an access point.
    NotReady,
    /// The operation is not valid in the driver's current mode or phase.
    InvalidState,
    /// The socket handle refers to a slot that has since been reused or torn down.
    StaleHandle,
    /// The operation is not supported by the module.
    Unsupported,
    /// A command or configuration string exceeds the module's limits.
    TooLong,
}

pub type EsWifiResult<T> = Result<T, Error>;

/// Notifications delivered upward to the owner of the interface.
///
/// Drain them with [`EsWifi::next_event`] after each [`EsWifi::poll`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event {
    /// The station associated with an access point.
    StaConnected,
    /// The station lost its access point. All sockets have been force-closed.
    StaDisconnected,
    /// The station has an IP address.
    StaIpAcquired,
    /// A client joined our access point.
    ApClientConnected { mac: [u8; 6] },
    /// A client left our access point.
    ApClientDisconnected { mac: [u8; 6] },
    /// An outbound connect finished.
    ConnectFinished { handle: SocketHandle, ok: bool },
    /// The socket can accept another send.
    Writable { handle: SocketHandle },
    /// Received bytes are waiting in the socket's buffer.
    DataAvailable { handle: SocketHandle },
    /// The connection is gone: the peer closed it (and the receive buffer has drained), or it
    /// was force-closed by a reset or disconnect. Call [`EsWifi::destroy`] to release the slot.
    Closed { handle: SocketHandle },
}

/// Driver configuration, fixed at construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// Lower bound of the data-poll backoff interval.
    pub data_poll_min_ms: u32,
    /// Upper bound of the data-poll backoff interval.
    pub data_poll_max_ms: u32,
    /// Reject UDP sockets whose destination port is already bound by another UDP socket.
    ///
    /// Works around module firmware (seen up to C3.5.2.3.BETA9) using the destination port as
    /// the source port, which mixes up replies between sockets. Disable only if your module
    /// firmware is known fixed.
    pub udp_port_collision_check: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_poll_min_ms: 50,
            data_poll_max_ms: 500,
            udp_port_collision_check: true,
        }
    }
}

/// Placeholder for an absent control pin, for use in the driver's `Option<..>` pin slots.
///
/// The reset, boot-select and wakeup pins are not wired up on all boards. Pass
/// `None::<NoPin>` for the ones you don't have.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoPin;

impl ErrorType for NoPin {
    type Error = Infallible;
}

impl OutputPin for NoPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}
