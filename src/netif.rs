//! Socket multiplexer and data poller.
//!
//! The module has a table of four sockets, addressed by a slot index selected with `P0`. The
//! module never pushes received data, so connected sockets with an empty receive buffer are
//! polled with `R0` read commands on an adaptive interval: immediately again after any data,
//! doubling up to a ceiling while idle.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::net::SocketAddrV4;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal::spi::SpiBus;

use crate::cmd::{Command, RespHandler, SeqDone, SeqId, MAX_SEQ_CMDS};
use crate::driver::{reached, EsWifi};
use crate::proto;
use crate::{Error, EsWifiResult, Event, SOCKET_COUNT};

/// Largest single TCP read or write the module is asked for. Keeps a full read response,
/// prompt included, under the runaway limit.
pub const MAX_TCP_IO_SIZE: usize = 1160;
/// Largest single UDP datagram read or write.
pub const MAX_UDP_IO_SIZE: usize = 1160;

/// Transport protocol, with the module's `P1` encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Proto {
    Tcp = 0,
    Udp = 1,
}

/// Handle to a socket slot. The generation number makes a handle stale once its slot has been
/// torn down, so a reused slot can never be touched through an old handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SocketHandle {
    pub(crate) slot: u8,
    pub(crate) gen: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ConnState {
    Connecting,
    Connected,
    /// The peer closed; the receive buffer may still hold undelivered data.
    PeerClosed,
}

#[derive(Debug)]
pub(crate) struct SocketConn {
    pub gen: u16,
    pub proto: Proto,
    pub peer: SocketAddrV4,
    pub state: ConnState,
    pub rx_buf: Vec<u8>,
    pub tx_buf: Vec<u8>,
    /// Re-arm the writability notification once the transmit buffer has drained.
    pub poll_with_empty: bool,
    /// The `Closed` event has been delivered for this connection.
    pub close_reported: bool,
}

/// One hardware socket slot. A slot is free only when it has no owner and no sequence still
/// in flight (a close must finish before the module reuses the slot).
#[derive(Debug, Default)]
pub(crate) struct Socket {
    pub cur_seq: Option<SeqId>,
    pub conn: Option<SocketConn>,
    gen_ctr: u16,
}

#[derive(Debug, Default)]
pub(crate) struct DataPoller {
    pub cur_seq: Option<SeqId>,
    pub interval_ms: u32,
    pub next_at: Option<u32>,
    pub got_data: bool,
    /// Interval requested by a completion handler, applied on the next driver poll.
    pub request: Option<u32>,
}

/// Next poll interval: any data collapses the backoff, otherwise it doubles up to `max`.
fn next_backoff(cur: u32, got_data: bool, min: u32, max: u32) -> u32 {
    if got_data {
        0
    } else {
        (cur * 2).clamp(min, max)
    }
}

/// Non-blocking TCP/UDP over the module's socket table.
///
/// All calls return immediately; progress and failures arrive as [`Event`]s from
/// [`EsWifi::poll`]. Implemented by [`EsWifi`].
pub trait NetInterface {
    /// Open an outbound TCP connection. Completion is reported via
    /// [`Event::ConnectFinished`].
    fn connect_tcp(&mut self, peer: SocketAddrV4) -> EsWifiResult<SocketHandle>;
    /// Open a UDP association with a fixed peer.
    fn connect_udp(&mut self, peer: SocketAddrV4) -> EsWifiResult<SocketHandle>;
    /// Accepting TCP connections is not wired up to the module; the call is accepted and
    /// nothing listens.
    fn listen_tcp(&mut self, port: u16) -> EsWifiResult<()>;
    fn listen_udp(&mut self, port: u16) -> EsWifiResult<()>;
    /// Queue bytes for transmission. Returns how many were accepted, 0 while a previous send
    /// is still pending. [`Event::Writable`] re-arms the caller.
    fn send(&mut self, handle: SocketHandle, buf: &[u8]) -> EsWifiResult<usize>;
    /// Drain received bytes out of the socket's buffer. Never touches the bus.
    fn recv(&mut self, handle: SocketHandle, buf: &mut [u8]) -> EsWifiResult<usize>;
    /// Release the slot and close the module-side socket.
    fn destroy(&mut self, handle: SocketHandle) -> EsWifiResult<()>;
}

impl<'s, SPI, CS, RST, B0, WK, RDY, D> NetInterface for EsWifi<'s, SPI, CS, RST, B0, WK, RDY, D>
where
    SPI: SpiBus,
    CS: OutputPin,
    RST: OutputPin,
    B0: OutputPin,
    WK: OutputPin,
    RDY: InputPin,
    D: DelayNs,
{
    fn connect_tcp(&mut self, peer: SocketAddrV4) -> EsWifiResult<SocketHandle> {
        self.socket_connect(peer, Proto::Tcp, MAX_TCP_IO_SIZE)
    }

    fn connect_udp(&mut self, peer: SocketAddrV4) -> EsWifiResult<SocketHandle> {
        self.socket_connect(peer, Proto::Udp, MAX_UDP_IO_SIZE)
    }

    fn listen_tcp(&mut self, port: u16) -> EsWifiResult<()> {
        warn!("TCP listen({}) accepted but not implemented", port);
        Ok(())
    }

    fn listen_udp(&mut self, _port: u16) -> EsWifiResult<()> {
        Err(Error::Unsupported)
    }

    fn send(&mut self, handle: SocketHandle, buf: &[u8]) -> EsWifiResult<usize> {
        let slot = handle.slot as usize;
        let conn = self.resolve(handle)?;
        if conn.state != ConnState::Connected {
            return Err(Error::InvalidState);
        }
        let max = max_io(conn.proto);
        if self.sockets[slot].cur_seq.is_some()
            || !self.sockets[slot]
                .conn
                .as_ref()
                .is_some_and(|c| c.tx_buf.is_empty())
        {
            return Ok(0);
        }
        let len = buf.len().min(max);
        if let Some(conn) = self.sockets[slot].conn.as_mut() {
            conn.tx_buf.extend_from_slice(&buf[..len]);
        }
        self.send_data(slot)?;
        Ok(len)
    }

    fn recv(&mut self, handle: SocketHandle, buf: &mut [u8]) -> EsWifiResult<usize> {
        let n;
        let report_close;
        {
            let conn = self.resolve(handle)?;
            n = buf.len().min(conn.rx_buf.len());
            buf[..n].copy_from_slice(&conn.rx_buf[..n]);
            conn.rx_buf.drain(..n);
            report_close = conn.rx_buf.is_empty()
                && conn.state == ConnState::PeerClosed
                && !conn.close_reported;
            if report_close {
                conn.close_reported = true;
            }
        }
        if report_close {
            self.push_event(Event::Closed { handle });
        }
        Ok(n)
    }

    fn destroy(&mut self, handle: SocketHandle) -> EsWifiResult<()> {
        let slot = handle.slot as usize;
        if slot >= SOCKET_COUNT {
            return Err(Error::StaleHandle);
        }
        if !self.sockets[slot]
            .conn
            .as_ref()
            .is_some_and(|c| c.gen == handle.gen)
        {
            // Already torn down (reset or link loss released it).
            return Ok(());
        }
        // The slot stays owned until the close is queued; on a full queue the caller
        // retries and the module-side socket remains accounted for.
        let mut cmds: heapless::Vec<Command, MAX_SEQ_CMDS> = heapless::Vec::new();
        let _ = cmds.push(Command::fmt(format_args!("P0={}", slot)));
        let _ = cmds.push(Command::text("P6=0"));
        let id = self.submit_seq(cmds, SeqDone::CloseDone { slot: handle.slot })?;
        debug!("released sock {}", slot);
        let pending = self.sockets[slot].cur_seq.take();
        self.sockets[slot].conn = None;
        if let Some(old) = pending {
            self.abort_seq(old);
        }
        self.sockets[slot].cur_seq = Some(id);
        Ok(())
    }
}

impl<'s, SPI, CS, RST, B0, WK, RDY, D> EsWifi<'s, SPI, CS, RST, B0, WK, RDY, D>
where
    SPI: SpiBus,
    CS: OutputPin,
    RST: OutputPin,
    B0: OutputPin,
    WK: OutputPin,
    RDY: InputPin,
    D: DelayNs,
{
    fn resolve(&mut self, handle: SocketHandle) -> EsWifiResult<&mut SocketConn> {
        self.sockets
            .get_mut(handle.slot as usize)
            .and_then(|s| s.conn.as_mut())
            .filter(|c| c.gen == handle.gen)
            .ok_or(Error::StaleHandle)
    }

    fn socket_connect(
        &mut self,
        peer: SocketAddrV4,
        proto: Proto,
        max_read: usize,
    ) -> EsWifiResult<SocketHandle> {
        if !self.sta.connected && !self.ap.running {
            return Err(Error::NotReady);
        }
        if proto == Proto::Udp && self.config.udp_port_collision_check {
            // The firmware (seen up to C3.5.2.3.BETA9) uses the destination port as the
            // source port, so two UDP sockets to one port get their replies mixed up.
            let clash = self.sockets.iter().any(|s| {
                s.conn
                    .as_ref()
                    .is_some_and(|c| c.proto == Proto::Udp && c.peer.port() == peer.port())
            });
            if clash {
                return Err(Error::UdpPortInUse);
            }
        }
        let Some(slot) = self
            .sockets
            .iter()
            .position(|s| s.cur_seq.is_none() && s.conn.is_none())
        else {
            error!("No sockets available! (max {})", SOCKET_COUNT);
            return Err(Error::NoFreeSockets);
        };
        let mut cmds: heapless::Vec<Command, MAX_SEQ_CMDS> = heapless::Vec::new();
        let _ = cmds.push(Command::fmt(format_args!("P0={}", slot)));
        let _ = cmds.push(Command::fmt(format_args!("P1={}", proto as u8)));
        let _ = cmds.push(Command::fmt(format_args!("P3={}", peer.ip())));
        let _ = cmds.push(Command::fmt(format_args!("P4={}", peer.port())));
        let _ = cmds.push(Command::fmt(format_args!("R1={}", max_read)));
        // Non-blocking reads.
        let _ = cmds.push(Command::text("R2=1"));
        // Allow 500 ms to send a packet.
        let _ = cmds.push(Command::text("S2=500"));
        // Do not strip CRLF from data.
        let _ = cmds.push(Command::text("R3=0"));
        // Start the client.
        let _ = cmds.push(Command::text("P6=1"));
        let id = self.submit_seq(
            cmds,
            SeqDone::ConnectDone {
                slot: slot as u8,
            },
        )?;
        let sock = &mut self.sockets[slot];
        sock.gen_ctr = sock.gen_ctr.wrapping_add(1).max(1);
        let gen = sock.gen_ctr;
        sock.cur_seq = Some(id);
        sock.conn = Some(SocketConn {
            gen,
            proto,
            peer,
            state: ConnState::Connecting,
            rx_buf: Vec::new(),
            tx_buf: Vec::new(),
            poll_with_empty: true,
            close_reported: false,
        });
        let o = peer.ip().octets();
        debug!(
            "{}.{}.{}.{}:{} assigned sock {}",
            o[0],
            o[1],
            o[2],
            o[3],
            peer.port(),
            slot
        );
        Ok(SocketHandle {
            slot: slot as u8,
            gen,
        })
    }

    /// Transmit the socket's buffered bytes: `P0` selects the slot, `S3` announces the
    /// length, the raw payload follows in the same chip-select assertion.
    fn send_data(&mut self, slot: usize) -> EsWifiResult<()> {
        let sock = &self.sockets[slot];
        let Some(conn) = sock.conn.as_ref() else {
            return Ok(());
        };
        if sock.cur_seq.is_some() || conn.tx_buf.is_empty() {
            return Ok(());
        }
        let data: Box<[u8]> = conn.tx_buf.clone().into_boxed_slice();
        let mut cmds: heapless::Vec<Command, MAX_SEQ_CMDS> = heapless::Vec::new();
        let _ = cmds.push(Command::fmt(format_args!("P0={}", slot)));
        let _ = cmds.push(Command::fmt(format_args!("S3={}\r", data.len())).cont());
        let _ = cmds.push(Command::data(data).handler(RespHandler::SendDone {
            slot: slot as u8,
        }));
        let id = self.submit_seq(cmds, SeqDone::SendSeqDone { slot: slot as u8 })?;
        self.sockets[slot].cur_seq = Some(id);
        Ok(())
    }

    /// `R0` answer for one socket. An error status is how the module reports a peer close
    /// (always `-1`, even for a clean shutdown); the close is deferred while the receive
    /// buffer still holds data.
    pub(crate) fn on_sock_read(&mut self, slot: u8, ok: bool, payload: &[u8]) -> bool {
        let mut event = None;
        let mut got_data = false;
        if let Some(conn) = self.sockets[slot as usize].conn.as_mut() {
            let handle = SocketHandle {
                slot,
                gen: conn.gen,
            };
            if !ok {
                debug!("sock {} read error", slot);
                conn.state = ConnState::PeerClosed;
                if conn.rx_buf.is_empty() {
                    conn.close_reported = true;
                    event = Some(Event::Closed { handle });
                } else {
                    // Deferred until the receive buffer has drained.
                    event = Some(Event::DataAvailable { handle });
                }
            } else {
                let p = proto::strip_async_events(payload);
                if p.len() > 2 {
                    // Drop the response's trailing CRLF.
                    conn.rx_buf.extend_from_slice(&p[..p.len() - 2]);
                    got_data = true;
                    event = Some(Event::DataAvailable { handle });
                }
            }
        }
        if got_data {
            self.poller.got_data = true;
        }
        if let Some(ev) = event {
            self.push_event(ev);
        }
        true
    }

    /// Final answer of a send transaction. A payload starting with `'-'` is a transient
    /// failure: the buffer is kept and the poll loop retries.
    pub(crate) fn on_send_done(&mut self, id: SeqId, slot: u8, ok: bool, payload: &[u8]) -> bool {
        let sock = &mut self.sockets[slot as usize];
        if sock.cur_seq != Some(id) {
            return true;
        }
        let ok = ok && payload.first() != Some(&b'-');
        if ok {
            if let Some(conn) = sock.conn.as_mut() {
                trace!("sock {} -> {} bytes", slot, conn.tx_buf.len());
                conn.tx_buf.clear();
                conn.poll_with_empty = true;
            }
        }
        true
    }

    pub(crate) fn on_send_seq_done(&mut self, id: SeqId, slot: u8) {
        let sock = &mut self.sockets[slot as usize];
        if sock.cur_seq == Some(id) {
            sock.cur_seq = None;
        }
    }

    pub(crate) fn on_connect_done(&mut self, id: SeqId, slot: u8, ok: bool) {
        let sock = &mut self.sockets[slot as usize];
        if sock.cur_seq != Some(id) {
            return;
        }
        sock.cur_seq = None;
        let Some(conn) = sock.conn.as_mut() else {
            return;
        };
        let handle = SocketHandle {
            slot,
            gen: conn.gen,
        };
        if ok {
            conn.state = ConnState::Connected;
        } else {
            // The module-side socket never started, the slot is free again.
            sock.conn = None;
        }
        self.push_event(Event::ConnectFinished { handle, ok });
        if ok {
            self.poller.request = Some(self.config.data_poll_min_ms);
        }
    }

    pub(crate) fn on_close_done(&mut self, id: SeqId, slot: u8) {
        let sock = &mut self.sockets[slot as usize];
        if sock.cur_seq == Some(id) {
            sock.cur_seq = None;
        }
    }

    pub(crate) fn on_data_poll_done(&mut self, id: SeqId) {
        if self.poller.cur_seq != Some(id) {
            return;
        }
        self.poller.cur_seq = None;
        let interval = next_backoff(
            self.poller.interval_ms,
            self.poller.got_data,
            self.config.data_poll_min_ms,
            self.config.data_poll_max_ms,
        );
        self.poller.request = Some(interval);
    }

    /// Poller housekeeping, run from the driver poll: apply requested intervals, fire the
    /// elapsed deadline, and re-arm if the poller went dormant while sockets still need
    /// polling.
    pub(crate) fn data_poll_tick(&mut self, now: u32) -> EsWifiResult<()> {
        if let Some(req) = self.poller.request.take() {
            self.sched_data_poll(now, req);
        }
        if let Some(at) = self.poller.next_at {
            if reached(now, at) {
                self.poller.next_at = None;
                self.try_data_poll();
            }
        }
        if self.poller.next_at.is_none()
            && self.poller.cur_seq.is_none()
            && self.has_pollable_socket()
        {
            self.sched_data_poll(now, self.config.data_poll_min_ms);
        }
        Ok(())
    }

    fn sched_data_poll(&mut self, now: u32, interval: u32) {
        if self.poller.cur_seq.is_some() {
            return;
        }
        let mut interval = interval;
        if interval == 0 {
            self.poller.next_at = None;
            if self.try_data_poll() {
                self.poller.interval_ms = 0;
                return;
            }
            interval = self.config.data_poll_min_ms;
        }
        if self.poller.next_at.is_none() || interval != self.poller.interval_ms {
            self.poller.next_at = Some(now.wrapping_add(interval));
        }
        self.poller.interval_ms = interval;
    }

    fn has_pollable_socket(&self) -> bool {
        self.sockets.iter().any(|s| {
            s.conn
                .as_ref()
                .is_some_and(|c| c.state == ConnState::Connected && c.rx_buf.is_empty())
        })
    }

    /// Build and submit one compound read poll: a `P0`/`R0` pair per connected socket with
    /// an empty receive buffer. Returns whether a poll went out.
    fn try_data_poll(&mut self) -> bool {
        if self.poller.cur_seq.is_some() {
            return false;
        }
        let mut cmds: heapless::Vec<Command, MAX_SEQ_CMDS> = heapless::Vec::new();
        for (i, sock) in self.sockets.iter().enumerate() {
            let pollable = sock
                .conn
                .as_ref()
                .is_some_and(|c| c.state == ConnState::Connected && c.rx_buf.is_empty());
            if !pollable {
                continue;
            }
            let _ = cmds.push(Command::fmt(format_args!("P0={}", i)));
            let _ = cmds.push(Command::text("R0").handler(RespHandler::SockRead {
                slot: i as u8,
            }));
        }
        self.poller.got_data = false;
        if cmds.is_empty() {
            return false;
        }
        match self.submit_seq(cmds, SeqDone::DataPollDone) {
            Ok(id) => {
                self.poller.cur_seq = Some(id);
                true
            }
            Err(_) => false,
        }
    }

    /// Per-socket work on every driver poll: deliver writability once the transmit buffer
    /// has drained, and retry a send that previously failed.
    pub(crate) fn socket_side_work(&mut self, _now: u32) -> EsWifiResult<()> {
        for slot in 0..SOCKET_COUNT {
            let mut writable = None;
            if let Some(conn) = self.sockets[slot].conn.as_mut() {
                if conn.state == ConnState::Connected
                    && conn.tx_buf.is_empty()
                    && conn.poll_with_empty
                {
                    conn.poll_with_empty = false;
                    writable = Some(SocketHandle {
                        slot: slot as u8,
                        gen: conn.gen,
                    });
                }
            }
            if let Some(handle) = writable {
                self.push_event(Event::Writable { handle });
            }
            let retry = {
                let sock = &self.sockets[slot];
                sock.cur_seq.is_none()
                    && sock
                        .conn
                        .as_ref()
                        .is_some_and(|c| c.state == ConnState::Connected && !c.tx_buf.is_empty())
            };
            if retry {
                // Queue pressure just postpones the retry to the next poll.
                let _ = self.send_data(slot);
            }
        }
        Ok(())
    }

    /// Tear every socket down at once, used on reset and link loss. In-flight sequences are
    /// disowned rather than aborted; their late completions fail the identity check and are
    /// ignored.
    pub(crate) fn force_close_all(&mut self) {
        let mut closed: heapless::Vec<SocketHandle, SOCKET_COUNT> = heapless::Vec::new();
        for (slot, sock) in self.sockets.iter_mut().enumerate() {
            sock.cur_seq = None;
            if let Some(conn) = sock.conn.take() {
                if !conn.close_reported {
                    let _ = closed.push(SocketHandle {
                        slot: slot as u8,
                        gen: conn.gen,
                    });
                }
            }
        }
        for handle in closed {
            self.push_event(Event::Closed { handle });
        }
        self.poller.cur_seq = None;
        self.poller.next_at = None;
        self.poller.request = None;
        self.poller.interval_ms = 0;
    }
}

fn max_io(proto: Proto) -> usize {
    match proto {
        Proto::Tcp => MAX_TCP_IO_SIZE,
        Proto::Udp => MAX_UDP_IO_SIZE,
    }
}
