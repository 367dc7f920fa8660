//! The driver context and its phase machine.
//!
//! [`EsWifi`] owns the bus, the control pins and all protocol state. It never blocks and never
//! sleeps: [`EsWifi::poll`] runs the phase machine as far as the module lets it and returns.
//! See the crate docs for the phase model.

use alloc::vec::Vec;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal::spi::SpiBus;
use heapless::Deque;

use crate::cmd::{
    Command, RespHandler, SeqDone, SeqId, SeqQueue, Sequence, DEFAULT_CMD_TIMEOUT_SECS,
    MAX_SEQ_CMDS,
};
use crate::netif::{DataPoller, Socket};
use crate::proto;
use crate::sync::DrdySignal;
use crate::wifi::{ApState, StaState, WifiPollState};
use crate::{Config, Error, EsWifiResult, Event, SOCKET_COUNT};

/// Module boot time after releasing reset, before the first prompt is read.
const STARTUP_DELAY_MS: u32 = 500;
/// Period of the housekeeping ticker (command timeouts, idle countdown, status poll).
const TICK_MS: u32 = 1000;
/// Seconds of inactivity in [`Mode::Idle`] before the module is powered down.
const IDLE_TIMEOUT_SECS: i8 = 5;
/// Capacity of the event queue drained by [`EsWifi::next_event`].
const EVENT_QUEUE_DEPTH: usize = 32;

/// Protocol phase, as seen by [`EsWifi::phase`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Phase {
    /// Module held in (or just released from) reset. Nothing moves on the bus.
    Reset,
    /// Waiting for the boot prompt.
    Init,
    /// Ready to transmit the next command.
    Cmd,
    /// A command is out, waiting for its response.
    Resp,
}

/// What the module is configured as.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Mode {
    Idle,
    Sta,
    Ap,
}

/// The command currently awaiting a response.
#[derive(Clone, Copy)]
struct InFlight {
    id: SeqId,
    cmd_idx: usize,
}

/// Driver for an eS-WiFi module. See the crate docs for wiring and usage.
pub struct EsWifi<'s, SPI, CS, RST, B0, WK, RDY, D> {
    spi: SPI,
    cs: CS,
    rst: Option<RST>,
    boot0: Option<B0>,
    wakeup: Option<WK>,
    drdy_pin: RDY,
    delay: D,
    drdy: &'s DrdySignal,
    pub(crate) config: Config,

    pub(crate) phase: Phase,
    pub(crate) mode: Mode,
    pub(crate) queue: SeqQueue,
    in_flight: Option<InFlight>,
    startup_deadline: Option<u32>,
    next_tick_at: Option<u32>,
    idle_timeout: i8,
    cmd_timeout: u16,

    pub(crate) mac: Option<[u8; 6]>,
    pub(crate) sta: StaState,
    pub(crate) ap: ApState,
    pub(crate) wifi_poll: WifiPollState,
    pub(crate) sockets: [Socket; SOCKET_COUNT],
    pub(crate) poller: DataPoller,
    pub(crate) events: Deque<Event, EVENT_QUEUE_DEPTH>,
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
    /// Create a driver. Pass [`None`](crate::NoPin) for control pins your board does not wire
    /// up; without a reset pin, resets fall back to the module's soft-reset command.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        spi: SPI,
        cs: CS,
        rst: Option<RST>,
        boot0: Option<B0>,
        wakeup: Option<WK>,
        drdy_pin: RDY,
        delay: D,
        drdy: &'s DrdySignal,
        config: Config,
    ) -> Self {
        EsWifi {
            spi,
            cs,
            rst,
            boot0,
            wakeup,
            drdy_pin,
            delay,
            drdy,
            config,
            phase: Phase::Reset,
            mode: Mode::Idle,
            queue: SeqQueue::default(),
            in_flight: None,
            startup_deadline: None,
            next_tick_at: None,
            idle_timeout: 0,
            cmd_timeout: 0,
            mac: None,
            sta: StaState::default(),
            ap: ApState::default(),
            wifi_poll: WifiPollState::default(),
            sockets: Default::default(),
            poller: DataPoller::default(),
            events: Deque::new(),
        }
    }

    /// Drive the control pins to their resting levels and boot the module.
    pub fn start(&mut self, now: u32) -> EsWifiResult<()> {
        self.cs.set_high().map_err(|_| Error::Pin)?;
        if let Some(rst) = self.rst.as_mut() {
            rst.set_high().map_err(|_| Error::Pin)?;
        }
        if let Some(boot0) = self.boot0.as_mut() {
            // Main flash boot.
            boot0.set_low().map_err(|_| Error::Pin)?;
        }
        if let Some(wakeup) = self.wakeup.as_mut() {
            wakeup.set_high().map_err(|_| Error::Pin)?;
        }
        self.reset(now, false);
        Ok(())
    }

    /// Reset the module and all protocol state. Every queued sequence fails, every socket is
    /// force-closed. With `hold` the module is left down until the next `reset(false)`
    /// (a setup call or [`start`](Self::start) issues one).
    pub(crate) fn reset(&mut self, now: u32, hold: bool) {
        self.drdy.reset();
        if self.rst.is_some() {
            debug!("Resetting via pin...");
            if let Some(rst) = self.rst.as_mut() {
                let _ = rst.set_low();
            }
        } else {
            // Best effort; may take a few attempts depending on the current phase.
            debug!("Sending soft reset request...");
            self.send_soft_reset();
        }
        let _ = self.cs.set_high();
        self.next_tick_at = None;
        self.startup_deadline = None;
        self.in_flight = None;
        for seq in self.queue.drain() {
            self.finish_seq(seq, false);
        }
        let was_sta = self.mode == Mode::Sta;
        self.set_sta_status(false, was_sta);
        self.force_close_all();
        self.idle_timeout = 0;
        self.cmd_timeout = 0;
        self.mode = Mode::Idle;
        self.sta = StaState::default();
        self.ap = ApState::default();
        self.wifi_poll = WifiPollState::default();
        self.poller = DataPoller::default();
        self.phase = Phase::Reset;
        if !hold {
            self.startup_deadline = Some(now.wrapping_add(STARTUP_DELAY_MS));
            if let Some(rst) = self.rst.as_mut() {
                let _ = rst.set_high();
            }
            let _ = self.submit_seq(Self::init_seq(), SeqDone::None);
        } else if self.rst.is_some() {
            debug!("Keeping the module in reset");
        }
    }

    /// Hold the module in reset and tear down all state.
    pub fn shutdown(&mut self, now: u32) {
        self.reset(now, true);
    }

    fn init_seq() -> heapless::Vec<Command, MAX_SEQ_CMDS> {
        let mut cmds = heapless::Vec::new();
        // A dummy command first, to flush whatever a half-entered line left behind.
        let _ = cmds.push(Command::text("---").handler(RespHandler::IgnoreError));
        let _ = cmds.push(Command::text("I?").handler(RespHandler::Info));
        let _ = cmds.push(Command::text("Z5").handler(RespHandler::Mac));
        // Machine-readable messages.
        let _ = cmds.push(Command::text("MT=1"));
        // TCP keep-alives, 20 s.
        let _ = cmds.push(Command::text("PK=1,20000"));
        cmds
    }

    /// Run the phase machine. Call at least once per scheduler tick and after every DRDY
    /// interrupt. Time is a free-running millisecond counter; wrapping is fine.
    pub fn poll(&mut self, now: u32) -> EsWifiResult<()> {
        // The flag is only a wakeup hint, the pin level is authoritative.
        let _ = self.drdy.take();
        if let Some(at) = self.next_tick_at {
            if reached(now, at) {
                self.next_tick_at = Some(now.wrapping_add(TICK_MS));
                self.tick(now);
            }
        }
        loop {
            self.data_poll_tick(now)?;
            if !self.step(now)? {
                break;
            }
        }
        self.socket_side_work(now)?;
        Ok(())
    }

    /// Next pending notification, oldest first.
    pub fn next_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Module MAC address, once the boot sequence has read it.
    pub fn mac(&self) -> Option<[u8; 6]> {
        self.mac
    }

    fn tick(&mut self, now: u32) {
        if self.idle_timeout > 0 {
            self.idle_timeout -= 1;
        }
        if self.cmd_timeout > 0 {
            self.cmd_timeout -= 1;
        }
        self.wifi_poll_tick(now);
    }

    fn step(&mut self, now: u32) -> EsWifiResult<bool> {
        match self.phase {
            Phase::Reset => {
                if let Some(at) = self.startup_deadline {
                    if reached(now, at) {
                        self.startup_deadline = None;
                        self.phase = Phase::Init;
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Phase::Init => {
                let mut rxb = Vec::new();
                let got = self.rx_data(now, &mut rxb)?;
                if self.phase == Phase::Reset {
                    return Ok(true);
                }
                if !got {
                    return Ok(false);
                }
                // We must have received a prompt by now. If not, keep resetting.
                if rxb != [proto::LINE_SEP, proto::PROMPT].concat() {
                    error!("Wrong prompt");
                    self.reset(now, true);
                    return Ok(true);
                }
                self.phase = Phase::Cmd;
                self.idle_timeout = IDLE_TIMEOUT_SECS;
                self.next_tick_at = Some(now.wrapping_add(TICK_MS));
                debug!("Module is up");
                Ok(true)
            }
            Phase::Cmd => {
                // Here DRDY means "ready for a command".
                if !self.drdy_pin.is_high().map_err(|_| Error::Pin)? {
                    return Ok(false);
                }
                if self.queue.head().is_none() {
                    if self.mode == Mode::Idle && self.idle_timeout <= 0 && self.rst.is_some() {
                        self.reset(now, true);
                        return Ok(true);
                    }
                    return Ok(false);
                }
                self.idle_timeout = IDLE_TIMEOUT_SECS;
                // The sequence comes off the queue while its bytes go out, so that the bus
                // writes don't alias the queue borrow.
                let Some(mut seq) = self.queue.pop_head() else {
                    return Ok(false);
                };
                let seq_id = seq.id;
                let sent = self.transmit(&mut seq);
                self.queue.restore_head(seq);
                match sent {
                    Ok(cmd_idx) => {
                        self.in_flight = Some(InFlight {
                            id: seq_id,
                            cmd_idx,
                        });
                        self.phase = Phase::Resp;
                        Ok(true)
                    }
                    Err(e) => {
                        error!("TX failed");
                        let _ = self.cs.set_high();
                        self.abort_seq(seq_id);
                        Err(e)
                    }
                }
            }
            Phase::Resp => {
                let mut rxb = Vec::new();
                let got = self.rx_data(now, &mut rxb)?;
                if self.phase == Phase::Reset {
                    return Ok(true);
                }
                if !got {
                    if self.in_flight.is_some() && self.cmd_timeout == 0 {
                        error!("No response to command");
                        self.reset(now, true);
                        return Ok(true);
                    }
                    return Ok(false);
                }
                let Some(inf) = self.in_flight else {
                    // The sequence was aborted, the response is of no interest.
                    self.phase = Phase::Cmd;
                    return Ok(true);
                };
                self.in_flight = None;
                self.phase = Phase::Cmd;
                match proto::parse_response(&rxb) {
                    Err(proto::Unterminated) => {
                        error!("Unterminated response");
                        self.reset(now, true);
                    }
                    Ok(resp) => self.dispatch_response(inf, resp.ok, resp.payload),
                }
                Ok(true)
            }
        }
    }

    fn dispatch_response(&mut self, inf: InFlight, status_ok: bool, payload: &[u8]) {
        let Some(head) = self.queue.head() else {
            return;
        };
        if head.id != inf.id {
            return;
        }
        let handler = head.cmds[inf.cmd_idx].handler;
        let last_cmd = inf.cmd_idx + 1 >= head.cmds.len();
        let ok = self.run_handler(inf.id, handler, status_ok, payload);
        if ok {
            if last_cmd {
                if let Some(seq) = self.queue.pop_head() {
                    self.finish_seq(seq, true);
                }
            } else if let Some(head) = self.queue.head_mut() {
                head.cur = inf.cmd_idx + 1;
            }
        } else {
            error!(
                "Error response: {}",
                core::str::from_utf8(payload).unwrap_or("<binary>")
            );
            if let Some(seq) = self.queue.take(inf.id) {
                self.finish_seq(seq, false);
            }
        }
    }

    /// Per-command answer dispatch. Returns the effective success of the command; `false`
    /// aborts the rest of the sequence.
    fn run_handler(&mut self, id: SeqId, handler: RespHandler, ok: bool, payload: &[u8]) -> bool {
        match handler {
            RespHandler::None => ok,
            RespHandler::IgnoreError => true,
            RespHandler::Info => self.on_info(ok, payload),
            RespHandler::Mac => self.on_mac(ok, payload),
            RespHandler::StaConnecting => self.on_sta_connecting(ok),
            RespHandler::StaRssi => self.on_rssi(ok, payload),
            RespHandler::StaInfo => self.on_sta_info(ok, payload),
            RespHandler::StaStatus => self.on_sta_status(ok, payload),
            RespHandler::StaDisconnect => self.on_sta_disconnected(ok),
            RespHandler::ApStarting => self.on_ap_starting(ok),
            RespHandler::ApStarted => self.on_ap_started(ok),
            RespHandler::ApClients => self.on_ap_clients(ok, payload),
            RespHandler::SockRead { slot } => self.on_sock_read(slot, ok, payload),
            RespHandler::SendDone { slot } => self.on_send_done(id, slot, ok, payload),
        }
    }

    /// Sequence terminal dispatch. Fires exactly once per sequence, `ok = false` when the
    /// sequence was aborted or any of its commands failed.
    pub(crate) fn finish_seq(&mut self, seq: Sequence, ok: bool) {
        match seq.done {
            SeqDone::None => {}
            SeqDone::ConnectDone { slot } => self.on_connect_done(seq.id, slot, ok),
            SeqDone::CloseDone { slot } => self.on_close_done(seq.id, slot),
            SeqDone::SendSeqDone { slot } => self.on_send_seq_done(seq.id, slot),
            SeqDone::DataPollDone => self.on_data_poll_done(seq.id),
            SeqDone::WifiPollDone => self.on_wifi_poll_done(ok),
        }
    }

    pub(crate) fn submit_seq(
        &mut self,
        cmds: heapless::Vec<Command, MAX_SEQ_CMDS>,
        done: SeqDone,
    ) -> EsWifiResult<SeqId> {
        self.queue.submit(cmds, done)
    }

    /// Cancel a sequence wherever it is. Its terminal handler fires with `ok = false`; if its
    /// command is on the wire, the response is read and discarded.
    pub(crate) fn abort_seq(&mut self, id: SeqId) {
        if self.in_flight.map(|inf| inf.id) == Some(id) {
            self.in_flight = None;
        }
        if let Some(seq) = self.queue.take(id) {
            self.finish_seq(seq, false);
        }
    }

    /// Transmit the head sequence's next command, concatenating continuation commands into one
    /// chip-select assertion. Returns the index of the command that owns the answer.
    fn transmit(&mut self, seq: &mut Sequence) -> EsWifiResult<usize> {
        let mut idx = seq.cur;
        let mut tot_len = 0usize;
        let mut carry = None;
        self.cs.set_low().map_err(|_| Error::Pin)?;
        loop {
            let cmd = &seq.cmds[idx];
            match &cmd.payload {
                crate::cmd::CmdPayload::Text(s) => debug!("=> {}", s.as_str()),
                crate::cmd::CmdPayload::Data(d) => debug!("=> ({} bytes)", d.len()),
            }
            let spi = &mut self.spi;
            proto::frame_command(
                cmd.bytes(),
                cmd.is_text(),
                cmd.cont,
                &mut tot_len,
                &mut carry,
                |chunk| spi.write(chunk),
            )
            .map_err(|_| Error::Bus)?;
            if !cmd.cont || idx + 1 >= seq.cmds.len() {
                break;
            }
            idx += 1;
        }
        self.cs.set_high().map_err(|_| Error::Pin)?;
        seq.cur = idx;
        self.cmd_timeout = seq.cmds[idx].timeout.unwrap_or(DEFAULT_CMD_TIMEOUT_SECS);
        Ok(idx)
    }

    /// Read one response while DRDY stays asserted. Reads are always two-byte words, swapped
    /// back to host order and trimmed of pad bytes. More than [`proto::MAX_RESPONSE_LEN`]
    /// bytes means framing is lost and forces a held reset.
    fn rx_data(&mut self, now: u32, rxb: &mut Vec<u8>) -> EsWifiResult<bool> {
        if !self.drdy_pin.is_high().map_err(|_| Error::Pin)? {
            return Ok(false);
        }
        self.cs.set_low().map_err(|_| Error::Pin)?;
        self.delay.delay_us(15);
        while self.drdy_pin.is_high().map_err(|_| Error::Pin)? {
            let mut word = [proto::PAD_OUT, proto::PAD_OUT];
            if self.spi.transfer_in_place(&mut word).is_err() {
                break;
            }
            rxb.push(word[1]);
            rxb.push(word[0]);
            if rxb.len() > proto::MAX_RESPONSE_LEN {
                error!("Runaway RX");
                self.reset(now, true);
                return Ok(false);
            }
        }
        self.cs.set_high().map_err(|_| Error::Pin)?;
        proto::trim_padding(rxb);
        Ok(!rxb.is_empty())
    }

    /// Clock out a soft-reset command without going through the queue. Used when no reset pin
    /// is fitted; errors are ignored, the startup prompt read decides whether it worked.
    fn send_soft_reset(&mut self) {
        let _ = self.cs.set_low();
        let mut tot_len = 0usize;
        let mut carry = None;
        let spi = &mut self.spi;
        let _ = proto::frame_command(b"ZR", true, false, &mut tot_len, &mut carry, |chunk| {
            spi.write(chunk)
        });
        let _ = self.cs.set_high();
    }

    pub(crate) fn push_event(&mut self, ev: Event) {
        if self.events.is_full() {
            warn!("Event queue overflow");
            let _ = self.events.pop_front();
        }
        let _ = self.events.push_back(ev);
    }
}

/// `true` once `now` has passed `deadline`, on the wrapping millisecond clock.
pub(crate) fn reached(now: u32, deadline: u32) -> bool {
    now.wrapping_sub(deadline) < u32::MAX / 2
}
