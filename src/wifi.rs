//! Station and access-point control plane.
//!
//! Everything here turns into command sequences for the executor: setup writes the module's
//! Wi-Fi profile, connect starts a join, and a 1 Hz status poll keeps the link state and the
//! access point's client table fresh. Status changes surface as [`Event`]s.

use core::net::Ipv4Addr;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal::spi::SpiBus;

use crate::cmd::{Command, RespHandler, SeqDone, MAX_SEQ_CMDS};
use crate::driver::{EsWifi, Mode, Phase};
use crate::proto;
use crate::{Error, EsWifiResult, Event, AP_MAX_CLIENTS};

/// The module takes SSIDs up to 32 and passphrases up to 64 characters.
const MAX_SSID_LEN: usize = 32;
const MAX_PASS_LEN: usize = 64;

/// Every how many status polls the slow RSSI refresh (`CR`, ~300 ms) is included.
const LONG_POLL_EVERY: u8 = 16;

/// Station profile. With `ip` and `netmask` unset the module uses DHCP.
#[derive(Clone, Copy, Debug)]
pub struct StaConfig<'a> {
    pub ssid: &'a str,
    /// `None` for an open network.
    pub pass: Option<&'a str>,
    pub ip: Option<Ipv4Addr>,
    pub netmask: Option<Ipv4Addr>,
    pub gw: Option<Ipv4Addr>,
}

/// Access-point profile. The netmask is fixed by the module firmware.
#[derive(Clone, Copy, Debug)]
pub struct ApConfig<'a> {
    pub ssid: &'a str,
    /// `None` for an open network.
    pub pass: Option<&'a str>,
    /// 0 selects the channel automatically.
    pub channel: u8,
    /// Clamped to [`AP_MAX_CLIENTS`].
    pub max_clients: u8,
    pub ip: Ipv4Addr,
}

/// Interface addresses, all zeros until known.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IpInfo {
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gw: Ipv4Addr,
}

impl Default for IpInfo {
    fn default() -> Self {
        IpInfo {
            ip: Ipv4Addr::UNSPECIFIED,
            netmask: Ipv4Addr::UNSPECIFIED,
            gw: Ipv4Addr::UNSPECIFIED,
        }
    }
}

/// One client of our access point.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClientInfo {
    pub mac: [u8; 6],
    pub rssi: i32,
    /// Poll generation this client was last seen in; 0 marks a free record.
    pub(crate) gen: u16,
}

#[derive(Debug, Default)]
pub(crate) struct StaState {
    pub connected: bool,
    pub rssi: i32,
    pub ip_info: IpInfo,
}

#[derive(Debug, Default)]
pub(crate) struct ApState {
    pub running: bool,
    pub ip_info: IpInfo,
    pub clients: [ClientInfo; AP_MAX_CLIENTS],
}

#[derive(Debug, Default)]
pub(crate) struct WifiPollState {
    pub enabled: bool,
    pub in_progress: bool,
    pub long_ctr: u8,
}

/// Interface settings parsed out of a `C?` answer.
#[derive(Debug, Default, PartialEq, Eq)]
struct ConnInfo {
    connected: bool,
    ip_info: IpInfo,
    dns_unset: bool,
}

/// `C?` answers one line of 15 comma-separated fields; fields 6..9 are the IP, netmask and
/// gateway, field 9 the DNS server, field 15 the connection flag.
fn parse_conn_info(payload: &[u8]) -> Option<ConnInfo> {
    let f: heapless::Vec<&[u8], 16> = proto::fields(proto::trim(payload)).take(16).collect();
    if f.len() < 15 {
        return None;
    }
    let mut info = ConnInfo {
        connected: f[14] == b"1",
        ..Default::default()
    };
    if info.connected {
        if let (Some(ip), Some(nm), Some(gw)) = (
            proto::parse_ipv4(f[5]),
            proto::parse_ipv4(f[6]),
            proto::parse_ipv4(f[7]),
        ) {
            info.ip_info = IpInfo {
                ip,
                netmask: nm,
                gw,
            };
        }
        // FW versions prior to 3.5.2.4 do not set the DNS server field.
        info.dns_unset = f[8].len() > 3 && f[8].starts_with(b"255");
    }
    Some(info)
}

/// One line of an `AR` client listing: `<index>,<mac>,<rssi>`. A non-negative RSSI marks a
/// stale record and is skipped.
fn parse_client_line(line: &[u8]) -> Option<([u8; 6], i32)> {
    let mut f = proto::fields(line);
    let _idx = f.next()?;
    let mac = proto::parse_mac(f.next()?)?;
    let rssi = proto::parse_i32(f.next()?);
    if rssi >= 0 {
        return None;
    }
    Some((mac, rssi))
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
    /// Write the station profile to the module and switch it to station mode. Resets the
    /// module first unless it is idle and ready for commands.
    pub fn sta_setup(&mut self, cfg: &StaConfig<'_>, now: u32) -> EsWifiResult<()> {
        if cfg.ssid.len() > MAX_SSID_LEN || cfg.pass.is_some_and(|p| p.len() > MAX_PASS_LEN) {
            return Err(Error::TooLong);
        }
        let static_ip = cfg.ip.is_some() && cfg.netmask.is_some();
        let mut cmds: heapless::Vec<Command, MAX_SEQ_CMDS> = heapless::Vec::new();
        // Disable STA and AP, if enabled, to start with a clean slate.
        let _ = cmds.push(Command::text("CD").handler(RespHandler::IgnoreError));
        let _ = cmds.push(Command::text("AE").handler(RespHandler::IgnoreError));
        let _ = cmds.push(Command::fmt(format_args!("C1={}", cfg.ssid)));
        let _ = cmds.push(Command::fmt(format_args!(
            "C2={}",
            cfg.pass.unwrap_or_default()
        )));
        // Security: 0 = open, 4 = WPA+WPA2.
        let _ = cmds.push(Command::text(if cfg.pass.is_some() {
            "C3=4"
        } else {
            "C3=0"
        }));
        let _ = cmds.push(Command::text(if static_ip { "C4=0" } else { "C4=1" }));
        let unspec = Ipv4Addr::UNSPECIFIED;
        let _ = cmds.push(Command::fmt(format_args!("C6={}", cfg.ip.unwrap_or(unspec))));
        let _ = cmds.push(Command::fmt(format_args!(
            "C7={}",
            cfg.netmask.unwrap_or(unspec)
        )));
        let _ = cmds.push(Command::fmt(format_args!("C8={}", cfg.gw.unwrap_or(unspec))));
        // IPv4 only.
        let _ = cmds.push(Command::text("C5=0"));
        // Join retries are left to the caller, try once.
        let _ = cmds.push(Command::text("CB=1"));
        self.submit_setup_seq(cmds, now)?;
        self.mode = Mode::Sta;
        Ok(())
    }

    /// Join the configured network. Progress is reported through [`Event::StaConnected`] /
    /// [`Event::StaIpAcquired`]; the 1 Hz status poll keeps watching the link afterwards.
    pub fn sta_connect(&mut self) -> EsWifiResult<()> {
        if self.mode != Mode::Sta {
            return Err(Error::InvalidState);
        }
        let mut cmds: heapless::Vec<Command, MAX_SEQ_CMDS> = heapless::Vec::new();
        let _ = cmds.push(Command::text("C?").handler(RespHandler::StaConnecting));
        // An error from C0 must not abort the sequence: CS will report the failed join and
        // the caller decides whether to retry.
        let _ = cmds.push(
            Command::text("C0")
                .handler(RespHandler::IgnoreError)
                .timeout_secs(20),
        );
        let _ = cmds.push(Command::text("CR").handler(RespHandler::StaRssi));
        let _ = cmds.push(Command::text("C?").handler(RespHandler::StaInfo));
        self.submit_seq(cmds, SeqDone::None)?;
        self.wifi_poll = WifiPollState {
            enabled: true,
            in_progress: false,
            long_ctr: 0,
        };
        Ok(())
    }

    /// Leave the network. The status poll stops; a later [`sta_connect`](Self::sta_connect)
    /// restarts it.
    pub fn sta_disconnect(&mut self) -> EsWifiResult<()> {
        if self.mode != Mode::Sta {
            return Err(Error::InvalidState);
        }
        self.wifi_poll.enabled = false;
        let mut cmds: heapless::Vec<Command, MAX_SEQ_CMDS> = heapless::Vec::new();
        let _ = cmds.push(Command::text("CD").handler(RespHandler::StaDisconnect));
        self.submit_seq(cmds, SeqDone::None)?;
        Ok(())
    }

    /// Tear station mode down and power the module off.
    pub fn sta_disable(&mut self, now: u32) {
        if self.mode == Mode::Sta {
            self.reset(now, true);
        }
    }

    /// Configure and start an access point.
    pub fn ap_setup(&mut self, cfg: &ApConfig<'_>, now: u32) -> EsWifiResult<()> {
        if cfg.ssid.len() > MAX_SSID_LEN || cfg.pass.is_some_and(|p| p.len() > MAX_PASS_LEN) {
            return Err(Error::TooLong);
        }
        let max_clients = (cfg.max_clients as usize).min(AP_MAX_CLIENTS);
        let mut cmds: heapless::Vec<Command, MAX_SEQ_CMDS> = heapless::Vec::new();
        // Disable STA and AP, if enabled, to start with a clean slate.
        let _ = cmds.push(Command::text("CD").handler(RespHandler::IgnoreError));
        let _ = cmds.push(Command::text("AE").handler(RespHandler::IgnoreError));
        let _ = cmds.push(Command::fmt(format_args!("AS=0,{}", cfg.ssid)));
        // Security: 0 = open, 4 = WPA+WPA2.
        let _ = cmds.push(Command::text(if cfg.pass.is_some() {
            "A1=4"
        } else {
            "A1=0"
        }));
        let _ = cmds.push(Command::fmt(format_args!(
            "A2={}",
            cfg.pass.unwrap_or_default()
        )));
        let _ = cmds.push(Command::fmt(format_args!("AC={}", cfg.channel)));
        let _ = cmds.push(Command::fmt(format_args!("AT={}", max_clients)));
        // The AP's own address. The netmask is not configurable.
        let _ = cmds.push(Command::fmt(format_args!("Z6={}", cfg.ip)));
        // No power saving.
        let _ = cmds.push(Command::text("ZP=0").handler(RespHandler::ApStarting));
        let _ = cmds.push(
            Command::text("AD")
                .handler(RespHandler::ApStarted)
                .timeout_secs(10),
        );
        self.submit_setup_seq(cmds, now)?;
        self.mode = Mode::Ap;
        self.ap.ip_info = IpInfo {
            ip: cfg.ip,
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            gw: cfg.ip,
        };
        self.wifi_poll = WifiPollState {
            enabled: true,
            in_progress: false,
            long_ctr: 0,
        };
        Ok(())
    }

    /// Stop the access point and power the module off.
    pub fn ap_disable(&mut self, now: u32) {
        if self.mode == Mode::Ap {
            self.reset(now, true);
        }
    }

    pub fn sta_connected(&self) -> bool {
        self.sta.connected
    }

    /// Last known signal strength in dBm, 0 when unknown.
    pub fn sta_rssi(&self) -> i32 {
        self.sta.rssi
    }

    pub fn sta_ip_info(&self) -> IpInfo {
        self.sta.ip_info
    }

    pub fn ap_running(&self) -> bool {
        self.ap.running
    }

    pub fn ap_ip_info(&self) -> IpInfo {
        self.ap.ip_info
    }

    /// Clients currently associated with our access point.
    pub fn ap_clients(&self) -> impl Iterator<Item = &ClientInfo> {
        self.ap.clients.iter().filter(|c| c.gen != 0)
    }

    /// Setup sequences need an idle module; anything else goes through a reset first.
    fn submit_setup_seq(
        &mut self,
        cmds: heapless::Vec<Command, MAX_SEQ_CMDS>,
        now: u32,
    ) -> EsWifiResult<()> {
        if !(self.phase == Phase::Cmd && self.mode == Mode::Idle) {
            self.reset(now, false);
        }
        self.submit_seq(cmds, SeqDone::None)?;
        Ok(())
    }

    /// 1 Hz link supervision, called from the driver tick. In station mode the quick `CS`
    /// check runs every second and the slow RSSI refresh every [`LONG_POLL_EVERY`] seconds;
    /// in AP mode the client table is listed instead. `MR` drains the module's pending
    /// asynchronous messages. At most one status poll is ever in flight.
    pub(crate) fn wifi_poll_tick(&mut self, _now: u32) {
        if !self.wifi_poll.enabled || self.wifi_poll.in_progress {
            return;
        }
        let mut cmds: heapless::Vec<Command, MAX_SEQ_CMDS> = heapless::Vec::new();
        match self.mode {
            Mode::Ap => {
                let _ = cmds.push(Command::text("AR").handler(RespHandler::ApClients));
                let _ = cmds.push(Command::text("MR"));
            }
            Mode::Sta => {
                let _ = cmds.push(Command::text("CS").handler(RespHandler::StaStatus));
                self.wifi_poll.long_ctr = self.wifi_poll.long_ctr.wrapping_add(1);
                if self.wifi_poll.long_ctr % LONG_POLL_EVERY == 0 {
                    let _ = cmds.push(Command::text("CR").handler(RespHandler::StaRssi));
                }
                let _ = cmds.push(Command::text("MR"));
            }
            Mode::Idle => return,
        }
        self.wifi_poll.in_progress = self.submit_seq(cmds, SeqDone::WifiPollDone).is_ok();
    }

    pub(crate) fn on_wifi_poll_done(&mut self, _ok: bool) {
        self.wifi_poll.in_progress = false;
    }

    /// Link state edge detector. Events fire on changes only, unless forced; a lost link
    /// force-closes all sockets.
    pub(crate) fn set_sta_status(&mut self, connected: bool, force: bool) {
        if connected == self.sta.connected && !force {
            return;
        }
        self.sta.connected = connected;
        if connected {
            self.push_event(Event::StaConnected);
            if self.sta.ip_info.ip != Ipv4Addr::UNSPECIFIED {
                self.push_event(Event::StaIpAcquired);
            }
        } else {
            self.push_event(Event::StaDisconnected);
            self.force_close_all();
        }
    }

    /// `I?` product banner.
    pub(crate) fn on_info(&mut self, ok: bool, payload: &[u8]) -> bool {
        if !ok {
            return false;
        }
        let f: heapless::Vec<&[u8], 8> = proto::fields(proto::trim(payload)).take(8).collect();
        if f.len() >= 7 {
            info!(
                "{} {} fw {}",
                core::str::from_utf8(f[6]).unwrap_or(""),
                core::str::from_utf8(f[0]).unwrap_or(""),
                core::str::from_utf8(f[1]).unwrap_or("")
            );
        }
        true
    }

    /// `Z5` module MAC.
    pub(crate) fn on_mac(&mut self, ok: bool, payload: &[u8]) -> bool {
        if !ok {
            return false;
        }
        let s = proto::trim(payload);
        match proto::parse_mac(s) {
            Some(mac) => {
                info!("MAC: {}", core::str::from_utf8(s).unwrap_or(""));
                self.mac = Some(mac);
                true
            }
            None => false,
        }
    }

    pub(crate) fn on_sta_connecting(&mut self, _ok: bool) -> bool {
        info!("STA connecting...");
        true
    }

    /// `CR` signal strength.
    pub(crate) fn on_rssi(&mut self, ok: bool, payload: &[u8]) -> bool {
        self.sta.rssi = if ok { proto::parse_i32(payload) } else { 0 };
        true
    }

    /// Full `C?` interface settings, the authoritative link state after a join attempt.
    pub(crate) fn on_sta_info(&mut self, ok: bool, payload: &[u8]) -> bool {
        let mut connected = false;
        if ok {
            self.sta.ip_info = IpInfo::default();
            if let Some(info) = parse_conn_info(payload) {
                connected = info.connected;
                if connected {
                    self.sta.ip_info = info.ip_info;
                    if info.dns_unset {
                        warn!(
                            "BUG: DNS is not set, using default. Please update the module FW."
                        );
                    }
                }
            }
        }
        self.set_sta_status(connected, true);
        true
    }

    /// Quick `CS` connection flag from the status poll.
    pub(crate) fn on_sta_status(&mut self, ok: bool, payload: &[u8]) -> bool {
        if ok {
            let connected = payload.first() == Some(&b'1');
            self.set_sta_status(connected, false);
        }
        ok
    }

    /// `CD` completed.
    pub(crate) fn on_sta_disconnected(&mut self, ok: bool) -> bool {
        if ok {
            self.set_sta_status(false, false);
        }
        ok
    }

    pub(crate) fn on_ap_starting(&mut self, ok: bool) -> bool {
        info!("AP starting...");
        ok
    }

    pub(crate) fn on_ap_started(&mut self, ok: bool) -> bool {
        self.ap.running = ok;
        if ok {
            info!("AP started");
        } else {
            error!("AP failed to start");
        }
        ok
    }

    /// `AR` client listing. Records that answered this poll get the new generation number;
    /// known MACs are updated in place, the rest are diffed into connect and disconnect
    /// events. Clients beyond [`AP_MAX_CLIENTS`] are dropped.
    pub(crate) fn on_ap_clients(&mut self, ok: bool, payload: &[u8]) -> bool {
        if !ok {
            return false;
        }
        let max_gen = self.ap.clients.iter().map(|c| c.gen).max().unwrap_or(0);
        let gen = max_gen.wrapping_add(1).max(1);
        let mut fresh: heapless::Vec<ClientInfo, AP_MAX_CLIENTS> = heapless::Vec::new();
        for line in proto::lines(payload) {
            if fresh.is_full() {
                break;
            }
            let Some((mac, rssi)) = parse_client_line(line) else {
                continue;
            };
            if let Some(known) = self
                .ap
                .clients
                .iter_mut()
                .find(|c| c.gen != 0 && c.mac == mac)
            {
                known.rssi = rssi;
                known.gen = gen;
                continue;
            }
            let _ = fresh.push(ClientInfo { mac, rssi, gen });
        }
        // Sweep away clients that are gone.
        for i in 0..AP_MAX_CLIENTS {
            let ci = self.ap.clients[i];
            if ci.gen == 0 || ci.gen == gen {
                continue;
            }
            self.ap.clients[i] = ClientInfo::default();
            self.push_event(Event::ApClientDisconnected { mac: ci.mac });
        }
        // Add the newcomers.
        for ci in fresh {
            if let Some(slot) = self.ap.clients.iter_mut().find(|c| c.gen == 0) {
                *slot = ci;
                self.push_event(Event::ApClientConnected { mac: ci.mac });
            }
        }
        true
    }
}
