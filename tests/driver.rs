//! End-to-end driver tests against a scripted fake module.
//!
//! The fake implements the module side of the SPI protocol: it collects byte-swapped command
//! chunks while chip select is asserted, answers with byte-swapped, pad-filled responses, and
//! models the dual meaning of the DRDY line (response data pending, or ready for the next
//! command). Tests drive [`EsWifi::poll`] with a hand-rolled millisecond clock.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::rc::Rc;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{ErrorType as PinErrorType, InputPin, OutputPin};
use embedded_hal::spi::{ErrorType as SpiErrorType, SpiBus};

use eswifi_hal::{
    Config, DrdySignal, Error, EsWifi, Event, NetInterface, Phase, SocketHandle, StaConfig,
};

const PAD_IN: u8 = 0x15;

fn swap_pairs(data: &mut [u8]) {
    for pair in data.chunks_exact_mut(2) {
        pair.swap(0, 1);
    }
}

/// Logical response bytes to wire order: pad to even length, swap each byte pair.
fn wire(body: &[u8]) -> VecDeque<u8> {
    let mut v = body.to_vec();
    if v.len() % 2 != 0 {
        v.push(PAD_IN);
    }
    swap_pairs(&mut v);
    v.into()
}

fn ok_body(payload: &[u8]) -> Vec<u8> {
    let mut v = b"\r\n".to_vec();
    v.extend_from_slice(payload);
    if !payload.is_empty() {
        v.extend_from_slice(b"\r\n");
    }
    v.extend_from_slice(b"OK\r\n> ");
    v
}

enum R0Resp {
    Data(Vec<u8>),
    PeerClosed,
}

struct ModuleState {
    in_reset: bool,
    cs_low: bool,
    ready_for_cmd: bool,
    resp: VecDeque<u8>,
    tx: Vec<u8>,
    boot_body: Vec<u8>,
    last_p0: usize,
    scripts: HashMap<String, VecDeque<Vec<u8>>>,
    r0: HashMap<usize, VecDeque<R0Resp>>,
    suppress: Option<String>,
    fail_next_send: bool,
    transactions: Vec<String>,
    sends: Vec<(usize, Vec<u8>)>,
    reset_asserts: usize,
    rst_low: bool,
}

impl ModuleState {
    fn respond(&mut self, body: &[u8]) {
        self.resp = wire(body);
        self.ready_for_cmd = false;
    }

    fn boot(&mut self) {
        self.in_reset = false;
        self.ready_for_cmd = false;
        let body = self.boot_body.clone();
        self.resp = wire(&body);
    }

    fn process(&mut self, mut raw: Vec<u8>) {
        swap_pairs(&mut raw);
        let lossy = String::from_utf8_lossy(&raw).into_owned();
        self.transactions.push(lossy.clone());
        let cmd = lossy
            .trim_end_matches('\n')
            .trim_end_matches('\r')
            .to_string();
        if self.suppress.as_deref() == Some(cmd.as_str()) {
            self.suppress = None;
            return;
        }
        if let Some(q) = self.scripts.get_mut(&cmd) {
            if let Some(body) = q.pop_front() {
                self.respond(&body);
                return;
            }
        }
        if cmd == "ZR" {
            self.boot();
            return;
        }
        if let Some(rest) = cmd.strip_prefix("P0=") {
            self.last_p0 = rest.parse().unwrap_or(0);
            self.respond(&ok_body(b""));
            return;
        }
        if raw.starts_with(b"S3=") {
            let eol = raw.iter().position(|b| *b == b'\r').unwrap();
            let len: usize = std::str::from_utf8(&raw[3..eol]).unwrap().parse().unwrap();
            let data = raw[eol + 1..eol + 1 + len].to_vec();
            self.sends.push((self.last_p0, data));
            if self.fail_next_send {
                self.fail_next_send = false;
                self.respond(&ok_body(b"-1"));
            } else {
                self.respond(&ok_body(b""));
            }
            return;
        }
        let body = match cmd.as_str() {
            "R0" => {
                match self
                    .r0
                    .get_mut(&self.last_p0)
                    .and_then(|q| q.pop_front())
                {
                    Some(R0Resp::Data(data)) => ok_body(&data),
                    Some(R0Resp::PeerClosed) => b"\r\n-1\r\nERROR\r\n> ".to_vec(),
                    None => ok_body(b""),
                }
            }
            "I?" => ok_body(b"ISM43362-M3G-L44-SPI,C3.5.2.3.BETA9,v3.5.2,v1.4,v8,120,eS-WiFi"),
            "Z5" => ok_body(b"C4:7F:51:0A:81:C2"),
            "CS" => ok_body(b"1"),
            "CR" => ok_body(b"-40"),
            "---" => b"\r\n-1\r\nERROR\r\n> ".to_vec(),
            _ => ok_body(b""),
        };
        self.respond(&body);
    }

    fn drdy(&self) -> bool {
        !self.in_reset && (!self.resp.is_empty() || (self.ready_for_cmd && !self.cs_low))
    }
}

#[derive(Clone)]
struct Module(Rc<RefCell<ModuleState>>);

impl Module {
    fn new() -> Self {
        Module(Rc::new(RefCell::new(ModuleState {
            in_reset: false,
            cs_low: false,
            ready_for_cmd: false,
            resp: VecDeque::new(),
            tx: Vec::new(),
            boot_body: b"\r\n> ".to_vec(),
            last_p0: 0,
            scripts: HashMap::new(),
            r0: HashMap::new(),
            suppress: None,
            fail_next_send: false,
            transactions: Vec::new(),
            sends: Vec::new(),
            reset_asserts: 0,
            rst_low: false,
        })))
    }

    fn spi(&self) -> MockSpi {
        MockSpi(self.0.clone())
    }

    fn pin(&self, role: Role) -> MockPin {
        MockPin(self.0.clone(), role)
    }

    fn drdy(&self) -> MockDrdy {
        MockDrdy(self.0.clone())
    }

    fn script(&self, cmd: &str, body: Vec<u8>) {
        self.0
            .borrow_mut()
            .scripts
            .entry(cmd.to_string())
            .or_default()
            .push_back(body);
    }

    fn r0_data(&self, slot: usize, data: &[u8]) {
        // A read response carries the data plus the module's trailing CRLF.
        self.0
            .borrow_mut()
            .r0
            .entry(slot)
            .or_default()
            .push_back(R0Resp::Data(data.to_vec()));
    }

    fn r0_peer_closed(&self, slot: usize) {
        self.0
            .borrow_mut()
            .r0
            .entry(slot)
            .or_default()
            .push_back(R0Resp::PeerClosed);
    }

    fn suppress(&self, cmd: &str) {
        self.0.borrow_mut().suppress = Some(cmd.to_string());
    }

    fn set_boot_body(&self, body: &[u8]) {
        self.0.borrow_mut().boot_body = body.to_vec();
    }

    fn transactions(&self) -> Vec<String> {
        self.0.borrow().transactions.clone()
    }

    fn count(&self, prefix: &str) -> usize {
        self.0
            .borrow()
            .transactions
            .iter()
            .filter(|t| t.starts_with(prefix))
            .count()
    }

    fn sends(&self) -> Vec<(usize, Vec<u8>)> {
        self.0.borrow().sends.clone()
    }

    fn reset_asserts(&self) -> usize {
        self.0.borrow().reset_asserts
    }

    fn rst_is_low(&self) -> bool {
        self.0.borrow().rst_low
    }

    fn fail_next_send(&self) {
        self.0.borrow_mut().fail_next_send = true;
    }
}

struct MockSpi(Rc<RefCell<ModuleState>>);

impl SpiErrorType for MockSpi {
    type Error = Infallible;
}

impl SpiBus for MockSpi {
    fn read(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        self.transfer_in_place(words)
    }

    fn write(&mut self, words: &[u8]) -> Result<(), Self::Error> {
        let mut st = self.0.borrow_mut();
        assert!(st.cs_low, "command bytes written with CS deasserted");
        st.tx.extend_from_slice(words);
        Ok(())
    }

    fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), Self::Error> {
        let _ = write;
        self.transfer_in_place(read)
    }

    fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        let mut st = self.0.borrow_mut();
        assert!(st.cs_low, "response bytes clocked with CS deasserted");
        for w in words.iter_mut() {
            *w = st.resp.pop_front().unwrap_or(PAD_IN);
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum Role {
    Cs,
    Rst,
    Plain,
}

struct MockPin(Rc<RefCell<ModuleState>>, Role);

impl PinErrorType for MockPin {
    type Error = Infallible;
}

impl OutputPin for MockPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        let mut st = self.0.borrow_mut();
        match self.1 {
            Role::Cs => st.cs_low = true,
            Role::Rst => {
                if !st.rst_low {
                    st.rst_low = true;
                    st.reset_asserts += 1;
                    st.in_reset = true;
                    st.resp.clear();
                    st.tx.clear();
                    st.ready_for_cmd = false;
                }
            }
            Role::Plain => {}
        }
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        let mut st = self.0.borrow_mut();
        match self.1 {
            Role::Cs => {
                st.cs_low = false;
                if !st.tx.is_empty() {
                    let tx = std::mem::take(&mut st.tx);
                    st.process(tx);
                } else if st.resp.is_empty() && !st.in_reset {
                    st.ready_for_cmd = true;
                }
            }
            Role::Rst => {
                if st.rst_low {
                    st.rst_low = false;
                    st.boot();
                }
            }
            Role::Plain => {}
        }
        Ok(())
    }
}

struct MockDrdy(Rc<RefCell<ModuleState>>);

impl PinErrorType for MockDrdy {
    type Error = Infallible;
}

impl InputPin for MockDrdy {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        Ok(self.0.borrow().drdy())
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        Ok(!self.0.borrow().drdy())
    }
}

struct NoDelay;

impl DelayNs for NoDelay {
    fn delay_ns(&mut self, _ns: u32) {}
}

type TestDriver<'s> = EsWifi<'s, MockSpi, MockPin, MockPin, MockPin, MockPin, MockDrdy, NoDelay>;

fn make_driver<'s>(m: &Module, sig: &'s DrdySignal) -> TestDriver<'s> {
    EsWifi::new(
        m.spi(),
        m.pin(Role::Cs),
        Some(m.pin(Role::Rst)),
        Some(m.pin(Role::Plain)),
        Some(m.pin(Role::Plain)),
        m.drdy(),
        NoDelay,
        sig,
        Config::default(),
    )
}

fn drain_events(drv: &mut TestDriver<'_>) -> Vec<Event> {
    let mut evs = Vec::new();
    while let Some(ev) = drv.next_event() {
        evs.push(ev);
    }
    evs
}

/// Boot the module and run the init sequence.
fn bring_up(drv: &mut TestDriver<'_>) {
    drv.start(0).unwrap();
    drv.poll(600).unwrap();
    assert_eq!(drv.phase(), Phase::Cmd);
    assert!(drv.mac().is_some());
}

const CONN_INFO: &[u8] =
    b"MyNet,s3cret,4,1,0,192.168.1.5,255.255.255.0,192.168.1.1,192.168.1.1,0.0.0.0,1,1,0,US,1";

fn sta_cfg() -> StaConfig<'static> {
    StaConfig {
        ssid: "MyNet",
        pass: Some("s3cret"),
        ip: None,
        netmask: None,
        gw: None,
    }
}

/// Boot, configure and join, leaving the driver connected at t = 601 ms.
fn bring_up_sta(m: &Module, drv: &mut TestDriver<'_>) {
    bring_up(drv);
    m.script("C?", ok_body(b"MyNet,s3cret,4,1,0"));
    m.script("C?", ok_body(CONN_INFO));
    drv.sta_setup(&sta_cfg(), 600).unwrap();
    drv.sta_connect().unwrap();
    drv.poll(601).unwrap();
    assert!(drv.sta_connected());
    let evs = drain_events(drv);
    assert!(evs.contains(&Event::StaConnected));
    assert!(evs.contains(&Event::StaIpAcquired));
}

fn connect_sock(drv: &mut TestDriver<'_>, port: u16, now: u32) -> SocketHandle {
    let peer = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 7), port);
    let handle = drv.connect_tcp(peer).unwrap();
    drv.poll(now).unwrap();
    let evs = drain_events(drv);
    assert!(evs.contains(&Event::ConnectFinished { handle, ok: true }));
    handle
}

#[test]
fn boots_and_runs_init_sequence() {
    let m = Module::new();
    let sig = DrdySignal::new();
    let mut drv = make_driver(&m, &sig);
    bring_up(&mut drv);
    // Text commands are CR terminated and padded to an even length.
    let tx = m.transactions();
    assert_eq!(
        tx,
        vec!["---\r", "I?\r\n", "Z5\r\n", "MT=1\r\n", "PK=1,20000\r\n"]
    );
    assert_eq!(
        drv.mac(),
        Some([0xc4, 0x7f, 0x51, 0x0a, 0x81, 0xc2])
    );
}

#[test]
fn soft_reset_is_used_without_a_reset_pin() {
    let m = Module::new();
    let sig = DrdySignal::new();
    let mut drv: TestDriver<'_> = EsWifi::new(
        m.spi(),
        m.pin(Role::Cs),
        None,
        Some(m.pin(Role::Plain)),
        Some(m.pin(Role::Plain)),
        m.drdy(),
        NoDelay,
        &sig,
        Config::default(),
    );
    drv.start(0).unwrap();
    drv.poll(600).unwrap();
    assert_eq!(drv.phase(), Phase::Cmd);
    assert_eq!(m.transactions()[0], "ZR\r\n");
    assert_eq!(m.reset_asserts(), 0);
}

#[test]
fn wrong_boot_prompt_holds_the_module_in_reset() {
    let m = Module::new();
    m.set_boot_body(b"\r\ngarbage> ");
    let sig = DrdySignal::new();
    let mut drv = make_driver(&m, &sig);
    drv.start(0).unwrap();
    drv.poll(600).unwrap();
    assert_eq!(drv.phase(), Phase::Reset);
    assert!(m.rst_is_low());
    // Held: no commands ever went out, and nothing happens on further polls.
    drv.poll(5000).unwrap();
    assert!(m.transactions().is_empty());
}

#[test]
fn sta_join_reports_link_and_ip() {
    let m = Module::new();
    let sig = DrdySignal::new();
    let mut drv = make_driver(&m, &sig);
    bring_up_sta(&m, &mut drv);
    assert_eq!(drv.sta_ip_info().ip, Ipv4Addr::new(192, 168, 1, 5));
    assert_eq!(drv.sta_rssi(), -40);
    // The 1 Hz status poll keeps running.
    drv.poll(1601).unwrap();
    assert_eq!(m.count("CS"), 1);
}

#[test]
fn status_poll_reports_disconnect_and_closes_sockets() {
    let m = Module::new();
    let sig = DrdySignal::new();
    let mut drv = make_driver(&m, &sig);
    bring_up_sta(&m, &mut drv);
    let handle = connect_sock(&mut drv, 80, 610);
    m.script("CS", ok_body(b"0"));
    drv.poll(1601).unwrap();
    assert!(!drv.sta_connected());
    let evs = drain_events(&mut drv);
    assert!(evs.contains(&Event::StaDisconnected));
    assert!(evs.contains(&Event::Closed { handle }));
}

#[test]
fn socket_send_and_receive() {
    let m = Module::new();
    let sig = DrdySignal::new();
    let mut drv = make_driver(&m, &sig);
    bring_up_sta(&m, &mut drv);
    let peer = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 7), 80);
    let handle = drv.connect_tcp(peer).unwrap();
    drv.poll(610).unwrap();
    let evs = drain_events(&mut drv);
    assert!(evs.contains(&Event::ConnectFinished { handle, ok: true }));
    assert!(evs.contains(&Event::Writable { handle }));

    assert_eq!(drv.send(handle, b"hello").unwrap(), 5);
    // A second send while the first is still pending is refused, not queued.
    assert_eq!(drv.send(handle, b"again").unwrap(), 0);
    drv.poll(611).unwrap();
    assert_eq!(m.sends(), vec![(0usize, b"hello".to_vec())]);
    let evs = drain_events(&mut drv);
    assert!(evs.contains(&Event::Writable { handle }));

    m.r0_data(0, b"response");
    drv.poll(700).unwrap();
    let evs = drain_events(&mut drv);
    assert!(evs.contains(&Event::DataAvailable { handle }));
    let mut buf = [0u8; 32];
    assert_eq!(drv.recv(handle, &mut buf).unwrap(), 8);
    assert_eq!(&buf[..8], b"response");
    assert_eq!(drv.recv(handle, &mut buf).unwrap(), 0);
}

#[test]
fn failed_send_is_retried() {
    let m = Module::new();
    let sig = DrdySignal::new();
    let mut drv = make_driver(&m, &sig);
    bring_up_sta(&m, &mut drv);
    let handle = connect_sock(&mut drv, 80, 610);
    m.fail_next_send();
    assert_eq!(drv.send(handle, b"data").unwrap(), 4);
    drv.poll(611).unwrap();
    // First attempt failed, the poll loop resubmits the same bytes.
    drv.poll(612).unwrap();
    drv.poll(613).unwrap();
    let sends = m.sends();
    assert!(sends.len() >= 2);
    assert!(sends.iter().all(|(slot, data)| *slot == 0 && data == b"data"));
}

#[test]
fn peer_close_after_drain_reports_closed_once() {
    let m = Module::new();
    let sig = DrdySignal::new();
    let mut drv = make_driver(&m, &sig);
    bring_up_sta(&m, &mut drv);
    let handle = connect_sock(&mut drv, 80, 610);
    m.r0_data(0, b"last words");
    drv.poll(700).unwrap();
    let mut buf = [0u8; 32];
    assert_eq!(drv.recv(handle, &mut buf).unwrap(), 10);
    m.r0_peer_closed(0);
    let closed = Event::Closed { handle };
    let mut t = 701;
    while drain_events(&mut drv).iter().all(|e| *e != closed) {
        t += 10;
        assert!(t < 3000, "no Closed event");
        drv.poll(t).unwrap();
    }
    // Exactly once: nothing further after more polls.
    for _ in 0..10 {
        t += 10;
        drv.poll(t).unwrap();
    }
    assert!(drain_events(&mut drv).is_empty());
    drv.destroy(handle).unwrap();
    drv.poll(t + 10).unwrap();
    assert!(m.transactions().iter().any(|c| c == "P6=0\r\n"));
}

#[test]
fn socket_slots_are_exclusive_and_bounded() {
    let m = Module::new();
    let sig = DrdySignal::new();
    let mut drv = make_driver(&m, &sig);
    bring_up_sta(&m, &mut drv);
    let mut now = 610;
    for port in [80, 81, 82, 83] {
        connect_sock(&mut drv, port, now);
        now += 1;
    }
    let peer = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 7), 84);
    assert_eq!(drv.connect_tcp(peer), Err(Error::NoFreeSockets));
}

#[test]
fn udp_destination_port_collision_is_rejected() {
    let m = Module::new();
    let sig = DrdySignal::new();
    let mut drv = make_driver(&m, &sig);
    bring_up_sta(&m, &mut drv);
    let a = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 7), 5000);
    let b = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 8), 5000);
    let c = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 8), 6000);
    drv.connect_udp(a).unwrap();
    assert_eq!(drv.connect_udp(b), Err(Error::UdpPortInUse));
    drv.connect_udp(c).unwrap();
}

#[test]
fn data_poll_backs_off_and_collapses_on_data() {
    let m = Module::new();
    let sig = DrdySignal::new();
    let mut drv = make_driver(&m, &sig);
    bring_up_sta(&m, &mut drv);
    let handle = connect_sock(&mut drv, 80, 610);

    let mut poll_times = Vec::new();
    let mut seen = m.count("R0");
    for t in 611..3200u32 {
        drv.poll(t).unwrap();
        let n = m.count("R0");
        if n > seen {
            seen = n;
            poll_times.push(t);
        }
    }
    let gaps: Vec<u32> = poll_times.windows(2).map(|w| w[1] - w[0]).collect();
    // Idle polling doubles from the minimum up to the ceiling.
    assert!(gaps.len() >= 6, "gaps: {gaps:?}");
    assert!(gaps[0] >= 100 && gaps[0] <= 102, "gaps: {gaps:?}");
    assert!(gaps[1] >= 200 && gaps[1] <= 202, "gaps: {gaps:?}");
    assert!(gaps[2] >= 400 && gaps[2] <= 402, "gaps: {gaps:?}");
    for g in &gaps[3..] {
        assert!(*g >= 500 && *g <= 502, "gaps: {gaps:?}");
    }

    // Receiving any data collapses the backoff to the minimum interval.
    m.r0_data(0, b"x");
    let mut t = 3200;
    while m.count("R0") == seen {
        t += 1;
        drv.poll(t).unwrap();
        assert!(t < 3800, "poller stalled");
    }
    let data_at = t;
    let mut buf = [0u8; 8];
    drv.recv(handle, &mut buf).unwrap();
    let with_data = m.count("R0");
    while m.count("R0") == with_data {
        t += 1;
        drv.poll(t).unwrap();
        assert!(t < data_at + 600, "backoff did not collapse");
    }
    assert!(t - data_at <= 55, "re-poll after data took {} ms", t - data_at);
}

#[test]
fn queued_sequence_aborted_before_transmission_never_reaches_the_bus() {
    let m = Module::new();
    let sig = DrdySignal::new();
    let mut drv = make_driver(&m, &sig);
    bring_up_sta(&m, &mut drv);
    // Block the head of the queue: the status poll's CS gets no answer.
    m.suppress("CS");
    drv.poll(1601).unwrap();
    let peer = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 7), 80);
    let handle = drv.connect_tcp(peer).unwrap();
    drv.poll(1602).unwrap();
    drv.destroy(handle).unwrap();
    for t in 1603..1700 {
        drv.poll(t).unwrap();
    }
    // The connect sequence was cancelled while queued; none of its commands went out.
    assert_eq!(m.count("P1="), 0);
    assert_eq!(m.count("P6=1"), 0);
}

#[test]
fn unanswered_command_times_out_into_one_recovery() {
    let m = Module::new();
    let sig = DrdySignal::new();
    let mut drv = make_driver(&m, &sig);
    bring_up_sta(&m, &mut drv);
    let resets_before = m.reset_asserts();
    m.suppress("CS");
    drv.poll(1601).unwrap();
    let peer = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 7), 80);
    let handle = drv.connect_tcp(peer).unwrap();
    // The per-command timeout is 5 s; tick the clock past it.
    for t in (1700..9000u32).step_by(100) {
        drv.poll(t).unwrap();
    }
    assert_eq!(m.reset_asserts(), resets_before + 1);
    assert_eq!(drv.phase(), Phase::Reset);
    let evs = drain_events(&mut drv);
    // The queued connect fails exactly once, and the lost link is reported.
    assert_eq!(
        evs.iter()
            .filter(|e| **e == Event::ConnectFinished { handle, ok: false })
            .count(),
        1
    );
    assert!(evs.contains(&Event::StaDisconnected));
}

#[test]
fn sequence_queue_overflow_is_an_error() {
    let m = Module::new();
    let sig = DrdySignal::new();
    let mut drv = make_driver(&m, &sig);
    bring_up_sta(&m, &mut drv);
    // Wedge the queue behind an unanswered command, then fill it up.
    m.suppress("CS");
    drv.poll(1601).unwrap();
    let mut result = Ok(());
    for _ in 0..8 {
        result = drv.sta_disconnect();
        if result.is_err() {
            break;
        }
    }
    assert_eq!(result, Err(Error::QueueFull));
}

#[test]
fn destroy_keeps_the_slot_when_the_close_cannot_be_queued() {
    let m = Module::new();
    let sig = DrdySignal::new();
    let mut drv = make_driver(&m, &sig);
    bring_up_sta(&m, &mut drv);
    let handle = connect_sock(&mut drv, 80, 610);
    // Wedge the queue behind an unanswered command and fill it to capacity.
    m.suppress("CS");
    drv.poll(1601).unwrap();
    let mut result = Ok(());
    for _ in 0..8 {
        result = drv.sta_disconnect();
        if result.is_err() {
            break;
        }
    }
    assert_eq!(result, Err(Error::QueueFull));
    assert_eq!(drv.destroy(handle), Err(Error::QueueFull));
    // The close never went out, so the slot is still owned and the handle still works.
    let mut buf = [0u8; 8];
    assert_eq!(drv.recv(handle, &mut buf), Ok(0));
    assert_eq!(m.count("P6=0"), 0);
}

#[test]
fn ap_client_table_is_diffed_per_generation() {
    let m = Module::new();
    let sig = DrdySignal::new();
    let mut drv = make_driver(&m, &sig);
    bring_up(&mut drv);
    let cfg = eswifi_hal::ApConfig {
        ssid: "MyAp",
        pass: Some("s3cret"),
        channel: 6,
        max_clients: 4,
        ip: Ipv4Addr::new(192, 168, 10, 1),
    };
    drv.ap_setup(&cfg, 600).unwrap();
    drv.poll(601).unwrap();
    assert!(drv.ap_running());
    drain_events(&mut drv);

    const MAC_A: [u8; 6] = [0xc4, 0x7f, 0x51, 0x0a, 0x81, 0xc2];
    const MAC_B: [u8; 6] = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff];
    const MAC_C: [u8; 6] = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66];

    m.script(
        "AR",
        ok_body(b"0,C4:7F:51:0A:81:C2,-40\r\n1,AA:BB:CC:DD:EE:FF,-62"),
    );
    drv.poll(1601).unwrap();
    let evs = drain_events(&mut drv);
    assert!(evs.contains(&Event::ApClientConnected { mac: MAC_A }));
    assert!(evs.contains(&Event::ApClientConnected { mac: MAC_B }));

    // A left, C joined, and a stale record with a non-negative RSSI is ignored.
    m.script(
        "AR",
        ok_body(b"1,AA:BB:CC:DD:EE:FF,-60\r\n2,11:22:33:44:55:66,-70\r\n3,FF:EE:DD:CC:BB:AA,0"),
    );
    drv.poll(2601).unwrap();
    let evs = drain_events(&mut drv);
    assert_eq!(
        evs,
        vec![
            Event::ApClientDisconnected { mac: MAC_A },
            Event::ApClientConnected { mac: MAC_C },
        ]
    );
    assert_eq!(drv.ap_clients().count(), 2);
}
