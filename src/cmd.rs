//! Command sequences and the sequence queue.
//!
//! Every interaction with the module is a [`Sequence`]: an ordered batch of commands that is
//! transmitted one command at a time, each answer parsed before the next command goes out.
//! Sequences queue up FIFO and exactly one command is ever in flight. A sequence that is
//! cancelled before its turn never touches the bus.

use alloc::boxed::Box;
use core::fmt::{self, Write as _};
use core::num::NonZeroU32;

use heapless::{String, Vec};

use crate::{Error, EsWifiResult, SEQ_QUEUE_DEPTH};

/// Longest textual command we ever build (`C1=<64-char ssid>` and friends fit comfortably).
pub(crate) const MAX_TEXT_CMD: usize = 96;
/// Longest sequence we ever build (connect and setup sequences top out at eleven commands).
pub(crate) const MAX_SEQ_CMDS: usize = 12;

/// Default per-command answer timeout, in seconds.
pub(crate) const DEFAULT_CMD_TIMEOUT_SECS: u16 = 5;

/// How a command's answer is interpreted. Dispatched in [`driver`](crate::driver); the variants
/// carrying a slot index route to the socket layer, the rest to the Wi-Fi control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RespHandler {
    /// Status only: `OK` advances the sequence, anything else aborts it.
    None,
    /// Advance the sequence even on an error status.
    IgnoreError,
    /// `I?` product banner.
    Info,
    /// `Z5` module MAC address.
    Mac,
    /// First `C?` of a join sequence, logged only.
    StaConnecting,
    /// `CR` signal strength.
    StaRssi,
    /// Second `C?` of a join sequence, full interface settings.
    StaInfo,
    /// `CS` connection flag.
    StaStatus,
    /// `CD` completion.
    StaDisconnect,
    /// `ZP` answered, the module is bringing the access point up.
    ApStarting,
    /// `AD` answered, the access point is serving.
    ApStarted,
    /// `AR` connected-client table.
    ApClients,
    /// `R0` socket read data.
    SockRead { slot: u8 },
    /// Final answer of a socket send transaction.
    SendDone { slot: u8 },
}

/// What to do when a whole sequence finishes, successfully or not. Unlike [`RespHandler`] this
/// fires exactly once per sequence, including for sequences cancelled before transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SeqDone {
    None,
    ConnectDone { slot: u8 },
    CloseDone { slot: u8 },
    SendSeqDone { slot: u8 },
    DataPollDone,
    WifiPollDone,
}

/// The bytes of one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CmdPayload {
    /// A textual command; a CR terminator is appended on the wire.
    Text(String<MAX_TEXT_CMD>),
    /// Raw bytes, transmitted as-is (socket payload after `S3`).
    Data(Box<[u8]>),
}

#[derive(Debug, Clone)]
pub(crate) struct Command {
    pub payload: CmdPayload,
    pub handler: RespHandler,
    /// Concatenate with the next command in one bus transaction, no answer in between.
    pub cont: bool,
    /// Answer timeout override, in seconds.
    pub timeout: Option<u16>,
}

impl Command {
    pub fn text(cmd: &str) -> Self {
        let mut s = String::new();
        // MAX_TEXT_CMD is sized for every command we build.
        let _ = s.push_str(cmd);
        Command {
            payload: CmdPayload::Text(s),
            handler: RespHandler::None,
            cont: false,
            timeout: None,
        }
    }

    pub fn fmt(args: fmt::Arguments<'_>) -> Self {
        let mut s = String::new();
        let _ = s.write_fmt(args);
        Command {
            payload: CmdPayload::Text(s),
            handler: RespHandler::None,
            cont: false,
            timeout: None,
        }
    }

    pub fn data(data: Box<[u8]>) -> Self {
        Command {
            payload: CmdPayload::Data(data),
            handler: RespHandler::None,
            cont: false,
            timeout: None,
        }
    }

    pub fn handler(mut self, handler: RespHandler) -> Self {
        self.handler = handler;
        self
    }

    pub fn cont(mut self) -> Self {
        self.cont = true;
        self
    }

    pub fn timeout_secs(mut self, secs: u16) -> Self {
        self.timeout = Some(secs);
        self
    }

    pub fn is_text(&self) -> bool {
        matches!(self.payload, CmdPayload::Text(_))
    }

    pub fn bytes(&self) -> &[u8] {
        match &self.payload {
            CmdPayload::Text(s) => s.as_bytes(),
            CmdPayload::Data(d) => d,
        }
    }
}

/// Identity of a queued sequence. Ids are never reused within a driver's lifetime, so a stale
/// id held across a reset can never match a newer sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SeqId(NonZeroU32);

#[derive(Debug)]
pub(crate) struct Sequence {
    pub id: SeqId,
    pub cmds: Vec<Command, MAX_SEQ_CMDS>,
    pub done: SeqDone,
    /// Index of the command currently being executed.
    pub cur: usize,
}

/// FIFO of pending sequences, head first.
#[derive(Debug, Default)]
pub(crate) struct SeqQueue {
    seqs: Vec<Sequence, SEQ_QUEUE_DEPTH>,
    next_id: u32,
}

impl SeqQueue {
    pub fn submit(
        &mut self,
        cmds: Vec<Command, MAX_SEQ_CMDS>,
        done: SeqDone,
    ) -> EsWifiResult<SeqId> {
        self.next_id = self.next_id.wrapping_add(1).max(1);
        let id = SeqId(NonZeroU32::new(self.next_id).ok_or(Error::InvalidState)?);
        self.seqs
            .push(Sequence {
                id,
                cmds,
                done,
                cur: 0,
            })
            .map_err(|_| Error::QueueFull)?;
        Ok(id)
    }

    pub fn head(&self) -> Option<&Sequence> {
        self.seqs.first()
    }

    pub fn head_mut(&mut self) -> Option<&mut Sequence> {
        self.seqs.first_mut()
    }

    /// Remove a sequence from anywhere in the queue.
    pub fn take(&mut self, id: SeqId) -> Option<Sequence> {
        let idx = self.seqs.iter().position(|s| s.id == id)?;
        Some(self.seqs.remove(idx))
    }

    pub fn pop_head(&mut self) -> Option<Sequence> {
        if self.seqs.is_empty() {
            None
        } else {
            Some(self.seqs.remove(0))
        }
    }

    /// Put a sequence back at the head. Only valid right after [`pop_head`](Self::pop_head),
    /// which guarantees the capacity.
    pub fn restore_head(&mut self, seq: Sequence) {
        if self.seqs.insert(0, seq).is_err() {
            error!("Sequence queue lost an entry");
        }
    }

    pub fn contains(&self, id: SeqId) -> bool {
        self.seqs.iter().any(|s| s.id == id)
    }

    pub fn drain(&mut self) -> Vec<Sequence, SEQ_QUEUE_DEPTH> {
        core::mem::take(&mut self.seqs)
    }

    pub fn len(&self) -> usize {
        self.seqs.len()
    }
}
