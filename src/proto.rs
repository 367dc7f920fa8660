//! Wire codec for the eS-WiFi line protocol.
//!
//! Everything in here is bus-free and pure: framing command bytes into even-length,
//! byte-swapped chunks for transmission, and picking a response buffer apart into status,
//! payload and asynchronous notification brackets. The actual SPI transfers live in
//! [`driver`](crate::driver).

/// Pad byte the host clocks out while reading (and pads odd-length chunks with).
pub(crate) const PAD_OUT: u8 = b'\n';
/// Pad byte the module emits around real response data.
pub(crate) const PAD_IN: u8 = 0x15;
pub(crate) const LINE_SEP: &[u8] = b"\r\n";
pub(crate) const PROMPT: &[u8] = b"> ";
pub(crate) const RESP_OK: &[u8] = b"OK";
pub(crate) const ASYNC_BEGIN: &[u8] = b"[SOMA]";
pub(crate) const ASYNC_END: &[u8] = b"[EOMA]";

/// TX chunk buffer size, including room for the CR terminator and the pad byte.
pub(crate) const CHUNK_SIZE: usize = 66;
/// A response longer than this means we lost framing ("runaway RX").
pub(crate) const MAX_RESPONSE_LEN: usize = 1200;

/// The module talks in 16-bit words with the opposite byte order from ours. Applied to every
/// chunk before transmission and to every word after reception.
pub(crate) fn swap_pairs(data: &mut [u8]) {
    for pair in data.chunks_exact_mut(2) {
        pair.swap(0, 1);
    }
}

pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Frame one command's bytes into even-length chunks and hand each to `emit` (one SPI write
/// per chunk), byte-swapped and ready for the wire.
///
/// `tot_len` accumulates across the continuation commands of one transaction: padding must be
/// computed over the whole concatenation, not per command. A continuation command that ends on
/// an odd boundary leaves its last byte in `carry`, to be prepended to the next command so
/// every chunk stays even. Textual commands get a CR terminator; raw data does not.
pub(crate) fn frame_command<E>(
    payload: &[u8],
    is_text: bool,
    cont: bool,
    tot_len: &mut usize,
    carry: &mut Option<u8>,
    mut emit: impl FnMut(&[u8]) -> Result<(), E>,
) -> Result<(), E> {
    let mut data = [0u8; CHUNK_SIZE];
    let mut data_len = 0;
    let mut remaining = payload;
    if let Some(cb) = carry.take() {
        data[0] = cb;
        data_len = 1;
        *tot_len += 1;
    }
    while !remaining.is_empty() {
        let avail = CHUNK_SIZE - data_len - 2;
        let mut len = remaining.len().min(avail);
        if cont && (data_len + len) % 2 != 0 {
            len -= 1;
        }
        data[data_len..data_len + len].copy_from_slice(&remaining[..len]);
        remaining = &remaining[len..];
        data_len += len;
        *tot_len += len;
        if !cont {
            // Last portion of a textual command gets a CR.
            if is_text && remaining.is_empty() {
                data[data_len] = b'\r';
                data_len += 1;
                *tot_len += 1;
            }
            if *tot_len % 2 != 0 {
                data[data_len] = PAD_OUT;
                data_len += 1;
                *tot_len += 1;
            }
        }
        swap_pairs(&mut data[..data_len]);
        if data_len > 0 {
            emit(&data[..data_len])?;
        }
        if cont && remaining.len() < 2 {
            if remaining.len() == 1 {
                *carry = Some(remaining[0]);
            }
            break;
        }
        data_len = 0;
    }
    Ok(())
}

/// Strip the module's pad bytes from both ends of a freshly read response.
pub(crate) fn trim_padding(buf: &mut alloc::vec::Vec<u8>) {
    while buf.last() == Some(&PAD_IN) {
        buf.pop();
    }
    let lead = buf.iter().take_while(|b| **b == PAD_IN).count();
    if lead > 0 {
        buf.drain(..lead);
    }
}

/// A complete, prompt-terminated response.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Response<'a> {
    /// The status line equalled `OK`.
    pub ok: bool,
    /// Everything before the status line, trailing CRLF included.
    pub payload: &'a [u8],
}

/// A response that does not end in the prompt marker. The protocol state is no longer
/// trustworthy and the module must be reset.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Unterminated;

/// Split a trimmed response buffer into status and payload.
///
/// Lines are scanned until the remainder is exactly the prompt; the line just before it is the
/// status line. Anything else left over means we lost synchronization.
pub(crate) fn parse_response(raw: &[u8]) -> Result<Response<'_>, Unterminated> {
    let buf = raw.strip_prefix(LINE_SEP).unwrap_or(raw);
    let mut s = buf;
    let mut status: Option<(usize, &[u8])> = None;
    loop {
        if s.is_empty() {
            return Err(Unterminated);
        }
        if let Some(eol) = find(s, LINE_SEP) {
            let line = &s[..eol];
            let off = buf.len() - s.len();
            s = &s[eol + LINE_SEP.len()..];
            status = Some((off, line));
        } else if s == PROMPT {
            let (off, line) = status.ok_or(Unterminated)?;
            return Ok(Response {
                ok: line == RESP_OK,
                payload: &buf[..off],
            });
        } else {
            return Err(Unterminated);
        }
    }
}

/// If the payload opens with an `[SOMA]..[EOMA]` bracket, log the notification lines inside it
/// and return the rest; otherwise return the payload untouched.
pub(crate) fn strip_async_events(payload: &[u8]) -> &[u8] {
    if !payload.starts_with(ASYNC_BEGIN) {
        return payload;
    }
    let Some(end) = find(payload, ASYNC_END) else {
        return payload;
    };
    for line in lines(&payload[ASYNC_BEGIN.len()..end]) {
        info!("{}", core::str::from_utf8(line).unwrap_or("<binary>"));
    }
    &payload[end + ASYNC_END.len()..]
}

/// Non-empty CRLF-separated lines.
pub(crate) fn lines(buf: &[u8]) -> impl Iterator<Item = &[u8]> {
    buf.split(|b| *b == b'\n').filter_map(|l| {
        let l = l.strip_suffix(b"\r").unwrap_or(l);
        (!l.is_empty()).then_some(l)
    })
}

/// Comma-separated fields of one line.
pub(crate) fn fields(line: &[u8]) -> impl Iterator<Item = &[u8]> {
    line.split(|b| *b == b',')
}

pub(crate) fn trim(s: &[u8]) -> &[u8] {
    let start = s.iter().take_while(|b| b.is_ascii_whitespace()).count();
    let end = s.len()
        - s[start..]
            .iter()
            .rev()
            .take_while(|b| b.is_ascii_whitespace())
            .count();
    &s[start..end]
}

/// Parse a `XX:XX:XX:XX:XX:XX` MAC address.
pub(crate) fn parse_mac(s: &[u8]) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = trim(s).split(|b| *b == b':');
    for byte in mac.iter_mut() {
        let part = core::str::from_utf8(parts.next()?).ok()?;
        if part.is_empty() || part.len() > 2 {
            return None;
        }
        *byte = u8::from_str_radix(part, 16).ok()?;
    }
    Some(mac)
}

/// Parse a dotted-quad IPv4 address, surrounding whitespace tolerated.
pub(crate) fn parse_ipv4(s: &[u8]) -> Option<core::net::Ipv4Addr> {
    core::str::from_utf8(trim(s)).ok()?.parse().ok()
}

/// Leading decimal integer of `s`, ignoring whatever follows it. Returns 0 when there are no
/// digits at all (same contract as `strtol`, which the module's ad-hoc numeric fields assume).
pub(crate) fn parse_i32(s: &[u8]) -> i32 {
    let s = trim(s);
    let (neg, rest) = match s.first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let mut val: i32 = 0;
    for b in rest.iter().take_while(|b| b.is_ascii_digit()) {
        val = val.wrapping_mul(10).wrapping_add((b - b'0') as i32);
    }
    if neg {
        -val
    } else {
        val
    }
}
