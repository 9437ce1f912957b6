use bytes::{Buf, BufMut, Bytes, BytesMut};
use memchr::memmem;
use std::collections::HashMap;
use thiserror::Error;

pub const SOH: u8 = 0x01; // ASCII control-A

/// Start of every frame on the wire.
pub const BEGIN_MARKER: &[u8] = b"8=FIX";
const TRAILER_TAG: &[u8] = b"\x0110=";
// SOH + "10=" + 3 digits + SOH
const TRAILER_LEN: usize = 8;
// A marker or trailer tag may straddle the end of the previous search.
const RESCAN_OVERLAP: usize = BEGIN_MARKER.len() - 1;

/// Longest frame a peer may send; a frame growing past it is discarded.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixMsgType {
    Logon,          // 35=A
    Heartbeat,      // 35=0
    TestRequest,    // 35=1
    Logout,         // 35=5
    ResendRequest,  // 35=2
    Reject,         // 35=3
    SequenceReset,  // 35=4
    Unknown(String),
}

impl FixMsgType {
    /// Session-level message types; everything else is application traffic.
    pub fn is_admin(&self) -> bool {
        !matches!(self, FixMsgType::Unknown(_))
    }
}

/// Why a frame or a run of bytes was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("discarded {0} bytes preceding a message start")]
    Garbage(usize),
    #[error("discarded {0} bytes of a message interrupted by a new message start")]
    Truncated(usize),
    #[error("discarded {0} bytes with a malformed 10= trailer")]
    MalformedTrailer(usize),
    #[error("discarded {0} bytes of a message longer than the frame limit")]
    Oversized(usize),
    #[error("message must end with a 10=ddd trailer")]
    MissingTrailer,
    #[error("bad checksum value")]
    BadChecksum,
    #[error("checksum mismatch: expected {expected:03}, got {actual:03}")]
    ChecksumMismatch { expected: u8, actual: u8 },
    #[error("BodyLength mismatch: header={declared} computed={computed}")]
    BodyLength { declared: usize, computed: usize },
    #[error("missing required field {0}")]
    MissingField(u32),
    #[error("invalid value for field {0}")]
    InvalidValue(u32),
    #[error("malformed field {0:?}")]
    MalformedField(String),
}

#[derive(Debug, Clone)]
pub struct FixMessage {
    pub begin_string: String, // 8
    pub body_length: usize,   // 9 (computed/validated)
    pub msg_type: FixMsgType, // 35
    pub fields: HashMap<u32, String>,
}

impl FixMessage {
    pub fn new(msg_type: FixMsgType) -> Self {
        Self {
            begin_string: "FIX.4.4".to_string(),
            body_length: 0,
            msg_type,
            fields: HashMap::new(),
        }
    }

    pub fn with_begin_string(mut self, begin_string: impl Into<String>) -> Self {
        self.begin_string = begin_string.into();
        self
    }

    pub fn set_field(&mut self, tag: u32, value: impl Into<String>) {
        self.fields.insert(tag, value.into());
    }

    pub fn field(&self, tag: u32) -> Option<&str> {
        self.fields.get(&tag).map(String::as_str)
    }
}

fn compute_checksum(bytes: &[u8]) -> u8 {
    let sum: u32 = bytes.iter().map(|b| *b as u32).sum();
    (sum % 256) as u8
}

fn msg_type_to_str(mt: &FixMsgType) -> &str {
    match mt {
        FixMsgType::Logon => "A",
        FixMsgType::Heartbeat => "0",
        FixMsgType::TestRequest => "1",
        FixMsgType::Logout => "5",
        FixMsgType::ResendRequest => "2",
        FixMsgType::Reject => "3",
        FixMsgType::SequenceReset => "4",
        FixMsgType::Unknown(s) => s.as_str(),
    }
}

fn parse_msg_type(s: &str) -> FixMsgType {
    match s {
        "A" => FixMsgType::Logon,
        "0" => FixMsgType::Heartbeat,
        "1" => FixMsgType::TestRequest,
        "5" => FixMsgType::Logout,
        "2" => FixMsgType::ResendRequest,
        "3" => FixMsgType::Reject,
        "4" => FixMsgType::SequenceReset,
        other => FixMsgType::Unknown(other.to_string()),
    }
}

pub fn encode(msg: &FixMessage) -> Bytes {
    // 35 leads the body; 8, 9 and 10 are computed here
    let mut body = BytesMut::with_capacity(256);
    body.extend_from_slice(b"35=");
    body.extend_from_slice(msg_type_to_str(&msg.msg_type).as_bytes());
    body.put_u8(SOH);

    // Sorted by tag for determinism
    let mut tags: Vec<_> = msg.fields.keys().copied().collect();
    tags.sort_unstable();
    for tag in tags {
        if tag == 8 || tag == 9 || tag == 10 || tag == 35 { continue; }
        body.extend_from_slice(tag.to_string().as_bytes());
        body.put_u8(b'=');
        if let Some(v) = msg.fields.get(&tag) {
            body.extend_from_slice(v.as_bytes());
        }
        body.put_u8(SOH);
    }

    let body_length = body.len();

    let mut out = BytesMut::with_capacity(32 + body_length + TRAILER_LEN);
    out.extend_from_slice(b"8=");
    out.extend_from_slice(msg.begin_string.as_bytes());
    out.put_u8(SOH);
    out.extend_from_slice(b"9=");
    out.extend_from_slice(body_length.to_string().as_bytes());
    out.put_u8(SOH);
    out.extend_from_slice(&body);

    // Sum of all bytes up to and including the SOH before 10=
    let cks = compute_checksum(&out);
    out.extend_from_slice(b"10=");
    out.extend_from_slice(format!("{:03}", cks).as_bytes());
    out.put_u8(SOH);

    out.freeze()
}

fn split_field(field: &[u8]) -> Result<(u32, String), ParseError> {
    let malformed = || ParseError::MalformedField(String::from_utf8_lossy(field).into_owned());
    let s = std::str::from_utf8(field).map_err(|_| malformed())?;
    let (tag, value) = s.split_once('=').ok_or_else(malformed)?;
    let tag: u32 = tag.parse().map_err(|_| malformed())?;
    Ok((tag, value.to_string()))
}

fn parse_checksum(digits: &[u8]) -> Option<u8> {
    if digits.len() != 3 || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(digits).ok()?.parse::<u8>().ok()
}

/// Decodes one complete frame, validating checksum and BodyLength.
pub fn decode(buf: &[u8]) -> Result<FixMessage, ParseError> {
    if !buf.ends_with(&[SOH]) { return Err(ParseError::MissingTrailer); }

    let without_last_soh = &buf[..buf.len() - 1];
    let trailer_start = memchr::memrchr(SOH, without_last_soh)
        .map(|i| i + 1)
        .ok_or(ParseError::MissingTrailer)?;
    let digits = without_last_soh[trailer_start..]
        .strip_prefix(b"10=")
        .ok_or(ParseError::MissingTrailer)?;
    let expected = parse_checksum(digits).ok_or(ParseError::BadChecksum)?;
    let actual = compute_checksum(&buf[..trailer_start]);
    if actual != expected {
        return Err(ParseError::ChecksumMismatch { expected, actual });
    }

    // Everything before the trailer; always ends with SOH
    let header = &buf[..trailer_start];
    if header.is_empty() { return Err(ParseError::MissingField(8)); }

    let mut begin_string = None;
    let mut declared = None;
    let mut body_start = 0usize;
    let mut offset = 0usize;
    let mut map: HashMap<u32, String> = HashMap::new();
    for (index, field) in header[..header.len() - 1].split(|b| *b == SOH).enumerate() {
        let next = offset + field.len() + 1;
        let (tag, value) = split_field(field)?;
        match (index, tag) {
            (0, 8) => begin_string = Some(value),
            (0, _) => return Err(ParseError::MissingField(8)),
            (1, 9) => {
                declared = Some(value.parse::<usize>().map_err(|_| ParseError::InvalidValue(9))?);
                body_start = next;
            }
            (1, _) => return Err(ParseError::MissingField(9)),
            _ => { map.insert(tag, value); }
        }
        offset = next;
    }

    let begin_string = begin_string.ok_or(ParseError::MissingField(8))?;
    let declared = declared.ok_or(ParseError::MissingField(9))?;
    let computed = header.len() - body_start;
    if declared != computed {
        return Err(ParseError::BodyLength { declared, computed });
    }

    let msg_type = map.remove(&35).ok_or(ParseError::MissingField(35))?;

    Ok(FixMessage {
        begin_string,
        body_length: declared,
        msg_type: parse_msg_type(&msg_type),
        fields: map,
    })
}

/// Longest suffix of `data` that is a proper prefix of [`BEGIN_MARKER`].
fn partial_marker_len(data: &[u8]) -> usize {
    (1..BEGIN_MARKER.len())
        .rev()
        .find(|k| data.ends_with(&BEGIN_MARKER[..*k]))
        .unwrap_or(0)
}

/// Stream framer: extracts one frame from the front of `buffer`.
///
/// A frame runs from [`BEGIN_MARKER`] to the first `<SOH>10=ddd<SOH>`
/// trailer. Returns `None` when more bytes are needed. Bytes that can never
/// become part of a frame are removed from the buffer and reported as
/// `Some(Err(..))`, so callers can keep looping until `None`.
///
/// Every call searches the whole buffer; a long-lived reader should use
/// [`FrameBuffer`], which resumes where the last search stopped.
pub fn try_extract_one(buffer: &mut BytesMut) -> Option<Result<Bytes, ParseError>> {
    let mut scanned = 0;
    extract(buffer, &mut scanned, MAX_FRAME_LEN)
}

/// Receive buffer for one connection that yields frames as they complete.
///
/// Bytes already searched without finding a trailer are not searched again,
/// and a frame that grows past the limit is dropped as
/// [`ParseError::Oversized`], so the buffer never holds much more than the
/// limit plus one received chunk.
#[derive(Debug)]
pub struct FrameBuffer {
    buffer: BytesMut,
    scanned: usize,
    max_frame_len: usize,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::with_max_frame_len(MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            scanned: 0,
            max_frame_len,
        }
    }

    pub fn extend_from_slice(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Same contract as [`try_extract_one`].
    pub fn next_frame(&mut self) -> Option<Result<Bytes, ParseError>> {
        extract(&mut self.buffer, &mut self.scanned, self.max_frame_len)
    }

    /// Bytes held waiting for the rest of a frame.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// `scanned` is how far the buffer was already searched for a trailer or a
/// second marker; it is reset whenever bytes leave the buffer.
fn extract(buffer: &mut BytesMut, scanned: &mut usize, max_frame_len: usize) -> Option<Result<Bytes, ParseError>> {
    let data: &[u8] = buffer.as_ref();
    let start = match memmem::find(data, BEGIN_MARKER) {
        Some(start) => start,
        None => {
            let junk = data.len() - partial_marker_len(data);
            if junk == 0 { return None; }
            *scanned = 0;
            buffer.advance(junk);
            return Some(Err(ParseError::Garbage(junk)));
        }
    };
    if start > 0 {
        *scanned = 0;
        buffer.advance(start);
        return Some(Err(ParseError::Garbage(start)));
    }

    let buffered = data.len();
    let from = scanned.saturating_sub(RESCAN_OVERLAP);
    let marker_from = from.max(1);
    let next_start = memmem::find(&data[marker_from..], BEGIN_MARKER).map(|i| i + marker_from);
    let trailer = memmem::find(&data[from..], TRAILER_TAG).map(|i| i + from);
    match (trailer, next_start) {
        (Some(at), next) if next.map_or(true, |n| at < n) => {
            let end = at + TRAILER_LEN;
            if end > max_frame_len {
                return Some(Err(discard_oversized(buffer, scanned, end)));
            }
            if buffered < end {
                *scanned = at;
                return None;
            }
            let well_formed = data[at + 4..at + 7].iter().all(u8::is_ascii_digit) && data[end - 1] == SOH;
            *scanned = 0;
            if well_formed {
                Some(Ok(buffer.split_to(end).freeze()))
            } else {
                buffer.advance(at + 1);
                Some(Err(ParseError::MalformedTrailer(at + 1)))
            }
        }
        (_, Some(next)) => {
            *scanned = 0;
            buffer.advance(next);
            Some(Err(ParseError::Truncated(next)))
        }
        (_, None) if buffered > max_frame_len => Some(Err(discard_oversized(buffer, scanned, buffered))),
        (_, None) => {
            *scanned = buffered;
            None
        }
    }
}

fn discard_oversized(buffer: &mut BytesMut, scanned: &mut usize, frame_len: usize) -> ParseError {
    let discarded = frame_len.min(buffer.len());
    buffer.advance(discarded);
    *scanned = 0;
    ParseError::Oversized(discarded)
}

// Convenience constructors for handshake messages
pub fn build_logon(heart_bt_int_secs: u32, sender_comp_id: &str, target_comp_id: &str) -> FixMessage {
    let mut msg = FixMessage::new(FixMsgType::Logon);
    msg.set_field(49, sender_comp_id);
    msg.set_field(56, target_comp_id);
    msg.set_field(98, "0");
    msg.set_field(108, heart_bt_int_secs.to_string());
    msg
}

pub fn build_logout(text: Option<&str>, sender_comp_id: &str, target_comp_id: &str) -> FixMessage {
    let mut msg = FixMessage::new(FixMsgType::Logout);
    msg.set_field(49, sender_comp_id);
    msg.set_field(56, target_comp_id);
    if let Some(t) = text { msg.set_field(58, t); }
    msg
}
