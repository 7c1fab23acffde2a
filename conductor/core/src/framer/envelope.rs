//! OSC Envelope Scanning
//!
//! Conductor frames travel inside OSC sequences:
//!
//! ```text
//! ESC ] <code> ; <payload> ST        ST = ESC \  or  BEL
//! ```
//!
//! Codes 134 and 135 carry conductor payloads. The remote framer script
//! prefixes payloads with `:`, which is stripped when the payload is read as
//! text.
//!
//! The scanner looks at the front of a byte slice and classifies what is
//! there without consuming anything; callers decide what to do with it.

/// Escape
pub const ESC: u8 = 0x1b;

/// Bell, an alternate OSC terminator
pub const BEL: u8 = 0x07;

/// Envelope code for conductor notifications and command frames
pub const OSC_CONDUCTOR: u16 = 134;

/// Envelope code for conductor control frames (`begin`, `unhook`)
pub const OSC_CONDUCTOR_CONTROL: u16 = 135;

/// A complete OSC sequence at the front of the input
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Envelope<'a> {
    /// Numeric code, or `None` if the sequence had no parseable code
    pub code: Option<u16>,
    /// Payload bytes between `;` and the terminator
    pub payload: &'a [u8],
    /// Total length including introducer and terminator
    pub len: usize,
}

impl Envelope<'_> {
    /// Whether this envelope carries a conductor payload
    #[must_use]
    pub fn is_conductor(&self) -> bool {
        matches!(self.code, Some(OSC_CONDUCTOR | OSC_CONDUCTOR_CONTROL))
    }

    /// Payload as text, with one leading `:` removed
    #[must_use]
    pub fn text(&self) -> String {
        let payload = self.payload.strip_prefix(b":").unwrap_or(self.payload);
        String::from_utf8_lossy(payload).into_owned()
    }
}

/// What the scanner found at the front of the input
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scan<'a> {
    /// A complete OSC sequence
    Envelope(Envelope<'a>),
    /// `len` bytes that are not part of any OSC sequence
    Other {
        /// Number of bytes in the run
        len: usize,
    },
    /// The front of the input might be an envelope but is not complete yet
    Incomplete,
    /// A conductor OSC sequence has run past the size limit without terminating
    TooLarge,
}

/// Classify the bytes at the front of `input`
///
/// `max_len` bounds the payload of an unterminated conductor sequence. A
/// longer sequence with any other code is reported as [`Scan::Other`] up to
/// the limit, so the rest of it reads as plain bytes.
#[must_use]
pub fn scan(input: &[u8], max_len: usize) -> Scan<'_> {
    let Some(&first) = input.first() else {
        return Scan::Incomplete;
    };

    if first != ESC {
        let len = input
            .iter()
            .position(|&b| b == ESC)
            .unwrap_or(input.len());
        return Scan::Other { len };
    }

    match input.get(1) {
        None => return Scan::Incomplete,
        Some(&b']') => {}
        Some(_) => return Scan::Other { len: 1 },
    }

    // Numeric code up to ';'
    let mut idx = 2;
    while idx < input.len() && input[idx].is_ascii_digit() {
        idx += 1;
    }
    if idx >= input.len() {
        // A code this long cannot be a conductor code
        return if idx > max_len { Scan::Other { len: idx } } else { Scan::Incomplete };
    }
    let (code, payload_start) = if input[idx] == b';' && idx > 2 {
        let digits = std::str::from_utf8(&input[2..idx]).ok();
        (digits.and_then(|d| d.parse::<u16>().ok()), idx + 1)
    } else {
        (None, 2)
    };

    let mut pos = payload_start;
    while pos < input.len() {
        match input[pos] {
            BEL => {
                return Scan::Envelope(Envelope {
                    code,
                    payload: &input[payload_start..pos],
                    len: pos + 1,
                });
            }
            ESC => match input.get(pos + 1) {
                None => return Scan::Incomplete,
                Some(&b'\\') => {
                    return Scan::Envelope(Envelope {
                        code,
                        payload: &input[payload_start..pos],
                        len: pos + 2,
                    });
                }
                // An escape that is not ST aborts the sequence; what came
                // before it was never a valid envelope.
                Some(_) => return Scan::Other { len: pos },
            },
            _ => {}
        }
        if pos - payload_start >= max_len {
            // Only conductor payloads are bounded. An oversized foreign
            // sequence (inline images, clipboard writes) is passed over in
            // pieces.
            return if matches!(code, Some(OSC_CONDUCTOR | OSC_CONDUCTOR_CONTROL)) {
                Scan::TooLarge
            } else {
                Scan::Other { len: pos }
            };
        }
        pos += 1;
    }
    Scan::Incomplete
}

/// Wrap `payload` in an OSC envelope terminated by ST
///
/// The inverse of [`scan`], used to build streams for replay and tests.
#[must_use]
pub fn encode(code: u16, payload: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 10);
    out.extend_from_slice(&[ESC, b']']);
    out.extend_from_slice(code.to_string().as_bytes());
    out.push(b';');
    out.extend_from_slice(payload.as_bytes());
    out.extend_from_slice(&[ESC, b'\\']);
    out
}
