//! Narrow DER decoders for the certificate fields the verifier needs.
//!
//! Every length read from the input is checked against the bytes actually
//! remaining before it is used; nothing here panics on hostile input.
//!
//! ```text
//!   Name ::= SEQUENCE OF
//!     SET { SEQUENCE { OID 2.5.4.x, PrintableString | UTF8String } }
//!
//!   2.5.4.6 → "/C="   2.5.4.8 → "/ST="   2.5.4.7 → "/L="
//!   2.5.4.10 → "/O="  2.5.4.3 → "/CN="
//! ```

use core::fmt;

use serde::{Deserialize, Serialize};

const TAG_SEQUENCE: u8 = 0x30;
const TAG_SET: u8 = 0x31;
const TAG_OID: u8 = 0x06;
const TAG_INTEGER: u8 = 0x02;
const TAG_PRINTABLE_STRING: u8 = 0x13;
const TAG_UTF8_STRING: u8 = 0x0C;
const TAG_UTC_TIME: u8 = 0x17;
const TAG_GENERALIZED_TIME: u8 = 0x18;

/// `id-at` arc shared by every supported attribute type.
const ID_AT: [u8; 2] = [0x55, 0x04];

/// Longest rendered subject, e.g. `/C=US/ST=.../CN=...`.
pub const SUBJECT_MAX: usize = 256;

pub type SubjectString = heapless::String<SUBJECT_MAX>;

/// Seconds since the Unix epoch (UTC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn secs(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Asn1Error {
    /// Input ended inside a TLV.
    Truncated,
    /// A different tag was found where one was required.
    UnexpectedTag(u8),
    /// Length encoding is indefinite or wider than two bytes.
    BadLength,
    /// An RDN used an OID other than the five supported attributes.
    UnknownAttribute,
    /// Attribute value is not valid UTF-8.
    BadString,
    /// Rendered subject exceeds [`SUBJECT_MAX`].
    TooLong,
    /// A time field held a non-digit or out-of-range component.
    BadTime,
}

impl fmt::Display for Asn1Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "truncated TLV"),
            Self::UnexpectedTag(t) => write!(f, "unexpected tag 0x{t:02X}"),
            Self::BadLength => write!(f, "unsupported length encoding"),
            Self::UnknownAttribute => write!(f, "unknown subject attribute"),
            Self::BadString => write!(f, "attribute is not UTF-8"),
            Self::TooLong => write!(f, "subject too long"),
            Self::BadTime => write!(f, "malformed time"),
        }
    }
}

// ── TLV reader ────────────────────────────────────────────────

/// Split one TLV off the front of `input`: `(tag, content, rest)`.
fn read_tlv(input: &[u8]) -> Result<(u8, &[u8], &[u8]), Asn1Error> {
    let (&tag, after_tag) = input.split_first().ok_or(Asn1Error::Truncated)?;
    let (len, body) = read_length(after_tag)?;
    if body.len() < len {
        return Err(Asn1Error::Truncated);
    }
    let (content, rest) = body.split_at(len);
    Ok((tag, content, rest))
}

fn read_length(input: &[u8]) -> Result<(usize, &[u8]), Asn1Error> {
    let (&first, rest) = input.split_first().ok_or(Asn1Error::Truncated)?;
    match first {
        0x00..=0x7F => Ok((first as usize, rest)),
        0x81 => {
            let (&b, rest) = rest.split_first().ok_or(Asn1Error::Truncated)?;
            Ok((b as usize, rest))
        }
        0x82 => match rest {
            [hi, lo, rest @ ..] => Ok((((*hi as usize) << 8) | *lo as usize, rest)),
            _ => Err(Asn1Error::Truncated),
        },
        _ => Err(Asn1Error::BadLength),
    }
}

fn expect_tlv(input: &[u8], want: u8) -> Result<(&[u8], &[u8]), Asn1Error> {
    let (tag, content, rest) = read_tlv(input)?;
    if tag != want {
        return Err(Asn1Error::UnexpectedTag(tag));
    }
    Ok((content, rest))
}

// ── Subject ───────────────────────────────────────────────────

fn attribute_prefix(oid: &[u8]) -> Result<&'static str, Asn1Error> {
    match oid {
        [0x55, 0x04, 0x06] => Ok("/C="),
        [0x55, 0x04, 0x08] => Ok("/ST="),
        [0x55, 0x04, 0x07] => Ok("/L="),
        [0x55, 0x04, 0x0A] => Ok("/O="),
        [0x55, 0x04, 0x03] => Ok("/CN="),
        _ => Err(Asn1Error::UnknownAttribute),
    }
}

/// Render a DER `Name` as `/C=../ST=../L=../O=../CN=..` in encoded order.
pub fn decode_subject(der: &[u8]) -> Result<SubjectString, Asn1Error> {
    let (mut rdns, _) = expect_tlv(der, TAG_SEQUENCE)?;
    let mut out = SubjectString::new();

    while !rdns.is_empty() {
        let (set, rest) = expect_tlv(rdns, TAG_SET)?;
        rdns = rest;

        let (atv, _) = expect_tlv(set, TAG_SEQUENCE)?;
        let (oid, value_tlv) = expect_tlv(atv, TAG_OID)?;
        if oid.len() != 3 || oid[..2] != ID_AT {
            return Err(Asn1Error::UnknownAttribute);
        }
        let prefix = attribute_prefix(oid)?;

        let (tag, value, _) = read_tlv(value_tlv)?;
        if tag != TAG_PRINTABLE_STRING && tag != TAG_UTF8_STRING {
            return Err(Asn1Error::UnexpectedTag(tag));
        }
        let value = core::str::from_utf8(value).map_err(|_| Asn1Error::BadString)?;

        out.push_str(prefix).map_err(|()| Asn1Error::TooLong)?;
        out.push_str(value).map_err(|()| Asn1Error::TooLong)?;
    }

    Ok(out)
}

/// Compare two DER subjects by their rendered form, byte-for-byte up to the
/// shorter length. Undecodable or empty subjects never match.
pub fn subjects_match(peer: &[u8], known: &[u8]) -> bool {
    let (Ok(peer), Ok(known)) = (decode_subject(peer), decode_subject(known)) else {
        return false;
    };
    let n = peer.len().min(known.len());
    n > 0 && peer.as_bytes()[..n] == known.as_bytes()[..n]
}

// ── Time ──────────────────────────────────────────────────────

fn digits(s: &[u8]) -> Result<u32, Asn1Error> {
    s.iter().try_fold(0u32, |acc, &b| {
        if b.is_ascii_digit() {
            Ok(acc * 10 + u32::from(b - b'0'))
        } else {
            Err(Asn1Error::BadTime)
        }
    })
}

fn is_leap(year: u32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

fn days_in_month(year: u32, month: u32) -> u32 {
    match month {
        2 if is_leap(year) => 29,
        2 => 28,
        4 | 6 | 9 | 11 => 30,
        _ => 31,
    }
}

/// Days since 1970-01-01 for a proleptic Gregorian date.
fn days_from_civil(year: u32, month: u32, day: u32) -> i64 {
    let y = i64::from(year) - i64::from(month <= 2);
    let era = y.div_euclid(400);
    let yoe = y - era * 400;
    let m = i64::from(month);
    let doy = (153 * (if m > 2 { m - 3 } else { m + 9 }) + 2) / 5 + i64::from(day) - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

/// Parse a complete UTCTime or GeneralizedTime TLV.
///
/// Two-digit years below 70 are 20xx, the rest 19xx. Trailing zone
/// designators after the seconds are ignored.
pub fn parse_time(tlv: &[u8]) -> Result<Timestamp, Asn1Error> {
    let (tag, content, _) = read_tlv(tlv)?;
    let (year, rest) = match tag {
        TAG_UTC_TIME if content.len() >= 12 => {
            let yy = digits(&content[..2])?;
            (if yy < 70 { 2000 + yy } else { 1900 + yy }, &content[2..])
        }
        TAG_GENERALIZED_TIME if content.len() >= 14 => (digits(&content[..4])?, &content[4..]),
        TAG_UTC_TIME | TAG_GENERALIZED_TIME => return Err(Asn1Error::Truncated),
        other => return Err(Asn1Error::UnexpectedTag(other)),
    };

    let month = digits(&rest[0..2])?;
    let day = digits(&rest[2..4])?;
    let hour = digits(&rest[4..6])?;
    let minute = digits(&rest[6..8])?;
    let second = digits(&rest[8..10])?;

    if year < 1970
        || !(1..=12).contains(&month)
        || day == 0
        || day > days_in_month(year, month)
        || hour > 23
        || minute > 59
        || second > 59
    {
        return Err(Asn1Error::BadTime);
    }

    let days = days_from_civil(year, month, day);
    let secs = days * 86_400 + i64::from(hour * 3_600 + minute * 60 + second);
    Ok(Timestamp(secs as u64))
}

// ── Certificates and signatures ───────────────────────────────

/// Total encoded length of the DER SEQUENCE at the start of `der`, or
/// `None` if it does not start with a definite-length SEQUENCE.
pub fn der_total_len(der: &[u8]) -> Option<usize> {
    let (&tag, after_tag) = der.split_first()?;
    if tag != TAG_SEQUENCE {
        return None;
    }
    let (len, body) = read_length(after_tag).ok()?;
    let header = der.len() - body.len();
    Some(header + len)
}

fn push_integer(out: &mut heapless::Vec<u8, 72>, scalar: &[u8]) {
    let first_nonzero = scalar.iter().position(|&b| b != 0).unwrap_or(scalar.len() - 1);
    let trimmed = &scalar[first_nonzero..];
    let pad = trimmed[0] & 0x80 != 0;
    // Capacity: 2 × (2 + 33) + 2 = 72, so these pushes cannot fail.
    let _ = out.push(TAG_INTEGER);
    let _ = out.push((trimmed.len() + usize::from(pad)) as u8);
    if pad {
        let _ = out.push(0x00);
    }
    let _ = out.extend_from_slice(trimmed);
}

/// Re-encode a raw P-256 `r || s` signature as a DER `ECDSA-Sig-Value`.
pub fn signature_to_der(raw: &[u8; 64]) -> heapless::Vec<u8, 72> {
    let mut body: heapless::Vec<u8, 72> = heapless::Vec::new();
    push_integer(&mut body, &raw[..32]);
    push_integer(&mut body, &raw[32..]);

    let mut out = heapless::Vec::new();
    let _ = out.push(TAG_SEQUENCE);
    let _ = out.push(body.len() as u8);
    let _ = out.extend_from_slice(&body);
    out
}
