// ABOUTME: Encoding selection and protocol-legal segmentation for SMS text bodies
// ABOUTME: Picks the narrowest safe encoding, then splits into single-PDU-sized segments

use thiserror::Error;

use crate::datatypes::{DataCoding, MessageClass};

/// GSM 03.38 basic character set (positions 0x00-0x7F), `None` for
/// unassigned code points.
const GSM7_BASIC: [char; 128] = [
    '@', '£', '$', '¥', 'è', 'é', 'ù', 'ì', 'ò', 'Ç', '\n', 'Ø', 'ø', '\r', 'Å', 'å', 'Δ', '_',
    'Φ', 'Γ', 'Λ', 'Ω', 'Π', 'Ψ', 'Σ', 'Θ', 'Ξ', '\u{1b}', 'Æ', 'æ', 'ß', 'É', ' ', '!', '"', '#',
    '¤', '%', '&', '\'', '(', ')', '*', '+', ',', '-', '.', '/', '0', '1', '2', '3', '4', '5',
    '6', '7', '8', '9', ':', ';', '<', '=', '>', '?', '¡', 'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H',
    'I', 'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z', 'Ä',
    'Ö', 'Ñ', 'Ü', '§', '¿', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n',
    'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z', 'ä', 'ö', 'ñ', 'ü', 'à',
];

/// GSM 03.38 extension table, reachable via the 0x1B escape byte. Index is
/// the escape code; characters not present here are not representable in
/// the extension table.
const GSM7_EXTENSION: &[(u8, char)] = &[
    (0x0A, '\u{0C}'), // form feed
    (0x14, '^'),
    (0x28, '{'),
    (0x29, '}'),
    (0x2F, '\\'),
    (0x3C, '['),
    (0x3D, '~'),
    (0x3E, ']'),
    (0x40, '|'),
    (0x65, '€'),
];

const SEPTETS_PER_SEGMENT: usize = 160;
const SEPTETS_PER_CONCAT_SEGMENT: usize = 153; // 160 - 7 bytes UDH (ceil to septets)
const OCTETS_PER_SEGMENT: usize = 140;
const OCTETS_PER_CONCAT_SEGMENT: usize = 133; // 140 - 7
const UCS2_UNITS_PER_SEGMENT: usize = 70;
const UCS2_UNITS_PER_CONCAT_SEGMENT: usize = 67; // 70 - 3 (UDH is 7 bytes = 3.5 UCS-2 units, rounded)

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodingError {
    #[error("text contains a code point not representable in any supported encoding")]
    Unrepresentable,
}

fn gsm7_index(c: char) -> Option<u8> {
    GSM7_BASIC.iter().position(|&b| b == c).map(|i| i as u8)
}

fn gsm7_extension_index(c: char) -> Option<u8> {
    GSM7_EXTENSION
        .iter()
        .find(|(_, ch)| *ch == c)
        .map(|(code, _)| *code)
}

/// One character's encoding in the 7-bit alphabet: a plain septet, or an
/// escape-sequence pair (0x1B + extension code) that must never be split
/// across a segment boundary.
enum Gsm7Char {
    Plain(u8),
    Escaped(u8),
}

fn classify_gsm7(c: char) -> Option<Gsm7Char> {
    if let Some(i) = gsm7_index(c) {
        Some(Gsm7Char::Plain(i))
    } else {
        gsm7_extension_index(c).map(Gsm7Char::Escaped)
    }
}

fn fits_gsm7(text: &str) -> bool {
    text.chars().all(|c| classify_gsm7(c).is_some())
}

fn fits_latin1(text: &str) -> bool {
    text.chars().all(|c| (c as u32) <= 0xFF)
}

/// Picks the narrowest safe encoding for `text` per spec §4.1: 7-bit default
/// alphabet (with extension escapes), else 8-bit Latin-1, else 16-bit UCS-2.
pub fn select_encoding(text: &str) -> Result<DataCoding, EncodingError> {
    if fits_gsm7(text) {
        Ok(DataCoding::SmscDefault)
    } else if fits_latin1(text) {
        Ok(DataCoding::Latin1)
    } else if text.chars().all(|c| (c as u32) <= 0xFFFF) {
        Ok(DataCoding::Ucs2)
    } else {
        Err(EncodingError::Unrepresentable)
    }
}

/// Pack a sequence of GSM7 "character units" (septets, with escape pairs
/// counted as one character unit occupying two septets) into 7-bit packed
/// octets, per GSM 03.38 packing rules.
fn pack_septets(units: &[Gsm7CharUnit]) -> Vec<u8> {
    let mut septets = Vec::new();
    for unit in units {
        match unit {
            Gsm7CharUnit::Plain(v) => septets.push(*v),
            Gsm7CharUnit::Escaped(v) => {
                septets.push(0x1B);
                septets.push(*v);
            }
        }
    }
    let mut out = Vec::with_capacity((septets.len() * 7 + 7) / 8);
    let mut acc: u16 = 0;
    let mut bits = 0u32;
    for s in septets {
        acc |= (s as u16) << bits;
        bits += 7;
        if bits >= 8 {
            out.push((acc & 0xFF) as u8);
            acc >>= 8;
            bits -= 8;
        }
    }
    if bits > 0 {
        out.push((acc & 0xFF) as u8);
    }
    out
}

enum Gsm7CharUnit {
    Plain(u8),
    Escaped(u8),
}

/// The character-unit count consumed in a segment by one source character:
/// 1 for plain, 2 for an escaped extension character. Used so segmentation
/// never splits an escape pair across segments.
fn char_unit_len(c: char) -> usize {
    match classify_gsm7(c) {
        Some(Gsm7Char::Plain(_)) => 1,
        Some(Gsm7Char::Escaped(_)) => 2,
        None => 1,
    }
}

fn to_gsm7_unit(c: char) -> Gsm7CharUnit {
    match classify_gsm7(c).expect("caller already validated via fits_gsm7") {
        Gsm7Char::Plain(v) => Gsm7CharUnit::Plain(v),
        Gsm7Char::Escaped(v) => Gsm7CharUnit::Escaped(v),
    }
}

/// Split `text` into chunks of at most `limit` GSM7 character units, never
/// breaking an escape pair across a chunk boundary.
fn chunk_gsm7(text: &str, limit: usize) -> Vec<Vec<char>> {
    let mut chunks = Vec::new();
    let mut current = Vec::new();
    let mut current_units = 0usize;
    for c in text.chars() {
        let units = char_unit_len(c);
        if current_units + units > limit && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_units = 0;
        }
        current.push(c);
        current_units += units;
    }
    if !current.is_empty() || chunks.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Split `text` (already validated to fit UCS-2) into chunks of at most
/// `limit` UTF-16 code units, never splitting a surrogate pair.
fn chunk_ucs2(text: &str, limit: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_units = 0usize;
    for c in text.chars() {
        let units = c.len_utf16();
        if current_units + units > limit && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_units = 0;
        }
        current.push(c);
        current_units += units;
    }
    if !current.is_empty() || chunks.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn chunk_bytes(bytes: &[u8], limit: usize) -> Vec<Vec<u8>> {
    if bytes.is_empty() {
        return vec![Vec::new()];
    }
    bytes.chunks(limit).map(|c| c.to_vec()).collect()
}

/// A concatenated-SMS user-data header (7 bytes, spec §4.1): reference,
/// total parts, part number.
fn udh(reference: u8, total: u8, sequence: u8) -> [u8; 7] {
    [0x06, 0x08, 0x04, 0x00, reference, total, sequence]
}

/// The outcome of segmenting a text body: the wire encoding tag and the
/// ordered list of segment payload bytes (each already including any UDH).
pub struct Segmented {
    pub encoding: DataCoding,
    pub segments: Vec<Vec<u8>>,
}

/// Segments `text` into protocol-legal PDU bodies per spec §4.1.
///
/// `reference` is the concatenated-message reference byte; callers should
/// use a per-session monotonic counter so concurrent multi-part sends don't
/// collide at the receiver.
pub fn segment(text: &str, reference: u8) -> Result<Segmented, EncodingError> {
    let encoding = select_encoding(text)?;
    let segments = match encoding {
        DataCoding::SmscDefault | DataCoding::Gsm7BitWithClass(_) => {
            let single = pack_septets(
                &text
                    .chars()
                    .map(to_gsm7_unit)
                    .collect::<Vec<_>>(),
            );
            if fits_in_single_segment(text, SEPTETS_PER_SEGMENT) {
                vec![single]
            } else {
                let chunks = chunk_gsm7(text, SEPTETS_PER_CONCAT_SEGMENT);
                build_concat_segments(chunks.len(), reference, |i| {
                    pack_septets(
                        &chunks[i]
                            .iter()
                            .map(|c| to_gsm7_unit(*c))
                            .collect::<Vec<_>>(),
                    )
                })
            }
        }
        DataCoding::Latin1 => {
            let bytes: Vec<u8> = text.chars().map(|c| c as u8).collect();
            if bytes.len() <= OCTETS_PER_SEGMENT {
                vec![bytes]
            } else {
                let chunks = chunk_bytes(&bytes, OCTETS_PER_CONCAT_SEGMENT);
                build_concat_segments(chunks.len(), reference, |i| chunks[i].clone())
            }
        }
        DataCoding::Ucs2 | DataCoding::Ucs2WithClass(_) => {
            let units: usize = text.chars().map(|c| c.len_utf16()).sum();
            if units <= UCS2_UNITS_PER_SEGMENT {
                vec![encode_ucs2(text)]
            } else {
                let chunks = chunk_ucs2(text, UCS2_UNITS_PER_CONCAT_SEGMENT);
                build_concat_segments(chunks.len(), reference, |i| encode_ucs2(&chunks[i]))
            }
        }
        _ => unreachable!("select_encoding only returns the three encodings above"),
    };
    Ok(Segmented { encoding, segments })
}

fn fits_in_single_segment(text: &str, limit: usize) -> bool {
    let units: usize = text.chars().map(char_unit_len).sum();
    units <= limit
}

fn encode_ucs2(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len() * 2);
    for unit in text.encode_utf16() {
        out.extend_from_slice(&unit.to_be_bytes());
    }
    out
}

fn build_concat_segments(
    count: usize,
    reference: u8,
    mut body_for: impl FnMut(usize) -> Vec<u8>,
) -> Vec<Vec<u8>> {
    (0..count)
        .map(|i| {
            let mut out = Vec::new();
            out.extend_from_slice(&udh(reference, count as u8, (i + 1) as u8));
            out.extend_from_slice(&body_for(i));
            out
        })
        .collect()
}

pub fn message_class_coding(class: MessageClass) -> DataCoding {
    DataCoding::Gsm7BitWithClass(class)
}

fn gsm7_char_for_septet(v: u8) -> char {
    GSM7_BASIC.get(v as usize).copied().unwrap_or('?')
}

fn gsm7_char_for_extension(code: u8) -> char {
    GSM7_EXTENSION
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, ch)| *ch)
        .unwrap_or(' ')
}

/// Decode a "7-bit unpacked" body: one octet per character unit, each value
/// a GSM 03.38 septet (0x1B escapes into the extension table). This is the
/// wire shape inbound `submit_sm` bodies arrive in for `data_coding=0`
///.
fn decode_gsm7_unpacked(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    let mut iter = bytes.iter();
    while let Some(&b) = iter.next() {
        if b == 0x1B {
            match iter.next() {
                Some(&ext) => out.push(gsm7_char_for_extension(ext)),
                None => break,
            }
        } else {
            out.push(gsm7_char_for_septet(b & 0x7F));
        }
    }
    out
}

/// Decode a bit-packed 7-bit body (the inverse of `pack_septets`) — a
/// "private GSM-7 unpacking" some carrier peers use instead of one-octet-
/// per-septet.
pub fn decode_gsm7_packed(bytes: &[u8]) -> String {
    let mut septets = Vec::new();
    let mut acc: u16 = 0;
    let mut bits = 0u32;
    for &byte in bytes {
        acc |= (byte as u16) << bits;
        bits += 8;
        while bits >= 7 {
            septets.push((acc & 0x7F) as u8);
            acc >>= 7;
            bits -= 7;
        }
    }
    let mut out = String::with_capacity(septets.len());
    let mut iter = septets.into_iter();
    while let Some(v) = iter.next() {
        if v == 0x1B {
            match iter.next() {
                Some(ext) => out.push(gsm7_char_for_extension(ext)),
                None => break,
            }
        } else {
            out.push(gsm7_char_for_septet(v));
        }
    }
    out
}

fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

fn decode_ucs2(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

/// Decode an inbound PDU body per its declared `data_coding`"). The default/class-tagged 7-bit
/// codings are treated as one-octet-per-septet; a peer that instead sends
/// true bit-packed septets should be decoded with `decode_gsm7_packed`.
pub fn decode(bytes: &[u8], coding: DataCoding) -> String {
    match coding {
        DataCoding::SmscDefault | DataCoding::Gsm7BitWithClass(_) => decode_gsm7_unpacked(bytes),
        DataCoding::Latin1 => decode_latin1(bytes),
        DataCoding::Ucs2 | DataCoding::Ucs2WithClass(_) => decode_ucs2(bytes),
        DataCoding::Ascii | DataCoding::Binary | DataCoding::Cyrillic | DataCoding::LatinHebrew
        | DataCoding::Jis | DataCoding::Custom(_) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

/// Strip C0 control characters other than `\n`/`\t` from a decoded body
///.
pub fn clean_control_chars(text: &str) -> String {
    text.chars()
        .filter(|c| *c == '\n' || *c == '\t' || !c.is_control())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_text_selects_gsm7_single_segment() {
        let out = segment("Hi", 1).unwrap();
        assert_eq!(out.encoding, DataCoding::SmscDefault);
        assert_eq!(out.segments.len(), 1);
    }

    #[test]
    fn text_with_one_non_latin1_bmp_char_selects_ucs2() {
        let text = "hello \u{3042}";
        let out = segment(text, 1).unwrap();
        assert_eq!(out.encoding, DataCoding::Ucs2);
    }

    #[test]
    fn ucs2_body_needing_two_segments_splits_correctly() {
        // 70 + 1 code units, all BMP (no surrogate pairs), with one non-latin1
        // char to force UCS-2 selection.
        let text = "\u{3042}".repeat(71);
        let out = segment(&text, 7).unwrap();
        assert_eq!(out.encoding, DataCoding::Ucs2);
        assert_eq!(out.segments.len(), 2);
        // each concat segment carries a 7-byte UDH
        assert_eq!(out.segments[0][0], 0x06);
        assert_eq!(out.segments[0][5], 2); // total parts
        assert_eq!(out.segments[0][6], 1); // sequence
        assert_eq!(out.segments[1][6], 2);
    }

    #[test]
    fn gsm7_escape_sequence_never_splits_across_segments() {
        // Fill up to exactly the boundary with plain chars, then an escaped char.
        let mut text = String::new();
        for _ in 0..(SEPTETS_PER_CONCAT_SEGMENT - 1) {
            text.push('a');
        }
        text.push('€'); // 2-septet escape sequence
        text.push('b');
        let out = segment(&text, 3).unwrap();
        assert_eq!(out.encoding, DataCoding::SmscDefault);
        assert_eq!(out.segments.len(), 2);
    }

    #[test]
    fn latin1_only_body_is_single_segment_under_limit() {
        let text = "caf\u{e9}".repeat(10); // 'café' repeated, Latin-1 only
        let out = segment(&text, 1).unwrap();
        assert_eq!(out.encoding, DataCoding::Latin1);
        assert_eq!(out.segments.len(), 1);
    }

    #[test]
    fn decode_gsm7_unpacked_round_trips_ascii() {
        let bytes: Vec<u8> = "Hello".chars().map(|c| gsm7_index(c).unwrap()).collect();
        assert_eq!(decode(&bytes, DataCoding::SmscDefault), "Hello");
    }

    #[test]
    fn decode_ucs2_round_trips_bmp_char() {
        let text = "hi \u{3042}";
        let segmented = segment(text, 1).unwrap();
        assert_eq!(decode(&segmented.segments[0], DataCoding::Ucs2), text);
    }

    #[test]
    fn decode_latin1_handles_accented_chars() {
        let bytes = vec![b'c', b'a', b'f', 0xE9]; // 'café' in Latin-1
        assert_eq!(decode(&bytes, DataCoding::Latin1), "caf\u{e9}");
    }

    #[test]
    fn clean_control_chars_strips_non_whitespace_controls() {
        let dirty = "hi\u{0007}there\nok";
        assert_eq!(clean_control_chars(dirty), "hithere\nok");
    }

    #[test]
    fn unrepresentable_code_point_is_rejected() {
        // Surrogate-only scalar values can't occur in a valid `char`, so use
        // a code point above the BMP instead (requires UTF-16 surrogate pair,
        // which this encoding set doesn't support beyond BMP UCS-2).
        let text = "\u{10000}";
        assert_eq!(select_encoding(text), Err(EncodingError::Unrepresentable));
    }
}
