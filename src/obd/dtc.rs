//! Diagnostic trouble code decoding for Modes 0x03, 0x07, and 0x0A.
//!
//! On CAN the response carries a count byte followed by two-byte code
//! pairs. The top two bits of each pair select the system letter
//! (P/C/B/U); the remainder formats as four hex digits, e.g. `P0301`.

/// Formats one two-byte DTC value.
pub fn format_dtc(raw: u16) -> String {
    let letter = match (raw >> 14) & 0x03 {
        0 => 'P',
        1 => 'C',
        2 => 'B',
        _ => 'U',
    };
    format!("{letter}{:04X}", raw & 0x3FFF)
}

/// Decodes a Mode 0x03/0x07/0x0A response body into formatted codes.
///
/// Accepts both the CAN shape (leading count byte) and the bare pair list;
/// all-zero pairs are padding and are skipped.
pub fn decode_dtcs(data: &[u8]) -> Vec<String> {
    // A leading count byte is present when it is consistent with the length.
    let body = match data.split_first() {
        Some((&count, rest)) if rest.len() >= count as usize * 2 => rest,
        _ => data,
    };

    body.chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .filter(|raw| *raw != 0)
        .map(format_dtc)
        .collect()
}
