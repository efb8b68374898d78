//! Byte-to-text decoding for pruner input.
//! UTF-8 by default, UTF-16/UTF-32 when a BOM says so. Never fails: bad
//! sequences become U+FFFD.

const UTF32_LE_BOM: &[u8] = b"\xff\xfe\x00\x00";
const UTF32_BE_BOM: &[u8] = b"\x00\x00\xfe\xff";
const UTF16_LE_BOM: &[u8] = b"\xff\xfe";
const UTF16_BE_BOM: &[u8] = b"\xfe\xff";
const UTF8_BOM: &[u8] = b"\xef\xbb\xbf";

/// Decode raw input bytes into text, honoring a leading byte-order mark.
pub fn decode_bytes(data: &[u8]) -> String {
    // UTF-32 LE must be checked before UTF-16 LE: its BOM starts with FF FE.
    if let Some(rest) = data.strip_prefix(UTF32_LE_BOM) {
        return decode_utf32(rest, u32::from_le_bytes);
    }
    if let Some(rest) = data.strip_prefix(UTF32_BE_BOM) {
        return decode_utf32(rest, u32::from_be_bytes);
    }
    if let Some(rest) = data.strip_prefix(UTF16_LE_BOM) {
        return decode_utf16(rest, u16::from_le_bytes);
    }
    if let Some(rest) = data.strip_prefix(UTF16_BE_BOM) {
        return decode_utf16(rest, u16::from_be_bytes);
    }
    let body = data.strip_prefix(UTF8_BOM).unwrap_or(data);
    String::from_utf8_lossy(body).into_owned()
}

fn decode_utf16(data: &[u8], unit: fn([u8; 2]) -> u16) -> String {
    let chunks = data.chunks_exact(2);
    let dangling = !chunks.remainder().is_empty();
    let units = chunks.map(|pair| unit([pair[0], pair[1]]));
    let mut text: String = char::decode_utf16(units)
        .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect();
    if dangling {
        text.push(char::REPLACEMENT_CHARACTER);
    }
    text
}

fn decode_utf32(data: &[u8], unit: fn([u8; 4]) -> u32) -> String {
    let chunks = data.chunks_exact(4);
    let dangling = !chunks.remainder().is_empty();
    let mut text: String = chunks
        .map(|quad| unit([quad[0], quad[1], quad[2], quad[3]]))
        .map(|cp| char::from_u32(cp).unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect();
    if dangling {
        text.push(char::REPLACEMENT_CHARACTER);
    }
    text
}
