use encoding_rs::{UTF_16BE, UTF_16LE};

/// Encodes a request payload as the gateway's required 16-bit stream:
/// a little-endian BOM followed by UTF-16LE code units.
pub fn encode_request(payload: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(2 + payload.len() * 2);
    bytes.extend_from_slice(&[0xFF, 0xFE]);
    for unit in payload.encode_utf16() {
        bytes.extend_from_slice(&unit.to_le_bytes());
    }
    bytes
}

/// Content type matching [`encode_request`].
pub const REQUEST_CONTENT_TYPE: &str = "text/xml; charset=utf-16";

/// Decodes a response body by trying, in order: UTF-16 honouring a BOM,
/// UTF-16LE without one, UTF-8, then Latin-1 as the lossless fallback.
/// The first decoding that passes its encoding checks wins; Latin-1 cannot
/// fail, so this function always produces text.
pub fn decode_body(bytes: &[u8]) -> String {
    if let Some(rest) = bytes.strip_prefix(&[0xFF, 0xFE]) {
        if let Some(text) = UTF_16LE.decode_without_bom_handling_and_without_replacement(rest) {
            return text.into_owned();
        }
    }
    if let Some(rest) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        if let Some(text) = UTF_16BE.decode_without_bom_handling_and_without_replacement(rest) {
            return text.into_owned();
        }
    }
    // A BOM-less 16-bit body of the gateway's report text always carries
    // NUL high bytes; an even-length 8-bit body never does.
    if bytes.len() % 2 == 0 && bytes.contains(&0) {
        if let Some(text) = UTF_16LE.decode_without_bom_handling_and_without_replacement(bytes) {
            return text.into_owned();
        }
    }
    if let Ok(text) = std::str::from_utf8(bytes) {
        return text.to_string();
    }
    encoding_rs::mem::decode_latin1(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utf16le_bytes(text: &str, bom: bool) -> Vec<u8> {
        let mut bytes = Vec::new();
        if bom {
            bytes.extend_from_slice(&[0xFF, 0xFE]);
        }
        for unit in text.encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        bytes
    }

    #[test]
    fn request_encoding_round_trips() {
        let payload = "<ENVELOPE>ñ «data»</ENVELOPE>";
        let bytes = encode_request(payload);
        assert_eq!(&bytes[..2], &[0xFF, 0xFE]);
        assert_eq!(decode_body(&bytes), payload);
    }

    #[test]
    fn decodes_utf16_with_and_without_bom() {
        let text = "<F01>Sales ñ</F01>";
        assert_eq!(decode_body(&utf16le_bytes(text, true)), text);
        assert_eq!(decode_body(&utf16le_bytes(text, false)), text);
    }

    #[test]
    fn decodes_big_endian_bom() {
        let text = "<F01>ok</F01>";
        let mut bytes = vec![0xFE, 0xFF];
        for unit in text.encode_utf16() {
            bytes.extend_from_slice(&unit.to_be_bytes());
        }
        assert_eq!(decode_body(&bytes), text);
    }

    #[test]
    fn even_length_ascii_is_not_mistaken_for_utf16() {
        let text = "\"120\",\"3456\"\r\n";
        assert_eq!(text.len() % 2, 0);
        assert_eq!(decode_body(text.as_bytes()), text);
    }

    #[test]
    fn falls_back_to_utf8_on_odd_length() {
        // An odd byte count cannot be UTF-16; the UTF-8 attempt wins.
        let text = "<F01>abc</F01>x";
        assert_eq!(text.len() % 2, 1);
        assert_eq!(decode_body(text.as_bytes()), text);
    }

    #[test]
    fn latin1_is_the_last_resort() {
        // 0xF1 alone is invalid UTF-8 and the odd length rules out UTF-16.
        let bytes = [b'<', b'F', b'0', b'1', b'>', 0xF1, b'<'];
        let decoded = decode_body(&bytes);
        assert_eq!(decoded, "<F01>ñ<");
    }
}
