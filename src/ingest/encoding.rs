/// Decode an uploaded file: UTF-8 first, then Latin-1 (covers the
/// ISO-8859-1 exports some affiliate platforms still produce). Latin-1 maps
/// every byte to the same code point, so the fallback cannot fail.
pub fn decode_bytes(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}
