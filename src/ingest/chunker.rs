/// Split a CSV payload into independently parseable slices of roughly
/// `chunk_bytes` each, cutting only on line boundaries and replicating the
/// header line at the start of every slice. A header-only file yields no
/// slices.
pub fn split_csv(content: &[u8], chunk_bytes: usize) -> Vec<Vec<u8>> {
    let header_end = match content.iter().position(|&b| b == b'\n') {
        Some(pos) => pos + 1,
        None => return Vec::new(),
    };
    let header = &content[..header_end];
    let budget = chunk_bytes.max(header.len() + 1);

    let mut chunks = Vec::new();
    let mut current: Vec<u8> = header.to_vec();
    let mut rest = &content[header_end..];

    while !rest.is_empty() {
        let line_end = rest
            .iter()
            .position(|&b| b == b'\n')
            .map(|p| p + 1)
            .unwrap_or(rest.len());
        let (line, tail) = rest.split_at(line_end);
        rest = tail;

        if line.iter().all(|b| b.is_ascii_whitespace()) {
            continue;
        }

        if current.len() > header.len() && current.len() + line.len() > budget {
            chunks.push(std::mem::replace(&mut current, header.to_vec()));
        }
        current.extend_from_slice(line);
    }

    if current.len() > header.len() {
        chunks.push(current);
    }
    chunks
}
