use md5::{Digest, Md5};

/// Content-addressed identity of a canonical row: md5 over the owner id and
/// the normalized dimension fields, joined with `|` after escaping, so the
/// same logical row always lands on the same 32-char hex key and a re-upload
/// is a no-op under the unique index.
///
/// The owner id is the first component; without it, identical uploads from
/// two tenants would collide on the global unique index and the second
/// tenant's rows would silently vanish.
pub fn fingerprint(owner_id: i64, fields: &[Option<&str>]) -> String {
    let mut joined = owner_id.to_string();
    for field in fields {
        joined.push('|');
        match field {
            Some(v) => escape_into(v, &mut joined),
            None => {}
        }
    }

    let mut hasher = Md5::new();
    hasher.update(joined.as_bytes());
    hex::encode(hasher.finalize())
}

/// Backslash-escape the join delimiter so field content can never fabricate
/// another row's concatenation.
fn escape_into(value: &str, out: &mut String) {
    for ch in value.chars() {
        if ch == '\\' || ch == '|' {
            out.push('\\');
        }
        out.push(ch);
    }
}
