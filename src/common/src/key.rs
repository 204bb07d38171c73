//! Series-key parsing.
//!
//! A series key is `measurement[,tagKey=tagValue]*` with tags sorted by key.
//! Within a key, `,`, ` ` and `=` occurring inside a component are escaped
//! with a backslash; parsing splits on unescaped separators and unescapes
//! each component.

/// A single tag key/value pair in its raw (unescaped) form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

pub type Tags = Vec<Tag>;

/// parse_key splits a series key into its measurement and tags, both
/// unescaped.
pub fn parse_key(key: &[u8]) -> anyhow::Result<(Vec<u8>, Tags)> {
    let mut sections = split_unescaped(key, b',');
    if sections.is_empty() {
        return Err(anyhow!("unable to parse series key: {:?}", key));
    }

    let name = unescape(sections.remove(0));
    let mut tags = Tags::with_capacity(sections.len());
    for section in sections {
        let (k, v) = cut_unescaped(section, b'=')
            .ok_or_else(|| anyhow!("invalid tag format in series key: {:?}", key))?;
        tags.push(Tag {
            key: unescape(k),
            value: unescape(v),
        });
    }

    Ok((name, tags))
}

/// split_unescaped splits `buf` at every `sep` not preceded by a backslash.
fn split_unescaped(buf: &[u8], sep: u8) -> Vec<&[u8]> {
    let mut out = Vec::new();
    let mut start = 0;
    for i in 0..buf.len() {
        if buf[i] == sep && (i == 0 || buf[i - 1] != b'\\') {
            out.push(&buf[start..i]);
            start = i + 1;
        }
    }
    out.push(&buf[start..]);
    out
}

/// cut_unescaped splits at the first unescaped `sep`, or returns None.
fn cut_unescaped(buf: &[u8], sep: u8) -> Option<(&[u8], &[u8])> {
    for i in 0..buf.len() {
        if buf[i] == sep && (i == 0 || buf[i - 1] != b'\\') {
            return Some((&buf[..i], &buf[i + 1..]));
        }
    }
    None
}

/// unescape removes the backslash before any escaped `,`, ` ` or `=`.
fn unescape(buf: &[u8]) -> Vec<u8> {
    if !buf.contains(&b'\\') {
        return buf.to_vec();
    }

    let mut out = Vec::with_capacity(buf.len());
    let mut i = 0;
    while i < buf.len() {
        if buf[i] == b'\\' && i + 1 < buf.len() {
            match buf[i + 1] {
                b',' | b' ' | b'=' => {
                    out.push(buf[i + 1]);
                    i += 2;
                    continue;
                }
                _ => {}
            }
        }
        out.push(buf[i]);
        i += 1;
    }
    out
}
