use std::collections::VecDeque;

use bytes::Bytes;

/// Per-entry overhead defined by RFC 7541 §4.1.
const ENTRY_OVERHEAD: usize = 32;

/// The static table of RFC 7541 Appendix A, indices 1 through 61.
pub(super) static STATIC_TABLE: &[(&[u8], &[u8])] = &[
    (b":authority", b""),
    (b":method", b"GET"),
    (b":method", b"POST"),
    (b":path", b"/"),
    (b":path", b"/index.html"),
    (b":scheme", b"http"),
    (b":scheme", b"https"),
    (b":status", b"200"),
    (b":status", b"204"),
    (b":status", b"206"),
    (b":status", b"304"),
    (b":status", b"400"),
    (b":status", b"404"),
    (b":status", b"500"),
    (b"accept-charset", b""),
    (b"accept-encoding", b"gzip, deflate"),
    (b"accept-language", b""),
    (b"accept-ranges", b""),
    (b"accept", b""),
    (b"access-control-allow-origin", b""),
    (b"age", b""),
    (b"allow", b""),
    (b"authorization", b""),
    (b"cache-control", b""),
    (b"content-disposition", b""),
    (b"content-encoding", b""),
    (b"content-language", b""),
    (b"content-length", b""),
    (b"content-location", b""),
    (b"content-range", b""),
    (b"content-type", b""),
    (b"cookie", b""),
    (b"date", b""),
    (b"etag", b""),
    (b"expect", b""),
    (b"expires", b""),
    (b"from", b""),
    (b"host", b""),
    (b"if-match", b""),
    (b"if-modified-since", b""),
    (b"if-none-match", b""),
    (b"if-range", b""),
    (b"if-unmodified-since", b""),
    (b"last-modified", b""),
    (b"link", b""),
    (b"location", b""),
    (b"max-forwards", b""),
    (b"proxy-authenticate", b""),
    (b"proxy-authorization", b""),
    (b"range", b""),
    (b"referer", b""),
    (b"refresh", b""),
    (b"retry-after", b""),
    (b"server", b""),
    (b"set-cookie", b""),
    (b"strict-transport-security", b""),
    (b"transfer-encoding", b""),
    (b"user-agent", b""),
    (b"vary", b""),
    (b"via", b""),
    (b"www-authenticate", b""),
];

/// The mutable dynamic table shared by one direction of a connection.
///
/// Newest entries sit at the front; wire indices start just past the static
/// table.
#[derive(Debug)]
pub(super) struct DynamicTable {
    entries: VecDeque<(Bytes, Bytes)>,
    size: usize,
    max_size: usize,
}

impl DynamicTable {
    pub(super) fn new(max_size: usize) -> DynamicTable {
        DynamicTable {
            entries: VecDeque::new(),
            size: 0,
            max_size,
        }
    }

    pub(super) fn max_size(&self) -> usize {
        self.max_size
    }

    pub(super) fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
        self.evict();
    }

    pub(super) fn insert(&mut self, name: Bytes, value: Bytes) {
        let entry_size = name.len() + value.len() + ENTRY_OVERHEAD;
        // An entry larger than the whole table empties it (RFC 7541 §4.4).
        if entry_size > self.max_size {
            self.entries.clear();
            self.size = 0;
            return;
        }
        self.size += entry_size;
        self.entries.push_front((name, value));
        self.evict();
    }

    fn evict(&mut self) {
        while self.size > self.max_size {
            let (name, value) = self.entries.pop_back().expect("size accounting");
            self.size -= name.len() + value.len() + ENTRY_OVERHEAD;
        }
    }

    /// Resolves a 1-based wire index to an entry, static table included.
    pub(super) fn get(&self, index: usize) -> Option<(Bytes, Bytes)> {
        if index == 0 {
            return None;
        }
        if index <= STATIC_TABLE.len() {
            let (name, value) = STATIC_TABLE[index - 1];
            return Some((Bytes::from_static(name), Bytes::from_static(value)));
        }
        self.entries
            .get(index - STATIC_TABLE.len() - 1)
            .map(|(n, v)| (n.clone(), v.clone()))
    }

    /// Finds an exact match and the wire index it lives at.
    pub(super) fn find(&self, name: &[u8], value: &[u8]) -> Match {
        let mut name_only = None;

        for (i, (n, v)) in STATIC_TABLE.iter().enumerate() {
            if *n == name {
                if *v == value {
                    return Match::Full(i + 1);
                }
                if name_only.is_none() {
                    name_only = Some(i + 1);
                }
            }
        }

        for (i, (n, v)) in self.entries.iter().enumerate() {
            if n == name {
                let index = STATIC_TABLE.len() + i + 1;
                if v == value {
                    return Match::Full(index);
                }
                if name_only.is_none() {
                    name_only = Some(index);
                }
            }
        }

        match name_only {
            Some(index) => Match::Name(index),
            None => Match::None,
        }
    }

    #[cfg(test)]
    pub(super) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(super) enum Match {
    Full(usize),
    Name(usize),
    None,
}
