//! HPACK header compression (RFC 7541).
//!
//! The decoder keeps a bounded dynamic table whose limit is our advertised
//! `SETTINGS_HEADER_TABLE_SIZE`; the encoder follows the peer's value and
//! announces size changes at the start of the next header block.

use std::collections::VecDeque;

use thiserror::Error;

use super::huffman;

/// Per-entry overhead used for table and header-list accounting.
const ENTRY_OVERHEAD: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HpackError {
    #[error("header block truncated")]
    Truncated,
    #[error("integer overflow in header block")]
    IntegerOverflow,
    #[error("invalid table index {0}")]
    InvalidIndex(usize),
    #[error("invalid huffman string")]
    Huffman,
    #[error("table size update {0} exceeds advertised limit")]
    TableSizeExceeded(usize),
}

/// A decoded or to-be-encoded header field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

impl HeaderField {
    pub fn new(name: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn size(&self) -> usize {
        self.name.len() + self.value.len() + ENTRY_OVERHEAD
    }
}

static STATIC_TABLE: [(&str, &str); 61] = [
    (":authority", ""),
    (":method", "GET"),
    (":method", "POST"),
    (":path", "/"),
    (":path", "/index.html"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "200"),
    (":status", "204"),
    (":status", "206"),
    (":status", "304"),
    (":status", "400"),
    (":status", "404"),
    (":status", "500"),
    ("accept-charset", ""),
    ("accept-encoding", "gzip, deflate"),
    ("accept-language", ""),
    ("accept-ranges", ""),
    ("accept", ""),
    ("access-control-allow-origin", ""),
    ("age", ""),
    ("allow", ""),
    ("authorization", ""),
    ("cache-control", ""),
    ("content-disposition", ""),
    ("content-encoding", ""),
    ("content-language", ""),
    ("content-length", ""),
    ("content-location", ""),
    ("content-range", ""),
    ("content-type", ""),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("expect", ""),
    ("expires", ""),
    ("from", ""),
    ("host", ""),
    ("if-match", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("if-range", ""),
    ("if-unmodified-since", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("max-forwards", ""),
    ("proxy-authenticate", ""),
    ("proxy-authorization", ""),
    ("range", ""),
    ("referer", ""),
    ("refresh", ""),
    ("retry-after", ""),
    ("server", ""),
    ("set-cookie", ""),
    ("strict-transport-security", ""),
    ("transfer-encoding", ""),
    ("user-agent", ""),
    ("vary", ""),
    ("via", ""),
    ("www-authenticate", ""),
];

pub(crate) fn encode_int(out: &mut Vec<u8>, value: usize, prefix_bits: u8, pattern: u8) {
    let max = (1usize << prefix_bits) - 1;
    if value < max {
        out.push(pattern | value as u8);
        return;
    }
    out.push(pattern | max as u8);
    let mut rest = value - max;
    while rest >= 0x80 {
        out.push(0x80 | (rest & 0x7f) as u8);
        rest >>= 7;
    }
    out.push(rest as u8);
}

pub(crate) fn decode_int(buf: &[u8], prefix_bits: u8) -> Result<(usize, usize), HpackError> {
    let first = *buf.first().ok_or(HpackError::Truncated)?;
    let max = (1usize << prefix_bits) - 1;
    let mut value = usize::from(first) & max;
    if value < max {
        return Ok((value, 1));
    }
    let mut shift = 0u32;
    for (i, &b) in buf[1..].iter().enumerate() {
        if shift > 28 {
            return Err(HpackError::IntegerOverflow);
        }
        value += usize::from(b & 0x7f) << shift;
        shift += 7;
        if b & 0x80 == 0 {
            return Ok((value, i + 2));
        }
    }
    Err(HpackError::Truncated)
}

fn encode_string(out: &mut Vec<u8>, data: &[u8]) {
    let packed = huffman::encoded_len(data);
    if packed < data.len() {
        encode_int(out, packed, 7, 0x80);
        huffman::encode(data, out);
    } else {
        encode_int(out, data.len(), 7, 0x00);
        out.extend_from_slice(data);
    }
}

fn decode_string(buf: &[u8]) -> Result<(Vec<u8>, usize), HpackError> {
    let first = *buf.first().ok_or(HpackError::Truncated)?;
    let (len, n) = decode_int(buf, 7)?;
    let end = n.checked_add(len).ok_or(HpackError::IntegerOverflow)?;
    let raw = buf.get(n..end).ok_or(HpackError::Truncated)?;
    let value = if first & 0x80 != 0 {
        huffman::decode(raw).ok_or(HpackError::Huffman)?
    } else {
        raw.to_vec()
    };
    Ok((value, end))
}

/// Dynamic table, newest entry first.
#[derive(Debug)]
pub struct DynamicTable {
    entries: VecDeque<HeaderField>,
    size: usize,
    max_size: usize,
}

impl DynamicTable {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            size: 0,
            max_size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_to(&mut self, limit: usize) {
        while self.size > limit {
            match self.entries.pop_back() {
                Some(old) => self.size -= old.size(),
                None => break,
            }
        }
    }

    fn insert(&mut self, field: HeaderField) {
        let needed = field.size();
        if needed > self.max_size {
            self.entries.clear();
            self.size = 0;
            return;
        }
        self.evict_to(self.max_size - needed);
        self.size += needed;
        self.entries.push_front(field);
    }

    fn resize(&mut self, max_size: usize) {
        self.max_size = max_size;
        self.evict_to(max_size);
    }

    fn get(&self, index: usize) -> Option<&HeaderField> {
        self.entries.get(index)
    }

    fn position(&self, name: &[u8], value: Option<&[u8]>) -> Option<usize> {
        self.entries
            .iter()
            .position(|f| f.name == name && value.map_or(true, |v| f.value == v))
            .map(|i| i + STATIC_TABLE.len() + 1)
    }
}

fn static_position(name: &[u8], value: Option<&[u8]>) -> Option<usize> {
    STATIC_TABLE
        .iter()
        .position(|(n, v)| n.as_bytes() == name && value.map_or(true, |val| v.as_bytes() == val))
        .map(|i| i + 1)
}

/// Header block encoder.
#[derive(Debug)]
pub struct Encoder {
    table: DynamicTable,
    /// Smallest and latest size set since the last block (RFC 7541 Section 4.2).
    pending_resize: Option<(usize, usize)>,
}

impl Encoder {
    pub fn new(max_table_size: usize) -> Self {
        Self {
            table: DynamicTable::new(max_table_size),
            pending_resize: None,
        }
    }

    /// Applies the peer's new table size; the update is signalled in the
    /// next encoded block.
    pub fn set_max_table_size(&mut self, size: usize) {
        self.table.resize(size);
        self.pending_resize = Some(match self.pending_resize {
            Some((smallest, _)) => (smallest.min(size), size),
            None => (size, size),
        });
    }

    pub fn encode<'a, I>(&mut self, fields: I, out: &mut Vec<u8>)
    where
        I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
    {
        if let Some((smallest, last)) = self.pending_resize.take() {
            if smallest < last {
                encode_int(out, smallest, 5, 0x20);
            }
            encode_int(out, last, 5, 0x20);
        }
        for (name, value) in fields {
            self.encode_field(name, value, out);
        }
    }

    fn encode_field(&mut self, name: &[u8], value: &[u8], out: &mut Vec<u8>) {
        let exact = static_position(name, Some(value)).or_else(|| self.table.position(name, Some(value)));
        if let Some(index) = exact {
            encode_int(out, index, 7, 0x80);
            return;
        }
        match static_position(name, None).or_else(|| self.table.position(name, None)) {
            Some(index) => encode_int(out, index, 6, 0x40),
            None => {
                out.push(0x40);
                encode_string(out, name);
            }
        }
        encode_string(out, value);
        self.table.insert(HeaderField::new(name, value));
    }
}

/// Header block decoder.
#[derive(Debug)]
pub struct Decoder {
    table: DynamicTable,
    limit: usize,
}

impl Decoder {
    pub fn new(max_table_size: usize) -> Self {
        Self {
            table: DynamicTable::new(max_table_size),
            limit: max_table_size,
        }
    }

    pub fn table(&self) -> &DynamicTable {
        &self.table
    }

    fn lookup(&self, index: usize) -> Result<(&[u8], &[u8]), HpackError> {
        if index == 0 {
            return Err(HpackError::InvalidIndex(index));
        }
        if let Some((name, value)) = STATIC_TABLE.get(index - 1) {
            return Ok((name.as_bytes(), value.as_bytes()));
        }
        self.table
            .get(index - STATIC_TABLE.len() - 1)
            .map(|f| (f.name.as_slice(), f.value.as_slice()))
            .ok_or(HpackError::InvalidIndex(index))
    }

    fn literal(&self, buf: &[u8], prefix_bits: u8) -> Result<(HeaderField, usize), HpackError> {
        let (index, mut pos) = decode_int(buf, prefix_bits)?;
        let name = if index == 0 {
            let (name, n) = decode_string(&buf[pos..])?;
            pos += n;
            name
        } else {
            self.lookup(index)?.0.to_vec()
        };
        let (value, n) = decode_string(&buf[pos..])?;
        Ok((HeaderField { name, value }, pos + n))
    }

    /// Decodes a complete header block.
    pub fn decode(&mut self, block: &[u8]) -> Result<Vec<HeaderField>, HpackError> {
        Ok(self.decode_bounded(block, usize::MAX)?.unwrap_or_default())
    }

    /// Decodes a complete header block, giving up on the field list once
    /// its size (RFC 7540 Section 6.5.2 accounting) passes `max_list_size`.
    /// Returns `None` in that case. The rest of the block is still processed
    /// so the dynamic table stays in sync with the peer's encoder.
    pub fn decode_bounded(&mut self, block: &[u8], max_list_size: usize) -> Result<Option<Vec<HeaderField>>, HpackError> {
        let mut fields = Vec::new();
        let mut list_size = 0usize;
        let mut pos = 0;
        while pos < block.len() {
            let rest = &block[pos..];
            let first = rest[0];
            if first & 0x80 != 0 {
                let (index, n) = decode_int(rest, 7)?;
                let (name, value) = self.lookup(index)?;
                list_size = list_size.saturating_add(name.len() + value.len() + ENTRY_OVERHEAD);
                if list_size <= max_list_size {
                    fields.push(HeaderField::new(name, value));
                }
                pos += n;
            } else if first & 0x40 != 0 {
                let (field, n) = self.literal(rest, 6)?;
                list_size = list_size.saturating_add(field.size());
                if list_size <= max_list_size {
                    fields.push(field.clone());
                }
                self.table.insert(field);
                pos += n;
            } else if first & 0x20 != 0 {
                let (size, n) = decode_int(rest, 5)?;
                if size > self.limit {
                    return Err(HpackError::TableSizeExceeded(size));
                }
                self.table.resize(size);
                pos += n;
            } else {
                // 0000xxxx without indexing, 0001xxxx never indexed
                let (field, n) = self.literal(rest, 4)?;
                list_size = list_size.saturating_add(field.size());
                if list_size <= max_list_size {
                    fields.push(field);
                }
                pos += n;
            }
        }
        if list_size > max_list_size {
            return Ok(None);
        }
        Ok(Some(fields))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(fields: &[HeaderField]) -> Vec<(String, String)> {
        fields
            .iter()
            .map(|f| {
                (
                    String::from_utf8_lossy(&f.name).into_owned(),
                    String::from_utf8_lossy(&f.value).into_owned(),
                )
            })
            .collect()
    }

    #[test]
    fn prefix_int_rfc_examples() {
        // RFC 7541 C.1.2: 1337 with a 5-bit prefix
        let mut out = Vec::new();
        encode_int(&mut out, 1337, 5, 0);
        assert_eq!(out, [0x1f, 0x9a, 0x0a]);
        assert_eq!(decode_int(&out, 5).unwrap(), (1337, 3));
        assert_eq!(decode_int(&[0x1f, 0x9a], 5), Err(HpackError::Truncated));
    }

    #[test]
    fn decodes_rfc_request_sequence_with_huffman() {
        // RFC 7541 C.4.1 and C.4.2
        let mut decoder = Decoder::new(4096);
        let first = [
            0x82, 0x86, 0x84, 0x41, 0x8c, 0xf1, 0xe3, 0xc2, 0xe5, 0xf2, 0x3a, 0x6b, 0xa0, 0xab,
            0x90, 0xf4, 0xff,
        ];
        let fields = decoder.decode(&first).unwrap();
        assert_eq!(
            pairs(&fields),
            vec![
                (":method".into(), "GET".into()),
                (":scheme".into(), "http".into()),
                (":path".into(), "/".into()),
                (":authority".into(), "www.example.com".into()),
            ]
        );
        assert_eq!(decoder.table().size(), 57);

        let second = [0x82, 0x86, 0x84, 0xbe, 0x58, 0x86, 0xa8, 0xeb, 0x10, 0x64, 0x9c, 0xbf];
        let fields = decoder.decode(&second).unwrap();
        assert_eq!(fields[3].value, b"www.example.com");
        assert_eq!(fields[4], HeaderField::new("cache-control", "no-cache"));
        assert_eq!(decoder.table().len(), 2);
        assert_eq!(decoder.table().size(), 110);
    }

    #[test]
    fn encoder_output_is_understood_by_decoder() {
        let mut encoder = Encoder::new(4096);
        let mut decoder = Decoder::new(4096);
        let headers: Vec<(&[u8], &[u8])> = vec![
            (b":status", b"200"),
            (b"content-type", b"text/plain"),
            (b"x-request-id", b"abc"),
        ];
        for _ in 0..2 {
            let mut block = Vec::new();
            encoder.encode(headers.iter().copied(), &mut block);
            let fields = decoder.decode(&block).unwrap();
            assert_eq!(fields.len(), 3);
            assert_eq!(fields[2], HeaderField::new("x-request-id", "abc"));
        }
    }

    #[test]
    fn table_size_update_is_emitted_and_bounded() {
        let mut encoder = Encoder::new(4096);
        encoder.set_max_table_size(0);
        let mut block = Vec::new();
        encoder.encode([(&b"x-a"[..], &b"1"[..])], &mut block);
        assert_eq!(block[0], 0x20);

        let mut decoder = Decoder::new(4096);
        decoder.decode(&block).unwrap();
        assert!(decoder.table().is_empty());

        let mut strict = Decoder::new(100);
        let mut update = Vec::new();
        encode_int(&mut update, 200, 5, 0x20);
        assert_eq!(strict.decode(&update), Err(HpackError::TableSizeExceeded(200)));
    }

    #[test]
    fn shrink_then_grow_signals_both_sizes() {
        let mut encoder = Encoder::new(4096);
        encoder.set_max_table_size(0);
        encoder.set_max_table_size(2048);
        let mut block = Vec::new();
        encoder.encode([(&b"x-a"[..], &b"1"[..])], &mut block);

        let mut expected = Vec::new();
        encode_int(&mut expected, 0, 5, 0x20);
        encode_int(&mut expected, 2048, 5, 0x20);
        assert_eq!(&block[..expected.len()], &expected[..]);

        // Signalled once only.
        let mut next = Vec::new();
        encoder.encode([(&b"x-a"[..], &b"1"[..])], &mut next);
        assert_ne!(next[0] & 0xe0, 0x20);
    }

    #[test]
    fn header_list_budget_stops_expansion_but_keeps_table() {
        // One large literal added to the table, then referenced many times.
        let mut block = vec![0x40];
        encode_string(&mut block, b"x-big");
        encode_string(&mut block, &vec![b'a'; 4000]);
        block.extend(std::iter::repeat(0xbe).take(30_000));

        let mut decoder = Decoder::new(8192);
        assert_eq!(decoder.decode_bounded(&block, 16_384).unwrap(), None);
        assert_eq!(decoder.table().len(), 1);

        // The table is still usable by the next block.
        let fields = decoder.decode_bounded(&[0xbe], 16_384).unwrap().unwrap();
        assert_eq!(fields[0].name, b"x-big");
        assert_eq!(fields[0].value.len(), 4000);
    }

    #[test]
    fn header_list_budget_counts_entry_overhead() {
        let mut block = Vec::new();
        encode_int(&mut block, 2, 7, 0x80); // :method GET, 7 + 3 + 32 = 42
        let mut decoder = Decoder::new(4096);
        assert_eq!(decoder.decode_bounded(&block, 42).unwrap().map(|f| f.len()), Some(1));
        assert_eq!(decoder.decode_bounded(&block, 41).unwrap(), None);
    }

    #[test]
    fn eviction_keeps_size_within_limit() {
        let mut table = DynamicTable::new(64);
        table.insert(HeaderField::new("aaaa", "bbbb"));
        table.insert(HeaderField::new("cccc", "dddd"));
        assert_eq!(table.len(), 1);
        assert_eq!(table.size(), 40);
        table.insert(HeaderField::new(vec![b'x'; 64], ""));
        assert!(table.is_empty());
    }

    #[test]
    fn rejects_out_of_range_index() {
        let mut decoder = Decoder::new(4096);
        assert_eq!(decoder.decode(&[0xbe]), Err(HpackError::InvalidIndex(62)));
        assert_eq!(decoder.decode(&[0x80]), Err(HpackError::InvalidIndex(0)));
    }
}
