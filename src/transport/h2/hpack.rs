//! HPACK (RFC 7541) with controllable pseudo-header ordering.
//!
//! The encoder emits pseudo-headers in the preset's order (part of the
//! Akamai fingerprint) and uses incremental indexing like browsers do.
//! Literal strings are emitted unhuffmaned — the compression bits are
//! not part of any deployed fingerprint. The decoder handles the full
//! grammar including Huffman-coded strings, whose canonical code table
//! is generated from the per-symbol bit lengths.

use std::collections::VecDeque;

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};
use crate::fingerprint::http2::PseudoOrder;

/// RFC 7541 Appendix A static table.
const STATIC_TABLE: &[(&str, &str)] = &[
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

/// Per-entry overhead for dynamic table accounting (RFC 7541 §4.1).
const ENTRY_OVERHEAD: usize = 32;

fn entry_size(name: &str, value: &str) -> usize {
    name.len() + value.len() + ENTRY_OVERHEAD
}

/// Shared dynamic table for encoder/decoder.
#[derive(Debug, Default)]
struct DynamicTable {
    entries: VecDeque<(String, String)>,
    size: usize,
    max_size: usize,
}

impl DynamicTable {
    fn new(max_size: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            size: 0,
            max_size,
        }
    }

    fn insert(&mut self, name: String, value: String) {
        let size = entry_size(&name, &value);
        // An entry larger than the table empties it (RFC 7541 §4.4).
        while self.size + size > self.max_size {
            match self.entries.pop_back() {
                Some((n, v)) => self.size -= entry_size(&n, &v),
                None => break,
            }
        }
        if size <= self.max_size {
            self.size += size;
            self.entries.push_front((name, value));
        }
    }

    fn set_max_size(&mut self, max: usize) {
        self.max_size = max;
        while self.size > self.max_size {
            if let Some((n, v)) = self.entries.pop_back() {
                self.size -= entry_size(&n, &v);
            }
        }
    }

    /// 1-based index into the combined address space, after the static
    /// table.
    fn get(&self, index: usize) -> Option<&(String, String)> {
        self.entries.get(index)
    }

    fn find(&self, name: &str, value: &str) -> Option<(usize, bool)> {
        let mut name_match = None;
        for (i, (n, v)) in self.entries.iter().enumerate() {
            if n == name {
                if v == value {
                    return Some((i, true));
                }
                name_match.get_or_insert(i);
            }
        }
        name_match.map(|i| (i, false))
    }
}

// ---------------------------------------------------------------------------
// Integer and string primitives
// ---------------------------------------------------------------------------

/// Encode an integer with an n-bit prefix (RFC 7541 §5.1). `first`
/// carries the pattern bits above the prefix.
fn encode_int(out: &mut BytesMut, value: usize, prefix_bits: u8, first: u8) {
    let max_prefix = (1usize << prefix_bits) - 1;
    if value < max_prefix {
        out.put_u8(first | value as u8);
        return;
    }
    out.put_u8(first | max_prefix as u8);
    let mut rest = value - max_prefix;
    while rest >= 128 {
        out.put_u8((rest % 128) as u8 | 0x80);
        rest /= 128;
    }
    out.put_u8(rest as u8);
}

fn decode_int(buf: &[u8], pos: &mut usize, prefix_bits: u8) -> Result<usize> {
    let max_prefix = (1usize << prefix_bits) - 1;
    let first = *buf
        .get(*pos)
        .ok_or_else(|| Error::protocol("HPACK integer truncated"))? as usize
        & max_prefix;
    *pos += 1;
    if first < max_prefix {
        return Ok(first);
    }
    let mut value = max_prefix;
    let mut shift = 0u32;
    loop {
        let byte = *buf
            .get(*pos)
            .ok_or_else(|| Error::protocol("HPACK integer truncated"))?;
        *pos += 1;
        value = value
            .checked_add(((byte & 0x7f) as usize) << shift)
            .ok_or_else(|| Error::protocol("HPACK integer overflow"))?;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 28 {
            return Err(Error::protocol("HPACK integer too long"));
        }
    }
}

fn encode_string(out: &mut BytesMut, s: &str) {
    encode_int(out, s.len(), 7, 0x00); // H bit clear: raw literal
    out.put_slice(s.as_bytes());
}

fn decode_string(buf: &[u8], pos: &mut usize) -> Result<String> {
    let huffman = buf
        .get(*pos)
        .map(|b| b & 0x80 != 0)
        .ok_or_else(|| Error::protocol("HPACK string truncated"))?;
    let len = decode_int(buf, pos, 7)?;
    let end = pos
        .checked_add(len)
        .filter(|e| *e <= buf.len())
        .ok_or_else(|| Error::protocol("HPACK string exceeds block"))?;
    let raw = &buf[*pos..end];
    *pos = end;
    if huffman {
        huffman_decode(raw)
    } else {
        String::from_utf8(raw.to_vec())
            .map_err(|_| Error::protocol("HPACK literal is not UTF-8"))
    }
}

// ---------------------------------------------------------------------------
// Huffman decoding
//
// Codes are canonical: generated from the per-symbol bit lengths by
// assigning consecutive values within each length, ordered by symbol.
// ---------------------------------------------------------------------------

/// Bit length of each symbol's Huffman code (symbols 0..=255, then EOS).
#[rustfmt::skip]
const HUFFMAN_LENGTHS: [u8; 257] = [
    // 0..=31 control characters
    13, 23, 28, 28, 28, 28, 28, 28, 28, 24, 30, 28, 28, 30, 28, 28,
    28, 28, 28, 28, 28, 28, 30, 28, 28, 28, 28, 28, 28, 28, 28, 28,
    //  ' '  !   "   #   $   %   &   '   (   )   *   +   ,   -   .   /
         6, 10, 10, 12, 13,  6,  8, 11, 10, 10,  8, 11,  8,  6,  6,  6,
    //   0   1   2   3   4   5   6   7   8   9   :   ;   <   =   >   ?
         5,  5,  5,  6,  6,  6,  6,  6,  6,  6,  7,  8, 15,  6, 12, 10,
    //   @   A   B   C   D   E   F   G   H   I   J   K   L   M   N   O
        13,  6,  7,  7,  7,  7,  7,  7,  7,  7,  7,  7,  7,  7,  7,  7,
    //   P   Q   R   S   T   U   V   W   X   Y   Z   [   \   ]   ^   _
         7,  7,  7,  7,  7,  7,  7,  7,  8,  7,  8, 13, 19, 13, 14,  6,
    //   `   a   b   c   d   e   f   g   h   i   j   k   l   m   n   o
        15,  5,  6,  5,  6,  5,  6,  6,  6,  5,  7,  7,  6,  6,  6,  5,
    //   p   q   r   s   t   u   v   w   x   y   z   {   |   }   ~  DEL
         6,  7,  6,  5,  5,  6,  7,  7,  7,  7,  7, 15, 11, 14, 13, 28,
    // 128..=255
    20, 22, 20, 20, 22, 22, 22, 23, 22, 23, 23, 23, 23, 23, 24, 23,
    24, 24, 22, 23, 24, 23, 23, 23, 23, 21, 22, 23, 22, 23, 23, 24,
    22, 21, 20, 22, 22, 23, 23, 21, 23, 22, 22, 24, 21, 22, 23, 23,
    21, 21, 22, 21, 23, 22, 23, 23, 20, 22, 22, 22, 23, 22, 22, 23,
    26, 26, 20, 19, 22, 23, 22, 25, 26, 26, 26, 27, 27, 26, 24, 25,
    19, 21, 26, 27, 27, 26, 27, 24, 21, 21, 26, 26, 28, 27, 27, 27,
    20, 24, 20, 21, 22, 21, 21, 23, 22, 22, 25, 25, 24, 24, 26, 23,
    26, 27, 26, 26, 27, 27, 27, 27, 27, 28, 27, 27, 27, 27, 27, 26,
    // EOS
    30,
];

/// (code, bits) per symbol, canonical order.
fn huffman_codes() -> &'static [(u32, u8); 257] {
    use std::sync::OnceLock;
    static CODES: OnceLock<[(u32, u8); 257]> = OnceLock::new();
    CODES.get_or_init(|| {
        let mut order: Vec<usize> = (0..257).collect();
        order.sort_by_key(|&sym| (HUFFMAN_LENGTHS[sym], sym));

        let mut codes = [(0u32, 0u8); 257];
        let mut code: u32 = 0;
        let mut prev_len: u8 = 0;
        for sym in order {
            let len = HUFFMAN_LENGTHS[sym];
            code <<= len - prev_len;
            codes[sym] = (code, len);
            code += 1;
            prev_len = len;
        }
        codes
    })
}

/// Decode a Huffman-coded string by walking bits against the canonical
/// code set. Trailing bits must be the EOS prefix (all ones).
fn huffman_decode(data: &[u8]) -> Result<String> {
    let codes = huffman_codes();
    let mut out = Vec::with_capacity(data.len() * 2);
    let mut acc: u32 = 0;
    let mut acc_len: u8 = 0;

    let lookup = |acc: u32, acc_len: u8| -> Option<usize> {
        codes
            .iter()
            .position(|&(code, len)| len == acc_len && code == acc)
    };

    for byte in data {
        for bit in (0..8).rev() {
            acc = (acc << 1) | u32::from((byte >> bit) & 1);
            acc_len += 1;
            if acc_len > 30 {
                return Err(Error::protocol("Huffman code longer than 30 bits"));
            }
            if let Some(sym) = lookup(acc, acc_len) {
                if sym == 256 {
                    return Err(Error::protocol("EOS symbol in Huffman string"));
                }
                out.push(sym as u8);
                acc = 0;
                acc_len = 0;
            }
        }
    }
    // Up to 7 bits of padding, all ones (a prefix of EOS).
    if acc_len >= 8 || (acc_len > 0 && acc != (1 << acc_len) - 1) {
        return Err(Error::protocol("invalid Huffman padding"));
    }
    String::from_utf8(out).map_err(|_| Error::protocol("Huffman output is not UTF-8"))
}

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

/// HPACK encoder with browser pseudo-header ordering.
pub struct Encoder {
    table: DynamicTable,
    pseudo_order: PseudoOrder,
    /// Pending table-size update to emit at the next block start.
    pending_resize: Option<usize>,
}

impl Encoder {
    pub fn new(pseudo_order: PseudoOrder, max_table_size: usize) -> Self {
        Self {
            table: DynamicTable::new(max_table_size),
            pseudo_order,
            pending_resize: None,
        }
    }

    /// Change the dynamic table size; signalled in the next header
    /// block per RFC 7541 §6.3.
    pub fn set_max_table_size(&mut self, size: usize) {
        self.table.set_max_size(size);
        self.pending_resize = Some(size);
    }

    /// Encode a request header block. Pseudo-headers first, in the
    /// configured order, then the regular headers exactly as given.
    pub fn encode_request(
        &mut self,
        method: &str,
        authority: &str,
        scheme: &str,
        path: &str,
        headers: &[(String, String)],
    ) -> BytesMut {
        let mut out = BytesMut::with_capacity(256);

        if let Some(size) = self.pending_resize.take() {
            encode_int(&mut out, size, 5, 0x20);
        }

        let pseudo = [
            (":method", method),
            (":authority", authority),
            (":scheme", scheme),
            (":path", path),
        ];
        for &i in &self.pseudo_order.order() {
            let (name, value) = pseudo[i];
            self.encode_field(&mut out, name, value);
        }
        for (name, value) in headers {
            let name = name.to_ascii_lowercase();
            self.encode_field(&mut out, &name, value);
        }
        out
    }

    fn encode_field(&mut self, out: &mut BytesMut, name: &str, value: &str) {
        // Exact match in the static table: one-byte indexed field.
        let mut static_name_match = None;
        for (i, (n, v)) in STATIC_TABLE.iter().enumerate() {
            if *n == name {
                if *v == value {
                    encode_int(out, i + 1, 7, 0x80);
                    return;
                }
                static_name_match.get_or_insert(i + 1);
            }
        }
        if let Some((i, exact)) = self.table.find(name, value) {
            let index = STATIC_TABLE.len() + 1 + i;
            if exact {
                encode_int(out, index, 7, 0x80);
                return;
            }
            static_name_match.get_or_insert(index);
        }

        // Literal with incremental indexing (browser behavior), with an
        // indexed name when one exists.
        match static_name_match {
            Some(index) => encode_int(out, index, 6, 0x40),
            None => {
                encode_int(out, 0, 6, 0x40);
                encode_string(out, name);
            }
        }
        encode_string(out, value);
        self.table.insert(name.to_string(), value.to_string());
    }
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

/// HPACK decoder.
pub struct Decoder {
    table: DynamicTable,
    max_allowed_size: usize,
}

impl Decoder {
    pub fn new(max_table_size: usize) -> Self {
        Self {
            table: DynamicTable::new(max_table_size),
            max_allowed_size: max_table_size,
        }
    }

    fn lookup(&self, index: usize) -> Result<(String, String)> {
        if index == 0 {
            return Err(Error::protocol("HPACK index 0"));
        }
        if index <= STATIC_TABLE.len() {
            let (n, v) = STATIC_TABLE[index - 1];
            return Ok((n.to_string(), v.to_string()));
        }
        self.table
            .get(index - STATIC_TABLE.len() - 1)
            .cloned()
            .ok_or_else(|| Error::protocol(format!("HPACK index {index} out of range")))
    }

    /// Decode a complete header block.
    pub fn decode(&mut self, block: &[u8]) -> Result<Vec<(String, String)>> {
        let mut out = Vec::new();
        let mut pos = 0;
        while pos < block.len() {
            let byte = block[pos];
            if byte & 0x80 != 0 {
                // Indexed field.
                let index = decode_int(block, &mut pos, 7)?;
                out.push(self.lookup(index)?);
            } else if byte & 0xc0 == 0x40 {
                // Literal with incremental indexing.
                let index = decode_int(block, &mut pos, 6)?;
                let name = if index == 0 {
                    decode_string(block, &mut pos)?
                } else {
                    self.lookup(index)?.0
                };
                let value = decode_string(block, &mut pos)?;
                self.table.insert(name.clone(), value.clone());
                out.push((name, value));
            } else if byte & 0xe0 == 0x20 {
                // Dynamic table size update.
                let size = decode_int(block, &mut pos, 5)?;
                if size > self.max_allowed_size {
                    return Err(Error::protocol("HPACK table size above limit"));
                }
                self.table.set_max_size(size);
            } else {
                // Literal without indexing / never indexed (0x00 / 0x10).
                let index = decode_int(block, &mut pos, 4)?;
                let name = if index == 0 {
                    decode_string(block, &mut pos)?
                } else {
                    self.lookup(index)?.0
                };
                let value = decode_string(block, &mut pos)?;
                out.push((name, value));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(headers: &[(String, String)]) -> Vec<(String, String)> {
        let mut encoder = Encoder::new(PseudoOrder::Msap, 65536);
        let block = encoder.encode_request("GET", "example.test", "https", "/", headers);
        let mut decoder = Decoder::new(65536);
        decoder.decode(&block).unwrap()
    }

    #[test]
    fn pseudo_headers_follow_configured_order() {
        let mut encoder = Encoder::new(PseudoOrder::Mpas, 65536);
        let block = encoder.encode_request("GET", "example.test", "https", "/x", &[]);
        let mut decoder = Decoder::new(65536);
        let fields = decoder.decode(&block).unwrap();
        let names: Vec<&str> = fields.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec![":method", ":path", ":authority", ":scheme"]);
    }

    #[test]
    fn static_table_exact_matches_are_one_byte() {
        let mut encoder = Encoder::new(PseudoOrder::Msap, 65536);
        let block = encoder.encode_request("GET", "", "https", "/", &[]);
        // :method GET (index 2), :scheme https (7), :path / (4) all hit
        // the static table; only :authority needs a literal.
        assert!(block.len() < 16);
    }

    #[test]
    fn request_headers_round_trip() {
        let headers = vec![
            ("user-agent".to_string(), "Mozilla/5.0 test".to_string()),
            ("accept".to_string(), "*/*".to_string()),
            ("x-custom".to_string(), "value-1".to_string()),
        ];
        let decoded = round_trip(&headers);
        assert_eq!(&decoded[4..], &headers[..]);
    }

    #[test]
    fn names_are_lowercased_for_h2() {
        let headers = vec![("User-Agent".to_string(), "ua".to_string())];
        let decoded = round_trip(&headers);
        assert_eq!(decoded[4].0, "user-agent");
    }

    #[test]
    fn repeated_fields_use_dynamic_table() {
        let headers = vec![("x-session".to_string(), "abc123".to_string())];
        let mut encoder = Encoder::new(PseudoOrder::Msap, 65536);
        let first = encoder.encode_request("GET", "a.test", "https", "/", &headers);
        let second = encoder.encode_request("GET", "a.test", "https", "/", &headers);
        // Second block hits the dynamic table and shrinks.
        assert!(second.len() < first.len());

        let mut decoder = Decoder::new(65536);
        decoder.decode(&first).unwrap();
        let fields = decoder.decode(&second).unwrap();
        assert!(fields.contains(&("x-session".to_string(), "abc123".to_string())));
    }

    #[test]
    fn integer_coding_round_trip() {
        for value in [0usize, 1, 30, 31, 127, 128, 255, 16384, 1 << 20] {
            let mut buf = BytesMut::new();
            encode_int(&mut buf, value, 5, 0x20);
            let mut pos = 0;
            assert_eq!(decode_int(&buf, &mut pos, 5).unwrap(), value);
            assert_eq!(pos, buf.len());
        }
    }

    #[test]
    fn integer_overflow_rejected() {
        // Prefix 31 + unending continuation bytes.
        let buf = [0x1f, 0xff, 0xff, 0xff, 0xff, 0xff, 0x01];
        let mut pos = 0;
        assert!(decode_int(&buf, &mut pos, 5).is_err());
    }

    #[test]
    fn huffman_ascii_decode() {
        // Encode "www" with the canonical codes and decode it back.
        let codes = huffman_codes();
        let (code, bits) = codes[b'w' as usize];
        let mut acc: u64 = 0;
        let mut total_bits = 0u32;
        for _ in 0..3 {
            acc = (acc << bits) | u64::from(code);
            total_bits += u32::from(bits);
        }
        // Pad with ones to a byte boundary.
        let pad = (8 - (total_bits % 8)) % 8;
        acc = (acc << pad) | ((1 << pad) - 1);
        total_bits += pad;
        let bytes: Vec<u8> = (0..total_bits / 8)
            .rev()
            .map(|i| ((acc >> (i * 8)) & 0xff) as u8)
            .collect();

        assert_eq!(huffman_decode(&bytes).unwrap(), "www");
    }

    #[test]
    fn huffman_rejects_bad_padding() {
        // A full byte of zeros can never be valid padding.
        let codes = huffman_codes();
        let (code, bits) = codes[b'0' as usize];
        assert_eq!(bits, 5);
        // '0' (5 bits of 0) followed by 3 zero-bits padding: invalid.
        let byte = (code << 3) as u8;
        assert!(huffman_decode(&[byte]).is_err());
    }

    #[test]
    fn five_bit_codes_match_rfc7541() {
        let codes = huffman_codes();
        // Spot-check the canonical generation against known values.
        assert_eq!(codes[b'0' as usize], (0x0, 5));
        assert_eq!(codes[b'1' as usize], (0x1, 5));
        assert_eq!(codes[b'a' as usize], (0x3, 5));
        assert_eq!(codes[b'e' as usize], (0x5, 5));
        assert_eq!(codes[b't' as usize], (0x9, 5));
        assert_eq!(codes[b' ' as usize], (0x14, 6));
        assert_eq!(codes[b'%' as usize], (0x15, 6));
        assert_eq!(codes[b':' as usize], (0x5c, 7));
        assert_eq!(codes[b'&' as usize], (0xf8, 8));
        assert_eq!(codes[256], (0x3fffffff, 30));
    }

    #[test]
    fn table_size_update_emitted_after_resize() {
        let mut encoder = Encoder::new(PseudoOrder::Msap, 65536);
        encoder.set_max_table_size(4096);
        let block = encoder.encode_request("GET", "a.test", "https", "/", &[]);
        // First byte is a dynamic-table-size update (001xxxxx).
        assert_eq!(block[0] & 0xe0, 0x20);

        let mut decoder = Decoder::new(65536);
        decoder.decode(&block).unwrap();
    }

    #[test]
    fn decoder_rejects_index_zero_and_out_of_range() {
        let mut decoder = Decoder::new(4096);
        assert!(decoder.decode(&[0x80]).is_err());
        assert!(decoder.decode(&[0xff, 0x80, 0x7f]).is_err());
    }
}
