// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::fmt;

use anyhow::{Result, bail, ensure};

/// A BER-TLV tag, either one byte or two bytes long.
///
/// A first byte whose bits 5..1 are all set (`x11111b`) announces a
/// two-byte tag; every other first byte is a complete one-byte tag.
/// The raw value keeps both forms in one `u16`: `0x78` is the one-byte
/// tag `78`, `0xBF78` is the two-byte tag `BF 78`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tag(u16);

const TWO_BYTE_MARKER: u8 = 0x1F;

impl Tag {
    pub const fn new(raw: u16) -> Self {
        Tag(raw)
    }

    pub const fn raw(&self) -> u16 {
        self.0
    }

    /// First tag byte as it appears on the wire.
    pub fn leading_byte(&self) -> u8 {
        if self.0 > 0xFF { (self.0 >> 8) as u8 } else { self.0 as u8 }
    }

    /// Constructed (template) tags have bit 6 of the leading byte set.
    pub fn is_constructed(&self) -> bool {
        self.leading_byte() & 0x20 != 0
    }

    pub fn encoded_len(&self) -> usize {
        if self.0 > 0xFF { 2 } else { 1 }
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        if self.0 > 0xFF {
            out.push((self.0 >> 8) as u8);
        }
        out.push(self.0 as u8);
    }

    /// Decode a tag from the front of `buf`, returning it and the number
    /// of bytes consumed.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize)> {
        ensure!(!buf.is_empty(), "empty buffer while reading tag");
        let first = buf[0];
        if first & TWO_BYTE_MARKER == TWO_BYTE_MARKER {
            ensure!(buf.len() >= 2, "truncated two-byte tag 0x{first:02X}");
            Ok((Tag(u16::from_be_bytes([first, buf[1]])), 2))
        } else {
            Ok((Tag(first as u16), 1))
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 > 0xFF {
            write!(f, "{:04X}", self.0)
        } else {
            write!(f, "{:02X}", self.0)
        }
    }
}

impl From<u16> for Tag {
    fn from(raw: u16) -> Self {
        Tag(raw)
    }
}

/// One decoded tag-length-value object. The value is kept as raw bytes;
/// constructed objects expose their nested content via [`Tlv::children`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv {
    pub tag: Tag,
    pub value: Vec<u8>,
}

impl Tlv {
    pub fn new(tag: impl Into<Tag>, value: Vec<u8>) -> Self {
        Self {
            tag: tag.into(),
            value,
        }
    }

    /// Decode a single TLV from the front of `buf`, returning the object
    /// and the number of bytes consumed.
    pub fn parse_one(buf: &[u8]) -> Result<(Self, usize)> {
        let (tag, tag_len) = Tag::parse(buf)?;
        let rest = &buf[tag_len..];
        let (len, len_len) = parse_length(rest)
            .map_err(|e| anyhow::anyhow!("tag {tag}: {e}"))?;
        let total = tag_len + len_len + len;
        ensure!(
            buf.len() >= total,
            "tag {tag}: value truncated, want {len} bytes, have {}",
            buf.len() - tag_len - len_len
        );
        let value = rest[len_len..len_len + len].to_vec();
        Ok((Self { tag, value }, total))
    }

    /// Decode the whole buffer as a sequence of TLVs.
    pub fn parse_all(buf: &[u8]) -> Result<TlvMap> {
        let mut entries = Vec::new();
        let mut off = 0;
        while off < buf.len() {
            let (tlv, used) = Self::parse_one(&buf[off..])?;
            entries.push(tlv);
            off += used;
        }
        Ok(TlvMap { entries })
    }

    /// Parse the value of a constructed object into its nested TLVs.
    pub fn children(&self) -> Result<TlvMap> {
        Self::parse_all(&self.value)
    }

    pub fn encoded_len(&self) -> usize {
        self.tag.encoded_len() + length_len(self.value.len()) + self.value.len()
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        self.tag.encode_into(out);
        encode_length(self.value.len(), out);
        out.extend_from_slice(&self.value);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out);
        out
    }
}

fn parse_length(buf: &[u8]) -> Result<(usize, usize)> {
    ensure!(!buf.is_empty(), "missing length byte");
    match buf[0] {
        n @ 0x00..=0x7F => Ok((n as usize, 1)),
        0x81 => {
            ensure!(buf.len() >= 2, "truncated 0x81 length");
            Ok((buf[1] as usize, 2))
        },
        0x82 => {
            ensure!(buf.len() >= 3, "truncated 0x82 length");
            Ok((u16::from_be_bytes([buf[1], buf[2]]) as usize, 3))
        },
        other => bail!("unsupported length form 0x{other:02X}"),
    }
}

fn length_len(len: usize) -> usize {
    match len {
        0..=0x7F => 1,
        0x80..=0xFF => 2,
        _ => 3,
    }
}

fn encode_length(len: usize, out: &mut Vec<u8>) {
    debug_assert!(len <= u16::MAX as usize, "TLV value too long: {len}");
    match len {
        0..=0x7F => out.push(len as u8),
        0x80..=0xFF => {
            out.push(0x81);
            out.push(len as u8);
        },
        _ => {
            out.push(0x82);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        },
    }
}

/// Insertion-ordered multimap of decoded TLVs. CSML templates repeat
/// tags (e.g. one `81` per notification), so plain map semantics would
/// lose objects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlvMap {
    entries: Vec<Tlv>,
}

impl TlvMap {
    pub fn iter(&self) -> impl Iterator<Item = &Tlv> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get_first(&self, tag: impl Into<Tag>) -> Option<&Tlv> {
        let tag = tag.into();
        self.entries.iter().find(|t| t.tag == tag)
    }

    pub fn get_all(&self, tag: impl Into<Tag>) -> impl Iterator<Item = &Tlv> {
        let tag = tag.into();
        self.entries.iter().filter(move |t| t.tag == tag)
    }

    /// Like [`TlvMap::get_first`] but a missing tag is an error.
    pub fn require(&self, tag: impl Into<Tag>) -> Result<&Tlv> {
        let tag = tag.into();
        self.get_first(tag)
            .ok_or_else(|| anyhow::anyhow!("missing mandatory DO {tag}"))
    }
}

impl IntoIterator for TlvMap {
    type IntoIter = std::vec::IntoIter<Tlv>;
    type Item = Tlv;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// Builder emitting TLVs in insertion order.
#[derive(Debug, Default)]
pub struct TlvBuilder {
    entries: Vec<Tlv>,
}

impl TlvBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(mut self, tag: impl Into<Tag>, value: impl Into<Vec<u8>>) -> Self {
        self.entries.push(Tlv::new(tag, value.into()));
        self
    }

    pub fn put_u8(self, tag: impl Into<Tag>, value: u8) -> Self {
        self.put(tag, vec![value])
    }

    pub fn put_u16(self, tag: impl Into<Tag>, value: u16) -> Self {
        self.put(tag, value.to_be_bytes().to_vec())
    }

    pub fn put_u32(self, tag: impl Into<Tag>, value: u32) -> Self {
        self.put(tag, value.to_be_bytes().to_vec())
    }

    /// Nest an already-built object list under a constructed tag.
    pub fn put_children(self, tag: impl Into<Tag>, children: TlvBuilder) -> Self {
        self.put(tag, children.build())
    }

    pub fn put_opt(self, tag: impl Into<Tag>, value: Option<Vec<u8>>) -> Self {
        match value {
            Some(v) => self.put(tag, v),
            None => self,
        }
    }

    pub fn build(self) -> Vec<u8> {
        let cap = self.entries.iter().map(Tlv::encoded_len).sum();
        let mut out = Vec::with_capacity(cap);
        for tlv in &self.entries {
            tlv.encode_into(&mut out);
        }
        out
    }
}

/// One entry of an ISO 7816-4 Extended Header List (tag `4D`): a tag
/// followed by a one-byte content length, where `0x00` requests the
/// whole content of the referenced DO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtendedHeader {
    pub tag: Tag,
    pub len: u8,
}

impl ExtendedHeader {
    /// Content-length byte asking for the complete DO.
    pub const ALL_CONTENT: u8 = 0x00;

    pub fn whole(tag: impl Into<Tag>) -> Self {
        Self {
            tag: tag.into(),
            len: Self::ALL_CONTENT,
        }
    }

    pub fn partial(tag: impl Into<Tag>, len: u8) -> Self {
        Self {
            tag: tag.into(),
            len,
        }
    }
}

pub fn encode_extended_header_list(headers: &[ExtendedHeader]) -> Vec<u8> {
    let mut out =
        Vec::with_capacity(headers.iter().map(|h| h.tag.encoded_len() + 1).sum());
    for h in headers {
        h.tag.encode_into(&mut out);
        out.push(h.len);
    }
    out
}
