//! Single-key tuple descriptors.
//!
//! The front door receives the key attribute's catalog description as an
//! opaque blob; only the fields the fixed-width tuple builder consumes are
//! decoded: `(attlen: i16, attalign: u8, attbyval: u8)` per attribute.

use crate::error::{Result, SoeError};

pub const ATTR_DESC_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PgAttribute {
    /// Fixed width in bytes, or -1 for varwidth.
    pub attlen: i16,
    /// Alignment class: `c`, `s`, `i` or `d`.
    pub attalign: u8,
    pub attbyval: bool,
}

impl PgAttribute {
    /// Alignment in bytes for the attribute's class.
    pub fn alignof(&self) -> usize {
        match self.attalign {
            b'c' => 1,
            b's' => 2,
            b'i' => 4,
            b'd' => 8,
            other => {
                tracing::warn!("unknown attalign {other}, assuming int alignment");
                4
            }
        }
    }

    pub fn encode(&self) -> [u8; ATTR_DESC_LEN] {
        let len = self.attlen.to_le_bytes();
        [len[0], len[1], self.attalign, self.attbyval as u8]
    }
}

/// Align a running data offset for this attribute. Varwidth attributes may
/// use short alignment when the value starts unpadded.
pub fn att_align(cur_offset: usize, attr: &PgAttribute) -> usize {
    let align = attr.alignof();
    (cur_offset + align - 1) & !(align - 1)
}

#[derive(Debug, Clone)]
pub struct TupleDesc {
    pub attrs: Vec<PgAttribute>,
}

impl TupleDesc {
    pub fn natts(&self) -> usize {
        self.attrs.len()
    }

    /// The conventional single char-key descriptor.
    pub fn single_char_key() -> Self {
        Self {
            attrs: vec![PgAttribute {
                attlen: -1,
                attalign: b'c',
                attbyval: false,
            }],
        }
    }

    /// Fixed-width four-byte key (hash codes).
    pub fn single_int_key() -> Self {
        Self {
            attrs: vec![PgAttribute {
                attlen: 4,
                attalign: b'i',
                attbyval: true,
            }],
        }
    }

    /// Decode a descriptor blob copied across the trust boundary.
    pub fn from_attr_desc(raw: &[u8]) -> Result<Self> {
        if raw.is_empty() || raw.len() % ATTR_DESC_LEN != 0 {
            return Err(SoeError::Invalid(format!(
                "attribute descriptor of {} bytes",
                raw.len()
            )));
        }
        let attrs = raw
            .chunks_exact(ATTR_DESC_LEN)
            .map(|c| PgAttribute {
                attlen: i16::from_le_bytes([c[0], c[1]]),
                attalign: c[2],
                attbyval: c[3] != 0,
            })
            .collect();
        Ok(Self { attrs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attr_desc_roundtrip() {
        let desc = TupleDesc::single_int_key();
        let raw = desc.attrs[0].encode();
        let back = TupleDesc::from_attr_desc(&raw).unwrap();
        assert_eq!(back.attrs, desc.attrs);
    }

    #[test]
    fn test_att_align_classes() {
        let d = PgAttribute {
            attlen: 8,
            attalign: b'd',
            attbyval: true,
        };
        assert_eq!(att_align(5, &d), 8);
        let c = PgAttribute {
            attlen: -1,
            attalign: b'c',
            attbyval: false,
        };
        assert_eq!(att_align(5, &c), 5);
    }

    #[test]
    fn test_rejects_ragged_blob() {
        assert!(TupleDesc::from_attr_desc(&[1, 2, 3]).is_err());
    }
}
