/// Codec: string <-> fixed-width binary record for one table's key and leaf.
///
/// Stateless; every call allocates fresh buffers.

use std::sync::Arc;

use crate::descriptor::TypeDescriptor;
use crate::error::{hex, Result, TableError};

/// Rendered text is materialised into a scratch buffer this many times the
/// record width; text that does not fit with its NUL terminator is an error.
pub const SCRATCH_FACTOR: usize = 8;

#[derive(Debug, Clone)]
pub struct Codec {
    key: Arc<TypeDescriptor>,
    leaf: Arc<TypeDescriptor>,
}

impl Codec {
    pub fn new(key: Arc<TypeDescriptor>, leaf: Arc<TypeDescriptor>) -> Self {
        Self { key, leaf }
    }

    pub fn key_size(&self) -> usize {
        self.key.size()
    }

    pub fn leaf_size(&self) -> usize {
        self.leaf.size()
    }

    pub fn encode_key(&self, text: &str) -> Result<Vec<u8>> {
        encode(&self.key, "key", text)
    }

    pub fn encode_leaf(&self, text: &str) -> Result<Vec<u8>> {
        encode(&self.leaf, "leaf", text)
    }

    pub fn decode_key(&self, record: &[u8]) -> Result<String> {
        decode(&self.key, "key", record)
    }

    pub fn decode_leaf(&self, record: &[u8]) -> Result<String> {
        decode(&self.leaf, "leaf", record)
    }
}

fn encode(desc: &TypeDescriptor, what: &'static str, text: &str) -> Result<Vec<u8>> {
    let mut record = vec![0u8; desc.size()];
    desc.scan(text, &mut record)
        .map_err(|reason| TableError::Codec {
            op: "scan",
            what,
            input: text.to_string(),
            reason,
        })?;
    Ok(record)
}

fn decode(desc: &TypeDescriptor, what: &'static str, record: &[u8]) -> Result<String> {
    if record.len() != desc.size() {
        return Err(TableError::WidthMismatch {
            what,
            expected: desc.size(),
            actual: record.len(),
        });
    }
    let codec_err = |reason: String| TableError::Codec {
        op: "render",
        what,
        input: hex(record),
        reason,
    };

    let text = desc.render(record).map_err(codec_err)?;
    let mut scratch = vec![0u8; desc.size() * SCRATCH_FACTOR];
    let copied = text.len().min(scratch.len());
    scratch[..copied].copy_from_slice(&text.as_bytes()[..copied]);

    let end = scratch.iter().position(|&b| b == 0).ok_or_else(|| {
        codec_err(format!(
            "rendered text ({} bytes) leaves no room for a terminator in {} bytes",
            text.len(),
            scratch.len()
        ))
    })?;
    scratch.truncate(end);
    String::from_utf8(scratch).map_err(|err| codec_err(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec(key: &str, leaf: &str) -> Codec {
        Codec::new(
            Arc::new(TypeDescriptor::parse(key).unwrap()),
            Arc::new(TypeDescriptor::parse(leaf).unwrap()),
        )
    }

    #[test]
    fn test_encode_decode_scalars() {
        let codec = codec("unsigned int", "unsigned long long");
        let key = codec.encode_key("1").unwrap();
        assert_eq!(key, 1u32.to_ne_bytes());
        let leaf = codec.encode_leaf("0x64").unwrap();
        assert_eq!(leaf.len(), 8);
        assert_eq!(codec.decode_key(&key).unwrap(), "1");
        assert_eq!(codec.decode_leaf(&leaf).unwrap(), "100");
    }

    #[test]
    fn test_encode_error_carries_input() {
        let codec = codec("unsigned int", "unsigned long long");
        match codec.encode_key("one") {
            Err(TableError::Codec { op, what, input, .. }) => {
                assert_eq!((op, what, input.as_str()), ("scan", "key", "one"));
            }
            other => panic!("expected codec error, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_wrong_width() {
        let codec = codec("unsigned int", "unsigned long long");
        assert!(matches!(
            codec.decode_key(&[0u8; 8]),
            Err(TableError::WidthMismatch {
                expected: 4,
                actual: 8,
                ..
            })
        ));
    }

    #[test]
    fn test_decode_fails_when_text_overflows_scratch() {
        // "[ -128 ]" plus NUL needs 9 bytes; the scratch buffer has 8.
        let codec = codec(r#"["s8", [1]]"#, "u8");
        let err = codec.decode_key(&[0x80]).unwrap_err();
        assert!(matches!(err, TableError::Codec { op: "render", .. }));

        // "[ -12 ]" fits with its terminator.
        assert_eq!(codec.decode_key(&[(-12i8) as u8]).unwrap(), "[ -12 ]");
    }
}
