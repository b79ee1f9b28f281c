use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TableError {
    #[error("unable to {op} {what} ({input}): {reason}")]
    Codec {
        op: &'static str,
        what: &'static str,
        input: String,
        reason: String,
    },

    #[error("element ({key}) not found")]
    NotFound { key: String },

    #[error("unable to {op} element ({target}): {source}")]
    Access {
        op: &'static str,
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("{what} record is {actual} bytes, table declares {expected}")]
    WidthMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("table {table}: every sentinel key candidate is resident, cannot start a scan")]
    NoSentinel { table: String },

    #[error("invalid type descriptor: {0}")]
    Descriptor(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TableError>;

impl TableError {
    /// True for the soft miss that `Table::get` collapses into `None`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, TableError::NotFound { .. })
    }
}

/// Lowercase hex rendering of a raw record, used where no text form exists.
pub(crate) fn hex(record: &[u8]) -> String {
    let mut out = String::with_capacity(record.len() * 2 + 2);
    out.push_str("0x");
    for byte in record {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_error_names_target_and_cause() {
        let err = TableError::Access {
            op: "update",
            target: "1=100".to_string(),
            source: io::Error::from_raw_os_error(libc::E2BIG),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("unable to update element (1=100): "));
    }

    #[test]
    fn test_hex() {
        assert_eq!(hex(&[0x00, 0xff, 0x55]), "0x00ff55");
        assert_eq!(hex(&[]), "0x");
    }
}
