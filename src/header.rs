use serde::{Deserialize, Serialize};

use crate::error::{corrupt, invalid_input, Result};

/// Size, in bytes, of the on-disk header record.
pub const HEADER_LEN: usize = 64;

/// Signature carried by every database file.
pub const SIGNATURE: &str = "fDB";

/// The only on-disk format version this crate reads or writes.
pub const FORMAT_VERSION: u32 = 1;

/// Inclusive bounds for the configured row size.
pub const MIN_ROW_SIZE: u32 = 128;
pub const MAX_ROW_SIZE: u32 = 65_536;

/// Upper bound for the configured skew window: one day, in milliseconds.
pub const MAX_SKEW_MS: u64 = 86_400_000;

/// Process-wide configuration for a database file.
///
/// The header is written once at creation and never modified.  On disk it is
/// a 64-byte record: the minified JSON form of this struct, null-byte padded
/// through byte 62, with a trailing newline at byte 63.
///
/// # Warning
///
/// - Do not add fields to this struct.
/// - Do not remove fields from this struct.
/// - Do not change the order of fields in this struct.
///
/// Doing so will change the serialized representation.  This will break
/// every existing database file.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Header {
    sig: String,
    ver: u32,
    row_size: u32,
    skew_ms: u64,
}

impl Header {
    /// Creates a header for a new database file.
    ///
    /// # Errors
    ///
    /// If `row_size` or `skew_ms` is out of range, an error variant will be
    /// returned describing the offending parameter.
    pub fn new(row_size: u32, skew_ms: u64) -> Result<Self> {
        if !(MIN_ROW_SIZE..=MAX_ROW_SIZE).contains(&row_size) {
            return Err(invalid_input(format!(
                "row_size must be within {MIN_ROW_SIZE}..={MAX_ROW_SIZE}, got {row_size}"
            )));
        }
        if skew_ms > MAX_SKEW_MS {
            return Err(invalid_input(format!(
                "skew_ms must be at most {MAX_SKEW_MS}, got {skew_ms}"
            )));
        }

        Ok(Self {
            sig: SIGNATURE.to_string(),
            ver: FORMAT_VERSION,
            row_size,
            skew_ms,
        })
    }

    /// Gets the fixed width, in bytes, of every row in the file.
    pub fn row_size(&self) -> usize {
        self.row_size as usize
    }

    /// Gets the skew window, in milliseconds, tolerated for key ordering.
    pub fn skew_ms(&self) -> u64 {
        self.skew_ms
    }

    /// Encodes this header into its 64-byte on-disk form.
    ///
    /// # Errors
    ///
    /// If the header fields serialize to more than the space available in
    /// the record, an error variant will be returned.  This cannot happen
    /// for any header that passed [`Header::new`] validation.
    pub fn encode(&self) -> Result<[u8; HEADER_LEN]> {
        let json = serde_json::to_vec(self)
            .map_err(|e| corrupt(format!("failed to serialize header: {e}")))?;
        if json.len() > HEADER_LEN - 2 {
            return Err(corrupt(format!(
                "serialized header is {} bytes, limit is {}",
                json.len(),
                HEADER_LEN - 2
            )));
        }

        let mut buf = [0u8; HEADER_LEN];
        buf[..json.len()].copy_from_slice(&json);
        buf[HEADER_LEN - 1] = b'\n';
        Ok(buf)
    }

    /// Decodes a header from its 64-byte on-disk form.
    ///
    /// The record must be an ASCII JSON prefix followed only by null bytes
    /// and a trailing newline, and the decoded fields must carry the
    /// expected signature and version and in-range parameters.
    ///
    /// # Errors
    ///
    /// Any deviation from the layout or field constraints returns a
    /// corruption error naming the deviation.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != HEADER_LEN {
            return Err(corrupt(format!(
                "header record must be {} bytes, got {}",
                HEADER_LEN,
                bytes.len()
            )));
        }
        if bytes[HEADER_LEN - 1] != b'\n' {
            return Err(corrupt("header record missing trailing newline"));
        }

        let body = &bytes[..HEADER_LEN - 1];
        let json_len = body.iter().position(|&b| b == 0).unwrap_or(body.len());
        let json = &body[..json_len];
        if !json.is_ascii() {
            return Err(corrupt("header JSON contains non-ASCII bytes"));
        }
        if body[json_len..].iter().any(|&b| b != 0) {
            return Err(corrupt("header padding contains non-null bytes"));
        }

        let header: Header = serde_json::from_slice(json)
            .map_err(|e| corrupt(format!("failed to deserialize header: {e}")))?;
        if header.sig != SIGNATURE {
            return Err(corrupt(format!("unexpected signature '{}'", header.sig)));
        }
        if header.ver != FORMAT_VERSION {
            return Err(corrupt(format!("unsupported format version {}", header.ver)));
        }
        if !(MIN_ROW_SIZE..=MAX_ROW_SIZE).contains(&header.row_size) {
            return Err(corrupt(format!("row_size {} out of range", header.row_size)));
        }
        if header.skew_ms > MAX_SKEW_MS {
            return Err(corrupt(format!("skew_ms {} out of range", header.skew_ms)));
        }

        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn round_trip() {
        let header = Header::new(4096, 5000).expect("header should build");
        let bytes = header.encode().expect("encode should not fail");
        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(bytes[HEADER_LEN - 1], b'\n');

        let decoded = Header::decode(&bytes).expect("decode should not fail");
        assert_eq!(decoded, header);
        assert_eq!(decoded.row_size(), 4096);
        assert_eq!(decoded.skew_ms(), 5000);
    }

    #[test]
    fn encoded_form_is_minified_json_then_nulls() {
        let header = Header::new(128, 0).expect("header should build");
        let bytes = header.encode().expect("encode should not fail");
        let expected = br#"{"sig":"fDB","ver":1,"row_size":128,"skew_ms":0}"#;
        assert_eq!(&bytes[..expected.len()], &expected[..]);
        assert!(bytes[expected.len()..HEADER_LEN - 1].iter().all(|&b| b == 0));
    }

    #[test]
    fn rejects_out_of_range_parameters() {
        assert_eq!(Header::new(127, 0).unwrap_err().kind(), ErrorKind::InvalidInput);
        assert_eq!(Header::new(65_537, 0).unwrap_err().kind(), ErrorKind::InvalidInput);
        assert_eq!(
            Header::new(4096, MAX_SKEW_MS + 1).unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
        assert!(Header::new(MIN_ROW_SIZE, 0).is_ok());
        assert!(Header::new(MAX_ROW_SIZE, MAX_SKEW_MS).is_ok());
    }

    #[test]
    fn rejects_malformed_records() {
        let good = Header::new(4096, 5000)
            .and_then(|h| h.encode())
            .expect("encode should not fail");

        let mut missing_newline = good;
        missing_newline[HEADER_LEN - 1] = 0;
        assert_eq!(
            Header::decode(&missing_newline).unwrap_err().kind(),
            ErrorKind::Corrupt
        );

        let mut dirty_padding = good;
        dirty_padding[HEADER_LEN - 2] = b'x';
        assert_eq!(
            Header::decode(&dirty_padding).unwrap_err().kind(),
            ErrorKind::Corrupt
        );

        let mut bad_sig = good;
        bad_sig[9] = b'X';
        assert_eq!(Header::decode(&bad_sig).unwrap_err().kind(), ErrorKind::Corrupt);

        assert_eq!(
            Header::decode(&good[..HEADER_LEN - 1]).unwrap_err().kind(),
            ErrorKind::Corrupt
        );
    }

    #[test]
    fn rejects_wrong_version_and_ranges() {
        let mut buf = [0u8; HEADER_LEN];
        let json = br#"{"sig":"fDB","ver":2,"row_size":4096,"skew_ms":0}"#;
        buf[..json.len()].copy_from_slice(json);
        buf[HEADER_LEN - 1] = b'\n';
        assert_eq!(Header::decode(&buf).unwrap_err().kind(), ErrorKind::Corrupt);

        let mut buf = [0u8; HEADER_LEN];
        let json = br#"{"sig":"fDB","ver":1,"row_size":64,"skew_ms":0}"#;
        buf[..json.len()].copy_from_slice(json);
        buf[HEADER_LEN - 1] = b'\n';
        assert_eq!(Header::decode(&buf).unwrap_err().kind(), ErrorKind::Corrupt);
    }
}
