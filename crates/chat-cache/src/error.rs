//! Error types for the chat cache

use std::fmt;

#[derive(Debug)]
pub enum CacheError {
    Io(Box<std::io::Error>),
    Serialization(String),
    InvalidKey(String),
    InvalidIdentifier(String),
    NotAvailable { group_id: String, reason: String },
    MirrorWrite { domain: String, reason: String },
    WriterClosed(String),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::Io(err) => write!(f, "IO error: {}", err),
            CacheError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            CacheError::InvalidKey(msg) => write!(f, "Invalid key: {}", msg),
            CacheError::InvalidIdentifier(id) => write!(f, "Invalid identifier: {}", id),
            CacheError::NotAvailable { group_id, reason } => {
                write!(f, "Group metadata not available for {}: {}", group_id, reason)
            }
            CacheError::MirrorWrite { domain, reason } => {
                write!(f, "Failed to write {} mirror: {}", domain, reason)
            }
            CacheError::WriterClosed(domain) => {
                write!(f, "Mirror writer for {} is no longer running", domain)
            }
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheError::Io(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io(Box::new(err))
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_available_display() {
        let err = CacheError::NotAvailable {
            group_id: "123@g.us".to_string(),
            reason: "client offline".to_string(),
        };
        assert_eq!(
            format!("{}", err),
            "Group metadata not available for 123@g.us: client offline"
        );
    }

    #[test]
    fn test_mirror_write_display() {
        let err = CacheError::MirrorWrite {
            domain: "message".to_string(),
            reason: "disk full".to_string(),
        };
        assert_eq!(format!("{}", err), "Failed to write message mirror: disk full");
    }

    #[test]
    fn test_invalid_identifier_display() {
        let err = CacheError::InvalidIdentifier("555@s.whatsapp.net".to_string());
        assert_eq!(format!("{}", err), "Invalid identifier: 555@s.whatsapp.net");
    }

    #[test]
    fn test_io_error_has_source() {
        use std::error::Error;
        let err: CacheError = std::io::Error::new(std::io::ErrorKind::Other, "disk full").into();
        assert!(err.source().is_some());
        assert!(format!("{}", err).contains("disk full"));
    }

    #[test]
    fn test_serde_error_conversion() {
        let parse = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: CacheError = parse.into();
        assert!(matches!(err, CacheError::Serialization(_)));
    }
}
