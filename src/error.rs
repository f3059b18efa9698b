use thiserror::Error;

#[derive(Error, Debug)]
pub enum KpiError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown timezone '{0}'")]
    UnknownTimezone(String),

    #[error("{vendor} rejected the request credentials (status {status})")]
    Authorization { vendor: String, status: u16 },

    #[error("{vendor} transient failure (status {status:?}): {details}")]
    Transient {
        vendor: String,
        status: Option<u16>,
        details: String,
    },

    #[error("{vendor} request failed with status {status}: {details}")]
    Vendor {
        vendor: String,
        status: u16,
        details: String,
    },

    #[error("Malformed data from {vendor}: {details}")]
    Data { vendor: String, details: String },

    #[error("Date calculation error: {0}")]
    DateError(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[cfg(feature = "live")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl KpiError {
    pub fn data(vendor: impl Into<String>, details: impl Into<String>) -> Self {
        Self::Data {
            vendor: vendor.into(),
            details: details.into(),
        }
    }

    /// Maps a vendor HTTP status onto the taxonomy: 401/403 are authorization
    /// failures, 429 and 5xx are transient, everything else is permanent.
    pub fn from_status(vendor: impl Into<String>, status: u16, details: impl Into<String>) -> Self {
        let vendor = vendor.into();
        match status {
            401 | 403 => Self::Authorization { vendor, status },
            429 | 500..=599 => Self::Transient {
                vendor,
                status: Some(status),
                details: details.into(),
            },
            _ => Self::Vendor {
                vendor,
                status,
                details: details.into(),
            },
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transient { .. } => true,
            #[cfg(feature = "live")]
            Self::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status()
                        .map(|s| s.is_server_error() || s.as_u16() == 429)
                        .unwrap_or(false)
            }
            _ => false,
        }
    }

    pub fn is_authorization(&self) -> bool {
        matches!(self, Self::Authorization { .. })
    }
}

pub type Result<T> = std::result::Result<T, KpiError>;
