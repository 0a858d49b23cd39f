use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Library,
    Table,
    User,
    ClientCache,
    Plan,
    Cursor,
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceType::Library => write!(f, "library"),
            ResourceType::Table => write!(f, "table"),
            ResourceType::User => write!(f, "user"),
            ResourceType::ClientCache => write!(f, "client cache"),
            ResourceType::Plan => write!(f, "plan"),
            ResourceType::Cursor => write!(f, "cursor"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorCode {
    Encode,
    Decode,
    Validation,
    InvalidConfig,
    LibraryAlreadyExists,
    TableAlreadyExists,
    UserAlreadyExists,
    LibraryNotFound,
    TableNotFound,
    UserNotFound,
    ClientCacheNotFound,
    PlanNotFound,
    CursorNotFound,
    UnknownColumn,
    TypeMismatch,
    NotNullViolation,
    CacheSerialization,
    CacheSerializationTimeout,
    CacheLockTimeout,
    CacheDeserialization,
    CursorSync,
    InvalidBookmark,
    CapabilityNotSupported,
    NoCurrentRow,
}

impl ProxyErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ProxyErrorCode::Encode => "encode",
            ProxyErrorCode::Decode => "decode",
            ProxyErrorCode::Validation => "validation",
            ProxyErrorCode::InvalidConfig => "invalid_config",
            ProxyErrorCode::LibraryAlreadyExists => "library_already_exists",
            ProxyErrorCode::TableAlreadyExists => "table_already_exists",
            ProxyErrorCode::UserAlreadyExists => "user_already_exists",
            ProxyErrorCode::LibraryNotFound => "library_not_found",
            ProxyErrorCode::TableNotFound => "table_not_found",
            ProxyErrorCode::UserNotFound => "user_not_found",
            ProxyErrorCode::ClientCacheNotFound => "client_cache_not_found",
            ProxyErrorCode::PlanNotFound => "plan_not_found",
            ProxyErrorCode::CursorNotFound => "cursor_not_found",
            ProxyErrorCode::UnknownColumn => "unknown_column",
            ProxyErrorCode::TypeMismatch => "type_mismatch",
            ProxyErrorCode::NotNullViolation => "not_null_violation",
            ProxyErrorCode::CacheSerialization => "cache_serialization",
            ProxyErrorCode::CacheSerializationTimeout => "cache_serialization_timeout",
            ProxyErrorCode::CacheLockTimeout => "cache_lock_timeout",
            ProxyErrorCode::CacheDeserialization => "cache_deserialization",
            ProxyErrorCode::CursorSync => "cursor_sync",
            ProxyErrorCode::InvalidBookmark => "invalid_bookmark",
            ProxyErrorCode::CapabilityNotSupported => "capability_not_supported",
            ProxyErrorCode::NoCurrentRow => "no_current_row",
        }
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("{resource_type} '{resource_id}' already exists")]
    AlreadyExists {
        resource_type: ResourceType,
        resource_id: String,
    },
    #[error("{resource_type} '{resource_id}' not found")]
    NotFound {
        resource_type: ResourceType,
        resource_id: String,
    },
    #[error("unknown column '{column}' in table '{table}'")]
    UnknownColumn { table: String, column: String },
    #[error(
        "type mismatch: column '{column}' in table '{table}' expected {expected}, got {actual}"
    )]
    TypeMismatch {
        table: String,
        column: String,
        expected: String,
        actual: String,
    },
    #[error("NOT NULL violation: column '{column}' in table '{table}'")]
    NotNullViolation { table: String, column: String },
    #[error(
        "cache serialization error: client timestamp {client_timestamp} is ahead of required {required_timestamp}"
    )]
    CacheSerialization {
        client_timestamp: u64,
        required_timestamp: u64,
    },
    #[error("cache serialization timeout: cache '{cache_name}' never reached timestamp {waiting_for}")]
    CacheSerializationTimeout { cache_name: String, waiting_for: u64 },
    #[error("cache lock timeout on '{cache_name}'")]
    CacheLockTimeout { cache_name: String },
    #[error("cache deserialization error on '{cache_name}': {source}")]
    CacheDeserialization {
        cache_name: String,
        #[source]
        source: Box<ProxyError>,
    },
    #[error("cursor sync error: {message}")]
    CursorSync { message: String },
    #[error("invalid bookmark {bookmark}")]
    InvalidBookmark { bookmark: u64 },
    #[error("cursor capability not supported: {capability}")]
    CapabilityNotSupported { capability: &'static str },
    #[error("no current row")]
    NoCurrentRow,
}

impl ProxyError {
    pub fn code(&self) -> ProxyErrorCode {
        match self {
            ProxyError::Encode(_) => ProxyErrorCode::Encode,
            ProxyError::Decode(_) => ProxyErrorCode::Decode,
            ProxyError::Validation(_) => ProxyErrorCode::Validation,
            ProxyError::InvalidConfig { .. } => ProxyErrorCode::InvalidConfig,
            ProxyError::AlreadyExists { resource_type, .. } => match resource_type {
                ResourceType::Library => ProxyErrorCode::LibraryAlreadyExists,
                ResourceType::Table => ProxyErrorCode::TableAlreadyExists,
                ResourceType::User => ProxyErrorCode::UserAlreadyExists,
                ResourceType::ClientCache | ResourceType::Plan | ResourceType::Cursor => {
                    ProxyErrorCode::Validation
                }
            },
            ProxyError::NotFound { resource_type, .. } => match resource_type {
                ResourceType::Library => ProxyErrorCode::LibraryNotFound,
                ResourceType::Table => ProxyErrorCode::TableNotFound,
                ResourceType::User => ProxyErrorCode::UserNotFound,
                ResourceType::ClientCache => ProxyErrorCode::ClientCacheNotFound,
                ResourceType::Plan => ProxyErrorCode::PlanNotFound,
                ResourceType::Cursor => ProxyErrorCode::CursorNotFound,
            },
            ProxyError::UnknownColumn { .. } => ProxyErrorCode::UnknownColumn,
            ProxyError::TypeMismatch { .. } => ProxyErrorCode::TypeMismatch,
            ProxyError::NotNullViolation { .. } => ProxyErrorCode::NotNullViolation,
            ProxyError::CacheSerialization { .. } => ProxyErrorCode::CacheSerialization,
            ProxyError::CacheSerializationTimeout { .. } => {
                ProxyErrorCode::CacheSerializationTimeout
            }
            ProxyError::CacheLockTimeout { .. } => ProxyErrorCode::CacheLockTimeout,
            ProxyError::CacheDeserialization { .. } => ProxyErrorCode::CacheDeserialization,
            ProxyError::CursorSync { .. } => ProxyErrorCode::CursorSync,
            ProxyError::InvalidBookmark { .. } => ProxyErrorCode::InvalidBookmark,
            ProxyError::CapabilityNotSupported { .. } => ProxyErrorCode::CapabilityNotSupported,
            ProxyError::NoCurrentRow => ProxyErrorCode::NoCurrentRow,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    /// Timeouts and serialization failures leave the mirror valid; the whole
    /// operation may be retried by the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProxyError::CacheSerialization { .. }
                | ProxyError::CacheSerializationTimeout { .. }
                | ProxyError::CacheLockTimeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{ProxyError, ProxyErrorCode, ResourceType};

    #[test]
    fn error_code_strings_are_stable() {
        assert_eq!(ProxyErrorCode::TableNotFound.as_str(), "table_not_found");
        assert_eq!(
            ProxyErrorCode::CacheSerializationTimeout.as_str(),
            "cache_serialization_timeout"
        );
        assert_eq!(ProxyErrorCode::InvalidBookmark.as_str(), "invalid_bookmark");
    }

    #[test]
    fn error_code_str_matches_variant_mapping() {
        let err = ProxyError::NotFound {
            resource_type: ResourceType::ClientCache,
            resource_id: "desktop".into(),
        };
        assert_eq!(err.code(), ProxyErrorCode::ClientCacheNotFound);
        assert_eq!(err.code_str(), "client_cache_not_found");
    }

    #[test]
    fn deserialization_error_keeps_its_source() {
        let err = ProxyError::CacheDeserialization {
            cache_name: "desktop".into(),
            source: Box::new(ProxyError::Validation("bad delta".into())),
        };
        assert_eq!(
            err.to_string(),
            "cache deserialization error on 'desktop': validation error: bad delta"
        );
        assert!(std::error::Error::source(&err).is_some());
        assert!(!err.is_retryable());
    }

    #[test]
    fn serialization_failures_are_retryable() {
        assert!(
            ProxyError::CacheLockTimeout {
                cache_name: "c".into()
            }
            .is_retryable()
        );
        assert!(!ProxyError::NoCurrentRow.is_retryable());
    }
}
