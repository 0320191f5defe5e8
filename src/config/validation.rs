use super::models::{Config, StorageProvider};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Engine limit must be positive: {field}")]
    ZeroLimit { field: &'static str },

    #[error("Storage provider is local but no root directory is configured")]
    MissingStorageRoot,
}

/// Validate the entire configuration
pub fn validate(config: &Config) -> Result<(), ValidationError> {
    validate_engine(config)?;
    validate_storage(config)?;
    Ok(())
}

fn validate_engine(config: &Config) -> Result<(), ValidationError> {
    let engine = &config.engine;

    if engine.multipart_memory.as_u64() == 0 {
        return Err(ValidationError::ZeroLimit {
            field: "multipart_memory",
        });
    }

    if engine.max_body_bytes.as_u64() == 0 {
        return Err(ValidationError::ZeroLimit {
            field: "max_body_bytes",
        });
    }

    if engine.pool_max_idle == 0 {
        return Err(ValidationError::ZeroLimit {
            field: "pool_max_idle",
        });
    }

    Ok(())
}

/// Local storage needs somewhere to write
fn validate_storage(config: &Config) -> Result<(), ValidationError> {
    if config.storage.provider == StorageProvider::Local
        && config.storage.root.as_os_str().is_empty()
    {
        return Err(ValidationError::MissingStorageRoot);
    }

    Ok(())
}
