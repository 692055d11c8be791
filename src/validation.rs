use crate::error::ThrottleError;

/// Longest key the database backend's primary key column accepts.
pub const MAX_STORAGE_KEY_BYTES: usize = 191;

const MAX_TABLE_NAME_LEN: usize = 64;

/// Table names are interpolated into SQL, so only identifier characters pass.
pub fn validate_table_name(table: &str) -> Result<(), ThrottleError> {
    if table.is_empty() {
        return Err(ThrottleError::Validation(
            "Throttle table name cannot be empty".to_string(),
        ));
    }

    if table.len() > MAX_TABLE_NAME_LEN {
        return Err(ThrottleError::Validation(format!(
            "Throttle table name cannot exceed {} characters",
            MAX_TABLE_NAME_LEN
        )));
    }

    if !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ThrottleError::Validation(
            "Throttle table name can only contain ASCII letters, digits and underscores".to_string(),
        ));
    }

    if table.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(ThrottleError::Validation(
            "Throttle table name cannot start with a digit".to_string(),
        ));
    }

    Ok(())
}

pub fn validate_storage_key(key: &str) -> Result<(), ThrottleError> {
    if key.is_empty() {
        return Err(ThrottleError::Validation(
            "Throttle key cannot be empty".to_string(),
        ));
    }

    if key.len() > MAX_STORAGE_KEY_BYTES {
        return Err(ThrottleError::Validation(format!(
            "Throttle key cannot exceed {} bytes",
            MAX_STORAGE_KEY_BYTES
        )));
    }

    Ok(())
}

/// Limits must allow at least one attempt in a window of at least one second.
pub fn validate_limits(max_attempts: u64, decay_seconds: u64) -> Result<(), ThrottleError> {
    if max_attempts == 0 {
        return Err(ThrottleError::Validation(
            "Max attempts must be greater than 0".to_string(),
        ));
    }

    if decay_seconds == 0 {
        return Err(ThrottleError::Validation(
            "Decay seconds must be greater than 0".to_string(),
        ));
    }

    Ok(())
}
