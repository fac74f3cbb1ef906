use crate::utils::error::{EtmaError, Result};

pub trait Validate {
    fn validate(&self) -> Result<()>;
}

pub fn validate_path(field_name: &str, path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(EtmaError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: path.to_string(),
            reason: "Path cannot be empty".to_string(),
        });
    }

    if path.contains('\0') {
        return Err(EtmaError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: path.to_string(),
            reason: "Path contains null bytes".to_string(),
        });
    }

    Ok(())
}

pub fn validate_positive_number(field_name: &str, value: u64, min_value: u64) -> Result<()> {
    if value < min_value {
        return Err(EtmaError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: value.to_string(),
            reason: format!("Value must be at least {}", min_value),
        });
    }
    Ok(())
}

pub fn validate_non_empty_string(field_name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(EtmaError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: value.to_string(),
            reason: "Value cannot be empty or whitespace-only".to_string(),
        });
    }
    Ok(())
}

pub fn validate_range<T: PartialOrd + std::fmt::Display + Copy>(
    field_name: &str,
    value: T,
    min: T,
    max: T,
) -> Result<()> {
    if value < min || value > max {
        return Err(EtmaError::InvalidConfigValueError {
            field: field_name.to_string(),
            value: value.to_string(),
            reason: format!("Value must be between {} and {}", min, max),
        });
    }
    Ok(())
}

/// Fails unless each value is strictly greater than the one before it.
pub fn validate_increasing(field_name: &str, values: &[(&str, u64)]) -> Result<()> {
    for pair in values.windows(2) {
        let (prev_name, prev) = pair[0];
        let (name, value) = pair[1];
        if value <= prev {
            return Err(EtmaError::InvalidConfigValueError {
                field: format!("{}.{}", field_name, name),
                value: value.to_string(),
                reason: format!("Must be greater than {} ({})", prev_name, prev),
            });
        }
    }
    Ok(())
}

/// Marks entered by a tutor must lie within the assignment's maximum.
pub fn validate_score(score: u32, max_score: u32) -> Result<()> {
    if max_score == 0 {
        return Err(EtmaError::ValidationError {
            message: "Maximum score must be greater than zero".to_string(),
        });
    }
    if score > max_score {
        return Err(EtmaError::ValidationError {
            message: format!("Score {} exceeds the maximum of {}", score, max_score),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_positive_number() {
        assert!(validate_positive_number("autosave.idle_ms", 5, 1).is_ok());
        assert!(validate_positive_number("autosave.idle_ms", 0, 1).is_err());
    }

    #[test]
    fn test_validate_increasing() {
        let ok = [("warning", 10), ("soft_lock", 15), ("hard_lock", 30)];
        assert!(validate_increasing("inactivity", &ok).is_ok());

        let bad = [("warning", 10), ("soft_lock", 10), ("hard_lock", 30)];
        let err = validate_increasing("inactivity", &bad).unwrap_err();
        assert!(err.to_string().contains("inactivity.soft_lock"));
    }

    #[test]
    fn test_validate_score() {
        assert!(validate_score(45, 100).is_ok());
        assert!(validate_score(100, 100).is_ok());
        assert!(validate_score(101, 100).is_err());
        assert!(validate_score(0, 0).is_err());
    }

    #[test]
    fn test_validate_path() {
        assert!(validate_path("paths.etmas_dir", "/home/tutor/etmas").is_ok());
        assert!(validate_path("paths.etmas_dir", "").is_err());
    }
}
