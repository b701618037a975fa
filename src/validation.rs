//! Input validation for user-submitted data

/// Validates username format
///
/// Requirements:
/// - 3-32 characters
/// - Alphanumeric characters plus underscore and hyphen
pub fn validate_username(name: &str) -> Result<(), String> {
    if name.len() < 3 {
        return Err("Username must be at least 3 characters long".to_string());
    }

    if name.len() > 32 {
        return Err("Username must not exceed 32 characters".to_string());
    }

    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
    {
        return Err(
            "Username can only contain alphanumeric characters, underscores, and hyphens"
                .to_string(),
        );
    }

    Ok(())
}

/// Validates password length (hashing handles the rest)
pub fn validate_password(password: &str) -> Result<(), String> {
    if password.len() < 8 {
        return Err("Password must be at least 8 characters".to_string());
    }

    Ok(())
}

/// Validates email shape; uniqueness is enforced by the store
pub fn validate_email(email: &str) -> Result<(), String> {
    if email.is_empty() {
        return Err("Email is required".to_string());
    }

    if email.len() > 255 || !email.contains('@') {
        return Err("Invalid email address".to_string());
    }

    Ok(())
}

/// Validates server name format
///
/// Requirements:
/// - 2-100 characters after trimming
pub fn validate_server_name(name: &str) -> Result<(), String> {
    let trimmed = name.trim();

    if trimmed.len() < 2 {
        return Err("Server name must be between 2 and 100 characters".to_string());
    }

    if trimmed.len() > 100 {
        return Err("Server name must be between 2 and 100 characters".to_string());
    }

    Ok(())
}

/// Validates channel name format
///
/// Requirements:
/// - 1-100 characters
pub fn validate_channel_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("Channel name must be between 1 and 100 characters".to_string());
    }

    if name.len() > 100 {
        return Err("Channel name must be between 1 and 100 characters".to_string());
    }

    Ok(())
}

/// Validates display name length
pub fn validate_display_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("Display name cannot be empty".to_string());
    }

    if name.len() > 64 {
        return Err("Display name must not exceed 64 characters".to_string());
    }

    Ok(())
}

/// Validates bio text length
pub fn validate_bio(bio: &str) -> Result<(), String> {
    if bio.len() > 512 {
        return Err("Bio must not exceed 512 characters".to_string());
    }

    Ok(())
}
