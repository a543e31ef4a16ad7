use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use std::fmt;

use crate::error::AppError;

/// A re-entered operator credential. Never printed.
#[derive(Clone)]
pub struct Password(String);

impl Password {
    pub fn new(password: impl Into<String>) -> Self {
        Self(password.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(***)")
    }
}

/// PHC-formatted Argon2 hash as stored in the credentials table.
#[derive(Debug, Clone)]
pub struct PasswordHashString(String);

impl PasswordHashString {
    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

/// Hash a password with Argon2id and a random salt.
pub fn hash_password(password: &Password) -> Result<PasswordHashString, AppError> {
    let salt = SaltString::generate(&mut OsRng);

    let password_hash = Argon2::default()
        .hash_password(password.as_str().as_bytes(), &salt)
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Failed to hash password: {}", e)))?
        .to_string();

    Ok(PasswordHashString::new(password_hash))
}

/// Verify a password against a stored hash.
///
/// A malformed hash is an internal error; a mismatch is `Unauthorized`.
pub fn verify_password(
    password: &Password,
    password_hash: &PasswordHashString,
) -> Result<(), AppError> {
    let parsed_hash = PasswordHash::new(password_hash.as_str()).map_err(|e| {
        AppError::InternalError(anyhow::anyhow!("Invalid password hash format: {}", e))
    })?;

    Argon2::default()
        .verify_password(password.as_str().as_bytes(), &parsed_hash)
        .map_err(|_| AppError::Unauthorized(anyhow::anyhow!("Credential verification failed")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_argon2_phc_string() {
        let hash = hash_password(&Password::new("finance-desk-2024")).unwrap();
        assert!(hash.as_str().starts_with("$argon2"));
    }

    #[test]
    fn correct_password_verifies() {
        let password = Password::new("finance-desk-2024");
        let hash = hash_password(&password).unwrap();
        assert!(verify_password(&password, &hash).is_ok());
    }

    #[test]
    fn wrong_password_is_unauthorized() {
        let hash = hash_password(&Password::new("finance-desk-2024")).unwrap();
        let err = verify_password(&Password::new("guess"), &hash).unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));
    }

    #[test]
    fn garbage_hash_is_internal_error() {
        let err = verify_password(
            &Password::new("anything"),
            &PasswordHashString::new("not-a-phc-string"),
        )
        .unwrap_err();
        assert!(matches!(err, AppError::InternalError(_)));
    }

    #[test]
    fn debug_output_hides_the_secret() {
        let password = Password::new("finance-desk-2024");
        assert_eq!(format!("{:?}", password), "Password(***)");
    }
}
