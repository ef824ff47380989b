use driftfix_common::{Error, Result};

/// Validation and sanitization for request and command input.
pub struct InputValidator;

impl InputValidator {
    /// Sanitize free-form input by removing control characters.
    pub fn sanitize(input: &str) -> String {
        input
            .chars()
            .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
            .collect()
    }

    /// A site id is the decimal blog id of a site.
    pub fn validate_scope_id(id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(Error::Security("site ID cannot be empty".into()));
        }
        if id.len() > 20 {
            return Err(Error::Security("site ID too long".into()));
        }
        if !id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::Security(format!("site ID must be numeric: {id:?}")));
        }
        Ok(())
    }

    /// A user name that a nonce can be bound to.
    pub fn validate_user_name(name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(Error::Security("user name cannot be empty".into()));
        }
        if name.len() > 60 {
            return Err(Error::Security("user name too long".into()));
        }
        if name.chars().any(|c| c.is_control() || c == '|') {
            return Err(Error::Security(
                "user name contains control characters or '|'".into(),
            ));
        }
        Ok(())
    }

    /// Extract the token of an `Authorization: Bearer <token>` header value.
    pub fn bearer_token(header: &str) -> Result<&str> {
        let (scheme, token) = header
            .trim()
            .split_once(' ')
            .ok_or_else(|| Error::Unauthorized("malformed authorization header".into()))?;
        if !scheme.eq_ignore_ascii_case("bearer") || token.trim().is_empty() {
            return Err(Error::Unauthorized("expected a bearer token".into()));
        }
        Ok(token.trim())
    }
}
