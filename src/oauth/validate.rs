//! Callback parameter validation.
//!
//! The callback URL is the one place where attacker-controlled input
//! reaches the server without prior authentication, so every parameter is
//! checked against a strict schema before any state lookup, network call,
//! or storage write. Rejected input is never echoed back to the client,
//! only logged server-side, truncated.

use super::state_cache::STATE_LEN;
use serde::Deserialize;
use std::fmt;

/// Maximum accepted length of an authorization code
const CODE_MAX_LEN: usize = 500;

/// Maximum accepted length of a provider error code
const ERROR_CODE_MAX_LEN: usize = 64;

/// Maximum accepted length of a provider error description
const ERROR_DESCRIPTION_MAX_LEN: usize = 256;

/// Raw callback query parameters, exactly as the provider redirect sent them.
#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// A callback that passed schema validation.
#[derive(Debug, PartialEq)]
pub enum ValidCallback {
    /// Provider returned an authorization code
    Grant { code: String, state: String },
    /// Provider reported the user denied consent (or another provider-side
    /// error); no code exchange will happen
    Denied { error: String },
}

/// Schema violations. Collapsed to a single "invalid parameters" outcome at
/// the HTTP boundary; the variants exist for logging and tests.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    MissingParams,
    InvalidCode,
    InvalidState,
    InvalidErrorCode,
    InvalidErrorDescription,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::MissingParams => write!(f, "required parameters missing"),
            ValidationError::InvalidCode => write!(f, "malformed authorization code"),
            ValidationError::InvalidState => write!(f, "malformed state parameter"),
            ValidationError::InvalidErrorCode => write!(f, "malformed error code"),
            ValidationError::InvalidErrorDescription => write!(f, "malformed error description"),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Validate raw callback parameters against the schema.
///
/// Rules:
/// - `code`: 1–500 chars of `[A-Za-z0-9_-]`
/// - `state`: exactly the 64 lowercase-hex format the initiator issues
/// - `error`: 1–64 chars of `[a-z_]`
/// - `error_description`: at most 256 chars (logged only, never echoed)
pub fn validate_callback(params: &CallbackParams) -> Result<ValidCallback, ValidationError> {
    // Provider-reported error takes the alternate path; code/state are
    // ignored when present alongside it
    if let Some(error) = &params.error {
        if error.is_empty()
            || error.len() > ERROR_CODE_MAX_LEN
            || !error.chars().all(|c| c.is_ascii_lowercase() || c == '_')
        {
            return Err(ValidationError::InvalidErrorCode);
        }
        if let Some(description) = &params.error_description {
            if description.len() > ERROR_DESCRIPTION_MAX_LEN {
                return Err(ValidationError::InvalidErrorDescription);
            }
        }
        return Ok(ValidCallback::Denied {
            error: error.clone(),
        });
    }

    let (Some(code), Some(state)) = (&params.code, &params.state) else {
        return Err(ValidationError::MissingParams);
    };

    if code.is_empty() || code.len() > CODE_MAX_LEN || !code.chars().all(is_code_char) {
        return Err(ValidationError::InvalidCode);
    }

    if state.len() != STATE_LEN
        || !state
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
    {
        return Err(ValidationError::InvalidState);
    }

    Ok(ValidCallback::Grant {
        code: code.clone(),
        state: state.clone(),
    })
}

fn is_code_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

/// Truncate a rejected value for server-side logging.
pub fn truncate_for_log(value: &str, max: usize) -> &str {
    match value.char_indices().nth(max) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}

/// Short prefix of a state token for logs; never the full value.
pub fn redact_state(state: &str) -> &str {
    truncate_for_log(state, 8)
}
