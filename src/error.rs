use std::fmt;

/// Errors surfaced by the decision core (config resolution, algorithm
/// strategies, the shared store). Boundary-layer concerns (bad JSON, missing
/// fields) are mapped to HTTP status codes before they ever reach this type.
#[derive(Debug)]
pub enum DecisionError {
    /// The caller-supplied key, token count, or saved config violates an
    /// invariant (non-positive tokens, blank key, bad algorithm name, ...).
    InvalidInput(String),
    /// A config hash read back from the store could not be decoded.
    ConfigDecode(String),
    /// The shared store could not be reached within the command timeout.
    StoreUnavailable(String),
    /// The shared store executed the script but returned something the
    /// strategy did not expect.
    StoreScript(String),
    /// An invariant that should be impossible after valid startup was
    /// violated (e.g. no strategy registered for an algorithm tag).
    Internal(String),
}

impl fmt::Display for DecisionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecisionError::InvalidInput(msg) => write!(f, "invalid input: {}", msg),
            DecisionError::ConfigDecode(msg) => write!(f, "config decode error: {}", msg),
            DecisionError::StoreUnavailable(msg) => write!(f, "store unavailable: {}", msg),
            DecisionError::StoreScript(msg) => write!(f, "store script error: {}", msg),
            DecisionError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for DecisionError {}

impl DecisionError {
    /// Whether this failure should be governed by the fail-open/fail-closed
    /// policy, as opposed to being rejected outright at the boundary.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            DecisionError::StoreUnavailable(_) | DecisionError::StoreScript(_)
        )
    }

    pub fn metric_kind(&self) -> &'static str {
        match self {
            DecisionError::StoreUnavailable(_) => "unavailable",
            DecisionError::StoreScript(_) => "script_error",
            _ => "other",
        }
    }
}
