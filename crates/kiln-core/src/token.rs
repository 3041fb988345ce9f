//! Opaque identifiers exchanged between callers, the host, and workers.
//!
//! Two token kinds exist with identical wire shape:
//!
//! - [`CodeToken`]: names a loaded UDF. Produced by the dispatcher at load
//!   time and carried on every subsequent execute/delete.
//! - [`ExecutionToken`]: names one admitted execute request (and, on the
//!   runner side, one spawned worker). Used for cancellation.
//!
//! Both are the 36-character ASCII text form of a UUID v4. Workers present
//! them raw (unframed) on the rendezvous socket, so the length is a wire
//! constant and never changes.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wire length of a token in bytes.
///
/// Workers write exactly this many bytes per token during the rendezvous
/// hello, with no framing, so the host can read a fixed-size buffer.
pub const TOKEN_LEN: usize = 36;

/// Error returned when raw bytes do not form a valid token.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    /// Token had the wrong length.
    #[error("token must be {TOKEN_LEN} bytes, got {0}")]
    Length(usize),

    /// Token contained non-ASCII or non-UUID characters.
    #[error("token is not a hyphenated UUID")]
    Malformed,
}

macro_rules! token_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Generates a fresh random token.
            #[must_use]
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Parses a token from its raw wire bytes.
            ///
            /// # Errors
            ///
            /// Returns [`TokenError`] if the slice is not exactly
            /// [`TOKEN_LEN`] bytes of hyphenated-UUID text.
            pub fn from_wire(bytes: &[u8]) -> Result<Self, TokenError> {
                if bytes.len() != TOKEN_LEN {
                    return Err(TokenError::Length(bytes.len()));
                }
                let text = std::str::from_utf8(bytes).map_err(|_| TokenError::Malformed)?;
                Uuid::parse_str(text).map_err(|_| TokenError::Malformed)?;
                Ok(Self(text.to_owned()))
            }

            /// Parses a token from caller-supplied text.
            ///
            /// # Errors
            ///
            /// Returns [`TokenError`] on length or format mismatch.
            pub fn parse(text: &str) -> Result<Self, TokenError> {
                Self::from_wire(text.as_bytes())
            }

            /// Returns the token text.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Returns the raw wire bytes.
            #[must_use]
            pub fn as_bytes(&self) -> &[u8] {
                self.0.as_bytes()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

token_type! {
    /// Opaque identifier for a loaded UDF.
    CodeToken
}

token_type! {
    /// Opaque identifier for one admitted execute request, or for one
    /// spawned worker on the runner side.
    ExecutionToken
}
