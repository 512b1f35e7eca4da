//! Field context used for key derivation and domain separation.

use std::fmt;

use crate::namespace::Namespace;

/// Identifies an encrypted field: the collection it lives in and its path.
///
/// The context feeds both HKDF (`info`) and the AEAD associated data, so a
/// ciphertext copied from one field or collection into another fails to
/// decrypt.
///
/// # Example
///
/// ```
/// use qevault::context::FieldContext;
/// use qevault::namespace::Namespace;
///
/// let ns = Namespace::new("users", "memories").unwrap();
/// let ctx = FieldContext::new(ns, "email");
/// assert_eq!(ctx.to_string(), "users.memories|email");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldContext {
    namespace: Namespace,
    path: String,
}

impl FieldContext {
    /// Creates a new field context.
    #[must_use]
    pub fn new(namespace: Namespace, path: impl Into<String>) -> Self {
        Self { namespace, path: path.into() }
    }

    /// Returns the collection namespace.
    #[must_use]
    pub const fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Returns the dotted field path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// HKDF `info` string for the given cipher mode label.
    pub(crate) fn derivation_info(&self, mode: &str) -> String {
        format!("{mode}|{self}")
    }
}

impl fmt::Display for FieldContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.namespace, self.path)
    }
}
