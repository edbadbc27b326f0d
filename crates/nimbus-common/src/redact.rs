//! Keeping secrets out of logs.
//!
//! Anything decrypted through the Secrets service lives in a [`Sensitive`]
//! value: it never prints its contents and is zeroized when dropped. Join
//! commands carry bootstrap tokens and certificate keys, so they are logged
//! only after [`mask_join_secrets`].

use std::fmt;
use std::ops::Deref;

use zeroize::Zeroizing;

/// Placeholder printed in place of secret values
pub const REDACTED: &str = "[REDACTED]";

/// Flags whose following argument is a secret
const SECRET_FLAGS: &[&str] = &[
    "--token",
    "--discovery-token-ca-cert-hash",
    "--certificate-key",
];

/// A decrypted secret. Prints as `[REDACTED]`, zeroized on drop.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Sensitive(Zeroizing<String>);

impl Sensitive {
    /// Wrap a plaintext value
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    /// Borrow the plaintext. Callers must not log the result.
    pub fn expose(&self) -> &str {
        self.0.as_str()
    }

    /// True when the wrapped value is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for Sensitive {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl Deref for Sensitive {
    type Target = str;

    fn deref(&self) -> &str {
        self.expose()
    }
}

impl fmt::Debug for Sensitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl fmt::Display for Sensitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

/// Mask token, CA hash and certificate-key arguments in a kubeadm join command.
///
/// Handles both `--flag value` and `--flag=value` forms.
pub fn mask_join_secrets(command: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut mask_next = false;

    for word in command.split_whitespace() {
        if mask_next {
            out.push(REDACTED.to_string());
            mask_next = false;
            continue;
        }
        if let Some((flag, _)) = word.split_once('=') {
            if SECRET_FLAGS.contains(&flag) {
                out.push(format!("{flag}={REDACTED}"));
                continue;
            }
        }
        if SECRET_FLAGS.contains(&word) {
            mask_next = true;
        }
        out.push(word.to_string());
    }

    out.join(" ")
}
