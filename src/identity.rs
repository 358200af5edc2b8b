//! # Node Identity
//!
//! Every mesh participant is addressed by a [`NodeName`]: an immutable,
//! validated string (usually the host name). Names are the only addressing
//! unit above the transport layer; socket addresses never leak into routing.
//!
//! ## Validation Rules
//!
//! - Non-empty and at most [`MAX_NAME_LEN`] bytes
//! - No whitespace or control characters
//! - None of `,` `[` `]`, which are reserved by recipient expressions
//!
//! Names arriving over the wire go through the same validation via
//! `#[serde(try_from = "String")]`, so a peer cannot inject a name the
//! resolver would be unable to address.

use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::MeshError;

/// Maximum length of a node name in bytes (DNS host name limit).
pub const MAX_NAME_LEN: usize = 255;

/// Characters reserved by the recipient expression grammar.
const RESERVED_CHARS: [char; 3] = [',', '[', ']'];

/// Name of a mesh node. Cheap to clone.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeName(Arc<str>);

impl NodeName {
    /// Validate and wrap a name.
    pub fn new(name: impl AsRef<str>) -> Result<Self, MeshError> {
        let name = name.as_ref();
        validate(name)?;
        Ok(Self(Arc::from(name)))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn validate(name: &str) -> Result<(), MeshError> {
    if name.is_empty() {
        return Err(MeshError::InvalidName("empty name".to_string()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(MeshError::InvalidName(format!(
            "name exceeds {} bytes",
            MAX_NAME_LEN
        )));
    }
    if let Some(c) = name
        .chars()
        .find(|c| c.is_whitespace() || c.is_control() || RESERVED_CHARS.contains(c))
    {
        return Err(MeshError::InvalidName(format!(
            "{:?} contains invalid character {:?}",
            name, c
        )));
    }
    Ok(())
}

impl FromStr for NodeName {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for NodeName {
    type Error = MeshError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<NodeName> for String {
    fn from(name: NodeName) -> Self {
        name.0.to_string()
    }
}

impl Deref for NodeName {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for NodeName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for NodeName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for NodeName {
    fn eq(&self, other: &str) -> bool {
        &*self.0 == other
    }
}

impl PartialEq<&str> for NodeName {
    fn eq(&self, other: &&str) -> bool {
        &*self.0 == *other
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &*self.0)
    }
}
