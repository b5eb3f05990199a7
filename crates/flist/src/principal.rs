//! File-owning principals.
//!
//! Users and groups travel the wire as (name, numeric id) pairs so the
//! receiving side can map ownership by name first and fall back to the id.
//! Identity is the pair; two users with the same id but different names are
//! distinct principals.

use crate::error::FlistError;

/// Longest principal name the wire format can carry.
pub const MAX_NAME_LEN: usize = 255;

/// Largest principal id the wire format can carry.
pub const MAX_ID: u32 = 65535;

/// Numeric id of the reserved `nobody` principals.
pub const NOBODY_ID: u32 = MAX_ID - 1;

macro_rules! principal {
    ($name:ident, $nobody:literal) => {
        /// An owning principal: name plus numeric id.
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub struct $name {
            name: String,
            id: u32,
        }

        impl $name {
            /// Builds a principal, validating the wire-format bounds.
            pub fn new(name: impl Into<String>, id: u32) -> Result<Self, FlistError> {
                let name = name.into();
                if name.is_empty() || name.len() > MAX_NAME_LEN {
                    return Err(FlistError::PrincipalName(name.len()));
                }
                if id > MAX_ID {
                    return Err(FlistError::PrincipalId(id));
                }
                Ok(Self { name, id })
            }

            /// The reserved root principal, id 0.
            #[must_use]
            pub fn root() -> Self {
                Self {
                    name: "root".to_string(),
                    id: 0,
                }
            }

            /// The reserved nobody principal.
            #[must_use]
            pub fn nobody() -> Self {
                Self {
                    name: $nobody.to_string(),
                    id: NOBODY_ID,
                }
            }

            /// Principal name.
            #[must_use]
            pub fn name(&self) -> &str {
                &self.name
            }

            /// Numeric id.
            #[must_use]
            pub const fn id(&self) -> u32 {
                self.id
            }
        }
    };
}

principal!(User, "nobody");
principal!(Group, "nobody");
