//! Fixed-width identifiers shared by every GCS table.
//!
//! All identifiers are 160-bit opaque handles. The nil identifier (all
//! zero bytes) means "unset" or, as a subscription filter, "every key".

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Width of every identifier in bytes.
pub const ID_SIZE: usize = 20;

/// Errors produced when building an identifier from external bytes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdError {
    #[error("invalid identifier length: expected {ID_SIZE} bytes, got {0}")]
    InvalidLength(usize),

    #[error("invalid identifier hex: {0}")]
    InvalidHex(String),
}

/// Common surface of all identifier types, used as the key bound of
/// generic tables.
pub trait Id:
    Copy + Eq + Ord + std::hash::Hash + fmt::Debug + fmt::Display + Send + Sync + 'static
{
    fn from_binary(bytes: &[u8]) -> Result<Self, IdError>;
    fn as_bytes(&self) -> &[u8; ID_SIZE];
    fn nil() -> Self;

    fn is_nil(&self) -> bool {
        self.as_bytes().iter().all(|b| *b == 0)
    }

    fn hex(&self) -> String {
        hex::encode(self.as_bytes())
    }

    fn from_hex(s: &str) -> Result<Self, IdError> {
        let bytes = hex::decode(s).map_err(|e| IdError::InvalidHex(e.to_string()))?;
        Self::from_binary(&bytes)
    }
}

fn random_bytes() -> [u8; ID_SIZE] {
    let mut bytes = [0u8; ID_SIZE];
    // Only fails on platforms without an entropy source.
    if let Err(e) = getrandom::getrandom(&mut bytes) {
        panic!("no entropy source available for identifier generation: {e}");
    }
    bytes
}

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name([u8; ID_SIZE]);

        impl $name {
            /// Generate a new identifier that is unique with high probability.
            pub fn from_random() -> Self {
                Self(random_bytes())
            }

            /// Build an identifier from exactly [`ID_SIZE`] bytes.
            pub fn from_binary(bytes: &[u8]) -> Result<Self, IdError> {
                let raw: [u8; ID_SIZE] = bytes
                    .try_into()
                    .map_err(|_| IdError::InvalidLength(bytes.len()))?;
                Ok(Self(raw))
            }

            /// Parse the hex projection produced by [`Self::hex`].
            pub fn from_hex(s: &str) -> Result<Self, IdError> {
                let bytes = hex::decode(s).map_err(|e| IdError::InvalidHex(e.to_string()))?;
                Self::from_binary(&bytes)
            }

            /// The all-zero sentinel.
            pub const fn nil() -> Self {
                Self([0u8; ID_SIZE])
            }

            pub fn is_nil(&self) -> bool {
                self.0.iter().all(|b| *b == 0)
            }

            pub fn binary(&self) -> Vec<u8> {
                self.0.to_vec()
            }

            pub fn hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl Id for $name {
            fn from_binary(bytes: &[u8]) -> Result<Self, IdError> {
                $name::from_binary(bytes)
            }

            fn as_bytes(&self) -> &[u8; ID_SIZE] {
                &self.0
            }

            fn nil() -> Self {
                $name::nil()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.hex())
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_hex(s)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Self::from_hex(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

define_id!(
    /// Untyped identifier; every typed identifier converts to and from it.
    UniqueId
);
define_id!(
    /// Identifies a job, the usual scope of object and task records.
    JobId
);
define_id!(
    /// Identifies an object whose locations are tracked in the object table.
    ObjectId
);
define_id!(
    /// Identifies a cluster member (scheduler, worker or driver process).
    ClientId
);
define_id!(TaskId);
define_id!(DriverId);

macro_rules! unique_conversions {
    ($($name:ident),*) => {
        $(
            impl From<$name> for UniqueId {
                fn from(id: $name) -> Self {
                    UniqueId(id.0)
                }
            }

            impl From<UniqueId> for $name {
                fn from(id: UniqueId) -> Self {
                    $name(id.0)
                }
            }
        )*
    };
}

unique_conversions!(JobId, ObjectId, ClientId, TaskId, DriverId);
