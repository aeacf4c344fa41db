//! Prefixed base58 encoding.
//!
//! Every piece of key or identifier material travels as `<prefix>_z<base58>`.
//! The prefix names the semantic role of the payload, so a sealer key can
//! never be mistaken for a signer key, and decoding checks it exactly.

use crate::error::CoreError;

/// Encode bytes as `<prefix>_z<base58>`.
pub fn encode_prefixed(prefix: &str, bytes: &[u8]) -> String {
    format!("{}_z{}", prefix, bs58::encode(bytes).into_string())
}

/// Decode a `<prefix>_z<base58>` string, checking the prefix.
pub fn decode_prefixed(prefix: &'static str, s: &str) -> Result<Vec<u8>, CoreError> {
    let payload = s
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix("_z"))
        .ok_or(CoreError::MissingPrefix { expected: prefix })?;

    bs58::decode(payload)
        .into_vec()
        .map_err(|e| CoreError::InvalidBase58 {
            prefix,
            reason: e.to_string(),
        })
}

/// Decode a prefixed string into a fixed-size array.
pub fn decode_prefixed_array<const N: usize>(
    prefix: &'static str,
    s: &str,
) -> Result<[u8; N], CoreError> {
    let bytes = decode_prefixed(prefix, s)?;
    let got = bytes.len();
    bytes.try_into().map_err(|_| CoreError::InvalidLength {
        prefix,
        expected: N,
        got,
    })
}

/// Define a fixed-size byte newtype that encodes as a prefixed base58 string.
///
/// Public material gets a `Debug` showing the encoded form; secrets use the
/// `secret` variant whose `Debug` is redacted.
macro_rules! prefixed_bytes {
    ($(#[$meta:meta])* $name:ident, $prefix:literal, $len:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub [u8; $len]);

        prefixed_bytes!(@common $name, $prefix, $len);

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self)
            }
        }
    };
    (secret $(#[$meta:meta])* $name:ident, $prefix:literal, $len:literal) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq)]
        pub struct $name(pub(crate) [u8; $len]);

        prefixed_bytes!(@common $name, $prefix, $len);

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!(stringify!($name), "(redacted)"))
            }
        }
    };
    (@common $name:ident, $prefix:literal, $len:literal) => {
        impl $name {
            /// The string prefix for this kind of material.
            pub const PREFIX: &'static str = $prefix;

            /// Create from raw bytes.
            pub const fn from_bytes(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            /// Get the raw bytes.
            pub const fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&$crate::encoding::encode_prefixed($prefix, &self.0))
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::error::CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $crate::encoding::decode_prefixed_array::<$len>($prefix, s).map(Self)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

/// Define a variable-length byte newtype that encodes as a prefixed base58 string.
macro_rules! prefixed_blob {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Hash)]
        pub struct $name(pub Vec<u8>);

        impl $name {
            /// The string prefix for this kind of material.
            pub const PREFIX: &'static str = $prefix;

            /// Get the raw bytes.
            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&$crate::encoding::encode_prefixed($prefix, &self.0))
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!(stringify!($name), "({} bytes)"), self.0.len())
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::error::CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $crate::encoding::decode_prefixed($prefix, s).map(Self)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

pub(crate) use prefixed_blob;
pub(crate) use prefixed_bytes;
