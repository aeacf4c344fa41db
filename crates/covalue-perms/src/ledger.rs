//! Group ledger keys.
//!
//! A group's content is a map. Its keys encode what each entry means:
//!
//! | key | value |
//! |---|---|
//! | `<memberId>` | role |
//! | `readKey` | current `key_z…` |
//! | `<keyId>_for_<agentId>` | `sealed_z…` key sealed for that agent |
//! | `<keyId>_for_everyone` | `keySecret_z…` in the clear |
//! | `<keyId>_for_<otherKeyId>` | `encrypted_z…` key encrypted under another key |
//! | `parent_<groupId>` | `"extend"` |

use std::fmt;
use std::str::FromStr;

use covalue_core::{AgentId, CoId, CoreError, KeyId};

use crate::role::MemberId;

/// Ledger key for the current read key id.
pub const READ_KEY: &str = "readKey";

/// Value of a parent extension entry.
pub const EXTEND: &str = "extend";

const FOR: &str = "_for_";
const PARENT: &str = "parent_";

/// A parsed group ledger key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LedgerKey {
    Member(MemberId),
    ReadKey,
    KeyFor { key: KeyId, recipient: AgentId },
    KeyForEveryone(KeyId),
    KeyForKey { key: KeyId, encrypting: KeyId },
    Parent(CoId),
}

impl LedgerKey {
    /// Entries that hold key material or point at it.
    pub fn is_key_entry(&self) -> bool {
        matches!(
            self,
            LedgerKey::ReadKey
                | LedgerKey::KeyFor { .. }
                | LedgerKey::KeyForEveryone(_)
                | LedgerKey::KeyForKey { .. }
        )
    }
}

impl fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerKey::Member(member) => write!(f, "{member}"),
            LedgerKey::ReadKey => f.write_str(READ_KEY),
            LedgerKey::KeyFor { key, recipient } => write!(f, "{key}{FOR}{recipient}"),
            LedgerKey::KeyForEveryone(key) => write!(f, "{key}{FOR}{}", MemberId::EVERYONE),
            LedgerKey::KeyForKey { key, encrypting } => write!(f, "{key}{FOR}{encrypting}"),
            LedgerKey::Parent(group) => write!(f, "{PARENT}{group}"),
        }
    }
}

impl FromStr for LedgerKey {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == READ_KEY {
            return Ok(LedgerKey::ReadKey);
        }
        if let Some(group) = s.strip_prefix(PARENT) {
            return Ok(LedgerKey::Parent(group.parse()?));
        }
        if let Some((key, target)) = s.split_once(FOR) {
            let key: KeyId = key.parse()?;
            return Ok(if target == MemberId::EVERYONE {
                LedgerKey::KeyForEveryone(key)
            } else if target.starts_with(KeyId::PREFIX) && !target.contains('/') {
                LedgerKey::KeyForKey {
                    key,
                    encrypting: target.parse()?,
                }
            } else {
                LedgerKey::KeyFor {
                    key,
                    recipient: target.parse()?,
                }
            });
        }
        s.parse().map(LedgerKey::Member)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use covalue_core::{CryptoProvider, DalekCrypto};

    #[test]
    fn test_ledger_key_roundtrip() {
        let crypto = DalekCrypto::new();
        let agent = crypto.agent_id(&crypto.new_agent_secret());
        let key = crypto.key_id(&crypto.new_key_secret());
        let other = crypto.key_id(&crypto.new_key_secret());

        for entry in [
            LedgerKey::Member(MemberId::Agent(agent)),
            LedgerKey::Member(MemberId::Everyone),
            LedgerKey::ReadKey,
            LedgerKey::KeyFor {
                key,
                recipient: agent,
            },
            LedgerKey::KeyForEveryone(key),
            LedgerKey::KeyForKey {
                key,
                encrypting: other,
            },
            LedgerKey::Parent(CoId([5; 32])),
        ] {
            let encoded = entry.to_string();
            assert_eq!(encoded.parse::<LedgerKey>().unwrap(), entry, "{encoded}");
        }
    }

    #[test]
    fn test_ledger_key_shapes() {
        let crypto = DalekCrypto::new();
        let key = crypto.key_id(&crypto.new_key_secret());
        assert_eq!(
            LedgerKey::KeyForEveryone(key).to_string(),
            format!("{key}_for_everyone")
        );
        assert!(LedgerKey::Parent(CoId([5; 32]))
            .to_string()
            .starts_with("parent_co_z"));
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!("title".parse::<LedgerKey>().is_err());
        assert!("key_zzz_for_everyone".parse::<LedgerKey>().is_err());
        assert!("parent_nothing".parse::<LedgerKey>().is_err());
    }
}
