//! Roles and member identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use covalue_core::{AgentId, CoreError};

/// A member's role in a group.
///
/// Ordering: `admin > manager > writer > reader > revoked`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Manager,
    Writer,
    Reader,
    Revoked,
}

impl Role {
    /// Numeric rank used for ordering and for "maximum wins" inheritance.
    pub fn rank(self) -> u8 {
        match self {
            Role::Admin => 4,
            Role::Manager => 3,
            Role::Writer => 2,
            Role::Reader => 1,
            Role::Revoked => 0,
        }
    }

    pub fn can_read(self) -> bool {
        self.rank() >= Role::Reader.rank()
    }

    pub fn can_write(self) -> bool {
        self.rank() >= Role::Writer.rank()
    }

    /// May change members below admin and manage keys.
    pub fn can_manage(self) -> bool {
        self.rank() >= Role::Manager.rank()
    }

    pub fn can_admin(self) -> bool {
        self == Role::Admin
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Manager => "manager",
            Role::Writer => "writer",
            Role::Reader => "reader",
            Role::Revoked => "revoked",
        }
    }

    /// The higher of two optional roles.
    pub fn max_of(a: Option<Role>, b: Option<Role>) -> Option<Role> {
        match (a, b) {
            (Some(a), Some(b)) => Some(if a >= b { a } else { b }),
            (a, None) => a,
            (None, b) => b,
        }
    }
}

impl PartialOrd for Role {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Role {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "manager" => Ok(Role::Manager),
            "writer" => Ok(Role::Writer),
            "reader" => Ok(Role::Reader),
            "revoked" => Ok(Role::Revoked),
            other => Err(CoreError::MalformedChange(format!("unknown role: {other}"))),
        }
    }
}

/// A group member: a specific agent, or the synthetic `everyone`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MemberId {
    Agent(AgentId),
    Everyone,
}

impl MemberId {
    pub const EVERYONE: &'static str = "everyone";
}

impl From<AgentId> for MemberId {
    fn from(agent: AgentId) -> Self {
        MemberId::Agent(agent)
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberId::Agent(agent) => write!(f, "{agent}"),
            MemberId::Everyone => f.write_str(Self::EVERYONE),
        }
    }
}

impl FromStr for MemberId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == Self::EVERYONE {
            Ok(MemberId::Everyone)
        } else {
            s.parse().map(MemberId::Agent)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_ordering() {
        assert!(Role::Admin > Role::Manager);
        assert!(Role::Manager > Role::Writer);
        assert!(Role::Writer > Role::Reader);
        assert!(Role::Reader > Role::Revoked);
    }

    #[test]
    fn test_role_capabilities() {
        assert!(Role::Admin.can_admin());
        assert!(!Role::Manager.can_admin());
        assert!(Role::Manager.can_manage());
        assert!(!Role::Writer.can_manage());
        assert!(Role::Writer.can_write());
        assert!(!Role::Reader.can_write());
        assert!(Role::Reader.can_read());
        assert!(!Role::Revoked.can_read());
    }

    #[test]
    fn test_role_strings() {
        for role in [
            Role::Admin,
            Role::Manager,
            Role::Writer,
            Role::Reader,
            Role::Revoked,
        ] {
            assert_eq!(role.to_string().parse::<Role>().unwrap(), role);
            assert_eq!(
                serde_json::to_value(role).unwrap(),
                serde_json::Value::String(role.to_string())
            );
        }
        assert!("owner".parse::<Role>().is_err());
    }

    #[test]
    fn test_max_of() {
        assert_eq!(Role::max_of(None, None), None);
        assert_eq!(Role::max_of(Some(Role::Reader), None), Some(Role::Reader));
        assert_eq!(
            Role::max_of(Some(Role::Reader), Some(Role::Admin)),
            Some(Role::Admin)
        );
        assert_eq!(
            Role::max_of(Some(Role::Revoked), None),
            Some(Role::Revoked)
        );
    }

    #[test]
    fn test_member_id() {
        assert_eq!("everyone".parse::<MemberId>().unwrap(), MemberId::Everyone);
        assert!("someone".parse::<MemberId>().is_err());
    }
}
