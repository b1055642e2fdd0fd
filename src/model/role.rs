use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, EnumString};
use utoipa::ToSchema;

#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize, ToSchema, EnumString, AsRefStr,
    strum_macros::Display,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum Role {
    Employee = 1,
    Manager = 2,
    Hr = 3,
}

impl Role {
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(Role::Employee),
            2 => Some(Role::Manager),
            3 => Some(Role::Hr),
            _ => None,
        }
    }

    pub fn id(self) -> u8 {
        self as u8
    }

    /// Managers and HR may act on other people's leaves.
    pub fn can_manage(self) -> bool {
        matches!(self, Role::Manager | Role::Hr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn ids_round_trip() {
        for role in [Role::Employee, Role::Manager, Role::Hr] {
            assert_eq!(Role::from_id(role.id()), Some(role));
        }
        assert_eq!(Role::from_id(0), None);
        assert_eq!(Role::from_id(4), None);
    }

    #[test]
    fn names_are_upper_case() {
        assert_eq!(Role::Hr.to_string(), "HR");
        assert_eq!(Role::from_str("manager").unwrap(), Role::Manager);
        assert_eq!(serde_json::to_string(&Role::Employee).unwrap(), "\"EMPLOYEE\"");
    }
}
