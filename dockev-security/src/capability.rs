use serde::Deserialize;
use serde::Serialize;
use strum_macros::AsRefStr;
use strum_macros::Display;
use strum_macros::EnumIter;
use strum_macros::EnumString;

/// Sensitive action classes a plugin can ask the operator for.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Capability {
    InstallPackages,
    ReadLogs,
    ExecuteCommands,
    AccessNetwork,
    ModifyFiles,
}

impl Capability {
    /// Operator-facing description used in prompts.
    pub fn description(self) -> &'static str {
        match self {
            Self::InstallPackages => "Install system and language packages",
            Self::ReadLogs => "Read system and application logs",
            Self::ExecuteCommands => "Execute shell commands",
            Self::AccessNetwork => "Download models and packages over the network",
            Self::ModifyFiles => "Create and modify configuration files",
        }
    }
}

/// Recorded state of one (plugin, capability) pair in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum GrantState {
    #[default]
    Unrequested,
    Pending,
    Granted,
    Denied,
}

impl GrantState {
    /// Granted and denied are the only states that survive a restart.
    pub fn is_final(self) -> bool {
        matches!(self, Self::Granted | Self::Denied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn test_capability_names_round_trip() {
        for cap in Capability::iter() {
            let parsed = Capability::from_str(cap.as_ref()).unwrap();
            assert_eq!(parsed, cap);
        }
        assert_eq!(Capability::ExecuteCommands.to_string(), "execute_commands");
    }

    #[test]
    fn test_unknown_capability_rejected() {
        assert!(Capability::from_str("launch_missiles").is_err());
    }

    #[test]
    fn test_capability_serialization() {
        let json = serde_json::to_string(&Capability::AccessNetwork).unwrap();
        assert_eq!(json, "\"access_network\"");

        let parsed: Capability = serde_json::from_str("\"modify_files\"").unwrap();
        assert_eq!(parsed, Capability::ModifyFiles);
    }

    #[test]
    fn test_grant_state_default_and_finality() {
        assert_eq!(GrantState::default(), GrantState::Unrequested);
        assert!(GrantState::Granted.is_final());
        assert!(GrantState::Denied.is_final());
        assert!(!GrantState::Pending.is_final());
        assert!(!GrantState::Unrequested.is_final());
    }

    #[test]
    fn test_descriptions_non_empty() {
        for cap in Capability::iter() {
            assert!(!cap.description().is_empty());
        }
    }
}
