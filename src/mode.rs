use std::fmt;

/// The recovery type chosen for this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoveryMode {
    /// Build the recovery partition and fast-reboot into it.
    Automatic,
    /// Hand over to the downstream partitioner.
    Interactive,
    /// Recovery partition already exists; fix flags and bootloader only.
    Factory,
    /// Hard-disk-only recovery; the user must acknowledge before continuing.
    Hdd,
    Unset,
}

impl RecoveryMode {
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "automatic" => RecoveryMode::Automatic,
            "interactive" => RecoveryMode::Interactive,
            "factory" => RecoveryMode::Factory,
            "hdd" => RecoveryMode::Hdd,
            _ => RecoveryMode::Unset,
        }
    }

    /// Value written to the answer store. `Unset` persists as empty.
    pub fn as_str(self) -> &'static str {
        match self {
            RecoveryMode::Automatic => "automatic",
            RecoveryMode::Interactive => "interactive",
            RecoveryMode::Factory => "factory",
            RecoveryMode::Hdd => "hdd",
            RecoveryMode::Unset => "",
        }
    }

    /// Unset and hdd need the user before anything can run.
    pub fn is_blocked(self) -> bool {
        matches!(self, RecoveryMode::Hdd | RecoveryMode::Unset)
    }
}

impl fmt::Display for RecoveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryMode::Unset => f.write_str("unset"),
            other => f.write_str(other.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::RecoveryMode;

    #[test]
    fn unknown_values_are_unset() {
        assert_eq!(RecoveryMode::parse("dvd"), RecoveryMode::Unset);
        assert_eq!(RecoveryMode::parse(""), RecoveryMode::Unset);
        assert_eq!(RecoveryMode::parse(" factory\n"), RecoveryMode::Factory);
    }

    #[test]
    fn only_selection_states_block() {
        assert!(RecoveryMode::Hdd.is_blocked());
        assert!(RecoveryMode::Unset.is_blocked());
        assert!(!RecoveryMode::Automatic.is_blocked());
        assert!(!RecoveryMode::Factory.is_blocked());
    }
}
