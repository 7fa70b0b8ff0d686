// =============================================================================
// Shared types used across the Meridian control plane
// =============================================================================

use serde::{Deserialize, Serialize};

/// Traffic color in the blue/green rollout. `Blue` is the default active
/// variant; `Green` is the canary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    Blue,
    Green,
}

impl Default for Color {
    fn default() -> Self {
        Self::Blue
    }
}

impl Color {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blue => "blue",
            Self::Green => "green",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "blue" => Some(Self::Blue),
            "green" => Some(Self::Green),
            _ => None,
        }
    }

    /// The other color.
    pub fn other(&self) -> Self {
        match self {
            Self::Blue => Self::Green,
            Self::Green => Self::Blue,
        }
    }
}

impl std::fmt::Display for Color {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order operation as seen by the circuit breaker and throttle guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderOp {
    Create,
    Amend,
    Cancel,
}

impl OrderOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Amend => "amend",
            Self::Cancel => "cancel",
        }
    }

    pub const ALL: [OrderOp; 3] = [OrderOp::Create, OrderOp::Amend, OrderOp::Cancel];
}

impl std::fmt::Display for OrderOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exchange environment the bot runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    Testnet,
    Mainnet,
    Paper,
}

impl Default for Profile {
    fn default() -> Self {
        Self::Testnet
    }
}

impl std::fmt::Display for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Testnet => write!(f, "testnet"),
            Self::Mainnet => write!(f, "mainnet"),
            Self::Paper => write!(f, "paper"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_parse_roundtrip() {
        assert_eq!(Color::parse("blue"), Some(Color::Blue));
        assert_eq!(Color::parse("green"), Some(Color::Green));
        assert_eq!(Color::parse("red"), None);
        assert_eq!(Color::Blue.other(), Color::Green);
        assert_eq!(Color::Green.to_string(), "green");
    }

    #[test]
    fn order_op_labels() {
        assert_eq!(OrderOp::Create.as_str(), "create");
        assert_eq!(OrderOp::ALL.len(), 3);
    }
}
