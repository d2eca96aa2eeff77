use serde::{Deserialize, Serialize};

/// Message priority (smaller values are claimed first)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub u8);

// Claim order: records.min_by_key(|r| (r.priority, r.queue_id))
// - Lower value first: HIGHEST (0) < HIGH < NORMAL < LOW < LOWEST (255)
// - Within same priority: lower queue id first (insertion order)

impl Priority {
    pub const HIGHEST: Priority = Priority(0);
    pub const HIGH: Priority = Priority(64);
    pub const NORMAL: Priority = Priority(128);
    pub const LOW: Priority = Priority(192);
    pub const LOWEST: Priority = Priority(255);

    pub fn value(self) -> u8 {
        self.0
    }

    /// Get human-readable name for the named levels
    pub fn name(self) -> Option<&'static str> {
        match self.0 {
            0 => Some("highest"),
            64 => Some("high"),
            128 => Some("normal"),
            192 => Some("low"),
            255 => Some("lowest"),
            _ => None,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl From<u8> for Priority {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name}"),
            None => write!(f, "{}", self.0),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "highest" => Ok(Self::HIGHEST),
            "high" => Ok(Self::HIGH),
            "normal" => Ok(Self::NORMAL),
            "low" => Ok(Self::LOW),
            "lowest" => Ok(Self::LOWEST),
            other => other
                .parse::<u8>()
                .map(Self)
                .map_err(|_| format!("Invalid priority: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smaller_is_higher() {
        assert!(Priority::HIGHEST < Priority::NORMAL);
        assert!(Priority(1) < Priority(3));
        assert_eq!(Priority::default(), Priority(128));
    }

    #[test]
    fn parse_named_and_numeric() {
        assert_eq!("high".parse::<Priority>().unwrap(), Priority::HIGH);
        assert_eq!("7".parse::<Priority>().unwrap(), Priority(7));
        assert!("urgent".parse::<Priority>().is_err());
        assert_eq!(Priority(7).to_string(), "7");
        assert_eq!(Priority::LOW.to_string(), "low");
    }
}
