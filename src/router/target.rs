use std::fmt;

/// Where a statement may be sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RouteTarget {
    Master = 1,
    Slave = 1 << 1,
    /// The server named by a routing hint
    NamedServer = 1 << 2,
    /// Every attached backend
    All = 1 << 3,
    /// Slave selection under a hinted replication-lag limit
    RlagMax = 1 << 4,
}

impl RouteTarget {
    pub fn as_str(self) -> &'static str {
        match self {
            RouteTarget::Master => "master",
            RouteTarget::Slave => "slave",
            RouteTarget::NamedServer => "named_server",
            RouteTarget::All => "all",
            RouteTarget::RlagMax => "rlag_max",
        }
    }
}

/// Set of `RouteTarget`s
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RouteTargets(u8);

impl RouteTargets {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn only(target: RouteTarget) -> Self {
        Self(target as u8)
    }

    pub fn with(self, target: RouteTarget) -> Self {
        Self(self.0 | target as u8)
    }

    pub fn contains(self, target: RouteTarget) -> bool {
        self.0 & target as u8 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl From<RouteTarget> for RouteTargets {
    fn from(target: RouteTarget) -> Self {
        Self::only(target)
    }
}

impl fmt::Display for RouteTargets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [
            RouteTarget::Master,
            RouteTarget::Slave,
            RouteTarget::NamedServer,
            RouteTarget::All,
            RouteTarget::RlagMax,
        ]
        .into_iter()
        .filter(|t| self.contains(*t))
        .map(RouteTarget::as_str)
        .collect();
        write!(f, "{}", names.join("|"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_membership() {
        let targets = RouteTargets::only(RouteTarget::NamedServer).with(RouteTarget::Slave);
        assert!(targets.contains(RouteTarget::Slave));
        assert!(targets.contains(RouteTarget::NamedServer));
        assert!(!targets.contains(RouteTarget::Master));
        assert!(RouteTargets::empty().is_empty());
        assert_eq!(targets.to_string(), "slave|named_server");
    }
}
