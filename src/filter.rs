//! Address filters: a closed set of named predicates over an IP address,
//! each optionally negated with a leading `!`, combined with short-circuit
//! AND semantics. Names follow the `Is*` predicates of an IP address so that
//! existing hook configurations keep working (`Is4`, `IsLoopback`, ...).

use std::net::IpAddr;
use std::str::FromStr;

use crate::types::{Result, WatchError};

/// The closed set of recognized filter predicates. Unknown names are
/// rejected at configuration time; evaluation never re-validates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    Is4,
    Is4In6,
    Is6,
    IsGlobalUnicast,
    IsInterfaceLocalMulticast,
    IsLinkLocalMulticast,
    IsLinkLocalUnicast,
    IsLoopback,
    IsMulticast,
    IsPrivate,
    IsUnspecified,
    IsValid,
}

impl FromStr for Filter {
    type Err = WatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Is4" => Ok(Self::Is4),
            "Is4In6" => Ok(Self::Is4In6),
            "Is6" => Ok(Self::Is6),
            "IsGlobalUnicast" => Ok(Self::IsGlobalUnicast),
            "IsInterfaceLocalMulticast" => Ok(Self::IsInterfaceLocalMulticast),
            "IsLinkLocalMulticast" => Ok(Self::IsLinkLocalMulticast),
            "IsLinkLocalUnicast" => Ok(Self::IsLinkLocalUnicast),
            "IsLoopback" => Ok(Self::IsLoopback),
            "IsMulticast" => Ok(Self::IsMulticast),
            "IsPrivate" => Ok(Self::IsPrivate),
            "IsUnspecified" => Ok(Self::IsUnspecified),
            "IsValid" => Ok(Self::IsValid),
            other => Err(WatchError::Config(format!("unknown filter: {}", other))),
        }
    }
}

impl Filter {
    fn eval(self, addr: IpAddr) -> bool {
        match self {
            Self::Is4 => addr.is_ipv4(),
            Self::Is4In6 => match addr {
                IpAddr::V4(_) => false,
                IpAddr::V6(v6) => v6.to_ipv4_mapped().is_some(),
            },
            Self::Is6 => addr.is_ipv6(),
            Self::IsGlobalUnicast => is_global_unicast(addr),
            Self::IsInterfaceLocalMulticast => match addr {
                IpAddr::V4(_) => false,
                // ff01::/16 modulo multicast flags
                IpAddr::V6(v6) => v6.is_multicast() && (v6.segments()[0] & 0xff0f) == 0xff01,
            },
            Self::IsLinkLocalMulticast => match addr {
                IpAddr::V4(v4) => {
                    // 224.0.0.0/24
                    let o = v4.octets();
                    o[0] == 224 && o[1] == 0 && o[2] == 0
                }
                IpAddr::V6(v6) => v6.is_multicast() && (v6.segments()[0] & 0xff0f) == 0xff02,
            },
            Self::IsLinkLocalUnicast => match addr {
                IpAddr::V4(v4) => v4.is_link_local(),
                // fe80::/10
                IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
            },
            Self::IsLoopback => addr.is_loopback(),
            Self::IsMulticast => addr.is_multicast(),
            Self::IsPrivate => match addr {
                IpAddr::V4(v4) => v4.is_private(),
                // fc00::/7 (unique local)
                IpAddr::V6(v6) => (v6.segments()[0] & 0xfe00) == 0xfc00,
            },
            Self::IsUnspecified => addr.is_unspecified(),
            // A parsed IpAddr is always a well-formed 4- or 16-byte address.
            Self::IsValid => true,
        }
    }
}

fn is_global_unicast(addr: IpAddr) -> bool {
    let broadcast = matches!(addr, IpAddr::V4(v4) if v4.is_broadcast());
    let link_local_unicast = Filter::IsLinkLocalUnicast.eval(addr);
    !(broadcast
        || addr.is_unspecified()
        || addr.is_loopback()
        || addr.is_multicast()
        || link_local_unicast)
}

/// One configured filter: a predicate plus an optional negation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterExpr {
    pub negated: bool,
    pub filter: Filter,
}

impl FromStr for FilterExpr {
    type Err = WatchError;

    fn from_str(s: &str) -> Result<Self> {
        let (negated, name) = match s.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        Ok(Self {
            negated,
            filter: name.parse()?,
        })
    }
}

impl FilterExpr {
    pub fn matches(&self, addr: IpAddr) -> bool {
        let result = self.filter.eval(addr);
        if self.negated {
            !result
        } else {
            result
        }
    }
}

/// Validates and parses a list of filter strings. Called once at
/// configuration time; the watch loop only ever sees parsed expressions.
pub fn parse_filters(filters: &[String]) -> Result<Vec<FilterExpr>> {
    filters.iter().map(|f| f.parse()).collect()
}

/// Returns true iff every filter passes for `addr`. An empty set passes.
pub fn passes(addr: IpAddr, filters: &[FilterExpr]) -> bool {
    filters.iter().all(|f| f.matches(addr))
}
