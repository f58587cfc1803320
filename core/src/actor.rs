use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// The entity a mitigation applies to. Requests carrying the same identity —
/// whether a client IP or an account id — escalate together.
///
/// The canonical string form (`ip:203.0.113.7`, `account:mallory`) is what
/// appears in API paths and persisted rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum ActorIdentity {
    #[schema(value_type = String)]
    Ip(IpAddr),
    Account(String),
}

impl ActorIdentity {
    pub fn kind(&self) -> &'static str {
        match self {
            ActorIdentity::Ip(_) => "ip",
            ActorIdentity::Account(_) => "account",
        }
    }
}

impl fmt::Display for ActorIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActorIdentity::Ip(addr) => write!(f, "ip:{addr}"),
            ActorIdentity::Account(id) => write!(f, "account:{id}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid actor identity '{0}', expected ip:<addr> or account:<id>")]
pub struct ParseActorError(String);

impl FromStr for ActorIdentity {
    type Err = ParseActorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.split_once(':') {
            Some(("ip", rest)) => rest
                .parse::<IpAddr>()
                .map(ActorIdentity::Ip)
                .map_err(|_| ParseActorError(value.to_string())),
            Some(("account", rest)) if !rest.is_empty() => {
                Ok(ActorIdentity::Account(rest.to_string()))
            }
            _ => Err(ParseActorError(value.to_string())),
        }
    }
}
