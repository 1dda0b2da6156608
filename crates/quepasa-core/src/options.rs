//! Tri-state option model.
//!
//! Options at rest (tenant, subscriber) hold only `UnSet | True | False`.
//! Service-wide defaults additionally carry `ForcedTrue | ForcedFalse`,
//! which override any tenant or subscriber value. `resolve` is the single
//! resolution function used by the dispatcher and the command toggles.

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// A boolean that may also be unset.
///
/// Wire format: serializes to `true`/`false`/`null`; parses from
/// `1|t|true|yes`, `-1|f|false|no` and `0|""|null`, case-insensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriState {
    #[default]
    UnSet,
    True,
    False,
}

impl TriState {
    /// Convert to a plain boolean, using `fallback` when unset.
    pub fn to_bool(self, fallback: bool) -> bool {
        match self {
            TriState::True => true,
            TriState::False => false,
            TriState::UnSet => fallback,
        }
    }

    pub fn is_set(self) -> bool {
        self != TriState::UnSet
    }

    /// Parse the extended boolean token set used in requests and env vars.
    pub fn parse(token: &str) -> Result<Self, String> {
        match token.trim().trim_matches('"').to_ascii_lowercase().as_str() {
            "1" | "t" | "true" | "yes" => Ok(TriState::True),
            "-1" | "f" | "false" | "no" => Ok(TriState::False),
            "" | "0" | "null" => Ok(TriState::UnSet),
            other => Err(format!("unknown boolean token: {{{other}}}")),
        }
    }
}

impl std::fmt::Display for TriState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TriState::True => "true",
            TriState::False => "false",
            TriState::UnSet => "unset",
        })
    }
}

impl Serialize for TriState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            TriState::True => serializer.serialize_bool(true),
            TriState::False => serializer.serialize_bool(false),
            TriState::UnSet => serializer.serialize_none(),
        }
    }
}

impl<'de> Deserialize<'de> for TriState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        let token = match value {
            serde_json::Value::Null => String::new(),
            serde_json::Value::Bool(b) => b.to_string(),
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::String(s) => s,
            other => return Err(de::Error::custom(format!("unexpected boolean: {other}"))),
        };
        TriState::parse(&token).map_err(de::Error::custom)
    }
}

/// A service-default boolean: the tri-state plus forced overrides.
///
/// Forced variants live only in the service defaults; they never appear on
/// a tenant or subscription at rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServiceBool {
    #[default]
    UnSet,
    True,
    False,
    ForcedTrue,
    ForcedFalse,
}

impl ServiceBool {
    pub fn is_forced(self) -> bool {
        matches!(self, ServiceBool::ForcedTrue | ServiceBool::ForcedFalse)
    }

    fn forced_value(self) -> Option<bool> {
        match self {
            ServiceBool::ForcedTrue => Some(true),
            ServiceBool::ForcedFalse => Some(false),
            _ => None,
        }
    }

    fn as_tristate(self) -> TriState {
        match self {
            ServiceBool::True | ServiceBool::ForcedTrue => TriState::True,
            ServiceBool::False | ServiceBool::ForcedFalse => TriState::False,
            ServiceBool::UnSet => TriState::UnSet,
        }
    }

    /// Parse env tokens, including the forced spellings.
    pub fn parse(token: &str) -> Result<Self, String> {
        match token.trim().to_ascii_lowercase().as_str() {
            "2" | "forcedtrue" => Ok(ServiceBool::ForcedTrue),
            "-2" | "forcedfalse" => Ok(ServiceBool::ForcedFalse),
            other => Ok(match TriState::parse(other)? {
                TriState::True => ServiceBool::True,
                TriState::False => ServiceBool::False,
                TriState::UnSet => ServiceBool::UnSet,
            }),
        }
    }
}

impl std::fmt::Display for ServiceBool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceBool::ForcedTrue => f.write_str("forcedtrue"),
            ServiceBool::ForcedFalse => f.write_str("forcedfalse"),
            other => other.as_tristate().fmt(f),
        }
    }
}

/// Resolve one effective option.
///
/// Forced service defaults win; otherwise the most specific set value:
/// subscriber, then tenant, then the service default, then `fallback`.
pub fn resolve(
    service: ServiceBool,
    tenant: TriState,
    subscriber: TriState,
    fallback: bool,
) -> bool {
    if let Some(forced) = service.forced_value() {
        return forced;
    }
    if subscriber.is_set() {
        return subscriber.to_bool(fallback);
    }
    if tenant.is_set() {
        return tenant.to_bool(fallback);
    }
    service.as_tristate().to_bool(fallback)
}

/// The per-tenant / per-subscriber filter set.
///
/// At rest these never hold forced variants; the matching service-wide
/// defaults live in [`ServiceOptions`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhatsappOptions {
    #[serde(default)]
    pub groups: TriState,
    #[serde(default)]
    pub direct: TriState,
    #[serde(default)]
    pub broadcasts: TriState,
    #[serde(default, rename = "readreceipts")]
    pub read_receipts: TriState,
    #[serde(default)]
    pub calls: TriState,
    #[serde(default, rename = "readupdate")]
    pub read_update: TriState,
}

/// Service-wide option defaults, loaded once from the environment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceOptions {
    pub groups: ServiceBool,
    pub direct: ServiceBool,
    pub broadcasts: ServiceBool,
    pub read_receipts: ServiceBool,
    pub calls: ServiceBool,
    pub read_update: ServiceBool,
}

/// Effective values for one (service, tenant, subscriber) triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveOptions {
    pub groups: bool,
    pub direct: bool,
    pub broadcasts: bool,
    pub read_receipts: bool,
    pub calls: bool,
    pub read_update: bool,
}

impl ServiceOptions {
    /// Compute effective options for a tenant/subscriber pair.
    ///
    /// Unset everywhere resolves to: groups/direct/broadcasts/calls true,
    /// read receipts and read updates false.
    pub fn effective(
        &self,
        tenant: &WhatsappOptions,
        subscriber: &WhatsappOptions,
    ) -> EffectiveOptions {
        EffectiveOptions {
            groups: resolve(self.groups, tenant.groups, subscriber.groups, true),
            direct: resolve(self.direct, tenant.direct, subscriber.direct, true),
            broadcasts: resolve(
                self.broadcasts,
                tenant.broadcasts,
                subscriber.broadcasts,
                true,
            ),
            read_receipts: resolve(
                self.read_receipts,
                tenant.read_receipts,
                subscriber.read_receipts,
                false,
            ),
            calls: resolve(self.calls, tenant.calls, subscriber.calls, true),
            read_update: resolve(
                self.read_update,
                tenant.read_update,
                subscriber.read_update,
                false,
            ),
        }
    }
}
