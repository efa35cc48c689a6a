//! Route definitions: the `(action_kind, params, allow_subdomains)` triple.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::Backend;

/// Backend selection algorithm for a `proxy` route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    Random,
    LeastConnections,
}

impl Default for Algorithm {
    fn default() -> Self {
        Algorithm::LeastConnections
    }
}

/// Parameters for a `proxy` route.
#[derive(Debug, Clone)]
pub struct ProxyParams {
    pub backends: Vec<Backend>,
    pub algorithm: Algorithm,
    pub healthcheck: bool,
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for ProxyParams {
    fn default() -> Self {
        Self {
            backends: Vec::new(),
            algorithm: Algorithm::default(),
            healthcheck: true,
            attempts: 2,
            delay: Duration::from_secs(1),
        }
    }
}

/// Parameters for a `static` route.
#[derive(Debug, Clone)]
pub struct StaticParams {
    pub r#type: String,
}

/// Parameters for an `empty` route.
#[derive(Debug, Clone, Copy)]
pub struct EmptyParams {
    pub code: u16,
}

/// Parameters for a `redirect` route.
#[derive(Debug, Clone)]
pub struct RedirectParams {
    pub redirect_to: String,
}

/// Parameters for a `spin` route.
#[derive(Debug, Clone, Copy)]
pub struct SpinParams {
    pub timeout: u64,
    pub check_interval: u64,
}

impl Default for SpinParams {
    fn default() -> Self {
        Self {
            timeout: 120,
            check_interval: 1,
        }
    }
}

/// Parameters for an `alias` route.
#[derive(Debug, Clone)]
pub struct AliasParams {
    pub hostname: String,
}

/// The action kind and its kind-specific parameter bag.
#[derive(Debug, Clone)]
pub enum RouteParams {
    Proxy(ProxyParams),
    Static(StaticParams),
    Empty(EmptyParams),
    Redirect(RedirectParams),
    Spin(SpinParams),
    Alias(AliasParams),
    Unknown,
    NoHosts,
}

impl RouteParams {
    pub fn kind_str(&self) -> &'static str {
        match self {
            RouteParams::Proxy(_) => "proxy",
            RouteParams::Static(_) => "static",
            RouteParams::Empty(_) => "empty",
            RouteParams::Redirect(_) => "redirect",
            RouteParams::Spin(_) => "spin",
            RouteParams::Alias(_) => "alias",
            RouteParams::Unknown => "unknown",
            RouteParams::NoHosts => "no_hosts",
        }
    }

    /// Whether this route's backends should be health-checked by default.
    /// Mirrors the original default of "healthcheck on unless proxy says otherwise".
    pub fn default_healthcheck_enabled(&self) -> bool {
        match self {
            RouteParams::Proxy(p) => p.healthcheck,
            _ => false,
        }
    }

    /// The backends owned by this route, if any.
    pub fn backends(&self) -> &[Backend] {
        match self {
            RouteParams::Proxy(p) => &p.backends,
            _ => &[],
        }
    }
}

/// A fully resolved route: its action parameters plus the subdomain-matching flag.
#[derive(Debug, Clone)]
pub struct Route {
    pub params: RouteParams,
    pub allow_subdomains: bool,
}

impl Route {
    pub fn new(params: RouteParams, allow_subdomains: bool) -> Self {
        Self {
            params,
            allow_subdomains,
        }
    }
}

/// Error returned when an action_kind naming "mirror" (listed in operator
/// tooling but never implemented) or an unrecognized kind is set.
#[derive(Debug, thiserror::Error)]
pub enum RouteParseError {
    #[error("action kind {0:?} is not implemented")]
    Unimplemented(String),
    #[error("action kind {0:?} is not recognized")]
    UnknownKind(String),
    #[error("route requires field {0:?}")]
    MissingField(&'static str),
    #[error("invalid value for field {0:?}: {1}")]
    InvalidField(&'static str, String),
}

fn field_str(obj: &serde_json::Map<String, Value>, key: &'static str) -> Result<String, RouteParseError> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(RouteParseError::MissingField(key))
}

fn parse_backend(value: &Value) -> Result<Backend, RouteParseError> {
    if let Some(arr) = value.get("__backend__").and_then(Value::as_array) {
        let host = arr
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| RouteParseError::InvalidField("backends", "missing host".into()))?;
        let port = arr
            .get(1)
            .and_then(Value::as_u64)
            .ok_or_else(|| RouteParseError::InvalidField("backends", "missing port".into()))?;
        return Ok(Backend::new(host, port as u16));
    }
    if let Some(s) = value.as_str() {
        return s
            .parse()
            .map_err(|e| RouteParseError::InvalidField("backends", format!("{e}")));
    }
    Err(RouteParseError::InvalidField(
        "backends",
        "expected {\"__backend__\": [host, port]} or \"host:port\"".into(),
    ))
}

/// Parses `(action_kind, params_obj)` into [`RouteParams`].
pub fn parse_params(kind: &str, params: &Value) -> Result<RouteParams, RouteParseError> {
    let obj = params.as_object().cloned().unwrap_or_default();

    match kind {
        "proxy" => {
            let backends = obj
                .get("backends")
                .and_then(Value::as_array)
                .ok_or(RouteParseError::MissingField("backends"))?
                .iter()
                .map(parse_backend)
                .collect::<Result<Vec<_>, _>>()?;
            if backends.is_empty() {
                return Err(RouteParseError::InvalidField(
                    "backends",
                    "must be non-empty".into(),
                ));
            }
            let algorithm = match obj.get("algorithm").and_then(Value::as_str) {
                Some("random") => Algorithm::Random,
                Some("least_connections") | None => Algorithm::LeastConnections,
                Some(other) => {
                    return Err(RouteParseError::InvalidField(
                        "algorithm",
                        format!("unknown algorithm {other:?}"),
                    ))
                }
            };
            let healthcheck = obj
                .get("healthcheck")
                .and_then(Value::as_bool)
                .unwrap_or(true);
            let attempts = obj
                .get("attempts")
                .and_then(Value::as_u64)
                .map(|v| v as u32)
                .unwrap_or(2);
            let delay = obj
                .get("delay")
                .and_then(Value::as_f64)
                .map(Duration::from_secs_f64)
                .unwrap_or(Duration::from_secs(1));
            Ok(RouteParams::Proxy(ProxyParams {
                backends,
                algorithm,
                healthcheck,
                attempts,
                delay,
            }))
        }
        "static" => Ok(RouteParams::Static(StaticParams {
            r#type: field_str(&obj, "type")?,
        })),
        "empty" => {
            let code = obj
                .get("code")
                .and_then(Value::as_u64)
                .ok_or(RouteParseError::MissingField("code"))?;
            Ok(RouteParams::Empty(EmptyParams { code: code as u16 }))
        }
        "redirect" => Ok(RouteParams::Redirect(RedirectParams {
            redirect_to: field_str(&obj, "redirect_to")?,
        })),
        "spin" => {
            let timeout = obj.get("timeout").and_then(Value::as_u64).unwrap_or(120);
            let check_interval = obj
                .get("check_interval")
                .and_then(Value::as_u64)
                .unwrap_or(1);
            Ok(RouteParams::Spin(SpinParams {
                timeout,
                check_interval,
            }))
        }
        "alias" => Ok(RouteParams::Alias(AliasParams {
            hostname: field_str(&obj, "hostname")?,
        })),
        "unknown" => Ok(RouteParams::Unknown),
        "no_hosts" => Ok(RouteParams::NoHosts),
        "mirror" => Err(RouteParseError::Unimplemented(kind.to_string())),
        other => Err(RouteParseError::UnknownKind(other.to_string())),
    }
}

/// Serializes a route's parameter bag to the wire JSON object form.
pub fn params_to_json(params: &RouteParams) -> Value {
    match params {
        RouteParams::Proxy(p) => serde_json::json!({
            "backends": p.backends.iter().map(|b| serde_json::json!({
                "__backend__": [b.host(), b.port()],
            })).collect::<Vec<_>>(),
            "algorithm": match p.algorithm {
                Algorithm::Random => "random",
                Algorithm::LeastConnections => "least_connections",
            },
            "healthcheck": p.healthcheck,
            "attempts": p.attempts,
            "delay": p.delay.as_secs_f64(),
        }),
        RouteParams::Static(p) => serde_json::json!({ "type": p.r#type }),
        RouteParams::Empty(p) => serde_json::json!({ "code": p.code }),
        RouteParams::Redirect(p) => serde_json::json!({ "redirect_to": p.redirect_to }),
        RouteParams::Spin(p) => serde_json::json!({
            "timeout": p.timeout,
            "check_interval": p.check_interval,
        }),
        RouteParams::Alias(p) => serde_json::json!({ "hostname": p.hostname }),
        RouteParams::Unknown | RouteParams::NoHosts => serde_json::json!({}),
    }
}

/// Wire representation of a [`Route`]: `[action_kind, params, allow_subdomains]`.
impl Serialize for Route {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeSeq;
        let mut seq = serializer.serialize_seq(Some(3))?;
        seq.serialize_element(self.params.kind_str())?;
        seq.serialize_element(&params_to_json(&self.params))?;
        seq.serialize_element(&self.allow_subdomains)?;
        seq.end()
    }
}

impl<'de> Deserialize<'de> for Route {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let (kind, params, allow_subdomains): (String, Value, bool) =
            Deserialize::deserialize(deserializer)?;
        let params = parse_params(&kind, &params).map_err(serde::de::Error::custom)?;
        Ok(Route::new(params, allow_subdomains))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_round_trips_through_json() {
        let route = Route::new(
            RouteParams::Proxy(ProxyParams {
                backends: vec![Backend::new("a.test", 80), Backend::new("b.test", 81)],
                algorithm: Algorithm::Random,
                healthcheck: false,
                attempts: 3,
                delay: Duration::from_millis(500),
            }),
            true,
        );
        let json = serde_json::to_value(&route).unwrap();
        let decoded: Route = serde_json::from_value(json).unwrap();
        match decoded.params {
            RouteParams::Proxy(p) => {
                assert_eq!(p.backends.len(), 2);
                assert_eq!(p.backends[0].host(), "a.test");
                assert_eq!(p.algorithm, Algorithm::Random);
                assert!(!p.healthcheck);
                assert_eq!(p.attempts, 3);
            }
            _ => panic!("expected proxy params"),
        }
        assert!(decoded.allow_subdomains);
    }

    #[test]
    fn mirror_is_rejected_as_unimplemented() {
        let err = parse_params("mirror", &serde_json::json!({})).unwrap_err();
        assert!(matches!(err, RouteParseError::Unimplemented(_)));
    }

    #[test]
    fn every_action_kind_round_trips() {
        for (kind, params) in [
            ("static", serde_json::json!({"type": "unknown"})),
            ("empty", serde_json::json!({"code": 418})),
            ("redirect", serde_json::json!({"redirect_to": "x.test"})),
            ("spin", serde_json::json!({"timeout": 5, "check_interval": 1})),
            ("alias", serde_json::json!({"hostname": "a.test"})),
            ("unknown", serde_json::json!({})),
            ("no_hosts", serde_json::json!({})),
        ] {
            let parsed = parse_params(kind, &params).unwrap();
            assert_eq!(parsed.kind_str(), kind);
        }
    }
}
