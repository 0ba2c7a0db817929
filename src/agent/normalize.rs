//! Request normalisation: older orchestrators send the same parameter under
//! several names and encodings. Everything is folded into one canonical
//! request before validation.
use std::collections::BTreeMap;
use std::net::IpAddr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use crate::error::ValidationError;
use crate::wire::{
    ClientStartRequest, ClientStopRequest, DEFAULT_SERVER_PORT, Protocol, ServerStartRequest,
    ServerStopRequest, SessionKey,
};

/// Canonical field followed by the aliases accepted for it.
const CLIENT_ALIASES: &[(&str, &[&str])] = &[
    ("proto", &["protocol"]),
    ("duration", &["time", "seconds"]),
    ("parallel", &["P", "pairs", "threads"]),
    ("bitrate", &["bandwidth", "bw"]),
    ("length", &["len"]),
    ("bind", &["bind_ip"]),
];

static BITRATE_RE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)^\d+(?:\.\d+)?[KMGT]?(?:/\d+)?$").ok());

type Fields = Map<String, Value>;

fn parse_object(body: &[u8]) -> Result<Fields, ValidationError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Map::new());
    }
    match serde_json::from_slice::<Value>(body)
        .map_err(|err| ValidationError::InvalidJson { source: err })?
    {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        Value::Bool(_) | Value::Number(_) | Value::String(_) | Value::Array(_) => {
            Err(ValidationError::ExpectedObject)
        }
    }
}

/// Moves aliased keys onto their canonical name. An explicit canonical
/// value always wins over an alias.
fn apply_aliases(fields: &mut Fields) {
    for (canonical, aliases) in CLIENT_ALIASES {
        for alias in *aliases {
            let Some(value) = fields.remove(*alias) else {
                continue;
            };
            let occupied = fields.get(*canonical).is_some_and(|value| !value.is_null());
            if !occupied {
                fields.insert((*canonical).to_owned(), value);
            }
        }
    }
}

fn present<'fields>(fields: &'fields Fields, field: &str) -> Option<&'fields Value> {
    fields.get(field).filter(|value| match value {
        Value::Null => false,
        Value::String(text) => !text.trim().is_empty(),
        Value::Bool(_) | Value::Number(_) | Value::Array(_) | Value::Object(_) => true,
    })
}

fn invalid_number(field: &str, value: &Value) -> ValidationError {
    ValidationError::InvalidNumber {
        field: field.to_owned(),
        value: value.to_string(),
    }
}

fn parse_bool_text(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "y" => Some(true),
        "0" | "false" | "no" | "off" | "n" => Some(false),
        _ => None,
    }
}

fn get_bool(fields: &Fields, field: &str) -> Result<Option<bool>, ValidationError> {
    let Some(value) = present(fields, field) else {
        return Ok(None);
    };
    let parsed = match value {
        Value::Bool(flag) => Some(*flag),
        Value::Number(number) => match number.as_u64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            Some(_) | None => None,
        },
        Value::String(text) => parse_bool_text(text),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    };
    parsed.map(Some).ok_or_else(|| ValidationError::InvalidBoolean {
        field: field.to_owned(),
        value: value.to_string(),
    })
}

fn value_as_u64(field: &str, value: &Value) -> Result<u64, ValidationError> {
    let parsed = match value {
        // Older callers send whole numbers as floats (`30.0`).
        Value::Number(number) => number.as_u64().or_else(|| {
            number
                .as_f64()
                .filter(|float| float.fract().abs() < f64::EPSILON && (0.0..=1e12).contains(float))
                .map(|float| float as u64)
        }),
        Value::String(text) => text.trim().parse::<u64>().ok(),
        Value::Null | Value::Bool(_) | Value::Array(_) | Value::Object(_) => None,
    };
    parsed.ok_or_else(|| invalid_number(field, value))
}

fn get_u64(fields: &Fields, field: &str) -> Result<Option<u64>, ValidationError> {
    present(fields, field)
        .map(|value| value_as_u64(field, value))
        .transpose()
}

fn get_u32(fields: &Fields, field: &str) -> Result<Option<u32>, ValidationError> {
    let Some(value) = present(fields, field) else {
        return Ok(None);
    };
    let number = value_as_u64(field, value)?;
    u32::try_from(number)
        .map(Some)
        .map_err(|err| ValidationError::InvalidNumber {
            field: field.to_owned(),
            value: format!("{} ({})", number, err),
        })
}

fn get_string(fields: &Fields, field: &str) -> Option<String> {
    match present(fields, field)? {
        Value::String(text) => Some(text.trim().to_owned()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(_) | Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

fn port_from_value(value: &Value) -> Result<u16, ValidationError> {
    let invalid = || ValidationError::InvalidPort {
        value: value.to_string(),
    };
    let number = value_as_u64("port", value).map_err(|_err| invalid())?;
    u16::try_from(number)
        .ok()
        .filter(|port| *port > 0)
        .ok_or_else(invalid)
}

fn parse_bind(value: &str) -> Result<String, ValidationError> {
    value
        .parse::<IpAddr>()
        .map(|_addr| value.to_owned())
        .map_err(|_err| ValidationError::InvalidBindAddress {
            value: value.to_owned(),
        })
}

fn parse_protocol(value: &str) -> Result<Protocol, ValidationError> {
    match value.to_ascii_lowercase().as_str() {
        "tcp" => Ok(Protocol::Tcp),
        "udp" => Ok(Protocol::Udp),
        _ => Err(ValidationError::InvalidProtocol {
            value: value.to_owned(),
        }),
    }
}

pub(crate) fn validate_bitrate(value: &str) -> Result<(), ValidationError> {
    let matches = BITRATE_RE
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(value));
    if matches {
        Ok(())
    } else {
        Err(ValidationError::InvalidBitrate {
            value: value.to_owned(),
        })
    }
}

fn validate_interval(value: &str) -> Result<(), ValidationError> {
    let valid = value
        .parse::<f64>()
        .is_ok_and(|seconds| seconds.is_finite() && seconds > 0.0);
    if valid {
        Ok(())
    } else {
        Err(ValidationError::InvalidNumber {
            field: "interval".to_owned(),
            value: value.to_owned(),
        })
    }
}

/// Folds a `client/start` body into a validated canonical request.
///
/// # Errors
///
/// Returns a validation error when a field is missing, malformed, or the
/// combination violates the UDP constraints.
pub(crate) fn normalize_client_start(body: &[u8]) -> Result<ClientStartRequest, ValidationError> {
    let mut fields = parse_object(body)?;
    apply_aliases(&mut fields);

    let target = get_string(&fields, "target").ok_or(ValidationError::MissingField { field: "target" })?;
    let port = present(&fields, "port")
        .ok_or(ValidationError::MissingField { field: "port" })
        .and_then(port_from_value)?;

    let mut request = ClientStartRequest::new(target, port);
    request.duration = get_u64(&fields, "duration")?;
    if let Some(proto) = get_string(&fields, "proto") {
        request.proto = parse_protocol(&proto)?;
    }
    if let Some(parallel) = get_u32(&fields, "parallel")? {
        request.parallel = parallel;
    }
    request.bitrate = get_string(&fields, "bitrate");
    if let Some(bitrate) = request.bitrate.as_deref() {
        validate_bitrate(bitrate)?;
    }
    request.bidir = get_bool(&fields, "bidir")?.unwrap_or(false);
    request.reverse = get_bool(&fields, "reverse")?.unwrap_or(false);
    request.omit = get_u32(&fields, "omit")?;
    request.length = get_string(&fields, "length");
    request.window = get_string(&fields, "window");
    request.bind = get_string(&fields, "bind").map(|bind| parse_bind(&bind)).transpose()?;
    request.interval = get_string(&fields, "interval");
    if let Some(interval) = request.interval.as_deref() {
        validate_interval(interval)?;
    }

    request.validate()?;
    Ok(request)
}

/// # Errors
///
/// Returns a validation error for a malformed port list or bind address.
pub(crate) fn normalize_server_start(body: &[u8]) -> Result<ServerStartRequest, ValidationError> {
    let fields = parse_object(body)?;
    let ports = match present(&fields, "ports") {
        Some(Value::Array(values)) => values
            .iter()
            .map(port_from_value)
            .collect::<Result<Vec<u16>, _>>()?,
        Some(single) => vec![port_from_value(single)?],
        None => match present(&fields, "port") {
            Some(single) => vec![port_from_value(single)?],
            None => vec![DEFAULT_SERVER_PORT],
        },
    };
    let mut ports_seen = Vec::with_capacity(ports.len());
    for port in ports {
        if !ports_seen.contains(&port) {
            ports_seen.push(port);
        }
    }

    let bind = get_string(&fields, "bind")
        .map(|bind| parse_bind(&bind))
        .transpose()?;
    let mut bind_map = BTreeMap::new();
    if let Some(Value::Object(entries)) = present(&fields, "bind_map") {
        for (port, bind) in entries {
            let port = port_from_value(&Value::String(port.clone()))?;
            let Some(bind) = bind.as_str().map(str::trim).filter(|bind| !bind.is_empty()) else {
                continue;
            };
            bind_map.insert(port.to_string(), parse_bind(bind)?);
        }
    }

    Ok(ServerStartRequest {
        ports: ports_seen,
        bind,
        bind_map,
    })
}

/// # Errors
///
/// Returns a validation error for a malformed port list.
pub(crate) fn normalize_server_stop(body: &[u8]) -> Result<ServerStopRequest, ValidationError> {
    let fields = parse_object(body)?;
    let ports = match present(&fields, "ports") {
        Some(Value::Array(values)) => Some(
            values
                .iter()
                .map(port_from_value)
                .collect::<Result<Vec<u16>, _>>()?,
        ),
        Some(single) => Some(vec![port_from_value(single)?]),
        None => None,
    };
    Ok(ServerStopRequest { ports })
}

/// Keys may be given as `client:<port>` strings or as bare client ports.
///
/// # Errors
///
/// Returns a validation error for a key that names no session.
pub(crate) fn normalize_client_stop(body: &[u8]) -> Result<ClientStopRequest, ValidationError> {
    let fields = parse_object(body)?;
    let values = match present(&fields, "keys") {
        Some(Value::Array(values)) => values.clone(),
        Some(single) => vec![single.clone()],
        None => return Ok(ClientStopRequest { keys: None }),
    };
    let keys = values
        .iter()
        .map(|value| match value {
            Value::String(text) if text.contains(':') => text.parse::<SessionKey>(),
            Value::Null
            | Value::Bool(_)
            | Value::Number(_)
            | Value::String(_)
            | Value::Array(_)
            | Value::Object(_) => port_from_value(value).map(SessionKey::client),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ClientStopRequest { keys: Some(keys) })
}
