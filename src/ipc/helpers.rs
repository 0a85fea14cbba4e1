use crate::error::{EngineError, EngineResult};
use serde::de::DeserializeOwned;

pub fn req_i64(params: &serde_json::Value, key: &str) -> EngineResult<i64> {
    params
        .get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| EngineError::BadParams(format!("missing/invalid {}", key)))
}

pub fn opt_i64(params: &serde_json::Value, key: &str) -> EngineResult<Option<i64>> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| EngineError::BadParams(format!("invalid {}", key))),
    }
}

pub fn req_str<'a>(params: &'a serde_json::Value, key: &str) -> EngineResult<&'a str> {
    let s = params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| EngineError::BadParams(format!("missing {}", key)))?;
    let s = s.trim();
    if s.is_empty() {
        return Err(EngineError::BadParams(format!("{} must not be empty", key)));
    }
    Ok(s)
}

pub fn req_month(params: &serde_json::Value) -> EngineResult<u32> {
    let month = req_i64(params, "month")?;
    u32::try_from(month).map_err(|_| EngineError::BadParams(format!("invalid month {}", month)))
}

pub fn req_year(params: &serde_json::Value) -> EngineResult<i32> {
    let year = req_i64(params, "year")?;
    i32::try_from(year).map_err(|_| EngineError::BadParams(format!("invalid year {}", year)))
}

pub fn parse_params<T: DeserializeOwned>(params: &serde_json::Value) -> EngineResult<T> {
    serde_json::from_value(params.clone()).map_err(|e| EngineError::BadParams(e.to_string()))
}
