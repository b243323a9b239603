use reqwest::Url;
use serde_json::Value;

const SECRET_KEYS: &[&str] = &[
    "token",
    "api_key",
    "apikey",
    "access_token",
    "authorization",
    "password",
    "secret",
    "cookie",
];

fn is_secret_key(key: &str) -> bool {
    let k = key.to_lowercase();
    SECRET_KEYS.iter().any(|s| k == *s || k.ends_with(&format!("_{}", s)))
}

/// Masks secret-looking keys anywhere in a JSON tree.
pub fn redact_value(v: &mut Value) {
    match v {
        Value::Object(map) => {
            for (k, val) in map.iter_mut() {
                if is_secret_key(k) {
                    *val = Value::String("[REDACTED]".to_string());
                } else {
                    redact_value(val);
                }
            }
        }
        Value::Array(arr) => {
            for val in arr {
                redact_value(val);
            }
        }
        _ => {}
    }
}

/// URL suitable for logs: credentials and secret query values are masked.
pub fn redact_url(raw: &str) -> String {
    let mut url = match Url::parse(raw) {
        Ok(u) => u,
        Err(_) => return raw.to_string(),
    };
    if url.password().is_some() {
        let _ = url.set_password(Some("[REDACTED]"));
    }

    let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    if pairs.iter().any(|(k, _)| is_secret_key(k)) {
        url.query_pairs_mut().clear().extend_pairs(pairs.iter().map(|(k, v)| {
            if is_secret_key(k) {
                (k.as_str(), "[REDACTED]")
            } else {
                (k.as_str(), v.as_str())
            }
        }));
    }
    url.to_string()
}
