//! Serde adapters for the primitive shapes stored in a serialized response.
//!
//! Header maps become a JSON object of `name -> value` (or `name -> [values]`
//! for repeated headers), bodies become base64 strings, and durations become
//! fractional seconds.

use std::collections::BTreeMap;

use http::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

/// Lossy string view of a header value.
pub fn value_str(value: &HeaderValue) -> String {
    match value.to_str() {
        Ok(s) => s.to_string(),
        Err(_) => String::from_utf8_lossy(value.as_bytes()).into_owned(),
    }
}

/// First value of a header as a string.
pub fn get_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name).map(value_str)
}

/// Insert a header from string parts, skipping anything `http` refuses.
pub fn insert_str(headers: &mut HeaderMap, name: &str, value: &str) {
    if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
        headers.insert(name, value);
    }
}

/// Sorted `(lowercase name, value)` pairs; repeated headers are joined with `, `.
pub fn to_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        grouped.entry(name.as_str().to_string()).or_default().push(value_str(value));
    }
    grouped.into_iter().map(|(k, v)| (k, v.join(", "))).collect()
}

pub mod header_map {
    use super::*;

    pub fn serialize<S: Serializer>(headers: &HeaderMap, serializer: S) -> Result<S::Ok, S::Error> {
        let mut out: BTreeMap<String, OneOrMany> = BTreeMap::new();
        for name in headers.keys() {
            let values: Vec<String> = headers.get_all(name).iter().map(value_str).collect();
            let entry = if values.len() == 1 {
                OneOrMany::One(values.into_iter().next().unwrap_or_default())
            } else {
                OneOrMany::Many(values)
            };
            out.insert(name.as_str().to_string(), entry);
        }
        out.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<HeaderMap, D::Error> {
        let raw: BTreeMap<String, OneOrMany> = BTreeMap::deserialize(deserializer)?;
        let mut headers = HeaderMap::new();
        for (name, values) in raw {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(serde::de::Error::custom)?;
            let values = match values {
                OneOrMany::One(v) => vec![v],
                OneOrMany::Many(v) => v,
            };
            for value in values {
                let value = HeaderValue::from_str(&value).map_err(serde::de::Error::custom)?;
                headers.append(name.clone(), value);
            }
        }
        Ok(headers)
    }
}

pub mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(elapsed: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(elapsed.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs.max(0.0)).map_err(serde::de::Error::custom)
    }
}

pub mod method {
    use http::Method;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(method: &Method, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(method.as_str())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Method, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Method::from_bytes(raw.to_ascii_uppercase().as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize)]
    struct Wrapper {
        #[serde(with = "header_map")]
        headers: HeaderMap,
    }

    #[test]
    fn test_repeated_headers_survive() {
        let mut headers = HeaderMap::new();
        headers.append("set-cookie", HeaderValue::from_static("a=1"));
        headers.append("set-cookie", HeaderValue::from_static("b=2"));
        headers.insert("content-type", HeaderValue::from_static("text/plain"));

        let json = serde_json::to_value(Wrapper { headers }).unwrap();
        assert_eq!(json["headers"]["content-type"], "text/plain");
        assert_eq!(json["headers"]["set-cookie"].as_array().unwrap().len(), 2);

        let back: Wrapper = serde_json::from_value(json).unwrap();
        assert_eq!(back.headers.get_all("set-cookie").iter().count(), 2);
    }

    #[test]
    fn test_to_pairs_sorted_and_joined() {
        let mut headers = HeaderMap::new();
        headers.insert("X-B", HeaderValue::from_static("2"));
        headers.append("accept", HeaderValue::from_static("a"));
        headers.append("accept", HeaderValue::from_static("b"));
        let pairs = to_pairs(&headers);
        assert_eq!(pairs[0], ("accept".to_string(), "a, b".to_string()));
        assert_eq!(pairs[1].0, "x-b");
    }
}
