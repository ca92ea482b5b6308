//! Registry body parsing: JSON (current API) and attribute-encoded XML (legacy).

use serde::{Deserialize, Deserializer};

use super::{Server, UserInfo};
use crate::error::{Error, Result};

/// Parse a registry body into servers, deriving each upload URL.
///
/// Accepts a JSON object with a `servers` array, a bare JSON array, or the
/// legacy `<settings><servers><server .../></servers></settings>` XML.
pub fn parse_server_list(body: &str) -> Result<Vec<Server>> {
    let trimmed = body.trim_start();
    let mut servers = if trimmed.starts_with('<') {
        parse_xml(trimmed)?
    } else {
        parse_json(trimmed)?
    };

    for server in &mut servers {
        validate(server)?;
        server.url = upload_url(&server.host);
    }
    Ok(servers)
}

pub fn upload_url(host: &str) -> String {
    format!("http://{}/speedtest/upload.php", host)
}

/// Check that `host` is a `host:port` pair with a numeric port.
pub fn is_host_port(host: &str) -> bool {
    match host.rsplit_once(':') {
        Some((name, port)) => !name.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}

fn validate(server: &Server) -> Result<()> {
    if server.id.trim().is_empty() {
        return Err(Error::Parse("server entry without an id".to_string()));
    }
    if !is_host_port(&server.host) {
        return Err(Error::Parse(format!(
            "server {} has invalid host {:?}, expected host:port",
            server.id, server.host
        )));
    }
    Ok(())
}

fn parse_json(body: &str) -> Result<Vec<Server>> {
    let value: serde_json::Value =
        serde_json::from_str(body).map_err(|e| Error::Parse(e.to_string()))?;

    let entries = match value {
        serde_json::Value::Array(_) => value,
        serde_json::Value::Object(mut map) => map
            .remove("servers")
            .ok_or_else(|| Error::Parse("missing \"servers\" field".to_string()))?,
        other => {
            return Err(Error::Parse(format!(
                "expected object or array, got {}",
                json_kind(&other)
            )))
        }
    };

    serde_json::from_value(entries).map_err(|e| Error::Parse(e.to_string()))
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Legacy XML
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct XmlSettings {
    #[serde(default)]
    servers: XmlServers,
}

#[derive(Debug, Default, Deserialize)]
struct XmlServers {
    #[serde(rename = "server", default)]
    server: Vec<XmlServer>,
}

#[derive(Debug, Deserialize)]
struct XmlServer {
    #[serde(rename = "@id", default)]
    id: String,
    #[serde(rename = "@host", default)]
    host: String,
    #[serde(rename = "@name", default)]
    name: String,
    #[serde(rename = "@country", default)]
    country: String,
    #[serde(rename = "@sponsor", default)]
    sponsor: String,
    #[serde(rename = "@lat", default)]
    lat: Option<String>,
    #[serde(rename = "@lon", default)]
    lon: Option<String>,
}

fn parse_xml(body: &str) -> Result<Vec<Server>> {
    let settings: XmlSettings =
        quick_xml::de::from_str(body).map_err(|e| Error::Parse(e.to_string()))?;

    Ok(settings
        .servers
        .server
        .into_iter()
        .map(|s| Server {
            id: s.id,
            name: s.name,
            country: s.country,
            sponsor: s.sponsor,
            host: s.host,
            url: String::new(),
            lat: s.lat.as_deref().and_then(parse_coordinate),
            lon: s.lon.as_deref().and_then(parse_coordinate),
            distance_km: None,
            latency_ms: None,
            download_mbps: None,
            upload_mbps: None,
        })
        .collect())
}

#[derive(Debug, Deserialize)]
struct XmlClientConfig {
    client: XmlClient,
}

#[derive(Debug, Deserialize)]
struct XmlClient {
    #[serde(rename = "@ip", default)]
    ip: String,
    #[serde(rename = "@isp", default)]
    isp: String,
    #[serde(rename = "@lat", default)]
    lat: Option<String>,
    #[serde(rename = "@lon", default)]
    lon: Option<String>,
}

/// Parse the `<client .../>` element of the legacy config document.
pub fn parse_user_info(body: &str) -> Result<UserInfo> {
    let config: XmlClientConfig =
        quick_xml::de::from_str(body.trim_start()).map_err(|e| Error::Parse(e.to_string()))?;

    Ok(UserInfo {
        ip: config.client.ip,
        isp: config.client.isp,
        lat: config.client.lat.as_deref().and_then(parse_coordinate),
        lon: config.client.lon.as_deref().and_then(parse_coordinate),
    })
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

fn parse_coordinate(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Text(String),
    Integer(i64),
    Float(f64),
}

/// Server ids arrive as `"1234"` or `1234` depending on the endpoint.
pub(super) fn id_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Scalar::deserialize(deserializer)? {
        Scalar::Text(s) => s,
        Scalar::Integer(i) => i.to_string(),
        Scalar::Float(f) => f.to_string(),
    })
}

/// Coordinates arrive as strings or numbers; unparseable values become `None`.
pub(super) fn coordinate<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Scalar>::deserialize(deserializer)? {
        Some(Scalar::Text(s)) => parse_coordinate(&s),
        Some(Scalar::Integer(i)) => Some(i as f64),
        Some(Scalar::Float(f)) => Some(f),
        None => None,
    })
}
