//! Server registry: fetch candidate measurement servers, pick targets, and
//! order candidates by distance or probed latency.

pub mod parse;
pub mod rank;

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::RegistryConfig;
use crate::error::{Error, Result};
use crate::transport::Transport;

/// Mean Earth radius used for great-circle distances, in km.
pub const EARTH_RADIUS_KM: f64 = 6378.137;

// ---------------------------------------------------------------------------
// Data model
// ---------------------------------------------------------------------------

/// One measurement endpoint and the results measured against it.
///
/// Result fields stay `None` until the corresponding sub-test succeeds; they
/// are never read from a registry body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    #[serde(deserialize_with = "parse::id_string")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub sponsor: String,
    /// `host:port` of the TCP measurement service.
    pub host: String,
    /// Derived upload URL, `http://<host>/speedtest/upload.php`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, deserialize_with = "parse::coordinate", skip_serializing)]
    pub lat: Option<f64>,
    #[serde(default, deserialize_with = "parse::coordinate", skip_serializing)]
    pub lon: Option<f64>,
    #[serde(default, skip_deserializing, skip_serializing_if = "Option::is_none")]
    pub distance_km: Option<f64>,
    #[serde(default, skip_deserializing, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(default, skip_deserializing, skip_serializing_if = "Option::is_none")]
    pub download_mbps: Option<f64>,
    #[serde(default, skip_deserializing, skip_serializing_if = "Option::is_none")]
    pub upload_mbps: Option<f64>,
}

impl Server {
    /// Numeric form of the identifier, if it has one.
    pub fn numeric_id(&self) -> Option<u32> {
        self.id.trim().parse().ok()
    }

    /// Base URL of the HTTP download resources (`.../speedtest`).
    pub fn download_base(&self) -> &str {
        self.url
            .split("/upload.php")
            .next()
            .unwrap_or(self.url.as_str())
    }
}

impl std::fmt::Display for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:>4}] ", self.id)?;
        match self.distance_km {
            Some(km) => write!(f, "{:8.2}km ", km)?,
            None => write!(f, "{:>10} ", "-")?,
        }
        write!(f, "{} ({}) by {}", self.name, self.country, self.sponsor)
    }
}

/// Client identity reported by the legacy config endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    pub ip: String,
    pub isp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
}

impl std::fmt::Display for UserInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.ip, self.isp)?;
        if let (Some(lat), Some(lon)) = (self.lat, self.lon) {
            write!(f, " [{:.4}, {:.4}]", lat, lon)?;
        }
        Ok(())
    }
}

/// Non-empty, ordered collection of servers.
#[derive(Debug, Clone, Serialize)]
pub struct ServerList {
    servers: Vec<Server>,
}

/// Indices into a [`ServerList`] chosen for testing. Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    indices: Vec<usize>,
}

impl Selection {
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn servers<'a>(&'a self, list: &'a ServerList) -> impl Iterator<Item = &'a Server> + 'a {
        self.indices.iter().filter_map(move |&i| list.get(i))
    }
}

impl ServerList {
    /// Wrap parsed servers; an empty list is [`Error::EmptyResult`].
    pub fn new(servers: Vec<Server>) -> Result<Self> {
        if servers.is_empty() {
            return Err(Error::EmptyResult);
        }
        Ok(Self { servers })
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn servers(&self) -> &[Server] {
        &self.servers
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Server> {
        self.servers.iter()
    }

    pub fn get(&self, index: usize) -> Option<&Server> {
        self.servers.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Server> {
        self.servers.get_mut(index)
    }

    pub fn into_inner(self) -> Vec<Server> {
        self.servers
    }

    /// The server whose id equals `id`, or the first entry when `id` is
    /// absent or unmatched.
    pub fn find(&self, id: Option<u32>) -> Selection {
        match id {
            Some(id) => self.select(&[id]),
            None => self.select(&[]),
        }
    }

    /// One entry per requested id that exists, in request order; falls back
    /// to the first entry when nothing matches.
    pub fn select(&self, ids: &[u32]) -> Selection {
        let mut indices = Vec::new();
        for id in ids {
            if let Some(index) = self.servers.iter().position(|s| s.numeric_id() == Some(*id)) {
                if !indices.contains(&index) {
                    indices.push(index);
                }
            } else {
                debug!(server_id = id, "requested server not in list");
            }
        }
        if indices.is_empty() {
            indices.push(0);
        }
        Selection { indices }
    }

    /// Stable ascending sort by a key extracted from each server.
    ///
    /// Incomparable keys (NaN) keep their relative order.
    pub fn sort_by_key<K, F>(&mut self, key: F)
    where
        K: PartialOrd,
        F: Fn(&Server) -> K,
    {
        self.servers
            .sort_by(|a, b| key(a).partial_cmp(&key(b)).unwrap_or(Ordering::Equal));
    }

    /// Nearest first; servers without a distance go last.
    pub fn sort_by_distance(&mut self) {
        self.sort_by_key(|s| s.distance_km.unwrap_or(f64::INFINITY));
    }

    /// Fastest first; servers whose probe failed go last.
    pub fn sort_by_latency(&mut self) {
        self.sort_by_key(|s| s.latency_ms.unwrap_or(f64::INFINITY));
    }

    /// Fill `distance_km` for every server with known coordinates.
    pub fn annotate_distance(&mut self, client_lat: f64, client_lon: f64) {
        for server in &mut self.servers {
            if let (Some(lat), Some(lon)) = (server.lat, server.lon) {
                server.distance_km = Some(distance(lat, lon, client_lat, client_lon));
            }
        }
    }
}

/// Great-circle distance in km by the spherical law of cosines.
pub fn distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (phi1, lambda1) = (lat1.to_radians(), lon1.to_radians());
    let (phi2, lambda2) = (lat2.to_radians(), lon2.to_radians());

    let cos_angle =
        phi1.sin() * phi2.sin() + phi1.cos() * phi2.cos() * (lambda2 - lambda1).cos();
    // Rounding can push identical points just past 1.0.
    EARTH_RADIUS_KM * cos_angle.clamp(-1.0, 1.0).acos()
}

// ---------------------------------------------------------------------------
// Registry client
// ---------------------------------------------------------------------------

/// HTTP client for the server list and client info endpoints.
#[derive(Debug, Clone)]
pub struct Registry {
    transport: Transport,
    url: String,
    user_info_url: String,
}

impl Registry {
    pub fn new(transport: Transport, config: &RegistryConfig) -> Self {
        Self {
            transport,
            url: config.url.clone(),
            user_info_url: config.user_info_url.clone(),
        }
    }

    /// Fetch the server list, scoped to `server_id` when given.
    pub async fn fetch(&self, server_id: Option<u32>) -> Result<ServerList> {
        let mut request = self.transport.http().get(&self.url);
        if let Some(id) = server_id {
            request = request.query(&[("serverid", id)]);
        }

        let body = self.get_text(request, &self.url).await?;
        let servers = parse::parse_server_list(&body)?;
        let list = ServerList::new(servers)?;

        info!(url = %self.url, ?server_id, servers = list.len(), "fetched server list");
        Ok(list)
    }

    /// Fetch the client's public IP, ISP and coordinates.
    pub async fn user_info(&self) -> Result<UserInfo> {
        let request = self.transport.http().get(&self.user_info_url);
        let body = self.get_text(request, &self.user_info_url).await?;
        parse::parse_user_info(&body)
    }

    async fn get_text(&self, request: reqwest::RequestBuilder, url: &str) -> Result<String> {
        let fetch_error = |source| Error::Fetch {
            url: url.to_string(),
            source,
        };
        request
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(fetch_error)?
            .text()
            .await
            .map_err(fetch_error)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
