use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs, path::{Path, PathBuf}};
use tracing::{debug, info, warn};

use crate::{
    config::LocationSettings,
    model::{Coordinate, LocationSource, ResolvedLocation},
    provider::USER_AGENT,
};

const DEFAULT_GEOCODE_URL: &str = "https://nominatim.openstreetmap.org/search";
const DEFAULT_IP_URL: &str = "http://ip-api.com/json";

const KEY_EXPLICIT: &str = "explicit";
const KEY_AUTO: &str = "auto";

/// IP-derived locations go stale as people move networks; re-resolve weekly.
/// Explicit and address-derived entries are sticky.
const AUTO_MAX_AGE_DAYS: i64 = 7;

/// Resolves the monitored coordinate through a fallback chain: explicit
/// config, cached or fresh address geocoding, cached or fresh IP lookup,
/// and finally a previously cached explicit entry from an earlier run.
///
/// Every successful resolution is persisted to a JSON cache file keyed by
/// resolution method. Cache I/O never fails resolution; a broken file is
/// treated as empty.
pub struct LocationResolver {
    cache_path: PathBuf,
    legacy_path: PathBuf,
    geocode_url: String,
    ip_url: String,
    http: Client,
    timeout: std::time::Duration,
}

type Cache = BTreeMap<String, CacheEntry>;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    lat: f64,
    lon: f64,
    source: LocationSource,
    ts: DateTime<Utc>,
}

impl CacheEntry {
    fn new(coordinate: Coordinate, source: LocationSource, now: DateTime<Utc>) -> Self {
        Self { lat: coordinate.latitude, lon: coordinate.longitude, source, ts: now }
    }

    /// None when the stored coordinate is corrupt.
    fn resolved(&self) -> Option<ResolvedLocation> {
        let coordinate = Coordinate::new(self.lat, self.lon)?;
        Some(ResolvedLocation { coordinate, source: self.source })
    }
}

impl LocationResolver {
    /// `storage_dir` is the host application's storage path; the cache
    /// lives in a dedicated subdirectory of it, or under the home
    /// directory when none is supplied.
    pub fn new(storage_dir: Option<&Path>, timeout: std::time::Duration) -> Self {
        let cache_path = match storage_dir {
            Some(dir) => dir.join("rainsense").join("location.json"),
            None => home_fallback_dir().join("location.json"),
        };

        Self {
            cache_path,
            legacy_path: legacy_cache_path(),
            geocode_url: DEFAULT_GEOCODE_URL.to_string(),
            ip_url: DEFAULT_IP_URL.to_string(),
            http: Client::new(),
            timeout,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_endpoints(
        mut self,
        geocode_url: impl Into<String>,
        ip_url: impl Into<String>,
    ) -> Self {
        self.geocode_url = geocode_url.into();
        self.ip_url = ip_url.into();
        self
    }

    #[cfg(test)]
    pub(crate) fn with_legacy_path(mut self, legacy_path: PathBuf) -> Self {
        self.legacy_path = legacy_path;
        self
    }

    /// Resolve a location, first match wins. Returns None only when every
    /// stage failed; the caller treats that as "no location-dependent
    /// providers usable", not as a fatal error.
    pub async fn resolve(
        &self,
        settings: &LocationSettings,
        now: DateTime<Utc>,
    ) -> Option<ResolvedLocation> {
        let mut cache = self.load_cache();

        // 1. Explicit coordinates are authoritative; no network involved.
        if let (Some(lat), Some(lon)) = (settings.latitude, settings.longitude) {
            match Coordinate::new(lat, lon) {
                Some(coordinate) => {
                    cache.insert(
                        KEY_EXPLICIT.to_string(),
                        CacheEntry::new(coordinate, LocationSource::Config, now),
                    );
                    self.store_cache(&cache);
                    return Some(ResolvedLocation { coordinate, source: LocationSource::Config });
                }
                None => warn!(lat, lon, "configured coordinates are not finite, ignoring"),
            }
        }

        // 2. Address geocoding, cached indefinitely per address.
        if let Some(address) = settings.address.as_deref().map(str::trim).filter(|a| !a.is_empty())
        {
            let key = format!("addr:{}", address.to_lowercase());
            if let Some(resolved) = cache.get(&key).and_then(CacheEntry::resolved) {
                return Some(resolved);
            }

            match self.geocode(address).await {
                Ok(Some(coordinate)) => {
                    cache.insert(key, CacheEntry::new(coordinate, LocationSource::Geocode, now));
                    self.store_cache(&cache);
                    return Some(ResolvedLocation {
                        coordinate,
                        source: LocationSource::Geocode,
                    });
                }
                Ok(None) => warn!(address, "geocoder found no match, falling back"),
                Err(err) => warn!(address, %err, "geocoding failed, falling back"),
            }
        }

        // 3. IP geolocation, cached for a week.
        let fresh_auto = cache
            .get(KEY_AUTO)
            .filter(|e| now - e.ts < Duration::days(AUTO_MAX_AGE_DAYS))
            .and_then(CacheEntry::resolved);
        if let Some(resolved) = fresh_auto {
            return Some(resolved);
        }

        match self.ip_lookup().await {
            Ok(coordinate) => {
                cache.insert(
                    KEY_AUTO.to_string(),
                    CacheEntry::new(coordinate, LocationSource::Ip, now),
                );
                self.store_cache(&cache);
                return Some(ResolvedLocation { coordinate, source: LocationSource::Ip });
            }
            Err(err) => warn!(%err, "IP geolocation failed, falling back"),
        }

        // 4. A cached explicit entry from an earlier run beats nothing.
        if let Some(resolved) = cache.get(KEY_EXPLICIT).and_then(CacheEntry::resolved) {
            info!("using previously cached explicit location");
            return Some(resolved);
        }

        None
    }

    async fn geocode(&self, address: &str) -> anyhow::Result<Option<Coordinate>> {
        #[derive(Debug, Deserialize)]
        struct NominatimHit {
            // Nominatim serializes coordinates as strings.
            lat: String,
            lon: String,
        }

        let res = self
            .http
            .get(&self.geocode_url)
            .timeout(self.timeout)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .query(&[("q", address), ("format", "json"), ("limit", "1")])
            .send()
            .await?;

        let status = res.status();
        if !status.is_success() {
            anyhow::bail!("geocoder returned status {status}");
        }

        let hits: Vec<NominatimHit> = res.json().await?;
        let Some(hit) = hits.first() else {
            return Ok(None);
        };

        let lat: f64 = hit.lat.parse()?;
        let lon: f64 = hit.lon.parse()?;
        Ok(Coordinate::new(lat, lon))
    }

    async fn ip_lookup(&self) -> anyhow::Result<Coordinate> {
        #[derive(Debug, Deserialize)]
        struct IpApiResponse {
            status: String,
            lat: Option<f64>,
            lon: Option<f64>,
        }

        let res = self
            .http
            .get(&self.ip_url)
            .timeout(self.timeout)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .query(&[("fields", "status,lat,lon")])
            .send()
            .await?;

        let status = res.status();
        if !status.is_success() {
            anyhow::bail!("IP geolocation returned status {status}");
        }

        let body: IpApiResponse = res.json().await?;
        if body.status != "success" {
            anyhow::bail!("IP geolocation reported status '{}'", body.status);
        }

        let (Some(lat), Some(lon)) = (body.lat, body.lon) else {
            anyhow::bail!("IP geolocation response is missing coordinates");
        };

        Coordinate::new(lat, lon)
            .ok_or_else(|| anyhow::anyhow!("IP geolocation returned non-finite coordinates"))
    }

    /// Read the cache, migrating the legacy fixed-path file when the new
    /// one does not exist yet. Any read or parse problem yields an empty
    /// cache; resolution must never die on cache trouble.
    fn load_cache(&self) -> Cache {
        let path = if self.cache_path.exists() {
            self.cache_path.as_path()
        } else if self.legacy_path.exists() {
            info!(
                from = %self.legacy_path.display(),
                to = %self.cache_path.display(),
                "migrating legacy location cache"
            );
            self.legacy_path.as_path()
        } else {
            return Cache::new();
        };

        match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(cache) => cache,
                Err(err) => {
                    debug!(path = %path.display(), %err, "unreadable location cache, starting empty");
                    Cache::new()
                }
            },
            Err(err) => {
                debug!(path = %path.display(), %err, "failed to read location cache, starting empty");
                Cache::new()
            }
        }
    }

    /// Whole-file write; errors are logged and swallowed.
    fn store_cache(&self, cache: &Cache) {
        if let Some(parent) = self.cache_path.parent()
            && let Err(err) = fs::create_dir_all(parent)
        {
            warn!(path = %parent.display(), %err, "cannot create location cache directory");
            return;
        }

        match serde_json::to_string_pretty(cache) {
            Ok(json) => {
                if let Err(err) = fs::write(&self.cache_path, json) {
                    warn!(path = %self.cache_path.display(), %err, "failed to write location cache");
                }
            }
            Err(err) => warn!(%err, "failed to serialize location cache"),
        }
    }
}

fn home_fallback_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().join(".rainsense"))
        .unwrap_or_else(|| PathBuf::from(".rainsense"))
}

fn legacy_cache_path() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().join(".rainsense-location.json"))
        .unwrap_or_else(|| PathBuf::from(".rainsense-location.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings(lat: Option<f64>, lon: Option<f64>, address: Option<&str>) -> LocationSettings {
        LocationSettings { latitude: lat, longitude: lon, address: address.map(String::from) }
    }

    fn resolver(dir: &Path, server: &MockServer) -> LocationResolver {
        LocationResolver::new(Some(dir), StdDuration::from_secs(5))
            .with_endpoints(
                format!("{}/search", server.uri()),
                format!("{}/json", server.uri()),
            )
            .with_legacy_path(dir.join("legacy.json"))
    }

    fn cache_file(dir: &Path) -> PathBuf {
        dir.join("rainsense").join("location.json")
    }

    fn read_cache(dir: &Path) -> Cache {
        serde_json::from_str(&fs::read_to_string(cache_file(dir)).expect("cache file"))
            .expect("cache json")
    }

    fn write_cache(dir: &Path, cache: &Cache) {
        let path = cache_file(dir);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, serde_json::to_string(cache).expect("json")).expect("write");
    }

    #[tokio::test]
    async fn explicit_config_resolves_without_network() {
        let dir = tempfile::tempdir().expect("tempdir");
        let server = MockServer::start().await;
        let r = resolver(dir.path(), &server);

        let resolved = r
            .resolve(&settings(Some(40.0), Some(-73.0), None), Utc::now())
            .await
            .expect("resolved");
        assert_eq!(resolved.source, LocationSource::Config);
        assert_eq!(resolved.coordinate.latitude, 40.0);

        let cache = read_cache(dir.path());
        assert!(cache.contains_key("explicit"));

        let requests = server.received_requests().await.unwrap_or_default();
        assert!(requests.is_empty(), "explicit config must not touch the network");
    }

    #[tokio::test]
    async fn address_geocodes_once_then_serves_from_cache() {
        let dir = tempfile::tempdir().expect("tempdir");
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .and(query_param("q", "Berlin, Germany"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"[{"lat": "52.5170", "lon": "13.3888"}]"#,
                "application/json",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let cfg = settings(None, None, Some("Berlin, Germany"));

        let r = resolver(dir.path(), &server);
        let resolved = r.resolve(&cfg, Utc::now()).await.expect("resolved");
        assert_eq!(resolved.source, LocationSource::Geocode);

        let cache = read_cache(dir.path());
        assert!(cache.contains_key("addr:berlin, germany"), "address key is lowercased");

        // Fresh resolver, same address: served from cache (expect(1) above).
        let r = resolver(dir.path(), &server);
        let resolved = r.resolve(&cfg, Utc::now()).await.expect("resolved");
        assert_eq!(resolved.source, LocationSource::Geocode);
    }

    #[tokio::test]
    async fn failed_geocode_falls_through_to_ip_lookup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("[]", "application/json"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/json"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"{"status": "success", "lat": 51.2, "lon": 6.8}"#,
                "application/json",
            ))
            .mount(&server)
            .await;

        let r = resolver(dir.path(), &server);
        let resolved = r
            .resolve(&settings(None, None, Some("Nowhere Special")), Utc::now())
            .await
            .expect("resolved");
        assert_eq!(resolved.source, LocationSource::Ip);
    }

    #[tokio::test]
    async fn fresh_auto_cache_skips_ip_lookup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let server = MockServer::start().await;

        let now = Utc::now();
        let mut cache = Cache::new();
        cache.insert(
            "auto".to_string(),
            CacheEntry::new(
                Coordinate::new(48.2, 16.4).expect("coord"),
                LocationSource::Ip,
                now - Duration::days(1),
            ),
        );
        write_cache(dir.path(), &cache);

        let r = resolver(dir.path(), &server);
        let resolved = r.resolve(&settings(None, None, None), now).await.expect("resolved");
        assert_eq!(resolved.source, LocationSource::Ip);
        assert_eq!(resolved.coordinate.latitude, 48.2);

        let requests = server.received_requests().await.unwrap_or_default();
        assert!(requests.is_empty());
    }

    #[tokio::test]
    async fn stale_auto_cache_triggers_fresh_lookup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/json"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"{"status": "success", "lat": 59.3, "lon": 18.1}"#,
                "application/json",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let now = Utc::now();
        let mut cache = Cache::new();
        cache.insert(
            "auto".to_string(),
            CacheEntry::new(
                Coordinate::new(48.2, 16.4).expect("coord"),
                LocationSource::Ip,
                now - Duration::days(8),
            ),
        );
        write_cache(dir.path(), &cache);

        let r = resolver(dir.path(), &server);
        let resolved = r.resolve(&settings(None, None, None), now).await.expect("resolved");
        assert_eq!(resolved.coordinate.latitude, 59.3, "stale entry must be ignored");
    }

    #[tokio::test]
    async fn stale_explicit_entry_is_the_last_resort() {
        let dir = tempfile::tempdir().expect("tempdir");
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/json"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        // An earlier run under different config cached explicit coordinates.
        let mut cache = Cache::new();
        cache.insert(
            "explicit".to_string(),
            CacheEntry::new(
                Coordinate::new(40.0, -73.0).expect("coord"),
                LocationSource::Config,
                Utc::now() - Duration::days(30),
            ),
        );
        write_cache(dir.path(), &cache);

        let r = resolver(dir.path(), &server);
        let resolved =
            r.resolve(&settings(None, None, None), Utc::now()).await.expect("resolved");
        assert_eq!(resolved.source, LocationSource::Config);
    }

    #[tokio::test]
    async fn total_failure_resolves_to_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/json"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let r = resolver(dir.path(), &server);
        assert!(r.resolve(&settings(None, None, None), Utc::now()).await.is_none());
    }

    #[tokio::test]
    async fn corrupt_cache_is_treated_as_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let server = MockServer::start().await;

        let path = cache_file(dir.path());
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(&path, "{ not json").expect("write");

        let r = resolver(dir.path(), &server);
        let resolved = r
            .resolve(&settings(Some(1.0), Some(2.0), None), Utc::now())
            .await
            .expect("resolved");
        assert_eq!(resolved.source, LocationSource::Config);

        // The broken file was replaced by a valid one.
        assert!(read_cache(dir.path()).contains_key("explicit"));
    }

    #[tokio::test]
    async fn legacy_cache_file_is_picked_up_when_new_path_is_absent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let server = MockServer::start().await;

        let mut legacy = Cache::new();
        legacy.insert(
            "auto".to_string(),
            CacheEntry::new(
                Coordinate::new(35.7, 139.7).expect("coord"),
                LocationSource::Ip,
                Utc::now() - Duration::days(1),
            ),
        );
        fs::write(
            dir.path().join("legacy.json"),
            serde_json::to_string(&legacy).expect("json"),
        )
        .expect("write legacy");

        let r = resolver(dir.path(), &server);
        let resolved =
            r.resolve(&settings(None, None, None), Utc::now()).await.expect("resolved");
        assert_eq!(resolved.coordinate.latitude, 35.7);

        let requests = server.received_requests().await.unwrap_or_default();
        assert!(requests.is_empty());
    }
}
