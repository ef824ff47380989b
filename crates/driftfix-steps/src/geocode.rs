//! Address lookup and the venue coordinate backfill.

use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use driftfix_common::{Error, Result};
use driftfix_db::SiteStore;
use driftfix_migrate::{SchemaVersion, Step};
use rusqlite::params;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::batch::{BatchProgress, BatchStep, drain};

pub const VENUE_META_KEY: &str = "gatherpress_venue_information";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

/// Resolves a free-form address to coordinates. Any failure, including "no
/// match", is reported as `Error::ExternalLookup`.
pub trait Geocoder: Send + Sync {
    fn lookup(&self, address: &str) -> Result<Coordinates>;
}

/// Used when geocoding is turned off in config: every lookup fails, so the
/// backfill skips every record.
pub struct DisabledGeocoder;

impl Geocoder for DisabledGeocoder {
    fn lookup(&self, _address: &str) -> Result<Coordinates> {
        Err(Error::ExternalLookup("geocoding is disabled".into()))
    }
}

/// Nominatim search over GeoJSON.
///
/// The blocking client is built on first lookup so the geocoder can be
/// constructed inside an async runtime and only used from blocking threads.
///
/// Requests start at least `min_interval` apart, across every thread that
/// shares the geocoder. The public Nominatim service allows one per second.
pub struct NominatimGeocoder {
    search_url: String,
    timeout: Duration,
    user_agent: String,
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
    client: OnceLock<reqwest::blocking::Client>,
}

#[derive(Debug, Deserialize)]
struct FeatureCollection {
    #[serde(default)]
    features: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
struct Feature {
    geometry: Geometry,
}

#[derive(Debug, Deserialize)]
struct Geometry {
    /// GeoJSON order: longitude, latitude.
    coordinates: Vec<f64>,
}

impl NominatimGeocoder {
    pub fn new(base_url: &str, timeout: Duration, user_agent: impl Into<String>) -> Self {
        Self {
            search_url: format!("{}/search", base_url.trim_end_matches('/')),
            timeout,
            user_agent: user_agent.into(),
            min_interval: Duration::ZERO,
            last_request: Mutex::new(None),
            client: OnceLock::new(),
        }
    }

    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.min_interval = min_interval;
        self
    }

    /// Block until `min_interval` has passed since the previous request.
    fn wait_turn(&self) {
        let mut last = self
            .last_request
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = *last {
            let wait = self.min_interval.saturating_sub(previous.elapsed());
            if !wait.is_zero() {
                debug!("waiting {} ms before the next geocoder request", wait.as_millis());
                std::thread::sleep(wait);
            }
        }
        *last = Some(Instant::now());
    }

    fn client(&self) -> Result<&reqwest::blocking::Client> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .user_agent(self.user_agent.clone())
            .build()
            .map_err(|e| Error::ExternalLookup(format!("failed to build http client: {e}")))?;
        Ok(self.client.get_or_init(|| client))
    }
}

impl Geocoder for NominatimGeocoder {
    fn lookup(&self, address: &str) -> Result<Coordinates> {
        let client = self.client()?;
        self.wait_turn();
        let response = client
            .get(&self.search_url)
            .query(&[("q", address), ("format", "geojson"), ("limit", "1")])
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::ExternalLookup(format!("geocoder request failed: {e}")))?;

        let body: FeatureCollection = response
            .json()
            .map_err(|e| Error::ExternalLookup(format!("unreadable geocoder response: {e}")))?;

        match body.features.first().map(|f| f.geometry.coordinates.as_slice()) {
            Some([longitude, latitude, ..]) => Ok(Coordinates {
                latitude: *latitude,
                longitude: *longitude,
            }),
            _ => Err(Error::ExternalLookup(format!("no match for {address:?}"))),
        }
    }
}

/// Fills in missing latitude/longitude on venue information meta.
pub struct VenueCoordinatesBackfill {
    version: SchemaVersion,
    geocoder: Arc<dyn Geocoder>,
    batch_size: usize,
}

impl VenueCoordinatesBackfill {
    pub fn new(version: SchemaVersion, geocoder: Arc<dyn Geocoder>, batch_size: usize) -> Self {
        Self {
            version,
            geocoder,
            batch_size: batch_size.max(1),
        }
    }
}

/// Truthiness of a JSON field the way the venue editor treats it: missing,
/// null, false, zero, `""` and `"0"` all count as empty.
fn is_empty(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::Bool(b)) => !b,
        Some(Value::Number(n)) => n.as_f64() == Some(0.0),
        Some(Value::String(s)) => s.is_empty() || s == "0",
        Some(Value::Array(a)) => a.is_empty(),
        Some(Value::Object(_)) => false,
    }
}

fn needs_coordinates(venue: &Map<String, Value>) -> Option<&str> {
    let missing = is_empty(venue.get("latitude")) || is_empty(venue.get("longitude"));
    let address = venue.get("fullAddress");
    if !missing || is_empty(address) {
        return None;
    }
    address.and_then(Value::as_str)
}

impl BatchStep for VenueCoordinatesBackfill {
    fn label(&self) -> &str {
        "venue coordinate backfill"
    }

    fn process_batch(&self, store: &SiteStore, after: i64) -> Result<BatchProgress> {
        let postmeta = store.table("postmeta");
        let rows: Vec<(i64, Option<String>)> = store.with_connection("read venue meta", |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT meta_id, meta_value FROM {postmeta}
                 WHERE meta_key = ?1 AND meta_id > ?2
                 ORDER BY meta_id LIMIT ?3"
            ))?;
            let rows = stmt.query_map(
                params![VENUE_META_KEY, after, self.batch_size as i64],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            rows.collect()
        })?;

        let mut progress = BatchProgress {
            last_id: rows.last().map(|(id, _)| *id),
            scanned: rows.len(),
            ..Default::default()
        };

        for (meta_id, raw) in rows {
            let Some(Value::Object(mut venue)) =
                raw.as_deref().and_then(|s| serde_json::from_str(s).ok())
            else {
                debug!("venue meta {meta_id} is not a JSON object");
                continue;
            };
            let Some(address) = needs_coordinates(&venue).map(str::to_owned) else {
                continue;
            };

            let found = self.geocoder.lookup(&address);
            store.heartbeat()?;
            let coords = match found {
                Ok(coords) => coords,
                Err(Error::ExternalLookup(reason)) => {
                    warn!("skipping venue meta {meta_id}: {reason}");
                    progress.skipped += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            venue.insert("latitude".into(), Value::from(coords.latitude));
            venue.insert("longitude".into(), Value::from(coords.longitude));
            let updated = serde_json::to_string(&venue)?;
            store.with_connection("write venue meta", |conn| {
                conn.execute(
                    &format!("UPDATE {postmeta} SET meta_value = ?1 WHERE meta_id = ?2"),
                    params![updated, meta_id],
                )
            })?;
            progress.updated += 1;
        }

        Ok(progress)
    }
}

impl Step<SiteStore> for VenueCoordinatesBackfill {
    fn name(&self) -> &str {
        "backfill-venue-coordinates"
    }

    fn version(&self) -> &SchemaVersion {
        &self.version
    }

    fn transactional(&self) -> bool {
        false
    }

    fn apply(&self, store: &SiteStore) -> Result<()> {
        drain(self, store).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use driftfix_migrate::Scope;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    /// Answers from a fixed table and records every address it was asked for.
    struct TableGeocoder {
        known: HashMap<&'static str, Coordinates>,
        asked: Mutex<Vec<String>>,
    }

    impl TableGeocoder {
        fn new(known: &[(&'static str, f64, f64)]) -> Arc<Self> {
            Arc::new(Self {
                known: known
                    .iter()
                    .map(|(a, lat, lng)| (*a, Coordinates { latitude: *lat, longitude: *lng }))
                    .collect(),
                asked: Mutex::new(Vec::new()),
            })
        }

        fn asked(&self) -> Vec<String> {
            self.asked.lock().unwrap().clone()
        }
    }

    impl Geocoder for TableGeocoder {
        fn lookup(&self, address: &str) -> Result<Coordinates> {
            self.asked.lock().unwrap().push(address.to_string());
            self.known
                .get(address)
                .copied()
                .ok_or_else(|| Error::ExternalLookup(format!("no match for {address:?}")))
        }
    }

    fn seed(store: &SiteStore, venues: &[&str]) {
        for (i, venue) in venues.iter().enumerate() {
            store
                .with_connection("seed", |conn| {
                    conn.execute(
                        "INSERT INTO wp_postmeta (post_id, meta_key, meta_value) VALUES (?1, ?2, ?3)",
                        params![100 + i as i64, VENUE_META_KEY, venue],
                    )
                })
                .unwrap();
        }
    }

    fn venue(store: &SiteStore, post_id: i64) -> Value {
        let raw: String = store
            .with_connection("read", |conn| {
                conn.query_row(
                    "SELECT meta_value FROM wp_postmeta WHERE post_id = ?1",
                    params![post_id],
                    |row| row.get(0),
                )
            })
            .unwrap();
        serde_json::from_str(&raw).unwrap()
    }

    #[test]
    fn failed_lookup_skips_only_that_record() {
        let store = SiteStore::in_memory(Scope::new("1", "wp_")).unwrap();
        seed(
            &store,
            &[
                r#"{"fullAddress":"1 Main St","latitude":"","longitude":""}"#,
                r#"{"fullAddress":"Nowhere","latitude":"","longitude":""}"#,
                r#"{"fullAddress":"2 High St","latitude":"0","longitude":"0"}"#,
            ],
        );
        let geocoder = TableGeocoder::new(&[("1 Main St", 40.5, -73.9), ("2 High St", 51.5, -0.1)]);
        let step = VenueCoordinatesBackfill::new(SchemaVersion::new(0, 30, 0), geocoder.clone(), 100);

        let progress = drain(&step, &store).unwrap();
        assert_eq!(progress.updated, 2);
        assert_eq!(progress.skipped, 1);
        assert_eq!(venue(&store, 100)["latitude"], 40.5);
        assert_eq!(venue(&store, 100)["longitude"], -73.9);
        assert_eq!(venue(&store, 100)["fullAddress"], "1 Main St");
        assert_eq!(venue(&store, 101)["latitude"], "");
        assert_eq!(venue(&store, 102)["latitude"], 51.5);
    }

    #[test]
    fn records_without_address_or_with_coordinates_are_left_alone() {
        let store = SiteStore::in_memory(Scope::new("1", "wp_")).unwrap();
        seed(
            &store,
            &[
                r#"{"fullAddress":"","latitude":"","longitude":""}"#,
                r#"{"fullAddress":"1 Main St","latitude":"1.0","longitude":"2.0"}"#,
                "not json",
            ],
        );
        let geocoder = TableGeocoder::new(&[("1 Main St", 40.5, -73.9)]);
        let step = VenueCoordinatesBackfill::new(SchemaVersion::new(0, 30, 0), geocoder.clone(), 100);

        step.apply(&store).unwrap();
        assert!(geocoder.asked().is_empty());
        assert_eq!(venue(&store, 101)["latitude"], "1.0");
    }

    #[test]
    fn interrupted_backfill_resumes_after_processed_records() {
        let store = SiteStore::in_memory(Scope::new("1", "wp_")).unwrap();
        seed(
            &store,
            &[
                r#"{"fullAddress":"a"}"#,
                r#"{"fullAddress":"b"}"#,
                r#"{"fullAddress":"c"}"#,
                r#"{"fullAddress":"d"}"#,
                r#"{"fullAddress":"e"}"#,
            ],
        );
        let geocoder = TableGeocoder::new(&[
            ("a", 1.0, 1.0),
            ("b", 2.0, 2.0),
            ("c", 3.0, 3.0),
            ("d", 4.0, 4.0),
            ("e", 5.0, 5.0),
        ]);
        let step = VenueCoordinatesBackfill::new(SchemaVersion::new(0, 30, 0), geocoder.clone(), 2);

        // One batch, then the process "stops".
        let first = step.process_batch(&store, 0).unwrap();
        assert_eq!(first.updated, 2);
        let before = venue(&store, 100);

        step.apply(&store).unwrap();
        assert_eq!(geocoder.asked(), ["a", "b", "c", "d", "e"]);
        assert_eq!(venue(&store, 100), before);
        assert_eq!(venue(&store, 104)["latitude"], 5.0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn nominatim_reads_geojson_coordinates() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .and(query_param("q", "10 Downing St"))
            .and(query_param("format", "geojson"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "type": "FeatureCollection",
                "features": [{
                    "type": "Feature",
                    "geometry": {"type": "Point", "coordinates": [-0.1276, 51.5034]}
                }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .and(query_param("q", "Atlantis"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "type": "FeatureCollection",
                "features": []
            })))
            .mount(&server)
            .await;

        let base = server.uri();
        let (found, missing) = tokio::task::spawn_blocking(move || {
            let geocoder = NominatimGeocoder::new(&base, Duration::from_secs(5), "driftfix-test");
            (geocoder.lookup("10 Downing St"), geocoder.lookup("Atlantis"))
        })
        .await
        .unwrap();

        let found = found.unwrap();
        assert_eq!(found.latitude, 51.5034);
        assert_eq!(found.longitude, -0.1276);
        assert!(matches!(missing, Err(Error::ExternalLookup(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn nominatim_server_error_is_an_external_lookup_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let base = server.uri();
        let result = tokio::task::spawn_blocking(move || {
            NominatimGeocoder::new(&base, Duration::from_secs(5), "driftfix-test").lookup("x")
        })
        .await
        .unwrap();
        assert!(matches!(result, Err(Error::ExternalLookup(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn nominatim_requests_are_spaced_by_the_minimum_interval() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "type": "FeatureCollection",
                "features": []
            })))
            .expect(3)
            .mount(&server)
            .await;

        let base = server.uri();
        let elapsed = tokio::task::spawn_blocking(move || {
            let geocoder = NominatimGeocoder::new(&base, Duration::from_secs(5), "driftfix-test")
                .with_min_interval(Duration::from_millis(200));
            let start = Instant::now();
            for address in ["a", "b", "c"] {
                assert!(geocoder.lookup(address).is_err());
            }
            start.elapsed()
        })
        .await
        .unwrap();

        assert!(elapsed >= Duration::from_millis(400), "took {elapsed:?}");
    }
}
