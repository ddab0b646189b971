use std::sync::{Arc, LazyLock};
use std::time::Duration;

use rand::Rng;
use regex::Regex;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{CityScope, Geocoder};
use crate::errors::AppError;
use crate::models::{Coordinate, Itinerary, ItineraryPoint};

/// Parenthetical qualifiers, ASCII or full-width, e.g. `雷峰塔(门票)` or `楼外楼（孤山路店）`.
static PARENTHETICAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[(（].*?[)）]").expect("Invalid parenthetical regex"));

/// Strips parenthetical qualifiers from a place name.
pub fn clean_poi_name(name: &str) -> String {
    PARENTHETICAL.replace_all(name, "").trim().to_string()
}

/// Pacing and fallback tuning for one geocoding vendor.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichmentPolicy {
    /// Pause after every lookup call, hit or miss.
    pub lookup_delay: Duration,
    /// One-off wait for a geocoder that is not ready yet.
    pub readiness_wait: Duration,
    /// Max offset per axis, in degrees, for points placed near the last hit.
    pub jitter_degrees: f64,
}

impl Default for EnrichmentPolicy {
    fn default() -> Self {
        Self {
            lookup_delay: Duration::from_millis(150),
            readiness_wait: Duration::from_secs(1),
            jitter_degrees: 0.0025,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    Name,
    CleanedName,
    Address,
    CityCenter,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Resolution {
    Found(Coordinate, Strategy),
    NearLastKnown(Coordinate),
    Unresolved,
}

/// Resolves itinerary points to coordinates, one lookup at a time.
pub struct GeocodingEnricher {
    geocoder: Arc<dyn Geocoder>,
    policy: EnrichmentPolicy,
    /// Held for a whole itinerary so runs from different sessions never interleave.
    gate: Mutex<()>,
}

impl GeocodingEnricher {
    pub fn new(geocoder: Arc<dyn Geocoder>, policy: EnrichmentPolicy) -> Self {
        Self { geocoder, policy, gate: Mutex::new(()) }
    }

    /// Fills in every point's coordinates on a best-effort basis.
    ///
    /// Never fails: point count and order are preserved, and a point nothing
    /// could place is left at the unresolved sentinel. If the geocoder is still
    /// unavailable after the readiness wait, the itinerary is returned untouched.
    pub async fn enrich(&self, mut itinerary: Itinerary, default_city: Option<&str>) -> Itinerary {
        if !self.wait_until_ready().await {
            warn!("Geocoder not ready; returning itinerary without coordinates");
            return itinerary;
        }

        let _gate = self.gate.lock().await;
        let mut last_known: Option<Coordinate> = None;
        let mut resolved = 0usize;

        for point in &mut itinerary.points {
            let mut lookups = 0usize;
            let resolution = self.resolve(point, default_city, last_known, &mut lookups).await;
            if lookups == 0 {
                // Every point is paced, even one settled without a call.
                self.pace().await;
            }
            match resolution {
                Resolution::Found(coordinate, strategy) => {
                    debug!("Found [{}] via {strategy:?}", point.name);
                    point.set_coordinate(coordinate);
                    last_known = Some(coordinate);
                    resolved += 1;
                }
                Resolution::NearLastKnown(coordinate) => {
                    debug!("Placed [{}] near last resolved point", point.name);
                    point.set_coordinate(coordinate);
                }
                Resolution::Unresolved => {
                    let guess = point.coordinate();
                    if guess.is_unresolved() {
                        debug!("Could not place [{}]", point.name);
                    } else {
                        debug!("Could not place [{}]; dropping model guess {guess:?}", point.name);
                    }
                    point.set_coordinate(Coordinate::UNRESOLVED);
                }
            }
        }

        info!("Geocoded {resolved}/{} itinerary points", itinerary.points.len());
        itinerary
    }

    async fn wait_until_ready(&self) -> bool {
        if self.geocoder.is_ready().await {
            return true;
        }
        debug!("Geocoder not ready, waiting {:?}", self.policy.readiness_wait);
        tokio::time::sleep(self.policy.readiness_wait).await;
        self.geocoder.is_ready().await
    }

    async fn resolve(
        &self,
        point: &ItineraryPoint,
        default_city: Option<&str>,
        last_known: Option<Coordinate>,
        lookups: &mut usize,
    ) -> Resolution {
        let city = effective_city(point, default_city);
        let scope = CityScope::from_optional(city);

        if let Some(c) = self.keyword(&point.name, &scope, lookups).await {
            return Resolution::Found(c, Strategy::Name);
        }

        let cleaned = clean_poi_name(&point.name);
        if cleaned != point.name {
            if let Some(c) = self.keyword(&cleaned, &scope, lookups).await {
                return Resolution::Found(c, Strategy::CleanedName);
            }
        }

        if let Some(address) = point.address.as_deref() {
            if let Some(c) = self.address(address, lookups).await {
                return Resolution::Found(c, Strategy::Address);
            }
        }

        if let Some(city) = city {
            if let Some(c) = self.keyword(city, &CityScope::City(city.to_string()), lookups).await {
                return Resolution::Found(c, Strategy::CityCenter);
            }
        }

        match last_known {
            Some(anchor) => Resolution::NearLastKnown(self.jitter(anchor)),
            None => Resolution::Unresolved,
        }
    }

    async fn keyword(&self, keyword: &str, scope: &CityScope, lookups: &mut usize) -> Option<Coordinate> {
        let keyword = keyword.trim();
        if keyword.is_empty() {
            return None;
        }
        *lookups += 1;
        let result = self.geocoder.search_by_keyword(keyword, scope).await;
        self.pace().await;
        accept(result, keyword)
    }

    async fn address(&self, address: &str, lookups: &mut usize) -> Option<Coordinate> {
        let address = address.trim();
        if address.is_empty() {
            return None;
        }
        *lookups += 1;
        let result = self.geocoder.search_by_address(address).await;
        self.pace().await;
        accept(result, address)
    }

    async fn pace(&self) {
        tokio::time::sleep(self.policy.lookup_delay).await;
    }

    fn jitter(&self, anchor: Coordinate) -> Coordinate {
        let spread = self.policy.jitter_degrees.abs();
        let mut rng = rand::thread_rng();
        Coordinate::new(
            anchor.lat + rng.gen_range(-spread..=spread),
            anchor.lng + rng.gen_range(-spread..=spread),
        )
    }
}

/// Point city first, then the caller's default; blanks count as absent.
fn effective_city<'a>(point: &'a ItineraryPoint, default_city: Option<&'a str>) -> Option<&'a str> {
    let non_blank = |c: &'a str| {
        let c = c.trim();
        (!c.is_empty()).then_some(c)
    };
    point.city.as_deref().and_then(non_blank).or_else(|| default_city.and_then(non_blank))
}

/// Lookup errors and sentinel answers both count as "not found".
fn accept(result: Result<Option<Coordinate>, AppError>, query: &str) -> Option<Coordinate> {
    match result {
        Ok(Some(c)) if !c.is_unresolved() => Some(c),
        Ok(_) => None,
        Err(e) => {
            warn!("Geocoding lookup for '{query}' failed: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use tokio::time::Instant;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Keyword(String, CityScope),
        Address(String),
    }

    #[derive(Default)]
    struct FakeGeocoder {
        keywords: HashMap<String, Coordinate>,
        addresses: HashMap<String, Coordinate>,
        failing: Vec<String>,
        not_ready_checks: AtomicUsize,
        never_ready: AtomicBool,
        calls: StdMutex<Vec<(Call, Instant, Instant)>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl FakeGeocoder {
        fn with_keyword(mut self, keyword: &str, lat: f64, lng: f64) -> Self {
            self.keywords.insert(keyword.to_string(), Coordinate::new(lat, lng));
            self
        }

        fn with_address(mut self, address: &str, lat: f64, lng: f64) -> Self {
            self.addresses.insert(address.to_string(), Coordinate::new(lat, lng));
            self
        }

        fn failing_on(mut self, query: &str) -> Self {
            self.failing.push(query.to_string());
            self
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().iter().map(|(c, _, _)| c.clone()).collect()
        }

        async fn record(&self, call: Call, query: &str, hit: Option<Coordinate>) -> Result<Option<Coordinate>, AppError> {
            let started = Instant::now();
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.calls.lock().unwrap().push((call, started, Instant::now()));

            if self.failing.iter().any(|f| f == query) {
                return Err(AppError::GeocodingRejected { info: "SERVICE_NOT_AVAILABLE".into() });
            }
            Ok(hit)
        }
    }

    #[async_trait]
    impl Geocoder for FakeGeocoder {
        async fn is_ready(&self) -> bool {
            if self.never_ready.load(Ordering::SeqCst) {
                return false;
            }
            // Report "not ready" for the configured number of checks first.
            self.not_ready_checks
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_err()
        }

        async fn search_by_keyword(&self, keyword: &str, scope: &CityScope) -> Result<Option<Coordinate>, AppError> {
            let hit = self.keywords.get(keyword).copied();
            self.record(Call::Keyword(keyword.to_string(), scope.clone()), keyword, hit).await
        }

        async fn search_by_address(&self, address: &str) -> Result<Option<Coordinate>, AppError> {
            let hit = self.addresses.get(address).copied();
            self.record(Call::Address(address.to_string()), address, hit).await
        }
    }

    fn point(name: &str, city: Option<&str>, address: Option<&str>) -> ItineraryPoint {
        ItineraryPoint {
            city: city.map(str::to_string),
            address: address.map(str::to_string),
            ..ItineraryPoint::named(name)
        }
    }

    fn enricher(geocoder: Arc<FakeGeocoder>) -> GeocodingEnricher {
        GeocodingEnricher::new(geocoder, EnrichmentPolicy::default())
    }

    fn hangzhou() -> CityScope {
        CityScope::City("杭州市".into())
    }

    #[test]
    fn clean_name_strips_ascii_and_full_width_parentheses() {
        assert_eq!(clean_poi_name("雷峰塔(门票)"), "雷峰塔");
        assert_eq!(clean_poi_name("楼外楼（孤山路店）"), "楼外楼");
        assert_eq!(clean_poi_name("West Lake (Xihu) Park"), "West Lake  Park");
        assert_eq!(clean_poi_name("灵隐寺"), "灵隐寺");
    }

    #[tokio::test(start_paused = true)]
    async fn name_lookup_wins_and_skips_remaining_strategies() {
        let geo = Arc::new(FakeGeocoder::default().with_keyword("雷峰塔", 30.23, 120.15));
        let itinerary = Itinerary::new(vec![point("雷峰塔", Some("杭州市"), Some("南山路15号"))]);

        let out = enricher(geo.clone()).enrich(itinerary, None).await;

        assert_eq!(out.points[0].coordinate(), Coordinate::new(30.23, 120.15));
        assert_eq!(geo.calls(), vec![Call::Keyword("雷峰塔".into(), hangzhou())]);
    }

    #[tokio::test(start_paused = true)]
    async fn cleaned_name_resolves_before_address_or_city() {
        let geo = Arc::new(
            FakeGeocoder::default()
                .with_keyword("雷峰塔", 30.23, 120.15)
                .with_keyword("杭州市", 30.27, 120.16)
                .with_address("南山路15号", 31.0, 121.0),
        );
        let itinerary = Itinerary::new(vec![point("雷峰塔(门票)", Some("杭州市"), Some("南山路15号"))]);

        let out = enricher(geo.clone()).enrich(itinerary, None).await;

        assert_eq!(out.points[0].coordinate(), Coordinate::new(30.23, 120.15));
        assert_eq!(
            geo.calls(),
            vec![
                Call::Keyword("雷峰塔(门票)".into(), hangzhou()),
                Call::Keyword("雷峰塔".into(), hangzhou()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_name_is_not_searched_twice() {
        let geo = Arc::new(FakeGeocoder::default().with_address("西湖区孤山路30号", 30.25, 120.14));
        let itinerary = Itinerary::new(vec![point("楼外楼", Some("杭州市"), Some("西湖区孤山路30号"))]);

        let out = enricher(geo.clone()).enrich(itinerary, None).await;

        assert_eq!(out.points[0].coordinate(), Coordinate::new(30.25, 120.14));
        assert_eq!(
            geo.calls(),
            vec![
                Call::Keyword("楼外楼".into(), hangzhou()),
                Call::Address("西湖区孤山路30号".into()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn city_center_fallback_uses_default_city() {
        let geo = Arc::new(FakeGeocoder::default().with_keyword("杭州市", 30.27, 120.16));
        let itinerary = Itinerary::new(vec![point("某不知名小店", None, None)]);

        let out = enricher(geo.clone()).enrich(itinerary, Some("杭州市")).await;

        assert_eq!(out.points[0].coordinate(), Coordinate::new(30.27, 120.16));
        assert_eq!(
            geo.calls(),
            vec![
                Call::Keyword("某不知名小店".into(), hangzhou()),
                Call::Keyword("杭州市".into(), hangzhou()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn no_city_anywhere_searches_nationwide_and_skips_city_center() {
        let geo = Arc::new(FakeGeocoder::default());
        let itinerary = Itinerary::new(vec![point("无名景点", None, None)]);

        let out = enricher(geo.clone()).enrich(itinerary, Some("  ")).await;

        assert!(out.points[0].coordinate().is_unresolved());
        assert_eq!(geo.calls(), vec![Call::Keyword("无名景点".into(), CityScope::Nationwide)]);
    }

    #[tokio::test(start_paused = true)]
    async fn unresolvable_point_lands_near_last_resolved_one() {
        let geo = Arc::new(FakeGeocoder::default().with_keyword("断桥", 30.0, 120.0));
        let itinerary = Itinerary::new(vec![point("断桥", None, None), point("无名小吃", None, None)]);

        let out = enricher(geo).enrich(itinerary, None).await;

        let second = out.points[1].coordinate();
        assert!(!second.is_unresolved());
        assert!((second.lat - 30.0).abs() <= 0.0025);
        assert!((second.lng - 120.0).abs() <= 0.0025);
    }

    #[tokio::test(start_paused = true)]
    async fn jittered_points_never_seed_later_points() {
        let geo = Arc::new(FakeGeocoder::default().with_keyword("断桥", 30.0, 120.0));
        let policy = EnrichmentPolicy { jitter_degrees: 1.0, ..EnrichmentPolicy::default() };
        let enricher = GeocodingEnricher::new(geo, policy);

        for _ in 0..100 {
            let itinerary = Itinerary::new(vec![
                point("断桥", None, None),
                point("无名一", None, None),
                point("无名二", None, None),
                point("无名三", None, None),
            ]);
            let out = enricher.enrich(itinerary, None).await;
            for p in &out.points[1..] {
                assert!((p.lat - 30.0).abs() <= 1.0, "{} drifted to {}", p.name, p.lat);
                assert!((p.lng - 120.0).abs() <= 1.0, "{} drifted to {}", p.name, p.lng);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn without_prior_hit_point_stays_at_sentinel_even_if_model_guessed() {
        let geo = Arc::new(FakeGeocoder::default().with_keyword("灵隐寺", 30.24, 120.10));
        let mut guessed = point("无名景点", None, None);
        guessed.set_coordinate(Coordinate::new(31.0, 121.0));
        let itinerary = Itinerary::new(vec![guessed, point("灵隐寺", None, None), point("另一个", None, None)]);

        let out = enricher(geo).enrich(itinerary, None).await;

        assert_eq!(out.points.len(), 3);
        assert_eq!(out.points[0].name, "无名景点");
        assert_eq!(out.points[0].coordinate(), Coordinate::UNRESOLVED);
        assert_eq!(out.points[1].coordinate(), Coordinate::new(30.24, 120.10));
        assert!((out.points[2].lat - 30.24).abs() <= 0.0025);
    }

    #[tokio::test(start_paused = true)]
    async fn lookup_errors_fall_through_to_next_strategy() {
        let geo = Arc::new(
            FakeGeocoder::default()
                .failing_on("雷峰塔")
                .with_address("南山路15号", 30.23, 120.15),
        );
        let itinerary = Itinerary::new(vec![point("雷峰塔", Some("杭州市"), Some("南山路15号"))]);

        let out = enricher(geo).enrich(itinerary, None).await;

        assert_eq!(out.points[0].coordinate(), Coordinate::new(30.23, 120.15));
    }

    #[tokio::test(start_paused = true)]
    async fn sentinel_answers_count_as_not_found() {
        let geo = Arc::new(
            FakeGeocoder::default()
                .with_keyword("北极点", 0.0, 0.0)
                .with_keyword("杭州市", 30.27, 120.16),
        );
        let itinerary = Itinerary::new(vec![point("北极点", Some("杭州市"), None)]);

        let out = enricher(geo).enrich(itinerary, None).await;

        assert_eq!(out.points[0].coordinate(), Coordinate::new(30.27, 120.16));
    }

    #[tokio::test(start_paused = true)]
    async fn lookups_are_serialized_and_paced() {
        let geo = Arc::new(FakeGeocoder::default().with_keyword("杭州市", 30.27, 120.16));
        let points = (0..4).map(|i| point(&format!("店{i}(分店)"), Some("杭州市"), Some("某路"))).collect();

        let out = enricher(geo.clone()).enrich(Itinerary::new(points), None).await;

        assert_eq!(out.points.len(), 4);
        assert_eq!(geo.max_in_flight.load(Ordering::SeqCst), 1);
        let calls = geo.calls.lock().unwrap();
        // name, cleaned name, address, city center per point
        assert_eq!(calls.len(), 16);
        for pair in calls.windows(2) {
            let (_, _, prev_end) = &pair[0];
            let (_, next_start, _) = &pair[1];
            assert!(*next_start >= *prev_end + Duration::from_millis(150));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn point_settled_without_a_call_is_still_paced() {
        let geo = Arc::new(FakeGeocoder::default().with_keyword("断桥", 30.0, 120.0));
        let itinerary = Itinerary::new(vec![point("断桥", None, None), point("  ", None, None)]);
        let started = Instant::now();

        let out = enricher(geo.clone()).enrich(itinerary, None).await;

        assert_eq!(geo.calls(), vec![Call::Keyword("断桥".into(), CityScope::Nationwide)]);
        assert!(!out.points[1].coordinate().is_unresolved());
        // one 20ms call plus a pause after each of the two points
        assert!(started.elapsed() >= Duration::from_millis(20 + 150 * 2));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_itineraries_do_not_interleave() {
        let geo = Arc::new(FakeGeocoder::default().with_keyword("杭州市", 30.27, 120.16));
        let enricher = Arc::new(enricher(geo.clone()));
        let make = || Itinerary::new(vec![point("甲", Some("杭州市"), None), point("乙", Some("杭州市"), None)]);

        let (a, b) = tokio::join!(enricher.enrich(make(), None), enricher.enrich(make(), None));

        assert_eq!(a.points.len(), 2);
        assert_eq!(b.points.len(), 2);
        assert_eq!(geo.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_once_for_readiness_then_proceeds() {
        let geo = Arc::new(FakeGeocoder {
            not_ready_checks: AtomicUsize::new(1),
            ..FakeGeocoder::default().with_keyword("西湖", 30.25, 120.14)
        });
        let started = Instant::now();

        let out = enricher(geo).enrich(Itinerary::new(vec![point("西湖", None, None)]), None).await;

        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(out.points[0].coordinate(), Coordinate::new(30.25, 120.14));
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_geocoder_returns_itinerary_untouched() {
        let geo = Arc::new(FakeGeocoder {
            never_ready: AtomicBool::new(true),
            ..FakeGeocoder::default().with_keyword("西湖", 30.25, 120.14)
        });
        let mut guessed = point("西湖", None, None);
        guessed.set_coordinate(Coordinate::new(30.0, 120.0));
        let itinerary = Itinerary::new(vec![guessed]);

        let out = enricher(geo.clone()).enrich(itinerary.clone(), None).await;

        assert_eq!(out, itinerary);
        assert!(geo.calls().is_empty());
    }
}
