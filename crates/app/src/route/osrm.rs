//! Path service backed by an OSRM HTTP endpoint.

use std::future::Future;

use geo_core::Coordinate;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::route::{RouteError, TravelMode};

/// Public OSRM demo server.
pub const DEFAULT_OSRM_URL: &str = "https://router.project-osrm.org";

/// Ordered waypoints in, dense polyline out.
pub trait RoutingService: Send + Sync + 'static {
    fn route(
        &self,
        waypoints: &[Coordinate],
        mode: TravelMode,
    ) -> impl Future<Output = Result<Vec<Coordinate>, RouteError>> + Send;
}

#[derive(Clone, Debug)]
pub struct OsrmClient {
    http: Client,
    base_url: String,
}

impl OsrmClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// `GET {base}/route/v1/{profile}/{lng,lat;...}?overview=full&geometries=geojson`
pub fn route_url(base_url: &str, waypoints: &[Coordinate], mode: TravelMode) -> String {
    let coordinates = waypoints
        .iter()
        .map(|point| format!("{},{}", point.longitude, point.latitude))
        .collect::<Vec<_>>()
        .join(";");
    format!(
        "{}/route/v1/{}/{coordinates}?overview=full&geometries=geojson",
        base_url.trim_end_matches('/'),
        mode.osrm_profile()
    )
}

#[derive(Debug, Deserialize)]
struct OsrmResponse {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    routes: Vec<OsrmRoute>,
}

#[derive(Debug, Deserialize)]
struct OsrmRoute {
    geometry: OsrmGeometry,
}

#[derive(Debug, Deserialize)]
struct OsrmGeometry {
    /// GeoJSON order: `[lng, lat]`.
    coordinates: Vec<[f64; 2]>,
}

/// Extract the first route's polyline from an OSRM response body.
pub fn parse_route(body: &str) -> Result<Vec<Coordinate>, RouteError> {
    let response: OsrmResponse = serde_json::from_str(body)
        .map_err(|err| RouteError::Routing(format!("malformed routing response: {err}")))?;
    if let Some(code) = response.code.as_deref().filter(|code| *code != "Ok") {
        let detail = response.message.as_deref().unwrap_or("no details");
        return Err(RouteError::Routing(format!("{code}: {detail}")));
    }
    let route = response
        .routes
        .into_iter()
        .next()
        .ok_or_else(|| RouteError::Routing("no route found".into()))?;
    let path: Vec<Coordinate> = route
        .geometry
        .coordinates
        .into_iter()
        .map(|[lng, lat]| Coordinate::new(lat, lng))
        .collect();
    if path.len() < 2 {
        return Err(RouteError::Routing(format!(
            "route has {} point(s), need at least 2",
            path.len()
        )));
    }
    Ok(path)
}

impl RoutingService for OsrmClient {
    async fn route(
        &self,
        waypoints: &[Coordinate],
        mode: TravelMode,
    ) -> Result<Vec<Coordinate>, RouteError> {
        let url = route_url(&self.base_url, waypoints, mode);
        debug!(%url, "requesting route");
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|err| RouteError::Routing(format!("routing request failed: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(RouteError::Routing(format!(
                "routing service returned {status}"
            )));
        }
        let body = response
            .text()
            .await
            .map_err(|err| RouteError::Routing(format!("failed to read routing response: {err}")))?;
        parse_route(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_lists_lng_lat_pairs_and_profile() {
        let waypoints = [Coordinate::new(59.33, 18.07), Coordinate::new(59.86, 17.64)];
        assert_eq!(
            route_url("https://osrm.example/", &waypoints, TravelMode::Walking),
            "https://osrm.example/route/v1/foot/18.07,59.33;17.64,59.86?overview=full&geometries=geojson"
        );
        assert!(
            route_url("https://osrm.example", &waypoints, TravelMode::Custom)
                .contains("/route/v1/driving/")
        );
    }

    #[test]
    fn geometry_is_converted_to_lat_lng() {
        let body = r#"{"code":"Ok","routes":[{"geometry":{"type":"LineString","coordinates":[[18.07,59.33],[18.08,59.34],[17.64,59.86]]}}]}"#;
        let path = parse_route(body).unwrap();
        assert_eq!(path.len(), 3);
        assert_eq!(path[0], Coordinate::new(59.33, 18.07));
        assert_eq!(path[2], Coordinate::new(59.86, 17.64));
    }

    #[test]
    fn missing_or_degenerate_routes_are_failures() {
        for body in [
            r#"{"code":"NoRoute","message":"Impossible route between points","routes":[]}"#,
            r#"{"code":"Ok","routes":[]}"#,
            r#"{"code":"Ok","routes":[{"geometry":{"coordinates":[[1.0,2.0]]}}]}"#,
            "<html>bad gateway</html>",
        ] {
            assert!(
                matches!(parse_route(body), Err(RouteError::Routing(_))),
                "{body} should fail"
            );
        }
    }

    #[test]
    fn client_trims_trailing_slash() {
        assert_eq!(OsrmClient::new("http://localhost:5000/").base_url(), "http://localhost:5000");
    }
}
