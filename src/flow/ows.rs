//! OWS request classification.
//!
//! Requests are classified from their KVP parameters (`service`, `request`,
//! `outputFormat`), falling back to the endpoint path for the service.

use axum::http::request::Parts;
use std::fmt;
use url::form_urlencoded;

/// Path segments that name an OWS service endpoint.
const SERVICE_ENDPOINTS: &[&str] = &["wms", "wfs", "wcs", "wps", "wmts", "csw"];

/// Parameters consulted, in order, for the output format.
const FORMAT_PARAMS: &[&str] = &["outputformat", "format", "info_format"];

/// The service, operation and output format of an OWS request.
///
/// All values are lower-cased.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OwsRequest {
    pub service: Option<String>,
    pub request: Option<String>,
    pub output_format: Option<String>,
}

impl OwsRequest {
    pub fn new(service: &str, request: Option<&str>, output_format: Option<&str>) -> Self {
        Self {
            service: Some(service.to_ascii_lowercase()),
            request: request.map(str::to_ascii_lowercase),
            output_format: output_format.map(str::to_ascii_lowercase),
        }
    }

    /// Classify a request from its URI.
    pub fn from_parts(parts: &Parts) -> Self {
        Self::from_path_and_query(parts.uri.path(), parts.uri.query())
    }

    pub fn from_path_and_query(path: &str, query: Option<&str>) -> Self {
        let mut service = None;
        let mut request = None;
        let mut formats: [Option<String>; 3] = Default::default();

        let pairs = query
            .into_iter()
            .flat_map(|q| form_urlencoded::parse(q.as_bytes()));
        for (key, value) in pairs {
            if value.is_empty() {
                continue;
            }
            let key = key.to_ascii_lowercase();
            let value = value.to_ascii_lowercase();
            match key.as_str() {
                "service" => service = Some(value),
                "request" => request = Some(value),
                other => {
                    if let Some(idx) = FORMAT_PARAMS.iter().position(|p| *p == other) {
                        formats[idx] = Some(value);
                    }
                }
            }
        }

        if service.is_none() {
            service = path
                .rsplit('/')
                .find(|segment| !segment.is_empty())
                .map(str::to_ascii_lowercase)
                .filter(|segment| SERVICE_ENDPOINTS.contains(&segment.as_str()));
        }

        Self {
            service,
            request,
            output_format: formats.into_iter().flatten().next(),
        }
    }

    /// True when the request targets an OWS service at all.
    pub fn is_ows(&self) -> bool {
        self.service.is_some()
    }
}

impl fmt::Display for OwsRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}",
            self.service.as_deref().unwrap_or("*"),
            self.request.as_deref().unwrap_or("*"),
            self.output_format.as_deref().unwrap_or("*")
        )
    }
}

/// Matches OWS requests on `service[.request[.format]]`.
///
/// Missing trailing parts match anything. The format is everything after the
/// second dot, so formats such as `application/vnd.google-earth.kml+xml` work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwsMatcher {
    service: String,
    request: Option<String>,
    output_format: Option<String>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid OWS matcher '{0}': expected service[.request[.format]]")]
pub struct MatcherError(pub String);

impl OwsMatcher {
    pub fn parse(pattern: &str) -> Result<Self, MatcherError> {
        let pattern = pattern.trim();
        let mut parts = pattern.splitn(3, '.');
        let service = match parts.next() {
            Some(s) if !s.is_empty() => s.to_ascii_lowercase(),
            _ => return Err(MatcherError(pattern.to_string())),
        };
        let request = parts.next().map(str::to_ascii_lowercase);
        let output_format = parts.next().map(str::to_ascii_lowercase);

        if request.as_deref() == Some("") || output_format.as_deref() == Some("") {
            return Err(MatcherError(pattern.to_string()));
        }

        Ok(Self {
            service,
            request,
            output_format,
        })
    }

    pub fn matches(&self, ows: &OwsRequest) -> bool {
        fn part(expected: &Option<String>, actual: &Option<String>) -> bool {
            match expected {
                None => true,
                Some(e) => actual.as_deref() == Some(e.as_str()),
            }
        }

        ows.service.as_deref() == Some(self.service.as_str())
            && part(&self.request, &ows.request)
            && part(&self.output_format, &ows.output_format)
    }
}

impl fmt::Display for OwsMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.service)?;
        if let Some(r) = &self.request {
            write!(f, ".{}", r)?;
        }
        if let Some(o) = &self.output_format {
            write!(f, ".{}", o)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_kvp_case_insensitively() {
        let ows = OwsRequest::from_path_and_query(
            "/geoserver/ows",
            Some("SERVICE=WMS&Request=GetMap&FORMAT=image%2Fpng&layers=a"),
        );
        assert_eq!(ows, OwsRequest::new("wms", Some("getmap"), Some("image/png")));
    }

    #[test]
    fn decodes_plus_and_percent_escapes() {
        let ows = OwsRequest::from_path_and_query(
            "/ows",
            Some("service=wfs&request=GetFeature&outputFormat=application%2Fjson%3B+subtype%3Dgeojson&&bare"),
        );
        assert_eq!(ows.output_format.as_deref(), Some("application/json; subtype=geojson"));
        assert_eq!(ows.request.as_deref(), Some("getfeature"));
    }

    #[test]
    fn output_format_wins_over_format() {
        let ows = OwsRequest::from_path_and_query(
            "/wfs",
            Some("format=text/xml&outputFormat=application/json&request=GetFeature"),
        );
        assert_eq!(ows.output_format.as_deref(), Some("application/json"));
        assert_eq!(ows.service.as_deref(), Some("wfs"));
    }

    #[test]
    fn infers_service_from_path() {
        let ows = OwsRequest::from_path_and_query("/geoserver/wms/", Some("request=GetCapabilities"));
        assert_eq!(ows.service.as_deref(), Some("wms"));

        let static_file = OwsRequest::from_path_and_query("/web/index.html", None);
        assert!(!static_file.is_ows());
    }

    #[test]
    fn matcher_with_missing_parts_matches_anything() {
        let any_wms = OwsMatcher::parse("WMS").unwrap();
        let getmap = OwsMatcher::parse("wms.getmap").unwrap();
        let png = OwsMatcher::parse("wms.getmap.image/png").unwrap();

        let req = OwsRequest::new("wms", Some("GetMap"), Some("image/png"));
        assert!(any_wms.matches(&req));
        assert!(getmap.matches(&req));
        assert!(png.matches(&req));

        let jpeg = OwsRequest::new("wms", Some("getmap"), Some("image/jpeg"));
        assert!(!png.matches(&jpeg));
        assert!(!getmap.matches(&OwsRequest::new("wfs", Some("getmap"), None)));
    }

    #[test]
    fn matcher_format_may_contain_dots() {
        let kml = OwsMatcher::parse("wms.getmap.application/vnd.google-earth.kml+xml").unwrap();
        let req = OwsRequest::new(
            "wms",
            Some("getmap"),
            Some("application/vnd.google-earth.kml+xml"),
        );
        assert!(kml.matches(&req));
    }

    #[test]
    fn rejects_malformed_matchers() {
        assert!(OwsMatcher::parse("").is_err());
        assert!(OwsMatcher::parse("wms..png").is_err());
        assert!(OwsMatcher::parse("wms.").is_err());
    }
}
