//! Current temperature lookups backed by the Open-Meteo API.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::debug;
use serde::Deserialize;
use serde_json::{Value, json};
use url::Url;

use crate::ToolImplementation;
use llmserve_common::{Parameters, Property, Tool};

pub const OPEN_METEO_GEOCODING_URL: &str = "https://geocoding-api.open-meteo.com";
pub const OPEN_METEO_FORECAST_URL: &str = "https://api.open-meteo.com";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct GeocodingResponse {
    #[serde(default)]
    results: Vec<Place>,
}

#[derive(Debug, Deserialize)]
struct Place {
    latitude: f64,
    longitude: f64,
}

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    current: CurrentWeather,
}

#[derive(Debug, Deserialize)]
struct CurrentWeather {
    temperature_2m: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unit {
    Celsius,
    Fahrenheit,
}

impl Unit {
    fn parse(unit: &str) -> Self {
        if unit.eq_ignore_ascii_case("fahrenheit") {
            Self::Fahrenheit
        } else {
            Self::Celsius
        }
    }

    const fn query_value(self) -> &'static str {
        match self {
            Self::Celsius => "celsius",
            Self::Fahrenheit => "fahrenheit",
        }
    }

    const fn symbol(self) -> &'static str {
        match self {
            Self::Celsius => "°C",
            Self::Fahrenheit => "°F",
        }
    }
}

/// Looks up the current temperature of a city.
///
/// The city name is the part of `location` before the first comma; it is
/// geocoded first, then the forecast endpoint is asked for the current
/// `temperature_2m` in the requested unit.
#[derive(Debug, Clone)]
pub struct TemperatureTool {
    client: reqwest::Client,
    geocoding_url: String,
    forecast_url: String,
}

impl Default for TemperatureTool {
    fn default() -> Self {
        Self::new()
    }
}

impl TemperatureTool {
    #[must_use]
    pub fn new() -> Self {
        Self::with_endpoints(OPEN_METEO_GEOCODING_URL, OPEN_METEO_FORECAST_URL)
    }

    /// Uses alternative Open-Meteo compatible hosts.
    pub fn with_endpoints(geocoding_url: impl Into<String>, forecast_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            geocoding_url: geocoding_url.into().trim_end_matches('/').to_string(),
            forecast_url: forecast_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: Url) -> Result<T> {
        debug!("GET {url}");
        let response = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<T>().await?)
    }

    async fn current_temperature(&self, city: &str, unit: Unit) -> Result<f64> {
        let url = Url::parse_with_params(
            &format!("{}/v1/search", self.geocoding_url),
            &[("name", city), ("count", "1"), ("format", "json")],
        )?;
        let place = self
            .get_json::<GeocodingResponse>(url)
            .await
            .context("geocoding request failed")?
            .results
            .into_iter()
            .next()
            .with_context(|| format!("no location found named '{city}'"))?;

        let url = Url::parse_with_params(
            &format!("{}/v1/forecast", self.forecast_url),
            &[
                ("latitude", place.latitude.to_string().as_str()),
                ("longitude", place.longitude.to_string().as_str()),
                ("current", "temperature_2m"),
                ("temperature_unit", unit.query_value()),
            ],
        )?;
        let forecast = self
            .get_json::<ForecastResponse>(url)
            .await
            .context("forecast request failed")?;

        Ok(forecast.current.temperature_2m)
    }
}

#[async_trait]
impl ToolImplementation for TemperatureTool {
    fn get_definition(&self) -> Tool {
        Tool::function(
            "get_current_temperature",
            "Get the current temperature for a specific location",
            Parameters::from_fields([
                (
                    "location",
                    Property::string("The city and country, e.g., 'Paris, France'"),
                    true,
                ),
                (
                    "unit",
                    Property::string_enum(
                        "The temperature unit to use (by default, celsius)",
                        vec!["celsius", "fahrenheit"],
                    )
                    .with_default("celsius"),
                    false,
                ),
            ]),
        )
    }

    async fn execute(&self, args: &Value) -> Result<Value> {
        let location = args
            .get("location")
            .and_then(Value::as_str)
            .context("Missing 'location' parameter")?;
        let unit = Unit::parse(args.get("unit").and_then(Value::as_str).unwrap_or("celsius"));

        let city = location.split(',').next().unwrap_or(location).trim();
        let temperature = self
            .current_temperature(city, unit)
            .await
            .with_context(|| format!("Unable to get temperature for {location}"))?;

        Ok(json!(format!(
            "The current temperature in {location} is {temperature:.1}{}",
            unit.symbol()
        )))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn mock_open_meteo() -> MockServer {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/v1/search"))
            .and(query_param("name", "Tokyo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [{"name": "Tokyo", "latitude": 35.6895, "longitude": 139.6917, "country": "Japan"}]
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/v1/search"))
            .and(query_param("name", "Atlantis"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"generationtime_ms": 0.5})))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/v1/forecast"))
            .and(query_param("temperature_unit", "celsius"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "current_units": {"temperature_2m": "°C"},
                "current": {"time": "2025-01-01T12:00", "interval": 900, "temperature_2m": 18.44}
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/v1/forecast"))
            .and(query_param("temperature_unit", "fahrenheit"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "current": {"temperature_2m": 65.2}
            })))
            .mount(&server)
            .await;

        server
    }

    #[tokio::test]
    async fn test_temperature_celsius() {
        let server = mock_open_meteo().await;
        let tool = TemperatureTool::with_endpoints(server.uri(), server.uri());

        let value = tool
            .execute(&json!({"location": "Tokyo, Japan"}))
            .await
            .unwrap();
        assert_eq!(value, json!("The current temperature in Tokyo, Japan is 18.4°C"));
    }

    #[tokio::test]
    async fn test_temperature_fahrenheit() {
        let server = mock_open_meteo().await;
        let tool = TemperatureTool::with_endpoints(server.uri(), server.uri());

        let value = tool
            .execute(&json!({"location": "Tokyo", "unit": "fahrenheit"}))
            .await
            .unwrap();
        assert_eq!(value, json!("The current temperature in Tokyo is 65.2°F"));
    }

    #[tokio::test]
    async fn test_temperature_unknown_city() {
        let server = mock_open_meteo().await;
        let tool = TemperatureTool::with_endpoints(server.uri(), server.uri());

        let err = tool
            .execute(&json!({"location": "Atlantis"}))
            .await
            .unwrap_err();
        let message = format!("{err:#}");
        assert!(message.starts_with("Unable to get temperature for Atlantis"), "{message}");
        assert!(message.contains("no location found"), "{message}");
    }

    #[tokio::test]
    async fn test_temperature_backend_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let tool = TemperatureTool::with_endpoints(server.uri(), server.uri());

        assert!(tool.execute(&json!({"location": "Tokyo"})).await.is_err());
    }
}
