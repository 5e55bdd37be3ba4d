//! Weather passthrough for clients without their own API key.
//!
//! The gateway holds the third-party key and forwards the query; the
//! upstream response body is returned as-is so clients see the provider's
//! native shape.

use actix_web::{web, HttpResponse};
use serde::Deserialize;
use tracing::warn;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct WeatherQuery {
    pub city: String,
}

pub async fn current_weather(
    state: web::Data<AppState>,
    query: web::Query<WeatherQuery>,
) -> AppResult<HttpResponse> {
    let api_key = state
        .get_config()
        .weather
        .api_key
        .ok_or_else(|| AppError::ConfigError("Weather API key not configured".to_string()))?;

    let city = query.city.trim();
    if city.is_empty() {
        return Err(AppError::BadRequest(
            "Query parameter 'city' must not be empty".to_string(),
        ));
    }

    let response = state
        .http
        .get("https://api.weatherapi.com/v1/current.json")
        .query(&[("key", api_key.as_str()), ("q", city)])
        .send()
        .await?;

    let status = response.status();
    if status.is_success() {
        let body: serde_json::Value = response.json().await?;
        return Ok(HttpResponse::Ok().json(body));
    }

    warn!(city = %city, status = %status, "Weather upstream refused request");
    match status.as_u16() {
        401 | 403 => Err(AppError::Upstream(
            "Weather service rejected the API key".to_string(),
        )),
        400 => Err(AppError::NotFound(format!(
            "No weather data found for '{}'",
            city
        ))),
        _ => Err(AppError::Upstream(format!(
            "Weather service error: {}",
            status
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_missing_api_key_is_a_config_error() {
        let state = AppState::new(crate::config::AppConfig::default());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/weather", web::get().to(current_weather)),
        )
        .await;

        let req = test::TestRequest::get()
            .uri("/weather?city=Lisbon")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status().as_u16(), 500);
    }

    #[actix_web::test]
    async fn test_empty_city_is_rejected() {
        let mut config = crate::config::AppConfig::default();
        config.weather.api_key = Some("k".to_string());
        let state = AppState::new(config);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/weather", web::get().to(current_weather)),
        )
        .await;

        let req = test::TestRequest::get()
            .uri("/weather?city=%20")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status().as_u16(), 400);
    }
}
