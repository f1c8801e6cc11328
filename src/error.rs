use axum::{
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};

#[derive(Debug)]
pub enum GatewayError {
    UnsupportedMediaType,
    InvalidBody,
    RateLimited { retry_after_secs: u64 },
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnsupportedMediaType => "unsupported_media_type",
            Self::InvalidBody => "invalid_body",
            Self::RateLimited { .. } => "rate_limited",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::UnsupportedMediaType => "Content-Type debe ser application/json",
            Self::InvalidBody => "Solicitud inválida",
            Self::RateLimited { .. } => "Demasiadas peticiones. Por favor, espere un minuto.",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::InvalidBody => StatusCode::BAD_REQUEST,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let mut response = (self.status(), self.message()).into_response();

        if let Self::RateLimited { retry_after_secs } = self {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}
