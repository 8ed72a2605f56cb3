pub mod auth;
pub mod files;
pub mod health;
pub mod shares;

use crate::services::forensic::RequestMeta;
use axum::http::HeaderMap;

/// Client metadata for the forensic trail. The first hop in
/// X-Forwarded-For wins when a proxy is in front.
pub fn request_meta(headers: &HeaderMap) -> RequestMeta {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    };

    let ip = header("x-forwarded-for")
        .map(|v| v.split(',').next().unwrap_or("").trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| header("x-real-ip"));

    RequestMeta {
        ip,
        user_agent: header("user-agent"),
        referer: header("referer"),
        language: header("accept-language"),
    }
}
