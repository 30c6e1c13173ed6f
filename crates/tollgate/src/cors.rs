//! CORS configuration for the proxy ingress.

use actix_cors::Cors;
use actix_web::http::header;

/// Build the CORS middleware from the configured origin allow-list.
///
/// `*` allows any origin; the response always echoes the specific request
/// origin rather than the wildcard. An empty allow-list means CORS handling
/// is disabled entirely and the middleware is not mounted.
pub fn build_cors(allowed_origins: &[String]) -> Cors {
    let allowed = allowed_origins.to_vec();
    Cors::default()
        .allowed_origin_fn(move |origin, _req_head| {
            let origin = origin.to_str().unwrap_or("");
            allowed.iter().any(|a| a == "*" || a == origin)
        })
        .allowed_methods(vec!["GET", "POST", "DELETE"])
        .allowed_headers(vec![
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::AUTHORIZATION,
        ])
        .max_age(3600)
}
