// Panic containment and optional Basic authentication, both as `from_fn` middleware.

use actix_web::body::MessageBody;
use actix_web::dev::{ServiceRequest, ServiceResponse};
use actix_web::http::header::{HeaderValue, AUTHORIZATION};
use actix_web::middleware::Next;
use actix_web::{web, Error, ResponseError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use tracing::{error, warn};

use crate::config::AuthConfig;
use crate::errors::ApiError;

/// Turns a panic anywhere below this layer into a `500 {"message": ...}` error.
///
/// The error is rendered by the outer layers and the dispatcher like any other
/// handler error.
pub async fn catch_panic(
    req: ServiceRequest,
    next: Next<impl MessageBody + 'static>,
) -> Result<ServiceResponse<impl MessageBody>, Error> {
    // Owned copies only: the router needs sole ownership of the request head.
    let method = req.method().clone();
    let path = req.path().to_owned();

    match AssertUnwindSafe(async move { next.call(req).await })
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(panic) => {
            let message = panic_message(&*panic);
            error!("Recovered from panic in {} {}: {}", method, path, message);
            Err(ApiError::Internal(message).into())
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "internal server error".to_string()
    }
}

/// Rejects requests whose Basic credentials don't match the `AuthConfig` app data.
pub async fn basic_auth(
    req: ServiceRequest,
    next: Next<impl MessageBody + 'static>,
) -> Result<ServiceResponse<impl MessageBody>, Error> {
    let authorized = req
        .app_data::<web::Data<AuthConfig>>()
        .map(|auth| credentials_match(req.headers().get(AUTHORIZATION), auth))
        .unwrap_or(false);

    if !authorized {
        warn!("Unauthorized {} {}", req.method(), req.path());
        let response = ApiError::Unauthorized.error_response();
        return Ok(req.into_response(response).map_into_right_body());
    }

    next.call(req).await.map(ServiceResponse::map_into_left_body)
}

fn credentials_match(header: Option<&HeaderValue>, auth: &AuthConfig) -> bool {
    let Some(value) = header.and_then(|h| h.to_str().ok()) else {
        return false;
    };
    let Some(encoded) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };

    match decoded.split_once(':') {
        Some((username, password)) => username == auth.username && password == auth.password,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::{header, StatusCode};
    use actix_web::middleware::from_fn;
    use actix_web::body::to_bytes;
    use actix_web::{test, App, HttpResponse, HttpServer};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::service::testing::local_client;

    fn auth() -> AuthConfig {
        AuthConfig {
            enabled: true,
            username: "admin".to_string(),
            password: "s3cret:pw".to_string(),
        }
    }

    fn basic(credentials: &str) -> String {
        format!("Basic {}", STANDARD.encode(credentials))
    }

    async fn explode() -> HttpResponse {
        panic!("printer exploded")
    }

    async fn echo_path(req: actix_web::HttpRequest) -> HttpResponse {
        HttpResponse::Ok().body(req.match_info().query("name").to_string())
    }

    #[actix_web::test]
    async fn test_panic_becomes_json_500() {
        let app = test::init_service(
            App::new()
                .wrap(from_fn(catch_panic))
                .route("/boom", web::get().to(explode))
                .route("/ok", web::get().to(HttpResponse::Ok)),
        )
        .await;

        let req = test::TestRequest::get().uri("/boom").to_request();
        let err = test::try_call_service(&app, req).await.err().unwrap();
        let resp = err.error_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = to_bytes(resp.into_body()).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body, serde_json::json!({ "message": "printer exploded" }));

        // The worker keeps serving after a panic.
        let req = test::TestRequest::get().uri("/ok").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn test_routing_works_below_panic_guard() {
        let app = test::init_service(
            App::new()
                .wrap(from_fn(catch_panic))
                .route("/printers/{name}", web::get().to(echo_path)),
        )
        .await;

        let req = test::TestRequest::get().uri("/printers/HP").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(&test::read_body(resp).await[..], b"HP");
    }

    #[actix_web::test]
    async fn test_panic_served_as_json_500_over_http() {
        let server = HttpServer::new(|| {
            App::new()
                .wrap(from_fn(catch_panic))
                .route("/boom", web::get().to(explode))
        })
        .workers(1)
        .disable_signals()
        .bind("127.0.0.1:0")
        .unwrap();
        let addr = server.addrs()[0];
        let server = server.run();
        let handle = server.handle();
        tokio::spawn(server);

        let client = local_client();
        for _ in 0..2 {
            let resp = client
                .get(format!("http://{}/boom", addr))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), 500);
            let body: serde_json::Value =
                serde_json::from_slice(&resp.bytes().await.unwrap()).unwrap();
            assert_eq!(body, serde_json::json!({ "message": "printer exploded" }));
        }

        handle.stop(false).await;
    }

    #[actix_web::test]
    async fn test_basic_auth_accepts_and_rejects() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(auth()))
                .wrap(from_fn(basic_auth))
                .route(
                    "/printers",
                    web::get().to(move || {
                        let counter = counter.clone();
                        async move {
                            counter.fetch_add(1, Ordering::SeqCst);
                            HttpResponse::Ok().finish()
                        }
                    }),
                ),
        )
        .await;

        // Passwords may contain ':'; only the first one separates the pair.
        let req = test::TestRequest::get()
            .uri("/printers")
            .insert_header((header::AUTHORIZATION, basic("admin:s3cret:pw")))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let rejected = [
            None,
            Some("Basic !!!not-base64!!!".to_string()),
            Some("Bearer abc".to_string()),
            Some(basic("root:s3cret:pw")),
            Some(basic("admin:wrong")),
            Some(basic("admin")),
        ];
        for authorization in rejected {
            let mut req = test::TestRequest::get().uri("/printers");
            if let Some(value) = &authorization {
                req = req.insert_header((header::AUTHORIZATION, value.as_str()));
            }
            let resp = test::call_service(&app, req.to_request()).await;
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED, "{:?}", authorization);
            assert_eq!(
                resp.headers().get(header::WWW_AUTHENTICATE).unwrap(),
                "Basic"
            );
            let body: serde_json::Value = test::read_body_json(resp).await;
            assert_eq!(body, serde_json::json!({ "message": "Unauthorized" }));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[actix_web::test]
    async fn test_basic_auth_without_credentials_configured_rejects() {
        let app = test::init_service(
            App::new()
                .wrap(from_fn(basic_auth))
                .route("/printers", web::get().to(HttpResponse::Ok)),
        )
        .await;

        let req = test::TestRequest::get()
            .uri("/printers")
            .insert_header((header::AUTHORIZATION, basic(":")))
            .to_request();
        assert_eq!(
            test::call_service(&app, req).await.status(),
            StatusCode::UNAUTHORIZED
        );
    }
}
