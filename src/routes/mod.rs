// HTTP routes: printer listing and the three print endpoints.

pub mod printer_routes;

use actix_web::{web, HttpResponse};

use crate::errors::{ApiError, ApiResult, ValidationError};

pub use printer_routes::*;

/// Registers every route, each with a JSON 405 for unmatched methods.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::QueryConfig::default().error_handler(|err, _req| {
        ApiError::from(ValidationError(err.to_string())).into()
    }))
    .service(
        web::resource("/printers")
            .route(web::get().to(list_printers))
            .default_service(web::to(method_not_allowed)),
    )
    .service(
        web::resource("/print-pdf")
            .route(web::post().to(print_pdf))
            .default_service(web::to(method_not_allowed)),
    )
    .service(
        web::resource("/print-pdf-url")
            .route(web::post().to(print_pdf_url))
            .default_service(web::to(method_not_allowed)),
    )
    .service(
        web::resource("/print-url")
            .route(web::post().to(print_url))
            .default_service(web::to(method_not_allowed)),
    );
}

pub async fn not_found() -> ApiResult<HttpResponse> {
    Err(ApiError::NotFound)
}

pub async fn method_not_allowed() -> ApiResult<HttpResponse> {
    Err(ApiError::MethodNotAllowed)
}
