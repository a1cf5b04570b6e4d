use actix_web::{web, HttpMessage, HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::{ApiResult, ValidationError};
use crate::printers::Printer;
use crate::renderer::PrintLayout;
use crate::service::{PrintService, PDF_CONTENT_TYPE};

#[derive(Debug, Serialize)]
pub struct PrintersResponse {
    pub printers: Vec<Printer>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    Portrait,
    Landscape,
}

#[derive(Debug, Deserialize)]
pub struct PrintPdfQuery {
    pub printer: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PrintPdfUrlQuery {
    pub printer: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PrintUrlQuery {
    pub printer: Option<String>,
    pub url: Option<String>,
    pub orientation: Option<Orientation>,
    pub paper_width: Option<f64>,
    pub paper_height: Option<f64>,
    pub margin_top: Option<f64>,
    pub margin_bottom: Option<f64>,
    pub margin_left: Option<f64>,
    pub margin_right: Option<f64>,
    pub pages: Option<String>,
}

// ============================================================================
// Validation
// ============================================================================

fn required<'a>(name: &str, value: &'a Option<String>) -> Result<&'a str, ValidationError> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ValidationError::field(name, "is required")),
    }
}

fn required_url<'a>(name: &str, value: &'a Option<String>) -> Result<&'a str, ValidationError> {
    let url = required(name, value)?;
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| ValidationError::field(name, format!("must be a valid URL ({})", e)))?;
    // Only network pages produce the document response a render is judged by.
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ValidationError::field(name, "must be an http or https URL"));
    }
    Ok(url)
}

fn positive(name: &str, value: Option<f64>) -> Result<Option<f64>, ValidationError> {
    match value {
        Some(v) if v.is_nan() || v <= 0.0 => Err(ValidationError::field(name, "must be greater than 0")),
        _ => Ok(value),
    }
}

fn non_negative(name: &str, value: Option<f64>) -> Result<Option<f64>, ValidationError> {
    match value {
        Some(v) if v.is_nan() || v < 0.0 => Err(ValidationError::field(
            name,
            "must be greater than or equal to 0",
        )),
        _ => Ok(value),
    }
}

impl PrintUrlQuery {
    pub fn layout(&self) -> Result<PrintLayout, ValidationError> {
        let pages = self
            .pages
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string);

        Ok(PrintLayout {
            landscape: self.orientation == Some(Orientation::Landscape),
            paper_width: positive("paper-width", self.paper_width)?,
            paper_height: positive("paper-height", self.paper_height)?,
            margin_top: non_negative("margin-top", self.margin_top)?,
            margin_bottom: non_negative("margin-bottom", self.margin_bottom)?,
            margin_left: non_negative("margin-left", self.margin_left)?,
            margin_right: non_negative("margin-right", self.margin_right)?,
            page_ranges: pages,
        })
    }
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn list_printers(service: web::Data<PrintService>) -> ApiResult<HttpResponse> {
    let printers = service.list_printers().await?;
    info!("Found {} printers", printers.len());
    Ok(HttpResponse::Ok().json(PrintersResponse { printers }))
}

pub async fn print_pdf(
    req: HttpRequest,
    query: web::Query<PrintPdfQuery>,
    body: web::Payload,
    service: web::Data<PrintService>,
) -> ApiResult<HttpResponse> {
    let printer = required("printer", &query.printer)?;
    if req.content_type() != PDF_CONTENT_TYPE {
        warn!("Rejected upload with content type {:?}", req.content_type());
        return Err(ValidationError::field(
            "Content-Type",
            format!("must be {}", PDF_CONTENT_TYPE),
        )
        .into());
    }

    info!("Print PDF request for printer {}", printer);
    service.print_pdf(printer, body).await?;
    Ok(HttpResponse::Ok().json(serde_json::Value::Null))
}

pub async fn print_pdf_url(
    query: web::Query<PrintPdfUrlQuery>,
    service: web::Data<PrintService>,
) -> ApiResult<HttpResponse> {
    let printer = required("printer", &query.printer)?;
    let url = required_url("url", &query.url)?;

    info!("Print PDF from {} on printer {}", url, printer);
    service.print_pdf_from_url(printer, url).await?;
    Ok(HttpResponse::Ok().json(serde_json::Value::Null))
}

pub async fn print_url(
    query: web::Query<PrintUrlQuery>,
    service: web::Data<PrintService>,
) -> ApiResult<HttpResponse> {
    let printer = required("printer", &query.printer)?;
    let url = required_url("url", &query.url)?;
    let layout = query.layout()?;

    info!("Print page {} on printer {}", url, printer);
    service.print_url(printer, url, &layout).await?;
    Ok(HttpResponse::Ok().json(serde_json::Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(raw: &str) -> PrintUrlQuery {
        web::Query::<PrintUrlQuery>::from_query(raw).unwrap().into_inner()
    }

    #[test]
    fn test_print_url_query_uses_kebab_case() {
        let q = query(
            "printer=HP&url=http://x&orientation=landscape&paper-width=8.5&margin-left=0&pages=1-3",
        );
        let layout = q.layout().unwrap();
        assert!(layout.landscape);
        assert_eq!(layout.paper_width, Some(8.5));
        assert_eq!(layout.margin_left, Some(0.0));
        assert_eq!(layout.page_ranges.as_deref(), Some("1-3"));
    }

    #[test]
    fn test_layout_defaults_to_portrait() {
        let layout = query("printer=HP&url=http://x").layout().unwrap();
        assert_eq!(layout, PrintLayout::default());
    }

    #[test]
    fn test_negative_margin_rejected() {
        let err = query("margin-top=-1").layout().unwrap_err();
        assert_eq!(err.to_string(), "margin-top: must be greater than or equal to 0");
    }

    #[test]
    fn test_zero_paper_size_rejected() {
        let err = query("paper-height=0").layout().unwrap_err();
        assert_eq!(err.to_string(), "paper-height: must be greater than 0");
        assert!(query("paper-width=NaN").layout().is_err());
    }

    #[test]
    fn test_unknown_orientation_fails_decoding() {
        assert!(web::Query::<PrintUrlQuery>::from_query("orientation=sideways").is_err());
    }

    #[test]
    fn test_required_fields() {
        assert!(required("printer", &None).is_err());
        assert!(required("printer", &Some("  ".to_string())).is_err());
        assert_eq!(required("printer", &Some(" HP ".to_string())).unwrap(), "HP");

        assert!(required_url("url", &Some("not a url".to_string())).is_err());
        assert!(required_url("url", &Some("https://example.com/a.pdf".to_string())).is_ok());
    }

    #[test]
    fn test_url_must_be_http_or_https() {
        for url in ["about:blank", "file:///etc/hosts", "data:text/html,hi", "ftp://host/a.pdf"] {
            let err = required_url("url", &Some(url.to_string())).unwrap_err();
            assert_eq!(err.to_string(), "url: must be an http or https URL", "{}", url);
        }
        assert!(required_url("url", &Some("http://printer.local/page".to_string())).is_ok());
    }
}
