use bytes::Bytes;
use futures::Stream;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use std::fmt;
use std::sync::Arc;
use tracing::info;

use crate::errors::PrintError;
use crate::printers::{Printer, PrinterBackend, SpoolFile};
use crate::renderer::{PageRenderer, PrintLayout};

pub const PDF_CONTENT_TYPE: &str = "application/pdf";

/// The print operations exposed over HTTP, shared by every server instance.
pub struct PrintService {
    backend: Arc<dyn PrinterBackend>,
    renderer: Arc<dyn PageRenderer>,
    http: reqwest::Client,
}

impl PrintService {
    pub fn new(backend: Arc<dyn PrinterBackend>, renderer: Arc<dyn PageRenderer>) -> Self {
        Self {
            backend,
            renderer,
            http: reqwest::Client::new(),
        }
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    /// Printers are listed fresh on every call.
    pub async fn list_printers(&self) -> Result<Vec<Printer>, PrintError> {
        self.backend.list_printers().await
    }

    /// Spools `body` to a temp file and prints it; the file is removed either way.
    pub async fn print_pdf<S, E>(&self, printer: &str, body: S) -> Result<(), PrintError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: fmt::Display,
    {
        let spool = SpoolFile::from_stream(body).await?;
        self.print_spooled(printer, spool).await
    }

    pub async fn print_pdf_from_url(&self, printer: &str, url: &str) -> Result<(), PrintError> {
        info!("Downloading {} for printer {}", url, printer);
        let response = self.http.get(url).send().await?;

        if response.status() != StatusCode::OK {
            return Err(PrintError::Request(format!(
                "response from URL was {}",
                response.status()
            )));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
            .unwrap_or_default();
        if content_type != PDF_CONTENT_TYPE {
            return Err(PrintError::Request(format!(
                "downloaded file is {}, expected {}",
                content_type, PDF_CONTENT_TYPE
            )));
        }

        self.print_pdf(printer, response.bytes_stream()).await
    }

    pub async fn print_url(
        &self,
        printer: &str,
        url: &str,
        layout: &PrintLayout,
    ) -> Result<(), PrintError> {
        info!("Rendering {} for printer {} ({:?})", url, printer, layout);
        let pdf = self.renderer.render_pdf(url, layout).await?;
        let spool = SpoolFile::from_bytes(pdf).await?;
        self.print_spooled(printer, spool).await
    }

    async fn print_spooled(&self, printer: &str, spool: SpoolFile) -> Result<(), PrintError> {
        let result = self.backend.print_file(printer, spool.path()).await;
        drop(spool);
        if result.is_ok() {
            info!("Sent print job to {}", printer);
        }
        result
    }
}
