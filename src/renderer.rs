// Web page to PDF rendering through a single shared headless Chrome tab.

use async_trait::async_trait;
use headless_chrome::browser::tab::NavigationFailed;
use headless_chrome::protocol::cdp::Network::ResourceType;
use headless_chrome::protocol::cdp::Page;
use headless_chrome::types::PrintToPdfOptions;
use headless_chrome::{Browser, LaunchOptions, Tab};
use std::path::PathBuf;
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::errors::PrintError;

const RESPONSE_HANDLER: &str = "print-server-main-response";

// Renders have no deadline. This stands in for "never" wherever headless_chrome
// wants a duration: the idle connection limit and the tab's wait timeout.
const NO_DEADLINE: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Page setup forwarded to Chrome's print-to-PDF. Sizes are in inches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrintLayout {
    pub landscape: bool,
    pub paper_width: Option<f64>,
    pub paper_height: Option<f64>,
    pub margin_top: Option<f64>,
    pub margin_bottom: Option<f64>,
    pub margin_left: Option<f64>,
    pub margin_right: Option<f64>,
    pub page_ranges: Option<String>,
}

impl PrintLayout {
    fn to_pdf_options(&self) -> PrintToPdfOptions {
        PrintToPdfOptions {
            landscape: Some(self.landscape),
            paper_width: self.paper_width,
            paper_height: self.paper_height,
            margin_top: self.margin_top,
            margin_bottom: self.margin_bottom,
            margin_left: self.margin_left,
            margin_right: self.margin_right,
            page_ranges: self.page_ranges.clone(),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait PageRenderer: Send + Sync {
    async fn render_pdf(&self, url: &str, layout: &PrintLayout) -> Result<Vec<u8>, PrintError>;

    /// Releases the browser, if one was started.
    fn close(&self) {}
}

// ============================================================================
// Headless Chrome
// ============================================================================

struct BrowserSession {
    // Keeps the Chrome process and its connection alive for `tab`.
    _browser: Browser,
    tab: Arc<Tab>,
    main_frame: String,
}

impl BrowserSession {
    fn launch(chrome_path: Option<PathBuf>) -> Result<Self, PrintError> {
        info!("Launching headless browser (path: {:?})", chrome_path);

        let options = LaunchOptions::default_builder()
            .headless(true)
            .path(chrome_path)
            .idle_browser_timeout(NO_DEADLINE)
            .build()
            .map_err(|e| PrintError::Render(format!("invalid browser options: {}", e)))?;

        let browser = Browser::new(options).map_err(render_error)?;
        let tab = browser.new_tab().map_err(render_error)?;
        tab.set_default_timeout(NO_DEADLINE);

        let main_frame = tab
            .call_method(Page::GetFrameTree(None))
            .map_err(render_error)?
            .frame_tree
            .frame
            .id;

        info!("Headless browser ready");
        Ok(Self {
            _browser: browser,
            tab,
            main_frame,
        })
    }

    fn render(&self, url: &str, layout: &PrintLayout) -> Result<Vec<u8>, PrintError> {
        let tab = &self.tab;

        // Leave whatever the previous render loaded so none of its traffic is
        // mistaken for the new page's document.
        tab.navigate_to("about:blank")
            .and_then(|tab| tab.wait_until_navigated())
            .map_err(render_error)?;

        // Registered before navigating so the document response cannot be missed.
        let (tx, rx) = mpsc::channel();
        let document = Mutex::new(Some(tx));
        let main_frame = self.main_frame.clone();
        tab.register_response_handling(
            RESPONSE_HANDLER,
            Box::new(move |event, _fetch_body| {
                // Subresources and subframe documents never gate the render.
                if event.Type != ResourceType::Document
                    || event.frame_id.as_deref() != Some(main_frame.as_str())
                {
                    return;
                }
                let sender = document.lock().ok().and_then(|mut slot| slot.take());
                if let Some(sender) = sender {
                    let status = event.response.status as u32;
                    let _ = sender.send((status, event.response.status_text.clone()));
                }
            }),
        )
        .map_err(render_error)?;

        let result = navigate_and_print(tab, url, layout, &rx);

        if let Err(e) = tab.deregister_response_handling(RESPONSE_HANDLER) {
            warn!("Failed to remove response handler: {}", e);
        }
        result
    }
}

fn navigate_and_print(
    tab: &Tab,
    url: &str,
    layout: &PrintLayout,
    documents: &mpsc::Receiver<(u32, String)>,
) -> Result<Vec<u8>, PrintError> {
    debug!("Navigating to {}", url);
    tab.navigate_to(url).map_err(|e| {
        // Chrome could not load the URL at all; the tab itself is fine.
        if e.is::<NavigationFailed>() {
            PrintError::Request(e.to_string())
        } else {
            render_error(e)
        }
    })?;

    let (status, status_text) = documents
        .recv()
        .map_err(|_| PrintError::Render("browser closed before a response arrived".to_string()))?;
    if status >= 300 {
        return Err(PrintError::Request(format!(
            "response from URL was {} {}",
            status, status_text
        )));
    }

    tab.wait_until_navigated().map_err(render_error)?;

    let pdf = tab
        .print_to_pdf(Some(layout.to_pdf_options()))
        .map_err(render_error)?;
    info!("Rendered {} to {} bytes of PDF", url, pdf.len());
    Ok(pdf)
}

fn render_error(e: impl std::fmt::Display) -> PrintError {
    PrintError::Render(e.to_string())
}

/// Renders through one lazily started Chrome tab shared by all requests.
///
/// Renders are serialized on the session lock, so concurrent requests never
/// interleave navigations on the tab.
pub struct ChromeRenderer {
    chrome_path: Option<PathBuf>,
    session: Arc<Mutex<Option<BrowserSession>>>,
}

impl ChromeRenderer {
    pub fn new(chrome_path: Option<PathBuf>) -> Self {
        Self {
            chrome_path,
            session: Arc::new(Mutex::new(None)),
        }
    }

    fn lock_session(session: &Mutex<Option<BrowserSession>>) -> MutexGuard<'_, Option<BrowserSession>> {
        // A panic mid-render leaves the tab in an unknown state; start over.
        session.lock().unwrap_or_else(|poisoned| {
            let mut guard = poisoned.into_inner();
            *guard = None;
            guard
        })
    }

    fn render_blocking(
        session: &Mutex<Option<BrowserSession>>,
        chrome_path: Option<PathBuf>,
        url: &str,
        layout: &PrintLayout,
    ) -> Result<Vec<u8>, PrintError> {
        let mut guard = Self::lock_session(session);
        if guard.is_none() {
            *guard = Some(BrowserSession::launch(chrome_path)?);
        }
        let Some(active) = guard.as_ref() else {
            return Err(PrintError::Render("browser session unavailable".to_string()));
        };

        let result = active.render(url, layout);
        if let Err(PrintError::Render(reason)) = &result {
            warn!("Dropping browser session after failure: {}", reason);
            *guard = None;
        }
        result
    }
}

#[async_trait]
impl PageRenderer for ChromeRenderer {
    async fn render_pdf(&self, url: &str, layout: &PrintLayout) -> Result<Vec<u8>, PrintError> {
        let session = self.session.clone();
        let chrome_path = self.chrome_path.clone();
        let url = url.to_string();
        let layout = layout.clone();

        tokio::task::spawn_blocking(move || {
            Self::render_blocking(&session, chrome_path, &url, &layout)
        })
        .await
        .map_err(|e| PrintError::Render(format!("render task failed: {}", e)))?
    }

    fn close(&self) {
        if Self::lock_session(&self.session).take().is_some() {
            info!("Closed headless browser");
        }
    }
}
