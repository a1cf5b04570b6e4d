// Printer backends: enumerate OS printers and submit PDF files through native tooling.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::errors::PrintError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Printer {
    pub name: String,
}

impl Printer {
    /// Returns `None` for blank names so listings never contain them.
    pub fn named(name: &str) -> Option<Self> {
        let name = name.trim();
        if name.is_empty() {
            None
        } else {
            Some(Printer {
                name: name.to_string(),
            })
        }
    }
}

#[async_trait]
pub trait PrinterBackend: Send + Sync {
    async fn list_printers(&self) -> Result<Vec<Printer>, PrintError>;

    /// Sends an already spooled PDF file to `printer`.
    async fn print_file(&self, printer: &str, file: &Path) -> Result<(), PrintError>;

    fn type_name(&self) -> &'static str;
}

// ============================================================================
// External commands
// ============================================================================

/// A program plus leading arguments, e.g. `lp` or `sh fake-lp.sh`.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: OsString,
    args: Vec<OsString>,
}

impl ToolCommand {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Runs the tool with `extra` arguments and returns its combined output:
    /// all of stdout followed by all of stderr. The streams are captured
    /// separately, so lines are not interleaved in the order they were written.
    ///
    /// A non-zero exit becomes [`PrintError::Command`] carrying that output; a
    /// missing binary becomes [`PrintError::NotSupported`] for `operation`.
    pub async fn run<I, S>(&self, operation: &'static str, extra: I) -> Result<String, PrintError>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let mut args = self.args.clone();
        args.extend(extra.into_iter().map(Into::into));

        info!("executing {:?} with {:?}", self.program, args);

        let output = tokio::process::Command::new(&self.program)
            .args(&args)
            .stdin(std::process::Stdio::null())
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    warn!("{:?} is not installed", self.program);
                    PrintError::not_supported(operation)
                } else {
                    PrintError::Io(e)
                }
            })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        info!("result: {:?}", combined);

        if !output.status.success() {
            return Err(PrintError::Command(combined));
        }
        Ok(combined)
    }
}

// ============================================================================
// Spool files
// ============================================================================

/// A temporary `.pdf` that is deleted when dropped, whether or not printing worked.
pub struct SpoolFile {
    path: TempPath,
}

impl SpoolFile {
    pub async fn from_stream<S, E>(body: S) -> Result<Self, PrintError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: fmt::Display,
    {
        futures::pin_mut!(body);

        let (file, path) = tempfile::Builder::new()
            .prefix("print-server-")
            .suffix(".pdf")
            .tempfile()?
            .into_parts();

        let mut file = tokio::fs::File::from_std(file);
        let mut written = 0usize;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| {
                PrintError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
            })?;
            written += chunk.len();
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        info!("Spooled {} bytes to {:?}", written, &*path);
        Ok(SpoolFile { path })
    }

    pub async fn from_bytes(bytes: Vec<u8>) -> Result<Self, PrintError> {
        let chunk = Ok::<_, std::convert::Infallible>(Bytes::from(bytes));
        Self::from_stream(futures::stream::iter([chunk])).await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

// ============================================================================
// CUPS (Linux, macOS, BSD)
// ============================================================================

pub struct CupsBackend {
    lpstat: ToolCommand,
    lp: ToolCommand,
}

impl CupsBackend {
    pub fn new() -> Self {
        Self::with_tools(ToolCommand::new("lpstat"), ToolCommand::new("lp"))
    }

    pub fn with_tools(lpstat: ToolCommand, lp: ToolCommand) -> Self {
        Self { lpstat, lp }
    }
}

impl Default for CupsBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// One destination per line of `lpstat -e`.
pub fn parse_lpstat(output: &str) -> Vec<Printer> {
    output.lines().filter_map(Printer::named).collect()
}

#[async_trait]
impl PrinterBackend for CupsBackend {
    async fn list_printers(&self) -> Result<Vec<Printer>, PrintError> {
        let output = self.lpstat.run("ListPrinters", ["-e"]).await?;
        Ok(parse_lpstat(&output))
    }

    async fn print_file(&self, printer: &str, file: &Path) -> Result<(), PrintError> {
        let args: [OsString; 3] = ["-d".into(), printer.into(), file.into()];
        self.lp.run("PrintPDF", args).await?;
        Ok(())
    }

    fn type_name(&self) -> &'static str {
        "CUPS"
    }
}

// ============================================================================
// Windows (WMI listing, SumatraPDF silent printing)
// ============================================================================

pub struct WindowsBackend {
    wmic: ToolCommand,
    viewer_override: Option<PathBuf>,
    viewer: tokio::sync::OnceCell<PathBuf>,
}

impl WindowsBackend {
    pub fn new() -> Self {
        Self::with_tools(ToolCommand::new("wmic"), None)
    }

    /// `viewer` replaces the bundled SumatraPDF executable when set.
    pub fn with_tools(wmic: ToolCommand, viewer: Option<PathBuf>) -> Self {
        Self {
            wmic,
            viewer_override: viewer,
            viewer: tokio::sync::OnceCell::new(),
        }
    }

    async fn viewer_path(&self) -> Result<&Path, PrintError> {
        let path = self
            .viewer
            .get_or_try_init(|| async {
                match &self.viewer_override {
                    Some(path) => Ok(path.clone()),
                    None => bundled::materialize_sumatra().await,
                }
            })
            .await?;
        Ok(path.as_path())
    }
}

impl Default for WindowsBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses `wmic printer list brief /format:csv`. The `Name` column is located
/// by its header title; rows without a name are skipped.
pub fn parse_wmic_csv(output: &str) -> Result<Vec<Printer>, PrintError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(output.trim_start().as_bytes());

    let Some(name_column) = reader.headers()?.iter().position(|title| title == "Name") else {
        return Ok(Vec::new());
    };

    let mut printers = Vec::new();
    for record in reader.records() {
        if let Some(printer) = record?.get(name_column).and_then(Printer::named) {
            printers.push(printer);
        }
    }
    Ok(printers)
}

#[async_trait]
impl PrinterBackend for WindowsBackend {
    async fn list_printers(&self) -> Result<Vec<Printer>, PrintError> {
        let output = self
            .wmic
            .run("ListPrinters", ["printer", "list", "brief", "/format:csv"])
            .await?;
        parse_wmic_csv(&output)
    }

    async fn print_file(&self, printer: &str, file: &Path) -> Result<(), PrintError> {
        let viewer = ToolCommand::new(self.viewer_path().await?);
        let args: [OsString; 4] = [
            "-print-to".into(),
            printer.into(),
            "-silent".into(),
            file.into(),
        ];
        viewer.run("PrintPDF", args).await?;
        Ok(())
    }

    fn type_name(&self) -> &'static str {
        "Windows (SumatraPDF)"
    }
}

#[cfg(windows)]
mod bundled {
    use rust_embed::RustEmbed;
    use std::path::PathBuf;
    use tracing::info;

    use crate::errors::PrintError;

    const SUMATRA: &str = "SumatraPDF.exe";

    #[derive(RustEmbed)]
    #[folder = "assets/windows/"]
    struct WindowsAssets;

    /// Writes the embedded viewer next to the other temp files, once per process.
    pub async fn materialize_sumatra() -> Result<PathBuf, PrintError> {
        let asset = WindowsAssets::get(SUMATRA).ok_or_else(|| PrintError::not_supported("PrintPDF"))?;

        let dir = std::env::temp_dir().join("print-server");
        tokio::fs::create_dir_all(&dir).await?;
        let target = dir.join(SUMATRA);

        let up_to_date = match tokio::fs::metadata(&target).await {
            Ok(meta) => meta.len() == asset.data.len() as u64,
            Err(_) => false,
        };
        if !up_to_date {
            info!("Extracting {} to {:?}", SUMATRA, target);
            tokio::fs::write(&target, asset.data.as_ref()).await?;
        }
        Ok(target)
    }
}

#[cfg(not(windows))]
mod bundled {
    use std::path::PathBuf;

    use crate::errors::PrintError;

    pub async fn materialize_sumatra() -> Result<PathBuf, PrintError> {
        Err(PrintError::not_supported("PrintPDF"))
    }
}

// ============================================================================
// Unsupported platforms
// ============================================================================

pub struct UnsupportedBackend;

#[async_trait]
impl PrinterBackend for UnsupportedBackend {
    async fn list_printers(&self) -> Result<Vec<Printer>, PrintError> {
        Err(PrintError::not_supported("ListPrinters"))
    }

    async fn print_file(&self, _printer: &str, _file: &Path) -> Result<(), PrintError> {
        Err(PrintError::not_supported("PrintPDF"))
    }

    fn type_name(&self) -> &'static str {
        "Unsupported"
    }
}

/// Picks the backend for the platform this binary was built for.
pub fn platform_backend() -> Arc<dyn PrinterBackend> {
    let backend: Arc<dyn PrinterBackend> = if cfg!(windows) {
        Arc::new(WindowsBackend::new())
    } else if cfg!(unix) {
        Arc::new(CupsBackend::new())
    } else {
        Arc::new(UnsupportedBackend)
    };
    info!("Using {} printer backend", backend.type_name());
    backend
}
