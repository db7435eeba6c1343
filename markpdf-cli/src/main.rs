use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use markpdf_compose::{compose, PageGeometry};
use markpdf_core::{
    DirectoryLibrary, DocumentKey, EditorAction, EditorSession, FileKey, FileSource, FontFamily,
    ImageMime, ImagePayload, RasterBox, Rgb, VersionSink,
};
use markpdf_render::{PassRegistry, PdfRasterizer};
use serde::Deserialize;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(
    name = "markpdf",
    version,
    about = "annotate PDF files from a document library and store the result as a new version"
)]
struct Args {
    /// Root directory of the document library
    #[arg(short = 'l', long = "library", default_value = ".")]
    library: PathBuf,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    /// Show page count and geometry of a stored file
    Info {
        /// Document identifier within the library
        document: String,
        /// File identifier within the document
        file: String,
    },
    /// Apply an annotation script and submit the result as a new version
    Apply {
        /// Document identifier within the library
        document: String,
        /// File identifier within the document
        file: String,
        /// JSON file with the annotations to apply
        #[arg(short = 's', long = "script")]
        script: PathBuf,
        /// File name for the submitted version
        #[arg(short = 'o', long = "output", default_value = "annotated.pdf")]
        output: String,
    },
}

/// One annotation instruction from a script file. Indices refer to the
/// position of earlier annotations in the order they were added.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
enum ScriptAction {
    AddText {
        page: u32,
        x: f32,
        y: f32,
        text: String,
        #[serde(default = "default_font_size")]
        font_size: f32,
        #[serde(default)]
        font: FontFamily,
        #[serde(default)]
        background: Option<Rgb>,
    },
    AddImage {
        page: u32,
        x: f32,
        y: f32,
        width: f32,
        height: f32,
        path: PathBuf,
    },
    AddSignature {
        page: u32,
        x: f32,
        y: f32,
        width: f32,
        height: f32,
        path: PathBuf,
    },
    SetText {
        index: usize,
        text: String,
    },
    SetFontSize {
        index: usize,
        font_size: f32,
    },
    SetFont {
        index: usize,
        font: FontFamily,
    },
    Move {
        index: usize,
        x: f32,
        y: f32,
    },
    Resize {
        index: usize,
        width: f32,
        height: f32,
        x: f32,
        y: f32,
    },
    Remove {
        index: usize,
    },
}

fn default_font_size() -> f32 {
    14.0
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let project_dirs = ProjectDirs::from("net", "markpdf", "markpdf")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let _log_guard = init_logging(&project_dirs)?;

    let library = DirectoryLibrary::new(args.library.clone())
        .with_context(|| format!("failed to open library at {:?}", args.library))?;

    match args.command {
        CliCommand::Info { document, file } => info_command(&library, &document, &file).await,
        CliCommand::Apply {
            document,
            file,
            script,
            output,
        } => apply_command(&library, &document, &file, &script, &output).await,
    }
}

async fn fetch_and_render(
    library: &DirectoryLibrary,
    document: &DocumentKey,
    file: &FileKey,
) -> Result<(Vec<u8>, EditorSession)> {
    let bytes = library
        .fetch(document, file)
        .await
        .with_context(|| format!("failed to fetch {} from {}", file, document))?;

    let rasterizer = PdfRasterizer::new()?;
    let registry = PassRegistry::new();
    let token = registry.begin();
    let pages = rasterizer
        .render_document(&bytes, &token)
        .with_context(|| format!("failed to render {}", file))?;
    registry.finish(&token);

    let mut session = EditorSession::new();
    session.replace_pages(pages);
    Ok((bytes, session))
}

async fn info_command(library: &DirectoryLibrary, document: &str, file: &str) -> Result<()> {
    let document = DocumentKey::from(document);
    let file = FileKey::from(file);
    let (bytes, session) = fetch_and_render(library, &document, &file).await?;

    println!("{} ({} bytes)", file, bytes.len());
    println!("pages: {}", session.pages().len());
    for page in session.pages() {
        println!(
            "  page {}: {}x{} px ({:.1}x{:.1} pt)",
            page.page_number, page.image.width, page.image.height, page.pdf_width, page.pdf_height
        );
    }
    for version in library.versions(&document)? {
        println!("version: {}", version);
    }
    Ok(())
}

async fn apply_command(
    library: &DirectoryLibrary,
    document: &str,
    file: &str,
    script: &Path,
    output: &str,
) -> Result<()> {
    let document = DocumentKey::from(document);
    let file = FileKey::from(file);
    let (bytes, mut session) = fetch_and_render(library, &document, &file).await?;

    let script_text = fs::read_to_string(script)
        .with_context(|| format!("failed to read script {:?}", script))?;
    let actions: Vec<ScriptAction> =
        serde_json::from_str(&script_text).context("failed to parse annotation script")?;

    for action in actions {
        let action = resolve_action(&session, action)?;
        session.apply(action)?;
    }

    if session.store().is_empty() {
        bail!("script produced no annotations, nothing to submit");
    }
    if !session.try_begin_save() {
        bail!("a save is already in progress");
    }

    let geometry: Vec<PageGeometry> = session.pages().iter().map(PageGeometry::from).collect();
    let composed = match compose(&bytes, session.store().annotations(), &geometry) {
        Ok(composed) => composed,
        Err(err) => {
            session.finish_save(false);
            return Err(err).context("failed to compose annotated document");
        }
    };

    match library.submit(&document, output, &composed).await {
        Ok(receipt) => {
            session.finish_save(true);
            info!(document = %document, version = receipt.version, "submitted new version");
            println!("stored version {} as {}", receipt.version, receipt.file);
            Ok(())
        }
        Err(err) => {
            session.finish_save(false);
            Err(err).context("failed to submit annotated document")
        }
    }
}

fn resolve_action(session: &EditorSession, action: ScriptAction) -> Result<EditorAction> {
    let id_at = |index: usize| {
        session
            .store()
            .annotations()
            .get(index)
            .map(|a| a.id)
            .ok_or_else(|| anyhow!("annotation index {} out of range", index))
    };

    Ok(match action {
        ScriptAction::AddText {
            page,
            x,
            y,
            text,
            font_size,
            font,
            background,
        } => EditorAction::AddText {
            page_number: page,
            x,
            y,
            text,
            font_size,
            font,
            background,
        },
        ScriptAction::AddImage {
            page,
            x,
            y,
            width,
            height,
            path,
        } => EditorAction::AddImage {
            page_number: page,
            rect: RasterBox::new(x, y, width, height),
            payload: load_image_payload(&path)?,
        },
        ScriptAction::AddSignature {
            page,
            x,
            y,
            width,
            height,
            path,
        } => EditorAction::AddSignature {
            page_number: page,
            rect: RasterBox::new(x, y, width, height),
            payload: load_image_payload(&path)?,
        },
        ScriptAction::SetText { index, text } => EditorAction::SetText {
            id: id_at(index)?,
            text,
        },
        ScriptAction::SetFontSize { index, font_size } => EditorAction::SetFontSize {
            id: id_at(index)?,
            font_size,
        },
        ScriptAction::SetFont { index, font } => EditorAction::SetFont {
            id: id_at(index)?,
            font,
        },
        ScriptAction::Move { index, x, y } => EditorAction::MoveTo {
            id: id_at(index)?,
            x,
            y,
        },
        ScriptAction::Resize {
            index,
            width,
            height,
            x,
            y,
        } => EditorAction::Resize {
            id: id_at(index)?,
            width,
            height,
            x,
            y,
        },
        ScriptAction::Remove { index } => EditorAction::Remove { id: id_at(index)? },
    })
}

fn load_image_payload(path: &Path) -> Result<ImagePayload> {
    let mime = match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => ImageMime::Png,
        Some("jpg") | Some("jpeg") => ImageMime::Jpeg,
        other => bail!("unsupported image extension {:?} for {:?}", other, path),
    };
    let bytes = fs::read(path).with_context(|| format!("failed to read image {:?}", path))?;
    Ok(ImagePayload::from_bytes(&bytes, mime))
}

fn init_logging(project_dirs: &ProjectDirs) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "markpdf.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);
    let console_layer = tracing_subscriber::fmt::layer();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}
