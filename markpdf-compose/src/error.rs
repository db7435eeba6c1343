use markpdf_core::ImageDataError;

pub type Result<T> = std::result::Result<T, ComposeError>;

#[derive(Debug, thiserror::Error)]
pub enum ComposeError {
    #[error("failed to parse PDF: {0}")]
    Parse(String),
    #[error("document has no pages")]
    EmptyDocument,
    #[error("invalid image payload: {0}")]
    ImageData(#[from] ImageDataError),
    #[error("failed to decode image: {0}")]
    ImageDecode(String),
    #[error("failed to encode content stream: {0}")]
    Content(String),
    #[error("failed to serialize PDF: {0}")]
    Save(String),
}

impl From<lopdf::Error> for ComposeError {
    fn from(err: lopdf::Error) -> Self {
        ComposeError::Parse(err.to_string())
    }
}
