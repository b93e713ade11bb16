#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("http client: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid api base url: {0}")]
    Url(#[from] url::ParseError),

    #[error("malformed dispatch payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("dispatch payload missing field `{0}`")]
    MissingField(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
