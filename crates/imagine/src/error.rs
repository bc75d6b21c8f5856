use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ImagineError {
    #[snafu(display("failed to build http client on `{stage}`: {source}"))]
    BuildClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("request to {url} failed on `{stage}`: {source}"))]
    Request {
        stage: &'static str,
        url: String,
        source: reqwest::Error,
    },
    #[snafu(display("image endpoint returned status {status} for {url}"))]
    Status {
        stage: &'static str,
        url: String,
        status: u16,
    },
    #[snafu(display("failed to read image body from {url} on `{stage}`: {source}"))]
    ReadBody {
        stage: &'static str,
        url: String,
        source: reqwest::Error,
    },
}

pub type ImagineResult<T> = Result<T, ImagineError>;
