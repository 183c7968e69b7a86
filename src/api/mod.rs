//! Remote API access.
//!
//! - `transport`: one-shot HTTP send over `ureq`, classified errors
//! - `multipart`: upload bodies
//! - `client`: `ResilientHttpClient`, auth session and retry policy

pub mod client;
pub mod multipart;
pub mod transport;

pub use client::{AuthSession, ClientSettings, ResilientHttpClient, MAX_PAGE_SIZE};
pub use multipart::{FilePart, MultipartForm};
pub use transport::{
    HttpResponse, HttpTransport, Method, RequestBody, RetryableRequest, TransportError,
    UreqTransport, HARD_FAILURE_STATUS,
};
