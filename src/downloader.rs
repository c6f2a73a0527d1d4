//! The fetch collaborator.
//!
//! The pipeline never talks to the network itself. A `Downloader` turns a
//! request into a response; on failure it hands the request back inside the
//! `TransportError` so the downloader middlewares get a chance to recover.

use crate::error::TransportError;
use crate::request::Request;
use crate::response::Response;
use async_trait::async_trait;

#[async_trait]
pub trait Downloader: Send + Sync + 'static {
    async fn download(&self, request: Request) -> Result<Response, TransportError>;
}
