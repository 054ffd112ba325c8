//! Built-in application used by the binary and the test suite.

use bytes::Bytes;

use super::bridge::{AppError, Application};
use super::request::Request;
use super::response::Response;

/// Replies with the request line followed by the request body.
///
/// A `push=<path>` query parameter asks the server to push `<path>`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Echo;

impl Application for Echo {
    fn call(&self, request: Request) -> Result<Response, AppError> {
        let line = format!("{} {} {}\n", request.method, request.target(), request.version);
        let pushes: Vec<String> = request
            .query
            .as_deref()
            .unwrap_or("")
            .split('&')
            .filter_map(|pair| pair.strip_prefix("push="))
            .map(str::to_string)
            .collect();

        let mut body = Vec::with_capacity(line.len() + request.body.len());
        body.extend_from_slice(line.as_bytes());
        for chunk in request.body {
            body.extend_from_slice(&chunk);
        }

        let mut response = Response::new(200)
            .with_header("content-type", "text/plain")
            .with_body(Bytes::from(body));
        response.push = pushes;
        Ok(response)
    }
}
