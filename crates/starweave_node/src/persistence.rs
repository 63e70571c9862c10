//! Document-store client for ship hand-off.
//!
//! Ships are persisted as JSON documents under `/ships/_doc/{token}`,
//! matching an ElasticSearch-style index. The store is only consulted on
//! hand-off paths (a ship leaving this node, or a token re-homing after a
//! node departure), so a plain blocking request per call is fine.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use serde_json::Value;
use starweave_bus::Spaceship;
use thiserror::Error;
use tracing::debug;

const STORE_TIMEOUT: Duration = Duration::from_secs(10);
const SHIP_INDEX: &str = "ships";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("store returned malformed json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid http response")]
    BadResponse,
    #[error("store error: {0}")]
    Rejected(String),
}

/// Client for one document store endpoint.
#[derive(Debug, Clone)]
pub struct ShipStore {
    /// Host and port, e.g. `127.0.0.1:9200`.
    address: String,
}

impl ShipStore {
    /// Accepts `host:port` or a full `http://host:port` URL.
    pub fn new(address: impl Into<String>) -> Self {
        let address = address.into();
        let address = address
            .trim_start_matches("http://")
            .trim_end_matches('/')
            .to_string();
        Self { address }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Fetches a persisted ship; `None` when the store has no document
    /// for the token.
    pub fn get_ship(&self, token: &str) -> Result<Option<Spaceship>, StoreError> {
        let path = format!("/{SHIP_INDEX}/_doc/{token}");
        let (status, body) = self.http_request("GET", &path, None)?;
        if status == 404 {
            return Ok(None);
        }
        let doc: Value = serde_json::from_str(&body)?;
        match doc.get("_source") {
            Some(source) => Ok(Some(serde_json::from_value(source.clone())?)),
            None => Ok(None),
        }
    }

    pub fn put_ship(&self, ship: &Spaceship) -> Result<(), StoreError> {
        let path = format!("/{SHIP_INDEX}/_doc/{}", ship.token);
        let body = serde_json::to_string(ship)?;
        let (_, resp) = self.http_request("PUT", &path, Some(&body))?;
        check_store_error(&resp)?;
        debug!(token = %ship.token, "persisted ship document");
        Ok(())
    }

    pub fn delete_ship(&self, token: &str) -> Result<(), StoreError> {
        let path = format!("/{SHIP_INDEX}/_doc/{token}");
        let (status, resp) = self.http_request("DELETE", &path, None)?;
        if status == 404 {
            return Ok(());
        }
        check_store_error(&resp)
    }

    fn http_request(
        &self,
        method: &str,
        path: &str,
        body: Option<&str>,
    ) -> Result<(u16, String), StoreError> {
        let mut stream = TcpStream::connect(&self.address)?;
        stream.set_read_timeout(Some(STORE_TIMEOUT))?;
        stream.set_write_timeout(Some(STORE_TIMEOUT))?;

        let request = match body {
            Some(body) => format!(
                "{} {} HTTP/1.1\r\nHost: {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                method, path, self.address, body.len(), body
            ),
            None => format!(
                "{} {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
                method, path, self.address
            ),
        };
        stream.write_all(request.as_bytes())?;

        let mut response = String::new();
        stream.read_to_string(&mut response)?;

        let Some((headers, body)) = response.split_once("\r\n\r\n") else {
            return Err(StoreError::BadResponse);
        };
        let status_line = headers.lines().next().unwrap_or("");
        let status = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or(StoreError::BadResponse)?;
        Ok((status, body.to_string()))
    }
}

/// ElasticSearch reports failures in-band as an `error` field.
fn check_store_error(body: &str) -> Result<(), StoreError> {
    let doc: Value = serde_json::from_str(body)?;
    match doc.get("error") {
        Some(err) => Err(StoreError::Rejected(err.to_string())),
        None => Ok(()),
    }
}
