//! Window measurement over HTTP multipart.

use std::path::Path;

use serde_json::Value;

use super::models::MeasurementCamera;
use crate::error::SdkError;
use crate::manager::SessionManager;
use crate::routing::{FilePart, Request};

pub const ROUTE_MEASURE: &str = "measure";

/// Multipart field the backend reads the photo from.
const FILE_FIELD: &str = "file";

#[derive(Debug, Clone)]
pub struct MeasurementApi {
    manager: SessionManager,
}

impl MeasurementApi {
    #[must_use]
    pub fn new(manager: SessionManager) -> Self {
        Self { manager }
    }

    /// Upload a window photo and get its estimated dimensions.
    ///
    /// # Errors
    ///
    /// HTTP status and transport errors from the backend, or `Protocol` when
    /// the reply is not a measurement.
    pub async fn measure_window(&self, file_name: &str, bytes: Vec<u8>) -> Result<MeasurementCamera, SdkError> {
        let part = FilePart {
            field: FILE_FIELD.to_owned(),
            file_name: file_name.to_owned(),
            mime: image_mime(file_name).to_owned(),
            bytes,
        };
        let request = Request::new(ROUTE_MEASURE, Value::Null).with_file(part);
        self.manager.call(request).await?.decode()
    }
}

fn image_mime(file_name: &str) -> &'static str {
    let ext = Path::new(file_name).extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("heic") => "image/heic",
        _ => "image/jpeg",
    }
}

#[cfg(test)]
#[path = "measurement_test.rs"]
mod tests;
