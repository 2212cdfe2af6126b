use super::*;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct VersionResponse {
    pub name: String,
    pub version: String,
}

impl VersionResponse {
    pub fn current() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Multipart body of `POST /upload`.
#[derive(Debug, ToSchema)]
#[allow(dead_code)]
pub struct UploadForm {
    /// Zip archive; the file name without `.zip` becomes the app name.
    #[schema(value_type = String, format = Binary)]
    pub file: Vec<u8>,
}
