//! Installed application packages: discovery, description and upload.

use std::fs;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use render_gateway_error::GatewayError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub const SETTINGS_FILE: &str = "settings.ini";
const BUNDLED_DIR: &str = "bundled";
const THUMBNAIL_FILE: &str = "thumbnail.png";
const UPLOADS_DIR: &str = ".uploads";
const COMPILED_DIR: &str = ".compiled";

const FAILED_UNZIP: &str = "Failed unzipping package.";
const NO_ENTRY_FILE: &str = "Invalid package, no entry file found (i.e. settings.ini).";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum AppKind {
    /// Project sources compiled by the runtime on launch.
    Source,
    /// Pre-built bundle shipping its own runtime executable.
    Bundled,
    /// Browser build; there is no process to launch.
    Webgl2,
}

impl AppKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Bundled => "bundled",
            Self::Webgl2 => "webgl2",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct AppLinks {
    pub info: String,
    pub run: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AppDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: AppKind,
    /// Package directory relative to the packages root.
    pub path: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    pub settings: String,
    #[serde(default)]
    pub index_file: Option<String>,
    pub links: AppLinks,
}

#[derive(Debug, Clone)]
pub struct PackageStore {
    root: PathBuf,
    public_url: String,
}

impl PackageStore {
    /// Opens the store, creating the packages root if needed.
    pub fn new(root: impl Into<PathBuf>, public_url: impl Into<String>) -> io::Result<Self> {
        let root = root.into();
        if !root.exists() {
            tracing::info!(root = %root.display(), "creating packages folder");
            fs::create_dir_all(&root)?;
        }
        Ok(Self {
            root,
            public_url: public_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn public_url(&self) -> &str {
        &self.public_url
    }

    pub fn app_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Where a source package's compiled data for `platform` lives.
    pub fn compiled_data_dir(&self, name: &str, platform: &str) -> PathBuf {
        self.root
            .join(COMPILED_DIR)
            .join(format!("{name}_data"))
            .join(platform)
    }

    pub fn describe(&self, name: &str) -> Result<AppDescriptor, GatewayError> {
        if !is_valid_app_name(name) {
            return Err(GatewayError::UnknownApplication {
                app: name.to_string(),
            });
        }
        let dir = self.app_dir(name);
        let (kind, settings_path) =
            detect_kind(&dir).ok_or_else(|| GatewayError::UnknownApplication {
                app: name.to_string(),
            })?;
        let settings = fs::read_to_string(&settings_path)?;

        let title = capture(project_name_regex(), &settings).unwrap_or_else(|| name.to_string());
        let description =
            capture(project_description_regex(), &settings).unwrap_or_else(|| name.to_string());
        let thumbnail = dir
            .join(THUMBNAIL_FILE)
            .is_file()
            .then(|| format!("packages/{name}/{THUMBNAIL_FILE}"));
        let index_file = match kind {
            AppKind::Webgl2 => find_webgl_entry(&dir),
            AppKind::Source | AppKind::Bundled => None,
        };

        Ok(AppDescriptor {
            name: name.to_string(),
            kind,
            path: name.to_string(),
            title: non_null(title),
            description: non_null(description),
            thumbnail,
            settings,
            index_file,
            links: AppLinks {
                info: format!("{}/app/{name}", self.public_url),
                run: format!("{}/run/{name}", self.public_url),
            },
        })
    }

    /// Every describable package, ordered by name.
    pub fn list(&self) -> Vec<AppDescriptor> {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut apps: Vec<AppDescriptor> = entries
            .filter_map(Result::ok)
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| !name.starts_with('.') && !name.ends_with("_data"))
            .filter_map(|name| match self.describe(&name) {
                Ok(app) => {
                    tracing::debug!(app = %name, kind = app.kind.as_str(), "found package");
                    Some(app)
                }
                Err(_) => None,
            })
            .collect();
        apps.sort_by(|a, b| a.name.cmp(&b.name));
        apps
    }

    /// Unpacks an uploaded archive and installs it as `<file name>` minus
    /// its `.zip` extension, replacing any package of that name.
    pub fn install_archive(&self, file_name: &str, bytes: &[u8]) -> Result<AppDescriptor, GatewayError> {
        let name = app_name_from_file(file_name).ok_or_else(|| GatewayError::InvalidRequest {
            message: format!("invalid package file name: {file_name:?}"),
        })?;

        let uploads = self.root.join(UPLOADS_DIR);
        fs::create_dir_all(&uploads)?;
        let staging = tempfile::Builder::new()
            .prefix("upload-")
            .tempdir_in(&uploads)?;

        tracing::info!(app = %name, bytes = bytes.len(), "unzipping package");
        let has_settings = extract_archive(bytes, staging.path())?;
        if !has_settings {
            return Err(GatewayError::InvalidPackage {
                reason: NO_ENTRY_FILE.to_string(),
            });
        }

        let items: Vec<PathBuf> = fs::read_dir(staging.path())?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .collect();
        let source = match items.as_slice() {
            [single] if single.is_dir() => single.clone(),
            _ => staging.path().to_path_buf(),
        };

        let target = self.app_dir(&name);
        if target.exists() {
            tracing::info!(app = %name, "replacing previous package");
            fs::remove_dir_all(&target)?;
        }
        fs::rename(&source, &target)?;

        match self.describe(&name) {
            Ok(app) => Ok(app),
            Err(_) => {
                let _ = fs::remove_dir_all(&target);
                Err(GatewayError::InvalidPackage {
                    reason: NO_ENTRY_FILE.to_string(),
                })
            }
        }
    }
}

/// Regular files in `dir` that look runnable: an `.exe` extension, or on
/// unix any execute bit.
pub fn find_executables(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut found: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().map(|kind| kind.is_file()).unwrap_or(false))
        .map(|entry| entry.path())
        .filter(|path| is_executable(path))
        .collect();
    found.sort();
    found
}

fn is_executable(path: &Path) -> bool {
    let has_exe_extension = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("exe"))
        .unwrap_or(false);
    if has_exe_extension {
        return true;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(metadata) = fs::metadata(path) {
            return metadata.permissions().mode() & 0o111 != 0;
        }
    }
    false
}

fn detect_kind(dir: &Path) -> Option<(AppKind, PathBuf)> {
    let settings = dir.join(SETTINGS_FILE);
    if settings.is_file() {
        let kind = if find_webgl_entry(dir).is_some() {
            AppKind::Webgl2
        } else {
            AppKind::Source
        };
        return Some((kind, settings));
    }
    let bundled = dir.join(BUNDLED_DIR).join(SETTINGS_FILE);
    bundled.is_file().then_some((AppKind::Bundled, bundled))
}

fn find_webgl_entry(dir: &Path) -> Option<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .ok()?
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| webgl_entry_regex().is_match(name))
        .collect();
    names.sort();
    names.into_iter().next()
}

/// Extracts into `destination`, skipping entries that would escape it.
/// Returns whether any entry was a settings file.
fn extract_archive(bytes: &[u8], destination: &Path) -> Result<bool, GatewayError> {
    let invalid = |_| GatewayError::InvalidPackage {
        reason: FAILED_UNZIP.to_string(),
    };
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).map_err(invalid)?;
    let mut has_settings = false;
    for index in 0..archive.len() {
        let mut file = archive.by_index(index).map_err(invalid)?;
        if file.name().contains(SETTINGS_FILE) {
            has_settings = true;
        }
        let Some(name) = file.enclosed_name().map(|path| path.to_path_buf()) else {
            tracing::warn!(entry = file.name(), "skipping archive entry outside the package");
            continue;
        };
        let out_path = destination.join(name);
        if file.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(&out_path)?;
        io::copy(&mut file, &mut out).map_err(|_| GatewayError::InvalidPackage {
            reason: FAILED_UNZIP.to_string(),
        })?;
    }
    Ok(has_settings)
}

fn app_name_from_file(file_name: &str) -> Option<String> {
    let base = Path::new(file_name).file_name()?.to_str()?;
    let name = base.strip_suffix(".zip").unwrap_or(base);
    is_valid_app_name(name).then(|| name.to_string())
}

fn is_valid_app_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(['/', '\\'])
        && name != ".."
}

fn non_null(value: String) -> Option<String> {
    (value != "null").then_some(value)
}

fn capture(regex: &Regex, text: &str) -> Option<String> {
    regex
        .captures(text)
        .and_then(|captures| captures.get(1))
        .map(|value| value.as_str().trim().to_string())
        .filter(|value| !value.is_empty())
}

fn project_name_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r#"project_name\s*=\s*"?([^"\r\n]+)"?"#).expect("hardcoded regex")
    })
}

fn project_description_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r#"project_description\s*=\s*"([^"]+)""#).expect("hardcoded regex")
    })
}

fn webgl_entry_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"(?i)^stingray_webgl.+\.html$").expect("hardcoded regex"))
}
