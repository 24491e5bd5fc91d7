use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::de::DeserializeOwned;

use crate::errors::*;

pub const USR_SHARE_PATH: &str = "/usr/share/sysmon-rs";

pub fn pseudo_uuid() -> usize {
    static ID: AtomicUsize = AtomicUsize::new(usize::MAX);
    ID.fetch_sub(1, Ordering::SeqCst)
}

/// Tries to find a file in standard locations:
/// - Fist try to find a file by full path (we also need to expand tilde)
/// - Then try XDG_CONFIG_HOME (e.g. `~/.config`)
/// - Then try XDG_DATA_HOME (e.g. `~/.local/share/`)
/// - Then try `/usr/share/`
///
/// Automatically append an extension if not presented.
pub fn find_file(file: &str, subdir: Option<&str>, extension: Option<&str>) -> Option<PathBuf> {
    let file = shellexpand::tilde(file);
    let mut file = PathBuf::from(file.as_ref());
    if let Some(extension) = extension {
        if file.extension().is_none() {
            file.set_extension(extension);
        }
    }

    if file.is_absolute() {
        return file.exists().then_some(file);
    }

    let candidates = [
        dirs::config_dir().map(|d| d.join("sysmon-rs")),
        dirs::data_dir().map(|d| d.join("sysmon-rs")),
        Some(PathBuf::from(USR_SHARE_PATH)),
    ];
    for base in candidates.into_iter().flatten() {
        let mut path = base;
        if let Some(subdir) = subdir {
            path.push(subdir);
        }
        path.push(&file);
        if path.exists() {
            return Some(path);
        }
    }

    file.exists().then_some(file)
}

pub fn deserialize_toml_file<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();

    let contents = std::fs::read_to_string(path)
        .or_error(|| format!("Failed to read file: {}", path.display()))?;

    toml::from_str(&contents).map_err(|err| {
        let location_msg = err
            .span()
            .map(|span| {
                let line = 1 + contents.as_bytes()[..(span.start)]
                    .iter()
                    .filter(|b| **b == b'\n')
                    .count();
                format!(" at line {line}")
            })
            .unwrap_or_default();
        Error::new(format!(
            "Failed to deserialize TOML file {}{}: {}",
            path.display(),
            location_msg,
            err.message()
        ))
    })
}

/// The "read text now" primitive. The trailing newline is removed.
pub async fn read_file(path: impl AsRef<Path>) -> std::io::Result<String> {
    let mut content = tokio::fs::read_to_string(path).await?;
    let trimmed_len = content.trim_end().len();
    content.truncate(trimmed_len);
    Ok(content)
}

macro_rules! map {
    ($($key:expr => $value:expr),+ $(,)*) => {{
        let mut m = ::serde_json::Map::new();
        $(m.insert(::std::string::String::from($key), ::serde_json::Value::from($value));)+
        ::serde_json::Value::Object(m)
    }};
}

macro_rules! make_log_macro {
    (@wdoll $macro_name:ident, $target:literal, ($dol:tt)) => {
        #[allow(dead_code)]
        macro_rules! $macro_name {
            ($dol($args:tt)+) => {
                ::log::$macro_name!(target: $target, $dol($args)+)
            };
        }
    };
    ($macro_name:ident, $target:literal) => {
        make_log_macro!(@wdoll $macro_name, $target, ($));
    };
}

pub fn default<T: Default>() -> T {
    Default::default()
}
