//! I/O 支持: 网与分析结果的 JSON、RON 序列化.
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use ron::ser::PrettyConfig;
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

use crate::net::core::{Net, NetError};

#[derive(Debug, Error)]
pub enum IoError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("ron error: {0}")]
    Ron(#[from] ron::Error),
    #[error("ron error: {0}")]
    RonSpanned(#[from] ron::error::SpannedError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid net: {0}")]
    Net(#[from] NetError),
    #[error("unsupported net format `{0}`, expected .json or .ron")]
    UnsupportedFormat(String),
}

pub fn to_json_string<T>(value: &T) -> Result<String, IoError>
where
    T: Serialize,
{
    Ok(serde_json::to_string_pretty(value)?)
}

pub fn from_json_str<T>(s: &str) -> Result<T, IoError>
where
    T: DeserializeOwned,
{
    Ok(serde_json::from_str(s)?)
}

pub fn write_json<P: AsRef<Path>, T: Serialize>(path: P, value: &T) -> Result<(), IoError> {
    let mut file = File::create(path)?;
    let content = to_json_string(value)?;
    file.write_all(content.as_bytes())?;
    Ok(())
}

pub fn read_json<P: AsRef<Path>, T: DeserializeOwned>(path: P) -> Result<T, IoError> {
    from_json_str(&read_to_string(path)?)
}

pub fn to_ron_string<T>(value: &T) -> Result<String, IoError>
where
    T: Serialize,
{
    let mut pretty = PrettyConfig::default();
    pretty.new_line = "\n".into();
    Ok(ron::ser::to_string_pretty(value, pretty)?)
}

pub fn from_ron_str<T>(s: &str) -> Result<T, IoError>
where
    T: DeserializeOwned,
{
    Ok(ron::from_str(s)?)
}

pub fn write_ron<P: AsRef<Path>, T: Serialize>(path: P, value: &T) -> Result<(), IoError> {
    let mut file = File::create(path)?;
    let content = to_ron_string(value)?;
    file.write_all(content.as_bytes())?;
    Ok(())
}

pub fn read_ron<P: AsRef<Path>, T: DeserializeOwned>(path: P) -> Result<T, IoError> {
    from_ron_str(&read_to_string(path)?)
}

fn read_to_string<P: AsRef<Path>>(path: P) -> Result<String, IoError> {
    let mut file = File::open(path)?;
    let mut content = String::new();
    file.read_to_string(&mut content)?;
    Ok(content)
}

/// 按扩展名 (`.json` / `.ron`) 读取网, 并校验结构一致性与初始标识.
///
/// 有效性检查器不参与序列化, 读入的网不带检查器.
pub fn load_net<P: AsRef<Path>>(path: P) -> Result<Net, IoError> {
    let path = path.as_ref();
    let net: Net = match extension(path).as_str() {
        "json" => read_json(path)?,
        "ron" => read_ron(path)?,
        other => return Err(IoError::UnsupportedFormat(other.to_string())),
    };
    net.validate()?;
    log::debug!(
        "loaded net `{}` from {}: {} places, {} transitions",
        net.name,
        path.display(),
        net.places_len(),
        net.transitions_len()
    );
    Ok(net)
}

pub fn save_net<P: AsRef<Path>>(path: P, net: &Net) -> Result<(), IoError> {
    let path = path.as_ref();
    match extension(path).as_str() {
        "json" => write_json(path, net),
        "ron" => write_ron(path, net),
        other => Err(IoError::UnsupportedFormat(other.to_string())),
    }
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase()
}
