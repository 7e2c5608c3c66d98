//! On-disk layout roots (spec §6 "On-disk layout"), grounded in the
//! teacher's `paths.rs`: one `ProjectDirs` root, device files and
//! per-device storage directories hung off it.

use directories::ProjectDirs;
use std::path::PathBuf;

pub const APP_QUALIFIER: &str = "org";
pub const APP_ORG: &str = "parsec";
pub const APP_NAME: &str = "parsec";

pub fn data_dir() -> anyhow::Result<PathBuf> {
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| anyhow::anyhow!("cannot determine data directory"))?;
    Ok(dirs.data_dir().to_path_buf())
}

pub fn devices_dir() -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join("devices"))
}

pub fn device_file_path(slug: &str) -> anyhow::Result<PathBuf> {
    Ok(devices_dir()?.join(format!("{slug}.device")))
}

pub fn storage_dir(slug: &str) -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join("storage").join(slug))
}

pub fn config_path() -> anyhow::Result<PathBuf> {
    Ok(data_dir()?.join("config.json"))
}
