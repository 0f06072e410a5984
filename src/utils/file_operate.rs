use std::{
    fs::{File, OpenOptions},
    io::{Read, Write},
    os::unix::fs::PermissionsExt,
    path::Path,
};

use anyhow::{Context, Result};
use log::debug;

pub fn check_read_simple<P: AsRef<Path>>(path: P) -> bool {
    path.as_ref().exists() && path.as_ref().is_file()
}

pub fn read_file<P: AsRef<Path>>(path: P) -> Result<String> {
    let path_ref = path.as_ref();
    let mut file = File::open(path_ref)
        .with_context(|| format!("Failed to open file for reading: {}", path_ref.display()))?;

    let mut content = String::new();
    file.read_to_string(&mut content)
        .with_context(|| format!("Failed to read from file: {}", path_ref.display()))?;

    Ok(content)
}

/// 读取单个无符号整数节点
pub fn read_u32<P: AsRef<Path>>(path: P) -> Result<u32> {
    let path_ref = path.as_ref();
    let content = read_file(path_ref)?;
    content
        .trim()
        .parse::<u32>()
        .with_context(|| format!("Failed to parse {:?} from {}", content.trim(), path_ref.display()))
}

/// 写入 sysfs 节点；只读节点会先临时放开写权限
pub fn write_file<P: AsRef<Path>, C: AsRef<[u8]>>(path: P, content: C) -> Result<usize> {
    let path_ref = path.as_ref();

    if path_ref.exists() {
        let metadata = path_ref
            .metadata()
            .with_context(|| format!("Failed to get metadata for: {}", path_ref.display()))?;
        let mut perms = metadata.permissions();
        if perms.mode() & 0o200 == 0 {
            perms.set_mode(0o644);
            std::fs::set_permissions(path_ref, perms)
                .with_context(|| format!("Failed to set permissions for: {}", path_ref.display()))?;
        }
    }

    let mut file = OpenOptions::new()
        .write(true)
        .truncate(true)
        .create(true)
        .open(path_ref)
        .with_context(|| format!("Failed to open file for writing: {}", path_ref.display()))?;

    let content_ref = content.as_ref();
    let bytes_written = file
        .write(content_ref)
        .with_context(|| format!("Failed to write to file: {}", path_ref.display()))?;

    debug!(
        "wrote {:?} to {}",
        String::from_utf8_lossy(content_ref).trim(),
        path_ref.display()
    );
    Ok(bytes_written)
}
