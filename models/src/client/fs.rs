use std::fs::Permissions;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tokio::io::AsyncWriteExt;

/// Owner read/write only. Used for every file holding key material or credentials.
pub const PRIVATE_FILE_MODE: u32 = 0o600;

/// Writes `contents` to `path` with owner-only permissions, which are in place before any byte is written.
pub async fn write_private_file(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(PRIVATE_FILE_MODE)
        .open(path)
        .await?;
    // The creation mode is ignored when the file already exists.
    file.set_permissions(Permissions::from_mode(PRIVATE_FILE_MODE))
        .await?;
    file.write_all(contents).await?;
    file.flush().await
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_write_private_file_tightens_existing_file() {
        let path = std::env::temp_dir().join(format!("talosforge-private-{}", std::process::id()));
        std::fs::write(&path, "a much longer previous document").unwrap();
        std::fs::set_permissions(&path, Permissions::from_mode(0o644)).unwrap();

        write_private_file(&path, b"key: value\n").await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, PRIVATE_FILE_MODE);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "key: value\n");

        std::fs::remove_file(&path).unwrap();
    }
}
