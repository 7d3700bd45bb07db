use std::collections::HashMap;
use std::io::SeekFrom;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use russh_sftp::protocol::{
    Attrs, Data, File, FileAttributes, Handle, Name, OpenFlags, Status, StatusCode, Version,
};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

enum FsHandle {
    File(fs::File),
    Dir(fs::ReadDir),
}

/// SFTP subsystem backend serving the server's real filesystem. One instance
/// per `subsystem sftp` channel; `russh_sftp::server::run` drives it until
/// the channel EOFs.
pub struct SftpHandler {
    version: Option<u32>,
    handles: HashMap<String, FsHandle>,
    next_handle: u64,
}

impl SftpHandler {
    pub fn new() -> Self {
        Self {
            version: None,
            handles: HashMap::new(),
            next_handle: 0,
        }
    }

    fn allocate_handle(&mut self, handle: FsHandle) -> String {
        self.next_handle += 1;
        let name = self.next_handle.to_string();
        self.handles.insert(name.clone(), handle);
        name
    }

    fn file_mut(&mut self, handle: &str) -> Result<&mut fs::File, StatusCode> {
        match self.handles.get_mut(handle) {
            Some(FsHandle::File(file)) => Ok(file),
            _ => Err(StatusCode::Failure),
        }
    }
}

impl Default for SftpHandler {
    fn default() -> Self {
        Self::new()
    }
}

fn io_status(e: &std::io::Error) -> StatusCode {
    match e.kind() {
        std::io::ErrorKind::NotFound => StatusCode::NoSuchFile,
        std::io::ErrorKind::PermissionDenied => StatusCode::PermissionDenied,
        _ => StatusCode::Failure,
    }
}

fn ok_status(id: u32) -> Status {
    Status {
        id,
        status_code: StatusCode::Ok,
        error_message: "Ok".to_string(),
        language_tag: "en-US".to_string(),
    }
}

impl russh_sftp::server::Handler for SftpHandler {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }

    async fn init(
        &mut self,
        version: u32,
        extensions: HashMap<String, String>,
    ) -> Result<Version, Self::Error> {
        if self.version.is_some() {
            return Err(StatusCode::ConnectionLost);
        }
        debug!("sftp init: version {}, extensions {:?}", version, extensions);
        self.version = Some(version);
        Ok(Version::new())
    }

    async fn open(
        &mut self,
        id: u32,
        filename: String,
        pflags: OpenFlags,
        _attrs: FileAttributes,
    ) -> Result<Handle, Self::Error> {
        let mut options = fs::OpenOptions::new();
        options
            .read(pflags.contains(OpenFlags::READ))
            .write(pflags.contains(OpenFlags::WRITE))
            .append(pflags.contains(OpenFlags::APPEND))
            .create(pflags.contains(OpenFlags::CREATE))
            .truncate(pflags.contains(OpenFlags::TRUNCATE))
            .create_new(pflags.contains(OpenFlags::EXCLUDE));
        let file = options.open(&filename).await.map_err(|e| io_status(&e))?;
        Ok(Handle {
            id,
            handle: self.allocate_handle(FsHandle::File(file)),
        })
    }

    async fn close(&mut self, id: u32, handle: String) -> Result<Status, Self::Error> {
        match self.handles.remove(&handle) {
            Some(_) => Ok(ok_status(id)),
            None => Err(StatusCode::Failure),
        }
    }

    async fn read(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        len: u32,
    ) -> Result<Data, Self::Error> {
        let file = self.file_mut(&handle)?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| io_status(&e))?;
        let mut data = vec![0u8; len as usize];
        let n = file.read(&mut data).await.map_err(|e| io_status(&e))?;
        if n == 0 && len > 0 {
            return Err(StatusCode::Eof);
        }
        data.truncate(n);
        Ok(Data { id, data })
    }

    async fn write(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<Status, Self::Error> {
        let file = self.file_mut(&handle)?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| io_status(&e))?;
        file.write_all(&data).await.map_err(|e| io_status(&e))?;
        Ok(ok_status(id))
    }

    async fn lstat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let metadata = fs::symlink_metadata(&path).await.map_err(|e| io_status(&e))?;
        Ok(Attrs {
            id,
            attrs: FileAttributes::from(&metadata),
        })
    }

    async fn fstat(&mut self, id: u32, handle: String) -> Result<Attrs, Self::Error> {
        let file = self.file_mut(&handle)?;
        let metadata = file.metadata().await.map_err(|e| io_status(&e))?;
        Ok(Attrs {
            id,
            attrs: FileAttributes::from(&metadata),
        })
    }

    async fn setstat(
        &mut self,
        id: u32,
        path: String,
        attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        if let Some(size) = attrs.size {
            let file = fs::OpenOptions::new()
                .write(true)
                .open(&path)
                .await
                .map_err(|e| io_status(&e))?;
            file.set_len(size).await.map_err(|e| io_status(&e))?;
        }
        if let Some(permissions) = attrs.permissions {
            fs::set_permissions(&path, std::fs::Permissions::from_mode(permissions))
                .await
                .map_err(|e| io_status(&e))?;
        }
        Ok(ok_status(id))
    }

    async fn fsetstat(
        &mut self,
        id: u32,
        handle: String,
        attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        let file = self.file_mut(&handle)?;
        if let Some(size) = attrs.size {
            file.set_len(size).await.map_err(|e| io_status(&e))?;
        }
        Ok(ok_status(id))
    }

    async fn opendir(&mut self, id: u32, path: String) -> Result<Handle, Self::Error> {
        let entries = fs::read_dir(&path).await.map_err(|e| io_status(&e))?;
        Ok(Handle {
            id,
            handle: self.allocate_handle(FsHandle::Dir(entries)),
        })
    }

    async fn readdir(&mut self, id: u32, handle: String) -> Result<Name, Self::Error> {
        let entries = match self.handles.get_mut(&handle) {
            Some(FsHandle::Dir(entries)) => entries,
            _ => return Err(StatusCode::Failure),
        };
        let mut files = Vec::new();
        while files.len() < 64 {
            match entries.next_entry().await.map_err(|e| io_status(&e))? {
                Some(entry) => {
                    let attrs = match entry.metadata().await {
                        Ok(metadata) => FileAttributes::from(&metadata),
                        Err(_) => FileAttributes::default(),
                    };
                    let filename = entry.file_name().to_string_lossy().into_owned();
                    files.push(File::new(filename, attrs));
                }
                None => break,
            }
        }
        if files.is_empty() {
            return Err(StatusCode::Eof);
        }
        Ok(Name { id, files })
    }

    async fn remove(&mut self, id: u32, filename: String) -> Result<Status, Self::Error> {
        fs::remove_file(&filename).await.map_err(|e| io_status(&e))?;
        Ok(ok_status(id))
    }

    async fn mkdir(
        &mut self,
        id: u32,
        path: String,
        _attrs: FileAttributes,
    ) -> Result<Status, Self::Error> {
        fs::create_dir(&path).await.map_err(|e| io_status(&e))?;
        Ok(ok_status(id))
    }

    async fn rmdir(&mut self, id: u32, path: String) -> Result<Status, Self::Error> {
        fs::remove_dir(&path).await.map_err(|e| io_status(&e))?;
        Ok(ok_status(id))
    }

    async fn realpath(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        let resolved = if path.is_empty() || path == "." {
            std::env::current_dir().map_err(|e| io_status(&e))?
        } else {
            match fs::canonicalize(&path).await {
                Ok(resolved) => resolved,
                Err(_) => PathBuf::from(path),
            }
        };
        Ok(Name {
            id,
            files: vec![File::dummy(resolved.to_string_lossy().into_owned())],
        })
    }

    async fn stat(&mut self, id: u32, path: String) -> Result<Attrs, Self::Error> {
        let metadata = fs::metadata(&path).await.map_err(|e| io_status(&e))?;
        Ok(Attrs {
            id,
            attrs: FileAttributes::from(&metadata),
        })
    }

    async fn rename(
        &mut self,
        id: u32,
        oldpath: String,
        newpath: String,
    ) -> Result<Status, Self::Error> {
        fs::rename(&oldpath, &newpath).await.map_err(|e| io_status(&e))?;
        Ok(ok_status(id))
    }

    async fn readlink(&mut self, id: u32, path: String) -> Result<Name, Self::Error> {
        let target = fs::read_link(&path).await.map_err(|e| io_status(&e))?;
        Ok(Name {
            id,
            files: vec![File::dummy(target.to_string_lossy().into_owned())],
        })
    }

    async fn symlink(
        &mut self,
        id: u32,
        linkpath: String,
        targetpath: String,
    ) -> Result<Status, Self::Error> {
        fs::symlink(&targetpath, &linkpath)
            .await
            .map_err(|e| io_status(&e))?;
        Ok(ok_status(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh_sftp::server::Handler as _;

    #[tokio::test]
    async fn realpath_of_dot_is_the_working_directory() {
        let mut handler = SftpHandler::new();
        let name = handler.realpath(1, ".".to_string()).await.unwrap();
        assert_eq!(name.id, 1);
        assert_eq!(name.files.len(), 1);
    }

    #[tokio::test]
    async fn open_write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin").to_string_lossy().into_owned();
        let mut handler = SftpHandler::new();

        let flags = OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE;
        let handle = handler
            .open(1, path.clone(), flags, FileAttributes::default())
            .await
            .unwrap();
        handler
            .write(2, handle.handle.clone(), 0, b"hello sftp".to_vec())
            .await
            .unwrap();
        handler.close(3, handle.handle).await.unwrap();

        let handle = handler
            .open(4, path.clone(), OpenFlags::READ, FileAttributes::default())
            .await
            .unwrap();
        let data = handler.read(5, handle.handle.clone(), 0, 64).await.unwrap();
        assert_eq!(data.data, b"hello sftp");

        // Reads past the end report EOF.
        let eof = handler.read(6, handle.handle.clone(), 64, 16).await;
        assert_eq!(eof.unwrap_err(), StatusCode::Eof);
        handler.close(7, handle.handle).await.unwrap();

        let attrs = handler.stat(8, path).await.unwrap();
        assert_eq!(attrs.attrs.size, Some(10));
    }

    #[tokio::test]
    async fn readdir_lists_entries_then_eof() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        std::fs::write(dir.path().join("b.txt"), b"b").unwrap();

        let mut handler = SftpHandler::new();
        let handle = handler
            .opendir(1, dir.path().to_string_lossy().into_owned())
            .await
            .unwrap();
        let listing = handler.readdir(2, handle.handle.clone()).await.unwrap();
        assert_eq!(listing.files.len(), 2);

        let eof = handler.readdir(3, handle.handle.clone()).await;
        assert_eq!(eof.unwrap_err(), StatusCode::Eof);
        handler.close(4, handle.handle).await.unwrap();
    }

    #[tokio::test]
    async fn missing_paths_surface_no_such_file() {
        let mut handler = SftpHandler::new();
        let err = handler
            .stat(1, "/definitely/not/a/real/path".to_string())
            .await
            .unwrap_err();
        assert_eq!(err, StatusCode::NoSuchFile);

        let err = handler
            .open(
                2,
                "/definitely/not/a/real/path".to_string(),
                OpenFlags::READ,
                FileAttributes::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err, StatusCode::NoSuchFile);
    }

    #[tokio::test]
    async fn remove_and_directory_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub").to_string_lossy().into_owned();
        let file = dir.path().join("f.txt");
        std::fs::write(&file, b"x").unwrap();

        let mut handler = SftpHandler::new();
        handler
            .mkdir(1, sub.clone(), FileAttributes::default())
            .await
            .unwrap();
        handler
            .remove(2, file.to_string_lossy().into_owned())
            .await
            .unwrap();
        handler.rmdir(3, sub).await.unwrap();
        assert!(!file.exists());
    }
}
