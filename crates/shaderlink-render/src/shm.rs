//! Caller-owned shared memory used as the output of batch renders.
//!
//! A [`SharedSegment`] maps an existing object read-write for the duration of
//! one batch and unmaps it when dropped. Names without an interior `/` (one
//! leading `/` is allowed) are POSIX shared-memory objects; anything else is
//! opened as a regular file.

/// True when `name` designates a POSIX shared-memory object.
pub fn is_shm_name(name: &str) -> bool {
    let stripped = name.strip_prefix('/').unwrap_or(name);
    !stripped.is_empty() && !stripped.contains('/')
}

#[cfg(unix)]
mod imp {
    use std::ffi::CString;
    use std::fs::{File, OpenOptions};
    use std::io;
    use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
    use std::ptr::NonNull;

    use shaderlink_core::{ShaderlinkError, ShaderlinkResult};

    use super::is_shm_name;

    pub struct SharedSegment {
        ptr: NonNull<u8>,
        len: usize,
        name: String,
    }

    fn open_object(name: &str) -> io::Result<File> {
        if !is_shm_name(name) {
            return OpenOptions::new().read(true).write(true).open(name);
        }
        let path = format!("/{}", name.trim_start_matches('/'));
        let cpath = CString::new(path)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        // SAFETY: `cpath` is a valid NUL-terminated string for the call.
        let fd = unsafe { libc::shm_open(cpath.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `fd` was just returned by shm_open and is owned by nobody else.
        Ok(File::from(unsafe { OwnedFd::from_raw_fd(fd) }))
    }

    impl SharedSegment {
        /// Map exactly `len` bytes of the existing object `name`.
        pub fn open(name: &str, len: usize) -> ShaderlinkResult<Self> {
            if len == 0 {
                return Err(ShaderlinkError::resource(format!(
                    "refusing to map zero bytes of '{}'",
                    name
                )));
            }
            let file = open_object(name).map_err(|e| {
                ShaderlinkError::resource(format!("cannot open shared memory '{}': {}", name, e))
            })?;
            let size = file.metadata().map_err(|e| {
                ShaderlinkError::resource(format!("cannot stat shared memory '{}': {}", name, e))
            })?;
            if size.len() < len as u64 {
                return Err(ShaderlinkError::resource(format!(
                    "shared memory '{}' holds {} bytes, {} required",
                    name,
                    size.len(),
                    len
                )));
            }

            // SAFETY: the fd is valid for the call and the object is at least
            // `len` bytes long. The mapping outlives the fd.
            let raw = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    file.as_raw_fd(),
                    0,
                )
            };
            if raw == libc::MAP_FAILED {
                return Err(ShaderlinkError::resource(format!(
                    "cannot map shared memory '{}': {}",
                    name,
                    io::Error::last_os_error()
                )));
            }
            let ptr = NonNull::new(raw.cast::<u8>()).ok_or_else(|| {
                ShaderlinkError::resource(format!("mmap of '{}' returned null", name))
            })?;

            tracing::debug!("mapped {} bytes of shared memory '{}'", len, name);
            Ok(Self {
                ptr,
                len,
                name: name.to_string(),
            })
        }

        pub fn len(&self) -> usize {
            self.len
        }

        pub fn is_empty(&self) -> bool {
            self.len == 0
        }

        pub fn name(&self) -> &str {
            &self.name
        }

        pub fn as_slice(&self) -> &[u8] {
            // SAFETY: `ptr` maps `len` readable bytes until drop.
            unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
        }

        /// Copy `bytes` to `offset`, failing if they would run past the end.
        pub fn write_at(&mut self, offset: usize, bytes: &[u8]) -> ShaderlinkResult<()> {
            let end = offset
                .checked_add(bytes.len())
                .filter(|end| *end <= self.len)
                .ok_or_else(|| {
                    ShaderlinkError::resource(format!(
                        "write of {} bytes at {} overruns '{}' ({} bytes)",
                        bytes.len(),
                        offset,
                        self.name,
                        self.len
                    ))
                })?;
            // SAFETY: `offset..end` lies inside the writable mapping.
            let dst = unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) };
            dst[offset..end].copy_from_slice(bytes);
            Ok(())
        }

        /// Make the written bytes visible to other mappings of the object.
        pub fn flush(&self) -> ShaderlinkResult<()> {
            // SAFETY: `ptr`/`len` describe a live mapping.
            let rc = unsafe {
                libc::msync(self.ptr.as_ptr().cast(), self.len, libc::MS_SYNC)
            };
            if rc != 0 {
                return Err(ShaderlinkError::resource(format!(
                    "msync of '{}' failed: {}",
                    self.name,
                    io::Error::last_os_error()
                )));
            }
            Ok(())
        }
    }

    impl Drop for SharedSegment {
        fn drop(&mut self) {
            if let Err(e) = self.flush() {
                tracing::warn!("{}", e);
            }
            // SAFETY: the mapping was created in `open` and is unmapped once.
            let rc = unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) };
            if rc != 0 {
                tracing::warn!(
                    "munmap of '{}' failed: {}",
                    self.name,
                    io::Error::last_os_error()
                );
            } else {
                tracing::debug!("released shared memory '{}'", self.name);
            }
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use std::convert::Infallible;

    use shaderlink_core::{ShaderlinkError, ShaderlinkResult};

    pub struct SharedSegment {
        never: Infallible,
    }

    impl SharedSegment {
        pub fn open(name: &str, _len: usize) -> ShaderlinkResult<Self> {
            Err(ShaderlinkError::resource(format!(
                "shared memory output '{}' is only supported on unix",
                name
            )))
        }

        pub fn len(&self) -> usize {
            match self.never {}
        }

        pub fn is_empty(&self) -> bool {
            match self.never {}
        }

        pub fn name(&self) -> &str {
            match self.never {}
        }

        pub fn as_slice(&self) -> &[u8] {
            match self.never {}
        }

        pub fn write_at(&mut self, _offset: usize, _bytes: &[u8]) -> ShaderlinkResult<()> {
            match self.never {}
        }

        pub fn flush(&self) -> ShaderlinkResult<()> {
            match self.never {}
        }
    }
}

pub use imp::SharedSegment;

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use shaderlink_core::ShaderlinkError;

    #[test]
    fn test_shm_name_rules() {
        assert!(is_shm_name("frames"));
        assert!(is_shm_name("/frames"));
        assert!(!is_shm_name("/tmp/frames"));
        assert!(!is_shm_name("out/frames.bin"));
        assert!(!is_shm_name("/"));
        assert!(!is_shm_name(""));
    }

    #[test]
    fn test_write_flush_and_release_file_segment() {
        let path = std::env::temp_dir().join("shaderlink_test_segment.bin");
        std::fs::write(&path, vec![0u8; 12]).unwrap();

        {
            let mut seg = SharedSegment::open(path.to_str().unwrap(), 12).unwrap();
            assert_eq!(seg.len(), 12);
            seg.write_at(0, &[1, 2, 3]).unwrap();
            seg.write_at(9, &[7, 8, 9]).unwrap();
            assert!(seg.write_at(10, &[0, 0, 0]).is_err());
            seg.flush().unwrap();
            assert_eq!(&seg.as_slice()[..3], &[1, 2, 3]);
        }

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes, vec![1, 2, 3, 0, 0, 0, 0, 0, 0, 7, 8, 9]);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_too_small_object_is_resource_error() {
        let path = std::env::temp_dir().join("shaderlink_test_small.bin");
        std::fs::write(&path, vec![0u8; 4]).unwrap();
        let err = SharedSegment::open(path.to_str().unwrap(), 12).err().unwrap();
        assert!(matches!(err, ShaderlinkError::Resource(_)));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_missing_object_is_resource_error() {
        let err = SharedSegment::open("/nonexistent/shaderlink/segment", 3).err().unwrap();
        assert!(matches!(err, ShaderlinkError::Resource(_)));
        let err = SharedSegment::open("shaderlink-missing-segment", 3).err().unwrap();
        assert!(matches!(err, ShaderlinkError::Resource(_)));
    }
}
