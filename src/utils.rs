use std::io;
use std::path::Path;
use std::sync::OnceLock;

pub(crate) fn align_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

#[allow(dead_code)]
pub(crate) fn align_down(value: usize, align: usize) -> usize {
    (value / align) * align
}

/// Returns the size of a page on this machine, the minimum granularity
/// of virtual-to-physical memory mapping.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        // SAFETY: sysconf is always safe to call.
        let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        assert!(n > 0, "sysconf(_SC_PAGESIZE) failed");
        n as usize
    })
}

pub(crate) fn create_file(
    path: &Path,
    allow_existing: bool,
) -> io::Result<std::fs::File> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true);
    options.read(true);

    if allow_existing {
        options.create(true);
    } else {
        options.create_new(true);
    }

    let file = options.open(path)?;

    #[cfg(unix)]
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::OpenOptions::new()
                .read(true)
                .open(parent)?
                .sync_all()?;
        }
    }

    Ok(file)
}

#[cfg(test)]
mod tests {
    use std::io::ErrorKind;

    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 4), 0);
        assert_eq!(align_up(1, 4), 4);
        assert_eq!(align_up(4, 4), 4);
        assert_eq!(align_up(4097, 4096), 8192);
    }

    #[test]
    fn test_align_down() {
        assert_eq!(align_down(0, 4), 0);
        assert_eq!(align_down(5, 4), 4);
        assert_eq!(align_down(4096, 4096), 4096);
    }

    #[test]
    fn test_page_size_is_sane() {
        let ps = page_size();
        assert!(ps >= 4096);
        assert!(ps.is_power_of_two());
    }

    #[test]
    fn test_create_file_helper() {
        let dir = tempfile::tempdir().unwrap();

        let fp = dir.path().join("test1");
        create_file(&fp, true).expect("create file that doesn't exist should work");

        let error = create_file(&fp, false)
            .expect_err("allow existing should prevent file being created");
        assert_eq!(error.kind(), ErrorKind::AlreadyExists);

        create_file(&fp, true).expect("file should be over written");
    }
}
