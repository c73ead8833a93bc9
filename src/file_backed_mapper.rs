//! The file-backed mapper commits ranges as shared mappings of private
//! temporary files.  This lets the operating system eagerly swap out
//! cold heap pages when under memory pressure, instead of keeping the
//! whole committed arena in anonymous memory.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
)))]
use disabled_contracts::*;

use std::ffi::c_void;
use std::fs::File;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::Mutex;

use crate::Mapper;

#[derive(Debug)]
pub struct FileBackedMapper {}

lazy_static::lazy_static! {
    static ref FILE_BACKED_PATH: Mutex<Option<PathBuf>> = Default::default();
}

/// Updates the parent directory for the file-backed mapper's
/// temporary files to `path`.
pub fn set_file_backed_arena_directory(path: Option<PathBuf>) {
    let mut global_path = FILE_BACKED_PATH.lock().unwrap();

    *global_path = path;
}

/// Returns a temporary File in `FILE_BACKED_PATH`, or in the global
/// `TMPDIR`.
fn get_temp_file() -> Result<File, i32> {
    let path = FILE_BACKED_PATH.lock().unwrap();

    match &*path {
        Some(dir) => tempfile::tempfile_in(dir),
        None => tempfile::tempfile(),
    }
    .map_err(|e| e.raw_os_error().unwrap_or(0))
}

#[contract_trait]
impl Mapper for FileBackedMapper {
    fn page_size(&self) -> usize {
        crate::map::page_size()
    }

    fn reserve(&self, desired_size: usize) -> Result<(NonNull<c_void>, usize), i32> {
        let region: NonNull<c_void> = crate::map::reserve_region(desired_size)?;
        Ok((region, desired_size))
    }

    fn release(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32> {
        crate::map::release_region(base, size)
    }

    fn commit(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32> {
        let tempfile = get_temp_file()?;

        crate::map::commit_file_region(tempfile, base, size)
    }

    fn uncommit(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32> {
        // Dropping back to an anonymous PROT_NONE mapping releases the
        // mapping's reference to the temporary file.
        crate::map::uncommit_region(base, size)
    }
}

#[test]
fn smoke_test() {
    let mapper = FileBackedMapper {};
    let page = mapper.page_size();

    let (base, size) = mapper.reserve(8 * page).expect("reserve should succeed");

    mapper.commit(base, page).expect("commit should succeed");
    unsafe {
        assert_eq!(std::ptr::read(base.as_ptr() as *const u8), 0);
        std::ptr::write(base.as_ptr() as *mut u8, 42);
        assert_eq!(std::ptr::read(base.as_ptr() as *const u8), 42);
    }

    mapper.uncommit(base, page).expect("uncommit should succeed");
    mapper.release(base, size).expect("release should succeed");
}
