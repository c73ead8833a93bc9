//! Raw virtual-memory primitives over mmap.
//!
//! Reservations are `PROT_NONE` mappings that consume address space but
//! no backing store; committing a range replaces it with fresh
//! zero-filled anonymous pages, and uncommitting replaces it with
//! `PROT_NONE` again, returning the backing to the operating system
//! while keeping the address range reserved.
use std::ffi::c_void;
use std::fs::File;
use std::ptr::NonNull;

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn page_size_or_die() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

    if ret <= 0 {
        panic!("Unable to find page_size: errno={}", errno());
    }

    ret as usize
}

lazy_static::lazy_static! {
    static ref PAGE_SIZE: usize = page_size_or_die();
}

/// Returns the system page size.
#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE
}

fn assert_page_aligned(size: usize) {
    assert!(
        size > 0 && (size % page_size()) == 0,
        "Bad region size={} page_size={}",
        size,
        page_size()
    );
}

/// Attempts to reserve an *address space* region of `size` bytes.
///
/// The `size` argument must be a multiple of the page size.
pub fn reserve_region(size: usize) -> Result<NonNull<c_void>, i32> {
    assert_page_aligned(size);

    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        Err(errno())
    } else {
        Ok(NonNull::new(ptr).expect("mmap never returns a NULL mapping"))
    }
}

/// Releases a region of `size` bytes starting at `base`.
///
/// The size argument must be a multiple of the page size.
pub fn release_region(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
    if size == 0 {
        return Ok(());
    }
    assert_page_aligned(size);

    let ret = unsafe { libc::munmap(base.as_ptr(), size) };

    if ret == 0 {
        Ok(())
    } else {
        Err(errno())
    }
}

/// Backs a reserved region of `size` bytes starting at `base` with
/// (demand-faulted) memory.  On success the range reads as zero.
///
/// The size argument must be a multiple of the page size.
pub fn commit_region(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
    if size == 0 {
        return Ok(());
    }
    assert_page_aligned(size);

    // MAP_FIXED over our own reservation: replaces the PROT_NONE pages
    // with fresh anonymous ones, so re-committed ranges are zero-filled.
    let ptr = unsafe {
        libc::mmap(
            base.as_ptr(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
            -1,
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        Err(errno())
    } else {
        Ok(())
    }
}

/// Returns the backing store for `[base, base + size)` to the
/// operating system, leaving the address range reserved.
///
/// The size argument must be a multiple of the page size.
pub fn uncommit_region(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
    if size == 0 {
        return Ok(());
    }
    assert_page_aligned(size);

    let ptr = unsafe {
        libc::mmap(
            base.as_ptr(),
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_FIXED,
            -1,
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        Err(errno())
    } else {
        Ok(())
    }
}

/// Backs a reserved region with a shared mapping of `file`, growing
/// the file to `size` bytes.  Used by the file-backed mapper so the
/// operating system can swap cold pages out to the file.
pub fn commit_file_region(file: File, base: NonNull<c_void>, size: usize) -> Result<(), i32> {
    use std::os::unix::io::AsRawFd;

    if size == 0 {
        return Ok(());
    }
    assert_page_aligned(size);

    file.set_len(size as u64)
        .map_err(|e| e.raw_os_error().unwrap_or(0))?;

    let ptr = unsafe {
        libc::mmap(
            base.as_ptr(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_FIXED,
            file.as_raw_fd(),
            0,
        )
    };

    // The mapping keeps its own reference to the file; `file` may be
    // dropped (and the temporary unlinked) as soon as we return.
    if ptr == libc::MAP_FAILED {
        Err(errno())
    } else {
        Ok(())
    }
}

#[test]
fn test_page_size() {
    assert_ne!(page_size(), 0);

    // We only develop on platforms with 4K pages.
    assert_eq!(page_size(), 4096);
}

// Reserve a region, commit a few pages in the middle, scribble on
// them, then uncommit and re-commit to confirm the backing is dropped
// and comes back zero-filled.
#[test]
fn smoke_test() {
    let region_size = 1usize << 21;
    let base = reserve_region(region_size).expect("reserve should succeed");

    let window = NonNull::new((base.as_ptr() as usize + 4 * page_size()) as *mut c_void)
        .expect("Should be non-null");
    let window_size = 4 * page_size();

    commit_region(window, window_size).expect("should commit");

    let bytes = window.as_ptr() as *mut u8;
    unsafe {
        assert_eq!(std::ptr::read(bytes), 0);
        std::ptr::write(bytes, 42);
        std::ptr::write(bytes.add(window_size - 1), 42);
        assert_eq!(std::ptr::read(bytes), 42);
    }

    uncommit_region(window, window_size).expect("should uncommit");
    commit_region(window, window_size).expect("should re-commit");

    // Fresh pages again: the scribbles are gone.
    unsafe {
        assert_eq!(std::ptr::read(bytes), 0);
        assert_eq!(std::ptr::read(bytes.add(window_size - 1)), 0);
    }

    release_region(base, region_size).expect("should release everything");
}
