//! A `Mapper` is responsible for acquiring address space and backing
//! memory from the operating system.  Each arena is parameterised on
//! such a `Mapper`; chunks call back into it for every reserve,
//! commit, and uncommit.
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

use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::Mutex;

#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use crate::debug_arange_map;

#[allow(clippy::inline_fn_without_body)]
#[contract_trait]
pub trait Mapper: std::fmt::Debug + Sync {
    /// Returns the mapping granularity for this mapper.  All calls
    /// into the mapper will align addresses and sizes to that page
    /// size.
    ///
    /// The page size must be constant for the lifetime of a process.
    #[ensures(ret > 0 && ret & (ret - 1) == 0, "page size must be a power of 2")]
    fn page_size(&self) -> usize;

    /// Attempts to reserve a range of address space.  On success,
    /// returns the address of the first byte in the reserved range,
    /// and the number of bytes actually reserved.  Both values are
    /// aligned to the `page_size()`.
    ///
    /// The range is address space only: nothing in it may be accessed
    /// until a subrange has been committed.
    #[requires(desired_size % self.page_size() == 0)]
    #[requires(desired_size > 0)]
    #[ensures(ret.is_ok() -> debug_arange_map::reserve_range(ret.unwrap().0.as_ptr() as usize, ret.unwrap().1).is_ok())]
    #[ensures(ret.is_ok() -> ret.as_ref().unwrap().0.as_ptr() != std::ptr::null_mut(),
              "The reserved range never includes NULL")]
    #[ensures(ret.is_ok() -> ret.as_ref().unwrap().1 < usize::MAX - ret.as_ref().unwrap().0.as_ptr() as usize,
              "The reserved range never overflows")]
    fn reserve(&self, desired_size: usize) -> Result<(NonNull<c_void>, usize), i32>;

    /// Releases a whole range that was previously obtained with a
    /// single call to `reserve`, committed subranges included.
    #[requires(base.as_ptr() as usize % self.page_size() == 0)]
    #[requires(size % self.page_size() == 0)]
    #[requires(debug_arange_map::releasable_range(base.as_ptr() as usize, size).is_ok())]
    #[ensures(ret.is_ok() -> debug_arange_map::release_range(base.as_ptr() as usize, size).is_ok())]
    fn release(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32>;

    /// Commits a page-aligned subrange of a reserved range for read
    /// and write access.  On successful return, the range is
    /// zero-filled.
    #[requires(base.as_ptr() as usize % self.page_size() == 0)]
    #[requires(size % self.page_size() == 0)]
    #[requires(debug_arange_map::can_commit_range(base.as_ptr() as usize, size).is_ok())]
    #[ensures(ret.is_ok() -> debug_arange_map::commit_range(base.as_ptr() as usize, size).is_ok())]
    fn commit(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32>;

    /// Returns the backing store for a committed subrange to the
    /// operating system; the address range stays reserved.
    #[requires(base.as_ptr() as usize % self.page_size() == 0)]
    #[requires(size % self.page_size() == 0)]
    #[requires(debug_arange_map::can_uncommit_range(base.as_ptr() as usize, size).is_ok())]
    #[ensures(ret.is_ok() -> debug_arange_map::uncommit_range(base.as_ptr() as usize, size).is_ok())]
    fn uncommit(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32>;
}

/// The default mapper hands out anonymous demand-zero mappings.
#[derive(Debug)]
struct DefaultMapper {}

lazy_static::lazy_static! {
    static ref NAMED_MAPPERS: Mutex<HashMap<String, &'static dyn Mapper>> = {
        let mut map: HashMap<String, &'static dyn Mapper> = HashMap::new();

        map.insert("file".to_string(), Box::leak(Box::new(crate::file_backed_mapper::FileBackedMapper{})));
        Mutex::new(map)
    };
}

/// Upserts the mapper associated with `name`.
pub fn register_mapper(name: String, mapper: &'static dyn Mapper) {
    let mut mappers = NAMED_MAPPERS.lock().unwrap();

    mappers.insert(name, mapper);
}

/// Returns the mapper for the given `name`, if one exists, or the
/// default mapper if `name` is `None`.
///
/// # Errors
///
/// Returns `Err` if no such mapper is defined.
pub fn get_mapper(name: Option<&str>) -> Result<&'static dyn Mapper, &'static str> {
    lazy_static::lazy_static! {
        static ref DEFAULT_MAPPER: DefaultMapper = DefaultMapper{};
    }

    match name {
        Some(key) => {
            let mappers = NAMED_MAPPERS.lock().unwrap();

            Ok(*mappers.get(key).ok_or("Mapper not found")?)
        }
        None => Ok(&*DEFAULT_MAPPER),
    }
}

#[contract_trait]
impl Mapper for DefaultMapper {
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
        crate::map::commit_region(base, size)
    }

    fn uncommit(&self, base: NonNull<c_void>, size: usize) -> Result<(), i32> {
        crate::map::uncommit_region(base, size)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_mapper_round_trip() {
        let mapper = get_mapper(None).expect("default mapper exists");
        let page = mapper.page_size();

        let (base, size) = mapper.reserve(16 * page).expect("reserve should succeed");
        assert_eq!(size, 16 * page);

        mapper.commit(base, 2 * page).expect("commit should succeed");
        unsafe {
            std::ptr::write(base.as_ptr() as *mut u8, 7);
            assert_eq!(std::ptr::read(base.as_ptr() as *const u8), 7);
        }

        mapper.uncommit(base, 2 * page).expect("uncommit should succeed");
        mapper.release(base, size).expect("release should succeed");
    }

    #[test]
    fn named_lookup() {
        assert!(get_mapper(Some("file")).is_ok());
        assert!(get_mapper(Some("no such mapper")).is_err());
    }
}
