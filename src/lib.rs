//! Quarry is an embeddable virtual-memory arena for tracing
//! collectors: it reserves large regions of address space, maps and
//! unmaps individual pages on demand, partitions the space into zones
//! selectable by reference-set masks, hands page-aligned tracts to
//! pools, keeps recently freed pages mapped in a bounded hysteresis
//! fund, and decides when the collector above it should start a trace.

mod arena;
mod arith;
mod bit_table;
mod boot;
mod chain;
mod chunk;
mod config;
mod file_backed_mapper;
mod map;
mod mapper;
mod page;
mod policy;
mod pool;
mod zone;

#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
mod debug_allocation_map;
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
mod debug_arange_map;

/// Addresses are plain words: everything here refers to the flat
/// byte-addressed virtual address space.
pub type Addr = usize;

pub use arena::Arena;
pub use arena::ArenaClass;
pub use arena::ArenaError;
pub use arena::GEN_COUNT;
pub use chain::ChainId;
pub use chain::GenParams;
pub use file_backed_mapper::set_file_backed_arena_directory;
pub use mapper::get_mapper;
pub use mapper::register_mapper;
pub use mapper::Mapper;
pub use page::Tract;
pub use policy::SegPref;
pub use policy::StartReason;
pub use policy::Trace;
pub use pool::Pool;
pub use zone::zone_of_addr;
pub use zone::RefSet;
pub use zone::WORD_BITS;

/// Creates a VM arena for a C embedder; returns NULL on failure.
/// `user_size` is the initial reservation hint in bytes.
///
/// # Safety
///
/// The returned pointer must be destroyed exactly once with
/// `quarry_arena_destroy`.
#[no_mangle]
pub unsafe extern "C" fn quarry_arena_create(user_size: usize) -> *mut Arena {
    match Arena::create(ArenaClass::Vm, user_size) {
        Ok(arena) => Box::into_raw(Box::new(arena)),
        Err(_) => std::ptr::null_mut(),
    }
}

/// Destroys an arena created by `quarry_arena_create`; NULL is a
/// no-op.
///
/// # Safety
///
/// This function assumes `arena` is NULL or a live pointer from
/// `quarry_arena_create`.
#[no_mangle]
pub unsafe extern "C" fn quarry_arena_destroy(arena: *mut Arena) {
    if !arena.is_null() {
        drop(Box::from_raw(arena));
    }
}

/// Returns the arena's reserved address space in bytes.
///
/// # Safety
///
/// This function assumes `arena` is a live pointer from
/// `quarry_arena_create`.
#[no_mangle]
pub unsafe extern "C" fn quarry_arena_reserved(arena: *const Arena) -> usize {
    (*arena).reserved()
}

/// Returns the arena's committed bytes.
///
/// # Safety
///
/// This function assumes `arena` is a live pointer from
/// `quarry_arena_create`.
#[no_mangle]
pub unsafe extern "C" fn quarry_arena_committed(arena: *const Arena) -> usize {
    (*arena).committed()
}
