//! # Global Memory Registry
//!
//! One explicitly constructed value at the top of the program owns every
//! memory area:
//!
//! - a fixed number of application areas, reserved at init and looked up
//!   by handle in O(1)
//! - the engine area with its `"Permanent"` and `"Scratch"` sub-areas
//!
//! ```rust,ignore
//! let memory = GlobalMemory::init(4, 16 * MIB, 8 * MIB, 1 * MIB)?;
//! let game = memory.add_memory_area("Game")?;
//! let area = memory.memory_area(game).ok_or(...)?;
//! area.init(64 * MIB, 4 * MIB)?;
//! ```

use std::cell::{Cell, OnceCell};

use crate::allocator::AllocatorKind;
use crate::area::{AreaState, MemoryArea};
use crate::arena::Arena;
use crate::bounds::DefaultBoundsChecking;
use crate::config::MemoryConfig;
use crate::error::{MemoryError, MemoryResult};
use crate::handle::{MemoryAreaHandle, SubAreaHandle};
use crate::report::report;

/// Name of the engine's own area.
pub const ENGINE_AREA: &str = "Engine";

/// Name of the engine's permanent sub-area.
pub const PERMANENT_SUB_AREA: &str = "Permanent";

/// Registry of every memory area.
///
/// # Thread Safety
///
/// `!Sync`. Create it on the main thread before anything allocates.
pub struct GlobalMemory {
    /// Slots reserved at init, filled in registration order.
    areas: Box<[OnceCell<MemoryArea>]>,
    /// Next free slot.
    next: Cell<usize>,
    engine: MemoryArea,
    permanent: SubAreaHandle,
    shut_down: bool,
}

impl GlobalMemory {
    /// Reserves `num_areas` registry slots and brings up the engine area.
    ///
    /// The engine area holds `engine_bytes + scratch_bytes`. Scratch is
    /// carved first, then `permanent_bytes` of permanent storage.
    ///
    /// # Errors
    ///
    /// Reports a failed bulk allocation or a permanent sub-area larger
    /// than `engine_bytes`.
    #[track_caller]
    pub fn init(
        num_areas: usize,
        engine_bytes: usize,
        permanent_bytes: usize,
        scratch_bytes: usize,
    ) -> MemoryResult<Self> {
        let engine = MemoryArea::new(ENGINE_AREA);
        engine.init(engine_bytes, scratch_bytes)?;
        let permanent = if permanent_bytes > 0 {
            engine.add_sub_area(permanent_bytes, PERMANENT_SUB_AREA)?
        } else {
            SubAreaHandle::INVALID
        };

        tracing::info!(
            "global memory initialized: {} area slots, engine {} bytes (permanent {}, scratch {})",
            num_areas,
            engine_bytes,
            permanent_bytes,
            scratch_bytes
        );

        Ok(Self {
            areas: (0..num_areas).map(|_| OnceCell::new()).collect(),
            next: Cell::new(0),
            engine,
            permanent,
            shut_down: false,
        })
    }

    /// [`GlobalMemory::init`] with the slot count fixed at compile time.
    ///
    /// # Errors
    ///
    /// Same as [`GlobalMemory::init`].
    #[track_caller]
    pub fn init_for<const N: usize>(
        engine_bytes: usize,
        permanent_bytes: usize,
        scratch_bytes: usize,
    ) -> MemoryResult<Self> {
        Self::init(N, engine_bytes, permanent_bytes, scratch_bytes)
    }

    /// Builds the registry and every configured area and sub-area.
    ///
    /// The configured failure policy applies while building only. Hold
    /// [`MemoryConfig::scoped_failure_policy`] to keep it afterwards.
    ///
    /// # Errors
    ///
    /// Reports the first area or sub-area that cannot be built. Run
    /// [`MemoryConfig::validate`] first for readable messages.
    #[track_caller]
    pub fn from_config(config: &MemoryConfig) -> MemoryResult<Self> {
        let _policy = config.scoped_failure_policy();

        let engine = &config.engine;
        let memory = Self::init(
            config.areas.len(),
            engine.engine_bytes,
            engine.permanent_bytes,
            engine.scratch_bytes,
        )?;

        for area_config in &config.areas {
            let handle = memory.add_memory_area(&area_config.name)?;
            let area = memory.memory_area(handle).ok_or_else(|| {
                report(MemoryError::InvalidHandle {
                    index: handle.raw(),
                })
            })?;
            area.init(area_config.size, area_config.scratch)?;
            for sub_area in &area_config.sub_areas {
                area.add_sub_area(sub_area.size, &sub_area.name)?;
            }
        }
        Ok(memory)
    }

    /// Registers a new, uninitialized area.
    ///
    /// # Errors
    ///
    /// Reports a full registry and calls after shutdown.
    #[track_caller]
    pub fn add_memory_area(&self, name: &str) -> MemoryResult<MemoryAreaHandle> {
        if self.shut_down {
            return Err(report(MemoryError::Lifecycle {
                area: name.to_owned(),
                operation: "register",
                state: AreaState::ShutDown,
            }));
        }

        let index = self.next.get();
        let handle = MemoryAreaHandle::from_index(index);
        let Some(slot) = self.areas.get(index).filter(|_| handle.is_valid()) else {
            return Err(report(MemoryError::RegistryFull {
                capacity: self.areas.len(),
            }));
        };
        if slot.set(MemoryArea::new(name)).is_err() {
            return Err(report(MemoryError::RegistryFull {
                capacity: self.areas.len(),
            }));
        }
        self.next.set(index + 1);

        tracing::debug!("memory area '{}' registered as #{}", name, index);
        Ok(handle)
    }

    /// The area behind `handle`, `None` for invalid or unknown handles.
    #[must_use]
    pub fn memory_area(&self, handle: MemoryAreaHandle) -> Option<&MemoryArea> {
        self.areas.get(handle.index()).and_then(OnceCell::get)
    }

    /// Mutable access, needed to shut a single area down early.
    pub fn memory_area_mut(&mut self, handle: MemoryAreaHandle) -> Option<&mut MemoryArea> {
        self.areas.get_mut(handle.index()).and_then(OnceCell::get_mut)
    }

    /// First registered area named `name`.
    #[must_use]
    pub fn memory_area_by_name(&self, name: &str) -> Option<MemoryAreaHandle> {
        self.areas
            .iter()
            .position(|slot| slot.get().is_some_and(|area| area.name() == name))
            .map(MemoryAreaHandle::from_index)
    }

    /// Number of registered areas.
    #[must_use]
    pub fn area_count(&self) -> usize {
        self.next.get()
    }

    /// Number of registry slots reserved at init.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.areas.len()
    }

    /// The engine's own area.
    #[must_use]
    pub fn engine_area(&self) -> &MemoryArea {
        &self.engine
    }

    /// A linear arena over the engine's permanent sub-area.
    ///
    /// # Errors
    ///
    /// Reports a missing permanent sub-area, one that already backs an
    /// arena, and calls after shutdown.
    #[track_caller]
    pub fn permanent_arena(&self) -> MemoryResult<Arena<'_, DefaultBoundsChecking>> {
        self.engine.create_arena(self.permanent, AllocatorKind::Linear)
    }

    /// A linear arena over the engine's scratch sub-area.
    ///
    /// # Errors
    ///
    /// Same as [`GlobalMemory::permanent_arena`].
    #[track_caller]
    pub fn scratch_arena(&self) -> MemoryResult<Arena<'_, DefaultBoundsChecking>> {
        let scratch = self
            .engine
            .scratch_sub_area()
            .unwrap_or(SubAreaHandle::INVALID);
        self.engine.create_arena(scratch, AllocatorKind::Linear)
    }

    /// Whether `shutdown` already ran.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Shuts every area down, newest first, engine area last, and clears
    /// the registry. Running it again does nothing.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }

        let registered = self.next.get();
        for slot in self.areas[..registered].iter_mut().rev() {
            if let Some(mut area) = slot.take() {
                if area.state() != AreaState::ShutDown {
                    let _ = area.shutdown();
                }
            }
        }
        self.next.set(0);

        if self.engine.state() != AreaState::ShutDown {
            let _ = self.engine.shutdown();
        }
        self.shut_down = true;

        tracing::info!("global memory shut down: {} areas released", registered);
    }
}

impl Drop for GlobalMemory {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for GlobalMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalMemory")
            .field("engine", &self.engine)
            .field("areas", &self.area_count())
            .field("capacity", &self.capacity())
            .field("shut_down", &self.shut_down)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;
    use crate::report;

    const KIB: usize = 1024;

    #[test]
    fn test_engine_area_layout() {
        let memory = GlobalMemory::init(2, 64 * KIB, 16 * KIB, 8 * KIB).unwrap();
        let engine = memory.engine_area();

        assert_eq!(engine.total_size(), 72 * KIB);
        let scratch = engine.sub_area_by_name("Scratch").unwrap();
        let permanent = engine.sub_area_by_name(PERMANENT_SUB_AREA).unwrap();
        assert_eq!(scratch.index(), 0);
        assert_eq!(engine.sub_area(permanent).unwrap().size(), 16 * KIB);
        assert_eq!(engine.remaining(), 48 * KIB);
    }

    #[test]
    fn test_registry_capacity_is_fixed() {
        let capture = report::capture();
        let memory = GlobalMemory::init_for::<2>(4 * KIB, 0, 0).unwrap();

        let a = memory.add_memory_area("Game").unwrap();
        let b = memory.add_memory_area("Audio").unwrap();
        assert_ne!(a, b);
        assert!(matches!(
            memory.add_memory_area("Extra"),
            Err(MemoryError::RegistryFull { capacity: 2 })
        ));
        assert_eq!(memory.area_count(), 2);
        assert_eq!(capture.count(), 1);
    }

    #[test]
    fn test_lookup_by_handle_and_name() {
        let memory = GlobalMemory::init(3, 4 * KIB, 0, 0).unwrap();
        let game = memory.add_memory_area("Game").unwrap();

        assert_eq!(memory.memory_area(game).unwrap().name(), "Game");
        assert_eq!(memory.memory_area_by_name("Game"), Some(game));
        assert!(memory.memory_area(MemoryAreaHandle::INVALID).is_none());
        assert!(memory.memory_area(MemoryAreaHandle::new(2)).is_none());
        assert!(memory.memory_area_by_name("Missing").is_none());
    }

    #[test]
    fn test_engine_arenas() {
        let memory = GlobalMemory::init(0, 64 * KIB, 32 * KIB, 16 * KIB).unwrap();

        let permanent = memory.permanent_arena().unwrap();
        let scratch = memory.scratch_arena().unwrap();
        assert_eq!(permanent.boundary().size(), 32 * KIB);
        assert_eq!(scratch.boundary().size(), 16 * KIB);
        assert!(!permanent.boundary().overlaps(&scratch.boundary()));

        let config = permanent.alloc([0u32; 64]).unwrap();
        assert_eq!(config.len(), 64);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let capture = report::capture();
        let mut memory = GlobalMemory::init(1, 4 * KIB, KIB, 0).unwrap();
        let game = memory.add_memory_area("Game").unwrap();
        memory.memory_area(game).unwrap().init(8 * KIB, 0).unwrap();

        memory.shutdown();
        assert!(memory.is_shut_down());
        assert!(memory.memory_area(game).is_none());
        assert_eq!(memory.engine_area().state(), AreaState::ShutDown);
        memory.shutdown();

        assert!(memory.add_memory_area("Late").is_err());
        assert!(memory.permanent_arena().is_err());
        assert_eq!(capture.count(), 2);
    }

    #[test]
    fn test_area_can_shut_down_early() {
        let memory_capture = report::capture();
        let mut memory = GlobalMemory::init(1, 4 * KIB, 0, 0).unwrap();
        let game = memory.add_memory_area("Game").unwrap();
        memory.memory_area(game).unwrap().init(KIB, 0).unwrap();

        memory.memory_area_mut(game).unwrap().shutdown().unwrap();
        memory.shutdown();
        assert_eq!(memory_capture.count(), 0);
    }

    #[test]
    fn test_from_config_builds_hierarchy() {
        let config = MemoryConfig::from_toml_str(
            r#"
            failure_policy = "log"

            [engine]
            engine_bytes = 8192
            permanent_bytes = 4096

            [[areas]]
            name = "Game"
            size = 4096
            scratch = 1024
            sub_areas = [{ name = "Level", size = 3000 }, { name = "Ui", size = 1000 }]
            "#,
        )
        .unwrap();

        let before = report::failure_policy();
        let memory = GlobalMemory::from_config(&config).unwrap();
        let game = memory.memory_area_by_name("Game").unwrap();
        let area = memory.memory_area(game).unwrap();

        assert_eq!(area.total_size(), 5120);
        assert_eq!(area.sub_area_count(), 3);
        assert_eq!(area.remaining(), 96);
        assert!(area.sub_area_by_name("Ui").is_some());
        // Building leaves the thread's policy alone.
        assert_eq!(report::failure_policy(), before);
    }

    #[test]
    fn test_from_config_reports_under_configured_policy() {
        let _abort = report::scoped_policy(report::FailurePolicy::Abort);
        let config = MemoryConfig::from_toml_str(
            r#"
            failure_policy = "log"

            [engine]
            engine_bytes = 4096
            permanent_bytes = 1024

            [[areas]]
            name = "Game"
            size = 1024
            sub_areas = [{ name = "Level", size = 2048 }]
            "#,
        )
        .unwrap();

        let reported = Rc::new(Cell::new(0));
        let sink = Rc::clone(&reported);
        let _hook = report::set_report_hook(move |_| sink.set(sink.get() + 1));

        // The thread aborts on failure, the configured `Log` returns instead.
        assert!(GlobalMemory::from_config(&config).is_err());
        assert_eq!(reported.get(), 1);
        assert_eq!(report::failure_policy(), report::FailurePolicy::Abort);

        let kept = config.scoped_failure_policy();
        assert_eq!(report::failure_policy(), report::FailurePolicy::Log);
        drop(kept);
        assert_eq!(report::failure_policy(), report::FailurePolicy::Abort);
    }
}
