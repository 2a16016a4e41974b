//! Tunables of the allocator.

/// How much `free` checks a pointer before trusting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FreeCheck {
    /// Bounds, alignment and the block's own boundary tags. Constant time, but
    /// a pointer into the middle of a payload that happens to look like a
    /// block can slip through.
    Tags,
    /// Everything [`FreeCheck::Tags`] does, plus a walk of the owning region
    /// from its first block to prove the pointer starts a live block.
    #[default]
    Walk,
}

/// Configuration of an [`crate::Allocator`].
///
/// ```
/// use memalloc::{AllocatorConfig, FreeCheck};
///
/// let config = AllocatorConfig::new()
///     .with_initial_pages(4)
///     .with_free_check(FreeCheck::Tags);
///
/// assert_eq!(config.initial_pages, 4);
/// assert_eq!(config.max_growth_multiplier, 64);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorConfig {
    /// Pages mapped by `init`.
    pub initial_pages: usize,
    /// Multiplier applied to the first growth of the arena. Every successful
    /// growth doubles it.
    pub initial_growth_multiplier: usize,
    /// The multiplier stops doubling once it reaches this value.
    pub max_growth_multiplier: usize,
    /// Validation performed by `free`.
    pub free_check: FreeCheck,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl AllocatorConfig {
    pub const fn new() -> Self {
        Self {
            initial_pages: 1,
            initial_growth_multiplier: 1,
            max_growth_multiplier: 64,
            free_check: FreeCheck::Walk,
        }
    }

    pub const fn with_initial_pages(mut self, pages: usize) -> Self {
        self.initial_pages = pages;
        self
    }

    pub const fn with_initial_growth_multiplier(mut self, multiplier: usize) -> Self {
        self.initial_growth_multiplier = multiplier;
        self
    }

    pub const fn with_max_growth_multiplier(mut self, multiplier: usize) -> Self {
        self.max_growth_multiplier = multiplier;
        self
    }

    pub const fn with_free_check(mut self, free_check: FreeCheck) -> Self {
        self.free_check = free_check;
        self
    }

    /// Same configuration with every zero replaced by one, and the maximum
    /// multiplier raised to the initial one if it was lower.
    pub(crate) fn normalized(self) -> Self {
        let initial_growth_multiplier = self.initial_growth_multiplier.max(1);

        Self {
            initial_pages: self.initial_pages.max(1),
            initial_growth_multiplier,
            max_growth_multiplier: self.max_growth_multiplier.max(initial_growth_multiplier),
            free_check: self.free_check,
        }
    }
}
