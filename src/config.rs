//! Runtime configuration.

use bitflags::bitflags;

/// Tunables fixed at VM creation.
#[derive(Debug, Clone, Copy)]
pub struct VmConfig {
    /// Initial size of the value heap, in values.
    pub heap_initial: usize,
    /// Minimum free register slack kept above the frame top.
    pub stack_min: usize,
    /// Maximum number of dead strings retained by the string cache.
    pub string_cache_max: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            heap_initial: 256,
            stack_min: 32,
            string_cache_max: 100,
        }
    }
}

bitflags! {
    /// Flags passed through to the module loader and honored by the core
    /// where applicable (`LIST`/`LIST_ASM` request disassembly output).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LoadFlags: u32 {
        /// Stop after loading; do not compile.
        const NO_COMPILE = 0x0001;
        /// Compile but skip module initialization.
        const NO_INIT = 0x0002;
        /// Request a source listing.
        const LIST = 0x0004;
        /// Request a disassembly listing.
        const LIST_ASM = 0x0008;
        /// Treat warnings as errors.
        const WERROR = 0x0010;
        /// Disable operator precedence inference.
        const NO_PRECEDENCE = 0x0020;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = VmConfig::default();
        assert_eq!(c.heap_initial, 256);
        assert_eq!(c.stack_min, 32);
        assert_eq!(c.string_cache_max, 100);
    }
}
