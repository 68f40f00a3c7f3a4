//! Discovery and selection of sleep and pivot gadgets.
//!
//! The registry keeps two pools: the addresses of `jmp .` sleep loops and the addresses
//! of `push <reg>; ret` pivots, each found inside the executable pages of a fixed set of
//! system modules. Discovery is lazy and runs at most once per process; manual
//! registration bypasses it entirely. Selection is uniformly random within a pool as a
//! defence-in-depth measure against sync-on-address races, not as a security property.

use std::sync::Mutex;

use rand::seq::SliceRandom;

use crate::asm::Register;
use crate::error::{NThreadError, Result};

/// Fixed preference order for pivot registers.
///
/// These are the registers least likely to be holding live data at an arbitrary
/// suspension point; RAX/RCX/RDX and R8-R11 are volatile scratch in the Microsoft x64
/// convention and frequently mid-use.
pub const PIVOT_PRIORITY: [Register; 4] =
    [Register::Rbx, Register::Rbp, Register::Rdi, Register::Rsi];

/// Modules searched during discovery, executable pages only.
#[cfg(all(windows, target_arch = "x86_64"))]
const SCAN_MODULES: [&str; 4] = ["ntdll.dll", "kernel32.dll", "kernelbase.dll", "msvcrt.dll"];

/// The two pools of usable gadget addresses.
pub struct GadgetRegistry {
    sleeps: Vec<u64>,
    pivots: Vec<(u64, Register)>,
    scanned: bool,
}

static REGISTRY: Mutex<GadgetRegistry> = Mutex::new(GadgetRegistry {
    sleeps: Vec::new(),
    pivots: Vec::new(),
    scanned: false,
});

impl GadgetRegistry {
    /// Creates an empty registry. Library users go through the process-wide one; an
    /// owned instance is useful for tests and for callers that plant their own gadgets.
    pub fn new() -> Self {
        Self {
            sleeps: Vec::new(),
            pivots: Vec::new(),
            scanned: false,
        }
    }

    /// Registers a sleep gadget address, bypassing discovery.
    pub fn register_sleep(&mut self, address: u64) {
        self.sleeps.push(address);
    }

    /// Registers a pivot gadget address for a specific register, bypassing discovery.
    pub fn register_pivot(&mut self, address: u64, reg: Register) {
        self.pivots.push((address, reg));
    }

    /// Picks a uniformly random sleep gadget, triggering discovery on first use.
    pub fn pick_sleep(&mut self) -> Result<u64> {
        self.ensure_scanned()?;
        self.sleeps
            .choose(&mut rand::thread_rng())
            .copied()
            .ok_or(NThreadError::NoSleepGadget)
    }

    /// Picks a pivot gadget, triggering discovery on first use.
    ///
    /// An explicit `preferred` register is honoured exclusively. Otherwise the classes
    /// in [`PIVOT_PRIORITY`] are tried in order and the pick is uniform within the first
    /// non-empty class.
    pub fn pick_pivot(&mut self, preferred: Option<Register>) -> Result<(u64, Register)> {
        self.ensure_scanned()?;

        let classes: &[Register] = match preferred {
            Some(ref reg) => std::slice::from_ref(reg),
            None => &PIVOT_PRIORITY,
        };

        for reg in classes {
            let candidates: Vec<u64> = self
                .pivots
                .iter()
                .filter(|(_, r)| r == reg)
                .map(|(addr, _)| *addr)
                .collect();
            if let Some(addr) = candidates.choose(&mut rand::thread_rng()) {
                return Ok((*addr, *reg));
            }
        }

        Err(NThreadError::NoPivotGadget)
    }

    /// Number of known sleep gadgets.
    pub fn sleep_count(&self) -> usize {
        self.sleeps.len()
    }

    /// Number of known pivot gadgets for a register.
    pub fn pivot_count(&self, reg: Register) -> usize {
        self.pivots.iter().filter(|(_, r)| *r == reg).count()
    }

    /// Runs the process-wide scan exactly once.
    fn ensure_scanned(&mut self) -> Result<()> {
        if self.scanned {
            return Ok(());
        }
        self.scanned = true;
        self.discover()
    }

    #[cfg(all(windows, target_arch = "x86_64"))]
    fn discover(&mut self) -> Result<()> {
        use crate::asm;
        use crate::native::Module;

        let sleep_pattern = asm::parse_pattern(&asm::to_pattern(&asm::jmp_self()))?;
        let pivot_patterns: Vec<(Vec<u8>, Register)> = asm::ALL_REGISTERS
            .iter()
            .map(|reg| -> Result<(Vec<u8>, Register)> {
                let bytes = asm::parse_pattern(&asm::to_pattern(&asm::push_ret(*reg)))?;
                Ok((bytes, *reg))
            })
            .collect::<Result<_>>()?;

        for name in SCAN_MODULES {
            // A module that cannot be opened simply contributes nothing.
            let Ok(module) = Module::open(name) else {
                continue;
            };

            self.sleeps.extend(module.scan(&sleep_pattern));
            for (pattern, reg) in &pivot_patterns {
                for addr in module.scan(pattern) {
                    self.pivots.push((addr, *reg));
                }
            }
        }

        crate::debug!(
            "gadget discovery: {} sleep, {} pivot candidates",
            self.sleeps.len(),
            self.pivots.len()
        );
        Ok(())
    }

    #[cfg(not(all(windows, target_arch = "x86_64")))]
    fn discover(&mut self) -> Result<()> {
        // No module scanner off-platform; only manually registered gadgets exist.
        Ok(())
    }
}

impl Default for GadgetRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registers a sleep gadget in the process-wide registry.
pub fn register_sleep(address: u64) {
    REGISTRY.lock().unwrap().register_sleep(address);
}

/// Registers a pivot gadget in the process-wide registry.
pub fn register_pivot(address: u64, reg: Register) {
    REGISTRY.lock().unwrap().register_pivot(address, reg);
}

/// Picks a sleep gadget from the process-wide registry.
pub fn pick_sleep() -> Result<u64> {
    REGISTRY.lock().unwrap().pick_sleep()
}

/// Picks a pivot gadget from the process-wide registry.
pub fn pick_pivot(preferred: Option<Register>) -> Result<(u64, Register)> {
    REGISTRY.lock().unwrap().pick_pivot(preferred)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Off-platform, ensure_scanned is a no-op, so an owned registry only ever contains
    // what the test plants; on Windows the discovery pools only grow the candidate sets.

    #[test]
    fn empty_registry_reports_missing_gadgets() {
        let mut registry = GadgetRegistry::new();
        // Discovery marked done with empty pools: both picks must fail.
        registry.scanned = true;
        assert!(matches!(
            registry.pick_sleep(),
            Err(NThreadError::NoSleepGadget)
        ));
        assert!(matches!(
            registry.pick_pivot(None),
            Err(NThreadError::NoPivotGadget)
        ));
    }

    #[test]
    fn manual_registration_feeds_selection() {
        let mut registry = GadgetRegistry::new();
        registry.scanned = true;
        registry.register_sleep(0x1000);
        registry.register_pivot(0x2000, Register::Rbx);

        assert_eq!(registry.pick_sleep().unwrap(), 0x1000);
        assert_eq!(
            registry.pick_pivot(None).unwrap(),
            (0x2000, Register::Rbx)
        );
    }

    #[test]
    fn priority_order_prefers_rbx_then_rbp() {
        let mut registry = GadgetRegistry::new();
        registry.scanned = true;
        registry.register_pivot(0x5000, Register::Rsi);
        registry.register_pivot(0x4000, Register::Rbp);

        // No RBX candidates: RBP is the first non-empty class.
        assert_eq!(
            registry.pick_pivot(None).unwrap(),
            (0x4000, Register::Rbp)
        );

        registry.register_pivot(0x3000, Register::Rbx);
        assert_eq!(
            registry.pick_pivot(None).unwrap(),
            (0x3000, Register::Rbx)
        );
    }

    #[test]
    fn explicit_preference_is_exclusive() {
        let mut registry = GadgetRegistry::new();
        registry.scanned = true;
        registry.register_pivot(0x3000, Register::Rbx);

        // A preference for a register with no candidates fails instead of falling back.
        assert!(matches!(
            registry.pick_pivot(Some(Register::R12)),
            Err(NThreadError::NoPivotGadget)
        ));
        assert_eq!(
            registry.pick_pivot(Some(Register::Rbx)).unwrap(),
            (0x3000, Register::Rbx)
        );
    }

    #[test]
    fn random_pick_stays_within_pool() {
        let mut registry = GadgetRegistry::new();
        registry.scanned = true;
        for addr in [0x10u64, 0x20, 0x30] {
            registry.register_sleep(addr);
        }
        for _ in 0..32 {
            assert!([0x10u64, 0x20, 0x30].contains(&registry.pick_sleep().unwrap()));
        }
    }
}
