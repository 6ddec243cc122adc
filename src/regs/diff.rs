// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use alloc::format;
use core::fmt::Debug;

use x86_64::registers::control::Cr0Flags;

use super::GeneralRegisters;

/// The comparison result of all general-purpose registers after a change.
pub struct GeneralRegistersDiff {
    old: GeneralRegisters,
    new: GeneralRegisters,
}

impl GeneralRegistersDiff {
    const RSP_INDEX: u8 = 4;

    /// Creates a new `GeneralRegistersDiff` instance by comparing two `GeneralRegisters` instances.
    pub fn new(old: GeneralRegisters, new: GeneralRegisters) -> Self {
        GeneralRegistersDiff { old, new }
    }

    /// Returns `true` if all general-purpose registers are unchanged.
    pub fn is_same(&self) -> bool {
        self.old == self.new
    }
}

impl Debug for GeneralRegistersDiff {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        let mut debug = f.debug_struct("GeneralRegistersDiff");

        for i in (0..16).filter(|&i| i != Self::RSP_INDEX) {
            let old = self.old.get_reg_of_index(i);
            let new = self.new.get_reg_of_index(i);

            if old != new {
                debug.field(
                    GeneralRegisters::register_name(i),
                    &format!("{old:#x} -> {new:#x}"),
                );
            }
        }

        debug.finish()
    }
}

/// The bit-level difference between two guest CR0 values.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Cr0Diff {
    old: Cr0Flags,
    new: Cr0Flags,
}

impl Cr0Diff {
    pub fn new(old: u64, new: u64) -> Self {
        Self {
            old: Cr0Flags::from_bits_retain(old),
            new: Cr0Flags::from_bits_retain(new),
        }
    }

    /// Bits that are clear in the old value and set in the new one.
    pub fn newly_set(&self) -> Cr0Flags {
        self.new.difference(self.old)
    }

    /// Bits that are set in the old value and clear in the new one.
    pub fn newly_cleared(&self) -> Cr0Flags {
        self.old.difference(self.new)
    }

    /// Applies the subset of this change that is mirrored into the hardware
    /// CR0: enabling protection or paging, and re-enabling caching.
    pub fn apply_to_hardware(&self, hw_cr0: u64) -> u64 {
        let mut hw = Cr0Flags::from_bits_retain(hw_cr0);
        let set = self.newly_set() & (Cr0Flags::PROTECTED_MODE_ENABLE | Cr0Flags::PAGING);
        let cleared =
            self.newly_cleared() & (Cr0Flags::CACHE_DISABLE | Cr0Flags::NOT_WRITE_THROUGH);
        hw.insert(set);
        hw.remove(cleared);
        hw.bits()
    }
}

impl Debug for Cr0Diff {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Cr0Diff")
            .field("set", &self.newly_set())
            .field("cleared", &self.newly_cleared())
            .finish()
    }
}
