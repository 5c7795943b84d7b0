//! Virtual to physical address translation by walking the hart's page tables.

use crate::error::{MemoryFaultKind, RiscvError};
use crate::hart::RiscvCore;
use crate::registers::{csr, Mstatus, PrivilegeLevel, RegisterNumber};

const PAGE_SHIFT: u32 = 12;

const PTE_V: u64 = 1 << 0;
const PTE_R: u64 = 1 << 1;
const PTE_W: u64 = 1 << 2;
const PTE_X: u64 = 1 << 3;
const PTE_PPN_SHIFT: u32 = 10;

/// `hstatus.HU`
const HSTATUS_HU: u64 = 1 << 9;

/// Layout of the page tables of one translation mode.
#[derive(Debug, PartialEq, Eq)]
pub struct TranslationProfile {
    pub name: &'static str,
    pub va_bits: u32,
    pub levels: usize,
    /// log2 of the size of a PTE.
    pub pte_shift: u32,
    pub vpn_shift: &'static [u32],
    pub vpn_mask: &'static [u64],
    pub pte_ppn_shift: &'static [u32],
    pub pte_ppn_mask: &'static [u64],
    pub pa_ppn_shift: &'static [u32],
    pub pa_ppn_mask: &'static [u64],
    /// G-stage profiles translate guest physical addresses.
    pub guest: bool,
}

pub const SV32: TranslationProfile = TranslationProfile {
    name: "Sv32",
    va_bits: 32,
    levels: 2,
    pte_shift: 2,
    vpn_shift: &[12, 22],
    vpn_mask: &[0x3ff, 0x3ff],
    pte_ppn_shift: &[10, 20],
    pte_ppn_mask: &[0x3ff, 0xfff],
    pa_ppn_shift: &[12, 22],
    pa_ppn_mask: &[0x3ff, 0xfff],
    guest: false,
};

pub const SV32X4: TranslationProfile = TranslationProfile {
    name: "Sv32x4",
    va_bits: 34,
    vpn_mask: &[0x3ff, 0xfff],
    guest: true,
    ..SV32
};

pub const SV39: TranslationProfile = TranslationProfile {
    name: "Sv39",
    va_bits: 39,
    levels: 3,
    pte_shift: 3,
    vpn_shift: &[12, 21, 30],
    vpn_mask: &[0x1ff, 0x1ff, 0x1ff],
    pte_ppn_shift: &[10, 19, 28],
    pte_ppn_mask: &[0x1ff, 0x1ff, 0x3ff_ffff],
    pa_ppn_shift: &[12, 21, 30],
    pa_ppn_mask: &[0x1ff, 0x1ff, 0x3ff_ffff],
    guest: false,
};

pub const SV39X4: TranslationProfile = TranslationProfile {
    name: "Sv39x4",
    va_bits: 41,
    vpn_mask: &[0x1ff, 0x1ff, 0x7ff],
    guest: true,
    ..SV39
};

pub const SV48: TranslationProfile = TranslationProfile {
    name: "Sv48",
    va_bits: 48,
    levels: 4,
    pte_shift: 3,
    vpn_shift: &[12, 21, 30, 39],
    vpn_mask: &[0x1ff, 0x1ff, 0x1ff, 0x1ff],
    pte_ppn_shift: &[10, 19, 28, 37],
    pte_ppn_mask: &[0x1ff, 0x1ff, 0x1ff, 0x1_ffff],
    pa_ppn_shift: &[12, 21, 30, 39],
    pa_ppn_mask: &[0x1ff, 0x1ff, 0x1ff, 0x1_ffff],
    guest: false,
};

pub const SV48X4: TranslationProfile = TranslationProfile {
    name: "Sv48x4",
    va_bits: 50,
    vpn_mask: &[0x1ff, 0x1ff, 0x1ff, 0x7ff],
    guest: true,
    ..SV48
};

pub const SV57: TranslationProfile = TranslationProfile {
    name: "Sv57",
    va_bits: 57,
    levels: 5,
    pte_shift: 3,
    vpn_shift: &[12, 21, 30, 39, 48],
    vpn_mask: &[0x1ff, 0x1ff, 0x1ff, 0x1ff, 0x1ff],
    pte_ppn_shift: &[10, 19, 28, 37, 46],
    pte_ppn_mask: &[0x1ff, 0x1ff, 0x1ff, 0x1ff, 0xff],
    pa_ppn_shift: &[12, 21, 30, 39, 48],
    pa_ppn_mask: &[0x1ff, 0x1ff, 0x1ff, 0x1ff, 0xff],
    guest: false,
};

pub const SV57X4: TranslationProfile = TranslationProfile {
    name: "Sv57x4",
    va_bits: 59,
    vpn_mask: &[0x1ff, 0x1ff, 0x1ff, 0x1ff, 0x7ff],
    guest: true,
    ..SV57
};

/// Translation mode of a `satp`, `vsatp` or `hgatp` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressTranslation {
    Off,
    Paged(&'static TranslationProfile),
    /// A mode the walker doesn't know.
    Unsupported(u64),
}

/// Raw `MODE` field of an address translation register.
pub fn atp_mode(value: u64, xlen: u32) -> u64 {
    if xlen == 32 {
        (value >> 31) & 1
    } else {
        (value >> 60) & 0xf
    }
}

/// Root page table number of an address translation register.
pub fn atp_ppn(value: u64, xlen: u32) -> u64 {
    if xlen == 32 {
        value & 0x3f_ffff
    } else {
        value & 0xfff_ffff_ffff
    }
}

/// Decode `satp` or `vsatp`.
pub fn satp_translation(value: u64, xlen: u32) -> AddressTranslation {
    match (xlen, atp_mode(value, xlen)) {
        (_, 0) => AddressTranslation::Off,
        (32, 1) => AddressTranslation::Paged(&SV32),
        (64, 8) => AddressTranslation::Paged(&SV39),
        (64, 9) => AddressTranslation::Paged(&SV48),
        (64, 10) => AddressTranslation::Paged(&SV57),
        (_, mode) => AddressTranslation::Unsupported(mode),
    }
}

/// Decode `hgatp`.
pub fn hgatp_translation(value: u64, xlen: u32) -> AddressTranslation {
    match (xlen, atp_mode(value, xlen)) {
        (_, 0) => AddressTranslation::Off,
        (32, 1) => AddressTranslation::Paged(&SV32X4),
        (64, 8) => AddressTranslation::Paged(&SV39X4),
        (64, 9) => AddressTranslation::Paged(&SV48X4),
        (64, 10) => AddressTranslation::Paged(&SV57X4),
        (_, mode) => AddressTranslation::Unsupported(mode),
    }
}

fn translation_fault(address: u64) -> RiscvError {
    RiscvError::MemoryFault {
        address,
        kind: MemoryFaultKind::Translation,
    }
}

/// Walk the page tables rooted at `ppn` to translate `address`.
///
/// `read_pte` reads the PTE at a (physical) address.
pub fn translate(
    profile: &TranslationProfile,
    ppn: u64,
    address: u64,
    xlen: u32,
    read_pte: &mut dyn FnMut(u64) -> Result<u64, RiscvError>,
) -> Result<u64, RiscvError> {
    let valid_address = if profile.guest {
        address >> profile.va_bits == 0
    } else {
        // Bits xlen-1 down to va_bits-1 must all be equal.
        let width = xlen.saturating_sub(profile.va_bits - 1);
        let mask = if width >= 64 { u64::MAX } else { (1u64 << width) - 1 };
        let msbs = (address >> (profile.va_bits - 1)) & mask;
        msbs == 0 || msbs == mask
    };

    if !valid_address {
        tracing::error!(
            "Virtual address {:#x} is not sign-extended for {}",
            address,
            profile.name
        );
        return Err(translation_fault(address));
    }

    let mut table = ppn << PAGE_SHIFT;
    let mut level = profile.levels;
    let pte = loop {
        if level == 0 {
            tracing::error!("No leaf PTE for {:#x} in {}", address, profile.name);
            return Err(translation_fault(address));
        }
        level -= 1;

        let vpn = (address >> profile.vpn_shift[level]) & profile.vpn_mask[level];
        let pte_address = table + (vpn << profile.pte_shift);
        let pte = read_pte(pte_address)?;

        tracing::debug!("{} level {}: PTE at {:#x} = {:#x}", profile.name, level, pte_address, pte);

        if pte & PTE_V == 0 || (pte & PTE_R == 0 && pte & PTE_W != 0) {
            tracing::error!(
                "Invalid PTE at {:#x}: {:#x} ({}, level {})",
                pte_address,
                pte,
                profile.name,
                level
            );
            return Err(translation_fault(address));
        }

        if pte & (PTE_R | PTE_W | PTE_X) != 0 {
            break pte;
        }

        table = (pte >> PTE_PPN_SHIFT) << PAGE_SHIFT;
    };

    let mut physical = address & ((1 << profile.va_bits) - 1);
    for i in level..profile.levels {
        let ppn = (pte >> profile.pte_ppn_shift[i]) & profile.pte_ppn_mask[i];
        physical &= !(profile.pa_ppn_mask[i] << profile.pa_ppn_shift[i]);
        physical |= ppn << profile.pa_ppn_shift[i];
    }

    tracing::debug!("{}: {:#x} -> {:#x}", profile.name, address, physical);

    Ok(physical)
}

impl RiscvCore<'_> {
    /// Privilege level that loads and stores run at, and whether the hart is in
    /// virtualization mode.
    ///
    /// `mstatus.MPRV` makes accesses use the privilege in `mstatus.MPP`.
    pub fn effective_privilege(&mut self) -> Result<(PrivilegeLevel, bool), RiscvError> {
        let privilege = self.read_register(RegisterNumber::PRIV)?;
        let virtualized = privilege & 0x4 != 0;

        let mstatus = Mstatus::from(self.read_register(RegisterNumber::csr(csr::MSTATUS))?);
        let level = if mstatus.mprv() {
            PrivilegeLevel::from_bits(mstatus.mpp() as u32)
        } else {
            PrivilegeLevel::from_bits(privilege as u32)
        };

        tracing::debug!("Effective privilege {:?}, virtualized {}", level, virtualized);

        Ok((level, virtualized))
    }

    /// Whether loads and stores of the halted hart go through address translation.
    pub(crate) fn mmu_enabled(&mut self) -> Result<bool, RiscvError> {
        if !self.hart.status.is_halted() {
            return Ok(false);
        }

        let xlen = self.hart.xlen;
        let (level, virtualized) = self.effective_privilege()?;

        if virtualized {
            if level == PrivilegeLevel::User {
                let hstatus = self.read_register(RegisterNumber::csr(csr::HSTATUS))?;
                if hstatus & HSTATUS_HU == 0 {
                    return Ok(false);
                }
            }

            let vsatp = self.read_register(RegisterNumber::csr(csr::VSATP))?;
            if atp_mode(vsatp, xlen) != 0 {
                tracing::debug!("VS-stage translation is enabled");
                return Ok(true);
            }

            let hgatp = self.read_register(RegisterNumber::csr(csr::HGATP))?;
            let enabled = atp_mode(hgatp, xlen) != 0;
            tracing::debug!("G-stage translation enabled: {}", enabled);
            return Ok(enabled);
        }

        if level == PrivilegeLevel::Machine {
            tracing::debug!("satp is ignored in machine mode");
            return Ok(false);
        }

        match self.read_register(RegisterNumber::csr(csr::SATP)) {
            Ok(satp) => Ok(atp_mode(satp, xlen) != 0),
            Err(RiscvError::AbstractCommand(_)) => {
                tracing::debug!("satp is not readable, assuming there is no MMU");
                Ok(false)
            }
            Err(error) => Err(error),
        }
    }

    /// Whether virtual addresses are translated by walking the page tables.
    pub fn mmu(&mut self) -> Result<bool, RiscvError> {
        if !self.config.enable_virt2phys {
            return Ok(false);
        }
        self.mmu_enabled()
    }

    fn read_pte(&mut self, address: u64, pte_shift: u32) -> Result<u64, RiscvError> {
        let mut buffer = [0u8; 8];
        let length = 1 << pte_shift;
        self.read_phys_memory(address, 4, length / 4, &mut buffer[..length])?;
        Ok(u64::from_le_bytes(buffer))
    }

    /// Translate `address` the way the hart would.
    ///
    /// Addresses are returned unchanged when translation is off.
    pub fn virt2phys(&mut self, address: u64) -> Result<u64, RiscvError> {
        if !self.mmu()? {
            tracing::debug!("MMU is disabled, {:#x} maps to itself", address);
            return Ok(address);
        }

        let xlen = self.hart.xlen;
        let privilege = self.read_register(RegisterNumber::PRIV)?;
        if privilege & 0x4 != 0 {
            return self.virt2phys_virtualized(address);
        }

        let satp = self.read_register(RegisterNumber::csr(csr::SATP))?;
        let profile = match satp_translation(satp, xlen) {
            AddressTranslation::Paged(profile) => profile,
            AddressTranslation::Off => {
                tracing::error!("No translation or protection (satp: {:#x})", satp);
                return Err(translation_fault(address));
            }
            AddressTranslation::Unsupported(mode) => {
                tracing::error!("Translation mode {} is not supported (satp: {:#x})", mode, satp);
                return Err(RiscvError::Unsupported("address translation mode"));
            }
        };

        let shift = profile.pte_shift;
        translate(profile, atp_ppn(satp, xlen), address, xlen, &mut |pte_address| {
            self.read_pte(pte_address, shift)
        })
    }

    /// Two-stage translation: VS-stage through `vsatp`, then G-stage through `hgatp`.
    fn virt2phys_virtualized(&mut self, address: u64) -> Result<u64, RiscvError> {
        let xlen = self.hart.xlen;
        let vsatp = self.read_register(RegisterNumber::csr(csr::VSATP))?;
        let hgatp = self.read_register(RegisterNumber::csr(csr::HGATP))?;

        let vs_stage = match satp_translation(vsatp, xlen) {
            AddressTranslation::Paged(profile) => Some(profile),
            AddressTranslation::Off => None,
            AddressTranslation::Unsupported(mode) => {
                tracing::error!("vsatp mode {} is not supported (vsatp: {:#x})", mode, vsatp);
                return Err(RiscvError::Unsupported("address translation mode"));
            }
        };
        let g_stage = match hgatp_translation(hgatp, xlen) {
            AddressTranslation::Paged(profile) => Some(profile),
            AddressTranslation::Off => None,
            AddressTranslation::Unsupported(mode) => {
                tracing::error!("hgatp mode {} is not supported (hgatp: {:#x})", mode, hgatp);
                return Err(RiscvError::Unsupported("address translation mode"));
            }
        };
        let hgatp_ppn = atp_ppn(hgatp, xlen);

        let guest_physical = match vs_stage {
            Some(profile) => {
                // VS-stage page tables live in guest physical memory.
                let shift = profile.pte_shift;
                translate(profile, atp_ppn(vsatp, xlen), address, xlen, &mut |pte_address| {
                    let pte_address = match g_stage {
                        Some(g_profile) => {
                            let g_shift = g_profile.pte_shift;
                            translate(g_profile, hgatp_ppn, pte_address, xlen, &mut |g_pte| {
                                self.read_pte(g_pte, g_shift)
                            })?
                        }
                        None => pte_address,
                    };
                    self.read_pte(pte_address, shift)
                })?
            }
            None => address,
        };

        match g_stage {
            Some(profile) => {
                let shift = profile.pte_shift;
                translate(profile, hgatp_ppn, guest_physical, xlen, &mut |pte_address| {
                    self.read_pte(pte_address, shift)
                })
            }
            None => Ok(guest_physical),
        }
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    fn walk(
        profile: &TranslationProfile,
        ppn: u64,
        address: u64,
        xlen: u32,
        tables: &HashMap<u64, u64>,
    ) -> Result<u64, RiscvError> {
        translate(profile, ppn, address, xlen, &mut |pte_address| {
            Ok(tables.get(&pte_address).copied().unwrap_or(0))
        })
    }

    #[test]
    fn sv39_megapage() {
        let root = 0x80000;
        let leaf = (0x12345 << PTE_PPN_SHIFT) | PTE_V | PTE_R | PTE_W | PTE_X;
        let next_table = 0x80001;

        let mut tables = HashMap::new();
        // vpn[2] = 0xff, vpn[1] = 0x1ff
        tables.insert((root << 12) + 0xff * 8, (next_table << PTE_PPN_SHIFT) | PTE_V);
        tables.insert((next_table << 12) + 0x1ff * 8, leaf);

        let physical = walk(&SV39, root, 0x3f_ffff_f000, 64, &tables).unwrap();
        assert_eq!(physical, 0x123f_f000);
    }

    #[test]
    fn sv32_page() {
        let root = 0x400;
        let mut tables = HashMap::new();
        tables.insert((root << 12) + 0x3 * 4, (0x401 << PTE_PPN_SHIFT) | PTE_V);
        tables.insert(
            (0x401 << 12) + 0x2 * 4,
            (0x8_0123 << PTE_PPN_SHIFT) | PTE_V | PTE_R,
        );

        let physical = walk(&SV32, root, 0x00c0_2abc, 32, &tables).unwrap();
        assert_eq!(physical, 0x8012_3abc);
    }

    #[test]
    fn invalid_pte_faults() {
        let tables = HashMap::new();
        let error = walk(&SV39, 0x80000, 0x1000, 64, &tables).unwrap_err();
        assert!(matches!(
            error,
            RiscvError::MemoryFault {
                address: 0x1000,
                kind: MemoryFaultKind::Translation
            }
        ));
    }

    #[test]
    fn write_only_pte_faults() {
        let mut tables = HashMap::new();
        tables.insert(0x8000_0000, PTE_V | PTE_W);
        let error = walk(&SV39, 0x80000, 0x1000, 64, &tables).unwrap_err();
        assert!(matches!(error, RiscvError::MemoryFault { .. }));
    }

    #[test_case(0x0000_0040_0000_0000, false; "above sv39 range")]
    #[test_case(0xffff_ffc0_0000_0000, true; "sign extended")]
    #[test_case(0x0000_003f_ffff_f000, true; "top of lower half")]
    fn sign_extension(address: u64, valid: bool) {
        let leaf = PTE_V | PTE_R;
        let mut tables = HashMap::new();
        for vpn in 0..0x200 {
            tables.insert(0x8000_0000 + vpn * 8, leaf);
        }

        let result = walk(&SV39, 0x80000, address, 64, &tables);
        assert_eq!(result.is_ok(), valid);
    }

    #[test_case(0, 64, AddressTranslation::Off)]
    #[test_case(8 << 60, 64, AddressTranslation::Paged(&SV39))]
    #[test_case(9 << 60, 64, AddressTranslation::Paged(&SV48))]
    #[test_case(10 << 60, 64, AddressTranslation::Paged(&SV57))]
    #[test_case(1 << 31, 32, AddressTranslation::Paged(&SV32))]
    #[test_case(11 << 60, 64, AddressTranslation::Unsupported(11))]
    fn satp_modes(satp: u64, xlen: u32, expected: AddressTranslation) {
        assert_eq!(satp_translation(satp, xlen), expected);
    }

    #[test]
    fn hgatp_modes() {
        assert_eq!(hgatp_translation(8 << 60, 64), AddressTranslation::Paged(&SV39X4));
        assert_eq!(hgatp_translation(1 << 31, 32), AddressTranslation::Paged(&SV32X4));
        assert_eq!(atp_ppn((8 << 60) | 0x1234, 64), 0x1234);
    }

    #[test]
    fn guest_physical_addresses_are_not_sign_extended() {
        let mut tables = HashMap::new();
        // vpn[2] of 0x100_0000_0000 in Sv39x4 is 0x400.
        tables.insert(0x8000_0000 + 0x400 * 8, PTE_V | PTE_R | (0x4_0000 << PTE_PPN_SHIFT));

        let physical = walk(&SV39X4, 0x80000, 0x100_0000_0000, 64, &tables).unwrap();
        assert_eq!(physical, 0x4000_0000);
    }
}
