//! The register cache of a hart.
//!
//! Every logical register has an entry, indexed by its [`RegisterNumber`]. Custom
//! registers exposed through the configuration are appended after the built-in
//! ones. Entries only hold values; the rules for when the hardware is accessed
//! live with the hart (see `register_access`).

use crate::config::DebugConfig;
use crate::registers::{csr, csr_name, misa_has, RegisterNumber, FPR_NAMES, GPR_NAMES};

/// Group a register is listed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterGroup {
    /// General purpose registers, `pc` and `priv`.
    General,
    /// Floating point registers.
    Float,
    /// Control and status registers.
    Csr,
    /// Vector registers.
    Vector,
    /// Custom registers.
    Custom,
}

impl RegisterGroup {
    /// Name of the group as reported to a debugger front end.
    pub fn name(self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Float => "float",
            Self::Csr => "csr",
            Self::Vector => "vector",
            Self::Custom => "custom",
        }
    }
}

/// GDB target description feature a register belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterFeature {
    /// `org.gnu.gdb.riscv.cpu`
    Cpu,
    /// `org.gnu.gdb.riscv.fpu`
    Fpu,
    /// `org.gnu.gdb.riscv.csr`
    Csr,
    /// `org.gnu.gdb.riscv.virtual`
    Virtual,
    /// `org.gnu.gdb.riscv.vector`
    Vector,
    /// `org.gnu.gdb.riscv.custom`
    Custom,
}

impl RegisterFeature {
    /// Name of the feature.
    pub fn name(self) -> &'static str {
        match self {
            Self::Cpu => "org.gnu.gdb.riscv.cpu",
            Self::Fpu => "org.gnu.gdb.riscv.fpu",
            Self::Csr => "org.gnu.gdb.riscv.csr",
            Self::Virtual => "org.gnu.gdb.riscv.virtual",
            Self::Vector => "org.gnu.gdb.riscv.vector",
            Self::Custom => "org.gnu.gdb.riscv.custom",
        }
    }
}

/// How the value of a register is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterDataType {
    /// An integer.
    Integer,
    /// An address of code.
    CodePointer,
    /// `ieee_single`
    IeeeSingle,
    /// `ieee_double`
    IeeeDouble,
    /// A vector register, viewed as a union of element arrays.
    Vector,
}

#[derive(Debug, Clone)]
pub(crate) struct RegisterEntry {
    pub(crate) name: String,
    pub(crate) size_bits: u32,
    pub(crate) exist: bool,
    pub(crate) hidden: bool,
    pub(crate) valid: bool,
    pub(crate) dirty: bool,
    /// Little endian value, `size_bits / 8` bytes.
    pub(crate) value: Vec<u8>,
    pub(crate) group: RegisterGroup,
    pub(crate) feature: RegisterFeature,
    pub(crate) data_type: RegisterDataType,
    /// Index `n` of the abstract register `0xc000 + n`.
    pub(crate) custom_number: Option<u32>,
}

impl RegisterEntry {
    fn new(
        name: String,
        size_bits: u32,
        exist: bool,
        group: RegisterGroup,
        feature: RegisterFeature,
        data_type: RegisterDataType,
    ) -> Self {
        Self {
            name,
            size_bits,
            exist,
            hidden: false,
            valid: false,
            dirty: false,
            value: vec![0; size_bits.div_ceil(8) as usize],
            group,
            feature,
            data_type,
            custom_number: None,
        }
    }

    /// Store an integer value, truncated to the register size.
    pub(crate) fn set_value_u64(&mut self, value: u64) {
        let bytes = value.to_le_bytes();
        let len = self.value.len().min(8);
        self.value[..len].copy_from_slice(&bytes[..len]);
    }

    /// The cached value as an integer. Only the low 64 bits are returned.
    pub(crate) fn value_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        let len = self.value.len().min(8);
        bytes[..len].copy_from_slice(&self.value[..len]);
        u64::from_le_bytes(bytes)
    }
}

/// A register as listed by [`RegisterCache::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterDescription {
    /// Name of the register.
    pub name: String,
    /// Logical number of the register.
    pub number: RegisterNumber,
    /// Width in bits.
    pub size_bits: u32,
    /// Group of the register.
    pub group: RegisterGroup,
    /// Target description feature.
    pub feature: RegisterFeature,
    /// Interpretation of the value.
    pub data_type: RegisterDataType,
}

/// Cached register values of one hart.
#[derive(Debug, Default)]
pub struct RegisterCache {
    entries: Vec<RegisterEntry>,
}

impl RegisterCache {
    /// Build the register table of a hart.
    ///
    /// Existence follows `misa`: FPRs with F or D, vector registers with V,
    /// supervisor CSRs with S and hypervisor CSRs with H. `expose_csrs` and
    /// `expose_custom` add registers, `hide_csrs` is applied last.
    pub fn new(xlen: u32, misa: u64, vlenb: u64, config: &DebugConfig) -> Self {
        let mut entries = Vec::with_capacity(RegisterNumber::builtin_count() as usize);

        for name in GPR_NAMES {
            entries.push(RegisterEntry::new(
                name.to_string(),
                xlen,
                true,
                RegisterGroup::General,
                RegisterFeature::Cpu,
                RegisterDataType::Integer,
            ));
        }

        entries.push(RegisterEntry::new(
            "pc".to_string(),
            xlen,
            true,
            RegisterGroup::General,
            RegisterFeature::Cpu,
            RegisterDataType::CodePointer,
        ));

        let has_d = misa_has(misa, 'D');
        let has_fpu = has_d || misa_has(misa, 'F');
        for name in FPR_NAMES {
            entries.push(RegisterEntry::new(
                name.to_string(),
                if has_d { 64 } else { 32 },
                has_fpu,
                RegisterGroup::Float,
                RegisterFeature::Fpu,
                if has_d {
                    RegisterDataType::IeeeDouble
                } else {
                    RegisterDataType::IeeeSingle
                },
            ));
        }

        for number in 0..=0xfffu16 {
            let name = csr_name(number)
                .map(str::to_string)
                .unwrap_or_else(|| format!("csr{number}"));
            entries.push(RegisterEntry::new(
                name,
                xlen,
                csr_exists(number, misa),
                RegisterGroup::Csr,
                RegisterFeature::Csr,
                RegisterDataType::Integer,
            ));
        }

        entries.push(RegisterEntry::new(
            "priv".to_string(),
            8,
            true,
            RegisterGroup::General,
            RegisterFeature::Virtual,
            RegisterDataType::Integer,
        ));

        let has_vector = misa_has(misa, 'V') && vlenb > 0;
        for n in 0..32 {
            entries.push(RegisterEntry::new(
                format!("v{n}"),
                (vlenb * 8) as u32,
                has_vector,
                RegisterGroup::Vector,
                RegisterFeature::Vector,
                RegisterDataType::Vector,
            ));
        }

        for range in &config.expose_custom {
            for n in range.start..=range.last() {
                let name = range.name.clone().unwrap_or_else(|| format!("custom{n}"));
                let mut entry = RegisterEntry::new(
                    name,
                    xlen,
                    true,
                    RegisterGroup::Custom,
                    RegisterFeature::Custom,
                    RegisterDataType::Integer,
                );
                entry.custom_number = Some(n);
                entries.push(entry);
            }
        }

        let mut cache = Self { entries };

        for range in &config.expose_csrs {
            for n in range.start..=range.last() {
                if let Some(entry) = cache.entry_mut(RegisterNumber::csr(n as u16)) {
                    entry.exist = true;
                    if let Some(name) = &range.name {
                        entry.name = name.clone();
                    }
                }
            }
        }

        for range in &config.hide_csrs {
            for n in range.start..=range.last() {
                if let Some(entry) = cache.entry_mut(RegisterNumber::csr(n as u16)) {
                    entry.hidden = true;
                }
            }
        }

        cache
    }

    /// Whether the cache holds no registers. This is the case before examination.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn entry(&self, number: RegisterNumber) -> Option<&RegisterEntry> {
        self.entries.get(number.0 as usize)
    }

    pub(crate) fn entry_mut(&mut self, number: RegisterNumber) -> Option<&mut RegisterEntry> {
        self.entries.get_mut(number.0 as usize)
    }

    /// Whether `number` names a register that exists on the hart.
    pub fn exists(&self, number: RegisterNumber) -> bool {
        self.entry(number).is_some_and(|entry| entry.exist)
    }

    /// Whether the cached value of `number` is marked dirty.
    pub fn is_dirty(&self, number: RegisterNumber) -> bool {
        self.entry(number).is_some_and(|entry| entry.dirty)
    }

    /// Whether the cached value of `number` is valid.
    pub fn is_valid(&self, number: RegisterNumber) -> bool {
        self.entry(number).is_some_and(|entry| entry.valid)
    }

    /// Forget every cached value.
    pub(crate) fn invalidate(&mut self) {
        for entry in &mut self.entries {
            entry.valid = false;
            entry.dirty = false;
        }
    }

    /// Dirty registers, highest number first.
    pub(crate) fn dirty_registers(&self) -> Vec<RegisterNumber> {
        self.entries
            .iter()
            .enumerate()
            .rev()
            .filter(|(_, entry)| entry.dirty)
            .map(|(i, _)| RegisterNumber(i as u32))
            .collect()
    }

    /// Whether any register is dirty.
    pub fn any_dirty(&self) -> bool {
        self.entries.iter().any(|entry| entry.dirty)
    }

    /// Look a register up by name.
    pub fn find(&self, name: &str) -> Option<RegisterNumber> {
        self.entries
            .iter()
            .position(|entry| entry.exist && entry.name == name)
            .map(|i| RegisterNumber(i as u32))
    }

    /// The registers a debugger front end should show.
    pub fn list(&self) -> Vec<RegisterDescription> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.exist && !entry.hidden)
            .map(|(i, entry)| RegisterDescription {
                name: entry.name.clone(),
                number: RegisterNumber(i as u32),
                size_bits: entry.size_bits,
                group: entry.group,
                feature: entry.feature,
                data_type: entry.data_type,
            })
            .collect()
    }
}

fn csr_exists(number: u16, misa: u64) -> bool {
    let has = |letter| misa_has(misa, letter);

    match number {
        csr::FFLAGS | csr::FRM | csr::FCSR => has('F') || has('D'),
        csr::VSTART | csr::VXSAT | csr::VXRM | csr::VCSR | csr::VL | csr::VTYPE | csr::VLENB => {
            has('V')
        }
        csr::CYCLE | csr::TIME | csr::INSTRET => has('U'),
        // Delegation only exists with a lower privilege mode to delegate to.
        csr::MEDELEG | csr::MIDELEG => has('S'),
        0x100..=0x1ff => has('S') && csr_name(number).is_some(),
        0x200..=0x2ff | 0x600..=0x6ff => has('H') && csr_name(number).is_some(),
        _ => csr_name(number).is_some(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::RegisterRange;
    use pretty_assertions::assert_eq;

    // RV64IMAFDCSU
    const MISA_RV64GC: u64 = (2 << 62) | 0x14112d;

    #[test]
    fn fpu_follows_misa() {
        let cache = RegisterCache::new(64, MISA_RV64GC, 0, &DebugConfig::default());

        assert!(cache.exists(RegisterNumber::fpr(3)));
        assert_eq!(cache.entry(RegisterNumber::fpr(3)).unwrap().size_bits, 64);
        assert!(cache.exists(RegisterNumber::csr(csr::FCSR)));
        assert!(cache.exists(RegisterNumber::csr(csr::SATP)));
        assert!(!cache.exists(RegisterNumber::csr(csr::HSTATUS)));
        assert!(!cache.exists(RegisterNumber::vector(0)));
    }

    #[test]
    fn integer_only_hart() {
        // RV32IMAC
        let cache = RegisterCache::new(32, (1 << 30) | 0x1105, 0, &DebugConfig::default());

        assert!(!cache.exists(RegisterNumber::fpr(0)));
        assert!(!cache.exists(RegisterNumber::csr(csr::SATP)));
        assert!(cache.exists(RegisterNumber::csr(csr::DCSR)));
        assert_eq!(cache.find("a0"), Some(RegisterNumber::A0));
        assert_eq!(cache.find("pc"), Some(RegisterNumber::PC));
    }

    #[test]
    fn hiding_wins_over_exposing() {
        let config = DebugConfig {
            expose_csrs: vec![
                RegisterRange {
                    start: 0x7c0,
                    end: Some(0x7c3),
                    name: None,
                },
                RegisterRange {
                    start: 0x7c8,
                    end: None,
                    name: Some("mycsr".to_string()),
                },
            ],
            hide_csrs: vec![RegisterRange {
                start: 0x7c2,
                end: None,
                name: None,
            }],
            ..Default::default()
        };

        let cache = RegisterCache::new(32, 0, 0, &config);
        let names: Vec<_> = cache
            .list()
            .into_iter()
            .filter(|register| register.group == RegisterGroup::Csr)
            .map(|register| register.name)
            .filter(|name| name.starts_with("csr") || name == "mycsr")
            .collect();

        assert_eq!(names, vec!["csr1984", "csr1985", "csr1987", "mycsr"]);
    }

    #[test]
    fn custom_registers_are_appended() {
        let config = DebugConfig {
            expose_custom: vec![
                RegisterRange {
                    start: 1,
                    end: Some(2),
                    name: None,
                },
                RegisterRange {
                    start: 7,
                    end: None,
                    name: Some("counter".to_string()),
                },
            ],
            ..Default::default()
        };

        let cache = RegisterCache::new(32, 0, 0, &config);

        let first = cache.entry(RegisterNumber::custom(0)).unwrap();
        assert_eq!(first.name, "custom1");
        assert_eq!(first.custom_number, Some(1));

        let last = cache.entry(RegisterNumber::custom(2)).unwrap();
        assert_eq!(last.name, "counter");
        assert_eq!(last.custom_number, Some(7));
        assert_eq!(last.feature.name(), "org.gnu.gdb.riscv.custom");

        assert!(cache.entry(RegisterNumber::custom(3)).is_none());
    }

    #[test]
    fn invalidate_clears_flags() {
        let mut cache = RegisterCache::new(32, 0, 0, &DebugConfig::default());
        let entry = cache.entry_mut(RegisterNumber::S1).unwrap();
        entry.valid = true;
        entry.dirty = true;

        assert_eq!(cache.dirty_registers(), vec![RegisterNumber::S1]);

        cache.invalidate();

        assert!(!cache.is_valid(RegisterNumber::S1));
        assert!(!cache.any_dirty());
    }

    #[test]
    fn vector_registers_sized_by_vlenb() {
        // RV64IMACV
        let misa = (2 << 62) | (1 << 21) | 0x1105;
        let cache = RegisterCache::new(64, misa, 16, &DebugConfig::default());

        let v1 = cache.entry(RegisterNumber::vector(1)).unwrap();
        assert!(v1.exist);
        assert_eq!(v1.size_bits, 128);
        assert_eq!(v1.value.len(), 16);
    }
}
