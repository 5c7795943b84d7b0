//! Logical register numbers and the RISC-V CSRs the debug core relies on.
//!
//! Logical numbers are laid out the way GDB numbers RISC-V registers:
//! `x0`-`x31`, `pc`, `f0`-`f31`, the 4096 CSRs, the virtual `priv` register, the
//! vector registers and finally custom registers.

use bitfield::bitfield;

/// Logical number of a register of a hart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegisterNumber(pub u32);

const GPR_FIRST: u32 = 0;
const PC_NUMBER: u32 = 32;
const FPR_FIRST: u32 = 33;
const CSR_FIRST: u32 = 65;
const CSR_COUNT: u32 = 4096;
const PRIV_NUMBER: u32 = CSR_FIRST + CSR_COUNT;
const VECTOR_FIRST: u32 = PRIV_NUMBER + 1;
const CUSTOM_FIRST: u32 = VECTOR_FIRST + 32;

/// The class a [`RegisterNumber`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterKind {
    /// General purpose register `x<n>`.
    Gpr(u8),
    /// The program counter, backed by `dpc`.
    Pc,
    /// Floating point register `f<n>`.
    Fpr(u8),
    /// Control and status register.
    Csr(u16),
    /// The virtual privilege level register.
    Priv,
    /// Vector register `v<n>`.
    Vector(u8),
    /// The `n`-th custom register exposed by the configuration.
    Custom(u32),
}

impl RegisterNumber {
    /// `x0`, hardwired to zero.
    pub const ZERO: Self = Self::gpr(0);
    /// Return address.
    pub const RA: Self = Self::gpr(1);
    /// Stack pointer.
    pub const SP: Self = Self::gpr(2);
    /// First saved register, used as scratch by program buffer sequences.
    pub const S0: Self = Self::gpr(8);
    /// Second saved register, used as scratch by program buffer sequences.
    pub const S1: Self = Self::gpr(9);
    /// First argument register.
    pub const A0: Self = Self::gpr(10);
    /// Second argument register.
    pub const A1: Self = Self::gpr(11);
    /// The program counter.
    pub const PC: Self = Self(PC_NUMBER);
    /// The virtual privilege register.
    pub const PRIV: Self = Self(PRIV_NUMBER);

    /// General purpose register `x<n>`.
    pub const fn gpr(n: u8) -> Self {
        Self(GPR_FIRST + n as u32)
    }

    /// Floating point register `f<n>`.
    pub const fn fpr(n: u8) -> Self {
        Self(FPR_FIRST + n as u32)
    }

    /// CSR number `n`.
    pub const fn csr(n: u16) -> Self {
        Self(CSR_FIRST + n as u32)
    }

    /// Vector register `v<n>`.
    pub const fn vector(n: u8) -> Self {
        Self(VECTOR_FIRST + n as u32)
    }

    /// The `n`-th custom register exposed by the configuration.
    ///
    /// Its abstract register number comes from the exposed range, not from `n`.
    pub const fn custom(n: u32) -> Self {
        Self(CUSTOM_FIRST + n)
    }

    /// Class of this register.
    pub fn kind(self) -> RegisterKind {
        match self.0 {
            n if n < PC_NUMBER => RegisterKind::Gpr(n as u8),
            PC_NUMBER => RegisterKind::Pc,
            n if n < CSR_FIRST => RegisterKind::Fpr((n - FPR_FIRST) as u8),
            n if n < PRIV_NUMBER => RegisterKind::Csr((n - CSR_FIRST) as u16),
            PRIV_NUMBER => RegisterKind::Priv,
            n if n < CUSTOM_FIRST => RegisterKind::Vector((n - VECTOR_FIRST) as u8),
            n => RegisterKind::Custom(n - CUSTOM_FIRST),
        }
    }

    /// Number of logical registers excluding custom registers.
    pub(crate) const fn builtin_count() -> u32 {
        CUSTOM_FIRST
    }
}

/// ABI names of the general purpose registers.
pub const GPR_NAMES: [&str; 32] = [
    "zero", "ra", "sp", "gp", "tp", "t0", "t1", "t2", "fp", "s1", "a0", "a1", "a2", "a3", "a4",
    "a5", "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11", "t3", "t4",
    "t5", "t6",
];

/// ABI names of the floating point registers.
pub const FPR_NAMES: [&str; 32] = [
    "ft0", "ft1", "ft2", "ft3", "ft4", "ft5", "ft6", "ft7", "fs0", "fs1", "fa0", "fa1", "fa2",
    "fa3", "fa4", "fa5", "fa6", "fa7", "fs2", "fs3", "fs4", "fs5", "fs6", "fs7", "fs8", "fs9",
    "fs10", "fs11", "ft8", "ft9", "ft10", "ft11",
];

/// CSR numbers.
#[allow(missing_docs)]
pub mod csr {
    pub const FFLAGS: u16 = 0x001;
    pub const FRM: u16 = 0x002;
    pub const FCSR: u16 = 0x003;
    pub const VSTART: u16 = 0x008;
    pub const VXSAT: u16 = 0x009;
    pub const VXRM: u16 = 0x00a;
    pub const VCSR: u16 = 0x00f;
    pub const SSTATUS: u16 = 0x100;
    pub const STVEC: u16 = 0x105;
    pub const SEPC: u16 = 0x141;
    pub const SCAUSE: u16 = 0x142;
    pub const STVAL: u16 = 0x143;
    pub const SATP: u16 = 0x180;
    pub const VSSTATUS: u16 = 0x200;
    pub const VSATP: u16 = 0x280;
    pub const MSTATUS: u16 = 0x300;
    pub const MISA: u16 = 0x301;
    pub const MEDELEG: u16 = 0x302;
    pub const MIDELEG: u16 = 0x303;
    pub const MIE: u16 = 0x304;
    pub const MTVEC: u16 = 0x305;
    pub const MSCRATCH: u16 = 0x340;
    pub const MEPC: u16 = 0x341;
    pub const MCAUSE: u16 = 0x342;
    pub const MTVAL: u16 = 0x343;
    pub const MIP: u16 = 0x344;
    pub const HSTATUS: u16 = 0x600;
    pub const HGATP: u16 = 0x680;
    pub const TSELECT: u16 = 0x7a0;
    pub const TDATA1: u16 = 0x7a1;
    pub const TDATA2: u16 = 0x7a2;
    pub const TDATA3: u16 = 0x7a3;
    pub const TINFO: u16 = 0x7a4;
    pub const DCSR: u16 = 0x7b0;
    pub const DPC: u16 = 0x7b1;
    pub const DSCRATCH0: u16 = 0x7b2;
    pub const DSCRATCH1: u16 = 0x7b3;
    pub const MCYCLE: u16 = 0xb00;
    pub const MINSTRET: u16 = 0xb02;
    pub const CYCLE: u16 = 0xc00;
    pub const TIME: u16 = 0xc01;
    pub const INSTRET: u16 = 0xc02;
    pub const VL: u16 = 0xc20;
    pub const VTYPE: u16 = 0xc21;
    pub const VLENB: u16 = 0xc22;
    pub const MVENDORID: u16 = 0xf11;
    pub const MARCHID: u16 = 0xf12;
    pub const MIMPID: u16 = 0xf13;
    pub const MHARTID: u16 = 0xf14;
}

/// Name of a CSR, if it is one of the well known ones.
pub fn csr_name(number: u16) -> Option<&'static str> {
    use csr::*;

    let name = match number {
        FFLAGS => "fflags",
        FRM => "frm",
        FCSR => "fcsr",
        VSTART => "vstart",
        VXSAT => "vxsat",
        VXRM => "vxrm",
        VCSR => "vcsr",
        SSTATUS => "sstatus",
        0x104 => "sie",
        STVEC => "stvec",
        0x106 => "scounteren",
        0x140 => "sscratch",
        SEPC => "sepc",
        SCAUSE => "scause",
        STVAL => "stval",
        0x144 => "sip",
        SATP => "satp",
        VSSTATUS => "vsstatus",
        0x204 => "vsie",
        0x205 => "vstvec",
        0x240 => "vsscratch",
        0x241 => "vsepc",
        0x242 => "vscause",
        0x243 => "vstval",
        0x244 => "vsip",
        VSATP => "vsatp",
        MSTATUS => "mstatus",
        MISA => "misa",
        MEDELEG => "medeleg",
        MIDELEG => "mideleg",
        MIE => "mie",
        MTVEC => "mtvec",
        0x306 => "mcounteren",
        MSCRATCH => "mscratch",
        MEPC => "mepc",
        MCAUSE => "mcause",
        MTVAL => "mtval",
        MIP => "mip",
        HSTATUS => "hstatus",
        0x602 => "hedeleg",
        0x603 => "hideleg",
        0x604 => "hie",
        0x606 => "hcounteren",
        0x643 => "htval",
        0x644 => "hip",
        0x64a => "htinst",
        HGATP => "hgatp",
        TSELECT => "tselect",
        TDATA1 => "tdata1",
        TDATA2 => "tdata2",
        TDATA3 => "tdata3",
        TINFO => "tinfo",
        0x7a5 => "tcontrol",
        0x7a8 => "mcontext",
        DCSR => "dcsr",
        DPC => "dpc",
        DSCRATCH0 => "dscratch0",
        DSCRATCH1 => "dscratch1",
        MCYCLE => "mcycle",
        MINSTRET => "minstret",
        CYCLE => "cycle",
        TIME => "time",
        INSTRET => "instret",
        VL => "vl",
        VTYPE => "vtype",
        VLENB => "vlenb",
        MVENDORID => "mvendorid",
        MARCHID => "marchid",
        MIMPID => "mimpid",
        MHARTID => "mhartid",
        _ => return None,
    };

    Some(name)
}

/// Whether the value of a register can be kept in the cache after an access.
///
/// A register is cacheable when the hardware is guaranteed to return the same value
/// on the next read, absent writes by someone else.
pub fn is_cacheable(number: RegisterNumber, is_write: bool) -> bool {
    match number.kind() {
        RegisterKind::Gpr(0) => !is_write,
        RegisterKind::Gpr(_) | RegisterKind::Fpr(_) | RegisterKind::Vector(_) => true,
        RegisterKind::Pc => !is_write,
        RegisterKind::Csr(n) => match n {
            csr::DPC | csr::VSTART | csr::VXSAT | csr::VXRM | csr::VLENB | csr::VL
            | csr::VTYPE | csr::MISA | csr::DCSR | csr::DSCRATCH0 | csr::MSTATUS | csr::MEPC
            | csr::MCAUSE | csr::SATP => !is_write,
            _ => false,
        },
        RegisterKind::Priv | RegisterKind::Custom(_) => false,
    }
}

/// Whether a CSR is only reachable with the floating point unit enabled.
pub(crate) fn is_fp_csr(number: u16) -> bool {
    matches!(number, csr::FFLAGS | csr::FRM | csr::FCSR)
}

/// Whether a CSR is only reachable with the vector unit enabled.
pub(crate) fn is_vector_csr(number: u16) -> bool {
    matches!(
        number,
        csr::VSTART | csr::VXSAT | csr::VXRM | csr::VCSR | csr::VL | csr::VTYPE | csr::VLENB
    )
}

/// Whether `misa` advertises the extension `letter`.
pub fn misa_has(misa: u64, letter: char) -> bool {
    let bit = (letter.to_ascii_uppercase() as u8).wrapping_sub(b'A');
    bit < 26 && misa & (1 << bit) != 0
}

bitfield! {
    /// Debug Control and Status Register (`dcsr`).
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct Dcsr(u32);
    impl Debug;

    pub debugver, _: 31, 28;
    pub extcause, _: 26, 24;
    pub cetrig, set_cetrig: 19;
    pub ebreakvs, set_ebreakvs: 17;
    pub ebreakvu, set_ebreakvu: 16;
    pub ebreakm, set_ebreakm: 15;
    pub ebreaks, set_ebreaks: 13;
    pub ebreaku, set_ebreaku: 12;
    pub stepie, set_stepie: 11;
    pub stopcount, set_stopcount: 10;
    pub stoptime, set_stoptime: 9;
    pub cause, set_cause: 8, 6;
    pub v, set_v: 5;
    pub mprven, set_mprven: 4;
    pub nmip, _: 3;
    pub step, set_step: 2;
    pub prv, set_prv: 1, 0;
}

bitfield! {
    /// Machine status register (`mstatus`), in its 64 bit layout.
    ///
    /// The fields used by the debug core are at the same position for RV32.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct Mstatus(u64);
    impl Debug;

    pub mpv, _: 39;
    pub mprv, set_mprv: 17;
    pub xs, _: 16, 15;
    pub fs, set_fs: 14, 13;
    pub mpp, set_mpp: 12, 11;
    pub vs, set_vs: 10, 9;
    pub spp, _: 8;
    pub mie, set_mie: 3;
    pub hie, set_hie: 2;
    pub sie, set_sie: 1;
    pub uie, set_uie: 0;
}

impl From<u32> for Dcsr {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Dcsr> for u32 {
    fn from(dcsr: Dcsr) -> Self {
        dcsr.0
    }
}

impl From<u64> for Mstatus {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Mstatus> for u64 {
    fn from(mstatus: Mstatus) -> Self {
        mstatus.0
    }
}

impl Mstatus {
    /// The same value with every interrupt enable cleared.
    pub fn with_interrupts_masked(mut self) -> Self {
        self.set_mie(false);
        self.set_hie(false);
        self.set_sie(false);
        self.set_uie(false);
        self
    }
}

/// Privilege levels as encoded in `dcsr.prv`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivilegeLevel {
    /// User mode.
    User = 0,
    /// Supervisor mode.
    Supervisor = 1,
    /// Machine mode.
    Machine = 3,
}

impl PrivilegeLevel {
    /// Decode the two bit privilege field.
    pub fn from_bits(bits: u32) -> Self {
        match bits & 0x3 {
            0 => Self::User,
            1 => Self::Supervisor,
            _ => Self::Machine,
        }
    }
}

/// Value of the virtual `priv` register.
pub(crate) fn priv_from_dcsr(dcsr: Dcsr) -> u64 {
    ((dcsr.v() as u64) << 2) | dcsr.prv() as u64
}

/// Apply a `priv` register value to `dcsr`.
pub(crate) fn dcsr_with_priv(mut dcsr: Dcsr, value: u64) -> Dcsr {
    dcsr.set_prv((value & 0x3) as u32);
    dcsr.set_v(value & 0x4 != 0);
    dcsr
}

#[cfg(test)]
mod test {
    use super::*;
    use test_case::test_case;

    #[test_case(RegisterNumber::ZERO, RegisterKind::Gpr(0))]
    #[test_case(RegisterNumber::A0, RegisterKind::Gpr(10))]
    #[test_case(RegisterNumber::PC, RegisterKind::Pc)]
    #[test_case(RegisterNumber::fpr(31), RegisterKind::Fpr(31))]
    #[test_case(RegisterNumber::csr(csr::DCSR), RegisterKind::Csr(0x7b0))]
    #[test_case(RegisterNumber::PRIV, RegisterKind::Priv)]
    #[test_case(RegisterNumber::vector(3), RegisterKind::Vector(3))]
    #[test_case(RegisterNumber::custom(5), RegisterKind::Custom(5))]
    fn register_kind(number: RegisterNumber, kind: RegisterKind) {
        assert_eq!(number.kind(), kind);
    }

    #[test_case(RegisterNumber::ZERO, true, false; "x0 write")]
    #[test_case(RegisterNumber::ZERO, false, true; "x0 read")]
    #[test_case(RegisterNumber::S1, true, true; "gpr write")]
    #[test_case(RegisterNumber::fpr(2), true, true; "fpr write")]
    #[test_case(RegisterNumber::csr(csr::DPC), false, true; "dpc read")]
    #[test_case(RegisterNumber::csr(csr::DPC), true, false; "dpc write")]
    #[test_case(RegisterNumber::csr(csr::TDATA1), false, false; "tdata1 read")]
    #[test_case(RegisterNumber::csr(csr::MTVEC), false, false; "mtvec read")]
    #[test_case(RegisterNumber::PRIV, false, false; "priv read")]
    fn cacheability(number: RegisterNumber, is_write: bool, expected: bool) {
        assert_eq!(is_cacheable(number, is_write), expected);
    }

    #[test]
    fn misa_extensions() {
        // RV64IMAFDCSU
        let misa = (2 << 62) | 0x14112d;

        assert!(misa_has(misa, 'S'));
        assert!(misa_has(misa, 'u'));
        assert!(misa_has(misa, 'D'));
        assert!(!misa_has(misa, 'H'));
        assert!(!misa_has(misa, 'V'));
    }

    #[test]
    fn priv_round_trips_through_dcsr() {
        let dcsr = dcsr_with_priv(Dcsr(0x4000_0003), 0b101);

        assert!(dcsr.v());
        assert_eq!(dcsr.prv(), 1);
        assert_eq!(priv_from_dcsr(dcsr), 0b101);
    }
}
