//! Encoders for the instructions executed from the program buffer or Debug RAM.

#![allow(clippy::unusual_byte_groupings)]

/// RISCV breakpoint instruction
pub const EBREAK: u32 = 0b000000000001_00000_000_00000_1110011;

/// Compressed breakpoint instruction, `c.ebreak`.
pub const C_EBREAK: u16 = 0x9002;

/// `fence iorw, iorw`
pub const FENCE: u32 = 0x0ff0_000f;

/// `fence.i`
pub const FENCE_I: u32 = 0x0000_100f;

/// `slli x0, x0, 0x1f`, the instruction before a semihosting `ebreak`.
pub const SEMIHOSTING_PRE: u32 = 0x01f0_1013;

/// `srai x0, x0, 7`, the instruction after a semihosting `ebreak`.
pub const SEMIHOSTING_POST: u32 = 0x4070_5013;

const OP_LOAD: u8 = 0b000_0011;
const OP_LOAD_FP: u8 = 0b000_0111;
const OP_IMM: u8 = 0b001_0011;
const OP_AUIPC: u8 = 0b001_0111;
const OP_STORE: u8 = 0b010_0011;
const OP_STORE_FP: u8 = 0b010_0111;
const OP_FP: u32 = 0b101_0011;
const OP_JAL: u32 = 0b110_1111;
const OP_V: u32 = 0b101_0111;
const OP_SYSTEM: u8 = 0b111_0011;

/// Access width of integer loads and stores, as encoded in `funct3`.
pub fn width_for_size(size: usize) -> u8 {
    match size {
        1 => 0b000,
        2 => 0b001,
        4 => 0b010,
        _ => 0b011,
    }
}

/// Assemble an integer load, `l{b,h,w,d} destination, offset(base)`.
pub fn load(width: u8, destination: u8, base: u8, offset: i16) -> u32 {
    i_type_instruction(OP_LOAD, base, width, destination, offset as u16 & 0xfff)
}

/// Assemble an integer store, `s{b,h,w,d} source, offset(base)`.
pub fn store(width: u8, source: u8, base: u8, offset: i16) -> u32 {
    s_type_instruction(OP_STORE, base, width, source, offset as u16 & 0xfff)
}

/// Assemble a floating point load, `flw`/`fld`.
pub fn load_fp(double: bool, destination: u8, base: u8, offset: i16) -> u32 {
    let width = if double { 0b011 } else { 0b010 };
    i_type_instruction(OP_LOAD_FP, base, width, destination, offset as u16 & 0xfff)
}

/// Assemble a floating point store, `fsw`/`fsd`.
pub fn store_fp(double: bool, source: u8, base: u8, offset: i16) -> u32 {
    let width = if double { 0b011 } else { 0b010 };
    s_type_instruction(OP_STORE_FP, base, width, source, offset as u16 & 0xfff)
}

/// Assemble a `addi` instruction.
pub fn addi(destination: u8, source: u8, immediate: i16) -> u32 {
    i_type_instruction(OP_IMM, source, 0b000, destination, immediate as u16 & 0xfff)
}

/// Assemble a `xori` instruction.
pub fn xori(destination: u8, source: u8, immediate: i16) -> u32 {
    i_type_instruction(OP_IMM, source, 0b100, destination, immediate as u16 & 0xfff)
}

/// Assemble a `srli` instruction.
pub fn srli(destination: u8, source: u8, shamt: u8) -> u32 {
    i_type_instruction(OP_IMM, source, 0b101, destination, shamt as u16 & 0x3f)
}

/// Assemble a `jal` instruction. `offset` is relative to the instruction.
pub fn jal(rd: u8, offset: i32) -> u32 {
    let imm = offset as u32;

    (imm >> 20 & 0x1) << 31
        | (imm >> 1 & 0x3ff) << 21
        | (imm >> 11 & 0x1) << 20
        | (imm >> 12 & 0xff) << 12
        | (rd as u32) << 7
        | OP_JAL
}

/// Assemble an `auipc` instruction.
pub fn auipc(destination: u8, immediate: u32) -> u32 {
    (immediate << 12) | (destination as u32) << 7 | OP_AUIPC as u32
}

/// Read a CSR, `csrr rd, csr`.
///
/// This is a pseudo instruction for `csrrs rd, csr, x0`.
pub fn csrr(rd: u8, csr: u16) -> u32 {
    csrrs(rd, 0, csr)
}

/// Assemble a `csrrs` instruction
pub fn csrrs(rd: u8, rs1: u8, csr: u16) -> u32 {
    i_type_instruction(OP_SYSTEM, rs1, 0b010, rd, csr)
}

/// Assemble a `csrrc` instruction
pub fn csrrc(rd: u8, rs1: u8, csr: u16) -> u32 {
    i_type_instruction(OP_SYSTEM, rs1, 0b011, rd, csr)
}

/// Assemble a `csrrsi` instruction
pub fn csrrsi(rd: u8, uimm: u8, csr: u16) -> u32 {
    i_type_instruction(OP_SYSTEM, uimm, 0b110, rd, csr)
}

/// Assemble a `csrrci` instruction
pub fn csrrci(rd: u8, uimm: u8, csr: u16) -> u32 {
    i_type_instruction(OP_SYSTEM, uimm, 0b111, rd, csr)
}

/// Write a CSR, `csrw csr, rs`.
///
/// This is a pseudo instruction for `csrrw x0, csr, rs`.
pub fn csrw(csr: u16, rs: u8) -> u32 {
    csrrw(0, rs, csr)
}

/// Assemble a `csrrw` instruction
pub fn csrrw(rd: u8, rs1: u8, csr: u16) -> u32 {
    i_type_instruction(OP_SYSTEM, rs1, 0b001, rd, csr)
}

/// Move an FPR to a GPR, `fmv.x.w` or `fmv.x.d`.
pub fn fmv_x_f(double: bool, rd: u8, fs: u8) -> u32 {
    let funct7: u32 = if double { 0b111_0001 } else { 0b111_0000 };
    funct7 << 25 | (fs as u32) << 15 | (rd as u32) << 7 | OP_FP
}

/// Move a GPR to an FPR, `fmv.w.x` or `fmv.d.x`.
pub fn fmv_f_x(double: bool, fd: u8, rs: u8) -> u32 {
    let funct7: u32 = if double { 0b111_1001 } else { 0b111_1000 };
    funct7 << 25 | (rs as u32) << 15 | (fd as u32) << 7 | OP_FP
}

/// `vmv.x.s rd, vs2`: move element 0 of a vector register to a GPR.
pub fn vmv_x_s(rd: u8, vs2: u8) -> u32 {
    0b010000 << 26 | 1 << 25 | (vs2 as u32) << 20 | 0b010 << 12 | (rd as u32) << 7 | OP_V
}

/// `vslide1down.vx vd, vs2, rs1`
pub fn vslide1down_vx(vd: u8, vs2: u8, rs1: u8) -> u32 {
    0b001111 << 26
        | 1 << 25
        | (vs2 as u32) << 20
        | (rs1 as u32) << 15
        | 0b110 << 12
        | (vd as u32) << 7
        | OP_V
}

/// `vsetvl rd, rs1, rs2`
pub fn vsetvl(rd: u8, rs1: u8, rs2: u8) -> u32 {
    0b1000000 << 25 | (rs2 as u32) << 20 | (rs1 as u32) << 15 | 0b111 << 12 | (rd as u32) << 7 | OP_V
}

/// Assemble an I-type instruction, as specified in the RISCV ISA
///
/// This function panics if any of the values would have to be truncated.
fn i_type_instruction(opcode: u8, rs1: u8, funct3: u8, rd: u8, imm: u16) -> u32 {
    assert!(opcode <= 0x7f); // [06:00]
    assert!(rd <= 0x1f); // [11:07]
    assert!(funct3 <= 0x7); // [14:12]
    assert!(rs1 <= 0x1f); // [19:15]
    assert!(imm <= 0xfff); // [31:20]

    (imm as u32) << 20
        | (rs1 as u32) << 15
        | (funct3 as u32) << 12
        | (rd as u32) << 7
        | opcode as u32
}

/// Assemble an S-type instruction.
fn s_type_instruction(opcode: u8, rs1: u8, funct3: u8, rs2: u8, imm: u16) -> u32 {
    assert!(rs1 <= 0x1f);
    assert!(rs2 <= 0x1f);
    assert!(imm <= 0xfff);

    let imm = imm as u32;

    (imm >> 5) << 25
        | (rs2 as u32) << 20
        | (rs1 as u32) << 15
        | (funct3 as u32) << 12
        | (imm & 0x1f) << 7
        | opcode as u32
}

#[cfg(test)]
mod test {
    use super::*;
    use test_case::test_case;

    #[test]
    fn assemble_csrr() {
        // Assembly output of assembly 'csrr  s0, mie'
        //
        // mie address: 0x304
        // s0 index:    8
        let expected = 0x30402473;

        let assembled = csrr(8, 0x304);

        assert_eq!(assembled, expected);
    }

    #[test]
    fn assemble_csrw() {
        // Assembly output of assembly 'csrw  mstatus, s1'
        let expected = 0x30049073;

        let assembled = csrw(0x300, 9);

        assert_eq!(assembled, expected);
    }

    #[test_case(store(2, 1, 2, 4), 0x00112223; "sw x1, 4(x2)")]
    #[test_case(load(2, 3, 4, 8), 0x00822183; "lw x3, 8(x4)")]
    #[test_case(load(0, 9, 8, 0), 0x00040483; "lb s1, 0(s0)")]
    #[test_case(store(3, 9, 8, 0), 0x00943023; "sd s1, 0(s0)")]
    #[test_case(addi(8, 8, 4), 0x00440413; "addi s0, s0, 4")]
    #[test_case(addi(8, 8, -4), 0xffc40413; "addi s0, s0, -4")]
    #[test_case(fmv_x_f(false, 8, 1), 0xe0008453; "fmv.x.w s0, ft1")]
    #[test_case(fmv_f_x(true, 1, 8), 0xf20400d3; "fmv.d.x ft1, s0")]
    #[test_case(store_fp(true, 1, 8, 0), 0x00143027; "fsd ft1, 0(s0)")]
    #[test_case(load_fp(true, 1, 8, 0), 0x00043087; "fld ft1, 0(s0)")]
    #[test_case(auipc(8, 0), 0x00000417; "auipc s0, 0")]
    #[test_case(xori(8, 0, -1), 0xfff04413; "xori s0, zero, -1")]
    #[test_case(srli(8, 8, 31), 0x01f45413; "srli s0, s0, 31")]
    #[test_case(csrrsi(0, 8, 0x7b0), 0x7b046073; "csrsi dcsr, 8")]
    #[test_case(csrrci(0, 8, 0x7b0), 0x7b047073; "csrci dcsr, 8")]
    #[test_case(jal(0, 0), 0x0000006f; "jal zero, 0")]
    #[test_case(jal(0, 0x404), 0x4040006f; "jal zero, 0x404")]
    #[test_case(jal(0, -8), 0xff9ff06f; "jal zero, -8")]
    fn assemble(assembled: u32, expected: u32) {
        assert_eq!(assembled, expected);
    }

    #[test]
    fn semihosting_magic() {
        assert_eq!(i_type_instruction(OP_IMM, 0, 0b001, 0, 0x1f), SEMIHOSTING_PRE);
        assert_eq!(
            i_type_instruction(OP_IMM, 0, 0b101, 0, 0x407),
            SEMIHOSTING_POST
        );
    }
}
