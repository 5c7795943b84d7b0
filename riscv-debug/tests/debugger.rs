use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;
use test_case::test_case;

use riscv_debug::assembly::{self, EBREAK};
use riscv_debug::fake_jtag::{
    extensions, CAUSE_HALTREQ, CAUSE_RESETHALTREQ, JUMP_TO_SELF, RAM_BASE, RAM_SIZE, VLENB,
};
use riscv_debug::registers::csr;
use riscv_debug::{
    BreakpointCause, BreakpointKind, CoreStatus, DebugConfig, DebugHooks, Debugger, Etrigger,
    FakeJtag, HaltReason, IcountTrigger, MemoryFaultKind, MockDebugModule, MockHart,
    MockTrigger, ParameterDirection, RegisterNumber, RegisterParameter, ResetKind, ResumeOrder,
    RiscvError, Sample, SampleBucket, SemihostingOutcome, SemihostingRequest, TapPosition, TargetEvent, TargetId,
    TriggerModes, WatchpointAccess,
};

type Target = Rc<RefCell<MockDebugModule>>;

const TAP: TapPosition = TapPosition(0);

/// `addi a0, a0, 1`
const INCREMENT_A0: u32 = 0x0015_0513;
/// `add a0, a0, a1`
const ADD_A0_A1: u32 = 0x00b5_0533;

fn init_logging() {
    let _ = pretty_env_logger::formatted_builder()
        .is_test(true)
        .try_init();
}

fn connect_with(dm: MockDebugModule, config: DebugConfig) -> (Debugger, Target) {
    init_logging();

    let jtag = FakeJtag::new(dm);
    let target = jtag.target();
    let debugger = Debugger::new(Box::new(jtag), config).expect("valid configuration");

    (debugger, target)
}

fn connect(dm: MockDebugModule) -> (Debugger, Target) {
    connect_with(dm, DebugConfig::default())
}

/// Connect to a single hart and examine it.
fn examined(hart: MockHart) -> (Debugger, Target, TargetId) {
    examined_with(MockDebugModule::new(vec![hart]), DebugConfig::default())
}

fn examined_with(dm: MockDebugModule, config: DebugConfig) -> (Debugger, Target, TargetId) {
    let (mut debugger, target) = connect_with(dm, config);
    let id = debugger.add_target(TAP, 0);
    debugger.examine(id).expect("examine");
    (debugger, target, id)
}

fn words_to_bytes(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|word| word.to_le_bytes()).collect()
}

#[derive(Debug, Default)]
struct Recorded {
    events: Vec<(TargetId, TargetEvent)>,
    requests: Vec<SemihostingRequest>,
}

/// Hooks answering every semihosting call with `result`.
struct Recorder {
    recorded: Rc<RefCell<Recorded>>,
    result: u64,
}

impl DebugHooks for Recorder {
    fn on_event(&mut self, target: TargetId, event: TargetEvent) {
        self.recorded.borrow_mut().events.push((target, event));
    }

    fn semihosting(
        &mut self,
        _target: TargetId,
        request: &SemihostingRequest,
    ) -> Result<SemihostingOutcome, anyhow::Error> {
        self.recorded.borrow_mut().requests.push(*request);
        Ok(SemihostingOutcome::Handled {
            result: Some(self.result),
        })
    }
}

#[test_case(MockHart::rv32(), 32; "rv32")]
#[test_case(MockHart::rv64(), 64; "rv64")]
fn examine_finds_register_width(hart: MockHart, xlen: u32) {
    let misa = hart.misa;
    let (debugger, target, id) = examined(hart);

    let state = debugger.target(id).unwrap();
    assert_eq!(state.xlen(), xlen);
    assert_eq!(state.misa(), misa);
    assert_eq!(state.status(), CoreStatus::Running);
    assert_eq!(state.trigger_count(), 0);

    // Examination must leave the hart as it found it.
    assert!(!target.borrow().hart(0).halted);
}

#[test]
fn examine_keeps_a_halted_hart_halted() {
    let (debugger, target, id) = examined(MockHart::rv32().halted());

    assert_eq!(debugger.target(id).unwrap().status(), CoreStatus::Halted(HaltReason::Unknown));
    assert!(target.borrow().hart(0).halted);
}

#[test]
fn examine_counts_triggers() {
    let hart = MockHart::rv32().with_triggers(vec![MockTrigger::mcontrol(); 4]);
    let (debugger, _target, id) = examined(hart);

    assert_eq!(debugger.target(id).unwrap().trigger_count(), 4);
}

#[test]
fn examine_missing_hart() {
    let (mut debugger, _target) = connect(MockDebugModule::new(vec![MockHart::rv32()]));
    let id = debugger.add_target(TAP, 3);

    assert!(matches!(debugger.examine(id), Err(RiscvError::HartNotFound(3))));
}

#[test]
fn operations_need_an_examined_target() {
    let (mut debugger, _target) = connect(MockDebugModule::new(vec![MockHart::rv32().halted()]));
    let id = debugger.add_target(TAP, 0);

    assert!(matches!(
        debugger.read_register(id, RegisterNumber::PC),
        Err(RiscvError::NotExamined)
    ));
    assert!(matches!(debugger.halt(id), Err(RiscvError::NotExamined)));
}

fn legacy(hart: MockHart) -> MockDebugModule {
    let mut dm = MockDebugModule::new(vec![hart]);
    dm.dtm_version = 0;
    dm
}

#[test_case(MockHart::rv32(), 32; "rv32")]
#[test_case(MockHart::rv64(), 64; "rv64")]
fn legacy_examine(hart: MockHart, xlen: u32) {
    let misa = hart.misa;
    let (debugger, target, id) = examined_with(legacy(hart), DebugConfig::default());

    let state = debugger.target(id).unwrap();
    assert_eq!(state.xlen(), xlen);
    assert_eq!(state.misa(), misa);
    assert_eq!(state.status(), CoreStatus::Running);
    assert!(target.borrow().dram_programs > 0);
    assert!(!target.borrow().hart(0).halted);
}

#[test]
fn legacy_needs_enough_debug_ram() {
    let mut dm = legacy(MockHart::rv32());
    dm.dram_words = 8;
    let (mut debugger, _target) = connect(dm);
    let id = debugger.add_target(TAP, 0);

    assert!(matches!(debugger.examine(id), Err(RiscvError::ResourceUnavailable(_))));
}

#[test]
fn legacy_exception_marker_in_upper_debug_ram() {
    let mut dm = legacy(MockHart::rv32().halted());
    dm.dram_words = 32;
    let (mut debugger, target, id) = examined_with(dm, DebugConfig::default());

    let end = RAM_BASE + RAM_SIZE as u64;
    let mut read = [0; 4];
    assert!(debugger.read_memory(id, end, 4, 1, &mut read).is_err());
    assert_eq!(target.borrow().dram()[31], 0xffff_ffff);

    // The next program clears the marker again.
    debugger.write_register(id, RegisterNumber::A0, 3).unwrap();
    debugger.resume(id, true, 0, false, false).unwrap();
    assert_eq!(target.borrow().dram()[31], 0);
    assert_eq!(target.borrow().hart(0).gpr(10), 3);
}

#[test]
fn legacy_halt_and_resume() {
    let (mut debugger, target, id) = examined_with(legacy(MockHart::rv32()), DebugConfig::default());

    debugger.halt(id).unwrap();
    assert_eq!(debugger.target(id).unwrap().status(), CoreStatus::Halted(HaltReason::Request));
    assert!(target.borrow().hart(0).halted);

    debugger.resume(id, true, 0, false, false).unwrap();
    assert_eq!(debugger.target(id).unwrap().status(), CoreStatus::Running);
    assert!(!target.borrow().hart(0).halted);
    assert_eq!(debugger.poll(id).unwrap(), CoreStatus::Running);
}

#[test_case(MockHart::rv32(); "rv32")]
#[test_case(MockHart::rv64(); "rv64")]
fn legacy_registers(hart: MockHart) {
    let mut hart = hart.halted();
    hart.set_gpr(8, 0x55);
    hart.pc = RAM_BASE + 0x10;
    let (mut debugger, target, id) = examined_with(legacy(hart), DebugConfig::default());

    assert_eq!(debugger.read_register(id, RegisterNumber::S0).unwrap(), 0x55);
    assert_eq!(debugger.read_register(id, RegisterNumber::PC).unwrap(), RAM_BASE + 0x10);

    debugger.write_register(id, RegisterNumber::A0, 0x1234_5678).unwrap();
    debugger.write_register(id, RegisterNumber::S0, 0x77).unwrap();
    {
        let mut core = debugger.core(id).unwrap();
        core.flush_registers().unwrap();
        core.invalidate_registers();
    }
    assert_eq!(target.borrow().hart(0).gpr(10), 0x1234_5678);
    assert_eq!(target.borrow().hart(0).gpr(8), 0x77);
    assert_eq!(debugger.read_register(id, RegisterNumber::A0).unwrap(), 0x1234_5678);
    assert_eq!(debugger.read_register(id, RegisterNumber::S0).unwrap(), 0x77);

    // Debug RAM programs keep the hart halted.
    assert!(target.borrow().hart(0).halted);
}

#[test]
fn legacy_double_register() {
    let (mut debugger, target, id) = examined_with(legacy(fpu_hart(32)), DebugConfig::default());
    let f1 = RegisterNumber::fpr(1);

    target.borrow_mut().hart_mut(0).fprs[1] = 0x4009_21fb_5444_2d18;
    assert_eq!(debugger.read_register(id, f1).unwrap(), 0x4009_21fb_5444_2d18);

    debugger.write_register(id, f1, 0x1122_3344_5566_7788).unwrap();
    debugger.resume(id, true, 0, false, false).unwrap();
    assert_eq!(target.borrow().hart(0).fprs[1], 0x1122_3344_5566_7788);
}

#[test]
fn legacy_memory_round_trip() {
    let (mut debugger, target, id) =
        examined_with(legacy(MockHart::rv32().halted()), DebugConfig::default());
    let address = RAM_BASE + 0x100;

    let data = words_to_bytes(&[0x0102_0304, 0xa0b0_c0d0]);
    debugger.write_memory(id, address, 4, 2, &data).unwrap();
    assert_eq!(target.borrow().memory.read_u32(address + 4), Some(0xa0b0_c0d0));

    let mut read = vec![0; 8];
    debugger.read_memory(id, address, 2, 4, &mut read).unwrap();
    assert_eq!(read, data);

    // s1 is saved in Debug RAM and put back.
    assert_eq!(target.borrow().hart(0).gpr(9), 0);

    let end = RAM_BASE + RAM_SIZE as u64;
    let mut read = [0; 4];
    assert!(matches!(
        debugger.read_memory(id, end, 4, 1, &mut read),
        Err(RiscvError::MemoryFault { address, .. }) if address == end
    ));
}

#[test]
fn legacy_step() {
    let (mut debugger, target, id) =
        examined_with(legacy(MockHart::rv32().halted()), DebugConfig::default());
    target
        .borrow_mut()
        .memory
        .load_words(RAM_BASE, &[INCREMENT_A0, INCREMENT_A0, JUMP_TO_SELF]);

    debugger.step(id, false, RAM_BASE, false).unwrap();

    assert_eq!(debugger.target(id).unwrap().status(), CoreStatus::Halted(HaltReason::Step));
    assert_eq!(debugger.read_register(id, RegisterNumber::PC).unwrap(), RAM_BASE + 4);
    assert_eq!(target.borrow().hart(0).gpr(10), 1);
}

#[test]
fn legacy_unsupported_operations() {
    let (mut debugger, _target, id) =
        examined_with(legacy(MockHart::rv32().halted()), DebugConfig::default());

    assert!(matches!(
        debugger.exec_progbuf(id, &[INCREMENT_A0]),
        Err(RiscvError::Unsupported(_))
    ));
    assert!(matches!(
        debugger.assert_reset(id, ResetKind::System),
        Err(RiscvError::Unsupported(_))
    ));

    // dminfo.version
    assert_eq!(debugger.dm_read(TAP, 0x11).unwrap() & 0x3, 1);
}

#[test]
fn dead_tap_is_reported() {
    let mut dm = MockDebugModule::new(vec![MockHart::rv32()]);
    dm.present = false;
    let (mut debugger, _target) = connect(dm);
    let id = debugger.add_target(TAP, 0);

    assert!(matches!(debugger.examine(id), Err(RiscvError::NoRiscvTarget)));
}

#[test]
fn halt_and_resume() {
    let (mut debugger, target, id) = examined(MockHart::rv32());

    debugger.halt(id).unwrap();
    assert_eq!(debugger.target(id).unwrap().status(), CoreStatus::Halted(HaltReason::Request));
    assert!(target.borrow().hart(0).halted);
    assert_eq!(target.borrow().hart(0).cause(), CAUSE_HALTREQ);

    debugger.resume(id, true, 0, false, false).unwrap();
    assert_eq!(debugger.target(id).unwrap().status(), CoreStatus::Running);
    assert!(!target.borrow().hart(0).halted);

    assert_eq!(debugger.poll(id).unwrap(), CoreStatus::Running);
}

#[test]
fn resume_at_address() {
    let (mut debugger, target, id) = examined(MockHart::rv32().halted());
    target
        .borrow_mut()
        .memory
        .load_words(RAM_BASE + 0x200, &[INCREMENT_A0, EBREAK]);

    debugger.resume(id, false, RAM_BASE + 0x200, false, false).unwrap();

    assert_eq!(
        debugger.poll(id).unwrap(),
        CoreStatus::Halted(HaltReason::Breakpoint(BreakpointCause::Software))
    );
    assert_eq!(target.borrow().hart(0).pc, RAM_BASE + 0x204);
    assert_eq!(target.borrow().hart(0).gpr(10), 1);
}

#[test]
fn register_writes_reach_the_hart_on_resume() {
    let (mut debugger, target, id) = examined(MockHart::rv32().halted());

    debugger.write_register(id, RegisterNumber::A0, 0x1234_5678).unwrap();
    assert_eq!(debugger.read_register(id, RegisterNumber::A0).unwrap(), 0x1234_5678);
    assert_eq!(target.borrow().hart(0).gpr(10), 0);

    debugger.resume(id, true, 0, false, false).unwrap();
    assert_eq!(target.borrow().hart(0).gpr(10), 0x1234_5678);
}

#[test]
fn registers_of_a_running_hart_are_not_accessible() {
    let (mut debugger, _target, id) = examined(MockHart::rv32());

    assert!(matches!(
        debugger.read_register(id, RegisterNumber::A0),
        Err(RiscvError::TargetNotHalted)
    ));
}

#[test]
fn csr_read() {
    let mut hart = MockHart::rv32().halted();
    hart.csrs.insert(csr::MSCRATCH, 0xcafe);
    let (mut debugger, _target, id) = examined(hart);

    assert_eq!(
        debugger.read_register(id, RegisterNumber::csr(csr::MSCRATCH)).unwrap(),
        0xcafe
    );
}

fn fpu_hart(xlen: u32) -> MockHart {
    let mxl = if xlen == 64 { 2 << 62 } else { 1 << 30 };
    MockHart::new(xlen, mxl | extensions("IMAFDSU")).halted()
}

#[test_case(32, true; "rv32 abstract command")]
#[test_case(32, false; "rv32 through scratch memory")]
#[test_case(64, true; "rv64 abstract command")]
#[test_case(64, false; "rv64 through s0")]
fn double_register_round_trip(xlen: u32, abstract_fpr: bool) {
    let mut dm = MockDebugModule::new(vec![fpu_hart(xlen)]);
    dm.abstract_fpr = abstract_fpr;
    dm.progbuf_writable = true;
    let (mut debugger, target, id) = examined_with(dm, DebugConfig::default());
    let f1 = RegisterNumber::fpr(1);

    debugger.write_register(id, f1, 0x1122_3344_5566_7788).unwrap();
    assert_eq!(debugger.read_register(id, f1).unwrap(), 0x1122_3344_5566_7788);

    {
        let mut core = debugger.core(id).unwrap();
        core.flush_registers().unwrap();
        core.invalidate_registers();
    }
    assert_eq!(target.borrow().hart(0).fprs[1], 0x1122_3344_5566_7788);
    // s0 is put back after moving the value through it.
    assert_eq!(target.borrow().hart(0).gpr(8), 0);

    target.borrow_mut().hart_mut(0).fprs[1] = 0x4009_21fb_5444_2d18;
    assert_eq!(debugger.read_register(id, f1).unwrap(), 0x4009_21fb_5444_2d18);
}

#[test]
fn single_precision_register_is_32_bits() {
    let hart = MockHart::new(32, 1 << 30 | extensions("IMAFSU")).halted();
    let (mut debugger, target, id) = examined(hart);
    let f2 = RegisterNumber::fpr(2);

    debugger.write_register(id, f2, 0xffff_ffff_3f80_0000).unwrap();
    assert_eq!(debugger.read_register(id, f2).unwrap(), 0x3f80_0000);

    debugger.resume(id, true, 0, false, false).unwrap();
    assert_eq!(target.borrow().hart(0).fprs[2], 0x3f80_0000);
}

#[test_case(32; "rv32")]
#[test_case(64; "rv64")]
fn vector_register_round_trip(xlen: u32) {
    let mxl = if xlen == 64 { 2 << 62 } else { 1 << 30 };
    let mut hart = MockHart::new(xlen, mxl | extensions("IMAVSU")).halted();
    let contents: Vec<u8> = (0..VLENB as u8).collect();
    hart.vregs[3].clone_from(&contents);
    hart.csrs.insert(csr::VTYPE, 0x08);
    hart.csrs.insert(csr::VL, 3);
    let (mut debugger, target, id) = examined(hart);

    let written: Vec<u8> = (0..VLENB as u8).map(|byte| 0xa0 | byte).collect();
    {
        let mut core = debugger.core(id).unwrap();
        assert_eq!(core.read_vector_register(3).unwrap(), contents);
        core.write_vector_register(5, &written).unwrap();
        assert_eq!(core.read_vector_register(5).unwrap(), written);

        assert!(matches!(
            core.write_vector_register(5, &written[..4]),
            Err(RiscvError::InvalidArgument(_))
        ));
        core.flush_registers().unwrap();
    }

    let target = target.borrow();
    let hart = target.hart(0);
    assert_eq!(hart.vregs[3], contents);
    assert_eq!(hart.vregs[5], written);
    // The element layout used for the access is undone.
    assert_eq!(hart.csrs[&csr::VTYPE], 0x08);
    assert_eq!(hart.csrs[&csr::VL], 3);
    assert_eq!(hart.gpr(8), 0);
    assert_eq!(hart.gpr(9), 0);
}

#[test]
fn program_buffer_memory_round_trip() {
    let mut hart = MockHart::rv32().halted();
    hart.set_gpr(8, 0x11);
    hart.set_gpr(9, 0x22);
    let (mut debugger, target, id) = examined(hart);

    let words: Vec<u32> = (0..65).map(|i| 0x1000_0000 + i * 0x0101).collect();
    let data = words_to_bytes(&words);
    let address = RAM_BASE + 0x1000;

    debugger.write_memory(id, address, 4, words.len(), &data).unwrap();
    for (index, word) in words.iter().enumerate() {
        assert_eq!(
            target.borrow().memory.read_u32(address + 4 * index as u64),
            Some(*word)
        );
    }

    let mut read = vec![0; data.len()];
    debugger.read_memory(id, address, 4, words.len(), &mut read).unwrap();
    assert_eq!(read, data);

    // s0 and s1 are scratch registers of the program buffer.
    debugger.resume(id, true, 0, false, false).unwrap();
    assert_eq!(target.borrow().hart(0).gpr(8), 0x11);
    assert_eq!(target.borrow().hart(0).gpr(9), 0x22);
}

#[test_case(1; "bytes")]
#[test_case(2; "halfwords")]
#[test_case(4; "words")]
fn program_buffer_reads_each_size(size: usize) {
    let (mut debugger, target, id) = examined(MockHart::rv32().halted());
    let contents: Vec<u8> = (0..32).collect();
    target.borrow_mut().memory.load(RAM_BASE + 0x100, &contents);

    let mut read = vec![0; contents.len()];
    debugger
        .read_memory(id, RAM_BASE + 0x100, size, contents.len() / size, &mut read)
        .unwrap();

    assert_eq!(read, contents);
}

#[test]
fn program_buffer_read_survives_busy_commands() {
    let (mut debugger, target, id) = examined(MockHart::rv32().halted());
    let words: Vec<u32> = (0..8).map(|i| 0xa000_0000 | i).collect();
    target.borrow_mut().memory.load_words(RAM_BASE + 0x80, &words);
    target.borrow_mut().abstract_busy = 3;

    let mut read = vec![0; 32];
    debugger.read_memory(id, RAM_BASE + 0x80, 4, 8, &mut read).unwrap();

    assert_eq!(read, words_to_bytes(&words));
    assert!(debugger.session(TAP).unwrap().dtm_state().ac_busy_delay() > 0);
}

#[test]
fn empty_read_does_not_touch_the_target() {
    let (mut debugger, target, id) = examined(MockHart::rv32().halted());
    let executes = target.borrow().executes;

    debugger.read_memory(id, RAM_BASE, 4, 0, &mut []).unwrap();

    assert_eq!(target.borrow().executes, executes);
}

#[test]
fn unaligned_write_is_split() {
    let (mut debugger, target, id) = examined(MockHart::rv32().halted());

    debugger
        .write_memory(id, RAM_BASE + 0x21, 4, 1, &[0x11, 0x22, 0x33, 0x44])
        .unwrap();

    let mut bytes = [0u8; 6];
    assert!(target.borrow().memory.read(RAM_BASE + 0x20, &mut bytes));
    assert_eq!(bytes, [0, 0x11, 0x22, 0x33, 0x44, 0]);
}

#[test]
fn buffer_length_must_match() {
    let (mut debugger, _target, id) = examined(MockHart::rv32().halted());

    let mut buffer = [0u8; 6];
    assert!(matches!(
        debugger.read_memory(id, RAM_BASE, 4, 2, &mut buffer),
        Err(RiscvError::InvalidArgument(_))
    ));
}

fn with_system_bus() -> MockDebugModule {
    let mut dm = MockDebugModule::new(vec![MockHart::rv32()]);
    dm.system_bus = true;
    dm
}

#[test]
fn system_bus_access_while_running() {
    let (mut debugger, target, id) = examined_with(with_system_bus(), DebugConfig::default());
    assert_eq!(debugger.target(id).unwrap().status(), CoreStatus::Running);

    let words = [0xdead_beef, 0x0bad_f00d, 0x1234_5678, 0x9abc_def0];
    let data = words_to_bytes(&words);
    debugger.write_memory(id, RAM_BASE + 0x40, 4, 4, &data).unwrap();
    assert_eq!(target.borrow().memory.read_u32(RAM_BASE + 0x48), Some(0x1234_5678));

    let mut read = vec![0; data.len()];
    debugger.read_memory(id, RAM_BASE + 0x40, 4, 4, &mut read).unwrap();
    assert_eq!(read, data);

    assert!(!target.borrow().hart(0).halted);
}

#[test]
fn system_bus_error_reports_the_failing_address() {
    let (mut debugger, _target, id) = examined_with(with_system_bus(), DebugConfig::default());
    let end = RAM_BASE + RAM_SIZE as u64;

    let mut read = [0u8; 8];
    let error = debugger.read_memory(id, end - 4, 4, 2, &mut read).unwrap_err();

    match error {
        RiscvError::MemoryFault { address, kind } => {
            assert_eq!(address, end);
            assert_eq!(kind, MemoryFaultKind::Bus(2));
        }
        error => panic!("unexpected error: {error}"),
    }
}

#[test]
fn repeat_read_reads_one_address() {
    let (mut debugger, target, id) = examined(MockHart::rv32().halted());
    target.borrow_mut().memory.load_words(RAM_BASE + 0x30, &[0x1234_5678, 0x9abc_def0]);
    let executes = target.borrow().executes;

    let mut read = [0u8; 12];
    debugger.repeat_read(id, RAM_BASE + 0x30, 4, 3, &mut read).unwrap();

    assert_eq!(read.to_vec(), words_to_bytes(&[0x1234_5678; 3]));
    assert!(target.borrow().executes - executes >= 3);

    debugger.repeat_read(id, RAM_BASE + 0x30, 4, 0, &mut []).unwrap();
}

#[test]
fn repeat_read_over_the_system_bus() {
    let (mut debugger, target, id) = examined_with(with_system_bus(), DebugConfig::default());
    target.borrow_mut().memory.load_words(RAM_BASE + 0x30, &[0xcafe_f00d, 0]);

    let mut read = [0u8; 8];
    debugger.repeat_read(id, RAM_BASE + 0x30, 4, 2, &mut read).unwrap();

    assert_eq!(read.to_vec(), words_to_bytes(&[0xcafe_f00d; 2]));
}

#[test]
fn memory_is_sampled_while_running() {
    let (mut debugger, target, id) = examined_with(with_system_bus(), DebugConfig::default());
    target.borrow_mut().memory.load_words(RAM_BASE + 0x40, &[0x1111_2222]);
    target.borrow_mut().memory.load_words(RAM_BASE + 0x48, &[0x3333_4444, 0x5555_6666]);

    debugger
        .memory_sample(id, 0, Some(SampleBucket { address: RAM_BASE + 0x40, size: 4 }))
        .unwrap();
    debugger
        .memory_sample(id, 2, Some(SampleBucket { address: RAM_BASE + 0x48, size: 8 }))
        .unwrap();

    debugger.poll(id).unwrap();
    debugger.poll(id).unwrap();

    let values: Vec<(usize, u64)> = debugger
        .dump_sample_buf(id)
        .unwrap()
        .into_iter()
        .filter_map(|sample| match sample {
            Sample::Value { bucket, value, .. } => Some((bucket, value)),
            _ => None,
        })
        .collect();
    assert_eq!(
        values,
        vec![(0, 0x1111_2222), (2, 0x5555_6666_3333_4444), (0, 0x1111_2222), (2, 0x5555_6666_3333_4444)]
    );

    // Dumping drops the samples.
    assert_eq!(debugger.dump_sample_buf(id).unwrap(), vec![]);
    assert!(debugger.target(id).unwrap().sampler().enabled());
}

#[test]
fn halted_targets_are_not_sampled() {
    let mut dm = with_system_bus();
    dm.harts[0] = MockHart::rv32().halted();
    let (mut debugger, _target, id) = examined_with(dm, DebugConfig::default());

    debugger
        .memory_sample(id, 0, Some(SampleBucket { address: RAM_BASE, size: 4 }))
        .unwrap();
    debugger.poll(id).unwrap();

    assert_eq!(debugger.dump_sample_buf_raw(id).unwrap(), Vec::<u8>::new());
}

#[test]
fn failed_sample_turns_sampling_off() {
    let (mut debugger, _target, id) = examined_with(with_system_bus(), DebugConfig::default());
    let end = RAM_BASE + RAM_SIZE as u64;

    debugger
        .memory_sample(id, 1, Some(SampleBucket { address: end, size: 4 }))
        .unwrap();
    assert_eq!(debugger.poll(id).unwrap(), CoreStatus::Running);

    assert!(!debugger.target(id).unwrap().sampler().enabled());
    let samples = debugger.dump_sample_buf(id).unwrap();
    assert!(samples
        .iter()
        .all(|sample| !matches!(sample, Sample::Value { .. })));
}

#[test]
fn exec_progbuf_runs_raw_instructions() {
    let mut hart = MockHart::rv32().halted();
    hart.set_gpr(10, 5);
    let (mut debugger, target, id) = examined(hart);

    debugger.exec_progbuf(id, &[INCREMENT_A0]).unwrap();
    assert_eq!(target.borrow().hart(0).gpr(10), 6);
    assert_eq!(debugger.read_register(id, RegisterNumber::A0).unwrap(), 6);

    // Cached writes reach the hart before the instructions run.
    debugger.write_register(id, RegisterNumber::A0, 10).unwrap();
    debugger.exec_progbuf(id, &[INCREMENT_A0, INCREMENT_A0]).unwrap();
    assert_eq!(target.borrow().hart(0).gpr(10), 12);
    assert_eq!(debugger.read_register(id, RegisterNumber::A0).unwrap(), 12);
}

#[test]
fn exec_progbuf_arguments() {
    let (mut debugger, _target, id) = examined(MockHart::rv32().halted());

    assert!(matches!(
        debugger.exec_progbuf(id, &[]),
        Err(RiscvError::InvalidArgument(_))
    ));
    assert!(matches!(
        debugger.exec_progbuf(id, &[INCREMENT_A0; 17]),
        Err(RiscvError::InvalidArgument(_))
    ));

    let (mut debugger, _target, id) = examined(MockHart::rv32());
    assert!(matches!(
        debugger.exec_progbuf(id, &[INCREMENT_A0]),
        Err(RiscvError::TargetNotHalted)
    ));
}

#[test]
fn dm_register_access() {
    let (mut debugger, _target, _id) = examined(MockHart::rv32().halted());

    // dmstatus.version
    assert_eq!(debugger.dm_read(TAP, 0x11).unwrap() & 0xf, 3);

    // data1
    debugger.dm_write(TAP, 0x05, 0x5a5a_0001).unwrap();
    assert_eq!(debugger.dm_read(TAP, 0x05).unwrap(), 0x5a5a_0001);
}

#[test]
fn software_breakpoint() {
    let (mut debugger, target, id) = examined(MockHart::rv32().halted());
    target
        .borrow_mut()
        .memory
        .load_words(RAM_BASE, &[INCREMENT_A0, INCREMENT_A0, JUMP_TO_SELF]);

    let breakpoint = debugger
        .add_breakpoint(id, RAM_BASE + 4, 4, BreakpointKind::Software)
        .unwrap();
    assert_eq!(target.borrow().memory.read_u32(RAM_BASE + 4), Some(EBREAK));

    debugger.resume(id, true, 0, false, false).unwrap();
    assert_eq!(
        debugger.poll(id).unwrap(),
        CoreStatus::Halted(HaltReason::Breakpoint(BreakpointCause::Software))
    );
    assert_eq!(debugger.read_register(id, RegisterNumber::PC).unwrap(), RAM_BASE + 4);

    debugger.remove_breakpoint(id, breakpoint).unwrap();
    assert_eq!(target.borrow().memory.read_u32(RAM_BASE + 4), Some(INCREMENT_A0));

    debugger.resume(id, true, 0, true, false).unwrap();
    assert_eq!(debugger.poll(id).unwrap(), CoreStatus::Running);
    assert_eq!(target.borrow().hart(0).gpr(10), 2);
    assert_eq!(target.borrow().hart(0).pc, RAM_BASE + 8);
}

#[test]
fn hardware_breakpoint() {
    let hart = MockHart::rv32()
        .halted()
        .with_triggers(vec![MockTrigger::mcontrol()]);
    let (mut debugger, target, id) = examined(hart);
    target
        .borrow_mut()
        .memory
        .load_words(RAM_BASE, &[INCREMENT_A0, INCREMENT_A0, JUMP_TO_SELF]);

    let breakpoint = debugger
        .add_breakpoint(id, RAM_BASE + 4, 4, BreakpointKind::Hardware)
        .unwrap();
    // Memory is left alone.
    assert_eq!(target.borrow().memory.read_u32(RAM_BASE + 4), Some(INCREMENT_A0));

    debugger.resume(id, true, 0, false, false).unwrap();
    assert_eq!(
        debugger.poll(id).unwrap(),
        CoreStatus::Halted(HaltReason::Breakpoint(BreakpointCause::Hardware))
    );
    assert_eq!(target.borrow().hart(0).pc, RAM_BASE + 4);
    assert_eq!(target.borrow().hart(0).gpr(10), 1);

    debugger.remove_breakpoint(id, breakpoint).unwrap();
    assert_eq!(target.borrow().hart(0).triggers[0].tdata1, 0);
}

#[test]
fn hardware_breakpoint_needs_a_trigger() {
    let (mut debugger, _target, id) = examined(MockHart::rv32().halted());

    assert!(matches!(
        debugger.add_breakpoint(id, RAM_BASE, 4, BreakpointKind::Hardware),
        Err(RiscvError::ResourceUnavailable(_))
    ));
}

#[test]
fn unknown_breakpoint() {
    let (mut debugger, _target, id) = examined(MockHart::rv32().halted());

    assert!(matches!(
        debugger.remove_breakpoint(id, 99),
        Err(RiscvError::UnknownBreakpoint(99))
    ));
}

#[test]
fn napot_watchpoint_hit() {
    let hart = MockHart::rv32()
        .halted()
        .with_triggers(vec![MockTrigger::mcontrol(), MockTrigger::mcontrol()]);
    let (mut debugger, target, id) = examined(hart);
    let watched = RAM_BASE + 0x800;

    target.borrow_mut().memory.load_words(
        RAM_BASE,
        &[assembly::store(2, 11, 10, 0), JUMP_TO_SELF],
    );
    debugger.write_register(id, RegisterNumber::A0, watched).unwrap();
    debugger.write_register(id, RegisterNumber::A1, 0x5555_aaaa).unwrap();

    let watchpoint = debugger
        .add_watchpoint(id, watched, 4, WatchpointAccess::Write)
        .unwrap();
    // One trigger covers the whole range.
    assert_eq!(target.borrow().hart(0).triggers[0].tdata2, watched | 1);
    assert_eq!(target.borrow().hart(0).triggers[1].tdata1, 0);

    debugger.resume(id, true, 0, false, false).unwrap();
    assert_eq!(debugger.poll(id).unwrap(), CoreStatus::Halted(HaltReason::Watchpoint));
    // The store didn't happen.
    assert_eq!(target.borrow().memory.read_u32(watched), Some(0));

    let hit = debugger.hit_watchpoint(id).unwrap().expect("a watchpoint was hit");
    assert_eq!(hit.id(), watchpoint);
    assert_eq!(hit.address(), watched);
    assert_eq!(hit.length(), 4);
}

#[test]
fn chained_range_watchpoint() {
    let hart = MockHart::rv32()
        .halted()
        .with_triggers(vec![MockTrigger::mcontrol(), MockTrigger::mcontrol()]);
    let config = DebugConfig {
        enable_napot_trigger: false,
        ..DebugConfig::default()
    };
    let (mut debugger, target, id) = examined_with(MockDebugModule::new(vec![hart]), config);
    let start = RAM_BASE + 0x800;

    target.borrow_mut().memory.load_words(
        RAM_BASE,
        &[assembly::store(2, 11, 10, 0), JUMP_TO_SELF],
    );
    debugger.write_register(id, RegisterNumber::A0, start + 0x20).unwrap();

    let watchpoint = debugger
        .add_watchpoint(id, start, 0x40, WatchpointAccess::Write)
        .unwrap();
    {
        let target = target.borrow();
        let triggers = &target.hart(0).triggers;
        assert_eq!(triggers[0].tdata2, start);
        assert_eq!(triggers[1].tdata2, start + 0x40);
        assert_ne!(triggers[0].tdata1 & 1 << 11, 0);
        assert_eq!(triggers[1].tdata1 & 1 << 11, 0);
    }

    debugger.resume(id, true, 0, false, false).unwrap();
    assert_eq!(debugger.poll(id).unwrap(), CoreStatus::Halted(HaltReason::Watchpoint));

    let hit = debugger.hit_watchpoint(id).unwrap().expect("a watchpoint was hit");
    assert_eq!(hit.id(), watchpoint);
}

#[test]
fn odd_byte_watchpoint_with_equal_match() {
    let hart = MockHart::rv32()
        .halted()
        .with_triggers(vec![MockTrigger::mcontrol().equal_only()]);
    let (mut debugger, target, id) = examined(hart);
    let watched = RAM_BASE + 0x801;

    target.borrow_mut().memory.load_words(
        RAM_BASE,
        &[assembly::load(0, 11, 10, 1), JUMP_TO_SELF],
    );
    debugger.write_register(id, RegisterNumber::A0, RAM_BASE + 0x800).unwrap();

    debugger
        .add_watchpoint(id, watched, 1, WatchpointAccess::Read)
        .unwrap();
    assert_eq!(target.borrow().hart(0).triggers[0].tdata2, watched);

    debugger.resume(id, true, 0, false, false).unwrap();
    assert_eq!(debugger.poll(id).unwrap(), CoreStatus::Halted(HaltReason::Watchpoint));

    let hit = debugger.hit_watchpoint(id).unwrap().expect("a watchpoint was hit");
    assert_eq!(hit.address(), watched);
    assert_eq!(hit.access(), WatchpointAccess::Read);
}

/// Formatted `tracing` output of the current thread.
#[derive(Clone, Default)]
struct CapturedLog(Arc<Mutex<Vec<u8>>>);

impl CapturedLog {
    fn start(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl std::io::Write for CapturedLog {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn equal_match_fallback_warns_once() {
    let hart = MockHart::rv32()
        .halted()
        .with_triggers(vec![MockTrigger::mcontrol().equal_only(); 2]);
    let (mut debugger, target, id) = examined(hart);

    let log = CapturedLog::default();
    let _guard = log.start();

    for address in [RAM_BASE + 0x801, RAM_BASE + 0x803] {
        debugger
            .add_watchpoint(id, address, 1, WatchpointAccess::Write)
            .unwrap();
    }

    {
        let target = target.borrow();
        let triggers = &target.hart(0).triggers;
        assert_eq!(triggers[0].tdata2, RAM_BASE + 0x801);
        assert_eq!(triggers[1].tdata2, RAM_BASE + 0x803);
    }

    let contents = log.contents();
    assert_eq!(contents.matches("match a whole address range").count(), 1, "{contents}");
}

#[test]
fn single_step() {
    let (mut debugger, target, id) = examined(MockHart::rv32().halted());
    target
        .borrow_mut()
        .memory
        .load_words(RAM_BASE, &[INCREMENT_A0, INCREMENT_A0]);

    debugger.step(id, true, 0, false).unwrap();

    assert_eq!(debugger.target(id).unwrap().status(), CoreStatus::Halted(HaltReason::Step));
    assert_eq!(debugger.read_register(id, RegisterNumber::PC).unwrap(), RAM_BASE + 4);
    assert_eq!(debugger.read_register(id, RegisterNumber::A0).unwrap(), 1);
    // The step bit doesn't stick.
    assert_eq!(target.borrow().hart(0).dcsr & 1 << 2, 0);
}

#[test]
fn semihosting_call_is_handled_and_resumed() {
    let (mut debugger, target, id) = examined(MockHart::rv32().halted());
    let call = RAM_BASE + 0x100;
    target.borrow_mut().memory.load_words(
        call,
        &[
            assembly::SEMIHOSTING_PRE,
            EBREAK,
            assembly::SEMIHOSTING_POST,
            JUMP_TO_SELF,
        ],
    );

    let recorded = Rc::new(RefCell::new(Recorded::default()));
    debugger.set_hooks(Box::new(Recorder {
        recorded: recorded.clone(),
        result: 7,
    }));

    debugger.write_register(id, RegisterNumber::A0, 0x4).unwrap();
    debugger.write_register(id, RegisterNumber::A1, 0x1234).unwrap();
    debugger.resume(id, false, call, false, false).unwrap();

    assert_eq!(debugger.poll(id).unwrap(), CoreStatus::Running);

    assert_eq!(
        recorded.borrow().requests,
        vec![SemihostingRequest {
            operation: 0x4,
            parameter: 0x1234,
            pc: call + 4,
        }]
    );
    assert_eq!(target.borrow().hart(0).gpr(10), 7);
    assert_eq!(target.borrow().hart(0).pc, call + 12);

    // The host never saw the hart halt.
    assert!(!recorded
        .borrow()
        .events
        .contains(&(id, TargetEvent::Halted)));
}

#[test]
fn ordinary_ebreak_is_not_semihosting() {
    let (mut debugger, target, id) = examined(MockHart::rv32().halted());
    target.borrow_mut().memory.load_words(RAM_BASE, &[INCREMENT_A0, EBREAK]);

    let recorded = Rc::new(RefCell::new(Recorded::default()));
    debugger.set_hooks(Box::new(Recorder {
        recorded: recorded.clone(),
        result: 0,
    }));

    debugger.resume(id, true, 0, false, false).unwrap();
    assert_eq!(
        debugger.poll(id).unwrap(),
        CoreStatus::Halted(HaltReason::Breakpoint(BreakpointCause::Software))
    );

    assert!(recorded.borrow().requests.is_empty());
    assert_eq!(
        recorded.borrow().events.last(),
        Some(&(id, TargetEvent::Halted))
    );
}

#[test]
fn run_algorithm_restores_registers() {
    let mut hart = MockHart::rv32().halted();
    hart.pc = RAM_BASE + 0x40;
    hart.set_gpr(10, 0xaaaa);
    let (mut debugger, target, id) = examined(hart);

    let entry = RAM_BASE + 0x400;
    target.borrow_mut().memory.load_words(entry, &[ADD_A0_A1, JUMP_TO_SELF]);

    let mut parameters = [
        RegisterParameter {
            register: RegisterNumber::A0,
            value: 40,
            direction: ParameterDirection::InOut,
        },
        RegisterParameter::input(RegisterNumber::A1, 2),
    ];
    debugger
        .run_algorithm(id, &mut parameters, entry, entry + 4, Duration::from_secs(1))
        .unwrap();

    assert_eq!(parameters[0].value, 42);

    assert_eq!(debugger.read_register(id, RegisterNumber::A0).unwrap(), 0xaaaa);
    assert_eq!(debugger.read_register(id, RegisterNumber::PC).unwrap(), RAM_BASE + 0x40);
    // The exit breakpoint is gone.
    assert_eq!(target.borrow().memory.read_u32(entry + 4), Some(JUMP_TO_SELF));
}

#[test]
fn run_algorithm_on_a_running_hart() {
    let (mut debugger, _target, id) = examined(MockHart::rv32());

    assert!(matches!(
        debugger.run_algorithm(id, &mut [], RAM_BASE, RAM_BASE + 4, Duration::from_secs(1)),
        Err(RiscvError::TargetNotHalted)
    ));
}

fn two_harts(harts: [MockHart; 2]) -> (Debugger, Target, [TargetId; 2]) {
    two_harts_with(MockDebugModule::new(harts.to_vec()), DebugConfig::default())
}

fn two_harts_with(dm: MockDebugModule, config: DebugConfig) -> (Debugger, Target, [TargetId; 2]) {
    let (mut debugger, target) = connect_with(dm, config);
    let ids = [debugger.add_target(TAP, 0), debugger.add_target(TAP, 1)];
    for id in ids {
        debugger.examine(id).unwrap();
    }
    debugger.add_smp_group(&ids).unwrap();
    (debugger, target, ids)
}

#[test]
fn smp_group_halts_together() {
    let (mut debugger, target, ids) = two_harts([MockHart::rv32(), MockHart::rv32()]);

    debugger.halt(ids[0]).unwrap();

    for (index, id) in ids.into_iter().enumerate() {
        assert!(target.borrow().hart(index).halted);
        assert!(debugger.target(id).unwrap().status().is_halted());
    }
}

#[test]
fn smp_group_follows_a_breakpoint() {
    let mut first = MockHart::rv32().halted();
    first.pc = RAM_BASE + 0x200;
    let mut second = MockHart::rv32().halted();
    second.pc = RAM_BASE + 0x100;

    let (mut debugger, target, ids) = two_harts([first, second]);
    target.borrow_mut().memory.load_words(RAM_BASE + 0x200, &[JUMP_TO_SELF]);
    target.borrow_mut().memory.load_words(RAM_BASE + 0x100, &[EBREAK]);

    debugger.resume(ids[0], true, 0, false, false).unwrap();

    assert_eq!(debugger.poll(ids[0]).unwrap(), CoreStatus::Halted(HaltReason::Request));
    assert_eq!(
        debugger.target(ids[1]).unwrap().status(),
        CoreStatus::Halted(HaltReason::Breakpoint(BreakpointCause::Software))
    );
    assert!(target.borrow().hart(0).halted);
}

#[test]
fn hart_array_halt_skips_per_hart_work() {
    let (mut debugger, target, ids) = two_harts([MockHart::rv32(), MockHart::rv32()]);
    target.borrow_mut().commands.clear();

    debugger.halt(ids[0]).unwrap();

    assert!(target.borrow().harts.iter().all(|hart| hart.halted));
    for id in ids {
        assert_eq!(debugger.target(id).unwrap().status(), CoreStatus::Halted(HaltReason::Request));
    }
    // Neither dcsr nor any other register was touched.
    assert_eq!(target.borrow().commands, Vec::<u32>::new());
}

#[test_case(ResumeOrder::Normal, [0, 1]; "normal")]
#[test_case(ResumeOrder::Reversed, [1, 0]; "reversed")]
fn smp_resume_order(order: ResumeOrder, expected: [usize; 2]) {
    let mut dm = MockDebugModule::new(vec![MockHart::rv32().halted(), MockHart::rv32().halted()]);
    // Without the hart array mask every hart gets its own resume request.
    dm.hasel_supported = false;
    let config = DebugConfig {
        resume_order: order,
        ..DebugConfig::default()
    };
    let (mut debugger, target, ids) = two_harts_with(dm, config);

    let recorded = Rc::new(RefCell::new(Recorded::default()));
    debugger.set_hooks(Box::new(Recorder {
        recorded: recorded.clone(),
        result: 0,
    }));
    target.borrow_mut().resumed.clear();

    debugger.resume(ids[0], true, 0, false, false).unwrap();

    assert_eq!(target.borrow().resumed, expected.to_vec());
    let resumed: Vec<TargetId> = recorded
        .borrow()
        .events
        .iter()
        .filter(|(_, event)| *event == TargetEvent::Resumed)
        .map(|(id, _)| *id)
        .collect();
    assert_eq!(resumed, expected.map(|index| ids[index]).to_vec());
}

#[test]
fn smp_group_membership_is_exclusive() {
    let (mut debugger, _target, ids) = two_harts([MockHart::rv32(), MockHart::rv32()]);

    assert!(matches!(
        debugger.add_smp_group(&ids[..1]),
        Err(RiscvError::InvalidArgument(_))
    ));
}

#[test]
fn reset_and_halt() {
    let config = DebugConfig {
        reset_halt: true,
        ..DebugConfig::default()
    };
    let (mut debugger, target, id) =
        examined_with(MockDebugModule::new(vec![MockHart::rv32()]), config);
    target.borrow_mut().hart_mut(0).pc = RAM_BASE + 0x300;

    debugger.assert_reset(id, ResetKind::System).unwrap();
    assert_eq!(debugger.target(id).unwrap().status(), CoreStatus::Unknown);
    assert!(target.borrow().hart(0).in_reset);

    debugger.deassert_reset(id).unwrap();
    assert_eq!(debugger.target(id).unwrap().status(), CoreStatus::Halted(HaltReason::Request));

    let target = target.borrow();
    let hart = target.hart(0);
    assert!(hart.halted);
    assert!(!hart.in_reset);
    assert_eq!(hart.pc, hart.reset_pc);
    assert!([CAUSE_HALTREQ, CAUSE_RESETHALTREQ].contains(&hart.cause()));
}

#[test]
fn reset_and_run() {
    let (mut debugger, target, id) = examined(MockHart::rv32());

    debugger.assert_reset(id, ResetKind::System).unwrap();
    debugger.deassert_reset(id).unwrap();

    assert_eq!(debugger.target(id).unwrap().status(), CoreStatus::Running);
    assert!(!target.borrow().hart(0).halted);
}

#[test]
fn busy_dmi_grows_the_delay() {
    let (mut debugger, target, _id) = examined(MockHart::rv32());
    let before = debugger.session(TAP).unwrap().dtm_state().dmi_busy_delay();
    target.borrow_mut().dmi_busy = 2;

    // dmstatus
    let status = debugger.dmi_read(TAP, 0x11).unwrap();

    assert_eq!(status & 0xf, 3);
    assert!(debugger.session(TAP).unwrap().dtm_state().dmi_busy_delay() > before);
}

#[test]
fn authentication() {
    let mut dm = MockDebugModule::new(vec![MockHart::rv32()]);
    dm.authenticated = false;
    dm.auth_key = 0x600d_cafe;
    let (mut debugger, target) = connect(dm);
    debugger.add_target(TAP, 0);

    assert_eq!(debugger.authdata_read(TAP).unwrap(), 0xa5a5_0000);
    assert!(!debugger.authdata_write(TAP, 0xbad).unwrap());
    assert!(debugger.authdata_write(TAP, 0x600d_cafe).unwrap());
    assert!(target.borrow().authenticated);
}

#[test]
fn machine_mode_is_not_translated() {
    let (mut debugger, _target, id) = examined(MockHart::rv32().halted());

    assert!(!debugger.mmu(id).unwrap());
    assert_eq!(debugger.virt2phys(id, RAM_BASE + 0x10).unwrap(), RAM_BASE + 0x10);
}

/// A supervisor mode hart with one Sv32 mapping: 0x4000_0000 to `RAM_BASE + 0x3000`.
fn sv32_hart() -> MockDebugModule {
    let mut hart = MockHart::rv32().halted();
    hart.dcsr = hart.dcsr & !0x3 | 0x1;
    hart.csrs.insert(csr::SATP, 1 << 31 | (RAM_BASE + 0x1000) >> 12);

    let mut dm = MockDebugModule::new(vec![hart]);
    // Root table entry 0x100 points at the table at RAM_BASE + 0x2000.
    dm.memory
        .load_words(RAM_BASE + 0x1400, &[((RAM_BASE + 0x2000) >> 2) as u32 | 0x01]);
    // Leaf, readable and writable.
    dm.memory
        .load_words(RAM_BASE + 0x2000, &[((RAM_BASE + 0x3000) >> 2) as u32 | 0x07]);
    dm.memory.load_words(RAM_BASE + 0x3120, &[0x7777_0001, 0x7777_0002]);
    dm
}

#[test]
fn sv32_translation() {
    let (mut debugger, _target, id) = examined_with(sv32_hart(), DebugConfig::default());

    assert!(debugger.mmu(id).unwrap());
    assert_eq!(debugger.virt2phys(id, 0x4000_0123).unwrap(), RAM_BASE + 0x3123);

    let mut read = [0u8; 8];
    debugger.read_memory(id, 0x4000_0120, 4, 2, &mut read).unwrap();
    assert_eq!(read.to_vec(), words_to_bytes(&[0x7777_0001, 0x7777_0002]));
}

#[test]
fn unmapped_virtual_address() {
    let (mut debugger, _target, id) = examined_with(sv32_hart(), DebugConfig::default());

    let error = debugger.virt2phys(id, 0x4040_0000).unwrap_err();
    assert!(matches!(
        error,
        RiscvError::MemoryFault {
            kind: MemoryFaultKind::Translation,
            ..
        }
    ));
}

#[test]
fn physical_access_ignores_translation() {
    let (mut debugger, _target, id) = examined_with(sv32_hart(), DebugConfig::default());

    let mut read = [0u8; 4];
    debugger.read_phys_memory(id, RAM_BASE + 0x3120, 4, 1, &mut read).unwrap();
    assert_eq!(u32::from_le_bytes(read), 0x7777_0001);
}

/// A hart running virtualized in VS-mode.
///
/// The G-stage maps guest physical 0..4 MiB onto `RAM_BASE` with one superpage.
/// The VS-stage maps 0x0040_1000 to guest physical 0x6000.
fn two_stage_hart() -> MockDebugModule {
    let mut hart = MockHart::new(32, 1 << 30 | extensions("IMASUH")).halted();
    hart.dcsr = hart.dcsr & !0x3 | 1 << 5 | 0x1;
    hart.csrs.insert(csr::HGATP, 1 << 31 | RAM_BASE >> 12);
    hart.csrs.insert(csr::VSATP, 1 << 31 | 0x4);

    let mut dm = MockDebugModule::new(vec![hart]);
    // G-stage superpage, readable, writable and executable.
    dm.memory
        .load_words(RAM_BASE, &[(RAM_BASE >> 2) as u32 | 0x0f]);
    // VS-stage root at guest physical 0x4000, entry 1 points at 0x5000.
    dm.memory.load_words(RAM_BASE + 0x4004, &[0x5 << 10 | 0x01]);
    // Leaf at guest physical 0x5004, to 0x6000.
    dm.memory.load_words(RAM_BASE + 0x5004, &[0x6 << 10 | 0x07]);
    dm.memory.load_words(RAM_BASE + 0x6230, &[0x5151_0001, 0x5151_0002]);
    dm
}

#[test]
fn two_stage_translation() {
    let (mut debugger, _target, id) = examined_with(two_stage_hart(), DebugConfig::default());

    assert_eq!(debugger.read_register(id, RegisterNumber::PRIV).unwrap(), 0x5);
    assert!(debugger.mmu(id).unwrap());
    assert_eq!(debugger.virt2phys(id, 0x0040_1234).unwrap(), RAM_BASE + 0x6234);

    let mut read = [0u8; 8];
    debugger.read_memory(id, 0x0040_1230, 4, 2, &mut read).unwrap();
    assert_eq!(read.to_vec(), words_to_bytes(&[0x5151_0001, 0x5151_0002]));
}

#[test]
fn guest_address_outside_the_g_stage() {
    let (mut debugger, target, id) = examined_with(two_stage_hart(), DebugConfig::default());
    // Point the VS-stage leaf past the G-stage superpage.
    target
        .borrow_mut()
        .memory
        .load_words(RAM_BASE + 0x5004, &[0x40_0000 >> 2 | 0x07]);

    let error = debugger.virt2phys(id, 0x0040_1234).unwrap_err();
    assert!(matches!(
        error,
        RiscvError::MemoryFault {
            kind: MemoryFaultKind::Translation,
            ..
        }
    ));
}

fn manual_trigger_hart() -> MockHart {
    let trigger = MockTrigger {
        // icount, itrigger, etrigger and mcontrol
        tinfo: 1 << 3 | 1 << 4 | 1 << 5 | 1 << 2,
        match_kinds: 0b1111,
        tdata1: 0,
        tdata2: 0,
    };
    MockHart::rv32().halted().with_triggers(vec![trigger; 3])
}

#[test]
fn manual_triggers_are_set_once() {
    let (mut debugger, target, id) = examined(manual_trigger_hart());
    let icount = IcountTrigger {
        modes: TriggerModes {
            m: true,
            ..TriggerModes::default()
        },
        pending: false,
        count: 5,
    };

    debugger.set_icount(id, icount).unwrap();
    let tdata1 = target.borrow().hart(0).triggers[0].tdata1;
    assert_eq!(tdata1 >> 28, 3);
    assert_eq!((tdata1 >> 10) & 0x3fff, 5);

    // A second icount trigger is refused instead of taking another trigger.
    assert!(matches!(
        debugger.set_icount(id, icount),
        Err(RiscvError::ResourceUnavailable(_))
    ));
    assert_eq!(target.borrow().hart(0).triggers[1].tdata1, 0);

    // Other kinds have their own slot.
    let etrigger = Etrigger {
        modes: TriggerModes {
            m: true,
            ..TriggerModes::default()
        },
        exceptions: 1 << 2,
    };
    debugger.set_etrigger(id, etrigger).unwrap();
    assert_eq!(target.borrow().hart(0).triggers[1].tdata1 >> 28, 5);
    assert_eq!(target.borrow().hart(0).triggers[1].tdata2, 1 << 2);

    debugger.clear_icount(id).unwrap();
    assert_eq!(target.borrow().hart(0).triggers[0].tdata1, 0);
    assert!(matches!(
        debugger.clear_icount(id),
        Err(RiscvError::UnknownBreakpoint(-3))
    ));

    debugger.set_icount(id, icount).unwrap();
    debugger.clear_etrigger(id).unwrap();
    assert_eq!(target.borrow().hart(0).triggers[1].tdata1, 0);
}

#[test]
fn extension_letters() {
    assert_eq!(extensions("IMAC"), 1 << 8 | 1 << 12 | 1 | 1 << 2);
}
