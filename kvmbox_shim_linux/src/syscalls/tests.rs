// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::ffi::CString;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;

use kvmbox::platform::mock::{MockHypervisor, ScriptedExit};
use kvmbox::platform::VmExit;
use kvmbox::vcpu::Hypercall;
use kvmbox_common_linux::errno::Errno;
use kvmbox_common_linux::signal::{SigAction, Signal};

use crate::loader::elf::tests::make_test_elf;
use crate::run::Flow;
use crate::{SyscallHandlers, Vm, VmOptions};

const TEXT: &[u8] = b"\x48\xc7\xc0\x01\x00\x00\x00\x0f\x05";
const DATA: &[u8] = b"hi\n and the rest of the data segment";
const DATA_VADDR: u64 = 0x60_0000;

fn fixture_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("kvmbox-{}-{}", name, std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Tests that drive the run loop or the process-wide signal queue take
/// this lock so they cannot steal each other's pending signals.
static QUEUE_LOCK: Mutex<()> = Mutex::new(());

fn queue_guard() -> std::sync::MutexGuard<'static, ()> {
    QUEUE_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

fn build_vm(name: &str, handlers: SyscallHandlers) -> (MockHypervisor, Vm<MockHypervisor>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = fixture_dir(name);
    let binary = dir.join("fixture.elf");
    std::fs::write(&binary, make_test_elf(TEXT, DATA, 0x100)).unwrap();
    let isr = dir.join("isr");
    std::fs::write(&isr, vec![0x90u8; 48 * 9]).unwrap();
    let entry = dir.join("entry");
    std::fs::write(&entry, vec![0x90u8; 64]).unwrap();
    let cleanup = dir.join("signal-cleanup");
    std::fs::write(&cleanup, vec![0x90u8; 16]).unwrap();

    let mut opts = VmOptions::new(binary);
    opts.argv = vec![CString::new("fixture").unwrap()];
    opts.envp = vec![CString::new("PATH=/bin").unwrap()];
    opts.isr_path = isr;
    opts.entry_path = entry;
    opts.sighandler_cleanup_path = cleanup;

    let hv = MockHypervisor::new();
    let vm = Vm::new(&hv, &opts, handlers).unwrap();
    (hv, vm)
}

/// Stage a syscall the way the entry trampoline would: arguments in
/// registers, the hypercall tag on the guest stack.
fn stage_syscall(vm: &mut Vm<MockHypervisor>, rax: u64, args: [u64; 3]) {
    vm.vcpu_mut().regs.rax = rax;
    vm.vcpu_mut().regs.rdi = args[0];
    vm.vcpu_mut().regs.rsi = args[1];
    vm.vcpu_mut().regs.rdx = args[2];
    vm.push_guest(Hypercall::Syscall as u64).unwrap();
    vm.vcpu_mut().flush().unwrap();
}

fn h_write_len(_fd: i32, buf: &[u8]) -> i64 {
    buf.len() as i64
}

#[test]
fn write_syscall_is_marshaled_and_answered() {
    let handlers = SyscallHandlers {
        write: Some(h_write_len),
        ..Default::default()
    };
    let (_hv, mut vm) = build_vm("write", handlers);

    stage_syscall(&mut vm, 1, [1, DATA_VADDR, 3]);
    let flow = vm.dispatch_exit(VmExit::Hlt).unwrap();
    assert_eq!(flow, Flow::Resume);
    assert_eq!(vm.vcpu_mut().regs.rax, 3);
}

#[test]
fn missing_handler_yields_enosys() {
    let (_hv, mut vm) = build_vm("enosys", SyscallHandlers::default());

    // No read handler installed.
    stage_syscall(&mut vm, 0, [0, DATA_VADDR, 1]);
    vm.dispatch_exit(VmExit::Hlt).unwrap();
    assert_eq!(vm.vcpu_mut().regs.rax, Errno::ENOSYS.as_neg() as u64);

    // A number with no table entry at all.
    stage_syscall(&mut vm, 250, [0, 0, 0]);
    vm.dispatch_exit(VmExit::Hlt).unwrap();
    assert_eq!(vm.vcpu_mut().regs.rax, Errno::ENOSYS.as_neg() as u64);
}

#[test]
fn brk_syscall_reports_and_moves_the_break() {
    let (_hv, mut vm) = build_vm("brk", SyscallHandlers::default());

    stage_syscall(&mut vm, 12, [0, 0, 0]);
    vm.dispatch_exit(VmExit::Hlt).unwrap();
    let brk = vm.vcpu_mut().regs.rax;
    assert_eq!(brk, 0x60_1000, "initial break follows the data image");

    stage_syscall(&mut vm, 12, [brk + 0x2000, 0, 0]);
    vm.dispatch_exit(VmExit::Hlt).unwrap();
    assert_eq!(vm.vcpu_mut().regs.rax, brk + 0x2000);
    assert!(vm.region_manager().pager().get_host_p(brk).is_some());
}

#[test]
fn mmap_and_munmap_through_the_dispatcher() {
    let (_hv, mut vm) = build_vm("mmap", SyscallHandlers::default());

    // mmap(NULL, 0x3000, RW, ANON|PRIVATE, -1, 0)
    vm.vcpu_mut().regs.r10 = 0x22; // MAP_ANONYMOUS | MAP_PRIVATE
    vm.vcpu_mut().regs.r8 = (-1i64) as u64;
    vm.vcpu_mut().regs.r9 = 0;
    stage_syscall(&mut vm, 9, [0, 0x3000, 0x3]);
    vm.dispatch_exit(VmExit::Hlt).unwrap();
    let g = vm.vcpu_mut().regs.rax;
    assert!((g as i64) > 0);
    assert!(vm.address_mapped(g));

    // munmap(g + 0x1000, 0x1000) leaves the outer pages.
    stage_syscall(&mut vm, 11, [g + 0x1000, 0x1000, 0]);
    vm.dispatch_exit(VmExit::Hlt).unwrap();
    assert_eq!(vm.vcpu_mut().regs.rax, 0);
    assert!(vm.region_manager().pager().get_host_p(g).is_some());
    assert!(vm.region_manager().pager().get_host_p(g + 0x1000).is_none());
    assert!(vm.region_manager().pager().get_host_p(g + 0x2000).is_some());
}

static HELLO_OUT: Mutex<Vec<u8>> = Mutex::new(Vec::new());
static HELLO_STATUS: AtomicI32 = AtomicI32::new(-1);

fn h_write_capture(_fd: i32, buf: &[u8]) -> i64 {
    HELLO_OUT.lock().unwrap().extend_from_slice(buf);
    buf.len() as i64
}

fn h_exit_group(status: i32) {
    HELLO_STATUS.store(status, Ordering::SeqCst);
}

/// The static hello-world scenario: one `write(1, "hi\n", 3)`, then
/// `exit_group(0)`, driven through the full run loop with scripted
/// exits.
#[test]
fn hello_world_run_loop() {
    let _guard = queue_guard();
    let handlers = SyscallHandlers {
        write: Some(h_write_capture),
        exit_group: Some(h_exit_group),
        ..Default::default()
    };
    let (hv, mut vm) = build_vm("hello", handlers);
    assert_eq!(vm.entry_point(), 0x40_1000);

    // Stage a stack slot holding the SYSCALL tag; both quanta reuse it.
    vm.vcpu_mut().fetch().unwrap();
    let rsp0 = vm.vcpu_mut().regs.rsp;
    vm.push_guest(Hypercall::Syscall as u64).unwrap();
    let tag_slot = vm.vcpu_mut().regs.rsp;
    vm.vcpu_mut().regs.rsp = rsp0;
    vm.vcpu_mut().flush().unwrap();

    let base = hv.vcpu_handle().regs();
    let mut write_regs = base;
    write_regs.rsp = tag_slot;
    write_regs.rax = 1;
    write_regs.rdi = 1;
    write_regs.rsi = DATA_VADDR;
    write_regs.rdx = 3;
    hv.vcpu_handle().push_exit(ScriptedExit {
        regs: Some(write_regs),
        exit: VmExit::Hlt,
    });

    let mut exit_regs = base;
    exit_regs.rsp = tag_slot;
    exit_regs.rax = 231;
    exit_regs.rdi = 0;
    hv.vcpu_handle().push_exit(ScriptedExit {
        regs: Some(exit_regs),
        exit: VmExit::Hlt,
    });

    let status = vm.run().unwrap();
    assert_eq!(status, 0);
    assert_eq!(HELLO_STATUS.load(Ordering::SeqCst), 0);
    assert_eq!(HELLO_OUT.lock().unwrap().as_slice(), b"hi\n");
}

#[test]
fn guest_fault_ends_the_run_loop() {
    let _guard = queue_guard();
    let (hv, mut vm) = build_vm("fault", SyscallHandlers::default());
    hv.vcpu_handle().push_exit(ScriptedExit {
        regs: None,
        exit: VmExit::Shutdown,
    });
    assert!(matches!(
        vm.run(),
        Err(crate::run::RunError::GuestFatal(_))
    ));
}

#[test]
fn signal_delivery_and_cleanup_round_trip() {
    let _guard = queue_guard();
    let (_hv, mut vm) = build_vm("signal", SyscallHandlers::default());

    let handler_addr = 0x40_1000u64;
    vm.signals
        .register_action(
            Signal::SIGUSR1,
            Some(SigAction {
                sa_handler: handler_addr,
                ..Default::default()
            }),
        )
        .unwrap();

    vm.vcpu_mut().fetch().unwrap();
    let orig_rip = vm.vcpu_mut().regs.rip;
    let orig_rsp = vm.vcpu_mut().regs.rsp;

    kvmbox::signal::inject_pending(Signal::SIGUSR1.as_i32());
    vm.deliver_pending_signal().unwrap();
    assert!(vm.signals.handler_active());
    assert_eq!(vm.vcpu_mut().regs.rip, handler_addr);
    assert_eq!(vm.vcpu_mut().regs.rdi, Signal::SIGUSR1.as_i32() as u64);
    // A second pending signal must wait for the handler to finish.
    kvmbox::signal::inject_pending(Signal::SIGUSR1.as_i32());
    let staged_rip = vm.vcpu_mut().regs.rip;
    vm.deliver_pending_signal().unwrap();
    assert_eq!(vm.vcpu_mut().regs.rip, staged_rip);

    // The cleanup trampoline reports back with an ExitHandler hypercall.
    vm.push_guest(Hypercall::ExitHandler as u64).unwrap();
    vm.vcpu_mut().flush().unwrap();
    vm.dispatch_exit(VmExit::Hlt).unwrap();
    assert!(!vm.signals.handler_active());
    assert_eq!(vm.vcpu_mut().regs.rip, orig_rip);
    assert_eq!(vm.vcpu_mut().regs.rsp, orig_rsp);

    // Drain the still-pending second signal.
    while kvmbox::signal::next_pending().is_some() {}
}
