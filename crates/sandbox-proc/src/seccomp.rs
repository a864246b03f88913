//! Seccomp-BPF filters for worker processes.
//!
//! The worker filter is installed between fork and exec and holds for the
//! life of the worker:
//!
//! 1. Verify the architecture (kill otherwise)
//! 2. Refuse x32 syscall numbers on `x86_64`
//! 3. Refuse a denylist of syscalls with `EPERM`
//! 4. `clone3` gets `ENOSYS` so libc falls back to `clone`
//! 5. `clone` is allowed for threads only: `CLONE_THREAD` set, no `CLONE_NEW*`
//! 6. `kill`, `tgkill` and `tkill` may only target the worker or its group
//! 7. Everything else is allowed
//!
//! The exec lock refuses `execve` and `execveat`. The harness installs it
//! once the interpreter is up, before any submitted code runs.
//!
//! Denials return `EPERM` rather than killing the process, so Python raises
//! `PermissionError` at the call site.

use std::io;

use libc::c_long;
use nix::sys::prctl;
use nix::unistd::Pid;

const SECCOMP_SET_MODE_FILTER: libc::c_uint = 1;
const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;
const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;

// BPF instruction classes
const BPF_LD: u16 = 0x00;
const BPF_JMP: u16 = 0x05;
const BPF_RET: u16 = 0x06;

// BPF ld/ldx fields
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;

// BPF jmp fields
const BPF_JA: u16 = 0x00;
const BPF_JEQ: u16 = 0x10;
#[cfg(target_arch = "x86_64")]
const BPF_JGE: u16 = 0x30;
const BPF_JSET: u16 = 0x40;
const BPF_K: u16 = 0x00;

// seccomp_data offsets; args are read as their low 32 bits
const OFFSET_SYSCALL_NR: u32 = 0;
const OFFSET_ARCH: u32 = 4;
const OFFSET_ARGS_0: u32 = 16;

#[cfg(target_arch = "x86_64")]
const AUDIT_ARCH: u32 = 0xc000_003e;
#[cfg(target_arch = "aarch64")]
const AUDIT_ARCH: u32 = 0xc000_00b7;
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("worker seccomp filters support x86_64 and aarch64 only");

#[cfg(target_arch = "x86_64")]
const X32_SYSCALL_BIT: u32 = 0x4000_0000;

const CLONE_THREAD: u32 = 0x0001_0000;
const CLONE_NEWNS: u32 = 0x0002_0000;
const CLONE_NEWCGROUP: u32 = 0x0200_0000;
const CLONE_NEWUTS: u32 = 0x0400_0000;
const CLONE_NEWIPC: u32 = 0x0800_0000;
const CLONE_NEWUSER: u32 = 0x1000_0000;
const CLONE_NEWPID: u32 = 0x2000_0000;
const CLONE_NEWNET: u32 = 0x4000_0000;

/// Clone flags that create a namespace.
const NAMESPACE_FLAGS: u32 = CLONE_NEWNS
    | CLONE_NEWCGROUP
    | CLONE_NEWUTS
    | CLONE_NEWIPC
    | CLONE_NEWUSER
    | CLONE_NEWPID
    | CLONE_NEWNET;

/// Syscalls a worker never gets.
const DENIED: &[c_long] = &[
    // network
    libc::SYS_socket,
    libc::SYS_connect,
    // fileless execution
    libc::SYS_execveat,
    libc::SYS_memfd_create,
    // other processes
    libc::SYS_ptrace,
    libc::SYS_process_vm_readv,
    libc::SYS_process_vm_writev,
    libc::SYS_pidfd_open,
    libc::SYS_pidfd_getfd,
    libc::SYS_pidfd_send_signal,
    libc::SYS_rt_sigqueueinfo,
    libc::SYS_rt_tgsigqueueinfo,
    // namespaces and mounts
    libc::SYS_setns,
    libc::SYS_unshare,
    libc::SYS_mount,
    libc::SYS_umount2,
    libc::SYS_pivot_root,
    libc::SYS_chroot,
    // kernel attack surface
    libc::SYS_keyctl,
    libc::SYS_add_key,
    libc::SYS_request_key,
    libc::SYS_bpf,
    libc::SYS_perf_event_open,
    libc::SYS_userfaultfd,
    libc::SYS_io_uring_setup,
    libc::SYS_io_uring_enter,
    libc::SYS_io_uring_register,
    libc::SYS_open_by_handle_at,
    // host administration
    libc::SYS_kexec_load,
    libc::SYS_init_module,
    libc::SYS_finit_module,
    libc::SYS_delete_module,
    libc::SYS_reboot,
    libc::SYS_swapon,
    libc::SYS_swapoff,
    libc::SYS_sethostname,
    libc::SYS_setdomainname,
    libc::SYS_settimeofday,
    libc::SYS_clock_settime,
    libc::SYS_adjtimex,
];

/// `fork` and `vfork` only exist as syscalls on `x86_64`; elsewhere libc
/// goes through `clone`.
#[cfg(target_arch = "x86_64")]
const DENIED_ARCH: &[c_long] = &[libc::SYS_fork, libc::SYS_vfork];
#[cfg(target_arch = "aarch64")]
const DENIED_ARCH: &[c_long] = &[];

// Jump offsets are u8.
const _: () = assert!(DENIED.len() + DENIED_ARCH.len() < 200);

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SockFilter {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

impl SockFilter {
    const fn stmt(code: u16, k: u32) -> Self {
        Self {
            code,
            jt: 0,
            jf: 0,
            k,
        }
    }

    const fn jump(code: u16, k: u32, jt: u8, jf: u8) -> Self {
        Self { code, jt, jf, k }
    }

    /// `[code, jt, jf, k]`, the form the harness reads from the job file.
    pub fn words(&self) -> [u32; 4] {
        [
            u32::from(self.code),
            u32::from(self.jt),
            u32::from(self.jf),
            self.k,
        ]
    }
}

/// Read by the kernel.
#[allow(dead_code)]
#[repr(C)]
struct SockFprog {
    len: u16,
    filter: *const SockFilter,
}

const fn load(offset: u32) -> SockFilter {
    SockFilter::stmt(BPF_LD | BPF_W | BPF_ABS, offset)
}

const fn ret(action: u32) -> SockFilter {
    SockFilter::stmt(BPF_RET | BPF_K, action)
}

const fn jeq(k: u32, jt: u8, jf: u8) -> SockFilter {
    SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, k, jt, jf)
}

const fn jset(k: u32, jt: u8, jf: u8) -> SockFilter {
    SockFilter::jump(BPF_JMP | BPF_JSET | BPF_K, k, jt, jf)
}

const fn errno(code: i32) -> u32 {
    SECCOMP_RET_ERRNO | (code as u32 & 0xffff)
}

const fn nr(syscall: c_long) -> u32 {
    syscall as u32
}

/// Whom a signal syscall may be aimed at.
#[derive(Debug, Clone, Copy)]
enum Target {
    /// `kill(0, ..)`: the caller's own process group.
    Zero,
    OwnPid,
    /// `kill(-pid, ..)`; workers lead their own group.
    OwnGroup,
}

/// The worker's seccomp program. The signal rules compare against the
/// worker's pid, which is only known in the child, so those slots are
/// filled in by [`WorkerFilter::install`].
#[derive(Debug, Clone)]
pub(crate) struct WorkerFilter {
    program: Vec<SockFilter>,
    own_pid: Vec<usize>,
    own_group: Vec<usize>,
}

impl WorkerFilter {
    pub fn new() -> Self {
        let mut filter = Self {
            program: Vec::with_capacity(DENIED.len() + DENIED_ARCH.len() + 32),
            own_pid: Vec::new(),
            own_group: Vec::new(),
        };
        filter.push_arch_check();
        filter.push_denylist();

        let program = &mut filter.program;
        program.push(jeq(nr(libc::SYS_clone3), 0, 1));
        program.push(ret(errno(libc::ENOSYS)));

        program.push(jeq(nr(libc::SYS_clone), 0, 5));
        program.push(load(OFFSET_ARGS_0));
        program.push(jset(NAMESPACE_FLAGS, 2, 0));
        program.push(jset(CLONE_THREAD, 0, 1));
        program.push(ret(SECCOMP_RET_ALLOW));
        program.push(ret(errno(libc::EPERM)));

        filter.push_signal_rule(
            libc::SYS_kill,
            &[Target::Zero, Target::OwnPid, Target::OwnGroup],
        );
        filter.push_signal_rule(libc::SYS_tgkill, &[Target::OwnPid]);
        filter.push_signal_rule(libc::SYS_tkill, &[Target::OwnPid]);

        filter.program.push(ret(SECCOMP_RET_ALLOW));
        filter
    }

    fn push_arch_check(&mut self) {
        self.program.push(load(OFFSET_ARCH));
        self.program.push(jeq(AUDIT_ARCH, 1, 0));
        self.program.push(ret(SECCOMP_RET_KILL_PROCESS));
        self.program.push(load(OFFSET_SYSCALL_NR));
        #[cfg(target_arch = "x86_64")]
        {
            self.program
                .push(SockFilter::jump(BPF_JMP | BPF_JGE | BPF_K, X32_SYSCALL_BIT, 0, 1));
            self.program.push(ret(errno(libc::EPERM)));
        }
    }

    /// One compare per denied syscall, all jumping to a shared `EPERM`.
    fn push_denylist(&mut self) {
        let denied: Vec<c_long> = DENIED.iter().chain(DENIED_ARCH).copied().collect();
        let n = denied.len();
        for (i, syscall) in denied.into_iter().enumerate() {
            self.program.push(jeq(nr(syscall), (n - i) as u8, 0));
        }
        self.program.push(SockFilter::stmt(BPF_JMP | BPF_JA, 1));
        self.program.push(ret(errno(libc::EPERM)));
    }

    /// `syscall` is allowed only when its first argument is one of `targets`.
    fn push_signal_rule(&mut self, syscall: c_long, targets: &[Target]) {
        let m = targets.len();
        self.program.push(jeq(nr(syscall), 0, (m + 3) as u8));
        self.program.push(load(OFFSET_ARGS_0));
        for (j, target) in targets.iter().enumerate() {
            let at = self.program.len();
            match target {
                Target::Zero => {}
                Target::OwnPid => self.own_pid.push(at),
                Target::OwnGroup => self.own_group.push(at),
            }
            self.program.push(jeq(0, (m - j) as u8, 0));
        }
        self.program.push(ret(errno(libc::EPERM)));
        self.program.push(ret(SECCOMP_RET_ALLOW));
    }

    /// Fill the pid slots. Writes in place, so it is safe between fork and exec.
    fn bind(&mut self, pid: Pid) {
        let pid = pid.as_raw();
        for &at in &self.own_pid {
            if let Some(ins) = self.program.get_mut(at) {
                ins.k = pid as u32;
            }
        }
        for &at in &self.own_group {
            if let Some(ins) = self.program.get_mut(at) {
                ins.k = pid.wrapping_neg() as u32;
            }
        }
    }

    /// Bind the filter to `pid` and install it on the calling thread.
    /// Irreversible. Only async-signal-safe calls are made.
    pub fn install(&mut self, pid: Pid) -> io::Result<()> {
        self.bind(pid);
        let len = u16::try_from(self.program.len())
            .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        let prog = SockFprog {
            len,
            filter: self.program.as_ptr(),
        };
        prctl::set_no_new_privs()?;
        // SAFETY: `prog` points at `len` valid instructions that outlive the call.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_seccomp,
                SECCOMP_SET_MODE_FILTER,
                0u32,
                &prog as *const SockFprog,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(test)]
    fn program(&self) -> &[SockFilter] {
        &self.program
    }
}

/// Program that refuses `execve` and `execveat`, stacked on top of the
/// worker filter by the harness.
pub(crate) fn exec_lock() -> Vec<SockFilter> {
    vec![
        load(OFFSET_ARCH),
        jeq(AUDIT_ARCH, 1, 0),
        ret(SECCOMP_RET_KILL_PROCESS),
        load(OFFSET_SYSCALL_NR),
        jeq(nr(libc::SYS_execve), 1, 0),
        jeq(nr(libc::SYS_execveat), 0, 1),
        ret(errno(libc::EPERM)),
        ret(SECCOMP_RET_ALLOW),
    ]
}
