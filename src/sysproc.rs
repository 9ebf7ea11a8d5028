//! The syscalls exposed to userland: `fork`, `exit`, `wait`, `kill`,
//! `signal`, `sigprocmask`, `sigret`, `sbrk`, plus `getpid`.

use crate::proc;
use crate::syscall::{argaddr, argint};

pub fn sys_fork() -> isize {
    match proc::fork() {
        Ok(pid) => pid as isize,
        Err(_) => -1,
    }
}

pub fn sys_exit() -> ! {
    proc::exit()
}

pub fn sys_wait() -> isize {
    match proc::wait() {
        Ok(pid) => pid as isize,
        Err(_) => -1,
    }
}

pub fn sys_getpid() -> isize {
    proc::myproc().expect("sys_getpid: no current process").pid() as isize
}

pub fn sys_sbrk() -> isize {
    let n = argint(0);
    let p = proc::myproc().expect("sys_sbrk: no current process");
    let old = p.mem_size();
    match proc::growproc(n as isize) {
        Ok(()) => old as isize,
        Err(_) => -1,
    }
}

pub fn sys_kill() -> isize {
    let pid = argint(0);
    let signum = argint(1);
    if signum < 0 {
        return -1;
    }
    match proc::kill(pid, signum as u32) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

pub fn sys_signal() -> isize {
    let signum = argint(0);
    let handler = argaddr(1);
    if signum < 0 {
        return -2;
    }
    match proc::signal(signum as u32, handler) {
        Ok(prev) => prev as isize,
        Err(_) => -2,
    }
}

pub fn sys_sigprocmask() -> isize {
    let mask = argint(0) as u32;
    proc::sigprocmask(mask) as isize
}

/// Restores the caller's saved context. Its own return value is never
/// written back: the trap frame it restores, `a0` included, must be left
/// untouched by the syscall dispatch path.
pub fn sys_sigret() {
    proc::sigret();
}
