//! Mach task-port tracer: `task_for_pid` to obtain the port,
//! `task_suspend`/`task_resume` around each capture, remote memory via
//! `mach_vm_read_overwrite` addressed by the same port.

use libc::{c_int, c_uint, kern_return_t, mach_port_t, pid_t};

use super::{PlatformTracer, TraceError, FP_RETURN_ADDRESS_OFFSET, MAX_STACK_DEPTH};
use crate::frames::Backtrace;
use crate::heap::{untag, HeapReader};
use crate::layout::V8Layout;
use crate::mem::{ProcessMemory, ReadFault};

const KERN_SUCCESS: kern_return_t = 0;

#[cfg(target_arch = "x86_64")]
const THREAD_STATE_FLAVOR: c_int = 4; // x86_THREAD_STATE64
#[cfg(target_arch = "aarch64")]
const THREAD_STATE_FLAVOR: c_int = 6; // ARM_THREAD_STATE64

extern "C" {
    static mach_task_self_: mach_port_t;

    fn task_for_pid(host: mach_port_t, pid: pid_t, task: *mut mach_port_t) -> kern_return_t;
    fn task_suspend(task: mach_port_t) -> kern_return_t;
    fn task_resume(task: mach_port_t) -> kern_return_t;
    fn task_threads(
        task: mach_port_t,
        threads: *mut *mut mach_port_t,
        count: *mut c_uint,
    ) -> kern_return_t;
    fn thread_get_state(
        thread: mach_port_t,
        flavor: c_int,
        state: *mut u64,
        count: *mut c_uint,
    ) -> kern_return_t;
    fn mach_vm_read_overwrite(
        task: mach_port_t,
        address: u64,
        size: u64,
        data: u64,
        out_size: *mut u64,
    ) -> kern_return_t;
    fn mach_port_deallocate(task: mach_port_t, name: mach_port_t) -> kern_return_t;
    fn vm_deallocate(task: mach_port_t, address: usize, size: usize) -> kern_return_t;
}

/// Task-port backed memory reader. Each read is an independent remote
/// read call; there is no persistent handle beyond the port itself.
pub struct TaskPortReader {
    port: mach_port_t,
}

impl TaskPortReader {
    fn read_into(&self, addr: u64, buf: &mut [u8]) -> Result<(), ReadFault> {
        let mut out_size = 0u64;
        let result = unsafe {
            mach_vm_read_overwrite(
                self.port,
                addr,
                buf.len() as u64,
                buf.as_mut_ptr() as u64,
                &mut out_size,
            )
        };
        if result != KERN_SUCCESS || out_size != buf.len() as u64 {
            return Err(ReadFault { address: addr });
        }
        Ok(())
    }
}

impl ProcessMemory for TaskPortReader {
    fn read_u8(&self, addr: u64) -> Result<u8, ReadFault> {
        if addr == 0 {
            return Ok(0);
        }
        let mut buf = [0u8; 1];
        self.read_into(addr, &mut buf)?;
        Ok(buf[0])
    }

    fn read_u16(&self, addr: u64) -> Result<u16, ReadFault> {
        if addr == 0 {
            return Ok(0);
        }
        let mut buf = [0u8; 2];
        self.read_into(addr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32(&self, addr: u64) -> Result<u32, ReadFault> {
        if addr == 0 {
            return Ok(0);
        }
        let mut buf = [0u8; 4];
        self.read_into(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }
}

pub struct MacTracer {
    layout: &'static V8Layout,
    pid: Option<u32>,
    port: Option<mach_port_t>,
    heap: Option<HeapReader<TaskPortReader>>,
}

impl MacTracer {
    pub fn new(layout: &'static V8Layout) -> Self {
        MacTracer {
            layout,
            pid: None,
            port: None,
            heap: None,
        }
    }

    /// Program counter and frame pointer of the target's first thread.
    fn thread_state(port: mach_port_t) -> Option<(u64, u64)> {
        let mut threads: *mut mach_port_t = std::ptr::null_mut();
        let mut thread_count: c_uint = 0;
        let result = unsafe { task_threads(port, &mut threads, &mut thread_count) };
        if result != KERN_SUCCESS || thread_count == 0 {
            return None;
        }

        // x86_THREAD_STATE64 is 21 u64s, ARM_THREAD_STATE64 is 34; one
        // buffer covers both flavors.
        let mut state = [0u64; 34];
        let mut count: c_uint = (state.len() * 2) as c_uint;
        let thread = unsafe { *threads };
        let result =
            unsafe { thread_get_state(thread, THREAD_STATE_FLAVOR, state.as_mut_ptr(), &mut count) };

        unsafe {
            vm_deallocate(
                mach_task_self_,
                threads as usize,
                thread_count as usize * std::mem::size_of::<mach_port_t>(),
            );
        }

        if result != KERN_SUCCESS {
            return None;
        }

        #[cfg(target_arch = "x86_64")]
        let (pc, fp) = (state[16], state[6]); // rip, rbp
        #[cfg(target_arch = "aarch64")]
        let (pc, fp) = (state[32], state[29]); // pc, x29

        Some((pc, fp))
    }

    fn capture(port: mach_port_t, mem: &TaskPortReader) -> Option<Vec<(u64, u64)>> {
        if unsafe { task_suspend(port) } != KERN_SUCCESS {
            return None;
        }

        let (mut pc, mut fp) = match Self::thread_state(port) {
            Some(state) => state,
            None => return None,
        };

        let mut pairs = Vec::with_capacity(32);
        while pairs.len() < MAX_STACK_DEPTH && fp != 0 {
            pairs.push((pc, fp));
            pc = mem
                .read_u64(untag(fp + FP_RETURN_ADDRESS_OFFSET))
                .map(untag)
                .unwrap_or(0);
            fp = mem.read_u64(untag(fp)).map(untag).unwrap_or(0);
        }

        Some(pairs)
    }

    fn resume(port: mach_port_t) {
        if unsafe { task_resume(port) } != KERN_SUCCESS {
            tracing::warn!("failed to resume task");
        }
    }
}

impl PlatformTracer for MacTracer {
    fn attach(&mut self, pid: u32) -> Result<(), TraceError> {
        let mut port: mach_port_t = 0;
        let result = unsafe { task_for_pid(mach_task_self_, pid as pid_t, &mut port) };
        if result != KERN_SUCCESS {
            return Err(TraceError::Attach {
                pid,
                reason: format!("task_for_pid failed ({})", result),
            });
        }

        self.pid = Some(pid);
        self.port = Some(port);
        self.heap = Some(HeapReader::new(TaskPortReader { port }, self.layout));
        tracing::info!(pid, "attached");
        Ok(())
    }

    fn backtrace(&mut self) -> Option<Backtrace> {
        let port = self.port?;
        let heap = self.heap.as_ref()?;

        let pairs = match Self::capture(port, &TaskPortReader { port }) {
            Some(pairs) => pairs,
            None => {
                tracing::trace!("stack capture failed, skipping tick");
                Self::resume(port);
                return None;
            }
        };

        let frames = pairs
            .into_iter()
            .filter_map(|(pc, fp)| heap.annotate_frame(pc, fp))
            .collect();

        Self::resume(port);
        Some(Backtrace::new(frames))
    }

    fn detach(&mut self) -> Result<(), TraceError> {
        let pid = self.pid.take().ok_or(TraceError::NotAttached)?;
        let port = self.port.take().ok_or(TraceError::NotAttached)?;
        self.heap = None;

        let result = unsafe { mach_port_deallocate(mach_task_self_, port) };
        if result != KERN_SUCCESS {
            return Err(TraceError::Detach {
                pid,
                reason: format!("mach_port_deallocate failed ({})", result),
            });
        }

        tracing::info!(pid, "detached");
        Ok(())
    }
}
