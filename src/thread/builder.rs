use super::handle::{KthreadContext, ThreadHandle};
use crate::errors::ThreadResult;
use crate::kernel::Kernel;
use crate::process::Process;
use crate::sched::{CpuId, CpuSet, SchedParam, SchedPolicy};

extern crate alloc;
use alloc::string::String;
use alloc::sync::Arc;

/// Longest accepted thread name, in bytes.
pub const MAX_NAME_LEN: usize = 31;

/// Creation attributes of a thread.
#[derive(Debug, Clone)]
pub struct ThreadAttrs {
    pub name: String,
    pub param: SchedParam,
    /// Initial CPU; the first CPU of `affinity` when unset
    pub cpu: Option<CpuId>,
    pub affinity: CpuSet,
    /// Backed by a user-mode host task
    pub user: bool,
    pub process: Option<Arc<Process>>,
}

impl Default for ThreadAttrs {
    fn default() -> Self {
        Self {
            name: String::from("thread"),
            param: SchedParam::default(),
            cpu: None,
            affinity: CpuSet::all(),
            user: false,
            process: None,
        }
    }
}

pub struct ThreadBuilder {
    attrs: ThreadAttrs,
}

impl ThreadBuilder {
    pub fn new() -> Self {
        Self {
            attrs: ThreadAttrs::default(),
        }
    }

    pub fn name<T: Into<String>>(mut self, name: T) -> Self {
        self.attrs.name = name.into();
        self
    }

    pub fn param(mut self, param: SchedParam) -> Self {
        self.attrs.param = param;
        self
    }

    pub fn cpu(mut self, cpu: CpuId) -> Self {
        self.attrs.cpu = Some(cpu);
        self
    }

    pub fn affinity(mut self, affinity: CpuSet) -> Self {
        self.attrs.affinity = affinity;
        self
    }

    pub fn user(mut self, user: bool) -> Self {
        self.attrs.user = user;
        self
    }

    pub fn process(mut self, process: Arc<Process>) -> Self {
        self.attrs.process = Some(process);
        self
    }

    pub fn build(self) -> ThreadAttrs {
        self.attrs
    }

    /// Create and start a kernel thread running `body` out-of-band.
    pub fn spawn<S, F>(self, kernel: &Arc<Kernel<S>>, body: F) -> ThreadResult<ThreadHandle<S>>
    where
        S: SchedPolicy,
        F: FnOnce(&KthreadContext<S>) -> ThreadResult<()> + Send + 'static,
    {
        kernel.run_kthread(self.attrs, body)
    }
}

impl Default for ThreadBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let attrs = ThreadBuilder::new().build();
        assert_eq!(attrs.name, "thread");
        assert_eq!(attrs.param, SchedParam::default());
        assert_eq!(attrs.affinity, CpuSet::all());
        assert!(attrs.cpu.is_none());
        assert!(!attrs.user);
    }

    #[test]
    fn test_builder_overrides() {
        let process = Process::new("app");
        let attrs = ThreadBuilder::new()
            .name("worker")
            .param(SchedParam::fifo(70))
            .cpu(1)
            .affinity(CpuSet::from_bits(0b10))
            .user(true)
            .process(process.clone())
            .build();
        assert_eq!(attrs.name, "worker");
        assert_eq!(attrs.cpu, Some(1));
        assert!(attrs.user);
        assert!(attrs.process.is_some_and(|p| Arc::ptr_eq(&p, &process)));
    }
}
