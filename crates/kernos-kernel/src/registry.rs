//! [`KernelRegistry`] – declarative catalog of kernels and their dependency
//! edges.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use kernos_types::KernosError;

use crate::handle::KernelHandle;

/// Restart budget used when a descriptor does not set one.
pub const DEFAULT_MAX_RESTARTS: u32 = 3;

/// Static description of one kernel.
#[derive(Clone)]
pub struct KernelDescriptor {
    pub id: String,
    /// Watchdog partition and in-batch ordering key.
    pub tier: u32,
    /// Ids of kernels that must be running before this one starts.
    pub dependencies: BTreeSet<String>,
    /// A start failure degrades this kernel instead of aborting the boot.
    pub can_fail: bool,
    pub max_restarts: u32,
    /// Overrides the orchestrator-wide ready timeout.
    pub ready_timeout: Option<Duration>,
    pub handle: Arc<dyn KernelHandle>,
}

impl KernelDescriptor {
    /// A tier-0, dependency-free, required kernel with the default restart
    /// budget.
    pub fn new(id: impl Into<String>, handle: Arc<dyn KernelHandle>) -> Self {
        Self {
            id: id.into(),
            tier: 0,
            dependencies: BTreeSet::new(),
            can_fail: false,
            max_restarts: DEFAULT_MAX_RESTARTS,
            ready_timeout: None,
            handle,
        }
    }

    pub fn tier(mut self, tier: u32) -> Self {
        self.tier = tier;
        self
    }

    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.insert(dependency.into());
        self
    }

    pub fn can_fail(mut self, can_fail: bool) -> Self {
        self.can_fail = can_fail;
        self
    }

    pub fn max_restarts(mut self, max_restarts: u32) -> Self {
        self.max_restarts = max_restarts;
        self
    }

    pub fn ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = Some(timeout);
        self
    }
}

impl fmt::Debug for KernelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelDescriptor")
            .field("id", &self.id)
            .field("tier", &self.tier)
            .field("dependencies", &self.dependencies)
            .field("can_fail", &self.can_fail)
            .field("max_restarts", &self.max_restarts)
            .field("ready_timeout", &self.ready_timeout)
            .finish_non_exhaustive()
    }
}

/// Catalog of every kernel the orchestrator manages, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct KernelRegistry {
    kernels: BTreeMap<String, KernelDescriptor>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a kernel.
    ///
    /// # Errors
    ///
    /// [`KernosError::DuplicateKernel`] when the id is already taken.
    pub fn register(&mut self, descriptor: KernelDescriptor) -> Result<(), KernosError> {
        if self.kernels.contains_key(&descriptor.id) {
            return Err(KernosError::DuplicateKernel(descriptor.id));
        }
        self.kernels.insert(descriptor.id.clone(), descriptor);
        Ok(())
    }

    /// Check that every dependency edge points at a registered kernel.
    pub fn validate(&self) -> Result<(), KernosError> {
        for kernel in self.kernels.values() {
            if let Some(missing) = kernel
                .dependencies
                .iter()
                .find(|d| !self.kernels.contains_key(*d))
            {
                return Err(KernosError::UnknownDependency {
                    kernel: kernel.id.clone(),
                    dependency: missing.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&KernelDescriptor> {
        self.kernels.get(id)
    }

    /// Like [`get`](Self::get) but returns [`KernosError::UnknownKernel`].
    pub fn require(&self, id: &str) -> Result<&KernelDescriptor, KernosError> {
        self.get(id)
            .ok_or_else(|| KernosError::UnknownKernel(id.to_string()))
    }

    /// Descriptors in id order.
    pub fn iter(&self) -> impl Iterator<Item = &KernelDescriptor> {
        self.kernels.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.kernels.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }

    /// Every declared tier, ascending.
    pub fn tiers(&self) -> BTreeSet<u32> {
        self.kernels.values().map(|k| k.tier).collect()
    }

    /// Descriptors belonging to `tier`, in id order.
    pub fn in_tier(&self, tier: u32) -> Vec<&KernelDescriptor> {
        self.kernels.values().filter(|k| k.tier == tier).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::KernelContext;
    use async_trait::async_trait;

    struct Inert;

    #[async_trait]
    impl KernelHandle for Inert {
        async fn start(&self, ctx: KernelContext) -> Result<(), KernosError> {
            ctx.report_ready();
            Ok(())
        }
        async fn stop(&self, _grace: Duration) -> Result<(), KernosError> {
            Ok(())
        }
    }

    fn kernel(id: &str) -> KernelDescriptor {
        KernelDescriptor::new(id, Arc::new(Inert))
    }

    #[test]
    fn defaults_are_conservative() {
        let k = kernel("memory");
        assert_eq!(k.tier, 0);
        assert!(!k.can_fail);
        assert_eq!(k.max_restarts, DEFAULT_MAX_RESTARTS);
        assert!(k.dependencies.is_empty());
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let mut reg = KernelRegistry::new();
        reg.register(kernel("memory")).unwrap();
        let err = reg.register(kernel("memory")).unwrap_err();
        assert_eq!(err, KernosError::DuplicateKernel("memory".into()));
    }

    #[test]
    fn unknown_dependency_fails_validation() {
        let mut reg = KernelRegistry::new();
        reg.register(kernel("chat").depends_on("memory")).unwrap();
        assert!(matches!(
            reg.validate(),
            Err(KernosError::UnknownDependency { ref dependency, .. }) if dependency == "memory"
        ));

        reg.register(kernel("memory")).unwrap();
        assert!(reg.validate().is_ok());
    }

    #[test]
    fn tiers_partition_kernels() {
        let mut reg = KernelRegistry::new();
        reg.register(kernel("a")).unwrap();
        reg.register(kernel("b").tier(1)).unwrap();
        reg.register(kernel("c").tier(1)).unwrap();

        assert_eq!(reg.tiers().into_iter().collect::<Vec<_>>(), vec![0, 1]);
        let ids: Vec<_> = reg.in_tier(1).iter().map(|k| k.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert!(reg.require("zzz").is_err());
    }

    #[test]
    fn debug_omits_handle() {
        let dbg = format!("{:?}", kernel("memory").can_fail(true));
        assert!(dbg.contains("can_fail: true"));
        assert!(dbg.contains(".."));
    }
}
